//! The user-supplied image template.

use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};

use crate::errors::{Error, Result};

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct ImageTemplate {
	pub image: ImageMeta,
	pub target: Target,
	pub system_config: SystemConfig,

	/// Filled in by the orchestrator after the OS config is loaded
	#[serde(default, skip)]
	pub essential_pkg_list: Vec<String>,
	/// Filled in by the orchestrator after resolution
	#[serde(default, skip)]
	pub kernel_pkg_list: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct ImageMeta {
	pub name: String,
	pub version: String,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Target {
	pub os: String,
	pub dist: String,
	pub arch: String,
	pub image_type: ImageType,
}

impl Target {
	/// `<os>-<dist>-<arch>`, the key everything on disk is filed under.
	#[must_use]
	pub fn provider_id(&self) -> String {
		format!("{}-{}-{}", self.os, self.dist, self.arch)
	}
}

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageType {
	Iso,
	Raw,
	Qcow2,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct SystemConfig {
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub description: String,
	/// Requested closure seed
	#[serde(default)]
	pub packages: Vec<String>,
	pub bootloader: BootloaderCfg,
	#[serde(default)]
	pub kernel: KernelCfg,
	#[serde(default)]
	pub hook_scripts: Vec<HookScript>,
	#[serde(default)]
	pub disk: Option<DiskCfg>,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct BootloaderCfg {
	pub provider: BootloaderKind,
	pub boot_type: BootType,
}

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootloaderKind {
	Grub,
	SystemdBoot,
}

#[derive(Deserialize, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
	Efi,
	Legacy,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct KernelCfg {
	#[serde(default)]
	pub packages: Vec<String>,
}

/// A post-rootfs hook: copied from the build host into the image, made
/// executable, then run with `TARGET_ROOTFS` pointing at the install
/// root.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HookScript {
	pub local_post_rootfs: PathBuf,
	pub target_post_rootfs: PathBuf,
}

#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct DiskCfg {
	#[serde(default)]
	pub partitions: Vec<Partition>,
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct Partition {
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(rename = "type", default)]
	pub part_type: String,
	#[serde(default)]
	pub size: Option<String>,
	#[serde(default)]
	pub filesystem: Option<String>,
	#[serde(default)]
	pub mountpoint: Option<String>,
	#[serde(default)]
	pub mount_options: Option<String>,
}

impl Partition {
	#[must_use]
	pub fn is_root(&self) -> bool {
		self.part_type == "root"
			|| self.id == "root"
			|| self.mountpoint.as_deref() == Some("/")
	}
}

impl DiskCfg {
	/// The root partition, when one is declared.
	#[must_use]
	pub fn root_partition(&self) -> Option<&Partition> {
		self.partitions.iter().find(|p| p.is_root())
	}

	/// Whether the root filesystem is to be mounted read-only.
	#[must_use]
	pub fn immutable_root(&self) -> bool {
		self.root_partition()
			.and_then(|p| p.mount_options.as_deref())
			.is_some_and(|opts| opts.split(',').any(|o| o.trim() == "ro"))
	}
}

impl ImageTemplate {
	/// Load a template, canonicalizing hook-script sources relative to
	/// the template file's directory.
	///
	/// # Errors
	/// `ConfigError` on read, parse or path failures.
	pub fn load(path: &Path) -> Result<Self> {
		let mut template: Self = super::load_yaml(path)?;

		let mut base = path
			.canonicalize()
			.map_err(|e| Error::Config(format!("cannot canonicalize {}: {e}", path.display())))?;
		base.pop();

		for hook in &mut template.system_config.hook_scripts {
			if hook.local_post_rootfs.is_relative() {
				let resolved = base.join(&hook.local_post_rootfs);
				let resolved = resolved.canonicalize().map_err(|e| {
					Error::Config(format!(
						"hook script {} not found: {e}",
						hook.local_post_rootfs.display()
					))
				})?;
				hook.local_post_rootfs = resolved;
			}
		}
		Ok(template)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const TEMPLATE: &str = "\
image:
  name: edge-base
  version: \"3.0\"
target:
  os: elxr
  dist: \"12\"
  arch: amd64
  image_type: iso
system_config:
  name: edge base system
  packages: [systemd, openssh-server]
  bootloader:
    provider: systemd-boot
    boot_type: efi
  kernel:
    packages: [linux-image-amd64]
  disk:
    partitions:
      - id: esp
        name: EFI
        type: efi
        filesystem: vfat
        mountpoint: /boot/efi
      - id: root
        name: ROOT
        type: root
        filesystem: ext4
        mountpoint: /
        mount_options: ro
";

	#[test]
	fn template_parses_and_detects_immutable_root() {
		let template: ImageTemplate = serde_yaml::from_str(TEMPLATE).unwrap();
		assert_eq!(template.target.provider_id(), "elxr-12-amd64");
		assert_eq!(template.target.image_type, ImageType::Iso);
		assert_eq!(template.system_config.bootloader.provider, BootloaderKind::SystemdBoot);
		let disk = template.system_config.disk.as_ref().unwrap();
		assert!(disk.immutable_root());
	}

	#[test]
	fn rw_root_is_not_immutable() {
		let mut template: ImageTemplate = serde_yaml::from_str(TEMPLATE).unwrap();
		if let Some(disk) = template.system_config.disk.as_mut() {
			disk.partitions[1].mount_options = Some("defaults,rw".into());
		}
		assert!(!template.system_config.disk.unwrap().immutable_root());
	}

	#[test]
	fn unknown_image_type_is_rejected() {
		let bad = TEMPLATE.replace("image_type: iso", "image_type: vhd");
		let res: std::result::Result<ImageTemplate, _> = serde_yaml::from_str(&bad);
		assert!(res.is_err());
	}
}
