//! Image-level post-configuration: the immutable-rootfs overlay scheme,
//! fstab entries and user-supplied post-rootfs hooks.
//!
//! Runs against an install root an outer packaging stage has produced
//! and mounted. When the declared root partition is read-only, `/etc`
//! gets an overlayfs with a writable upper on persistent storage and
//! `/var` + `/home` move to bind mounts under `/opt`.

use std::{
	os::unix::fs::PermissionsExt,
	path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
	cfg::{DiskCfg, ImageTemplate, Partition},
	errors::{Error, IoResultExt, Result, ResultExt},
	exec::{ExecOpts, Shell},
	util::{just_append, just_write},
};

const OVERLAY_DIRS: &[&str] =
	&["opt/overlay/etc/upper", "opt/overlay/etc/work", "ro/etc", "opt/var", "opt/home"];

const FSTAB_OVERLAY_ENTRIES: &str = "\
/opt/var /var none bind 0 0
/opt/home /home none bind 0 0
tmpfs /tmp tmpfs mode=1777,nosuid,nodev 0 0
tmpfs /run tmpfs mode=0755,nosuid,nodev 0 0
";

const SETUP_OVERLAY_SCRIPT: &str = "\
#!/bin/sh
# Mounted by setup-overlay.service before multi-user targets come up.
set -e
mount --bind /etc {{ lower }}
mount -t overlay overlay -o lowerdir={{ lower }},upperdir={{ upper }},workdir={{ work }} /etc
mount --bind /opt/var /var
mount --bind /opt/home /home
";

const SETUP_OVERLAY_UNIT: &str = "\
[Unit]
Description=Set up writable overlays for the read-only root
Requires=opt.mount
After=opt.mount

[Service]
Type=oneshot
ExecStart={{ script }}
RemainAfterExit=true

[Install]
WantedBy=multi-user.target
";

const SCRIPT_PATH: &str = "usr/local/bin/setup-overlay.sh";
const UNIT_PATH: &str = "etc/systemd/system/setup-overlay.service";

/// Apply all image-level configuration to `install_root`.
///
/// # Errors
/// `ConfigError` when no template is supplied (precondition, not a
/// panic); otherwise any fstab/overlay/hook failure with context.
pub fn configure(
	install_root: &Path, template: Option<&ImageTemplate>, shell: &Shell,
) -> Result<()> {
	let Some(template) = template else {
		return Err(Error::Config("image template missing for post-configuration".to_owned()));
	};

	if let Some(disk) = &template.system_config.disk {
		write_base_fstab(install_root, disk)?;
		if disk.immutable_root() {
			info!("root partition is read-only, installing overlay scheme");
			install_overlay(install_root, shell).ctx("installing immutable-rootfs overlay")?;
		}
	}

	run_hooks(install_root, template, shell)
}

/// Base fstab entries derived from the declared partition layout.
fn write_base_fstab(install_root: &Path, disk: &DiskCfg) -> Result<()> {
	let mut fstab = String::new();
	for part in &disk.partitions {
		let (Some(mountpoint), Some(fs)) = (&part.mountpoint, &part.filesystem) else {
			continue;
		};
		let options = part.mount_options.as_deref().unwrap_or("defaults");
		let fsck = fsck_order(part, fs);
		let device = if part.name.is_empty() { &part.id } else { &part.name };
		fstab.push_str(&format!("PARTLABEL={device}\t{mountpoint}\t{fs}\t{options}\t0\t{fsck}\n"));
	}
	if fstab.is_empty() {
		return Ok(());
	}
	debug!(entries = disk.partitions.len(), "writing base fstab");
	just_write(install_root.join("etc/fstab"), fstab)
}

fn fsck_order(part: &Partition, fs: &str) -> u8 {
	if fs == "vfat" || fs == "efi" || fs == "swap" {
		0
	} else if part.is_root() {
		1
	} else {
		2
	}
}

fn install_overlay(install_root: &Path, shell: &Shell) -> Result<()> {
	for rel in OVERLAY_DIRS {
		let dir = install_root.join(rel);
		std::fs::create_dir_all(&dir).at(&dir)?;
		std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).at(&dir)?;
	}

	just_append(install_root.join("etc/fstab"), FSTAB_OVERLAY_ENTRIES)?;

	let mut tera_ctx = tera::Context::new();
	tera_ctx.insert("lower", "/ro/etc");
	tera_ctx.insert("upper", "/opt/overlay/etc/upper");
	tera_ctx.insert("work", "/opt/overlay/etc/work");
	let script = tera::Tera::one_off(SETUP_OVERLAY_SCRIPT, &tera_ctx, false)
		.map_err(|e| Error::Config(format!("overlay script template: {e}")))?;
	let script_path = install_root.join(SCRIPT_PATH);
	just_write(&script_path, script)?;
	std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
		.at(&script_path)?;

	let mut unit_ctx = tera::Context::new();
	unit_ctx.insert("script", "/usr/local/bin/setup-overlay.sh");
	let unit = tera::Tera::one_off(SETUP_OVERLAY_UNIT, &unit_ctx, false)
		.map_err(|e| Error::Config(format!("overlay unit template: {e}")))?;
	just_write(install_root.join(UNIT_PATH), unit)?;

	let root_s = install_root.display().to_string();
	shell
		.exec_silent(
			&["systemctl", "--root", &root_s, "enable", "setup-overlay.service"],
			ExecOpts::sudo(),
		)
		.ctx("enabling setup-overlay.service")?;
	Ok(())
}

/// Copy each hook into the image, make it executable and run it with
/// `TARGET_ROOTFS` pointing at the install root.
fn run_hooks(install_root: &Path, template: &ImageTemplate, shell: &Shell) -> Result<()> {
	for hook in &template.system_config.hook_scripts {
		let rel: PathBuf = hook
			.target_post_rootfs
			.components()
			.skip_while(|c| matches!(c, std::path::Component::RootDir))
			.collect();
		let dest = install_root.join(rel);

		if let Some(parent) = dest.parent() {
			std::fs::create_dir_all(parent).at(parent)?;
		}
		std::fs::copy(&hook.local_post_rootfs, &dest)
			.map_err(|e| Error::io(&hook.local_post_rootfs, e))
			.with_ctx(|| format!("copying hook to {}", dest.display()))?;
		std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(0o755)).at(&dest)?;

		let dest_s = dest.display().to_string();
		info!(hook = %dest_s, "running post-rootfs hook");
		shell
			.exec_stream(
				&[&dest_s],
				ExecOpts::default().with_env("TARGET_ROOTFS", install_root.display().to_string()),
			)
			.with_ctx(|| format!("hook {}", hook.target_post_rootfs.display()))?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::exec::{CommandRunner, MockRunner};
	use std::sync::Arc;

	fn template_yaml(mount_options: &str) -> ImageTemplate {
		serde_yaml::from_str(&format!(
			"\
image: {{name: t, version: \"1\"}}
target: {{os: elxr, dist: \"12\", arch: amd64, image_type: raw}}
system_config:
  bootloader: {{provider: grub, boot_type: efi}}
  disk:
    partitions:
      - {{id: esp, name: EFI, type: efi, filesystem: vfat, mountpoint: /boot/efi}}
      - {{id: root, name: ROOT, type: root, filesystem: ext4, mountpoint: /, mount_options: \"{mount_options}\"}}
"
		))
		.unwrap()
	}

	fn mock_shell() -> (Arc<MockRunner>, Shell) {
		let mock = Arc::new(MockRunner::new(vec![]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn CommandRunner>);
		(mock, shell)
	}

	#[test]
	fn missing_template_is_a_config_error() {
		let (_mock, shell) = mock_shell();
		let err = configure(Path::new("/tmp/x"), None, &shell).unwrap_err();
		assert!(matches!(err, Error::Config(_)));
	}

	#[test]
	fn readonly_root_installs_overlay() {
		let tmp = tempfile::tempdir().unwrap();
		let (mock, shell) = mock_shell();
		let template = template_yaml("ro");

		configure(tmp.path(), Some(&template), &shell).unwrap();

		for rel in OVERLAY_DIRS {
			assert!(tmp.path().join(rel).is_dir(), "{rel} missing");
		}

		let fstab = std::fs::read_to_string(tmp.path().join("etc/fstab")).unwrap();
		assert!(fstab.contains("PARTLABEL=ROOT\t/\text4\tro\t0\t1"));
		assert!(fstab.contains("/opt/var /var none bind 0 0"));
		assert!(fstab.contains("tmpfs /tmp tmpfs mode=1777,nosuid,nodev 0 0"));

		let script = std::fs::read_to_string(tmp.path().join(SCRIPT_PATH)).unwrap();
		assert!(script.contains("lowerdir=/ro/etc,upperdir=/opt/overlay/etc/upper,workdir=/opt/overlay/etc/work"));
		let mode = std::fs::metadata(tmp.path().join(SCRIPT_PATH)).unwrap().permissions().mode();
		assert_eq!(mode & 0o777, 0o755);

		let unit = std::fs::read_to_string(tmp.path().join(UNIT_PATH)).unwrap();
		assert!(unit.contains("Requires=opt.mount"));
		assert!(unit.contains("ExecStart=/usr/local/bin/setup-overlay.sh"));
		assert!(unit.contains("WantedBy=multi-user.target"));

		assert!(mock
			.lines()
			.iter()
			.any(|l| l.contains("systemctl --root") && l.contains("enable setup-overlay.service")));
	}

	#[test]
	fn writable_root_skips_overlay() {
		let tmp = tempfile::tempdir().unwrap();
		let (mock, shell) = mock_shell();
		let template = template_yaml("defaults,rw");

		configure(tmp.path(), Some(&template), &shell).unwrap();

		assert!(!tmp.path().join("ro/etc").exists());
		assert!(mock.lines().is_empty());
		let fstab = std::fs::read_to_string(tmp.path().join("etc/fstab")).unwrap();
		assert!(!fstab.contains("/opt/var"));
	}

	#[test]
	fn hook_is_copied_made_executable_and_run_with_env() {
		let tmp = tempfile::tempdir().unwrap();
		let hook_src = tmp.path().join("hook.sh");
		std::fs::write(&hook_src, "#!/bin/sh\nexit 0\n").unwrap();

		let install_root = tmp.path().join("root");
		std::fs::create_dir_all(&install_root).unwrap();

		let (mock, shell) = mock_shell();
		let mut template = template_yaml("rw");
		template.system_config.hook_scripts = vec![crate::cfg::HookScript {
			local_post_rootfs: hook_src,
			target_post_rootfs: PathBuf::from("/opt/scripts/hook.sh"),
		}];

		configure(&install_root, Some(&template), &shell).unwrap();

		let dest = install_root.join("opt/scripts/hook.sh");
		assert!(dest.exists());
		let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
		assert!(mode & 0o755 == 0o755, "mode {mode:o} not executable");

		let reqs = mock.requests();
		let run = reqs.iter().find(|r| r.argv[0].ends_with("hook.sh")).unwrap();
		let env_val = run
			.opts
			.env
			.iter()
			.find(|(k, _)| k == "TARGET_ROOTFS")
			.map(|(_, v)| v.clone())
			.unwrap();
		assert_eq!(env_val, install_root.display().to_string());
	}

	#[test]
	fn failing_hook_is_fatal_with_context() {
		let tmp = tempfile::tempdir().unwrap();
		let hook_src = tmp.path().join("hook.sh");
		std::fs::write(&hook_src, "#!/bin/sh\nexit 1\n").unwrap();
		let install_root = tmp.path().join("root");
		std::fs::create_dir_all(&install_root).unwrap();

		let mock = Arc::new(MockRunner::new(vec![crate::exec::MockRule::fail(
			"hook.sh",
			"boom",
		)]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn CommandRunner>);

		let mut template = template_yaml("rw");
		template.system_config.hook_scripts = vec![crate::cfg::HookScript {
			local_post_rootfs: hook_src,
			target_post_rootfs: PathBuf::from("/opt/scripts/hook.sh"),
		}];

		let err = configure(&install_root, Some(&template), &shell).unwrap_err();
		assert!(matches!(err.root(), Error::Exec { .. }));
	}
}
