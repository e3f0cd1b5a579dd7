//! Bundled per-OS configuration: `config/osv/<os>/<dist>/config.yml`
//! keyed by architecture, plus the chroot-env package lists it points
//! at.

use std::{collections::BTreeMap, path::{Path, PathBuf}};

use serde_derive::{Deserialize, Serialize};

use crate::{
	errors::{Error, Result},
	repo::PkgType,
};

/// `config.yml`: a mapping from architecture to that arch's settings.
#[derive(Deserialize, Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct OsvConfig(pub BTreeMap<String, OsArchConfig>);

impl OsvConfig {
	/// Load the config for `<os>/<dist>` and select `arch`.
	///
	/// # Errors
	/// `ConfigError` when the file is missing, malformed, or has no
	/// entry for the requested architecture.
	pub fn load_arch(osv_dir: &Path, arch: &str) -> Result<OsArchConfig> {
		let path = osv_dir.join("config.yml");
		let cfg: Self = super::load_yaml(&path)?;
		cfg.0.get(arch).cloned().ok_or_else(|| {
			Error::Config(format!("{} has no entry for arch {arch}", path.display()))
		})
	}
}

#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct OsArchConfig {
	#[serde(rename = "pkgType")]
	pub pkg_type: PkgType,
	#[serde(rename = "releaseVersion")]
	pub release_version: String,
	/// Relative to the OS-config directory
	#[serde(rename = "chrootenvConfigFile")]
	pub chrootenv_config_file: PathBuf,
	pub repo: RepoSection,
}

/// Upstream repository coordinates for one OS/arch.
#[derive(Deserialize, Debug, Clone, Serialize)]
pub struct RepoSection {
	#[serde(rename = "baseUrl")]
	pub base_url: String,
	#[serde(default = "_default_component")]
	pub component: String,
	/// DEB suite; unused for RPM repositories
	#[serde(default)]
	pub suite: String,
	/// The repository's own spelling of the architecture
	#[serde(rename = "archAlias")]
	pub arch_alias: String,
	#[serde(rename = "publicGpgKey", default)]
	pub public_gpg_key: Option<String>,
}

fn _default_component() -> String {
	String::from("main")
}

/// The chroot-env package lists: essential first, then packages.
#[derive(Deserialize, Debug, Clone, Serialize, Default)]
pub struct ChrootEnvConfig {
	#[serde(default)]
	pub essential: Vec<String>,
	#[serde(default)]
	pub packages: Vec<String>,
}

impl ChrootEnvConfig {
	/// # Errors
	/// `ConfigError` when the file is missing or any element is not a
	/// plain string (the YAML decode enforces the latter).
	pub fn load(osv_dir: &Path, rel: &Path) -> Result<Self> {
		super::load_yaml(&osv_dir.join(rel))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn osv_config_selects_arch() {
		let tmp = tempfile::tempdir().unwrap();
		std::fs::write(
			tmp.path().join("config.yml"),
			"\
x86_64:
  pkgType: rpm
  releaseVersion: \"3.0\"
  chrootenvConfigFile: chrootenv-x86_64.yml
  repo:
    baseUrl: https://packages.microsoft.com/azurelinux/3.0/prod/base/x86_64
    archAlias: x86_64
",
		)
		.unwrap();

		let cfg = OsvConfig::load_arch(tmp.path(), "x86_64").unwrap();
		assert_eq!(cfg.pkg_type, PkgType::Rpm);
		assert_eq!(cfg.release_version, "3.0");
		assert_eq!(cfg.repo.component, "main");

		let missing = OsvConfig::load_arch(tmp.path(), "aarch64");
		assert!(matches!(missing, Err(Error::Config(_))));
	}

	#[test]
	fn chrootenv_lists_must_be_strings() {
		let tmp = tempfile::tempdir().unwrap();
		std::fs::write(
			tmp.path().join("chrootenv.yml"),
			"essential: [filesystem, bash]\npackages: [vim, {bad: mapping}]\n",
		)
		.unwrap();
		let res = ChrootEnvConfig::load(tmp.path(), Path::new("chrootenv.yml"));
		assert!(matches!(res, Err(Error::Config(_))));
	}

	#[test]
	fn chrootenv_lists_load() {
		let tmp = tempfile::tempdir().unwrap();
		std::fs::write(
			tmp.path().join("chrootenv.yml"),
			"essential: [filesystem, glibc]\npackages: [bash]\n",
		)
		.unwrap();
		let cfg = ChrootEnvConfig::load(tmp.path(), Path::new("chrootenv.yml")).unwrap();
		assert_eq!(cfg.essential, vec!["filesystem", "glibc"]);
		assert_eq!(cfg.packages, vec!["bash"]);
	}
}
