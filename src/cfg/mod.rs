//! Typed configuration: the user-supplied image template, the bundled
//! per-OS config and the chroot-env package lists.
//!
//! Everything is validated at load time; a missing or mistyped field is
//! a `ConfigError` here rather than a surprise deep in the pipeline.

pub mod osv;
pub mod template;

pub use osv::{ChrootEnvConfig, OsArchConfig, OsvConfig, RepoSection};
pub use template::{
	BootType, BootloaderCfg, BootloaderKind, DiskCfg, HookScript, ImageMeta, ImageTemplate,
	ImageType, Partition, SystemConfig, Target,
};

use std::path::Path;

use crate::errors::{Error, Result};

/// Decode a YAML file into `T`, mapping every failure to `ConfigError`.
pub(crate) fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
	let text = std::fs::read_to_string(path)
		.map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
	serde_yaml::from_str(&text)
		.map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
}
