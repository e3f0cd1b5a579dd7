//! Process-wide build context.
//!
//! One value, constructed in `main` and handed to every component by
//! `Arc`; nothing in the crate reads configuration through a global.

use std::{
	path::{Path, PathBuf},
	sync::{
		atomic::{AtomicBool, AtomicU8, Ordering},
		Arc,
	},
	time::Duration,
};

use crate::env_flag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
	Debug,
	Info,
	Warn,
	Error,
}

impl LogLevel {
	const fn from_u8(v: u8) -> Self {
		match v {
			0 => Self::Debug,
			2 => Self::Warn,
			3 => Self::Error,
			_ => Self::Info,
		}
	}

	const fn as_u8(self) -> u8 {
		match self {
			Self::Debug => 0,
			Self::Info => 1,
			Self::Warn => 2,
			Self::Error => 3,
		}
	}

	#[must_use]
	pub const fn as_filter(self) -> &'static str {
		match self {
			Self::Debug => "debug",
			Self::Info => "info",
			Self::Warn => "warn",
			Self::Error => "error",
		}
	}
}

impl std::str::FromStr for LogLevel {
	type Err = String;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"debug" => Ok(Self::Debug),
			"info" => Ok(Self::Info),
			"warn" => Ok(Self::Warn),
			"error" => Ok(Self::Error),
			_ => Err(format!("{s} is not a valid log level")),
		}
	}
}

/// Tunables for the pipeline, overridable through `BENTO_*` env vars.
#[derive(Debug, Clone)]
pub struct Tunables {
	/// Worker count for package downloads
	pub download_workers: usize,
	/// Worker count for checksum verification
	pub verify_workers: usize,
	/// Attempts per download before giving up
	pub retry_cap: u32,
	/// Budget for a single network fetch
	pub fetch_timeout: Duration,
	/// Budget for a single checksum pass
	pub checksum_timeout: Duration,
	/// Treat an unknown signer identity as a hard failure
	pub strict_signatures: bool,
}

impl Default for Tunables {
	fn default() -> Self {
		let cpus = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
		Self {
			download_workers: cpus,
			verify_workers: cpus,
			retry_cap: 3,
			fetch_timeout: Duration::from_secs(600),
			checksum_timeout: Duration::from_secs(60),
			strict_signatures: false,
		}
	}
}

impl Tunables {
	/// Defaults overlaid with whatever `BENTO_*` env vars are set.
	#[must_use]
	pub fn from_env() -> Self {
		let mut t = Self::default();
		if let Some(v) = env_flag!("BENTO_DOWNLOAD_WORKERS").and_then(|v| v.parse().ok()) {
			t.download_workers = v;
		}
		if let Some(v) = env_flag!("BENTO_VERIFY_WORKERS").and_then(|v| v.parse().ok()) {
			t.verify_workers = v;
		}
		if let Some(v) = env_flag!("BENTO_DOWNLOAD_RETRIES").and_then(|v| v.parse().ok()) {
			t.retry_cap = v;
		}
		if let Some(v) = env_flag!("BENTO_FETCH_TIMEOUT").and_then(|v| v.parse().ok()) {
			t.fetch_timeout = Duration::from_secs(v);
		}
		if let Some(v) = env_flag!("BENTO_CHECKSUM_TIMEOUT").and_then(|v| v.parse().ok()) {
			t.checksum_timeout = Duration::from_secs(v);
		}
		if let Some(v) = env_flag!("BENTO_STRICT_SIGNATURES") {
			t.strict_signatures = v == "1" || v.eq_ignore_ascii_case("true");
		}
		t
	}
}

/// Shared, read-only build configuration plus the log-level atomic.
#[derive(Debug)]
pub struct BuildContext {
	pub work_dir: PathBuf,
	pub cache_dir: PathBuf,
	pub temp_dir: PathBuf,
	/// Root of the bundled per-OS configuration (`--repo`)
	pub config_root: PathBuf,
	pub tunables: Tunables,
	log_level: AtomicU8,
}

impl BuildContext {
	#[must_use]
	pub fn new(work_dir: PathBuf, cache_dir: PathBuf, temp_dir: PathBuf, config_root: PathBuf, tunables: Tunables, level: LogLevel) -> Arc<Self> {
		Arc::new(Self {
			work_dir,
			cache_dir,
			temp_dir,
			config_root,
			tunables,
			log_level: AtomicU8::new(level.as_u8()),
		})
	}

	#[must_use]
	pub fn log_level(&self) -> LogLevel {
		LogLevel::from_u8(self.log_level.load(Ordering::Relaxed))
	}

	pub fn set_log_level(&self, level: LogLevel) {
		self.log_level.store(level.as_u8(), Ordering::Relaxed);
	}

	/// `work/<provider-id>/chrootbuild`
	#[must_use]
	pub fn chrootbuild_dir(&self, provider_id: &str) -> PathBuf {
		self.work_dir.join(provider_id).join("chrootbuild")
	}

	/// `cache/pkgCache/<provider-id>`
	#[must_use]
	pub fn pkg_cache_dir(&self, provider_id: &str) -> PathBuf {
		self.cache_dir.join("pkgCache").join(provider_id)
	}

	/// Per-OS config dir: `<config_root>/osv/<os>/<dist>`
	#[must_use]
	pub fn osv_dir(&self, os: &str, dist: &str) -> PathBuf {
		self.config_root.join("osv").join(os).join(dist)
	}
}

/// Cooperative cancellation flag, checked at every blocking checkpoint.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
	flag: Arc<AtomicBool>,
}

impl CancelToken {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::SeqCst);
	}

	#[must_use]
	pub fn is_cancelled(&self) -> bool {
		self.flag.load(Ordering::SeqCst)
	}

	/// # Errors
	/// `Error::Cancelled` once the token has been tripped.
	pub fn checkpoint(&self) -> crate::errors::Result<()> {
		if self.is_cancelled() {
			return Err(crate::errors::Error::Cancelled);
		}
		Ok(())
	}
}

/// Ensure a directory exists with the given mode.
pub fn ensure_dir(path: &Path, mode: u32) -> crate::errors::Result<()> {
	use crate::errors::IoResultExt;
	use std::os::unix::fs::PermissionsExt;
	std::fs::create_dir_all(path).at(path)?;
	std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).at(path)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cancel_token_trips_checkpoint() {
		let tok = CancelToken::new();
		assert!(tok.checkpoint().is_ok());
		tok.cancel();
		assert!(tok.checkpoint().is_err());
	}

	#[test]
	fn provider_paths() {
		let ctx = BuildContext::new(
			"/w".into(),
			"/c".into(),
			"/t".into(),
			"/cfg".into(),
			Tunables::default(),
			LogLevel::Info,
		);
		assert_eq!(ctx.chrootbuild_dir("elxr-12-amd64"), PathBuf::from("/w/elxr-12-amd64/chrootbuild"));
		assert_eq!(ctx.pkg_cache_dir("elxr-12-amd64"), PathBuf::from("/c/pkgCache/elxr-12-amd64"));
	}
}
