//! Typed errors for the build pipeline.
//!
//! Component boundaries map their native failures onto this taxonomy; the
//! binary rim turns the final error into a `color_eyre` report.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("config error: {0}")]
	Config(String),

	#[error("cannot resolve command `{cmd}`: {detail}")]
	CommandResolution { cmd: String, detail: String },

	#[error("command `{cmd}` failed with status {code:?}: {stderr}")]
	Exec { cmd: String, code: Option<i32>, stderr: String },

	#[error("download of {url} failed: {cause}")]
	Download { url: String, cause: String },

	#[error("checksum mismatch: expected {expected}, got {actual}")]
	ChecksumMismatch { expected: String, actual: String },

	#[error("no checksum registered for {0}")]
	NoChecksum(String),

	#[error("signature validation failed: {0}")]
	Signature(String),

	#[error("cannot resolve package `{name}`: {reason}")]
	Unresolvable { name: String, reason: String },

	#[error("mount failure at {}: {stage}", .path.display())]
	Mount { path: PathBuf, stage: String },

	#[error("illegal chroot state transition: {from} -> {to}")]
	StateViolation { from: &'static str, to: &'static str },

	#[error("io error at {}: {source}", .path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("operation cancelled")]
	Cancelled,

	#[error("{ctx}: {source}")]
	Context {
		ctx: String,
		#[source]
		source: Box<Error>,
	},
}

impl Error {
	pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io { path: path.into(), source }
	}

	/// Walk the context chain down to the leaf error.
	#[must_use]
	pub fn root(&self) -> &Self {
		let mut e = self;
		while let Self::Context { source, .. } = e {
			e = source;
		}
		e
	}
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Wrap an ascending error with the operation and identifier it belongs to.
pub trait ResultExt<T> {
	fn ctx(self, ctx: impl Into<String>) -> Result<T>;
	fn with_ctx(self, f: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
	fn ctx(self, ctx: impl Into<String>) -> Result<T> {
		self.map_err(|e| Error::Context { ctx: ctx.into(), source: Box::new(e) })
	}

	fn with_ctx(self, f: impl FnOnce() -> String) -> Result<T> {
		self.map_err(|e| Error::Context { ctx: f(), source: Box::new(e) })
	}
}

/// IO results get a path attached at the call site.
pub trait IoResultExt<T> {
	fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
	fn at(self, path: impl Into<PathBuf>) -> Result<T> {
		self.map_err(|e| Error::io(path, e))
	}
}
