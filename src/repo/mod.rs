//! Upstream repository metadata and package records.

use std::{collections::HashMap, path::PathBuf};

use serde_derive::{Deserialize, Serialize};
use url::Url;

use crate::errors::{Error, Result};

pub mod deb;
pub mod fetch;
pub mod rpm;

pub use fetch::{DownloadJob, RepoClient};

/// Package family a repository (and its records) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PkgType {
	Rpm,
	Deb,
}

impl std::fmt::Display for PkgType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Rpm => f.write_str("rpm"),
			Self::Deb => f.write_str("deb"),
		}
	}
}

/// One record per package known to the resolver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageInfo {
	pub name: String,
	pub pkg_type: PkgType,
	pub version: String,
	pub arch: String,
	#[serde(default)]
	pub origin: String,
	#[serde(default)]
	pub license: String,
	#[serde(default)]
	pub description: String,
	/// Download location, absolute or relative to the repo base
	pub url: String,
	/// Capability strings this package satisfies
	#[serde(default)]
	pub provides: Vec<String>,
	/// Dependency expressions with version constraints stripped
	#[serde(default)]
	pub requires: Vec<String>,
	/// The same list retaining version constraints, parallel to `requires`
	#[serde(default)]
	pub requires_ver: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub files: Option<Vec<String>>,
}

impl PackageInfo {
	/// Absolute download URL, resolving a relative location against `base`.
	///
	/// # Errors
	/// `DownloadError` when neither interpretation yields a valid URL.
	pub fn download_url(&self, base: &Url) -> Result<Url> {
		if self.url.starts_with("http://") || self.url.starts_with("https://") {
			return Url::parse(&self.url).map_err(|e| Error::Download {
				url: self.url.clone(),
				cause: e.to_string(),
			});
		}
		base.join(&self.url).map_err(|e| Error::Download { url: self.url.clone(), cause: e.to_string() })
	}

	/// Filename the package lands under in the cache.
	#[must_use]
	pub fn basename(&self) -> String {
		self.url.rsplit('/').next().unwrap_or(&self.url).to_owned()
	}
}

/// A parsed repository index: package records plus the
/// `basename -> acceptable checksums` map the verifier consumes.
#[derive(Debug, Clone, Default)]
pub struct RepoIndex {
	pub packages: Vec<PackageInfo>,
	pub checksums: HashMap<String, Vec<String>>,
}

impl RepoIndex {
	pub fn register_checksum(&mut self, basename: impl Into<String>, sha256: impl Into<String>) {
		self.checksums.entry(basename.into()).or_default().push(sha256.into().to_lowercase());
	}
}

/// One upstream repository. Immutable for the lifetime of a build.
#[derive(Debug, Clone)]
pub struct RepoConfig {
	pub base_url: Url,
	/// Suite / dist directory for DEB repos (unused for RPM)
	pub suite: String,
	pub component: String,
	/// Architecture in the repository's own spelling (amd64 vs x86_64)
	pub arch: String,
	pub release_file: Url,
	pub release_sign: Url,
	pub public_gpg_key: Option<Url>,
	/// Local build path for index scratch files
	pub local_path: PathBuf,
}

impl RepoConfig {
	/// Build a config from raw strings, normalizing the base URL to end
	/// with a slash so joins behave.
	///
	/// # Errors
	/// `ConfigError` on unparsable URLs.
	pub fn new(
		base_url: &str, suite: &str, component: &str, arch: &str, public_gpg_key: Option<&str>,
		local_path: PathBuf, pkg_type: PkgType,
	) -> Result<Self> {
		let mut base = base_url.to_owned();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url =
			Url::parse(&base).map_err(|e| Error::Config(format!("repo base url {base}: {e}")))?;

		let (release_file, release_sign) = match pkg_type {
			PkgType::Deb => (
				join(&base_url, &format!("dists/{suite}/Release"))?,
				join(&base_url, &format!("dists/{suite}/Release.gpg"))?,
			),
			PkgType::Rpm => (
				join(&base_url, "repodata/repomd.xml")?,
				join(&base_url, "repodata/repomd.xml.asc")?,
			),
		};
		let public_gpg_key = match public_gpg_key {
			Some(k) => Some(if k.starts_with("http://") || k.starts_with("https://") {
				Url::parse(k).map_err(|e| Error::Config(format!("gpg key url {k}: {e}")))?
			} else {
				join(&base_url, k)?
			}),
			None => None,
		};

		Ok(Self {
			base_url,
			suite: suite.to_owned(),
			component: component.to_owned(),
			arch: arch.to_owned(),
			release_file,
			release_sign,
			public_gpg_key,
			local_path,
		})
	}

	/// `dists/<suite>/<component>/binary-<arch>/Packages.gz`, the path as
	/// the `Release` file spells it and the URL it is fetched from.
	#[must_use]
	pub fn packages_gz_entry(&self) -> String {
		format!("{}/binary-{}/Packages.gz", self.component, self.arch)
	}

	/// # Errors
	/// `ConfigError` when the joined URL is invalid.
	pub fn packages_gz_url(&self) -> Result<Url> {
		join(&self.base_url, &format!("dists/{}/{}", self.suite, self.packages_gz_entry()))
	}
}

fn join(base: &Url, rel: &str) -> Result<Url> {
	base.join(rel).map_err(|e| Error::Config(format!("url join {rel}: {e}")))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deb_repo_urls() {
		let repo = RepoConfig::new(
			"https://mirror.example.com/elxr",
			"aria",
			"main",
			"amd64",
			Some("elxr-keyring.gpg"),
			PathBuf::from("/tmp"),
			PkgType::Deb,
		)
		.unwrap();
		assert_eq!(repo.release_file.as_str(), "https://mirror.example.com/elxr/dists/aria/Release");
		assert_eq!(repo.packages_gz_entry(), "main/binary-amd64/Packages.gz");
		assert_eq!(
			repo.packages_gz_url().unwrap().as_str(),
			"https://mirror.example.com/elxr/dists/aria/main/binary-amd64/Packages.gz"
		);
	}

	#[test]
	fn relative_download_url_joins_base() {
		let base = Url::parse("https://mirror.example.com/repo/").unwrap();
		let pkg = PackageInfo {
			name: "bash".into(),
			pkg_type: PkgType::Deb,
			version: "5.2".into(),
			arch: "amd64".into(),
			origin: String::new(),
			license: String::new(),
			description: String::new(),
			url: "pool/main/b/bash/bash_5.2_amd64.deb".into(),
			provides: vec![],
			requires: vec![],
			requires_ver: vec![],
			files: None,
		};
		assert_eq!(
			pkg.download_url(&base).unwrap().as_str(),
			"https://mirror.example.com/repo/pool/main/b/bash/bash_5.2_amd64.deb"
		);
		assert_eq!(pkg.basename(), "bash_5.2_amd64.deb");
	}
}
