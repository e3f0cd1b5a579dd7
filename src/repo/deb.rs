//! DEB repository metadata: `Release` files and `Packages` indices.

use std::{collections::HashMap, io::Read, path::Path};

use flate2::read::GzDecoder;
use tracing::info;

use crate::{
	errors::{Error, IoResultExt, Result, ResultExt},
	repo::{PackageInfo, PkgType, RepoClient, RepoConfig, RepoIndex},
	util::just_write,
	verify::{sha256_hex, Verifier},
};

/// Fetch `Release` + `Release.gpg`, verify the signature, then download
/// and parse the component's `Packages.gz` after checking its declared
/// SHA-256.
///
/// # Errors
/// Signature, checksum, download and parse failures, each typed.
pub fn fetch_index(
	client: &RepoClient, verifier: &Verifier, repo: &RepoConfig,
) -> Result<RepoIndex> {
	info!(url = %repo.release_file, "fetching release metadata");
	let release = client.fetch_bytes(&repo.release_file)?;
	let sig = client.fetch_bytes(&repo.release_sign)?;
	let key_url = repo
		.public_gpg_key
		.as_ref()
		.ok_or_else(|| Error::Config("deb repo has no public_gpg_key".to_owned()))?;
	let key = client.fetch_bytes(key_url)?;

	// The verifier works on files, so the metadata lands in the repo's
	// local scratch dir first.
	std::fs::create_dir_all(&repo.local_path).at(&repo.local_path)?;
	let release_path = repo.local_path.join("Release");
	let sig_path = repo.local_path.join("Release.gpg");
	let key_path = repo.local_path.join("repo.key");
	just_write(&release_path, &release)?;
	just_write(&sig_path, &sig)?;
	just_write(&key_path, &key)?;

	verifier
		.verify_release(&release_path, &sig_path, &key_path)
		.ctx("verifying Release signature")?;

	let release_text = String::from_utf8_lossy(&release);
	let sha_entries = parse_release_sha256(&release_text);
	let entry = repo.packages_gz_entry();
	let declared = sha_entries
		.get(entry.as_str())
		.ok_or_else(|| Error::Config(format!("Release has no SHA256 entry for {entry}")))?;

	let pkgs_url = repo.packages_gz_url()?;
	info!(url = %pkgs_url, "fetching package index");
	let gz = client.fetch_bytes(&pkgs_url)?;
	let actual = sha256_hex(&gz);
	if !actual.eq_ignore_ascii_case(declared) {
		return Err(Error::ChecksumMismatch { expected: declared.clone(), actual })
			.ctx(format!("Packages.gz for {entry}"));
	}

	let mut text = String::new();
	GzDecoder::new(gz.as_slice())
		.read_to_string(&mut text)
		.map_err(|e| Error::io(Path::new(&entry), e))?;

	let index = parse_packages(&text, &repo.suite);
	info!(packages = index.packages.len(), "parsed deb index");
	Ok(index)
}

/// The `SHA256:` section of a `Release` file: ` <hex> <size> <path>`
/// lines until the next unindented field.
#[must_use]
pub fn parse_release_sha256(release: &str) -> HashMap<String, String> {
	let mut out = HashMap::new();
	let mut in_section = false;
	for line in release.lines() {
		if line.starts_with("SHA256:") {
			in_section = true;
			continue;
		}
		if in_section {
			if !line.starts_with(' ') {
				break;
			}
			let mut fields = line.split_whitespace();
			let (Some(hex), Some(_size), Some(path)) =
				(fields.next(), fields.next(), fields.next())
			else {
				continue;
			};
			out.insert(path.to_owned(), hex.to_lowercase());
		}
	}
	out
}

/// Parse RFC822-style stanzas separated by blank lines.
#[must_use]
pub fn parse_packages(text: &str, origin: &str) -> RepoIndex {
	let mut index = RepoIndex::default();
	for stanza in split_stanzas(text) {
		let Some(pkg) = stanza_to_package(&stanza, origin) else { continue };
		if let Some(sha) = stanza.get("SHA256") {
			index.register_checksum(pkg.basename(), sha.clone());
		}
		index.packages.push(pkg);
	}
	index
}

fn split_stanzas(text: &str) -> Vec<HashMap<String, String>> {
	let mut stanzas = Vec::new();
	let mut current: HashMap<String, String> = HashMap::new();
	let mut last_key: Option<String> = None;

	for line in text.lines() {
		if line.trim().is_empty() {
			if !current.is_empty() {
				stanzas.push(std::mem::take(&mut current));
			}
			last_key = None;
			continue;
		}
		if line.starts_with(' ') || line.starts_with('\t') {
			// folded continuation of the previous field
			if let Some(key) = &last_key {
				if let Some(val) = current.get_mut(key) {
					val.push('\n');
					val.push_str(line.trim());
				}
			}
			continue;
		}
		if let Some((key, val)) = line.split_once(':') {
			let key = key.trim().to_owned();
			current.insert(key.clone(), val.trim().to_owned());
			last_key = Some(key);
		}
	}
	if !current.is_empty() {
		stanzas.push(current);
	}
	stanzas
}

fn stanza_to_package(stanza: &HashMap<String, String>, origin: &str) -> Option<PackageInfo> {
	let name = stanza.get("Package")?.clone();
	if name.is_empty() {
		return None;
	}

	let mut requires_ver: Vec<String> = Vec::new();
	for field in ["Pre-Depends", "Depends"] {
		if let Some(deps) = stanza.get(field) {
			requires_ver.extend(deps.split(',').map(|d| d.trim().to_owned()).filter(|d| !d.is_empty()));
		}
	}
	let requires = requires_ver.iter().map(|d| strip_version_constraint(d)).collect();

	let provides = stanza
		.get("Provides")
		.map(|p| {
			p.split(',')
				.map(|c| strip_version_constraint(c.trim()))
				.filter(|c| !c.is_empty())
				.collect()
		})
		.unwrap_or_default();

	Some(PackageInfo {
		name,
		pkg_type: PkgType::Deb,
		version: stanza.get("Version").cloned().unwrap_or_default(),
		arch: stanza.get("Architecture").cloned().unwrap_or_default(),
		origin: origin.to_owned(),
		license: String::new(),
		description: stanza.get("Description").cloned().unwrap_or_default(),
		url: stanza.get("Filename").cloned().unwrap_or_default(),
		provides,
		requires,
		requires_ver,
		files: None,
	})
}

/// Drop parenthesized version constraints, keep alternatives intact:
/// `libc6 (>= 2.36) | libc6.1` -> `libc6 | libc6.1`.
fn strip_version_constraint(dep: &str) -> String {
	let mut out = String::with_capacity(dep.len());
	let mut depth = 0usize;
	for c in dep.chars() {
		match c {
			'(' => depth += 1,
			')' => depth = depth.saturating_sub(1),
			_ if depth == 0 => out.push(c),
			_ => {},
		}
	}
	let collapsed: Vec<&str> = out.split_whitespace().collect();
	collapsed.join(" ")
}

#[cfg(test)]
mod tests {
	use super::*;

	const PACKAGES: &str = "\
Package: bash
Version: 5.2.15-2
Architecture: amd64
Depends: base-files (>= 2.1.12), debianutils (>= 5.6-0.1)
Pre-Depends: libc6 (>= 2.36), libtinfo6 (>= 6)
Provides: sh
Filename: pool/main/b/bash/bash_5.2.15-2_amd64.deb
SHA256: ABCDEF0123456789abcdef0123456789abcdef0123456789abcdef0123456789
Description: GNU Bourne Again SHell
 Bash is an sh-compatible command language interpreter.

Package: dash
Version: 0.5.12-2
Architecture: amd64
Depends: debianutils (>= 5.6-0.1) | busybox, libc6 (>= 2.36)
Filename: pool/main/d/dash/dash_0.5.12-2_amd64.deb
SHA256: 1111111111111111111111111111111111111111111111111111111111111111
Description: POSIX-compliant shell
";

	#[test]
	fn parses_stanzas_into_packages() {
		let index = parse_packages(PACKAGES, "aria");
		assert_eq!(index.packages.len(), 2);

		let bash = &index.packages[0];
		assert_eq!(bash.name, "bash");
		assert_eq!(bash.version, "5.2.15-2");
		assert_eq!(bash.provides, vec!["sh"]);
		// Pre-Depends come first, then Depends, constraints stripped
		assert_eq!(bash.requires, vec!["libc6", "libtinfo6", "base-files", "debianutils"]);
		assert_eq!(bash.requires_ver[0], "libc6 (>= 2.36)");
		assert_eq!(bash.requires.len(), bash.requires_ver.len());
	}

	#[test]
	fn checksum_map_is_keyed_by_basename_lowercased() {
		let index = parse_packages(PACKAGES, "aria");
		let sums = index.checksums.get("bash_5.2.15-2_amd64.deb").unwrap();
		assert_eq!(sums[0], "abcdef0123456789abcdef0123456789abcdef0123456789abcdef0123456789");
	}

	#[test]
	fn alternatives_survive_version_stripping() {
		let index = parse_packages(PACKAGES, "aria");
		let dash = &index.packages[1];
		assert_eq!(dash.requires[0], "debianutils | busybox");
	}

	#[test]
	fn release_sha256_section() {
		let release = "\
Origin: eLxr
Suite: aria
SHA1:
 aaaa 100 main/binary-amd64/Packages
SHA256:
 cafe0000 100 main/binary-amd64/Packages
 beef1111 80 main/binary-amd64/Packages.gz
Components: main
";
		let map = parse_release_sha256(release);
		assert_eq!(map.get("main/binary-amd64/Packages.gz").unwrap(), "beef1111");
		assert_eq!(map.len(), 2);
	}
}
