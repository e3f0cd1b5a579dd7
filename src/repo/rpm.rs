//! RPM repository metadata: `repomd.xml` and the primary/filelists
//! indices it points at.

use std::{collections::HashMap, io::Read};

use flate2::read::GzDecoder;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::{debug, info, warn};

use crate::{
	errors::{Error, Result, ResultExt},
	repo::{PackageInfo, PkgType, RepoClient, RepoConfig, RepoIndex},
	util::just_write,
	verify::{sha256_hex, Verifier},
};

#[derive(Debug, Clone, Default)]
pub struct RepomdEntry {
	pub href: String,
	pub sha256: Option<String>,
}

/// Fetch `repodata/repomd.xml`, locate the primary and filelists
/// indices, verify their declared checksums and parse them into package
/// records.
///
/// # Errors
/// Download, checksum and parse failures, each typed.
pub fn fetch_index(
	client: &RepoClient, verifier: &Verifier, repo: &RepoConfig,
) -> Result<RepoIndex> {
	info!(url = %repo.release_file, "fetching repomd");
	let repomd = client.fetch_bytes(&repo.release_file)?;

	// repomd signatures are optional on some mirrors; verify when both
	// the detached signature and a public key are available
	if let Some(key_url) = &repo.public_gpg_key {
		match client.fetch_bytes(&repo.release_sign) {
			Ok(sig) => {
				let key = client.fetch_bytes(key_url)?;
				std::fs::create_dir_all(&repo.local_path)
					.map_err(|e| Error::io(&repo.local_path, e))?;
				let md_path = repo.local_path.join("repomd.xml");
				let sig_path = repo.local_path.join("repomd.xml.asc");
				let key_path = repo.local_path.join("repo.key");
				just_write(&md_path, &repomd)?;
				just_write(&sig_path, &sig)?;
				just_write(&key_path, &key)?;
				verifier
					.verify_release(&md_path, &sig_path, &key_path)
					.ctx("verifying repomd signature")?;
			},
			Err(e) => warn!(%e, "repomd signature not available, continuing unsigned"),
		}
	}

	let entries = parse_repomd(&String::from_utf8_lossy(&repomd))?;
	let primary = entries
		.get("primary")
		.ok_or_else(|| Error::Config("repomd.xml declares no primary index".to_owned()))?;

	let primary_xml = fetch_checked(client, repo, primary, "primary")?;
	let mut index = parse_primary(&primary_xml)?;
	info!(packages = index.packages.len(), "parsed rpm primary index");

	if let Some(filelists) = entries.get("filelists") {
		let filelists_xml = fetch_checked(client, repo, filelists, "filelists")?;
		let files = parse_filelists(&filelists_xml)?;
		for pkg in &mut index.packages {
			if let Some(list) = files.get(&pkg.name) {
				pkg.files = Some(list.clone());
			}
		}
	}

	Ok(index)
}

fn fetch_checked(
	client: &RepoClient, repo: &RepoConfig, entry: &RepomdEntry, what: &str,
) -> Result<String> {
	let url = repo
		.base_url
		.join(&entry.href)
		.map_err(|e| Error::Config(format!("repomd href {}: {e}", entry.href)))?;
	debug!(%url, what, "fetching index");
	let gz = client.fetch_bytes(&url)?;
	if let Some(declared) = &entry.sha256 {
		let actual = sha256_hex(&gz);
		if !actual.eq_ignore_ascii_case(declared) {
			return Err(Error::ChecksumMismatch { expected: declared.clone(), actual })
				.ctx(format!("{what} index checksum"));
		}
	}
	let mut xml = String::new();
	GzDecoder::new(gz.as_slice())
		.read_to_string(&mut xml)
		.map_err(|e| Error::Download { url: url.to_string(), cause: format!("gunzip: {e}") })?;
	Ok(xml)
}

/// `<data type="primary"><location href=…/><checksum type="sha256">…`
///
/// # Errors
/// `ConfigError` on malformed XML.
pub fn parse_repomd(xml: &str) -> Result<HashMap<String, RepomdEntry>> {
	let mut reader = Reader::from_str(xml);
	let mut out: HashMap<String, RepomdEntry> = HashMap::new();
	let mut data_type: Option<String> = None;
	let mut in_sha_checksum = false;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e) | Event::Empty(e)) => match e.name().as_ref() {
				b"data" => {
					data_type = attr_value(&e, b"type");
					if let Some(t) = &data_type {
						out.entry(t.clone()).or_default();
					}
				},
				b"location" => {
					if let (Some(t), Some(href)) = (&data_type, attr_value(&e, b"href")) {
						if let Some(entry) = out.get_mut(t) {
							entry.href = href;
						}
					}
				},
				b"checksum" => {
					in_sha_checksum =
						attr_value(&e, b"type").as_deref() == Some("sha256") && data_type.is_some();
				},
				_ => {},
			},
			Ok(Event::Text(t)) => {
				if in_sha_checksum {
					if let (Some(dt), Ok(text)) = (&data_type, t.unescape()) {
						if let Some(entry) = out.get_mut(dt) {
							entry.sha256 = Some(text.trim().to_lowercase());
						}
					}
					in_sha_checksum = false;
				}
			},
			Ok(Event::End(e)) => {
				if e.name().as_ref() == b"data" {
					data_type = None;
				}
			},
			Ok(Event::Eof) => break,
			Ok(_) => {},
			Err(e) => return Err(Error::Config(format!("repomd.xml parse: {e}"))),
		}
	}
	Ok(out)
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
	e.attributes()
		.flatten()
		.find(|a| a.key.as_ref() == key)
		.and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn dep_op(flags: &str) -> Option<&'static str> {
	match flags {
		"EQ" => Some("="),
		"GE" => Some(">="),
		"LE" => Some("<="),
		"GT" => Some(">>"),
		"LT" => Some("<<"),
		_ => None,
	}
}

/// Parse a decompressed `primary.xml` document.
///
/// # Errors
/// `ConfigError` on malformed XML.
#[allow(clippy::too_many_lines)]
pub fn parse_primary(xml: &str) -> Result<RepoIndex> {
	let mut reader = Reader::from_str(xml);
	let mut index = RepoIndex::default();

	let mut pkg: Option<PackageInfo> = None;
	let mut pkg_checksum: Option<String> = None;
	let mut text_field: Option<&'static str> = None;
	// which rpm:entry list we are inside, if any
	let mut dep_list: Option<&'static str> = None;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e) | Event::Empty(e)) => {
				let name = e.name();
				match name.as_ref() {
					b"package" => {
						pkg = Some(PackageInfo {
							name: String::new(),
							pkg_type: PkgType::Rpm,
							version: String::new(),
							arch: String::new(),
							origin: String::new(),
							license: String::new(),
							description: String::new(),
							url: String::new(),
							provides: Vec::new(),
							requires: Vec::new(),
							requires_ver: Vec::new(),
							files: None,
						});
						pkg_checksum = None;
					},
					b"name" => text_field = Some("name"),
					b"arch" => text_field = Some("arch"),
					b"description" => text_field = Some("description"),
					b"rpm:license" => text_field = Some("license"),
					b"rpm:vendor" => text_field = Some("vendor"),
					b"checksum" => {
						if attr_value(&e, b"type").as_deref() == Some("sha256") {
							text_field = Some("checksum");
						}
					},
					b"version" => {
						if let Some(p) = pkg.as_mut() {
							let ver = attr_value(&e, b"ver").unwrap_or_default();
							let rel = attr_value(&e, b"rel");
							p.version = match rel {
								Some(rel) if !rel.is_empty() => format!("{ver}-{rel}"),
								_ => ver,
							};
						}
					},
					b"location" => {
						if let (Some(p), Some(href)) = (pkg.as_mut(), attr_value(&e, b"href")) {
							p.url = href;
						}
					},
					b"rpm:provides" => dep_list = Some("provides"),
					b"rpm:requires" => dep_list = Some("requires"),
					b"rpm:entry" => {
						let Some(p) = pkg.as_mut() else { continue };
						let Some(entry_name) = attr_value(&e, b"name") else { continue };
						match dep_list {
							Some("provides") => p.provides.push(entry_name),
							Some("requires") => {
								// rpmlib() capabilities are satisfied by rpm
								// itself, never by a package
								if entry_name.starts_with("rpmlib(") {
									continue;
								}
								let versioned = match (
									attr_value(&e, b"flags").as_deref().and_then(dep_op),
									attr_value(&e, b"ver"),
								) {
									(Some(op), Some(ver)) => {
										let full = match attr_value(&e, b"rel") {
											Some(rel) if !rel.is_empty() => format!("{ver}-{rel}"),
											_ => ver,
										};
										format!("{entry_name} ({op} {full})")
									},
									_ => entry_name.clone(),
								};
								p.requires.push(entry_name);
								p.requires_ver.push(versioned);
							},
							_ => {},
						}
					},
					b"file" => text_field = Some("file"),
					_ => {},
				}
			},
			Ok(Event::Text(t)) => {
				let Some(field) = text_field else { continue };
				let Ok(text) = t.unescape() else { continue };
				let text = text.trim();
				if text.is_empty() {
					continue;
				}
				if let Some(p) = pkg.as_mut() {
					match field {
						"name" => p.name = text.to_owned(),
						"arch" => p.arch = text.to_owned(),
						"description" => p.description = text.to_owned(),
						"license" => p.license = text.to_owned(),
						"vendor" => p.origin = text.to_owned(),
						"checksum" => pkg_checksum = Some(text.to_lowercase()),
						"file" => p.files.get_or_insert_with(Vec::new).push(text.to_owned()),
						_ => {},
					}
				}
			},
			Ok(Event::End(e)) => {
				match e.name().as_ref() {
					b"package" => {
						if let Some(p) = pkg.take() {
							if let Some(sum) = pkg_checksum.take() {
								index.register_checksum(p.basename(), sum);
							}
							index.packages.push(p);
						}
					},
					b"rpm:provides" | b"rpm:requires" => dep_list = None,
					_ => {},
				}
				text_field = None;
			},
			Ok(Event::Eof) => break,
			Ok(_) => {},
			Err(e) => return Err(Error::Config(format!("primary.xml parse: {e}"))),
		}
	}
	Ok(index)
}

/// Parse a decompressed `filelists.xml`, keyed by package name.
///
/// # Errors
/// `ConfigError` on malformed XML.
pub fn parse_filelists(xml: &str) -> Result<HashMap<String, Vec<String>>> {
	let mut reader = Reader::from_str(xml);
	let mut out: HashMap<String, Vec<String>> = HashMap::new();
	let mut current: Option<String> = None;
	let mut in_file = false;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e)) => match e.name().as_ref() {
				b"package" => current = attr_value(&e, b"name"),
				b"file" => in_file = true,
				_ => {},
			},
			Ok(Event::Text(t)) => {
				if in_file {
					if let (Some(name), Ok(text)) = (&current, t.unescape()) {
						out.entry(name.clone()).or_default().push(text.trim().to_owned());
					}
				}
			},
			Ok(Event::End(e)) => match e.name().as_ref() {
				b"package" => current = None,
				b"file" => in_file = false,
				_ => {},
			},
			Ok(Event::Eof) => break,
			Ok(_) => {},
			Err(e) => return Err(Error::Config(format!("filelists.xml parse: {e}"))),
		}
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="primary">
    <checksum type="sha256">aa11bb22</checksum>
    <location href="repodata/primary.xml.gz"/>
  </data>
  <data type="filelists">
    <checksum type="sha256">cc33dd44</checksum>
    <location href="repodata/filelists.xml.gz"/>
  </data>
</repomd>"#;

	const PRIMARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
<package type="rpm">
  <name>bash</name>
  <arch>x86_64</arch>
  <version epoch="0" ver="5.1.8" rel="3.azl3"/>
  <checksum type="sha256" pkgid="YES">DEADBEEF00</checksum>
  <description>The GNU Bourne Again shell</description>
  <location href="Packages/b/bash-5.1.8-3.azl3.x86_64.rpm"/>
  <format>
    <rpm:license>GPLv3+</rpm:license>
    <rpm:vendor>Microsoft Corporation</rpm:vendor>
    <rpm:provides>
      <rpm:entry name="bash" flags="EQ" epoch="0" ver="5.1.8" rel="3.azl3"/>
      <rpm:entry name="/bin/sh"/>
    </rpm:provides>
    <rpm:requires>
      <rpm:entry name="glibc" flags="GE" ver="2.35"/>
      <rpm:entry name="rpmlib(CompressedFileNames)" flags="LE" ver="3.0.4"/>
      <rpm:entry name="filesystem"/>
    </rpm:requires>
    <file>/usr/bin/bash</file>
  </format>
</package>
</metadata>"#;

	#[test]
	fn repomd_locates_indices() {
		let entries = parse_repomd(REPOMD).unwrap();
		let primary = entries.get("primary").unwrap();
		assert_eq!(primary.href, "repodata/primary.xml.gz");
		assert_eq!(primary.sha256.as_deref(), Some("aa11bb22"));
		assert!(entries.contains_key("filelists"));
	}

	#[test]
	fn primary_yields_package_records() {
		let index = parse_primary(PRIMARY).unwrap();
		assert_eq!(index.packages.len(), 1);
		let bash = &index.packages[0];
		assert_eq!(bash.name, "bash");
		assert_eq!(bash.version, "5.1.8-3.azl3");
		assert_eq!(bash.arch, "x86_64");
		assert_eq!(bash.license, "GPLv3+");
		assert_eq!(bash.url, "Packages/b/bash-5.1.8-3.azl3.x86_64.rpm");
		assert_eq!(bash.provides, vec!["bash", "/bin/sh"]);
		// rpmlib() entries are dropped
		assert_eq!(bash.requires, vec!["glibc", "filesystem"]);
		assert_eq!(bash.requires_ver, vec!["glibc (>= 2.35)", "filesystem"]);
		assert_eq!(bash.files.as_deref(), Some(&["/usr/bin/bash".to_owned()][..]));
	}

	#[test]
	fn primary_registers_package_checksum() {
		let index = parse_primary(PRIMARY).unwrap();
		let sums = index.checksums.get("bash-5.1.8-3.azl3.x86_64.rpm").unwrap();
		assert_eq!(sums[0], "deadbeef00");
	}

	#[test]
	fn filelists_keyed_by_name() {
		let xml = r#"<filelists><package pkgid="x" name="bash" arch="x86_64">
<version epoch="0" ver="5.1.8" rel="3"/>
<file>/usr/bin/bash</file>
<file>/usr/bin/bashbug</file>
</package></filelists>"#;
		let files = parse_filelists(xml).unwrap();
		assert_eq!(files.get("bash").unwrap().len(), 2);
	}
}
