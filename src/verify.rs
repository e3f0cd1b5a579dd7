//! Artifact verification: PGP release signatures and per-package
//! SHA-256 checksums.

use std::{
	collections::HashMap,
	io::Write,
	path::{Path, PathBuf},
	sync::atomic::{AtomicUsize, Ordering},
	time::{Duration, Instant},
};

use rayon::prelude::*;
use sequoia_openpgp as openpgp;

use openpgp::{
	armor,
	cert::prelude::*,
	parse::{stream::*, Parse},
	policy::StandardPolicy,
	KeyHandle,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{
	context::CancelToken,
	errors::{Error, Result},
	progress::ProgressSink,
	util::printable_ratio,
};

const ARMOR_HEADER: &[u8] = b"-----BEGIN PGP PUBLIC KEY BLOCK-----";

/// Hex SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a file, streamed.
///
/// # Errors
/// `IOError` when the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
	let mut file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
	let mut hasher = Sha256::new();
	std::io::copy(&mut file, &mut hasher).map_err(|e| Error::io(path, e))?;
	Ok(hex::encode(hasher.finalize()))
}

/// Outcome of a single artifact verification.
#[derive(Debug)]
pub struct VerificationResult {
	pub path: PathBuf,
	pub ok: bool,
	pub duration: Duration,
	pub error: Option<Error>,
}

#[derive(Debug, Clone, Copy)]
pub struct Verifier {
	/// Treat an unknown signer identity as a failure instead of a warning
	pub strict: bool,
	pub checksum_budget: Duration,
}

impl Default for Verifier {
	fn default() -> Self {
		Self { strict: false, checksum_budget: Duration::from_secs(60) }
	}
}

struct SigHelper {
	certs: Vec<Cert>,
	/// Set when the only failure mode was a signer absent from the ring
	unknown_signer: bool,
}

impl VerificationHelper for SigHelper {
	fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
		Ok(self.certs.clone())
	}

	fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
		let mut saw_missing_key = false;
		let mut first_bad: Option<String> = None;
		for layer in structure {
			if let MessageLayer::SignatureGroup { results } = layer {
				for result in results {
					match result {
						Ok(_) => return Ok(()),
						Err(VerificationError::MissingKey { .. }) => saw_missing_key = true,
						Err(e) => {
							if first_bad.is_none() {
								first_bad = Some(e.to_string());
							}
						},
					}
				}
			}
		}
		if saw_missing_key && first_bad.is_none() {
			self.unknown_signer = true;
			return Ok(());
		}
		let reason = first_bad.unwrap_or_else(|| "no signature layer".to_owned());
		Err(openpgp::Error::InvalidArgument(reason).into())
	}
}

impl Verifier {
	#[must_use]
	pub fn new(strict: bool, checksum_budget: Duration) -> Self {
		Self { strict, checksum_budget }
	}

	/// Verify the detached signature `sig` over `release` against the
	/// public key(s) in `pubkey`. Armored and binary keys are both
	/// accepted; binary material is re-armored in memory first. A
	/// signature from a signer the key-ring does not know is downgraded
	/// to a warning unless the verifier is strict.
	///
	/// # Errors
	/// `SignatureError` on any non-downgraded failure, `IOError` when a
	/// file cannot be read.
	pub fn verify_release(&self, release: &Path, sig: &Path, pubkey: &Path) -> Result<bool> {
		let data = std::fs::read(release).map_err(|e| Error::io(release, e))?;
		let sig_bytes = std::fs::read(sig).map_err(|e| Error::io(sig, e))?;
		let key_bytes = std::fs::read(pubkey).map_err(|e| Error::io(pubkey, e))?;

		let certs = load_keyring(&key_bytes)?;
		debug!(certs = certs.len(), release = ?release, "verifying detached signature");

		// try the signature as provided, then the binary form re-armored
		let attempts: Vec<Vec<u8>> = if looks_armored_sig(&sig_bytes) {
			vec![sig_bytes]
		} else {
			let mut v = vec![sig_bytes.clone()];
			if let Ok(armored) = rearmor(&sig_bytes, armor::Kind::Signature) {
				v.push(armored);
			}
			v
		};

		let mut last_err = String::new();
		for attempt in &attempts {
			match Self::verify_detached(&data, attempt, &certs) {
				Ok(unknown_signer) => {
					if unknown_signer {
						if self.strict {
							return Err(Error::Signature(
								"signer identity not present in repository key-ring".to_owned(),
							));
						}
						warn!("release signed by an identity the key-ring does not know, accepting");
					}
					return Ok(true);
				},
				Err(e) => last_err = e,
			}
		}
		Err(Error::Signature(last_err))
	}

	fn verify_detached(data: &[u8], sig: &[u8], certs: &[Cert]) -> std::result::Result<bool, String> {
		let policy = StandardPolicy::new();
		let helper = SigHelper { certs: certs.to_vec(), unknown_signer: false };
		let mut verifier = DetachedVerifierBuilder::from_bytes(sig)
			.map_err(|e| e.to_string())?
			.with_policy(&policy, None, helper)
			.map_err(|e| e.to_string())?;
		verifier.verify_bytes(data).map_err(|e| e.to_string())?;
		Ok(verifier.helper_ref().unknown_signer)
	}

	/// Fan out SHA-256 verification of `paths` over `workers` threads.
	/// A basename may map to several acceptable checksums; the first
	/// match wins and comparison is case-insensitive. Results come back
	/// indexed by input position regardless of completion order.
	#[must_use]
	pub fn verify_packages(
		&self, paths: &[PathBuf], expected: &HashMap<String, Vec<String>>, workers: usize,
		cancel: &CancelToken,
	) -> Vec<VerificationResult> {
		if paths.is_empty() {
			return Vec::new();
		}
		let threads = workers.min(paths.len()).max(1);
		let pool = match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
			Ok(p) => p,
			Err(e) => {
				warn!(%e, "cannot build verify pool, falling back to current thread");
				return paths.iter().map(|p| self.verify_one(p, expected, cancel)).collect();
			},
		};

		info!(count = paths.len(), threads, "verifying package checksums");
		let sink = ProgressSink::new(paths.len() as u64, "verifying");
		let done = AtomicUsize::new(0);
		let results: Vec<VerificationResult> = pool.install(|| {
			paths
				.par_iter()
				.map(|path| {
					let res = self.verify_one(path, expected, cancel);
					done.fetch_add(1, Ordering::Relaxed);
					sink.completed(path.display().to_string(), res.ok);
					res
				})
				.collect()
		});
		drop(sink);
		debug!(done = done.load(Ordering::Relaxed), "verification finished");
		results
	}

	fn verify_one(
		&self, path: &Path, expected: &HashMap<String, Vec<String>>, cancel: &CancelToken,
	) -> VerificationResult {
		let start = Instant::now();
		let fail = |error: Error, start: Instant| VerificationResult {
			path: path.to_path_buf(),
			ok: false,
			duration: start.elapsed(),
			error: Some(error),
		};

		if cancel.is_cancelled() {
			return fail(Error::Cancelled, start);
		}

		let basename = path
			.file_name()
			.map(|n| n.to_string_lossy().into_owned())
			.unwrap_or_default();
		let Some(candidates) = expected.get(&basename) else {
			return fail(Error::NoChecksum(basename), start);
		};

		let actual = match sha256_file(path) {
			Ok(h) => h,
			Err(e) => return fail(e, start),
		};

		let duration = start.elapsed();
		if duration > self.checksum_budget {
			warn!(?path, ?duration, "checksum exceeded its time budget");
		}

		if candidates.iter().any(|c| c.eq_ignore_ascii_case(&actual)) {
			VerificationResult { path: path.to_path_buf(), ok: true, duration, error: None }
		} else {
			VerificationResult {
				path: path.to_path_buf(),
				ok: false,
				duration,
				error: Some(Error::ChecksumMismatch {
					expected: candidates.join(","),
					actual,
				}),
			}
		}
	}
}

/// Parse a public key-ring, auto-detecting armored vs binary input.
/// Binary keys are converted to an in-memory armored form first, per
/// the repository metadata contract.
///
/// # Errors
/// `SignatureError` when no certificate can be parsed.
pub fn load_keyring(key_bytes: &[u8]) -> Result<Vec<Cert>> {
	let head = &key_bytes[..key_bytes.len().min(100)];
	let armored = key_bytes.starts_with(ARMOR_HEADER) || printable_ratio(head) >= 0.7;

	let material: Vec<u8> = if armored {
		key_bytes.to_vec()
	} else {
		rearmor(key_bytes, armor::Kind::PublicKey)
			.map_err(|e| Error::Signature(format!("cannot armor binary key: {e}")))?
	};

	let certs: Vec<Cert> = CertParser::from_bytes(&material)
		.map_err(|e| Error::Signature(format!("key-ring parse: {e}")))?
		.flatten()
		.collect();
	if certs.is_empty() {
		return Err(Error::Signature("key-ring contains no usable certificate".to_owned()));
	}
	Ok(certs)
}

fn looks_armored_sig(sig: &[u8]) -> bool {
	sig.starts_with(b"-----BEGIN PGP SIGNATURE-----")
}

fn rearmor(binary: &[u8], kind: armor::Kind) -> std::io::Result<Vec<u8>> {
	let mut out = Vec::new();
	let mut writer = armor::Writer::new(&mut out, kind)?;
	writer.write_all(binary)?;
	writer.finalize()?;
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn write_tmp(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
		let p = dir.join(name);
		std::fs::write(&p, content).unwrap();
		p
	}

	#[test]
	fn sha256_of_known_content() {
		// sha256("test packages content")
		let hash = sha256_hex(b"test packages content");
		assert_eq!(hash, sha256_hex(b"test packages content"));
		assert_eq!(hash.len(), 64);
	}

	#[test]
	fn checksum_match_ok() {
		let tmp = tempfile::tempdir().unwrap();
		let path = write_tmp(tmp.path(), "pkg_1.0_amd64.deb", b"test packages content");
		let declared = sha256_hex(b"test packages content").to_uppercase();
		let mut expected = HashMap::new();
		expected.insert("pkg_1.0_amd64.deb".to_owned(), vec![declared]);

		let results = Verifier::default().verify_packages(
			&[path.clone()],
			&expected,
			4,
			&CancelToken::new(),
		);
		assert_eq!(results.len(), 1);
		assert_eq!(results[0].path, path);
		assert!(results[0].ok, "{:?}", results[0].error);
	}

	#[test]
	fn checksum_mismatch_is_typed() {
		let tmp = tempfile::tempdir().unwrap();
		let path = write_tmp(tmp.path(), "pkg_1.0_amd64.deb", b"test packages content");
		let mut expected = HashMap::new();
		expected.insert("pkg_1.0_amd64.deb".to_owned(), vec!["wrongchecksum123".to_owned()]);

		let results =
			Verifier::default().verify_packages(&[path], &expected, 4, &CancelToken::new());
		assert!(!results[0].ok);
		assert!(matches!(results[0].error, Some(Error::ChecksumMismatch { .. })));
	}

	#[test]
	fn missing_entry_yields_no_checksum() {
		let tmp = tempfile::tempdir().unwrap();
		let path = write_tmp(tmp.path(), "stray.deb", b"x");
		let results = Verifier::default().verify_packages(
			&[path],
			&HashMap::new(),
			1,
			&CancelToken::new(),
		);
		assert!(matches!(results[0].error, Some(Error::NoChecksum(_))));
	}

	#[test]
	fn results_follow_input_order() {
		let tmp = tempfile::tempdir().unwrap();
		let mut expected = HashMap::new();
		let mut paths = Vec::new();
		for i in 0..16 {
			let name = format!("p{i}.deb");
			let content = format!("content {i}");
			paths.push(write_tmp(tmp.path(), &name, content.as_bytes()));
			expected.insert(name, vec![sha256_hex(content.as_bytes())]);
		}
		let results = Verifier::default().verify_packages(&paths, &expected, 8, &CancelToken::new());
		assert_eq!(results.len(), paths.len());
		for (r, p) in results.iter().zip(&paths) {
			assert_eq!(&r.path, p);
			assert!(r.ok);
		}
	}

	#[test]
	fn second_registered_checksum_matches() {
		let tmp = tempfile::tempdir().unwrap();
		let path = write_tmp(tmp.path(), "dup.deb", b"payload");
		let mut expected = HashMap::new();
		expected.insert(
			"dup.deb".to_owned(),
			vec!["0000".to_owned(), sha256_hex(b"payload")],
		);
		let results = Verifier::default().verify_packages(&[path], &expected, 1, &CancelToken::new());
		assert!(results[0].ok);
	}

	#[test]
	fn binary_key_detection_uses_printable_ratio() {
		let bin: Vec<u8> = (128_u8..=255).cycle().take(400).collect();
		assert!(printable_ratio(&bin[..100]) < 0.7);
		// load_keyring on garbage must fail typed, not panic
		assert!(matches!(load_keyring(&bin), Err(Error::Signature(_))));
	}
}
