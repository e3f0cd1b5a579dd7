//! HTTP fetching and the parallel package download pool.

use std::{
	path::{Path, PathBuf},
	time::Duration,
};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
	context::{CancelToken, Tunables},
	errors::{Error, IoResultExt, Result},
	progress::ProgressSink,
};

const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct DownloadJob {
	pub url: Url,
	pub dest: PathBuf,
}

/// Fetches repository metadata and package files over HTTP(S).
///
/// Proxies come from `http_proxy`/`https_proxy`/`no_proxy`, which the
/// client honors by default.
#[derive(Debug)]
pub struct RepoClient {
	http: reqwest::blocking::Client,
	tunables: Tunables,
	cancel: CancelToken,
}

impl RepoClient {
	/// # Errors
	/// `ConfigError` when the HTTP client cannot be constructed.
	pub fn new(tunables: Tunables, cancel: CancelToken) -> Result<Self> {
		let http = reqwest::blocking::Client::builder()
			.timeout(tunables.fetch_timeout)
			.build()
			.map_err(|e| Error::Config(format!("http client: {e}")))?;
		Ok(Self { http, tunables, cancel })
	}

	/// GET `url` into memory, retrying transient failures with
	/// exponential backoff.
	///
	/// # Errors
	/// `DownloadError` after the retry cap, `Cancelled` on teardown.
	pub fn fetch_bytes(&self, url: &Url) -> Result<Vec<u8>> {
		self.with_retries(url, |resp| {
			let body = resp.bytes().map_err(|e| Error::Download {
				url: url.to_string(),
				cause: e.to_string(),
			})?;
			Ok(body.to_vec())
		})
	}

	/// GET `url` into `dest` atomically: a temp file in the same
	/// directory is synced and renamed, so a partial download is never
	/// visible at the canonical name. Two workers racing on the same URL
	/// collapse to last-writer-wins with identical content.
	///
	/// # Errors
	/// `DownloadError` after the retry cap, `IOError` on filesystem
	/// trouble, `Cancelled` on teardown.
	pub fn fetch_to_file(&self, url: &Url, dest: &Path) -> Result<()> {
		let parent = dest.parent().ok_or_else(|| {
			Error::io(dest, std::io::Error::new(std::io::ErrorKind::NotFound, "no parent directory"))
		})?;
		std::fs::create_dir_all(parent).at(parent)?;

		self.with_retries(url, |mut resp| {
			let mut tmp = tempfile::NamedTempFile::new_in(parent).at(parent)?;
			resp.copy_to(tmp.as_file_mut()).map_err(|e| Error::Download {
				url: url.to_string(),
				cause: e.to_string(),
			})?;
			tmp.as_file().sync_all().at(tmp.path())?;
			tmp.persist(dest).map_err(|e| Error::io(dest, e.error))?;
			Ok(())
		})
	}

	fn with_retries<T>(
		&self, url: &Url, mut consume: impl FnMut(reqwest::blocking::Response) -> Result<T>,
	) -> Result<T> {
		let mut delay = BACKOFF_BASE;
		let mut last_cause = String::new();
		let cap = self.tunables.retry_cap.max(1);
		for attempt in 1..=cap {
			self.cancel.checkpoint()?;
			match self.http.get(url.clone()).send() {
				Ok(resp) if resp.status().is_success() => return consume(resp),
				Ok(resp) if resp.status().is_server_error() => {
					last_cause = format!("HTTP {}", resp.status());
				},
				Ok(resp) => {
					// 4xx is not going to get better with retries
					return Err(Error::Download {
						url: url.to_string(),
						cause: format!("HTTP {}", resp.status()),
					});
				},
				Err(e) => last_cause = e.to_string(),
			}
			if attempt < cap {
				debug!(%url, attempt, %last_cause, "fetch failed, backing off");
				std::thread::sleep(delay);
				delay = delay.saturating_mul(2);
			}
		}
		Err(Error::Download { url: url.to_string(), cause: last_cause })
	}

	/// Download every job on a pool sized `min(workers, len(jobs))`.
	/// Results come back in job order.
	///
	/// # Errors
	/// The first failing download aborts the batch result (workers that
	/// already started still finish their own file).
	pub fn download_all(&self, jobs: &[DownloadJob], workers: usize) -> Result<Vec<PathBuf>> {
		if jobs.is_empty() {
			return Ok(Vec::new());
		}
		let threads = workers.min(jobs.len()).max(1);
		let pool = rayon::ThreadPoolBuilder::new()
			.num_threads(threads)
			.build()
			.map_err(|e| Error::Config(format!("download pool: {e}")))?;

		info!(count = jobs.len(), threads, "downloading packages");
		let sink = ProgressSink::new(jobs.len() as u64, "downloading");
		let results: Vec<Result<PathBuf>> = pool.install(|| {
			jobs.par_iter()
				.map(|job| {
					let res = self.fetch_to_file(&job.url, &job.dest).map(|()| job.dest.clone());
					if let Err(e) = &res {
						warn!(url = %job.url, %e, "download failed");
					}
					sink.completed(job.url.as_str(), res.is_ok());
					res
				})
				.collect()
		});
		drop(sink);
		results.into_iter().collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::Tunables;

	#[test]
	fn pool_size_is_bounded_by_jobs() {
		// construction only; no network is touched
		let client = RepoClient::new(Tunables::default(), CancelToken::new()).unwrap();
		assert!(client.download_all(&[], 8).unwrap().is_empty());
	}

	#[test]
	fn cancelled_token_aborts_fetch() {
		let cancel = CancelToken::new();
		cancel.cancel();
		let client = RepoClient::new(Tunables::default(), cancel).unwrap();
		let url = Url::parse("https://example.invalid/x").unwrap();
		assert!(matches!(client.fetch_bytes(&url), Err(Error::Cancelled)));
	}
}
