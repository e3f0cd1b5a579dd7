//! Per-OS providers and the dispatcher that drives their lifecycle.
//!
//! A provider adapts the generic pipeline to one OS + dist + arch. The
//! dispatcher is the only place that sees both the template and the
//! concrete provider; it runs init, pre_process and build_image in
//! strict order and always runs post_process, handing it any earlier
//! error so cleanup can decide how deep to go.

use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, warn};

use crate::{
	cfg::{ImageTemplate, OsvConfig},
	chroot::{ChrootBuilder, ChrootPaths},
	context::{BuildContext, CancelToken},
	errors::{Error, Result, ResultExt},
	exec::{ExecOpts, Shell},
	mount::MountManager,
	overlay,
};

/// The per-distribution strategy interface.
pub trait Provider: Send {
	/// `<os>-<dist>-<arch>`
	fn name(&self, dist: &str, arch: &str) -> String;
	/// Load per-OS configuration; must run before anything else.
	///
	/// # Errors
	/// `ConfigError` when the OS config is missing or malformed.
	fn init(&mut self, dist: &str, arch: &str) -> Result<()>;
	/// Validate the template and prepare working directories.
	///
	/// # Errors
	/// `ConfigError` on a template/provider mismatch.
	fn pre_process(&self, template: &mut ImageTemplate) -> Result<()>;
	/// Run the chroot build and image-level configuration.
	///
	/// # Errors
	/// Any pipeline failure, with context.
	fn build_image(&self, template: &mut ImageTemplate) -> Result<()>;
	/// Cleanup. Always runs; receives the prior error (if any) so it can
	/// choose between shallow and deep cleanup. Only its own failures
	/// may surface.
	///
	/// # Errors
	/// Cleanup failures only, never the prior error.
	fn post_process(&self, template: &ImageTemplate, prior: Option<&Error>) -> Result<()>;
}

/// Shared constructor arguments for providers.
#[derive(Clone)]
pub struct ProviderDeps {
	pub ctx: Arc<BuildContext>,
	pub shell: Shell,
	pub mounts: Arc<MountManager>,
	pub cancel: CancelToken,
}

/// The stock provider: everything family-specific already lives in the
/// chroot install strategy, so one implementation covers both package
/// families.
pub struct OsProvider {
	os: String,
	deps: ProviderDeps,
	os_cfg: Option<crate::cfg::OsArchConfig>,
}

impl OsProvider {
	#[must_use]
	pub fn new(os: impl Into<String>, deps: ProviderDeps) -> Self {
		Self { os: os.into(), deps, os_cfg: None }
	}

	fn instroot(&self, provider_id: &str) -> std::path::PathBuf {
		self.deps.ctx.work_dir.join(provider_id).join("instroot")
	}
}

impl Provider for OsProvider {
	fn name(&self, dist: &str, arch: &str) -> String {
		format!("{}-{dist}-{arch}", self.os)
	}

	fn init(&mut self, dist: &str, arch: &str) -> Result<()> {
		let osv_dir = self.deps.ctx.osv_dir(&self.os, dist);
		let cfg = OsvConfig::load_arch(&osv_dir, arch)
			.with_ctx(|| format!("loading OS config for {}", self.name(dist, arch)))?;
		debug!(os = %self.os, dist, arch, pkg_type = %cfg.pkg_type, "provider initialized");
		self.os_cfg = Some(cfg);
		Ok(())
	}

	fn pre_process(&self, template: &mut ImageTemplate) -> Result<()> {
		if template.target.os != self.os {
			return Err(Error::Config(format!(
				"template targets {} but provider is {}",
				template.target.os, self.os
			)));
		}
		if self.os_cfg.is_none() {
			return Err(Error::Config("provider used before init".to_owned()));
		}
		match self.deps.shell.host_arch() {
			Ok(host) if !arch_matches(&host, &template.target.arch) => {
				warn!(%host, target = %template.target.arch, "cross-architecture build");
			},
			Ok(_) => {},
			Err(e) => debug!(%e, "cannot determine host architecture"),
		}
		std::fs::create_dir_all(&self.deps.ctx.work_dir)
			.map_err(|e| Error::io(&self.deps.ctx.work_dir, e))?;
		std::fs::create_dir_all(&self.deps.ctx.temp_dir)
			.map_err(|e| Error::io(&self.deps.ctx.temp_dir, e))?;
		Ok(())
	}

	fn build_image(&self, template: &mut ImageTemplate) -> Result<()> {
		let os_cfg = self
			.os_cfg
			.clone()
			.ok_or_else(|| Error::Config("provider used before init".to_owned()))?;
		let id = template.target.provider_id();

		let mut builder = ChrootBuilder::new(
			Arc::clone(&self.deps.ctx),
			self.deps.shell.clone(),
			Arc::clone(&self.deps.mounts),
			self.deps.cancel.clone(),
			id.clone(),
			os_cfg,
		)?;
		let outcome = builder.build(template)?;
		debug!(?outcome, "chroot build finished");

		// unpack the snapshot as the install root for post-configuration;
		// image-type packaging (iso/raw/qcow2) picks it up from here
		let tarball = builder.paths().tarball.display().to_string();
		let instroot = self.instroot(&id);
		std::fs::create_dir_all(&instroot).map_err(|e| Error::io(&instroot, e))?;
		let instroot_s = instroot.display().to_string();
		self.deps
			.shell
			.exec_silent(&["tar", "-xzf", &tarball, "-C", &instroot_s], ExecOpts::sudo())
			.ctx("unpacking chroot snapshot")?;

		overlay::configure(&instroot, Some(template), &self.deps.shell)
			.ctx("post-rootfs configuration")?;

		info!(
			image_type = ?template.target.image_type,
			instroot = %instroot_s,
			"install root ready for image packaging"
		);
		Ok(())
	}

	fn post_process(&self, template: &ImageTemplate, prior: Option<&Error>) -> Result<()> {
		let id = template.target.provider_id();
		let work = self.deps.ctx.work_dir.join(&id);

		// leftover mounts are a defect whatever happened earlier
		match self.deps.mounts.list_submounts(&work) {
			Ok(subs) => {
				for sub in subs {
					warn!(?sub, "unmounting leftover mount");
					self.deps.mounts.umount(&sub)?;
				}
			},
			Err(e) => warn!(%e, "cannot inspect mount table during cleanup"),
		}

		if let Some(prior) = prior {
			// deep cleanup: a failed build leaves no half-built install root
			debug!(%prior, "prior failure, removing install root");
			let instroot = self.instroot(&id);
			if instroot.exists() {
				std::fs::remove_dir_all(&instroot).map_err(|e| Error::io(&instroot, e))?;
			}
			let scratch = ChrootPaths::new(&self.deps.ctx, &id).root;
			if scratch.exists() {
				std::fs::remove_dir_all(&scratch).map_err(|e| Error::io(&scratch, e))?;
			}
		}
		Ok(())
	}
}

/// Kernel and deb spellings of the same machine architecture.
fn arch_matches(host: &str, target: &str) -> bool {
	host == target
		|| (host == "x86_64" && target == "amd64")
		|| (host == "aarch64" && target == "arm64")
}

/// Registry from `<os>-<dist>-<arch>` to a provider instance.
pub struct ProviderRegistry {
	providers: BTreeMap<String, Box<dyn Provider>>,
}

impl ProviderRegistry {
	/// Register the stock providers for the supported targets.
	#[must_use]
	pub fn with_defaults(deps: &ProviderDeps) -> Self {
		let mut providers: BTreeMap<String, Box<dyn Provider>> = BTreeMap::new();
		for (os, dist, arch) in [
			("azure-linux", "3.0", "x86_64"),
			("emt", "3.0", "x86_64"),
			("elxr", "12", "amd64"),
		] {
			let provider = OsProvider::new(os, deps.clone());
			providers.insert(provider.name(dist, arch), Box::new(provider));
		}
		Self { providers }
	}

	/// # Errors
	/// `ConfigError` when no provider matches the id.
	pub fn take(&mut self, id: &str) -> Result<Box<dyn Provider>> {
		self.providers
			.remove(id)
			.ok_or_else(|| Error::Config(format!("no provider registered for {id}")))
	}

	#[must_use]
	pub fn ids(&self) -> Vec<&str> {
		self.providers.keys().map(String::as_str).collect()
	}
}

/// Drive one provider through its lifecycle. `post_process` always runs
/// and sees the first error from the earlier steps; that error (if any)
/// wins over a cleanup failure when both occur.
///
/// # Errors
/// The first lifecycle failure, or the cleanup failure when the build
/// itself succeeded.
pub fn dispatch(provider: &mut dyn Provider, template: &mut ImageTemplate) -> Result<()> {
	let pipeline = (|| -> Result<()> {
		provider.init(&template.target.dist.clone(), &template.target.arch.clone())?;
		provider.pre_process(template)?;
		provider.build_image(template)
	})();

	let prior = pipeline.as_ref().err();
	let cleanup = provider.post_process(template, prior);

	match (pipeline, cleanup) {
		(Err(e), Err(cleanup_err)) => {
			warn!(%cleanup_err, "cleanup also failed after build error");
			Err(e)
		},
		(Err(e), Ok(())) => Err(e),
		(Ok(()), Err(cleanup_err)) => Err(cleanup_err).ctx("post-process cleanup"),
		(Ok(()), Ok(())) => Ok(()),
	}
}
