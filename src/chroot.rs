//! The chroot build orchestrator.
//!
//! One authoritative state machine drives the scratch root through
//! prepare, download, install, fixup and snapshot; the per-package-family
//! differences live in an [`InstallStrategy`] object. Every failure path
//! releases mounts and the scratch root before the error propagates.

use std::{
	path::{Path, PathBuf},
	sync::Arc,
};

use tracing::{debug, info, warn};

use crate::{
	cfg::{ChrootEnvConfig, ImageTemplate, OsArchConfig},
	context::{ensure_dir, BuildContext, CancelToken},
	errors::{Error, IoResultExt, Result, ResultExt},
	exec::{ExecOpts, Shell},
	mount::{MountGuard, MountManager},
	repo::{self, DownloadJob, PkgType, RepoClient, RepoConfig, RepoIndex},
	resolver::{self, Resolution},
	verify::Verifier,
};

pub const CHROOT_TARBALL: &str = "chrootenv.tar.gz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChrootState {
	Init,
	Prepared,
	Downloaded,
	Installed,
	Fixed,
	Snapshotted,
	Failed,
}

impl ChrootState {
	#[must_use]
	pub const fn name(self) -> &'static str {
		match self {
			Self::Init => "INIT",
			Self::Prepared => "PREPARED",
			Self::Downloaded => "DOWNLOADED",
			Self::Installed => "INSTALLED",
			Self::Fixed => "FIXED",
			Self::Snapshotted => "SNAPSHOTTED",
			Self::Failed => "FAILED",
		}
	}

	const fn next(self) -> Option<Self> {
		match self {
			Self::Init => Some(Self::Prepared),
			Self::Prepared => Some(Self::Downloaded),
			Self::Downloaded => Some(Self::Installed),
			Self::Installed => Some(Self::Fixed),
			Self::Fixed => Some(Self::Snapshotted),
			Self::Snapshotted | Self::Failed => None,
		}
	}
}

/// What `build` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
	/// A previous snapshot was present and reused untouched
	Reused,
	/// The full pipeline ran and produced a fresh snapshot
	Built,
}

/// Filesystem layout of one chroot build.
#[derive(Debug, Clone)]
pub struct ChrootPaths {
	/// `work/<provider-id>/chrootbuild`
	pub build_dir: PathBuf,
	/// `<build_dir>/chroot`
	pub root: PathBuf,
	/// `<build_dir>/chrootenv.tar.gz`
	pub tarball: PathBuf,
	/// `cache/pkgCache/<provider-id>`
	pub cache_dir: PathBuf,
}

impl ChrootPaths {
	#[must_use]
	pub fn new(ctx: &BuildContext, provider_id: &str) -> Self {
		let build_dir = ctx.chrootbuild_dir(provider_id);
		Self {
			root: build_dir.join("chroot"),
			tarball: build_dir.join(CHROOT_TARBALL),
			cache_dir: ctx.pkg_cache_dir(provider_id),
			build_dir,
		}
	}

	/// Scratch location for repository metadata (Release files, keys).
	#[must_use]
	pub fn meta_dir(&self) -> PathBuf {
		self.cache_dir.join("meta")
	}
}

/// Per-package-family install behavior.
pub trait InstallStrategy: Send + Sync {
	fn install(&self, paths: &ChrootPaths, order: &[repo::PackageInfo]) -> Result<()>;
	fn fixup(&self, paths: &ChrootPaths, repo: &RepoConfig) -> Result<()>;
}

pub struct ChrootBuilder {
	ctx: Arc<BuildContext>,
	shell: Shell,
	mounts: Arc<MountManager>,
	client: RepoClient,
	verifier: Verifier,
	cancel: CancelToken,
	state: ChrootState,
	provider_id: String,
	os_cfg: OsArchConfig,
	repo: RepoConfig,
	strategy: Box<dyn InstallStrategy>,
	paths: ChrootPaths,
	/// Second-stage list from the chroot-env config, filled in prepare
	env_packages: Vec<String>,
}

impl std::fmt::Debug for ChrootBuilder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChrootBuilder")
			.field("provider_id", &self.provider_id)
			.field("state", &self.state)
			.finish_non_exhaustive()
	}
}

impl ChrootBuilder {
	/// # Errors
	/// `ConfigError` when the repository coordinates are unusable.
	pub fn new(
		ctx: Arc<BuildContext>, shell: Shell, mounts: Arc<MountManager>, cancel: CancelToken,
		provider_id: String, os_cfg: OsArchConfig,
	) -> Result<Self> {
		let paths = ChrootPaths::new(&ctx, &provider_id);
		let repo = RepoConfig::new(
			&os_cfg.repo.base_url,
			&os_cfg.repo.suite,
			&os_cfg.repo.component,
			&os_cfg.repo.arch_alias,
			os_cfg.repo.public_gpg_key.as_deref(),
			paths.meta_dir(),
			os_cfg.pkg_type,
		)?;
		let client = RepoClient::new(ctx.tunables.clone(), cancel.clone())?;
		let verifier = Verifier::new(ctx.tunables.strict_signatures, ctx.tunables.checksum_timeout);
		let strategy: Box<dyn InstallStrategy> = match os_cfg.pkg_type {
			PkgType::Rpm => Box::new(RpmStrategy {
				shell: shell.clone(),
				mounts: Arc::clone(&mounts),
			}),
			PkgType::Deb => Box::new(DebStrategy {
				shell: shell.clone(),
				mounts: Arc::clone(&mounts),
				suite: os_cfg.repo.suite.clone(),
				repo_mount: PathBuf::from(CACHE_REPO_MOUNT),
			}),
		};
		Ok(Self {
			ctx,
			shell,
			mounts,
			client,
			verifier,
			cancel,
			state: ChrootState::Init,
			provider_id,
			os_cfg,
			repo,
			strategy,
			paths,
			env_packages: Vec::new(),
		})
	}

	#[must_use]
	pub fn paths(&self) -> &ChrootPaths {
		&self.paths
	}

	#[must_use]
	pub const fn state(&self) -> ChrootState {
		self.state
	}

	fn transition(&mut self, to: ChrootState) -> Result<()> {
		let legal = to == ChrootState::Failed || self.state.next() == Some(to);
		if !legal {
			return Err(Error::StateViolation { from: self.state.name(), to: to.name() });
		}
		debug!(from = self.state.name(), to = to.name(), "chroot state transition");
		self.state = to;
		Ok(())
	}

	/// Drive the full pipeline. Re-running against an existing snapshot
	/// is a no-op success.
	///
	/// # Errors
	/// Any stage failure, wrapped with the provider id; the scratch root
	/// and its mounts are released before the error is returned.
	pub fn build(&mut self, template: &mut ImageTemplate) -> Result<BuildOutcome> {
		if self.state != ChrootState::Init {
			return Err(Error::StateViolation { from: self.state.name(), to: "PREPARED" });
		}

		let reused = self.prepare(template).with_ctx(|| format!("preparing {}", self.provider_id))?;
		if reused {
			return Ok(BuildOutcome::Reused);
		}

		let mut guard =
			MountGuard::new(Arc::clone(&self.mounts), self.paths.root.clone()).deleting_root();
		let result = self.run_pipeline(template);
		match result {
			Ok(()) => {
				// snapshot already took the tree down
				guard.disarm();
				Ok(BuildOutcome::Built)
			},
			Err(e) => {
				self.state = ChrootState::Failed;
				drop(guard);
				Err(e).with_ctx(|| format!("chroot build for {}", self.provider_id))
			},
		}
	}

	fn run_pipeline(&mut self, template: &mut ImageTemplate) -> Result<()> {
		let resolution = self.download(template).ctx("downloading packages")?;
		self.cancel.checkpoint()?;
		self.install(&resolution).ctx("installing packages")?;
		self.fixup().ctx("fixing up chroot")?;
		self.snapshot().ctx("compressing chroot")
	}

	/// INIT -> PREPARED: resolve paths, ensure directories, load the
	/// chroot-env package lists. Returns true when a reusable snapshot
	/// short-circuits the build.
	fn prepare(&mut self, template: &mut ImageTemplate) -> Result<bool> {
		self.transition(ChrootState::Prepared)?;

		if self.paths.tarball.exists() {
			info!(tarball = ?self.paths.tarball, "chroot snapshot already present, reusing");
			return Ok(true);
		}

		std::fs::create_dir_all(&self.paths.root).at(&self.paths.root)?;
		ensure_dir(&self.paths.cache_dir, 0o700)?;

		let osv_dir = self.ctx.osv_dir(&template.target.os, &template.target.dist);
		let env_cfg = ChrootEnvConfig::load(&osv_dir, &self.os_cfg.chrootenv_config_file)?;
		template.essential_pkg_list = env_cfg.essential;
		self.env_packages = env_cfg.packages;
		Ok(false)
	}

	/// PREPARED -> DOWNLOADED: index fetch, closure resolution, parallel
	/// download, checksum verification.
	fn download(&mut self, template: &mut ImageTemplate) -> Result<Resolution> {
		self.transition(ChrootState::Downloaded)?;

		let index: RepoIndex = match self.os_cfg.pkg_type {
			PkgType::Deb => repo::deb::fetch_index(&self.client, &self.verifier, &self.repo)?,
			PkgType::Rpm => repo::rpm::fetch_index(&self.client, &self.verifier, &self.repo)?,
		};

		// essential first, then the chroot-env second stage, then the
		// template's own packages and kernel
		let mut requested: Vec<String> = Vec::new();
		requested.extend(template.essential_pkg_list.iter().cloned());
		requested.extend(self.env_packages.iter().cloned());
		requested.extend(template.system_config.packages.iter().cloned());
		requested.extend(template.system_config.kernel.packages.iter().cloned());

		let resolution = resolver::resolve(&requested, &index.packages)?;
		template.kernel_pkg_list = template
			.system_config
			.kernel
			.packages
			.iter()
			.map(|k| resolver::normalize(k))
			.collect();
		resolver::export_graph(&self.paths.cache_dir, &resolution);

		let mut jobs = Vec::with_capacity(resolution.order.len());
		for pkg in &resolution.order {
			jobs.push(DownloadJob {
				url: pkg.download_url(&self.repo.base_url)?,
				dest: self.paths.cache_dir.join(pkg.basename()),
			});
		}
		let paths = self.client.download_all(&jobs, self.ctx.tunables.download_workers)?;

		let results = self.verifier.verify_packages(
			&paths,
			&index.checksums,
			self.ctx.tunables.verify_workers,
			&self.cancel,
		);
		for result in results {
			if !result.ok {
				let err = result.error.unwrap_or(Error::NoChecksum(
					result.path.display().to_string(),
				));
				return Err(err).with_ctx(|| format!("verifying {}", result.path.display()));
			}
		}
		Ok(resolution)
	}

	/// DOWNLOADED -> INSTALLED, via the package-family strategy.
	fn install(&mut self, resolution: &Resolution) -> Result<()> {
		self.transition(ChrootState::Installed)?;
		self.strategy.install(&self.paths, &resolution.order)
	}

	/// INSTALLED -> FIXED: key imports and gpg-agent teardown.
	fn fixup(&mut self) -> Result<()> {
		self.transition(ChrootState::Fixed)?;
		self.strategy.fixup(&self.paths, &self.repo)
	}

	/// FIXED -> SNAPSHOTTED: unmount, verify clean, compress, delete.
	fn snapshot(&mut self) -> Result<()> {
		self.transition(ChrootState::Snapshotted)?;
		let root = &self.paths.root;
		self.mounts.umount_sysfs(root)?;
		self.mounts.clean_sysfs(root)?;

		let tarball = self.paths.tarball.display().to_string();
		let root_s = root.display().to_string();
		info!(%tarball, "compressing chroot environment");
		self.shell
			.exec_stream(&["tar", "-czf", &tarball, "-C", &root_s, "."], ExecOpts::sudo())?;
		std::fs::remove_dir_all(root).at(root)?;
		Ok(())
	}
}

/// RPM-family install: `rpm -i` into the root from the host, then a
/// database-backend reconciliation pass inside the chroot when host and
/// target rpm disagree.
pub struct RpmStrategy {
	pub shell: Shell,
	pub mounts: Arc<MountManager>,
}

impl RpmStrategy {
	fn install_one(&self, root: &str, pkg_file: &Path) -> Result<()> {
		let file = pkg_file.display().to_string();
		self.shell
			.exec_stream(
				&[
					"rpm", "-i", "-v", "--nodeps", "--noorder", "--force", "--root", root,
					"--define", "_dbpath /var/lib/rpm", &file,
				],
				ExecOpts::sudo(),
			)
			.with_ctx(|| format!("installing {}", pkg_file.display()))?;
		Ok(())
	}

	/// When the host rpm and the chroot rpm use different database
	/// backends the host-written db is useless inside the image: wipe
	/// it, re-init inside the chroot and replay every install with
	/// `--justdb` against the bind-mounted package cache.
	fn reconcile_rpmdb(&self, paths: &ChrootPaths, order: &[repo::PackageInfo]) -> Result<()> {
		let root = &paths.root;
		let host = self
			.shell
			.exec_silent(&["rpm", "-E", "%{_db_backend}"], ExecOpts::default())?
			.stdout
			.trim()
			.to_owned();
		let target = self
			.shell
			.exec_silent(&["rpm", "-E", "%{_db_backend}"], ExecOpts::in_chroot(root))?
			.stdout
			.trim()
			.to_owned();
		if host == target {
			debug!(backend = %host, "rpm db backends agree");
			return Ok(());
		}
		info!(%host, %target, "rpm db backends differ, rebuilding database inside chroot");

		let dbdir = root.join("var/lib/rpm");
		if dbdir.exists() {
			for entry in std::fs::read_dir(&dbdir).at(&dbdir)? {
				let entry = entry.at(&dbdir)?;
				let p = entry.path();
				if p.is_dir() {
					std::fs::remove_dir_all(&p).at(&p)?;
				} else {
					std::fs::remove_file(&p).at(&p)?;
				}
			}
		}
		self.shell.exec_silent(&["rpm", "--initdb"], ExecOpts::in_chroot(root))?;

		let pkgs_mount = root.join("packages");
		let cache = paths.cache_dir.display().to_string();
		self.mounts.mount(&cache, &pkgs_mount, &["--bind"])?;
		let replay = (|| -> Result<()> {
			for pkg in order {
				let inside = format!("/packages/{}", pkg.basename());
				self.shell
					.exec_silent(
						&[
							"rpm", "-i", "-v", "--nodeps", "--noorder", "--force", "--justdb",
							&inside,
						],
						ExecOpts::in_chroot(root),
					)
					.with_ctx(|| format!("registering {}", pkg.name))?;
			}
			Ok(())
		})();
		self.mounts.umount(&pkgs_mount)?;
		if pkgs_mount.exists() {
			std::fs::remove_dir_all(&pkgs_mount).ok();
		}
		replay
	}
}

impl InstallStrategy for RpmStrategy {
	fn install(&self, paths: &ChrootPaths, order: &[repo::PackageInfo]) -> Result<()> {
		let root = &paths.root;
		std::fs::create_dir_all(root.join("var/lib/rpm")).at(root)?;
		self.mounts.mount_sysfs(root)?;

		let root_s = root.display().to_string();
		info!(packages = order.len(), "installing rpm packages");
		for pkg in order {
			self.install_one(&root_s, &paths.cache_dir.join(pkg.basename()))?;
		}
		self.reconcile_rpmdb(paths, order)
	}

	fn fixup(&self, paths: &ChrootPaths, repo: &RepoConfig) -> Result<()> {
		let root = &paths.root;
		let root_s = root.display().to_string();

		if repo.public_gpg_key.is_some() {
			let key = paths.meta_dir().join("repo.key");
			if key.exists() {
				let key_s = key.display().to_string();
				self.shell
					.exec_silent(&["rpm", "--import", &key_s, "--root", &root_s], ExecOpts::sudo())
					.ctx("importing distro gpg key")?;
			} else {
				warn!(?key, "distro gpg key not cached, skipping import");
			}
		}
		kill_gpg_components(&self.shell, root);
		Ok(())
	}
}

/// DEB-family install: index the package cache as a flat APT repository,
/// bind-mount it where the bootstrap config expects it, and let
/// `mmdebstrap` assemble the tree.
pub struct DebStrategy {
	pub shell: Shell,
	pub mounts: Arc<MountManager>,
	pub suite: String,
	/// Host-side bind target the bootstrap repo config points at
	pub repo_mount: PathBuf,
}

const CACHE_REPO_MOUNT: &str = "/cdrom/cache-repo";

impl InstallStrategy for DebStrategy {
	fn install(&self, paths: &ChrootPaths, order: &[repo::PackageInfo]) -> Result<()> {
		let root = &paths.root;
		let cache = paths.cache_dir.display().to_string();

		// flat repo index over the cache
		let scan = self
			.shell
			.exec_silent(
				&["dpkg-scanpackages", "--multiversion", "."],
				ExecOpts::default().with_cwd(&paths.cache_dir),
			)
			.ctx("indexing package cache")?;
		crate::util::just_write(paths.cache_dir.join("Packages"), scan.stdout)?;
		self.shell
			.exec_silent(&["gzip", "-kf", "Packages"], ExecOpts::default().with_cwd(&paths.cache_dir))
			.ctx("compressing cache index")?;

		self.mounts.mount(&cache, &self.repo_mount, &["--bind"])?;

		let include: Vec<&str> = order.iter().map(|p| p.name.as_str()).collect();
		let include = format!("--include={}", include.join(","));
		let repo_line = format!("deb [trusted=yes] file://{} ./", self.repo_mount.display());
		let root_s = root.display().to_string();

		info!(packages = order.len(), "bootstrapping deb tree with mmdebstrap");
		let res = self
			.shell
			.exec_stream(
				&[
					"mmdebstrap",
					"--variant=custom",
					"--format=directory",
					&include,
					"--",
					&self.suite,
					&root_s,
					&repo_line,
				],
				ExecOpts::sudo(),
			)
			.ctx("mmdebstrap");

		self.mounts.umount(&self.repo_mount)?;
		res.map(|_| ())
	}

	fn fixup(&self, paths: &ChrootPaths, _repo: &RepoConfig) -> Result<()> {
		kill_gpg_components(&self.shell, &paths.root);
		Ok(())
	}
}

/// Stop any gpg components an install left running inside the chroot.
/// Unknown or already-dead components are not a failure.
fn kill_gpg_components(shell: &Shell, root: &Path) {
	match shell.exec_silent(&["gpgconf", "--list-components"], ExecOpts::in_chroot(root)) {
		Ok(out) => {
			for line in out.stdout.lines() {
				let Some(component) = line.split(':').next().filter(|c| !c.is_empty()) else {
					continue;
				};
				if let Err(e) = shell
					.exec_silent(&["gpgconf", "--kill", component], ExecOpts::in_chroot(root))
				{
					debug!(component, %e, "gpgconf --kill failed, ignoring");
				}
			}
		},
		Err(e) => debug!(%e, "gpgconf not usable in chroot, skipping"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		cfg::{OsArchConfig, RepoSection},
		context::{BuildContext, LogLevel, Tunables},
		exec::{CommandRunner, MockRunner},
	};

	fn test_os_cfg(pkg_type: PkgType) -> OsArchConfig {
		OsArchConfig {
			pkg_type,
			release_version: "3.0".into(),
			chrootenv_config_file: PathBuf::from("chrootenv.yml"),
			repo: RepoSection {
				base_url: "https://repo.example.com/base".into(),
				component: "main".into(),
				suite: "aria".into(),
				arch_alias: "x86_64".into(),
				public_gpg_key: None,
			},
		}
	}

	fn test_builder(
		tmp: &Path, pkg_type: PkgType,
	) -> (Arc<MockRunner>, ChrootBuilder) {
		let ctx = BuildContext::new(
			tmp.join("work"),
			tmp.join("cache"),
			tmp.join("tmp"),
			tmp.join("config"),
			Tunables::default(),
			LogLevel::Info,
		);
		let mock = Arc::new(MockRunner::new(vec![]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn CommandRunner>);
		let table = tmp.join("mounts");
		std::fs::write(&table, "").unwrap();
		let mounts = Arc::new(MountManager::with_table_path(shell.clone(), table));
		let builder = ChrootBuilder::new(
			ctx,
			shell,
			mounts,
			CancelToken::new(),
			"azure-linux-3.0-x86_64".into(),
			test_os_cfg(pkg_type),
		)
		.unwrap();
		(mock, builder)
	}

	fn test_template() -> ImageTemplate {
		serde_yaml::from_str(
			"\
image: {name: test, version: \"1\"}
target: {os: azure-linux, dist: \"3.0\", arch: x86_64, image_type: iso}
system_config:
  packages: [bash]
  bootloader: {provider: grub, boot_type: efi}
",
		)
		.unwrap()
	}

	#[test]
	fn tarball_shortcut_skips_everything() {
		let tmp = tempfile::tempdir().unwrap();
		let (mock, mut builder) = test_builder(tmp.path(), PkgType::Rpm);

		let tarball = builder.paths().tarball.clone();
		std::fs::create_dir_all(tarball.parent().unwrap()).unwrap();
		std::fs::write(&tarball, b"gzip").unwrap();

		let mut template = test_template();
		let outcome = builder.build(&mut template).unwrap();
		assert_eq!(outcome, BuildOutcome::Reused);
		// no downloads, no resolution, no verification, no mounts
		assert!(mock.lines().is_empty());
	}

	#[test]
	fn second_build_on_same_builder_is_a_state_violation() {
		let tmp = tempfile::tempdir().unwrap();
		let (_mock, mut builder) = test_builder(tmp.path(), PkgType::Rpm);
		let tarball = builder.paths().tarball.clone();
		std::fs::create_dir_all(tarball.parent().unwrap()).unwrap();
		std::fs::write(&tarball, b"gzip").unwrap();

		let mut template = test_template();
		builder.build(&mut template).unwrap();
		let err = builder.build(&mut template).unwrap_err();
		assert!(matches!(err.root(), Error::StateViolation { .. }));
	}

	#[test]
	fn illegal_transition_is_detected() {
		let tmp = tempfile::tempdir().unwrap();
		let (_mock, mut builder) = test_builder(tmp.path(), PkgType::Rpm);
		// jumping INIT -> INSTALLED must trip the table
		let err = builder.transition(ChrootState::Installed).unwrap_err();
		assert!(matches!(err, Error::StateViolation { from: "INIT", to: "INSTALLED" }));
	}

	#[test]
	fn rpm_strategy_installs_in_order_and_reconciles() {
		let tmp = tempfile::tempdir().unwrap();
		let mock = Arc::new(MockRunner::new(vec![
			// host and chroot disagree on the db backend
			crate::exec::MockRule::ok("chroot", ""),
			crate::exec::MockRule::ok("rpm -E", "bdb\n"),
		]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn CommandRunner>);
		let table = tmp.path().join("mounts");
		std::fs::write(&table, "").unwrap();
		let mounts = Arc::new(MountManager::with_table_path(shell.clone(), table));

		let paths = ChrootPaths {
			build_dir: tmp.path().join("build"),
			root: tmp.path().join("build/chroot"),
			tarball: tmp.path().join("build/chrootenv.tar.gz"),
			cache_dir: tmp.path().join("cache"),
		};
		std::fs::create_dir_all(&paths.cache_dir).unwrap();

		let order = vec![
			test_pkg("filesystem"),
			test_pkg("bash"),
		];
		let strategy = RpmStrategy { shell, mounts };
		strategy.install(&paths, &order).unwrap();

		let lines = mock.lines();
		let installs: Vec<&String> =
			lines.iter().filter(|l| l.contains("rpm -i -v --nodeps") && !l.contains("--justdb")).collect();
		assert_eq!(installs.len(), 2);
		assert!(installs[0].contains("filesystem"));
		assert!(installs[1].contains("bash"));
		// backend mismatch (host "bdb" vs chroot "" from the chroot rule)
		// forces the --justdb replay inside the chroot
		assert!(lines.iter().any(|l| l.contains("--justdb")));
		assert!(lines.iter().any(|l| l.contains("rpm --initdb")));
	}

	#[test]
	fn deb_strategy_builds_local_repo_and_runs_mmdebstrap() {
		let tmp = tempfile::tempdir().unwrap();
		let mock = Arc::new(MockRunner::new(vec![crate::exec::MockRule::ok(
			"dpkg-scanpackages",
			"Package: bash\n",
		)]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn CommandRunner>);
		let table = tmp.path().join("mounts");
		std::fs::write(&table, "").unwrap();
		let mounts = Arc::new(MountManager::with_table_path(shell.clone(), table));

		let paths = ChrootPaths {
			build_dir: tmp.path().join("build"),
			root: tmp.path().join("build/chroot"),
			tarball: tmp.path().join("build/chrootenv.tar.gz"),
			cache_dir: tmp.path().join("cache"),
		};
		std::fs::create_dir_all(&paths.cache_dir).unwrap();

		let order = vec![test_pkg("bash"), test_pkg("dash")];
		let strategy = DebStrategy {
			shell,
			mounts,
			suite: "aria".into(),
			repo_mount: tmp.path().join("cdrom/cache-repo"),
		};
		strategy.install(&paths, &order).unwrap();

		assert_eq!(
			std::fs::read_to_string(paths.cache_dir.join("Packages")).unwrap(),
			"Package: bash\n"
		);
		let lines = mock.lines();
		let mm = lines.iter().find(|l| l.contains("mmdebstrap")).unwrap();
		assert!(mm.contains("--variant=custom"));
		assert!(mm.contains("--include=bash,dash"));
		assert!(mm.contains("aria"));
	}

	fn test_pkg(name: &str) -> repo::PackageInfo {
		repo::PackageInfo {
			name: name.into(),
			pkg_type: PkgType::Rpm,
			version: "1.0".into(),
			arch: "x86_64".into(),
			origin: String::new(),
			license: String::new(),
			description: String::new(),
			url: format!("Packages/{name}-1.0.rpm"),
			provides: vec![],
			requires: vec![],
			requires_ver: vec![],
			files: None,
		}
	}
}
