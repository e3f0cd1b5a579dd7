//! Mount lifecycle for the chroot's pseudo-filesystems.
//!
//! Mounting is idempotent against the kernel mount table, unmounting
//! escalates through lazy and forced variants, and `clean_sysfs` is the
//! authoritative check that nothing is left behind before the scratch
//! root is deleted.

use std::{
	collections::HashSet,
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use tracing::{debug, trace, warn};

use crate::{
	errors::{Error, IoResultExt, Result},
	exec::{ExecOpts, Shell},
};

/// The pseudo-filesystems managed under a chroot root, in mount order.
const SYSFS_MOUNTS: &[(&str, &str, &[&str])] = &[
	("proc", "proc", &["-t", "proc"]),
	("sysfs", "sys", &["-t", "sysfs", "-o", "nosuid,noexec,nodev"]),
	("devtmpfs", "dev", &["-t", "devtmpfs", "-o", "mode=0700,nosuid"]),
	("devpts", "dev/pts", &["-t", "devpts", "-o", "gid=5,mode=620"]),
	("tmpfs", "dev/shm", &["-t", "tmpfs", "-o", "nosuid,nodev"]),
	("tmpfs", "run", &["-t", "tmpfs", "-o", "nosuid,nodev,noexec"]),
];

/// Unmount escalation ladder: plain, lazy, force, lazy+force.
const UMOUNT_STAGES: &[&[&str]] = &[&[], &["-l"], &["-f"], &["-lf"]];

#[derive(Debug)]
pub struct MountManager {
	shell: Shell,
	table_path: PathBuf,
	/// Mounts performed by this process and not yet unmounted
	performed: Mutex<HashSet<PathBuf>>,
	/// Serializes mount-table mutations; held across one syscall only
	lock: Mutex<()>,
}

impl MountManager {
	#[must_use]
	pub fn new(shell: Shell) -> Self {
		Self::with_table_path(shell, PathBuf::from("/proc/self/mounts"))
	}

	#[must_use]
	pub fn with_table_path(shell: Shell, table_path: PathBuf) -> Self {
		Self { shell, table_path, performed: Mutex::new(HashSet::new()), lock: Mutex::new(()) }
	}

	/// Every mount target currently listed in the mount table.
	///
	/// # Errors
	/// Fails when the mount table cannot be read.
	pub fn list_mounts(&self) -> Result<Vec<PathBuf>> {
		let table = std::fs::read_to_string(&self.table_path).at(&self.table_path)?;
		let mut out = Vec::new();
		for line in table.lines() {
			if let Some(target) = line.split_whitespace().nth(1) {
				out.push(PathBuf::from(unescape_mount_field(target)));
			}
		}
		if let Ok(performed) = self.performed.lock() {
			for p in performed.iter() {
				if !out.contains(p) {
					out.push(p.clone());
				}
			}
		}
		Ok(out)
	}

	/// Mount targets at or below `root`, deepest first.
	///
	/// # Errors
	/// Fails when the mount table cannot be read.
	pub fn list_submounts(&self, root: &Path) -> Result<Vec<PathBuf>> {
		let mut subs: Vec<PathBuf> =
			self.list_mounts()?.into_iter().filter(|m| m.starts_with(root)).collect();
		subs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
		Ok(subs)
	}

	/// # Errors
	/// Fails when the mount table cannot be read.
	pub fn is_mounted(&self, target: &Path) -> Result<bool> {
		Ok(self.list_mounts()?.contains(&target.to_path_buf()))
	}

	/// Idempotent mount: a target already in the mount table is left
	/// alone. `flags` are passed to the platform mount verbatim.
	///
	/// # Errors
	/// `MountError` when the platform mount fails.
	pub fn mount(&self, src: &str, target: &Path, flags: &[&str]) -> Result<()> {
		if self.is_mounted(target)? {
			trace!(?target, "already mounted, skipping");
			return Ok(());
		}
		std::fs::create_dir_all(target).at(target)?;
		if !target.is_dir() {
			return Err(Error::Mount { path: target.to_path_buf(), stage: "target is not a directory".to_owned() });
		}

		let target_s = target.display().to_string();
		let mut argv = vec!["mount"];
		argv.extend_from_slice(flags);
		argv.push(src);
		argv.push(&target_s);

		let guard = self.lock.lock();
		let res = self.shell.exec_silent(&argv, ExecOpts::sudo());
		drop(guard);

		res.map_err(|e| Error::Mount { path: target.to_path_buf(), stage: format!("mount failed: {e}") })?;
		if let Ok(mut performed) = self.performed.lock() {
			performed.insert(target.to_path_buf());
		}
		debug!(src, ?target, ?flags, "mounted");
		Ok(())
	}

	/// Unmount with escalation. Exhaustion of all stages logs a warning
	/// and still returns ok; `clean_sysfs` is the authoritative check.
	///
	/// # Errors
	/// Currently never; the signature leaves room for table read failures.
	pub fn umount(&self, target: &Path) -> Result<()> {
		let target_s = target.display().to_string();
		for stages in UMOUNT_STAGES {
			let mut argv = vec!["umount"];
			argv.extend_from_slice(stages);
			argv.push(&target_s);

			let guard = self.lock.lock();
			let res = self.shell.exec_silent(&argv, ExecOpts::sudo());
			drop(guard);

			match res {
				Ok(_) => {
					if let Ok(mut performed) = self.performed.lock() {
						performed.remove(target);
					}
					trace!(?target, ?stages, "unmounted");
					return Ok(());
				},
				Err(e) => {
					let msg = e.to_string();
					if msg.contains("not mounted") || msg.contains("not found") {
						debug!(?target, "not mounted, nothing to do");
						if let Ok(mut performed) = self.performed.lock() {
							performed.remove(target);
						}
						return Ok(());
					}
					debug!(?target, ?stages, %e, "umount stage failed, escalating");
				},
			}
		}
		warn!(?target, "all umount stages exhausted, leaving for cleanup check");
		Ok(())
	}

	/// # Errors
	/// Fails when the target cannot be deleted.
	pub fn umount_and_delete(&self, target: &Path) -> Result<()> {
		self.umount(target)?;
		if target.exists() {
			std::fs::remove_dir_all(target).at(target)?;
		}
		Ok(())
	}

	/// Mount proc, sys, dev, dev/pts, dev/shm and run under `root`.
	///
	/// # Errors
	/// Fails on the first mount that cannot be established.
	pub fn mount_sysfs(&self, root: &Path) -> Result<()> {
		for (src, rel, flags) in SYSFS_MOUNTS {
			let target = root.join(rel);
			self.mount(src, &target, flags)?;
			if *rel == "dev" {
				let dev = target.display().to_string();
				self.shell
					.exec_silent(&["chmod", "1700", &dev], ExecOpts::sudo())
					.map_err(|e| Error::Mount { path: target.clone(), stage: format!("chmod: {e}") })?;
			}
		}
		Ok(())
	}

	/// Unmount the pseudo-filesystems in strict reverse order. A missing
	/// mount is only worth a warning here.
	///
	/// # Errors
	/// See [`MountManager::umount`].
	pub fn umount_sysfs(&self, root: &Path) -> Result<()> {
		for (_, rel, _) in SYSFS_MOUNTS.iter().rev() {
			self.umount(&root.join(rel))?;
		}
		Ok(())
	}

	/// Delete the pseudo-filesystem directories, refusing while any of
	/// them is still mounted.
	///
	/// # Errors
	/// `MountError` when a residual mount remains.
	pub fn clean_sysfs(&self, root: &Path) -> Result<()> {
		for (_, rel, _) in SYSFS_MOUNTS.iter().rev() {
			let dir = root.join(rel);
			if self.is_mounted(&dir)? {
				return Err(Error::Mount { path: dir, stage: "still mounted after unmount".to_owned() });
			}
			if dir.exists() {
				std::fs::remove_dir_all(&dir).at(&dir)?;
			}
		}
		Ok(())
	}
}

/// Scoped ownership of a mounted chroot root: on drop, best-effort
/// unmount of everything below the root. Disarmed once the orchestrator
/// has taken the tree down cleanly itself.
#[derive(Debug)]
pub struct MountGuard {
	mgr: Arc<MountManager>,
	root: PathBuf,
	armed: bool,
	delete_root: bool,
}

impl MountGuard {
	#[must_use]
	pub fn new(mgr: Arc<MountManager>, root: PathBuf) -> Self {
		Self { mgr, root, armed: true, delete_root: false }
	}

	/// Also remove the root tree once the mounts are gone.
	#[must_use]
	pub fn deleting_root(mut self) -> Self {
		self.delete_root = true;
		self
	}

	pub fn disarm(&mut self) {
		self.armed = false;
	}
}

impl Drop for MountGuard {
	fn drop(&mut self) {
		if !self.armed {
			return;
		}
		warn!(root = ?self.root, "mount guard firing, unmounting leftovers");
		match self.mgr.list_submounts(&self.root) {
			Ok(subs) => {
				for sub in subs {
					self.mgr.umount(&sub).ok();
				}
			},
			Err(e) => warn!(?e, "cannot list submounts during guard teardown"),
		}
		self.mgr.umount_sysfs(&self.root).ok();
		if self.delete_root && self.root.exists() {
			if let Err(e) = std::fs::remove_dir_all(&self.root) {
				warn!(root = ?self.root, %e, "cannot remove scratch root");
			}
		}
	}
}

/// Mount table fields escape spaces as `\040` (and similar octal forms).
fn unescape_mount_field(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut chars = s.chars().peekable();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		let digits: String = chars.clone().take(3).collect();
		if digits.len() == 3 && digits.bytes().all(|b| b.is_ascii_digit()) {
			if let Ok(v) = u8::from_str_radix(&digits, 8) {
				out.push(v as char);
				chars.nth(2);
				continue;
			}
		}
		out.push(c);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::exec::{MockRunner, Shell};

	fn mock_manager(table: &str) -> (Arc<MockRunner>, MountManager, tempfile::TempDir) {
		let tmp = tempfile::tempdir().unwrap();
		let table_path = tmp.path().join("mounts");
		std::fs::write(&table_path, table).unwrap();
		let mock = Arc::new(MockRunner::new(vec![]));
		let shell = Shell::new(Arc::clone(&mock) as Arc<dyn crate::exec::CommandRunner>);
		(mock, MountManager::with_table_path(shell, table_path), tmp)
	}

	#[test]
	fn mount_skips_already_mounted_target() {
		let (mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");
		let target = root.join("proc");
		std::fs::create_dir_all(&target).unwrap();
		std::fs::write(
			mgr.table_path.clone(),
			format!("proc {} proc rw 0 0\n", target.display()),
		)
		.unwrap();

		mgr.mount("proc", &target, &["-t", "proc"]).unwrap();
		assert!(mock.lines().is_empty());
	}

	#[test]
	fn double_mount_issues_one_mount_call() {
		let (mock, mgr, tmp) = mock_manager("");
		let target = tmp.path().join("chroot/proc");

		mgr.mount("proc", &target, &["-t", "proc"]).unwrap();
		mgr.mount("proc", &target, &["-t", "proc"]).unwrap();

		let mounts: Vec<_> = mock.lines().into_iter().filter(|l| l.contains("mount -t proc")).collect();
		assert_eq!(mounts.len(), 1);
	}

	#[test]
	fn mount_sysfs_twice_mounts_proc_once() {
		let (mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");

		mgr.mount_sysfs(&root).unwrap();
		mgr.mount_sysfs(&root).unwrap();

		let proc_mounts: Vec<_> = mock
			.lines()
			.into_iter()
			.filter(|l| l.starts_with("sudo mount -t proc"))
			.collect();
		assert_eq!(proc_mounts.len(), 1);
	}

	#[test]
	fn umount_sysfs_runs_in_reverse_order() {
		let (mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");
		mgr.umount_sysfs(&root).unwrap();

		let lines = mock.lines();
		let order: Vec<usize> = ["run", "dev/shm", "dev/pts", "dev", "sys", "proc"]
			.iter()
			.map(|rel| {
				let needle = root.join(rel).display().to_string();
				lines.iter().position(|l| l.ends_with(&needle)).unwrap()
			})
			.collect();
		let mut sorted = order.clone();
		sorted.sort_unstable();
		assert_eq!(order, sorted);
	}

	#[test]
	fn clean_sysfs_fails_on_residual_mount() {
		let (_mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");
		let proc_dir = root.join("proc");
		std::fs::create_dir_all(&proc_dir).unwrap();
		std::fs::write(
			mgr.table_path.clone(),
			format!("proc {} proc rw 0 0\n", proc_dir.display()),
		)
		.unwrap();

		let err = mgr.clean_sysfs(&root).unwrap_err();
		assert!(matches!(err, Error::Mount { .. }));
	}

	#[test]
	fn clean_sysfs_removes_directories() {
		let (_mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");
		for rel in ["proc", "sys", "dev/pts", "dev/shm", "run"] {
			std::fs::create_dir_all(root.join(rel)).unwrap();
		}
		mgr.clean_sysfs(&root).unwrap();
		for rel in ["proc", "sys", "dev", "run"] {
			assert!(!root.join(rel).exists(), "{rel} should be gone");
		}
	}

	#[test]
	fn submounts_sorted_deepest_first() {
		let (_mock, mgr, tmp) = mock_manager("");
		let root = tmp.path().join("chroot");
		std::fs::write(
			mgr.table_path.clone(),
			format!(
				"proc {r}/proc proc rw 0 0\ndevpts {r}/dev/pts devpts rw 0 0\ndevtmpfs {r}/dev devtmpfs rw 0 0\nsysfs /other sysfs rw 0 0\n",
				r = root.display()
			),
		)
		.unwrap();

		let subs = mgr.list_submounts(&root).unwrap();
		assert_eq!(subs[0], root.join("dev/pts"));
		assert_eq!(subs.len(), 3);
	}

	#[test]
	fn unescape_octal_space() {
		assert_eq!(unescape_mount_field("/mnt/with\\040space"), "/mnt/with space");
		assert_eq!(unescape_mount_field("/plain"), "/plain");
	}
}
