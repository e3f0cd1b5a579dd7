//! External command execution.
//!
//! Everything that shells out goes through [`Shell`], which wraps a
//! [`CommandRunner`] capability value. The real runner resolves command
//! names against a table of well-known paths, handles sudo/chroot
//! prefixing, captures or streams output, and tears children down on
//! cancellation. Tests substitute [`MockRunner`] with ordered
//! `{pattern, stdout, err}` rules.

use std::{
	io::{BufRead, BufReader, Write},
	path::{Path, PathBuf},
	process::{Command, Stdio},
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use tracing::{debug, info, trace, warn};

use crate::{
	context::CancelToken,
	errors::{Error, Result},
	util::tail_lines,
};

/// Canonical locations for the tools the pipeline is allowed to invoke.
const WELL_KNOWN: &[(&str, &str)] = &[
	("apt-get", "/usr/bin/apt-get"),
	("chmod", "/usr/bin/chmod"),
	("chroot", "/usr/sbin/chroot"),
	("cp", "/usr/bin/cp"),
	("createrepo_c", "/usr/bin/createrepo_c"),
	("dpkg", "/usr/bin/dpkg"),
	("dpkg-scanpackages", "/usr/bin/dpkg-scanpackages"),
	("echo", "/usr/bin/echo"),
	("gpgconf", "/usr/bin/gpgconf"),
	("gzip", "/usr/bin/gzip"),
	("ls", "/usr/bin/ls"),
	("lsb_release", "/usr/bin/lsb_release"),
	("mkdir", "/usr/bin/mkdir"),
	("mmdebstrap", "/usr/bin/mmdebstrap"),
	("mount", "/usr/bin/mount"),
	("rm", "/usr/bin/rm"),
	("rpm", "/usr/bin/rpm"),
	("sbsign", "/usr/bin/sbsign"),
	("sed", "/usr/bin/sed"),
	("systemctl", "/usr/bin/systemctl"),
	("tar", "/usr/bin/tar"),
	("tdnf", "/usr/bin/tdnf"),
	("umount", "/usr/bin/umount"),
	("uname", "/usr/bin/uname"),
];

const STREAM_TAIL_LINES: usize = 200;
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Environment passed through to every child unchanged.
const PROXY_VARS: &[&str] = &["http_proxy", "https_proxy", "no_proxy"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
	/// Buffered capture, stdout logged at info on completion
	#[default]
	Capture,
	/// Buffered capture, no info logging
	CaptureSilent,
	/// Stream lines to the logger, keep a bounded tail
	Stream,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
	pub sudo: bool,
	pub chroot: Option<PathBuf>,
	pub env: Vec<(String, String)>,
	pub cwd: Option<PathBuf>,
}

impl ExecOpts {
	#[must_use]
	pub fn sudo() -> Self {
		Self { sudo: true, ..Self::default() }
	}

	#[must_use]
	pub fn in_chroot(root: impl Into<PathBuf>) -> Self {
		Self { chroot: Some(root.into()), ..Self::default() }
	}

	#[must_use]
	pub fn with_env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
		self.env.push((key.into(), val.into()));
		self
	}

	#[must_use]
	pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
	pub argv: Vec<String>,
	pub opts: ExecOpts,
	pub stdin: Option<Vec<u8>>,
	pub mode: OutputMode,
}

impl ExecRequest {
	/// The logical command line, including sudo/chroot prefixes. Used for
	/// logging and for mock-rule matching.
	#[must_use]
	pub fn display_line(&self) -> String {
		let mut parts = Vec::new();
		if self.opts.sudo {
			parts.push("sudo".to_owned());
		}
		if let Some(root) = &self.opts.chroot {
			parts.push("chroot".to_owned());
			parts.push(root.display().to_string());
		}
		parts.extend(self.argv.iter().cloned());
		parts.join(" ")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
	pub stdout: String,
	pub stderr: String,
}

pub trait CommandRunner: Send + Sync {
	/// # Errors
	/// `CommandResolutionError` when the tool is unknown or absent,
	/// `ExecError` on non-zero exit, `Cancelled` when torn down.
	fn run(&self, req: &ExecRequest) -> Result<ExecOutput>;
}

/// Resolve `name` to its canonical path, checking existence on the host
/// or inside `chroot`.
fn resolve_command(name: &str, chroot: Option<&Path>) -> Result<String> {
	// explicit paths (hook scripts, helpers written into the tree) are
	// taken as-is after an existence check
	if name.contains('/') {
		let exists = chroot.map_or_else(
			|| Path::new(name).exists(),
			|root| root.join(name.trim_start_matches('/')).exists(),
		);
		if exists {
			return Ok(name.to_owned());
		}
		return Err(Error::CommandResolution {
			cmd: name.to_owned(),
			detail: "path does not exist".to_owned(),
		});
	}

	let table_hit = WELL_KNOWN.iter().find(|(n, _)| *n == name).map(|(_, p)| (*p).to_owned());

	if let Some(root) = chroot {
		let path = table_hit.ok_or_else(|| Error::CommandResolution {
			cmd: name.to_owned(),
			detail: "not a well-known command".to_owned(),
		})?;
		let inside = root.join(path.trim_start_matches('/'));
		if !inside.exists() {
			return Err(Error::CommandResolution {
				cmd: name.to_owned(),
				detail: format!("{path} not present inside chroot {}", root.display()),
			});
		}
		return Ok(path);
	}

	if let Some(path) = table_hit {
		if Path::new(&path).exists() {
			return Ok(path);
		}
	}
	// Fall back to a PATH lookup for hosts with non-standard layouts.
	which::which(name).map(|p| p.display().to_string()).map_err(|e| Error::CommandResolution {
		cmd: name.to_owned(),
		detail: e.to_string(),
	})
}

/// Runs real processes. The only place in the crate that spawns.
#[derive(Debug, Clone, Default)]
pub struct RealRunner {
	cancel: CancelToken,
}

impl RealRunner {
	#[must_use]
	pub fn new(cancel: CancelToken) -> Self {
		Self { cancel }
	}

	fn build_command(req: &ExecRequest) -> Result<(Command, String)> {
		let Some(name) = req.argv.first() else {
			return Err(Error::CommandResolution {
				cmd: String::new(),
				detail: "empty argv".to_owned(),
			});
		};
		let resolved = resolve_command(name, req.opts.chroot.as_deref())?;

		let mut full: Vec<String> = Vec::new();
		if req.opts.sudo {
			full.push(resolve_command("sudo", None).unwrap_or_else(|_| "sudo".to_owned()));
			// sudo scrubs the environment, so assignments ride on the argv
			for (k, v) in &req.opts.env {
				full.push(format!("{k}={v}"));
			}
			for var in PROXY_VARS {
				if let Some(v) = std::env::var_os(var) {
					full.push(format!("{var}={}", v.to_string_lossy()));
				}
			}
		}
		if let Some(root) = &req.opts.chroot {
			full.push(resolve_command("chroot", None)?);
			full.push(root.display().to_string());
		}
		full.push(resolved);
		full.extend(req.argv.iter().skip(1).cloned());

		let line = full.join(" ");
		let mut cmd = Command::new(&full[0]);
		cmd.args(&full[1..]);
		if !req.opts.sudo {
			cmd.envs(req.opts.env.iter().map(|(k, v)| (k.clone(), v.clone())));
		}
		if let Some(cwd) = &req.opts.cwd {
			cmd.current_dir(cwd);
		}
		Ok((cmd, line))
	}

	fn terminate(child: &mut std::process::Child) {
		use nix::sys::signal::{kill, Signal};
		use nix::unistd::Pid;

		let Ok(raw) = i32::try_from(child.id()) else { return };
		let pid = Pid::from_raw(raw);
		if kill(pid, Signal::SIGTERM).is_err() {
			return;
		}
		let deadline = Instant::now() + TERM_GRACE;
		while Instant::now() < deadline {
			if matches!(child.try_wait(), Ok(Some(_))) {
				return;
			}
			std::thread::sleep(Duration::from_millis(50));
		}
		warn!(?pid, "child ignored SIGTERM, escalating to SIGKILL");
		kill(pid, Signal::SIGKILL).ok();
		child.wait().ok();
	}
}

fn reader_thread(
	stream: impl std::io::Read + Send + 'static, stream_mode: bool, is_stderr: bool,
) -> std::thread::JoinHandle<String> {
	std::thread::spawn(move || {
		let mut lines: Vec<String> = Vec::new();
		for line in BufReader::new(stream).lines() {
			let Ok(line) = line else { break };
			if stream_mode {
				if is_stderr {
					debug!(target: "bento::exec", "{line}");
				} else {
					info!(target: "bento::exec", "{line}");
				}
				if lines.len() >= STREAM_TAIL_LINES {
					lines.remove(0);
				}
			}
			lines.push(line);
		}
		lines.join("\n")
	})
}

impl CommandRunner for RealRunner {
	fn run(&self, req: &ExecRequest) -> Result<ExecOutput> {
		self.cancel.checkpoint()?;
		let (mut cmd, line) = Self::build_command(req)?;
		trace!(cmd = %line, "spawning");

		cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
		cmd.stdin(if req.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

		let mut child = cmd.spawn().map_err(|e| Error::Exec {
			cmd: line.clone(),
			code: None,
			stderr: e.to_string(),
		})?;

		if let (Some(input), Some(mut pipe)) = (req.stdin.clone(), child.stdin.take()) {
			std::thread::spawn(move || {
				pipe.write_all(&input).ok();
			});
		}

		let streaming = req.mode == OutputMode::Stream;
		let out_handle = child.stdout.take().map(|s| reader_thread(s, streaming, false));
		let err_handle = child.stderr.take().map(|s| reader_thread(s, streaming, true));

		let status = loop {
			match child.try_wait() {
				Ok(Some(status)) => break status,
				Ok(None) => {
					if self.cancel.is_cancelled() {
						Self::terminate(&mut child);
						return Err(Error::Cancelled);
					}
					std::thread::sleep(Duration::from_millis(50));
				},
				Err(e) => {
					return Err(Error::Exec { cmd: line, code: None, stderr: e.to_string() })
				},
			}
		};

		let stdout = out_handle.and_then(|h| h.join().ok()).unwrap_or_default();
		let stderr = err_handle.and_then(|h| h.join().ok()).unwrap_or_default();

		if req.mode == OutputMode::Capture && !stdout.is_empty() {
			info!(cmd = %line, "{stdout}");
		}

		if status.success() {
			Ok(ExecOutput { stdout, stderr })
		} else {
			Err(Error::Exec { cmd: line, code: status.code(), stderr: tail_lines(&stderr, 20) })
		}
	}
}

/// One substitution rule for [`MockRunner`].
#[derive(Debug, Clone)]
pub struct MockRule {
	/// Substring matched against the logical command line
	pub pattern: String,
	pub stdout: String,
	pub err: Option<String>,
}

impl MockRule {
	#[must_use]
	pub fn ok(pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
		Self { pattern: pattern.into(), stdout: stdout.into(), err: None }
	}

	#[must_use]
	pub fn fail(pattern: impl Into<String>, err: impl Into<String>) -> Self {
		Self { pattern: pattern.into(), stdout: String::new(), err: Some(err.into()) }
	}
}

/// Test double: first matching rule wins, unmatched commands succeed with
/// empty output. Records every request for inspection.
#[derive(Debug, Default)]
pub struct MockRunner {
	rules: Vec<MockRule>,
	calls: Mutex<Vec<ExecRequest>>,
}

impl MockRunner {
	#[must_use]
	pub fn new(rules: Vec<MockRule>) -> Self {
		Self { rules, calls: Mutex::new(Vec::new()) }
	}

	/// Logical command lines of everything run so far.
	#[must_use]
	pub fn lines(&self) -> Vec<String> {
		self.calls.lock().map_or_else(|_| Vec::new(), |c| c.iter().map(ExecRequest::display_line).collect())
	}

	#[must_use]
	pub fn requests(&self) -> Vec<ExecRequest> {
		self.calls.lock().map_or_else(|_| Vec::new(), |c| c.clone())
	}
}

impl CommandRunner for MockRunner {
	fn run(&self, req: &ExecRequest) -> Result<ExecOutput> {
		let line = req.display_line();
		if let Ok(mut calls) = self.calls.lock() {
			calls.push(req.clone());
		}
		for rule in &self.rules {
			if line.contains(&rule.pattern) {
				return match &rule.err {
					None => Ok(ExecOutput { stdout: rule.stdout.clone(), stderr: String::new() }),
					Some(e) => {
						Err(Error::Exec { cmd: line, code: Some(1), stderr: e.clone() })
					},
				};
			}
		}
		Ok(ExecOutput::default())
	}
}

/// The capability handed to every component that needs to run a tool.
#[derive(Clone)]
pub struct Shell {
	runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Shell {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str("Shell")
	}
}

impl Shell {
	#[must_use]
	pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
		Self { runner }
	}

	#[must_use]
	pub fn real(cancel: CancelToken) -> Self {
		Self::new(Arc::new(RealRunner::new(cancel)))
	}

	fn run(&self, argv: &[&str], opts: ExecOpts, stdin: Option<Vec<u8>>, mode: OutputMode) -> Result<ExecOutput> {
		let req = ExecRequest {
			argv: argv.iter().map(|s| (*s).to_owned()).collect(),
			opts,
			stdin,
			mode,
		};
		self.runner.run(&req)
	}

	/// Buffered capture; stdout is logged at info.
	///
	/// # Errors
	/// See [`CommandRunner::run`].
	pub fn exec(&self, argv: &[&str], opts: ExecOpts) -> Result<ExecOutput> {
		self.run(argv, opts, None, OutputMode::Capture)
	}

	/// Buffered capture without the info logging.
	///
	/// # Errors
	/// See [`CommandRunner::run`].
	pub fn exec_silent(&self, argv: &[&str], opts: ExecOpts) -> Result<ExecOutput> {
		self.run(argv, opts, None, OutputMode::CaptureSilent)
	}

	/// Stream output to the logger, returning a bounded tail.
	///
	/// # Errors
	/// See [`CommandRunner::run`].
	pub fn exec_stream(&self, argv: &[&str], opts: ExecOpts) -> Result<ExecOutput> {
		self.run(argv, opts, None, OutputMode::Stream)
	}

	/// Pipe `stdin` into the process.
	///
	/// # Errors
	/// See [`CommandRunner::run`].
	pub fn exec_with_input(&self, stdin: Vec<u8>, argv: &[&str], opts: ExecOpts) -> Result<ExecOutput> {
		self.run(argv, opts, Some(stdin), OutputMode::Capture)
	}

	/// Host machine architecture, via `uname -m`.
	///
	/// # Errors
	/// Fails when `uname` cannot be run.
	pub fn host_arch(&self) -> Result<String> {
		let out = self.exec_silent(&["uname", "-m"], ExecOpts::default())?;
		Ok(out.stdout.trim().to_owned())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn display_line_prefixes() {
		let req = ExecRequest {
			argv: vec!["rpm".into(), "-i".into()],
			opts: ExecOpts { sudo: true, chroot: Some("/x".into()), env: vec![], cwd: None },
			stdin: None,
			mode: OutputMode::Capture,
		};
		assert_eq!(req.display_line(), "sudo chroot /x rpm -i");
	}

	#[test]
	fn mock_first_match_wins() {
		let mock = MockRunner::new(vec![
			MockRule::ok("rpm -E", "sqlite\n"),
			MockRule::fail("rpm", "boom"),
		]);
		let shell = Shell::new(Arc::new(mock));
		let out = shell.exec(&["rpm", "-E", "%{_db_backend}"], ExecOpts::default()).unwrap();
		assert_eq!(out.stdout, "sqlite\n");
		assert!(shell.exec(&["rpm", "-i", "a.rpm"], ExecOpts::default()).is_err());
	}

	#[test]
	fn mock_unmatched_succeeds_and_records() {
		let mock = Arc::new(MockRunner::new(vec![]));
		let shell = Shell::new(Arc::<MockRunner>::clone(&mock));
		shell.exec(&["mount", "-t", "proc", "proc", "/x/proc"], ExecOpts::sudo()).unwrap();
		let lines = mock.lines();
		assert_eq!(lines, vec!["sudo mount -t proc proc /x/proc"]);
	}

	#[test]
	fn resolve_unknown_in_chroot_fails() {
		let err = resolve_command("frobnicate", Some(Path::new("/nonexistent"))).unwrap_err();
		assert!(matches!(err, Error::CommandResolution { .. }));
	}
}
