//! Progress reporting as a message-consuming sink.
//!
//! Workers emit completion events into a bounded channel; a dedicated
//! thread owns the `indicatif` bar and is the only thing that touches
//! the terminal. Dropping the sink closes the channel and joins the
//! drawer, so cancellation tears the display down cleanly.

use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::debug;

const CHANNEL_CAP: usize = 256;

#[derive(Debug, Clone)]
pub enum ProgressEvent {
	Completed { label: String, ok: bool },
}

#[derive(Debug)]
pub struct ProgressSink {
	tx: Option<Sender<ProgressEvent>>,
	drawer: Option<JoinHandle<()>>,
}

impl ProgressSink {
	/// A sink drawing a bar sized for `total` items.
	#[must_use]
	pub fn new(total: u64, message: &str) -> Self {
		let (tx, rx) = bounded::<ProgressEvent>(CHANNEL_CAP);
		let message = message.to_owned();
		let drawer = std::thread::spawn(move || {
			let bar = ProgressBar::new(total);
			bar.set_message(message);
			if let Ok(style) =
				ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({elapsed})")
			{
				bar.set_style(style);
			}
			for event in rx {
				match event {
					ProgressEvent::Completed { label, ok } => {
						if !ok {
							debug!(label, "item failed");
						}
						bar.inc(1);
					},
				}
			}
			bar.finish_and_clear();
		});
		Self { tx: Some(tx), drawer: Some(drawer) }
	}

	/// A sink that swallows everything; used in tests and quiet paths.
	#[must_use]
	pub fn disabled() -> Self {
		Self { tx: None, drawer: None }
	}

	/// Emit a completion event. Blocks when the drawer is behind, which
	/// is the backpressure the worker pools are sized against.
	pub fn completed(&self, label: impl Into<String>, ok: bool) {
		if let Some(tx) = &self.tx {
			tx.send(ProgressEvent::Completed { label: label.into(), ok }).ok();
		}
	}

	/// Close the channel and wait for the drawer to finish.
	pub fn finish(&mut self) {
		self.tx.take();
		if let Some(handle) = self.drawer.take() {
			handle.join().ok();
		}
	}
}

impl Drop for ProgressSink {
	fn drop(&mut self) {
		self.finish();
	}
}
