#![warn(clippy::complexity)]
#![warn(clippy::correctness)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![warn(clippy::perf)]
#![warn(clippy::style)]
#![warn(clippy::suspicious)]
// followings are from clippy::restriction
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::format_push_string)]
#![warn(clippy::get_unwrap)]
#![allow(clippy::missing_inline_in_public_items)]
#![allow(clippy::implicit_return)]
#![allow(clippy::blanket_clippy_restriction_lints)]
#![allow(clippy::pattern_type_mismatch)]

mod cfg;
mod chroot;
mod context;
mod errors;
mod exec;
mod mount;
mod overlay;
mod progress;
mod provider;
mod repo;
mod resolver;
mod util;
mod verify;

use std::{path::PathBuf, sync::Arc};

use clap::{value_parser, Parser};
use color_eyre::Result;
use tracing::{info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::{
	cfg::ImageTemplate,
	context::{BuildContext, CancelToken, LogLevel, Tunables},
	exec::Shell,
	mount::MountManager,
	provider::{ProviderDeps, ProviderRegistry},
};

const WORK_DIR: &str = "bento-work";
const CACHE_DIR: &str = "bento-cache";

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct BentoCli {
	/// Image template location
	#[arg(long)]
	config: PathBuf,

	/// Root of the bundled per-OS configuration directory
	#[arg(long)]
	repo: PathBuf,

	#[arg(long, value_parser = value_parser!(LogLevel))]
	log_level: Option<LogLevel>,
}

fn main() -> Result<()> {
	if let Err(e) = dotenvy::dotenv() {
		if !e.not_found() {
			return Err(e.into());
		}
	}

	color_eyre::install()?;

	let cli = BentoCli::parse();
	let level = cli.log_level.unwrap_or(LogLevel::Info);

	// default to the CLI level, override with BENTO_LOG env var
	let filter =
		EnvFilter::try_from_env("BENTO_LOG").unwrap_or_else(|_| EnvFilter::new(level.as_filter()));
	let fmtlyr = fmt::layer().pretty().with_filter(filter);
	let subscriber = Registry::default().with(tracing_error::ErrorLayer::default()).with(fmtlyr);
	tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

	sudo::escalate_if_needed().expect("Fail to run sudo");

	let work_dir =
		crate::env_flag!("BENTO_WORK_DIR").map_or_else(|| PathBuf::from(WORK_DIR), PathBuf::from);
	let cache_dir =
		crate::env_flag!("BENTO_CACHE_DIR").map_or_else(|| PathBuf::from(CACHE_DIR), PathBuf::from);
	let temp_dir = std::env::temp_dir().join("bento");

	let ctx = BuildContext::new(
		work_dir,
		cache_dir,
		temp_dir,
		cli.repo.clone(),
		Tunables::from_env(),
		level,
	);

	let mut template = ImageTemplate::load(&cli.config)?;
	trace!(?template, "Loaded image template");

	let cancel = CancelToken::new();
	let shell = Shell::real(cancel.clone());
	let mounts = Arc::new(MountManager::new(shell.clone()));
	let deps = ProviderDeps { ctx: Arc::clone(&ctx), shell, mounts, cancel };

	let mut registry = ProviderRegistry::with_defaults(&deps);
	let id = template.target.provider_id();
	let mut provider = registry.take(&id)?;

	info!(provider = %id, "Building image");
	provider::dispatch(provider.as_mut(), &mut template)?;

	info!("Build finished");
	Ok(())
}
