use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rosterd", about = "Infrastructure server monitoring dealer")]
struct Args {
	/// Listen address for the API.
	#[arg(long, env = "ROSTER_BIND")]
	bind: Option<SocketAddr>,

	/// Path of the sqlite checkpoint file.
	#[arg(long, env = "ROSTER_DB")]
	db: Option<PathBuf>,

	/// Directory holding the seed CSV lists.
	#[arg(long = "seed-dir", env = "ROSTER_SEED_DIR")]
	seed_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let args = Args::parse();
	let mut config = roster::parse_config()?;
	if let Some(bind) = args.bind {
		config.bind = bind;
	}
	if let Some(db) = args.db {
		config.db_path = db;
	}
	if let Some(seed_dir) = args.seed_dir {
		config.seed_dir = Some(seed_dir);
	}
	info!(bind = %config.bind, db = %config.db_path.display(), "starting dealer");

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			roster::app::run(Arc::new(config))
				.await?
				.wait_termination()
				.await
		})
}
