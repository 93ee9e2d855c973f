use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::sched;

#[derive(Debug, Clone)]
pub struct Config {
	/// Where the dealer listens. `/servers` is meant to be reachable by
	/// anyone; the mutating endpoints gate on the peer address instead.
	pub bind: SocketAddr,
	/// Path of the sqlite checkpoint file.
	pub db_path: PathBuf,
	/// Directory holding the seed CSV lists, if any.
	pub seed_dir: Option<PathBuf>,
	/// Default seconds between probes of the same group; workers may ask
	/// for a different cadence per request.
	pub monitor_frequency: u64,
	/// How often the listing is rebuilt and the store checkpointed.
	pub refresh_interval: Duration,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			bind: SocketAddr::from(([0, 0, 0, 0], 8000)),
			db_path: PathBuf::from("monitor.sqlite3"),
			seed_dir: None,
			monitor_frequency: sched::MONITOR_FREQUENCY,
			refresh_interval: Duration::from_secs(60),
		}
	}
}

/// Build a config from the environment, falling back to defaults. The
/// binary applies flag overrides on top of this.
pub fn parse_config() -> anyhow::Result<Config> {
	let defaults = Config::default();
	Ok(Config {
		bind: parse("ROSTER_BIND")?.unwrap_or(defaults.bind),
		db_path: parse("ROSTER_DB")?.unwrap_or(defaults.db_path),
		seed_dir: parse("ROSTER_SEED_DIR")?,
		monitor_frequency: parse("ROSTER_MONITOR_FREQUENCY")?.unwrap_or(defaults.monitor_frequency),
		refresh_interval: parse("ROSTER_REFRESH_SECS")?
			.map(Duration::from_secs)
			.unwrap_or(defaults.refresh_interval),
	})
}

fn parse<T: FromStr>(env_name: &str) -> anyhow::Result<Option<T>>
where
	T::Err: Display,
{
	match env::var(env_name) {
		Ok(val) if !val.is_empty() => val
			.parse::<T>()
			.map(Some)
			.map_err(|err| anyhow::anyhow!("invalid env var {env_name}={val}: {err}")),
		_ => Ok(None),
	}
	.with_context(|| format!("parsing {env_name}"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let config = Config::default();
		assert_eq!(config.monitor_frequency, 3600);
		assert_eq!(config.refresh_interval, Duration::from_secs(60));
		assert_eq!(config.bind.port(), 8000);
	}
}
