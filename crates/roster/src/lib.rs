//! roster: a dealer service that keeps a fleet of stateless workers probing
//! third-party STUN, TURN, MQTT and NTP servers, and publishes a ranked
//! catalogue of the most reliable candidates.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod addr;
pub mod app;
pub mod catalogue;
pub mod config;
pub mod http;
pub mod sched;
pub mod seed;
pub mod snapshot;
pub mod store;
pub mod types;

pub use config::{Config, parse_config};

/// Wall clock as unix seconds; the dealer's native time unit.
pub fn unix_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or_default()
}
