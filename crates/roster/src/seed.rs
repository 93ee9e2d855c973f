//! Merge of the human-authored seed lists into the store. One file per
//! (service, address family); records are bare comma-separated fields
//! `ip,port[,fqn[,user[,password]]]` with `0` or an empty ip meaning
//! "resolve from the FQN". Rows that already exist are skipped so the merge
//! can run on every startup.

use std::path::Path;

use tracing::{debug, error, warn};

use crate::addr;
use crate::store::{ImportSpec, MemoryStore};
use crate::types::{Af, Error, ServiceType};

pub const SEED_FILES: [&str; 8] = [
	"stun_v4.csv",
	"stun_v6.csv",
	"mqtt_v4.csv",
	"mqtt_v6.csv",
	"turn_v4.csv",
	"turn_v6.csv",
	"ntp_v4.csv",
	"ntp_v6.csv",
];

fn service_for_filename(name: &str) -> Option<ServiceType> {
	for (token, service) in [
		("stun", ServiceType::StunMap),
		("mqtt", ServiceType::Mqtt),
		("turn", ServiceType::Turn),
		("ntp", ServiceType::Ntp),
	] {
		if name.contains(token) {
			return Some(service);
		}
	}
	None
}

/// Merge every seed file under `dir`. Returns how many imports were added.
pub fn merge_seed_dir(store: &mut MemoryStore, dir: &Path, now: u64) -> usize {
	let mut added = 0;
	for file in SEED_FILES {
		let af = if file.contains("v4") { Af::V4 } else { Af::V6 };
		let Some(import_type) = service_for_filename(file) else {
			// Compatibility wart: an unrecognized name stops the whole merge,
			// not just this file.
			error!(file, "cannot determine service for seed file, stopping merge");
			break;
		};
		let path = dir.join(file);
		let contents = match std::fs::read_to_string(&path) {
			Ok(contents) => contents,
			Err(err) => {
				warn!(path = %path.display(), %err, "seed file unreadable, skipped");
				continue;
			},
		};
		added += merge_lines(store, import_type, af, &contents, now);
	}
	added
}

fn merge_lines(
	store: &mut MemoryStore,
	import_type: ServiceType,
	af: Af,
	contents: &str,
	now: u64,
) -> usize {
	let mut added = 0;
	for line in contents.lines() {
		let line = line.trim();
		if line.is_empty() {
			continue;
		}
		match parse_line(import_type, af, line) {
			Ok(spec) => match store.insert_import(spec, now) {
				Ok(_) => added += 1,
				Err(Error::DuplicateRecord(_)) => {
					debug!(line, "seed row already known");
				},
				Err(err) => warn!(line, %err, "seed row rejected"),
			},
			Err(err) => error!(line, %err, "malformed seed line, skipped"),
		}
	}
	added
}

fn parse_line(import_type: ServiceType, af: Af, line: &str) -> Result<ImportSpec, Error> {
	let mut parts = line.split(',').map(str::trim);
	let ip_field = parts
		.next()
		.ok_or_else(|| Error::InvalidInput("empty line".into()))?;
	let ip = match ip_field {
		"" | "0" => None,
		other => Some(addr::parse_ip(other)?),
	};
	let port = parts
		.next()
		.ok_or_else(|| Error::InvalidInput("missing port".into()))?
		.parse::<u16>()
		.map_err(|_| Error::InvalidInput("invalid port".into()))?;
	let opt = |s: Option<&str>| s.filter(|v| !v.is_empty()).map(str::to_string);
	let fqn = opt(parts.next());
	let user = opt(parts.next());
	let password = opt(parts.next());
	Ok(ImportSpec {
		import_type,
		af,
		ip,
		port,
		user,
		password,
		fqn,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::TableType;

	#[test]
	fn parses_all_field_arities() {
		let spec = parse_line(ServiceType::Turn, Af::V4, "1.2.3.4,3478,turn.example.com,u,p")
			.unwrap();
		assert_eq!(spec.ip.unwrap().to_string(), "1.2.3.4");
		assert_eq!(spec.port, 3478);
		assert_eq!(spec.fqn.as_deref(), Some("turn.example.com"));
		assert_eq!(spec.user.as_deref(), Some("u"));
		assert_eq!(spec.password.as_deref(), Some("p"));

		let bare = parse_line(ServiceType::Ntp, Af::V4, "9.9.9.9,123").unwrap();
		assert!(bare.fqn.is_none() && bare.user.is_none());

		// `0` means resolve from the name later.
		let unresolved = parse_line(ServiceType::StunMap, Af::V4, "0,3478,stun.example.com").unwrap();
		assert!(unresolved.ip.is_none());
		assert_eq!(unresolved.fqn.as_deref(), Some("stun.example.com"));
	}

	#[test]
	fn malformed_lines_are_skipped_but_merge_continues() {
		let mut store = MemoryStore::default();
		let contents = "1.2.3.4,3478\nnot-an-ip,90\n5.6.7.8,notaport\n9.9.9.9,123\n\n";
		let added = merge_lines(&mut store, ServiceType::StunMap, Af::V4, contents, 0);
		assert_eq!(added, 2);
		assert_eq!(store.imports.len(), 2);
	}

	#[test]
	fn re_merging_is_a_no_op() {
		let mut store = MemoryStore::default();
		let contents = "1.2.3.4,3478,stun.example.com";
		assert_eq!(merge_lines(&mut store, ServiceType::StunMap, Af::V4, contents, 0), 1);
		assert_eq!(merge_lines(&mut store, ServiceType::StunMap, Af::V4, contents, 0), 0);
		assert_eq!(store.imports.len(), 1);
		// The fqn produced exactly one alias with its DNS work queued.
		assert_eq!(store.aliases.len(), 1);
		assert_eq!(
			store
				.queue(TableType::Aliases, Af::V4)
				.len(crate::types::StatusKind::Init),
			1
		);
	}

	#[test]
	fn merges_only_existing_files() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("stun_v4.csv"), "1.2.3.4,3478\n").unwrap();
		std::fs::write(dir.path().join("ntp_v6.csv"), "2607:f8b0::1,123\n").unwrap();
		let mut store = MemoryStore::default();
		let added = merge_seed_dir(&mut store, dir.path(), 0);
		assert_eq!(added, 2);
		let afs: Vec<Af> = store.imports.values().map(|i| i.af).collect();
		assert!(afs.contains(&Af::V4) && afs.contains(&Af::V6));
	}

	#[test]
	fn filename_service_lookup() {
		assert_eq!(service_for_filename("stun_v4.csv"), Some(ServiceType::StunMap));
		assert_eq!(service_for_filename("mqtt_v6.csv"), Some(ServiceType::Mqtt));
		assert_eq!(service_for_filename("nonsense.csv"), None);
	}
}
