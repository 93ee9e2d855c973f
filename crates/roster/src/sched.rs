//! Scheduling operations over the in-memory store and its work queues.
//! Every function here runs start-to-finish under the store lock and never
//! blocks; workers drive them through the HTTP surface.

use std::net::IpAddr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::addr;
use crate::store::{MemoryStore, ServiceSpec};
use crate::types::{Af, Error, GroupId, ServiceType, StackType, StatusId, StatusKind, TableType};

/// Dealt work may be handed to another worker after this many seconds.
pub const WORKER_TIMEOUT: u64 = 120;

/// Default seconds between probes of the same group.
pub const MONITOR_FREQUENCY: u64 = 3600;

/// DNS-driven IP updates only apply to rows down longer than twice this.
pub const MAX_SERVER_DOWNTIME: u64 = 600;

/// Imports are attempted this many times before being retired.
pub const IMPORT_TEST_NO: u32 = 3;

/// Hand out the oldest eligible group for the worker's stack, or nothing.
///
/// Sublists are scanned in lifecycle priority order. Entries within a
/// sublist are ordered by last state change, oldest first, so the first
/// too-fresh entry proves the rest of that sublist is too fresh as well and
/// the scan moves on.
pub fn allocate(
	store: &mut MemoryStore,
	stack: StackType,
	table_filter: Option<TableType>,
	now: u64,
	freq: u64,
) -> Vec<Value> {
	let tables = match table_filter {
		Some(table) => vec![table],
		None => TableType::ALL.to_vec(),
	};
	for table in tables {
		for af in stack.afs() {
			let Some((group_id, _)) = scan_queue(store, table, *af, now, freq) else {
				continue;
			};
			if let Err(err) = store.queue_mut(table, *af).move_to(group_id, StatusKind::Dealt, now) {
				warn!(%err, group_id, "failed to deal scanned group");
				continue;
			}
			debug!(group_id, table = %table, af = %af, "dealt work");
			return store.group_rows(group_id);
		}
	}
	Vec::new()
}

fn scan_queue(
	store: &MemoryStore,
	table: TableType,
	af: Af,
	now: u64,
	freq: u64,
) -> Option<(GroupId, StatusKind)> {
	let wq = store.queue(table, af);
	for kind in [StatusKind::Init, StatusKind::Available, StatusKind::Dealt] {
		for group_id in wq.iter(kind) {
			// Never handed out yet: always eligible.
			if kind == StatusKind::Init {
				return Some((group_id, kind));
			}
			let elapsed = now.saturating_sub(wq.timestamp(group_id).unwrap_or(now));
			match kind {
				StatusKind::Available if elapsed < freq => break,
				StatusKind::Dealt if elapsed < WORKER_TIMEOUT => break,
				_ => return Some((group_id, kind)),
			}
		}
	}
	None
}

/// Record a probe outcome and put the group back into rotation.
///
/// Imports retire (move to `disabled`) after any success or once they have
/// been tried `IMPORT_TEST_NO` times; everything else returns to
/// `available`. A failure resets the running uptime window but leaves
/// `max_uptime` as the high-water mark.
pub fn mark_complete(
	store: &mut MemoryStore,
	is_success: bool,
	status_id: StatusId,
	t: u64,
) -> Result<(), Error> {
	let (table, row_id, test_no) = {
		let status = store
			.statuses
			.get(&status_id)
			.ok_or(Error::UnknownStatus(status_id))?;
		(status.table_type, status.row_id, status.test_no)
	};
	let mut target = StatusKind::Available;
	if table == TableType::Imports && (is_success || test_no >= IMPORT_TEST_NO) {
		target = StatusKind::Disabled;
	}
	let (af, group_id) = store
		.row_af_group(table, row_id)
		.ok_or(Error::UnknownStatus(status_id))?;
	store.queue_mut(table, af).move_to(group_id, target, t)?;

	let status = store
		.statuses
		.get_mut(&status_id)
		.ok_or(Error::UnknownStatus(status_id))?;
	if is_success {
		if let Some(last_uptime) = status.last_uptime {
			status.uptime += t.saturating_sub(last_uptime);
		}
		status.max_uptime = status.max_uptime.max(status.uptime);
		status.last_uptime = Some(t);
		status.last_success = Some(t);
	} else {
		status.failed_tests += 1;
		status.uptime = 0;
	}
	status.status = target;
	status.test_no += 1;
	status.last_status = Some(t);
	Ok(())
}

/// Promote the service groups a worker discovered while probing an import,
/// then advance the originating import toward retirement.
///
/// Each inner list is one group. A group is dropped whole on a duplicate
/// member, an unknown alias reference, or a malformed stun_change cohort;
/// the rest of the batch continues.
pub fn insert_services(
	store: &mut MemoryStore,
	imports_list: &[Vec<ServiceSpec>],
	status_id: StatusId,
	now: u64,
) -> Result<(), Error> {
	for specs in imports_list {
		if let Err(err) = insert_service_group(store, specs, now) {
			debug!(%err, "skipping service group");
		}
	}
	mark_complete(store, !imports_list.is_empty(), status_id, now)
}

fn insert_service_group(
	store: &mut MemoryStore,
	specs: &[ServiceSpec],
	now: u64,
) -> Result<(), Error> {
	let Some(first) = specs.first() else {
		return Err(Error::InvalidInput("empty service group".into()));
	};
	if first.service_type == ServiceType::StunChange && specs.len() != 4 {
		return Err(Error::InvalidInput(format!(
			"stun_change cohorts have 4 members, got {}",
			specs.len()
		)));
	}
	let group_id = store.alloc_group_id();
	let status_id = store.alloc_status_id();
	let mut rows = Vec::with_capacity(specs.len());
	let mut alias_count = 0;
	for spec in specs {
		rows.push(store.insert_service(spec, group_id, status_id)?);
		if spec.alias_id.is_some() {
			alias_count += 1;
		}
	}
	// Change cohorts must be uniformly aliased: the secondary address pair
	// is useless if only part of the cohort follows a DNS name.
	if first.service_type == ServiceType::StunChange && !(alias_count == 0 || alias_count == 4) {
		return Err(Error::InvalidInput(format!(
			"stun_change cohorts need 0 or 4 aliases, got {alias_count}"
		)));
	}
	store.register_service_group(first.af, rows, group_id, status_id, now)
}

/// Apply a DNS resolution result to an alias and cascade the new IP to the
/// rows imported under it, without flip-flopping rows that are known alive.
pub fn update_alias(
	store: &mut MemoryStore,
	alias_id: u64,
	ip: IpAddr,
	now: u64,
) -> Result<(), Error> {
	addr::ensure_public(&ip)?;
	if !store.aliases.contains_key(&alias_id) {
		return Err(Error::UnknownAlias(alias_id));
	}
	store.del_alias_by_ip(alias_id);
	if let Some(alias) = store.aliases.get_mut(&alias_id) {
		alias.ip = Some(ip);
	}
	store.add_alias_by_ip(alias_id);

	let records: Vec<(TableType, u64)> = store.records_by_alias(alias_id).to_vec();
	for table in [TableType::Imports, TableType::Services] {
		for (record_table, row_id) in &records {
			if *record_table != table {
				continue;
			}
			cascade_row_ip(store, table, *row_id, ip, now);
		}
	}
	Ok(())
}

fn cascade_row_ip(store: &mut MemoryStore, table: TableType, row_id: u64, ip: IpAddr, now: u64) {
	let (current_ip, status_id) = match table {
		TableType::Imports => match store.imports.get(&row_id) {
			Some(row) => (row.ip, row.status_id),
			None => return,
		},
		TableType::Services => match store.services.get(&row_id) {
			Some(row) => (Some(row.ip), row.status_id),
			None => return,
		},
		TableType::Aliases => return,
	};
	let Some(status) = store.statuses.get(&status_id) else {
		warn!(status_id, row_id, "row status missing during alias cascade");
		return;
	};

	let update = if !current_ip.map(|cur| addr::is_public(&cur)).unwrap_or(false) {
		// Whatever is there now is unusable; the DNS result can only help.
		true
	} else if table == TableType::Imports && status.test_no == 0 {
		true
	} else {
		// Only follow DNS once the server has been down long enough that
		// this looks like a migration rather than a transient answer.
		let never_up = status.last_success.is_none() && status.last_uptime.is_none();
		let cond_one = never_up && status.test_no >= 2;
		let cond_two = match (status.last_success, status.last_uptime) {
			(Some(_), Some(last_uptime)) => {
				now.saturating_sub(last_uptime) > MAX_SERVER_DOWNTIME * 2
			},
			_ => false,
		};
		cond_one || cond_two
	};
	if !update {
		return;
	}
	match table {
		TableType::Imports => {
			if let Some(row) = store.imports.get_mut(&row_id) {
				row.ip = Some(ip);
			}
		},
		TableType::Services => {
			if let Some(row) = store.services.get_mut(&row_id) {
				row.ip = ip;
			}
		},
		TableType::Aliases => {},
	}
}
