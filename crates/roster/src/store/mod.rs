//! The authoritative in-memory database. Rows, statuses and groups live in
//! id-keyed maps; cross references (`status_id`, `group_id`, `alias_id`) are
//! plain integer keys rather than owning pointers, so a dangling reference
//! is a recoverable bug, not a crash.

mod list;
mod queue;

pub use list::{NodeRef, OrderedList};
pub use queue::WorkQueue;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use indexmap::IndexSet;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::types::{
	Af, Alias, AliasId, Error, Group, GroupId, Import, Proto, RowId, Service, ServiceType, Status,
	StatusId, StatusKind, TableType,
};

/// Canonicalized identifying tuple; one namespace for all three tables.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum UniqueKey {
	Service {
		af: Af,
		proto: Proto,
		service_type: ServiceType,
		locator: String,
		port: u16,
	},
	Import {
		import_type: ServiceType,
		af: Af,
		locator: String,
		port: u16,
	},
	Alias {
		af: Af,
		fqn: String,
	},
}

/// Candidate server row offered to `insert_import`.
#[derive(Debug, Clone)]
pub struct ImportSpec {
	pub import_type: ServiceType,
	pub af: Af,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub user: Option<String>,
	pub password: Option<String>,
	pub fqn: Option<String>,
}

/// One prospective service as reported by a worker through `/insert`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
	pub service_type: ServiceType,
	pub af: Af,
	pub proto: Proto,
	pub ip: IpAddr,
	pub port: u16,
	#[serde(default)]
	pub user: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub alias_id: Option<AliasId>,
	// Advisory hint from the worker; the dealer computes its own scores.
	#[serde(default)]
	pub score: Option<f64>,
}

pub struct MemoryStore {
	pub aliases: HashMap<RowId, Alias>,
	pub imports: HashMap<RowId, Import>,
	pub services: HashMap<RowId, Service>,
	pub statuses: HashMap<StatusId, Status>,
	pub groups: HashMap<GroupId, Group>,
	uniques: HashMap<UniqueKey, RowId>,
	aliases_by_ip: HashMap<IpAddr, IndexSet<AliasId>>,
	records_by_alias: HashMap<AliasId, Vec<(TableType, RowId)>>,
	work: [[WorkQueue; 2]; 3],
	next_row_id: [RowId; 3],
	next_status_id: StatusId,
	next_group_id: GroupId,
}

impl Default for MemoryStore {
	fn default() -> Self {
		MemoryStore {
			aliases: HashMap::new(),
			imports: HashMap::new(),
			services: HashMap::new(),
			statuses: HashMap::new(),
			groups: HashMap::new(),
			uniques: HashMap::new(),
			aliases_by_ip: HashMap::new(),
			records_by_alias: HashMap::new(),
			work: std::array::from_fn(|_| std::array::from_fn(|_| WorkQueue::default())),
			next_row_id: [1; 3],
			next_status_id: 1,
			next_group_id: 1,
		}
	}
}

impl MemoryStore {
	pub fn queue(&self, table: TableType, af: Af) -> &WorkQueue {
		&self.work[table.idx()][af.idx()]
	}

	pub fn queue_mut(&mut self, table: TableType, af: Af) -> &mut WorkQueue {
		&mut self.work[table.idx()][af.idx()]
	}

	fn alloc_row_id(&mut self, table: TableType) -> RowId {
		let id = self.next_row_id[table.idx()];
		self.next_row_id[table.idx()] += 1;
		id
	}

	pub(crate) fn alloc_status_id(&mut self) -> StatusId {
		let id = self.next_status_id;
		self.next_status_id += 1;
		id
	}

	pub(crate) fn alloc_group_id(&mut self) -> GroupId {
		let id = self.next_group_id;
		self.next_group_id += 1;
		id
	}

	pub fn bump_row_watermark(&mut self, table: TableType, seen: RowId) {
		let next = &mut self.next_row_id[table.idx()];
		*next = (*next).max(seen + 1);
	}

	pub fn bump_status_watermark(&mut self, seen: StatusId) {
		self.next_status_id = self.next_status_id.max(seen + 1);
	}

	pub fn bump_group_watermark(&mut self, seen: GroupId) {
		self.next_group_id = self.next_group_id.max(seen + 1);
	}

	pub fn next_row_id_hint(&self, table: TableType) -> RowId {
		self.next_row_id[table.idx()]
	}

	/// Fetch-or-insert an alias. Creating one allocates its status row and
	/// group and queues its DNS-update work stream.
	pub fn insert_alias(&mut self, af: Af, fqn: &str, now: u64) -> Result<AliasId, Error> {
		let key = UniqueKey::Alias {
			af,
			fqn: fqn.to_string(),
		};
		if let Some(&id) = self.uniques.get(&key) {
			return Ok(id);
		}
		let id = self.alloc_row_id(TableType::Aliases);
		let group_id = self.alloc_group_id();
		let status_id = self.alloc_status_id();
		self
			.statuses
			.insert(status_id, Status::new(status_id, TableType::Aliases, id));
		self.aliases.insert(
			id,
			Alias {
				id,
				af,
				fqn: fqn.to_string(),
				ip: None,
				group_id,
				status_id: Some(status_id),
			},
		);
		self.groups.insert(
			group_id,
			Group {
				id: group_id,
				table_type: TableType::Aliases,
				af,
				rows: vec![id],
				status_id,
			},
		);
		self.records_by_alias.insert(id, Vec::new());
		self.uniques.insert(key, id);
		self
			.queue_mut(TableType::Aliases, af)
			.add(group_id, StatusKind::Init, now)?;
		Ok(id)
	}

	pub fn insert_import(&mut self, spec: ImportSpec, now: u64) -> Result<RowId, Error> {
		let locator = match (&spec.ip, &spec.fqn) {
			(Some(ip), _) => ip.to_string(),
			(None, Some(fqn)) => fqn.clone(),
			(None, None) => {
				return Err(Error::InvalidInput("import needs an ip or an fqn".into()));
			},
		};
		let key = UniqueKey::Import {
			import_type: spec.import_type,
			af: spec.af,
			locator: locator.clone(),
			port: spec.port,
		};
		if self.uniques.contains_key(&key) {
			return Err(Error::DuplicateRecord(format!(
				"import {} {} {}:{}",
				spec.import_type, spec.af, locator, spec.port
			)));
		}
		let alias_id = match &spec.fqn {
			Some(fqn) => Some(self.insert_alias(spec.af, fqn, now)?),
			None => None,
		};
		let id = self.alloc_row_id(TableType::Imports);
		let group_id = self.alloc_group_id();
		let status_id = self.alloc_status_id();
		self
			.statuses
			.insert(status_id, Status::new(status_id, TableType::Imports, id));
		self.imports.insert(
			id,
			Import {
				id,
				import_type: spec.import_type,
				af: spec.af,
				ip: spec.ip,
				port: spec.port,
				user: spec.user,
				password: spec.password,
				fqn: spec.fqn,
				alias_id,
				group_id,
				status_id,
			},
		);
		self.groups.insert(
			group_id,
			Group {
				id: group_id,
				table_type: TableType::Imports,
				af: spec.af,
				rows: vec![id],
				status_id,
			},
		);
		self.uniques.insert(key, id);
		if let Some(alias_id) = alias_id {
			self
				.records_by_alias
				.entry(alias_id)
				.or_default()
				.push((TableType::Imports, id));
		}
		self
			.queue_mut(TableType::Imports, spec.af)
			.add(group_id, StatusKind::Init, now)?;
		Ok(id)
	}

	/// Insert one service row wired to an externally allocated group and
	/// status. Groups are registered separately once every member made it in;
	/// see `register_service_group`.
	pub(crate) fn insert_service(
		&mut self,
		spec: &ServiceSpec,
		group_id: GroupId,
		status_id: StatusId,
	) -> Result<RowId, Error> {
		if let Some(alias_id) = spec.alias_id
			&& !self.aliases.contains_key(&alias_id)
		{
			return Err(Error::UnknownAlias(alias_id));
		}
		let key = UniqueKey::Service {
			af: spec.af,
			proto: spec.proto,
			service_type: spec.service_type,
			locator: spec.ip.to_string(),
			port: spec.port,
		};
		if self.uniques.contains_key(&key) {
			return Err(Error::DuplicateRecord(format!(
				"service {} {} {} {}:{}",
				spec.service_type, spec.af, spec.proto, spec.ip, spec.port
			)));
		}
		let id = self.alloc_row_id(TableType::Services);
		self.services.insert(
			id,
			Service {
				id,
				service_type: spec.service_type,
				af: spec.af,
				proto: spec.proto,
				ip: spec.ip,
				port: spec.port,
				user: spec.user.clone(),
				password: spec.password.clone(),
				alias_id: spec.alias_id,
				group_id,
				status_id,
			},
		);
		self.uniques.insert(key, id);
		if let Some(alias_id) = spec.alias_id {
			self
				.records_by_alias
				.entry(alias_id)
				.or_default()
				.push((TableType::Services, id));
		}
		Ok(id)
	}

	/// Create the shared status row, register the group, and queue it.
	pub(crate) fn register_service_group(
		&mut self,
		af: Af,
		rows: Vec<RowId>,
		group_id: GroupId,
		status_id: StatusId,
		now: u64,
	) -> Result<(), Error> {
		let anchor = rows[0];
		self
			.statuses
			.insert(status_id, Status::new(status_id, TableType::Services, anchor));
		self.groups.insert(
			group_id,
			Group {
				id: group_id,
				table_type: TableType::Services,
				af,
				rows,
				status_id,
			},
		);
		self
			.queue_mut(TableType::Services, af)
			.add(group_id, StatusKind::Init, now)
	}

	/// Register an already materialized group (snapshot restore path). The
	/// queue state is forced to `initial` by the caller so nothing is skipped
	/// because of stale persisted lifecycle state.
	pub fn register_group(
		&mut self,
		table: TableType,
		af: Af,
		group_id: GroupId,
		rows: Vec<RowId>,
		status_id: StatusId,
		initial: StatusKind,
		now: u64,
	) -> Result<(), Error> {
		self.groups.insert(
			group_id,
			Group {
				id: group_id,
				table_type: table,
				af,
				rows,
				status_id,
			},
		);
		self.queue_mut(table, af).add(group_id, initial, now)
	}

	pub fn add_alias_by_ip(&mut self, alias_id: AliasId) {
		if let Some(alias) = self.aliases.get(&alias_id)
			&& let Some(ip) = alias.ip
		{
			self.aliases_by_ip.entry(ip).or_default().insert(alias_id);
		}
	}

	pub fn del_alias_by_ip(&mut self, alias_id: AliasId) {
		if let Some(alias) = self.aliases.get(&alias_id)
			&& let Some(ip) = alias.ip
			&& let Some(set) = self.aliases_by_ip.get_mut(&ip)
		{
			set.shift_remove(&alias_id);
			if set.is_empty() {
				self.aliases_by_ip.remove(&ip);
			}
		}
	}

	/// FQNs of every alias currently resolving to `ip`, most recently
	/// discovered first.
	pub fn fqns_for_ip(&self, ip: &IpAddr) -> Vec<String> {
		let Some(ids) = self.aliases_by_ip.get(ip) else {
			return Vec::new();
		};
		let mut fqns: IndexSet<String> = IndexSet::new();
		for alias_id in ids {
			if let Some(alias) = self.aliases.get(alias_id) {
				fqns.insert(alias.fqn.clone());
			}
		}
		fqns.into_iter().rev().collect()
	}

	pub fn records_by_alias(&self, alias_id: AliasId) -> &[(TableType, RowId)] {
		self
			.records_by_alias
			.get(&alias_id)
			.map(Vec::as_slice)
			.unwrap_or(&[])
	}

	pub(crate) fn push_alias_record(&mut self, alias_id: AliasId, table: TableType, row_id: RowId) {
		self
			.records_by_alias
			.entry(alias_id)
			.or_default()
			.push((table, row_id));
	}

	pub fn row_af_group(&self, table: TableType, row_id: RowId) -> Option<(Af, GroupId)> {
		match table {
			TableType::Aliases => self.aliases.get(&row_id).map(|r| (r.af, r.group_id)),
			TableType::Imports => self.imports.get(&row_id).map(|r| (r.af, r.group_id)),
			TableType::Services => self.services.get(&row_id).map(|r| (r.af, r.group_id)),
		}
	}

	/// The row as workers see it: the entity's fields plus a `table_type`
	/// discriminator.
	pub fn row_value(&self, table: TableType, row_id: RowId) -> Option<Value> {
		let value = match table {
			TableType::Aliases => serde_json::to_value(self.aliases.get(&row_id)?),
			TableType::Imports => serde_json::to_value(self.imports.get(&row_id)?),
			TableType::Services => serde_json::to_value(self.services.get(&row_id)?),
		};
		let mut value = match value {
			Ok(v) => v,
			Err(err) => {
				warn!(%err, table = %table, row_id, "failed to serialize row");
				return None;
			},
		};
		if let Value::Object(map) = &mut value {
			map.insert("table_type".into(), Value::String(table.as_str().into()));
		}
		Some(value)
	}

	pub fn group_rows(&self, group_id: GroupId) -> Vec<Value> {
		let Some(group) = self.groups.get(&group_id) else {
			return Vec::new();
		};
		group
			.rows
			.iter()
			.filter_map(|row_id| self.row_value(group.table_type, *row_id))
			.collect()
	}

	// Restore-path inserts. These trust the snapshot for ids and references
	// but still rebuild every derived index; rows whose canonical tuple is
	// already taken are dropped, mirroring what the durable uniqueness
	// constraints would have done at export time.

	pub fn insert_restored_status(&mut self, status: Status) {
		self.bump_status_watermark(status.id);
		self.statuses.insert(status.id, status);
	}

	pub fn insert_restored_alias(&mut self, alias: Alias) -> Result<(), Error> {
		let key = UniqueKey::Alias {
			af: alias.af,
			fqn: alias.fqn.clone(),
		};
		if self.uniques.contains_key(&key) {
			return Err(Error::DuplicateRecord(format!(
				"alias {} {}",
				alias.af, alias.fqn
			)));
		}
		self.bump_row_watermark(TableType::Aliases, alias.id);
		self.bump_group_watermark(alias.group_id);
		self.uniques.insert(key, alias.id);
		self.records_by_alias.entry(alias.id).or_default();
		let id = alias.id;
		self.aliases.insert(id, alias);
		self.add_alias_by_ip(id);
		Ok(())
	}

	pub fn insert_restored_import(&mut self, import: Import) -> Result<(), Error> {
		let locator = match (&import.ip, &import.fqn) {
			(Some(ip), _) => ip.to_string(),
			(None, Some(fqn)) => fqn.clone(),
			(None, None) => {
				return Err(Error::InvalidInput(format!("import {} has no locator", import.id)));
			},
		};
		let key = UniqueKey::Import {
			import_type: import.import_type,
			af: import.af,
			locator,
			port: import.port,
		};
		if self.uniques.contains_key(&key) {
			return Err(Error::DuplicateRecord(format!("import {}", import.id)));
		}
		self.bump_row_watermark(TableType::Imports, import.id);
		self.bump_group_watermark(import.group_id);
		self.uniques.insert(key, import.id);
		if let Some(alias_id) = import.alias_id {
			self.push_alias_record(alias_id, TableType::Imports, import.id);
		}
		self.imports.insert(import.id, import);
		Ok(())
	}

	pub fn insert_restored_service(&mut self, service: Service) -> Result<(), Error> {
		let key = UniqueKey::Service {
			af: service.af,
			proto: service.proto,
			service_type: service.service_type,
			locator: service.ip.to_string(),
			port: service.port,
		};
		if self.uniques.contains_key(&key) {
			return Err(Error::DuplicateRecord(format!("service {}", service.id)));
		}
		self.bump_row_watermark(TableType::Services, service.id);
		self.bump_group_watermark(service.group_id);
		self.uniques.insert(key, service.id);
		if let Some(alias_id) = service.alias_id {
			self.push_alias_record(alias_id, TableType::Services, service.id);
		}
		self.services.insert(service.id, service);
		Ok(())
	}

	/// Point each row back at its status; statuses anchor the backreference
	/// after a restore.
	pub fn relink_status_backrefs(&mut self) {
		let links: Vec<(TableType, RowId, StatusId)> = self
			.statuses
			.values()
			.map(|s| (s.table_type, s.row_id, s.id))
			.collect();
		for (table, row_id, status_id) in links {
			match table {
				TableType::Aliases => {
					if let Some(row) = self.aliases.get_mut(&row_id) {
						row.status_id = Some(status_id);
					}
				},
				TableType::Imports => {
					if let Some(row) = self.imports.get_mut(&row_id) {
						row.status_id = status_id;
					}
				},
				TableType::Services => {
					if let Some(row) = self.services.get_mut(&row_id) {
						row.status_id = status_id;
					}
				},
			}
		}
	}
}
