//! Durable checkpoints. The in-memory store is authoritative; once a minute
//! (and on shutdown) it is projected wholesale into a small sqlite file by
//! truncating the five durable tables and re-inserting every row inside one
//! transaction. Restore is the mirror image and runs once at startup.

use std::collections::BTreeMap;
use std::path::Path;

use rusqlite::{Connection, ErrorCode, Transaction, params};
use tracing::{debug, info, warn};

use crate::addr;
use crate::store::MemoryStore;
use crate::types::{
	Af, Alias, Error, GroupId, Import, Proto, RowId, Service, ServiceType, Status, StatusId,
	StatusKind, TableType,
};

const INIT_SQL: &str = "
BEGIN;
CREATE TABLE IF NOT EXISTS settings (
	key TEXT PRIMARY KEY,
	value TEXT
);
CREATE TABLE IF NOT EXISTS aliases (
	id INTEGER PRIMARY KEY,
	af TEXT NOT NULL,
	fqn TEXT NOT NULL,
	ip TEXT,
	group_id INTEGER NOT NULL,
	UNIQUE (af, fqn)
);
CREATE TABLE IF NOT EXISTS imports (
	id INTEGER PRIMARY KEY,
	import_type TEXT NOT NULL,
	af TEXT NOT NULL,
	ip TEXT,
	port INTEGER NOT NULL,
	user TEXT,
	password TEXT,
	fqn TEXT,
	alias_id INTEGER,
	group_id INTEGER NOT NULL,
	status_id INTEGER NOT NULL,
	UNIQUE (import_type, af, ip, fqn, port)
);
CREATE TABLE IF NOT EXISTS services (
	id INTEGER PRIMARY KEY,
	type TEXT NOT NULL,
	af TEXT NOT NULL,
	proto TEXT NOT NULL,
	ip TEXT NOT NULL,
	port INTEGER NOT NULL,
	user TEXT,
	password TEXT,
	alias_id INTEGER,
	group_id INTEGER NOT NULL,
	status_id INTEGER NOT NULL,
	UNIQUE (af, proto, type, ip, port)
);
CREATE TABLE IF NOT EXISTS status (
	id INTEGER PRIMARY KEY,
	table_type TEXT NOT NULL,
	row_id INTEGER NOT NULL,
	status TEXT NOT NULL,
	test_no INTEGER NOT NULL,
	failed_tests INTEGER NOT NULL,
	last_status INTEGER,
	last_success INTEGER,
	last_uptime INTEGER,
	uptime INTEGER NOT NULL,
	max_uptime INTEGER NOT NULL
);
COMMIT;
";

/// Rows cloned out of the store under its lock, so the sqlite write can run
/// on a blocking thread without holding anything up.
pub struct SnapshotData {
	statuses: Vec<Status>,
	aliases: Vec<Alias>,
	imports: Vec<Import>,
	services: Vec<Service>,
	max_server_downtime: u64,
}

impl SnapshotData {
	pub fn collect(store: &MemoryStore) -> Self {
		fn sorted<T: Clone>(map: &std::collections::HashMap<u64, T>) -> Vec<T> {
			let mut ids: Vec<&u64> = map.keys().collect();
			ids.sort();
			ids.into_iter().map(|id| map[id].clone()).collect()
		}
		SnapshotData {
			statuses: sorted(&store.statuses),
			aliases: sorted(&store.aliases),
			imports: sorted(&store.imports),
			services: sorted(&store.services),
			max_server_downtime: crate::sched::MAX_SERVER_DOWNTIME,
		}
	}
}

/// Write one checkpoint. A constraint conflict on a single row is logged
/// and skipped; any other failure aborts and rolls the transaction back,
/// leaving the previous checkpoint authoritative.
pub fn save(path: &Path, data: &SnapshotData) -> Result<(), Error> {
	let mut conn = Connection::open(path)?;
	conn.execute_batch(INIT_SQL)?;
	let tx = conn.transaction()?;
	for table in ["settings", "services", "aliases", "status", "imports"] {
		tx.execute(&format!("DELETE FROM {table}"), [])?;
	}
	tx.execute(
		"INSERT INTO settings (key, value) VALUES (?1, ?2)",
		params!["max_server_downtime", data.max_server_downtime.to_string()],
	)?;
	for status in &data.statuses {
		tolerate_conflict(&tx, "status", status.id, |tx| {
			tx.execute(
				"INSERT INTO status (id, table_type, row_id, status, test_no, failed_tests, \
				 last_status, last_success, last_uptime, uptime, max_uptime) \
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					status.id,
					status.table_type.as_str(),
					status.row_id,
					status.status.as_str(),
					status.test_no,
					status.failed_tests,
					status.last_status,
					status.last_success,
					status.last_uptime,
					status.uptime,
					status.max_uptime,
				],
			)
		})?;
	}
	for alias in &data.aliases {
		tolerate_conflict(&tx, "aliases", alias.id, |tx| {
			tx.execute(
				"INSERT INTO aliases (id, af, fqn, ip, group_id) VALUES (?1, ?2, ?3, ?4, ?5)",
				params![
					alias.id,
					alias.af.as_str(),
					alias.fqn,
					alias.ip.map(|ip| ip.to_string()),
					alias.group_id,
				],
			)
		})?;
	}
	for import in &data.imports {
		tolerate_conflict(&tx, "imports", import.id, |tx| {
			tx.execute(
				"INSERT INTO imports (id, import_type, af, ip, port, user, password, fqn, \
				 alias_id, group_id, status_id) \
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					import.id,
					import.import_type.as_str(),
					import.af.as_str(),
					import.ip.map(|ip| ip.to_string()),
					import.port,
					import.user,
					import.password,
					import.fqn,
					import.alias_id,
					import.group_id,
					import.status_id,
				],
			)
		})?;
	}
	for service in &data.services {
		tolerate_conflict(&tx, "services", service.id, |tx| {
			tx.execute(
				"INSERT INTO services (id, type, af, proto, ip, port, user, password, \
				 alias_id, group_id, status_id) \
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
				params![
					service.id,
					service.service_type.as_str(),
					service.af.as_str(),
					service.proto.as_str(),
					service.ip.to_string(),
					service.port,
					service.user,
					service.password,
					service.alias_id,
					service.group_id,
					service.status_id,
				],
			)
		})?;
	}
	tx.commit()?;
	debug!(path = %path.display(), "checkpoint written");
	Ok(())
}

fn tolerate_conflict(
	tx: &Transaction<'_>,
	table: &str,
	id: u64,
	insert: impl FnOnce(&Transaction<'_>) -> Result<usize, rusqlite::Error>,
) -> Result<(), Error> {
	match insert(tx) {
		Ok(_) => Ok(()),
		Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
			warn!(table, id, "row conflicts with durable constraints, skipped");
			Ok(())
		},
		Err(err) => Err(err.into()),
	}
}

/// Load the previous checkpoint, rebuild every derived index, and queue
/// every restored group as `init` so nothing is skipped on stale lifecycle
/// state. A missing file is a fresh start, not an error.
pub fn restore(path: &Path, store: &mut MemoryStore, now: u64) -> Result<(), Error> {
	if !path.exists() {
		info!(path = %path.display(), "no checkpoint to restore");
		return Ok(());
	}
	let conn = Connection::open(path)?;
	conn.execute_batch(INIT_SQL)?;

	// Statuses first: they anchor the row backreferences.
	let mut stmt = conn.prepare(
		"SELECT id, table_type, row_id, status, test_no, failed_tests, last_status, \
		 last_success, last_uptime, uptime, max_uptime FROM status ORDER BY id ASC",
	)?;
	let statuses = stmt.query_map([], |row| {
		Ok((
			row.get::<_, u64>(0)?,
			row.get::<_, String>(1)?,
			row.get::<_, u64>(2)?,
			row.get::<_, String>(3)?,
			row.get::<_, u32>(4)?,
			row.get::<_, u32>(5)?,
			row.get::<_, Option<u64>>(6)?,
			row.get::<_, Option<u64>>(7)?,
			row.get::<_, Option<u64>>(8)?,
			row.get::<_, u64>(9)?,
			row.get::<_, u64>(10)?,
		))
	})?;
	for row in statuses {
		let (id, table, row_id, status, test_no, failed, last_status, last_success, last_uptime, uptime, max_uptime) =
			row?;
		let (Ok(table_type), Ok(kind)) = (table.parse::<TableType>(), status.parse::<StatusKind>())
		else {
			warn!(id, "status row with unknown enums, skipped");
			continue;
		};
		store.insert_restored_status(Status {
			id,
			table_type,
			row_id,
			status: kind,
			test_no,
			failed_tests: failed,
			last_status,
			last_success,
			last_uptime,
			uptime,
			max_uptime,
		});
	}

	let mut stmt = conn.prepare("SELECT id, af, fqn, ip, group_id FROM aliases ORDER BY id ASC")?;
	let aliases = stmt.query_map([], |row| {
		Ok((
			row.get::<_, u64>(0)?,
			row.get::<_, String>(1)?,
			row.get::<_, String>(2)?,
			row.get::<_, Option<String>>(3)?,
			row.get::<_, u64>(4)?,
		))
	})?;
	for row in aliases {
		let (id, af, fqn, ip, group_id) = row?;
		let Ok(af) = af.parse::<Af>() else {
			warn!(id, "alias row with unknown af, skipped");
			continue;
		};
		let ip = match ip {
			Some(s) => match addr::parse_ip(&s) {
				Ok(ip) => Some(ip),
				Err(err) => {
					warn!(id, %err, "alias row with bad ip, skipped");
					continue;
				},
			},
			None => None,
		};
		if let Err(err) = store.insert_restored_alias(Alias {
			id,
			af,
			fqn,
			ip,
			group_id,
			status_id: None,
		}) {
			warn!(id, %err, "alias row skipped");
		}
	}

	let mut stmt = conn.prepare(
		"SELECT id, import_type, af, ip, port, user, password, fqn, alias_id, group_id, \
		 status_id FROM imports ORDER BY id ASC",
	)?;
	let imports = stmt.query_map([], |row| {
		Ok((
			row.get::<_, u64>(0)?,
			row.get::<_, String>(1)?,
			row.get::<_, String>(2)?,
			row.get::<_, Option<String>>(3)?,
			row.get::<_, u16>(4)?,
			row.get::<_, Option<String>>(5)?,
			row.get::<_, Option<String>>(6)?,
			row.get::<_, Option<String>>(7)?,
			row.get::<_, Option<u64>>(8)?,
			row.get::<_, u64>(9)?,
			row.get::<_, u64>(10)?,
		))
	})?;
	for row in imports {
		let (id, import_type, af, ip, port, user, password, fqn, alias_id, group_id, status_id) =
			row?;
		let (Ok(import_type), Ok(af)) = (import_type.parse::<ServiceType>(), af.parse::<Af>())
		else {
			warn!(id, "import row with unknown enums, skipped");
			continue;
		};
		let ip = match ip {
			Some(s) => match addr::parse_ip(&s) {
				Ok(ip) => Some(ip),
				Err(err) => {
					warn!(id, %err, "import row with bad ip, skipped");
					continue;
				},
			},
			None => None,
		};
		if let Err(err) = store.insert_restored_import(Import {
			id,
			import_type,
			af,
			ip,
			port,
			user,
			password,
			fqn,
			alias_id,
			group_id,
			status_id,
		}) {
			warn!(id, %err, "import row skipped");
		}
	}

	let mut stmt = conn.prepare(
		"SELECT id, type, af, proto, ip, port, user, password, alias_id, group_id, status_id \
		 FROM services ORDER BY id ASC",
	)?;
	let services = stmt.query_map([], |row| {
		Ok((
			row.get::<_, u64>(0)?,
			row.get::<_, String>(1)?,
			row.get::<_, String>(2)?,
			row.get::<_, String>(3)?,
			row.get::<_, String>(4)?,
			row.get::<_, u16>(5)?,
			row.get::<_, Option<String>>(6)?,
			row.get::<_, Option<String>>(7)?,
			row.get::<_, Option<u64>>(8)?,
			row.get::<_, u64>(9)?,
			row.get::<_, u64>(10)?,
		))
	})?;
	for row in services {
		let (id, service_type, af, proto, ip, port, user, password, alias_id, group_id, status_id) =
			row?;
		let (Ok(service_type), Ok(af), Ok(proto), Ok(ip)) = (
			service_type.parse::<ServiceType>(),
			af.parse::<Af>(),
			proto.parse::<Proto>(),
			addr::parse_ip(&ip),
		) else {
			warn!(id, "service row with unknown fields, skipped");
			continue;
		};
		if let Err(err) = store.insert_restored_service(Service {
			id,
			service_type,
			af,
			proto,
			ip,
			port,
			user,
			password,
			alias_id,
			group_id,
			status_id,
		}) {
			warn!(id, %err, "service row skipped");
		}
	}

	store.relink_status_backrefs();
	requeue_groups(store, now);
	info!(
		aliases = store.aliases.len(),
		imports = store.imports.len(),
		services = store.services.len(),
		"checkpoint restored"
	);
	Ok(())
}

fn requeue_groups(store: &mut MemoryStore, now: u64) {
	for table in [TableType::Aliases, TableType::Imports, TableType::Services] {
		let mut groups: BTreeMap<GroupId, Vec<RowId>> = BTreeMap::new();
		match table {
			TableType::Aliases => {
				for (id, row) in &store.aliases {
					groups.entry(row.group_id).or_default().push(*id);
				}
			},
			TableType::Imports => {
				for (id, row) in &store.imports {
					groups.entry(row.group_id).or_default().push(*id);
				}
			},
			TableType::Services => {
				for (id, row) in &store.services {
					groups.entry(row.group_id).or_default().push(*id);
				}
			},
		}
		for (group_id, mut rows) in groups {
			rows.sort();
			let status_id = match first_status_id(store, table, rows[0]) {
				Some(status_id) if store.statuses.contains_key(&status_id) => status_id,
				_ => {
					warn!(group_id, table = %table, "group without a status row, not queued");
					continue;
				},
			};
			let Some((af, _)) = store.row_af_group(table, rows[0]) else {
				continue;
			};
			if let Err(err) =
				store.register_group(table, af, group_id, rows, status_id, StatusKind::Init, now)
			{
				warn!(group_id, %err, "failed to queue restored group");
			}
		}
	}
}

fn first_status_id(store: &MemoryStore, table: TableType, row_id: RowId) -> Option<StatusId> {
	match table {
		TableType::Aliases => store.aliases.get(&row_id)?.status_id,
		TableType::Imports => store.imports.get(&row_id).map(|r| r.status_id),
		TableType::Services => store.services.get(&row_id).map(|r| r.status_id),
	}
}
