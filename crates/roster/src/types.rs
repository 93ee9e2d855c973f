use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RowId = u64;
pub type GroupId = u64;
pub type StatusId = u64;
pub type AliasId = u64;

/// Address family of a monitored endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Af {
	V4,
	V6,
}

impl Af {
	pub const ALL: [Af; 2] = [Af::V4, Af::V6];

	pub fn as_str(&self) -> &'static str {
		match self {
			Af::V4 => "v4",
			Af::V6 => "v6",
		}
	}

	/// Key used in the public listing; consumers predate the snake_case forms.
	pub fn catalogue_key(&self) -> &'static str {
		match self {
			Af::V4 => "IPv4",
			Af::V6 => "IPv6",
		}
	}

	pub(crate) fn idx(&self) -> usize {
		*self as usize
	}
}

impl fmt::Display for Af {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Af {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"v4" => Ok(Af::V4),
			"v6" => Ok(Af::V6),
			_ => Err(Error::InvalidInput(format!("unknown address family {s:?}"))),
		}
	}
}

/// Transport protocol a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Proto {
	Udp,
	Tcp,
}

impl Proto {
	pub const ALL: [Proto; 2] = [Proto::Udp, Proto::Tcp];

	pub fn as_str(&self) -> &'static str {
		match self {
			Proto::Udp => "udp",
			Proto::Tcp => "tcp",
		}
	}

	pub fn catalogue_key(&self) -> &'static str {
		match self {
			Proto::Udp => "UDP",
			Proto::Tcp => "TCP",
		}
	}
}

impl fmt::Display for Proto {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for Proto {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"udp" => Ok(Proto::Udp),
			"tcp" => Ok(Proto::Tcp),
			_ => Err(Error::InvalidInput(format!("unknown protocol {s:?}"))),
		}
	}
}

/// Kinds of infrastructure servers the fleet knows how to probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
	/// STUN server that reports the caller's reflexive address (RFC 5389).
	StunMap,
	/// STUN server that can also reply from alternate addresses (RFC 3489).
	/// Always monitored in cohorts of four.
	StunChange,
	Mqtt,
	Turn,
	Ntp,
}

impl ServiceType {
	pub const ALL: [ServiceType; 5] = [
		ServiceType::StunMap,
		ServiceType::StunChange,
		ServiceType::Mqtt,
		ServiceType::Turn,
		ServiceType::Ntp,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			ServiceType::StunMap => "stun_map",
			ServiceType::StunChange => "stun_change",
			ServiceType::Mqtt => "mqtt",
			ServiceType::Turn => "turn",
			ServiceType::Ntp => "ntp",
		}
	}

	/// Legacy labels baked into downstream consumers of `/servers`.
	pub fn catalogue_key(&self) -> &'static str {
		match self {
			ServiceType::StunMap => "STUN(see_ip)",
			ServiceType::StunChange => "STUN(test_nat)",
			ServiceType::Mqtt => "MQTT",
			ServiceType::Turn => "TURN",
			ServiceType::Ntp => "NTP",
		}
	}
}

impl fmt::Display for ServiceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ServiceType {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"stun_map" => Ok(ServiceType::StunMap),
			"stun_change" => Ok(ServiceType::StunChange),
			"mqtt" => Ok(ServiceType::Mqtt),
			"turn" => Ok(ServiceType::Turn),
			"ntp" => Ok(ServiceType::Ntp),
			_ => Err(Error::InvalidInput(format!("unknown service type {s:?}"))),
		}
	}
}

/// The three row tables work can be drawn from, in allocation priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
	Services,
	Aliases,
	Imports,
}

impl TableType {
	pub const ALL: [TableType; 3] = [TableType::Services, TableType::Aliases, TableType::Imports];

	pub fn as_str(&self) -> &'static str {
		match self {
			TableType::Services => "services",
			TableType::Aliases => "aliases",
			TableType::Imports => "imports",
		}
	}

	pub(crate) fn idx(&self) -> usize {
		*self as usize
	}
}

impl fmt::Display for TableType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for TableType {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"services" => Ok(TableType::Services),
			"aliases" => Ok(TableType::Aliases),
			"imports" => Ok(TableType::Imports),
			_ => Err(Error::InvalidInput(format!("unknown table type {s:?}"))),
		}
	}
}

/// Where a group currently sits in the scheduling lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
	Init,
	Available,
	Dealt,
	Disabled,
}

impl StatusKind {
	pub const ALL: [StatusKind; 4] = [
		StatusKind::Init,
		StatusKind::Available,
		StatusKind::Dealt,
		StatusKind::Disabled,
	];

	pub fn as_str(&self) -> &'static str {
		match self {
			StatusKind::Init => "init",
			StatusKind::Available => "available",
			StatusKind::Dealt => "dealt",
			StatusKind::Disabled => "disabled",
		}
	}

	pub(crate) fn idx(&self) -> usize {
		*self as usize
	}
}

impl fmt::Display for StatusKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for StatusKind {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"init" => Ok(StatusKind::Init),
			"available" => Ok(StatusKind::Available),
			"dealt" => Ok(StatusKind::Dealt),
			"disabled" => Ok(StatusKind::Disabled),
			_ => Err(Error::InvalidInput(format!("unknown status kind {s:?}"))),
		}
	}
}

/// IP stack a worker advertises when polling for work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackType {
	V4,
	V6,
	Dual,
}

impl StackType {
	pub fn afs(&self) -> &'static [Af] {
		match self {
			StackType::V4 => &[Af::V4],
			StackType::V6 => &[Af::V6],
			StackType::Dual => &Af::ALL,
		}
	}
}

/// A DNS name watched for address changes. Rows that were imported under
/// this name follow its IP when the cascade rules allow it.
#[derive(Debug, Clone, Serialize)]
pub struct Alias {
	pub id: RowId,
	pub af: Af,
	pub fqn: String,
	pub ip: Option<IpAddr>,
	pub group_id: GroupId,
	// Not persisted on the aliases table; restore re-links it from the
	// status row's backreference.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status_id: Option<StatusId>,
}

/// A candidate server that has not yet been promoted to active monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct Import {
	pub id: RowId,
	pub import_type: ServiceType,
	pub af: Af,
	pub ip: Option<IpAddr>,
	pub port: u16,
	pub user: Option<String>,
	pub password: Option<String>,
	pub fqn: Option<String>,
	pub alias_id: Option<AliasId>,
	pub group_id: GroupId,
	pub status_id: StatusId,
}

/// An actively monitored endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Service {
	pub id: RowId,
	#[serde(rename = "type")]
	pub service_type: ServiceType,
	pub af: Af,
	pub proto: Proto,
	pub ip: IpAddr,
	pub port: u16,
	pub user: Option<String>,
	pub password: Option<String>,
	pub alias_id: Option<AliasId>,
	pub group_id: GroupId,
	pub status_id: StatusId,
}

/// Liveness and uptime record attached 1:1 to a row.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
	pub id: StatusId,
	pub table_type: TableType,
	pub row_id: RowId,
	pub status: StatusKind,
	pub test_no: u32,
	pub failed_tests: u32,
	pub last_status: Option<u64>,
	pub last_success: Option<u64>,
	pub last_uptime: Option<u64>,
	pub uptime: u64,
	pub max_uptime: u64,
}

impl Status {
	pub fn new(id: StatusId, table_type: TableType, row_id: RowId) -> Self {
		Status {
			id,
			table_type,
			row_id,
			status: StatusKind::Init,
			test_no: 0,
			failed_tests: 0,
			last_status: None,
			last_success: None,
			last_uptime: None,
			uptime: 0,
			max_uptime: 0,
		}
	}
}

/// A cohort of rows scheduled and scored as one unit. Most groups hold a
/// single row; stun_change cohorts hold exactly four.
#[derive(Debug, Clone)]
pub struct Group {
	pub id: GroupId,
	pub table_type: TableType,
	pub af: Af,
	pub rows: Vec<RowId>,
	pub status_id: StatusId,
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("duplicate record: {0}")]
	DuplicateRecord(String),
	#[error("unknown status id {0}")]
	UnknownStatus(StatusId),
	#[error("unknown alias id {0}")]
	UnknownAlias(AliasId),
	#[error("group {0} is not queued")]
	UnknownGroup(GroupId),
	#[error("group {0} already queued")]
	AlreadyQueued(GroupId),
	#[error("invalid input: {0}")]
	InvalidInput(String),
	#[error("snapshot: {0}")]
	Snapshot(#[from] rusqlite::Error),
	#[error("internal: {0}")]
	Internal(String),
}
