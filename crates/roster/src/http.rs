//! The dealer's JSON surface. Six endpoints: five mutating ones restricted
//! to loopback peers plus the public `/servers` listing, and nothing else.
//! Every response is pretty-printed and marked uncacheable.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::Router;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::{HeaderValue, StatusCode, header};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::Config;
use crate::store::{MemoryStore, ServiceSpec};
use crate::types::{AliasId, Error, StackType, StatusId, TableType};
use crate::{addr, sched, snapshot, unix_now};

#[derive(Clone)]
pub struct AppState {
	pub store: Arc<Mutex<MemoryStore>>,
	/// Pre-rendered `/servers` body; replaced wholesale by the refresh task.
	pub listing: Arc<ArcSwap<String>>,
	pub config: Arc<Config>,
}

impl AppState {
	pub fn new(store: MemoryStore, config: Arc<Config>) -> Self {
		AppState {
			store: Arc::new(Mutex::new(store)),
			listing: Arc::new(ArcSwap::from_pointee(String::from("{}"))),
			config,
		}
	}
}

pub fn router(state: AppState) -> Router {
	let gated = Router::new()
		.route("/work", post(work))
		.route("/complete", post(complete))
		.route("/insert", post(insert))
		.route("/alias", post(alias))
		.route("/save", post(save))
		.layer(middleware::from_fn(local_only));
	Router::new()
		.route("/servers", get(servers))
		.merge(gated)
		.layer(middleware::from_fn(no_cache))
		.with_state(state)
}

/// Mutating endpoints are for the worker fleet, which always runs next to
/// the dealer.
async fn local_only(
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: Request,
	next: Next,
) -> Response {
	if peer.ip().to_canonical().is_loopback() {
		next.run(req).await
	} else {
		(StatusCode::FORBIDDEN, Pretty(json!({"error": "forbidden"}))).into_response()
	}
}

async fn no_cache(req: Request, next: Next) -> Response {
	let mut res = next.run(req).await;
	let headers = res.headers_mut();
	headers.insert(
		header::CACHE_CONTROL,
		HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
	);
	headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
	headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
	res
}

/// Pretty-printed JSON body.
struct Pretty<T>(T);

impl<T: Serialize> IntoResponse for Pretty<T> {
	fn into_response(self) -> Response {
		match serde_json::to_string_pretty(&self.0) {
			Ok(body) => (
				[(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
				body,
			)
				.into_response(),
			Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
		}
	}
}

impl IntoResponse for Error {
	fn into_response(self) -> Response {
		let status = match &self {
			Error::InvalidInput(_)
			| Error::UnknownStatus(_)
			| Error::UnknownAlias(_)
			| Error::DuplicateRecord(_) => StatusCode::UNPROCESSABLE_ENTITY,
			Error::UnknownGroup(_) | Error::AlreadyQueued(_) | Error::Snapshot(_) | Error::Internal(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		};
		(status, Pretty(json!({"error": self.to_string()}))).into_response()
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkReq {
	#[serde(default)]
	stack_type: Option<StackType>,
	#[serde(default)]
	table_type: Option<TableType>,
	#[serde(default)]
	current_time: Option<u64>,
	#[serde(default)]
	monitor_frequency: Option<u64>,
}

async fn work(State(state): State<AppState>, axum::Json(req): axum::Json<WorkReq>) -> Pretty<Vec<Value>> {
	let now = req.current_time.unwrap_or_else(unix_now);
	let freq = req.monitor_frequency.unwrap_or(state.config.monitor_frequency);
	let stack = req.stack_type.unwrap_or(StackType::Dual);
	let rows = sched::allocate(&mut state.store.lock(), stack, req.table_type, now, freq);
	Pretty(rows)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompleteEntry {
	status_id: StatusId,
	is_success: i64,
	#[serde(default)]
	t: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompleteReq {
	statuses: Vec<CompleteEntry>,
}

/// Probe outcomes are applied independently; an unknown status id skips
/// that entry without failing the batch.
async fn complete(
	State(state): State<AppState>,
	axum::Json(req): axum::Json<CompleteReq>,
) -> Pretty<Vec<i64>> {
	let mut results = Vec::new();
	let mut store = state.store.lock();
	for entry in req.statuses {
		let t = entry.t.unwrap_or_else(unix_now);
		match sched::mark_complete(&mut store, entry.is_success != 0, entry.status_id, t) {
			Ok(()) => results.push(1),
			Err(err) => {
				warn!(status_id = entry.status_id, %err, "completion entry skipped");
			},
		}
	}
	Pretty(results)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InsertReq {
	imports_list: Vec<Vec<ServiceSpec>>,
	status_id: StatusId,
}

async fn insert(
	State(state): State<AppState>,
	axum::Json(req): axum::Json<InsertReq>,
) -> Result<Pretty<Vec<Value>>, Error> {
	let mut store = state.store.lock();
	sched::insert_services(&mut store, &req.imports_list, req.status_id, unix_now())?;
	Ok(Pretty(Vec::new()))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AliasReq {
	alias_id: AliasId,
	ip: String,
	#[serde(default)]
	current_time: Option<u64>,
}

async fn alias(
	State(state): State<AppState>,
	axum::Json(req): axum::Json<AliasReq>,
) -> Result<Pretty<Vec<Value>>, Error> {
	let ip = addr::parse_ip(&req.ip)?;
	let now = req.current_time.unwrap_or_else(unix_now);
	let mut store = state.store.lock();
	sched::update_alias(&mut store, req.alias_id, ip, now)?;
	Ok(Pretty(Vec::new()))
}

/// On-demand checkpoint, used by the restart script before it kills the
/// process hard.
async fn save(State(state): State<AppState>) -> Result<Pretty<Vec<Value>>, Error> {
	let data = snapshot::SnapshotData::collect(&state.store.lock());
	let path = state.config.db_path.clone();
	match tokio::task::spawn_blocking(move || snapshot::save(&path, &data)).await {
		Ok(Ok(())) => Ok(Pretty(Vec::new())),
		Ok(Err(err)) => Err(err),
		Err(err) => Err(Error::Internal(format!("checkpoint task failed: {err}"))),
	}
}

/// The only public endpoint: the cached listing, byte for byte.
async fn servers(State(state): State<AppState>) -> Response {
	let body = state.listing.load_full();
	(
		[(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
		(*body).clone(),
	)
		.into_response()
}
