//! End-to-end tests of the HTTP surface against a real store, driving the
//! router directly.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use http::{Request, StatusCode, header};
use roster::config::Config;
use roster::http::{AppState, router};
use roster::store::{ImportSpec, MemoryStore};
use roster::types::{Af, ServiceType};
use serde_json::{Value, json};
use tower::ServiceExt;

fn loopback() -> SocketAddr {
	"127.0.0.1:40000".parse().unwrap()
}

fn remote() -> SocketAddr {
	"203.0.112.9:40000".parse().unwrap()
}

fn state_with_import() -> AppState {
	let mut store = MemoryStore::default();
	store
		.insert_import(
			ImportSpec {
				import_type: ServiceType::StunMap,
				af: Af::V4,
				ip: Some("1.2.3.4".parse().unwrap()),
				port: 3478,
				user: None,
				password: None,
				fqn: None,
			},
			1_000,
		)
		.unwrap();
	AppState::new(store, Arc::new(Config::default()))
}

async fn call(
	app: &Router,
	peer: SocketAddr,
	method: &str,
	path: &str,
	body: Option<Value>,
) -> (StatusCode, http::HeaderMap, Value) {
	let mut builder = Request::builder()
		.method(method)
		.uri(path)
		.extension(ConnectInfo(peer));
	let body = match body {
		Some(value) => {
			builder = builder.header(header::CONTENT_TYPE, "application/json");
			Body::from(value.to_string())
		},
		None => Body::empty(),
	};
	let res = app
		.clone()
		.oneshot(builder.body(body).unwrap())
		.await
		.unwrap();
	let status = res.status();
	let headers = res.headers().clone();
	let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
	let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
	(status, headers, value)
}

#[tokio::test]
async fn work_then_complete_cycle() {
	let state = state_with_import();
	let app = router(state);

	let (status, _, rows) = call(
		&app,
		loopback(),
		"POST",
		"/work",
		Some(json!({"stack_type": "v4", "current_time": 1_000})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	let rows = rows.as_array().unwrap();
	assert_eq!(rows.len(), 1);
	assert_eq!(rows[0]["ip"], "1.2.3.4");
	assert_eq!(rows[0]["table_type"], "imports");
	let status_id = rows[0]["status_id"].as_u64().unwrap();

	// The same group is not handed out twice inside the worker timeout.
	let (_, _, again) = call(
		&app,
		loopback(),
		"POST",
		"/work",
		Some(json!({"stack_type": "v4", "current_time": 1_010})),
	)
	.await;
	assert_eq!(again, json!([]));

	let (status, _, applied) = call(
		&app,
		loopback(),
		"POST",
		"/complete",
		Some(json!({"statuses": [{"status_id": status_id, "is_success": 1, "t": 1_020}]})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(applied, json!([1]));
}

#[tokio::test]
async fn unknown_completion_entries_are_skipped() {
	let app = router(state_with_import());
	let (status, _, applied) = call(
		&app,
		loopback(),
		"POST",
		"/complete",
		Some(json!({"statuses": [{"status_id": 12345, "is_success": 0, "t": 10}]})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(applied, json!([]));
}

#[tokio::test]
async fn mutating_endpoints_require_loopback() {
	let app = router(state_with_import());
	for path in ["/work", "/complete", "/insert", "/alias", "/save"] {
		let (status, _, _) = call(&app, remote(), "POST", path, Some(json!({}))).await;
		assert_eq!(status, StatusCode::FORBIDDEN, "{path}");
	}
	// The listing itself is public.
	let (status, _, _) = call(&app, remote(), "GET", "/servers", None).await;
	assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_fields_are_rejected() {
	let app = router(state_with_import());
	let (status, _, _) = call(
		&app,
		loopback(),
		"POST",
		"/work",
		Some(json!({"stack_type": "v4", "bogus": true})),
	)
	.await;
	assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn insert_promotes_services_and_listing_refreshes() {
	let state = state_with_import();
	let app = router(state.clone());

	let (_, _, rows) = call(
		&app,
		loopback(),
		"POST",
		"/work",
		Some(json!({"stack_type": "v4", "current_time": 1_000})),
	)
	.await;
	let status_id = rows[0]["status_id"].as_u64().unwrap();

	let (status, _, body) = call(
		&app,
		loopback(),
		"POST",
		"/insert",
		Some(json!({
			"status_id": status_id,
			"imports_list": [[{
				"service_type": "stun_map",
				"af": "v4",
				"proto": "udp",
				"ip": "5.6.7.8",
				"port": 3478,
				"user": null,
				"password": null,
				"alias_id": null,
				"score": 0
			}]]
		})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, json!([]));
	assert_eq!(state.store.lock().services.len(), 1);

	// Before a refresh tick the listing is still the boot placeholder.
	let (_, _, placeholder) = call(&app, loopback(), "GET", "/servers", None).await;
	assert_eq!(placeholder, json!({}));

	roster::app::refresh_cycle(&state).await;
	let (status, headers, listing) = call(&app, loopback(), "GET", "/servers", None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(
		headers.get(header::CACHE_CONTROL).unwrap(),
		"no-store, no-cache, must-revalidate, max-age=0"
	);
	let bucket = listing["STUN(see_ip)"]["IPv4"]["UDP"].as_array().unwrap();
	assert_eq!(bucket.len(), 1);
	assert_eq!(bucket[0][0]["ip"], "5.6.7.8");
	assert!(listing["timestamp"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn alias_endpoint_validates_input() {
	let state = state_with_import();
	let alias_id = state
		.store
		.lock()
		.insert_alias(Af::V4, "stun.example.com", 0)
		.unwrap();
	let app = router(state);

	let (status, _, _) = call(
		&app,
		loopback(),
		"POST",
		"/alias",
		Some(json!({"alias_id": alias_id, "ip": "not-an-ip"})),
	)
	.await;
	assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

	let (status, _, _) = call(
		&app,
		loopback(),
		"POST",
		"/alias",
		Some(json!({"alias_id": alias_id, "ip": "192.168.0.10"})),
	)
	.await;
	assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

	let (status, _, body) = call(
		&app,
		loopback(),
		"POST",
		"/alias",
		Some(json!({"alias_id": alias_id, "ip": "8.8.8.8", "current_time": 100})),
	)
	.await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, json!([]));
}

#[tokio::test]
async fn save_writes_a_checkpoint_on_demand() {
	let dir = tempfile::tempdir().unwrap();
	let db_path = dir.path().join("monitor.sqlite3");
	let mut store = MemoryStore::default();
	store
		.insert_import(
			ImportSpec {
				import_type: ServiceType::Ntp,
				af: Af::V4,
				ip: Some("9.9.9.9".parse().unwrap()),
				port: 123,
				user: None,
				password: None,
				fqn: None,
			},
			0,
		)
		.unwrap();
	let config = Config {
		db_path: db_path.clone(),
		..Config::default()
	};
	let app = router(AppState::new(store, Arc::new(config)));

	let (status, _, body) = call(&app, loopback(), "POST", "/save", None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, json!([]));
	assert!(db_path.exists());

	let mut restored = MemoryStore::default();
	roster::snapshot::restore(&db_path, &mut restored, 0).unwrap();
	assert_eq!(restored.imports.len(), 1);
}

#[tokio::test]
async fn every_response_is_marked_uncacheable() {
	let app = router(state_with_import());
	let (_, headers, _) = call(&app, loopback(), "GET", "/servers", None).await;
	assert_eq!(headers.get(header::PRAGMA).unwrap(), "no-cache");
	assert_eq!(headers.get(header::EXPIRES).unwrap(), "0");
	let (_, headers, _) = call(&app, remote(), "POST", "/work", Some(json!({}))).await;
	assert_eq!(
		headers.get(header::CACHE_CONTROL).unwrap(),
		"no-store, no-cache, must-revalidate, max-age=0"
	);
}
