//! Re-synthesis of the public ranked listing. The whole store is walked,
//! scored and serialized once per refresh period; `/servers` only ever
//! returns the cached string.

use itertools::Itertools;
use serde_json::{Map, Value};
use tracing::debug;

use crate::store::MemoryStore;
use crate::types::{Af, Proto, ServiceType, Status, TableType};

/// Reliability score in [0, 1].
///
/// `uptime / max_uptime` measures how much of the best continuous run the
/// current run has recovered; the `0.5 + 0.5 * ratio` floor keeps a freshly
/// restarted but otherwise reliable server from losing more than half its
/// weight. The exponential term discounts servers with little history.
pub fn compute_score(status: &Status) -> f64 {
	let failed_tests = status.failed_tests as f64;
	let test_no = status.test_no as f64;
	let uptime = status.uptime as f64;
	let max_uptime = status.max_uptime as f64;

	let uptime_ratio = if max_uptime > 0.0 {
		(uptime / max_uptime).clamp(0.0, 1.0)
	} else {
		0.0
	};
	let test_factor = 1.0 - failed_tests / (test_no + 1e-9);
	let smoothing = 1.0 - (-test_no / 50.0).exp();
	(test_factor * (0.5 * uptime_ratio + 0.5) * smoothing).clamp(0.0, 1.0)
}

/// Build the `service type -> address family -> protocol -> [group]`
/// listing. Every combination is present even when empty, each row carries
/// its status fields, and every member of a group gets the group's mean
/// score so cohorts sort as one unit.
pub fn build_listing(store: &MemoryStore, now: u64) -> Value {
	let mut root = Map::new();
	for service_type in ServiceType::ALL {
		let mut by_af = Map::new();
		for af in Af::ALL {
			let mut by_proto = Map::new();
			for proto in Proto::ALL {
				by_proto.insert(proto.catalogue_key().into(), Value::Array(Vec::new()));
			}
			by_af.insert(af.catalogue_key().into(), Value::Object(by_proto));
		}
		root.insert(service_type.catalogue_key().into(), Value::Object(by_af));
	}

	for group_id in store.groups.keys().sorted() {
		let group = &store.groups[group_id];
		if group.table_type != TableType::Services {
			continue;
		}
		let mut slot = None;
		let mut rows = Vec::new();
		let mut scores = Vec::new();
		for row_id in &group.rows {
			let Some(service) = store.services.get(row_id) else {
				debug!(group_id, row_id, "group member missing from services table");
				continue;
			};
			let Some(mut row) = store.row_value(TableType::Services, *row_id) else {
				continue;
			};
			slot.get_or_insert((service.service_type, service.af, service.proto));
			if let Some(status) = store.statuses.get(&service.status_id) {
				let fields = row.as_object_mut().expect("rows serialize to objects");
				fields.insert("test_no".into(), status.test_no.into());
				fields.insert("failed_tests".into(), status.failed_tests.into());
				fields.insert("uptime".into(), status.uptime.into());
				fields.insert("max_uptime".into(), status.max_uptime.into());
				fields.insert(
					"last_success".into(),
					status.last_success.map_or(Value::Null, Into::into),
				);
				let score = compute_score(status);
				fields.insert("score".into(), score.into());
				fields.insert(
					"fqns".into(),
					Value::Array(
						store
							.fqns_for_ip(&service.ip)
							.into_iter()
							.map(Value::String)
							.collect(),
					),
				);
				scores.push(score);
			}
			rows.push(row);
		}
		let Some((service_type, af, proto)) = slot else {
			continue;
		};
		if !scores.is_empty() {
			let mean = scores.iter().sum::<f64>() / scores.len() as f64;
			for row in &mut rows {
				row
					.as_object_mut()
					.expect("rows serialize to objects")
					.insert("score".into(), mean.into());
			}
		}
		if let Some(bucket) = bucket_mut(&mut root, service_type, af, proto) {
			bucket.push(Value::Array(rows));
		}
	}

	// Members of a group share a score, so sorting on the first member
	// reorders groups relative to each other without disturbing cohorts.
	for service_type in ServiceType::ALL {
		for af in Af::ALL {
			for proto in Proto::ALL {
				if let Some(bucket) = bucket_mut(&mut root, service_type, af, proto) {
					bucket.sort_by(|a, b| {
						let score = |g: &Value| {
							g.get(0)
								.and_then(|r| r.get("score"))
								.and_then(Value::as_f64)
								.unwrap_or(0.0)
						};
						score(b).total_cmp(&score(a))
					});
				}
			}
		}
	}

	root.insert("timestamp".into(), now.into());
	Value::Object(root)
}

fn bucket_mut<'a>(
	root: &'a mut Map<String, Value>,
	service_type: ServiceType,
	af: Af,
	proto: Proto,
) -> Option<&'a mut Vec<Value>> {
	root
		.get_mut(service_type.catalogue_key())?
		.get_mut(af.catalogue_key())?
		.get_mut(proto.catalogue_key())?
		.as_array_mut()
}
