//! Startup and lifecycle wiring: restore the checkpoint, merge the seed
//! lists, serve the API, and keep the listing and checkpoint fresh until a
//! shutdown signal flushes one last snapshot.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::http::AppState;
use crate::store::MemoryStore;
use crate::{Config, catalogue, http, seed, snapshot, unix_now};

pub async fn run(config: Arc<Config>) -> anyhow::Result<Bound> {
	let now = unix_now();
	let mut store = MemoryStore::default();
	snapshot::restore(&config.db_path, &mut store, now)
		.with_context(|| format!("restoring {}", config.db_path.display()))?;
	if let Some(dir) = &config.seed_dir {
		let added = seed::merge_seed_dir(&mut store, dir, now);
		info!(added, dir = %dir.display(), "seed lists merged");
	}
	let state = AppState::new(store, config.clone());

	let (shutdown_tx, shutdown_rx) = watch::channel(false);

	let refresh_state = state.clone();
	let mut refresh_shutdown = shutdown_rx.clone();
	let refresh = tokio::spawn(async move {
		loop {
			refresh_cycle(&refresh_state).await;
			tokio::select! {
				_ = tokio::time::sleep(refresh_state.config.refresh_interval) => {},
				_ = refresh_shutdown.changed() => break,
			}
		}
	});

	let listener = tokio::net::TcpListener::bind(config.bind)
		.await
		.with_context(|| format!("binding {}", config.bind))?;
	let addr = listener.local_addr()?;
	info!(%addr, "dealer listening");
	let router = http::router(state.clone());
	let mut serve_shutdown = shutdown_rx;
	let server = tokio::spawn(async move {
		axum::serve(
			listener,
			router.into_make_service_with_connect_info::<SocketAddr>(),
		)
		.with_graceful_shutdown(async move {
			let _ = serve_shutdown.changed().await;
		})
		.await
	});

	Ok(Bound {
		state,
		shutdown_tx,
		server,
		refresh,
		addr,
	})
}

pub struct Bound {
	state: AppState,
	shutdown_tx: watch::Sender<bool>,
	server: JoinHandle<std::io::Result<()>>,
	refresh: JoinHandle<()>,
	pub addr: SocketAddr,
}

impl Bound {
	/// Block until a shutdown signal, then drain and write the final
	/// checkpoint so nothing since the last refresh tick is lost.
	pub async fn wait_termination(self) -> anyhow::Result<()> {
		wait_for_signal().await;
		let _ = self.shutdown_tx.send(true);
		match self.server.await {
			Ok(Ok(())) => {},
			Ok(Err(err)) => warn!(%err, "server shut down with error"),
			Err(err) => warn!(%err, "server task failed"),
		}
		let _ = self.refresh.await;
		flush_snapshot(&self.state).await;
		info!("final checkpoint written, exiting");
		Ok(())
	}
}

/// One refresh tick: rebuild and publish the listing, then checkpoint.
/// The store lock is held only while walking memory; the sqlite write runs
/// on a blocking thread over cloned rows.
pub async fn refresh_cycle(state: &AppState) {
	let now = unix_now();
	let (listing, data) = {
		let store = state.store.lock();
		(
			catalogue::build_listing(&store, now),
			snapshot::SnapshotData::collect(&store),
		)
	};
	match serde_json::to_string_pretty(&listing) {
		Ok(body) => state.listing.store(Arc::new(body)),
		Err(err) => warn!(%err, "failed to render listing"),
	}
	write_snapshot(state.config.db_path.clone(), data).await;
}

async fn flush_snapshot(state: &AppState) {
	let data = snapshot::SnapshotData::collect(&state.store.lock());
	write_snapshot(state.config.db_path.clone(), data).await;
}

async fn write_snapshot(path: std::path::PathBuf, data: snapshot::SnapshotData) {
	match tokio::task::spawn_blocking(move || snapshot::save(&path, &data)).await {
		Ok(Ok(())) => {},
		Ok(Err(err)) => warn!(%err, "checkpoint failed, previous one remains authoritative"),
		Err(err) => warn!(%err, "checkpoint task panicked"),
	}
}

#[cfg(unix)]
async fn wait_for_signal() {
	use tokio::signal::unix::{SignalKind, signal};
	let mut term = match signal(SignalKind::terminate()) {
		Ok(term) => term,
		Err(err) => {
			warn!(%err, "failed to register SIGTERM handler");
			let _ = tokio::signal::ctrl_c().await;
			return;
		},
	};
	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("received SIGINT, starting shutdown"),
		_ = term.recv() => info!("received SIGTERM, starting shutdown"),
	}
}

#[cfg(not(unix))]
async fn wait_for_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("received ctrl-c, starting shutdown");
}
