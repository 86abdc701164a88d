//! # stackd-server
//!
//! The stackd daemon: a control plane for a fleet of Docker Compose
//! projects on a single host. It keeps host ports and static IPs
//! conflict-free across all projects, drives service lifecycle through the
//! container CLI, bridges interactive terminals and log streams over
//! WebSockets, and edits the shared reverse-proxy config with rollback.
//!
//! ## Lifecycle
//!
//! 1. **Startup**: configuration comes from the environment; the mapper is
//!    reloaded from disk and an initial reconcile pass runs.
//! 2. **Steady state**: the reconciler ticks on an interval (skipped while
//!    a terminal session is attached); the HTTP surface serves the API,
//!    the WebSocket multiplexer, and the optional static UI.
//! 3. **Shutdown**: SIGINT/SIGTERM stop the listeners; PTY children die
//!    with their sessions.

#![warn(clippy::await_holding_lock)]
#![warn(clippy::unused_async)]
#![warn(unreachable_pub)]

pub mod api;
pub mod config;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod lifecycle;
pub mod mapper_store;
pub mod projects;
pub mod proxy_editor;
pub mod pty;
pub mod reconciler;
pub mod session;
pub mod state;
pub mod stats;
pub mod status;
pub mod terminals;

use crate::config::ServerConfig;
use crate::docker::DockerGateway;
use crate::lifecycle::LifecycleDriver;
use crate::mapper_store::MapperStore;
use crate::proxy_editor::{NginxControl, ProxyEditor};
use crate::reconciler::Reconciler;
use crate::session::SessionStore;
use crate::state::AppState;
use crate::terminals::ActiveTerminals;
use anyhow::{bail, Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[must_use]
pub fn build_state(config: ServerConfig) -> Arc<AppState> {
    let config = Arc::new(config);
    let terminals = Arc::new(ActiveTerminals::default());
    let mapper = Arc::new(MapperStore::open(config.mapper_file.clone()));
    let lifecycle = Arc::new(LifecycleDriver::new(Arc::clone(&config)));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&config),
        Arc::clone(&terminals),
        Arc::clone(&mapper),
        Arc::clone(&lifecycle),
    ));
    Arc::new(AppState {
        sessions: Arc::new(SessionStore::new(config.password.clone())),
        proxy: Arc::new(ProxyEditor::new(
            config.nginx_conf.clone(),
            Arc::new(NginxControl),
        )),
        docker: DockerGateway::connect(),
        config,
        terminals,
        mapper,
        lifecycle,
        reconciler,
    })
}

/// Single-run mode: one reconcile pass. Per-project problems are logged
/// and skipped; only a mapper write failure is fatal.
pub async fn run_once(config: ServerConfig) -> Result<()> {
    let state = build_state(config);
    let outcome = state.reconciler.tick_now().await;
    for error in &outcome.errors {
        warn!("reconcile: {error}");
    }
    info!(
        "reconciled {} project(s), {} write(s)",
        outcome.projects, outcome.writes
    );
    if let Some(fatal) = outcome.fatal {
        bail!("{fatal}");
    }
    Ok(())
}

/// Long-run mode: periodic reconciliation plus the HTTP/WebSocket surface.
/// Returns when signaled.
pub async fn run(config: ServerConfig) -> Result<()> {
    if config.password.is_none() {
        warn!("STACKD_PASSWORD is not set; login (and every protected endpoint) is disabled");
    }

    let state = build_state(config);
    info!(
        "workspace root: {}",
        state.config.root.display()
    );

    // Populate the mapper before the first request comes in.
    state.reconciler.tick_now().await;
    state.reconciler.spawn_interval();

    let app = api::router(Arc::clone(&state));

    let http_addr = SocketAddr::new(state.config.bind, state.config.http_port);
    let listener = tokio::net::TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("binding {http_addr}"))?;
    info!("listening on http://{http_addr}");

    if let Some(https_port) = state.config.https_port {
        match (&state.config.tls_cert, &state.config.tls_key) {
            (Some(cert), Some(key)) => {
                let rustls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .context("loading TLS certificate")?;
                let https_addr = SocketAddr::new(state.config.bind, https_port);
                let app = app.clone();
                tokio::spawn(async move {
                    info!("listening on https://{https_addr}");
                    if let Err(e) = axum_server::bind_rustls(https_addr, rustls)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                        .await
                    {
                        error!("https server error: {e}");
                    }
                });
            }
            _ => warn!("STACKD_HTTPS_PORT set without STACKD_TLS_CERT/STACKD_TLS_KEY; https disabled"),
        }
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("http server")?;

    info!("stackd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
