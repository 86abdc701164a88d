//! Shared state handed to every HTTP handler and WebSocket session.

use crate::config::ServerConfig;
use crate::docker::DockerGateway;
use crate::lifecycle::LifecycleDriver;
use crate::mapper_store::MapperStore;
use crate::proxy_editor::ProxyEditor;
use crate::reconciler::Reconciler;
use crate::session::SessionStore;
use crate::terminals::ActiveTerminals;
use std::sync::Arc;

pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: Arc<SessionStore>,
    pub terminals: Arc<ActiveTerminals>,
    pub mapper: Arc<MapperStore>,
    pub lifecycle: Arc<LifecycleDriver>,
    pub reconciler: Arc<Reconciler>,
    pub proxy: Arc<ProxyEditor>,
    pub docker: DockerGateway,
}
