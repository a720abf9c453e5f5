//! Shared application state passed to all API handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::auth::AdminAuth;
use crate::platform::{Registry, Workspace};
use crate::policy;
use crate::queues;
use crate::stats;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub policies: Arc<policy::Engine>,
    pub queues: Arc<queues::Manager>,
    pub stats: Arc<stats::Recorder>,
    pub auth: Arc<AdminAuth>,
    pub workspace: Arc<Workspace>,
    /// Root cancellation: shutdown kills in-flight children through it.
    pub cancel: CancellationToken,
    /// Trust `X-Forwarded-For` / `X-Real-Ip` for the client address.
    pub behind_proxy: bool,
    /// Dev mode: permissive CORS on the admin endpoint.
    pub dev: bool,
}
