//! Network surface of the execution service: session lifecycle, code
//! execution (synchronous and SSE-streamed), plugins, variables, file
//! upload, and artifact download under `/api/v1`.

mod auth;
mod error;
mod manager;
mod models;
mod routes;

pub use auth::verify_api_key;
pub use error::ApiError;
pub use manager::{
    ArtifactFallback, KernelFactory, ProcessKernelFactory, SessionManager, SessionManagerConfig,
    StreamFrame,
};
pub use models::*;
pub use routes::{router, AppState};

use std::net::SocketAddr;
use std::sync::Arc;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Serve the execution API until the listener fails or the task is
/// cancelled.
pub async fn run_server(
    manager: Arc<SessionManager>,
    api_key: Option<String>,
    listen: SocketAddr,
) -> std::io::Result<()> {
    let state = AppState::new(manager, api_key);
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "execution server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}
