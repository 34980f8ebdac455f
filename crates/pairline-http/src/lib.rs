//! HTTP gateway for pairline.
//!
//! Turns pairing requests into orchestrator calls and streams lifecycle
//! events over WebSocket.
//!
//! | Route              | Purpose                                   |
//! |--------------------|-------------------------------------------|
//! | `GET /pair`        | `?number=<phone>` start a pairing attempt |
//! | `POST /api/pair`   | `{"phoneNumber": ...}` same, JSON body    |
//! | `GET /api/sessions`| live attempt snapshots                    |
//! | `GET /ws/events`   | lifecycle events with pattern filters     |
//! | `GET /health`      | liveness                                  |

mod routes;
mod state;
mod websocket;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};

pub use routes::{error_status, ErrorResponse, PairRequest, PairResponse};
pub use state::SharedState;

/// Handle to a running HTTP server.
#[derive(Default)]
pub struct HttpServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<std::thread::JoinHandle<()>>,
}

impl HttpServerHandle {
    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    /// Stop the server gracefully and wait for its thread.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.join();
        }
    }
}

/// Build the gateway router over `state`.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/pair", get(routes::pair_query_handler))
        .route("/api/pair", post(routes::pair_json_handler))
        .route("/api/sessions", get(routes::sessions_handler))
        .route("/health", get(routes::health_handler))
        .route("/ws/events", get(websocket::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Start the HTTP server on the given host and port.
///
/// The server runs in a separate thread with its own tokio runtime; pairing
/// attempts started through it run on that runtime too.
pub fn start(state: Arc<SharedState>, host: &str, port: u16) -> Result<HttpServerHandle, String> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let task = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                log::error!("Failed to create HTTP runtime: {}", e);
                return;
            }
        };

        rt.block_on(async move {
            let app = router(state);

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    log::error!("Failed to bind HTTP server to {}: {}", addr, e);
                    return;
                }
            };

            log::info!("HTTP server listening on http://{}", addr);

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                    log::info!("HTTP server shutting down");
                })
                .await
                .ok();
        });
    });

    Ok(HttpServerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

// ============================================================================
// TESTS
// ============================================================================
