//! Admin HTTP API.
//!
//! # Responsibilities
//! - `GET /admin/status`: version, uptime, live port and route counts
//! - `GET /admin/ports`: per port protocol, route ids, connections, cert hosts
//! - `GET /admin/drivers`: registered driver keys
//!
//! All endpoints sit behind Bearer-token auth.

pub mod auth;
pub mod handlers;

use axum::{middleware, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::lifecycle::Gateway;

#[derive(Clone)]
pub struct AdminState {
    pub gateway: Arc<Gateway>,
    pub api_key: Arc<str>,
    pub started: Instant,
}

impl AdminState {
    pub fn new(gateway: Arc<Gateway>, api_key: &str) -> Self {
        Self {
            gateway,
            api_key: Arc::from(api_key),
            started: Instant::now(),
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/ports", get(get_ports))
        .route("/admin/drivers", get(get_drivers))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");

    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    tracing::info!("Admin API stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn state() -> AdminState {
        let gateway = Gateway::new(&GatewayConfig::default()).unwrap();
        AdminState::new(Arc::new(gateway), "secret")
    }

    #[tokio::test]
    async fn test_rejects_missing_token() {
        let response = setup_admin_router(state())
            .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_lists_drivers() {
        let response = setup_admin_router(state())
            .oneshot(
                Request::get("/admin/drivers")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), 1 << 16).await.unwrap();
        let keys: Vec<String> = serde_json::from_slice(&body).unwrap();
        assert!(keys.contains(&"edge:gateway:auth_apikey".to_string()));
    }
}
