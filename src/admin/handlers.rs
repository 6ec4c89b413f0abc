use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::router::PortStatus;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub uptime_secs: u64,
    pub ports: usize,
    pub routes: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let ports = state.gateway.manager().ports().await;
    let status = if state.gateway.manager().is_cancelled() {
        "shutting_down"
    } else {
        "operational"
    };
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        uptime_secs: state.started.elapsed().as_secs(),
        ports: ports.len(),
        routes: ports.iter().map(|p| p.routes.len()).sum(),
    })
}

pub async fn get_ports(State(state): State<AdminState>) -> Json<Vec<PortStatus>> {
    Json(state.gateway.manager().ports().await)
}

pub async fn get_drivers(State(state): State<AdminState>) -> Json<Vec<String>> {
    Json(state.gateway.registry().keys())
}
