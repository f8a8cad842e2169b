//! Read-only introspection API.
//!
//!   GET /health              liveness and local peer id
//!   GET /peers               admission state of every tracked peer
//!   GET /zones               latency zone statistics
//!   GET /rank/:capability    ranked providers of a capability

use std::{collections::BTreeMap, net::SocketAddr};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::{latency::ZoneStats, node::NodeHandle};

#[derive(Clone)]
pub struct ApiState {
    pub node: NodeHandle,
}

#[derive(Serialize)]
struct Health<'a> {
    status:  &'static str,
    peer_id: &'a str,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health",           get(get_health))
        .route("/peers",            get(get_peers))
        .route("/zones",            get(get_zones))
        .route("/rank/:capability", get(get_rank))
        .with_state(state)
}

pub async fn serve(state: ApiState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("API listener bind on {addr} failed: {e}"))?;

    tracing::info!("API listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("API server error: {e}"))
}

// ============================================================================
// Handlers
// ============================================================================

fn unavailable(e: anyhow::Error) -> Response {
    tracing::debug!("API request failed: {e}");
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
}

async fn get_health(State(state): State<ApiState>) -> Response {
    Json(Health { status: "ok", peer_id: state.node.local_peer() }).into_response()
}

async fn get_peers(State(state): State<ApiState>) -> Response {
    match state.node.peers().await {
        Ok(peers) => Json(peers).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn get_zones(State(state): State<ApiState>) -> Response {
    match state.node.zones().await {
        Ok(zones) => {
            let by_name: BTreeMap<String, ZoneStats> =
                zones.into_iter().map(|(z, s)| (z.to_string(), s)).collect();
            Json(by_name).into_response()
        }
        Err(e) => unavailable(e),
    }
}

async fn get_rank(State(state): State<ApiState>, Path(capability): Path<String>) -> Response {
    match state.node.rank(capability).await {
        Ok(ranked) => Json(ranked).into_response(),
        Err(e) => unavailable(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, identity::NodeIdentity, node::MeshNode};
    use agentmesh_resolver::NoopResolver;
    use clap::Parser;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn handle() -> (MeshNode, NodeHandle) {
        let config = Config::parse_from(["agentmesh-node"]).node_config().unwrap();
        let identity = NodeIdentity::generate();
        MeshNode::new(config, &identity, Arc::new(NoopResolver), CancellationToken::new())
    }

    #[tokio::test]
    async fn health_answers_without_the_node_loop() {
        let (_node, node) = handle();
        let resp = get_health(State(ApiState { node })).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn queries_report_unavailable_once_the_node_is_gone() {
        let (node_actor, node) = handle();
        drop(node_actor);
        let state = ApiState { node };
        assert_eq!(get_peers(State(state.clone())).await.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(get_zones(State(state.clone())).await.status(), StatusCode::SERVICE_UNAVAILABLE);
        let resp = get_rank(State(state), Path("translate".to_string())).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
