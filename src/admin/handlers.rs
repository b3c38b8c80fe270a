use std::time::Duration;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::http::response::json_message;
use crate::http::server::AppState;
use crate::security::{Limit, GLOBAL_KEY};

/// Body of `POST /clients`. `period` is a humantime string such as `"1m"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientRequest {
    pub client_id: String,
    pub rate: u32,
    pub period: String,
}

#[derive(Debug, Deserialize)]
pub struct ClientQuery {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLimit {
    pub client_id: String,
    pub rate: u32,
    pub period: String,
}

impl ClientLimit {
    fn new(client_id: &str, limit: Limit) -> Self {
        Self {
            client_id: client_id.to_string(),
            rate: limit.rate(),
            period: humantime::format_duration(limit.period()).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub address: String,
    pub alive: bool,
    pub active_connections: usize,
}

fn bad_request(message: impl Into<String>) -> Response {
    json_message(StatusCode::BAD_REQUEST, message)
}

/// The id must be usable as a bucket key and must not shadow the global one.
fn check_client_id(client_id: &str) -> Result<(), Response> {
    if client_id.trim().is_empty() {
        return Err(bad_request("client_id is required"));
    }
    if client_id == GLOBAL_KEY {
        return Err(bad_request(format!("client_id {GLOBAL_KEY:?} is reserved")));
    }
    Ok(())
}

pub async fn create_client(
    State(state): State<AppState>,
    payload: Result<Json<CreateClientRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if let Err(response) = check_client_id(&request.client_id) {
        return response;
    }

    let period: Duration = match humantime::parse_duration(&request.period) {
        Ok(period) => period,
        Err(e) => return bad_request(format!("invalid period {:?}: {e}", request.period)),
    };
    let limit = match Limit::new(request.rate, period) {
        Ok(limit) => limit,
        Err(e) => return bad_request(e.to_string()),
    };

    state.limiter.set_client_limit(&request.client_id, limit);
    tracing::info!(
        client = %request.client_id,
        rate = limit.rate(),
        period = ?limit.period(),
        "Client limit created"
    );

    (
        StatusCode::CREATED,
        Json(ClientLimit::new(&request.client_id, limit)),
    )
        .into_response()
}

pub async fn delete_client(
    State(state): State<AppState>,
    query: Result<Query<ClientQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    if let Err(response) = check_client_id(&query.client_id) {
        return response;
    }

    state.limiter.remove_client_limit(&query.client_id);
    tracing::info!(client = %query.client_id, "Client limit removed");
    json_message(StatusCode::OK, "Client limit removed")
}

pub async fn get_client(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    match state.limiter.get_limit(&client_id) {
        Some(limit) => Json(ClientLimit::new(&client_id, limit)).into_response(),
        None => json_message(StatusCode::NOT_FOUND, "Client not found"),
    }
}

pub async fn get_backends(State(state): State<AppState>) -> Json<Vec<BackendStatus>> {
    let statuses = state
        .forwarder
        .balancer()
        .backends()
        .iter()
        .map(|b| BackendStatus {
            address: b.address().to_string(),
            alive: b.is_alive(),
            active_connections: b.active_connections(),
        })
        .collect();

    Json(statuses)
}
