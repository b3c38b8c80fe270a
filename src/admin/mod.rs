//! Client limit management and backend inspection.
//!
//! ```text
//! POST   /clients               create or replace a client limit
//! DELETE /clients?client_id=    remove a client limit
//! GET    /clients/{client_id}   limit currently in force
//! GET    /admin/backends        address, liveness, in-flight requests
//! ```

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn setup_admin_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/clients", post(create_client).delete(delete_client))
        .route("/clients/{client_id}", get(get_client))
        .route("/admin/backends", get(get_backends))
        .layer(middleware::from_fn_with_state(state, admin_auth_middleware))
}
