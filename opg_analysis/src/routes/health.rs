use crate::server::SharedState;
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Status {
    status: String,
    version: String,
}

pub async fn healthcheck(State(state): State<SharedState>) -> Json<Status> {
    let status = match state.pipeline.ensure_available() {
        Ok(()) => "Available",
        Err(_) => "Unavailable",
    };
    Json(Status {
        status: status.into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}
