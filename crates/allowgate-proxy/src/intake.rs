//! Whitelist request endpoint.
//!
//! The blocked page posts `{"domain": ..., "description": ...}` here. The
//! page is served under whatever origin the browser tried to reach, so every
//! answer carries permissive CORS headers.

use std::sync::Arc;

use allowgate_storage::{RequestIntake, StorageError, WhitelistRequest};

use crate::response::Response;

/// Path prefix the blocked page submits to.
pub const REQUEST_WHITELIST_PATH: &str = "/request_whitelist";

const ALLOW_ORIGIN: &str = "Access-Control-Allow-Origin";

/// Returns `true` for paths handled by the submission endpoint.
pub fn is_intake_path(path: &str) -> bool {
    path.starts_with(REQUEST_WHITELIST_PATH)
}

/// Answer to a CORS preflight on the submission path.
pub fn preflight() -> Response {
    Response::new(200, "OK")
        .header(ALLOW_ORIGIN, "*")
        .header("Access-Control-Allow-Methods", "POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

/// Accepts submitted whitelist requests.
#[derive(Debug, Clone)]
pub struct IntakeEndpoint {
    intake: Arc<RequestIntake>,
}

impl IntakeEndpoint {
    pub fn new(intake: Arc<RequestIntake>) -> Self {
        Self { intake }
    }

    /// Parses and stores a submission body.
    ///
    /// Malformed JSON or an invalid domain gets a 400 and nothing is written.
    pub async fn submit(&self, body: &[u8]) -> Response {
        let request: WhitelistRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!("Rejecting malformed whitelist request: {}", e);
                return Response::bad_request(&e).header(ALLOW_ORIGIN, "*");
            }
        };

        let intake = Arc::clone(&self.intake);
        let stored = tokio::task::spawn_blocking(move || intake.submit(&request)).await;

        let response = match stored {
            Ok(Ok(submitted)) => {
                tracing::info!("Received whitelist request for {}", submitted.domain);
                Response::text(200, "OK", "OK")
            }
            Ok(Err(e @ StorageError::InvalidDomain(_))) => {
                tracing::debug!("Rejecting whitelist request: {}", e);
                Response::bad_request(&e)
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to store whitelist request: {}", e);
                Response::internal_error(&e)
            }
            Err(e) => {
                tracing::error!("Whitelist request task failed: {}", e);
                Response::internal_error(&e)
            }
        };

        response.header(ALLOW_ORIGIN, "*")
    }
}
