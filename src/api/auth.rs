// =============================================================================
// Admin Bearer Authentication
// =============================================================================
//
// The webhook path authenticates itself (the token in the URL is the
// credential); only the /internal control endpoints use this extractor. The
// expected token comes from JT_ADMIN_TOKEN and is compared in constant time.
// An unset JT_ADMIN_TOKEN locks the control surface rather than opening it.
// =============================================================================

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::warn;

const ADMIN_TOKEN_ENV: &str = "JT_ADMIN_TOKEN";

/// Compare two byte slices in constant time. Every byte of both slices is
/// examined even after a mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Axum extractor validating `Authorization: Bearer <token>` against
/// `JT_ADMIN_TOKEN`. Yields the raw token for audit logging.
pub struct AdminBearer(pub String);

pub struct AdminRejection {
    status: StatusCode,
    message: &'static str,
}

impl IntoResponse for AdminRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, axum::Json(body)).into_response()
    }
}

impl<S> FromRequestParts<S> for AdminBearer
where
    S: Send + Sync,
{
    type Rejection = AdminRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // Read on every request so token rotation needs no restart.
        let expected = std::env::var(ADMIN_TOKEN_ENV).unwrap_or_default();
        if expected.is_empty() {
            warn!("{ADMIN_TOKEN_ENV} is not set — control endpoints are locked");
            return Err(AdminRejection {
                status: StatusCode::FORBIDDEN,
                message: "admin authentication not configured",
            });
        }

        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let token = match header {
            Some(value) if value.starts_with("Bearer ") => &value[7..],
            _ => {
                return Err(AdminRejection {
                    status: StatusCode::FORBIDDEN,
                    message: "missing or malformed authorization header",
                });
            }
        };

        if !constant_time_eq(token.as_bytes(), expected.as_bytes()) {
            warn!("invalid admin token presented");
            return Err(AdminRejection {
                status: StatusCode::FORBIDDEN,
                message: "invalid authorization token",
            });
        }

        Ok(AdminBearer(token.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
