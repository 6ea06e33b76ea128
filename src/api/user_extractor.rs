use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap, StatusCode},
};
use crate::model::UserContext;

/// Axum extractor for UserContext from request headers
///
/// - X-User-Id: Required user identifier
/// - X-User-Name: Optional user display name
///
/// Requests without a usable X-User-Id are rejected with 401.
#[async_trait]
impl<S> FromRequestParts<S> for UserContext
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;

        match extract_header_value(headers, "x-user-id") {
            Some(user_id) => {
                let user_name = extract_header_value(headers, "x-user-name");
                Ok(UserContext::with_name(&user_id, user_name))
            }
            None => Err(StatusCode::UNAUTHORIZED),
        }
    }
}

/// Extract a non-blank header value as a trimmed string
fn extract_header_value(headers: &HeaderMap, header_name: &str) -> Option<String> {
    headers
        .get(header_name)
        .and_then(|value| value.to_str().ok())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
