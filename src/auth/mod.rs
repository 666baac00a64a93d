pub mod middleware;

use axum::http::HeaderMap;

/// Header carrying a device's API key on poll requests.
pub const DEVICE_TOKEN_HEADER: &str = "access-token";

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub fn device_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(DEVICE_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        headers.insert("access-token", HeaderValue::from_static(" dev-1 "));
        assert_eq!(bearer_token(&headers), Some("abc"));
        assert_eq!(device_token(&headers), Some("dev-1"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }
}
