use std::net::IpAddr;

use axum::http::HeaderMap;

use crate::ApiError;

const API_KEY_HEADER: &str = "x-api-key";

/// Verify the shared key if one is configured.
///
/// Localhost connections may omit the key, but a key they do provide must
/// still match. Remote connections always need the key.
pub fn verify_api_key(
    configured: Option<&str>,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Result<(), ApiError> {
    let Some(expected) = configured else {
        return Ok(());
    };

    let provided = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    let is_local = peer.map(|ip| ip.is_loopback()).unwrap_or(false);

    if is_local {
        return match provided {
            Some(key) if key != expected => Err(ApiError::InvalidApiKey),
            _ => Ok(()),
        };
    }

    match provided {
        None => Err(ApiError::AuthRequired),
        Some(key) if key != expected => Err(ApiError::InvalidApiKey),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::net::Ipv4Addr;

    fn headers_with_key(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_str(key).unwrap());
        headers
    }

    const LOCAL: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::LOCALHOST));
    const REMOTE: Option<IpAddr> = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 9)));

    #[test]
    fn test_no_configured_key_allows_all() {
        assert!(verify_api_key(None, &HeaderMap::new(), REMOTE).is_ok());
    }

    #[test]
    fn test_localhost_may_omit_key() {
        assert!(verify_api_key(Some("secret"), &HeaderMap::new(), LOCAL).is_ok());
    }

    #[test]
    fn test_localhost_wrong_key_rejected() {
        let headers = headers_with_key("wrong");
        assert!(matches!(
            verify_api_key(Some("secret"), &headers, LOCAL),
            Err(ApiError::InvalidApiKey)
        ));
    }

    #[test]
    fn test_remote_requires_key() {
        assert!(matches!(
            verify_api_key(Some("secret"), &HeaderMap::new(), REMOTE),
            Err(ApiError::AuthRequired)
        ));
    }

    #[test]
    fn test_remote_with_matching_key_allowed() {
        let headers = headers_with_key("secret");
        assert!(verify_api_key(Some("secret"), &headers, REMOTE).is_ok());
    }

    #[test]
    fn test_remote_with_wrong_key_rejected() {
        let headers = headers_with_key("nope");
        assert!(matches!(
            verify_api_key(Some("secret"), &headers, REMOTE),
            Err(ApiError::InvalidApiKey)
        ));
    }
}
