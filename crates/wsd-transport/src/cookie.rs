//! Correlation-token extraction from `Cookie` headers.

use axum::http::{HeaderMap, header::COOKIE};
use wsd_protocol::CorrelationToken;

/// Read the correlation token from a request's cookies.
///
/// With a `key`, the value of that cookie is the token. Without one, the
/// whole `Cookie` header is treated as the token.
pub fn correlation_token(headers: &HeaderMap, key: Option<&str>) -> Option<CorrelationToken> {
    let cookies: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if cookies.is_empty() {
        return None;
    }

    match key {
        None => Some(CorrelationToken::new(cookies.join("; "))),
        Some(key) => cookies
            .iter()
            .flat_map(|header| header.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| name.trim() == key)
            .map(|(_, value)| value.trim().trim_matches('"'))
            .filter(|value| !value.is_empty())
            .map(CorrelationToken::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(values: &[&str]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for v in values {
            map.append(COOKIE, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn no_cookie_header_means_no_token() {
        assert!(correlation_token(&HeaderMap::new(), None).is_none());
        assert!(correlation_token(&HeaderMap::new(), Some("session")).is_none());
    }

    #[test]
    fn whole_header_is_the_token_without_a_key() {
        let map = headers(&["session=abc; theme=dark"]);
        assert_eq!(
            correlation_token(&map, None),
            Some(CorrelationToken::new("session=abc; theme=dark"))
        );
    }

    #[test]
    fn keyed_lookup_finds_the_named_cookie() {
        let map = headers(&["theme=dark; session=\"abc\"", "other=1"]);
        assert_eq!(
            correlation_token(&map, Some("session")),
            Some(CorrelationToken::new("abc"))
        );
        assert_eq!(
            correlation_token(&map, Some("other")),
            Some(CorrelationToken::new("1"))
        );
        assert!(correlation_token(&map, Some("missing")).is_none());
    }

    #[test]
    fn empty_cookie_value_is_ignored() {
        let map = headers(&["session="]);
        assert!(correlation_token(&map, Some("session")).is_none());
    }
}
