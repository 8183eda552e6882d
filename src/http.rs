//! Request and response values exchanged with the transport and the cache.
//!
//! These are deliberately plain: the router and the sync queue only need a
//! method, a URL, headers and an opaque body. Header names are stored
//! lower-cased so lookups are case-insensitive.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Header set on responses served from the cache.
pub const HEADER_CACHE: &str = "x-cache";
/// Header set on synthetic responses produced while offline.
pub const HEADER_OFFLINE: &str = "x-offline";

/// HTTP method subset used by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    /// Only GET responses are stored by the cache strategies.
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        matches!(self, Self::Get)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    /// Path or absolute URL (e.g. `/api/daily`)
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    #[must_use]
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::Post, url).with_body(body)
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Identity used as the cache key: the URL without its fragment.
    #[must_use]
    pub fn cache_key(&self) -> String {
        match self.url.split_once('#') {
            Some((base, _)) => base.to_string(),
            None => self.url.clone(),
        }
    }

    /// URL path without query string or fragment, used for route matching.
    #[must_use]
    pub fn path(&self) -> &str {
        url_path(&self.url)
    }
}

/// Path component of an absolute or relative URL, without query or fragment.
#[must_use]
pub fn url_path(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            rest.find('/').map_or("/", |slash| &rest[slash..])
        }
        None => url,
    };
    let end = without_scheme
        .find(|c| c == '?' || c == '#')
        .unwrap_or(without_scheme.len());
    &without_scheme[..end]
}

/// A response, either from the network, the cache, or synthesised offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(200, body)
    }

    /// Synthetic response returned when neither network nor cache can answer.
    #[must_use]
    pub fn offline(status: u16) -> Self {
        Self::new(status, Bytes::new())
            .with_header(HEADER_CACHE, "miss")
            .with_header(HEADER_OFFLINE, "1")
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    #[must_use]
    pub fn served_from_cache(&self) -> bool {
        self.header(HEADER_CACHE) == Some("hit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_names_are_case_insensitive() {
        let req = Request::get("/a").with_header("Idempotency-Key", "abc");
        assert_eq!(req.header("idempotency-key"), Some("abc"));
        assert_eq!(req.header("IDEMPOTENCY-KEY"), Some("abc"));
    }

    #[test]
    fn test_path_strips_origin_query_and_fragment() {
        assert_eq!(Request::get("/api/daily?x=1").path(), "/api/daily");
        assert_eq!(Request::get("https://example.org/icons/a.svg#f").path(), "/icons/a.svg");
        assert_eq!(Request::get("https://example.org").path(), "/");
    }

    #[test]
    fn test_cache_key_drops_fragment_only() {
        assert_eq!(Request::get("/a?b=1#c").cache_key(), "/a?b=1");
    }

    #[test]
    fn test_offline_response_markers() {
        let resp = Response::offline(503);
        assert_eq!(resp.status, 503);
        assert_eq!(resp.header(HEADER_OFFLINE), Some("1"));
        assert!(!resp.served_from_cache());
    }

    #[test]
    fn test_only_get_is_cacheable() {
        assert!(Method::Get.is_cacheable());
        assert!(!Method::Post.is_cacheable());
        assert_eq!(Method::Patch.to_string(), "PATCH");
    }
}
