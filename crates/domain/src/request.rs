//! Captured HTTP request passed between the dispatcher, queues and the
//! invoker.
//!
//! The serializable part (method, url, path, peer address, form and header
//! maps) survives queue persistence and stats records; the body is a
//! detachable byte stream that is consumed exactly once.

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Marker wrapper asserting `Sync` for a value that is only ever accessed
/// through exclusive (`&mut`) access or moved, never shared across threads
/// concurrently. Needed so `Body` can sit inside `Sync` aggregates (e.g. the
/// stats ring) even though some underlying readers (like axum's body
/// stream) are themselves `!Sync`.
struct AssertSync<T>(T);
unsafe impl<T> Sync for AssertSync<T> {}

/// Opaque request body: any async byte reader.
pub struct Body(AssertSync<Pin<Box<dyn AsyncRead + Send + 'static>>>);

impl Body {
    pub fn new(reader: impl AsyncRead + Send + 'static) -> Self {
        Body(AssertSync(Box::pin(reader)))
    }

    pub fn empty() -> Self {
        Body(AssertSync(Box::pin(tokio::io::empty())))
    }

    pub fn into_reader(self) -> Pin<Box<dyn AsyncRead + Send + 'static>> {
        self.0 .0
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Body(..)")
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct CapturedRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub remote_address: String,
    /// First value wins for repeated form/query parameters.
    #[serde(default)]
    pub form: BTreeMap<String, String>,
    /// Header names are stored lowercased; first value wins.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip)]
    pub body: Option<Body>,
}

impl Clone for CapturedRequest {
    /// Shallow copy without the body stream.
    fn clone(&self) -> Self {
        CapturedRequest {
            method: self.method.clone(),
            url: self.url.clone(),
            path: self.path.clone(),
            remote_address: self.remote_address.clone(),
            form: self.form.clone(),
            headers: self.headers.clone(),
            body: None,
        }
    }
}

impl CapturedRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Replace the body stream, consuming the old one.
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    pub fn take_body(&mut self) -> Body {
        self.body.take().unwrap_or_else(Body::empty)
    }

    /// Client host without the port (`"1.2.3.4:5678"` → `"1.2.3.4"`,
    /// `"[::1]:80"` → `"::1"`).
    pub fn client_host(&self) -> &str {
        let addr = self.remote_address.as_str();
        if let Some(rest) = addr.strip_prefix('[') {
            if let Some(end) = rest.find(']') {
                return &rest[..end];
            }
        }
        match addr.rsplit_once(':') {
            // a second colon means a bare IPv6 address without port
            Some((host, _)) if !host.contains(':') => host,
            _ => addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn client_host_strips_port() {
        let mut req = CapturedRequest::default();
        req.remote_address = "10.0.0.1:4931".into();
        assert_eq!(req.client_host(), "10.0.0.1");
        req.remote_address = "[::1]:80".into();
        assert_eq!(req.client_host(), "::1");
        req.remote_address = "::1".into();
        assert_eq!(req.client_host(), "::1");
        req.remote_address = "localhost".into();
        assert_eq!(req.client_host(), "localhost");
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut req = CapturedRequest::default();
        req.headers.insert("authorization".into(), "TOKEN".into());
        assert_eq!(req.header("Authorization"), Some("TOKEN"));
        assert_eq!(req.header("AUTHORIZATION"), Some("TOKEN"));
        assert_eq!(req.header("origin"), None);
    }

    #[test]
    fn clone_drops_body() {
        let req = CapturedRequest::default().with_body(Body::new(&b"payload"[..]));
        let copy = req.clone();
        assert!(copy.body.is_none());
        assert!(req.body.is_some());
    }

    #[tokio::test]
    async fn take_body_yields_bytes() {
        let mut req = CapturedRequest::default().with_body(Body::new(&b"hello"[..]));
        let mut buf = Vec::new();
        req.take_body().into_reader().read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"hello");
        // subsequent takes read empty
        let mut buf = Vec::new();
        req.take_body().into_reader().read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
