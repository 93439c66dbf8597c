//! Relay addressing. Rewritten targets embed the original URL as the raw
//! query string with no additional escaping; the relay splits on the first
//! `?` and treats everything after it as opaque.

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1:48897";

/// Where redirected traffic lands. `host` is the bare authority used for
/// socket rewrites; `origin` is a full `scheme://authority` used for
/// request rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddress {
    host: String,
    origin: String,
}

impl RelayAddress {
    pub fn new(host: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            origin: origin.into(),
        }
    }

    /// Relay reachable over plain HTTP on `host`.
    pub fn from_host(host: impl Into<String>) -> Self {
        let host = host.into();
        let origin = format!("http://{host}");
        Self { host, origin }
    }

    pub fn socket_url(&self, original: &str) -> String {
        format!("ws://{}/socket?{}", self.host, original)
    }

    pub fn request_url(&self, original: &str) -> String {
        format!("{}/request?{}", self.origin, original)
    }
}

impl Default for RelayAddress {
    fn default() -> Self {
        Self::from_host(DEFAULT_RELAY_HOST)
    }
}
