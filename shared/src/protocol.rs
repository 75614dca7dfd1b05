//! Wire protocol types for the ship↔offshore link.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Maximum size of one wire frame (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Method token that selects tunnel establishment instead of a fetch
pub const METHOD_CONNECT: &str = "CONNECT";

/// How long the ship waits for a tunnel acknowledgment
pub const CONNECT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// One forward-proxy operation, sent ship → offshore as a single frame.
///
/// CONNECT frames carry only `method`, `hostname` and `port`; every other
/// field defaults to empty on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        with = "crate::codec::base64_bytes"
    )]
    pub body: Vec<u8>,
}

impl ProxyRequest {
    /// Build the reduced tunnel-open frame for a CONNECT target
    pub fn connect(hostname: impl Into<String>, port: u16) -> Self {
        Self {
            method: METHOD_CONNECT.to_string(),
            protocol: String::new(),
            hostname: hostname.into(),
            port,
            path: String::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case(METHOD_CONNECT)
    }

    /// Absolute URL of the real target, for the offshore fetcher
    pub fn target_url(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        format!("{}://{}:{}{}", self.protocol, self.hostname, self.port, path)
    }
}

/// Response to a non-CONNECT frame, sent offshore → ship as a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyResponse {
    #[serde(rename = "statusCode", default)]
    pub status_code: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, with = "crate::codec::base64_bytes")]
    pub body: Vec<u8>,
}

/// Acknowledgment of a CONNECT frame.
///
/// Unlike everything else on the wire this is a literal HTTP status line,
/// not JSON. The asymmetry is a compatibility contract; only the codec
/// sees the textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectAck {
    Established,
    Failed { status: u16 },
}

impl ConnectAck {
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectAck::Established)
    }
}
