//! Endpoint addressing: every node is reachable at a URL such as
//! `tcp://127.0.0.1:9000` or `ws://host:port`.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::TransportError;

/// The wire transports an [`Endpoint`] can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Length-delimited frames over a raw TCP stream.
    Tcp,
    /// Binary WebSocket messages.
    WebSocket,
}

impl Scheme {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tcp" => Some(Self::Tcp),
            "ws" => Some(Self::WebSocket),
            _ => None,
        }
    }

    /// The URL scheme string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
        }
    }
}

/// A validated node address.
///
/// Construction guarantees a supported scheme, a host and a port, so
/// [`Endpoint::authority`] never fails afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Url", into = "Url")]
pub struct Endpoint(Url);

impl Endpoint {
    /// Parses and validates an endpoint URL.
    pub fn parse(raw: &str) -> Result<Self, TransportError> {
        let url = Url::parse(raw)
            .map_err(|e| TransportError::InvalidEndpoint(raw.to_string(), e.to_string()))?;
        Self::try_from(url)
    }

    /// Builds a `tcp://` endpoint for a socket address.
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::from_socket_addr(Scheme::Tcp, addr)
    }

    /// Builds an endpoint of the given scheme for a socket address.
    pub fn from_socket_addr(scheme: Scheme, addr: SocketAddr) -> Self {
        let raw = format!("{}://{}", scheme.as_str(), addr);
        Self(Url::parse(&raw).expect("a formatted socket address is a valid authority"))
    }

    /// Returns the transport scheme.
    pub fn scheme(&self) -> Scheme {
        Scheme::parse(self.0.scheme()).unwrap_or(Scheme::Tcp)
    }

    /// Returns `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        let host = self.0.host_str().unwrap_or("localhost");
        let port = self.0.port_or_known_default().unwrap_or(0);
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Returns the same endpoint with a different port. Used after binding
    /// to port `0` to learn the address peers should use.
    pub fn with_port(&self, port: u16) -> Self {
        let mut url = self.0.clone();
        // Only fails for cannot-be-a-base URLs, which validation rejects.
        let _ = url.set_port(Some(port));
        Self(url)
    }

    /// Returns the underlying URL.
    pub fn as_url(&self) -> &Url {
        &self.0
    }
}

impl TryFrom<Url> for Endpoint {
    type Error = TransportError;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        if Scheme::parse(url.scheme()).is_none() {
            return Err(TransportError::UnsupportedScheme(url.scheme().to_string()));
        }
        if url.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint(url.to_string(), "missing host".into()));
        }
        if url.port_or_known_default().is_none() {
            return Err(TransportError::InvalidEndpoint(url.to_string(), "missing port".into()));
        }
        Ok(Self(url))
    }
}

impl From<Endpoint> for Url {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.0
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Url keeps a trailing "/" for authorities without a path; peers
        // compare endpoints as strings, so print the canonical form.
        let raw = self.0.as_str();
        f.write_str(raw.strip_suffix('/').unwrap_or(raw))
    }
}
