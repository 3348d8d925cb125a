//! Node roles, link modes and transport endpoint addresses.
//!
//! Addresses use the ZeroMQ-style URL form: `ipc://<path>` for a Unix domain
//! socket or `tcp://<host>:<port>`. Prefixing an address with `bind:` or
//! `connect:` pins its link mode regardless of the node-wide default.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("address is empty")]
    Empty,
    #[error("unsupported transport in address {0:?} (expected ipc:// or tcp://)")]
    UnknownScheme(String),
    #[error("ipc address {0:?} has no path")]
    MissingPath(String),
    #[error("tcp address {0:?} must be host:port")]
    BadTcp(String),
}

/// What a node does with its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Publish,
    Subscribe,
    Push,
    Pull,
}

impl Role {
    /// Publish and pull bind; subscribe and push connect.
    pub fn default_link(self) -> Link {
        match self {
            Role::Publish | Role::Pull => Link::Bind,
            Role::Subscribe | Role::Push => Link::Connect,
        }
    }

    /// Whether the node writes to its socket (as opposed to reading).
    pub fn is_sender(self) -> bool {
        matches!(self, Role::Publish | Role::Push)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Publish => "publish",
            Role::Subscribe => "subscribe",
            Role::Push => "push",
            Role::Pull => "pull",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Link {
    /// Passive: listen at the address and accept peers.
    Bind,
    /// Active: dial a peer listening at the address.
    Connect,
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Link::Bind => "bind",
            Link::Connect => "connect",
        })
    }
}

impl FromStr for Link {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bind" => Ok(Link::Bind),
            "connect" => Ok(Link::Connect),
            other => Err(format!("unknown link mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Unix domain socket at a filesystem path.
    Ipc(PathBuf),
    /// `host:port`; a host of `*` means every interface when binding.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// The `host:port` string handed to the socket layer. `*` becomes
    /// `0.0.0.0`.
    pub fn tcp_target(&self) -> Option<String> {
        match self {
            Endpoint::Tcp { host, port } if host == "*" => Some(format!("0.0.0.0:{port}")),
            Endpoint::Tcp { host, port } if host.contains(':') => Some(format!("[{host}]:{port}")),
            Endpoint::Tcp { host, port } => Some(format!("{host}:{port}")),
            Endpoint::Ipc(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Endpoint::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }
        if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(AddressError::MissingPath(s.to_string()));
            }
            return Ok(Endpoint::Ipc(PathBuf::from(path)));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| AddressError::BadTcp(s.to_string()))?;
            let host = host.trim_start_matches('[').trim_end_matches(']');
            let port: u16 = port.parse().map_err(|_| AddressError::BadTcp(s.to_string()))?;
            if host.is_empty() {
                return Err(AddressError::BadTcp(s.to_string()));
            }
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        Err(AddressError::UnknownScheme(s.to_string()))
    }
}

/// An address as written by the user: an endpoint plus an optional pinned
/// link mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressSpec {
    pub endpoint: Endpoint,
    pub link: Option<Link>,
}

impl AddressSpec {
    /// Pin the link mode: an explicit per-address prefix wins over `fallback`.
    pub fn resolve(&self, fallback: Link) -> Binding {
        Binding {
            endpoint: self.endpoint.clone(),
            link: self.link.unwrap_or(fallback),
        }
    }
}

impl FromStr for AddressSpec {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (link, rest) = if let Some(rest) = s.strip_prefix("bind:") {
            (Some(Link::Bind), rest)
        } else if let Some(rest) = s.strip_prefix("connect:") {
            (Some(Link::Connect), rest)
        } else {
            (None, s)
        };
        Ok(AddressSpec {
            endpoint: rest.parse()?,
            link,
        })
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.link {
            Some(link) => write!(f, "{link}:{}", self.endpoint),
            None => write!(f, "{}", self.endpoint),
        }
    }
}

/// A fully resolved (endpoint, link) pair, ready for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub endpoint: Endpoint,
    pub link: Link,
}

impl Binding {
    pub fn bind(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: Link::Bind,
        }
    }

    pub fn connect(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            link: Link::Connect,
        }
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.link, self.endpoint)
    }
}
