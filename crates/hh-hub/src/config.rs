use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use hh_types::address::{AddressSpec, Binding, Endpoint, Link, Role};
use hh_types::config::{HubConfig, TransportConfig, DEFAULT_IPC_NAME};

use crate::transport::SocketOptions;

/// Directory holding the well-known IPC socket: `$XDG_RUNTIME_DIR` when set,
/// otherwise the home directory.
pub fn hub_runtime_dir() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// The address every node uses when given none (`<runtime dir>/hhub.ipc`).
pub fn default_endpoint() -> Endpoint {
    Endpoint::Ipc(hub_runtime_dir().join(DEFAULT_IPC_NAME))
}

/// Returns the default config file path (`~/.config/hhub/config.toml`).
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hhub").join("config.toml"))
}

/// Load the hub config.
///
/// An explicit path must exist. The default path is optional; when it is
/// missing the built-in defaults apply.
pub fn load_config(explicit: Option<&Path>) -> Result<HubConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(HubConfig::default()),
        },
    };

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let config: HubConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config at {}", path.display()))?;
    tracing::debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Turn user-supplied addresses into concrete bindings for `role`.
///
/// Precedence: `specs` (command line), then the config file's addresses,
/// then the well-known default endpoint. Each address keeps its own
/// `bind:`/`connect:` prefix; otherwise `link` applies, otherwise the role
/// default.
pub fn resolve_bindings(
    role: Role,
    specs: &[AddressSpec],
    link: Option<Link>,
    transport: &TransportConfig,
) -> Result<Vec<Binding>> {
    let fallback = link.unwrap_or_else(|| role.default_link());

    let from_config;
    let specs = if !specs.is_empty() {
        specs
    } else if !transport.addresses.is_empty() {
        from_config = transport
            .addresses
            .iter()
            .map(|a| {
                a.parse::<AddressSpec>()
                    .with_context(|| format!("Invalid address {a:?} in config"))
            })
            .collect::<Result<Vec<_>>>()?;
        &from_config[..]
    } else {
        return Ok(vec![Binding {
            endpoint: default_endpoint(),
            link: fallback,
        }]);
    };

    Ok(specs.iter().map(|s| s.resolve(fallback)).collect())
}

impl From<&TransportConfig> for SocketOptions {
    fn from(cfg: &TransportConfig) -> Self {
        Self {
            high_water_mark: cfg.high_water_mark.max(1),
            reconnect_interval: Duration::from_millis(cfg.reconnect_interval_ms.max(1)),
            linger: Duration::from_millis(cfg.linger_ms),
            topics: cfg.topics.clone(),
        }
    }
}
