use serde::{Deserialize, Serialize};

/// Well-known IPC socket file name used when a node is given no address.
pub const DEFAULT_IPC_NAME: &str = "hhub.ipc";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub transport: TransportConfig,
    pub publish: PublishConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Addresses used when none are given on the command line. Empty means
    /// the well-known IPC path.
    pub addresses: Vec<String>,
    /// Subscriber topic prefixes. Empty receives everything.
    pub topics: Vec<String>,
    /// Per-peer queue bound; publish drops beyond it, pull applies backpressure.
    pub high_water_mark: usize,
    pub reconnect_interval_ms: u64,
    /// How long closing a sender waits for queued messages to be written.
    pub linger_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    /// How long `onepub` holds its socket open before sending.
    pub onepub_delay_ms: u64,
    /// Shell command producing the window manager's idle-event stream.
    pub idle_command: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Long-lived renderer fed by `subdzen`.
    pub renderer_command: String,
    /// Template applied to received events by `subpipe` and `subdzen`.
    pub format: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            addresses: vec![],
            topics: vec![],
            high_water_mark: 1000,
            reconnect_interval_ms: 100,
            linger_ms: 1000,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            onepub_delay_ms: 100,
            idle_command: "herbstclient --idle".to_string(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            renderer_command: "dzen2 -ta l".to_string(),
            format: "{type} {id} {args}".to_string(),
        }
    }
}
