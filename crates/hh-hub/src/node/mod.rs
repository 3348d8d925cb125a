//! Node kinds: each one is a process that owns one socket (two for
//! `pullpub`) and one input or output.

pub mod publish;
pub mod subscribe;

use std::fmt;

use tracing::info;

/// Subscriber lifecycle.
///
/// ```text
/// Starting -> Connected -> Receiving -> Closing   (shutdown signal)
///                                    -> Faulting  (transport or sink failure)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Starting,
    /// Socket established and output resource acquired.
    Connected,
    Receiving,
    Closing,
    Faulting,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeState::Starting => "starting",
            NodeState::Connected => "connected",
            NodeState::Receiving => "receiving",
            NodeState::Closing => "closing",
            NodeState::Faulting => "faulting",
        })
    }
}

/// Tracks and logs a node's state transitions.
#[derive(Debug)]
pub struct Lifecycle {
    node: &'static str,
    state: NodeState,
}

impl Lifecycle {
    pub fn new(node: &'static str) -> Self {
        info!(node, state = %NodeState::Starting, "node state");
        Self {
            node,
            state: NodeState::Starting,
        }
    }

    pub fn node(&self) -> &'static str {
        self.node
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn advance(&mut self, next: NodeState) {
        if next != self.state {
            info!(node = self.node, from = %self.state, to = %next, "node state");
            self.state = next;
        }
    }
}
