//! Runtime for herbstlufthub nodes.
//!
//! A node is one process with one socket role: it either produces events
//! (window-manager idle output, stdin, a single command-line event, a pull
//! inbox) or consumes them (stdout, a per-event command, a status-bar
//! renderer). Nodes find each other only through addresses.

pub mod config;
pub mod format;
pub mod node;
pub mod process;
pub mod signals;
pub mod transport;

pub use format::{EventState, Format, FormatError, Template};
pub use node::{Lifecycle, NodeState};
pub use transport::{Fanout, Receiver, Sender, SocketOptions, TransportError};
