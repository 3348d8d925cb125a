pub mod address;
pub mod config;
pub mod event;

pub use address::{AddressError, AddressSpec, Binding, Endpoint, Link, Role};
pub use event::{decode, encode, CodecError, Event};
