//! Tunnel relay server library: accepts tunnel clients on a control port,
//! assigns each a subdomain, and relays public HTTP traffic for that
//! subdomain through to the client's local service.
//!
//! Split out from the binary (mirroring `port-forward`'s bin+lib layout) so
//! integration tests can drive the listeners and state machine directly.

pub mod control;
pub mod error;
pub mod http;
pub mod registry;

pub use control::{handle_control_connection, run_control_listener, ControlConfig};
pub use error::ServerError;
pub use http::{run_http_listener, HttpConfig};
pub use registry::{ClientRegistration, ClientRegistry};
