//! srpd
//!
//! A [Service Registration Protocol][SRP] (SRP) server: a DNS-UPDATE based
//! service registry for constrained network clients. Clients register a
//! host name, its IPv6 addresses and the service instances it offers with
//! a signed [RFC-2136] UPDATE message; the server validates the update,
//! verifies its [SIG(0)][RFC-2931] ECDSA-P256 signature against the KEY
//! record the client presents, grants LEASE/KEY-LEASE intervals, and
//! commits the result into an in-memory registry consumed by a companion
//! DNS-SD responder.
//!
//! [SRP]: https://www.rfc-editor.org/rfc/rfc9665
//! [RFC-2136]: https://www.rfc-editor.org/rfc/rfc2136
//! [RFC-2931]: https://www.rfc-editor.org/rfc/rfc2931
//!
#![warn(clippy::pedantic)]

pub mod api;
pub mod config;
pub mod error;
pub mod proto;
pub mod registry;
pub mod server;

pub use api::new as new_api;
pub use config::{AddressMode, Config, LeaseConfig, SharedConfig, TtlConfig};
pub use error::Error;
pub use registry::{HostSnapshot, RegistryEvent, ServiceFlags, ServiceSnapshot};
pub use server::runtime::{new as new_server, ServerHandle, Status};
pub use server::{DynUpdateHandler, Server, State, UpdateHandler, UpdateId};
