//! Read-only HTTP API for observing the SRP server.
//!
//! # API Endpoints
//!
//! ## `/healthcheck` (GET)
//!
//!   Returns HTTP 200 (OK) and the JSON body `{"ok":"healthy"}` when the
//!   service is operational.
//!
//! ## `/state` (GET)
//!
//!   Returns the server lifecycle state, the listening port, the configured
//!   domain and address mode, and the response counters:
//!
//!   ```json
//!   {
//!     "state": "running",
//!     "port": 53539,
//!     "domain": "default.service.arpa.",
//!     "address_mode": "unicast",
//!     "counters": { "success": 4, ... }
//!   }
//!   ```
//!
//! ## `/counters` (GET)
//!
//!   Returns just the per-RCODE response counters.
//!
//! ## `/hosts` (GET)
//!
//!   Enumerates the registered hosts and their services, deleted entries
//!   included (flagged with `"deleted": true`). TXT record data is
//!   base64-encoded.
//!
//! The API never mutates the registry: registrations only enter through
//! the DNS UPDATE path.

mod api_error;
mod routes;
pub mod server;

pub use server::new;
