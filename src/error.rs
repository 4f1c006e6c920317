//! Error types.

use trust_dns_proto::error::ProtoError;
use trust_dns_proto::op::ResponseCode;

/// Error enumerates the possible SRP server error states.
///
/// The first group mirrors the DNS RCODEs the server answers with; the rest
/// are operational errors surfaced through the library API.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A malformed update message: bad header, section counts, or an
    /// unparseable record.
    #[error("malformed update message")]
    FormErr,

    /// An unsupported operation or record, e.g. a prerequisite section or a
    /// KEY record with an algorithm other than ECDSA-P256.
    #[error("unsupported operation or record")]
    NotImp,

    /// Wrong zone, a key mismatch against a retained name, or a signature
    /// that does not verify.
    #[error("not authorized")]
    NotAuth,

    /// A transient failure, including a second in-flight update for a host
    /// name that already has one outstanding.
    #[error("transient server failure")]
    ServFail,

    /// The registered update handler did not report a result in time.
    #[error("update handler did not reply in time")]
    ResponseTimeout,

    /// Returned when a configuration mutation is attempted while the server
    /// is enabled.
    #[error("operation not permitted while the server is enabled")]
    InvalidState,

    /// Returned when a configuration value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    InvalidArgs(String),

    /// Returned when a generic IO error occurs.
    #[error("an IO error occurred")]
    IO(#[from] std::io::Error),

    /// Returned when the DNS codec reports a protocol error.
    #[error("DNS error")]
    DNSError(#[from] ProtoError),

    /// Returned when processing JSON (e.g. loading a
    /// [`Config`][crate::config::Config]) fails due to invalid content.
    #[error("invalid JSON")]
    InvalidJSON(#[from] serde_json::Error),
}

impl Error {
    /// The DNS RCODE sent to a client whose update failed with this error.
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Error::FormErr | Error::DNSError(_) => ResponseCode::FormErr,
            Error::NotImp => ResponseCode::NotImp,
            Error::NotAuth => ResponseCode::NotAuth,
            Error::InvalidState | Error::InvalidArgs(_) => ResponseCode::Refused,
            _ => ResponseCode::ServFail,
        }
    }
}
