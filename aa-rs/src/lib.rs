//! Sponsored ("gasless") ERC-4337 v0.7 user operations.
//!
//! The flow is: draft an operation with a sponsor attached, probe the relay for gas and tune
//! the result, then sign and submit with fee-aware retries. Operator-side readiness checks
//! live in [`readiness`].

pub mod bundler;
pub mod chain;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod encoding;
pub mod error;
pub mod fees;
pub mod gas;
pub mod hash;
pub mod paymaster;
pub mod pipeline;
pub mod readiness;
pub mod retry;
pub mod signer;
pub mod submit;
pub mod types;

pub use error::{CodecError, Error, RelayError, RpcError};
pub use types::{Operation, PackedUserOperation, UserOperation};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Seconds since the Unix epoch; zero if the system clock is before it.
pub fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
