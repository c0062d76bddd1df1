//! stord protocol types
//!
//! Defines the JSON envelope used to drive the storage service, the stable
//! error-code registry, storage flag bits, and the payload of every logical
//! operation.

pub mod error;
pub mod flags;
pub mod ops;
pub mod request;
pub mod response;

pub use error::{ErrorCode, RpcError};
pub use request::RpcRequest;
pub use response::RpcResponse;

/// Minimum protocol version supported by this implementation.
pub const PROTOCOL_MIN: i32 = 1;

/// Maximum protocol version supported by this implementation.
pub const PROTOCOL_MAX: i32 = 1;
