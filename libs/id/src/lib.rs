//! # labhub-id
//!
//! Typed identifiers used by the coordinator.
//!
//! Every id is rendered as `{prefix}_{ulid}`, for example
//! `rsv_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps a reservation token
//! from being confused with a session id when both travel as plain strings
//! over the wire, and the ULID keeps them sortable by creation time.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

// Used by `define_id!` expansions.
#[doc(hidden)]
pub use ulid::Ulid;
