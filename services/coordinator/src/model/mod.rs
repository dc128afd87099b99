//! Places, resources and reservations as the coordinator owns them.
//!
//! Everything here is plain data plus its invariants and its wire form.
//! Locking, publishing and persistence live in the coordinator.

mod matching;
mod place;
mod reservation;
mod resource;
mod tags;

use thiserror::Error;

pub use matching::ResourceMatch;
pub use place::Place;
pub use reservation::{Reservation, ReservationState, MAIN_FILTER};
pub use resource::{
    ParamValue, ResourceEntry, ResourceHandle, ResourceImport, ResourcePath, BROKEN_MARKER,
};
pub use tags::{validate_tag_key, validate_tag_value};

/// Validation failures of user supplied model data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("invalid tag key '{0}'")]
    InvalidTagKey(String),

    #[error("invalid tag value '{value}' for key '{key}'")]
    InvalidTagValue { key: String, value: String },

    #[error("invalid reservation filter: {0}")]
    InvalidFilter(String),
}

/// Seconds since the epoch, as carried on the wire.
pub(crate) fn epoch_seconds(ts: chrono::DateTime<chrono::Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}
