//! Typed id definitions.

use crate::define_id;

define_id!(
    /// Opaque token handed to the owner of a reservation.
    ReservationToken,
    "rsv"
);

define_id!(
    /// Identifies one exporter or client stream for its lifetime.
    SessionId,
    "sess"
);

define_id!(
    /// Correlates a single exporter command with log lines.
    RequestId,
    "req"
);
