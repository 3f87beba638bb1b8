//! Outbound signal to the physical space indicator.
//!
//! When a reservation is made the space's lamp/barrier is told it is
//! reserved; when the reservation ends (cancel, expiry, conclusion,
//! reassignment) it is released again.

use park_core::SpaceId;
use tracing::info;

/// Connection to the per-space indicator hardware.
///
/// Calls are fire-and-forget. Implementations must not block for long:
/// they run on the coordinator's calling thread.
pub trait ArduinoConnection: Send + Sync {
    fn notify_arduino(&self, space_id: SpaceId, reserved: bool);
}

/// Actuator that only records notifications in the log.
///
/// Used when no hardware bridge is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActuator;

impl ArduinoConnection for TracingActuator {
    fn notify_arduino(&self, space_id: SpaceId, reserved: bool) {
        info!(space_id = %space_id, reserved, "Actuator notified");
    }
}
