//! Release of reservations nobody claimed in time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use park_core::{ReservationState, ReserveStatus, SpaceState, SpaceStatus};

use super::{Coordinator, CoordinatorResult};

impl Coordinator {
    /// Releases every reservation older than the expiry window.
    ///
    /// Returns how many reservations were released.
    pub fn sweep_expired(&self) -> CoordinatorResult<usize> {
        self.sweep_expired_at(Utc::now())
    }

    /// [`sweep_expired`](Self::sweep_expired) as of `now`.
    ///
    /// A space that fails to release (already concluded, cancelled, or a
    /// storage error) is logged and skipped.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> CoordinatorResult<usize> {
        let cutoff = chrono::Duration::from_std(self.settings.expiry_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };

        let expired = self.db.get_expired_reserve_states(cutoff)?;
        let mut released = 0;

        for record in expired {
            match self.db.cancel_reservation_for_spot(record.space_id) {
                Ok(true) => {
                    self.publish_space_status(SpaceStatus::new(
                        record.space_id,
                        record.section.clone(),
                        SpaceState::Free,
                    ));
                    self.publish_reserve_status(ReserveStatus::new(
                        record.space_id,
                        ReservationState::ReserveCancelledExpired,
                    ));
                    self.actuator.notify_arduino(record.space_id, false);

                    info!(
                        space_id = %record.space_id,
                        plate = ?record.occupant,
                        reserved_at = %record.last_change,
                        "Reservation expired"
                    );
                    released += 1;
                }
                Ok(false) => {
                    debug!(space_id = %record.space_id, "Reservation changed during sweep, skipping");
                }
                Err(e) => {
                    warn!(space_id = %record.space_id, error = %e, "Failed to expire reservation");
                }
            }
        }

        Ok(released)
    }
}

/// Spawns the periodic expiry sweep.
///
/// The first sweep runs immediately, then once per `period`, until `cancel`
/// fires. Sweeps run on the blocking pool since storage calls are
/// synchronous.
pub fn spawn_expiry_task(
    coordinator: Arc<Coordinator>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Expiry task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let sweeper = Arc::clone(&coordinator);
                    match tokio::task::spawn_blocking(move || sweeper.sweep_expired()).await {
                        Ok(Ok(0)) => debug!("No expired reservations"),
                        Ok(Ok(released)) => info!(released, "Expired reservations released"),
                        Ok(Err(e)) => warn!(error = %e, "Expiry sweep failed"),
                        Err(e) => warn!(error = %e, "Expiry sweep task failed"),
                    }
                }
            }
        }
    })
}
