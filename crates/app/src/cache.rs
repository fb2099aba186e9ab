//! Cache store — replace-on-write holder for [`CachedStatus`].

use std::sync::{PoisonError, RwLock};

use valvehub_domain::cache::{CachedStatus, Stamped, ValveReading};
use valvehub_domain::session::IrrigationRecord;
use valvehub_domain::state::OperationState;
use valvehub_domain::time::Timestamp;

/// Last-known device data.
///
/// Every setter replaces exactly one field and its stamp. Nothing is ever
/// evicted.
#[derive(Debug, Default)]
pub struct CacheStore {
    inner: RwLock<CachedStatus>,
}

impl CacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a previously persisted snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: CachedStatus) -> Self {
        Self {
            inner: RwLock::new(snapshot),
        }
    }

    /// Copy of every field with its stamp.
    #[must_use]
    pub fn snapshot(&self) -> CachedStatus {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the whole record, e.g. after a restart.
    pub fn restore(&self, snapshot: CachedStatus) {
        *self.write() = snapshot;
    }

    pub fn set_battery(&self, percent: u8, at: Timestamp) {
        self.write().battery_percent = Some(Stamped::new(percent, at));
    }

    pub fn set_status(&self, state: OperationState, at: Timestamp) {
        self.write().last_status = Some(Stamped::new(state, at));
    }

    pub fn set_valve(&self, reading: ValveReading, at: Timestamp) {
        self.write().valve = Some(Stamped::new(reading, at));
    }

    pub fn set_last_irrigation(&self, record: IrrigationRecord, at: Timestamp) {
        self.write().last_irrigation = Some(Stamped::new(record, at));
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CachedStatus> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
