//! Durable timers
//!
//! A timer is a due-time row keyed by `(instance_id, step_index)`. Nothing
//! sleeps on it: the scheduler calls [`TimerService::fire_due`] every tick and
//! the store appends `timer_fired` for rows whose time has come.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::clock::Clock;
use crate::persistence::{HistoryStore, StoreError, TimerRecord};

/// Schedules and fires durable timers
pub struct TimerService<S: HistoryStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
}

impl<S: HistoryStore> Clone for TimerService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<S: HistoryStore> TimerService<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persist the due time of a timer step (idempotent)
    #[instrument(skip(self))]
    pub async fn schedule(
        &self,
        instance_id: Uuid,
        step_index: u32,
        fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.store
            .schedule_timer(TimerRecord {
                instance_id,
                step_index,
                fire_at,
            })
            .await?;
        debug!(%instance_id, step_index, %fire_at, "scheduled timer");
        Ok(())
    }

    /// Fire every timer due at the clock's current time
    pub async fn fire_due(&self, limit: usize) -> Result<Vec<TimerRecord>, StoreError> {
        self.fire_due_at(self.clock.now(), limit).await
    }

    /// Fire every timer with `fire_at <= now`
    pub async fn fire_due_at(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerRecord>, StoreError> {
        let fired = self.store.fire_due_timers(now, limit).await?;
        for timer in &fired {
            debug!(
                instance_id = %timer.instance_id,
                step_index = timer.step_index,
                fire_at = %timer.fire_at,
                "timer fired"
            );
        }
        Ok(fired)
    }
}
