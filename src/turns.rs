use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use metrics::{counter, gauge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::store::{Flip, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnSettings {
    pub interval: Duration,
    pub limit: u32,
}

impl Default for TurnSettings {
    fn default() -> Self {
        TurnSettings {
            interval: Duration::from_secs(120),
            limit: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStop {
    Exhausted,
    Terminated,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnOutcome {
    pub flips: u32,
    pub stop: TurnStop,
}

/// Rotates the current speaker of every activated room on a fixed cadence.
///
/// One task per room, registered by room id so termination can cancel it.
/// A room's rotation never restarts once it has stopped.
#[derive(Clone)]
pub struct TurnScheduler {
    store: Store,
    settings: TurnSettings,
    tasks: Arc<DashMap<Uuid, CancellationToken>>,
}

impl TurnScheduler {
    pub fn new(store: Store, settings: TurnSettings) -> TurnScheduler {
        TurnScheduler {
            store,
            settings,
            tasks: Arc::default(),
        }
    }

    /// Spawns the rotation for `room_id`. Returns `None` if one is already running.
    pub fn start(&self, room_id: Uuid) -> Option<JoinHandle<TurnOutcome>> {
        let cancel = CancellationToken::new();
        match self.tasks.entry(room_id) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }
        gauge!("turn_rotations_active").increment(1.0);

        let scheduler = self.clone();
        Some(tokio::spawn(async move {
            let outcome = scheduler.rotate(room_id, cancel).await;
            scheduler.tasks.remove(&room_id);
            gauge!("turn_rotations_active").decrement(1.0);
            info!(room = %room_id, flips = outcome.flips, stop = ?outcome.stop, "turn rotation stopped");
            outcome
        }))
    }

    pub fn cancel(&self, room_id: Uuid) -> bool {
        match self.tasks.remove(&room_id) {
            Some((_, cancel)) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, room_id: Uuid) -> bool {
        self.tasks.contains_key(&room_id)
    }

    async fn rotate(&self, room_id: Uuid, cancel: CancellationToken) -> TurnOutcome {
        let mut flips = 0;
        while flips < self.settings.limit {
            tokio::select! {
                _ = cancel.cancelled() => return TurnOutcome { flips, stop: TurnStop::Cancelled },
                _ = tokio::time::sleep(self.settings.interval) => {}
            }

            match self.store.flip_speakers(room_id).await {
                Ok(Flip::Flipped) => {
                    flips += 1;
                    debug!(room = %room_id, flips, "speaker flipped");
                }
                Ok(Flip::Terminated) => return TurnOutcome { flips, stop: TurnStop::Terminated },
                Err(err) => {
                    counter!("turn_rotation_failures_total").increment(1);
                    error!(room = %room_id, flips, "abandoning turn rotation: {err}");
                    return TurnOutcome { flips, stop: TurnStop::Failed };
                }
            }
        }

        TurnOutcome { flips, stop: TurnStop::Exhausted }
    }
}
