//! Periodic driver for silence-based session closure.
//!
//! One tick per second; a tick that overruns is coalesced by skipping, not
//! queueing, and the task exits within a tick of shutdown.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipeline::Pipeline;

pub fn spawn_tick_driver(
    pipeline: Arc<Pipeline>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(1));
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = timer.tick() => {
                    pipeline.tick(Utc::now()).await;
                }
            }
        }
    })
}
