//! Background reapers: one task per table plus the lease sweep.

use crate::registry::{StateRegistry, TableKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Spawns the reaper tasks. They stop when `shutdown` turns true or its
/// sender is dropped.
pub fn spawn_reapers(registry: Arc<StateRegistry>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(TableKind::ALL.len() + 1);

    let lease = Duration::from_secs(registry.lease_secs());
    handles.push(spawn_loop("lease_sweep", lease, shutdown.clone(), {
        let registry = registry.clone();
        move || {
            let swept = registry.sweep_leases();
            if swept > 0 {
                debug!(swept, "lease sweep");
            }
        }
    }));

    for kind in TableKind::ALL {
        let period = Duration::from_secs(registry.reap_interval_secs(kind));
        let registry = registry.clone();
        handles.push(spawn_loop(kind.name(), period, shutdown.clone(), move || {
            registry.reap_table(kind);
        }));
    }
    info!(tasks = handles.len(), "reapers started");
    handles
}

fn spawn_loop<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut pass: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => pass(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(table = name, "reaper stopped");
    })
}
