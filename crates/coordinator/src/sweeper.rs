//! Periodic background tasks: the stall sweeper and the library rescan.

use std::time::Duration;

use tracing::error;

use crate::events::Event;
use crate::scan::run_scan;
use crate::store::now_ms;
use crate::SharedState;

/// Run the stall sweeper until the process exits. Each pass marks silent
/// workers offline, reaps their assignments, and force-fails jobs whose
/// progress went quiet.
pub async fn run_sweeper(state: SharedState) {
    let interval = Duration::from_secs(state.config.sweep_interval_s.max(1));
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if let Err(err) = state.lifecycle.sweep(now_ms()) {
            error!(error = %err, "sweeper pass failed");
        }
    }
}

/// Periodically rescan the library roots. Disabled when the interval is 0.
pub async fn run_scan_loop(state: SharedState) {
    if state.config.scan_interval_s == 0 {
        return;
    }
    let interval = Duration::from_secs(state.config.scan_interval_s);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let scan_state = state.clone();
        let result = tokio::task::spawn_blocking(move || {
            run_scan(&scan_state.store, &scan_state.config.library_roots)
        })
        .await;
        match result {
            Ok(Ok(summary)) => {
                state.events.publish(Event::ScanCompleted {
                    added: summary.added,
                    updated: summary.updated + summary.requeued,
                });
            }
            Ok(Err(err)) => error!(error = %err, "scheduled scan failed"),
            Err(err) => error!(error = %err, "scan task panicked"),
        }
    }
}
