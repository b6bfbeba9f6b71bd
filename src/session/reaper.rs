//! Background task expiring idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::SessionRegistry;

/// Spawn the idle-session reaper.
///
/// On every tick, sessions with no request for longer than the registry's
/// idle timeout are terminated, which ends their push streams and drops
/// their event logs.
#[must_use]
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("session reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let reaped = registry.reap_idle();
                    if reaped > 0 {
                        info!(reaped, remaining = registry.len(), "reaped idle sessions");
                    } else {
                        debug!("no idle sessions to reap");
                    }
                }
            }
        }
    })
}
