//! Fixed-rate tick loop for running a session on a tokio runtime.

use crate::broadcast::StateCollector;
use crate::client::ClientSession;
use crate::error::{ReplicationError, Result};
use crate::interest::ObserverStrategy;
use crate::server::ServerSession;
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Something advanced once per tick with the seconds elapsed since start.
pub trait Tick {
    fn tick(&mut self, now: f64);
}

impl<T: Transport, S: ObserverStrategy, C: StateCollector> Tick for ServerSession<T, S, C> {
    fn tick(&mut self, now: f64) {
        self.update(now);
    }
}

impl<T: Transport, C: StateCollector> Tick for ClientSession<T, C> {
    fn tick(&mut self, now: f64) {
        self.update(now);
    }
}

/// Ticks `session` `tick_rate` times per second until `shutdown_rx` turns
/// true or its sender is dropped. Returns the number of ticks run.
pub async fn run_tick_loop<K: Tick>(
    session: &mut K,
    tick_rate: f64,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<u64> {
    if !(tick_rate.is_finite() && tick_rate > 0.0) {
        return Err(ReplicationError::InvalidConfig(format!(
            "tick_rate must be positive, got {}",
            tick_rate
        )));
    }

    if *shutdown_rx.borrow() {
        return Ok(0);
    }

    let start = Instant::now();
    let mut interval = tokio::time::interval(Duration::from_secs_f64(1.0 / tick_rate));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut ticks = 0;
    tracing::info!("Tick loop started at {} Hz", tick_rate);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                session.tick(start.elapsed().as_secs_f64());
                ticks += 1;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    tracing::info!("Tick loop stopped after {} ticks", ticks);
    Ok(ticks)
}
