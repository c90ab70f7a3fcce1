//! StaleCommandWatchdog - reports commands stuck in `sent`
//!
//! A command that was published but never reached a terminal state is an
//! anomaly worth seeing, not something the hub can fix on its own: the agent
//! may still act on it. The watchdog only logs and counts such rows; it never
//! changes their state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, warn};

use crate::ledger::CommandLedger;

#[derive(Debug)]
enum WatchdogCommand {
    /// Run a scan right away and report how many stale rows it saw
    ScanNow {
        respond_to: oneshot::Sender<Result<usize>>,
    },

    Shutdown,
}

#[derive(Debug, Default)]
struct WatchdogStats {
    scans: AtomicU64,
    stale_observed: AtomicU64,
    last_scan_stale: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WatchdogSnapshot {
    pub scans: u64,

    /// Sum of stale rows over all scans; a row stuck for a long time counts once per scan
    pub stale_observed: u64,

    pub last_scan_stale: u64,
}

struct StaleCommandWatchdog {
    ledger: CommandLedger,
    threshold: chrono::Duration,
    scan_interval: Duration,
    command_rx: mpsc::Receiver<WatchdogCommand>,
    stats: Arc<WatchdogStats>,
}

impl StaleCommandWatchdog {
    #[instrument(skip(self), fields(threshold_secs = self.threshold.num_seconds()))]
    async fn run(mut self) {
        debug!("starting stale command watchdog");

        let mut ticker = interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan().await {
                        error!("stale command scan failed: {e:#}");
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(WatchdogCommand::ScanNow { respond_to }) => {
                            let _ = respond_to.send(self.scan().await);
                        }
                        Some(WatchdogCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }
                        None => {
                            warn!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        debug!("stale command watchdog stopped");
    }

    async fn scan(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.threshold;
        let stale = self.ledger.find_stale(cutoff).await?;

        for command in &stale {
            let age = command
                .sent_at
                .map(|sent_at| (Utc::now() - sent_at).num_seconds())
                .unwrap_or_default();
            warn!(
                "command {} ({}) for {} has been sent {age}s ago without an outcome",
                command.command_id, command.command_type, command.agent_id
            );
        }

        let count = stale.len() as u64;
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        self.stats.stale_observed.fetch_add(count, Ordering::Relaxed);
        self.stats.last_scan_stale.store(count, Ordering::Relaxed);

        Ok(stale.len())
    }
}

/// Handle to the watchdog actor
#[derive(Clone)]
pub struct WatchdogHandle {
    sender: mpsc::Sender<WatchdogCommand>,
    stats: Arc<WatchdogStats>,
}

impl WatchdogHandle {
    /// Spawn the watchdog; the first scan runs immediately
    pub fn spawn(ledger: CommandLedger, threshold: Duration, scan_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(8);
        let stats = Arc::new(WatchdogStats::default());

        let actor = StaleCommandWatchdog {
            ledger,
            threshold: chrono::Duration::from_std(threshold)
                .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX))),
            scan_interval,
            command_rx: rx,
            stats: stats.clone(),
        };

        tokio::spawn(actor.run());

        Self { sender: tx, stats }
    }

    pub async fn scan_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(WatchdogCommand::ScanNow { respond_to: tx })
            .await?;

        rx.await?
    }

    pub fn snapshot(&self) -> WatchdogSnapshot {
        WatchdogSnapshot {
            scans: self.stats.scans.load(Ordering::Relaxed),
            stale_observed: self.stats.stale_observed.load(Ordering::Relaxed),
            last_scan_stale: self.stats.last_scan_stale.load(Ordering::Relaxed),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender.send(WatchdogCommand::Shutdown).await?;
        Ok(())
    }
}
