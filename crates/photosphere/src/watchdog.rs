//! Stage health monitor.
//!
//! Each loop records a heartbeat; the watchdog thread compares them against a staleness
//! threshold and reports a stalled stage once per stall. Nothing is restarted.

use std::{
    collections::HashSet,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use crossbeam_channel::Sender;
use serde::Serialize;
use tracing::{info, warn};
use video_ingest::ProducerStats;

use crate::{events::StatusEvent, telemetry};

pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const WATCHDOG_STALE_THRESHOLD_MS: i64 = 3_000;
pub const WATCHDOG_STARTUP_GRACE_MS: i64 = 5_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Producer,
    Acceptance,
    Scheduler,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Producer, Stage::Acceptance, Stage::Scheduler];

    pub fn label(self) -> &'static str {
        match self {
            Stage::Producer => "producer",
            Stage::Acceptance => "acceptance",
            Stage::Scheduler => "scheduler",
        }
    }
}

/// Heartbeats of the capture loops, in wall-clock millis.
///
/// The producer's heartbeat is the time of its last frame, read from [`ProducerStats`].
#[derive(Debug)]
pub struct PipelineHealth {
    producer: Arc<ProducerStats>,
    acceptance: AtomicI64,
    scheduler: AtomicI64,
    grace_deadline: i64,
}

impl PipelineHealth {
    pub fn new(producer: Arc<ProducerStats>) -> Self {
        Self::starting_at(producer, current_millis())
    }

    fn starting_at(producer: Arc<ProducerStats>, now: i64) -> Self {
        let grace_deadline = now.saturating_add(WATCHDOG_STARTUP_GRACE_MS);
        Self {
            producer,
            acceptance: AtomicI64::new(grace_deadline),
            scheduler: AtomicI64::new(grace_deadline),
            grace_deadline,
        }
    }

    pub fn beat(&self, stage: Stage) {
        let now = current_millis();
        match stage {
            // Driven by the producer's own frame timestamps.
            Stage::Producer => {}
            Stage::Acceptance => self.acceptance.store(now, Ordering::Relaxed),
            Stage::Scheduler => self.scheduler.store(now, Ordering::Relaxed),
        }
    }

    fn last_beat(&self, stage: Stage) -> i64 {
        match stage {
            Stage::Producer => self.producer.last_frame_ms().max(self.grace_deadline),
            Stage::Acceptance => self.acceptance.load(Ordering::Relaxed),
            Stage::Scheduler => self.scheduler.load(Ordering::Relaxed),
        }
    }

    pub fn stale_stages(&self, now: i64) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|&stage| now.saturating_sub(self.last_beat(stage)) > WATCHDOG_STALE_THRESHOLD_MS)
            .collect()
    }
}

/// Spawns the monitor. It exits within one poll interval of `running` being cleared.
pub fn spawn_watchdog(
    health: Arc<PipelineHealth>,
    running: Arc<AtomicBool>,
    events: Sender<StatusEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread("photosphere-watchdog", move || {
        let mut reported: HashSet<Stage> = HashSet::new();
        while running.load(Ordering::Relaxed) {
            thread::sleep(WATCHDOG_POLL_INTERVAL);
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let stale = health.stale_stages(current_millis());
            for &stage in &stale {
                if reported.insert(stage) {
                    warn!("Watchdog detected stalled {} stage", stage.label());
                    metrics::counter!("photosphere_stage_stalls_total", "stage" => stage.label())
                        .increment(1);
                    let _ = events.send(StatusEvent::StageStalled { stage });
                }
            }
            reported.retain(|stage| {
                let still_stale = stale.contains(stage);
                if !still_stale {
                    info!("{} stage recovered", stage.label());
                }
                still_stale
            });
        }
    })
}

fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}
