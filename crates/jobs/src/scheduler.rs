//! Scheduled work: "when to tick" ([`Ticker`]) kept apart from "may this
//! instance act" ([`LeaderGate`]), both evaluated at tick time.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::JobError;
use crate::leader::LeaderElector;

/// Source of tick instants.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick and return its nominal instant. `None` ends
    /// the schedule.
    async fn next_tick(&mut self) -> Option<DateTime<Utc>>;
}

/// Cron-expression ticker (seconds-resolution, 6 or 7 fields, UTC).
pub struct CronTicker {
    expression: String,
    schedule: cron::Schedule,
    last: Option<DateTime<Utc>>,
}

impl CronTicker {
    pub fn new(expression: &str) -> Result<Self, cron::error::Error> {
        Ok(Self {
            expression: expression.to_string(),
            schedule: cron::Schedule::from_str(expression)?,
            last: None,
        })
    }

    /// Next fire instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl std::fmt::Debug for CronTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CronTicker")
            .field("expression", &self.expression)
            .finish()
    }
}

#[async_trait]
impl Ticker for CronTicker {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        let now = Utc::now();
        let from = self.last.map_or(now, |last| last.max(now));
        let next = self.next_after(from)?;
        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(wait).await;
        self.last = Some(next);
        Some(next)
    }
}

/// Fixed-period ticker; the first tick fires immediately.
#[derive(Debug)]
pub struct IntervalTicker {
    interval: tokio::time::Interval,
}

impl IntervalTicker {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn next_tick(&mut self) -> Option<DateTime<Utc>> {
        self.interval.tick().await;
        Some(Utc::now())
    }
}

/// Leadership check performed at the moment an action would fire.
#[derive(Debug, Clone)]
pub struct LeaderGate {
    elector: LeaderElector,
    key: String,
    ttl: Duration,
}

impl LeaderGate {
    pub fn new(elector: LeaderElector, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            elector,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn allows(&self) -> bool {
        self.elector.try_become_leader(&self.key, self.ttl).await
    }
}

/// Work triggered by a tick, typically enqueueing a top-level batch job.
#[async_trait]
pub trait ScheduledAction: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, fired_at: DateTime<Utc>) -> Result<(), JobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Another instance holds the lease.
    Skipped,
    Ran,
    Failed(String),
}

/// A ticker, an optional leader gate and an action.
pub struct ScheduledTask {
    ticker: Box<dyn Ticker>,
    gate: Option<LeaderGate>,
    action: Arc<dyn ScheduledAction>,
}

impl ScheduledTask {
    pub fn new(ticker: Box<dyn Ticker>, action: Arc<dyn ScheduledAction>) -> Self {
        Self {
            ticker,
            gate: None,
            action,
        }
    }

    pub fn leader_gated(mut self, gate: LeaderGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Evaluate the gate and run the action once.
    pub async fn fire_once(&self, fired_at: DateTime<Utc>) -> TickOutcome {
        fire(self.gate.as_ref(), self.action.as_ref(), fired_at).await
    }

    /// Drive the task until `cancel` fires or the ticker ends.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let Self {
            mut ticker,
            gate,
            action,
        } = self;

        tokio::spawn(async move {
            info!(task = action.name(), "scheduled task started");
            loop {
                let fired_at = tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = ticker.next_tick() => match tick {
                        Some(at) => at,
                        None => break,
                    },
                };
                fire(gate.as_ref(), action.as_ref(), fired_at).await;
            }
            info!(task = action.name(), "scheduled task stopped");
        })
    }
}

async fn fire(
    gate: Option<&LeaderGate>,
    action: &dyn ScheduledAction,
    fired_at: DateTime<Utc>,
) -> TickOutcome {
    if let Some(gate) = gate {
        if !gate.allows().await {
            debug!(task = action.name(), key = gate.key(), "not leader, tick skipped");
            return TickOutcome::Skipped;
        }
    }

    match action.run(fired_at).await {
        Ok(()) => {
            info!(task = action.name(), %fired_at, "scheduled task ran");
            TickOutcome::Ran
        }
        Err(e) => {
            error!(task = action.name(), %fired_at, error = %e, "scheduled task failed");
            TickOutcome::Failed(e.to_string())
        }
    }
}
