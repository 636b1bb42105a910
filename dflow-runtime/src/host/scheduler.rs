use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dflow_core::FlowId;
use std::sync::Mutex;
use std::time::Duration;

/// Arranges for suspended flows to be resumed later.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_yield(&self, id: FlowId) -> anyhow::Result<()>;

    async fn schedule_delay(&self, id: FlowId, delay: Duration) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeupReason {
    Yield,
    Delay,
}

/// A resume request due at `due`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub id: FlowId,
    pub due: DateTime<Utc>,
    pub reason: WakeupReason,
}

/// Scheduler that queues wake-ups for the application to drain.
///
/// Fits hosts that poll: call [`take_due`](Self::take_due) from a loop or a
/// timer and resume each returned id.
#[derive(Debug, Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<Wakeup>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, wakeup: Wakeup) -> anyhow::Result<()> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        tracing::debug!(flow_id = %wakeup.id, due = %wakeup.due, reason = ?wakeup.reason, "Wake-up scheduled");
        pending.push(wakeup);
        Ok(())
    }

    /// Remove and return every wake-up due at or before `now`, earliest
    /// first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Wakeup> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let (mut due, rest): (Vec<Wakeup>, Vec<Wakeup>) =
            pending.drain(..).partition(|w| w.due <= now);
        *pending = rest;
        due.sort_by_key(|w| w.due);
        due
    }

    /// Remove and return every wake-up regardless of due time.
    pub fn take_all(&self) -> Vec<Wakeup> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let mut all: Vec<Wakeup> = pending.drain(..).collect();
        all.sort_by_key(|w| w.due);
        all
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Scheduler for ManualScheduler {
    async fn schedule_yield(&self, id: FlowId) -> anyhow::Result<()> {
        self.push(Wakeup {
            id,
            due: Utc::now(),
            reason: WakeupReason::Yield,
        })
    }

    async fn schedule_delay(&self, id: FlowId, delay: Duration) -> anyhow::Result<()> {
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| anyhow::anyhow!("delay of {:?} is out of range", delay))?;
        self.push(Wakeup {
            id,
            due,
            reason: WakeupReason::Delay,
        })
    }
}
