//! In-memory scheduler for tests and single-process use

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{DueCall, ScheduledCall, Scheduler, SchedulerError};

struct Lease {
    run_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    call: ScheduledCall,
}

#[derive(Default)]
struct Queues {
    ready: BTreeMap<(DateTime<Utc>, Uuid), ScheduledCall>,
    leased: HashMap<Uuid, Lease>,
}

impl Queues {
    /// Return expired leases to the ready queue under their original key
    fn release_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Uuid> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = self.leased.remove(&id) {
                self.ready.insert((lease.run_at, id), lease.call);
            }
        }
    }
}

/// In-memory scheduler
///
/// Calls are ordered by run time, then by their time-ordered id, so calls
/// scheduled for the same instant run in scheduling order. A taken call is
/// leased: it stays hidden until acknowledged, and is delivered again once
/// its lease expires. Nothing survives a restart.
pub struct InMemoryScheduler {
    queues: Mutex<Queues>,
    lease: Duration,
}

impl Default for InMemoryScheduler {
    fn default() -> Self {
        Self {
            queues: Mutex::new(Queues::default()),
            lease: Duration::from_secs(300),
        }
    }
}

impl InMemoryScheduler {
    /// Create a scheduler with a 5 minute lease
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a taken call stays hidden before being redelivered
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Number of calls waiting to be taken
    pub fn len(&self) -> usize {
        self.queues.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().ready.is_empty()
    }

    /// Number of taken calls not yet acknowledged
    pub fn leased(&self) -> usize {
        self.queues.lock().leased.len()
    }

    /// Snapshot of pending calls in run order
    pub fn pending(&self) -> Vec<(DateTime<Utc>, ScheduledCall)> {
        self.queues
            .lock()
            .ready
            .iter()
            .map(|((at, _), call)| (*at, call.clone()))
            .collect()
    }

    /// Run time of the earliest pending call
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.queues.lock().ready.keys().next().map(|(at, _)| *at)
    }
}

#[async_trait]
impl Scheduler for InMemoryScheduler {
    async fn schedule(
        &self,
        at: DateTime<Utc>,
        call: ScheduledCall,
    ) -> Result<Uuid, SchedulerError> {
        let id = Uuid::now_v7();
        self.queues.lock().ready.insert((at, id), call);
        Ok(id)
    }

    async fn take_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueCall>, SchedulerError> {
        let expires_at = now
            + chrono::Duration::from_std(self.lease).unwrap_or_else(|_| chrono::Duration::zero());
        let mut queues = self.queues.lock();
        queues.release_expired(now);

        let keys: Vec<(DateTime<Utc>, Uuid)> = queues
            .ready
            .keys()
            .take_while(|(at, _)| *at <= now)
            .take(limit)
            .copied()
            .collect();

        let mut due = Vec::with_capacity(keys.len());
        for (run_at, id) in keys {
            if let Some(call) = queues.ready.remove(&(run_at, id)) {
                queues.leased.insert(
                    id,
                    Lease {
                        run_at,
                        expires_at,
                        call: call.clone(),
                    },
                );
                due.push(DueCall { id, run_at, call });
            }
        }
        Ok(due)
    }

    async fn acknowledge(&self, id: Uuid) -> Result<(), SchedulerError> {
        let mut queues = self.queues.lock();
        if queues.leased.remove(&id).is_none() {
            // lease expired and the call went back to the ready queue
            queues.ready.retain(|(_, key), _| *key != id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn resume(generation: u64) -> ScheduledCall {
        ScheduledCall::Resume {
            workflow_id: Uuid::nil(),
            generation,
        }
    }

    #[tokio::test]
    async fn test_take_due_respects_time_and_order() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();

        scheduler
            .schedule(now + Duration::seconds(5), resume(2))
            .await
            .unwrap();
        scheduler.schedule(now, resume(0)).await.unwrap();
        scheduler.schedule(now, resume(1)).await.unwrap();
        assert_eq!(scheduler.next_due(), Some(now));

        let due = scheduler.take_due(now, 10).await.unwrap();
        let calls: Vec<_> = due.into_iter().map(|d| d.call).collect();
        assert_eq!(calls, vec![resume(0), resume(1)]);
        assert_eq!(scheduler.len(), 1);

        let due = scheduler
            .take_due(now + Duration::seconds(5), 10)
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test]
    async fn test_take_due_limit() {
        let scheduler = InMemoryScheduler::new();
        let now = Utc::now();
        for generation in 0..5 {
            scheduler.schedule(now, resume(generation)).await.unwrap();
        }

        let due = scheduler.take_due(now, 2).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(scheduler.pending().len(), 3);
    }

    #[tokio::test]
    async fn test_unacknowledged_call_is_redelivered() {
        let scheduler = InMemoryScheduler::new().with_lease(std::time::Duration::from_secs(10));
        let now = Utc::now();
        scheduler.schedule(now, resume(0)).await.unwrap();
        scheduler.schedule(now, resume(1)).await.unwrap();

        let due = scheduler.take_due(now, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(scheduler.leased(), 2);
        scheduler.acknowledge(due[0].id).await.unwrap();

        // hidden while leased
        assert!(scheduler
            .take_due(now + Duration::seconds(5), 10)
            .await
            .unwrap()
            .is_empty());

        let redelivered = scheduler
            .take_due(now + Duration::seconds(10), 10)
            .await
            .unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].id, due[1].id);
        assert_eq!(redelivered[0].call, resume(1));

        scheduler.acknowledge(redelivered[0].id).await.unwrap();
        assert_eq!(scheduler.leased(), 0);
        assert!(scheduler
            .take_due(now + Duration::hours(1), 10)
            .await
            .unwrap()
            .is_empty());
    }
}
