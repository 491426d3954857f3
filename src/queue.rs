//! Admission and the three priority lanes.
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::SubmitError;
use crate::printer_lock::{PrinterGuard, PrinterLocks};
use crate::store::JobStore;
use crate::types::job::{Job, JobId, Priority};
use crate::types::states::JobStatus;
use crate::types::view::QueueStats;

/// Holds job ids waiting for a worker, one FIFO lane per priority.
///
/// Lanes are drained strictly high, then normal, then low. A steady stream of
/// high-priority work will starve the lower lanes.
pub struct PriorityQueue {
    store: Arc<dyn JobStore>,
    lanes: Mutex<[VecDeque<JobId>; 3]>,
    /// Wakes workers blocked in `claim` after a submission or a printer
    /// release.
    wake: Notify,
    max_unit_size: Option<usize>,
    max_units: Option<usize>,
    /// Printers jobs may target. `None` admits any name.
    printers: Option<HashSet<String>>,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            lanes: Mutex::new(Default::default()),
            wake: Notify::new(),
            max_unit_size: None,
            max_units: None,
            printers: None,
        }
    }

    /// Rejects any unit larger than `limit` bytes at admission.
    pub fn with_max_unit_size(mut self, limit: usize) -> Self {
        self.max_unit_size = Some(limit);
        self
    }

    /// Rejects any job with more than `limit` units at admission.
    pub fn with_max_units(mut self, limit: usize) -> Self {
        self.max_units = Some(limit);
        self
    }

    /// Only admits jobs for one of `printers`.
    pub fn with_printers<I>(mut self, printers: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.printers = Some(printers.into_iter().collect());
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn lanes(&self) -> MutexGuard<'_, [VecDeque<JobId>; 3]> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admits a new job and returns its id without waiting for it to run.
    pub fn submit(
        &self,
        units: Vec<Bytes>,
        printer_ref: &str,
        priority: Option<Priority>,
    ) -> Result<JobId, SubmitError> {
        self.admit(units, printer_ref, priority.unwrap_or_default(), None)
    }

    pub(crate) fn admit(
        &self,
        units: Vec<Bytes>,
        printer_ref: &str,
        priority: Priority,
        resumed_from: Option<JobId>,
    ) -> Result<JobId, SubmitError> {
        let printer_ref = printer_ref.trim();
        if printer_ref.is_empty() {
            return Err(SubmitError::MissingPrinter);
        }
        if let Some(known) = &self.printers {
            if !known.contains(printer_ref) {
                return Err(SubmitError::UnknownPrinter(printer_ref.to_owned()));
            }
        }
        if units.is_empty() {
            return Err(SubmitError::EmptyJob);
        }
        if let Some(limit) = self.max_units {
            if units.len() > limit {
                return Err(SubmitError::TooManyUnits {
                    count: units.len(),
                    limit,
                });
            }
        }
        if let Some(limit) = self.max_unit_size {
            if let Some((i, unit)) =
                units.iter().enumerate().find(|(_, u)| u.len() > limit)
            {
                return Err(SubmitError::UnitTooLarge {
                    index: i + 1,
                    size: unit.len(),
                    limit,
                });
            }
        }

        let job = Job::new(printer_ref.to_owned(), units, priority, resumed_from);
        let id = job.id;
        let quantity = job.quantity();
        self.store.insert(job)?;

        // Moving to queued and joining the lane happen under the lane lock, so
        // a worker can never pop an id whose job isn't yet queued.
        {
            let mut lanes = self.lanes();
            self.store.compare_and_set_status(
                &id,
                JobStatus::Pending,
                JobStatus::Queued,
            )?;
            lanes[priority.lane()].push_back(id);
        }
        self.wake.notify_one();

        info!(%id, printer = printer_ref, %priority, quantity, "job queued");

        Ok(id)
    }

    /// Removes and returns the head of the highest non-empty lane.
    pub fn next(&self) -> Option<JobId> {
        let mut lanes = self.lanes();
        let id = lanes.iter_mut().find_map(|lane| lane.pop_front());

        // Hand the wake-up on if there's more work, so an idle worker doesn't
        // sleep on a non-empty queue.
        if id.is_some() && lanes.iter().any(|lane| !lane.is_empty()) {
            self.wake.notify_one();
        }

        id
    }

    /// Removes and returns the first job, in lane order, whose printer is
    /// free, along with that printer's guard. Jobs for busy printers keep
    /// their place.
    pub fn next_ready(
        &self,
        locks: &PrinterLocks,
    ) -> Option<(JobId, PrinterGuard)> {
        let mut lanes = self.lanes();
        let mut claimed = None;

        for lane in lanes.iter_mut() {
            for pos in 0..lane.len() {
                let id = lane[pos];
                let Some(job) = self.store.get(&id) else {
                    continue;
                };
                if let Some(guard) = locks.try_acquire(&job.printer_ref) {
                    lane.remove(pos);
                    claimed = Some((id, guard));
                    break;
                }
            }
            if claimed.is_some() {
                break;
            }
        }

        if claimed.is_some() && lanes.iter().any(|lane| !lane.is_empty()) {
            self.wake.notify_one();
        }

        claimed
    }

    /// As `next_ready`, but waits for a submission or a printer release when
    /// nothing can start. Returns `None` once `shutdown` is cancelled.
    pub async fn claim(
        &self,
        locks: &PrinterLocks,
        shutdown: &CancellationToken,
    ) -> Option<(JobId, PrinterGuard)> {
        loop {
            // Registered before scanning so a wake-up between the scan and
            // the wait isn't lost.
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claimed) = self.next_ready(locks) {
                return Some(claimed);
            }

            select! {
                _ = notified => {},
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    /// Wakes every waiting worker so jobs held back for a printer that has
    /// just been released get another look.
    pub fn printer_released(&self) {
        self.wake.notify_waiters();
    }

    /// Drops `id` from whichever lane holds it. Returns whether it was found.
    pub(crate) fn withdraw(&self, id: &JobId) -> bool {
        let mut lanes = self.lanes();
        for lane in lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|x| x == id) {
                lane.remove(pos);
                debug!(%id, "withdrew job from lane");
                return true;
            }
        }
        false
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = {
            let lanes = self.lanes();
            QueueStats {
                lane_high: lanes[Priority::High.lane()].len(),
                lane_normal: lanes[Priority::Normal.lane()].len(),
                lane_low: lanes[Priority::Low.lane()].len(),
                ..Default::default()
            }
        };

        for id in self.store.ids() {
            if let Some(job) = self.store.get(&id) {
                stats.count(job.status);
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use crate::store::MemoryStore;

    fn queue() -> PriorityQueue {
        PriorityQueue::new(Arc::new(MemoryStore::new()))
    }

    fn units(n: usize) -> Vec<Bytes> {
        (1..=n).map(|i| Bytes::from(format!("^XA^FD{i}^FS^XZ"))).collect()
    }

    #[test]
    fn test_drain_order() {
        let q = queue();

        let c = q.submit(units(1), "p", Some(Priority::Low)).unwrap();
        let b = q.submit(units(1), "p", None).unwrap();
        let a = q.submit(units(1), "p", Some(Priority::High)).unwrap();

        assert_eq!(q.next(), Some(a));
        assert_eq!(q.next(), Some(b));
        assert_eq!(q.next(), Some(c));
        assert_eq!(q.next(), None);
    }

    #[test]
    fn test_fifo_within_lane() {
        let q = queue();

        let ids: Vec<_> = (0..5)
            .map(|_| q.submit(units(2), "p", Some(Priority::Normal)).unwrap())
            .collect();
        let high = q.submit(units(1), "p", Some(Priority::High)).unwrap();

        assert_eq!(q.next(), Some(high));
        for id in ids {
            assert_eq!(q.next(), Some(id));
        }
    }

    #[test]
    fn test_submit_admits_as_queued() {
        let q = queue();
        let id = q.submit(units(3), "zebra-1", None).unwrap();

        let job = q.store().get(&id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.quantity(), 3);
        assert_eq!(job.printer_ref, "zebra-1");
    }

    #[test]
    fn test_admission_errors() {
        let q = queue().with_max_unit_size(8);

        assert_eq!(q.submit(vec![], "p", None), Err(SubmitError::EmptyJob));
        assert_eq!(
            q.submit(units(1), "  ", None),
            Err(SubmitError::MissingPrinter)
        );
        assert_eq!(
            q.submit(vec![Bytes::from("ok"), Bytes::from("too long!")], "p", None),
            Err(SubmitError::UnitTooLarge {
                index: 2,
                size: 9,
                limit: 8
            })
        );

        // Nothing was created or queued.
        assert!(q.store().ids().is_empty());
        assert_eq!(q.next(), None);
    }

    #[test]
    fn test_concurrent_submit_and_exactly_once_next() {
        let q = Arc::new(queue());

        let producers: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| q.submit(units(1), "p", None).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut submitted: Vec<_> = producers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || {
                    std::iter::from_fn(|| q.next()).collect::<Vec<_>>()
                })
            })
            .collect();
        let mut claimed: Vec<_> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        submitted.sort_by_key(|id| id.to_string());
        claimed.sort_by_key(|id| id.to_string());
        assert_eq!(submitted.len(), 400);
        assert_eq!(claimed, submitted);
    }

    #[test]
    fn test_withdraw_and_stats() {
        let q = queue();
        let a = q.submit(units(1), "p", Some(Priority::High)).unwrap();
        q.submit(units(1), "p", Some(Priority::Low)).unwrap();

        let stats = q.stats();
        assert_eq!(stats.lane_high, 1);
        assert_eq!(stats.lane_low, 1);
        assert_eq!(stats.jobs_queued, 2);
        assert_eq!(stats.total_jobs, 2);

        assert!(q.withdraw(&a));
        assert!(!q.withdraw(&a));
        assert_eq!(q.stats().lane_high, 0);
    }

    #[test]
    fn test_unknown_printer_and_unit_count() {
        let q = queue()
            .with_printers(["zebra-1".to_owned(), "zebra-2".to_owned()])
            .with_max_units(3);

        assert_eq!(
            q.submit(units(1), "zebra-9", None),
            Err(SubmitError::UnknownPrinter("zebra-9".into()))
        );
        assert_eq!(
            q.submit(units(4), "zebra-1", None),
            Err(SubmitError::TooManyUnits { count: 4, limit: 3 })
        );
        assert!(q.store().ids().is_empty());

        assert!(q.submit(units(3), " zebra-2 ", None).is_ok());
    }

    #[tokio::test]
    async fn test_next_ready_skips_busy_printer() {
        let q = queue();
        let locks = PrinterLocks::new();

        let busy = q.submit(units(1), "zebra-1", Some(Priority::High)).unwrap();
        let later = q.submit(units(1), "zebra-1", Some(Priority::High)).unwrap();
        let free = q.submit(units(1), "zebra-2", Some(Priority::Low)).unwrap();

        let held = locks.acquire("zebra-1").await;
        let (id, _guard) = q.next_ready(&locks).unwrap();
        assert_eq!(id, free);
        assert!(q.next_ready(&locks).is_none());

        // Skipped jobs kept their places.
        drop(held);
        let (id, first) = q.next_ready(&locks).unwrap();
        assert_eq!(id, busy);
        assert!(q.next_ready(&locks).is_none());
        drop(first);
        assert_eq!(q.next_ready(&locks).map(|(id, _)| id), Some(later));
    }

    #[tokio::test]
    async fn test_claim_waits_for_submission() {
        let q = Arc::new(queue());
        let shutdown = CancellationToken::new();

        let waiter = {
            let q = q.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let locks = PrinterLocks::new();
                q.claim(&locks, &shutdown).await.map(|(id, _)| id)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = q.submit(units(1), "p", None).unwrap();

        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_claim_waits_for_printer_release() {
        let q = Arc::new(queue());
        let locks = Arc::new(PrinterLocks::new());
        let shutdown = CancellationToken::new();

        let id = q.submit(units(1), "zebra-1", None).unwrap();
        let held = locks.acquire("zebra-1").await;

        let waiter = {
            let q = q.clone();
            let locks = locks.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                q.claim(&locks, &shutdown).await.map(|(id, _)| id)
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        q.printer_released();
        assert_eq!(waiter.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_claim_returns_on_shutdown() {
        let q = queue();
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        assert!(q.claim(&PrinterLocks::new(), &shutdown).await.is_none());
    }
}
