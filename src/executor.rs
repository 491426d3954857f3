//! Workers that take jobs off the queue and print them unit by unit.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::StoreError;
use crate::printer_lock::{PrinterGuard, PrinterLocks};
use crate::queue::PriorityQueue;
use crate::retry::RetryPolicy;
use crate::store::JobStore;
use crate::transport::{FatalReason, PrintOutcome, PrintTransport, PrinterState};
use crate::types::job::{Job, JobId};
use crate::types::states::JobStatus;

/// How a single unit ended up after its retry budget.
#[derive(Debug)]
enum UnitResult {
    Printed,
    Exhausted(String),
    Fatal(FatalReason),
}

pub struct Executor {
    queue: Arc<PriorityQueue>,
    store: Arc<dyn JobStore>,
    transport: Arc<dyn PrintTransport>,
    locks: PrinterLocks,
    retry: RetryPolicy,
    inter_unit_delay: Duration,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(
        queue: Arc<PriorityQueue>,
        transport: Arc<dyn PrintTransport>,
    ) -> Self {
        Self {
            store: queue.store().clone(),
            queue,
            transport,
            locks: PrinterLocks::new(),
            retry: RetryPolicy::default(),
            inter_unit_delay: Duration::from_millis(100),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Pause between consecutive units so the device isn't flooded. Doesn't
    /// count against any unit's retry budget.
    pub fn with_inter_unit_delay(mut self, delay: Duration) -> Self {
        self.inter_unit_delay = delay;
        self
    }

    /// Once `shutdown` fires, workers stop claiming and cancel the job in
    /// hand at the next unit boundary.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Starts `count` workers sharing this executor.
    pub fn spawn(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| tokio::spawn(self.clone().run(worker)))
            .collect()
    }

    /// Claims and executes jobs until shutdown. A worker only claims a job
    /// whose printer is free, so it never sits waiting on a busy printer
    /// while other printers have work.
    pub async fn run(self: Arc<Self>, worker: usize) {
        info!(worker, "worker started");

        while let Some((id, printer)) =
            self.queue.claim(&self.locks, &self.shutdown).await
        {
            let result = match self.store.get(&id) {
                Some(job) => self.execute_locked(job, printer).await,
                None => Err(StoreError::NotFound(id)),
            };
            self.queue.printer_released();

            if let Err(error) = result {
                error!(worker, %id, %error, "job execution failed");
            }
        }

        info!(worker, "worker stopped");
    }

    /// Runs a claimed job to a terminal state and returns that state, first
    /// waiting for its printer.
    pub async fn execute(&self, id: JobId) -> Result<JobStatus, StoreError> {
        let job = self.store.get(&id).ok_or(StoreError::NotFound(id))?;
        let printer = self.locks.acquire(&job.printer_ref).await;
        self.execute_locked(job, printer).await
    }

    /// The job's printer is held exclusively for the whole run. A job that is
    /// no longer `queued` by now (it was cancelled while waiting) is left
    /// alone and its current state returned.
    #[instrument(skip_all, fields(job = %job.id))]
    async fn execute_locked(
        &self,
        job: Job,
        _printer: PrinterGuard,
    ) -> Result<JobStatus, StoreError> {
        let id = job.id;

        if !self.store.compare_and_set_status(
            &id,
            JobStatus::Queued,
            JobStatus::Sent,
        )? {
            let status = self.store.get(&id).ok_or(StoreError::NotFound(id))?.status;
            debug!(%status, "job no longer queued, skipping");
            return Ok(status);
        }

        if self.transport.printer_state(&job.printer_ref).await
            == PrinterState::Stopped
        {
            return self.abort(&id, 1, FatalReason::PrinterOffline);
        }

        self.store.update(&id, &mut |j| j.advance(JobStatus::Printing))?;
        info!(
            printer = %job.printer_ref,
            quantity = job.quantity(),
            "printing"
        );

        let mut exhausted = 0;
        for (i, payload) in job.units.iter().enumerate() {
            let index = i + 1;

            if self.should_stop(&id)? {
                return self.finish_cancelled(&id, index);
            }

            match self.print_with_retry(&job.printer_ref, payload, index).await {
                UnitResult::Printed => {
                    self.store.update(&id, &mut |j| {
                        j.record_attempt(index);
                        Ok(())
                    })?;
                },
                UnitResult::Exhausted(reason) => {
                    warn!(unit = index, %reason, "unit failed after retries");
                    self.store.update(&id, &mut |j| {
                        j.record_attempt(index);
                        j.mark_failed(index);
                        Ok(())
                    })?;

                    exhausted += 1;
                    if self.retry.fail_job_after.is_some_and(|n| exhausted >= n) {
                        return self.abort(
                            &id,
                            index + 1,
                            FatalReason::TooManyFailures(exhausted),
                        );
                    }
                },
                UnitResult::Fatal(reason) => {
                    self.store.update(&id, &mut |j| {
                        j.record_attempt(index);
                        Ok(())
                    })?;
                    return self.abort(&id, index, reason);
                },
            }

            if index < job.quantity() && !self.inter_unit_delay.is_zero() {
                sleep(self.inter_unit_delay).await;
            }
        }

        let job = self.store.update(&id, &mut |j| {
            j.advance(if j.failed_units.is_empty() {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            })
        })?;

        info!(
            status = %job.status,
            failed = job.failed_units.len(),
            "job finished"
        );

        Ok(job.status)
    }

    /// Tries one unit up to the retry budget. Transient failures back off
    /// exponentially; a fatal outcome returns immediately.
    async fn print_with_retry(
        &self,
        printer_ref: &str,
        payload: &[u8],
        index: usize,
    ) -> UnitResult {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last = String::new();

        for attempt in 0..max_attempts {
            match self.transport.print_unit(printer_ref, payload).await {
                PrintOutcome::Ack => return UnitResult::Printed,
                PrintOutcome::Fatal(reason) => return UnitResult::Fatal(reason),
                PrintOutcome::Transient(reason) => {
                    debug!(
                        unit = index,
                        attempt = attempt + 1,
                        %reason,
                        "transient print failure"
                    );
                    last = reason;

                    if attempt + 1 < max_attempts {
                        sleep(self.retry.delay_for(attempt)).await;
                    }
                },
            }
        }

        UnitResult::Exhausted(last)
    }

    fn should_stop(&self, id: &JobId) -> Result<bool, StoreError> {
        let job = self.store.get(id).ok_or(StoreError::NotFound(*id))?;
        Ok(job.cancel_requested || self.shutdown.is_cancelled())
    }

    /// Ends the job as failed; units from `first_untried` on are recorded as
    /// failed so a resume picks them up.
    fn abort(
        &self,
        id: &JobId,
        first_untried: usize,
        reason: FatalReason,
    ) -> Result<JobStatus, StoreError> {
        let message = reason.to_string();
        error!(error = %message, "job aborted");

        let job = self.store.update(id, &mut |j| {
            j.mark_failed_from(first_untried);
            j.error_message = Some(message.clone());
            j.advance(JobStatus::Failed)
        })?;

        Ok(job.status)
    }

    fn finish_cancelled(
        &self,
        id: &JobId,
        first_untried: usize,
    ) -> Result<JobStatus, StoreError> {
        let job = self.store.update(id, &mut |j| {
            j.mark_failed_from(first_untried);
            j.advance(JobStatus::Cancelled)
        })?;

        info!(
            current_unit = job.current_unit,
            untried = job.quantity() - job.current_unit,
            "job cancelled"
        );

        Ok(job.status)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::store::MemoryStore;
    use crate::types::job::Priority;

    type Hook = Box<dyn FnMut(&[u8]) + Send>;

    /// Transport whose outcomes are scripted per payload. Unscripted calls
    /// are acknowledged.
    #[derive(Default)]
    pub(crate) struct Scripted {
        script: Mutex<HashMap<Vec<u8>, VecDeque<PrintOutcome>>>,
        pub(crate) calls: Mutex<Vec<(String, Vec<u8>)>>,
        state: Mutex<HashMap<String, PrinterState>>,
        busy: Mutex<HashMap<String, usize>>,
        pub(crate) overlapped: Mutex<bool>,
        hook: Mutex<Option<Hook>>,
        delay: Duration,
    }

    impl Scripted {
        pub(crate) fn with_delay(delay: Duration) -> Self {
            Self {
                delay,
                ..Default::default()
            }
        }

        pub(crate) fn script(&self, payload: &str, outcomes: Vec<PrintOutcome>) {
            self.script
                .lock()
                .unwrap()
                .insert(payload.as_bytes().to_vec(), outcomes.into());
        }

        pub(crate) fn set_state(&self, printer: &str, state: PrinterState) {
            self.state.lock().unwrap().insert(printer.into(), state);
        }

        pub(crate) fn on_call(&self, hook: Hook) {
            *self.hook.lock().unwrap() = Some(hook);
        }

        pub(crate) fn payloads(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| String::from_utf8_lossy(p).into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl PrintTransport for Scripted {
        async fn print_unit(
            &self,
            printer_ref: &str,
            payload: &[u8],
        ) -> PrintOutcome {
            {
                let mut busy = self.busy.lock().unwrap();
                let n = busy.entry(printer_ref.into()).or_default();
                *n += 1;
                if *n > 1 {
                    *self.overlapped.lock().unwrap() = true;
                }
            }
            self.calls
                .lock()
                .unwrap()
                .push((printer_ref.into(), payload.to_vec()));
            if let Some(hook) = self.hook.lock().unwrap().as_mut() {
                hook(payload);
            }

            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }

            *self.busy.lock().unwrap().get_mut(printer_ref).unwrap() -= 1;

            self.script
                .lock()
                .unwrap()
                .get_mut(payload)
                .and_then(|q| q.pop_front())
                .unwrap_or(PrintOutcome::Ack)
        }

        async fn printer_state(&self, printer_ref: &str) -> PrinterState {
            self.state
                .lock()
                .unwrap()
                .get(printer_ref)
                .copied()
                .unwrap_or(PrinterState::Idle)
        }
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        }
    }

    pub(crate) fn units(n: usize) -> Vec<Bytes> {
        (1..=n).map(|i| Bytes::from(format!("u{i}"))).collect()
    }

    fn transient() -> PrintOutcome {
        PrintOutcome::Transient("device busy".into())
    }

    fn setup(transport: Arc<Scripted>) -> (Arc<PriorityQueue>, Executor) {
        let queue = Arc::new(PriorityQueue::new(Arc::new(MemoryStore::new())));
        let executor = Executor::new(queue.clone(), transport)
            .with_retry(fast_retry())
            .with_inter_unit_delay(Duration::ZERO);
        (queue, executor)
    }

    #[tokio::test]
    async fn test_all_units_print() {
        let transport = Arc::new(Scripted::default());
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(5), "zebra-1", None).unwrap();
        assert_eq!(queue.next(), Some(id));
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Completed));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.current_unit, 5);
        assert!(job.failed_units.is_empty());
        assert!(job.error_message.is_none());
        assert!(job.completed_at.is_some());
        assert_eq!(transport.payloads(), vec!["u1", "u2", "u3", "u4", "u5"]);
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let transport = Arc::new(Scripted::default());
        transport.script("u2", vec![transient(), transient()]);
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(3), "zebra-1", None).unwrap();
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Completed));

        assert!(queue.store().get(&id).unwrap().failed_units.is_empty());
        assert_eq!(transport.payloads(), vec!["u1", "u2", "u2", "u2", "u3"]);
    }

    #[tokio::test]
    async fn test_exhausted_unit_does_not_stop_batch() {
        let transport = Arc::new(Scripted::default());
        transport.script("u2", vec![transient(), transient(), transient()]);
        transport.script("u4", vec![transient(), transient(), transient()]);
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(5), "zebra-1", None).unwrap();
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Failed));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.current_unit, 5);
        assert_eq!(job.failed_units, vec![2, 4]);
        assert!(job.error_message.is_none());
        assert_eq!(
            transport.payloads(),
            vec!["u1", "u2", "u2", "u2", "u3", "u4", "u4", "u4", "u5"]
        );
    }

    #[tokio::test]
    async fn test_stopped_printer_fails_every_unit() {
        let transport = Arc::new(Scripted::default());
        transport.set_state("zebra-1", PrinterState::Stopped);
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(4), "zebra-1", None).unwrap();
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Failed));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.current_unit, 0);
        assert_eq!(job.failed_units, vec![1, 2, 3, 4]);
        assert_eq!(
            job.error_message.as_deref(),
            Some(FatalReason::PrinterOffline.to_string().as_str())
        );
        assert!(transport.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_fatal_mid_batch_fails_the_rest() {
        let transport = Arc::new(Scripted::default());
        transport.script("u3", vec![PrintOutcome::Fatal(FatalReason::PaperOut)]);
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(6), "zebra-1", None).unwrap();
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Failed));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.current_unit, 3);
        assert_eq!(job.failed_units, vec![3, 4, 5, 6]);
        assert!(job.error_message.unwrap().starts_with("Printer is out of paper"));
        assert_eq!(transport.payloads(), vec!["u1", "u2", "u3"]);
    }

    #[tokio::test]
    async fn test_escalates_after_too_many_failures() {
        let transport = Arc::new(Scripted::default());
        for u in ["u1", "u2"] {
            transport.script(u, vec![transient(), transient(), transient()]);
        }
        let queue = Arc::new(PriorityQueue::new(Arc::new(MemoryStore::new())));
        let executor = Executor::new(queue.clone(), transport.clone())
            .with_retry(RetryPolicy {
                fail_job_after: Some(2),
                ..fast_retry()
            })
            .with_inter_unit_delay(Duration::ZERO);

        let id = queue.submit(units(4), "zebra-1", None).unwrap();
        assert_eq!(executor.execute(id).await, Ok(JobStatus::Failed));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.failed_units, vec![1, 2, 3, 4]);
        assert_eq!(
            job.error_message,
            Some(FatalReason::TooManyFailures(2).to_string())
        );
    }

    #[tokio::test]
    async fn test_cancel_between_units() {
        let transport = Arc::new(Scripted::default());
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(5), "zebra-1", None).unwrap();
        let store = queue.store().clone();
        transport.on_call(Box::new(move |payload| {
            if payload == b"u2" {
                store
                    .update(&id, &mut |j| {
                        j.cancel_requested = true;
                        Ok(())
                    })
                    .unwrap();
            }
        }));

        assert_eq!(executor.execute(id).await, Ok(JobStatus::Cancelled));

        let job = queue.store().get(&id).unwrap();
        // Unit 2 was already in flight and finishes.
        assert_eq!(job.current_unit, 2);
        assert_eq!(job.failed_units, vec![3, 4, 5]);
        assert_eq!(transport.payloads(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_at_unit_boundary() {
        let transport = Arc::new(Scripted::default());
        let shutdown = CancellationToken::new();
        let queue = Arc::new(PriorityQueue::new(Arc::new(MemoryStore::new())));
        let executor = Executor::new(queue.clone(), transport.clone())
            .with_retry(fast_retry())
            .with_inter_unit_delay(Duration::ZERO)
            .with_shutdown(shutdown.clone());

        let id = queue.submit(units(5), "zebra-1", None).unwrap();
        transport.on_call(Box::new(move |payload| {
            if payload == b"u2" {
                shutdown.cancel();
            }
        }));

        assert_eq!(executor.execute(id).await, Ok(JobStatus::Cancelled));

        let job = queue.store().get(&id).unwrap();
        assert_eq!(job.current_unit, 2);
        assert_eq!(job.failed_units, vec![3, 4, 5]);
        assert!(!job.cancel_requested);
        assert_eq!(transport.payloads(), vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_skips_job_no_longer_queued() {
        let transport = Arc::new(Scripted::default());
        let (queue, executor) = setup(transport.clone());

        let id = queue.submit(units(2), "zebra-1", None).unwrap();
        queue
            .store()
            .update(&id, &mut |j| j.advance(JobStatus::Cancelled))
            .unwrap();

        assert_eq!(executor.execute(id).await, Ok(JobStatus::Cancelled));
        assert!(transport.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_progress_never_goes_backwards() {
        let transport = Arc::new(Scripted::with_delay(Duration::from_millis(2)));
        transport.script("u3", vec![transient()]);
        let (queue, executor) = setup(transport);
        let executor = Arc::new(executor);

        let id = queue.submit(units(8), "zebra-1", None).unwrap();
        let run = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.execute(id).await })
        };

        let mut seen = Vec::new();
        loop {
            let job = queue.store().get(&id).unwrap();
            seen.push(job.current_unit);
            if job.status.is_terminal() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(run.await.unwrap(), Ok(JobStatus::Completed));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(seen.last(), Some(&8));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_one_job_per_printer_at_a_time() {
        let transport = Arc::new(Scripted::with_delay(Duration::from_millis(3)));
        let shutdown = CancellationToken::new();
        let queue = Arc::new(PriorityQueue::new(Arc::new(MemoryStore::new())));
        let executor = Arc::new(
            Executor::new(queue.clone(), transport.clone())
                .with_retry(fast_retry())
                .with_inter_unit_delay(Duration::ZERO)
                .with_shutdown(shutdown.clone()),
        );

        let ids: Vec<_> = (0..4)
            .map(|_| queue.submit(units(4), "zebra-1", Some(Priority::Normal)))
            .chain(std::iter::once(queue.submit(units(4), "zebra-2", None)))
            .collect::<Result<_, _>>()
            .unwrap();
        let workers = executor.spawn(4);

        for id in &ids {
            loop {
                if queue.store().get(id).unwrap().status.is_terminal() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }
        shutdown.cancel();
        for w in workers {
            w.await.unwrap();
        }

        assert!(!*transport.overlapped.lock().unwrap());

        // Each job's units reach zebra-1 as one contiguous run.
        let calls = transport.calls.lock().unwrap();
        let on_first: Vec<_> = calls
            .iter()
            .filter(|(p, _)| p == "zebra-1")
            .map(|(_, payload)| payload.clone())
            .collect();
        assert_eq!(on_first.len(), 16);
        for run in on_first.chunks(4) {
            let run: Vec<_> =
                run.iter().map(|p| String::from_utf8_lossy(p)).collect();
            assert_eq!(run, ["u1", "u2", "u3", "u4"]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_free_printer_not_held_up_by_busy_one() {
        let transport = Arc::new(Scripted::with_delay(Duration::from_millis(20)));
        let shutdown = CancellationToken::new();
        let queue = Arc::new(PriorityQueue::new(Arc::new(MemoryStore::new())));
        let executor = Arc::new(
            Executor::new(queue.clone(), transport)
                .with_retry(fast_retry())
                .with_inter_unit_delay(Duration::ZERO)
                .with_shutdown(shutdown.clone()),
        );

        // Both workers could pick up a zebra-1 job before the zebra-2 one.
        let long = queue.submit(units(10), "zebra-1", None).unwrap();
        let waiting = queue.submit(units(1), "zebra-1", None).unwrap();
        let other = queue.submit(units(1), "zebra-2", None).unwrap();
        let workers = executor.spawn(2);

        loop {
            if queue.store().get(&other).unwrap().status.is_terminal() {
                break;
            }
            sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(
            queue.store().get(&other).unwrap().status,
            JobStatus::Completed
        );
        assert!(!queue.store().get(&long).unwrap().status.is_terminal());
        assert_eq!(
            queue.store().get(&waiting).unwrap().status,
            JobStatus::Queued
        );

        for id in [long, waiting] {
            loop {
                if queue.store().get(&id).unwrap().status.is_terminal() {
                    break;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }
        shutdown.cancel();
        for w in workers {
            w.await.unwrap();
        }

        let job = queue.store().get(&waiting).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }
}
