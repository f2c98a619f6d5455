// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable print job queue.
//
// A single worker task owns the job store and the ready set. Callers talk to
// it through `PrintQueue`, which sends commands over a channel and awaits a
// oneshot reply, so no caller ever touches queue state directly.
//
// Each print attempt runs on its own task and reports back to the worker.
// The worker keeps at most one attempt in flight per printer; jobs for other
// printers dispatch independently. Every status change is written to SQLite
// before the matching event is published.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use ticketpress_core::config::{EngineConfig, RetryPolicy};
use ticketpress_core::error::{QueueError, Result, TicketpressError};
use ticketpress_core::types::{
    HistoryFilter, JobError, JobId, JobStatus, PrintJob, PrinterProfile, Priority, ProfileId,
    QueueStatus, Ticket,
};

use crate::connection::ConnectionManager;
use crate::encoder::TicketEncoder;
use crate::events::{EventBus, JobEvent};
use crate::registry::PrinterRegistry;
use crate::retry::{self, RetryDecision};
use crate::scheduler::{ReadyEntry, ReadyQueue};
use crate::store::JobStore;

/// Registry handle shared by the queue, the monitor and the service.
pub type SharedRegistry = Arc<Mutex<PrinterRegistry>>;

pub(crate) fn lock_registry(registry: &SharedRegistry) -> std::sync::MutexGuard<'_, PrinterRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue settings taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub retry: RetryPolicy,
    pub reset_attempts_on_manual_retry: bool,
    pub max_copies: u32,
}

impl From<&EngineConfig> for QueueConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            reset_attempts_on_manual_retry: config.reset_attempts_on_manual_retry,
            max_copies: config.max_copies,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// What `cancel_job` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was waiting and is now Cancelled.
    Cancelled,
    /// The job is printing. A successful attempt still completes it; a failed
    /// one that would be retried is cancelled instead, and one that cannot be
    /// retried fails as usual.
    Deferred,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Submit {
        ticket: Box<Ticket>,
        printer: Option<ProfileId>,
        priority: Priority,
        copies: u32,
        reply: Reply<JobId>,
    },
    Cancel {
        id: JobId,
        reply: Reply<CancelOutcome>,
    },
    Retry {
        id: JobId,
        reply: Reply<()>,
    },
    Status {
        reply: Reply<QueueStatus>,
    },
    History {
        filter: HistoryFilter,
        reply: Reply<Vec<PrintJob>>,
    },
    Get {
        id: JobId,
        reply: Reply<Option<PrintJob>>,
    },
    WaitFor {
        id: JobId,
        reply: Reply<PrintJob>,
    },
    CountReferences {
        printer: ProfileId,
        reply: Reply<usize>,
    },
    Pause {
        reply: oneshot::Sender<()>,
    },
    Resume {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Report from a finished print attempt.
struct AttemptDone {
    job_id: JobId,
    printer: ProfileId,
    outcome: std::result::Result<(), JobError>,
    digest: Option<String>,
}

/// Handle to the queue worker. Cheap to clone.
#[derive(Clone)]
pub struct PrintQueue {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus<JobEvent>,
}

impl PrintQueue {
    /// Recover persisted jobs and start the worker.
    ///
    /// Subscribe to `events` before calling this to observe recovery. Must be
    /// called from within a tokio runtime.
    pub fn start(
        config: QueueConfig,
        store: JobStore,
        registry: SharedRegistry,
        connections: Arc<ConnectionManager>,
        events: EventBus<JobEvent>,
    ) -> Result<Self> {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let mut worker = Worker {
            config,
            store,
            registry,
            connections,
            events: events.clone(),
            ready: ReadyQueue::new(),
            busy: HashSet::new(),
            waiters: HashMap::new(),
            paused: false,
            shutdown: None,
            next_seq: 1,
            counts: QueueStatus::default(),
            last_status: None,
            done_tx,
        };
        worker.recover()?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker.run(command_rx, done_rx));
        Ok(Self { commands, events })
    }

    pub fn events(&self) -> &EventBus<JobEvent> {
        &self.events
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| QueueError::ShutDown)?;
        rx.await.map_err(|_| QueueError::ShutDown)?
    }

    async fn signal(&self, make: impl FnOnce(oneshot::Sender<()>) -> Command) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| QueueError::ShutDown)?;
        rx.await.map_err(|_| QueueError::ShutDown.into())
    }

    /// Submit a ticket. `printer: None` targets the registry's default
    /// printer; the resolved id is frozen on the job.
    pub async fn add_job(
        &self,
        ticket: Ticket,
        printer: Option<ProfileId>,
        priority: Priority,
        copies: u32,
    ) -> Result<JobId> {
        self.request(|reply| Command::Submit {
            ticket: Box::new(ticket),
            printer,
            priority,
            copies,
            reply,
        })
        .await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<CancelOutcome> {
        self.request(|reply| Command::Cancel { id, reply }).await
    }

    /// Put a Failed job back in the queue.
    pub async fn retry_job(&self, id: JobId) -> Result<()> {
        self.request(|reply| Command::Retry { id, reply }).await
    }

    pub async fn queue_status(&self) -> Result<QueueStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn print_history(&self, filter: HistoryFilter) -> Result<Vec<PrintJob>> {
        self.request(|reply| Command::History { filter, reply }).await
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<PrintJob>> {
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Resolve once the job reaches Completed, Failed or Cancelled.
    pub async fn wait_for(&self, id: JobId) -> Result<PrintJob> {
        self.request(|reply| Command::WaitFor { id, reply }).await
    }

    /// Number of stored jobs targeting `printer`.
    pub async fn count_referencing(&self, printer: ProfileId) -> Result<usize> {
        self.request(|reply| Command::CountReferences { printer, reply })
            .await
    }

    /// Stop starting new attempts. Submissions are still accepted.
    pub async fn pause(&self) -> Result<()> {
        self.signal(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.signal(|reply| Command::Resume { reply }).await
    }

    /// Let in-flight attempts finish, then stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.signal(|reply| Command::Shutdown { reply }).await
    }
}

/// Pause before a store write that failed is tried again.
const STORE_RETRY_DELAY: Duration = Duration::from_secs(1);

struct Worker {
    config: QueueConfig,
    store: JobStore,
    registry: SharedRegistry,
    connections: Arc<ConnectionManager>,
    events: EventBus<JobEvent>,
    ready: ReadyQueue,
    /// Printers with an attempt in flight or an outcome not yet recorded.
    busy: HashSet<ProfileId>,
    waiters: HashMap<JobId, Vec<Reply<PrintJob>>>,
    paused: bool,
    shutdown: Option<oneshot::Sender<()>>,
    next_seq: u64,
    /// Live counts. The worker is the only writer, so these stay equal to
    /// what the store would report.
    counts: QueueStatus,
    last_status: Option<QueueStatus>,
    done_tx: mpsc::UnboundedSender<AttemptDone>,
}

impl Worker {
    /// Rebuild the ready set from the store.
    ///
    /// A job left in Printing was interrupted mid-attempt: its outcome is
    /// unknown, so the attempt is rolled back and the job retried at once,
    /// unless a cancel was pending, in which case it is cancelled.
    fn recover(&mut self) -> Result<()> {
        let now = Instant::now();
        let wall = Utc::now();
        let jobs = self.store.active_jobs()?;
        self.counts = self.store.status_counts()?;
        let count = jobs.len();

        for mut job in jobs {
            match job.status {
                JobStatus::Queued => self.enqueue(&job, None),
                JobStatus::Retrying if job.cancel_requested => {
                    job.next_attempt_at = None;
                    self.transition(&mut job, JobStatus::Cancelled)?;
                    info!(job_id = %job.id, "pending cancel applied on restart");
                    self.events.emit(JobEvent::Updated(job));
                }
                JobStatus::Retrying => {
                    let remaining = job
                        .next_attempt_at
                        .and_then(|at| (at - wall).to_std().ok())
                        .unwrap_or_default();
                    self.enqueue(&job, Some(now + remaining));
                }
                JobStatus::Printing => {
                    job.attempts = job.attempts.saturating_sub(1);
                    job.next_attempt_at = Some(wall);
                    self.transition(&mut job, JobStatus::Retrying)?;
                    warn!(job_id = %job.id, printer = %job.printer_id, "interrupted print rolled back");
                    self.events.emit(JobEvent::Updated(job.clone()));

                    if job.cancel_requested {
                        job.next_attempt_at = None;
                        self.transition(&mut job, JobStatus::Cancelled)?;
                        info!(job_id = %job.id, "interrupted job had a pending cancel");
                        self.events.emit(JobEvent::Updated(job));
                    } else {
                        self.enqueue(&job, Some(now));
                    }
                }
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {}
            }
        }

        self.next_seq = self.store.next_seq()?;
        if count > 0 {
            info!(jobs = count, "recovered unfinished jobs");
        }
        Ok(())
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut done: mpsc::UnboundedReceiver<AttemptDone>,
    ) {
        info!("print queue worker started");
        self.dispatch();
        loop {
            let wakeup = self.ready.next_wakeup();
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => {
                        debug!("all queue handles dropped");
                        break;
                    }
                },
                Some(report) = done.recv() => self.finish_attempt(report),
                () = sleep_until(wakeup) => {}
            }

            if self.shutdown.is_some() && self.busy.is_empty() {
                break;
            }
            self.dispatch();
        }

        if let Some(reply) = self.shutdown.take() {
            let _ = reply.send(());
        }
        info!("print queue worker stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Submit {
                ticket,
                printer,
                priority,
                copies,
                reply,
            } => {
                let _ = reply.send(self.submit(*ticket, printer, priority, copies));
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Retry { id, reply } => {
                let _ = reply.send(self.manual_retry(id));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.counts));
            }
            Command::History { filter, reply } => {
                let _ = reply.send(self.store.history(&filter));
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.store.get_job(&id));
            }
            Command::WaitFor { id, reply } => match self.store.get_job(&id) {
                Ok(Some(job)) if job.status.is_terminal() => {
                    let _ = reply.send(Ok(job));
                }
                Ok(Some(_)) => self.waiters.entry(id).or_default().push(reply),
                Ok(None) => {
                    let _ = reply.send(Err(QueueError::JobNotFound(id).into()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::CountReferences { printer, reply } => {
                let _ = reply.send(self.store.count_referencing(&printer));
            }
            Command::Pause { reply } => {
                self.paused = true;
                info!("print queue paused");
                let _ = reply.send(());
            }
            Command::Resume { reply } => {
                self.paused = false;
                info!("print queue resumed");
                let _ = reply.send(());
            }
            Command::Shutdown { reply } => {
                info!(in_flight = self.busy.len(), "print queue shutting down");
                self.shutdown = Some(reply);
            }
        }
    }

    // -- operations ---------------------------------------------------------

    #[instrument(skip(self, ticket), fields(ticket = %ticket.ticket_number))]
    fn submit(
        &mut self,
        ticket: Ticket,
        printer: Option<ProfileId>,
        priority: Priority,
        copies: u32,
    ) -> Result<JobId> {
        if self.shutdown.is_some() {
            return Err(QueueError::ShutDown.into());
        }
        if copies == 0 || copies > self.config.max_copies {
            return Err(QueueError::InvalidCopies {
                requested: copies,
                max: self.config.max_copies,
            }
            .into());
        }

        let profile = {
            let registry = lock_registry(&self.registry);
            match printer {
                Some(id) => registry.require(&id)?,
                None => registry
                    .default_profile()?
                    .ok_or(QueueError::NoDefaultPrinter)?,
            }
        };
        if !profile.active {
            return Err(QueueError::PrinterInactive(profile.id).into());
        }

        let job = PrintJob::new(
            ticket,
            profile.id,
            priority,
            copies,
            self.config.retry.max_attempts,
            self.next_seq,
        );
        self.store.insert_job(&job)?;
        self.next_seq += 1;
        self.counts.queued += 1;

        info!(job_id = %job.id, printer = %job.printer_id, ?priority, copies, "job queued");
        self.enqueue(&job, None);
        let id = job.id;
        self.events.emit(JobEvent::Created(job));
        Ok(id)
    }

    #[instrument(skip(self))]
    fn cancel(&mut self, id: JobId) -> Result<CancelOutcome> {
        let mut job = self.load(id)?;
        match job.status {
            JobStatus::Retrying if job.cancel_requested => Err(QueueError::AlreadyCancelled(id).into()),
            JobStatus::Queued | JobStatus::Retrying => {
                job.next_attempt_at = None;
                self.transition(&mut job, JobStatus::Cancelled)?;
                self.ready.remove(&id);
                info!(job_id = %id, "job cancelled");
                self.events.emit(JobEvent::Updated(job.clone()));
                self.notify_waiters(&job);
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Printing if job.cancel_requested => Err(QueueError::AlreadyCancelled(id).into()),
            JobStatus::Printing => {
                job.cancel_requested = true;
                job.updated_at = Utc::now();
                self.store.update_job(&job)?;
                info!(job_id = %id, "cancel deferred until the attempt finishes");
                self.events.emit(JobEvent::Updated(job));
                Ok(CancelOutcome::Deferred)
            }
            JobStatus::Cancelled => Err(QueueError::AlreadyCancelled(id).into()),
            JobStatus::Completed | JobStatus::Failed => Err(QueueError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Cancelled,
            }
            .into()),
        }
    }

    #[instrument(skip(self))]
    fn manual_retry(&mut self, id: JobId) -> Result<()> {
        let mut job = self.load(id)?;
        if job.status != JobStatus::Failed {
            return Err(QueueError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Queued,
            }
            .into());
        }
        if self.config.reset_attempts_on_manual_retry {
            job.attempts = 0;
        } else if job.attempts >= job.max_attempts {
            return Err(QueueError::RetryLimitReached(id).into());
        }

        job.next_attempt_at = None;
        job.cancel_requested = false;
        self.transition(&mut job, JobStatus::Queued)?;
        info!(job_id = %id, attempts = job.attempts, "failed job resubmitted");
        self.enqueue(&job, None);
        self.events.emit(JobEvent::Updated(job));
        Ok(())
    }

    // -- scheduling ---------------------------------------------------------

    fn enqueue(&mut self, job: &PrintJob, not_before: Option<Instant>) {
        self.ready.push(ReadyEntry {
            job_id: job.id,
            printer: job.printer_id.clone(),
            priority: job.priority,
            seq: job.seq,
            not_before,
        });
    }

    /// Put `job` back in the ready set once the store has had a moment.
    fn enqueue_after_store_failure(&mut self, job: &PrintJob) {
        self.enqueue(job, Some(Instant::now() + STORE_RETRY_DELAY));
    }

    fn dispatch(&mut self) {
        for id in self.ready.take_due(Instant::now()) {
            self.promote(id);
        }

        if !self.paused && self.shutdown.is_none() {
            for printer in self.ready.printers_with_work() {
                if self.busy.contains(&printer) {
                    continue;
                }
                if let Some(id) = self.ready.pop_for(&printer) {
                    self.start_attempt(id);
                }
            }
        }

        self.publish_status();
    }

    /// Retrying -> Queued once the backoff has elapsed, or Cancelled if a
    /// cancel is pending.
    fn promote(&mut self, id: JobId) {
        let Some(mut job) = self.load_logged(id) else {
            self.ready.remove(&id);
            return;
        };
        if job.status != JobStatus::Retrying {
            return;
        }
        if job.cancel_requested {
            self.apply_pending_cancel(job);
            return;
        }
        job.next_attempt_at = None;
        if self.transition(&mut job, JobStatus::Queued).is_err() {
            self.enqueue_after_store_failure(&job);
            return;
        }
        debug!(job_id = %id, "backoff elapsed");
        self.events.emit(JobEvent::Updated(job));
    }

    /// Retrying -> Cancelled for a job whose cancel arrived mid-attempt.
    fn apply_pending_cancel(&mut self, mut job: PrintJob) {
        job.next_attempt_at = None;
        if self.transition(&mut job, JobStatus::Cancelled).is_err() {
            self.enqueue_after_store_failure(&job);
            return;
        }
        self.ready.remove(&job.id);
        info!(job_id = %job.id, "pending cancel applied");
        self.notify_waiters(&job);
        self.events.emit(JobEvent::Updated(job));
    }

    fn start_attempt(&mut self, id: JobId) {
        let Some(mut job) = self.load_logged(id) else {
            return;
        };
        if job.status != JobStatus::Queued {
            debug!(job_id = %id, status = job.status.label(), "skipping job that is no longer queued");
            return;
        }

        job.attempts += 1;
        job.last_attempt_at = Some(Utc::now());
        if self.transition(&mut job, JobStatus::Printing).is_err() {
            self.enqueue_after_store_failure(&job);
            return;
        }
        self.busy.insert(job.printer_id.clone());
        info!(job_id = %id, printer = %job.printer_id, attempt = job.attempts, "printing");
        self.events.emit(JobEvent::Updated(job.clone()));

        let lookup = lock_registry(&self.registry).require(&job.printer_id);
        let profile = match lookup {
            Ok(profile) => profile,
            Err(e) => {
                self.finish_attempt(AttemptDone {
                    job_id: id,
                    printer: job.printer_id,
                    outcome: Err(e.to_job_error()),
                    digest: None,
                });
                return;
            }
        };

        let connections = Arc::clone(&self.connections);
        let done = self.done_tx.clone();
        let ticket = job.ticket;
        let copies = job.copies;
        tokio::spawn(async move {
            let (outcome, digest) = run_attempt(&connections, &profile, &ticket, copies).await;
            let _ = done.send(AttemptDone {
                job_id: id,
                printer: profile.id,
                outcome: outcome.map_err(|e| e.to_job_error()),
                digest,
            });
        });
    }

    /// Record an attempt's outcome. The printer stays busy until the store
    /// has taken it; a failed write re-delivers the report shortly.
    fn finish_attempt(&mut self, report: AttemptDone) {
        match self.record_outcome(&report) {
            Ok(()) => {
                self.busy.remove(&report.printer);
            }
            Err(e) => {
                warn!(job_id = %report.job_id, error = %e, "attempt outcome not recorded, trying again");
                let done = self.done_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(STORE_RETRY_DELAY).await;
                    let _ = done.send(report);
                });
            }
        }
    }

    fn record_outcome(&mut self, report: &AttemptDone) -> Result<()> {
        let Some(mut job) = self.store.get_job(&report.job_id)? else {
            warn!(job_id = %report.job_id, "attempt finished for a job no longer stored");
            return Ok(());
        };
        if job.status != JobStatus::Printing {
            warn!(job_id = %job.id, status = job.status.label(), "attempt finished for a job not printing");
            return Ok(());
        }

        if let Some(digest) = &report.digest {
            match &job.payload_digest {
                None => job.payload_digest = Some(digest.clone()),
                Some(first) if first != digest => {
                    warn!(job_id = %job.id, "encoded ticket differs from the first attempt");
                }
                Some(_) => {}
            }
        }

        let error = match &report.outcome {
            Ok(()) => {
                job.completed_at = Some(Utc::now());
                job.last_error = None;
                self.transition(&mut job, JobStatus::Completed)?;
                info!(job_id = %job.id, copies = job.copies, attempts = job.attempts, "job completed");
                self.notify_waiters(&job);
                self.events.emit(JobEvent::Completed(job));
                return Ok(());
            }
            Err(error) => error.clone(),
        };
        job.last_error = Some(error.clone());

        let policy = RetryPolicy {
            max_attempts: job.max_attempts,
            ..self.config.retry.clone()
        };
        match retry::should_retry(&error, job.attempts, &policy) {
            RetryDecision::RetryAfter(_) if job.cancel_requested => {
                job.next_attempt_at = None;
                self.transition(&mut job, JobStatus::Retrying)?;
                info!(job_id = %job.id, error = %error.message, "attempt failed with a cancel pending");
                self.events.emit(JobEvent::Updated(job.clone()));
                self.apply_pending_cancel(job);
            }
            RetryDecision::RetryAfter(delay) => {
                let now = Utc::now();
                job.next_attempt_at = chrono::Duration::from_std(delay).ok().map(|d| now + d);
                self.transition(&mut job, JobStatus::Retrying)?;
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.message,
                    "print attempt failed, will retry"
                );
                self.enqueue(&job, Some(Instant::now() + delay));
                self.events.emit(JobEvent::Updated(job));
            }
            RetryDecision::GiveUp(_) | RetryDecision::Exhausted => {
                job.next_attempt_at = None;
                self.transition(&mut job, JobStatus::Failed)?;
                error!(
                    job_id = %job.id,
                    attempts = job.attempts,
                    category = ?error.category,
                    cancel_requested = job.cancel_requested,
                    error = %error.message,
                    "print job failed"
                );
                self.notify_waiters(&job);
                self.events.emit(JobEvent::Failed { job, error });
            }
        }
        Ok(())
    }

    // -- helpers ------------------------------------------------------------

    /// Move `job` to `to` and write it. Nothing is published here; callers
    /// emit only after this returns `Ok`.
    fn transition(&mut self, job: &mut PrintJob, to: JobStatus) -> Result<()> {
        let from = job.status;
        if !from.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                id: job.id,
                from,
                to,
            }
            .into());
        }
        job.status = to;
        job.updated_at = Utc::now();
        if let Err(e) = self.store.update_job(job) {
            job.status = from;
            error!(job_id = %job.id, from = from.label(), to = to.label(), error = %e, "failed to persist job");
            return Err(e);
        }
        self.counts.record_transition(from, to);
        Ok(())
    }

    fn load(&self, id: JobId) -> Result<PrintJob> {
        self.store
            .get_job(&id)?
            .ok_or_else(|| QueueError::JobNotFound(id).into())
    }

    fn load_logged(&self, id: JobId) -> Option<PrintJob> {
        match self.load(id) {
            Ok(job) => Some(job),
            Err(e) => {
                error!(job_id = %id, error = %e, "cannot load job");
                None
            }
        }
    }

    fn notify_waiters(&mut self, job: &PrintJob) {
        for waiter in self.waiters.remove(&job.id).unwrap_or_default() {
            let _ = waiter.send(Ok(job.clone()));
        }
    }

    fn publish_status(&mut self) {
        if self.last_status != Some(self.counts) {
            self.last_status = Some(self.counts);
            self.events.emit(JobEvent::QueueStatusChanged(self.counts));
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Encode, connect, check readiness and send every copy.
///
/// Returns the digest of the encoded bytes alongside the outcome so the
/// worker can record it even when the send fails.
async fn run_attempt(
    connections: &ConnectionManager,
    profile: &PrinterProfile,
    ticket: &Ticket,
    copies: u32,
) -> (Result<()>, Option<String>) {
    let encoded = match TicketEncoder::new(&profile.capabilities, &profile.settings).encode(ticket) {
        Ok(encoded) => encoded,
        Err(e) => return (Err(e.into()), None),
    };
    let digest = Some(encoded.digest().to_string());

    let outcome = async {
        connections.connect(profile).await?;
        let status = connections.status(&profile.id).await;
        if let Some(fault) = status.readiness.and_then(|r| r.fault()) {
            return Err(TicketpressError::PrinterFault(fault));
        }
        connections
            .send_copies(&profile.id, encoded.as_bytes(), copies)
            .await
    }
    .await;

    (outcome, digest)
}
