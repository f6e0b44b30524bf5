//! Send orchestration.
//!
//! A run validates its inputs, restores or creates the session checkpoint,
//! opens the outbound connection and then drains the pending rows in
//! batches. Inside a batch a fixed set of workers pulls row indices from a
//! shared queue; each worker renders, assembles, sends and records one
//! recipient at a time. Failures are recorded per recipient and never stop
//! the run.

use crate::attachments::{Attachment, MessageAssembler, parse_mailbox};
use crate::checkpoint::{CheckpointStore, Snapshot};
use crate::config::{ConnectionPolicy, SendConfig};
use crate::error::{RunError, SendError};
use crate::mailer::{Connection, Relay};
use crate::recipients;
use crate::report::{self, RunSummary};
use crate::template::{PlaceholderRenderer, Renderer, Template};
use crate::types::{DeliveryResult, RecipientTable, SessionId};
use email_address::EmailAddress;
use lettre::message::Mailbox;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// How many times a row left unfinished by a batch timeout is put back
/// before it is recorded as failed.
const MAX_DEFERRALS: u32 = 1;

// ============================================================================
// Inputs / outputs
// ============================================================================

/// One bulk send: who, what, and under which session.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub session_id: SessionId,
    pub table: RecipientTable,
    pub template: Template,
    pub attachments: Vec<Attachment>,
    pub from: String,
}

#[derive(Debug)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub summary: RunSummary,
    /// Every result of the session in resolution order, including results
    /// restored from a checkpoint.
    pub results: Vec<DeliveryResult>,
    /// Stopped by [`CancelFlag`] with rows still pending. The checkpoint is
    /// kept so the session can be resumed.
    pub interrupted: bool,
}

/// How pending recipients are grouped and throttled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingMode {
    /// One recipient at a time, `per_email_delay` after each success.
    Sequential,
    /// Groups of up to N concurrent recipients, `batch_delay` between groups.
    BoundedParallel(usize),
}

impl SchedulingMode {
    pub fn from_config(config: &SendConfig) -> Self {
        if config.is_sequential() {
            Self::Sequential
        } else {
            Self::BoundedParallel(config.concurrency_limit)
        }
    }

    pub fn group_size(self) -> usize {
        match self {
            Self::Sequential => 1,
            Self::BoundedParallel(n) => n.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    Dispatching,
    BatchComplete(usize),
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: RunPhase,
    pub resolved: usize,
    pub total: usize,
}

/// Cooperative stop signal, checked before each recipient is picked up.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Shared run state
// ============================================================================

#[derive(Default)]
struct RunState {
    results: Vec<DeliveryResult>,
    resolved: HashSet<usize>,
    started: HashSet<usize>,
    sent_count: usize,
}

struct RunContext<'a, C> {
    session_id: &'a SessionId,
    table: &'a RecipientTable,
    template: &'a Template,
    attachments: &'a [Attachment],
    from: Mailbox,
    assembler: MessageAssembler,
    shared_connection: Option<tokio::sync::Mutex<C>>,
    state: Mutex<RunState>,
    last_checkpoint: tokio::sync::Mutex<usize>,
    total: usize,
}

impl<C> RunContext<'_, C> {
    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, state: &RunState) -> Snapshot {
        let mut snapshot = Snapshot::new(self.session_id.clone(), self.table.clone());
        snapshot.sent_count = state.sent_count;
        snapshot.results = state.results.clone();
        snapshot
    }
}

struct BatchOutcome {
    succeeded: usize,
    unfinished: Vec<usize>,
}

// ============================================================================
// BatchScheduler
// ============================================================================

pub struct BatchScheduler<R, S, T = PlaceholderRenderer> {
    relay: Arc<R>,
    store: Arc<S>,
    renderer: T,
    config: SendConfig,
    cancel: CancelFlag,
    progress: watch::Sender<Progress>,
}

impl<R: Relay, S: CheckpointStore> BatchScheduler<R, S> {
    pub fn new(relay: Arc<R>, store: Arc<S>, config: SendConfig) -> Self {
        Self::with_renderer(relay, store, PlaceholderRenderer, config)
    }
}

impl<R: Relay, S: CheckpointStore, T: Renderer> BatchScheduler<R, S, T> {
    pub fn with_renderer(relay: Arc<R>, store: Arc<S>, renderer: T, config: SendConfig) -> Self {
        let (progress, _) = watch::channel(Progress {
            phase: RunPhase::Idle,
            resolved: 0,
            total: 0,
        });
        Self {
            relay,
            store,
            renderer,
            config,
            cancel: CancelFlag::new(),
            progress,
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Drop a session's checkpoint without sending anything more.
    pub async fn abort(&self, session_id: &SessionId) -> anyhow::Result<()> {
        info!(session = %session_id, "Aborting session");
        self.store.clear(session_id).await
    }

    pub async fn run(&self, job: SendJob) -> Result<RunOutcome, RunError> {
        let span = info_span!("session", id = %job.session_id);
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, job: SendJob) -> Result<RunOutcome, RunError> {
        let SendJob {
            session_id,
            table,
            template,
            attachments,
            from,
        } = job;

        if !EmailAddress::is_valid(from.trim()) {
            return Err(RunError::Validation(format!(
                "Invalid sender address '{}'",
                from
            )));
        }
        let from = parse_mailbox(&from).map_err(|e| RunError::Validation(e.to_string()))?;

        // A checkpointed session keeps the table it started with.
        let restored = self.store.load(&session_id).await.map_err(|e| {
            RunError::Setup(format!("Failed to read checkpoint for {}: {:#}", session_id, e))
        })?;
        let resumed = restored.is_some();
        let (table, state) = match restored {
            Some(snapshot) => {
                info!(
                    sent_count = snapshot.sent_count,
                    results = snapshot.results.len(),
                    "Resuming session from checkpoint"
                );
                let state = RunState {
                    resolved: snapshot.resolved_rows(),
                    sent_count: snapshot.sent_count,
                    results: snapshot.results,
                    started: HashSet::new(),
                };
                (snapshot.table, state)
            }
            None => (table, RunState::default()),
        };
        recipients::validate(&table)?;

        let deliverable = recipients::deliverable(&table);
        let total = deliverable.len();
        let skipped = table.len() - total;
        if skipped > 0 {
            info!(skipped, "Excluded rows without a valid email address");
        }

        let pending: VecDeque<usize> = deliverable
            .into_iter()
            .filter(|row| !state.resolved.contains(row))
            .collect();

        info!(
            total,
            pending = pending.len(),
            concurrency = self.config.concurrency_limit,
            "Starting bulk send"
        );

        let shared_connection = if pending.is_empty() {
            None
        } else {
            self.setup_connection().await?
        };

        let ctx = RunContext {
            session_id: &session_id,
            table: &table,
            template: &template,
            attachments: &attachments,
            from,
            assembler: MessageAssembler::new(self.config.limits, self.config.compress_oversized),
            shared_connection,
            last_checkpoint: tokio::sync::Mutex::new(state.sent_count),
            state: Mutex::new(state),
            total,
        };

        if !resumed && !pending.is_empty() {
            let snapshot = ctx.snapshot(&ctx.state());
            self.store.save(&session_id, &snapshot).await.map_err(|e| {
                RunError::Setup(format!("Failed to create checkpoint: {:#}", e))
            })?;
        }

        let interrupted = self.dispatch(&ctx, pending).await;

        if interrupted {
            let snapshot = ctx.snapshot(&ctx.state());
            let resolved = snapshot.sent_count;
            self.checkpoint(&ctx, snapshot).await;
            warn!(
                resolved,
                total, "Run interrupted, checkpoint kept for resume"
            );
        }

        if let Some(connection) = ctx.shared_connection {
            connection.into_inner().close().await;
        }
        let state = ctx.state.into_inner().unwrap_or_else(PoisonError::into_inner);

        if !interrupted {
            self.set_progress(RunPhase::Drained, state.sent_count, total);
            if let Err(e) = self.store.clear(&session_id).await {
                warn!(error = %e, "Failed to clear checkpoint");
            }
        }

        let summary = report::summarize(&state.results, total);
        info!(
            sent = summary.sent_count,
            failed = summary.failed_count,
            total,
            "Bulk send finished"
        );

        Ok(RunOutcome {
            session_id,
            summary,
            results: state.results,
            interrupted,
        })
    }

    /// Open the run-wide connection, or probe credentials once when every
    /// recipient gets its own connection. Either failure aborts the run.
    async fn setup_connection(&self) -> Result<Option<tokio::sync::Mutex<R::Connection>>, RunError> {
        let connection = self.relay.open().await.map_err(|e| {
            error!(error = %e, "Cannot open outbound connection");
            RunError::Setup(format!("{:#}", e))
        })?;

        match self.config.effective_connection_policy() {
            ConnectionPolicy::PerRun => Ok(Some(tokio::sync::Mutex::new(connection))),
            ConnectionPolicy::PerRecipient => {
                connection.close().await;
                Ok(None)
            }
        }
    }

    /// Returns true when stopped by the cancel flag with rows still pending.
    async fn dispatch(&self, ctx: &RunContext<'_, R::Connection>, mut queue: VecDeque<usize>) -> bool {
        let mode = SchedulingMode::from_config(&self.config);
        let batch_size = mode.group_size();
        let mut deferrals: HashMap<usize, u32> = HashMap::new();
        let mut batch_number = 0;

        self.set_progress(RunPhase::Dispatching, ctx.state().sent_count, ctx.total);

        while !queue.is_empty() {
            if self.cancel.is_cancelled() {
                break;
            }

            batch_number += 1;
            let batch: Vec<usize> = queue.drain(..batch_size.min(queue.len())).collect();
            let span = info_span!("batch", number = batch_number, size = batch.len());
            let outcome = self.run_batch(ctx, &batch).instrument(span).await;

            for row in outcome.unfinished {
                let attempted = ctx.state().started.contains(&row);
                let count = deferrals.entry(row).or_insert(0);
                if attempted {
                    *count += 1;
                }
                if *count > MAX_DEFERRALS {
                    let email = ctx.table.row(row).map(|r| r.email()).unwrap_or("");
                    let err = SendError::Transport("Send timed out".to_string());
                    warn!(row, recipient = %email, "Recipient timed out twice, giving up");
                    self.record(ctx, to_result(row, email, Err(err))).await;
                } else {
                    debug!(row, "Recipient unfinished at batch timeout, re-queued");
                    queue.push_back(row);
                }
            }

            let resolved = ctx.state().sent_count;
            self.set_progress(RunPhase::BatchComplete(batch_number), resolved, ctx.total);

            if queue.is_empty() {
                break;
            }

            let delay = match mode {
                SchedulingMode::Sequential if outcome.succeeded > 0 => self.config.per_email_delay,
                SchedulingMode::Sequential => Duration::ZERO,
                SchedulingMode::BoundedParallel(_) => self.config.batch_delay,
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        // Workers stop mid-batch on cancel, so rows can be unresolved even
        // with an empty queue.
        self.cancel.is_cancelled() && ctx.state().sent_count < ctx.total
    }

    async fn run_batch(&self, ctx: &RunContext<'_, R::Connection>, batch: &[usize]) -> BatchOutcome {
        let work = Mutex::new(batch.iter().copied().collect::<VecDeque<usize>>());
        let succeeded = Mutex::new(0usize);
        let workers = (0..batch.len()).map(|_| self.worker(ctx, &work, &succeeded));

        let timed_out = tokio::time::timeout(
            self.config.batch_timeout,
            futures::future::join_all(workers),
        )
        .await
        .is_err();

        let succeeded = *succeeded.lock().unwrap_or_else(PoisonError::into_inner);
        if !timed_out {
            return BatchOutcome {
                succeeded,
                unfinished: Vec::new(),
            };
        }

        let state = ctx.state();
        let unfinished: Vec<usize> = batch
            .iter()
            .copied()
            .filter(|row| !state.resolved.contains(row))
            .collect();
        warn!(
            unfinished = unfinished.len(),
            timeout_secs = self.config.batch_timeout.as_secs_f64(),
            "Batch timed out"
        );
        BatchOutcome {
            succeeded,
            unfinished,
        }
    }

    async fn worker(
        &self,
        ctx: &RunContext<'_, R::Connection>,
        work: &Mutex<VecDeque<usize>>,
        succeeded: &Mutex<usize>,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let Some(row) = work.lock().unwrap_or_else(PoisonError::into_inner).pop_front() else {
                return;
            };
            ctx.state().started.insert(row);

            let result = self.deliver(ctx, row).await;
            if result.is_success() {
                *succeeded.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            }
            self.record(ctx, result).await;
        }
    }

    /// Render, assemble and send one row. Never fails: every error becomes
    /// a failed result.
    async fn deliver(&self, ctx: &RunContext<'_, R::Connection>, row: usize) -> DeliveryResult {
        let Some(recipient) = ctx.table.row(row) else {
            let err = SendError::Transport(format!("Row {} is out of range", row));
            return to_result(row, "", Err(err));
        };
        let email = recipient.email();

        let outcome = async {
            let to = parse_mailbox(email)?;
            let rendered = ctx.template.render_for(&self.renderer, recipient);
            let row_attachment = recipient
                .get(&self.config.row_attachment_column)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Path::new);

            let assembled = ctx
                .assembler
                .build(
                    &ctx.from,
                    &to,
                    &rendered.subject,
                    &rendered.body,
                    row_attachment,
                    ctx.attachments,
                )
                .await?;

            match &ctx.shared_connection {
                Some(shared) => shared.lock().await.send(&assembled.message).await,
                None => {
                    let mut connection = self
                        .relay
                        .open()
                        .await
                        .map_err(|e| SendError::Transport(format!("{:#}", e)))?;
                    let sent = connection.send(&assembled.message).await;
                    connection.close().await;
                    sent
                }
            }
        }
        .await;

        match &outcome {
            Ok(()) => info!(row, recipient = %email, "Delivered"),
            Err(e) => warn!(row, recipient = %email, kind = %e.kind(), error = %e, "Delivery failed"),
        }
        to_result(row, email, outcome)
    }

    async fn record(&self, ctx: &RunContext<'_, R::Connection>, result: DeliveryResult) {
        let due = {
            let mut state = ctx.state();
            if !state.resolved.insert(result.row) {
                return;
            }
            state.sent_count += 1;
            state.results.push(result);

            let every = self.config.checkpoint_every;
            (every > 0 && state.sent_count % every == 0).then(|| ctx.snapshot(&state))
        };

        if let Some(snapshot) = due {
            self.progress.send_modify(|p| p.resolved = snapshot.sent_count);
            self.checkpoint(ctx, snapshot).await;
        }
    }

    /// Saves are serialized and only ever move the checkpoint forward. A
    /// snapshot no newer than the stored one is dropped.
    async fn checkpoint(&self, ctx: &RunContext<'_, R::Connection>, snapshot: Snapshot) {
        let mut last = ctx.last_checkpoint.lock().await;
        if snapshot.sent_count <= *last {
            return;
        }
        match self.store.save(ctx.session_id, &snapshot).await {
            Ok(()) => *last = snapshot.sent_count,
            Err(e) => warn!(error = %e, "Failed to save checkpoint"),
        }
    }

    fn set_progress(&self, phase: RunPhase, resolved: usize, total: usize) {
        self.progress.send_replace(Progress {
            phase,
            resolved,
            total,
        });
    }
}

fn to_result(row: usize, email: &str, outcome: Result<(), SendError>) -> DeliveryResult {
    match outcome {
        Ok(()) => DeliveryResult::success(row, email),
        Err(e) => DeliveryResult::failed(
            row,
            email,
            e.kind(),
            e.to_string(),
            e.help_link().map(str::to_string),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::SizeLimits;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::mailer::test_utils::{FakeOutcome, FakeRelay};
    use crate::types::{FailureKind, RecipientRow};
    use base64::Engine;

    fn session() -> SessionId {
        "test-session".parse().unwrap()
    }

    fn email(i: usize) -> String {
        format!("user{}@example.com", i)
    }

    fn table(n: usize) -> RecipientTable {
        table_with(n, |_| String::new())
    }

    fn table_with(n: usize, pdf_path: impl Fn(usize) -> String) -> RecipientTable {
        let rows = (0..n)
            .map(|i| {
                RecipientRow::new([
                    ("Email", email(i)),
                    ("Name", format!("User {}", i)),
                    ("PDF_Path", pdf_path(i)),
                ])
            })
            .collect();
        RecipientTable::new(
            vec!["Email".into(), "Name".into(), "PDF_Path".into()],
            rows,
        )
    }

    fn job(table: RecipientTable) -> SendJob {
        SendJob {
            session_id: session(),
            table,
            template: Template::new("Hello {Name}", "<p>Dear {Name},</p>"),
            attachments: Vec::new(),
            from: "sender@example.com".to_string(),
        }
    }

    fn config(concurrency_limit: usize) -> SendConfig {
        SendConfig {
            concurrency_limit,
            ..SendConfig::default()
        }
        .without_delays()
    }

    fn scheduler(
        relay: &FakeRelay,
        store: &Arc<InMemoryCheckpointStore>,
        config: SendConfig,
    ) -> BatchScheduler<FakeRelay, InMemoryCheckpointStore> {
        BatchScheduler::new(Arc::new(relay.clone()), Arc::clone(store), config)
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    /// Records the `sent_count` of every save.
    #[derive(Default)]
    struct RecordingStore {
        inner: InMemoryCheckpointStore,
        saved_counts: Mutex<Vec<usize>>,
    }

    impl CheckpointStore for RecordingStore {
        async fn save(&self, session: &SessionId, snapshot: &Snapshot) -> anyhow::Result<()> {
            self.saved_counts.lock().unwrap().push(snapshot.sent_count);
            self.inner.save(session, snapshot).await
        }

        async fn load(&self, session: &SessionId) -> anyhow::Result<Option<Snapshot>> {
            self.inner.load(session).await
        }

        async fn clear(&self, session: &SessionId) -> anyhow::Result<()> {
            self.inner.clear(session).await
        }
    }

    #[tokio::test]
    async fn sequential_run_sends_everyone_over_one_connection() {
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());

        let outcome = scheduler(&relay, &store, config(1))
            .run(job(table(4)))
            .await
            .unwrap();

        assert_eq!(relay.delivered(), (0..4).map(email).collect::<Vec<_>>());
        assert_eq!(relay.opened(), 1);
        assert_eq!(relay.closed(), 1);
        assert_eq!(outcome.summary.sent_count, 4);
        assert_eq!(outcome.summary.total_count, 4);
        assert_eq!(
            outcome.summary.message,
            "Successfully sent 4 out of 4 emails"
        );
        assert!(!outcome.interrupted);
        assert!(!store.contains(&session()));
    }

    #[tokio::test]
    async fn oversized_attachment_fails_only_that_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.pdf");
        std::fs::write(&big, noise(5_000)).unwrap();
        let big_path = big.to_string_lossy().into_owned();

        let table = table_with(10, |i| if i == 1 { big_path.clone() } else { String::new() });
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let config = SendConfig {
            limits: SizeLimits {
                max_message_bytes: 1024 * 1024,
                max_attachment_bytes: 1_000,
            },
            compress_oversized: false,
            ..config(3)
        };

        let outcome = scheduler(&relay, &store, config)
            .run(job(table))
            .await
            .unwrap();

        assert_eq!(outcome.summary.sent_count, 9);
        assert_eq!(outcome.summary.total_count, 10);
        assert_eq!(outcome.results.len(), 10);
        assert!(!relay.attempted().contains(&email(1)));

        let errors = &outcome.summary.errors;
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].email, email(1));
        assert_eq!(errors[0].kind, FailureKind::AttachmentTooLarge);
        assert!(errors[0].error.contains("big.pdf"));
        assert!(errors[0].help_link.is_some());

        let csv = String::from_utf8(outcome.summary.report_csv().unwrap()).unwrap();
        assert_eq!(csv.lines().count(), 11);
    }

    #[tokio::test]
    async fn rows_without_usable_email_are_excluded() {
        let table = RecipientTable::new(
            vec!["Email".into(), "Name".into()],
            vec![
                RecipientRow::new([("Email", ""), ("Name", "Blank")]),
                RecipientRow::new([("Email", "a@example.com"), ("Name", "A")]),
                RecipientRow::new([("Email", "not-an-address"), ("Name", "Bad")]),
                RecipientRow::new([("Email", "b@example.com"), ("Name", "B")]),
            ],
        );
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());

        let outcome = scheduler(&relay, &store, config(1))
            .run(job(table))
            .await
            .unwrap();

        assert_eq!(outcome.summary.total_count, 2);
        assert_eq!(outcome.summary.sent_count, 2);
        assert_eq!(relay.attempted(), vec!["a@example.com", "b@example.com"]);
    }

    #[tokio::test]
    async fn unreachable_relay_aborts_before_any_send() {
        let relay = FakeRelay::unreachable();
        let store = Arc::new(InMemoryCheckpointStore::new());

        let err = scheduler(&relay, &store, config(3))
            .run(job(table(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Setup(_)));
        assert!(relay.attempted().is_empty());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn missing_email_column_is_rejected() {
        let table = RecipientTable::new(
            vec!["Name".into()],
            vec![RecipientRow::new([("Name", "Jane")])],
        );
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());

        let err = scheduler(&relay, &store, config(1))
            .run(job(table))
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::Validation(_)));
        assert_eq!(relay.opened(), 0);
    }

    #[tokio::test]
    async fn invalid_sender_is_rejected() {
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut job = job(table(2));
        job.from = "not a sender".to_string();

        let err = scheduler(&relay, &store, config(1)).run(job).await.unwrap_err();

        assert!(matches!(err, RunError::Validation(_)));
        assert_eq!(relay.opened(), 0);
    }

    #[tokio::test]
    async fn resume_skips_resolved_rows_and_uses_checkpointed_table() {
        let mut snapshot = Snapshot::new(session(), table(5));
        snapshot.sent_count = 2;
        snapshot.results = vec![
            DeliveryResult::success(0, email(0)),
            DeliveryResult::success(1, email(1)),
        ];
        let store = Arc::new(InMemoryCheckpointStore::new().with_snapshot(snapshot));
        let relay = FakeRelay::new();

        // The table passed in is ignored in favour of the checkpointed one.
        let outcome = scheduler(&relay, &store, config(1))
            .run(job(table(1)))
            .await
            .unwrap();

        assert_eq!(relay.attempted(), vec![email(2), email(3), email(4)]);
        assert_eq!(outcome.summary.sent_count, 5);
        assert_eq!(outcome.summary.total_count, 5);
        assert_eq!(outcome.results.len(), 5);
        assert!(!store.contains(&session()));
    }

    #[tokio::test]
    async fn parallel_mode_bounds_concurrency_and_connects_per_recipient() {
        let relay = FakeRelay::new().with_send_delay(Duration::from_millis(10));
        let store = Arc::new(InMemoryCheckpointStore::new());

        let outcome = scheduler(&relay, &store, config(3))
            .run(job(table(9)))
            .await
            .unwrap();

        assert_eq!(outcome.summary.sent_count, 9);
        assert!(relay.max_in_flight() <= 3);
        assert!(relay.max_in_flight() > 1);
        // One credential probe plus one connection per recipient.
        assert_eq!(relay.opened(), 10);
        assert_eq!(relay.closed(), 10);
    }

    #[tokio::test]
    async fn shared_connection_serializes_sends() {
        let relay = FakeRelay::new().with_send_delay(Duration::from_millis(5));
        let store = Arc::new(InMemoryCheckpointStore::new());
        let config = SendConfig {
            connection_policy: Some(ConnectionPolicy::PerRun),
            ..config(4)
        };

        let outcome = scheduler(&relay, &store, config)
            .run(job(table(8)))
            .await
            .unwrap();

        assert_eq!(outcome.summary.sent_count, 8);
        assert_eq!(relay.max_in_flight(), 1);
        assert_eq!(relay.opened(), 1);
        assert_eq!(relay.closed(), 1);
    }

    #[tokio::test]
    async fn rejections_are_recorded_and_the_run_continues() {
        let relay = FakeRelay::new()
            .with_outcome(
                &email(1),
                FakeOutcome::Reject(SendError::Transport("550 mailbox unavailable".into())),
            )
            .with_outcome(
                &email(3),
                FakeOutcome::Reject(SendError::SizeRejectedByServer(
                    "552 5.3.4 message size exceeds limit".into(),
                )),
            );
        let store = Arc::new(InMemoryCheckpointStore::new());

        let outcome = scheduler(&relay, &store, config(2))
            .run(job(table(5)))
            .await
            .unwrap();

        let summary = &outcome.summary;
        assert_eq!(summary.sent_count, 3);
        assert_eq!(summary.failed_count, 2);
        assert_eq!(summary.sent_count + summary.failed_count, summary.total_count);

        let transport = summary.errors.iter().find(|e| e.email == email(1)).unwrap();
        assert_eq!(transport.kind, FailureKind::TransportError);
        assert!(transport.help_link.is_none());

        let size = summary.errors.iter().find(|e| e.email == email(3)).unwrap();
        assert_eq!(size.kind, FailureKind::SizeRejectedByServer);
        assert!(size.help_link.is_some());
    }

    #[tokio::test]
    async fn timed_out_recipient_is_retried_once_then_failed() {
        let relay = FakeRelay::new().with_outcome(&email(1), FakeOutcome::Hang);
        let store = Arc::new(InMemoryCheckpointStore::new());
        let config = SendConfig {
            batch_timeout: Duration::from_millis(50),
            ..config(2)
        };

        let outcome = scheduler(&relay, &store, config)
            .run(job(table(3)))
            .await
            .unwrap();

        let attempts = relay.attempted().iter().filter(|e| **e == email(1)).count();
        assert_eq!(attempts, 2);
        assert_eq!(outcome.summary.sent_count, 2);
        assert_eq!(outcome.results.len(), 3);

        let failed = &outcome.summary.errors[0];
        assert_eq!(failed.email, email(1));
        assert_eq!(failed.kind, FailureKind::TransportError);
        assert!(failed.error.contains("timed out"));
    }

    #[tokio::test]
    async fn cancelled_run_keeps_checkpoint_for_resume() {
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let scheduler = scheduler(&relay, &store, config(1));
        scheduler.cancel_flag().cancel();

        let outcome = scheduler.run(job(table(3))).await.unwrap();

        assert!(outcome.interrupted);
        assert!(relay.attempted().is_empty());
        assert_eq!(outcome.summary.total_count, 3);
        assert!(store.contains(&session()));
    }

    #[tokio::test]
    async fn checkpoints_never_move_backwards() {
        let relay = FakeRelay::new().with_send_delay(Duration::from_millis(2));
        let store = Arc::new(RecordingStore::default());
        let config = SendConfig {
            checkpoint_every: 2,
            ..config(4)
        };

        let scheduler = BatchScheduler::new(Arc::new(relay.clone()), Arc::clone(&store), config);
        let outcome = scheduler.run(job(table(12))).await.unwrap();
        assert_eq!(outcome.summary.sent_count, 12);

        let counts = store.saved_counts.lock().unwrap().clone();
        assert_eq!(counts.first(), Some(&0));
        assert!(counts.windows(2).all(|w| w[0] < w[1]), "{:?}", counts);
        assert!(counts.contains(&12));
        assert!(store.inner.load(&session()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sequential_run_checkpoints_every_k_recipients() {
        let relay = FakeRelay::new();
        let store = Arc::new(RecordingStore::default());
        let config = SendConfig {
            checkpoint_every: 5,
            ..config(1)
        };

        let scheduler = BatchScheduler::new(Arc::new(relay.clone()), Arc::clone(&store), config);
        let outcome = scheduler.run(job(table(10))).await.unwrap();
        assert_eq!(outcome.summary.sent_count, 10);

        assert_eq!(*store.saved_counts.lock().unwrap(), vec![0, 5, 10]);
        assert!(store.inner.load(&session()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn global_attachment_reaches_every_recipient_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let invoice = dir.path().join("invoice.pdf");
        std::fs::write(&invoice, noise(300)).unwrap();
        let invoice_path = invoice.to_string_lossy().into_owned();

        let terms: Vec<u8> = vec![0xFF, 0xFE, 0x00, 0x01, 0x80, 0x7F, 0x10, 0x20, 0xC0];
        let encoded_terms = base64::engine::general_purpose::STANDARD.encode(&terms);

        let table = table_with(4, |i| if i == 2 { invoice_path.clone() } else { String::new() });
        let mut job = job(table);
        job.attachments = vec![Attachment::from_bytes("terms.bin", terms)];

        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let outcome = scheduler(&relay, &store, config(1)).run(job).await.unwrap();
        assert_eq!(outcome.summary.sent_count, 4);

        for i in 0..4 {
            let expected = if i == 2 {
                vec!["invoice.pdf", "terms.bin"]
            } else {
                vec!["terms.bin"]
            };
            assert_eq!(relay.attachment_names(&email(i)), expected, "recipient {}", i);
            let raw = relay.raw_message(&email(i)).unwrap();
            assert!(raw.contains(&encoded_terms), "recipient {}", i);
        }
    }

    #[tokio::test]
    async fn parallel_resume_retries_gaps_below_sent_count() {
        let mut snapshot = Snapshot::new(session(), table(5));
        snapshot.sent_count = 3;
        snapshot.results = vec![
            DeliveryResult::success(2, email(2)),
            DeliveryResult::success(0, email(0)),
            DeliveryResult::success(3, email(3)),
        ];
        let store = Arc::new(InMemoryCheckpointStore::new().with_snapshot(snapshot));
        let relay = FakeRelay::new();

        let outcome = scheduler(&relay, &store, config(3))
            .run(job(table(5)))
            .await
            .unwrap();

        let mut attempted = relay.attempted();
        attempted.sort();
        assert_eq!(attempted, vec![email(1), email(4)]);
        assert_eq!(outcome.summary.total_count, 5);
        assert_eq!(outcome.summary.sent_count, 5);
        assert_eq!(outcome.results.len(), 5);
    }

    #[tokio::test]
    async fn progress_ends_drained() {
        let relay = FakeRelay::new();
        let store = Arc::new(InMemoryCheckpointStore::new());
        let scheduler = scheduler(&relay, &store, config(2));
        let progress = scheduler.subscribe();

        scheduler.run(job(table(3))).await.unwrap();

        assert_eq!(
            *progress.borrow(),
            Progress {
                phase: RunPhase::Drained,
                resolved: 3,
                total: 3,
            }
        );
    }

    #[test]
    fn scheduling_mode_follows_concurrency_limit() {
        assert_eq!(SchedulingMode::from_config(&config(1)), SchedulingMode::Sequential);
        assert_eq!(SchedulingMode::from_config(&config(0)).group_size(), 1);
        assert_eq!(
            SchedulingMode::from_config(&config(4)),
            SchedulingMode::BoundedParallel(4)
        );
        assert_eq!(SchedulingMode::BoundedParallel(4).group_size(), 4);
    }

    #[tokio::test]
    async fn abort_discards_checkpoint() {
        let store = Arc::new(
            InMemoryCheckpointStore::new().with_snapshot(Snapshot::new(session(), table(2))),
        );
        let relay = FakeRelay::new();

        scheduler(&relay, &store, config(1))
            .abort(&session())
            .await
            .unwrap();

        assert!(!store.contains(&session()));
    }
}
