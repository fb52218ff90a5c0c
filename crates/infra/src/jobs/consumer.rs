//! Queue consumer: bounded prefetch, dispatch, and restart after channel loss.
//!
//! ## Lifecycle
//!
//! - `start()` ensures the search index, opens the channel and spawns the
//!   consume loop. Each delivery is handled on its own task while holding a
//!   prefetch permit, so at most `prefetch` deliveries are unsettled.
//! - When the broker reports a close, one restart is scheduled after
//!   `restart_delay`. Further close reports while it is pending are ignored,
//!   as are reports for any channel other than the one being consumed.
//!   A failed restart schedules another one, except when the connect budget
//!   is exhausted: that is reported through [`Consumer::fatal_error`].
//! - `shutdown()` stops pulling deliveries and waits for in-flight handlers.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use newsflow_core::{ATTEMPTS_HEADER, Job};
use newsflow_events::{
    Acknowledger, BrokerConnection, BrokerError, Channel, ConnectionObserver, EventOrigin,
};

use super::handler::{JobHandler, JobOutcome};
use super::retry::{RetryOutcome, RetryScheduler};
use crate::search::{IndexEnsurer, SearchIndexError};

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_millis(500);

const RESTART_IDLE: u8 = 0;
const RESTART_SCHEDULED: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Maximum unsettled deliveries at any time.
    pub prefetch: usize,
    pub restart_delay: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: 1,
            restart_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("search index setup failed: {0}")]
    Index(#[from] SearchIndexError),

    #[error("consumer is shut down")]
    ShutDown,
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub indexed: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub returned: u64,
    pub restarts: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    indexed: AtomicU64,
    skipped: AtomicU64,
    requeued: AtomicU64,
    discarded: AtomicU64,
    returned: AtomicU64,
    restarts: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            indexed: self.indexed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

struct ConsumerInner {
    connection: BrokerConnection,
    handler: JobHandler,
    retry: RetryScheduler,
    ensurer: Option<IndexEnsurer>,
    settings: ConsumerSettings,
    permits: Arc<Semaphore>,
    restart: AtomicU8,
    /// Generation of the channel the consume loop runs on; 0 before start.
    live_generation: AtomicU64,
    shutdown: watch::Sender<bool>,
    fatal: watch::Sender<Option<BrokerError>>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    observer_task: Mutex<Option<JoinHandle<()>>>,
    stats: StatCounters,
}

/// Cloneable handle to one queue consumer.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// `ensurer`, when given, runs on every (re)start before consuming.
    pub fn new(
        connection: BrokerConnection,
        handler: JobHandler,
        retry: RetryScheduler,
        ensurer: Option<IndexEnsurer>,
        settings: ConsumerSettings,
    ) -> Self {
        let prefetch = settings.prefetch.max(1);
        let (shutdown, _) = watch::channel(false);
        let (fatal, _) = watch::channel(None);
        Self {
            inner: Arc::new(ConsumerInner {
                connection,
                handler,
                retry,
                ensurer,
                settings: ConsumerSettings {
                    prefetch,
                    ..settings
                },
                permits: Arc::new(Semaphore::new(prefetch)),
                restart: AtomicU8::new(RESTART_IDLE),
                live_generation: AtomicU64::new(0),
                shutdown,
                fatal,
                loop_task: Mutex::new(None),
                observer_task: Mutex::new(None),
                stats: StatCounters::default(),
            }),
        }
    }

    /// Set up the channel and begin consuming.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        if *self.inner.shutdown.borrow() {
            return Err(ConsumerError::ShutDown);
        }

        {
            let mut observer = lock(&self.inner.observer_task);
            if observer.is_none() {
                let watcher = RestartOnClose(Arc::downgrade(&self.inner));
                *observer = Some(self.inner.connection.observe(Arc::new(watcher)));
            }
        }

        self.inner.setup().await.map(|_| ())
    }

    /// Stop consuming and wait for in-flight deliveries to be settled.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let observer = lock(&self.inner.observer_task).take();
        if let Some(observer) = observer {
            observer.abort();
        }

        let consume_loop = lock(&self.inner.loop_task).take();
        if let Some(consume_loop) = consume_loop {
            let _ = consume_loop.await;
        }

        let prefetch = self.inner.settings.prefetch as u32;
        match self.inner.permits.acquire_many(prefetch).await {
            Ok(permits) => permits.forget(),
            Err(_) => debug!("prefetch permits already closed"),
        }
        self.inner.permits.close();
        info!("consumer stopped");
    }

    /// Resolves once a restart has failed for good (broker unreachable).
    pub async fn fatal_error(&self) -> BrokerError {
        let mut rx = self.inner.fatal.subscribe();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            if rx.changed().await.is_err() {
                // The consumer is gone; nothing will ever report.
                std::future::pending::<()>().await;
            }
        }
    }

    pub fn restart_pending(&self) -> bool {
        self.inner.restart.load(Ordering::SeqCst) == RESTART_SCHEDULED
    }

    pub fn stats(&self) -> ConsumerStats {
        self.inner.stats.snapshot()
    }
}

impl core::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.inner.connection.queue())
            .field("prefetch", &self.inner.settings.prefetch)
            .field("restart_pending", &self.restart_pending())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct RestartOnClose(Weak<ConsumerInner>);

impl ConnectionObserver for RestartOnClose {
    fn on_closed(&self, origin: EventOrigin, generation: u64, reason: &str) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        let live = inner.live_generation.load(Ordering::SeqCst);
        if generation != live {
            debug!(%origin, generation, live, reason, "ignoring close of a channel not being consumed");
            return;
        }
        warn!(%origin, generation, reason, "broker closed the consumer channel");
        inner.schedule_restart();
    }

    fn on_error(&self, origin: EventOrigin, message: &str) {
        warn!(%origin, message, "broker reported an error");
    }
}

impl ConsumerInner {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Returns `false` when the loop already runs on the live channel and
    /// was left alone.
    async fn setup(self: &Arc<Self>) -> Result<bool, ConsumerError> {
        if let Some(ensurer) = &self.ensurer {
            ensurer.ensure_index().await?;
        }
        let (generation, channel) = self.connection.connect_session().await?;

        {
            let mut loop_task = lock(&self.loop_task);
            let running = loop_task.as_ref().is_some_and(|task| !task.is_finished());
            if running && self.live_generation.load(Ordering::SeqCst) == generation {
                debug!(generation, "consume loop already on the live channel");
                return Ok(false);
            }

            if let Some(previous) = loop_task.take() {
                previous.abort();
            }
            self.live_generation.store(generation, Ordering::SeqCst);
            *loop_task = Some(tokio::spawn(consume(
                self.clone(),
                channel,
                self.shutdown.subscribe(),
            )));
        }

        info!(
            queue = self.connection.queue(),
            prefetch = self.settings.prefetch,
            generation,
            "consumer started"
        );
        Ok(true)
    }

    /// Idle → RestartScheduled; a second request while scheduled is a no-op.
    fn schedule_restart(self: &Arc<Self>) {
        if self.is_shutting_down() {
            debug!("shutting down, restart not scheduled");
            return;
        }
        if self
            .restart
            .compare_exchange(RESTART_IDLE, RESTART_SCHEDULED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("restart already pending");
            return;
        }

        let delay = self.settings.restart_delay;
        info!(delay_ms = delay.as_millis() as u64, "consumer restart scheduled");

        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if inner.is_shutting_down() {
                inner.restart.store(RESTART_IDLE, Ordering::SeqCst);
                return;
            }
            let result = inner.setup().await;
            inner.restart.store(RESTART_IDLE, Ordering::SeqCst);

            match result {
                Ok(true) => {
                    StatCounters::bump(&inner.stats.restarts);
                    info!("consumer restarted");
                }
                Ok(false) => info!("consumer still healthy, restart skipped"),
                Err(ConsumerError::Broker(err)) if err.is_exhausted() => {
                    error!(error = %err, "broker unreachable, consumer cannot restart");
                    inner.fatal.send_replace(Some(err));
                }
                Err(err) => {
                    error!(error = %err, "consumer restart failed");
                    inner.schedule_restart();
                }
            }
        });
    }
}

async fn consume(
    inner: Arc<ConsumerInner>,
    channel: Arc<dyn Channel>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = inner.connection.queue().to_string();

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = channel.next_delivery(&queue) => next,
        };

        match next {
            Ok(Some(delivery)) => {
                let ack = Acknowledger::new(channel.clone(), delivery).with_permit(permit);
                tokio::spawn(process(inner.clone(), ack));
            }
            Ok(None) => {}
            Err(err) if err.is_closed() || !channel.is_open() => {
                warn!(error = %err, "channel closed, consume loop stopping");
                break;
            }
            Err(err) => {
                error!(error = %err, "failed to receive delivery");
                tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
            }
        }
    }

    debug!("consume loop exited");
}

async fn process(inner: Arc<ConsumerInner>, ack: Acknowledger) {
    let decoded = {
        let delivery = ack.delivery();
        Job::decode(delivery.body(), delivery.header(ATTEMPTS_HEADER))
    };

    let job = match decoded {
        Ok(job) => job,
        Err(err) => {
            error!(
                payload = %ack.delivery().body_lossy(),
                delivery_tag = %ack.delivery().tag(),
                error = %err,
                "discarding malformed job"
            );
            StatCounters::bump(&inner.stats.discarded);
            if let Err(err) = ack.reject_discard("malformed payload").await {
                warn!(error = %err, "reject failed, broker will redeliver");
            }
            return;
        }
    };

    let span = info_span!("job", record_id = %job.record_id(), attempts = job.attempts());
    async move {
        match inner.handler.handle(&job).await {
            Ok(outcome) => {
                match outcome {
                    JobOutcome::Indexed => StatCounters::bump(&inner.stats.indexed),
                    JobOutcome::RecordMissing => StatCounters::bump(&inner.stats.skipped),
                }
                if let Err(err) = ack.ack().await {
                    warn!(error = %err, "ack failed, broker will redeliver");
                }
            }
            Err(cause) => match inner.retry.schedule_retry(&job, ack, &cause).await {
                Ok(RetryOutcome::Requeued { .. }) => StatCounters::bump(&inner.stats.requeued),
                Ok(RetryOutcome::Discarded) => StatCounters::bump(&inner.stats.discarded),
                Ok(RetryOutcome::ReturnedToBroker) => StatCounters::bump(&inner.stats.returned),
                Err(err) => warn!(error = %err, "settling failed job failed, broker will redeliver"),
            },
        }
    }
    .instrument(span)
    .await
}
