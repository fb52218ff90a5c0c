//! Shared broker connection with single-flight connect.
//!
//! At most one connect attempt is in flight at any time. Callers arriving
//! while an attempt runs wait for that attempt's outcome instead of opening
//! a second connection. Once connected, the channel is cached until the
//! transport reports it closed, at which point the cache is cleared and the
//! next [`BrokerConnection::connect`] reconnects lazily.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::event::{ConnectionEvent, ConnectionObserver, EventSink};
use crate::retry::RetryPolicy;
use crate::transport::{Channel, Transport};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Queue declared on every freshly opened channel.
    pub queue: String,
    /// Connect attempts and the linear delay between them.
    pub retry: RetryPolicy,
}

/// A live channel and the generation that opened it.
pub type Session = (u64, Arc<dyn Channel>);

type ConnectOutcome = BrokerResult<Session>;

enum ConnectionState {
    Disconnected,
    Connecting(watch::Receiver<Option<ConnectOutcome>>),
    Connected {
        generation: u64,
        channel: Arc<dyn Channel>,
    },
}

enum Role {
    Ready(Session),
    Follower(watch::Receiver<Option<ConnectOutcome>>),
    Leader(watch::Sender<Option<ConnectOutcome>>),
}

struct Shared {
    transport: Arc<dyn Transport>,
    settings: ConnectionSettings,
    state: Mutex<ConnectionState>,
    generation: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget the cached channel if it belongs to `generation`.
    fn invalidate(&self, generation: u64) {
        let mut state = self.lock_state();
        if matches!(&*state, ConnectionState::Connected { generation: current, .. } if *current == generation)
        {
            *state = ConnectionState::Disconnected;
            debug!(generation, "broker channel invalidated");
        }
    }
}

/// Cloneable handle to the process-wide broker session.
#[derive(Clone)]
pub struct BrokerConnection {
    shared: Arc<Shared>,
}

impl BrokerConnection {
    pub fn new(transport: Arc<dyn Transport>, settings: ConnectionSettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                state: Mutex::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                events,
            }),
        }
    }

    pub fn queue(&self) -> &str {
        &self.shared.settings.queue
    }

    /// Return the live channel, connecting first if needed.
    ///
    /// Concurrent callers share one connect attempt. On exhaustion every
    /// waiter receives the same [`BrokerError::ConnectionExhausted`].
    pub async fn connect(&self) -> BrokerResult<Arc<dyn Channel>> {
        self.connect_session().await.map(|(_, channel)| channel)
    }

    /// Like [`connect`](Self::connect), also returning the channel's
    /// generation so callers can match it against
    /// [`ConnectionObserver::on_closed`] reports.
    pub async fn connect_session(&self) -> BrokerResult<Session> {
        let role = {
            let mut state = self.shared.lock_state();
            let existing = match &*state {
                ConnectionState::Connected {
                    generation,
                    channel,
                } if channel.is_open() => Some(Role::Ready((*generation, channel.clone()))),
                ConnectionState::Connecting(rx) => Some(Role::Follower(rx.clone())),
                _ => None,
            };
            match existing {
                Some(role) => role,
                None => {
                    let (tx, rx) = watch::channel(None);
                    *state = ConnectionState::Connecting(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Ready(session) => Ok(session),
            Role::Follower(rx) => self.await_attempt(rx).await,
            Role::Leader(tx) => self.lead_attempt(tx).await,
        }
    }

    /// The cached channel, without connecting.
    pub fn channel(&self) -> BrokerResult<Arc<dyn Channel>> {
        match &*self.shared.lock_state() {
            ConnectionState::Connected { channel, .. } => Ok(channel.clone()),
            _ => Err(BrokerError::ChannelUnavailable),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            &*self.shared.lock_state(),
            ConnectionState::Connected { channel, .. } if channel.is_open()
        )
    }

    /// Close the current channel (if any) and forget it.
    pub async fn close(&self) -> BrokerResult<()> {
        let channel = {
            let mut state = self.shared.lock_state();
            match std::mem::replace(&mut *state, ConnectionState::Disconnected) {
                ConnectionState::Connected { channel, .. } => Some(channel),
                connecting @ ConnectionState::Connecting(_) => {
                    // Let the in-flight attempt finish and publish its result.
                    *state = connecting;
                    None
                }
                ConnectionState::Disconnected => None,
            }
        };

        match channel {
            Some(channel) => {
                info!("closing broker channel");
                channel.close().await
            }
            None => Ok(()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Forward lifecycle events to `observer` until the connection is dropped.
    pub fn observe(&self, observer: Arc<dyn ConnectionObserver>) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ConnectionEvent::Closed {
                        origin,
                        generation,
                        reason,
                    }) => observer.on_closed(origin, generation, &reason),
                    Ok(ConnectionEvent::Error {
                        origin, message, ..
                    }) => observer.on_error(origin, &message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "connection observer lagged behind events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn await_attempt(
        &self,
        mut rx: watch::Receiver<Option<ConnectOutcome>>,
    ) -> BrokerResult<Session> {
        debug!("waiting on in-flight broker connect");
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| BrokerError::ConnectAborted)?;
        match &*outcome {
            Some(result) => result.clone(),
            None => Err(BrokerError::ConnectAborted),
        }
    }

    async fn lead_attempt(
        &self,
        tx: watch::Sender<Option<ConnectOutcome>>,
    ) -> BrokerResult<Session> {
        let mut guard = AttemptGuard {
            shared: &self.shared,
            armed: true,
        };

        let established = self.establish().await;

        {
            let mut state = self.shared.lock_state();
            *state = match &established {
                Ok((generation, channel)) => ConnectionState::Connected {
                    generation: *generation,
                    channel: channel.clone(),
                },
                Err(_) => ConnectionState::Disconnected,
            };
        }
        guard.armed = false;

        tx.send_replace(Some(established.clone()));
        established
    }

    #[instrument(skip(self), fields(queue = %self.shared.settings.queue))]
    async fn establish(&self) -> BrokerResult<Session> {
        let retry = self.shared.settings.retry;
        let mut last_error = String::from("no connect attempt was made");

        for attempt in 1..=retry.max_attempts {
            let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
            match self.open_channel(generation).await {
                Ok(channel) => {
                    info!(attempt, generation, "broker connected");
                    return Ok((generation, channel));
                }
                Err(err) => {
                    last_error = err.to_string();
                    if retry.should_retry(attempt) {
                        let delay = retry.delay_for_attempt(attempt);
                        warn!(
                            attempt,
                            max_attempts = retry.max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "broker connect failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        error!(attempt, error = %err, "broker connect failed, giving up");
                    }
                }
            }
        }

        Err(BrokerError::ConnectionExhausted {
            attempts: retry.max_attempts,
            last_error,
        })
    }

    async fn open_channel(&self, generation: u64) -> BrokerResult<Arc<dyn Channel>> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let sink = EventSink::new(
            generation,
            self.shared.events.clone(),
            Arc::new(move |closed_generation| {
                if let Some(shared) = weak.upgrade() {
                    shared.invalidate(closed_generation);
                }
            }),
        );

        let channel = self.shared.transport.open(sink.clone()).await?;
        if let Err(err) = channel.declare_queue(&self.shared.settings.queue).await {
            // The sink is not live yet, so this close reaches no observer.
            let _ = channel.close().await;
            return Err(err);
        }
        sink.go_live();
        Ok(channel)
    }
}

impl core::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("queue", &self.shared.settings.queue)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Resets a `Connecting` slot if the leading attempt is cancelled mid-flight.
///
/// Dropping the watch sender alongside it wakes followers with
/// [`BrokerError::ConnectAborted`].
struct AttemptGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock_state();
            if matches!(&*state, ConnectionState::Connecting(_)) {
                *state = ConnectionState::Disconnected;
            }
        }
    }
}
