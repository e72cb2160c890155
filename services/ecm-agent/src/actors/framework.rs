//! Core actor framework types and traits.
//!
//! - `Actor` trait for defining actor behavior
//! - `Supervisor` for spawning actors and watching their tasks
//! - `ActorHandle` for sending messages to actors
//! - `BackoffPolicy` for reconnect loops

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// Behavior of a single-owner task.
///
/// An actor processes its mailbox one message at a time and owns its state
/// exclusively; other tasks reach it only through an [`ActorHandle`].
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called once before the first message.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    /// Actor's unique ID.
    pub actor_id: String,

    /// Shutdown signal receiver.
    pub shutdown: watch::Receiver<bool>,

    pub messages_processed: u64,

    pub last_message_at: Option<Instant>,

    /// Lifecycle state. `on_stop` sees `Failed` after a permanent error.
    pub state: ActorState,
}

impl ActorContext {
    /// Create a new actor context.
    pub fn new(actor_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            actor_id,
            shutdown,
            messages_processed: 0,
            last_message_at: None,
            state: ActorState::Starting,
        }
    }
}

/// Actor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Error that leaves the actor able to serve the next message.
    #[error("transient error: {0}")]
    Transient(String),

    /// Error after which the actor stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Actor mailbox is full.
    #[error("mailbox full")]
    MailboxFull,

    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// The actor dropped a request without replying.
    #[error("actor dropped the reply")]
    NoReply,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,

    /// Actor ID for logging.
    actor_id: String,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            actor_id: self.actor_id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor, waiting for mailbox space.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Try to send a message without blocking.
    pub fn try_send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ActorError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => ActorError::ActorStopped,
        })
    }

    /// Send a message carrying a reply channel and wait for the reply.
    pub async fn request<R, F>(&self, build: F) -> Result<R, ActorError>
    where
        F: FnOnce(oneshot::Sender<R>) -> M,
    {
        let (reply_to, reply) = oneshot::channel();
        self.send(build(reply_to)).await?;
        reply.await.map_err(|_| ActorError::NoReply)
    }

    /// Get the actor ID.
    pub fn actor_id(&self) -> &str {
        &self.actor_id
    }
}

/// Type-erased actor reference for supervision.
pub struct ActorRef {
    pub actor_id: String,

    /// Actor type name.
    pub actor_type: String,

    task_handle: tokio::task::JoinHandle<()>,

    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }

    /// Abort the actor task immediately.
    pub fn abort(&self) {
        self.task_handle.abort();
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = rand_jitter(delay * self.jitter);
        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Jitter in `[-range, range]` from a clock-seeded LCG.
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;
    let seed = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let random = (seed.wrapping_mul(6364136223846793005).wrapping_add(1)) as f64;
    let normalized = (random / u64::MAX as f64) * 2.0 - 1.0;
    normalized * range
}

// =============================================================================
// Supervisor
// =============================================================================

/// Spawns actors and watches their tasks.
///
/// Actors are not restarted: a child that exits while the supervisor still
/// considers it running is reported by [`Supervisor::check_children`] and
/// marked failed.
pub struct Supervisor {
    children: HashMap<String, SupervisedActor>,

    /// How long `stop_all` waits before aborting stragglers.
    stop_timeout: Duration,
}

struct SupervisedActor {
    actor_ref: ActorRef,
    state: SupervisedState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisedState {
    Running,
    Failed,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl Supervisor {
    /// Create a new supervisor.
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            children: HashMap::new(),
            stop_timeout,
        }
    }

    /// Spawn and supervise an actor.
    pub fn spawn<A>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
    {
        let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
        let (tx, rx) = mpsc::channel(mailbox_size);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let actor_type = actor.name().to_string();

        let task_handle = tokio::spawn(run_actor_loop(actor, rx, shutdown_rx, actor_id.clone()));

        self.children.insert(
            actor_id.clone(),
            SupervisedActor {
                actor_ref: ActorRef {
                    actor_id: actor_id.clone(),
                    actor_type: actor_type.clone(),
                    task_handle,
                    shutdown_tx,
                },
                state: SupervisedState::Running,
            },
        );

        info!(actor_id = %actor_id, actor_type = %actor_type, "Spawned actor");

        ActorHandle { tx, actor_id }
    }

    /// Stop all supervised actors.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");

        for child in self.children.values() {
            child.actor_ref.stop();
        }

        let deadline = Instant::now() + self.stop_timeout;
        while Instant::now() < deadline {
            if self.children.values().all(|c| !c.actor_ref.is_running()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for (actor_id, child) in &self.children {
            if child.actor_ref.is_running() {
                warn!(actor_id = %actor_id, "Force aborting actor");
                child.actor_ref.abort();
            }
        }

        self.children.clear();
    }

    /// Mark children whose task exited on its own as failed.
    ///
    /// Returns the IDs newly found dead.
    pub fn check_children(&mut self) -> Vec<String> {
        let mut failed = Vec::new();

        for (actor_id, child) in &mut self.children {
            if child.state == SupervisedState::Running && !child.actor_ref.is_running() {
                error!(
                    actor_id = %actor_id,
                    actor_type = %child.actor_ref.actor_type,
                    "Actor exited unexpectedly"
                );
                child.state = SupervisedState::Failed;
                failed.push(actor_id.clone());
            }
        }

        failed
    }

    /// Get count of running actors.
    pub fn running_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.actor_ref.is_running())
            .count()
    }

    /// Get count of actors found dead by `check_children`.
    pub fn failed_count(&self) -> usize {
        self.children
            .values()
            .filter(|c| c.state == SupervisedState::Failed)
            .count()
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone(), shutdown.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    ctx.state = ActorState::Running;
    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;
                ctx.last_message_at = Some(Instant::now());

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(ActorError::Permanent(reason)) => {
                        error!(actor_id = %actor_id, reason = %reason, "Actor failed");
                        ctx.state = ActorState::Failed;
                        break;
                    }
                    Err(e) => {
                        warn!(actor_id = %actor_id, error = %e, "Actor error");
                    }
                }
            }
        }
    }

    if ctx.state != ActorState::Failed {
        ctx.state = ActorState::Stopping;
    }
    actor.on_stop(&mut ctx).await;
    ctx.state = ActorState::Stopped;

    info!(
        actor_id = %actor_id,
        messages_processed = ctx.messages_processed,
        "Actor stopped"
    );
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
