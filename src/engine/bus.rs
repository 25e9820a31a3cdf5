// In-process message bus

//! # Bus
//!
//! The bus is the only way messages move inside a manager. It offers two
//! shapes of communication:
//!
//! - **Request/response**: [`Bus::call`] assigns a fresh correlation ID,
//!   dispatches the message and waits for the correlated reply (or a deadline).
//! - **Publish/subscribe**: [`Bus::publish`] fans a [`Publication`] out to every
//!   [`Subscription`] whose topic glob matches.
//!
//! ## Ordering
//!
//! Messages for a synchronized handler are queued on a per-handler **lane**: an
//! unbounded channel drained by one task, so the handler sees submissions in
//! exactly the order they were made and never overlaps with itself. Everything
//! else is spawned as its own task. Publications are FIFO per publisher because
//! they share one broadcast channel.
//!
//! ## Ownership
//!
//! The bus does not own the processor. The processor binds itself as a
//! [`Dispatcher`] through a `Weak` reference, which keeps the
//! processor → bus → processor cycle from leaking.
//!
//! ## Rust Learning Notes:
//!
//! ### Oneshot Channels for Replies
//! Every request carries a `oneshot::Sender`. The caller awaits the matching
//! receiver under `tokio::time::timeout`; when the deadline fires the receiver
//! is dropped but the job itself keeps running to completion.
//!
//! ### TaskTracker
//! `tokio_util::task::TaskTracker` remembers every spawned job so shutdown can
//! wait for in-flight work without keeping a `Vec<JoinHandle>` around.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::result::{self, ResultMap};
use crate::models::{Event, Message};
use crate::utils::glob_match;
use crate::{EdmpError, Result};

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How an admitted message should be scheduled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Queue on the FIFO lane of the named handler
    Serialized(String),
    /// Run as an independent task
    Concurrent,
}

/// The receiving end of the bus, implemented by the message processor
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Cheap synchronous check run before a message is queued
    fn admit(&self, message: &Message) -> Result<Admission>;

    /// Execute the message and produce its reply
    async fn dispatch(&self, message: Message) -> Result<ResultMap>;
}

/// What travels on a topic
#[derive(Debug, Clone)]
pub enum Payload {
    Event(Event),
    Result { message: Arc<Message>, result: ResultMap },
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct Publication {
    pub topic: String,
    pub payload: Payload,
    /// Monotonic per bus; lets subscribers detect gaps after lagging
    pub sequence: u64,
}

impl Publication {
    pub fn event(&self) -> Option<&Event> {
        match &self.payload {
            Payload::Event(event) => Some(event),
            _ => None,
        }
    }
}

/// A topic-filtered view of the bus
pub struct Subscription {
    pattern: String,
    rx: broadcast::Receiver<Arc<Publication>>,
    shutdown: CancellationToken,
}

impl Subscription {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next publication whose topic matches; `cancelled` once the bus closes
    pub async fn recv(&mut self) -> Result<Arc<Publication>> {
        loop {
            let received = tokio::select! {
                received = self.rx.recv() => received,
                _ = self.shutdown.cancelled() => {
                    return Err(EdmpError::Cancelled("bus closed".to_string()));
                }
            };

            match received {
                Ok(publication) if glob_match(&self.pattern, &publication.topic) => return Ok(publication),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(pattern = %self.pattern, skipped, "subscriber lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EdmpError::Cancelled("bus closed".to_string()));
                }
            }
        }
    }

    /// Next already-queued matching publication, without waiting
    pub fn try_recv(&mut self) -> Option<Arc<Publication>> {
        loop {
            match self.rx.try_recv() {
                Ok(publication) if glob_match(&self.pattern, &publication.topic) => return Some(publication),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Turn the subscription into a `Stream` of matching publications
    pub fn into_stream(self) -> impl Stream<Item = Arc<Publication>> {
        let pattern = self.pattern;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(publication) if glob_match(&pattern, &publication.topic) => Some(publication),
            _ => None,
        })
    }
}

type Reply = oneshot::Sender<Result<ResultMap>>;

struct BusInner {
    sender: broadcast::Sender<Arc<Publication>>,
    lanes: DashMap<String, mpsc::UnboundedSender<(Message, Reply)>>,
    dispatcher: OnceLock<Weak<dyn Dispatcher>>,
    sequence: AtomicU64,
    closed: AtomicBool,
    default_timeout: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl BusInner {
    fn dispatcher(&self) -> Result<Arc<dyn Dispatcher>> {
        self.dispatcher
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EdmpError::Cancelled("no dispatcher bound to the bus".to_string()))
    }

    async fn run(&self, message: Message) -> Result<ResultMap> {
        let dispatcher = self.dispatcher()?;
        dispatcher.dispatch(message).await
    }
}

/// Cloneable handle to one manager's bus
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TIMEOUT)
    }
}

impl Bus {
    pub fn new(capacity: usize, default_timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                sender,
                lanes: DashMap::new(),
                dispatcher: OnceLock::new(),
                sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                default_timeout,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Attach the receiving side; a bus accepts exactly one dispatcher
    pub fn bind(&self, dispatcher: Weak<dyn Dispatcher>) -> Result<()> {
        self.inner
            .dispatcher
            .set(dispatcher)
            .map_err(|_| EdmpError::Internal("bus already has a dispatcher".to_string()))
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled when the bus closes
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(EdmpError::Cancelled("bus is shutting down".to_string()))
        } else {
            Ok(())
        }
    }

    /// Send a message and wait for its correlated reply
    ///
    /// Any failure of the workflow comes back as `Err`. The deadline only
    /// drops the reply; the job keeps running.
    pub async fn call(&self, message: Message, timeout: Option<Duration>) -> Result<ResultMap> {
        let deadline = timeout.unwrap_or(self.inner.default_timeout);
        let (correlation_id, reply) = self.enqueue(message)?;

        match tokio::time::timeout(deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EdmpError::Cancelled(format!(
                "reply for {} was dropped",
                correlation_id
            ))),
            Err(_) => {
                debug!(correlation_id = %correlation_id, ?deadline, "request timed out");
                Err(EdmpError::Timeout(deadline))
            }
        }
    }

    /// Like [`Bus::call`] with no deadline; resolves when the job itself finishes
    pub async fn call_to_completion(&self, message: Message) -> Result<ResultMap> {
        let (correlation_id, reply) = self.enqueue(message)?;
        match reply.await {
            Ok(result) => result,
            Err(_) => Err(EdmpError::Cancelled(format!(
                "reply for {} was dropped",
                correlation_id
            ))),
        }
    }

    /// Like [`Bus::call`], but semantic failures come back as `{error}` results
    ///
    /// Only transport failures (`timeout`, `cancelled`, `unknown_handler`) stay errors.
    pub async fn send(&self, message: Message, timeout: Option<Duration>) -> Result<ResultMap> {
        match self.call(message, timeout).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => Ok(result::error_result(&e)),
        }
    }

    /// Fire-and-forget submission; returns the assigned correlation ID
    pub fn submit(&self, message: Message) -> Result<Uuid> {
        let (correlation_id, _reply) = self.enqueue(message)?;
        Ok(correlation_id)
    }

    fn enqueue(&self, mut message: Message) -> Result<(Uuid, oneshot::Receiver<Result<ResultMap>>)> {
        self.ensure_open()?;
        message.id = Uuid::new_v4();
        let correlation_id = message.id;

        let admission = self.inner.dispatcher()?.admit(&message)?;
        let (tx, rx) = oneshot::channel();

        match admission {
            Admission::Serialized(handler) => {
                self.lane(&handler)
                    .send((message, tx))
                    .map_err(|_| EdmpError::Cancelled(format!("lane '{}' is closed", handler)))?;
            }
            Admission::Concurrent => {
                let inner = self.inner.clone();
                self.inner.tracker.spawn(async move {
                    let result = inner.run(message).await;
                    let _ = tx.send(result);
                });
            }
        }

        Ok((correlation_id, rx))
    }

    /// The FIFO lane of `handler`, created on first use
    fn lane(&self, handler: &str) -> mpsc::UnboundedSender<(Message, Reply)> {
        if let Some(lane) = self.inner.lanes.get(handler) {
            return lane.clone();
        }

        self.inner
            .lanes
            .entry(handler.to_string())
            .or_insert_with(|| {
                let (tx, mut rx) = mpsc::unbounded_channel::<(Message, Reply)>();
                let weak = Arc::downgrade(&self.inner);
                let name = handler.to_string();

                self.inner.tracker.spawn(async move {
                    while let Some((message, reply)) = rx.recv().await {
                        let Some(inner) = weak.upgrade() else {
                            let _ = reply.send(Err(EdmpError::Cancelled("bus dropped".to_string())));
                            break;
                        };
                        let result = inner.run(message).await;
                        let _ = reply.send(result);
                    }
                    debug!(handler = %name, "lane closed");
                });
                tx
            })
            .clone()
    }

    /// Publish a payload on `topic`; returns the publication's sequence number
    pub fn publish(&self, topic: impl Into<String>, payload: Payload) -> u64 {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst);
        let publication = Publication {
            topic: topic.into(),
            payload,
            sequence,
        };
        // No subscribers is not an error
        let _ = self.inner.sender.send(Arc::new(publication));
        sequence
    }

    pub fn publish_json(&self, topic: impl Into<String>, value: Value) -> u64 {
        self.publish(topic, Payload::Json(value))
    }

    /// Subscribe to every topic matching `pattern` (`*` and `?` globs)
    pub fn subscribe(&self, pattern: impl Into<String>) -> Subscription {
        Subscription {
            pattern: pattern.into(),
            rx: self.inner.sender.subscribe(),
            shutdown: self.inner.shutdown.clone(),
        }
    }

    /// Spawn a tracked task that shutdown will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Stop accepting new messages and wake every subscriber
    ///
    /// Queued lane jobs still run; use [`Bus::drain`] to wait for them.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.lanes.clear();
        self.inner.tracker.close();
        debug!("bus closed");
    }

    /// Wait for in-flight jobs; returns false if `timeout` elapsed first
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.inner.tracker.close();
        tokio::time::timeout(timeout, self.inner.tracker.wait()).await.is_ok()
    }

    /// Status document used by the admin workflow
    pub fn status(&self) -> Value {
        json!({
            "closed": self.is_closed(),
            "lanes": self.inner.lanes.len(),
            "in_flight": self.inner.tracker.len(),
            "subscribers": self.inner.sender.receiver_count(),
            "published": self.inner.sequence.load(Ordering::SeqCst),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowKind;
    use std::sync::Mutex;

    /// Echoes kwargs back after an optional `sleep_ms`, recording the order it saw
    struct Recorder {
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        fn admit(&self, message: &Message) -> Result<Admission> {
            match message.handler() {
                Some("missing") => Err(EdmpError::UnknownHandler("missing".to_string())),
                Some(handler) if message.routing.synchronize && message.workflow() != WorkflowKind::Manage => {
                    Ok(Admission::Serialized(handler.to_string()))
                }
                _ => Ok(Admission::Concurrent),
            }
        }

        async fn dispatch(&self, message: Message) -> Result<ResultMap> {
            let sleep_ms = message.kwargs.get("sleep_ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            if let Some(n) = message.kwargs.get("n").and_then(Value::as_i64) {
                self.seen.lock().unwrap().push(n);
            }
            if message.kwargs.contains_key("fail") {
                return Err(EdmpError::Handler("asked to fail".to_string()));
            }
            Ok(message.handler_kwargs())
        }
    }

    fn bound_bus() -> (Bus, Arc<Recorder>) {
        let bus = Bus::new(64, Duration::from_secs(5));
        let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
        let weak: Weak<dyn Dispatcher> = Arc::downgrade(&recorder) as Weak<dyn Dispatcher>;
        bus.bind(weak).unwrap();
        (bus, recorder)
    }

    #[tokio::test]
    async fn test_call_returns_correlated_reply() {
        let (bus, _recorder) = bound_bus();
        let reply = bus
            .call(Message::new("echo").with_kwarg("speed", 42), None)
            .await
            .unwrap();
        assert_eq!(reply["speed"], json!(42));
    }

    #[tokio::test]
    async fn test_synchronized_handler_is_fifo() {
        let (bus, recorder) = bound_bus();

        let mut pending = Vec::new();
        for n in 0..20i64 {
            // Earlier submissions sleep longer; a lane must still keep them in order
            let message = Message::new("ordered")
                .with_kwarg("n", n)
                .with_kwarg("sleep_ms", (20 - n) as u64);
            pending.push(bus.enqueue(message).unwrap().1);
        }
        for reply in pending {
            reply.await.unwrap().unwrap();
        }

        assert_eq!(*recorder.seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_timeout_does_not_cancel_the_job() {
        let (bus, recorder) = bound_bus();
        let message = Message::new("slow").with_kwarg("sleep_ms", 200u64).with_kwarg("n", 7);

        let err = bus.call(message, Some(Duration::from_millis(20))).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_send_folds_semantic_errors() {
        let (bus, _recorder) = bound_bus();

        let reply = bus.send(Message::new("echo").with_kwarg("fail", true), None).await.unwrap();
        assert!(reply["error"].as_str().unwrap().starts_with("handler_error"));

        let err = bus.send(Message::new("missing"), None).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_handler");
    }

    #[tokio::test]
    async fn test_publish_subscribe_filters_topics() {
        let (bus, _recorder) = bound_bus();
        let mut vehicle = bus.subscribe("event/vehicle");
        let mut everything = bus.subscribe("*");

        bus.publish_json("event/system", json!({"a": 1}));
        bus.publish_json("event/vehicle", json!({"b": 2}));

        let publication = vehicle.recv().await.unwrap();
        assert_eq!(publication.topic, "event/vehicle");
        assert!(vehicle.try_recv().is_none());

        assert_eq!(everything.recv().await.unwrap().topic, "event/system");
        assert_eq!(everything.recv().await.unwrap().topic, "event/vehicle");
    }

    #[tokio::test]
    async fn test_close_cancels_new_work_and_subscribers() {
        let (bus, _recorder) = bound_bus();
        let mut subscription = bus.subscribe("*");

        bus.close();
        assert_eq!(subscription.recv().await.unwrap_err().kind(), "cancelled");
        assert_eq!(bus.call(Message::new("echo"), None).await.unwrap_err().kind(), "cancelled");
        assert!(bus.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_unbound_bus_cancels() {
        let bus = Bus::default();
        assert_eq!(bus.submit(Message::new("echo")).unwrap_err().kind(), "cancelled");
    }
}
