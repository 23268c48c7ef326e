//! Message Broker — publish/subscribe fan-out for inter-agent communication.
//!
//! Decouples message producers from consumers:
//!   - Topic registry: topic name → ordered list of subscribers
//!     (first-subscribed, first-notified)
//!   - Per-topic delivery serialization: publishes to one topic are observed
//!     in publish order; unrelated topics never contend; a publish that
//!     re-enters a topic mid-delivery is queued, never deadlocked
//!   - Failure isolation: one broken subscriber never stops delivery to the
//!     rest, and never surfaces as an error to the publisher
//!
//! The broker owns its state explicitly — no process-wide singleton; multiple
//! independent brokers can coexist in one process.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{CoreError, SubscriberError};
use crate::models::Message;

tokio::task_local! {
    /// Topics the current task is delivering on, innermost last. Lets a
    /// publish recognize a topic whose delivery mutex is already held further
    /// up its own call stack.
    static DELIVERING: RefCell<Vec<String>>;
}

/// The capability interface collaborators implement to receive messages.
///
/// The core depends only on this trait, never on concrete workers. A handler
/// should return quickly or hand off to its own task; the broker imposes no
/// callback timeout. Publishing from inside `handle` is supported: other
/// topics deliver immediately (the pipeline forwarding path), and a publish
/// back onto a topic already being delivered on this call stack is deferred
/// and drained before that topic's delivery completes.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Identity used in delivery reports and logs.
    fn name(&self) -> &str;

    async fn handle(&self, message: Message) -> Result<(), SubscriberError>;
}

/// Identifies one (topic, subscriber) registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    id: Uuid,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// One subscriber-level failure captured during delivery.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub subscriber: String,
    pub error: SubscriberError,
}

/// Per-publish outcome summary returned to the publisher.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub topic: String,
    pub message_id: Uuid,
    /// Number of subscriber callbacks invoked.
    pub invoked: usize,
    pub failures: Vec<DeliveryFailure>,
    /// True when the publish re-entered a topic mid-delivery and was queued
    /// instead of delivered inline; `invoked` and `failures` are then empty
    /// because delivery happens when the in-flight publish drains the queue.
    pub deferred: bool,
}

impl DeliveryReport {
    /// True iff every invoked subscriber succeeded (zero subscribers counts
    /// as success).
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
struct SubscriberEntry {
    id: Uuid,
    subscriber: Arc<dyn Subscriber>,
}

/// Per-topic state. The `delivery` mutex is the ordering primitive: it is
/// fair (FIFO) and scoped to this topic so unrelated topics stay fully
/// concurrent. `deferred` holds re-entrant publishes queued by the task
/// currently holding the mutex; that task drains them before releasing it.
struct TopicChannel {
    subscribers: RwLock<Vec<SubscriberEntry>>,
    delivery: Mutex<()>,
    deferred: Mutex<VecDeque<Message>>,
}

impl TopicChannel {
    fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            delivery: Mutex::new(()),
            deferred: Mutex::new(VecDeque::new()),
        }
    }
}

struct BrokerInner {
    connected: AtomicBool,
    registry: RwLock<HashMap<String, Arc<TopicChannel>>>,
}

/// Thread-safe publish/subscribe broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MessageBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MessageBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBroker {
    /// Create a broker in the disconnected state; call [`connect`] before use.
    ///
    /// [`connect`]: MessageBroker::connect
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                connected: AtomicBool::new(false),
                registry: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Open the broker for publish/subscribe. Idempotent.
    pub fn connect(&self) {
        if !self.inner.connected.swap(true, Ordering::SeqCst) {
            tracing::info!("[Broker] connected");
        }
    }

    /// Close the broker and release every subscription. Idempotent.
    ///
    /// In-flight deliveries complete on the snapshot they already took; new
    /// `publish`/`subscribe` calls fail with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.registry.write().await.clear();
            tracing::info!("[Broker] disconnected, all subscriptions released");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Register a subscriber at the end of the topic's ordered list.
    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: Arc<dyn Subscriber>,
    ) -> Result<SubscriptionHandle, CoreError> {
        if !self.is_connected() {
            return Err(CoreError::ConnectionClosed);
        }
        if topic.trim().is_empty() {
            return Err(CoreError::InvalidTopic("topic must be non-empty".to_string()));
        }

        let channel = {
            let mut registry = self.inner.registry.write().await;
            registry
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicChannel::new()))
                .clone()
        };

        let entry = SubscriberEntry {
            id: Uuid::new_v4(),
            subscriber,
        };
        let handle = SubscriptionHandle {
            topic: topic.to_string(),
            id: entry.id,
        };
        channel.subscribers.write().await.push(entry);

        tracing::debug!("[Broker] subscribed to topic '{}'", topic);
        Ok(handle)
    }

    /// Remove one registration. Unknown or already-removed handles are a
    /// no-op, not an error.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let channel = {
            let registry = self.inner.registry.read().await;
            registry.get(&handle.topic).cloned()
        };
        if let Some(channel) = channel {
            let mut subscribers = channel.subscribers.write().await;
            let before = subscribers.len();
            subscribers.retain(|entry| entry.id != handle.id);
            if subscribers.len() < before {
                tracing::debug!("[Broker] unsubscribed from topic '{}'", handle.topic);
            }
        }
    }

    /// Deliver `message` to every currently-registered subscriber of `topic`,
    /// in subscription order.
    ///
    /// Subscriber failures are recorded in the report and never propagate.
    /// A topic with no subscribers succeeds trivially. Publishes to the same
    /// topic are serialized FIFO; the subscriber snapshot is taken when this
    /// publish acquires its turn, so late subscribers are not notified for
    /// this call.
    ///
    /// A publish onto a topic this task is already delivering on — a callback
    /// republishing to its own topic, or a publish cycle through several
    /// topics — cannot wait for the delivery mutex held further up its own
    /// call stack. It is queued instead and drained, FIFO, before the
    /// in-flight delivery releases the topic; its report comes back with
    /// `deferred` set.
    pub async fn publish(
        &self,
        topic: &str,
        message: Message,
    ) -> Result<DeliveryReport, CoreError> {
        if !self.is_connected() {
            return Err(CoreError::ConnectionClosed);
        }

        let channel = {
            let registry = self.inner.registry.read().await;
            registry.get(topic).cloned()
        };

        let Some(channel) = channel else {
            tracing::debug!(
                "[Broker] no subscribers on topic '{}', message {} dropped",
                topic,
                message.message_id
            );
            return Ok(DeliveryReport {
                topic: topic.to_string(),
                message_id: message.message_id,
                invoked: 0,
                failures: Vec::new(),
                deferred: false,
            });
        };

        let reentrant = DELIVERING
            .try_with(|topics| topics.borrow().iter().any(|t| t == topic))
            .unwrap_or(false);
        if reentrant {
            let message_id = message.message_id;
            channel.deferred.lock().await.push_back(message);
            tracing::debug!(
                "[Broker] publish re-entered topic '{}' mid-delivery, message {} deferred",
                topic,
                message_id
            );
            return Ok(DeliveryReport {
                topic: topic.to_string(),
                message_id,
                invoked: 0,
                failures: Vec::new(),
                deferred: true,
            });
        }

        let _ordering = channel.delivery.lock().await;

        let mut delivering = DELIVERING
            .try_with(|topics| topics.borrow().clone())
            .unwrap_or_default();
        delivering.push(topic.to_string());
        let message_id = message.message_id;

        let (invoked, failures) = DELIVERING
            .scope(RefCell::new(delivering), async {
                let result = Self::deliver(&channel, topic, &message).await;
                // Callbacks may have deferred publishes back onto this topic;
                // drain them before giving up the turn. A drained delivery
                // may defer more, hence the loop.
                loop {
                    let next = channel.deferred.lock().await.pop_front();
                    match next {
                        Some(queued) => {
                            Self::deliver(&channel, topic, &queued).await;
                        }
                        None => break,
                    }
                }
                result
            })
            .await;

        Ok(DeliveryReport {
            topic: topic.to_string(),
            message_id,
            invoked,
            failures,
            deferred: false,
        })
    }

    /// One delivery pass over a fresh snapshot of the topic's subscribers.
    async fn deliver(
        channel: &TopicChannel,
        topic: &str,
        message: &Message,
    ) -> (usize, Vec<DeliveryFailure>) {
        let snapshot: Vec<SubscriberEntry> = channel.subscribers.read().await.clone();

        let mut failures = Vec::new();
        for entry in &snapshot {
            if let Err(error) = entry.subscriber.handle(message.clone()).await {
                tracing::warn!(
                    "[Broker] subscriber '{}' failed on topic '{}': {}",
                    entry.subscriber.name(),
                    topic,
                    error
                );
                failures.push(DeliveryFailure {
                    subscriber: entry.subscriber.name().to_string(),
                    error,
                });
            }
        }

        tracing::debug!(
            "[Broker] delivered message {} on '{}' to {} subscribers ({} failures)",
            message.message_id,
            topic,
            snapshot.len(),
            failures.len()
        );

        (snapshot.len(), failures)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::models::{AgentRole, MessageType};

    fn test_message() -> Message {
        Message::new(
            AgentRole::Orchestrator,
            AgentRole::BusinessAnalyst,
            MessageType::Specification,
            "payload",
            "p1",
        )
        .unwrap()
    }

    /// Records its name into a shared log on every delivery.
    struct Recorder {
        name: String,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Subscriber for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, _message: Message) -> Result<(), SubscriberError> {
            self.log.lock().unwrap().push(self.name.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Subscriber for Failing {
        fn name(&self) -> &str {
            "fail"
        }

        async fn handle(&self, _message: Message) -> Result<(), SubscriberError> {
            Err(SubscriberError::new("boom"))
        }
    }

    async fn connected_broker() -> MessageBroker {
        let broker = MessageBroker::new();
        broker.connect();
        broker
    }

    #[tokio::test]
    async fn test_delivery_follows_subscription_order() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            broker
                .subscribe(
                    "work",
                    Arc::new(Recorder {
                        name: name.to_string(),
                        log: log.clone(),
                    }),
                )
                .await
                .unwrap();
        }

        let report = broker.publish("work", test_message()).await.unwrap();

        assert!(report.success());
        assert_eq!(report.invoked, 3);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let broker = connected_broker().await;

        let report = broker.publish("nobody-home", test_message()).await.unwrap();

        assert!(report.success());
        assert_eq!(report.invoked, 0);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_stop_delivery() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker
            .subscribe(
                "work",
                Arc::new(Recorder {
                    name: "ok1".to_string(),
                    log: log.clone(),
                }),
            )
            .await
            .unwrap();
        broker.subscribe("work", Arc::new(Failing)).await.unwrap();
        broker
            .subscribe(
                "work",
                Arc::new(Recorder {
                    name: "ok2".to_string(),
                    log: log.clone(),
                }),
            )
            .await
            .unwrap();

        let report = broker.publish("work", test_message()).await.unwrap();

        assert!(!report.success());
        assert_eq!(report.invoked, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber, "fail");
        assert_eq!(*log.lock().unwrap(), vec!["ok1", "ok2"]);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_noop() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        let handle = broker
            .subscribe(
                "work",
                Arc::new(Recorder {
                    name: "only".to_string(),
                    log: log.clone(),
                }),
            )
            .await
            .unwrap();

        broker.unsubscribe(&handle).await;
        broker.unsubscribe(&handle).await;

        let report = broker.publish("work", test_message()).await.unwrap();
        assert_eq!(report.invoked, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_rejects_new_calls_and_is_idempotent() {
        let broker = connected_broker().await;
        broker
            .subscribe(
                "work",
                Arc::new(Recorder {
                    name: "s".to_string(),
                    log: Arc::new(StdMutex::new(Vec::new())),
                }),
            )
            .await
            .unwrap();

        broker.disconnect().await;
        broker.disconnect().await;

        assert!(matches!(
            broker.publish("work", test_message()).await,
            Err(CoreError::ConnectionClosed)
        ));
        assert!(matches!(
            broker
                .subscribe("work", Arc::new(Failing))
                .await,
            Err(CoreError::ConnectionClosed)
        ));

        // Reconnecting starts from a clean registry.
        broker.connect();
        let report = broker.publish("work", test_message()).await.unwrap();
        assert_eq!(report.invoked, 0);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let broker = connected_broker().await;
        assert!(matches!(
            broker.subscribe("  ", Arc::new(Failing)).await,
            Err(CoreError::InvalidTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_broker_instances_are_independent() {
        let a = connected_broker().await;
        let b = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        a.subscribe(
            "work",
            Arc::new(Recorder {
                name: "on-a".to_string(),
                log: log.clone(),
            }),
        )
        .await
        .unwrap();

        let report = b.publish("work", test_message()).await.unwrap();
        assert_eq!(report.invoked, 0);
        assert!(log.lock().unwrap().is_empty());
    }

    /// A subscriber that forwards every message to another topic on the same
    /// broker — the pipeline handoff pattern.
    struct Forwarder {
        broker: MessageBroker,
        to_topic: String,
    }

    #[async_trait]
    impl Subscriber for Forwarder {
        fn name(&self) -> &str {
            "forwarder"
        }

        async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
            self.broker
                .publish(&self.to_topic, message)
                .await
                .map_err(|e| SubscriberError::new(e.to_string()))?;
            Ok(())
        }
    }

    /// Records message contents in delivery order.
    struct ContentLog {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Subscriber for ContentLog {
        fn name(&self) -> &str {
            "content-log"
        }

        async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
            self.log.lock().unwrap().push(message.content);
            Ok(())
        }
    }

    /// Republishes one follow-up onto its own topic from inside `handle`.
    struct Republisher {
        broker: MessageBroker,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Subscriber for Republisher {
        fn name(&self) -> &str {
            "republisher"
        }

        async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
            if !self.fired.swap(true, AtomicOrdering::SeqCst) {
                let follow_up = Message::new(
                    message.from_agent,
                    message.to_agent,
                    message.message_type,
                    "follow-up",
                    message.project_id.clone(),
                )
                .unwrap();
                let report = self.broker.publish("work", follow_up).await.unwrap();
                assert!(report.deferred);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_republish_onto_own_topic_completes_and_delivers_after() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker
            .subscribe(
                "work",
                Arc::new(Republisher {
                    broker: broker.clone(),
                    fired: AtomicBool::new(false),
                }),
            )
            .await
            .unwrap();
        broker
            .subscribe("work", Arc::new(ContentLog { log: log.clone() }))
            .await
            .unwrap();

        let report = tokio::time::timeout(
            Duration::from_secs(2),
            broker.publish("work", test_message()),
        )
        .await
        .expect("republish onto the delivering topic must not deadlock")
        .unwrap();

        assert!(report.success());
        assert!(!report.deferred);
        assert_eq!(report.invoked, 2);
        assert_eq!(*log.lock().unwrap(), vec!["payload", "follow-up"]);
    }

    /// Forwards the first message it sees to another topic, inline.
    struct ForwardOnce {
        broker: MessageBroker,
        to_topic: String,
        fired: AtomicBool,
    }

    #[async_trait]
    impl Subscriber for ForwardOnce {
        fn name(&self) -> &str {
            "forward-once"
        }

        async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
            if !self.fired.swap(true, AtomicOrdering::SeqCst) {
                self.broker
                    .publish(&self.to_topic, message)
                    .await
                    .map_err(|e| SubscriberError::new(e.to_string()))?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_cycle_across_topics_completes() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker
            .subscribe(
                "stage-one",
                Arc::new(ForwardOnce {
                    broker: broker.clone(),
                    to_topic: "stage-two".to_string(),
                    fired: AtomicBool::new(false),
                }),
            )
            .await
            .unwrap();
        broker
            .subscribe(
                "stage-two",
                Arc::new(ForwardOnce {
                    broker: broker.clone(),
                    to_topic: "stage-one".to_string(),
                    fired: AtomicBool::new(false),
                }),
            )
            .await
            .unwrap();
        broker
            .subscribe("stage-one", Arc::new(ContentLog { log: log.clone() }))
            .await
            .unwrap();

        // stage-one → stage-two → stage-one: the cycle closes back onto a
        // topic held up the call stack and must be deferred, not deadlock.
        let report = tokio::time::timeout(
            Duration::from_secs(2),
            broker.publish("stage-one", test_message()),
        )
        .await
        .expect("publish cycle through topics must not deadlock")
        .unwrap();

        assert!(report.success());
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reentrant_publish_to_other_topic() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker
            .subscribe(
                "stage-one",
                Arc::new(Forwarder {
                    broker: broker.clone(),
                    to_topic: "stage-two".to_string(),
                }),
            )
            .await
            .unwrap();
        broker
            .subscribe(
                "stage-two",
                Arc::new(Recorder {
                    name: "sink".to_string(),
                    log: log.clone(),
                }),
            )
            .await
            .unwrap();

        let report = broker.publish("stage-one", test_message()).await.unwrap();

        assert!(report.success());
        assert_eq!(*log.lock().unwrap(), vec!["sink"]);
    }

    /// Sleeps on every delivery; used to prove per-topic lock scope.
    struct Slow {
        delay: Duration,
    }

    #[async_trait]
    impl Subscriber for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn handle(&self, _message: Message) -> Result<(), SubscriberError> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_slow_topic_does_not_block_other_topics() {
        let broker = connected_broker().await;
        broker
            .subscribe(
                "slow-lane",
                Arc::new(Slow {
                    delay: Duration::from_millis(300),
                }),
            )
            .await
            .unwrap();

        let slow = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish("slow-lane", test_message()).await })
        };
        // Give the slow delivery a head start so its lock is held.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(
            Duration::from_millis(100),
            broker.publish("fast-lane", test_message()),
        )
        .await;

        assert!(fast.is_ok(), "unrelated topic was blocked by slow delivery");
        slow.await.unwrap().unwrap();
    }

    /// Brackets every delivery with start/end markers around an await point;
    /// two deliveries running interleaved would split a start/end pair.
    struct Bracketing {
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Subscriber for Bracketing {
        fn name(&self) -> &str {
            "bracketing"
        }

        async fn handle(&self, message: Message) -> Result<(), SubscriberError> {
            self.log.lock().unwrap().push(format!("start:{}", message.content));
            tokio::time::sleep(Duration::from_millis(1)).await;
            self.log.lock().unwrap().push(format!("end:{}", message.content));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_same_topic_publishes_serialize() {
        let broker = connected_broker().await;
        let log = Arc::new(StdMutex::new(Vec::new()));

        broker
            .subscribe("work", Arc::new(Bracketing { log: log.clone() }))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for seq in 0..16 {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move {
                let mut message = test_message();
                message.content = seq.to_string();
                broker.publish("work", message).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().unwrap().success());
        }

        // Every delivery must run to completion before the next begins: the
        // log is a sequence of matched start/end pairs, one per publish.
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 32);
        let mut seen = std::collections::HashSet::new();
        for pair in log.chunks(2) {
            let seq = pair[0].strip_prefix("start:").unwrap();
            assert_eq!(pair[1], format!("end:{seq}"));
            assert!(seen.insert(seq.to_string()));
        }
        assert_eq!(seen.len(), 16);
    }
}
