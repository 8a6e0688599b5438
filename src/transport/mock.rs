//! Mock broker for tests and dry runs: in-process queues with failure injection.

use super::{Connection, ConnectionId, Transport, TransportError};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

#[derive(Debug)]
struct QueueState {
    durable: bool,
    depth: u32,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    // Every connection opened before the current epoch counts as dropped.
    epoch: AtomicU64,
    refuse_connects: AtomicBool,
    fail_next_connects: AtomicU32,
    fail_all_publishes: AtomicBool,
    fail_next_publishes: AtomicU32,
    panic_next_publishes: AtomicU32,
    publish_delay_us: AtomicU64,
    connect_attempts: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    publish_attempts: AtomicU64,
    published: AtomicU64,
    persistent_published: AtomicU64,
    concurrent_use: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Handle to one in-process broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker(Arc<Shared>);

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect attempt fails while set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.0.refuse_connects.store(refuse, Ordering::SeqCst);
    }

    /// The next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.0.fail_next_connects.store(n, Ordering::SeqCst);
    }

    /// Every publish fails while set.
    pub fn fail_all_publishes(&self, fail: bool) {
        self.0.fail_all_publishes.store(fail, Ordering::SeqCst);
    }

    /// The next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.0.fail_next_publishes.store(n, Ordering::SeqCst);
    }

    /// The next `n` publishes panic inside the publishing task.
    pub fn panic_next_publishes(&self, n: u32) {
        self.0.panic_next_publishes.store(n, Ordering::SeqCst);
    }

    /// Simulated broker round-trip per publish.
    pub fn set_publish_delay(&self, delay: Duration) {
        self.0
            .publish_delay_us
            .store(delay.as_micros() as u64, Ordering::SeqCst);
    }

    /// Drops every connection currently open, as a broker restart would.
    pub fn drop_all_connections(&self) {
        self.0.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn depth(&self, queue: &str) -> Option<u32> {
        let queues = self.0.queues.lock().unwrap();
        queues.get(queue).map(|q| q.depth)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.0.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connections_opened(&self) -> u64 {
        self.0.connections_opened.load(Ordering::SeqCst)
    }

    pub fn connections_closed(&self) -> u64 {
        self.0.connections_closed.load(Ordering::SeqCst)
    }

    pub fn publish_attempts(&self) -> u64 {
        self.0.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> u64 {
        self.0.published.load(Ordering::SeqCst)
    }

    /// Successful publishes that asked for persistent delivery.
    pub fn persistent_published(&self) -> u64 {
        self.0.persistent_published.load(Ordering::SeqCst)
    }

    /// Publishes currently between send and broker reply, across all connections.
    pub fn in_flight(&self) -> u64 {
        self.0.in_flight.load(Ordering::SeqCst)
    }

    /// Highest `in_flight` seen so far.
    pub fn peak_in_flight(&self) -> u64 {
        self.0.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Number of times a connection was used by two publishers at once.
    pub fn concurrent_use(&self) -> u64 {
        self.0.concurrent_use.load(Ordering::SeqCst)
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct MockTransport {
    broker: MockBroker,
}

static BROKER: OnceLock<MockBroker> = OnceLock::new();

impl MockTransport {
    pub fn new(broker: MockBroker) -> Self {
        Self { broker }
    }

    /// Transport bound to the process-wide mock broker.
    pub fn shared() -> Self {
        Self::new(BROKER.get_or_init(MockBroker::new).clone())
    }

    pub fn broker(&self) -> &MockBroker {
        &self.broker
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        let shared = &self.broker.0;
        shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if shared.refuse_connects.load(Ordering::SeqCst)
            || MockBroker::take_one(&shared.fail_next_connects)
        {
            return Err(TransportError::Connect("connection refused (mock)".into()));
        }
        shared.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            id: ConnectionId::next(),
            broker: self.broker.clone(),
            epoch: shared.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
        }))
    }

    fn endpoint(&self) -> String {
        "mock".into()
    }
}

struct MockConnection {
    id: ConnectionId,
    broker: MockBroker,
    epoch: u64,
    closed: AtomicBool,
    in_use: AtomicBool,
}

impl MockConnection {
    fn check_open(&self) -> Result<(), TransportError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

#[async_trait::async_trait]
impl Connection for MockConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && self.broker.0.epoch.load(Ordering::SeqCst) == self.epoch
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<(), TransportError> {
        self.check_open()?;
        let mut queues = self.broker.0.queues.lock().unwrap();
        match queues.get(name) {
            Some(q) if q.durable != durable => Err(TransportError::Declare(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                name
            ))),
            Some(_) => Ok(()),
            None => {
                queues.insert(name.to_string(), QueueState { durable, depth: 0 });
                Ok(())
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        _body: Bytes,
        _content_type: &str,
        persistent: bool,
    ) -> Result<(), TransportError> {
        let shared = &self.broker.0;
        shared.publish_attempts.fetch_add(1, Ordering::SeqCst);
        self.check_open()?;
        if MockBroker::take_one(&shared.panic_next_publishes) {
            panic!("publish panicked (mock)");
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            shared.concurrent_use.fetch_add(1, Ordering::SeqCst);
        }
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = shared.publish_delay_us.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_micros(delay)).await;
        } else {
            tokio::task::yield_now().await;
        }
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.in_use.store(false, Ordering::SeqCst);

        if shared.fail_all_publishes.load(Ordering::SeqCst)
            || MockBroker::take_one(&shared.fail_next_publishes)
        {
            return Err(TransportError::Publish("channel error (mock)".into()));
        }
        // Default-exchange semantics: unroutable messages are dropped silently.
        if let Some(q) = shared.queues.lock().unwrap().get_mut(queue) {
            q.depth += 1;
        }
        shared.published.fetch_add(1, Ordering::SeqCst);
        if persistent {
            shared.persistent_published.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn queue_depth(&self, name: &str) -> Result<u32, TransportError> {
        self.check_open()?;
        self.broker
            .depth(name)
            .ok_or_else(|| TransportError::Query(format!("NOT_FOUND - no queue '{}'", name)))
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, TransportError> {
        self.check_open()?;
        let mut queues = self.broker.0.queues.lock().unwrap();
        match queues.get_mut(name) {
            Some(q) => Ok(std::mem::take(&mut q.depth)),
            None => Err(TransportError::Query(format!("NOT_FOUND - no queue '{}'", name))),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker
                .0
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn declare_is_idempotent_for_matching_properties() {
        let t = MockTransport::new(MockBroker::new());
        let c = t.connect().await.expect("connect");
        c.declare_queue("q", false).await.expect("first declare");
        c.declare_queue("q", false).await.expect("second declare");
        assert!(matches!(
            c.declare_queue("q", true).await,
            Err(TransportError::Declare(_))
        ));
    }

    #[tokio::test]
    async fn publish_counts_depth_and_purge_resets() {
        let broker = MockBroker::new();
        let t = MockTransport::new(broker.clone());
        let c = t.connect().await.expect("connect");
        c.declare_queue("q", false).await.expect("declare");
        for _ in 0..3 {
            c.publish("q", Bytes::from_static(b"{}"), "application/json", false)
                .await
                .expect("publish");
        }
        assert_eq!(c.queue_depth("q").await.expect("depth"), 3);
        assert_eq!(broker.published(), 3);
        assert_eq!(broker.peak_in_flight(), 1);
        assert_eq!(broker.in_flight(), 0);
        assert_eq!(c.purge_queue("q").await.expect("purge"), 3);
        assert_eq!(broker.depth("q"), Some(0));
    }

    #[tokio::test]
    async fn dropped_connections_report_closed() {
        let broker = MockBroker::new();
        let t = MockTransport::new(broker.clone());
        let c = t.connect().await.expect("connect");
        assert!(c.is_open());
        broker.drop_all_connections();
        assert!(!c.is_open());
        assert!(matches!(
            c.publish("q", Bytes::new(), "application/json", false).await,
            Err(TransportError::Disconnected)
        ));
        let fresh = t.connect().await.expect("reconnect");
        assert!(fresh.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let broker = MockBroker::new();
        let c = MockTransport::new(broker.clone())
            .connect()
            .await
            .expect("connect");
        c.close().await.expect("close");
        c.close().await.expect("close again");
        assert_eq!(broker.connections_closed(), 1);
    }

    #[tokio::test]
    async fn injected_connect_failures_are_consumed() {
        let broker = MockBroker::new();
        let t = MockTransport::new(broker.clone());
        broker.fail_next_connects(2);
        assert!(t.connect().await.is_err());
        assert!(t.connect().await.is_err());
        assert!(t.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }
}
