//! Binds broker side effects to the caller's unit of work.
//!
//! A [`Transaction`] collects deferred publishes and fetched deliveries.
//! Nothing is sent and nothing is acknowledged until [`Transaction::commit`];
//! [`Transaction::rollback`] drops the publishes and puts the deliveries back
//! on their queues. Dropping an unfinished transaction behaves like a
//! rollback, never like a commit.

use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::TransactionError;
use crate::message::Event;
use crate::metrics::MessagingMetrics;
use crate::transport::{BrokerChannel, WireMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Ack,
    /// Dead-letter on completion, whatever the outcome.
    Reject,
}

pub(crate) struct PendingPublish {
    pub(crate) channel: Arc<dyn BrokerChannel>,
    pub(crate) exchange: String,
    pub(crate) routing_key: String,
    pub(crate) event_type: String,
    pub(crate) message: WireMessage,
    /// Emptied right before the send.
    pub(crate) purge_queue: Option<String>,
}

struct PendingDelivery {
    channel: Arc<dyn BrokerChannel>,
    tag: u64,
    event_id: Uuid,
    disposition: Disposition,
}

#[derive(Default)]
struct Entries {
    publishes: Vec<PendingPublish>,
    deliveries: Vec<PendingDelivery>,
    metrics: Option<Arc<MessagingMetrics>>,
}

/// A local unit of work spanning publishes and polls.
///
/// Shared by reference with every publish/poll it covers, then consumed
/// exactly once by `commit` or `rollback`.
pub struct Transaction {
    id: Uuid,
    entries: Mutex<Entries>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("publishes", &entries.publishes.len())
            .field("deliveries", &entries.deliveries.len())
            .finish()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Nothing enlisted yet.
    pub fn is_empty(&self) -> bool {
        let entries = self.entries();
        entries.publishes.is_empty() && entries.deliveries.is_empty()
    }

    pub fn pending_publishes(&self) -> usize {
        self.entries().publishes.len()
    }

    pub fn pending_deliveries(&self) -> usize {
        self.entries().deliveries.len()
    }

    pub(crate) fn enlist_publish(&self, publish: PendingPublish, metrics: &Arc<MessagingMetrics>) {
        let mut entries = self.entries();
        entries.metrics.get_or_insert_with(|| Arc::clone(metrics));
        entries.publishes.push(publish);
        metrics.record_deferred();
    }

    pub(crate) fn enlist_delivery(
        &self,
        channel: Arc<dyn BrokerChannel>,
        tag: u64,
        event_id: Uuid,
        metrics: &Arc<MessagingMetrics>,
    ) {
        let mut entries = self.entries();
        entries.metrics.get_or_insert_with(|| Arc::clone(metrics));
        entries.deliveries.push(PendingDelivery {
            channel,
            tag,
            event_id,
            disposition: Disposition::Ack,
        });
    }

    /// Mark a delivery received in this transaction as invalid.
    ///
    /// On commit or rollback it is dead-lettered instead of acknowledged or
    /// requeued. Returns `false` if `event` was not received in this
    /// transaction.
    pub fn reject(&self, event: &Event) -> bool {
        let mut entries = self.entries();
        match entries
            .deliveries
            .iter_mut()
            .find(|d| d.event_id == event.id() && d.disposition == Disposition::Ack)
        {
            Some(delivery) => {
                delivery.disposition = Disposition::Reject;
                true
            }
            None => false,
        }
    }

    fn pop_publish(&self) -> Option<PendingPublish> {
        let mut entries = self.entries();
        if entries.publishes.is_empty() {
            None
        } else {
            Some(entries.publishes.remove(0))
        }
    }

    fn pop_delivery(&self) -> Option<PendingDelivery> {
        let mut entries = self.entries();
        if entries.deliveries.is_empty() {
            None
        } else {
            Some(entries.deliveries.remove(0))
        }
    }

    /// Send every deferred publish, then acknowledge every delivery.
    /// A purge requested with a publish runs just before it.
    ///
    /// If a publish fails the deliveries are requeued instead, so the input
    /// is redelivered and the whole unit of work can run again. Publishes
    /// already sent at that point cannot be recalled.
    ///
    /// Entries stay in the transaction until they are handled, so a commit
    /// cancelled halfway rolls back whatever it had not reached yet.
    pub async fn commit(self) -> Result<(), TransactionError> {
        let metrics = self.entries().metrics.clone();
        let total = self.pending_publishes();

        let mut sent = 0;
        while let Some(publish) = self.pop_publish() {
            let PendingPublish {
                channel,
                exchange,
                routing_key,
                event_type,
                message,
                purge_queue,
            } = publish;
            let result = async {
                if let Some(queue) = &purge_queue {
                    channel.purge(queue).await?;
                }
                channel.publish(&exchange, &routing_key, message).await
            }
            .await;
            match result {
                Ok(()) => {
                    sent += 1;
                    if let Some(m) = &metrics {
                        m.record_published(&event_type);
                    }
                }
                Err(source) => {
                    warn!(
                        transaction = %self.id,
                        exchange = %exchange,
                        sent,
                        total,
                        error = %source,
                        "deferred publish failed, requeueing transaction input"
                    );
                    let rest = mem::take(&mut self.entries().publishes);
                    if let Some(m) = &metrics {
                        m.record_dropped(rest.len() as u64);
                    }
                    // The publish error is the one worth reporting.
                    let _ = self.settle_pending(false, metrics.as_deref()).await;
                    return Err(TransactionError::Publish { exchange, source });
                }
            }
        }

        self.settle_pending(true, metrics.as_deref()).await?;
        debug!(transaction = %self.id, published = total, "transaction committed");
        Ok(())
    }

    /// Discard deferred publishes and requeue every delivery.
    pub async fn rollback(self) -> Result<(), TransactionError> {
        let (publishes, metrics) = {
            let mut entries = self.entries();
            (mem::take(&mut entries.publishes), entries.metrics.clone())
        };
        if let Some(m) = &metrics {
            m.record_dropped(publishes.len() as u64);
        }
        self.settle_pending(false, metrics.as_deref()).await?;
        debug!(transaction = %self.id, dropped = publishes.len(), "transaction rolled back");
        Ok(())
    }

    /// Settle deliveries one at a time. Keeps going after a failure and
    /// reports the first one.
    async fn settle_pending(
        &self,
        commit: bool,
        metrics: Option<&MessagingMetrics>,
    ) -> Result<(), TransactionError> {
        let mut first_error = None;
        while let Some(delivery) = self.pop_delivery() {
            if let Err(e) = settle_one(delivery, commit, metrics).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Ack (`commit`) or requeue a delivery; a rejected one is dead-lettered
/// either way.
async fn settle_one(
    delivery: PendingDelivery,
    commit: bool,
    metrics: Option<&MessagingMetrics>,
) -> Result<(), TransactionError> {
    let tag = delivery.tag;
    let result = match (delivery.disposition, commit) {
        (Disposition::Reject, _) => {
            if let Some(m) = metrics {
                m.record_dead_lettered(1);
            }
            delivery
                .channel
                .nack(tag, false)
                .await
                .map_err(|source| TransactionError::Requeue { tag, source })
        }
        (Disposition::Ack, true) => {
            if let Some(m) = metrics {
                m.record_acked(1);
            }
            delivery
                .channel
                .ack(tag)
                .await
                .map_err(|source| TransactionError::Ack { tag, source })
        }
        (Disposition::Ack, false) => {
            if let Some(m) = metrics {
                m.record_requeued(1);
            }
            delivery
                .channel
                .nack(tag, true)
                .await
                .map_err(|source| TransactionError::Requeue { tag, source })
        }
    };
    if let Err(e) = &result {
        warn!(tag, error = %e, "failed to settle delivery");
    }
    result
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let entries = mem::take(&mut *self.entries());
        if entries.publishes.is_empty() && entries.deliveries.is_empty() {
            return;
        }
        warn!(
            transaction = %self.id,
            publishes = entries.publishes.len(),
            deliveries = entries.deliveries.len(),
            "transaction dropped without commit or rollback, rolling back"
        );
        if let Some(m) = &entries.metrics {
            m.record_dropped(entries.publishes.len() as u64);
        }
        if entries.deliveries.is_empty() {
            return;
        }
        // Without a runtime the deliveries stay unacknowledged until their
        // channel closes, which also returns them to the queue.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let metrics = entries.metrics;
            let deliveries = entries.deliveries;
            handle.spawn(async move {
                for delivery in deliveries {
                    let _ = settle_one(delivery, false, metrics.as_deref()).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::TransportError;
    use crate::topology::ExchangeKind;
    use crate::transport::memory::InMemoryBroker;
    use crate::transport::{Broker, QueueArguments, RawDelivery};

    const VHOST: &str = "courier.tx";

    async fn channel() -> (InMemoryBroker, Arc<dyn BrokerChannel>) {
        let broker = InMemoryBroker::default();
        broker.add_vhost(VHOST);
        let ch = broker.connect(VHOST).await.unwrap();
        ch.declare_exchange("ex", ExchangeKind::Direct).await.unwrap();
        ch.declare_queue("q", &QueueArguments::default()).await.unwrap();
        ch.bind("q", "ex", "k").await.unwrap();
        (broker, ch)
    }

    fn message() -> WireMessage {
        WireMessage {
            body: b"m".to_vec(),
            ..WireMessage::default()
        }
    }

    fn deferred(ch: &Arc<dyn BrokerChannel>, exchange: &str) -> PendingPublish {
        PendingPublish {
            channel: ch.clone(),
            exchange: exchange.into(),
            routing_key: "k".into(),
            event_type: "evt".into(),
            message: message(),
            purge_queue: None,
        }
    }

    #[tokio::test]
    async fn commit_sends_deferred_publishes() {
        let (broker, ch) = channel().await;
        let metrics = Arc::new(MessagingMetrics::new());
        let tx = Transaction::new();
        tx.enlist_publish(deferred(&ch, "ex"), &metrics);
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(0));

        tx.commit().await.unwrap();
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(1));
        assert_eq!(metrics.snapshot().published, 1);
    }

    #[tokio::test]
    async fn rollback_drops_publishes_and_requeues_deliveries() {
        let (broker, ch) = channel().await;
        ch.publish("ex", "k", message()).await.unwrap();
        let metrics = Arc::new(MessagingMetrics::new());

        let tx = Transaction::new();
        let d = ch.get("q").await.unwrap().unwrap();
        tx.enlist_delivery(ch.clone(), d.tag, Uuid::new_v4(), &metrics);
        tx.enlist_publish(deferred(&ch, "ex"), &metrics);
        tx.rollback().await.unwrap();

        assert_eq!(broker.queue_depth(VHOST, "q"), Some(1));
        let snap = metrics.snapshot();
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.requeued, 1);
    }

    #[tokio::test]
    async fn failed_publish_requeues_input() {
        let (broker, ch) = channel().await;
        ch.publish("ex", "k", message()).await.unwrap();
        let metrics = Arc::new(MessagingMetrics::new());

        let tx = Transaction::new();
        let d = ch.get("q").await.unwrap().unwrap();
        tx.enlist_delivery(ch.clone(), d.tag, Uuid::new_v4(), &metrics);
        tx.enlist_publish(deferred(&ch, "missing"), &metrics);

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::Publish { ref exchange, .. } if exchange == "missing"));
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(1));
    }

    #[tokio::test]
    async fn dropped_transaction_requeues() {
        let (broker, ch) = channel().await;
        ch.publish("ex", "k", message()).await.unwrap();
        let metrics = Arc::new(MessagingMetrics::new());
        {
            let tx = Transaction::new();
            let d = ch.get("q").await.unwrap().unwrap();
            tx.enlist_delivery(ch.clone(), d.tag, Uuid::new_v4(), &metrics);
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(1));
    }

    /// Forwards everything except `ack`, which never completes.
    struct StalledAcks(Arc<dyn BrokerChannel>);

    #[async_trait]
    impl BrokerChannel for StalledAcks {
        async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
            self.0.declare_exchange(name, kind).await
        }

        async fn declare_queue(&self, name: &str, args: &QueueArguments) -> Result<(), TransportError> {
            self.0.declare_queue(name, args).await
        }

        async fn bind(&self, queue: &str, exchange: &str, key: &str) -> Result<(), TransportError> {
            self.0.bind(queue, exchange, key).await
        }

        async fn publish(&self, exchange: &str, key: &str, message: WireMessage) -> Result<(), TransportError> {
            self.0.publish(exchange, key, message).await
        }

        async fn get(&self, queue: &str) -> Result<Option<RawDelivery>, TransportError> {
            self.0.get(queue).await
        }

        async fn ack(&self, _tag: u64) -> Result<(), TransportError> {
            std::future::pending().await
        }

        async fn nack(&self, tag: u64, requeue: bool) -> Result<(), TransportError> {
            self.0.nack(tag, requeue).await
        }

        async fn purge(&self, queue: &str) -> Result<u32, TransportError> {
            self.0.purge(queue).await
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.0.close().await
        }

        fn is_open(&self) -> bool {
            self.0.is_open()
        }
    }

    #[tokio::test]
    async fn cancelled_commit_requeues_unsettled_deliveries() {
        let (broker, ch) = channel().await;
        ch.publish("ex", "k", message()).await.unwrap();
        ch.publish("ex", "k", message()).await.unwrap();
        let stalled: Arc<dyn BrokerChannel> = Arc::new(StalledAcks(ch.clone()));
        let metrics = Arc::new(MessagingMetrics::new());

        let tx = Transaction::new();
        for _ in 0..2 {
            let d = stalled.get("q").await.unwrap().unwrap();
            tx.enlist_delivery(stalled.clone(), d.tag, Uuid::new_v4(), &metrics);
        }
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(0));

        // The first ack hangs; giving up on the commit drops it midway.
        let cancelled = tokio::time::timeout(Duration::from_millis(50), tx.commit()).await;
        assert!(cancelled.is_err());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(broker.queue_depth(VHOST, "q"), Some(1));
        assert_eq!(metrics.snapshot().requeued, 1);
    }
}
