use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::client::{MessagingClient, PollOptions};
use crate::error::{CourierError, PollError};
use crate::registry::{HandlerContext, HandlerRegistry, Registration};
use crate::tenant::TenantId;
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Maximum messages handed to a handler at once.
    pub batch_size: usize,
    /// How long each poll waits for a first message.
    pub poll_timeout: Duration,
    /// Sleep after a round in which no queue had work.
    pub idle_backoff: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            poll_timeout: Duration::from_millis(200),
            idle_backoff: Duration::from_millis(500),
        }
    }
}

/// Outcome of one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages handled and acknowledged.
    pub handled: usize,
    /// Invalid messages sent to the dead-letter queue.
    pub rejected: usize,
    /// Messages put back because their handler failed.
    pub requeued: usize,
}

impl BatchReport {
    pub fn is_idle(&self) -> bool {
        self.handled == 0 && self.rejected == 0 && self.requeued == 0
    }

    fn merge(&mut self, other: BatchReport) {
        self.handled += other.handled;
        self.rejected += other.rejected;
        self.requeued += other.requeued;
    }
}

/// Polls every registered event type for every tenant and hands batches
/// to their handlers.
///
/// Each batch runs in its own transaction: a handler success commits it
/// (acks plus any publishes the handler deferred), a handler failure rolls
/// it back so the batch is redelivered.
pub struct Subscriber {
    client: Arc<MessagingClient>,
    registry: Arc<HandlerRegistry>,
    tenants: Vec<TenantId>,
    config: SubscriberConfig,
}

impl Subscriber {
    pub fn new(
        client: Arc<MessagingClient>,
        registry: Arc<HandlerRegistry>,
        tenants: Vec<TenantId>,
        config: SubscriberConfig,
    ) -> Self {
        Self {
            client,
            registry,
            tenants,
            config,
        }
    }

    pub fn tenants(&self) -> &[TenantId] {
        &self.tenants
    }

    /// Declare the queue of every registration for every tenant.
    pub async fn bind_all(&self) -> Result<(), PollError> {
        for tenant in &self.tenants {
            for reg in self.registry.iter() {
                let topology = self
                    .client
                    .bind(tenant, reg.event_type, reg.mode, reg.target)
                    .await?;
                debug!(tenant = %tenant, queue = %topology.queue, "subscriber bound");
            }
        }
        Ok(())
    }

    /// Poll one batch of `reg` for `tenant` and run its handler.
    pub async fn process_batch(
        &self,
        tenant: &TenantId,
        reg: &Registration,
    ) -> Result<BatchReport, CourierError> {
        let tx = Transaction::new();
        let events = self
            .client
            .poll_batch(
                tenant,
                reg.event_type,
                reg.mode,
                reg.target,
                self.config.batch_size,
                PollOptions::transactional(&tx, self.config.poll_timeout),
            )
            .await;
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        let ctx = HandlerContext {
            tenant,
            client: &self.client,
            transaction: &tx,
        };
        let dispatch = reg.handler.dispatch(&ctx, events).await;

        match dispatch.result {
            Ok(()) => {
                tx.commit().await?;
                debug!(
                    tenant = %tenant,
                    event_type = reg.event_type,
                    handled = dispatch.valid,
                    rejected = dispatch.rejected,
                    "batch committed"
                );
                Ok(BatchReport {
                    handled: dispatch.valid,
                    rejected: dispatch.rejected,
                    requeued: 0,
                })
            }
            Err(e) => {
                warn!(
                    tenant = %tenant,
                    event_type = reg.event_type,
                    batch = dispatch.valid,
                    error = %e,
                    "handler failed, requeueing batch"
                );
                tx.rollback().await?;
                Ok(BatchReport {
                    handled: 0,
                    rejected: dispatch.rejected,
                    requeued: dispatch.valid,
                })
            }
        }
    }

    /// One pass over every tenant and registration. Errors are logged and
    /// the pass continues with the next queue.
    pub async fn poll_once(&self) -> BatchReport {
        let mut report = BatchReport::default();
        for tenant in &self.tenants {
            for reg in self.registry.iter() {
                match self.process_batch(tenant, reg).await {
                    Ok(r) => report.merge(r),
                    Err(e) => error!(
                        tenant = %tenant,
                        event_type = reg.event_type,
                        error = %e,
                        "batch processing failed"
                    ),
                }
            }
        }
        report
    }

    /// Loop until `shutdown` is notified (use `notify_one`).
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            tenants = self.tenants.len(),
            handlers = self.registry.len(),
            "subscriber started"
        );
        if let Err(e) = self.bind_all().await {
            warn!(error = %e, "initial bind failed, queues will be declared on first poll");
        }

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                report = self.poll_once() => {
                    if report.is_idle() {
                        tokio::select! {
                            _ = shutdown.notified() => break,
                            _ = tokio::time::sleep(self.config.idle_backoff) => {}
                        }
                    }
                }
            }
        }
        info!("subscriber stopped");
    }
}
