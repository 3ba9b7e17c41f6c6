//! Consumer task of a Redpanda subscription.
//!
//! One task owns the [`StreamConsumer`] and fans messages out to one worker
//! per assigned partition. Workers run the handler, redeliver on failure, and
//! commit `offset + 1` once the handler succeeds. A worker that falls
//! `buffer_size` messages behind gets its partition paused instead of
//! blocking the consumer task, so the other partitions keep flowing.
//!
//! A worker is bound to a [`PartitionLease`]. Revoking the partition in a
//! rebalance ends the worker after its in-flight message; a later assignment
//! of the same partition starts a new worker from the committed offset.

use crate::from_kafka_headers;
use crate::rebalance::{PartitionLease, PartitionLeases, RebalanceContext};
use futures::StreamExt;
use library_events_core::message::{Headers, InboundMessage};
use library_events_core::message_bus::MessageHandler;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

pub(crate) type LeasedConsumer = StreamConsumer<RebalanceContext>;

/// Everything a subscription's consumer task needs.
pub(crate) struct PartitionDispatch {
    pub(crate) consumer: Arc<LeasedConsumer>,
    pub(crate) leases: Arc<PartitionLeases>,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) buffer_size: usize,
    pub(crate) redelivery_backoff: Duration,
    pub(crate) shutdown: watch::Receiver<bool>,
}

struct Worker {
    sender: mpsc::UnboundedSender<InboundMessage>,
    lease: Arc<PartitionLease>,
}

/// `true` once stop was requested or the subscription handle was dropped.
fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Copy a borrowed Kafka message into an owned one.
fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers: message
            .headers()
            .map_or_else(Headers::new, from_kafka_headers),
    }
}

fn single_partition(topic: &str, partition: i32) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    list.add_partition(topic, partition);
    list
}

fn pause(consumer: &LeasedConsumer, topic: &str, partition: i32) {
    match consumer.pause(&single_partition(topic, partition)) {
        Ok(()) => tracing::debug!(topic = %topic, partition, "Partition paused, worker is behind"),
        Err(e) => tracing::warn!(topic = %topic, partition, error = %e, "Failed to pause partition"),
    }
}

fn resume(consumer: &LeasedConsumer, topic: &str, partition: i32) {
    match consumer.resume(&single_partition(topic, partition)) {
        Ok(()) => tracing::debug!(topic = %topic, partition, "Partition resumed"),
        Err(e) => tracing::warn!(topic = %topic, partition, error = %e, "Failed to resume partition"),
    }
}

impl PartitionDispatch {
    /// Read until shutdown, then wait for every worker's in-flight message.
    pub(crate) async fn run(self) {
        let Self {
            consumer,
            leases,
            handler,
            buffer_size,
            redelivery_backoff,
            mut shutdown,
        } = self;

        let mut workers: HashMap<(String, i32), Worker> = HashMap::new();
        let mut tasks = JoinSet::new();

        {
            let mut stream = consumer.stream();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    next = stream.next() => next,
                };

                let message = match next {
                    Some(Ok(message)) => to_inbound(&message),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Failed to receive message");
                        continue;
                    },
                    None => break,
                };

                let key = (message.topic.clone(), message.partition);
                if workers.get(&key).is_some_and(|w| w.lease.is_revoked()) {
                    // Partition came back after a revocation; the old worker is done with it
                    workers.remove(&key);
                }

                let worker = workers.entry(key).or_insert_with(|| {
                    let (sender, receiver) = mpsc::unbounded_channel();
                    let lease = leases.acquire(&message.topic, message.partition);
                    tasks.spawn(run_worker(
                        Arc::clone(&consumer),
                        Arc::clone(&handler),
                        Arc::clone(&lease),
                        receiver,
                        shutdown.clone(),
                        buffer_size,
                        redelivery_backoff,
                    ));
                    tracing::debug!(
                        topic = %message.topic,
                        partition = message.partition,
                        "Started partition worker"
                    );
                    Worker { sender, lease }
                });

                let (topic, partition) = (message.topic.clone(), message.partition);
                worker
                    .lease
                    .enqueued(buffer_size, || pause(&consumer, &topic, partition));

                if worker.sender.send(message).is_err() {
                    // Worker exited; the message stays uncommitted and comes back on the next assignment
                    workers.remove(&(topic, partition));
                }
            }
        }

        drop(workers);
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Partition worker terminated abnormally");
            }
        }

        tracing::debug!("Consumer task exiting");
    }
}

async fn run_worker(
    consumer: Arc<LeasedConsumer>,
    handler: Arc<dyn MessageHandler>,
    lease: Arc<PartitionLease>,
    mut messages: mpsc::UnboundedReceiver<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
    redelivery_backoff: Duration,
) {
    while let Some(message) = messages.recv().await {
        lease.dequeued(buffer_size, || {
            resume(&consumer, &message.topic, message.partition);
        });

        if !lease.begin() {
            tracing::debug!(
                topic = %message.topic,
                partition = message.partition,
                "Partition revoked, dropping queued messages"
            );
            break;
        }
        let committed = deliver(
            &consumer,
            handler.as_ref(),
            &lease,
            &message,
            &mut shutdown,
            redelivery_backoff,
        )
        .await;
        lease.finish();

        if !committed || stopping(&shutdown) || lease.is_revoked() {
            break;
        }
    }
}

/// Hand `message` to the handler until it succeeds, then commit. Returns
/// `false` if stop or revocation interrupted the redelivery loop.
async fn deliver(
    consumer: &LeasedConsumer,
    handler: &dyn MessageHandler,
    lease: &PartitionLease,
    message: &InboundMessage,
    shutdown: &mut watch::Receiver<bool>,
    redelivery_backoff: Duration,
) -> bool {
    loop {
        match handler.handle(message).await {
            Ok(()) => {
                commit(consumer, message);
                return true;
            },
            Err(e) => {
                tracing::warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                if stopping(shutdown) || lease.is_revoked() {
                    return false;
                }
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return false,
                    () = lease.revoked() => return false,
                    () = tokio::time::sleep(redelivery_backoff) => {},
                }
            },
        }
    }
}

fn commit(consumer: &LeasedConsumer, message: &InboundMessage) {
    let mut offsets = TopicPartitionList::new();
    let result = offsets
        .add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.offset + 1),
        )
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async));

    if let Err(e) = result {
        tracing::warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            error = %e,
            "Failed to commit offset (message may be redelivered)"
        );
    } else {
        tracing::trace!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Offset committed"
        );
    }
}
