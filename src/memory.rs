//! In-memory broker implementing the transport traits, with knobs to break the network.

use crate::{
    transport::{
        CloseNotice, DeliveryStream, Dialer, Publishing, RawChannel, RawConnection, RawDelivery,
    },
    types::{DeliveryTag, FieldTable},
    Confirmation, Error, Result,
};
use async_trait::async_trait;
use lapin::options::BasicConsumeOptions;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker(Arc<Inner>);

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    unreachable: AtomicBool,
    confirms_unsupported: AtomicBool,
    nacking: AtomicBool,
    dials: AtomicUsize,
}

#[derive(Default)]
struct BrokerState {
    bindings: HashMap<String, Vec<String>>,
    queues: HashMap<String, Queue>,
    unacked: HashMap<(u64, DeliveryTag), Unacked>,
    tags: HashMap<u64, DeliveryTag>,
    connections: Vec<Weak<MemoryConnection>>,
    next_id: u64,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Stored>,
    consumers: VecDeque<Consumer>,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    headers: FieldTable,
    body: Vec<u8>,
    redelivered: bool,
}

struct Consumer {
    channel: u64,
    no_ack: bool,
    sender: flume::Sender<Result<RawDelivery>>,
}

struct Unacked {
    queue: String,
    message: Stored,
}

fn io_error(kind: io::ErrorKind, message: &str) -> Error {
    io::Error::new(kind, message.to_owned()).into()
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn declare(&self, exchange: &str, queue: &str) {
        let mut state = self.0.state.lock();
        state.queues.entry(queue.into()).or_default();
        let bound = state.bindings.entry(exchange.into()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.into());
        }
    }

    pub(crate) fn without_confirms(&self) {
        self.0.confirms_unsupported.store(true, Ordering::SeqCst);
    }

    /// Refuses every later publish with a nack, the way a broker does on internal errors.
    pub(crate) fn nack_publishes(&self) {
        self.0.nacking.store(true, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.0.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn ready(&self, queue: &str) -> usize {
        self.0
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub(crate) fn unacked(&self) -> usize {
        self.0.state.lock().unacked.len()
    }

    /// Drops every connection and refuses new ones until `restore`.
    pub(crate) fn outage(&self) {
        self.0.unreachable.store(true, Ordering::SeqCst);
        for connection in self.live_connections() {
            connection.fail(io_error(io::ErrorKind::ConnectionAborted, "network outage"));
        }
    }

    pub(crate) fn restore(&self) {
        self.0.unreachable.store(false, Ordering::SeqCst);
    }

    /// Kills every open channel with a channel-level exception, connections survive.
    pub(crate) fn fail_channels(&self) {
        for connection in self.live_connections() {
            let channels = connection.channels.lock().clone();
            for channel in channels {
                channel.fail(io_error(io::ErrorKind::Other, "channel exception"));
            }
        }
    }

    fn live_connections(&self) -> Vec<Arc<MemoryConnection>> {
        let mut state = self.0.state.lock();
        state.connections.retain(|c| c.strong_count() > 0);
        state
            .connections
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> Vec<String> {
        if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_owned()]
            } else {
                Vec::new()
            }
        } else {
            state.bindings.get(exchange).cloned().unwrap_or_default()
        }
    }

    fn dispatch(state: &mut BrokerState, queue_name: &str) {
        let BrokerState {
            queues,
            unacked,
            tags,
            ..
        } = state;
        let queue = match queues.get_mut(queue_name) {
            Some(queue) => queue,
            None => return,
        };
        while !queue.ready.is_empty() {
            let consumer = match queue.consumers.pop_front() {
                Some(consumer) => consumer,
                None => return,
            };
            if consumer.sender.is_disconnected() {
                continue;
            }
            let message = match queue.ready.pop_front() {
                Some(message) => message,
                None => return,
            };
            let tag = tags.entry(consumer.channel).or_default();
            *tag += 1;
            let delivery = RawDelivery {
                delivery_tag: *tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                headers: message.headers.clone(),
                body: message.body.clone(),
            };
            if !consumer.no_ack {
                unacked.insert(
                    (consumer.channel, *tag),
                    Unacked {
                        queue: queue_name.to_owned(),
                        message,
                    },
                );
            }
            let _ = consumer.sender.send(Ok(delivery));
            queue.consumers.push_back(consumer);
        }
    }

    fn settle(
        &self,
        channel: u64,
        delivery_tag: DeliveryTag,
        multiple: bool,
        requeue: bool,
    ) -> Result<()> {
        let mut state = self.0.state.lock();
        let mut tags: Vec<DeliveryTag> = state
            .unacked
            .keys()
            .filter(|(c, t)| {
                *c == channel && (*t == delivery_tag || (multiple && *t < delivery_tag))
            })
            .map(|(_, t)| *t)
            .collect();
        if !tags.contains(&delivery_tag) {
            return Err(io_error(
                io::ErrorKind::InvalidInput,
                "PRECONDITION_FAILED - unknown delivery tag",
            ));
        }
        tags.sort_unstable();
        let settled: Vec<Unacked> = tags
            .into_iter()
            .filter_map(|t| state.unacked.remove(&(channel, t)))
            .collect();
        if requeue {
            Self::requeue(&mut state, settled);
        }
        Ok(())
    }

    fn requeue(state: &mut BrokerState, settled: Vec<Unacked>) {
        let mut touched = Vec::new();
        for unacked in settled.into_iter().rev() {
            let mut message = unacked.message;
            message.redelivered = true;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(message);
            }
            if !touched.contains(&unacked.queue) {
                touched.push(unacked.queue);
            }
        }
        for queue in touched {
            Self::dispatch(state, &queue);
        }
    }

    fn release(&self, channel: u64) {
        let mut state = self.0.state.lock();
        for queue in state.queues.values_mut() {
            queue.consumers.retain(|c| c.channel != channel);
        }
        let mut tags: Vec<DeliveryTag> = state
            .unacked
            .keys()
            .filter(|(c, _)| *c == channel)
            .map(|(_, t)| *t)
            .collect();
        tags.sort_unstable();
        let released: Vec<Unacked> = tags
            .into_iter()
            .filter_map(|t| state.unacked.remove(&(channel, t)))
            .collect();
        Self::requeue(&mut state, released);
    }
}

#[async_trait]
impl Dialer for MemoryBroker {
    async fn dial(&self, _uri: &str) -> Result<Arc<dyn RawConnection>> {
        self.0.dials.fetch_add(1, Ordering::SeqCst);
        if self.0.unreachable.load(Ordering::SeqCst) {
            return Err(io_error(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        let (sender, notice) = flume::bounded(1);
        let connection = Arc::new(MemoryConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
            notifier: Mutex::new(Some(sender)),
            notice,
            channels: Mutex::new(Vec::new()),
        });
        self.0
            .state
            .lock()
            .connections
            .push(Arc::downgrade(&connection));
        Ok(connection)
    }
}

pub(crate) struct MemoryConnection {
    broker: MemoryBroker,
    open: AtomicBool,
    notifier: Mutex<Option<flume::Sender<Error>>>,
    notice: CloseNotice,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

impl MemoryConnection {
    fn fail(&self, error: Error) {
        if self.open.swap(false, Ordering::SeqCst) {
            if let Some(notifier) = self.notifier.lock().as_ref() {
                let _ = notifier.try_send(error.clone());
            }
            // Like the real client, channels of a dropped connection die without a word.
            for channel in self.channels.lock().drain(..) {
                channel.die();
            }
        }
    }
}

#[async_trait]
impl RawConnection for MemoryConnection {
    fn close_notice(&self) -> CloseNotice {
        self.notice.clone()
    }

    async fn open_channel(&self) -> Result<Arc<dyn RawChannel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(io_error(io::ErrorKind::NotConnected, "connection is gone"));
        }
        let id = {
            let mut state = self.broker.0.state.lock();
            state.next_id += 1;
            state.next_id
        };
        let (sender, notice) = flume::bounded(1);
        let channel = Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            id,
            open: AtomicBool::new(true),
            notifier: Mutex::new(Some(sender)),
            notice,
            confirm: AtomicBool::new(false),
            confirmations: Mutex::new(None),
        });
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.notifier.lock().take();
            let channels: Vec<_> = self.channels.lock().drain(..).collect();
            for channel in channels {
                channel.close().await?;
            }
            Ok(())
        } else {
            Err(io_error(io::ErrorKind::NotConnected, "connection is gone"))
        }
    }
}

pub(crate) struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
    open: AtomicBool,
    notifier: Mutex<Option<flume::Sender<Error>>>,
    notice: CloseNotice,
    confirm: AtomicBool,
    confirmations: Mutex<Option<flume::Sender<Confirmation>>>,
}

impl MemoryChannel {
    fn fail(&self, error: Error) {
        if self.is_open() {
            if let Some(notifier) = self.notifier.lock().as_ref() {
                let _ = notifier.try_send(error);
            }
            self.die();
        }
    }

    fn die(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.confirmations.lock().take();
            self.broker.release(self.id);
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io_error(io::ErrorKind::BrokenPipe, "channel is gone"))
        }
    }
}

#[async_trait]
impl RawChannel for MemoryChannel {
    fn close_notice(&self) -> CloseNotice {
        self.notice.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn set_qos(&self, _prefetch_count: u16, _prefetch_size: u32) -> Result<()> {
        self.check_open()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.check_open()?;
        if self.broker.0.confirms_unsupported.load(Ordering::SeqCst) {
            return Err(io_error(
                io::ErrorKind::Unsupported,
                "NOT_IMPLEMENTED - confirm.select",
            ));
        }
        self.confirm.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn notify_confirmations(&self, confirmations: flume::Sender<Confirmation>) {
        *self.confirmations.lock() = Some(confirmations);
    }

    async fn publish(&self, publishing: Publishing<'_>) -> Result<()> {
        self.check_open()?;
        let confirmation = if self.broker.0.nacking.load(Ordering::SeqCst) {
            Confirmation::Nack
        } else {
            let mut state = self.broker.0.state.lock();
            let queues = MemoryBroker::route(&state, publishing.exchange, publishing.routing_key);
            let unroutable = queues.is_empty();
            for queue in queues {
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_back(Stored {
                        exchange: publishing.exchange.to_owned(),
                        routing_key: publishing.routing_key.to_owned(),
                        headers: publishing.headers.clone(),
                        body: publishing.body.to_vec(),
                        redelivered: false,
                    });
                }
                MemoryBroker::dispatch(&mut state, &queue);
            }
            if unroutable && publishing.options.mandatory {
                Confirmation::Returned
            } else {
                Confirmation::Ack
            }
        };
        if self.confirm.load(Ordering::SeqCst) {
            let confirmations = self.confirmations.lock().clone();
            if let Some(confirmations) = confirmations {
                let _ = confirmations.send_async(confirmation).await;
            }
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        options: BasicConsumeOptions,
        _arguments: FieldTable,
    ) -> Result<DeliveryStream> {
        self.check_open()?;
        let (sender, receiver) = flume::unbounded();
        {
            let mut state = self.broker.0.state.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| io_error(io::ErrorKind::NotFound, "NOT_FOUND - no queue"))?;
            q.consumers.push_back(Consumer {
                channel: self.id,
                no_ack: options.no_ack,
                sender,
            });
            MemoryBroker::dispatch(&mut state, queue);
        }
        Ok(Box::pin(receiver.into_stream()))
    }

    async fn ack(&self, delivery_tag: DeliveryTag, multiple: bool) -> Result<()> {
        self.check_open()?;
        self.broker.settle(self.id, delivery_tag, multiple, false)
    }

    async fn nack(&self, delivery_tag: DeliveryTag, multiple: bool, requeue: bool) -> Result<()> {
        self.check_open()?;
        self.broker.settle(self.id, delivery_tag, multiple, requeue)
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<()> {
        self.check_open()?;
        self.broker.settle(self.id, delivery_tag, false, requeue)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.notifier.lock().take();
            self.confirmations.lock().take();
            self.broker.release(self.id);
        }
        Ok(())
    }
}

/// Polls `check` until it holds or `within` elapses, returning its last value.
pub(crate) async fn eventually<F: Fn() -> bool>(check: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return check();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
