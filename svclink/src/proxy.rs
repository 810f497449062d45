//! Client side of an interface
//!
//! One [`Proxy`] exists per role and dispatcher thread and is shared by
//! every local consumer on that thread. It sends requests, caches the
//! latest attribute values and response parameters, and turns incoming
//! envelopes into [`Notification`]s for its consumers.

use crate::dispatcher::Dispatcher;
use crate::ids::{InterfaceDescriptor, MessageId, MessageRole};
use crate::message::{
    Address, DataState, Envelope, EnvelopeKind, NotifyKind, PayloadReader, ResultCode, SequenceNr,
};
use crate::registry::ListenerRegistry;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Identity of a local consumer on a dispatcher thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(pub u32);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// What a consumer is told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyEvent {
    Message {
        msg_id: MessageId,
        result: ResultCode,
        seq: SequenceNr,
    },
    ServiceConnected(bool),
}

/// An event addressed to one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub consumer: ConsumerId,
    pub event: ProxyEvent,
}

#[derive(Debug, Clone, Default)]
struct CacheSlot {
    payload: Vec<u8>,
    state: DataState,
}

#[derive(Debug, Clone, Copy)]
struct PendingCall {
    request: MessageId,
    response: MessageId,
    consumer: ConsumerId,
}

pub struct Proxy {
    descriptor: Arc<InterfaceDescriptor>,
    address: Address,
    stub: Address,
    dispatcher: Arc<dyn Dispatcher>,
    last_seq: u64,
    cache: HashMap<MessageId, CacheSlot>,
    listeners: ListenerRegistry<ConsumerId>,
    pending: HashMap<SequenceNr, PendingCall>,
    consumers: Vec<ConsumerId>,
    local: VecDeque<Notification>,
    connected: bool,
}

#[cfg(test)]
impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("address", &self.address)
            .field("stub", &self.stub)
            .field("connected", &self.connected)
            .finish_non_exhaustive()
    }
}

impl Proxy {
    pub fn new(
        descriptor: Arc<InterfaceDescriptor>,
        role: &str,
        thread: &str,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let service = descriptor.service_name().to_string();
        Self {
            address: Address::proxy(service.clone(), role, thread),
            stub: Address::stub(service, role, ""),
            descriptor,
            dispatcher,
            last_seq: 0,
            cache: HashMap::new(),
            listeners: ListenerRegistry::new(),
            pending: HashMap::new(),
            consumers: Vec::new(),
            local: VecDeque::new(),
            connected: false,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.descriptor.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn consumers(&self) -> &[ConsumerId] {
        &self.consumers
    }

    pub fn listeners(&self) -> &ListenerRegistry<ConsumerId> {
        &self.listeners
    }

    /// Number of calls still waiting for a result
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Announce this proxy to its stub
    pub fn connect(&self) {
        self.post(Envelope::connect(self.address.clone(), self.stub.clone()));
    }

    /// Leave the stub; the stub drops every listener of this proxy. A
    /// connect still waiting for its stub is withdrawn.
    pub fn disconnect(&mut self) {
        self.post(Envelope::disconnect(self.address.clone(), self.stub.clone()));
        self.connected = false;
    }

    /// Add a local consumer. A consumer joining a connected proxy is told
    /// so right away.
    pub fn attach(&mut self, consumer: ConsumerId) {
        if self.consumers.contains(&consumer) {
            return;
        }
        self.consumers.push(consumer);
        if self.connected {
            self.local.push_back(Notification {
                consumer,
                event: ProxyEvent::ServiceConnected(true),
            });
        }
    }

    /// Remove a local consumer with all its notifications and open calls
    pub fn detach(&mut self, consumer: ConsumerId) {
        self.clear_all_notifications(consumer);
        self.pending.retain(|_, call| call.consumer != consumer);
        self.local.retain(|notification| notification.consumer != consumer);
        self.consumers.retain(|known| *known != consumer);
    }

    /// Send a request; the returned sequence number correlates the later
    /// result and says nothing about success.
    pub fn send_request(
        &mut self,
        consumer: ConsumerId,
        request: MessageId,
        payload: Vec<u8>,
    ) -> Result<SequenceNr> {
        let response = self.descriptor.response_id(request);
        if response == MessageId::INVALID {
            return Err(self.violation(request, "not a request of this interface"));
        }

        self.last_seq += 1;
        let seq = SequenceNr(self.last_seq);
        if response != MessageId::NOT_PROCESSED {
            self.pending.insert(
                seq,
                PendingCall {
                    request,
                    response,
                    consumer,
                },
            );
        }
        tracing::debug!("{} sends {} {} for {}", self.address, request, seq, consumer);
        self.post(Envelope::request(
            self.address.clone(),
            self.stub.clone(),
            request,
            seq,
            payload,
        ));
        Ok(seq)
    }

    /// Register `consumer` for notifications of `msg_id`.
    ///
    /// The first local listener of an id subscribes at the stub. Later
    /// listeners of an attribute that is already valid get one synthetic
    /// delivery from the cache; repeating a registration only delivers when
    /// `notify_always` is set.
    pub fn set_notification(
        &mut self,
        msg_id: MessageId,
        consumer: ConsumerId,
        notify_always: bool,
    ) -> Result<()> {
        let role = self.descriptor.role_of(msg_id);
        if !matches!(
            role,
            MessageRole::Attribute | MessageRole::Response | MessageRole::Broadcast
        ) {
            return Err(self.violation(msg_id, "notifications need an attribute, response or broadcast"));
        }

        let first = !self.listeners.has_subscribers(msg_id);
        let added = self.listeners.add(msg_id, SequenceNr::ANY, consumer);
        if first {
            if self.connected {
                self.post(Envelope::notify_request(
                    self.address.clone(),
                    self.stub.clone(),
                    msg_id,
                    NotifyKind::StartNotify,
                ));
            }
            return Ok(());
        }

        if (added || notify_always)
            && role == MessageRole::Attribute
            && self.data_state(msg_id) == DataState::Ok
        {
            self.local.push_back(Notification {
                consumer,
                event: ProxyEvent::Message {
                    msg_id,
                    result: ResultCode::DataOk,
                    seq: SequenceNr::ANY,
                },
            });
        }
        Ok(())
    }

    /// Remove the notification of `consumer` for `msg_id`
    pub fn clear_notification(&mut self, msg_id: MessageId, consumer: ConsumerId) {
        if self.listeners.remove(msg_id, &consumer) && !self.listeners.has_subscribers(msg_id) {
            self.send_notify(msg_id, NotifyKind::StopNotify);
        }
    }

    /// Remove every notification of `consumer`. Calling it again is a no-op.
    pub fn clear_all_notifications(&mut self, consumer: ConsumerId) {
        let ids = self.listeners.notifications_of(&consumer);
        if ids.is_empty() {
            return;
        }
        self.listeners.remove_consumer(&consumer);
        if self.listeners.is_empty() {
            self.send_notify(MessageId::NOT_PROCESSED, NotifyKind::RemoveAllNotify);
            return;
        }
        for id in ids {
            if !self.listeners.has_subscribers(id) {
                self.send_notify(id, NotifyKind::StopNotify);
            }
        }
    }

    pub fn data_state(&self, msg_id: MessageId) -> DataState {
        self.cache
            .get(&msg_id)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Cached value of an attribute or the parameters of a response;
    /// `None` unless the state is `Ok`.
    pub fn value<T: DeserializeOwned>(&self, msg_id: MessageId) -> Result<Option<T>> {
        match self.cache.get(&msg_id) {
            Some(slot) if slot.state == DataState::Ok => {
                Ok(Some(PayloadReader::new(&slot.payload).read()?))
            }
            _ => Ok(None),
        }
    }

    /// Raw cached payload, whatever its state
    pub fn payload(&self, msg_id: MessageId) -> Option<&[u8]> {
        self.cache.get(&msg_id).map(|slot| slot.payload.as_slice())
    }

    /// Notifications produced without an incoming envelope
    pub fn take_local_notifications(&mut self) -> Vec<Notification> {
        self.local.drain(..).collect()
    }

    /// Process an envelope addressed to this proxy
    pub fn process_envelope(&mut self, envelope: &Envelope) -> Result<Vec<Notification>> {
        match envelope.kind() {
            EnvelopeKind::Response => self.process_response(envelope),
            EnvelopeKind::ServiceConnection(connected) => Ok(self.process_connection(connected)),
            _ => Err(self.violation(envelope.msg_id(), "proxy received a stub-bound envelope")),
        }
    }

    fn process_response(&mut self, envelope: &Envelope) -> Result<Vec<Notification>> {
        let msg_id = envelope.msg_id();
        let result = envelope.result();
        let mut resolved = msg_id;

        match result {
            ResultCode::DataInvalid | ResultCode::RequestInvalid => {}
            ResultCode::RequestError
            | ResultCode::RequestBusy
            | ResultCode::RequestCanceled
            | ResultCode::MessageUndelivered => {
                if self.descriptor.role_of(msg_id) == MessageRole::Request {
                    resolved = self.descriptor.response_id(msg_id);
                }
                if resolved == MessageId::NOT_PROCESSED {
                    resolved = msg_id;
                } else {
                    self.cache.entry(resolved).or_default().state = DataState::Invalid;
                }
            }
            ResultCode::RequestOk | ResultCode::DataOk => {
                if !matches!(
                    self.descriptor.role_of(msg_id),
                    MessageRole::Response | MessageRole::Broadcast | MessageRole::Attribute
                ) {
                    return Err(self.violation(msg_id, "data delivered for a non-data id"));
                }
                let slot = self.cache.entry(msg_id).or_default();
                slot.payload = envelope.payload().to_vec();
                slot.state = DataState::Ok;
            }
        }

        Ok(self.notify_listeners(resolved, result, envelope.seq()))
    }

    fn notify_listeners(
        &mut self,
        msg_id: MessageId,
        result: ResultCode,
        seq: SequenceNr,
    ) -> Vec<Notification> {
        let event = ProxyEvent::Message {
            msg_id,
            result,
            seq,
        };
        let mut notifications: Vec<Notification> = self
            .listeners
            .subscribers(msg_id)
            .map(|&consumer| Notification { consumer, event })
            .collect();

        if !seq.is_any() {
            match self.pending.get(&seq) {
                Some(call) if call.response == msg_id || call.request == msg_id => {
                    let consumer = call.consumer;
                    self.pending.remove(&seq);
                    if !notifications.iter().any(|n| n.consumer == consumer) {
                        notifications.push(Notification { consumer, event });
                    }
                }
                _ => {
                    tracing::debug!("{} got {} {} with no open call", self.address, msg_id, seq);
                }
            }
        }

        if notifications.is_empty() {
            tracing::debug!("{} has no listener for {} ({}), dropped", self.address, msg_id, result);
        }
        notifications
    }

    fn process_connection(&mut self, connected: bool) -> Vec<Notification> {
        let mut notifications = Vec::new();
        self.connected = connected;

        if connected {
            tracing::info!("{} connected to service", self.address);
            let mut subscribed: Vec<MessageId> = Vec::new();
            for consumer in self.consumers.clone() {
                for id in self.listeners.notifications_of(&consumer) {
                    if !subscribed.contains(&id) {
                        subscribed.push(id);
                    }
                }
            }
            for id in subscribed {
                self.send_notify(id, NotifyKind::StartNotify);
            }
        } else {
            tracing::info!("{} lost its service", self.address);
            for slot in self.cache.values_mut() {
                slot.state = DataState::Unavailable;
            }
            let mut open: Vec<(SequenceNr, PendingCall)> = self.pending.drain().collect();
            open.sort_by_key(|(seq, _)| *seq);
            for (seq, call) in open {
                notifications.push(Notification {
                    consumer: call.consumer,
                    event: ProxyEvent::Message {
                        msg_id: call.response,
                        result: ResultCode::MessageUndelivered,
                        seq,
                    },
                });
            }
            // wait for the service to come back
            self.connect();
        }

        notifications.extend(self.consumers.iter().map(|&consumer| Notification {
            consumer,
            event: ProxyEvent::ServiceConnected(connected),
        }));
        notifications
    }

    fn send_notify(&self, msg_id: MessageId, kind: NotifyKind) {
        if self.connected {
            self.post(Envelope::notify_request(
                self.address.clone(),
                self.stub.clone(),
                msg_id,
                kind,
            ));
        }
    }

    fn post(&self, envelope: Envelope) {
        if let Err(e) = self.dispatcher.post(envelope) {
            tracing::warn!("{} could not post envelope: {}", self.address, e);
        }
    }

    fn violation(&self, msg_id: MessageId, message: &str) -> Error {
        tracing::error!("Protocol violation on {}: {} ({})", self.address, message, msg_id);
        Error::protocol_violation(self.descriptor.service_name(), msg_id, message)
    }
}

/// Proxy shared by the consumers of one dispatcher thread
pub type ProxyHandle = Rc<RefCell<Proxy>>;

/// Memoized proxy factory of one dispatcher thread
pub struct ProxyRegistry {
    thread: String,
    dispatcher: Arc<dyn Dispatcher>,
    proxies: HashMap<String, ProxyHandle>,
}

impl ProxyRegistry {
    pub fn new(thread: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            thread: thread.into(),
            dispatcher,
            proxies: HashMap::new(),
        }
    }

    /// The proxy of `role`, created and connected on first use
    pub fn find_or_create(
        &mut self,
        descriptor: Arc<InterfaceDescriptor>,
        role: &str,
    ) -> Result<ProxyHandle> {
        if let Some(proxy) = self.proxies.get(role) {
            let existing = proxy.borrow().descriptor();
            if existing.service_name() != descriptor.service_name() {
                return Err(Error::configuration(
                    format!(
                        "role '{role}' already serves '{}', not '{}'",
                        existing.service_name(),
                        descriptor.service_name()
                    ),
                    Some("role".to_string()),
                ));
            }
            if !descriptor.version().is_compatible_with(&existing.version()) {
                return Err(Error::configuration(
                    format!(
                        "'{}' {} cannot share the proxy of role '{role}' speaking {}",
                        descriptor.service_name(),
                        descriptor.version(),
                        existing.version()
                    ),
                    Some("version".to_string()),
                ));
            }
            return Ok(proxy.clone());
        }

        let proxy = Proxy::new(descriptor, role, &self.thread, self.dispatcher.clone());
        proxy.connect();
        tracing::debug!("Created {}", proxy.address());
        let handle = Rc::new(RefCell::new(proxy));
        self.proxies.insert(role.to_string(), handle.clone());
        Ok(handle)
    }

    pub fn get(&self, role: &str) -> Option<ProxyHandle> {
        self.proxies.get(role).cloned()
    }

    /// Drop the proxy of `role` and leave its stub
    pub fn remove(&mut self, role: &str) -> Option<ProxyHandle> {
        let proxy = self.proxies.remove(role)?;
        proxy.borrow_mut().disconnect();
        Some(proxy)
    }

    pub fn roles(&self) -> Vec<String> {
        self.proxies.keys().cloned().collect()
    }

    pub fn handles(&self) -> impl Iterator<Item = &ProxyHandle> + '_ {
        self.proxies.values()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }
}
