//! Service side of an interface
//!
//! A [`Stub`] pairs the interface-independent [`StubCore`] (attribute
//! cache, listener table, admission of requests, emitters) with the
//! interface-specific [`StubHandler`] that executes requests.

use crate::dispatcher::Dispatcher;
use crate::ids::{InterfaceDescriptor, MessageId, MessageRole};
use crate::message::{
    to_payload, Address, DataState, Envelope, EnvelopeKind, NotifyKind, PayloadReader, ResultCode,
    SequenceNr,
};
use crate::registry::ListenerRegistry;
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Interface-specific request handlers
pub trait StubHandler: 'static {
    /// Execute `request`, reading its arguments from `args` in declared order.
    /// Responses are sent through `stub`, either now or later.
    fn process_request(
        &mut self,
        stub: &mut StubCore,
        request: MessageId,
        args: &mut PayloadReader<'_>,
    ) -> Result<()>;

    /// A proxy connected to or disconnected from the service
    fn client_connected(&mut self, _stub: &mut StubCore, _client: &Address, _connected: bool) {}
}

/// Request being executed right now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentRequest {
    pub request: MessageId,
    pub response: MessageId,
    pub seq: SequenceNr,
    pub source: Address,
}

#[derive(Debug, Clone, Default)]
struct AttributeSlot {
    payload: Vec<u8>,
    state: DataState,
}

/// Interface-independent stub state
pub struct StubCore {
    descriptor: Arc<InterfaceDescriptor>,
    address: Address,
    dispatcher: Arc<dyn Dispatcher>,
    attributes: HashMap<MessageId, AttributeSlot>,
    listeners: ListenerRegistry<Address>,
    deferred: VecDeque<Envelope>,
    current: Option<CurrentRequest>,
    clients: Vec<Address>,
}

impl StubCore {
    pub fn new(
        descriptor: Arc<InterfaceDescriptor>,
        address: Address,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            descriptor,
            address,
            dispatcher,
            attributes: HashMap::new(),
            listeners: ListenerRegistry::new(),
            deferred: VecDeque::new(),
            current: None,
            clients: Vec::new(),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }

    pub fn listeners(&self) -> &ListenerRegistry<Address> {
        &self.listeners
    }

    /// Proxies currently connected
    pub fn clients(&self) -> &[Address] {
        &self.clients
    }

    pub fn current_request(&self) -> Option<&CurrentRequest> {
        self.current.as_ref()
    }

    /// Release the admission slot of the request being executed
    pub fn cancel_current_request(&mut self) {
        self.current = None;
    }

    /// Number of requests waiting for the admission slot
    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// The admission slot is held only while a handler executes; answers
    /// sent later do not keep it.
    pub fn can_execute_request(&self) -> bool {
        self.current.is_none()
    }

    pub fn attribute_state(&self, attribute: MessageId) -> DataState {
        self.attributes
            .get(&attribute)
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Cached attribute value; `None` unless the state is `Ok`
    pub fn attribute<T: DeserializeOwned>(&self, attribute: MessageId) -> Result<Option<T>> {
        match self.attributes.get(&attribute) {
            Some(slot) if slot.state == DataState::Ok => {
                Ok(Some(PayloadReader::new(&slot.payload).read()?))
            }
            _ => Ok(None),
        }
    }

    /// Set an attribute and notify subscribers. A set that does not change
    /// an already valid value emits nothing; returns whether it notified.
    pub fn set_attribute<T: Serialize + ?Sized>(&mut self, attribute: MessageId, value: &T) -> Result<bool> {
        self.expect_role(attribute, MessageRole::Attribute)?;
        let payload = to_payload(value)?;
        let slot = self.attributes.entry(attribute).or_default();
        if slot.state == DataState::Ok && slot.payload == payload {
            tracing::trace!("Attribute {} of {} unchanged", attribute, self.address);
            return Ok(false);
        }
        slot.payload = payload;
        self.send_notification(attribute)?;
        Ok(true)
    }

    /// Mark an attribute valid and push its value to every subscriber
    pub fn send_notification(&mut self, attribute: MessageId) -> Result<()> {
        let slot = self.attributes.entry(attribute).or_default();
        slot.state = DataState::Ok;
        let payload = slot.payload.clone();
        self.fan_out(attribute, ResultCode::DataOk, &payload)
    }

    /// Mark an attribute invalid and tell every subscriber
    pub fn invalidate_attribute(&mut self, attribute: MessageId) -> Result<()> {
        self.expect_role(attribute, MessageRole::Attribute)?;
        self.attributes.entry(attribute).or_default().state = DataState::Invalid;
        self.fan_out(attribute, ResultCode::DataInvalid, &[])
    }

    /// Send a response to the callers waiting on it and to its subscribers
    pub fn send_response<T: Serialize + ?Sized>(&mut self, response: MessageId, params: &T) -> Result<()> {
        self.send_response_payload(response, to_payload(params)?)
    }

    /// Send a response whose parameters are already serialized
    pub fn send_response_payload(&mut self, response: MessageId, payload: Vec<u8>) -> Result<()> {
        self.expect_role(response, MessageRole::Response)?;

        let callers = self.listeners.take_one_shot(response);
        for caller in &callers {
            self.post(Envelope::response(
                self.address.clone(),
                caller.consumer.clone(),
                response,
                ResultCode::RequestOk,
                caller.seq,
                payload.clone(),
            ));
        }

        let subscribers: Vec<Address> = self
            .listeners
            .subscribers(response)
            .filter(|proxy| !callers.iter().any(|caller| &caller.consumer == *proxy))
            .cloned()
            .collect();
        for proxy in subscribers {
            self.post(Envelope::response(
                self.address.clone(),
                proxy,
                response,
                ResultCode::RequestOk,
                SequenceNr::ANY,
                payload.clone(),
            ));
        }
        Ok(())
    }

    /// Send a broadcast to its subscribers
    pub fn send_broadcast<T: Serialize + ?Sized>(&mut self, broadcast: MessageId, params: &T) -> Result<()> {
        self.expect_role(broadcast, MessageRole::Broadcast)?;
        let payload = to_payload(params)?;
        self.fan_out(broadcast, ResultCode::RequestOk, &payload)
    }

    /// Tell the caller of the current request that the service is busy
    pub fn busy_current_request(&mut self) -> Result<()> {
        let current = self
            .current
            .clone()
            .ok_or_else(|| Error::runtime_msg("no request is being executed"))?;
        if current.response == MessageId::NOT_PROCESSED {
            return Ok(());
        }
        self.fail_caller(&current, ResultCode::RequestBusy);
        Ok(())
    }

    /// Classify a failure of `msg_id` and push one error envelope to every
    /// listener of the resolved id, in registration order.
    pub fn error_request(&mut self, msg_id: MessageId, cancel: bool) -> Result<()> {
        let (listener_id, result) = match self.descriptor.role_of(msg_id) {
            MessageRole::Attribute => {
                self.attributes.entry(msg_id).or_default().state = DataState::Invalid;
                (msg_id, ResultCode::DataInvalid)
            }
            MessageRole::Response | MessageRole::Broadcast => (msg_id, ResultCode::RequestInvalid),
            MessageRole::Request => {
                let result = if cancel {
                    ResultCode::RequestCanceled
                } else {
                    ResultCode::RequestError
                };
                (self.descriptor.response_id(msg_id), result)
            }
            MessageRole::NotProcessed | MessageRole::Invalid => {
                return Err(self.violation(msg_id, "error reported for an unknown message id"));
            }
        };

        let listeners: Vec<_> = self.listeners.listeners(listener_id).cloned().collect();
        if listeners.is_empty() {
            tracing::debug!("No listeners for {} on {}, error {} dropped", listener_id, self.address, result);
        }
        for listener in listeners {
            self.post(Envelope::response(
                self.address.clone(),
                listener.consumer,
                listener_id,
                result,
                listener.seq,
                Vec::new(),
            ));
        }
        if result.is_request_failure() {
            self.listeners.take_one_shot(listener_id);
        }
        Ok(())
    }

    fn process_notify_request(&mut self, envelope: &Envelope, kind: NotifyKind) -> Result<()> {
        let msg_id = envelope.msg_id();
        let source = envelope.source();
        match kind {
            NotifyKind::RemoveAllNotify => {
                let removed = self.listeners.remove_subscriptions(source);
                tracing::debug!("Removed {} subscriptions of {} from {}", removed, source, self.address);
            }
            NotifyKind::StopNotify => {
                self.listeners.remove(msg_id, source);
            }
            NotifyKind::StartNotify => match self.descriptor.role_of(msg_id) {
                MessageRole::Attribute => {
                    self.listeners.add(msg_id, SequenceNr::ANY, source.clone());
                    let (result, payload) = match self.attributes.get(&msg_id) {
                        Some(slot) if slot.state == DataState::Ok => {
                            (ResultCode::DataOk, slot.payload.clone())
                        }
                        _ => (ResultCode::DataInvalid, Vec::new()),
                    };
                    self.post(Envelope::response(
                        self.address.clone(),
                        source.clone(),
                        msg_id,
                        result,
                        SequenceNr::ANY,
                        payload,
                    ));
                }
                MessageRole::Response | MessageRole::Broadcast => {
                    self.listeners.add(msg_id, SequenceNr::ANY, source.clone());
                }
                _ => {
                    tracing::debug!(
                        "{} asked {} for notifications of {}, not an attribute or response",
                        source,
                        self.address,
                        msg_id
                    );
                    self.post(Envelope::response(
                        self.address.clone(),
                        source.clone(),
                        msg_id,
                        ResultCode::DataInvalid,
                        SequenceNr::ANY,
                        Vec::new(),
                    ));
                }
            },
        }
        Ok(())
    }

    fn fail_caller(&mut self, current: &CurrentRequest, result: ResultCode) {
        self.post(Envelope::response(
            self.address.clone(),
            current.source.clone(),
            current.response,
            result,
            current.seq,
            Vec::new(),
        ));
        // drop only this caller's one-shot entry
        let others: Vec<_> = self
            .listeners
            .take_one_shot(current.response)
            .into_iter()
            .filter(|listener| !(listener.seq == current.seq && listener.consumer == current.source))
            .collect();
        for listener in others {
            self.listeners.add(listener.msg_id, listener.seq, listener.consumer);
        }
    }

    fn fan_out(&self, msg_id: MessageId, result: ResultCode, payload: &[u8]) -> Result<()> {
        for proxy in self.listeners.subscribers(msg_id) {
            self.post(Envelope::response(
                self.address.clone(),
                proxy.clone(),
                msg_id,
                result,
                SequenceNr::ANY,
                payload.to_vec(),
            ));
        }
        Ok(())
    }

    fn post(&self, envelope: Envelope) {
        let target = envelope.target().clone();
        if let Err(e) = self.dispatcher.post(envelope) {
            tracing::warn!("{} could not post to {}: {}", self.address, target, e);
        }
    }

    fn expect_role(&self, msg_id: MessageId, role: MessageRole) -> Result<()> {
        let actual = self.descriptor.role_of(msg_id);
        if actual == role {
            Ok(())
        } else {
            Err(self.violation(msg_id, &format!("expected {role:?}, found {actual:?}")))
        }
    }

    fn violation(&self, msg_id: MessageId, message: &str) -> Error {
        tracing::error!("Protocol violation on {}: {} ({})", self.address, message, msg_id);
        Error::protocol_violation(self.descriptor.service_name(), msg_id, message)
    }
}

/// A stub: interface-independent core plus the interface handler
pub struct Stub<H> {
    core: StubCore,
    handler: H,
}

impl<H: StubHandler> Stub<H> {
    pub fn new(
        descriptor: Arc<InterfaceDescriptor>,
        address: Address,
        dispatcher: Arc<dyn Dispatcher>,
        handler: H,
    ) -> Self {
        Self {
            core: StubCore::new(descriptor, address, dispatcher),
            handler,
        }
    }

    pub fn core(&self) -> &StubCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut StubCore {
        &mut self.core
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run `f` with the handler and the core borrowed together
    pub fn with<R>(&mut self, f: impl FnOnce(&mut H, &mut StubCore) -> R) -> R {
        f(&mut self.handler, &mut self.core)
    }

    /// Dispatch one incoming envelope, then retry deferred requests
    pub fn process_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        let result = match envelope.kind() {
            EnvelopeKind::Request => self.process_request_event(envelope),
            EnvelopeKind::NotifyRequest(kind) => self.core.process_notify_request(envelope, kind),
            EnvelopeKind::Connect => {
                self.client_connected(envelope.source(), true);
                Ok(())
            }
            EnvelopeKind::Disconnect => {
                self.client_connected(envelope.source(), false);
                Ok(())
            }
            EnvelopeKind::Response | EnvelopeKind::ServiceConnection(_) => Err(self
                .core
                .violation(envelope.msg_id(), "stub received a proxy-bound envelope")),
        };
        let deferred = self.process_deferred();
        result.and(deferred)
    }

    /// Execute deferred requests in arrival order while the admission slot
    /// is free. Every one is run; the first error is returned.
    pub fn process_deferred(&mut self) -> Result<()> {
        let mut first_error = None;
        while self.core.can_execute_request() {
            let Some(envelope) = self.core.deferred.pop_front() else {
                break;
            };
            tracing::debug!("Resuming deferred {} from {}", envelope.msg_id(), envelope.source());
            if let Err(e) = self.process_request_event(&envelope) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn process_request_event(&mut self, envelope: &Envelope) -> Result<()> {
        let request = envelope.msg_id();
        let response = self.core.descriptor.response_id(request);
        if response == MessageId::INVALID {
            return Err(self.core.violation(request, "unknown request"));
        }

        if response != MessageId::NOT_PROCESSED {
            if !self.core.can_execute_request() {
                tracing::debug!(
                    "Deferring {} {} from {}, another request is executing",
                    request,
                    envelope.seq(),
                    envelope.source()
                );
                self.core.deferred.push_back(envelope.clone());
                return Ok(());
            }
            self.core
                .listeners
                .add(response, envelope.seq(), envelope.source().clone());
        }

        let current = CurrentRequest {
            request,
            response,
            seq: envelope.seq(),
            source: envelope.source().clone(),
        };
        self.core.current = Some(current.clone());
        let result = self
            .handler
            .process_request(&mut self.core, request, &mut envelope.args());
        self.core.cancel_current_request();

        if let Err(e) = &result {
            tracing::warn!("Request {} on {} failed: {}", request, self.core.address, e);
            if response != MessageId::NOT_PROCESSED && self.core.listeners.has_one_shot(response, &current.source) {
                self.core.fail_caller(&current, ResultCode::RequestError);
            }
        }
        result
    }

    fn client_connected(&mut self, client: &Address, connected: bool) {
        if connected {
            if !self.core.clients.contains(client) {
                self.core.clients.push(client.clone());
            }
            tracing::info!("{} connected to {}", client, self.core.address);
        } else {
            self.core.clients.retain(|known| known != client);
            self.core.listeners.remove_consumer(client);
            self.core.deferred.retain(|envelope| envelope.source() != client);
            tracing::info!("{} disconnected from {}", client, self.core.address);
        }
        self.core.post(Envelope::service_connection(
            self.core.address.clone(),
            client.clone(),
            connected,
        ));
        self.handler.client_connected(&mut self.core, client, connected);
    }
}

/// Object-safe view of a stub used by the dispatcher thread
pub trait StubObject: Any {
    fn core(&self) -> &StubCore;

    fn process_envelope(&mut self, envelope: &Envelope) -> Result<()>;

    fn process_deferred(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<H: StubHandler> StubObject for Stub<H> {
    fn core(&self) -> &StubCore {
        &self.core
    }

    fn process_envelope(&mut self, envelope: &Envelope) -> Result<()> {
        Stub::process_envelope(self, envelope)
    }

    fn process_deferred(&mut self) -> Result<()> {
        Stub::process_deferred(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
