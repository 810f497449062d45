//! Consumer side wrapper over a shared proxy
//!
//! [`ClientBase`] gives one consumer typed access to its proxy and sorts
//! every notification into exactly one [`ClientHandler`] callback.

use crate::ids::{InterfaceDescriptor, MessageId, MessageRole};
use crate::message::{DataState, ResultCode, SequenceNr};
use crate::proxy::{ConsumerId, ProxyEvent, ProxyHandle};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// Callbacks of one consumer. Every hook defaults to a no-op.
#[allow(unused_variables)]
pub trait ClientHandler: 'static {
    /// The service became available or went away
    fn service_connected(&mut self, client: &ClientBase, connected: bool) {}

    /// A response arrived; its parameters are in the proxy cache
    fn on_response(&mut self, client: &ClientBase, response: MessageId, seq: SequenceNr) {}

    /// A broadcast arrived; its parameters are in the proxy cache
    fn on_broadcast(&mut self, client: &ClientBase, broadcast: MessageId) {}

    /// An attribute changed; read it with [`ClientBase::attribute`]
    fn on_attribute_update(&mut self, client: &ClientBase, attribute: MessageId, state: DataState) {}

    /// A request failed with busy, error, canceled or undelivered
    fn request_failed(&mut self, client: &ClientBase, request: MessageId, reason: ResultCode) {}

    fn invalid_response(&mut self, client: &ClientBase, response: MessageId) {}

    fn invalid_request(&mut self, client: &ClientBase, request: MessageId) {}
}

/// One consumer's handle on its proxy
#[derive(Clone)]
pub struct ClientBase {
    consumer: ConsumerId,
    proxy: ProxyHandle,
}

impl ClientBase {
    pub fn new(consumer: ConsumerId, proxy: ProxyHandle) -> Self {
        Self { consumer, proxy }
    }

    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub fn proxy(&self) -> &ProxyHandle {
        &self.proxy
    }

    pub fn descriptor(&self) -> Arc<InterfaceDescriptor> {
        self.proxy.borrow().descriptor()
    }

    pub fn role(&self) -> String {
        self.proxy.borrow().address().role().to_string()
    }

    pub fn is_connected(&self) -> bool {
        self.proxy.borrow().is_connected()
    }

    /// Send `request` with its arguments; pass a tuple for several
    /// arguments, in declared order.
    pub fn request<T: Serialize + ?Sized>(&self, request: MessageId, args: &T) -> Result<SequenceNr> {
        let payload = crate::message::to_payload(args)?;
        self.request_payload(request, payload)
    }

    pub fn request_payload(&self, request: MessageId, payload: Vec<u8>) -> Result<SequenceNr> {
        self.proxy
            .borrow_mut()
            .send_request(self.consumer, request, payload)
    }

    /// Start (`notify = true`) or stop notifications of `msg_id`
    pub fn notify_on(&self, msg_id: MessageId, notify: bool) -> Result<()> {
        self.notify_on_with(msg_id, notify, false)
    }

    /// Like [`notify_on`](Self::notify_on); `always` asks for a delivery of
    /// the cached value even when already registered.
    pub fn notify_on_with(&self, msg_id: MessageId, notify: bool, always: bool) -> Result<()> {
        let mut proxy = self.proxy.borrow_mut();
        if notify {
            proxy.set_notification(msg_id, self.consumer, always)
        } else {
            proxy.clear_notification(msg_id, self.consumer);
            Ok(())
        }
    }

    pub fn clear_all_notifications(&self) {
        self.proxy
            .borrow_mut()
            .clear_all_notifications(self.consumer);
    }

    pub fn data_state(&self, msg_id: MessageId) -> DataState {
        self.proxy.borrow().data_state(msg_id)
    }

    /// Cached attribute value and its state. The value is `None` unless the
    /// state is `Ok`.
    pub fn attribute<T: DeserializeOwned>(&self, attribute: MessageId) -> Result<(Option<T>, DataState)> {
        let proxy = self.proxy.borrow();
        Ok((proxy.value(attribute)?, proxy.data_state(attribute)))
    }

    /// Cached parameters of the last response or broadcast `msg_id`
    pub fn response<T: DeserializeOwned>(&self, msg_id: MessageId) -> Result<Option<T>> {
        self.proxy.borrow().value(msg_id)
    }

    /// Route one notification to exactly one handler callback
    pub fn process_notification<H: ClientHandler + ?Sized>(
        &self,
        handler: &mut H,
        event: ProxyEvent,
    ) -> Result<()> {
        let (msg_id, result, seq) = match event {
            ProxyEvent::ServiceConnected(connected) => {
                handler.service_connected(self, connected);
                return Ok(());
            }
            ProxyEvent::Message {
                msg_id,
                result,
                seq,
            } => (msg_id, result, seq),
        };

        let descriptor = self.descriptor();
        let role = descriptor.role_of(msg_id);
        match (result, role) {
            (
                ResultCode::RequestBusy
                | ResultCode::RequestError
                | ResultCode::RequestCanceled
                | ResultCode::MessageUndelivered,
                _,
            ) => match descriptor.failure_route(msg_id) {
                Some(request) => handler.request_failed(self, request, result),
                None if role == MessageRole::Attribute => {
                    handler.on_attribute_update(self, msg_id, DataState::Invalid)
                }
                None if role == MessageRole::Broadcast => handler.invalid_response(self, msg_id),
                None => return Err(self.violation(&descriptor, msg_id, result)),
            },
            (ResultCode::RequestInvalid, MessageRole::Request) => handler.invalid_request(self, msg_id),
            (
                ResultCode::RequestInvalid,
                MessageRole::Response | MessageRole::Broadcast | MessageRole::Attribute,
            ) => handler.invalid_response(self, msg_id),
            (ResultCode::DataOk | ResultCode::DataInvalid, MessageRole::Attribute) => {
                let state = match (result, self.data_state(msg_id)) {
                    (ResultCode::DataOk, state) => state,
                    (_, DataState::Ok) => DataState::Invalid,
                    (_, state) => state,
                };
                handler.on_attribute_update(self, msg_id, state)
            }
            (ResultCode::DataInvalid, MessageRole::Response | MessageRole::Broadcast) => {
                handler.invalid_response(self, msg_id)
            }
            (ResultCode::RequestOk, MessageRole::Response) => handler.on_response(self, msg_id, seq),
            (ResultCode::RequestOk, MessageRole::Broadcast) => handler.on_broadcast(self, msg_id),
            _ => return Err(self.violation(&descriptor, msg_id, result)),
        }
        Ok(())
    }

    fn violation(&self, descriptor: &InterfaceDescriptor, msg_id: MessageId, result: ResultCode) -> Error {
        tracing::error!(
            "{} cannot route {} with result {} on '{}'",
            self.consumer,
            msg_id,
            result,
            descriptor.service_name()
        );
        Error::protocol_violation(
            descriptor.service_name(),
            msg_id,
            format!("no client callback for result {result}"),
        )
    }
}

/// A consumer: its proxy handle plus its callbacks
pub struct Client<H> {
    base: ClientBase,
    handler: H,
}

impl<H: ClientHandler> Client<H> {
    pub fn new(base: ClientBase, handler: H) -> Self {
        Self { base, handler }
    }

    pub fn base(&self) -> &ClientBase {
        &self.base
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Run `f` with the handler and the client base borrowed together
    pub fn with<R>(&mut self, f: impl FnOnce(&mut H, &ClientBase) -> R) -> R {
        f(&mut self.handler, &self.base)
    }
}

/// Object-safe view of a consumer used by the dispatcher thread
pub trait ConsumerObject: Any {
    fn base(&self) -> &ClientBase;

    fn process_notification(&mut self, event: ProxyEvent) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<H: ClientHandler> ConsumerObject for Client<H> {
    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn process_notification(&mut self, event: ProxyEvent) -> Result<()> {
        self.base.process_notification(&mut self.handler, event)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
