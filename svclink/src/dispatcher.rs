//! Per-thread dispatching of envelopes
//!
//! A [`DispatcherThread`] owns the stubs, proxies and consumers living on
//! one thread and runs every incoming envelope to completion before the
//! next one. Outgoing envelopes leave through a [`Dispatcher`].

use crate::client::{Client, ClientBase, ClientHandler, ConsumerObject};
use crate::ids::InterfaceDescriptor;
use crate::message::{Address, Envelope};
use crate::proxy::{ConsumerId, Notification, ProxyHandle, ProxyRegistry};
use crate::stub::{Stub, StubCore, StubHandler, StubObject};
use crate::{Error, Result};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Outgoing side of the runtime. Posting never runs the target inline.
pub trait Dispatcher: Send + Sync + 'static {
    /// Queue an envelope for its target
    fn post(&self, envelope: Envelope) -> Result<()>;

    /// A stub became reachable at `address`
    fn stub_registered(&self, _address: &Address) {}

    /// The stub at `address` went away
    fn stub_unregistered(&self, _address: &Address) {}
}

/// In-memory FIFO dispatcher, drained by hand
#[derive(Debug, Default)]
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<Envelope>>,
}

impl QueueDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.lock().pop_front()
    }

    pub fn drain(&self) -> Vec<Envelope> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Dispatch queued envelopes on `thread` until the queue is empty.
    /// Returns the number of envelopes processed, or the first dispatch
    /// error once the queue is drained.
    pub fn run_until_idle(&self, thread: &mut DispatcherThread) -> Result<usize> {
        let mut processed = 0;
        let mut first_error = None;
        while let Some(envelope) = self.pop() {
            if let Err(e) = thread.dispatch(envelope) {
                first_error.get_or_insert(e);
            }
            processed += 1;
        }
        first_error.map_or(Ok(processed), Err)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Envelope>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Dispatcher for QueueDispatcher {
    fn post(&self, envelope: Envelope) -> Result<()> {
        self.lock().push_back(envelope);
        Ok(())
    }
}

/// Stubs, proxies and consumers of one dispatcher thread
pub struct DispatcherThread {
    name: String,
    dispatcher: Arc<dyn Dispatcher>,
    stubs: HashMap<String, Box<dyn StubObject>>,
    proxies: ProxyRegistry,
    consumers: BTreeMap<ConsumerId, Box<dyn ConsumerObject>>,
    next_consumer: u32,
}

impl DispatcherThread {
    pub fn new(name: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let name = name.into();
        Self {
            proxies: ProxyRegistry::new(name.clone(), dispatcher.clone()),
            name,
            dispatcher,
            stubs: HashMap::new(),
            consumers: BTreeMap::new(),
            next_consumer: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Host a service under `role`
    pub fn register_stub<H: StubHandler>(
        &mut self,
        descriptor: Arc<InterfaceDescriptor>,
        role: &str,
        handler: H,
    ) -> Result<Address> {
        if role.is_empty() {
            return Err(Error::configuration("role name is empty", Some("role".to_string())));
        }
        if self.stubs.contains_key(role) {
            return Err(Error::configuration(
                format!("role '{role}' is already registered on thread '{}'", self.name),
                Some("role".to_string()),
            ));
        }

        let address = Address::stub(descriptor.service_name(), role, self.name.as_str());
        let stub = Stub::new(descriptor, address.clone(), self.dispatcher.clone(), handler);
        self.stubs.insert(role.to_string(), Box::new(stub));
        self.dispatcher.stub_registered(&address);
        tracing::info!("Registered {}", address);
        Ok(address)
    }

    /// Stop hosting `role`; connected proxies are told the service is gone
    pub fn unregister_stub(&mut self, role: &str) -> Result<()> {
        let stub = self
            .stubs
            .remove(role)
            .ok_or_else(|| Error::service_not_found(role))?;
        let address = stub.core().address().clone();
        self.dispatcher.stub_unregistered(&address);
        for client in stub.core().clients() {
            if let Err(e) = self.dispatcher.post(Envelope::service_connection(
                address.clone(),
                client.clone(),
                false,
            )) {
                tracing::warn!("Could not tell {} that {} is gone: {}", client, address, e);
            }
        }
        tracing::info!("Unregistered {}", address);
        Ok(())
    }

    /// Create a consumer of the service at `role`, sharing this thread's
    /// proxy for that role.
    pub fn connect_client<H: ClientHandler>(
        &mut self,
        descriptor: Arc<InterfaceDescriptor>,
        role: &str,
        handler: H,
    ) -> Result<ConsumerId> {
        let proxy = self.proxies.find_or_create(descriptor, role)?;
        let consumer = ConsumerId(self.next_consumer);
        self.next_consumer += 1;
        proxy.borrow_mut().attach(consumer);
        let client = Client::new(ClientBase::new(consumer, proxy), handler);
        self.consumers.insert(consumer, Box::new(client));
        tracing::debug!("{} attached to '{}' on thread '{}'", consumer, role, self.name);
        self.flush()?;
        Ok(consumer)
    }

    /// Remove a consumer; the proxy goes away with its last consumer
    pub fn disconnect_client(&mut self, consumer: ConsumerId) -> Result<()> {
        let client = self
            .consumers
            .remove(&consumer)
            .ok_or(Error::ConsumerNotFound {
                consumer: consumer.0,
            })?;
        let base = client.base();
        let role = base.role();
        let orphaned = {
            let mut proxy = base.proxy().borrow_mut();
            proxy.detach(consumer);
            proxy.consumers().is_empty()
        };
        if orphaned {
            self.proxies.remove(&role);
        }
        tracing::debug!("{} detached from '{}'", consumer, role);
        Ok(())
    }

    pub fn client<H: ClientHandler>(&self, consumer: ConsumerId) -> Option<&Client<H>> {
        self.consumers.get(&consumer)?.as_any().downcast_ref()
    }

    pub fn stub<H: StubHandler>(&self, role: &str) -> Option<&Stub<H>> {
        self.stubs.get(role)?.as_any().downcast_ref()
    }

    pub fn stub_core(&self, role: &str) -> Option<&StubCore> {
        self.stubs.get(role).map(|stub| stub.core())
    }

    pub fn proxy(&self, role: &str) -> Option<ProxyHandle> {
        self.proxies.get(role)
    }

    /// Run `f` against a consumer, then deliver whatever it caused locally
    pub fn with_client<H: ClientHandler, R>(
        &mut self,
        consumer: ConsumerId,
        f: impl FnOnce(&mut H, &ClientBase) -> R,
    ) -> Result<R> {
        let client = self
            .consumers
            .get_mut(&consumer)
            .and_then(|client| client.as_any_mut().downcast_mut::<Client<H>>())
            .ok_or(Error::ConsumerNotFound {
                consumer: consumer.0,
            })?;
        let result = client.with(f);
        self.flush()?;
        Ok(result)
    }

    /// Run `f` against a hosted stub, then retry its deferred requests
    pub fn with_stub<H: StubHandler, R>(
        &mut self,
        role: &str,
        f: impl FnOnce(&mut H, &mut StubCore) -> R,
    ) -> Result<R> {
        let stub = self
            .stubs
            .get_mut(role)
            .and_then(|stub| stub.as_any_mut().downcast_mut::<Stub<H>>())
            .ok_or_else(|| Error::service_not_found(role))?;
        let result = stub.with(f);
        stub.process_deferred()?;
        Ok(result)
    }

    /// Process one envelope addressed to this thread
    pub fn dispatch(&mut self, envelope: Envelope) -> Result<()> {
        let target = envelope.target();
        let result = if target.is_stub() {
            match self.stubs.get_mut(target.role()) {
                Some(stub) => stub.process_envelope(&envelope),
                None => {
                    self.bounce(&envelope);
                    Ok(())
                }
            }
        } else {
            match self.proxies.get(target.role()) {
                Some(proxy) => {
                    let notifications = proxy.borrow_mut().process_envelope(&envelope);
                    notifications.and_then(|notifications| self.deliver(notifications))
                }
                None => {
                    tracing::debug!("No proxy for {} on '{}', {} dropped", target, self.name, envelope.msg_id());
                    Ok(())
                }
            }
        };
        let flushed = self.flush();
        result.and(flushed)
    }

    /// Hand notifications to their consumers. Every notification is
    /// delivered; the first callback error is returned.
    pub fn deliver(&mut self, notifications: Vec<Notification>) -> Result<()> {
        let mut first_error = None;
        for notification in notifications {
            let Some(consumer) = self.consumers.get_mut(&notification.consumer) else {
                tracing::trace!("{} is gone, {:?} dropped", notification.consumer, notification.event);
                continue;
            };
            if let Err(e) = consumer.process_notification(notification.event) {
                tracing::warn!("{} failed on {:?}: {}", notification.consumer, notification.event, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Deliver notifications the proxies produced without an envelope
    pub fn flush(&mut self) -> Result<()> {
        loop {
            let pending: Vec<Notification> = self
                .proxies
                .handles()
                .flat_map(|proxy| proxy.borrow_mut().take_local_notifications())
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            self.deliver(pending)?;
        }
    }

    /// Disconnect every consumer and unregister every stub
    pub fn shutdown(&mut self) {
        let consumers: Vec<ConsumerId> = self.consumers.keys().copied().collect();
        for consumer in consumers {
            if let Err(e) = self.disconnect_client(consumer) {
                tracing::warn!("Could not disconnect {}: {}", consumer, e);
            }
        }
        let roles: Vec<String> = self.stubs.keys().cloned().collect();
        for role in roles {
            if let Err(e) = self.unregister_stub(&role) {
                tracing::warn!("Could not unregister '{}': {}", role, e);
            }
        }
        tracing::info!("Dispatcher thread '{}' shut down", self.name);
    }

    pub fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    fn bounce(&self, envelope: &Envelope) {
        match envelope.undelivered() {
            Some(reply) => {
                tracing::debug!("No stub for {} on '{}', bouncing {}", envelope.target(), self.name, envelope.msg_id());
                if let Err(e) = self.dispatcher.post(reply) {
                    tracing::warn!("Could not bounce {}: {}", envelope.msg_id(), e);
                }
            }
            None => tracing::debug!("No stub for {} on '{}', {:?} dropped", envelope.target(), self.name, envelope.kind()),
        }
    }
}
