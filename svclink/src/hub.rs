//! Hub - dispatcher threads and the router between them

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::{
    config::HubConfig,
    dispatcher::{Dispatcher, DispatcherThread},
    message::{Address, Envelope, EnvelopeKind},
    Error, Result,
};

/// Work queued for a dispatcher thread
pub enum ThreadCommand {
    Envelope(Envelope),
    Run(Box<dyn FnOnce(&mut DispatcherThread) + Send>),
    Shutdown,
}

/// Routes envelopes to the queue of the thread that hosts their target
pub struct Router {
    config: HubConfig,
    threads: DashMap<String, mpsc::UnboundedSender<ThreadCommand>>,
    /// Role → address of the stub serving it
    stubs: DashMap<String, Address>,
    /// Connects waiting for a stub of their role
    parked: DashMap<String, Vec<Envelope>>,
}

impl Router {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            threads: DashMap::new(),
            stubs: DashMap::new(),
            parked: DashMap::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn register_thread(
        &self,
        name: &str,
        sender: mpsc::UnboundedSender<ThreadCommand>,
    ) -> Result<()> {
        if self.threads.contains_key(name) {
            return Err(Error::configuration(
                format!("thread '{name}' already exists"),
                Some("threads".to_string()),
            ));
        }
        self.threads.insert(name.to_string(), sender);
        Ok(())
    }

    pub fn unregister_thread(&self, name: &str) {
        self.threads.remove(name);
        self.stubs.retain(|_, address| address.thread() != name);
        self.parked.retain(|_, parked| {
            parked.retain(|connect| connect.source().thread() != name);
            !parked.is_empty()
        });
    }

    pub fn thread_names(&self) -> Vec<String> {
        self.threads.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Address of the stub serving `role`, if any
    pub fn stub_address(&self, role: &str) -> Option<Address> {
        self.stubs.get(role).map(|entry| entry.value().clone())
    }

    /// Number of connects waiting for a stub of `role`
    pub fn parked_len(&self, role: &str) -> usize {
        self.parked.get(role).map_or(0, |entry| entry.len())
    }

    /// Queue a command for a thread
    pub fn send(&self, thread: &str, command: ThreadCommand) -> Result<()> {
        let sender = self
            .threads
            .get(thread)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::thread_not_found(thread))?;
        sender
            .send(command)
            .map_err(|_| Error::routing_msg(format!("queue of thread '{thread}' is closed")))
    }

    fn undeliverable(&self, envelope: Envelope) -> Result<()> {
        let role = envelope.target().role().to_string();
        if envelope.kind() == EnvelopeKind::Connect {
            tracing::debug!("⏸️  Parking connect of {} until '{}' is served", envelope.source(), role);
            self.parked.entry(role.clone()).or_default().push(envelope);
            // the stub may have registered meanwhile
            if self.stubs.contains_key(&role) {
                self.replay(&role);
            }
            return Ok(());
        }
        if envelope.kind() == EnvelopeKind::Disconnect {
            self.withdraw(&role, envelope.source());
            return Ok(());
        }

        match envelope.undelivered() {
            Some(reply) if self.config.bounce_undelivered => {
                tracing::warn!("No stub serves '{}', bouncing {} to {}", role, envelope.msg_id(), reply.target());
                self.post(reply)
            }
            _ => {
                tracing::warn!("No stub serves '{}', {:?} {} dropped", role, envelope.kind(), envelope.msg_id());
                Ok(())
            }
        }
    }

    fn withdraw(&self, role: &str, source: &Address) {
        let withdrawn = match self.parked.get_mut(role) {
            Some(mut parked) => {
                let before = parked.len();
                parked.retain(|connect| connect.source() != source);
                before - parked.len()
            }
            None => 0,
        };
        self.parked.remove_if(role, |_, parked| parked.is_empty());
        if withdrawn > 0 {
            tracing::debug!("Withdrew parked connect of {} for '{}'", source, role);
        }
    }

    fn replay(&self, role: &str) {
        let Some((_, parked)) = self.parked.remove(role) else {
            return;
        };
        for envelope in parked {
            if let Err(e) = self.post(envelope) {
                tracing::warn!("Could not replay connect for '{}': {}", role, e);
            }
        }
    }
}

impl Dispatcher for Router {
    fn post(&self, envelope: Envelope) -> Result<()> {
        if self.config.log_envelopes {
            tracing::debug!(
                "📨 {} {:?} {} {} {} -> {}",
                envelope.id(),
                envelope.kind(),
                envelope.msg_id(),
                envelope.seq(),
                envelope.source(),
                envelope.target()
            );
        }

        let target = envelope.target();
        let thread = if target.is_stub() {
            match self.stub_address(target.role()) {
                Some(address) => address.thread().to_string(),
                None => return self.undeliverable(envelope),
            }
        } else {
            target.thread().to_string()
        };
        self.send(&thread, ThreadCommand::Envelope(envelope))
    }

    fn stub_registered(&self, address: &Address) {
        self.stubs.insert(address.role().to_string(), address.clone());
        self.replay(address.role());
    }

    fn stub_unregistered(&self, address: &Address) {
        self.stubs
            .remove_if(address.role(), |_, known| known == address);
    }
}

/// Owner of the dispatcher threads of one process
pub struct Hub {
    name: String,
    router: Arc<Router>,
    threads: HashMap<String, JoinHandle<()>>,
}

impl Hub {
    /// Create a hub without threads
    pub fn new(config: HubConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!("🏗️  Creating hub '{}'", config.name);
        Ok(Self {
            name: config.name.clone(),
            router: Arc::new(Router::new(config)),
            threads: HashMap::new(),
        })
    }

    /// Create a hub and spawn every thread listed in the configuration
    pub fn start(config: HubConfig) -> Result<Self> {
        let names = config.threads.clone();
        let mut hub = Self::new(config)?;
        for name in names {
            hub.spawn_thread(&name)?;
        }
        Ok(hub)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Spawn a dispatcher thread: one OS thread running a current-thread
    /// runtime that drains the thread's queue in order.
    pub fn spawn_thread(&mut self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::configuration("thread name is empty", Some("threads".to_string())));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.router.register_thread(name, sender)?;

        let router = self.router.clone();
        let thread_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.name, name))
            .spawn(move || run_thread(thread_name, router, receiver));
        match spawned {
            Ok(handle) => {
                self.threads.insert(name.to_string(), handle);
                Ok(())
            }
            Err(e) => {
                self.router.unregister_thread(name);
                Err(Error::runtime(format!("failed to spawn thread '{name}'"), e))
            }
        }
    }

    /// Run `f` on a dispatcher thread without waiting for it
    pub fn run_on<F>(&self, thread: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut DispatcherThread) + Send + 'static,
    {
        self.router.send(thread, ThreadCommand::Run(Box::new(f)))
    }

    /// Run `f` on a dispatcher thread and wait for its result
    pub async fn call_on<F, R>(&self, thread: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut DispatcherThread) -> R + Send + 'static,
        R: Send + 'static,
    {
        let receiver = self.submit(thread, f)?;
        receiver
            .await
            .map_err(|e| Error::runtime(format!("thread '{thread}' dropped the call"), e))
    }

    /// Like [`call_on`](Self::call_on), giving up after `timeout`. The
    /// closure still runs once the thread gets to it.
    pub async fn call_on_timeout<F, R>(&self, thread: &str, timeout: Duration, f: F) -> Result<R>
    where
        F: FnOnce(&mut DispatcherThread) -> R + Send + 'static,
        R: Send + 'static,
    {
        let receiver = self.submit(thread, f)?;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(result) => {
                result.map_err(|e| Error::runtime(format!("thread '{thread}' dropped the call"), e))
            }
            Err(_) => {
                tracing::warn!("⏰ Call on thread '{}' timed out", thread);
                Err(Error::timeout(
                    format!("call on thread '{thread}'"),
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Blocking variant of [`call_on`](Self::call_on), for callers outside
    /// any async runtime
    pub fn call_on_blocking<F, R>(&self, thread: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut DispatcherThread) -> R + Send + 'static,
        R: Send + 'static,
    {
        let receiver = self.submit(thread, f)?;
        receiver
            .blocking_recv()
            .map_err(|e| Error::runtime(format!("thread '{thread}' dropped the call"), e))
    }

    fn submit<F, R>(&self, thread: &str, f: F) -> Result<oneshot::Receiver<R>>
    where
        F: FnOnce(&mut DispatcherThread) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.run_on(thread, move |dispatcher| {
            let _ = sender.send(f(dispatcher));
        })?;
        Ok(receiver)
    }

    /// Stop every dispatcher thread and wait for it to finish
    pub fn shutdown(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            return Ok(());
        }
        tracing::info!("🛑 Shutting down hub '{}'", self.name);
        for name in self.threads.keys() {
            if let Err(e) = self.router.send(name, ThreadCommand::Shutdown) {
                tracing::warn!("Could not stop thread '{}': {}", name, e);
            }
        }

        let mut failed = Vec::new();
        for (name, handle) in self.threads.drain() {
            if handle.join().is_err() {
                tracing::error!("Thread '{}' panicked", name);
                failed.push(name);
            }
        }
        tracing::info!("🛑 Hub shutdown complete: {}", self.name);
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::runtime_msg(format!("threads panicked: {}", failed.join(", "))))
        }
    }
}

impl Drop for Hub {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("Hub '{}' did not shut down cleanly: {}", self.name, e);
        }
    }
}

fn run_thread(
    name: String,
    router: Arc<Router>,
    mut commands: mpsc::UnboundedReceiver<ThreadCommand>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create runtime for thread '{}': {}", name, e);
            router.unregister_thread(&name);
            return;
        }
    };

    let dispatcher: Arc<dyn Dispatcher> = router.clone();
    let mut thread = DispatcherThread::new(name.clone(), dispatcher);
    runtime.block_on(async {
        tracing::info!("🔄 Dispatcher thread '{}' started", name);
        while let Some(command) = commands.recv().await {
            match command {
                ThreadCommand::Envelope(envelope) => {
                    if let Err(e) = thread.dispatch(envelope) {
                        tracing::warn!("Thread '{}' failed to dispatch: {}", name, e);
                    }
                }
                ThreadCommand::Run(task) => {
                    task(&mut thread);
                    if let Err(e) = thread.flush() {
                        tracing::warn!("Thread '{}' failed to deliver: {}", name, e);
                    }
                }
                ThreadCommand::Shutdown => break,
            }
        }
    });

    thread.shutdown();
    router.unregister_thread(&name);
    tracing::info!("Dispatcher thread '{}' stopped", name);
}
