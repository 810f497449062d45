//! # svclink - service interfaces between stubs and proxies
//!
//! A service is described by an interface: numbered requests, responses,
//! broadcasts and attributes. A [`Stub`] serves the interface, a [`Proxy`]
//! represents it on every dispatcher thread that uses it, and consumers
//! built on [`ClientBase`] receive typed callbacks.
//!
//! ## Quick Start
//!
//! Declare the interface with `#[derive(ServiceInterface)]`:
//!
//! ```rust,ignore
//! use svclink::{ServiceInterface, StubCore, StubHandler, PayloadReader, MessageId, Result};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, ServiceInterface)]
//! #[service(name = "HelloWorld", version = "1.0.0")]
//! pub enum HelloWorld {
//!     #[request(response = HelloResponse)]
//!     Hello,
//!     #[response]
//!     HelloResponse,
//!     #[attribute]
//!     Greetings,
//! }
//!
//! struct Greeter {
//!     count: u32,
//! }
//!
//! impl StubHandler for Greeter {
//!     fn process_request(
//!         &mut self,
//!         stub: &mut StubCore,
//!         request: MessageId,
//!         args: &mut PayloadReader<'_>,
//!     ) -> Result<()> {
//!         let name: String = args.read()?;
//!         self.count += 1;
//!         stub.set_attribute(HelloWorld::Greetings.id(), &self.count)?;
//!         stub.send_response(HelloWorld::HelloResponse.id(), &format!("hello {name}"))
//!     }
//! }
//! ```
//!
//! Host it on a [`Hub`] thread and talk to it from another:
//!
//! ```rust,ignore
//! let mut hub = Hub::start(HubConfig::new("demo").with_thread("service").with_thread("ui"))?;
//! hub.call_on("service", |thread| {
//!     thread.register_stub(HelloWorld::descriptor(), "greeter", Greeter { count: 0 })
//! })
//! .await??;
//! hub.call_on("ui", |thread| {
//!     let consumer = thread.connect_client(HelloWorld::descriptor(), "greeter", MyClient)?;
//!     thread.with_client::<MyClient, _>(consumer, |_, client| {
//!         client.notify_on(HelloWorld::Greetings.id(), true)?;
//!         client.request(HelloWorld::Hello.id(), "world")
//!     })?
//! })
//! .await??;
//! ```

extern crate self as svclink;

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hub;
pub mod ids;
pub mod message;
pub mod proxy;
pub mod registry;
pub mod stub;

#[cfg(test)]
mod tests;


// Re-exports
pub use client::{Client, ClientBase, ClientHandler, ConsumerObject};
pub use config::HubConfig;
pub use dispatcher::{Dispatcher, DispatcherThread, QueueDispatcher};
pub use error::{Error, Result};
pub use hub::{Hub, Router, ThreadCommand};
pub use ids::{
    DescriptorBuilder, InterfaceDescriptor, Locality, MessageId, MessageRole, ServiceInterface,
    Version,
};
pub use message::{
    from_payload, to_payload, Address, DataState, Endpoint, Envelope, EnvelopeKind, NotifyKind,
    PayloadReader, PayloadWriter, ResultCode, SequenceNr,
};
pub use proxy::{ConsumerId, Notification, Proxy, ProxyEvent, ProxyHandle, ProxyRegistry};
pub use registry::{Listener, ListenerRegistry};
pub use stub::{CurrentRequest, Stub, StubCore, StubHandler, StubObject};

// Re-export the derive when the feature is enabled
#[cfg(feature = "macros")]
pub use svclink_macros::ServiceInterface;

// Used by derived code
#[doc(hidden)]
pub use once_cell;

// Re-export commonly used dependencies
pub use bincode;
pub use serde::{Deserialize, Serialize};
