//! Message identifier space and interface descriptors
//!
//! Every service interface partitions its message ids into contiguous
//! ranges: requests, responses (including broadcasts) and attributes. The
//! [`InterfaceDescriptor`] bundles those lists together with the ordered
//! request→response table used for correlation.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Message identifier of a service interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(u32);

impl MessageId {
    pub const REQUEST_FIRST: u32 = 0x0000_0001;
    pub const REQUEST_LAST: u32 = 0x0000_7FFF;
    pub const RESPONSE_FIRST: u32 = 0x0000_8001;
    pub const RESPONSE_LAST: u32 = 0x0000_FFFF;
    pub const ATTRIBUTE_FIRST: u32 = 0x0001_0001;
    pub const ATTRIBUTE_LAST: u32 = 0x0001_7FFF;

    /// Mapped value of requests that never get a response
    pub const NOT_PROCESSED: MessageId = MessageId(0x0002_0000);

    /// Result of a failed lookup
    pub const INVALID: MessageId = MessageId(0xFFFF_FFFF);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Id of the request declared at `index`
    pub const fn request(index: u32) -> Self {
        Self(Self::REQUEST_FIRST + index)
    }

    /// Id of the response or broadcast declared at `index`
    pub const fn response(index: u32) -> Self {
        Self(Self::RESPONSE_FIRST + index)
    }

    /// Id of the attribute declared at `index`
    pub const fn attribute(index: u32) -> Self {
        Self(Self::ATTRIBUTE_FIRST + index)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub fn in_request_range(self) -> bool {
        (Self::REQUEST_FIRST..=Self::REQUEST_LAST).contains(&self.0)
    }

    pub fn in_response_range(self) -> bool {
        (Self::RESPONSE_FIRST..=Self::RESPONSE_LAST).contains(&self.0)
    }

    pub fn in_attribute_range(self) -> bool {
        (Self::ATTRIBUTE_FIRST..=Self::ATTRIBUTE_LAST).contains(&self.0)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MessageId::NOT_PROCESSED => write!(f, "NotProcessed"),
            MessageId::INVALID => write!(f, "Invalid"),
            MessageId(raw) => write!(f, "0x{raw:05X}"),
        }
    }
}

/// Role of a message id within one interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageRole {
    Request,
    Response,
    Broadcast,
    Attribute,
    NotProcessed,
    Invalid,
}

/// Whether the service is reachable only inside the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Locality {
    #[default]
    Local,
    Remote,
}

/// Interface version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Version {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Proxies and stubs interoperate when the major versions agree and the
    /// stub is at least as new as the proxy.
    pub fn is_compatible_with(&self, stub: &Version) -> bool {
        self.major == stub.major && (self.minor, self.patch) <= (stub.minor, stub.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Static description of one service interface
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    service: String,
    version: Version,
    locality: Locality,
    requests: Vec<MessageId>,
    /// Parallel to `requests`: mapped response id or `NOT_PROCESSED`
    request_map: Vec<MessageId>,
    responses: Vec<MessageId>,
    broadcasts: HashSet<MessageId>,
    attributes: Vec<MessageId>,
    /// Request id that failure callbacks for a request or response id go to
    failure_routes: HashMap<MessageId, MessageId>,
}

impl InterfaceDescriptor {
    pub fn builder(service: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            service: service.into(),
            version: Version::default(),
            locality: Locality::default(),
            requests: Vec::new(),
            responses: Vec::new(),
            broadcasts: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn requests(&self) -> &[MessageId] {
        &self.requests
    }

    pub fn responses(&self) -> &[MessageId] {
        &self.responses
    }

    pub fn attributes(&self) -> &[MessageId] {
        &self.attributes
    }

    /// The request→response table in request declaration order
    pub fn request_map(&self) -> impl Iterator<Item = (MessageId, MessageId)> + '_ {
        self.requests
            .iter()
            .copied()
            .zip(self.request_map.iter().copied())
    }

    /// Response paired with `request`, `NOT_PROCESSED` for fire-and-forget
    /// requests and `INVALID` for ids that are not requests of this interface.
    pub fn response_id(&self, request: MessageId) -> MessageId {
        if !request.in_request_range() {
            return MessageId::INVALID;
        }
        let index = (request.value() - MessageId::REQUEST_FIRST) as usize;
        match self.requests.get(index) {
            Some(&declared) if declared == request => self.request_map[index],
            _ => MessageId::INVALID,
        }
    }

    /// First declared request mapped to `response`, `INVALID` if none.
    pub fn request_id(&self, response: MessageId) -> MessageId {
        if response == MessageId::NOT_PROCESSED {
            return MessageId::INVALID;
        }
        self.request_map
            .iter()
            .position(|&mapped| mapped == response)
            .map(|index| self.requests[index])
            .unwrap_or(MessageId::INVALID)
    }

    pub fn is_request(&self, id: MessageId) -> bool {
        self.response_id(id) != MessageId::INVALID
    }

    pub fn is_response(&self, id: MessageId) -> bool {
        self.responses.contains(&id)
    }

    pub fn is_broadcast(&self, id: MessageId) -> bool {
        self.broadcasts.contains(&id)
    }

    pub fn is_attribute(&self, id: MessageId) -> bool {
        self.attributes.contains(&id)
    }

    pub fn role_of(&self, id: MessageId) -> MessageRole {
        if id == MessageId::NOT_PROCESSED {
            MessageRole::NotProcessed
        } else if self.is_request(id) {
            MessageRole::Request
        } else if self.is_broadcast(id) {
            MessageRole::Broadcast
        } else if self.is_response(id) {
            MessageRole::Response
        } else if self.is_attribute(id) {
            MessageRole::Attribute
        } else {
            MessageRole::Invalid
        }
    }

    /// Request that a failure reported under `id` belongs to
    pub fn failure_route(&self, id: MessageId) -> Option<MessageId> {
        self.failure_routes.get(&id).copied()
    }
}

/// Builder for [`InterfaceDescriptor`]
#[derive(Debug, Clone)]
pub struct DescriptorBuilder {
    service: String,
    version: Version,
    locality: Locality,
    requests: Vec<(MessageId, MessageId)>,
    responses: Vec<MessageId>,
    broadcasts: Vec<MessageId>,
    attributes: Vec<MessageId>,
}

impl DescriptorBuilder {
    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn locality(mut self, locality: Locality) -> Self {
        self.locality = locality;
        self
    }

    /// Declare a request; `None` marks it fire-and-forget
    pub fn request(mut self, id: MessageId, response: Option<MessageId>) -> Self {
        self.requests
            .push((id, response.unwrap_or(MessageId::NOT_PROCESSED)));
        self
    }

    pub fn response(mut self, id: MessageId) -> Self {
        self.responses.push(id);
        self
    }

    pub fn broadcast(mut self, id: MessageId) -> Self {
        self.responses.push(id);
        self.broadcasts.push(id);
        self
    }

    pub fn attribute(mut self, id: MessageId) -> Self {
        self.attributes.push(id);
        self
    }

    /// Validate the tables and build the descriptor
    pub fn build(self) -> Result<Arc<InterfaceDescriptor>> {
        self.validate()?;
        Ok(self.build_unchecked())
    }

    /// Build without validation. Used by derived interfaces, whose tables
    /// are checked at compile time.
    #[doc(hidden)]
    pub fn build_unchecked(self) -> Arc<InterfaceDescriptor> {
        let mut failure_routes = HashMap::new();
        for &(request, response) in &self.requests {
            failure_routes.insert(request, request);
            if response != MessageId::NOT_PROCESSED {
                // first declared request wins on collisions
                failure_routes.entry(response).or_insert(request);
            }
        }

        Arc::new(InterfaceDescriptor {
            service: self.service,
            version: self.version,
            locality: self.locality,
            requests: self.requests.iter().map(|&(request, _)| request).collect(),
            request_map: self.requests.iter().map(|&(_, response)| response).collect(),
            responses: self.responses,
            broadcasts: self.broadcasts.into_iter().collect(),
            attributes: self.attributes,
            failure_routes,
        })
    }

    fn validate(&self) -> Result<()> {
        let invalid = |message: String, field: &str| {
            Err(Error::configuration(
                format!("interface '{}': {message}", self.service),
                Some(field.to_string()),
            ))
        };

        if self.service.is_empty() {
            return invalid("service name is empty".to_string(), "service");
        }

        let mut seen = HashSet::new();
        for (index, &(request, _)) in self.requests.iter().enumerate() {
            if request != MessageId::request(index as u32) {
                return invalid(
                    format!("request {request} is not declared at position {index}"),
                    "requests",
                );
            }
            seen.insert(request);
        }
        for &response in &self.responses {
            if !response.in_response_range() || !seen.insert(response) {
                return invalid(format!("bad or duplicate response id {response}"), "responses");
            }
        }
        for &attribute in &self.attributes {
            if !attribute.in_attribute_range() || !seen.insert(attribute) {
                return invalid(
                    format!("bad or duplicate attribute id {attribute}"),
                    "attributes",
                );
            }
        }

        let mut mapped = HashSet::new();
        for &(request, response) in &self.requests {
            if response == MessageId::NOT_PROCESSED {
                continue;
            }
            if !self.responses.contains(&response) || self.broadcasts.contains(&response) {
                return invalid(
                    format!("request {request} maps to undeclared response {response}"),
                    "requests",
                );
            }
            if !mapped.insert(response) {
                tracing::warn!(
                    "interface '{}': response {} is mapped by more than one request, reverse lookup picks the first",
                    self.service,
                    response
                );
            }
        }

        Ok(())
    }
}

/// A per-interface message id enum, usually derived with
/// `#[derive(ServiceInterface)]`.
pub trait ServiceInterface: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Shared descriptor of the interface
    fn descriptor() -> Arc<InterfaceDescriptor>;

    fn id(self) -> MessageId;

    fn from_id(id: MessageId) -> Option<Self>;
}
