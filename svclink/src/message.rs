//! Envelope types and argument serialization
//!
//! An [`Envelope`] is the only thing that travels between a proxy and a
//! stub. Its payload is the interface arguments written back to back in
//! declared order, without tags or per-field lengths: producer and consumer
//! must agree on the field list.

use crate::ids::MessageId;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Which side of an interface an address belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Stub,
    Proxy,
}

/// Address of a stub or a proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    service: String,
    role: String,
    thread: String,
    endpoint: Endpoint,
}

impl Address {
    pub fn stub(service: impl Into<String>, role: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            role: role.into(),
            thread: thread.into(),
            endpoint: Endpoint::Stub,
        }
    }

    pub fn proxy(service: impl Into<String>, role: impl Into<String>, thread: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            role: role.into(),
            thread: thread.into(),
            endpoint: Endpoint::Proxy,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    /// Dispatcher thread name; empty for a stub whose thread is not known yet
    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn is_stub(&self) -> bool {
        self.endpoint == Endpoint::Stub
    }

    pub fn is_proxy(&self) -> bool {
        self.endpoint == Endpoint::Proxy
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.endpoint {
            Endpoint::Stub => "stub",
            Endpoint::Proxy => "proxy",
        };
        write!(f, "{kind}:{}/{}@{}", self.service, self.role, self.thread)
    }
}

/// Result code carried by every response and notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    RequestOk,
    DataOk,
    DataInvalid,
    RequestInvalid,
    RequestError,
    RequestBusy,
    RequestCanceled,
    MessageUndelivered,
}

impl ResultCode {
    /// Failure of an in-flight call
    pub fn is_request_failure(self) -> bool {
        matches!(
            self,
            ResultCode::RequestError
                | ResultCode::RequestBusy
                | ResultCode::RequestCanceled
                | ResultCode::MessageUndelivered
        )
    }

    pub fn is_success(self) -> bool {
        matches!(self, ResultCode::RequestOk | ResultCode::DataOk)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Validity of a cached attribute or response parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataState {
    /// Never set
    #[default]
    Unavailable,
    /// Holds the most recently set value
    Ok,
    /// Explicitly invalidated
    Invalid,
}

/// Sequence number correlating a request with its result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SequenceNr(pub u64);

impl SequenceNr {
    /// Persistent notification listeners, not bound to one call
    pub const ANY: SequenceNr = SequenceNr(0);

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }
}

impl fmt::Display for SequenceNr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "*")
        } else {
            write!(f, "#{}", self.0)
        }
    }
}

/// Kinds of notification requests a proxy sends to a stub
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    StartNotify,
    StopNotify,
    RemoveAllNotify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Request,
    NotifyRequest(NotifyKind),
    /// Response, broadcast, attribute update or failure
    Response,
    /// Proxy announces itself to a stub
    Connect,
    /// Proxy leaves a stub
    Disconnect,
    /// Stub tells a proxy whether the service is available
    ServiceConnection(bool),
}

/// Header fields written in front of the payload by [`Envelope::encode`]
#[derive(Serialize, Deserialize)]
struct EnvelopeHeader {
    id: Uuid,
    kind: EnvelopeKind,
    source: Address,
    target: Address,
    msg_id: MessageId,
    result: ResultCode,
    seq: SequenceNr,
}

/// Generic message between a proxy and a stub; immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    kind: EnvelopeKind,
    source: Address,
    target: Address,
    msg_id: MessageId,
    result: ResultCode,
    seq: SequenceNr,
    payload: Vec<u8>,
}

impl Envelope {
    #[allow(clippy::too_many_arguments)]
    fn new(
        kind: EnvelopeKind,
        source: Address,
        target: Address,
        msg_id: MessageId,
        result: ResultCode,
        seq: SequenceNr,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            source,
            target,
            msg_id,
            result,
            seq,
            payload,
        }
    }

    /// Create a request envelope from a proxy to a stub
    pub fn request(
        source: Address,
        target: Address,
        msg_id: MessageId,
        seq: SequenceNr,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(
            EnvelopeKind::Request,
            source,
            target,
            msg_id,
            ResultCode::RequestOk,
            seq,
            payload,
        )
    }

    /// Create a notification request envelope from a proxy to a stub
    pub fn notify_request(source: Address, target: Address, msg_id: MessageId, kind: NotifyKind) -> Self {
        Self::new(
            EnvelopeKind::NotifyRequest(kind),
            source,
            target,
            msg_id,
            ResultCode::RequestOk,
            SequenceNr::ANY,
            Vec::new(),
        )
    }

    /// Create a response, broadcast, update or failure envelope
    pub fn response(
        source: Address,
        target: Address,
        msg_id: MessageId,
        result: ResultCode,
        seq: SequenceNr,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(EnvelopeKind::Response, source, target, msg_id, result, seq, payload)
    }

    pub fn connect(source: Address, target: Address) -> Self {
        Self::control(EnvelopeKind::Connect, source, target)
    }

    pub fn disconnect(source: Address, target: Address) -> Self {
        Self::control(EnvelopeKind::Disconnect, source, target)
    }

    pub fn service_connection(source: Address, target: Address, connected: bool) -> Self {
        Self::control(EnvelopeKind::ServiceConnection(connected), source, target)
    }

    fn control(kind: EnvelopeKind, source: Address, target: Address) -> Self {
        Self::new(
            kind,
            source,
            target,
            MessageId::NOT_PROCESSED,
            ResultCode::RequestOk,
            SequenceNr::ANY,
            Vec::new(),
        )
    }

    /// Reply telling the sender that this envelope could not be delivered.
    /// `None` for envelopes that carry nothing a sender waits on.
    pub fn undelivered(&self) -> Option<Envelope> {
        match self.kind {
            EnvelopeKind::Request | EnvelopeKind::NotifyRequest(_) => Some(Self::response(
                self.target.clone(),
                self.source.clone(),
                self.msg_id,
                ResultCode::MessageUndelivered,
                self.seq,
                Vec::new(),
            )),
            _ => None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.kind
    }

    pub fn source(&self) -> &Address {
        &self.source
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn msg_id(&self) -> MessageId {
        self.msg_id
    }

    pub fn result(&self) -> ResultCode {
        self.result
    }

    pub fn seq(&self) -> SequenceNr {
        self.seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Reader positioned at the first argument
    pub fn args(&self) -> PayloadReader<'_> {
        PayloadReader::new(&self.payload)
    }

    /// Write the header fields followed by the raw payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        let header = EnvelopeHeader {
            id: self.id,
            kind: self.kind,
            source: self.source.clone(),
            target: self.target.clone(),
            msg_id: self.msg_id,
            result: self.result,
            seq: self.seq,
        };
        let mut bytes = bincode::serialize(&header)?;
        bytes.extend_from_slice(&self.payload);
        Ok(bytes)
    }

    /// Read the header fields; everything after them is the payload
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let mut input = bytes;
        let header: EnvelopeHeader = bincode::deserialize_from(&mut input)?;
        Ok(Envelope {
            id: header.id,
            kind: header.kind,
            source: header.source,
            target: header.target,
            msg_id: header.msg_id,
            result: header.result,
            seq: header.seq,
            payload: input.to_vec(),
        })
    }
}

/// Writes arguments in declared order
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<&mut Self> {
        bincode::serialize_into(&mut self.buf, value)?;
        Ok(self)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads arguments back in the order they were written
#[derive(Debug)]
pub struct PayloadReader<'a> {
    remaining: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { remaining: payload }
    }

    pub fn read<T: DeserializeOwned>(&mut self) -> Result<T> {
        Ok(bincode::deserialize_from(&mut self.remaining)?)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// Serialize a single value as a payload
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a payload holding a single value or a field struct
pub fn from_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    PayloadReader::new(payload).read()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> Address {
        Address::proxy("HelloWorld", "main", "gui")
    }

    fn stub() -> Address {
        Address::stub("HelloWorld", "main", "service")
    }

    #[test]
    fn test_arguments_read_back_in_declared_order() {
        let mut writer = PayloadWriter::new();
        writer.write("alice").unwrap().write(&7u32).unwrap().write(&true).unwrap();
        let payload = writer.finish();

        let mut reader = PayloadReader::new(&payload);
        let name: String = reader.read().unwrap();
        let cookie: u32 = reader.read().unwrap();
        let flag: bool = reader.read().unwrap();
        assert_eq!((name.as_str(), cookie, flag), ("alice", 7, true));
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_payload_is_a_serialization_error() {
        let payload = to_payload(&1u8).unwrap();
        let mut reader = PayloadReader::new(&payload);
        let _: u8 = reader.read().unwrap();
        let err = reader.read::<u64>().unwrap_err();
        assert_eq!(err.category(), "serialization");
    }

    #[test]
    fn test_decode_leaves_payload_for_the_handler() {
        let payload = to_payload(&(String::from("bob"), 42u64)).unwrap();
        let envelope = Envelope::request(
            proxy(),
            stub(),
            MessageId::request(0),
            SequenceNr(3),
            payload,
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);

        let mut args = decoded.args();
        assert_eq!(args.read::<String>().unwrap(), "bob");
        assert_eq!(args.read::<u64>().unwrap(), 42);
    }

    #[test]
    fn test_undelivered_bounce_swaps_addresses() {
        let envelope = Envelope::request(proxy(), stub(), MessageId::request(1), SequenceNr(9), vec![1]);
        let bounce = envelope.undelivered().unwrap();
        assert_eq!(bounce.kind(), EnvelopeKind::Response);
        assert_eq!(bounce.result(), ResultCode::MessageUndelivered);
        assert_eq!(bounce.target(), &proxy());
        assert_eq!(bounce.seq(), SequenceNr(9));
        assert!(bounce.payload().is_empty());

        let update = Envelope::response(
            stub(),
            proxy(),
            MessageId::attribute(0),
            ResultCode::DataOk,
            SequenceNr::ANY,
            Vec::new(),
        );
        assert!(update.undelivered().is_none());
    }

    #[test]
    fn test_result_code_classes() {
        assert!(ResultCode::MessageUndelivered.is_request_failure());
        assert!(ResultCode::RequestBusy.is_request_failure());
        assert!(!ResultCode::DataInvalid.is_request_failure());
        assert!(ResultCode::DataOk.is_success());
        assert!(!ResultCode::RequestInvalid.is_success());
    }
}
