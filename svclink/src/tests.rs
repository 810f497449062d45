//! Tests for stub, proxy and client working together on dispatcher threads
//! driven by an in-memory queue

use crate::*;
use std::sync::Arc;

const HELLO: MessageId = MessageId::request(0);
const SHUTDOWN: MessageId = MessageId::request(1);
const SLOW: MessageId = MessageId::request(2);
const CONNECT: MessageId = MessageId::request(3);
const HELLO_RESP: MessageId = MessageId::response(0);
const SLOW_RESP: MessageId = MessageId::response(1);
const GREETED: MessageId = MessageId::response(2);
const CONNECT_RESP: MessageId = MessageId::response(3);
const COUNT: MessageId = MessageId::attribute(0);
const COOKIE: MessageId = MessageId::attribute(1);

const ROLE: &str = "greeter";

fn descriptor() -> Arc<InterfaceDescriptor> {
    InterfaceDescriptor::builder("HelloWorld")
        .version(Version::new(1, 0, 0))
        .request(HELLO, Some(HELLO_RESP))
        .request(SHUTDOWN, None)
        .request(SLOW, Some(SLOW_RESP))
        .request(CONNECT, Some(CONNECT_RESP))
        .response(HELLO_RESP)
        .response(SLOW_RESP)
        .response(CONNECT_RESP)
        .broadcast(GREETED)
        .attribute(COUNT)
        .attribute(COOKIE)
        .build()
        .unwrap()
}

#[derive(Default)]
struct Greeter {
    count: u32,
    shutdown_requested: bool,
    busy: bool,
}

impl StubHandler for Greeter {
    fn process_request(
        &mut self,
        stub: &mut StubCore,
        request: MessageId,
        args: &mut PayloadReader<'_>,
    ) -> Result<()> {
        match request {
            HELLO => {
                let name: String = args.read()?;
                if name.is_empty() {
                    return Err(Error::runtime_msg("nobody to greet"));
                }
                self.count += 1;
                stub.set_attribute(COUNT, &self.count)?;
                stub.send_response(HELLO_RESP, &format!("hello {name}"))?;
                stub.send_broadcast(GREETED, &name)
            }
            SHUTDOWN => {
                self.shutdown_requested = true;
                Ok(())
            }
            CONNECT => {
                let name: String = args.read()?;
                let since: u64 = args.read()?;
                stub.send_response(CONNECT_RESP, &(name, 7u32, since, true))
            }
            SLOW if self.busy => stub.busy_current_request(),
            // answered later through the stub core
            SLOW => Ok(()),
            other => Err(Error::runtime_msg(format!("unexpected {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected(bool),
    Response(MessageId, SequenceNr),
    Broadcast(MessageId),
    Update(MessageId, DataState),
    Failed(MessageId, ResultCode),
    InvalidResponse(MessageId),
    InvalidRequest(MessageId),
}

#[derive(Default)]
struct Recorder {
    seen: Vec<Seen>,
}

impl ClientHandler for Recorder {
    fn service_connected(&mut self, _client: &ClientBase, connected: bool) {
        self.seen.push(Seen::Connected(connected));
    }

    fn on_response(&mut self, _client: &ClientBase, response: MessageId, seq: SequenceNr) {
        self.seen.push(Seen::Response(response, seq));
    }

    fn on_broadcast(&mut self, _client: &ClientBase, broadcast: MessageId) {
        self.seen.push(Seen::Broadcast(broadcast));
    }

    fn on_attribute_update(&mut self, _client: &ClientBase, attribute: MessageId, state: DataState) {
        self.seen.push(Seen::Update(attribute, state));
    }

    fn request_failed(&mut self, _client: &ClientBase, request: MessageId, reason: ResultCode) {
        self.seen.push(Seen::Failed(request, reason));
    }

    fn invalid_response(&mut self, _client: &ClientBase, response: MessageId) {
        self.seen.push(Seen::InvalidResponse(response));
    }

    fn invalid_request(&mut self, _client: &ClientBase, request: MessageId) {
        self.seen.push(Seen::InvalidRequest(request));
    }
}

fn service_thread() -> (Arc<QueueDispatcher>, DispatcherThread) {
    let queue = QueueDispatcher::new();
    let mut thread = DispatcherThread::new("main", queue.clone());
    thread
        .register_stub(descriptor(), ROLE, Greeter::default())
        .unwrap();
    (queue, thread)
}

fn connect(queue: &QueueDispatcher, thread: &mut DispatcherThread) -> ConsumerId {
    let consumer = thread
        .connect_client(descriptor(), ROLE, Recorder::default())
        .unwrap();
    queue.run_until_idle(thread).unwrap();
    consumer
}

fn seen(thread: &DispatcherThread, consumer: ConsumerId) -> Vec<Seen> {
    thread
        .client::<Recorder>(consumer)
        .unwrap()
        .handler()
        .seen
        .clone()
}

fn client(thread: &DispatcherThread, consumer: ConsumerId) -> ClientBase {
    thread.client::<Recorder>(consumer).unwrap().base().clone()
}

#[test]
fn test_request_response_round_trip() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);

    let seq = client(&thread, consumer).request(HELLO, "world").unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer),
        vec![Seen::Connected(true), Seen::Response(HELLO_RESP, seq)]
    );
    let base = client(&thread, consumer);
    assert_eq!(
        base.response::<String>(HELLO_RESP).unwrap().as_deref(),
        Some("hello world")
    );
    assert_eq!(base.data_state(HELLO_RESP), DataState::Ok);
    assert_eq!(base.proxy().borrow().pending_calls(), 0);
}

#[test]
fn test_response_parameters_are_read_back_from_the_proxy() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);
    assert_eq!(base.data_state(CONNECT_RESP), DataState::Unavailable);

    let seq = base.request(CONNECT, &("alice", 1_700_000_000u64)).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer).last(),
        Some(&Seen::Response(CONNECT_RESP, seq))
    );
    let (name, cookie, since, accepted) = base
        .response::<(String, u32, u64, bool)>(CONNECT_RESP)
        .unwrap()
        .unwrap();
    assert_eq!(name, "alice");
    assert_eq!(cookie, 7);
    assert_eq!(since, 1_700_000_000);
    assert!(accepted);
    assert_eq!(base.data_state(CONNECT_RESP), DataState::Ok);
}

#[test]
fn test_sequence_numbers_are_unique_per_proxy() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);

    let first = base.request(HELLO, "a").unwrap();
    let second = base.request(SHUTDOWN, &()).unwrap();
    assert!(!first.is_any());
    assert_ne!(first, second);
    // fire-and-forget requests leave nothing pending
    assert_eq!(base.proxy().borrow().pending_calls(), 1);

    queue.run_until_idle(&mut thread).unwrap();
    assert!(thread.stub::<Greeter>(ROLE).unwrap().handler().shutdown_requested);
}

#[test]
fn test_unchanged_attribute_notifies_once() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    client(&thread, consumer).notify_on(COUNT, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    let notified = thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| {
            let first = stub.set_attribute(COUNT, &5u32).unwrap();
            let second = stub.set_attribute(COUNT, &5u32).unwrap();
            (first, second)
        })
        .unwrap();
    assert_eq!(notified, (true, false));
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer),
        vec![
            Seen::Connected(true),
            Seen::Update(COUNT, DataState::Unavailable),
            Seen::Update(COUNT, DataState::Ok),
        ]
    );
    assert_eq!(
        client(&thread, consumer).attribute::<u32>(COUNT).unwrap(),
        (Some(5), DataState::Ok)
    );
}

#[test]
fn test_start_notify_on_unavailable_attribute_answers_data_invalid() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    client(&thread, consumer).notify_on(COUNT, true).unwrap();

    let start = queue.pop().unwrap();
    assert_eq!(start.kind(), EnvelopeKind::NotifyRequest(NotifyKind::StartNotify));
    thread.dispatch(start).unwrap();

    let reply = queue.pop().unwrap();
    assert_eq!(reply.msg_id(), COUNT);
    assert_eq!(reply.result(), ResultCode::DataInvalid);
    assert!(reply.payload().is_empty());
    assert!(reply.seq().is_any());
}

#[test]
fn test_valid_attribute_is_read_back_after_subscribing() {
    let (queue, mut thread) = service_thread();
    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.set_attribute(COOKIE, &7u32))
        .unwrap()
        .unwrap();
    let consumer = connect(&queue, &mut thread);

    client(&thread, consumer).notify_on(COOKIE, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        client(&thread, consumer).attribute::<u32>(COOKIE).unwrap(),
        (Some(7), DataState::Ok)
    );
    assert_eq!(
        seen(&thread, consumer).last(),
        Some(&Seen::Update(COOKIE, DataState::Ok))
    );
}

#[test]
fn test_second_listener_gets_one_synthetic_update() {
    let (queue, mut thread) = service_thread();
    let first = connect(&queue, &mut thread);
    let second = connect(&queue, &mut thread);

    client(&thread, first).notify_on(COUNT, true).unwrap();
    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.set_attribute(COUNT, &3u32))
        .unwrap()
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    let updates = |thread: &DispatcherThread| {
        seen(thread, second)
            .into_iter()
            .filter(|event| matches!(event, Seen::Update(COUNT, DataState::Ok)))
            .count()
    };

    thread
        .with_client::<Recorder, _>(second, |_, client| client.notify_on(COUNT, true))
        .unwrap()
        .unwrap();
    assert_eq!(updates(&thread), 1);

    // registering again only delivers when asked to
    thread
        .with_client::<Recorder, _>(second, |_, client| client.notify_on(COUNT, true))
        .unwrap()
        .unwrap();
    assert_eq!(updates(&thread), 1);
    thread
        .with_client::<Recorder, _>(second, |_, client| client.notify_on_with(COUNT, true, true))
        .unwrap()
        .unwrap();
    assert_eq!(updates(&thread), 2);

    // both consumers share one proxy, so the stub holds one subscription
    assert!(queue.is_empty());
    let stub = thread.stub_core(ROLE).unwrap();
    assert_eq!(stub.listeners().subscribers(COUNT).count(), 1);
}

#[test]
fn test_two_proxies_each_get_an_update() {
    let queue = QueueDispatcher::new();
    let mut main = DispatcherThread::new("main", queue.clone());
    let mut other = DispatcherThread::new("other", queue.clone());
    main.register_stub(descriptor(), ROLE, Greeter::default())
        .unwrap();

    let pump = |main: &mut DispatcherThread, other: &mut DispatcherThread| {
        while let Some(envelope) = queue.pop() {
            let target = envelope.target();
            if target.is_proxy() && target.thread() == "other" {
                other.dispatch(envelope).unwrap();
            } else {
                main.dispatch(envelope).unwrap();
            }
        }
    };

    let here = main
        .connect_client(descriptor(), ROLE, Recorder::default())
        .unwrap();
    let there = other
        .connect_client(descriptor(), ROLE, Recorder::default())
        .unwrap();
    pump(&mut main, &mut other);
    client(&main, here).notify_on(COUNT, true).unwrap();
    client(&other, there).notify_on(COUNT, true).unwrap();
    pump(&mut main, &mut other);

    main.with_stub::<Greeter, _>(ROLE, |_, stub| stub.set_attribute(COUNT, &1u32))
        .unwrap()
        .unwrap();
    pump(&mut main, &mut other);

    for (thread, consumer) in [(&main, here), (&other, there)] {
        let updates = seen(thread, consumer)
            .into_iter()
            .filter(|event| *event == Seen::Update(COUNT, DataState::Ok))
            .count();
        assert_eq!(updates, 1);
    }
    assert_eq!(
        main.stub_core(ROLE).unwrap().listeners().subscribers(COUNT).count(),
        2
    );
}

#[test]
fn test_error_request_without_listeners_is_a_no_op() {
    let (queue, mut thread) = service_thread();
    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.error_request(HELLO, false))
        .unwrap()
        .unwrap();
    assert!(queue.is_empty());
}

#[test]
fn test_clear_all_notifications_twice_is_a_no_op() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);
    base.notify_on(COUNT, true).unwrap();
    base.notify_on(GREETED, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    base.clear_all_notifications();
    assert_eq!(queue.len(), 1);
    assert_eq!(
        queue.pop().map(|envelope| envelope.kind()),
        Some(EnvelopeKind::NotifyRequest(NotifyKind::RemoveAllNotify))
    );

    base.clear_all_notifications();
    assert!(queue.is_empty());
}

#[test]
fn test_subscribed_broadcast_reaches_the_client() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);
    base.notify_on(GREETED, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    base.request(HELLO, "carol").unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert!(seen(&thread, consumer).contains(&Seen::Broadcast(GREETED)));
    assert_eq!(
        base.response::<String>(GREETED).unwrap().as_deref(),
        Some("carol")
    );
}

#[test]
fn test_failing_handler_reports_request_error() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);

    client(&thread, consumer).request(HELLO, "").unwrap();
    assert!(queue.run_until_idle(&mut thread).is_err());

    assert_eq!(
        seen(&thread, consumer).last(),
        Some(&Seen::Failed(HELLO, ResultCode::RequestError))
    );
    assert_eq!(
        client(&thread, consumer).data_state(HELLO_RESP),
        DataState::Invalid
    );
}

#[test]
fn test_busy_stub_reports_request_busy() {
    let (queue, mut thread) = service_thread();
    thread
        .with_stub::<Greeter, _>(ROLE, |greeter, _| greeter.busy = true)
        .unwrap();
    let consumer = connect(&queue, &mut thread);

    client(&thread, consumer).request(SLOW, &()).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer).last(),
        Some(&Seen::Failed(SLOW, ResultCode::RequestBusy))
    );
    assert!(!thread
        .stub_core(ROLE)
        .unwrap()
        .listeners()
        .has_listeners(SLOW_RESP));
}

#[test]
fn test_repeated_requests_run_without_waiting_for_answers() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);

    let seqs: Vec<SequenceNr> = (0..5).map(|_| base.request(SLOW, &()).unwrap()).collect();
    queue.run_until_idle(&mut thread).unwrap();
    let stub = thread.stub_core(ROLE).unwrap();
    assert_eq!(stub.deferred_len(), 0);
    assert!(stub.current_request().is_none());
    assert_eq!(stub.listeners().listeners(SLOW_RESP).count(), 5);

    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.send_response(SLOW_RESP, &3u32))
        .unwrap()
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    let answered: Vec<Seen> = seqs
        .iter()
        .map(|seq| Seen::Response(SLOW_RESP, *seq))
        .collect();
    assert_eq!(seen(&thread, consumer)[1..], answered[..]);
    assert_eq!(base.response::<u32>(SLOW_RESP).unwrap(), Some(3));
    assert_eq!(base.proxy().borrow().pending_calls(), 0);
}

#[test]
fn test_clear_all_keeps_open_calls_of_other_consumers() {
    let (queue, mut thread) = service_thread();
    let caller = connect(&queue, &mut thread);
    let watcher = connect(&queue, &mut thread);

    let seq = client(&thread, caller).request(SLOW, &()).unwrap();
    client(&thread, watcher).notify_on(COUNT, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    client(&thread, watcher).clear_all_notifications();
    queue.run_until_idle(&mut thread).unwrap();
    let stub = thread.stub_core(ROLE).unwrap();
    assert!(!stub.listeners().has_subscribers(COUNT));
    assert_eq!(stub.listeners().listeners(SLOW_RESP).count(), 1);

    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.send_response(SLOW_RESP, &9u32))
        .unwrap()
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    let base = client(&thread, caller);
    assert_eq!(
        seen(&thread, caller).last(),
        Some(&Seen::Response(SLOW_RESP, seq))
    );
    assert_eq!(base.response::<u32>(SLOW_RESP).unwrap(), Some(9));
    assert_eq!(base.proxy().borrow().pending_calls(), 0);
}

#[test]
fn test_cancelled_request_reaches_the_caller() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    client(&thread, consumer).request(SLOW, &()).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.error_request(SLOW, true))
        .unwrap()
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer).last(),
        Some(&Seen::Failed(SLOW, ResultCode::RequestCanceled))
    );
    assert_eq!(client(&thread, consumer).proxy().borrow().pending_calls(), 0);
}

#[test]
fn test_invalidated_attribute_reaches_subscribers() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    client(&thread, consumer).notify_on(COUNT, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| {
            stub.set_attribute(COUNT, &4u32)?;
            stub.invalidate_attribute(COUNT)
        })
        .unwrap()
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer),
        vec![
            Seen::Connected(true),
            Seen::Update(COUNT, DataState::Unavailable),
            Seen::Update(COUNT, DataState::Ok),
            Seen::Update(COUNT, DataState::Invalid),
        ]
    );
    assert_eq!(
        thread.stub_core(ROLE).unwrap().attribute_state(COUNT),
        DataState::Invalid
    );
}

#[test]
fn test_request_for_missing_service_is_bounced() {
    let queue = QueueDispatcher::new();
    let mut thread = DispatcherThread::new("main", queue.clone());
    let consumer = thread
        .connect_client(descriptor(), "nobody", Recorder::default())
        .unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    client(&thread, consumer).request(HELLO, "anyone").unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(
        seen(&thread, consumer),
        vec![Seen::Failed(HELLO, ResultCode::MessageUndelivered)]
    );
}

#[test]
fn test_lost_service_fails_open_calls() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);
    base.notify_on(COUNT, true).unwrap();
    thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.set_attribute(COUNT, &9u32))
        .unwrap()
        .unwrap();
    base.request(SLOW, &()).unwrap();
    queue.run_until_idle(&mut thread).unwrap();
    assert_eq!(base.data_state(COUNT), DataState::Ok);

    thread.unregister_stub(ROLE).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    let events = seen(&thread, consumer);
    assert_eq!(
        events[events.len() - 2..],
        [
            Seen::Failed(SLOW, ResultCode::MessageUndelivered),
            Seen::Connected(false),
        ]
    );
    assert!(!base.is_connected());
    assert_eq!(base.data_state(COUNT), DataState::Unavailable);
    assert_eq!(base.proxy().borrow().pending_calls(), 0);
}

#[test]
fn test_protocol_violations_are_reported() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    let base = client(&thread, consumer);

    let err = base.request(COUNT, &()).unwrap_err();
    assert_eq!(err.category(), "protocol");
    let err = base.notify_on(HELLO, true).unwrap_err();
    assert_eq!(err.category(), "protocol");

    let err = thread
        .with_stub::<Greeter, _>(ROLE, |_, stub| stub.set_attribute(HELLO_RESP, &1u8))
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { msg_id, .. } if msg_id == HELLO_RESP));
}

#[test]
fn test_disconnected_consumer_releases_the_proxy() {
    let (queue, mut thread) = service_thread();
    let consumer = connect(&queue, &mut thread);
    client(&thread, consumer).notify_on(COUNT, true).unwrap();
    queue.run_until_idle(&mut thread).unwrap();
    assert_eq!(thread.proxy_count(), 1);

    thread.disconnect_client(consumer).unwrap();
    queue.run_until_idle(&mut thread).unwrap();

    assert_eq!(thread.proxy_count(), 0);
    let stub = thread.stub_core(ROLE).unwrap();
    assert!(stub.clients().is_empty());
    assert!(stub.listeners().is_empty());
    assert!(matches!(
        thread.disconnect_client(consumer),
        Err(Error::ConsumerNotFound { .. })
    ));
}
