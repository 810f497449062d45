//! End-to-end tests: stubs and consumers on separate hub threads

use std::time::Duration;

use svclink::{
    ClientBase, ClientHandler, DataState, Error, Hub, HubConfig, MessageId, PayloadReader,
    ResultCode, SequenceNr, ServiceInterface, StubCore, StubHandler,
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ServiceInterface)]
#[service(name = "Counter", version = "1.0.0")]
enum Counter {
    #[request(response = Added)]
    Add,
    #[request]
    Reset,
    #[response]
    Added,
    #[broadcast]
    Cleared,
    #[attribute]
    Total,
}

#[derive(Default)]
struct CounterStub {
    total: u64,
}

impl StubHandler for CounterStub {
    fn process_request(
        &mut self,
        stub: &mut StubCore,
        request: MessageId,
        args: &mut PayloadReader<'_>,
    ) -> svclink::Result<()> {
        match Counter::from_id(request) {
            Some(Counter::Add) => {
                let amount: u64 = args.read()?;
                self.total += amount;
                stub.set_attribute(Counter::Total.id(), &self.total)?;
                stub.send_response(Counter::Added.id(), &self.total)
            }
            Some(Counter::Reset) => {
                self.total = 0;
                stub.set_attribute(Counter::Total.id(), &self.total)?;
                stub.send_broadcast(Counter::Cleared.id(), &())
            }
            _ => Err(Error::runtime_msg(format!("unexpected {request}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connected(bool),
    Added(u64),
    Total(u64),
    Cleared,
    Failed(Counter, ResultCode),
}

struct Watcher {
    events: mpsc::UnboundedSender<Seen>,
}

impl ClientHandler for Watcher {
    fn service_connected(&mut self, _client: &ClientBase, connected: bool) {
        let _ = self.events.send(Seen::Connected(connected));
    }

    fn on_response(&mut self, client: &ClientBase, response: MessageId, _seq: SequenceNr) {
        if let Ok(Some(total)) = client.response::<u64>(response) {
            let _ = self.events.send(Seen::Added(total));
        }
    }

    fn on_broadcast(&mut self, _client: &ClientBase, broadcast: MessageId) {
        if Counter::from_id(broadcast) == Some(Counter::Cleared) {
            let _ = self.events.send(Seen::Cleared);
        }
    }

    fn on_attribute_update(&mut self, client: &ClientBase, attribute: MessageId, state: DataState) {
        if state != DataState::Ok {
            return;
        }
        if let Ok((Some(total), _)) = client.attribute::<u64>(attribute) {
            let _ = self.events.send(Seen::Total(total));
        }
    }

    fn request_failed(&mut self, _client: &ClientBase, request: MessageId, reason: ResultCode) {
        if let Some(request) = Counter::from_id(request) {
            let _ = self.events.send(Seen::Failed(request, reason));
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn start_hub() -> Hub {
    init_tracing();
    Hub::start(
        HubConfig::new("test")
            .with_thread("service")
            .with_thread("ui")
            .with_log_envelopes(true),
    )
    .unwrap()
}

async fn next(events: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for a client event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_request_and_attribute_across_threads() {
    let hub = start_hub();
    hub.call_on("service", |thread| {
        thread.register_stub(Counter::descriptor(), "counter", CounterStub::default())
    })
    .await
    .unwrap()
    .unwrap();

    let (sender, mut events) = mpsc::unbounded_channel();
    hub.call_on("ui", move |thread| {
        let consumer =
            thread.connect_client(Counter::descriptor(), "counter", Watcher { events: sender })?;
        thread.with_client::<Watcher, _>(consumer, |_, client| {
            client.notify_on(Counter::Total.id(), true)?;
            client.request(Counter::Add.id(), &5u64)
        })?
    })
    .await
    .unwrap()
    .unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(next(&mut events).await);
    }
    assert_eq!(seen[0], Seen::Connected(true));
    assert!(seen.contains(&Seen::Added(5)));
    assert!(seen.contains(&Seen::Total(5)));
}

#[tokio::test]
async fn test_connect_waits_for_late_service() {
    let hub = start_hub();
    let (sender, mut events) = mpsc::unbounded_channel();
    hub.call_on("ui", move |thread| {
        thread.connect_client(Counter::descriptor(), "late", Watcher { events: sender })
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(hub.router().parked_len("late"), 1);

    hub.call_on("service", |thread| {
        thread.register_stub(Counter::descriptor(), "late", CounterStub::default())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(next(&mut events).await, Seen::Connected(true));
    assert_eq!(hub.router().parked_len("late"), 0);
}

#[tokio::test]
async fn test_request_to_missing_service_is_undelivered() {
    let hub = start_hub();
    let (sender, mut events) = mpsc::unbounded_channel();
    hub.call_on("ui", move |thread| {
        let consumer =
            thread.connect_client(Counter::descriptor(), "ghost", Watcher { events: sender })?;
        thread.with_client::<Watcher, _>(consumer, |_, client| {
            client.request(Counter::Add.id(), &1u64)
        })?
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(
        next(&mut events).await,
        Seen::Failed(Counter::Add, ResultCode::MessageUndelivered)
    );
}

#[tokio::test]
async fn test_broadcast_and_service_loss() {
    let mut hub = start_hub();
    hub.call_on("service", |thread| {
        thread.register_stub(Counter::descriptor(), "counter", CounterStub::default())
    })
    .await
    .unwrap()
    .unwrap();

    let (sender, mut events) = mpsc::unbounded_channel();
    let consumer = hub
        .call_on("ui", move |thread| {
            let consumer =
                thread.connect_client(Counter::descriptor(), "counter", Watcher { events: sender })?;
            thread.with_client::<Watcher, _>(consumer, |_, client| {
                client.notify_on(Counter::Cleared.id(), true)
            })??;
            Ok::<_, Error>(consumer)
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next(&mut events).await, Seen::Connected(true));

    hub.call_on("ui", move |thread| {
        thread.with_client::<Watcher, _>(consumer, |_, client| {
            client.request(Counter::Reset.id(), &())
        })
    })
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert_eq!(next(&mut events).await, Seen::Cleared);

    hub.call_on("service", |thread| thread.unregister_stub("counter"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next(&mut events).await, Seen::Connected(false));
    // the proxy waits for the service to come back
    assert_eq!(hub.router().parked_len("counter"), 1);

    hub.shutdown().unwrap();
    assert_eq!(hub.router().parked_len("counter"), 0);
}

#[tokio::test]
async fn test_disconnect_withdraws_parked_connect() {
    let hub = start_hub();
    let (sender, _events) = mpsc::unbounded_channel();
    let consumer = hub
        .call_on("ui", move |thread| {
            thread.connect_client(Counter::descriptor(), "late", Watcher { events: sender })
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hub.router().parked_len("late"), 1);

    hub.call_on("ui", move |thread| thread.disconnect_client(consumer))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hub.router().parked_len("late"), 0);
}

#[test]
fn test_blocking_calls_outside_a_runtime() {
    let mut hub = start_hub();
    let address = hub
        .call_on_blocking("service", |thread| {
            thread.register_stub(Counter::descriptor(), "counter", CounterStub::default())
        })
        .unwrap()
        .unwrap();
    assert_eq!(address.thread(), "service");
    assert_eq!(hub.router().stub_address("counter"), Some(address));

    let err = hub.call_on_blocking("nowhere", |_| ()).unwrap_err();
    assert_eq!(err.category(), "thread_lookup");

    hub.shutdown().unwrap();
    assert!(hub.router().thread_names().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let err = Hub::start(HubConfig::new("test").with_thread("ui").with_thread("ui")).err();
    assert!(matches!(err, Some(Error::Configuration { .. })));
}

#[tokio::test]
async fn test_call_on_gives_up_after_timeout() {
    let hub = start_hub();
    let err = hub
        .call_on_timeout("service", Duration::from_millis(50), |_| {
            std::thread::sleep(Duration::from_millis(300))
        })
        .await
        .unwrap_err();
    assert_eq!(err.category(), "timeout");
    assert!(matches!(err, Error::Timeout { duration_ms: 50, .. }));

    // the thread is still serving once the slow call is done
    let stubs = hub
        .call_on_timeout("service", Duration::from_secs(5), |thread| thread.stub_count())
        .await
        .unwrap();
    assert_eq!(stubs, 0);
}
