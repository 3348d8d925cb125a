//! Delivery scenarios across nodes sharing an address.
#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hh_hub::node::publish::{onepub, onepush, pullpub};
use hh_hub::node::subscribe::{run_subscriber, DzenSink};
use hh_hub::{Lifecycle, NodeState, Receiver, Sender, SocketOptions, Template, TransportError};
use hh_types::address::{Binding, Endpoint, Role};
use hh_types::config::PublishConfig;
use hh_types::event::{decode, Event};

const WAIT: Duration = Duration::from_secs(5);

fn opts() -> SocketOptions {
    SocketOptions {
        reconnect_interval: Duration::from_millis(20),
        ..SocketOptions::default()
    }
}

fn ipc(dir: &Path, name: &str) -> Endpoint {
    Endpoint::Ipc(dir.join(name))
}

fn ev(kind: &str, id: &str, args: &[&str]) -> Event {
    Event::new(kind, id, args.iter().copied()).unwrap()
}

async fn next_event(rx: &mut Receiver) -> Event {
    let record = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    decode(&record).unwrap()
}

#[tokio::test]
async fn connected_subscriber_gets_everything_in_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ep = ipc(tmp.path(), "hub.ipc");
    let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();
    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &opts())
        .await
        .unwrap();
    timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

    for i in 0..200 {
        tx.send(&ev("tick", &i.to_string(), &["x"])).await.unwrap();
    }
    for i in 0..200 {
        assert_eq!(next_event(&mut rx).await.id(), i.to_string());
    }
}

#[tokio::test]
async fn tcp_endpoints_deliver_too() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let ep: Endpoint = format!("tcp://127.0.0.1:{port}").parse().unwrap();
    let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();
    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &opts())
        .await
        .unwrap();
    timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

    tx.send(&ev("focus_changed", "0x1", &["term"])).await.unwrap();
    assert_eq!(next_event(&mut rx).await, ev("focus_changed", "0x1", &["term"]));
}

#[tokio::test]
async fn publisher_on_two_addresses_reaches_both_subscribers() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = ipc(tmp.path(), "a.ipc");
    let b = ipc(tmp.path(), "b.ipc");
    let tx = Sender::open(
        Role::Publish,
        &[Binding::bind(a.clone()), Binding::bind(b.clone())],
        &opts(),
    )
    .await
    .unwrap();
    let mut rx_a = Receiver::open(Role::Subscribe, &[Binding::connect(a)], &opts())
        .await
        .unwrap();
    let mut rx_b = Receiver::open(Role::Subscribe, &[Binding::connect(b)], &opts())
        .await
        .unwrap();
    timeout(WAIT, tx.wait_for_peers(2)).await.unwrap();

    for i in 0..10 {
        tx.send(&ev("tick", &i.to_string(), &[])).await.unwrap();
    }
    for rx in [&mut rx_a, &mut rx_b] {
        for i in 0..10 {
            assert_eq!(next_event(rx).await.id(), i.to_string());
        }
    }
}

#[tokio::test]
async fn subscriber_on_two_addresses_receives_the_union() {
    let tmp = tempfile::TempDir::new().unwrap();
    let a = ipc(tmp.path(), "a.ipc");
    let b = ipc(tmp.path(), "b.ipc");
    let tx_a = Sender::open(Role::Publish, &[Binding::bind(a.clone())], &opts())
        .await
        .unwrap();
    let tx_b = Sender::open(Role::Publish, &[Binding::bind(b.clone())], &opts())
        .await
        .unwrap();
    let mut rx = Receiver::open(
        Role::Subscribe,
        &[Binding::connect(a), Binding::connect(b)],
        &opts(),
    )
    .await
    .unwrap();
    timeout(WAIT, tx_a.wait_for_peers(1)).await.unwrap();
    timeout(WAIT, tx_b.wait_for_peers(1)).await.unwrap();

    for i in 0..5 {
        tx_a.send(&ev("from_a", &i.to_string(), &[])).await.unwrap();
        tx_b.send(&ev("from_b", &i.to_string(), &[])).await.unwrap();
    }

    let mut from_a = Vec::new();
    let mut from_b = Vec::new();
    for _ in 0..10 {
        let event = next_event(&mut rx).await;
        match event.kind() {
            "from_a" => from_a.push(event.id().to_string()),
            "from_b" => from_b.push(event.id().to_string()),
            other => panic!("unexpected event type {other}"),
        }
    }
    // Each stream keeps its own order; nothing is promised across them.
    let expected: Vec<String> = (0..5).map(|i| i.to_string()).collect();
    assert_eq!(from_a, expected);
    assert_eq!(from_b, expected);
}

#[tokio::test]
async fn late_subscriber_misses_earlier_events_without_error() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ep = ipc(tmp.path(), "hub.ipc");
    let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();

    tx.send(&ev("early", "", &[])).await.unwrap();

    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &opts())
        .await
        .unwrap();
    timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();
    tx.send(&ev("late", "", &[])).await.unwrap();

    assert_eq!(next_event(&mut rx).await.kind(), "late");
}

#[tokio::test]
async fn onepush_through_pullpub_arrives_in_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let inbox_ep = ipc(tmp.path(), "inbox.ipc");
    let hub_ep = ipc(tmp.path(), "hub.ipc");

    let mut inbox = Receiver::open(Role::Pull, &[Binding::bind(inbox_ep.clone())], &opts())
        .await
        .unwrap();
    let outbox = Sender::open(Role::Publish, &[Binding::bind(hub_ep.clone())], &opts())
        .await
        .unwrap();
    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(hub_ep)], &opts())
        .await
        .unwrap();
    timeout(WAIT, outbox.wait_for_peers(1)).await.unwrap();

    let shutdown = CancellationToken::new();
    let bridge = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut echo = tokio::io::sink();
            pullpub(&mut inbox, &outbox, &mut echo, &shutdown).await
        }
    });

    const N: usize = 5;
    for i in 0..N {
        let push = Sender::open(Role::Push, &[Binding::connect(inbox_ep.clone())], &opts())
            .await
            .unwrap();
        let delivered = onepush(push, &ev("note", &i.to_string(), &["hi"]), WAIT)
            .await
            .unwrap();
        assert!(delivered);
    }
    for i in 0..N {
        let event = next_event(&mut rx).await;
        assert_eq!(event, ev("note", &i.to_string(), &["hi"]));
    }

    shutdown.cancel();
    let forwarded = timeout(WAIT, bridge).await.unwrap().unwrap().unwrap();
    assert_eq!(forwarded, N as u64);
}

#[tokio::test]
async fn onepub_delay_lets_a_connecting_subscriber_catch_the_event() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ep = ipc(tmp.path(), "hub.ipc");

    // Subscriber first, dialling an address nobody serves yet.
    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep.clone())], &opts())
        .await
        .unwrap();

    let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();
    let fanout = onepub(tx, &ev("lost", "", &[]), Duration::ZERO).await.unwrap();
    assert_eq!(fanout.delivered, 0);
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    let delay = Duration::from_millis(PublishConfig::default().onepub_delay_ms);
    let tx = Sender::open(Role::Publish, &[Binding::bind(ep)], &opts())
        .await
        .unwrap();
    let fanout = onepub(tx, &ev("kept", "", &[]), delay).await.unwrap();
    assert_eq!(fanout.delivered, 1);
    assert_eq!(next_event(&mut rx).await.kind(), "kept");
}

#[tokio::test]
async fn binding_a_live_address_fails() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ep = ipc(tmp.path(), "hub.ipc");
    let first = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();

    match Sender::open(Role::Publish, &[Binding::bind(ep)], &opts()).await {
        Err(TransportError::Bind { .. }) => {}
        Err(other) => panic!("expected a bind error, got {other}"),
        Ok(_) => panic!("second bind unexpectedly succeeded"),
    }

    // The liveness check does not leave a peer behind on the running node.
    timeout(WAIT, async {
        while first.peers() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn stale_socket_file_is_reclaimed() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("hub.ipc");
    drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
    assert!(path.exists());

    let tx = Sender::open(Role::Publish, &[Binding::bind(Endpoint::Ipc(path.clone()))], &opts())
        .await
        .unwrap();
    drop(tx);
    timeout(WAIT, async {
        while path.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn subdzen_renders_latest_value_per_key() {
    let tmp = tempfile::TempDir::new().unwrap();
    let ep = ipc(tmp.path(), "hub.ipc");
    let out = tmp.path().join("bar.txt");

    let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
        .await
        .unwrap();
    let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &opts())
        .await
        .unwrap();
    timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

    let template = Template::parse("{@A/1}").unwrap();
    let mut sink = DzenSink::spawn(&format!("cat > '{}'", out.display()), Box::new(template)).unwrap();
    let shutdown = CancellationToken::new();
    let node = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let mut lc = Lifecycle::new("subdzen");
            let stats = run_subscriber(&mut lc, &mut rx, &mut sink, &shutdown).await;
            (lc.state(), stats, sink)
        }
    });

    tx.send(&ev("A", "1", &["x"])).await.unwrap();
    tx.send(&ev("A", "1", &["y"])).await.unwrap();

    timeout(WAIT, async {
        while std::fs::read_to_string(&out).unwrap_or_default().lines().count() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    let (state, stats, sink) = timeout(WAIT, node).await.unwrap().unwrap();
    assert_eq!(state, NodeState::Closing);
    assert_eq!(stats.unwrap().delivered, 2);
    assert_eq!(sink.state().len(), 1);
    assert_eq!(sink.state().get("A", "1").unwrap().args(), ["y"]);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "x\ny\n");
}
