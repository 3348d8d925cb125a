//! Transport binding manager — turns a role plus a list of bindings into a
//! live socket.
//!
//! | role      | class    | default link | on send / receive                         |
//! |-----------|----------|--------------|-------------------------------------------|
//! | publish   | Sender   | bind         | fan out to every peer, drop when none/full |
//! | push      | Sender   | connect      | round-robin, wait for a peer               |
//! | subscribe | Receiver | connect      | union of all peers, optional topic filter  |
//! | pull      | Receiver | bind         | union of all peers, backpressure when full |
//!
//! Records are newline-terminated lines on a stream socket. Binding is done
//! up front and fails loudly; connecting happens in the background and keeps
//! retrying, since a subscriber starting before its publisher is normal.

mod peers;
mod stream;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hh_types::address::{Binding, Link, Role};
use hh_types::event::{Event, RECORD_SEPARATOR};

pub use peers::Fanout;

use peers::PeerSet;
use stream::{Conn, Listener};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The address is taken or otherwise unusable. Fatal at startup.
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("{role} socket needs at least one address")]
    NoAddress { role: Role },
    #[error("{role} is not a {expected} role")]
    WrongRole { role: Role, expected: &'static str },
    #[error("socket is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Per-peer outbound queue for senders; inbox size for receivers.
    pub high_water_mark: usize,
    /// Delay between attempts while a connect-mode peer is not listening.
    pub reconnect_interval: Duration,
    /// Upper bound on how long [`Sender::close`] waits for queued writes.
    pub linger: Duration,
    /// Subscribe only: line prefixes to accept. Empty accepts everything.
    pub topics: Vec<String>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            high_water_mark: 1000,
            reconnect_interval: Duration::from_millis(100),
            linger: Duration::from_secs(1),
            topics: vec![],
        }
    }
}

/// Handles one connected peer until it goes away.
type PeerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Session = Arc<dyn Fn(Conn) -> PeerFuture + Send + Sync>;

// ─── Sender ───────────────────────────────────────────────────────────────────

/// The sending side of a publish or push node.
pub struct Sender {
    role: Role,
    peers: Arc<PeerSet>,
    linger: Duration,
    shutdown: CancellationToken,
    _listeners: Vec<Arc<Listener>>,
}

impl Sender {
    /// Establish a publish or push socket on every binding. Bind failures
    /// abort; connect-mode bindings are dialled in the background.
    pub async fn open(
        role: Role,
        bindings: &[Binding],
        opts: &SocketOptions,
    ) -> Result<Self, TransportError> {
        if !role.is_sender() {
            return Err(TransportError::WrongRole {
                role,
                expected: "sending",
            });
        }
        if bindings.is_empty() {
            return Err(TransportError::NoAddress { role });
        }

        let peers = PeerSet::new(opts.high_water_mark);
        let shutdown = CancellationToken::new();

        let session: Session = {
            let peers = Arc::clone(&peers);
            Arc::new(move |conn: Conn| -> PeerFuture {
                let done = peers.attach(conn);
                Box::pin(async move {
                    let _ = done.await;
                })
            })
        };

        let listeners = establish(role, bindings, opts, &shutdown, session).await?;

        Ok(Self {
            role,
            peers,
            linger: opts.linger,
            shutdown,
            _listeners: listeners,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Number of currently connected peers.
    pub fn peers(&self) -> usize {
        self.peers.len()
    }

    /// Wait until at least `n` peers are connected.
    pub async fn wait_for_peers(&self, n: usize) {
        let mut count = self.peers.watch();
        let _ = count.wait_for(|c| *c >= n).await;
    }

    pub async fn send(&self, event: &Event) -> Result<(), TransportError> {
        self.send_raw(event.encode().as_bytes()).await
    }

    /// Send one record as-is, adding the record separator if missing.
    ///
    /// Publish never waits: with no peer connected the record is simply
    /// dropped. Push waits for a peer.
    pub async fn send_raw(&self, record: &[u8]) -> Result<(), TransportError> {
        let msg = frame(record);
        match self.role {
            Role::Publish => {
                let fanout = self.peers.publish(msg);
                if fanout.delivered == 0 {
                    debug!("No subscriber took the message; dropped");
                }
                Ok(())
            }
            _ => self.peers.push(msg).await,
        }
    }

    /// Publish-only variant of [`send_raw`](Self::send_raw) reporting how
    /// many peers the record was queued for.
    pub fn publish_raw(&self, record: &[u8]) -> Fanout {
        self.peers.publish(frame(record))
    }

    /// Stop listening and dialling, then give queued messages up to the
    /// linger period to reach their peers.
    pub async fn close(self) {
        self.shutdown.cancel();
        let writers = self.peers.close();
        let deadline = tokio::time::Instant::now() + self.linger;
        for mut writer in writers {
            if tokio::time::timeout_at(deadline, &mut writer).await.is_err() {
                warn!("Linger expired with messages still queued; discarding");
                writer.abort();
            }
        }
        debug!("{} socket closed", self.role);
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for writer in self.peers.close() {
            writer.abort();
        }
    }
}

fn frame(record: &[u8]) -> Bytes {
    if record.last() == Some(&(RECORD_SEPARATOR as u8)) {
        return Bytes::copy_from_slice(record);
    }
    let mut buf = BytesMut::with_capacity(record.len() + 1);
    buf.put_slice(record);
    buf.put_u8(RECORD_SEPARATOR as u8);
    buf.freeze()
}

// ─── Receiver ─────────────────────────────────────────────────────────────────

/// The receiving side of a subscribe or pull node.
pub struct Receiver {
    role: Role,
    inbox: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    _listeners: Vec<Arc<Listener>>,
}

impl Receiver {
    pub async fn open(
        role: Role,
        bindings: &[Binding],
        opts: &SocketOptions,
    ) -> Result<Self, TransportError> {
        if role.is_sender() {
            return Err(TransportError::WrongRole {
                role,
                expected: "receiving",
            });
        }
        if bindings.is_empty() {
            return Err(TransportError::NoAddress { role });
        }

        let (tx, inbox) = mpsc::channel(opts.high_water_mark.max(1));
        let topics: Arc<[Vec<u8>]> = opts
            .topics
            .iter()
            .map(|t| t.as_bytes().to_vec())
            .collect();
        let lossy = role == Role::Subscribe;
        // Topic prefixes are a subscribe feature; a pull inbox takes everything.
        let topics = if lossy { topics } else { Arc::from(Vec::new()) };

        let session: Session = Arc::new(move |conn: Conn| -> PeerFuture {
            Box::pin(run_reader(conn, tx.clone(), Arc::clone(&topics), lossy))
        });

        let shutdown = CancellationToken::new();
        let listeners = establish(role, bindings, opts, &shutdown, session).await?;

        Ok(Self {
            role,
            inbox,
            shutdown,
            _listeners: listeners,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Next record, without its trailing newline. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbox.recv().await
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_reader(mut conn: Conn, inbox: mpsc::Sender<Bytes>, topics: Arc<[Vec<u8>]>, lossy: bool) {
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match conn.reader.read_until(RECORD_SEPARATOR as u8, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Read from {} failed: {e}", conn.peer);
                break;
            }
        }
        if buf.last() == Some(&(RECORD_SEPARATOR as u8)) {
            buf.pop();
        }
        if !topics.is_empty() && !topics.iter().any(|t| buf.starts_with(t)) {
            continue;
        }

        let record = Bytes::copy_from_slice(&buf);
        if lossy {
            match inbox.try_send(record) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!("Inbox full; dropping message from {}", conn.peer);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        } else if inbox.send(record).await.is_err() {
            break;
        }
    }
    info!("Peer disconnected: {}", conn.peer);
}

// ─── Binding / connecting ─────────────────────────────────────────────────────

/// Bind every bind-mode address first (so a conflict aborts before any
/// background work starts), then start acceptors and connectors.
async fn establish(
    role: Role,
    bindings: &[Binding],
    opts: &SocketOptions,
    shutdown: &CancellationToken,
    session: Session,
) -> Result<Vec<Arc<Listener>>, TransportError> {
    let mut bound = Vec::new();
    for binding in bindings.iter().filter(|b| b.link == Link::Bind) {
        let listener = Arc::new(Listener::bind(&binding.endpoint).await?);
        info!("{role} socket bound at {}", binding.endpoint);
        bound.push((binding.endpoint.to_string(), listener));
    }

    let mut listeners = Vec::with_capacity(bound.len());
    for (label, listener) in bound {
        listeners.push(Arc::clone(&listener));
        tokio::spawn(accept_loop(
            listener,
            label,
            shutdown.clone(),
            Arc::clone(&session),
        ));
    }

    for binding in bindings.iter().filter(|b| b.link == Link::Connect) {
        tokio::spawn(connect_loop(
            binding.clone(),
            role,
            opts.reconnect_interval,
            shutdown.clone(),
            Arc::clone(&session),
        ));
    }

    Ok(listeners)
}

async fn accept_loop(
    listener: Arc<Listener>,
    label: String,
    shutdown: CancellationToken,
    session: Session,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept(&label) => accepted,
        };
        match accepted {
            Ok(conn) => {
                let peer = session(conn);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = peer => {}
                    }
                });
            }
            Err(e) => {
                warn!("Accept on {label} failed: {e}");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
    debug!("Stopped accepting on {label}");
}

/// Dial `binding` until it answers, serve the connection, and start over
/// when the peer goes away. An absent peer is a warning, never an error.
async fn connect_loop(
    binding: Binding,
    role: Role,
    interval: Duration,
    shutdown: CancellationToken,
    session: Session,
) {
    let endpoint = binding.endpoint;
    let mut pending = false;
    loop {
        let dialled = tokio::select! {
            _ = shutdown.cancelled() => break,
            dialled = stream::dial(&endpoint) => dialled,
        };
        match dialled {
            Ok(conn) => {
                if pending {
                    info!("{role} socket connected to {endpoint} after waiting");
                } else {
                    info!("{role} socket connected to {endpoint}");
                }
                pending = false;
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = session(conn) => {}
                }
            }
            Err(e) => {
                if !pending {
                    warn!("Connection pending: no peer at {endpoint} yet ({e}); retrying");
                    pending = true;
                }
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Stopped connecting to {endpoint}");
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hh_types::address::Endpoint;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn opts() -> SocketOptions {
        SocketOptions {
            reconnect_interval: Duration::from_millis(20),
            ..SocketOptions::default()
        }
    }

    fn ipc(dir: &tempfile::TempDir, name: &str) -> Endpoint {
        Endpoint::Ipc(dir.path().join(name))
    }

    #[tokio::test]
    async fn role_checks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let b = [Binding::bind(ipc(&tmp, "x.ipc"))];
        assert!(matches!(
            Sender::open(Role::Subscribe, &b, &opts()).await,
            Err(TransportError::WrongRole { .. })
        ));
        assert!(matches!(
            Receiver::open(Role::Push, &b, &opts()).await,
            Err(TransportError::WrongRole { .. })
        ));
        assert!(matches!(
            Sender::open(Role::Publish, &[], &opts()).await,
            Err(TransportError::NoAddress { .. })
        ));
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_drops_silently() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sender = Sender::open(Role::Publish, &[Binding::bind(ipc(&tmp, "p.ipc"))], &opts())
            .await
            .unwrap();
        assert_eq!(sender.publish_raw(b"a\tb"), Fanout::default());
        sender.send_raw(b"a\tb").await.unwrap();
    }

    #[tokio::test]
    async fn subscriber_started_first_waits_for_publisher() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = ipc(&tmp, "late.ipc");
        let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep.clone())], &opts())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let tx = Sender::open(Role::Publish, &[Binding::bind(ep)], &opts())
            .await
            .unwrap();
        timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

        tx.send_raw(b"late\tstart").await.unwrap();
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got[..], b"late\tstart");
    }

    #[tokio::test]
    async fn topic_filter_passes_matching_prefixes_only() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = ipc(&tmp, "t.ipc");
        let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
            .await
            .unwrap();
        let sub_opts = SocketOptions {
            topics: vec!["tag_".into()],
            ..opts()
        };
        let mut rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &sub_opts)
            .await
            .unwrap();
        timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

        tx.send_raw(b"focus_changed\t0x1\tterm").await.unwrap();
        tx.send_raw(b"tag_changed\t2\tDP-1").await.unwrap();

        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got[..], b"tag_changed\t2\tDP-1");
    }

    #[tokio::test]
    async fn pull_inbox_ignores_topic_prefixes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = ipc(&tmp, "inbox.ipc");
        let pull_opts = SocketOptions {
            topics: vec!["tag_".into()],
            ..opts()
        };
        let mut rx = Receiver::open(Role::Pull, &[Binding::bind(ep.clone())], &pull_opts)
            .await
            .unwrap();
        let tx = Sender::open(Role::Push, &[Binding::connect(ep)], &opts())
            .await
            .unwrap();

        tx.send_raw(b"note\t1\thi").await.unwrap();
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got[..], b"note\t1\thi");
    }

    #[tokio::test]
    async fn close_stops_dialling_and_still_flushes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = ipc(&tmp, "flush.ipc");
        let mut rx = Receiver::open(Role::Subscribe, &[Binding::bind(ep.clone())], &opts())
            .await
            .unwrap();
        let tx = Sender::open(Role::Publish, &[Binding::connect(ep)], &opts())
            .await
            .unwrap();
        timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();

        for i in 0..50 {
            tx.send_raw(format!("n\t{i}").as_bytes()).await.unwrap();
        }
        timeout(WAIT, tx.close()).await.unwrap();

        for i in 0..50 {
            let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(&got[..], format!("n\t{i}").as_bytes());
        }
        // The closed sender does not come back.
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn push_waits_for_a_puller() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = ipc(&tmp, "q.ipc");
        let tx = Sender::open(Role::Push, &[Binding::connect(ep.clone())], &opts())
            .await
            .unwrap();

        let send = tokio::spawn(async move {
            tx.send_raw(b"queued\t1").await.unwrap();
            tx.close().await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut rx = Receiver::open(Role::Pull, &[Binding::bind(ep)], &opts())
            .await
            .unwrap();
        let got = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got[..], b"queued\t1");
        timeout(WAIT, send).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn push_round_robins_between_pullers() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = ipc(&tmp, "a.ipc");
        let b = ipc(&tmp, "b.ipc");
        let mut rx_a = Receiver::open(Role::Pull, &[Binding::bind(a.clone())], &opts())
            .await
            .unwrap();
        let mut rx_b = Receiver::open(Role::Pull, &[Binding::bind(b.clone())], &opts())
            .await
            .unwrap();
        let tx = Sender::open(Role::Push, &[Binding::connect(a), Binding::connect(b)], &opts())
            .await
            .unwrap();
        timeout(WAIT, tx.wait_for_peers(2)).await.unwrap();

        for i in 0..4 {
            tx.send_raw(format!("n\t{i}").as_bytes()).await.unwrap();
        }
        for rx in [&mut rx_a, &mut rx_b] {
            for _ in 0..2 {
                timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            }
        }
    }
}
