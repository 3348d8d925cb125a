//! Outbound peer bookkeeping for publish and push sockets.
//!
//! Every connected peer gets a bounded queue drained by its own writer task.
//! Publish fans a message into every queue and drops it for peers whose
//! queue is full; push hands it to one peer at a time, round-robin, waiting
//! while no peer is connected.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::stream::Conn;
use super::TransportError;

struct Peer {
    id: u64,
    label: String,
    tx: mpsc::Sender<Bytes>,
    writer: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    cursor: usize,
    closed: bool,
    peers: Vec<Peer>,
}

pub(crate) struct PeerSet {
    inner: Mutex<Inner>,
    count: watch::Sender<usize>,
    high_water_mark: usize,
}

/// Outcome of one publish fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fanout {
    pub delivered: usize,
    pub dropped: usize,
}

impl PeerSet {
    pub fn new(high_water_mark: usize) -> Arc<Self> {
        let (count, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            count,
            high_water_mark: high_water_mark.max(1),
        })
    }

    pub fn len(&self) -> usize {
        *self.count.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    /// Start serving `conn`. The returned receiver resolves once the peer's
    /// writer has stopped (peer hung up, write failed, or the set closed).
    pub fn attach(self: &Arc<Self>, conn: Conn) -> oneshot::Receiver<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let (tx, rx) = mpsc::channel(self.high_water_mark);

        let mut inner = self.lock();
        if inner.closed {
            return done_rx;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let label = conn.peer.clone();

        let set = Arc::clone(self);
        let writer = tokio::spawn(async move {
            let peer = conn.peer.clone();
            match run_writer(conn, rx).await {
                Ok(()) => debug!("Peer {peer} finished"),
                Err(e) => debug!("Peer {peer} write failed: {e}"),
            }
            set.detach(id);
            let _ = done_tx.send(());
        });

        info!("Peer connected: {label}");
        inner.peers.push(Peer {
            id,
            label,
            tx,
            writer,
        });
        let n = inner.peers.len();
        drop(inner);
        self.count.send_replace(n);
        done_rx
    }

    fn detach(&self, id: u64) {
        let mut inner = self.lock();
        if let Some(pos) = inner.peers.iter().position(|p| p.id == id) {
            let peer = inner.peers.remove(pos);
            info!("Peer disconnected: {}", peer.label);
        }
        let n = inner.peers.len();
        drop(inner);
        self.count.send_replace(n);
    }

    /// Queue `msg` for every peer. Never waits.
    pub fn publish(&self, msg: Bytes) -> Fanout {
        let inner = self.lock();
        let mut fanout = Fanout::default();
        for peer in &inner.peers {
            match peer.tx.try_send(msg.clone()) {
                Ok(()) => fanout.delivered += 1,
                Err(_) => {
                    debug!("Dropping message for slow peer {}", peer.label);
                    fanout.dropped += 1;
                }
            }
        }
        fanout
    }

    /// Queue `msg` for the next peer in round-robin order, waiting until at
    /// least one peer is connected.
    pub async fn push(&self, msg: Bytes) -> Result<(), TransportError> {
        let mut count = self.watch();
        loop {
            let next = {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(TransportError::Closed);
                }
                if inner.peers.is_empty() {
                    None
                } else {
                    let idx = inner.cursor % inner.peers.len();
                    inner.cursor = inner.cursor.wrapping_add(1);
                    let peer = &inner.peers[idx];
                    Some((peer.id, peer.tx.clone()))
                }
            };

            match next {
                Some((id, tx)) => match tx.send(msg.clone()).await {
                    Ok(()) => return Ok(()),
                    // Writer already gone; try the next peer.
                    Err(_) => self.detach(id),
                },
                None => {
                    if count.wait_for(|n| *n > 0).await.is_err() {
                        return Err(TransportError::Closed);
                    }
                }
            }
        }
    }

    /// Stop accepting peers and hand back the writer tasks. Dropping the
    /// queue senders lets each writer flush what is already queued and exit.
    pub fn close(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.lock();
        inner.closed = true;
        inner.peers.drain(..).map(|p| p.writer).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Poisoning would need a panic while holding the lock, and nothing
        // under it can panic; recover the data either way.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drain `rx` into the peer. Also watches the read side so an idle peer
/// that hangs up is noticed without waiting for the next write.
async fn run_writer(mut conn: Conn, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    let mut scratch = Vec::with_capacity(64);
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => {
                    conn.writer.write_all(&msg).await?;
                    conn.writer.flush().await?;
                }
                None => break,
            },
            n = conn.reader.read_buf(&mut scratch) => {
                if n? == 0 {
                    return Ok(());
                }
                scratch.clear();
            }
        }
    }
    conn.writer.shutdown().await
}
