//! Producer nodes: `hcpub`, `stdpub`, `onepub`, `pullpub` and `onepush`.
//!
//! `onepub` and `onepush` are the two ways to emit a single event. `onepub`
//! publishes directly and has to hold its socket open for a moment so that
//! subscribers can finish connecting; anything sent before that is lost.
//! `onepush` instead hands the event to a running `pullpub`, whose pull
//! socket queues it, and `pullpub` republishes it to subscribers that are
//! already connected.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hh_types::address::Role;
use hh_types::event::{CodecError, Event};

use crate::process::LineSource;
use crate::transport::{Fanout, Receiver, Sender};

/// What a streaming publisher did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishStats {
    pub sent: u64,
    /// Input records that failed to parse and were dropped.
    pub malformed: u64,
}

type Echo<'a> = &'a mut (dyn AsyncWrite + Unpin + Send);

async fn echo_line(echo: Echo<'_>, line: &[u8]) -> std::io::Result<()> {
    echo.write_all(line).await?;
    echo.write_all(b"\n").await?;
    echo.flush().await
}

async fn publish_record(
    sender: &Sender,
    line: &str,
    parse: fn(&str) -> Result<Event, CodecError>,
    stats: &mut PublishStats,
) -> Result<()> {
    match parse(line) {
        Ok(event) => {
            sender.send(&event).await.context("Failed to send event")?;
            stats.sent += 1;
        }
        Err(e) => {
            warn!("Dropping input record: {e}");
            stats.malformed += 1;
        }
    }
    Ok(())
}

/// `stdpub`: publish one event per input line until EOF or shutdown. Every
/// line is echoed to `echo`.
pub async fn stdpub<R>(
    sender: &Sender,
    input: R,
    echo: Echo<'_>,
    shutdown: &CancellationToken,
) -> Result<PublishStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut stats = PublishStats::default();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read input")?,
        };
        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        if let Err(e) = echo_line(echo, line.as_bytes()).await {
            debug!("Echo failed: {e}");
        }
        publish_record(sender, &line, str::parse::<Event>, &mut stats).await?;
    }
    info!("stdpub finished: {} sent, {} malformed", stats.sent, stats.malformed);
    Ok(stats)
}

/// `hcpub`: run the window manager's idle-event command and publish each
/// line it prints. Raw lines are echoed to `echo`.
pub async fn hcpub(
    sender: &Sender,
    idle_command: &str,
    echo: Echo<'_>,
    shutdown: &CancellationToken,
) -> Result<PublishStats> {
    let mut source = LineSource::spawn(idle_command)
        .with_context(|| format!("Failed to start idle source `{idle_command}`"))?;
    let mut stats = PublishStats::default();

    let result = async {
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = source.next_line() => line.context("Failed to read idle events")?,
            };
            let Some(line) = line else {
                info!("Idle source closed its output");
                break;
            };
            if let Err(e) = echo_line(echo, line.as_bytes()).await {
                debug!("Echo failed: {e}");
            }
            publish_record(sender, &line, Event::from_idle_line, &mut stats).await?;
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    source.finish().await;
    result?;
    info!("hcpub finished: {} sent, {} malformed", stats.sent, stats.malformed);
    Ok(stats)
}

/// `onepub`: publish a single event and close.
///
/// The socket stays open for `delay` before sending so that subscribers
/// dialling in can complete their connection. This narrows the window in
/// which a freshly started subscriber misses the event; it does not close
/// it. A zero delay sends immediately.
pub async fn onepub(sender: Sender, event: &Event, delay: Duration) -> Result<Fanout> {
    if sender.role() != Role::Publish {
        bail!("onepub needs a publish socket, got {}", sender.role());
    }
    if !delay.is_zero() {
        debug!("Waiting {delay:?} for subscribers to connect");
        tokio::time::sleep(delay).await;
    }

    let fanout = sender.publish_raw(event.encode().as_bytes());
    if fanout.delivered == 0 {
        info!("No subscriber connected; event not delivered");
    } else {
        debug!("Event queued for {} subscriber(s)", fanout.delivered);
    }
    sender.close().await;
    Ok(fanout)
}

/// `onepush`: hand a single event to a pull socket and close.
///
/// Push queues instead of dropping, so no delay is needed. If no pull peer
/// shows up within `wait`, the event is dropped with a warning and `false`
/// is returned.
pub async fn onepush(sender: Sender, event: &Event, wait: Duration) -> Result<bool> {
    if sender.role() != Role::Push {
        bail!("onepush needs a push socket, got {}", sender.role());
    }
    let delivered = match tokio::time::timeout(wait, sender.send(event)).await {
        Ok(sent) => {
            sent.context("Failed to push event")?;
            true
        }
        Err(_) => {
            warn!("No pull peer within {wait:?}; event dropped");
            false
        }
    };
    sender.close().await;
    Ok(delivered)
}

/// `pullpub`: republish every record from `inbox` unchanged on `outbox`,
/// echoing each one. Runs until shutdown.
pub async fn pullpub(
    inbox: &mut Receiver,
    outbox: &Sender,
    echo: Echo<'_>,
    shutdown: &CancellationToken,
) -> Result<u64> {
    if inbox.role() != Role::Pull || outbox.role() != Role::Publish {
        bail!(
            "pullpub bridges pull to publish, got {} to {}",
            inbox.role(),
            outbox.role()
        );
    }
    let mut forwarded = 0u64;
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = inbox.recv() => record,
        };
        let Some(record) = record else {
            bail!("pull socket closed unexpectedly");
        };
        if let Err(e) = echo_line(echo, &record).await {
            debug!("Echo failed: {e}");
        }
        outbox.send_raw(&record).await.context("Failed to republish")?;
        forwarded += 1;
    }
    info!("pullpub finished: {forwarded} forwarded");
    Ok(forwarded)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::transport::SocketOptions;
    use hh_types::address::{Binding, Endpoint};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn opts() -> SocketOptions {
        SocketOptions {
            reconnect_interval: Duration::from_millis(20),
            ..SocketOptions::default()
        }
    }

    async fn pair(tmp: &tempfile::TempDir) -> (Sender, Receiver) {
        let ep = Endpoint::Ipc(tmp.path().join("hub.ipc"));
        let tx = Sender::open(Role::Publish, &[Binding::bind(ep.clone())], &opts())
            .await
            .unwrap();
        let rx = Receiver::open(Role::Subscribe, &[Binding::connect(ep)], &opts())
            .await
            .unwrap();
        timeout(WAIT, tx.wait_for_peers(1)).await.unwrap();
        (tx, rx)
    }

    #[tokio::test]
    async fn stdpub_publishes_lines_and_skips_malformed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = pair(&tmp).await;

        let input: &[u8] = b"tag_changed\t1\tDP-1\nnot-an-event\nbattery\t\t80%\n";
        let mut echo = Vec::new();
        let stats = stdpub(&tx, input, &mut echo, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats, PublishStats { sent: 2, malformed: 1 });
        assert_eq!(echo, input);
        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&first[..], b"tag_changed\t1\tDP-1");
        assert_eq!(&second[..], b"battery\t\t80%");
    }

    #[tokio::test]
    async fn hcpub_forwards_idle_output_including_bare_hooks() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, mut rx) = pair(&tmp).await;

        let idle = "printf 'focus_changed\\t0x2\\tterm\\nreload\\n'";
        let stats = hcpub(&tx, idle, &mut tokio::io::sink(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.sent, 2);
        let first = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let second = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(&first[..], b"focus_changed\t0x2\tterm");
        assert_eq!(&second[..], b"reload\t");
    }

    #[tokio::test]
    async fn hcpub_stops_on_shutdown() {
        let tmp = tempfile::TempDir::new().unwrap();
        let (tx, _rx) = pair(&tmp).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let stats = timeout(WAIT, hcpub(&tx, "sleep 30", &mut tokio::io::sink(), &shutdown))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, PublishStats::default());
    }

    #[tokio::test]
    async fn onepush_gives_up_after_wait() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = Endpoint::Ipc(tmp.path().join("nobody.ipc"));
        let tx = Sender::open(Role::Push, &[Binding::connect(ep)], &opts())
            .await
            .unwrap();
        let event = Event::new("a", "1", ["x"]).unwrap();
        let delivered = onepush(tx, &event, Duration::from_millis(50)).await.unwrap();
        assert!(!delivered);
    }

    #[tokio::test]
    async fn onepub_rejects_push_socket() {
        let tmp = tempfile::TempDir::new().unwrap();
        let ep = Endpoint::Ipc(tmp.path().join("x.ipc"));
        let tx = Sender::open(Role::Push, &[Binding::connect(ep)], &opts())
            .await
            .unwrap();
        let event = Event::new("a", "1", ["x"]).unwrap();
        assert!(onepub(tx, &event, Duration::ZERO).await.is_err());
    }
}
