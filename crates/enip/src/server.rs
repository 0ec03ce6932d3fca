//! The session server: a TCP listener spawning one task per accepted
//! connection, an optional UDP responder for the List* discovery
//! commands, and cooperative shutdown via a cancellation token.

use anyhow::Context;
use cip::Device;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::session::{Activity, Session, Sessions};

#[derive(Debug, Clone)]
pub struct Options {
    /// TCP (and UDP) bind address.
    pub bind: SocketAddr,
    /// Also answer ListIdentity / ListServices / ListInterfaces over UDP.
    pub udp: bool,
    /// How long a `recv` may block before shutdown intent is re-polled.
    pub latency: Duration,
    /// Drop a session with no traffic for this long; None means forever.
    pub idle_timeout: Option<Duration>,
    /// How long a session may take to wind down after shutdown begins.
    pub grace: Duration,
    /// Maximum concurrently-served TCP connections.
    pub max_connections: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            bind: ([0, 0, 0, 0], crate::DEFAULT_PORT).into(),
            udp: false,
            latency: Duration::from_millis(500),
            idle_timeout: None,
            grace: Duration::from_secs(1),
            max_connections: 256,
        }
    }
}

/// Accept and serve sessions until `stop` is cancelled. Listener and
/// sessions all poll the token; in-flight requests finish before their
/// sockets close.
pub async fn serve(
    device: Arc<Device>,
    options: Options,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let sessions = Arc::new(Sessions::new());
    let listener = TcpListener::bind(options.bind)
        .await
        .with_context(|| format!("failed to bind {}", options.bind))?;
    let local = listener.local_addr().context("listener has no local address")?;
    tracing::info!(%local, "EtherNet/IP server listening");

    if options.udp {
        let udp = UdpSocket::bind(options.bind)
            .await
            .with_context(|| format!("failed to bind UDP {}", options.bind))?;
        tokio::spawn(serve_udp(
            udp,
            device.clone(),
            sessions.clone(),
            local,
            stop.clone(),
        ));
    }

    // Forward-opened connections that fall silent past their RPI ×
    // timeout-multiplier budget get swept.
    {
        let device = device.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {
                        for connection in device.connections.sweep_expired() {
                            tracing::info!(
                                o_t = connection.o_t_id,
                                "connection timed out; released"
                            );
                        }
                    }
                    _ = stop.cancelled() => return,
                }
            }
        });
    }

    let limit = Arc::new(tokio::sync::Semaphore::new(options.max_connections));
    let tasks = tokio_util::task::TaskTracker::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let Ok((socket, peer)) = accepted else { continue };
                let Ok(permit) = limit.clone().try_acquire_owned() else {
                    tracing::warn!(%peer, "connection limit reached; rejecting");
                    continue;
                };
                let session = Session::new(device.clone(), sessions.clone(), peer, local);
                let options = options.clone();
                let stop = stop.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    if let Err(err) = serve_connection(session, socket, peer, options, stop).await {
                        tracing::warn!(%peer, %err, "session ended with error");
                    }
                });
            }
            _ = stop.cancelled() => break,
        }
    }

    // Wait out the per-session grace period, then report stragglers.
    tasks.close();
    tokio::select! {
        _ = tasks.wait() => {}
        _ = tokio::time::sleep(options.grace + options.latency) => {
            tracing::warn!(remaining = tasks.len(), "sessions outlived the grace period");
        }
    }
    tracing::info!("EtherNet/IP server stopped");
    Ok(())
}

/// Serve one TCP session: read, feed the parser, write replies, repeat.
async fn serve_connection(
    mut session: Session,
    mut socket: TcpStream,
    peer: SocketAddr,
    options: Options,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(%peer, "accepted session");
    socket.set_nodelay(true).ok();
    let (mut reader, mut writer) = socket.split();
    let mut buf = vec![0u8; 4096];
    let mut out = Vec::new();
    let mut idle = Duration::ZERO;

    let result: anyhow::Result<()> = async {
        loop {
            out.clear();
            let activity = session.drive(&mut out)?;
            if !out.is_empty() {
                writer.write_all(&out).await.context("writing reply")?;
            }
            if activity == Activity::Close {
                return Ok(());
            }

            // Wait for input; the parser is only re-driven once the
            // session has something new (bytes, or EOF).
            loop {
                tokio::select! {
                    read = reader.read(&mut buf) => {
                        idle = Duration::ZERO;
                        match read.context("reading request")? {
                            0 => session.eof(),
                            n => session.feed(buf[..n].to_vec()),
                        }
                        break;
                    }
                    _ = tokio::time::sleep(options.latency) => {
                        // recv timed out: poll shutdown intent and idleness.
                        idle += options.latency;
                        if let Some(limit) = options.idle_timeout {
                            if idle >= limit {
                                tracing::info!(%peer, "session idle timeout");
                                return Ok(());
                            }
                        }
                    }
                    _ = stop.cancelled() => {
                        // Drain whatever is already buffered (one clean
                        // parse failure or a final reply), then half-close
                        // and give the peer a grace period to hang up.
                        session.eof();
                        out.clear();
                        if session.drive(&mut out).is_ok() && !out.is_empty() {
                            writer.write_all(&out).await.ok();
                        }
                        writer.shutdown().await.ok();
                        let deadline = tokio::time::sleep(options.grace);
                        tokio::pin!(deadline);
                        loop {
                            tokio::select! {
                                read = reader.read(&mut buf) => match read {
                                    Ok(0) | Err(_) => break,
                                    Ok(_) => continue,
                                },
                                _ = &mut deadline => {
                                    tracing::warn!(%peer, "forcing close after grace period");
                                    break;
                                }
                            }
                        }
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;

    session.teardown();
    tracing::info!(%peer, "session closed");
    result
}

/// Answer ListIdentity / ListServices / ListInterfaces datagrams: each
/// one is a self-contained frame driven through a throwaway session.
async fn serve_udp(
    udp: UdpSocket,
    device: Arc<Device>,
    sessions: Arc<Sessions>,
    local: SocketAddr,
    stop: CancellationToken,
) {
    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            received = udp.recv_from(&mut buf) => {
                let Ok((n, peer)) = received else { continue };
                let mut session = Session::new(device.clone(), sessions.clone(), peer, local);
                session.feed(buf[..n].to_vec());
                session.eof();
                let mut out = Vec::new();
                match session.drive(&mut out) {
                    Ok(_) if !out.is_empty() => {
                        if let Err(err) = udp.send_to(&out, peer).await {
                            tracing::warn!(%peer, %err, "UDP reply failed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::debug!(%peer, %err, "bad UDP frame"),
                }
                session.teardown();
            }
            _ = stop.cancelled() => return,
        }
    }
}
