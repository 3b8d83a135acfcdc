//! The async shell: accept loop and per-connection reader/writer tasks.
//!
//! Tasks here never touch the state graph; everything state-visible is
//! marshalled to the reactor over the event channel.

pub mod limit;

use crate::reactor::Event;
use crate::state::ClientId;
use bytes::BytesMut;
use comet_proto::MessageCodec;
use limit::ConnLimiter;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

/// Accept connections forever, applying the per-CIDR limiter before the
/// reactor ever sees the socket.
pub async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    limiter: Arc<Mutex<ConnLimiter>>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };

        let now = crate::state::unix_now();
        let allowed = {
            let mut limiter = limiter.lock();
            // Accepts are the only thing that grow the window map, so
            // sweeping here keeps it bounded.
            limiter.sweep(now);
            limiter.allow(addr.ip(), now)
        };
        if !allowed {
            debug!(peer = %addr, "connection rate limit exceeded");
            let mut stream = stream;
            let _ = stream
                .write_all(b"ERROR :Too many connections from your network\r\n")
                .await;
            continue;
        }

        info!(peer = %addr, "connection accepted");
        if events.send(Event::Accept { stream, addr }).await.is_err() {
            // Reactor is gone; nothing left to accept for.
            return;
        }
    }
}

/// Spawn the reader task for an attached client; returns its abort
/// handle, which the reactor holds for teardown.
pub fn spawn_reader(
    client: ClientId,
    read_half: OwnedReadHalf,
    events: mpsc::Sender<Event>,
) -> AbortHandle {
    tokio::spawn(read_loop(client, read_half, events)).abort_handle()
}

async fn read_loop(client: ClientId, mut read_half: OwnedReadHalf, events: mpsc::Sender<Event>) {
    let mut codec = MessageCodec::new();
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                let _ = events
                    .send(Event::Closed {
                        client,
                        reason: "Connection closed".to_string(),
                    })
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = events
                    .send(Event::Closed {
                        client,
                        reason: format!("Read error: {e}"),
                    })
                    .await;
                return;
            }
        }

        // Drain every complete frame the chunk completed.
        loop {
            match codec.decode(&mut buffer) {
                Ok(Some(msg)) => {
                    if events.send(Event::Frame { client, msg }).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) if e.is_recoverable() => {
                    let recoverable = Event::Recoverable {
                        client,
                        error_code: e.error_code(),
                        detail: e.to_string(),
                    };
                    if events.send(recoverable).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(Event::Closed {
                            client,
                            reason: format!("Protocol error: {e}"),
                        })
                        .await;
                    return;
                }
            }
        }
    }
}

/// Drain the outbound queue onto the socket. Runs until the queue closes
/// (client destruction drops the sender) and performs the final drain
/// before shutting the stream down.
pub async fn write_loop(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<String>) {
    while let Some(line) = outbound.recv().await {
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
