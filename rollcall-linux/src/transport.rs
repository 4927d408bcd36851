//! TCP link emulation: one connection per attendee link, newline-delimited frames.
//!
//! A client opens with `LINK|<device-address>\n`. The address stands in for the radio's peer
//! address, so it stays the same across reconnects. Everything after that is frames.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub const LINK_PREFIX: &str = "LINK|";
/// Reads stop here; the engine rejects anything past its payload limit anyway.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Monotonic id of one TCP connection, so events from a replaced link can be told apart.
pub type ConnId = u64;

#[derive(Debug)]
pub enum LinkEvent {
    Connected {
        peer: String,
        conn: ConnId,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    Data {
        peer: String,
        conn: ConnId,
        bytes: Vec<u8>,
    },
    Disconnected {
        peer: String,
        conn: ConnId,
    },
    WriteFailed {
        peer: String,
        conn: ConnId,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct LinkTimeouts {
    pub handshake: Duration,
    pub write: Duration,
}

pub async fn run_listener(
    listener: TcpListener,
    events: mpsc::UnboundedSender<LinkEvent>,
    timeouts: LinkTimeouts,
) -> std::io::Result<()> {
    let mut next_conn: ConnId = 0;
    loop {
        let (stream, addr) = listener.accept().await?;
        next_conn += 1;
        let conn = next_conn;
        let events = events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, addr, conn, events, timeouts).await {
                debug!(%addr, error = %e, "link ended with error");
            }
        });
    }
}

async fn handle_conn(
    stream: TcpStream,
    addr: SocketAddr,
    conn: ConnId,
    events: mpsc::UnboundedSender<LinkEvent>,
    timeouts: LinkTimeouts,
) -> std::io::Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut hello = Vec::new();
    let n = tokio::time::timeout(timeouts.handshake, read_line(&mut reader, &mut hello))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no link handshake"))??;
    let hello = String::from_utf8_lossy(&hello[..n]);
    let Some(peer) = hello
        .trim_end()
        .strip_prefix(LINK_PREFIX)
        .map(str::trim)
        .filter(|p| !p.is_empty())
    else {
        warn!(%addr, "bad link handshake");
        return Ok(());
    };
    let peer = peer.to_string();
    info!(%addr, peer = %peer, conn, "link up");

    let (tx, rx) = mpsc::unbounded_channel();
    if events
        .send(LinkEvent::Connected {
            peer: peer.clone(),
            conn,
            tx,
        })
        .is_err()
    {
        return Ok(());
    }

    let writer_events = events.clone();
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        write_loop(write_half, rx, timeouts.write, &writer_peer, conn, writer_events).await;
    });

    let result = read_loop(&mut reader, &peer, conn, &events).await;
    let _ = events.send(LinkEvent::Disconnected { peer, conn });
    result
}

async fn read_loop(
    reader: &mut BufReader<OwnedReadHalf>,
    peer: &str,
    conn: ConnId,
    events: &mpsc::UnboundedSender<LinkEvent>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let n = read_line(reader, &mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        while buf.last().is_some_and(|b| *b == b'\n' || *b == b'\r') {
            buf.pop();
        }
        if buf.is_empty() {
            continue;
        }
        let event = LinkEvent::Data {
            peer: peer.to_string(),
            conn,
            bytes: buf.clone(),
        };
        if events.send(event).is_err() {
            return Ok(());
        }
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    reader.take(MAX_LINE_BYTES).read_until(b'\n', buf).await
}

/// Drains frames for one link. The channel closing is the coordinator's `Close`.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    write_timeout: Duration,
    peer: &str,
    conn: ConnId,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(mut frame) = rx.recv().await {
        frame.push(b'\n');
        match tokio::time::timeout(write_timeout, writer.write_all(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(peer, error = %e, "write failed");
                let _ = events.send(LinkEvent::WriteFailed {
                    peer: peer.to_string(),
                    conn,
                });
                return;
            }
            Err(_) => {
                warn!(peer, "write timed out");
                let _ = events.send(LinkEvent::WriteFailed {
                    peer: peer.to_string(),
                    conn,
                });
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
    debug!(peer, conn, "link closed");
}
