//! Attendee client: drives an `AttendeeSession` against a collector over the TCP link emulation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::Context;
use rollcall_core::{AttendeeAction, AttendeeSession, EngineConfig, StudentRecord};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::transport::LINK_PREFIX;

pub struct AttendeeOptions {
    pub collector: String,
    pub device: String,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub tick: Duration,
}

struct Link {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

/// Send one record and wait for the collector's answer. Returns the acknowledged message id.
pub async fn run(
    record: StudentRecord,
    engine: &EngineConfig,
    opts: &AttendeeOptions,
) -> anyhow::Result<String> {
    let mut session = AttendeeSession::new(record, engine).context("invalid record")?;
    let mut pending: VecDeque<AttendeeAction> = session.start().into();
    let mut link: Option<Link> = None;
    let mut outcome: Option<anyhow::Result<String>> = None;
    let mut interval = tokio::time::interval(opts.tick);

    loop {
        while let Some(action) = pending.pop_front() {
            match action {
                AttendeeAction::Connect => match connect(opts).await {
                    Ok(l) => {
                        link = Some(l);
                        pending.extend(session.on_connected(Instant::now()));
                    }
                    Err(e) => {
                        warn!(collector = %opts.collector, error = %e, "connect failed");
                        pending.extend(session.on_disconnected(Instant::now()));
                    }
                },
                AttendeeAction::Send(mut frame) => {
                    let Some(l) = link.as_mut() else {
                        debug!("no link for outgoing frame");
                        continue;
                    };
                    frame.push(b'\n');
                    let written =
                        tokio::time::timeout(opts.write_timeout, l.writer.write_all(&frame)).await;
                    if !matches!(written, Ok(Ok(()))) {
                        warn!("write to collector failed");
                        link = None;
                        pending.extend(session.on_disconnected(Instant::now()));
                    }
                }
                AttendeeAction::Disconnect => {
                    if let Some(mut l) = link.take() {
                        let _ = l.writer.shutdown().await;
                        pending.extend(session.on_disconnected(Instant::now()));
                    }
                }
                AttendeeAction::Confirmed(id) => {
                    info!(id = %id, "attendance confirmed");
                    outcome = Some(Ok(id));
                }
                AttendeeAction::Failed(e) => {
                    outcome = Some(Err(e.into()));
                }
            }
        }
        if session.is_finished() {
            return outcome.unwrap_or_else(|| Err(anyhow::anyhow!("session ended without a result")));
        }

        tokio::select! {
            line = next_line(&mut link) => {
                let now = Instant::now();
                match line {
                    Ok(Some(text)) => pending.extend(session.on_frame(text.as_bytes(), now)),
                    Ok(None) | Err(_) => {
                        debug!("collector closed the link");
                        link = None;
                        pending.extend(session.on_disconnected(now));
                    }
                }
            }
            _ = interval.tick() => pending.extend(session.tick(Instant::now())),
        }
    }
}

async fn connect(opts: &AttendeeOptions) -> anyhow::Result<Link> {
    let stream = tokio::time::timeout(opts.connect_timeout, TcpStream::connect(&opts.collector))
        .await
        .context("connect timed out")?
        .with_context(|| format!("connecting to {}", opts.collector))?;
    let (read_half, mut writer) = stream.into_split();
    let hello = format!("{LINK_PREFIX}{}\n", opts.device);
    tokio::time::timeout(opts.write_timeout, writer.write_all(hello.as_bytes()))
        .await
        .context("link handshake timed out")?
        .context("sending link handshake")?;
    debug!(collector = %opts.collector, "link up");
    Ok(Link {
        lines: BufReader::new(read_half).lines(),
        writer,
    })
}

/// Next frame line; never resolves without a link.
async fn next_line(link: &mut Option<Link>) -> std::io::Result<Option<String>> {
    match link {
        Some(l) => l.lines.next_line().await,
        None => std::future::pending().await,
    }
}
