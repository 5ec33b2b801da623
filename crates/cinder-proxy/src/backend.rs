//! Backend helper connection tasks.
//!
//! One task per helper connection. The task connects (and reconnects,
//! with capped backoff), reports up/down transitions to the pool
//! scheduler, and executes one task at a time: write the
//! correlation-framed request, then read replies until the one matching
//! the job's message id arrives. Replies may interleave out of order;
//! the in-flight map correlates them by id, and teardown fails every
//! entry exactly once.

use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use cinder_core::pool::{HelperEvent, HelperTask, Job, JobOutcome, PoolHandle};
use cinder_core::RelayError;
use cinder_protocol::{parse_reply, serialize, Command, Unit};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::stats;

/// Initial reconnect delay; doubles per failure up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// How long a reload control exchange may take before the connection is
/// considered wedged.
const RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

/// The reload control unit broadcast to helpers: a refresh command
/// framed with correlation id 0, which no real request ever uses.
pub fn reload_unit() -> Bytes {
    let mut buf = BytesMut::new();
    serialize::encode_forward(
        &mut buf,
        0,
        &Unit {
            seq: 0,
            payload: Bytes::from_static(&[Command::Refresh as u8]),
        },
    );
    buf.freeze()
}

/// Runs one helper connection for its whole lifetime.
///
/// Exits only when the pool side of the task channel is dropped.
pub async fn run_helper(
    addr: String,
    group: usize,
    group_name: String,
    index: usize,
    pool: PoolHandle,
    mut tasks: mpsc::Receiver<HelperTask>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let stream = match TcpStream::connect(&addr).await {
            Ok(s) => {
                backoff = INITIAL_BACKOFF;
                if let Err(e) = s.set_nodelay(true) {
                    debug!(helper = index, "set_nodelay failed, ignored: {e}");
                }
                s
            }
            Err(e) => {
                debug!(group = %group_name, helper = index, addr = %addr, "connect failed: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        info!(group = %group_name, helper = index, addr = %addr, "helper connected");
        stats::helper_transition(&group_name, true);
        pool.notify(HelperEvent::Up { group, helper: index }).await;

        let result = serve_connection(stream, group, &group_name, index, &pool, &mut tasks).await;

        stats::helper_transition(&group_name, false);
        pool.notify(HelperEvent::Down { group, helper: index }).await;

        match result {
            Ok(()) => {
                // task channel closed: the pool is shutting down
                debug!(group = %group_name, helper = index, "helper task exiting");
                return;
            }
            Err(e) => {
                warn!(group = %group_name, helper = index, "helper connection lost: {e}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Serves one live connection until it errors or the task channel
/// closes. Any in-flight job is failed exactly once on the way out.
async fn serve_connection(
    mut stream: TcpStream,
    group: usize,
    group_name: &str,
    index: usize,
    pool: &PoolHandle,
    tasks: &mut mpsc::Receiver<HelperTask>,
) -> io::Result<()> {
    let mut inflight: HashMap<u64, tokio::sync::oneshot::Sender<JobOutcome>> = HashMap::new();
    let mut buf = BytesMut::with_capacity(8 * 1024);

    let result = drive(
        &mut stream,
        tasks,
        &mut inflight,
        &mut buf,
        pool,
        group,
        group_name,
        index,
    )
    .await;

    for (_, reply) in inflight.drain() {
        let _ = reply.send(JobOutcome::Failed(RelayError::UpstreamUnavailable));
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    stream: &mut TcpStream,
    tasks: &mut mpsc::Receiver<HelperTask>,
    inflight: &mut HashMap<u64, tokio::sync::oneshot::Sender<JobOutcome>>,
    buf: &mut BytesMut,
    pool: &PoolHandle,
    group: usize,
    group_name: &str,
    index: usize,
) -> io::Result<()> {
    loop {
        let Some(task) = tasks.recv().await else {
            return Ok(());
        };
        let started = Instant::now();

        match task {
            HelperTask::Execute(job) => {
                let Job {
                    id,
                    payload,
                    deadline,
                    reply,
                } = job;
                inflight.insert(id, reply);
                stream.write_all(&payload).await?;

                match await_reply(stream, buf, inflight, id, deadline).await? {
                    ReplyStatus::Answered => {
                        let latency_us = started.elapsed().as_micros() as u64;
                        stats::helper_job_done(group_name, latency_us);
                        pool.notify(HelperEvent::Done {
                            group,
                            helper: index,
                            latency_us,
                        })
                        .await;
                    }
                    ReplyStatus::TimedOut => {
                        if let Some(reply) = inflight.remove(&id) {
                            let _ = reply.send(JobOutcome::Failed(RelayError::Timeout));
                        }
                        // the reply may still be in flight; the stream
                        // position is no longer trustworthy
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "backend response timed out",
                        ));
                    }
                }
            }
            HelperTask::Reload(unit) => {
                stream.write_all(&unit).await?;
                match await_reply(stream, buf, inflight, 0, Instant::now() + RELOAD_TIMEOUT)
                    .await?
                {
                    ReplyStatus::Answered => {
                        debug!(helper = index, "helper acknowledged config reload");
                        let latency_us = started.elapsed().as_micros() as u64;
                        pool.notify(HelperEvent::Done {
                            group,
                            helper: index,
                            latency_us,
                        })
                        .await;
                    }
                    ReplyStatus::TimedOut => {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "reload acknowledgment timed out",
                        ));
                    }
                }
            }
        }
    }
}

enum ReplyStatus {
    Answered,
    TimedOut,
}

/// Reads correlation-framed replies until the one with id `want`
/// arrives or `deadline` passes. Replies for other in-flight ids are
/// resolved as they appear; replies for unknown ids are dropped with a
/// warning.
async fn await_reply(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    inflight: &mut HashMap<u64, tokio::sync::oneshot::Sender<JobOutcome>>,
    want: u64,
    deadline: Instant,
) -> io::Result<ReplyStatus> {
    use tokio::io::AsyncReadExt;

    loop {
        // drain complete replies already buffered
        loop {
            let frozen = buf.split().freeze();
            match parse_reply(&frozen) {
                Ok(Some((reply, consumed))) => {
                    buf.extend_from_slice(&frozen[consumed..]);
                    if let Some(sender) = inflight.remove(&reply.id) {
                        let _ = sender.send(JobOutcome::Response(reply.unit.clone()));
                    } else if reply.id != want {
                        warn!(id = reply.id, "reply for unknown message id, dropping");
                    }
                    if reply.id == want {
                        return Ok(ReplyStatus::Answered);
                    }
                }
                Ok(None) => {
                    buf.extend_from_slice(&frozen);
                    break;
                }
                Err(e) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }

        let read = tokio::time::timeout_at(deadline.into(), stream.read_buf(buf));
        match read.await {
            Ok(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "backend closed the connection",
                ));
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(ReplyStatus::TimedOut),
        }
    }
}
