//! Per-connection handler: the request pipeline.
//!
//! Reads protocol units from a client stream, drives each request
//! through receive → parse → (loop-back | forward | reject) →
//! await-backend → reply, and writes responses back in the order the
//! requests arrived. Uses a two-phase dispatch-collect pattern: all
//! units parsed from a read are dispatched (forwarded jobs are just an
//! mpsc send), then their replies are collected strictly in request
//! order, so pipelined requests overlap on the backends without ever
//! reordering the reply stream.
//!
//! A connection starts in the authenticating stage: its first unit is
//! answered with a synthesized OK, bypassing command parsing. A
//! malformed unit is connection-fatal: everything the connection still
//! owns is force-completed with an error before teardown.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use cinder_core::pool::{Job, JobOutcome, PoolHandle};
use cinder_core::{
    route_key, Continuum, HashKind, MessageArena, MsgId, QueueKind, RelayError, RouteClass,
    RuleClassifier,
};
use cinder_protocol::{
    extract_sql_key, parse_unit, serialize, Command, Dispatch, KeyType, Unit,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::stats;

/// Error number for commands the proxy refuses to handle.
const ER_UNKNOWN_COM: u16 = 1047;

/// Everything a connection needs from its pool, shared across all of
/// the pool's connections.
pub struct PoolContext {
    pub name: String,
    pub continuum: Continuum,
    pub hash: HashKind,
    /// Key field name scanned for in statements.
    pub key_field: Vec<u8>,
    /// Schema type of the key field.
    pub key_type: KeyType,
    /// End-to-end request timeout.
    pub timeout: Duration,
    pub pool: PoolHandle,
    /// Connector group index per continuum backend.
    pub cache_groups: Vec<usize>,
    /// Hot-shard group, when configured.
    pub hot_group: Option<usize>,
    /// Full-database group, when configured.
    pub full_group: Option<usize>,
    pub classifier: Arc<dyn RuleClassifier>,
    /// Synthetic-key counter for the no-key routing class.
    pub synth_keys: AtomicU64,
    /// Worker-wide message id source.
    pub unit_ids: Arc<AtomicU64>,
}

/// A reply owed to the client, in request order.
enum Pending {
    /// Synthesized locally at dispatch time.
    Immediate { msg: MsgId, reply: Bytes },
    /// Waiting on a backend job.
    Forwarded {
        msg: MsgId,
        rx: oneshot::Receiver<JobOutcome>,
    },
}

/// Drives one client connection to completion.
///
/// Returns `Ok` on clean disconnect and `Err` on an I/O or protocol
/// failure; either way every message the connection owned has been
/// completed and released.
pub async fn handle(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<PoolContext>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::with_capacity(8 * 1024);
    let mut arena = MessageArena::new(ctx.unit_ids.clone());
    // client-side tracking queues: fragment siblings live in `inbound`,
    // replies owed to the client in `outbound`
    let mut inbound: VecDeque<MsgId> = VecDeque::new();
    let mut outbound: VecDeque<MsgId> = VecDeque::new();
    let mut pending: Vec<Pending> = Vec::new();
    let mut authenticated = false;

    loop {
        match stream.read_buf(&mut buf).await {
            Ok(0) => {
                // end of input: a partial unit still buffered is
                // discarded, not an error
                if !buf.is_empty() {
                    debug!(
                        %peer,
                        len = buf.len(),
                        "eof: discarding incomplete unit"
                    );
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => return Err(e.into()),
        }

        // parse every complete unit out of the buffer
        let mut units = Vec::new();
        let mut fatal = None;
        let frozen = buf.split().freeze();
        let mut offset = 0;
        loop {
            let remaining = frozen.slice(offset..);
            if remaining.is_empty() {
                break;
            }
            match parse_unit(&remaining) {
                Ok(Some((unit, consumed))) => {
                    offset += consumed;
                    units.push(unit);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, "protocol error: {e}");
                    fatal = Some(e);
                    break;
                }
            }
        }
        // keep the unconsumed remainder for the next read
        if fatal.is_none() && offset < frozen.len() {
            buf.extend_from_slice(&frozen[offset..]);
        }

        // dispatch phase
        for unit in units {
            stats::request_received(&ctx.name, unit.wire_len());

            // empty units are filtered without ever entering the pipeline
            if unit.is_empty() {
                debug!(%peer, "filtered empty unit");
                continue;
            }

            if !authenticated {
                pending.push(loopback_auth(&ctx, &mut arena, &mut outbound, &unit));
                authenticated = true;
                continue;
            }

            let command = Command::from_byte(unit.payload[0]);
            match command.dispatch() {
                Dispatch::ReplyOk => {
                    pending.push(loopback_ok(&ctx, &mut arena, &mut outbound, command, &unit));
                }
                Dispatch::ReplyError => {
                    pending.push(loopback_unsupported(
                        &ctx,
                        &mut arena,
                        &mut outbound,
                        command,
                        &unit,
                    ));
                }
                Dispatch::Forward => {
                    let p =
                        forward(&ctx, &mut arena, &mut inbound, &mut outbound, command, &unit)
                            .await;
                    pending.push(p);
                }
            }
        }

        // collect phase: resolve replies strictly in request order
        out.clear();
        for p in pending.drain(..) {
            match p {
                Pending::Immediate { msg, reply } => {
                    out.extend_from_slice(&reply);
                    arena.dequeue(&mut outbound, QueueKind::ClientOut, msg);
                    arena.release(msg);
                }
                Pending::Forwarded { msg, rx } => {
                    let outcome = rx
                        .await
                        .unwrap_or(JobOutcome::Failed(RelayError::UpstreamUnavailable));
                    collect_forwarded(&ctx, &mut arena, &mut inbound, &mut outbound, msg, outcome, &mut out);
                }
            }
        }
        if !out.is_empty() {
            stream.write_all(&out).await?;
        }

        if let Some(e) = fatal {
            let orphaned = arena.force_complete(RelayError::Protocol);
            if orphaned > 0 {
                debug!(%peer, orphaned, "force-completed messages on teardown");
            }
            return Err(e.into());
        }
    }
}

/// Authentication-stage exchange: answer with a fixed OK, no command
/// parsing.
fn loopback_auth(
    ctx: &PoolContext,
    arena: &mut MessageArena,
    outbound: &mut VecDeque<MsgId>,
    unit: &Unit,
) -> Pending {
    // the login exchange carries no command byte
    let msg = arena.insert_request(
        Command::Connect,
        unit.seq,
        unit.payload.clone(),
        Instant::now() + ctx.timeout,
    );
    arena.get_mut(msg).expect("fresh message").mark_done();
    arena.enqueue(outbound, QueueKind::ClientOut, msg);

    let mut reply = BytesMut::new();
    serialize::ok_unit(&mut reply, unit.seq.wrapping_add(1));
    Pending::Immediate {
        msg,
        reply: reply.freeze(),
    }
}

/// Locally acknowledged command: synthesized OK, no backend contact.
fn loopback_ok(
    ctx: &PoolContext,
    arena: &mut MessageArena,
    outbound: &mut VecDeque<MsgId>,
    command: Command,
    unit: &Unit,
) -> Pending {
    let msg = arena.insert_request(
        command,
        unit.seq,
        unit.payload.clone(),
        Instant::now() + ctx.timeout,
    );
    arena.get_mut(msg).expect("fresh message").mark_done();
    arena.enqueue(outbound, QueueKind::ClientOut, msg);

    let mut reply = BytesMut::new();
    serialize::ok_unit(&mut reply, unit.seq.wrapping_add(1));
    Pending::Immediate {
        msg,
        reply: reply.freeze(),
    }
}

/// Command the proxy refuses: synthesized error reply, connection
/// survives.
fn loopback_unsupported(
    ctx: &PoolContext,
    arena: &mut MessageArena,
    outbound: &mut VecDeque<MsgId>,
    command: Command,
    unit: &Unit,
) -> Pending {
    debug!(command = command.name(), "refusing unsupported command");
    let msg = arena.insert_request(
        command,
        unit.seq,
        unit.payload.clone(),
        Instant::now() + ctx.timeout,
    );
    arena.get_mut(msg).expect("fresh message").mark_done();
    arena.enqueue(outbound, QueueKind::ClientOut, msg);

    let mut reply = BytesMut::new();
    serialize::err_unit(
        &mut reply,
        unit.seq.wrapping_add(1),
        ER_UNKNOWN_COM,
        &format!("command {} is not supported by the proxy", command.name()),
    );
    Pending::Immediate {
        msg,
        reply: reply.freeze(),
    }
}

/// Forwardable command: extract the key, route it, classify it, and
/// hand the job to the connector pool.
async fn forward(
    ctx: &PoolContext,
    arena: &mut MessageArena,
    inbound: &mut VecDeque<MsgId>,
    outbound: &mut VecDeque<MsgId>,
    command: Command,
    unit: &Unit,
) -> Pending {
    let deadline = Instant::now() + ctx.timeout;
    let msg = arena.insert_request(command, unit.seq, unit.payload.clone(), deadline);

    // key positions: statements carry the key in their text; the
    // statement-execute class routes keyless by design
    if command == Command::Query {
        match extract_sql_key(&unit.payload[1..], &ctx.key_field) {
            Ok(range) => {
                // shift past the command byte
                let range = range.start + 1..range.end + 1;
                arena
                    .get_mut(msg)
                    .expect("fresh message")
                    .keys
                    .push((range, ctx.key_type));
            }
            Err(e) => {
                debug!("no key extracted: {e}");
            }
        }
    }

    let routed = {
        let m = arena.get_mut(msg).expect("fresh message");
        route_key(m, ctx.hash, &ctx.continuum, &ctx.synth_keys)
    };
    let backend = match routed {
        Ok(b) => b,
        Err(e) => {
            let err: RelayError = e.into();
            if err == RelayError::Fragment {
                stats::fragment_error(&ctx.name);
            } else {
                stats::no_key_request(&ctx.name);
            }
            arena.get_mut(msg).expect("fresh message").mark_error(err);
            arena.enqueue(outbound, QueueKind::ClientOut, msg);

            let mut reply = BytesMut::new();
            serialize::err_unit(
                &mut reply,
                unit.seq.wrapping_add(1),
                err.errno(),
                &err.to_string(),
            );
            return Pending::Immediate {
                msg,
                reply: reply.freeze(),
            };
        }
    };

    let group = select_group(ctx, arena, msg, command, backend);

    // track the request on the client's inbound queue until its reply
    // is written
    arena.enqueue(inbound, QueueKind::ClientIn, msg);
    arena.enqueue(outbound, QueueKind::ClientOut, msg);

    let (job, rx) = {
        let m = arena.get(msg).expect("fresh message");
        let mut payload = BytesMut::with_capacity(m.payload.len() + 12);
        serialize::encode_forward(
            &mut payload,
            m.id,
            &Unit {
                seq: m.seq,
                payload: m.payload.clone(),
            },
        );
        let (reply, rx) = oneshot::channel();
        (
            Job {
                id: m.id,
                payload: payload.freeze(),
                deadline: m.deadline,
                reply,
            },
            rx,
        )
    };

    stats::request_forwarded(&ctx.name, unit.wire_len());
    ctx.pool.submit(group, job).await;
    Pending::Forwarded { msg, rx }
}

/// Picks the connector group for a routed request: statements go where
/// the rule classifier says, everything else to the cache group of the
/// selected backend. Classifier failure degrades to the full database.
fn select_group(
    ctx: &PoolContext,
    arena: &MessageArena,
    msg: MsgId,
    command: Command,
    backend: u16,
) -> usize {
    let cache_group = ctx.cache_groups[usize::from(backend)];
    if command != Command::Query {
        return cache_group;
    }

    let m = arena.get(msg).expect("routed message");
    let key = m
        .keys
        .first()
        .map(|(range, _)| &m.payload[range.clone()])
        .unwrap_or_default();

    let class = match std::str::from_utf8(&m.payload[1..]) {
        Ok(sql) => ctx
            .classifier
            .classify(sql, key)
            .unwrap_or(RouteClass::FullDatabase),
        Err(_) => RouteClass::FullDatabase,
    };

    match class {
        RouteClass::CacheLayer => cache_group,
        RouteClass::HotShard => ctx.hot_group.unwrap_or(cache_group),
        RouteClass::FullDatabase => ctx.full_group.unwrap_or(cache_group),
    }
}

/// Pairs a backend outcome to its request, finishes the fragment
/// bookkeeping, serializes the reply, and releases both sides.
fn collect_forwarded(
    ctx: &PoolContext,
    arena: &mut MessageArena,
    inbound: &mut VecDeque<MsgId>,
    outbound: &mut VecDeque<MsgId>,
    msg: MsgId,
    outcome: JobOutcome,
    out: &mut BytesMut,
) {
    match outcome {
        JobOutcome::Response(unit) => {
            let rsp = arena.insert_response(msg, unit.seq, unit.payload.clone());
            if let Some(m) = arena.get_mut(msg) {
                m.mark_done();
            }
            arena.fragment_completed(msg);

            if arena.request_done(inbound, msg) && !arena.request_error(inbound, msg) {
                serialize::write_unit(out, unit.seq, &unit.payload);
            } else {
                // a sibling fragment failed: the logical request errors
                let seq = arena.get(msg).map(|m| m.seq).unwrap_or(0);
                let err = arena
                    .get(msg)
                    .and_then(|m| m.err)
                    .unwrap_or(RelayError::UpstreamUnavailable);
                serialize::err_unit(out, seq.wrapping_add(1), err.errno(), &err.to_string());
            }

            arena.dequeue(inbound, QueueKind::ClientIn, msg);
            arena.dequeue(outbound, QueueKind::ClientOut, msg);
            if let Some(rsp) = rsp {
                arena.release(rsp);
            }
            arena.release(msg);
        }
        JobOutcome::Failed(err) => {
            stats::job_failed(&ctx.name, err);
            if let Some(m) = arena.get_mut(msg) {
                m.mark_error(err);
            }
            arena.fragment_completed(msg);
            let _ = arena.request_done(inbound, msg);
            let _ = arena.request_error(inbound, msg);

            let seq = arena.get(msg).map(|m| m.seq).unwrap_or(0);
            serialize::err_unit(out, seq.wrapping_add(1), err.errno(), &err.to_string());

            arena.dequeue(inbound, QueueKind::ClientIn, msg);
            arena.dequeue(outbound, QueueKind::ClientOut, msg);
            arena.release(msg);
        }
    }
}
