//! Pipelined concurrent transfer engine.
//!
//! A pipelined transfer keeps up to `concurrency` requests unacknowledged on
//! the single SFTP channel. Replies arrive in whatever order the server
//! produces them; a dedicated receiver task routes each one to the waiting
//! worker through an inflight id table, and ordering is restored before any
//! byte reaches the caller:
//!
//! ```text
//! upload:    caller ──chunks──> WRITE packets ──> work queue ──> workers ──> errors
//! download:  producer ──READ packets──> work queue ──> workers ──> ordered slots ──> caller
//!                                  receiver ──frames by id──> workers
//! ```
//!
//! The inflight entry is created before its request is written, and removed
//! exactly once: by the receiver on reply, or by the drain when the receiver
//! exits. A reply for an id with no live entry means the channel can no
//! longer be trusted and ends the receiver.
//!
//! Teardown never abandons a frame mid-read on a healthy connection: the
//! driver waits for the inflight table to empty, then signals the receiver's
//! shutdown watch, which cancels the pending `recv` between frames. This is
//! the natively-cancellable alternative to waking the receiver with a no-op
//! packet.

use super::client::{SftpClient, SftpClientConfig};
use super::file::ChunkEnd;
use super::progress::ProgressSink;
use super::wire::{self, DataPacket, PacketType, ReadPacket, WritePacket};
use bytes::{Bytes, BytesMut};
use ferry_platform::{FerryError, FerryResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// A reply frame as delivered by the receiver task.
type Frame = (u8, Vec<u8>);

/// Whether a transfer of `size` bytes takes the pipelined path.
pub(crate) fn use_pipeline(config: &SftpClientConfig, size: u64) -> bool {
    config.concurrent_transfers && size > config.max_packet as u64
}

/// In-flight request count: enough to cover the whole transfer plus one,
/// capped by the configured maximum.
fn derive_concurrency(config: &SftpClientConfig, size: u64) -> usize {
    let max_packet = config.max_packet as u64;
    let chunks = (size + max_packet - 1) / max_packet + 1;
    chunks.min(config.max_concurrent_requests as u64).max(1) as usize
}

/// The id -> reply-sink table shared by one pipeline.
#[derive(Default)]
struct Inflight {
    pending: StdMutex<InflightState>,
    idle: Notify,
}

#[derive(Default)]
struct InflightState {
    entries: HashMap<u32, oneshot::Sender<Frame>>,
    /// Set once the receiver is gone; no further entry may be created.
    closed: bool,
}

impl Inflight {
    /// Registers a sink for `id`. Must happen before the request is sent.
    ///
    /// After the drain, the returned receiver resolves immediately with a
    /// closed-channel error instead of dangling with no one to fulfill it.
    fn register(&self, id: u32) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.pending.lock().unwrap();
        if !state.closed {
            state.entries.insert(id, tx);
        }
        rx
    }

    fn remove(&self, id: u32) -> Option<oneshot::Sender<Frame>> {
        let mut state = self.pending.lock().unwrap();
        let sink = state.entries.remove(&id);
        if state.entries.is_empty() {
            self.idle.notify_waiters();
        }
        sink
    }

    /// Drops every pending sink and refuses new entries; waiters observe a
    /// closed channel.
    fn drain(&self) {
        let mut state = self.pending.lock().unwrap();
        state.closed = true;
        state.entries.clear();
        drop(state);
        self.idle.notify_waiters();
    }

    /// Resolves once no entry is outstanding.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.lock().unwrap().entries.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Receiver task: demultiplexes replies by the id in the first four body
/// bytes. Exits on shutdown, on a connection error, or on a reply whose id
/// has no live entry; the last two drain the table so no worker blocks
/// forever.
async fn run_receiver(
    client: SftpClient,
    inflight: Arc<Inflight>,
    mut shutdown: watch::Receiver<bool>,
) -> FerryResult<()> {
    loop {
        tokio::select! {
            res = client.conn().recv() => match res {
                Ok((typ, body)) => {
                    if body.len() < 4 {
                        inflight.drain();
                        return Err(FerryError::Protocol("reply too short for id".to_string()));
                    }
                    let id = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    match inflight.remove(id) {
                        // the waiter may have been dropped by a cancel; fine
                        Some(sink) => {
                            let _ = sink.send((typ, body));
                        }
                        None => {
                            inflight.drain();
                            return Err(FerryError::Protocol(format!(
                                "reply for unknown request id {}",
                                id
                            )));
                        }
                    }
                }
                Err(e) => {
                    inflight.drain();
                    return Err(e);
                }
            },
            _ = shutdown.changed() => return Ok(()),
        }
    }
}

fn join_receiver_result(
    result: Result<FerryResult<()>, tokio::task::JoinError>,
) -> Option<FerryError> {
    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(_) => Some(FerryError::Protocol("receiver task panicked".to_string())),
    }
}

/// Picks the error at the lowest offset; ties keep the first reported.
fn lowest_offset_error(errors: Vec<(u64, FerryError)>) -> Option<(u64, FerryError)> {
    let mut best: Option<(u64, FerryError)> = None;
    for (offset, err) in errors {
        match &best {
            Some((b, _)) if *b <= offset => {}
            _ => best = Some((offset, err)),
        }
    }
    best
}

/// A worker placeholder for a torn-down sink carries `Closed`; the
/// receiver's own exit error is the real cause when it has one.
fn prefer_receiver_error(err: FerryError, receiver_err: Option<FerryError>) -> FerryError {
    match (err, receiver_err) {
        (FerryError::Closed, Some(real)) => real,
        (err, _) => err,
    }
}

struct WriteSlot {
    id: u32,
    offset: u64,
    reply: oneshot::Receiver<Frame>,
}

/// Pipelined upload. The calling task acts as producer and aggregator; the
/// spawned workers interpret WRITE acknowledgements as they land.
///
/// On failure the offset cursor is left at the lowest failed chunk offset;
/// on success it advances by the bytes read from `reader`.
pub(crate) async fn upload<R>(
    client: &SftpClient,
    handle: &[u8],
    offset: &mut u64,
    reader: &mut R,
    size: u64,
    progress: Option<&ProgressSink>,
) -> FerryResult<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let max_packet = client.config().max_packet as usize;
    let concurrency = derive_concurrency(client.config(), size);
    debug!(size, concurrency, "starting pipelined upload");

    let inflight = Arc::new(Inflight::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let receiver = tokio::spawn(run_receiver(client.clone(), inflight.clone(), shutdown_rx));

    let (work_tx, work_rx) = mpsc::channel::<WriteSlot>(concurrency);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<(u64, FerryError)>();
    let (cancel_tx, _) = watch::channel(false);

    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        workers.spawn(write_worker(
            work_rx.clone(),
            err_tx.clone(),
            cancel_tx.clone(),
        ));
    }
    drop(err_tx);

    // Producer loop: read a chunk, register the id, send the WRITE, hand the
    // pending acknowledgement to the workers. The bounded queue is the
    // backpressure: at most `concurrency` chunks are unacknowledged.
    let mut cancel_rx = cancel_tx.subscribe();
    let mut buf = vec![0u8; max_packet];
    let mut cur = *offset;
    let mut total = 0u64;
    let started = Instant::now();
    let mut local_err: Option<FerryError> = None;

    loop {
        if *cancel_rx.borrow() {
            break;
        }
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                local_err = Some(e.into());
                break;
            }
        };
        let id = client.next_request_id();
        let reply = inflight.register(id);
        let packet = WritePacket {
            id,
            handle,
            offset: cur,
            data: &buf[..n],
        };
        if let Err(e) = client.conn().send(&packet).await {
            inflight.remove(id);
            local_err = Some(e);
            break;
        }
        let slot = WriteSlot {
            id,
            offset: cur,
            reply,
        };
        tokio::select! {
            res = work_tx.send(slot) => {
                if res.is_err() {
                    break;
                }
            }
            _ = cancel_rx.changed() => break,
        }
        cur += n as u64;
        total += n as u64;
        if let Some(sink) = progress {
            sink.chunk(n as u64, total, size, started.elapsed());
        }
    }
    drop(work_tx);

    while let Some(joined) = workers.join_next().await {
        if joined.is_err() {
            let _ = cancel_tx.send(true);
            local_err.get_or_insert(FerryError::Protocol(
                "transfer worker panicked".to_string(),
            ));
        }
    }

    let mut worker_errors = Vec::new();
    while let Ok(err) = err_rx.try_recv() {
        worker_errors.push(err);
    }

    // Replies for chunks that never reached a worker still drain here, so
    // shutting the receiver down cannot abandon a frame mid-read.
    inflight.wait_idle().await;
    let _ = shutdown_tx.send(true);
    let receiver_err = join_receiver_result(receiver.await);

    if let Some((failed_offset, err)) = lowest_offset_error(worker_errors) {
        *offset = failed_offset;
        let err = prefer_receiver_error(err, receiver_err);
        warn!(offset = failed_offset, error = %err, "pipelined upload failed");
        return Err(err);
    }
    if let Some(err) = local_err {
        // every submitted chunk was acknowledged; the cursor covers them
        *offset = cur;
        return Err(err);
    }
    if let Some(err) = receiver_err {
        return Err(err);
    }
    *offset = cur;
    debug!(total, "pipelined upload complete");
    Ok(total)
}

async fn write_worker(
    work: Arc<Mutex<mpsc::Receiver<WriteSlot>>>,
    errors: mpsc::UnboundedSender<(u64, FerryError)>,
    cancel: watch::Sender<bool>,
) {
    loop {
        let slot = { work.lock().await.recv().await };
        let Some(slot) = slot else { break };
        let result = match slot.reply.await {
            Ok((typ, body)) => match PacketType::from_u8(typ) {
                Some(PacketType::Status) => wire::status_to_result(slot.id, &body),
                _ => Err(FerryError::Protocol(format!(
                    "unimplemented packet type: got {}",
                    wire::packet_name(typ)
                ))),
            },
            Err(_) => Err(FerryError::Closed),
        };
        if let Err(err) = result {
            // buffered until the pipeline ends; the lowest offset wins
            let _ = errors.send((slot.offset, err));
            let _ = cancel.send(true);
        }
    }
}

/// Assembled chunk bytes plus how the chunk ended; partial bytes survive a
/// mid-chunk failure.
type ChunkResult = (Bytes, ChunkEnd);

struct ReadSlot {
    id: u32,
    offset: u64,
    want: u32,
    reply: oneshot::Receiver<Frame>,
    out: oneshot::Sender<ChunkResult>,
}

/// Pipelined download. A producer task issues READs ahead of the replies;
/// workers assemble chunks (reissuing short DATA) and publish them into
/// per-request ordering slots; the calling task consumes the slots strictly
/// in offset order and writes to the caller's sink.
pub(crate) async fn download<W>(
    client: &SftpClient,
    handle: &[u8],
    offset: &mut u64,
    writer: &mut W,
    size: u64,
    progress: Option<&ProgressSink>,
) -> FerryResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let max_packet = client.config().max_packet;
    let concurrency = derive_concurrency(client.config(), size);
    debug!(size, concurrency, "starting pipelined download");

    let inflight = Arc::new(Inflight::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let receiver = tokio::spawn(run_receiver(client.clone(), inflight.clone(), shutdown_rx));

    let (work_tx, work_rx) = mpsc::channel::<ReadSlot>(concurrency);
    let work_rx = Arc::new(Mutex::new(work_rx));
    let (slot_tx, mut slot_rx) = mpsc::channel::<oneshot::Receiver<ChunkResult>>(concurrency);
    let (cancel_tx, _) = watch::channel(false);

    let mut workers = JoinSet::new();
    for _ in 0..concurrency {
        workers.spawn(read_worker(
            client.clone(),
            handle.to_vec(),
            inflight.clone(),
            work_rx.clone(),
            cancel_tx.clone(),
        ));
    }
    let producer = tokio::spawn(read_producer(
        client.clone(),
        handle.to_vec(),
        inflight.clone(),
        work_tx,
        slot_tx,
        cancel_tx.subscribe(),
        *offset,
        max_packet,
    ));

    let mut cur = *offset;
    let mut total = 0u64;
    let started = Instant::now();
    let mut failure: Option<FerryError> = None;

    while let Some(slot) = slot_rx.recv().await {
        match slot.await {
            Ok((data, end)) => {
                // bytes assembled before a mid-chunk failure are still
                // delivered and move the cursor, then the failure surfaces
                if !data.is_empty() {
                    cur += data.len() as u64;
                    if let Err(e) = writer.write_all(&data).await {
                        failure = Some(e.into());
                        break;
                    }
                    total += data.len() as u64;
                    if let Some(sink) = progress {
                        sink.chunk(data.len() as u64, total, size, started.elapsed());
                    }
                }
                match end {
                    ChunkEnd::Filled => {}
                    ChunkEnd::Eof => break,
                    ChunkEnd::Failed(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            Err(_) => {
                failure = Some(FerryError::Closed);
                break;
            }
        }
    }

    let _ = cancel_tx.send(true);
    drop(slot_rx);
    let _ = producer.await;
    while let Some(joined) = workers.join_next().await {
        if joined.is_err() {
            failure.get_or_insert(FerryError::Protocol(
                "transfer worker panicked".to_string(),
            ));
        }
    }

    inflight.wait_idle().await;
    let _ = shutdown_tx.send(true);
    let receiver_err = join_receiver_result(receiver.await);

    *offset = cur;
    if let Some(err) = failure {
        let err = prefer_receiver_error(err, receiver_err);
        warn!(offset = cur, error = %err, "pipelined download failed");
        return Err(err);
    }
    if let Some(err) = receiver_err {
        return Err(err);
    }
    writer.flush().await?;
    debug!(total, "pipelined download complete");
    Ok(total)
}

/// Issues READ packets at monotonically increasing offsets without waiting
/// for replies. End-of-stream is the consumer's to discover through
/// STATUS/EOF replies, so issuance runs until the cancel watch fires or a
/// channel closes; the bounded queues keep the look-ahead at the pipeline's
/// concurrency.
#[allow(clippy::too_many_arguments)]
async fn read_producer(
    client: SftpClient,
    handle: Vec<u8>,
    inflight: Arc<Inflight>,
    work_tx: mpsc::Sender<ReadSlot>,
    slot_tx: mpsc::Sender<oneshot::Receiver<ChunkResult>>,
    mut cancel: watch::Receiver<bool>,
    start: u64,
    max_packet: u32,
) {
    let mut cur = start;
    loop {
        if *cancel.borrow() {
            break;
        }
        let id = client.next_request_id();
        let reply = inflight.register(id);
        let packet = ReadPacket {
            id,
            handle: &handle,
            offset: cur,
            len: max_packet,
        };
        let (out_tx, out_rx) = oneshot::channel();
        match client.conn().send(&packet).await {
            Ok(()) => {
                // slot first, then work: the slot queue fixes consumption order
                if slot_tx.send(out_rx).await.is_err() {
                    break;
                }
                let slot = ReadSlot {
                    id,
                    offset: cur,
                    want: max_packet,
                    reply,
                    out: out_tx,
                };
                tokio::select! {
                    res = work_tx.send(slot) => {
                        if res.is_err() {
                            break;
                        }
                    }
                    _ = cancel.changed() => break,
                }
            }
            Err(e) => {
                inflight.remove(id);
                let _ = out_tx.send((Bytes::new(), ChunkEnd::Failed(e)));
                let _ = slot_tx.send(out_rx).await;
                break;
            }
        }
        cur += max_packet as u64;
    }
}

async fn read_worker(
    client: SftpClient,
    handle: Vec<u8>,
    inflight: Arc<Inflight>,
    work: Arc<Mutex<mpsc::Receiver<ReadSlot>>>,
    cancel: watch::Sender<bool>,
) {
    loop {
        let slot = { work.lock().await.recv().await };
        let Some(slot) = slot else { break };
        let (data, end) = assemble_chunk(
            &client,
            &handle,
            &inflight,
            slot.id,
            slot.offset,
            slot.want,
            slot.reply,
        )
        .await;
        if matches!(end, ChunkEnd::Failed(_)) {
            let _ = cancel.send(true);
        }
        let _ = slot.out.send((data, end));
    }
}

/// Interprets the reply for one READ, reissuing requests for the remainder
/// when the server returns short DATA, until the chunk is full or the
/// stream ends. EOF (and a bare OK status) end the stream. Bytes assembled
/// before a failure are returned alongside it, never discarded.
async fn assemble_chunk(
    client: &SftpClient,
    handle: &[u8],
    inflight: &Inflight,
    first_id: u32,
    offset: u64,
    want: u32,
    first_reply: oneshot::Receiver<Frame>,
) -> ChunkResult {
    let mut buf = BytesMut::with_capacity(want as usize);
    let mut id = first_id;
    let mut reply = first_reply;
    loop {
        let (typ, body) = match reply.await {
            Ok(frame) => frame,
            Err(_) => return (buf.freeze(), ChunkEnd::Failed(FerryError::Closed)),
        };
        match PacketType::from_u8(typ) {
            Some(PacketType::Status) => {
                return match wire::status_to_result(id, &body) {
                    Ok(()) | Err(FerryError::Eof) => (buf.freeze(), ChunkEnd::Eof),
                    Err(e) => (buf.freeze(), ChunkEnd::Failed(e)),
                };
            }
            Some(PacketType::Data) => {
                let data = match DataPacket::decode(&body) {
                    Ok(data) => data,
                    Err(e) => return (buf.freeze(), ChunkEnd::Failed(e)),
                };
                if data.id != id {
                    let err = wire::unexpected_id(id, data.id);
                    return (buf.freeze(), ChunkEnd::Failed(err));
                }
                if data.data.is_empty() {
                    return (buf.freeze(), ChunkEnd::Eof);
                }
                let room = want as usize - buf.len();
                let take = data.data.len().min(room);
                buf.extend_from_slice(&data.data[..take]);
                if buf.len() >= want as usize {
                    return (buf.freeze(), ChunkEnd::Filled);
                }
                id = client.next_request_id();
                reply = inflight.register(id);
                let packet = ReadPacket {
                    id,
                    handle,
                    offset: offset + buf.len() as u64,
                    len: want - buf.len() as u32,
                };
                if let Err(e) = client.conn().send(&packet).await {
                    inflight.remove(id);
                    return (buf.freeze(), ChunkEnd::Failed(e));
                }
            }
            _ => {
                let err = FerryError::Protocol(format!(
                    "unimplemented packet type: got {}",
                    wire::packet_name(typ)
                ));
                return (buf.freeze(), ChunkEnd::Failed(err));
            }
        }
    }
}
