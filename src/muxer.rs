//! # Stream Multiplexer
//!
//! Runs many independent, flow-controlled streams over one secured byte
//! channel.
//!
//! ## Frame format
//!
//! Each multiplexer frame travels inside exactly one secure frame:
//!
//! ```text
//! ┌──────────┬────────────────┬─────────────┐
//! │ kind: u8 │ stream_id: u32 │ payload ... │
//! └──────────┴────────────────┴─────────────┘
//! ```
//!
//! | kind | name          | payload                     |
//! |------|---------------|-----------------------------|
//! | 0    | Open          | empty                       |
//! | 1    | Data          | bytes                       |
//! | 2    | Close         | empty (half-close)          |
//! | 3    | Reset         | empty                       |
//! | 4    | WindowUpdate  | credit: u32 BE              |
//! | 5    | GoAway        | UTF-8 reason (stream id 0)  |
//!
//! ## Stream ids
//!
//! The dialer allocates odd ids and the listener even ids, each side from
//! its own increasing counter, so the two sides never collide and a stream
//! id is never reused within a connection.
//!
//! ## Flow control
//!
//! Every stream starts with `window` bytes of send credit per direction.
//! Writers spend credit; readers return it with `WindowUpdate` as they
//! consume data. A peer that sends past its credit gets that stream reset.
//!
//! ## Tasks
//!
//! - **reader**: decrypts frames and hands them to the driver
//! - **driver**: owns the stream table; the only place it is mutated
//! - **writer**: encrypts and writes frames queued by the driver
//!
//! The driver never awaits the network, so a slow peer cannot stall frame
//! processing for other streams.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::MuxerError;
use crate::security::{MAX_SECURE_PLAINTEXT, SecureReader, SecureStream, SecureWriter};

const FRAME_HEADER_LEN: usize = 5;

const KIND_OPEN: u8 = 0;
const KIND_DATA: u8 = 1;
const KIND_CLOSE: u8 = 2;
const KIND_RESET: u8 = 3;
const KIND_WINDOW_UPDATE: u8 = 4;
const KIND_GO_AWAY: u8 = 5;

/// Longest GoAway reason put on the wire.
const MAX_GO_AWAY_REASON: usize = 256;

/// Frames buffered between the reader task and the driver.
const INBOUND_FRAME_BUFFER: usize = 256;

/// Bound on a single secure frame write before the connection is declared dead.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which side of the connection we are. Decides stream id parity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We dialed. Local streams use odd ids.
    Outbound,
    /// We accepted. Local streams use even ids.
    Inbound,
}

impl Direction {
    fn first_local_id(self) -> u32 {
        match self {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        }
    }

    fn is_remote_id(self, id: u32) -> bool {
        id != 0
            && match self {
                Direction::Outbound => id % 2 == 0,
                Direction::Inbound => id % 2 == 1,
            }
    }
}

#[derive(Clone, Debug)]
pub struct MuxerConfig {
    /// Per-stream receive window in bytes.
    pub window: u32,
    /// Largest data payload per frame.
    pub max_frame_data: usize,
    /// Concurrent streams per connection, both directions together.
    pub max_streams: usize,
    /// Inbound streams waiting for `accept_stream` before new ones are reset.
    pub accept_backlog: usize,
    /// Close the connection after this long with no streams and no frames.
    pub idle_timeout: Duration,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            window: 256 * 1024,
            max_frame_data: 16 * 1024,
            max_streams: 256,
            accept_backlog: 32,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// Frame codec
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Frame {
    Open { id: u32 },
    Data { id: u32, data: Vec<u8> },
    Close { id: u32 },
    Reset { id: u32 },
    WindowUpdate { id: u32, credit: u32 },
    GoAway { reason: String },
}

impl Frame {
    fn encode(&self) -> Vec<u8> {
        let (kind, id, payload): (u8, u32, &[u8]) = match self {
            Frame::Open { id } => (KIND_OPEN, *id, &[]),
            Frame::Data { id, data } => (KIND_DATA, *id, data),
            Frame::Close { id } => (KIND_CLOSE, *id, &[]),
            Frame::Reset { id } => (KIND_RESET, *id, &[]),
            Frame::WindowUpdate { id, credit } => {
                let mut out = Vec::with_capacity(FRAME_HEADER_LEN + 4);
                out.push(KIND_WINDOW_UPDATE);
                out.extend_from_slice(&id.to_be_bytes());
                out.extend_from_slice(&credit.to_be_bytes());
                return out;
            }
            Frame::GoAway { reason } => {
                let mut end = reason.len().min(MAX_GO_AWAY_REASON);
                while !reason.is_char_boundary(end) {
                    end -= 1;
                }
                (KIND_GO_AWAY, 0, &reason.as_bytes()[..end])
            }
        };
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        out.push(kind);
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn decode(bytes: &[u8]) -> Result<Frame, String> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err("short multiplexer frame".into());
        }
        let kind = bytes[0];
        let id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = &bytes[FRAME_HEADER_LEN..];
        let empty = |frame: Frame| {
            if payload.is_empty() {
                Ok(frame)
            } else {
                Err(format!("unexpected payload on frame kind {kind}"))
            }
        };
        match kind {
            KIND_OPEN => empty(Frame::Open { id }),
            KIND_DATA => Ok(Frame::Data {
                id,
                data: payload.to_vec(),
            }),
            KIND_CLOSE => empty(Frame::Close { id }),
            KIND_RESET => empty(Frame::Reset { id }),
            KIND_WINDOW_UPDATE => {
                let credit: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| "window update needs a 4-byte credit".to_string())?;
                Ok(Frame::WindowUpdate {
                    id,
                    credit: u32::from_be_bytes(credit),
                })
            }
            KIND_GO_AWAY => Ok(Frame::GoAway {
                reason: String::from_utf8_lossy(payload).into_owned(),
            }),
            other => Err(format!("unknown frame kind {other}")),
        }
    }
}

// ============================================================================
// Stream state shared between driver and handle
// ============================================================================

enum Inbound {
    Data(Vec<u8>),
    Fin,
    Reset(MuxerError),
}

struct StreamShared {
    send_credit: Semaphore,
    error: OnceLock<MuxerError>,
}

impl StreamShared {
    fn new(window: u32) -> Self {
        Self {
            send_credit: Semaphore::new(window as usize),
            error: OnceLock::new(),
        }
    }

    /// Record the terminal error and wake every blocked writer.
    fn fail(&self, err: MuxerError) {
        let _ = self.error.set(err);
        self.send_credit.close();
    }

    fn failure(&self) -> MuxerError {
        self.error
            .get()
            .cloned()
            .unwrap_or_else(|| MuxerError::ConnectionClosed("connection closed".into()))
    }
}

struct StreamEntry {
    inbound: mpsc::UnboundedSender<Inbound>,
    shared: Arc<StreamShared>,
    recv_remaining: u32,
    local_closed: bool,
    remote_closed: bool,
}

enum Command {
    Open {
        reply: oneshot::Sender<Result<MuxedStream, MuxerError>>,
    },
    Data {
        id: u32,
        data: Vec<u8>,
    },
    Close {
        id: u32,
    },
    Reset {
        id: u32,
    },
    Consumed {
        id: u32,
        n: u32,
    },
    Shutdown {
        reason: String,
    },
}

// ============================================================================
// Stream handle
// ============================================================================

/// One logical stream over a multiplexed connection.
///
/// Dropping a stream that is not closed in both directions resets it.
pub struct MuxedStream {
    id: u32,
    // Unbounded: queued data is bounded by this stream's send credit.
    cmd_tx: mpsc::UnboundedSender<Command>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    shared: Arc<StreamShared>,
    max_frame_data: usize,
    read_buf: Vec<u8>,
    read_pos: usize,
    read_eof: bool,
    write_closed: bool,
    reset: bool,
}

impl MuxedStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), MuxerError> {
        if self.write_closed {
            return Err(MuxerError::StreamClosed);
        }
        for chunk in data.chunks(self.max_frame_data) {
            let permit = self
                .shared
                .send_credit
                .acquire_many(chunk.len() as u32)
                .await
                .map_err(|_| self.shared.failure())?;
            permit.forget();
            self.cmd_tx
                .send(Command::Data {
                    id: self.id,
                    data: chunk.to_vec(),
                })
                .map_err(|_| self.shared.failure())?;
        }
        Ok(())
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the remote closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, MuxerError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.read_pos < self.read_buf.len() {
                let n = buf.len().min(self.read_buf.len() - self.read_pos);
                buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
                self.read_pos += n;
                if self.read_pos == self.read_buf.len() {
                    let consumed = self.read_buf.len() as u32;
                    let _ = self.cmd_tx.send(Command::Consumed {
                        id: self.id,
                        n: consumed,
                    });
                }
                return Ok(n);
            }
            if self.read_eof {
                return Ok(0);
            }
            match self.inbound.recv().await {
                Some(Inbound::Data(data)) => {
                    self.read_buf = data;
                    self.read_pos = 0;
                }
                Some(Inbound::Fin) => self.read_eof = true,
                Some(Inbound::Reset(err)) => return Err(err),
                None => return Err(self.shared.failure()),
            }
        }
    }

    /// Half-close: no more writes from this side. Reading continues.
    pub fn close(&mut self) {
        if !self.write_closed {
            self.write_closed = true;
            let _ = self.cmd_tx.send(Command::Close { id: self.id });
        }
    }

    /// Abort the stream in both directions.
    pub fn reset(mut self) {
        self.send_reset();
    }

    fn send_reset(&mut self) {
        if !self.reset {
            self.reset = true;
            let _ = self.cmd_tx.send(Command::Reset { id: self.id });
        }
    }
}

impl Drop for MuxedStream {
    fn drop(&mut self) {
        if !(self.write_closed && self.read_eof) {
            self.send_reset();
        }
    }
}

impl std::fmt::Debug for MuxedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedStream")
            .field("id", &self.id)
            .field("read_eof", &self.read_eof)
            .field("write_closed", &self.write_closed)
            .finish()
    }
}

// ============================================================================
// Connection handle
// ============================================================================

/// Handle to a multiplexed connection. Cheap to clone.
#[derive(Clone)]
pub struct MuxedConnection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    incoming: Arc<Mutex<mpsc::Receiver<MuxedStream>>>,
    closed: watch::Receiver<Option<String>>,
}

impl MuxedConnection {
    /// Start the reader, driver and writer tasks over `secure`.
    pub fn new(secure: SecureStream, direction: Direction, config: MuxerConfig) -> Self {
        let (reader, writer) = secure.into_split();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(INBOUND_FRAME_BUFFER);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_backlog.max(1));
        let (closed_tx, closed_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let max_frame_data = config
            .max_frame_data
            .min(MAX_SECURE_PLAINTEXT - FRAME_HEADER_LEN)
            .min(config.window as usize)
            .max(1);

        let driver = Driver {
            direction,
            next_local_id: direction.first_local_id(),
            last_remote_id: 0,
            streams: HashMap::new(),
            accept_tx: Some(accept_tx),
            writer_tx,
            cmd_tx: cmd_tx.downgrade(),
            closed_tx,
            cancel: cancel.clone(),
            max_frame_data,
            last_activity: Instant::now(),
            config,
        };

        tokio::spawn(read_loop(reader, frame_tx, cancel.clone()));
        tokio::spawn(write_loop(writer, writer_rx, cancel));
        tokio::spawn(driver.run(cmd_rx, frame_rx));

        Self {
            cmd_tx,
            incoming: Arc::new(Mutex::new(accept_rx)),
            closed: closed_rx,
        }
    }

    pub async fn open_stream(&self) -> Result<MuxedStream, MuxerError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open { reply })
            .map_err(|_| self.closed_error())?;
        rx.await.map_err(|_| self.closed_error())?
    }

    /// Next stream opened by the remote.
    pub async fn accept_stream(&self) -> Result<MuxedStream, MuxerError> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(|| self.closed_error())
    }

    /// Close the connection. Every open stream fails with
    /// `ConnectionClosed(reason)`.
    pub fn close(&self, reason: &str) {
        let _ = self.cmd_tx.send(Command::Shutdown {
            reason: reason.to_string(),
        });
    }

    pub fn close_reason(&self) -> Option<String> {
        self.closed.borrow().clone()
    }

    /// Resolves with the close reason once the connection is gone.
    pub async fn closed(&self) -> String {
        let mut rx = self.closed.clone();
        match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        }
    }

    fn closed_error(&self) -> MuxerError {
        MuxerError::ConnectionClosed(
            self.close_reason()
                .unwrap_or_else(|| "connection closed".to_string()),
        )
    }
}

impl std::fmt::Debug for MuxedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxedConnection")
            .field("closed", &self.close_reason())
            .finish()
    }
}

// ============================================================================
// I/O tasks
// ============================================================================

async fn read_loop(
    mut reader: SecureReader,
    frame_tx: mpsc::Sender<Result<Frame, String>>,
    cancel: CancellationToken,
) {
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            r = reader.read_frame() => r,
        };
        let item = match result {
            Ok(Some(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => Ok(frame),
                Err(reason) => Err(format!("protocol error: {reason}")),
            },
            Ok(None) => Err("transport closed".to_string()),
            Err(e) => Err(format!("transport error: {e}")),
        };
        let fatal = item.is_err();
        if frame_tx.send(item).await.is_err() || fatal {
            break;
        }
    }
}

async fn write_loop(
    mut writer: SecureWriter,
    mut writer_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    while let Some(frame) = writer_rx.recv().await {
        match tokio::time::timeout(WRITE_TIMEOUT, writer.write_frame(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "multiplexer write failed");
                cancel.cancel();
                break;
            }
            Err(_) => {
                warn!("multiplexer write timed out");
                cancel.cancel();
                break;
            }
        }
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), writer.shutdown()).await;
}

// ============================================================================
// Driver
// ============================================================================

struct Driver {
    direction: Direction,
    config: MuxerConfig,
    max_frame_data: usize,
    next_local_id: u32,
    last_remote_id: u32,
    streams: HashMap<u32, StreamEntry>,
    accept_tx: Option<mpsc::Sender<MuxedStream>>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
    closed_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    last_activity: Instant,
}

impl Driver {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut frame_rx: mpsc::Receiver<Result<Frame, String>>,
    ) {
        let mut idle_check = tokio::time::interval(
            (self.config.idle_timeout / 4).max(Duration::from_millis(100)),
        );
        idle_check.tick().await;

        let reason = loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reason }) => {
                        self.send(Frame::GoAway { reason: reason.clone() });
                        break reason;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        let reason = "connection dropped".to_string();
                        self.send(Frame::GoAway { reason: reason.clone() });
                        break reason;
                    }
                },
                frame = frame_rx.recv() => match frame {
                    Some(Ok(Frame::GoAway { reason })) => break format!("closed by remote: {reason}"),
                    Some(Ok(frame)) => {
                        self.last_activity = Instant::now();
                        self.handle_frame(frame);
                    }
                    Some(Err(reason)) => break reason,
                    None => break "transport closed".to_string(),
                },
                _ = idle_check.tick() => {
                    if self.streams.is_empty()
                        && self.last_activity.elapsed() >= self.config.idle_timeout
                    {
                        self.send(Frame::GoAway { reason: "idle timeout".into() });
                        break "idle timeout".to_string();
                    }
                }
                _ = self.cancel.cancelled() => break "connection aborted".to_string(),
            }
        };

        self.shutdown(reason);
    }

    fn send(&self, frame: Frame) {
        trace!(?frame, "mux send");
        let _ = self.writer_tx.send(frame.encode());
    }

    fn new_stream(&mut self, id: u32) -> Option<MuxedStream> {
        let cmd_tx = self.cmd_tx.upgrade()?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared::new(self.config.window));
        self.streams.insert(
            id,
            StreamEntry {
                inbound: inbound_tx,
                shared: shared.clone(),
                recv_remaining: self.config.window,
                local_closed: false,
                remote_closed: false,
            },
        );
        Some(MuxedStream {
            id,
            cmd_tx,
            inbound: inbound_rx,
            shared,
            max_frame_data: self.max_frame_data,
            read_buf: Vec::new(),
            read_pos: 0,
            read_eof: false,
            write_closed: false,
            reset: false,
        })
    }

    fn reset_stream(&mut self, id: u32, notify_remote: bool) {
        if let Some(entry) = self.streams.remove(&id) {
            entry.shared.fail(MuxerError::StreamReset);
            let _ = entry.inbound.send(Inbound::Reset(MuxerError::StreamReset));
        }
        if notify_remote {
            self.send(Frame::Reset { id });
        }
    }

    fn maybe_remove(&mut self, id: u32) {
        if let Some(entry) = self.streams.get(&id)
            && entry.local_closed
            && entry.remote_closed
        {
            self.streams.remove(&id);
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Open { reply } => {
                if self.streams.len() >= self.config.max_streams {
                    let _ = reply.send(Err(MuxerError::TooManyStreams));
                    return;
                }
                let id = self.next_local_id;
                let Some(next) = id.checked_add(2) else {
                    let _ = reply.send(Err(MuxerError::TooManyStreams));
                    return;
                };
                let Some(stream) = self.new_stream(id) else {
                    let _ = reply.send(Err(MuxerError::ConnectionClosed("connection dropped".into())));
                    return;
                };
                self.next_local_id = next;
                self.send(Frame::Open { id });
                if reply.send(Ok(stream)).is_err() {
                    // Caller gave up; the dropped handle already queued a reset.
                    trace!(id, "open_stream caller went away");
                }
            }
            Command::Data { id, data } => {
                if let Some(entry) = self.streams.get(&id)
                    && !entry.local_closed
                {
                    self.send(Frame::Data { id, data });
                }
            }
            Command::Close { id } => {
                if let Some(entry) = self.streams.get_mut(&id)
                    && !entry.local_closed
                {
                    entry.local_closed = true;
                    self.send(Frame::Close { id });
                    self.maybe_remove(id);
                }
            }
            Command::Reset { id } => {
                if self.streams.contains_key(&id) {
                    self.reset_stream(id, true);
                }
            }
            Command::Consumed { id, n } => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.recv_remaining = entry
                        .recv_remaining
                        .saturating_add(n)
                        .min(self.config.window);
                    if !entry.remote_closed {
                        self.send(Frame::WindowUpdate { id, credit: n });
                    }
                }
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        trace!(?frame, "mux recv");
        match frame {
            Frame::Open { id } => {
                let acceptable = self.direction.is_remote_id(id)
                    && id > self.last_remote_id
                    && self.streams.len() < self.config.max_streams;
                if !acceptable {
                    debug!(id, "rejecting inbound stream");
                    self.send(Frame::Reset { id });
                    return;
                }
                self.last_remote_id = id;
                let Some(stream) = self.new_stream(id) else {
                    self.send(Frame::Reset { id });
                    return;
                };
                let delivered = match &self.accept_tx {
                    Some(tx) => tx.try_send(stream).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!(id, "accept backlog full, resetting stream");
                    self.reset_stream(id, true);
                }
            }
            Frame::Data { id, data } => {
                let Some(entry) = self.streams.get_mut(&id) else {
                    return;
                };
                if entry.remote_closed || data.len() as u64 > entry.recv_remaining as u64 {
                    debug!(id, len = data.len(), "peer exceeded stream window");
                    self.reset_stream(id, true);
                    return;
                }
                entry.recv_remaining -= data.len() as u32;
                let _ = entry.inbound.send(Inbound::Data(data));
            }
            Frame::Close { id } => {
                if let Some(entry) = self.streams.get_mut(&id)
                    && !entry.remote_closed
                {
                    entry.remote_closed = true;
                    let _ = entry.inbound.send(Inbound::Fin);
                    self.maybe_remove(id);
                }
            }
            Frame::Reset { id } => self.reset_stream(id, false),
            Frame::WindowUpdate { id, credit } => {
                if let Some(entry) = self.streams.get(&id) {
                    let credit = credit.min(self.config.window) as usize;
                    let room = (self.config.window as usize)
                        .saturating_sub(entry.shared.send_credit.available_permits());
                    entry.shared.send_credit.add_permits(credit.min(room));
                }
            }
            Frame::GoAway { .. } => {}
        }
    }

    fn shutdown(&mut self, reason: String) {
        debug!(reason = %reason, streams = self.streams.len(), "multiplexed connection closed");
        let err = MuxerError::ConnectionClosed(reason.clone());
        for (_, entry) in self.streams.drain() {
            entry.shared.fail(err.clone());
            let _ = entry.inbound.send(Inbound::Reset(err.clone()));
        }
        self.accept_tx = None;
        self.closed_tx.send_replace(Some(reason));
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::security;
    use crate::transport::BoxedStream;

    async fn pair_with(config: MuxerConfig) -> (MuxedConnection, MuxedConnection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let (a, b): (BoxedStream, BoxedStream) = (Box::new(a), Box::new(b));
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let timeout = Duration::from_secs(5);
        let (sa, sb) = tokio::join!(
            security::upgrade_outbound(a, &alice, None, timeout),
            security::upgrade_inbound(b, &bob, timeout)
        );
        (
            MuxedConnection::new(sa.expect("secure a"), Direction::Outbound, config.clone()),
            MuxedConnection::new(sb.expect("secure b"), Direction::Inbound, config),
        )
    }

    async fn pair() -> (MuxedConnection, MuxedConnection) {
        pair_with(MuxerConfig::default()).await
    }

    async fn read_to_end(stream: &mut MuxedStream) -> Result<Vec<u8>, MuxerError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn frame_codec_roundtrip() {
        let frames = vec![
            Frame::Open { id: 7 },
            Frame::Data { id: 7, data: b"abc".to_vec() },
            Frame::Close { id: 7 },
            Frame::Reset { id: 9 },
            Frame::WindowUpdate { id: 7, credit: 4096 },
            Frame::GoAway { reason: "bye".into() },
        ];
        for frame in frames {
            assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
        }
    }

    #[test]
    fn frame_decode_rejects_garbage() {
        assert!(Frame::decode(&[1, 0, 0]).is_err());
        assert!(Frame::decode(&[99, 0, 0, 0, 1]).is_err());
        assert!(Frame::decode(&[KIND_WINDOW_UPDATE, 0, 0, 0, 1, 0]).is_err());
        assert!(Frame::decode(&[KIND_OPEN, 0, 0, 0, 1, 0xFF]).is_err());
    }

    #[test]
    fn stream_id_parity() {
        assert!(Direction::Outbound.is_remote_id(2));
        assert!(!Direction::Outbound.is_remote_id(3));
        assert!(Direction::Inbound.is_remote_id(1));
        assert!(!Direction::Inbound.is_remote_id(0));
    }

    #[tokio::test]
    async fn request_response_over_stream() {
        let (a, b) = pair().await;

        let server = tokio::spawn(async move {
            let mut s = b.accept_stream().await.expect("accept");
            let req = read_to_end(&mut s).await.expect("read request");
            s.write_all(&[req.as_slice(), b" pong"].concat()).await.expect("write");
            s.close();
            b
        });

        let mut s = a.open_stream().await.expect("open");
        s.write_all(b"ping").await.expect("write");
        s.close();
        let resp = read_to_end(&mut s).await.expect("response");
        assert_eq!(resp, b"ping pong");
        let _b = server.await.unwrap();
    }

    #[tokio::test]
    async fn ids_are_namespaced_by_direction_and_increase() {
        let (a, b) = pair().await;
        let a1 = a.open_stream().await.unwrap();
        let a2 = a.open_stream().await.unwrap();
        let b1 = b.open_stream().await.unwrap();
        let b2 = b.open_stream().await.unwrap();

        assert_eq!((a1.id(), a2.id()), (1, 3));
        assert_eq!((b1.id(), b2.id()), (2, 4));

        let seen_by_b = b.accept_stream().await.unwrap();
        assert_eq!(seen_by_b.id(), 1);
    }

    #[tokio::test]
    async fn large_transfer_respects_flow_control() {
        let config = MuxerConfig {
            window: 8 * 1024,
            max_frame_data: 1024,
            ..MuxerConfig::default()
        };
        let (a, b) = pair_with(config).await;
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            let mut s = a.open_stream().await.unwrap();
            s.write_all(&payload).await.unwrap();
            s.close();
            (a, s)
        });
        let mut s = b.accept_stream().await.unwrap();
        let got = read_to_end(&mut s).await.unwrap();
        assert_eq!(got, expected);
        let _ = writer.await.unwrap();
    }

    #[tokio::test]
    async fn closing_one_stream_leaves_siblings_open() {
        let (a, b) = pair().await;
        let mut s1 = a.open_stream().await.unwrap();
        let mut s2 = a.open_stream().await.unwrap();
        let mut r1 = b.accept_stream().await.unwrap();
        let mut r2 = b.accept_stream().await.unwrap();

        s1.close();
        assert_eq!(r1.read(&mut [0u8; 8]).await.unwrap(), 0);

        s2.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        let mut got = 0;
        while got < buf.len() {
            got += r2.read(&mut buf[got..]).await.unwrap();
        }
        assert_eq!(&buf, b"still here");
        drop(s1);
        drop(r1);
    }

    #[tokio::test]
    async fn reset_fails_remote_reads() {
        let (a, b) = pair().await;
        let s = a.open_stream().await.unwrap();
        let mut r = b.accept_stream().await.unwrap();

        s.reset();
        assert_eq!(r.read(&mut [0u8; 4]).await, Err(MuxerError::StreamReset));
    }

    #[tokio::test]
    async fn connection_close_cancels_pending_stream_operations() {
        let (a, b) = pair().await;
        let mut s = a.open_stream().await.unwrap();
        let mut r = b.accept_stream().await.unwrap();

        let pending_read = tokio::spawn(async move { r.read(&mut [0u8; 4]).await });
        let local_read = tokio::spawn(async move {
            let res = s.read(&mut [0u8; 4]).await;
            (res, s)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        a.close("shutting down");

        let (local, mut s) = tokio::time::timeout(Duration::from_secs(5), local_read)
            .await
            .expect("local read unblocked")
            .unwrap();
        assert_eq!(local, Err(MuxerError::ConnectionClosed("shutting down".into())));
        assert!(s.write_all(b"x").await.is_err());

        let remote = tokio::time::timeout(Duration::from_secs(5), pending_read)
            .await
            .expect("remote read unblocked")
            .unwrap();
        assert!(matches!(remote, Err(MuxerError::ConnectionClosed(_))));

        assert_eq!(a.closed().await, "shutting down");
        assert!(b.closed().await.contains("shutting down"));
        assert!(a.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn blocked_writer_fails_when_connection_closes() {
        let config = MuxerConfig {
            window: 1024,
            max_frame_data: 512,
            ..MuxerConfig::default()
        };
        let (a, b) = pair_with(config).await;
        let mut s = a.open_stream().await.unwrap();
        let _r = b.accept_stream().await.unwrap();

        // Nobody reads on b, so the writer runs out of credit and blocks.
        let writer = tokio::spawn(async move { s.write_all(&[0u8; 8192]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        a.close("done");
        let res = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .expect("writer unblocked")
            .unwrap();
        assert!(matches!(res, Err(MuxerError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn stream_limit_is_enforced() {
        let config = MuxerConfig {
            max_streams: 2,
            ..MuxerConfig::default()
        };
        let (a, _b) = pair_with(config).await;
        let _s1 = a.open_stream().await.unwrap();
        let _s2 = a.open_stream().await.unwrap();
        assert_eq!(a.open_stream().await.err(), Some(MuxerError::TooManyStreams));
    }
}
