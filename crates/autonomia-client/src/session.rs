//! Session engine.
//!
//! A session owns one connection at a time. After the first successful attach
//! two tasks run for the lifetime of the session:
//!
//! - the heartbeat task, writing a heartbeat frame every assigned interval
//! - the receive task, reading inbound requests, answering them in-band and
//!   reattaching when the connection fails
//!
//! Both tasks and [`Session::send`] share one write lock. Reattachment swaps
//! in a new connection underneath the running tasks instead of restarting
//! them.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use autonomia_rpc::{
    CodecError, Decoded, Dispatcher, Frame, FrameCodec, MessageHandler, MethodRegistry,
};
use bytes::{Bytes, BytesMut};
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ClientConfig;
use crate::connection::{self, BoxedConnection};
use crate::error::{ClientError, ErrorCode, Result};
use crate::handshake::{self, DeviceIdentity, HandshakeReply, READ_CHUNK};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Unattached,
    Attaching,
    Attached,
    Reattaching,
    /// Stopped for good.
    Closed,
}

/// Outcome of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachReply {
    pub reply: HandshakeReply,
    /// Raw text of the server's first body chunk.
    pub body: String,
}

type Writer = FramedWrite<WriteHalf<BoxedConnection>, FrameCodec>;

/// Read side of the current connection, owned by the receive task.
struct Link {
    reader: ReadHalf<BoxedConnection>,
    codec: FrameCodec,
    buffer: BytesMut,
}

#[derive(Debug)]
enum ReadOutcome {
    Data(usize),
    /// Nothing arrived within the poll window.
    Idle,
    /// The read returned zero bytes.
    Empty,
    Failed(std::io::Error),
}

async fn read_once<R>(reader: &mut R, buffer: &mut BytesMut, poll: Duration) -> ReadOutcome
where
    R: AsyncRead + Unpin,
{
    buffer.reserve(READ_CHUNK);
    match tokio::time::timeout(poll, reader.read_buf(buffer)).await {
        Err(_) => ReadOutcome::Idle,
        Ok(Ok(0)) => ReadOutcome::Empty,
        Ok(Ok(n)) => ReadOutcome::Data(n),
        Ok(Err(e)) => ReadOutcome::Failed(e),
    }
}

/// Whether a zero-byte read is waited out instead of treated as a disconnect.
///
/// TLS streams may yield empty reads while the peer is still connected.
fn tolerate_empty_read(use_tls: bool, empty_reads: u32, max_empty_reads: u32) -> bool {
    use_tls && empty_reads < max_empty_reads
}

fn is_blank(payload: &[u8]) -> bool {
    payload.iter().all(u8::is_ascii_whitespace)
}

struct Handlers {
    callback: Option<Arc<dyn MessageHandler>>,
    dispatcher: Arc<Dispatcher>,
}

impl Handlers {
    fn active(&self) -> Arc<dyn MessageHandler> {
        match &self.callback {
            Some(callback) => Arc::clone(callback),
            None => Arc::clone(&self.dispatcher) as Arc<dyn MessageHandler>,
        }
    }
}

struct Shared {
    config: ClientConfig,
    state: watch::Sender<SessionState>,
    writer: Mutex<Option<Writer>>,
    handlers: RwLock<Handlers>,
    identity: StdMutex<Option<DeviceIdentity>>,
    heartbeat_secs: AtomicU64,
    last_error: AtomicU8,
    loop_starts: AtomicU32,
    shutdown: CancellationToken,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Handle to one device session. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("server", &self.shared.config.server)
            .field("state", &self.state())
            .field("device_id", &self.device_id())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let heartbeat_secs = config.default_heartbeat_secs;
        let (state, _) = watch::channel(SessionState::Unattached);

        Self {
            shared: Arc::new(Shared {
                config,
                state,
                writer: Mutex::new(None),
                handlers: RwLock::new(Handlers {
                    callback: None,
                    dispatcher: Arc::new(Dispatcher::default()),
                }),
                identity: StdMutex::new(None),
                heartbeat_secs: AtomicU64::new(heartbeat_secs),
                last_error: AtomicU8::new(ErrorCode::InternalError.as_u8()),
                loop_starts: AtomicU32::new(0),
                shutdown: CancellationToken::new(),
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Attach the device and start the heartbeat and receive tasks.
    ///
    /// `methods` answers inbound requests unless a callback is bound.
    /// A failed attach leaves the session `Unattached` so it can be retried.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::AlreadyAttached` or `ClientError::Closed` if the
    /// session is not `Unattached`, and the connection or handshake error
    /// otherwise. The error's code is also recorded as the last error.
    pub async fn attach(
        &self,
        methods: MethodRegistry,
        identity: DeviceIdentity,
    ) -> Result<AttachReply> {
        let shared = &self.shared;
        shared.config.validate().map_err(|e| shared.fail(e))?;
        shared.begin_attach()?;

        shared.handlers_mut().dispatcher = Arc::new(Dispatcher::new(methods));
        *shared.identity_slot() = Some(identity.clone());

        let (link, reply) = match shared.connect(&identity).await {
            Ok(attached) => attached,
            Err(e) => {
                shared.transition(SessionState::Attaching, SessionState::Unattached);
                return Err(shared.fail(e));
            }
        };

        if !shared.transition(SessionState::Attaching, SessionState::Attached) {
            shared.writer.lock().await.take();
            return Err(ClientError::Closed);
        }
        shared.set_last_error(ErrorCode::Ok);
        info!(
            "Device {} attached (heartbeat {}s)",
            identity.device_id,
            shared.heartbeat_secs.load(Ordering::Relaxed)
        );

        Arc::clone(shared).start_loops(link);
        Ok(reply)
    }

    /// Send a data event upstream.
    ///
    /// # Errors
    ///
    /// Fails immediately with `ClientError::Reattaching` while the session is
    /// reconnecting, `ClientError::NotAttached` before the first attach,
    /// `ClientError::Closed` after [`Session::stop`], or with the write error.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let shared = &self.shared;
        shared.check_writable()?;

        let mut writer = shared.writer.lock().await;
        shared.check_writable()?;
        let writer = writer.as_mut().ok_or(ClientError::NotAttached)?;
        writer.send(Frame::data_event(payload)).await?;
        Ok(())
    }

    /// Answer inbound frames with `handler` instead of the method dispatcher.
    pub fn bind_callback(&self, handler: Arc<dyn MessageHandler>) {
        self.shared.handlers_mut().callback = Some(handler);
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        ErrorCode::from_u8(self.shared.last_error.load(Ordering::Relaxed))
            .unwrap_or(ErrorCode::InternalError)
    }

    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.shared
            .identity_slot()
            .as_ref()
            .map(|identity| identity.device_id.clone())
    }

    /// Heartbeat interval currently in effect.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.shared.heartbeat_secs.load(Ordering::Relaxed))
    }

    /// Diagnostic: how many times the heartbeat and receive tasks have been
    /// started. Stays at 1 across reattaches.
    #[doc(hidden)]
    #[must_use]
    pub fn loop_starts(&self) -> u32 {
        self.shared.loop_starts.load(Ordering::SeqCst)
    }

    /// Stop both tasks, close the connection and move to `Closed`.
    pub async fn stop(&self) {
        let shared = &self.shared;
        shared.shutdown.cancel();
        shared.state.send_replace(SessionState::Closed);

        let tasks = std::mem::take(&mut *shared.task_slots());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Session task failed: {}", e);
            }
        }

        if let Some(mut writer) = shared.writer.lock().await.take() {
            if let Err(e) = writer.close().await {
                debug!("Error closing connection: {}", e);
            }
        }
        info!("Session closed");
    }
}

impl Shared {
    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, Handlers> {
        self.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_handler(&self) -> Arc<dyn MessageHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active()
    }

    fn identity_slot(&self) -> MutexGuard<'_, Option<DeviceIdentity>> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn task_slots(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_last_error(&self, code: ErrorCode) {
        self.last_error.store(code.as_u8(), Ordering::Relaxed);
    }

    fn fail(&self, error: ClientError) -> ClientError {
        self.set_last_error(error.code());
        error
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move from `from` to `to`; false if the session was elsewhere.
    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn begin_attach(&self) -> Result<()> {
        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state {
            SessionState::Unattached => {
                *state = SessionState::Attaching;
                true
            }
            SessionState::Closed => {
                outcome = Err(ClientError::Closed);
                false
            }
            _ => {
                outcome = Err(ClientError::AlreadyAttached);
                false
            }
        });
        outcome
    }

    fn check_writable(&self) -> Result<()> {
        match self.current_state() {
            SessionState::Attached => Ok(()),
            SessionState::Reattaching => Err(ClientError::Reattaching),
            SessionState::Closed => Err(ClientError::Closed),
            SessionState::Unattached | SessionState::Attaching => Err(ClientError::NotAttached),
        }
    }

    /// Open a connection, run the handshake and install the new writer.
    async fn connect(&self, identity: &DeviceIdentity) -> Result<(Link, AttachReply)> {
        let mut conn = connection::open(&self.config).await?;
        let request =
            handshake::attach_request(self.config.host_header(), &self.config.app_key, identity);
        let handshake =
            handshake::perform(&mut conn, &request, self.config.handshake_timeout()).await?;

        let interval = handshake
            .reply
            .heartbeat
            .filter(|&secs| secs > 0)
            .unwrap_or(self.config.default_heartbeat_secs)
            .max(1);
        self.heartbeat_secs.store(interval, Ordering::Relaxed);
        debug!("Attach reply: {}", handshake.body.trim());

        let (reader, writer) = tokio::io::split(conn);
        *self.writer.lock().await = Some(FramedWrite::new(writer, FrameCodec::chunks_only()));

        let link = Link {
            reader,
            codec: handshake.codec,
            buffer: handshake.buffer,
        };
        let reply = AttachReply {
            reply: handshake.reply,
            body: handshake.body,
        };
        Ok((link, reply))
    }

    fn start_loops(self: Arc<Self>, link: Link) {
        self.loop_starts.fetch_add(1, Ordering::SeqCst);
        let heartbeat = tokio::spawn(Arc::clone(&self).heartbeat_loop());
        let receive = tokio::spawn(Arc::clone(&self).receive_loop(link));
        self.task_slots().extend([heartbeat, receive]);
    }

    async fn write_frame(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotAttached)?;
        writer.send(frame).await?;
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        debug!("Heartbeat task started");

        loop {
            let interval = Duration::from_secs(self.heartbeat_secs.load(Ordering::Relaxed));
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }

            if self.current_state() == SessionState::Reattaching {
                debug!("Skipping heartbeat while reattaching");
                continue;
            }

            trace!("Sending heartbeat");
            match self.write_frame(Frame::Heartbeat).await {
                Ok(()) => {}
                Err(ClientError::NotAttached) => debug!("Skipping heartbeat, no connection"),
                Err(e) => {
                    error!("Failed to send heartbeat, heartbeat task exiting: {}", e);
                    break;
                }
            }
        }

        debug!("Heartbeat task stopped");
    }

    async fn receive_loop(self: Arc<Self>, mut link: Link) {
        debug!("Receive task started");
        let poll = self.config.receive_poll();
        let mut empty_reads = 0u32;

        loop {
            let reason = match self.dispatch_buffered(&mut link).await {
                Err(e) => format!("inbound framing error: {e}"),
                Ok(()) => {
                    let outcome = tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        outcome = read_once(&mut link.reader, &mut link.buffer, poll) => outcome,
                    };

                    match outcome {
                        ReadOutcome::Data(n) => {
                            trace!("Received {} bytes", n);
                            empty_reads = 0;
                            continue;
                        }
                        ReadOutcome::Idle => continue,
                        ReadOutcome::Empty
                            if tolerate_empty_read(
                                self.config.use_tls,
                                empty_reads,
                                self.config.max_empty_tls_reads,
                            ) =>
                        {
                            empty_reads += 1;
                            debug!("Empty TLS read ({}), waiting", empty_reads);
                            continue;
                        }
                        ReadOutcome::Empty => "connection closed by peer".to_string(),
                        ReadOutcome::Failed(e) => format!("read failed: {e}"),
                    }
                }
            };

            warn!("Network error in receive loop ({}), reattaching", reason);
            link = match self.reattach(link).await {
                Some(next) => next,
                None => break,
            };
            empty_reads = 0;
        }

        debug!("Receive task stopped");
    }

    /// Serve every complete request already in the read buffer.
    async fn dispatch_buffered(&self, link: &mut Link) -> std::result::Result<(), CodecError> {
        while let Some(item) = link.codec.decode(&mut link.buffer)? {
            match item {
                Decoded::Chunk(payload) if is_blank(&payload) => {
                    trace!("Skipping blank chunk ({} bytes)", payload.len());
                }
                Decoded::Chunk(payload) => self.serve(payload).await,
                Decoded::Head(head) => {
                    debug!("Ignoring response head mid-stream: {}", head.status);
                }
            }
        }
        Ok(())
    }

    async fn serve(&self, request: Bytes) {
        trace!("Inbound request: {}", String::from_utf8_lossy(&request));

        let handler = self.active_handler();
        let reply = match tokio::task::spawn_blocking(move || handler.handle(&request)).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Message handler failed: {}", e);
                return;
            }
        };

        if reply.is_empty() {
            trace!("Handler produced no reply");
            return;
        }

        if let Err(e) = self.write_frame(Frame::rpc_reply(reply)).await {
            warn!("Failed to send reply: {}", e);
        }
    }

    /// Replace a failed connection, retrying until it succeeds.
    ///
    /// Returns `None` once the session is stopped.
    async fn reattach(&self, link: Link) -> Option<Link> {
        drop(link);

        let entered = self.state.send_if_modified(|state| {
            if *state == SessionState::Closed {
                false
            } else {
                *state = SessionState::Reattaching;
                true
            }
        });
        if !entered {
            return None;
        }
        self.writer.lock().await.take();

        let identity = self.identity_slot().clone()?;
        let backoff = self.config.reconnect_backoff();

        loop {
            let attempt = tokio::select! {
                () = self.shutdown.cancelled() => return None,
                attempt = self.connect(&identity) => attempt,
            };

            match attempt {
                Ok((link, reply)) => {
                    if !self.transition(SessionState::Reattaching, SessionState::Attached) {
                        self.writer.lock().await.take();
                        return None;
                    }
                    self.set_last_error(ErrorCode::Ok);
                    info!("Device {} reattached: {}", identity.device_id, reply.body.trim());
                    return Some(link);
                }
                Err(e) => {
                    let e = self.fail(e);
                    warn!(
                        "Reattach failed ({}): {}. Retrying in {:?}",
                        e.code(),
                        e,
                        backoff
                    );
                }
            }

            tokio::select! {
                () = self.shutdown.cancelled() => return None,
                () = tokio::time::sleep(backoff) => {}
            }
        }
    }
}
