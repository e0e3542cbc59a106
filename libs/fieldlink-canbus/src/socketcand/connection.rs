//! Socketcand protocol connection
//!
//! One TCP connection to a socketcand gateway carries both operator commands
//! (open, subscribe, filter, echo) and an unbounded stream of unsolicited bus
//! frames. A dedicated reader task demultiplexes the inbound side: frames go
//! to per-address subscriptions (or the monitor listener), and every parsed
//! message fulfills any pending command correlation handles under its verb.
//!
//! A closed connection never reopens itself: subscriptions are session state
//! on the server, and a silent reconnect would silently lose them. Callers
//! construct a new connection instead.

use super::codec::SocketcandCodec;
use super::message::{Message, MessageKind};
use super::subscription::Subscription;
use crate::frame::{CanbusFrame, FrameListener};
use dashmap::DashMap;
use errors::{FieldLinkError, Result};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default timeout for one blocking read on the socket
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(400);

/// Default time a connectivity check waits before its pending handle is
/// cleaned up
pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake reads use a more generous multiple of the read timeout
const CONNECT_TIMEOUT_FACTOR: u32 = 10;

/// How long close() waits for the reader task to stop
const READER_JOIN_WAIT: Duration = Duration::from_secs(1);

type Reader = FramedRead<OwnedReadHalf, SocketcandCodec>;
type Writer = FramedWrite<OwnedWriteHalf, SocketcandCodec>;
type PendingKey = (MessageKind, u64);

/// State shared between the connection handle and its reader task
struct Dispatch {
    subscriptions: DashMap<u32, Subscription>,
    monitor: parking_lot::RwLock<Option<Arc<dyn FrameListener>>>,
    pending: parking_lot::Mutex<HashMap<PendingKey, oneshot::Sender<Message>>>,
    established: AtomicBool,
}

impl Dispatch {
    /// Route one bus frame. Monitor mode suppresses per-address routing; with
    /// neither a monitor nor a matching subscription the frame is dropped.
    fn dispatch_frame(&self, frame: &CanbusFrame) {
        let monitor = self.monitor.read().clone();
        if let Some(listener) = monitor {
            listener.frame_received(frame);
            return;
        }
        // clone the listener out so no map shard is held across the callback
        let listener = self
            .subscriptions
            .get(&frame.address())
            .map(|sub| sub.listener());
        if let Some(listener) = listener {
            listener.frame_received(frame);
        }
    }

    /// Fulfill every pending handle registered under this message's verb.
    /// Removal from the registry is the claim step; each oneshot cell can
    /// only fire once.
    fn fulfill(&self, message: &Message) {
        let Some(kind) = message.kind() else { return };
        let senders: Vec<oneshot::Sender<Message>> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .keys()
                .filter(|(pending_kind, _)| *pending_kind == kind)
                .copied()
                .collect();
            keys.iter().filter_map(|key| pending.remove(key)).collect()
        };
        for sender in senders {
            let _ = sender.send(message.clone());
        }
    }
}

/// Connection to a socketcand CAN bus gateway.
///
/// See [`SocketcandConnection::open`] for the establishment sequence. All
/// methods take `&self`; the connection is intended to be shared behind an
/// [`Arc`] between the task issuing commands and whatever owns its lifetime.
pub struct SocketcandConnection {
    host: String,
    port: u16,
    bus_name: String,
    read_timeout: Duration,
    verify_timeout: Duration,
    dispatch: Arc<Dispatch>,
    closed: AtomicBool,
    writer: Mutex<Option<Writer>>,
    /// serializes control commands with their subscription-table updates
    control_lock: Mutex<()>,
    cancel: CancellationToken,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl SocketcandConnection {
    pub fn new(host: impl Into<String>, port: u16, bus_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            bus_name: bus_name.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
            dispatch: Arc::new(Dispatch {
                subscriptions: DashMap::new(),
                monitor: parking_lot::RwLock::new(None),
                pending: parking_lot::Mutex::new(HashMap::new()),
                established: AtomicBool::new(false),
            }),
            closed: AtomicBool::new(false),
            writer: Mutex::new(None),
            control_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// Timeout for one blocking read on the socket
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Time before an unanswered connectivity check is cleaned up
    pub fn with_verify_timeout(mut self, verify_timeout: Duration) -> Self {
        self.verify_timeout = verify_timeout;
        self
    }

    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    pub fn is_established(&self) -> bool {
        self.dispatch.established.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_monitoring(&self) -> bool {
        self.dispatch.monitor.read().is_some()
    }

    /// Pending command correlation handles not yet fulfilled or cleaned up
    pub fn pending_correlations(&self) -> usize {
        self.dispatch.pending.lock().len()
    }

    /// Establish the session: connect, expect the server greeting, open the
    /// bus, expect the acknowledgement, then start the reader task.
    ///
    /// Any other handshake message, end-of-stream, or timeout is a protocol
    /// error; the socket is dropped and the connection stays unestablished.
    /// A connection that was closed cannot be opened again.
    pub async fn open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FieldLinkError::ConnectionClosed);
        }
        if self.is_established() {
            return Ok(());
        }
        let endpoint = format!("{}:{}", self.host, self.port);
        let handshake_timeout = self.read_timeout * CONNECT_TIMEOUT_FACTOR;

        let stream = timeout(
            handshake_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| FieldLinkError::connection_failed(&endpoint, "connect timed out"))?
        .map_err(|e| FieldLinkError::connection_failed(&endpoint, e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY on {endpoint}: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader: Reader = FramedRead::new(read_half, SocketcandCodec);
        let mut writer: Writer = FramedWrite::new(write_half, SocketcandCodec);

        // the server sends the greeting immediately when the socket connects
        let greeting = read_handshake(&mut reader, handshake_timeout).await?;
        if greeting.kind() != Some(MessageKind::Hi) {
            error!("did not receive expected greeting from [{endpoint}]: {greeting}");
            return Err(FieldLinkError::protocol("did not receive expected greeting"));
        }

        writer.send(Message::open(&self.bus_name)).await?;

        let ack = read_handshake(&mut reader, handshake_timeout).await?;
        if ack.kind() != Some(MessageKind::Ok) {
            error!("error opening bus [{}]: {ack}", self.bus_name);
            return Err(FieldLinkError::Protocol(format!(
                "error opening bus [{}]: {ack}",
                self.bus_name
            )));
        }

        *self.writer.lock().await = Some(writer);
        let handle = tokio::spawn(reader_loop(
            reader,
            Arc::clone(&self.dispatch),
            self.cancel.clone(),
            self.read_timeout,
        ));
        *self.reader.lock() = Some(handle);
        self.dispatch.established.store(true, Ordering::SeqCst);
        self.connection_confirmed();
        info!("opened connection {self}");
        Ok(())
    }

    /// Hook invoked once the reader task is running; transport finalization
    /// that must wait for an established session goes here.
    fn connection_confirmed(&self) {
        debug!("connection confirmed: {self}");
    }

    /// Register `subscription`, replacing any existing subscription for the
    /// same address (last writer wins; the previous listener stops receiving).
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.ensure_established()?;
        let message = subscription.to_message();
        let address = subscription.address();
        let _control = self.control_lock.lock().await;
        self.write_message(message).await?;
        if let Some(old) = self.dispatch.subscriptions.insert(address, subscription) {
            warn!(
                "subscription to CAN bus [{}] {old} replaced by new subscription",
                self.bus_name
            );
        }
        info!(
            "subscribed to CAN bus [{}] address 0x{address:X}",
            self.bus_name
        );
        Ok(())
    }

    /// Remove the subscription for `address`, if any
    pub async fn unsubscribe(&self, address: u32, extended: bool) -> Result<()> {
        self.ensure_established()?;
        let _control = self.control_lock.lock().await;
        self.write_message(Message::unsubscribe(address, extended))
            .await?;
        self.dispatch.subscriptions.remove(&address);
        info!(
            "unsubscribed from CAN bus [{}] address 0x{address:X}",
            self.bus_name
        );
        Ok(())
    }

    /// Enter monitor mode: `listener` receives every frame and per-address
    /// subscriptions are suppressed until [`Self::unmonitor`]
    pub async fn monitor(&self, listener: Arc<dyn FrameListener>) -> Result<()> {
        self.ensure_established()?;
        let _control = self.control_lock.lock().await;
        self.write_message(Message::rawmode()).await?;
        *self.dispatch.monitor.write() = Some(listener);
        info!("monitoring CAN bus [{}]", self.bus_name);
        Ok(())
    }

    /// Leave monitor mode; registered subscriptions resume receiving frames
    /// without re-subscribing
    pub async fn unmonitor(&self) -> Result<()> {
        self.ensure_established()?;
        let _control = self.control_lock.lock().await;
        self.write_message(Message::bcmmode()).await?;
        *self.dispatch.monitor.write() = None;
        info!("stopped monitoring CAN bus [{}]", self.bus_name);
        Ok(())
    }

    /// Write a frame onto the bus
    pub async fn send_frame(&self, frame: &CanbusFrame) -> Result<()> {
        self.ensure_established()?;
        self.write_message(Message::send_frame(frame)).await
    }

    /// Probe the connection with an echo command.
    ///
    /// Returns a [`ConnectivityCheck`] that resolves `true` when the echo
    /// reply arrives and `false` if the check times out first. Called on a
    /// closed or unestablished connection it resolves `false` immediately
    /// with no I/O; a failed send is an error from this call itself.
    pub async fn verify_connectivity(&self) -> Result<ConnectivityCheck> {
        if self.is_closed() || !self.is_established() {
            return Ok(ConnectivityCheck::resolved(false));
        }
        let token = rand::random::<u64>();
        let key: PendingKey = (MessageKind::Echo, token);
        let (sender, receiver) = oneshot::channel();
        self.dispatch.pending.lock().insert(key, sender);

        if let Err(err) = self.write_message(Message::echo()).await {
            self.dispatch.pending.lock().remove(&key);
            return Err(err);
        }

        // best-effort cleanup so failed checks cannot accumulate handles;
        // dropping the sender resolves the check false
        let dispatch = Arc::clone(&self.dispatch);
        let verify_timeout = self.verify_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(verify_timeout).await;
            if dispatch.pending.lock().remove(&key).is_some() {
                debug!("connectivity check {token:#018x} expired; removed pending handle");
            }
        });

        Ok(ConnectivityCheck::pending(receiver))
    }

    /// Close the connection: stop the reader task (bounded wait) and shut the
    /// socket down best-effort. Idempotent. The connection cannot be
    /// reopened afterwards.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatch.established.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.close().await {
                debug!("error shutting down socketcand writer: {err}");
            }
        }
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if timeout(READER_JOIN_WAIT, handle).await.is_err() {
                warn!("reader task for {self} did not stop within {READER_JOIN_WAIT:?}");
            }
        }
        info!("closed connection {self}");
    }

    fn ensure_established(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FieldLinkError::ConnectionClosed);
        }
        if !self.is_established() {
            return Err(FieldLinkError::NotConnected);
        }
        Ok(())
    }

    async fn write_message(&self, message: Message) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(FieldLinkError::NotConnected)?;
        writer.send(message).await
    }
}

impl fmt::Display for SocketcandConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SocketcandConnection{{{}@{}:{}}}",
            self.bus_name, self.host, self.port
        )
    }
}

impl fmt::Debug for SocketcandConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketcandConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("bus_name", &self.bus_name)
            .field("established", &self.is_established())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Read one handshake message with a bounded wait
async fn read_handshake(reader: &mut Reader, limit: Duration) -> Result<Message> {
    match timeout(limit, reader.next()).await {
        Err(_) => Err(FieldLinkError::Timeout(
            "socketcand handshake message".to_string(),
        )),
        Ok(None) => Err(FieldLinkError::protocol(
            "connection closed during handshake",
        )),
        Ok(Some(result)) => result,
    }
}

/// Reader task: sole reader of the socket for the connection's lifetime.
///
/// Read timeouts and unreadable messages are noise, not failures; only
/// end-of-stream or cancellation end the loop.
async fn reader_loop(
    mut reader: Reader,
    dispatch: Arc<Dispatch>,
    cancel: CancellationToken,
    read_timeout: Duration,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = timeout(read_timeout, reader.next()) => next,
        };
        let message = match next {
            Err(_) => continue, // read timeout; try again
            Ok(None) => {
                debug!("socketcand stream ended");
                break;
            },
            Ok(Some(Err(err))) => {
                warn!("discarding unreadable message: {err}");
                continue;
            },
            Ok(Some(Ok(message))) => message,
        };

        if message.kind() == Some(MessageKind::Frame) {
            match message.to_frame() {
                Ok(frame) => dispatch.dispatch_frame(&frame),
                Err(err) => warn!("discarding malformed frame message: {err}"),
            }
        }
        dispatch.fulfill(&message);
    }
    dispatch.established.store(false, Ordering::SeqCst);
}

/// Asynchronous result of [`SocketcandConnection::verify_connectivity`]
pub struct ConnectivityCheck {
    state: CheckState,
}

enum CheckState {
    Resolved(bool),
    Pending(oneshot::Receiver<Message>),
}

impl ConnectivityCheck {
    fn resolved(value: bool) -> Self {
        Self {
            state: CheckState::Resolved(value),
        }
    }

    fn pending(receiver: oneshot::Receiver<Message>) -> Self {
        Self {
            state: CheckState::Pending(receiver),
        }
    }
}

impl Future for ConnectivityCheck {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        match &mut self.state {
            CheckState::Resolved(value) => Poll::Ready(*value),
            CheckState::Pending(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(_)) => Poll::Ready(true),
                // sender dropped: the pending handle was cleaned up unfulfilled
                Poll::Ready(Err(_)) => Poll::Ready(false),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
