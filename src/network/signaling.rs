//! Signaling stream transport
//!
//! A single TCP connection per call carrying newline-delimited signaling
//! payloads. Each run of [`SignalingTransport::events`] walks one of three
//! paths:
//!
//! ```text
//! Idle → Connecting → Connected → Data* → Idle   (graceful close)
//! Idle → Connecting → Error → Idle               (failure)
//! Idle → Connecting → Idle                       (peer reset while connecting)
//! ```
//!
//! The acceptor binds before reporting `Connecting`, so
//! [`SignalingTransport::local_addr`] is known as soon as that event arrives.

use futures_util::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use futures_util::future::poll_fn;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;

use crate::config::SignalingConfig;
use crate::constants::DEFAULT_WRITE_QUEUE_DEPTH;
use crate::error::NetworkError;

/// Which side opens the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Actively connects to the remote address
    Initiator,
    /// Binds the address and waits for exactly one inbound connection
    Acceptor,
}

/// Lifecycle and data events of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Idle,
    Connecting,
    Connected,
    /// One received line, without its terminator
    Data(String),
    Error(NetworkError),
}

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Handle shared between a transport and the event stream of one attempt.
///
/// Sockets live here rather than in the stream state so that `close()` frees
/// them immediately, whether or not the stream is ever polled again.
struct Attempt {
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    listener: Mutex<Option<TcpListener>>,
    reader: Mutex<Option<LineReader>>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: watch::Sender<bool>,
}

impl Attempt {
    fn new(closed: watch::Sender<bool>) -> Self {
        Self {
            outbound: Mutex::new(None),
            listener: Mutex::new(None),
            reader: Mutex::new(None),
            local_addr: Mutex::new(None),
            closed,
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn release(&self) {
        // Dropping the sender lets the writer flush and shut down its half
        self.outbound.lock().take();
        self.listener.lock().take();
        self.reader.lock().take();
        self.local_addr.lock().take();
    }

    /// Accept on the held listener; `None` once it has been released
    async fn accept(&self) -> Option<io::Result<TcpStream>> {
        let accepted = poll_fn(|cx| match self.listener.lock().as_ref() {
            Some(listener) => listener.poll_accept(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await?;

        // One connection per attempt; the listener is not reused
        self.listener.lock().take();
        Some(accepted.map(|(socket, peer)| {
            tracing::debug!("Accepted signaling connection from {}", peer);
            socket
        }))
    }

    /// Next line from the held reader; `None` once it has been released
    async fn next_line(&self) -> Option<io::Result<Option<String>>> {
        poll_fn(|cx| match self.reader.lock().as_mut() {
            Some(lines) => Pin::new(lines).poll_next_line(cx).map(Some),
            None => Poll::Ready(None),
        })
        .await
    }
}

/// Role-based stream transport for signaling lines
pub struct SignalingTransport {
    address: SocketAddr,
    role: Role,
    queue_depth: usize,
    current: Mutex<Option<Arc<Attempt>>>,
}

impl SignalingTransport {
    pub fn new(address: SocketAddr, role: Role) -> Self {
        Self {
            address,
            role,
            queue_depth: DEFAULT_WRITE_QUEUE_DEPTH,
            current: Mutex::new(None),
        }
    }

    /// Listen on the configured bind address and port
    pub fn acceptor(config: &SignalingConfig) -> crate::Result<Self> {
        Ok(Self::new(config.listen_addr()?, Role::Acceptor)
            .with_queue_depth(config.write_queue_depth))
    }

    /// Connect to `remote` on the configured port
    pub fn initiator(remote: IpAddr, config: &SignalingConfig) -> Self {
        Self::new(SocketAddr::new(remote, config.port), Role::Initiator)
            .with_queue_depth(config.write_queue_depth)
    }

    /// Outbound lines buffered before `send` starts dropping
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Remote address (initiator) or listen address (acceptor)
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Bound listener address while an acceptor is waiting or connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.current
            .lock()
            .as_ref()
            .and_then(|attempt| *attempt.local_addr.lock())
    }

    /// Check if a connection is established
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .map_or(false, |attempt| attempt.outbound.lock().is_some())
    }

    /// Start a new connection attempt, closing any previous one.
    ///
    /// Nothing happens on the network until the stream is polled.
    pub fn events(&self) -> impl Stream<Item = ConnectionEvent> + Send + 'static {
        self.close();

        let (closed, closed_rx) = watch::channel(false);
        let attempt = Arc::new(Attempt::new(closed));
        *self.current.lock() = Some(attempt.clone());

        let ctx = Context {
            address: self.address,
            role: self.role,
            queue_depth: self.queue_depth,
            attempt,
            closed: closed_rx,
        };
        stream::unfold(Phase::Start(ctx), step)
    }

    /// Queue one line for the peer. Does nothing unless connected.
    ///
    /// Line terminators inside `message` are escaped so the message stays a
    /// single line on the wire.
    pub fn send(&self, message: &str) {
        let current = self.current.lock();
        let Some(attempt) = current.as_ref() else {
            return;
        };
        let outbound = attempt.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            tracing::trace!("Not connected, dropping signaling line");
            return;
        };

        match tx.try_send(normalize_line(message)) {
            Ok(()) => tracing::debug!("Queued signaling line ({} bytes)", message.len()),
            Err(TrySendError::Full(_)) => tracing::warn!("Signaling write queue full, dropping line"),
            Err(TrySendError::Closed(_)) => tracing::debug!("Signaling writer gone, dropping line"),
        }
    }

    /// Release the connection and listener. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(attempt) = self.current.lock().take() {
            attempt.closed.send_replace(true);
            attempt.release();
        }
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct Context {
    address: SocketAddr,
    role: Role,
    queue_depth: usize,
    attempt: Arc<Attempt>,
    closed: watch::Receiver<bool>,
}


enum Phase {
    Start(Context),
    Connect(Context),
    Establish(Context),
    Reading(Context),
    Failed(Context, NetworkError),
    Finish(Context),
    Done,
}

async fn step(phase: Phase) -> Option<(ConnectionEvent, Phase)> {
    match phase {
        Phase::Start(ctx) => Some((ConnectionEvent::Idle, Phase::Connect(ctx))),

        Phase::Connect(ctx) => {
            if ctx.attempt.is_closed() {
                ctx.attempt.release();
                return None;
            }
            match ctx.role {
                Role::Initiator => {
                    tracing::info!("Connecting to signaling peer {}", ctx.address);
                    Some((ConnectionEvent::Connecting, Phase::Establish(ctx)))
                }
                Role::Acceptor => match TcpListener::bind(ctx.address).await {
                    Ok(listener) => {
                        let local = listener.local_addr().ok();
                        *ctx.attempt.local_addr.lock() = local;
                        *ctx.attempt.listener.lock() = Some(listener);
                        if ctx.attempt.is_closed() {
                            // close() ran while binding
                            ctx.attempt.release();
                            return None;
                        }
                        tracing::info!("Waiting for signaling peer on {:?}", local);
                        Some((ConnectionEvent::Connecting, Phase::Establish(ctx)))
                    }
                    Err(e) => {
                        let error = NetworkError::BindFailed(format!("{}: {}", ctx.address, e));
                        tracing::warn!("Signaling listener unavailable: {}", error);
                        Some((ConnectionEvent::Connecting, Phase::Failed(ctx, error)))
                    }
                },
            }
        }

        Phase::Establish(mut ctx) => {
            let established = tokio::select! {
                result = establish(ctx.role, ctx.address, &ctx.attempt) => result,
                _ = ctx.closed.changed() => None,
            };
            let Some(established) = established else {
                tracing::debug!("Signaling connect cancelled");
                ctx.attempt.release();
                return Some((ConnectionEvent::Idle, Phase::Done));
            };

            match established {
                Ok(socket) => {
                    let peer = socket.peer_addr().ok();
                    if let Err(e) = socket.set_nodelay(true) {
                        tracing::debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    let (read_half, write_half) = socket.into_split();

                    let (tx, rx) = mpsc::channel(ctx.queue_depth);
                    tokio::spawn(write_lines(write_half, rx));
                    *ctx.attempt.outbound.lock() = Some(tx);
                    *ctx.attempt.reader.lock() = Some(BufReader::new(read_half).lines());
                    if ctx.attempt.is_closed() {
                        ctx.attempt.release();
                        return Some((ConnectionEvent::Idle, Phase::Done));
                    }

                    tracing::info!("Signaling connected to {:?}", peer);
                    Some((ConnectionEvent::Connected, Phase::Reading(ctx)))
                }
                Err(e) => match connect_failure(ctx.role, ctx.address, &e) {
                    None => {
                        tracing::debug!("Signaling peer went away while connecting: {}", e);
                        ctx.attempt.release();
                        Some((ConnectionEvent::Idle, Phase::Done))
                    }
                    Some(error) => {
                        tracing::warn!("Signaling connection failed: {}", error);
                        Some((ConnectionEvent::Error(error), Phase::Finish(ctx)))
                    }
                },
            }
        }

        Phase::Reading(mut ctx) => {
            let read = tokio::select! {
                read = ctx.attempt.next_line() => read,
                _ = ctx.closed.changed() => None,
            };
            let Some(read) = read else {
                tracing::debug!("Signaling connection closed locally");
                ctx.attempt.release();
                return Some((ConnectionEvent::Idle, Phase::Done));
            };

            match read {
                Ok(Some(line)) => {
                    tracing::trace!("Received signaling line ({} bytes)", line.len());
                    Some((ConnectionEvent::Data(line), Phase::Reading(ctx)))
                }
                Ok(None) => {
                    tracing::info!("Signaling peer closed the connection");
                    ctx.attempt.release();
                    Some((ConnectionEvent::Idle, Phase::Done))
                }
                Err(e) if is_peer_disconnect(&e) => {
                    tracing::info!("Signaling peer disconnected: {}", e);
                    ctx.attempt.release();
                    Some((ConnectionEvent::Idle, Phase::Done))
                }
                Err(e) => {
                    tracing::warn!("Signaling read failed: {}", e);
                    let error = NetworkError::ReceiveFailed(e.to_string());
                    Some((ConnectionEvent::Error(error), Phase::Finish(ctx)))
                }
            }
        }

        Phase::Failed(ctx, error) => Some((ConnectionEvent::Error(error), Phase::Finish(ctx))),

        Phase::Finish(ctx) => {
            ctx.attempt.release();
            Some((ConnectionEvent::Idle, Phase::Done))
        }

        Phase::Done => None,
    }
}

/// Connect, or accept on the attempt's listener. `None` if the listener was
/// released first.
async fn establish(
    role: Role,
    address: SocketAddr,
    attempt: &Attempt,
) -> Option<io::Result<TcpStream>> {
    match role {
        Role::Initiator => Some(TcpStream::connect(address).await),
        Role::Acceptor => attempt.accept().await,
    }
}

/// Error to report for a failed connect or accept; `None` when the peer
/// simply went away
fn connect_failure(role: Role, address: SocketAddr, error: &io::Error) -> Option<NetworkError> {
    if is_peer_disconnect(error) {
        return None;
    }
    Some(match role {
        Role::Initiator => NetworkError::ConnectFailed(format!("{}: {}", address, error)),
        Role::Acceptor => NetworkError::AcceptFailed(error.to_string()),
    })
}

/// Writer task: one line plus terminator per queued message, flushed each time
async fn write_lines(mut writer: OwnedWriteHalf, mut lines: mpsc::Receiver<String>) {
    while let Some(line) = lines.recv().await {
        let mut frame = line.into_bytes();
        frame.push(b'\n');

        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!("Signaling write failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Errors that mean the peer went away rather than something broke
fn is_peer_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Strip trailing terminators and escape embedded ones
fn normalize_line(message: &str) -> String {
    let trimmed = message.trim_end_matches(|c| c == '\r' || c == '\n');
    let mut line = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        match c {
            '\r' => line.push_str("\\r"),
            '\n' => line.push_str("\\n"),
            c => line.push(c),
        }
    }
    line
}

/// Callback seam for a media engine that prefers notifications over streams
pub trait SignalingObserver {
    fn on_connected(&mut self) {}

    fn on_line(&mut self, line: &str);

    /// Called once per connection attempt that connected or failed
    fn on_disconnected(&mut self, _error: Option<&NetworkError>) {}
}

/// Feed a connection's events to an observer until the sequence ends
pub async fn drive_observer<S, O>(mut events: S, observer: &mut O)
where
    S: Stream<Item = ConnectionEvent> + Unpin,
    O: SignalingObserver + ?Sized,
{
    let mut connected = false;
    let mut failure = None;

    while let Some(event) = events.next().await {
        match event {
            ConnectionEvent::Connected => {
                connected = true;
                observer.on_connected();
            }
            ConnectionEvent::Data(line) => observer.on_line(&line),
            ConnectionEvent::Error(error) => failure = Some(error),
            ConnectionEvent::Idle => {
                if connected || failure.is_some() {
                    connected = false;
                    observer.on_disconnected(failure.take().as_ref());
                }
            }
            ConnectionEvent::Connecting => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next<S>(events: &mut S) -> Option<ConnectionEvent>
    where
        S: Stream<Item = ConnectionEvent> + Unpin,
    {
        tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("timed out waiting for connection event")
    }

    async fn rest<S>(events: S) -> Vec<ConnectionEvent>
    where
        S: Stream<Item = ConnectionEvent>,
    {
        tokio::time::timeout(Duration::from_secs(5), events.collect::<Vec<_>>())
            .await
            .expect("event sequence did not terminate")
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap()
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Acceptor on all interfaces, already waiting, plus its port
    async fn waiting_acceptor() -> (
        SignalingTransport,
        impl Stream<Item = ConnectionEvent> + Unpin,
        u16,
    ) {
        let acceptor = SignalingTransport::new("0.0.0.0:0".parse().unwrap(), Role::Acceptor);
        let mut events = Box::pin(acceptor.events());

        assert_eq!(next(&mut events).await, Some(ConnectionEvent::Idle));
        assert_eq!(next(&mut events).await, Some(ConnectionEvent::Connecting));
        let port = acceptor.local_addr().expect("listener bound").port();
        (acceptor, events, port)
    }

    async fn connected_initiator(
        port: u16,
    ) -> (SignalingTransport, impl Stream<Item = ConnectionEvent> + Unpin) {
        let initiator = SignalingTransport::new(loopback(port), Role::Initiator);
        let mut events = Box::pin(initiator.events());

        assert_eq!(next(&mut events).await, Some(ConnectionEvent::Idle));
        assert_eq!(next(&mut events).await, Some(ConnectionEvent::Connecting));
        assert_eq!(next(&mut events).await, Some(ConnectionEvent::Connected));
        (initiator, events)
    }

    #[tokio::test]
    async fn test_connect_and_exchange_lines() {
        let (acceptor, mut accepted, port) = waiting_acceptor().await;

        let (initiator, mut connected) = connected_initiator(port).await;
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));
        assert!(initiator.is_connected());

        initiator.send("hello");
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Data("hello".to_string())));

        acceptor.send("world");
        assert_eq!(next(&mut connected).await, Some(ConnectionEvent::Data("world".to_string())));
    }

    #[tokio::test]
    async fn test_lines_arrive_in_order() {
        let (_acceptor, mut accepted, port) = waiting_acceptor().await;
        let (initiator, _connected) = connected_initiator(port).await;
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));

        for line in ["offer", "candidate-1", "candidate-2"] {
            initiator.send(line);
        }
        for line in ["offer", "candidate-1", "candidate-2"] {
            assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Data(line.to_string())));
        }
    }

    #[tokio::test]
    async fn test_peer_close_ends_with_idle_and_no_error() {
        let (_acceptor, mut accepted, port) = waiting_acceptor().await;
        let (initiator, _connected) = connected_initiator(port).await;
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));

        initiator.close();

        assert_eq!(rest(accepted).await, vec![ConnectionEvent::Idle]);
        assert!(!initiator.is_connected());
    }

    #[tokio::test]
    async fn test_peer_reset_is_not_an_error() {
        let (_acceptor, mut accepted, port) = waiting_acceptor().await;

        let peer = std::net::TcpStream::connect(loopback(port)).unwrap();
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));

        // Zero linger turns the close into a reset
        socket2::SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);

        assert_eq!(rest(accepted).await, vec![ConnectionEvent::Idle]);
    }

    #[tokio::test]
    async fn test_connection_refused_reports_error() {
        let initiator = SignalingTransport::new(loopback(free_port()), Role::Initiator);

        let events = rest(initiator.events()).await;

        assert_eq!(events.len(), 4);
        assert_eq!(events[0], ConnectionEvent::Idle);
        assert_eq!(events[1], ConnectionEvent::Connecting);
        assert!(matches!(events[2], ConnectionEvent::Error(NetworkError::ConnectFailed(_))));
        assert_eq!(events[3], ConnectionEvent::Idle);
    }

    #[tokio::test]
    async fn test_bind_failure_reports_error() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let acceptor = SignalingTransport::new(occupied.local_addr().unwrap(), Role::Acceptor);

        let events = rest(acceptor.events()).await;

        assert_eq!(events[..2], [ConnectionEvent::Idle, ConnectionEvent::Connecting]);
        assert!(matches!(events[2], ConnectionEvent::Error(NetworkError::BindFailed(_))));
        assert_eq!(events[3..], [ConnectionEvent::Idle]);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_accept() {
        let (acceptor, accepted, _port) = waiting_acceptor().await;
        let pending = tokio::spawn(rest(accepted));

        tokio::time::sleep(Duration::from_millis(50)).await;
        acceptor.close();
        acceptor.close();

        assert_eq!(pending.await.unwrap(), vec![ConnectionEvent::Idle]);
        assert_eq!(acceptor.local_addr(), None);
    }

    #[tokio::test]
    async fn test_restart_closes_previous_attempt() {
        let (acceptor, first, _port) = waiting_acceptor().await;
        let pending = tokio::spawn(rest(first));

        let mut second = Box::pin(acceptor.events());
        assert_eq!(next(&mut second).await, Some(ConnectionEvent::Idle));

        assert_eq!(pending.await.unwrap(), vec![ConnectionEvent::Idle]);
    }

    #[tokio::test]
    async fn test_close_frees_listening_port() {
        let port = free_port();
        let acceptor = SignalingTransport::new(loopback(port), Role::Acceptor);
        let mut accepted = Box::pin(acceptor.events());
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Idle));
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connecting));

        acceptor.close();

        // The stream is never polled again, yet the port is free
        assert!(std::net::TcpListener::bind(loopback(port)).is_ok());
    }

    #[tokio::test]
    async fn test_restart_on_fixed_port() {
        let port = free_port();
        let acceptor = SignalingTransport::new(loopback(port), Role::Acceptor);
        let mut first = Box::pin(acceptor.events());
        assert_eq!(next(&mut first).await, Some(ConnectionEvent::Idle));
        assert_eq!(next(&mut first).await, Some(ConnectionEvent::Connecting));
        let pending = tokio::spawn(rest(first));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = Box::pin(acceptor.events());
        assert_eq!(next(&mut second).await, Some(ConnectionEvent::Idle));
        assert_eq!(next(&mut second).await, Some(ConnectionEvent::Connecting));
        assert_eq!(acceptor.local_addr(), Some(loopback(port)));
        assert_eq!(pending.await.unwrap(), vec![ConnectionEvent::Idle]);

        let (_initiator, _connected) = connected_initiator(port).await;
        assert_eq!(next(&mut second).await, Some(ConnectionEvent::Connected));
    }

    #[tokio::test]
    async fn test_local_close_releases_connection() {
        let (acceptor, mut accepted, port) = waiting_acceptor().await;
        let (_initiator, connected) = connected_initiator(port).await;
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));

        acceptor.close();

        // The peer sees the connection end without the acceptor being polled
        assert_eq!(rest(connected).await, vec![ConnectionEvent::Idle]);
        assert!(!acceptor.is_connected());
    }

    #[test]
    fn test_peer_going_away_while_connecting_is_silent() {
        let address = loopback(8888);
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
        ] {
            let error = io::Error::from(kind);
            assert_eq!(connect_failure(Role::Initiator, address, &error), None);
            assert_eq!(connect_failure(Role::Acceptor, address, &error), None);
        }

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            connect_failure(Role::Initiator, address, &refused),
            Some(NetworkError::ConnectFailed(_))
        ));
        assert!(matches!(
            connect_failure(Role::Acceptor, address, &refused),
            Some(NetworkError::AcceptFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_send_without_connection_is_noop() {
        let initiator = SignalingTransport::new(loopback(free_port()), Role::Initiator);
        initiator.send("dropped");

        let _events = initiator.events();
        initiator.send("still dropped");
        assert!(!initiator.is_connected());
    }

    #[tokio::test]
    async fn test_embedded_newlines_stay_on_one_line() {
        let (_acceptor, mut accepted, port) = waiting_acceptor().await;
        let (initiator, _connected) = connected_initiator(port).await;
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Connected));

        initiator.send("v=0\r\no=-\n");
        initiator.send("next");

        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Data("v=0\\r\\no=-".to_string())));
        assert_eq!(next(&mut accepted).await, Some(ConnectionEvent::Data("next".to_string())));
    }

    #[test]
    fn test_normalize_line() {
        assert_eq!(normalize_line("plain"), "plain");
        assert_eq!(normalize_line("trailing\r\n"), "trailing");
        assert_eq!(normalize_line("a\nb"), "a\\nb");
        assert_eq!(normalize_line(""), "");
    }

    #[derive(Default)]
    struct Recorder {
        log: Vec<String>,
    }

    impl SignalingObserver for Recorder {
        fn on_connected(&mut self) {
            self.log.push("connected".to_string());
        }

        fn on_line(&mut self, line: &str) {
            self.log.push(format!("line:{}", line));
        }

        fn on_disconnected(&mut self, error: Option<&NetworkError>) {
            self.log.push(format!("disconnected:{}", error.is_some()));
        }
    }

    #[tokio::test]
    async fn test_observer_sees_connection_lifecycle() {
        let address = loopback(free_port());
        let acceptor = SignalingTransport::new(address, Role::Acceptor);
        let mut recorder = Recorder::default();

        let client = async {
            let mut socket = loop {
                match TcpStream::connect(address).await {
                    Ok(socket) => break socket,
                    Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            };
            socket.write_all(b"one\ntwo\n").await.unwrap();
        };

        tokio::time::timeout(
            Duration::from_secs(5),
            async { tokio::join!(drive_observer(Box::pin(acceptor.events()), &mut recorder), client) },
        )
        .await
        .unwrap();

        assert_eq!(recorder.log, ["connected", "line:one", "line:two", "disconnected:false"]);
    }

    #[tokio::test]
    async fn test_observer_sees_failed_attempt() {
        let initiator = SignalingTransport::new(loopback(free_port()), Role::Initiator);
        let mut recorder = Recorder::default();

        drive_observer(Box::pin(initiator.events()), &mut recorder).await;

        assert_eq!(recorder.log, ["disconnected:true"]);
    }
}
