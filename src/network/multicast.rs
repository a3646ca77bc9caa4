//! Multicast group transport
//!
//! A plain text datagram pipe bound to one multicast group and port. It knows
//! nothing about presence semantics; the directory owns all protocol logic.

use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

use crate::config::PresenceConfig;
use crate::error::NetworkError;

/// Receive buffer size. Oversized datagrams are rejected by the decoder
/// rather than truncated by the socket.
const RECV_BUFFER_SIZE: usize = 2048;

/// A received datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub message: String,
    pub sender: SocketAddr,
}

/// Datagram channel the presence directory runs on
pub trait PresenceLink: Send + Sync {
    /// (Re)open the channel and return its incoming datagrams.
    /// Any stream returned by an earlier call ends.
    fn open(&self) -> Result<BoxStream<'static, Datagram>, NetworkError>;

    /// Best-effort, non-blocking send of one datagram
    fn send(&self, message: &str);

    /// Release the underlying channel
    fn close(&self);
}

/// Create a UDP socket joined to the configured multicast group
pub fn create_multicast_socket(config: &PresenceConfig) -> Result<StdUdpSocket, NetworkError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // Several processes on one host may listen on the same group
    socket.set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEADDR: {}", e)))?;

    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)
        .map_err(|e| NetworkError::BindFailed(format!("Failed to set SO_REUSEPORT: {}", e)))?;

    let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.group_port));
    socket.bind(&bind_addr.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket.join_multicast_v4(&config.group_address, &config.interface)
        .map_err(|e| NetworkError::JoinFailed(format!("{}: {}", config.group_address, e)))?;

    socket.set_multicast_loop_v4(config.multicast_loop)
        .map_err(|e| NetworkError::JoinFailed(format!("Failed to set IP_MULTICAST_LOOP: {}", e)))?;

    socket.set_multicast_ttl_v4(config.multicast_ttl)
        .map_err(|e| NetworkError::JoinFailed(format!("Failed to set IP_MULTICAST_TTL: {}", e)))?;

    if !config.interface.is_unspecified() {
        socket.set_multicast_if_v4(&config.interface)
            .map_err(|e| NetworkError::JoinFailed(format!("Failed to set IP_MULTICAST_IF: {}", e)))?;
    }

    let std_socket: StdUdpSocket = socket.into();
    std_socket.set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(std_socket)
}

/// One joined socket plus the signal that ends its receive streams
struct Binding {
    socket: Arc<UdpSocket>,
    closed: watch::Sender<bool>,
}

/// Send/receive channel on a multicast group
pub struct GroupTransport {
    config: PresenceConfig,
    binding: Mutex<Option<Binding>>,
}

impl GroupTransport {
    pub fn new(config: PresenceConfig) -> Self {
        Self {
            config,
            binding: Mutex::new(None),
        }
    }

    /// Join the group, replacing any previous binding.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), NetworkError> {
        let mut binding = self.binding.lock();
        if let Some(previous) = binding.take() {
            self.release(previous);
        }

        let std_socket = create_multicast_socket(&self.config)?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        let (closed, _) = watch::channel(false);

        *binding = Some(Binding {
            socket: Arc::new(socket),
            closed,
        });

        tracing::info!(
            "Joined multicast group {}:{}",
            self.config.group_address,
            self.config.group_port
        );
        Ok(())
    }

    /// Incoming datagrams on the current binding.
    ///
    /// The stream ends when the transport is closed or restarted, or after
    /// logging a socket error. Before `start` it is empty.
    pub fn receive(&self) -> impl Stream<Item = Datagram> + Send + 'static {
        let state = self
            .binding
            .lock()
            .as_ref()
            .map(|binding| (binding.socket.clone(), binding.closed.subscribe()));

        stream::unfold(state, |state| async move {
            let (socket, mut closed) = state?;
            let is_closed = *closed.borrow();
            if is_closed {
                return None;
            }

            let mut buf = vec![0u8; RECV_BUFFER_SIZE];
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, sender)) => {
                        let message = String::from_utf8_lossy(&buf[..len]).into_owned();
                        Some((Datagram { message, sender }, Some((socket, closed))))
                    }
                    Err(e) => {
                        tracing::warn!("Multicast receive error: {}", e);
                        None
                    }
                },
                _ = closed.changed() => {
                    tracing::debug!("Multicast receive stream closed");
                    None
                }
            }
        })
    }

    /// Fire-and-forget send to the group
    pub fn send(&self, message: &str) {
        let binding = self.binding.lock();
        let Some(binding) = binding.as_ref() else {
            tracing::debug!("Dropping datagram, group transport not started");
            return;
        };

        match binding.socket.try_send_to(message.as_bytes(), self.config.group_socket_addr()) {
            Ok(_) => tracing::trace!("Sent {} bytes to group", message.len()),
            Err(e) => tracing::debug!("Multicast send failed: {}", e),
        }
    }

    /// Leave the group and release the socket. Safe to call repeatedly.
    pub fn close(&self) {
        if let Some(binding) = self.binding.lock().take() {
            self.release(binding);
        }
    }

    /// Check if a binding is active
    pub fn is_running(&self) -> bool {
        self.binding.lock().is_some()
    }

    /// Local address of the current binding
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.binding
            .lock()
            .as_ref()
            .and_then(|binding| binding.socket.local_addr().ok())
    }

    fn release(&self, binding: Binding) {
        binding.closed.send_replace(true);
        if let Err(e) = binding
            .socket
            .leave_multicast_v4(self.config.group_address, self.config.interface)
        {
            tracing::debug!("Leaving multicast group failed: {}", e);
        }
        tracing::info!("Left multicast group {}", self.config.group_address);
    }
}

impl PresenceLink for GroupTransport {
    fn open(&self) -> Result<BoxStream<'static, Datagram>, NetworkError> {
        self.start()?;
        Ok(self.receive().boxed())
    }

    fn send(&self, message: &str) {
        GroupTransport::send(self, message);
    }

    fn close(&self) {
        GroupTransport::close(self);
    }
}

impl Drop for GroupTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn free_udp_port() -> u16 {
        StdUdpSocket::bind("0.0.0.0:0")
            .and_then(|socket| socket.local_addr())
            .map(|addr| addr.port())
            .unwrap()
    }

    fn test_config() -> PresenceConfig {
        PresenceConfig {
            group_port: free_udp_port(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unstarted_transport_is_inert() {
        let transport = GroupTransport::new(test_config());

        transport.send("ignored");
        transport.close();
        transport.close();

        assert!(!transport.is_running());
        assert!(Box::pin(transport.receive()).next().await.is_none());
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let transport = GroupTransport::new(test_config());
        if let Err(e) = transport.start() {
            // Hosts without a multicast-capable interface cannot join
            println!("Skipping, multicast unavailable: {}", e);
            return;
        }

        let mut incoming = Box::pin(transport.receive());
        let pending = tokio::spawn(async move { incoming.next().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.close();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("receive did not unblock")
            .unwrap();
        assert!(result.is_none());
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_datagram_reaches_group_members() {
        let config = test_config();
        let sender = GroupTransport::new(config.clone());
        let listener = GroupTransport::new(config.clone());
        if let Err(e) = sender.start().and_then(|_| listener.start()) {
            println!("Skipping, multicast unavailable: {}", e);
            return;
        }
        // Without a multicast route the send is dropped before the loopback
        let routable = StdUdpSocket::bind("0.0.0.0:0")
            .and_then(|probe| probe.send_to(b"", config.group_socket_addr()))
            .is_ok();
        if !routable {
            println!("Skipping, no route to {}", config.group_socket_addr());
            return;
        }

        let mut incoming = Box::pin(listener.receive());
        sender.send(r#"{"inetAddress":"10.0.0.5","isBusy":false,"type":"NotifyState"}"#);

        let datagram = tokio::time::timeout(Duration::from_secs(2), incoming.next())
            .await
            .expect("datagram not delivered")
            .expect("stream ended");
        assert_eq!(
            datagram.message,
            r#"{"inetAddress":"10.0.0.5","isBusy":false,"type":"NotifyState"}"#
        );
        assert_eq!(datagram.sender.port(), config.group_port);
    }

    #[tokio::test]
    async fn test_restart_ends_previous_stream() {
        let transport = GroupTransport::new(test_config());
        if transport.start().is_err() {
            return;
        }
        let mut first = Box::pin(transport.receive());

        transport.start().unwrap();
        assert!(transport.is_running());

        let ended = tokio::time::timeout(Duration::from_secs(2), first.next())
            .await
            .expect("old stream still running");
        assert!(ended.is_none());
    }
}
