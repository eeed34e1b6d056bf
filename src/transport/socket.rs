//! Process-wide shared UDP channel.
//!
//! All gateway sessions in the process share one socket per listening port:
//! the socket and its receive task are created when the first handler
//! registers and torn down when the last one leaves. Uses SO_REUSEPORT so a
//! channel can coexist with other listeners on the same port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::Value;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::error::{NetworkError, Result};

/// Default UDP port of the gateway protocol.
pub const PROTOCOL_PORT: u16 = 9898;

const RECV_BUFFER_SIZE: usize = 2048;

/// Receives every successfully parsed inbound datagram on a channel.
#[async_trait]
pub trait DatagramHandler: Send + Sync {
    /// Called with the `cmd` string, the full parsed message, and the
    /// datagram's source address. A returned error is logged by the channel
    /// and does not block delivery to subsequent handlers.
    async fn on_message(&self, command: &str, message: &Value, source: SocketAddr) -> Result<()>;
}

fn channels() -> &'static Mutex<HashMap<u16, Arc<UdpChannel>>> {
    static CHANNELS: OnceLock<Mutex<HashMap<u16, Arc<UdpChannel>>>> = OnceLock::new();
    CHANNELS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Create a UDP socket with SO_REUSEPORT for concurrent operation.
fn create_reusable_socket(port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    socket.set_reuse_port(true)?;

    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;

    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Register a handler on the shared channel for `port`, creating the socket
/// and receive task on first registration.
///
/// Registering a handler that is already present is a no-op. Must be called
/// from within a tokio runtime. Returns the channel so the caller can send
/// outbound datagrams through it.
pub fn register(port: u16, handler: Arc<dyn DatagramHandler>) -> Result<Arc<UdpChannel>> {
    let mut channels = channels().lock().unwrap_or_else(PoisonError::into_inner);

    let channel = match channels.get(&port) {
        Some(channel) => channel.clone(),
        None => {
            let channel = UdpChannel::bind(port)?;
            channels.insert(port, channel.clone());
            channel
        }
    };

    channel.add_handler(handler);
    Ok(channel)
}

/// Remove a handler from the channel for `port`.
///
/// Returns `false` if the handler was not registered. The socket and its
/// receive task are torn down when the last handler is removed.
pub fn unregister(port: u16, handler: &Arc<dyn DatagramHandler>) -> bool {
    let mut channels = channels().lock().unwrap_or_else(PoisonError::into_inner);

    let Some(channel) = channels.get(&port).cloned() else {
        return false;
    };

    let removed = channel.remove_handler(handler);
    if channel.handler_count() == 0 {
        channel.abort_recv_task();
        channels.remove(&port);
    }
    removed
}

/// Tear down the channel for `port` regardless of registered handlers.
pub fn shutdown(port: u16) {
    let mut channels = channels().lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(channel) = channels.remove(&port) {
        channel.abort_recv_task();
    }
}

/// Whether a live channel exists for `port`.
pub fn is_active(port: u16) -> bool {
    channels()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .contains_key(&port)
}

/// A shared UDP socket plus its ordered handler list and receive task.
pub struct UdpChannel {
    socket: Arc<UdpSocket>,
    handlers: Mutex<Vec<Arc<dyn DatagramHandler>>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpChannel {
    fn bind(port: u16) -> Result<Arc<Self>> {
        let std_socket = create_reusable_socket(port)
            .map_err(|source| NetworkError::BindFailed { port, source })?;
        let socket = Arc::new(
            UdpSocket::from_std(std_socket)
                .map_err(|source| NetworkError::BindFailed { port, source })?,
        );
        tracing::debug!("UDP channel listening on port {}", port);

        let channel = Arc::new(Self {
            socket: socket.clone(),
            handlers: Mutex::new(Vec::new()),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(recv_loop(socket, Arc::downgrade(&channel)));
        *channel
            .recv_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Ok(channel)
    }

    /// Send a payload to `host:port`.
    pub async fn send(&self, payload: &str, host: &str, port: u16) -> Result<()> {
        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|_| NetworkError::UnresolvedHost(host.to_string()))?
            .next()
            .ok_or_else(|| NetworkError::UnresolvedHost(host.to_string()))?;

        self.socket
            .send_to(payload.as_bytes(), addr)
            .await
            .map_err(|source| NetworkError::SendFailed {
                addr: addr.to_string(),
                source,
            })?;

        tracing::debug!("Sent to {}: {}", addr, payload);
        Ok(())
    }

    /// The local address the channel's socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handler_count(&self) -> usize {
        self.lock_handlers().len()
    }

    fn add_handler(&self, handler: Arc<dyn DatagramHandler>) {
        let mut handlers = self.lock_handlers();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler);
        }
    }

    fn remove_handler(&self, handler: &Arc<dyn DatagramHandler>) -> bool {
        let mut handlers = self.lock_handlers();
        let before = handlers.len();
        handlers.retain(|h| !Arc::ptr_eq(h, handler));
        handlers.len() != before
    }

    fn abort_recv_task(&self) {
        if let Some(task) = self
            .recv_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    async fn dispatch(&self, data: &[u8], source: SocketAddr) {
        // Malformed datagrams are dropped silently: an open UDP port sees
        // arbitrary noise.
        let Ok(message) = serde_json::from_slice::<Value>(data) else {
            tracing::trace!("Dropping non-JSON datagram from {}", source);
            return;
        };
        let Some(command) = message.get("cmd").and_then(Value::as_str) else {
            tracing::trace!("Dropping datagram without cmd from {}", source);
            return;
        };
        let command = command.to_string();

        // Clone the list so the lock is not held across handler awaits.
        let handlers: Vec<Arc<dyn DatagramHandler>> = self.lock_handlers().clone();
        for handler in handlers {
            if let Err(e) = handler.on_message(&command, &message, source).await {
                tracing::warn!("Datagram handler failed for {} from {}: {}", command, source, e);
            }
        }
    }

    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn DatagramHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, channel: Weak<UdpChannel>) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, source)) => {
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                channel.dispatch(&buf[..len], source).await;
            }
            Err(e) => {
                tracing::warn!("UDP receive error: {}", e);
                // Keeps a persistent socket failure from busy-looping the
                // receive task.
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}
