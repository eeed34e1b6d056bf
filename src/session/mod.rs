//! Gateway session: transport wiring, lifecycle, and outbound writes.
//!
//! A `GatewaySession` registers itself on the shared UDP channel, drives
//! discovery and the periodic liveness check, and fans every inbound message
//! out to subscribed observers after its own state updates are applied.

pub mod core;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};
use crate::observer::{ObserverRegistry, UpdateObserver};
use crate::protocol::{build_command, build_write_data, Commands};
use crate::transport::{self, DatagramHandler, UdpChannel, PROTOCOL_PORT};

pub use self::core::{GatewayStatus, SessionCore, DISCOVERY_COOLDOWN, LIVENESS_TICK, ONLINE_TIMEOUT};

/// Connection settings for one gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// The gateway's own device identifier.
    pub sid: String,
    /// Host the gateway listens on.
    pub host: String,
    /// Port the gateway listens on.
    pub port: u16,
    /// Pre-shared encryption key, required for accepted write commands.
    pub key: Option<String>,
    /// Local port of the shared listening socket.
    pub listen_port: u16,
}

impl GatewayConfig {
    pub fn new(sid: &str, host: &str, port: u16, key: Option<String>) -> Self {
        Self {
            sid: sid.to_string(),
            host: host.to_string(),
            port,
            key,
            listen_port: PROTOCOL_PORT,
        }
    }
}

/// A live client session for one gateway on the shared transport.
///
/// All mutation of session state and registry goes through one lock; the
/// lock is never held across network sends or observer callbacks.
pub struct GatewaySession {
    config: GatewayConfig,
    core: Mutex<SessionCore>,
    observers: ObserverRegistry,
    channel: Mutex<Option<Arc<UdpChannel>>>,
    gateway_ip: Mutex<Option<IpAddr>>,
    runtime: Mutex<Option<tokio::runtime::Handle>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    status_tx: watch::Sender<GatewayStatus>,
}

impl GatewaySession {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let core = SessionCore::new(&config.sid);
        let (status_tx, _) = watch::channel(GatewayStatus::Uninitialized);
        Arc::new(Self {
            config,
            core: Mutex::new(core),
            observers: ObserverRegistry::new(),
            channel: Mutex::new(None),
            gateway_ip: Mutex::new(None),
            runtime: Mutex::new(None),
            tick_task: Mutex::new(None),
            disposed: AtomicBool::new(false),
            status_tx,
        })
    }

    /// Register on the shared transport, start discovery, and schedule the
    /// periodic liveness check. Idempotent once initialized.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        if lock(&self.channel).is_some() {
            return Ok(());
        }
        self.disposed.store(false, Ordering::SeqCst);
        // Captured so synchronous methods can spawn background sends even
        // when the caller is not on a runtime thread.
        *lock(&self.runtime) = Some(tokio::runtime::Handle::current());

        // Resolve the gateway address once; inbound datagrams on the shared
        // socket are matched against it.
        let resolved = tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip());
        *lock(&self.gateway_ip) = resolved;

        let handler: Arc<dyn DatagramHandler> = self.clone();
        let channel = transport::register(self.config.listen_port, handler)?;
        *lock(&self.channel) = Some(channel);

        let outbound = lock(&self.core).start_discovery(Instant::now());
        self.publish_status();
        for payload in outbound {
            // A failed discovery send is not fatal: the liveness check will
            // report the gateway offline until it answers.
            if let Err(e) = self.send(&payload).await {
                tracing::warn!("Initial discovery send failed: {}", e);
            }
        }

        let session = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(LIVENESS_TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(session) = session.upgrade() else {
                    return;
                };
                lock(&session.core).tick(Instant::now());
                session.publish_status();
            }
        });
        *lock(&self.tick_task) = Some(task);

        Ok(())
    }

    /// Tear down the session: cancel the liveness check and leave the shared
    /// transport. Registry and observers stay readable; no further mutation
    /// happens. Calling this twice is a no-op.
    pub fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(task) = lock(&self.tick_task).take() {
            task.abort();
        }

        if lock(&self.channel).take().is_some() {
            let handler: Arc<dyn DatagramHandler> = self.clone();
            transport::unregister(self.config.listen_port, &handler);
        }
    }

    /// Subscribe an observer to device updates.
    ///
    /// The observer first receives a snapshot of every currently known
    /// device as `read_ack` events, then live updates. A successful
    /// subscribe triggers a re-discovery, subject to the cooldown throttle.
    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn UpdateObserver>) -> bool {
        let added = self
            .observers
            .subscribe(observer, || lock(&self.core).registry().snapshot());
        if !added {
            return false;
        }

        if let Some(payload) = lock(&self.core).request_discovery(Instant::now()) {
            // No handle means initialize has not run; there is no channel to
            // send on yet either.
            if let Some(runtime) = lock(&self.runtime).clone() {
                let session = self.clone();
                runtime.spawn(async move {
                    if let Err(e) = session.send(&payload).await {
                        tracing::warn!("Re-discovery request failed: {}", e);
                    }
                });
            }
        }
        true
    }

    pub fn unsubscribe(&self, observer: &Arc<dyn UpdateObserver>) -> bool {
        self.observers.unsubscribe(observer)
    }

    /// Current gateway status.
    pub fn status(&self) -> GatewayStatus {
        lock(&self.core).status()
    }

    /// Watch channel receiving every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<GatewayStatus> {
        self.status_tx.subscribe()
    }

    /// Write fields to a child device, authenticated with the current
    /// session token and the pre-shared key.
    pub async fn write_to_device(&self, sid: &str, fields: &[(&str, Value)]) -> Result<()> {
        let data = self.encrypted_write_data(fields);
        self.send(&Commands::write(sid, data)).await
    }

    /// Write fields to the gateway itself, using the firmware's
    /// model/sid/short_id envelope.
    pub async fn write_to_gateway(&self, fields: &[(&str, Value)]) -> Result<()> {
        let data = self.encrypted_write_data(fields);
        let payload = build_command(
            "write",
            None,
            &[
                ("model", Value::String("gateway".to_string())),
                ("sid", Value::String(self.config.sid.clone())),
                ("short_id", Value::String("0".to_string())),
                ("data", Value::String(data)),
            ],
        );
        self.send(&payload).await
    }

    fn encrypted_write_data(&self, fields: &[(&str, Value)]) -> String {
        let token = lock(&self.core).token().map(str::to_string);
        build_write_data(fields, token.as_deref(), self.config.key.as_deref())
    }

    async fn send(&self, payload: &str) -> Result<()> {
        let channel = lock(&self.channel)
            .clone()
            .ok_or_else(|| GatewayError::Other("Session is not initialized".to_string()))?;
        channel
            .send(payload, &self.config.host, self.config.port)
            .await
    }

    fn publish_status(&self) {
        let status = lock(&self.core).status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl DatagramHandler for GatewaySession {
    async fn on_message(&self, command: &str, message: &Value, source: std::net::SocketAddr) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let source_matches = lock(&self.gateway_ip)
            .map(|ip| ip == source.ip())
            .unwrap_or(false);

        // State updates under the lock; sends and fan-out after release.
        let processed = {
            let mut core = lock(&self.core);
            if !core.accepts(message, source_matches) {
                return Ok(());
            }
            core.process_message(command, message, Instant::now())
        };
        self.publish_status();

        for payload in &processed.outbound {
            if let Err(e) = self.send(payload).await {
                tracing::warn!("Failed to send {}: {}", payload, e);
            }
        }

        self.observers.publish(&processed.publish_sid, command, message);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
