//! Sender engine.
//!
//! `send()` seals a message, records it in the [`OutstandingLedger`] and
//! writes it once. A background task resends every outstanding packet each
//! retransmit interval until it is acknowledged, abandoned, or the sender
//! stops. Retransmission resends the stored bytes verbatim: sequence, nonce
//! and timestamp are never refreshed.
//!
//! State machine: `Running` from [`SecureSender::connect`] until
//! [`SecureSender::stop`], then `Stopped` (terminal).

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::core::{
    DEFAULT_PORT, DEFAULT_RETRANSMIT_INTERVAL, MAX_PAYLOAD_SIZE, SendError, SocketError,
    unix_millis,
};
use crate::crypto::PreSharedKey;
use crate::transport::{DatagramSocket, OutstandingLedger, Packet};

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Destination of every packet.
    pub remote_addr: SocketAddr,

    /// Local address to bind. `None` binds an ephemeral port on the
    /// unspecified address of the remote's family.
    pub bind_addr: Option<SocketAddr>,

    /// Interval between retransmissions of an unacknowledged packet.
    pub retransmit_interval: Duration,

    /// Total transmissions before a packet is abandoned. `None` retries until stop.
    pub max_transmissions: Option<u32>,

    /// Largest payload accepted by `send()`.
    pub max_payload_size: usize,

    /// First sequence number assigned.
    pub initial_sequence: u32,

    /// Listen for acknowledgments and stop retransmitting acked packets.
    #[cfg(feature = "extensions")]
    pub acknowledgments: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            remote_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            bind_addr: None,
            retransmit_interval: DEFAULT_RETRANSMIT_INTERVAL,
            max_transmissions: None,
            max_payload_size: MAX_PAYLOAD_SIZE,
            initial_sequence: 0,
            #[cfg(feature = "extensions")]
            acknowledgments: false,
        }
    }
}

impl SenderConfig {
    fn local_bind_addr(&self) -> SocketAddr {
        self.bind_addr.unwrap_or_else(|| match self.remote_addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        })
    }

    fn acknowledgments_enabled(&self) -> bool {
        #[cfg(feature = "extensions")]
        {
            self.acknowledgments
        }
        #[cfg(not(feature = "extensions"))]
        {
            false
        }
    }
}

/// Builder for [`SenderConfig`].
#[derive(Debug)]
pub struct SenderBuilder {
    config: SenderConfig,
}

impl SenderBuilder {
    /// Create a new sender builder.
    pub fn new() -> Self {
        Self {
            config: SenderConfig::default(),
        }
    }

    /// Set the destination address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.config.remote_addr = addr;
        self
    }

    /// Set the local bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = Some(addr);
        self
    }

    /// Set the retransmit interval.
    pub fn retransmit_interval(mut self, interval: Duration) -> Self {
        self.config.retransmit_interval = interval;
        self
    }

    /// Abandon packets after this many transmissions.
    pub fn max_transmissions(mut self, max: u32) -> Self {
        self.config.max_transmissions = Some(max.max(1));
        self
    }

    /// Set the largest accepted payload (capped at what fits in a datagram).
    pub fn max_payload_size(mut self, size: usize) -> Self {
        self.config.max_payload_size = size.min(MAX_PAYLOAD_SIZE);
        self
    }

    /// Set the first sequence number.
    pub fn initial_sequence(mut self, sequence: u32) -> Self {
        self.config.initial_sequence = sequence;
        self
    }

    /// Enable or disable acknowledgments.
    #[cfg(feature = "extensions")]
    pub fn acknowledgments(mut self, enabled: bool) -> Self {
        self.config.acknowledgments = enabled;
        self
    }

    /// Build the sender configuration.
    pub fn build(self) -> SenderConfig {
        self.config
    }

    /// Build the configuration and start a sender.
    pub async fn connect(self, key: PreSharedKey) -> Result<SecureSender, SocketError> {
        SecureSender::connect(self.config, key).await
    }
}

impl Default for SenderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Issues `(sequence, timestamp)` pairs.
///
/// Both values are assigned under one lock so a later sequence never carries
/// an earlier timestamp, even across concurrent `send()` calls or a wall
/// clock stepping backwards.
#[derive(Debug)]
struct Stamper {
    next_sequence: u32,
    last_timestamp: u64,
}

impl Stamper {
    fn new(initial_sequence: u32) -> Self {
        Self {
            next_sequence: initial_sequence,
            last_timestamp: 0,
        }
    }

    fn next(&mut self, now_ms: u64) -> (u32, u64) {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.wrapping_add(1);
        self.last_timestamp = self.last_timestamp.max(now_ms);
        (sequence, self.last_timestamp)
    }
}

/// State shared between the public handle and its tasks.
struct Shared {
    config: SenderConfig,
    key: PreSharedKey,
    ledger: OutstandingLedger,
    stamper: Mutex<Stamper>,
    running: AtomicBool,
    /// Signalled by `send()` when a new packet enters the ledger.
    wake: Notify,
}

/// Sending half of the secure datagram transport.
///
/// # Example
///
/// ```ignore
/// use secure_udp::prelude::*;
///
/// let key = PreSharedKey::from_default_env()?;
/// let sender = SenderBuilder::new()
///     .remote_addr("127.0.0.1:9000".parse()?)
///     .connect(key)
///     .await?;
///
/// let sequence = sender.send(b"ping").await?;
/// // ...
/// sender.stop().await;
/// ```
pub struct SecureSender {
    shared: Arc<Shared>,

    /// Socket used for first transmissions; taken on stop.
    socket: Mutex<Option<DatagramSocket>>,

    /// Background tasks (retransmit loop, optional ack listener). Held by
    /// `stop()` until they have exited, so concurrent stops all wait.
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,

    /// Shutdown signal.
    shutdown_tx: broadcast::Sender<()>,

    local_addr: SocketAddr,
}

impl SecureSender {
    /// Bind a local socket and start the retransmit loop.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn connect(config: SenderConfig, key: PreSharedKey) -> Result<Self, SocketError> {
        let socket = DatagramSocket::bind(config.local_bind_addr()).await?;
        let local_addr = socket.local_addr()?;

        let acknowledgments = config.acknowledgments_enabled();
        let shared = Arc::new(Shared {
            stamper: Mutex::new(Stamper::new(config.initial_sequence)),
            config,
            key,
            ledger: OutstandingLedger::new(),
            running: AtomicBool::new(true),
            wake: Notify::new(),
        });

        let (shutdown_tx, _) = broadcast::channel(1);

        #[allow(unused_mut)]
        let mut tasks = vec![tokio::spawn(retransmit_loop(
            Arc::clone(&shared),
            socket.clone(),
            shutdown_tx.subscribe(),
        ))];
        #[cfg(feature = "extensions")]
        {
            if acknowledgments {
                tasks.push(tokio::spawn(ack_loop(
                    Arc::clone(&shared),
                    socket.clone(),
                    shutdown_tx.subscribe(),
                )));
            }
        }

        info!(
            local = %local_addr,
            remote = %shared.config.remote_addr,
            acknowledgments,
            "sender started"
        );

        Ok(Self {
            shared,
            socket: Mutex::new(Some(socket)),
            tasks: AsyncMutex::new(tasks),
            shutdown_tx,
            local_addr,
        })
    }

    /// Seal and transmit a message, returning its sequence number.
    ///
    /// Success means the packet was queued for (re)transmission, not that it
    /// was delivered. Nothing is queued when an error is returned.
    pub async fn send(&self, payload: &[u8]) -> Result<u32, SendError> {
        let socket = self.socket().ok_or(SendError::Stopped)?;

        let max = self.shared.config.max_payload_size;
        if payload.len() > max {
            return Err(SendError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let (sequence, timestamp) = lock(&self.shared.stamper).next(unix_millis());
        let packet = Packet::seal(&self.shared.key, sequence, timestamp, payload)?;
        let bytes = Bytes::from(packet.encode());

        self.shared.ledger.insert(sequence, bytes.clone());
        if !self.shared.running.load(Ordering::Acquire) {
            // Lost a race with stop(); its clear() may already have run.
            self.shared.ledger.remove(sequence);
            return Err(SendError::Stopped);
        }
        self.shared.wake.notify_one();

        match socket.send_to(&bytes, self.shared.config.remote_addr).await {
            Ok(_) => trace!(sequence, len = bytes.len(), "packet sent"),
            Err(e) => warn!(sequence, error = %e, "initial send failed, will retransmit"),
        }

        Ok(sequence)
    }

    /// Stop the sender.
    ///
    /// Signals the background tasks, waits for them to exit, releases the
    /// socket and discards every outstanding packet. Safe to call repeatedly.
    pub async fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        let _ = self.shutdown_tx.send(());
        self.shared.wake.notify_one();

        let mut tasks = self.tasks.lock().await;
        while let Some(task) = tasks.last_mut() {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!("sender task panicked");
                }
            }
            tasks.pop();
        }

        // Released only after the tasks have exited.
        lock(&self.socket).take();
        self.shared.ledger.clear();
        drop(tasks);

        if was_running {
            info!(local = %self.local_addr, "sender stopped");
        }
    }

    /// Whether the sender accepts new messages.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Sequence numbers still awaiting acknowledgment, in ascending order.
    pub fn outstanding(&self) -> Vec<u32> {
        self.shared.ledger.sequences()
    }

    /// Number of packets still awaiting acknowledgment.
    pub fn outstanding_count(&self) -> usize {
        self.shared.ledger.len()
    }

    /// Local address of the sender's socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Destination address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.config.remote_addr
    }

    /// Get the sender configuration.
    pub fn config(&self) -> &SenderConfig {
        &self.shared.config
    }

    fn socket(&self) -> Option<DatagramSocket> {
        if !self.shared.running.load(Ordering::Acquire) {
            return None;
        }
        lock(&self.socket).clone()
    }
}

impl Drop for SecureSender {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SecureSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSender")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.shared.config.remote_addr)
            .field("running", &self.is_running())
            .field("outstanding", &self.shared.ledger.len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sleep until `deadline`, or forever when there is nothing to wait for.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn retransmit_loop(
    shared: Arc<Shared>,
    socket: DatagramSocket,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let interval = shared.config.retransmit_interval;
    let remote = shared.config.remote_addr;

    loop {
        let deadline = shared.ledger.next_due(interval);

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = shared.wake.notified() => {}
            _ = sleep_until(deadline) => {}
        }

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let batch = shared
            .ledger
            .take_due(interval, shared.config.max_transmissions, Instant::now());

        for sequence in batch.abandoned {
            warn!(sequence, "abandoning unacknowledged packet");
        }

        for (sequence, bytes) in batch.resend {
            if !shared.running.load(Ordering::Acquire) {
                break;
            }
            match socket.send_to(&bytes, remote).await {
                Ok(_) => trace!(sequence, "packet retransmitted"),
                Err(e) => warn!(sequence, error = %e, "retransmit failed"),
            }
        }
    }

    debug!("retransmit loop exiting");
}

#[cfg(feature = "extensions")]
async fn ack_loop(
    shared: Arc<Shared>,
    socket: DatagramSocket,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    use crate::extensions::open_ack;

    let mut buf = socket.recv_buffer();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => match open_ack(&shared.key, &buf[..len]) {
                        Ok(ack) => {
                            if shared.ledger.acknowledge(ack.sequence, &ack.nonce) {
                                debug!(sequence = ack.sequence, %peer, "packet acknowledged");
                            } else {
                                trace!(
                                    sequence = ack.sequence,
                                    %peer,
                                    "acknowledgment matches no outstanding packet"
                                );
                            }
                        }
                        Err(e) => debug!(%peer, error = %e, "dropping invalid acknowledgment"),
                    },
                    Err(e) => {
                        if !shared.running.load(Ordering::Acquire) {
                            break;
                        }
                        warn!(error = %e, "acknowledgment receive failed");
                    }
                }
            }
        }
    }

    debug!("acknowledgment listener exiting");
}
