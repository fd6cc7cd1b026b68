//! Receiver engine.
//!
//! A background task reads datagrams, authenticates and decrypts them, runs
//! replay defense and hands each accepted message to the registered handler.
//! Every per-packet failure drops the datagram and the loop continues.
//!
//! State machine: `Created` after [`SecureReceiver::bind`], `Listening` after
//! [`SecureReceiver::start`], `Stopped` (terminal) after [`SecureReceiver::stop`].

use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::core::{
    BoxError, DEFAULT_CHANNEL_CAPACITY, DEFAULT_PORT, DEFAULT_RECV_BUFFER_SIZE, LifecycleError,
    NONCE_SIZE, ReceiveError, SocketError, unix_millis,
};
use crate::crypto::{PreSharedKey, ReplayConfig, ReplayGuard, ReplayScope};
use crate::transport::{DatagramSocket, Packet};

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,

    /// Size of the datagram receive buffer.
    pub recv_buffer_size: usize,

    /// Replay defense settings.
    pub replay: ReplayConfig,

    /// Acknowledge every authenticated data packet.
    #[cfg(feature = "extensions")]
    pub acknowledgments: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            replay: ReplayConfig::default(),
            #[cfg(feature = "extensions")]
            acknowledgments: false,
        }
    }
}

impl ReceiverConfig {
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

/// Builder for [`ReceiverConfig`].
#[derive(Debug)]
pub struct ReceiverBuilder {
    config: ReceiverConfig,
}

impl ReceiverBuilder {
    /// Create a new receiver builder.
    pub fn new() -> Self {
        Self {
            config: ReceiverConfig::default(),
        }
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Set the receive buffer size.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.config.recv_buffer_size = size;
        self
    }

    /// Replace the replay defense settings.
    pub fn replay(mut self, replay: ReplayConfig) -> Self {
        self.config.replay = replay;
        self
    }

    /// Set the replay window scope.
    pub fn replay_scope(mut self, scope: ReplayScope) -> Self {
        self.config.replay.scope = scope;
        self
    }

    /// Set the maximum number of tracked sources.
    pub fn max_peers(mut self, max: usize) -> Self {
        self.config.replay.max_peers = max.max(1);
        self
    }

    /// Reject packets older than `age` by the local clock.
    pub fn max_packet_age(mut self, age: Duration) -> Self {
        self.config.replay.max_packet_age = Some(age);
        self
    }

    /// Enable or disable acknowledgments.
    #[cfg(feature = "extensions")]
    pub fn acknowledgments(mut self, enabled: bool) -> Self {
        self.config.acknowledgments = enabled;
        self
    }

    /// Build the receiver configuration.
    pub fn build(self) -> ReceiverConfig {
        self.config
    }

    /// Build the configuration and bind a receiver.
    pub async fn bind(self, key: PreSharedKey) -> Result<SecureReceiver, SocketError> {
        SecureReceiver::bind(self.config, key).await
    }
}

impl Default for ReceiverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An authenticated, replay-checked message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Decrypted application payload.
    pub payload: Vec<u8>,
    /// Sender-assigned sequence number.
    pub sequence: u32,
    /// Sender timestamp (milliseconds since the Unix epoch).
    pub timestamp: u64,
    /// Source address of the datagram.
    pub source: SocketAddr,
}

/// Receiver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    /// Bound, no handler registered yet.
    Created,
    /// Receive loop running.
    Listening,
    /// Stopped; terminal.
    Stopped,
}

struct Inner {
    state: ReceiverState,
    socket: Option<DatagramSocket>,
}

/// Receiving half of the secure datagram transport.
///
/// The handler runs on the receiver's task, one message at a time. It should
/// return quickly; use [`start_channel`](Self::start_channel) to process
/// messages elsewhere.
///
/// # Example
///
/// ```ignore
/// use secure_udp::prelude::*;
///
/// let receiver = ReceiverBuilder::new()
///     .bind_addr("0.0.0.0:9000".parse()?)
///     .bind(PreSharedKey::from_default_env()?)
///     .await?;
///
/// receiver.start(|delivery: Delivery| {
///     println!("{} bytes from {}", delivery.payload.len(), delivery.source);
///     Ok(())
/// })?;
/// ```
pub struct SecureReceiver {
    config: ReceiverConfig,
    key: PreSharedKey,
    inner: Mutex<Inner>,
    /// Receive loop handle. Held by `stop()` until the loop has exited, so
    /// concurrent stops all wait.
    task: AsyncMutex<Option<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: SocketAddr,
}

impl SecureReceiver {
    /// Bind the local endpoint. Bind failures are reported here.
    pub async fn bind(config: ReceiverConfig, key: PreSharedKey) -> Result<Self, SocketError> {
        let socket = DatagramSocket::bind(config.bind_addr)
            .await?
            .with_recv_buffer_size(config.recv_buffer_size);
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, _) = broadcast::channel(1);

        info!(local = %local_addr, "receiver bound");

        Ok(Self {
            config,
            key,
            inner: Mutex::new(Inner {
                state: ReceiverState::Created,
                socket: Some(socket),
            }),
            task: AsyncMutex::new(None),
            shutdown_tx,
            local_addr,
        })
    }

    /// Start the receive loop, invoking `handler` for every accepted message.
    ///
    /// Handler errors and panics are logged and do not stop the loop.
    pub fn start<F>(&self, handler: F) -> Result<(), LifecycleError>
    where
        F: FnMut(Delivery) -> Result<(), BoxError> + Send + 'static,
    {
        let mut inner = self.lock();
        let socket = match inner.state {
            ReceiverState::Created => inner.socket.clone().ok_or(LifecycleError::Stopped)?,
            ReceiverState::Listening => return Err(LifecycleError::AlreadyStarted),
            ReceiverState::Stopped => return Err(LifecycleError::Stopped),
        };
        // Only `stop()` holds this lock, and it marks the state first.
        let mut task = self.task.try_lock().map_err(|_| LifecycleError::Stopped)?;

        let pipeline = Pipeline {
            key: self.key.clone(),
            guard: ReplayGuard::new(self.config.replay.clone()),
            acknowledgments: self.config.acknowledgments_enabled(),
            socket: socket.clone(),
        };

        *task = Some(tokio::spawn(receive_loop(
            pipeline,
            socket,
            handler,
            self.shutdown_tx.subscribe(),
        )));
        inner.state = ReceiverState::Listening;

        info!(
            local = %self.local_addr,
            scope = ?self.config.replay.scope,
            acknowledgments = self.config.acknowledgments_enabled(),
            "receiver listening"
        );
        Ok(())
    }

    /// Start the receive loop, delivering messages through a bounded channel.
    ///
    /// When the channel is full the message is dropped with a warning rather
    /// than stalling the receive loop.
    pub fn start_channel(
        &self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<Delivery>, LifecycleError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        self.start(move |delivery: Delivery| {
            let sequence = delivery.sequence;
            match tx.try_send(delivery) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(sequence, "delivery channel full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(sequence, "delivery channel closed, dropping message");
                }
            }
            Ok(())
        })?;

        Ok(rx)
    }

    /// [`start_channel`](Self::start_channel) with the default capacity.
    pub fn start_default_channel(&self) -> Result<mpsc::Receiver<Delivery>, LifecycleError> {
        self.start_channel(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Stop the receiver.
    ///
    /// Signals the receive loop, waits for it to exit and releases the socket.
    /// Safe to call repeatedly, and before `start`.
    pub async fn stop(&self) {
        let was_active = {
            let mut inner = self.lock();
            let was_active = inner.state != ReceiverState::Stopped;
            inner.state = ReceiverState::Stopped;
            was_active
        };

        let _ = self.shutdown_tx.send(());

        let mut task = self.task.lock().await;
        if let Some(handle) = task.as_mut() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!("receive loop panicked");
                }
            }
            *task = None;
        }

        // Released only after the loop has exited.
        self.lock().socket.take();
        drop(task);

        if was_active {
            info!(local = %self.local_addr, "receiver stopped");
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ReceiverState {
        self.lock().state
    }

    /// Local address the receiver is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the receiver configuration.
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SecureReceiver {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());

        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.state = ReceiverState::Stopped;
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SecureReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureReceiver")
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

/// Per-datagram processing owned by the receive loop.
struct Pipeline {
    key: PreSharedKey,
    guard: ReplayGuard,
    acknowledgments: bool,
    #[cfg_attr(not(feature = "extensions"), allow(dead_code))]
    socket: DatagramSocket,
}

impl Pipeline {
    /// Turn one datagram into a delivery, or the reason it was dropped.
    ///
    /// Replay state is only updated after the packet authenticates, so
    /// forged packets cannot advance or poison a window.
    async fn process(
        &mut self,
        bytes: &[u8],
        source: SocketAddr,
        now_ms: u64,
    ) -> Result<Delivery, ReceiveError> {
        let packet = Packet::decode(bytes)?;
        let sequence = packet.sequence;
        let timestamp = packet.timestamp;
        let nonce = packet.nonce;

        // Without acknowledgments a replayed packet is rejected before paying for
        // decryption. With them it must authenticate first so it can be re-acked.
        let precheck = self.guard.check(source, sequence, timestamp, now_ms);
        if !self.acknowledgments {
            precheck.clone()?;
        }

        let payload = packet.open(&self.key)?;

        if self.acknowledgments {
            self.acknowledge(sequence, &nonce, source).await;
        }
        precheck?;

        self.guard
            .check_and_update(source, sequence, timestamp, now_ms)?;

        Ok(Delivery {
            payload,
            sequence,
            timestamp,
            source,
        })
    }

    #[cfg(feature = "extensions")]
    async fn acknowledge(&self, sequence: u32, nonce: &[u8; NONCE_SIZE], source: SocketAddr) {
        let ack = match crate::extensions::seal_ack(&self.key, sequence, nonce, unix_millis()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(sequence, error = %e, "failed to seal acknowledgment");
                return;
            }
        };
        match self.socket.send_to(&ack, source).await {
            Ok(_) => trace!(sequence, %source, "acknowledgment sent"),
            Err(e) => debug!(sequence, %source, error = %e, "acknowledgment send failed"),
        }
    }

    #[cfg(not(feature = "extensions"))]
    async fn acknowledge(
        &self,
        _sequence: u32,
        _nonce: &[u8; NONCE_SIZE],
        _source: SocketAddr,
    ) {
    }
}

fn invoke<F>(handler: &mut F, delivery: Delivery)
where
    F: FnMut(Delivery) -> Result<(), BoxError>,
{
    let sequence = delivery.sequence;
    match catch_unwind(AssertUnwindSafe(|| handler(delivery))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(sequence, error = %e, "message handler failed"),
        Err(_) => warn!(sequence, "message handler panicked"),
    }
}

async fn receive_loop<F>(
    mut pipeline: Pipeline,
    socket: DatagramSocket,
    mut handler: F,
    mut shutdown_rx: broadcast::Receiver<()>,
) where
    F: FnMut(Delivery) -> Result<(), BoxError> + Send + 'static,
{
    let mut buf = socket.recv_buffer();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, source)) => {
                        match pipeline.process(&buf[..len], source, unix_millis()).await {
                            Ok(delivery) => {
                                trace!(sequence = delivery.sequence, %source, "message accepted");
                                invoke(&mut handler, delivery);
                            }
                            Err(e) => debug!(
                                %source,
                                len,
                                security = e.is_security_error(),
                                error = %e,
                                "dropping datagram"
                            ),
                        }
                    }
                    Err(e) => warn!(error = %e, "receive failed"),
                }
            }
        }
    }

    debug!("receive loop exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CryptoError, KEY_SIZE, PacketError, ReplayError};

    fn key() -> PreSharedKey {
        PreSharedKey::from_bytes([0x42; KEY_SIZE])
    }

    fn source(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    async fn pipeline(acknowledgments: bool) -> Pipeline {
        let socket = DatagramSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        Pipeline {
            key: key(),
            guard: ReplayGuard::new(ReplayConfig::default()),
            acknowledgments,
            socket,
        }
    }

    fn sealed(sequence: u32, timestamp: u64, payload: &[u8]) -> Vec<u8> {
        Packet::seal(&key(), sequence, timestamp, payload)
            .unwrap()
            .encode()
    }

    #[test]
    fn test_builder() {
        let config = ReceiverBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .recv_buffer_size(2048)
            .replay_scope(ReplayScope::Shared)
            .max_peers(0)
            .max_packet_age(Duration::from_secs(30))
            .build();

        assert_eq!(config.recv_buffer_size, 2048);
        assert_eq!(config.replay.scope, ReplayScope::Shared);
        assert_eq!(config.replay.max_peers, 1);
        assert_eq!(config.replay.max_packet_age, Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_process_accepts_then_rejects_replay() {
        let mut pipeline = pipeline(false).await;
        let bytes = sealed(1, 1_000, b"ping");

        let delivery = pipeline.process(&bytes, source(5000), 1_000).await.unwrap();
        assert_eq!(delivery.payload, b"ping");
        assert_eq!(delivery.sequence, 1);
        assert_eq!(delivery.timestamp, 1_000);
        assert_eq!(delivery.source, source(5000));

        assert!(matches!(
            pipeline.process(&bytes, source(5000), 1_000).await,
            Err(ReceiveError::Replay(ReplayError::Duplicate { sequence: 1 }))
        ));
    }

    #[tokio::test]
    async fn test_process_drops_short_and_forged() {
        let mut pipeline = pipeline(false).await;

        assert!(matches!(
            pipeline.process(&[0u8; 39], source(5000), 0).await,
            Err(ReceiveError::Malformed(PacketError::TooShort { actual: 39, .. }))
        ));

        let mut bytes = sealed(2, 1_000, b"ping");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert!(matches!(
            pipeline.process(&bytes, source(5000), 1_000).await,
            Err(ReceiveError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[tokio::test]
    async fn test_forged_packet_does_not_advance_window() {
        let mut pipeline = pipeline(false).await;

        let mut forged = sealed(5000, 1_000, b"x");
        forged[12] ^= 0x01;
        assert!(pipeline.process(&forged, source(5000), 1_000).await.is_err());

        // A genuine low sequence is still accepted.
        let genuine = sealed(1, 1_000, b"y");
        assert!(pipeline.process(&genuine, source(5000), 1_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_from_another_address_is_rejected() {
        let mut pipeline = pipeline(false).await;
        let bytes = sealed(9, 1_000, b"ping");

        assert!(pipeline.process(&bytes, source(5000), 1_000).await.is_ok());
        assert!(matches!(
            pipeline.process(&bytes, source(5001), 1_000).await,
            Err(ReceiveError::Replay(ReplayError::Duplicate { sequence: 9 }))
        ));
    }

    #[tokio::test]
    async fn test_per_source_scope_is_opt_in() {
        let mut pipeline = pipeline(false).await;
        pipeline.guard = ReplayGuard::new(ReplayConfig {
            scope: ReplayScope::PerSource,
            ..ReplayConfig::default()
        });
        let bytes = sealed(9, 1_000, b"ping");

        assert!(pipeline.process(&bytes, source(5000), 1_000).await.is_ok());
        assert!(pipeline.process(&bytes, source(5001), 1_000).await.is_ok());
        assert!(pipeline.process(&bytes, source(5000), 1_000).await.is_err());
    }

    #[cfg(feature = "extensions")]
    #[tokio::test]
    async fn test_acknowledgment_names_packet_nonce() {
        let mut pipeline = pipeline(true).await;
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from = peer.local_addr().unwrap();

        let packet = Packet::seal(&key(), 4, 1_000, b"ping").unwrap();
        pipeline
            .process(&packet.encode(), from, 1_000)
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let ack = crate::extensions::open_ack(&key(), &buf[..len]).unwrap();
        assert_eq!(ack.sequence, 4);
        assert_eq!(ack.nonce, packet.nonce);
    }

    #[tokio::test]
    async fn test_replay_rejected_with_acknowledgments() {
        let mut pipeline = pipeline(true).await;
        let bytes = sealed(3, 1_000, b"ping");

        assert!(pipeline.process(&bytes, source(5000), 1_000).await.is_ok());
        assert!(matches!(
            pipeline.process(&bytes, source(5000), 1_000).await,
            Err(ReceiveError::Replay(ReplayError::Duplicate { sequence: 3 }))
        ));
    }

    #[test]
    fn test_invoke_survives_handler_failure() {
        let delivery = Delivery {
            payload: vec![1],
            sequence: 1,
            timestamp: 0,
            source: source(1),
        };

        let mut calls = 0;
        let mut failing = |_: Delivery| -> Result<(), BoxError> {
            calls += 1;
            Err("boom".into())
        };
        invoke(&mut failing, delivery.clone());
        invoke(&mut failing, delivery.clone());
        assert_eq!(calls, 2);

        let mut panicking = |_: Delivery| -> Result<(), BoxError> { panic!("handler bug") };
        invoke(&mut panicking, delivery);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let receiver = ReceiverBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind(key())
            .await
            .unwrap();
        assert_eq!(receiver.state(), ReceiverState::Created);
        assert_ne!(receiver.local_addr().port(), 0);

        receiver.start(|_| Ok(())).unwrap();
        assert_eq!(receiver.state(), ReceiverState::Listening);
        assert_eq!(
            receiver.start(|_| Ok(())),
            Err(LifecycleError::AlreadyStarted)
        );

        receiver.stop().await;
        receiver.stop().await;
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert_eq!(receiver.start(|_| Ok(())), Err(LifecycleError::Stopped));
    }

    #[tokio::test]
    async fn test_default_channel_delivers() {
        let receiver = ReceiverBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind(key())
            .await
            .unwrap();
        let mut messages = receiver.start_default_channel().unwrap();
        assert_eq!(receiver.state(), ReceiverState::Listening);
        assert_eq!(messages.max_capacity(), DEFAULT_CHANNEL_CAPACITY);
        assert!(matches!(
            receiver.start_default_channel(),
            Err(LifecycleError::AlreadyStarted)
        ));

        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(&sealed(1, unix_millis(), b"hi"), receiver.local_addr())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"hi");
        assert_eq!(delivery.source, peer.local_addr().unwrap());

        receiver.stop().await;
    }

    /// Stop, then report whether the socket was closed (every clone held by
    /// the receive loop included) by the time this caller's `stop()` returned.
    async fn stop_and_check(receiver: &SecureReceiver) -> bool {
        receiver.stop().await;
        std::net::UdpSocket::bind(receiver.local_addr()).is_ok()
    }

    #[tokio::test]
    async fn test_concurrent_stops_both_wait_for_loop() {
        let receiver = ReceiverBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind(key())
            .await
            .unwrap();
        receiver.start(|_| Ok(())).unwrap();

        let (first, second) =
            tokio::join!(stop_and_check(&receiver), stop_and_check(&receiver));

        assert!(first, "socket still open after first stop returned");
        assert!(second, "socket still open after second stop returned");
        assert_eq!(receiver.state(), ReceiverState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let receiver = ReceiverBuilder::new()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bind(key())
            .await
            .unwrap();

        receiver.stop().await;
        assert_eq!(receiver.state(), ReceiverState::Stopped);
        assert!(receiver.start_channel(4).is_err());
    }
}
