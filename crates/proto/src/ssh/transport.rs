//! SSH transport layer (RFC 4253).
//!
//! A [`Transport`] owns one connection. After the version exchange it splits
//! the stream into a packet reader, driven by a background dispatch task, and
//! a packet writer shared behind a mutex.
//!
//! # Transport Lifecycle
//!
//! 1. **Version exchange** - identification lines in both directions
//! 2. **KEXINIT** - both sides propose algorithms
//! 3. **Key exchange** - a [`KexStrategy`] runs to completion
//! 4. **NEWKEYS** - each direction switches keys on its own NEWKEYS
//! 5. **Established** - authentication and channel traffic flow
//!
//! Steps 2-4 repeat for every rekey, started explicitly with
//! [`Transport::rekey`], by either side's byte or packet counters, or by the
//! peer. From the moment our KEXINIT is sent until our NEWKEYS is sent only
//! key exchange and generic transport messages leave this side; other senders
//! wait. Messages produced by the dispatch task itself are queued instead and
//! flushed right after the new keys are installed.
//!
//! # Message Routing
//!
//! | Numbers | Owner |
//! |---------|-------|
//! | 1-4     | handled here (disconnect, ignore, unimplemented, debug) |
//! | 5-6     | service request handled here, accept forwarded to auth |
//! | 20-49   | key exchange |
//! | 50-79   | authentication mailbox ([`Transport::recv_auth`]) |
//! | 80-127  | the registered [`ConnectionSink`] |
//!
//! Anything else is answered with SSH_MSG_UNIMPLEMENTED.
//!
//! # Errors
//!
//! Framing, integrity, protocol and trust failures close the transport. The
//! peer is sent a DISCONNECT when possible and every waiter is woken with
//! [`ConchError::TransportClosed`] (or [`ConchError::Disconnected`] when the
//! peer hung up with a reason).

use crate::ssh::hostkey::{
    fingerprint, key_type, key_type_for_algorithm, signature_algorithm, verify_host_signature,
    HostKey, HostKeyVerifier,
};
use crate::ssh::kex::{
    guess_was_correct, negotiate, new_keys_message, AlgorithmPreferences, ConnectionIdentity,
    KexInit, NegotiatedAlgorithms,
};
use crate::ssh::kex_dh::{
    GexRequest, KexMethod, KexProgress, KexResult, KexStrategy, ModulusPool, Role, SessionKeys,
};
use crate::ssh::message::{describe, disconnect, MessageCategory, MessageType};
use crate::ssh::packet::{
    CipherState, PacketReader, PacketWriter, RekeyLimits, DEFAULT_MAX_PACKET_LEN,
};
use crate::ssh::version::{read_identification, write_identification, Version};
use crate::ssh::wire::{message, SshBufMut, WireReader};
use async_trait::async_trait;
use bytes::BufMut;
use conch_platform::{CipherDirection, ConchError, ConchResult, CryptoBackend};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Read half of the connection after the version exchange.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of the connection after the version exchange.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport layer configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Our identification line.
    pub version: Version,
    /// Algorithm preferences, most preferred first.
    pub algorithms: AlgorithmPreferences,
    /// Largest accepted `packet_length` (default: 256 KiB).
    pub max_packet_size: usize,
    /// Counters that trigger an automatic rekey (default: 1 GiB / 2^31 packets).
    pub rekey_limits: RekeyLimits,
    /// How long to wait for the peer's identification line.
    pub banner_timeout: Duration,
    /// How long one key exchange round may take.
    pub kex_timeout: Duration,
    /// Group size range requested by a group-exchange client.
    pub gex_request: GexRequest,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            version: Version::default_conch(),
            algorithms: AlgorithmPreferences::default(),
            max_packet_size: DEFAULT_MAX_PACKET_LEN,
            rekey_limits: RekeyLimits::default(),
            banner_timeout: Duration::from_secs(30),
            kex_timeout: Duration::from_secs(60),
            gex_request: GexRequest::default(),
        }
    }
}

/// Receiver of connection protocol messages (80-127).
///
/// Called from the dispatch task, so implementations must not wait on
/// anything that only the dispatch task can deliver. Replies go through
/// [`Transport::post`].
#[async_trait]
pub trait ConnectionSink: Send + Sync {
    /// Handles one connection protocol message (type byte included).
    async fn handle_message(&self, payload: Vec<u8>) -> ConchResult<()>;

    /// The transport has closed; wake every waiter.
    fn transport_closed(&self, reason: &str);
}

/// Rebuilds a close error for each waiter.
fn replay(err: &ConchError) -> ConchError {
    match err {
        ConchError::Config(m) => ConchError::Config(m.clone()),
        ConchError::Framing(m) => ConchError::Framing(m.clone()),
        ConchError::Integrity(m) => ConchError::Integrity(m.clone()),
        ConchError::Protocol(m) => ConchError::Protocol(m.clone()),
        ConchError::Trust(m) => ConchError::Trust(m.clone()),
        ConchError::Security(m) => ConchError::Security(m.clone()),
        ConchError::Timeout(m) => ConchError::Timeout(m.clone()),
        ConchError::TransportClosed(m) => ConchError::TransportClosed(m.clone()),
        ConchError::Disconnected {
            reason,
            description,
        } => ConchError::Disconnected {
            reason: *reason,
            description: description.clone(),
        },
        other => ConchError::TransportClosed(other.to_string()),
    }
}

/// Outbound half plus the kex gate, guarded by one lock.
struct Outbound {
    writer: PacketWriter<BoxedWriter>,
    /// Our KEXINIT for the round in progress
    local_kexinit: Option<Vec<u8>>,
    /// Messages posted by the dispatch task while the gate was closed
    deferred: Vec<Vec<u8>>,
}

#[derive(Debug, Default)]
struct SessionInfo {
    session_id: Option<Vec<u8>>,
    exchange_hash: Option<Vec<u8>>,
    negotiated: Option<NegotiatedAlgorithms>,
    server_host_key: Option<Vec<u8>>,
    /// our NEWKEYS is out, the peer's has not arrived yet
    awaiting_newkeys: bool,
}

struct Shared {
    role: Role,
    config: TransportConfig,
    backend: Arc<dyn CryptoBackend>,
    local_version: Version,
    remote_version: Version,
    verifier: Option<Arc<dyn HostKeyVerifier>>,
    host_keys: Vec<Arc<dyn HostKey>>,
    modulus_pool: Arc<ModulusPool>,
    outbound: Mutex<Outbound>,
    /// true while non-kex output is held back
    gate: watch::Sender<bool>,
    /// completed key exchange rounds
    rounds: watch::Sender<u64>,
    closed: watch::Sender<Option<ConchError>>,
    session: StdMutex<SessionInfo>,
    auth_rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// user authentication finished; later auth messages are dropped
    authenticated: AtomicBool,
    sink: OnceCell<Weak<dyn ConnectionSink>>,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn closed_error(&self) -> ConchError {
        match self.closed.borrow().as_ref() {
            Some(err) => replay(err),
            None => ConchError::TransportClosed("Transport closed".to_string()),
        }
    }

    fn check_open(&self) -> ConchResult<()> {
        if self.closed.borrow().is_some() {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn session_established(&self) -> bool {
        lock(&self.session).session_id.is_some()
    }

    /// Records the first close reason and wakes everyone.
    fn mark_closed(&self, reason: ConchError) {
        let description = reason.to_string();
        let first = self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        if first {
            if let Some(sink) = self.sink.get().and_then(Weak::upgrade) {
                sink.transport_closed(&description);
            }
        }
    }

    async fn write_locked(&self, out: &mut Outbound, payload: &[u8]) -> ConchResult<()> {
        trace!("Sending {}", describe(payload.first().copied().unwrap_or(0)));
        if let Err(e) = out.writer.write_packet(payload).await {
            self.mark_closed(ConchError::TransportClosed(format!("Write failed: {}", e)));
            return Err(e);
        }
        Ok(())
    }

    /// Sends our KEXINIT unless one is already out for this round.
    async fn send_kexinit_locked(&self, out: &mut Outbound) -> ConchResult<Vec<u8>> {
        if let Some(existing) = &out.local_kexinit {
            return Ok(existing.clone());
        }
        let mut cookie = [0u8; 16];
        self.backend.fill_random(&mut cookie);
        let payload = KexInit::from_preferences(&self.config.algorithms, cookie).to_bytes();

        out.local_kexinit = Some(payload.clone());
        self.gate.send_replace(true);
        self.write_locked(out, &payload).await?;
        debug!("Sent KEXINIT");
        Ok(payload)
    }

    async fn ensure_kexinit(&self) -> ConchResult<Vec<u8>> {
        let mut out = self.outbound.lock().await;
        self.send_kexinit_locked(&mut out).await
    }

    fn needs_rekey(&self, state: &CipherState) -> bool {
        state.exceeds(&self.config.rekey_limits) && self.session_established()
    }
}

/// Handle to an established SSH transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("role", &self.shared.role)
            .field("remote_version", &self.shared.remote_version.as_str())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Runs the client side of the handshake over `stream`.
    ///
    /// Returns once the first key exchange has completed and the server's
    /// host key has been verified and accepted by `verifier`.
    pub async fn client<S>(
        stream: S,
        config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
        backend: Arc<dyn CryptoBackend>,
    ) -> ConchResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(
            stream,
            config,
            Role::Client,
            Some(verifier),
            Vec::new(),
            Arc::new(ModulusPool::new()),
            backend,
        )
        .await
    }

    /// Runs the server side of the handshake over `stream`.
    pub async fn server<S>(
        stream: S,
        mut config: TransportConfig,
        host_keys: Vec<Arc<dyn HostKey>>,
        modulus_pool: Arc<ModulusPool>,
        backend: Arc<dyn CryptoBackend>,
    ) -> ConchResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if host_keys.is_empty() {
            return Err(ConchError::Config("Server needs at least one host key".to_string()));
        }
        // Offer only algorithms we hold a key for, in preference order
        let mut offered: Vec<String> = config
            .algorithms
            .host_key
            .iter()
            .filter(|name| host_keys.iter().any(|k| k.algorithm() == name.as_str()))
            .cloned()
            .collect();
        if offered.is_empty() {
            offered = host_keys.iter().map(|k| k.algorithm().to_string()).collect();
        }
        config.algorithms.host_key = offered;

        Self::establish(
            stream,
            config,
            Role::Server,
            None,
            host_keys,
            modulus_pool,
            backend,
        )
        .await
    }

    async fn establish<S>(
        stream: S,
        config: TransportConfig,
        role: Role,
        verifier: Option<Arc<dyn HostKeyVerifier>>,
        host_keys: Vec<Arc<dyn HostKey>>,
        modulus_pool: Arc<ModulusPool>,
        backend: Arc<dyn CryptoBackend>,
    ) -> ConchResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.algorithms.validate()?;
        let (mut read_half, mut write_half) = tokio::io::split(stream);

        // 1. Version exchange
        write_identification(&mut write_half, &config.version).await?;
        let remote_version = tokio::time::timeout(
            config.banner_timeout,
            read_identification(&mut read_half, role == Role::Client),
        )
        .await
        .map_err(|_| ConchError::Timeout("Timed out waiting for identification".to_string()))??;
        info!(
            "Connected to {} ({:?} role)",
            remote_version.as_str(),
            role
        );

        // 2. Packet layer
        let reader = PacketReader::new(
            Box::new(read_half) as BoxedReader,
            backend.clone(),
            config.max_packet_size,
        );
        let writer = PacketWriter::new(
            Box::new(write_half) as BoxedWriter,
            backend.clone(),
            config.max_packet_size,
        );

        let (auth_tx, auth_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            role,
            local_version: config.version.clone(),
            config,
            backend,
            remote_version,
            verifier,
            host_keys,
            modulus_pool,
            outbound: Mutex::new(Outbound {
                writer,
                local_kexinit: None,
                deferred: Vec::new(),
            }),
            gate: watch::channel(false).0,
            rounds: watch::channel(0).0,
            closed: watch::channel(None).0,
            session: StdMutex::new(SessionInfo::default()),
            auth_rx: Mutex::new(auth_rx),
            authenticated: AtomicBool::new(false),
            sink: OnceCell::new(),
            reader_task: StdMutex::new(None),
        });

        // 3. Dispatch task
        let dispatcher = Dispatcher {
            shared: shared.clone(),
            reader,
            auth_tx,
            remote_kexinit: None,
            strategy: None,
            round: None,
            pending_inbound: None,
            skip_guess: false,
        };
        let handle = tokio::spawn(dispatcher.run());
        *lock(&shared.reader_task) = Some(handle);

        // 4. Initial key exchange
        let transport = Self { shared };
        let handshake = async {
            transport.shared.ensure_kexinit().await?;
            transport.wait_for_round(1).await
        };
        if let Err(e) = handshake.await {
            transport.abort();
            return Err(e);
        }
        Ok(transport)
    }

    async fn wait_for_round(&self, target: u64) -> ConchResult<()> {
        let mut rounds = self.shared.rounds.subscribe();
        let mut closed = self.shared.closed.subscribe();
        let wait = async {
            tokio::select! {
                _ = rounds.wait_for(|n| *n >= target) => Ok(()),
                _ = closed.wait_for(|c| c.is_some()) => Err(self.shared.closed_error()),
            }
        };
        tokio::time::timeout(self.shared.config.kex_timeout, wait)
            .await
            .map_err(|_| ConchError::Timeout("Key exchange timed out".to_string()))?
    }

    /// Sends one message, waiting while a key exchange holds output back.
    pub async fn send(&self, payload: &[u8]) -> ConchResult<()> {
        loop {
            self.shared.check_open()?;
            let mut gate = self.shared.gate.subscribe();
            {
                let mut out = self.shared.outbound.lock().await;
                if out.local_kexinit.is_none() {
                    self.shared.write_locked(&mut out, payload).await?;
                    if self.shared.needs_rekey(out.writer.state()) {
                        info!("Outbound rekey threshold reached");
                        self.shared.send_kexinit_locked(&mut out).await?;
                    }
                    return Ok(());
                }
            }
            let mut closed = self.shared.closed.subscribe();
            tokio::select! {
                _ = gate.wait_for(|active| !*active) => {}
                _ = closed.wait_for(|c| c.is_some()) => {}
            }
        }
    }

    /// Sends a message without waiting for a key exchange to finish.
    ///
    /// While the gate is closed the message is queued and goes out right
    /// after our NEWKEYS. Meant for replies produced by a [`ConnectionSink`].
    pub async fn post(&self, payload: Vec<u8>) -> ConchResult<()> {
        self.shared.check_open()?;
        let mut out = self.shared.outbound.lock().await;
        if out.local_kexinit.is_some() {
            out.deferred.push(payload);
            return Ok(());
        }
        self.shared.write_locked(&mut out, &payload).await
    }

    /// Sends a message that is legal during key exchange (types 1-4, 20-49).
    async fn send_unchecked(&self, payload: &[u8]) -> ConchResult<()> {
        self.shared.check_open()?;
        let mut out = self.shared.outbound.lock().await;
        self.shared.write_locked(&mut out, payload).await
    }

    /// Runs a new key exchange round and waits for it to complete.
    ///
    /// The session identifier is unchanged afterwards; the exchange hash is new.
    pub async fn rekey(&self) -> ConchResult<()> {
        self.shared.check_open()?;
        info!("Starting rekey");
        let target = {
            let mut out = self.shared.outbound.lock().await;
            // A round whose inbound NEWKEYS is still pending completes before ours
            let target = {
                let session = lock(&self.shared.session);
                *self.shared.rounds.borrow() + 1 + u64::from(session.awaiting_newkeys)
            };
            self.shared.send_kexinit_locked(&mut out).await?;
            target
        };
        self.wait_for_round(target).await
    }

    /// Sends SSH_MSG_IGNORE (keep-alive).
    pub async fn send_ignore(&self, data: &[u8]) -> ConchResult<()> {
        let mut msg = message(MessageType::Ignore as u8);
        msg.put_ssh_string(data);
        self.send_unchecked(&msg).await
    }

    /// Sends SSH_MSG_DEBUG.
    pub async fn send_debug(&self, always_display: bool, text: &str) -> ConchResult<()> {
        let mut msg = message(MessageType::Debug as u8);
        msg.put_ssh_bool(always_display);
        msg.put_ssh_string(text.as_bytes());
        msg.put_ssh_string(b"");
        self.send_unchecked(&msg).await
    }

    /// Asks for a service (client side) and waits for SERVICE_ACCEPT.
    pub async fn request_service(&self, name: &str, wait: Duration) -> ConchResult<()> {
        let mut msg = message(MessageType::ServiceRequest as u8);
        msg.put_ssh_string(name.as_bytes());
        self.send(&msg).await?;

        let reply = self.recv_auth(wait).await?;
        let mut r = WireReader::new(&reply);
        if r.read_u8()? != MessageType::ServiceAccept as u8 {
            return Err(ConchError::Protocol(format!(
                "Expected SERVICE_ACCEPT, got {}",
                describe(reply[0])
            )));
        }
        let accepted = r.read_utf8()?;
        if accepted != name {
            return Err(ConchError::Protocol(format!(
                "Server accepted service '{}' instead of '{}'",
                accepted, name
            )));
        }
        debug!("Service {} accepted", name);
        Ok(())
    }

    /// Next authentication-layer message (types 6 and 50-79).
    pub async fn recv_auth(&self, wait: Duration) -> ConchResult<Vec<u8>> {
        if self.is_authenticated() {
            return Err(ConchError::Protocol(
                "User authentication has already completed".to_string(),
            ));
        }
        let mut rx = self.shared.auth_rx.lock().await;
        let mut closed = self.shared.closed.subscribe();
        let recv = async {
            tokio::select! {
                biased;
                msg = rx.recv() => msg.ok_or_else(|| self.shared.closed_error()),
                _ = closed.wait_for(|c| c.is_some()) => Err(self.shared.closed_error()),
            }
        };
        tokio::time::timeout(wait, recv).await.map_err(|_| {
            ConchError::Timeout("Timed out waiting for an authentication message".to_string())
        })?
    }

    /// Ends the authentication phase.
    ///
    /// The auth mailbox is closed and emptied; authentication messages that
    /// arrive afterwards are dropped by the dispatch task (RFC 4252 Section 5.1).
    pub fn set_authenticated(&self) {
        if self.shared.authenticated.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut rx) = self.shared.auth_rx.try_lock() {
            rx.close();
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("Dropped {} queued authentication messages", dropped);
            }
        }
    }

    /// Whether [`set_authenticated`](Self::set_authenticated) has been called.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::Acquire)
    }

    /// Registers the receiver of connection protocol messages. Only the first call wins.
    pub fn set_connection_sink(&self, sink: Weak<dyn ConnectionSink>) -> bool {
        self.shared.sink.set(sink).is_ok()
    }

    /// Sends DISCONNECT and closes the transport.
    pub async fn disconnect(&self, reason: u32, description: &str) -> ConchResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut msg = message(MessageType::Disconnect as u8);
        msg.put_u32(reason);
        msg.put_ssh_string(description.as_bytes());
        msg.put_ssh_string(b"");
        let result = self.send_unchecked(&msg).await;
        info!("Disconnecting: {} ({})", description, reason);

        self.shared
            .mark_closed(ConchError::TransportClosed(format!("Disconnected: {}", description)));
        self.abort();
        let mut out = self.shared.outbound.lock().await;
        let _ = out.writer.shutdown().await;
        result
    }

    fn abort(&self) {
        if let Some(handle) = lock(&self.shared.reader_task).take() {
            handle.abort();
        }
        self.shared
            .mark_closed(ConchError::TransportClosed("Transport aborted".to_string()));
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Cryptographic backend in use.
    pub fn backend(&self) -> &Arc<dyn CryptoBackend> {
        &self.shared.backend
    }

    /// Our identification line.
    pub fn local_version(&self) -> &Version {
        &self.shared.local_version
    }

    /// The peer's identification line.
    pub fn remote_version(&self) -> &Version {
        &self.shared.remote_version
    }

    /// H of the first key exchange. Never changes once set.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.shared.session).session_id.clone()
    }

    /// H of the most recent key exchange.
    pub fn exchange_hash(&self) -> Option<Vec<u8>> {
        lock(&self.shared.session).exchange_hash.clone()
    }

    /// Algorithms of the most recently completed round.
    pub fn negotiated(&self) -> Option<NegotiatedAlgorithms> {
        lock(&self.shared.session).negotiated.clone()
    }

    /// Server host key blob from the last exchange.
    pub fn server_host_key(&self) -> Option<Vec<u8>> {
        lock(&self.shared.session).server_host_key.clone()
    }

    /// Number of completed key exchange rounds.
    pub fn kex_rounds(&self) -> u64 {
        *self.shared.rounds.borrow()
    }

    /// Whether the transport has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.borrow().is_some()
    }

    /// Resolves once the transport has shut down.
    pub async fn closed(&self) {
        let mut closed = self.shared.closed.subscribe();
        let _ = closed.wait_for(|c| c.is_some()).await;
    }

    /// Error describing why the transport closed.
    pub fn closed_error(&self) -> ConchError {
        self.shared.closed_error()
    }
}

/// Whether a message may arrive between the peer's KEXINIT and its NEWKEYS.
fn allowed_during_kex(msg_type: u8) -> bool {
    matches!(msg_type, 1..=4 | 20..=49)
}

fn disconnect_code(err: &ConchError) -> Option<u32> {
    match err {
        ConchError::Framing(_) | ConchError::Protocol(_) => Some(disconnect::PROTOCOL_ERROR),
        ConchError::Integrity(_) => Some(disconnect::MAC_ERROR),
        ConchError::Trust(_) => Some(disconnect::HOST_KEY_NOT_VERIFIABLE),
        ConchError::Security(_) | ConchError::Config(_) => Some(disconnect::KEY_EXCHANGE_FAILED),
        _ => None,
    }
}

/// Background task owning the inbound half.
struct Dispatcher {
    shared: Arc<Shared>,
    reader: PacketReader<BoxedReader>,
    auth_tx: mpsc::UnboundedSender<Vec<u8>>,
    /// Peer KEXINIT of the round in progress
    remote_kexinit: Option<Vec<u8>>,
    strategy: Option<KexStrategy>,
    round: Option<NegotiatedAlgorithms>,
    pending_inbound: Option<CipherState>,
    skip_guess: bool,
}

impl Dispatcher {
    async fn run(mut self) {
        let err = loop {
            let payload = match self.reader.read_packet().await {
                Ok(payload) => payload,
                Err(e) => break e,
            };
            if let Err(e) = self.dispatch(payload).await {
                break e;
            }
            if let Err(e) = self.check_rekey().await {
                break e;
            }
        };
        self.shutdown(err).await;
    }

    async fn shutdown(&mut self, err: ConchError) {
        match &err {
            ConchError::Disconnected {
                reason,
                description,
            } => info!("Peer disconnected: {} ({})", description, reason),
            ConchError::TransportClosed(msg) => debug!("Transport closed: {}", msg),
            other => {
                error!("Transport failed: {}", other);
                if let Some(code) = disconnect_code(other) {
                    let mut msg = message(MessageType::Disconnect as u8);
                    msg.put_u32(code);
                    msg.put_ssh_string(other.to_string().as_bytes());
                    msg.put_ssh_string(b"");
                    let send = async {
                        let mut out = self.shared.outbound.lock().await;
                        let _ = out.writer.write_packet(&msg).await;
                    };
                    let _ = tokio::time::timeout(Duration::from_secs(1), send).await;
                }
            }
        }
        self.shared.mark_closed(err);
    }

    fn transport(&self) -> Transport {
        Transport {
            shared: self.shared.clone(),
        }
    }

    async fn dispatch(&mut self, payload: Vec<u8>) -> ConchResult<()> {
        let msg_type = *payload
            .first()
            .ok_or_else(|| ConchError::Protocol("Empty message".to_string()))?;
        trace!("Received {}", describe(msg_type));

        if self.remote_kexinit.is_some() && !allowed_during_kex(msg_type) {
            return Err(ConchError::Protocol(format!(
                "{} received during key exchange",
                describe(msg_type)
            )));
        }

        match MessageCategory::of(msg_type) {
            MessageCategory::TransportGeneric => self.on_generic(msg_type, &payload),
            MessageCategory::Service => self.on_service(msg_type, payload).await,
            MessageCategory::KeyExchange => self.on_kex(msg_type, payload).await,
            MessageCategory::Authentication => {
                if self.shared.authenticated.load(Ordering::Acquire) {
                    debug!("Ignoring {} after authentication", describe(msg_type));
                    return Ok(());
                }
                // Nobody listening is fine: the session may not authenticate yet
                let _ = self.auth_tx.send(payload);
                Ok(())
            }
            MessageCategory::Connection if MessageType::from_u8(msg_type).is_some() => {
                match self.shared.sink.get().and_then(Weak::upgrade) {
                    Some(sink) => sink.handle_message(payload).await,
                    None => self.reply_unimplemented().await,
                }
            }
            _ => self.reply_unimplemented().await,
        }
    }

    async fn reply_unimplemented(&mut self) -> ConchResult<()> {
        let sequence = self.reader.state().sequence().wrapping_sub(1);
        debug!("Replying UNIMPLEMENTED for packet {}", sequence);
        let mut msg = message(MessageType::Unimplemented as u8);
        msg.put_u32(sequence);
        self.transport().send_unchecked(&msg).await
    }

    fn on_generic(&self, msg_type: u8, payload: &[u8]) -> ConchResult<()> {
        let mut r = WireReader::new(&payload[1..]);
        match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => Err(ConchError::Disconnected {
                reason: r.read_u32()?,
                description: r.read_utf8()?,
            }),
            Some(MessageType::Ignore) => {
                trace!("Ignoring SSH_MSG_IGNORE");
                Ok(())
            }
            Some(MessageType::Unimplemented) => {
                warn!("Peer did not implement packet {}", r.read_u32()?);
                Ok(())
            }
            Some(MessageType::Debug) => {
                let always_display = r.read_bool()?;
                let text = r.read_utf8()?;
                if always_display {
                    info!("Peer debug message: {}", text);
                } else {
                    debug!("Peer debug message: {}", text);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn on_service(&mut self, msg_type: u8, payload: Vec<u8>) -> ConchResult<()> {
        match (self.shared.role, MessageType::from_u8(msg_type)) {
            (Role::Server, Some(MessageType::ServiceRequest)) => {
                let name = WireReader::new(&payload[1..]).read_utf8()?;
                if name != "ssh-userauth" {
                    warn!("Refusing service {}", name);
                    let mut msg = message(MessageType::Disconnect as u8);
                    msg.put_u32(disconnect::SERVICE_NOT_AVAILABLE);
                    msg.put_ssh_string(b"Service not available");
                    msg.put_ssh_string(b"");
                    self.transport().send_unchecked(&msg).await?;
                    return Err(ConchError::TransportClosed(format!(
                        "Service '{}' not available",
                        name
                    )));
                }
                let mut msg = message(MessageType::ServiceAccept as u8);
                msg.put_ssh_string(name.as_bytes());
                self.transport().post(msg.to_vec()).await
            }
            (Role::Client, Some(MessageType::ServiceAccept)) => {
                let _ = self.auth_tx.send(payload);
                Ok(())
            }
            _ => Err(ConchError::Protocol(format!(
                "Unexpected {}",
                describe(msg_type)
            ))),
        }
    }

    async fn on_kex(&mut self, msg_type: u8, payload: Vec<u8>) -> ConchResult<()> {
        match msg_type {
            20 => self.on_kexinit(payload).await,
            21 => self.on_newkeys(),
            _ => {
                if self.skip_guess {
                    self.skip_guess = false;
                    debug!("Discarding wrongly guessed {}", describe(msg_type));
                    return Ok(());
                }
                let strategy = self.strategy.as_mut().ok_or_else(|| {
                    ConchError::Protocol(format!(
                        "{} outside of a key exchange",
                        describe(msg_type)
                    ))
                })?;
                match strategy.deliver(msg_type, &payload[1..])? {
                    KexProgress::NeedMore(Some(next)) => self.transport().send_unchecked(&next).await,
                    KexProgress::NeedMore(None) => Ok(()),
                    KexProgress::Done { reply, result } => self.finish_exchange(reply, result).await,
                }
            }
        }
    }

    async fn on_kexinit(&mut self, payload: Vec<u8>) -> ConchResult<()> {
        if self.remote_kexinit.is_some() {
            return Err(ConchError::Protocol(
                "KEXINIT received twice in one key exchange".to_string(),
            ));
        }
        let remote = KexInit::from_bytes(&payload)?;
        let local_payload = self.shared.ensure_kexinit().await?;
        let local = KexInit::from_bytes(&local_payload)?;

        let (client, server, client_payload, server_payload) = match self.shared.role {
            Role::Client => (&local, &remote, local_payload.clone(), payload.clone()),
            Role::Server => (&remote, &local, payload.clone(), local_payload.clone()),
        };
        let algorithms = negotiate(client, server)?;
        info!(
            "Negotiated kex={} hostkey={} cipher={}/{} mac={}/{}",
            algorithms.kex,
            algorithms.host_key,
            algorithms.cipher_client_to_server.name(),
            algorithms.cipher_server_to_client.name(),
            algorithms.mac_client_to_server.name(),
            algorithms.mac_server_to_client.name()
        );
        self.skip_guess = remote.first_kex_packet_follows() && !guess_was_correct(client, server);

        let identity = match self.shared.role {
            Role::Client => ConnectionIdentity {
                client_version: self.shared.local_version.as_str().to_string(),
                server_version: self.shared.remote_version.as_str().to_string(),
                client_kexinit: client_payload,
                server_kexinit: server_payload,
            },
            Role::Server => ConnectionIdentity {
                client_version: self.shared.remote_version.as_str().to_string(),
                server_version: self.shared.local_version.as_str().to_string(),
                client_kexinit: client_payload,
                server_kexinit: server_payload,
            },
        };

        let method = KexMethod::from_name(&algorithms.kex).ok_or_else(|| {
            ConchError::Protocol(format!("Unsupported key exchange {}", algorithms.kex))
        })?;
        let mut strategy = match self.shared.role {
            Role::Client => KexStrategy::client(
                method,
                self.shared.backend.clone(),
                identity,
                self.shared.config.gex_request,
            ),
            Role::Server => {
                let host_key = self
                    .shared
                    .host_keys
                    .iter()
                    .find(|k| k.algorithm() == algorithms.host_key)
                    .cloned()
                    .ok_or_else(|| {
                        ConchError::Protocol(format!("No host key for {}", algorithms.host_key))
                    })?;
                KexStrategy::server(
                    method,
                    self.shared.backend.clone(),
                    identity,
                    host_key,
                    self.shared.modulus_pool.clone(),
                )
            }
        };

        self.remote_kexinit = Some(payload);
        self.round = Some(algorithms);
        if let Some(first) = strategy.start()? {
            self.transport().send_unchecked(&first).await?;
        }
        self.strategy = Some(strategy);
        Ok(())
    }

    fn verify_server(&self, algorithms: &NegotiatedAlgorithms, result: &KexResult) -> ConchResult<()> {
        let trust = |e: ConchError| ConchError::Trust(e.to_string());
        let expected = key_type_for_algorithm(&algorithms.host_key);
        if key_type(&result.host_key).map_err(trust)? != expected {
            return Err(ConchError::Trust(format!(
                "Host key is not of negotiated type {}",
                expected
            )));
        }
        if signature_algorithm(&result.signature).map_err(trust)? != algorithms.host_key {
            return Err(ConchError::Trust(format!(
                "Signature is not of negotiated type {}",
                algorithms.host_key
            )));
        }
        if !verify_host_signature(&result.host_key, &result.h, &result.signature).map_err(trust)? {
            return Err(ConchError::Trust(
                "Host key signature verification failed".to_string(),
            ));
        }
        if let Some(verifier) = &self.shared.verifier {
            if !verifier.verify(&algorithms.host_key, &result.host_key) {
                return Err(ConchError::Trust(format!(
                    "Host key {} rejected",
                    fingerprint(&result.host_key)
                )));
            }
        }
        debug!("Host key {} verified", fingerprint(&result.host_key));
        Ok(())
    }

    async fn finish_exchange(&mut self, reply: Option<Vec<u8>>, result: KexResult) -> ConchResult<()> {
        let algorithms = self
            .round
            .clone()
            .ok_or_else(|| ConchError::Protocol("Key exchange without negotiation".to_string()))?;
        if self.shared.role == Role::Client {
            self.verify_server(&algorithms, &result)?;
        }

        let session_id = {
            let mut session = lock(&self.shared.session);
            let id = session
                .session_id
                .get_or_insert_with(|| result.h.clone())
                .clone();
            session.exchange_hash = Some(result.h.clone());
            session.server_host_key = Some(result.host_key.clone());
            id
        };

        let backend = self.shared.backend.as_ref();
        let SessionKeys {
            client_to_server,
            server_to_client,
        } = SessionKeys::derive(backend, &algorithms, &result, &session_id);
        let (out_keys, in_keys) = match self.shared.role {
            Role::Client => (client_to_server, server_to_client),
            Role::Server => (server_to_client, client_to_server),
        };
        let outbound = CipherState::from_keys(backend, &out_keys, CipherDirection::Encrypt)?;
        self.pending_inbound = Some(CipherState::from_keys(
            backend,
            &in_keys,
            CipherDirection::Decrypt,
        )?);
        self.strategy = None;

        let mut out = self.shared.outbound.lock().await;
        if let Some(reply) = reply {
            self.shared.write_locked(&mut out, &reply).await?;
        }
        self.shared.write_locked(&mut out, &new_keys_message()).await?;
        out.writer.install(outbound);
        out.local_kexinit = None;
        lock(&self.shared.session).awaiting_newkeys = true;
        debug!("Outbound keys installed");

        for deferred in std::mem::take(&mut out.deferred) {
            self.shared.write_locked(&mut out, &deferred).await?;
        }
        self.shared.gate.send_replace(false);
        Ok(())
    }

    fn on_newkeys(&mut self) -> ConchResult<()> {
        let inbound = self.pending_inbound.take().ok_or_else(|| {
            ConchError::Protocol("NEWKEYS before key exchange completed".to_string())
        })?;
        self.reader.install(inbound);
        self.remote_kexinit = None;
        debug!("Inbound keys installed");

        let mut session = lock(&self.shared.session);
        session.negotiated = self.round.take();
        session.awaiting_newkeys = false;
        self.shared.rounds.send_modify(|n| *n += 1);
        Ok(())
    }

    async fn check_rekey(&mut self) -> ConchResult<()> {
        if self.remote_kexinit.is_none() && self.shared.needs_rekey(self.reader.state()) {
            info!("Inbound rekey threshold reached");
            self.shared.ensure_kexinit().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::SoftwareBackend;
    use crate::ssh::hostkey::{AcceptAnyHostKey, Ed25519HostKey, PinnedHostKeys};

    async fn pair_with(
        client_config: TransportConfig,
        server_config: TransportConfig,
        verifier: Arc<dyn HostKeyVerifier>,
    ) -> (ConchResult<Transport>, ConchResult<Transport>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let backend: Arc<dyn CryptoBackend> = Arc::new(SoftwareBackend::new());
        let host_key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate());
        let server = tokio::spawn(Transport::server(
            b,
            server_config,
            vec![host_key],
            Arc::new(ModulusPool::with_defaults()),
            backend.clone(),
        ));
        let client = Transport::client(a, client_config, verifier, backend).await;
        let server = server.await.unwrap();
        (client, server)
    }

    async fn pair() -> (Transport, Transport) {
        let (c, s) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            Arc::new(AcceptAnyHostKey),
        )
        .await;
        (c.unwrap(), s.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_sets_session_id() {
        let (client, server) = pair().await;
        assert_eq!(client.kex_rounds(), 1);
        assert!(client.session_id().is_some());
        assert_eq!(client.session_id(), server.session_id());
        assert_eq!(client.exchange_hash(), client.session_id());
        assert_eq!(
            client.negotiated().unwrap().kex,
            "diffie-hellman-group-exchange-sha256"
        );
        assert_eq!(server.remote_version().as_str(), client.local_version().as_str());
    }

    #[tokio::test]
    async fn test_rekey_keeps_session_id() {
        let (client, server) = pair().await;
        let session_id = client.session_id();
        let first_hash = client.exchange_hash();

        client.rekey().await.unwrap();
        assert_eq!(client.kex_rounds(), 2);
        assert_eq!(client.session_id(), session_id);
        assert_ne!(client.exchange_hash(), first_hash);

        // Server-initiated round
        server.rekey().await.unwrap();
        assert_eq!(server.kex_rounds(), 3);
        assert_eq!(server.session_id(), session_id);
    }

    #[tokio::test]
    async fn test_fixed_group_negotiation() {
        let mut config = TransportConfig::default();
        config.algorithms.kex = vec!["diffie-hellman-group1-sha1".into()];
        config.algorithms.ciphers = vec!["aes128-cbc".into()];
        config.algorithms.macs = vec!["hmac-sha1-96".into()];
        let (client, _server) = pair_with(config, TransportConfig::default(), Arc::new(AcceptAnyHostKey)).await;
        let negotiated = client.unwrap().negotiated().unwrap();
        assert_eq!(negotiated.kex, "diffie-hellman-group1-sha1");
        assert_eq!(negotiated.cipher_client_to_server.name(), "aes128-cbc");
    }

    #[tokio::test]
    async fn test_rejected_host_key_is_trust_error() {
        let (client, _server) = pair_with(
            TransportConfig::default(),
            TransportConfig::default(),
            Arc::new(PinnedHostKeys::default()),
        )
        .await;
        assert!(matches!(client, Err(ConchError::Trust(_))));
    }

    #[tokio::test]
    async fn test_no_common_algorithm() {
        let mut config = TransportConfig::default();
        config.algorithms.ciphers = vec!["aes128-cbc".into()];
        let mut server_config = TransportConfig::default();
        server_config.algorithms.ciphers = vec!["aes256-ctr".into()];
        let (client, _server) = pair_with(config, server_config, Arc::new(AcceptAnyHostKey)).await;
        assert!(client.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_wakes_peer() {
        let (client, server) = pair().await;
        client
            .disconnect(disconnect::BY_APPLICATION, "bye")
            .await
            .unwrap();
        assert!(client.is_closed());

        let err = server.recv_auth(Duration::from_secs(5)).await.unwrap_err();
        match err {
            ConchError::Disconnected {
                reason,
                description,
            } => {
                assert_eq!(reason, disconnect::BY_APPLICATION);
                assert_eq!(description, "bye");
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
        assert!(server.send(&[2, 0, 0, 0, 0]).await.is_err());
    }

    #[tokio::test]
    async fn test_recv_auth_timeout() {
        let (client, _server) = pair().await;
        let err = client.recv_auth(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ConchError::Timeout(_)));
        // A timeout does not close the transport
        assert!(!client.is_closed());
        client.send_ignore(b"still alive").await.unwrap();
    }

    #[tokio::test]
    async fn test_service_request() {
        let (client, server) = pair().await;
        client
            .request_service("ssh-userauth", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_packet_limit_triggers_rekey() {
        let mut config = TransportConfig::default();
        config.rekey_limits = RekeyLimits {
            bytes: u64::MAX,
            packets: 4,
        };
        let (client, _server) = pair_with(config, TransportConfig::default(), Arc::new(AcceptAnyHostKey)).await;
        let client = client.unwrap();
        let session_id = client.session_id();
        for _ in 0..8 {
            client.send_ignore(b"x").await.unwrap();
            client.send(&[2, 0, 0, 0, 1, b'y']).await.unwrap();
        }
        // The automatic round finishes asynchronously
        let mut waited = 0;
        while client.kex_rounds() < 2 && waited < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }
        assert!(client.kex_rounds() >= 2);
        assert_eq!(client.session_id(), session_id);
    }

    #[tokio::test]
    async fn test_auth_messages_dropped_after_authentication() {
        let (client, server) = pair().await;
        let request = [MessageType::UserauthRequest as u8, 0, 0, 0, 0];

        client.send(&request).await.unwrap();
        assert_eq!(server.recv_auth(Duration::from_secs(5)).await.unwrap(), request);

        client.send(&request).await.unwrap();
        server.set_authenticated();
        for _ in 0..100 {
            client.send(&request).await.unwrap();
        }
        // A completed rekey means the server has read everything sent before it
        client.rekey().await.unwrap();

        assert!(server.is_authenticated());
        assert!(server.shared.auth_rx.lock().await.try_recv().is_err());
        assert!(matches!(
            server.recv_auth(Duration::from_millis(50)).await,
            Err(ConchError::Protocol(_))
        ));
        assert!(!server.is_closed());
    }

    #[test]
    fn test_dispatch_task_is_spawnable() {
        fn spawnable<F: std::future::Future<Output = ()> + Send + 'static>(_: fn(Dispatcher) -> F) {}
        spawnable(Dispatcher::run);
    }

    #[test]
    fn test_allowed_during_kex() {
        assert!(allowed_during_kex(1));
        assert!(allowed_during_kex(21));
        assert!(allowed_during_kex(31));
        assert!(!allowed_during_kex(50));
        assert!(!allowed_during_kex(94));
    }

    #[test]
    fn test_config_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_packet_size, 256 * 1024);
        assert_eq!(config.rekey_limits.bytes, 1 << 30);
        assert_eq!(config.rekey_limits.packets, 1 << 31);
    }
}
