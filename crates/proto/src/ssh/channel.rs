//! SSH channel multiplexer (RFC 4254 Sections 5-6).
//!
//! [`ChannelManager`] owns the channel table of one connection and receives
//! every connection protocol message from the transport's dispatch task.
//! [`Channel`] is the consumer handle: a pair of byte streams (plus stderr)
//! with independent flow-control windows and the request/reply operations of
//! a session channel.
//!
//! # Flow Control
//!
//! - Outbound writes never exceed the peer's window; a writer waits for
//!   WINDOW_ADJUST instead. Each DATA packet carries at most
//!   `min(window, peer max packet)` bytes.
//! - Inbound data is buffered until read. Once half of the granted window has
//!   been consumed by the reader, a WINDOW_ADJUST returns it to the peer.
//!   Unread stderr keeps its share of the window, so consumers that ignore
//!   stderr should enable [`Channel::set_combine_stderr`].
//!
//! # Example
//!
//! ```rust,no_run
//! use conch_proto::ssh::channel::ChannelManager;
//! use conch_proto::ssh::connection::ChannelType;
//! # use std::sync::Arc;
//!
//! # async fn example(channels: Arc<ChannelManager>) -> conch_platform::ConchResult<()> {
//! let channel = channels.open_channel(ChannelType::Session).await?;
//! channel.exec("uptime").await?;
//! let output = channel.read_to_end().await?;
//! let status = channel.exit_status().await?;
//! println!("{} (exit {})", String::from_utf8_lossy(&output), status);
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::connection::{
    encode_terminal_modes, extended_data, ChannelMessage, ChannelOpenFailureReason,
    ChannelRequestType, ChannelType, GlobalMessage,
};
use crate::ssh::message::MessageType;
use crate::ssh::server::ServerHandler;
use crate::ssh::transport::{ConnectionSink, Transport};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use conch_platform::{ConchError, ConchResult};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, trace, warn};

/// Default window granted to the peer (2 MiB).
pub const DEFAULT_WINDOW_SIZE: u32 = 2 * 1024 * 1024;

/// Default largest data packet accepted from the peer (32 KiB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Channel defaults for one connection.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Initial window granted to the peer for each channel.
    pub window_size: u32,
    /// Largest data packet the peer may send.
    pub max_packet_size: u32,
    /// How long `open_channel` waits for confirmation.
    pub open_timeout: Duration,
    /// Default per-call timeout of channel handles (`None` waits forever).
    pub timeout: Option<Duration>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            open_timeout: Duration::from_secs(30),
            timeout: None,
        }
    }
}

/// Signal that terminated the remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    /// Signal name without the "SIG" prefix
    pub signal_name: String,
    /// Whether a core was dumped
    pub core_dumped: bool,
    /// Error message
    pub error_message: String,
    /// Language tag
    pub language_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Opening,
    Open,
    Refused { reason: u32, description: String },
}

/// Mutable per-channel state, guarded by the channel's lock.
#[derive(Debug)]
struct ChannelState {
    phase: Phase,
    remote_id: u32,
    /// bytes we may still send
    remote_window: u32,
    remote_max_packet: u32,
    /// window we granted
    window_size: u32,
    /// bytes the peer may still send
    local_window: u32,
    /// read since the last WINDOW_ADJUST
    consumed: u32,
    stdout: BytesMut,
    stderr: BytesMut,
    combine_stderr: bool,
    eof_sent: bool,
    eof_received: bool,
    close_sent: bool,
    close_received: bool,
    exit_status: Option<u32>,
    exit_signal: Option<ExitSignal>,
    pending_replies: VecDeque<oneshot::Sender<bool>>,
    /// open timed out locally; close the channel if it is confirmed later
    abandoned: bool,
    transport_gone: bool,
}

impl ChannelState {
    fn new(window_size: u32) -> Self {
        Self {
            phase: Phase::Opening,
            remote_id: 0,
            remote_window: 0,
            remote_max_packet: 0,
            window_size,
            local_window: window_size,
            consumed: 0,
            stdout: BytesMut::new(),
            stderr: BytesMut::new(),
            combine_stderr: false,
            eof_sent: false,
            eof_received: false,
            close_sent: false,
            close_received: false,
            exit_status: None,
            exit_signal: None,
            pending_replies: VecDeque::new(),
            abandoned: false,
            transport_gone: false,
        }
    }

    /// Exit status is reported once; later reports are refused.
    fn record_exit_status(&mut self, status: u32) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        self.exit_status = Some(status);
        true
    }

    fn record_exit_signal(&mut self, signal: ExitSignal) -> bool {
        if self.exit_signal.is_some() {
            return false;
        }
        self.exit_signal = Some(signal);
        true
    }

    fn confirm(&mut self, remote_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.phase = Phase::Open;
        self.remote_id = remote_id;
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
    }

    fn is_closed(&self) -> bool {
        self.close_sent || self.close_received || self.transport_gone
    }

    /// Accounts for inbound payload against the granted window.
    fn receive(&mut self, len: usize) -> ConchResult<()> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        if len > self.local_window {
            return Err(ConchError::Protocol(format!(
                "Peer sent {} bytes with only {} left in the window",
                len, self.local_window
            )));
        }
        self.local_window -= len;
        Ok(())
    }

    /// Records `len` bytes read by the consumer; returns a window adjustment
    /// to send once half of the window has been used.
    fn consume(&mut self, len: usize) -> Option<u32> {
        self.consumed = self
            .consumed
            .saturating_add(u32::try_from(len).unwrap_or(u32::MAX));
        if self.is_closed() || self.consumed < self.window_size / 2 {
            return None;
        }
        let add = self.consumed;
        self.consumed = 0;
        self.local_window = self.local_window.saturating_add(add);
        Some(add)
    }

    /// Takes window for an outbound packet of up to `wanted` bytes.
    fn reserve(&mut self, wanted: usize) -> u32 {
        let wanted = u32::try_from(wanted).unwrap_or(u32::MAX);
        let n = wanted.min(self.remote_window).min(self.remote_max_packet);
        self.remote_window -= n;
        n
    }

    fn drop_waiters(&mut self) {
        self.pending_replies.clear();
    }
}

struct ChannelShared {
    local_id: u32,
    channel_type: ChannelType,
    state: StdMutex<ChannelState>,
    /// bumped on every state change
    events: watch::Sender<u64>,
    /// keeps want-reply requests in send order
    request_lock: Mutex<()>,
}

impl ChannelShared {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock(&self.state)
    }

    fn notify(&self) {
        self.events.send_modify(|n| *n = n.wrapping_add(1));
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct ChannelTable {
    next_id: u32,
    channels: HashMap<u32, Arc<ChannelShared>>,
}

impl ChannelTable {
    fn allocate(&mut self, channel_type: ChannelType, state: ChannelState) -> Arc<ChannelShared> {
        while self.channels.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let local_id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let shared = Arc::new(ChannelShared {
            local_id,
            channel_type,
            state: StdMutex::new(state),
            events: watch::channel(0).0,
            request_lock: Mutex::new(()),
        });
        self.channels.insert(local_id, shared.clone());
        shared
    }
}

/// Channel table and connection-level requests of one connection.
pub struct ChannelManager {
    me: Weak<ChannelManager>,
    transport: Transport,
    handler: Option<Arc<dyn ServerHandler>>,
    config: ChannelConfig,
    table: StdMutex<ChannelTable>,
    incoming_tx: mpsc::UnboundedSender<Channel>,
    incoming_rx: Mutex<mpsc::UnboundedReceiver<Channel>>,
    global_replies: StdMutex<VecDeque<oneshot::Sender<Option<Vec<u8>>>>>,
    global_lock: Mutex<()>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &lock(&self.table).channels.len())
            .field("server", &self.handler.is_some())
            .finish_non_exhaustive()
    }
}

impl ChannelManager {
    /// Creates the channel table for `transport`.
    ///
    /// Servers pass their handler, which decides on inbound opens and requests;
    /// without one every inbound open and request is refused. The manager is
    /// not registered with the transport; see [`ChannelManager::sink`].
    pub fn new(
        transport: Transport,
        handler: Option<Arc<dyn ServerHandler>>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            handler,
            config,
            table: StdMutex::new(ChannelTable::default()),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            global_replies: StdMutex::new(VecDeque::new()),
            global_lock: Mutex::new(()),
        })
    }

    /// Weak sink handle for [`Transport::set_connection_sink`].
    pub fn sink(self: &Arc<Self>) -> Weak<dyn ConnectionSink> {
        let sink: Arc<dyn ConnectionSink> = self.clone();
        Arc::downgrade(&sink)
    }

    /// Transport carrying the channels.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Channel defaults.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Number of channels in the table.
    pub fn channel_count(&self) -> usize {
        lock(&self.table).channels.len()
    }

    fn handle(&self, shared: Arc<ChannelShared>) -> ConchResult<Channel> {
        let manager = self
            .me
            .upgrade()
            .ok_or_else(|| ConchError::TransportClosed("Channel manager dropped".to_string()))?;
        Ok(Channel {
            shared,
            manager,
            timeout: self.config.timeout,
        })
    }

    fn find(&self, local_id: u32) -> ConchResult<Arc<ChannelShared>> {
        lock(&self.table)
            .channels
            .get(&local_id)
            .cloned()
            .ok_or_else(|| ConchError::Protocol(format!("Message for unknown channel {}", local_id)))
    }

    fn release(&self, local_id: u32) {
        if lock(&self.table).channels.remove(&local_id).is_some() {
            debug!("Channel {} released", local_id);
        }
    }

    /// Opens a channel and waits for the peer's confirmation.
    ///
    /// An open failure is returned as [`ConchError::ChannelOpen`] with the
    /// peer's reason code; it affects only this channel.
    pub async fn open_channel(&self, channel_type: ChannelType) -> ConchResult<Channel> {
        let shared = lock(&self.table).allocate(
            channel_type.clone(),
            ChannelState::new(self.config.window_size),
        );
        let local_id = shared.local_id;
        let channel = self.handle(shared)?;

        let open = ChannelMessage::Open {
            channel_type,
            sender_channel: local_id,
            initial_window_size: self.config.window_size,
            maximum_packet_size: self.config.max_packet_size,
        };
        if let Err(e) = self.transport.send(&open.to_bytes()).await {
            self.release(local_id);
            return Err(e);
        }
        debug!("Opening channel {} ({})", local_id, channel.channel_type().name());

        let transport = self.transport.clone();
        let confirmed = channel
            .wait_for(Some(self.config.open_timeout), |st| match &st.phase {
                Phase::Open => Some(Ok(())),
                Phase::Refused {
                    reason,
                    description,
                } => Some(Err(ConchError::ChannelOpen {
                    reason: *reason,
                    description: description.clone(),
                })),
                Phase::Opening if st.transport_gone => Some(Err(transport.closed_error())),
                Phase::Opening => None,
            })
            .await;

        match confirmed {
            Ok(()) => {
                info!("Channel {} open", local_id);
                Ok(channel)
            }
            Err(e @ ConchError::Timeout(_)) => {
                channel.shared.state().abandoned = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens a "session" channel.
    pub async fn open_session(&self) -> ConchResult<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Waits for the next channel opened by the peer and accepted by the handler.
    pub async fn accept(&self, wait: Option<Duration>) -> ConchResult<Channel> {
        let mut incoming = self.incoming_rx.lock().await;
        let next = async {
            tokio::select! {
                biased;
                channel = incoming.recv() => channel.ok_or_else(|| self.transport.closed_error()),
                _ = self.transport.closed() => Err(self.transport.closed_error()),
            }
        };
        with_timeout(wait, "channel accept", next).await
    }

    /// Sends SSH_MSG_GLOBAL_REQUEST.
    ///
    /// With `want_reply`, waits for the answer and returns the success data;
    /// a refusal is [`ConchError::RequestFailed`].
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
        wait: Option<Duration>,
    ) -> ConchResult<Option<Vec<u8>>> {
        let msg = GlobalMessage::Request {
            name: name.to_string(),
            want_reply,
            data: data.to_vec(),
        };
        let reply = {
            let _ordered = self.global_lock.lock().await;
            let reply = if want_reply {
                let (tx, rx) = oneshot::channel();
                lock(&self.global_replies).push_back(tx);
                Some(rx)
            } else {
                None
            };
            self.transport.send(&msg.to_bytes()).await?;
            reply
        };
        let Some(reply) = reply else {
            return Ok(None);
        };
        match with_timeout(wait, "global request", async {
            reply.await.map_err(|_| self.transport.closed_error())
        })
        .await?
        {
            Some(data) => Ok(Some(data)),
            None => Err(ConchError::RequestFailed(name.to_string())),
        }
    }

    async fn on_open(
        &self,
        channel_type: ChannelType,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> ConchResult<()> {
        let decision = if maximum_packet_size == 0 {
            Err(ChannelOpenFailureReason::ResourceShortage)
        } else {
            match &self.handler {
                Some(handler) => handler.check_channel_open(&channel_type).await,
                None => Err(ChannelOpenFailureReason::AdministrativelyProhibited),
            }
        };

        let reply = match decision {
            Ok(()) => {
                let mut state = ChannelState::new(self.config.window_size);
                state.confirm(sender_channel, initial_window_size, maximum_packet_size);
                let shared = lock(&self.table).allocate(channel_type, state);
                let local_id = shared.local_id;
                let channel = self.handle(shared)?;
                info!(
                    "Accepted {} channel {} (peer {})",
                    channel.channel_type().name(),
                    local_id,
                    sender_channel
                );
                let _ = self.incoming_tx.send(channel);
                ChannelMessage::OpenConfirmation {
                    recipient_channel: sender_channel,
                    sender_channel: local_id,
                    initial_window_size: self.config.window_size,
                    maximum_packet_size: self.config.max_packet_size,
                }
            }
            Err(reason) => {
                info!(
                    "Refused {} channel from peer {}: {}",
                    channel_type.name(),
                    sender_channel,
                    reason.as_str()
                );
                ChannelMessage::OpenFailure {
                    recipient_channel: sender_channel,
                    reason_code: reason as u32,
                    description: reason.as_str().to_string(),
                    language_tag: String::new(),
                }
            }
        };
        self.transport.post(reply.to_bytes()).await
    }

    async fn on_request(
        &self,
        shared: Arc<ChannelShared>,
        want_reply: bool,
        request: ChannelRequestType,
    ) -> ConchResult<()> {
        let name = request.name().to_string();
        let accepted = match &self.handler {
            Some(handler) => {
                let channel = self.handle(shared.clone())?;
                match request {
                    ChannelRequestType::PtyReq {
                        term,
                        width_chars,
                        height_rows,
                        width_pixels,
                        height_pixels,
                        modes,
                    } => {
                        handler
                            .check_pty_request(
                                &channel,
                                &term,
                                (width_chars, height_rows, width_pixels, height_pixels),
                                &modes,
                            )
                            .await
                    }
                    ChannelRequestType::Shell => handler.check_shell_request(&channel).await,
                    ChannelRequestType::Exec { command } => {
                        handler.check_exec_request(&channel, &command).await
                    }
                    ChannelRequestType::Subsystem { name } => {
                        handler.check_subsystem_request(&channel, &name).await
                    }
                    ChannelRequestType::Env { name, value } => {
                        handler.check_env_request(&channel, &name, &value).await
                    }
                    ChannelRequestType::WindowChange {
                        width_chars,
                        height_rows,
                        width_pixels,
                        height_pixels,
                    } => {
                        handler
                            .window_change(
                                &channel,
                                (width_chars, height_rows, width_pixels, height_pixels),
                            )
                            .await;
                        true
                    }
                    ChannelRequestType::Signal { signal_name } => {
                        handler.signal(&channel, &signal_name).await;
                        true
                    }
                    _ => false,
                }
            }
            None => match request {
                ChannelRequestType::ExitStatus { exit_status } => {
                    let first = shared.state().record_exit_status(exit_status);
                    if first {
                        debug!("Channel {} exit status {}", shared.local_id, exit_status);
                        shared.notify();
                    } else {
                        warn!(
                            "Channel {} ignoring repeated exit status {}",
                            shared.local_id, exit_status
                        );
                    }
                    first
                }
                ChannelRequestType::ExitSignal {
                    signal_name,
                    core_dumped,
                    error_message,
                    language_tag,
                } => {
                    let signal = ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                        language_tag,
                    };
                    let reported = signal.signal_name.clone();
                    let first = shared.state().record_exit_signal(signal);
                    if first {
                        debug!("Channel {} killed by {}", shared.local_id, reported);
                        shared.notify();
                    } else {
                        warn!(
                            "Channel {} ignoring repeated exit signal {}",
                            shared.local_id, reported
                        );
                    }
                    first
                }
                _ => false,
            },
        };
        trace!(
            "Channel {} request {} {}",
            shared.local_id,
            name,
            if accepted { "accepted" } else { "refused" }
        );

        if want_reply {
            let remote_id = shared.state().remote_id;
            let reply = if accepted {
                ChannelMessage::Success {
                    recipient_channel: remote_id,
                }
            } else {
                ChannelMessage::Failure {
                    recipient_channel: remote_id,
                }
            };
            self.transport.post(reply.to_bytes()).await?;
        }
        Ok(())
    }

    async fn on_close(&self, shared: Arc<ChannelShared>) -> ConchResult<()> {
        let reply = {
            let mut st = shared.state();
            st.close_received = true;
            st.drop_waiters();
            if st.close_sent {
                None
            } else {
                st.close_sent = true;
                Some(st.remote_id)
            }
        };
        shared.notify();
        if let Some(remote_id) = reply {
            let close = ChannelMessage::Close {
                recipient_channel: remote_id,
            };
            self.transport.post(close.to_bytes()).await?;
        }
        debug!("Channel {} closed by peer", shared.local_id);
        self.release(shared.local_id);
        Ok(())
    }

    async fn on_channel_message(&self, msg: ChannelMessage) -> ConchResult<()> {
        let local_id = msg
            .recipient_channel()
            .ok_or_else(|| ConchError::Protocol("Channel message without recipient".to_string()))?;
        let shared = self.find(local_id)?;

        match msg {
            ChannelMessage::OpenConfirmation {
                sender_channel,
                initial_window_size,
                maximum_packet_size,
                ..
            } => {
                let abandoned = {
                    let mut st = shared.state();
                    if st.phase != Phase::Opening {
                        return Err(ConchError::Protocol(format!(
                            "Unexpected confirmation for channel {}",
                            local_id
                        )));
                    }
                    st.confirm(sender_channel, initial_window_size, maximum_packet_size);
                    if st.abandoned {
                        st.close_sent = true;
                    }
                    st.abandoned
                };
                shared.notify();
                if abandoned {
                    debug!("Closing channel {} confirmed after timeout", local_id);
                    let close = ChannelMessage::Close {
                        recipient_channel: sender_channel,
                    };
                    self.transport.post(close.to_bytes()).await?;
                }
                Ok(())
            }
            ChannelMessage::OpenFailure {
                reason_code,
                description,
                ..
            } => {
                {
                    let mut st = shared.state();
                    if st.phase != Phase::Opening {
                        return Err(ConchError::Protocol(format!(
                            "Unexpected open failure for channel {}",
                            local_id
                        )));
                    }
                    st.phase = Phase::Refused {
                        reason: reason_code,
                        description,
                    };
                }
                shared.notify();
                self.release(local_id);
                Ok(())
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                {
                    let mut st = shared.state();
                    st.remote_window = st.remote_window.saturating_add(bytes_to_add);
                    trace!("Channel {} window now {}", local_id, st.remote_window);
                }
                shared.notify();
                Ok(())
            }
            ChannelMessage::Data { data, .. } => {
                {
                    let mut st = shared.state();
                    st.receive(data.len())?;
                    if st.eof_received {
                        warn!("Dropping data after EOF on channel {}", local_id);
                    } else {
                        st.stdout.put_slice(&data);
                    }
                }
                shared.notify();
                Ok(())
            }
            ChannelMessage::ExtendedData {
                data_type_code,
                data,
                ..
            } => {
                {
                    let mut st = shared.state();
                    st.receive(data.len())?;
                    if data_type_code != extended_data::STDERR {
                        debug!("Ignoring extended data type {}", data_type_code);
                    } else if st.combine_stderr {
                        st.stdout.put_slice(&data);
                    } else {
                        st.stderr.put_slice(&data);
                    }
                }
                shared.notify();
                Ok(())
            }
            ChannelMessage::Eof { .. } => {
                shared.state().eof_received = true;
                shared.notify();
                debug!("EOF on channel {}", local_id);
                Ok(())
            }
            ChannelMessage::Close { .. } => self.on_close(shared).await,
            ChannelMessage::Request {
                want_reply,
                request,
                ..
            } => self.on_request(shared, want_reply, request).await,
            ChannelMessage::Success { .. } | ChannelMessage::Failure { .. } => {
                let accepted = matches!(msg, ChannelMessage::Success { .. });
                let waiter = shared.state().pending_replies.pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(accepted);
                        Ok(())
                    }
                    None => Err(ConchError::Protocol(format!(
                        "Unsolicited request reply on channel {}",
                        local_id
                    ))),
                }
            }
            ChannelMessage::Open { .. } => Err(ConchError::Protocol(
                "CHANNEL_OPEN routed as channel message".to_string(),
            )),
        }
    }

    async fn on_global_message(&self, msg: GlobalMessage) -> ConchResult<()> {
        match msg {
            GlobalMessage::Request {
                name,
                want_reply,
                data,
            } => {
                let accepted = match &self.handler {
                    Some(handler) => handler.check_global_request(&name, &data).await,
                    None => false,
                };
                debug!(
                    "Global request {} {}",
                    name,
                    if accepted { "accepted" } else { "refused" }
                );
                if want_reply {
                    let reply = if accepted {
                        GlobalMessage::Success { data: Vec::new() }
                    } else {
                        GlobalMessage::Failure
                    };
                    self.transport.post(reply.to_bytes()).await?;
                }
                Ok(())
            }
            GlobalMessage::Success { .. } | GlobalMessage::Failure => {
                let data = match msg {
                    GlobalMessage::Success { data } => Some(data),
                    _ => None,
                };
                let waiter = lock(&self.global_replies).pop_front();
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(data);
                        Ok(())
                    }
                    None => Err(ConchError::Protocol(
                        "Unsolicited global request reply".to_string(),
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl ConnectionSink for ChannelManager {
    async fn handle_message(&self, payload: Vec<u8>) -> ConchResult<()> {
        match payload.first().copied().and_then(MessageType::from_u8) {
            Some(MessageType::GlobalRequest | MessageType::RequestSuccess | MessageType::RequestFailure) => {
                self.on_global_message(GlobalMessage::from_bytes(&payload)?)
                    .await
            }
            _ => match ChannelMessage::from_bytes(&payload)? {
                ChannelMessage::Open {
                    channel_type,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                } => {
                    self.on_open(
                        channel_type,
                        sender_channel,
                        initial_window_size,
                        maximum_packet_size,
                    )
                    .await
                }
                other => self.on_channel_message(other).await,
            },
        }
    }

    fn transport_closed(&self, reason: &str) {
        let channels: Vec<_> = lock(&self.table).channels.drain().map(|(_, c)| c).collect();
        debug!("Waking {} channels: {}", channels.len(), reason);
        for shared in channels {
            {
                let mut st = shared.state();
                st.transport_gone = true;
                st.drop_waiters();
            }
            shared.notify();
        }
        lock(&self.global_replies).clear();
    }
}

async fn with_timeout<T>(
    wait: Option<Duration>,
    what: &str,
    fut: impl Future<Output = ConchResult<T>>,
) -> ConchResult<T> {
    match wait {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ConchError::Timeout(format!("{} timed out after {:?}", what, limit)))?,
        None => fut.await,
    }
}

/// Handle to one open channel. Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    manager: Arc<ChannelManager>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.shared.state();
        f.debug_struct("Channel")
            .field("local_id", &self.shared.local_id)
            .field("remote_id", &st.remote_id)
            .field("type", &self.shared.channel_type.name())
            .field("closed", &st.is_closed())
            .finish()
    }
}

impl Channel {
    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.shared.state().remote_id
    }

    /// Channel type given at open.
    pub fn channel_type(&self) -> &ChannelType {
        &self.shared.channel_type
    }

    /// Sets the timeout applied to each blocking call on this handle.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Timeout applied to each blocking call on this handle.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Delivers future stderr data on the primary stream.
    pub fn set_combine_stderr(&self, combine: bool) {
        let mut st = self.shared.state();
        st.combine_stderr = combine;
        if combine && !st.stderr.is_empty() {
            let pending = st.stderr.split();
            st.stdout.put_slice(&pending);
        }
    }

    /// Whether the peer has sent EOF.
    pub fn eof_received(&self) -> bool {
        self.shared.state().eof_received
    }

    /// Whether the channel is closed in either direction or the transport is gone.
    pub fn is_closed(&self) -> bool {
        self.shared.state().is_closed()
    }

    /// Bytes we may still send before the peer adjusts the window.
    pub fn send_window(&self) -> u32 {
        self.shared.state().remote_window
    }

    /// Whether an exit status has been received.
    pub fn exit_status_ready(&self) -> bool {
        self.shared.state().exit_status.is_some()
    }

    /// Exit signal, if the remote command was killed.
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.shared.state().exit_signal.clone()
    }

    async fn wait_for<T>(
        &self,
        wait: Option<Duration>,
        mut ready: impl FnMut(&mut ChannelState) -> Option<ConchResult<T>> + Send,
    ) -> ConchResult<T> {
        let poll = async {
            loop {
                let mut events = self.shared.events.subscribe();
                let outcome = {
                    let mut st = self.shared.state();
                    ready(&mut st)
                };
                if let Some(result) = outcome {
                    return result;
                }
                if events.changed().await.is_err() {
                    return Err(ConchError::ChannelClosed);
                }
            }
        };
        with_timeout(wait, "channel operation", poll).await
    }

    fn gone_or_closed(&self, st: &ChannelState) -> ConchError {
        if st.transport_gone {
            self.manager.transport.closed_error()
        } else {
            ConchError::ChannelClosed
        }
    }

    async fn read_stream(&self, stderr: bool) -> ConchResult<Vec<u8>> {
        let (data, adjust) = self
            .wait_for(self.timeout, |st| {
                let buf = if stderr { &mut st.stderr } else { &mut st.stdout };
                if !buf.is_empty() {
                    let data = buf.split().to_vec();
                    let adjust = st.consume(data.len()).map(|n| (st.remote_id, n));
                    return Some(Ok((data, adjust)));
                }
                if st.eof_received || st.close_received {
                    return Some(Ok((Vec::new(), None)));
                }
                if st.transport_gone {
                    return Some(Err(self.gone_or_closed(st)));
                }
                None
            })
            .await?;

        if let Some((remote_id, bytes_to_add)) = adjust {
            trace!("Channel {} returning {} bytes of window", self.local_id(), bytes_to_add);
            let msg = ChannelMessage::WindowAdjust {
                recipient_channel: remote_id,
                bytes_to_add,
            };
            self.manager.transport.send(&msg.to_bytes()).await?;
        }
        Ok(data)
    }

    /// Reads available data, waiting for some. An empty result means EOF.
    pub async fn read(&self) -> ConchResult<Vec<u8>> {
        self.read_stream(false).await
    }

    /// Reads available stderr data. An empty result means EOF.
    pub async fn read_stderr(&self) -> ConchResult<Vec<u8>> {
        self.read_stream(true).await
    }

    /// Reads until EOF.
    pub async fn read_to_end(&self) -> ConchResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read().await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    /// Reads stderr until EOF.
    pub async fn read_stderr_to_end(&self) -> ConchResult<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let chunk = self.read_stderr().await?;
            if chunk.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
    }

    async fn write_stream(&self, data: &[u8], data_type: Option<u32>) -> ConchResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let wanted = data.len() - offset;
            let (remote_id, n) = self
                .wait_for(self.timeout, |st| {
                    if st.eof_sent || st.is_closed() {
                        return Some(Err(self.gone_or_closed(st)));
                    }
                    match st.reserve(wanted) {
                        0 => None,
                        n => Some(Ok((st.remote_id, n))),
                    }
                })
                .await?;

            let chunk = data[offset..offset + n as usize].to_vec();
            let msg = match data_type {
                None => ChannelMessage::Data {
                    recipient_channel: remote_id,
                    data: chunk,
                },
                Some(data_type_code) => ChannelMessage::ExtendedData {
                    recipient_channel: remote_id,
                    data_type_code,
                    data: chunk,
                },
            };
            self.manager.transport.send(&msg.to_bytes()).await?;
            offset += n as usize;
        }
        Ok(())
    }

    /// Writes all of `data`, waiting whenever the peer's window is exhausted.
    pub async fn write(&self, data: &[u8]) -> ConchResult<()> {
        self.write_stream(data, None).await
    }

    /// Writes to the stderr stream.
    pub async fn write_stderr(&self, data: &[u8]) -> ConchResult<()> {
        self.write_stream(data, Some(extended_data::STDERR)).await
    }

    /// Signals that no more data will be sent.
    pub async fn send_eof(&self) -> ConchResult<()> {
        let remote_id = {
            let mut st = self.shared.state();
            if st.eof_sent || st.is_closed() {
                return Ok(());
            }
            st.eof_sent = true;
            st.remote_id
        };
        let msg = ChannelMessage::Eof {
            recipient_channel: remote_id,
        };
        self.manager.transport.send(&msg.to_bytes()).await
    }

    /// Closes the channel and waits for the peer's CLOSE.
    pub async fn close(&self) -> ConchResult<()> {
        let remote_id = {
            let mut st = self.shared.state();
            if st.transport_gone {
                return Ok(());
            }
            if st.close_sent {
                None
            } else {
                st.close_sent = true;
                Some(st.remote_id)
            }
        };
        self.shared.notify();
        if let Some(remote_id) = remote_id {
            let msg = ChannelMessage::Close {
                recipient_channel: remote_id,
            };
            self.manager.transport.send(&msg.to_bytes()).await?;
            debug!("Sent close on channel {}", self.local_id());
        }
        self.wait_for(self.timeout, |st| {
            (st.close_received || st.transport_gone).then_some(Ok(()))
        })
        .await?;
        self.manager.release(self.local_id());
        Ok(())
    }

    /// Sends a channel request; with `want_reply` waits for the answer.
    pub async fn send_request(&self, request: ChannelRequestType, want_reply: bool) -> ConchResult<()> {
        let name = request.name().to_string();
        let reply = {
            let _ordered = self.shared.request_lock.lock().await;
            let (remote_id, reply) = {
                let mut st = self.shared.state();
                if st.is_closed() || st.phase != Phase::Open {
                    return Err(self.gone_or_closed(&st));
                }
                let reply = if want_reply {
                    let (tx, rx) = oneshot::channel();
                    st.pending_replies.push_back(tx);
                    Some(rx)
                } else {
                    None
                };
                (st.remote_id, reply)
            };
            let msg = ChannelMessage::Request {
                recipient_channel: remote_id,
                want_reply,
                request,
            };
            self.manager.transport.send(&msg.to_bytes()).await?;
            reply
        };

        let Some(reply) = reply else {
            return Ok(());
        };
        let accepted = with_timeout(self.timeout, "channel request", async {
            reply.await.map_err(|_| {
                let st = self.shared.state();
                self.gone_or_closed(&st)
            })
        })
        .await?;
        if accepted {
            debug!("Channel {} request {} accepted", self.local_id(), name);
            Ok(())
        } else {
            Err(ConchError::RequestFailed(name))
        }
    }

    /// Requests a pseudo-terminal.
    pub async fn request_pty(
        &self,
        term: &str,
        width_chars: u32,
        height_rows: u32,
        modes: &[(u8, u32)],
    ) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::PtyReq {
                term: term.to_string(),
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
                modes: encode_terminal_modes(modes),
            },
            true,
        )
        .await
    }

    /// Starts the user's shell.
    pub async fn request_shell(&self) -> ConchResult<()> {
        self.send_request(ChannelRequestType::Shell, true).await
    }

    /// Runs a command.
    pub async fn exec(&self, command: &str) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::Exec {
                command: command.to_string(),
            },
            true,
        )
        .await
    }

    /// Starts a subsystem such as "sftp".
    pub async fn request_subsystem(&self, name: &str) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::Subsystem {
                name: name.to_string(),
            },
            true,
        )
        .await
    }

    /// Reports a new terminal size.
    pub async fn resize_pty(&self, width_chars: u32, height_rows: u32) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::WindowChange {
                width_chars,
                height_rows,
                width_pixels: 0,
                height_pixels: 0,
            },
            false,
        )
        .await
    }

    /// Delivers a signal (name without "SIG") to the remote process.
    pub async fn send_signal(&self, signal_name: &str) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::Signal {
                signal_name: signal_name.to_string(),
            },
            false,
        )
        .await
    }

    /// Sets an environment variable for the command to come.
    pub async fn send_env(&self, name: &str, value: &str) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::Env {
                name: name.to_string(),
                value: value.to_string(),
            },
            true,
        )
        .await
    }

    /// Reports the command's exit status (server side).
    pub async fn send_exit_status(&self, exit_status: u32) -> ConchResult<()> {
        self.send_request(ChannelRequestType::ExitStatus { exit_status }, false)
            .await
    }

    /// Reports that the command was killed by a signal (server side).
    pub async fn send_exit_signal(&self, signal: ExitSignal) -> ConchResult<()> {
        self.send_request(
            ChannelRequestType::ExitSignal {
                signal_name: signal.signal_name,
                core_dumped: signal.core_dumped,
                error_message: signal.error_message,
                language_tag: signal.language_tag,
            },
            false,
        )
        .await
    }

    /// Waits for the exit status. It stays available after the channel closes.
    pub async fn exit_status(&self) -> ConchResult<u32> {
        self.wait_for(self.timeout, |st| match st.exit_status {
            Some(status) => Some(Ok(status)),
            None if st.is_closed() => Some(Err(self.gone_or_closed(st))),
            None => None,
        })
        .await
    }
}
