//! SSH server.
//!
//! An [`SshServer`] accepts TCP connections and turns each one into a
//! [`ServerSession`]: key exchange, user authentication against a
//! [`ServerHandler`], then a channel table whose inbound opens and requests
//! are decided by the same handler.
//!
//! # Example
//!
//! ```rust,no_run
//! use conch_proto::ssh::auth::{constant_time_eq, AuthResult};
//! use conch_proto::ssh::channel::Channel;
//! use conch_proto::ssh::server::{ServerHandler, SshServer};
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl ServerHandler for Echo {
//!     async fn check_auth_password(&self, username: &str, password: &str) -> AuthResult {
//!         if username == "demo" && constant_time_eq(password, "demo") {
//!             AuthResult::Success
//!         } else {
//!             AuthResult::Failure
//!         }
//!     }
//!
//!     async fn check_exec_request(&self, _channel: &Channel, _command: &str) -> bool {
//!         true
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> conch_platform::ConchResult<()> {
//! let server = SshServer::bind("127.0.0.1:2222", Arc::new(Echo)).await?;
//! let session = server.accept().await?.session().await?;
//! let channel = session.accept(None).await?;
//! channel.write(b"hello\n").await?;
//! channel.send_exit_status(0).await?;
//! channel.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{AuthResult, InteractiveReply, ServerAuth};
use crate::ssh::channel::{Channel, ChannelConfig, ChannelManager};
use crate::ssh::connection::{ChannelOpenFailureReason, ChannelType};
use crate::ssh::crypto::SoftwareBackend;
use crate::ssh::hostkey::{Ed25519HostKey, HostKey};
use crate::ssh::kex_dh::ModulusPool;
use crate::ssh::message::disconnect;
use crate::ssh::transport::{Transport, TransportConfig};
use conch_platform::{ConchError, ConchResult, CryptoBackend};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Server policy hooks.
///
/// Every method has a conservative default: authentication fails, only
/// session channels may be opened, and every channel request is refused.
/// Hooks are awaited on the connection's dispatch task, so they should
/// decide quickly and leave long-running work to tasks of their own.
#[async_trait::async_trait]
pub trait ServerHandler: Send + Sync {
    /// Methods offered to `username`.
    fn allowed_auths(&self, _username: &str) -> Vec<String> {
        vec!["publickey".to_string(), "password".to_string()]
    }

    /// "none" authentication.
    async fn check_auth_none(&self, _username: &str) -> AuthResult {
        AuthResult::Failure
    }

    /// Password authentication.
    async fn check_auth_password(&self, _username: &str, _password: &str) -> AuthResult {
        AuthResult::Failure
    }

    /// Public key authentication.
    ///
    /// Called for the unsigned query as well as for the signed request (after
    /// the signature has been verified). Anything but `Failure` on the query
    /// is answered with PK_OK.
    async fn check_auth_publickey(
        &self,
        _username: &str,
        _algorithm: &str,
        _key_blob: &[u8],
    ) -> AuthResult {
        AuthResult::Failure
    }

    /// Start of keyboard-interactive authentication.
    async fn check_auth_interactive(&self, _username: &str, _submethods: &str) -> InteractiveReply {
        InteractiveReply::Done(AuthResult::Failure)
    }

    /// Answers to the previous query.
    async fn check_auth_interactive_response(
        &self,
        _username: &str,
        _responses: &[Zeroizing<String>],
    ) -> InteractiveReply {
        InteractiveReply::Done(AuthResult::Failure)
    }

    /// Decides on a channel opened by the client.
    async fn check_channel_open(
        &self,
        channel_type: &ChannelType,
    ) -> Result<(), ChannelOpenFailureReason> {
        match channel_type {
            ChannelType::Session => Ok(()),
            _ => Err(ChannelOpenFailureReason::AdministrativelyProhibited),
        }
    }

    /// "pty-req": terminal name, (columns, rows, width px, height px), encoded modes.
    async fn check_pty_request(
        &self,
        _channel: &Channel,
        _term: &str,
        _dimensions: (u32, u32, u32, u32),
        _modes: &[u8],
    ) -> bool {
        false
    }

    /// "shell"
    async fn check_shell_request(&self, _channel: &Channel) -> bool {
        false
    }

    /// "exec"
    async fn check_exec_request(&self, _channel: &Channel, _command: &str) -> bool {
        false
    }

    /// "subsystem"
    async fn check_subsystem_request(&self, _channel: &Channel, _name: &str) -> bool {
        false
    }

    /// "env"
    async fn check_env_request(&self, _channel: &Channel, _name: &str, _value: &str) -> bool {
        false
    }

    /// "window-change"
    async fn window_change(&self, _channel: &Channel, _dimensions: (u32, u32, u32, u32)) {}

    /// "signal"
    async fn signal(&self, _channel: &Channel, _signal_name: &str) {}

    /// Global requests such as "tcpip-forward".
    async fn check_global_request(&self, _name: &str, _data: &[u8]) -> bool {
        false
    }
}

/// SSH server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Transport settings.
    pub transport: TransportConfig,
    /// Host keys; at least one is required.
    pub host_keys: Vec<Arc<dyn HostKey>>,
    /// Groups offered to group-exchange clients.
    pub modulus_pool: Arc<ModulusPool>,
    /// Cryptographic primitives.
    pub backend: Arc<dyn CryptoBackend>,
    /// Failed attempts before the client is disconnected.
    pub max_auth_failures: u32,
    /// Banner shown before the first authentication answer.
    pub auth_banner: Option<String>,
    /// How long to wait for each authentication message.
    pub auth_timeout: Duration,
    /// Channel defaults.
    pub channel: ChannelConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            host_keys: Vec::new(),
            modulus_pool: Arc::new(ModulusPool::with_defaults()),
            backend: Arc::new(SoftwareBackend::new()),
            max_auth_failures: 20,
            auth_banner: None,
            auth_timeout: Duration::from_secs(120),
            channel: ChannelConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Adds a host key.
    pub fn with_host_key(mut self, key: Arc<dyn HostKey>) -> Self {
        self.host_keys.push(key);
        self
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.host_keys.iter().map(|k| k.fingerprint()).collect();
        f.debug_struct("ServerConfig")
            .field("transport", &self.transport)
            .field("host_keys", &keys)
            .field("max_auth_failures", &self.max_auth_failures)
            .field("auth_banner", &self.auth_banner)
            .field("auth_timeout", &self.auth_timeout)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// SSH server listening on a TCP socket.
pub struct SshServer {
    listener: TcpListener,
    config: Arc<ServerConfig>,
    handler: Arc<dyn ServerHandler>,
}

impl SshServer {
    /// Binds with the default configuration and a freshly generated Ed25519 host key.
    ///
    /// Clients will see a new host key on every start; use
    /// [`SshServer::bind_with_config`] with a persistent key in production.
    pub async fn bind(addr: &str, handler: Arc<dyn ServerHandler>) -> ConchResult<Self> {
        let config = ServerConfig::default().with_host_key(Arc::new(Ed25519HostKey::generate()));
        Self::bind_with_config(addr, config, handler).await
    }

    /// Binds with a custom configuration.
    pub async fn bind_with_config(
        addr: &str,
        config: ServerConfig,
        handler: Arc<dyn ServerHandler>,
    ) -> ConchResult<Self> {
        if config.host_keys.is_empty() {
            return Err(ConchError::Config("Server needs at least one host key".to_string()));
        }
        let listener = TcpListener::bind(addr).await?;
        info!("SSH server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            config: Arc::new(config),
            handler,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ConchResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accepts one connection and starts its handshake on a separate task.
    ///
    /// Returns as soon as the TCP connection is up, so a slow or silent
    /// client never holds up the next `accept`.
    pub async fn accept(&self) -> ConchResult<PendingSession> {
        let (stream, peer) = self.listener.accept().await?;
        info!("Connection from {}", peer);
        stream.set_nodelay(true)?;
        let config = self.config.clone();
        let handler = self.handler.clone();
        let task = tokio::spawn(async move { ServerSession::new(stream, &config, handler).await });
        Ok(PendingSession { peer, task })
    }
}

impl std::fmt::Debug for SshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServer")
            .field("listener", &self.listener)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Connection whose key exchange and authentication are still running.
#[derive(Debug)]
pub struct PendingSession {
    peer: SocketAddr,
    task: JoinHandle<ConchResult<ServerSession>>,
}

impl PendingSession {
    /// Remote address of the connection.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// True once the handshake has finished, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the handshake and drops the connection.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Waits for the handshake and returns the authenticated session.
    pub async fn session(self) -> ConchResult<ServerSession> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ConchError::TransportClosed(format!(
                "Handshake with {} did not finish: {}",
                self.peer, e
            ))),
        }
    }
}

/// One authenticated client connection.
#[derive(Debug, Clone)]
pub struct ServerSession {
    transport: Transport,
    channels: Arc<ChannelManager>,
    username: String,
}

impl ServerSession {
    /// Runs the server side of the handshake and user authentication over `stream`.
    pub async fn new<S>(
        stream: S,
        config: &ServerConfig,
        handler: Arc<dyn ServerHandler>,
    ) -> ConchResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // 1. Version exchange and key exchange
        let transport = Transport::server(
            stream,
            config.transport.clone(),
            config.host_keys.clone(),
            config.modulus_pool.clone(),
            config.backend.clone(),
        )
        .await?;

        // 2. Channel table, registered right before USERAUTH_SUCCESS goes out
        let channels = ChannelManager::new(
            transport.clone(),
            Some(handler.clone()),
            config.channel.clone(),
        );
        let sink = channels.sink();

        // 3. User authentication
        let auth = ServerAuth {
            banner: config.auth_banner.clone(),
            max_failures: config.max_auth_failures,
            timeout: config.auth_timeout,
        };
        let result = auth
            .run(&transport, handler.as_ref(), |_| {
                transport.set_connection_sink(sink);
            })
            .await;

        match result {
            Ok(username) => Ok(Self {
                transport,
                channels,
                username,
            }),
            Err(e) => {
                warn!("Authentication ended: {}", e);
                if !transport.is_closed() {
                    let reason = match &e {
                        ConchError::Protocol(_) => disconnect::PROTOCOL_ERROR,
                        _ => disconnect::BY_APPLICATION,
                    };
                    let _ = transport.disconnect(reason, "Authentication failed").await;
                }
                Err(e)
            }
        }
    }

    /// Authenticated user name.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Channel table of this connection.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Waits for the next channel opened by the client and accepted by the handler.
    pub async fn accept(&self, wait: Option<Duration>) -> ConchResult<Channel> {
        self.channels.accept(wait).await
    }

    /// Starts a key re-exchange.
    pub async fn rekey(&self) -> ConchResult<()> {
        self.transport.rekey().await
    }

    /// Closes the connection.
    pub async fn disconnect(&self) -> ConchResult<()> {
        self.transport
            .disconnect(disconnect::BY_APPLICATION, "Server closing connection")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Defaults;

    impl ServerHandler for Defaults {}

    #[tokio::test]
    async fn test_default_handler_is_restrictive() {
        let handler = Defaults;
        assert_eq!(handler.allowed_auths("anyone"), vec!["publickey", "password"]);
        assert_eq!(handler.check_auth_none("anyone").await, AuthResult::Failure);
        assert_eq!(
            handler.check_auth_password("anyone", "secret").await,
            AuthResult::Failure
        );
        assert_eq!(
            handler.check_auth_interactive("anyone", "").await,
            InteractiveReply::Done(AuthResult::Failure)
        );
        assert!(handler.check_channel_open(&ChannelType::Session).await.is_ok());
        assert_eq!(
            handler
                .check_channel_open(&ChannelType::DirectTcpip {
                    host: "localhost".to_string(),
                    port: 22,
                    originator_address: "127.0.0.1".to_string(),
                    originator_port: 4000,
                })
                .await,
            Err(ChannelOpenFailureReason::AdministrativelyProhibited)
        );
        assert!(!handler.check_global_request("tcpip-forward", &[]).await);
    }

    #[tokio::test]
    async fn test_bind_requires_host_key() {
        let result =
            SshServer::bind_with_config("127.0.0.1:0", ServerConfig::default(), Arc::new(Defaults))
                .await;
        assert!(matches!(result, Err(ConchError::Config(_))));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = SshServer::bind("127.0.0.1:0", Arc::new(Defaults)).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_eq!(server.config().host_keys.len(), 1);
    }
}
