//! SSH client.
//!
//! [`SshClient`] connects, runs the key exchange, verifies the server's host
//! key through the configured [`HostKeyVerifier`], and then offers user
//! authentication and session channels.
//!
//! # Example
//!
//! ```rust,no_run
//! use conch_proto::ssh::client::{ClientConfig, SshClient};
//!
//! # #[tokio::main]
//! # async fn main() -> conch_platform::ConchResult<()> {
//! let config = ClientConfig::new("alice");
//! let client = SshClient::connect("127.0.0.1:22", config).await?;
//! client.auth_password("password").await?;
//!
//! let channel = client.open_session().await?;
//! channel.exec("ls -la").await?;
//! let output = channel.read_to_end().await?;
//! println!("{}", String::from_utf8_lossy(&output));
//! println!("exit status {}", channel.exit_status().await?);
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! The default verifier accepts any host key. Use [`PinnedHostKeys`] (or an
//! own [`HostKeyVerifier`]) for anything beyond testing.
//!
//! [`PinnedHostKeys`]: crate::ssh::hostkey::PinnedHostKeys

use crate::ssh::auth::{AuthSession, PromptHandler};
use crate::ssh::channel::{Channel, ChannelConfig, ChannelManager};
use crate::ssh::connection::ChannelType;
use crate::ssh::crypto::SoftwareBackend;
use crate::ssh::hostkey::{AcceptAnyHostKey, HostKey, HostKeyVerifier};
use crate::ssh::message::disconnect;
use crate::ssh::transport::{Transport, TransportConfig};
use conch_platform::{ConchError, ConchResult, CryptoBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

/// SSH client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Transport settings.
    pub transport: TransportConfig,
    /// User to authenticate as.
    pub username: String,
    /// Host key policy, consulted after the signature has been verified.
    pub verifier: Arc<dyn HostKeyVerifier>,
    /// Cryptographic primitives.
    pub backend: Arc<dyn CryptoBackend>,
    /// How long to wait for each authentication answer.
    pub auth_timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Channel defaults (window, max packet, open timeout).
    pub channel: ChannelConfig,
}

impl ClientConfig {
    /// Default configuration for `username`.
    pub fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            ..Self::default()
        }
    }

    /// Replaces the host key policy.
    pub fn with_verifier(mut self, verifier: Arc<dyn HostKeyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            username: String::new(),
            verifier: Arc::new(AcceptAnyHostKey),
            backend: Arc::new(SoftwareBackend::new()),
            auth_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            channel: ChannelConfig::default(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("transport", &self.transport)
            .field("username", &self.username)
            .field("auth_timeout", &self.auth_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// SSH client connection.
#[derive(Debug)]
pub struct SshClient {
    transport: Transport,
    auth: Mutex<AuthSession>,
    channels: Arc<ChannelManager>,
}

impl SshClient {
    /// Connects to `addr` over TCP.
    pub async fn connect(addr: &str, config: ClientConfig) -> ConchResult<Self> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConchError::Timeout(format!("Connecting to {}", addr)))??;
        stream.set_nodelay(true)?;
        info!("Connected to {}", addr);
        Self::connect_stream(stream, config).await
    }

    /// Runs the handshake over an already connected stream.
    pub async fn connect_stream<S>(stream: S, config: ClientConfig) -> ConchResult<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let transport = Transport::client(
            stream,
            config.transport.clone(),
            config.verifier.clone(),
            config.backend.clone(),
        )
        .await?;

        let channels = ChannelManager::new(transport.clone(), None, config.channel.clone());
        transport.set_connection_sink(channels.sink());

        let auth = AuthSession::new(transport.clone(), &config.username, config.auth_timeout);
        Ok(Self {
            transport,
            auth: Mutex::new(auth),
            channels,
        })
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Channel table of this connection.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.channels
    }

    /// Authentication state, for methods not covered by the shortcuts below.
    pub async fn auth(&self) -> MutexGuard<'_, AuthSession> {
        self.auth.lock().await
    }

    /// Whether authentication has completed.
    pub async fn is_authenticated(&self) -> bool {
        self.auth.lock().await.is_authenticated()
    }

    /// See [`AuthSession::auth_none`].
    pub async fn auth_none(&self) -> ConchResult<()> {
        self.auth.lock().await.auth_none().await
    }

    /// See [`AuthSession::auth_password`].
    pub async fn auth_password(&self, password: &str) -> ConchResult<()> {
        self.auth.lock().await.auth_password(password).await
    }

    /// See [`AuthSession::auth_publickey`].
    pub async fn auth_publickey(&self, key: &dyn HostKey) -> ConchResult<()> {
        self.auth.lock().await.auth_publickey(key).await
    }

    /// See [`AuthSession::auth_keyboard_interactive`].
    pub async fn auth_keyboard_interactive(
        &self,
        prompts: &mut dyn PromptHandler,
    ) -> ConchResult<()> {
        self.auth
            .lock()
            .await
            .auth_keyboard_interactive(prompts)
            .await
    }

    /// See [`AuthSession::auth_interactive_dumb`].
    pub async fn auth_interactive_dumb(&self, password: &str) -> ConchResult<()> {
        self.auth.lock().await.auth_interactive_dumb(password).await
    }

    async fn ensure_authenticated(&self) -> ConchResult<()> {
        if self.is_authenticated().await {
            Ok(())
        } else {
            Err(ConchError::Config(
                "Channels require a completed authentication".to_string(),
            ))
        }
    }

    /// Opens a session channel.
    pub async fn open_session(&self) -> ConchResult<Channel> {
        self.open_channel(ChannelType::Session).await
    }

    /// Opens a channel of any type.
    pub async fn open_channel(&self, channel_type: ChannelType) -> ConchResult<Channel> {
        self.ensure_authenticated().await?;
        self.channels.open_channel(channel_type).await
    }

    /// Sends a global request, returning the reply data on success.
    pub async fn global_request(
        &self,
        name: &str,
        want_reply: bool,
        data: &[u8],
        wait: Option<Duration>,
    ) -> ConchResult<Option<Vec<u8>>> {
        self.ensure_authenticated().await?;
        self.channels
            .global_request(name, want_reply, data, wait)
            .await
    }

    /// Runs `command` on a fresh session channel and collects its output.
    ///
    /// Returns (stdout, stderr, exit status). Stderr is only drained after
    /// stdout, so a command writing more than one window to stderr stalls.
    pub async fn execute(&self, command: &str) -> ConchResult<(Vec<u8>, Vec<u8>, u32)> {
        let channel = self.open_session().await?;
        channel.exec(command).await?;
        let stdout = channel.read_to_end().await?;
        let stderr = channel.read_stderr_to_end().await?;
        let status = channel.exit_status().await?;
        channel.close().await?;
        Ok((stdout, stderr, status))
    }

    /// Sends an IGNORE message to keep idle connections alive.
    pub async fn send_keepalive(&self) -> ConchResult<()> {
        self.transport.send_ignore(b"").await
    }

    /// Starts a key re-exchange.
    pub async fn rekey(&self) -> ConchResult<()> {
        self.transport.rekey().await
    }

    /// Closes the connection.
    pub async fn disconnect(&self) -> ConchResult<()> {
        self.transport
            .disconnect(disconnect::BY_APPLICATION, "Client closing connection")
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::new("alice");
        assert_eq!(config.username, "alice");
        assert_eq!(config.auth_timeout, Duration::from_secs(30));
        assert_eq!(config.channel.window_size, 2 * 1024 * 1024);
        assert!(config.verifier.verify("ssh-ed25519", b"anything"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let result = SshClient::connect(&addr, ClientConfig::new("alice")).await;
        assert!(matches!(result, Err(ConchError::Io(_))));
    }
}
