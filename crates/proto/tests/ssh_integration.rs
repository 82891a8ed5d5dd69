//! Integration tests for SSH client-server communication.
//!
//! These tests run both ends of a connection in one process, over an
//! in-memory pipe or loopback TCP, and validate:
//! - Key exchange (fixed group and group exchange) and rekeying
//! - Password, public key and keyboard-interactive authentication
//! - Session channels, flow control and exit status
//! - Failure paths: refused channels, timeouts, corrupted packets

use conch_platform::{ConchError, ConchResult};
use conch_proto::ssh::auth::{
    constant_time_eq, AuthMethod, AuthRequest, AuthResult, InteractiveQuery, InteractiveReply, Prompt,
};
use conch_proto::ssh::channel::Channel;
use conch_proto::ssh::client::{ClientConfig, SshClient};
use conch_proto::ssh::connection::{ChannelRequestType, ChannelType};
use conch_proto::ssh::hostkey::{Ed25519HostKey, HostKey, PinnedHostKeys};
use conch_proto::ssh::known_hosts::{HostKeyStatus, KnownHosts, StrictHostKeyChecking};
use conch_proto::ssh::message::disconnect;
use conch_proto::ssh::server::{ServerConfig, ServerHandler, ServerSession, SshServer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use zeroize::Zeroizing;

const USER: &str = "alice";
const PASSWORD: &str = "correct horse";
const WAIT: Duration = Duration::from_secs(10);
const PIPE_SIZE: usize = 1 << 20;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Server policy used by every test, tuned per test through its fields.
struct TestHandler {
    methods: Vec<String>,
    password_verdict: AuthResult,
    user_key: Option<Vec<u8>>,
    stall_password: bool,
    commands: mpsc::UnboundedSender<String>,
}

impl TestHandler {
    fn new(methods: &[&str]) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handler = Self {
            methods: methods.iter().map(|m| m.to_string()).collect(),
            password_verdict: AuthResult::Success,
            user_key: None,
            stall_password: false,
            commands,
        };
        (handler, rx)
    }
}

#[async_trait::async_trait]
impl ServerHandler for TestHandler {
    fn allowed_auths(&self, _username: &str) -> Vec<String> {
        self.methods.clone()
    }

    async fn check_auth_password(&self, username: &str, password: &str) -> AuthResult {
        if self.stall_password {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if username == USER && constant_time_eq(password, PASSWORD) {
            self.password_verdict
        } else {
            AuthResult::Failure
        }
    }

    async fn check_auth_publickey(&self, username: &str, _algorithm: &str, key_blob: &[u8]) -> AuthResult {
        match &self.user_key {
            Some(key) if username == USER && key.as_slice() == key_blob => AuthResult::Success,
            _ => AuthResult::Failure,
        }
    }

    async fn check_auth_interactive(&self, _username: &str, _submethods: &str) -> InteractiveReply {
        InteractiveReply::Query(InteractiveQuery {
            name: "Login".to_string(),
            instructions: "Enter your password".to_string(),
            prompts: vec![Prompt {
                prompt: "Password: ".to_string(),
                echo: false,
            }],
        })
    }

    async fn check_auth_interactive_response(
        &self,
        username: &str,
        responses: &[Zeroizing<String>],
    ) -> InteractiveReply {
        let ok = username == USER && responses.len() == 1 && constant_time_eq(&responses[0], PASSWORD);
        InteractiveReply::Done(if ok { AuthResult::Success } else { AuthResult::Failure })
    }

    async fn check_exec_request(&self, _channel: &Channel, command: &str) -> bool {
        self.commands.send(command.to_string()).is_ok()
    }

    async fn check_env_request(
        &self,
        _channel: &Channel,
        name: &str,
        _value: &str,
    ) -> bool {
        name == "LANG"
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn group1_client() -> ClientConfig {
    let mut config = ClientConfig::new(USER);
    config.transport.algorithms.kex = vec!["diffie-hellman-group1-sha1".to_string()];
    config
}

fn server_config() -> ServerConfig {
    ServerConfig::default().with_host_key(Arc::new(Ed25519HostKey::generate()))
}

/// Runs the handshake over the given streams; the server task then waits for authentication.
async fn connect_over<C, S>(
    client_io: C,
    server_io: S,
    client_config: ClientConfig,
    server_config: ServerConfig,
    handler: TestHandler,
) -> (SshClient, JoinHandle<ConchResult<ServerSession>>)
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    init_tracing();
    let server = tokio::spawn(async move {
        ServerSession::new(server_io, &server_config, Arc::new(handler)).await
    });
    let client = timeout(WAIT, SshClient::connect_stream(client_io, client_config))
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    (client, server)
}

async fn connect(
    client_config: ClientConfig,
    server_config: ServerConfig,
    handler: TestHandler,
) -> (SshClient, JoinHandle<ConchResult<ServerSession>>) {
    let (client_io, server_io) = tokio::io::duplex(PIPE_SIZE);
    connect_over(client_io, server_io, client_config, server_config, handler).await
}

/// Connects and authenticates with the password.
async fn logged_in(client_config: ClientConfig) -> (SshClient, ServerSession, mpsc::UnboundedReceiver<String>) {
    let (handler, commands) = TestHandler::new(&["password"]);
    let (client, server) = connect(client_config, server_config(), handler).await;
    client.auth_password(PASSWORD).await.expect("password rejected");
    let session = server.await.expect("server task panicked").expect("server auth failed");
    (client, session, commands)
}

/// Serves one exec request: fixed stdout and stderr, exit status 23.
async fn serve_greeting(
    session: &ServerSession,
    commands: &mut mpsc::UnboundedReceiver<String>,
) -> ConchResult<String> {
    let channel = session.accept(Some(WAIT)).await?;
    let command = commands.recv().await.ok_or(ConchError::ChannelClosed)?;
    channel.write(b"Hello there.\n").await?;
    channel.write_stderr(b"This is on stderr.\n").await?;
    channel.send_exit_status(23).await?;
    channel.send_eof().await?;
    channel.close().await?;
    Ok(command)
}

/// Runs "greet" from the client side and checks the greeting.
async fn run_greeting(client: &SshClient) -> ConchResult<()> {
    let channel = client.open_session().await?;
    channel.exec("greet").await?;
    assert_eq!(channel.read_to_end().await?, b"Hello there.\n");
    assert_eq!(channel.read_stderr_to_end().await?, b"This is on stderr.\n");
    assert_eq!(channel.exit_status().await?, 23);
    assert!(channel.eof_received());
    channel.close().await?;
    Ok(())
}

/// Full flow: group 1 key exchange, password auth, exec with output and exit status.
#[tokio::test]
async fn test_group1_password_exec() -> TestResult {
    let (client, session, mut commands) = logged_in(group1_client()).await;

    let negotiated = client.transport().negotiated().expect("negotiated algorithms");
    assert_eq!(negotiated.kex, "diffie-hellman-group1-sha1");
    assert_eq!(session.username(), USER);
    assert_eq!(client.transport().session_id(), session.transport().session_id());

    let (served, ran) = tokio::join!(serve_greeting(&session, &mut commands), run_greeting(&client));
    assert_eq!(served?, "greet");
    ran?;
    assert_eq!(client.channels().channel_count(), 0);

    client.disconnect().await?;
    timeout(WAIT, session.transport().closed()).await?;
    assert!(matches!(
        session.transport().closed_error(),
        ConchError::Disconnected { reason, .. } if reason == disconnect::BY_APPLICATION
    ));
    Ok(())
}

/// Same flow over loopback TCP with the default (group exchange) key exchange.
#[tokio::test]
async fn test_tcp_group_exchange() -> TestResult {
    init_tracing();
    let (handler, mut commands) = TestHandler::new(&["password"]);
    let server = SshServer::bind("127.0.0.1:0", Arc::new(handler)).await?;
    let addr = server.local_addr()?.to_string();

    let server_task = tokio::spawn(async move {
        let session = server.accept().await?.session().await?;
        serve_greeting(&session, &mut commands).await?;
        Ok::<_, ConchError>(session)
    });

    let client = SshClient::connect(&addr, ClientConfig::new(USER)).await?;
    assert_eq!(
        client.transport().negotiated().map(|n| n.kex),
        Some("diffie-hellman-group-exchange-sha256".to_string())
    );
    client.auth_password(PASSWORD).await?;
    let (stdout, stderr, status) = client.execute("greet").await?;
    assert_eq!(stdout, b"Hello there.\n");
    assert_eq!(stderr, b"This is on stderr.\n");
    assert_eq!(status, 23);

    let session = timeout(WAIT, server_task).await???;
    assert_eq!(session.username(), USER);
    Ok(())
}

/// A client that never sends its version line does not hold up the next accept.
#[tokio::test]
async fn test_stalled_handshake_does_not_block_accept() -> TestResult {
    init_tracing();
    let (handler, _commands) = TestHandler::new(&["password"]);
    let server = SshServer::bind("127.0.0.1:0", Arc::new(handler)).await?;
    let addr = server.local_addr()?.to_string();

    let silent = tokio::net::TcpStream::connect(&addr).await?;
    let stalled = timeout(WAIT, server.accept()).await??;
    assert_eq!(stalled.peer_addr(), silent.local_addr()?);

    let client_task = tokio::spawn(async move {
        let client = SshClient::connect(&addr, ClientConfig::new(USER)).await?;
        client.auth_password(PASSWORD).await?;
        Ok::<_, ConchError>(client)
    });
    let pending = timeout(WAIT, server.accept()).await??;
    let session = timeout(WAIT, pending.session()).await??;
    assert_eq!(session.username(), USER);
    let client = timeout(WAIT, client_task).await???;
    assert!(client.is_authenticated().await);

    assert!(!stalled.is_finished());
    stalled.abort();
    Ok(())
}

/// Rekeying from either side keeps the session identifier.
#[tokio::test]
async fn test_rekey_keeps_session_id() -> TestResult {
    let (client, session, mut commands) = logged_in(group1_client()).await;
    let session_id = client.transport().session_id();
    let first_hash = client.transport().exchange_hash();
    assert_eq!(client.transport().kex_rounds(), 1);

    client.rekey().await?;
    assert_eq!(client.transport().session_id(), session_id);
    assert_ne!(client.transport().exchange_hash(), first_hash);
    assert_eq!(client.transport().kex_rounds(), 2);

    session.rekey().await?;
    assert_eq!(session.transport().session_id(), session_id);
    assert_eq!(session.transport().kex_rounds(), 3);

    let (served, ran) = tokio::join!(serve_greeting(&session, &mut commands), run_greeting(&client));
    served?;
    ran?;
    Ok(())
}

/// A factor accepted with partial success must be followed by another method.
#[tokio::test]
async fn test_partial_success_multi_factor() -> TestResult {
    let user_key = Ed25519HostKey::generate();
    let (mut handler, _commands) = TestHandler::new(&["password", "publickey"]);
    handler.password_verdict = AuthResult::PartialSuccess;
    handler.user_key = Some(user_key.public_key_blob());

    let (client, server) = connect(group1_client(), server_config(), handler).await;

    match client.auth_password(PASSWORD).await {
        Err(ConchError::AuthFailed { allowed, partial }) => {
            assert!(partial);
            assert_eq!(allowed, vec!["publickey".to_string()]);
        }
        other => panic!("Expected partial success, got {:?}", other),
    }
    assert!(!client.is_authenticated().await);
    assert!(matches!(
        client.open_session().await,
        Err(ConchError::Config(_))
    ));

    client.auth_publickey(&user_key).await?;
    assert!(client.is_authenticated().await);
    assert_eq!(client.auth().await.attempted(), ["password", "publickey"]);

    let session = timeout(WAIT, server).await???;
    assert_eq!(session.username(), USER);
    Ok(())
}

/// A partial verdict on the last offered method never logs the user in.
#[tokio::test]
async fn test_partial_success_without_further_methods() -> TestResult {
    let (mut handler, _commands) = TestHandler::new(&["password"]);
    handler.password_verdict = AuthResult::PartialSuccess;
    let (client, server) = connect(group1_client(), server_config(), handler).await;

    match client.auth_password(PASSWORD).await {
        Err(ConchError::AuthFailed { allowed, partial }) => {
            assert!(partial);
            assert!(allowed.is_empty());
        }
        other => panic!("Expected failure without methods, got {:?}", other),
    }
    assert!(!client.is_authenticated().await);
    assert!(matches!(
        timeout(WAIT, server).await??,
        Err(ConchError::AuthExhausted)
    ));
    timeout(WAIT, client.transport().closed()).await?;
    assert!(matches!(
        client.auth_password(PASSWORD).await,
        Err(ConchError::AuthExhausted)
    ));
    Ok(())
}

/// Repeated "none" requests use up the failure budget like any other method.
#[tokio::test]
async fn test_none_requests_count_as_failures() -> TestResult {
    let (handler, _commands) = TestHandler::new(&["password"]);
    let mut server_config = server_config();
    server_config.max_auth_failures = 3;
    let (client, server) = connect(group1_client(), server_config, handler).await;

    for _ in 0..2 {
        assert!(matches!(
            client.auth_none().await,
            Err(ConchError::AuthFailed { partial: false, .. })
        ));
    }
    match client.auth_none().await {
        Err(ConchError::Disconnected { reason, .. }) => {
            assert_eq!(reason, disconnect::NO_MORE_AUTH_METHODS_AVAILABLE)
        }
        other => panic!("Expected disconnect, got {:?}", other),
    }
    assert!(matches!(
        timeout(WAIT, server).await??,
        Err(ConchError::AuthExhausted)
    ));
    Ok(())
}

/// Authentication requests after USERAUTH_SUCCESS are dropped and the session carries on.
#[tokio::test]
async fn test_auth_requests_after_login_are_ignored() -> TestResult {
    let (client, session, mut commands) = logged_in(group1_client()).await;
    assert!(session.transport().is_authenticated());
    assert!(client.transport().is_authenticated());

    let request = AuthRequest::new(
        USER,
        AuthMethod::Password {
            password: Zeroizing::new("guess".to_string()),
            new_password: None,
        },
    )
    .to_bytes();
    for _ in 0..200 {
        client.transport().send(&request).await?;
    }

    let (served, ran) = tokio::join!(serve_greeting(&session, &mut commands), run_greeting(&client));
    assert_eq!(served?, "greet");
    ran?;
    assert!(matches!(
        session.transport().recv_auth(Duration::from_millis(50)).await,
        Err(ConchError::Protocol(_))
    ));
    assert!(!session.transport().is_closed());
    Ok(())
}

/// A method the server did not advertise is refused locally with the allowed list.
#[tokio::test]
async fn test_unadvertised_method_rejected() -> TestResult {
    let (handler, _commands) = TestHandler::new(&["keyboard-interactive"]);
    let mut server_config = server_config();
    server_config.auth_banner = Some("Authorized users only\n".to_string());
    let (client, server) = connect(group1_client(), server_config, handler).await;

    match client.auth_none().await {
        Err(ConchError::AuthFailed { allowed, partial }) => {
            assert!(!partial);
            assert_eq!(allowed, vec!["keyboard-interactive".to_string()]);
        }
        other => panic!("Expected failure, got {:?}", other),
    }
    assert_eq!(client.auth().await.banner(), Some("Authorized users only\n"));

    match client.auth_password(PASSWORD).await {
        Err(ConchError::AuthMethodNotAllowed { method, allowed }) => {
            assert_eq!(method, "password");
            assert_eq!(allowed, vec!["keyboard-interactive".to_string()]);
        }
        other => panic!("Expected AuthMethodNotAllowed, got {:?}", other),
    }

    client.auth_interactive_dumb(PASSWORD).await?;
    assert!(client.is_authenticated().await);
    timeout(WAIT, server).await???;
    Ok(())
}

/// Interactive prompts are shown to the prompt handler.
#[tokio::test]
async fn test_keyboard_interactive_prompts() -> TestResult {
    let (handler, _commands) = TestHandler::new(&["keyboard-interactive"]);
    let (client, server) = connect(group1_client(), server_config(), handler).await;

    let mut seen = Vec::new();
    let mut answer = |query: &InteractiveQuery| {
        seen.push((query.name.clone(), query.prompts.clone()));
        vec![Zeroizing::new(PASSWORD.to_string())]
    };
    client.auth_keyboard_interactive(&mut answer).await?;

    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "Login");
    assert_eq!(seen[0].1[0].prompt, "Password: ");
    assert!(!seen[0].1[0].echo);
    timeout(WAIT, server).await???;
    Ok(())
}

/// Reaching the failure limit ends the connection with reason 14.
#[tokio::test]
async fn test_too_many_failures_disconnects() -> TestResult {
    let (handler, _commands) = TestHandler::new(&["password"]);
    let mut server_config = server_config();
    server_config.max_auth_failures = 2;
    let (client, server) = connect(group1_client(), server_config, handler).await;

    assert!(matches!(
        client.auth_password("wrong").await,
        Err(ConchError::AuthFailed { partial: false, .. })
    ));
    match client.auth_password("still wrong").await {
        Err(ConchError::Disconnected { reason, .. }) => {
            assert_eq!(reason, disconnect::NO_MORE_AUTH_METHODS_AVAILABLE)
        }
        other => panic!("Expected disconnect, got {:?}", other),
    }
    assert!(matches!(
        timeout(WAIT, server).await??,
        Err(ConchError::AuthExhausted)
    ));
    Ok(())
}

/// The first exit status wins and survives the channel's close.
#[tokio::test]
async fn test_exit_status_is_one_shot() -> TestResult {
    let (client, session, mut commands) = logged_in(group1_client()).await;

    let serve = async {
        let channel = session.accept(Some(WAIT)).await?;
        commands.recv().await.ok_or(ConchError::ChannelClosed)?;
        channel.send_exit_status(23).await?;
        let repeat = channel
            .send_request(ChannelRequestType::ExitStatus { exit_status: 0 }, true)
            .await;
        assert!(matches!(repeat, Err(ConchError::RequestFailed(_))));
        channel.send_eof().await?;
        channel.close().await?;
        Ok::<_, ConchError>(())
    };
    let run = async {
        let channel = client.open_session().await?;
        channel.exec("status").await?;
        assert_eq!(channel.read_to_end().await?, b"");
        assert_eq!(channel.exit_status().await?, 23);
        channel.close().await?;
        assert!(channel.is_closed());
        assert!(channel.exit_status_ready());
        assert_eq!(channel.exit_status().await?, 23);
        Ok::<_, ConchError>(())
    };
    let (served, ran) = tokio::join!(serve, run);
    served?;
    ran?;
    Ok(())
}

/// The server's refusal reason reaches the opener.
#[tokio::test]
async fn test_channel_open_failure_reason() -> TestResult {
    let (client, _session, _commands) = logged_in(group1_client()).await;

    let result = client
        .open_channel(ChannelType::DirectTcpip {
            host: "internal.example".to_string(),
            port: 80,
            originator_address: "127.0.0.1".to_string(),
            originator_port: 50000,
        })
        .await;
    match result {
        Err(ConchError::ChannelOpen { reason, .. }) => assert_eq!(reason, 1),
        other => panic!("Expected open failure, got {:?}", other),
    }
    assert_eq!(client.channels().channel_count(), 0);

    // The connection is still usable
    let channel = client.open_session().await?;
    assert!(!channel.is_closed());
    Ok(())
}

/// Refused channel and global requests surface as RequestFailed.
#[tokio::test]
async fn test_refused_requests() -> TestResult {
    let (client, session, _commands) = logged_in(group1_client()).await;
    let channel = client.open_session().await?;
    let served = session.accept(Some(WAIT)).await?;
    assert_eq!(served.remote_id(), channel.local_id());

    channel.send_env("LANG", "C").await?;
    assert!(matches!(
        channel.send_env("PATH", "/tmp").await,
        Err(ConchError::RequestFailed(name)) if name == "env"
    ));
    assert!(matches!(
        channel.request_pty("xterm", 80, 24, &[]).await,
        Err(ConchError::RequestFailed(_))
    ));
    assert!(matches!(
        client
            .global_request("tcpip-forward", true, b"\x00\x00\x00\x00\x00\x00\x1f\x90", Some(WAIT))
            .await,
        Err(ConchError::RequestFailed(_))
    ));
    Ok(())
}

/// A writer blocks once the receiver's window is used up and resumes on adjust.
#[tokio::test]
async fn test_window_blocks_writer() -> TestResult {
    let mut config = group1_client();
    config.channel.window_size = 1024;
    let (client, session, _commands) = logged_in(config).await;

    let channel = client.open_session().await?;
    let served = session.accept(Some(WAIT)).await?;
    assert_eq!(served.send_window(), 1024);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = {
        let served = served.clone();
        tokio::spawn(async move {
            served.write(&payload).await?;
            served.send_eof().await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());
    assert_eq!(served.send_window(), 0);

    let received = timeout(WAIT, channel.read_to_end()).await??;
    assert_eq!(received, expected);
    timeout(WAIT, writer).await???;
    Ok(())
}

/// Waits give up with Timeout instead of hanging.
#[tokio::test]
async fn test_timeouts() -> TestResult {
    // Authentication answer never arrives
    let (mut handler, _commands) = TestHandler::new(&["password"]);
    handler.stall_password = true;
    let mut config = group1_client();
    config.auth_timeout = Duration::from_millis(200);
    let (client, server) = connect(config, server_config(), handler).await;
    assert!(matches!(
        client.auth_password(PASSWORD).await,
        Err(ConchError::Timeout(_))
    ));
    server.abort();

    // Channel read with nothing to read
    let (client, _session, _commands) = logged_in(group1_client()).await;
    let mut channel = client.open_session().await?;
    channel.set_timeout(Some(Duration::from_millis(100)));
    assert!(matches!(channel.read().await, Err(ConchError::Timeout(_))));
    assert!(matches!(channel.exit_status().await, Err(ConchError::Timeout(_))));
    Ok(())
}

/// An unknown host key is rejected by a pinned verifier.
#[tokio::test]
async fn test_pinned_host_key() -> TestResult {
    let host_key = Arc::new(Ed25519HostKey::generate());
    let other = Ed25519HostKey::generate();

    let (client_io, server_io) = tokio::io::duplex(PIPE_SIZE);
    let server_config = ServerConfig::default().with_host_key(host_key.clone());
    let (handler, _commands) = TestHandler::new(&["password"]);
    let server = tokio::spawn(async move {
        ServerSession::new(server_io, &server_config, Arc::new(handler)).await
    });

    let config = group1_client().with_verifier(Arc::new(PinnedHostKeys::new(vec![other.public_key_blob()])));
    let result = SshClient::connect_stream(client_io, config).await;
    assert!(matches!(result, Err(ConchError::Trust(_))));
    assert!(timeout(WAIT, server).await??.is_err());

    // The right pin is accepted
    let (handler, _commands) = TestHandler::new(&["password"]);
    let config = group1_client().with_verifier(Arc::new(PinnedHostKeys::new(vec![host_key.public_key_blob()])));
    let (client, _server) = connect(
        config,
        ServerConfig::default().with_host_key(host_key.clone()),
        handler,
    )
    .await;
    assert_eq!(client.transport().server_host_key(), Some(host_key.public_key_blob()));
    Ok(())
}

/// A known-hosts verifier learns an unknown server once, then keeps trusting it.
#[tokio::test]
async fn test_known_hosts_accept_new() -> TestResult {
    let host_key = Arc::new(Ed25519HostKey::generate());
    let learning = Arc::new(KnownHosts::new().verifier(
        "server.test",
        22,
        StrictHostKeyChecking::AcceptNew,
    ));

    let (handler, _commands) = TestHandler::new(&["password"]);
    let (_client, _server) = connect(
        group1_client().with_verifier(learning.clone()),
        ServerConfig::default().with_host_key(host_key.clone()),
        handler,
    )
    .await;
    let learned = learning.known_hosts();
    assert_eq!(
        learned.check("server.test", 22, &host_key.public_key_blob()),
        HostKeyStatus::Known
    );

    // A different key for the same host is refused
    let (client_io, server_io) = tokio::io::duplex(PIPE_SIZE);
    let server_config = server_config();
    let (handler, _commands) = TestHandler::new(&["password"]);
    let server = tokio::spawn(async move {
        ServerSession::new(server_io, &server_config, Arc::new(handler)).await
    });
    let strict = learned.verifier("server.test", 22, StrictHostKeyChecking::Strict);
    let result = SshClient::connect_stream(client_io, group1_client().with_verifier(Arc::new(strict))).await;
    assert!(matches!(result, Err(ConchError::Trust(_))));
    assert!(timeout(WAIT, server).await??.is_err());
    Ok(())
}

/// Pipe whose client-to-server direction flips the last byte of one chunk when armed.
fn corrupting_pipe(armed: Arc<AtomicBool>) -> (DuplexStream, DuplexStream) {
    let (client_io, proxy_client) = tokio::io::duplex(PIPE_SIZE);
    let (proxy_server, server_io) = tokio::io::duplex(PIPE_SIZE);
    tokio::spawn(async move {
        let (mut from_client, mut to_client) = tokio::io::split(proxy_client);
        let (mut from_server, mut to_server) = tokio::io::split(proxy_server);
        let upstream = async {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = from_client.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, std::io::Error>(());
                }
                if armed.swap(false, Ordering::SeqCst) {
                    buf[n - 1] ^= 0x01;
                }
                to_server.write_all(&buf[..n]).await?;
            }
        };
        let downstream = tokio::io::copy(&mut from_server, &mut to_client);
        let _ = tokio::join!(upstream, downstream);
    });
    (client_io, server_io)
}

/// A packet failing MAC verification kills the connection.
#[tokio::test]
async fn test_corrupted_mac_is_fatal() -> TestResult {
    let armed = Arc::new(AtomicBool::new(false));
    let (client_io, server_io) = corrupting_pipe(armed.clone());
    let (handler, _commands) = TestHandler::new(&["password"]);
    let (client, server) = connect_over(client_io, server_io, group1_client(), server_config(), handler).await;
    client.auth_password(PASSWORD).await?;
    let session = timeout(WAIT, server).await???;

    armed.store(true, Ordering::SeqCst);
    client.send_keepalive().await?;

    timeout(WAIT, session.transport().closed()).await?;
    assert!(matches!(
        session.transport().closed_error(),
        ConchError::Integrity(_)
    ));

    timeout(WAIT, client.transport().closed()).await?;
    let err = client.transport().closed_error();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        ConchError::Disconnected { reason, .. } if reason == disconnect::MAC_ERROR
    ));
    assert!(client.open_session().await.is_err());
    Ok(())
}
