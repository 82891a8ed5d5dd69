//! SSH authentication protocol (RFC 4252, RFC 4256).
//!
//! This module implements user authentication for both roles:
//! - "none" - Asks the server for its method list
//! - "password" - Password authentication
//! - "publickey" - Query with PK_OK, then a signed request
//! - "keyboard-interactive" - Server-driven prompts
//!
//! # Client
//!
//! [`AuthSession`] tracks the methods the server still accepts. A method the
//! server did not advertise is refused locally with
//! [`ConchError::AuthMethodNotAllowed`], carrying the list so the caller can
//! pick an alternative. A failure with partial success means the method was
//! accepted but another factor is required.
//!
//! # Server
//!
//! [`ServerAuth`] runs the request loop against a [`ServerHandler`] until the
//! user is authenticated or the failure limit is reached, at which point the
//! connection is dropped with reason 14 (no more auth methods available).
//!
//! # Security
//!
//! - **Signature binding** - public-key signatures cover the session identifier
//! - **Zeroized secrets** - passwords are wiped from memory when dropped
//! - **Constant-time comparison** - [`constant_time_eq`] for password checks
//!
//! # Example
//!
//! ```rust,no_run
//! use conch_proto::ssh::auth::AuthSession;
//! use conch_proto::ssh::transport::Transport;
//! use conch_platform::ConchError;
//! use std::time::Duration;
//!
//! # async fn example(transport: Transport) -> conch_platform::ConchResult<()> {
//! let mut auth = AuthSession::new(transport, "alice", Duration::from_secs(30));
//! match auth.auth_password("secret").await {
//!     Ok(()) => println!("authenticated"),
//!     Err(ConchError::AuthMethodNotAllowed { allowed, .. }) if allowed.iter().any(|m| m == "keyboard-interactive") => {
//!         auth.auth_interactive_dumb("secret").await?;
//!     }
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

use crate::ssh::hostkey::{verify_host_signature, HostKey};
use crate::ssh::kex::SUPPORTED_HOST_KEYS;
use crate::ssh::message::{auth_codes, describe, disconnect, MessageType};
use crate::ssh::server::ServerHandler;
use crate::ssh::transport::Transport;
use crate::ssh::wire::{message, SshBufMut, WireReader};
use bytes::BufMut;
use conch_platform::{ConchError, ConchResult};
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Service started after authentication.
pub const CONNECTION_SERVICE: &str = "ssh-connection";

/// Method-specific part of an authentication request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// "none"
    None,
    /// "password", optionally changing it
    Password {
        /// Current password
        password: Zeroizing<String>,
        /// Replacement password (change request)
        new_password: Option<Zeroizing<String>>,
    },
    /// "publickey"
    PublicKey {
        /// Algorithm name (e.g., "ssh-ed25519")
        algorithm: String,
        /// Public key blob
        key_blob: Vec<u8>,
        /// Signature; absent for a query
        signature: Option<Vec<u8>>,
    },
    /// "keyboard-interactive"
    KeyboardInteractive {
        /// Language tag (deprecated, usually empty)
        language: String,
        /// Comma-separated submethod hints
        submethods: String,
    },
}

impl AuthMethod {
    /// Returns the method name.
    pub fn name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::PublicKey { .. } => "publickey",
            AuthMethod::KeyboardInteractive { .. } => "keyboard-interactive",
        }
    }
}

/// SSH_MSG_USERAUTH_REQUEST message (RFC 4252 Section 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// User name
    pub username: String,
    /// Service name (usually "ssh-connection")
    pub service: String,
    /// Authentication method
    pub method: AuthMethod,
}

impl AuthRequest {
    /// Creates a new authentication request for the connection service.
    pub fn new(username: &str, method: AuthMethod) -> Self {
        Self {
            username: username.to_string(),
            service: CONNECTION_SERVICE.to_string(),
            method,
        }
    }

    /// Serializes the authentication request.
    ///
    /// Format (RFC 4252 Section 5):
    /// ```text
    /// byte      SSH_MSG_USERAUTH_REQUEST (50)
    /// string    user name
    /// string    service name
    /// string    method name
    /// ....      method specific fields
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::UserauthRequest as u8);
        buf.put_ssh_string(self.username.as_bytes());
        buf.put_ssh_string(self.service.as_bytes());
        buf.put_ssh_string(self.method.name().as_bytes());

        match &self.method {
            AuthMethod::None => {}
            AuthMethod::Password {
                password,
                new_password,
            } => {
                buf.put_ssh_bool(new_password.is_some());
                buf.put_ssh_string(password.as_bytes());
                if let Some(new_password) = new_password {
                    buf.put_ssh_string(new_password.as_bytes());
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                key_blob,
                signature,
            } => {
                buf.put_ssh_bool(signature.is_some());
                buf.put_ssh_string(algorithm.as_bytes());
                buf.put_ssh_string(key_blob);
                if let Some(sig) = signature {
                    buf.put_ssh_string(sig);
                }
            }
            AuthMethod::KeyboardInteractive {
                language,
                submethods,
            } => {
                buf.put_ssh_string(language.as_bytes());
                buf.put_ssh_string(submethods.as_bytes());
            }
        }
        buf.to_vec()
    }

    /// Parses an authentication request (including the type byte).
    ///
    /// Unknown method names parse as an error.
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        let msg_type = r.read_u8()?;
        if msg_type != MessageType::UserauthRequest as u8 {
            return Err(ConchError::Protocol(format!(
                "Invalid message type: expected 50 (SSH_MSG_USERAUTH_REQUEST), got {}",
                msg_type
            )));
        }
        let username = r.read_utf8()?;
        let service = r.read_utf8()?;
        let method_name = r.read_utf8()?;

        let method = match method_name.as_str() {
            "none" => AuthMethod::None,
            "password" => {
                let changing = r.read_bool()?;
                let password = Zeroizing::new(r.read_utf8()?);
                let new_password = if changing {
                    Some(Zeroizing::new(r.read_utf8()?))
                } else {
                    None
                };
                AuthMethod::Password {
                    password,
                    new_password,
                }
            }
            "publickey" => {
                let signed = r.read_bool()?;
                let algorithm = r.read_utf8()?;
                let key_blob = r.read_string()?.to_vec();
                let signature = if signed {
                    Some(r.read_string()?.to_vec())
                } else {
                    None
                };
                AuthMethod::PublicKey {
                    algorithm,
                    key_blob,
                    signature,
                }
            }
            "keyboard-interactive" => AuthMethod::KeyboardInteractive {
                language: r.read_utf8()?,
                submethods: r.read_utf8()?,
            },
            other => {
                return Err(ConchError::Protocol(format!(
                    "Unknown authentication method: {}",
                    other
                )))
            }
        };

        Ok(Self {
            username,
            service,
            method,
        })
    }
}

/// SSH_MSG_USERAUTH_FAILURE message (RFC 4252 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    /// Methods that can continue
    pub methods: Vec<String>,
    /// Whether the attempted method succeeded but more are required
    pub partial_success: bool,
}

impl AuthFailure {
    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(MessageType::UserauthFailure as u8);
        buf.put_name_list(&self.methods);
        buf.put_ssh_bool(self.partial_success);
        buf.to_vec()
    }

    /// Parses a message payload (including the type byte).
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        let msg_type = r.read_u8()?;
        if msg_type != MessageType::UserauthFailure as u8 {
            return Err(ConchError::Protocol(format!(
                "Invalid message type: expected 51 (SSH_MSG_USERAUTH_FAILURE), got {}",
                msg_type
            )));
        }
        Ok(Self {
            methods: r.read_name_list()?,
            partial_success: r.read_bool()?,
        })
    }
}

/// SSH_MSG_USERAUTH_BANNER payload.
pub fn banner_message(text: &str) -> Vec<u8> {
    let mut buf = message(MessageType::UserauthBanner as u8);
    buf.put_ssh_string(text.as_bytes());
    buf.put_ssh_string(b"");
    buf.to_vec()
}

/// SSH_MSG_USERAUTH_PK_OK payload.
pub fn pk_ok_message(algorithm: &str, key_blob: &[u8]) -> Vec<u8> {
    let mut buf = message(auth_codes::USERAUTH_PK_OK);
    buf.put_ssh_string(algorithm.as_bytes());
    buf.put_ssh_string(key_blob);
    buf.to_vec()
}

/// One keyboard-interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Prompt text
    pub prompt: String,
    /// Whether the answer may be echoed
    pub echo: bool,
}

/// SSH_MSG_USERAUTH_INFO_REQUEST (RFC 4256 Section 3.2).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InteractiveQuery {
    /// Query name (title)
    pub name: String,
    /// Instructions for the user
    pub instructions: String,
    /// Prompts in order
    pub prompts: Vec<Prompt>,
}

impl InteractiveQuery {
    /// Serializes to a message payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = message(auth_codes::USERAUTH_INFO_REQUEST);
        buf.put_ssh_string(self.name.as_bytes());
        buf.put_ssh_string(self.instructions.as_bytes());
        buf.put_ssh_string(b"");
        buf.put_u32(self.prompts.len() as u32);
        for prompt in &self.prompts {
            buf.put_ssh_string(prompt.prompt.as_bytes());
            buf.put_ssh_bool(prompt.echo);
        }
        buf.to_vec()
    }

    /// Parses a message payload (including the type byte).
    pub fn from_bytes(data: &[u8]) -> ConchResult<Self> {
        let mut r = WireReader::new(data);
        r.read_u8()?;
        let name = r.read_utf8()?;
        let instructions = r.read_utf8()?;
        let _language = r.read_string()?;
        let count = r.read_u32()? as usize;
        if count > r.remaining() {
            return Err(ConchError::Protocol(format!(
                "INFO_REQUEST claims {} prompts",
                count
            )));
        }
        let mut prompts = Vec::with_capacity(count);
        for _ in 0..count {
            prompts.push(Prompt {
                prompt: r.read_utf8()?,
                echo: r.read_bool()?,
            });
        }
        Ok(Self {
            name,
            instructions,
            prompts,
        })
    }
}

/// SSH_MSG_USERAUTH_INFO_RESPONSE payload.
pub fn info_response_message(responses: &[Zeroizing<String>]) -> Vec<u8> {
    let mut buf = message(auth_codes::USERAUTH_INFO_RESPONSE);
    buf.put_u32(responses.len() as u32);
    for response in responses {
        buf.put_ssh_string(response.as_bytes());
    }
    buf.to_vec()
}

/// Parses SSH_MSG_USERAUTH_INFO_RESPONSE (including the type byte).
pub fn parse_info_response(data: &[u8]) -> ConchResult<Vec<Zeroizing<String>>> {
    let mut r = WireReader::new(data);
    let msg_type = r.read_u8()?;
    if msg_type != auth_codes::USERAUTH_INFO_RESPONSE {
        return Err(ConchError::Protocol(format!(
            "Expected USERAUTH_INFO_RESPONSE, got {}",
            describe(msg_type)
        )));
    }
    let count = r.read_u32()? as usize;
    if count > r.remaining() {
        return Err(ConchError::Protocol(format!(
            "INFO_RESPONSE claims {} answers",
            count
        )));
    }
    let mut responses = Vec::with_capacity(count);
    for _ in 0..count {
        responses.push(Zeroizing::new(r.read_utf8()?));
    }
    Ok(responses)
}

/// Data signed for public key authentication (RFC 4252 Section 7).
///
/// ```text
/// string    session identifier
/// byte      SSH_MSG_USERAUTH_REQUEST
/// string    user name
/// string    service name
/// string    "publickey"
/// boolean   TRUE
/// string    public key algorithm name
/// string    public key blob
/// ```
pub fn signature_data(
    session_id: &[u8],
    username: &str,
    service: &str,
    algorithm: &str,
    key_blob: &[u8],
) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_ssh_string(session_id);
    buf.put_u8(MessageType::UserauthRequest as u8);
    buf.put_ssh_string(username.as_bytes());
    buf.put_ssh_string(service.as_bytes());
    buf.put_ssh_string(b"publickey");
    buf.put_ssh_bool(true);
    buf.put_ssh_string(algorithm.as_bytes());
    buf.put_ssh_string(key_blob);
    buf
}

/// Constant-time string comparison.
///
/// The length check leaks only whether lengths differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Answers keyboard-interactive queries on the client.
pub trait PromptHandler: Send {
    /// Returns one answer per prompt, in order.
    fn respond(&mut self, query: &InteractiveQuery) -> Vec<Zeroizing<String>>;
}

impl<F> PromptHandler for F
where
    F: FnMut(&InteractiveQuery) -> Vec<Zeroizing<String>> + Send,
{
    fn respond(&mut self, query: &InteractiveQuery) -> Vec<Zeroizing<String>> {
        self(query)
    }
}

/// Client side of user authentication for one user name.
#[derive(Debug)]
pub struct AuthSession {
    transport: Transport,
    username: String,
    timeout: Duration,
    service_requested: bool,
    allowed: Option<Vec<String>>,
    attempted: Vec<String>,
    partial_success: bool,
    authenticated: bool,
    banner: Option<String>,
}

impl AuthSession {
    /// Creates a session; `timeout` bounds each wait for a server answer.
    pub fn new(transport: Transport, username: &str, timeout: Duration) -> Self {
        Self {
            transport,
            username: username.to_string(),
            timeout,
            service_requested: false,
            allowed: None,
            attempted: Vec::new(),
            partial_success: false,
            authenticated: false,
            banner: None,
        }
    }

    /// User name being authenticated.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Whether the server has answered with unconditional success.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Methods the server said can continue (unknown until the first failure).
    pub fn allowed_methods(&self) -> Option<&[String]> {
        self.allowed.as_deref()
    }

    /// Methods tried so far, in order.
    pub fn attempted(&self) -> &[String] {
        &self.attempted
    }

    /// Whether at least one factor has been accepted.
    pub fn partial_success(&self) -> bool {
        self.partial_success
    }

    /// Last banner sent by the server.
    pub fn banner(&self) -> Option<&str> {
        self.banner.as_deref()
    }

    async fn begin(&mut self, method: &str) -> ConchResult<()> {
        if method != "none" {
            if let Some(allowed) = &self.allowed {
                if allowed.is_empty() {
                    return Err(ConchError::AuthExhausted);
                }
                if !allowed.iter().any(|m| m == method) {
                    return Err(ConchError::AuthMethodNotAllowed {
                        method: method.to_string(),
                        allowed: allowed.clone(),
                    });
                }
            }
        }
        if !self.service_requested {
            self.transport
                .request_service("ssh-userauth", self.timeout)
                .await?;
            self.service_requested = true;
        }
        self.attempted.push(method.to_string());
        debug!("Trying {} authentication for {}", method, self.username);
        Ok(())
    }

    async fn send(&self, method: AuthMethod) -> ConchResult<()> {
        let request = AuthRequest::new(&self.username, method);
        self.transport.send(&request.to_bytes()).await
    }

    /// Next authentication message, collecting banners on the way.
    async fn recv(&mut self) -> ConchResult<Vec<u8>> {
        loop {
            let msg = self.transport.recv_auth(self.timeout).await?;
            if msg[0] == MessageType::UserauthBanner as u8 {
                let text = WireReader::new(&msg[1..]).read_utf8()?;
                info!("Server banner: {}", text.trim_end());
                self.banner = Some(text);
                continue;
            }
            return Ok(msg);
        }
    }

    /// Handles SUCCESS or FAILURE.
    fn verdict(&mut self, method: &str, msg: &[u8]) -> ConchResult<()> {
        match MessageType::from_u8(msg[0]) {
            Some(MessageType::UserauthSuccess) => {
                info!("Authenticated {} with {}", self.username, method);
                self.authenticated = true;
                self.transport.set_authenticated();
                Ok(())
            }
            Some(MessageType::UserauthFailure) => {
                let failure = AuthFailure::from_bytes(msg)?;
                if failure.partial_success {
                    self.partial_success = true;
                    info!(
                        "{} accepted, further authentication required: {}",
                        method,
                        failure.methods.join(",")
                    );
                } else {
                    warn!("{} authentication failed for {}", method, self.username);
                }
                self.allowed = Some(failure.methods.clone());
                Err(ConchError::AuthFailed {
                    allowed: failure.methods,
                    partial: failure.partial_success,
                })
            }
            _ => Err(ConchError::Protocol(format!(
                "Unexpected {} during {} authentication",
                describe(msg[0]),
                method
            ))),
        }
    }

    /// Tries "none", which usually fails and reveals the method list.
    pub async fn auth_none(&mut self) -> ConchResult<()> {
        if self.authenticated {
            return Ok(());
        }
        self.begin("none").await?;
        self.send(AuthMethod::None).await?;
        let reply = self.recv().await?;
        self.verdict("none", &reply)
    }

    /// Password authentication.
    ///
    /// A password change request from the server is reported as a failure.
    pub async fn auth_password(&mut self, password: &str) -> ConchResult<()> {
        if self.authenticated {
            return Ok(());
        }
        self.begin("password").await?;
        self.send(AuthMethod::Password {
            password: Zeroizing::new(password.to_string()),
            new_password: None,
        })
        .await?;
        let reply = self.recv().await?;
        if reply[0] == auth_codes::USERAUTH_PASSWD_CHANGEREQ {
            let prompt = WireReader::new(&reply[1..]).read_utf8()?;
            warn!("Server requests a password change: {}", prompt);
            return Err(ConchError::AuthFailed {
                allowed: self.allowed.clone().unwrap_or_default(),
                partial: false,
            });
        }
        self.verdict("password", &reply)
    }

    /// Public key authentication: a query, then the signed request once the
    /// server answers PK_OK.
    pub async fn auth_publickey(&mut self, key: &dyn HostKey) -> ConchResult<()> {
        if self.authenticated {
            return Ok(());
        }
        self.begin("publickey").await?;
        let algorithm = key.algorithm().to_string();
        let key_blob = key.public_key_blob();

        // 1. Query
        self.send(AuthMethod::PublicKey {
            algorithm: algorithm.clone(),
            key_blob: key_blob.clone(),
            signature: None,
        })
        .await?;
        let reply = self.recv().await?;
        if reply[0] != auth_codes::USERAUTH_PK_OK {
            return self.verdict("publickey", &reply);
        }
        debug!("Server accepts key {}", key.fingerprint());

        // 2. Signed request
        let session_id = self
            .transport
            .session_id()
            .ok_or_else(|| ConchError::Protocol("No session identifier".to_string()))?;
        let data = signature_data(
            &session_id,
            &self.username,
            CONNECTION_SERVICE,
            &algorithm,
            &key_blob,
        );
        let signature = key.sign(&data)?;
        self.send(AuthMethod::PublicKey {
            algorithm,
            key_blob,
            signature: Some(signature),
        })
        .await?;
        let reply = self.recv().await?;
        self.verdict("publickey", &reply)
    }

    /// Keyboard-interactive authentication driven by `prompts`.
    pub async fn auth_keyboard_interactive(
        &mut self,
        prompts: &mut dyn PromptHandler,
    ) -> ConchResult<()> {
        if self.authenticated {
            return Ok(());
        }
        self.begin("keyboard-interactive").await?;
        self.send(AuthMethod::KeyboardInteractive {
            language: String::new(),
            submethods: String::new(),
        })
        .await?;
        loop {
            let reply = self.recv().await?;
            if reply[0] != auth_codes::USERAUTH_INFO_REQUEST {
                return self.verdict("keyboard-interactive", &reply);
            }
            let query = InteractiveQuery::from_bytes(&reply)?;
            debug!(
                "Interactive query '{}' with {} prompts",
                query.name,
                query.prompts.len()
            );
            let answers = prompts.respond(&query);
            if answers.len() != query.prompts.len() {
                return Err(ConchError::Config(format!(
                    "Prompt handler gave {} answers for {} prompts",
                    answers.len(),
                    query.prompts.len()
                )));
            }
            self.transport.send(&info_response_message(&answers)).await?;
        }
    }

    /// Keyboard-interactive with every prompt answered by `password`.
    ///
    /// Stands in for "password" against servers that only offer interactive prompts.
    pub async fn auth_interactive_dumb(&mut self, password: &str) -> ConchResult<()> {
        let mut answer = |query: &InteractiveQuery| {
            query
                .prompts
                .iter()
                .map(|_| Zeroizing::new(password.to_string()))
                .collect::<Vec<_>>()
        };
        self.auth_keyboard_interactive(&mut answer).await
    }
}

/// Verdict of a server-side credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Authenticated
    Success,
    /// This factor is accepted; another method is required
    PartialSuccess,
    /// Rejected
    Failure,
}

/// Next step of a server-side keyboard-interactive exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveReply {
    /// Ask the client these prompts
    Query(InteractiveQuery),
    /// Finish with a verdict
    Done(AuthResult),
}

/// Server side of user authentication.
#[derive(Debug, Clone)]
pub struct ServerAuth {
    /// Banner sent before the first answer
    pub banner: Option<String>,
    /// Failed attempts before disconnecting, "none" requests included
    pub max_failures: u32,
    /// How long to wait for each client message
    pub timeout: Duration,
}

impl Default for ServerAuth {
    fn default() -> Self {
        Self {
            banner: None,
            max_failures: 20,
            timeout: Duration::from_secs(120),
        }
    }
}

impl ServerAuth {
    /// Runs authentication to completion and returns the user name.
    ///
    /// `on_success` runs right before USERAUTH_SUCCESS is sent, so the caller
    /// can be ready for connection protocol traffic.
    pub async fn run(
        &self,
        transport: &Transport,
        handler: &dyn ServerHandler,
        on_success: impl FnOnce(&str) + Send,
    ) -> ConchResult<String> {
        let mut failures = 0u32;
        let mut satisfied: Vec<String> = Vec::new();
        let mut current_user: Option<String> = None;
        let mut banner_sent = false;

        loop {
            let msg = transport.recv_auth(self.timeout).await?;
            if msg[0] != MessageType::UserauthRequest as u8 {
                return Err(ConchError::Protocol(format!(
                    "Expected USERAUTH_REQUEST, got {}",
                    describe(msg[0])
                )));
            }
            let request = AuthRequest::from_bytes(&msg)?;

            if !banner_sent {
                banner_sent = true;
                if let Some(banner) = &self.banner {
                    transport.send(&banner_message(banner)).await?;
                }
            }
            if current_user.as_deref() != Some(request.username.as_str()) {
                satisfied.clear();
                current_user = Some(request.username.clone());
            }

            let allowed: Vec<String> = handler
                .allowed_auths(&request.username)
                .into_iter()
                .filter(|m| !satisfied.contains(m))
                .collect();
            let method = request.method.name();

            let result = if request.service != CONNECTION_SERVICE {
                warn!("Authentication for unknown service {}", request.service);
                AuthResult::Failure
            } else if method != "none" && !allowed.iter().any(|m| m == method) {
                debug!("Method {} not allowed for {}", method, request.username);
                AuthResult::Failure
            } else {
                match self.check(transport, handler, &request).await? {
                    Some(result) => result,
                    // public key query answered with PK_OK
                    None => continue,
                }
            };

            match result {
                AuthResult::Success => {
                    return self.succeed(transport, &request.username, method, on_success).await;
                }
                AuthResult::PartialSuccess => {
                    satisfied.push(method.to_string());
                    let remaining: Vec<String> =
                        allowed.into_iter().filter(|m| m != method).collect();
                    if remaining.is_empty() {
                        // A partial verdict never authenticates on its own
                        warn!(
                            "{} passed {} but no further method is offered",
                            request.username, method
                        );
                        let failure = AuthFailure {
                            methods: Vec::new(),
                            partial_success: true,
                        };
                        transport.send(&failure.to_bytes()).await?;
                        transport
                            .disconnect(
                                disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                                "No authentication methods left",
                            )
                            .await?;
                        return Err(ConchError::AuthExhausted);
                    }
                    info!(
                        "{} passed {}, still required: {}",
                        request.username,
                        method,
                        remaining.join(",")
                    );
                    let failure = AuthFailure {
                        methods: remaining,
                        partial_success: true,
                    };
                    transport.send(&failure.to_bytes()).await?;
                }
                AuthResult::Failure => {
                    failures += 1;
                    if method == "none" {
                        debug!(
                            "none authentication refused for {} ({}/{})",
                            request.username, failures, self.max_failures
                        );
                    } else {
                        warn!(
                            "{} authentication failed for {} ({}/{})",
                            method, request.username, failures, self.max_failures
                        );
                    }
                    if failures >= self.max_failures {
                        transport
                            .disconnect(
                                disconnect::NO_MORE_AUTH_METHODS_AVAILABLE,
                                "Too many authentication failures",
                            )
                            .await?;
                        return Err(ConchError::AuthExhausted);
                    }
                    let failure = AuthFailure {
                        methods: allowed,
                        partial_success: false,
                    };
                    transport.send(&failure.to_bytes()).await?;
                }
            }
        }
    }

    async fn succeed(
        &self,
        transport: &Transport,
        username: &str,
        method: &str,
        on_success: impl FnOnce(&str) + Send,
    ) -> ConchResult<String> {
        transport.set_authenticated();
        on_success(username);
        transport
            .send(&[MessageType::UserauthSuccess as u8])
            .await?;
        info!("User {} authenticated with {}", username, method);
        Ok(username.to_string())
    }

    /// Checks one request; `None` means a PK_OK was sent and no verdict is due.
    async fn check(
        &self,
        transport: &Transport,
        handler: &dyn ServerHandler,
        request: &AuthRequest,
    ) -> ConchResult<Option<AuthResult>> {
        let username = request.username.as_str();
        let result = match &request.method {
            AuthMethod::None => handler.check_auth_none(username).await,
            AuthMethod::Password {
                password,
                new_password,
            } => {
                if new_password.is_some() {
                    debug!("Password change requests are not supported");
                    AuthResult::Failure
                } else {
                    handler.check_auth_password(username, password).await
                }
            }
            AuthMethod::PublicKey {
                algorithm,
                key_blob,
                signature,
            } => {
                if !SUPPORTED_HOST_KEYS.contains(&algorithm.as_str()) {
                    return Ok(Some(AuthResult::Failure));
                }
                match signature {
                    None => {
                        let verdict = handler
                            .check_auth_publickey(username, algorithm, key_blob)
                            .await;
                        if verdict == AuthResult::Failure {
                            return Ok(Some(AuthResult::Failure));
                        }
                        transport.send(&pk_ok_message(algorithm, key_blob)).await?;
                        return Ok(None);
                    }
                    Some(signature) => {
                        let session_id = transport.session_id().ok_or_else(|| {
                            ConchError::Protocol("No session identifier".to_string())
                        })?;
                        let data = signature_data(
                            &session_id,
                            username,
                            &request.service,
                            algorithm,
                            key_blob,
                        );
                        if verify_host_signature(key_blob, &data, signature).unwrap_or(false) {
                            handler
                                .check_auth_publickey(username, algorithm, key_blob)
                                .await
                        } else {
                            warn!("Bad public key signature from {}", username);
                            AuthResult::Failure
                        }
                    }
                }
            }
            AuthMethod::KeyboardInteractive { submethods, .. } => {
                self.interactive(transport, handler, username, submethods)
                    .await?
            }
        };
        Ok(Some(result))
    }

    async fn interactive(
        &self,
        transport: &Transport,
        handler: &dyn ServerHandler,
        username: &str,
        submethods: &str,
    ) -> ConchResult<AuthResult> {
        let mut reply = handler.check_auth_interactive(username, submethods).await;
        loop {
            let query = match reply {
                InteractiveReply::Done(result) => return Ok(result),
                InteractiveReply::Query(query) => query,
            };
            transport.send(&query.to_bytes()).await?;
            let msg = transport.recv_auth(self.timeout).await?;
            let responses = parse_info_response(&msg)?;
            if responses.len() != query.prompts.len() {
                return Err(ConchError::Protocol(format!(
                    "Client answered {} of {} prompts",
                    responses.len(),
                    query.prompts.len()
                )));
            }
            reply = handler
                .check_auth_interactive_response(username, &responses)
                .await;
        }
    }
}
