//! Prompt-driven command sessions to network devices.
//!
//! Two dialects are supported: `ssh` (the management protocol of choice) and
//! `telnet` (the legacy console protocol older gear still speaks). Both open
//! an interactive terminal, wait for the device prompt, disable output
//! paging, and then run commands by writing a line and collecting everything
//! up to the next prompt. One session serves exactly one device for exactly
//! one hop of a trace.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use russh::keys::ssh_key;
use russh::{ChannelMsg, Disconnect, client};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

pub const SSH_PORT: u16 = 22;
pub const TELNET_PORT: u16 = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Dialect {
    Ssh,
    Telnet,
}

impl Dialect {
    /// The dialect to retry with after an establishment timeout, if any.
    pub fn fallback(self) -> Option<Dialect> {
        match self {
            Dialect::Ssh => Some(Dialect::Telnet),
            Dialect::Telnet => None,
        }
    }

    fn port(self) -> u16 {
        match self {
            Dialect::Ssh => SSH_PORT,
            Dialect::Telnet => TELNET_PORT,
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Ssh => write!(f, "ssh"),
            Dialect::Telnet => write!(f, "telnet"),
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = crate::MacTrailError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(Dialect::Ssh),
            "telnet" => Ok(Dialect::Telnet),
            other => Err(crate::MacTrailError::InvalidInput(format!(
                "Unknown session dialect '{other}', expected 'ssh' or 'telnet'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug)]
pub enum SessionError {
    Connection(String),
    Authentication(String),
    Command(String),
    Timeout,
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Connection(msg) => write!(f, "Connection error: {msg}"),
            SessionError::Authentication(msg) => write!(f, "Authentication error: {msg}"),
            SessionError::Command(msg) => write!(f, "Command error: {msg}"),
            SessionError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl std::error::Error for SessionError {}

/// An established, authenticated session that can run commands and report
/// the prompt the device greeted us with.
pub trait CommandSession: Send {
    fn send_command(
        &mut self,
        command: &str,
    ) -> impl Future<Output = Result<String, SessionError>> + Send;

    /// The raw prompt most recently seen, decoration included.
    fn prompt(&self) -> &str;

    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Opens sessions. The trace engine only ever talks to this seam, which is
/// what lets tests substitute scripted devices for real ones.
pub trait SessionOpener {
    type Session: CommandSession;

    fn open(
        &self,
        dialect: Dialect,
        host: Ipv4Addr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send;
}

/// The real opener: dials the network.
pub struct NetworkOpener;

impl SessionOpener for NetworkOpener {
    type Session = NetSession;

    fn open(
        &self,
        dialect: Dialect,
        host: Ipv4Addr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Session, SessionError>> + Send {
        async move {
            debug!("Opening {dialect} session to {host}");
            match dialect {
                Dialect::Ssh => SshSession::connect(host, credentials, timeout)
                    .await
                    .map(NetSession::Ssh),
                Dialect::Telnet => TelnetSession::connect(host, credentials, timeout)
                    .await
                    .map(NetSession::Telnet),
            }
        }
    }
}

pub enum NetSession {
    Ssh(SshSession),
    Telnet(TelnetSession),
}

impl CommandSession for NetSession {
    fn send_command(
        &mut self,
        command: &str,
    ) -> impl Future<Output = Result<String, SessionError>> + Send {
        async move {
            match self {
                NetSession::Ssh(session) => session.send_command(command).await,
                NetSession::Telnet(session) => session.send_command(command).await,
            }
        }
    }

    fn prompt(&self) -> &str {
        match self {
            NetSession::Ssh(session) => session.prompt(),
            NetSession::Telnet(session) => session.prompt(),
        }
    }

    fn close(self) -> impl Future<Output = ()> + Send {
        async move {
            match self {
                NetSession::Ssh(session) => session.close().await,
                NetSession::Telnet(session) => session.close().await,
            }
        }
    }
}

/// An IOS exec prompt: the last line of output, no trailing newline, ending
/// in `#` (privileged) or `>` (user).
fn prompt_line(buffer: &str) -> Option<String> {
    let tail = buffer.rsplit('\n').next().unwrap_or("").trim();
    if !tail.is_empty() && (tail.ends_with('#') || tail.ends_with('>')) {
        Some(tail.to_string())
    } else {
        None
    }
}

/// Drop the echoed command from the front of a captured response and the
/// prompt from the back, leaving just the device's answer.
fn strip_command_frame(raw: &str, command: &str) -> String {
    let mut lines: Vec<&str> = raw.lines().collect();
    if lines
        .last()
        .map(|line| prompt_line(line).is_some())
        .unwrap_or(false)
    {
        lines.pop();
    }
    if lines
        .first()
        .map(|line| line.contains(command))
        .unwrap_or(false)
    {
        lines.remove(0);
    }
    lines.join("\n")
}

// Handler for russh client
#[derive(Clone)]
struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = russh::Error;
    #[allow(unused_variables)]
    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshSession {
    handle: client::Handle<ClientHandler>,
    channel: russh::Channel<client::Msg>,
    prompt: String,
    timeout: Duration,
}

impl SshSession {
    pub async fn connect(
        host: Ipv4Addr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let mut config = client::Config::default();

        // Old IOS gear only offers legacy key exchanges, so keep those on
        // the menu behind the modern ones.
        config.preferred.kex = vec![
            russh::kex::CURVE25519,
            russh::kex::DH_G14_SHA256,
            russh::kex::DH_G16_SHA512,
            russh::kex::ECDH_SHA2_NISTP256,
            russh::kex::ECDH_SHA2_NISTP384,
            russh::kex::ECDH_SHA2_NISTP521,
            russh::kex::DH_G14_SHA1,
        ]
        .into();

        let address = SocketAddr::new(IpAddr::V4(host), Dialect::Ssh.port());

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(config), address, ClientHandler),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|err| SessionError::Connection(err.to_string()))?;

        let auth = tokio::time::timeout(
            timeout,
            handle.authenticate_password(&credentials.username, &credentials.password),
        )
        .await
        .map_err(|_| SessionError::Timeout)?
        .map_err(|err| SessionError::Authentication(err.to_string()))?;

        if !matches!(auth, client::AuthResult::Success) {
            return Err(SessionError::Authentication(format!(
                "Password authentication rejected for {}@{host}",
                credentials.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))?;
        channel
            .request_pty(true, "vt100", 120, 40, 0, 0, &[])
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| SessionError::Connection(err.to_string()))?;

        let mut session = Self {
            handle,
            channel,
            prompt: String::new(),
            timeout,
        };

        // Swallow the login banner up to the first prompt, then stop the
        // device from paginating long answers.
        session.drain_until_prompt().await?;
        session.send_command("terminal length 0").await?;

        debug!("SSH session to {host} ready, prompt '{}'", session.prompt);
        Ok(session)
    }

    async fn drain_until_prompt(&mut self) -> Result<String, SessionError> {
        let mut buffer = String::new();
        let deadline = Instant::now() + self.timeout;

        loop {
            let msg = tokio::time::timeout_at(deadline, self.channel.wait())
                .await
                .map_err(|_| SessionError::Timeout)?;

            match msg {
                Some(ChannelMsg::Data { data }) => {
                    buffer.push_str(&String::from_utf8_lossy(&data).replace('\r', ""));
                    trace!("Session buffer now {} bytes", buffer.len());
                    if let Some(prompt) = prompt_line(&buffer) {
                        self.prompt = prompt;
                        return Ok(buffer);
                    }
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    buffer.push_str(&String::from_utf8_lossy(&data).replace('\r', ""));
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                    return Err(SessionError::Command(
                        "Channel closed before a prompt was seen".to_string(),
                    ));
                }
                Some(other) => {
                    trace!("Ignoring channel message: {other:?}");
                }
            }
        }
    }

    pub async fn send_command(&mut self, command: &str) -> Result<String, SessionError> {
        debug!("Sending command: {command}");
        let payload = format!("{command}\n");
        self.channel
            .data(payload.as_bytes())
            .await
            .map_err(|err| SessionError::Command(err.to_string()))?;
        let raw = self.drain_until_prompt().await?;
        Ok(strip_command_frame(&raw, command))
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

// Telnet protocol bytes we have to answer: refuse every option the device
// proposes, strip everything else.
const IAC: u8 = 255;
const DONT: u8 = 254;
const DO: u8 = 253;
const WONT: u8 = 252;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;

pub struct TelnetSession {
    stream: TcpStream,
    prompt: String,
    timeout: Duration,
}

impl TelnetSession {
    pub async fn connect(
        host: Ipv4Addr,
        credentials: &Credentials,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let address = SocketAddr::new(IpAddr::V4(host), Dialect::Telnet.port());
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|err| SessionError::Connection(err.to_string()))?;

        let mut session = Self {
            stream,
            prompt: String::new(),
            timeout,
        };
        session.login(credentials).await?;
        session.send_command("terminal length 0").await?;

        debug!("Telnet session to {host} ready, prompt '{}'", session.prompt);
        Ok(session)
    }

    async fn login(&mut self, credentials: &Credentials) -> Result<(), SessionError> {
        let mut buffer = String::new();
        let deadline = Instant::now() + self.timeout;
        let mut sent_username = false;
        let mut sent_password = false;

        loop {
            self.read_chunk(&mut buffer, deadline).await?;
            let tail = buffer.trim_end().to_lowercase();

            if !sent_username && (tail.ends_with("username:") || tail.ends_with("login:")) {
                self.write_line(&credentials.username).await?;
                sent_username = true;
                buffer.clear();
            } else if !sent_password && tail.ends_with("password:") {
                self.write_line(&credentials.password).await?;
                sent_password = true;
                buffer.clear();
            } else if tail.contains("authentication failed") || tail.contains("% login invalid") {
                return Err(SessionError::Authentication(
                    "Console login rejected".to_string(),
                ));
            } else if let Some(prompt) = prompt_line(&buffer) {
                self.prompt = prompt;
                return Ok(());
            }
        }
    }

    async fn read_chunk(&mut self, buffer: &mut String, deadline: Instant) -> Result<(), SessionError> {
        let mut raw = [0u8; 4096];
        let read = tokio::time::timeout_at(deadline, self.stream.read(&mut raw))
            .await
            .map_err(|_| SessionError::Timeout)?
            .map_err(|err| SessionError::Connection(err.to_string()))?;
        if read == 0 {
            return Err(SessionError::Connection(
                "Console closed the connection".to_string(),
            ));
        }

        let mut replies = Vec::new();
        let mut text = Vec::with_capacity(read);
        let mut index = 0;
        while index < read {
            let byte = raw[index];
            if byte != IAC {
                if byte != 0 && byte != b'\r' {
                    text.push(byte);
                }
                index += 1;
                continue;
            }
            // IAC sequence
            match raw.get(index + 1).copied() {
                Some(DO) => {
                    if let Some(option) = raw.get(index + 2).copied() {
                        replies.extend_from_slice(&[IAC, WONT, option]);
                    }
                    index += 3;
                }
                Some(WILL) => {
                    if let Some(option) = raw.get(index + 2).copied() {
                        replies.extend_from_slice(&[IAC, DONT, option]);
                    }
                    index += 3;
                }
                Some(DONT) | Some(WONT) => index += 3,
                Some(SB) => {
                    // Skip the subnegotiation up to IAC SE.
                    index += 2;
                    while index < read && !(raw[index - 1] == IAC && raw[index] == SE) {
                        index += 1;
                    }
                    index += 1;
                }
                Some(_) => index += 2,
                None => index += 1,
            }
        }

        if !replies.is_empty() {
            self.stream
                .write_all(&replies)
                .await
                .map_err(|err| SessionError::Connection(err.to_string()))?;
        }

        buffer.push_str(&String::from_utf8_lossy(&text));
        trace!("Console buffer now {} bytes", buffer.len());
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        let payload = format!("{line}\r\n");
        self.stream
            .write_all(payload.as_bytes())
            .await
            .map_err(|err| SessionError::Command(err.to_string()))
    }

    pub async fn send_command(&mut self, command: &str) -> Result<String, SessionError> {
        debug!("Sending command: {command}");
        self.write_line(command).await?;

        let mut buffer = String::new();
        let deadline = Instant::now() + self.timeout;
        loop {
            self.read_chunk(&mut buffer, deadline).await?;
            if let Some(prompt) = prompt_line(&buffer) {
                self.prompt = prompt;
                return Ok(strip_command_frame(&buffer, command));
            }
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
