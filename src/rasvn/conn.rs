//! Framing, handshake and authentication of one `svn://` connection.
//!
//! [`WireConn`] reads and writes [`SvnItem`]s over a buffered byte stream.
//! Every read and write is bounded by the session's timeouts; a timeout
//! surfaces as an [`SvnError::Io`] and therefore closes the session.

use std::time::Duration;

use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{RepositoryInfo, ServerError, SessionConfig, SvnError, SvnUrl};

use super::SvnItem;
use super::parse::{parse_repos_info, parse_server_error};
use super::wire::encode_command_item;

/// Capabilities announced to the server in the handshake.
pub(crate) const CLIENT_CAPS: [&str; 6] = [
    "edit-pipeline",
    "svndiff1",
    "accepts-svndiff2",
    "absent-entries",
    "depth",
    "log-revprops",
];

/// Upper bound for the initial allocation of a wire string.
const STRING_PREALLOC_MAX: usize = 64 * 1024;

type AuthMechanismChoice = (String, Option<Vec<u8>>);

fn timed_out(what: &str) -> SvnError {
    SvnError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{what} timed out"),
    ))
}

#[derive(Debug)]
pub(crate) struct CommandResponse {
    success: bool,
    params: Vec<SvnItem>,
    errors: Vec<SvnItem>,
}

impl CommandResponse {
    pub(crate) fn is_failure(&self) -> bool {
        !self.success
    }

    pub(crate) fn success_params(&self, ctx: &str) -> Result<&[SvnItem], SvnError> {
        if self.success {
            Ok(&self.params)
        } else {
            Err(self.failure(ctx))
        }
    }

    pub(crate) fn ensure_success(&self, ctx: &str) -> Result<(), SvnError> {
        self.success_params(ctx).map(|_| ())
    }

    pub(crate) fn failure(&self, ctx: &str) -> SvnError {
        SvnError::Server(self.server_error().with_context(ctx.to_string()))
    }

    fn server_error(&self) -> ServerError {
        parse_server_error(&self.errors)
    }
}

pub(crate) struct WireConfig {
    pub(crate) username: Option<String>,
    pub(crate) password: Option<String>,
    pub(crate) url: String,
    pub(crate) ra_client: String,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
}

impl WireConfig {
    pub(crate) fn new(url: &SvnUrl, config: &SessionConfig) -> Self {
        Self {
            username: config
                .username
                .clone()
                .or_else(|| url.username.clone()),
            password: config.password.clone(),
            url: url.url.clone(),
            ra_client: config.ra_client.clone(),
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        }
    }
}

type DynRead = Box<dyn AsyncRead + Unpin + Send>;
type DynWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// One framed `svn://` stream. Bytes read ahead of the current item stay
/// in `buf` from `pos` on.
pub(crate) struct WireConn {
    read: DynRead,
    write: DynWrite,
    buf: Vec<u8>,
    pos: usize,
    write_buf: Vec<u8>,
    config: WireConfig,
    server_caps: Vec<String>,
}

impl WireConn {
    pub(crate) fn new(read: DynRead, write: DynWrite, config: WireConfig) -> Self {
        Self {
            read,
            write,
            buf: Vec::new(),
            pos: 0,
            write_buf: Vec::new(),
            config,
            server_caps: Vec::new(),
        }
    }

    /// Opens a TCP connection to `url`; the handshake is left to the caller.
    pub(crate) async fn connect(url: &SvnUrl, config: &SessionConfig) -> Result<Self, SvnError> {
        let addr = url.socket_addr()?;
        debug!(addr = %addr, "connecting to svnserve");
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out("connect"))??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        Ok(Self::new(
            Box::new(read),
            Box::new(write),
            WireConfig::new(url, config),
        ))
    }

    pub(crate) fn server_has_cap(&self, cap: &str) -> bool {
        self.server_caps.iter().any(|c| c == cap)
    }

    /// Runs the greeting exchange and authentication, returning the
    /// repository identity sent by the server.
    pub(crate) async fn handshake(&mut self) -> Result<RepositoryInfo, SvnError> {
        let greeting = self.read_command_response().await?;
        let params = greeting.success_params("greeting")?;
        if params.len() < 4 {
            return Err(SvnError::Protocol("greeting params too short".into()));
        }
        let minver = params[0]
            .as_u64()
            .ok_or_else(|| SvnError::Protocol("invalid greeting minver".into()))?;
        let maxver = params[1]
            .as_u64()
            .ok_or_else(|| SvnError::Protocol("invalid greeting maxver".into()))?;
        self.server_caps = params[3]
            .as_list()
            .map(|caps| caps.iter().filter_map(SvnItem::as_word).collect())
            .unwrap_or_default();
        debug!(minver, maxver, caps = ?self.server_caps, "received server greeting");
        if !(minver <= 2 && 2 <= maxver) {
            return Err(SvnError::Protocol(format!(
                "server does not support protocol v2 (min={minver}, max={maxver})"
            )));
        }
        if !self.server_has_cap("edit-pipeline") {
            return Err(SvnError::Protocol(
                "server does not support edit pipelining".into(),
            ));
        }

        let response = SvnItem::List(vec![
            SvnItem::Number(2),
            SvnItem::List(
                CLIENT_CAPS
                    .iter()
                    .map(|cap| SvnItem::Word((*cap).to_string()))
                    .collect(),
            ),
            SvnItem::String(self.config.url.as_bytes().to_vec()),
            SvnItem::String(self.config.ra_client.as_bytes().to_vec()),
            SvnItem::List(Vec::new()),
        ]);
        self.write_item(&response).await?;

        self.handle_auth_request().await?;

        let repos_info = self.read_command_response().await?;
        let repository = parse_repos_info(repos_info.success_params("repos-info")?)?;
        for cap in &repository.capabilities {
            if !self.server_has_cap(cap) {
                self.server_caps.push(cap.clone());
            }
        }
        debug!(uuid = %repository.uuid, root = %repository.root_url, "handshake complete");
        Ok(RepositoryInfo {
            capabilities: self.server_caps.clone(),
            ..repository
        })
    }

    /// Sends a command and reads its response, answering the auth request
    /// in between.
    pub(crate) async fn call(
        &mut self,
        command: &str,
        params: SvnItem,
    ) -> Result<CommandResponse, SvnError> {
        self.send_command(command, params).await?;
        self.handle_auth_request().await?;
        self.read_command_response().await
    }

    pub(crate) async fn send_command(
        &mut self,
        command: &str,
        params: SvnItem,
    ) -> Result<(), SvnError> {
        trace!(command, "sending command");
        self.write_buf.clear();
        encode_command_item(command, &params, &mut self.write_buf);
        self.write_buf.push(b'\n');

        let buf = std::mem::take(&mut self.write_buf);
        let result = self.write_wire_bytes(&buf).await;
        self.write_buf = buf;
        result
    }

    pub(crate) async fn handle_auth_request(&mut self) -> Result<(), SvnError> {
        let auth_req = self.read_command_response().await?;
        let params = auth_req.success_params("auth-request")?;
        if params.len() < 2 {
            return Err(SvnError::Protocol("auth-request params too short".into()));
        }
        let mechs = params[0]
            .as_list()
            .ok_or_else(|| SvnError::Protocol("auth mechs not a list".into()))?;
        if mechs.is_empty() {
            return Ok(());
        }
        let realm = params[1]
            .as_string()
            .unwrap_or_else(|| "<unknown>".to_string());
        let mechs: Vec<String> = mechs.iter().filter_map(SvnItem::as_word).collect();
        debug!(realm = %realm, mechs = ?mechs, "server requires authentication");
        self.authenticate(&mechs).await
    }

    async fn authenticate(&mut self, mechs: &[String]) -> Result<(), SvnError> {
        let mut last_failure = None::<String>;

        for (mech, initial) in self.select_mechs(mechs)? {
            debug!(mech = %mech, "trying auth mechanism");
            let token_tuple = match initial {
                Some(token) => SvnItem::List(vec![SvnItem::String(token)]),
                None => SvnItem::List(Vec::new()),
            };
            self.write_item(&SvnItem::List(vec![
                SvnItem::Word(mech.clone()),
                token_tuple,
            ]))
            .await?;

            loop {
                let challenge = self.read_item().await?;
                let SvnItem::List(parts) = challenge else {
                    return Err(SvnError::Protocol("invalid auth challenge".into()));
                };
                let Some(kind) = parts.first().and_then(SvnItem::as_word) else {
                    return Err(SvnError::Protocol("invalid auth challenge kind".into()));
                };
                let token = || {
                    parts
                        .get(1)
                        .and_then(|i| i.as_list())
                        .and_then(|list| list.first().and_then(SvnItem::as_bytes_string))
                };
                match kind.as_str() {
                    "step" => {
                        let challenge = token()
                            .ok_or_else(|| SvnError::Protocol("auth step missing token".into()))?;
                        let reply = self.auth_step_reply(&mech, &challenge)?;
                        self.write_item(&SvnItem::String(reply)).await?;
                    }
                    "success" => return Ok(()),
                    "failure" => {
                        let message = token()
                            .map(|m| String::from_utf8_lossy(&m).into_owned())
                            .unwrap_or_else(|| "auth failed".to_string());
                        debug!(mech = %mech, message = %message, "auth mechanism failed");
                        last_failure = Some(message);
                        break;
                    }
                    other => {
                        return Err(SvnError::Protocol(format!(
                            "unexpected auth challenge: {other}"
                        )));
                    }
                }
            }
        }

        Err(SvnError::AuthFailed(
            last_failure.unwrap_or_else(|| "auth failed".to_string()),
        ))
    }

    /// Mechanisms to try, strongest first, with their initial tokens.
    fn select_mechs(&self, mechs: &[String]) -> Result<Vec<AuthMechanismChoice>, SvnError> {
        let offered = |name: &str| mechs.iter().any(|m| m == name);
        let credentials = match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) if !user.trim().is_empty() => Some((user, pass)),
            _ => None,
        };

        let mut out = Vec::new();
        if let Some((user, pass)) = credentials {
            if offered("CRAM-MD5") {
                out.push(("CRAM-MD5".to_string(), None));
            }
            if offered("PLAIN") {
                let mut token = Vec::with_capacity(user.len() + pass.len() + 2);
                token.push(0);
                token.extend_from_slice(user.as_bytes());
                token.push(0);
                token.extend_from_slice(pass.as_bytes());
                out.push(("PLAIN".to_string(), Some(token)));
            }
        }
        if offered("ANONYMOUS") {
            out.push(("ANONYMOUS".to_string(), Some(Vec::new())));
        }

        if out.is_empty() {
            Err(SvnError::AuthUnavailable)
        } else {
            Ok(out)
        }
    }

    fn auth_step_reply(&self, mech: &str, challenge: &[u8]) -> Result<Vec<u8>, SvnError> {
        match mech {
            "CRAM-MD5" => match (&self.config.username, &self.config.password) {
                (Some(user), Some(pass)) => {
                    Ok(cram_md5_response(user, pass, challenge)?.into_bytes())
                }
                _ => Err(SvnError::AuthFailed(
                    "CRAM-MD5 needs a username and password".into(),
                )),
            },
            other => Err(SvnError::Protocol(format!(
                "unexpected auth step for {other}"
            ))),
        }
    }

    pub(crate) async fn write_cmd_success(&mut self) -> Result<(), SvnError> {
        self.write_item(&SvnItem::List(vec![
            SvnItem::Word("success".to_string()),
            SvnItem::List(Vec::new()),
        ]))
        .await
    }

    /// Writes a failure response while the server may still be streaming
    /// editor commands at us.
    ///
    /// Writing and reading are interleaved so that a server blocked on a
    /// full socket cannot deadlock the exchange. Returns `true` when an
    /// `abort-edit` was consumed in the process.
    pub(crate) async fn write_cmd_failure(&mut self, err: &SvnError) -> Result<bool, SvnError> {
        let item = SvnItem::List(vec![
            SvnItem::Word("failure".to_string()),
            SvnItem::List(vec![SvnItem::List(vec![
                SvnItem::Number(1),
                SvnItem::String(err.to_string().into_bytes()),
                SvnItem::String(Vec::new()),
                SvnItem::Number(0),
            ])]),
        ]);
        let mut wire = Vec::new();
        item.encode(&mut wire);
        wire.push(b'\n');

        let deadline = Instant::now() + self.config.write_timeout;
        let mut offset = 0usize;
        let mut aborted = false;
        while offset < wire.len() {
            if Instant::now() >= deadline {
                return Err(timed_out("write"));
            }
            match tokio::time::timeout(Duration::from_millis(0), self.write.write(&wire[offset..]))
                .await
            {
                Ok(Ok(0)) => {
                    return Err(SvnError::Io(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "write returned 0 bytes",
                    )));
                }
                Ok(Ok(n)) => offset += n,
                Ok(Err(err)) => return Err(SvnError::Io(err)),
                Err(_) => {
                    if !self.data_available().await? {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    if let SvnItem::List(parts) = self.read_item().await?
                        && parts.first().and_then(SvnItem::as_word).as_deref() == Some("abort-edit")
                    {
                        aborted = true;
                    }
                }
            }
        }
        self.write.flush().await?;
        Ok(aborted)
    }

    pub(crate) async fn write_wire_bytes(&mut self, bytes: &[u8]) -> Result<(), SvnError> {
        tokio::time::timeout(self.config.write_timeout, async {
            self.write.write_all(bytes).await?;
            self.write.flush().await
        })
        .await
        .map_err(|_| timed_out("write"))??;
        Ok(())
    }

    pub(crate) async fn write_item(&mut self, item: &SvnItem) -> Result<(), SvnError> {
        self.write_buf.clear();
        item.encode(&mut self.write_buf);
        self.write_buf.push(b'\n');

        let buf = std::mem::take(&mut self.write_buf);
        let result = self.write_wire_bytes(&buf).await;
        self.write_buf = buf;
        result
    }

    pub(crate) async fn read_command_response(&mut self) -> Result<CommandResponse, SvnError> {
        let SvnItem::List(parts) = self.read_item().await? else {
            return Err(SvnError::Protocol("command response not a list".into()));
        };
        let kind = parts
            .first()
            .and_then(SvnItem::as_word)
            .ok_or_else(|| SvnError::Protocol("command response kind not a word".into()))?;
        let list = parts.get(1).and_then(SvnItem::as_list).unwrap_or_default();
        match kind.as_str() {
            "success" => Ok(CommandResponse {
                success: true,
                params: list,
                errors: Vec::new(),
            }),
            "failure" => Ok(CommandResponse {
                success: false,
                params: Vec::new(),
                errors: list,
            }),
            other => Err(SvnError::Protocol(format!(
                "unexpected command response kind: {other}"
            ))),
        }
    }

    pub(crate) async fn read_item(&mut self) -> Result<SvnItem, SvnError> {
        tokio::time::timeout(self.config.read_timeout, self.read_item_inner())
            .await
            .map_err(|_| timed_out("read"))?
    }

    /// Whether the server has sent anything that is not yet consumed,
    /// without waiting for it.
    pub(crate) async fn data_available(&mut self) -> Result<bool, SvnError> {
        while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos < self.buf.len() {
            return Ok(true);
        }
        self.compact();

        let mut temp = [0u8; 16384];
        match tokio::time::timeout(Duration::from_millis(0), self.read.read(&mut temp)).await {
            Ok(Ok(0)) => Err(SvnError::Protocol("unexpected EOF".into())),
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&temp[..n]);
                while self.pos < self.buf.len() && self.buf[self.pos].is_ascii_whitespace() {
                    self.pos += 1;
                }
                let available = self.pos < self.buf.len();
                if !available {
                    self.compact();
                }
                Ok(available)
            }
            Ok(Err(err)) => Err(SvnError::Io(err)),
            Err(_) => Ok(false),
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            let len = self.buf.len();
            self.buf.copy_within(self.pos..len, 0);
            self.buf.truncate(len - self.pos);
            self.pos = 0;
        }
    }

    async fn read_item_inner(&mut self) -> Result<SvnItem, SvnError> {
        skip_ws(self).await?;
        if self.peek_byte().await? == b'(' {
            return self.read_list().await;
        }
        self.read_atom().await
    }

    async fn read_list(&mut self) -> Result<SvnItem, SvnError> {
        self.consume_byte().await?;
        require_ws(self).await?;

        let mut stack: Vec<Vec<SvnItem>> = vec![Vec::new()];
        loop {
            skip_ws(self).await?;
            match self.peek_byte().await? {
                b')' => {
                    self.consume_byte().await?;
                    require_ws(self).await?;
                    let completed = stack
                        .pop()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?;
                    let item = SvnItem::List(completed);
                    match stack.last_mut() {
                        Some(parent) => parent.push(item),
                        None => return Ok(item),
                    }
                }
                b'(' => {
                    self.consume_byte().await?;
                    require_ws(self).await?;
                    stack.push(Vec::new());
                }
                _ => {
                    let atom = self.read_atom().await?;
                    stack
                        .last_mut()
                        .ok_or_else(|| SvnError::Protocol("list stack underflow".into()))?
                        .push(atom);
                }
            }
        }
    }

    async fn read_atom(&mut self) -> Result<SvnItem, SvnError> {
        skip_ws(self).await?;
        match self.peek_byte().await? {
            b'0'..=b'9' => {
                let n = parse_digits(self).await?;
                if self.peek_byte().await? == b':' {
                    self.consume_byte().await?;
                    let len = usize::try_from(n)
                        .map_err(|_| SvnError::Protocol("string length overflow".into()))?;
                    let bytes = self.read_exact_vec(len).await?;
                    require_ws(self).await?;
                    Ok(SvnItem::String(bytes))
                } else {
                    require_ws(self).await?;
                    Ok(SvnItem::Number(n))
                }
            }
            _ => {
                let word = parse_word(self).await?;
                let item = match word.as_str() {
                    "true" => SvnItem::Bool(true),
                    "false" => SvnItem::Bool(false),
                    _ => SvnItem::Word(word),
                };
                require_ws(self).await?;
                Ok(item)
            }
        }
    }

    async fn read_exact_vec(&mut self, n: usize) -> Result<Vec<u8>, SvnError> {
        let mut out = Vec::with_capacity(n.min(STRING_PREALLOC_MAX));
        while out.len() < n {
            if self.pos < self.buf.len() {
                let take = (n - out.len()).min(self.buf.len() - self.pos);
                out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
            } else {
                self.fill().await?;
            }
        }
        Ok(out)
    }

    async fn fill(&mut self) -> Result<(), SvnError> {
        self.compact();
        let mut temp = [0u8; 16384];
        let n = self.read.read(&mut temp).await?;
        if n == 0 {
            return Err(SvnError::Protocol("unexpected EOF".into()));
        }
        self.buf.extend_from_slice(&temp[..n]);
        Ok(())
    }

    async fn peek_byte(&mut self) -> Result<u8, SvnError> {
        loop {
            if self.pos < self.buf.len() {
                return Ok(self.buf[self.pos]);
            }
            self.fill().await?;
        }
    }

    async fn consume_byte(&mut self) -> Result<u8, SvnError> {
        let b = self.peek_byte().await?;
        self.pos += 1;
        Ok(b)
    }
}

/// `user hex(hmac-md5(password, challenge))`.
pub(crate) fn cram_md5_response(
    user: &str,
    password: &str,
    challenge: &[u8],
) -> Result<String, SvnError> {
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|_| SvnError::Protocol("failed to create HMAC-MD5".into()))?;
    mac.update(challenge);
    Ok(format!("{user} {}", hex::encode(mac.finalize().into_bytes())))
}

async fn skip_ws(conn: &mut WireConn) -> Result<(), SvnError> {
    while conn.peek_byte().await?.is_ascii_whitespace() {
        conn.consume_byte().await?;
    }
    Ok(())
}

async fn require_ws(conn: &mut WireConn) -> Result<(), SvnError> {
    if conn.consume_byte().await?.is_ascii_whitespace() {
        Ok(())
    } else {
        Err(SvnError::Protocol("expected whitespace".into()))
    }
}

async fn parse_digits(conn: &mut WireConn) -> Result<u64, SvnError> {
    let mut n = 0u64;
    loop {
        let b = conn.peek_byte().await?;
        if !b.is_ascii_digit() {
            break;
        }
        conn.consume_byte().await?;
        n = n
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| SvnError::Protocol("number overflow".into()))?;
    }
    Ok(n)
}

async fn parse_word(conn: &mut WireConn) -> Result<String, SvnError> {
    let mut bytes = Vec::new();
    loop {
        let b = conn.peek_byte().await?;
        if b.is_ascii_whitespace() {
            break;
        }
        if matches!(b, b'(' | b')' | b':') {
            return Err(SvnError::Protocol("invalid word token".into()));
        }
        bytes.push(conn.consume_byte().await?);
    }
    String::from_utf8(bytes).map_err(|_| SvnError::Protocol("non-utf8 word".into()))
}
