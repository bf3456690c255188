//! Hipache-compatible routing store on Redis
//!
//! Each virtual host is a Redis list at `frontend:<vhost>`:
//!
//! ```text
//! frontend:app.example.com
//!   [0] "app.example.com"        (identifier, reserved)
//!   [1] "http://172.17.0.5:80"
//!   [2] "http://172.17.0.6:80"
//! ```
//!
//! Commands are sent as RESP arrays of bulk strings over a single TCP
//! connection, which is reopened lazily after any I/O or protocol error,
//! or when a caller was cancelled before reading its reply.

use crate::config::StoreConfig;
use crate::error::SyncError;
use crate::store::{RouteStore, RESERVED_ENTRIES};
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Largest bulk string accepted, matching Redis's `proto-max-bulk-len`
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on array capacity reserved before elements arrive
const ARRAY_PREALLOC_LIMIT: usize = 64;

/// Key prefix hipache reads frontends from
const FRONTEND_PREFIX: &str = "frontend:";

/// A decoded RESP reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    fn into_integer(self) -> Result<i64, RespError> {
        match self {
            Reply::Integer(n) => Ok(n),
            Reply::Error(e) => Err(RespError::Server(e)),
            other => Err(RespError::Protocol(format!("expected integer, got {:?}", other))),
        }
    }

    fn into_strings(self) -> Result<Vec<String>, RespError> {
        match self {
            Reply::Array(None) => Ok(Vec::new()),
            Reply::Array(Some(items)) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(Some(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                    Reply::Simple(s) => Ok(s),
                    other => Err(RespError::Protocol(format!(
                        "expected bulk string, got {:?}",
                        other
                    ))),
                })
                .collect(),
            Reply::Error(e) => Err(RespError::Server(e)),
            other => Err(RespError::Protocol(format!("expected array, got {:?}", other))),
        }
    }

    fn into_ok(self) -> Result<(), RespError> {
        match self {
            Reply::Error(e) => Err(RespError::Server(e)),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Error)]
pub enum RespError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RespError {
    /// Whether the connection is still usable after this error
    fn is_recoverable(&self) -> bool {
        matches!(self, RespError::Server(_))
    }
}

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Read one reply from the stream
pub fn read_reply<'a, R>(reader: &'a mut R) -> BoxFuture<'a, Result<Reply, RespError>>
where
    R: AsyncBufRead + Unpin + Send,
{
    Box::pin(async move {
        let line = read_line(reader).await?;
        let (kind, rest) = line
            .split_first()
            .ok_or_else(|| RespError::Protocol("empty reply line".into()))?;
        let rest = String::from_utf8_lossy(rest).into_owned();

        match kind {
            b'+' => Ok(Reply::Simple(rest)),
            b'-' => Ok(Reply::Error(rest)),
            b':' => Ok(Reply::Integer(parse_len(&rest)?)),
            b'$' => {
                let len = parse_len(&rest)?;
                if len < 0 {
                    return Ok(Reply::Bulk(None));
                }
                if len > MAX_BULK_LEN {
                    return Err(RespError::Protocol(format!("bulk length {} too large", len)));
                }
                let mut data = vec![0u8; len as usize + 2];
                reader.read_exact(&mut data).await?;
                if !data.ends_with(b"\r\n") {
                    return Err(RespError::Protocol("bulk string missing CRLF".into()));
                }
                data.truncate(len as usize);
                Ok(Reply::Bulk(Some(data)))
            }
            b'*' => {
                let len = parse_len(&rest)?;
                if len < 0 {
                    return Ok(Reply::Array(None));
                }
                let mut items = Vec::with_capacity((len as usize).min(ARRAY_PREALLOC_LIMIT));
                for _ in 0..len {
                    items.push(read_reply(reader).await?);
                }
                Ok(Reply::Array(Some(items)))
            }
            other => Err(RespError::Protocol(format!(
                "unknown reply type byte {:?}",
                *other as char
            ))),
        }
    })
}

async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, RespError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(RespError::Io(std::io::ErrorKind::UnexpectedEof.into()));
    }
    if !line.ends_with(b"\r\n") {
        return Err(RespError::Protocol("reply line missing CRLF".into()));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_len(s: &str) -> Result<i64, RespError> {
    s.parse()
        .map_err(|_| RespError::Protocol(format!("invalid length or integer '{}'", s)))
}

/// Parse `tcp://host:port` or `redis://host:port` into `host:port`
pub fn parse_url(url: &str) -> anyhow::Result<String> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("redis://"))
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid store URL '{}'. Expected 'tcp://host:port' or 'redis://host:port'",
                url
            )
        })?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        anyhow::bail!("Store URL '{}' has no host", url);
    }

    if rest.rsplit_once(':').is_some_and(|(_, port)| port.parse::<u16>().is_ok()) {
        Ok(rest.to_string())
    } else {
        Ok(format!("{}:{}", rest, DEFAULT_REDIS_PORT))
    }
}

/// One open connection
struct Connection {
    stream: BufStream<TcpStream>,
    /// A command was sent and its reply not yet read in full
    awaiting_reply: bool,
}

impl Connection {
    async fn open(
        addr: &str,
        password: Option<&str>,
        database: Option<u32>,
    ) -> Result<Self, RespError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RespError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connecting to {} timed out", addr),
                ))
            })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufStream::new(stream),
            awaiting_reply: false,
        };
        if let Some(password) = password {
            conn.call(&[b"AUTH", password.as_bytes()]).await?.into_ok()?;
        }
        if let Some(db) = database {
            conn.call(&[b"SELECT", db.to_string().as_bytes()]).await?.into_ok()?;
        }
        debug!(addr, "Connected to routing store");
        Ok(conn)
    }

    async fn call(&mut self, args: &[&[u8]]) -> Result<Reply, RespError> {
        self.awaiting_reply = true;
        self.stream.write_all(&encode_command(args)).await?;
        self.stream.flush().await?;
        let reply = read_reply(&mut self.stream).await?;
        self.awaiting_reply = false;
        Ok(reply)
    }
}

/// Routing store backed by Redis lists in the hipache layout
pub struct RedisStore {
    addr: String,
    password: Option<String>,
    database: Option<u32>,
    backend_scheme: String,
    conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            password: None,
            database: None,
            backend_scheme: "http".to_string(),
            conn: Mutex::new(None),
        }
    }

    pub fn from_config(config: &StoreConfig) -> anyhow::Result<Self> {
        let url = config.resolve_url();
        let addr = parse_url(&url)?;
        info!(url = %url, addr = %addr, "Using Redis routing store");

        let mut store = Self::new(addr).with_backend_scheme(&config.backend_scheme);
        store.password = config.password.clone();
        store.database = config.database;
        Ok(store)
    }

    /// Scheme prepended to `ip:port` backends; empty stores them bare
    pub fn with_backend_scheme(mut self, scheme: &str) -> Self {
        self.backend_scheme = scheme.to_string();
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn key(vhost: &str) -> String {
        format!("{}{}", FRONTEND_PREFIX, vhost)
    }

    fn backend_url(&self, addr: &str) -> String {
        if self.backend_scheme.is_empty() {
            addr.to_string()
        } else {
            format!("{}://{}", self.backend_scheme, addr)
        }
    }

    async fn ensure<'c>(
        &self,
        slot: &'c mut Option<Connection>,
    ) -> Result<&'c mut Connection, RespError> {
        // A dropped caller leaves its reply on the socket; the next reader
        // would take it for its own
        if slot.as_ref().is_some_and(|conn| conn.awaiting_reply) {
            debug!(addr = %self.addr, "Discarding connection with an unread reply");
            *slot = None;
        }
        if slot.is_none() {
            let conn = Connection::open(&self.addr, self.password.as_deref(), self.database).await?;
            *slot = Some(conn);
        }
        slot.as_mut()
            .ok_or_else(|| RespError::Protocol("connection unavailable".into()))
    }

    /// Map a command result to the store error, dropping broken connections
    fn settle<T>(
        &self,
        slot: &mut Option<Connection>,
        op: &str,
        result: Result<T, RespError>,
    ) -> Result<T, SyncError> {
        result.map_err(|e| {
            if !e.is_recoverable() {
                *slot = None;
            }
            warn!(addr = %self.addr, op, error = %e, "Routing store command failed");
            SyncError::store(e)
        })
    }
}

#[async_trait]
impl RouteStore for RedisStore {
    async fn add(&self, vhost: &str, backends: &[String]) -> Result<(), SyncError> {
        let key = Self::key(vhost);
        let urls: Vec<String> = backends.iter().map(|b| self.backend_url(b)).collect();
        let mut slot = self.conn.lock().await;

        let result = async {
            let conn = self.ensure(&mut slot).await?;
            if conn.call(&[b"LLEN", key.as_bytes()]).await?.into_integer()? == 0 {
                conn.call(&[b"RPUSH", key.as_bytes(), vhost.as_bytes()])
                    .await?
                    .into_integer()?;
            }
            if !urls.is_empty() {
                let mut args: Vec<&[u8]> = vec![&b"RPUSH"[..], key.as_bytes()];
                args.extend(urls.iter().map(|u| u.as_bytes()));
                conn.call(&args).await?.into_integer()?;
            }
            Ok::<_, RespError>(())
        }
        .await;

        self.settle(&mut slot, "add", result)
    }

    async fn remove(&self, vhost: &str, backends: &[String]) -> Result<usize, SyncError> {
        let key = Self::key(vhost);
        let mut slot = self.conn.lock().await;

        let result = async {
            let conn = self.ensure(&mut slot).await?;
            let mut removed = 0;
            for backend in backends {
                let url = self.backend_url(backend);
                let n = conn
                    .call(&[b"LREM", key.as_bytes(), b"0", url.as_bytes()])
                    .await?
                    .into_integer()?;
                removed += n.max(0) as usize;
            }
            Ok::<_, RespError>(removed)
        }
        .await;

        self.settle(&mut slot, "remove", result)
    }

    async fn remove_all(&self, vhost: &str) -> Result<(), SyncError> {
        let key = Self::key(vhost);
        let mut slot = self.conn.lock().await;

        let result = async {
            let conn = self.ensure(&mut slot).await?;
            conn.call(&[b"DEL", key.as_bytes()]).await?.into_integer()?;
            Ok::<_, RespError>(())
        }
        .await;

        self.settle(&mut slot, "remove_all", result)
    }

    async fn find(&self, vhost: &str) -> Result<Vec<String>, SyncError> {
        let key = Self::key(vhost);
        let mut slot = self.conn.lock().await;

        let result = async {
            let conn = self.ensure(&mut slot).await?;
            conn.call(&[b"LRANGE", key.as_bytes(), b"0", b"-1"])
                .await?
                .into_strings()
        }
        .await;

        let entries = self.settle(&mut slot, "find", result)?;
        debug!(
            vhost,
            backends = entries.len().saturating_sub(RESERVED_ENTRIES),
            "Frontend looked up"
        );
        Ok(entries)
    }
}
