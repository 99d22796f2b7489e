//! Redis binding over RESP2.
//!
//! Commands share one lazily-opened connection behind an async mutex. A
//! failed or timed-out round trip drops that connection so the next command
//! reconnects. Each subscription owns a dedicated connection driven by a
//! reader task that re-subscribes with backoff if the socket goes away.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::{RelayError, Result};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::resp::{RespCodec, RespError, RespFrame};
use crate::traits::{BroadcastChannel, CounterStore, Subscription};

type Connection = Framed<TcpStream, RespCodec>;

const DEFAULT_PORT: u16 = 6379;
const SUBSCRIPTION_BUFFER: usize = 256;
const RESUBSCRIBE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const RESUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Parsed `redis://[[user]:password@]host[:port][/db]` endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisEndpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Database index selected after connecting.
    pub db: Option<u32>,
    /// ACL user name.
    pub username: Option<String>,
    /// Password sent with `AUTH`.
    pub password: Option<String>,
}

impl RedisEndpoint {
    /// Parse `redis://...` or bare `host:port`.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |why: &str| RelayError::transport("CONNECT", format!("invalid endpoint {raw:?}: {why}"));

        let trimmed = raw.trim();
        let rest = match trimmed.split_once("://") {
            Some(("redis", rest)) => rest,
            Some((scheme, _)) => return Err(invalid(&format!("unsupported scheme {scheme}"))),
            None => trimmed,
        };

        let (auth, rest) = match rest.rsplit_once('@') {
            Some((auth, rest)) => (Some(auth), rest),
            None => (None, rest),
        };
        let (username, password) = match auth {
            Some(auth) => match auth.split_once(':') {
                Some((user, pass)) => (
                    (!user.is_empty()).then(|| user.to_string()),
                    Some(pass.to_string()),
                ),
                None => (None, Some(auth.to_string())),
            },
            None => (None, None),
        };

        let (authority, db) = match rest.split_once('/') {
            Some((authority, "")) => (authority, None),
            Some((authority, db)) => (
                authority,
                Some(db.parse::<u32>().map_err(|_| invalid("database must be a number"))?),
            ),
            None => (rest, None),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("port must be a number"))?,
            ),
            None => (authority, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            db,
            username,
            password,
        })
    }

    /// `host:port` for `TcpStream::connect`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Counter store and broadcast channel backed by a Redis server.
#[derive(Debug)]
pub struct RedisStore {
    endpoint: RedisEndpoint,
    op_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// Connect and `PING`. Fails if the server is unreachable within `op_timeout`.
    pub async fn connect(endpoint: &str, op_timeout: Duration) -> Result<Self> {
        let store = Self {
            endpoint: RedisEndpoint::parse(endpoint)?,
            op_timeout,
            conn: Mutex::new(None),
        };
        let reply = store.command("PING", &["PING"]).await?;
        debug!(?reply, "redis ping");
        info!(address = %store.endpoint.address(), db = ?store.endpoint.db, "connected to redis");
        Ok(store)
    }

    /// The parsed endpoint.
    pub fn endpoint(&self) -> &RedisEndpoint {
        &self.endpoint
    }

    /// Run one command on the shared connection, mapping error replies to
    /// `TransportUnavailable`.
    async fn command(&self, operation: &'static str, args: &[&str]) -> Result<RespFrame> {
        let mut guard = timeout(self.op_timeout, self.conn.lock())
            .await
            .map_err(|_| RelayError::transport(operation, "timed out waiting for connection"))?;

        let frame = RespFrame::command(args);
        let outcome = timeout(self.op_timeout, round_trip(&mut guard, &self.endpoint, frame)).await;

        match outcome {
            Ok(Ok(RespFrame::Error(message))) => Err(RelayError::transport(operation, message)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *guard = None;
                Err(RelayError::transport(operation, e))
            }
            Err(_) => {
                // The reply may still arrive; the connection is out of sync.
                *guard = None;
                Err(RelayError::transport(operation, "timed out"))
            }
        }
    }

    async fn integer_command(&self, operation: &'static str, args: &[&str]) -> Result<i64> {
        match self.command(operation, args).await? {
            RespFrame::Integer(n) => Ok(n),
            other => Err(unexpected(operation, &other)),
        }
    }
}

fn unexpected(operation: &'static str, reply: &RespFrame) -> RelayError {
    RelayError::transport(operation, format!("unexpected reply {reply:?}"))
}

async fn round_trip(
    slot: &mut Option<Connection>,
    endpoint: &RedisEndpoint,
    frame: RespFrame,
) -> std::result::Result<RespFrame, RespError> {
    if slot.is_none() {
        *slot = Some(open(endpoint).await?);
    }
    let Some(conn) = slot.as_mut() else {
        return Err(RespError::Protocol("connection slot empty".into()));
    };
    request(conn, frame).await
}

async fn request(conn: &mut Connection, frame: RespFrame) -> std::result::Result<RespFrame, RespError> {
    conn.send(frame).await?;
    match conn.next().await {
        Some(reply) => reply,
        None => Err(RespError::Io(std::io::ErrorKind::UnexpectedEof.into())),
    }
}

/// Open a connection, authenticate, and select the database.
async fn open(endpoint: &RedisEndpoint) -> std::result::Result<Connection, RespError> {
    let stream = TcpStream::connect(endpoint.address()).await?;
    stream.set_nodelay(true)?;
    let mut conn = Framed::new(stream, RespCodec);

    if let Some(password) = &endpoint.password {
        let auth = match &endpoint.username {
            Some(user) => RespFrame::command(["AUTH", user.as_str(), password.as_str()]),
            None => RespFrame::command(["AUTH", password.as_str()]),
        };
        expect_ok(&mut conn, auth).await?;
    }
    if let Some(db) = endpoint.db {
        expect_ok(&mut conn, RespFrame::command(["SELECT".to_string(), db.to_string()])).await?;
    }
    debug!(address = %endpoint.address(), "opened redis connection");
    Ok(conn)
}

async fn expect_ok(conn: &mut Connection, frame: RespFrame) -> std::result::Result<(), RespError> {
    match request(conn, frame).await? {
        RespFrame::Error(message) => Err(RespError::Protocol(message)),
        _ => Ok(()),
    }
}

/// Open a connection and issue `SUBSCRIBE`, waiting for the confirmation.
async fn open_subscription(endpoint: &RedisEndpoint, topic: &str) -> std::result::Result<Connection, RespError> {
    let mut conn = open(endpoint).await?;
    match request(&mut conn, RespFrame::command(["SUBSCRIBE", topic])).await? {
        RespFrame::Array(items) if items.first().and_then(RespFrame::as_text).as_deref() == Some("subscribe") => {
            Ok(conn)
        }
        other => Err(RespError::Protocol(format!("unexpected subscribe reply {other:?}"))),
    }
}

/// Payload of a `message` push for `topic`, if that is what `frame` is.
///
/// Payloads that are not UTF-8 are dropped here; no relay fact can carry them.
fn message_payload(frame: RespFrame, topic: &str) -> Option<String> {
    let RespFrame::Array(items) = frame else {
        return None;
    };
    match items.as_slice() {
        [kind, channel, payload]
            if kind.as_text().as_deref() == Some("message")
                && channel.as_text().as_deref() == Some(topic) =>
        {
            let text = payload.as_text();
            if text.is_none() {
                let err = RelayError::malformed(topic, format!("{payload:?}"));
                warn!(topic, error = %err, "non-UTF-8 payload dropped");
            }
            text
        }
        _ => None,
    }
}

/// Forward pushes from `conn` into `tx` until the subscriber goes away,
/// reconnecting with backoff whenever the socket fails.
async fn pump_subscription(
    endpoint: RedisEndpoint,
    topic: String,
    mut conn: Connection,
    tx: mpsc::Sender<String>,
    op_timeout: Duration,
) {
    loop {
        loop {
            tokio::select! {
                () = tx.closed() => return,
                next = conn.next() => match next {
                    Some(Ok(frame)) => {
                        if let Some(payload) = message_payload(frame, &topic) {
                            if tx.send(payload).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(topic = %topic, error = %e, "redis subscription read failed");
                        break;
                    }
                    None => {
                        warn!(topic = %topic, "redis subscription connection closed");
                        break;
                    }
                },
            }
        }

        let mut backoff = RESUBSCRIBE_INITIAL_BACKOFF;
        conn = loop {
            tokio::select! {
                () = tx.closed() => return,
                () = tokio::time::sleep(backoff) => {}
            }
            match timeout(op_timeout, open_subscription(&endpoint, &topic)).await {
                Ok(Ok(conn)) => {
                    info!(topic = %topic, "redis subscription re-established");
                    break conn;
                }
                Ok(Err(e)) => warn!(topic = %topic, error = %e, "redis resubscribe failed"),
                Err(_) => warn!(topic = %topic, "redis resubscribe timed out"),
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_MAX_BACKOFF);
        };
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        match self.command("GET", &["GET", key]).await? {
            RespFrame::Null => Ok(None),
            RespFrame::Integer(n) => Ok(Some(n)),
            reply @ RespFrame::BulkString(_) => {
                let Some(text) = reply.as_text() else {
                    return Err(RelayError::malformed(key, format!("{reply:?}")));
                };
                text.trim()
                    .parse::<i64>()
                    .map(Some)
                    .map_err(|_| RelayError::malformed(key, text))
            }
            other => Err(unexpected("GET", &other)),
        }
    }

    async fn set(&self, key: &str, value: i64) -> Result<()> {
        let value = value.to_string();
        match self.command("SET", &["SET", key, &value]).await? {
            RespFrame::SimpleString(_) => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        let value = value.to_string();
        match self.command("SET", &["SET", key, &value, "NX"]).await? {
            RespFrame::SimpleString(_) => Ok(true),
            RespFrame::Null => Ok(false),
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.integer_command("INCR", &["INCR", key]).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.integer_command("DECR", &["DECR", key]).await
    }
}

#[async_trait]
impl BroadcastChannel for RedisStore {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let receivers = self.integer_command("PUBLISH", &["PUBLISH", topic, payload]).await?;
        debug!(topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let conn = timeout(self.op_timeout, open_subscription(&self.endpoint, topic))
            .await
            .map_err(|_| RelayError::transport("SUBSCRIBE", "timed out"))?
            .map_err(|e| RelayError::transport("SUBSCRIBE", e))?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        drop(tokio::spawn(pump_subscription(
            self.endpoint.clone(),
            topic.to_string(),
            conn,
            tx,
            self.op_timeout,
        )));
        info!(topic, "subscribed");
        Ok(Subscription::new(topic, rx))
    }
}
