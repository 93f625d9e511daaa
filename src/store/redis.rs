// ----------------------------------------------------------------------------
// 14.3 Redis Store (RESP2 over TCP or Unix socket)
// ----------------------------------------------------------------------------
// Minimal client for the handful of commands the exporter needs: SELECT, SCAN,
// HGETALL and INFO. Each call checks a connection out of a small idle pool and
// owns it until the reply is fully read. Only connections that completed their
// command go back to the pool; an error, a timeout or a dropped future discards
// the connection so no later call can read a stale reply.
// ----------------------------------------------------------------------------

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use parking_lot::Mutex;
use tokio::time::error::Elapsed;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{check_deadline, Database, FieldMap, SourceStore};
use crate::error::{ConfigError, RecoveryHint, SourceError, SourceResult};
use crate::fields::parse_key_value_lines;

/// Where the store listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreAddress {
    Tcp(String),
    Unix(PathBuf),
}

impl StoreAddress {
    /// Accepts `unix:///path`, `tcp://host:port`, a bare `host:port` or an
    /// absolute socket path.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::invalid_value("store.address", "empty unix socket path"));
            }
            return Ok(StoreAddress::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(StoreAddress::Unix(PathBuf::from(raw)));
        }
        let hostport = raw.strip_prefix("tcp://").unwrap_or(raw);
        match hostport.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(StoreAddress::Tcp(hostport.to_string()))
            }
            _ => Err(ConfigError::invalid_value(
                "store.address",
                format!("expected unix:///path or host:port, got '{}'", raw),
            )),
        }
    }
}

impl fmt::Display for StoreAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreAddress::Tcp(hostport) => write!(f, "tcp://{}", hostport),
            StoreAddress::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

// ---- Wire protocol ----

/// Largest bulk string accepted from the store, matching redis' own limit.
const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest array reply accepted from the store.
const MAX_ARRAY_LEN: usize = 16 * 1024 * 1024;
/// Upper bound on capacity reserved ahead of reading a reply body.
const PREALLOC_LIMIT: usize = 1024;

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

#[derive(Debug, Clone, PartialEq)]
enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    fn into_string(self) -> SourceResult<String> {
        match self {
            RespValue::Simple(s) => Ok(s),
            RespValue::Bulk(Some(bytes)) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            RespValue::Bulk(None) => Ok(String::new()),
            RespValue::Integer(n) => Ok(n.to_string()),
            RespValue::Error(e) => Err(SourceError::protocol(e)),
            RespValue::Array(_) => Err(SourceError::protocol("expected string, got array")),
        }
    }

    fn into_array(self) -> SourceResult<Vec<RespValue>> {
        match self {
            RespValue::Array(Some(items)) => Ok(items),
            RespValue::Array(None) => Ok(Vec::new()),
            RespValue::Error(e) => Err(SourceError::protocol(e)),
            other => Err(SourceError::protocol(format!("expected array, got {:?}", other))),
        }
    }
}

fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

struct Connection {
    io: BufReader<Box<dyn Stream>>,
    selected: Option<u8>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("selected", &self.selected).finish()
    }
}

impl Connection {
    async fn open(address: &StoreAddress) -> std::io::Result<Self> {
        let stream: Box<dyn Stream> = match address {
            StoreAddress::Tcp(hostport) => {
                let stream = TcpStream::connect(hostport).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            StoreAddress::Unix(path) => Box::new(UnixStream::connect(path).await?),
        };
        Ok(Self {
            io: BufReader::new(stream),
            selected: None,
        })
    }

    async fn command(&mut self, args: &[&[u8]]) -> SourceResult<RespValue> {
        let frame = encode_command(args);
        self.io.write_all(&frame).await.map_err(io_error)?;
        self.io.flush().await.map_err(io_error)?;
        match self.read_value().await? {
            RespValue::Error(e) => Err(SourceError::protocol(e)),
            value => Ok(value),
        }
    }

    async fn read_line(&mut self) -> SourceResult<String> {
        let mut buf = Vec::with_capacity(64);
        let n = self.io.read_until(b'\n', &mut buf).await.map_err(io_error)?;
        if n == 0 {
            return Err(SourceError::protocol("connection closed by peer"));
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| SourceError::protocol("non utf-8 reply header"))
    }

    fn read_value(&mut self) -> BoxFuture<'_, SourceResult<RespValue>> {
        async move {
            let line = self.read_line().await?;
            let mut chars = line.chars();
            let tag = chars.next();
            let rest = chars.as_str();
            match tag {
                Some('+') => Ok(RespValue::Simple(rest.to_string())),
                Some('-') => Ok(RespValue::Error(rest.to_string())),
                Some(':') => rest
                    .parse()
                    .map(RespValue::Integer)
                    .map_err(|_| SourceError::protocol(format!("bad integer reply '{}'", rest))),
                Some('$') => {
                    let len: i64 = rest
                        .parse()
                        .map_err(|_| SourceError::protocol(format!("bad bulk length '{}'", rest)))?;
                    if len < 0 {
                        return Ok(RespValue::Bulk(None));
                    }
                    let len = checked_len(len, MAX_BULK_LEN, "bulk string")?;
                    let mut payload = Vec::with_capacity(len.min(PREALLOC_LIMIT));
                    let read = (&mut self.io)
                        .take(len as u64 + 2)
                        .read_to_end(&mut payload)
                        .await
                        .map_err(io_error)?;
                    if read != len + 2 {
                        return Err(SourceError::protocol("bulk reply truncated by peer"));
                    }
                    payload.truncate(len);
                    Ok(RespValue::Bulk(Some(payload)))
                }
                Some('*') => {
                    let len: i64 = rest
                        .parse()
                        .map_err(|_| SourceError::protocol(format!("bad array length '{}'", rest)))?;
                    if len < 0 {
                        return Ok(RespValue::Array(None));
                    }
                    let len = checked_len(len, MAX_ARRAY_LEN, "array")?;
                    let mut items = Vec::with_capacity(len.min(PREALLOC_LIMIT));
                    for _ in 0..len {
                        items.push(self.read_value().await?);
                    }
                    Ok(RespValue::Array(Some(items)))
                }
                _ => Err(SourceError::protocol(format!("unexpected reply '{}'", line))),
            }
        }
        .boxed()
    }

    async fn select(&mut self, db: u8) -> SourceResult<()> {
        if self.selected == Some(db) {
            return Ok(());
        }
        let index = db.to_string();
        self.command(&[b"SELECT", index.as_bytes()]).await?;
        self.selected = Some(db);
        Ok(())
    }

    async fn scan(&mut self, pattern: &str, count: usize) -> SourceResult<Vec<String>> {
        let count = count.max(1).to_string();
        let mut cursor = String::from("0");
        let mut keys = BTreeSet::new();
        loop {
            let reply = self
                .command(&[
                    b"SCAN",
                    cursor.as_bytes(),
                    b"MATCH",
                    pattern.as_bytes(),
                    b"COUNT",
                    count.as_bytes(),
                ])
                .await?
                .into_array()?;
            let mut parts = reply.into_iter();
            let next = parts
                .next()
                .ok_or_else(|| SourceError::protocol("SCAN reply missing cursor"))?
                .into_string()?;
            let page = parts
                .next()
                .ok_or_else(|| SourceError::protocol("SCAN reply missing keys"))?
                .into_array()?;
            for key in page {
                keys.insert(key.into_string()?);
            }
            if next == "0" {
                break;
            }
            cursor = next;
        }
        Ok(keys.into_iter().collect())
    }

    async fn hgetall(&mut self, key: &str) -> SourceResult<FieldMap> {
        let items = self.command(&[b"HGETALL", key.as_bytes()]).await?.into_array()?;
        if items.len() % 2 != 0 {
            return Err(SourceError::protocol("HGETALL reply has odd length"));
        }
        let mut fields = FieldMap::new();
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            fields.insert(k.into_string()?, v.into_string()?);
        }
        Ok(fields)
    }
}

fn io_error(e: std::io::Error) -> SourceError {
    SourceError::protocol(format!("io: {}", e))
}

fn checked_len(len: i64, limit: usize, what: &str) -> SourceResult<usize> {
    match usize::try_from(len) {
        Ok(n) if n <= limit => Ok(n),
        _ => Err(SourceError::protocol(format!(
            "{} length {} exceeds limit of {}",
            what, len, limit
        ))),
    }
}

// ---- Store ----

/// Idle connections kept for reuse; busier moments simply open more.
const MAX_IDLE_CONNECTIONS: usize = 8;

/// Source store talking to the switch redis instance.
#[derive(Debug)]
pub struct RedisStore {
    address: StoreAddress,
    idle: Mutex<Vec<Connection>>,
}

impl RedisStore {
    pub fn new(address: StoreAddress) -> Self {
        Self {
            address,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn from_address(raw: &str) -> Result<Self, ConfigError> {
        Ok(Self::new(StoreAddress::parse(raw)?))
    }

    pub fn address(&self) -> &StoreAddress {
        &self.address
    }

    /// Connections currently parked in the pool.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Take an idle connection or open a new one, switched to `db`.
    async fn checkout(&self, db: Database) -> SourceResult<Connection> {
        let pooled = self.idle.lock().pop();
        let mut conn = match pooled {
            Some(conn) => conn,
            None => {
                let conn = Connection::open(&self.address)
                    .await
                    .map_err(|e| SourceError::unavailable(self.address.to_string(), e))?;
                debug!(target: "sonic::store", address = %self.address, "Connected to source store");
                conn
            }
        };
        conn.select(db.index()).await?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(conn);
        }
    }

    /// Return the connection of a completed command to the pool. Failed or
    /// timed out commands have already dropped theirs.
    fn settle<T>(
        &self,
        outcome: Result<SourceResult<(Connection, T)>, Elapsed>,
        operation: &str,
    ) -> SourceResult<T> {
        match outcome {
            Ok(Ok((conn, value))) => {
                self.checkin(conn);
                Ok(value)
            }
            Ok(Err(e)) => {
                if e.recovery_hint() == RecoveryHint::Reconnect {
                    warn!(target: "sonic::store", address = %self.address, operation, error = %e, "Dropping source connection");
                } else {
                    debug!(target: "sonic::store", address = %self.address, operation, error = %e, "Source command failed");
                }
                Err(e)
            }
            Err(_) => Err(SourceError::deadline(operation)),
        }
    }
}

#[async_trait]
impl SourceStore for RedisStore {
    async fn scan_keys(
        &self,
        db: Database,
        pattern: &str,
        count: usize,
        deadline: Instant,
    ) -> SourceResult<Vec<String>> {
        check_deadline(deadline, "SCAN")?;
        let outcome = tokio::time::timeout_at(deadline, async {
            let mut conn = self.checkout(db).await?;
            let keys = conn.scan(pattern, count).await?;
            Ok::<_, SourceError>((conn, keys))
        })
        .await;
        self.settle(outcome, "SCAN")
    }

    async fn hget_all(&self, db: Database, key: &str, deadline: Instant) -> SourceResult<FieldMap> {
        check_deadline(deadline, "HGETALL")?;
        let outcome = tokio::time::timeout_at(deadline, async {
            let mut conn = self.checkout(db).await?;
            let fields = conn.hgetall(key).await?;
            Ok::<_, SourceError>((conn, fields))
        })
        .await;
        self.settle(outcome, "HGETALL")
    }

    async fn server_info(&self, deadline: Instant) -> SourceResult<FieldMap> {
        check_deadline(deadline, "INFO")?;
        let outcome = tokio::time::timeout_at(deadline, async {
            let mut conn = self.checkout(Database::ApplDb).await?;
            let text = conn.command(&[b"INFO", b"server"]).await?.into_string()?;
            Ok::<_, SourceError>((conn, parse_key_value_lines(&text)))
        })
        .await;
        self.settle(outcome, "INFO")
    }

    fn endpoint(&self) -> String {
        self.address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            StoreAddress::parse("unix:///var/run/redis/redis.sock").unwrap(),
            StoreAddress::Unix(PathBuf::from("/var/run/redis/redis.sock"))
        );
        assert_eq!(
            StoreAddress::parse("tcp://127.0.0.1:6379").unwrap(),
            StoreAddress::Tcp("127.0.0.1:6379".into())
        );
        assert_eq!(
            StoreAddress::parse("localhost:6379").unwrap(),
            StoreAddress::Tcp("localhost:6379".into())
        );
        assert!(StoreAddress::parse("localhost").is_err());
        assert!(StoreAddress::parse("unix://").is_err());
        assert!(StoreAddress::parse("host:notaport").is_err());
    }

    #[test]
    fn test_encode_command() {
        let frame = encode_command(&[b"HGETALL", b"VLAN|Vlan1"]);
        assert_eq!(frame, b"*2\r\n$7\r\nHGETALL\r\n$10\r\nVLAN|Vlan1\r\n".to_vec());
    }

    /// Serve canned replies for one connection, in order, ignoring requests.
    async fn canned_server(replies: Vec<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            for reply in replies {
                let _ = socket.read(&mut buf).await.unwrap();
                socket.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_scan_follows_cursor() {
        let addr = canned_server(vec![
            "+OK\r\n",
            "*2\r\n$1\r\n7\r\n*2\r\n$12\r\nVLAN|Vlan100\r\n$13\r\nVLAN|Vlan2000\r\n",
            "*2\r\n$1\r\n0\r\n*1\r\n$12\r\nVLAN|Vlan100\r\n",
        ])
        .await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let keys = store.scan_keys(Database::ConfigDb, "VLAN|*", 256, deadline).await.unwrap();
        assert_eq!(keys, vec!["VLAN|Vlan100".to_string(), "VLAN|Vlan2000".to_string()]);
    }

    #[tokio::test]
    async fn test_hgetall_pairs_fields() {
        let addr = canned_server(vec![
            "+OK\r\n",
            "*4\r\n$11\r\noper_status\r\n$2\r\nup\r\n$3\r\nmtu\r\n$4\r\n9100\r\n",
        ])
        .await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let fields = store.hget_all(Database::ApplDb, "LAG_TABLE:PortChannel1", deadline).await.unwrap();
        assert_eq!(fields.get("oper_status").map(String::as_str), Some("up"));
        assert_eq!(fields.get("mtu").map(String::as_str), Some("9100"));
    }

    #[tokio::test]
    async fn test_server_info_parses_info_reply() {
        let addr = canned_server(vec![
            "+OK\r\n",
            "$32\r\n# Server\r\nredis_version:6.0.16\r\n\r\n",
        ])
        .await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let info = store.server_info(deadline).await.unwrap();
        assert_eq!(info.get("redis_version").map(String::as_str), Some("6.0.16"));
    }

    #[tokio::test]
    async fn test_error_reply_surfaces_as_protocol_error() {
        let addr = canned_server(vec!["-ERR DB index is out of range\r\n"]).await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = store.hget_all(Database::StateDb, "x", deadline).await.unwrap_err();
        assert!(matches!(err, SourceError::Protocol { .. }));
    }

    /// Serve every connection, answering by the key named in the request.
    /// `SLOW_KEY` is answered after a delay.
    async fn keyed_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let n = match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                        let reply = if request.contains("SELECT") {
                            "+OK\r\n"
                        } else if request.contains("SLOW_KEY") {
                            tokio::time::sleep(Duration::from_millis(300)).await;
                            "*2\r\n$4\r\nslow\r\n$1\r\n1\r\n"
                        } else if request.contains("FAST_KEY") {
                            "*2\r\n$4\r\nfast\r\n$1\r\n2\r\n"
                        } else {
                            "*0\r\n"
                        };
                        if socket.write_all(reply.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_abandoned_command_does_not_leak_its_reply() {
        let addr = keyed_server().await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            store.hget_all(Database::ApplDb, "SLOW_KEY", deadline),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(store.idle_connections(), 0);

        let fields = store.hget_all(Database::ApplDb, "FAST_KEY", deadline).await.unwrap();
        assert_eq!(fields.get("fast").map(String::as_str), Some("2"));
        assert!(fields.get("slow").is_none());

        // wait out the late reply; it must not reach the pooled connection
        tokio::time::sleep(Duration::from_millis(350)).await;
        let again = store.hget_all(Database::ApplDb, "FAST_KEY", deadline).await.unwrap();
        assert_eq!(again.get("fast").map(String::as_str), Some("2"));
        assert_eq!(store.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_slow_command_does_not_block_other_callers() {
        let addr = keyed_server().await;
        let store = RedisStore::from_address(&addr).unwrap();
        let slow_deadline = Instant::now() + Duration::from_secs(5);
        let fast_deadline = Instant::now() + Duration::from_millis(150);

        let (slow, fast) = tokio::join!(
            store.hget_all(Database::ApplDb, "SLOW_KEY", slow_deadline),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                store.hget_all(Database::ApplDb, "FAST_KEY", fast_deadline).await
            }
        );
        assert_eq!(fast.unwrap().get("fast").map(String::as_str), Some("2"));
        assert_eq!(slow.unwrap().get("slow").map(String::as_str), Some("1"));
        assert_eq!(store.idle_connections(), 2);
    }

    #[tokio::test]
    async fn test_oversized_array_header_is_protocol_error() {
        let addr = canned_server(vec!["+OK\r\n", "*4611686018427387903\r\n"]).await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = store.hget_all(Database::ApplDb, "x", deadline).await.unwrap_err();
        assert!(matches!(err, SourceError::Protocol { .. }), "{:?}", err);
        assert_eq!(store.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_oversized_bulk_header_is_protocol_error() {
        let addr = canned_server(vec!["+OK\r\n", "$9223372036854775807\r\n"]).await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = store.server_info(deadline).await.unwrap_err();
        assert!(matches!(err, SourceError::Protocol { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_truncated_bulk_reply_is_protocol_error() {
        let addr = canned_server(vec!["+OK\r\n", "$64\r\nshort\r\n"]).await;
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = store.server_info(deadline).await.unwrap_err();
        assert!(matches!(err, SourceError::Protocol { .. }), "{:?}", err);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let store = RedisStore::from_address(&addr).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = store.scan_keys(Database::ConfigDb, "*", 10, deadline).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }
}
