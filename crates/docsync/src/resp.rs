use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs, lookup_host};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Incomplete")]
    Incomplete,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Server error: {0}")]
    Server(String),
    #[error("Timed out waiting for reply")]
    Timeout,
}

impl RespError {
    /// The connection can no longer be trusted to pair requests and replies
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, RespError::Server(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    /// Command array from its arguments
    pub fn command<I, A>(args: I) -> RespValue
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|arg| RespValue::BulkString(arg.into()))
                .collect(),
        )
    }

    /// Parse one value, `Incomplete` if the buffer ends early
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<RespValue, RespError> {
        if !buf.has_remaining() {
            return Err(RespError::Incomplete);
        }

        match buf.get_u8() {
            b'+' => Ok(RespValue::SimpleString(read_text(buf)?)),
            b'-' => Ok(RespValue::Error(read_text(buf)?)),
            b':' => Ok(RespValue::Integer(read_integer(buf)?)),
            b'$' => {
                let Some(len) = read_length(buf)? else {
                    return Ok(RespValue::Null);
                };
                if buf.remaining() < len + 2 {
                    return Err(RespError::Incomplete);
                }
                let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
                buf.advance(len);
                if buf.get_u8() != b'\r' || buf.get_u8() != b'\n' {
                    return Err(RespError::InvalidProtocol);
                }
                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let Some(count) = read_length(buf)? else {
                    return Ok(RespValue::Null);
                };
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(RespValue::parse(buf)?);
                }
                Ok(RespValue::Array(items))
            }
            _ => Err(RespError::InvalidProtocol),
        }
    }

    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => put_line(buf, b'+', s.as_bytes()),
            RespValue::Error(s) => put_line(buf, b'-', s.as_bytes()),
            RespValue::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                put_line(buf, b'$', data.len().to_string().as_bytes());
                buf.put_slice(data);
                buf.put_slice(CRLF);
            }
            RespValue::Array(items) => {
                put_line(buf, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.serialize(buf);
                }
            }
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
        }
    }

    /// Bulk or simple string contents
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(data) => Some(&data[..]),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Elements of an array made only of bulk strings (pushes and replies)
    pub fn as_bulk_string_array(&self) -> Option<Vec<Bytes>> {
        let RespValue::Array(items) = self else {
            return None;
        };
        items
            .iter()
            .map(|item| match item {
                RespValue::BulkString(data) => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

const CRLF: &[u8] = b"\r\n";

fn put_line(buf: &mut BytesMut, kind: u8, line: &[u8]) {
    buf.put_u8(kind);
    buf.put_slice(line);
    buf.put_slice(CRLF);
}

fn read_line<'a>(buf: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], RespError> {
    let start = buf.position() as usize;
    let data: &'a [u8] = *buf.get_ref();
    let slice = &data[start..];
    let end = slice
        .windows(2)
        .position(|w| w == CRLF)
        .ok_or(RespError::Incomplete)?;
    buf.advance(end + 2);
    Ok(&slice[..end])
}

fn read_text(buf: &mut Cursor<&[u8]>) -> Result<String, RespError> {
    Ok(String::from_utf8_lossy(read_line(buf)?).into_owned())
}

fn read_integer(buf: &mut Cursor<&[u8]>) -> Result<i64, RespError> {
    std::str::from_utf8(read_line(buf)?)
        .ok()
        .and_then(|line| line.parse().ok())
        .ok_or(RespError::InvalidProtocol)
}

/// Length header of a bulk string or array; `None` for the -1 null marker
fn read_length(buf: &mut Cursor<&[u8]>) -> Result<Option<usize>, RespError> {
    match read_integer(buf)? {
        -1 => Ok(None),
        n if n < 0 => Err(RespError::InvalidProtocol),
        n => Ok(Some(n as usize)),
    }
}

/// Read one complete value, buffering partial reads in `buffer`
pub async fn read_value<R>(reader: &mut R, buffer: &mut BytesMut) -> Result<RespValue, RespError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buffer.is_empty() {
            let mut cursor = Cursor::new(&buffer[..]);
            match RespValue::parse(&mut cursor) {
                Ok(value) => {
                    let pos = cursor.position() as usize;
                    buffer.advance(pos);
                    return Ok(value);
                }
                Err(RespError::Incomplete) => {}
                Err(e) => return Err(e),
            }
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            return Err(RespError::ConnectionClosed);
        }
    }
}

pub async fn write_value<W>(writer: &mut W, value: &RespValue) -> Result<(), RespError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    value.serialize(&mut buf);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Upper bound for one request/reply exchange
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait before reconnect attempt `attempt` (1-based): 50ms more per attempt,
/// capped at two seconds
pub fn reconnect_delay(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt).saturating_mul(50).min(2000))
}

/// Resolve once so later reconnects do not need the caller's address type
pub async fn resolve<A: ToSocketAddrs>(addr: A) -> Result<Vec<SocketAddr>, RespError> {
    let addrs: Vec<SocketAddr> = lookup_host(addr).await?.collect();
    if addrs.is_empty() {
        return Err(RespError::Io(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "address resolved to nothing",
        )));
    }
    Ok(addrs)
}

pub async fn open_stream(addrs: &[SocketAddr]) -> Result<TcpStream, RespError> {
    let stream = TcpStream::connect(addrs).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    async fn open(addrs: &[SocketAddr]) -> Result<Self, RespError> {
        Ok(Self {
            stream: open_stream(addrs).await?,
            buffer: BytesMut::with_capacity(4096),
        })
    }

    async fn exchange(&mut self, request: &RespValue) -> Result<RespValue, RespError> {
        let Connection { stream, buffer } = self;
        let reply = timeout(COMMAND_TIMEOUT, async {
            write_value(stream, request).await?;
            read_value(stream, buffer).await
        })
        .await
        .map_err(|_| RespError::Timeout)??;
        Ok(reply)
    }
}

/// Request/response RESP connection
///
/// Commands are serialized through a mutex so each reply pairs with its
/// request. A broken connection is dropped and reopened on the next
/// command; a command that fails on a reused connection is sent once more
/// on a fresh one, which covers a server restart between two commands.
pub struct RespClient {
    addrs: Vec<SocketAddr>,
    connection: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl RespClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, RespError> {
        let addrs = resolve(addr).await?;
        let connection = Connection::open(&addrs).await?;
        Ok(Self {
            addrs,
            connection: Mutex::new(Some(connection)),
            closed: AtomicBool::new(false),
        })
    }

    /// Send a command and wait for its reply; `-ERR` replies become errors
    pub async fn command<I, A>(&self, args: I) -> Result<RespValue, RespError>
    where
        I: IntoIterator<Item = A>,
        A: Into<Bytes>,
    {
        let request = RespValue::command(args);
        let mut connection = self.connection.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(RespError::ConnectionClosed);
        }

        let reply = match connection.as_mut() {
            Some(current) => match current.exchange(&request).await {
                Ok(reply) => Ok(reply),
                Err(e) if e.is_connection_error() => {
                    debug!("Reconnecting to {:?} after: {}", self.addrs, e);
                    *connection = None;
                    self.exchange_fresh(&mut connection, &request).await
                }
                Err(e) => Err(e),
            },
            None => self.exchange_fresh(&mut connection, &request).await,
        }?;

        match reply {
            RespValue::Error(message) => Err(RespError::Server(message)),
            value => Ok(value),
        }
    }

    async fn exchange_fresh(
        &self,
        slot: &mut Option<Connection>,
        request: &RespValue,
    ) -> Result<RespValue, RespError> {
        let mut fresh = Connection::open(&self.addrs).await?;
        let reply = fresh.exchange(request).await?;
        *slot = Some(fresh);
        Ok(reply)
    }

    /// Close the connection; the server may already be gone
    pub async fn quit(&self) {
        let mut connection = self.connection.lock().await;
        self.closed.store(true, Ordering::SeqCst);
        if let Some(mut current) = connection.take() {
            let _ = current.exchange(&RespValue::command(["QUIT"])).await;
            let _ = current.stream.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_simple_string() {
        let mut buf = Cursor::new(b"+OK\r\n".as_ref());
        let val = RespValue::parse(&mut buf).unwrap();
        assert_eq!(val, RespValue::SimpleString("OK".to_string()));
    }

    #[test]
    fn test_parse_null_bulk_string() {
        let mut buf = Cursor::new(b"$-1\r\n".as_ref());
        assert_eq!(RespValue::parse(&mut buf).unwrap(), RespValue::Null);
    }

    #[test]
    fn test_parse_pmessage_push() {
        let raw = b"*4\r\n$8\r\npmessage\r\n$5\r\np:d:*\r\n$5\r\np:d:h\r\n$3\r\n\x00\x01\x02\r\n";
        let mut buf = Cursor::new(raw.as_ref());
        let parts = RespValue::parse(&mut buf)
            .unwrap()
            .as_bulk_string_array()
            .unwrap();
        assert_eq!(parts[0], Bytes::from("pmessage"));
        assert_eq!(parts[2], Bytes::from("p:d:h"));
        assert_eq!(parts[3], Bytes::from_static(&[0, 1, 2]));
    }

    #[test]
    fn test_partial_input_is_incomplete() {
        let inputs: [&[u8]; 4] = [b"", b"+OK", b"$5\r\nhel", b"*2\r\n$3\r\nfoo\r\n"];
        for raw in inputs {
            let mut buf = Cursor::new(raw);
            assert!(matches!(
                RespValue::parse(&mut buf),
                Err(RespError::Incomplete)
            ));
        }
    }

    #[test]
    fn test_serialize_command() {
        let val = RespValue::command(["SET", "k", "v"]);
        let mut buf = BytesMut::new();
        val.serialize(&mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n");
    }

    #[tokio::test]
    async fn test_client_round_trip_against_scripted_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            let request = read_value(&mut socket, &mut buffer).await.unwrap();
            assert_eq!(request, RespValue::command(["PING"]));
            write_value(&mut socket, &RespValue::SimpleString("PONG".into()))
                .await
                .unwrap();
            let _ = read_value(&mut socket, &mut buffer).await.unwrap();
            write_value(&mut socket, &RespValue::Error("ERR nope".into()))
                .await
                .unwrap();
        });

        let client = RespClient::connect(addr).await.unwrap();
        let reply = client.command(["PING"]).await.unwrap();
        assert_eq!(reply.as_bytes(), Some(&b"PONG"[..]));
        assert!(matches!(
            client.command(["FAIL"]).await,
            Err(RespError::Server(msg)) if msg == "ERR nope"
        ));
    }

    async fn answer_ping(socket: &mut TcpStream, buffer: &mut BytesMut) {
        let request = read_value(socket, buffer).await.unwrap();
        assert_eq!(request, RespValue::command(["PING"]));
        write_value(socket, &RespValue::SimpleString("PONG".into()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_reconnects_after_server_closed_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            answer_ping(&mut first, &mut BytesMut::new()).await;
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            answer_ping(&mut second, &mut buffer).await;
            answer_ping(&mut second, &mut buffer).await;
        });

        let client = RespClient::connect(addr).await.unwrap();
        assert!(client.command(["PING"]).await.is_ok());
        // The first connection is dead by now; the command goes out again
        // on a new one
        assert!(client.command(["PING"]).await.is_ok());
        assert!(client.command(["PING"]).await.is_ok());
    }

    #[tokio::test]
    async fn test_client_fails_while_server_is_down_and_closed_after_quit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            answer_ping(&mut socket, &mut BytesMut::new()).await;
            drop(listener);
        });

        let client = RespClient::connect(addr).await.unwrap();
        assert!(client.command(["PING"]).await.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.command(["PING"]).await.is_err());

        client.quit().await;
        assert!(matches!(
            client.command(["PING"]).await,
            Err(RespError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_reconnect_delay_grows_and_caps() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(50));
        assert_eq!(reconnect_delay(10), Duration::from_millis(500));
        assert_eq!(reconnect_delay(1000), Duration::from_secs(2));
    }
}
