use super::{MessageStream, PatternMessage, PubSub, TransportError};
use crate::resp::{
    RespClient, RespValue, open_stream, read_value, reconnect_delay, resolve, write_value,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Longest wait for a (un)subscribe confirmation
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Request {
    Subscribe,
    Unsubscribe,
}

impl Request {
    fn command(self) -> &'static str {
        match self {
            Request::Subscribe => "PSUBSCRIBE",
            Request::Unsubscribe => "PUNSUBSCRIBE",
        }
    }

    fn from_reply(kind: &[u8]) -> Option<Self> {
        match kind {
            b"psubscribe" => Some(Request::Subscribe),
            b"punsubscribe" => Some(Request::Unsubscribe),
            _ => None,
        }
    }
}

type Waiter = oneshot::Sender<Result<(), TransportError>>;
type PendingRequests = Arc<Mutex<HashMap<(Request, String), VecDeque<Waiter>>>>;

/// State of the subscriber-mode connection, shared with its supervisor task
///
/// `writer` is `None` while the connection is down; requests then fail
/// right away. Waiters are only queued while holding `writer`, and the
/// supervisor clears `writer` before failing the queue, so no waiter can
/// outlive the connection it was sent on.
struct Subscriber {
    addrs: Vec<SocketAddr>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    pending: PendingRequests,
    /// Patterns to restore after a reconnect
    patterns: Mutex<HashSet<String>>,
}

/// Redis pub/sub over two RESP connections
///
/// `PUBLISH` goes through a regular request/response connection. The second
/// connection is in subscriber mode: a supervisor task reads it, routes
/// `pmessage` pushes to the inbound stream and resolves pending
/// (un)subscribe calls when their confirmation arrives. When the connection
/// drops, the supervisor reconnects and subscribes to every tracked pattern
/// again; the inbound stream survives reconnects.
pub struct RedisPubSub {
    publisher: RespClient,
    subscriber: Arc<Subscriber>,
    messages: StdMutex<Option<MessageStream>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

impl RedisPubSub {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, TransportError> {
        let addrs = resolve(addr).await?;
        let publisher = RespClient::connect(addrs.as_slice()).await?;
        let (read_half, write_half) = open_stream(&addrs).await?.into_split();

        let subscriber = Arc::new(Subscriber {
            addrs,
            writer: Mutex::new(Some(write_half)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            patterns: Mutex::new(HashSet::new()),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise(Arc::clone(&subscriber), read_half, sender));

        Ok(Self {
            publisher,
            subscriber,
            messages: StdMutex::new(Some(receiver)),
            supervisor: StdMutex::new(Some(supervisor)),
        })
    }

    async fn request(&self, request: Request, pattern: &str) -> Result<(), TransportError> {
        let key = (request, pattern.to_string());
        let (tx, rx) = oneshot::channel();
        let command = RespValue::command([request.command().to_string(), pattern.to_string()]);

        {
            let mut writer = self.subscriber.writer.lock().await;
            let Some(stream) = writer.as_mut() else {
                return Err(TransportError::Disconnected);
            };
            self.subscriber
                .pending
                .lock()
                .await
                .entry(key.clone())
                .or_default()
                .push_back(tx);
            if let Err(e) = write_value(stream, &command).await {
                if let Some(waiters) = self.subscriber.pending.lock().await.get_mut(&key) {
                    waiters.pop_back();
                }
                return Err(e.into());
            }
        }

        match timeout(CONFIRM_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::Timeout),
        }
    }
}

/// Read the subscriber connection, reconnecting whenever it drops
async fn supervise(
    subscriber: Arc<Subscriber>,
    first: OwnedReadHalf,
    sender: mpsc::UnboundedSender<PatternMessage>,
) {
    let mut reader = first;
    loop {
        read_loop(&mut reader, &subscriber.pending, &sender).await;

        // Clear the writer first so no new waiter is queued behind fail_all
        *subscriber.writer.lock().await = None;
        fail_all(&subscriber.pending, || TransportError::Disconnected).await;
        if sender.is_closed() {
            return;
        }

        reader = reconnect(&subscriber).await;
    }
}

async fn reconnect(subscriber: &Subscriber) -> OwnedReadHalf {
    let mut attempt = 0;
    loop {
        attempt += 1;
        tokio::time::sleep(reconnect_delay(attempt)).await;
        match open_stream(&subscriber.addrs).await {
            Ok(stream) => match restore(subscriber, stream).await {
                Ok(reader) => {
                    info!("Subscriber reconnected after {} attempts", attempt);
                    return reader;
                }
                Err(e) => debug!("Restoring subscriptions failed: {}", e),
            },
            Err(e) => debug!("Subscriber reconnect attempt {} failed: {}", attempt, e),
        }
    }
}

/// Re-issue every tracked pattern on a fresh connection and install it
///
/// The confirmations arrive on the new reader with nobody waiting for them.
async fn restore(subscriber: &Subscriber, stream: TcpStream) -> Result<OwnedReadHalf, TransportError> {
    let (reader, mut writer) = stream.into_split();
    let mut slot = subscriber.writer.lock().await;
    let patterns: Vec<String> = subscriber.patterns.lock().await.iter().cloned().collect();
    if !patterns.is_empty() {
        let mut args = vec!["PSUBSCRIBE".to_string()];
        args.extend(patterns);
        write_value(&mut writer, &RespValue::command(args)).await?;
    }
    *slot = Some(writer);
    Ok(reader)
}

async fn read_loop(
    reader: &mut OwnedReadHalf,
    pending: &PendingRequests,
    sender: &mpsc::UnboundedSender<PatternMessage>,
) {
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        match read_value(reader, &mut buffer).await {
            Ok(RespValue::Array(items)) => route_push(items, pending, sender).await,
            Ok(RespValue::Error(message)) => {
                warn!("Subscriber connection error reply: {}", message);
                fail_all(pending, || TransportError::Rejected(message.clone())).await;
            }
            Ok(other) => debug!("Ignoring unexpected subscriber reply {:?}", other),
            Err(e) => {
                warn!("Subscriber connection lost: {}", e);
                return;
            }
        }
    }
}

async fn route_push(
    items: Vec<RespValue>,
    pending: &PendingRequests,
    sender: &mpsc::UnboundedSender<PatternMessage>,
) {
    let Some(kind) = items.first().and_then(RespValue::as_bytes) else {
        return;
    };

    if kind == b"pmessage" && items.len() == 4 {
        let field = |i: usize| items[i].as_bytes().map(|b| String::from_utf8_lossy(b).into_owned());
        let (Some(pattern), Some(channel)) = (field(1), field(2)) else {
            return;
        };
        let payload = match &items[3] {
            RespValue::BulkString(data) => data.clone(),
            _ => return,
        };
        // Receiver gone means the coordinator stopped; nothing to do
        let _ = sender.send(PatternMessage {
            pattern,
            channel,
            payload,
        });
        return;
    }

    let Some(request) = Request::from_reply(kind) else {
        return;
    };
    let Some(pattern) = items.get(1).and_then(RespValue::as_bytes) else {
        return;
    };
    let key = (request, String::from_utf8_lossy(pattern).into_owned());
    let mut pending = pending.lock().await;
    let Some(waiters) = pending.get_mut(&key) else {
        return;
    };
    // Skip callers that gave up waiting
    while let Some(waiter) = waiters.pop_front() {
        if waiter.send(Ok(())).is_ok() {
            break;
        }
    }
}

async fn fail_all<F>(pending: &PendingRequests, error: F)
where
    F: Fn() -> TransportError,
{
    for (_, waiters) in pending.lock().await.drain() {
        for waiter in waiters {
            let _ = waiter.send(Err(error()));
        }
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), TransportError> {
        self.publisher
            .command([
                Bytes::from_static(b"PUBLISH"),
                Bytes::from(channel.to_string()),
                payload,
            ])
            .await?;
        Ok(())
    }

    async fn psubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.subscriber
            .patterns
            .lock()
            .await
            .insert(pattern.to_string());
        let result = self.request(Request::Subscribe, pattern).await;
        if result.is_err() {
            self.subscriber.patterns.lock().await.remove(pattern);
        }
        result
    }

    async fn punsubscribe(&self, pattern: &str) -> Result<(), TransportError> {
        self.subscriber.patterns.lock().await.remove(pattern);
        self.request(Request::Unsubscribe, pattern).await
    }

    fn take_messages(&self) -> Option<MessageStream> {
        self.messages.lock().ok().and_then(|mut messages| messages.take())
    }

    async fn disconnect(&self) {
        let supervisor = self
            .supervisor
            .lock()
            .ok()
            .and_then(|mut supervisor| supervisor.take());
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.publisher.quit().await;
        if let Some(mut writer) = self.subscriber.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        fail_all(&self.subscriber.pending, || TransportError::Disconnected).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_psubscribe_waits_for_confirmation_and_routes_pmessage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (_publisher, _) = listener.accept().await.unwrap();
            let (mut subscriber, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();

            let request = read_value(&mut subscriber, &mut buffer).await.unwrap();
            assert_eq!(request, RespValue::command(["PSUBSCRIBE", "p:doc:*"]));
            let confirm = RespValue::Array(vec![
                RespValue::BulkString(Bytes::from("psubscribe")),
                RespValue::BulkString(Bytes::from("p:doc:*")),
                RespValue::Integer(1),
            ]);
            write_value(&mut subscriber, &confirm).await.unwrap();

            let push = RespValue::command(["pmessage", "p:doc:*", "p:doc:host-a", "hi"]);
            write_value(&mut subscriber, &push).await.unwrap();
            subscriber
        });

        let pubsub = RedisPubSub::connect(addr).await.unwrap();
        let mut messages = pubsub.take_messages().unwrap();
        pubsub.psubscribe("p:doc:*").await.unwrap();

        let message = messages.recv().await.unwrap();
        assert_eq!(message.pattern, "p:doc:*");
        assert_eq!(message.channel, "p:doc:host-a");
        assert_eq!(message.payload, Bytes::from("hi"));

        let _subscriber = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_subscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_publisher, _) = listener.accept().await.unwrap();
            let (mut subscriber, _) = listener.accept().await.unwrap();
            let mut buffer = BytesMut::new();
            let _ = read_value(&mut subscriber, &mut buffer).await;
            drop(subscriber);
        });

        let pubsub = RedisPubSub::connect(addr).await.unwrap();
        assert!(matches!(
            pubsub.psubscribe("p:doc:*").await,
            Err(TransportError::Disconnected)
        ));
    }

    /// Minimal Redis: PSUBSCRIBE, PUNSUBSCRIBE, PUBLISH, QUIT, and a switch
    /// that drops every open connection like a server restart
    struct FakeRedis {
        addr: SocketAddr,
        restart: tokio::sync::broadcast::Sender<()>,
    }

    type Subscribers = Arc<Mutex<Vec<(String, mpsc::UnboundedSender<RespValue>)>>>;

    impl FakeRedis {
        async fn start() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (restart, _) = tokio::sync::broadcast::channel(4);
            let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));

            let restarts = restart.clone();
            tokio::spawn(async move {
                loop {
                    let (socket, _) = listener.accept().await.unwrap();
                    tokio::spawn(serve(socket, Arc::clone(&subscribers), restarts.subscribe()));
                }
            });
            Self { addr, restart }
        }

        fn drop_connections(&self) {
            let _ = self.restart.send(());
        }
    }

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Bytes::from(s.to_string()))
    }

    async fn serve(
        socket: TcpStream,
        subscribers: Subscribers,
        mut restart: tokio::sync::broadcast::Receiver<()>,
    ) {
        let (mut reader, mut writer) = socket.into_split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<RespValue>();
        let write_task = tokio::spawn(async move {
            while let Some(value) = queue.recv().await {
                if write_value(&mut writer, &value).await.is_err() {
                    break;
                }
            }
        });

        let mut buffer = BytesMut::new();
        loop {
            let value = tokio::select! {
                value = read_value(&mut reader, &mut buffer) => match value {
                    Ok(value) => value,
                    Err(_) => break,
                },
                _ = restart.recv() => break,
            };
            let Some(args) = value.as_bulk_string_array() else {
                break;
            };
            let text = |i: usize| String::from_utf8_lossy(&args[i]).into_owned();
            match text(0).to_uppercase().as_str() {
                "PSUBSCRIBE" | "PUNSUBSCRIBE" => {
                    let kind = text(0).to_lowercase();
                    for i in 1..args.len() {
                        let pattern = text(i);
                        let mut subs = subscribers.lock().await;
                        if kind == "psubscribe" {
                            subs.push((pattern.clone(), outbound.clone()));
                        } else {
                            subs.retain(|(p, s)| !(p == &pattern && s.same_channel(&outbound)));
                        }
                        let _ = outbound.send(RespValue::Array(vec![
                            bulk(&kind),
                            bulk(&pattern),
                            RespValue::Integer(1),
                        ]));
                    }
                }
                "PUBLISH" => {
                    let channel = text(1);
                    let mut receivers = 0;
                    for (pattern, subscriber) in subscribers.lock().await.iter() {
                        if crate::types::glob_match(pattern, &channel) {
                            let push = RespValue::Array(vec![
                                bulk("pmessage"),
                                bulk(pattern),
                                bulk(&channel),
                                RespValue::BulkString(args[2].clone()),
                            ]);
                            if subscriber.send(push).is_ok() {
                                receivers += 1;
                            }
                        }
                    }
                    let _ = outbound.send(RespValue::Integer(receivers));
                }
                "QUIT" => {
                    let _ = outbound.send(RespValue::SimpleString("OK".into()));
                    break;
                }
                _ => {
                    let _ = outbound.send(RespValue::Error("ERR unknown command".into()));
                }
            }
        }
        write_task.abort();
    }

    #[tokio::test]
    async fn test_requests_fail_fast_once_subscriber_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (_publisher, _) = listener.accept().await.unwrap();
            let (subscriber, _) = listener.accept().await.unwrap();
            // Nothing listens any more, so reconnects are refused
            drop(listener);
            drop(subscriber);
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let pubsub = RedisPubSub::connect(addr).await.unwrap();
        for _ in 0..3 {
            let result = timeout(Duration::from_secs(2), pubsub.psubscribe("p:doc:*"))
                .await
                .expect("psubscribe must not hang on a dead connection");
            assert!(result.is_err());
        }
    }

    #[tokio::test]
    async fn test_recovers_after_server_restart() {
        let redis = FakeRedis::start().await;
        let pubsub = RedisPubSub::connect(redis.addr).await.unwrap();
        let mut messages = pubsub.take_messages().unwrap();

        pubsub.psubscribe("p:doc:*").await.unwrap();
        pubsub.publish("p:doc:a", Bytes::from("one")).await.unwrap();
        let message = timeout(Duration::from_secs(2), messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, Bytes::from("one"));

        redis.drop_connections();

        // Publishing reconnects on demand; delivery resumes once the
        // subscriber has restored p:doc:*
        let delivered = timeout(Duration::from_secs(5), async {
            loop {
                let _ = pubsub.publish("p:doc:a", Bytes::from("two")).await;
                if let Ok(Some(message)) =
                    timeout(Duration::from_millis(100), messages.recv()).await
                {
                    return message;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(delivered.channel, "p:doc:a");
        assert_eq!(delivered.payload, Bytes::from("two"));

        // Unsubscribing works on the new connection too
        pubsub.punsubscribe("p:doc:*").await.unwrap();
        while messages.try_recv().is_ok() {}
        pubsub.publish("p:doc:a", Bytes::from("three")).await.unwrap();
        assert!(
            timeout(Duration::from_millis(200), messages.recv())
                .await
                .is_err()
        );
    }
}
