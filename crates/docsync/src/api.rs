use crate::codec::Envelope;
use crate::server::{ClientConnection, DocumentServer};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Largest accepted client frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one length-prefixed frame (4 bytes big-endian); `None` on clean EOF
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Frames queued for one client socket before it counts as stalled
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// TCP endpoint for editing clients
///
/// Every frame is an encoded envelope; the document name in it selects the
/// document, so one socket can edit several documents. Outgoing frames go
/// through a bounded queue; a client that lets it fill up is disconnected.
pub struct ClientListener {
    server: Arc<DocumentServer>,
    listener: TcpListener,
    queue_capacity: usize,
}

impl ClientListener {
    pub async fn bind<A: ToSocketAddrs>(server: Arc<DocumentServer>, addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            server,
            listener,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        })
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> io::Result<()> {
        info!("Client listener on {}", self.listener.local_addr()?);

        loop {
            let (socket, peer_addr) = self.listener.accept().await?;
            debug!("Client connection from {}", peer_addr);
            socket.set_nodelay(true)?;

            let server = Arc::clone(&self.server);
            let capacity = self.queue_capacity;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, server, capacity).await {
                    error!("Client connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Sending side of a client's bounded write queue
#[derive(Clone)]
struct Outbound {
    sender: mpsc::Sender<Bytes>,
    overflow: Arc<Notify>,
}

impl Outbound {
    /// Queue a frame without waiting; false once the client is gone or stalled
    fn push(&self, payload: Bytes) -> bool {
        match self.sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

struct Attached {
    connection: ClientConnection,
    forwarder: Option<JoinHandle<()>>,
}

async fn handle_connection(
    socket: TcpStream,
    server: Arc<DocumentServer>,
    queue_capacity: usize,
) -> io::Result<()> {
    let (mut reader, writer) = socket.into_split();
    let (sender, queue) = mpsc::channel::<Bytes>(queue_capacity);
    let outbound = Outbound {
        sender,
        overflow: Arc::new(Notify::new()),
    };
    let writer_task = tokio::spawn(write_loop(writer, queue));
    let mut documents: HashMap<String, Attached> = HashMap::new();
    let mut stalled = false;

    let result = loop {
        let read = tokio::select! {
            read = read_frame(&mut reader) => read,
            _ = outbound.overflow.notified() => {
                warn!("Client stopped reading, {} frames queued", queue_capacity);
                stalled = true;
                break Ok(());
            }
        };
        let frame = match read {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed client frame: {}", e);
                continue;
            }
        };

        if !documents.contains_key(&envelope.document_name) {
            match attach(&server, &envelope.document_name, &outbound).await {
                Some(attached) => {
                    documents.insert(envelope.document_name.clone(), attached);
                }
                None => continue,
            }
        }
        let Some(attached) = documents.get_mut(&envelope.document_name) else {
            continue;
        };

        match server.handle_envelope(&mut attached.connection, envelope).await {
            Ok(replies) => {
                for reply in replies {
                    outbound.push(Bytes::from(reply.encode()));
                }
            }
            Err(e) => warn!("Client frame rejected: {}", e),
        }
    };

    for (_, attached) in documents.drain() {
        if let Some(forwarder) = attached.forwarder {
            forwarder.abort();
        }
        server.disconnect(attached.connection).await;
    }
    drop(outbound);
    if stalled {
        // The writer may be blocked on a full socket forever
        writer_task.abort();
    } else {
        let _ = writer_task.await;
    }
    result
}

/// Connect to a document and start forwarding its fan-out to the socket
async fn attach(
    server: &Arc<DocumentServer>,
    document_name: &str,
    outbound: &Outbound,
) -> Option<Attached> {
    let mut connection = match server.connect(document_name).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Could not open {}: {}", document_name, e);
            return None;
        }
    };

    for frame in connection.take_initial_frames() {
        outbound.push(Bytes::from(frame.encode()));
    }
    let forwarder = connection.take_subscription().map(|mut subscription| {
        let outbound = outbound.clone();
        tokio::spawn(async move {
            while let Some(payload) = subscription.recv().await {
                if !outbound.push(payload) {
                    break;
                }
            }
        })
    });

    Some(Attached {
        connection,
        forwarder,
    })
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(payload) = queue.recv().await {
        if let Err(e) = write_frame(&mut writer, &payload).await {
            debug!("Client write failed: {}", e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}
