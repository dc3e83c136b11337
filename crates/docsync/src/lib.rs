// Architecture modules
pub mod api;
pub mod awareness;
pub mod backend;
pub mod codec;
pub mod config;
pub mod document;
pub mod lock;
pub mod persistence;
pub mod pubsub;
pub mod registry;
pub mod replication;
pub mod resp;
pub mod server;
pub mod storage;
pub mod types;

// Public exports
pub use api::ClientListener;
pub use awareness::{Awareness, AwarenessChanges, AwarenessUpdate};
pub use backend::Transports;
pub use codec::{CodecError, Envelope, Message, SyncFrame};
pub use config::Config;
pub use document::{Document, DocumentState, SharedDocument};
pub use lock::{LockError, LockHandle, LockService, MemoryLockNode, Redlock, RedlockSettings};
pub use persistence::PersistenceAdapter;
pub use pubsub::{MemoryBroker, PubSub, TransportError};
pub use registry::DocumentRegistry;
pub use replication::{
    CoordinatorSettings, PersistDecision, ReplicationCoordinator, ReplicationError,
};
pub use server::{ClientConnection, DocumentServer, ServerError, StoreOutcome};
pub use storage::{MemoryBackend, SqliteBackend, StorageBackend};
pub use types::{ChannelKeys, InstanceId, InstanceIdError};
