#![allow(dead_code)]

use docsync::pubsub::MemoryPubSub;
use docsync::{
    Config, DocumentServer, Envelope, InstanceId, MemoryBackend, MemoryBroker, MemoryLockNode,
    Message, Redlock, SyncFrame, Transports,
};
use std::sync::Arc;
use std::time::Duration;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

pub const TEXT: &str = "content";

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Short timings so lifecycle tests run fast
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.instance.prefix = "test".to_string();
    config.lock.retry_count = 3;
    config.lock.retry_delay_ms = 20;
    config.lifecycle.disconnect_delay_ms = 100;
    config.persistence.debounce_ms = 50;
    config.persistence.max_debounce_ms = 200;
    config
}

/// One instance attached to a shared broker, lock node and store
///
/// The returned pub/sub handle is the instance's own client, so tests can
/// inspect its subscriptions.
pub async fn instance(
    broker: &MemoryBroker,
    node: &MemoryLockNode,
    backend: &MemoryBackend,
    config: &Config,
) -> (Arc<DocumentServer>, Arc<MemoryPubSub>) {
    let pubsub = Arc::new(broker.client().await);
    let transports = Transports {
        pubsub: pubsub.clone(),
        locks: Arc::new(Redlock::new(
            vec![Arc::new(node.clone())],
            config.lock.redlock_settings(),
        )),
    };
    let server = DocumentServer::launch(
        config,
        InstanceId::generate(),
        transports,
        Arc::new(backend.clone()),
    )
    .unwrap();
    (server, pubsub)
}

/// Append `text` on a client replica and return its full state
pub fn edit(client: &Doc, text: &str) -> Vec<u8> {
    {
        let mut txn = client.transact_mut();
        let content = txn.get_or_insert_text(TEXT);
        let len = content.get_string(&txn).len() as u32;
        content.insert(&mut txn, len, text);
    }
    client
        .transact()
        .encode_state_as_update_v1(&StateVector::default())
}

pub fn apply(client: &Doc, update: &[u8]) {
    client
        .transact_mut()
        .apply_update(Update::decode_v1(update).unwrap())
        .unwrap();
}

pub fn text_of(doc: &Doc) -> String {
    let txn = doc.transact();
    let text = txn
        .get_text(TEXT)
        .map(|content| content.get_string(&txn))
        .unwrap_or_default();
    text
}

pub fn update_envelope(document_name: &str, update: Vec<u8>) -> Envelope {
    Envelope::new(document_name, Message::Sync(SyncFrame::Update(update)))
}

/// Text of `document_name` on `server`, empty when not loaded
pub async fn content(server: &DocumentServer, document_name: &str) -> String {
    let Some(shared) = server.registry().get(document_name).await else {
        return String::new();
    };
    let document = shared.lock().await;
    text_of(document.doc())
}

pub async fn wait_for_content(server: &DocumentServer, document_name: &str, expected: &str) {
    for _ in 0..200 {
        if content(server, document_name).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{} never reached {:?}, last {:?}",
        document_name,
        expected,
        content(server, document_name).await
    );
}
