use docsync::{
    ClientListener, Config, DocumentServer, MemoryBackend, SqliteBackend, StorageBackend,
    Transports,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_file("config.toml")?;
    let identifier = config.instance.instance_id()?;
    info!("Starting docsync server");
    info!("Instance ID: {}", identifier);

    let backend: Arc<dyn StorageBackend> = match &config.storage.db_path {
        Some(db_path) => {
            // Ensure data directory exists
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening database at: {:?}", db_path);
            Arc::new(SqliteBackend::open(db_path, &config.storage)?)
        }
        None => {
            info!("No db_path configured, documents are kept in memory only");
            Arc::new(MemoryBackend::new())
        }
    };

    let transports = Transports::connect(&config).await?;
    info!("Pub/sub and lock transports connected");

    let server = DocumentServer::launch(&config, identifier, transports, backend)?;
    info!("Replication coordinator started");

    let listener = ClientListener::bind(Arc::clone(&server), &config.server.client_addr)
        .await?
        .with_queue_capacity(config.server.client_queue_capacity);
    info!("Client listener bound to {}", listener.local_addr()?);

    let listener_handle = tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            tracing::error!("Client listener error: {}", e);
        }
    });

    info!("docsync server fully initialized and running");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    listener_handle.abort();
    server.shutdown().await;
    Ok(())
}
