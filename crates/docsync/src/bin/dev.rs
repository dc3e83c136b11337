use clap::Parser;
use docsync::{
    ClientListener, Config, DocumentServer, InstanceId, MemoryBroker, MemoryLockNode,
    SqliteBackend, StorageBackend, Transports,
};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run several docsync instances locally for development", long_about = None)]
struct Args {
    /// Number of instances to start
    #[arg(short, long, default_value = "3")]
    nodes: u16,

    /// Client port of the first instance; the others follow
    #[arg(short, long, default_value = "7400")]
    base_port: u16,

    /// Directory for the shared document database
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Channel prefix
    #[arg(long, default_value = "docsync")]
    prefix: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    if args.nodes == 0 {
        eprintln!("Error: Number of nodes must be at least 1");
        std::process::exit(1);
    }

    info!("Starting {}-instance local cluster...", args.nodes);

    let mut config = Config::default();
    config.instance.prefix = args.prefix.clone();

    // Keep alive to prevent cleanup
    let mut _temp_dir = None;
    let db_path = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            dir.join("docs.db")
        }
        None => {
            let dir = TempDir::new()?;
            let path = dir.path().join("docs.db");
            _temp_dir = Some(dir);
            path
        }
    };
    info!("Shared document database at {:?}", db_path);
    let backend: Arc<dyn StorageBackend> = Arc::new(SqliteBackend::open(&db_path, &config.storage)?);

    // All instances share one broker and one lock node, like a single Redis
    let broker = MemoryBroker::new();
    let lock_node = MemoryLockNode::new();

    let mut servers = Vec::new();
    let mut tasks = Vec::new();
    for i in 0..args.nodes {
        let identifier = InstanceId::generate();
        let transports = Transports::in_process(&broker, &lock_node, &config.lock).await;
        let server = DocumentServer::launch(
            &config,
            identifier.clone(),
            transports,
            Arc::clone(&backend),
        )?;

        let addr = format!("127.0.0.1:{}", args.base_port + i);
        let listener = ClientListener::bind(Arc::clone(&server), addr.as_str())
            .await?
            .with_queue_capacity(config.server.client_queue_capacity);
        info!("Instance {}: {} clients={}", i + 1, identifier, addr);

        tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!("Instance {} listener error: {}", identifier, e);
            }
        }));
        servers.push(server);
    }

    info!("All instances started. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");

    for task in &tasks {
        task.abort();
    }
    for server in &servers {
        server.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}
