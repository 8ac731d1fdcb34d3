use clap::Parser;
use log::{debug, error, info, warn};
use server::config::{self, DEFAULT_OUTBOX_CAPACITY};
use server::connection::websocket::WebSocketFactory;
use server::{Hub, HubConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "8081")]
    port: u16,

    /// Directory holding server-side game data
    #[arg(short, long, env = "DATA_PATH")]
    data_path: Option<PathBuf>,

    /// Path upgraded to the real-time endpoint
    #[arg(long, default_value = "/ws")]
    ws_path: String,

    /// Packets a client may have queued before new ones are dropped for it
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    outbox_capacity: usize,
}

/// Main-method of the application.
/// Parses arguments, starts the hub loop and feeds it accepted connections until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // Configured path, then the Docker mount, then the working directory
    let data_dir = config::resolve_data_dir(args.data_path.as_deref());

    let hub = Hub::new(&data_dir, HubConfig::new(args.outbox_capacity));
    let handle = hub.handle();
    let hub_task = tokio::spawn(hub.run());

    let address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&address).await?;
    let factory = Arc::new(WebSocketFactory::new(args.ws_path));

    info!("Starting server on {}", address);
    info!("Real-time endpoint available at {}", factory.path());

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                    }

                    let handle = handle.clone();
                    let factory = Arc::clone(&factory);
                    tokio::spawn(async move {
                        match handle.serve(factory.as_ref(), stream).await {
                            Ok(client_id) => debug!("Connection from {} registered as client {}", addr, client_id),
                            Err(e) => warn!("Rejected connection from {}: {}", addr, e),
                        }
                    });
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = &mut shutdown => {
                info!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    handle.shutdown()?;
    if let Err(e) = hub_task.await {
        error!("Hub task panicked: {}", e);
    }

    Ok(())
}
