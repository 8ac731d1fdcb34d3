use clap::Parser;
use client::HubClient;
use log::{error, info};
use shared::{ClientId, ClientPacket, ServerPacket};
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8081")]
    server: String,

    /// Identity announced to the hub
    #[arg(short = 'i', long)]
    identity: Option<String>,

    /// Send every line to this client instead of broadcasting
    #[arg(short = 't', long)]
    target: Option<ClientId>,

    /// Echo broadcasts back to this client as well
    #[arg(long)]
    include_self: bool,

    /// Simulate network latency in milliseconds
    #[arg(short = 'l', long, default_value = "0")]
    fake_ping: u64,
}

/// Reads lines from stdin and sends each one to the hub, printing whatever the
/// hub delivers until either side closes.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    info!("Starting client...");
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut hub = HubClient::connect(&args.server, args.identity.as_deref())
        .await?
        .with_fake_ping(args.fake_ping);
    let client_id = hub.wait_connected().await?;
    info!("Type a line and press Enter to send it (client {})", client_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => {
                    let packet = match (args.target, args.include_self) {
                        (Some(target), _) => ClientPacket::to_client(target, line),
                        (None, true) => ClientPacket::broadcast_all(line),
                        (None, false) => ClientPacket::broadcast(line),
                    };
                    hub.send(&packet).await?;
                }
                None => break,
            },
            packet = hub.recv() => match packet {
                Ok(ServerPacket::Message { sender, payload }) => {
                    println!("[{}] {}", sender, String::from_utf8_lossy(&payload));
                }
                Ok(ServerPacket::Disconnected { reason }) => {
                    println!("Disconnected by server: {}", reason);
                    break;
                }
                Ok(ServerPacket::Connected { .. }) => {}
                Err(e) => {
                    error!("Connection lost: {}", e);
                    return Ok(());
                }
            },
        }
    }

    hub.close().await?;
    Ok(())
}
