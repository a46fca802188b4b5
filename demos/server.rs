use std::pin::Pin;
use std::sync::Arc;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_hub::events::ServerEvent;
use ws_hub::{Server, ServerOptions};

/// echo server: replies to every text message with the same text
#[derive(Parser)]
struct Args {
    /// server host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[clap(short, long, default_value_t = 9000)]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let options = ServerOptions {
        bind_addr: format!("{}:{}", args.host, args.port),
        ..Default::default()
    };
    let mut server = Server::new(options);
    let handle = server.handle();

    server.on_event(Arc::new(move |event: ServerEvent| {
        let handle = handle.clone();
        Box::pin(async move {
            match event {
                ServerEvent::ClientConnected { id, remote_endpoint } => {
                    tracing::info!(%id, %remote_endpoint, "client connected");
                }
                ServerEvent::MessageReceived { id, text } => {
                    if let Err(e) = handle.send_message(&id, text).await {
                        tracing::warn!(%id, error = %e, "failed to echo message");
                    }
                }
                ServerEvent::BinaryReceived { id, data } => {
                    if let Err(e) = handle.send_binary_message(&id, data).await {
                        tracing::warn!(%id, error = %e, "failed to echo binary message");
                    }
                }
                ServerEvent::ClientDisconnected { id, .. } => {
                    tracing::info!(%id, "client disconnected");
                }
                ServerEvent::PassiveUserExpired { id } => {
                    tracing::info!(%id, "passive session expired");
                }
                ServerEvent::ServerStopped => {
                    tracing::info!("server stopped");
                }
            }
        }) as Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    }));

    server.start().await.expect("failed to start server");
    tracing::info!(addr = ?server.local_addr(), "listening");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    tracing::info!("shutting down");
    server.shutdown().await.expect("failed to shut down cleanly");
}
