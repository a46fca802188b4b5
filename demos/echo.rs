use std::io::Write;
use std::pin::Pin;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::Level;
use tracing_subscriber::util::SubscriberInitExt;
use ws_hub::events::ClientEvent;
use ws_hub::{Client, ClientOptions};

/// interactive websocket echo client: type a line, see it echoed back
#[derive(Parser)]
struct Args {
    /// server host
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    /// server port
    #[clap(short, long, default_value_t = 9000)]
    port: u16,
    /// request path
    #[clap(long, default_value = "/")]
    path: String,
    /// x-user-id to present, for re-identification across reconnects
    #[clap(long)]
    user_id: Option<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::fmt()
        .with_max_level(Level::DEBUG)
        .finish()
        .try_init()
        .expect("failed to init log");
    let args = Args::parse();

    let (tx, mut rx) = mpsc::channel(8);
    let mut options = ClientOptions::new(args.host, args.port);
    options.path = args.path;
    options.user_id = args.user_id;
    options.event_handlers.push(Arc::new(move |event: ClientEvent| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(event).await;
        }) as Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    }));

    let mut client = Client::new(options);
    client.connect().await.expect("failed to connect");
    println!("connected as {:?}", client.user_id());

    let mut input = String::new();
    loop {
        print!("[SEND] > ");
        std::io::stdout().flush().unwrap();
        input.clear();
        if std::io::stdin().read_line(&mut input).unwrap() == 0 || input == "quit\n" {
            break;
        }
        client.send_message(input.trim_end().to_string()).await.unwrap();
        match rx.recv().await {
            Some(ClientEvent::MessageReceived { text }) => println!("[RECV] > {text}"),
            Some(ClientEvent::Disconnected { code, reason }) => {
                println!("[DISCONNECTED] code={code:?} reason={reason}");
                break;
            }
            Some(_) => {}
            None => break,
        }
    }

    client.disconnect("Closing").await.expect("failed to disconnect cleanly");
}
