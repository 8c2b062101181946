//! CLI for AgentBus
//!
//! Subcommands:
//! - `server`: run the broker behind the WebSocket gateway
//! - `dead-letters`: inspect or purge the dead-letter store
//! - `client`: connect, subscribe and publish once (useful for smoke tests)

use std::sync::Arc;

use agentbus::broker::message::delivery_key;
use agentbus::config::{Settings, load_config};
use agentbus::persistence::{MessageStore, SledStore};
use agentbus::transport::websocket::start_websocket_server;
use agentbus::{Broker, WebSocketTransport};
use clap::{Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "agentbus")]
enum Command {
    /// Start the broker and the WebSocket server
    Server,
    /// Inspect the dead-letter store
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
    /// Run a smoke-test client (hello, subscribe, publish)
    Client {
        /// WebSocket server URL to connect to
        #[arg(long, default_value = "ws://127.0.0.1:8080")]
        url: String,
        #[arg(long, default_value = "smoke-client")]
        agent: String,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// Print every entry as one JSON line
    List,
    /// Remove one entry
    Purge { message_id: String, recipient: String },
}

#[tokio::main]
async fn main() {
    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            agentbus::utils::logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    agentbus::utils::logging::init(&settings.logging.level);

    let result = match Command::parse() {
        Command::Server => run_server(settings).await,
        Command::DeadLetters { action } => run_dead_letters(&settings, action),
        Command::Client { url, agent } => run_client(&url, &agent).await,
    };
    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

fn open_store(settings: &Settings) -> agentbus::Result<SledStore> {
    let store = if settings.storage.temporary {
        SledStore::temporary()?
    } else {
        SledStore::open(&settings.storage.path)?
    };
    Ok(store)
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let config = settings.broker.to_broker_config()?;
    let store = Arc::new(open_store(&settings)?);
    let transport = Arc::new(WebSocketTransport::new());

    let broker = Broker::builder(config)
        .store(store.clone())
        .transport(transport.clone())
        .build()?;

    broker.recover()?;
    let background = broker.spawn_background();

    tokio::select! {
        result = start_websocket_server(&addr, broker.clone(), transport) => {
            if let Err(e) = result {
                error!("WebSocket server failed: {e}");
            } else {
                error!("WebSocket server exited unexpectedly.");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    broker.shutdown();
    for handle in background {
        let _ = handle.await;
    }
    store.flush()?;
    Ok(())
}

fn run_dead_letters(
    settings: &Settings,
    action: DeadLetterAction,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = open_store(settings)?;
    match action {
        DeadLetterAction::List => {
            for entry in store.dead_letters()? {
                println!("{}", serde_json::to_string(&entry)?);
            }
        }
        DeadLetterAction::Purge {
            message_id,
            recipient,
        } => {
            if store.purge_dead_letter(&delivery_key(&message_id, &recipient))? {
                info!(%message_id, %recipient, "dead letter purged");
            } else {
                error!(%message_id, %recipient, "no such dead letter");
            }
            store.flush()?;
        }
    }
    Ok(())
}

async fn run_client(url: &str, agent: &str) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;

    let frames = [
        json!({ "type": "hello", "agent_id": agent, "versions": ["2.0"] }),
        json!({ "type": "subscribe", "pattern": "smoke.*" }),
        json!({
            "type": "submit",
            "message": {
                "destination": { "kind": "topic", "value": "smoke.test" },
                "payload": "hello from the smoke client"
            }
        }),
    ];
    for frame in frames {
        ws_stream.send(WsMessage::text(frame.to_string())).await?;
    }

    // welcome, subscribed, accepted, then our own publish
    for _ in 0..4 {
        let Some(msg) = ws_stream.next().await else {
            break;
        };
        let msg = msg?;
        if let Ok(text) = msg.to_text() {
            info!("Received: {text}");
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}
