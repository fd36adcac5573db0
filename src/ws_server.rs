use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, RwLock};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::types::{Channel, Notification};

struct Client {
    sender: mpsc::UnboundedSender<Message>,
    subscriptions: HashSet<Channel>,
}

#[derive(Clone)]
struct WsState {
    clients: Arc<RwLock<HashMap<Uuid, Client>>>,
}

/// Run the WebSocket fan-out server: accepts clients on `/ws`, tracks
/// their channel subscriptions and delivers orchestrator notifications.
/// No message log is kept; a client joining mid-stream receives nothing
/// retroactively.
pub async fn serve(
    bind: &str,
    notifications: broadcast::Sender<Notification>,
) -> anyhow::Result<()> {
    let state = WsState {
        clients: Arc::new(RwLock::new(HashMap::new())),
    };

    let fanout_state = state.clone();
    let mut stream = notifications.subscribe();
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(notification) => broadcast_notification(&fanout_state, &notification).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Fan-out lagged, {} notifications dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        );

    info!("Starting WebSocket server on {}", bind);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let client_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();

    state.clients.write().await.insert(
        client_id,
        Client {
            sender: sender.clone(),
            subscriptions: HashSet::new(),
        },
    );
    info!("WebSocket client connected: {}", client_id);

    // Greeting goes out before any subscription can exist.
    let _ = sender.send(Message::Text(
        json!({ "type": "connected", "clientId": client_id }).to_string(),
    ));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let reply = {
                    let mut clients = state.clients.write().await;
                    let Some(client) = clients.get_mut(&client_id) else {
                        break;
                    };
                    handle_client_frame(&mut client.subscriptions, &text)
                };
                if sender.send(Message::Text(reply.to_string())).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(_)) => {
                let reply = json!({ "type": "error", "message": "Invalid JSON message" });
                if sender.send(Message::Text(reply.to_string())).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // ping/pong control frames
            Err(e) => {
                error!("WebSocket error for client {}: {:?}", client_id, e);
                break;
            }
        }
    }

    state.clients.write().await.remove(&client_id);
    writer.abort();
    info!("WebSocket client disconnected: {}", client_id);
}

/// Handle one inbound JSON frame and produce the reply. Protocol errors
/// are recovered per message; the connection stays open.
fn handle_client_frame(subscriptions: &mut HashSet<Channel>, text: &str) -> Value {
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return json!({ "type": "error", "message": "Invalid JSON message" });
    };

    match message.get("type").and_then(Value::as_str) {
        Some("subscribe") => {
            let applied = apply_channels(subscriptions, &message, true);
            json!({ "type": "subscribed", "channels": applied })
        }
        Some("unsubscribe") => {
            let removed = apply_channels(subscriptions, &message, false);
            json!({ "type": "unsubscribed", "channels": removed })
        }
        Some("ping") => json!({ "type": "pong" }),
        _ => json!({ "type": "error", "message": "Unknown message type" }),
    }
}

fn apply_channels(
    subscriptions: &mut HashSet<Channel>,
    message: &Value,
    subscribe: bool,
) -> Vec<&'static str> {
    let channels = message
        .get("channels")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut applied = Vec::new();
    for channel in channels {
        let Some(parsed) = channel.as_str().and_then(Channel::parse) else {
            continue;
        };
        if subscribe {
            subscriptions.insert(parsed);
            applied.push(parsed.as_str());
        } else if subscriptions.remove(&parsed) {
            applied.push(parsed.as_str());
        }
    }

    applied
}

fn should_deliver(subscriptions: &HashSet<Channel>, channel: Channel) -> bool {
    subscriptions.contains(&channel) || subscriptions.contains(&Channel::All)
}

/// Deliver one notification to every interested client. A send failure
/// removes that client but never interrupts delivery to the others.
async fn broadcast_notification(state: &WsState, notification: &Notification) {
    let channel = notification.channel();
    let text = notification.to_message().to_string();

    let mut failed = Vec::new();
    {
        let clients = state.clients.read().await;
        for (id, client) in clients.iter() {
            if should_deliver(&client.subscriptions, channel)
                && client.sender.send(Message::Text(text.clone())).is_err()
            {
                failed.push(*id);
            }
        }
    }

    if !failed.is_empty() {
        let mut clients = state.clients.write().await;
        for id in failed {
            error!("Removing client {} after send failure", id);
            clients.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexedEvent, IndexedTransaction};
    use chrono::Utc;

    fn event_fixture() -> IndexedEvent {
        IndexedEvent {
            contract_address: "0x5fbdb2315678afecb367f032d93f642f64180aa3".to_string(),
            contract_name: "Token".to_string(),
            event_name: "Transfer".to_string(),
            block_number: 100,
            transaction_hash: "0xabc".to_string(),
            transaction_index: 0,
            log_index: 0,
            args: json!({}),
            timestamp: Utc::now(),
            confirmed: false,
            created_at: Utc::now(),
        }
    }

    fn tx_fixture() -> IndexedTransaction {
        IndexedTransaction {
            hash: "0xdef".to_string(),
            block_number: 100,
            block_hash: "0x123".to_string(),
            transaction_index: 0,
            from: "0x1".to_string(),
            to: "0x2".to_string(),
            value: "0".to_string(),
            gas_price: "0".to_string(),
            gas_limit: "21000".to_string(),
            gas_used: "21000".to_string(),
            nonce: 0,
            data: "0x".to_string(),
            timestamp: Utc::now(),
            status: 1,
            contract_address: None,
            logs: json!([]),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn events_only_subscription_filters_transactions() {
        let mut subs = HashSet::new();
        subs.insert(Channel::Events);

        assert!(should_deliver(&subs, Notification::Event(event_fixture()).channel()));
        assert!(should_deliver(
            &subs,
            Notification::EventsBatch(vec![event_fixture()]).channel()
        ));
        assert!(!should_deliver(
            &subs,
            Notification::Transaction(tx_fixture()).channel()
        ));
        assert!(!should_deliver(&subs, Channel::Sync));
    }

    #[test]
    fn empty_subscription_receives_nothing() {
        let subs = HashSet::new();
        for channel in [Channel::Events, Channel::Transactions, Channel::Sync, Channel::All] {
            assert!(!should_deliver(&subs, channel));
        }
    }

    #[test]
    fn all_subscription_receives_everything() {
        let mut subs = HashSet::new();
        subs.insert(Channel::All);
        for channel in [Channel::Events, Channel::Transactions, Channel::Sync, Channel::All] {
            assert!(should_deliver(&subs, channel));
        }
    }

    #[test]
    fn subscribe_applies_recognized_channels_only() {
        let mut subs = HashSet::new();
        let reply = handle_client_frame(
            &mut subs,
            r#"{"type":"subscribe","channels":["events","blocks","sync"]}"#,
        );
        assert_eq!(reply["type"], "subscribed");
        assert_eq!(reply["channels"], json!(["events", "sync"]));
        assert!(subs.contains(&Channel::Events));
        assert!(subs.contains(&Channel::Sync));
        assert_eq!(subs.len(), 2);
    }

    #[test]
    fn unsubscribe_reports_removed_channels() {
        let mut subs = HashSet::new();
        subs.insert(Channel::Events);

        let reply = handle_client_frame(
            &mut subs,
            r#"{"type":"unsubscribe","channels":["events","transactions"]}"#,
        );
        assert_eq!(reply["type"], "unsubscribed");
        // "transactions" was never subscribed, so only "events" is listed.
        assert_eq!(reply["channels"], json!(["events"]));
        assert!(subs.is_empty());
    }

    #[test]
    fn ping_pongs() {
        let mut subs = HashSet::new();
        let reply = handle_client_frame(&mut subs, r#"{"type":"ping"}"#);
        assert_eq!(reply, json!({ "type": "pong" }));
    }

    #[test]
    fn malformed_and_unknown_frames_recover() {
        let mut subs = HashSet::new();

        let reply = handle_client_frame(&mut subs, "not json at all");
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Invalid JSON message");

        let reply = handle_client_frame(&mut subs, r#"{"type":"replay"}"#);
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Unknown message type");

        assert!(subs.is_empty());
    }
}
