use crate::remote::hub::{BufferHub, HubMessage};
use crate::remote::routes::AppState;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state.hub))
}

async fn handle_ws(socket: WebSocket, hub: BufferHub) {
    let (client_id, outbound) = hub.connect_client();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        while let Ok(msg) = outbound.recv().await {
            let msg = match msg {
                HubMessage::Text(text) => Message::Text(text.into()),
                HubMessage::Binary(data) => Message::Binary(data.into()),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => hub.handle_text(client_id, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                log::debug!("Buffer client {} socket error: {}", client_id, e);
                break;
            }
        }
    }

    hub.disconnect_client(client_id);
    writer.abort();
}
