use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use serde::Deserialize;

use crate::AppState;
use crate::ws;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "chatId")]
    chat_id: Option<String>,
}

/// `GET /ws?chatId=<optional>`
pub async fn agent_websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // An empty chatId is treated as absent
    let chat_id = query.chat_id.filter(|id| !id.is_empty());
    ws.on_upgrade(move |socket| ws::handle_agent_ws(socket, state, chat_id))
}
