mod chat;
mod health;
mod sessions;
mod websocket;

pub use chat::create_chat_handler;
pub use health::{health_handler, health_live_handler, metrics_handler, root_handler};
pub use sessions::{get_session, list_sessions};
pub use websocket::agent_websocket_handler;
