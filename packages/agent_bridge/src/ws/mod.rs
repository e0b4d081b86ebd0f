//! Agent WebSocket
//!
//! One connection is one session. The client sends `send` commands; the
//! server answers with a `connected` greeting, then per command a `reset`,
//! the agent's own events, and a closing `result`.

mod handler;
mod protocol;

pub use handler::handle_agent_ws;
pub use protocol::{Outbound, ServerMessage};
