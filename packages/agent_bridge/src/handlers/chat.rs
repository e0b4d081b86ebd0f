use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;
use tracing::error;

use crate::AppState;

/// Body of `POST /api/chat/create`.
///
/// Failures are reported in the body with status 200, which is what existing
/// clients check for.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CreateChatResponse {
    Created {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Failed {
        error: &'static str,
    },
}

pub async fn create_chat_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = match state.launcher.create_chat().await {
        Ok(chat_id) => CreateChatResponse::Created { chat_id },
        Err(e) if e.is_agent_failure() => {
            error!(error = %e, "Agent failed to create chat");
            CreateChatResponse::Failed {
                error: "Failed to create chat",
            }
        }
        Err(e) => {
            error!(error = %e, "Error creating chat");
            CreateChatResponse::Failed {
                error: "Internal server error",
            }
        }
    };
    Json(response)
}
