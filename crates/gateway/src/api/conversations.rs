//! `GET /conversations/:id` — read back a persisted conversation
//! bundle. Reads are side-effect free.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use verdant_conversations::ConversationStore;

use crate::state::AppState;

use super::api_error;

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let id = match ConversationStore::sanitize_id(&id) {
        Ok(id) => id.to_owned(),
        Err(e) => return api_error(StatusCode::BAD_REQUEST, e.client_message()),
    };

    match state.store.load_async(&id).await {
        Ok(bundle) => Json(bundle).into_response(),
        Err(e) => {
            let status = StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            api_error(status, e.client_message())
        }
    }
}
