use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use coordinator_core::Message;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

const DEFAULT_POLL_LIMIT: usize = 10;
const MAX_POLL_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct MailboxQuery {
    pub limit: Option<usize>,
}

pub(crate) async fn consume(state: &AppState, recipient: &str, query: &MailboxQuery) -> ApiResult<Vec<Message>> {
    let limit = query.limit.unwrap_or(DEFAULT_POLL_LIMIT).clamp(1, MAX_POLL_LIMIT);
    Ok(state.bus.consume_messages(recipient, limit).await?)
}

/// 核心自身的收件箱只由状态监听器消费
pub(crate) fn ensure_not_core_inbox(state: &AppState, recipient: &str) -> ApiResult<()> {
    if recipient == state.dispatcher.config().inbox {
        return Err(ApiError::Forbidden(format!("邮箱 {recipient} 由协调核心内部消费")));
    }
    Ok(())
}

/// 读取观察者邮箱（升级通知），Worker邮箱走 `/api/workers/{id}/messages`
pub async fn poll_mailbox(
    State(state): State<AppState>,
    Path(recipient): Path<String>,
    Query(query): Query<MailboxQuery>,
) -> ApiResult<impl IntoResponse> {
    ensure_not_core_inbox(&state, &recipient)?;
    if recipient != state.dispatcher.escalation().bus_recipient() {
        return Err(ApiError::NotFound(format!("观察者邮箱 {recipient}")));
    }
    Ok(success(consume(&state, &recipient, &query).await?))
}

pub async fn ack_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.bus.ack_message(&id).await?;
    Ok(success(json!({ "message_id": id, "acknowledged": true })))
}

/// 查询消息投递状态：pending / in_flight / acknowledged
pub async fn get_message_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.bus.message_status(&id).await?))
}
