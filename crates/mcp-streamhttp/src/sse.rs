//! Server-Sent Events framing.

use chrono::{SecondsFormat, Utc};

use crate::model::JsonRpcMessage;

/// Render one `message` event. The `id:` line is present only when the
/// transport has an event store assigning resumable ids.
pub(crate) fn message_event(
    message: &JsonRpcMessage,
    event_id: Option<&str>,
) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(message)?;
    let mut frame = String::with_capacity(data.len() + 32);
    frame.push_str("event: message\n");
    if let Some(id) = event_id {
        frame.push_str("id: ");
        frame.push_str(id);
        frame.push('\n');
    }
    frame.push_str("data: ");
    frame.push_str(&data);
    frame.push_str("\n\n");
    Ok(frame)
}

/// SSE comment written by the keep-alive scheduler; ignored by clients.
pub(crate) fn keep_alive_comment() -> String {
    format!(
        ": keep-alive {}\n\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}
