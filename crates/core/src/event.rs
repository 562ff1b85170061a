use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Parsed payload of a single `stream.online` notification.
///
/// Lives only for the duration of one webhook call; only [`StreamEvent::id`]
/// outlives it, as the key of the delivery log.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamEvent {
    /// Opaque identifier, unique per live session.
    pub id: String,
    #[serde(rename = "broadcaster_user_id")]
    pub broadcaster_id: String,
    #[serde(rename = "broadcaster_user_login")]
    pub broadcaster_login: String,
    #[serde(rename = "broadcaster_user_name")]
    pub broadcaster_display_name: String,
    pub started_at: DateTime<Utc>,
}

/// Stream metadata fetched from Helix after the event arrives.
///
/// The webhook payload does not carry title or category, so the dispatcher
/// fetches this once per event and shares it read-only across recipients.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSnapshot {
    pub title: String,
    pub game_name: String,
    pub viewer_count: u64,
    pub thumbnail_url: String,
}
