use std::time::Duration;

use golive_core::template::{RenderedEmbed, RenderedMessage};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use url::Url;

/// Longest backoff honored before the single 429 retry. Anything longer
/// would blow the per-recipient delivery budget anyway.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Client for the Discord REST API message-send endpoint.
#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: Url,
    bot_token: String,
}

impl DiscordClient {
    /// Creates a new client with the provided configuration.
    pub fn new(bot_token: impl Into<String>, base_url: Url, http: Client) -> Self {
        Self {
            http,
            base_url,
            bot_token: bot_token.into(),
        }
    }

    /// Posts a rendered message to the given channel.
    ///
    /// A 429 is retried exactly once after the advertised backoff; every
    /// other failure is terminal for this recipient. The caller wraps the
    /// whole call in its per-recipient timeout.
    pub async fn create_message(
        &self,
        channel_id: &str,
        message: &RenderedMessage,
    ) -> Result<(), DiscordError> {
        let url = self
            .base_url
            .join(&format!("channels/{channel_id}/messages"))?;
        let body = message_body(message);

        let response = self.send(&url, &body).await?;
        if response.status() != StatusCode::TOO_MANY_REQUESTS {
            return ensure_success(response).await;
        }

        let backoff = retry_backoff(response).await;
        tokio::time::sleep(backoff.min(MAX_RETRY_BACKOFF)).await;

        let retried = self.send(&url, &body).await?;
        if retried.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(DiscordError::RateLimited);
        }
        ensure_success(retried).await
    }

    async fn send(&self, url: &Url, body: &Value) -> Result<Response, DiscordError> {
        Ok(self
            .http
            .post(url.clone())
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(body)
            .send()
            .await?)
    }
}

fn message_body(message: &RenderedMessage) -> Value {
    let mut body = json!({ "content": message.content });
    if let Some(embed) = &message.embed {
        body["embeds"] = json!([embed_body(embed)]);
    }
    body
}

fn embed_body(embed: &RenderedEmbed) -> Value {
    let mut value = json!({});
    if let Some(title) = &embed.title {
        value["title"] = json!(title);
    }
    if let Some(description) = &embed.description {
        value["description"] = json!(description);
    }
    if let Some(url) = &embed.url {
        value["url"] = json!(url);
    }
    if let Some(color) = embed.color {
        value["color"] = json!(color);
    }
    if let Some(thumbnail) = &embed.thumbnail_url {
        value["thumbnail"] = json!({ "url": thumbnail });
    }
    if let Some(image) = &embed.image_url {
        value["image"] = json!({ "url": image });
    }
    if !embed.fields.is_empty() {
        value["fields"] = json!(embed
            .fields
            .iter()
            .map(|field| json!({
                "name": field.name,
                "value": field.value,
                "inline": field.inline,
            }))
            .collect::<Vec<_>>());
    }
    if let Some(footer) = &embed.footer_text {
        value["footer"] = json!({ "text": footer });
    }
    if let Some(timestamp) = &embed.timestamp {
        value["timestamp"] = json!(timestamp.to_rfc3339());
    }
    value
}

/// Reads the advertised backoff from a 429 response.
///
/// Discord reports fractional seconds in the JSON body; the `Retry-After`
/// header is the fallback when the body does not parse.
async fn retry_backoff(response: Response) -> Duration {
    let header_secs = response
        .headers()
        .get("Retry-After")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<f64>().ok());

    let body_secs = response
        .json::<RateLimitBody>()
        .await
        .ok()
        .map(|body| body.retry_after);

    body_secs
        .or(header_secs)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(1))
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

/// Errors produced by the Discord client.
#[derive(Debug, Error)]
pub enum DiscordError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rate limited after retry")]
    RateLimited,
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}

async fn ensure_success(response: Response) -> Result<(), DiscordError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(DiscordError::Status { status, body });
    }
    Ok(())
}
