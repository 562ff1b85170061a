use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resolution substituted into Helix thumbnail URLs that still carry the
/// literal `{width}x{height}` placeholder.
const THUMBNAIL_RESOLUTION: &str = "1280x720";

/// Per-guild message template as stored in `guild_subscriptions`.
///
/// The stored JSON is validated into this shape when the recipient is
/// resolved, not trusted as free-form at render time. A template either
/// carries a rich embed or is plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageTemplate {
    Embedded {
        #[serde(default)]
        content: String,
        embed: EmbedTemplate,
    },
    Plain { content: String },
}

impl MessageTemplate {
    /// Parses a stored template, rejecting JSON that fits neither shape.
    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        serde_json::from_str(raw).map_err(TemplateError::Invalid)
    }
}

impl Default for MessageTemplate {
    fn default() -> Self {
        Self::Plain {
            content: "{mention_role} {streamer_display_name} is live: {stream_title}\n{stream_url}"
                .to_string(),
        }
    }
}

/// Rich-embed portion of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub fields: Vec<EmbedFieldTemplate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer_text: Option<String>,
    #[serde(default)]
    pub timestamp: bool,
}

/// One name/value column of an embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedFieldTemplate {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

/// Errors raised while loading a stored template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("stored template is not valid: {0}")]
    Invalid(serde_json::Error),
}

/// Live data one event's rendering runs against.
///
/// Built once per event from the stream event, the Helix snapshot, and the
/// streamer registry row; shared read-only across every recipient.
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub display_name: String,
    pub login: String,
    pub stream_title: String,
    pub game_name: String,
    pub viewer_count: u64,
    pub thumbnail_url: String,
    pub avatar_url: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RenderContext {
    pub fn stream_url(&self) -> String {
        format!("https://twitch.tv/{}", self.login)
    }

    fn substitute(&self, input: &str, mention_role: &str) -> String {
        input
            .replace("{streamer_display_name}", &self.display_name)
            .replace("{streamer_login}", &self.login)
            .replace("{stream_title}", &self.stream_title)
            .replace("{game_name}", &self.game_name)
            .replace("{viewer_count}", &self.viewer_count.to_string())
            .replace("{stream_url}", &self.stream_url())
            .replace("{stream_thumbnail_url}", &self.thumbnail_url)
            .replace(
                "{streamer_avatar_url}",
                self.avatar_url.as_deref().unwrap_or(""),
            )
            .replace("{started_at}", &self.started_at.to_rfc3339())
            .replace("{mention_role}", mention_role)
    }
}

/// Rewrites the `{width}x{height}` token Helix leaves in thumbnail URLs.
pub fn normalize_thumbnail_url(url: &str) -> String {
    url.replace("{width}x{height}", THUMBNAIL_RESOLUTION)
}

/// Message produced by expanding a template against one event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMessage {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<RenderedEmbed>,
}

/// Expanded embed carried by a rendered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedEmbed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub fields: Vec<RenderedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// One rendered embed field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

/// Expands every string field of the template against the event data.
///
/// An unconfigured mention role substitutes to an empty string. Rendering
/// itself cannot fail; the fallible step is [`MessageTemplate::from_json`].
pub fn render(
    template: &MessageTemplate,
    ctx: &RenderContext,
    mention_role_id: Option<&str>,
) -> RenderedMessage {
    let mention = mention_role_id
        .map(|id| format!("<@&{id}>"))
        .unwrap_or_default();

    match template {
        MessageTemplate::Plain { content } => RenderedMessage {
            content: ctx.substitute(content, &mention),
            embed: None,
        },
        MessageTemplate::Embedded { content, embed } => {
            let sub = |value: &Option<String>| {
                value.as_deref().map(|raw| ctx.substitute(raw, &mention))
            };
            let fields = embed
                .fields
                .iter()
                .map(|field| RenderedField {
                    name: ctx.substitute(&field.name, &mention),
                    value: ctx.substitute(&field.value, &mention),
                    inline: field.inline,
                })
                .collect();

            RenderedMessage {
                content: ctx.substitute(content, &mention),
                embed: Some(RenderedEmbed {
                    title: sub(&embed.title),
                    description: sub(&embed.description),
                    url: sub(&embed.url),
                    color: embed.color,
                    thumbnail_url: sub(&embed.thumbnail_url),
                    image_url: sub(&embed.image_url),
                    fields,
                    footer_text: sub(&embed.footer_text),
                    timestamp: embed.timestamp.then_some(ctx.started_at),
                }),
            }
        }
    }
}
