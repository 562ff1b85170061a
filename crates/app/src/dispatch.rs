use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use tracing::{error, info, warn};

use golive_core::event::{StreamEvent, StreamSnapshot};
use golive_core::template::{self, MessageTemplate, RenderContext};
use golive_discord::DiscordClient;
use golive_storage::{ClaimOutcome, Database, NewDeliveryRecord, RecipientConfig, Streamer};
use golive_twitch::{AppTokenCache, HelixClient};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Orchestrates one event's fan-out: snapshot fetch, recipient resolution,
/// and per-recipient claim/render/deliver with failures isolated per
/// recipient.
///
/// The webhook handler has already acknowledged the event source by the
/// time this runs, so nothing here is surfaced back upstream.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Database,
    helix: HelixClient,
    tokens: Arc<AppTokenCache>,
    discord: DiscordClient,
    clock: Clock,
    delivery_timeout: Duration,
}

/// Result of one fan-out run, recorded in metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FanoutOutcome {
    Completed,
    OfflineSkip,
    NoRecipients,
    Untracked,
    Aborted,
}

impl FanoutOutcome {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::OfflineSkip => "offline_skip",
            Self::NoRecipients => "no_recipients",
            Self::Untracked => "untracked",
            Self::Aborted => "aborted",
        }
    }
}

/// Terminal state of one recipient's delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Sent,
    AlreadyClaimed,
    Disabled,
    RenderError,
    SendError,
    Timeout,
    ClaimError,
}

impl DeliveryResult {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::AlreadyClaimed => "already_claimed",
            Self::Disabled => "disabled",
            Self::RenderError => "render_error",
            Self::SendError => "send_error",
            Self::Timeout => "timeout",
            Self::ClaimError => "claim_error",
        }
    }
}

impl Dispatcher {
    pub fn new(
        storage: Database,
        helix: HelixClient,
        tokens: Arc<AppTokenCache>,
        discord: DiscordClient,
        clock: Clock,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            helix,
            tokens,
            discord,
            clock,
            delivery_timeout,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Fans one verified `stream.online` event out to every recipient.
    pub async fn handle_stream_online(&self, event: StreamEvent) {
        let outcome = self.run_fanout(&event).await;
        counter!("fanout_events_total", "outcome" => outcome.metric_label()).increment(1);
    }

    async fn run_fanout(&self, event: &StreamEvent) -> FanoutOutcome {
        let streamer = match self
            .storage
            .streamers()
            .fetch_by_broadcaster_id(&event.broadcaster_id)
            .await
        {
            Ok(Some(streamer)) => streamer,
            Ok(None) => {
                warn!(
                    stage = "fanout",
                    event_id = %event.id,
                    broadcaster_id = %event.broadcaster_id,
                    "event for untracked streamer, nothing to fan out"
                );
                return FanoutOutcome::Untracked;
            }
            Err(err) => {
                error!(
                    stage = "fanout",
                    event_id = %event.id,
                    error = %err,
                    "failed to load streamer registry row"
                );
                return FanoutOutcome::Aborted;
            }
        };

        // The snapshot is fetched once per event and shared read-only
        // across all recipients.
        let snapshot = match self.fetch_snapshot(event).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                info!(
                    stage = "fanout",
                    event_id = %event.id,
                    broadcaster_id = %event.broadcaster_id,
                    "stream already offline before snapshot fetch, skipping fan-out"
                );
                return FanoutOutcome::OfflineSkip;
            }
            Err(()) => return FanoutOutcome::Aborted,
        };

        let recipients = match self
            .storage
            .subscriptions()
            .resolve_recipients(&event.broadcaster_id)
            .await
        {
            Ok(recipients) => recipients,
            Err(err) => {
                error!(
                    stage = "fanout",
                    event_id = %event.id,
                    error = %err,
                    "failed to resolve recipients"
                );
                return FanoutOutcome::Aborted;
            }
        };
        if recipients.is_empty() {
            info!(stage = "fanout", event_id = %event.id, "no recipients subscribed");
            return FanoutOutcome::NoRecipients;
        }

        let context = Arc::new(build_context(event, &streamer, snapshot));
        let mut handles = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            let dispatcher = self.clone();
            let context = Arc::clone(&context);
            let event_id = event.id.clone();
            handles.push(tokio::spawn(async move {
                let result = dispatcher
                    .deliver_to_recipient(&event_id, &recipient, &context)
                    .await;
                counter!("fanout_deliveries_total", "result" => result.metric_label())
                    .increment(1);
            }));
        }
        for handle in handles {
            if let Err(err) = handle.await {
                error!(stage = "fanout", event_id = %event.id, error = %err, "delivery task panicked");
            }
        }

        FanoutOutcome::Completed
    }

    async fn fetch_snapshot(&self, event: &StreamEvent) -> Result<Option<StreamSnapshot>, ()> {
        let token = match self.tokens.bearer((self.clock)()).await {
            Ok(token) => token,
            Err(err) => {
                error!(stage = "fanout", event_id = %event.id, error = %err, "failed to obtain app token");
                return Err(());
            }
        };

        match self.helix.get_stream(&token, &event.broadcaster_id).await {
            Ok(Some(stream)) => Ok(Some(StreamSnapshot {
                title: stream.title,
                game_name: stream.game_name,
                viewer_count: stream.viewer_count,
                thumbnail_url: stream.thumbnail_url,
            })),
            Ok(None) => Ok(None),
            Err(err) => {
                error!(stage = "fanout", event_id = %event.id, error = %err, "snapshot fetch failed");
                Err(())
            }
        }
    }

    /// One recipient's claim → render → deliver sequence.
    ///
    /// The claim is the idempotency boundary: once a record exists the
    /// recipient is never notified again for this event, even when the
    /// send afterwards fails. Redelivery of the event is the only retry
    /// mechanism, and the claim makes it a no-op.
    async fn deliver_to_recipient(
        &self,
        event_id: &str,
        recipient: &RecipientConfig,
        context: &RenderContext,
    ) -> DeliveryResult {
        let guild_id = recipient.guild_id.as_str();

        // A disabled link is skipped without claiming so it is unaffected
        // by a later re-enable.
        if !recipient.enabled {
            info!(stage = "deliver", event_id, guild_id, "subscription disabled, skipping");
            return DeliveryResult::Disabled;
        }

        let claim = self
            .storage
            .delivery_log()
            .claim(NewDeliveryRecord {
                guild_id,
                event_id,
                channel_id: &recipient.channel_id,
                claimed_at: (self.clock)(),
            })
            .await;
        match claim {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyClaimed) => {
                info!(stage = "deliver", event_id, guild_id, "already claimed, skipping");
                return DeliveryResult::AlreadyClaimed;
            }
            Err(err) => {
                error!(stage = "deliver", event_id, guild_id, error = %err, "claim failed");
                return DeliveryResult::ClaimError;
            }
        }

        let template = match MessageTemplate::from_json(&recipient.template_json) {
            Ok(template) => template,
            Err(err) => {
                warn!(stage = "deliver", event_id, guild_id, error = %err, "stored template invalid");
                return DeliveryResult::RenderError;
            }
        };
        let message = template::render(&template, context, recipient.mention_role_id.as_deref());

        let send = tokio::time::timeout(
            self.delivery_timeout,
            self.discord.create_message(&recipient.channel_id, &message),
        )
        .await;
        match send {
            Ok(Ok(())) => {
                info!(
                    stage = "deliver",
                    event_id,
                    guild_id,
                    channel_id = %recipient.channel_id,
                    "notification delivered"
                );
                DeliveryResult::Sent
            }
            Ok(Err(err)) => {
                warn!(
                    stage = "deliver",
                    event_id,
                    guild_id,
                    channel_id = %recipient.channel_id,
                    error = %err,
                    "delivery failed, claim kept"
                );
                DeliveryResult::SendError
            }
            Err(_) => {
                warn!(
                    stage = "deliver",
                    event_id,
                    guild_id,
                    channel_id = %recipient.channel_id,
                    timeout_secs = self.delivery_timeout.as_secs(),
                    "delivery timed out, claim kept"
                );
                DeliveryResult::Timeout
            }
        }
    }
}

fn build_context(
    event: &StreamEvent,
    streamer: &Streamer,
    snapshot: StreamSnapshot,
) -> RenderContext {
    RenderContext {
        display_name: event.broadcaster_display_name.clone(),
        login: event.broadcaster_login.clone(),
        stream_title: snapshot.title,
        game_name: snapshot.game_name,
        viewer_count: snapshot.viewer_count,
        thumbnail_url: template::normalize_thumbnail_url(&snapshot.thumbnail_url),
        avatar_url: streamer.avatar_url.clone(),
        started_at: event.started_at,
    }
}
