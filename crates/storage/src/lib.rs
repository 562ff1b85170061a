use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{migrate::MigrateError, sqlite::SqlitePoolOptions, Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle to the streamer registry.
    pub fn streamers(&self) -> StreamerRepository {
        StreamerRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for resolving recipient configurations.
    pub fn subscriptions(&self) -> SubscriptionRepository {
        SubscriptionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to the delivery log.
    pub fn delivery_log(&self) -> DeliveryLogRepository {
        DeliveryLogRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `streamers` table.
#[derive(Clone)]
pub struct StreamerRepository {
    pool: SqlitePool,
}

impl StreamerRepository {
    /// Looks up a tracked streamer by platform broadcaster ID.
    ///
    /// `None` means no operator has linked this streamer; webhook events for
    /// it have nowhere to fan out.
    pub async fn fetch_by_broadcaster_id(
        &self,
        broadcaster_id: &str,
    ) -> Result<Option<Streamer>, StreamerError> {
        let row = sqlx::query(
            "SELECT id, broadcaster_id, login, display_name, avatar_url \
             FROM streamers WHERE broadcaster_id = ?",
        )
        .bind(broadcaster_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Streamer {
            id: row.get("id"),
            broadcaster_id: row.get("broadcaster_id"),
            login: row.get("login"),
            display_name: row.get("display_name"),
            avatar_url: row.get("avatar_url"),
        }))
    }
}

/// A tracked external streamer identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Streamer {
    pub id: String,
    pub broadcaster_id: String,
    pub login: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// Errors raised by the streamer registry.
#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository resolving which guilds receive a streamer's events.
#[derive(Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    /// Returns every subscription for the broadcaster whose guild has
    /// notifications switched on.
    ///
    /// The per-link `enabled` flag is returned as-is; the dispatcher skips
    /// disabled links without claiming so a later re-enable is unaffected.
    /// Zero rows is a valid empty fan-out, not an error.
    pub async fn resolve_recipients(
        &self,
        broadcaster_id: &str,
    ) -> Result<Vec<RecipientConfig>, SubscriptionError> {
        let rows = sqlx::query(
            "SELECT s.guild_id, s.channel_id, s.mention_role_id, s.template_json, s.enabled \
               FROM guild_subscriptions AS s \
               JOIN streamers AS st ON st.id = s.streamer_id \
               JOIN guilds AS g ON g.id = s.guild_id \
              WHERE st.broadcaster_id = ? \
                AND g.notifications_enabled = 1 \
              ORDER BY s.guild_id",
        )
        .bind(broadcaster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| RecipientConfig {
                guild_id: row.get("guild_id"),
                channel_id: row.get("channel_id"),
                mention_role_id: row.get("mention_role_id"),
                template_json: row.get("template_json"),
                enabled: row.get::<i64, _>("enabled") != 0,
            })
            .collect())
    }
}

/// Delivery configuration of one subscribed guild.
#[derive(Debug, Clone, PartialEq)]
pub struct RecipientConfig {
    pub guild_id: String,
    pub channel_id: String,
    pub mention_role_id: Option<String>,
    pub template_json: String,
    pub enabled: bool,
}

/// Errors raised while resolving recipients.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository over the `delivery_log` idempotency ledger.
#[derive(Clone)]
pub struct DeliveryLogRepository {
    pool: SqlitePool,
}

impl DeliveryLogRepository {
    /// Claims the (guild, event) pair for delivery.
    ///
    /// The insert rides on the table's uniqueness constraint, which makes it
    /// safe under concurrent dispatcher invocations across processes, not
    /// just threads. A record means "claimed", not "confirmed delivered";
    /// it is never rolled back on send failure.
    pub async fn claim(
        &self,
        record: NewDeliveryRecord<'_>,
    ) -> Result<ClaimOutcome, DeliveryLogError> {
        let result = sqlx::query(
            "INSERT INTO delivery_log (id, guild_id, event_id, channel_id, claimed_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.guild_id)
        .bind(record.event_id)
        .bind(record.channel_id)
        .bind(to_rfc3339(record.claimed_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome::Claimed),
            Err(sqlx::Error::Database(db_err)) => {
                if db_err.code().as_deref() == Some("2067") {
                    return Ok(ClaimOutcome::AlreadyClaimed);
                }
                Err(DeliveryLogError::Database(sqlx::Error::Database(db_err)))
            }
            Err(err) => Err(DeliveryLogError::Database(err)),
        }
    }

    /// Counts claims recorded for one event, used by operators and tests.
    pub async fn count_for_event(&self, event_id: &str) -> Result<i64, DeliveryLogError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM delivery_log WHERE event_id = ?")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Result of attempting to claim a (guild, event) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(self) -> bool {
        matches!(self, Self::Claimed)
    }
}

/// Data required to record a claim.
#[derive(Debug, Clone, Copy)]
pub struct NewDeliveryRecord<'a> {
    pub guild_id: &'a str,
    pub event_id: &'a str,
    pub channel_id: &'a str,
    pub claimed_at: DateTime<Utc>,
}

/// Errors raised by the delivery log.
#[derive(Debug, Error)]
pub enum DeliveryLogError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:?cache=shared")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");

        sqlx::query(
            "INSERT INTO streamers (id, broadcaster_id, login, display_name, avatar_url, created_at, updated_at) \
             VALUES ('str-1', '1337', 'nova', 'Nova', NULL, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
        )
        .execute(db.pool())
        .await
        .expect("insert streamer");

        for (guild, toggle) in [("guild-a", 1), ("guild-b", 1), ("guild-muted", 0)] {
            sqlx::query(
                "INSERT INTO guilds (id, name, notifications_enabled, created_at, updated_at) \
                 VALUES (?, ?, ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            )
            .bind(guild)
            .bind(format!("{guild} name"))
            .bind(toggle)
            .execute(db.pool())
            .await
            .expect("insert guild");
        }

        for (id, guild, enabled) in [
            ("sub-a", "guild-a", 1),
            ("sub-b", "guild-b", 0),
            ("sub-muted", "guild-muted", 1),
        ] {
            sqlx::query(
                "INSERT INTO guild_subscriptions \
                 (id, guild_id, streamer_id, channel_id, mention_role_id, template_json, enabled, created_at, updated_at) \
                 VALUES (?, ?, 'str-1', ?, NULL, '{\"content\": \"live\"}', ?, '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')",
            )
            .bind(id)
            .bind(guild)
            .bind(format!("chan-{guild}"))
            .bind(enabled)
            .execute(db.pool())
            .await
            .expect("insert subscription");
        }

        db
    }

    #[tokio::test]
    async fn resolve_excludes_guilds_with_notifications_off() {
        let db = setup_db().await;
        let recipients = db
            .subscriptions()
            .resolve_recipients("1337")
            .await
            .expect("resolve");

        let guilds: Vec<&str> = recipients
            .iter()
            .map(|config| config.guild_id.as_str())
            .collect();
        assert_eq!(guilds, vec!["guild-a", "guild-b"]);
        assert!(recipients[0].enabled);
        assert!(!recipients[1].enabled);
    }

    #[tokio::test]
    async fn resolve_returns_empty_for_untracked_streamer() {
        let db = setup_db().await;
        let recipients = db
            .subscriptions()
            .resolve_recipients("no-such-broadcaster")
            .await
            .expect("resolve");
        assert!(recipients.is_empty());
    }

    #[tokio::test]
    async fn fetch_streamer_by_broadcaster_id() {
        let db = setup_db().await;
        let streamer = db
            .streamers()
            .fetch_by_broadcaster_id("1337")
            .await
            .expect("fetch")
            .expect("present");
        assert_eq!(streamer.login, "nova");

        let missing = db
            .streamers()
            .fetch_by_broadcaster_id("404")
            .await
            .expect("fetch");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn second_claim_for_same_pair_reports_already_claimed() {
        let db = setup_db().await;
        let repo = db.delivery_log();
        let record = NewDeliveryRecord {
            guild_id: "guild-a",
            event_id: "evt-1",
            channel_id: "chan-guild-a",
            claimed_at: Utc::now(),
        };

        assert_eq!(repo.claim(record).await.expect("claim"), ClaimOutcome::Claimed);
        assert_eq!(
            repo.claim(record).await.expect("second claim"),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(repo.count_for_event("evt-1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn claims_for_different_guilds_are_independent() {
        let db = setup_db().await;
        let repo = db.delivery_log();
        let claimed_at = Utc::now();

        for guild in ["guild-a", "guild-b"] {
            let outcome = repo
                .claim(NewDeliveryRecord {
                    guild_id: guild,
                    event_id: "evt-2",
                    channel_id: "chan",
                    claimed_at,
                })
                .await
                .expect("claim");
            assert!(outcome.is_claimed());
        }
        assert_eq!(repo.count_for_event("evt-2").await.expect("count"), 2);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_record() {
        let db = setup_db().await;
        let claimed_at = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = db.delivery_log();
            handles.push(tokio::spawn(async move {
                repo.claim(NewDeliveryRecord {
                    guild_id: "guild-a",
                    event_id: "evt-3",
                    channel_id: "chan",
                    claimed_at,
                })
                .await
            }));
        }

        let mut claimed = 0;
        for handle in handles {
            if handle
                .await
                .expect("join")
                .expect("claim result")
                .is_claimed()
            {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(
            db.delivery_log()
                .count_for_event("evt-3")
                .await
                .expect("count"),
            1
        );
    }
}
