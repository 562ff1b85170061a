use std::{sync::Arc, time::Instant};

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use golive_core::event::StreamEvent;

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
const HEADER_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
const HEADER_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

const STREAM_ONLINE: &str = "stream.online";

/// Replay window: messages older than this are refused at the door.
const STALE_WINDOW_SECS: i64 = 600;

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let message_type_header = get_required_header(&headers, HEADER_MESSAGE_TYPE)?.to_string();
    let label = MessageType::try_from(message_type_header.as_str())
        .map(MessageType::metric_label)
        .unwrap_or("unknown");

    let result = handle_inner(&state, &headers, &body).await;
    histogram!("webhook_ack_latency_seconds", "type" => label)
        .record(start.elapsed().as_secs_f64());
    result
}

async fn handle_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    let now = state.now();
    state.limits().check_webhook(now)?;

    let message_type_value = get_required_header(headers, HEADER_MESSAGE_TYPE)?;
    let message_type = MessageType::try_from(message_type_value).map_err(|detail| {
        ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_message_type", detail)
    })?;
    let message_label = message_type.metric_label();

    let message_id = get_required_header(headers, HEADER_MESSAGE_ID)?;
    let timestamp_raw = get_required_header(headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(headers, HEADER_SIGNATURE)?;

    let timestamp = parse_timestamp(timestamp_raw)
        .map_err(|err| ProblemResponse::new(StatusCode::BAD_REQUEST, "invalid_timestamp", err))?;

    let age = now.signed_duration_since(timestamp).num_seconds();
    if age > STALE_WINDOW_SECS {
        warn!(
            stage = "ingress",
            %message_id,
            %timestamp_raw,
            now = %now.to_rfc3339(),
            age_seconds = age,
            "timestamp older than the replay window"
        );
        return Err(ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "stale_timestamp",
            "timestamp is older than the allowed 10 minute window",
        ));
    }

    let secret = state.webhook_secret();
    verify_signature(&secret, message_id, timestamp_raw, body, signature).map_err(|err| {
        counter!("notify_invalid_signature_total").increment(1);
        ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_signature", err)
    })?;

    counter!("notify_ingress_total", "type" => message_label).increment(1);

    let json_value: Value = serde_json::from_slice(body).map_err(|err| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("failed to parse payload: {err}"),
        )
    })?;

    match message_type {
        MessageType::Verification => challenge_response(&json_value),
        MessageType::Notification => handle_notification(state, &json_value, message_id, now),
        MessageType::Revocation => handle_revocation(&json_value, message_id),
    }
}

/// Subscription-verification handshake: echo the challenge back as plain
/// text, never JSON-wrapped.
fn challenge_response(json_value: &Value) -> Result<Response, ProblemResponse> {
    let challenge = json_value
        .get("challenge")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_challenge",
                "verification payload must include challenge",
            )
        })?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/plain")
        .body(challenge.to_string().into())
        .unwrap())
}

fn handle_notification(
    state: &AppState,
    json_value: &Value,
    message_id: &str,
    now: DateTime<Utc>,
) -> Result<Response, ProblemResponse> {
    let event_type = json_value
        .get("subscription")
        .and_then(|sub| sub.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_event_type",
                "subscription.type is required",
            )
        })?;

    if event_type != STREAM_ONLINE {
        info!(stage = "ingress", %message_id, event_type, "ignoring unsupported event type");
        return Ok(empty_ok());
    }

    let event_value = json_value.get("event").ok_or_else(|| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "missing_event",
            "notification payload must include event",
        )
    })?;
    let event: StreamEvent = serde_json::from_value(event_value.clone()).map_err(|err| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_event",
            format!("failed to parse stream.online event: {err}"),
        )
    })?;

    // Transport-layer duplicate: the source resent before it saw our ack.
    // Recorded only after the payload validates, so a rejected body does
    // not swallow a retry of the same message ID.
    if state.replay_guard().check_and_insert(message_id, now) {
        counter!("notify_duplicate_total").increment(1);
        info!(stage = "ingress", %message_id, "duplicate webhook message skipped");
        return Ok(empty_ok());
    }

    info!(
        stage = "ingress",
        %message_id,
        event_id = %event.id,
        broadcaster_id = %event.broadcaster_id,
        "stream.online accepted, fanning out"
    );

    // The ack must not wait on the fan-out; failures past this point are
    // observable only in logs and metrics.
    let dispatcher = state.dispatcher();
    tokio::spawn(async move {
        dispatcher.handle_stream_online(event).await;
    });

    Ok(empty_ok())
}

fn handle_revocation(json_value: &Value, message_id: &str) -> Result<Response, ProblemResponse> {
    let subscription = json_value.get("subscription");
    let subscription_id = subscription
        .and_then(|sub| sub.get("id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let status = subscription
        .and_then(|sub| sub.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    warn!(
        stage = "ingress",
        %message_id,
        subscription_id,
        status,
        "subscription revoked by the event source"
    );
    Ok(empty_ok())
}

fn empty_ok() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn get_required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            ProblemResponse::new(
                StatusCode::BAD_REQUEST,
                "missing_header",
                format!("missing header {name}"),
            )
        })
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| format!("invalid RFC3339 timestamp: {err}"))
}

fn verify_signature(
    secret: &Arc<[u8]>,
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[derive(Debug, Clone, Copy)]
enum MessageType {
    Verification,
    Notification,
    Revocation,
}

impl TryFrom<&str> for MessageType {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "webhook_callback_verification" => Ok(Self::Verification),
            "notification" => Ok(Self::Notification),
            "revocation" => Ok(Self::Revocation),
            other => Err(format!("unsupported message type: {other}")),
        }
    }
}

impl MessageType {
    fn metric_label(self) -> &'static str {
        match self {
            Self::Verification => "verification",
            Self::Notification => "notification",
            Self::Revocation => "revocation",
        }
    }
}
