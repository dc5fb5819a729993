//! Client sessions: Host-based dispatch, NIP-42 authentication, EVENT/REQ
//! handling and live broadcast delivery.

use anyhow::{anyhow, Result};
use ap_core::nostr::{self, RawEvent};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::filters::{parse_filters, Filter};
use crate::instance::Instance;
use crate::kinds::CLIENT_AUTH;
use crate::AppState;

const AUTH_FRESHNESS_SECONDS: i64 = 600;

#[derive(Default)]
struct AuthSession {
    pubkey: Option<String>,
    challenge: Option<String>,
}

/// Everything is served from "/": websocket upgrades, the NIP-11 info
/// document, and a plain landing line for browsers.
pub async fn root_handler(State(state): State<AppState>, req: Request) -> Response {
    let (mut parts, _body) = req.into_parts();
    let headers = parts.headers.clone();
    let Some(host) = request_host(&headers) else {
        return (StatusCode::BAD_REQUEST, "missing host header").into_response();
    };
    let Some(instance) = state.registry.dispatch(&host).await else {
        return (StatusCode::NOT_FOUND, "unknown relay host").into_response();
    };

    if let Ok(ws) = WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        return ws
            .on_upgrade(move |socket| handle_socket(instance, socket))
            .into_response();
    }

    let wants_info = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("application/nostr+json"))
        .unwrap_or(false);
    if wants_info {
        return (
            [(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")],
            Json(instance.info_document()),
        )
            .into_response();
    }

    (StatusCode::OK, instance.config.info.name.clone()).into_response()
}

fn request_host(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    let host = match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    Some(host.to_string())
}

async fn handle_socket(instance: Arc<Instance>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut broadcast_rx = instance.broadcast.subscribe();
    let mut subscriptions: HashMap<String, Vec<Filter>> = HashMap::new();
    let mut auth = AuthSession::default();

    // Challenge immediately; nothing else is accepted until the session
    // binds a pubkey.
    let _ = send_auth_challenge(&mut sender, &mut auth).await;

    loop {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(err) = handle_text_message(
                            &instance,
                            &mut sender,
                            &mut subscriptions,
                            &mut auth,
                            text.to_string(),
                        ).await {
                            let _ = send_json(&mut sender, json!(["NOTICE", err.to_string()])).await;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(_))) => {
                        let _ = send_json(&mut sender, json!(["NOTICE", "unsupported: binary message"])).await;
                    }
                    Some(Err(_)) => break,
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(event) => {
                        if let Err(err) = dispatch_live(
                            &instance,
                            &mut sender,
                            &subscriptions,
                            auth.pubkey.as_deref(),
                            &event,
                        ).await {
                            tracing::debug!(error = %err, "live delivery failed");
                            break;
                        }
                    }
                    // The instance was torn down (config reload); the client
                    // reconnects and lands on the replacement.
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "subscriber lagged behind broadcast");
                    }
                }
            }
        }
    }
}

async fn send_auth_challenge(
    sender: &mut SplitSink<WebSocket, Message>,
    auth: &mut AuthSession,
) -> Result<()> {
    let challenge = Uuid::new_v4().to_string();
    auth.challenge = Some(challenge.clone());
    send_json(sender, json!(["AUTH", challenge])).await
}

async fn handle_text_message(
    instance: &Arc<Instance>,
    sender: &mut SplitSink<WebSocket, Message>,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
    auth: &mut AuthSession,
    text: String,
) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(&text)?;
    let arr = value.as_array().ok_or_else(|| anyhow!("invalid message"))?;
    let msg_type = arr
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("invalid message"))?;

    match msg_type {
        "EVENT" => {
            handle_event_message(instance, sender, auth.pubkey.as_deref(), arr).await?;
        }
        "REQ" => {
            handle_req_message(instance, sender, subscriptions, auth.pubkey.as_deref(), arr)
                .await?;
        }
        "CLOSE" => {
            if let Some(sub_id) = arr.get(1).and_then(|v| v.as_str()) {
                subscriptions.remove(sub_id);
            }
        }
        "AUTH" => {
            handle_auth_message(instance, sender, auth, arr).await?;
        }
        _ => {
            let _ = send_json(sender, json!(["NOTICE", "unsupported: message type"])).await;
        }
    }

    Ok(())
}

async fn handle_event_message(
    instance: &Arc<Instance>,
    sender: &mut SplitSink<WebSocket, Message>,
    auth_pubkey: Option<&str>,
    arr: &[serde_json::Value],
) -> Result<()> {
    let event_value = arr.get(1).ok_or_else(|| anyhow!("missing event"))?;
    let event = nostr::parse_event(event_value)?;

    if let Err(err) = nostr::verify_event(&event) {
        return send_ok(sender, &event.id, false, &format!("invalid: {err}")).await;
    }

    if let Some(reason) = instance.on_event(auth_pubkey, &event).await {
        return send_ok(sender, &event.id, false, &reason).await;
    }

    if nostr::is_ephemeral_kind(event.kind) {
        instance.on_ephemeral_event(&event).await;
        if !instance.prevent_broadcast(&event) {
            let _ = instance.broadcast.send(event.clone());
        }
        return send_ok(sender, &event.id, true, "").await;
    }

    match instance.store.store_event(&event).await {
        Ok(true) => {
            instance.on_event_saved(&event).await;
            if !instance.prevent_broadcast(&event) {
                let _ = instance.broadcast.send(event.clone());
            }
            send_ok(sender, &event.id, true, "").await
        }
        Ok(false) => send_ok(sender, &event.id, true, "duplicate: already have this event").await,
        Err(err) => {
            tracing::warn!(id = %event.id, error = %err, "failed to store event");
            send_ok(sender, &event.id, false, "error: failed to store event").await
        }
    }
}

async fn handle_req_message(
    instance: &Arc<Instance>,
    sender: &mut SplitSink<WebSocket, Message>,
    subscriptions: &mut HashMap<String, Vec<Filter>>,
    auth_pubkey: Option<&str>,
    arr: &[serde_json::Value],
) -> Result<()> {
    let sub_id = arr
        .get(1)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing subscription id"))?
        .to_string();
    let filters = parse_filters(&arr[2..])?;

    if let Some(reason) = instance.on_request(auth_pubkey).await {
        return send_closed(sender, &sub_id, &reason).await;
    }

    subscriptions.insert(sub_id.clone(), filters.clone());

    let mut seen = HashSet::new();
    let mut backfill = Vec::new();
    for filter in &filters {
        for event in instance.query_stored(auth_pubkey, filter).await? {
            if seen.insert(event.id.clone()) {
                backfill.push(event);
            }
        }
    }
    backfill.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    for event in &backfill {
        send_event(sender, &sub_id, event).await?;
    }
    send_eose(sender, &sub_id).await?;
    Ok(())
}

async fn handle_auth_message(
    instance: &Arc<Instance>,
    sender: &mut SplitSink<WebSocket, Message>,
    auth: &mut AuthSession,
    arr: &[serde_json::Value],
) -> Result<()> {
    let event_value = arr.get(1).ok_or_else(|| anyhow!("missing auth event"))?;
    let event = nostr::parse_event(event_value)?;

    if event.kind != CLIENT_AUTH {
        return send_ok(sender, &event.id, false, "invalid: kind").await;
    }
    if let Err(err) = nostr::verify_event(&event) {
        return send_ok(sender, &event.id, false, &format!("invalid: {err}")).await;
    }

    let now = nostr::now();
    if (now - event.created_at).abs() > AUTH_FRESHNESS_SECONDS {
        return send_ok(sender, &event.id, false, "invalid: stale auth").await;
    }

    if auth.challenge.is_none()
        || auth.challenge.as_deref() != event.first_tag_value("challenge").as_deref()
    {
        return send_ok(sender, &event.id, false, "auth-required: challenge mismatch").await;
    }

    let relay_matches = event
        .first_tag_value("relay")
        .map(|value| value.contains(&instance.config.host))
        .unwrap_or(false);
    if !relay_matches {
        return send_ok(sender, &event.id, false, "auth-required: relay mismatch").await;
    }

    auth.pubkey = Some(event.pubkey.clone());
    auth.challenge = None;
    send_ok(sender, &event.id, true, "").await
}

async fn dispatch_live(
    instance: &Arc<Instance>,
    sender: &mut SplitSink<WebSocket, Message>,
    subscriptions: &HashMap<String, Vec<Filter>>,
    viewer: Option<&str>,
    event: &RawEvent,
) -> Result<()> {
    if instance.prevent_broadcast(event) || instance.is_internal_event(event) {
        return Ok(());
    }
    if instance.groups.is_group_event(event) && !instance.groups.can_read(viewer, event).await {
        return Ok(());
    }

    for (sub_id, filters) in subscriptions {
        if filters.iter().any(|filter| filter.matches(event)) {
            let outgoing = instance.strip_signature(viewer, event.clone()).await;
            send_event(sender, sub_id, &outgoing).await?;
        }
    }
    Ok(())
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    sub_id: &str,
    event: &RawEvent,
) -> Result<()> {
    send_json(sender, json!(["EVENT", sub_id, event])).await
}

async fn send_eose(sender: &mut SplitSink<WebSocket, Message>, sub_id: &str) -> Result<()> {
    send_json(sender, json!(["EOSE", sub_id])).await
}

async fn send_closed(
    sender: &mut SplitSink<WebSocket, Message>,
    sub_id: &str,
    reason: &str,
) -> Result<()> {
    send_json(sender, json!(["CLOSED", sub_id, reason])).await
}

async fn send_ok(
    sender: &mut SplitSink<WebSocket, Message>,
    event_id: &str,
    ok: bool,
    message: &str,
) -> Result<()> {
    send_json(sender, json!(["OK", event_id, ok, message])).await
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    value: serde_json::Value,
) -> Result<()> {
    let text = serde_json::to_string(&value)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}
