use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::OnceLock;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use corvid_core::registry::{PushEvent, UserId};
use corvid_core::{GatewayError, GatewayState};
use corvid_models::gateway::*;
use corvid_models::presence::PresenceStatus;
use corvid_models::room::RoomId;
use corvid_models::signal::SignalKind;

use crate::session::Session;

const WS_MAX_MESSAGES_PER_MINUTE_DEFAULT: u32 = 240;
const WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT: u32 = 60;
const WS_MAX_TYPING_EVENTS_PER_MINUTE_DEFAULT: u32 = 120;
const WS_MAX_SIGNALING_EVENTS_PER_MINUTE_DEFAULT: u32 = 60;

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

/// User-level rate limiters shared across all connections for the same
/// user. This prevents users from bypassing rate limits by opening
/// multiple tabs/connections.
struct UserRateLimits {
    /// Any opcode except heartbeat.
    messages: DefaultKeyedRateLimiter<UserId>,
    presence: DefaultKeyedRateLimiter<UserId>,
    typing: DefaultKeyedRateLimiter<UserId>,
    signaling: DefaultKeyedRateLimiter<UserId>,
}

static USER_RATE_LIMITS: OnceLock<UserRateLimits> = OnceLock::new();

fn user_rate_limits() -> &'static UserRateLimits {
    USER_RATE_LIMITS.get_or_init(|| {
        let rate_limits = UserRateLimits {
            messages: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(env_u32(
                    "CORVID_WS_MAX_MESSAGES_PER_MINUTE",
                    WS_MAX_MESSAGES_PER_MINUTE_DEFAULT,
                ))
                .unwrap(),
            )),
            presence: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(env_u32(
                    "CORVID_WS_MAX_PRESENCE_UPDATES_PER_MINUTE",
                    WS_MAX_PRESENCE_UPDATES_PER_MINUTE_DEFAULT,
                ))
                .unwrap(),
            )),
            typing: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(env_u32(
                    "CORVID_WS_MAX_TYPING_EVENTS_PER_MINUTE",
                    WS_MAX_TYPING_EVENTS_PER_MINUTE_DEFAULT,
                ))
                .unwrap(),
            )),
            signaling: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(env_u32(
                    "CORVID_WS_MAX_SIGNALING_EVENTS_PER_MINUTE",
                    WS_MAX_SIGNALING_EVENTS_PER_MINUTE_DEFAULT,
                ))
                .unwrap(),
            )),
        };

        // Periodic cleanup of stale rate limiter entries to bound memory.
        tokio::spawn(async {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            interval.tick().await; // skip immediate first tick
            loop {
                interval.tick().await;
                let rl = user_rate_limits();
                rl.messages.retain_recent();
                rl.presence.retain_recent();
                rl.typing.retain_recent();
                rl.signaling.retain_recent();
                rl.messages.shrink_to_fit();
                rl.presence.shrink_to_fit();
                rl.typing.shrink_to_fit();
                rl.signaling.shrink_to_fit();
            }
        });

        rate_limits
    })
}

impl UserRateLimits {
    /// `Ok(())` when allowed, `Err(retry_after_ms)` when limited.
    fn check(&self, user_id: UserId, opcode: u8) -> Result<(), u64> {
        let clock = DefaultClock::default();
        let now = clock.now();

        if let Err(not_until) = self.messages.check_key(&user_id) {
            let wait = not_until.wait_time_from(now);
            return Err(wait.as_millis().max(1) as u64);
        }

        let not_until = match opcode {
            OP_PRESENCE_HEARTBEAT => self.presence.check_key(&user_id).err(),
            OP_TYPING_START | OP_TYPING_STOP => self.typing.check_key(&user_id).err(),
            OP_CALL_OFFER | OP_CALL_ANSWER | OP_CALL_ICE => {
                self.signaling.check_key(&user_id).err()
            }
            _ => None,
        };

        if let Some(not_until) = not_until {
            let wait = not_until.wait_time_from(now);
            Err(wait.as_millis().max(1) as u64)
        } else {
            Ok(())
        }
    }
}

async fn send_json(
    sender: &mut (impl SinkExt<Message> + Unpin),
    payload: Value,
) -> Result<(), ()> {
    sender
        .send(Message::Text(payload.to_string().into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    code: u16,
    reason: &str,
) -> Result<(), ()> {
    sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await
        .map_err(|_| ())
}

/// Errors go only to the connection whose action produced them.
async fn send_error(sender: &mut (impl SinkExt<Message> + Unpin), err: &GatewayError) {
    let _ = send_json(
        sender,
        json!({
            "op": OP_ERROR,
            "d": { "code": err.code(), "message": err.to_string() }
        }),
    )
    .await;
}

async fn send_ack(sender: &mut (impl SinkExt<Message> + Unpin), d: Value) {
    let _ = send_json(sender, json!({ "op": OP_ACK, "d": d })).await;
}

pub async fn handle_connection(socket: WebSocket, state: GatewayState) {
    let (mut sender, mut receiver) = socket.split();

    if state.registry.at_capacity() {
        let _ = send_close(&mut sender, 1013, "Gateway is at connection capacity").await;
        return;
    }

    // Send HELLO
    let hello = json!({
        "op": OP_HELLO,
        "d": { "heartbeat_interval": state.config.heartbeat_interval.as_millis() as u64 }
    });
    if send_json(&mut sender, hello).await.is_err() {
        return;
    }

    // Wait for IDENTIFY; the credential is verified by the external
    // identity collaborator and an unverified socket is never admitted.
    let user_id = match tokio::time::timeout(
        state.config.identify_timeout,
        wait_for_identify(&mut receiver, &state),
    )
    .await
    {
        Ok(Some(user_id)) => user_id,
        _ => {
            send_error(&mut sender, &GatewayError::Unauthenticated).await;
            let _ = send_close(&mut sender, 4001, "Identify failed").await;
            return;
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let Some(connection_id) = state.registry.try_open(user_id, outbound_tx) else {
        let _ = send_close(&mut sender, 1008, "Too many concurrent sessions for this user").await;
        return;
    };
    let mut session = Session::new(connection_id, user_id);

    let ready = json!({
        "op": OP_DISPATCH,
        "t": EVENT_READY,
        "s": session.next_sequence(),
        "d": {
            "user_id": user_id,
            "connection_id": connection_id.to_string(),
            "session_id": &session.session_id,
        }
    });
    if send_json(&mut sender, ready).await.is_err() {
        state.disconnect(connection_id).await;
        return;
    }
    tracing::info!(user_id, connection_id = %connection_id, "gateway session established");

    run_session(sender, receiver, outbound_rx, &mut session, &state).await;

    // Always run the full release cascade, whatever ended the session.
    state.disconnect(connection_id).await;
}

async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &GatewayState,
) -> Option<UserId> {
    while let Some(Ok(msg)) = receiver.next().await {
        let Message::Text(text) = msg else { continue };
        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if payload.get("op").and_then(|v| v.as_u64()) != Some(OP_IDENTIFY as u64) {
            continue;
        }
        let token = payload
            .get("d")
            .and_then(|d| d.get("token"))
            .and_then(|v| v.as_str())?;
        return state.identity.verify(token).await.ok();
    }
    None
}

async fn run_session(
    mut sender: impl SinkExt<Message> + Unpin,
    mut receiver: impl StreamExt<Item = Result<Message, axum::Error>> + Unpin,
    mut outbound_rx: mpsc::UnboundedReceiver<PushEvent>,
    session: &mut Session,
    state: &GatewayState,
) {
    let rate_limits = user_rate_limits();
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let mut ws_ping_interval = tokio::time::interval(Duration::from_secs(20));
    ws_ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);

    let disconnect_reason = loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(payload) = serde_json::from_str::<Value>(&text) else {
                            send_error(&mut sender, &GatewayError::Validation("malformed frame".into())).await;
                            continue;
                        };
                        let opcode = payload.get("op").and_then(|v| v.as_u64()).unwrap_or(255) as u8;
                        // Heartbeats are never rate limited
                        if opcode != OP_HEARTBEAT {
                            if let Err(retry_after_ms) = rate_limits.check(session.user_id, opcode) {
                                match opcode {
                                    OP_PRESENCE_HEARTBEAT
                                    | OP_TYPING_START
                                    | OP_TYPING_STOP
                                    | OP_CALL_OFFER
                                    | OP_CALL_ANSWER
                                    | OP_CALL_ICE => {
                                        // Silent drop for high-frequency events
                                        tracing::debug!(
                                            user_id = session.user_id,
                                            opcode,
                                            "rate limited (silent drop)"
                                        );
                                        continue;
                                    }
                                    _ => {
                                        let _ = send_json(&mut sender, json!({
                                            "op": OP_DISPATCH,
                                            "t": EVENT_RATE_LIMIT,
                                            "d": { "retry_after": retry_after_ms }
                                        })).await;
                                        continue;
                                    }
                                }
                            }
                        }
                        state.registry.touch(session.connection_id);
                        handle_client_message(&payload, opcode, &mut sender, session, state).await;
                        if opcode == OP_HEARTBEAT {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame".to_string(),
                        };
                    }
                    Some(Err(err)) => break format!("websocket receive error: {err}"),
                    None => break "websocket stream ended".to_string(),
                    _ => {}
                }
            }
            event = outbound_rx.recv() => {
                match event {
                    Some(event) => {
                        let frame = json!({
                            "op": OP_DISPATCH,
                            "t": event.event_type,
                            "s": session.next_sequence(),
                            "d": event.payload,
                        });
                        if send_json(&mut sender, frame).await.is_err() {
                            break "websocket send error".to_string();
                        }
                    }
                    // The registry dropped our queue: the connection was
                    // evicted from elsewhere.
                    None => break "outbound queue closed".to_string(),
                }
            }
            () = &mut heartbeat_sleep => {
                let _ = send_close(
                    &mut sender,
                    4000,
                    "Heartbeat timeout",
                ).await;
                break format!("heartbeat timeout after {:?}", heartbeat_timeout);
            }
            _ = ws_ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break "websocket ping send error".to_string();
                }
            }
        }
    };
    tracing::info!(
        user_id = session.user_id,
        connection_id = %session.connection_id,
        "client disconnected: {disconnect_reason}"
    );
}

fn parse_room(d: &Value, field: &str) -> Result<RoomId, GatewayError> {
    d.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Validation(format!("missing {field}")))
        .and_then(|raw| {
            RoomId::from_str(raw).map_err(|e| GatewayError::Validation(e.to_string()))
        })
}

fn required_str<'a>(d: &'a Value, field: &str) -> Result<&'a str, GatewayError> {
    d.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| GatewayError::Validation(format!("missing {field}")))
}

async fn handle_client_message(
    payload: &Value,
    opcode: u8,
    sender: &mut (impl SinkExt<Message> + Unpin),
    session: &mut Session,
    state: &GatewayState,
) {
    static EMPTY: Value = Value::Null;
    let d = payload.get("d").unwrap_or(&EMPTY);

    match opcode {
        OP_HEARTBEAT => {
            let _ = send_json(sender, json!({ "op": OP_HEARTBEAT_ACK })).await;
        }
        OP_PRESENCE_HEARTBEAT => {
            let status = PresenceStatus::normalize(d.get("status").and_then(|v| v.as_str()));
            let room_hint = d
                .get("room_hint")
                .and_then(|v| v.as_str())
                .and_then(|raw| RoomId::from_str(raw).ok());
            state
                .presence_heartbeat(session.user_id, status, room_hint)
                .await;
        }
        OP_CHANNEL_JOIN => match parse_room(d, "room_id") {
            Ok(room) => match state.rooms.join(session.connection_id, room.clone()).await {
                Ok(()) => send_ack(sender, json!({ "room_id": room })).await,
                Err(err) => send_error(sender, &err).await,
            },
            Err(err) => send_error(sender, &err).await,
        },
        OP_CHANNEL_LEAVE => match parse_room(d, "room_id") {
            Ok(room) => match state.rooms.leave(session.connection_id, room.clone()).await {
                Ok(()) => send_ack(sender, json!({ "room_id": room })).await,
                Err(err) => send_error(sender, &err).await,
            },
            Err(err) => send_error(sender, &err).await,
        },
        OP_MESSAGE_SEND => {
            let result = async {
                let room = parse_room(d, "room_id")?;
                let content = required_str(d, "content")?.to_string();
                let key = required_str(d, "idempotency_key")?.to_string();
                state
                    .fanout
                    .send(session.connection_id, room, content, key)
                    .await
            }
            .await;
            match result {
                Ok(message) => {
                    send_ack(
                        sender,
                        json!({
                            "message_id": message.id,
                            "sequence": message.sequence,
                            "created_at": message.created_at,
                        }),
                    )
                    .await
                }
                Err(err) => send_error(sender, &err).await,
            }
        }
        OP_MESSAGE_EDIT => {
            let result = async {
                let message_id = required_str(d, "message_id")?;
                let content = required_str(d, "content")?.to_string();
                state
                    .fanout
                    .edit(session.connection_id, message_id, content)
                    .await
            }
            .await;
            match result {
                Ok(message) => {
                    send_ack(
                        sender,
                        json!({ "message_id": message.id, "sequence": message.sequence }),
                    )
                    .await
                }
                Err(err) => send_error(sender, &err).await,
            }
        }
        OP_MESSAGE_DELETE => {
            let result = async {
                let message_id = required_str(d, "message_id")?;
                state.fanout.delete(session.connection_id, message_id).await
            }
            .await;
            match result {
                Ok(message) => {
                    send_ack(
                        sender,
                        json!({ "message_id": message.id, "sequence": message.sequence }),
                    )
                    .await
                }
                Err(err) => send_error(sender, &err).await,
            }
        }
        OP_TYPING_START => {
            if let Ok(room) = parse_room(d, "room_id") {
                // Fire-and-forget: typing floods never earn error frames.
                if let Err(err) = state.typing_start(session.connection_id, room).await {
                    tracing::debug!(user_id = session.user_id, error = %err, "typing start dropped");
                }
            }
        }
        OP_TYPING_STOP => {
            if let Ok(room) = parse_room(d, "room_id") {
                if let Err(err) = state.typing_stop(session.connection_id, room).await {
                    tracing::debug!(user_id = session.user_id, error = %err, "typing stop dropped");
                }
            }
        }
        OP_CALL_JOIN => match parse_room(d, "call_room_id") {
            Ok(room) => match state.call_join(session.connection_id, room.clone()).await {
                Ok(()) => send_ack(sender, json!({ "call_room_id": room })).await,
                Err(err) => send_error(sender, &err).await,
            },
            Err(err) => send_error(sender, &err).await,
        },
        OP_CALL_OFFER | OP_CALL_ANSWER | OP_CALL_ICE => {
            let kind = match opcode {
                OP_CALL_OFFER => SignalKind::Offer,
                OP_CALL_ANSWER => SignalKind::Answer,
                _ => SignalKind::Ice,
            };
            let result = (|| {
                let room = parse_room(d, "call_room_id")?;
                let to_user = d
                    .get("to_user_id")
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| GatewayError::Validation("missing to_user_id".into()))?;
                let signal = d.get("payload").cloned().unwrap_or(Value::Null);
                state.call_signal(session.connection_id, to_user, &room, kind, signal)
            })();
            if let Err(err) = result {
                send_error(sender, &err).await;
            }
        }
        OP_CALL_LEAVE => match parse_room(d, "call_room_id") {
            Ok(room) => match state.call_leave(session.connection_id, room.clone()).await {
                Ok(()) => send_ack(sender, json!({ "call_room_id": room })).await,
                Err(err) => send_error(sender, &err).await,
            },
            Err(err) => send_error(sender, &err).await,
        },
        OP_IDENTIFY => {
            // Already identified; a second IDENTIFY is a protocol error.
            send_error(
                sender,
                &GatewayError::Validation("already identified".into()),
            )
            .await;
        }
        _ => {
            send_error(
                sender,
                &GatewayError::Validation(format!("unknown opcode {opcode}")),
            )
            .await;
        }
    }
}
