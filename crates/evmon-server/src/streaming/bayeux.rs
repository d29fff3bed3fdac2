//! Bayeux 1.0 long-polling client with the replay extension
//!
//! [`open_subscription`] performs the handshake and subscribe calls up front,
//! so credential problems surface to the caller immediately. Afterwards a
//! background task keeps issuing `/meta/connect` and forwards channel
//! messages to the returned [`Subscription`]:
//!
//! - transport errors and `reconnect: retry` advice reconnect after a delay
//!   (exponential backoff on errors, the advised interval otherwise)
//! - `reconnect: handshake` advice and `403::Unknown client` errors perform a
//!   new handshake and re-subscribe from the last replay id seen
//! - HTTP 401/403 and `401::` errors end the subscription with
//!   [`StreamError::Authentication`]

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{StreamError, StreamEvent, Subscription};

pub const META_HANDSHAKE: &str = "/meta/handshake";
pub const META_SUBSCRIBE: &str = "/meta/subscribe";
pub const META_CONNECT: &str = "/meta/connect";
pub const META_DISCONNECT: &str = "/meta/disconnect";

/// Longer than the server's long-poll hold time
const REQUEST_TIMEOUT_SECS: u64 = 130;

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Advice {
    pub reconnect: Option<String>,
    pub interval: Option<u64>,
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BayeuxMessage {
    pub channel: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub successful: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub advice: Option<Advice>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl BayeuxMessage {
    fn failed(&self) -> bool {
        self.successful == Some(false)
    }
}

/// Delays between failed requests
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current * 2).min(self.max)
    }
}

/// Map a Bayeux `error` string onto the error taxonomy
fn classify(channel: &str, error: Option<&str>) -> StreamError {
    let error = error.unwrap_or("request was not successful");
    let code = error.split(':').next().unwrap_or_default();

    match code {
        "401" => StreamError::Authentication(error.to_string()),
        "403" if error.to_ascii_lowercase().contains("unknown client") => StreamError::UnknownClient,
        "403" => StreamError::Authentication(error.to_string()),
        _ => StreamError::Rejected {
            channel: channel.to_string(),
            error: error.to_string(),
        },
    }
}

pub struct BayeuxClient {
    http: Client,
    endpoint: String,
    access_token: String,
}

impl BayeuxClient {
    /// Client for `{instance_url}/cometd/{api_version}`
    pub fn new(instance_url: &str, api_version: &str, access_token: &str) -> Result<Self, StreamError> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/cometd/{}", instance_url.trim_end_matches('/'), api_version),
            access_token: access_token.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, body: Value) -> Result<Vec<BayeuxMessage>, StreamError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StreamError::Authentication(format!("push channel returned {}", status)));
        }
        if !status.is_success() {
            return Err(StreamError::Status(status.as_u16()));
        }

        response
            .json()
            .await
            .map_err(|e| StreamError::Malformed(e.to_string()))
    }

    /// Reply on `channel` from a meta exchange, failing on an unsuccessful one
    async fn exchange(&self, channel: &str, body: Value) -> Result<BayeuxMessage, StreamError> {
        let reply = self
            .send(body)
            .await?
            .into_iter()
            .find(|m| m.channel == channel)
            .ok_or_else(|| StreamError::Malformed(format!("no {} reply", channel)))?;

        if reply.successful != Some(true) {
            return Err(classify(channel, reply.error.as_deref()));
        }
        Ok(reply)
    }

    /// Returns the client id assigned by the server
    pub async fn handshake(&self) -> Result<String, StreamError> {
        let reply = self
            .exchange(
                META_HANDSHAKE,
                json!([{
                    "channel": META_HANDSHAKE,
                    "version": "1.0",
                    "minimumVersion": "1.0",
                    "supportedConnectionTypes": ["long-polling"],
                    "ext": { "replay": true }
                }]),
            )
            .await?;

        reply
            .client_id
            .ok_or_else(|| StreamError::Malformed("handshake reply has no clientId".into()))
    }

    pub async fn subscribe(&self, client_id: &str, channel: &str, replay_id: i64) -> Result<(), StreamError> {
        let mut replay = serde_json::Map::new();
        replay.insert(channel.to_string(), json!(replay_id));

        self.exchange(
            META_SUBSCRIBE,
            json!([{
                "channel": META_SUBSCRIBE,
                "clientId": client_id,
                "subscription": channel,
                "ext": { "replay": replay }
            }]),
        )
        .await
        .map(|_| ())
    }

    /// One long poll; returns every message the server delivered
    pub async fn connect(&self, client_id: &str) -> Result<Vec<BayeuxMessage>, StreamError> {
        self.send(json!([{
            "channel": META_CONNECT,
            "clientId": client_id,
            "connectionType": "long-polling"
        }]))
        .await
    }

    pub async fn disconnect(&self, client_id: &str) {
        let result = self
            .send(json!([{ "channel": META_DISCONNECT, "clientId": client_id }]))
            .await;
        if let Err(e) = result {
            tracing::debug!(error = %e, "Disconnect failed");
        }
    }
}

/// Handshake, subscribe from `replay_id`, then keep the subscription alive until `cancel`
pub async fn open_subscription(
    client: BayeuxClient,
    channel: &str,
    replay_id: i64,
    backoff: Backoff,
    cancel: CancellationToken,
) -> Result<Subscription, StreamError> {
    let client_id = client.handshake().await?;
    client.subscribe(&client_id, channel, replay_id).await?;

    tracing::info!(channel, replay_id, endpoint = %client.endpoint(), "Subscribed to push channel");

    let (tx, subscription) = Subscription::channel(SUBSCRIPTION_BUFFER);
    let pump = Pump {
        client,
        client_id,
        channel: channel.to_string(),
        replay_id,
        backoff,
        tx,
        cancel,
    };
    tokio::spawn(pump.run());

    Ok(subscription)
}

struct Pump {
    client: BayeuxClient,
    client_id: String,
    channel: String,
    replay_id: i64,
    backoff: Backoff,
    tx: mpsc::Sender<Result<StreamEvent, StreamError>>,
    cancel: CancellationToken,
}

/// What to do before the next connect
#[derive(Debug, Clone, Copy)]
enum Next {
    Connect,
    Wait(Duration),
    Handshake,
}

impl Pump {
    async fn run(mut self) {
        let mut delay = self.backoff.initial;
        let mut next = Next::Connect;

        loop {
            match next {
                Next::Connect => {}
                Next::Wait(duration) => {
                    if !self.pause(duration).await {
                        break;
                    }
                }
                Next::Handshake => match self.resubscribe().await {
                    Ok(()) => delay = self.backoff.initial,
                    Err(StreamError::Authentication(reason)) => {
                        self.fatal(reason).await;
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(channel = %self.channel, error = %e, retry_in = ?delay, "Re-subscribe failed");
                        if !self.pause(delay).await {
                            break;
                        }
                        delay = self.backoff.next(delay);
                        next = Next::Handshake;
                        continue;
                    }
                },
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.tx.closed() => return,
                result = self.client.connect(&self.client_id) => result,
            };

            next = match result {
                Ok(messages) => {
                    delay = self.backoff.initial;
                    match self.dispatch(messages).await {
                        Some(next) => next,
                        None => return,
                    }
                }
                Err(StreamError::Authentication(reason)) => {
                    self.fatal(reason).await;
                    return;
                }
                Err(StreamError::UnknownClient) => Next::Handshake,
                Err(e) => {
                    tracing::warn!(channel = %self.channel, error = %e, retry_in = ?delay, "Connect failed");
                    let wait = Next::Wait(delay);
                    delay = self.backoff.next(delay);
                    wait
                }
            };
        }

        self.client.disconnect(&self.client_id).await;
        tracing::info!(channel = %self.channel, "Push subscription closed");
    }

    /// Forward channel messages and read the connect advice; `None` when the receiver is gone
    async fn dispatch(&mut self, messages: Vec<BayeuxMessage>) -> Option<Next> {
        let mut next = Next::Connect;

        for message in messages {
            if message.channel == META_CONNECT {
                if let Some(advice) = &message.advice {
                    match advice.reconnect.as_deref() {
                        Some("handshake") => next = Next::Handshake,
                        _ => {
                            if let Some(ms) = advice.interval.filter(|ms| *ms > 0) {
                                next = Next::Wait(Duration::from_millis(ms));
                            }
                        }
                    }
                }
                if message.failed() {
                    match classify(META_CONNECT, message.error.as_deref()) {
                        StreamError::Authentication(reason) => {
                            self.fatal(reason).await;
                            return None;
                        }
                        StreamError::UnknownClient => next = Next::Handshake,
                        other => {
                            tracing::warn!(channel = %self.channel, error = %other, "Connect was not successful");
                            if matches!(next, Next::Connect) {
                                next = Next::Wait(self.backoff.initial);
                            }
                        }
                    }
                }
            } else if message.channel == self.channel {
                let event = StreamEvent::from_data(message.data.unwrap_or(Value::Null));
                if let Some(replay_id) = event.replay_id {
                    self.replay_id = replay_id;
                }
                if self.tx.send(Ok(event)).await.is_err() {
                    return None;
                }
            }
        }

        Some(next)
    }

    async fn resubscribe(&mut self) -> Result<(), StreamError> {
        tracing::info!(channel = %self.channel, replay_id = self.replay_id, "Re-handshaking push channel");
        let client_id = self.client.handshake().await?;
        self.client.subscribe(&client_id, &self.channel, self.replay_id).await?;
        self.client_id = client_id;
        Ok(())
    }

    /// Sleep unless cancelled first; `false` when cancelled
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn fatal(&self, reason: String) {
        tracing::error!(channel = %self.channel, reason = %reason, "Push channel authentication failed");
        let _ = self.tx.send(Err(StreamError::Authentication(reason))).await;
    }
}
