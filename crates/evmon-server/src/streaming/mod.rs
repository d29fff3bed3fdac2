//! Platform event streaming
//!
//! One long-lived job per configured topic. Each job subscribes to
//! `/event/<topic>` from the newest event on, stores every delivered payload
//! in the collection named after the topic and heartbeats per message.
//! A subscription whose credentials are revoked asks the process to exit.

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::StreamingConfig;
use crate::db::{Document, DocumentStore};
use crate::scheduler::{Job, JobContext};
use crate::sfdc::{SfdcClient, SfdcError};

pub mod bayeux;

pub const JOB_NAME_PREFIX: &str = "Streaming";

/// Replay id meaning "only events published after subscribing"
pub const REPLAY_FROM_NOW: i64 = -1;

/// Payload member used as the stored document identity
pub const IDENTITY_FIELD: &str = "EventIdentifier";

pub fn job_name(topic: &str) -> String {
    format!("{} - {}", JOB_NAME_PREFIX, topic)
}

pub fn channel(topic: &str) -> String {
    format!("/event/{}", topic)
}

/// Matches the names of all streaming jobs
pub fn shutdown_pattern() -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}", regex::escape(JOB_NAME_PREFIX)))
}

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Push channel authentication failed: {0}")]
    Authentication(String),

    #[error("Client unknown to the server")]
    UnknownClient,

    #[error("{channel} was rejected: {error}")]
    Rejected { channel: String, error: String },

    #[error("Push channel returned {0}")]
    Status(u16),

    #[error("Push channel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed push channel response: {0}")]
    Malformed(String),

    #[error("Could not open a session: {0}")]
    Session(#[from] SfdcError),

    #[error("Subscription closed")]
    Closed,
}

/// One message delivered on a subscribed channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub payload: Option<Map<String, Value>>,
    pub replay_id: Option<i64>,
}

impl StreamEvent {
    /// Build from the `data` member of a channel message
    pub fn from_data(data: Value) -> Self {
        Self {
            payload: data.get("payload").and_then(Value::as_object).cloned(),
            replay_id: data.pointer("/event/replayId").and_then(Value::as_i64),
        }
    }
}

/// Receiving end of a live subscription
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Result<StreamEvent, StreamError>>,
}

impl Subscription {
    pub fn channel(buffer: usize) -> (mpsc::Sender<Result<StreamEvent, StreamError>>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (tx, Self { rx })
    }

    /// Next event or error; `None` once the subscription has ended
    pub async fn next(&mut self) -> Option<Result<StreamEvent, StreamError>> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Open a subscription to `channel` starting after `replay_id`; it ends when `cancel` fires
    async fn subscribe(
        &self,
        channel: &str,
        replay_id: i64,
        cancel: CancellationToken,
    ) -> Result<Subscription, StreamError>;
}

/// Push channel backed by the remote system's streaming endpoint
pub struct SfdcPushChannel {
    client: Arc<SfdcClient>,
    config: StreamingConfig,
}

impl SfdcPushChannel {
    pub fn new(client: Arc<SfdcClient>, config: StreamingConfig) -> Self {
        Self { client, config }
    }

    fn backoff(&self) -> bayeux::Backoff {
        bayeux::Backoff {
            initial: Duration::from_millis(self.config.retry_interval_ms),
            max: Duration::from_secs(self.config.max_backoff_secs),
        }
    }
}

#[async_trait]
impl PushChannel for SfdcPushChannel {
    async fn subscribe(
        &self,
        channel: &str,
        replay_id: i64,
        cancel: CancellationToken,
    ) -> Result<Subscription, StreamError> {
        let session = self.client.session().await?;
        let client = bayeux::BayeuxClient::new(
            &session.instance_url,
            &self.client.config().api_version,
            &session.access_token,
        )?;

        bayeux::open_subscription(client, channel, replay_id, self.backoff(), cancel).await
    }
}

/// What happened to one delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// No payload
    Ignored,
    /// Written, or already present when `inserted` is false
    Stored { id: String, inserted: bool },
    Failed,
}

pub struct StreamingJob {
    name: String,
    topic: String,
    channel: Arc<dyn PushChannel>,
    store: Arc<dyn DocumentStore>,
}

impl StreamingJob {
    pub fn new(topic: impl Into<String>, channel: Arc<dyn PushChannel>, store: Arc<dyn DocumentStore>) -> Self {
        let topic = topic.into();
        Self {
            name: job_name(&topic),
            topic,
            channel,
            store,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn handle_message(&self, ctx: &JobContext, event: StreamEvent) -> MessageOutcome {
        let Some(payload) = event.payload else {
            tracing::debug!(topic = %self.topic, replay_id = ?event.replay_id, "Ignoring message without payload");
            return MessageOutcome::Ignored;
        };

        let identity = payload
            .get(IDENTITY_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string);
        let document = Document::with_identity(identity, Value::Object(payload));
        let id = document.id.clone();

        match self.store.insert_one(&self.topic, document).await {
            Ok(inserted) => {
                tracing::debug!(topic = %self.topic, id = %id, inserted, "Stored event");
                ctx.touch();
                MessageOutcome::Stored { id, inserted }
            }
            Err(e) => {
                ctx.fail(&e);
                MessageOutcome::Failed
            }
        }
    }
}

#[async_trait]
impl Job for StreamingJob {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: JobContext) -> anyhow::Result<()> {
        let channel = channel(&self.topic);
        let mut subscription = self
            .channel
            .subscribe(&channel, REPLAY_FROM_NOW, ctx.cancellation().clone())
            .await?;

        tracing::info!(topic = %self.topic, channel = %channel, "Streaming started");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    tracing::info!(topic = %self.topic, "Streaming cancelled");
                    return Ok(());
                }
                item = subscription.next() => match item {
                    Some(Ok(event)) => {
                        self.handle_message(&ctx, event).await;
                    }
                    Some(Err(StreamError::Authentication(reason))) => {
                        ctx.abort_process(format!("{} lost authorization: {}", self.name, reason));
                        return Err(StreamError::Authentication(reason).into());
                    }
                    Some(Err(e)) => ctx.fail(&e),
                    None if ctx.is_cancelled() => return Ok(()),
                    None => return Err(StreamError::Closed.into()),
                }
            }
        }
    }
}
