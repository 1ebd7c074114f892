//! Bus client: durable pub/sub, request-reply and KV buckets over NATS.
//!
//! Reconnection after the initial connect is delegated to the broker client,
//! which retries indefinitely. Initial connect failures surface as
//! [`AgentError::BusUnavailable`] so the coordinator's backoff loop owns the
//! retry cadence.

use crate::config::RuntimeConfig;
use crate::error::AgentError;
use crate::messaging::envelope::Envelope;
use async_nats::jetstream;
use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default deadline for a bus round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure of one request-reply round-trip. Callers map this into their own
/// taxonomy (auth → transient failure, tool relay → timed-out/failed).
#[derive(Debug)]
pub enum BusRequestError {
    TimedOut(Duration),
    Failed(String),
}

impl std::fmt::Display for BusRequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusRequestError::TimedOut(d) => write!(f, "bus request timed out after {:?}", d),
            BusRequestError::Failed(msg) => write!(f, "bus request failed: {}", msg),
        }
    }
}

/// Long-lived connection to the broker.
#[derive(Clone)]
pub struct BusClient {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

impl BusClient {
    pub async fn connect(config: &RuntimeConfig) -> Result<Self, AgentError> {
        let mut options = async_nats::ConnectOptions::new().event_callback(|event| async move {
            info!(%event, "bus connection event");
        });
        if let Some(name) = &config.nats_name {
            options = options.name(name);
        }

        let client = options
            .connect(config.nats_servers.as_str())
            .await
            .map_err(|e| {
                AgentError::BusUnavailable(format!(
                    "connect to {} failed: {e}",
                    config.nats_servers
                ))
            })?;

        let jetstream = jetstream::new(client.clone());

        info!(servers = %config.nats_servers, "bus connected");
        Ok(Self { client, jetstream })
    }

    pub async fn publish(&self, subject: String, envelope: &Envelope) -> Result<(), AgentError> {
        let bytes = envelope
            .encode()
            .map_err(|e| AgentError::BusUnavailable(format!("encode failed: {e}")))?;
        self.client
            .publish(subject, Bytes::from(bytes))
            .await
            .map_err(|e| AgentError::BusUnavailable(format!("publish failed: {e}")))
    }

    /// Request-reply with a deadline. `None` applies the default 30 s.
    pub async fn request(
        &self,
        subject: String,
        envelope: &Envelope,
        timeout: Option<Duration>,
    ) -> Result<Envelope, BusRequestError> {
        let deadline = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let bytes = envelope
            .encode()
            .map_err(|e| BusRequestError::Failed(format!("encode failed: {e}")))?;

        let message = tokio::time::timeout(
            deadline,
            self.client.request(subject, Bytes::from(bytes)),
        )
        .await
        .map_err(|_| BusRequestError::TimedOut(deadline))?
        .map_err(|e| BusRequestError::Failed(e.to_string()))?;

        match Envelope::decode(&message.payload) {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(BusRequestError::Failed(
                "reply carried an unknown envelope type".to_string(),
            )),
            Err(e) => Err(BusRequestError::Failed(format!("reply decode failed: {e}"))),
        }
    }

    pub async fn subscribe(&self, subject: String) -> Result<EnvelopeStream, AgentError> {
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .map_err(|e| AgentError::BusUnavailable(format!("subscribe {subject} failed: {e}")))?;
        debug!(subject, "subscribed");
        Ok(EnvelopeStream {
            subject,
            inner: subscriber,
        })
    }

    /// Reply to a request received on an [`EnvelopeStream`].
    pub async fn respond(
        &self,
        reply: async_nats::Subject,
        envelope: &Envelope,
    ) -> Result<(), AgentError> {
        let bytes = envelope
            .encode()
            .map_err(|e| AgentError::BusUnavailable(format!("encode failed: {e}")))?;
        self.client
            .publish(reply, Bytes::from(bytes))
            .await
            .map_err(|e| AgentError::BusUnavailable(format!("respond failed: {e}")))
    }

    /// Open (or create) a named KV bucket with a broker-enforced TTL.
    pub async fn kv_bucket(&self, name: &str, ttl: Duration) -> Result<kv::Store, AgentError> {
        self.jetstream
            .create_key_value(kv::Config {
                bucket: name.to_string(),
                history: 1,
                max_age: ttl,
                ..Default::default()
            })
            .await
            .map_err(|e| AgentError::BusUnavailable(format!("kv bucket {name} failed: {e}")))
    }

    /// Flush buffered publishes. Called on shutdown so the heartbeat delete
    /// reaches the broker before the connection closes.
    pub async fn flush(&self) {
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "bus flush failed");
        }
    }
}

/// An envelope received from a subscription, with the reply subject when the
/// sender used request-reply.
pub struct InboundEnvelope {
    pub envelope: Envelope,
    pub reply: Option<async_nats::Subject>,
}

/// Typed subscription. Unknown envelope types and malformed payloads are
/// skipped, so `next` only ever yields well-formed envelopes.
pub struct EnvelopeStream {
    subject: String,
    inner: async_nats::Subscriber,
}

impl EnvelopeStream {
    pub async fn next(&mut self) -> Option<InboundEnvelope> {
        loop {
            let message = self.inner.next().await?;
            match Envelope::decode(&message.payload) {
                Ok(Some(envelope)) => {
                    return Some(InboundEnvelope {
                        envelope,
                        reply: message.reply,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(subject = %self.subject, error = %e, "skipping malformed bus payload");
                    continue;
                }
            }
        }
    }

    /// Drain the subscription. Part of the session/service stop path.
    pub async fn unsubscribe(mut self) {
        if let Err(e) = self.inner.unsubscribe().await {
            warn!(subject = %self.subject, error = %e, "unsubscribe failed");
        }
    }
}
