//! Outbound bus contract: topics, envelopes and the publisher seam.
//!
//! The transport itself (broker client) lives outside this crate. Delivery is
//! at-least-once; consumers must tolerate duplicates (incident ids are stable).
//! Producers must deliver events of one session key in order to one consumer.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

use crate::error::BusError;

pub const TOPIC_RAW: &str = "events.raw";
pub const TOPIC_SESSIONIZED: &str = "events.sessionized";
pub const TOPIC_INCIDENTS: &str = "events.incidents";

/// One record on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
  pub topic: String,
  pub payload: serde_json::Value,
}

impl Envelope {
  pub fn new<T: Serialize>(topic: &str, payload: &T) -> Result<Self, BusError> {
    Ok(Self {
      topic: topic.to_string(),
      payload: serde_json::to_value(payload)?,
    })
  }
}

pub type PublishFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send + 'a>>;

/// Outbound side of the bus.
pub trait Publisher: Send + Sync {
  fn publish(&self, envelope: Envelope) -> PublishFuture<'_>;
}

/// In-process publisher backed by a bounded tokio channel.
#[derive(Clone)]
pub struct ChannelPublisher {
  tx: mpsc::Sender<Envelope>,
}

impl ChannelPublisher {
  pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Self { tx }, rx)
  }
}

impl Publisher for ChannelPublisher {
  fn publish(&self, envelope: Envelope) -> PublishFuture<'_> {
    Box::pin(async move {
      let topic = envelope.topic.clone();
      self
        .tx
        .send(envelope)
        .await
        .map_err(|_| BusError::Closed { topic })
    })
  }
}
