//! Subscription directory grain
//!
//! A singleton grain tracking which silos hold subscribers for each
//! stream. Publishers consult it to fan events out across the cluster.
//! Registrations are in-memory only: a silo restart drops its
//! subscriptions along with the subscriber tasks they fed.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::codec;
use crate::error::{Error, Result};
use crate::runtime::grain::{Grain, GrainCall, GrainContext};
use crate::streams::StreamId;

/// Well-known type name of the subscription directory grain
pub const SUBSCRIPTION_DIRECTORY_GRAIN: &str = "stream-subscriptions";

/// Register or drop a silo's interest in a stream
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionChange {
    #[prost(string, tag = "1")]
    pub namespace: String,
    #[prost(string, tag = "2")]
    pub stream: String,
    #[prost(string, tag = "3")]
    pub endpoint: String,
}

/// The silos currently subscribed to a stream
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriberList {
    #[prost(string, repeated, tag = "1")]
    pub endpoints: Vec<String>,
}

/// Empty acknowledgement
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {}

/// The subscription directory's in-memory index
#[derive(Default)]
pub struct SubscriptionDirectoryGrain {
    subscriptions: HashMap<StreamId, HashSet<String>>,
}

impl SubscriptionDirectoryGrain {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every registration held by a silo, called when it leaves
    fn drop_endpoint(&mut self, endpoint: &str) {
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(endpoint);
        }
        self.subscriptions.retain(|_, s| !s.is_empty());
    }
}

#[async_trait]
impl Grain for SubscriptionDirectoryGrain {
    async fn handle(&mut self, _ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "subscribe" => {
                let change: SubscriptionChange = call.request()?;
                let stream = StreamId::new(change.namespace, change.stream);
                self.subscriptions
                    .entry(stream)
                    .or_default()
                    .insert(change.endpoint);
                Ok(codec::encode(&Ack {}))
            }
            "unsubscribe" => {
                let change: SubscriptionChange = call.request()?;
                let stream = StreamId::new(change.namespace, change.stream);
                if let Some(subscribers) = self.subscriptions.get_mut(&stream) {
                    subscribers.remove(&change.endpoint);
                    if subscribers.is_empty() {
                        self.subscriptions.remove(&stream);
                    }
                }
                Ok(codec::encode(&Ack {}))
            }
            "subscribers" => {
                let query: SubscriptionChange = call.request()?;
                let stream = StreamId::new(query.namespace, query.stream);
                let mut endpoints: Vec<String> = self
                    .subscriptions
                    .get(&stream)
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                endpoints.sort();
                Ok(codec::encode(&SubscriberList { endpoints }))
            }
            "silo-left" => {
                let change: SubscriptionChange = call.request()?;
                self.drop_endpoint(&change.endpoint);
                Ok(codec::encode(&Ack {}))
            }
            other => Err(Error::BadRequest(format!(
                "unknown subscription-directory method {other:?}"
            ))),
        }
    }
}
