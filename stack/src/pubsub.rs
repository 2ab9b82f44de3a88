//! Topic-based publish/subscribe over the mesh.
//!
//! A published message floods to every reachable port as
//! `[src_node_be64][topic_len_be16][topic][payload]`; receivers deliver it
//! to their local subscribers for that topic. No subscription state crosses
//! the wire.

use crate::l2::{L2Addr, L2Protocol, ETHERTYPE_PUBSUB, L2};
use crate::StackError;
use async_trait::async_trait;
use bm_net::SendPort;
use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Source node + topic length.
const PUBSUB_HEADER: usize = 8 + 2;

/// Invoked with `(source node, topic, payload)` for each delivery.
pub type SubscriberCallback = Arc<dyn Fn(u64, &str, &[u8]) + Send + Sync>;

/// Publish/subscribe endpoint.
pub struct PubSub {
    l2: Arc<L2>,
    subscriptions: Mutex<HashMap<String, Vec<SubscriberCallback>>>,
}

impl PubSub {
    /// Register on the pub/sub ethertype.
    pub fn init(l2: Arc<L2>) -> Result<Arc<Self>, StackError> {
        let pubsub = Arc::new(Self {
            l2: l2.clone(),
            subscriptions: Mutex::new(HashMap::new()),
        });
        l2.register(ETHERTYPE_PUBSUB, pubsub.clone());
        Ok(pubsub)
    }

    /// Deliver `callback` for every future message on `topic`.
    pub fn subscribe(&self, topic: &str, callback: SubscriberCallback) {
        self.subscriptions
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(callback);
    }

    /// Flood one message on `topic` to every reachable port.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), StackError> {
        if topic.is_empty() || topic.len() > usize::from(u16::MAX) {
            return Err(StackError::InvalidTopic);
        }

        let mut message = BytesMut::with_capacity(PUBSUB_HEADER + topic.len() + payload.len());
        message.put_u64(self.l2.node_id());
        message.put_u16(topic.len() as u16);
        message.put_slice(topic.as_bytes());
        message.put_slice(payload);

        self.l2
            .send(L2Addr::BROADCAST, ETHERTYPE_PUBSUB, &message, SendPort::Flood)
            .await
    }
}

#[async_trait]
impl L2Protocol for PubSub {
    async fn receive(&self, _port: u8, _src: L2Addr, payload: &[u8]) {
        if payload.len() < PUBSUB_HEADER {
            debug!("pubsub: dropping short message ({} bytes)", payload.len());
            return;
        }
        let mut cursor = payload;
        let src_node = cursor.get_u64();
        let topic_len = usize::from(cursor.get_u16());
        if cursor.len() < topic_len {
            debug!("pubsub: topic length {topic_len} past end of message");
            return;
        }
        let Ok(topic) = std::str::from_utf8(&cursor[..topic_len]) else {
            debug!("pubsub: dropping message with non-UTF-8 topic");
            return;
        };
        let data = &cursor[topic_len..];

        let callbacks: Vec<SubscriberCallback> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.get(topic).cloned().unwrap_or_default()
        };
        if callbacks.is_empty() {
            return;
        }

        info!("PUBSUB_RX from={src_node:016x} topic={topic}");
        for callback in callbacks {
            callback(src_node, topic, data);
        }
    }
}
