use crate::config::{SubscriptionConfig, TopicConfig, TopicMode};

/// Userid base: virtual user N gets userid 100000 + N
pub const USERID_BASE: u32 = 100_000;

/// One simulated end user's derived identity.
///
/// `ordinal` is 1-based and unique across the whole run. The topic and the
/// subscription filter value are derived from it according to the configured
/// topic mode; neither changes for the lifetime of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub ordinal: u32,
    pub userid: String,
    pub topic: String,
    pub field_value: String,
}

impl ClientIdentity {
    pub fn derive(ordinal: u32, topic: &TopicConfig, subscription: &SubscriptionConfig) -> Self {
        let userid = (USERID_BASE + ordinal).to_string();

        let (channel_topic, field_value) = match topic.mode {
            TopicMode::PerUser => (format!("user:{}", userid), subscription.field_value.clone()),
            TopicMode::Bucketed => {
                let bucket = ordinal as usize % topic.buckets.len();
                (topic.buckets[bucket].clone(), bucket.to_string())
            }
        };

        Self {
            ordinal,
            userid,
            topic: channel_topic,
            field_value,
        }
    }
}
