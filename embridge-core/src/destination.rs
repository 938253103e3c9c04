//! Queue/topic addressing.

use std::fmt;

const QUEUE_PREFIX: &str = "queue:";
const TOPIC_PREFIX: &str = "topic:";

/// Addressable broker target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Queue(String),
    Topic(String),
}

impl Destination {
    /// Resolve a configured destination name by its prefix.
    ///
    /// `"topic:NAME"` resolves to a topic, `"queue:NAME"` and bare names resolve
    /// to a queue. Only the leading prefix is interpreted; any other colon is part
    /// of the name.
    pub fn resolve(name: &str) -> Self {
        if let Some(topic) = name.strip_prefix(TOPIC_PREFIX) {
            Self::Topic(topic.to_string())
        } else if let Some(queue) = name.strip_prefix(QUEUE_PREFIX) {
            Self::Queue(queue.to_string())
        } else {
            Self::Queue(name.to_string())
        }
    }

    /// Name without the variant prefix
    pub fn name(&self) -> &str {
        match self {
            Self::Queue(name) | Self::Topic(name) => name,
        }
    }

    pub fn is_topic(&self) -> bool {
        matches!(self, Self::Topic(_))
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue(name) => write!(f, "{}{}", QUEUE_PREFIX, name),
            Self::Topic(name) => write!(f, "{}{}", TOPIC_PREFIX, name),
        }
    }
}
