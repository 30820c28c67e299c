use anyhow::Result;
use async_trait::async_trait;
use std::borrow::Cow;

/// A record as seen by a transformer: key and payload, borrowed from the
/// consumed Kafka message until something needs to own them.
#[derive(Debug, Clone)]
pub struct Message<'a> {
    pub key: Option<Cow<'a, [u8]>>,
    pub payload: Cow<'a, [u8]>,
}

impl<'a> Message<'a> {
    pub fn borrowed(key: Option<&'a [u8]>, payload: &'a [u8]) -> Self {
        Self {
            key: key.map(Cow::Borrowed),
            payload: Cow::Borrowed(payload),
        }
    }
}

#[async_trait]
pub trait MessageTransformer: Send + Sync {
    /// Transform a consumed `Message` into the one published to the target topic.
    /// A payload handed back still borrowed is counted as passed through.
    ///
    /// # Errors
    /// Implementations may return an error when a payload cannot be transformed.
    /// The relay then forwards the original message unchanged.
    async fn transform<'a>(&self, input: Message<'a>) -> Result<Message<'a>>;
}
