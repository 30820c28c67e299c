use crate::transform::{Message, MessageTransformer};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use tracing::{Span, error, info, info_span};

pub const DEFAULT_PROCESSOR_NAME: &str = "quarkus-kafka-oauth-app";

pub const PROCESSED_KEY: &str = "processed";
pub const PROCESSED_TIMESTAMP_KEY: &str = "processedTimestamp";
pub const PROCESSOR_KEY: &str = "processor";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("failed to serialize processed event: {0}")]
    SerializationFailure(#[source] serde_json::Error),
}

/// Stamps processing metadata onto JSON object events.
///
/// Any payload that cannot be enriched is handed back untouched, so callers
/// always have something to forward.
#[derive(Debug)]
pub struct EventProcessor {
    name: String,
    span: Span,
    // Highest timestamp issued so far; keeps stamps non-decreasing when the wall clock steps back.
    high_water_ms: AtomicI64,
}

impl Default for EventProcessor {
    fn default() -> Self {
        Self::new(DEFAULT_PROCESSOR_NAME)
    }
}

impl EventProcessor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let span = info_span!("event_processor", processor = %name);
        Self {
            name,
            span,
            high_water_ms: AtomicI64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enrich `raw`, or return it unchanged if it is not a JSON object.
    pub fn process(&self, raw: &str) -> String {
        self.enrich(raw).unwrap_or_else(|| raw.to_owned())
    }

    /// Byte-level variant of [`EventProcessor::process`]. Non UTF-8 payloads
    /// are treated as malformed and returned as-is.
    pub fn process_bytes<'a>(&self, raw: &'a [u8]) -> Cow<'a, [u8]> {
        self.enrich_bytes(raw).map_or(Cow::Borrowed(raw), Cow::Owned)
    }

    /// Parse, stamp and re-serialize without the fallback or logging.
    ///
    /// # Errors
    /// Returns [`ProcessError::MalformedInput`] when `raw` is not a JSON object
    /// and [`ProcessError::SerializationFailure`] if the result cannot be encoded.
    pub fn try_process(&self, raw: &str) -> Result<String, ProcessError> {
        let mut event: Map<String, Value> =
            serde_json::from_str(raw).map_err(|e| ProcessError::MalformedInput(e.to_string()))?;

        event.insert(PROCESSED_KEY.to_string(), Value::Bool(true));
        event.insert(
            PROCESSED_TIMESTAMP_KEY.to_string(),
            Value::from(self.timestamp_ms()),
        );
        event.insert(PROCESSOR_KEY.to_string(), Value::String(self.name.clone()));

        serde_json::to_string(&event).map_err(ProcessError::SerializationFailure)
    }

    fn enrich(&self, raw: &str) -> Option<String> {
        let _entered = self.span.enter();
        info!(event = "event_received", payload = %raw, "Received event from source topic");

        match self.try_process(raw) {
            Ok(processed) => {
                info!(
                    event = "event_processed",
                    payload = %processed,
                    "Processed event, sending to target topic"
                );
                Some(processed)
            }
            Err(e) => {
                error!(
                    event = "event_processing_failed",
                    error = %e,
                    payload = %raw,
                    "Error processing event, forwarding original"
                );
                None
            }
        }
    }

    fn enrich_bytes(&self, raw: &[u8]) -> Option<Vec<u8>> {
        match std::str::from_utf8(raw) {
            Ok(text) => self.enrich(text).map(String::into_bytes),
            Err(e) => {
                let _entered = self.span.enter();
                let err = ProcessError::MalformedInput(e.to_string());
                error!(
                    event = "event_processing_failed",
                    error = %err,
                    payload = %String::from_utf8_lossy(raw),
                    "Error processing event, forwarding original"
                );
                None
            }
        }
    }

    fn timestamp_ms(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self.high_water_ms.fetch_max(now, Ordering::AcqRel);
        previous.max(now)
    }
}

#[async_trait]
impl MessageTransformer for EventProcessor {
    async fn transform<'a>(&self, input: Message<'a>) -> Result<Message<'a>> {
        let enriched = self.enrich_bytes(&input.payload);
        Ok(Message {
            key: input.key,
            payload: enriched.map_or(input.payload, Cow::Owned),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Map<String, Value> {
        serde_json::from_str(text).expect("output should be a JSON object")
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    #[test]
    fn stamps_id_event() {
        let processor = EventProcessor::default();
        let before = now_ms();
        let out = parse(&processor.process(r#"{"id":"x1"}"#));
        let after = now_ms();

        assert_eq!(out["id"], "x1");
        assert_eq!(out[PROCESSED_KEY], true);
        assert_eq!(out[PROCESSOR_KEY], "quarkus-kafka-oauth-app");
        let ts = out[PROCESSED_TIMESTAMP_KEY].as_i64().expect("integer timestamp");
        assert!(ts >= before - 5_000 && ts <= after + 5_000);
    }

    #[test]
    fn empty_object_gets_only_injected_keys() {
        let processor = EventProcessor::new("relay-under-test");
        let out = processor.process("{}");
        let parsed = parse(&out);

        assert_eq!(
            parsed.keys().collect::<Vec<_>>(),
            vec![PROCESSED_KEY, PROCESSED_TIMESTAMP_KEY, PROCESSOR_KEY]
        );
        assert!(out.starts_with(r#"{"processed":true,"processedTimestamp":"#));
        assert!(out.ends_with(r#","processor":"relay-under-test"}"#));
    }

    #[test]
    fn injected_values_win_on_collision() {
        let processor = EventProcessor::default();
        let out = parse(&processor.process(
            r#"{"processed": false, "other": 1, "processor": 7, "processedTimestamp": "soon"}"#,
        ));

        assert_eq!(out[PROCESSED_KEY], true);
        assert_eq!(out["other"], 1);
        assert!(out[PROCESSOR_KEY].is_string());
        assert!(out[PROCESSED_TIMESTAMP_KEY].is_i64());
    }

    #[test]
    fn original_fields_are_preserved_in_order() {
        let processor = EventProcessor::default();
        let input = r#"{"z":{"nested":[1,2,{"k":null}]},"a":"text","m":1.5,"b":false}"#;
        let out = parse(&processor.process(input));

        let keys: Vec<_> = out.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            ["z", "a", "m", "b", PROCESSED_KEY, PROCESSED_TIMESTAMP_KEY, PROCESSOR_KEY]
        );
        let original = parse(input);
        for (key, value) in &original {
            assert_eq!(&out[key], value, "field {key} changed");
        }
    }

    #[test]
    fn numbers_keep_their_exact_text() {
        let processor = EventProcessor::default();
        let fields = r#"{"id":123456789012345678901234567890,"price":12345678901234567.89}"#;
        let out = processor.process(fields);

        let prefix = &fields[..fields.len() - 1];
        assert!(
            out.starts_with(&format!("{prefix},\"processed\":true,")),
            "numbers changed: {out}"
        );
    }

    #[test]
    fn non_json_is_forwarded_verbatim() {
        let processor = EventProcessor::default();
        assert_eq!(processor.process("not-json-at-all"), "not-json-at-all");
    }

    #[test]
    fn non_object_json_is_forwarded_verbatim() {
        let processor = EventProcessor::default();
        for input in ["[1,2,3]", "42", r#""just a string""#, "null", "true", " [ ] "] {
            assert_eq!(processor.process(input), input);
            assert!(matches!(
                processor.try_process(input),
                Err(ProcessError::MalformedInput(_))
            ));
        }
    }

    #[test]
    fn degenerate_inputs_never_fail() {
        let processor = EventProcessor::default();
        assert_eq!(processor.process(""), "");
        assert_eq!(processor.process("{\"open\":"), "{\"open\":");
        assert_eq!(processor.process("{} trailing"), "{} trailing");

        let depth = 1_000;
        let deep = format!("{}1{}", r#"{"a":"#.repeat(depth), "}".repeat(depth));
        assert_eq!(processor.process(&deep), deep);
    }

    #[test]
    fn invalid_utf8_bytes_are_forwarded() {
        let processor = EventProcessor::default();
        let raw: &[u8] = &[0xff, 0xfe, b'{', b'}'];
        let out = processor.process_bytes(raw);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(out.as_ref(), raw);
    }

    #[test]
    fn timestamps_do_not_go_backwards() {
        let processor = EventProcessor::default();
        let mut last = 0;
        for _ in 0..100 {
            let out = parse(&processor.process("{}"));
            let ts = out[PROCESSED_TIMESTAMP_KEY].as_i64().expect("integer timestamp");
            assert!(ts >= last);
            last = ts;
        }
    }

    #[test]
    fn high_water_mark_clamps_timestamps() {
        let processor = EventProcessor::default();
        let future = now_ms() + 60_000;
        processor.high_water_ms.store(future, Ordering::Release);

        let out = parse(&processor.process("{}"));
        assert_eq!(out[PROCESSED_TIMESTAMP_KEY], future);
    }

    #[tokio::test]
    async fn transformer_keeps_key_and_enriches_payload() {
        let processor = EventProcessor::new("seam");
        let key: &[u8] = b"partition-key";
        let input = Message {
            key: Some(Cow::Borrowed(key)),
            payload: Cow::Borrowed(br#"{"id":"x1"}"#),
        };

        let output = processor.transform(input).await.expect("never fails");
        assert_eq!(output.key.as_deref(), Some(key));
        let out: Map<String, Value> = serde_json::from_slice(&output.payload).unwrap();
        assert_eq!(out["id"], "x1");
        assert_eq!(out[PROCESSOR_KEY], "seam");
    }

    #[tokio::test]
    async fn transformer_passes_through_malformed_payload() {
        let processor = EventProcessor::default();
        let input = Message {
            key: None,
            payload: Cow::Borrowed(b"[1,2,3]"),
        };

        let output = processor.transform(input).await.expect("never fails");
        assert!(matches!(output.payload, Cow::Borrowed(_)));
        assert_eq!(output.payload.as_ref(), b"[1,2,3]");
    }
}
