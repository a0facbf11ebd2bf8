//! Streaming JSON-object framing for the OS2L wire format.
//!
//! OS2L concatenates UTF-8 JSON objects on a TCP stream with no length
//! prefix and no delimiter, so object boundaries have to be inferred by
//! brace matching across arbitrarily fragmented reads. Feed raw chunks via
//! [`FrameDecoder::feed`] and extract complete objects; a partial object is
//! buffered until the rest of it arrives.
//!
//! The scan is deliberately not string-aware: a `{` or `}` inside a quoted
//! JSON string value is counted as a structural brace. This can produce a
//! false object boundary (reported as [`DecodeErrorKind::CorruptJson`]) or
//! a false continuation. The behavior is part of the protocol contract of
//! this implementation — fixing it would change which byte sequences
//! decode.
//!
//! Decode failures never desynchronize the decoder permanently: the buffer
//! is discarded wholesale and the next well-formed object decodes again.
//! The discarded bytes are lost, including any valid object that happened
//! to trail the corrupt span in the same buffer.

use serde_json::Value;

use crate::error::DecodeError;
#[cfg(doc)]
use crate::error::DecodeErrorKind;

/// Result of one [`FrameDecoder::feed`] call.
///
/// Messages are in arrival order. At most one error is produced per call
/// and it always terminates processing of that chunk, so it conceptually
/// follows the messages.
#[derive(Debug, Default)]
pub struct FeedOutcome {
    /// Complete objects decoded from the buffer, in arrival order.
    pub messages: Vec<Value>,
    /// The failure that stopped the scan, if any.
    pub error: Option<DecodeError>,
}

/// Incremental brace-matching decoder for one connection's inbound bytes.
///
/// One decoder belongs to exactly one connection and is discarded with it;
/// a reconnect gets a fresh decoder with an empty buffer. All feeds must
/// come from a single task, in byte-arrival order.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feed bytes into the decoder and extract all complete objects.
    ///
    /// Appends `chunk` to the accumulation buffer and scans for top-level
    /// JSON objects by brace depth. If the buffer does not begin with `{`
    /// the whole buffer is discarded as [`DecodeErrorKind::BadData`]. A
    /// balanced-brace span that fails to parse discards the whole buffer
    /// as [`DecodeErrorKind::CorruptJson`]. A trailing partial object is
    /// retained for the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> FeedOutcome {
        self.buf.extend_from_slice(chunk);
        let mut outcome = FeedOutcome::default();

        if self.buf.is_empty() {
            return outcome;
        }
        if self.buf[0] != b'{' {
            let content = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            outcome.error = Some(DecodeError::bad_data(content));
            return outcome;
        }

        // Brace characters are single bytes in UTF-8, so a byte scan cannot
        // split a multi-byte character.
        let mut depth: i32 = 0;
        let mut i = 0;
        while i < self.buf.len() {
            match self.buf[i] {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        match serde_json::from_slice::<Value>(&self.buf[..=i]) {
                            Ok(value) => {
                                outcome.messages.push(value);
                                self.buf.drain(..=i);
                                // Extraction shrinks the buffer; restart the
                                // scan from its new start.
                                i = 0;
                                continue;
                            }
                            Err(_) => {
                                let content =
                                    String::from_utf8_lossy(&self.buf[..=i]).into_owned();
                                self.buf.clear();
                                outcome.error = Some(DecodeError::corrupt_json(content));
                                return outcome;
                            }
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }

        outcome
    }

    /// Returns true if the decoder is holding a partial object.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DecodeErrorKind;
    use serde_json::json;

    #[test]
    fn test_single_object_decodes_and_empties_buffer() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"evt":"btn","name":"x","state":"on"}"#);
        assert_eq!(
            outcome.messages,
            vec![json!({"evt": "btn", "name": "x", "state": "on"})]
        );
        assert!(outcome.error.is_none());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_fragmentation_invariance() {
        let wire = br#"{"evt":"beat","change":true,"pos":1,"bpm":120}"#;
        let expected = json!({"evt": "beat", "change": true, "pos": 1, "bpm": 120});

        // Any split points must produce the same single message.
        for split in 1..wire.len() {
            let mut decoder = FrameDecoder::new();
            let first = decoder.feed(&wire[..split]);
            assert!(first.messages.is_empty(), "early emit at split {split}");
            assert!(first.error.is_none());
            assert!(decoder.has_partial());

            let second = decoder.feed(&wire[split..]);
            assert_eq!(second.messages, vec![expected.clone()], "split {split}");
            assert!(second.error.is_none());
            assert!(!decoder.has_partial());
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = br#"{"evt":"cmd","id":1,"param":0.5}"#;
        let mut decoder = FrameDecoder::new();
        let mut messages = Vec::new();
        for byte in wire.iter() {
            let outcome = decoder.feed(&[*byte]);
            assert!(outcome.error.is_none());
            messages.extend(outcome.messages);
        }
        assert_eq!(messages, vec![json!({"evt": "cmd", "id": 1, "param": 0.5})]);
    }

    #[test]
    fn test_back_to_back_objects_in_one_feed() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(
            br#"{"evt":"beat","change":true,"pos":1,"bpm":120}{"evt":"beat","change":false,"pos":2,"bpm":120}"#,
        );
        assert_eq!(outcome.messages.len(), 2);
        assert_eq!(outcome.messages[0]["change"], json!(true));
        assert_eq!(outcome.messages[1]["change"], json!(false));
        assert!(outcome.error.is_none());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_whitespace_between_objects_in_one_feed() {
        // The separating space lands inside the second candidate span, and
        // the JSON parser tolerates leading whitespace.
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"a":1} {"b":2}"#);
        assert_eq!(outcome.messages, vec![json!({"a": 1}), json!({"b": 2})]);
        assert!(outcome.error.is_none());
    }

    #[test]
    fn test_leading_junk_rejected_and_trailing_object_lost() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"x{"evt":"cmd","id":1,"param":0}"#);
        assert!(outcome.messages.is_empty());
        let error = outcome.error.expect("Should signal BadData");
        assert_eq!(error.kind, DecodeErrorKind::BadData);
        assert_eq!(error.content, r#"x{"evt":"cmd","id":1,"param":0}"#);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_resync_after_corruption_loses_trailing_object() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"a":}{"evt":"cmd","id":1,"param":0.5}"#);
        // The first balanced span is invalid JSON; the whole buffer is
        // discarded, so the valid trailing object is lost too. This is the
        // contract, not partial recovery.
        assert!(outcome.messages.is_empty());
        let error = outcome.error.expect("Should signal CorruptJson");
        assert_eq!(error.kind, DecodeErrorKind::CorruptJson);
        assert_eq!(error.content, r#"{"a":}"#);
        assert!(!decoder.has_partial());

        // The decoder resynchronizes on the next well-formed object.
        let next = decoder.feed(br#"{"evt":"cmd","id":2,"param":1}"#);
        assert_eq!(next.messages, vec![json!({"evt": "cmd", "id": 2, "param": 1})]);
        assert!(next.error.is_none());
    }

    #[test]
    fn test_empty_feed_on_empty_buffer_is_noop() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(b"");
        assert!(outcome.messages.is_empty());
        assert!(outcome.error.is_none());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_buffer_survives_empty_feed() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(br#"{"evt":"btn""#);
        assert!(decoder.has_partial());
        let outcome = decoder.feed(b"");
        assert!(outcome.messages.is_empty());
        assert!(outcome.error.is_none());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_brace_inside_string_is_miscounted() {
        // Documented limitation: the scan is not string-aware, so the `}`
        // inside the quoted value closes the object early and the candidate
        // span is not valid JSON.
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"name":"}"}"#);
        assert!(outcome.messages.is_empty());
        let error = outcome.error.expect("Should signal CorruptJson");
        assert_eq!(error.kind, DecodeErrorKind::CorruptJson);
        assert_eq!(error.content, r#"{"name":"}"#);
    }

    #[test]
    fn test_unmatched_close_brace_after_extraction_never_completes() {
        // After `{"a":1}` is extracted the buffer holds `}`, driving the
        // depth counter negative. It never returns to zero on a `}` again,
        // so nothing further decodes and the residue is retained.
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"a":1}}{"b":2}"#);
        assert_eq!(outcome.messages, vec![json!({"a": 1})]);
        assert!(outcome.error.is_none());
        assert!(decoder.has_partial());
    }

    #[test]
    fn test_nested_objects_count_as_one_message() {
        let mut decoder = FrameDecoder::new();
        let outcome = decoder.feed(br#"{"evt":"custom","inner":{"deep":{"x":1}}}"#);
        assert_eq!(outcome.messages.len(), 1);
        assert_eq!(outcome.messages[0]["inner"]["deep"]["x"], json!(1));
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multibyte_utf8_split_across_feeds() {
        let wire = r#"{"evt":"btn","name":"Blitz⚡","state":"on"}"#.as_bytes();
        // Split in the middle of the multi-byte character.
        let split = wire
            .iter()
            .position(|b| *b >= 0x80)
            .expect("Should contain a multi-byte character")
            + 1;
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&wire[..split]).messages.is_empty());
        let outcome = decoder.feed(&wire[split..]);
        assert_eq!(outcome.messages[0]["name"], json!("Blitz⚡"));
        assert!(outcome.error.is_none());
    }
}
