//! Reassembles `data: <json>\n\n` frames from arbitrarily split byte chunks.

use std::borrow::Cow;

/// Separator between logical messages.
const MESSAGE_SEPARATOR: &str = "\n\n";

/// Prefix of the first line of every message.
const FRAME_PREFIX: &str = "data: ";

/// Outcome for one logical unit of an input chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkResult {
    /// The bytes were not UTF-8, or a continuation arrived with nothing to
    /// continue.
    BadFormat,
    /// A message prefix was buffered; the payload so far.
    Incomplete(String),
    /// A full message payload with the frame prefix removed.
    Completed(String),
}

/// Incremental frame collector for one streaming session.
///
/// The pending buffer only ever holds the prefix of a single message. A new
/// `data: ` frame replaces it; the two are never joined.
#[derive(Debug, Default)]
pub struct ChunkCollector {
    pending: Option<String>,
    /// Leading bytes of a UTF-8 character cut off at the end of a chunk.
    remainder: Vec<u8>,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The partial message currently buffered, if any.
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Feed one chunk and collect the results in order.
    pub fn on_bytes(&mut self, data: &[u8]) -> Vec<ChunkResult> {
        let carried = std::mem::take(&mut self.remainder);
        let bytes: Cow<'_, [u8]> = if carried.is_empty() {
            Cow::Borrowed(data)
        } else {
            let mut joined = carried;
            joined.extend_from_slice(data);
            Cow::Owned(joined)
        };

        let mut text = match std::str::from_utf8(&bytes) {
            Ok(text) => text,
            // Truncated, not invalid: decode the prefix and keep the tail.
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = bytes.split_at(e.valid_up_to());
                self.remainder = tail.to_vec();
                match std::str::from_utf8(valid) {
                    Ok(text) => text,
                    Err(_) => return vec![ChunkResult::BadFormat],
                }
            }
            Err(_) => return vec![ChunkResult::BadFormat],
        };

        let mut results = Vec::new();

        // The separator itself was split across chunks.
        if text.starts_with('\n')
            && let Some(pending) = self.pending.take_if(|p| p.ends_with('\n'))
        {
            let mut message = pending;
            message.pop();
            results.push(ChunkResult::Completed(message));
            text = &text[1..];
        }

        let terminated_input = text.ends_with(MESSAGE_SEPARATOR);
        let units: Vec<&str> = text.split(MESSAGE_SEPARATOR).collect();
        let last = units.len().saturating_sub(1);

        for (index, unit) in units.into_iter().enumerate() {
            let terminated = index < last || terminated_input;
            if unit.is_empty() {
                // A separator right at the chunk start ends the pending message.
                if terminated && let Some(message) = self.pending.take() {
                    results.push(ChunkResult::Completed(message));
                }
                continue;
            }
            results.push(self.on_unit(unit, terminated));
        }

        results
    }

    fn on_unit(&mut self, unit: &str, terminated: bool) -> ChunkResult {
        if let Some(payload) = unit.strip_prefix(FRAME_PREFIX) {
            if let Some(discarded) = self.pending.take() {
                tracing::warn!(
                    discarded_len = discarded.len(),
                    "Discarding incomplete SSE frame"
                );
            }
            if terminated {
                return ChunkResult::Completed(payload.to_string());
            }
            self.pending = Some(payload.to_string());
            return ChunkResult::Incomplete(payload.to_string());
        }

        let Some(mut message) = self.pending.take() else {
            return ChunkResult::BadFormat;
        };
        message.push_str(unit);
        if terminated {
            ChunkResult::Completed(message)
        } else {
            self.pending = Some(message.clone());
            ChunkResult::Incomplete(message)
        }
    }
}
