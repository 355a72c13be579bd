//! Ingress framing for the Stream Multiplexer (C7): bounded accumulation
//! buffer plus incremental UTF-8 decoding.
//!
//! Pulled out of the channel-reading loop in `mod.rs` so the framing rules in
//! spec.md §4.7/§3 (10 MiB hard cap with drop-oldest, 1 MiB pause threshold,
//! never emit a partial multibyte sequence) are unit-testable without a live
//! transport, the way the teacher keeps prompt-detection logic
//! (`device.rs`) separate from the channel I/O loop in `session.rs`.

/// Result of feeding one chunk of raw bytes into an [`IngressBuffer`].
pub struct PushOutcome {
    /// Decoded text ready to hand to the event bus. May be empty if the
    /// chunk ended mid-sequence.
    pub text: String,
    /// `true` if this push caused the hard cap to be exceeded and older
    /// accumulated bytes were dropped.
    pub overflowed: bool,
    /// `true` if the buffered-but-undelivered byte count is at or above the
    /// pause threshold; the caller should pause the source for the
    /// configured duration before reading again.
    pub should_pause: bool,
}

/// Accumulates raw bytes and decodes them to UTF-8 incrementally, retaining
/// up to three trailing bytes across calls when a multibyte sequence is
/// split across chunks. Invalid sequences are replaced with U+FFFD;
/// incomplete trailing sequences are never emitted.
pub struct IngressBuffer {
    hard_cap_bytes: usize,
    pause_threshold_bytes: usize,
    carry: Vec<u8>,
}

impl IngressBuffer {
    pub fn new(hard_cap_bytes: usize, pause_threshold_bytes: usize) -> Self {
        Self {
            hard_cap_bytes,
            pause_threshold_bytes,
            carry: Vec::new(),
        }
    }

    /// Feeds `data` into the buffer, decodes as much complete UTF-8 as
    /// possible, and reports whether the caller should pause.
    pub fn push(&mut self, data: &[u8]) -> PushOutcome {
        let mut overflowed = false;

        if self.carry.len() + data.len() > self.hard_cap_bytes {
            overflowed = true;
            self.carry.clear();
            if data.len() > self.hard_cap_bytes {
                let start = data.len() - self.hard_cap_bytes;
                self.carry.extend_from_slice(&data[start..]);
            } else {
                self.carry.extend_from_slice(data);
            }
        } else {
            self.carry.extend_from_slice(data);
        }

        let should_pause = self.carry.len() >= self.pause_threshold_bytes;
        let text = decode_and_drain(&mut self.carry);

        PushOutcome {
            text,
            overflowed,
            should_pause,
        }
    }

    /// Bytes currently buffered (an incomplete trailing multibyte sequence,
    /// almost always 0–3 bytes in steady state).
    pub fn buffered_len(&self) -> usize {
        self.carry.len()
    }
}

/// Decodes as much of `carry` as is valid/terminable UTF-8, replacing
/// invalid sequences with U+FFFD, and leaves any trailing incomplete
/// sequence in `carry` for the next call.
fn decode_and_drain(carry: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        if carry.is_empty() {
            break;
        }
        match std::str::from_utf8(carry) {
            Ok(s) => {
                out.push_str(s);
                carry.clear();
                break;
            }
            Err(e) => {
                let valid_up_to = e.valid_up_to();
                if valid_up_to > 0 {
                    out.push_str(std::str::from_utf8(&carry[..valid_up_to]).expect("validated prefix"));
                }
                match e.error_len() {
                    Some(bad_len) => {
                        out.push('\u{FFFD}');
                        let rest = carry[valid_up_to + bad_len..].to_vec();
                        *carry = rest;
                    }
                    None => {
                        let remaining = carry[valid_up_to..].to_vec();
                        *carry = remaining;
                        break;
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through_unchanged() {
        let mut buf = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        let outcome = buf.push(b"hello world");
        assert_eq!(outcome.text, "hello world");
        assert!(!outcome.overflowed);
        assert!(!outcome.should_pause);
    }

    #[test]
    fn multibyte_sequence_split_across_chunks_decodes_correctly() {
        let snowman = "☃".as_bytes(); // E2 98 83
        let mut buf = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        let first = buf.push(&snowman[..1]);
        assert_eq!(first.text, "");
        let second = buf.push(&snowman[1..2]);
        assert_eq!(second.text, "");
        let third = buf.push(&snowman[2..]);
        assert_eq!(third.text, "☃");
    }

    #[test]
    fn invalid_byte_is_replaced_with_replacement_character() {
        let mut buf = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        let outcome = buf.push(&[b'a', 0xFF, b'b']);
        assert_eq!(outcome.text, "a\u{FFFD}b");
    }

    #[test]
    fn never_emits_a_partial_multibyte_sequence() {
        let euro = "€".as_bytes(); // E2 82 AC, 3 bytes
        let mut buf = IngressBuffer::new(10 * 1024 * 1024, 1024 * 1024);
        for b in &euro[..euro.len() - 1] {
            let outcome = buf.push(&[*b]);
            assert!(outcome.text.chars().all(|c| c != '\u{FFFD}'));
            assert_eq!(outcome.text, "");
        }
    }

    #[test]
    fn pause_threshold_trips_at_configured_size() {
        let mut buf = IngressBuffer::new(10 * 1024 * 1024, 8);
        // should_pause is read off the buffered length before this push's
        // bytes are decoded, so one chunk at or above the threshold trips
        // it even though the (valid, ASCII) text fully drains afterward.
        let outcome = buf.push(b"0123456789");
        assert!(outcome.should_pause);
        assert_eq!(outcome.text, "0123456789");
        assert_eq!(buf.buffered_len(), 0);
    }

    #[test]
    fn overflow_drops_oldest_and_keeps_latest_chunk() {
        let mut buf = IngressBuffer::new(16, 1024);
        buf.push(&[b'a'; 10]);
        let outcome = buf.push(&[b'b'; 10]);
        assert!(outcome.overflowed);
        assert!(buf.buffered_len() <= 16);
    }
}
