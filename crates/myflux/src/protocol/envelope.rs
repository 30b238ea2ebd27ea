//! Envelope reassembly and slicing.
//!
//! Inbound: envelopes accumulate until one arrives with a payload shorter
//! than the 16 MiB - 1 maximum, at which point the collected fragments form
//! one logical message. Outbound: a logical payload is sliced into maximal
//! windows, each with a fresh header, and a message whose length is an
//! exact multiple of the window size is terminated by a zero-length
//! envelope.

#![allow(clippy::cast_possible_truncation)]

use bytes::{Bytes, BytesMut};
use myflux_core::{Error, ProtocolErrorKind, Result};

use super::{EnvelopeHeader, MAX_ENVELOPE_SIZE};

/// Reassembles inbound envelopes into logical messages.
///
/// Fragments are kept as refcounted slices; they are only joined when a
/// consumer asks for a contiguous view.
#[derive(Debug)]
pub struct EnvelopeAssembler {
    fragments: Vec<Bytes>,
    expected: u8,
    enforce: bool,
}

impl EnvelopeAssembler {
    pub fn new() -> Self {
        Self {
            fragments: Vec::new(),
            expected: 0,
            enforce: true,
        }
    }

    /// Disable sequence verification for this assembler.
    pub fn without_sequence_tracking() -> Self {
        Self {
            enforce: false,
            ..Self::new()
        }
    }

    /// Set the next expected sequence id (exchange boundary).
    pub fn expect_sequence(&mut self, id: u8) {
        self.expected = id;
    }

    pub fn expected_sequence(&self) -> u8 {
        self.expected
    }

    /// Whether a message is partially assembled.
    pub fn is_mid_message(&self) -> bool {
        !self.fragments.is_empty()
    }

    /// Feed one envelope. Returns the fragment list of a completed logical
    /// message, or `None` while accumulation continues.
    pub fn push(&mut self, header: EnvelopeHeader, payload: Bytes) -> Result<Option<Vec<Bytes>>> {
        if self.enforce && header.sequence_id != self.expected {
            return Err(Error::protocol(
                ProtocolErrorKind::SequenceMismatch,
                format!(
                    "envelope sequence id {} but {} expected",
                    header.sequence_id, self.expected
                ),
            ));
        }
        self.expected = header.sequence_id.wrapping_add(1);

        debug_assert!(payload.len() == header.payload_length as usize);
        self.fragments.push(payload);

        if header.is_continuation() {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.fragments)))
        }
    }

    /// Drop any partially assembled message.
    pub fn clear(&mut self) {
        self.fragments.clear();
    }
}

impl Default for EnvelopeAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Join a completed fragment list into one contiguous payload.
///
/// The single-fragment case hands back the slice untouched.
pub fn join_fragments(mut fragments: Vec<Bytes>) -> Bytes {
    match fragments.len() {
        0 => Bytes::new(),
        1 => fragments.pop().unwrap_or_default(),
        _ => {
            let total = fragments.iter().map(Bytes::len).sum();
            let mut joined = BytesMut::with_capacity(total);
            for part in &fragments {
                joined.extend_from_slice(part);
            }
            joined.freeze()
        }
    }
}

/// Slice a logical payload into wire envelopes.
///
/// Advances `sequence` once per emitted envelope. A payload whose length is
/// an exact non-zero multiple of the window size gets a terminating
/// zero-length envelope so the peer can detect completion.
pub fn write_envelopes(dst: &mut BytesMut, payload: &[u8], sequence: &mut u8) {
    let mut offset = 0;
    loop {
        let chunk_len = (payload.len() - offset).min(MAX_ENVELOPE_SIZE);
        let header = EnvelopeHeader {
            payload_length: chunk_len as u32,
            sequence_id: *sequence,
        };
        dst.extend_from_slice(&header.to_bytes());
        dst.extend_from_slice(&payload[offset..offset + chunk_len]);
        *sequence = sequence.wrapping_add(1);
        offset += chunk_len;

        if offset >= payload.len() {
            // A full-size final window needs an explicit empty terminator.
            if chunk_len == MAX_ENVELOPE_SIZE {
                let trailer = EnvelopeHeader {
                    payload_length: 0,
                    sequence_id: *sequence,
                };
                dst.extend_from_slice(&trailer.to_bytes());
                *sequence = sequence.wrapping_add(1);
            }
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(len: usize, seq: u8) -> EnvelopeHeader {
        EnvelopeHeader {
            payload_length: len as u32,
            sequence_id: seq,
        }
    }

    #[test]
    fn single_envelope_message() {
        let mut asm = EnvelopeAssembler::new();
        let out = asm
            .push(header(3, 0), Bytes::from_static(b"abc"))
            .unwrap()
            .unwrap();
        assert_eq!(join_fragments(out), Bytes::from_static(b"abc"));
        assert_eq!(asm.expected_sequence(), 1);
    }

    #[test]
    fn continuation_concatenates() {
        let mut asm = EnvelopeAssembler::new();
        let big = Bytes::from(vec![0x61; MAX_ENVELOPE_SIZE]);
        assert!(asm.push(header(MAX_ENVELOPE_SIZE, 0), big).unwrap().is_none());
        let out = asm
            .push(header(2, 1), Bytes::from_static(b"zz"))
            .unwrap()
            .unwrap();
        let joined = join_fragments(out);
        assert_eq!(joined.len(), MAX_ENVELOPE_SIZE + 2);
        assert_eq!(&joined[MAX_ENVELOPE_SIZE..], b"zz");
    }

    #[test]
    fn zero_length_terminator_completes_message() {
        let mut asm = EnvelopeAssembler::new();
        let big = Bytes::from(vec![1u8; MAX_ENVELOPE_SIZE]);
        assert!(asm.push(header(MAX_ENVELOPE_SIZE, 0), big).unwrap().is_none());
        let out = asm.push(header(0, 1), Bytes::new()).unwrap().unwrap();
        assert_eq!(join_fragments(out).len(), MAX_ENVELOPE_SIZE);
    }

    #[test]
    fn sequence_mismatch_is_fatal() {
        let mut asm = EnvelopeAssembler::new();
        asm.expect_sequence(1);
        let err = asm
            .push(header(1, 5), Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn sequence_tracking_can_be_disabled() {
        let mut asm = EnvelopeAssembler::without_sequence_tracking();
        assert!(asm
            .push(header(1, 42), Bytes::from_static(b"x"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn sequence_wraps_at_256() {
        let mut asm = EnvelopeAssembler::new();
        asm.expect_sequence(255);
        asm.push(header(1, 255), Bytes::from_static(b"x")).unwrap();
        assert_eq!(asm.expected_sequence(), 0);
    }

    #[test]
    fn encode_small_payload() {
        let mut dst = BytesMut::new();
        let mut seq = 0u8;
        write_envelopes(&mut dst, b"hello", &mut seq);
        assert_eq!(&dst[..4], &[5, 0, 0, 0]);
        assert_eq!(&dst[4..], b"hello");
        assert_eq!(seq, 1);
    }

    #[test]
    fn encode_empty_payload_is_one_empty_envelope() {
        let mut dst = BytesMut::new();
        let mut seq = 3u8;
        write_envelopes(&mut dst, b"", &mut seq);
        assert_eq!(&dst[..], &[0, 0, 0, 3]);
        assert_eq!(seq, 4);
    }

    #[test]
    fn encode_decode_roundtrip_across_boundary() {
        // One byte over the window size: two envelopes, lengths MAX and 1.
        let payload = vec![7u8; MAX_ENVELOPE_SIZE + 1];
        let mut dst = BytesMut::new();
        let mut seq = 0u8;
        write_envelopes(&mut dst, &payload, &mut seq);
        assert_eq!(seq, 2);

        let mut asm = EnvelopeAssembler::new();
        let mut rest = dst.freeze();
        let mut result = None;
        while !rest.is_empty() {
            let mut hdr = [0u8; 4];
            hdr.copy_from_slice(&rest.split_to(4));
            let header = EnvelopeHeader::from_bytes(&hdr);
            let body = rest.split_to(header.payload_length as usize);
            if let Some(done) = asm.push(header, body).unwrap() {
                result = Some(join_fragments(done));
            }
        }
        assert_eq!(result.unwrap().len(), payload.len());
    }

    #[test]
    fn encode_exact_multiple_has_zero_terminator() {
        let payload = vec![7u8; MAX_ENVELOPE_SIZE];
        let mut dst = BytesMut::new();
        let mut seq = 0u8;
        write_envelopes(&mut dst, &payload, &mut seq);
        // MAX envelope + empty trailer
        assert_eq!(seq, 2);
        let trailer_at = 4 + MAX_ENVELOPE_SIZE;
        assert_eq!(&dst[trailer_at..trailer_at + 4], &[0, 0, 0, 1]);
    }
}
