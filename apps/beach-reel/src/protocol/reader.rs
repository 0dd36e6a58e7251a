use std::collections::VecDeque;
use std::io::{self, Read};

use bytes::Bytes;
use thiserror::Error;

use super::{DEFAULT_MAX_PAYLOAD_LEN, FrameHeader, HEADER_LEN, MAGIC, MAGIC_BYTES, Message};
use crate::metrics;
use crate::telemetry::logging::hexdump;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("connection closed mid-frame after {read} of {expected} bytes")]
    ShortRead { expected: usize, read: usize },
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u64),
    #[error("transport read failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::ConnectionClosed => "closed",
            ProtocolError::ShortRead { .. } => "short_read",
            ProtocolError::PayloadTooLarge(_) => "payload_too_large",
            ProtocolError::Io(_) => "io",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReaderStats {
    pub messages: u64,
    pub payload_bytes: u64,
    pub resyncs: u64,
    pub skipped_bytes: u64,
}

/// Pulls framed messages off a blocking byte stream.
///
/// Bytes that do not start with the magic are skipped one at a time until the
/// stream lines up again. A header announcing more than `max_payload_len`
/// bytes is treated as a false magic match: its bytes are pushed back and the
/// scan resumes just after the rejected magic.
pub struct ProtocolReader<R> {
    inner: R,
    max_payload_len: u32,
    carry: VecDeque<u8>,
    stats: ReaderStats,
    finished: bool,
}

impl<R: Read> ProtocolReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            carry: VecDeque::new(),
            stats: ReaderStats::default(),
            finished: false,
        }
    }

    pub fn with_max_payload_len(mut self, max_payload_len: u32) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn stats(&self) -> ReaderStats {
        self.stats
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Blocks until one full message has been read.
    pub fn read_message(&mut self) -> Result<Message, ProtocolError> {
        loop {
            self.sync_to_magic()?;

            let mut rest = [0u8; HEADER_LEN - 2];
            self.read_full(&mut rest, false)?;
            let header = FrameHeader {
                magic: MAGIC,
                message_type: rest[0],
                payload_length: u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]),
            };

            if header.payload_length > self.max_payload_len {
                metrics::FRAMING_ERRORS
                    .with_label_values(&["oversized"])
                    .inc();
                tracing::warn!(
                    target: "beach_reel::protocol",
                    payload_length = header.payload_length,
                    max = self.max_payload_len,
                    "header length over limit; treating magic as false match"
                );
                tracing::trace!(
                    target: "beach_reel::protocol",
                    "rejected header:\n{}",
                    hexdump(&header.encode())
                );
                for byte in rest.iter().rev() {
                    self.carry.push_front(*byte);
                }
                // The second magic byte may itself start a real frame; only
                // the first one is discarded.
                self.carry.push_front(MAGIC_BYTES[1]);
                self.stats.skipped_bytes += 1;
                metrics::RESYNC_BYTES.inc();
                continue;
            }

            let mut payload = vec![0u8; header.payload_length as usize];
            self.read_full(&mut payload, false)?;

            self.stats.messages += 1;
            self.stats.payload_bytes += u64::from(header.payload_length);
            let message_type = header.kind();
            tracing::trace!(
                target: "beach_reel::protocol",
                kind = message_type.label(),
                len = header.payload_length,
                "message received"
            );
            return Ok(Message {
                message_type,
                payload: Bytes::from(payload),
            });
        }
    }

    fn sync_to_magic(&mut self) -> Result<(), ProtocolError> {
        let mut window = [0u8; 2];
        self.read_full(&mut window, true)?;
        let mut skipped: u64 = 0;
        while window != MAGIC_BYTES {
            skipped += 1;
            window[0] = window[1];
            let mut next = [0u8; 1];
            if let Err(err) = self.read_full(&mut next, true) {
                self.record_resync(skipped);
                return Err(err);
            }
            window[1] = next[0];
        }
        self.record_resync(skipped);
        Ok(())
    }

    fn record_resync(&mut self, skipped: u64) {
        if skipped == 0 {
            return;
        }
        self.stats.resyncs += 1;
        self.stats.skipped_bytes += skipped;
        metrics::FRAMING_ERRORS
            .with_label_values(&["bad_magic"])
            .inc();
        metrics::RESYNC_BYTES.inc_by(skipped);
        tracing::warn!(
            target: "beach_reel::protocol",
            skipped,
            "invalid magic; resynchronized stream"
        );
    }

    /// Fills `buf` completely, accumulating as many partial reads as needed.
    /// `at_boundary` marks reads where a clean EOF means the peer hung up
    /// between frames rather than in the middle of one.
    fn read_full(&mut self, buf: &mut [u8], at_boundary: bool) -> Result<(), ProtocolError> {
        let from_carry = self.carry.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.carry.drain(..from_carry)) {
            *slot = byte;
        }
        let mut filled = from_carry;

        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(if at_boundary && filled == 0 {
                        ProtocolError::ConnectionClosed
                    } else {
                        ProtocolError::ShortRead {
                            expected: buf.len(),
                            read: filled,
                        }
                    });
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProtocolError::Io(err)),
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for ProtocolReader<R> {
    type Item = Result<Message, ProtocolError>;

    /// Yields messages until the first fatal error, which is yielded once.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_message() {
            Ok(message) => Some(Ok(message)),
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ImagePayload, MessageType, encode_image, encode_message};
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read call.
    struct Trickle {
        inner: Cursor<Vec<u8>>,
        step: usize,
        calls: usize,
    }

    impl Trickle {
        fn new(bytes: Vec<u8>, step: usize) -> Self {
            Self {
                inner: Cursor::new(bytes),
                step,
                calls: 0,
            }
        }
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.calls += 1;
            if self.calls % 3 == 0 {
                return Err(io::Error::from(io::ErrorKind::Interrupted));
            }
            let len = buf.len().min(self.step);
            self.inner.read(&mut buf[..len])
        }
    }

    fn image(id: u8, data: &'static [u8]) -> ImagePayload {
        ImagePayload {
            stream_id: id,
            width: 640,
            height: 480,
            compressed: Bytes::from_static(data),
        }
    }

    #[test]
    fn reads_exact_payload_across_short_reads() {
        let first = encode_image(&image(1, &[1, 2, 3, 4])).expect("encode");
        let second = encode_message(MessageType::Object, b"obj").expect("encode");
        let mut wire = first.to_vec();
        wire.extend_from_slice(&second);
        let total = wire.len() as u64;

        let mut reader = ProtocolReader::new(Trickle::new(wire, 1));
        let message = reader.read_message().expect("first message");
        assert_eq!(message.message_type, MessageType::Image);
        assert_eq!(message.payload.len(), 9);
        assert_eq!(reader.get_ref().inner.position(), first.len() as u64);

        let message = reader.read_message().expect("second message");
        assert_eq!(message.message_type, MessageType::Object);
        assert_eq!(message.payload.as_ref(), b"obj");
        assert_eq!(reader.get_ref().inner.position(), total);
        assert_eq!(reader.stats().messages, 2);
        assert_eq!(reader.stats().payload_bytes, 12);
    }

    #[test]
    fn resynchronizes_after_bad_magic() {
        let mut wire = vec![0x00, 0x00];
        wire.extend_from_slice(&encode_image(&image(1, &[9, 9, 9, 9])).expect("encode"));

        let messages: Vec<_> = ProtocolReader::new(Cursor::new(wire)).collect();
        assert_eq!(messages.len(), 2);
        let message = messages[0].as_ref().expect("parsed after resync");
        assert_eq!(message.message_type, MessageType::Image);
        assert!(matches!(messages[1], Err(ProtocolError::ConnectionClosed)));
    }

    #[test]
    fn resync_discards_one_byte_at_a_time() {
        // A lone 0xCD before the real magic must not swallow the real one.
        let mut wire = vec![0x11, 0xCD];
        wire.extend_from_slice(&encode_message(MessageType::Mesh, b"m").expect("encode"));

        let mut reader = ProtocolReader::new(Cursor::new(wire));
        let message = reader.read_message().expect("message");
        assert_eq!(message.message_type, MessageType::Mesh);
        assert_eq!(reader.stats().resyncs, 1);
        assert_eq!(reader.stats().skipped_bytes, 2);
    }

    #[test]
    fn oversized_length_rescans_after_false_magic() {
        let mut wire = MAGIC_BYTES.to_vec();
        wire.push(0);
        wire.extend_from_slice(&u32::MAX.to_le_bytes());
        wire.extend_from_slice(&encode_message(MessageType::Object, b"ok").expect("encode"));

        let mut reader = ProtocolReader::new(Cursor::new(wire)).with_max_payload_len(1024);
        let resync_bytes = metrics::RESYNC_BYTES.get();
        let message = reader.read_message().expect("message after false match");
        assert_eq!(message.message_type, MessageType::Object);
        assert_eq!(message.payload.as_ref(), b"ok");

        // The whole 7-byte false header is discarded: its first magic byte on
        // the length check, the other six by the following rescan.
        let stats = reader.stats();
        assert_eq!(stats.skipped_bytes, 7);
        assert_eq!(stats.resyncs, 1);
        assert!(metrics::RESYNC_BYTES.get() >= resync_bytes + 7);
    }

    #[test]
    fn eof_mid_frame_is_short_read() {
        let wire = encode_image(&image(3, &[1, 2, 3, 4])).expect("encode");
        let truncated = wire[..wire.len() - 2].to_vec();
        let mut reader = ProtocolReader::new(Cursor::new(truncated));
        match reader.read_message() {
            Err(ProtocolError::ShortRead { expected, read }) => {
                assert_eq!(expected, 9);
                assert_eq!(read, 7);
            }
            other => panic!("expected short read, got {other:?}"),
        }
    }

    #[test]
    fn eof_between_frames_is_connection_closed() {
        let mut reader = ProtocolReader::new(Cursor::new(Vec::<u8>::new()));
        assert!(matches!(
            reader.read_message(),
            Err(ProtocolError::ConnectionClosed)
        ));
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
    }

    #[test]
    fn unknown_types_are_still_framed() {
        let wire = encode_message(MessageType::Unknown(42), &[7; 3]).expect("encode");
        let mut reader = ProtocolReader::new(Cursor::new(wire.to_vec()));
        let message = reader.read_message().expect("message");
        assert_eq!(message.message_type, MessageType::Unknown(42));
        assert_eq!(message.payload.len(), 3);
    }
}
