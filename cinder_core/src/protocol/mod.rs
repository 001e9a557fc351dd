//! Length-framed messages exchanged between the orchestrator and its workers.
//!
//! Every frame is `[kind: u8][body length: varint][body]`.

pub mod message;
pub mod rw_buffer;
pub mod varint;

pub use message::{Message, MessageKind, WorkResult, WorkSummary};
pub use rw_buffer::RwBuffer;

use bincode::config::{self, Configuration, LittleEndian, Limit, Varint};
use bincode::error::{DecodeError, EncodeError};
use std::io::Write;
use thiserror::Error;
use varint::VarintError;

/// Frames with a larger declared body are treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Bodies may not declare containers larger than a whole frame.
const BINCODE_CONFIG: Configuration<LittleEndian, Varint, Limit<MAX_FRAME_LEN>> =
    config::standard().with_limit::<MAX_FRAME_LEN>();

/// Unrecoverable failures on a worker connection. "Not enough bytes yet" is
/// never an error; the decoder simply waits for more input.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),

    #[error("frame length prefix overflows a u64")]
    VarintOverflow,

    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u64),

    #[error("malformed {kind:?} body: {source}")]
    MalformedBody {
        kind: MessageKind,
        #[source]
        source: DecodeError,
    },

    #[error("{kind:?} frame has {extra} unexpected trailing bytes")]
    TrailingBytes { kind: MessageKind, extra: usize },

    #[error("failed to encode message body: {0}")]
    Encode(#[from] EncodeError),

    #[error("protocol I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializes a message into a single frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let encoded_body;
    let body: &[u8] = match message {
        Message::Ready | Message::RequestCoverage => &[],
        Message::DoWork(payload) | Message::WorkCoverage(payload) => payload,
        Message::WorkSummary(summary) => {
            encoded_body = bincode::encode_to_vec(summary, BINCODE_CONFIG)?;
            &encoded_body
        }
        Message::FoundLiterals(literals) => {
            encoded_body = bincode::encode_to_vec(literals, BINCODE_CONFIG)?;
            &encoded_body
        }
    };

    let mut frame = Vec::with_capacity(1 + varint::MAX_ENCODED_LEN + body.len());
    frame.push(message.kind() as u8);
    varint::encode(body.len() as u64, &mut frame);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Encodes `message` onto `writer` and flushes it.
pub fn write_message<W: Write + ?Sized>(
    writer: &mut W,
    message: &Message,
) -> Result<(), ProtocolError> {
    let frame = encode(message)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

fn decode_body(kind: MessageKind, body: &[u8]) -> Result<Message, ProtocolError> {
    fn bincode_body<T: bincode::Decode<()>>(
        kind: MessageKind,
        body: &[u8],
    ) -> Result<T, ProtocolError> {
        let (value, read) = bincode::decode_from_slice(body, BINCODE_CONFIG)
            .map_err(|source| ProtocolError::MalformedBody { kind, source })?;
        if read != body.len() {
            return Err(ProtocolError::TrailingBytes {
                kind,
                extra: body.len() - read,
            });
        }
        Ok(value)
    }

    let empty = |message: Message| {
        if body.is_empty() {
            Ok(message)
        } else {
            Err(ProtocolError::TrailingBytes {
                kind,
                extra: body.len(),
            })
        }
    };

    match kind {
        MessageKind::Ready => empty(Message::Ready),
        MessageKind::RequestCoverage => empty(Message::RequestCoverage),
        MessageKind::DoWork => Ok(Message::DoWork(body.to_vec())),
        MessageKind::WorkCoverage => Ok(Message::WorkCoverage(body.to_vec())),
        MessageKind::WorkSummary => bincode_body(kind, body).map(Message::WorkSummary),
        MessageKind::FoundLiterals => bincode_body(kind, body).map(Message::FoundLiterals),
    }
}

/// Incremental frame decoder over an [`RwBuffer`].
#[derive(Debug, Default)]
pub struct Decoder {
    buffer: RwBuffer,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: RwBuffer::with_capacity(capacity),
        }
    }

    /// Appends bytes read from the stream.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.write(data);
    }

    /// Bytes received but not yet decoded into a message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete message, or returns `Ok(None)` when the
    /// buffered bytes do not yet hold a whole frame.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(&tag) = self.buffer.unread().first() else {
            return Ok(None);
        };
        let kind = MessageKind::try_from(tag).map_err(ProtocolError::UnknownKind)?;
        self.buffer.advance_read(1);

        match self.decode_frame(kind) {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                self.buffer.advance_read(-1);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn decode_frame(&mut self, kind: MessageKind) -> Result<Option<Message>, ProtocolError> {
        let unread = self.buffer.unread();
        let (len, header) = match varint::decode(unread) {
            Ok(decoded) => decoded,
            Err(VarintError::Incomplete) => return Ok(None),
            Err(VarintError::Overflow) => return Err(ProtocolError::VarintOverflow),
        };
        if len > MAX_FRAME_LEN as u64 {
            return Err(ProtocolError::FrameTooLarge(len));
        }
        let end = header + len as usize;
        if unread.len() < end {
            return Ok(None);
        }
        let message = decode_body(kind, &unread[header..end])?;
        self.buffer.advance_read(end as isize);
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_summary() -> WorkSummary {
        WorkSummary {
            result: WorkResult::Error,
            coverage_size: 42,
            input_length: 7,
            hash: "0123456789abcdef0123456789abcdef".to_string(),
            runtime_us: 153.5,
            error: Some("index out of bounds".to_string()),
        }
    }

    fn every_kind() -> Vec<Message> {
        vec![
            Message::Ready,
            Message::DoWork(vec![]),
            Message::DoWork(b"payload".to_vec()),
            Message::WorkSummary(sample_summary()),
            Message::RequestCoverage,
            Message::WorkCoverage(vec![0, 1, 2, 4, 8, 0, 128]),
            Message::FoundLiterals(vec!["GET".to_string(), "Content-Length".to_string()]),
        ]
    }

    fn decode_all(decoder: &mut Decoder) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(message) = decoder.next_message().expect("stream should be valid") {
            out.push(message);
        }
        out
    }

    #[test]
    fn every_kind_survives_a_round_trip() {
        for message in every_kind() {
            let mut decoder = Decoder::with_capacity(8);
            decoder.feed(&encode(&message).unwrap());
            assert_eq!(decoder.next_message().unwrap(), Some(message));
            assert_eq!(decoder.pending(), 0);
        }
    }

    #[test]
    fn payload_larger_than_the_buffer_forces_a_grow() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let message = Message::DoWork(payload);
        let mut decoder = Decoder::with_capacity(16);
        decoder.feed(&encode(&message).unwrap());
        assert_eq!(decoder.next_message().unwrap(), Some(message));
    }

    #[test]
    fn split_at_any_boundary_decodes_identically() {
        let message = Message::WorkSummary(sample_summary());
        let frame = encode(&message).unwrap();
        for split in 0..=frame.len() {
            let mut decoder = Decoder::with_capacity(4);
            decoder.feed(&frame[..split]);
            let early = decoder.next_message().unwrap();
            if split < frame.len() {
                assert_eq!(early, None, "split at {split} decoded too early");
                decoder.feed(&frame[split..]);
                assert_eq!(decoder.next_message().unwrap(), Some(message.clone()));
            } else {
                assert_eq!(early, Some(message.clone()));
            }
        }
    }

    #[test]
    fn back_to_back_frames_in_one_write() {
        let messages = every_kind();
        let stream: Vec<u8> = messages
            .iter()
            .flat_map(|m| encode(m).unwrap())
            .collect();
        let mut decoder = Decoder::with_capacity(32);
        decoder.feed(&stream);
        assert_eq!(decode_all(&mut decoder), messages);
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.feed(&[0x7F, 0x00]);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::UnknownKind(0x7F))
        ));
    }

    #[test]
    fn corrupt_summary_body_is_fatal() {
        let mut decoder = Decoder::new();
        decoder.feed(&[MessageKind::WorkSummary as u8, 2, 0xFF, 0xFF]);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::MalformedBody {
                kind: MessageKind::WorkSummary,
                ..
            })
        ));
    }

    #[test]
    fn absurd_string_length_in_a_summary_is_malformed() {
        // result, coverage_size, input_length, then a u64-prefixed hash length of 2^62.
        let mut body = vec![0, 0, 0, 253];
        body.extend_from_slice(&(1u64 << 62).to_le_bytes());
        let mut frame = vec![MessageKind::WorkSummary as u8];
        varint::encode(body.len() as u64, &mut frame);
        frame.extend_from_slice(&body);

        let mut decoder = Decoder::new();
        decoder.feed(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::MalformedBody {
                kind: MessageKind::WorkSummary,
                source: DecodeError::LimitExceeded,
            })
        ));
    }

    #[test]
    fn absurd_literal_count_is_malformed() {
        let mut body = vec![253];
        body.extend_from_slice(&(u64::MAX / 2).to_le_bytes());
        let mut frame = vec![MessageKind::FoundLiterals as u8];
        varint::encode(body.len() as u64, &mut frame);
        frame.extend_from_slice(&body);

        let mut decoder = Decoder::new();
        decoder.feed(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::MalformedBody {
                kind: MessageKind::FoundLiterals,
                ..
            })
        ));
    }

    #[test]
    fn body_on_an_empty_kind_is_rejected() {
        let mut decoder = Decoder::new();
        decoder.feed(&[MessageKind::Ready as u8, 1, 0]);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::TrailingBytes { extra: 1, .. })
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering_it() {
        let mut frame = vec![MessageKind::DoWork as u8];
        varint::encode(MAX_FRAME_LEN as u64 + 1, &mut frame);
        let mut decoder = Decoder::new();
        decoder.feed(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn infinite_runtime_round_trips_through_json() {
        let mut summary = sample_summary();
        summary.runtime_us = f64::INFINITY;
        let json = serde_json::to_string(&summary).unwrap();
        let back: WorkSummary = serde_json::from_str(&json).unwrap();
        assert!(back.runtime_us.is_infinite());
        assert_eq!(back.hash, summary.hash);
    }

    #[test]
    fn write_message_flushes_a_whole_frame() {
        let mut sink = Vec::new();
        write_message(&mut sink, &Message::RequestCoverage).unwrap();
        assert_eq!(sink, vec![MessageKind::RequestCoverage as u8, 0]);
    }
}
