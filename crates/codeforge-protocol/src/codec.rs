//! Message framing over byte streams.
//!
//! `read_message` pulls exactly one header, validates it, then pulls
//! exactly `data_length` payload bytes. Short reads are retried until a
//! deadline so a message that straddles packet boundaries (or a
//! non-blocking socket that momentarily has no data) is still assembled
//! whole; a peer that stalls mid-frame surfaces as `Truncated`.
//!
//! `write_message` emits header then payload in one logical operation.
//! Callers serialise writers per stream, so messages never interleave.

use crate::error::FrameError;
use crate::header::{MessageHeader, MessageType, HEADER_LEN};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

/// How long an in-flight frame may stall before the stream is declared
/// truncated.
pub const FRAME_DEADLINE: Duration = Duration::from_secs(30);

const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// One framed message: validated header plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, correlation_id: u32, payload: Vec<u8>) -> Self {
        Self {
            header: MessageHeader::new(msg_type, payload.len() as u32, correlation_id),
            payload,
        }
    }

    /// Total bytes on the wire for this message.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Read one message, using the default frame deadline.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Message, FrameError> {
    read_message_deadline(reader, FRAME_DEADLINE)
}

/// Read one message, declaring the stream truncated if a frame takes
/// longer than `deadline` to complete.
pub fn read_message_deadline<R: Read>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Message, FrameError> {
    let started = Instant::now();

    let mut header_buf = [0u8; HEADER_LEN];
    read_exact_retry(reader, &mut header_buf, started, deadline)?;
    let header = MessageHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.data_length as usize];
    if !payload.is_empty() {
        read_exact_retry(reader, &mut payload, started, deadline)?;
    }

    Ok(Message { header, payload })
}

/// Write one message: header image then payload, completing short writes.
pub fn write_message<W: Write>(writer: &mut W, message: &Message) -> Result<(), FrameError> {
    let started = Instant::now();
    write_all_retry(writer, &message.header.encode(), started, FRAME_DEADLINE)?;
    if !message.payload.is_empty() {
        write_all_retry(writer, &message.payload, started, FRAME_DEADLINE)?;
    }
    writer.flush()?;
    Ok(())
}

fn read_exact_retry<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    started: Instant,
    deadline: Duration,
) -> Result<(), FrameError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(FrameError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if started.elapsed() >= deadline {
                    return Err(FrameError::Truncated);
                }
                std::thread::sleep(RETRY_PAUSE);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}

fn write_all_retry<W: Write>(
    writer: &mut W,
    buf: &[u8],
    started: Instant,
    deadline: Duration,
) -> Result<(), FrameError> {
    let mut written = 0;
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(FrameError::Io(std::io::Error::new(
                    ErrorKind::WriteZero,
                    "write returned zero",
                )))
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if started.elapsed() >= deadline {
                    return Err(FrameError::Truncated);
                }
                std::thread::sleep(RETRY_PAUSE);
            }
            Err(e) => return Err(FrameError::Io(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_message_round_trip() {
        let message = Message::new(MessageType::Ping, 17, vec![]);
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();
        assert_eq!(wire.len(), HEADER_LEN);

        let parsed = read_message(&mut Cursor::new(wire)).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_message_with_payload_round_trip() {
        let message = Message::new(MessageType::Error, 3, b"boom".to_vec());
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 4);

        let parsed = read_message(&mut Cursor::new(wire)).unwrap();
        assert_eq!(parsed.header.correlation_id, 3);
        assert_eq!(parsed.payload, b"boom");
    }

    #[test]
    fn test_truncated_header() {
        let message = Message::new(MessageType::Ping, 1, vec![]);
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();
        wire.truncate(10);

        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let message = Message::new(MessageType::Error, 1, vec![1, 2, 3, 4, 5]);
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();
        wire.truncate(HEADER_LEN + 2);

        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(FrameError::Truncated)
        ));
    }

    /// A reader that hands out one byte at a time forces the short-read
    /// retry path on every single byte of the frame.
    struct DribbleReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl Read for DribbleReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.data.len() {
                return Ok(0);
            }
            buf[0] = self.data[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn test_short_reads_are_completed() {
        let message = Message::new(MessageType::Error, 9, b"partial".to_vec());
        let mut wire = Vec::new();
        write_message(&mut wire, &message).unwrap();

        let mut reader = DribbleReader { data: wire, pos: 0 };
        let parsed = read_message(&mut reader).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_garbage_prefix_is_bad_magic() {
        let wire = vec![0xAAu8; HEADER_LEN];
        assert!(matches!(
            read_message(&mut Cursor::new(wire)),
            Err(FrameError::BadMagic(_))
        ));
    }
}
