//! Stream framing: RPC record marking and 9P size-prefixed messages.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

pub const RECORD_MARK_LEN: usize = 4;
const LAST_FRAGMENT: u32 = 0x8000_0000;
const FRAGMENT_LEN_MASK: u32 = 0x7fff_ffff;

/// Smallest 9P message: size[4] type[1] tag[2].
pub const NINEP_MIN_MESSAGE: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Framing {
    /// RFC 5531 record marking; fragments are reassembled into one message.
    RecordMarking,
    /// 9P: little-endian size[4] covering the whole message, size field included.
    NineP,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame read aborted")]
    Aborted,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// Read timed out before the first byte of a frame.
    Idle,
    Eof,
}

pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    max_frame_bytes: usize,
    abort: Option<Arc<AtomicBool>>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            framing,
            max_frame_bytes,
            abort: None,
        }
    }

    /// Flag checked when a read times out mid-frame.
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn read_next(&mut self) -> Result<ReadOutcome, FrameError> {
        match self.framing {
            Framing::RecordMarking => self.read_record(),
            Framing::NineP => self.read_ninep(),
        }
    }

    fn read_record(&mut self) -> Result<ReadOutcome, FrameError> {
        let mut message = Vec::new();
        let mut first = true;
        loop {
            let mut mark = [0u8; RECORD_MARK_LEN];
            match self.fill(&mut mark, first)? {
                Fill::Done => {}
                Fill::Idle => return Ok(ReadOutcome::Idle),
                Fill::Eof => return Ok(ReadOutcome::Eof),
            }
            first = false;
            let raw = u32::from_be_bytes(mark);
            let len = (raw & FRAGMENT_LEN_MASK) as usize;
            let total = message.len() + len;
            if total > self.max_frame_bytes {
                return Err(FrameError::FrameTooLarge {
                    max_frame_bytes: self.max_frame_bytes,
                    got_bytes: total,
                });
            }
            let start = message.len();
            message.resize(total, 0);
            if let Fill::Eof = self.fill(&mut message[start..], false)? {
                return Err(truncated("record fragment truncated"));
            }
            if raw & LAST_FRAGMENT != 0 {
                if message.is_empty() {
                    return Err(FrameError::FrameLengthInvalid {
                        reason: "empty record".to_string(),
                    });
                }
                return Ok(ReadOutcome::Frame(message));
            }
        }
    }

    fn read_ninep(&mut self) -> Result<ReadOutcome, FrameError> {
        let mut size = [0u8; 4];
        match self.fill(&mut size, true)? {
            Fill::Done => {}
            Fill::Idle => return Ok(ReadOutcome::Idle),
            Fill::Eof => return Ok(ReadOutcome::Eof),
        }
        let len = u32::from_le_bytes(size) as usize;
        if len < NINEP_MIN_MESSAGE {
            return Err(FrameError::FrameLengthInvalid {
                reason: format!("9P size {len} below minimum {NINEP_MIN_MESSAGE}"),
            });
        }
        if len > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: len,
            });
        }
        let mut message = vec![0u8; len];
        message[..4].copy_from_slice(&size);
        if let Fill::Eof = self.fill(&mut message[4..], false)? {
            return Err(truncated("9P message truncated"));
        }
        Ok(ReadOutcome::Frame(message))
    }

    /// Fill `buf` completely. Timeouts before the first byte of a frame report
    /// `Idle`; later timeouts keep reading unless aborted.
    fn fill(&mut self, buf: &mut [u8], frame_start: bool) -> Result<Fill, FrameError> {
        let mut read = 0usize;
        while read < buf.len() {
            match self.reader.read(&mut buf[read..]) {
                Ok(0) => {
                    if read == 0 && frame_start {
                        return Ok(Fill::Eof);
                    }
                    return Err(truncated("frame truncated"));
                }
                Ok(n) => read += n,
                Err(err) if is_timeout(&err) => {
                    if read == 0 && frame_start {
                        return Ok(Fill::Idle);
                    }
                    if self
                        .abort
                        .as_ref()
                        .is_some_and(|flag| flag.load(Ordering::Acquire))
                    {
                        return Err(FrameError::Aborted);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(Fill::Done)
    }
}

enum Fill {
    Done,
    Idle,
    Eof,
}

fn truncated(what: &str) -> FrameError {
    io::Error::new(io::ErrorKind::UnexpectedEof, what.to_string()).into()
}

pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

pub struct FrameWriter<W> {
    writer: W,
    framing: Framing,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, framing: Framing, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            framing,
            max_frame_bytes,
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(self.framing, payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

/// Encode one message. 9P payloads already carry their size header.
pub fn encode_frame(
    framing: Framing,
    payload: &[u8],
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    match framing {
        Framing::RecordMarking => {
            let len = u32::try_from(payload.len())
                .ok()
                .filter(|len| *len <= FRAGMENT_LEN_MASK)
                .ok_or_else(|| FrameError::FrameLengthInvalid {
                    reason: "record exceeds fragment length".to_string(),
                })?;
            let mut frame = Vec::with_capacity(RECORD_MARK_LEN + payload.len());
            frame.extend_from_slice(&(LAST_FRAGMENT | len).to_be_bytes());
            frame.extend_from_slice(payload);
            Ok(frame)
        }
        Framing::NineP => {
            let declared = payload
                .get(..4)
                .map(|size| u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize);
            if declared != Some(payload.len()) {
                return Err(FrameError::FrameLengthInvalid {
                    reason: "9P size header does not match payload".to_string(),
                });
            }
            Ok(payload.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    fn fragment(last: bool, body: &[u8]) -> Vec<u8> {
        let mut mark = body.len() as u32;
        if last {
            mark |= LAST_FRAGMENT;
        }
        let mut out = mark.to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn record_marking_reassembles_fragments() {
        let mut wire = fragment(false, b"hello ");
        wire.extend(fragment(true, b"world"));
        let mut reader = FrameReader::new(Cursor::new(wire), Framing::RecordMarking, 1024);
        match reader.read_next().unwrap() {
            ReadOutcome::Frame(msg) => assert_eq!(msg, b"hello world"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(reader.read_next().unwrap(), ReadOutcome::Eof));
    }

    #[test]
    fn record_marking_enforces_max_across_fragments() {
        let mut wire = fragment(false, &[0u8; 8]);
        wire.extend(fragment(true, &[0u8; 8]));
        let mut reader = FrameReader::new(Cursor::new(wire), Framing::RecordMarking, 12);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { got_bytes: 16, .. }));
    }

    #[test]
    fn writer_emits_single_last_fragment() {
        let mut out = Vec::new();
        FrameWriter::new(&mut out, Framing::RecordMarking, 64)
            .write_frame(b"abc")
            .unwrap();
        assert_eq!(out, fragment(true, b"abc"));
    }

    #[test]
    fn ninep_reads_size_prefixed_messages() {
        let mut msg = 9u32.to_le_bytes().to_vec();
        msg.extend_from_slice(&[100, 1, 0, 0xaa, 0xbb]);
        let mut reader = FrameReader::new(Cursor::new(msg.clone()), Framing::NineP, 64);
        match reader.read_next().unwrap() {
            ReadOutcome::Frame(frame) => assert_eq!(frame, msg),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn ninep_rejects_undersized_header() {
        let wire = 3u32.to_le_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(wire), Framing::NineP, 64);
        assert!(matches!(
            reader.read_next(),
            Err(FrameError::FrameLengthInvalid { .. })
        ));
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut wire = (LAST_FRAGMENT | 10).to_be_bytes().to_vec();
        wire.extend_from_slice(b"short");
        let mut reader = FrameReader::new(Cursor::new(wire), Framing::RecordMarking, 64);
        assert!(matches!(reader.read_next(), Err(FrameError::Io(_))));
    }
}
