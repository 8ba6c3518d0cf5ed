//! 9P2000.L message header: `size[4] type[1] tag[2]`, little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use super::ProtocolError;

pub const HEADER_LEN: usize = 7;

pub const RLERROR: u8 = 7;
pub const TVERSION: u8 = 100;
pub const RVERSION: u8 = 101;
pub const TFLUSH: u8 = 108;
pub const RFLUSH: u8 = 109;

pub const NOTAG: u16 = 0xffff;

pub const EINVAL: u32 = 22;
pub const EIO: u32 = 5;
pub const EAGAIN: u32 = 11;
pub const ENOTSUP: u32 = 95;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NinePHeader {
    pub size: u32,
    pub msg_type: u8,
    pub tag: u16,
}

impl NinePHeader {
    /// Parse and check that the declared size matches the bytes received.
    pub fn parse(msg: &[u8]) -> Result<Self, ProtocolError> {
        if msg.len() < HEADER_LEN {
            return Err(ProtocolError::NinePTooShort { len: msg.len() });
        }
        let size = u32::from_le_bytes([msg[0], msg[1], msg[2], msg[3]]);
        let msg_type = msg[4];
        let tag = u16::from_le_bytes([msg[5], msg[6]]);
        if size as usize != msg.len() {
            return Err(ProtocolError::NinePLengthMismatch {
                declared: size,
                actual: msg.len(),
                msg_type,
                tag,
            });
        }
        Ok(Self {
            size,
            msg_type,
            tag,
        })
    }

    pub fn is_flush(&self) -> bool {
        self.msg_type == TFLUSH
    }
}

/// `Tflush tag[2] oldtag[2]`; returns `oldtag`.
pub fn parse_tflush(header: &NinePHeader, msg: &[u8]) -> Result<u16, ProtocolError> {
    match msg.get(HEADER_LEN..HEADER_LEN + 2) {
        Some(raw) if msg.len() == HEADER_LEN + 2 => Ok(u16::from_le_bytes([raw[0], raw[1]])),
        _ => Err(ProtocolError::NinePBody {
            msg_type: header.msg_type,
            tag: header.tag,
        }),
    }
}

pub fn encode_message(msg_type: u8, tag: u16, body: &[u8]) -> Bytes {
    let size = HEADER_LEN + body.len();
    let mut out = BytesMut::with_capacity(size);
    out.put_u32_le(size as u32);
    out.put_u8(msg_type);
    out.put_u16_le(tag);
    out.extend_from_slice(body);
    out.freeze()
}

pub fn encode_rlerror(tag: u16, ecode: u32) -> Bytes {
    encode_message(RLERROR, tag, &ecode.to_le_bytes())
}

pub fn encode_rflush(tag: u16) -> Bytes {
    encode_message(RFLUSH, tag, &[])
}

pub fn encode_tflush(tag: u16, oldtag: u16) -> Bytes {
    encode_message(TFLUSH, tag, &oldtag.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields_are_little_endian() {
        let msg = encode_message(TVERSION, 0x0102, &[1, 2, 3]);
        let header = NinePHeader::parse(&msg).unwrap();
        assert_eq!(header.size, 10);
        assert_eq!(header.msg_type, TVERSION);
        assert_eq!(header.tag, 0x0102);
        assert_eq!(&msg[5..7], &[0x02, 0x01]);
    }

    #[test]
    fn size_mismatch_reports_tag_for_rlerror() {
        let mut raw = encode_message(TVERSION, 9, &[0; 4]).to_vec();
        raw.push(0);
        let err = NinePHeader::parse(&raw).unwrap_err();
        assert_eq!(err.tag(), Some(9));
        let reply = encode_rlerror(9, EINVAL);
        assert_eq!(reply.len(), 11);
        assert_eq!(reply[4], RLERROR);
        assert_eq!(&reply[7..], &EINVAL.to_le_bytes());
    }

    #[test]
    fn tflush_carries_oldtag() {
        let msg = encode_tflush(3, 77);
        let header = NinePHeader::parse(&msg).unwrap();
        assert!(header.is_flush());
        assert_eq!(parse_tflush(&header, &msg).unwrap(), 77);
        let short = encode_message(TFLUSH, 3, &[1]);
        let header = NinePHeader::parse(&short).unwrap();
        assert!(parse_tflush(&header, &short).is_err());
    }
}
