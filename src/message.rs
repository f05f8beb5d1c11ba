//! Frame builder and field decoding helpers.
//!
//! Every integer is little-endian; strings carry a 2-byte length prefix and
//! bulk data a 4-byte one.

use crate::error::{Error, Result};
use crate::protocol::{HEADER_SIZE, Qid, QidType};

/// Frame encoder with size prefix.
pub(crate) struct Message {
    buf: Vec<u8>,
}

impl Message {
    pub(crate) fn new(msg_type: u8, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        buf.push(msg_type);
        buf.extend_from_slice(&tag.to_le_bytes());
        Self { buf }
    }

    pub(crate) fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub(crate) fn push_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn push_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn push_str(&mut self, value: &str) -> Result<()> {
        push_str(&mut self.buf, value)
    }

    pub(crate) fn push_qid(&mut self, qid: &Qid) {
        push_qid(&mut self.buf, qid);
    }

    /// Push a 4-byte length followed by `data`.
    pub(crate) fn push_data(&mut self, data: &[u8]) -> Result<()> {
        let len = u32::try_from(data.len()).map_err(|_| Error::Malformed("data too large"))?;
        self.push_u32(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub(crate) fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub(crate) fn finish(mut self) -> Result<Vec<u8>> {
        let size = u32::try_from(self.buf.len()).map_err(|_| Error::FrameTooLarge {
            size: self.buf.len(),
            limit: u32::MAX,
        })?;
        self.buf[0..4].copy_from_slice(&size.to_le_bytes());
        Ok(self.buf)
    }
}

pub(crate) fn push_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| Error::StringTooLong(bytes.len()))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

pub(crate) fn push_qid(buf: &mut Vec<u8>, qid: &Qid) {
    buf.push(qid.type_.bits());
    buf.extend_from_slice(&qid.version.to_le_bytes());
    buf.extend_from_slice(&qid.path.to_le_bytes());
}

fn take<'a>(buf: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = offset.checked_add(len).ok_or(Error::ShortBuffer)?;
    if end > buf.len() {
        return Err(Error::ShortBuffer);
    }
    let slice = &buf[*offset..end];
    *offset = end;
    Ok(slice)
}

pub(crate) fn read_u8(buf: &[u8], offset: &mut usize) -> Result<u8> {
    Ok(take(buf, offset, 1)?[0])
}

pub(crate) fn read_u16(buf: &[u8], offset: &mut usize) -> Result<u16> {
    let b = take(buf, offset, 2)?;
    Ok(u16::from_le_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: &mut usize) -> Result<u32> {
    let b = take(buf, offset, 4)?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: &mut usize) -> Result<u64> {
    let b = take(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_le_bytes(raw))
}

pub(crate) fn read_str(buf: &[u8], offset: &mut usize) -> Result<String> {
    let len = read_u16(buf, offset)? as usize;
    let bytes = take(buf, offset, len)?;
    let value = core::str::from_utf8(bytes).map_err(|_| Error::InvalidUtf8)?;
    Ok(value.to_string())
}

/// Read a 4-byte length followed by that many bytes.
pub(crate) fn read_data(buf: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(buf, offset)? as usize;
    Ok(take(buf, offset, len)?.to_vec())
}

pub(crate) fn read_qid(buf: &[u8], offset: &mut usize) -> Result<Qid> {
    let type_ = read_u8(buf, offset)?;
    let version = read_u32(buf, offset)?;
    let path = read_u64(buf, offset)?;
    Ok(Qid {
        type_: QidType::from_bits_retain(type_),
        version,
        path,
    })
}

/// Split a frame header into (size, type, tag).
pub(crate) fn read_header(buf: &[u8]) -> Result<(u32, u8, u16)> {
    if buf.len() < HEADER_SIZE {
        return Err(Error::ShortBuffer);
    }
    let mut offset = 0;
    let size = read_u32(buf, &mut offset)?;
    let msg_type = read_u8(buf, &mut offset)?;
    let tag = read_u16(buf, &mut offset)?;
    Ok((size, msg_type, tag))
}

pub(crate) fn dump_hex(buf: &[u8]) -> String {
    let mut out = String::new();
    for (idx, byte) in buf.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_writes_size_prefix() {
        let mut msg = Message::new(100, 0xFFFF);
        msg.push_u32(8216);
        msg.push_str("P1").unwrap();
        let frame = msg.finish().unwrap();
        assert_eq!(frame.len(), 7 + 4 + 2 + 2);
        assert_eq!(read_header(&frame).unwrap(), (15, 100, 0xFFFF));
        assert_eq!(dump_hex(&frame[..5]), "0f 00 00 00 64");
    }

    #[test]
    fn readers_reject_short_input() {
        let mut offset = 0;
        assert!(matches!(read_u32(&[1, 2, 3], &mut offset), Err(Error::ShortBuffer)));
        assert_eq!(offset, 0);
        let mut offset = 0;
        assert!(matches!(read_str(&[5, 0, b'a'], &mut offset), Err(Error::ShortBuffer)));
    }

    #[test]
    fn strings_reject_invalid_utf8_and_overflow() {
        let mut offset = 0;
        assert!(matches!(
            read_str(&[2, 0, 0xff, 0xfe], &mut offset),
            Err(Error::InvalidUtf8)
        ));
        let mut buf = Vec::new();
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(push_str(&mut buf, &long), Err(Error::StringTooLong(_))));
        let max = "y".repeat(u16::MAX as usize);
        push_str(&mut buf, &max).unwrap();
        let mut offset = 0;
        assert_eq!(read_str(&buf, &mut offset).unwrap().len(), u16::MAX as usize);
    }

    #[test]
    fn qid_layout_is_thirteen_bytes() {
        let qid = Qid::new(QidType::DIR, 7, u64::MAX);
        let mut buf = Vec::new();
        push_qid(&mut buf, &qid);
        assert_eq!(buf.len(), crate::protocol::QID_SIZE);
        assert_eq!(buf[0], 0x80);
        let mut offset = 0;
        assert_eq!(read_qid(&buf, &mut offset).unwrap(), qid);
    }
}
