//! Directory-entry metadata records.

use crate::error::{Error, Result};
use crate::message::{push_qid, push_str, read_qid, read_str, read_u16, read_u32, read_u64};
use crate::protocol::{DMDIR, Qid, QID_SIZE};

/// statSize[2] type[2] dev[2] qid[13] mode[4] atime[4] mtime[4] length[8]
/// plus four string length prefixes.
pub const STAT_FIXED_SIZE: usize = 2 + 2 + 2 + QID_SIZE + 4 + 4 + 4 + 8 + 4 * 2;

/// Point-in-time snapshot describing one namespace entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stat {
    pub type_: u16,
    pub dev: u16,
    pub qid: Qid,
    pub mode: u32,
    pub atime: u32,
    pub mtime: u32,
    pub length: u64,
    pub name: String,
    pub uid: String,
    pub gid: String,
    pub muid: String,
}

impl Stat {
    /// Number of bytes this record occupies on the wire, size prefix included.
    pub fn encoded_size(&self) -> usize {
        STAT_FIXED_SIZE + self.name.len() + self.uid.len() + self.gid.len() + self.muid.len()
    }

    pub fn is_dir(&self) -> bool {
        self.mode & DMDIR != 0
    }

    /// A stat whose every field means "leave unchanged" for write-stat.
    pub fn dont_touch() -> Self {
        Self {
            type_: u16::MAX,
            dev: u16::MAX,
            qid: Qid::new(
                crate::protocol::QidType::from_bits_retain(u8::MAX),
                u32::MAX,
                u64::MAX,
            ),
            mode: u32::MAX,
            atime: u32::MAX,
            mtime: u32::MAX,
            length: u64::MAX,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Same record under a different name, as used for the synthesized
    /// parent entry of a directory listing.
    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let body = self.encoded_size() - 2;
        let body = u16::try_from(body).map_err(|_| Error::StringTooLong(body))?;
        buf.extend_from_slice(&body.to_le_bytes());
        buf.extend_from_slice(&self.type_.to_le_bytes());
        buf.extend_from_slice(&self.dev.to_le_bytes());
        push_qid(buf, &self.qid);
        buf.extend_from_slice(&self.mode.to_le_bytes());
        buf.extend_from_slice(&self.atime.to_le_bytes());
        buf.extend_from_slice(&self.mtime.to_le_bytes());
        buf.extend_from_slice(&self.length.to_le_bytes());
        push_str(buf, &self.name)?;
        push_str(buf, &self.uid)?;
        push_str(buf, &self.gid)?;
        push_str(buf, &self.muid)?;
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Decode one record starting at `offset`, advancing past it.
    pub fn decode(buf: &[u8], offset: &mut usize) -> Result<Self> {
        let start = *offset;
        let size = read_u16(buf, offset)? as usize;
        let end = start + 2 + size;
        if end > buf.len() {
            return Err(Error::ShortBuffer);
        }
        let record = &buf[..end];
        let stat = Self {
            type_: read_u16(record, offset)?,
            dev: read_u16(record, offset)?,
            qid: read_qid(record, offset)?,
            mode: read_u32(record, offset)?,
            atime: read_u32(record, offset)?,
            mtime: read_u32(record, offset)?,
            length: read_u64(record, offset)?,
            name: read_str(record, offset)?,
            uid: read_str(record, offset)?,
            gid: read_str(record, offset)?,
            muid: read_str(record, offset)?,
        };
        if *offset != end {
            return Err(Error::Malformed("stat size mismatch"));
        }
        Ok(stat)
    }
}

/// Decode a concatenation of stat records, as returned by a directory read.
pub fn decode_stats(data: &[u8]) -> Result<Vec<Stat>> {
    let mut offset = 0;
    let mut stats = Vec::new();
    while offset < data.len() {
        stats.push(Stat::decode(data, &mut offset)?);
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QidType;

    fn sample(name: &str) -> Stat {
        Stat {
            type_: 0,
            dev: 3,
            qid: Qid::new(QidType::FILE, 2, u64::MAX),
            mode: 0o644,
            atime: 1_700_000_000,
            mtime: 1_700_000_001,
            length: 42,
            name: name.into(),
            uid: "alice".into(),
            gid: "staff".into(),
            muid: "bob".into(),
        }
    }

    #[test]
    fn round_trips_and_reports_size() {
        let stat = sample("greet");
        let buf = stat.encode().unwrap();
        assert_eq!(buf.len(), stat.encoded_size());
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]) as usize, buf.len() - 2);
        let mut offset = 0;
        assert_eq!(Stat::decode(&buf, &mut offset).unwrap(), stat);
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn round_trips_boundary_strings() {
        let mut stat = sample("");
        stat.uid = "u".repeat(1000);
        let buf = stat.encode().unwrap();
        let mut offset = 0;
        assert_eq!(Stat::decode(&buf, &mut offset).unwrap(), stat);
    }

    #[test]
    fn rejects_records_that_do_not_fit_a_size_prefix() {
        let mut stat = sample("x");
        stat.name = "n".repeat(u16::MAX as usize);
        assert!(stat.encode().is_err());
    }

    #[test]
    fn decodes_a_listing() {
        let mut buf = Vec::new();
        sample("a").encode_into(&mut buf).unwrap();
        sample("bb").encode_into(&mut buf).unwrap();
        let stats = decode_stats(&buf).unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].name, "bb");
        assert!(decode_stats(&buf[..buf.len() - 1]).is_err());
    }

    #[test]
    fn renamed_keeps_identity() {
        let parent = sample("root");
        let dotdot = parent.renamed("..");
        assert_eq!(dotdot.qid, parent.qid);
        assert_eq!(dotdot.encoded_size(), parent.encoded_size() - 2);
    }
}
