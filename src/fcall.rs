//! Typed message catalogue and its frame codec.

use crate::error::{Error, Result};
use crate::message::{
    Message, read_data, read_header, read_qid, read_str, read_u16, read_u32, read_u64, read_u8,
};
use crate::protocol::*;
use crate::stat::Stat;

/// One protocol message. Requests start with `T`, responses with `R`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fcall {
    TVersion { msize: u32, version: String },
    RVersion { msize: u32, version: String },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth { aqid: Qid },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach { qid: Qid },
    RError { ename: String },
    TFlush { oldtag: u16 },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk { wqids: Vec<Qid> },
    TOpen { fid: u32, mode: u8 },
    ROpen { qid: Qid, iounit: u32 },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate { qid: Qid, iounit: u32 },
    TRead { fid: u32, offset: u64, count: u32 },
    RRead { data: Vec<u8> },
    TWrite { fid: u32, offset: u64, data: Vec<u8> },
    RWrite { count: u32 },
    TClunk { fid: u32 },
    RClunk,
    TRemove { fid: u32 },
    RRemove,
    TStat { fid: u32 },
    RStat { stat: Stat },
    TWstat { fid: u32, stat: Stat },
    RWstat,
}

/// A decoded frame: correlation tag plus message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tag: u16,
    pub body: Fcall,
}

impl Fcall {
    pub fn msg_type(&self) -> u8 {
        match self {
            Fcall::TVersion { .. } => TVERSION,
            Fcall::RVersion { .. } => RVERSION,
            Fcall::TAuth { .. } => TAUTH,
            Fcall::RAuth { .. } => RAUTH,
            Fcall::TAttach { .. } => TATTACH,
            Fcall::RAttach { .. } => RATTACH,
            Fcall::RError { .. } => RERROR,
            Fcall::TFlush { .. } => TFLUSH,
            Fcall::RFlush => RFLUSH,
            Fcall::TWalk { .. } => TWALK,
            Fcall::RWalk { .. } => RWALK,
            Fcall::TOpen { .. } => TOPEN,
            Fcall::ROpen { .. } => ROPEN,
            Fcall::TCreate { .. } => TCREATE,
            Fcall::RCreate { .. } => RCREATE,
            Fcall::TRead { .. } => TREAD,
            Fcall::RRead { .. } => RREAD,
            Fcall::TWrite { .. } => TWRITE,
            Fcall::RWrite { .. } => RWRITE,
            Fcall::TClunk { .. } => TCLUNK,
            Fcall::RClunk => RCLUNK,
            Fcall::TRemove { .. } => TREMOVE,
            Fcall::RRemove => RREMOVE,
            Fcall::TStat { .. } => TSTAT,
            Fcall::RStat { .. } => RSTAT,
            Fcall::TWstat { .. } => TWSTAT,
            Fcall::RWstat => RWSTAT,
        }
    }

    pub fn is_request(&self) -> bool {
        self.msg_type() % 2 == 0
    }

    /// The descriptor a request operates on, if any.
    pub fn fid(&self) -> Option<u32> {
        match *self {
            Fcall::TWalk { fid, .. }
            | Fcall::TOpen { fid, .. }
            | Fcall::TCreate { fid, .. }
            | Fcall::TRead { fid, .. }
            | Fcall::TWrite { fid, .. }
            | Fcall::TClunk { fid }
            | Fcall::TRemove { fid }
            | Fcall::TStat { fid }
            | Fcall::TWstat { fid, .. } => Some(fid),
            _ => None,
        }
    }

    /// Short verb name used in logs and error text.
    pub fn verb(&self) -> &'static str {
        match self.msg_type() {
            TVERSION | RVERSION => "version",
            TAUTH | RAUTH => "auth",
            TATTACH | RATTACH => "attach",
            TERROR | RERROR => "error",
            TFLUSH | RFLUSH => "flush",
            TWALK | RWALK => "walk",
            TOPEN | ROPEN => "open",
            TCREATE | RCREATE => "create",
            TREAD | RREAD => "read",
            TWRITE | RWRITE => "write",
            TCLUNK | RCLUNK => "close",
            TREMOVE | RREMOVE => "remove",
            TSTAT | RSTAT => "stat",
            _ => "write-stat",
        }
    }

    pub fn error(err: &Error) -> Self {
        Fcall::RError {
            ename: err.to_string(),
        }
    }

    /// Encode into a complete frame carrying `tag`.
    pub fn encode(&self, tag: u16) -> Result<Vec<u8>> {
        let mut msg = Message::new(self.msg_type(), tag);
        match self {
            Fcall::TVersion { msize, version } | Fcall::RVersion { msize, version } => {
                msg.push_u32(*msize);
                msg.push_str(version)?;
            }
            Fcall::TAuth { afid, uname, aname } => {
                msg.push_u32(*afid);
                msg.push_str(uname)?;
                msg.push_str(aname)?;
            }
            Fcall::RAuth { aqid } => msg.push_qid(aqid),
            Fcall::TAttach {
                fid,
                afid,
                uname,
                aname,
            } => {
                msg.push_u32(*fid);
                msg.push_u32(*afid);
                msg.push_str(uname)?;
                msg.push_str(aname)?;
            }
            Fcall::RAttach { qid } => msg.push_qid(qid),
            Fcall::RError { ename } => msg.push_str(ename)?,
            Fcall::TFlush { oldtag } => msg.push_u16(*oldtag),
            Fcall::RFlush | Fcall::RClunk | Fcall::RRemove | Fcall::RWstat => {}
            Fcall::TWalk {
                fid,
                newfid,
                wnames,
            } => {
                msg.push_u32(*fid);
                msg.push_u32(*newfid);
                let count =
                    u16::try_from(wnames.len()).map_err(|_| Error::Malformed("walk too long"))?;
                msg.push_u16(count);
                for name in wnames {
                    msg.push_str(name)?;
                }
            }
            Fcall::RWalk { wqids } => {
                let count =
                    u16::try_from(wqids.len()).map_err(|_| Error::Malformed("walk too long"))?;
                msg.push_u16(count);
                for qid in wqids {
                    msg.push_qid(qid);
                }
            }
            Fcall::TOpen { fid, mode } => {
                msg.push_u32(*fid);
                msg.push_u8(*mode);
            }
            Fcall::ROpen { qid, iounit } | Fcall::RCreate { qid, iounit } => {
                msg.push_qid(qid);
                msg.push_u32(*iounit);
            }
            Fcall::TCreate {
                fid,
                name,
                perm,
                mode,
            } => {
                msg.push_u32(*fid);
                msg.push_str(name)?;
                msg.push_u32(*perm);
                msg.push_u8(*mode);
            }
            Fcall::TRead { fid, offset, count } => {
                msg.push_u32(*fid);
                msg.push_u64(*offset);
                msg.push_u32(*count);
            }
            Fcall::RRead { data } => msg.push_data(data)?,
            Fcall::TWrite { fid, offset, data } => {
                msg.push_u32(*fid);
                msg.push_u64(*offset);
                msg.push_data(data)?;
            }
            Fcall::RWrite { count } => msg.push_u32(*count),
            Fcall::TClunk { fid } | Fcall::TRemove { fid } | Fcall::TStat { fid } => {
                msg.push_u32(*fid)
            }
            Fcall::RStat { stat } => msg.push_bytes(&stat.encode()?),
            Fcall::TWstat { fid, stat } => {
                msg.push_u32(*fid);
                msg.push_bytes(&stat.encode()?);
            }
        }
        msg.finish()
    }

    /// Decode a complete frame, size prefix included.
    pub fn decode(frame: &[u8]) -> Result<Frame> {
        let (size, msg_type, tag) = read_header(frame)?;
        if size as usize != frame.len() {
            return Err(Error::Malformed("size prefix does not match frame"));
        }
        let buf = &frame[HEADER_SIZE..];
        let off = &mut 0usize;
        let body = match msg_type {
            TVERSION => Fcall::TVersion {
                msize: read_u32(buf, off)?,
                version: read_str(buf, off)?,
            },
            RVERSION => Fcall::RVersion {
                msize: read_u32(buf, off)?,
                version: read_str(buf, off)?,
            },
            TAUTH => Fcall::TAuth {
                afid: read_u32(buf, off)?,
                uname: read_str(buf, off)?,
                aname: read_str(buf, off)?,
            },
            RAUTH => Fcall::RAuth {
                aqid: read_qid(buf, off)?,
            },
            TATTACH => Fcall::TAttach {
                fid: read_u32(buf, off)?,
                afid: read_u32(buf, off)?,
                uname: read_str(buf, off)?,
                aname: read_str(buf, off)?,
            },
            RATTACH => Fcall::RAttach {
                qid: read_qid(buf, off)?,
            },
            RERROR => Fcall::RError {
                ename: read_str(buf, off)?,
            },
            TFLUSH => Fcall::TFlush {
                oldtag: read_u16(buf, off)?,
            },
            RFLUSH => Fcall::RFlush,
            TWALK => {
                let fid = read_u32(buf, off)?;
                let newfid = read_u32(buf, off)?;
                let count = read_u16(buf, off)?;
                let mut wnames = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    wnames.push(read_str(buf, off)?);
                }
                Fcall::TWalk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            RWALK => {
                let count = read_u16(buf, off)?;
                let mut wqids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    wqids.push(read_qid(buf, off)?);
                }
                Fcall::RWalk { wqids }
            }
            TOPEN => Fcall::TOpen {
                fid: read_u32(buf, off)?,
                mode: read_u8(buf, off)?,
            },
            ROPEN => Fcall::ROpen {
                qid: read_qid(buf, off)?,
                iounit: read_u32(buf, off)?,
            },
            TCREATE => Fcall::TCreate {
                fid: read_u32(buf, off)?,
                name: read_str(buf, off)?,
                perm: read_u32(buf, off)?,
                mode: read_u8(buf, off)?,
            },
            RCREATE => Fcall::RCreate {
                qid: read_qid(buf, off)?,
                iounit: read_u32(buf, off)?,
            },
            TREAD => Fcall::TRead {
                fid: read_u32(buf, off)?,
                offset: read_u64(buf, off)?,
                count: read_u32(buf, off)?,
            },
            RREAD => Fcall::RRead {
                data: read_data(buf, off)?,
            },
            TWRITE => Fcall::TWrite {
                fid: read_u32(buf, off)?,
                offset: read_u64(buf, off)?,
                data: read_data(buf, off)?,
            },
            RWRITE => Fcall::RWrite {
                count: read_u32(buf, off)?,
            },
            TCLUNK => Fcall::TClunk {
                fid: read_u32(buf, off)?,
            },
            RCLUNK => Fcall::RClunk,
            TREMOVE => Fcall::TRemove {
                fid: read_u32(buf, off)?,
            },
            RREMOVE => Fcall::RRemove,
            TSTAT => Fcall::TStat {
                fid: read_u32(buf, off)?,
            },
            RSTAT => Fcall::RStat {
                stat: Stat::decode(buf, off)?,
            },
            TWSTAT => Fcall::TWstat {
                fid: read_u32(buf, off)?,
                stat: Stat::decode(buf, off)?,
            },
            RWSTAT => Fcall::RWstat,
            other => return Err(Error::UnknownType(other)),
        };
        if *off != buf.len() {
            return Err(Error::Malformed("trailing bytes after message"));
        }
        Ok(Frame { tag, body })
    }
}

/// Check that `response` answers a request of type `request_type`.
///
/// Error responses are accepted for every request.
pub fn expect_response(request_type: u8, response: &Fcall) -> Result<()> {
    let got = response.msg_type();
    let expected = request_type.wrapping_add(1);
    if got == RERROR || got == expected {
        Ok(())
    } else {
        Err(Error::UnexpectedType { got, expected })
    }
}

/// Type and tag of a frame whose body may not decode.
pub fn peek_header(frame: &[u8]) -> Result<(u8, u16)> {
    let (_, msg_type, tag) = read_header(frame)?;
    Ok((msg_type, tag))
}

/// Number of response packets a read of `count` bytes may produce.
pub fn expected_packets(count: u32, iounit: u32) -> u32 {
    let iounit = iounit.max(1);
    count.div_ceil(iounit).max(1)
}

/// Split a read reply into the packets that carry it.
///
/// A transfer that ends short of `count` on an IO unit boundary gets an
/// empty terminating packet, so the reader always sees a short packet or the
/// full expected count.
pub fn read_chunks(data: &[u8], count: u32, iounit: u32) -> Vec<&[u8]> {
    let iounit = iounit.max(1) as usize;
    let mut chunks: Vec<&[u8]> = data.chunks(iounit).collect();
    if data.len() < count as usize && data.len() % iounit == 0 {
        chunks.push(&[]);
    }
    if chunks.is_empty() {
        chunks.push(&[]);
    }
    chunks
}

/// Whether a bulk transfer is finished after `received` packets, the last of
/// which carried `last_len` bytes.
pub fn transfer_complete(received: u32, expected: u32, last_len: usize, iounit: u32) -> bool {
    received >= expected || last_len < iounit as usize
}

/// Split a write into IO-unit sized frames at advancing offsets.
pub fn write_chunks(fid: u32, offset: u64, data: &[u8], iounit: u32) -> Vec<Fcall> {
    if data.is_empty() {
        return vec![Fcall::TWrite {
            fid,
            offset,
            data: Vec::new(),
        }];
    }
    data.chunks(iounit.max(1) as usize)
        .scan(offset, |next, chunk| {
            let at = *next;
            *next += chunk.len() as u64;
            Some(Fcall::TWrite {
                fid,
                offset: at,
                data: chunk.to_vec(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat() -> Stat {
        Stat {
            type_: 1,
            dev: 2,
            qid: Qid::new(QidType::DIR, 3, u64::MAX),
            mode: DMDIR | 0o755,
            atime: 10,
            mtime: 11,
            length: 12,
            name: "svc".into(),
            uid: "alice".into(),
            gid: "alice".into(),
            muid: "".into(),
        }
    }

    #[test]
    fn every_message_round_trips() {
        let qid = Qid::new(QidType::FILE, 9, u64::MAX);
        let messages = vec![
            Fcall::TVersion {
                msize: 65535,
                version: "P1".into(),
            },
            Fcall::RVersion {
                msize: 8216,
                version: "P1".into(),
            },
            Fcall::TAuth {
                afid: 3,
                uname: "alice".into(),
                aname: "".into(),
            },
            Fcall::RAuth {
                aqid: Qid::new(QidType::AUTH, 0, 1),
            },
            Fcall::TAttach {
                fid: 1,
                afid: NO_FID,
                uname: "alice".into(),
                aname: "".into(),
            },
            Fcall::RAttach {
                qid: Qid::new(QidType::DIR, 0, 1),
            },
            Fcall::RError {
                ename: "file not found: x".into(),
            },
            Fcall::TFlush { oldtag: 12 },
            Fcall::RFlush,
            Fcall::TWalk {
                fid: 1,
                newfid: 2,
                wnames: vec!["a".into(), "".into(), "ü".into()],
            },
            Fcall::RWalk {
                wqids: vec![qid, qid],
            },
            Fcall::TOpen {
                fid: 2,
                mode: OWRITE | OTRUNC,
            },
            Fcall::ROpen { qid, iounit: 8192 },
            Fcall::TCreate {
                fid: 2,
                name: "new".into(),
                perm: DMDIR | 0o700,
                mode: OREAD,
            },
            Fcall::RCreate { qid, iounit: 8192 },
            Fcall::TRead {
                fid: 2,
                offset: u64::MAX,
                count: u32::MAX,
            },
            Fcall::RRead {
                data: vec![0, 1, 2, 255],
            },
            Fcall::TWrite {
                fid: 2,
                offset: 7,
                data: b"payload".to_vec(),
            },
            Fcall::RWrite { count: 7 },
            Fcall::TClunk { fid: 2 },
            Fcall::RClunk,
            Fcall::TRemove { fid: 2 },
            Fcall::RRemove,
            Fcall::TStat { fid: 2 },
            Fcall::RStat { stat: stat() },
            Fcall::TWstat {
                fid: 2,
                stat: Stat::dont_touch(),
            },
            Fcall::RWstat,
        ];
        for (tag, body) in messages.into_iter().enumerate() {
            let tag = tag as u16;
            let frame = body.encode(tag).unwrap();
            let decoded = Fcall::decode(&frame).unwrap();
            assert_eq!(decoded, Frame { tag, body });
        }
    }

    #[test]
    fn rejects_unknown_types_and_trailing_bytes() {
        let mut frame = Fcall::RClunk.encode(1).unwrap();
        frame[4] = 99;
        assert!(matches!(Fcall::decode(&frame), Err(Error::UnknownType(99))));

        let mut frame = Fcall::TClunk { fid: 1 }.encode(1).unwrap();
        frame.push(0);
        let len = frame.len() as u32;
        frame[0..4].copy_from_slice(&len.to_le_bytes());
        assert!(Fcall::decode(&frame).is_err());

        let frame = Fcall::TStat { fid: 1 }.encode(4).unwrap();
        assert!(matches!(
            Fcall::decode(&frame[..frame.len() - 1]),
            Err(Error::Malformed(_))
        ));
        assert_eq!(peek_header(&frame).unwrap(), (TSTAT, 4));
    }

    #[test]
    fn response_type_must_pair_with_request() {
        let opened = Fcall::ROpen {
            qid: Qid::new(QidType::FILE, 0, 1),
            iounit: 1,
        };
        assert!(expect_response(TOPEN, &opened).is_ok());
        assert!(expect_response(TOPEN, &Fcall::RError { ename: "x".into() }).is_ok());
        assert!(matches!(
            expect_response(TOPEN, &Fcall::RClunk),
            Err(Error::UnexpectedType {
                got: RCLUNK,
                expected: ROPEN,
            })
        ));
    }

    #[test]
    fn read_packet_count_matches_expectation() {
        assert_eq!(expected_packets(200_000, 8192), 25);
        assert_eq!(expected_packets(0, 8192), 1);
        assert_eq!(expected_packets(8192, 8192), 1);

        let data = vec![7u8; 200_000];
        let chunks = read_chunks(&data, 200_000, 8192);
        assert_eq!(chunks.len(), 25);
        assert_eq!(chunks[24].len(), 200_000 - 24 * 8192);

        // short of the request on a boundary: empty terminator
        let data = vec![1u8; 8192];
        let chunks = read_chunks(&data, 20_000, 8192);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].is_empty());
        assert!(transfer_complete(2, 3, 0, 8192));
        assert!(!transfer_complete(1, 3, 8192, 8192));

        assert_eq!(read_chunks(&[], 0, 8192), vec![&[] as &[u8]]);
    }

    #[test]
    fn writes_split_into_k_plus_one_frames() {
        let max = 1000u32;
        let payload: Vec<u8> = (0..(3 * max + 17)).map(|i| (i % 251) as u8).collect();
        let frames = write_chunks(5, 100, &payload, max);
        assert_eq!(frames.len(), 4);
        let mut rebuilt = Vec::new();
        let mut expect_offset = 100;
        for frame in &frames {
            match frame {
                Fcall::TWrite { fid, offset, data } => {
                    assert_eq!(*fid, 5);
                    assert_eq!(*offset, expect_offset);
                    expect_offset += data.len() as u64;
                    rebuilt.extend_from_slice(data);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(rebuilt, payload);
    }
}
