//! Protocol constants and the resource identity type.

use bitflags::bitflags;

/// Special values used by the protocol.
pub const NO_FID: u32 = 0xFFFF_FFFF;
pub const NO_TAG: u16 = 0xFFFF;

pub const TVERSION: u8 = 100;
pub const RVERSION: u8 = 101;
pub const TAUTH: u8 = 102;
pub const RAUTH: u8 = 103;
pub const TATTACH: u8 = 104;
pub const RATTACH: u8 = 105;
pub const TERROR: u8 = 106;
pub const RERROR: u8 = 107;
pub const TFLUSH: u8 = 108;
pub const RFLUSH: u8 = 109;
pub const TWALK: u8 = 110;
pub const RWALK: u8 = 111;
pub const TOPEN: u8 = 112;
pub const ROPEN: u8 = 113;
pub const TCREATE: u8 = 114;
pub const RCREATE: u8 = 115;
pub const TREAD: u8 = 116;
pub const RREAD: u8 = 117;
pub const TWRITE: u8 = 118;
pub const RWRITE: u8 = 119;
pub const TCLUNK: u8 = 120;
pub const RCLUNK: u8 = 121;
pub const TREMOVE: u8 = 122;
pub const RREMOVE: u8 = 123;
pub const TSTAT: u8 = 124;
pub const RSTAT: u8 = 125;
pub const TWSTAT: u8 = 126;
pub const RWSTAT: u8 = 127;

pub const OREAD: u8 = 0;
pub const OWRITE: u8 = 1;
pub const ORDWR: u8 = 2;
pub const OEXEC: u8 = 3;
pub const OTRUNC: u8 = 0x10;

pub const DMDIR: u32 = 0x8000_0000;
pub const DMAPPEND: u32 = 0x4000_0000;
pub const DMEXCL: u32 = 0x2000_0000;
pub const DMMOUNT: u32 = 0x1000_0000;
pub const DMAUTH: u32 = 0x0800_0000;
pub const DMTMP: u32 = 0x0400_0000;

/// size[4] type[1] tag[2]
pub const HEADER_SIZE: usize = 7;

/// Room reserved from `msize` for the largest read/write header.
pub const IOHDRSZ: u32 = 24;

/// Smallest frame size a peer may negotiate.
pub const MIN_MSIZE: u32 = 256;

pub const DEFAULT_MSIZE: u32 = 8192 + IOHDRSZ;

pub const DEFAULT_VERSION: &str = "P1";

/// Version string answered when the peer's version is not understood.
pub const VERSION_UNKNOWN: &str = "unknown";

/// Encoded size of a [`Qid`]: type[1] version[4] path[8].
pub const QID_SIZE: usize = 13;

bitflags! {
    /// Resource kind flags carried in the first byte of a [`Qid`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QidType: u8 {
        const DIR = 0x80;
        const APPEND = 0x40;
        const EXCL = 0x20;
        const MOUNT = 0x10;
        const AUTH = 0x08;
        const TMP = 0x04;
        const FILE = 0x00;
    }
}

impl QidType {
    /// Mode bits matching these type flags.
    pub fn mode_bits(self) -> u32 {
        (self.bits() as u32) << 24
    }

    /// Type flags implied by the high mode bits of a stat record.
    pub fn from_mode(mode: u32) -> Self {
        Self::from_bits_truncate((mode >> 24) as u8)
    }
}

/// Qid identifies a resource within a server for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Qid {
    pub type_: QidType,
    pub version: u32,
    pub path: u64,
}

impl Qid {
    pub fn new(type_: QidType, version: u32, path: u64) -> Self {
        Self {
            type_,
            version,
            path,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.type_.contains(QidType::DIR)
    }

    pub fn is_mount(&self) -> bool {
        self.type_.contains(QidType::MOUNT)
    }
}
