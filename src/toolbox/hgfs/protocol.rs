//! HGFS packet layouts. All multi-byte fields are packed little-endian.

use std::io;

use thiserror::Error;
use zerocopy::byteorder::{I32, LE, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::Error;
use crate::toolbox::{ProtocolError, read_prefix, take};

pub const HEADER_VERSION: u8 = 1;
pub const PACKET_FLAG_REQUEST: u32 = 1;
pub const PACKET_FLAG_REPLY: u32 = 2;

/// Marks a packet as using the new-style header.
pub const OP_NEW_HEADER: i32 = 0xff;

/// `HGFS_LARGE_PACKET_MAX`
pub const LARGE_PACKET_MAX: u32 = 0xf800;

pub mod op {
    pub const OPEN: i32 = 0;
    pub const CLOSE: i32 = 3;
    pub const GETATTR_V2: i32 = 15;
    pub const SETATTR_V2: i32 = 16;
    pub const OPEN_V3: i32 = 24;
    pub const READ_V3: i32 = 25;
    pub const WRITE_V3: i32 = 26;
    pub const CREATE_SESSION_V4: i32 = 38;
    pub const DESTROY_SESSION_V4: i32 = 39;
}

pub const OPEN_MODE_READ_ONLY: i32 = 0;
pub const OPEN_MODE_WRITE_ONLY: i32 = 1;
pub const OPEN_MODE_READ_WRITE: i32 = 2;

pub const OPEN_CREATE_EMPTY: i32 = 4;

pub const LOCK_NONE: i32 = 0;

pub const FILE_TYPE_REGULAR: i32 = 0;
pub const FILE_TYPE_DIRECTORY: i32 = 1;
pub const FILE_TYPE_SYMLINK: i32 = 2;

pub const ATTR_VALID_TYPE: u64 = 1 << 0;
pub const ATTR_VALID_SIZE: u64 = 1 << 1;
pub const ATTR_VALID_OWNER_PERMS: u64 = 1 << 7;
pub const ATTR_VALID_GROUP_PERMS: u64 = 1 << 8;
pub const ATTR_VALID_OTHER_PERMS: u64 = 1 << 9;
pub const ATTR_VALID_USER_ID: u64 = 1 << 12;
pub const ATTR_VALID_GROUP_ID: u64 = 1 << 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Success = 0,
    NoSuchFileOrDir = 1,
    InvalidHandle = 2,
    OperationNotPermitted = 3,
    FileExists = 4,
    AccessDenied = 8,
    GenericError = 10,
    OperationNotSupported = 13,
    StaleSession = 17,
    TooManySessions = 18,
}

impl StatusCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        use StatusCode::*;
        [
            Success,
            NoSuchFileOrDir,
            InvalidHandle,
            OperationNotPermitted,
            FileExists,
            AccessDenied,
            GenericError,
            OperationNotSupported,
            StaleSession,
            TooManySessions,
        ]
        .into_iter()
        .find(|s| *s as u32 == code)
    }
}

/// A failed HGFS operation; the code goes into the reply header.
#[derive(Debug, Error)]
#[error("hgfs {code:?}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<io::Error> for Status {
    fn from(err: io::Error) -> Self {
        let code = match err.kind() {
            io::ErrorKind::NotFound => StatusCode::NoSuchFileOrDir,
            io::ErrorKind::AlreadyExists => StatusCode::FileExists,
            io::ErrorKind::PermissionDenied => StatusCode::OperationNotPermitted,
            _ => StatusCode::GenericError,
        };
        Status::new(code, err.to_string())
    }
}

impl From<ProtocolError> for Status {
    fn from(err: ProtocolError) -> Self {
        Status::new(StatusCode::GenericError, err.to_string())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let message = status.message;
        match status.code {
            StatusCode::NoSuchFileOrDir | StatusCode::StaleSession => Error::NotFound(message),
            StatusCode::FileExists => Error::AlreadyExists(message),
            StatusCode::OperationNotPermitted | StatusCode::AccessDenied => Error::PermissionDenied(message),
            StatusCode::OperationNotSupported => Error::Unsupported(message),
            StatusCode::TooManySessions => Error::ResourceExhausted(message),
            StatusCode::InvalidHandle => Error::InvalidArgument(message),
            StatusCode::Success | StatusCode::GenericError => Error::Io {
                context: "hgfs".into(),
                source: io::Error::other(message),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Header {
    pub version: u8,
    pub reserved1: [u8; 3],
    pub dummy: I32<LE>,
    pub packet_size: U32<LE>,
    pub header_size: U32<LE>,
    pub request_id: U32<LE>,
    pub op: I32<LE>,
    pub status: U32<LE>,
    pub flags: U32<LE>,
    pub information: U32<LE>,
    pub session_id: U64<LE>,
    pub reserved: U64<LE>,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn request(op: i32, session_id: u64, payload: Vec<u8>) -> Self {
        let header = Header {
            version: HEADER_VERSION,
            dummy: I32::new(OP_NEW_HEADER),
            op: I32::new(op),
            flags: U32::new(PACKET_FLAG_REQUEST),
            session_id: U64::new(session_id),
            ..Default::default()
        };
        Self { header, payload }
    }

    pub fn op(&self) -> i32 {
        self.header.op.get()
    }

    pub fn session_id(&self) -> u64 {
        self.header.session_id.get()
    }

    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.header.status.get())
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (header, _) = read_prefix::<Header>(data)?;
        let start = header.header_size.get() as usize;
        let end = header.packet_size.get() as usize;
        if start < HEADER_SIZE || end < start || end > data.len() {
            return Err(ProtocolError::InvalidHeader);
        }
        Ok(Self {
            header,
            payload: data[start..end].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = self.header;
        header.header_size = U32::new(HEADER_SIZE as u32);
        header.packet_size = U32::new((HEADER_SIZE + self.payload.len()) as u32);
        [header.as_bytes(), &self.payload[..]].concat()
    }

    /// Reply to this request carrying `result`.
    pub fn reply(&self, result: Result<Vec<u8>, Status>) -> Self {
        let mut header = self.header;
        header.flags = U32::new(PACKET_FLAG_REPLY);
        let payload = match result {
            Ok(payload) => {
                header.status = U32::new(StatusCode::Success as u32);
                payload
            }
            Err(status) => {
                header.status = U32::new(status.code as u32);
                Vec::new()
            }
        };
        Self { header, payload }
    }
}

// ---------------------------------------------------------------------------
// File names
// ---------------------------------------------------------------------------

/// A path as HGFS carries it: components separated by NUL.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileName {
    pub name: Vec<u8>,
}

impl FileName {
    pub fn from_path(path: &str) -> Self {
        let name = path
            .split('/')
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join("\0");
        Self {
            name: name.into_bytes(),
        }
    }

    pub fn components(&self) -> impl Iterator<Item = String> + '_ {
        self.name
            .split(|b| *b == 0)
            .filter(|c| !c.is_empty())
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    /// Absolute path form.
    pub fn path(&self) -> String {
        format!("/{}", self.components().collect::<Vec<_>>().join("/"))
    }

    /// `{length u32}` then the name and a NUL.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = U32::<LE>::new(self.name.len() as u32).as_bytes().to_vec();
        buf.extend_from_slice(&self.name);
        buf.push(0);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let (len, rest) = read_prefix::<U32<LE>>(data)?;
        let (name, rest) = take(rest, len.get() as usize)?;
        Ok((Self { name: name.to_vec() }, rest))
    }
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct FileNameV3Header {
    length: U32<LE>,
    flags: U32<LE>,
    case_type: I32<LE>,
    id: U32<LE>,
}

/// V3 file name: adds flags, case type and a handle id before the name.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileNameV3 {
    pub flags: u32,
    pub case_type: i32,
    pub id: u32,
    pub name: FileName,
}

impl FileNameV3 {
    pub fn from_path(path: &str) -> Self {
        Self {
            name: FileName::from_path(path),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let header = FileNameV3Header {
            length: U32::new(self.name.name.len() as u32),
            flags: U32::new(self.flags),
            case_type: I32::new(self.case_type),
            id: U32::new(self.id),
        };
        let mut buf = header.as_bytes().to_vec();
        buf.extend_from_slice(&self.name.name);
        buf.push(0);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let (header, rest) = read_prefix::<FileNameV3Header>(data)?;
        let (name, rest) = take(rest, header.length.get() as usize)?;
        Ok((
            Self {
                flags: header.flags.get(),
                case_type: header.case_type.get(),
                id: header.id.get(),
                name: FileName { name: name.to_vec() },
            },
            rest,
        ))
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct AttrV2 {
    pub mask: U64<LE>,
    pub file_type: I32<LE>,
    pub size: U64<LE>,
    pub creation_time: U64<LE>,
    pub access_time: U64<LE>,
    pub write_time: U64<LE>,
    pub attr_change_time: U64<LE>,
    pub special_perms: u8,
    pub owner_perms: u8,
    pub group_perms: u8,
    pub other_perms: u8,
    pub attr_flags: U64<LE>,
    pub allocation_size: U64<LE>,
    pub user_id: U32<LE>,
    pub group_id: U32<LE>,
    pub host_file_id: U64<LE>,
    pub volume_id: U32<LE>,
    pub effective_perms: u8,
    pub reserved2: U64<LE>,
}

impl AttrV2 {
    pub fn has(&self, bit: u64) -> bool {
        self.mask.get() & bit == bit
    }
}

// ---------------------------------------------------------------------------
// Requests and replies
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct Capability {
    pub op: I32<LE>,
    pub flags: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestCreateSessionV4 {
    pub num_capabilities: U32<LE>,
    pub max_packet_size: U32<LE>,
    pub flags: U32<LE>,
    pub reserved: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyCreateSessionV4 {
    pub session_id: U64<LE>,
    pub num_capabilities: U32<LE>,
    pub max_packet_size: U32<LE>,
    pub identity_offset: U32<LE>,
    pub flags: U32<LE>,
    pub reserved: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyDestroySessionV4 {
    pub reserved: U64<LE>,
}

/// Followed by a `FileName`.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestGetattrV2 {
    pub hints: U64<LE>,
    pub handle: U32<LE>,
}

/// Followed by a `FileName`.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestSetattrV2 {
    pub hints: U64<LE>,
    pub attr: AttrV2,
    pub handle: U32<LE>,
}

/// Followed by a `FileName`.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestOpen {
    pub open_mode: I32<LE>,
    pub open_flags: I32<LE>,
    pub permissions: u8,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyOpen {
    pub handle: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestClose {
    pub handle: U32<LE>,
}

/// Followed by a `FileNameV3`.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestOpenV3 {
    pub mask: U64<LE>,
    pub open_mode: I32<LE>,
    pub open_flags: I32<LE>,
    pub special_perms: u8,
    pub owner_perms: u8,
    pub group_perms: u8,
    pub other_perms: u8,
    pub attr_flags: U64<LE>,
    pub allocation_size: U64<LE>,
    pub desired_access: U32<LE>,
    pub share_access: U32<LE>,
    pub desired_lock: I32<LE>,
    pub reserved1: U64<LE>,
    pub reserved2: U64<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyOpenV3 {
    pub handle: U32<LE>,
    pub acquired_lock: I32<LE>,
    pub flags: I32<LE>,
    pub reserved: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestReadV3 {
    pub handle: U32<LE>,
    pub read_flags: U32<LE>,
    pub offset: U64<LE>,
    pub required_size: U32<LE>,
    pub reserved: U64<LE>,
}

/// Followed by `actual_size` bytes of data.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyReadV3 {
    pub actual_size: U32<LE>,
    pub reserved: U64<LE>,
}

/// Followed by `required_size` bytes of data.
#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct RequestWriteV3 {
    pub handle: U32<LE>,
    pub write_flags: u8,
    pub offset: U64<LE>,
    pub required_size: U32<LE>,
    pub reserved: U64<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct ReplyWriteV3 {
    pub actual_size: U32<LE>,
    pub reserved: U64<LE>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_packed() {
        assert_eq!(HEADER_SIZE, 52);
    }

    #[test]
    fn file_names_are_nul_separated() {
        let name = FileName::from_path("/etc//hosts");
        assert_eq!(name.name, b"etc\0hosts");
        assert_eq!(name.path(), "/etc/hosts");

        let data = name.encode();
        assert_eq!(&data[..4], &9u32.to_le_bytes());
        let (decoded, rest) = FileName::decode(&data).unwrap();
        assert_eq!(decoded, name);
        assert_eq!(rest, b"\0");

        assert_eq!(FileName::default().path(), "/");
    }

    #[test]
    fn packet_payload_is_bounded_by_packet_size() {
        let packet = Packet::request(op::CLOSE, 7, vec![1, 2, 3, 4]);
        let mut data = packet.encode();
        data.extend_from_slice(b"trailing");

        let decoded = Packet::decode(&data).unwrap();
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.session_id(), 7);

        assert!(matches!(
            Packet::decode(&data[..HEADER_SIZE + 2]),
            Err(ProtocolError::InvalidHeader)
        ));
    }

    #[test]
    fn errors_reply_with_status_and_no_payload() {
        let packet = Packet::request(op::OPEN, 1, vec![]);
        let reply = packet.reply(Err(Status::new(StatusCode::AccessDenied, "nope")));
        assert_eq!(reply.header.flags.get(), PACKET_FLAG_REPLY);
        assert_eq!(reply.status(), Some(StatusCode::AccessDenied));
        assert!(reply.payload.is_empty());
    }
}
