//! VIX guest-operations wire format.
//!
//! Every relayed command starts with a packed little-endian request header:
//!
//! ```text
//! magic u32 | version u16 | total u32 | header u32 | body u32 | cred u32 | common u8
//! opcode u32 | flags u32 | timeout u32 | cookie u64 | client u32 | cred type u32
//! ```
//!
//! followed by `body` bytes of op-specific payload and `cred` bytes of
//! credential. Replies are ASCII: `<rc> <errno> [#]<body>`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use zerocopy::byteorder::{I32, I64, LE, U16, U32, U64};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::Error;
use crate::toolbox::{ProtocolError, read_prefix, take};

pub const COMMAND_MAGIC_WORD: u32 = 0xd00d_0001;

/// `COMMON_FLAGS`: the client expects a binary reply body.
pub const COMMAND_GUEST_RETURNS_BINARY: u8 = 0x80;

pub const USER_CREDENTIAL_NAME_PASSWORD: u32 = 1;

pub mod opcode {
    pub const HGFS_SEND_PACKET: u32 = 84;
    pub const GET_TOOLS_STATE: u32 = 62;
    pub const START_PROGRAM: u32 = 185;
    pub const LIST_PROCESSES_EX: u32 = 186;
    pub const INITIATE_FILE_TRANSFER_FROM_GUEST: u32 = 188;
    pub const INITIATE_FILE_TRANSFER_TO_GUEST: u32 = 189;
    pub const TERMINATE_PROCESS: u32 = 193;
}

/// `VIX_E_*` result codes.
pub mod rc {
    pub const OK: u32 = 0;
    pub const FAIL: u32 = 1;
    pub const INVALID_ARG: u32 = 3;
    pub const FILE_NOT_FOUND: u32 = 4;
    pub const NOT_SUPPORTED: u32 = 6;
    pub const FILE_ALREADY_EXISTS: u32 = 12;
    pub const FILE_ACCESS_ERROR: u32 = 13;
    pub const AUTHENTICATION_FAIL: u32 = 35;
    pub const UNRECOGNIZED_COMMAND_IN_GUEST: u32 = 3025;
    pub const INVALID_MESSAGE_HEADER: u32 = 10000;
    pub const INVALID_MESSAGE_BODY: u32 = 10001;
    pub const NOT_A_FILE: u32 = 20001;
    pub const NO_SUCH_PROCESS: u32 = 20003;
}

/// A failed command: the VIX result code, the guest errno and a message
/// that becomes the reply body.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct VixError {
    pub code: u32,
    pub errno: i32,
    pub message: String,
}

impl VixError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            errno: 0,
            message: message.into(),
        }
    }
}

impl From<Error> for VixError {
    fn from(err: Error) -> Self {
        let errno = match &err {
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(0),
            _ => 0,
        };
        Self {
            code: err.vix_error(),
            errno,
            message: err.to_string(),
        }
    }
}

impl From<ProtocolError> for VixError {
    fn from(err: ProtocolError) -> Self {
        VixError::new(rc::INVALID_MESSAGE_BODY, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct CommandRequestHeader {
    pub magic: U32<LE>,
    pub message_version: U16<LE>,
    pub total_message_length: U32<LE>,
    pub header_length: U32<LE>,
    pub body_length: U32<LE>,
    pub credential_length: U32<LE>,
    pub common_flags: u8,
    pub op_code: U32<LE>,
    pub request_flags: U32<LE>,
    pub timeout: U32<LE>,
    pub cookie: U64<LE>,
    pub client_handle_id: U32<LE>,
    pub user_credential_type: U32<LE>,
}

impl CommandRequestHeader {
    /// Header for a request to `op` carrying `body` and `credential`.
    pub fn new(op: u32, body: &[u8], credential: &[u8]) -> Self {
        let header_length = std::mem::size_of::<Self>() as u32;
        let body_length = body.len() as u32;
        let credential_length = credential.len() as u32;
        Self {
            magic: U32::new(COMMAND_MAGIC_WORD),
            message_version: U16::new(5),
            total_message_length: U32::new(header_length + body_length + credential_length),
            header_length: U32::new(header_length),
            body_length: U32::new(body_length),
            credential_length: U32::new(credential_length),
            op_code: U32::new(op),
            user_credential_type: U32::new(USER_CREDENTIAL_NAME_PASSWORD),
            ..Default::default()
        }
    }

    pub fn returns_binary(&self) -> bool {
        self.common_flags & COMMAND_GUEST_RETURNS_BINARY != 0
    }
}

/// Frame a full request: header, body, credential.
pub fn encode_request(header: &CommandRequestHeader, body: &[u8], credential: &[u8]) -> Vec<u8> {
    [header.as_bytes(), body, credential].concat()
}

/// Reply line for a command result.
pub fn command_result(header: &CommandRequestHeader, result: Result<Vec<u8>, VixError>) -> Vec<u8> {
    let (code, errno, body) = match result {
        Ok(body) => (rc::OK, 0, body),
        Err(err) => (err.code, err.errno, err.message.into_bytes()),
    };
    let mut reply = format!("{code} {errno} ").into_bytes();
    if header.returns_binary() {
        reply.push(b'#');
    }
    reply.extend_from_slice(&body);
    if !header.returns_binary() {
        reply.push(0);
    }
    reply
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct NamePasswordHeader {
    name_length: U32<LE>,
    password_length: U32<LE>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamePassword {
    pub name: String,
    pub password: String,
}

impl NamePassword {
    /// `{name len, password len}` then base64 of `name\0password\0`, NUL
    /// terminated.
    pub fn encode(&self) -> Vec<u8> {
        let header = NamePasswordHeader {
            name_length: U32::new(self.name.len() as u32),
            password_length: U32::new(self.password.len() as u32),
        };
        let secret = format!("{}\0{}\0", self.name, self.password);
        let mut buf = header.as_bytes().to_vec();
        buf.extend_from_slice(STANDARD.encode(secret).as_bytes());
        buf.push(0);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let (header, rest) = read_prefix::<NamePasswordHeader>(&data[..end])?;

        let decoded = STANDARD
            .decode(rest)
            .map_err(|e| ProtocolError::InvalidBody(format!("credential: {e}")))?;
        let text = String::from_utf8(decoded)
            .map_err(|e| ProtocolError::InvalidBody(format!("credential: {e}")))?;

        let name_len = header.name_length.get() as usize;
        if text.len() < name_len + 2 || !text.is_char_boundary(name_len) {
            return Err(ProtocolError::InvalidBody("credential lengths".into()));
        }
        Ok(Self {
            name: text[..name_len].to_owned(),
            password: text[name_len + 1..text.len() - 1].to_owned(),
        })
    }
}

// ---------------------------------------------------------------------------
// StartProgram
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct StartProgramHeader {
    start_minimized: u8,
    program_path_length: U32<LE>,
    arguments_length: U32<LE>,
    working_dir_length: U32<LE>,
    num_env_vars: U32<LE>,
    env_var_length: U32<LE>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StartProgramRequest {
    pub program_path: String,
    pub arguments: String,
    pub working_dir: String,
    pub env_vars: Vec<String>,
}

fn nul_string(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl StartProgramRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut header = StartProgramHeader::default();
        let mut fields = Vec::new();

        let mut add = |value: &str, len: &mut U32<LE>| {
            if !value.is_empty() {
                *len = U32::new(value.len() as u32 + 1);
                fields.extend_from_slice(value.as_bytes());
                fields.push(0);
            }
        };
        add(&self.program_path, &mut header.program_path_length);
        add(&self.arguments, &mut header.arguments_length);
        add(&self.working_dir, &mut header.working_dir_length);

        let mut env = Vec::new();
        for var in &self.env_vars {
            env.extend_from_slice(var.as_bytes());
            env.push(0);
        }
        header.num_env_vars = U32::new(self.env_vars.len() as u32);
        header.env_var_length = U32::new(env.len() as u32);

        [header.as_bytes(), &fields[..], &env[..]].concat()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (header, mut rest) = read_prefix::<StartProgramHeader>(data)?;
        let mut request = Self::default();

        for (len, value) in [
            (header.program_path_length.get(), &mut request.program_path),
            (header.arguments_length.get(), &mut request.arguments),
            (header.working_dir_length.get(), &mut request.working_dir),
        ] {
            let (field, tail) = take(rest, len as usize)?;
            *value = nul_string(field);
            rest = tail;
        }

        for _ in 0..header.num_env_vars.get() {
            let end = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| ProtocolError::InvalidBody("unterminated env var".into()))?;
            request
                .env_vars
                .push(String::from_utf8_lossy(&rest[..end]).into_owned());
            rest = &rest[end + 1..];
        }
        Ok(request)
    }
}

// ---------------------------------------------------------------------------
// Process listing and termination
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct ListProcessesHeader {
    key: U32<LE>,
    offset: U32<LE>,
    num_pids: U32<LE>,
}

/// `ListProcessesEx` body: an optional pid filter.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListProcessesRequest {
    pub pids: Vec<i64>,
}

impl ListProcessesRequest {
    pub fn encode(&self) -> Vec<u8> {
        let header = ListProcessesHeader {
            num_pids: U32::new(self.pids.len() as u32),
            ..Default::default()
        };
        let mut buf = header.as_bytes().to_vec();
        for pid in &self.pids {
            buf.extend_from_slice(I64::<LE>::new(*pid).as_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (header, mut rest) = read_prefix::<ListProcessesHeader>(data)?;
        let mut pids = Vec::with_capacity(header.num_pids.get().min(1024) as usize);
        for _ in 0..header.num_pids.get() {
            let (pid, tail) = read_prefix::<I64<LE>>(rest)?;
            pids.push(pid.get());
            rest = tail;
        }
        Ok(Self { pids })
    }
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
pub struct KillProcessRequest {
    pub pid: I64<LE>,
    pub options: U32<LE>,
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct FromGuestHeader {
    options: I32<LE>,
    guest_path_name_length: U32<LE>,
}

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct ToGuestHeader {
    options: I32<LE>,
    guest_path_name_length: U32<LE>,
    overwrite: u8,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileTransferRequest {
    pub guest_path: String,
    /// Only meaningful for transfers to the guest.
    pub overwrite: bool,
}

fn path_body(path: &str) -> Vec<u8> {
    let mut buf = path.as_bytes().to_vec();
    buf.push(0);
    buf
}

impl FileTransferRequest {
    pub fn encode_from_guest(&self) -> Vec<u8> {
        let header = FromGuestHeader {
            guest_path_name_length: U32::new(self.guest_path.len() as u32),
            ..Default::default()
        };
        [header.as_bytes(), path_body(&self.guest_path).as_slice()].concat()
    }

    pub fn encode_to_guest(&self) -> Vec<u8> {
        let header = ToGuestHeader {
            guest_path_name_length: U32::new(self.guest_path.len() as u32),
            overwrite: self.overwrite as u8,
            ..Default::default()
        };
        [header.as_bytes(), path_body(&self.guest_path).as_slice()].concat()
    }

    pub fn decode_from_guest(data: &[u8]) -> Result<Self, ProtocolError> {
        let (header, rest) = read_prefix::<FromGuestHeader>(data)?;
        let (name, _) = take(rest, header.guest_path_name_length.get() as usize)?;
        Ok(Self {
            guest_path: String::from_utf8_lossy(name).into_owned(),
            overwrite: false,
        })
    }

    pub fn decode_to_guest(data: &[u8]) -> Result<Self, ProtocolError> {
        let (header, rest) = read_prefix::<ToGuestHeader>(data)?;
        let (name, _) = take(rest, header.guest_path_name_length.get() as usize)?;
        Ok(Self {
            guest_path: String::from_utf8_lossy(name).into_owned(),
            overwrite: header.overwrite != 0,
        })
    }
}

// ---------------------------------------------------------------------------
// HGFS relay
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct HgfsPacketHeader {
    packet_size: U32<LE>,
    timeout: I32<LE>,
}

pub fn encode_hgfs_packet(packet: &[u8]) -> Vec<u8> {
    let header = HgfsPacketHeader {
        packet_size: U32::new(packet.len() as u32),
        ..Default::default()
    };
    [header.as_bytes(), packet].concat()
}

/// The HGFS packet enclosed in a `HgfsSendPacket` body.
pub fn decode_hgfs_packet(data: &[u8]) -> Result<&[u8], ProtocolError> {
    let (header, rest) = read_prefix::<HgfsPacketHeader>(data)?;
    let (packet, _) = take(rest, header.packet_size.get() as usize)?;
    Ok(packet)
}

// ---------------------------------------------------------------------------
// Property lists
// ---------------------------------------------------------------------------

pub mod property {
    pub const GUEST_TOOLS_VERSION: i32 = 4500;
    pub const GUEST_TOOLS_API_OPTIONS: i32 = 4501;
    pub const GUEST_OS_FAMILY: i32 = 4502;
    pub const GUEST_OS_VERSION: i32 = 4503;
    pub const GUEST_NAME: i32 = 4505;
    pub const GUEST_TOOLS_PRODUCT_NAM: i32 = 4511;
    pub const GUEST_OS_VERSION_SHORT: i32 = 4520;
    pub const GUEST_START_PROGRAM_ENABLED: i32 = 4540;
}

const TYPE_INTEGER: i32 = 1;
const TYPE_STRING: i32 = 2;
const TYPE_BOOL: i32 = 3;
const TYPE_INT64: i32 = 5;
const TYPE_BLOB: i32 = 6;

#[derive(Debug, Default, Clone, Copy, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct PropertyHeader {
    id: I32<LE>,
    kind: I32<LE>,
    length: I32<LE>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Int32(i32),
    String(String),
    Bool(bool),
    Int64(i64),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub id: i32,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(id: i32, value: PropertyValue) -> Self {
        Self { id, value }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let (kind, value) = match &self.value {
            PropertyValue::Int32(v) => (TYPE_INTEGER, v.to_le_bytes().to_vec()),
            PropertyValue::String(s) => (TYPE_STRING, path_body(s)),
            PropertyValue::Bool(b) => (TYPE_BOOL, vec![*b as u8]),
            PropertyValue::Int64(v) => (TYPE_INT64, v.to_le_bytes().to_vec()),
            PropertyValue::Blob(b) => (TYPE_BLOB, b.clone()),
        };
        let header = PropertyHeader {
            id: I32::new(self.id),
            kind: I32::new(kind),
            length: I32::new(value.len() as i32),
        };
        buf.extend_from_slice(header.as_bytes());
        buf.extend_from_slice(&value);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PropertyList(pub Vec<Property>);

impl PropertyList {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for prop in &self.0 {
            prop.encode_into(&mut buf);
        }
        buf
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, ProtocolError> {
        let mut props = Vec::new();
        while !data.is_empty() {
            let (header, rest) = read_prefix::<PropertyHeader>(data)?;
            let len = usize::try_from(header.length.get())
                .map_err(|_| ProtocolError::InvalidBody("negative property length".into()))?;
            let (raw, rest) = take(rest, len)?;
            data = rest;

            let fixed = |n: usize| -> Result<[u8; 8], ProtocolError> {
                if raw.len() != n {
                    return Err(ProtocolError::InvalidBody(format!("property {} length {}", header.id.get(), raw.len())));
                }
                let mut out = [0u8; 8];
                out[..n].copy_from_slice(raw);
                Ok(out)
            };
            let value = match header.kind.get() {
                TYPE_INTEGER => {
                    let b = fixed(4)?;
                    PropertyValue::Int32(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                }
                TYPE_STRING => PropertyValue::String(nul_string(raw)),
                TYPE_BOOL => PropertyValue::Bool(fixed(1)?[0] != 0),
                TYPE_INT64 => PropertyValue::Int64(i64::from_le_bytes(fixed(8)?)),
                TYPE_BLOB => PropertyValue::Blob(raw.to_vec()),
                other => return Err(ProtocolError::InvalidBody(format!("property type {other}"))),
            };
            props.push(Property::new(header.id.get(), value));
        }
        Ok(Self(props))
    }

    pub fn get(&self, id: i32) -> Option<&PropertyValue> {
        self.0.iter().find(|p| p.id == id).map(|p| &p.value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_is_packed() {
        assert_eq!(std::mem::size_of::<CommandRequestHeader>(), 51);

        let header = CommandRequestHeader::new(opcode::START_PROGRAM, b"body", b"cred");
        let data = encode_request(&header, b"body", b"cred");
        assert_eq!(&data[..4], &COMMAND_MAGIC_WORD.to_le_bytes());

        let (parsed, rest) = read_prefix::<CommandRequestHeader>(&data).unwrap();
        assert_eq!(parsed.op_code.get(), opcode::START_PROGRAM);
        assert_eq!(parsed.total_message_length.get(), 59);
        assert_eq!(rest, b"bodycred");
    }

    #[test]
    fn credentials_survive_the_wire() {
        let cred = NamePassword {
            name: "root".into(),
            password: "p@ss:word".into(),
        };
        let data = cred.encode();
        assert_eq!(data.last(), Some(&0));
        assert_eq!(NamePassword::decode(&data).unwrap(), cred);

        assert!(NamePassword::decode(b"\x01\x00").is_err());
    }

    #[test]
    fn start_program_fields_are_nul_terminated() {
        let req = StartProgramRequest {
            program_path: "/bin/date".into(),
            arguments: "-u".into(),
            working_dir: String::new(),
            env_vars: vec!["FOO=bar".into(), "TZ=UTC".into()],
        };
        let data = req.encode();

        let (header, _) = read_prefix::<StartProgramHeader>(&data).unwrap();
        assert_eq!(header.program_path_length.get(), 10);
        assert_eq!(header.working_dir_length.get(), 0);
        assert_eq!(header.env_var_length.get(), 15);

        assert_eq!(StartProgramRequest::decode(&data).unwrap(), req);
    }

    #[test]
    fn truncated_start_program_is_rejected() {
        let data = StartProgramRequest {
            program_path: "/bin/date".into(),
            ..Default::default()
        }
        .encode();
        let err = StartProgramRequest::decode(&data[..data.len() - 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }), "got: {err:?}");
    }

    #[test]
    fn property_list_encodes_strings_with_nul() {
        let props = PropertyList(vec![
            Property::new(property::GUEST_NAME, PropertyValue::String("guest".into())),
            Property::new(property::GUEST_OS_FAMILY, PropertyValue::Int32(1)),
            Property::new(property::GUEST_START_PROGRAM_ENABLED, PropertyValue::Bool(true)),
            Property::new(1, PropertyValue::Int64(-2)),
        ]);
        let data = props.encode();
        // id, type, length, "guest\0"
        assert_eq!(&data[8..12], &6i32.to_le_bytes());
        assert_eq!(&data[12..18], b"guest\0");
        assert_eq!(PropertyList::decode(&data).unwrap(), props);
    }

    #[test]
    fn result_framing() {
        let mut header = CommandRequestHeader::new(opcode::GET_TOOLS_STATE, &[], &[]);
        assert_eq!(command_result(&header, Ok(b"abc".to_vec())), b"0 0 abc\0");

        header.common_flags = COMMAND_GUEST_RETURNS_BINARY;
        assert_eq!(command_result(&header, Ok(vec![1, 2])), b"0 0 #\x01\x02");

        let err = VixError::new(rc::NOT_A_FILE, "is a directory");
        header.common_flags = 0;
        assert_eq!(command_result(&header, Err(err)), b"20001 0 is a directory\0");
    }
}
