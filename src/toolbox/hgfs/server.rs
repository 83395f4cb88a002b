//! HGFS file server: sessions, open files and the V2/V3/V4 op subset the
//! guest-operations file transfer path uses.
//!
//! Lock order: the session map, then one session's file table. Neither is
//! held across file I/O on another session.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, Permissions};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};
use zerocopy::AsBytes;
use zerocopy::byteorder::{I32, U32, U64};

use crate::toolbox::hgfs::protocol::*;
use crate::toolbox::{ProtocolError, read_prefix, take};

/// Most data a single read reply carries.
pub const MAX_READ_SIZE: usize =
    LARGE_PACKET_MAX as usize - HEADER_SIZE - std::mem::size_of::<ReplyReadV3>();

/// Sessions the server accepts at once.
pub const DEFAULT_MAX_SESSIONS: usize = 24;

/// Capability flag: the op is supported.
const CAPABILITY_SUPPORTED: u32 = 0x1;

/// `HGFS_SESSION_MAXPACKETSIZE_VALID`
const SESSION_MAX_PACKET_SIZE_VALID: u32 = 0x1;

type OpResult = Result<Vec<u8>, Status>;

#[derive(Default)]
struct Session {
    files: Mutex<HashMap<u32, File>>,
}

impl Session {
    fn files(&self) -> MutexGuard<'_, HashMap<u32, File>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn file(&self, handle: u32) -> Result<File, Status> {
        let files = self.files();
        let file = files
            .get(&handle)
            .ok_or_else(|| Status::new(StatusCode::InvalidHandle, format!("handle {handle}")))?;
        file.try_clone().map_err(Status::from)
    }
}

pub struct Server {
    root: Option<PathBuf>,
    max_sessions: usize,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    next_handle: AtomicU32,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS)
    }
}

const OPS: [i32; 9] = [
    op::CREATE_SESSION_V4,
    op::DESTROY_SESSION_V4,
    op::GETATTR_V2,
    op::SETATTR_V2,
    op::OPEN,
    op::CLOSE,
    op::OPEN_V3,
    op::READ_V3,
    op::WRITE_V3,
];

impl Server {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            root: None,
            max_sessions,
            sessions: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(0),
        }
    }

    /// Resolve every path under `root` instead of `/`.
    pub fn rooted(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    /// Handle one request packet and return the encoded reply packet.
    pub fn dispatch(&self, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let request = Packet::decode(data)?;
        let op = request.op();

        let result = match op {
            op::CREATE_SESSION_V4 => self.create_session(&request),
            op::DESTROY_SESSION_V4 => self.destroy_session(&request),
            op::GETATTR_V2 => self.getattr(&request),
            op::SETATTR_V2 => self.setattr(&request),
            op::OPEN => self.open(&request),
            op::CLOSE => self.close(&request),
            op::OPEN_V3 => self.open_v3(&request),
            op::READ_V3 => self.read(&request),
            op::WRITE_V3 => self.write(&request),
            other => Err(Status::new(
                StatusCode::OperationNotSupported,
                format!("unsupported op {other}"),
            )),
        };

        if let Err(status) = &result {
            debug!(op, session = request.session_id(), error = %status, "hgfs op failed");
        }
        Ok(request.reply(result).encode())
    }

    fn session(&self, packet: &Packet) -> Result<Arc<Session>, Status> {
        let id = packet.session_id();
        self.sessions().get(&id).cloned().ok_or_else(|| {
            Status::new(StatusCode::StaleSession, format!("session {id:#x} not found"))
        })
    }

    /// Map a wire name onto the local filesystem. Parent components are
    /// refused so a rooted server cannot be escaped.
    fn resolve(&self, name: &FileName) -> Result<PathBuf, Status> {
        let relative = PathBuf::from(name.path().trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Status::new(
                StatusCode::OperationNotPermitted,
                format!("path {:?}", name.path()),
            ));
        }
        let base = self.root.as_deref().unwrap_or(Path::new("/"));
        Ok(base.join(relative))
    }

    fn new_handle(&self) -> u32 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn add_file(&self, session: &Session, file: File) -> u32 {
        let handle = self.new_handle();
        session.files().insert(handle, file);
        handle
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    fn create_session(&self, packet: &Packet) -> OpResult {
        // the client's capability list is not needed, only its shape
        read_prefix::<RequestCreateSessionV4>(&packet.payload)?;

        let session_id = rand::random::<u64>();
        {
            let mut sessions = self.sessions();
            if sessions.len() >= self.max_sessions {
                warn!(max = self.max_sessions, "hgfs session limit reached");
                return Err(Status::new(StatusCode::TooManySessions, "too many sessions"));
            }
            sessions.insert(session_id, Arc::new(Session::default()));
        }
        info!(session = session_id, "hgfs session created");

        let reply = ReplyCreateSessionV4 {
            session_id: U64::new(session_id),
            num_capabilities: U32::new(OPS.len() as u32),
            max_packet_size: U32::new(LARGE_PACKET_MAX),
            flags: U32::new(SESSION_MAX_PACKET_SIZE_VALID),
            ..Default::default()
        };
        let mut buf = reply.as_bytes().to_vec();
        for op in OPS {
            let cap = Capability {
                op: I32::new(op),
                flags: U32::new(CAPABILITY_SUPPORTED),
            };
            buf.extend_from_slice(cap.as_bytes());
        }
        Ok(buf)
    }

    fn destroy_session(&self, packet: &Packet) -> OpResult {
        let id = packet.session_id();
        let session = self.sessions().remove(&id).ok_or_else(|| {
            Status::new(StatusCode::StaleSession, format!("session {id:#x} not found"))
        })?;

        let files = std::mem::take(&mut *session.files());
        if !files.is_empty() {
            info!(session = id, open = files.len(), "hgfs session removed with open files");
        }
        drop(files);
        Ok(ReplyDestroySessionV4::default().as_bytes().to_vec())
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    fn getattr(&self, packet: &Packet) -> OpResult {
        self.session(packet)?;
        let (_, rest) = read_prefix::<RequestGetattrV2>(&packet.payload)?;
        let (name, _) = FileName::decode(rest)?;
        let path = self.resolve(&name)?;

        let meta = fs::symlink_metadata(&path)?;
        let file_type = if meta.is_dir() {
            FILE_TYPE_DIRECTORY
        } else if meta.file_type().is_symlink() {
            FILE_TYPE_SYMLINK
        } else {
            FILE_TYPE_REGULAR
        };
        let mode = meta.mode();

        let attr = AttrV2 {
            mask: U64::new(
                ATTR_VALID_TYPE
                    | ATTR_VALID_SIZE
                    | ATTR_VALID_OWNER_PERMS
                    | ATTR_VALID_GROUP_PERMS
                    | ATTR_VALID_OTHER_PERMS
                    | ATTR_VALID_USER_ID
                    | ATTR_VALID_GROUP_ID,
            ),
            file_type: I32::new(file_type),
            size: U64::new(meta.len()),
            owner_perms: ((mode >> 6) & 0o7) as u8,
            group_perms: ((mode >> 3) & 0o7) as u8,
            other_perms: (mode & 0o7) as u8,
            user_id: U32::new(meta.uid()),
            group_id: U32::new(meta.gid()),
            ..Default::default()
        };

        let mut buf = attr.as_bytes().to_vec();
        // no symlink target
        buf.extend_from_slice(&FileName::default().encode());
        Ok(buf)
    }

    fn setattr(&self, packet: &Packet) -> OpResult {
        self.session(packet)?;
        let (req, rest) = read_prefix::<RequestSetattrV2>(&packet.payload)?;
        let (name, _) = FileName::decode(rest)?;
        let path = self.resolve(&name)?;
        let attr = req.attr;

        let uid = attr.has(ATTR_VALID_USER_ID).then(|| attr.user_id.get());
        let gid = attr.has(ATTR_VALID_GROUP_ID).then(|| attr.group_id.get());
        if uid.is_some() || gid.is_some() {
            std::os::unix::fs::chown(&path, uid, gid)?;
        }

        let mut perm = 0u32;
        if attr.has(ATTR_VALID_OWNER_PERMS) {
            perm |= u32::from(attr.owner_perms) << 6;
        }
        if attr.has(ATTR_VALID_GROUP_PERMS) {
            perm |= u32::from(attr.group_perms) << 3;
        }
        if attr.has(ATTR_VALID_OTHER_PERMS) {
            perm |= u32::from(attr.other_perms);
        }
        if perm != 0 {
            fs::set_permissions(&path, Permissions::from_mode(perm))?;
        }
        Ok(Vec::new())
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    fn open(&self, packet: &Packet) -> OpResult {
        let (req, rest) = read_prefix::<RequestOpen>(&packet.payload)?;
        let (name, _) = FileName::decode(rest)?;
        let session = self.session(packet)?;
        let path = self.resolve(&name)?;

        let file = match req.open_mode.get() {
            OPEN_MODE_READ_ONLY => File::open(&path)?,
            mode => {
                return Err(Status::new(
                    StatusCode::AccessDenied,
                    format!("open mode {mode} not supported for {}", path.display()),
                ));
            }
        };

        let reply = ReplyOpen {
            handle: U32::new(self.add_file(&session, file)),
        };
        Ok(reply.as_bytes().to_vec())
    }

    fn open_v3(&self, packet: &Packet) -> OpResult {
        let (req, rest) = read_prefix::<RequestOpenV3>(&packet.payload)?;
        let (name, _) = FileNameV3::decode(rest)?;
        let session = self.session(packet)?;
        let path = self.resolve(&name.name)?;

        if req.desired_lock.get() != LOCK_NONE {
            return Err(Status::new(
                StatusCode::OperationNotSupported,
                format!("lock type {} not supported for {}", req.desired_lock.get(), path.display()),
            ));
        }

        let file = match req.open_mode.get() {
            OPEN_MODE_READ_ONLY => File::open(&path)?,
            OPEN_MODE_WRITE_ONLY => {
                let truncate = req.open_flags.get() & OPEN_CREATE_EMPTY == OPEN_CREATE_EMPTY;
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(truncate)
                    .mode(0o600)
                    .open(&path)?
            }
            mode => {
                return Err(Status::new(
                    StatusCode::AccessDenied,
                    format!("open mode {mode} not supported for {}", path.display()),
                ));
            }
        };

        let reply = ReplyOpenV3 {
            handle: U32::new(self.add_file(&session, file)),
            ..Default::default()
        };
        Ok(reply.as_bytes().to_vec())
    }

    fn close(&self, packet: &Packet) -> OpResult {
        let (req, _) = read_prefix::<RequestClose>(&packet.payload)?;
        let session = self.session(packet)?;
        let handle = req.handle.get();
        session
            .files()
            .remove(&handle)
            .ok_or_else(|| Status::new(StatusCode::InvalidHandle, format!("handle {handle}")))?;
        Ok(Vec::new())
    }

    fn read(&self, packet: &Packet) -> OpResult {
        let (req, _) = read_prefix::<RequestReadV3>(&packet.payload)?;
        let session = self.session(packet)?;
        let file = session.file(req.handle.get())?;

        // the reply must fit in one large packet
        let size = (req.required_size.get() as usize).min(MAX_READ_SIZE);
        let mut buf = vec![0u8; size];
        let offset = req.offset.get();
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 && !buf.is_empty() {
            return Err(Status::new(StatusCode::GenericError, format!("end of file at offset {offset}")));
        }
        buf.truncate(filled);

        let reply = ReplyReadV3 {
            actual_size: U32::new(filled as u32),
            ..Default::default()
        };
        Ok([reply.as_bytes(), &buf[..]].concat())
    }

    fn write(&self, packet: &Packet) -> OpResult {
        let (req, rest) = read_prefix::<RequestWriteV3>(&packet.payload)?;
        let (data, _) = take(rest, req.required_size.get() as usize)?;
        let session = self.session(packet)?;
        let file = session.file(req.handle.get())?;

        file.write_all_at(data, req.offset.get())?;

        let reply = ReplyWriteV3 {
            actual_size: U32::new(data.len() as u32),
            ..Default::default()
        };
        Ok(reply.as_bytes().to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
