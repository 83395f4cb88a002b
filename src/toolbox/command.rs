//! Dispatcher for `Vix_1_Relayed_Command`: guest operations relayed by the
//! host on behalf of a VIX client.
//!
//! The request is `"<name>"\0` followed by a VIX request header, the op
//! body and a credential. Every op except `GetToolsState` is
//! authenticated before its handler runs.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use quick_xml::escape::escape;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::toolbox::hgfs;
use crate::toolbox::process::{Process, ProcessManager};
use crate::toolbox::service::Service;
use crate::toolbox::vix::{
    self, CommandRequestHeader, FileTransferRequest, KillProcessRequest, ListProcessesRequest, NamePassword,
    Property, PropertyList, PropertyValue, StartProgramRequest, VixError, opcode, property, rc,
};
use crate::toolbox::{read_prefix, take};

/// Service command name the dispatcher registers under.
pub const RELAYED_COMMAND: &str = "Vix_1_Relayed_Command";

pub const TOOLS_VERSION: &str = "10.0.5 build-3227872 (Compatible)";
pub const PRODUCT_NAME: &str = "VMware Tools (Rust)";

/// `VIX_TOOLSFEATURE_SUPPORT_GET_HANDLE_STATE`
const TOOLS_FEATURE_GET_HANDLE_STATE: i32 = 0x0001;

/// `GUEST_OS_FAMILY_LINUX`
const GUEST_OS_FAMILY_LINUX: i32 = 1;

/// `VIX_FILE_ATTRIBUTES_SYMLINK`
const FILE_ATTRIBUTES_SYMLINK: u32 = 0x2;

pub type AuthenticateFn = Box<dyn Fn(&CommandRequestHeader, &[u8]) -> Result<()> + Send + Sync>;
pub type StartCommandFn = Box<dyn Fn(&ProcessManager, &StartProgramRequest) -> Result<i64> + Send + Sync>;

type VixResult = std::result::Result<Vec<u8>, VixError>;

pub struct CommandServer {
    processes: Arc<ProcessManager>,
    hgfs: Arc<hgfs::Server>,
    authenticate: Option<AuthenticateFn>,
    start_command: Option<StartCommandFn>,
    hostname: String,
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|name| name.trim().to_owned())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

/// Accept any well-formed name/password credential.
fn check_credential(header: &CommandRequestHeader, credential: &[u8]) -> Result<()> {
    match header.user_credential_type.get() {
        vix::USER_CREDENTIAL_NAME_PASSWORD => {
            let cred = NamePassword::decode(credential)?;
            debug!(user = %cred.name, "credential accepted");
            Ok(())
        }
        other => Err(Error::Unsupported(format!("credential type {other}"))),
    }
}

impl CommandServer {
    pub fn new(processes: Arc<ProcessManager>, hgfs: Arc<hgfs::Server>) -> Self {
        Self {
            processes,
            hgfs,
            authenticate: None,
            start_command: None,
            hostname: hostname(),
        }
    }

    /// Replace the default credential check.
    pub fn with_authenticate(
        mut self,
        f: impl Fn(&CommandRequestHeader, &[u8]) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.authenticate = Some(Box::new(f));
        self
    }

    /// Replace how `StartProgram` launches processes. The default runs the
    /// program through the shell.
    pub fn with_start_command(
        mut self,
        f: impl Fn(&ProcessManager, &StartProgramRequest) -> Result<i64> + Send + Sync + 'static,
    ) -> Self {
        self.start_command = Some(Box::new(f));
        self
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    /// Route relayed commands from `service` to this dispatcher.
    pub fn register(self: Arc<Self>, service: &mut Service) {
        service.register_command(RELAYED_COMMAND, move |args| self.dispatch(args));
    }

    /// Handle one relayed command and return the VIX reply line.
    pub fn dispatch(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut data = data;
        if data.first() == Some(&b'"') {
            data = &data[1..];
        }
        let mut name = String::new();
        if let Some(ix) = data.iter().position(|b| *b == b'"') {
            if ix > 0 {
                name = String::from_utf8_lossy(&data[..ix]).into_owned();
                data = &data[ix + 1..];
            }
        }
        if data.first() == Some(&0) {
            data = &data[1..];
        }

        let (header, rest) = read_prefix::<CommandRequestHeader>(data)?;
        let op = header.op_code.get();
        debug!(%name, op, "vix dispatch");

        if header.magic.get() != vix::COMMAND_MAGIC_WORD {
            return Ok(vix::command_result(&header, Err(VixError::new(rc::INVALID_MESSAGE_HEADER, ""))));
        }
        if !is_supported(op) {
            return Ok(vix::command_result(
                &header,
                Err(VixError::new(rc::UNRECOGNIZED_COMMAND_IN_GUEST, "")),
            ));
        }

        let result = self.run(op, &header, rest);
        if let Err(err) = &result {
            warn!(op, code = err.code, error = %err, "vix command failed");
        }
        Ok(vix::command_result(&header, result))
    }

    fn run(&self, op: u32, header: &CommandRequestHeader, rest: &[u8]) -> VixResult {
        let (body, credential) = take(rest, header.body_length.get() as usize)?;

        if op != opcode::GET_TOOLS_STATE {
            let (credential, _) = take(credential, header.credential_length.get() as usize)?;
            let auth = match &self.authenticate {
                Some(f) => f(header, credential),
                None => check_credential(header, credential),
            };
            auth.map_err(|err| VixError::new(rc::AUTHENTICATION_FAIL, err.to_string()))?;
        }

        match op {
            opcode::GET_TOOLS_STATE => Ok(self.tools_state()),
            opcode::START_PROGRAM => self.start_program(body),
            opcode::LIST_PROCESSES_EX => self.list_processes(body),
            opcode::TERMINATE_PROCESS => self.terminate_process(body),
            opcode::INITIATE_FILE_TRANSFER_FROM_GUEST => file_from_guest(body),
            opcode::INITIATE_FILE_TRANSFER_TO_GUEST => file_to_guest(body),
            opcode::HGFS_SEND_PACKET => self.hgfs_packet(body),
            other => Err(VixError::new(rc::UNRECOGNIZED_COMMAND_IN_GUEST, format!("op {other}"))),
        }
    }

    fn tools_state(&self) -> Vec<u8> {
        let os = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
        let string = |id, value: &str| Property::new(id, PropertyValue::String(value.to_owned()));

        let props = PropertyList(vec![
            string(property::GUEST_OS_VERSION, &os),
            string(property::GUEST_OS_VERSION_SHORT, &os),
            string(property::GUEST_TOOLS_PRODUCT_NAM, PRODUCT_NAME),
            string(property::GUEST_TOOLS_VERSION, TOOLS_VERSION),
            string(property::GUEST_NAME, &self.hostname),
            Property::new(
                property::GUEST_TOOLS_API_OPTIONS,
                PropertyValue::Int32(TOOLS_FEATURE_GET_HANDLE_STATE),
            ),
            Property::new(property::GUEST_OS_FAMILY, PropertyValue::Int32(GUEST_OS_FAMILY_LINUX)),
            Property::new(property::GUEST_START_PROGRAM_ENABLED, PropertyValue::Bool(true)),
        ]);
        STANDARD.encode(props.encode()).into_bytes()
    }

    fn start_program(&self, body: &[u8]) -> VixResult {
        let request = StartProgramRequest::decode(body)?;
        let pid = match &self.start_command {
            Some(f) => f(&self.processes, &request)?,
            None => self.processes.start(&request, Process::Command)?,
        };
        Ok(pid.to_string().into_bytes())
    }

    fn list_processes(&self, body: &[u8]) -> VixResult {
        let request = ListProcessesRequest::decode(body)?;
        Ok(self.processes.list(&request.pids).into_bytes())
    }

    fn terminate_process(&self, body: &[u8]) -> VixResult {
        let (request, _) = read_prefix::<KillProcessRequest>(body)?;
        let pid = request.pid.get();
        if self.processes.kill(pid) {
            Ok(Vec::new())
        } else {
            Err(VixError::new(rc::NO_SUCH_PROCESS, format!("pid {pid}")))
        }
    }

    fn hgfs_packet(&self, body: &[u8]) -> VixResult {
        let packet = vix::decode_hgfs_packet(body)?;
        Ok(self.hgfs.dispatch(packet)?)
    }
}

fn is_supported(op: u32) -> bool {
    matches!(
        op,
        opcode::GET_TOOLS_STATE
            | opcode::START_PROGRAM
            | opcode::LIST_PROCESSES_EX
            | opcode::TERMINATE_PROCESS
            | opcode::INITIATE_FILE_TRANSFER_FROM_GUEST
            | opcode::INITIATE_FILE_TRANSFER_TO_GUEST
            | opcode::HGFS_SEND_PACKET
    )
}

// ---------------------------------------------------------------------------
// File transfer
// ---------------------------------------------------------------------------

/// Refuse symlinks and directories as transfer endpoints.
fn check_transfer_target(path: &Path, meta: &fs::Metadata) -> std::result::Result<(), VixError> {
    if meta.file_type().is_symlink() {
        return Err(VixError::new(rc::INVALID_ARG, format!("{} is a symlink", path.display())));
    }
    if meta.is_dir() {
        return Err(VixError::new(rc::NOT_A_FILE, format!("{} is a directory", path.display())));
    }
    Ok(())
}

fn file_from_guest(body: &[u8]) -> VixResult {
    let request = FileTransferRequest::decode_from_guest(body)?;
    let path = Path::new(&request.guest_path);
    let meta = fs::symlink_metadata(path).map_err(|e| Error::io(request.guest_path.clone(), e))?;
    check_transfer_target(path, &meta)?;
    Ok(file_info_xml(&request.guest_path, &meta).into_bytes())
}

fn file_to_guest(body: &[u8]) -> VixResult {
    let request = FileTransferRequest::decode_to_guest(body)?;
    let path = Path::new(&request.guest_path);
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            check_transfer_target(path, &meta)?;
            if !request.overwrite {
                return Err(VixError::new(
                    rc::FILE_ALREADY_EXISTS,
                    format!("{} exists", request.guest_path),
                ));
            }
            Ok(Vec::new())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(Error::io(request.guest_path.clone(), e).into()),
    }
}

fn file_info_xml(name: &str, meta: &fs::Metadata) -> String {
    let attrs = if meta.file_type().is_symlink() {
        FILE_ATTRIBUTES_SYMLINK
    } else {
        0
    };
    format!(
        "<fxi><Name>{}</Name><ft>{}</ft><fs>{}</fs><mt>{}</mt><at>{}</at><uid>{}</uid><gid>{}</gid><perm>{}</perm></fxi>",
        escape(name),
        attrs,
        meta.len(),
        meta.mtime(),
        meta.atime(),
        meta.uid(),
        meta.gid(),
        meta.mode() & 0o7777,
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::op::Operation;
    use crate::toolbox::hgfs::protocol::{Packet, RequestCreateSessionV4, StatusCode, op as hgfs_op};
    use crate::toolbox::process::ProcessError;
    use zerocopy::AsBytes;
    use zerocopy::byteorder::{I64, U32};

    fn server() -> CommandServer {
        CommandServer::new(
            Arc::new(ProcessManager::new(Duration::ZERO)),
            Arc::new(hgfs::Server::default()),
        )
    }

    fn request(op: u32, body: &[u8], flags: u8) -> Vec<u8> {
        let cred = NamePassword {
            name: "user".into(),
            password: "pass".into(),
        }
        .encode();
        let mut header = CommandRequestHeader::new(op, body, &cred);
        header.common_flags = flags;
        let mut data = b"\"reserved\"\0".to_vec();
        data.extend(vix::encode_request(&header, body, &cred));
        data
    }

    /// `(rc, body)` of a textual reply.
    fn parse(reply: &[u8]) -> (u32, String) {
        let text = String::from_utf8_lossy(reply);
        let text = text.strip_suffix('\0').unwrap_or(&text);
        let mut parts = text.splitn(3, ' ');
        let code = parts.next().unwrap().parse().unwrap();
        let _errno = parts.next().unwrap();
        (code, parts.next().unwrap_or("").to_owned())
    }

    fn kill_body(pid: i64) -> Vec<u8> {
        KillProcessRequest {
            pid: I64::new(pid),
            options: U32::new(0),
        }
        .as_bytes()
        .to_vec()
    }

    fn transfer(path: &Path, overwrite: bool) -> FileTransferRequest {
        FileTransferRequest {
            guest_path: path.to_string_lossy().into_owned(),
            overwrite,
        }
    }

    #[test]
    fn tools_state_needs_no_credential() {
        let s = server();
        let header = CommandRequestHeader::new(opcode::GET_TOOLS_STATE, &[], &[]);
        let mut data = b"\"reserved\"\0".to_vec();
        data.extend(vix::encode_request(&header, &[], &[]));

        let (code, body) = parse(&s.dispatch(&data).unwrap());
        assert_eq!(code, rc::OK);
        let props = PropertyList::decode(&STANDARD.decode(body).unwrap()).unwrap();
        assert_eq!(
            props.get(property::GUEST_TOOLS_VERSION),
            Some(&PropertyValue::String(TOOLS_VERSION.into()))
        );
        assert_eq!(
            props.get(property::GUEST_START_PROGRAM_ENABLED),
            Some(&PropertyValue::Bool(true))
        );
    }

    #[test]
    fn header_and_opcode_errors() {
        let s = server();
        let mut data = request(opcode::START_PROGRAM, &[], 0);
        // corrupt the magic word right after the quoted name
        data[11] ^= 0xff;
        assert_eq!(s.dispatch(&data).unwrap(), b"10000 0 \0");

        let data = request(9999, &[], 0);
        assert_eq!(s.dispatch(&data).unwrap(), b"3025 0 \0");

        assert!(s.dispatch(b"\"reserved\"\0short").is_err());
    }

    #[test]
    fn authentication_hook_gates_commands() {
        let s = server().with_authenticate(|_, _| Err(Error::PermissionDenied("bad password".into())));
        let (code, body) = parse(&s.dispatch(&request(opcode::LIST_PROCESSES_EX, &[0; 12], 0)).unwrap());
        assert_eq!(code, rc::AUTHENTICATION_FAIL);
        assert!(body.contains("bad password"), "got: {body}");
    }

    #[tokio::test]
    async fn process_lifecycle() {
        let s = server().with_start_command(|pm, req| {
            if req.program_path != "foo" {
                return Err(Error::NotFound(format!("{} does not exist", req.program_path)));
            }
            let run = Process::func(|_, op: Operation| async move {
                let err = op.done().await;
                Err(ProcessError::new(1, err.to_string()))
            });
            pm.start(req, run)
        });

        let start = |path: &str| {
            let body = StartProgramRequest {
                program_path: path.into(),
                ..Default::default()
            }
            .encode();
            parse(&s.dispatch(&request(opcode::START_PROGRAM, &body, 0)).unwrap())
        };

        let (code, pid) = start("foo");
        assert_eq!(code, rc::OK);
        let pid: i64 = pid.parse().unwrap();
        assert!(pid > 0);

        let list = ListProcessesRequest { pids: vec![pid] }.encode();
        let (code, body) = parse(&s.dispatch(&request(opcode::LIST_PROCESSES_EX, &list, 0)).unwrap());
        assert_eq!(code, rc::OK);
        assert_eq!(body.matches("<proc>").count(), 1);
        assert!(body.contains(&format!("<pid>{pid}</pid>")), "got: {body}");

        let terminate = || parse(&s.dispatch(&request(opcode::TERMINATE_PROCESS, &kill_body(pid), 0)).unwrap()).0;
        assert_eq!(terminate(), rc::OK);

        // zero expiry: the entry goes once the process has exited
        s.processes().wait(pid).await;
        let mut code = terminate();
        for _ in 0..100 {
            if code == rc::NO_SUCH_PROCESS {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            code = terminate();
        }
        assert_eq!(code, rc::NO_SUCH_PROCESS);

        assert_eq!(start("bar").0, rc::FILE_NOT_FOUND);
    }

    #[test]
    fn transfer_targets_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"abc").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&file, &link).unwrap();
        let s = server();

        let from = |path: &Path| {
            let body = transfer(path, false).encode_from_guest();
            parse(&s.dispatch(&request(opcode::INITIATE_FILE_TRANSFER_FROM_GUEST, &body, 0)).unwrap())
        };
        let to = |path: &Path, overwrite: bool| {
            let body = transfer(path, overwrite).encode_to_guest();
            parse(&s.dispatch(&request(opcode::INITIATE_FILE_TRANSFER_TO_GUEST, &body, 0)).unwrap()).0
        };

        let (code, body) = from(&file);
        assert_eq!(code, rc::OK);
        assert!(body.starts_with("<fxi><Name>"), "got: {body}");
        assert!(body.contains("<fs>3</fs>"), "got: {body}");
        assert_eq!(from(dir.path()).0, rc::NOT_A_FILE);
        assert_eq!(from(&link).0, rc::INVALID_ARG);
        assert_eq!(from(&dir.path().join("missing")).0, rc::FILE_NOT_FOUND);

        assert_eq!(to(&file, false), rc::FILE_ALREADY_EXISTS);
        assert_eq!(to(&file, true), rc::OK);
        assert_eq!(to(&dir.path().join("new"), false), rc::OK);
        assert_eq!(to(dir.path(), true), rc::NOT_A_FILE);
        assert_eq!(to(&link, true), rc::INVALID_ARG);
    }

    #[test]
    fn hgfs_packets_are_relayed_as_binary() {
        let s = server();
        let packet = Packet::request(
            hgfs_op::CREATE_SESSION_V4,
            0,
            RequestCreateSessionV4::default().as_bytes().to_vec(),
        )
        .encode();
        let body = vix::encode_hgfs_packet(&packet);
        let reply = s
            .dispatch(&request(opcode::HGFS_SEND_PACKET, &body, vix::COMMAND_GUEST_RETURNS_BINARY))
            .unwrap();

        assert!(reply.starts_with(b"0 0 #"));
        let packet = Packet::decode(&reply[5..]).unwrap();
        assert_eq!(packet.status(), Some(StatusCode::Success));
    }
}
