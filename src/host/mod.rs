//! # Host protocol engine
//!
//! Frames and dispatches the BLE-UART request/response protocol of
//! spec.md 4.4: a byte-level parser that reassembles `cmd|len|payload`
//! requests (mirroring [`crate::framing`]'s state-machine style), and a
//! dispatcher that owns the single open file, the directory walk, and the
//! A-GNSS staging queue.

pub mod fs;

use heapless::{String, Vec};

use crate::fmt::{debug, warn};
use crate::host::fs::{Directory, File, FileSystem, FsError, MAX_NAME_LEN};
use crate::telemetry::Telemetry;

/// Largest request payload the engine will assemble; longer requests are
/// consumed from the stream but silently dropped (spec.md 4.4/7).
pub const MAX_REQUEST_PAYLOAD: usize = 570;
/// Conceptually 128 B for directory listings and 256 B for file reads
/// (spec.md 6); both fit comfortably in one 256-byte response buffer, which
/// this engine uses uniformly.
pub const RESPONSE_PAYLOAD_MAX: usize = 256;
/// File-chunk data cap, independent of negotiated MTU (spec.md 4.4/6/glossary).
pub const MAX_CHUNK_DATA: usize = 254;
/// Response frame: 2-byte length prefix plus payload.
pub const RESPONSE_FRAME_LEN: usize = 2 + RESPONSE_PAYLOAD_MAX;

const CMD_LIST_DIR: u8 = 0x01;
const CMD_OPEN_FILE: u8 = 0x02;
const CMD_READ_CHUNK: u8 = 0x03;
const CMD_CLOSE_FILE: u8 = 0x04;
const CMD_DELETE_FILE: u8 = 0x05;
const CMD_SYS_INFO: u8 = 0x06;
const CMD_START_AGNSS: u8 = 0x07;
const CMD_WRITE_AGNSS_CHUNK: u8 = 0x08;
const CMD_END_AGNSS: u8 = 0x09;
const CMD_GPS_WAKEUP: u8 = 0x0A;
const CMD_GPS_KEEP_ALIVE: u8 = 0x0B;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqState {
    Idle,
    LenLo,
    LenHi,
    Payload,
}

/// One reassembled request.
pub struct Request {
    pub cmd: u8,
    pub payload: Vec<u8, MAX_REQUEST_PAYLOAD>,
}

/// Byte-at-a-time request reassembler (spec.md 4.4's
/// `Idle -> WaitLenLo -> WaitLenHi -> (WaitPayload | Dispatch)`).
pub struct RequestParser {
    state: ReqState,
    cmd: u8,
    remaining: u16,
    oversize: bool,
    payload: Vec<u8, MAX_REQUEST_PAYLOAD>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self { state: ReqState::Idle, cmd: 0, remaining: 0, oversize: false, payload: Vec::new() }
    }

    /// Feed one transport byte; returns a request once fully reassembled.
    /// A request whose declared length exceeds [`MAX_REQUEST_PAYLOAD`] is
    /// consumed from the stream but never yielded (spec.md 4.4/7: "silently
    /// dropped").
    pub fn feed(&mut self, byte: u8) -> Option<Request> {
        match self.state {
            ReqState::Idle => {
                self.cmd = byte;
                self.payload.clear();
                self.state = ReqState::LenLo;
                None
            }
            ReqState::LenLo => {
                self.remaining = byte as u16;
                self.state = ReqState::LenHi;
                None
            }
            ReqState::LenHi => {
                self.remaining |= (byte as u16) << 8;
                self.oversize = self.remaining as usize > MAX_REQUEST_PAYLOAD;
                if self.oversize {
                    warn!("host protocol: dropping oversize request ({} bytes)", self.remaining);
                }
                if self.remaining == 0 {
                    self.state = ReqState::Idle;
                    return Some(Request { cmd: self.cmd, payload: Vec::new() });
                }
                self.state = ReqState::Payload;
                None
            }
            ReqState::Payload => {
                if !self.oversize {
                    let _ = self.payload.push(byte);
                }
                self.remaining -= 1;
                if self.remaining == 0 {
                    self.state = ReqState::Idle;
                    if self.oversize {
                        return None;
                    }
                    let payload = core::mem::replace(&mut self.payload, Vec::new());
                    return Some(Request { cmd: self.cmd, payload });
                }
                None
            }
        }
    }
}

/// Which `SysInfo` wire layout to answer with. spec.md 4.4 leaves the choice
/// open ("50 or 63 bytes"); this engine answers V2 by default (see
/// DESIGN.md), configurable down for legacy hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysInfoVersion {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostEngineConfig {
    pub sysinfo_version: SysInfoVersion,
}

impl Default for HostEngineConfig {
    fn default() -> Self {
        Self { sysinfo_version: SysInfoVersion::V2 }
    }
}

/// What the orchestrator must relay to the GNSS state machine after a
/// dispatched command (spec.md 4.8); decoupled from
/// [`crate::state_machine`] the same way [`crate::agnss`] is.
pub enum HostAction<const AGNSS_N: usize, const AGNSS_M: usize> {
    None,
    GpsWakeup,
    GpsKeepAlive(u16),
    EndAgnss(Vec<Vec<u8, AGNSS_N>, AGNSS_M>),
}

/// `AGNSS_N`/`AGNSS_M` must match the [`crate::state_machine::GnssStateMachine`]
/// this engine's A-GNSS actions are relayed to.
pub struct HostEngine<FS: FileSystem, const AGNSS_N: usize, const AGNSS_M: usize> {
    fs: FS,
    config: HostEngineConfig,
    open_file: Option<FS::File>,
    dir_iter: Option<FS::Dir>,
    agnss_queue: Vec<Vec<u8, AGNSS_N>, AGNSS_M>,
}

impl<FS: FileSystem, const AGNSS_N: usize, const AGNSS_M: usize> HostEngine<FS, AGNSS_N, AGNSS_M> {
    pub fn new(fs: FS, config: HostEngineConfig) -> Self {
        Self { fs, config, open_file: None, dir_iter: None, agnss_queue: Vec::new() }
    }

    fn path_from(payload: &[u8]) -> &str {
        let len = *payload.first().unwrap_or(&0) as usize;
        let bytes = payload.get(1..1 + len).unwrap_or(&[]);
        core::str::from_utf8(bytes).unwrap_or("")
    }

    /// Reassemble and dispatch a single request, returning the framed
    /// response (length prefix + payload) and any action to relay onward.
    pub async fn handle(
        &mut self,
        request: &Request,
        telemetry: &Telemetry,
    ) -> (Vec<u8, RESPONSE_FRAME_LEN>, HostAction<AGNSS_N, AGNSS_M>) {
        let (payload, action) = self.dispatch(request.cmd, &request.payload, telemetry).await;
        let mut framed = Vec::new();
        let _ = framed.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        let _ = framed.extend_from_slice(&payload);
        (framed, action)
    }

    async fn dispatch(
        &mut self,
        cmd: u8,
        payload: &[u8],
        telemetry: &Telemetry,
    ) -> (Vec<u8, RESPONSE_PAYLOAD_MAX>, HostAction<AGNSS_N, AGNSS_M>) {
        let mut out = Vec::new();
        let action = match cmd {
            CMD_LIST_DIR => {
                self.list_dir(payload, &mut out).await;
                HostAction::None
            }
            CMD_OPEN_FILE => {
                self.open_file(payload, &mut out).await;
                HostAction::None
            }
            CMD_READ_CHUNK => {
                self.read_chunk(payload, &mut out).await;
                HostAction::None
            }
            CMD_CLOSE_FILE => {
                self.open_file = None;
                HostAction::None
            }
            CMD_DELETE_FILE => {
                self.delete_file(payload).await;
                HostAction::None
            }
            CMD_SYS_INFO => {
                self.sys_info(telemetry, &mut out);
                HostAction::None
            }
            CMD_START_AGNSS => {
                debug!("host protocol: StartAgnss, clearing staging queue");
                self.agnss_queue.clear();
                HostAction::None
            }
            CMD_WRITE_AGNSS_CHUNK => {
                self.write_agnss_chunk(payload);
                HostAction::None
            }
            CMD_END_AGNSS => {
                let queue = core::mem::replace(&mut self.agnss_queue, Vec::new());
                HostAction::EndAgnss(queue)
            }
            CMD_GPS_WAKEUP => HostAction::GpsWakeup,
            CMD_GPS_KEEP_ALIVE => {
                let minutes = u16::from_le_bytes(payload.get(0..2).map_or([0, 0], |b| [b[0], b[1]]));
                HostAction::GpsKeepAlive(minutes)
            }
            other => {
                warn!("host protocol: unrecognized command {:#04x}", other);
                HostAction::None
            }
        };
        (out, action)
    }

    async fn list_dir(&mut self, payload: &[u8], out: &mut Vec<u8, RESPONSE_PAYLOAD_MAX>) {
        if self.dir_iter.is_none() {
            let path = Self::path_from(payload);
            let path = if path.is_empty() { "/" } else { path };
            self.dir_iter = self.fs.open_dir(path).await.ok();
        }
        let Some(dir) = self.dir_iter.as_mut() else {
            let _ = out.push(0x00);
            return;
        };
        match dir.next().await {
            Ok(Some(entry)) => {
                let _ = out.push(0x01);
                let _ = out.push(entry.is_dir as u8);
                let _ = out.push(entry.name.len() as u8);
                let _ = out.extend_from_slice(entry.name.as_bytes());
                if !entry.is_dir {
                    let _ = out.extend_from_slice(&entry.size.to_le_bytes());
                }
            }
            _ => {
                self.dir_iter = None;
                let _ = out.push(0x00);
            }
        }
    }

    async fn open_file(&mut self, payload: &[u8], out: &mut Vec<u8, RESPONSE_PAYLOAD_MAX>) {
        self.open_file = None;
        let path = Self::path_from(payload);
        if let Ok(mut file) = self.fs.open(path, false).await {
            if let Ok(size) = file.size().await {
                self.open_file = Some(file);
                let _ = out.extend_from_slice(&size.to_le_bytes());
            }
        }
    }

    async fn read_chunk(&mut self, payload: &[u8], out: &mut Vec<u8, RESPONSE_PAYLOAD_MAX>) {
        let offset = u32::from_le_bytes(payload.get(0..4).map_or([0; 4], |b| b.try_into().unwrap()));
        let want = u16::from_le_bytes(payload.get(4..6).map_or([0, 0], |b| [b[0], b[1]])) as usize;
        let want = want.min(MAX_CHUNK_DATA);

        let mut buf = [0u8; MAX_CHUNK_DATA];
        let n = match self.open_file.as_mut() {
            Some(file) => file.read(offset, &mut buf[..want]).await.unwrap_or(0),
            None => 0,
        };
        let _ = out.extend_from_slice(&(n as u16).to_le_bytes());
        let _ = out.extend_from_slice(&buf[..n]);
    }

    async fn delete_file(&mut self, payload: &[u8]) {
        if self.open_file.is_some() {
            return;
        }
        let path = Self::path_from(payload);
        if self.fs.delete(path).await.is_err() {
            warn!("host protocol: delete failed, reporting success anyway");
        }
    }

    fn sys_info(&self, telemetry: &Telemetry, out: &mut Vec<u8, RESPONSE_PAYLOAD_MAX>) {
        match self.config.sysinfo_version {
            SysInfoVersion::V1 => {
                let mut buf = [0u8; crate::telemetry::V1_LEN];
                telemetry.encode_v1(&mut buf);
                let _ = out.extend_from_slice(&buf);
            }
            SysInfoVersion::V2 => {
                let mut buf = [0u8; crate::telemetry::V2_LEN];
                telemetry.encode_v2(&mut buf);
                let _ = out.extend_from_slice(&buf);
            }
        }
    }

    fn write_agnss_chunk(&mut self, payload: &[u8]) {
        let chunk_size = u16::from_le_bytes(payload.get(0..2).map_or([0, 0], |b| [b[0], b[1]])) as usize;
        if chunk_size == 0 {
            return;
        }
        let Some(data) = payload.get(2..2 + chunk_size) else {
            warn!("host protocol: WriteAgnssChunk declared more bytes than sent");
            return;
        };
        if data.len() > AGNSS_N {
            warn!("host protocol: WriteAgnssChunk frame too large, dropping");
            return;
        }
        let mut frame: Vec<u8, AGNSS_N> = Vec::new();
        let _ = frame.extend_from_slice(data);
        let _ = self.agnss_queue.push(frame);
    }
}

/// Directory-entry name helper shared with [`crate::host::fs`]; re-exported
/// for callers that want to build synthetic entries (e.g. tests).
pub fn name_from(s: &str) -> String<MAX_NAME_LEN> {
    String::try_from(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fs::FileEntry;

    struct ScenarioFile {
        data: &'static [u8],
    }

    impl File for ScenarioFile {
        async fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FsError> {
            let offset = offset as usize;
            if offset >= self.data.len() {
                return Ok(0);
            }
            let n = buf.len().min(self.data.len() - offset);
            buf[..n].copy_from_slice(&self.data[offset..offset + n]);
            Ok(n)
        }

        async fn write(&mut self, _buf: &[u8]) -> Result<usize, FsError> {
            Err(FsError::Io)
        }

        async fn flush(&mut self) -> Result<(), FsError> {
            Ok(())
        }

        async fn size(&mut self) -> Result<u32, FsError> {
            Ok(self.data.len() as u32)
        }
    }

    struct ScenarioDir {
        entries: &'static [(&'static str, bool, u32)],
        index: usize,
    }

    impl Directory for ScenarioDir {
        async fn next(&mut self) -> Result<Option<FileEntry>, FsError> {
            if self.index >= self.entries.len() {
                return Ok(None);
            }
            let (name, is_dir, size) = self.entries[self.index];
            self.index += 1;
            Ok(Some(FileEntry { name: name_from(name), is_dir, size }))
        }
    }

    struct ScenarioFs;

    impl FileSystem for ScenarioFs {
        type File = ScenarioFile;
        type Dir = ScenarioDir;

        async fn open(&mut self, path: &str, _append: bool) -> Result<Self::File, FsError> {
            if path == "/a.txt" {
                Ok(ScenarioFile { data: b"hello" })
            } else {
                Err(FsError::NotFound)
            }
        }

        async fn open_dir(&mut self, _path: &str) -> Result<Self::Dir, FsError> {
            Ok(ScenarioDir { entries: &[("a.txt", false, 5), ("logs", true, 0)], index: 0 })
        }

        async fn delete(&mut self, _path: &str) -> Result<(), FsError> {
            Ok(())
        }
    }

    fn block_on<F: core::future::Future>(mut fut: F) -> F::Output {
        use core::pin::Pin;
        use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = unsafe { Pin::new_unchecked(&mut fut) };
        loop {
            if let Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
                return v;
            }
        }
    }

    fn feed_request(parser: &mut RequestParser, bytes: &[u8]) -> Request {
        let mut req = None;
        for &b in bytes {
            if let Some(r) = parser.feed(b) {
                req = Some(r);
            }
        }
        req.expect("bytes did not complete a request")
    }

    type Engine = HostEngine<ScenarioFs, 32, 4>;

    /// End-to-end scenario 1 of spec.md 8.
    #[test]
    fn scenario_1_list_dir_root() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();
        let mut parser = RequestParser::new();

        let req = feed_request(&mut parser, &[0x01, 0x01, 0x00, 0x00]);
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(
            &rsp[..],
            &[0x0C, 0x00, 0x01, 0x00, 0x05, b'a', b'.', b't', b'x', b't', 0x05, 0x00, 0x00, 0x00]
        );

        let req = feed_request(&mut parser, &[0x01, 0x01, 0x00, 0x00]);
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x07, 0x00, 0x01, 0x01, 0x04, b'l', b'o', b'g', b's']);

        let req = feed_request(&mut parser, &[0x01, 0x01, 0x00, 0x00]);
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x01, 0x00, 0x00]);
    }

    /// End-to-end scenario 2 of spec.md 8.
    #[test]
    fn scenario_2_open_read_close() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();
        let mut parser = RequestParser::new();

        let req = feed_request(
            &mut parser,
            &[0x02, 0x07, 0x00, 0x06, b'/', b'a', b'.', b't', b'x', b't'],
        );
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x04, 0x00, 0x05, 0x00, 0x00, 0x00]);

        let req = feed_request(
            &mut parser,
            &[0x03, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x00],
        );
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x05, 0x00, 0x03, 0x00, b'h', b'e', b'l']);

        let req = feed_request(
            &mut parser,
            &[0x03, 0x06, 0x00, 0x03, 0x00, 0x00, 0x00, 0x0A, 0x00],
        );
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x04, 0x00, 0x02, 0x00, b'l', b'o']);

        let req = feed_request(&mut parser, &[0x04, 0x00, 0x00]);
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x00, 0x00]);

        let req = feed_request(
            &mut parser,
            &[0x03, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00],
        );
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x02, 0x00, 0x00, 0x00]);
    }

    /// End-to-end scenario 3 of spec.md 8.
    #[test]
    fn scenario_3_delete_while_no_file_open() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();
        let mut parser = RequestParser::new();

        let req = feed_request(
            &mut parser,
            &[0x05, 0x07, 0x00, 0x06, b'/', b'a', b'.', b't', b'x', b't'],
        );
        let (rsp, _) = block_on(engine.handle(&req, &telemetry));
        assert_eq!(&rsp[..], &[0x00, 0x00]);
    }

    /// P5: DeleteFile while a file is open returns empty without deleting.
    #[test]
    fn delete_while_file_open_is_rejected() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();
        let mut parser = RequestParser::new();

        let open = feed_request(
            &mut parser,
            &[0x02, 0x07, 0x00, 0x06, b'/', b'a', b'.', b't', b'x', b't'],
        );
        block_on(engine.handle(&open, &telemetry));

        let del = feed_request(
            &mut parser,
            &[0x05, 0x07, 0x00, 0x06, b'/', b'a', b'.', b't', b'x', b't'],
        );
        let (rsp, _) = block_on(engine.handle(&del, &telemetry));
        assert_eq!(&rsp[..], &[0x00, 0x00]);
        assert!(engine.open_file.is_some());
    }

    #[test]
    fn oversize_request_never_reaches_dispatch() {
        let mut parser = RequestParser::new();
        assert!(parser.feed(CMD_GPS_WAKEUP).is_none());
        let len = (MAX_REQUEST_PAYLOAD + 1) as u16;
        assert!(parser.feed(len as u8).is_none());
        assert!(parser.feed((len >> 8) as u8).is_none());
        for _ in 0..len {
            assert!(parser.feed(0xAA).is_none());
        }
    }

    #[test]
    fn gps_wakeup_and_keep_alive_relay_as_host_actions() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();

        let (_, action) = block_on(engine.dispatch(CMD_GPS_WAKEUP, &[], &telemetry));
        assert!(matches!(action, HostAction::GpsWakeup));

        let (_, action) = block_on(engine.dispatch(CMD_GPS_KEEP_ALIVE, &[5, 0], &telemetry));
        assert!(matches!(action, HostAction::GpsKeepAlive(5)));
    }

    #[test]
    fn agnss_start_write_end_round_trips_the_queue() {
        let mut engine = Engine::new(ScenarioFs, HostEngineConfig::default());
        let telemetry = Telemetry::default();

        block_on(engine.dispatch(CMD_START_AGNSS, &[0xFF, 0xFF], &telemetry));
        assert!(engine.agnss_queue.is_empty());

        let chunk = [3u8, 0, 0xAA, 0xBB, 0xCC];
        block_on(engine.dispatch(CMD_WRITE_AGNSS_CHUNK, &chunk, &telemetry));
        assert_eq!(engine.agnss_queue.len(), 1);

        let (_, action) = block_on(engine.dispatch(CMD_END_AGNSS, &[], &telemetry));
        match action {
            HostAction::EndAgnss(queue) => {
                assert_eq!(queue.len(), 1);
                assert_eq!(&queue[0][..], &[0xAA, 0xBB, 0xCC]);
            }
            _ => panic!("expected EndAgnss"),
        }
        assert!(engine.agnss_queue.is_empty());
    }
}
