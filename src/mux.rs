use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown as SocketShutdown, TcpStream};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::buffer::ByteBuffer;
use crate::frame::{
    CommandSink, FrameHandler, CMD_ACCESSORY_CONNECTED, CMD_CLOSE_ACCESSORY, CMD_CONNECTION_RESP,
    CMD_CONNECT_SOCKET, CMD_DATA_PACKET, CMD_DISCONNECT_SOCKET,
};
use crate::util::shutdown::Shutdown;

/// Port the peer's sockets are forwarded to until CMD_ACCESSORY_CONNECTED
/// overrides it.
const DEFAULT_FORWARD_PORT: u16 = 8000;

/// Outbound scratch buffer: 6 bytes of frame prologue (command, length,
/// session id) followed by up to 8186 data bytes per selector cycle. The
/// peer tolerates larger frames; this is a tunable, not a protocol limit.
pub const SCRATCH_LEN: usize = 8192;
const PROLOGUE_LEN: usize = 6;

const POLL_TIMEOUT_MS: u16 = 1000;

/// Many-to-one session multiplexer: maps the peer's 16-bit session ids to
/// loopback TCP sockets. Inbound command handlers run on the USB-read
/// thread; the selector cycle runs on the socket-read thread. The session
/// table mutex serializes every table mutation, and all replies go through
/// the shared, serialized command sink.
pub struct SessionMux {
    sessions: Mutex<HashMap<u16, TcpStream>>,
    forward_port: AtomicU16,
    app_connected: AtomicBool,
    sink: Arc<dyn CommandSink>,
    shutdown: Arc<Shutdown>,
}

impl SessionMux {
    pub fn new(sink: Arc<dyn CommandSink>, shutdown: Arc<Shutdown>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            forward_port: AtomicU16::new(DEFAULT_FORWARD_PORT),
            app_connected: AtomicBool::new(false),
            sink,
            shutdown,
        }
    }

    /// CMD_CONNECT_SOCKET: open a loopback connection for `session_id` and
    /// report success (1) or failure (0) back to the peer. A failed connect
    /// leaves the table untouched.
    pub fn connect_socket(&self, session_id: u16) {
        let port = self.forward_port.load(Ordering::Relaxed);
        debug!("session {}: connecting to 127.0.0.1:{}", session_id, port);
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)) {
            Ok(stream) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    warn!("session {}: set_nonblocking failed: {}", session_id, err);
                    self.connection_resp(session_id, 0);
                    return;
                }
                let previous = self.sessions.lock().unwrap().insert(session_id, stream);
                if let Some(old) = previous {
                    // The peer reused a live id; the old socket loses.
                    warn!("session {}: replacing a live session", session_id);
                    let _ = old.shutdown(SocketShutdown::Both);
                }
                self.connection_resp(session_id, 1);
            }
            Err(err) => {
                warn!("session {}: connect failed: {}", session_id, err);
                self.connection_resp(session_id, 0);
            }
        }
    }

    /// Reply to a connect request: `session_id || status`, 1 for success,
    /// 0 for failure.
    fn connection_resp(&self, session_id: u16, status: u16) {
        let mut payload = [0u8; 4];
        BigEndian::write_u16(&mut payload[0..2], session_id);
        BigEndian::write_u16(&mut payload[2..4], status);
        if let Err(err) = self.sink.send(CMD_CONNECTION_RESP, &payload) {
            warn!(
                "session {}: unable to send connection response: {:#}",
                session_id, err
            );
        }
    }

    /// CMD_DISCONNECT_SOCKET from the peer. Idempotent; unknown ids are
    /// ignored and no notification is echoed back.
    pub fn disconnect_socket(&self, session_id: u16) {
        self.drop_session(session_id, false);
    }

    /// CMD_DATA_PACKET: drain `data` into the session's socket, waiting for
    /// writability as needed. A broken socket tears the session down and
    /// notifies the peer; the rest of the payload is dropped.
    pub fn write_to_session(&self, session_id: u16, data: &[u8]) {
        let stream = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).and_then(|s| s.try_clone().ok())
        };
        let stream = match stream {
            Some(stream) => stream,
            None => {
                debug!("session {}: unknown, {} bytes dropped", session_id, data.len());
                return;
            }
        };

        let mut writer = &stream;
        let mut offset = 0;
        while offset < data.len() {
            if self.shutdown.is_set() {
                return;
            }
            if !wait_writable(&stream) {
                continue;
            }
            match writer.write(&data[offset..]) {
                Ok(0) => {
                    info!("session {}: write returned 0, socket broken", session_id);
                    self.drop_session(session_id, true);
                    return;
                }
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock
                        || err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!("session {}: write failed: {}", session_id, err);
                    self.drop_session(session_id, true);
                    return;
                }
            }
        }
    }

    /// CMD_ACCESSORY_CONNECTED: the app is up; subsequent connects target
    /// this port.
    pub fn set_forward_port(&self, port: u32) {
        if port == 0 || port > u32::from(u16::MAX) {
            warn!("ignoring out-of-range forward port {}", port);
            return;
        }
        self.forward_port.store(port as u16, Ordering::Relaxed);
        self.app_connected.store(true, Ordering::Relaxed);
        info!("app connected, forwarding port {}", port);
    }

    /// CMD_CLOSE_ACCESSORY: ask the runtime to wind down.
    pub fn request_close(&self) {
        self.shutdown.request();
    }

    /// True exactly once after the app announced itself; the runtime uses
    /// this to send a single CMD_CLOSE_ACCESSORY at shutdown.
    pub fn take_app_connected(&self) -> bool {
        self.app_connected.swap(false, Ordering::Relaxed)
    }

    /// One pass of the socket-read loop: poll every live socket for up to a
    /// second, then forward whatever arrived as CMD_DATA_PACKET frames.
    /// EOF and read errors tear the session down and notify the peer.
    ///
    /// `scratch` must be SCRATCH_LEN bytes; the read lands past the 6-byte
    /// prologue so the frame is transmitted without another copy.
    pub fn selector_cycle(&self, scratch: &mut [u8]) {
        let snapshot: Vec<(u16, TcpStream)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter_map(|(id, stream)| stream.try_clone().ok().map(|s| (*id, s)))
                .collect()
        };
        if snapshot.is_empty() {
            // Polling a zero set is meaningless; idle briefly instead.
            thread::sleep(Duration::from_millis(1));
            return;
        }

        let mut fds: Vec<PollFd> = snapshot
            .iter()
            .map(|(_, stream)| PollFd::new(stream.as_fd(), PollFlags::POLLIN))
            .collect();
        let ready: Vec<bool> = match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
            Ok(0) => return,
            Ok(_) => fds
                .iter()
                .map(|fd| {
                    fd.revents().map_or(false, |r| {
                        r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                    })
                })
                .collect(),
            Err(Errno::EINTR) => return,
            Err(err) => {
                warn!("selector poll failed: {}", err);
                return;
            }
        };
        drop(fds);

        for ((session_id, stream), ready) in snapshot.iter().zip(ready) {
            if ready {
                self.pump_socket(*session_id, stream, scratch);
            }
        }
    }

    fn pump_socket(&self, session_id: u16, stream: &TcpStream, scratch: &mut [u8]) {
        let mut reader = stream;
        match reader.read(&mut scratch[PROLOGUE_LEN..]) {
            Ok(0) => {
                // Zero-byte read is a peer close.
                info!("session {}: closed by local peer", session_id);
                self.drop_session(session_id, true);
            }
            Ok(n) => {
                scratch[..2].copy_from_slice(&CMD_DATA_PACKET);
                BigEndian::write_u16(&mut scratch[2..4], (n + 2) as u16);
                BigEndian::write_u16(&mut scratch[4..6], session_id);
                if let Err(err) = self.sink.send_frame(&scratch[..PROLOGUE_LEN + n]) {
                    warn!("session {}: unable to forward {} bytes: {:#}", session_id, n, err);
                }
            }
            Err(err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!("session {}: read failed: {}", session_id, err);
                self.drop_session(session_id, true);
            }
        }
    }

    /// Remove and close one session. Removal and close happen under the
    /// table lock's critical section, so the selector never sees a half
    /// torn-down entry.
    fn drop_session(&self, session_id: u16, notify_peer: bool) {
        let removed = self.sessions.lock().unwrap().remove(&session_id);
        if let Some(stream) = removed {
            let _ = stream.shutdown(SocketShutdown::Both);
            debug!("session {} disconnected", session_id);
            if notify_peer {
                if let Err(err) = self.sink.send_u16(CMD_DISCONNECT_SOCKET, session_id) {
                    warn!("session {}: unable to notify peer: {:#}", session_id, err);
                }
            }
        }
    }

    /// Close every socket and empty the table. Used at runtime shutdown.
    pub fn disconnect_all(&self) {
        let mut sessions = self.sessions.lock().unwrap();
        for (session_id, stream) in sessions.drain() {
            let _ = stream.shutdown(SocketShutdown::Both);
            debug!("session {} closed at shutdown", session_id);
        }
    }
}

/// Wait up to a second for `stream` to accept more bytes. Returns false on
/// timeout so the caller can re-check the shutdown signal.
fn wait_writable(stream: &TcpStream) -> bool {
    let mut fds = [PollFd::new(stream.as_fd(), PollFlags::POLLOUT)];
    match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
        Ok(n) => n > 0,
        Err(Errno::EINTR) => false,
        // Let the write itself surface the real error.
        Err(_) => true,
    }
}

/// Routes every decoded inbound frame to the multiplexer. Runs on the
/// USB-read thread; the frame codec stays ignorant of command semantics.
pub struct InboundDispatcher {
    mux: Arc<SessionMux>,
}

impl InboundDispatcher {
    pub fn new(mux: Arc<SessionMux>) -> Self {
        Self { mux }
    }
}

impl FrameHandler for InboundDispatcher {
    fn on_frame(&mut self, command: [u8; 2], payload: &[u8]) {
        let mut payload = ByteBuffer::wrap(payload);
        match command {
            CMD_CONNECT_SOCKET => {
                if payload.remaining() < 2 {
                    warn!("connect frame with short payload dropped");
                    return;
                }
                self.mux.connect_socket(payload.get_u16());
            }
            CMD_DISCONNECT_SOCKET => {
                if payload.remaining() < 2 {
                    warn!("disconnect frame with short payload dropped");
                    return;
                }
                self.mux.disconnect_socket(payload.get_u16());
            }
            CMD_DATA_PACKET => {
                if payload.remaining() < 2 {
                    warn!("data frame with short payload dropped");
                    return;
                }
                let session_id = payload.get_u16();
                self.mux.write_to_session(session_id, payload.remaining_slice());
            }
            CMD_ACCESSORY_CONNECTED => {
                if payload.remaining() < 4 {
                    warn!("accessory-connected frame with short payload dropped");
                    return;
                }
                self.mux.set_forward_port(payload.get_u32());
            }
            CMD_CLOSE_ACCESSORY => {
                info!("close requested by peer");
                self.mux.request_close();
            }
            other => {
                warn!(
                    "unknown command {:02x}{:02x}, {} byte payload dropped",
                    other[0],
                    other[1],
                    payload.remaining()
                );
            }
        }
    }
}
