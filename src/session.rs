//! The session layer: ties the transport, frame codec and socket registry
//! together into the request/response and notification-pump API, grounded
//! on `src/kbi.c`'s `kbi_cmd`, `kbi_ntf` and `kbi_waitFor`.

use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::error::Error;
use crate::firmware;
use crate::frame::{CommandFunction, Frame, FrameReader, NotificationFunction, RecvResult, ResponseFunction, MAX_FRAME_LEN};
use crate::socket::{classify_peer_name, OutboundDatagram, PeerAddressKind, SocketHandler, SocketRecord, SocketRegistry, DEFAULT_SOCKET_CAPACITY};
use crate::transport::{ByteTransport, RecvOutcome, SerialTransport};

/// Request/response retry budget per `cmd()` call.
const CMD_RETRIES: u8 = 3;
/// Settling delay after a successful `clear`.
const CLEAR_SETTLE: Duration = Duration::from_secs(1);
/// Settling delay after a successful `ifup`.
const IFUP_SETTLE: Duration = Duration::from_secs(5);
/// Poll interval used by `wait_for`.
const WAIT_FOR_POLL: Duration = Duration::from_secs(1);

/// Abstraction over wall-clock time, so retry/settling delays and
/// deadlines can be driven by a virtual clock in tests instead of really
/// sleeping for tens of seconds.
pub trait Clock {
    fn elapsed(&self) -> Duration;

    /// Deliberately wait out `dur` (a settling delay, a retry delay, a
    /// poll interval).
    fn sleep(&mut self, dur: Duration);

    /// Account for `dur` of wall time having passed because a transport
    /// read timed out. On the real clock this is a no-op — the blocking
    /// read itself already consumed that much real time, which
    /// `elapsed()` reflects automatically; a virtual clock has no such
    /// side channel and must be told explicitly.
    fn on_transport_timeout(&mut self, dur: Duration);
}

/// The real clock, used outside of tests.
pub struct SystemClock {
    start: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, dur: Duration) {
        std::thread::sleep(dur);
    }

    fn on_transport_timeout(&mut self, _dur: Duration) {}
}

/// A virtual clock for tests: `sleep` advances time instantly instead of
/// blocking, so deadline-polling loops run at test speed.
#[derive(Debug, Default)]
pub struct FakeClock {
    elapsed: Duration,
}

impl Clock for FakeClock {
    fn elapsed(&self) -> Duration {
        self.elapsed
    }

    fn sleep(&mut self, dur: Duration) {
        self.elapsed += dur;
    }

    fn on_transport_timeout(&mut self, dur: Duration) {
        self.elapsed += dur;
    }
}

/// Owns the transport, the receive buffer and decoder state, and the
/// socket registry; the single point of contact with the module.
pub struct Session<T: ByteTransport, C: Clock = SystemClock> {
    transport: T,
    reader: FrameReader,
    rx_buf: [u8; MAX_FRAME_LEN],
    sockets: SocketRegistry,
    clock: C,
}

impl Session<SerialTransport, SystemClock> {
    /// Open the serial device and initialise an empty socket table.
    pub fn init(device: &str) -> Result<Self, Error> {
        let transport = SerialTransport::open(device, crate::transport::DEFAULT_TIMEOUT_MS)?;
        Ok(Self::new(transport, SystemClock::default(), DEFAULT_SOCKET_CAPACITY))
    }
}

impl<T: ByteTransport, C: Clock> Session<T, C> {
    pub fn new(transport: T, clock: C, socket_capacity: usize) -> Self {
        Self {
            transport,
            reader: FrameReader::new(),
            rx_buf: [0u8; MAX_FRAME_LEN],
            sockets: SocketRegistry::new(socket_capacity),
            clock,
        }
    }

    /// Close the underlying transport. Equivalent to dropping the
    /// session, spelled out for symmetry with the module's own
    /// open/close lifecycle.
    pub fn finish(self) {}

    fn send_frame(&mut self, bytes: &[u8]) -> Result<(), Error> {
        for &b in bytes {
            self.transport.send_byte(b)?;
        }
        Ok(())
    }

    fn recv_one(&mut self) -> RecvResult {
        loop {
            let outcome = match self.transport.recv_byte() {
                Ok(o) => o,
                Err(e) => return RecvResult::Err(Error::Transport(e)),
            };
            let byte = match outcome {
                RecvOutcome::Byte(b) => Some(b),
                RecvOutcome::Timeout => {
                    self.clock.on_transport_timeout(Duration::from_millis(crate::transport::DEFAULT_TIMEOUT_MS));
                    None
                }
            };
            if let Some(result) = self.reader.feed(&mut self.rx_buf, byte) {
                return result;
            }
        }
    }

    /// Send a command and wait for its matching response, retrying up to
    /// [`CMD_RETRIES`] times. A non-matching response (wrong `cmd`, a
    /// notification, or a decode/transport error) consumes a retry, same
    /// as the reference driver's `kbi_cmd`.
    pub fn cmd(&mut self, function: CommandFunction, cmd: Command, payload: &[u8]) -> Result<Frame, Error> {
        let mut last_err = Error::RequestFailed;
        for _ in 0..CMD_RETRIES {
            let bytes = Frame::encode_command(function, cmd.code(), payload);
            if let Err(e) = self.send_frame(&bytes) {
                last_err = e;
                continue;
            }
            match self.recv_one() {
                RecvResult::Response(frame) if frame.cmd == cmd.code() => {
                    if let Some(f) = frame.response_function() {
                        if f.is_error() {
                            last_err = Error::ModuleError(f);
                            continue;
                        }
                    }
                    self.settle(cmd);
                    return Ok(frame);
                }
                RecvResult::Response(_) => last_err = Error::RequestFailed,
                RecvResult::Notification(frame) => {
                    self.dispatch_notification(frame);
                    last_err = Error::RequestFailed;
                }
                RecvResult::Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn settle(&mut self, cmd: Command) {
        match cmd {
            Command::Clear => self.clock.sleep(CLEAR_SETTLE),
            Command::IfUp => self.clock.sleep(IFUP_SETTLE),
            _ => {}
        }
    }

    /// Re-issue a `read` of `cmd` once a second until the response's
    /// payload starts with `expected_prefix`, or `timeout` elapses.
    pub fn wait_for(&mut self, cmd: Command, expected_prefix: &[u8], timeout: Duration) -> Result<(), Error> {
        let deadline = self.clock.elapsed() + timeout;
        while self.clock.elapsed() < deadline {
            if let Ok(frame) = self.cmd(CommandFunction::Read, cmd, &[]) {
                if frame.payload.len() >= expected_prefix.len() && frame.payload[..expected_prefix.len()] == *expected_prefix {
                    return Ok(());
                }
            }
            self.clock.sleep(WAIT_FOR_POLL);
        }
        Err(Error::RequestFailed)
    }

    /// Read and dispatch one notification (or drain one response frame
    /// that arrived unsolicited). Used by long-running server loops.
    pub fn notification_pump(&mut self) -> Result<(), Error> {
        match self.recv_one() {
            RecvResult::Notification(frame) => {
                self.dispatch_notification(frame);
                Ok(())
            }
            RecvResult::Response(_) => Ok(()),
            RecvResult::Err(e) => Err(e),
        }
    }

    fn dispatch_notification(&mut self, frame: Frame) {
        let Some(function) = frame.notification_function() else { return };
        match function {
            NotificationFunction::PingReply | NotificationFunction::NamedPingReply => {
                log_ping_reply(function.is_named(), &frame.payload);
            }
            NotificationFunction::SockRecv | NotificationFunction::NamedSockRecv => {
                self.dispatch_sock_recv(function.is_named(), &frame.payload);
            }
            NotificationFunction::DstUnreachable => {
                if let Some(addr) = read_addr(&frame.payload, 0) {
                    tracing::info!(%addr, "destination unreachable");
                }
            }
        }
    }

    fn dispatch_sock_recv(&mut self, named: bool, payload: &[u8]) {
        if payload.len() < 4 {
            return;
        }
        let dport = u16::from_be_bytes([payload[0], payload[1]]);
        let sport = u16::from_be_bytes([payload[2], payload[3]]);
        let mut pos = 4;
        let domain = if named {
            let Some(field) = payload.get(pos..pos + 32) else { return };
            pos += 32;
            Some(parse_domain(field))
        } else {
            None
        };
        let Some(src_addr) = read_addr(payload, pos) else { return };
        pos += 16;
        let udp_payload = &payload[pos..];
        let src_addr_str = src_addr.to_string();

        tracing::info!(saddr = %src_addr_str, ?domain, sport, dport, len = udp_payload.len(), "udp rcv");

        let outbound = self
            .sockets
            .dispatch_target(dport, &src_addr_str, sport)
            .and_then(|sock| (sock.handler)(dport, sport, &src_addr_str, udp_payload));

        if let Some(datagram) = outbound {
            let _ = self.socket_send(datagram.loc_port, datagram.peer_port, Some(&datagram.peer_name), &datagram.payload);
        }
    }

    /// Open a socket bound to a single peer; traffic from any other
    /// source address/port is discarded by the module.
    pub fn socket_connect(&mut self, loc_port: u16, peer_port: u16, peer_name: &str, handler: SocketHandler) -> Result<u16, Error> {
        let idx = self.sockets.reserve().ok_or(Error::SocketRegistryFull)?;
        let mut payload = Vec::new();
        if loc_port > 0 {
            payload.extend_from_slice(&loc_port.to_be_bytes());
        }
        let frame = self.cmd(CommandFunction::Write, Command::SocketOpenClose, &payload)?;
        if frame.response_function() != Some(ResponseFunction::Value) || frame.payload.len() < 2 {
            return Err(Error::RequestFailed);
        }
        let port = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        self.sockets.fill(idx, SocketRecord { loc_port: port, peer_port, peer_name: peer_name.to_string(), handler });
        Ok(port)
    }

    /// Open a socket accepting traffic from any source.
    pub fn socket_bind(&mut self, loc_port: u16, handler: SocketHandler) -> Result<u16, Error> {
        self.socket_connect(loc_port, 0, "", handler)
    }

    /// Send a UDP datagram out of an already-open socket. `peer_name` of
    /// `None` reuses the socket's connected peer.
    pub fn socket_send(&mut self, loc_port: u16, peer_port: u16, peer_name: Option<&str>, payload: &[u8]) -> Result<(), Error> {
        let (effective_port, effective_name) = {
            let sock = self.sockets.find_by_loc_port(loc_port).ok_or(Error::SocketNotFound(loc_port))?;
            match peer_name {
                Some(name) => (peer_port, name.to_string()),
                None => (sock.peer_port, sock.peer_name.clone()),
            }
        };

        let mut cmd_payload = Vec::with_capacity(4 + 32 + payload.len());
        cmd_payload.extend_from_slice(&loc_port.to_be_bytes());
        cmd_payload.extend_from_slice(&effective_port.to_be_bytes());
        let command = match classify_peer_name(&effective_name) {
            PeerAddressKind::Ipv6 => {
                let addr: Ipv6Addr = effective_name.parse().expect("classified as an IPv6 literal");
                cmd_payload.extend_from_slice(&addr.octets());
                Command::SocketSend
            }
            PeerAddressKind::DomainName => {
                let mut field = [0u8; 32];
                let bytes = effective_name.as_bytes();
                let n = bytes.len().min(32);
                field[..n].copy_from_slice(&bytes[..n]);
                cmd_payload.extend_from_slice(&field);
                Command::NamedSocketSend
            }
        };
        cmd_payload.extend_from_slice(payload);

        self.cmd(CommandFunction::Write, command, &cmd_payload)?;
        Ok(())
    }

    /// Release an open socket, both locally and in the module.
    pub fn socket_close(&mut self, loc_port: u16) -> Result<(), Error> {
        if self.sockets.remove(loc_port).is_none() {
            return Err(Error::SocketNotFound(loc_port));
        }
        self.cmd(CommandFunction::Delete, Command::SocketOpenClose, &loc_port.to_be_bytes())?;
        Ok(())
    }

    /// Flash `file` (a raw DFU image including its 16-byte trailing
    /// suffix), then reset and confirm the module comes back up.
    pub fn firmware_update(&mut self, file: &[u8]) -> Result<(), Error> {
        let image = firmware::flashable_image(file)?;
        self.cmd(CommandFunction::Write, Command::Clear, &[])?;

        let mut id: u16 = 0;
        let blocks: Vec<&[u8]> = firmware::blocks(image).collect();
        for block in blocks {
            self.send_block(&mut id, block)?;
        }

        self.cmd(CommandFunction::Write, Command::Reset, &[])?;
        self.clock.sleep(Duration::from_secs(1));

        let deadline = self.clock.elapsed() + Duration::from_secs(firmware::REBOOT_POLL_SECS);
        while self.clock.elapsed() < deadline {
            if self.cmd(CommandFunction::Read, Command::SoftwareVersion, &[]).is_ok() {
                return Ok(());
            }
        }
        Err(Error::FirmwareUpdateNoReboot)
    }

    fn send_block(&mut self, id: &mut u16, block: &[u8]) -> Result<(), Error> {
        for _ in 0..firmware::BLOCK_RETRIES {
            let payload = firmware::block_payload(*id, block);
            let bytes = Frame::encode_command(CommandFunction::Write, Command::FirmwareUpdate.code(), &payload);
            self.send_frame(&bytes)?;

            let deadline = self.clock.elapsed() + Duration::from_secs(firmware::BLOCK_TIMEOUT_SECS);
            while self.clock.elapsed() < deadline {
                match self.recv_one() {
                    RecvResult::Response(frame) => match frame.response_function() {
                        Some(ResponseFunction::Value) if frame.payload.len() >= 2 => {
                            let rsp_id = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
                            if rsp_id == *id {
                                *id += 1;
                                return Ok(());
                            }
                        }
                        Some(ResponseFunction::FwuErr) => return Err(Error::FirmwareUpdate),
                        _ => {}
                    },
                    RecvResult::Notification(_) | RecvResult::Err(_) => {}
                }
            }
            self.clock.sleep(Duration::from_secs(firmware::RETRY_DELAY_SECS));
        }
        Err(Error::RequestFailed)
    }
}

fn read_addr(payload: &[u8], pos: usize) -> Option<Ipv6Addr> {
    payload.get(pos..pos + 16).map(|s| Ipv6Addr::from(<[u8; 16]>::try_from(s).unwrap()))
}

fn parse_domain(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn log_ping_reply(named: bool, payload: &[u8]) {
    let mut pos = 0;
    let domain = if named {
        let Some(field) = payload.get(pos..pos + 32) else { return };
        pos += 32;
        Some(parse_domain(field))
    } else {
        None
    };
    let Some(addr) = read_addr(payload, pos) else { return };
    pos += 16;
    if payload.len() < pos + 6 {
        return;
    }
    // Wire order is [seq][bytes][id], per `kbi.c`'s `dec1`/`dec2`/`dec3`
    // reads of the ping-reply notification; this is the opposite order
    // from spec §4.4's prose (`[id][seq][bytes]`), kept here to match what
    // the module actually sends rather than the spec text.
    let seq = u16::from_be_bytes([payload[pos], payload[pos + 1]]);
    let bytes = u16::from_be_bytes([payload[pos + 2], payload[pos + 3]]);
    let id = u16::from_be_bytes([payload[pos + 4], payload[pos + 5]]);
    tracing::info!(%addr, ?domain, id, seq, bytes, "ping reply");
}
