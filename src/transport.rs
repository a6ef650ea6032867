//! Transport links: blocking byte/frame I/O over serial lines and CAN.
//!
//! Every link is half-duplex — at most one outstanding request per link.
//! Callers must not issue a second write before the prior response completes
//! or times out; concurrent use of one link would interleave request and
//! response bytes and corrupt framing.

use std::io::Read;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::TransportError;

/// Granularity of the blocking-read poll loop.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Byte-stream transport (serial/K-Line).
pub trait TransportLink: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `n` bytes, waiting up to `timeout`.
    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Discard bytes until `predicate` accepts one; returns that byte.
    /// Bounded by `timeout`.
    fn read_until(
        &mut self,
        predicate: &mut dyn FnMut(u8) -> bool,
        timeout: Duration,
    ) -> Result<u8, TransportError>;
}

/// Frame transport (CAN). Frames carry an 11-bit arbitration id and up to
/// 8 data bytes, zero-padded.
pub trait FrameBus: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn send(&mut self, id: u32, data: [u8; 8]) -> Result<(), TransportError>;

    /// Receive the next frame with arbitration id `id`, discarding frames
    /// from other ids, waiting up to `timeout`.
    fn recv(&mut self, id: u32, timeout: Duration) -> Result<[u8; 8], TransportError>;
}

// ============================================================================
// SERIAL
// ============================================================================

/// Serial port link. 8 data bits, 1 stop bit, no flow control; parity is
/// per protocol family (Denso runs 8E1).
pub struct SerialLink {
    path: String,
    baud_rate: u32,
    parity: serialport::Parity,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>, baud_rate: u32, parity: serialport::Parity) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            parity,
            port: None,
        }
    }
}

impl TransportLink for SerialLink {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.baud_rate)
            // Short device timeout; the deadline loop below owns the real one.
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .parity(self.parity)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| TransportError::Open {
                port: self.path.clone(),
                reason: e.to_string(),
            })?;
        log::info!("Opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed {}", self.path);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn read_exact(&mut self, n: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        let deadline = Instant::now() + timeout;

        while filled < n {
            if Instant::now() >= deadline {
                return Err(TransportError::TimedOut);
            }
            match port.read(&mut buf[filled..]) {
                Ok(0) => thread::sleep(POLL_INTERVAL),
                Ok(read) => filled += read,
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
        Ok(buf)
    }

    fn read_until(
        &mut self,
        predicate: &mut dyn FnMut(u8) -> bool,
        timeout: Duration,
    ) -> Result<u8, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + timeout;
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() >= deadline {
                return Err(TransportError::TimedOut);
            }
            match port.read(&mut byte) {
                Ok(1) if predicate(byte[0]) => return Ok(byte[0]),
                Ok(_) => {}
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    thread::sleep(POLL_INTERVAL)
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}

// ============================================================================
// CAN (SocketCAN)
// ============================================================================

/// SocketCAN frame bus. The interface bit rate is configured out of band
/// (`ip link set canX type can bitrate ...`).
pub struct CanLink {
    interface: String,
    socket: Option<socketcan::CanSocket>,
}

impl CanLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
        }
    }
}

impl FrameBus for CanLink {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.socket.is_some() {
            return Ok(());
        }
        use socketcan::Socket;
        let socket =
            socketcan::CanSocket::open(&self.interface).map_err(|e| TransportError::Open {
                port: self.interface.clone(),
                reason: e.to_string(),
            })?;
        log::info!("Opened CAN interface {}", self.interface);
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) {
        if self.socket.take().is_some() {
            log::info!("Closed CAN interface {}", self.interface);
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }

    fn send(&mut self, id: u32, data: [u8; 8]) -> Result<(), TransportError> {
        use socketcan::{EmbeddedFrame, Socket};
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let std_id = u16::try_from(id)
            .ok()
            .and_then(socketcan::StandardId::new)
            .ok_or(TransportError::InvalidId(id))?;
        let frame = socketcan::CanFrame::new(std_id, &data)
            .ok_or(TransportError::InvalidId(id))?;
        socket.write_frame(&frame)?;
        log::debug!("CAN tx id=0x{:03X} data={:02X?}", id, data);
        Ok(())
    }

    fn recv(&mut self, id: u32, timeout: Duration) -> Result<[u8; 8], TransportError> {
        use socketcan::{EmbeddedFrame, Socket};
        let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::TimedOut)?;
            let frame = match socket.read_frame_timeout(remaining) {
                Ok(frame) => frame,
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    return Err(TransportError::TimedOut)
                }
                Err(e) => return Err(TransportError::Io(e)),
            };
            let raw_id = match frame.id() {
                socketcan::Id::Standard(sid) => sid.as_raw() as u32,
                socketcan::Id::Extended(eid) => eid.as_raw(),
            };
            if raw_id != id {
                continue;
            }
            let mut data = [0u8; 8];
            let payload = frame.data();
            data[..payload.len()].copy_from_slice(payload);
            log::debug!("CAN rx id=0x{:03X} data={:02X?}", raw_id, data);
            return Ok(data);
        }
    }
}

// ============================================================================
// SERIAL-BRIDGED CAN
// ============================================================================

/// Length marker the cable firmware expects; counts the marker byte
/// itself plus ID_HI, ID_LO, and 8 data bytes.
const BRIDGE_FRAME_LEN: u8 = 12;

/// Bytes following the length marker: ID_HI + ID_LO + 8 data bytes.
const BRIDGE_BODY_LEN: usize = 10;

/// CAN frames carried over a byte stream, for cables that bridge CAN to a
/// serial interface. Wire format: `[LEN=12][ID_HI][ID_LO][DATA x 8]`.
pub struct SerialCanBridge {
    link: Box<dyn TransportLink>,
}

impl SerialCanBridge {
    pub fn new(link: Box<dyn TransportLink>) -> Self {
        Self { link }
    }
}

impl FrameBus for SerialCanBridge {
    fn open(&mut self) -> Result<(), TransportError> {
        self.link.open()
    }

    fn close(&mut self) {
        self.link.close()
    }

    fn is_open(&self) -> bool {
        self.link.is_open()
    }

    fn send(&mut self, id: u32, data: [u8; 8]) -> Result<(), TransportError> {
        if id > 0x7FF {
            return Err(TransportError::InvalidId(id));
        }
        let mut frame = Vec::with_capacity(BRIDGE_FRAME_LEN as usize);
        frame.push(BRIDGE_FRAME_LEN);
        frame.push((id >> 8) as u8);
        frame.push((id & 0xFF) as u8);
        frame.extend_from_slice(&data);
        self.link.write(&frame)
    }

    fn recv(&mut self, id: u32, timeout: Duration) -> Result<[u8; 8], TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::TimedOut)?;
            // Resynchronize on the length marker, then take the frame body.
            self.link
                .read_until(&mut |b| b == BRIDGE_FRAME_LEN, remaining)?;
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(TransportError::TimedOut)?;
            let body = self.link.read_exact(BRIDGE_BODY_LEN, remaining)?;
            let frame_id = ((body[0] as u32) << 8) | body[1] as u32;
            if frame_id != id {
                continue;
            }
            let mut data = [0u8; 8];
            data.copy_from_slice(&body[2..10]);
            return Ok(data);
        }
    }
}

// ============================================================================
// TEST DOUBLES
// ============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    type ByteResponder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;
    type FrameResponder = Box<dyn FnMut(u32, [u8; 8]) -> Vec<(u32, [u8; 8])> + Send>;

    #[derive(Default)]
    struct MockLinkInner {
        rx: VecDeque<u8>,
        writes: Vec<Vec<u8>>,
        opened: bool,
        responder: Option<ByteResponder>,
    }

    /// Scripted byte-stream link. Clones share state so a test can hand the
    /// link to a session and still inspect traffic afterwards.
    #[derive(Clone, Default)]
    pub(crate) struct MockLink {
        inner: Arc<Mutex<MockLinkInner>>,
    }

    impl MockLink {
        pub fn new() -> Self {
            Self::default()
        }

        /// A link whose fake device computes its reply from each write.
        pub fn respond(f: impl FnMut(&[u8]) -> Vec<u8> + Send + 'static) -> Self {
            let link = Self::new();
            link.inner.lock().unwrap().responder = Some(Box::new(f));
            link
        }

        pub fn queue_bytes(&self, bytes: &[u8]) {
            self.inner.lock().unwrap().rx.extend(bytes.iter().copied());
        }

        pub fn writes(&self) -> Vec<Vec<u8>> {
            self.inner.lock().unwrap().writes.clone()
        }

        pub fn write_count(&self) -> usize {
            self.inner.lock().unwrap().writes.len()
        }

        pub fn opened(&self) -> bool {
            self.inner.lock().unwrap().opened
        }
    }

    impl TransportLink for MockLink {
        fn open(&mut self) -> Result<(), TransportError> {
            self.inner.lock().unwrap().opened = true;
            Ok(())
        }

        fn close(&mut self) {
            self.inner.lock().unwrap().opened = false;
        }

        fn is_open(&self) -> bool {
            self.opened()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            let mut inner = self.inner.lock().unwrap();
            if !inner.opened {
                return Err(TransportError::NotOpen);
            }
            inner.writes.push(bytes.to_vec());
            if let Some(responder) = inner.responder.as_mut() {
                let reply = responder(bytes);
                inner.rx.extend(reply);
            }
            Ok(())
        }

        fn read_exact(&mut self, n: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
            let mut inner = self.inner.lock().unwrap();
            if inner.rx.len() < n {
                return Err(TransportError::TimedOut);
            }
            Ok(inner.rx.drain(..n).collect())
        }

        fn read_until(
            &mut self,
            predicate: &mut dyn FnMut(u8) -> bool,
            _timeout: Duration,
        ) -> Result<u8, TransportError> {
            let mut inner = self.inner.lock().unwrap();
            while let Some(byte) = inner.rx.pop_front() {
                if predicate(byte) {
                    return Ok(byte);
                }
            }
            Err(TransportError::TimedOut)
        }
    }

    #[derive(Default)]
    struct MockBusInner {
        rx: VecDeque<(u32, [u8; 8])>,
        sent: Vec<(u32, [u8; 8])>,
        opened: bool,
        responder: Option<FrameResponder>,
    }

    /// Scripted CAN bus double.
    #[derive(Clone, Default)]
    pub(crate) struct MockBus {
        inner: Arc<Mutex<MockBusInner>>,
    }

    impl MockBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(
            f: impl FnMut(u32, [u8; 8]) -> Vec<(u32, [u8; 8])> + Send + 'static,
        ) -> Self {
            let bus = Self::new();
            bus.inner.lock().unwrap().responder = Some(Box::new(f));
            bus
        }

        pub fn queue_frame(&self, id: u32, data: [u8; 8]) {
            self.inner.lock().unwrap().rx.push_back((id, data));
        }

        pub fn sent(&self) -> Vec<(u32, [u8; 8])> {
            self.inner.lock().unwrap().sent.clone()
        }

        pub fn opened(&self) -> bool {
            self.inner.lock().unwrap().opened
        }
    }

    impl FrameBus for MockBus {
        fn open(&mut self) -> Result<(), TransportError> {
            self.inner.lock().unwrap().opened = true;
            Ok(())
        }

        fn close(&mut self) {
            self.inner.lock().unwrap().opened = false;
        }

        fn is_open(&self) -> bool {
            self.opened()
        }

        fn send(&mut self, id: u32, data: [u8; 8]) -> Result<(), TransportError> {
            let mut inner = self.inner.lock().unwrap();
            if !inner.opened {
                return Err(TransportError::NotOpen);
            }
            inner.sent.push((id, data));
            if let Some(responder) = inner.responder.as_mut() {
                let frames = responder(id, data);
                inner.rx.extend(frames);
            }
            Ok(())
        }

        fn recv(&mut self, id: u32, _timeout: Duration) -> Result<[u8; 8], TransportError> {
            let mut inner = self.inner.lock().unwrap();
            while let Some((frame_id, data)) = inner.rx.pop_front() {
                if frame_id == id {
                    return Ok(data);
                }
            }
            Err(TransportError::TimedOut)
        }
    }

    #[test]
    fn test_serial_can_bridge_round_trip() {
        let raw = MockLink::new();
        let mut bridge = SerialCanBridge::new(Box::new(raw.clone()));
        bridge.open().unwrap();

        bridge.send(0x7E0, [0x02, 0x10, 0x03, 0, 0, 0, 0, 0]).unwrap();
        let writes = raw.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(
            writes[0],
            vec![12, 0x07, 0xE0, 0x02, 0x10, 0x03, 0, 0, 0, 0, 0]
        );

        // Queue a response frame with leading garbage and a frame for
        // another id; recv must skip both.
        raw.queue_bytes(&[0xFF, 0x00]);
        raw.queue_bytes(&[12, 0x06, 0x00, 1, 2, 3, 4, 5, 6, 7, 8]);
        raw.queue_bytes(&[12, 0x07, 0xE8, 0x02, 0x50, 0x03, 0, 0, 0, 0, 0]);

        let data = bridge.recv(0x7E8, Duration::from_millis(100)).unwrap();
        assert_eq!(data, [0x02, 0x50, 0x03, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_bridge_rejects_extended_id() {
        let mut bridge = SerialCanBridge::new(Box::new(MockLink::new()));
        bridge.open().unwrap();
        assert!(matches!(
            bridge.send(0x800, [0; 8]),
            Err(TransportError::InvalidId(0x800))
        ));
    }
}
