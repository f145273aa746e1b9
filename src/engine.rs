//! The bidirectional multiplexing engine: the event loop, uplink and
//! downlink pipelines, and status beacon wired together over a
//! [`RadioLink`] per adapter and the control/RC serial endpoints.
//!
//! `Engine::run` is a plain loop with no spawned threads: single-threaded
//! cooperative scheduling, with the only suspension point being the
//! `poll(2)` readiness wait in [`Engine::pass`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::beacon::Beacon;
use crate::config::{Config, SerialProtocol, BEACON_PERIOD_MS, RETRANSMISSION_RATE};
use crate::dedup::StreamCursor;
use crate::error::DbError;
use crate::framing::{Fed, FrameParser, MavFrameParser, MspFrameParser};
use crate::rc_encode::{encode_rc, RcProtocol};
use crate::rc_shm::RcChannelPublisher;
use crate::seq::TxSequence;
use crate::serial::{SerialEndpoint, SerialLink, SerialRole};
use crate::transport::af_packet::AfPacketRadioLink;
use crate::transport::{AdapterEndpoint, LogicalPort, RxFrame};

/// Per-protocol downlink state. Each variant owns exactly the scratch
/// buffers that protocol needs.
enum Downlink {
    Msp { parser: MspFrameParser, msg_buf: Vec<u8> },
    Mavlink { parser: MavFrameParser, chunk_scratch: Vec<u8> },
    Transparent { buf: Vec<u8>, chunk_size: usize },
}

impl Downlink {
    fn new(protocol: SerialProtocol, chunk_size: usize) -> Self {
        match protocol {
            SerialProtocol::MspV1 | SerialProtocol::MspV2 => {
                Downlink::Msp { parser: MspFrameParser::new(), msg_buf: Vec::new() }
            }
            SerialProtocol::MavLinkV1 | SerialProtocol::MavLinkV2 => {
                Downlink::Mavlink { parser: MavFrameParser::new(), chunk_scratch: vec![0u8; chunk_size] }
            }
            SerialProtocol::MavLinkTransparent => Downlink::Transparent { buf: Vec::new(), chunk_size },
        }
    }
}

pub struct Engine {
    config: Config,
    adapters: Vec<AdapterEndpoint>,
    control_serial: Box<dyn SerialLink>,
    rc_serial: Option<Box<dyn SerialLink>>,
    last_rc_seq: StreamCursor,
    last_control_seq: StreamCursor,
    proxy_seq: TxSequence,
    status_seq: TxSequence,
    rssi: i8,
    beacon: Beacon,
    rc_publisher: RcChannelPublisher,
    downlink: Downlink,
    run_flag: Arc<AtomicBool>,
    /// Frames emitted on the proxy port, recorded for tests only (unit
    /// tests assert against this instead of a real radio).
    #[cfg(test)]
    emitted: Vec<(LogicalPort, u8, Vec<u8>)>,
}

impl Engine {
    pub fn new(
        config: Config,
        adapters: Vec<AdapterEndpoint>,
        control_serial: Box<dyn SerialLink>,
        rc_serial: Option<Box<dyn SerialLink>>,
        run_flag: Arc<AtomicBool>,
    ) -> Self {
        let downlink = Downlink::new(config.serial_protocol, config.chunk_size);
        Engine {
            config,
            adapters,
            control_serial,
            rc_serial,
            last_rc_seq: StreamCursor::new(),
            last_control_seq: StreamCursor::new(),
            proxy_seq: TxSequence::new(),
            status_seq: TxSequence::new(),
            rssi: 0,
            beacon: Beacon::new(),
            rc_publisher: RcChannelPublisher::new(),
            downlink,
            run_flag,
            #[cfg(test)]
            emitted: Vec::new(),
        }
    }

    /// Open real `AF_PACKET` radio links and retry-opened serial
    /// endpoints for `config`. Radio socket open failure is fatal;
    /// serial open failure retries forever.
    pub fn bootstrap(config: Config, run_flag: Arc<AtomicBool>) -> Result<Engine, DbError> {
        let mut adapters: Vec<AdapterEndpoint> = Vec::with_capacity(config.adapters.len());
        for name in &config.adapters {
            let rc = AfPacketRadioLink::open(
                name,
                config.comm_id,
                config.frame_type,
                config.offset_80211,
                LogicalPort::Rc,
            )
            .map_err(|source| DbError::RadioOpen { adapter: name.clone(), source })?;
            let control = AfPacketRadioLink::open(
                name,
                config.comm_id,
                config.frame_type,
                config.offset_80211,
                LogicalPort::Controller,
            )
            .map_err(|source| DbError::RadioOpen { adapter: name.clone(), source })?;
            adapters.push(AdapterEndpoint::new(name.clone(), Box::new(rc), Box::new(control)));
        }

        let control_serial: Box<dyn SerialLink> =
            Box::new(SerialEndpoint::open_with_retry(&config.control_serial_path, config.baud, SerialRole::Control));

        let rc_serial: Option<Box<dyn SerialLink>> = if config.use_sumd {
            Some(Box::new(SerialEndpoint::open_with_retry(&config.rc_serial_path, 115_200, SerialRole::Rc)))
        } else {
            None
        };

        Ok(Engine::new(config, adapters, control_serial, rc_serial, run_flag))
    }

    /// Run until the termination signal flips `run_flag`, then return.
    pub fn run(&mut self) {
        while self.run_flag.load(Ordering::Relaxed) {
            self.pass();
        }
    }

    /// One event-loop pass: wait for readiness (bounded to the beacon
    /// period) on every adapter's RC-port handle, every adapter's
    /// control-port handle, and the control-serial line; service ready
    /// descriptors in priority order (RC uplink, then control uplink, then
    /// serial downlink); then unconditionally run the status beacon.
    pub fn pass(&mut self) {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(self.adapters.len() * 2 + 1);
        for ep in &self.adapters {
            pollfds.push(libc::pollfd { fd: ep.rc.raw_fd(), events: libc::POLLIN, revents: 0 });
            pollfds.push(libc::pollfd { fd: ep.control.raw_fd(), events: libc::POLLIN, revents: 0 });
        }
        let serial_idx = pollfds.len();
        pollfds.push(libc::pollfd { fd: self.control_serial.raw_fd(), events: libc::POLLIN, revents: 0 });

        let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, BEACON_PERIOD_MS as i32) };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                log::warn!("poll() failed: {err}");
            }
        } else if n > 0 {
            let mut rc_frames = Vec::new();
            let mut control_frames = Vec::new();

            for (i, ep) in self.adapters.iter_mut().enumerate() {
                let rc_idx = i * 2;
                if pollfds[rc_idx].revents & libc::POLLIN != 0 {
                    match ep.rc.recv() {
                        Ok(Some(frame)) => rc_frames.push(frame),
                        Ok(None) => {}
                        Err(e) => log::warn!("radio read error on '{}' (rc): {e}", ep.name),
                    }
                }

                let control_idx = rc_idx + 1;
                if pollfds[control_idx].revents & libc::POLLIN != 0 {
                    match ep.control.recv() {
                        Ok(Some(frame)) => control_frames.push(frame),
                        Ok(None) => {}
                        Err(e) => log::warn!("radio read error on '{}' (control): {e}", ep.name),
                    }
                }
            }

            for frame in &rc_frames {
                self.process_rc_frame(frame);
            }
            for frame in &control_frames {
                self.process_control_frame(frame);
            }

            if pollfds[serial_idx].revents & libc::POLLIN != 0 {
                self.service_control_serial();
            }
        }

        self.run_beacon();
    }

    /// Uplink pipeline, RC port. RSSI is stashed unconditionally; dedup
    /// and encode/write only happen on a fresh sequence number.
    pub fn process_rc_frame(&mut self, frame: &RxFrame) {
        self.rssi = frame.rssi;

        if !self.last_rc_seq.accept(frame.seq) {
            return;
        }
        self.beacon.record_rc_packet();

        let protocol = if self.config.use_sumd { RcProtocol::Sumd } else { RcProtocol::Passthrough };
        let wire = encode_rc(&frame.payload, protocol);

        if self.config.use_sumd {
            if let Some(rc_serial) = self.rc_serial.as_mut() {
                rc_serial.write_frame(&wire);
            }
        } else {
            self.control_serial.write_frame(&wire);
        }

        self.rc_publisher.publish(&frame.payload);
    }

    /// Uplink pipeline, control port.
    pub fn process_control_frame(&mut self, frame: &RxFrame) {
        self.rssi = frame.rssi;

        if !self.last_control_seq.accept(frame.seq) {
            return;
        }
        self.control_serial.write_frame(&frame.payload);
    }

    /// Downlink pipeline: drain whatever is currently buffered on the
    /// control-serial line and feed it byte-by-byte to the configured
    /// protocol's framer.
    fn service_control_serial(&mut self) {
        let bytes = match self.control_serial.read_available() {
            Ok(b) => b,
            Err(e) => {
                log::warn!("control-serial read error: {e}");
                return;
            }
        };

        for byte in bytes {
            self.feed_downlink_byte(byte);
        }
    }

    fn feed_downlink_byte(&mut self, byte: u8) {
        match &mut self.downlink {
            Downlink::Msp { parser, msg_buf } => match parser.feed(byte) {
                // Garbage seen before a preamble: never buffered, so it
                // can't leak into the next genuinely complete message.
                Fed::Idle => {}
                Fed::Pending => msg_buf.push(byte),
                Fed::Complete => {
                    msg_buf.push(byte);
                    let message = std::mem::take(msg_buf);
                    self.flush_proxy_frame(message);
                }
                Fed::Rejected => msg_buf.clear(),
            },
            Downlink::Mavlink { parser, chunk_scratch } => {
                if let Fed::Complete = parser.feed(byte) {
                    let message = parser.take_frame();
                    let chunk_size = chunk_scratch.len();
                    let len = message.len().min(chunk_size);
                    // Zero the whole scratch buffer first: a shorter
                    // message must not leave a previous, longer message's
                    // tail bytes behind as "padding".
                    chunk_scratch.iter_mut().for_each(|b| *b = 0);
                    chunk_scratch[..len].copy_from_slice(&message[..len]);
                    let chunk = chunk_scratch.clone();
                    self.flush_proxy_frame(chunk);
                }
            }
            Downlink::Transparent { buf, chunk_size } => {
                buf.push(byte);
                if buf.len() == *chunk_size {
                    let chunk = std::mem::take(buf);
                    for _ in 0..RETRANSMISSION_RATE {
                        self.flush_proxy_frame(chunk.clone());
                    }
                }
            }
        }
    }

    /// Advance the proxy sequence exactly once and fan the frame out to
    /// every adapter, so every adapter carries the same sequence number
    /// for a given logical message.
    fn flush_proxy_frame(&mut self, payload: Vec<u8>) {
        let seq = self.proxy_seq.next();
        self.broadcast(LogicalPort::Proxy, seq, &payload);
    }

    fn run_beacon(&mut self) {
        if let Some(frame) = self.beacon.tick(self.rssi) {
            let seq = self.status_seq.next();
            let bytes = frame.to_bytes();
            self.broadcast(LogicalPort::Status, seq, &bytes);
        }
    }

    /// Air -> ground frames (Proxy/Status) go out on each adapter's
    /// control handle, mirroring `control_main_air.c`'s use of
    /// `raw_interfaces_telem[i]` for both control-port receive and
    /// proxy/status transmit.
    fn broadcast(&mut self, port: LogicalPort, seq: u8, payload: &[u8]) {
        #[cfg(test)]
        self.emitted.push((port, seq, payload.to_vec()));

        for ep in self.adapters.iter_mut() {
            if let Err(e) = ep.control.send(port, seq, payload) {
                log::warn!("send on '{}' failed: {e}", ep.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Args, FrameType};
    use crate::transport::RadioLink;
    use std::cell::RefCell;
    use std::os::unix::io::RawFd;
    use std::rc::Rc;

    struct MockRadio {
        name: String,
    }

    impl RadioLink for MockRadio {
        fn name(&self) -> &str {
            &self.name
        }
        fn raw_fd(&self) -> RawFd {
            -1
        }
        fn recv(&mut self) -> io::Result<Option<RxFrame>> {
            Ok(None)
        }
        fn send(&mut self, _port: LogicalPort, _seq: u8, _payload: &[u8]) -> io::Result<usize> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct MockSerial {
        written: Rc<RefCell<Vec<Vec<u8>>>>,
        pending_reads: Vec<u8>,
    }

    impl SerialLink for MockSerial {
        fn raw_fd(&self) -> RawFd {
            -1
        }
        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            Ok(std::mem::take(&mut self.pending_reads))
        }
        fn write_frame(&mut self, data: &[u8]) {
            self.written.borrow_mut().push(data.to_vec());
        }
    }

    fn base_config(serial_protocol: u8, chunk_size: usize) -> Config {
        Config::from_args(Args {
            adapters: vec!["wlan0".into(), "wlan1".into()],
            control_serial_path: "/dev/ttyFC".into(),
            rc_serial_path: "/dev/ttyRC".into(),
            mode: 'm',
            comm_id: 1,
            serial_protocol,
            chunk_size,
            use_sumd: false,
            baud: 115_200,
            frame_type: FrameType::Data as u8,
            bitrate_option: 1,
            offset_80211: false,
        })
        .unwrap()
    }

    fn rc_frame(seq: u8) -> RxFrame {
        RxFrame { port: LogicalPort::Rc, seq, payload: vec![1, 2, 3, 4], rssi: -40 }
    }

    fn control_frame(seq: u8, payload: Vec<u8>) -> RxFrame {
        RxFrame { port: LogicalPort::Controller, seq, payload, rssi: -40 }
    }

    fn mock_engine(serial_protocol: u8, chunk_size: usize) -> (Engine, Rc<RefCell<Vec<Vec<u8>>>>) {
        let config = base_config(serial_protocol, chunk_size);
        let written = Rc::new(RefCell::new(Vec::new()));
        let control = Box::new(MockSerial { written: written.clone(), pending_reads: Vec::new() });
        let adapters: Vec<AdapterEndpoint> = vec![
            AdapterEndpoint::new(
                "wlan0",
                Box::new(MockRadio { name: "wlan0".into() }),
                Box::new(MockRadio { name: "wlan0".into() }),
            ),
            AdapterEndpoint::new(
                "wlan1",
                Box::new(MockRadio { name: "wlan1".into() }),
                Box::new(MockRadio { name: "wlan1".into() }),
            ),
        ];
        let engine = Engine::new(config, adapters, control, None, Arc::new(AtomicBool::new(true)));
        (engine, written)
    }

    #[test]
    fn rc_diversity_collapses_to_three_serial_writes() {
        let (mut engine, written) = mock_engine(2, 64);
        // Two adapters deliver overlapping copies of 10, 11, 12 in one pass.
        for seq in [10u8, 10, 11, 12, 12] {
            engine.process_rc_frame(&rc_frame(seq));
        }
        assert_eq!(written.borrow().len(), 3);
    }

    #[test]
    fn sequence_wrap_is_fully_accepted() {
        let (mut engine, written) = mock_engine(2, 64);
        for seq in [254u8, 255, 0, 1] {
            engine.process_rc_frame(&rc_frame(seq));
        }
        assert_eq!(written.borrow().len(), 4);
    }

    #[test]
    fn uplink_ordering_rc_before_control_within_one_pass() {
        let (mut engine, written) = mock_engine(2, 64);
        // Simulate what `pass()` does after bucketing: RC frames first.
        engine.process_rc_frame(&rc_frame(1));
        engine.process_control_frame(&control_frame(1, vec![9, 9]));
        let log = written.borrow();
        assert_eq!(log.len(), 2);
        // RC write (rc_encode passthrough of payload [1,2,3,4]) precedes
        // the control write ([9,9]).
        assert_eq!(log[0], vec![1, 2, 3, 4]);
        assert_eq!(log[1], vec![9, 9]);
    }

    #[test]
    fn radiotap_without_antsignal_still_delivers_payload() {
        let (mut engine, written) = mock_engine(2, 64);
        let frame = RxFrame { port: LogicalPort::Rc, seq: 5, payload: vec![7, 7], rssi: 0 };
        engine.process_rc_frame(&frame);
        assert_eq!(engine.rssi, 0);
        assert_eq!(written.borrow()[0], vec![7, 7]);
    }

    #[test]
    fn mavlink_downlink_emits_one_chunk_sized_frame() {
        let (mut engine, _written) = mock_engine(4, 64);
        let payload = vec![0xAB; 53];
        let mut frame = vec![0xFDu8, 53, 0, 0, 0, 1, 1, 0, 0, 0];
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(&[0x00, 0x00]); // dummy crc, framer doesn't validate it
        for &b in &frame {
            engine.feed_downlink_byte(b);
        }
        assert_eq!(engine.emitted.len(), 1);
        let (port, seq, data) = &engine.emitted[0];
        assert_eq!(*port, LogicalPort::Proxy);
        assert_eq!(*seq, 1);
        assert_eq!(data.len(), 64);
        assert_eq!(&data[..53], payload.as_slice());
    }

    #[test]
    fn mavlink_downlink_zero_pads_shorter_message_after_longer_one() {
        let (mut engine, _written) = mock_engine(4, 64);

        let long_payload = vec![0xABu8; 53];
        let mut long_frame = vec![0xFDu8, 53, 0, 0, 0, 1, 1, 0, 0, 0];
        long_frame.extend_from_slice(&long_payload);
        long_frame.extend_from_slice(&[0x00, 0x00]);
        for &b in &long_frame {
            engine.feed_downlink_byte(b);
        }

        let short_payload = vec![0xCDu8; 5];
        let mut short_frame = vec![0xFDu8, 5, 0, 0, 0, 2, 1, 0, 0, 0];
        short_frame.extend_from_slice(&short_payload);
        short_frame.extend_from_slice(&[0x00, 0x00]);
        for &b in &short_frame {
            engine.feed_downlink_byte(b);
        }

        assert_eq!(engine.emitted.len(), 2);
        let (_, _, second) = &engine.emitted[1];
        assert_eq!(second.len(), 64);
        assert_eq!(&second[..5], short_payload.as_slice());
        assert!(
            second[5..].iter().all(|&b| b == 0),
            "tail bytes beyond the short message must be zero, not leftover bytes from the previous message"
        );
    }

    #[test]
    fn transparent_mode_retransmits_each_chunk_twice() {
        let (mut engine, _written) = mock_engine(5, 64);
        for b in (0u16..128).map(|v| (v % 256) as u8) {
            engine.feed_downlink_byte(b);
        }
        assert_eq!(engine.emitted.len(), 4);
        assert_eq!(engine.emitted[0].1, 1);
        assert_eq!(engine.emitted[1].1, 2);
        assert_eq!(engine.emitted[2].1, 3);
        assert_eq!(engine.emitted[3].1, 4);
        assert_eq!(engine.emitted[0].2, engine.emitted[1].2);
        assert_eq!(engine.emitted[2].2, engine.emitted[3].2);
        assert_ne!(engine.emitted[0].2, engine.emitted[2].2);
    }

    #[test]
    fn msp_resync_discards_garbage_then_emits_one_frame() {
        let (mut engine, _written) = mock_engine(2, 64);
        for b in [0x00u8, 0x01, 0x02, 0x03, 0x04] {
            engine.feed_downlink_byte(b);
        }
        assert!(engine.emitted.is_empty(), "garbage should not emit a frame");

        // MSPv2 request frame: $ X < flag cmd(2LE) len(2LE) crc
        let mut msg = vec![b'$', b'X', b'<', 0, 0x01, 0, 0x00, 0x00];
        let crc = crc8_dvb_s2(&msg[3..]);
        msg.push(crc);
        for &b in &msg {
            engine.feed_downlink_byte(b);
        }
        assert_eq!(engine.emitted.len(), 1);
        let (_, _, payload) = &engine.emitted[0];
        assert_eq!(payload, &msg, "emitted frame must be exactly the MSPv2 message, with no garbage prefix");
    }

    #[test]
    fn msp_garbage_byte_that_collides_with_preamble_does_not_desync_the_next_frame() {
        // A lone '$' in the garbage run looks like a preamble but never
        // completes; it must not leave stray bytes in `msg_buf` ahead of
        // the next, genuinely complete message.
        let (mut engine, _written) = mock_engine(2, 64);
        for b in [0x00u8, b'$', 0x02] {
            engine.feed_downlink_byte(b);
        }

        let mut msg = vec![b'$', b'X', b'<', 0, 0x01, 0, 0x00, 0x00];
        let crc = crc8_dvb_s2(&msg[3..]);
        msg.push(crc);
        for &b in &msg {
            engine.feed_downlink_byte(b);
        }

        assert_eq!(engine.emitted.len(), 1);
        let (_, _, payload) = &engine.emitted[0];
        assert_eq!(payload, &msg);
    }

    fn crc8_dvb_s2(data: &[u8]) -> u8 {
        let mut crc: u8 = 0;
        for &b in data {
            crc ^= b;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ 0xD5 } else { crc << 1 };
            }
        }
        crc
    }
}
