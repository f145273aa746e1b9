//! Raw `AF_PACKET` implementation of [`RadioLink`]: encapsulation into an
//! 802.11 data frame carrying a proprietary header, and the inverse on
//! receive. It exists so the engine has something real to drive; the
//! engine itself never looks past the [`RadioLink`] trait.
//!
//! Framing: `[minimal radiotap][minimal 802.11 data header][comm_id][port
//! tag][sequence][payload]`. When `offset_80211` is set the proprietary
//! header and payload are appended after the 802.11 header only (radiotap
//! dropped from the prefix) — a payload-outside-the-802.11-header mode for
//! kernels that don't strip it.
//!
//! Each adapter opens two of these, one per [`super::AdapterEndpoint`]
//! handle, each bound with its own `rx_port`. Both sockets see every frame
//! the kernel delivers on this ethertype/interface (there is no kernel-side
//! BPF split here), so `recv` discards any frame not tagged for its own
//! handle's `rx_port` — the same two-handle-per-adapter shape as
//! `control_main_air.c`'s `raw_interfaces_rc`/`raw_interfaces_telem`, each
//! its own socket and its own `FD_ISSET` branch.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use super::radiotap;
use super::{LogicalPort, RadioLink, RxFrame};
use crate::config::FrameType;

const ETH_P_DRONEBRIDGE: u16 = 0x88ab;
const RADIOTAP_HEADER_LEN: usize = 8;
const IEEE80211_HEADER_LEN: usize = 24;
const DB_HEADER_LEN: usize = 3; // comm_id, port tag, sequence
const RECV_BUF_SIZE: usize = 2048;

fn port_tag(port: LogicalPort) -> u8 {
    match port {
        LogicalPort::Rc => 0,
        LogicalPort::Controller => 1,
        LogicalPort::Proxy => 2,
        LogicalPort::Status => 3,
    }
}

fn tag_port(tag: u8) -> Option<LogicalPort> {
    match tag {
        0 => Some(LogicalPort::Rc),
        1 => Some(LogicalPort::Controller),
        2 => Some(LogicalPort::Proxy),
        3 => Some(LogicalPort::Status),
        _ => None,
    }
}

/// One raw `AF_PACKET` socket bound to an adapter, tagged with the comm id
/// and 802.11 framing options negotiated at startup, and scoped to one
/// logical-port handle (`rx_port`) of the adapter's [`super::AdapterEndpoint`].
pub struct AfPacketRadioLink {
    name: String,
    fd: RawFd,
    comm_id: u8,
    frame_type: FrameType,
    offset_80211: bool,
    rx_port: LogicalPort,
    scratch: Vec<u8>,
}

impl AfPacketRadioLink {
    /// Open a raw socket on `iface` in monitor mode, scoped to `rx_port`:
    /// `recv` only delivers frames tagged for that port, dropping the
    /// other handle's traffic as if it were never received. Fatal on
    /// failure — unlike serial, there's no reasonable retry-and-wait story
    /// for a missing wireless adapter.
    pub fn open(
        iface: &str,
        comm_id: u8,
        frame_type: FrameType,
        offset_80211: bool,
        rx_port: LogicalPort,
    ) -> io::Result<Self> {
        let ifindex = interface_index(iface)?;

        // SAFETY: libc::socket with well-formed, constant arguments; the
        // returned fd is checked for -1 before use.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (ETH_P_DRONEBRIDGE as u16).to_be() as i32) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
        sll.sll_family = libc::AF_PACKET as u16;
        sll.sll_protocol = (ETH_P_DRONEBRIDGE as u16).to_be();
        sll.sll_ifindex = ifindex;

        let bind_res = unsafe {
            libc::bind(
                fd,
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if bind_res < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }

        set_nonblocking(fd)?;

        Ok(AfPacketRadioLink {
            name: iface.to_string(),
            fd,
            comm_id,
            frame_type,
            offset_80211,
            rx_port,
            scratch: vec![0u8; RECV_BUF_SIZE],
        })
    }

    fn prefix_len(&self) -> usize {
        if self.offset_80211 {
            IEEE80211_HEADER_LEN
        } else {
            RADIOTAP_HEADER_LEN + IEEE80211_HEADER_LEN
        }
    }

    fn write_prefix(&self, out: &mut Vec<u8>) {
        if !self.offset_80211 {
            out.extend_from_slice(&[0u8, 0, RADIOTAP_HEADER_LEN as u8, 0, 0, 0, 0, 0]);
        }
        // Minimal 802.11 data-frame header. Subtype reflects the
        // configured frame type (RTS protection vs plain DATA); real
        // duration/address fields are beyond the scope of this bridge.
        let subtype: u8 = match self.frame_type {
            FrameType::Rts => 0xb4, // control frame, RTS
            FrameType::Data => 0x08, // data frame
        };
        out.extend_from_slice(&[subtype, 0]); // frame control
        out.extend_from_slice(&[0, 0]); // duration
        out.extend_from_slice(&[0u8; 6]); // addr1
        out.extend_from_slice(&[0u8; 6]); // addr2
        out.extend_from_slice(&[0u8; 6]); // addr3
        out.extend_from_slice(&[0, 0]); // seq ctrl
    }
}

impl Drop for AfPacketRadioLink {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl RadioLink for AfPacketRadioLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn recv(&mut self) -> io::Result<Option<RxFrame>> {
        let n = unsafe {
            libc::recv(
                self.fd,
                self.scratch.as_mut_ptr() as *mut libc::c_void,
                self.scratch.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        let n = n as usize;
        let buf = &self.scratch[..n];

        let radiotap_len = if self.offset_80211 {
            0
        } else {
            if n < 4 {
                return Ok(None);
            }
            u16::from_le_bytes([buf[2], buf[3]]) as usize
        };
        let prefix = self.prefix_len();
        if n < prefix + DB_HEADER_LEN {
            return Ok(None);
        }

        let rssi = if radiotap_len > 0 {
            radiotap::extract_rssi(buf, radiotap_len)
        } else {
            0
        };

        let comm_id = buf[prefix];
        if comm_id != self.comm_id {
            return Ok(None);
        }
        let port = match tag_port(buf[prefix + 1]) {
            Some(p) => p,
            None => return Ok(None),
        };
        if port != self.rx_port {
            // Belongs to the adapter's other handle (no kernel-side BPF
            // split between the rc and control sockets); not ours.
            return Ok(None);
        }
        let seq = buf[prefix + 2];
        let payload = buf[prefix + DB_HEADER_LEN..].to_vec();

        Ok(Some(RxFrame { port, seq, payload, rssi }))
    }

    fn send(&mut self, port: LogicalPort, seq: u8, payload: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(self.prefix_len() + DB_HEADER_LEN + payload.len());
        self.write_prefix(&mut out);
        out.push(self.comm_id);
        out.push(port_tag(port));
        out.push(seq);
        out.extend_from_slice(payload);

        let n = unsafe { libc::send(self.fd, out.as_ptr() as *const libc::c_void, out.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }
}

fn interface_index(iface: &str) -> io::Result<i32> {
    let cname = CString::new(iface)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(idx as i32)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
