//! Bit exact framing of the link and HCI layers.
//!
//! Every outbound frame is assembled in place behind a five byte link header. All integers inside
//! HCI frames are little endian, except the link header length and socket addresses, which use
//! network order.

use core::net::{Ipv4Addr, SocketAddrV4};

use crate::{WlanError, WlanResult};

/// Largest payload of a single data frame.
pub const MAX_PAYLOAD: usize = 1468;
/// Size of the outbound frame buffer.
pub const TX_BUFFER_SIZE: usize = 1520;
/// Size of the inbound frame buffer.
pub const RX_BUFFER_SIZE: usize = 1520;
/// Largest argument block a command carries. Its length travels in a single byte.
pub const MAX_ARGS: usize = 255;
/// Longest host name the peer resolves.
pub const MAX_HOSTNAME_LEN: usize = 230;

pub(crate) const SPI_HEADER_SIZE: usize = 5;
pub(crate) const COMMAND_HEADER_SIZE: usize = 4;
pub(crate) const DATA_HEADER_SIZE: usize = 5;
pub(crate) const EVENT_HEADER_SIZE: usize = 5;
pub(crate) const PATCH_HEADER_SIZE: usize = 6;
pub(crate) const PATCH_PORTION_HEADER_SIZE: usize = 2;
pub(crate) const PATCH_PORTION_SIZE: usize = 1000;

pub(crate) const SPI_OP_WRITE: u8 = 1;
pub(crate) const SPI_OP_READ: u8 = 3;
/// Sent by the host to clock in the header of an inbound frame.
pub(crate) const READ_HEADER: [u8; SPI_HEADER_SIZE] = [SPI_OP_READ, 0, 0, 0, 0];

pub(crate) const TYPE_COMMAND: u8 = 1;
pub(crate) const TYPE_DATA: u8 = 2;
pub(crate) const TYPE_PATCH: u8 = 3;
pub(crate) const TYPE_EVENT: u8 = 4;

/// Peer status reported for a socket it no longer considers open.
pub const ERROR_SOCKET_INACTIVE: i32 = -57;
/// Generic peer failure.
pub const SOC_ERROR: i32 = -1;
/// Returned by a non blocking accept, which has no connection yet.
pub const SOC_IN_PROGRESS: i32 = -2;

/// Address family of every socket address on the wire.
pub const AF_INET: u16 = 2;
pub(crate) const SOCKADDR_SIZE: usize = 8;

/// Opcodes shared by commands and their replies.
pub mod opcode {
    pub const WLAN_CONNECT: u16 = 0x0001;
    pub const WLAN_DISCONNECT: u16 = 0x0002;
    pub const WLAN_SET_SCAN_PARAMS: u16 = 0x0003;
    pub const WLAN_SET_CONNECTION_POLICY: u16 = 0x0004;
    pub const WLAN_ADD_PROFILE: u16 = 0x0005;
    pub const WLAN_DEL_PROFILE: u16 = 0x0006;
    pub const WLAN_GET_SCAN_RESULTS: u16 = 0x0007;
    pub const EVENT_MASK: u16 = 0x0008;
    pub const WLAN_STATUS_GET: u16 = 0x0009;
    pub const WLAN_SMART_CONFIG_START: u16 = 0x000A;
    pub const WLAN_SMART_CONFIG_STOP: u16 = 0x000B;
    pub const WLAN_SMART_CONFIG_SET_PREFIX: u16 = 0x000C;

    pub const PATCHES_REQUEST: u16 = 0x1000;
    pub const SOCKET: u16 = 0x1001;
    pub const BIND: u16 = 0x1002;
    pub const SEND: u16 = 0x1003;
    pub const RECV: u16 = 0x1004;
    pub const ACCEPT: u16 = 0x1005;
    pub const LISTEN: u16 = 0x1006;
    pub const CONNECT: u16 = 0x1007;
    pub const SELECT: u16 = 0x1008;
    pub const SET_SOCK_OPT: u16 = 0x1009;
    pub const GET_SOCK_OPT: u16 = 0x100A;
    pub const CLOSE_SOCKET: u16 = 0x100B;
    pub const RECV_FROM: u16 = 0x100D;
    pub const SEND_TO: u16 = 0x100F;
    pub const GET_HOST_BY_NAME: u16 = 0x1010;
    pub const MDNS_ADVERTISE: u16 = 0x1011;

    pub const NETAPP_DHCP: u16 = 0x2001;
    pub const NETAPP_PING_SEND: u16 = 0x2002;
    pub const NETAPP_PING_REPORT: u16 = 0x2003;
    pub const NETAPP_PING_STOP: u16 = 0x2004;
    pub const NETAPP_IP_CONFIG: u16 = 0x2005;
    pub const NETAPP_ARP_FLUSH: u16 = 0x2006;
    pub const NETAPP_SET_TIMERS: u16 = 0x2009;

    pub const NVMEM_READ: u16 = 0x0201;
    pub const READ_SP_VERSION: u16 = 0x0207;

    pub const SIMPLE_LINK_START: u16 = 0x4000;
    pub const READ_BUFFER_SIZE: u16 = 0x400B;
    pub const DATA_UNSOL_FREE_BUFF: u16 = 0x4100;

    pub const UNSOL_BASE: u16 = 0x4000;
    pub const UNSOL_CONNECT: u16 = 0x8001;
    pub const UNSOL_DISCONNECT: u16 = 0x8002;
    pub const UNSOL_INIT: u16 = 0x8004;
    pub const TX_COMPLETE: u16 = 0x8008;
    pub const UNSOL_DHCP: u16 = 0x8010;
    pub const ASYNC_PING_REPORT: u16 = 0x8040;
    pub const ASYNC_SMART_CONFIG_DONE: u16 = 0x8080;
    pub const KEEPALIVE: u16 = 0x8200;
    pub const TCP_CLOSE_WAIT: u16 = 0x8800;
}

/// Opcodes of data frames.
pub mod data_opcode {
    pub const SEND: u8 = 0x81;
    pub const SEND_TO: u8 = 0x83;
    pub const RECV_FROM: u8 = 0x84;
    pub const RECV: u8 = 0x85;
    pub const NVMEM: u8 = 0x91;
}

/// Little endian argument builder for command and data frames.
///
/// A builder that ran out of room reports a length of `MAX_ARGS + 1`, which
/// [ensure_args_fit] refuses, so an overlong block never reaches the peer cut short.
pub(crate) struct Args {
    buf: [u8; MAX_ARGS + 1],
    len: usize,
}
impl Args {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_ARGS + 1],
            len: 0,
        }
    }
    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }
    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }
    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.bytes(&value.to_le_bytes())
    }
    /// Appends raw bytes. Anything past [MAX_ARGS] marks the builder as overflowed.
    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        if self.len + bytes.len() > MAX_ARGS {
            self.len = MAX_ARGS + 1;
            return self;
        }
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        self
    }
    /// Appends an address least significant byte first, the way events carry them.
    pub fn ipv4(&mut self, addr: Ipv4Addr) -> &mut Self {
        let [a, b, c, d] = addr.octets();
        self.bytes(&[d, c, b, a])
    }
    pub fn sockaddr(&mut self, addr: &SocketAddrV4) -> &mut Self {
        self.bytes(&encode_sockaddr(addr))
    }
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Refuse an argument block, whose length doesn't fit the length byte of the frame header.
pub(crate) fn ensure_args_fit(args: &[u8]) -> WlanResult<()> {
    if args.len() > MAX_ARGS {
        return Err(WlanError::InvalidArgument);
    }
    Ok(())
}

/// Encode a socket address the way the peer expects it.
pub fn encode_sockaddr(addr: &SocketAddrV4) -> [u8; SOCKADDR_SIZE] {
    let mut out = [0; SOCKADDR_SIZE];
    out[..2].copy_from_slice(&AF_INET.to_le_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..].copy_from_slice(&addr.ip().octets());
    out
}
/// Decode a socket address as returned by accept and recvfrom.
pub fn decode_sockaddr(bytes: &[u8]) -> Option<SocketAddrV4> {
    let bytes: &[u8; SOCKADDR_SIZE] = bytes.get(..SOCKADDR_SIZE)?.try_into().ok()?;
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Some(SocketAddrV4::new(ip, port))
}

/// Writes the link header for an HCI frame of `hci_len` bytes and returns the total length.
///
/// The link needs an even transfer, so an even HCI length gets one padding byte.
fn finish_link_header(out: &mut [u8], hci_len: usize) -> usize {
    let padded = hci_len | 1;
    if padded != hci_len {
        out[SPI_HEADER_SIZE + hci_len] = 0;
    }
    out[0] = SPI_OP_WRITE;
    out[1..3].copy_from_slice(&(padded as u16).to_be_bytes());
    out[3] = 0;
    out[4] = 0;
    SPI_HEADER_SIZE + padded
}

/// Assembles a command frame in `out`.
///
/// `out` must hold the link header, the command header, the arguments and a padding byte.
pub(crate) fn encode_command(out: &mut [u8], opcode: u16, args: &[u8]) -> usize {
    let hci = &mut out[SPI_HEADER_SIZE..];
    hci[0] = TYPE_COMMAND;
    hci[1..3].copy_from_slice(&opcode.to_le_bytes());
    hci[3] = args.len() as u8;
    hci[COMMAND_HEADER_SIZE..COMMAND_HEADER_SIZE + args.len()].copy_from_slice(args);
    finish_link_header(out, COMMAND_HEADER_SIZE + args.len())
}

/// Assembles a data frame in `out`. `trailer` follows the payload and is counted as part of it.
pub(crate) fn encode_data(
    out: &mut [u8],
    opcode: u8,
    args: &[u8],
    payload: &[u8],
    trailer: &[u8],
) -> usize {
    let body_len = args.len() + payload.len() + trailer.len();
    let hci = &mut out[SPI_HEADER_SIZE..];
    hci[0] = TYPE_DATA;
    hci[1] = opcode;
    hci[2] = args.len() as u8;
    hci[3..5].copy_from_slice(&(body_len as u16).to_le_bytes());
    let mut offset = DATA_HEADER_SIZE;
    for part in [args, payload, trailer] {
        hci[offset..offset + part.len()].copy_from_slice(part);
        offset += part.len();
    }
    finish_link_header(out, offset)
}

/// Assembles the first frame of a patch upload. Returns the frame length and the amount of patch
/// bytes it carries.
pub(crate) fn encode_patch_head(out: &mut [u8], kind: u8, patch: &[u8]) -> (usize, usize) {
    let portion = patch.len().min(PATCH_PORTION_SIZE);
    let total = if patch.len() <= PATCH_PORTION_SIZE {
        patch.len() + PATCH_PORTION_HEADER_SIZE
    } else {
        let follow_ups = patch.len() / PATCH_PORTION_SIZE;
        patch.len() + PATCH_PORTION_HEADER_SIZE + follow_ups * PATCH_PORTION_HEADER_SIZE
    };
    let hci = &mut out[SPI_HEADER_SIZE..];
    hci[0] = TYPE_PATCH;
    hci[1] = kind;
    hci[2..4].copy_from_slice(&(total as u16).to_le_bytes());
    hci[4..6].copy_from_slice(&(portion as u16).to_le_bytes());
    hci[PATCH_HEADER_SIZE..PATCH_HEADER_SIZE + portion].copy_from_slice(&patch[..portion]);
    (finish_link_header(out, PATCH_HEADER_SIZE + portion), portion)
}

/// Assembles a follow up portion of a patch upload.
pub(crate) fn encode_patch_portion(out: &mut [u8], portion: &[u8]) -> usize {
    let hci = &mut out[SPI_HEADER_SIZE..];
    hci[..2].copy_from_slice(&(portion.len() as u16).to_le_bytes());
    hci[PATCH_PORTION_HEADER_SIZE..PATCH_PORTION_HEADER_SIZE + portion.len()]
        .copy_from_slice(portion);
    finish_link_header(out, PATCH_PORTION_HEADER_SIZE + portion.len())
}

/// Length of the payload announced by the header of an inbound transfer.
///
/// The host always clocks an odd number of bytes, so the total transfer stays even.
pub(crate) fn inbound_payload_len(header: &[u8; SPI_HEADER_SIZE]) -> usize {
    u16::from_be_bytes([header[3], header[4]]) as usize | 1
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    bytes
        .get(offset..offset + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .unwrap_or_default()
}
pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or_default()
}
pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    read_u32(bytes, offset) as i32
}
/// Copies `N` bytes at `offset`, zero filling whatever is missing.
pub(crate) fn read_array<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0; N];
    if let Some(src) = bytes.get(offset..) {
        let take = src.len().min(N);
        out[..take].copy_from_slice(&src[..take]);
    }
    out
}
/// Addresses inside event parameters are stored least significant byte first.
pub(crate) fn read_ipv4(bytes: &[u8], offset: usize) -> Ipv4Addr {
    let [a, b, c, d] = read_array::<4>(bytes, offset);
    Ipv4Addr::new(d, c, b, a)
}

/// A borrowed view of an inbound event frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct EventFrame<'a> {
    pub opcode: u16,
    pub status: u8,
    pub params: &'a [u8],
}
impl<'a> EventFrame<'a> {
    /// Parse an event frame, rejecting it if the declared length exceeds the received bytes.
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < EVENT_HEADER_SIZE || packet[0] != TYPE_EVENT {
            return None;
        }
        let len = packet[3] as usize;
        if EVENT_HEADER_SIZE - 1 + len > packet.len() {
            return None;
        }
        let end = (EVENT_HEADER_SIZE - 1 + len).max(EVENT_HEADER_SIZE);
        Some(Self {
            opcode: read_u16(packet, 1),
            status: packet[4],
            params: &packet[EVENT_HEADER_SIZE..end],
        })
    }
}

/// A borrowed view of an inbound data frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DataFrame<'a> {
    pub opcode: u8,
    pub args: &'a [u8],
    pub payload: &'a [u8],
}
impl<'a> DataFrame<'a> {
    pub fn parse(packet: &'a [u8]) -> Option<Self> {
        if packet.len() < DATA_HEADER_SIZE || packet[0] != TYPE_DATA {
            return None;
        }
        let arg_size = packet[2] as usize;
        let body_len = read_u16(packet, 3) as usize;
        if body_len <= arg_size || DATA_HEADER_SIZE + body_len > packet.len() {
            return None;
        }
        let body = &packet[DATA_HEADER_SIZE..DATA_HEADER_SIZE + body_len];
        Some(Self {
            opcode: packet[1],
            args: &body[..arg_size],
            payload: &body[arg_size..],
        })
    }
}
