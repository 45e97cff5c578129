//! Fixed reply layouts, decoded positionally by opcode.

use core::net::{Ipv4Addr, SocketAddrV4};

use bitfield_struct::bitfield;
use macro_bits::serializable_enum;

use crate::{
    wire::{decode_sockaddr, opcode, read_array, read_i32, read_ipv4, read_u16, read_u32, EventFrame},
    WlanError, WlanResult,
};

serializable_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    /// Security of a WLAN network.
    pub enum SecurityType: u8 {
        #[default]
        Unsecured => 0,
        Wep => 1,
        Wpa => 2,
        Wpa2 => 3
    }
}

#[bitfield(u16)]
struct ScanFlags {
    valid: bool,
    #[bits(7)]
    rssi: u8,
    #[bits(2)]
    security: u8,
    #[bits(6)]
    ssid_len: u8,
}

/// One entry of the peer's scan table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanResult {
    /// Entries left in the table, including this one.
    pub remaining: u32,
    pub status: u32,
    pub valid: bool,
    pub rssi: i8,
    pub security: SecurityType,
    pub frame_time: u16,
    pub bssid: [u8; 6],
    ssid: [u8; 32],
    ssid_len: u8,
}
impl ScanResult {
    fn parse(params: &[u8]) -> Self {
        let flags = ScanFlags::from_bits(read_u16(params, 8));
        Self {
            remaining: read_u32(params, 0),
            status: read_u32(params, 4),
            valid: flags.valid(),
            rssi: (flags.rssi() as i16 - 128) as i8,
            security: SecurityType::from_bits(flags.security()),
            frame_time: read_u16(params, 10),
            ssid: read_array(params, 12),
            ssid_len: flags.ssid_len().min(32),
            bssid: read_array(params, 44),
        }
    }
    pub fn ssid(&self) -> &[u8] {
        &self.ssid[..self.ssid_len as usize]
    }
}

/// Current interface configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpConfig {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub mac: [u8; 6],
    ssid: [u8; 32],
}
impl IpConfig {
    fn parse(params: &[u8]) -> Self {
        Self {
            ip: read_ipv4(params, 0),
            subnet_mask: read_ipv4(params, 4),
            gateway: read_ipv4(params, 8),
            dhcp_server: read_ipv4(params, 12),
            dns_server: read_ipv4(params, 16),
            mac: read_array(params, 20),
            ssid: read_array(params, 26),
        }
    }
    /// The SSID of the associated network, without trailing padding.
    pub fn ssid(&self) -> &[u8] {
        let len = self.ssid.iter().position(|b| *b == 0).unwrap_or(self.ssid.len());
        &self.ssid[..len]
    }
}

/// Reply to a readiness query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelectReply {
    pub status: i32,
    pub read: u32,
    pub write: u32,
    pub except: u32,
}

/// A decoded reply. Which variant an opcode produces never changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Empty,
    /// A signed result in the first parameter word.
    Status(i32),
    /// The status byte of the event header.
    StatusByte(u8),
    BufferSize {
        free: u8,
        length: u16,
    },
    Version {
        status: u8,
        version: [u8; 4],
    },
    HostByName {
        ret: i32,
        addr: Ipv4Addr,
    },
    Accept {
        sd: i32,
        status: i32,
        addr: Option<SocketAddrV4>,
    },
    Recv {
        sd: i32,
        bytes: i32,
        flags: u32,
    },
    Send {
        sd: i32,
        bytes: i32,
    },
    Select(SelectReply),
    SockOpt {
        status: u8,
        value: [u8; 4],
    },
    Scan(ScanResult),
    IpConfig(IpConfig),
    PatchRequest(u8),
}
impl Reply {
    /// Decode the reply layout registered for the opcode of `event`.
    pub fn decode(event: &EventFrame<'_>) -> Self {
        let params = event.params;
        match event.opcode {
            opcode::SET_SOCK_OPT
            | opcode::WLAN_CONNECT
            | opcode::WLAN_STATUS_GET
            | opcode::WLAN_ADD_PROFILE
            | opcode::WLAN_DEL_PROFILE
            | opcode::WLAN_SET_CONNECTION_POLICY
            | opcode::WLAN_SET_SCAN_PARAMS
            | opcode::WLAN_SMART_CONFIG_START
            | opcode::WLAN_SMART_CONFIG_STOP
            | opcode::WLAN_SMART_CONFIG_SET_PREFIX
            | opcode::EVENT_MASK
            | opcode::WLAN_DISCONNECT
            | opcode::SOCKET
            | opcode::BIND
            | opcode::LISTEN
            | opcode::CLOSE_SOCKET
            | opcode::CONNECT => Self::Status(read_i32(params, 0)),
            opcode::NETAPP_DHCP
            | opcode::NETAPP_PING_SEND
            | opcode::NETAPP_PING_STOP
            | opcode::NETAPP_ARP_FLUSH
            | opcode::NETAPP_SET_TIMERS
            | opcode::NVMEM_READ
            | opcode::NETAPP_PING_REPORT
            | opcode::MDNS_ADVERTISE => Self::StatusByte(event.status),
            opcode::READ_BUFFER_SIZE => Self::BufferSize {
                free: params.first().copied().unwrap_or_default(),
                length: read_u16(params, 1),
            },
            opcode::READ_SP_VERSION => Self::Version {
                status: event.status,
                version: read_array(params, 0),
            },
            opcode::GET_HOST_BY_NAME => Self::HostByName {
                ret: read_i32(params, 0),
                addr: Ipv4Addr::from(read_u32(params, 4)),
            },
            opcode::ACCEPT => Self::Accept {
                sd: read_i32(params, 0),
                status: read_i32(params, 4),
                addr: params.get(8..).and_then(decode_sockaddr),
            },
            opcode::RECV | opcode::RECV_FROM => Self::Recv {
                sd: read_i32(params, 0),
                bytes: read_i32(params, 4),
                flags: read_u32(params, 8),
            },
            opcode::SEND | opcode::SEND_TO => Self::Send {
                sd: read_i32(params, 0),
                bytes: read_i32(params, 4),
            },
            opcode::SELECT => Self::Select(SelectReply {
                status: read_i32(params, 0),
                read: read_u32(params, 4),
                write: read_u32(params, 8),
                except: read_u32(params, 12),
            }),
            opcode::GET_SOCK_OPT => Self::SockOpt {
                status: event.status,
                value: read_array(params, 0),
            },
            opcode::WLAN_GET_SCAN_RESULTS => Self::Scan(ScanResult::parse(params)),
            opcode::NETAPP_IP_CONFIG => Self::IpConfig(IpConfig::parse(params)),
            opcode::PATCHES_REQUEST => {
                Self::PatchRequest(params.first().copied().unwrap_or_default())
            }
            _ => Self::Empty,
        }
    }
    /// The result of a command, that only reports success or failure.
    pub fn into_status(self) -> WlanResult<i32> {
        match self {
            Self::Status(status) if status < 0 => Err(WlanError::Peer(status)),
            Self::Status(status) => Ok(status),
            Self::StatusByte(0) => Ok(0),
            Self::StatusByte(status) => Err(WlanError::Peer(status as i32)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TYPE_EVENT;

    fn event(opcode: u16, status: u8, params: &[u8]) -> ([u8; 80], usize) {
        let mut packet = [0u8; 80];
        packet[0] = TYPE_EVENT;
        packet[1..3].copy_from_slice(&opcode.to_le_bytes());
        packet[3] = params.len() as u8 + 1;
        packet[4] = status;
        packet[5..5 + params.len()].copy_from_slice(params);
        (packet, 5 + params.len())
    }

    #[test]
    fn accept_reply() {
        let mut params = [0u8; 16];
        params[..4].copy_from_slice(&1i32.to_le_bytes());
        params[4..8].copy_from_slice(&3i32.to_le_bytes());
        params[8..16].copy_from_slice(&[2, 0, 0x1f, 0x90, 10, 0, 0, 7]);
        let (packet, len) = event(opcode::ACCEPT, 0, &params);
        let reply = Reply::decode(&EventFrame::parse(&packet[..len]).unwrap());
        assert_eq!(
            reply,
            Reply::Accept {
                sd: 1,
                status: 3,
                addr: Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 8080)),
            }
        );
    }
    #[test]
    fn scan_result_packed_fields() {
        let mut params = [0u8; 50];
        params[..4].copy_from_slice(&2u32.to_le_bytes());
        // valid, rssi field 78 (-50 dBm), WPA2, ssid length 4
        let flags: u16 = 1 | (78 << 1) | (3 << 8) | (4 << 10);
        params[8..10].copy_from_slice(&flags.to_le_bytes());
        params[12..16].copy_from_slice(b"home");
        params[44..50].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        let (packet, len) = event(opcode::WLAN_GET_SCAN_RESULTS, 0, &params);
        let Reply::Scan(result) = Reply::decode(&EventFrame::parse(&packet[..len]).unwrap())
        else {
            panic!("wrong reply");
        };
        assert!(result.valid);
        assert_eq!(result.rssi, -50);
        assert_eq!(result.security, SecurityType::Wpa2);
        assert_eq!(result.ssid(), b"home");
        assert_eq!(result.bssid, [1, 2, 3, 4, 5, 6]);
        assert_eq!(result.remaining, 2);
    }
    #[test]
    fn status_byte_comes_from_header() {
        let (packet, len) = event(opcode::NETAPP_PING_SEND, 9, &[]);
        let reply = Reply::decode(&EventFrame::parse(&packet[..len]).unwrap());
        assert_eq!(reply.into_status(), Err(WlanError::Peer(9)));
        let (packet, len) = event(opcode::BIND, 0, &(-1i32).to_le_bytes());
        let reply = Reply::decode(&EventFrame::parse(&packet[..len]).unwrap());
        assert_eq!(reply.into_status(), Err(WlanError::Peer(-1)));
    }
    #[test]
    fn send_reply_carries_byte_count() {
        let mut params = [0u8; 8];
        params[..4].copy_from_slice(&2i32.to_le_bytes());
        params[4..].copy_from_slice(&100i32.to_le_bytes());
        let (packet, len) = event(opcode::SEND_TO, 0, &params);
        let reply = Reply::decode(&EventFrame::parse(&packet[..len]).unwrap());
        assert_eq!(reply, Reply::Send { sd: 2, bytes: 100 });
    }
}
