//! WLAN management and the network helpers of the peer.

use core::net::Ipv4Addr;

use crate::{
    event::LinkState,
    reply::{IpConfig, Reply, ScanResult, SecurityType},
    wire::{opcode, Args, MAX_PAYLOAD},
    Wlan, WlanError, WlanResult,
};

/// Longest SSID the peer accepts.
pub const MAX_SSID_LEN: usize = 32;
/// Longest key the peer accepts.
pub const MAX_KEY_LEN: usize = 32;
/// Longest WPA passphrase stored in a profile.
pub const MAX_PASSPHRASE_LEN: usize = 64;
/// Number of profiles the peer keeps.
pub const MAX_PROFILES: u32 = 7;
/// Index passed to [Wlan::del_profile] to delete every profile.
pub const ALL_PROFILES: u32 = 255;
/// Prefix of the smart config packets. The peer accepts no other.
const SMART_CONFIG_PREFIX: &[u8; 3] = b"TTT";
/// Longest name announced through mDNS.
pub const MAX_MDNS_NAME_LEN: usize = 32;
/// File holding the MAC address in the peer's non-volatile memory.
pub const NVMEM_MAC_FILE_ID: u32 = 6;
/// Shortest non-zero DHCP, ARP and keepalive timeout, in seconds.
const MIN_TIMER: u32 = 20;

/// What the peer does by itself after powering up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectionPolicy {
    /// Connect to any open access point in range.
    pub connect_to_open_ap: bool,
    /// Reconnect to the last access point.
    pub fast_connect: bool,
    /// Connect using the stored profiles.
    pub use_profiles: bool,
}

/// Ciphers and key management of a WPA profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WpaCiphers {
    pub pairwise: u32,
    pub group: u32,
    pub key_mgmt: u32,
}
impl Default for WpaCiphers {
    fn default() -> Self {
        // TKIP and CCMP for both ciphers, pre-shared key.
        Self {
            pairwise: 0x18,
            group: 0x1e,
            key_mgmt: 2,
        }
    }
}

/// Credentials of a stored profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfileSecurity<'p> {
    Open,
    /// Four keys of equal length.
    Wep {
        keys: [&'p [u8]; 4],
        tx_key_index: u32,
    },
    Wpa {
        wpa2: bool,
        ciphers: WpaCiphers,
        passphrase: &'p [u8],
    },
}
impl ProfileSecurity<'_> {
    fn security_type(&self) -> SecurityType {
        match self {
            Self::Open => SecurityType::Unsecured,
            Self::Wep { .. } => SecurityType::Wep,
            Self::Wpa { wpa2: false, .. } => SecurityType::Wpa,
            Self::Wpa { wpa2: true, .. } => SecurityType::Wpa2,
        }
    }
}

/// An access point the peer connects to by itself, once profiles are enabled through
/// [Wlan::set_connection_policy].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Profile<'p> {
    pub ssid: &'p [u8],
    pub bssid: Option<[u8; 6]>,
    /// Higher priorities are tried first.
    pub priority: u32,
    pub security: ProfileSecurity<'p>,
}

/// Association state as reported by the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlanStatus {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
}

/// Parameters of the periodic scan.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanParams {
    pub enable: bool,
    /// Dwell times in milliseconds.
    pub min_dwell_time: u32,
    pub max_dwell_time: u32,
    pub probe_requests: u32,
    /// One bit per channel, starting at channel 1.
    pub channel_mask: u32,
    pub rssi_threshold: i32,
    pub snr_threshold: u32,
    pub tx_power: u32,
    /// Interval between scans of each channel, in milliseconds.
    pub intervals: [u32; 16],
}
impl Default for ScanParams {
    fn default() -> Self {
        Self {
            enable: true,
            min_dwell_time: 20,
            max_dwell_time: 30,
            probe_requests: 2,
            channel_mask: 0x7ff,
            rssi_threshold: -80,
            snr_threshold: 0,
            tx_power: 205,
            intervals: [2000; 16],
        }
    }
}

/// Lease, ARP and keepalive timers of the peer, in seconds. Zero disables a timer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NetTimers {
    pub dhcp_lease: u32,
    pub arp_refresh: u32,
    pub keepalive: u32,
    pub inactivity: u32,
}

/// Version of the service pack running on the peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FirmwareVersion {
    pub package_id: u8,
    pub build: u8,
}

impl Wlan<'_> {
    async fn simple_command(&self, op: u16, args: &[u8]) -> WlanResult<i32> {
        self.hci
            .lock()
            .await?
            .command(op, args)
            .await?
            .into_status()
    }
    /// Associate with an access point.
    ///
    /// Completion is reported through the link status, not by this call.
    pub async fn connect_ap(
        &self,
        security: SecurityType,
        ssid: &[u8],
        key: &[u8],
        bssid: Option<[u8; 6]>,
    ) -> WlanResult<()> {
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN || key.len() > MAX_KEY_LEN {
            return Err(WlanError::InvalidArgument);
        }
        let mut args = Args::new();
        args.u32(0x1c)
            .u32(ssid.len() as u32)
            .u32(security.into_bits() as u32)
            .u32(0x10 + ssid.len() as u32)
            .u32(key.len() as u32)
            .u16(0)
            .bytes(&bssid.unwrap_or_default())
            .bytes(ssid)
            .bytes(key);
        self.simple_command(opcode::WLAN_CONNECT, args.as_slice())
            .await?;
        self.update_link(|status| {
            status.state = LinkState::Connecting;
            status.lease = None;
        });
        Ok(())
    }
    /// Store a profile in the peer. Returns the index of the profile.
    pub async fn add_profile(&self, profile: &Profile<'_>) -> WlanResult<u32> {
        let ssid = profile.ssid;
        if ssid.is_empty() || ssid.len() > MAX_SSID_LEN {
            return Err(WlanError::InvalidArgument);
        }
        let ssid_len = ssid.len() as u32;
        let mut args = Args::new();
        args.u32(profile.security.security_type().into_bits() as u32);
        let header = |args: &mut Args, offset: u32| {
            args.u32(offset)
                .u32(ssid_len)
                .u16(0)
                .bytes(&profile.bssid.unwrap_or_default())
                .u32(profile.priority);
        };
        match profile.security {
            ProfileSecurity::Open => {
                header(&mut args, 0x14);
                args.bytes(ssid);
            }
            ProfileSecurity::Wep {
                keys,
                tx_key_index,
            } => {
                let key_len = keys[0].len();
                if key_len == 0
                    || key_len > MAX_KEY_LEN
                    || keys.iter().any(|key| key.len() != key_len)
                    || tx_key_index >= keys.len() as u32
                {
                    return Err(WlanError::InvalidArgument);
                }
                header(&mut args, 0x20);
                args.u32(0x0c + ssid_len)
                    .u32(key_len as u32)
                    .u32(tx_key_index)
                    .bytes(ssid);
                for key in keys {
                    args.bytes(key);
                }
            }
            ProfileSecurity::Wpa {
                ciphers,
                passphrase,
                ..
            } => {
                if passphrase.is_empty() || passphrase.len() > MAX_PASSPHRASE_LEN {
                    return Err(WlanError::InvalidArgument);
                }
                header(&mut args, 0x28);
                args.u32(ciphers.pairwise)
                    .u32(ciphers.group)
                    .u32(ciphers.key_mgmt)
                    .u32(0x08 + ssid_len)
                    .u32(passphrase.len() as u32)
                    .bytes(ssid)
                    .bytes(passphrase);
            }
        }
        let index = self
            .simple_command(opcode::WLAN_ADD_PROFILE, args.as_slice())
            .await?;
        debug!("Stored profile {}.", index);
        Ok(index as u32)
    }
    /// Delete the profile at `index`, or all of them with [ALL_PROFILES].
    pub async fn del_profile(&self, index: u32) -> WlanResult<()> {
        if index >= MAX_PROFILES && index != ALL_PROFILES {
            return Err(WlanError::InvalidArgument);
        }
        self.simple_command(opcode::WLAN_DEL_PROFILE, Args::new().u32(index).as_slice())
            .await?;
        Ok(())
    }
    /// Let the peer listen for credentials sent by a smart config application.
    ///
    /// [NetEvent::SmartConfigDone](crate::NetEvent::SmartConfigDone) is published, once a
    /// profile was received. An encrypted profile is stored as is and has to be decrypted by
    /// the caller.
    pub async fn smart_config_start(&self, encrypted: bool) -> WlanResult<()> {
        self.simple_command(
            opcode::WLAN_SMART_CONFIG_START,
            Args::new().u32(encrypted as u32).as_slice(),
        )
        .await?;
        Ok(())
    }
    pub async fn smart_config_stop(&self) -> WlanResult<()> {
        self.simple_command(opcode::WLAN_SMART_CONFIG_STOP, &[])
            .await?;
        Ok(())
    }
    /// Set the prefix of the smart config packets, which has to precede
    /// [Wlan::smart_config_start].
    pub async fn smart_config_set_prefix(&self) -> WlanResult<()> {
        self.simple_command(opcode::WLAN_SMART_CONFIG_SET_PREFIX, SMART_CONFIG_PREFIX)
            .await?;
        Ok(())
    }
    pub async fn disconnect_ap(&self) -> WlanResult<()> {
        self.simple_command(opcode::WLAN_DISCONNECT, &[]).await?;
        Ok(())
    }
    pub async fn set_connection_policy(&self, policy: ConnectionPolicy) -> WlanResult<()> {
        let mut args = Args::new();
        args.u32(policy.connect_to_open_ap as u32)
            .u32(policy.fast_connect as u32)
            .u32(policy.use_profiles as u32);
        self.simple_command(opcode::WLAN_SET_CONNECTION_POLICY, args.as_slice())
            .await?;
        Ok(())
    }
    /// Mask unsolicited events. A set bit disables the event with that opcode.
    ///
    /// The transmit completion bit never reaches the peer. It only controls, whether
    /// [crate::NetEvent::CanShutDown] is published.
    pub async fn set_event_mask(&self, mask: u32) -> WlanResult<()> {
        let tx_complete = opcode::TX_COMPLETE as u32;
        let mut mask = mask;
        if mask & tx_complete == tx_complete {
            self.hci.set_inform_on_tx_complete(false);
            if mask == tx_complete {
                return Ok(());
            }
            mask &= !tx_complete;
            mask |= opcode::UNSOL_BASE as u32;
        } else {
            self.hci.set_inform_on_tx_complete(true);
        }
        self.simple_command(opcode::EVENT_MASK, &mask.to_le_bytes())
            .await?;
        Ok(())
    }
    pub async fn status(&self) -> WlanResult<WlanStatus> {
        match self.simple_command(opcode::WLAN_STATUS_GET, &[]).await? {
            0 => Ok(WlanStatus::Disconnected),
            1 => Ok(WlanStatus::Scanning),
            2 => Ok(WlanStatus::Connecting),
            3 => Ok(WlanStatus::Connected),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Fetch the next entry of the scan table.
    pub async fn scan_result(&self, timeout_ms: u32) -> WlanResult<ScanResult> {
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::WLAN_GET_SCAN_RESULTS, &timeout_ms.to_le_bytes())
            .await?;
        match reply {
            Reply::Scan(result) => Ok(result),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    pub async fn set_scan_params(&self, params: &ScanParams) -> WlanResult<()> {
        let mut args = Args::new();
        args.u32(36)
            .u32(params.enable as u32)
            .u32(params.min_dwell_time)
            .u32(params.max_dwell_time)
            .u32(params.probe_requests)
            .u32(params.channel_mask)
            .i32(params.rssi_threshold)
            .u32(params.snr_threshold)
            .u32(params.tx_power);
        for interval in params.intervals {
            args.u32(interval);
        }
        self.simple_command(opcode::WLAN_SET_SCAN_PARAMS, args.as_slice())
            .await?;
        Ok(())
    }
    pub async fn ip_config(&self) -> WlanResult<IpConfig> {
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::NETAPP_IP_CONFIG, &[])
            .await?;
        match reply {
            Reply::IpConfig(config) => Ok(config),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Configure a static address. All zero addresses switch back to DHCP.
    pub async fn set_dhcp(
        &self,
        ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        gateway: Ipv4Addr,
        dns_server: Ipv4Addr,
    ) -> WlanResult<()> {
        let mut args = Args::new();
        args.ipv4(ip)
            .ipv4(subnet_mask)
            .ipv4(gateway)
            .u32(0)
            .ipv4(dns_server);
        self.simple_command(opcode::NETAPP_DHCP, args.as_slice())
            .await?;
        Ok(())
    }
    /// Start pinging `ip`. The statistics arrive as [crate::NetEvent::Ping].
    pub async fn ping(
        &self,
        ip: Ipv4Addr,
        attempts: u32,
        size: u32,
        timeout_ms: u32,
    ) -> WlanResult<()> {
        let mut args = Args::new();
        args.ipv4(ip).u32(attempts).u32(size).u32(timeout_ms);
        self.simple_command(opcode::NETAPP_PING_SEND, args.as_slice())
            .await?;
        Ok(())
    }
    pub async fn ping_stop(&self) -> WlanResult<()> {
        self.simple_command(opcode::NETAPP_PING_STOP, &[]).await?;
        Ok(())
    }
    /// Ask for the statistics of the last ping run, which arrive as [crate::NetEvent::Ping].
    pub async fn request_ping_report(&self) -> WlanResult<()> {
        self.simple_command(opcode::NETAPP_PING_REPORT, &[]).await?;
        Ok(())
    }
    pub async fn arp_flush(&self) -> WlanResult<()> {
        self.simple_command(opcode::NETAPP_ARP_FLUSH, &[]).await?;
        Ok(())
    }
    /// Announce or stop announcing the peer through mDNS.
    pub async fn mdns_advertise(&self, enabled: bool, name: &str) -> WlanResult<()> {
        if name.len() > MAX_MDNS_NAME_LEN {
            return Err(WlanError::NameTooLong);
        }
        let mut args = Args::new();
        args.u32(enabled as u32)
            .u32(8)
            .u32(name.len() as u32)
            .bytes(name.as_bytes());
        self.simple_command(opcode::MDNS_ADVERTISE, args.as_slice())
            .await?;
        Ok(())
    }
    /// Set the network timers. Non-zero values below 20 seconds are raised to 20 seconds.
    pub async fn set_timers(&self, timers: NetTimers) -> WlanResult<()> {
        let clamp = |value: u32| {
            if value != 0 && value < MIN_TIMER {
                MIN_TIMER
            } else {
                value
            }
        };
        let mut args = Args::new();
        args.u32(clamp(timers.dhcp_lease))
            .u32(clamp(timers.arp_refresh))
            .u32(clamp(timers.keepalive))
            .u32(timers.inactivity);
        self.simple_command(opcode::NETAPP_SET_TIMERS, args.as_slice())
            .await?;
        Ok(())
    }
    /// Read from a file in the non-volatile memory of the peer. Returns the amount read.
    pub async fn nvmem_read(&self, file_id: u32, offset: u32, buf: &mut [u8]) -> WlanResult<usize> {
        let mut hci = self.hci.lock().await?;
        let mut args = Args::new();
        args.u32(file_id)
            .u32(buf.len().min(MAX_PAYLOAD) as u32)
            .u32(offset);
        hci.command_with_data(opcode::NVMEM_READ, args.as_slice())
            .await?
            .into_status()?;
        hci.receive_data(buf).await.map(|received| received.len)
    }
    pub async fn mac_address(&self) -> WlanResult<[u8; 6]> {
        let mut mac = [0u8; 6];
        match self.nvmem_read(NVMEM_MAC_FILE_ID, 0, &mut mac).await? {
            6 => Ok(mac),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    pub async fn firmware_version(&self) -> WlanResult<FirmwareVersion> {
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::READ_SP_VERSION, &[])
            .await?;
        match reply {
            Reply::Version { status: 0, version } => Ok(FirmwareVersion {
                package_id: version[2],
                build: version[3],
            }),
            Reply::Version { status, .. } => Err(WlanError::Peer(status as i32)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
}
