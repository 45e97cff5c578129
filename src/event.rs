//! Notifications the peer sends without being asked, republished for the rest of the firmware.

use core::net::Ipv4Addr;

use embassy_sync::pubsub::{PubSubChannel, Subscriber};

use crate::{
    wire::{read_ipv4, read_u32},
    DefaultRawMutex,
};

/// How many events are buffered per subscriber.
pub const EVENT_CAPACITY: usize = 8;
/// How many subscribers may listen at the same time.
pub const EVENT_SUBSCRIBERS: usize = 4;

pub(crate) type EventBus = PubSubChannel<DefaultRawMutex, NetEvent, EVENT_CAPACITY, EVENT_SUBSCRIBERS, 1>;
/// A subscription to the [NetEvent]s of a [crate::Wlan].
pub type EventSubscriber<'a> =
    Subscriber<'a, DefaultRawMutex, NetEvent, EVENT_CAPACITY, EVENT_SUBSCRIBERS, 1>;

/// State of the WLAN association, as seen by the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Addressing handed out by the access point's DHCP server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dhcp_server: Ipv4Addr,
    pub dns_server: Ipv4Addr,
}
impl DhcpLease {
    /// Decode the lease from the parameters of a DHCP event.
    pub(crate) fn parse(params: &[u8]) -> Self {
        Self {
            ip: read_ipv4(params, 0),
            subnet_mask: read_ipv4(params, 4),
            gateway: read_ipv4(params, 8),
            dhcp_server: read_ipv4(params, 12),
            dns_server: read_ipv4(params, 16),
        }
    }
}

/// Link state together with the lease, once one was acquired.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub lease: Option<DhcpLease>,
}

/// Statistics of a finished ping run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PingReport {
    pub packets_sent: u32,
    pub packets_received: u32,
    pub min_round_trip: u32,
    pub max_round_trip: u32,
    pub avg_round_trip: u32,
}
impl PingReport {
    pub(crate) fn parse(params: &[u8]) -> Self {
        Self {
            packets_sent: read_u32(params, 0),
            packets_received: read_u32(params, 4),
            min_round_trip: read_u32(params, 8),
            max_round_trip: read_u32(params, 12),
            avg_round_trip: read_u32(params, 16),
        }
    }
}

/// Everything published on the event bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetEvent {
    /// The link state changed.
    Link(LinkStatus),
    /// A DHCP exchange finished. `None` means the peer reported a failure.
    Dhcp(Option<DhcpLease>),
    Ping(PingReport),
    /// The remote end of the socket with this descriptor closed the connection.
    PeerClosed(i32),
    InitComplete,
    Keepalive,
    SmartConfigDone,
    /// Every data buffer handed to the peer was released again.
    CanShutDown,
}
