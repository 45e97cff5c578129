use core::cell::Cell;

use embassy_sync::blocking_mutex;
use embassy_time::{with_timeout, Duration};

use crate::{
    event::{EventBus, EventSubscriber, LinkState, LinkStatus, NetEvent},
    hci::{FlowControl, Hci, Notice},
    poller::Poller,
    reply::Reply,
    socket::Sockets,
    transport::{IrqStats, Link, WlanIrq},
    wire::opcode,
    DefaultRawMutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlanError {
    /// The socket table is full, or the peer ran out of sockets.
    NoResources,
    /// Nothing became ready within the allowed time.
    WouldBlock,
    /// The handle refers to a socket, that was closed.
    InvalidHandle,
    InvalidArgument,
    /// The peer reported the socket as inactive.
    SocketInactive,
    /// The peer failed the request with this code.
    Peer(i32),
    /// No device buffer became available in time.
    NoBuffers,
    /// The reply to a command never arrived.
    Timeout,
    /// The link was stopped.
    Stopped,
    /// Another accept is already in progress.
    Busy,
    /// Driving the bus or one of the control lines failed.
    Bus,
    NameTooLong,
    /// The peer sent a reply, that doesn't fit the command.
    InvalidFrame,
}
pub type WlanResult<T> = Result<T, WlanError>;

/// Timing of the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// How long the pump waits for an edge, before sampling the IRQ line by hand.
    pub irq_timeout: Duration,
    /// Pause after every bus transaction.
    pub transaction_gap: Duration,
    /// Bound on a single command and its reply. `None` waits forever.
    pub command_timeout: Option<Duration>,
    /// How long sending data waits for a device buffer.
    pub buffer_timeout: Option<Duration>,
    /// Timeout of the readiness queries issued by the poller.
    pub select_timeout: Duration,
    /// Pause between two poller cycles.
    pub poll_interval: Duration,
    /// Bound on [Wlan::accept]. `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// How long [Wlan::stop] waits for the pump to power the peer down.
    pub shutdown_timeout: Duration,
    /// Publish [NetEvent::CanShutDown] once all sent buffers were released.
    pub inform_host_on_tx_complete: bool,
}
impl Default for Config {
    fn default() -> Self {
        Self {
            irq_timeout: Duration::from_secs(2),
            transaction_gap: Duration::from_millis(5),
            command_timeout: Some(Duration::from_secs(10)),
            buffer_timeout: Some(Duration::from_secs(5)),
            select_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            accept_timeout: None,
            shutdown_timeout: Duration::from_secs(1),
            inform_host_on_tx_complete: true,
        }
    }
}
impl Config {
    /// The longest time a single poller cycle takes.
    pub fn poll_cycle(&self) -> Duration {
        self.select_timeout + self.poll_interval
    }
}

/// Patch images uploaded to the peer while it starts.
///
/// An empty image tells the peer to keep the one it has.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Patches<'p> {
    pub driver: &'p [u8],
    pub firmware: &'p [u8],
    pub bootloader: &'p [u8],
}
impl<'p> Patches<'p> {
    const DRIVER: u8 = 1;
    const FIRMWARE: u8 = 2;
    const BOOTLOADER: u8 = 3;
    fn image(&self, kind: u8) -> &'p [u8] {
        match kind {
            Self::DRIVER => self.driver,
            Self::FIRMWARE => self.firmware,
            Self::BOOTLOADER => self.bootloader,
            _ => &[],
        }
    }
}

/// Where the peer takes its patches from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchSource<'p> {
    /// Use the patches stored on the peer.
    #[default]
    Peer,
    /// Upload the patches from the host.
    Host(Patches<'p>),
    /// Run without any patches.
    None,
}
impl PatchSource<'_> {
    fn mode(&self) -> u8 {
        match self {
            Self::Peer => 0,
            Self::Host(_) => 1,
            Self::None => 2,
        }
    }
}

/// The driver state shared by the pump, the poller and all users.
pub struct Wlan<'a> {
    pub(crate) hci: Hci<'a>,
    pub(crate) config: Config,
    pub(crate) sockets: Sockets,
    pub(crate) poller: Poller,
    events: EventBus,
    link_status: blocking_mutex::Mutex<DefaultRawMutex, Cell<LinkStatus>>,
}
impl<'a> Wlan<'a> {
    pub fn new(irq: &'a WlanIrq, config: Config) -> Self {
        Self {
            hci: Hci::new(
                Link::new(irq),
                config.command_timeout,
                config.buffer_timeout,
                config.inform_host_on_tx_complete,
            ),
            config,
            sockets: Sockets::new(),
            poller: Poller::new(),
            events: EventBus::new(),
            link_status: blocking_mutex::Mutex::new(Cell::new(LinkStatus {
                state: LinkState::Disconnected,
                lease: None,
            })),
        }
    }
    pub fn config(&self) -> &Config {
        &self.config
    }
    /// Bring the peer up.
    ///
    /// [crate::Transport::run] has to be running, since it powers the peer up and carries the
    /// start up exchange. All sockets of a previous session are forgotten.
    pub async fn start(&self, patches: PatchSource<'_>) -> WlanResult<()> {
        if !self.hci.is_stopped() {
            return Err(WlanError::Busy);
        }
        debug!("Starting WLAN, patch mode: {}", patches.mode());
        self.sockets.reset();
        self.poller.reset();
        self.link_status
            .lock(|status| status.set(LinkStatus::default()));
        self.hci.link.clear_terminate();
        self.hci.resume();
        let result = self.bring_up(patches).await;
        match result {
            Ok(()) => info!("WLAN started."),
            Err(err) => {
                error!("Starting WLAN failed: {:?}", err);
                self.stop().await;
            }
        }
        result
    }
    async fn bring_up(&self, patches: PatchSource<'_>) -> WlanResult<()> {
        let mut hci = self.hci.lock().await?;
        let mode = [patches.mode()];
        match patches {
            PatchSource::Host(patches) => {
                let mut reply = hci
                    .command_expecting(opcode::SIMPLE_LINK_START, &mode, opcode::PATCHES_REQUEST)
                    .await?;
                // The peer asks for the driver, the firmware and the bootloader, in that order.
                while let Reply::PatchRequest(kind) = reply {
                    let expected = if kind >= Patches::BOOTLOADER {
                        opcode::SIMPLE_LINK_START
                    } else {
                        opcode::PATCHES_REQUEST
                    };
                    reply = hci.send_patch(kind, patches.image(kind), expected).await?;
                }
            }
            _ => {
                hci.command(opcode::SIMPLE_LINK_START, &mode).await?;
            }
        }
        match hci.command(opcode::READ_BUFFER_SIZE, &[]).await? {
            Reply::BufferSize { .. } => Ok(()),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Shut the link down.
    ///
    /// Every pending command fails and every blocked receive or accept returns
    /// [WlanError::Stopped]. The pump powers the peer down and returns.
    pub async fn stop(&self) {
        debug!("Stopping WLAN.");
        self.hci.halt();
        self.sockets.close_all();
        self.poller.abort(WlanError::Stopped);
        self.hci.link.request_terminate();
        if with_timeout(self.config.shutdown_timeout, self.hci.link.wait_halted())
            .await
            .is_err()
        {
            warn!("The pump didn't acknowledge the shutdown in time.");
        }
        // Readiness stays signalled, so readers that weren't polled yet still see the teardown.
        self.sockets.with(|table| table.clear());
        self.update_link(|status| *status = LinkStatus::default());
    }
    pub fn is_stopped(&self) -> bool {
        self.hci.is_stopped()
    }
    /// Subscribe to the unsolicited events of the peer.
    pub fn events(&self) -> WlanResult<EventSubscriber<'_>> {
        self.events
            .subscriber()
            .map_err(|_| WlanError::NoResources)
    }
    pub fn link_status(&self) -> LinkStatus {
        self.link_status.lock(|status| status.get())
    }
    pub fn flow_control(&self) -> FlowControl {
        self.hci.flow_control()
    }
    pub fn irq_stats(&self) -> IrqStats {
        self.hci.link.irq_stats()
    }
    pub(crate) fn publish(&self, event: NetEvent) {
        self.events.immediate_publisher().publish_immediate(event);
    }
    /// Apply `f` to the link status and publish the result, if it changed.
    pub(crate) fn update_link(&self, f: impl FnOnce(&mut LinkStatus)) {
        let (old, new) = self.link_status.lock(|status| {
            let old = status.get();
            let mut new = old;
            f(&mut new);
            status.set(new);
            (old, new)
        });
        if old != new {
            debug!("Link state is now {:?}.", new.state);
            self.publish(NetEvent::Link(new));
        }
    }
    /// Hand an inbound frame to the correlator. Called by the pump.
    pub(crate) fn dispatch_packet(&self, packet: &[u8]) {
        self.hci.dispatch(packet, |notice| self.apply_notice(notice));
    }
    fn apply_notice(&self, notice: Notice) {
        match notice {
            Notice::SocketInactive(descriptor) => {
                self.sockets
                    .deactivate(descriptor, WlanError::SocketInactive);
            }
            Notice::PeerClosed(descriptor) => {
                debug!("Peer closed socket {}.", descriptor);
                self.sockets
                    .deactivate(descriptor, WlanError::SocketInactive);
                self.publish(NetEvent::PeerClosed(descriptor));
            }
            Notice::Connected => self.update_link(|status| status.state = LinkState::Connected),
            Notice::Disconnected => self.update_link(|status| {
                status.state = LinkState::Disconnected;
                status.lease = None;
            }),
            Notice::Dhcp(lease) => {
                self.publish(NetEvent::Dhcp(lease));
                self.update_link(|status| match lease {
                    Some(lease) => status.lease = Some(lease),
                    None => status.state = LinkState::Failed,
                });
            }
            Notice::Event(event) => self.publish(event),
        }
    }
}
