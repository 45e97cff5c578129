//! BSD style sockets on top of the correlator.
//!
//! Every verb takes the command lock for exactly one request and its reply. [Wlan::recv] and
//! [Wlan::accept] wait for readiness without holding it, so the poller and other callers keep
//! the bus.

mod table;

use core::net::{Ipv4Addr, SocketAddrV4};

use embassy_time::{with_timeout, Duration};

pub use table::{Socket, MAX_SOCKETS};
pub(crate) use table::Sockets;

use crate::{
    hci::Received,
    poller::AcceptTarget,
    reply::{Reply, SelectReply},
    sync::Readiness,
    wire::{
        data_opcode, encode_sockaddr, opcode, Args, AF_INET, ERROR_SOCKET_INACTIVE,
        MAX_HOSTNAME_LEN, MAX_PAYLOAD, SOCKADDR_SIZE,
    },
    Wlan, WlanError, WlanResult,
};

/// Option level of the socket itself.
pub const SOL_SOCKET: u32 = 0xffff;
const SOCKOPT_RECV_NONBLOCK: u32 = 0;
const SOCKOPT_RECV_TIMEOUT: u32 = 1;
const SOCKOPT_ACCEPT_NONBLOCK: u32 = 2;
const SOCK_ON: u32 = 0;
const SOCK_OFF: u32 = 1;
/// Shortest timeout the peer accepts for a readiness query.
const SELECT_TIMEOUT_MIN: Duration = Duration::from_micros(5000);

/// Communication semantics of a socket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocketType {
    /// TCP.
    #[default]
    Stream,
    /// UDP.
    Datagram,
    Raw,
}
impl SocketType {
    /// Type and protocol number.
    const fn numbers(&self) -> (u32, u32) {
        match self {
            Self::Stream => (1, 6),
            Self::Datagram => (2, 17),
            Self::Raw => (3, 255),
        }
    }
}

/// An option applied with [Wlan::set_option].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption<'o> {
    /// Bound on [Wlan::recv]. `None` waits forever.
    RecvTimeout(Option<Duration>),
    /// Make [Wlan::recv] wait at most one poller cycle.
    RecvNonBlocking(bool),
    /// Only meaningful to the peer. [Wlan::accept] enables it by itself.
    AcceptNonBlocking(bool),
    /// Passed to the peer as is.
    Raw {
        level: u32,
        name: u32,
        value: &'o [u8],
    },
}

fn switch(on: bool) -> u32 {
    if on {
        SOCK_ON
    } else {
        SOCK_OFF
    }
}

impl Wlan<'_> {
    /// The descriptor the peer assigned to `socket`.
    pub fn descriptor(&self, socket: Socket) -> WlanResult<i32> {
        self.sockets
            .with(|table| table.entry_mut(socket).map(|entry| entry.descriptor))
    }
    fn live_descriptor(&self, socket: Socket) -> WlanResult<i32> {
        self.sockets
            .with(|table| table.live(socket).map(|entry| entry.descriptor))
    }
    /// Create a socket.
    ///
    /// The table slot is claimed first, so a full table fails without talking to the peer.
    pub async fn open(&self, kind: SocketType) -> WlanResult<Socket> {
        let reservation = self.sockets.reserve()?;
        let (kind_number, protocol) = kind.numbers();
        let mut args = Args::new();
        args.u32(AF_INET as u32).u32(kind_number).u32(protocol);
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::SOCKET, args.as_slice())
            .await?;
        match reply.into_status() {
            Ok(descriptor) => {
                debug!("Opened socket {}.", descriptor);
                Ok(reservation.commit(descriptor))
            }
            Err(err) => {
                debug!("Peer refused to open a socket: {:?}", err);
                Err(WlanError::NoResources)
            }
        }
    }
    /// Close `socket`.
    ///
    /// The local slot is freed, even if the peer fails the request.
    pub async fn close(&self, socket: Socket) -> WlanResult<()> {
        let mut hci = self.hci.lock().await?;
        let descriptor = self.sockets.with(|table| table.release(socket))?;
        self.sockets.ready(socket.slot()).signal(Readiness::Closed);
        self.poller.abort_for(socket, WlanError::InvalidHandle);
        debug!("Closing socket {}.", descriptor);
        hci.command(opcode::CLOSE_SOCKET, Args::new().i32(descriptor).as_slice())
            .await?
            .into_status()
            .map(|_| ())
    }
    async fn address_command(&self, op: u16, socket: Socket, addr: SocketAddrV4) -> WlanResult<()> {
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        args.i32(descriptor)
            .u32(8)
            .u32(SOCKADDR_SIZE as u32)
            .sockaddr(&addr);
        hci.command(op, args.as_slice())
            .await?
            .into_status()
            .map(|_| ())
    }
    pub async fn bind(&self, socket: Socket, addr: SocketAddrV4) -> WlanResult<()> {
        self.address_command(opcode::BIND, socket, addr).await
    }
    pub async fn listen(&self, socket: Socket, backlog: u32) -> WlanResult<()> {
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        args.i32(descriptor).u32(backlog);
        hci.command(opcode::LISTEN, args.as_slice())
            .await?
            .into_status()
            .map(|_| ())
    }
    pub async fn connect(&self, socket: Socket, addr: SocketAddrV4) -> WlanResult<()> {
        self.address_command(opcode::CONNECT, socket, addr).await
    }
    /// Resolve `hostname` through the DNS server of the access point.
    pub async fn resolve(&self, hostname: &str) -> WlanResult<Ipv4Addr> {
        if hostname.is_empty() {
            return Err(WlanError::InvalidArgument);
        }
        if hostname.len() > MAX_HOSTNAME_LEN {
            return Err(WlanError::NameTooLong);
        }
        let mut args = Args::new();
        args.u32(8)
            .u32(hostname.len() as u32)
            .bytes(hostname.as_bytes());
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::GET_HOST_BY_NAME, args.as_slice())
            .await?;
        match reply {
            Reply::HostByName { ret, addr } if ret >= 0 => {
                debug!("Resolved host name to {:?}.", addr.octets());
                Ok(addr)
            }
            Reply::HostByName { ret, .. } => Err(WlanError::Peer(ret)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Apply an option.
    ///
    /// Receive timeout and non blocking mode are kept locally as well. The peer sees every
    /// option.
    pub async fn set_option(&self, socket: Socket, option: SocketOption<'_>) -> WlanResult<()> {
        let (name, value) = match option {
            SocketOption::RecvTimeout(timeout) => {
                self.sockets.with(|table| {
                    table
                        .entry_mut(socket)
                        .map(|entry| entry.recv_timeout = timeout)
                })?;
                let millis = timeout.map_or(u32::MAX, |timeout| {
                    timeout.as_millis().try_into().unwrap_or(u32::MAX)
                });
                (SOCKOPT_RECV_TIMEOUT, millis)
            }
            SocketOption::RecvNonBlocking(on) => {
                self.sockets
                    .with(|table| table.entry_mut(socket).map(|entry| entry.nonblocking = on))?;
                (SOCKOPT_RECV_NONBLOCK, switch(on))
            }
            SocketOption::AcceptNonBlocking(on) => (SOCKOPT_ACCEPT_NONBLOCK, switch(on)),
            SocketOption::Raw { level, name, value } => {
                return self.forward_option(socket, level, name, value).await;
            }
        };
        self.forward_option(socket, SOL_SOCKET, name, &value.to_le_bytes())
            .await
    }
    async fn forward_option(
        &self,
        socket: Socket,
        level: u32,
        name: u32,
        value: &[u8],
    ) -> WlanResult<()> {
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        args.i32(descriptor)
            .u32(level)
            .u32(name)
            .u32(8)
            .u32(value.len() as u32)
            .bytes(value);
        hci.command(opcode::SET_SOCK_OPT, args.as_slice())
            .await?
            .into_status()
            .map(|_| ())
    }
    /// Read an option from the peer.
    pub async fn get_option(&self, socket: Socket, level: u32, name: u32) -> WlanResult<[u8; 4]> {
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        args.i32(descriptor).u32(level).u32(name);
        match hci.command(opcode::GET_SOCK_OPT, args.as_slice()).await? {
            Reply::SockOpt { status: 0, value } => Ok(value),
            Reply::SockOpt { status, .. } => Err(WlanError::Peer(status as i32)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Query readiness of raw descriptor sets, see [Wlan::descriptor].
    ///
    /// `None` makes the peer block until something is ready, bounded only by the command
    /// timeout. Timeouts below 5 ms are raised to 5 ms.
    pub async fn select(
        &self,
        nfds: u32,
        read: u32,
        write: u32,
        except: u32,
        timeout: Option<Duration>,
    ) -> WlanResult<SelectReply> {
        let timeout = timeout.map(|timeout| timeout.max(SELECT_TIMEOUT_MIN));
        let micros = timeout.map_or(0, |timeout| timeout.as_micros());
        let mut args = Args::new();
        args.u32(nfds);
        for _ in 0..4 {
            args.u32(0x14);
        }
        args.u32(timeout.is_none() as u32)
            .u32(read)
            .u32(write)
            .u32(except)
            .u32((micros / 1_000_000) as u32)
            .u32((micros % 1_000_000) as u32);
        let reply = self
            .hci
            .lock()
            .await?
            .command(opcode::SELECT, args.as_slice())
            .await?;
        match reply {
            Reply::Select(reply) if reply.status >= 0 => Ok(reply),
            Reply::Select(reply) => Err(WlanError::Peer(reply.status)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Wait for a connection on `listener`.
    ///
    /// This claims a table slot for the new socket before anything is sent, and is bounded by
    /// [crate::Config::accept_timeout]. Only one accept can be in progress at a time.
    pub async fn accept(&self, listener: Socket) -> WlanResult<(Socket, Option<SocketAddrV4>)> {
        let descriptor = self.live_descriptor(listener)?;
        let pending = self.poller.claim_accept(AcceptTarget {
            listener,
            descriptor,
        })?;
        let reservation = self.sockets.reserve()?;
        self.set_option(listener, SocketOption::AcceptNonBlocking(true))
            .await?;
        pending.start_probing();
        trace!("Waiting for a connection on {}.", descriptor);
        let accepted = match self.config.accept_timeout {
            Some(limit) => with_timeout(limit, pending.wait())
                .await
                .map_err(|_| WlanError::Timeout)?,
            None => pending.wait().await,
        }?;
        Ok((reservation.commit(accepted.descriptor), accepted.addr))
    }
    /// Wait until the poller reports `socket` as readable.
    async fn wait_readable(&self, socket: Socket) -> WlanResult<()> {
        // A stale handle must not touch the readiness of the socket, that reused its slot.
        self.descriptor(socket)?;
        // Forget old readiness before checking the socket is still active, so a teardown
        // racing with this call stays signalled.
        let ready = self.sockets.ready(socket.slot());
        ready.reset();
        let _waiter = self.poller.register_waiter();
        let entry = self.sockets.with(|table| table.live(socket))?;
        let limit = if entry.nonblocking {
            Some(self.config.poll_cycle())
        } else {
            entry.recv_timeout
        };
        let readiness = match limit {
            Some(limit) => with_timeout(limit, ready.wait())
                .await
                .map_err(|_| WlanError::WouldBlock)?,
            None => ready.wait().await,
        };
        match readiness {
            Readiness::Readable => Ok(()),
            Readiness::Closed if self.hci.is_stopped() => Err(WlanError::Stopped),
            Readiness::Closed => self
                .sockets
                .with(|table| table.live(socket))
                .and(Err(WlanError::SocketInactive)),
        }
    }
    async fn receive(
        &self,
        socket: Socket,
        buf: &mut [u8],
        op: u16,
        flags: u32,
    ) -> WlanResult<Received> {
        self.wait_readable(socket).await?;
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        args.i32(descriptor)
            .u32(buf.len().min(MAX_PAYLOAD) as u32)
            .u32(flags);
        match hci.command_with_data(op, args.as_slice()).await? {
            Reply::Recv { bytes, .. } if bytes > 0 => hci.receive_data(buf).await,
            Reply::Recv { bytes: 0, .. } => Ok(Received { len: 0, from: None }),
            Reply::Recv {
                bytes: ERROR_SOCKET_INACTIVE,
                ..
            } => Err(WlanError::SocketInactive),
            Reply::Recv { bytes, .. } => Err(WlanError::Peer(bytes)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Receive from a connected socket.
    ///
    /// This waits for readiness first, bounded by the receive timeout of the socket. Running out
    /// of time yields [WlanError::WouldBlock].
    pub async fn recv(&self, socket: Socket, buf: &mut [u8]) -> WlanResult<usize> {
        self.receive(socket, buf, opcode::RECV, 0)
            .await
            .map(|received| received.len)
    }
    /// Receive a datagram together with its source.
    pub async fn recvfrom(
        &self,
        socket: Socket,
        buf: &mut [u8],
    ) -> WlanResult<(usize, Option<SocketAddrV4>)> {
        self.receive(socket, buf, opcode::RECV_FROM, 0)
            .await
            .map(|received| (received.len, received.from))
    }
    async fn transmit(
        &self,
        socket: Socket,
        data: &[u8],
        to: Option<SocketAddrV4>,
    ) -> WlanResult<usize> {
        if data.len() > MAX_PAYLOAD {
            return Err(WlanError::InvalidArgument);
        }
        let mut hci = self.hci.lock().await?;
        let descriptor = self.live_descriptor(socket)?;
        let mut args = Args::new();
        let reply = match to {
            Some(to) => {
                args.i32(descriptor)
                    .u32(20)
                    .u32(data.len() as u32)
                    .u32(0)
                    .u32(data.len() as u32 + 8)
                    .u32(SOCKADDR_SIZE as u32);
                hci.send_data(
                    data_opcode::SEND_TO,
                    opcode::SEND_TO,
                    args.as_slice(),
                    data,
                    &encode_sockaddr(&to),
                )
                .await?
            }
            None => {
                args.i32(descriptor)
                    .u32(12)
                    .u32(data.len() as u32)
                    .u32(0);
                hci.send_data(data_opcode::SEND, opcode::SEND, args.as_slice(), data, &[])
                    .await?
            }
        };
        match reply {
            Reply::Send { bytes, .. } if bytes >= 0 => Ok(bytes as usize),
            Reply::Send {
                bytes: ERROR_SOCKET_INACTIVE,
                ..
            } => Err(WlanError::SocketInactive),
            Reply::Send { bytes, .. } => Err(WlanError::Peer(bytes)),
            _ => Err(WlanError::InvalidFrame),
        }
    }
    /// Send on a connected socket. This waits for a device buffer, if the peer has none left.
    pub async fn send(&self, socket: Socket, data: &[u8]) -> WlanResult<usize> {
        self.transmit(socket, data, None).await
    }
    pub async fn sendto(&self, socket: Socket, data: &[u8], to: SocketAddrV4) -> WlanResult<usize> {
        self.transmit(socket, data, Some(to)).await
    }
}
