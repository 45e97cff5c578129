//! Command/event correlation on top of the [Link].
//!
//! At most one command is in flight. [Hci::lock] hands out the only [HciGuard], and only the
//! guard can issue commands, so the pending slot is never installed twice. Replies are decoded
//! by the pump in [Hci::dispatch], which also routes everything the peer sends unasked.

use core::{cell::RefCell, future::Future, net::SocketAddrV4};

use bitfield_struct::bitfield;
use embassy_sync::{
    blocking_mutex,
    mutex::{Mutex, MutexGuard},
    signal::Signal,
};
use embassy_time::{with_timeout, Duration};
use portable_atomic::{AtomicBool, Ordering};

use crate::{
    event::{DhcpLease, NetEvent, PingReport},
    reply::Reply,
    transport::Link,
    wire::{
        data_opcode, decode_sockaddr, encode_command, encode_data, encode_patch_head,
        encode_patch_portion, ensure_args_fit, opcode, read_i32, read_u16, read_u32, DataFrame,
        EventFrame, ERROR_SOCKET_INACTIVE, MAX_PAYLOAD, PATCH_PORTION_SIZE, TYPE_DATA,
        TYPE_EVENT,
    },
    DefaultRawMutex, WlanError, WlanResult,
};

/// Something the dispatcher learned, which concerns state above the correlator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Notice {
    /// The peer no longer considers this descriptor open.
    SocketInactive(i32),
    /// The remote end of this descriptor closed the connection.
    PeerClosed(i32),
    Connected,
    Disconnected,
    Dhcp(Option<DhcpLease>),
    Event(NetEvent),
}

#[bitfield(u32)]
struct FreeBufferEntry {
    handle: u16,
    free_buffers: u16,
}

/// Device buffer credits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlowControl {
    /// Buffers the peer can still accept.
    pub free_buffers: u16,
    /// Size of a single peer buffer.
    pub buffer_length: u16,
    pub buffers_sent: u32,
    pub buffers_released: u32,
}
impl FlowControl {
    fn try_claim(&mut self) -> bool {
        if self.free_buffers == 0 {
            return false;
        }
        self.free_buffers -= 1;
        self.buffers_sent = self.buffers_sent.wrapping_add(1);
        true
    }
    /// Returns true if every buffer sent so far was released.
    fn release(&mut self, count: u16) -> bool {
        self.free_buffers = self.free_buffers.saturating_add(count);
        self.buffers_released = self.buffers_released.wrapping_add(count as u32);
        self.buffers_released == self.buffers_sent
    }
}

/// The single pending command slot.
#[derive(Default)]
struct Pending {
    expected: Option<u16>,
    /// The reply may announce a data frame.
    data_follows: bool,
    /// The next data frame belongs to the caller.
    awaiting_data: bool,
}

/// Where an inbound data frame is parked until its caller collects it.
struct DataSlot {
    bytes: [u8; MAX_PAYLOAD],
    len: usize,
    from: Option<SocketAddrV4>,
}

/// A data frame handed to a caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Received {
    pub len: usize,
    pub from: Option<SocketAddrV4>,
}

pub(crate) struct Hci<'a> {
    pub link: Link<'a>,
    lock: Mutex<DefaultRawMutex, ()>,
    stopped: AtomicBool,
    pending: blocking_mutex::Mutex<DefaultRawMutex, RefCell<Pending>>,
    reply: Signal<DefaultRawMutex, WlanResult<Reply>>,
    data: Signal<DefaultRawMutex, WlanResult<Received>>,
    data_slot: blocking_mutex::Mutex<DefaultRawMutex, RefCell<DataSlot>>,
    flow: blocking_mutex::Mutex<DefaultRawMutex, RefCell<FlowControl>>,
    credits: Signal<DefaultRawMutex, ()>,
    inform_on_tx_complete: AtomicBool,
    command_timeout: Option<Duration>,
    buffer_timeout: Option<Duration>,
}
impl<'a> Hci<'a> {
    pub const fn new(
        link: Link<'a>,
        command_timeout: Option<Duration>,
        buffer_timeout: Option<Duration>,
        inform_on_tx_complete: bool,
    ) -> Self {
        Self {
            link,
            lock: Mutex::new(()),
            stopped: AtomicBool::new(true),
            pending: blocking_mutex::Mutex::new(RefCell::new(Pending {
                expected: None,
                data_follows: false,
                awaiting_data: false,
            })),
            reply: Signal::new(),
            data: Signal::new(),
            data_slot: blocking_mutex::Mutex::new(RefCell::new(DataSlot {
                bytes: [0; MAX_PAYLOAD],
                len: 0,
                from: None,
            })),
            flow: blocking_mutex::Mutex::new(RefCell::new(FlowControl {
                free_buffers: 0,
                buffer_length: 0,
                buffers_sent: 0,
                buffers_released: 0,
            })),
            credits: Signal::new(),
            inform_on_tx_complete: AtomicBool::new(inform_on_tx_complete),
            command_timeout,
            buffer_timeout,
        }
    }
    /// Take the exclusive right to talk to the peer.
    pub async fn lock(&self) -> WlanResult<HciGuard<'_, 'a>> {
        if self.is_stopped() {
            return Err(WlanError::Stopped);
        }
        let guard = self.lock.lock().await;
        if self.is_stopped() {
            return Err(WlanError::Stopped);
        }
        Ok(HciGuard {
            hci: self,
            _guard: guard,
        })
    }
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
    /// Allow commands again and forget the credits of the previous session.
    pub fn resume(&self) {
        self.flow
            .lock(|flow| *flow.borrow_mut() = FlowControl::default());
        self.credits.reset();
        self.stopped.store(false, Ordering::Release);
    }
    /// Fail the pending command and everything waiting on the correlator.
    pub fn halt(&self) {
        self.stopped.store(true, Ordering::Release);
        self.pending
            .lock(|pending| *pending.borrow_mut() = Pending::default());
        self.reply.signal(Err(WlanError::Stopped));
        self.data.signal(Err(WlanError::Stopped));
        self.credits.signal(());
        self.link.abort();
    }
    pub fn flow_control(&self) -> FlowControl {
        self.flow.lock(|flow| *flow.borrow())
    }
    pub fn set_inform_on_tx_complete(&self, inform: bool) {
        self.inform_on_tx_complete.store(inform, Ordering::Relaxed);
    }
    fn clear_pending(&self) {
        self.pending
            .lock(|pending| *pending.borrow_mut() = Pending::default());
    }
    /// Route an inbound packet. This runs on the pump, never on the caller.
    ///
    /// `notify` sees every notice before the waiting caller is woken.
    pub fn dispatch(&self, packet: &[u8], mut notify: impl FnMut(Notice)) {
        match packet.first().copied() {
            Some(TYPE_EVENT) => self.dispatch_event(packet, &mut notify),
            Some(TYPE_DATA) => self.dispatch_data(packet),
            kind => warn!("Dropping inbound frame of unknown type {:?}.", kind),
        }
    }
    fn dispatch_event(&self, packet: &[u8], notify: &mut impl FnMut(Notice)) {
        let Some(event) = EventFrame::parse(packet) else {
            warn!("Dropping event with invalid length, len: {}", packet.len());
            return;
        };
        trace!("Event {:x}, status: {}", event.opcode, event.status);
        if self.dispatch_unsolicited(&event, notify) {
            return;
        }
        let reply = Reply::decode(&event);
        match reply {
            Reply::Send { sd, bytes } if bytes == ERROR_SOCKET_INACTIVE => {
                debug!("Peer reports socket {} inactive on send.", sd);
                notify(Notice::SocketInactive(sd));
            }
            Reply::Recv { sd, bytes, .. } if bytes == ERROR_SOCKET_INACTIVE => {
                debug!("Peer reports socket {} inactive on receive.", sd);
                notify(Notice::SocketInactive(sd));
            }
            Reply::BufferSize { free, length } => {
                debug!("Peer has {} buffers of {} bytes.", free, length);
                self.flow.lock(|flow| {
                    let mut flow = flow.borrow_mut();
                    flow.free_buffers = free as u16;
                    flow.buffer_length = length;
                });
                self.credits.signal(());
            }
            _ => {}
        }
        let matched = self.pending.lock(|pending| {
            let mut pending = pending.borrow_mut();
            if pending.expected != Some(event.opcode) {
                return false;
            }
            pending.expected = None;
            if pending.data_follows {
                pending.awaiting_data = match reply {
                    Reply::Recv { bytes, .. } => bytes > 0,
                    Reply::StatusByte(status) => status == 0,
                    _ => false,
                };
            }
            true
        });
        if matched {
            self.reply.signal(Ok(reply));
        } else {
            debug!("Ignoring unexpected reply {:x}.", event.opcode);
        }
    }
    /// Returns true if the event was unsolicited and fully handled.
    fn dispatch_unsolicited(&self, event: &EventFrame<'_>, notify: &mut impl FnMut(Notice)) -> bool {
        match event.opcode {
            opcode::DATA_UNSOL_FREE_BUFF => self.release_buffers(event.params, notify),
            opcode::KEEPALIVE => notify(Notice::Event(NetEvent::Keepalive)),
            opcode::UNSOL_CONNECT => notify(Notice::Connected),
            opcode::UNSOL_DISCONNECT => notify(Notice::Disconnected),
            opcode::UNSOL_INIT => notify(Notice::Event(NetEvent::InitComplete)),
            opcode::ASYNC_SMART_CONFIG_DONE => notify(Notice::Event(NetEvent::SmartConfigDone)),
            opcode::UNSOL_DHCP => notify(Notice::Dhcp(
                (event.status == 0).then(|| DhcpLease::parse(event.params)),
            )),
            opcode::ASYNC_PING_REPORT => notify(Notice::Event(NetEvent::Ping(PingReport::parse(
                event.params,
            )))),
            opcode::TCP_CLOSE_WAIT => notify(Notice::PeerClosed(read_i32(event.params, 0))),
            _ => return false,
        }
        true
    }
    fn release_buffers(&self, params: &[u8], notify: &mut impl FnMut(Notice)) {
        let handles = read_u16(params, 0) as usize;
        let released = params
            .get(2..)
            .unwrap_or_default()
            .chunks_exact(4)
            .take(handles)
            .map(|entry| FreeBufferEntry::from_bits(read_u32(entry, 0)).free_buffers())
            .fold(0u16, u16::saturating_add);
        let (all_released, free) = self.flow.lock(|flow| {
            let mut flow = flow.borrow_mut();
            (flow.release(released), flow.free_buffers)
        });
        trace!("Peer released {} buffers, {} free.", released, free);
        self.credits.signal(());
        if all_released && self.inform_on_tx_complete.load(Ordering::Relaxed) {
            notify(Notice::Event(NetEvent::CanShutDown));
        }
    }
    fn dispatch_data(&self, packet: &[u8]) {
        let armed = self.pending.lock(|pending| {
            core::mem::replace(&mut pending.borrow_mut().awaiting_data, false)
        });
        if !armed {
            warn!("Dropping unrequested data frame, len: {}", packet.len());
            return;
        }
        let Some(frame) = DataFrame::parse(packet) else {
            warn!("Dropping data frame with invalid length, len: {}", packet.len());
            self.data.signal(Err(WlanError::InvalidFrame));
            return;
        };
        let from = if frame.opcode == data_opcode::RECV_FROM && read_u32(frame.args, 4) != 0 {
            frame.args.get(16..).and_then(decode_sockaddr)
        } else {
            None
        };
        let len = self.data_slot.lock(|slot| {
            let mut slot = slot.borrow_mut();
            let len = frame.payload.len().min(MAX_PAYLOAD);
            slot.bytes[..len].copy_from_slice(&frame.payload[..len]);
            slot.len = len;
            slot.from = from;
            len
        });
        trace!("Data frame {:x} delivered, len: {}", frame.opcode, len);
        self.data.signal(Ok(Received { len, from }));
    }
    /// Bound `fut` by the command timeout.
    async fn bounded<T>(
        &self,
        limit: Option<Duration>,
        on_timeout: WlanError,
        fut: impl Future<Output = WlanResult<T>>,
    ) -> WlanResult<T> {
        match limit {
            Some(limit) => with_timeout(limit, fut).await.unwrap_or(Err(on_timeout)),
            None => fut.await,
        }
    }
}

/// Exclusive access to the correlator. Dropping it lets the next caller in.
pub(crate) struct HciGuard<'h, 'a> {
    hci: &'h Hci<'a>,
    _guard: MutexGuard<'h, DefaultRawMutex, ()>,
}
impl HciGuard<'_, '_> {
    /// Install the pending slot. Dropping the returned guard clears it again.
    fn expect(&mut self, expected: u16, data_follows: bool) -> ClearOnDrop<'_> {
        let hci = self.hci;
        hci.reply.reset();
        hci.data.reset();
        hci.pending.lock(|pending| {
            *pending.borrow_mut() = Pending {
                expected: Some(expected),
                data_follows,
                awaiting_data: false,
            }
        });
        ClearOnDrop { hci, armed: true }
    }
    async fn exchange(
        &mut self,
        expected: u16,
        data_follows: bool,
        build: impl FnOnce(&mut [u8]) -> usize,
    ) -> WlanResult<Reply> {
        let hci = self.hci;
        let mut clear = self.expect(expected, data_follows);
        let result = hci
            .bounded(hci.command_timeout, WlanError::Timeout, async {
                hci.link.transmit(build).await?;
                hci.reply.wait().await
            })
            .await;
        match &result {
            Ok(_) => clear.disarm(),
            Err(err) => warn!("Command waiting for {:x} failed: {:?}", expected, err),
        }
        result
    }
    /// Send a command and wait for the reply carrying the same opcode.
    pub async fn command(&mut self, opcode: u16, args: &[u8]) -> WlanResult<Reply> {
        self.command_expecting(opcode, args, opcode).await
    }
    pub async fn command_expecting(
        &mut self,
        opcode: u16,
        args: &[u8],
        expected: u16,
    ) -> WlanResult<Reply> {
        ensure_args_fit(args)?;
        trace!("Sending command {:x}, args: {}", opcode, args.len());
        self.exchange(expected, false, |frame| encode_command(frame, opcode, args))
            .await
    }
    /// Send a command, whose reply may announce a data frame for [HciGuard::receive_data].
    pub async fn command_with_data(&mut self, opcode: u16, args: &[u8]) -> WlanResult<Reply> {
        ensure_args_fit(args)?;
        self.exchange(opcode, true, |frame| encode_command(frame, opcode, args))
            .await
    }
    /// Send a data frame. This waits for a device buffer first.
    pub async fn send_data(
        &mut self,
        opcode: u8,
        expected: u16,
        args: &[u8],
        payload: &[u8],
        trailer: &[u8],
    ) -> WlanResult<Reply> {
        ensure_args_fit(args)?;
        self.claim_buffer().await?;
        trace!("Sending data {:x}, len: {}", opcode, payload.len());
        self.exchange(expected, false, |frame| {
            encode_data(frame, opcode, args, payload, trailer)
        })
        .await
    }
    async fn claim_buffer(&mut self) -> WlanResult<()> {
        let hci = self.hci;
        hci.bounded(hci.buffer_timeout, WlanError::NoBuffers, async {
            loop {
                if hci.is_stopped() {
                    return Err(WlanError::Stopped);
                }
                if hci.flow.lock(|flow| flow.borrow_mut().try_claim()) {
                    return Ok(());
                }
                trace!("No free device buffers, waiting.");
                hci.credits.wait().await;
            }
        })
        .await
    }
    /// Collect the data frame announced by the last reply.
    pub async fn receive_data(&mut self, buf: &mut [u8]) -> WlanResult<Received> {
        let hci = self.hci;
        let armed = hci.pending.lock(|pending| pending.borrow().awaiting_data);
        if !armed && !hci.data.signaled() {
            return Err(WlanError::InvalidArgument);
        }
        let mut clear = ClearOnDrop { hci, armed: true };
        let received = hci
            .bounded(hci.command_timeout, WlanError::Timeout, hci.data.wait())
            .await?;
        clear.disarm();
        let len = hci.data_slot.lock(|slot| {
            let slot = slot.borrow();
            let len = slot.len.min(buf.len());
            buf[..len].copy_from_slice(&slot.bytes[..len]);
            len
        });
        Ok(Received {
            len,
            from: received.from,
        })
    }
    /// Upload a patch in reply to a patch request and wait for `expected`.
    pub async fn send_patch(&mut self, kind: u8, patch: &[u8], expected: u16) -> WlanResult<Reply> {
        let hci = self.hci;
        let mut clear = self.expect(expected, false);
        trace!("Sending patch {}, len: {}", kind, patch.len());
        let result = hci
            .bounded(hci.command_timeout, WlanError::Timeout, async {
                let mut sent = 0;
                hci.link
                    .transmit(|frame| {
                        let (len, taken) = encode_patch_head(frame, kind, patch);
                        sent = taken;
                        len
                    })
                    .await?;
                for portion in patch[sent..].chunks(PATCH_PORTION_SIZE) {
                    hci.link
                        .transmit(|frame| encode_patch_portion(frame, portion))
                        .await?;
                }
                hci.reply.wait().await
            })
            .await;
        if result.is_ok() {
            clear.disarm();
        }
        result
    }
}

/// Clears the pending slot unless the exchange completed.
struct ClearOnDrop<'h> {
    hci: &'h Hci<'h>,
    armed: bool,
}
impl ClearOnDrop<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}
impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.hci.clear_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credits_are_conserved() {
        let mut flow = FlowControl {
            free_buffers: 1,
            ..Default::default()
        };
        assert!(flow.try_claim());
        assert!(!flow.try_claim());
        assert_eq!(flow.free_buffers, 0);
        assert!(flow.release(1));
        assert_eq!(flow.free_buffers, 1);
        assert!(flow.try_claim());
        assert!(!flow.release(0));
    }
    #[test]
    fn free_buffer_entries() {
        let entry = FreeBufferEntry::from_bits(u32::from_le_bytes([3, 0, 2, 0]));
        assert_eq!(entry.handle(), 3);
        assert_eq!(entry.free_buffers(), 2);
    }
}
