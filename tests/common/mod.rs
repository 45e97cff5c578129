//! A simulated peer behind fake bus and pin implementations.
//!
//! The peer answers every command the way the real chip would, keeps per socket receive queues and
//! drives its IRQ line like the hardware: low while it has a frame queued or while the host holds
//! chip select, released at the end of every transaction.
#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    convert::Infallible,
    future::Future,
    net::{Ipv4Addr, SocketAddrV4},
    rc::Rc,
};

use cc3000_hal::{
    wire::{
        data_opcode, encode_sockaddr, opcode, ERROR_SOCKET_INACTIVE, SOC_ERROR, SOC_IN_PROGRESS,
    },
    Config, Transport, Wlan, WlanIrq,
};
use embassy_futures::select::{select3, Either3};
use embassy_time::Duration;
use embedded_hal::digital::{self, InputPin, OutputPin};
use embedded_hal_async::spi::{self, SpiBus};

const SPI_OP_WRITE: u8 = 1;
const SPI_OP_READ: u8 = 3;

fn read_word(bytes: &[u8], offset: usize) -> i32 {
    bytes
        .get(offset..offset + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .unwrap_or_default()
}

/// An event frame as the peer sends it.
pub fn event(op: u16, status: u8, params: &[u8]) -> Vec<u8> {
    let mut packet = vec![4];
    packet.extend_from_slice(&op.to_le_bytes());
    packet.push(params.len() as u8 + 1);
    packet.push(status);
    packet.extend_from_slice(params);
    packet
}
/// An event carrying a single signed word.
pub fn status_event(op: u16, status: i32) -> Vec<u8> {
    event(op, 0, &status.to_le_bytes())
}
/// A data frame as the peer sends it.
pub fn data_frame(op: u8, args: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![2, op, args.len() as u8];
    packet.extend_from_slice(&((args.len() + payload.len()) as u16).to_le_bytes());
    packet.extend_from_slice(args);
    packet.extend_from_slice(payload);
    packet
}
/// Hands `count` device buffers back to the host.
pub fn free_buffers(count: u16) -> Vec<u8> {
    let mut params = vec![1, 0, 0, 0];
    params.extend_from_slice(&count.to_le_bytes());
    event(opcode::DATA_UNSOL_FREE_BUFF, 0, &params)
}

#[derive(Debug, Default)]
pub struct PeerSocket {
    pub rx: VecDeque<Vec<u8>>,
    /// Source reported for everything received through recvfrom.
    pub from: Option<SocketAddrV4>,
    /// Answer every request on this socket with the inactive status.
    pub inactive: bool,
}

/// The network processor side of the link.
#[derive(Debug)]
pub struct Peer {
    pub free_buffers: u8,
    pub buffer_length: u16,
    /// Release the device buffer right after every send.
    pub release_after_send: bool,
    /// Queue everything sent on a socket for receiving on the same socket.
    pub echo: bool,
    pub max_sockets: usize,
    pub sockets: BTreeMap<i32, PeerSocket>,
    /// Connections waiting to be accepted.
    pub backlog: VecDeque<SocketAddrV4>,
    pub hosts: Vec<(&'static str, Ipv4Addr)>,
    /// Commands that never get a reply.
    pub silent: Vec<u16>,
    /// Commands answered with an event, that declares more bytes than it carries.
    pub garbled: Vec<u16>,
    pub mac: [u8; 6],
    /// Address reported by the interface configuration.
    pub ip: Ipv4Addr,
    /// Opcodes of every command received.
    pub commands: Vec<u16>,
    /// Arguments of the last command received per opcode.
    pub last_args: BTreeMap<u16, Vec<u8>>,
    /// Opcode and payload of every data frame received.
    pub data_frames: Vec<(u8, Vec<u8>)>,
    /// Kind and size of every patch uploaded.
    pub patches: Vec<(u8, usize)>,
    next_descriptor: i32,
    /// Kind and outstanding bytes of the patch being uploaded.
    patch: Option<(u8, usize, usize)>,
}
impl Default for Peer {
    fn default() -> Self {
        Self {
            free_buffers: 6,
            buffer_length: 1476,
            release_after_send: true,
            echo: true,
            max_sockets: 8,
            sockets: BTreeMap::new(),
            backlog: VecDeque::new(),
            hosts: Vec::new(),
            silent: Vec::new(),
            garbled: Vec::new(),
            mac: [0x08, 0x00, 0x28, 0x01, 0x02, 0x03],
            ip: Ipv4Addr::new(192, 168, 1, 20),
            commands: Vec::new(),
            last_args: BTreeMap::new(),
            data_frames: Vec::new(),
            patches: Vec::new(),
            next_descriptor: 0,
            patch: None,
        }
    }
}
impl Peer {
    fn power_cycle(&mut self) {
        self.sockets.clear();
        self.backlog.clear();
        self.next_descriptor = 0;
        self.patch = None;
    }
    /// How many commands with `op` were received.
    pub fn count(&self, op: u16) -> usize {
        self.commands.iter().filter(|command| **command == op).count()
    }
    /// Queue `data` for receiving on `descriptor`.
    pub fn deliver(&mut self, descriptor: i32, data: &[u8]) {
        if let Some(socket) = self.sockets.get_mut(&descriptor) {
            socket.rx.push_back(data.to_vec());
        }
    }
    fn allocate(&mut self) -> i32 {
        if self.sockets.len() >= self.max_sockets {
            return SOC_ERROR;
        }
        let descriptor = self.next_descriptor;
        self.next_descriptor += 1;
        self.sockets.insert(descriptor, PeerSocket::default());
        descriptor
    }
    /// Handle one HCI frame. The first frame returned is the reply, if there is one.
    fn handle(&mut self, hci: &[u8]) -> Vec<Vec<u8>> {
        if let Some((kind, size, remaining)) = self.patch.take() {
            let portion = u16::from_le_bytes([hci[0], hci[1]]) as usize;
            return self.patch_portion(kind, size + portion, remaining.saturating_sub(2 + portion));
        }
        match hci.first() {
            Some(1) => {
                let op = u16::from_le_bytes([hci[1], hci[2]]);
                let len = hci[3] as usize;
                self.command(op, &hci[4..4 + len])
            }
            Some(2) => {
                let arg_len = hci[2] as usize;
                let body_len = u16::from_le_bytes([hci[3], hci[4]]) as usize;
                let body = &hci[5..5 + body_len];
                self.data(hci[1], &body[..arg_len], &body[arg_len..])
            }
            Some(3) => {
                let total = u16::from_le_bytes([hci[2], hci[3]]) as usize;
                let portion = u16::from_le_bytes([hci[4], hci[5]]) as usize;
                self.patch_portion(hci[1], portion, total.saturating_sub(2 + portion))
            }
            _ => Vec::new(),
        }
    }
    fn patch_portion(&mut self, kind: u8, size: usize, remaining: usize) -> Vec<Vec<u8>> {
        if remaining > 0 {
            self.patch = Some((kind, size, remaining));
            return Vec::new();
        }
        self.patches.push((kind, size));
        if kind < 3 {
            vec![event(opcode::PATCHES_REQUEST, 0, &[kind + 1])]
        } else {
            vec![event(opcode::SIMPLE_LINK_START, 0, &[])]
        }
    }
    fn command(&mut self, op: u16, args: &[u8]) -> Vec<Vec<u8>> {
        self.commands.push(op);
        self.last_args.insert(op, args.to_vec());
        if self.silent.contains(&op) {
            return Vec::new();
        }
        if self.garbled.contains(&op) {
            let [low, high] = op.to_le_bytes();
            return vec![vec![4, low, high, 60, 0, 0, 0]];
        }
        match op {
            opcode::SIMPLE_LINK_START if args.first() == Some(&1) => {
                vec![event(opcode::PATCHES_REQUEST, 0, &[1])]
            }
            opcode::SIMPLE_LINK_START => vec![event(op, 0, &[])],
            opcode::READ_BUFFER_SIZE => {
                let [low, high] = self.buffer_length.to_le_bytes();
                vec![event(op, 0, &[self.free_buffers, low, high])]
            }
            opcode::SOCKET => {
                let descriptor = self.allocate();
                vec![status_event(op, descriptor)]
            }
            opcode::CLOSE_SOCKET => {
                self.sockets.remove(&read_word(args, 0));
                vec![status_event(op, 0)]
            }
            opcode::ACCEPT => {
                let mut params = read_word(args, 0).to_le_bytes().to_vec();
                match self.backlog.pop_front() {
                    Some(addr) => {
                        params.extend_from_slice(&self.allocate().to_le_bytes());
                        params.extend_from_slice(&encode_sockaddr(&addr));
                    }
                    None => {
                        params.extend_from_slice(&SOC_IN_PROGRESS.to_le_bytes());
                        params.extend_from_slice(&[0; 8]);
                    }
                }
                vec![event(op, 0, &params)]
            }
            opcode::SELECT => {
                let requested = read_word(args, 24) as u32;
                let ready = self
                    .sockets
                    .iter()
                    .filter(|(descriptor, socket)| {
                        (0..32).contains(*descriptor)
                            && requested & (1 << **descriptor) != 0
                            && !socket.rx.is_empty()
                    })
                    .fold(0u32, |mask, (descriptor, _)| mask | (1 << descriptor));
                let mut params = (ready.count_ones() as i32).to_le_bytes().to_vec();
                params.extend_from_slice(&ready.to_le_bytes());
                params.extend_from_slice(&[0; 8]);
                vec![event(op, 0, &params)]
            }
            opcode::RECV | opcode::RECV_FROM => {
                self.recv(op, read_word(args, 0), read_word(args, 4) as usize)
            }
            opcode::GET_HOST_BY_NAME => {
                let len = read_word(args, 4) as usize;
                let name = &args[8..8 + len];
                let mut params = Vec::new();
                match self.hosts.iter().find(|(host, _)| host.as_bytes() == name) {
                    Some((_, ip)) => {
                        params.extend_from_slice(&0i32.to_le_bytes());
                        params.extend_from_slice(&u32::from(*ip).to_le_bytes());
                    }
                    None => {
                        params.extend_from_slice(&SOC_ERROR.to_le_bytes());
                        params.extend_from_slice(&[0; 4]);
                    }
                }
                vec![event(op, 0, &params)]
            }
            opcode::GET_SOCK_OPT => vec![event(op, 0, &[1, 0, 0, 0])],
            opcode::NVMEM_READ => {
                let len = read_word(args, 4) as usize;
                let offset = read_word(args, 8) as usize;
                let bytes = self.mac.get(offset..).unwrap_or_default();
                let bytes = &bytes[..len.min(bytes.len())];
                vec![event(op, 0, &[]), data_frame(data_opcode::NVMEM, &[0; 8], bytes)]
            }
            opcode::NETAPP_IP_CONFIG => {
                let mut params = Vec::new();
                for addr in [self.ip, Ipv4Addr::new(255, 255, 255, 0), Ipv4Addr::new(192, 168, 1, 1)] {
                    params.extend(addr.octets().iter().rev());
                }
                params.extend_from_slice(&[0; 8]);
                params.extend_from_slice(&self.mac);
                params.extend_from_slice(b"home-net");
                params.extend_from_slice(&[0; 24]);
                vec![event(op, 0, &params)]
            }
            opcode::READ_SP_VERSION => vec![event(op, 0, &[0, 0, 1, 24])],
            opcode::WLAN_STATUS_GET => vec![status_event(op, 3)],
            _ => vec![status_event(op, 0)],
        }
    }
    fn recv(&mut self, op: u16, descriptor: i32, len: usize) -> Vec<Vec<u8>> {
        let mut params = descriptor.to_le_bytes().to_vec();
        let Some(socket) = self.sockets.get_mut(&descriptor) else {
            params.extend_from_slice(&SOC_ERROR.to_le_bytes());
            params.extend_from_slice(&[0; 4]);
            return vec![event(op, 0, &params)];
        };
        if socket.inactive {
            params.extend_from_slice(&ERROR_SOCKET_INACTIVE.to_le_bytes());
            params.extend_from_slice(&[0; 4]);
            return vec![event(op, 0, &params)];
        }
        let chunk = match socket.rx.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > len {
                    let rest = chunk.split_off(len);
                    socket.rx.push_front(rest);
                }
                chunk
            }
            None => Vec::new(),
        };
        params.extend_from_slice(&(chunk.len() as i32).to_le_bytes());
        params.extend_from_slice(&[0; 4]);
        let mut out = vec![event(op, 0, &params)];
        if !chunk.is_empty() {
            let mut args = [0u8; 24];
            args[..4].copy_from_slice(&descriptor.to_le_bytes());
            let data_op = if op == opcode::RECV_FROM {
                if let Some(from) = socket.from {
                    args[4..8].copy_from_slice(&8u32.to_le_bytes());
                    args[16..24].copy_from_slice(&encode_sockaddr(&from));
                }
                data_opcode::RECV_FROM
            } else {
                data_opcode::RECV
            };
            out.push(data_frame(data_op, &args, &chunk));
        }
        out
    }
    fn data(&mut self, op: u8, args: &[u8], payload: &[u8]) -> Vec<Vec<u8>> {
        self.data_frames.push((op, payload.to_vec()));
        let descriptor = read_word(args, 0);
        let len = (read_word(args, 8) as usize).min(payload.len());
        let body = &payload[..len];
        let reply_op = match op {
            data_opcode::SEND_TO => opcode::SEND_TO,
            _ => opcode::SEND,
        };
        let bytes = match self.sockets.get_mut(&descriptor) {
            Some(socket) if socket.inactive => ERROR_SOCKET_INACTIVE,
            Some(socket) => {
                if self.echo {
                    socket.rx.push_back(body.to_vec());
                }
                body.len() as i32
            }
            None => SOC_ERROR,
        };
        let mut params = descriptor.to_le_bytes().to_vec();
        params.extend_from_slice(&bytes.to_le_bytes());
        let mut out = vec![event(reply_op, 0, &params)];
        if self.release_after_send {
            out.push(free_buffers(1));
        }
        out
    }
}

struct Queued {
    packet: Vec<u8>,
    /// Answers a host request, as opposed to arriving unasked.
    reply: bool,
}

#[derive(Default)]
struct ChipState {
    powered: bool,
    /// Powered up, but the host didn't send its first frame yet.
    first_pending: bool,
    cs_low: bool,
    irq_low: bool,
    drop_edges: bool,
    outbox: VecDeque<Queued>,
    /// Bytes clocked in during the current transaction.
    mosi: Vec<u8>,
    /// Bytes clocked out during the current transaction.
    miso: Vec<u8>,
    miso_pos: usize,
    reading: bool,
    window_writes: Vec<usize>,
    first_window: Option<Vec<usize>>,
    power_downs: usize,
    /// Host frames that arrived, while a reply was still unread.
    overlaps: usize,
    peer: Peer,
}

/// The simulated chip. Clones of the [Rc] back the bus and every pin.
pub struct Chip {
    irq: &'static WlanIrq,
    state: RefCell<ChipState>,
}
impl Chip {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            irq: Box::leak(Box::new(WlanIrq::new())),
            state: RefCell::new(ChipState::default()),
        })
    }
    pub fn irq(&self) -> &'static WlanIrq {
        self.irq
    }
    pub fn bus(self: &Rc<Self>) -> (Spi, ChipSelect, IrqLine, Enable) {
        (
            Spi(self.clone()),
            ChipSelect(self.clone()),
            IrqLine(self.clone()),
            Enable(self.clone()),
        )
    }
    pub fn peer<R>(&self, f: impl FnOnce(&mut Peer) -> R) -> R {
        f(&mut self.state.borrow_mut().peer)
    }
    /// Send a frame unasked.
    pub fn push(&self, packet: Vec<u8>) {
        let mut state = self.state.borrow_mut();
        state.outbox.push_back(Queued {
            packet,
            reply: false,
        });
        self.refresh(&mut state);
    }
    pub fn push_event(&self, op: u16, status: u8, params: &[u8]) {
        self.push(event(op, status, params));
    }
    /// Keep driving the IRQ line, but stop reporting its edges.
    pub fn drop_edges(&self, drop: bool) {
        self.state.borrow_mut().drop_edges = drop;
    }
    pub fn is_powered(&self) -> bool {
        self.state.borrow().powered
    }
    pub fn power_downs(&self) -> usize {
        self.state.borrow().power_downs
    }
    pub fn overlaps(&self) -> usize {
        self.state.borrow().overlaps
    }
    /// Sizes of the writes in the first transaction after power up.
    pub fn first_window(&self) -> Option<Vec<usize>> {
        self.state.borrow().first_window.clone()
    }
    fn refresh(&self, state: &mut ChipState) {
        let low = state.powered && (state.first_pending || state.cs_low || !state.outbox.is_empty());
        if low && !state.irq_low && !state.drop_edges {
            self.irq.on_interrupt();
        }
        state.irq_low = low;
    }
    fn set_enable(&self, high: bool) {
        let mut state = self.state.borrow_mut();
        if high == state.powered {
            return;
        }
        state.powered = high;
        state.first_pending = high;
        state.outbox.clear();
        state.irq_low = false;
        if high {
            state.peer.power_cycle();
        } else {
            state.power_downs += 1;
        }
        self.refresh(&mut state);
    }
    fn select(&self) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.cs_low = true;
        state.mosi.clear();
        state.window_writes.clear();
        state.miso_pos = 0;
        state.miso = vec![2, 0xff, 0, 0, 0];
        state.reading = false;
        if let Some(front) = state.outbox.front() {
            state.miso[3..5].copy_from_slice(&(front.packet.len() as u16).to_be_bytes());
            state.miso.extend_from_slice(&front.packet);
            state.reading = true;
        }
        self.refresh(state);
    }
    fn deselect(&self) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if !state.cs_low {
            return;
        }
        state.cs_low = false;
        match state.mosi.first().copied() {
            Some(SPI_OP_WRITE) => {
                if state.first_pending {
                    state.first_pending = false;
                    state.first_window = Some(state.window_writes.clone());
                }
                if state.outbox.iter().any(|queued| queued.reply) {
                    state.overlaps += 1;
                }
                let len = u16::from_be_bytes([state.mosi[1], state.mosi[2]]) as usize;
                let end = (5 + len).min(state.mosi.len());
                let hci = state.mosi[5..end].to_vec();
                let mut replies = state.peer.handle(&hci).into_iter();
                if let Some(packet) = replies.next() {
                    state.outbox.push_back(Queued {
                        packet,
                        reply: true,
                    });
                }
                for packet in replies {
                    state.outbox.push_back(Queued {
                        packet,
                        reply: false,
                    });
                }
            }
            Some(SPI_OP_READ) if state.reading => {
                state.outbox.pop_front();
            }
            _ => {}
        }
        // The line is released at the end of every transaction.
        state.irq_low = false;
        self.refresh(state);
    }
    fn clock(&self, mosi: &[u8], miso: &mut [u8]) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.mosi.extend_from_slice(mosi);
        let start = state.miso_pos;
        for (index, byte) in miso.iter_mut().enumerate() {
            *byte = state.miso.get(start + index).copied().unwrap_or(0);
        }
        state.miso_pos += mosi.len().max(miso.len());
    }
}

pub struct Spi(Rc<Chip>);
impl spi::ErrorType for Spi {
    type Error = Infallible;
}
impl SpiBus for Spi {
    async fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.0.clock(&[], words);
        Ok(())
    }
    async fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        self.0.state.borrow_mut().window_writes.push(words.len());
        self.0.clock(words, &mut []);
        Ok(())
    }
    async fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        self.0.clock(write, read);
        Ok(())
    }
    async fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let write = words.to_vec();
        self.0.clock(&write, words);
        Ok(())
    }
    async fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

pub struct ChipSelect(Rc<Chip>);
impl digital::ErrorType for ChipSelect {
    type Error = Infallible;
}
impl OutputPin for ChipSelect {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.select();
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.deselect();
        Ok(())
    }
}

pub struct IrqLine(Rc<Chip>);
impl digital::ErrorType for IrqLine {
    type Error = Infallible;
}
impl InputPin for IrqLine {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        Ok(!self.0.state.borrow().irq_low)
    }
    fn is_low(&mut self) -> Result<bool, Infallible> {
        Ok(self.0.state.borrow().irq_low)
    }
}

pub struct Enable(Rc<Chip>);
impl digital::ErrorType for Enable {
    type Error = Infallible;
}
impl OutputPin for Enable {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.set_enable(false);
        Ok(())
    }
    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.set_enable(true);
        Ok(())
    }
}

/// Short timings, so the tests don't wait on the defaults.
pub fn config() -> Config {
    Config {
        irq_timeout: Duration::from_millis(50),
        transaction_gap: Duration::from_micros(100),
        command_timeout: Some(Duration::from_secs(2)),
        buffer_timeout: Some(Duration::from_secs(2)),
        select_timeout: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
        accept_timeout: Some(Duration::from_secs(5)),
        shutdown_timeout: Duration::from_secs(1),
        inform_host_on_tx_complete: true,
    }
}

pub fn rig(config: Config) -> (Rc<Chip>, Wlan<'static>) {
    let chip = Chip::new();
    let wlan = Wlan::new(chip.irq(), config);
    (chip, wlan)
}

/// Run `body` while the pump and the poller service `wlan`.
///
/// The pump is restarted whenever it returns, the way a firmware task would loop over it.
pub async fn drive<T>(chip: &Rc<Chip>, wlan: &Wlan<'_>, body: impl Future<Output = T>) -> T {
    let (spi, cs, irq, enable) = chip.bus();
    let mut transport = Transport::new(wlan, spi, cs, irq, enable);
    let pump = async {
        loop {
            transport.run().await;
        }
    };
    match select3(pump, wlan.run_poller(), body).await {
        Either3::Third(result) => result,
        _ => unreachable!("the pump and the poller never return"),
    }
}
