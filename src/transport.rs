//! The half duplex SPI link and the pump task driving it.
//!
//! The pump is the only code touching the bus. Callers hand it one frame at a time through the
//! [Link] mailbox and wait for it to be clocked out. Whenever the peer pulls the IRQ line low
//! without a frame being queued, the pump reads the inbound frame and hands it to the
//! correlator.

use embassy_sync::{mutex::Mutex, signal::Signal};
use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal_async::spi::SpiBus;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::{
    sync::SignalQueue,
    wire::{inbound_payload_len, READ_HEADER, RX_BUFFER_SIZE, SPI_HEADER_SIZE, TX_BUFFER_SIZE},
    DefaultRawMutex, Wlan, WlanError, WlanResult,
};

/// Pattern behind the end of every frame buffer. If it ever changes, memory was corrupted.
const GUARD_PATTERN: u8 = 0xde;
const FRAME_BUFFER_SIZE: usize = if TX_BUFFER_SIZE > RX_BUFFER_SIZE {
    TX_BUFFER_SIZE
} else {
    RX_BUFFER_SIZE
};
/// How often the IRQ line is sampled, while waiting for the peer to release it on power down.
const POWER_DOWN_POLLS: usize = 50;

/// A frame buffer with a guard byte behind its usable area.
pub(crate) struct FrameBuffer {
    bytes: [u8; FRAME_BUFFER_SIZE + 1],
}
impl FrameBuffer {
    pub const fn new() -> Self {
        let mut bytes = [0; FRAME_BUFFER_SIZE + 1];
        bytes[FRAME_BUFFER_SIZE] = GUARD_PATTERN;
        Self { bytes }
    }
    pub fn frame(&self) -> &[u8] {
        &self.bytes[..FRAME_BUFFER_SIZE]
    }
    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..FRAME_BUFFER_SIZE]
    }
    /// Panics if anything wrote past the end of the frame area.
    pub fn check_guard(&self) {
        if self.bytes[FRAME_BUFFER_SIZE] != GUARD_PATTERN {
            panic!("WLAN frame buffer overrun");
        }
    }
}

/// Counters kept by the interrupt side of the link.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IrqStats {
    /// Edges reported through [WlanIrq::on_interrupt].
    pub interrupts: u32,
    /// Times the pump found the line asserted after its wait for an edge timed out.
    pub missed: u32,
}

/// The interrupt facing half of the link.
///
/// This is meant to live in a `static`, so the interrupt handler of the IRQ line can reach it.
/// [WlanIrq::on_interrupt] only touches atomics and never blocks.
pub struct WlanIrq {
    phase: AtomicU8,
    power_up: SignalQueue,
    io_ready: SignalQueue,
    interrupts: AtomicU32,
    missed: AtomicU32,
}
impl WlanIrq {
    const PHASE_POWER_UP: u8 = 0;
    const PHASE_RUNNING: u8 = 1;
    pub const fn new() -> Self {
        Self {
            phase: AtomicU8::new(Self::PHASE_POWER_UP),
            power_up: SignalQueue::new(),
            io_ready: SignalQueue::new(),
            interrupts: AtomicU32::new(0),
            missed: AtomicU32::new(0),
        }
    }
    /// Call this from the falling edge interrupt of the IRQ line.
    pub fn on_interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::Relaxed);
        if self.phase.load(Ordering::Acquire) == Self::PHASE_POWER_UP {
            self.power_up.put();
        } else {
            self.io_ready.put();
        }
    }
    pub fn stats(&self) -> IrqStats {
        critical_section::with(|_| IrqStats {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
        })
    }
    /// Wake the pump without an edge on the line.
    fn kick(&self) {
        self.io_ready.put();
    }
    fn enter_power_up(&self) {
        self.power_up.reset();
        self.phase.store(Self::PHASE_POWER_UP, Ordering::Release);
    }
    fn enter_running(&self) {
        self.phase.store(Self::PHASE_RUNNING, Ordering::Release);
    }
    fn note_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }
}
impl Default for WlanIrq {
    fn default() -> Self {
        Self::new()
    }
}

/// Mailbox between the correlator and the pump.
pub(crate) struct Link<'a> {
    irq: &'a WlanIrq,
    tx: Mutex<DefaultRawMutex, FrameBuffer>,
    tx_len: AtomicUsize,
    tx_done: Signal<DefaultRawMutex, WlanResult<()>>,
    terminate: AtomicBool,
    halted: Signal<DefaultRawMutex, ()>,
}
impl<'a> Link<'a> {
    pub const fn new(irq: &'a WlanIrq) -> Self {
        Self {
            irq,
            tx: Mutex::new(FrameBuffer::new()),
            tx_len: AtomicUsize::new(0),
            tx_done: Signal::new(),
            terminate: AtomicBool::new(false),
            halted: Signal::new(),
        }
    }
    /// Build a frame in the transmit buffer and wait for the pump to clock it out.
    ///
    /// `build` returns the length of the frame including the link header.
    pub async fn transmit(&self, build: impl FnOnce(&mut [u8]) -> usize) -> WlanResult<()> {
        {
            let mut buffer = self.tx.lock().await;
            let len = build(buffer.frame_mut());
            buffer.check_guard();
            self.tx_done.reset();
            self.tx_len.store(len, Ordering::Release);
        }
        struct Withdraw<'l, 'a>(&'l Link<'a>);
        impl Drop for Withdraw<'_, '_> {
            fn drop(&mut self) {
                // Nothing happens if the pump already took the frame.
                self.0.tx_len.store(0, Ordering::Release);
            }
        }
        let _withdraw = Withdraw(self);
        self.irq.kick();
        self.tx_done.wait().await
    }
    /// Fail a transmission that is waiting for the pump.
    pub fn abort(&self) {
        if self.tx_len.swap(0, Ordering::AcqRel) != 0 {
            self.tx_done.signal(Err(WlanError::Stopped));
        }
    }
    pub fn irq_stats(&self) -> IrqStats {
        self.irq.stats()
    }
    /// Forget a termination request nobody serviced.
    pub fn clear_terminate(&self) {
        self.terminate.store(false, Ordering::Release);
    }
    pub fn request_terminate(&self) {
        self.halted.reset();
        self.terminate.store(true, Ordering::Release);
        self.irq.kick();
    }
    pub async fn wait_halted(&self) {
        self.halted.wait().await
    }
    fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }
    fn tx_pending(&self) -> bool {
        self.tx_len.load(Ordering::Acquire) != 0
    }
}

/// The pump task, which owns the bus and the control lines of the peer.
pub struct Transport<'a, SPI, CS, IRQ, EN> {
    wlan: &'a Wlan<'a>,
    spi: SPI,
    cs: CS,
    irq: IRQ,
    enable: EN,
    rx: FrameBuffer,
}
impl<'a, SPI, CS, IRQ, EN> Transport<'a, SPI, CS, IRQ, EN>
where
    SPI: SpiBus,
    CS: OutputPin,
    IRQ: InputPin,
    EN: OutputPin,
{
    /// Create the pump.
    ///
    /// `irq` is only sampled, edges have to be reported through [WlanIrq::on_interrupt].
    pub fn new(wlan: &'a Wlan<'a>, spi: SPI, cs: CS, irq: IRQ, enable: EN) -> Self {
        Self {
            wlan,
            spi,
            cs,
            irq,
            enable,
            rx: FrameBuffer::new(),
        }
    }
    fn link(&self) -> &'a Link<'a> {
        &self.wlan.hci.link
    }
    /// The IRQ line is active low.
    fn irq_asserted(&mut self) -> bool {
        self.irq.is_low().unwrap_or(false)
    }
    /// Start a transaction. Wakeups queued before this point are stale afterwards.
    fn select(&mut self) -> WlanResult<()> {
        self.cs.set_low().map_err(|_| WlanError::Bus)?;
        self.link().irq.io_ready.reset();
        Ok(())
    }
    fn deselect(&mut self) -> WlanResult<()> {
        self.cs.set_high().map_err(|_| WlanError::Bus)
    }
    /// Run the pump.
    ///
    /// This powers the peer up and services the link until [Wlan::stop] is called, after which
    /// the peer is powered down and this returns. Calling it again powers the peer up again.
    pub async fn run(&mut self) {
        let link = self.link();
        debug!("Powering up the WLAN peer.");
        if self.power_up().await {
            loop {
                self.wait_for_work().await;
                if link.terminate_requested() {
                    break;
                }
                if link.tx_pending() {
                    self.write_frame().await;
                } else if self.irq_asserted() {
                    self.read_frame().await;
                } else {
                    continue;
                }
                Timer::after(self.wlan.config.transaction_gap).await;
            }
        }
        self.power_down().await;
    }
    /// Wait for the peer to come up and send the first frame. Returns false if terminated.
    async fn power_up(&mut self) -> bool {
        let link = self.link();
        link.irq.enter_power_up();
        let _ = self.deselect();
        if self.enable.set_high().is_err() {
            error!("Failed to drive the enable line of the WLAN peer.");
        }
        loop {
            match with_timeout(self.wlan.config.irq_timeout, link.irq.power_up.next()).await {
                Ok(()) => break,
                Err(_) if self.irq_asserted() => {
                    link.irq.note_missed();
                    break;
                }
                Err(_) if link.terminate_requested() => return false,
                Err(_) => trace!("Still waiting for the WLAN peer to power up."),
            }
        }
        trace!("WLAN peer is up, waiting for the first frame.");
        while !link.tx_pending() {
            link.irq.io_ready.next().await;
            if link.terminate_requested() {
                return false;
            }
        }
        link.irq.enter_running();
        let result = self.first_write().await;
        self.complete_write(result);
        Timer::after(self.wlan.config.transaction_gap).await;
        true
    }
    /// The peer only arms its interrupt after it saw the first transaction, which needs a pause
    /// after the first four bytes.
    async fn first_write(&mut self) -> WlanResult<()> {
        let link = self.link();
        let buffer = link.tx.lock().await;
        let len = link.tx_len.load(Ordering::Acquire);
        let frame = &buffer.frame()[..len];
        self.select()?;
        Timer::after(Duration::from_micros(50)).await;
        let mut result = self.spi.write(&frame[..4]).await;
        if result.is_ok() {
            Timer::after(Duration::from_micros(50)).await;
            result = self.spi.write(&frame[4..]).await;
        }
        let _ = self.spi.flush().await;
        self.deselect()?;
        buffer.check_guard();
        trace!("Sent first frame, len: {}", len);
        result.map_err(|_| WlanError::Bus)
    }
    fn complete_write(&self, result: WlanResult<()>) {
        let link = self.link();
        if link.tx_len.swap(0, Ordering::AcqRel) != 0 {
            link.tx_done.signal(result);
        }
    }
    /// Wait for one wakeup, bounded by the IRQ timeout. Returns false, if the wait timed out
    /// with the line idle.
    ///
    /// Edges are occasionally lost, so the line is sampled by hand once the wait timed out.
    async fn wait_edge(&mut self) -> bool {
        let link = self.link();
        match with_timeout(self.wlan.config.irq_timeout, link.irq.io_ready.next()).await {
            Ok(()) => true,
            Err(_) if self.irq_asserted() => {
                warn!("Recovered from a missed WLAN interrupt.");
                link.irq.note_missed();
                true
            }
            Err(_) => false,
        }
    }
    /// Wait until there may be a frame to move in either direction.
    ///
    /// Host side requests are checked first, since their wakeup may have been dropped with the
    /// stale ones at the start of the last transaction.
    async fn wait_for_work(&mut self) {
        let link = self.link();
        while !link.terminate_requested() && !link.tx_pending() {
            if self.wait_edge().await {
                return;
            }
        }
    }
    async fn write_frame(&mut self) {
        let result = self.transfer_out().await;
        if let Err(err) = result {
            error!("Writing a frame failed: {:?}", err);
        }
        self.complete_write(result);
    }
    async fn transfer_out(&mut self) -> WlanResult<()> {
        let link = self.link();
        let buffer = link.tx.lock().await;
        self.select()?;
        // The peer acknowledges chip select by asserting its IRQ line.
        while !self.irq_asserted() {
            if link.terminate_requested() {
                self.deselect()?;
                return Err(WlanError::Stopped);
            }
            self.wait_edge().await;
        }
        let len = link.tx_len.load(Ordering::Acquire);
        let result = if len == 0 {
            // The caller gave up while we were waiting for the peer.
            Ok(())
        } else {
            let result = self.spi.write(&buffer.frame()[..len]).await;
            let _ = self.spi.flush().await;
            result
        };
        self.deselect()?;
        buffer.check_guard();
        trace!("Sent frame, len: {}", len);
        result.map_err(|_| WlanError::Bus)
    }
    async fn read_frame(&mut self) {
        match self.transfer_in().await {
            Ok(Some(len)) => {
                self.rx.check_guard();
                self.wlan.dispatch_packet(&self.rx.frame()[..len]);
            }
            Ok(None) => {}
            Err(err) => {
                let _ = self.deselect();
                error!("Reading a frame failed: {:?}", err);
            }
        }
    }
    /// Clock in one frame. Returns the payload length, or `None` if the frame was dropped.
    async fn transfer_in(&mut self) -> WlanResult<Option<usize>> {
        let mut header = [0u8; SPI_HEADER_SIZE];
        self.select()?;
        self.spi
            .transfer(&mut header, &READ_HEADER)
            .await
            .map_err(|_| WlanError::Bus)?;
        let len = inbound_payload_len(&header);
        let capacity = RX_BUFFER_SIZE - SPI_HEADER_SIZE;
        if len > capacity {
            // Clock the frame out anyway, so the peer moves on to the next one.
            let mut remaining = len;
            while remaining > 0 {
                let chunk = remaining.min(capacity);
                self.spi
                    .read(&mut self.rx.frame_mut()[..chunk])
                    .await
                    .map_err(|_| WlanError::Bus)?;
                remaining -= chunk;
            }
            self.deselect()?;
            warn!("Dropped inbound frame of {} bytes, which exceeds the buffer.", len);
            return Ok(None);
        }
        self.spi
            .read(&mut self.rx.frame_mut()[..len])
            .await
            .map_err(|_| WlanError::Bus)?;
        self.deselect()?;
        trace!("Received frame, len: {}", len);
        Ok(Some(len))
    }
    async fn power_down(&mut self) {
        let link = self.link();
        debug!("Powering down the WLAN peer.");
        if self.enable.set_low().is_err() {
            error!("Failed to drive the enable line of the WLAN peer.");
        }
        let _ = self.deselect();
        for _ in 0..POWER_DOWN_POLLS {
            if !self.irq_asserted() {
                break;
            }
            Timer::after(Duration::from_millis(10)).await;
        }
        link.irq.enter_power_up();
        link.irq.io_ready.reset();
        link.terminate.store(false, Ordering::Release);
        link.abort();
        link.halted.signal(());
    }
}
