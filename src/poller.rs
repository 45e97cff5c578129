//! The readiness poller.
//!
//! The peer never announces readable sockets on its own, it has to be asked. While anyone waits
//! in [Wlan::recv] or [Wlan::accept], the poller repeatedly queries readiness of all active
//! sockets with a short timeout and wakes the readers of the sockets reported readable. An accept
//! in progress is probed with a non blocking accept in the same cycle.

use core::{cell::Cell, net::SocketAddrV4};

use embassy_sync::{blocking_mutex, channel::Channel, signal::Signal};
use embassy_time::Timer;
use portable_atomic::{AtomicUsize, Ordering};

use crate::{
    reply::Reply,
    socket::{Socket, MAX_SOCKETS},
    wire::{opcode, Args, SOC_IN_PROGRESS},
    DefaultRawMutex, Wlan, WlanError, WlanResult,
};

/// The one accept, that may be in progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct AcceptTarget {
    pub listener: Socket,
    pub descriptor: i32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum AcceptState {
    #[default]
    Idle,
    /// Claimed by a caller, which is still preparing the listener.
    Claimed(AcceptTarget),
    /// Probed by the poller on every cycle.
    Probing(AcceptTarget),
}

/// A connection taken from the backlog of the listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Accepted {
    pub descriptor: i32,
    pub addr: Option<SocketAddrV4>,
}

pub(crate) struct Poller {
    waiters: AtomicUsize,
    wake: Signal<DefaultRawMutex, ()>,
    accept: blocking_mutex::Mutex<DefaultRawMutex, Cell<AcceptState>>,
    accepted: Signal<DefaultRawMutex, WlanResult<Accepted>>,
    /// Connections the peer accepted after their caller gave up. The poller closes them.
    orphans: Channel<DefaultRawMutex, i32, MAX_SOCKETS>,
}
impl Poller {
    pub const fn new() -> Self {
        Self {
            waiters: AtomicUsize::new(0),
            wake: Signal::new(),
            accept: blocking_mutex::Mutex::new(Cell::new(AcceptState::Idle)),
            accepted: Signal::new(),
            orphans: Channel::new(),
        }
    }
    pub fn reset(&self) {
        self.accept.lock(|state| state.set(AcceptState::Idle));
        self.accepted.reset();
        // Descriptors of a previous session mean nothing to a restarted peer.
        while self.orphans.try_receive().is_ok() {}
    }
    /// Keep the poller running, until the returned guard is dropped.
    pub fn register_waiter(&self) -> Waiter<'_> {
        self.waiters.fetch_add(1, Ordering::AcqRel);
        self.wake.signal(());
        Waiter { poller: self }
    }
    fn is_busy(&self) -> bool {
        self.waiters.load(Ordering::Acquire) != 0
            || !self.orphans.is_empty()
            || matches!(
                self.accept.lock(|state| state.get()),
                AcceptState::Probing(_)
            )
    }
    fn probing(&self) -> Option<AcceptTarget> {
        match self.accept.lock(|state| state.get()) {
            AcceptState::Probing(target) => Some(target),
            _ => None,
        }
    }
    /// Claim the accept slot for `target`.
    pub fn claim_accept(&self, target: AcceptTarget) -> WlanResult<PendingAccept<'_>> {
        self.accept.lock(|state| {
            if state.get() != AcceptState::Idle {
                return Err(WlanError::Busy);
            }
            state.set(AcceptState::Claimed(target));
            Ok(())
        })?;
        self.accepted.reset();
        Ok(PendingAccept {
            poller: self,
            target,
        })
    }
    /// Finish the accept for `target`, if it's still the one in progress.
    fn resolve_accept(&self, target: AcceptTarget, result: WlanResult<Accepted>) {
        let current = self.accept.lock(|state| {
            let current = state.get() == AcceptState::Probing(target);
            if current {
                state.set(AcceptState::Idle);
            }
            current
        });
        if current {
            self.accepted.signal(result);
        } else if let Ok(accepted) = result {
            self.orphan(accepted.descriptor);
        }
    }
    /// Hand a connection nobody will collect to the poller for closing.
    fn orphan(&self, descriptor: i32) {
        warn!(
            "Connection {} was accepted, but nobody collected it.",
            descriptor
        );
        if self.orphans.try_send(descriptor).is_err() {
            error!("Too many uncollected connections, leaking {}.", descriptor);
        }
        self.wake.signal(());
    }
    /// Fail the accept in progress, if there is one.
    pub fn abort(&self, err: WlanError) {
        let was_pending = self
            .accept
            .lock(|state| state.replace(AcceptState::Idle))
            != AcceptState::Idle;
        if was_pending {
            self.accepted.signal(Err(err));
        }
    }
    /// Fail the accept in progress, if it's waiting on `listener`.
    pub fn abort_for(&self, listener: Socket, err: WlanError) {
        let matches = self.accept.lock(|state| match state.get() {
            AcceptState::Claimed(target) | AcceptState::Probing(target)
                if target.listener == listener =>
            {
                state.set(AcceptState::Idle);
                true
            }
            _ => false,
        });
        if matches {
            self.accepted.signal(Err(err));
        }
    }
}

/// A registered reader.
pub(crate) struct Waiter<'p> {
    poller: &'p Poller,
}
impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        self.poller.waiters.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The accept slot, claimed by one caller. Dropping it returns the slot to idle.
pub(crate) struct PendingAccept<'p> {
    poller: &'p Poller,
    target: AcceptTarget,
}
impl PendingAccept<'_> {
    /// Hand the accept over to the poller.
    pub fn start_probing(&self) {
        self.poller.accept.lock(|state| {
            if state.get() == AcceptState::Claimed(self.target) {
                state.set(AcceptState::Probing(self.target));
            }
        });
        self.poller.wake.signal(());
    }
    pub async fn wait(&self) -> WlanResult<Accepted> {
        self.poller.accepted.wait().await
    }
}
impl Drop for PendingAccept<'_> {
    fn drop(&mut self) {
        let target = self.target;
        self.poller.accept.lock(|state| match state.get() {
            AcceptState::Claimed(current) | AcceptState::Probing(current) if current == target => {
                state.set(AcceptState::Idle)
            }
            _ => {}
        });
        if let Some(Ok(accepted)) = self.poller.accepted.try_take() {
            self.poller.orphan(accepted.descriptor);
        }
    }
}

impl Wlan<'_> {
    /// Run the readiness poller.
    ///
    /// This has to be polled for as long as the [Wlan] is used. It sleeps while nobody waits for
    /// readiness.
    pub async fn run_poller(&self) -> ! {
        loop {
            if self.hci.is_stopped() || !self.poller.is_busy() {
                self.poller.wake.wait().await;
                continue;
            }
            self.poll_once().await;
            Timer::after(self.config.poll_interval).await;
        }
    }
    async fn poll_once(&self) {
        while let Ok(descriptor) = self.poller.orphans.try_receive() {
            self.close_orphan(descriptor).await;
        }
        let accept = self.poller.probing();
        let listener = accept.map(|target| target.listener);
        let (nfds, mask) = self.sockets.read_mask(listener);
        if mask != 0 {
            match self
                .select(nfds, mask, 0, 0, Some(self.config.select_timeout))
                .await
            {
                Ok(reply) if reply.status > 0 => self.sockets.signal_readable(reply.read, listener),
                Ok(_) => {}
                Err(WlanError::Stopped) => return,
                Err(err) => warn!("Readiness query failed: {:?}", err),
            }
        }
        if let Some(target) = accept {
            self.probe_accept(target).await;
        }
    }
    async fn close_orphan(&self, descriptor: i32) {
        debug!("Closing uncollected connection {}.", descriptor);
        let result = async {
            let mut hci = self.hci.lock().await?;
            hci.command(opcode::CLOSE_SOCKET, Args::new().i32(descriptor).as_slice())
                .await?
                .into_status()
        }
        .await;
        if let Err(err) = result {
            warn!("Closing connection {} failed: {:?}", descriptor, err);
        }
    }
    async fn probe_accept(&self, target: AcceptTarget) {
        let result = async {
            let mut hci = self.hci.lock().await?;
            hci.command(opcode::ACCEPT, Args::new().i32(target.descriptor).as_slice())
                .await
        }
        .await;
        let result = match result {
            Ok(Reply::Accept {
                status: SOC_IN_PROGRESS,
                ..
            }) => return,
            Ok(Reply::Accept { status, addr, .. }) if status >= 0 => {
                debug!("Accepted connection {} on {}.", status, target.descriptor);
                Ok(Accepted {
                    descriptor: status,
                    addr,
                })
            }
            Ok(Reply::Accept { status, .. }) => Err(WlanError::Peer(status)),
            Ok(_) => Err(WlanError::InvalidFrame),
            // Stopping fails the accept by itself.
            Err(WlanError::Stopped) => return,
            Err(err) => Err(err),
        };
        self.poller.resolve_accept(target, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::Sockets;
    use embassy_futures::block_on;

    fn target(sockets: &Sockets, descriptor: i32) -> AcceptTarget {
        AcceptTarget {
            listener: sockets.reserve().unwrap().commit(descriptor),
            descriptor,
        }
    }

    #[test]
    fn only_one_accept() {
        let sockets = Sockets::new();
        let poller = Poller::new();
        let first = target(&sockets, 1);
        let pending = poller.claim_accept(first).unwrap();
        assert!(!poller.is_busy());
        pending.start_probing();
        assert!(poller.is_busy());
        assert_eq!(poller.probing(), Some(first));
        assert!(matches!(
            poller.claim_accept(target(&sockets, 2)),
            Err(WlanError::Busy)
        ));
        drop(pending);
        assert_eq!(poller.probing(), None);
        assert!(poller.claim_accept(first).is_ok());
    }
    #[test]
    fn resolution_wakes_the_caller() {
        let sockets = Sockets::new();
        let poller = Poller::new();
        let listener = target(&sockets, 1);
        let pending = poller.claim_accept(listener).unwrap();
        pending.start_probing();
        let accepted = Accepted {
            descriptor: 2,
            addr: None,
        };
        poller.resolve_accept(listener, Ok(accepted));
        assert_eq!(block_on(pending.wait()), Ok(accepted));
        assert_eq!(poller.probing(), None);
    }
    #[test]
    fn late_connections_are_kept_for_closing() {
        let sockets = Sockets::new();
        let poller = Poller::new();
        let listener = target(&sockets, 1);
        let accepted = |descriptor| Accepted {
            descriptor,
            addr: None,
        };

        // The caller gave up before the peer answered.
        let pending = poller.claim_accept(listener).unwrap();
        pending.start_probing();
        drop(pending);
        poller.resolve_accept(listener, Ok(accepted(2)));
        // The peer answered, but the caller went away before collecting it.
        let pending = poller.claim_accept(listener).unwrap();
        pending.start_probing();
        poller.resolve_accept(listener, Ok(accepted(3)));
        drop(pending);

        assert!(poller.is_busy());
        assert_eq!(poller.orphans.try_receive(), Ok(2));
        assert_eq!(poller.orphans.try_receive(), Ok(3));
        assert!(!poller.is_busy());

        // Failures leave nothing behind.
        poller.resolve_accept(listener, Err(WlanError::Peer(-1)));
        assert!(poller.orphans.try_receive().is_err());
    }
    #[test]
    fn waiters_keep_the_poller_busy() {
        let poller = Poller::new();
        let waiter = poller.register_waiter();
        assert!(poller.is_busy());
        drop(waiter);
        assert!(!poller.is_busy());
    }
}
