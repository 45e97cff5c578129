use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use portable_atomic::{AtomicU8, AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// Why a socket reader was woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Readiness {
    /// The peer reported data for this socket.
    Readable,
    /// The socket was closed, torn down by the peer or the link was stopped.
    Closed,
}
/// A per socket wakeup, which remembers what it was woken for.
///
/// Unlike a counting signal, a reader can tell a real readiness report apart from a teardown.
pub struct ReadySignal {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl ReadySignal {
    const PENDING: u8 = 0;
    const READABLE: u8 = 1;
    const CLOSED: u8 = 2;
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            waker: AtomicWaker::new(),
        }
    }
    /// Forget any readiness that was signalled before.
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Release);
    }
    pub fn signal(&self, readiness: Readiness) {
        let new = match readiness {
            Readiness::Readable => Self::READABLE,
            Readiness::Closed => Self::CLOSED,
        };
        // A teardown is never overwritten by a later readiness report.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != Self::CLOSED).then_some(new)
            });
        self.waker.wake();
    }
    /// Wait for the next readiness report and consume it.
    pub fn wait(&self) -> impl Future<Output = Readiness> + use<'_> {
        poll_fn(|cx| {
            self.waker.register(cx.waker());
            match self.state.swap(Self::PENDING, Ordering::AcqRel) {
                Self::READABLE => Poll::Ready(Readiness::Readable),
                Self::CLOSED => Poll::Ready(Readiness::Closed),
                _ => Poll::Pending,
            }
        })
    }
}

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
///
/// [SignalQueue::put] only touches atomics, so it can be called from an interrupt handler.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queue signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::AcqRel);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Release);
    }
    /// Take one signal without waiting, if there is one.
    pub fn try_take(&self) -> bool {
        self.queued_signals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                queued.checked_sub(1)
            })
            .is_ok()
    }
    /// Asynchronously wait for the next signal.
    pub async fn next(&self) {
        poll_fn(|cx| {
            if self.try_take() {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            // A signal may have been put between the first check and registering the waker.
            if self.try_take() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;

    #[test]
    fn signal_queue_counts() {
        let queue = SignalQueue::new();
        queue.put();
        queue.put();
        block_on(queue.next());
        assert!(queue.try_take());
        assert!(!queue.try_take());
        queue.put();
        queue.reset();
        assert!(!queue.try_take());
    }
    #[test]
    fn closed_wins_over_readable() {
        let signal = ReadySignal::new();
        signal.signal(Readiness::Closed);
        signal.signal(Readiness::Readable);
        assert_eq!(block_on(signal.wait()), Readiness::Closed);
        signal.signal(Readiness::Readable);
        assert_eq!(block_on(signal.wait()), Readiness::Readable);
    }
}
