//! The arena of socket slots.

use core::cell::RefCell;

use embassy_sync::blocking_mutex;
use embassy_time::Duration;

use crate::{
    sync::{Readiness, ReadySignal},
    DefaultRawMutex, WlanError, WlanResult,
};

/// How many sockets can be open at the same time.
pub const MAX_SOCKETS: usize = 4;

/// Handle to an open socket.
///
/// Handles are checked against the generation of their slot, so a handle outliving its socket is
/// rejected with [WlanError::InvalidHandle], even if the slot was reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Socket {
    slot: u8,
    generation: u16,
}
impl Socket {
    pub(crate) fn slot(&self) -> usize {
        self.slot as usize
    }
}

/// Local view of an open socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub descriptor: i32,
    /// Cleared once the peer reported the socket as gone.
    pub active: bool,
    pub last_error: Option<WlanError>,
    /// `None` waits forever.
    pub recv_timeout: Option<Duration>,
    pub nonblocking: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum SlotState {
    #[default]
    Free,
    /// Claimed for a socket, which the peer didn't hand out yet.
    Reserved,
    Open(Entry),
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    generation: u16,
    state: SlotState,
}

pub(crate) struct SocketTable {
    slots: [Slot; MAX_SOCKETS],
}
impl SocketTable {
    pub const fn new() -> Self {
        Self {
            slots: [Slot {
                generation: 0,
                state: SlotState::Free,
            }; MAX_SOCKETS],
        }
    }
    /// Claim a free slot.
    pub fn reserve(&mut self) -> WlanResult<usize> {
        let slot = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Free)
            .ok_or(WlanError::NoResources)?;
        self.slots[slot].state = SlotState::Reserved;
        Ok(slot)
    }
    /// Give back a slot claimed by [SocketTable::reserve].
    pub fn cancel(&mut self, slot: usize) {
        if let Some(slot) = self.slots.get_mut(slot) {
            if slot.state == SlotState::Reserved {
                slot.state = SlotState::Free;
            }
        }
    }
    /// Turn a reserved slot into an open socket.
    pub fn activate(&mut self, slot: usize, descriptor: i32) -> Socket {
        let entry = &mut self.slots[slot];
        entry.state = SlotState::Open(Entry {
            descriptor,
            active: true,
            last_error: None,
            recv_timeout: None,
            nonblocking: false,
        });
        Socket {
            slot: slot as u8,
            generation: entry.generation,
        }
    }
    pub fn entry_mut(&mut self, socket: Socket) -> WlanResult<&mut Entry> {
        match self.slots.get_mut(socket.slot()) {
            Some(Slot {
                generation,
                state: SlotState::Open(entry),
            }) if *generation == socket.generation => Ok(entry),
            _ => Err(WlanError::InvalidHandle),
        }
    }
    /// Look up a socket the peer still considers open.
    ///
    /// For a socket the peer deactivated, the recorded error is returned and cleared.
    pub fn live(&mut self, socket: Socket) -> WlanResult<Entry> {
        let entry = self.entry_mut(socket)?;
        if !entry.active {
            return Err(entry.last_error.take().unwrap_or(WlanError::SocketInactive));
        }
        Ok(*entry)
    }
    /// Free the slot of `socket` and return its descriptor.
    pub fn release(&mut self, socket: Socket) -> WlanResult<i32> {
        let descriptor = self.entry_mut(socket)?.descriptor;
        let slot = &mut self.slots[socket.slot()];
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(descriptor)
    }
    /// Mark the socket with `descriptor` as inactive. Returns its slot.
    pub fn deactivate(&mut self, descriptor: i32, error: WlanError) -> Option<usize> {
        let slot = self.slot_of(descriptor)?;
        if let SlotState::Open(entry) = &mut self.slots[slot].state {
            entry.active = false;
            entry.last_error = Some(error);
        }
        Some(slot)
    }
    pub fn slot_of(&self, descriptor: i32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot.state, SlotState::Open(entry) if entry.descriptor == descriptor)
        })
    }
    /// Slots and descriptors of all active sockets.
    pub fn active(&self) -> impl Iterator<Item = (usize, i32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot.state {
                SlotState::Open(entry) if entry.active => Some((index, entry.descriptor)),
                _ => None,
            })
    }
    /// Forget every socket. Outstanding handles become invalid.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.state != SlotState::Free {
                slot.generation = slot.generation.wrapping_add(1);
            }
            slot.state = SlotState::Free;
        }
    }
}

/// The socket table together with the wakeups of its slots.
pub(crate) struct Sockets {
    table: blocking_mutex::Mutex<DefaultRawMutex, RefCell<SocketTable>>,
    ready: [ReadySignal; MAX_SOCKETS],
}
impl Sockets {
    pub const fn new() -> Self {
        Self {
            table: blocking_mutex::Mutex::new(RefCell::new(SocketTable::new())),
            ready: [const { ReadySignal::new() }; MAX_SOCKETS],
        }
    }
    pub fn with<R>(&self, f: impl FnOnce(&mut SocketTable) -> R) -> R {
        self.table.lock(|table| f(&mut table.borrow_mut()))
    }
    pub fn ready(&self, slot: usize) -> &ReadySignal {
        &self.ready[slot]
    }
    /// Claim a slot, which is given back unless [Reservation::commit] is called.
    pub fn reserve(&self) -> WlanResult<Reservation<'_>> {
        let slot = self.with(|table| table.reserve())?;
        Ok(Reservation {
            sockets: self,
            slot,
            committed: false,
        })
    }
    /// Mark the socket with `descriptor` as inactive and wake its reader.
    pub fn deactivate(&self, descriptor: i32, error: WlanError) {
        match self.with(|table| table.deactivate(descriptor, error)) {
            Some(slot) => {
                debug!("Socket {} is now inactive.", descriptor);
                self.ready[slot].signal(Readiness::Closed);
            }
            None => trace!("Inactive socket {} isn't in the table.", descriptor),
        }
    }
    /// Wake every reader with [Readiness::Closed].
    pub fn close_all(&self) {
        for ready in self.ready.iter() {
            ready.signal(Readiness::Closed);
        }
    }
    pub fn reset(&self) {
        self.with(|table| table.clear());
        for ready in self.ready.iter() {
            ready.reset();
        }
    }
    /// The readiness query covering every active socket except `exclude`.
    ///
    /// Returns the descriptor count and the read mask.
    pub fn read_mask(&self, exclude: Option<Socket>) -> (u32, u32) {
        self.with(|table| {
            table
                .active()
                .filter(|(slot, _)| exclude.map(|socket| socket.slot()) != Some(*slot))
                .filter(|(_, descriptor)| (0..32).contains(descriptor))
                .fold((0, 0), |(nfds, mask), (_, descriptor)| {
                    (nfds.max(descriptor as u32 + 1), mask | (1u32 << descriptor))
                })
        })
    }
    /// Wake the readers of every active socket in `mask`, except `exclude`.
    pub fn signal_readable(&self, mask: u32, exclude: Option<Socket>) {
        let mut ready = [false; MAX_SOCKETS];
        self.with(|table| {
            for (slot, descriptor) in table.active() {
                let excluded = exclude.map(|socket| socket.slot()) == Some(slot);
                if !excluded && (0..32).contains(&descriptor) && mask & (1u32 << descriptor) != 0 {
                    ready[slot] = true;
                }
            }
        });
        for (slot, _) in ready.iter().enumerate().filter(|(_, ready)| **ready) {
            trace!("Socket in slot {} is readable.", slot);
            self.ready[slot].signal(Readiness::Readable);
        }
    }
}

/// A claimed table slot.
pub(crate) struct Reservation<'s> {
    sockets: &'s Sockets,
    slot: usize,
    committed: bool,
}
impl Reservation<'_> {
    pub fn commit(mut self, descriptor: i32) -> Socket {
        self.committed = true;
        self.sockets.ready[self.slot].reset();
        self.sockets
            .with(|table| table.activate(self.slot, descriptor))
    }
}
impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.sockets.with(|table| table.cancel(self.slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_is_fixed() {
        let mut table = SocketTable::new();
        for descriptor in 0..MAX_SOCKETS as i32 {
            let slot = table.reserve().unwrap();
            table.activate(slot, descriptor);
        }
        assert_eq!(table.reserve(), Err(WlanError::NoResources));
    }
    #[test]
    fn stale_handles_are_rejected() {
        let mut table = SocketTable::new();
        let slot = table.reserve().unwrap();
        let first = table.activate(slot, 3);
        assert_eq!(table.release(first), Ok(3));

        let slot = table.reserve().unwrap();
        let second = table.activate(slot, 3);
        assert_eq!(first.slot(), second.slot());
        assert_eq!(table.live(first), Err(WlanError::InvalidHandle));
        assert_eq!(table.release(first), Err(WlanError::InvalidHandle));
        assert_eq!(table.live(second).map(|entry| entry.descriptor), Ok(3));
    }
    #[test]
    fn recorded_error_is_returned_once() {
        let mut table = SocketTable::new();
        let slot = table.reserve().unwrap();
        let socket = table.activate(slot, 1);
        assert_eq!(table.deactivate(1, WlanError::Peer(-57)), Some(slot));
        assert_eq!(table.live(socket), Err(WlanError::Peer(-57)));
        assert_eq!(table.live(socket), Err(WlanError::SocketInactive));
        assert_eq!(table.active().count(), 0);
        assert_eq!(table.deactivate(9, WlanError::SocketInactive), None);
    }
    #[test]
    fn reservations_are_given_back() {
        let sockets = Sockets::new();
        let reservations = [
            sockets.reserve().unwrap(),
            sockets.reserve().unwrap(),
            sockets.reserve().unwrap(),
        ];
        let last = sockets.reserve().unwrap();
        assert!(sockets.reserve().is_err());
        drop(last);
        let socket = sockets.reserve().unwrap().commit(5);
        assert_eq!(sockets.read_mask(None), (6, 1 << 5));
        assert_eq!(sockets.read_mask(Some(socket)), (0, 0));
        drop(reservations);
        assert_eq!(sockets.with(|table| table.active().count()), 1);
    }
}
