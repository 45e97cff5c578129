//! # `cc3000-hal`
//! This is an async host driver for CC3000-class WLAN companion chips, which run their own network
//! stack and are controlled over SPI.
//! ## Overview
//! The peer speaks a single outstanding command protocol. The host writes a command and, some time
//! later, the peer pulls its IRQ line low to announce the matching event. The driver bridges that
//! to a socket API, which any number of tasks may use at the same time.
//!
//! ### Transport
//! The [Transport] is the only code touching the bus. It runs as its own task and moves exactly one
//! frame per bus transaction. Outbound frames are queued through a single slot mailbox and always
//! win over inbound reads. The interrupt handler of the IRQ line only calls
//! [WlanIrq::on_interrupt], which signals the pump and does nothing else. Since edges get lost
//! occasionally, every wait for the line is bounded and the line is sampled by hand afterwards.
//!
//! ### Correlation
//! Exactly one command may be in flight. Issuing one requires the guard of an async mutex, which is
//! held from sending the command until its reply arrived, so a reply always belongs to the command
//! currently pending. Everything the peer sends unasked, like link changes, DHCP leases, ping
//! reports and buffer credits, is handled by the pump and republished on an event bus, which is
//! available through [Wlan::events].
//!
//! Data frames need a device buffer credit. Sending blocks while the peer has none left and
//! continues once the peer reports buffers as freed.
//!
//! ### Sockets
//! Sockets live in a fixed table of [socket::MAX_SOCKETS] slots. Handles are generation checked, so
//! a handle to a closed socket never reaches a socket, that reused its slot. Receiving and
//! accepting never hold the command lock while waiting. Instead the poller task, driven by
//! [Wlan::run_poller], repeatedly asks the peer which sockets are readable and wakes exactly the
//! callers waiting on those.
//!
//! ## Usage
//! A [Wlan] is created from a [WlanIrq] and a [Config]. Then three futures have to be polled
//! concurrently: [Transport::run], [Wlan::run_poller] and whatever uses the [Wlan]. The first
//! command has to be [Wlan::start].

#![cfg_attr(not(test), no_std)]
#![allow(unexpected_cfgs)]
pub(crate) mod fmt;

mod event;
mod hci;
mod netapp;
mod poller;
mod reply;
pub mod socket;
mod sync;
mod transport;
pub mod wire;
mod wlan;

pub use event::*;
pub use hci::FlowControl;
pub use netapp::*;
pub use reply::{IpConfig, ScanResult, SecurityType, SelectReply};
pub use socket::{Socket, SocketOption, SocketType};
pub use sync::Readiness;
pub use transport::{IrqStats, Transport, WlanIrq};
pub use wlan::*;

cfg_if::cfg_if! {
    if #[cfg(feature = "critical_section")] {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    } else {
        type DefaultRawMutex = embassy_sync::blocking_mutex::raw::NoopRawMutex;
    }
}
