//! The network card as seen by the kernel.
//!
//! Only the queueing contract matters here: packets go out through
//! [`NetDevice::transmit`] and come in through [`NetDevice::receive`]. When a
//! packet arrives the device's interrupt is delivered to the kernel through
//! [`Kernel::net_interrupt`](crate::Kernel::net_interrupt).

use core::fmt;

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use spin::Mutex;

/// Largest Ethernet frame the card accepts, in bytes.
pub const MAX_PACKET: usize = 1518;

/// Errors reported by [`NetDevice::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The packet is larger than [`MAX_PACKET`].
    TooLong,
    /// The transmit queue has no free descriptor.
    QueueFull,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::TooLong => write!(f, "packet exceeds {MAX_PACKET} bytes"),
            TxError::QueueFull => write!(f, "transmit queue full"),
        }
    }
}

/// A network interface card.
pub trait NetDevice {
    /// Returns the card's hardware address.
    fn mac_address(&self) -> [u8; 6];

    /// Queues a packet for transmission.
    fn transmit(&mut self, packet: &[u8]) -> Result<(), TxError>;

    /// Takes the next received packet, if any.
    fn receive(&mut self) -> Option<Vec<u8>>;
}

/// Default hardware address, the one QEMU gives its emulated card.
pub const DEFAULT_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Number of packets a [`Loopback`] card buffers in each direction.
pub const LOOPBACK_QUEUE: usize = 64;

#[derive(Debug, Default)]
struct Queues {
    rx: VecDeque<Vec<u8>>,
    transmitted: usize,
}

/// A card whose wire is connected back to itself.
///
/// Every transmitted packet is received again. Clones share the same
/// queues, so a test can keep a handle to inject traffic after the card has
/// been given to the kernel.
#[derive(Debug, Clone)]
pub struct Loopback {
    mac: [u8; 6],
    queues: Arc<Mutex<Queues>>,
}

impl Loopback {
    pub fn new(mac: [u8; 6]) -> Self {
        Self {
            mac,
            queues: Arc::new(Mutex::new(Queues::default())),
        }
    }

    /// Delivers a packet from the wire.
    ///
    /// Returns false and drops the packet if the receive queue is full.
    pub fn inject(&self, packet: &[u8]) -> bool {
        let mut queues = self.queues.lock();
        if queues.rx.len() == LOOPBACK_QUEUE {
            return false;
        }
        queues.rx.push_back(packet.to_vec());
        true
    }

    /// Number of packets waiting to be received.
    pub fn pending(&self) -> usize {
        self.queues.lock().rx.len()
    }

    /// Number of packets transmitted so far.
    pub fn transmitted(&self) -> usize {
        self.queues.lock().transmitted
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new(DEFAULT_MAC)
    }
}

impl NetDevice for Loopback {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TxError> {
        if packet.len() > MAX_PACKET {
            return Err(TxError::TooLong);
        }
        let mut queues = self.queues.lock();
        if queues.rx.len() == LOOPBACK_QUEUE {
            return Err(TxError::QueueFull);
        }
        queues.rx.push_back(packet.to_vec());
        queues.transmitted += 1;
        log::trace!("loopback: {} byte packet", packet.len());
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.queues.lock().rx.pop_front()
    }
}
