//! Adapter driver seam
//!
//! The engine never touches a socket directly. It drives the adapter through
//! an [`AdapterDriver`] supplied by the platform: on Linux a raw
//! `AF_BLUETOOTH`/`BTPROTO_HCI` socket plus the power flag from the device
//! info ioctl, on a board a UART or USB transport.
//!
//! Inbound bytes flow the other way: whoever reads the transport hands each
//! complete HCI frame to [`HciEngine::on_bytes`](crate::HciEngine::on_bytes)
//! or [`Host::on_bytes`](crate::Host::on_bytes).

use crate::packet::SocketFilter;
use core::future::Future;

/// Raw HCI transport of one adapter
pub trait AdapterDriver {
    /// Transport specific error
    type Error: core::fmt::Debug;

    /// Bind the transport to the adapter with this index
    ///
    /// # Errors
    /// Returns the transport's error if the adapter cannot be bound
    fn bind(&mut self, device_index: u16) -> Result<(), Self::Error>;

    /// Start delivering inbound frames
    ///
    /// # Errors
    /// Returns the transport's error if reading cannot start
    fn start(&mut self) -> Result<(), Self::Error>;

    /// Install the inbound packet filter
    ///
    /// # Errors
    /// Returns the transport's error if the filter is rejected
    fn set_filter(&mut self, filter: &SocketFilter) -> Result<(), Self::Error>;

    /// Write one complete HCI frame, packet type byte included
    ///
    /// # Errors
    /// Returns the transport's error if the frame could not be written
    fn write(&mut self, frame: &[u8]) -> Result<(), Self::Error>;

    /// Whether the adapter is currently powered
    fn is_powered(&mut self) -> bool;
}

/// Monotonic time source used by [`Host::run`](crate::Host::run)
pub trait Clock {
    /// Milliseconds since an arbitrary fixed origin
    fn now_ms(&self) -> u64;

    /// Complete after `ms` milliseconds
    fn sleep_ms(&self, ms: u64) -> impl Future<Output = ()>;
}
