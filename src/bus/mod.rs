//! The transport-capability abstraction that lets the Card State Machine
//! (C4) and Sector I/O Engine (C5) be written once against [`Bus`], a small
//! set of capabilities `{send_cmd, read_data, write_data, set_clock,
//! set_bus_width, lock, unlock}`. The native path wraps a
//! [`crate::transport::NativeTransport`] directly; the SPI path wraps a
//! [`crate::transport::SpiTransport`] behind a tiny adapter that packs the
//! 6-byte frame and scans for R1.

#[cfg(feature = "native")]
pub mod native;
#[cfg(feature = "spi")]
pub mod spi;

use crate::error::TransportError;
use crate::transport::{CommandDescriptor, DataDirection, Response};

/// Transport capability set the core drives the card through, independent
/// of whether the wire underneath is native card-mode or SPI.
pub trait Bus {
    fn send_cmd(&mut self, cmd: &CommandDescriptor) -> Result<Response, TransportError>;
    fn read_data(&mut self, cmd: &CommandDescriptor, dest: &mut [u8]) -> Result<(), TransportError>;
    fn write_data(&mut self, cmd: &CommandDescriptor, src: &[u8]) -> Result<(), TransportError>;

    /// Terminate a multi-block transfer. The native default is plain
    /// STOP_TRANSMISSION (CMD12); SPI overrides this for the write
    /// direction, which requires a stop *token* (`0xFD`) instead of a
    /// CMD12 frame.
    fn stop_transmission(
        &mut self,
        cmd: &CommandDescriptor,
        _direction: DataDirection,
    ) -> Result<(), TransportError> {
        self.send_cmd(cmd).map(|_| ())
    }

    fn set_clock_hz(&mut self, hz: u32);
    fn set_bus_width(&mut self, width: u8);
    fn set_data_timeout(&mut self, clocks: u32);
    fn set_resp_timeout(&mut self, ms: u32);

    fn max_block_count(&self, block_size: u32) -> u32;
    fn max_bus_width(&self) -> u8;

    fn lock(&mut self);
    fn unlock(&mut self);

    /// `true` for the SPI adapter. The state machine and I/O engine use this
    /// to skip the native-only identification step and CMD7 reselect.
    fn is_spi(&self) -> bool;
}
