//! Native ("card mode") [`Bus`] adapter over a [`NativeTransport`].

use super::Bus;
use crate::error::TransportError;
use crate::transport::{CommandDescriptor, NativeTransport, Response};

pub struct NativeBus<T: NativeTransport> {
    unit: u8,
    transport: T,
}

impl<T: NativeTransport> NativeBus<T> {
    pub fn new(unit: u8, transport: T) -> Self {
        Self { unit, transport }
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn open(&mut self) -> Result<(), TransportError> {
        self.transport.open(self.unit)
    }

    pub fn close(&mut self) {
        self.transport.close(self.unit)
    }
}

impl<T: NativeTransport> Bus for NativeBus<T> {
    fn send_cmd(&mut self, cmd: &CommandDescriptor) -> Result<Response, TransportError> {
        self.transport.cmd_start(self.unit, cmd)?;
        self.transport.cmd_wait_end(self.unit, cmd)
    }

    fn read_data(&mut self, cmd: &CommandDescriptor, dest: &mut [u8]) -> Result<(), TransportError> {
        self.transport.cmd_data_rd(self.unit, cmd, dest)
    }

    fn write_data(&mut self, cmd: &CommandDescriptor, src: &[u8]) -> Result<(), TransportError> {
        self.transport.cmd_data_wr(self.unit, cmd, src)
    }

    fn set_clock_hz(&mut self, hz: u32) {
        self.transport.set_clk_freq(self.unit, hz);
    }

    fn set_bus_width(&mut self, width: u8) {
        self.transport.set_bus_width(self.unit, width);
    }

    fn set_data_timeout(&mut self, clocks: u32) {
        self.transport.set_data_timeout(self.unit, clocks);
    }

    fn set_resp_timeout(&mut self, ms: u32) {
        self.transport.set_resp_timeout(self.unit, ms);
    }

    fn max_block_count(&self, block_size: u32) -> u32 {
        self.transport.get_max_blk_cnt(self.unit, block_size).max(1)
    }

    fn max_bus_width(&self) -> u8 {
        self.transport.get_max_bus_width(self.unit)
    }

    fn lock(&mut self) {
        self.transport.lock(self.unit);
    }

    fn unlock(&mut self) {
        self.transport.unlock(self.unit);
    }

    fn is_spi(&self) -> bool {
        false
    }
}
