//! SPI [`Bus`] adapter over a [`SpiTransport`]: packs the 6-byte command
//! frame, scans for the R1 token, and frames data blocks with start/stop
//! tokens and a CRC-16 trailer.

use super::Bus;
use crate::command::spi_frame;
use crate::constants::{
    SPI_READ_START_TOKEN_POLL_BYTES, SPI_READ_START_TOKEN_POLL_BYTES_MULTI,
    SPI_RESPONSE_POLL_BYTES,
};
use crate::crc::crc16_ccitt;
use crate::error::TransportError;
use crate::transport::{CommandDescriptor, DataDirection, Response, ResponseShape, SpiTransport};

const START_TOKEN_SINGLE: u8 = 0xFE;
const START_TOKEN_MULTI: u8 = 0xFC;
const STOP_TOKEN_MULTI: u8 = 0xFD;

pub struct SpiBus<T: SpiTransport> {
    unit: u8,
    transport: T,
    crc_enabled: bool,
    max_block_count: u32,
}

impl<T: SpiTransport> SpiBus<T> {
    pub fn new(unit: u8, transport: T, max_block_count: u32) -> Self {
        Self {
            unit,
            transport,
            crc_enabled: false,
            max_block_count: max_block_count.max(1),
        }
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

    /// CRC_ON_OFF (CMD59) toggles this.
    pub fn set_crc_enabled(&mut self, enabled: bool) {
        self.crc_enabled = enabled;
    }

    fn poll_byte(&mut self, bound: u32, predicate: impl Fn(u8) -> bool) -> Result<u8, TransportError> {
        let mut b = [0u8; 1];
        for _ in 0..bound {
            self.transport.read(self.unit, &mut b)?;
            if predicate(b[0]) {
                return Ok(b[0]);
            }
        }
        Err(TransportError::RespTimeout)
    }

    fn wait_while_busy(&mut self) -> Result<(), TransportError> {
        self.poll_byte(SPI_READ_START_TOKEN_POLL_BYTES_MULTI, |b| b != 0x00)
            .map(|_| ())
            .map_err(|_| TransportError::DataTimeout)
    }
}

impl<T: SpiTransport> Bus for SpiBus<T> {
    fn send_cmd(&mut self, cmd: &CommandDescriptor) -> Result<Response, TransportError> {
        let frame = spi_frame(cmd.index, cmd.argument);
        self.transport.write(self.unit, &frame)?;

        let r1 = self
            .poll_byte(SPI_RESPONSE_POLL_BYTES, |b| b & 0x80 == 0)
            .map_err(|_| TransportError::RespTimeout)?;

        let mut words = [0u32; 4];
        words[0] = r1 as u32;
        if matches!(cmd.response_shape, ResponseShape::R3 | ResponseShape::R7) {
            let mut extra = [0u8; 4];
            self.transport.read(self.unit, &mut extra)?;
            words[1] = u32::from_be_bytes(extra);
        }
        Ok(Response { words })
    }

    fn read_data(&mut self, cmd: &CommandDescriptor, dest: &mut [u8]) -> Result<(), TransportError> {
        let block_size = cmd.block_size.max(1) as usize;
        let block_count = cmd.block_count.max(1) as usize;
        let poll_bound = if block_count > 1 {
            SPI_READ_START_TOKEN_POLL_BYTES_MULTI
        } else {
            SPI_READ_START_TOKEN_POLL_BYTES
        };

        for i in 0..block_count {
            self.poll_byte(poll_bound, |b| b == START_TOKEN_SINGLE)
                .map_err(|_| TransportError::DataTimeout)?;
            let chunk = &mut dest[i * block_size..(i + 1) * block_size];
            self.transport.read(self.unit, chunk)?;
            let mut crc_bytes = [0u8; 2];
            self.transport.read(self.unit, &mut crc_bytes)?;
            if self.crc_enabled {
                let got = u16::from_be_bytes(crc_bytes);
                let want = crc16_ccitt(chunk);
                if got != want {
                    return Err(TransportError::DataCrc);
                }
            }
        }
        Ok(())
    }

    fn write_data(&mut self, cmd: &CommandDescriptor, src: &[u8]) -> Result<(), TransportError> {
        let block_size = cmd.block_size.max(1) as usize;
        let block_count = cmd.block_count.max(1) as usize;
        let start_token = if block_count > 1 { START_TOKEN_MULTI } else { START_TOKEN_SINGLE };

        for i in 0..block_count {
            self.transport.write(self.unit, &[start_token])?;
            let chunk = &src[i * block_size..(i + 1) * block_size];
            self.transport.write(self.unit, chunk)?;
            let crc = if self.crc_enabled { crc16_ccitt(chunk) } else { 0 };
            self.transport.write(self.unit, &crc.to_be_bytes())?;

            let resp = self.poll_byte(1, |_| true)?;
            match resp & 0x1f {
                0x05 => {}
                0x0B => return Err(TransportError::DataCrc),
                _ => return Err(TransportError::DataOther),
            }
            self.wait_while_busy()?;
        }
        Ok(())
    }

    fn set_clock_hz(&mut self, hz: u32) {
        self.transport.set_clk_freq(self.unit, hz);
    }

    fn set_bus_width(&mut self, _width: u8) {
        // SPI is inherently single-bit; width negotiation is a no-op.
    }

    fn set_data_timeout(&mut self, _clocks: u32) {}

    fn set_resp_timeout(&mut self, _ms: u32) {}

    fn max_block_count(&self, _block_size: u32) -> u32 {
        self.max_block_count
    }

    fn max_bus_width(&self) -> u8 {
        1
    }

    fn lock(&mut self) {
        self.transport.lock(self.unit);
        self.transport.chip_select_enable(self.unit);
    }

    fn unlock(&mut self) {
        self.transport.chip_select_disable(self.unit);
        self.transport.unlock(self.unit);
    }

    fn is_spi(&self) -> bool {
        true
    }

    /// Writes end with the stop token `0xFD` (no CMD12); reads issue the
    /// real CMD12 and wait while busy.
    fn stop_transmission(
        &mut self,
        cmd: &CommandDescriptor,
        direction: DataDirection,
    ) -> Result<(), TransportError> {
        match direction {
            DataDirection::HostToCard => {
                self.transport.write(self.unit, &[STOP_TOKEN_MULTI])?;
                self.wait_while_busy()
            }
            _ => {
                self.send_cmd(cmd)?;
                self.wait_while_busy()
            }
        }
    }
}
