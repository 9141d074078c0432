//! The Host Transport collaborator (C1) and the value types the Command
//! Codec (C2) builds for it.
//!
//! Two concrete shapes exist — [`NativeTransport`] (structured commands over
//! a parallel bus) and [`SpiTransport`] (byte stream with tokens) — each
//! exposing one small method per operation, `&mut self`, returning
//! `Result<_, TransportError>`.

use bitflags::bitflags;

pub use crate::error::TransportError;

/// Shape of the response a command expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    None,
    R1,
    R1b,
    R2,
    R3,
    R4,
    R5,
    R5b,
    R6,
    R7,
}

impl ResponseShape {
    /// `true` for the single long (16-byte) response shape; every other
    /// shape is short (4 bytes).
    pub fn is_long(self) -> bool {
        matches!(self, ResponseShape::R2)
    }
}

/// Data direction for a command that moves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    HostToCard,
    CardToHost,
}

/// Data framing for a command that moves a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFraming {
    None,
    SingleBlock,
    MultiBlock,
    Stream,
}

bitflags! {
    /// Command Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandFlags: u16 {
        const INDEX_VALID    = 1 << 0;
        const CRC_VALID      = 1 << 1;
        const BUSY_AFTER     = 1 << 2;
        const LONG_RESPONSE  = 1 << 3;
        const EXPECTS_RESPONSE = 1 << 4;
        const STARTS_DATA    = 1 << 5;
        const STOPS_DATA     = 1 << 6;
        const NEEDS_INIT_SEQUENCE = 1 << 7;
        const OPEN_DRAIN     = 1 << 8;
    }
}

/// A fully populated command, built by the Command Codec (C2) and handed to
/// a transport.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    /// Numeric command index on the wire. For ACMDs this is the underlying
    /// `n`, never the extended `64 + n` index — the codec strips that before
    /// constructing the descriptor.
    pub index: u8,
    pub argument: u32,
    pub response_shape: ResponseShape,
    pub flags: CommandFlags,
    pub data_direction: DataDirection,
    pub data_framing: DataFraming,
    /// Only meaningful when `data_framing != None`.
    pub block_size: u32,
    /// Only meaningful when `data_framing != None`.
    pub block_count: u32,
    /// `true` when this command is the `n` half of an ACMD*n* pair — the
    /// caller must have seen APP_CMD set in the preceding CMD55's R1.
    pub is_app_cmd: bool,
}

impl CommandDescriptor {
    pub fn is_long_response(&self) -> bool {
        self.response_shape.is_long()
    }
}

/// A collected response: short responses fill the low word(s); R2 uses all
/// four.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub words: [u32; 4],
}

impl Response {
    pub const fn empty() -> Self {
        Self { words: [0; 4] }
    }

    /// The R1/R3/R6/R7 short response word.
    pub fn short(&self) -> u32 {
        self.words[0]
    }

    /// The 16-byte long response (R2), MSB-first as the register bytes are
    /// big-endian bit-within-register.
    pub fn long_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        for (i, word) in self.words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        out
    }
}

/// Native ("card mode") transport: structured command/response frames plus
/// separate data lines. Provided by the platform collaborator.
pub trait NativeTransport {
    fn open(&mut self, unit: u8) -> Result<(), TransportError>;
    fn close(&mut self, unit: u8);
    fn lock(&mut self, unit: u8);
    fn unlock(&mut self, unit: u8);

    /// Begin the command on the wire; does not block for completion.
    fn cmd_start(&mut self, unit: u8, cmd: &CommandDescriptor) -> Result<(), TransportError>;
    /// Block until the command completes and collect its response.
    fn cmd_wait_end(
        &mut self,
        unit: u8,
        cmd: &CommandDescriptor,
    ) -> Result<Response, TransportError>;
    /// Stream a data block from the card into `dest`.
    fn cmd_data_rd(
        &mut self,
        unit: u8,
        cmd: &CommandDescriptor,
        dest: &mut [u8],
    ) -> Result<(), TransportError>;
    /// Stream a data block from `src` to the card.
    fn cmd_data_wr(
        &mut self,
        unit: u8,
        cmd: &CommandDescriptor,
        src: &[u8],
    ) -> Result<(), TransportError>;

    fn get_max_blk_cnt(&self, unit: u8, blk_size: u32) -> u32;
    fn get_max_bus_width(&self, unit: u8) -> u8;

    fn set_bus_width(&mut self, unit: u8, width: u8);
    fn set_clk_freq(&mut self, unit: u8, hz: u32);
    fn set_data_timeout(&mut self, unit: u8, clks: u32);
    fn set_resp_timeout(&mut self, unit: u8, ms: u32);
}

/// SPI transport: a byte stream with chip-select framing rather than a
/// dedicated command line. Provided by the platform collaborator.
pub trait SpiTransport {
    fn open(&mut self, unit: u8) -> Result<(), TransportError>;
    fn close(&mut self, unit: u8);
    fn lock(&mut self, unit: u8);
    fn unlock(&mut self, unit: u8);

    fn read(&mut self, unit: u8, dest: &mut [u8]) -> Result<(), TransportError>;
    fn write(&mut self, unit: u8, src: &[u8]) -> Result<(), TransportError>;

    fn chip_select_enable(&mut self, unit: u8);
    fn chip_select_disable(&mut self, unit: u8);

    fn set_clk_freq(&mut self, unit: u8, hz: u32);
}
