//! Numeric tunables, split out from [`crate::card`]'s enums/bitflags so that
//! types and bare numbers each live in one place.

/// Bus clock held during reset, before the card's CSD is known.
pub const DEFAULT_CLOCK_HZ: u32 = 400_000;

/// GO_IDLE_STATE attempts before failing `DeviceNotPresent`.
pub const CMD0_MAX_ATTEMPTS: u32 = 256;
/// Sleep between GO_IDLE_STATE attempts.
pub const CMD0_RETRY_DELAY_MS: u32 = 2;

/// ACMD41 polling attempts before falling back to MMC probing.
pub const ACMD41_MAX_ATTEMPTS: u32 = 256;
/// Sleep between ACMD41 polls.
pub const ACMD41_RETRY_DELAY_MS: u32 = 4;

/// CMD1 (MMC SEND_OP_COND) polling attempts.
pub const CMD1_MAX_ATTEMPTS: u32 = 256;
/// Sleep between CMD1 polls.
pub const CMD1_RETRY_DELAY_MS: u32 = 2;

/// Default/negotiated block size; the only size the Sector I/O Engine issues
/// SET_BLOCKLEN for.
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Per-run transport-failure retries before a read/write surfaces `DeviceIo`:
/// one initial attempt plus this many retries.
pub const IO_RETRY_LIMIT: u32 = 5;

/// SEND_STATUS polls after a failed STOP_TRANSMISSION before giving up.
pub const STOP_TRANSMISSION_RECOVERY_POLLS: u32 = 10_000;

/// SPI: byte-reads to scan for the first response byte (top bit clear) before
/// timing out.
pub const SPI_RESPONSE_POLL_BYTES: u32 = 128;
/// SPI: byte-reads to scan for the single-block start token `0xFE`.
pub const SPI_READ_START_TOKEN_POLL_BYTES: u32 = 312_500;
/// SPI: byte-reads to scan for the multi-block start token, a wider bound
/// than the single-block one.
pub const SPI_READ_START_TOKEN_POLL_BYTES_MULTI: u32 = 781_250;

/// Fixed command response timeout.
pub const COMMAND_RESPONSE_TIMEOUT_MS: u32 = 1_000;

/// One status re-check after the first not-ready SEND_STATUS poll.
pub const STATUS_POLL_RETRY_DELAY_MS: u32 = 2;

/// Path grammar unit range: `unit := DIGIT+ ; 0..24`.
pub const MAX_UNIT_NUMBER: u8 = 24;

/// Fixed arena capacity for the Driver Object Pool (C6). Bounds the number
/// of simultaneously open units; raise for boards with more physical slots.
pub const POOL_CAPACITY: usize = 4;

/// CSD-decoded block sizes the Register Parser accepts.
pub const VALID_BLOCK_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

/// Platform clock ceilings applied when capping the CSD-derived `TRAN_SPEED`.
pub const SD_DEFAULT_SPEED_HZ: u32 = 25_000_000;
pub const SD_HIGH_SPEED_HZ: u32 = 50_000_000;
pub const MMC_DEFAULT_SPEED_HZ: u32 = 20_000_000;

/// Fixed data-access timeout used for SD v2 high-capacity cards, which carry
/// no meaningful TAAC/NSAC: 100 ms in host clock cycles is computed from the
/// negotiated clock at runtime; this is the duration.
pub const SDHC_FIXED_TIMEOUT_MS: u32 = 100;

/// SEND_IF_COND (CMD8) check pattern: 2.7-3.6V (0x1) plus the 0xAA check
/// pattern the card must echo back unmodified.
pub const CMD8_CHECK_PATTERN_ARG: u32 = 0x1AA;

/// ACMD41 HCS (Host Capacity Support) bit, OCR bit 30 echoed in the argument
/// to request high-capacity addressing.
pub const OCR_HCS_BIT: u32 = 1 << 30;
/// ACMD41 voltage window argument bits, 2.7-3.6 V (argument `0x40FF8000` =
/// HCS | this window).
pub const OCR_VOLTAGE_WINDOW: u32 = 0x00FF_8000;
/// OCR "power up complete" bit (bit 31); loop terminates once it reads 1.
pub const OCR_BUSY_BIT: u32 = 1 << 31;
/// OCR Card Capacity Status bit (bit 30); selects high-capacity addressing.
pub const OCR_CCS_BIT: u32 = 1 << 30;

/// Default RCA the host assigns an MMC card: for MMC the host *assigns* an
/// RCA rather than the card proposing one.
pub const MMC_DEFAULT_RCA: u32 = 0x0001;

/// SWITCH_FUNC (CMD6) access mode "write byte" (JESD84-B42 §6.6.1), used to
/// set EXT_CSD byte 183 (`BUS_WIDTH`) during MMC width negotiation.
pub const MMC_SWITCH_ACCESS_WRITE_BYTE: u32 = 0b11 << 24;
/// EXT_CSD byte index of `BUS_WIDTH`.
pub const MMC_EXT_CSD_BUS_WIDTH_INDEX: u32 = 183 << 16;
/// `BUS_WIDTH` value selecting 4-bit single data rate.
pub const MMC_BUS_WIDTH_4BIT: u8 = 1;
/// `BUS_WIDTH` value selecting 8-bit single data rate.
pub const MMC_BUS_WIDTH_8BIT: u8 = 2;

/// SEND_STATUS polls while waiting for SWITCH_FUNC / width-switch settlement
/// before giving up.
pub const SWITCH_SETTLE_MAX_POLLS: u32 = 256;
/// Sleep between settlement polls.
pub const SWITCH_SETTLE_POLL_DELAY_MS: u32 = 1;
