//! Command Codec (C2).
//!
//! Builds a [`CommandDescriptor`] from a numeric command index plus argument,
//! classifies the expected response shape by `(command, card variant)`, and
//! (for SPI) frames the 6-byte on-wire command and parses R1/R3/R7 tokens.

use crate::card::CardVariant;
use crate::crc::crc7;
use crate::transport::{CommandDescriptor, CommandFlags, DataDirection, DataFraming, ResponseShape};

/// Plain SD/MMC command indices.
pub mod cmd {
    pub const GO_IDLE_STATE: u8 = 0;
    pub const SEND_OP_COND_MMC: u8 = 1;
    pub const ALL_SEND_CID: u8 = 2;
    pub const SEND_RELATIVE_ADDR: u8 = 3;
    pub const SET_DSR: u8 = 4;
    pub const BUS_TEST_READ_MMC: u8 = 14;
    pub const SWITCH: u8 = 6;
    pub const SELECT_CARD: u8 = 7;
    /// SD: SEND_IF_COND. MMC: SEND_EXT_CSD. Same wire index, disambiguated
    /// by card variant at classification and at call sites.
    pub const SEND_IF_COND_OR_EXT_CSD: u8 = 8;
    pub const SEND_CSD: u8 = 9;
    pub const SEND_CID: u8 = 10;
    pub const STOP_TRANSMISSION: u8 = 12;
    pub const SEND_STATUS: u8 = 13;
    pub const GO_INACTIVE_STATE: u8 = 15;
    pub const SET_BLOCKLEN: u8 = 16;
    pub const READ_SINGLE_BLOCK: u8 = 17;
    pub const READ_MULTIPLE_BLOCK: u8 = 18;
    /// SD: SEND_TUNING_BLOCK. MMC: BUS_TEST_WRITE. Same wire index.
    pub const SEND_TUNING_BLOCK_OR_BUS_TEST_WRITE: u8 = 19;
    pub const SET_BLOCK_COUNT: u8 = 23;
    pub const WRITE_SINGLE_BLOCK: u8 = 24;
    pub const WRITE_MULTIPLE_BLOCK: u8 = 25;
    pub const PROGRAM_CSD: u8 = 27;
    pub const SET_WRITE_PROTECT: u8 = 28;
    pub const CLEAR_WRITE_PROTECT: u8 = 29;
    pub const SEND_WRITE_PROTECT: u8 = 30;
    pub const ERASE_WR_BLK_START: u8 = 32;
    pub const ERASE_WR_BLK_END: u8 = 33;
    pub const ERASE: u8 = 38;
    pub const LOCK_UNLOCK: u8 = 42;
    pub const APP_CMD: u8 = 55;
    pub const GEN_CMD: u8 = 56;
    pub const READ_OCR: u8 = 58;
    /// SPI-only: enable/disable CRC checking.
    pub const CRC_ON_OFF: u8 = 59;
}

/// Application-specific command indices, issued as `n` after CMD55.
pub mod acmd {
    pub const SET_BUS_WIDTH: u8 = 6;
    pub const SD_STATUS: u8 = 13;
    pub const SEND_NUM_WR_BLOCKS: u8 = 22;
    pub const SET_WR_BLK_ERASE_COUNT: u8 = 23;
    pub const SD_SEND_OP_COND: u8 = 41;
    pub const SET_CLR_CARD_DETECT: u8 = 42;
    pub const SEND_SCR: u8 = 51;
}

/// ACMD*n* is addressed on the extended index space as `64 + n`.
pub const ACMD_BASE: u16 = 64;

pub const fn encode_acmd(n: u8) -> u16 {
    ACMD_BASE + n as u16
}

pub const fn is_acmd_index(index: u16) -> bool {
    index >= ACMD_BASE
}

/// Strip the extended encoding, returning `(underlying_cmd_index, is_app_cmd)`.
pub const fn decode_index(index: u16) -> (u8, bool) {
    if is_acmd_index(index) {
        ((index - ACMD_BASE) as u8, true)
    } else {
        (index as u8, false)
    }
}

/// `(command, card variant)` response-shape lookup: a two-dimensional table
/// rather than a single global one, since a handful of commands (CMD8, CMD6,
/// CMD3, ...) change shape depending on whether the card is SD or MMC.
fn classify_response(cmd_index: u8, is_app_cmd: bool, variant: CardVariant) -> ResponseShape {
    use CardVariant::*;
    let is_mmc = matches!(variant, Mmc | MmcHc);

    if is_app_cmd {
        return match cmd_index {
            acmd::SD_SEND_OP_COND => ResponseShape::R3,
            _ => ResponseShape::R1,
        };
    }

    match cmd_index {
        cmd::GO_IDLE_STATE => ResponseShape::None,
        cmd::SEND_OP_COND_MMC => ResponseShape::R3,
        cmd::ALL_SEND_CID => ResponseShape::R2,
        cmd::SEND_RELATIVE_ADDR => {
            if is_mmc {
                ResponseShape::R1
            } else {
                ResponseShape::R6
            }
        }
        cmd::SET_DSR => ResponseShape::None,
        cmd::SWITCH => {
            if is_mmc {
                ResponseShape::R1b
            } else {
                ResponseShape::R1
            }
        }
        cmd::SELECT_CARD => ResponseShape::R1b,
        cmd::SEND_IF_COND_OR_EXT_CSD => {
            if is_mmc {
                ResponseShape::R1
            } else {
                ResponseShape::R7
            }
        }
        cmd::SEND_CSD | cmd::SEND_CID => ResponseShape::R2,
        cmd::STOP_TRANSMISSION => ResponseShape::R1b,
        cmd::SEND_STATUS => ResponseShape::R1,
        cmd::GO_INACTIVE_STATE => ResponseShape::None,
        cmd::SET_BLOCKLEN => ResponseShape::R1,
        cmd::READ_SINGLE_BLOCK | cmd::READ_MULTIPLE_BLOCK => ResponseShape::R1,
        cmd::BUS_TEST_READ_MMC => ResponseShape::R1,
        cmd::SEND_TUNING_BLOCK_OR_BUS_TEST_WRITE => ResponseShape::R1,
        cmd::SET_BLOCK_COUNT => ResponseShape::R1,
        cmd::WRITE_SINGLE_BLOCK | cmd::WRITE_MULTIPLE_BLOCK => ResponseShape::R1,
        cmd::PROGRAM_CSD => ResponseShape::R1,
        cmd::SET_WRITE_PROTECT | cmd::CLEAR_WRITE_PROTECT => ResponseShape::R1b,
        cmd::SEND_WRITE_PROTECT => ResponseShape::R1,
        cmd::ERASE_WR_BLK_START | cmd::ERASE_WR_BLK_END => ResponseShape::R1,
        cmd::ERASE => ResponseShape::R1b,
        cmd::LOCK_UNLOCK => ResponseShape::R1,
        cmd::APP_CMD => ResponseShape::R1,
        cmd::GEN_CMD => ResponseShape::R1,
        cmd::READ_OCR => ResponseShape::R3,
        cmd::CRC_ON_OFF => ResponseShape::R1,
        _ => ResponseShape::R1,
    }
}

/// `true` for the commands the codec starts a data phase on: read-block /
/// write-block / stream / bus-test / send-ext-csd / ACMD13 / ACMD51.
fn starts_data(cmd_index: u8, is_app_cmd: bool, variant: CardVariant) -> bool {
    if is_app_cmd {
        return matches!(cmd_index, acmd::SD_STATUS | acmd::SEND_SCR);
    }
    let is_mmc = matches!(variant, CardVariant::Mmc | CardVariant::MmcHc);
    matches!(
        cmd_index,
        cmd::READ_SINGLE_BLOCK
            | cmd::READ_MULTIPLE_BLOCK
            | cmd::WRITE_SINGLE_BLOCK
            | cmd::WRITE_MULTIPLE_BLOCK
            | cmd::BUS_TEST_READ_MMC
    ) || (cmd_index == cmd::SEND_TUNING_BLOCK_OR_BUS_TEST_WRITE)
        || (cmd_index == cmd::SEND_IF_COND_OR_EXT_CSD && is_mmc)
}

fn data_shape(cmd_index: u8, is_app_cmd: bool, variant: CardVariant) -> (DataDirection, DataFraming, u32) {
    use DataDirection::*;
    use DataFraming::*;
    let is_mmc = matches!(variant, CardVariant::Mmc | CardVariant::MmcHc);

    if is_app_cmd {
        return match cmd_index {
            acmd::SD_STATUS => (CardToHost, SingleBlock, 64),
            acmd::SEND_SCR => (CardToHost, SingleBlock, 8),
            _ => (None, DataFraming::None, 0),
        };
    }
    match cmd_index {
        cmd::READ_SINGLE_BLOCK => (CardToHost, SingleBlock, 0),
        cmd::READ_MULTIPLE_BLOCK => (CardToHost, MultiBlock, 0),
        cmd::WRITE_SINGLE_BLOCK => (HostToCard, SingleBlock, 0),
        cmd::WRITE_MULTIPLE_BLOCK => (HostToCard, MultiBlock, 0),
        cmd::BUS_TEST_READ_MMC => (CardToHost, SingleBlock, 8),
        cmd::SEND_TUNING_BLOCK_OR_BUS_TEST_WRITE if is_mmc => (HostToCard, SingleBlock, 8),
        cmd::SEND_IF_COND_OR_EXT_CSD if is_mmc => (CardToHost, SingleBlock, 512),
        _ => (None, DataFraming::None, 0),
    }
}

/// Build a fully populated [`CommandDescriptor`] for a command on the
/// extended index space (ACMD*n* = `64 + n`).
///
/// `block_size`/`block_count` are only consulted for READ/WRITE (SINGLE and
/// MULTIPLE)_BLOCK; callers supply the negotiated block size and the
/// requested run length for those commands.
pub fn build_descriptor(
    index: u16,
    argument: u32,
    variant: CardVariant,
    block_size: u32,
    block_count: u32,
) -> CommandDescriptor {
    let (cmd_index, is_app_cmd) = decode_index(index);
    let response_shape = classify_response(cmd_index, is_app_cmd, variant);
    let (mut data_direction, mut data_framing, fixed_block_size) =
        data_shape(cmd_index, is_app_cmd, variant);

    let (effective_block_size, effective_block_count) = match data_framing {
        DataFraming::SingleBlock if fixed_block_size == 0 => (block_size, 1),
        DataFraming::MultiBlock => (block_size, block_count),
        DataFraming::SingleBlock => (fixed_block_size, 1),
        DataFraming::None | DataFraming::Stream => (0, 0),
    };
    if !is_app_cmd
        && matches!(
            cmd_index,
            cmd::READ_SINGLE_BLOCK | cmd::WRITE_SINGLE_BLOCK
        )
        && block_count > 1
    {
        // Caller asked for a single-block command name but more than one
        // block: promote to the matching multi-block framing.
        data_framing = DataFraming::MultiBlock;
        data_direction = if cmd_index == cmd::READ_SINGLE_BLOCK {
            DataDirection::CardToHost
        } else {
            DataDirection::HostToCard
        };
    }

    let mut flags = CommandFlags::INDEX_VALID | CommandFlags::CRC_VALID;
    if response_shape != ResponseShape::None {
        flags |= CommandFlags::EXPECTS_RESPONSE;
    }
    if response_shape.is_long() {
        flags |= CommandFlags::LONG_RESPONSE;
    }
    if matches!(
        response_shape,
        ResponseShape::R1b | ResponseShape::R5b
    ) {
        flags |= CommandFlags::BUSY_AFTER;
    }
    if starts_data(cmd_index, is_app_cmd, variant) || matches!(data_framing, DataFraming::SingleBlock | DataFraming::MultiBlock) {
        flags |= CommandFlags::STARTS_DATA;
    }
    if !is_app_cmd && cmd_index == cmd::STOP_TRANSMISSION {
        flags |= CommandFlags::STOPS_DATA;
    }
    if !is_app_cmd && cmd_index == cmd::GO_IDLE_STATE {
        flags |= CommandFlags::NEEDS_INIT_SEQUENCE;
    }
    if !is_app_cmd && matches!(cmd_index, cmd::GO_IDLE_STATE | cmd::ALL_SEND_CID | cmd::SEND_RELATIVE_ADDR) {
        flags |= CommandFlags::OPEN_DRAIN;
    }

    CommandDescriptor {
        index: cmd_index,
        argument,
        response_shape,
        flags,
        data_direction,
        data_framing,
        block_size: effective_block_size,
        block_count: effective_block_count,
        is_app_cmd,
    }
}

/// The 6-byte SPI command frame: `0x40 | cmd`, 4 big-endian argument bytes,
/// `(crc7 << 1) | 0x01`.
pub fn spi_frame(cmd_index: u8, argument: u32) -> [u8; 6] {
    let mut frame = [0u8; 6];
    frame[0] = 0x40 | (cmd_index & 0x3f);
    frame[1..5].copy_from_slice(&argument.to_be_bytes());
    let crc = crc7(&frame[..5]);
    frame[5] = (crc << 1) | 0x01;
    frame
}
