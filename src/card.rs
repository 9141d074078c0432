//! Data model shared by every component: [`CardVariant`], [`CardInfo`],
//! [`CardHandle`], and the R1/SPI status bitflags.

use bitflags::bitflags;

/// Tagged card variant, assigned exactly once during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardVariant {
    #[default]
    None,
    SdV1x,
    SdV2Std,
    SdV2Hc,
    Mmc,
    MmcHc,
}

impl CardVariant {
    pub fn is_high_capacity(self) -> bool {
        matches!(self, CardVariant::SdV2Hc | CardVariant::MmcHc)
    }

    pub fn is_mmc(self) -> bool {
        matches!(self, CardVariant::Mmc | CardVariant::MmcHc)
    }

    pub fn is_sd(self) -> bool {
        matches!(self, CardVariant::SdV1x | CardVariant::SdV2Std | CardVariant::SdV2Hc)
    }
}

bitflags! {
    /// Full R1 "card status" decode — every error/state bit the register
    /// carries, not just the current-state nibble.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CardStatusFlags: u32 {
        const OUT_OF_RANGE = 1 << 31;
        const ADDRESS_ERROR = 1 << 30;
        const BLOCK_LEN_ERROR = 1 << 29;
        const ERASE_SEQ_ERROR = 1 << 28;
        const ERASE_PARAM = 1 << 27;
        const WP_VIOLATION = 1 << 26;
        const CARD_IS_LOCKED = 1 << 25;
        const LOCK_UNLOCK_FAILED = 1 << 24;
        const COM_CRC_ERROR = 1 << 23;
        const ILLEGAL_COMMAND = 1 << 22;
        const CARD_ECC_FAILED = 1 << 21;
        const CC_ERROR = 1 << 20;
        const ERROR = 1 << 19;
        const CID_CSD_OVERWRITE = 1 << 16;
        const WP_ERASE_SKIP = 1 << 15;
        const CARD_ECC_DISABLED = 1 << 14;
        const ERASE_RESET = 1 << 13;
        const READY_FOR_DATA = 1 << 8;
        const SWITCH_ERROR = 1 << 7;
        const APP_CMD = 1 << 5;
        const AKE_SEQ_ERROR = 1 << 3;
        const ALL_ERRORS = 0xFFF9_0008;
    }
}

/// Card-side state, reported in bits 12..9 of every R1 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardState {
    Idle,
    Ready,
    Identification,
    Standby,
    Transfer,
    Data,
    Receive,
    Program,
    Disconnect,
}

impl CardState {
    pub fn from_r1(r1: u32) -> Self {
        match (r1 >> 9) & 0x0f {
            0 => CardState::Idle,
            1 => CardState::Ready,
            2 => CardState::Identification,
            3 => CardState::Standby,
            4 => CardState::Transfer,
            5 => CardState::Data,
            6 => CardState::Receive,
            7 => CardState::Program,
            8 => CardState::Disconnect,
            _ => CardState::Idle,
        }
    }
}

bitflags! {
    /// SPI R1 error-bit decode: idle, erase-reset, illegal-command,
    /// com-crc-error, erase-sequence-error, address-error, parameter-error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SpiR1Flags: u8 {
        const IN_IDLE_STATE = 1 << 0;
        const ERASE_RESET = 1 << 1;
        const ILLEGAL_COMMAND = 1 << 2;
        const COM_CRC_ERROR = 1 << 3;
        const ERASE_SEQUENCE_ERROR = 1 << 4;
        const ADDRESS_ERROR = 1 << 5;
        const PARAMETER_ERROR = 1 << 6;
    }
}

/// Card identity/capacity/timing, populated by the Register Parser (C3),
/// read-only after bring-up.
#[derive(Debug, Clone, Copy, Default)]
pub struct CardInfo {
    pub block_size: u32,
    pub total_block_count: u32,
    pub max_clock_hz: u32,
    pub data_access_timeout_ms: u32,
    pub variant: CardVariant,
    pub high_capacity: bool,
    pub manufacturer_id: u8,
    pub oem_id: u16,
    /// 5 bytes for SD, 6 for MMC; unused trailing bytes are zero.
    pub product_name: [u8; 6],
    pub product_serial: u32,
    pub product_revision: u8,
    /// Packed `(year_offset, month)` as decoded from CID.
    pub manufacturing_date: (u16, u8),
}

impl CardInfo {
    pub fn total_sectors(&self) -> u64 {
        (self.total_block_count as u64) * (self.block_size as u64) / 512
    }
}

/// Per-unit mutable state owned by the Driver Object Pool (C6), exclusively
/// accessed under the per-unit lock.
pub struct CardHandle {
    pub unit: u8,
    pub initialized: bool,
    pub rca: u32,
    pub max_block_count: u32,
    pub bus_width: u8,
    pub info: CardInfo,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub writes_ok: u64,
    pub writes_failed: u64,
    /// Intrusive free-list link; `None` when in service.
    pub(crate) next_free: Option<usize>,
    /// Bumped every time the Pool (C6) hands this slot out; lets
    /// [`crate::pool::HandleId`] detect use of a freed handle without the
    /// pool lock being held for every access.
    pub(crate) generation: u32,
}

impl CardHandle {
    pub(crate) fn reset(&mut self, unit: u8) {
        let generation = self.generation.wrapping_add(1);
        self.unit = unit;
        self.initialized = false;
        self.rca = 0;
        self.max_block_count = 1;
        self.bus_width = 1;
        self.info = CardInfo::default();
        self.reads_ok = 0;
        self.reads_failed = 0;
        self.writes_ok = 0;
        self.writes_failed = 0;
        self.next_free = None;
        self.generation = generation;
    }
}

impl Default for CardHandle {
    fn default() -> Self {
        Self {
            unit: 0,
            initialized: false,
            rca: 0,
            max_block_count: 1,
            bus_width: 1,
            info: CardInfo::default(),
            reads_ok: 0,
            reads_failed: 0,
            writes_ok: 0,
            writes_failed: 0,
            next_free: None,
            generation: 0,
        }
    }
}
