//! Driver-wide configuration (`DriverConfig`).

use crate::constants::*;

/// Tunables the original C driver exposed as compile-time `#define`s.
///
/// Embedders who need different bounds (e.g. a slower bus needing a longer
/// response timeout) construct their own and pass it to
/// [`crate::facade::BlockDeviceFacade::open`].
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
    pub default_block_size: u32,
    pub io_retry_limit: u32,
    pub cmd0_max_attempts: u32,
    pub acmd41_max_attempts: u32,
    pub cmd1_max_attempts: u32,
    pub stop_transmission_recovery_polls: u32,
    pub command_response_timeout_ms: u32,
    /// Read back SD Status (ACMD13) after SET_BUS_WIDTH and confirm the
    /// reported width; off by default since many hosts omit it.
    pub verify_bus_width: bool,
    /// Debug write-verification path: re-read every sector after a
    /// successful write and compare. Gated behind the `verify-writes`
    /// feature at the call site as well as this flag.
    pub verify_writes: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            default_block_size: DEFAULT_BLOCK_SIZE,
            io_retry_limit: IO_RETRY_LIMIT,
            cmd0_max_attempts: CMD0_MAX_ATTEMPTS,
            acmd41_max_attempts: ACMD41_MAX_ATTEMPTS,
            cmd1_max_attempts: CMD1_MAX_ATTEMPTS,
            stop_transmission_recovery_polls: STOP_TRANSMISSION_RECOVERY_POLLS,
            command_response_timeout_ms: COMMAND_RESPONSE_TIMEOUT_MS,
            verify_bus_width: false,
            verify_writes: cfg!(feature = "verify-writes"),
        }
    }
}
