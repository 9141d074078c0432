//! Error taxonomy for the block-device core.
//!
//! Three narrow, module-local error enums ([`TransportError`], [`RegisterError`],
//! [`PoolError`]) fold into the single public [`DeviceError`] at the boundary
//! where each layer hands control back to the facade, mirroring the split the
//! teacher crate drew between `osa::err`, `mci::err` and `mci_host::err`.

use core::fmt;

/// Errors the Host Transport collaborator may report.
///
/// Carried verbatim into the driver's per-kind counters when an
/// [`ErrorObserver`] is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    NoCard,
    Busy,
    Unknown,
    WaitTimeout,
    RespTimeout,
    RespCrc,
    RespCmdIx,
    RespEndBit,
    RespOther,
    DataUnderrun,
    DataOverrun,
    DataTimeout,
    DataCrc,
    DataStartBit,
    DataOther,
}

/// Errors raised while decoding a fixed-layout card register (CID/CSD/SCR/...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterError {
    /// CSD structure version byte held a value outside `{0, 1, 2}`.
    UnknownCsdVersion,
    /// Decoded block size was not one of `{512, 1024, 2048, 4096}`.
    BadBlockSize,
    /// Decoded block count was zero.
    ZeroBlockCount,
    /// Device size does not fit the engine's 32-bit sector-number type.
    SizeOverflow,
}

/// Errors raised by the fixed-capacity driver object pool ([`crate::pool`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Free list was empty at `open()`.
    Exhausted,
    /// `open()` was called for a unit that already has a live handle.
    AlreadyOpen,
    /// Handle id did not resolve to a live (in-service) slot.
    InvalidHandle,
    /// Unit number fell outside `0..=24` of the path grammar.
    InvalidUnit,
}

/// Public error taxonomy surfaced to the upper (file-system/volume) layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    DeviceNotPresent,
    DeviceNotOpen,
    DeviceIo,
    DeviceTimeout,
    DeviceInvalidLowFormat,
    DeviceInvalidSize,
    DeviceInvalidSectorSize,
    DeviceInvalidUnit,
    DeviceAlreadyOpen,
    BufferUnavailable,
    MemoryAllocation,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The kind handed to [`ErrorObserver::on_error`] — an alias of [`DeviceError`]
/// today, kept distinct so counters can be retargeted without touching the
/// observer trait's signature.
pub type DeviceErrorKind = DeviceError;

/// `Result` alias used throughout the public facade.
pub type DeviceStatus<T = ()> = Result<T, DeviceError>;
/// `Result` alias used by the register parser (C3).
pub type RegisterStatus<T = ()> = Result<T, RegisterError>;
/// `Result` alias used by the driver object pool (C6).
pub type PoolStatus<T = ()> = Result<T, PoolError>;

impl From<TransportError> for DeviceError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::NoCard => DeviceError::DeviceNotPresent,
            TransportError::WaitTimeout
            | TransportError::RespTimeout
            | TransportError::DataTimeout => DeviceError::DeviceTimeout,
            TransportError::Busy
            | TransportError::Unknown
            | TransportError::RespCrc
            | TransportError::RespCmdIx
            | TransportError::RespEndBit
            | TransportError::RespOther
            | TransportError::DataUnderrun
            | TransportError::DataOverrun
            | TransportError::DataCrc
            | TransportError::DataStartBit
            | TransportError::DataOther => DeviceError::DeviceIo,
        }
    }
}

impl From<RegisterError> for DeviceError {
    fn from(e: RegisterError) -> Self {
        match e {
            RegisterError::UnknownCsdVersion => DeviceError::DeviceInvalidLowFormat,
            RegisterError::BadBlockSize => DeviceError::DeviceInvalidSectorSize,
            RegisterError::ZeroBlockCount | RegisterError::SizeOverflow => {
                DeviceError::DeviceInvalidSize
            }
        }
    }
}

impl From<PoolError> for DeviceError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Exhausted => DeviceError::MemoryAllocation,
            PoolError::AlreadyOpen => DeviceError::DeviceAlreadyOpen,
            PoolError::InvalidHandle => DeviceError::DeviceNotOpen,
            PoolError::InvalidUnit => DeviceError::DeviceInvalidUnit,
        }
    }
}

/// Optional per-kind error counter, handed in at `open()` time.
///
/// Kept as an observer rather than literal counter fields on the hot handle
/// so embedders who don't need per-kind instrumentation pay nothing for it.
pub trait ErrorObserver {
    fn on_error(&self, kind: DeviceErrorKind);
}

/// An [`ErrorObserver`] that drops every report; the default when an embedder
/// does not care to instrument per-kind counters.
pub struct NullErrorObserver;

impl ErrorObserver for NullErrorObserver {
    fn on_error(&self, _kind: DeviceErrorKind) {}
}
