//! Public Block Device Facade (C7): the vtable the upper (file-system/
//! volume) layer actually calls — `name`, `init`, `open`, `close`, `read`,
//! `write`, `query`, `io_ctrl` — a fixed small surface rather than one big
//! struct.

use spin::Mutex;

use crate::bus::Bus;
use crate::card::CardInfo;
use crate::command::cmd;
use crate::config::DriverConfig;
use crate::constants::MAX_UNIT_NUMBER;
use crate::error::{DeviceError, DeviceStatus, ErrorObserver};
use crate::io;
use crate::osa::{osa_init, SectorBufferPool};
use crate::pool::{DriverPool, HandleId};
use crate::state::{self, RefreshOutcome};

/// One more than the path grammar's unit range (`unit := DIGIT+ ; 0..24`),
/// sized to index `buses`/`configs` directly by unit number.
const UNIT_SLOTS: usize = MAX_UNIT_NUMBER as usize + 1;

/// `query()` result.
#[derive(Debug, Clone, Copy)]
pub struct VolumeInfo {
    pub sector_size: u32,
    pub total_sectors: u64,
    /// Always `true`: every card this core drives is a removable medium.
    pub removable: bool,
}

/// `io_ctrl` operation selector.
#[derive(Debug, Clone, Copy)]
pub enum IoCtrlOp {
    Refresh,
    QueryCardInfo,
    ReadCid,
    ReadCsd,
}

/// `io_ctrl` result, one variant per [`IoCtrlOp`].
#[derive(Debug, Clone, Copy)]
pub enum IoCtrlResult {
    Refresh { changed: bool },
    CardInfo(CardInfo),
    Cid([u8; 16]),
    Csd([u8; 16]),
}

/// The facade. Generic over the concrete [`Bus`] it drives
/// (one facade instance serves either every native unit or every SPI
/// unit — the two wire protocols never share a facade) and the
/// [`SectorBufferPool`] it lends bring-up.
pub struct BlockDeviceFacade<B: Bus, P: SectorBufferPool> {
    name: &'static str,
    pool: DriverPool,
    sector_pool: P,
    buses: [Mutex<Option<B>>; UNIT_SLOTS],
    configs: [Mutex<DriverConfig>; UNIT_SLOTS],
    /// Optional per-kind error counter, installed per unit as an observer
    /// handed in at open time rather than counter fields on the hot handle.
    /// `None` by default — callers that don't care about instrumentation
    /// pay nothing.
    observers: [Mutex<Option<&'static dyn ErrorObserver>>; UNIT_SLOTS],
}

impl<B: Bus, P: SectorBufferPool> BlockDeviceFacade<B, P> {
    pub fn new(name: &'static str, sector_pool: P) -> Self {
        Self {
            name,
            pool: DriverPool::new(),
            sector_pool,
            buses: core::array::from_fn(|_| Mutex::new(None)),
            configs: core::array::from_fn(|_| Mutex::new(DriverConfig::default())),
            observers: core::array::from_fn(|_| Mutex::new(None)),
        }
    }

    /// Install an [`ErrorObserver`] for `unit`; every `DeviceError` surfaced
    /// by `open`/`read`/`write`/`io_ctrl` on that unit is reported to it
    /// after the call returns its own result.
    pub fn attach_observer(&self, unit: u8, observer: &'static dyn ErrorObserver) -> DeviceStatus<()> {
        let slot = self
            .observers
            .get(unit as usize)
            .ok_or(DeviceError::DeviceInvalidUnit)?;
        *slot.lock() = Some(observer);
        Ok(())
    }

    fn report<T>(&self, unit: u8, result: &DeviceStatus<T>) {
        if let Err(e) = result {
            if let Some(observer) = *self.observers[unit as usize].lock() {
                observer.on_error(*e);
            }
        }
    }

    /// `name()`: the prefix every path passed to [`open`] must carry, e.g.
    /// `"sdcard"` for native, `"sd"` for SPI.
    ///
    /// [`open`]: Self::open
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `init()`: one-time global setup, independent of any particular unit.
    pub fn init(&self) {
        osa_init();
    }

    /// Register the transport for `unit`, built by the platform layer from
    /// its own `NativeTransport`/`SpiTransport`. Must happen before `open()`
    /// targets that unit; calling it again replaces a closed unit's bus.
    pub fn attach_bus(&self, unit: u8, bus: B) -> DeviceStatus<()> {
        let slot = self
            .buses
            .get(unit as usize)
            .ok_or(DeviceError::DeviceInvalidUnit)?;
        *slot.lock() = Some(bus);
        Ok(())
    }

    /// Validate `path` against the `name:unit:` grammar, rejecting
    /// non-matching prefixes before touching any device, and extract the
    /// unit number.
    fn parse_path(&self, path: &str) -> DeviceStatus<u8> {
        let rest = path
            .strip_prefix(self.name)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or(DeviceError::DeviceInvalidUnit)?;
        let unit_str = rest.strip_suffix(':').ok_or(DeviceError::DeviceInvalidUnit)?;
        if unit_str.is_empty() || !unit_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DeviceError::DeviceInvalidUnit);
        }
        unit_str.parse::<u8>().map_err(|_| DeviceError::DeviceInvalidUnit)
    }

    /// `open(unit, cfg)`: validates the path, allocates a handle from the
    /// pool, and runs bring-up (C4). A failed bring-up frees the handle
    /// immediately and the facade returns failure.
    pub fn open(&self, path: &str, config: DriverConfig) -> DeviceStatus<HandleId> {
        let unit = self.parse_path(path)?;
        *self.configs[unit as usize].lock() = config;

        let id = self.pool.open(unit)?;
        let result = (|| -> DeviceStatus<()> {
            let mut bus_slot = self.buses[unit as usize].lock();
            let bus = bus_slot.as_mut().ok_or(DeviceError::DeviceNotPresent)?;
            let mut handle = self.pool.lock_handle(id)?;
            state::bring_up(bus, &mut handle, &config, &self.sector_pool)
        })();

        self.report(unit, &result);
        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                let _ = self.pool.close(id);
                Err(e)
            }
        }
    }

    /// `close(handle)`.
    pub fn close(&self, id: HandleId) -> DeviceStatus<()> {
        Ok(self.pool.close(id)?)
    }

    /// Lock the handle and its bus together — the per-unit lock must be
    /// held across an entire read/write request — and run `f` against them
    /// plus the config captured at `open()`.
    fn with_bus_and_handle<R>(
        &self,
        id: HandleId,
        f: impl FnOnce(&mut B, &mut crate::card::CardHandle, &DriverConfig) -> DeviceStatus<R>,
    ) -> DeviceStatus<R> {
        let mut handle = self.pool.lock_handle(id)?;
        if !handle.initialized {
            return Err(DeviceError::DeviceNotOpen);
        }
        let unit = handle.unit;
        let config = *self.configs[unit as usize].lock();
        let result = (|| -> DeviceStatus<R> {
            let mut bus_slot = self.buses[unit as usize].lock();
            let bus = bus_slot.as_mut().ok_or(DeviceError::DeviceNotPresent)?;
            f(bus, &mut handle, &config)
        })();
        self.report(unit, &result);
        result
    }

    /// `read(handle, buf, start, count)`.
    pub fn read(&self, id: HandleId, dest: &mut [u8], start_sector: u32, count: u32) -> DeviceStatus<()> {
        self.with_bus_and_handle(id, |bus, handle, config| {
            io::read(bus, handle, config, dest, start_sector, count)
        })
    }

    /// `write(handle, buf, start, count)`.
    pub fn write(&self, id: HandleId, src: &[u8], start_sector: u32, count: u32) -> DeviceStatus<()> {
        self.with_bus_and_handle(id, |bus, handle, config| {
            io::write(bus, handle, config, src, start_sector, count)
        })
    }

    /// `query(handle)`: `{sector-size, total-sectors, removable}`.
    pub fn query(&self, id: HandleId) -> DeviceStatus<VolumeInfo> {
        self.pool.with_handle(id, |handle| {
            if !handle.initialized {
                return Err(DeviceError::DeviceNotOpen);
            }
            Ok(VolumeInfo {
                sector_size: 512,
                total_sectors: handle.info.total_sectors(),
                removable: true,
            })
        })?
    }

    /// `io_ctrl(handle, op, payload)`.
    pub fn io_ctrl(&self, id: HandleId, op: IoCtrlOp) -> DeviceStatus<IoCtrlResult> {
        match op {
            IoCtrlOp::Refresh => {
                let outcome = self.with_bus_and_handle(id, |bus, handle, config| {
                    state::refresh(bus, handle, config, &self.sector_pool)
                })?;
                Ok(IoCtrlResult::Refresh {
                    changed: !matches!(outcome, RefreshOutcome::Unchanged),
                })
            }
            IoCtrlOp::QueryCardInfo => {
                let info = self.pool.with_handle(id, |handle| {
                    if !handle.initialized {
                        return Err(DeviceError::DeviceNotOpen);
                    }
                    Ok(handle.info)
                })??;
                Ok(IoCtrlResult::CardInfo(info))
            }
            IoCtrlOp::ReadCid => {
                let raw = self.with_bus_and_handle(id, |bus, handle, _| state::read_cid_bytes(bus, handle))?;
                Ok(IoCtrlResult::Cid(raw))
            }
            IoCtrlOp::ReadCsd => {
                let raw = self.with_bus_and_handle(id, |bus, handle, _| state::read_csd_bytes(bus, handle))?;
                Ok(IoCtrlResult::Csd(raw))
            }
        }
    }
}

/// CID/CSD command indices, re-exported for callers building their own
/// `io_ctrl` payloads (kept in [`crate::command::cmd`] as the single source
/// of truth).
pub const READ_CID_CMD: u8 = cmd::SEND_CID;
pub const READ_CSD_CMD: u8 = cmd::SEND_CSD;

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    use crate::card::CardVariant;
    use crate::error::TransportError;
    use crate::osa::pool_buffer::PoolBuffer;
    use crate::transport::{CommandDescriptor, Response};

    struct NullPool;
    impl SectorBufferPool for NullPool {
        fn acquire(&self, _size: usize) -> DeviceStatus<PoolBuffer> {
            Err(DeviceError::BufferUnavailable)
        }
    }

    /// A bus that never responds, used only to exercise path validation and
    /// pool bookkeeping without touching bring-up.
    struct DeadBus;
    impl Bus for DeadBus {
        fn send_cmd(&mut self, _cmd: &CommandDescriptor) -> Result<Response, TransportError> {
            Err(TransportError::NoCard)
        }
        fn read_data(&mut self, _cmd: &CommandDescriptor, _dest: &mut [u8]) -> Result<(), TransportError> {
            Err(TransportError::NoCard)
        }
        fn write_data(&mut self, _cmd: &CommandDescriptor, _src: &[u8]) -> Result<(), TransportError> {
            Err(TransportError::NoCard)
        }
        fn set_clock_hz(&mut self, _hz: u32) {}
        fn set_bus_width(&mut self, _width: u8) {}
        fn set_data_timeout(&mut self, _clocks: u32) {}
        fn set_resp_timeout(&mut self, _ms: u32) {}
        fn max_block_count(&self, _block_size: u32) -> u32 {
            1
        }
        fn max_bus_width(&self) -> u8 {
            1
        }
        fn lock(&mut self) {}
        fn unlock(&mut self) {}
        fn is_spi(&self) -> bool {
            false
        }
    }

    fn facade() -> BlockDeviceFacade<DeadBus, NullPool> {
        BlockDeviceFacade::new("sdcard", NullPool)
    }

    #[test]
    fn rejects_mismatched_path_prefix() {
        let f = facade();
        assert_eq!(f.parse_path("sd:0:"), Err(DeviceError::DeviceInvalidUnit));
        assert_eq!(f.parse_path("sdcard:0"), Err(DeviceError::DeviceInvalidUnit));
        assert_eq!(f.parse_path("sdcard:0:"), Ok(0));
        assert_eq!(f.parse_path("sdcard:24:"), Ok(24));
    }

    #[test]
    fn open_without_bus_fails_without_leaking_the_handle() {
        let f = facade();
        f.attach_bus(0, DeadBus).unwrap();
        let err = f.open("sdcard:0:", DriverConfig::default()).unwrap_err();
        assert_eq!(err, DeviceError::DeviceNotPresent);
        // Slot must have been returned to the pool; a second attempt sees the same failure, not AlreadyOpen.
        let err2 = f.open("sdcard:0:", DriverConfig::default()).unwrap_err();
        assert_eq!(err2, DeviceError::DeviceNotPresent);
        let _ = CardVariant::None;
    }
}
