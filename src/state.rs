//! Card State Machine (C4): drives a card from power-on through
//! identification into transfer state, or fails cleanly, then watches for
//! card replacement via [`refresh`].
//!
//! Written once against [`Bus`] rather than duplicated per transport — a
//! compile-time `{send_cmd, read_data, write_data, ...}` capability set; the
//! native and SPI adapters in [`crate::bus`] supply the only
//! transport-specific code.

use core::time::Duration;

use crate::bus::Bus;
use crate::card::{CardHandle, CardInfo, CardState, CardStatusFlags, CardVariant};
use crate::command::{acmd, build_descriptor, cmd};
use crate::config::DriverConfig;
use crate::constants::*;
use crate::error::{DeviceError, DeviceStatus};
use crate::kernel::sleep;
use crate::osa::SectorBufferPool;
use crate::regs::{cid, csd, ext_csd, scr, sd_status};
use crate::transport::{
    CommandDescriptor, CommandFlags, DataDirection, DataFraming, Response, ResponseShape,
};

/// Outcome of a [`refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Same card, same identity; [`CardHandle`] left untouched.
    Unchanged,
    /// A different (or newly inserted) card was found and bring-up
    /// succeeded against it.
    Changed,
    /// The card changed (or the old one vanished) but bring-up against
    /// whatever is there now failed; the upper layer must invalidate its
    /// volume cache.
    ChangedButFailed,
}

fn ms(n: u32) -> Duration {
    Duration::from_millis(n as u64)
}

/// Thin wrapper resolving ACMD*n* through the mandatory CMD55 prefix and
/// checking the ordering rule: the first successful R1 after CMD55 must
/// have the APP_CMD bit set, otherwise the following ACMD is treated as a
/// regular command and rejected. SPI has no such status bit (its R1 is
/// [`crate::card::SpiR1Flags`], not the card-status register), so the check
/// is native-only.
///
/// `rca` is the card's relative address, already known to be `0` during
/// ACMD41 polling (identification hasn't happened yet) and the real value
/// for every ACMD issued afterwards (SCR, SD Status, SET_BUS_WIDTH) —
/// `fs_dev_sd_card.c`'s `FSDev_SD_Card_SendSCR`/`SendSDStatus` both send
/// CMD55 with the card's RCA, not 0.
fn acmd_prefix(bus: &mut dyn Bus, variant: CardVariant, rca: u32) -> DeviceStatus<()> {
    let d55 = build_descriptor(cmd::APP_CMD as u16, rca << 16, variant, 0, 0);
    let r55 = bus.send_cmd(&d55)?;
    if !bus.is_spi() {
        let status = CardStatusFlags::from_bits_truncate(r55.short());
        if !status.contains(CardStatusFlags::APP_CMD) {
            return Err(DeviceError::DeviceIo);
        }
    }
    Ok(())
}

/// [`send`] for an ACMD issued before identification, where the RCA isn't
/// known yet — ACMD41 priming and polling.
fn send(
    bus: &mut dyn Bus,
    variant: CardVariant,
    index: u16,
    argument: u32,
    block_size: u32,
    block_count: u32,
) -> DeviceStatus<Response> {
    if crate::command::is_acmd_index(index) {
        acmd_prefix(bus, variant, 0)?;
    }
    let d = build_descriptor(index, argument, variant, block_size, block_count);
    Ok(bus.send_cmd(&d)?)
}

/// Same as [`send`] but addresses the card by its RCA (upper 16 bits of the
/// argument), the shape every post-identification command takes.
fn send_addressed(
    bus: &mut dyn Bus,
    variant: CardVariant,
    index: u16,
    rca: u32,
) -> DeviceStatus<Response> {
    send(bus, variant, index, rca << 16, 0, 0)
}

/// Manually framed CMD9/CMD10 register read for SPI, where CSD/CID arrive
/// as a data block rather than a long response. Native gets these straight
/// out of the R2 long response instead; see [`read_register_16`].
fn read_register_16_spi(bus: &mut dyn Bus, index: u8) -> DeviceStatus<[u8; 16]> {
    let descriptor = CommandDescriptor {
        index,
        argument: 0,
        response_shape: ResponseShape::R1,
        flags: CommandFlags::INDEX_VALID
            | CommandFlags::CRC_VALID
            | CommandFlags::EXPECTS_RESPONSE
            | CommandFlags::STARTS_DATA,
        data_direction: DataDirection::CardToHost,
        data_framing: DataFraming::SingleBlock,
        block_size: 16,
        block_count: 1,
        is_app_cmd: false,
    };
    bus.send_cmd(&descriptor)?;
    let mut raw = [0u8; 16];
    bus.read_data(&descriptor, &mut raw)?;
    Ok(raw)
}

/// CID/CSD read for either transport: native takes the R2 long response
/// directly, SPI frames it as a data block.
fn read_register_16(
    bus: &mut dyn Bus,
    variant: CardVariant,
    index: u8,
    argument: u32,
) -> DeviceStatus<[u8; 16]> {
    if bus.is_spi() {
        read_register_16_spi(bus, index)
    } else {
        let resp = send(bus, variant, index as u16, argument, 0, 0)?;
        Ok(resp.long_bytes())
    }
}

/// Step 1: hold the default clock, reset the card with GO_IDLE_STATE up to
/// `cmd0_max_attempts` times.
fn reset(bus: &mut dyn Bus, config: &DriverConfig) -> DeviceStatus<()> {
    bus.set_clock_hz(DEFAULT_CLOCK_HZ);
    bus.set_bus_width(1);
    bus.set_resp_timeout(config.command_response_timeout_ms);

    for _ in 0..config.cmd0_max_attempts {
        let d = build_descriptor(cmd::GO_IDLE_STATE as u16, 0, CardVariant::None, 0, 0);
        match bus.send_cmd(&d) {
            Ok(resp) => {
                if !bus.is_spi() {
                    return Ok(());
                }
                // SPI: CMD0 must additionally report the idle-state bit.
                if resp.short() & 0x01 != 0 {
                    return Ok(());
                }
            }
            Err(_) => {}
        }
        sleep(ms(CMD0_RETRY_DELAY_MS));
    }
    Err(DeviceError::DeviceNotPresent)
}

/// Step 2: SEND_IF_COND; `true` iff the card echoed the check pattern,
/// meaning it is SD v2.0 and HCS should be requested.
fn probe_interface_condition(bus: &mut dyn Bus) -> bool {
    let d = build_descriptor(
        cmd::SEND_IF_COND_OR_EXT_CSD as u16,
        CMD8_CHECK_PATTERN_ARG,
        CardVariant::SdV2Std,
        0,
        0,
    );
    match bus.send_cmd(&d) {
        Ok(resp) => {
            let payload = if bus.is_spi() { resp.words[1] } else { resp.short() };
            payload & 0x1ff == CMD8_CHECK_PATTERN_ARG
        }
        Err(_) => false,
    }
}

/// Step 3: poll ACMD41 (SD) then fall back to CMD1 (MMC). Returns
/// `(variant, high_capacity)`.
///
/// Resolves the CMD8/ACMD41 interleave: per the reference bring-up chart, a
/// card that doesn't answer CMD8 (v1.x)
/// gets one *priming* ACMD41 with argument 0 first, whose OCR echo supplies
/// the voltage-window bits for the retry loop that follows — no HCS bit,
/// since HCS only applies once CMD8 has confirmed v2.0. A card that does
/// answer CMD8 skips the primer and polls straight away with HCS set.
fn negotiate_operating_condition(
    bus: &mut dyn Bus,
    config: &DriverConfig,
    is_sd_v2: bool,
) -> DeviceStatus<(CardVariant, bool)> {
    let hcs_arg = if is_sd_v2 {
        OCR_HCS_BIT | OCR_VOLTAGE_WINDOW
    } else {
        let primer = send(
            bus,
            CardVariant::SdV2Std,
            crate::command::encode_acmd(acmd::SD_SEND_OP_COND),
            0,
            0,
            0,
        );
        match primer {
            Ok(resp) => if bus.is_spi() { resp.words[1] } else { resp.short() },
            Err(_) => OCR_VOLTAGE_WINDOW,
        }
    };
    for _ in 0..config.acmd41_max_attempts {
        let resp = send(
            bus,
            CardVariant::SdV2Std,
            crate::command::encode_acmd(acmd::SD_SEND_OP_COND),
            hcs_arg,
            0,
            0,
        );
        if let Ok(resp) = resp {
            let ocr = if bus.is_spi() { resp.words[1] } else { resp.short() };
            if ocr & OCR_BUSY_BIT != 0 {
                let hc = is_sd_v2 && (ocr & OCR_CCS_BIT != 0);
                return Ok((if hc { CardVariant::SdV2Hc } else if is_sd_v2 { CardVariant::SdV2Std } else { CardVariant::SdV1x }, hc));
            }
        }
        sleep(ms(ACMD41_RETRY_DELAY_MS));
    }

    for _ in 0..config.cmd1_max_attempts {
        let d = build_descriptor(cmd::SEND_OP_COND_MMC as u16, OCR_HCS_BIT, CardVariant::Mmc, 0, 0);
        if let Ok(resp) = bus.send_cmd(&d) {
            let ocr = if bus.is_spi() { resp.words[1] } else { resp.short() };
            if ocr & OCR_BUSY_BIT != 0 {
                let hc = ocr & OCR_CCS_BIT != 0;
                return Ok((if hc { CardVariant::MmcHc } else { CardVariant::Mmc }, hc));
            }
        }
        sleep(ms(CMD1_RETRY_DELAY_MS));
    }

    Err(DeviceError::DeviceNotPresent)
}

/// Steps 4-9: identify (native only), read CSD, select, set block length,
/// negotiate bus width, and (high-capacity MMC) read Extended CSD. Returns
/// the populated [`CardInfo`], negotiated RCA, and the bus width actually
/// accepted by the card — the host's own bus width is only updated *after*
/// the card has accepted the new width, so this is that accepted width, not
/// the host's raw capability.
fn identify_and_configure(
    bus: &mut dyn Bus,
    config: &DriverConfig,
    variant: CardVariant,
    high_capacity: bool,
    pool: &dyn SectorBufferPool,
) -> DeviceStatus<(CardInfo, u32, u8)> {
    let is_mmc = variant.is_mmc();

    // Step 4: identification (native) / CID read (SPI, supplementary —
    // needed so refresh (§4.3.3) has an identity to compare on SPI too).
    let (cid_raw, rca) = if bus.is_spi() {
        let raw = read_register_16_spi(bus, cmd::SEND_CID)?;
        (raw, 0)
    } else {
        let cid_resp = send(bus, variant, cmd::ALL_SEND_CID as u16, 0, 0, 0)?;
        let cid_raw = cid_resp.long_bytes();
        let rca = if is_mmc {
            send(bus, variant, cmd::SEND_RELATIVE_ADDR as u16, MMC_DEFAULT_RCA << 16, 0, 0)?;
            MMC_DEFAULT_RCA
        } else {
            let r6 = send(bus, variant, cmd::SEND_RELATIVE_ADDR as u16, 0, 0, 0)?;
            (r6.short() >> 16) & 0xffff
        };
        (cid_raw, rca)
    };
    let cid_fields = cid::decode(&cid_raw, variant);

    // Step 5: CSD, then raise the clock and data timeout before selecting.
    let csd_raw = read_register_16(bus, variant, cmd::SEND_CSD, rca << 16)?;
    let csd_info = csd::decode(&csd_raw, is_mmc)?;
    bus.set_clock_hz(csd_info.max_clock_hz);
    bus.set_data_timeout(csd_info.data_timeout_ms);

    // Step 6: select (native only — SPI has no card-side select state).
    if !bus.is_spi() {
        send_addressed(bus, variant, cmd::SELECT_CARD as u16, rca)?;
    }

    // Step 7: SET_BLOCKLEN. Non-fatal if the card rejects it (high-capacity
    // cards fix the block length at 512 and may NAK this).
    let _ = send(bus, variant, cmd::SET_BLOCKLEN as u16, config.default_block_size, 0, 0);

    let mut total_block_count = csd_info.total_block_count;
    let mut bus_width: u8 = 1;

    // Step 8: bus width negotiation.
    let host_max_width = bus.max_bus_width();
    if !is_mmc {
        let scr_raw = {
            let mut buf = [0u8; 8];
            acmd_prefix(bus, variant, rca)?;
            let d = build_descriptor(
                crate::command::encode_acmd(acmd::SEND_SCR),
                0,
                variant,
                8,
                1,
            );
            bus.send_cmd(&d)?;
            bus.read_data(&d, &mut buf)?;
            buf
        };
        let scr_info = scr::decode(&scr_raw);
        if host_max_width >= 4 && scr_info.supports_4bit {
            acmd_prefix(bus, variant, rca)?;
            let set_width_d = build_descriptor(crate::command::encode_acmd(acmd::SET_BUS_WIDTH), 2, variant, 0, 0);
            bus.send_cmd(&set_width_d)?;
            bus.set_bus_width(4);
            bus_width = 4;

            if config.verify_bus_width {
                let mut status = [0u8; 64];
                acmd_prefix(bus, variant, rca)?;
                let d = build_descriptor(
                    crate::command::encode_acmd(acmd::SD_STATUS),
                    0,
                    variant,
                    64,
                    1,
                );
                bus.send_cmd(&d)?;
                bus.read_data(&d, &mut status)?;
                if !matches!(sd_status::decode_bus_width(&status), sd_status::ReportedBusWidth::Bit4) {
                    return Err(DeviceError::DeviceIo);
                }
            }
        }
    } else {
        let value = if host_max_width >= 8 { MMC_BUS_WIDTH_8BIT } else if host_max_width >= 4 { MMC_BUS_WIDTH_4BIT } else { 0 };
        if value != 0 {
            let switch_arg = MMC_SWITCH_ACCESS_WRITE_BYTE | MMC_EXT_CSD_BUS_WIDTH_INDEX | ((value as u32) << 8);
            send(bus, variant, cmd::SWITCH as u16, switch_arg, 0, 0)?;

            let target_width = if value == MMC_BUS_WIDTH_8BIT { 8 } else { 4 };
            let mut settled = false;
            for _ in 0..SWITCH_SETTLE_MAX_POLLS {
                if let Ok(resp) = send_addressed(bus, variant, cmd::SEND_STATUS as u16, rca) {
                    if !bus.is_spi() && CardState::from_r1(resp.short()) == CardState::Transfer {
                        settled = true;
                        break;
                    }
                    if bus.is_spi() {
                        settled = true;
                        break;
                    }
                }
                sleep(ms(SWITCH_SETTLE_POLL_DELAY_MS));
            }
            if !settled {
                return Err(DeviceError::DeviceIo);
            }
            bus.set_bus_width(target_width);
            bus_width = target_width;
        }
    }

    // Step 9: high-capacity MMC overrides the block count from EXT_CSD.
    if is_mmc && high_capacity {
        let buffer = pool.acquire(512)?;
        // SAFETY: `buffer` was just acquired at exactly 512 bytes and is not
        // aliased anywhere else.
        let dest: &mut [u8] =
            unsafe { core::slice::from_raw_parts_mut(buffer.addr().as_ptr(), 512) };
        let d = build_descriptor(cmd::SEND_IF_COND_OR_EXT_CSD as u16, 0, variant, 512, 1);
        bus.send_cmd(&d)?;
        bus.read_data(&d, dest)?;
        let mut raw = [0u8; 512];
        raw.copy_from_slice(dest);
        total_block_count = ext_csd::decode_sector_count(&raw)?;
        drop(buffer);
    }

    let mut info = CardInfo {
        block_size: csd_info.block_size,
        total_block_count,
        max_clock_hz: csd_info.max_clock_hz,
        data_access_timeout_ms: csd_info.data_timeout_ms,
        variant,
        high_capacity,
        ..CardInfo::default()
    };
    cid::apply(&mut info, cid_fields);

    Ok((info, rca, bus_width))
}

/// Step 10: SPI-only CRC enablement.
fn enable_spi_crc_if_configured(bus: &mut dyn Bus, variant: CardVariant) {
    if bus.is_spi() {
        let _ = send(bus, variant, cmd::CRC_ON_OFF as u16, 0x0000_0001, 0, 0);
    }
}

/// Run the full bring-up sequence (steps 1-10) against a freshly reset bus,
/// populating `handle` on success. On any terminal failure
/// `handle.initialized` is left `false` and the caller (Facade, C7) frees
/// the pool slot and returns failure.
pub fn bring_up(
    bus: &mut dyn Bus,
    handle: &mut CardHandle,
    config: &DriverConfig,
    pool: &dyn SectorBufferPool,
) -> DeviceStatus<()> {
    handle.initialized = false;

    reset(bus, config)?;
    let is_sd_v2 = probe_interface_condition(bus);

    let (variant, high_capacity) = negotiate_operating_condition(bus, config, is_sd_v2)?;
    let (info, rca, bus_width) = identify_and_configure(bus, config, variant, high_capacity, pool)?;
    enable_spi_crc_if_configured(bus, variant);

    handle.rca = rca;
    handle.max_block_count = bus.max_block_count(info.block_size).max(1);
    handle.bus_width = bus_width;
    handle.info = info;
    handle.initialized = true;
    Ok(())
}

/// Refresh: re-read the CID and compare manufacturer id, OEM id, and serial
/// number against the cached [`CardInfo`]. Matches ⇒
/// [`RefreshOutcome::Unchanged`]; a mismatch (or the read failing outright)
/// tears down and re-runs bring-up.
pub fn refresh(
    bus: &mut dyn Bus,
    handle: &mut CardHandle,
    config: &DriverConfig,
    pool: &dyn SectorBufferPool,
) -> DeviceStatus<RefreshOutcome> {
    if !handle.initialized {
        return bring_up(bus, handle, config, pool).map(|_| RefreshOutcome::Changed);
    }

    let variant = handle.info.variant;
    let rca = handle.rca;
    let cached_identity = (handle.info.manufacturer_id, handle.info.oem_id, handle.info.product_serial);

    let current = if bus.is_spi() {
        read_register_16_spi(bus, cmd::SEND_CID)
    } else {
        send_addressed(bus, variant, cmd::SEND_CID as u16, rca).map(|r| r.long_bytes())
    };

    match current {
        Ok(raw) => {
            let fields = cid::decode(&raw, variant);
            if cid::identity_key(&fields) == cached_identity {
                Ok(RefreshOutcome::Unchanged)
            } else {
                match bring_up(bus, handle, config, pool) {
                    Ok(()) => Ok(RefreshOutcome::Changed),
                    Err(_) => Ok(RefreshOutcome::ChangedButFailed),
                }
            }
        }
        Err(_) => match bring_up(bus, handle, config, pool) {
            Ok(()) => Ok(RefreshOutcome::Changed),
            Err(_) => Ok(RefreshOutcome::ChangedButFailed),
        },
    }
}

/// `ReadCid` io_ctrl support: re-read CID for an already selected card.
pub(crate) fn read_cid_bytes(bus: &mut dyn Bus, handle: &CardHandle) -> DeviceStatus<[u8; 16]> {
    if bus.is_spi() {
        read_register_16_spi(bus, cmd::SEND_CID)
    } else {
        let resp = send_addressed(bus, handle.info.variant, cmd::SEND_CID as u16, handle.rca)?;
        Ok(resp.long_bytes())
    }
}

/// `ReadCsd` io_ctrl support: SEND_CSD only answers a card in Standby, so a
/// selected card must be deselected first and reselected after.
pub(crate) fn read_csd_bytes(bus: &mut dyn Bus, handle: &CardHandle) -> DeviceStatus<[u8; 16]> {
    if !bus.is_spi() {
        let deselect = build_descriptor(cmd::SELECT_CARD as u16, 0, handle.info.variant, 0, 0);
        let _ = bus.send_cmd(&deselect);
    }
    let raw = read_register_16(bus, handle.info.variant, cmd::SEND_CSD, handle.rca << 16)?;
    if !bus.is_spi() {
        let reselect = build_descriptor(cmd::SELECT_CARD as u16, handle.rca << 16, handle.info.variant, 0, 0);
        bus.send_cmd(&reselect)?;
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use alloc::collections::{BTreeMap, VecDeque};
    use alloc::vec::Vec;

    /// A [`Bus`] whose every reply is scripted ahead of time, keyed by the
    /// command's decoded `(index, is_app_cmd)`. A single scripted reply for a
    /// key is sticky (returned to every call); a longer queue is consumed
    /// front-first, with the last entry then sticking — enough to model "one
    /// bad attempt, then recovers" and "works, then stops working" without a
    /// counter field per test.
    struct ScriptedBus {
        is_spi: bool,
        max_bus_width: u8,
        max_block_count: u32,
        cmd: BTreeMap<(u8, bool), VecDeque<Result<Response, TransportError>>>,
        data: BTreeMap<(u8, bool), VecDeque<Result<Vec<u8>, TransportError>>>,
    }

    impl ScriptedBus {
        fn new() -> Self {
            Self {
                is_spi: false,
                max_bus_width: 4,
                max_block_count: 64,
                cmd: BTreeMap::new(),
                data: BTreeMap::new(),
            }
        }

        fn on_cmd(&mut self, index: u8, is_app_cmd: bool, reply: Result<Response, TransportError>) -> &mut Self {
            self.cmd.entry((index, is_app_cmd)).or_default().push_back(reply);
            self
        }

        /// Replaces whatever was scripted for `(index, is_app_cmd)` outright,
        /// rather than appending to it — used to change a command's behavior
        /// for a second pass (e.g. a re-triggered bring-up) after the first
        /// pass already consumed a sticky single-entry reply, which an append
        /// would leave at the front of the queue and so never observe.
        fn reset_cmd(&mut self, index: u8, is_app_cmd: bool, reply: Result<Response, TransportError>) -> &mut Self {
            let mut queue = VecDeque::new();
            queue.push_back(reply);
            self.cmd.insert((index, is_app_cmd), queue);
            self
        }

        fn on_data(&mut self, index: u8, is_app_cmd: bool, reply: Result<Vec<u8>, TransportError>) -> &mut Self {
            self.data.entry((index, is_app_cmd)).or_default().push_back(reply);
            self
        }
    }

    fn take_scripted<T: Clone>(queue: &mut VecDeque<T>, index: u8, is_app_cmd: bool) -> T {
        assert!(!queue.is_empty(), "unscripted command index={index} acmd={is_app_cmd}");
        if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        }
    }

    impl Bus for ScriptedBus {
        fn send_cmd(&mut self, cmd: &CommandDescriptor) -> Result<Response, TransportError> {
            let queue = self
                .cmd
                .get_mut(&(cmd.index, cmd.is_app_cmd))
                .unwrap_or_else(|| panic!("unscripted command index={} acmd={}", cmd.index, cmd.is_app_cmd));
            take_scripted(queue, cmd.index, cmd.is_app_cmd)
        }

        fn read_data(&mut self, cmd: &CommandDescriptor, dest: &mut [u8]) -> Result<(), TransportError> {
            let queue = self
                .data
                .get_mut(&(cmd.index, cmd.is_app_cmd))
                .unwrap_or_else(|| panic!("unscripted data read index={} acmd={}", cmd.index, cmd.is_app_cmd));
            let bytes = take_scripted(queue, cmd.index, cmd.is_app_cmd)?;
            dest.copy_from_slice(&bytes);
            Ok(())
        }

        fn write_data(&mut self, _cmd: &CommandDescriptor, _src: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn set_clock_hz(&mut self, _hz: u32) {}
        fn set_bus_width(&mut self, _width: u8) {}
        fn set_data_timeout(&mut self, _clocks: u32) {}
        fn set_resp_timeout(&mut self, _ms: u32) {}

        fn max_block_count(&self, _block_size: u32) -> u32 {
            self.max_block_count
        }
        fn max_bus_width(&self) -> u8 {
            self.max_bus_width
        }

        fn lock(&mut self) {}
        fn unlock(&mut self) {}
        fn is_spi(&self) -> bool {
            self.is_spi
        }
    }

    struct NullPool;
    impl SectorBufferPool for NullPool {
        fn acquire(&self, _size: usize) -> DeviceStatus<crate::osa::pool_buffer::PoolBuffer> {
            Err(DeviceError::BufferUnavailable)
        }
    }

    fn long_resp(raw: &[u8; 16]) -> Response {
        let mut words = [0u32; 4];
        for i in 0..4 {
            words[i] = u32::from_be_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap());
        }
        Response { words }
    }

    /// MID=0x03 OID="SD" PNM="SU08G" PRV=0x10 PSN=`serial` MDT: year 2020, month 7.
    fn sd_cid_bytes(serial: u32) -> [u8; 16] {
        let mut raw = [0u8; 16];
        raw[0] = 0x03;
        raw[1] = b'S';
        raw[2] = b'D';
        raw[3] = b'S';
        raw[4] = b'U';
        raw[5] = b'0';
        raw[6] = b'8';
        raw[7] = b'G';
        raw[8] = 0x10;
        raw[9..13].copy_from_slice(&serial.to_be_bytes());
        raw[13] = 0x01;
        raw[14] = 0x47;
        raw[15] = 0x01;
        raw
    }

    /// CSD_STRUCTURE=1 (SD v2.0 HC), TRAN_SPEED=0x32 (25 MHz), given `c_size`.
    fn sdhc_csd_bytes(c_size: u32) -> [u8; 16] {
        let mut reg: u128 = 1u128 << 126;
        reg |= 0x32u128 << 96;
        reg |= (c_size as u128) << 48;
        reg.to_be_bytes()
    }

    /// SCR with 4-bit bus width support, SD_SPEC = 2.
    fn scr_4bit_bytes() -> [u8; 8] {
        let mut reg: u64 = 1u64 << 50;
        reg |= 2u64 << 56;
        reg.to_be_bytes()
    }

    /// Scripts a full, successful SD v2.0 high-capacity native bring-up:
    /// CMD0, CMD8 (check pattern echoed), a primed ACMD41 poll reporting
    /// busy-clear then CCS set, identification, CSD
    /// (`C_SIZE = 0xE90`), select, SET_BLOCKLEN, and a 4-bit SCR-driven width
    /// switch.
    fn scripted_bring_up_bus(cid_serial: u32) -> ScriptedBus {
        let mut bus = ScriptedBus::new();
        bus.on_cmd(cmd::GO_IDLE_STATE, false, Ok(Response::empty()));
        bus.on_cmd(
            cmd::SEND_IF_COND_OR_EXT_CSD,
            false,
            Ok(Response { words: [CMD8_CHECK_PATTERN_ARG, 0, 0, 0] }),
        );
        bus.on_cmd(
            cmd::APP_CMD,
            false,
            Ok(Response { words: [CardStatusFlags::APP_CMD.bits(), 0, 0, 0] }),
        );
        bus.on_cmd(
            acmd::SD_SEND_OP_COND,
            true,
            Ok(Response { words: [OCR_BUSY_BIT | OCR_CCS_BIT | OCR_VOLTAGE_WINDOW, 0, 0, 0] }),
        );
        bus.on_cmd(cmd::ALL_SEND_CID, false, Ok(long_resp(&sd_cid_bytes(cid_serial))));
        bus.on_cmd(cmd::SEND_RELATIVE_ADDR, false, Ok(Response { words: [0x1234_0000, 0, 0, 0] }));
        bus.on_cmd(cmd::SEND_CSD, false, Ok(long_resp(&sdhc_csd_bytes(0xE90))));
        bus.on_cmd(cmd::SELECT_CARD, false, Ok(Response::empty()));
        bus.on_cmd(cmd::SET_BLOCKLEN, false, Ok(Response::empty()));
        bus.on_cmd(acmd::SEND_SCR, true, Ok(Response::empty()));
        bus.on_data(acmd::SEND_SCR, true, Ok(scr_4bit_bytes().to_vec()));
        bus.on_cmd(acmd::SET_BUS_WIDTH, true, Ok(Response::empty()));
        bus
    }

    #[test]
    fn bring_up_sd_v2_hc_scenario() {
        let mut bus = scripted_bring_up_bus(0xDEAD_BEEF);
        let mut handle = CardHandle::default();
        let config = DriverConfig::default();
        let pool = NullPool;

        bring_up(&mut bus, &mut handle, &config, &pool).unwrap();

        assert!(handle.initialized);
        assert_eq!(handle.rca, 0x1234);
        assert_eq!(handle.bus_width, 4);
        assert_eq!(handle.info.variant, CardVariant::SdV2Hc);
        assert!(handle.info.high_capacity);
        assert_eq!(handle.info.block_size, 512);
        assert_eq!(handle.info.total_block_count, 0xE91 * 1024);
        assert_eq!(handle.info.manufacturer_id, 0x03);
        assert_eq!(handle.info.product_serial, 0xDEAD_BEEF);
    }

    #[test]
    fn cmd0_exhaustion_yields_device_not_present() {
        let mut bus = ScriptedBus::new();
        bus.on_cmd(cmd::GO_IDLE_STATE, false, Err(TransportError::NoCard));
        let config = DriverConfig::default();
        assert_eq!(reset(&mut bus, &config), Err(DeviceError::DeviceNotPresent));
    }

    #[test]
    fn acmd41_and_cmd1_exhaustion_yields_device_not_present() {
        let mut bus = ScriptedBus::new();
        bus.on_cmd(cmd::APP_CMD, false, Ok(Response { words: [CardStatusFlags::APP_CMD.bits(), 0, 0, 0] }));
        // OCR never reports busy-cleared (power-up complete), so both the SD
        // and MMC polling loops run out their full attempt budget.
        bus.on_cmd(acmd::SD_SEND_OP_COND, true, Ok(Response::empty()));
        bus.on_cmd(cmd::SEND_OP_COND_MMC, false, Ok(Response::empty()));
        let config = DriverConfig::default();
        assert_eq!(
            negotiate_operating_condition(&mut bus, &config, true),
            Err(DeviceError::DeviceNotPresent)
        );
    }

    fn bring_up_handle(cid_serial: u32) -> (ScriptedBus, CardHandle, DriverConfig, NullPool) {
        let bus = scripted_bring_up_bus(cid_serial);
        let handle = CardHandle::default();
        (bus, handle, DriverConfig::default(), NullPool)
    }

    #[test]
    fn refresh_unchanged_when_cid_matches() {
        let (mut bus, mut handle, config, pool) = bring_up_handle(0xDEAD_BEEF);
        bring_up(&mut bus, &mut handle, &config, &pool).unwrap();
        bus.on_cmd(cmd::SEND_CID, false, Ok(long_resp(&sd_cid_bytes(0xDEAD_BEEF))));

        assert_eq!(refresh(&mut bus, &mut handle, &config, &pool), Ok(RefreshOutcome::Unchanged));
        assert_eq!(handle.info.product_serial, 0xDEAD_BEEF);
    }

    #[test]
    fn refresh_detects_new_card_and_re_bringup_succeeds() {
        let (mut bus, mut handle, config, pool) = bring_up_handle(0xDEAD_BEEF);
        bring_up(&mut bus, &mut handle, &config, &pool).unwrap();
        // SEND_CID during refresh reports a different serial than the one
        // ALL_SEND_CID returned during the original bring-up.
        bus.on_cmd(cmd::SEND_CID, false, Ok(long_resp(&sd_cid_bytes(0xC0FF_EE00))));

        assert_eq!(refresh(&mut bus, &mut handle, &config, &pool), Ok(RefreshOutcome::Changed));
        // Re-identification always runs through ALL_SEND_CID, so the cached
        // identity reflects that, not the probe read.
        assert_eq!(handle.info.product_serial, 0xDEAD_BEEF);
    }

    #[test]
    fn refresh_changed_but_failed_when_re_bringup_fails() {
        let (mut bus, mut handle, config, pool) = bring_up_handle(0xDEAD_BEEF);
        bring_up(&mut bus, &mut handle, &config, &pool).unwrap();
        bus.on_cmd(cmd::SEND_CID, false, Ok(long_resp(&sd_cid_bytes(0xC0FF_EE00))));
        // ALL_SEND_CID is a single, non-retried call inside the re-triggered
        // bring-up, so overriding it to fail deterministically fails the
        // whole re-identification without needing to exhaust a retry budget.
        bus.reset_cmd(cmd::ALL_SEND_CID, false, Err(TransportError::NoCard));

        assert_eq!(
            refresh(&mut bus, &mut handle, &config, &pool),
            Ok(RefreshOutcome::ChangedButFailed)
        );
    }
}
