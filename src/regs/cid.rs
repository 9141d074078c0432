//! CID (Card Identification) decode — manufacturer/product/serial fields,
//! including manufacturing date and product revision per the SD/MMC
//! physical layer tables.
//!
//! SD and MMC pack CID differently (MMC's product name is 6 bytes against
//! SD's 5, and field boundaries shift accordingly), so decoding branches on
//! [`CardVariant`].

use super::bits128;
use crate::card::{CardInfo, CardVariant};

/// Decoded CID fields, folded directly into [`CardInfo`] by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidFields {
    pub manufacturer_id: u8,
    pub oem_id: u16,
    pub product_name: [u8; 6],
    pub product_revision: u8,
    pub product_serial: u32,
    /// `(year, month)`, year already offset from 2000/1997 per variant.
    pub manufacturing_date: (u16, u8),
}

/// Decode a 16-byte CID buffer.
pub fn decode(raw: &[u8; 16], variant: CardVariant) -> CidFields {
    let reg = u128::from_be_bytes(*raw);
    let manufacturer_id = bits128(reg, 127, 120) as u8;

    if variant.is_mmc() {
        // MMC CID: MID[127:120] OID[111:104] PNM[103:56] PRV[55:48]
        // PSN[47:16] MDT[15:8].
        let oem_id = bits128(reg, 111, 104) as u16;
        let mut product_name = [0u8; 6];
        let pnm = bits128(reg, 103, 56) as u64;
        for (i, byte) in product_name.iter_mut().enumerate() {
            *byte = ((pnm >> ((5 - i) * 8)) & 0xff) as u8;
        }
        let product_revision = bits128(reg, 55, 48) as u8;
        let product_serial = bits128(reg, 47, 16) as u32;
        let mdt = bits128(reg, 15, 8) as u16;
        let month = (mdt & 0x0f) as u8;
        let year = 1997 + (mdt >> 4);
        CidFields {
            manufacturer_id,
            oem_id,
            product_name,
            product_revision,
            product_serial,
            manufacturing_date: (year, month),
        }
    } else {
        // SD CID: MID[127:120] OID[119:104] PNM[103:64] PRV[63:56]
        // PSN[55:24] MDT[19:8].
        let oem_id = bits128(reg, 119, 104) as u16;
        let mut product_name = [0u8; 6];
        let pnm = bits128(reg, 103, 64) as u64;
        for i in 0..5 {
            product_name[i] = ((pnm >> ((4 - i) * 8)) & 0xff) as u8;
        }
        let product_revision = bits128(reg, 63, 56) as u8;
        let product_serial = bits128(reg, 55, 24) as u32;
        let year = 2000 + bits128(reg, 19, 12) as u16;
        let month = bits128(reg, 11, 8) as u8;
        CidFields {
            manufacturer_id,
            oem_id,
            product_name,
            product_revision,
            product_serial,
            manufacturing_date: (year, month),
        }
    }
}

/// Fold decoded CID fields into an (already capacity-populated) [`CardInfo`].
pub fn apply(info: &mut CardInfo, fields: CidFields) {
    info.manufacturer_id = fields.manufacturer_id;
    info.oem_id = fields.oem_id;
    info.product_name = fields.product_name;
    info.product_revision = fields.product_revision;
    info.product_serial = fields.product_serial;
    info.manufacturing_date = fields.manufacturing_date;
}

/// Refresh identity comparison key: manufacturer id, OEM id, and serial
/// number — deliberately excludes product name/revision/date, which some
/// cards vary across power cycles without actually changing.
pub fn identity_key(fields: &CidFields) -> (u8, u16, u32) {
    (fields.manufacturer_id, fields.oem_id, fields.product_serial)
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    fn sample_sd_cid() -> [u8; 16] {
        // MID=0x03 OID="SD" PNM="SU08G" PRV=0x10 PSN=0xDEADBEEF MDT: year 2020 (raw 0x14), month 7
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
        raw[9..13].copy_from_slice(&0xDEADBEEFu32.to_be_bytes());
        raw[13] = 0x01; // reserved(4) | year_high(4) -> 0b0000_0001
        raw[14] = 0x47; // year_low(4)=0x4, month(4)=0x7 -> bits19:12 = 0x14 = 20, month=7
        raw[15] = 0x01;
        raw
    }

    #[test]
    fn decodes_sd_identity_fields() {
        let fields = decode(&sample_sd_cid(), CardVariant::SdV2Hc);
        assert_eq!(fields.manufacturer_id, 0x03);
        assert_eq!(&fields.product_name[..5], b"SDSU0");
        assert_eq!(fields.product_revision, 0x10);
        assert_eq!(fields.product_serial, 0xDEADBEEF);
        assert_eq!(fields.manufacturing_date, (2020, 7));
    }

    #[test]
    fn refresh_key_ignores_cosmetic_fields() {
        let a = decode(&sample_sd_cid(), CardVariant::SdV2Hc);
        let mut other = sample_sd_cid();
        other[8] = 0x20; // different revision
        let b = decode(&other, CardVariant::SdV2Hc);
        assert_eq!(identity_key(&a), identity_key(&b));
    }
}
