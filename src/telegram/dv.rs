use super::vif::{VIF_FB, VIF_FD};
use log::debug;

/// Plain text vifs (0x7C) carry their unit as an ascii string.
pub const VIF_PLAIN_TEXT: u16 = 0x300;

/// The function field of the dif, bits 4 and 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementType {
    Any,
    Instantaneous,
    Maximum,
    Minimum,
    AtError,
}

impl MeasurementType {
    fn from_dif(dif: u8) -> MeasurementType {
        match (dif >> 4) & 0x03 {
            0 => MeasurementType::Instantaneous,
            1 => MeasurementType::Maximum,
            2 => MeasurementType::Minimum,
            _ => MeasurementType::AtError,
        }
    }

    pub fn matches(&self, other: MeasurementType) -> bool {
        *self == MeasurementType::Any || *self == other
    }
}

/// One data record from the application layer: the dif/vif chain fully
/// decoded plus the raw value bytes.
#[derive(Debug, Clone)]
pub struct DVEntry {
    /// Byte offset of the dif within the payload.
    pub offset: usize,
    /// Uppercase hex of dif + difes + vif + vifes, the dv_entries map key.
    pub key: String,
    pub measurement_type: MeasurementType,
    pub storage_nr: u32,
    pub tariff_nr: u32,
    pub subunit_nr: u32,
    /// Normalised vif value (plain, 0x100|FD, 0x200|FB).
    pub vif: u16,
    /// Combinable vifes in order, 0x7C-extended ones as 0x7C00|code.
    pub combinables: Vec<u16>,
    /// Data length code, low nibble of the dif.
    pub dif_lo: u8,
    /// Value bytes exactly as on the wire.
    pub raw: Vec<u8>,
    /// Header plus value length, for decode scoring.
    pub total_len: usize,
}

/// Result of walking one application layer payload.
#[derive(Debug, Default)]
pub struct DvWalk {
    pub entries: Vec<DVEntry>,
    /// Offset of a manufacturer specific data block (dif 0x0F/0x1F), if any.
    pub mfct_data_offset: Option<usize>,
    /// Bytes consumed by well-formed records, for analyze scoring.
    pub consumed: usize,
}

fn value_len(dif_lo: u8, payload: &[u8], pos: usize) -> Option<usize> {
    match dif_lo {
        0x0 | 0x8 => Some(0),
        0x1 | 0x9 => Some(1),
        0x2 | 0xa => Some(2),
        0x3 | 0xb => Some(3),
        0x4 | 0x5 | 0xc => Some(4),
        0x6 | 0xe => Some(6),
        0x7 => Some(8),
        0xd => {
            /* Variable length, an lvar byte precedes the data. */
            let lvar = *payload.get(pos)? as usize;
            let n = match lvar {
                0x00..=0xbf => lvar,
                0xc0..=0xc9 => lvar - 0xc0,
                0xd0..=0xd9 => lvar - 0xd0,
                0xe0..=0xef => lvar - 0xe0,
                _ => return None,
            };
            Some(1 + n)
        }
        _ => None, // 0xF special function, handled by the walker.
    }
}

/// Walk the payload, producing one DVEntry per record. Filler bytes 0x2F
/// are skipped silently. A dif of 0x0F or 0x1F starts a manufacturer
/// specific block which ends the regular record stream.
pub fn walk(payload: &[u8]) -> DvWalk {
    let mut out = DvWalk::default();
    let mut pos = 0;

    while pos < payload.len() {
        let start = pos;
        let dif = payload[pos];

        if dif == 0x2f {
            pos += 1;
            out.consumed += 1;
            continue;
        }
        if dif == 0x0f || dif == 0x1f {
            /* Manufacturer specific data reaches to the end of the payload. */
            out.mfct_data_offset = Some(pos + 1);
            out.consumed += 1;
            break;
        }

        pos += 1;
        let dif_lo = dif & 0x0f;
        let mtype = MeasurementType::from_dif(dif);
        let mut storage_nr = ((dif >> 6) & 0x01) as u32;
        let mut tariff_nr = 0u32;
        let mut subunit_nr = 0u32;
        let mut key_bytes = vec![dif];

        /* Difes extend storage, tariff and subunit numbers. */
        let mut ext = dif & 0x80 != 0;
        let mut dife_count = 0;
        while ext {
            let Some(&dife) = payload.get(pos) else { return out };
            pos += 1;
            key_bytes.push(dife);
            storage_nr |= ((dife & 0x0f) as u32) << (1 + 4 * dife_count);
            tariff_nr |= (((dife >> 4) & 0x03) as u32) << (2 * dife_count);
            subunit_nr |= (((dife >> 6) & 0x01) as u32) << dife_count;
            dife_count += 1;
            ext = dife & 0x80 != 0;
        }

        /* Vif, possibly escaping into an extension table or plain text. */
        let Some(&vif_byte) = payload.get(pos) else { return out };
        pos += 1;
        key_bytes.push(vif_byte);

        let vif;
        let mut vif_ext = vif_byte & 0x80 != 0;
        match vif_byte & 0x7f {
            0x7d if vif_ext => {
                // 0xFD, second extension table.
                let Some(&b) = payload.get(pos) else { return out };
                pos += 1;
                key_bytes.push(b);
                vif = VIF_FD | (b & 0x7f) as u16;
                vif_ext = b & 0x80 != 0;
            }
            0x7b if vif_ext => {
                // 0xFB, first extension table.
                let Some(&b) = payload.get(pos) else { return out };
                pos += 1;
                key_bytes.push(b);
                vif = VIF_FB | (b & 0x7f) as u16;
                vif_ext = b & 0x80 != 0;
            }
            0x7c => {
                /* Plain text vif, ascii unit stored in reverse order. */
                let Some(&len) = payload.get(pos) else { return out };
                pos += 1;
                key_bytes.push(len);
                let len = len as usize;
                if pos + len > payload.len() {
                    return out;
                }
                key_bytes.extend_from_slice(&payload[pos..pos + len]);
                pos += len;
                vif = VIF_PLAIN_TEXT;
            }
            _ => {
                vif = (vif_byte & 0x7f) as u16;
            }
        }

        let mut combinables = Vec::new();
        while vif_ext {
            let Some(&vife) = payload.get(pos) else { return out };
            pos += 1;
            key_bytes.push(vife);
            vif_ext = vife & 0x80 != 0;
            let mut value = (vife & 0x7f) as u16;
            if value == 0x7c {
                /* Combinable extension, the adjective is in the next byte. */
                let Some(&b) = payload.get(pos) else { return out };
                pos += 1;
                key_bytes.push(b);
                vif_ext = b & 0x80 != 0;
                value = 0x7c00 | (b & 0x7f) as u16;
            }
            combinables.push(value);
        }

        /* Some meters put the manufacturer block behind a mfct vif with a
           variable length dif, that stays a normal record. */
        let Some(vlen) = value_len(dif_lo, payload, pos) else {
            debug!("dv walk stops at {pos}, dif {dif:02x} with unknown length code");
            break;
        };
        if pos + vlen > payload.len() {
            debug!("dv walk stops, record at {start} is truncated");
            break;
        }

        let raw = if dif_lo == 0xd {
            payload[pos + 1..pos + vlen].to_vec()
        } else {
            payload[pos..pos + vlen].to_vec()
        };
        pos += vlen;

        let key: String = key_bytes.iter().map(|b| format!("{b:02X}")).collect();
        out.consumed += pos - start;
        out.entries.push(DVEntry {
            offset: start,
            key,
            measurement_type: mtype,
            storage_nr,
            tariff_nr,
            subunit_nr,
            vif,
            combinables,
            dif_lo,
            raw,
            total_len: pos - start,
        });
    }

    out
}

impl DVEntry {
    /// Interpret the raw bytes as a number according to the length code.
    pub fn as_f64(&self, signed: bool) -> Option<f64> {
        match self.dif_lo {
            0x1..=0x4 | 0x6 | 0x7 => {
                let mut v: u64 = 0;
                for (i, b) in self.raw.iter().enumerate() {
                    v |= (*b as u64) << (8 * i);
                }
                let bits = self.raw.len() * 8;
                if signed && bits < 64 && v & (1 << (bits - 1)) != 0 {
                    let signed_v = v as i64 - (1i64 << bits);
                    return Some(signed_v as f64);
                }
                Some(v as f64)
            }
            0x5 => {
                let b: [u8; 4] = self.raw.as_slice().try_into().ok()?;
                Some(f32::from_le_bytes(b) as f64)
            }
            0x9..=0xc | 0xe => self.bcd_value(),
            _ => None,
        }
    }

    fn bcd_value(&self) -> Option<f64> {
        let mut result: u64 = 0;
        let mut negative = false;
        for (i, b) in self.raw.iter().enumerate().rev() {
            let mut high = (b >> 4) & 0x0f;
            let low = b & 0x0f;
            /* A leading F nibble marks a negative bcd number. */
            if i == self.raw.len() - 1 && high == 0xf {
                negative = true;
                high = 0;
            }
            if high > 9 || low > 9 {
                return None;
            }
            result = result * 100 + (high * 10 + low) as u64;
        }
        let v = result as f64;
        Some(if negative { -v } else { v })
    }

    /// Hex string of the raw bytes printed most significant byte first,
    /// the way model/version and parameter set fields are shown.
    pub fn as_hex_string(&self) -> String {
        self.raw.iter().rev().map(|b| format!("{b:02x}")).collect()
    }

    /// Readable string content, wire order is reversed.
    pub fn as_text(&self) -> String {
        let rev: Vec<u8> = self.raw.iter().rev().cloned().collect();
        String::from_utf8(rev).unwrap_or_else(|_| self.as_hex_string())
    }

    /// Calendar fields (year, month, day, hour, min, sec) for the date and
    /// datetime encodings: type G (2 bytes), F (4 bytes), I (6 bytes).
    pub fn date_parts(&self) -> Option<(i32, u32, u32, u32, u32, u32)> {
        datetime_parts(&self.raw)
    }

    /// Render as "yyyy-mm-dd", "yyyy-mm-dd hh:mm" or with seconds,
    /// depending on the encoding the meter chose.
    pub fn as_date_string(&self) -> Option<String> {
        let (y, mo, d, h, mi, s) = self.date_parts()?;
        Some(match self.raw.len() {
            2 => format!("{y:04}-{mo:02}-{d:02}"),
            4 => format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}"),
            _ => format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}"),
        })
    }

    /// Unix timestamp for calculated fields, the naive meter time taken as utc.
    pub fn as_unix_ts(&self) -> Option<i64> {
        use chrono::{NaiveDate, NaiveDateTime};
        let (y, mo, d, h, mi, s) = self.date_parts()?;
        let date = NaiveDate::from_ymd_opt(y, mo, d)?;
        let dt: NaiveDateTime = date.and_hms_opt(h, mi, s)?;
        Some(dt.and_utc().timestamp())
    }
}

/// Shared date decoding, also used by drivers that carry dates inside
/// proprietary blocks.
pub fn datetime_parts(raw: &[u8]) -> Option<(i32, u32, u32, u32, u32, u32)> {
    let (mut year, mut month, day, hour, min, sec) = match raw.len() {
        2 => {
            let day = (raw[0] & 0x1f) as u32;
            let month = (raw[1] & 0x0f) as u32;
            let year = (((raw[0] & 0xe0) >> 5) | ((raw[1] & 0xf0) >> 1)) as i32;
            (year, month, day, 0, 0, 0)
        }
        4 => {
            let min = (raw[0] & 0x3f) as u32;
            let hour = (raw[1] & 0x1f) as u32;
            let day = (raw[2] & 0x1f) as u32;
            let month = (raw[3] & 0x0f) as u32;
            let year = (((raw[2] & 0xe0) >> 5) | ((raw[3] & 0xf0) >> 1)) as i32;
            (year, month, day, hour, min, 0)
        }
        6 => {
            let sec = (raw[0] & 0x3f) as u32;
            let min = (raw[1] & 0x3f) as u32;
            let hour = (raw[2] & 0x1f) as u32;
            let day = (raw[3] & 0x1f) as u32;
            let month = (raw[4] & 0x0f) as u32;
            let year = (((raw[3] & 0xe0) >> 5) | ((raw[4] & 0xf0) >> 1)) as i32;
            (year, month, day, hour, min, sec)
        }
        _ => return None,
    };

    year += if year > 80 { 1900 } else { 2000 };
    /* The all-ones error date overflows the month, roll it over. */
    while month > 12 {
        month -= 12;
        year += 1;
    }
    Some((year, month, day, hour, min, sec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::vif::{VifRange, VIF_FD};

    #[test]
    fn walks_plain_records() {
        /* 04 06 A5000000: 32 bit instantaneous energy, 165 kwh. */
        let payload = hex::decode("0406A5000000").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries.len(), 1);
        let e = &walk.entries[0];
        assert_eq!(e.key, "0406");
        assert_eq!(e.measurement_type, MeasurementType::Instantaneous);
        assert_eq!(e.storage_nr, 0);
        assert!(VifRange::AnyEnergyVIF.contains(e.vif));
        assert_eq!(e.as_f64(false), Some(165.0));
    }

    #[test]
    fn dife_unpacks_storage_tariff_subunit() {
        /* 84 40 FF2C + 4 bytes: dife 0x40 sets subunit 1. */
        let payload = hex::decode("8440FF2C000F1100").unwrap();
        let walk1 = walk(&payload);
        let e = &walk1.entries[0];
        assert_eq!(e.key, "8440FF2C");
        assert_eq!(e.subunit_nr, 1);
        assert_eq!(e.storage_nr, 0);
        /* 82 50: subunit 1 and tariff 1. */
        let payload = hex::decode("82506C0101").unwrap();
        let walk2 = walk(&payload);
        let e = &walk2.entries[0];
        assert_eq!(e.subunit_nr, 1);
        assert_eq!(e.tariff_nr, 1);
        assert_eq!(e.as_date_string().unwrap(), "2000-01-01");
    }

    #[test]
    fn storage_from_dif_and_dife() {
        /* 4C 13: dif bit 6 makes storage 1. */
        let payload = hex::decode("4C1391170000").unwrap();
        let walk1 = walk(&payload);
        assert_eq!(walk1.entries[0].storage_nr, 1);
        /* CC 08 13: dife 0x08 gives storage 17. */
        let payload = hex::decode("CC08131234567842").unwrap();
        let walk2 = walk(&payload);
        assert_eq!(walk2.entries[0].storage_nr, 17);
    }

    #[test]
    fn fd_extension_and_combinables() {
        /* 02 FD 17 0000: error flags. */
        let payload = hex::decode("02FD170000").unwrap();
        let walk1 = walk(&payload);
        assert_eq!(walk1.entries[0].vif, VIF_FD + 0x17);

        /* 0A FD C9 FC 01 3602: voltage at phase 1 as bcd. */
        let payload = hex::decode("0AFDC9FC013602").unwrap();
        let walk2 = walk(&payload);
        let e = &walk2.entries[0];
        assert_eq!(e.vif, VIF_FD + 0x49);
        assert_eq!(e.combinables, vec![0x7c01]);
        assert_eq!(e.as_f64(false), Some(236.0));
    }

    #[test]
    fn filler_bytes_do_not_change_entries() {
        let plain = hex::decode("0406A50000000259D014").unwrap();
        let padded = hex::decode("2F2F0406A50000002F0259D0142F2F").unwrap();
        let a = walk(&plain);
        let b = walk(&padded);
        assert_eq!(a.entries.len(), b.entries.len());
        for (x, y) in a.entries.iter().zip(b.entries.iter()) {
            assert_eq!(x.key, y.key);
            assert_eq!(x.raw, y.raw);
        }
    }

    #[test]
    fn variable_length_blob() {
        /* 0D FF 5F, lvar 0x04, four content bytes. */
        let payload = hex::decode("0DFF5F04DEADBEEF").unwrap();
        let walk = walk(&payload);
        let e = &walk.entries[0];
        assert_eq!(e.key, "0DFF5F");
        assert_eq!(e.raw, vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn mfct_block_ends_walk() {
        let payload = hex::decode("0406A50000000F0102030405").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries.len(), 1);
        assert_eq!(walk.mfct_data_offset, Some(7));
    }

    #[test]
    fn bcd_values() {
        let payload = hex::decode("0C1391190000").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries[0].as_f64(false), Some(1991.0));
    }

    #[test]
    fn signed_integers() {
        let payload = hex::decode("02BB56FEFF").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries[0].as_f64(true), Some(-2.0));
        assert_eq!(walk.entries[0].combinables, vec![0x56]);
    }

    #[test]
    fn type_f_datetime() {
        let payload = hex::decode("046D282A9E27").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries[0].as_date_string().unwrap(), "2020-07-30 10:40");
    }

    #[test]
    fn error_date_rolls_over() {
        let payload = hex::decode("326CFFFF").unwrap();
        let walk = walk(&payload);
        let e = &walk.entries[0];
        assert_eq!(e.measurement_type, MeasurementType::AtError);
        assert_eq!(e.as_date_string().unwrap(), "2128-03-31");
    }

    #[test]
    fn keys_are_unique_per_walk() {
        let payload = hex::decode("0C13911900004C1391170000426CBF2C").unwrap();
        let walk = walk(&payload);
        let mut keys: Vec<&str> = walk.entries.iter().map(|e| e.key.as_str()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), walk.entries.len());
    }

    #[test]
    fn hex_and_text_strings_reverse_wire_order() {
        let payload = hex::decode("03FD0C080000").unwrap();
        let walk = walk(&payload);
        assert_eq!(walk.entries[0].as_hex_string(), "000008");
    }
}
