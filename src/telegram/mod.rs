use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use crate::address::Address;

pub mod crc;
pub mod crypto;
pub mod dv;
pub mod vif;

pub use dv::{DVEntry, MeasurementType};

#[derive(Error, Debug, PartialEq)]
pub enum TelegramParseError {
    #[error("telegram too short, {0} bytes")]
    TooShort(usize),
    #[error("unknown c-field {0:#04x}")]
    UnknownCField(u8),
    #[error("length field {0} disagrees with frame size {1}")]
    BadLength(usize, usize),
}

/// Metadata the bus layer knows about a received frame.
#[derive(Debug, Clone)]
pub struct AboutTelegram {
    pub bus: String,
    pub rssi_dbm: i32,
    pub timestamp: DateTime<Utc>,
    pub simulated: bool,
}

impl AboutTelegram {
    pub fn new(bus: &str, rssi_dbm: i32) -> Self {
        AboutTelegram {
            bus: bus.to_string(),
            rssi_dbm,
            timestamp: Utc::now(),
            simulated: false,
        }
    }
}

/// Security modes from the tpl configuration word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    None,
    AesCbcIv,  // mode 5
    AesCbcKdf, // mode 7, needs a key derivation we do not implement
    AesCtr,    // ell security
    Unknown(u8),
}

#[derive(Debug, Clone)]
pub struct Tpl {
    pub ci: u8,
    pub address: Option<Address>,
    pub access_no: u8,
    pub status: u8,
    pub cfg: u16,
    pub security_mode: SecurityMode,
    pub encrypted_blocks: usize,
    pub synchronous: bool,
    pub accessibility: u8,
}

/// Extended link layer fields, present when ci is 0x8d.
#[derive(Debug, Clone)]
pub struct Ell {
    pub cc: u8,
    pub access_no: u8,
    pub session_number: u32,
}

const TPL_NO_HEADER: &[u8] = &[0x66, 0x69, 0x70, 0x71, 0x78, 0x79];
const TPL_SHORT_HEADER: &[u8] = &[0x67, 0x6e, 0x74, 0x7a, 0x7d, 0x7f, 0x9e, 0xc1, 0xc4];
const TPL_LONG_HEADER: &[u8] = &[0x68, 0x6f, 0x72, 0x75, 0x7c, 0x7e, 0x9f, 0xc2, 0xc5];

/// C-fields a meter may legitimately send. Everything else is rejected
/// unless a best effort parse was asked for.
pub fn is_valid_c_field(c: u8) -> bool {
    matches!(c, 0x44 | 0x46 | 0x48 | 0x08 | 0x18 | 0x28 | 0x38 | 0x2b)
}

/// One received and parsed telegram.
#[derive(Debug, Clone)]
pub struct Telegram {
    pub about: AboutTelegram,
    /// Frame with link layer crcs already stripped.
    pub raw: Vec<u8>,
    pub c_field: u8,
    pub dll_mfct: u16,
    pub dll_id: String,
    pub dll_version: u8,
    pub dll_media: u8,
    /// The eight dll address bytes as on the wire, for iv construction.
    pub dll_address_bytes: [u8; 8],
    pub ell: Option<Ell>,
    pub tpl: Option<Tpl>,
    /// Offset of the application layer within raw.
    pub header_size: usize,
    /// Decrypted application layer payload.
    pub payload: Vec<u8>,
    pub dv_entries: Vec<DVEntry>,
    /// Content following a dif 0x0F manufacturer data marker.
    pub mfct_data: Vec<u8>,
    /// Ci was in the manufacturer specific range, payload is proprietary.
    pub mfct_ci: bool,
    pub decryption_failed: bool,
    /// Parse gave up somewhere, raw is preserved and no fields were updated.
    pub bad: bool,
    /// Payload bytes a driver made sense of, for analyze scoring.
    pub understood: usize,
    /// Record offsets already counted into understood.
    pub understood_offsets: HashSet<usize>,
}

impl Telegram {
    /// Every address present in the frame: dll always, tpl when it carries
    /// a long header.
    pub fn addresses(&self) -> Vec<Address> {
        let mut r = vec![Address {
            id: self.dll_id.clone(),
            mfct: self.dll_mfct,
            version: self.dll_version,
            r#type: self.dll_media,
            mbus_primary: false,
        }];
        if let Some(tpl) = &self.tpl {
            if let Some(a) = &tpl.address {
                r.push(a.clone());
            }
        }
        r
    }

    pub fn find_entry(&self, key: &str) -> Option<&DVEntry> {
        self.dv_entries.iter().find(|e| e.key == key)
    }

    pub fn tpl_status(&self) -> u8 {
        self.tpl.as_ref().map(|t| t.status).unwrap_or(0)
    }

    /// Register manufacturer-hook bytes as understood, for analyze scoring.
    pub fn add_understood(&mut self, n: usize) {
        self.understood += n;
    }
}

fn decode_cfg(cfg: u16) -> (SecurityMode, usize, bool, u8) {
    let mode = ((cfg >> 8) & 0x1f) as u8;
    let blocks = ((cfg & 0xf0) >> 4) as usize;
    let synchronous = cfg & 0x2000 != 0;
    let accessibility = ((cfg >> 14) & 0x03) as u8;
    let security = match mode {
        0 => SecurityMode::None,
        5 => SecurityMode::AesCbcIv,
        7 => SecurityMode::AesCbcKdf,
        other => SecurityMode::Unknown(other),
    };
    (security, blocks, synchronous, accessibility)
}

/// Parse a frame whose link layer crcs are stripped. The meter key, when
/// one is bound, is used for decryption. Parse trouble never panics, it
/// produces a telegram with the bad flag set and the raw frame preserved.
pub fn parse(
    frame: &[u8],
    about: AboutTelegram,
    key: Option<&[u8]>,
    best_effort: bool,
) -> Result<Telegram, TelegramParseError> {
    if frame.len() < 11 {
        return Err(TelegramParseError::TooShort(frame.len()));
    }

    let len = frame[0] as usize;
    if len + 1 > frame.len() {
        return Err(TelegramParseError::BadLength(len, frame.len()));
    }

    let c_field = frame[1];
    if !is_valid_c_field(c_field) && !best_effort {
        return Err(TelegramParseError::UnknownCField(c_field));
    }

    let mut dll_address_bytes = [0u8; 8];
    dll_address_bytes.copy_from_slice(&frame[2..10]);
    let dll = Address::decode_mfct_first(&dll_address_bytes);

    let mut t = Telegram {
        about,
        raw: frame.to_vec(),
        c_field,
        dll_mfct: dll.mfct,
        dll_id: dll.id,
        dll_version: dll.version,
        dll_media: dll.r#type,
        dll_address_bytes,
        ell: None,
        tpl: None,
        header_size: 11,
        payload: Vec::new(),
        dv_entries: Vec::new(),
        mfct_data: Vec::new(),
        mfct_ci: false,
        decryption_failed: false,
        bad: false,
        understood: 0,
        understood_offsets: HashSet::new(),
    };

    /* The remaining layers may be nested behind an extended link layer,
       so work on a spliceable copy of the frame from the ci onwards. */
    let mut work = frame.to_vec();
    let mut pos = 10;
    let mut ci = work[pos];
    pos += 1;

    /* Extended link layer carries the aes-ctr session fields and a crc
       over the (possibly encrypted) inner payload. */
    if ci == 0x8d {
        if work.len() < pos + 6 {
            t.bad = true;
            return Ok(t);
        }
        let cc = work[pos];
        let access_no = work[pos + 1];
        let sn = u32::from_le_bytes([work[pos + 2], work[pos + 3], work[pos + 4], work[pos + 5]]);
        pos += 6;
        t.ell = Some(Ell { cc, access_no, session_number: sn });

        let mut rest = work[pos..].to_vec();
        if rest.len() < 3 {
            t.bad = true;
            return Ok(t);
        }
        if ell_payload_crc_ok(&rest) {
            /* Already plaintext, some collectors strip the encryption but
               keep the ell header intact. */
            rest.drain(..2);
        } else if let Some(k) = key {
            if crypto::decrypt_aes_ctr(&mut rest, k, &dll_address_bytes, cc, sn).is_err() {
                t.decryption_failed = true;
                t.bad = true;
                return Ok(t);
            }
            if !ell_payload_crc_ok(&rest) {
                debug!("ell payload crc mismatch, probably a bad key");
                t.decryption_failed = true;
                t.bad = true;
                return Ok(t);
            }
            rest.drain(..2);
        } else {
            t.decryption_failed = true;
            t.bad = true;
            return Ok(t);
        }

        if rest.is_empty() {
            t.bad = true;
            return Ok(t);
        }
        /* Continue with the inner ci. */
        work = rest;
        pos = 0;
        ci = work[pos];
        pos += 1;
    }

    /* Manufacturer specific ci, the application layer is proprietary and
       a driver hook has to make sense of it. */
    if (0xa0..=0xb7).contains(&ci) {
        t.mfct_ci = true;
        t.header_size = pos;
        t.payload = work[pos..].to_vec();
        return Ok(t);
    }

    if TPL_SHORT_HEADER.contains(&ci) || TPL_LONG_HEADER.contains(&ci) {
        let long = TPL_LONG_HEADER.contains(&ci);
        let mut tpl_address = None;
        let mut tpl_address_bytes = [0u8; 8];
        if long {
            if work.len() < pos + 12 {
                t.bad = true;
                return Ok(t);
            }
            tpl_address_bytes.copy_from_slice(&work[pos..pos + 8]);
            tpl_address = Some(Address::decode_id_first(&tpl_address_bytes));
            pos += 8;
        } else if work.len() < pos + 4 {
            t.bad = true;
            return Ok(t);
        }

        let access_no = work[pos];
        let status = work[pos + 1];
        let cfg = (work[pos + 3] as u16) << 8 | work[pos + 2] as u16;
        pos += 4;
        let encrypted_from = pos;

        let (security_mode, encrypted_blocks, synchronous, accessibility) = decode_cfg(cfg);
        t.tpl = Some(Tpl {
            ci,
            address: tpl_address,
            access_no,
            status,
            cfg,
            security_mode,
            encrypted_blocks,
            synchronous,
            accessibility,
        });

        let mut body = work[encrypted_from..].to_vec();
        match security_mode {
            /* Some collectors strip the encryption before forwarding but
               leave the config word untouched. If the body already starts
               with the decrypt marker, take it as plaintext. */
            SecurityMode::AesCbcIv if body.len() >= 2 && body[0] == 0x2f && body[1] == 0x2f && key.is_none() => {}
            SecurityMode::AesCbcIv => {
                match key {
                    Some(k) if k.len() == 16 => {
                        /* The iv always binds the dll address bytes, also
                           when a long header repeats the address. */
                        if let Err(e) = crypto::decrypt_aes_cbc_iv(
                            &mut body,
                            k,
                            &dll_address_bytes,
                            access_no,
                            encrypted_blocks,
                        ) {
                            warn!("({}) decryption failed: {e}", t.about.bus);
                            t.decryption_failed = true;
                            t.bad = true;
                            return Ok(t);
                        }
                    }
                    _ => {
                        debug!("telegram from {} is encrypted but no key is bound", t.dll_id);
                        t.decryption_failed = true;
                        t.bad = true;
                        return Ok(t);
                    }
                }
            }
            SecurityMode::AesCbcKdf | SecurityMode::Unknown(_) => {
                warn!("({}) unsupported security mode {:?}", t.about.bus, security_mode);
                t.decryption_failed = true;
                t.bad = true;
                return Ok(t);
            }
            SecurityMode::None | SecurityMode::AesCtr => {}
        }

        t.header_size = encrypted_from;
        finish_apl(&mut t, body);
        return Ok(t);
    }

    if TPL_NO_HEADER.contains(&ci) {
        t.header_size = pos;
        let body = work[pos..].to_vec();
        finish_apl(&mut t, body);
        return Ok(t);
    }

    debug!("unhandled ci field {ci:02x} from {}", t.dll_id);
    t.bad = true;
    Ok(t)
}

/// Crc over the inner ell payload, stored little endian ahead of it.
fn ell_payload_crc_ok(rest: &[u8]) -> bool {
    if rest.len() < 3 {
        return false;
    }
    let mut state = crc16::State::<crc16::EN_13757>::new();
    state.update(&rest[2..]);
    state.get() == u16::from_le_bytes([rest[0], rest[1]])
}

fn finish_apl(t: &mut Telegram, body: Vec<u8>) {
    let walk = dv::walk(&body);
    t.dv_entries = walk.entries;
    if let Some(off) = walk.mfct_data_offset {
        t.mfct_data = body[off..].to_vec();
    }
    t.payload = body;
}

/// Spell out the dll media byte the way the json output wants it.
pub fn media_name(media: u8) -> &'static str {
    match media {
        0x00 => "other",
        0x01 => "oil",
        0x02 => "electricity",
        0x03 => "gas",
        0x04 => "heat",
        0x05 => "steam",
        0x06 => "warm water",
        0x07 => "water",
        0x08 => "heat cost allocation",
        0x09 => "compressed air",
        0x0a => "cooling load volume at outlet",
        0x0b => "cooling load volume at inlet",
        0x0c => "heat volume at inlet",
        0x0d => "heat and cooling load",
        0x0e => "bus and system component",
        0x15 => "hot water",
        0x16 => "cold water",
        0x17 => "hybrid water",
        0x18 => "pressure",
        0x19 => "analog to digital converter",
        0x1a => "smoke detector",
        0x1b => "room sensor",
        0x1c => "gas detector",
        0x20 => "breaker",
        0x21 => "valve",
        0x25 => "customer unit display",
        0x28 => "waste water",
        0x29 => "garbage",
        0x31 => "communication controller",
        0x32 => "unidirectional repeater",
        0x33 => "bidirectional repeater",
        0x36 => "radio converter system side",
        0x37 => "radio converter meter side",
        _ => "unknown",
    }
}

/// Standard tpl status byte bits. Bits 5 to 7 are manufacturer specific
/// and handled by the driver's own bit table.
pub fn decode_tpl_status_standard_bits(status: u8) -> Vec<String> {
    let mut r = Vec::new();
    match status & 0x03 {
        0x01 => r.push("BUSY".to_string()),
        0x02 => r.push("ERROR".to_string()),
        0x03 => r.push("ALARM".to_string()),
        _ => {}
    }
    if status & 0x04 != 0 {
        r.push("POWER_LOW".to_string());
    }
    if status & 0x08 != 0 {
        r.push("PERMANENT_ERROR".to_string());
    }
    if status & 0x10 != 0 {
        r.push("TEMPORARY_ERROR".to_string());
    }
    r
}

#[cfg(test)]
mod tests {
    use super::*;

    fn about() -> AboutTelegram {
        AboutTelegram::new("test", -77)
    }

    #[test]
    fn parses_dll_fields() {
        /* Kamstrup multical603, no encryption. */
        let frame = hex::decode(
            "42442D2C3636363635048D20E18025B62087D0780406A500000004FF072B01000004FF089C000000041421020000043B120000000259D014025D000904FF2200000000",
        ).unwrap();
        let t = parse(&frame, about(), None, false).unwrap();
        assert_eq!(t.dll_id, "36363636");
        assert_eq!(t.dll_mfct, 0x2c2d);
        assert_eq!(t.dll_version, 0x35);
        assert_eq!(t.dll_media, 0x04);
        assert!(!t.bad);
        assert!(t.find_entry("0406").is_some());
        assert!(t.find_entry("04FF22").is_some());
    }

    #[test]
    fn dll_fields_are_driver_independent() {
        let frame = hex::decode(
            "374493444836351218067AC70000200C13911900004C1391170000426CBF2CCC081391170000C2086CBF2C02BB560000326CFFFF046D1E02DE21FED0",
        ).unwrap();
        let t = parse(&frame, about(), None, false).unwrap();
        assert_eq!(t.dll_id, "12353648");
        assert_eq!(t.dll_media, 0x06);
        assert_eq!(t.dll_version, 0x18);
        let tpl = t.tpl.as_ref().unwrap();
        assert_eq!(tpl.access_no, 0xc7);
        assert_eq!(tpl.security_mode, SecurityMode::None);
    }

    #[test]
    fn unknown_c_field_rejected_unless_best_effort() {
        let mut frame = hex::decode(
            "374493444836351218067AC70000200C13911900004C1391170000426CBF2CCC081391170000C2086CBF2C02BB560000326CFFFF046D1E02DE21FED0",
        ).unwrap();
        frame[1] = 0x99;
        assert_eq!(
            parse(&frame, about(), None, false).unwrap_err(),
            TelegramParseError::UnknownCField(0x99)
        );
        assert!(parse(&frame, about(), None, true).is_ok());
    }

    #[test]
    fn encrypted_without_key_is_flagged_not_fatal() {
        let frame = hex::decode(
            "3944FA122162092002067A3600202567C94D48D00DC47B11213E23383DB51968A705AAFA60C60E263D50CD259D7C9A03FD0C08000002FD0B0011",
        ).unwrap();
        let t = parse(&frame, about(), None, false).unwrap();
        assert!(t.bad);
        assert!(t.decryption_failed);
        assert_eq!(t.raw.len(), frame.len());
    }

    #[test]
    fn mode5_decrypt_succeeds_with_key() {
        let frame = hex::decode(
            "3944FA122162092002067A3600202567C94D48D00DC47B11213E23383DB51968A705AAFA60C60E263D50CD259D7C9A03FD0C08000002FD0B0011",
        ).unwrap();
        let key = hex::decode("BEDB81B52C29B5C143388CBB0D15A051").unwrap();
        let t = parse(&frame, about(), Some(&key), false).unwrap();
        assert!(!t.bad, "decryption should succeed with the right key");
        assert_eq!(&t.payload[..2], &[0x2f, 0x2f]);
        /* The unencrypted tail is concatenated after the decrypted body. */
        assert!(t.find_entry("03FD0C").is_some());
        assert!(t.find_entry("046D").is_some());
    }

    #[test]
    fn mfct_ci_keeps_payload_for_driver_hook() {
        let frame = hex::decode("1944304C72242421D401A2013D4013DD8B46A4999C1293E582CC").unwrap();
        let t = parse(&frame, about(), None, false).unwrap();
        assert!(t.mfct_ci);
        assert!(!t.bad);
        assert_eq!(t.payload.len(), frame.len() - 11);
    }

    #[test]
    fn tpl_status_bits() {
        assert!(decode_tpl_status_standard_bits(0x00).is_empty());
        assert_eq!(decode_tpl_status_standard_bits(0x04), vec!["POWER_LOW"]);
        assert_eq!(
            decode_tpl_status_standard_bits(0x0c),
            vec!["POWER_LOW", "PERMANENT_ERROR"]
        );
    }
}
