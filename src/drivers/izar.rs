use log::{debug, warn};

use super::{props, DriverInfo, FieldInfo, MeterType};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::meters::Meter;
use crate::telegram::Telegram;
use crate::units::{Quantity, Unit};

/* The two Diehl factory defaults used when no key is configured. */
const PRIOS_DEFAULT_KEY1: &str = "39BC8A10E66D83F8";
const PRIOS_DEFAULT_KEY2: &str = "51728910E66D83F8";

pub fn driver() -> DriverInfo {
    let hyd = pack_mfct(b'H', b'Y', b'D');
    let sap = pack_mfct(b'S', b'A', b'P');
    let dme = pack_mfct(b'D', b'M', b'E');
    DriverInfo::new("izar", MeterType::WaterMeter)
        .default_fields("name,id,prefix,serial_number,total_m3,last_month_total_m3,last_month_measure_date,remaining_battery_life_y,current_alarms,previous_alarms,transmit_period_s,manufacture_year,timestamp")
        .link_mode(LinkMode::T1)
        .detect(hyd, 0x07, 0x85)
        .detect(sap, 0x15, -1)
        .detect(sap, 0x04, -1)
        .detect(sap, 0x07, 0x00)
        .detect(dme, 0x07, 0x78)
        .detect(dme, 0x06, 0x78)
        .detect(hyd, 0x07, 0x86)
        .process_content(process_content)
        .field(FieldInfo::string_plain(
            "prefix",
            "The alphanumeric prefix printed before serial number on device.",
            props::DEFAULT,
        ))
        .field(FieldInfo::string_plain(
            "serial_number",
            "The meter serial number.",
            props::DEFAULT,
        ))
        .field(FieldInfo::numeric_hook(
            "total",
            "The total water consumption recorded by this meter.",
            props::DEFAULT,
            Quantity::Volume,
        ))
        .field(FieldInfo::numeric_hook(
            "last_month_total",
            "The total water consumption recorded by this meter around end of last month.",
            props::DEFAULT,
            Quantity::Volume,
        ))
        .field(FieldInfo::string_plain(
            "last_month_measure_date",
            "The date when the meter recorded the most recent billing value.",
            props::DEFAULT,
        ))
        .field(FieldInfo::numeric_hook(
            "remaining_battery_life",
            "How many more years the battery is expected to last.",
            props::DEFAULT,
            Quantity::Time,
        ).with_unit(Unit::Year))
        .field(FieldInfo::string_plain(
            "current_alarms",
            "Alarms currently reported by the meter.",
            props::DEFAULT,
        ))
        .field(FieldInfo::string_plain(
            "previous_alarms",
            "Alarms previously reported by the meter.",
            props::DEFAULT,
        ))
        .field(FieldInfo::numeric_hook(
            "transmit_period",
            "The period at which the meter transmits its data.",
            props::DEFAULT,
            Quantity::Time,
        ).with_unit(Unit::Second))
        .field(FieldInfo::string_plain(
            "manufacture_year",
            "The year during which the meter was manufactured.",
            props::DEFAULT,
        ))
}

fn u32_be(b: &[u8], offset: usize) -> u32 {
    (b[offset] as u32) << 24 | (b[offset + 1] as u32) << 16 | (b[offset + 2] as u32) << 8 | b[offset + 3] as u32
}

fn convert_key(bytes: &[u8]) -> u32 {
    u32_be(bytes, 0) ^ u32_be(bytes, 4)
}

fn prios_keys(confidentiality_key: &Option<Vec<u8>>) -> Vec<u32> {
    let mut keys = Vec::new();
    if let Some(k) = confidentiality_key {
        if k.len() >= 8 {
            keys.push(convert_key(k));
        }
    }
    if keys.is_empty() {
        keys.push(convert_key(&hex::decode(PRIOS_DEFAULT_KEY1).unwrap()));
        keys.push(convert_key(&hex::decode(PRIOS_DEFAULT_KEY2).unwrap()));
    }
    keys
}

/// The PRIOS payload is whitened with a 32 bit lfsr seeded from the key
/// xored with the frame header. The first decoded byte must read 0x4B.
fn decode_prios(frame: &[u8], key: u32) -> Vec<u8> {
    if frame.len() < 16 {
        return Vec::new();
    }
    let mut key = key ^ u32_be(frame, 2) ^ u32_be(frame, 6) ^ u32_be(frame, 10);
    let mut out = Vec::with_capacity(frame.len() - 15);
    for i in 15..frame.len() {
        for _ in 0..8 {
            let bit = ((key >> 1) & 1) ^ ((key >> 2) & 1) ^ ((key >> 11) & 1) ^ ((key >> 31) & 1);
            key = (key << 1) | bit;
        }
        let decoded = frame[i] ^ (key & 0xff) as u8;
        if i == 15 && decoded != 0x4b {
            return Vec::new();
        }
        out.push(decoded);
    }
    out
}

struct Alarms {
    general: bool,
    leakage_currently: bool,
    leakage_previously: bool,
    meter_blocked: bool,
    back_flow: bool,
    underflow: bool,
    overflow: bool,
    submarine: bool,
    sensor_fraud_currently: bool,
    sensor_fraud_previously: bool,
    mechanical_fraud_currently: bool,
    mechanical_fraud_previously: bool,
}

fn current_alarms_text(a: &Alarms) -> String {
    let mut s = Vec::new();
    if a.leakage_currently {
        s.push("leakage");
    }
    if a.meter_blocked {
        s.push("meter_blocked");
    }
    if a.back_flow {
        s.push("back_flow");
    }
    if a.underflow {
        s.push("underflow");
    }
    if a.overflow {
        s.push("overflow");
    }
    if a.submarine {
        s.push("submarine");
    }
    if a.sensor_fraud_currently {
        s.push("sensor_fraud");
    }
    if a.mechanical_fraud_currently {
        s.push("mechanical_fraud");
    }
    if !s.is_empty() {
        if a.general {
            return "general_alarm".to_string();
        }
        return s.join(",");
    }
    "no_alarm".to_string()
}

fn previous_alarms_text(a: &Alarms) -> String {
    let mut s = Vec::new();
    if a.leakage_previously {
        s.push("leakage");
    }
    if a.sensor_fraud_previously {
        s.push("sensor_fraud");
    }
    if a.mechanical_fraud_previously {
        s.push("mechanical_fraud");
    }
    if s.is_empty() {
        "no_alarm".to_string()
    } else {
        s.join(",")
    }
}

fn process_content(meter: &mut Meter, t: &mut Telegram) {
    let frame = t.raw.clone();

    let mut decoded = Vec::new();
    for key in prios_keys(&meter.key) {
        decoded = decode_prios(&frame, key);
        if !decoded.is_empty() {
            break;
        }
    }

    debug!("(izar) decoded prios data: {}", hex::encode(&decoded));

    if decoded.is_empty() {
        warn!("(izar) decoding prios data failed, ignoring telegram");
        return;
    }

    /* Sappel frames encode the serial number and letter prefix in the
       address bytes themselves. */
    if t.dll_mfct == pack_mfct(b'S', b'A', b'P') {
        let digits = ((frame[7] as u32 & 0x03) << 24
            | (frame[6] as u32) << 16
            | (frame[5] as u32) << 8
            | frame[4] as u32)
            .to_string();
        if digits.len() > 2 {
            let yy: u32 = digits[..2].parse().unwrap_or(0);
            let manufacture_year = if yy > 70 { 1900 + yy } else { 2000 + yy };
            meter.set_string_value("manufacture_year", &format!("{manufacture_year}"));

            let serial: u32 = digits[2..].parse().unwrap_or(0);
            meter.set_string_value("serial_number", &format!("{serial:06}"));

            let supplier_code = (b'@' + (((frame[9] & 0x0f) << 1) | (frame[8] >> 7))) as char;
            let meter_type = (b'@' + ((frame[8] & 0x7c) >> 2)) as char;
            let diameter = (b'@' + (((frame[8] & 0x03) << 3) | (frame[7] >> 5))) as char;
            meter.set_string_value("prefix", &format!("{supplier_code}{yy:02}{meter_type}{diameter}"));
        }
    }

    let remaining_battery_life = (frame[12] & 0x1f) as f64 / 2.0;
    meter.set_numeric_value("remaining_battery_life", Unit::Year, remaining_battery_life);

    let transmit_period_s = 1u32 << ((frame[11] & 0x0f) + 2);
    meter.set_numeric_value("transmit_period", Unit::Second, transmit_period_s as f64);

    let total_l = u32::from_le_bytes([decoded[1], decoded[2], decoded[3], decoded[4]]);
    meter.set_numeric_value("total", Unit::M3, total_l as f64 / 1000.0);

    if decoded.len() > 8 {
        let last_month_l = u32::from_le_bytes([decoded[5], decoded[6], decoded[7], decoded[8]]);
        meter.set_numeric_value("last_month_total", Unit::M3, last_month_l as f64 / 1000.0);
    }

    if decoded.len() > 10 {
        let mut year =
            (((decoded[10] & 0xf0) as u16) >> 1) + (((decoded[9] & 0xe0) as u16) >> 5);
        year += if year > 80 { 1900 } else { 2000 };
        let month = decoded[10] & 0x0f;
        let day = decoded[9] & 0x1f;
        meter.set_string_value(
            "last_month_measure_date",
            &format!("{year}-{:02}-{:02}", month % 99, day % 99),
        );
    }

    let alarms = Alarms {
        general: frame[11] >> 7 != 0,
        leakage_currently: frame[12] >> 7 != 0,
        leakage_previously: frame[12] >> 6 & 0x1 != 0,
        meter_blocked: frame[12] >> 5 & 0x1 != 0,
        back_flow: frame[13] >> 7 != 0,
        underflow: frame[13] >> 6 & 0x1 != 0,
        overflow: frame[13] >> 5 & 0x1 != 0,
        submarine: frame[13] >> 4 & 0x1 != 0,
        sensor_fraud_currently: frame[13] >> 3 & 0x1 != 0,
        sensor_fraud_previously: frame[13] >> 2 & 0x1 != 0,
        mechanical_fraud_currently: frame[13] >> 1 & 0x1 != 0,
        mechanical_fraud_previously: frame[13] & 0x1 != 0,
    };
    meter.set_string_value("current_alarms", &current_alarms_text(&alarms));
    meter.set_string_value("previous_alarms", &previous_alarms_text(&alarms));

    t.add_understood(t.payload.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;
    use crate::telegram::{self, AboutTelegram};

    fn run(frame_hex: &str) -> Meter {
        let d = super::super::find_driver("izar").unwrap();
        let mut m = Meter::new("IzarWater", d, vec![AddressExpression::parse("*").unwrap()], None);
        let frame = hex::decode(frame_hex.replace('_', "")).unwrap();
        let mut t = telegram::parse(&frame, AboutTelegram::new("t", -66), None, false).unwrap();
        m.process_telegram(&mut t);
        m
    }

    #[test]
    fn prios_lfsr_decode_with_default_keys() {
        let m = run("1944304C72242421D401A2_013D4013DD8B46A4999C1293E582CC");
        assert_eq!(m.string_value("prefix").unwrap(), "C19UA");
        assert_eq!(m.string_value("serial_number").unwrap(), "145842");
        assert!((m.numeric_value("total").unwrap().value - 3.488).abs() < 1e-9);
        assert!((m.numeric_value("last_month_total").unwrap().value - 3.486).abs() < 1e-9);
        assert_eq!(m.string_value("last_month_measure_date").unwrap(), "2019-09-30");
        assert_eq!(m.numeric_value("remaining_battery_life").unwrap().value, 14.5);
        assert_eq!(m.numeric_value("transmit_period").unwrap().value, 8.0);
        assert_eq!(m.string_value("current_alarms").unwrap(), "meter_blocked,underflow");
        assert_eq!(m.string_value("previous_alarms").unwrap(), "no_alarm");
        assert_eq!(m.string_value("manufacture_year").unwrap(), "2019");
    }

    #[test]
    fn non_sappel_frames_have_no_prefix() {
        let m = run("2944A511780729662366A20118001378D3B3DB8CEDD77731F25832AAF3DA8CADF9774EA673172E8C61F2");
        assert!(m.string_value("prefix").is_none());
        assert!((m.numeric_value("total").unwrap().value - 16.76).abs() < 1e-9);
        assert!((m.numeric_value("last_month_total").unwrap().value - 11.84).abs() < 1e-9);
        assert_eq!(m.string_value("last_month_measure_date").unwrap(), "2019-11-30");
        assert_eq!(m.numeric_value("remaining_battery_life").unwrap().value, 12.0);
        assert_eq!(m.string_value("current_alarms").unwrap(), "no_alarm");
    }
}
