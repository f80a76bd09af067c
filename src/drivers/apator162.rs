use log::warn;

use super::{props, DriverInfo, FieldInfo, MeterType};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::meters::Meter;
use crate::telegram::Telegram;
use crate::units::{Quantity, Unit};

pub fn driver() -> DriverInfo {
    let apa = pack_mfct(b'A', b'P', b'A');
    DriverInfo::new("apator162", MeterType::WaterMeter)
        .default_fields("name,id,total_m3,timestamp")
        .link_mode(LinkMode::T1)
        .link_mode(LinkMode::C1)
        .detect(apa, 0x06, 0x05)
        .detect(apa, 0x07, 0x05)
        .detect(0x8614 /* APT? */, 0x07, 0x05) // Older telegram layout that is not understood.
        .process_content(process_content)
        .field(FieldInfo::numeric_hook(
            "total",
            "The total water consumption recorded by this meter.",
            props::DEFAULT,
            Quantity::Volume,
        ))
}

/* The at-wmbus-16-2 wraps a proprietary register stream inside the wmbus
   telegram: one id byte per register, then a fixed number of content
   bytes. Only the total volume register 0x10 is understood. */
fn register_size(c: u8) -> Option<usize> {
    match c {
        0x00 => Some(4), // Date
        0x01 => Some(3), // Faults
        0xa1 | 0x10 => Some(4), // Total volume
        0x11 => Some(2), // Flow
        0x40 => Some(6), // Detectors
        0x41 => Some(2), // Voltage
        0x42 => Some(4), // Energy
        0x43 => Some(2), // Life days
        0x44 => Some(3),
        0x71..=0x7b => Some(1 + ((c - 0x70) as usize + 1) * 4), // Historical data
        0x80..=0x84 | 0x86 | 0x87 => Some(10), // Events
        0x85 | 0x88 | 0x8f => Some(11),
        0x8a => Some(9),
        0x8b | 0x8c => Some(6),
        0x8e => Some(7),
        0xa0 => Some(4),
        0xa2 => Some(1),
        0xa3 => Some(7),
        0xa4 => Some(4),
        0xa5 | 0xa9 | 0xaf => Some(1),
        0xa6 => Some(3),
        0xa7 | 0xa8 | 0xaa | 0xab | 0xac | 0xad => Some(2),
        0xb0 => Some(5),
        0xb1 => Some(8),
        0xb2 => Some(16),
        _ => None,
    }
}

fn process_content(meter: &mut Meter, t: &mut Telegram) {
    if t.tpl.as_ref().map(|tpl| tpl.ci) == Some(0xb6) {
        /* Really old style telegram that we cannot decode. */
        t.bad = true;
        return;
    }

    let content = t.payload.clone();

    /* The first 8 bytes are a marker, a date and fault bytes. */
    let mut i = 8;
    while i < content.len() {
        let c = content[i];
        if c == 0xff {
            /* FF signals end of telegram padded to the encryption boundary. */
            break;
        }
        i += 1;
        let size = match register_size(c) {
            Some(s) if i + s <= content.len() => s,
            Some(s) => {
                warn!(
                    "(apator162) telegram decoding fails since last register ({c:02x} size {s}) does not \
                     align with telegram size. Please open an issue at the tracker and report this telegram: {}",
                    hex::encode(&t.raw)
                );
                break;
            }
            None => {
                warn!(
                    "(apator162) telegram contains a register ({c:02x}) with unknown size. \
                     Please open an issue at the tracker and report this telegram: {}",
                    hex::encode(&t.raw)
                );
                break;
            }
        };
        if c == 0x10 {
            let total = u32::from_le_bytes([
                content[i],
                content[i + 1],
                content[i + 2],
                content[i + 3],
            ]);
            meter.set_numeric_value("total", Unit::M3, total as f64 / 1000.0);
            t.add_understood(5);
        }
        i += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;

    #[test]
    fn register_sizes_cover_history_blocks() {
        assert_eq!(register_size(0x10), Some(4));
        assert_eq!(register_size(0x73), Some(17));
        assert_eq!(register_size(0x7b), Some(49));
        assert_eq!(register_size(0x99), None);
    }

    #[test]
    fn total_register_extracted() {
        let d = super::super::find_driver("apator162").unwrap();
        let mut m = Meter::new("Apa", d, vec![AddressExpression::parse("*").unwrap()], None);
        /* Register stream: 8 byte preamble, register 0x10 with 4 byte
           litre count, then the ff end marker. */
        let frame = hex::decode("18440106051010100507A00F005B599600000010E1640000FF").unwrap();
        let mut t = crate::telegram::parse(
            &frame,
            crate::telegram::AboutTelegram::new("t", -70),
            None,
            false,
        )
        .unwrap();
        m.process_telegram(&mut t);
        assert!((m.numeric_value("total").unwrap().value - 25.825).abs() < 1e-9);
    }
}
