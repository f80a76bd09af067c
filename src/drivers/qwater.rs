use log::debug;

use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::meters::Meter;
use crate::telegram::dv::datetime_parts;
use crate::telegram::vif::{VifCombinable, VifRange};
use crate::telegram::{MeasurementType, Telegram};
use crate::units::{Quantity, Unit};

pub fn driver() -> DriverInfo {
    let qds = pack_mfct(b'Q', b'D', b'S');
    DriverInfo::new("qwater", MeterType::WaterMeter)
        .default_fields("name,id,total_m3,due_date_m3,due_date,status,timestamp")
        .link_mode(LinkMode::S1)
        .detect(qds, 0x37, 0x33)
        .detect(qds, 0x37, 0x35)
        .detect(qds, 0x06, 0x16)
        .detect(qds, 0x07, 0x16)
        .detect(qds, 0x06, 0x17)
        .detect(qds, 0x07, 0x17)
        .detect(qds, 0x06, 0x18)
        .detect(qds, 0x07, 0x18)
        .detect(qds, 0x07, 0x19)
        .detect(qds, 0x06, 0x1a)
        .detect(qds, 0x07, 0x1a)
        .detect(qds, 0x06, 0x35)
        .detect(qds, 0x07, 0x35)
        .process_content(process_content)
        .field(FieldInfo::numeric(
            "meter",
            "Device date time.",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::DateTime),
        ))
        .field(FieldInfo::numeric(
            "total",
            "The total water consumption recorded by this meter.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume),
        ))
        .field(FieldInfo::string_plain(
            "status",
            "Meter status tpl status field.",
            props::DEFAULT | props::STATUS | props::JOIN_TPL_STATUS,
        ))
        .field(FieldInfo::numeric(
            "due_date",
            "The water consumption at the due date.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume)
                .storage(1),
        ))
        .field(FieldInfo::numeric(
            "due",
            "The due date for billing date.",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Date)
                .storage(1),
        ).with_unit(Unit::DateLT))
        .field(FieldInfo::numeric(
            "due_17_date",
            "The water consumption at the 17 due date.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume)
                .storage(17),
        ))
        .field(FieldInfo::numeric(
            "due_17",
            "The due date for billing date.",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Date)
                .storage(17),
        ).with_unit(Unit::DateLT))
        .field(FieldInfo::numeric(
            "volume_flow",
            "Media volume flow when duration exceeds lower last.",
            props::DEFAULT,
            Quantity::Flow,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::VolumeFlow)
                .combinable(VifCombinable::DurationExceedsLowerLast),
        ))
        .field(FieldInfo::numeric(
            "error",
            "The date the error occurred at. If no error, reads 2127-15-31 (FFFF).",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::AtError)
                .vif(VifRange::Date),
        ).with_unit(Unit::DateLT))
}

/* The walk-by telegram packs its readings into one proprietary 53 byte
   blob behind 0DFF5F instead of separate records. */
fn process_content(meter: &mut Meter, t: &mut Telegram) {
    let Some(entry) = t.find_entry("0DFF5F") else { return };
    if entry.raw.len() != 53 {
        debug!("(qwater) walk-by block has unexpected length {}", entry.raw.len());
        return;
    }
    let bytes = entry.raw.clone();

    extract_volume(meter, &bytes, 12, "total");
    extract_date(meter, &bytes, 16, "due");
    extract_volume(meter, &bytes, 18, "due_date");
    extract_date(meter, &bytes, 22, "due_17");
    extract_volume(meter, &bytes, 24, "due_17_date");

    t.add_understood(bytes.len());
}

fn extract_volume(meter: &mut Meter, bytes: &[u8], offset: usize, name: &str) {
    let mut v: u64 = 0;
    for b in bytes[offset..offset + 4].iter().rev() {
        let high = (b >> 4) & 0x0f;
        let low = b & 0x0f;
        if high > 9 || low > 9 {
            return;
        }
        v = v * 100 + (high * 10 + low) as u64;
    }
    /* Same scale as the regular 0x13 volume vif, litres. */
    meter.set_numeric_value(name, Unit::M3, v as f64 / 1000.0);
}

fn extract_date(meter: &mut Meter, bytes: &[u8], offset: usize, name: &str) {
    use chrono::NaiveDate;
    let Some((y, mo, d, _, _, _)) = datetime_parts(&bytes[offset..offset + 2]) else {
        return;
    };
    let Some(date) = NaiveDate::from_ymd_opt(y, mo, d) else { return };
    let ts = date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
    if let Some(ts) = ts {
        meter.set_numeric_value(name, Unit::DateLT, ts as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::AddressExpression;
    use crate::output;
    use crate::telegram::{self, AboutTelegram};

    #[test]
    fn walk_by_telegram_fills_fields_from_blob() {
        let d = super::super::find_driver("qwater").unwrap();
        let mut m = Meter::new("MyQWater", d, vec![AddressExpression::parse("*").unwrap()], None);
        let frame = hex::decode(
            "47449344483635121806780dff5f350082da0000600107c113ffff48200000bf2c91170000df2120200000008001000000060019001000160018000d001300350017002f046d370cc422c759",
        ).unwrap();
        let mut t = telegram::parse(&frame, AboutTelegram::new("t", -70), None, false).unwrap();
        m.process_telegram(&mut t);

        assert!((m.numeric_value("total").unwrap().value - 2.048).abs() < 1e-9);
        assert!((m.numeric_value("due_date").unwrap().value - 1.791).abs() < 1e-9);
        let due = m.numeric_value("due").unwrap();
        assert_eq!(output::format_time_value(due.value, due.unit), "2021-12-31");
        assert!((m.numeric_value("due_17_date").unwrap().value - 2.02).abs() < 1e-9);
        let due17 = m.numeric_value("due_17").unwrap();
        assert_eq!(output::format_time_value(due17.value, due17.unit), "2022-01-31");
        assert_eq!(m.string_value("status").unwrap(), "OK");
    }
}
