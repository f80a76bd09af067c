use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, TEntry, Translate, TranslateType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::telegram::vif::{VifCombinable, VifRange};
use crate::telegram::MeasurementType;
use crate::units::{Quantity, Unit};

fn error_flags() -> Vec<TEntry> {
    vec![
        TEntry::new(0x01, "SW_ERROR"),
        TEntry::new(0x02, "CRC_ERROR"),
        TEntry::new(0x04, "SENSOR_ERROR"),
        TEntry::new(0x08, "MEASUREMENT_ERROR"),
        TEntry::new(0x10, "BATTERY_VOLTAGE_ERROR"),
        TEntry::new(0x20, "MANIPULATION"),
        TEntry::new(0x40, "LEAKAGE_OR_NO_USAGE"),
        TEntry::new(0x80, "REVERSE_FLOW"),
        TEntry::new(0x100, "OVERLOAD"),
    ]
}

pub fn driver() -> DriverInfo {
    let dwz = pack_mfct(b'D', b'W', b'Z');
    let efe = pack_mfct(b'E', b'F', b'E');
    DriverInfo::new("waterstarm", MeterType::WaterMeter)
        .default_fields("name,id,total_m3,total_backwards_m3,current_status,timestamp")
        .link_mode(LinkMode::T1)
        .link_mode(LinkMode::C1)
        .detect(dwz, 0x06, 0x00)
        .detect(dwz, 0x06, 0x02)
        .detect(dwz, 0x07, 0x02)
        .detect(efe, 0x07, 0x03)
        .detect(efe, 0x07, 0x70)
        .detect(dwz, 0x07, 0x00)
        .field(FieldInfo::string_with_lookup(
            "status",
            "Status and error flags.",
            props::DEFAULT | props::JOIN_TPL_STATUS | props::STATUS,
            FieldMatcher::build().vif(VifRange::ErrorFlags),
            Translate {
                name: "ERROR_FLAGS",
                ttype: TranslateType::BitToString,
                mask: 0xffff,
                default: "OK",
                entries: error_flags(),
            },
        ))
        .field(FieldInfo::numeric(
            "meter",
            "Device date time.",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::DateTime),
        ))
        .field(FieldInfo::numeric(
            "total",
            "The total water consumption recorded by this meter.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume),
        ))
        .field(FieldInfo::numeric(
            "total_backwards",
            "The total backward water volume recorded by this meter.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyVolumeVIF)
                .combinable(VifCombinable::BackwardFlow),
        ))
        .field(FieldInfo::string_with_lookup(
            "current_status",
            "Status and error flags. (Deprecated use status instead.)",
            props::DEFAULT | props::JOIN_TPL_STATUS | props::STATUS | props::DEPRECATED,
            FieldMatcher::build().vif(VifRange::ErrorFlags),
            Translate {
                name: "ERROR_FLAGS",
                ttype: TranslateType::BitToString,
                mask: 0xffff,
                default: "OK",
                entries: error_flags(),
            },
        ))
        .field(FieldInfo::string(
            "meter_version",
            "Meter model/version.",
            props::DEFAULT,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::ModelVersion),
        ))
        .field(FieldInfo::string(
            "parameter_set",
            "Parameter set.",
            props::DEFAULT,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::ParameterSet),
        ))
        .field(FieldInfo::numeric(
            "battery",
            "The battery voltage.",
            props::DEFAULT,
            Quantity::Voltage,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Voltage),
        ))
        .field(FieldInfo::numeric(
            "set",
            "The most recent billing period date.",
            props::DEFAULT,
            Quantity::PointInTime,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Date)
                .storage(1),
        ).with_unit(Unit::DateLT))
        .field(FieldInfo::numeric(
            "consumption_at_set_date",
            "The total water consumption at the most recent billing period date.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume)
                .storage(1),
        ))
        .field(FieldInfo::numeric(
            "consumption_at_history_{storage_counter - 1 counter}",
            "The total water consumption at the historic date.",
            props::DEFAULT,
            Quantity::Volume,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume)
                .storage_range(2, 16),
        ))
        .field(FieldInfo::numeric_calculated(
            "history_{storage_counter - 1 counter}",
            "The historic date.",
            props::DEFAULT,
            Quantity::PointInTime,
            "meter_datetime - ((storage_counter - 1 counter) * 1 month)",
        ).with_unit(Unit::DateLT)
            .with_matcher(
                FieldMatcher::build()
                    .mtype(MeasurementType::Instantaneous)
                    .vif(VifRange::Volume)
                    .storage_range(2, 16),
            ))
}
