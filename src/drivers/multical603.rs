use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, TEntry, Translate, TranslateType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::telegram::vif::VifRange;
use crate::telegram::MeasurementType;
use crate::units::{Quantity, Unit};

/* Technical Description Multical 603 page 116 section 7.7.2
   Information code types on serial communication. */
fn error_flags() -> Vec<TEntry> {
    vec![
        TEntry::new(0x00000001, "VOLTAGE_INTERRUPTED"),
        TEntry::new(0x00000002, "LOW_BATTERY_LEVEL"),
        TEntry::new(0x00000004, "SENSOR_ERROR"),
        TEntry::new(0x00000008, "SENSOR_T1_ABOVE_MEASURING_RANGE"),
        TEntry::new(0x00000010, "SENSOR_T2_ABOVE_MEASURING_RANGE"),
        TEntry::new(0x00000020, "SENSOR_T1_BELOW_MEASURING_RANGE"),
        TEntry::new(0x00000040, "SENSOR_T2_BELOW_MEASURING_RANGE"),
        TEntry::new(0x00000080, "TEMP_DIFF_WRONG_POLARITY"),
        TEntry::new(0x00000100, "FLOW_SENSOR_WEAK_OR_AIR"),
        TEntry::new(0x00000200, "WRONG_FLOW_DIRECTION"),
        TEntry::new(0x00000400, "RESERVED_BIT_10"),
        TEntry::new(0x00000800, "FLOW_INCREASED"),
        TEntry::new(0x00001000, "IN_A1_LEAKAGE_IN_THE_SYSTEM"),
        TEntry::new(0x00002000, "IN_B1_LEAKAGE_IN_THE_SYSTEM"),
        TEntry::new(0x00004000, "IN-A1_A2_EXTERNAL_ALARM"),
        TEntry::new(0x00008000, "IN-B1_B2_EXTERNAL_ALARM"),
        TEntry::new(0x00010000, "V1_COMMUNICATION_ERROR"),
        TEntry::new(0x00020000, "V1_WRONG_PULSE_FIGURE"),
        TEntry::new(0x00040000, "IN_A2_LEAKAGE_IN_THE_SYSTEM"),
        TEntry::new(0x00080000, "IN_B2_LEAKAGE_IN_THE_SYSTEM"),
        TEntry::new(0x00100000, "T3_ABOVE_MEASURING_RANGE_OR_SWITCHED_OFF"),
        TEntry::new(0x00200000, "T3_BELOW_MEASURING_RANGE_OR_SHORT_CIRCUITED"),
        TEntry::new(0x00400000, "V2_COMMUNICATION_ERROR"),
        TEntry::new(0x00800000, "V2_WRONG_PULSE_FIGURE"),
        TEntry::new(0x01000000, "V2_AIR"),
        TEntry::new(0x02000000, "V2_WRONG_FLOW_DIRECTION"),
        TEntry::new(0x04000000, "RESERVED_BIT_26"),
        TEntry::new(0x08000000, "V2_INCREASED_FLOW"),
        TEntry::new(0x10000000, "V1_V2_BURST_WATER_LOSS"),
        TEntry::new(0x20000000, "V1_V2_BURST_WATER_PENETRATION"),
        TEntry::new(0x40000000, "V1_V2_LEAKAGE_WATER_LOSS"),
        TEntry::new(0x80000000, "V1_V2_LEAKAGE_WATER_PENETRATION"),
    ]
}

pub fn driver() -> DriverInfo {
    DriverInfo::new("multical603", MeterType::HeatMeter)
        .default_fields("name,id,total_energy_consumption_kwh,total_volume_m3,volume_flow_m3h,t1_temperature_c,t2_temperature_c,current_status,timestamp")
        .link_mode(LinkMode::C1)
        .link_mode(LinkMode::T1)
        .detect(pack_mfct(b'K', b'A', b'M'), 0x04, 0x35)
        .detect(pack_mfct(b'K', b'A', b'M'), 0x0c, 0x35)
        .field(FieldInfo::string_with_lookup(
            "status",
            "Status and error flags.",
            props::JSON | props::FIELD | props::IMPORTANT | props::STATUS | props::JOIN_TPL_STATUS,
            FieldMatcher::build().key("04FF22"),
            Translate {
                name: "ERROR_FLAGS",
                ttype: TranslateType::BitToString,
                mask: 0xffffffff,
                default: "OK",
                entries: error_flags(),
            },
        ))
        .field(FieldInfo::numeric(
            "on_time",
            "How long the meter has been running.",
            props::JSON | props::OPTIONAL,
            Quantity::Time,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::OnTime),
        ))
        .field(FieldInfo::numeric(
            "total_energy_consumption",
            "The total energy consumption recorded by this meter.",
            props::JSON | props::FIELD | props::IMPORTANT,
            Quantity::Energy,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF),
        ))
        .field(FieldInfo::numeric(
            "total_volume",
            "The volume of water (3/68/Volume V1).",
            props::JSON | props::OPTIONAL,
            Quantity::Volume,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume),
        ))
        .field(FieldInfo::numeric(
            "volume_flow",
            "The actual amount of water that pass through this meter (8/74/Flow V1 actual).",
            props::JSON | props::OPTIONAL,
            Quantity::Flow,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::VolumeFlow),
        ))
        .field(FieldInfo::numeric(
            "power",
            "The current power flowing.",
            props::JSON | props::OPTIONAL,
            Quantity::Power,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyPowerVIF),
        ))
        .field(FieldInfo::numeric(
            "max_power",
            "The maximum power supplied.",
            props::JSON | props::OPTIONAL,
            Quantity::Power,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Maximum)
                .vif(VifRange::AnyPowerVIF),
        ))
        .field(FieldInfo::numeric(
            "t1_temperature",
            "The forward temperature of the water (6/86/t1 actual 2 decimals).",
            props::JSON | props::OPTIONAL,
            Quantity::Temperature,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::FlowTemperature),
        ))
        .field(FieldInfo::numeric(
            "t2_temperature",
            "The return temperature of the water (7/87/t2 actual 2 decimals).",
            props::JSON | props::OPTIONAL,
            Quantity::Temperature,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::ReturnTemperature),
        ))
        .field(FieldInfo::numeric(
            "max_flow",
            "The maximum flow of water that passed through this meter.",
            props::JSON | props::OPTIONAL,
            Quantity::Flow,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Maximum)
                .vif(VifRange::VolumeFlow),
        ))
        // Backwards compatible current_status to be removed.
        .field(FieldInfo::string_with_lookup(
            "current_status",
            "Status and error flags (9/369/Info Bits).",
            props::JSON | props::FIELD | props::DEPRECATED,
            FieldMatcher::build().key("04FF22"),
            Translate {
                name: "ERROR_FLAGS",
                ttype: TranslateType::BitToString,
                mask: 0xffffffff,
                default: "",
                entries: error_flags(),
            },
        ))
        .field(FieldInfo::numeric(
            "forward_energy",
            "The forward energy of the water (4/97/Energy E8).",
            props::JSON | props::OPTIONAL,
            Quantity::Energy,
            VifScaling::None,
            FieldMatcher::build().key("04FF07"),
        ).with_unit(Unit::M3c))
        .field(FieldInfo::numeric(
            "return_energy",
            "The return energy of the water (5/110/Energy E9).",
            props::JSON | props::OPTIONAL,
            Quantity::Energy,
            VifScaling::None,
            FieldMatcher::build().key("04FF08"),
        ).with_unit(Unit::M3c))
        /* Deprecated kwh versions where the unit should be m3c. */
        .field(FieldInfo::numeric(
            "energy_forward",
            "Deprecated! The forward energy of the water but in wrong unit! Should be m3c!",
            props::JSON | props::OPTIONAL | props::DEPRECATED,
            Quantity::Energy,
            VifScaling::None,
            FieldMatcher::build().key("04FF07"),
        ))
        .field(FieldInfo::numeric(
            "energy_returned",
            "Deprecated! The return energy of the water but in wrong unit! Should be m3c!",
            props::JSON | props::OPTIONAL | props::DEPRECATED,
            Quantity::Energy,
            VifScaling::None,
            FieldMatcher::build().key("04FF08"),
        ))
        .field(FieldInfo::string(
            "meter_date",
            "The date and time (10/348/Date and time).",
            props::JSON | props::OPTIONAL,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::numeric(
            "target_energy",
            "The energy consumption recorded by this meter at the set date (11/60/Heat energy E1/026C).",
            props::JSON | props::FIELD | props::OPTIONAL,
            Quantity::Energy,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF)
                .storage(1),
        ))
        .field(FieldInfo::numeric(
            "target_volume",
            "The amount of water that had passed through this meter at the set date (13/68/Volume V1).",
            props::JSON | props::FIELD | props::OPTIONAL,
            Quantity::Volume,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Volume)
                .storage(1),
        ))
        .field(FieldInfo::string(
            "target_date",
            "The most recent billing period date and time (14/348/Date and Time logged).",
            props::JSON | props::FIELD | props::OPTIONAL,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Date)
                .storage(1),
        ))
}
