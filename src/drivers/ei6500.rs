use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, TEntry, Translate, TranslateType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::telegram::vif::VifRange;
use crate::telegram::MeasurementType;
use crate::units::Quantity;

pub fn driver() -> DriverInfo {
    DriverInfo::new("ei6500", MeterType::SmokeDetector)
        .default_fields("name,id,status,last_alarm_date,alarm_counter,timestamp")
        .link_mode(LinkMode::T1)
        .detect(pack_mfct(b'E', b'I', b'E'), 0x1a, 0x0c)
        .mfct_tpl_status(Translate {
            name: "TPL_STS",
            ttype: TranslateType::BitToString,
            mask: 0xe0, // Always use 0xe0 for tpl mfct status bits.
            default: "OK",
            entries: vec![TEntry::new(0x40, "RTC_INVALID")],
        })
        .field(FieldInfo::string_with_lookup(
            "status",
            "Status and error flags.",
            props::JSON | props::FIELD | props::IMPORTANT | props::STATUS | props::JOIN_TPL_STATUS,
            FieldMatcher::build().vif(VifRange::ErrorFlags),
            Translate {
                name: "ERROR_FLAGS",
                ttype: TranslateType::BitToString,
                mask: 0xffff,
                default: "OK",
                entries: vec![],
            },
        ))
        .field(FieldInfo::string(
            "last_alarm_date",
            "Date when the smoke alarm last triggered.",
            props::FIELD | props::JSON | props::IMPORTANT,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(1)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::numeric(
            "alarm",
            "Number of times the smoke alarm has triggered.",
            props::FIELD | props::JSON | props::IMPORTANT,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(1)
                .vif(VifRange::CumulationCounter),
        ))
        .field(FieldInfo::string(
            "software_version",
            "Meter software version number.",
            props::JSON | props::OPTIONAL,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::SoftwareVersion),
        ))
        .field(FieldInfo::string(
            "message_datetime",
            "Device date time.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::DateTime),
        ))
        .field(FieldInfo::numeric(
            "duration_removed",
            "Time the smoke alarm has been removed.",
            props::JSON,
            Quantity::Time,
            VifScaling::Auto,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(2)
                .vif(VifRange::DurationOfTariff),
        ))
        .field(FieldInfo::string(
            "last_remove_date",
            "Date when the smoke alarm was last removed.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(2)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::numeric(
            "removed",
            "Number of times the smoke alarm has been removed.",
            props::JSON,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(2)
                .vif(VifRange::CumulationCounter),
        ))
        .field(FieldInfo::string(
            "test_button_last_date",
            "Date when test button was last pressed.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(3)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::numeric(
            "test_button",
            "Number of times the test button has been pressed.",
            props::JSON,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .subunit(1)
                .tariff(3)
                .vif(VifRange::CumulationCounter),
        ))
        .field(FieldInfo::string(
            "installation_date",
            "Date when the smoke alarm was installed.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .tariff(2)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::string(
            "last_sound_check_date",
            "Date when the smoke alarm last checked the piezo speaker.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .storage(1)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::string_with_lookup(
            "dust_level",
            "Dust level 0 (best) to 15 (worst).",
            props::JSON,
            FieldMatcher::build().key("8440FF2C"),
            Translate {
                name: "DUST",
                ttype: TranslateType::IndexToString,
                mask: 0x1f,
                default: "",
                entries: vec![],
            },
        ))
        .field(FieldInfo::string_with_lookup(
            "battery_level",
            "Battery voltage level.",
            props::JSON,
            FieldMatcher::build().key("8440FF2C"),
            Translate {
                name: "BATTERY_VOLTAGE",
                ttype: TranslateType::IndexToString,
                mask: 0x0f00,
                default: "",
                entries: vec![
                    TEntry::new(0x0000, "2.25V"),
                    TEntry::new(0x0100, "2.30V"),
                    TEntry::new(0x0200, "2.35V"),
                    TEntry::new(0x0300, "2.40V"),
                    TEntry::new(0x0400, "2.45V"),
                    TEntry::new(0x0500, "2.50V"),
                    TEntry::new(0x0600, "2.55V"),
                    TEntry::new(0x0700, "2.60V"),
                    TEntry::new(0x0800, "2.65V"),
                    TEntry::new(0x0900, "2.70V"),
                    TEntry::new(0x0a00, "2.75V"),
                    TEntry::new(0x0b00, "2.80V"),
                    TEntry::new(0x0c00, "2.85V"),
                    TEntry::new(0x0d00, "2.90V"),
                    TEntry::new(0x0e00, "2.95V"),
                    TEntry::new(0x0f00, "3.00V"),
                ],
            },
        ))
        .field(FieldInfo::string_with_lookup(
            "obstacle_distance",
            "The distance to a detected obstacle.",
            props::JSON,
            FieldMatcher::build().key("8440FF2C"),
            Translate {
                name: "OBSTACLE_DISTANCE",
                ttype: TranslateType::IndexToString,
                mask: 0x700000,
                default: "",
                entries: vec![
                    TEntry::new(0x000000, "SEODS_NOT_COMPLETED"),
                    TEntry::new(0x100000, ""), // No obstacle detected.
                    TEntry::new(0x200000, "45_TO_60_CM"),
                    TEntry::new(0x300000, "38_TO_53_CM"),
                    TEntry::new(0x400000, "33_TO_48_CM"),
                    TEntry::new(0x500000, "28_TO_40_CM"),
                    TEntry::new(0x600000, "20_TO_33_CM"),
                    TEntry::new(0x700000, "0_TO_25_CM"),
                ],
            },
        ))
        .field(FieldInfo::string_with_lookup(
            "head_status",
            "Status of smoke detector sensors, merged into the status field.",
            props::JOIN_INTO_STATUS,
            FieldMatcher::build().key("8440FF2C"),
            Translate {
                name: "HEAD_STATUS",
                ttype: TranslateType::BitToString,
                mask: 0xff8ff0e0,
                default: "OK",
                entries: vec![
                    /* 0x0000000f dust level, 0x00000f00 battery level and
                       0x00700000 obstacle distance live in their own fields. */
                    TEntry::new(0x00000020, "SOUNDER_FAULT"),
                    TEntry::new(0x00000040, "TAMPER_WHILE_REMOVED"),
                    TEntry::new(0x00000080, "EOL_REACHED"),
                    TEntry::new(0x00001000, "LOW_BATTERY_FAULT"),
                    TEntry::new(0x00002000, "ALARM_SENSOR_FAULT"),
                    TEntry::new(0x00004000, "OBSTACLE_DETECTOR_FAULT"),
                    TEntry::new(0x00008000, "EOL_WITHIN_12_MONTH"),
                    TEntry::when_not_set(0x00010000, "SEODS_NOT_YET_COMPLETED"),
                    TEntry::new(0x00020000, "ENV_CHANGED_SINCE_INSTALLATION"),
                    TEntry::new(0x00040000, "COMM_TO_HEAD_FAULT"),
                    TEntry::new(0x00080000, "INTERFERENCE_PREVENTING_OBSTACLE_DETECTION"),
                    TEntry::new(0x01000000, "OBSTACLE_DETECTED"),
                    TEntry::new(0x02000000, "SMOKE_DETECTOR_FULLY_COVERED"),
                ],
            },
        ))
}
