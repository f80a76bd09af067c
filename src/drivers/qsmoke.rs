use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::telegram::vif::VifRange;
use crate::telegram::MeasurementType;
use crate::units::Quantity;

pub fn driver() -> DriverInfo {
    let qds = pack_mfct(b'Q', b'D', b'S');
    DriverInfo::new("qsmoke", MeterType::SmokeDetector)
        .default_fields("name,id,counter_counter,device_date_time,timestamp")
        .link_mode(LinkMode::C1)
        .link_mode(LinkMode::T1)
        .detect(qds, 0x1a, 0x21)
        .detect(qds, 0x1a, 0x23)
        /* The head status bits are not mapped yet, so the status field
           stays hidden instead of printing a placeholder. */
        .field(FieldInfo::string_plain(
            "status",
            "The current status: OK, SMOKE or ERROR. Hidden until the bit mapping is known.",
            props::HIDE | props::STATUS | props::JOIN_TPL_STATUS,
        ))
        .field(FieldInfo::numeric(
            "counter",
            "Transmission counter.",
            props::JSON,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AccessNumber),
        ))
        /* The ui/al event blocks use plain text vifs IU#/LA# at storage
           four and six. */
        .field(FieldInfo::numeric(
            "ui_event_count",
            "Number of user interface events, button presses and tests.",
            props::JSON,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build().key("81027C03495523"),
        ))
        .field(FieldInfo::string(
            "ui_event_date",
            "Date of the most recent user interface event.",
            props::JSON,
            FieldMatcher::build().key("82026C"),
        ))
        .field(FieldInfo::numeric(
            "al_event_count",
            "Number of alarm events.",
            props::JSON,
            Quantity::Counter,
            VifScaling::None,
            FieldMatcher::build().key("81037C034C4123"),
        ))
        .field(FieldInfo::string(
            "al_event_date",
            "Date of the most recent alarm event.",
            props::JSON,
            FieldMatcher::build().key("82036C"),
        ))
        .field(FieldInfo::numeric(
            "error_flags",
            "Error flags, binary.",
            props::JSON,
            Quantity::Dimensionless,
            VifScaling::None,
            FieldMatcher::build().key("03FD17"),
        ))
        .field(FieldInfo::string(
            "error_date",
            "The date the error occurred at.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::AtError)
                .vif(VifRange::Date),
        ))
        .field(FieldInfo::string(
            "device_date_time",
            "Device date time.",
            props::JSON,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::DateTime),
        ))
}
