use super::{props, DriverInfo, FieldInfo, FieldMatcher, MeterType, VifScaling};
use crate::address::pack_mfct;
use crate::linkmode::LinkMode;
use crate::telegram::vif::{VifCombinable, VifRange};
use crate::telegram::MeasurementType;
use crate::units::Quantity;

pub fn driver() -> DriverInfo {
    DriverInfo::new("amiplus", MeterType::ElectricityMeter)
        .default_fields("name,id,total_energy_consumption_kwh,current_power_consumption_kw,total_energy_production_kwh,current_power_production_kw,voltage_at_phase_1_v,voltage_at_phase_2_v,voltage_at_phase_3_v,timestamp")
        .link_mode(LinkMode::T1)
        .detect(pack_mfct(b'A', b'P', b'A'), 0x02, 0x02)
        .detect(pack_mfct(b'D', b'E', b'V'), 0x37, 0x02)
        .detect(pack_mfct(b'D', b'E', b'V'), 0x02, 0x00)
        .detect(pack_mfct(b'D', b'E', b'V'), 0x02, 0x01)
        .detect(pack_mfct(b'N', b'E', b'S'), 0x02, 0x03)
        // The Apator Otus 1/3 sends APA and APT frames, only the APA
        // frames decode with this layout.
        .detect(pack_mfct(b'A', b'P', b'A'), 0x02, 0x01)
        .field(FieldInfo::numeric(
            "total_energy_consumption",
            "The total energy consumption recorded by this meter.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF),
        ))
        .field(FieldInfo::numeric(
            "current_power_consumption",
            "Current power consumption.",
            props::DEFAULT,
            Quantity::Power,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::PowerW),
        ))
        .field(FieldInfo::numeric(
            "total_energy_production",
            "The total energy production recorded by this meter.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build().key("0E833C"),
        ))
        .field(FieldInfo::numeric(
            "current_power_production",
            "Current power production.",
            props::DEFAULT,
            Quantity::Power,
            VifScaling::AutoSigned,
            FieldMatcher::build().key("0BAB3C"),
        ))
        .field(FieldInfo::numeric(
            "voltage_at_phase_1",
            "Voltage at phase L1.",
            props::DEFAULT,
            Quantity::Voltage,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Voltage)
                .combinable(VifCombinable::AtPhase1),
        ))
        .field(FieldInfo::numeric(
            "voltage_at_phase_2",
            "Voltage at phase L2.",
            props::DEFAULT,
            Quantity::Voltage,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Voltage)
                .combinable(VifCombinable::AtPhase2),
        ))
        .field(FieldInfo::numeric(
            "voltage_at_phase_3",
            "Voltage at phase L3.",
            props::DEFAULT,
            Quantity::Voltage,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::Voltage)
                .combinable(VifCombinable::AtPhase3),
        ))
        .field(FieldInfo::string(
            "device_date_time",
            "Device date time.",
            props::DEFAULT,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::DateTime),
        ))
        .field(FieldInfo::numeric(
            "total_energy_consumption_tariff_1",
            "The total energy consumption recorded by this meter on tariff 1.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF)
                .tariff(1),
        ))
        .field(FieldInfo::numeric(
            "total_energy_consumption_tariff_2",
            "The total energy consumption recorded by this meter on tariff 2.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF)
                .tariff(2),
        ))
        .field(FieldInfo::numeric(
            "total_energy_consumption_tariff_3",
            "The total energy consumption recorded by this meter on tariff 3.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build()
                .mtype(MeasurementType::Instantaneous)
                .vif(VifRange::AnyEnergyVIF)
                .tariff(3),
        ))
        .field(FieldInfo::numeric(
            "total_energy_production_tariff_1",
            "The total energy production recorded by this meter on tariff 1.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build().key("8E10833C"),
        ))
        .field(FieldInfo::numeric(
            "total_energy_production_tariff_2",
            "The total energy production recorded by this meter on tariff 2.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build().key("8E20833C"),
        ))
        .field(FieldInfo::numeric(
            "total_energy_production_tariff_3",
            "The total energy production recorded by this meter on tariff 3.",
            props::DEFAULT,
            Quantity::Energy,
            VifScaling::AutoSigned,
            FieldMatcher::build().key("8E30833C"),
        ))
}
