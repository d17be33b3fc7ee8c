//
// Copyright (C) 2022 CUAVA, The University of Sydney
//
// Licensed under the Apache License, Version 2.0 (the "License")
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Inverter domain model: protocol enumerations and telemetry records
// Reference documentation: Voltronic RS232/USB communication protocol for Axpert-family inverters

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

// All protocol enumerations are closed sets keyed by the wire discriminant.
// A value outside the set is a decode failure, never a fallback variant.

// Battery chemistry setting (QPIRI field 13, PBT command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum BatteryType {
    AGM = 0,
    Flooded = 1,
    User = 2,
}

impl TryFrom<u8> for BatteryType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BatteryType::AGM),
            1 => Ok(BatteryType::Flooded),
            2 => Ok(BatteryType::User),
            _ => Err(Error::Decode(format!("unknown battery type {}", v))),
        }
    }
}

// AC input working range (QPIRI field 16, PGR command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum VoltageRange {
    Appliance = 0,
    UPS = 1,
}

impl TryFrom<u8> for VoltageRange {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(VoltageRange::Appliance),
            1 => Ok(VoltageRange::UPS),
            _ => Err(Error::Decode(format!("unknown voltage range {}", v))),
        }
    }
}

// Output source priority (QPIRI field 17, POP command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputSourcePriority {
    UtilityFirst = 0,
    SolarFirst = 1,
    SBUFirst = 2,
}

impl TryFrom<u8> for OutputSourcePriority {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(OutputSourcePriority::UtilityFirst),
            1 => Ok(OutputSourcePriority::SolarFirst),
            2 => Ok(OutputSourcePriority::SBUFirst),
            _ => Err(Error::Decode(format!("unknown output source priority {}", v))),
        }
    }
}

// Charger source priority (QPIRI field 18, PCP/PPCP commands)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ChargerSourcePriority {
    UtilityFirst = 0,
    SolarFirst = 1,
    SolarAndUtility = 2,
    SolarOnly = 3,
}

impl TryFrom<u8> for ChargerSourcePriority {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ChargerSourcePriority::UtilityFirst),
            1 => Ok(ChargerSourcePriority::SolarFirst),
            2 => Ok(ChargerSourcePriority::SolarAndUtility),
            3 => Ok(ChargerSourcePriority::SolarOnly),
            _ => Err(Error::Decode(format!("unknown charger source priority {}", v))),
        }
    }
}

// Machine type (QPIRI field 20); discriminants are the literal wire values
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum MachineType {
    GridTie = 0,
    OffGrid = 1,
    Hybrid = 10,
    OffGrid2Trackers = 11,
    OffGrid3Trackers = 20,
}

impl TryFrom<u8> for MachineType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(MachineType::GridTie),
            1 => Ok(MachineType::OffGrid),
            10 => Ok(MachineType::Hybrid),
            11 => Ok(MachineType::OffGrid2Trackers),
            20 => Ok(MachineType::OffGrid3Trackers),
            _ => Err(Error::Decode(format!("unknown machine type {}", v))),
        }
    }
}

// Power stage topology (QPIRI field 21)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum Topology {
    Transformerless = 0,
    Transformer = 1,
}

impl TryFrom<u8> for Topology {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Topology::Transformerless),
            1 => Ok(Topology::Transformer),
            _ => Err(Error::Decode(format!("unknown topology {}", v))),
        }
    }
}

// Single/parallel/three-phase role (QPIRI field 22, QOPM, POPM command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputMode {
    Single = 0,
    Parallel = 1,
    Phase1 = 2,
    Phase2 = 3,
    Phase3 = 4,
}

impl TryFrom<u8> for OutputMode {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(OutputMode::Single),
            1 => Ok(OutputMode::Parallel),
            2 => Ok(OutputMode::Phase1),
            3 => Ok(OutputMode::Phase2),
            4 => Ok(OutputMode::Phase3),
            _ => Err(Error::Decode(format!("unknown output mode {}", v))),
        }
    }
}

// Charging stage selection (QCST, PCST command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ChargingStage {
    Auto = 0,
    TwoStage = 1,
    ThreeStage = 2,
}

impl TryFrom<u8> for ChargingStage {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ChargingStage::Auto),
            1 => Ok(ChargingStage::TwoStage),
            2 => Ok(ChargingStage::ThreeStage),
            _ => Err(Error::Decode(format!("unknown charging stage {}", v))),
        }
    }
}

// PV-OK condition for parallel operation (QPIRI field 24, PPVOKC command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum ParallelPVOK {
    Any = 0,
    All = 1,
}

impl TryFrom<u8> for ParallelPVOK {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(ParallelPVOK::Any),
            1 => Ok(ParallelPVOK::All),
            _ => Err(Error::Decode(format!("unknown parallel PV OK condition {}", v))),
        }
    }
}

// PV power balance mode (QPIRI field 25, PSPB command)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum PVPowerBalance {
    InputCurrentIsChargedCurrent = 0,
    InputPowerIsChargedPowerPlusLoad = 1,
}

impl TryFrom<u8> for PVPowerBalance {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(PVPowerBalance::InputCurrentIsChargedCurrent),
            1 => Ok(PVPowerBalance::InputPowerIsChargedPowerPlusLoad),
            _ => Err(Error::Decode(format!("unknown PV power balance {}", v))),
        }
    }
}

// Enabled/disabled state of a device feature flag (QFLAG, PE/PD commands)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FlagStatus {
    Disabled = 0,
    Enabled = 1,
}

// Battery condition reported in the QPGS status bitfield (bits 4..3)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum BatteryStatus {
    Normal = 0,
    Under = 1,
    Open = 2,
}

impl TryFrom<u8> for BatteryStatus {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BatteryStatus::Normal),
            1 => Ok(BatteryStatus::Under),
            2 => Ok(BatteryStatus::Open),
            _ => Err(Error::Decode(format!("unknown battery status {}", v))),
        }
    }
}

// Device feature flags. Each flag is one letter on the wire, uppercase on
// transmit, either case on receive.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeviceFlag {
    Buzzer,
    OverloadBypass,
    PowerSaving,
    DisplayTimeout,
    OverloadRestart,
    OverTemperatureRestart,
    BacklightOn,
    PrimarySourceInterruptAlarm,
    FaultCodeRecord,
    DataLogPopUp,
}

impl DeviceFlag {
    pub fn letter(self) -> char {
        match self {
            DeviceFlag::Buzzer => 'A',
            DeviceFlag::OverloadBypass => 'B',
            DeviceFlag::PowerSaving => 'J',
            DeviceFlag::DisplayTimeout => 'K',
            DeviceFlag::OverloadRestart => 'U',
            DeviceFlag::OverTemperatureRestart => 'V',
            DeviceFlag::BacklightOn => 'X',
            DeviceFlag::PrimarySourceInterruptAlarm => 'Y',
            DeviceFlag::FaultCodeRecord => 'Z',
            DeviceFlag::DataLogPopUp => 'L',
        }
    }

    pub fn from_letter(c: char) -> Option<DeviceFlag> {
        match c.to_ascii_uppercase() {
            'A' => Some(DeviceFlag::Buzzer),
            'B' => Some(DeviceFlag::OverloadBypass),
            'J' => Some(DeviceFlag::PowerSaving),
            'K' => Some(DeviceFlag::DisplayTimeout),
            'U' => Some(DeviceFlag::OverloadRestart),
            'V' => Some(DeviceFlag::OverTemperatureRestart),
            'X' => Some(DeviceFlag::BacklightOn),
            'Y' => Some(DeviceFlag::PrimarySourceInterruptAlarm),
            'Z' => Some(DeviceFlag::FaultCodeRecord),
            'L' => Some(DeviceFlag::DataLogPopUp),
            _ => None,
        }
    }
}

// Warning bit positions of the QPIWS response, MPPT warnings repeated per
// tracker (SCC1..SCC3)
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceWarning {
    WarnReserved,
    WarnInverterFault,
    WarnBusOver,
    WarnBusUnder,
    WarnBusSoftFail,
    WarnLineFail,
    WarnOPVShort,
    WarnInverterVoltageLow,
    WarnInverterVoltageHigh,
    WarnOverTemperature,
    WarnFanLocked,
    WarnBatteryVoltageHigh,
    WarnBatteryLowAlarm,
    WarnReservedOvercharge,
    WarnBatteryShutdown,
    WarnReservedBatteryDerating,
    WarnOverload,
    WarnEEPROMFault,
    WarnInverterOverCurrent,
    WarnInverterSoftFail,
    WarnSelfTestFail,
    WarnOPDCVoltageOver,
    WarnBatteryOpen,
    WarnCurrentSensorFail,
    WarnBatteryShort,
    WarnPowerLimit,
    WarnPVVoltageHigh,
    WarnMPPTOverloadFault,
    WarnMPPTOverloadWarning,
    WarnBatteryTooLowToCharge,
    WarnPVVoltageHigh2,
    WarnMPPTOverloadFault2,
    WarnMPPTOverloadWarning2,
    WarnBatteryTooLowToCharge2,
    WarnPVVoltageHigh3,
    WarnMPPTOverloadFault3,
    WarnMPPTOverloadWarning3,
    WarnBatteryTooLowToCharge3,
}

impl DeviceWarning {
    const TABLE: [DeviceWarning; 38] = [
        DeviceWarning::WarnReserved,
        DeviceWarning::WarnInverterFault,
        DeviceWarning::WarnBusOver,
        DeviceWarning::WarnBusUnder,
        DeviceWarning::WarnBusSoftFail,
        DeviceWarning::WarnLineFail,
        DeviceWarning::WarnOPVShort,
        DeviceWarning::WarnInverterVoltageLow,
        DeviceWarning::WarnInverterVoltageHigh,
        DeviceWarning::WarnOverTemperature,
        DeviceWarning::WarnFanLocked,
        DeviceWarning::WarnBatteryVoltageHigh,
        DeviceWarning::WarnBatteryLowAlarm,
        DeviceWarning::WarnReservedOvercharge,
        DeviceWarning::WarnBatteryShutdown,
        DeviceWarning::WarnReservedBatteryDerating,
        DeviceWarning::WarnOverload,
        DeviceWarning::WarnEEPROMFault,
        DeviceWarning::WarnInverterOverCurrent,
        DeviceWarning::WarnInverterSoftFail,
        DeviceWarning::WarnSelfTestFail,
        DeviceWarning::WarnOPDCVoltageOver,
        DeviceWarning::WarnBatteryOpen,
        DeviceWarning::WarnCurrentSensorFail,
        DeviceWarning::WarnBatteryShort,
        DeviceWarning::WarnPowerLimit,
        DeviceWarning::WarnPVVoltageHigh,
        DeviceWarning::WarnMPPTOverloadFault,
        DeviceWarning::WarnMPPTOverloadWarning,
        DeviceWarning::WarnBatteryTooLowToCharge,
        DeviceWarning::WarnPVVoltageHigh2,
        DeviceWarning::WarnMPPTOverloadFault2,
        DeviceWarning::WarnMPPTOverloadWarning2,
        DeviceWarning::WarnBatteryTooLowToCharge2,
        DeviceWarning::WarnPVVoltageHigh3,
        DeviceWarning::WarnMPPTOverloadFault3,
        DeviceWarning::WarnMPPTOverloadWarning3,
        DeviceWarning::WarnBatteryTooLowToCharge3,
    ];

    /// Warning at the given QPIWS bit position, if any
    pub fn from_bit(position: usize) -> Option<DeviceWarning> {
        DeviceWarning::TABLE.get(position).copied()
    }
}

// Firmware version as reported by QVFW/QVFW2..4, e.g. "00072.70"
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FirmwareVersion {
    pub series: String,
    pub version: String,
}

// Device rating information (QPIRI response)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RatingInfo {
    pub grid_rating_voltage: f32,
    pub grid_rating_current: f32,
    pub ac_output_rating_voltage: f32,
    pub ac_output_rating_frequency: f32,
    pub ac_output_rating_current: f32,
    pub ac_output_rating_apparent_power: i32,
    pub ac_output_rating_active_power: i32,
    pub battery_rating_voltage: f32,
    pub battery_recharge_voltage: f32,
    pub battery_under_voltage: f32,
    pub battery_bulk_voltage: f32,
    pub battery_float_voltage: f32,
    pub battery_type: BatteryType,
    pub max_ac_charging_current: i32,
    pub max_charging_current: i32,
    pub input_voltage_range: VoltageRange,
    pub output_source_priority: OutputSourcePriority,
    pub charger_source_priority: ChargerSourcePriority,
    pub parallel_max_number: i32,
    pub machine_type: MachineType,
    pub topology: Topology,
    pub output_mode: OutputMode,
    pub battery_redischarge_voltage: f32,
    pub parallel_pv_ok: ParallelPVOK,
    pub pv_power_balance: PVPowerBalance,
}

// General device status, assembled from QPIGS and optionally QPIGS2.
// SCC2/SCC3 fields stay at their defaults until a QPIGS2 merge succeeds.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatusParams {
    pub grid_voltage: f32,
    pub grid_frequency: f32,
    pub ac_output_voltage: f32,
    pub ac_output_frequency: f32,
    pub ac_output_apparent_power: i32,
    pub ac_output_active_power: i32,
    pub output_load_percent: i32,
    pub bus_voltage: i32,
    pub battery_voltage: f32,
    pub battery_charging_current: i32,
    pub battery_capacity: i32,
    pub heat_sink_temperature: i32,
    pub pv_input_current1: i32,
    pub pv_input_voltage1: f32,
    pub battery_voltage_scc1: f32,
    pub pv_input_current2: i32,
    pub pv_input_voltage2: f32,
    pub battery_voltage_scc2: f32,
    pub pv_input_current3: i32,
    pub pv_input_voltage3: f32,
    pub battery_voltage_scc3: f32,
    pub battery_discharge_current: i32,
    pub add_sbu_priority_version: bool,
    pub config_status_changed: bool,
    pub scc_firmware_version_updated: bool,
    pub load_on: bool,
    pub battery_voltage_steady_while_charging: bool,
    pub charging_on: bool,
    pub scc1_charging_on: bool,
    pub scc2_charging_on: bool,
    pub scc3_charging_on: bool,
    pub ac_charging_on: bool,
    pub fan_battery_voltage_offset: i32,
    pub eeprom_version: String,
    pub pv_charging_power1: i32,
    pub pv_charging_power2: i32,
    pub pv_charging_power3: i32,
    pub pv_total_charging_power: i32,
    pub floating_mode_charging: bool,
    pub switch_on: bool,
    pub ac_charging_current: i32,
    pub ac_charging_power: i32,
}

// Per-inverter status in a parallel stack (QPGSi response)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ParallelInfo {
    pub index: u8,
    pub exists: bool,
    pub serial_number: String,
    pub device_mode: String,
    pub fault_code: i32,
    pub grid_voltage: f32,
    pub grid_frequency: f32,
    pub ac_output_voltage: f32,
    pub ac_output_frequency: f32,
    pub ac_output_apparent_power: i32,
    pub ac_output_active_power: i32,
    pub load_percent: i32,
    pub battery_voltage: f32,
    pub battery_charging_current: i32,
    pub battery_capacity: i32,
    pub pv_input_voltage: f32,
    pub total_charging_current: i32,
    pub total_ac_output_apparent_power: i32,
    pub total_ac_output_active_power: i32,
    pub total_output_percent: i32,
    pub scc1_ok: bool,
    pub ac_charging: bool,
    pub scc1_charging: bool,
    pub battery_status: BatteryStatus,
    pub line_loss: bool,
    pub load_on: bool,
    pub configuration_changed: bool,
    pub output_mode: OutputMode,
    pub charger_source_priority: ChargerSourcePriority,
    pub max_charger_current: i32,
    pub max_charger_range: i32,
    pub max_ac_charger_current: i32,
    pub pv_input_current: i32,
    pub battery_discharge_current: i32,
}
