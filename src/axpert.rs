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

//! Axpert/Voltronic inverter codec and operations
// Reference documentation: Voltronic RS232/USB communication protocol for Axpert-family inverters

use crate::connector::{Connector, CR};
use crate::error::{Error, Result};
use crate::objects::*;
use crc::{Crc, CRC_16_IBM_3740};
use log::debug;
use std::collections::BTreeMap;

const LF: u8 = 0x0a;
const LEFT_PAREN: u8 = 0x28;

// CRC-16/IBM-3740 is CCITT-FALSE: poly 0x1021, init 0xFFFF, no reflection
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

// The device bumps CRC bytes that would collide with framing bytes
// (LF, CR, '(') by one; each byte is escaped independently.
fn crc_bytes(data: &[u8]) -> [u8; 2] {
    let crc = crc16(data);
    let mut bytes = [(crc >> 8) as u8, (crc & 0xff) as u8];
    for b in bytes.iter_mut() {
        if *b == LF || *b == CR || *b == LEFT_PAREN {
            *b += 1;
        }
    }
    bytes
}

/// Frame a request: command bytes, escaped CRC trailer, CR
fn encode_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(command.len() + 3);
    frame.extend_from_slice(command.as_bytes());
    frame.extend_from_slice(&crc_bytes(command.as_bytes()));
    frame.push(CR);
    frame
}

fn validate_response(read: &[u8]) -> Result<()> {
    if read.len() < 4 {
        return Err(Error::Framing(format!("response too short, {} bytes", read.len())));
    }
    if read[0] != LEFT_PAREN {
        return Err(Error::Framing(format!("invalid response start {:#04x}", read[0])));
    }
    if read[read.len() - 1] != CR {
        return Err(Error::Framing(format!(
            "invalid response end {:#04x}",
            read[read.len() - 1]
        )));
    }
    let received = &read[read.len() - 3..read.len() - 1];
    let computed = crc_bytes(&read[..read.len() - 3]);
    if received != computed {
        return Err(Error::Framing(format!(
            "CRC mismatch, received {:02x?}, computed {:02x?}",
            received, computed
        )));
    }
    Ok(())
}

// One complete request/response turn. The caller must hold the transport
// exclusively for the duration.
fn send_request(c: &mut dyn Connector, request: &str) -> Result<String> {
    let frame = encode_command(request);
    debug!("{} request {:02x?}", request, frame);
    c.write_all(&frame)?;

    let read = c.read_until(CR)?;
    debug!("{} response {:02x?}", request, read);
    validate_response(&read)?;

    let payload = &read[1..read.len() - 3];
    match std::str::from_utf8(payload) {
        Ok(s) => Ok(s.to_string()),
        Err(_) => Err(Error::Decode(format!("{} response is not ASCII", request))),
    }
}

// Setter turn: the device answers ACK or NAK
fn send_command(c: &mut dyn Connector, command: &str) -> Result<()> {
    let resp = send_request(c, command)?;
    if resp == "NAK" {
        return Err(Error::NotAcknowledged(command.to_string()));
    }
    Ok(())
}

fn parse_f32(field: &str) -> Result<f32> {
    field
        .parse::<f32>()
        .map_err(|_| Error::Decode(format!("invalid number {:?}", field)))
}

fn parse_i32(field: &str) -> Result<i32> {
    field
        .parse::<i32>()
        .map_err(|_| Error::Decode(format!("invalid integer {:?}", field)))
}

fn parse_u8(field: &str) -> Result<u8> {
    field
        .parse::<u8>()
        .map_err(|_| Error::Decode(format!("invalid discriminant {:?}", field)))
}

// Binary-ASCII status fields, e.g. "00110110"
fn parse_bits(field: &str) -> Result<u8> {
    u8::from_str_radix(field, 2).map_err(|_| Error::Decode(format!("invalid status bits {:?}", field)))
}

pub fn protocol_id(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QPI")
}

pub fn serial_no(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QID")
}

pub fn inverter_firmware_version(c: &mut dyn Connector) -> Result<FirmwareVersion> {
    let resp = send_request(c, "QVFW")?;
    parse_firmware_version(&resp, "VERFW")
}

pub fn scc1_firmware_version(c: &mut dyn Connector) -> Result<FirmwareVersion> {
    let resp = send_request(c, "QVFW2")?;
    parse_firmware_version(&resp, "VERFW2")
}

pub fn scc2_firmware_version(c: &mut dyn Connector) -> Result<FirmwareVersion> {
    let resp = send_request(c, "QVFW3")?;
    parse_firmware_version(&resp, "VERFW3")
}

pub fn scc3_firmware_version(c: &mut dyn Connector) -> Result<FirmwareVersion> {
    let resp = send_request(c, "QVFW4")?;
    parse_firmware_version(&resp, "VERFW4")
}

/// CV-stage charging time in minutes, 255 meaning automatic
pub fn cv_mode_charging_time(c: &mut dyn Connector) -> Result<u8> {
    let resp = send_request(c, "QCVT")?;
    parse_u8(&resp)
}

pub fn device_charging_stage(c: &mut dyn Connector) -> Result<ChargingStage> {
    let resp = send_request(c, "QCST")?;
    ChargingStage::try_from(parse_u8(&resp)?)
}

pub fn device_output_mode(c: &mut dyn Connector) -> Result<OutputMode> {
    let resp = send_request(c, "QOPM")?;
    OutputMode::try_from(parse_u8(&resp)?)
}

pub fn dsp_bootstrapped(c: &mut dyn Connector) -> Result<bool> {
    let resp = send_request(c, "QBOOT")?;
    Ok(resp != "0")
}

pub fn max_solar_charging_current(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QMSCHGCR")
}

pub fn max_utility_charging_current(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QMUCHGCR")
}

pub fn max_total_charging_current(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QMCHGCR")
}

pub fn default_settings(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QDI")
}

pub fn device_rating_info(c: &mut dyn Connector) -> Result<RatingInfo> {
    let resp = send_request(c, "QPIRI")?;
    parse_rating_info(&resp)
}

pub fn device_flag_status(c: &mut dyn Connector) -> Result<BTreeMap<DeviceFlag, FlagStatus>> {
    let resp = send_request(c, "QFLAG")?;
    parse_device_flags(&resp)
}

pub fn device_general_status(c: &mut dyn Connector) -> Result<DeviceStatusParams> {
    let resp = send_request(c, "QPIGS")?;
    parse_device_status_params(&resp)
}

/// Second half of the general status (SCC2/SCC3 trackers, AC charging).
/// Merges into a copy of `params`; on any failure the caller's record is
/// untouched. Some firmware never answers this query and times out.
pub fn device_general_status2(
    c: &mut dyn Connector,
    params: &DeviceStatusParams,
) -> Result<DeviceStatusParams> {
    let resp = send_request(c, "QPIGS2")?;
    parse_device_status_params2(&resp, params)
}

pub fn device_mode(c: &mut dyn Connector) -> Result<String> {
    send_request(c, "QMOD")
}

pub fn parallel_device_info(c: &mut dyn Connector, index: u8) -> Result<ParallelInfo> {
    let resp = send_request(c, &format!("QPGS{}", index))?;
    parse_parallel_info(&resp, index)
}

pub fn warning_status(c: &mut dyn Connector) -> Result<Vec<DeviceWarning>> {
    let resp = send_request(c, "QPIWS")?;
    parse_warnings(&resp)
}

pub fn enable_device_flags(c: &mut dyn Connector, flags: &[DeviceFlag]) -> Result<()> {
    send_command(c, &format_device_flags(flags, FlagStatus::Enabled))
}

pub fn disable_device_flags(c: &mut dyn Connector, flags: &[DeviceFlag]) -> Result<()> {
    send_command(c, &format_device_flags(flags, FlagStatus::Disabled))
}

fn format_device_flags(flags: &[DeviceFlag], status: FlagStatus) -> String {
    let mut command = String::with_capacity(flags.len() + 2);
    command.push('P');
    command.push(match status {
        FlagStatus::Enabled => 'E',
        FlagStatus::Disabled => 'D',
    });
    for flag in flags {
        command.push(flag.letter());
    }
    command
}

pub fn set_output_source_priority(c: &mut dyn Connector, priority: OutputSourcePriority) -> Result<()> {
    send_command(c, &format!("POP{:02}", priority as u8))
}

pub fn set_charger_source_priority(
    c: &mut dyn Connector,
    priority: ChargerSourcePriority,
) -> Result<()> {
    send_command(c, &format!("PCP{:02}", priority as u8))
}

pub fn set_battery_type(c: &mut dyn Connector, battery_type: BatteryType) -> Result<()> {
    send_command(c, &format!("PBT{:02}", battery_type as u8))
}

pub fn set_battery_recharge_voltage(c: &mut dyn Connector, voltage: f32) -> Result<()> {
    send_command(c, &format!("PBCV{:.1}", voltage))
}

/// 00.0 means "battery full"
pub fn set_battery_redischarge_voltage(c: &mut dyn Connector, voltage: f32) -> Result<()> {
    send_command(c, &format!("PBDV{:.1}", voltage))
}

pub fn set_battery_cutoff_voltage(c: &mut dyn Connector, voltage: f32) -> Result<()> {
    send_command(c, &format!("PSDV{:.1}", voltage))
}

pub fn set_cv_mode_charging_voltage(c: &mut dyn Connector, voltage: f32) -> Result<()> {
    send_command(c, &format!("PCVV{:.1}", voltage))
}

pub fn set_float_charging_voltage(c: &mut dyn Connector, voltage: f32) -> Result<()> {
    send_command(c, &format!("PBFT{:.1}", voltage))
}

pub fn set_device_charging_stage(c: &mut dyn Connector, stage: ChargingStage) -> Result<()> {
    send_command(c, &format!("PCST{:02}", stage as u8))
}

/// Minutes in {0,10,20,40,60,90,120,150,180,210,240,255}; 255 = automatic
pub fn set_cv_mode_charging_time(c: &mut dyn Connector, minutes: u8) -> Result<()> {
    send_command(c, &format!("PCVT{:03}", minutes))
}

pub fn set_grid_working_range(c: &mut dyn Connector, range: VoltageRange) -> Result<()> {
    send_command(c, &format!("PGR{:02}", range as u8))
}

pub fn set_device_output_mode(c: &mut dyn Connector, mode: OutputMode) -> Result<()> {
    send_command(c, &format!("POPM{:02}", mode as u8))
}

pub fn set_parallel_charger_source_priority(
    c: &mut dyn Connector,
    priority: ChargerSourcePriority,
    parallel_number: u8,
) -> Result<()> {
    send_command(c, &format!("PPCP{}{:02}", parallel_number, priority as u8))
}

pub fn set_max_total_charging_current(
    c: &mut dyn Connector,
    current: u8,
    parallel_number: u8,
) -> Result<()> {
    send_command(c, &format!("MCHGC{}{:03}", parallel_number, current))
}

pub fn set_parallel_max_total_charging_current(c: &mut dyn Connector, current: u8) -> Result<()> {
    send_command(c, &format!("MNCHGC{:03}", current))
}

pub fn set_max_utility_charging_current(c: &mut dyn Connector, current: u8) -> Result<()> {
    send_command(c, &format!("MUCHGC{:03}", current))
}

pub fn set_max_solar_charging_current(c: &mut dyn Connector, current: u8) -> Result<()> {
    send_command(c, &format!("MSCHGC{:03}", current))
}

/// 50 or 60 Hz
pub fn set_output_rating_frequency(c: &mut dyn Connector, frequency: u8) -> Result<()> {
    send_command(c, &format!("F{:02}", frequency))
}

pub fn set_parallel_pv_ok(c: &mut dyn Connector, pvok: ParallelPVOK) -> Result<()> {
    send_command(c, &format!("PPVOKC{}", pvok as u8))
}

pub fn set_pv_power_balance(c: &mut dyn Connector, balance: PVPowerBalance) -> Result<()> {
    send_command(c, &format!("PSPB{}", balance as u8))
}

pub fn set_default_settings(c: &mut dyn Connector) -> Result<()> {
    send_command(c, "PF")
}

fn parse_firmware_version(resp: &str, prefix: &str) -> Result<FirmwareVersion> {
    let mut parts = resp.split(':');
    let (head, tail) = match (parts.next(), parts.next(), parts.next()) {
        (Some(head), Some(tail), None) => (head, tail),
        _ => return Err(Error::Decode(format!("invalid firmware response {:?}", resp))),
    };
    if head != prefix {
        return Err(Error::Decode(format!("invalid firmware prefix {:?}", head)));
    }
    let mut version = tail.split('.');
    match (version.next(), version.next(), version.next()) {
        (Some(series), Some(version), None) => Ok(FirmwareVersion {
            series: series.to_string(),
            version: version.to_string(),
        }),
        _ => Err(Error::Decode(format!("invalid firmware version {:?}", tail))),
    }
}

fn parse_rating_info(resp: &str) -> Result<RatingInfo> {
    let parts: Vec<&str> = resp.split(' ').collect();
    if parts.len() < 25 {
        return Err(Error::Decode(format!(
            "rating info has {} fields, expected 25",
            parts.len()
        )));
    }

    Ok(RatingInfo {
        grid_rating_voltage: parse_f32(parts[0])?,
        grid_rating_current: parse_f32(parts[1])?,
        ac_output_rating_voltage: parse_f32(parts[2])?,
        ac_output_rating_frequency: parse_f32(parts[3])?,
        ac_output_rating_current: parse_f32(parts[4])?,
        ac_output_rating_apparent_power: parse_i32(parts[5])?,
        ac_output_rating_active_power: parse_i32(parts[6])?,
        battery_rating_voltage: parse_f32(parts[7])?,
        battery_recharge_voltage: parse_f32(parts[8])?,
        battery_under_voltage: parse_f32(parts[9])?,
        battery_bulk_voltage: parse_f32(parts[10])?,
        battery_float_voltage: parse_f32(parts[11])?,
        battery_type: BatteryType::try_from(parse_u8(parts[12])?)?,
        max_ac_charging_current: parse_i32(parts[13])?,
        max_charging_current: parse_i32(parts[14])?,
        input_voltage_range: VoltageRange::try_from(parse_u8(parts[15])?)?,
        output_source_priority: OutputSourcePriority::try_from(parse_u8(parts[16])?)?,
        charger_source_priority: ChargerSourcePriority::try_from(parse_u8(parts[17])?)?,
        parallel_max_number: parse_i32(parts[18])?,
        machine_type: MachineType::try_from(parse_u8(parts[19])?)?,
        topology: Topology::try_from(parse_u8(parts[20])?)?,
        output_mode: OutputMode::try_from(parse_u8(parts[21])?)?,
        battery_redischarge_voltage: parse_f32(parts[22])?,
        parallel_pv_ok: ParallelPVOK::try_from(parse_u8(parts[23])?)?,
        pv_power_balance: PVPowerBalance::try_from(parse_u8(parts[24])?)?,
    })
}

// The response opens with 'E' followed by the enabled flag letters; a 'D'
// sentinel switches to the disabled letters. Letters may arrive in either
// case, the sentinels may not.
fn parse_device_flags(resp: &str) -> Result<BTreeMap<DeviceFlag, FlagStatus>> {
    if resp.len() < 2 {
        return Err(Error::Decode(format!("flag response too short {:?}", resp)));
    }
    let mut chars = resp.chars();
    if chars.next() != Some('E') {
        return Err(Error::Decode(format!("flag response missing 'E' sentinel {:?}", resp)));
    }

    let mut flags = BTreeMap::new();
    let mut value = FlagStatus::Enabled;
    for c in chars {
        if c == 'D' {
            value = FlagStatus::Disabled;
            continue;
        }
        match DeviceFlag::from_letter(c) {
            Some(flag) => {
                flags.insert(flag, value);
            }
            None => return Err(Error::Decode(format!("unknown flag letter {:?}", c))),
        }
    }
    Ok(flags)
}

fn parse_device_status_params(resp: &str) -> Result<DeviceStatusParams> {
    let parts: Vec<&str> = resp.split(' ').collect();
    if parts.len() < 21 {
        return Err(Error::Decode(format!(
            "general status has {} fields, expected 21",
            parts.len()
        )));
    }

    let mut params = DeviceStatusParams::default();
    params.grid_voltage = parse_f32(parts[0])?;
    params.grid_frequency = parse_f32(parts[1])?;
    params.ac_output_voltage = parse_f32(parts[2])?;
    params.ac_output_frequency = parse_f32(parts[3])?;
    params.ac_output_apparent_power = parse_i32(parts[4])?;
    params.ac_output_active_power = parse_i32(parts[5])?;
    params.output_load_percent = parse_i32(parts[6])?;
    params.bus_voltage = parse_i32(parts[7])?;
    params.battery_voltage = parse_f32(parts[8])?;
    params.battery_charging_current = parse_i32(parts[9])?;
    params.battery_capacity = parse_i32(parts[10])?;
    params.heat_sink_temperature = parse_i32(parts[11])?;
    params.pv_input_current1 = parse_i32(parts[12])?;
    params.pv_input_voltage1 = parse_f32(parts[13])?;
    params.battery_voltage_scc1 = parse_f32(parts[14])?;
    params.battery_discharge_current = parse_i32(parts[15])?;

    let sflags = parse_bits(parts[16])?;
    params.add_sbu_priority_version = sflags & 0x80 == 0x80;
    params.config_status_changed = sflags & 0x40 == 0x40;
    params.scc_firmware_version_updated = sflags & 0x20 == 0x20;
    params.load_on = sflags & 0x10 == 0x10;
    params.battery_voltage_steady_while_charging = sflags & 0x08 == 0x08;
    params.charging_on = sflags & 0x04 == 0x04;
    params.scc1_charging_on = sflags & 0x02 == 0x02;
    params.ac_charging_on = sflags & 0x01 == 0x01;

    params.fan_battery_voltage_offset = parse_i32(parts[17])?;
    params.eeprom_version = parts[18].to_string();
    params.pv_charging_power1 = parse_i32(parts[19])?;

    let device_status = parts[20].as_bytes();
    if device_status.len() < 3 {
        return Err(Error::Decode(format!("invalid device status {:?}", parts[20])));
    }
    params.floating_mode_charging = device_status[0] == b'1';
    params.switch_on = device_status[1] == b'1';

    Ok(params)
}

// Decodes into a copy so a failed QPIGS2 turn cannot corrupt the record
// assembled from QPIGS.
fn parse_device_status_params2(resp: &str, params: &DeviceStatusParams) -> Result<DeviceStatusParams> {
    let parts: Vec<&str> = resp.split(' ').collect();
    if parts.len() < 12 {
        return Err(Error::Decode(format!(
            "general status 2 has {} fields, expected 12",
            parts.len()
        )));
    }

    let mut merged = params.clone();
    merged.pv_input_current2 = parse_i32(parts[0])?;
    merged.pv_input_voltage2 = parse_f32(parts[1])?;
    merged.battery_voltage_scc2 = parse_f32(parts[2])?;
    merged.pv_charging_power2 = parse_i32(parts[3])?;

    let sflags = parse_bits(parts[4])?;
    merged.scc2_charging_on = sflags & 0x80 == 0x80;
    merged.scc3_charging_on = sflags & 0x40 == 0x40;

    merged.ac_charging_current = parse_i32(parts[5])?;
    merged.ac_charging_power = parse_i32(parts[6])?;
    merged.pv_input_current3 = parse_i32(parts[7])?;
    merged.pv_input_voltage3 = parse_f32(parts[8])?;
    merged.battery_voltage_scc3 = parse_f32(parts[9])?;
    merged.pv_charging_power3 = parse_i32(parts[10])?;
    merged.pv_total_charging_power = parse_i32(parts[11])?;

    Ok(merged)
}

fn parse_parallel_info(resp: &str, index: u8) -> Result<ParallelInfo> {
    let parts: Vec<&str> = resp.split(' ').collect();
    if parts.len() < 27 {
        return Err(Error::Decode(format!(
            "parallel info has {} fields, expected 27",
            parts.len()
        )));
    }

    let exists = match parts[0] {
        "0" => false,
        "1" => true,
        other => return Err(Error::Decode(format!("invalid existence flag {:?}", other))),
    };

    let sflags = parse_bits(parts[19])?;

    Ok(ParallelInfo {
        index,
        exists,
        serial_number: parts[1].to_string(),
        device_mode: parts[2].to_string(),
        fault_code: parse_i32(parts[3])?,
        grid_voltage: parse_f32(parts[4])?,
        grid_frequency: parse_f32(parts[5])?,
        ac_output_voltage: parse_f32(parts[6])?,
        ac_output_frequency: parse_f32(parts[7])?,
        ac_output_apparent_power: parse_i32(parts[8])?,
        ac_output_active_power: parse_i32(parts[9])?,
        load_percent: parse_i32(parts[10])?,
        battery_voltage: parse_f32(parts[11])?,
        battery_charging_current: parse_i32(parts[12])?,
        battery_capacity: parse_i32(parts[13])?,
        pv_input_voltage: parse_f32(parts[14])?,
        total_charging_current: parse_i32(parts[15])?,
        total_ac_output_apparent_power: parse_i32(parts[16])?,
        total_ac_output_active_power: parse_i32(parts[17])?,
        total_output_percent: parse_i32(parts[18])?,
        scc1_ok: sflags & 0x80 == 0x80,
        ac_charging: sflags & 0x40 == 0x40,
        scc1_charging: sflags & 0x20 == 0x20,
        battery_status: BatteryStatus::try_from((sflags >> 3) & 0x03)?,
        line_loss: sflags & 0x04 == 0x04,
        load_on: sflags & 0x02 == 0x02,
        configuration_changed: sflags & 0x01 == 0x01,
        output_mode: OutputMode::try_from(parse_u8(parts[20])?)?,
        charger_source_priority: ChargerSourcePriority::try_from(parse_u8(parts[21])?)?,
        max_charger_current: parse_i32(parts[22])?,
        max_charger_range: parse_i32(parts[23])?,
        max_ac_charger_current: parse_i32(parts[24])?,
        pv_input_current: parse_i32(parts[25])?,
        battery_discharge_current: parse_i32(parts[26])?,
    })
}

fn parse_warnings(status: &str) -> Result<Vec<DeviceWarning>> {
    if status.len() < 32 {
        return Err(Error::Decode(format!("not enough warning flags, {}", status.len())));
    }
    if status.len() > 38 {
        return Err(Error::Decode(format!("too many warning flags, {}", status.len())));
    }

    let mut warnings = Vec::new();
    for (i, c) in status.chars().enumerate() {
        if c != '1' {
            continue;
        }
        if let Some(warning) = DeviceWarning::from_bit(i) {
            warnings.push(warning);
        }
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    // Bit-by-bit CRC-16/CCITT-FALSE, kept independent of the crc crate
    fn reference_crc(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xffff;
        for &b in data {
            crc ^= (b as u16) << 8;
            for _ in 0..8 {
                if crc & 0x8000 != 0 {
                    crc = (crc << 1) ^ 0x1021;
                } else {
                    crc <<= 1;
                }
            }
        }
        crc
    }

    fn reference_crc_bytes(data: &[u8]) -> [u8; 2] {
        let crc = reference_crc(data);
        let mut bytes = [(crc >> 8) as u8, (crc & 0xff) as u8];
        for b in bytes.iter_mut() {
            if *b == LF || *b == CR || *b == LEFT_PAREN {
                *b += 1;
            }
        }
        bytes
    }

    // Frame a device response the way the inverter does
    fn response(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![LEFT_PAREN];
        frame.extend_from_slice(payload);
        let crc = crc_bytes(&frame);
        frame.extend_from_slice(&crc);
        frame.push(CR);
        frame
    }

    struct ScriptedConnector {
        written: Vec<Vec<u8>>,
        responses: VecDeque<Vec<u8>>,
    }

    impl ScriptedConnector {
        fn respond_with(payload: &[u8]) -> ScriptedConnector {
            ScriptedConnector {
                written: Vec::new(),
                responses: VecDeque::from(vec![response(payload)]),
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) {}

        fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.written.push(bytes.to_vec());
            Ok(())
        }

        fn read_until(&mut self, _terminator: u8) -> Result<Vec<u8>> {
            self.responses.pop_front().ok_or(Error::Timeout)
        }

        fn read_until_deadline(&mut self, terminator: u8, _timeout: Duration) -> Result<Vec<u8>> {
            self.read_until(terminator)
        }
    }

    #[test]
    fn crc_matches_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29b1);
    }

    #[test]
    fn crc_bytes_match_reference_and_never_collide_with_framing() {
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                let data = [a, b];
                let bytes = crc_bytes(&data);
                assert_eq!(bytes, reference_crc_bytes(&data));
                for byte in bytes {
                    assert!(byte != LF && byte != CR && byte != LEFT_PAREN);
                }
            }
        }
    }

    #[test]
    fn encode_appends_crc_and_terminator() {
        let frame = encode_command("QPI");
        let crc = reference_crc_bytes(b"QPI");
        assert_eq!(frame, vec![b'Q', b'P', b'I', crc[0], crc[1], CR]);
    }

    #[test]
    fn validate_accepts_well_formed_response() {
        let frame = response(b"230.0 21.7 230.0 50.0");
        assert!(validate_response(&frame).is_ok());
    }

    #[test]
    fn validate_rejects_corruption() {
        let mut frame = response(b"NAK");
        frame[2] ^= 0x01;
        assert!(matches!(validate_response(&frame), Err(Error::Framing(_))));

        let mut bad_start = response(b"NAK");
        bad_start[0] = b'[';
        assert!(matches!(validate_response(&bad_start), Err(Error::Framing(_))));

        assert!(matches!(validate_response(b"(\r"), Err(Error::Framing(_))));
    }

    #[test]
    fn send_request_frames_and_strips() {
        let mut c = ScriptedConnector::respond_with(b"96332309100452");
        let id = serial_no(&mut c).unwrap();
        assert_eq!(id, "96332309100452");
        assert_eq!(c.written, vec![encode_command("QID")]);
    }

    #[test]
    fn setter_surfaces_nak() {
        let mut c = ScriptedConnector::respond_with(b"NAK");
        let err = set_output_source_priority(&mut c, OutputSourcePriority::SBUFirst).unwrap_err();
        assert_eq!(err, Error::NotAcknowledged("POP02".to_string()));
    }

    #[test]
    fn setter_accepts_ack() {
        let mut c = ScriptedConnector::respond_with(b"ACK");
        set_battery_type(&mut c, BatteryType::User).unwrap();
        assert_eq!(c.written, vec![encode_command("PBT02")]);
    }

    #[test]
    fn firmware_version_parses() {
        let version = parse_firmware_version("VERFW:00072.70", "VERFW").unwrap();
        assert_eq!(
            version,
            FirmwareVersion {
                series: "00072".to_string(),
                version: "70".to_string(),
            }
        );

        assert!(parse_firmware_version("VERFW2:00072.70", "VERFW").is_err());
        assert!(parse_firmware_version("VERFW 00072.70", "VERFW").is_err());
        assert!(parse_firmware_version("VERFW:0007270", "VERFW").is_err());
    }

    #[test]
    fn rating_info_parses() {
        let resp = "230.0 21.7 230.0 50.0 21.7 5000 4000 48.0 48.0 47.5 53.2 51.9 2 30 120 0 0 1 9 01 0 0 51.0 0 1 000";
        let info = parse_rating_info(resp).unwrap();

        assert_eq!(info.grid_rating_voltage, 230.0);
        assert_eq!(info.grid_rating_current, 21.7);
        assert_eq!(info.ac_output_rating_voltage, 230.0);
        assert_eq!(info.ac_output_rating_frequency, 50.0);
        assert_eq!(info.ac_output_rating_current, 21.7);
        assert_eq!(info.ac_output_rating_apparent_power, 5000);
        assert_eq!(info.ac_output_rating_active_power, 4000);
        assert_eq!(info.battery_rating_voltage, 48.0);
        assert_eq!(info.battery_recharge_voltage, 48.0);
        assert_eq!(info.battery_under_voltage, 47.5);
        assert_eq!(info.battery_bulk_voltage, 53.2);
        assert_eq!(info.battery_float_voltage, 51.9);
        assert_eq!(info.battery_type, BatteryType::User);
        assert_eq!(info.max_ac_charging_current, 30);
        assert_eq!(info.max_charging_current, 120);
        assert_eq!(info.input_voltage_range, VoltageRange::Appliance);
        assert_eq!(info.output_source_priority, OutputSourcePriority::UtilityFirst);
        assert_eq!(info.charger_source_priority, ChargerSourcePriority::SolarFirst);
        assert_eq!(info.parallel_max_number, 9);
        assert_eq!(info.machine_type, MachineType::OffGrid);
        assert_eq!(info.topology, Topology::Transformerless);
        assert_eq!(info.output_mode, OutputMode::Single);
        assert_eq!(info.battery_redischarge_voltage, 51.0);
        assert_eq!(info.parallel_pv_ok, ParallelPVOK::Any);
        assert_eq!(info.pv_power_balance, PVPowerBalance::InputPowerIsChargedPowerPlusLoad);
    }

    #[test]
    fn rating_info_rejects_short_response() {
        assert!(matches!(
            parse_rating_info("230.0 21.7 230.0"),
            Err(Error::Decode(_))
        ));
    }

    fn expected_flags() -> BTreeMap<DeviceFlag, FlagStatus> {
        let mut flags = BTreeMap::new();
        flags.insert(DeviceFlag::Buzzer, FlagStatus::Enabled);
        flags.insert(DeviceFlag::OverloadBypass, FlagStatus::Enabled);
        flags.insert(DeviceFlag::PowerSaving, FlagStatus::Enabled);
        flags.insert(DeviceFlag::DisplayTimeout, FlagStatus::Enabled);
        flags.insert(DeviceFlag::DataLogPopUp, FlagStatus::Enabled);
        flags.insert(DeviceFlag::OverloadRestart, FlagStatus::Disabled);
        flags.insert(DeviceFlag::OverTemperatureRestart, FlagStatus::Disabled);
        flags.insert(DeviceFlag::BacklightOn, FlagStatus::Disabled);
        flags.insert(DeviceFlag::PrimarySourceInterruptAlarm, FlagStatus::Disabled);
        flags.insert(DeviceFlag::FaultCodeRecord, FlagStatus::Disabled);
        flags
    }

    #[test]
    fn device_flags_parse_in_either_case() {
        assert_eq!(parse_device_flags("EABJKLDUVXYZ").unwrap(), expected_flags());
        assert_eq!(parse_device_flags("EabjklDuvxyz").unwrap(), expected_flags());
    }

    #[test]
    fn device_flags_sentinels_are_case_sensitive() {
        // Lowercase 'd' is not a sentinel and not a flag letter
        assert!(parse_device_flags("EabjkldUVXYZ").is_err());
        assert!(parse_device_flags("abjklDuvxyz").is_err());
        assert!(parse_device_flags("EABCDEF").is_err());
    }

    #[test]
    fn general_status_parses() {
        let resp = "230.0 50.0 231.0 49.9 0300 0250 010 460 57.50 012 100 0069 0014 103.8 57.45 00000 00110110 00 07 00856 010";
        let params = parse_device_status_params(resp).unwrap();

        assert_eq!(params.grid_voltage, 230.0);
        assert_eq!(params.grid_frequency, 50.0);
        assert_eq!(params.ac_output_voltage, 231.0);
        assert_eq!(params.ac_output_frequency, 49.9);
        assert_eq!(params.ac_output_apparent_power, 300);
        assert_eq!(params.ac_output_active_power, 250);
        assert_eq!(params.output_load_percent, 10);
        assert_eq!(params.bus_voltage, 460);
        assert_eq!(params.battery_voltage, 57.5);
        assert_eq!(params.battery_charging_current, 12);
        assert_eq!(params.battery_capacity, 100);
        assert_eq!(params.heat_sink_temperature, 69);
        assert_eq!(params.pv_input_current1, 14);
        assert_eq!(params.pv_input_voltage1, 103.8);
        assert_eq!(params.battery_voltage_scc1, 57.45);
        assert_eq!(params.battery_discharge_current, 0);
        assert!(!params.add_sbu_priority_version);
        assert!(!params.config_status_changed);
        assert!(params.scc_firmware_version_updated);
        assert!(params.load_on);
        assert!(!params.battery_voltage_steady_while_charging);
        assert!(params.charging_on);
        assert!(params.scc1_charging_on);
        assert!(!params.ac_charging_on);
        assert_eq!(params.fan_battery_voltage_offset, 0);
        assert_eq!(params.eeprom_version, "07");
        assert_eq!(params.pv_charging_power1, 856);
        assert!(!params.floating_mode_charging);
        assert!(params.switch_on);
    }

    #[test]
    fn general_status2_merges_into_copy() {
        let resp1 = "230.0 50.0 231.0 49.9 0300 0250 010 460 57.50 012 100 0069 0014 103.8 57.45 00000 00110110 00 07 00856 010";
        let resp2 = "0012 105.2 52.5 00840 11000000 0021 0900 0015 100.2 48.48 0790 01890";

        let first = parse_device_status_params(resp1).unwrap();
        let merged = parse_device_status_params2(resp2, &first).unwrap();

        // First-half fields survive
        assert_eq!(merged.grid_voltage, 230.0);
        assert_eq!(merged.eeprom_version, "07");
        assert!(merged.load_on);

        assert_eq!(merged.pv_input_current2, 12);
        assert_eq!(merged.pv_input_voltage2, 105.2);
        assert_eq!(merged.battery_voltage_scc2, 52.5);
        assert_eq!(merged.pv_charging_power2, 840);
        assert!(merged.scc2_charging_on);
        assert!(merged.scc3_charging_on);
        assert_eq!(merged.ac_charging_current, 21);
        assert_eq!(merged.ac_charging_power, 900);
        assert_eq!(merged.pv_input_current3, 15);
        assert_eq!(merged.pv_input_voltage3, 100.2);
        assert_eq!(merged.battery_voltage_scc3, 48.48);
        assert_eq!(merged.pv_charging_power3, 790);
        assert_eq!(merged.pv_total_charging_power, 1890);
    }

    #[test]
    fn general_status2_failure_leaves_original_untouched() {
        let resp1 = "230.0 50.0 231.0 49.9 0300 0250 010 460 57.50 012 100 0069 0014 103.8 57.45 00000 00110110 00 07 00856 010";
        let first = parse_device_status_params(resp1).unwrap();
        let before = first.clone();

        assert!(parse_device_status_params2("0012 105.2", &first).is_err());
        assert_eq!(first, before);
    }

    #[test]
    fn parallel_info_parses() {
        let resp = "1 92932004102443 B 00 237.0 50.02 237.0 50.02 0971 0710 018 51.4 012 100 103.8 010 1111 0892 009 10100010 1 2 060 120 10 04 000";
        let info = parse_parallel_info(resp, 0).unwrap();

        assert_eq!(info.index, 0);
        assert!(info.exists);
        assert_eq!(info.serial_number, "92932004102443");
        assert_eq!(info.device_mode, "B");
        assert_eq!(info.fault_code, 0);
        assert_eq!(info.grid_voltage, 237.0);
        assert_eq!(info.grid_frequency, 50.02);
        assert_eq!(info.ac_output_voltage, 237.0);
        assert_eq!(info.ac_output_frequency, 50.02);
        assert_eq!(info.ac_output_apparent_power, 971);
        assert_eq!(info.ac_output_active_power, 710);
        assert_eq!(info.load_percent, 18);
        assert_eq!(info.battery_voltage, 51.4);
        assert_eq!(info.battery_charging_current, 12);
        assert_eq!(info.battery_capacity, 100);
        assert_eq!(info.pv_input_voltage, 103.8);
        assert_eq!(info.total_charging_current, 10);
        assert_eq!(info.total_ac_output_apparent_power, 1111);
        assert_eq!(info.total_ac_output_active_power, 892);
        assert_eq!(info.total_output_percent, 9);
        assert!(info.scc1_ok);
        assert!(!info.ac_charging);
        assert!(info.scc1_charging);
        assert_eq!(info.battery_status, BatteryStatus::Normal);
        assert!(!info.line_loss);
        assert!(info.load_on);
        assert!(!info.configuration_changed);
        assert_eq!(info.output_mode, OutputMode::Parallel);
        assert_eq!(info.charger_source_priority, ChargerSourcePriority::SolarAndUtility);
        assert_eq!(info.max_charger_current, 60);
        assert_eq!(info.max_charger_range, 120);
        assert_eq!(info.max_ac_charger_current, 10);
        assert_eq!(info.pv_input_current, 4);
        assert_eq!(info.battery_discharge_current, 0);
    }

    #[test]
    fn parallel_info_rejects_reserved_battery_status() {
        // Bits 4..3 = 3 is outside the closed set
        let resp = "1 92932004102443 B 00 237.0 50.02 237.0 50.02 0971 0710 018 51.4 012 100 103.8 010 1111 0892 009 10111010 1 2 060 120 10 04 000";
        assert!(matches!(parse_parallel_info(resp, 0), Err(Error::Decode(_))));
    }

    #[test]
    fn warnings_parse() {
        assert_eq!(
            parse_warnings("00000000000000000000000000000000").unwrap(),
            Vec::<DeviceWarning>::new()
        );
        assert_eq!(
            parse_warnings("00010000000000100000000000000000").unwrap(),
            vec![DeviceWarning::WarnBusUnder, DeviceWarning::WarnBatteryShutdown]
        );
    }

    #[test]
    fn warnings_length_window() {
        // 31 flags is too few, 39 too many, 38 is the widest valid response
        assert!(parse_warnings(&"0".repeat(31)).is_err());
        assert!(parse_warnings(&"0".repeat(39)).is_err());
        assert!(parse_warnings(&"0".repeat(38)).is_ok());
    }

    #[test]
    fn device_flags_format_uppercase() {
        let enabled = [
            DeviceFlag::Buzzer,
            DeviceFlag::OverloadBypass,
            DeviceFlag::PowerSaving,
            DeviceFlag::DisplayTimeout,
            DeviceFlag::DataLogPopUp,
        ];
        assert_eq!(format_device_flags(&enabled, FlagStatus::Enabled), "PEABJKL");

        let disabled = [
            DeviceFlag::OverloadRestart,
            DeviceFlag::OverTemperatureRestart,
            DeviceFlag::BacklightOn,
            DeviceFlag::PrimarySourceInterruptAlarm,
            DeviceFlag::FaultCodeRecord,
        ];
        assert_eq!(format_device_flags(&disabled, FlagStatus::Disabled), "PDUVXYZ");
    }

    #[test]
    fn small_queries_decode() {
        let mut c = ScriptedConnector::respond_with(b"030");
        assert_eq!(cv_mode_charging_time(&mut c).unwrap(), 30);

        let mut c = ScriptedConnector::respond_with(b"0");
        assert!(!dsp_bootstrapped(&mut c).unwrap());

        let mut c = ScriptedConnector::respond_with(b"1");
        assert!(dsp_bootstrapped(&mut c).unwrap());

        let mut c = ScriptedConnector::respond_with(b"L");
        assert_eq!(device_mode(&mut c).unwrap(), "L");
    }
}
