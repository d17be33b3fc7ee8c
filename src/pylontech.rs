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

//! Pylontech battery codec and operations
// Reference documentation: Pylontech RS232 protocol rev 2.8 (PACE BMS derivative)

use crate::connector::{Connector, CR};
use crate::error::{Error, Result};
use log::debug;
use serde::{Deserialize, Serialize};

const START: u8 = 0x7e; // '~'

/// Protocol revision 2.8 as encoded on the wire
pub const PROTOCOL_VERSION: u8 = 0x20;
const DEFAULT_ADR: u8 = 0x01;
const BATTERY_CID1: u8 = 0x46;

/// Pack address polling every pack on the bus
pub const ALL_PACKS: u8 = 0xff;

// CID2 command codes. Only the first three have response decoders here;
// the others share the request framing (empty info) but their response
// layouts come from vendor documentation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    GetAnalogValue = 0x42,
    GetAlarmData = 0x44,
    GetSystemParameter = 0x47,
    GetProtocolVersion = 0x4f,
    GetManufacturerInfo = 0x51,
    GetChargeManagementInfo = 0x92,
    GetSeriesNumber = 0x93,
    SetChargeManagementInfo = 0x94,
    TurnOff = 0x95,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManufacturerInfo {
    pub device_name: String,
    pub software_version: String,
    pub manufacturer_name: String,
}

/// Analog values of a single pack
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatteryStatus {
    pub cell_count: u8,
    /// Per-cell voltage in volts
    pub cell_voltage: Vec<f32>,
    pub temp_count: u8,
    /// Temperatures in degrees Celsius
    pub temperature: Vec<f32>,
    /// Pack current in amps, negative while discharging
    pub current: f32,
    pub total_voltage: f32,
    /// Remaining capacity in Ah
    pub remaining_capacity: f32,
    /// Total capacity in Ah
    pub total_capacity: f32,
    pub cycles: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BatteryGroupStatus {
    pub flag: u8,
    pub count: u8,
    pub packs: Vec<BatteryStatus>,
}

/// One protocol frame. LEN and CHK are computed, never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub ver: u8,
    pub adr: u8,
    pub cid1: u8,
    pub cid2: u8,
    pub info: Vec<u8>,
}

impl Frame {
    pub fn request(command: Command, info: &[u8]) -> Frame {
        Frame {
            ver: PROTOCOL_VERSION,
            adr: DEFAULT_ADR,
            cid1: BATTERY_CID1,
            cid2: command as u8,
            info: info.to_vec(),
        }
    }

    /// Wire form `'~' VER ADR CID1 CID2 LEN INFO CHK CR`, every field
    /// uppercase hex
    pub fn encode(&self) -> Result<Vec<u8>> {
        let info_hex = hex::encode_upper(&self.info);
        let length = length_checksum(info_hex.len())?;
        let body = format!(
            "{:02X}{:02X}{:02X}{:02X}{:04X}{}",
            self.ver, self.adr, self.cid1, self.cid2, length, info_hex
        );
        let chk = frame_checksum(&body);

        let mut frame = Vec::with_capacity(body.len() + 6);
        frame.push(START);
        frame.extend_from_slice(body.as_bytes());
        frame.extend_from_slice(format!("{:04X}", chk).as_bytes());
        frame.push(CR);
        Ok(frame)
    }

    pub fn parse(raw: &[u8]) -> Result<Frame> {
        // Start byte + 12 header nibbles + 4 checksum nibbles + CR
        if raw.len() < 18 {
            return Err(Error::Framing(format!("frame too short, {} bytes", raw.len())));
        }
        if raw[0] != START {
            return Err(Error::Framing(format!("invalid frame start {:#04x}", raw[0])));
        }
        if raw[raw.len() - 1] != CR {
            return Err(Error::Framing(format!(
                "invalid frame end {:#04x}",
                raw[raw.len() - 1]
            )));
        }

        let body = std::str::from_utf8(&raw[1..raw.len() - 1])
            .map_err(|_| Error::Framing("frame is not ASCII".to_string()))?;
        let (content, chk_hex) = body.split_at(body.len() - 4);

        let received = u16::from_str_radix(chk_hex, 16)
            .map_err(|_| Error::Framing(format!("invalid checksum field {:?}", chk_hex)))?;
        let computed = frame_checksum(content);
        if received != computed {
            return Err(Error::Framing(format!(
                "checksum mismatch, received {:04X}, computed {:04X}",
                received, computed
            )));
        }

        let ver = hex_byte(&content[0..2])?;
        let adr = hex_byte(&content[2..4])?;
        let cid1 = hex_byte(&content[4..6])?;
        let cid2 = hex_byte(&content[6..8])?;
        let length = u16::from_str_radix(&content[8..12], 16)
            .map_err(|_| Error::Decode(format!("invalid length field {:?}", &content[8..12])))?;

        let info_hex = &content[12..];
        let nibbles = (length & 0x0fff) as usize;
        if info_hex.len() != nibbles {
            return Err(Error::Framing(format!(
                "info length mismatch, field says {} nibbles, got {}",
                nibbles,
                info_hex.len()
            )));
        }
        if length_checksum(nibbles)? != length {
            return Err(Error::Framing(format!("length checksum mismatch in {:04X}", length)));
        }

        let info = hex::decode(info_hex)
            .map_err(|_| Error::Decode("invalid info hex".to_string()))?;

        Ok(Frame {
            ver,
            adr,
            cid1,
            cid2,
            info,
        })
    }
}

fn hex_byte(field: &str) -> Result<u8> {
    u8::from_str_radix(field, 16).map_err(|_| Error::Decode(format!("invalid hex field {:?}", field)))
}

// 16-bit length field: low 12 bits hold the info nibble count, the high
// nibble is the two's complement of the nibble sum of the count.
fn length_checksum(len: usize) -> Result<u16> {
    if len > 0x0fff {
        return Err(Error::Framing(format!("info length {} exceeds the 12-bit field", len)));
    }
    if len == 0 {
        return Ok(0);
    }
    let n = len as u16;
    let sum = (n & 0x000f) + ((n >> 4) & 0x000f) + ((n >> 8) & 0x000f);
    let chk = (!(sum % 0x10)).wrapping_add(1) & 0x000f;
    Ok((chk << 12) | n)
}

// Two's complement of the ASCII sum of the body, modulo 2^16
fn frame_checksum(body: &str) -> u16 {
    let mut sum: u16 = 0;
    for b in body.to_ascii_uppercase().bytes() {
        sum = sum.wrapping_add(b as u16);
    }
    (!sum).wrapping_add(1)
}

// One request/response turn on an exclusively held transport. In a
// response frame CID2 carries the return code; non-zero is a rejection.
fn transact(c: &mut dyn Connector, request: &Frame) -> Result<Frame> {
    let encoded = request.encode()?;
    debug!("battery request {:02x?}", encoded);
    c.write_all(&encoded)?;

    let read = c.read_until(CR)?;
    debug!("battery response {:02x?}", read);
    let response = Frame::parse(&read)?;
    if response.cid2 != 0 {
        return Err(Error::NotAcknowledged(format!("battery RTN {:#04x}", response.cid2)));
    }
    Ok(response)
}

/// Protocol version byte reported by the battery
pub fn get_protocol_version(c: &mut dyn Connector) -> Result<u8> {
    let response = transact(c, &Frame::request(Command::GetProtocolVersion, &[]))?;
    Ok(response.ver)
}

pub fn get_manufacturer_info(c: &mut dyn Connector) -> Result<ManufacturerInfo> {
    let response = transact(c, &Frame::request(Command::GetManufacturerInfo, &[]))?;
    parse_manufacturer_info(&response.info)
}

/// Analog values for one pack, or the whole group with [`ALL_PACKS`]
pub fn get_battery_status(c: &mut dyn Connector, pack: u8) -> Result<BatteryGroupStatus> {
    let response = transact(c, &Frame::request(Command::GetAnalogValue, &[pack]))?;
    parse_battery_group_status(&response.info)
}

fn trimmed_ascii(bytes: &[u8]) -> Result<String> {
    let s = std::str::from_utf8(bytes)
        .map_err(|_| Error::Decode("name field is not ASCII".to_string()))?;
    Ok(s.trim_matches(|c: char| (c as u32) < 0x20).to_string())
}

fn parse_manufacturer_info(info: &[u8]) -> Result<ManufacturerInfo> {
    if info.len() < 12 {
        return Err(Error::Decode(format!(
            "manufacturer info has {} bytes, expected at least 12",
            info.len()
        )));
    }
    Ok(ManufacturerInfo {
        device_name: trimmed_ascii(&info[0..10])?,
        software_version: format!("{}{}", info[10], info[11]),
        manufacturer_name: trimmed_ascii(&info[12..])?,
    })
}

// Sequential reader over the info bytes. The pack layout is not
// self-delimiting, so every pack's stride comes from walking its own
// counts rather than from precomputed offsets.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Reader<'a> {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Decode(format!(
                "battery status truncated at byte {}",
                self.data.len()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

fn parse_battery_group_status(info: &[u8]) -> Result<BatteryGroupStatus> {
    let mut r = Reader::new(info);
    let flag = r.u8()?;
    let count = r.u8()?;
    let mut packs = Vec::with_capacity(count as usize);
    for _ in 0..count {
        packs.push(parse_battery_status(&mut r)?);
    }
    Ok(BatteryGroupStatus { flag, count, packs })
}

fn parse_battery_status(r: &mut Reader) -> Result<BatteryStatus> {
    let cell_count = r.u8()?;
    let mut cell_voltage = Vec::with_capacity(cell_count as usize);
    for _ in 0..cell_count {
        // millivolts
        cell_voltage.push(r.u16()? as f32 / 1000.0);
    }

    let temp_count = r.u8()?;
    let mut temperature = Vec::with_capacity(temp_count as usize);
    for _ in 0..temp_count {
        // deci-kelvin
        temperature.push((r.u16()? as f32 - 2731.0) / 10.0);
    }

    let current = r.i16()? as f32 / 100.0;
    let total_voltage = r.u16()? as f32 / 1000.0;
    let remaining16 = r.u16()?;
    let indicator = r.u8()?;

    let (remaining_capacity, total_capacity, cycles) = if indicator == 2 {
        // Legacy 16-bit capacities in mAh
        let total_capacity = r.u16()? as f32 / 1000.0;
        let cycles = r.u16()?;
        (remaining16 as f32 / 1000.0, total_capacity, cycles)
    } else {
        // Extended form: the 16-bit remaining field is the 0xFFFF sentinel
        // and a second 16-bit slot is unused; 24-bit capacities follow
        let _unused = r.u16()?;
        let cycles = r.u16()?;
        let remaining = r.u24()? as f32 / 1000.0;
        let total = r.u24()? as f32 / 1000.0;
        (remaining, total, cycles)
    };

    Ok(BatteryStatus {
        cell_count,
        cell_voltage,
        temp_count,
        temperature,
        current,
        total_voltage,
        remaining_capacity,
        total_capacity,
        cycles,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_checksum_known_values() {
        assert_eq!(length_checksum(0).unwrap(), 0);
        assert_eq!(length_checksum(18).unwrap(), 0xd012);
        assert!(length_checksum(5000).is_err());
    }

    #[test]
    fn length_checksum_low_bits_are_the_length() {
        for n in 1..=0x0fff {
            let length = length_checksum(n).unwrap();
            assert_eq!((length & 0x0fff) as usize, n);
            // High nibble is the nibble-sum complement
            let sum = (length & 0x000f) + ((length >> 4) & 0x000f) + ((length >> 8) & 0x000f);
            assert_eq!((length >> 12).wrapping_add(sum) & 0x000f, 0);
        }
    }

    #[test]
    fn frame_checksum_known_values() {
        assert_eq!(frame_checksum("1203400456abcefe"), 0xfc71);
        assert_eq!(frame_checksum("1203400456ABCEFE"), 0xfc71);
        assert_eq!(frame_checksum("2001464F0000"), 0xfd99);
        assert_eq!(frame_checksum("200146000000"), 0xfdb3);
    }

    #[test]
    fn frame_checksum_cancels_ascii_sum() {
        for body in ["1203400456ABCEFE", "2001464F0000", "200146000000"] {
            let sum: u16 = body.bytes().fold(0u16, |acc, b| acc.wrapping_add(b as u16));
            assert_eq!(frame_checksum(body).wrapping_add(sum), 0);
        }
    }

    #[test]
    fn protocol_version_request_encodes() {
        let frame = Frame::request(Command::GetProtocolVersion, &[]);
        assert_eq!(frame.encode().unwrap(), b"~2001464F0000FD99\r".to_vec());
    }

    #[test]
    fn protocol_version_response_parses_and_reencodes() {
        let raw = b"~200146000000FDB3\r";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.ver, 0x20);
        assert_eq!(frame.adr, 0x01);
        assert_eq!(frame.cid1, 0x46);
        assert_eq!(frame.cid2, 0x00);
        assert!(frame.info.is_empty());
        assert_eq!(frame.encode().unwrap(), raw.to_vec());
    }

    #[test]
    fn frame_round_trips_with_info() {
        let frame = Frame::request(Command::GetAnalogValue, &[ALL_PACKS]);
        let encoded = frame.encode().unwrap();
        assert_eq!(Frame::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn parse_rejects_corruption() {
        let mut raw = b"~200146000000FDB3\r".to_vec();
        raw[3] = b'9';
        assert!(matches!(Frame::parse(&raw), Err(Error::Framing(_))));

        assert!(matches!(Frame::parse(b"!200146000000FDB3\r"), Err(Error::Framing(_))));
        assert!(matches!(Frame::parse(b"~2001\r"), Err(Error::Framing(_))));
    }

    #[test]
    fn parse_cross_checks_the_length_field() {
        // LEN claims 16 info nibbles but none follow; checksum is valid
        let body = "200146000010";
        let raw = format!("~{}{:04X}\r", body, frame_checksum(body));
        assert!(matches!(Frame::parse(raw.as_bytes()), Err(Error::Framing(_))));
    }

    #[test]
    fn manufacturer_info_decodes() {
        let raw = b"~20014600C0405553324B42504C000000020150796C6F6E2D2D2D2D2D2D2D2D2D2D2D2D2D2D2DEF9B\r";
        let frame = Frame::parse(raw).unwrap();
        assert_eq!(frame.encode().unwrap(), raw.to_vec());

        let info = parse_manufacturer_info(&frame.info).unwrap();
        assert_eq!(
            info,
            ManufacturerInfo {
                device_name: "US2KBPL".to_string(),
                software_version: "21".to_string(),
                manufacturer_name: "Pylon---------------".to_string(),
            }
        );
    }

    #[test]
    fn group_status_decodes_legacy_capacities() {
        // Two US2000B packs reporting 16-bit capacities (indicator 2)
        let raw = b"~20014600B0D811020F0D6F0D6F0D6D0D6F0D6C0D6E0D6F0D6E0D760D780D760D780D770D780D76050BAF0B7D0B7D0B7D0B7D0000C9B2C35002C35000050F0DEE0DF80DF50DF20DF00DEE0DF60DF60E040E020E030E030E030E040E04050BB90B7D0B7D0B7D0B7D0000D1AEC35002C3500011CD77\r";
        let frame = Frame::parse(raw).unwrap();
        let group = parse_battery_group_status(&frame.info).unwrap();

        assert_eq!(group.flag, 0x11);
        assert_eq!(group.count, 2);
        assert_eq!(group.packs.len(), 2);

        let pack = &group.packs[0];
        assert_eq!(pack.cell_count, 15);
        assert_eq!(pack.cell_voltage.len(), 15);
        assert_eq!(pack.cell_voltage[0], 3.439);
        assert_eq!(pack.temp_count, 5);
        assert_eq!(pack.temperature.len(), 5);
        assert_eq!(pack.temperature[0], 26.0);
        assert_eq!(pack.current, 0.0);
        assert_eq!(pack.total_voltage, 51.634);
        assert_eq!(pack.remaining_capacity, 50.0);
        assert_eq!(pack.total_capacity, 50.0);
        assert_eq!(pack.cycles, 5);

        // The second pack's stride is walked from its own counts
        let pack = &group.packs[1];
        assert_eq!(pack.cell_count, 15);
        assert_eq!(pack.cell_voltage[0], 3.566);
        assert_eq!(pack.total_voltage, 53.678);
        assert_eq!(pack.cycles, 17);
    }

    #[test]
    fn group_status_decodes_extended_capacities() {
        // US3000A packs use the 24-bit form (indicator != 2)
        let raw = b"~2001460010F011020F0D1A0D220D220D200D1D0D210D1D0D190D1A0D1E0D210D1F0D1C0D1A0D1C050BB90BB90BB90BC30BB900BEC4BCFFFF04FFFF010A00BEC80121100F0D220D230D1F0D1C0D1C0D1C0D1C0D1A0D1C0D1D0D1D0D1C0D1C0D1C0D1D050BC30BB90BB90BB90BB900BDC4B5FFFF04FFFF010600B900012110C7D3\r";
        let frame = Frame::parse(raw).unwrap();
        let group = parse_battery_group_status(&frame.info).unwrap();

        assert_eq!(group.count, 2);
        let pack = &group.packs[0];
        assert_eq!(pack.current, 1.9);
        assert_eq!(pack.cycles, 266);
        assert_eq!(pack.remaining_capacity, 48.84);
        assert_eq!(pack.total_capacity, 74.0);
    }

    #[test]
    fn group_status_decodes_negative_current() {
        let raw = b"~2001460010F011020F0D6F0D780D770D770D740D740D740D720D7B0D790D7A0D7A0D790D7A0D77050BCD0BC30BC30BCD0BC3FFFEC9F5FFFF04FFFF010A0126D80121100F0D770D780D790D790D780D780D780D690D7A0D790D760D780D780D790D78050BCD0BC30BC30BCD0BC3FFFEC9FCFFFF04FFFF01060126D8012110C74C\r";
        let frame = Frame::parse(raw).unwrap();
        let group = parse_battery_group_status(&frame.info).unwrap();

        assert!(group.packs[0].current < 0.0);
        assert_eq!(group.packs[0].current, -0.02);
    }

    #[test]
    fn group_status_rejects_truncation() {
        // Claims one pack of 15 cells but the voltages are missing
        assert!(matches!(
            parse_battery_group_status(&[0x11, 0x01, 0x0f, 0x0d]),
            Err(Error::Decode(_))
        ));
    }
}
