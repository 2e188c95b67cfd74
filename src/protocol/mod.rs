// Squitter - a time-synchronized traffic beacon core for light aircraft
// Copyright (C) 2024-2025  The Squitter Authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

pub mod adsl;
pub mod legacy;

pub const PROTOCOL_ADSL: u8 = 1;
pub const PROTOCOL_LEGACY: u8 = 2;

/// Max payload size across the supported protocols.
pub const MAX_PKT_SIZE: usize = 32;

pub const AIRCRAFT_TYPE_GLIDER: u8 = 0x1;
pub const AIRCRAFT_TYPE_TOWPLANE: u8 = 0x2;
pub const AIRCRAFT_TYPE_HELICOPTER: u8 = 0x3;
pub const AIRCRAFT_TYPE_HANGGLIDER: u8 = 0x6;
pub const AIRCRAFT_TYPE_PARAGLIDER: u8 = 0x7;
pub const AIRCRAFT_TYPE_POWERED: u8 = 0x8;
pub const AIRCRAFT_TYPE_BALLOON: u8 = 0xB;
pub const AIRCRAFT_TYPE_STATIC: u8 = 0xF;
/// No wire representation; encoded as STATIC, forced airborne.
pub const AIRCRAFT_TYPE_WINCH: u8 = 0x10;

pub const FLIGHT_STATE_UNKNOWN: u8 = 0;
pub const FLIGHT_STATE_GROUND: u8 = 1;
pub const FLIGHT_STATE_AIRBORNE: u8 = 2;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Modulation {
    Fsk2,
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Whitening {
    Manchester,
    Pn9,
}

/// A transmit window relative to the PPS edge, in milliseconds.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct Slot {
    pub begin: u16,
    pub end: u16,
}

impl Slot {
    pub fn duration(&self) -> u16 {
        self.end - self.begin
    }
}

/// Everything the radio and the scheduler need to know about one
/// protocol on the air.
pub struct ProtoDesc {
    pub name: &'static str,
    pub protocol: u8,
    /// wire version byte of the packet record
    pub version: u8,
    /// per-protocol whitening salt
    pub salt: u32,
    pub modulation: Modulation,
    pub bitrate: u32,
    pub deviation_hz: u32,
    pub whitening: Whitening,
    pub bandwidth_hz: u32,
    pub syncword: &'static [u8],
    pub crc_poly: u32,
    pub payload_size: usize,
    /// on-air duration of one packet at the declared modulation
    pub air_time_ms: u16,
    pub tx_interval_min_ms: u16,
    pub tx_interval_max_ms: u16,
    pub slot0: Slot,
    pub slot1: Slot,
}

pub static ADSL_PROTO: ProtoDesc = ProtoDesc {
    name: "ADS-L",
    protocol: PROTOCOL_ADSL,
    version: 0x02,
    salt: 0x41D5_3C2B,
    modulation: Modulation::Fsk2,
    bitrate: 100_000,
    deviation_hz: 50_000,
    whitening: Whitening::Manchester,
    bandwidth_hz: 125_000,
    syncword: &[0x72, 0x4B],
    crc_poly: adsl::CRC_POLY,
    payload_size: adsl::PACKET_SIZE,
    // 24 payload + preamble + sync, Manchester-doubled, at 100 kbps
    air_time_ms: 5,
    tx_interval_min_ms: 600,
    tx_interval_max_ms: 1400,
    slot0: Slot { begin: 400, end: 800 },
    slot1: Slot { begin: 800, end: 1200 },
};

pub static LEGACY_PROTO: ProtoDesc = ProtoDesc {
    name: "Legacy",
    protocol: PROTOCOL_LEGACY,
    version: 0x01,
    salt: 0x6D7E_90A1,
    modulation: Modulation::Fsk2,
    bitrate: 100_000,
    deviation_hz: 50_000,
    whitening: Whitening::Manchester,
    bandwidth_hz: 125_000,
    syncword: &[0x55, 0x99, 0xA5, 0xA9, 0x55, 0x66, 0x65, 0x96],
    crc_poly: adsl::CRC_POLY,
    payload_size: adsl::PACKET_SIZE,
    air_time_ms: 5,
    tx_interval_min_ms: 600,
    tx_interval_max_ms: 1400,
    slot0: Slot { begin: 400, end: 800 },
    slot1: Slot { begin: 800, end: 1200 },
};

pub fn descriptor(protocol: u8) -> &'static ProtoDesc {
    match protocol {
        PROTOCOL_LEGACY => &LEGACY_PROTO,
        _ => &ADSL_PROTO,
    }
}
