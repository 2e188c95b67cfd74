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

//! The 24-byte packet record shared by the ADS-L/Legacy family: a
//! version byte, five little-endian 32-bit words, and a 24-bit CRC.
//! Fields live at fixed bit positions inside the words and are reached
//! through shift-and-mask accessors only. Packets are whitened before
//! the CRC is computed, so the CRC/descramble order is an interlock:
//! descramble word 0 first, then the rest of the keystream is known.

use processor::ownship::Ownship;
use sensor::TrafficData;
use super::*;
use utils::FEET_PER_METER;

/// version + five words + 24-bit CRC
pub const PACKET_SIZE: usize = 24;

/// CRC-24 polynomial of the family (both protocol descriptors carry it)
pub const CRC_POLY: u32 = 0xFF_F409;

const ADDRESS_MASK: u32 = 0x00FF_FFFF;
const FNT_MANTISSA_BITS: u32 = 25;
const FNT_MANTISSA_MASK: u32 = (1 << FNT_MANTISSA_BITS) - 1;

/// degrees to 1/600000-degree units
const FNT_UNITS_PER_DEG: f64 = 600_000.0;

const ALT_BIAS_M: i32 = 1000;
const ALT_MAX: i32 = 0x1FFF;

/// climb quantum on the wire, m/s
const CLIMB_LSB_MPS: f32 = 0.125;
/// track quantum on the wire, degrees (45/64)
const TRACK_LSB_DEG: f32 = 45.0 / 64.0;
/// speed quantum on the wire, knots
const SPEED_LSB_KTS: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Packet {
    pub version: u8,
    pub words: [u32; 5],
}

impl Packet {
    pub fn new(version: u8) -> Packet {
        Packet {
            version,
            words: [0; 5],
        }
    }

    fn field(&self, word: usize, shift: u32, bits: u32) -> u32 {
        (self.words[word] >> shift) & ((1 << bits) - 1)
    }

    fn set_field(&mut self, word: usize, shift: u32, bits: u32, value: u32) {
        let mask = ((1 << bits) - 1) << shift;
        self.words[word] = (self.words[word] & !mask) | ((value << shift) & mask);
    }

    pub fn address(&self) -> u32 {
        self.field(0, 0, 24)
    }
    pub fn set_address(&mut self, v: u32) {
        self.set_field(0, 0, 24, v & ADDRESS_MASK);
    }

    pub fn addr_type(&self) -> u8 {
        self.field(0, 24, 2) as u8
    }
    pub fn set_addr_type(&mut self, v: u8) {
        self.set_field(0, 24, 2, v as u32);
    }

    pub fn relay(&self) -> bool {
        self.field(0, 26, 1) != 0
    }
    pub fn set_relay(&mut self, v: bool) {
        self.set_field(0, 26, 1, v as u32);
    }

    pub fn flight_state(&self) -> u8 {
        self.field(0, 27, 2) as u8
    }
    pub fn set_flight_state(&mut self, v: u8) {
        self.set_field(0, 27, 2, v as u32);
    }

    pub fn hor_accuracy(&self) -> u8 {
        self.field(0, 29, 3) as u8
    }
    pub fn set_hor_accuracy(&mut self, v: u8) {
        self.set_field(0, 29, 3, v as u32);
    }

    pub fn lat_fnt(&self) -> u32 {
        self.field(1, 0, 28)
    }
    pub fn set_lat_fnt(&mut self, v: u32) {
        self.set_field(1, 0, 28, v);
    }

    pub fn aircraft_type(&self) -> u8 {
        self.field(1, 28, 4) as u8
    }
    pub fn set_aircraft_type(&mut self, v: u8) {
        self.set_field(1, 28, 4, v as u32);
    }

    pub fn lon_fnt(&self) -> u32 {
        self.field(2, 0, 28)
    }
    pub fn set_lon_fnt(&mut self, v: u32) {
        self.set_field(2, 0, 28, v);
    }

    pub fn altitude(&self) -> i32 {
        self.field(3, 0, 13) as i32 - ALT_BIAS_M
    }
    pub fn set_altitude(&mut self, metres: i32) {
        let mut v = metres + ALT_BIAS_M;
        if v < 0 {
            v = 0;
        }
        if v > ALT_MAX {
            v = ALT_MAX;
        }
        self.set_field(3, 0, 13, v as u32);
    }

    pub fn climb(&self) -> i32 {
        let v = self.field(3, 13, 9);
        if v & 0x100 != 0 {
            (v | !0x1FF_u32) as i32
        } else {
            v as i32
        }
    }
    pub fn set_climb(&mut self, counts: i32) {
        let c = clamp_i32(counts, -256, 255);
        self.set_field(3, 13, 9, (c as u32) & 0x1FF);
    }

    pub fn track(&self) -> u32 {
        self.field(3, 22, 9)
    }
    pub fn set_track(&mut self, counts: u32) {
        self.set_field(3, 22, 9, counts & 0x1FF);
    }

    pub fn speed(&self) -> u32 {
        self.field(4, 0, 10)
    }
    pub fn set_speed(&mut self, counts: u32) {
        let c = if counts > 0x3FF { 0x3FF } else { counts };
        self.set_field(4, 0, 10, c);
    }

    pub fn second(&self) -> u8 {
        self.field(4, 10, 6) as u8
    }
    pub fn set_second(&mut self, v: u8) {
        self.set_field(4, 10, 6, (v % 60) as u32);
    }

    /// XOR-whiten the five words. Word 0 is keyed by (version, key)
    /// only, so the receiver can recover the address before deriving
    /// the rest of the keystream; words 1..5 are keyed by the plain
    /// address too. Applying the transform twice is the identity.
    pub fn scramble(&mut self, key: &[u32; 4], salt: u32) {
        let addr = self.address();
        self.words[0] ^= keystream_word(0, 0, self.version, key, salt);
        for i in 1..5 {
            self.words[i] ^= keystream_word(i as u32, addr, self.version, key, salt);
        }
    }

    pub fn descramble(&mut self, key: &[u32; 4], salt: u32) {
        // word 0 first; the rest of the keystream needs the address
        self.words[0] ^= keystream_word(0, 0, self.version, key, salt);
        let addr = self.address();
        for i in 1..5 {
            self.words[i] ^= keystream_word(i as u32, addr, self.version, key, salt);
        }
    }

    pub fn crc(&self) -> u32 {
        let bytes = self.header_bytes();
        crc24(&bytes)
    }

    fn header_bytes(&self) -> [u8; 21] {
        let mut out = [0_u8; 21];
        out[0] = self.version;
        for (i, w) in self.words.iter().enumerate() {
            out[1 + 4 * i] = (*w & 0xFF) as u8;
            out[2 + 4 * i] = ((*w >> 8) & 0xFF) as u8;
            out[3 + 4 * i] = ((*w >> 16) & 0xFF) as u8;
            out[4 + 4 * i] = ((*w >> 24) & 0xFF) as u8;
        }
        out
    }

    /// Wire image: version, five LE words, CRC big-endian.
    pub fn to_bytes(&self) -> [u8; PACKET_SIZE] {
        let mut out = [0_u8; PACKET_SIZE];
        out[..21].copy_from_slice(&self.header_bytes());
        let crc = self.crc();
        out[21] = ((crc >> 16) & 0xFF) as u8;
        out[22] = ((crc >> 8) & 0xFF) as u8;
        out[23] = (crc & 0xFF) as u8;
        out
    }

    /// Parse a wire image and verify its CRC. The words are still
    /// scrambled at this point.
    pub fn from_bytes(bytes: &[u8]) -> Option<Packet> {
        if bytes.len() < PACKET_SIZE {
            return None;
        }
        let mut p = Packet::new(bytes[0]);
        for i in 0..5 {
            p.words[i] = bytes[1 + 4 * i] as u32
                | (bytes[2 + 4 * i] as u32) << 8
                | (bytes[3 + 4 * i] as u32) << 16
                | (bytes[4 + 4 * i] as u32) << 24;
        }
        let wire_crc = (bytes[21] as u32) << 16 | (bytes[22] as u32) << 8 | bytes[23] as u32;
        if p.crc() != wire_crc {
            return None;
        }
        Some(p)
    }
}

fn clamp_i32(v: i32, min: i32, max: i32) -> i32 {
    if v < min {
        min
    } else if v > max {
        max
    } else {
        v
    }
}

fn keystream_word(index: u32, addr: u32, version: u8, key: &[u32; 4], salt: u32) -> u32 {
    let mut state = salt
        ^ addr.wrapping_mul(0x9E37_79B9)
        ^ ((version as u32) << 24)
        ^ index.wrapping_mul(0x85EB_CA6B);
    for i in 0..4 {
        state ^= key[i];
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
    }
    state
}

/// CRC-24, init 0, MSB first.
pub fn crc24(data: &[u8]) -> u32 {
    let mut crc: u32 = 0;
    for &b in data {
        crc ^= (b as u32) << 16;
        for _ in 0..8 {
            crc <<= 1;
            if crc & 0x100_0000 != 0 {
                crc ^= CRC_POLY;
            }
        }
    }
    crc & 0xFF_FFFF
}

/// Encode signed 1/600000-degree units as sign + exponent + mantissa.
/// Small magnitudes keep full resolution; the exponent grows the range
/// out to the full circle at a worst-case cost of 2 units.
pub fn fnt_encode(units: i32) -> u32 {
    let neg = units < 0;
    let mut m = units.wrapping_abs() as u32;
    let mut exp = 0;
    while m > FNT_MANTISSA_MASK && exp < 3 {
        m >>= 1;
        exp += 1;
    }
    (neg as u32) << 27 | exp << FNT_MANTISSA_BITS | (m & FNT_MANTISSA_MASK)
}

pub fn fnt_decode(fnt: u32) -> i32 {
    let m = fnt & FNT_MANTISSA_MASK;
    let exp = (fnt >> FNT_MANTISSA_BITS) & 0x03;
    let mut v = (m << exp) as i32;
    if exp > 0 {
        // midpoint of the truncated interval
        v |= 1 << (exp - 1);
    }
    if fnt & (1 << 27) != 0 {
        -v
    } else {
        v
    }
}

pub fn deg_to_fnt(deg: f64) -> u32 {
    fnt_encode((deg * FNT_UNITS_PER_DEG).round() as i32)
}

pub fn fnt_to_deg(fnt: u32) -> f64 {
    fnt_decode(fnt) as f64 / FNT_UNITS_PER_DEG
}

fn hor_accuracy_class(hdop_x10: u16) -> u8 {
    match hdop_x10 {
        0...12 => 0,
        13...25 => 1,
        26...50 => 2,
        51...100 => 3,
        101...200 => 4,
        201...400 => 5,
        401...800 => 6,
        _ => 7,
    }
}

/// Fill the record fields from the ownship state. Shared by both
/// codecs of the family; only version, salt and framing differ.
pub fn encode_with(desc: &'static ProtoDesc, own: &Ownship, key: &[u32; 4]) -> [u8; PACKET_SIZE] {
    let mut p = Packet::new(desc.version);

    p.set_address(own.addr);
    p.set_addr_type(own.addr_type & 0x03);
    p.set_relay(false);

    // the protocol has no WINCH type
    let mut aircraft_type = own.aircraft_type;
    let mut airborne = own.airborne;
    if aircraft_type == AIRCRAFT_TYPE_WINCH {
        aircraft_type = AIRCRAFT_TYPE_STATIC;
        airborne = true;
    }
    p.set_aircraft_type(aircraft_type & 0x0F);
    p.set_flight_state(if airborne {
        FLIGHT_STATE_AIRBORNE
    } else {
        FLIGHT_STATE_GROUND
    });

    p.set_lat_fnt(deg_to_fnt(own.latitude));
    p.set_lon_fnt(deg_to_fnt(own.longitude));
    p.set_altitude(own.altitude.round() as i32);

    let vs_mps = if own.stealth {
        0.0
    } else {
        own.vs / (FEET_PER_METER * 60.0)
    };
    p.set_climb((vs_mps / CLIMB_LSB_MPS).round() as i32);

    let mut track = own.course;
    while track < 0.0 {
        track += 360.0;
    }
    p.set_track(((track / TRACK_LSB_DEG).round() as u32) & 0x1FF);
    p.set_speed((own.speed / SPEED_LSB_KTS).round() as u32);
    p.set_hor_accuracy(hor_accuracy_class(own.hdop));

    // seconds-of-minute carries the leap correction so receivers with a
    // healthy almanac see the true second
    let mut second = own.second as i32 - own.leap_correction as i32;
    if second < 0 {
        second += 60;
    }
    if second > 59 {
        second -= 60;
    }
    p.set_second(second as u8);

    p.scramble(key, desc.salt);
    p.to_bytes()
}

/// Re-encode a peer's state on its behalf, with the relay bit set and
/// the peer's address type carried through.
pub fn encode_relay_with(
    desc: &'static ProtoDesc,
    peer: &TrafficData,
    key: &[u32; 4],
) -> [u8; PACKET_SIZE] {
    let mut p = Packet::new(desc.version);

    p.set_address(peer.addr);
    p.set_addr_type(peer.addr_type & 0x03);
    p.set_relay(true);

    let mut aircraft_type = peer.aircraft_type;
    if aircraft_type == AIRCRAFT_TYPE_WINCH {
        aircraft_type = AIRCRAFT_TYPE_STATIC;
    }
    p.set_aircraft_type(aircraft_type & 0x0F);
    p.set_flight_state(FLIGHT_STATE_AIRBORNE);

    p.set_lat_fnt(deg_to_fnt(peer.latitude));
    p.set_lon_fnt(deg_to_fnt(peer.longitude));
    p.set_altitude(peer.altitude.round() as i32);
    p.set_climb((peer.vs / (FEET_PER_METER * 60.0) / CLIMB_LSB_MPS).round() as i32);

    let mut track = peer.course;
    while track < 0.0 {
        track += 360.0;
    }
    p.set_track(((track / TRACK_LSB_DEG).round() as u32) & 0x1FF);
    p.set_speed((peer.speed / SPEED_LSB_KTS).round() as u32);
    p.set_second(peer.second_of_minute);

    p.scramble(key, desc.salt);
    p.to_bytes()
}

/// Descramble, CRC-check and unpack one received frame. Address-level
/// rejection (ownship echo, ignore list, duplicates) belongs to the
/// layers that know those addresses.
pub fn decode_with(
    desc: &'static ProtoDesc,
    bytes: &[u8],
    key: &[u32; 4],
    now_ms: u32,
) -> Option<TrafficData> {
    let mut p = Packet::from_bytes(bytes)?;
    if p.version != desc.version {
        return None;
    }
    let crc = p.crc();
    p.descramble(key, desc.salt);

    Some(TrafficData {
        protocol: desc.protocol,
        addr: p.address(),
        addr_type: p.addr_type(),
        aircraft_type: p.aircraft_type(),
        latitude: fnt_to_deg(p.lat_fnt()),
        longitude: fnt_to_deg(p.lon_fnt()),
        altitude: p.altitude() as f32,
        course: p.track() as f32 * TRACK_LSB_DEG,
        speed: p.speed() as f32 * SPEED_LSB_KTS,
        vs: p.climb() as f32 * CLIMB_LSB_MPS * FEET_PER_METER * 60.0,
        hor_accuracy: p.hor_accuracy(),
        second_of_minute: p.second(),
        relayed: p.relay(),
        crc,
        rx_ms: now_ms,
    })
}

pub fn encode(own: &Ownship, key: &[u32; 4]) -> [u8; PACKET_SIZE] {
    encode_with(&ADSL_PROTO, own, key)
}

pub fn encode_relay(peer: &TrafficData, key: &[u32; 4]) -> [u8; PACKET_SIZE] {
    encode_relay_with(&ADSL_PROTO, peer, key)
}

pub fn decode(bytes: &[u8], key: &[u32; 4], now_ms: u32) -> Option<TrafficData> {
    decode_with(&ADSL_PROTO, bytes, key, now_ms)
}
