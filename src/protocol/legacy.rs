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

//! The Legacy variant of the packet family. Same record layout and CRC
//! discipline as ADS-L; its own version byte, sync word and whitening
//! salt, so frames of the two protocols never decode into each other.

use processor::ownship::Ownship;
use sensor::TrafficData;
use super::adsl::{self, PACKET_SIZE};
use super::*;

pub fn encode(own: &Ownship, key: &[u32; 4]) -> [u8; PACKET_SIZE] {
    adsl::encode_with(&LEGACY_PROTO, own, key)
}

pub fn encode_relay(peer: &TrafficData, key: &[u32; 4]) -> [u8; PACKET_SIZE] {
    adsl::encode_relay_with(&LEGACY_PROTO, peer, key)
}

pub fn decode(bytes: &[u8], key: &[u32; 4], now_ms: u32) -> Option<TrafficData> {
    adsl::decode_with(&LEGACY_PROTO, bytes, key, now_ms)
}
