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

pub mod gnss;

use squitter::handle::Pushable;
use self::gnss::nmea::{Dmy, Hmsc};

/// A committed GGA+RMC pair for one UTC second.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct FixEvent {
    /// signed decimal degrees
    pub latitude: f64,
    pub longitude: f64,
    /// metres above the WGS-84 ellipsoid (MSL + geoid separation)
    pub altitude: f32,
    pub pressure_altitude: Option<f32>,
    /// knots
    pub speed: f32,
    /// degrees clockwise from true north
    pub course: f32,
    /// dimensionless x10
    pub hdop: u16,
    pub satellites: u8,
    pub geoid_separation: f32,
    pub date: Dmy,
    pub time: Hmsc,
    /// monotonic ms of the first time-commit of the pair
    pub commit_ms: u32,
    /// ms between that commit and emission of this event
    pub age_ms: u32,
    /// whether RMC was the first sentence of the pair to commit
    pub time_from_rmc: bool,
    /// configured minus GNSS-reported leap seconds, 0 when almanac valid
    pub leap_correction: i8,
}

/// One decoded (or simulated) traffic packet.
#[derive(PartialEq, Debug, Copy, Clone)]
pub struct TrafficData {
    pub protocol: u8,
    pub addr: u32,
    pub addr_type: u8,
    pub aircraft_type: u8,
    pub latitude: f64,
    pub longitude: f64,
    /// metres above ellipsoid
    pub altitude: f32,
    /// degrees
    pub course: f32,
    /// knots
    pub speed: f32,
    /// feet per minute
    pub vs: f32,
    pub hor_accuracy: u8,
    pub second_of_minute: u8,
    pub relayed: bool,
    /// CRC of the frame this came from, for duplicate suppression
    pub crc: u32,
    pub rx_ms: u32,
}

#[derive(PartialEq, Debug)]
/// What the sensor layer hands to the processors: an ownship fix for
/// one UTC second, or one aircraft heard on the air. Decoded radio
/// frames re-enter the pipeline through this enum too.
pub enum SensorData {
    Fix(FixEvent),
    Traffic(TrafficData),
}

/// An input source the pipeline polls once per cooperative pass.
pub trait Sensor {
    /// Drain whatever the source has ready; zero or more events may
    /// come out of a single pass.
    fn run(&mut self, h: &mut Pushable<SensorData>);

    /// Release the underlying device on graceful shutdown
    fn shutdown(&mut self) {}
}
