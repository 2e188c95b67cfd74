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

//! Folds fix events into the ownship state the codec encodes from.

use super::*;
use sensor::FixEvent;
use settings::Settings;

/// ground speed above which the aircraft is considered flying
const AIRBORNE_KTS: f32 = 4.0;
/// and below which it is considered back on the ground
const GROUNDED_KTS: f32 = 1.5;
const AIRBORNE_FIXES: u8 = 3;
const GROUNDED_FIXES: u8 = 10;

#[derive(PartialEq, Debug, Default, Copy, Clone)]
pub struct Ownship {
    pub valid: bool,
    pub addr: u32,
    pub addr_type: u8,
    pub aircraft_type: u8,
    /// Latitude in deg
    pub latitude: f64,
    /// Longitude in deg
    pub longitude: f64,
    /// Height above WGS-84 ellipsoid in metres
    pub altitude: f32,
    pub pressure_altitude: Option<f32>,
    /// Ground speed in kts
    pub speed: f32,
    /// Track in degrees true
    pub course: f32,
    /// Vertical speed in feet per minute
    pub vs: f32,
    pub hdop: u16,
    pub airborne: bool,
    /// GNSS seconds of the minute at the last fix
    pub second: u8,
    pub leap_correction: i8,
    pub stealth: bool,
    /// monotonic ms of the last folded fix
    pub fix_ms: u32,
}

pub struct OwnshipProcessor {
    state: Ownship,
    prev_alt: Option<(f32, u32)>,
    airborne_count: u8,
    grounded_count: u8,
}

impl OwnshipProcessor {
    pub fn new(settings: &Settings) -> Box<Processor> {
        let mut state = Ownship::default();
        state.addr = settings.aircraft_id;
        state.addr_type = settings.id_method;
        state.aircraft_type = settings.acft_type;
        state.stealth = settings.stealth != 0;

        Box::new(OwnshipProcessor {
            state,
            prev_alt: None,
            airborne_count: 0,
            grounded_count: 0,
        })
    }

    fn fold(&mut self, f: &FixEvent, now_ms: u32) {
        let s = &mut self.state;
        s.latitude = f.latitude;
        s.longitude = f.longitude;
        s.pressure_altitude = f.pressure_altitude;
        s.speed = f.speed;
        s.course = f.course;
        s.hdop = f.hdop;
        s.second = f.time.2;
        s.leap_correction = f.leap_correction;
        s.fix_ms = now_ms;

        // climb rate from consecutive fixes, lightly smoothed
        if let Some((alt, ms)) = self.prev_alt {
            let dt = f.commit_ms.wrapping_sub(ms);
            if dt > 0 && dt < 5000 {
                let fpm = m_to_ft!(f.altitude - alt) * 60_000.0 / dt as f32;
                s.vs = 0.7 * s.vs + 0.3 * fpm;
            }
        }
        self.prev_alt = Some((f.altitude, f.commit_ms));
        s.altitude = f.altitude;

        if f.speed >= AIRBORNE_KTS {
            self.grounded_count = 0;
            if self.airborne_count < AIRBORNE_FIXES {
                self.airborne_count += 1;
                if self.airborne_count == AIRBORNE_FIXES {
                    info!("airborne");
                    s.airborne = true;
                }
            }
        } else if f.speed < GROUNDED_KTS && s.airborne {
            self.airborne_count = 0;
            if self.grounded_count < GROUNDED_FIXES {
                self.grounded_count += 1;
                if self.grounded_count == GROUNDED_FIXES {
                    info!("landed");
                    s.airborne = false;
                }
            }
        } else {
            self.airborne_count = 0;
            self.grounded_count = 0;
        }

        s.valid = true;
    }
}

impl Processor for OwnshipProcessor {
    fn run(&mut self, handle: &mut Pushable<Report>, i: ChainedIter) {
        let now_ms = handle.get_ms();
        let mut had_fix = false;

        for e in i {
            if let SensorData::Fix(ref f) = *e {
                self.fold(f, now_ms);
                had_fix = true;
            }
        }

        // a stale fix invalidates the state until the stream recovers
        if self.state.valid && now_ms.wrapping_sub(self.state.fix_ms) > 3500 {
            self.state.valid = false;
        }

        if had_fix || self.state.valid {
            handle.push_data(Report::Ownship(self.state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squitter::handle::{BasicHandle, PushableHandle};
    use std::collections::VecDeque;

    fn fix(commit_ms: u32, speed_kts: f32, altitude: f32) -> FixEvent {
        FixEvent {
            latitude: 52.5,
            longitude: 13.5,
            altitude,
            pressure_altitude: None,
            speed: speed_kts,
            course: 90.0,
            hdop: 12,
            satellites: 9,
            geoid_separation: 45.0,
            date: (1, 1, 25),
            time: (12, 0, (commit_ms / 1000 % 60) as u8, 0),
            commit_ms,
            age_ms: 40,
            time_from_rmc: false,
            leap_correction: 0,
        }
    }

    fn run_pass(p: &mut Box<Processor>, events: Vec<SensorData>, now_ms: u32) -> Option<Ownship> {
        let mut q = VecDeque::new();
        {
            let mut b = BasicHandle::with_ms(50, now_ms);
            let mut h = PushableHandle::new(&mut b, &mut q);
            let empty: Vec<SensorData> = vec![];
            p.run(&mut h, events.as_slice().iter().chain(empty.as_slice().iter()));
        }
        for r in q {
            if let Report::Ownship(o) = r {
                return Some(o);
            }
        }
        None
    }

    #[test]
    fn test_fold_and_identity() {
        let mut settings = Settings::default();
        settings.aircraft_id = 0xDD1234;
        settings.acft_type = 1;
        let mut p = OwnshipProcessor::new(&settings);

        let o = run_pass(&mut p, vec![SensorData::Fix(fix(10_000, 0.0, 500.0))], 10_050).unwrap();
        assert!(o.valid);
        assert_eq!(o.addr, 0xDD1234);
        assert_eq!(o.latitude, 52.5);
        assert_eq!(o.second, 10);
        assert!(!o.airborne);
    }

    #[test]
    fn test_airborne_latches_after_consecutive_fast_fixes() {
        let mut p = OwnshipProcessor::new(&Settings::default());

        let mut o = None;
        for n in 0..3 {
            let t = 10_000 + n * 1000;
            o = run_pass(&mut p, vec![SensorData::Fix(fix(t, 30.0, 500.0))], t + 50);
        }
        assert!(o.unwrap().airborne);

        // one slow fix does not unlatch
        let o = run_pass(&mut p, vec![SensorData::Fix(fix(14_000, 0.5, 500.0))], 14_050);
        assert!(o.unwrap().airborne);
    }

    #[test]
    fn test_climb_rate_from_altitude_deltas() {
        let mut p = OwnshipProcessor::new(&Settings::default());

        run_pass(&mut p, vec![SensorData::Fix(fix(10_000, 30.0, 500.0))], 10_050);
        // +2 m over one second is about +394 fpm; smoothing admits 30%
        let o = run_pass(&mut p, vec![SensorData::Fix(fix(11_000, 30.0, 502.0))], 11_050).unwrap();
        assert!((o.vs - 118.1).abs() < 1.0, "vs = {}", o.vs);
    }

    #[test]
    fn test_stale_fix_invalidates() {
        let mut p = OwnshipProcessor::new(&Settings::default());
        run_pass(&mut p, vec![SensorData::Fix(fix(10_000, 0.0, 500.0))], 10_050);

        let o = run_pass(&mut p, vec![], 15_000);
        assert!(o.is_none());
    }
}
