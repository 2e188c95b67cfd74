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

//! The GNSS sensor: drains the serial port, feeds the NMEA parser, and
//! decides in one place when a "new fix" has been obtained. A fix event
//! fires only when the GGA and RMC of the same second have both
//! committed; the first time-commit of the pair pins the millisecond the
//! time base will correct back to the true second.

pub mod chips;
pub mod nmea;

use self::chips::{GnssChip, GnssId, GnssPort, LeapSeconds};
use self::nmea::{CustomHandle, NmeaParser};
use sensor::{FixEvent, Sensor, SensorData, TrafficData};
use settings::{Settings, SettingsStore, DEBUG_SIMULATE};
use squitter::handle::Pushable;
use utils::{FEET_PER_METER, MPS_PER_KNOT};

/// Both sentences of a pair must land within this window.
const PAIR_WINDOW_MS: u32 = 600;
/// Location, altitude and date must each have committed this recently.
const NMEA_EXP_TIME_MS: u32 = 3500;
/// An "empty" GGA (no lock yet) is shorter than this.
const MIN_GGA_LEN: usize = 40;
const MAX_SENTENCE_LEN: usize = 250;

struct Pfsim {
    timestamp: CustomHandle,
    addr: CustomHandle,
    addrtype: CustomHandle,
    actype: CustomHandle,
    lat: CustomHandle,
    lon: CustomHandle,
    alt: CustomHandle,
    speed: CustomHandle,
    course: CustomHandle,
    vs: CustomHandle,
    turnrate: CustomHandle,
    pending: Option<(u32, TrafficData)>,
}

impl Pfsim {
    fn register(parser: &mut NmeaParser) -> Pfsim {
        let s = "PFSIM";
        let mut term = 0;
        let mut next = || {
            term += 1;
            term
        };
        Pfsim {
            timestamp: parser.register_custom(s, next()),
            addr: parser.register_custom(s, next()),
            addrtype: parser.register_custom(s, next()),
            actype: parser.register_custom(s, next()),
            lat: parser.register_custom(s, next()),
            lon: parser.register_custom(s, next()),
            alt: parser.register_custom(s, next()),
            speed: parser.register_custom(s, next()),
            course: parser.register_custom(s, next()),
            vs: parser.register_custom(s, next()),
            turnrate: parser.register_custom(s, next()),
            pending: None,
        }
    }
}

pub struct GnssSource {
    port: Box<GnssPort>,
    parser: NmeaParser,
    chip: Box<GnssChip>,
    chip_id: GnssId,
    leap: LeapSeconds,
    settings: Settings,
    store: Option<SettingsStore>,

    line: Vec<u8>,

    prev_fix_ms: u32,
    new_gga_ms: u32,
    new_rmc_ms: u32,
    latest_commit_ms: u32,
    old_sec: u8,
    bad_gga: bool,
    time_from_rmc: bool,

    pfsim: Option<Pfsim>,
}

impl GnssSource {
    /// Probe the connected module and bring it into service.
    pub fn new(
        mut port: Box<GnssPort>,
        settings: Settings,
        store: Option<SettingsStore>,
    ) -> Option<GnssSource> {
        let (chip_id, mut chip) = chips::probe_chip(&mut *port);
        if chip_id == GnssId::None {
            return None;
        }
        info!("GNSS type found: {}", chip.name());
        chip.setup(&mut *port, &settings);
        Some(GnssSource::with_chip(port, chip_id, chip, settings, store))
    }

    /// Skip probing; used with an already-identified chip and by tests.
    pub fn with_chip(
        port: Box<GnssPort>,
        chip_id: GnssId,
        chip: Box<GnssChip>,
        settings: Settings,
        store: Option<SettingsStore>,
    ) -> GnssSource {
        let mut parser = NmeaParser::new();
        let pfsim = if settings.debug_flags & DEBUG_SIMULATE != 0 {
            Some(Pfsim::register(&mut parser))
        } else {
            None
        };

        GnssSource {
            port,
            parser,
            chip,
            chip_id,
            leap: LeapSeconds::new(),
            settings,
            store,
            line: Vec::with_capacity(MAX_SENTENCE_LEN),
            prev_fix_ms: 0,
            new_gga_ms: 0,
            new_rmc_ms: 0,
            latest_commit_ms: 0,
            old_sec: 0,
            bad_gga: true,
            time_from_rmc: false,
            pfsim,
        }
    }

    pub fn chip_id(&self) -> GnssId {
        self.chip_id
    }

    pub fn gga_latency_ms(&self) -> u16 {
        self.chip.gga_ms()
    }

    pub fn rmc_latency_ms(&self) -> u16 {
        self.chip.rmc_ms()
    }

    /// Location, altitude and date all fresh, and the last GGA was a
    /// real one.
    pub fn fix_valid(&self, now_ms: u32) -> bool {
        self.parser.location.is_valid() && !self.bad_gga
            && self.parser.altitude.is_valid()
            && self.parser.date.is_valid()
            && self.parser.location.age(now_ms) <= NMEA_EXP_TIME_MS
            && self.parser.altitude.age(now_ms) <= NMEA_EXP_TIME_MS
            && self.parser.date.age(now_ms) <= NMEA_EXP_TIME_MS
    }

    /// One completed, checksum-passed sentence sits in `self.line`.
    /// Apply the pairing rules and possibly emit events.
    fn sentence_done(&mut self, h: &mut Pushable<SensorData>, now_ms: u32) {
        if self.line.len() < 7 || self.line[6] != b',' {
            return;
        }

        let is_g = self.line[1] == b'G';
        let is_p = self.line[1] == b'P';
        if !is_g && !is_p {
            return;
        }

        if is_p {
            if &self.line[1..6] == b"PFSIM" {
                self.process_pfsim(h, now_ms);
            }
            return;
        }

        // the seconds digit at offset 12 is part of the pairing state,
        // so a degenerate sentence without a time field is no GGA
        let is_gga = self.line.len() > 12
            && self.line[3] == b'G' && self.line[4] == b'G' && self.line[5] == b'A';
        let is_rmc = !is_gga
            && self.line[3] == b'R' && self.line[4] == b'M' && self.line[5] == b'C';
        if !is_gga && !is_rmc {
            return;
        }

        // expect one fix per second
        if now_ms.wrapping_sub(self.prev_fix_ms) <= PAIR_WINDOW_MS {
            return;
        }

        if (is_gga && self.new_gga_ms != 0) || (is_rmc && self.new_rmc_ms != 0)
            || (self.latest_commit_ms != 0
                && now_ms.wrapping_sub(self.latest_commit_ms) > PAIR_WINDOW_MS)
        {
            // the other sentence failed to arrive within the same second,
            // start over
            self.latest_commit_ms = 0;
            self.new_gga_ms = 0;
            self.new_rmc_ms = 0;
        }

        if is_gga && self.line[12] != self.old_sec {
            self.new_gga_ms = now_ms;
            self.old_sec = self.line[12];
            if self.latest_commit_ms == 0 {
                self.latest_commit_ms = now_ms.wrapping_sub(self.parser.time.age(now_ms));
                self.time_from_rmc = false; // GGA arrived before RMC
            }
            if self.line.len() > MIN_GGA_LEN && self.parser.gga_had_separation() {
                self.bad_gga = false;
            } else {
                self.bad_gga = true;
            }
        }

        if is_rmc {
            self.new_rmc_ms = now_ms;
            if self.latest_commit_ms == 0 {
                self.latest_commit_ms = now_ms.wrapping_sub(self.parser.time.age(now_ms));
                self.time_from_rmc = true; // RMC arrived before GGA
            }
        }

        if self.new_gga_ms != 0 && self.new_rmc_ms != 0 {
            // received both GGA and RMC sentences of this second
            self.new_gga_ms = 0;
            self.new_rmc_ms = 0;
            self.prev_fix_ms = now_ms;

            if self.fix_valid(now_ms) {
                let (lat, lon) = self.parser.location.get();
                let separation = self.parser.separation.get();
                let event = FixEvent {
                    latitude: lat,
                    longitude: lon,
                    altitude: self.parser.altitude.get() + separation,
                    pressure_altitude: None,
                    speed: self.parser.speed.get(),
                    course: self.parser.course.get(),
                    hdop: (self.parser.hdop.get() * 10.0) as u16,
                    satellites: self.parser.satellites.get() as u8,
                    geoid_separation: separation,
                    date: self.parser.date.get(),
                    time: self.parser.time.get(),
                    commit_ms: self.latest_commit_ms,
                    age_ms: now_ms.wrapping_sub(self.latest_commit_ms),
                    time_from_rmc: self.time_from_rmc,
                    leap_correction: self.leap.correction,
                };
                trace!("fix event: {:?}", event);
                h.push_data(SensorData::Fix(event));
            } else {
                debug!("GGA+RMC pair complete but fix not valid");
            }
        }
    }

    fn process_pfsim(&mut self, h: &mut Pushable<SensorData>, now_ms: u32) {
        let gnss_time = self.parser.time.peek();
        let gnss_hms = gnss_time.2 as u32 + 60 * (gnss_time.1 as u32 + 60 * gnss_time.0 as u32);

        let emit = {
            let parser = &mut self.parser;
            let settings = &self.settings;
            let pfsim = match self.pfsim {
                Some(ref mut p) => p,
                None => return,
            };

            if parser.custom_updated(pfsim.timestamp) {
                let ts = parser.custom_value(pfsim.timestamp).to_string();
                if ts.len() >= 6 {
                    let hour: u32 = ts[0..2].parse().unwrap_or(0);
                    let minute: u32 = ts[2..4].parse().unwrap_or(0);
                    let second: u32 = ts[4..6].parse().unwrap_or(0);
                    let hms = second + 60 * (minute + 60 * hour);

                    let speed_mps: f32 = parser.custom_value(pfsim.speed).parse().unwrap_or(0.0);
                    let vs_mps: f32 = parser.custom_value(pfsim.vs).parse().unwrap_or(0.0);
                    let _turnrate: f32 =
                        parser.custom_value(pfsim.turnrate).parse().unwrap_or(0.0);

                    let data = TrafficData {
                        protocol: settings.rf_protocol,
                        addr: u32::from_str_radix(parser.custom_value(pfsim.addr), 16)
                            .unwrap_or(0),
                        addr_type: parser.custom_value(pfsim.addrtype).parse().unwrap_or(0),
                        aircraft_type: parser.custom_value(pfsim.actype).parse().unwrap_or(0),
                        latitude: parser.custom_value(pfsim.lat).parse().unwrap_or(0.0),
                        longitude: parser.custom_value(pfsim.lon).parse().unwrap_or(0.0),
                        altitude: parser.custom_value(pfsim.alt).parse().unwrap_or(0.0),
                        course: parser.custom_value(pfsim.course).parse().unwrap_or(0.0),
                        speed: speed_mps / MPS_PER_KNOT,
                        vs: vs_mps * FEET_PER_METER * 60.0,
                        hor_accuracy: 0,
                        second_of_minute: (hms % 60) as u8,
                        relayed: false,
                        crc: 0,
                        rx_ms: now_ms,
                    };
                    pfsim.pending = Some((hms, data));
                }
            }

            match pfsim.pending {
                Some((hms, data)) if hms == gnss_hms => {
                    pfsim.pending = None;
                    Some(data)
                }
                Some((hms, _)) if hms < gnss_hms => {
                    // too late
                    pfsim.pending = None;
                    None
                }
                _ => None,
            }
        };

        if let Some(mut data) = emit {
            data.rx_ms = now_ms;
            h.push_data(SensorData::Traffic(data));
        }
    }
}

impl Sensor for GnssSource {
    fn run(&mut self, h: &mut Pushable<SensorData>) {
        let now_ms = h.get_ms();

        loop {
            let c = match self.port.read_byte() {
                Some(c) => c,
                None => break,
            };

            if c == b'$' {
                self.line.clear();
            }
            let printable = c == b'\r' || c == b'\n' || (c >= 0x20 && c < 0x7F);
            if !printable {
                continue;
            }
            if c != b'\r' && c != b'\n' && self.line.len() < MAX_SENTENCE_LEN {
                self.line.push(c);
            }

            if self.parser.encode(c, now_ms) {
                self.sentence_done(h, now_ms);
            }
        }

        // simulated traffic waiting for its second to come up
        if self.pfsim.as_ref().map_or(false, |p| p.pending.is_some()) {
            self.process_pfsim(h, now_ms);
        }

        // dialect chores, and the leap-seconds query once a fix holds
        if self.fix_valid(now_ms) {
            let dirty = self.leap.poll(
                self.chip_id,
                &mut *self.port,
                &mut self.settings,
                now_ms,
            );
            if dirty {
                if let Some(ref store) = self.store {
                    if let Err(e) = store.save(&self.settings) {
                        warn!("could not persist settings: {}", e);
                    }
                }
            }
        }
        self.chip.loop_tick(&mut *self.port);
    }

    fn shutdown(&mut self) {
        self.chip.fini(&mut *self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::chips::testutil::ScriptPort;
    use super::chips::GenericNmea;
    use squitter::handle::{BasicHandle, PushableHandle};
    use std::collections::VecDeque;

    const GGA_T0: &'static str =
        "$GPGGA,120000.00,5230.0000,N,01330.0000,E,1,08,1.0,100.0,M,45.0,M,,*63\r\n";
    const RMC_T0: &'static str =
        "$GPRMC,120000.00,A,5230.0000,N,01330.0000,E,0.0,0.0,010125,,,A*5F\r\n";
    const GGA_T1: &'static str =
        "$GPGGA,120001.00,5230.0000,N,01330.0000,E,1,08,1.0,100.0,M,45.0,M,,*62\r\n";
    const RMC_T1: &'static str =
        "$GPRMC,120001.00,A,5230.0000,N,01330.0000,E,0.0,0.0,010125,,,A*5E\r\n";

    fn source_with(settings: Settings) -> GnssSource {
        GnssSource::with_chip(
            Box::new(ScriptPort::new()),
            GnssId::U8,
            Box::new(GenericNmea),
            settings,
            None,
        )
    }

    /// Feed sentences through the same path `Sensor::run` takes, at a
    /// controlled monotonic ms.
    fn run_with(src: &mut GnssSource, q: &mut VecDeque<SensorData>, data: &str, now_ms: u32) {
        for &c in data.as_bytes() {
            if c == b'$' {
                src.line.clear();
            }
            if c != b'\r' && c != b'\n' && src.line.len() < MAX_SENTENCE_LEN {
                src.line.push(c);
            }
            if src.parser.encode(c, now_ms) {
                let mut b = BasicHandle::with_ms(50, now_ms);
                let mut h = PushableHandle::new(&mut b, q);
                src.sentence_done(&mut h, now_ms);
            }
        }
    }

    #[test]
    fn test_gga_first_pair_emits_fix() {
        let mut src = source_with(Settings::default());
        let mut q = VecDeque::new();

        run_with(&mut src, &mut q, GGA_T0, 10_000);
        assert!(q.is_empty());
        run_with(&mut src, &mut q, RMC_T0, 10_040);

        assert_eq!(q.len(), 1);
        match q[0] {
            SensorData::Fix(ref f) => {
                assert_eq!(f.latitude, 52.5);
                assert_eq!(f.longitude, 13.5);
                assert_eq!(f.altitude, 145.0); // 100 MSL + 45 separation
                assert_eq!(f.geoid_separation, 45.0);
                assert_eq!(f.date, (1, 1, 25));
                assert_eq!(f.time, (12, 0, 0, 0));
                assert_eq!(f.commit_ms, 10_000);
                assert!(!f.time_from_rmc);
                assert_eq!(f.satellites, 8);
                assert_eq!(f.hdop, 10);
            }
            ref other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_rmc_first_sets_marker() {
        let mut src = source_with(Settings::default());
        let mut q = VecDeque::new();

        run_with(&mut src, &mut q, RMC_T0, 10_000);
        run_with(&mut src, &mut q, GGA_T0, 10_070);

        assert_eq!(q.len(), 1);
        match q[0] {
            SensorData::Fix(ref f) => {
                assert!(f.time_from_rmc);
                assert_eq!(f.commit_ms, 10_000);
            }
            ref other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_second_pair_next_second() {
        let mut src = source_with(Settings::default());
        let mut q = VecDeque::new();

        run_with(&mut src, &mut q, GGA_T0, 10_000);
        run_with(&mut src, &mut q, RMC_T0, 10_040);
        run_with(&mut src, &mut q, GGA_T1, 11_000);
        run_with(&mut src, &mut q, RMC_T1, 11_040);

        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_empty_gga_blocks_fix() {
        let mut src = source_with(Settings::default());
        let mut q = VecDeque::new();

        // the short pre-lock GGA some chipsets emit
        run_with(&mut src, &mut q, "$GPGGA,120001.00*56\r\n", 10_000);
        run_with(&mut src, &mut q, RMC_T1, 10_040);

        assert!(q.is_empty());
        assert!(!src.fix_valid(10_050));
    }

    #[test]
    fn test_missing_partner_restarts_pairing() {
        let mut src = source_with(Settings::default());
        let mut q = VecDeque::new();

        run_with(&mut src, &mut q, GGA_T0, 10_000);
        // RMC never arrives for this second; next second's pair works
        run_with(&mut src, &mut q, GGA_T1, 11_000);
        run_with(&mut src, &mut q, RMC_T1, 11_040);

        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_pfsim_injection() {
        let mut settings = Settings::default();
        settings.debug_flags = DEBUG_SIMULATE;
        let mut src = source_with(settings);
        let mut q = VecDeque::new();

        // parser needs a current time for the release gate
        run_with(&mut src, &mut q, GGA_T1, 10_000);

        let pfsim = "$PFSIM,120001,DD1234,2,1,52.6,13.4,650.0,25.0,270.0,1.5,0.0*74\r\n";
        run_with(&mut src, &mut q, pfsim, 10_100);

        let traffic: Vec<&SensorData> = q.iter()
            .filter(|e| match **e {
                SensorData::Traffic(_) => true,
                _ => false,
            })
            .collect();
        assert_eq!(traffic.len(), 1);
        match *traffic[0] {
            SensorData::Traffic(ref t) => {
                assert_eq!(t.addr, 0xDD1234);
                assert_eq!(t.addr_type, 2);
                assert_eq!(t.aircraft_type, 1);
                assert_eq!(t.latitude, 52.6);
                assert_eq!(t.altitude, 650.0);
                assert_eq!(t.course, 270.0);
                // 25 m/s over ground
                assert!((t.speed - 48.6).abs() < 0.1);
                // 1.5 m/s climb
                assert!((t.vs - 295.3).abs() < 0.5);
            }
            _ => unreachable!(),
        }
    }
}
