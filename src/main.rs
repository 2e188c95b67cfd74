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

#[macro_use]
extern crate log;
extern crate chrono;
extern crate env_logger;
#[macro_use]
extern crate nom;
extern crate rand;
extern crate serial;

#[macro_use]
mod utils;
mod processor;
mod protocol;
mod radio;
mod sensor;
mod settings;
mod squitter;

use processor::ownship::OwnshipProcessor;
use processor::timebase::TimeBase;
use processor::traffic::Traffic;
use processor::Processor;
use radio::link::RfLink;
use sensor::gnss::chips::{baud_from_code, SerialGnssPort};
use sensor::gnss::GnssSource;
use sensor::Sensor;
use settings::SettingsStore;
use squitter::Squitter;

const GNSS_SERIAL_PATH: &'static str = "/dev/ttyAMA0";
const SETTINGS_PATH: &'static str = "settings.txt";

fn main() {
    env_logger::init().unwrap();

    let store = SettingsStore::new(SETTINGS_PATH);
    let config = store.load();

    let mut p = Squitter::new(50); // 50 Hz

    match SerialGnssPort::open(GNSS_SERIAL_PATH, baud_from_code(config.baud_rate)) {
        Ok(port) => {
            match GnssSource::new(Box::new(port), config.clone(), Some(store)) {
                Some(g) => {
                    let timebase =
                        TimeBase::new(g.chip_id(), g.gga_latency_ms(), g.rmc_latency_ms());
                    // the PPS edge handler of the board layer writes
                    // into this marker
                    let _pps = timebase.pps_marker();

                    p.link_processor(Box::new(timebase) as Box<Processor>);
                    p.link_sensor(Box::new(g) as Box<Sensor>);
                }
                None => warn!("no GNSS module detected, running receive-only"),
            }
        }
        Err(e) => warn!("could not open {}: {}", GNSS_SERIAL_PATH, e),
    }

    p.link_processor(OwnshipProcessor::new(&config));
    p.link_processor(Traffic::new(&config));

    // board support selects the fitted transceiver; without one the
    // pipeline still runs end to end
    p.link_link(RfLink::new(Box::new(radio::NullRadio), &config));

    p.run();
}
