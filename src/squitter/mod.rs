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

pub mod handle;

use radio::Link;
use processor::{Processor, Report};
use sensor::{Sensor, SensorData};
use self::handle::{BasicHandle, PushableHandle};
use std::collections::VecDeque;
use std::thread::sleep;
use std::time::{Duration, Instant};

/// The cooperative pipeline: sensors feed processors, processors feed
/// links, links loop decoded traffic back into the next pass's sensor
/// queue. Every pass must finish well inside one radio-slot tolerance
/// (tens of ms), which the pass frequency enforces.
pub struct Squitter {
    sensors: Vec<Box<Sensor>>,
    processors: Vec<Box<Processor>>,
    links: Vec<Box<Link>>,
    interval: Duration,
    frequency: u16,
    origin: Instant,
    sensor_queue: VecDeque<SensorData>,
    report_queue: VecDeque<Report>,
    loopback_queue: VecDeque<SensorData>,
    handle: BasicHandle,
}

impl Squitter {
    pub fn new(freq: u16) -> Self {
        let origin = Instant::now();
        Squitter {
            sensors: vec![],
            processors: vec![],
            links: vec![],
            sensor_queue: VecDeque::new(),
            report_queue: VecDeque::new(),
            loopback_queue: VecDeque::new(),
            frequency: freq,
            interval: Duration::from_millis((1000 / freq) as u64),
            origin,
            handle: BasicHandle::new(freq, origin),
        }
    }

    pub fn link_sensor(&mut self, s: Box<Sensor>) {
        self.sensors.push(s);
    }

    pub fn link_processor(&mut self, p: Box<Processor>) {
        self.processors.push(p);
    }

    pub fn link_link(&mut self, l: Box<Link>) {
        self.links.push(l);
    }

    fn run_sensors(&mut self) {
        let mut handle = PushableHandle::new(&mut self.handle, &mut self.sensor_queue);

        for s in self.sensors.iter_mut() {
            s.run(&mut handle);
        }
    }

    fn run_processors(&mut self) {
        let mut handle = PushableHandle::new(&mut self.handle, &mut self.report_queue);

        {
            let (first, second) = self.sensor_queue.as_slices();
            debug!("{} sensor events this pass", self.sensor_queue.len());

            for p in self.processors.iter_mut() {
                p.run(&mut handle, first.iter().chain(second.iter()));
            }
        }

        self.sensor_queue.clear();
    }

    fn run_links(&mut self) {
        let mut handle = PushableHandle::new(&mut self.handle, &mut self.loopback_queue);

        {
            let (first, second) = self.report_queue.as_slices();
            debug!("{} reports this pass", self.report_queue.len());

            for l in self.links.iter_mut() {
                l.run(&mut handle, first.iter().chain(second.iter()));
            }
        }

        self.report_queue.clear();
    }

    /// One pass over all stages. Decoded traffic from the link layer is
    /// carried over to the sensor queue of the next pass.
    pub fn run_once(&mut self) {
        self.handle = BasicHandle::new(self.frequency, self.origin);

        while let Some(d) = self.loopback_queue.pop_front() {
            self.sensor_queue.push_back(d);
        }

        self.run_sensors();
        self.run_processors();
        self.run_links();
    }

    pub fn run(&mut self) {
        loop {
            // each pass must stay well under one slot tolerance
            let before = Instant::now();

            self.run_once();

            let elapsed = before.elapsed();

            if elapsed < self.interval {
                sleep(self.interval - elapsed);
            } else {
                warn!("pass took longer than the loop interval");
            }
        }
    }

    /// Graceful teardown on behalf of the external power collaborator.
    pub fn shutdown(&mut self) {
        for l in self.links.iter_mut() {
            l.shutdown();
        }
        for s in self.sensors.iter_mut() {
            s.shutdown();
        }
    }
}

impl Default for Squitter {
    fn default() -> Squitter {
        Squitter::new(50)
    }
}
