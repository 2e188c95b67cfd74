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

//! The picture of who else is in the air: a bounded per-address table
//! of recently decoded aircraft, refreshed by each reception and aged
//! out after half a minute of silence.

use super::*;
use sensor::TrafficData;
use settings::Settings;
use std::collections::HashMap;

pub const MAX_TRACKED: usize = 64;

/// age beyond which an entry is dropped by the sweep
const MAX_STALE_MS: u32 = 30_000;
/// the sweep itself runs at most this often
const SWEEP_FREQ: f32 = 2.0;
const REPORT_FREQ: u16 = 1;
/// identical CRC from the same address within this window is the same
/// transmission heard again
const DUPLICATE_WINDOW_MS: u32 = 1000;
/// lock out the secondary-protocol copy while the primary is this fresh
const PRIMARY_LOCKOUT_MS: u32 = 5000;

/// A tracked traffic target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub data: TrafficData,
    pub last_seen_ms: u32,
    pub last_crc: u32,
    /// ms of the last update that came in via the primary protocol,
    /// u32::MAX when none has
    via_primary_ms: u32,
    pub relayed: bool,
}

#[derive(Debug, PartialEq)]
pub enum Upsert {
    Inserted,
    Updated,
    /// same transmission heard twice; only `last_seen` was refreshed
    Duplicate,
    /// secondary-protocol copy of an aircraft fresh via the primary
    Shadowed,
}

/// Fixed-capacity table keyed by the 24-bit address. Eviction is
/// strictly by age.
pub struct TrafficTable {
    map: HashMap<u32, Target>,
    primary_protocol: u8,
}

impl TrafficTable {
    pub fn new(primary_protocol: u8) -> TrafficTable {
        TrafficTable {
            map: HashMap::with_capacity(MAX_TRACKED),
            primary_protocol,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn lookup(&self, addr: u32) -> Option<&Target> {
        self.map.get(&addr)
    }

    pub fn iter(&self) -> ::std::collections::hash_map::Values<u32, Target> {
        self.map.values()
    }

    pub fn upsert(&mut self, data: TrafficData, now_ms: u32) -> Upsert {
        let via_primary = data.protocol == self.primary_protocol;

        if let Some(entry) = self.map.get_mut(&data.addr) {
            if data.crc == entry.last_crc
                && now_ms.wrapping_sub(entry.last_seen_ms) <= DUPLICATE_WINDOW_MS
            {
                entry.last_seen_ms = now_ms;
                return Upsert::Duplicate;
            }

            if !via_primary && entry.via_primary_ms != u32::max_value()
                && now_ms.wrapping_sub(entry.via_primary_ms) <= PRIMARY_LOCKOUT_MS
            {
                debug!("secondary-protocol copy of {:06X} skipped", data.addr);
                return Upsert::Shadowed;
            }

            entry.data = data;
            entry.last_seen_ms = now_ms;
            entry.last_crc = data.crc;
            if via_primary {
                entry.via_primary_ms = now_ms;
            }
            entry.relayed = data.relayed;
            return Upsert::Updated;
        }

        if self.map.len() >= MAX_TRACKED {
            // evict the entry that has been quiet the longest
            let victim = self.map
                .iter()
                .max_by_key(|&(_, t)| now_ms.wrapping_sub(t.last_seen_ms))
                .map(|(addr, _)| *addr);
            if let Some(addr) = victim {
                debug!("traffic table full, evicting {:06X}", addr);
                self.map.remove(&addr);
            }
        }

        self.map.insert(
            data.addr,
            Target {
                data,
                last_seen_ms: now_ms,
                last_crc: data.crc,
                via_primary_ms: if via_primary { now_ms } else { u32::max_value() },
                relayed: data.relayed,
            },
        );
        Upsert::Inserted
    }

    pub fn age_sweep(&mut self, now_ms: u32) {
        self.map
            .retain(|_, t| now_ms.wrapping_sub(t.last_seen_ms) < MAX_STALE_MS);
    }
}

pub struct Traffic {
    table: TrafficTable,
    own_addr: u32,
    ignore_addr: u32,
    sweep_countdown: u32,
    report_countdown: u32,
}

impl Traffic {
    pub fn new(settings: &Settings) -> Box<Processor> {
        Box::new(Traffic {
            table: TrafficTable::new(settings.rf_protocol),
            own_addr: settings.aircraft_id,
            ignore_addr: settings.ignore_id,
            sweep_countdown: 0,
            report_countdown: 0,
        })
    }
}

impl Processor for Traffic {
    fn run(&mut self, handle: &mut Pushable<Report>, i: ChainedIter) {
        let now_ms = handle.get_ms();

        for e in i {
            if let SensorData::Traffic(ref t) = *e {
                // an ownship echo only enters the table as an explicit
                // relay (the landed-out diagnostic); an ignored address
                // never does
                if t.addr == self.own_addr && !t.relayed {
                    debug!("own address echo dropped");
                    continue;
                }
                if t.addr == self.ignore_addr && self.ignore_addr != 0 {
                    continue;
                }

                match self.table.upsert(*t, now_ms) {
                    Upsert::Inserted => trace!("new traffic {:06X}", t.addr),
                    Upsert::Updated | Upsert::Duplicate | Upsert::Shadowed => {}
                }
            }
        }

        run_at_hz!(SWEEP_FREQ, self.sweep_countdown, handle, {
            self.table.age_sweep(now_ms);
        });

        run_at_hz!(REPORT_FREQ, self.report_countdown, handle, {
            for t in self.table.iter() {
                handle.push_data(Report::Traffic(*t));
            }
        });
    }
}
