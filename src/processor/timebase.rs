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

//! The slot clock. Radio slots are laid out relative to the true start
//! of each UTC second, so this processor pins a monotonic millisecond to
//! that boundary: from the PPS edge when there is one, otherwise from
//! the arrival time of the NMEA sentences minus the per-chip sentence
//! latency. Between fixes the clock free-runs.

use super::*;
use chrono::prelude::*;
use sensor::gnss::chips::GnssId;
use sensor::FixEvent;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Shifting our notion of the second start this much earlier receives
/// FLARM-family packets noticeably better.
const ADJ_FOR_FLARM_RECEPTION_MS: u32 = 25;
/// The VK2828 (u-blox 7) PPS pulse runs about this late.
const ADJ_PPS_FOR_U7_MS: u32 = 100;

/// GNSS data older than this at fix time cannot pin the second.
const MAX_GNSS_AGE_MS: u32 = 2500;
/// Once synced, hold off re-anchoring for this long; free-run instead.
const RESYNC_HOLDOFF_MS: u32 = 11_111;

/// The slot clock: `pps_ms` is the monotonic millisecond of the start
/// of second `utc_second`. Guaranteed never to step backwards.
#[derive(Debug, PartialEq, Copy, Clone)]
pub struct SlotClock {
    pub utc_second: i64,
    pub pps_ms: u32,
    /// true once at least one fix has anchored absolute time
    pub synced: bool,
}

pub struct TimeBase {
    utc_second: i64,
    /// device ms at last verified fix anchor
    base_time_ms: u32,
    /// assumed device ms at the last second boundary
    ref_time_ms: u32,
    last_utc_ms: u32,
    last_pps_raw: u32,
    chip_id: GnssId,
    gga_ms: u16,
    rmc_ms: u16,
    pps: Arc<AtomicU32>,
}

impl TimeBase {
    pub fn new(chip_id: GnssId, gga_ms: u16, rmc_ms: u16) -> TimeBase {
        TimeBase {
            utc_second: 0,
            base_time_ms: 0,
            ref_time_ms: 0,
            last_utc_ms: 0,
            last_pps_raw: 0,
            chip_id,
            gga_ms,
            rmc_ms,
            pps: Arc::new(AtomicU32::new(0)),
        }
    }

    /// The capture cell the PPS edge handler writes into (release
    /// ordering, a single u32 monotonic timestamp).
    pub fn pps_marker(&self) -> Arc<AtomicU32> {
        self.pps.clone()
    }

    fn adjust_pps(&self, raw: u32) -> u32 {
        if self.chip_id == GnssId::U7 {
            raw.wrapping_sub(ADJ_PPS_FOR_U7_MS)
        } else {
            raw.wrapping_add(ADJ_FOR_FLARM_RECEPTION_MS)
        }
    }

    /// Try to re-anchor the clock from one fix event. Returns whether
    /// the fix was accepted.
    fn on_fix(&mut self, f: &FixEvent, now_ms: u32) -> bool {
        let assumed_ms = if f.time_from_rmc {
            self.rmc_ms as u32
        } else {
            self.gga_ms as u32
        };

        let mut commit = f.commit_ms;
        if commit == 0 {
            // should not happen
            commit = now_ms;
        }

        let mut pps_btime_ms = self.pps.load(Ordering::Acquire);
        let newtime;
        let time_corr_neg;
        if pps_btime_ms > 0 {
            if commit < pps_btime_ms {
                pps_btime_ms = pps_btime_ms.wrapping_sub(1000);
            }
            newtime = self.adjust_pps(pps_btime_ms);
            time_corr_neg = commit.wrapping_sub(pps_btime_ms);
        } else {
            // PPS not available
            time_corr_neg = assumed_ms;
            newtime = commit.wrapping_sub(assumed_ms);
        }

        // the clock never steps backwards (and stale GNSS data cannot
        // pin the second)
        if !(f.age_ms < MAX_GNSS_AGE_MS && newtime > self.base_time_ms
            && (pps_btime_ms == 0 || commit > pps_btime_ms))
        {
            return false;
        }
        if self.last_utc_ms != 0 && now_ms.wrapping_sub(self.last_utc_ms) < RESYNC_HOLDOFF_MS {
            // keep free-running between anchor points
            return false;
        }

        let mut newtime = newtime;
        if pps_btime_ms > 0 && now_ms > pps_btime_ms.wrapping_add(1000) {
            newtime = newtime.wrapping_add(1000);
        }

        let (day, month, yy) = f.date;
        let (hour, minute, second, _) = f.time;
        let date = match NaiveDate::from_ymd_opt(2000 + yy as i32, month as u32, day as u32) {
            Some(d) => d,
            None => return false,
        };
        let dt = match date.and_hms_opt(hour as u32, minute as u32, second as u32) {
            Some(dt) => dt,
            None => return false,
        };

        let mut our = dt.timestamp();
        if f.age_ms.wrapping_add(time_corr_neg) >= 1000 {
            // the sentences describe the previous second boundary
            our += 1;
        }
        our -= f.leap_correction as i64;

        self.utc_second = our;
        self.ref_time_ms = newtime;
        self.base_time_ms = newtime;
        self.last_utc_ms = now_ms;
        debug!("time base anchored: utc={} pps_ms={}", our, newtime);
        true
    }

    /// Advance the clock without a fix: a fresh PPS edge marks the next
    /// second boundary directly, otherwise free-run in 1000 ms steps.
    fn tick(&mut self, now_ms: u32) {
        let raw = self.pps.load(Ordering::Acquire);
        if raw != 0 && raw != self.last_pps_raw {
            self.last_pps_raw = raw;
            let adj = self.adjust_pps(raw);
            if self.ref_time_ms == 0 {
                self.utc_second += 1;
                self.ref_time_ms = adj;
                return;
            }
            let delta = adj.wrapping_sub(self.ref_time_ms);
            if delta >= 500 && delta < 0x8000_0000 {
                self.utc_second += ((delta + 500) / 1000) as i64;
                self.ref_time_ms = adj;
                return;
            }
        }

        if self.ref_time_ms > 0 {
            while now_ms.wrapping_sub(self.ref_time_ms) >= 1000
                && now_ms.wrapping_sub(self.ref_time_ms) < 0x8000_0000
            {
                self.utc_second += 1;
                self.ref_time_ms = self.ref_time_ms.wrapping_add(1000);
            }
        }
    }
}

impl Processor for TimeBase {
    fn run(&mut self, handle: &mut Pushable<Report>, i: ChainedIter) {
        let now_ms = handle.get_ms();

        let mut accepted = false;
        for e in i {
            if let SensorData::Fix(ref f) = *e {
                if self.on_fix(f, now_ms) {
                    accepted = true;
                }
            }
        }

        if accepted {
            // the edge that anchored this fix is consumed
            self.last_pps_raw = self.pps.load(Ordering::Acquire);
        } else {
            self.tick(now_ms);
        }

        if self.ref_time_ms != 0 {
            handle.push_data(Report::Clock(SlotClock {
                utc_second: self.utc_second,
                pps_ms: self.ref_time_ms,
                synced: self.last_utc_ms != 0,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use squitter::handle::{BasicHandle, PushableHandle};
    use std::collections::VecDeque;

    fn fix(commit_ms: u32, time_from_rmc: bool) -> FixEvent {
        FixEvent {
            latitude: 52.5,
            longitude: 13.5,
            altitude: 145.0,
            pressure_altitude: None,
            speed: 0.0,
            course: 0.0,
            hdop: 10,
            satellites: 8,
            geoid_separation: 45.0,
            date: (1, 1, 25),
            time: (12, 0, 0, 0),
            commit_ms,
            age_ms: 40,
            time_from_rmc,
            leap_correction: 0,
        }
    }

    /// 2025-01-01 12:00:00 UTC
    const T0: i64 = 1735732800;

    fn run_pass(tb: &mut TimeBase, events: Vec<SensorData>, now_ms: u32) -> Option<SlotClock> {
        let mut q = VecDeque::new();
        {
            let mut b = BasicHandle::with_ms(50, now_ms);
            let mut h = PushableHandle::new(&mut b, &mut q);
            let empty: Vec<SensorData> = vec![];
            tb.run(&mut h, events.as_slice().iter().chain(empty.as_slice().iter()));
        }
        for r in q {
            if let Report::Clock(c) = r {
                return Some(c);
            }
        }
        None
    }

    #[test]
    fn test_no_pps_gga_first_uses_gga_latency() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(fix(20_000, false))], 20_050).unwrap();
        assert_eq!(clock.utc_second, T0);
        assert_eq!(clock.pps_ms, 20_000 - 138);
        assert!(clock.synced);
    }

    #[test]
    fn test_no_pps_rmc_first_uses_rmc_latency() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(fix(20_000, true))], 20_050).unwrap();
        assert_eq!(clock.utc_second, T0);
        assert_eq!(clock.pps_ms, 20_000 - 67);
    }

    #[test]
    fn test_pps_capture_wins_over_latency() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        tb.pps_marker().store(19_975, Ordering::Release);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(fix(20_100, false))], 20_150).unwrap();
        assert_eq!(clock.pps_ms, 19_975 + 25);
        assert_eq!(clock.utc_second, T0);
    }

    #[test]
    fn test_u7_pps_runs_late() {
        let mut tb = TimeBase::new(GnssId::U7, 138, 67);
        tb.pps_marker().store(20_075, Ordering::Release);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(fix(20_100, false))], 20_150).unwrap();
        assert_eq!(clock.pps_ms, 20_075 - 100);
    }

    #[test]
    fn test_free_run_between_fixes() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        run_pass(&mut tb, vec![SensorData::Fix(fix(20_000, false))], 20_050);

        // no clock step before the second boundary
        let clock = run_pass(&mut tb, vec![], 20_500).unwrap();
        assert_eq!(clock.utc_second, T0);
        assert_eq!(clock.pps_ms, 19_862);

        // one step per 1000 ms after it
        let clock = run_pass(&mut tb, vec![], 20_900).unwrap();
        assert_eq!(clock.utc_second, T0 + 1);
        assert_eq!(clock.pps_ms, 20_862);

        let clock = run_pass(&mut tb, vec![], 22_880).unwrap();
        assert_eq!(clock.utc_second, T0 + 3);
        assert_eq!(clock.pps_ms, 22_862);
    }

    #[test]
    fn test_resync_holdoff_keeps_free_running() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        run_pass(&mut tb, vec![SensorData::Fix(fix(20_000, false))], 20_050);

        // a second fix inside the holdoff is ignored; free-run covers it
        let mut f = fix(21_000, false);
        f.time = (12, 0, 1, 0);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(f)], 21_040).unwrap();
        assert_eq!(clock.utc_second, T0 + 1);
        assert_eq!(clock.pps_ms, 20_862); // free-run step, not 21_000-138
    }

    #[test]
    fn test_pps_only_free_run_advances() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        let marker = tb.pps_marker();

        let mut last = SlotClock {
            utc_second: 0,
            pps_ms: 0,
            synced: false,
        };
        for n in 0..10 {
            marker.store(30_000 + n * 1000, Ordering::Release);
            last = run_pass(&mut tb, vec![], 30_010 + n * 1000).unwrap();
            assert!(!last.synced);
        }
        assert_eq!(last.utc_second, 10);

        // consecutive pps_ms values stayed 1000 apart
        assert_eq!(last.pps_ms, 30_000 + 9 * 1000 + 25);
    }

    #[test]
    fn test_leap_correction_applied() {
        let mut tb = TimeBase::new(GnssId::U6, 138, 67);
        let mut f = fix(20_000, false);
        f.leap_correction = 3;
        let clock = run_pass(&mut tb, vec![SensorData::Fix(f)], 20_050).unwrap();
        assert_eq!(clock.utc_second, T0 - 3);
    }

    #[test]
    fn test_old_sentences_describe_previous_second() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        let mut f = fix(20_000, false);
        f.age_ms = 900; // commit long before the pass; 900 + 138 >= 1000
        let clock = run_pass(&mut tb, vec![SensorData::Fix(f)], 20_950).unwrap();
        assert_eq!(clock.utc_second, T0 + 1);
    }

    #[test]
    fn test_clock_is_monotonic() {
        let mut tb = TimeBase::new(GnssId::U8, 138, 67);
        run_pass(&mut tb, vec![SensorData::Fix(fix(20_000, false))], 20_050);
        let first = run_pass(&mut tb, vec![], 20_060).unwrap().pps_ms;

        // a fix whose derived anchor would step the clock backwards is
        // rejected even after the holdoff
        let mut f = fix(19_000, false);
        f.time = (12, 0, 5, 0);
        let clock = run_pass(&mut tb, vec![SensorData::Fix(f)], 40_000).unwrap();
        assert!(clock.pps_ms >= first);
    }
}
