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

//! The slot scheduler: decides when the single half-duplex radio may
//! transmit and keeps it listening the rest of the time. One own
//! transmit instant per second, pseudo-randomly placed inside the slot
//! selected for that second, so two beacons do not persistently collide.

use super::*;
use processor::ownship::Ownship;
use processor::timebase::SlotClock;
use protocol::{self, adsl, ProtoDesc, Slot, AIRCRAFT_TYPE_WINCH};
use rand::Rng;
use sensor::TrafficData;
use settings::{Settings, ALTPROTOCOL_NONE, RELAY_OFF};

/// seconds between ground-presence announcements
const GROUND_TX_PERIOD: i64 = 8;
/// keep this much of the slot in hand so one pass of pipeline latency
/// cannot push the burst past the window
const TX_MARGIN_MS: u16 = 20;
/// relay transmissions replace the own packet on this cadence
const RELAY_SECOND_MODULO: i64 = 4;
/// only targets heard this recently are worth relaying
const RELAY_FRESH_MS: u32 = 5000;
/// bound on frames decoded per pass
const MAX_RX_PER_PASS: usize = 8;

pub struct RfLink {
    radio: Box<Radio>,
    key: [u32; 4],
    own_addr: u32,
    ignore_addr: u32,
    relay_mode: u8,
    acft_type: u8,
    tx_enabled: bool,
    primary: &'static ProtoDesc,
    altprotocol: Option<&'static ProtoDesc>,
    frequency_hz: u32,

    ownship: Option<Ownship>,
    relay_candidate: Option<TrafficData>,

    /// second the current plan belongs to
    plan_second: i64,
    tx_instant: u32,
    slot_end_ms: u32,
    plan_desc: &'static ProtoDesc,
    tx_done: bool,

    pub tx_packets: u32,
    pub rx_packets: u32,
}

impl RfLink {
    pub fn new(radio: Box<Radio>, settings: &Settings) -> Box<Link> {
        let primary = protocol::descriptor(settings.rf_protocol);
        let altprotocol = if settings.altprotocol == ALTPROTOCOL_NONE
            || settings.altprotocol == settings.rf_protocol
        {
            None
        } else {
            Some(protocol::descriptor(settings.altprotocol))
        };

        let mut link = RfLink {
            radio,
            key: settings.key,
            own_addr: settings.aircraft_id,
            ignore_addr: settings.ignore_id,
            relay_mode: settings.relay,
            acft_type: settings.acft_type,
            tx_enabled: settings.txpower > 0,
            primary,
            altprotocol,
            frequency_hz: band_frequency(settings.band, settings.freq_corr),
            ownship: None,
            relay_candidate: None,
            plan_second: 0,
            tx_instant: 0,
            slot_end_ms: 0,
            plan_desc: primary,
            tx_done: true,
            tx_packets: 0,
            rx_packets: 0,
        };
        link.radio.set_channel(link.frequency_hz);
        Box::new(link)
    }

    /// The codec a given second transmits and listens with.
    fn desc_for_second(&self, second: i64) -> &'static ProtoDesc {
        match self.altprotocol {
            Some(alt) if second & 1 == 1 => alt,
            _ => self.primary,
        }
    }

    /// Pseudo-random but reproducible slot choice per (address, second).
    fn slot_for_second(&self, second: i64) -> Slot {
        let mut x = self.own_addr ^ (second as u32);
        x ^= x >> 16;
        x = x.wrapping_mul(0x7FEB_352D);
        x ^= x >> 15;
        if x & 1 == 0 {
            self.plan_desc.slot0
        } else {
            self.plan_desc.slot1
        }
    }

    /// Lay out this second's transmit instant. Called once per second,
    /// strictly after the time base has been updated for it.
    fn plan(&mut self, clock: &SlotClock) {
        self.plan_second = clock.utc_second;
        self.plan_desc = self.desc_for_second(clock.utc_second);
        self.tx_done = false;

        let slot = self.slot_for_second(clock.utc_second);
        let air_time = self.plan_desc.air_time_ms;
        let span = slot.duration().saturating_sub(air_time + TX_MARGIN_MS);
        let offset = ::rand::thread_rng().gen_range(0..span as u32 + 1);

        self.tx_instant = clock
            .pps_ms
            .wrapping_add(slot.begin as u32)
            .wrapping_add(offset);
        self.slot_end_ms = clock.pps_ms.wrapping_add(slot.end as u32);
        trace!(
            "second {}: {} slot [{}, {}], tx at pps+{}",
            clock.utc_second,
            self.plan_desc.name,
            slot.begin,
            slot.end,
            slot.begin as u32 + offset
        );
    }

    /// The transmit gate: inside our slot, radio idle, fix valid and
    /// airborne. On the ground one transmit every eight seconds still
    /// announces presence; a winch always announces.
    fn tx_wanted(&self) -> bool {
        if !self.tx_enabled {
            return false;
        }
        let own = match self.ownship {
            Some(ref o) if o.valid => o,
            _ => return false,
        };
        if own.airborne || self.acft_type == AIRCRAFT_TYPE_WINCH {
            return true;
        }
        self.plan_second % GROUND_TX_PERIOD == (self.own_addr % GROUND_TX_PERIOD as u32) as i64
    }

    fn relay_due(&self) -> bool {
        self.relay_mode != RELAY_OFF && self.relay_candidate.is_some()
            && self.plan_second % RELAY_SECOND_MODULO == 0
    }

    fn transmit_slot(&mut self, now_ms: u32) {
        if self.tx_done {
            return;
        }
        if now_ms.wrapping_sub(self.tx_instant) >= 0x8000_0000 {
            return; // not yet
        }

        // the remaining window must still fit the whole burst
        let last_start = self
            .slot_end_ms
            .wrapping_sub(self.plan_desc.air_time_ms as u32);
        if now_ms.wrapping_sub(last_start) < 0x8000_0000 {
            debug!("slot missed, staying in receive");
            self.tx_done = true;
            return;
        }

        if !self.tx_wanted() {
            self.tx_done = true;
            return;
        }

        let relayed = if self.relay_due() {
            self.relay_candidate.take()
        } else {
            None
        };
        let bytes = match (relayed, self.ownship.as_ref()) {
            (Some(ref peer), _) => adsl::encode_relay_with(self.plan_desc, peer, &self.key),
            (None, Some(own)) => adsl::encode_with(self.plan_desc, own, &self.key),
            (None, None) => {
                self.tx_done = true;
                return;
            }
        };

        match self.radio.transmit(&bytes) {
            Ok(()) => {
                self.tx_packets += 1;
                self.tx_done = true;
            }
            Err(RadioError::Busy) => {
                // previous burst still in flight, skip this slot
                debug!("radio busy at tx instant, slot skipped");
                self.tx_done = true;
            }
            Err(RadioError::NotReady) => {
                // retry on the next pass while the window is open
            }
            Err(RadioError::HardwareFault) => {
                warn!("radio hardware fault, resetting");
                if self.radio.reset().is_err() {
                    error!("radio reset failed");
                }
                self.tx_done = true;
            }
        }
    }

    fn receive(&mut self, handle: &mut Pushable<SensorData>) {
        let now_ms = handle.get_ms();
        let mut buf = [0_u8; MAX_PKT_SIZE];

        for _ in 0..MAX_RX_PER_PASS {
            if !self.radio.receive_ready() {
                break;
            }
            let frame = match self.radio.read_packet(&mut buf) {
                Some(f) => f,
                None => break,
            };

            let decoded = adsl::decode_with(self.plan_desc, &buf[..frame.len], &self.key, now_ms);
            let mut t = match decoded {
                Some(t) => t,
                None => {
                    debug!("frame failed CRC/descramble, dropped");
                    continue;
                }
            };

            if t.addr == self.own_addr {
                if self.relay_mode == RELAY_OFF {
                    debug!("own address echo dropped");
                    continue;
                }
                // landed-out diagnostic: our packet came back via a peer
                t.relayed = true;
            }
            if t.addr == self.ignore_addr && self.ignore_addr != 0 {
                continue;
            }

            self.rx_packets += 1;

            // remember a relay candidate: fresh, direct (not itself a
            // relay), and not us
            if self.relay_mode != RELAY_OFF && !t.relayed
                && t.addr != self.own_addr
                && now_ms.wrapping_sub(t.rx_ms) <= RELAY_FRESH_MS
            {
                self.relay_candidate = Some(t);
            }

            handle.push_data(SensorData::Traffic(t));
        }
    }
}

impl Link for RfLink {
    fn run(&mut self, handle: &mut Pushable<SensorData>, i: ChainedIter) {
        for e in i {
            match *e {
                Report::Clock(ref c) => {
                    if c.synced && c.utc_second != self.plan_second {
                        let c = *c;
                        self.plan(&c);
                    }
                }
                Report::Ownship(ref o) => {
                    self.ownship = Some(*o);
                }
                Report::Traffic(_) => {}
            }
        }

        let now_ms = handle.get_ms();
        self.transmit_slot(now_ms);
        self.receive(handle);
    }

    fn shutdown(&mut self) {
        self.radio.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ADSL_PROTO, LEGACY_PROTO, PROTOCOL_LEGACY};
    use squitter::handle::{BasicHandle, PushableHandle};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct StubState {
        transmissions: Vec<(u32, Vec<u8>)>,
        rx_frames: VecDeque<Vec<u8>>,
        busy: bool,
        fault: bool,
        resets: u32,
        now_ms: u32,
    }

    struct StubRadio {
        state: Rc<RefCell<StubState>>,
    }

    impl Radio for StubRadio {
        fn kind(&self) -> RfChipKind {
            RfChipKind::Sx1262
        }

        fn set_channel(&mut self, _freq_hz: u32) {}

        fn transmit(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
            let mut s = self.state.borrow_mut();
            if s.fault {
                return Err(RadioError::HardwareFault);
            }
            if s.busy {
                return Err(RadioError::Busy);
            }
            let now = s.now_ms;
            s.transmissions.push((now, bytes.to_vec()));
            Ok(())
        }

        fn receive_ready(&mut self) -> bool {
            !self.state.borrow().rx_frames.is_empty()
        }

        fn read_packet(&mut self, buf: &mut [u8; MAX_PKT_SIZE]) -> Option<RxFrame> {
            let mut s = self.state.borrow_mut();
            s.rx_frames.pop_front().map(|f| {
                buf[..f.len()].copy_from_slice(&f);
                RxFrame {
                    len: f.len(),
                    rssi: -70,
                    crc: 0,
                }
            })
        }

        fn reset(&mut self) -> Result<(), RadioError> {
            let mut s = self.state.borrow_mut();
            s.resets += 1;
            s.fault = false;
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    const KEY: [u32; 4] = [0xDEADBEEF, 0x01234567, 0x89ABCDEF, 0x55AA55AA];

    fn settings() -> Settings {
        let mut s = Settings::default();
        s.aircraft_id = 0xDD1234;
        s.key = KEY;
        s
    }

    fn stub_link(settings: &Settings) -> (Box<Link>, Rc<RefCell<StubState>>) {
        let state = Rc::new(RefCell::new(StubState::default()));
        let radio = StubRadio {
            state: state.clone(),
        };
        (RfLink::new(Box::new(radio), settings), state)
    }

    fn ownship(airborne: bool) -> Ownship {
        Ownship {
            valid: true,
            addr: 0xDD1234,
            addr_type: 2,
            aircraft_type: 1,
            latitude: 52.5,
            longitude: 13.5,
            altitude: 645.0,
            pressure_altitude: None,
            speed: if airborne { 60.0 } else { 0.0 },
            course: 90.0,
            vs: 0.0,
            hdop: 10,
            airborne,
            second: 10,
            leap_correction: 0,
            stealth: false,
            fix_ms: 0,
        }
    }

    fn clock(second: i64, pps_ms: u32) -> SlotClock {
        SlotClock {
            utc_second: second,
            pps_ms,
            synced: true,
        }
    }

    fn run_pass(
        link: &mut Box<Link>,
        state: &Rc<RefCell<StubState>>,
        reports: Vec<Report>,
        now_ms: u32,
    ) -> Vec<SensorData> {
        state.borrow_mut().now_ms = now_ms;
        let mut q = VecDeque::new();
        {
            let mut b = BasicHandle::with_ms(50, now_ms);
            let mut h = PushableHandle::new(&mut b, &mut q);
            let empty: Vec<Report> = vec![];
            link.run(&mut h, reports.as_slice().iter().chain(empty.as_slice().iter()));
        }
        q.into_iter().collect()
    }

    /// Walk one whole second in 20 ms passes, delivering the clock and
    /// ownship reports once at the start of the second.
    fn walk_second(
        link: &mut Box<Link>,
        state: &Rc<RefCell<StubState>>,
        second: i64,
        pps_ms: u32,
        own: Ownship,
    ) {
        run_pass(
            link,
            state,
            vec![Report::Clock(clock(second, pps_ms)), Report::Ownship(own)],
            pps_ms + 20,
        );
        let mut t = pps_ms + 40;
        while t < pps_ms + 1400 {
            run_pass(link, state, vec![], t);
            t += 20;
        }
    }

    #[test]
    fn test_transmit_lands_inside_slot_bounds() {
        // many seconds, every transmit inside [begin, end - air_time]
        let (mut link, state) = stub_link(&settings());

        for n in 0..50 {
            let pps = 10_000 + n * 1000;
            walk_second(&mut link, &state, 1_700_000_000 + n as i64, pps, ownship(true));
        }

        let s = state.borrow();
        assert_eq!(s.transmissions.len(), 50);
        for &(at, ref bytes) in s.transmissions.iter() {
            // pps instants are multiples of 1000 here, so the ms after
            // the second's pps is just the remainder
            let rel = at % 1000;
            // slots span [400, 1200) relative to pps; the pass cadence
            // adds up to 20 ms of latency on top of the planned instant
            assert!(rel >= 400 && rel < 1200, "tx at +{} ms", rel);
            assert_eq!(bytes.len(), adsl::PACKET_SIZE);
        }
    }

    #[test]
    fn test_no_transmit_without_valid_fix() {
        let (mut link, state) = stub_link(&settings());

        let mut own = ownship(true);
        own.valid = false;
        walk_second(&mut link, &state, 100, 10_000, own);
        assert!(state.borrow().transmissions.is_empty());
    }

    #[test]
    fn test_ground_rule_every_eighth_second() {
        let (mut link, state) = stub_link(&settings());

        // 0xDD1234 % 8 == 4
        for second in 800..816 {
            let pps = 10_000 + ((second - 800) as u32) * 1000;
            walk_second(&mut link, &state, second, pps, ownship(false));
        }

        let s = state.borrow();
        assert_eq!(s.transmissions.len(), 2); // seconds 804 and 812
    }

    #[test]
    fn test_winch_ignores_ground_rule() {
        let mut cfg = settings();
        cfg.acft_type = AIRCRAFT_TYPE_WINCH;
        let (mut link, state) = stub_link(&cfg);

        let mut own = ownship(false);
        own.aircraft_type = AIRCRAFT_TYPE_WINCH;
        for second in 800..804 {
            let pps = 10_000 + ((second - 800) as u32) * 1000;
            walk_second(&mut link, &state, second, pps, own);
        }
        assert_eq!(state.borrow().transmissions.len(), 4);
    }

    #[test]
    fn test_busy_radio_skips_slot() {
        let (mut link, state) = stub_link(&settings());
        state.borrow_mut().busy = true;

        walk_second(&mut link, &state, 100, 10_000, ownship(true));
        assert!(state.borrow().transmissions.is_empty());

        // next second the radio is idle again
        state.borrow_mut().busy = false;
        walk_second(&mut link, &state, 101, 11_000, ownship(true));
        assert_eq!(state.borrow().transmissions.len(), 1);
    }

    #[test]
    fn test_hardware_fault_resets_radio() {
        let (mut link, state) = stub_link(&settings());
        state.borrow_mut().fault = true;

        walk_second(&mut link, &state, 100, 10_000, ownship(true));
        let s = state.borrow();
        assert!(s.transmissions.is_empty());
        assert_eq!(s.resets, 1);
    }

    #[test]
    fn test_dual_protocol_alternates() {
        let mut cfg = settings();
        cfg.altprotocol = PROTOCOL_LEGACY;
        let (mut link, state) = stub_link(&cfg);

        for n in 0..4 {
            let pps = 10_000 + n * 1000;
            walk_second(&mut link, &state, 1000 + n as i64, pps, ownship(true));
        }

        let s = state.borrow();
        assert_eq!(s.transmissions.len(), 4);
        let versions: Vec<u8> = s.transmissions.iter().map(|&(_, ref b)| b[0]).collect();
        assert_eq!(
            versions,
            vec![
                ADSL_PROTO.version,
                LEGACY_PROTO.version,
                ADSL_PROTO.version,
                LEGACY_PROTO.version,
            ]
        );
    }

    #[test]
    fn test_receive_decodes_and_loops_back() {
        let (mut link, state) = stub_link(&settings());

        let peer = ownship(true);
        let mut peer = peer;
        peer.addr = 0xABCDEF;
        let frame = adsl::encode(&peer, &KEY).to_vec();
        state.borrow_mut().rx_frames.push_back(frame);

        let events = run_pass(
            &mut link,
            &state,
            vec![
                Report::Clock(clock(100, 10_000)),
                Report::Ownship(ownship(true)),
            ],
            10_020,
        );

        let traffic: Vec<&SensorData> = events
            .iter()
            .filter(|e| match **e {
                SensorData::Traffic(_) => true,
                _ => false,
            })
            .collect();
        assert_eq!(traffic.len(), 1);
        match *traffic[0] {
            SensorData::Traffic(ref t) => assert_eq!(t.addr, 0xABCDEF),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_own_echo_dropped_unless_relay_mode() {
        let (mut link, state) = stub_link(&settings());

        let frame = adsl::encode(&ownship(true), &KEY).to_vec();
        state.borrow_mut().rx_frames.push_back(frame.clone());
        let events = run_pass(&mut link, &state, vec![], 10_020);
        assert!(events.is_empty());

        // landed-out relay mode accepts the echo, flagged as relayed
        let mut cfg = settings();
        cfg.relay = ::settings::RELAY_LANDED;
        let (mut link, state) = stub_link(&cfg);
        state.borrow_mut().rx_frames.push_back(frame);
        let events = run_pass(&mut link, &state, vec![], 10_020);
        assert_eq!(events.len(), 1);
        match events[0] {
            SensorData::Traffic(ref t) => {
                assert_eq!(t.addr, 0xDD1234);
                assert!(t.relayed);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_corrupt_frame_dropped() {
        let (mut link, state) = stub_link(&settings());

        let mut peer = ownship(true);
        peer.addr = 0xABCDEF;
        let mut frame = adsl::encode(&peer, &KEY).to_vec();
        frame[5] ^= 0xFF;
        state.borrow_mut().rx_frames.push_back(frame);

        let events = run_pass(&mut link, &state, vec![], 10_020);
        assert!(events.is_empty());
    }

    #[test]
    fn test_relay_retransmits_peer() {
        let mut cfg = settings();
        cfg.relay = ::settings::RELAY_LANDED;
        let (mut link, state) = stub_link(&cfg);

        // hear a peer shortly before our own slot
        let mut peer = ownship(true);
        peer.addr = 0xABCDEF;
        peer.addr_type = 1;
        let frame = adsl::encode(&peer, &KEY).to_vec();
        state.borrow_mut().rx_frames.push_back(frame);

        // pick a second on the relay cadence
        walk_second(&mut link, &state, 200, 10_000, ownship(true));

        let s = state.borrow();
        assert_eq!(s.transmissions.len(), 1);
        let t = adsl::decode(&s.transmissions[0].1, &KEY, 0).unwrap();
        assert_eq!(t.addr, 0xABCDEF);
        assert_eq!(t.addr_type, 1);
        assert!(t.relayed);
    }
}
