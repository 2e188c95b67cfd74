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

//! GNSS chip dialect adapters. Each adapter knows how to recognise its
//! chip over the wire, how to configure it for GGA+RMC at 1 Hz with
//! airborne dynamics, and how late its sentences run after the true
//! second (the per-sentence latency constants used by the time base).

use nom::{le_u8, le_u16, IResult};
use serial::{self, SerialPort, SystemPort};
use settings::Settings;
use std::io::{self, Read, Write};
use std::num::Wrapping;
use std::time::Instant;
use std::{thread, time};

pub const BAUD_RATES: [u32; 6] = [4800, 9600, 19200, 38400, 57600, 115200];
pub const DEFAULT_BAUD: u32 = 38400;

/// Map the persisted baud-rate code (0 = default) to a rate.
pub fn baud_from_code(code: u8) -> u32 {
    match code {
        c if c >= 1 && c <= 6 => BAUD_RATES[c as usize - 1],
        _ => DEFAULT_BAUD,
    }
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum GnssId {
    None,
    Nmea,
    U6,
    U7,
    U8,
    U9,
    U10,
    Sony,
    At65,
    Mt33,
    Goke,
}

impl GnssId {
    pub fn is_ublox(&self) -> bool {
        match *self {
            GnssId::U6 | GnssId::U7 | GnssId::U8 | GnssId::U9 | GnssId::U10 => true,
            _ => false,
        }
    }
}

/// Byte-level access to the GNSS serial line. The monotonic clock and the
/// cooperative pause live here too so that the bounded probe loops can be
/// driven by an in-memory port in tests.
pub trait GnssPort {
    fn read_byte(&mut self) -> Option<u8>;
    fn write(&mut self, data: &[u8]) -> io::Result<()>;
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;
    fn elapsed_ms(&self) -> u32;
    /// Cooperative pause inside a bounded wait.
    fn pause(&mut self);
}

pub struct SerialGnssPort {
    port: SystemPort,
    origin: Instant,
}

impl SerialGnssPort {
    pub fn open(path: &str, baud: u32) -> serial::Result<SerialGnssPort> {
        let mut port = serial::open(path)?;
        port.set_timeout(time::Duration::from_millis(0))?;
        port.reconfigure(&|settings| {
            settings.set_baud_rate(serial::BaudRate::from_speed(baud as usize))?;
            settings.set_char_size(serial::Bits8);
            settings.set_parity(serial::ParityNone);
            settings.set_stop_bits(serial::Stop1);
            settings.set_flow_control(serial::FlowNone);
            Ok(())
        })?;
        Ok(SerialGnssPort {
            port,
            origin: Instant::now(),
        })
    }
}

impl GnssPort for SerialGnssPort {
    fn read_byte(&mut self) -> Option<u8> {
        let mut buf = [0_u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Some(buf[0]),
            _ => None,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data).and_then(|_| self.port.flush())
    }

    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        self.port
            .reconfigure(&|settings| {
                settings.set_baud_rate(serial::BaudRate::from_speed(baud as usize))
            })
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn elapsed_ms(&self) -> u32 {
        let e = self.origin.elapsed();
        (e.as_secs() as u32) * 1000 + e.subsec_nanos() / 1_000_000
    }

    fn pause(&mut self) {
        thread::sleep(time::Duration::from_millis(2));
    }
}

fn wait_ms(port: &mut GnssPort, ms: u32) {
    let start = port.elapsed_ms();
    while port.elapsed_ms().wrapping_sub(start) < ms {
        port.pause();
    }
}

/// Collect one line (up to `\n`) of printable characters, bounded by
/// `deadline_ms` on the port clock.
fn read_line(port: &mut GnssPort, deadline_ms: u32) -> Vec<u8> {
    let mut line = Vec::with_capacity(84);
    loop {
        if port.elapsed_ms().wrapping_sub(deadline_ms) < 0x8000_0000 {
            break; // past the deadline
        }
        match port.read_byte() {
            Some(c) if c == b'\n' => {
                line.push(c);
                break;
            }
            Some(c) if c == b'\r' || (c >= 0x20 && c < 0x7F) => {
                if line.len() < 250 {
                    line.push(c);
                }
            }
            Some(_) => {}
            None => port.pause(),
        }
    }
    line
}

/// Send `req` (when given) and wait for a line starting with `resp`.
/// With `skipline` the first line after the request is discarded.
pub fn nmea_handshake(
    port: &mut GnssPort,
    req: Option<&[u8]>,
    resp: &[u8],
    skipline: bool,
) -> bool {
    if resp.is_empty() {
        return false;
    }

    // clean any leftovers
    while port.read_byte().is_some() {}

    let timeout = if req.is_none() { 3000 } else { 2000 };
    let deadline = port.elapsed_ms().wrapping_add(timeout);

    while port.elapsed_ms().wrapping_sub(deadline) >= 0x8000_0000 {
        if let Some(r) = req {
            if port.write(r).is_err() {
                return false;
            }
        }
        if skipline {
            read_line(port, deadline);
        }
        let line = read_line(port, deadline);
        if line.starts_with(resp) {
            return true;
        }
    }

    false
}

/*
 * UBX binary framing (u-blox dialect only)
 */

#[derive(Debug, PartialEq)]
pub struct UbxFrame<'a> {
    pub class: u8,
    pub id: u8,
    pub payload: &'a [u8],
}

named!(parse_ubx_frame<UbxFrame>,
    map_res!(
        do_parse!(
            take_until_and_consume!(&[0xB5_u8, 0x62][..])
                >> class: le_u8
                >> id: le_u8
                >> len: le_u16
                >> payload: take!(len)
                >> ck_a: le_u8
                >> ck_b: le_u8
                >> (class, id, payload, ck_a, ck_b)
        ),
        UbxFrame::new_from_parser
    )
);

impl<'a> UbxFrame<'a> {
    fn new_from_parser(data: (u8, u8, &'a [u8], u8, u8)) -> Result<UbxFrame<'a>, ()> {
        let (class, id, payload, ck_a, ck_b) = data;

        let mut to_calc = Vec::with_capacity(payload.len() + 4);
        to_calc.push(class);
        to_calc.push(id);
        to_calc.push((payload.len() & 0xFF) as u8);
        to_calc.push(((payload.len() >> 8) & 0xFF) as u8);
        to_calc.extend_from_slice(payload);
        let (cck_a, cck_b) = ubx_checksum(&to_calc);

        if cck_a != ck_a || cck_b != ck_b {
            debug!("UBX frame with incorrect checksum");
            Err(())
        } else {
            Ok(UbxFrame { class, id, payload })
        }
    }
}

fn ubx_checksum(buf: &[u8]) -> (u8, u8) {
    let mut ck_a = Wrapping(0_u8);
    let mut ck_b = Wrapping(0_u8);
    for b in buf {
        ck_a += Wrapping(*b);
        ck_b += ck_a;
    }
    (ck_a.0, ck_b.0)
}

/// Build a complete UBX packet ready for the wire.
pub fn make_ubx(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(payload.len() + 8);
    ret.push(0xB5);
    ret.push(0x62);
    ret.push(class);
    ret.push(id);
    ret.push((payload.len() & 0xFF) as u8);
    ret.push(((payload.len() >> 8) & 0xFF) as u8);
    ret.extend_from_slice(payload);
    let (ck_a, ck_b) = ubx_checksum(&ret[2..]);
    ret.push(ck_a);
    ret.push(ck_b);
    ret
}

/// Poll-request a UBX message and collect the matching response payload.
/// The request is re-sent at the 1 s and 2 s marks; the wait is bounded
/// by `timeout_ms`.
fn ubx_query(
    port: &mut GnssPort,
    class: u8,
    id: u8,
    timeout_ms: u32,
) -> Option<Vec<u8>> {
    let request = make_ubx(class, id, &[]);

    while port.read_byte().is_some() {}
    if port.write(&request).is_err() {
        return None;
    }

    let start = port.elapsed_ms();
    let mut resent = 0;
    let mut buf: Vec<u8> = Vec::with_capacity(256);

    loop {
        let waited = port.elapsed_ms().wrapping_sub(start);
        if waited >= timeout_ms {
            debug!("UBX query {:02X} {:02X} timed out", class, id);
            return None;
        }
        if (waited > 1000 && resent == 0) || (waited > 2000 && resent == 1) {
            debug!("re-sending UBX query {:02X} {:02X}", class, id);
            while port.read_byte().is_some() {}
            if port.write(&request).is_err() {
                return None;
            }
            resent += 1;
        }

        match port.read_byte() {
            Some(c) => {
                buf.push(c);
                let consumed;
                match parse_ubx_frame(&buf) {
                    IResult::Done(rem, frame) => {
                        if frame.class == class && frame.id == id {
                            return Some(frame.payload.to_vec());
                        }
                        consumed = buf.len() - rem.len();
                    }
                    IResult::Incomplete(_) => continue,
                    IResult::Error(_) => {
                        // no sync word anywhere in the buffer
                        consumed = buf.len().saturating_sub(1);
                    }
                }
                buf.drain(..consumed);
            }
            None => port.pause(),
        }
    }
}

/// Send a CFG packet and wait for the matching ACK-ACK. Bounded at
/// 4000 ms with one re-send per 1000 ms boundary.
fn ubx_cfg(port: &mut GnssPort, class: u8, id: u8, payload: &[u8]) -> bool {
    let packet = make_ubx(class, id, payload);
    if port.write(&packet).is_err() {
        return false;
    }

    let start = port.elapsed_ms();
    let mut resent = 0;
    let mut buf: Vec<u8> = Vec::with_capacity(64);

    loop {
        let waited = port.elapsed_ms().wrapping_sub(start);
        if waited >= 4000 {
            return false;
        }
        if waited > 1000 * (resent + 1) {
            if port.write(&packet).is_err() {
                return false;
            }
            resent += 1;
        }

        match port.read_byte() {
            Some(c) => {
                buf.push(c);
                let consumed;
                match parse_ubx_frame(&buf) {
                    IResult::Done(rem, frame) => {
                        if frame.class == 0x05 && frame.payload == &[class, id] {
                            // ACK-ACK = 0x01, ACK-NAK = 0x00
                            return frame.id == 0x01;
                        }
                        consumed = buf.len() - rem.len();
                    }
                    IResult::Incomplete(_) => continue,
                    IResult::Error(_) => {
                        consumed = buf.len().saturating_sub(1);
                    }
                }
                buf.drain(..consumed);
            }
            None => port.pause(),
        }
    }
}

/*
 * Dialect adapters
 */

/// Capability set of one chip dialect. `probe` identifies the chip,
/// `setup`/`fini` bring it into and out of service, `loop_tick` runs any
/// periodic dialect chores. `gga_ms`/`rmc_ms` are the milliseconds from
/// the true second to the end of the respective sentence.
pub trait GnssChip {
    fn name(&self) -> &'static str;
    fn probe(&mut self, port: &mut GnssPort) -> GnssId;
    fn setup(&mut self, port: &mut GnssPort, settings: &Settings) -> bool;
    fn loop_tick(&mut self, _port: &mut GnssPort) {}
    fn fini(&mut self, port: &mut GnssPort);
    fn gga_ms(&self) -> u16;
    fn rmc_ms(&self) -> u16;
}

pub struct GenericNmea;

impl GnssChip for GenericNmea {
    fn name(&self) -> &'static str {
        "NMEA"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        if nmea_handshake(port, None, b"$G", false) {
            GnssId::Nmea
        } else {
            GnssId::None
        }
    }

    fn setup(&mut self, _port: &mut GnssPort, _settings: &Settings) -> bool {
        true
    }

    fn fini(&mut self, _port: &mut GnssPort) {}

    // use u-blox timing values for a generic NMEA module
    fn gga_ms(&self) -> u16 {
        138
    }
    fn rmc_ms(&self) -> u16 {
        67
    }
}

/* CFG-MSG: enable RMC + GGA only, silence GLL and VTG */
const ENA_RMC: [u8; 8] = [0xF0, 0x04, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
const ENA_GGA: [u8; 8] = [0xF0, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01];
const DIS_GLL: [u8; 8] = [0xF0, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
const DIS_VTG: [u8; 8] = [0xF0, 0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];

/* CFG-NAV5: airborne with <2g acceleration, 3D fix preferred */
const SET_NAV5: [u8; 36] = [
    0xFF, 0xFF, 0x07, 0x03, 0x00, 0x00, 0x00, 0x00, 0x10, 0x27, 0x00, 0x00, 0x05, 0x00, 0xFA,
    0x00, 0xFA, 0x00, 0x64, 0x00, 0x2C, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/* CFG-SBAS: disable integrity, enable auto-scan */
const SET_SBAS: [u8; 8] = [0x01, 0x03, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00];

/* CFG-GNSS for u-blox 8: GPS + SBAS + Galileo + Glonass */
const SET_GNSS_U8: [u8; 60] = [
    0x00, 0x00, 0xFF, 0x07,
    0x00, 0x08, 0x10, 0x00, 0x01, 0x00, 0x01, 0x01, /* GPS */
    0x01, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x01, /* SBAS */
    0x02, 0x08, 0x08, 0x00, 0x01, 0x00, 0x01, 0x01, /* Galileo */
    0x04, 0x00, 0x08, 0x00, 0x00, 0x00, 0x01, 0x01, /* IMES */
    0x03, 0x08, 0x10, 0x00, 0x00, 0x00, 0x01, 0x01, /* Beidou */
    0x05, 0x01, 0x03, 0x00, 0x01, 0x00, 0x01, 0x01, /* QZSS */
    0x06, 0x08, 0x10, 0x00, 0x01, 0x00, 0x01, 0x01, /* Glonass */
];

/* CFG-RST: hot start, controlled software reset */
const CFG_RST_HOT: [u8; 4] = [0x00, 0x00, 0x01, 0x00];

/* RXM-PMREQ: power off until wakeup call */
const RXM_PMREQ_OFF: [u8; 8] = [0x00, 0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00];

pub struct Ublox {
    version: GnssId,
}

impl Ublox {
    pub fn new() -> Ublox {
        Ublox {
            version: GnssId::Nmea,
        }
    }

    /// MON-VER poll; the protocol generation is keyed off the hwVersion
    /// string that starts at payload byte 30.
    fn version(port: &mut GnssPort) -> GnssId {
        let payload = match ubx_query(port, 0x0A, 0x04, 3000) {
            Some(p) => p,
            None => return GnssId::Nmea,
        };
        if payload.len() < 40 {
            return GnssId::Nmea;
        }

        info!(
            "u-blox module FW version: {}",
            String::from_utf8_lossy(&payload[..30])
        );

        match (payload[32], payload[33]) {
            (_, b'4') => GnssId::U6,
            (_, b'7') => GnssId::U7,
            (b'1', b'9') => GnssId::U9,
            (_, b'8') => GnssId::U8,
            (_, b'A') => GnssId::U10,
            _ => GnssId::Nmea,
        }
    }
}

impl GnssChip for Ublox {
    fn name(&self) -> &'static str {
        "u-blox"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        self.version = Ublox::version(port);
        self.version
    }

    fn setup(&mut self, port: &mut GnssPort, _settings: &Settings) -> bool {
        if self.version == GnssId::U8 {
            if !ubx_cfg(port, 0x06, 0x3E, &SET_GNSS_U8) {
                warn!("unable to set GNSS configuration");
            }
        }
        if !ubx_cfg(port, 0x06, 0x16, &SET_SBAS) {
            warn!("unable to set SBAS");
        }
        if !ubx_cfg(port, 0x06, 0x24, &SET_NAV5) {
            warn!("unable to set airborne <2g navigation mode");
        }
        if !ubx_cfg(port, 0x06, 0x01, &ENA_GGA) {
            warn!("unable to enable NMEA GGA");
        }
        if !ubx_cfg(port, 0x06, 0x01, &ENA_RMC) {
            warn!("unable to enable NMEA RMC");
        }
        if !ubx_cfg(port, 0x06, 0x01, &DIS_GLL) {
            warn!("unable to disable NMEA GLL");
        }
        if !ubx_cfg(port, 0x06, 0x01, &DIS_VTG) {
            warn!("unable to disable NMEA VTG");
        }
        true
    }

    fn fini(&mut self, port: &mut GnssPort) {
        let _ = port.write(&make_ubx(0x06, 0x04, &CFG_RST_HOT));
        wait_ms(port, if self.version == GnssId::U8 { 1000 } else { 600 });
        let _ = port.write(&make_ubx(0x02, 0x41, &RXM_PMREQ_OFF));
    }

    fn gga_ms(&self) -> u16 {
        138
    }
    fn rmc_ms(&self) -> u16 {
        67
    }
}

pub struct Sony;

impl GnssChip for Sony {
    fn name(&self) -> &'static str {
        "Sony"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        // wake-up, then firmware version request
        let _ = port.write(b"@WUP\r\n");
        wait_ms(port, 500);
        if nmea_handshake(port, Some(b"@VER\r\n"), b"[VER] Done", true) {
            GnssId::Sony
        } else {
            GnssId::None
        }
    }

    fn setup(&mut self, port: &mut GnssPort, settings: &Settings) -> bool {
        // idle first; mode commands are only accepted at idle
        let _ = port.write(b"@GSTP\r\n");
        wait_ms(port, 2000);

        let _ = port.write(b"@BSSL 0x25\r\n"); // GGA + GSA + RMC
        wait_ms(port, 250);
        let _ = port.write(b"@GNS 3\r\n"); // GPS + GLONASS
        wait_ms(port, 250);
        let _ = port.write(b"@GUSE 0\r\n");
        wait_ms(port, 250);
        if settings.ppswire != 0 {
            let _ = port.write(b"@GPPS 1\r\n");
            wait_ms(port, 250);
        }
        // hot start, falls back to warm or cold automatically
        let _ = port.write(b"@GSR\r\n");
        wait_ms(port, 100);
        true
    }

    fn fini(&mut self, port: &mut GnssPort) {
        let _ = port.write(b"@GSTP\r\n");
        wait_ms(port, 1500);
        let _ = port.write(b"@SLP 1\r\n");
        wait_ms(port, 100);
    }

    fn gga_ms(&self) -> u16 {
        24
    }
    fn rmc_ms(&self) -> u16 {
        38
    }
}

pub struct Mtk;

impl GnssChip for Mtk {
    fn name(&self) -> &'static str {
        "MediaTek"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        if nmea_handshake(port, Some(b"$PMTK605*31\r\n"), b"$PMTK705", false) {
            GnssId::Mt33
        } else {
            GnssId::Nmea
        }
    }

    fn setup(&mut self, port: &mut GnssPort, _settings: &Settings) -> bool {
        // RMC + GGA
        let _ = port.write(b"$PMTK314,0,1,0,1,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0*28\r\n");
        wait_ms(port, 250);
        // aviation mode
        let _ = port.write(b"$PMTK886,2*2A\r\n");
        wait_ms(port, 250);
        true
    }

    fn fini(&mut self, port: &mut GnssPort) {
        // stop mode
        let _ = port.write(b"$PMTK161,0*28\r\n");
        wait_ms(port, 250);
    }

    fn gga_ms(&self) -> u16 {
        48
    }
    fn rmc_ms(&self) -> u16 {
        175
    }
}

pub struct Goke;

impl GnssChip for Goke {
    fn name(&self) -> &'static str {
        "Goke"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        if nmea_handshake(port, Some(b"$PGKC462*2F\r\n"), b"$PGKC463", false) {
            GnssId::Goke
        } else {
            GnssId::Nmea
        }
    }

    fn setup(&mut self, port: &mut GnssPort, settings: &Settings) -> bool {
        if settings.band == 3 {
            // CN band: GPS + BEIDOU
            let _ = port.write(b"$PGKC115,1,0,1,0*2A\r\n");
        } else {
            // GPS + GLONASS
            let _ = port.write(b"$PGKC115,1,1,0,0*2A\r\n");
        }
        wait_ms(port, 250);
        // RMC + GGA
        let _ = port.write(b"$PGKC242,0,1,0,1,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0*37\r\n");
        wait_ms(port, 250);
        if settings.ppswire != 0 {
            // 3D-fix 1PPS output
            let _ = port.write(b"$PGKC161,2,200,1000*04\r\n");
            wait_ms(port, 250);
        }
        true
    }

    fn fini(&mut self, port: &mut GnssPort) {
        let _ = port.write(b"$PGKC051,0*37\r\n");
        wait_ms(port, 250);
    }

    fn gga_ms(&self) -> u16 {
        185
    }
    fn rmc_ms(&self) -> u16 {
        265
    }
}

pub struct At65;

impl GnssChip for At65 {
    fn name(&self) -> &'static str {
        "AT65"
    }

    fn probe(&mut self, port: &mut GnssPort) -> GnssId {
        if nmea_handshake(port, Some(b"$PCAS06,0*1B\r\n"), b"$GPTXT,01,01,02", false) {
            GnssId::At65
        } else {
            GnssId::Nmea
        }
    }

    fn setup(&mut self, port: &mut GnssPort, _settings: &Settings) -> bool {
        let _ = port.write(b"$PCAS04,5*1C\r\n"); // GPS + GLONASS
        wait_ms(port, 250);
        let _ = port.write(b"$PCAS02,1000*2E\r\n"); // 1 Hz
        wait_ms(port, 250);
        let _ = port.write(b"$PCAS03,1,0,0,0,1,0,0,0,0,0,,,0,0*02\r\n"); // GGA + RMC
        wait_ms(port, 250);
        let _ = port.write(b"$PCAS11,6*1B\r\n"); // aviation < 2g
        wait_ms(port, 250);
        true
    }

    fn fini(&mut self, _port: &mut GnssPort) {}

    fn gga_ms(&self) -> u16 {
        70
    }
    fn rmc_ms(&self) -> u16 {
        135
    }
}

/// Listen for NMEA at each baud rate, fastest first. Returns the rate
/// that produced sentences, or None.
fn probe_baud_rates(port: &mut GnssPort) -> Option<u32> {
    let mut generic = GenericNmea;
    for &baudrate in BAUD_RATES.iter().rev() {
        if baudrate < 9600 {
            break;
        }
        info!("trying baud rate {}", baudrate);
        if port.set_baud(baudrate).is_err() {
            continue;
        }
        wait_ms(port, 500);
        if generic.probe(port) == GnssId::Nmea {
            info!("got NMEA at {} baud", baudrate);
            return Some(baudrate);
        }
    }
    None
}

/// Identify the connected chip and hand back its dialect adapter.
/// Falls back to the generic NMEA adapter when only sentences, but no
/// known dialect, are detected.
pub fn probe_chip(port: &mut GnssPort) -> (GnssId, Box<GnssChip>) {
    // power on by wakeup call
    let _ = port.write(&[0_u8]);
    wait_ms(port, 1000);

    let mut sony = Sony;
    if sony.probe(port) == GnssId::Sony {
        return (GnssId::Sony, Box::new(sony));
    }

    let mut generic = GenericNmea;
    let mut id = generic.probe(port);
    if id == GnssId::None {
        info!("no GNSS NMEA at the default rate");
        wait_ms(port, 500);
        if probe_baud_rates(port).is_none() {
            warn!("no NMEA at any baud rate");
            return (GnssId::None, Box::new(generic));
        }
        id = GnssId::Nmea;
    }

    debug_assert_eq!(id, GnssId::Nmea);

    let mut ublox = Ublox::new();
    let id = ublox.probe(port);
    if id.is_ublox() {
        return (id, Box::new(ublox));
    }

    let mut mtk = Mtk;
    if mtk.probe(port) == GnssId::Mt33 {
        return (GnssId::Mt33, Box::new(mtk));
    }

    let mut goke = Goke;
    if goke.probe(port) == GnssId::Goke {
        return (GnssId::Goke, Box::new(goke));
    }

    let mut at65 = At65;
    if at65.probe(port) == GnssId::At65 {
        return (GnssId::At65, Box::new(at65));
    }

    (GnssId::Nmea, Box::new(GenericNmea))
}

/*
 * Leap-seconds reconciliation
 */

const LEAP_CHECK_INTERVAL_MS: u32 = 43_000;
const LEAP_MAX_CHECKS: u8 = 18; // about 13 minutes

#[derive(Debug, PartialEq, Copy, Clone)]
enum LeapValid {
    Unknown,
    Invalid,
    Valid,
}

/// Tracks whether the GNSS almanac's leap-seconds figure is trustworthy
/// and derives the correction the codec and time base apply while it is
/// not. Only the u-blox dialect can be queried; other chips are assumed
/// valid.
pub struct LeapSeconds {
    pub correction: i8,
    state: LeapValid,
    next_check_ms: u32,
    checks: u8,
}

impl LeapSeconds {
    pub fn new() -> LeapSeconds {
        LeapSeconds {
            correction: 0,
            state: LeapValid::Unknown,
            next_check_ms: 0,
            checks: 0,
        }
    }

    /// Run one reconciliation attempt if one is due. Returns true when
    /// the settings were updated and should be persisted.
    pub fn poll(
        &mut self,
        chip_id: GnssId,
        port: &mut GnssPort,
        settings: &mut Settings,
        now_ms: u32,
    ) -> bool {
        if self.state == LeapValid::Valid || !chip_id.is_ublox() {
            return false;
        }
        if self.checks >= LEAP_MAX_CHECKS {
            return false; // gave up, default accepted
        }
        if self.checks > 0 && now_ms.wrapping_sub(self.next_check_ms) >= 0x8000_0000 {
            return false; // not due yet
        }

        self.next_check_ms = now_ms.wrapping_add(LEAP_CHECK_INTERVAL_MS);
        self.checks += 1;

        // NAV-TIMEGPS: leap seconds at byte 10, validity flags at byte 11
        match ubx_query(port, 0x01, 0x20, 2000) {
            Some(ref payload) if payload.len() >= 12 => {
                let reported = payload[10] as i8;
                info!("UBX leap seconds = {}", reported);
                if payload[11] & 0x04 == 0 {
                    self.state = LeapValid::Invalid;
                    let mut corr = settings.leapsecs as i32 - reported as i32;
                    if corr > 3 {
                        corr = 3;
                    }
                    if corr < -3 {
                        corr = -3;
                    }
                    self.correction = corr as i8;
                    info!(
                        "almanac leap seconds not valid, using correction {}",
                        self.correction
                    );
                } else {
                    self.state = LeapValid::Valid;
                    self.correction = 0;
                    if settings.leapsecs != reported {
                        // happens once in a few years
                        settings.leapsecs = reported;
                        return true;
                    }
                }
            }
            _ => {
                debug!("no response to UBX leap seconds query");
            }
        }
        false
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use super::testutil::ScriptPort;

    #[test]
    fn test_make_ubx() {
        assert_eq!(
            make_ubx(0x0A, 0x04, &[]),
            [0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34]
        );
    }

    #[test]
    fn test_ubx_frame_parser() {
        let msg = [0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34, 0x00];
        assert_eq!(
            parse_ubx_frame(&msg),
            IResult::Done(
                &[0x00][..],
                UbxFrame {
                    class: 0x0A,
                    id: 0x04,
                    payload: &[],
                }
            )
        );

        // leading garbage is skipped up to the sync word
        let msg = [0x31, 0x0A, 0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34];
        match parse_ubx_frame(&msg) {
            IResult::Done(rem, frame) => {
                assert_eq!(rem.len(), 0);
                assert_eq!(frame.class, 0x0A);
            }
            r => panic!("unexpected result {:?}", r),
        }

        // corrupted checksum is rejected
        let msg = [0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x35];
        match parse_ubx_frame(&msg) {
            IResult::Error(_) => {}
            r => panic!("unexpected result {:?}", r),
        }
    }

    #[test]
    fn test_mtk_probe_handshake() {
        let mut port = ScriptPort::new();
        port.feed(b"$GNGGA,,,,,,0,00,,,M,,M,,*00\r\n");
        port.respond_to(b"$PMTK605", b"$PMTK705,AXN_2.31_3339_13101700,5632,PA6H,1.0*6B\r\n");

        let mut mtk = Mtk;
        assert_eq!(mtk.probe(&mut port), GnssId::Mt33);
    }

    #[test]
    fn test_probe_timeout_falls_back() {
        let mut port = ScriptPort::new();
        // silence on the wire: probe must give up within its bound
        let mut mtk = Mtk;
        assert_eq!(mtk.probe(&mut port), GnssId::Nmea);
        assert!(port.clock >= 2000);
    }

    #[test]
    fn test_generic_probe_sees_nmea() {
        let mut port = ScriptPort::new();
        port.stream_in(
            b"$GNGGA,120000.00,,,,,0,00,,,M,,M,,*00\r\n$GNRMC,120000.00,V,,,,,,,,,,N*00\r\n",
        );
        let mut generic = GenericNmea;
        assert_eq!(generic.probe(&mut port), GnssId::Nmea);
    }

    #[test]
    fn test_sony_probe() {
        let mut port = ScriptPort::new();
        port.respond_to(b"@VER", b"[VER] 12345\r\n[VER] Done\r\n");
        let mut sony = Sony;
        assert_eq!(sony.probe(&mut port), GnssId::Sony);
    }

    #[test]
    fn test_ublox_version_probe() {
        let mut port = ScriptPort::new();
        // MON-VER response: swVersion[30] + hwVersion[10], hw = "00080000"
        let mut payload = Vec::new();
        payload.extend_from_slice(b"ROM CORE 3.01 (107888)");
        payload.resize(30, 0);
        payload.extend_from_slice(b"00080000");
        payload.resize(40, 0);
        let response = make_ubx(0x0A, 0x04, &payload);
        port.respond_to(&[0xB5, 0x62, 0x0A, 0x04], &response);

        let mut ublox = Ublox::new();
        assert_eq!(ublox.probe(&mut port), GnssId::U8);
    }

    #[test]
    fn test_ubx_cfg_ack_nak() {
        let mut port = ScriptPort::new();
        let ack = make_ubx(0x05, 0x01, &[0x06, 0x24]);
        port.respond_to(&[0xB5, 0x62, 0x06, 0x24], &ack);
        assert!(ubx_cfg(&mut port, 0x06, 0x24, &SET_NAV5));

        let mut port = ScriptPort::new();
        let nak = make_ubx(0x05, 0x00, &[0x06, 0x24]);
        port.respond_to(&[0xB5, 0x62, 0x06, 0x24], &nak);
        assert!(!ubx_cfg(&mut port, 0x06, 0x24, &SET_NAV5));
    }

    #[test]
    fn test_baud_sweep() {
        // only answer once the sweep has come down to 19200
        struct SweepPort {
            inner: ScriptPort,
        }
        impl GnssPort for SweepPort {
            fn read_byte(&mut self) -> Option<u8> {
                self.inner.read_byte()
            }
            fn write(&mut self, data: &[u8]) -> io::Result<()> {
                self.inner.write(data)
            }
            fn set_baud(&mut self, baud: u32) -> io::Result<()> {
                self.inner.set_baud(baud)?;
                if baud == 19200 {
                    self.inner
                        .stream_in(b"$GNRMC,1,V,,,,,,,,,,N*00\r\n$GNGGA,2*00\r\n$GNRMC,3*00\r\n");
                }
                Ok(())
            }
            fn elapsed_ms(&self) -> u32 {
                self.inner.elapsed_ms()
            }
            fn pause(&mut self) {
                self.inner.pause();
            }
        }

        let mut port = SweepPort {
            inner: ScriptPort::new(),
        };
        assert_eq!(probe_baud_rates(&mut port), Some(19200));
        assert_eq!(port.inner.baud, 19200);
    }

    #[test]
    fn test_leap_seconds_invalid_then_gives_up() {
        let mut settings = Settings::default();
        settings.leapsecs = 18;
        let mut leap = LeapSeconds::new();

        // NAV-TIMEGPS with leapS = 15 and valid flags without bit 2
        let mut payload = vec![0_u8; 16];
        payload[10] = 15;
        payload[11] = 0x03;
        let response = make_ubx(0x01, 0x20, &payload);

        let mut port = ScriptPort::new();
        port.respond_to(&[0xB5, 0x62, 0x01, 0x20], &response);

        assert!(!leap.poll(GnssId::U6, &mut port, &mut settings, 0));
        assert_eq!(leap.correction, 3);

        // not due again until the 43 s cadence elapses
        let sent_before = port.sent.len();
        assert!(!leap.poll(GnssId::U6, &mut port, &mut settings, 10_000));
        assert_eq!(port.sent.len(), sent_before);

        // due again after the cadence
        assert!(!leap.poll(GnssId::U6, &mut port, &mut settings, 44_000));
        assert!(port.sent.len() > sent_before);
    }

    #[test]
    fn test_leap_seconds_valid_updates_settings() {
        let mut settings = Settings::default();
        settings.leapsecs = 17;
        let mut leap = LeapSeconds::new();

        let mut payload = vec![0_u8; 16];
        payload[10] = 18;
        payload[11] = 0x07; // leap seconds valid
        let response = make_ubx(0x01, 0x20, &payload);

        let mut port = ScriptPort::new();
        port.respond_to(&[0xB5, 0x62, 0x01, 0x20], &response);

        // settings differ from the almanac figure: persist requested
        assert!(leap.poll(GnssId::U8, &mut port, &mut settings, 0));
        assert_eq!(leap.correction, 0);
        assert_eq!(settings.leapsecs, 18);

        // once valid, no further queries
        let sent_before = port.sent.len();
        assert!(!leap.poll(GnssId::U8, &mut port, &mut settings, 100_000));
        assert_eq!(port.sent.len(), sent_before);
    }

    #[test]
    fn test_non_ublox_assumed_valid() {
        let mut settings = Settings::default();
        let mut leap = LeapSeconds::new();
        let mut port = ScriptPort::new();
        assert!(!leap.poll(GnssId::Sony, &mut port, &mut settings, 0));
        assert_eq!(leap.correction, 0);
        assert!(port.sent.is_empty());
    }
}
