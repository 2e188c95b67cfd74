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

//! Character-at-a-time NMEA sentence parser. Values parsed out of a
//! sentence stay in a staging slot until the checksum passes, then all of
//! them commit at once, stamped with the monotonic ms of the commit.

const MAX_FIELD_SIZE: usize = 33;

/// A parsed value with its committed/staged pair. `age()` is measured
/// from the last commit, not from the last staging.
pub struct Committed<T> {
    value: T,
    staged: T,
    commit_ms: u32,
    valid: bool,
    updated: bool,
}

impl<T: Copy + Default> Committed<T> {
    fn new() -> Committed<T> {
        Committed {
            value: T::default(),
            staged: T::default(),
            commit_ms: 0,
            valid: false,
            updated: false,
        }
    }
}

impl<T: Copy> Committed<T> {
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_updated(&self) -> bool {
        self.updated
    }

    pub fn age(&self, now_ms: u32) -> u32 {
        if self.valid {
            now_ms.wrapping_sub(self.commit_ms)
        } else {
            u32::max_value()
        }
    }

    pub fn commit_ms(&self) -> u32 {
        self.commit_ms
    }

    /// Read the committed value, clearing the updated flag.
    pub fn get(&mut self) -> T {
        self.updated = false;
        self.value
    }

    pub fn peek(&self) -> T {
        self.value
    }

    fn commit(&mut self, now_ms: u32) {
        self.value = self.staged;
        self.commit_ms = now_ms;
        self.valid = true;
        self.updated = true;
    }
}

/// Hour, minute, second, centisecond.
pub type Hmsc = (u8, u8, u8, u8);
/// Day, month, two-digit year.
pub type Dmy = (u8, u8, u8);

#[derive(Debug, PartialEq, Copy, Clone)]
enum SentenceType {
    Gga,
    Rmc,
    Other,
}

#[derive(Copy, Clone)]
pub struct CustomHandle(usize);

struct CustomField {
    sentence: String,
    term: u8,
    staging: String,
    value: String,
    valid: bool,
    updated: bool,
}

pub struct NmeaParser {
    /// (lat, lon) in signed decimal degrees
    pub location: Committed<(f64, f64)>,
    pub date: Committed<Dmy>,
    pub time: Committed<Hmsc>,
    /// knots
    pub speed: Committed<f32>,
    /// degrees true
    pub course: Committed<f32>,
    /// metres MSL
    pub altitude: Committed<f32>,
    pub satellites: Committed<u32>,
    pub hdop: Committed<f32>,
    /// geoid separation in metres
    pub separation: Committed<f32>,

    parity: u8,
    is_checksum_term: bool,
    term: [u8; MAX_FIELD_SIZE],
    term_offset: usize,
    term_number: u8,
    sentence_type: SentenceType,
    sentence_has_fix: bool,
    sentence_name: String,
    gga_had_separation: bool,

    customs: Vec<CustomField>,
    customs_active: bool,

    passed_checksum: u32,
    failed_checksum: u32,
}

impl NmeaParser {
    pub fn new() -> NmeaParser {
        NmeaParser {
            location: Committed::new(),
            date: Committed::new(),
            time: Committed::new(),
            speed: Committed::new(),
            course: Committed::new(),
            altitude: Committed::new(),
            satellites: Committed::new(),
            hdop: Committed::new(),
            separation: Committed::new(),
            parity: 0,
            is_checksum_term: false,
            term: [0; MAX_FIELD_SIZE],
            term_offset: 0,
            term_number: 0,
            sentence_type: SentenceType::Other,
            sentence_has_fix: false,
            sentence_name: String::new(),
            gga_had_separation: false,
            customs: Vec::new(),
            customs_active: false,
            passed_checksum: 0,
            failed_checksum: 0,
        }
    }

    /// Subscribe to a non-standard term, e.g. `("PFSIM", 1)`.
    pub fn register_custom(&mut self, sentence: &str, term: u8) -> CustomHandle {
        self.customs.push(CustomField {
            sentence: sentence.to_string(),
            term,
            staging: String::new(),
            value: String::new(),
            valid: false,
            updated: false,
        });
        CustomHandle(self.customs.len() - 1)
    }

    pub fn custom_updated(&self, h: CustomHandle) -> bool {
        self.customs[h.0].updated
    }

    pub fn custom_valid(&self, h: CustomHandle) -> bool {
        self.customs[h.0].valid
    }

    /// Read a committed custom term, clearing its updated flag.
    pub fn custom_value(&mut self, h: CustomHandle) -> &str {
        self.customs[h.0].updated = false;
        &self.customs[h.0].value
    }

    pub fn passed_checksum(&self) -> u32 {
        self.passed_checksum
    }

    pub fn failed_checksum(&self) -> u32 {
        self.failed_checksum
    }

    /// Whether the most recently completed GGA carried a non-empty geoid
    /// separation term (the "good GGA" sentinel).
    pub fn gga_had_separation(&self) -> bool {
        self.gga_had_separation
    }

    /// Accept one character. Returns true exactly when a sentence has just
    /// completed with a passing checksum.
    pub fn encode(&mut self, c: u8, now_ms: u32) -> bool {
        match c {
            b',' | b'\r' | b'\n' | b'*' => {
                if c == b',' {
                    self.parity ^= c;
                }
                let mut is_valid_sentence = false;
                if self.term_offset < MAX_FIELD_SIZE {
                    is_valid_sentence = self.end_of_term(now_ms);
                }
                self.term_number = self.term_number.wrapping_add(1);
                self.term_offset = 0;
                self.is_checksum_term = c == b'*';
                is_valid_sentence
            }
            b'$' => {
                self.term_number = 0;
                self.term_offset = 0;
                self.parity = 0;
                self.sentence_type = SentenceType::Other;
                self.is_checksum_term = false;
                self.sentence_has_fix = false;
                false
            }
            _ => {
                if self.term_offset < MAX_FIELD_SIZE - 1 {
                    self.term[self.term_offset] = c;
                    self.term_offset += 1;
                }
                if !self.is_checksum_term {
                    self.parity ^= c;
                }
                false
            }
        }
    }

    fn term_str(&self) -> &str {
        ::std::str::from_utf8(&self.term[..self.term_offset]).unwrap_or("")
    }

    fn end_of_term(&mut self, now_ms: u32) -> bool {
        if self.is_checksum_term {
            let t = &self.term[..self.term_offset];
            if t.len() < 2 {
                return false;
            }
            let checksum = 16 * from_hex(t[0]) + from_hex(t[1]);
            if checksum != self.parity as i32 {
                self.failed_checksum += 1;
                return false;
            }

            self.passed_checksum += 1;
            match self.sentence_type {
                SentenceType::Rmc => {
                    self.date.commit(now_ms);
                    self.time.commit(now_ms);
                    if self.sentence_has_fix {
                        self.location.commit(now_ms);
                        self.speed.commit(now_ms);
                        self.course.commit(now_ms);
                    }
                }
                SentenceType::Gga => {
                    self.time.commit(now_ms);
                    if self.sentence_has_fix {
                        self.location.commit(now_ms);
                        self.altitude.commit(now_ms);
                        self.separation.commit(now_ms);
                    }
                    self.satellites.commit(now_ms);
                    self.hdop.commit(now_ms);
                }
                SentenceType::Other => {}
            }

            if self.customs_active {
                let name = &self.sentence_name;
                for f in self.customs.iter_mut() {
                    if f.sentence == *name {
                        f.value.clear();
                        f.value.push_str(&f.staging);
                        f.valid = true;
                        f.updated = true;
                    }
                }
            }
            return true;
        }

        // the first term determines the sentence type
        if self.term_number == 0 {
            self.sentence_type = match self.term_str() {
                "GPRMC" | "GNRMC" => SentenceType::Rmc,
                "GPGGA" | "GNGGA" => SentenceType::Gga,
                _ => SentenceType::Other,
            };
            if self.sentence_type == SentenceType::Gga {
                self.gga_had_separation = false;
            }
            let name = self.term;
            let len = self.term_offset;
            self.sentence_name.clear();
            self.sentence_name
                .push_str(::std::str::from_utf8(&name[..len]).unwrap_or(""));
            let name = &self.sentence_name;
            self.customs_active = self.customs.iter().any(|f| f.sentence == *name);
            return false;
        }

        if self.term_offset > 0 {
            match (self.sentence_type, self.term_number) {
                (SentenceType::Rmc, 1) | (SentenceType::Gga, 1) => {
                    self.time.staged = parse_time(self.term_str(), self.time.staged);
                }
                (SentenceType::Rmc, 2) => {
                    self.sentence_has_fix = self.term[0] == b'A';
                }
                (SentenceType::Rmc, 3) | (SentenceType::Gga, 2) => {
                    self.location.staged.0 = parse_degrees(self.term_str());
                }
                (SentenceType::Rmc, 4) | (SentenceType::Gga, 3) => {
                    if self.term[0] == b'S' {
                        self.location.staged.0 = -self.location.staged.0;
                    }
                }
                (SentenceType::Rmc, 5) | (SentenceType::Gga, 4) => {
                    self.location.staged.1 = parse_degrees(self.term_str());
                }
                (SentenceType::Rmc, 6) | (SentenceType::Gga, 5) => {
                    if self.term[0] == b'W' {
                        self.location.staged.1 = -self.location.staged.1;
                    }
                }
                (SentenceType::Rmc, 7) => {
                    self.speed.staged = parse_decimal(self.term_str());
                }
                (SentenceType::Rmc, 8) => {
                    self.course.staged = parse_decimal(self.term_str());
                }
                (SentenceType::Rmc, 9) => {
                    self.date.staged = parse_date(self.term_str(), self.date.staged);
                }
                (SentenceType::Gga, 6) => {
                    self.sentence_has_fix = self.term[0] > b'0';
                }
                (SentenceType::Gga, 7) => {
                    self.satellites.staged = parse_integer(self.term_str());
                }
                (SentenceType::Gga, 8) => {
                    self.hdop.staged = parse_decimal(self.term_str());
                }
                (SentenceType::Gga, 9) => {
                    self.altitude.staged = parse_decimal(self.term_str());
                }
                (SentenceType::Gga, 11) => {
                    self.separation.staged = parse_decimal(self.term_str());
                    self.gga_had_separation = true;
                }
                _ => {}
            }
        }

        if self.customs_active {
            let term_number = self.term_number;
            let term = ::std::str::from_utf8(&self.term[..self.term_offset]).unwrap_or("");
            let name = &self.sentence_name;
            for f in self.customs.iter_mut() {
                if f.term == term_number && f.sentence == *name {
                    f.staging.clear();
                    f.staging.push_str(term);
                }
            }
        }

        false
    }
}

fn from_hex(a: u8) -> i32 {
    match a {
        b'A'...b'F' => (a - b'A') as i32 + 10,
        b'a'...b'f' => (a - b'a') as i32 + 10,
        _ => (a as i32) - (b'0' as i32),
    }
}

const POWERS_OF_10: [f32; 5] = [0.1, 0.01, 0.001, 0.0001, 0.00001];

/// Parse a (potentially negative) number with up to 5 decimal digits,
/// -xxxx.yyyyy
pub fn parse_decimal(term: &str) -> f32 {
    let bytes = term.as_bytes();
    let negative = bytes.first() == Some(&b'-');
    let mut i = if negative { 1 } else { 0 };

    let mut whole: i64 = 0;
    while i < bytes.len() && is_digit(bytes[i]) {
        whole = 10 * whole + (bytes[i] - b'0') as i64;
        i += 1;
    }
    let mut ret = whole as f32;

    if i < bytes.len() && bytes[i] == b'.' {
        i += 1;
        if i < bytes.len() && is_digit(bytes[i]) {
            let mut more_digits = 0;
            let mut fraction = (bytes[i] - b'0') as u32;
            i += 1;
            while more_digits < 4 && i < bytes.len() && is_digit(bytes[i]) {
                fraction = 10 * fraction + (bytes[i] - b'0') as u32;
                more_digits += 1;
                i += 1;
            }
            ret += POWERS_OF_10[more_digits] * fraction as f32;
        }
    }

    if negative {
        -ret
    } else {
        ret
    }
}

fn parse_integer(term: &str) -> u32 {
    let mut v: u32 = 0;
    for &b in term.as_bytes() {
        if !is_digit(b) {
            break;
        }
        v = 10 * v + (b - b'0') as u32;
    }
    v
}

fn is_digit(b: u8) -> bool {
    b >= b'0' && b <= b'9'
}

/// Parse two digits in place within a longer string.
fn parse_2digits(p: &[u8]) -> i32 {
    if p.len() < 2 || !is_digit(p[0]) || !is_digit(p[1]) {
        return -1;
    }
    (10 * (p[0] - b'0') + (p[1] - b'0')) as i32
}

/// Parse a date in the format DDMMYY. Malformed tails leave the
/// remaining fields as they were.
fn parse_date(term: &str, mut date: Dmy) -> Dmy {
    let b = term.as_bytes();
    let day = parse_2digits(b);
    if day < 0 {
        return date;
    }
    date.0 = day as u8;
    let month = parse_2digits(&b[2..]);
    if month < 0 {
        return date;
    }
    date.1 = month as u8;
    let year = parse_2digits(&b[4..]);
    if year < 0 {
        return date;
    }
    date.2 = year as u8;
    date
}

/// Parse a time in the format HHMMSS.CC; centiseconds default to 0.
fn parse_time(term: &str, mut time: Hmsc) -> Hmsc {
    let b = term.as_bytes();
    let hour = parse_2digits(b);
    if hour < 0 {
        return time;
    }
    time.0 = hour as u8;
    let minute = parse_2digits(&b[2..]);
    if minute < 0 {
        return time;
    }
    time.1 = minute as u8;
    let second = parse_2digits(&b[4..]);
    if second < 0 {
        return time;
    }
    time.2 = second as u8;
    time.3 = 0;
    if b.len() > 7 && b[6] == b'.' && is_digit(b[7]) {
        time.3 = 10 * (b[7] - b'0');
        if b.len() > 8 && is_digit(b[8]) {
            time.3 += b[8] - b'0';
        }
    }
    time
}

/// Parse degrees in the NMEA format DDMM.MMMM / DDDMM.MMMM - always
/// positive. Returns 0.0 on anything malformed.
pub fn parse_degrees(term: &str) -> f64 {
    let b = term.as_bytes();
    if b.len() < 5 {
        return 0.0;
    }
    for i in 0..4 {
        if !is_digit(b[i]) {
            return 0.0;
        }
    }

    let deg;
    let minutes;
    if b[4] == b'.' {
        // latitude DDMM.MMMM
        deg = (10 * (b[0] - b'0') + (b[1] - b'0')) as i32;
        minutes = &term[2..];
    } else if b.len() > 5 && is_digit(b[4]) && b[5] == b'.' {
        // longitude DDDMM.MMMM
        if b[0] == b'0' {
            deg = (10 * (b[1] - b'0') + (b[2] - b'0')) as i32;
        } else if b[0] == b'1' {
            deg = 100 + (10 * (b[1] - b'0') + (b[2] - b'0')) as i32;
        } else {
            return 0.0;
        }
        minutes = &term[3..];
    } else {
        return 0.0;
    }

    deg as f64 + (1.0 / 60.0) * parse_decimal(minutes) as f64
}
