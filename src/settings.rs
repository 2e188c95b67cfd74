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

//! Persisted settings: one `label,value` text line per setting, anything
//! after a `#` is a comment. The `squitter` version line must match on
//! load, otherwise the whole record is replaced by defaults and rewritten.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SETTINGS_VERSION: u8 = 3;

pub const RELAY_OFF: u8 = 0;
pub const RELAY_LANDED: u8 = 1;
pub const RELAY_ALL: u8 = 2;

pub const ADDR_TYPE_RANDOM: u8 = 0;
pub const ADDR_TYPE_ICAO: u8 = 1;
pub const ADDR_TYPE_FLARM: u8 = 2;
pub const ADDR_TYPE_OGN: u8 = 3;

pub const ALTPROTOCOL_NONE: u8 = 255;

/// debug_flags bit: consume $PFSIM simulated-traffic sentences
pub const DEBUG_SIMULATE: u32 = 0x01;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub version: u8,
    pub mode: u8,
    pub rf_protocol: u8,
    pub altprotocol: u8,
    pub band: u8,
    pub acft_type: u8,
    pub id_method: u8,
    pub aircraft_id: u32,
    pub ignore_id: u32,
    pub txpower: u8,
    pub baud_rate: u8,
    pub relay: u8,
    pub expire: i8,
    pub stealth: u8,
    pub no_track: u8,
    pub leapsecs: i8,
    pub freq_corr: i8,
    pub ppswire: u8,
    pub key: [u32; 4],
    pub debug_flags: u32,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            version: SETTINGS_VERSION,
            mode: 0,
            rf_protocol: super::protocol::PROTOCOL_ADSL,
            altprotocol: ALTPROTOCOL_NONE,
            band: 1, // EU
            acft_type: 1,
            id_method: ADDR_TYPE_FLARM,
            aircraft_id: 0,
            ignore_id: 0,
            txpower: 2,
            baud_rate: 0,
            relay: RELAY_OFF,
            expire: 5,
            stealth: 0,
            no_track: 0,
            leapsecs: 18,
            freq_corr: 0,
            ppswire: 1,
            key: [0; 4],
            debug_flags: 0,
        }
    }
}

enum Value {
    Int1(i8),
    Uint1(u8),
    Hex6(u32),
    Hex8(u32),
}

use self::Value::*;

impl Settings {
    fn fields(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("squitter", Uint1(self.version)),
            ("mode", Uint1(self.mode)),
            ("protocol", Uint1(self.rf_protocol)),
            ("altprotocol", Uint1(self.altprotocol)),
            ("band", Uint1(self.band)),
            ("acft_type", Uint1(self.acft_type)),
            ("id_method", Uint1(self.id_method)),
            ("aircraft_id", Hex6(self.aircraft_id)),
            ("ignore_id", Hex6(self.ignore_id)),
            ("tx_power", Uint1(self.txpower)),
            ("baud_rate", Uint1(self.baud_rate)),
            ("relay", Uint1(self.relay)),
            ("expire", Int1(self.expire)),
            ("stealth", Uint1(self.stealth)),
            ("no_track", Uint1(self.no_track)),
            ("leapsecs", Int1(self.leapsecs)),
            ("rfc", Int1(self.freq_corr)),
            ("ppswire", Uint1(self.ppswire)),
            ("key0", Hex8(self.key[0])),
            ("key1", Hex8(self.key[1])),
            ("key2", Hex8(self.key[2])),
            ("key3", Hex8(self.key[3])),
            ("debug_flags", Hex6(self.debug_flags)),
        ]
    }

    fn comment(label: &str) -> Option<&'static str> {
        match label {
            "protocol" => Some("1=ADS-L 2=Legacy"),
            "altprotocol" => Some("255=none"),
            "band" => Some("1=EU 2=US"),
            "acft_type" => Some("1=GL 2=TOWPL 6=HG 7=PG 0=landed out"),
            "id_method" => Some("1=ICAO 2=device"),
            "tx_power" => Some("0=off 1=low 2=full"),
            "baud_rate" => Some("0=default(38400) 2=9600 3=19200 4=38400 ..."),
            "relay" => Some("0=off 1=landed 2=all"),
            "expire" => Some("secs no-rx report 1-30"),
            "rfc" => Some("freq correction +-30"),
            "leapsecs" => Some("leap seconds - automatic"),
            _ => None,
        }
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("# squitter settings\r\n");

        for (label, value) in self.fields() {
            let mut line = match value {
                Int1(v) => format!("{},{}", label, v),
                Uint1(v) => format!("{},{}", label, v),
                Hex6(v) => format!("{},{:06X}", label, v),
                Hex8(v) => format!("{},{:08X}", label, v),
            };

            if let Some(c) = Settings::comment(label) {
                while line.len() < 18 {
                    line.push(' ');
                }
                line.push_str(" # ");
                line.push_str(c);
            }

            line.push_str("\r\n");
            out.push_str(&line);
        }

        out
    }

    /// Apply one `label,value` line onto `self`. Returns false when the
    /// label is unknown or the value does not parse.
    fn apply_line(&mut self, line: &str) -> bool {
        let comma = match line.find(',') {
            Some(i) => i,
            None => return false,
        };
        let label = &line[..comma];
        let mut value = &line[comma + 1..];

        // a numeric value ends at the first space; the rest is a comment
        if let Some(i) = value.find(' ') {
            value = &value[..i];
        }
        if let Some(i) = value.find(|c| c == '#' || c == '*' || c == ';' || c == '/') {
            value = &value[..i];
        }

        fn dec_i8(v: &str) -> Option<i8> {
            v.parse::<i8>().ok()
        }
        fn dec_u8(v: &str) -> Option<u8> {
            v.parse::<u8>().ok()
        }
        fn hex_u32(v: &str) -> Option<u32> {
            u32::from_str_radix(v, 16).ok()
        }

        match label {
            "squitter" => set_or(&mut self.version, dec_u8(value)),
            "mode" => set_or(&mut self.mode, dec_u8(value)),
            "protocol" => set_or(&mut self.rf_protocol, dec_u8(value)),
            "altprotocol" => set_or(&mut self.altprotocol, dec_u8(value)),
            "band" => set_or(&mut self.band, dec_u8(value)),
            "acft_type" => set_or(&mut self.acft_type, dec_u8(value)),
            "id_method" => set_or(&mut self.id_method, dec_u8(value)),
            "aircraft_id" => set_or(&mut self.aircraft_id, hex_u32(value)),
            "ignore_id" => set_or(&mut self.ignore_id, hex_u32(value)),
            "tx_power" => set_or(&mut self.txpower, dec_u8(value)),
            "baud_rate" => set_or(&mut self.baud_rate, dec_u8(value)),
            "relay" => set_or(&mut self.relay, dec_u8(value)),
            "expire" => set_or(&mut self.expire, dec_i8(value)),
            "stealth" => set_or(&mut self.stealth, dec_u8(value)),
            "no_track" => set_or(&mut self.no_track, dec_u8(value)),
            "leapsecs" => set_or(&mut self.leapsecs, dec_i8(value)),
            "rfc" => set_or(&mut self.freq_corr, dec_i8(value)),
            "ppswire" => set_or(&mut self.ppswire, dec_u8(value)),
            "key0" => set_or(&mut self.key[0], hex_u32(value)),
            "key1" => set_or(&mut self.key[1], hex_u32(value)),
            "key2" => set_or(&mut self.key[2], hex_u32(value)),
            "key3" => set_or(&mut self.key[3], hex_u32(value)),
            "debug_flags" => set_or(&mut self.debug_flags, hex_u32(value)),
            _ => false,
        }
    }

    /// Post-load adjustment: clamp the numeric settings that have hard
    /// operational limits.
    pub fn adjust(&mut self) {
        clamp_i8(&mut self.leapsecs, 17, 19);
        clamp_i8(&mut self.freq_corr, -30, 30);
        clamp_i8(&mut self.expire, 1, 30);
        if self.txpower > 2 {
            self.txpower = 2;
        }
        // a winch announcing itself must be heard across the airfield
        if self.acft_type == super::protocol::AIRCRAFT_TYPE_WINCH && self.txpower == 1 {
            self.txpower = 2;
        }
    }

    pub fn from_text(text: &str) -> Option<Settings> {
        let mut settings = Settings::default();
        settings.version = 0; // must come from the file
        let mut nsettings = 0;

        for line in text.lines().take(200) {
            match line.chars().next() {
                None | Some('#') | Some('*') | Some(';') | Some('/') | Some(' ') => continue,
                _ => {}
            }
            if settings.apply_line(line.trim_end()) {
                nsettings += 1;
            } else {
                info!("ignoring settings line: {}", line);
            }
        }

        if settings.version != SETTINGS_VERSION || nsettings == 0 {
            return None;
        }

        settings.adjust();
        Some(settings)
    }
}

fn set_or<T>(slot: &mut T, parsed: Option<T>) -> bool {
    match parsed {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

fn clamp_i8(v: &mut i8, min: i8, max: i8) {
    if *v < min {
        *v = min;
    }
    if *v > max {
        *v = max;
    }
}

pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> SettingsStore {
        SettingsStore {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Load settings, substituting and rewriting defaults when the file is
    /// missing, unreadable, or carries the wrong version.
    pub fn load(&self) -> Settings {
        match fs::read_to_string(&self.path) {
            Ok(text) => {
                if let Some(s) = Settings::from_text(&text) {
                    info!("settings loaded from {:?}", self.path);
                    return s;
                }
                warn!("bad settings version in {:?}, reverting to defaults", self.path);
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no settings file at {:?}, using defaults", self.path);
            }
            Err(e) => warn!("could not read {:?}: {}", self.path, e),
        }

        let defaults = Settings::default();
        if let Err(e) = self.save(&defaults) {
            warn!("could not rewrite {:?}: {}", self.path, e);
        }
        defaults
    }

    pub fn save(&self, settings: &Settings) -> io::Result<()> {
        fs::write(&self.path, settings.to_text())
    }
}
