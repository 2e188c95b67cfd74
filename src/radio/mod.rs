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

//! The capability contract between the slot scheduler and whatever
//! transceiver is fitted. Concrete drivers live with the board support;
//! the pipeline only sees this trait.

pub mod link;

use processor::Report;
use sensor::SensorData;
use squitter::handle::Pushable;
use std::iter::Chain;
use std::slice::Iter;

pub use protocol::MAX_PKT_SIZE;

#[derive(Debug, PartialEq, Copy, Clone)]
pub enum RadioError {
    /// previous transmit still in flight
    Busy,
    NotReady,
    /// requires a chip reset, never a pipeline abort
    HardwareFault,
}

/// Transceivers a concrete driver may identify as.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum RfChipKind {
    Nrf905,
    Sx1276,
    Sx1262,
    Uatm,
    Cc13xx,
}

#[derive(Debug, PartialEq, Copy, Clone)]
pub struct RxFrame {
    pub len: usize,
    pub rssi: i8,
    /// frame check sequence as reported by the chip
    pub crc: u32,
}

pub trait Radio {
    fn kind(&self) -> RfChipKind;
    fn set_channel(&mut self, freq_hz: u32);
    /// Non-blocking; must report `Busy` immediately while the previous
    /// transmit is in flight.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), RadioError>;
    fn receive_ready(&mut self) -> bool;
    fn read_packet(&mut self, buf: &mut [u8; MAX_PKT_SIZE]) -> Option<RxFrame>;
    fn reset(&mut self) -> Result<(), RadioError>;
    fn shutdown(&mut self);
}

/// Carrier frequency for the configured band, with the per-unit ppm
/// correction applied.
pub fn band_frequency(band: u8, freq_corr_ppm: i8) -> u32 {
    let base: u32 = match band {
        2 => 915_000_000, // US
        3 => 470_000_000, // CN
        _ => 869_525_000, // EU SRD-860
    };
    (base as i64 + base as i64 * freq_corr_ppm as i64 / 1_000_000) as u32
}

pub type ChainedIter<'a> = Chain<Iter<'a, Report>, Iter<'a, Report>>;

/// A `Link` consumes the processors' reports and loops anything it
/// receives off the air back into the sensor layer.
pub trait Link {
    fn run(&mut self, handle: &mut Pushable<SensorData>, i: ChainedIter);

    fn shutdown(&mut self) {}
}

/// Placeholder driver for benches without a fitted radio: transmits
/// disappear, nothing is ever received.
pub struct NullRadio;

impl Radio for NullRadio {
    fn kind(&self) -> RfChipKind {
        RfChipKind::Sx1276
    }

    fn set_channel(&mut self, _freq_hz: u32) {}

    fn transmit(&mut self, _bytes: &[u8]) -> Result<(), RadioError> {
        Ok(())
    }

    fn receive_ready(&mut self) -> bool {
        false
    }

    fn read_packet(&mut self, _buf: &mut [u8; MAX_PKT_SIZE]) -> Option<RxFrame> {
        None
    }

    fn reset(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}
