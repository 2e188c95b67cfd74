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

use std::collections::VecDeque;
use std::time::Instant;

pub trait Handle {
    /// Monotonic milliseconds since pipeline start, fixed for the pass.
    fn get_ms(&self) -> u32;
    fn get_frequency(&self) -> u16;
}

pub trait Pushable<D>: Handle {
    fn push_data(&mut self, d: D);
}

pub struct BasicHandle {
    ms: u32,
    freq: u16,
}

impl Handle for BasicHandle {
    fn get_ms(&self) -> u32 {
        self.ms
    }

    fn get_frequency(&self) -> u16 {
        self.freq
    }
}

impl BasicHandle {
    pub fn new(freq: u16, origin: Instant) -> Self {
        let elapsed = origin.elapsed();
        let ms = (elapsed.as_secs() as u32)
            .wrapping_mul(1000)
            .wrapping_add(elapsed.subsec_nanos() / 1_000_000);
        Self { ms, freq }
    }

    /// A handle at an exact millisecond, for tests and simulation.
    pub fn with_ms(freq: u16, ms: u32) -> Self {
        Self { ms, freq }
    }
}

pub struct PushableHandle<'a, H, D>
    where D: 'a,
          H: 'a + Handle
{
    handle: &'a mut H,
    queue: &'a mut VecDeque<D>,
}

impl<'a, H, D> Handle for PushableHandle<'a, H, D>
    where H: 'a + Handle
{
    fn get_ms(&self) -> u32 {
        self.handle.get_ms()
    }

    fn get_frequency(&self) -> u16 {
        self.handle.get_frequency()
    }
}

impl<'a, H, D> Pushable<D> for PushableHandle<'a, H, D>
    where H: 'a + Handle
{
    fn push_data(&mut self, d: D) {
        self.queue.push_back(d);
    }
}

impl<'a, H, D> PushableHandle<'a, H, D>
    where H: 'a + Handle
{
    pub fn new(handle: &'a mut H, queue: &'a mut VecDeque<D>) -> Self {
        Self { handle, queue }
    }
}
