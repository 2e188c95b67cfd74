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

pub mod ownship;
pub mod timebase;
pub mod traffic;

use sensor::SensorData;
use squitter::handle::Pushable;
use std::iter::Chain;
use std::slice::Iter;

#[derive(Debug)]
pub enum Report {
    Clock(timebase::SlotClock),
    Ownship(ownship::Ownship),
    Traffic(traffic::Target),
}

pub type ChainedIter<'a> = Chain<Iter<'a, SensorData>, Iter<'a, SensorData>>;

/// A `Processor` folds the pass's fix and traffic events into its own
/// state and reports what the RF link needs downstream: the slot clock,
/// the current ownship state, and the tracked traffic.
pub trait Processor {
    /// Consume this pass's sensor events, pushing `Clock`, `Ownship`
    /// or `Traffic` reports as they become due.
    fn run(&mut self, handle: &mut Pushable<Report>, i: ChainedIter);
}
