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

pub const MPS_PER_KNOT: f32 = 0.51444444_f32;
pub const FEET_PER_METER: f32 = 3.2808399_f32;

#[macro_export]
macro_rules! m_to_ft {
    ($x:expr) => (($x as f32) * 3.2808399_f32);
}

/// Run `$action` at roughly `$hz` per second from inside a pass that
/// repeats at `$handle.get_frequency()`. `$countdown` is a caller-owned
/// `u32`; starting it at 0 fires on the first pass, then the countdown
/// is reloaded from the current pass frequency each time it expires.
#[macro_export]
macro_rules! run_at_hz {
    ($hz:expr, $countdown:expr, $handle:expr, $action:block) => {
        if $countdown > 0 {
            $countdown -= 1;
        } else {
            $countdown = ($handle.get_frequency() as f32 / $hz as f32) as u32;
            if $countdown > 0 {
                $countdown -= 1;
            }
            $action;
        }
    }
}
