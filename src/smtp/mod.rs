//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Postern is distributed in the hope that  it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Postern. If not, see <http://www.gnu.org/licenses/>.

//! Server-side SMTP per RFC 5321, with the STARTTLS (RFC 3207) and AUTH
//! PLAIN (RFC 4954) extensions.

pub mod codes;
pub mod data;
pub mod server;
pub mod service;
pub mod state;
pub mod syntax;

#[cfg(test)]
mod integration_test_common;
