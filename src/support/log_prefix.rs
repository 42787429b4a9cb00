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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// about a session.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: String,
    session_id: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                session_id: None,
                helo: None,
            })),
        }
    }

    pub fn set_session_id(&self, session_id: String) {
        self.inner.lock().unwrap().session_id = Some(session_id);
    }

    /// Records the domain the peer announced in HELO/EHLO.
    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;

        if let Some(ref session_id) = inner.session_id {
            write!(f, "[{}]", session_id)?;
        }

        if let Some(ref helo) = inner.helo {
            write!(f, "({})", helo)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_rendering() {
        let prefix = LogPrefix::new("smtp:192.0.2.1:55555".to_owned());
        assert_eq!("smtp:192.0.2.1:55555", prefix.to_string());

        prefix.set_session_id("5634d14e2a".to_owned());
        assert_eq!("smtp:192.0.2.1:55555[5634d14e2a]", prefix.to_string());

        let clone = prefix.clone();
        clone.set_helo("mail.example.com".to_owned());
        assert_eq!(
            "smtp:192.0.2.1:55555[5634d14e2a](mail.example.com)",
            prefix.to_string(),
        );
    }
}
