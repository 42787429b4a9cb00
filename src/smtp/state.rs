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
use std::net::IpAddr;
use std::str;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use lazy_static::lazy_static;

use super::service::User;
use super::syntax::MailAddress;

/// Identifier of one accepted connection.
///
/// Renders as the unpadded lower-case hex of the accept timestamp followed by
/// the unpadded lower-case hex of a process-wide counter. The counter only
/// guarantees uniqueness within one process; the timestamp prefix makes
/// collisions across restarts unlikely. It is not ordered across sessions
/// sharing a timestamp.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionId {
    pub timestamp: i64,
    pub counter: u32,
}

lazy_static! {
    static ref SESSION_COUNTER: Mutex<u32> = Mutex::new(0);
}

impl SessionId {
    /// Allocates the next session id.
    pub fn generate() -> Self {
        let mut counter = SESSION_COUNTER.lock().unwrap();
        *counter = counter.wrapping_add(1);
        SessionId {
            timestamp: Utc::now().timestamp(),
            counter: *counter,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}{:x}", self.timestamp, self.counter)
    }
}

/// Everything the protocol engine accumulates for one connection.
///
/// The mail handler receives this record when a message has been fully
/// received; `from`, `to` and `data` are guaranteed non-empty at that point.
pub struct SessionState {
    pub session_id: SessionId,
    /// Observed remote address.
    pub peer_ip: IpAddr,
    /// The domain most recently announced via HELO or EHLO; empty until
    /// then.
    pub hostname: String,
    /// Whether STARTTLS has completed on this connection. Never reverts to
    /// false.
    pub secure: bool,
    pub authenticated: bool,
    /// Principal returned by the auth backend; `Some` iff `authenticated`.
    pub principal: Option<Arc<dyn User>>,
    /// Envelope sender; `None` until a MAIL command is accepted.
    pub from: Option<MailAddress>,
    /// Accepted recipients, in order.
    pub to: Vec<MailAddress>,
    /// Whether the accepted MAIL command carried `BODY=8BITMIME`.
    pub eight_bit_mime: bool,
    /// The decoded message body accumulated by DATA.
    pub data: Vec<u8>,
}

impl SessionState {
    pub fn new(session_id: SessionId, peer_ip: IpAddr) -> Self {
        SessionState {
            session_id,
            peer_ip,
            hostname: String::new(),
            secure: false,
            authenticated: false,
            principal: None,
            from: None,
            to: Vec::new(),
            eight_bit_mime: false,
            data: Vec::new(),
        }
    }

    /// Clears the envelope and body.
    ///
    /// Connection-level facts (hostname, TLS, authentication, identity)
    /// survive a reset.
    pub fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
        self.eight_bit_mime = false;
    }

    /// Whether a MAIL command may be accepted now.
    pub fn can_mail(&self) -> Result<(), &'static str> {
        if self.from.is_some() {
            return Err("Sender already specified");
        }

        Ok(())
    }

    /// Whether a RCPT command may be accepted now.
    pub fn can_rcpt(&self) -> Result<(), &'static str> {
        if self.from.is_none() {
            return Err("Need mail before RCPT");
        }

        Ok(())
    }

    /// Whether a DATA command may be accepted now.
    pub fn can_data(&self) -> Result<(), &'static str> {
        if self.from.is_none() {
            return Err("Need mail before DATA");
        }

        if self.to.is_empty() {
            return Err("Need RCPT before DATA");
        }

        Ok(())
    }

    /// Checks that the authenticated principal owns the envelope sender.
    ///
    /// The comparison is byte equality of the printable sender address and
    /// the principal's username.
    pub fn auth_matches(&self) -> Result<(), String> {
        let username = self
            .principal
            .as_deref()
            .map(|user| user.username())
            .unwrap_or_default();

        match self.from {
            Some(ref from) if from.address() == username => Ok(()),
            _ => Err(format!(
                "5.7.1 Sender address rejected: not owned by user {}",
                username,
            )),
        }
    }

    /// Prepends a header line to the accumulated message data.
    pub fn add_header(&mut self, name: &str, value: &str) {
        let mut header = format!("{}: {}\n", name, value).into_bytes();
        header.append(&mut self.data);
        self.data = header;
    }

    /// Returns the value of the first header with the given name, matched
    /// case-insensitively.
    ///
    /// Only the header block is searched, i.e. lines before the first empty
    /// line. Continuation lines are not folded in.
    pub fn get_header(&self, name: &str) -> Option<&str> {
        let text = str::from_utf8(&self.data).ok()?;

        for line in text.lines() {
            if line.is_empty() {
                break;
            }

            if let Some((key, value)) = line.split_once(':') {
                if key.eq_ignore_ascii_case(name) {
                    return Some(value.trim());
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn state() -> SessionState {
        SessionState::new(SessionId::default(), "127.0.0.1".parse().unwrap())
    }

    struct TestUser(&'static str);

    impl User for TestUser {
        fn username(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn session_id_rendering() {
        let id = SessionId {
            timestamp: 1446302030,
            counter: 42,
        };
        assert_eq!("5634d14e2a", id.to_string());

        let id = SessionId {
            timestamp: 2147483648,
            counter: 4294967295,
        };
        assert_eq!("80000000ffffffff", id.to_string());
    }

    #[test]
    fn session_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn sequencing_predicates() {
        let mut state = state();
        assert_eq!(Ok(()), state.can_mail());
        assert_eq!(Err("Need mail before RCPT"), state.can_rcpt());
        assert_eq!(Err("Need mail before DATA"), state.can_data());

        state.from = Some(MailAddress::parse("bob@example.org").unwrap());
        assert_eq!(Err("Sender already specified"), state.can_mail());
        assert_eq!(Ok(()), state.can_rcpt());
        assert_eq!(Err("Need RCPT before DATA"), state.can_data());

        state.to.push(MailAddress::parse("alice@example.com").unwrap());
        assert_eq!(Ok(()), state.can_data());
    }

    #[test]
    fn reset_clears_only_the_envelope() {
        let mut state = state();
        state.hostname = "mail.example.org".to_owned();
        state.secure = true;
        state.authenticated = true;
        state.principal = Some(Arc::new(TestUser("bob@example.org")));
        state.from = Some(MailAddress::parse("bob@example.org").unwrap());
        state.to.push(MailAddress::parse("alice@example.com").unwrap());
        state.eight_bit_mime = true;
        state.data = b"body".to_vec();

        state.reset();

        assert_eq!(None, state.from);
        assert!(state.to.is_empty());
        assert!(state.data.is_empty());
        assert!(!state.eight_bit_mime);
        assert_eq!("mail.example.org", state.hostname);
        assert!(state.secure);
        assert!(state.authenticated);
        assert!(state.principal.is_some());

        // A second reset is a no-op.
        state.reset();
        assert_eq!(None, state.from);
        assert!(state.to.is_empty());
    }

    #[test]
    fn auth_matching() {
        let mut state = state();
        state.principal = Some(Arc::new(TestUser("bob@example.org")));
        state.from = Some(MailAddress::parse("bob@example.org").unwrap());
        assert_eq!(Ok(()), state.auth_matches());

        state.from = Some(MailAddress::parse("mallory@example.org").unwrap());
        assert_eq!(
            Err("5.7.1 Sender address rejected: not owned by user \
                 bob@example.org"
                .to_owned()),
            state.auth_matches(),
        );
    }

    #[test]
    fn header_editing() {
        let mut state = state();
        state.data = b"From: sender@example.com\n\
                       To: recipient@example.com\n\
                       X-Spam-Score: -5.1\n\
                       Subject: Test Subject\n\
                       \n\
                       This is the body of the email.\n"
            .to_vec();

        assert_eq!(Some("recipient@example.com"), state.get_header("To"));
        assert_eq!(Some("recipient@example.com"), state.get_header("to"));
        assert_eq!(Some("recipient@example.com"), state.get_header("TO"));
        assert_eq!(Some("sender@example.com"), state.get_header("From"));
        assert_eq!(Some("-5.1"), state.get_header("X-Spam-Score"));
        assert_eq!(None, state.get_header("Date"));
        // "body" occurs after the blank line and is not a header.
        assert_eq!(None, state.get_header("This is the body of the email."));

        state.add_header("MessageId", "some-value@localhost");
        assert_eq!(
            Some("some-value@localhost"),
            state.get_header("MessageId"),
        );
        assert_eq!(Some("sender@example.com"), state.get_header("From"));
        assert!(state.data.ends_with(b"This is the body of the email.\n"));
    }
}
