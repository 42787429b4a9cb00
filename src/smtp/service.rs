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

//! The collaborators the protocol engine consults but does not implement:
//! credential checking, IP reputation, and downstream mail handling.
#![allow(dead_code)]

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::prelude::*;
use log::info;
use thiserror::Error;

use super::codes::*;
use super::state::SessionState;

/// An SMTP reply carried as data: a status code and the human-readable text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmtpResponse(pub ReplyCode, pub Cow<'static, str>);

/// The canned RFC 5321 § 4.2.3 replies, for mail handlers that want to
/// reject a message with a standard text.
impl SmtpResponse {
    pub const SERVICE_NOT_AVAILABLE: SmtpResponse = SmtpResponse(
        pc::ServiceNotAvailableClosing,
        Cow::Borrowed("Service not available, closing transmission channel"),
    );
    pub const MAILBOX_NOT_AVAILABLE_TEMPORARY: SmtpResponse = SmtpResponse(
        pc::ActionNotTakenTemporary,
        Cow::Borrowed("Requested mail action not taken: mailbox unavailable"),
    );
    pub const LOCAL_ERROR: SmtpResponse = SmtpResponse(
        pc::ActionAborted,
        Cow::Borrowed("Requested action aborted: local error in processing"),
    );
    pub const INSUFFICIENT_STORAGE: SmtpResponse = SmtpResponse(
        pc::InsufficientStorage,
        Cow::Borrowed(
            "Requested action not taken: insufficient system storage",
        ),
    );
    pub const UNABLE_TO_ACCOMMODATE_PARAMETERS: SmtpResponse = SmtpResponse(
        pc::UnableToAccommodateParameters,
        Cow::Borrowed("Server unable to accommodate parameters"),
    );
    pub const SYNTAX_ERROR: SmtpResponse = SmtpResponse(
        pc::CommandSyntaxError,
        Cow::Borrowed("Syntax error, command unrecognized"),
    );
    pub const SYNTAX_ERROR_IN_PARAMETERS: SmtpResponse = SmtpResponse(
        pc::ParameterSyntaxError,
        Cow::Borrowed("Syntax error in parameters or arguments"),
    );
    pub const COMMAND_NOT_IMPLEMENTED: SmtpResponse = SmtpResponse(
        pc::CommandNotImplemented,
        Cow::Borrowed("Command not implemented"),
    );
    pub const BAD_SEQUENCE: SmtpResponse = SmtpResponse(
        pc::BadSequenceOfCommands,
        Cow::Borrowed("Bad sequence of commands"),
    );
    pub const PARAMETER_NOT_IMPLEMENTED: SmtpResponse = SmtpResponse(
        pc::CommandParameterNotImplemented,
        Cow::Borrowed("Command parameter not implemented"),
    );
    pub const MAILBOX_NOT_AVAILABLE: SmtpResponse = SmtpResponse(
        pc::ActionNotTakenPermanent,
        Cow::Borrowed("Requested action not taken: mailbox unavailable"),
    );
    pub const USER_NOT_LOCAL: SmtpResponse =
        SmtpResponse(pc::UserNotLocal, Cow::Borrowed("User not local"));
    pub const EXCEEDED_STORAGE: SmtpResponse = SmtpResponse(
        pc::ExceededStorageAllocation,
        Cow::Borrowed(
            "Requested mail action aborted: exceeded storage allocation",
        ),
    );
    pub const MAILBOX_NAME_NOT_ALLOWED: SmtpResponse = SmtpResponse(
        pc::MailboxNameNotAllowed,
        Cow::Borrowed("Requested action not taken: mailbox name not allowed"),
    );
    pub const TRANSACTION_FAILED: SmtpResponse = SmtpResponse(
        pc::TransactionFailed,
        Cow::Borrowed("Transaction failed"),
    );
    pub const MAIL_PARAMETERS_NOT_IMPLEMENTED: SmtpResponse = SmtpResponse(
        pc::ParametersNotImplemented,
        Cow::Borrowed(
            "MAIL FROM/RCPT TO parameters not recognized or not implemented",
        ),
    );
}

/// An authenticated identity, as produced by an [`AuthBackend`].
pub trait User: Send + Sync {
    /// The username / mail address the credentials belong to.
    fn username(&self) -> &str;
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The backend could not reach a verdict; the client may retry later.
    #[error("temporary authentication failure: {0}")]
    Transient(String),
}

/// A pluggable credential store.
pub trait AuthBackend: Send + Sync {
    /// Checks whether the credentials are valid, returning the authenticated
    /// principal if so.
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn User>, AuthError>;
}

/// IP reputation query, consulted once per connection before the banner.
pub trait Blacklist: Send + Sync {
    /// Whether the address is blacklisted.
    fn contains(&self, ip: IpAddr) -> bool;
}

/// A blacklist over a fixed address list, as loaded from the configuration.
pub struct StaticBlacklist {
    addresses: Vec<IpAddr>,
}

impl StaticBlacklist {
    pub fn new(addresses: Vec<IpAddr>) -> Self {
        StaticBlacklist { addresses }
    }
}

impl Blacklist for StaticBlacklist {
    fn contains(&self, ip: IpAddr) -> bool {
        self.addresses.contains(&ip)
    }
}

#[derive(Error, Debug)]
pub enum HandlerError {
    /// Reported to the client verbatim.
    #[error("smtp error {0:?}")]
    Smtp(SmtpResponse),
    /// Reported to the client as `451 local error`.
    #[error("{0}")]
    Internal(String),
}

/// Receives each completed message.
///
/// The handler runs between the end-of-data marker and the reply to DATA;
/// its verdict decides that reply. It may edit the session's message data
/// (for instance to stamp trace headers) before taking ownership of it.
pub trait MailHandler: Send + Sync {
    fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError>;
}

impl<F> MailHandler for F
where
    F: Fn(&mut SessionState) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        self(state)
    }
}

/// A mail handler that stamps a `Received` header, logs the delivery, and
/// accepts the message without storing it.
///
/// This is the default handler wired up by `postern serve`; real deployments
/// provide their own [`MailHandler`].
pub struct LoggingMailHandler {
    pub local_host_name: String,
}

impl MailHandler for LoggingMailHandler {
    fn handle(&self, state: &mut SessionState) -> Result<(), HandlerError> {
        state.add_header(
            "Received",
            &format!(
                "from {} ([{}]) by {} with {}; {}",
                state.hostname,
                state.peer_ip,
                self.local_host_name,
                if state.secure { "ESMTPS" } else { "ESMTP" },
                Utc::now().to_rfc2822(),
            ),
        );

        info!(
            "smtp[{}] Accepted message: from=<{}> recipients={} bytes={} \
             message-id={}",
            state.session_id,
            state.from.as_ref().map(|f| f.address()).unwrap_or(""),
            state.to.len(),
            state.data.len(),
            state.get_header("Message-Id").unwrap_or("<none>"),
        );

        Ok(())
    }
}

/// A credential store over an in-memory username→password map, for tests and
/// trivial deployments.
pub struct MemoryAuthBackend {
    credentials: BTreeMap<String, String>,
}

struct MemoryUser {
    username: String,
}

impl User for MemoryUser {
    fn username(&self) -> &str {
        &self.username
    }
}

impl MemoryAuthBackend {
    pub fn new(credentials: BTreeMap<String, String>) -> Self {
        MemoryAuthBackend { credentials }
    }
}

impl AuthBackend for MemoryAuthBackend {
    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Arc<dyn User>, AuthError> {
        match self.credentials.get(username) {
            Some(expected) if expected == password => Ok(Arc::new(MemoryUser {
                username: username.to_owned(),
            })),
            _ => Err(AuthError::InvalidCredentials),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn backend() -> MemoryAuthBackend {
        MemoryAuthBackend::new(
            [("some-username".to_owned(), "password1234".to_owned())]
                .into_iter()
                .collect(),
        )
    }

    #[test]
    fn memory_backend_accepts_valid_credentials() {
        let user = backend().login("some-username", "password1234").unwrap();
        assert_eq!("some-username", user.username());
    }

    #[test]
    fn memory_backend_rejects_bad_credentials() {
        assert_matches!(
            Err(AuthError::InvalidCredentials),
            backend()
                .login("some-username", "some-incorrect-password")
                .map(|user| user.username().to_owned()),
        );
        assert_matches!(
            Err(AuthError::InvalidCredentials),
            backend()
                .login("unknown-user", "password1234")
                .map(|user| user.username().to_owned()),
        );
    }

    #[test]
    fn static_blacklist_membership() {
        let blacklist =
            StaticBlacklist::new(vec!["192.0.2.7".parse().unwrap()]);
        assert!(blacklist.contains("192.0.2.7".parse().unwrap()));
        assert!(!blacklist.contains("192.0.2.8".parse().unwrap()));
    }
}
