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

//! The per-connection protocol engine.
//!
//! One `Server` drives one accepted connection through the RFC 5321
//! dialogue: banner, command fetch-and-dispatch, DATA streaming, the
//! STARTTLS upgrade and AUTH PLAIN. All protocol-level failures are answered
//! on the wire and the command loop continues; only fatal I/O (including the
//! peer hanging up) and a failed TLS handshake end a session early.

use std::borrow::Cow;
use std::io;
use std::net::IpAddr;
use std::str;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use openssl::ssl::SslAcceptor;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::sync::{mpsc, watch};

use super::codes::*;
use super::data::{
    read_limited_line, skip_to_newline, DataError, DataReader, LineError,
    MAX_CMD_LINE,
};
use super::service::{AuthBackend, AuthError, Blacklist, HandlerError, MailHandler};
use super::state::{SessionId, SessionState};
use super::syntax::{decode_plain_initial_response, Command, MailAddress};
use crate::support::{
    async_io::ServerIo, error::Error, log_prefix::LogPrefix,
};

/// The collaborators and switches shared by every session of one listener.
pub struct Service {
    /// Host name announced in the banner and in HELO/EHLO replies.
    pub local_host_name: String,
    /// Whether a successful AUTH is required before MAIL. When true, RCPT
    /// additionally checks that the sender address is owned by the
    /// authenticated user.
    pub auth_required: bool,
    pub auth_backend: Option<Arc<dyn AuthBackend>>,
    pub blacklist: Option<Arc<dyn Blacklist>>,
    pub mail_handler: Arc<dyn MailHandler>,
}

struct Server {
    io: BufStream<ServerIo>,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    service: Arc<Service>,
    state: SessionState,

    deadline_tx: mpsc::Sender<Instant>,
    shutdown: watch::Receiver<bool>,
    quit: bool,
}

/// Runs one SMTP session to completion.
///
/// Returns `Ok` on an orderly end (QUIT, shutdown announcement, blacklisted
/// peer) and the underlying error otherwise.
pub async fn run(
    io: ServerIo,
    log_prefix: LogPrefix,
    ssl_acceptor: Option<Arc<SslAcceptor>>,
    service: Arc<Service>,
    session_id: SessionId,
    peer_ip: IpAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let (deadline_tx, deadline_rx) = mpsc::channel(1);

    let mut server = Server {
        io: BufStream::new(io),
        log_prefix,
        ssl_acceptor,
        service,
        state: SessionState::new(session_id, peer_ip),
        deadline_tx,
        shutdown,
        quit: false,
    };

    tokio::select! {
        r = server.run() => r,
        _ = idle_timer(deadline_rx) => {
            Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "Connection idle timer expired",
            )))
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// The last in a series of responses.
    ///
    /// Indicates no continuation and forces a flush.
    Final,
    /// A non-final response that is safe to buffer.
    Delayable,
}

impl ResponseKind {
    fn or_final(self, last: bool) -> Self {
        if last {
            ResponseKind::Final
        } else {
            self
        }
    }

    fn indicator(self) -> char {
        match self {
            Final => ' ',
            Delayable => '-',
        }
    }
}

use self::ResponseKind::*;

impl Server {
    async fn run(&mut self) -> Result<(), Error> {
        if let Some(ref blacklist) = self.service.blacklist {
            if blacklist.contains(self.state.peer_ip) {
                warn!(
                    "{} Peer is blacklisted, dropping connection",
                    self.log_prefix,
                );
                return Ok(());
            }

            debug!("{} Peer is not blacklisted", self.log_prefix);
        }

        self.send_reply(
            Final,
            pc::ServiceReady,
            Cow::Owned(format!(
                "{} Service Ready",
                self.service.local_host_name,
            )),
        )
        .await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(60))
            .await;

        if *self.shutdown.borrow_and_update() {
            return self.announce_shutdown().await;
        }

        let line = tokio::select! {
            _ = self.shutdown.changed() => {
                return self.announce_shutdown().await;
            },
            r = read_limited_line(&mut self.io, MAX_CMD_LINE, buffer) => r,
        };

        match line {
            Ok(()) => (),
            Err(LineError::TooLong) => {
                // The line is over the RFC 5321 § 4.5.3.1.4 limit. Discard
                // through its LF so the next fetch starts on a command
                // boundary.
                let _ = skip_to_newline(&mut self.io).await;
                return self
                    .send_reply(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Line too long."),
                    )
                    .await;
            },
            Err(LineError::Eof) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached at start of command",
                )));
            },
            Err(LineError::Io(e)) => return Err(Error::Io(e)),
        }

        let mut end = buffer.len() - 1;
        if buffer[..end].ends_with(b"\r") {
            end -= 1;
        }

        let command = match str::from_utf8(&buffer[..end]) {
            Ok(line) => Command::parse(line),
            Err(_) => {
                warn!("{} Non-UTF-8 command received", self.log_prefix);
                Command::Unknown {
                    verb: String::new(),
                }
            },
        };

        match command {
            Command::Helo(domain) => self.cmd_helo(domain).await,
            Command::Ehlo(domain) => self.cmd_ehlo(domain).await,
            Command::Mail {
                from,
                eight_bit_mime,
            } => self.cmd_mail(from, eight_bit_mime).await,
            Command::Rcpt { to } => self.cmd_rcpt(to).await,
            Command::Data => self.cmd_data().await,
            Command::Rset => self.cmd_rset().await,
            Command::Noop => {
                self.send_reply(Final, pc::Ok, Cow::Borrowed("OK")).await
            },
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
            Command::Auth {
                mechanism,
                initial_response,
            } => self.cmd_auth(mechanism, initial_response).await,

            Command::Vrfy(_)
            | Command::Expn(_)
            | Command::Send
            | Command::Soml
            | Command::Saml => {
                self.send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    Cow::Borrowed("Command not implemented"),
                )
                .await
            },

            Command::Invalid { verb, info } => {
                warn!(
                    "{} Received {} with bad arguments: {}",
                    self.log_prefix, verb, info,
                );
                self.send_reply(
                    Final,
                    pc::ParameterSyntaxError,
                    Cow::Owned(info),
                )
                .await
            },

            Command::Unknown { verb } => {
                // The verb goes to the log only; echoing it in the reply
                // would let a peer inject text into the response stream.
                let mut debug_verb = verb.as_str();
                if let Some((ix, _)) = debug_verb.char_indices().nth(64) {
                    debug_verb = &debug_verb[..ix];
                }
                warn!(
                    "{} Received unknown command {:?}",
                    self.log_prefix, debug_verb,
                );
                self.send_reply(
                    Final,
                    pc::CommandSyntaxError,
                    Cow::Borrowed("Command not recognized"),
                )
                .await
            },
        }
    }

    async fn announce_shutdown(&mut self) -> Result<(), Error> {
        info!("{} Server shutting down, closing session", self.log_prefix);
        self.quit = true;
        self.send_reply(
            Final,
            pc::ServiceNotAvailableClosing,
            Cow::Borrowed("Server is going down."),
        )
        .await
    }

    async fn cmd_helo(&mut self, domain: String) -> Result<(), Error> {
        self.log_prefix.set_helo(domain.clone());
        info!("{} SMTP HELO", self.log_prefix);

        // Unlike EHLO, HELO does not reset the envelope.
        self.state.hostname = domain;
        self.send_reply(
            Final,
            pc::Ok,
            Cow::Owned(self.service.local_host_name.clone()),
        )
        .await
    }

    async fn cmd_ehlo(&mut self, domain: String) -> Result<(), Error> {
        self.log_prefix.set_helo(domain.clone());
        info!("{} SMTP EHLO", self.log_prefix);

        self.state.reset();
        self.state.hostname = domain;

        let mut lines: Vec<Cow<'static, str>> = vec![
            Cow::Owned(self.service.local_host_name.clone()),
            Cow::Borrowed("8BITMIME"),
        ];

        // RFC 3207 requires not offering STARTTLS after TLS has been
        // negotiated.
        if self.ssl_acceptor.is_some() && !self.io.get_ref().is_ssl() {
            lines.push(Cow::Borrowed("STARTTLS"));
        }

        if self.service.auth_required && self.service.auth_backend.is_some() {
            lines.push(Cow::Borrowed("AUTH PLAIN"));
        }

        lines.push(Cow::Borrowed("OK"));

        let last = lines.len() - 1;
        for (ix, line) in lines.into_iter().enumerate() {
            self.send_reply(Delayable.or_final(ix == last), pc::Ok, line)
                .await?;
        }

        Ok(())
    }

    async fn cmd_mail(
        &mut self,
        from: MailAddress,
        eight_bit_mime: bool,
    ) -> Result<(), Error> {
        if let Err(reason) = self.state.can_mail() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed(reason),
                )
                .await;
        }

        if self.service.auth_required && !self.state.authenticated {
            return self
                .send_reply(
                    Final,
                    pc::AuthenticationRequired,
                    Cow::Borrowed("Authentication Required"),
                )
                .await;
        }

        info!(
            "{} Start mail transaction, from=<{}>",
            self.log_prefix, from,
        );
        self.state.from = Some(from);
        self.state.eight_bit_mime = eight_bit_mime;

        self.send_reply(
            Final,
            pc::Ok,
            Cow::Borrowed(if eight_bit_mime {
                "Sender and 8BITMIME ok"
            } else {
                "Sender ok"
            }),
        )
        .await
    }

    async fn cmd_rcpt(&mut self, to: MailAddress) -> Result<(), Error> {
        if let Err(reason) = self.state.can_rcpt() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed(reason),
                )
                .await;
        }

        self.state.to.push(to);

        if self.service.auth_required {
            if let Err(reason) = self.state.auth_matches() {
                warn!("{} Rejecting recipient: {}", self.log_prefix, reason);
                self.send_reply(
                    Final,
                    pc::MailboxNameNotAllowed,
                    Cow::Owned(reason),
                )
                .await?;
                // Drop the whole envelope so a confused client cannot keep
                // accumulating recipients for a rejected sender.
                self.state.reset();
                return Ok(());
            }
        }

        self.send_reply(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        if let Err(reason) = self.state.can_data() {
            return self
                .send_reply(
                    Final,
                    pc::BadSequenceOfCommands,
                    Cow::Borrowed(reason),
                )
                .await;
        }

        self.send_reply(
            Final,
            pc::StartMailInput,
            Cow::Borrowed(if self.state.eight_bit_mime {
                "Start 8BITMIME mail input; end with <CRLF>.<CRLF>"
            } else {
                "Start mail input; end with <CRLF>.<CRLF>"
            }),
        )
        .await?;

        info!("{} Begin data transfer", self.log_prefix);
        let _ = self
            .deadline_tx
            .send(Instant::now() + Duration::from_secs(1800))
            .await;

        loop {
            // The decoder takes errors at line granularity, so a fresh
            // decoder continues the same body after an over-long line was
            // skipped.
            let result = DataReader::new(&mut self.io)
                .read_to_end(&mut self.state.data)
                .await;

            match result {
                Ok(()) => break,

                Err(DataError::LineTooLong) => {
                    self.send_reply(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Line too long"),
                    )
                    .await?;
                },

                Err(DataError::Incomplete) => {
                    warn!(
                        "{} Data transfer ended before the terminator",
                        self.log_prefix,
                    );
                    self.send_reply(
                        Final,
                        pc::CommandSyntaxError,
                        Cow::Borrowed("Could not parse mail data"),
                    )
                    .await?;
                    self.state.reset();
                    return Ok(());
                },
            }
        }

        info!(
            "{} Completed data transfer, {} bytes",
            self.log_prefix,
            self.state.data.len(),
        );

        match self.service.mail_handler.handle(&mut self.state) {
            Ok(()) => {
                self.send_reply(Final, pc::Ok, Cow::Borrowed("Mail delivered"))
                    .await?;
            },

            Err(HandlerError::Smtp(response)) => {
                warn!(
                    "{} Mail handler rejected the message: {} {}",
                    self.log_prefix, response.0 as u16, response.1,
                );
                self.send_reply(Final, response.0, response.1).await?;
            },

            Err(e) => {
                error!("{} Mail handler failed: {}", self.log_prefix, e);
                self.send_reply(
                    Final,
                    pc::ActionAborted,
                    Cow::Borrowed("local error: something went wrong"),
                )
                .await?;
            },
        }

        self.state.reset();
        Ok(())
    }

    async fn cmd_rset(&mut self) -> Result<(), Error> {
        self.state.reset();
        self.send_reply(Final, pc::Ok, Cow::Borrowed("OK")).await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .send_reply(Final, pc::ServiceClosing, Cow::Borrowed("Bye!"))
            .await;
        Ok(())
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        let Some(acceptor) = self.ssl_acceptor.clone() else {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    Cow::Borrowed("STARTTLS is not implemented"),
                )
                .await;
        };

        if self.state.secure {
            return self
                .send_reply(
                    Final,
                    pc::CommandNotImplemented,
                    Cow::Borrowed("Already in TLS mode"),
                )
                .await;
        }

        self.send_reply(
            Final,
            pc::ServiceReady,
            Cow::Borrowed("Ready for TLS handshake"),
        )
        .await?;

        info!("{} Start TLS handshake", self.log_prefix);

        if let Err(e) = self.io.get_mut().ssl_accept(&acceptor).await {
            // No reply is possible on a half-negotiated stream.
            warn!("{} TLS handshake failed: {}", self.log_prefix, e);
            self.quit = true;
            return Ok(());
        }

        info!(
            "{} TLS handshake completed ({})",
            self.log_prefix,
            self.io.get_ref().ssl_string().unwrap_or_default(),
        );

        // RFC 3207: the session returns to its initial state.
        self.state.reset();
        self.state.secure = true;
        Ok(())
    }

    async fn cmd_auth(
        &mut self,
        mechanism: String,
        initial_response: Option<String>,
    ) -> Result<(), Error> {
        if "PLAIN" != mechanism {
            warn!(
                "{} Rejected AUTH with mechanism {:?}",
                self.log_prefix, mechanism,
            );
            return self
                .send_reply(
                    Final,
                    pc::CommandParameterNotImplemented,
                    Cow::Borrowed("5.7.4 Unrecognized authentication type"),
                )
                .await;
        }

        let initial_response = match initial_response {
            Some(initial_response) => initial_response,
            None => {
                // The client sends the credentials on a line of their own.
                let mut buffer = Vec::new();
                match read_limited_line(
                    &mut self.io,
                    MAX_CMD_LINE,
                    &mut buffer,
                )
                .await
                {
                    Ok(()) => String::from_utf8_lossy(&buffer).into_owned(),
                    Err(_) => {
                        warn!(
                            "{} Could not read AUTH credentials",
                            self.log_prefix,
                        );
                        return self
                            .send_reply(
                                Final,
                                pc::ParameterSyntaxError,
                                Cow::Borrowed("Could not parse auth data"),
                            )
                            .await;
                    },
                }
            },
        };

        let (_authzid, authnid, password) =
            match decode_plain_initial_response(&initial_response) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(
                        "{} Could not decode PLAIN initial response: {}",
                        self.log_prefix, e,
                    );
                    return self
                        .send_reply(
                            Final,
                            pc::ParameterSyntaxError,
                            Cow::Borrowed(
                                "Invalid initial response for PLAIN auth",
                            ),
                        )
                        .await;
                },
            };

        let Some(backend) = self.service.auth_backend.clone() else {
            error!(
                "{} AUTH attempted, but no auth backend is configured",
                self.log_prefix,
            );
            return self
                .send_reply(
                    Final,
                    pc::TemporaryAuthenticationFailure,
                    Cow::Borrowed("4.7.0 Temporary authentication failure"),
                )
                .await;
        };

        match backend.login(&authnid, &password) {
            Ok(user) => {
                info!(
                    "{} Authenticated as {}",
                    self.log_prefix,
                    user.username(),
                );
                self.state.authenticated = true;
                self.state.principal = Some(user);
                self.send_reply(
                    Final,
                    pc::AuthenticationSucceeded,
                    Cow::Borrowed("2.7.0 Authentication successful"),
                )
                .await
            },

            Err(AuthError::InvalidCredentials) => {
                self.state.authenticated = false;
                warn!(
                    "{} Invalid credentials for user {}",
                    self.log_prefix, authnid,
                );
                self.send_reply(
                    Final,
                    pc::AuthenticationCredentialsInvalid,
                    Cow::Borrowed("5.7.8 Authentication credentials invalid"),
                )
                .await
            },

            Err(e) => {
                self.state.authenticated = false;
                warn!(
                    "{} Authentication failed for user {}: {}",
                    self.log_prefix, authnid, e,
                );
                self.send_reply(
                    Final,
                    pc::TemporaryAuthenticationFailure,
                    Cow::Borrowed("4.7.0 Temporary authentication failure"),
                )
                .await
            },
        }
    }

    async fn send_reply(
        &mut self,
        kind: ResponseKind,
        code: ReplyCode,
        text: Cow<'_, str>,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        let mut s = String::new();
        let _ = write!(s, "{}{}{}\r\n", code as u16, kind.indicator(), text);

        self.io.write_all(s.as_bytes()).await?;
        if Final == kind {
            self.io.flush().await?;
        }

        Ok(())
    }
}

// Runs until either the deadline channel is closed or the current deadline
// has expired. Used to force-close idle connections.
async fn idle_timer(mut deadline_rx: mpsc::Receiver<Instant>) {
    let mut deadline = Instant::now() + Duration::from_secs(30);

    loop {
        match tokio::time::timeout_at(deadline.into(), deadline_rx.recv())
            .await
        {
            Err(_) => return,   // Timed out
            Ok(None) => return, // Done
            Ok(Some(d)) => deadline = d,
        }
    }
}
