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

use std::any::Any;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task;

use openssl::ssl::{HandshakeError, SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

/// Async I/O over one server socket, supporting an in-place upgrade from
/// cleartext to TLS.
///
/// The protocol engine drives a connection strictly sequentially, so this is
/// a plain single-owner value: reads, writes and the TLS handshake all go
/// through `&mut self`. OpenSSL's synchronous `SslStream` is run on top of
/// the non-blocking socket by waiting for fd readiness whenever it reports
/// `WANT_READ`/`WANT_WRITE`.
pub struct ServerIo {
    fd: AsyncFd<RawFd>,
    mode: Mode,
    /// Keeps the socket object (and with it the fd) alive for as long as the
    /// `ServerIo` exists.
    _owned: Box<dyn Any + Send>,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
}

impl ServerIo {
    /// Takes ownership of a connected socket and puts it into non-blocking
    /// mode. The socket is closed when the last part of the `ServerIo` is
    /// dropped.
    pub fn new_owned_socket(
        sock: impl AsRawFd + Any + Send,
    ) -> Result<Self, nix::Error> {
        let fd = sock.as_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        Ok(ServerIo {
            fd: AsyncFd::with_interest(
                fd,
                tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
            )
            .unwrap(),
            mode: Mode::Cleartext(SocketRw(fd)),
            _owned: Box::new(sock),
        })
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self.mode, Mode::Ssl(_))
    }

    /// Describes the negotiated TLS parameters, if any.
    pub fn ssl_string(&self) -> Option<String> {
        match self.mode {
            Mode::Cleartext(..) => None,
            Mode::Ssl(ref stream) => {
                let ssl = stream.ssl();
                let cipher = ssl.current_cipher();
                Some(format!(
                    "{tls_version}:{cipher}:{strength}",
                    tls_version = ssl.version_str(),
                    cipher = cipher.map_or("NONE", |c| c.name()),
                    strength = cipher.map_or(0, |c| c.bits().algorithm),
                ))
            },
        }
    }

    /// Performs server-side TLS setup with the given acceptor, replacing the
    /// cleartext stream on success.
    ///
    /// The caller must not have buffered any cleartext input: a conforming
    /// peer sends nothing between its STARTTLS command and our go-ahead
    /// reply.
    pub async fn ssl_accept(
        &mut self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let mut result = acceptor.accept(SocketRw(*self.fd.get_ref()));

        loop {
            match result {
                Ok(stream) => {
                    self.mode = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(HandshakeError::SetupFailure(e)) => return Err(e.into()),

                Err(HandshakeError::Failure(mhss)) => {
                    return Err(mid_handshake_to_error(mhss));
                },

                Err(HandshakeError::WouldBlock(mhss)) => {
                    // OpenSSL just got EWOULDBLOCK from the socket, so it is
                    // safe to clear the readiness state and wait for the
                    // next edge before retrying.
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            self.fd.readable().await?.clear_ready();
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            self.fd.writable().await?.clear_ready();
                            result = mhss.handshake();
                        },

                        _ => return Err(mid_handshake_to_error(mhss)),
                    }
                },
            }
        }
    }
}

/// Handles an error returned from `ssl_read`, `ssl_write` or `shutdown`.
///
/// The main purpose is to deal with `WANT_READ` and `WANT_WRITE`: readiness
/// for the appropriate direction is cleared and re-polled so the task wakes
/// on the next edge. This must only be called immediately after the failed
/// OpenSSL operation, with no await points in between, so that the
/// `WANT_READ`/`WANT_WRITE` is known to describe the socket's current state.
fn poll_ssl_error(
    fd: &AsyncFd<RawFd>,
    ctx: &mut task::Context<'_>,
    e: openssl::ssl::Error,
) -> task::Poll<io::Result<()>> {
    match e.code() {
        openssl::ssl::ErrorCode::WANT_READ => {
            futures::ready!(fd.poll_read_ready(ctx))?.clear_ready();
            // Poll again so tokio keeps watching the fd; if it has somehow
            // become ready again already, let the caller retry now.
            futures::ready!(fd.poll_read_ready(ctx))?.retain_ready();
            task::Poll::Ready(Ok(()))
        },

        openssl::ssl::ErrorCode::WANT_WRITE => {
            futures::ready!(fd.poll_write_ready(ctx))?.clear_ready();
            futures::ready!(fd.poll_write_ready(ctx))?.retain_ready();
            task::Poll::Ready(Ok(()))
        },

        // EOF surfaces as the SYSCALL error code with no associated IO
        // error, which into_io_error() does not translate.
        openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

        _ => task::Poll::Ready(Err(e
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut sock) => loop {
                let mut guard = futures::ready!(this.fd.poll_read_ready(ctx))?;

                match guard.try_io(|_| sock.read(buf.initialize_unfilled())) {
                    Ok(Ok(n)) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Ok(Err(e)) => return task::Poll::Ready(Err(e)),

                    Err(_would_block) => continue,
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },

                    Err(e) => {
                        futures::ready!(poll_ssl_error(&this.fd, ctx, e))?
                    },
                }
            },
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let this = self.get_mut();
        match this.mode {
            Mode::Cleartext(ref mut sock) => loop {
                let mut guard =
                    futures::ready!(this.fd.poll_write_ready(ctx))?;

                if let Ok(result) = guard.try_io(|_| sock.write(buf)) {
                    return task::Poll::Ready(result);
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => {
                        futures::ready!(poll_ssl_error(&this.fd, ctx, e))?
                    },
                }
            },
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither the cleartext path nor OpenSSL buffers writes here, so
        // there is nothing to flush.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Mode::Ssl(ref mut ssl) = this.mode {
            loop {
                match ssl.shutdown() {
                    Ok(_) => break,

                    Err(e)
                        if matches!(
                            e.code(),
                            openssl::ssl::ErrorCode::WANT_READ
                                | openssl::ssl::ErrorCode::WANT_WRITE
                        ) =>
                    {
                        futures::ready!(poll_ssl_error(&this.fd, ctx, e))?
                    },

                    // The peer is gone; there is no notice to deliver.
                    Err(_) => break,
                }
            }
        }

        task::Poll::Ready(Ok(()))
    }
}

/// Synchronous, non-blocking reads and writes on the raw socket fd.
///
/// This is what `SslStream` is built over; the fd itself stays owned by the
/// `ServerIo`.
struct SocketRw(RawFd);

impl Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        nix::unistd::read(self.0, dst).map_err(nix_to_io)
    }
}

impl Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        nix::unistd::write(self.0, src).map_err(nix_to_io)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mid_handshake_to_error<S>(
    mhss: openssl::ssl::MidHandshakeSslStream<S>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
