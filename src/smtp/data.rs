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

//! Byte-level input handling: bounded line reads and the streaming decoder
//! for the DATA payload.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Maximum length of a command line, including the CRLF (RFC 5321
/// § 4.5.3.1.4).
pub const MAX_CMD_LINE: usize = 512;
/// Maximum length of a line of message data, including the CRLF (RFC 5321
/// § 4.5.3.1.6).
pub const MAX_DATA_LINE: usize = 1000;

/// Why a bounded line read did not produce a complete line.
#[derive(Debug)]
pub enum LineError {
    /// The limit was reached before any LF arrived. The bytes read so far are
    /// in the caller's buffer; the rest of the line is still unread.
    TooLong,
    /// EOF before the first byte of the line.
    Eof,
    /// The underlying stream failed, including EOF in the middle of a line.
    Io(io::Error),
}

/// Reads one LF-terminated line of at most `max` octets (including the line
/// ending) from `io` into `buffer`, which is cleared first.
///
/// On success the buffer ends with the LF.
pub async fn read_limited_line(
    io: &mut (impl AsyncBufRead + Unpin),
    max: usize,
    buffer: &mut Vec<u8>,
) -> Result<(), LineError> {
    buffer.clear();
    (&mut *io)
        .take(max as u64)
        .read_until(b'\n', buffer)
        .await
        .map_err(LineError::Io)?;

    if buffer.is_empty() {
        return Err(LineError::Eof);
    }

    if !buffer.ends_with(b"\n") {
        if buffer.len() >= max {
            return Err(LineError::TooLong);
        }

        return Err(LineError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "EOF reached within line",
        )));
    }

    Ok(())
}

/// Discards input up to and including the next LF.
pub async fn skip_to_newline(
    io: &mut (impl AsyncBufRead + Unpin),
) -> io::Result<()> {
    let mut discard = Vec::new();
    loop {
        discard.clear();
        (&mut *io)
            .take(MAX_DATA_LINE as u64)
            .read_until(b'\n', &mut discard)
            .await?;

        if discard.is_empty() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }

        if discard.ends_with(b"\n") {
            return Ok(());
        }
    }
}

/// How decoding the DATA payload stopped short of the terminator.
#[derive(Debug, PartialEq, Eq)]
pub enum DataError {
    /// A line exceeded [`MAX_DATA_LINE`]. The remainder of the offending line
    /// has been discarded and the decoder is positioned at the start of the
    /// next line, so decoding may simply be resumed.
    LineTooLong,
    /// The input ended before the terminator line.
    Incomplete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DecoderState {
    /// At the beginning of a line. Initial state.
    BeginLine,
    /// Read `.` at the beginning of a line.
    Dot,
    /// Read `.\r` at the beginning of a line.
    DotCr,
    /// Read `\r`, possibly at the end of a line.
    Cr,
    /// In the middle of a line.
    Data,
    /// Consumed the `.<CRLF>` terminator line.
    Eof,
}

/// Streaming decoder for the DATA payload.
///
/// Strips the stuffed dot from lines that begin with one, rewrites CRLF line
/// endings to LF, stops after consuming the `.<CRLF>` (or bare `.<LF>`)
/// terminator line, and enforces [`MAX_DATA_LINE`] on every input line.
///
/// The decoder borrows the session's buffered reader and never reads past the
/// terminator, so command processing can continue on the same reader
/// afterwards.
pub struct DataReader<'a, R> {
    io: &'a mut R,
    state: DecoderState,
    bytes_in_line: usize,
    /// A byte handed back by the state machine, re-delivered (and re-counted)
    /// by the next `next_byte`.
    unread: Option<u8>,
}

impl<'a, R: AsyncBufRead + Unpin> DataReader<'a, R> {
    pub fn new(io: &'a mut R) -> Self {
        DataReader {
            io,
            state: DecoderState::BeginLine,
            bytes_in_line: 0,
            unread: None,
        }
    }

    async fn next_byte(&mut self) -> Result<u8, DataError> {
        let c = match self.unread.take() {
            Some(c) => c,
            None => match self.io.read_u8().await {
                Ok(c) => c,
                Err(_) => return Err(DataError::Incomplete),
            },
        };
        self.bytes_in_line += 1;
        Ok(c)
    }

    /// Decodes input until the terminator line, appending the decoded bytes
    /// to `out`.
    ///
    /// On `LineTooLong` the bytes decoded so far remain in `out` and the
    /// decoder has already skipped to the next line; calling `read_to_end`
    /// again (or constructing a fresh reader over the same stream) continues
    /// the same message body.
    pub async fn read_to_end(
        &mut self,
        out: &mut Vec<u8>,
    ) -> Result<(), DataError> {
        while self.state != DecoderState::Eof {
            let c = self.next_byte().await?;

            if self.bytes_in_line > MAX_DATA_LINE {
                let _ = skip_to_newline(&mut *self.io).await;
                self.bytes_in_line = 0;
                self.state = DecoderState::BeginLine;
                return Err(DataError::LineTooLong);
            }

            match self.state {
                DecoderState::BeginLine => match c {
                    b'.' => self.state = DecoderState::Dot,
                    b'\r' => self.state = DecoderState::Cr,
                    _ => {
                        self.state = DecoderState::Data;
                        out.push(c);
                    },
                },

                DecoderState::Dot => match c {
                    b'\r' => self.state = DecoderState::DotCr,
                    b'\n' => self.state = DecoderState::Eof,
                    _ => {
                        // The leading dot was stuffing; it stays consumed.
                        self.state = DecoderState::Data;
                        out.push(c);
                    },
                },

                DecoderState::DotCr => match c {
                    b'\n' => self.state = DecoderState::Eof,
                    _ => {
                        // Not the terminator. Emit the held CR and replay the
                        // byte; the leading dot stays consumed.
                        self.unread = Some(c);
                        self.state = DecoderState::Data;
                        out.push(b'\r');
                    },
                },

                DecoderState::Cr => match c {
                    b'\n' => {
                        // CRLF becomes LF in the output.
                        self.state = DecoderState::BeginLine;
                        self.bytes_in_line = 0;
                        out.push(b'\n');
                    },
                    _ => {
                        // Not part of a CRLF. Emit the held CR and replay.
                        self.unread = Some(c);
                        self.state = DecoderState::Data;
                        out.push(b'\r');
                    },
                },

                DecoderState::Data => match c {
                    b'\r' => self.state = DecoderState::Cr,
                    b'\n' => {
                        self.state = DecoderState::BeginLine;
                        self.bytes_in_line = 0;
                        out.push(c);
                    },
                    _ => out.push(c),
                },

                DecoderState::Eof => unreachable!(),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::str;

    use proptest::prelude::*;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn decode(data: &[u8]) -> (Vec<u8>, Result<(), DataError>) {
        let mut reader = tokio::io::BufReader::new(data);
        let mut out = Vec::new();
        let result = futures::executor::block_on(
            DataReader::new(&mut reader).read_to_end(&mut out),
        );
        (out, result)
    }

    fn expect_decoded(data: &[u8], expected: &[u8]) {
        let (out, result) = decode(data);
        assert_eq!(Ok(()), result);
        assert_eq!(expected, &out[..]);
    }

    fn expect_error(data: &[u8], expected: DataError) {
        let (_, result) = decode(data);
        assert_eq!(Err(expected), result);
    }

    #[test]
    fn decodes_simple_bodies() {
        expect_decoded(
            b"Some test mail\nblablabla\n.\n",
            b"Some test mail\nblablabla\n",
        );
        expect_decoded(
            b"Some test mail\r\nblablabla\r\n.\r\n",
            b"Some test mail\nblablabla\n",
        );
        expect_decoded(b".\r\n", b"");
    }

    #[test]
    fn undoes_dot_stuffing() {
        expect_decoded(
            b"Some test mail\n..blablabla\n.\n",
            b"Some test mail\n.blablabla\n",
        );
        expect_decoded(
            b"Some test mail\n.blablabla\n.\n",
            b"Some test mail\nblablabla\n",
        );
    }

    #[test]
    fn preserves_bare_carriage_returns() {
        expect_decoded(b"foo\rbar\r\n.\r\n", b"foo\rbar\n");
        expect_decoded(b"\r\r\n.\r\n", b"\r\n");
    }

    #[test]
    fn stops_at_terminator_without_reading_ahead() {
        let data = b"Some test mail\nblablabla\n.\nshould not read this";
        let mut reader = tokio::io::BufReader::new(&data[..]);
        let mut out = Vec::new();
        futures::executor::block_on(async {
            DataReader::new(&mut reader)
                .read_to_end(&mut out)
                .await
                .unwrap();

            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await.unwrap();
            assert_eq!(b"should not read this", &rest[..]);
        });
        assert_eq!(b"Some test mail\nblablabla\n", &out[..]);
    }

    #[test]
    fn reports_truncated_bodies() {
        expect_error(
            b"Some test mail\nblablabla\nno ending dot",
            DataError::Incomplete,
        );
        expect_error(
            b"Some test mail\r\nDot on invalid place\n.test",
            DataError::Incomplete,
        );
        expect_error(b"", DataError::Incomplete);
    }

    #[test]
    fn accepts_lines_at_the_limit() {
        // 999 characters plus the LF is exactly MAX_DATA_LINE octets.
        let line = "x".repeat(999);
        let data = format!("{}\n.\n", line);
        expect_decoded(data.as_bytes(), format!("{}\n", line).as_bytes());

        // A stuffed dot does not count against the limit's intent: the line
        // is within bounds once the dot is stripped... but the dot itself is
        // still an input octet, so only 998 characters fit after it.
        let line = "x".repeat(998);
        let data = format!(".{}\n.\n", line);
        expect_decoded(data.as_bytes(), format!("{}\n", line).as_bytes());

        // With CRLF endings the payload shrinks by one more octet.
        let line = "x".repeat(998);
        let data = format!("{}\r\naj ge je a t\r\n{}\r\n.\r\n", line, line);
        expect_decoded(
            data.as_bytes(),
            format!("{}\naj ge je a t\n{}\n", line, line).as_bytes(),
        );
    }

    #[test]
    fn rejects_overlong_lines() {
        let line = "x".repeat(1000);
        expect_error(
            format!("{}\n.\n", line).as_bytes(),
            DataError::LineTooLong,
        );
        expect_error(
            format!("Some text :)\n{}23\n.\n", line).as_bytes(),
            DataError::LineTooLong,
        );
    }

    #[test]
    fn resumes_after_an_overlong_line() {
        let long_line = "x".repeat(1200);
        let data = format!("first\n{}\nlast\n.\nrest", long_line);
        let mut reader = tokio::io::BufReader::new(data.as_bytes());
        let mut out = Vec::new();

        futures::executor::block_on(async {
            let result =
                DataReader::new(&mut reader).read_to_end(&mut out).await;
            assert_eq!(Err(DataError::LineTooLong), result);

            // A fresh reader continues the same body from the next line.
            DataReader::new(&mut reader)
                .read_to_end(&mut out)
                .await
                .unwrap();

            let mut rest = Vec::new();
            reader.read_to_end(&mut rest).await.unwrap();
            assert_eq!(b"rest", &rest[..]);
        });

        let text = str::from_utf8(&out).unwrap();
        assert!(text.starts_with("first\n"));
        assert!(text.ends_with("last\n"));
    }

    #[test]
    fn bounded_line_reads() {
        futures::executor::block_on(async {
            let mut reader =
                tokio::io::BufReader::new(&b"HELO example.com\r\nNOOP\r\n"[..]);
            let mut buffer = Vec::new();

            read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                .await
                .unwrap();
            assert_eq!(b"HELO example.com\r\n", &buffer[..]);

            read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                .await
                .unwrap();
            assert_eq!(b"NOOP\r\n", &buffer[..]);

            assert!(matches!(
                read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                    .await,
                Err(LineError::Eof),
            ));
        });
    }

    #[test]
    fn bounded_line_reads_report_overflow() {
        futures::executor::block_on(async {
            let line = format!("MAIL {}\r\nNOOP\r\n", "x".repeat(600));
            let mut reader = tokio::io::BufReader::new(line.as_bytes());
            let mut buffer = Vec::new();

            assert!(matches!(
                read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                    .await,
                Err(LineError::TooLong),
            ));
            assert_eq!(MAX_CMD_LINE, buffer.len());

            // After draining the remainder, the next command is intact.
            skip_to_newline(&mut reader).await.unwrap();
            read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                .await
                .unwrap();
            assert_eq!(b"NOOP\r\n", &buffer[..]);
        });
    }

    #[test]
    fn bounded_line_reads_report_mid_line_eof() {
        futures::executor::block_on(async {
            let mut reader = tokio::io::BufReader::new(&b"QUI"[..]);
            let mut buffer = Vec::new();
            assert!(matches!(
                read_limited_line(&mut reader, MAX_CMD_LINE, &mut buffer)
                    .await,
                Err(LineError::Io(_)),
            ));
        });
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1024,
            ..ProptestConfig::default()
        })]

        #[test]
        fn dot_stuffing_round_trip(
            lines in prop::collection::vec("[x.]{0,60}", 0..30),
        ) {
            // Encode the body with CRLF line endings and dot stuffing.
            let mut stuffed = String::new();
            for line in &lines {
                if line.starts_with('.') {
                    stuffed.push('.');
                }
                stuffed.push_str(line);
                stuffed.push_str("\r\n");
            }
            stuffed.push_str(".\r\n");

            let (out, result) = decode(stuffed.as_bytes());
            prop_assert_eq!(Ok(()), result);

            let mut expected = String::new();
            for line in &lines {
                expected.push_str(line);
                expected.push('\n');
            }
            prop_assert_eq!(expected.as_bytes(), &out[..]);

            for line in out.split(|&b| b == b'\n') {
                prop_assert!(line.len() < MAX_DATA_LINE);
            }
        }
    }
}
