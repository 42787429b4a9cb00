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

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref RX_ADDRESS: Regex = Regex::new(
        r#"^(?:"([^"@\\]+)"|([^\s"<>@,;:\\]+))@([^\s"<>@,;:\\]+)$"#
    )
    .unwrap();
}

/// A parsed forward-path or reverse-path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailAddress {
    address: String,
    local: String,
    domain: String,
}

impl MailAddress {
    /// Parses the printable `local@domain` form.
    ///
    /// Angle brackets around the address and an RFC 5321 source route
    /// (`@relay,@relay:`) before it are accepted and discarded. The
    /// local-part may be a quoted string; the stored local-part is unquoted.
    pub fn parse(s: &str) -> Result<Self, AddressError> {
        let mut s = s.trim();

        if s.starts_with('<') && s.ends_with('>') && s.len() >= 2 {
            s = &s[1..s.len() - 1];
        }

        if s.starts_with('@') {
            // Source routes are obsolete; drop the route and keep the
            // mailbox (RFC 5321 § 4.1.2, C.).
            match s.split_once(':') {
                Some((_, mailbox)) => s = mailbox,
                None => return Err(AddressError),
            }
        }

        let captures = RX_ADDRESS.captures(s).ok_or(AddressError)?;
        let local = captures
            .get(1)
            .or_else(|| captures.get(2))
            .unwrap()
            .as_str()
            .to_owned();
        let domain = captures.get(3).unwrap().as_str().to_owned();

        Ok(MailAddress {
            address: s.to_owned(),
            local,
            domain,
        })
    }

    /// The printable `local@domain` form.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The local-part, unquoted.
    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl fmt::Display for MailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// The string was not a usable mail address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressError;

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Malformed mail address")
    }
}

impl std::error::Error for AddressError {}

/// One parsed command line.
///
/// This is a closed set so that the engine can dispatch with an exhaustive
/// `match`; anything the parser cannot place lands in `Invalid` (known verb,
/// unusable arguments) or `Unknown`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail {
        from: MailAddress,
        eight_bit_mime: bool,
    },
    Rcpt {
        to: MailAddress,
    },
    Data,
    Rset,
    Quit,
    Noop,
    StartTls,
    Auth {
        mechanism: String,
        initial_response: Option<String>,
    },
    Vrfy(String),
    Expn(String),
    Send,
    Soml,
    Saml,
    /// A known verb whose arguments could not be used; `info` becomes the
    /// text of the 501 reply.
    Invalid { verb: String, info: String },
    /// A verb we do not know. The raw verb is kept for logging only and must
    /// never be echoed back to the client.
    Unknown { verb: String },
}

/// One space-delimited argument token, split at its first `:` or `=`.
///
/// `key` and `value` keep their original case; lookups compare keys
/// case-insensitively.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Argument {
    key: String,
    operator: String,
    value: String,
}

impl Argument {
    /// The token as written, reassembled from its parts.
    fn rejoined(&self) -> String {
        format!("{}{}{}", self.key, self.operator, self.value)
    }
}

fn split_arguments(rest: &str) -> Vec<Argument> {
    rest.split(' ')
        .filter_map(|token| {
            let argument = match token.find([':', '=']) {
                Some(ix) => Argument {
                    key: token[..ix].trim().to_owned(),
                    operator: token[ix..=ix].to_owned(),
                    value: token[ix + 1..].trim().to_owned(),
                },
                None => Argument {
                    key: token.trim().to_owned(),
                    ..Argument::default()
                },
            };

            (!argument.key.is_empty()).then_some(argument)
        })
        .collect()
}

fn find_argument<'a>(args: &'a [Argument], key: &str) -> Option<&'a Argument> {
    args.iter().find(|a| a.key.eq_ignore_ascii_case(key))
}

fn parse_from(argument: &str) -> Result<MailAddress, String> {
    let Some(ix) = argument.find(':') else {
        return Err("No FROM given (didn't find ':')".to_owned());
    };

    if !argument[..ix].eq_ignore_ascii_case("from") {
        return Err("No FROM given".to_owned());
    }

    MailAddress::parse(&argument[ix + 1..]).map_err(|e| e.to_string())
}

fn parse_to(argument: &str) -> Result<MailAddress, String> {
    let Some(ix) = argument.find(':') else {
        return Err("No TO given (didn't find ':')".to_owned());
    };

    if !argument[..ix].eq_ignore_ascii_case("to") {
        return Err("No TO given".to_owned());
    }

    MailAddress::parse(&argument[ix + 1..]).map_err(|e| e.to_string())
}

impl Command {
    /// Parses one command line. The line ending must already be stripped.
    ///
    /// This never fails; unusable input maps to `Invalid` or `Unknown`.
    pub fn parse(line: &str) -> Self {
        let (verb, rest) = match line.find(' ') {
            Some(ix) => (&line[..ix], &line[ix + 1..]),
            None => (line, ""),
        };
        let verb = verb.to_ascii_uppercase();
        let args = split_arguments(rest);

        match verb.as_str() {
            "HELO" | "EHLO" => {
                if args.len() != 1 {
                    let info = if "HELO" == verb {
                        "HELO requires exactly one valid domain"
                    } else {
                        "EHLO requires exactly one valid address"
                    };
                    return Command::Invalid {
                        verb,
                        info: info.to_owned(),
                    };
                }

                let domain = args[0].key.clone();
                if "HELO" == verb {
                    Command::Helo(domain)
                } else {
                    Command::Ehlo(domain)
                }
            },

            "MAIL" => {
                let from_argument = find_argument(&args, "FROM")
                    .map(Argument::rejoined)
                    .unwrap_or_default();
                let from = match parse_from(&from_argument) {
                    Ok(from) => from,
                    Err(info) => return Command::Invalid { verb, info },
                };

                let eight_bit_mime = match find_argument(&args, "BODY") {
                    None => false,
                    Some(body) => {
                        let value = body.value.to_ascii_uppercase();
                        if "=" != body.operator
                            || ("8BITMIME" != value && "7BIT" != value)
                        {
                            return Command::Invalid {
                                verb,
                                info: "Syntax is BODY=8BITMIME|7BIT"
                                    .to_owned(),
                            };
                        }

                        "8BITMIME" == value
                    },
                };

                Command::Mail {
                    from,
                    eight_bit_mime,
                }
            },

            "RCPT" => {
                let to_argument = find_argument(&args, "TO")
                    .map(Argument::rejoined)
                    .unwrap_or_default();
                match parse_to(&to_argument) {
                    Ok(to) => Command::Rcpt { to },
                    Err(info) => Command::Invalid { verb, info },
                }
            },

            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "QUIT" => Command::Quit,
            "NOOP" => Command::Noop,
            "STARTTLS" => Command::StartTls,
            "SEND" => Command::Send,
            "SOML" => Command::Soml,
            "SAML" => Command::Saml,

            "VRFY" => Command::Vrfy(
                args.first().map(|a| a.key.clone()).unwrap_or_default(),
            ),
            "EXPN" => Command::Expn(
                args.first().map(|a| a.key.clone()).unwrap_or_default(),
            ),

            "AUTH" => Command::Auth {
                mechanism: args
                    .first()
                    .map(|a| a.key.clone())
                    .unwrap_or_default(),
                initial_response: args.get(1).map(Argument::rejoined),
            },

            _ => Command::Unknown { verb },
        }
    }
}

/// Decodes the base64 initial response of AUTH PLAIN into its
/// `(authorization identity, authentication identity, password)` fields
/// (RFC 4616).
///
/// The authorization identity may be empty, meaning it equals the
/// authentication identity. Any field count other than exactly three is an
/// error. A trailing line ending is tolerated so that a response read from
/// its own line can be passed through unmodified.
pub fn decode_plain_initial_response(
    initial_response: &str,
) -> Result<(String, String, String), String> {
    let decoded = base64::decode(
        initial_response.trim_end_matches(['\r', '\n']),
    )
    .map_err(|e| format!("couldn't decode base64: {}", e))?;

    let mut fields = decoded.split(|&b| 0 == b);
    let (Some(authzid), Some(authnid), Some(password), None) = (
        fields.next(),
        fields.next(),
        fields.next(),
        fields.next(),
    ) else {
        return Err(
            "expected exactly 3 fields in the initial response".to_owned()
        );
    };

    Ok((
        String::from_utf8_lossy(authzid).into_owned(),
        String::from_utf8_lossy(authnid).into_owned(),
        String::from_utf8_lossy(password).into_owned(),
    ))
}
