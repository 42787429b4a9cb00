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

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Postern.
///
/// This is stored in a file named `postern.toml` under the Postern system
/// root, which is typically `/etc/postern` or `/usr/local/etc/postern`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Configuration for TLS. If the table is absent, STARTTLS is not
    /// offered.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Peer addresses that are dropped at connection time, before the
    /// banner.
    #[serde(default)]
    pub blacklist: Vec<IpAddr>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// The address and port to listen on.
    pub listen: String,

    /// The host name reported in the banner and in HELO/EHLO replies.
    ///
    /// If empty, the system host name is used.
    pub host_name: String,

    /// If true, MAIL may be issued without a prior successful AUTH and
    /// senders are not checked against the authenticated user.
    pub disable_auth: bool,

    /// Credentials for the built-in in-memory auth backend.
    ///
    /// If empty, no auth backend is configured and every AUTH attempt is
    /// answered with a temporary failure.
    pub users: BTreeMap<String, String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            listen: "0.0.0.0:25".to_owned(),
            host_name: String::new(),
            disable_auth: false,
            users: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let config: SystemConfig = toml::from_slice(b"").unwrap();
        assert_eq!("0.0.0.0:25", config.smtp.listen);
        assert!(!config.smtp.disable_auth);
        assert!(config.tls.is_none());
        assert!(config.blacklist.is_empty());
    }

    #[test]
    fn parses_full_config() {
        let config: SystemConfig = toml::from_slice(
            br#"
blacklist = ["192.0.2.7"]

[smtp]
listen = "127.0.0.1:2525"
host_name = "mx.example.com"
disable_auth = true

[smtp.users]
"bob@example.com" = "hunter2"

[tls]
private_key = "tls/key.pem"
certificate_chain = "tls/chain.pem"
"#,
        )
        .unwrap();

        assert_eq!("127.0.0.1:2525", config.smtp.listen);
        assert_eq!("mx.example.com", config.smtp.host_name);
        assert!(config.smtp.disable_auth);
        assert_eq!(
            Some(&"hunter2".to_owned()),
            config.smtp.users.get("bob@example.com"),
        );
        assert_eq!(
            PathBuf::from("tls/key.pem"),
            config.tls.as_ref().unwrap().private_key,
        );
        assert_eq!(vec!["192.0.2.7".parse::<IpAddr>().unwrap()], config.blacklist);
    }
}
