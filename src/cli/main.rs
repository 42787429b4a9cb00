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

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use structopt::{clap, StructOpt};

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Accept SMTP connections and hand received mail to the configured
    /// handler.
    Serve(ServerCommonOptions),
    /// Load the configuration, report any problems, and exit.
    CheckConfig(ServerCommonOptions),
}

#[derive(StructOpt, Default)]
struct ServerCommonOptions {
    /// The directory containing `postern.toml`
    /// [default: /etc/postern or /usr/local/etc/postern]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        },
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        },
    });

    match cmd {
        Command::Serve(options) => {
            let (system_config, root) = load_config(options);
            init_logging(&root);
            super::serve::serve(system_config, root);
        },
        Command::CheckConfig(options) => {
            let (_, root) = load_config(options);
            println!(
                "Configuration at '{}' looks reasonable",
                root.join("postern.toml").display(),
            );
        },
    }
}

fn load_config(options: ServerCommonOptions) -> (SystemConfig, PathBuf) {
    let root = options.root.unwrap_or_else(|| {
        if Path::new("/etc/postern/postern.toml").is_file() {
            "/etc/postern".to_owned().into()
        } else if Path::new("/usr/local/etc/postern/postern.toml").is_file() {
            "/usr/local/etc/postern".to_owned().into()
        } else {
            eprintln!(
                "Neither /etc/postern nor /usr/local/etc/postern looks like\n\
                 the Postern root; use --root=/path/to/postern if your\n\
                 installation is elsewhere."
            );
            EX_CONFIG.exit()
        }
    });

    let system_config_path = root.join("postern.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        eprintln!("Error reading '{}': {}", system_config_path.display(), e);
        EX_CONFIG.exit();
    }

    let system_config: SystemConfig =
        match toml::from_slice(&system_config_toml) {
            Ok(config) => config,
            Err(e) => {
                eprintln!(
                    "Error in config file at '{}': {}",
                    system_config_path.display(),
                    e
                );
                EX_CONFIG.exit()
            },
        };

    (system_config, root)
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    // Either log4rs via a config file, or syslog. If anything goes wrong
    // there is no good place left to report it, hence the expect()s.
    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        log4rs::init_file(log_config_file, log4rs::config::Deserializers::new())
            .expect("Failed to initialise logging");
    } else {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_MAIL,
            hostname: None,
            process: env!("CARGO_PKG_NAME").to_owned(),
            pid: nix::unistd::getpid().as_raw() as u32,
        };

        let logger =
            syslog::unix(formatter).expect("Failed to connect to syslog");
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|_| log::set_max_level(log::LevelFilter::Info))
            .expect("Failed to initialise logging");
    }
}
