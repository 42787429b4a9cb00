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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::smtp::server::{self, Service};
use crate::smtp::service::{
    LoggingMailHandler, MemoryAuthBackend, StaticBlacklist,
};
use crate::smtp::state::SessionId;
use crate::support::{
    async_io::ServerIo, log_prefix::LogPrefix, system_config::SystemConfig,
};

// Need to use this and not a plain panic so that errors go to syslog/etc.
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

/// How long after the shutdown signal active sessions may keep running
/// before they are abandoned.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
pub async fn serve(system_config: SystemConfig, system_root: PathBuf) {
    let host_name = if system_config.smtp.host_name.is_empty() {
        let host_name_os = nix::unistd::gethostname().unwrap_or_else(|e| {
            fatal!(
                EX_OSERR,
                "Failed to determine host name; you may \
                 need to explicitly configure it: {}",
                e
            )
        });
        host_name_os
            .to_str()
            .unwrap_or_else(|| {
                fatal!(EX_OSERR, "System host name is not UTF-8")
            })
            .to_owned()
    } else {
        system_config.smtp.host_name.clone()
    };

    let ssl_acceptor = system_config
        .tls
        .as_ref()
        .map(|tls| Arc::new(create_ssl_acceptor(tls, &system_root)));

    let service = Arc::new(Service {
        auth_required: !system_config.smtp.disable_auth,
        auth_backend: if system_config.smtp.users.is_empty() {
            None
        } else {
            Some(Arc::new(MemoryAuthBackend::new(
                system_config.smtp.users.clone(),
            )))
        },
        blacklist: if system_config.blacklist.is_empty() {
            None
        } else {
            Some(Arc::new(StaticBlacklist::new(
                system_config.blacklist.clone(),
            )))
        },
        mail_handler: Arc::new(LoggingMailHandler {
            local_host_name: host_name.clone(),
        }),
        local_host_name: host_name,
    });

    let listener = match TcpListener::bind(&system_config.smtp.listen).await {
        Ok(listener) => listener,
        Err(e) => fatal!(
            EX_UNAVAILABLE,
            "Unable to listen on '{}': {}",
            system_config.smtp.listen,
            e
        ),
    };

    info!(
        "Listening for SMTP connections on {}",
        system_config.smtp.listen,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => (),
            _ = sigint.recv() => (),
        }

        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let mut sessions = JoinSet::new();
    let mut shutdown = shutdown_rx.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,

            // Reap sessions as they complete so the set stays small.
            Some(_) = sessions.join_next(), if !sessions.is_empty() => (),

            accepted = listener.accept() => {
                let (sock, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    },
                };

                let session_id = SessionId::generate();
                let log_prefix = LogPrefix::new(format!("smtp:{}", peer));
                log_prefix.set_session_id(session_id.to_string());
                info!("{} Connection accepted", log_prefix);

                let sock = match sock.into_std() {
                    Ok(sock) => sock,
                    Err(e) => {
                        warn!("{} Unable to detach socket: {}", log_prefix, e);
                        continue;
                    },
                };
                let io = match ServerIo::new_owned_socket(sock) {
                    Ok(io) => io,
                    Err(e) => {
                        warn!(
                            "{} Unable to set up connection: {}",
                            log_prefix, e,
                        );
                        continue;
                    },
                };

                let service = Arc::clone(&service);
                let ssl_acceptor = ssl_acceptor.clone();
                let shutdown = shutdown_rx.clone();
                sessions.spawn(async move {
                    let result = server::run(
                        io,
                        log_prefix.clone(),
                        ssl_acceptor,
                        service,
                        session_id,
                        peer.ip(),
                        shutdown,
                    )
                    .await;

                    match result {
                        Ok(()) => {
                            info!("{} Normal client disconnect", log_prefix)
                        },
                        Err(e) => warn!(
                            "{} Abnormal client disconnect: {}",
                            log_prefix, e,
                        ),
                    }
                });
            },
        }
    }

    drop(listener);
    if !sessions.is_empty() {
        info!(
            "Waiting up to {}s for {} active session(s) to finish",
            SHUTDOWN_GRACE.as_secs(),
            sessions.len(),
        );
    }

    let drain = async {
        while sessions.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("Abandoning sessions that outlived the grace period");
    }

    info!("Shut down");
}

fn create_ssl_acceptor(
    tls: &crate::support::system_config::TlsConfig,
    system_root: &Path,
) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(acceptor) => acceptor,
            Err(e) => fatal!(
                EX_SOFTWARE,
                "Failed to initialise OpenSSL acceptor: {}",
                e
            ),
        };

    let private_key_path = system_root.join(&tls.private_key);
    if let Err(e) =
        acceptor.set_private_key_file(&private_key_path, SslFiletype::PEM)
    {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS private key from '{}': {}",
            private_key_path.display(),
            e
        );
    }

    let certificate_path = system_root.join(&tls.certificate_chain);
    if let Err(e) = acceptor.set_certificate_chain_file(&certificate_path) {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS certificate chain from '{}': {}",
            certificate_path.display(),
            e
        );
    }

    if let Err(e) = acceptor.check_private_key() {
        fatal!(EX_CONFIG, "TLS key seems to be invalid: {}", e);
    }

    acceptor.build()
}
