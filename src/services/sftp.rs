//! src/services/sftp.rs
//!
//! SFTP sessions over libssh2. Every blocking call is bounded: the TCP
//! connect by `connect_timeout`, everything after by the session timeout.

use crate::{
    errors::{TransferError, TransferResult},
    services::transporter::{RemoteSession, SftpConnector},
};
use ssh2::{ErrorCode, HashType, Session, Sftp};
use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info};

/// libssh2's `LIBSSH2_FX_NO_SUCH_FILE`.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Connection settings for the drop host.
#[derive(Clone, Debug)]
pub struct SshConnector {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub private_key: PathBuf,
    /// Expected SHA-256 of the server host key. `None` accepts any key.
    pub host_fingerprint: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl SshConnector {
    fn connect_error(&self, reason: impl ToString) -> TransferError {
        TransferError::Connect {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    fn auth_error(&self, reason: impl ToString) -> TransferError {
        TransferError::Auth {
            host: self.host.clone(),
            reason: reason.to_string(),
        }
    }

    fn open_tcp(&self) -> TransferResult<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| self.connect_error(format!("resolving: {err}")))?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
                        .map_err(|err| self.connect_error(err))?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%addr, error = %err, "tcp connect failed");
                    last_err = Some(err);
                }
            }
        }
        Err(match last_err {
            Some(err) => self.connect_error(err),
            None => self.connect_error("host resolved to no addresses"),
        })
    }

    fn check_host_key(&self, session: &Session) -> TransferResult<()> {
        let Some(expected) = &self.host_fingerprint else {
            return Ok(());
        };
        match session.host_key_hash(HashType::Sha256) {
            Some(actual) if actual == expected.as_slice() => Ok(()),
            Some(_) => Err(self.auth_error("host key fingerprint mismatch")),
            None => Err(self.auth_error("server did not present a host key")),
        }
    }
}

impl SftpConnector for SshConnector {
    type Session = SftpSession;

    fn connect(&self) -> TransferResult<SftpSession> {
        let tcp = self.open_tcp()?;

        let mut session = Session::new().map_err(|err| self.connect_error(err))?;
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| self.auth_error(format!("handshake: {err}")))?;
        self.check_host_key(&session)?;

        session
            .userauth_pubkey_file(&self.username, None, &self.private_key, None)
            .map_err(|err| self.auth_error(err))?;
        if !session.authenticated() {
            return Err(self.auth_error("public key not accepted"));
        }

        let sftp = session.sftp().map_err(|err| TransferError::Transport {
            operation: "open sftp",
            path: String::new(),
            reason: err.to_string(),
        })?;
        info!(host = %self.host, user = %self.username, "sftp session open");

        Ok(SftpSession {
            session,
            sftp: Some(sftp),
        })
    }
}

pub struct SftpSession {
    session: Session,
    sftp: Option<Sftp>,
}

impl SftpSession {
    fn sftp(&self, operation: &'static str, path: &str) -> TransferResult<&Sftp> {
        self.sftp.as_ref().ok_or_else(|| TransferError::Transport {
            operation,
            path: path.to_string(),
            reason: "session already closed".into(),
        })
    }
}

fn transport_error(operation: &'static str, path: &str, reason: impl ToString) -> TransferError {
    TransferError::Transport {
        operation,
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

impl RemoteSession for SftpSession {
    fn list_dir(&mut self, dir: &str) -> TransferResult<Vec<String>> {
        let entries = self
            .sftp("list", dir)?
            .readdir(Path::new(dir))
            .map_err(|err| transport_error("list", dir, err))?;

        Ok(entries
            .into_iter()
            .filter_map(|(path, _)| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect())
    }

    fn write_file(&mut self, path: &str, payload: &[u8]) -> TransferResult<()> {
        let mut file = self
            .sftp("write", path)?
            .create(Path::new(path))
            .map_err(|err| transport_error("write", path, err))?;
        file.write_all(payload)
            .and_then(|_| file.flush())
            .map_err(|err| transport_error("write", path, err))?;
        Ok(())
    }

    fn file_size(&mut self, path: &str) -> TransferResult<Option<u64>> {
        match self.sftp("stat", path)?.stat(Path::new(path)) {
            Ok(stat) => Ok(stat.size),
            Err(err) if err.code() == ErrorCode::SFTP(SFTP_NO_SUCH_FILE) => Ok(None),
            Err(err) => Err(transport_error("stat", path, err)),
        }
    }

    fn close(&mut self) {
        if self.sftp.take().is_some() {
            if let Err(err) = self.session.disconnect(None, "transfer complete", None) {
                debug!(error = %err, "disconnect failed");
            }
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        self.close();
    }
}
