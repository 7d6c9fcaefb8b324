use super::{VfsEntry, VfsProvider};
use crate::client::stream::CHUNK_SIZE;
use crate::client::{Capabilities, ReadStream, WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::utils::{file_name, parent_path};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::{self, Read};
use std::net::ToSocketAddrs;
use std::str::FromStr;
use std::time::Duration;
use suppaftp::list::File;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::debug;

#[derive(Clone)]
struct FtpLogin {
    host: String,
    port: u16,
    user: String,
    password: String,
    timeout: Duration,
}

impl FtpLogin {
    fn connect(&self) -> Result<FtpStream> {
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| StorageError::NameResolutionFailed(self.host.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(StorageError::NameResolutionFailed(self.host.clone()));
        }

        let mut last_err = StorageError::HostUnreachable(self.host.clone());
        for addr in addrs {
            match FtpStream::connect_timeout(addr, self.timeout) {
                Ok(mut ftp) => {
                    ftp.get_ref().set_read_timeout(Some(self.timeout))?;
                    ftp.get_ref().set_write_timeout(Some(self.timeout))?;
                    ftp.login(&self.user, &self.password)
                        .map_err(|e| ftp_error(e, "/").surfaced())?;
                    ftp.transfer_type(FileType::Binary)
                        .map_err(|e| ftp_error(e, "/").surfaced())?;
                    return Ok(ftp);
                }
                Err(err) => last_err = ftp_error(err, "/").surfaced(),
            }
        }
        Err(match last_err {
            StorageError::IoError(_) => StorageError::HostUnreachable(self.host.clone()),
            other => other,
        })
    }
}

pub struct FtpProvider {
    login: FtpLogin,
    control: Option<FtpStream>,
}

impl FtpProvider {
    pub fn new(descriptor: &ConnectionDescriptor, timeout: Duration) -> Self {
        let (user, password) = if descriptor.anonymous || descriptor.user.is_none() {
            ("anonymous".to_string(), "anonymous@".to_string())
        } else {
            (
                descriptor.user.clone().unwrap_or_default(),
                descriptor.password.clone().unwrap_or_default(),
            )
        };
        Self {
            login: FtpLogin {
                host: descriptor.host.clone(),
                port: descriptor.effective_port(),
                user,
                password,
                timeout,
            },
            control: None,
        }
    }

    /// Runs a blocking command on the control connection. The connection is
    /// lent to the worker thread and only put back while it is still in sync,
    /// so after a hang-up or a transport error the next call reconnects.
    async fn with_control<T, F>(&mut self, op: F) -> Result<T>
    where
        F: FnOnce(&mut FtpStream) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut ftp = self.control.take().ok_or(StorageError::SessionExpired)?;
        let (ftp, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = op(&mut ftp);
            (ftp, outcome)
        })
        .await?;
        match &outcome {
            Err(StorageError::SessionExpired | StorageError::Timeout | StorageError::IoError(_)) => {
                debug!(host = %self.login.host, "dropping FTP control connection");
            }
            _ => self.control = Some(ftp),
        }
        outcome
    }
}

#[async_trait]
impl VfsProvider for FtpProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            random_access_read: true,
            atomic_replace: false,
            append: true,
        }
    }

    async fn open(&mut self) -> Result<()> {
        let login = self.login.clone();
        let ftp = tokio::task::spawn_blocking(move || login.connect()).await??;
        self.control = Some(ftp);
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        self.with_control(|ftp| ftp.noop().map_err(|e| ftp_error(e, "/")))
            .await
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<VfsEntry>> {
        let path = path.to_string();
        self.with_control(move |ftp| {
            ftp.cwd(&path).map_err(|e| ftp_error(e, &path))?;
            let lines = ftp.list(None).map_err(|e| ftp_error(e, &path))?;
            Ok(parse_list(&lines))
        })
        .await
    }

    async fn metadata(&mut self, path: &str) -> Result<VfsEntry> {
        if path == "/" {
            return Ok(VfsEntry {
                name: String::new(),
                is_dir: true,
                size: None,
                modified: None,
            });
        }
        let name = file_name(path);
        self.read_dir(&parent_path(path))
            .await?
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }

    async fn reader(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        let login = self.login.clone();
        let subject = path.to_string();
        let (ftp, data) = tokio::task::spawn_blocking(move || {
            let mut ftp = login.connect()?;
            if offset > 0 {
                let offset = usize::try_from(offset)
                    .map_err(|_| StorageError::ProtocolError("offset too large".into()))?;
                ftp.resume_transfer(offset)
                    .map_err(|e| ftp_error(e, &subject))?;
            }
            let data = ftp
                .retr_as_stream(&subject)
                .map_err(|e| ftp_error(e, &subject))?;
            Ok::<_, StorageError>((ftp, data))
        })
        .await??;

        let subject = path.to_string();
        Ok(ReadStream::from_blocking(move |sender| {
            let (mut ftp, mut data) = (ftp, data);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = data.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                sender.blocking_send(&buf[..n])?;
            }
            ftp.finalize_retr_stream(data)
                .map_err(|e| ftp_error(e, &subject))?;
            let _ = ftp.quit();
            Ok(())
        }))
    }

    async fn writer(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let login = self.login.clone();
        let ftp = tokio::task::spawn_blocking(move || login.connect()).await??;
        let subject = path.to_string();

        Ok(WriteStream::spawn_blocking(move |mut source| {
            let mut ftp = ftp;
            let stored = match mode {
                WriteMode::Truncate => ftp.put_file(&subject, &mut source),
                WriteMode::Append => ftp.append_file(&subject, &mut source),
            };
            let bytes = stored.map_err(|e| ftp_error(e, &subject))?;
            debug!(path = %subject, bytes, "FTP upload complete");
            let _ = ftp.quit();
            Ok(())
        }))
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_control(move |ftp| ftp.mkdir(&path).map_err(|e| ftp_error(e, &path)))
            .await
    }

    async fn make_file(&mut self, path: &str) -> Result<()> {
        let path = path.to_string();
        self.with_control(move |ftp| {
            ftp.put_file(&path, &mut io::empty())
                .map(|_| ())
                .map_err(|e| ftp_error(e, &path))
        })
        .await
    }

    async fn remove(&mut self, path: &str, is_dir: bool) -> Result<()> {
        let path = path.to_string();
        self.with_control(move |ftp| {
            let removed = if is_dir { ftp.rmdir(&path) } else { ftp.rm(&path) };
            removed.map_err(|e| ftp_error(e, &path))
        })
        .await
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        // RNTO semantics for an existing target vary by server.
        if !replace {
            match self.metadata(to).await {
                Ok(_) => return Err(StorageError::AlreadyExists(to.to_string())),
                Err(StorageError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        let (from, to) = (from.to_string(), to.to_string());
        self.with_control(move |ftp| ftp.rename(&from, &to).map_err(|e| ftp_error(e, &from)))
            .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut ftp) = self.control.take() {
            tokio::task::spawn_blocking(move || {
                let _ = ftp.quit();
            })
            .await?;
        }
        Ok(())
    }
}

fn parse_list(lines: &[String]) -> Vec<VfsEntry> {
    lines
        .iter()
        .filter_map(|line| File::from_str(line).ok())
        .filter(|file| file.name() != "." && file.name() != "..")
        .map(|file| VfsEntry {
            name: file_name(file.name()),
            is_dir: file.is_directory(),
            size: (!file.is_directory()).then_some(file.size() as u64),
            modified: Some(DateTime::<Utc>::from(file.modified())),
        })
        .collect()
}

fn ftp_error(err: FtpError, subject: &str) -> StorageError {
    match err {
        // An unparseable reply is what a closed control socket reads as.
        FtpError::BadResponse => StorageError::SessionExpired,
        FtpError::ConnectionError(io) => match io.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => StorageError::SessionExpired,
            _ => StorageError::from(io),
        },
        FtpError::UnexpectedResponse(response) => {
            let text = String::from_utf8_lossy(&response.body).to_string();
            classify_reply(response.status.code(), &text, subject)
        }
        other => StorageError::ProtocolError(other.to_string()),
    }
}

fn classify_reply(code: u32, text: &str, subject: &str) -> StorageError {
    let lower = text.to_lowercase();
    match code {
        530 | 332 => StorageError::AuthenticationFailed,
        421 => StorageError::SessionExpired,
        450 | 550 | 553 => {
            if lower.contains("permission") || lower.contains("denied") {
                StorageError::PermissionDenied(subject.to_string())
            } else if lower.contains("no such") || lower.contains("not found") || lower.contains("not exist") {
                StorageError::NotFound(subject.to_string())
            } else if lower.contains("exists") {
                StorageError::AlreadyExists(subject.to_string())
            } else if code == 553 {
                StorageError::PermissionDenied(subject.to_string())
            } else {
                StorageError::NotFound(subject.to_string())
            }
        }
        _ => StorageError::ProtocolError(format!("{code} {}", text.trim())),
    }
}
