use super::{VfsEntry, VfsProvider};
use crate::client::stream::CHUNK_SIZE;
use crate::client::{Capabilities, ReadStream, WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use chrono::DateTime;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

// libssh2 session error codes
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_PASSWORD_EXPIRED: i32 = -15;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

// SFTP status codes
const FX_NO_SUCH_FILE: i32 = 2;
const FX_PERMISSION_DENIED: i32 = 3;
const FX_NO_CONNECTION: i32 = 6;
const FX_CONNECTION_LOST: i32 = 7;
const FX_NO_SUCH_PATH: i32 = 10;
const FX_FILE_ALREADY_EXISTS: i32 = 11;
const FX_WRITE_PROTECT: i32 = 12;

#[derive(Clone)]
struct SshLogin {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl SshLogin {
    fn connect(&self) -> Result<Session> {
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| StorageError::NameResolutionFailed(self.host.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(StorageError::NameResolutionFailed(self.host.clone()));
        }

        let mut tcp = None;
        let mut last_err = StorageError::HostUnreachable(self.host.clone());
        for addr in &addrs {
            match TcpStream::connect_timeout(addr, self.timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => {
                    last_err = match StorageError::from(err) {
                        StorageError::Timeout => StorageError::Timeout,
                        _ => StorageError::HostUnreachable(self.host.clone()),
                    }
                }
            }
        }
        let tcp = tcp.ok_or(last_err)?;

        let mut session = Session::new().map_err(|e| ssh_error(e, "/"))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake().map_err(|e| ssh_error(e, "/"))?;
        self.authenticate(&session)?;
        Ok(session)
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let method = match (&self.user, &self.password) {
            (Some(user), Some(password)) => {
                session
                    .userauth_password(user, password)
                    .map_err(|_| StorageError::AuthenticationFailed)?;
                "password"
            }
            (Some(user), None) => {
                session
                    .userauth_agent(user)
                    .map_err(|_| StorageError::AuthenticationFailed)?;
                "agent"
            }
            (None, _) => {
                // Querying the methods attempts "none" authentication.
                let _ = session.auth_methods("anonymous");
                "none"
            }
        };
        if !session.authenticated() {
            return Err(StorageError::AuthenticationFailed);
        }
        debug!(host = %self.host, method, "SSH authenticated");
        Ok(())
    }
}

pub struct SftpProvider {
    login: SshLogin,
    session: Option<Session>,
}

impl SftpProvider {
    pub fn new(descriptor: &ConnectionDescriptor, timeout: Duration) -> Self {
        let (user, password) = if descriptor.anonymous {
            (None, None)
        } else {
            (descriptor.user.clone(), descriptor.password.clone())
        };
        Self {
            login: SshLogin {
                host: descriptor.host.clone(),
                port: descriptor.effective_port(),
                user,
                password,
                timeout,
            },
            session: None,
        }
    }

    fn session(&self) -> Result<Session> {
        self.session.clone().ok_or(StorageError::SessionExpired)
    }

    /// Runs a blocking SFTP operation on its own channel.
    async fn with_sftp<T, F>(&self, subject: &str, op: F) -> Result<T>
    where
        F: FnOnce(&Sftp) -> std::result::Result<T, ssh2::Error> + Send + 'static,
        T: Send + 'static,
    {
        let session = self.session()?;
        let subject = subject.to_string();
        tokio::task::spawn_blocking(move || {
            let sftp = session.sftp().map_err(|e| ssh_error(e, &subject))?;
            op(&sftp).map_err(|e| ssh_error(e, &subject))
        })
        .await?
    }
}

#[async_trait]
impl VfsProvider for SftpProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            random_access_read: true,
            atomic_replace: false,
            append: true,
        }
    }

    async fn open(&mut self) -> Result<()> {
        let login = self.login.clone();
        let session = tokio::task::spawn_blocking(move || login.connect()).await??;
        info!(host = %self.login.host, "SFTP session opened");
        self.session = Some(session);
        Ok(())
    }

    async fn probe(&mut self) -> Result<()> {
        self.with_sftp("/", |sftp| sftp.realpath(Path::new(".")).map(|_| ()))
            .await
    }

    async fn read_dir(&mut self, path: &str) -> Result<Vec<VfsEntry>> {
        let dir = path.to_string();
        let listing = self
            .with_sftp(path, move |sftp| sftp.readdir(Path::new(&dir)))
            .await?;
        Ok(listing
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                Some(to_entry(name, &stat))
            })
            .collect())
    }

    async fn metadata(&mut self, path: &str) -> Result<VfsEntry> {
        let target = path.to_string();
        let stat = self
            .with_sftp(path, move |sftp| sftp.stat(Path::new(&target)))
            .await?;
        Ok(to_entry(crate::utils::file_name(path), &stat))
    }

    async fn reader(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        let session = self.session()?;
        let subject = path.to_string();
        let (sftp, file) = tokio::task::spawn_blocking(move || {
            let sftp = session.sftp().map_err(|e| ssh_error(e, &subject))?;
            let mut file = sftp
                .open(Path::new(&subject))
                .map_err(|e| ssh_error(e, &subject))?;
            if offset > 0 {
                file.seek(SeekFrom::Start(offset))?;
            }
            Ok::<_, StorageError>((sftp, file))
        })
        .await??;

        Ok(ReadStream::from_blocking(move |sender| {
            let (_sftp, mut file) = (sftp, file);
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    return Ok(());
                }
                sender.blocking_send(&buf[..n])?;
            }
        }))
    }

    async fn writer(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        let session = self.session()?;
        let subject = path.to_string();
        let (sftp, file) = tokio::task::spawn_blocking(move || {
            let sftp = session.sftp().map_err(|e| ssh_error(e, &subject))?;
            let flags = match mode {
                WriteMode::Truncate => OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                WriteMode::Append => OpenFlags::WRITE | OpenFlags::CREATE,
            };
            let mut file = sftp
                .open_mode(Path::new(&subject), flags, 0o644, OpenType::File)
                .map_err(|e| ssh_error(e, &subject))?;
            // Servers commonly ignore the append flag, so position explicitly.
            if mode == WriteMode::Append {
                let size = file.stat().map_err(|e| ssh_error(e, &subject))?.size.unwrap_or(0);
                file.seek(SeekFrom::Start(size))?;
            }
            Ok::<_, StorageError>((sftp, file))
        })
        .await??;

        Ok(WriteStream::spawn_blocking(move |mut source| {
            let (_sftp, mut file) = (sftp, file);
            io::copy(&mut source, &mut file)?;
            file.flush()?;
            Ok(())
        }))
    }

    async fn make_dir(&mut self, path: &str) -> Result<()> {
        let target = path.to_string();
        self.with_sftp(path, move |sftp| sftp.mkdir(Path::new(&target), 0o755))
            .await
    }

    async fn make_file(&mut self, path: &str) -> Result<()> {
        let target = path.to_string();
        self.with_sftp(path, move |sftp| {
            let flags = OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCLUSIVE;
            sftp.open_mode(Path::new(&target), flags, 0o644, OpenType::File)
                .map(|_| ())
        })
        .await
    }

    async fn remove(&mut self, path: &str, is_dir: bool) -> Result<()> {
        let target = path.to_string();
        self.with_sftp(path, move |sftp| {
            if is_dir {
                sftp.rmdir(Path::new(&target))
            } else {
                sftp.unlink(Path::new(&target))
            }
        })
        .await
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        let session = self.session()?;
        let (src, dst) = (from.to_string(), to.to_string());
        tokio::task::spawn_blocking(move || {
            let sftp = session.sftp().map_err(|e| ssh_error(e, &src))?;
            let exists = sftp.stat(Path::new(&dst)).is_ok();
            if exists && !replace {
                return Err(StorageError::AlreadyExists(dst));
            }
            let flags = if replace {
                RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE
            } else {
                RenameFlags::NATIVE
            };
            match sftp.rename(Path::new(&src), Path::new(&dst), Some(flags)) {
                Ok(()) => Ok(()),
                // SFTPv3 servers ignore the overwrite flag.
                Err(_) if exists => {
                    sftp.unlink(Path::new(&dst)).map_err(|e| ssh_error(e, &dst))?;
                    sftp.rename(Path::new(&src), Path::new(&dst), Some(flags))
                        .map_err(|e| ssh_error(e, &src))
                }
                Err(err) => Err(ssh_error(err, &src)),
            }
        })
        .await?
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            tokio::task::spawn_blocking(move || {
                let _ = session.disconnect(None, "closing", None);
            })
            .await?;
        }
        Ok(())
    }
}

fn to_entry(name: String, stat: &FileStat) -> VfsEntry {
    VfsEntry {
        name,
        is_dir: stat.is_dir(),
        size: stat.size,
        modified: stat
            .mtime
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0)),
    }
}

fn ssh_error(err: ssh2::Error, subject: &str) -> StorageError {
    match err.code() {
        ErrorCode::SFTP(FX_NO_SUCH_FILE | FX_NO_SUCH_PATH) => StorageError::NotFound(subject.to_string()),
        ErrorCode::SFTP(FX_PERMISSION_DENIED | FX_WRITE_PROTECT) => {
            StorageError::PermissionDenied(subject.to_string())
        }
        ErrorCode::SFTP(FX_FILE_ALREADY_EXISTS) => StorageError::AlreadyExists(subject.to_string()),
        ErrorCode::SFTP(FX_NO_CONNECTION | FX_CONNECTION_LOST) => StorageError::SessionExpired,
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED | LIBSSH2_ERROR_PASSWORD_EXPIRED) => {
            StorageError::AuthenticationFailed
        }
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT | LIBSSH2_ERROR_SOCKET_TIMEOUT) => StorageError::Timeout,
        ErrorCode::Session(
            LIBSSH2_ERROR_SOCKET_DISCONNECT | LIBSSH2_ERROR_SOCKET_SEND | LIBSSH2_ERROR_SOCKET_RECV,
        ) => StorageError::SessionExpired,
        _ => StorageError::ProtocolError(format!("{subject}: {}", err.message())),
    }
}
