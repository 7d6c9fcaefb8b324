use super::stream::CHUNK_SIZE;
use super::{Capabilities, ConnectInfo, FileEntry, ProtocolClient, ReadStream, WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::utils::{file_name, is_within, join_path, normalize_path};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct DfsTarget {
    root: String,
    host: String,
    share: String,
    inner: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Location {
    host: String,
    share: String,
    inner: String,
}

impl Location {
    fn service(&self) -> String {
        format!("//{}/{}", self.host, self.share)
    }

    fn is_share_root(&self) -> bool {
        self.inner == "/"
    }

    fn quoted(&self) -> String {
        format!("\"{}\"", self.inner.replace('/', "\\"))
    }

    fn children_mask(&self) -> String {
        if self.is_share_root() {
            "\"\\*\"".to_string()
        } else {
            format!("\"{}\\*\"", self.inner.replace('/', "\\"))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SmbListing {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Clone)]
struct Invocation {
    program: String,
    args: Vec<String>,
    password: Option<String>,
}

impl Invocation {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Keeps the password off the process list.
        if let Some(password) = &self.password {
            cmd.env("PASSWD", password);
        }
        cmd
    }

    fn spawn_error(&self, err: io::Error) -> StorageError {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::ProtocolError(format!(
                "{} not found. Please install the samba client package",
                self.program
            ))
        } else {
            StorageError::from(err)
        }
    }

    async fn output(&self) -> Result<Outcome> {
        let output = self
            .command()
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;
        Ok(Outcome::from(output))
    }
}

struct Outcome {
    success: bool,
    stdout: String,
    stderr: String,
}

impl From<Output> for Outcome {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl Outcome {
    fn status_error(&self, host: &str, subject: &str, connecting: bool) -> Option<StorageError> {
        find_status(&self.stdout)
            .or_else(|| find_status(&self.stderr))
            .map(|code| status_error(&code, host, subject, connecting))
    }

    fn check(self, host: &str, subject: &str, connecting: bool) -> Result<String> {
        if let Some(err) = self.status_error(host, subject, connecting) {
            return Err(err);
        }
        if !self.success {
            let detail = self
                .stderr
                .lines()
                .chain(self.stdout.lines())
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("smbclient failed")
                .to_string();
            return Err(StorageError::ProtocolError(detail));
        }
        Ok(self.stdout)
    }
}

pub struct SmbClient {
    descriptor: ConnectionDescriptor,
    program: String,
    timeout: Duration,
    connected: bool,
    dfs: Option<DfsTarget>,
}

impl SmbClient {
    pub fn new(descriptor: ConnectionDescriptor, program: String, timeout: Duration) -> Self {
        Self {
            descriptor,
            program,
            timeout,
            connected: false,
            dfs: None,
        }
    }

    fn invocation(&self, mut args: Vec<String>, commands: Option<&str>) -> Invocation {
        let d = &self.descriptor;
        args.extend(["-p".to_string(), d.effective_port().to_string()]);
        args.extend(["-t".to_string(), self.timeout.as_secs().max(1).to_string()]);
        if let Some(domain) = &d.domain {
            args.extend(["-W".to_string(), domain.clone()]);
        }
        let mut password = None;
        match (&d.user, d.anonymous) {
            (Some(user), false) => {
                args.extend(["-U".to_string(), user.clone()]);
                match &d.password {
                    Some(secret) => password = Some(secret.clone()),
                    None => args.push("-N".to_string()),
                }
            }
            _ => args.extend(["-N".to_string(), "-U".to_string(), "%".to_string()]),
        }
        if let Some(commands) = commands {
            args.extend(["-c".to_string(), commands.to_string()]);
        }
        Invocation {
            program: self.program.clone(),
            args,
            password,
        }
    }

    fn share_invocation(&self, loc: &Location, commands: &str) -> Invocation {
        self.invocation(vec![loc.service()], Some(commands))
    }

    async fn exec(
        &self,
        invocation: &Invocation,
        host: &str,
        subject: &str,
        connecting: bool,
    ) -> Result<String> {
        debug!(program = %invocation.program, subject, "running smbclient");
        invocation.output().await?.check(host, subject, connecting)
    }

    async fn run(&self, loc: &Location, commands: &str, subject: &str) -> Result<String> {
        let invocation = self.share_invocation(loc, commands);
        match self.exec(&invocation, &loc.host, subject, false).await {
            Err(err) if err.is_session_expired() => {
                debug!(subject, "SMB session expired, retrying once");
                self.exec(&invocation, &loc.host, subject, false)
                    .await
                    .map_err(StorageError::surfaced)
            }
            other => other,
        }
    }

    async fn list_shares(&self, connecting: bool) -> Result<Vec<String>> {
        let host = self.descriptor.host.clone();
        let invocation = self.invocation(vec!["-L".to_string(), host.clone(), "-g".to_string()], None);
        let output = self.exec(&invocation, &host, "/", connecting).await?;
        Ok(parse_share_list(&output))
    }

    fn locate(&self, path: &str) -> Result<Location> {
        if path.contains(['"', ';', '\n', '\r']) {
            return Err(StorageError::ProtocolError(format!(
                "unsupported character in SMB path: {path:?}"
            )));
        }
        let path = normalize_path(path);

        if let Some(dfs) = &self.dfs {
            if is_within(&path, &dfs.root) {
                let rest = &path[dfs.root.len()..];
                return Ok(Location {
                    host: dfs.host.clone(),
                    share: dfs.share.clone(),
                    inner: normalize_path(&format!("{}/{}", dfs.inner, rest)),
                });
            }
        }

        let trimmed = path.trim_start_matches('/');
        let (share, rest) = trimmed.split_once('/').unwrap_or((trimmed, ""));
        if share.is_empty() {
            return Err(StorageError::ProtocolError(
                "the server root is not inside a share".into(),
            ));
        }
        Ok(Location {
            host: self.descriptor.host.clone(),
            share: share.to_string(),
            inner: normalize_path(rest),
        })
    }

    async fn resolve_dfs(&self, root: &str, loc: &Location) -> Result<Option<DfsTarget>> {
        let commands = format!("cd {}; showconnect", loc.quoted());
        let invocation = self.share_invocation(loc, &commands);
        let output = self.exec(&invocation, &loc.host, root, true).await?;
        let (host, share, inner) = parse_showconnect(&output).ok_or_else(|| {
            StorageError::ProtocolError("server reported no DFS target".into())
        })?;

        if host.eq_ignore_ascii_case(&loc.host) && share.eq_ignore_ascii_case(&loc.share) {
            return Ok(None);
        }
        Ok(Some(DfsTarget {
            root: root.to_string(),
            host,
            share,
            inner,
        }))
    }

    fn directory_entry(&self, path: &str) -> FileEntry {
        FileEntry {
            name: file_name(path),
            path: path.to_string(),
            uri: self.descriptor.file_uri(path),
            size: None,
            modified: None,
            is_directory: true,
        }
    }

    fn to_entry(&self, path: String, listing: SmbListing) -> FileEntry {
        FileEntry {
            name: listing.name,
            uri: self.descriptor.file_uri(&path),
            path,
            size: (!listing.is_dir).then_some(listing.size),
            modified: listing.modified,
            is_directory: listing.is_dir,
        }
    }
}

#[async_trait]
impl ProtocolClient for SmbClient {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            random_access_read: false,
            atomic_replace: true,
            append: false,
        }
    }

    async fn connect(&mut self) -> Result<ConnectInfo> {
        self.connected = false;
        self.dfs = None;

        let host = self.descriptor.host.as_str();
        let resolved = tokio::net::lookup_host((host, self.descriptor.effective_port()))
            .await
            .map_err(|_| StorageError::NameResolutionFailed(host.to_string()))?
            .next()
            .is_some();
        if !resolved {
            return Err(StorageError::NameResolutionFailed(host.to_string()));
        }

        let root = self.descriptor.root_folder();
        let mut info = ConnectInfo::default();
        if root == "/" {
            self.list_shares(true).await?;
        } else {
            let loc = self.locate(&root)?;
            let direct = self.share_invocation(&loc, &format!("cd {}", loc.quoted()));
            if self.descriptor.enable_dfs {
                match self.resolve_dfs(&root, &loc).await {
                    Ok(Some(target)) => {
                        info!(root = %root, target = %format!("//{}/{}", target.host, target.share), "resolved DFS referral");
                        info.resolved_root = Some(format!("//{}/{}{}", target.host, target.share, target.inner));
                        self.dfs = Some(target);
                    }
                    Ok(None) => {}
                    Err(
                        err @ (StorageError::AuthenticationFailed
                        | StorageError::HostUnreachable(_)
                        | StorageError::NameResolutionFailed(_)
                        | StorageError::Timeout),
                    ) => return Err(err),
                    Err(err) => {
                        warn!(root = %root, error = %err, "DFS resolution failed, using direct path");
                        self.exec(&direct, &loc.host, &root, true).await?;
                        info.dfs_fallback = true;
                    }
                }
            } else {
                self.exec(&direct, &loc.host, &root, true).await?;
            }
        }

        self.connected = true;
        info!(host = %self.descriptor.host, root = %root, "SMB connection established");
        Ok(info)
    }

    async fn is_alive(&mut self) -> bool {
        if !self.connected {
            return false;
        }
        let root = self.descriptor.root_folder();
        if root == "/" {
            return self.list_shares(false).await.is_ok();
        }
        match self.locate(&root) {
            Ok(loc) => self.run(&loc, "pwd", &root).await.is_ok(),
            Err(_) => false,
        }
    }

    async fn list(&mut self, path: &str) -> Result<Vec<FileEntry>> {
        let path = normalize_path(path);
        if path == "/" {
            let shares = self.list_shares(false).await?;
            return Ok(shares
                .iter()
                .map(|share| self.directory_entry(&join_path("/", share)))
                .collect());
        }

        let loc = self.locate(&path)?;
        let output = match self.run(&loc, &format!("ls {}", loc.children_mask()), &path).await {
            Ok(output) => output,
            // An empty mask match and a missing directory look the same.
            Err(StorageError::NotFound(_)) => {
                let entry = self.stat(&path).await?;
                if entry.is_directory {
                    return Ok(Vec::new());
                }
                return Err(StorageError::ProtocolError(format!("not a directory: {path}")));
            }
            Err(err) => return Err(err),
        };

        Ok(parse_listing(&output)
            .into_iter()
            .map(|listing| {
                let child = join_path(&path, &listing.name);
                self.to_entry(child, listing)
            })
            .collect())
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry> {
        let path = normalize_path(path);
        if path == "/" {
            return Ok(self.directory_entry(&path));
        }
        let loc = self.locate(&path)?;
        if loc.is_share_root() {
            self.run(&loc, "pwd", &path).await?;
            return Ok(self.directory_entry(&path));
        }

        let output = self.run(&loc, &format!("ls {}", loc.quoted()), &path).await?;
        let wanted = file_name(&loc.inner);
        parse_listing(&output)
            .into_iter()
            .find(|listing| listing.name.eq_ignore_ascii_case(&wanted))
            .map(|listing| {
                let mut entry = self.to_entry(path.clone(), listing);
                entry.name = file_name(&path);
                entry
            })
            .ok_or(StorageError::NotFound(path))
    }

    async fn open_read(&mut self, path: &str, offset: u64) -> Result<ReadStream> {
        if offset > 0 {
            return Err(StorageError::ProtocolError(
                "SMB client does not support random_access_read".into(),
            ));
        }
        let entry = self.stat(path).await?;
        if entry.is_directory {
            return Err(StorageError::ProtocolError(format!("is a directory: {}", entry.path)));
        }

        let loc = self.locate(&entry.path)?;
        let invocation = self.share_invocation(&loc, &format!("get {} -", loc.quoted()));
        let mut child = invocation
            .command()
            .spawn()
            .map_err(|e| invocation.spawn_error(e))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| StorageError::ProtocolError("smbclient stdout unavailable".into()))?;

        let (sender, stream) = ReadStream::channel();
        let subject = entry.path;
        tokio::spawn(async move {
            let mut buf = vec![0u8; CHUNK_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        // Reader gone: dropping the child kills smbclient.
                        if sender.send(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        sender.fail(err.into()).await;
                        return;
                    }
                }
            }
            match child.wait_with_output().await {
                Ok(output) => {
                    if let Err(err) = Outcome::from(output).check(&loc.host, &subject, false) {
                        sender.fail(err).await;
                    }
                }
                Err(err) => sender.fail(err.into()).await,
            }
        });
        Ok(stream)
    }

    async fn open_write(&mut self, path: &str, mode: WriteMode) -> Result<WriteStream> {
        if mode == WriteMode::Append {
            return Err(StorageError::ProtocolError(
                "SMB client does not support append writes".into(),
            ));
        }
        let subject = normalize_path(path);
        let loc = self.locate(&subject)?;
        if loc.is_share_root() {
            return Err(StorageError::PermissionDenied(subject));
        }
        let invocation = self.share_invocation(&loc, &format!("put - {}", loc.quoted()));

        Ok(WriteStream::spawn(move |mut source| async move {
            let mut cmd = invocation.command();
            cmd.stdin(Stdio::piped());
            let mut child = cmd.spawn().map_err(|e| invocation.spawn_error(e))?;
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| StorageError::ProtocolError("smbclient stdin unavailable".into()))?;

            let copied = tokio::io::copy(&mut source, &mut stdin).await;
            drop(stdin);
            if copied.is_err() {
                let _ = child.start_kill();
            }
            let outcome = Outcome::from(child.wait_with_output().await?);
            match copied {
                Err(err) => Err(outcome
                    .status_error(&loc.host, &subject, false)
                    .unwrap_or_else(|| err.into())),
                Ok(_) => outcome.check(&loc.host, &subject, false).map(|_| ()),
            }
        }))
    }

    async fn create(&mut self, path: &str, is_directory: bool) -> Result<FileEntry> {
        let path = normalize_path(path);
        match self.stat(&path).await {
            Ok(_) => return Err(StorageError::AlreadyExists(path)),
            Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let loc = self.locate(&path)?;
        if loc.is_share_root() {
            return Err(StorageError::PermissionDenied(path));
        }
        let commands = if is_directory {
            format!("mkdir {}", loc.quoted())
        } else {
            format!("put /dev/null {}", loc.quoted())
        };
        self.run(&loc, &commands, &path).await?;
        self.stat(&path).await
    }

    async fn delete(&mut self, path: &str) -> Result<()> {
        let entry = self.stat(path).await?;
        let loc = self.locate(&entry.path)?;
        if entry.path == "/" || loc.is_share_root() {
            return Err(StorageError::PermissionDenied(entry.path));
        }
        let commands = if entry.is_directory {
            format!("deltree {}", loc.quoted())
        } else {
            format!("del {}", loc.quoted())
        };
        self.run(&loc, &commands, &entry.path).await?;
        Ok(())
    }

    async fn rename(&mut self, from: &str, to: &str, replace: bool) -> Result<()> {
        let source = self.locate(from)?;
        let target = self.locate(to)?;
        if source.is_share_root() || target.is_share_root() {
            return Err(StorageError::PermissionDenied(normalize_path(from)));
        }
        if source.service() != target.service() {
            return Err(StorageError::ProtocolError(
                "rename across shares is not supported".into(),
            ));
        }
        let mut commands = format!("rename {} {}", source.quoted(), target.quoted());
        if replace {
            commands.push_str(" -f");
        }
        self.run(&source, &commands, &normalize_path(from)).await?;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.connected {
            debug!(host = %self.descriptor.host, "SMB connection released");
        }
        self.connected = false;
        self.dfs = None;
        Ok(())
    }
}

fn find_status(text: &str) -> Option<String> {
    let re = Regex::new(r"NT_STATUS_[A-Z_]+").ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

fn status_error(code: &str, host: &str, subject: &str, connecting: bool) -> StorageError {
    match code.trim_start_matches("NT_STATUS_") {
        "LOGON_FAILURE" | "WRONG_PASSWORD" | "NO_SUCH_USER" | "ACCOUNT_DISABLED"
        | "ACCOUNT_LOCKED_OUT" | "PASSWORD_EXPIRED" | "ACCOUNT_RESTRICTION" => {
            StorageError::AuthenticationFailed
        }
        "ACCESS_DENIED" | "MEDIA_WRITE_PROTECTED" | "CANNOT_DELETE" => {
            StorageError::PermissionDenied(subject.to_string())
        }
        "NOT_FOUND" if connecting => StorageError::NameResolutionFailed(host.to_string()),
        "NOT_FOUND" | "OBJECT_NAME_NOT_FOUND" | "NO_SUCH_FILE" | "OBJECT_PATH_NOT_FOUND"
        | "BAD_NETWORK_NAME" | "NOT_A_DIRECTORY" | "DELETE_PENDING" => {
            StorageError::NotFound(subject.to_string())
        }
        "OBJECT_NAME_COLLISION" => StorageError::AlreadyExists(subject.to_string()),
        "HOST_UNREACHABLE" | "NETWORK_UNREACHABLE" | "CONNECTION_REFUSED" | "PORT_UNREACHABLE" => {
            StorageError::HostUnreachable(host.to_string())
        }
        "IO_TIMEOUT" => StorageError::Timeout,
        "NETWORK_SESSION_EXPIRED" | "USER_SESSION_DELETED" | "CONNECTION_DISCONNECTED"
        | "CONNECTION_RESET" | "CONNECTION_ABORTED" => StorageError::SessionExpired,
        other => StorageError::ProtocolError(format!("NT_STATUS_{other}: {subject}")),
    }
}

/// Parses `smbclient ls` rows:
/// ```text
///   Documents                           D        0  Wed Dec 25 10:30:45 2024
///   report.pdf                          A     1024  Thu Jan  2 08:01:00 2025
/// ```
pub(crate) fn parse_listing(output: &str) -> Vec<SmbListing> {
    let Ok(re) = Regex::new(
        r"(?x)
        ^\s{2}(.+?)\s+                                   # name
        ([A-Z]*)\s+                                      # attributes
        (\d+)\s+                                         # size
        (\w{3}\s\w{3}\s[\s\d]\d\s\d{2}:\d{2}:\d{2}\s\d{4})\s*$   # date
        ",
    ) else {
        return Vec::new();
    };

    output
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            let name = caps.get(1)?.as_str().trim();
            if name == "." || name == ".." {
                return None;
            }
            let attributes = caps.get(2)?.as_str();
            Some(SmbListing {
                name: name.to_string(),
                is_dir: attributes.contains('D'),
                size: caps.get(3)?.as_str().parse().unwrap_or(0),
                modified: parse_smb_date(caps.get(4)?.as_str()),
            })
        })
        .collect()
}

fn parse_smb_date(text: &str) -> Option<DateTime<Utc>> {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let naive = NaiveDateTime::parse_from_str(&compact, "%a %b %d %H:%M:%S %Y").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

pub(crate) fn parse_share_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split('|');
            if fields.next()? != "Disk" {
                return None;
            }
            let name = fields.next()?.trim();
            (!name.is_empty() && !name.ends_with('$')).then(|| name.to_string())
        })
        .collect()
}

/// `showconnect` prints the connection serving the current directory as
/// `//server/share[/path]`.
pub(crate) fn parse_showconnect(output: &str) -> Option<(String, String, String)> {
    let re = Regex::new(r"^//([^/\s]+)/([^/\s]+)(/\S*)?\s*$").ok()?;
    output.lines().find_map(|line| {
        let caps = re.captures(line.trim())?;
        let inner = caps.get(3).map(|m| m.as_str()).unwrap_or("/");
        Some((
            caps.get(1)?.as_str().to_string(),
            caps.get(2)?.as_str().to_string(),
            normalize_path(&inner.replace('\\', "/")),
        ))
    })
}
