use crate::cache::DirectoryCache;
use crate::client::{WriteMode, WriteStream};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::session::{ClientGuard, Session, SessionLease, SessionRegistry};
use crate::utils::{file_name, join_path, normalize_path, parent_path};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

pub fn temp_path(destination: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    join_path(
        &parent_path(destination),
        &format!(".{}.{}.tmp", file_name(destination), &suffix[..8]),
    )
}

struct Commit {
    lease: SessionLease,
    registry: SessionRegistry,
    cache: Arc<DirectoryCache>,
    descriptor: ConnectionDescriptor,
    destination: String,
    temp: Option<String>,
}

impl Commit {
    async fn client(&self) -> Result<ClientGuard> {
        match self.lease.session().lock().await {
            Err(StorageError::SessionExpired) => {
                debug!(session = self.lease.session().id(), "session closed during transfer, acquiring again");
                let session = self.registry.acquire(&self.descriptor).await?;
                session.lock().await.map_err(StorageError::surfaced)
            }
            other => other,
        }
    }

    fn invalidate(&self) {
        self.cache
            .invalidate(&self.descriptor, &parent_path(&self.destination));
    }

    async fn complete(&self) -> Result<()> {
        let Some(temp) = &self.temp else {
            self.invalidate();
            return Ok(());
        };
        let promoted = self.promote(temp).await;
        self.invalidate();
        match promoted {
            Ok(()) => {
                debug!(destination = %self.destination, "safe transfer committed");
                Ok(())
            }
            Err(err) => {
                warn!(temp = %temp, destination = %self.destination, error = %err,
                    "commit failed, temporary file left in place");
                Err(err)
            }
        }
    }

    async fn promote(&self, temp: &str) -> Result<()> {
        let mut client = self.client().await?;
        if self.lease.session().capabilities().atomic_replace {
            return client.rename(temp, &self.destination, true).await;
        }
        match client.delete(&self.destination).await {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        client.rename(temp, &self.destination, false).await
    }

    async fn discard(&self) {
        self.invalidate();
        let Some(temp) = &self.temp else {
            return;
        };
        let deleted = match self.client().await {
            Ok(mut client) => client.delete(temp).await,
            Err(err) => Err(err),
        };
        match deleted {
            Ok(()) | Err(StorageError::NotFound(_)) => {
                debug!(temp = %temp, "discarded temporary file");
            }
            Err(err) => warn!(temp = %temp, error = %err, "could not remove temporary file"),
        }
    }
}

/// Writable remote file returned by `open_output_stream`.
///
/// Call [`OutputStream::finish`] to commit. Dropping the stream, calling
/// [`OutputStream::abort`] or a failing write leaves the destination as it
/// was when a temp file is used, and removes the temp file.
pub struct OutputStream {
    stream: Option<WriteStream>,
    commit: Option<Commit>,
    copied: u64,
}

impl OutputStream {
    pub(crate) async fn open(
        registry: &SessionRegistry,
        session: Arc<Session>,
        cache: Arc<DirectoryCache>,
        descriptor: &ConnectionDescriptor,
        path: &str,
        append: bool,
    ) -> Result<Self> {
        let destination = normalize_path(path);
        let native_append = append && session.capabilities().append && !descriptor.safe_transfer;
        let copy_existing = append && !native_append;
        let temp = (descriptor.safe_transfer || copy_existing).then(|| temp_path(&destination));
        let target = temp.as_deref().unwrap_or(&destination).to_string();
        let mode = if native_append {
            WriteMode::Append
        } else {
            WriteMode::Truncate
        };

        let lease = session.lease();
        let stream = {
            let mut client = session.lock().await.map_err(StorageError::surfaced)?;
            client.open_write(&target, mode).await?
        };
        info!(path = %destination, temp = ?temp, append, "output stream opened");

        let mut output = Self {
            stream: Some(stream),
            commit: Some(Commit {
                lease,
                registry: registry.clone(),
                cache,
                descriptor: descriptor.clone(),
                destination,
                temp,
            }),
            copied: 0,
        };
        if copy_existing {
            match output.copy_existing().await {
                Ok(copied) => output.copied = copied,
                Err(err) => {
                    output.abort().await;
                    return Err(err.surfaced());
                }
            }
        }
        Ok(output)
    }

    async fn copy_existing(&mut self) -> Result<u64> {
        let Some(commit) = &self.commit else {
            return Ok(0);
        };
        let reader = {
            let mut client = commit.client().await?;
            match client.open_read(&commit.destination, 0).await {
                Ok(reader) => Some(reader),
                Err(StorageError::NotFound(_)) => None,
                Err(err) => return Err(err),
            }
        };
        let (Some(mut reader), Some(stream)) = (reader, self.stream.as_mut()) else {
            return Ok(0);
        };
        Ok(tokio::io::copy(&mut reader, stream).await?)
    }

    pub fn path(&self) -> Option<&str> {
        self.commit.as_ref().map(|c| c.destination.as_str())
    }

    pub fn write_path(&self) -> Option<&str> {
        self.commit
            .as_ref()
            .map(|c| c.temp.as_deref().unwrap_or(&c.destination))
    }

    pub fn bytes_written(&self) -> u64 {
        self.stream
            .as_ref()
            .map_or(0, |s| s.bytes_written().saturating_sub(self.copied))
    }

    /// Completes the upload and commits it. Returns the bytes written by the
    /// caller. A session closed while the bytes were in flight is replaced
    /// for the commit.
    pub async fn finish(self) -> Result<u64> {
        self.close_and_commit().await.map_err(StorageError::surfaced)
    }

    async fn close_and_commit(mut self) -> Result<u64> {
        let Some(stream) = self.stream.take() else {
            return Err(StorageError::IoError("output stream already closed".into()));
        };
        let written = match stream.finish().await {
            Ok(written) => written.saturating_sub(self.copied),
            Err(err) => {
                if let Some(commit) = self.commit.take() {
                    commit.discard().await;
                }
                return Err(err);
            }
        };
        let Some(commit) = self.commit.as_ref() else {
            return Ok(written);
        };
        let committed = commit.complete().await;
        // From here on nothing is cleaned up, a failed commit keeps its temp file.
        self.commit = None;
        committed.map(|()| written)
    }

    pub async fn abort(mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort().await;
        }
        if let Some(commit) = self.commit.take() {
            commit.discard().await;
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        let Some(commit) = self.commit.take() else {
            return;
        };
        let stream = self.stream.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(path = %commit.destination, "output stream dropped, cleaning up");
                handle.spawn(async move {
                    if let Some(stream) = stream {
                        stream.abort().await;
                    }
                    commit.discard().await;
                });
            }
            Err(_) => {
                commit.invalidate();
                if let Some(temp) = &commit.temp {
                    warn!(temp = %temp, "output stream dropped outside a runtime, temporary file left in place");
                }
            }
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "output stream closed")
}

impl AsyncWrite for OutputStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_write(cx, buf),
            None => Poll::Ready(Err(closed())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().stream.as_mut() {
            Some(stream) => Pin::new(stream).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}
