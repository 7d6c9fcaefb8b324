use crate::error::{Result, StorageError};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::any::Any;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::{StreamReader, SyncIoBridge};

const PIPE_CAPACITY: usize = 256 * 1024;
const CHANNEL_DEPTH: usize = 8;
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

pub struct ReadStream {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl ReadStream {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            inner: Box::pin(reader),
            _guard: None,
        }
    }

    pub(crate) fn holding<G: Any + Send>(mut self, guard: G) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    pub fn channel() -> (ChunkSender, Self) {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let chunks = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        (ChunkSender { tx }, Self::new(StreamReader::new(chunks)))
    }

    pub fn from_blocking<F>(produce: F) -> Self
    where
        F: FnOnce(&ChunkSender) -> Result<()> + Send + 'static,
    {
        let (sender, stream) = Self::channel();
        tokio::task::spawn_blocking(move || {
            if let Err(err) = produce(&sender) {
                sender.blocking_fail(err);
            }
        });
        stream
    }
}

impl AsyncRead for ReadStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

pub struct ChunkSender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl ChunkSender {
    /// Fails with `Cancelled` once the reader is gone, which is the producer's
    /// signal to stop.
    pub async fn send(&self, chunk: &[u8]) -> Result<()> {
        self.tx
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|_| StorageError::Cancelled)
    }

    pub fn blocking_send(&self, chunk: &[u8]) -> Result<()> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(chunk)))
            .map_err(|_| StorageError::Cancelled)
    }

    pub async fn fail(&self, err: StorageError) {
        let _ = self.tx.send(Err(err.into_io())).await;
    }

    pub fn blocking_fail(&self, err: StorageError) {
        let _ = self.tx.blocking_send(Err(err.into_io()));
    }
}

/// Reader half of a [`WriteStream`], consumed by the protocol upload.
///
/// End of input is only reported as a clean EOF after [`WriteStream::finish`];
/// a writer that was dropped or aborted surfaces as `BrokenPipe`, so engines
/// fail the transfer instead of storing a truncated file.
pub struct UploadSource {
    inner: DuplexStream,
    completed: Arc<AtomicBool>,
}

impl AsyncRead for UploadSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) if buf.filled().len() == before && buf.remaining() > 0 => {
                if this.completed.load(Ordering::Acquire) {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "write stream abandoned before finish",
                    )))
                }
            }
            other => other,
        }
    }
}

/// Writable remote file. Call [`WriteStream::finish`] to complete the upload;
/// dropping the stream abandons it.
pub struct WriteStream {
    writer: Option<DuplexStream>,
    completed: Arc<AtomicBool>,
    upload: Option<JoinHandle<Result<()>>>,
    written: u64,
}

impl WriteStream {
    pub fn spawn<F, Fut>(upload: F) -> Self
    where
        F: FnOnce(UploadSource) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let completed = Arc::new(AtomicBool::new(false));
        let source = UploadSource {
            inner: reader,
            completed: Arc::clone(&completed),
        };
        Self {
            writer: Some(writer),
            completed,
            upload: Some(tokio::spawn(upload(source))),
            written: 0,
        }
    }

    pub fn spawn_blocking<F>(upload: F) -> Self
    where
        F: FnOnce(SyncIoBridge<UploadSource>) -> Result<()> + Send + 'static,
    {
        Self::spawn(move |source| async move {
            let bridge = SyncIoBridge::new(source);
            tokio::task::spawn_blocking(move || upload(bridge)).await?
        })
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub async fn finish(mut self) -> Result<u64> {
        self.completed.store(true, Ordering::Release);
        let shutdown = match self.writer.take() {
            Some(mut writer) => writer.shutdown().await,
            None => Ok(()),
        };
        if let Some(upload) = self.upload.take() {
            upload.await??;
        }
        shutdown?;
        Ok(self.written)
    }

    pub async fn abort(mut self) {
        self.writer.take();
        if let Some(upload) = self.upload.take() {
            let _ = upload.await;
        }
    }
}

impl AsyncWrite for WriteStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(writer) = this.writer.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write stream already finished",
            )));
        };
        match Pin::new(writer).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().writer.as_mut() {
            Some(writer) => Pin::new(writer).poll_flush(cx),
            None => Poll::Ready(Ok(())),
        }
    }

    // Completion needs `finish`; shutting down only flushes.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tokio::io::AsyncReadExt;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_finished_stream_delivers_all_bytes() {
        let (tx, rx) = oneshot::channel();
        let mut stream = WriteStream::spawn(|mut source| async move {
            let mut data = Vec::new();
            source.read_to_end(&mut data).await?;
            let _ = tx.send(data);
            Ok(())
        });

        stream.write_all(b"hello ").await.unwrap();
        stream.write_all(b"world").await.unwrap();
        assert_eq!(stream.finish().await.unwrap(), 11);
        assert_eq!(rx.await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_dropped_stream_fails_the_upload() {
        let (tx, rx) = oneshot::channel();
        let mut stream = WriteStream::spawn(|mut source| async move {
            let mut data = Vec::new();
            let outcome = source.read_to_end(&mut data).await;
            let _ = tx.send(outcome.is_err());
            outcome.map(|_| ()).map_err(StorageError::from)
        });

        stream.write_all(b"partial").await.unwrap();
        drop(stream);
        assert!(rx.await.unwrap(), "abandoned upload must see an error");
    }

    #[tokio::test]
    async fn test_blocking_upload_sees_abort() {
        let (tx, rx) = oneshot::channel();
        let mut stream = WriteStream::spawn_blocking(move |mut bridge| {
            let mut data = Vec::new();
            let outcome = bridge.read_to_end(&mut data);
            let _ = tx.send(outcome.is_err());
            outcome.map(|_| ()).map_err(StorageError::from)
        });

        stream.write_all(&[7u8; 1024]).await.unwrap();
        stream.abort().await;
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_upload_error_surfaces_on_finish() {
        let stream = WriteStream::spawn(|_source| async move {
            Err(StorageError::PermissionDenied("/ro/file".into()))
        });
        let err = stream.finish().await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_blocking_reader_propagates_errors() {
        let mut stream = ReadStream::from_blocking(|sender| {
            sender.blocking_send(b"abc")?;
            Err(StorageError::Timeout)
        });

        let mut first = [0u8; 3];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"abc");

        let mut rest = Vec::new();
        let err = stream.read_to_end(&mut rest).await.unwrap_err();
        assert_eq!(StorageError::from(err), StorageError::Timeout);
    }
}
