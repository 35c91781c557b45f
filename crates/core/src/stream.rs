/// Byte stream adapter over overlay channels
///
/// [`OverlayStream`] turns the pull based [`ByteChannel`] primitive into a
/// tokio `AsyncRead + AsyncWrite` stream. Each read pull issues one bounded
/// channel read sized to the caller's free buffer space; each write is
/// followed by a flush before it completes; shutdown closes the channel once.

use crate::overlay::ByteChannel;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

type ReadFuture = BoxFuture<'static, io::Result<Option<Vec<u8>>>>;
type UnitFuture = BoxFuture<'static, io::Result<()>>;

/// Write started by `poll_write` that no caller has been told about yet
struct PendingWrite {
    data: Arc<[u8]>,
    future: UnitFuture,
}

pub struct OverlayStream {
    channel: Arc<dyn ByteChannel>,
    read: Option<ReadFuture>,
    write: Option<PendingWrite>,
    close: Option<UnitFuture>,
    /// Bytes of the last chunk that did not fit the caller's buffer
    unread: Vec<u8>,
    eof: bool,
    closed: bool,
}

impl OverlayStream {
    pub fn new(channel: Arc<dyn ByteChannel>) -> Self {
        Self {
            channel,
            read: None,
            write: None,
            close: None,
            unread: Vec::new(),
            eof: false,
            closed: false,
        }
    }

    /// Upgrade the underlying channel to transport security with `peer`
    pub async fn upgrade_tls(&self, peer: &str) -> io::Result<()> {
        self.channel.upgrade_tls(peer).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn channel(&self) -> &Arc<dyn ByteChannel> {
        &self.channel
    }
}

impl fmt::Debug for OverlayStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayStream")
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .finish()
    }
}

impl AsyncRead for OverlayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.unread.is_empty() {
            let n = this.unread.len().min(buf.remaining());
            buf.put_slice(&this.unread[..n]);
            this.unread.drain(..n);
            return Poll::Ready(Ok(()));
        }

        if this.eof || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.read.is_none() {
            let channel = Arc::clone(&this.channel);
            let max = buf.remaining();
            this.read = Some(async move { channel.read(max).await }.boxed());
        }
        let Some(read) = this.read.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let result = match read.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.read = None;

        match result {
            Ok(Some(chunk)) if !chunk.is_empty() => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    this.unread = chunk[n..].to_vec();
                }
            }
            Ok(_) => this.eof = true,
            Err(e) => {
                debug!(error = %e, "overlay read failed, ending stream");
                this.eof = true;
            }
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for OverlayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "overlay stream closed",
            )));
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if let Some(pending) = this.write.as_mut() {
            let resumed = buf.starts_with(&pending.data);
            let result = match pending.future.poll_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };
            let len = pending.data.len();
            this.write = None;
            if resumed {
                return Poll::Ready(result.map(|()| len));
            }
            // Its caller gave up; `buf` still has to be written
            if let Err(e) = result {
                return Poll::Ready(Err(e));
            }
        }

        let channel = Arc::clone(&this.channel);
        let data: Arc<[u8]> = Arc::from(buf);
        let sent = Arc::clone(&data);
        let mut future = async move {
            channel.write(&sent).await?;
            channel.flush().await
        }
        .boxed();

        match future.poll_unpin(cx) {
            Poll::Ready(result) => Poll::Ready(result.map(|()| data.len())),
            Poll::Pending => {
                this.write = Some(PendingWrite { data, future });
                Poll::Pending
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Completed writes are already flushed; only an in-flight one is left
        let Some(pending) = this.write.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = match pending.future.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.write = None;
        Poll::Ready(result)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.close.is_none() {
            if this.closed {
                return Poll::Ready(Ok(()));
            }
            this.closed = true;
            let channel = Arc::clone(&this.channel);
            this.close = Some(async move { channel.close().await }.boxed());
        }
        let Some(close) = this.close.as_mut() else {
            return Poll::Ready(Ok(()));
        };

        let result = match close.poll_unpin(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.close = None;
        Poll::Ready(result)
    }
}

impl Drop for OverlayStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let channel = Arc::clone(&self.channel);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "closing dropped overlay stream failed");
                }
            });
        }
    }
}
