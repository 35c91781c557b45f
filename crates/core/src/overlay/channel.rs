/// Byte channels over tokio streams

use super::ByteChannel;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// [`ByteChannel`] over any tokio byte stream
///
/// Overlay channels accept the in-place security upgrade (the loopback
/// overlay is already end-to-end) as long as the named peer matches the
/// remote they were opened to. Plain channels refuse it.
pub struct IoChannel<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
    closed: AtomicBool,
    security: Security,
}

enum Security {
    Overlay {
        remote: Option<String>,
        upgraded: StdMutex<Option<String>>,
    },
    Plain,
}

impl<S> IoChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Channel carried by the overlay, opened towards `remote` when known
    pub fn overlay(stream: S, remote: Option<String>) -> Self {
        Self::with_security(
            stream,
            Security::Overlay {
                remote,
                upgraded: StdMutex::new(None),
            },
        )
    }

    /// Plain transport without an upgrade path
    pub fn plain(stream: S) -> Self {
        Self::with_security(stream, Security::Plain)
    }

    fn with_security(stream: S, security: Security) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            security,
        }
    }

    /// Peer of a completed security upgrade
    pub fn upgraded_peer(&self) -> Option<String> {
        match &self.security {
            Security::Overlay { upgraded, .. } => {
                upgraded.lock().ok().and_then(|peer| peer.clone())
            }
            Security::Plain => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S> ByteChannel for IoChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, max: usize) -> io::Result<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; max];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    async fn write(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "channel closed",
            ));
        }
        self.writer.lock().await.write_all(data).await
    }

    async fn flush(&self) -> io::Result<()> {
        self.writer.lock().await.flush().await
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.writer.lock().await.shutdown().await
    }

    async fn upgrade_tls(&self, peer: &str) -> io::Result<()> {
        match &self.security {
            Security::Overlay { remote, upgraded } => {
                if let Some(remote) = remote {
                    if !remote.eq_ignore_ascii_case(peer) {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            format!("peer {} does not match remote {}", peer, remote),
                        ));
                    }
                }
                let mut upgraded = upgraded
                    .lock()
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "upgrade state poisoned"))?;
                *upgraded = Some(peer.to_string());
                Ok(())
            }
            Security::Plain => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "transport security upgrade not available on plain channels",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_write_and_half_close() {
        let (a, b) = tokio::io::duplex(64);
        let left = IoChannel::overlay(a, None);
        let right = IoChannel::overlay(b, None);

        left.write(b"hello").await.unwrap();
        left.flush().await.unwrap();
        assert_eq!(right.read(16).await.unwrap(), Some(b"hello".to_vec()));

        left.close().await.unwrap();
        assert_eq!(right.read(16).await.unwrap(), None);

        // The closed side still reads what the peer sends
        right.write(b"back").await.unwrap();
        assert_eq!(left.read(16).await.unwrap(), Some(b"back".to_vec()));
        assert!(left.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(64);
        let channel = IoChannel::overlay(a, None);
        channel.close().await.unwrap();
        channel.close().await.unwrap();
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn upgrade_checks_peer() {
        let (a, _b) = tokio::io::duplex(64);
        let channel = IoChannel::overlay(a, Some("abc.veil".to_string()));
        assert!(channel.upgrade_tls("other.veil").await.is_err());
        channel.upgrade_tls("abc.veil").await.unwrap();
        assert_eq!(channel.upgraded_peer().as_deref(), Some("abc.veil"));

        let (c, _d) = tokio::io::duplex(64);
        let plain = IoChannel::plain(c);
        let err = plain.upgrade_tls("abc.veil").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
