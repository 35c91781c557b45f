/// Bridge between one local connection and one overlay stream
///
/// While the outbound stream is opening, bytes from the local side are
/// buffered (up to a cap; above it reading pauses). Once the stream is open
/// the buffer is flushed in arrival order and both directions are piped.
/// The first end or error from either direction starts a short grace period
/// in which the other direction may finish, then both endpoints are torn
/// down exactly once.

use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use veilport_common::config::proxy::MAX_PREBUFFER_BYTES;
use veilport_common::config::stream::READ_CHUNK_SIZE;
use veilport_core::{OverlayError, OverlayStream};

/// Endpoint that produced the first termination signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cause {
    End,
    Error(String),
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub first: Side,
    pub cause: Cause,
}

pub struct BridgeSession<L = TcpStream> {
    local: Option<L>,
    remote: Option<OverlayStream>,
    prebuffer: Vec<u8>,
    local_ended: bool,
    grace: Duration,
    destroyed: bool,
}

impl<L> BridgeSession<L>
where
    L: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Buffer local bytes until `connect` resolves
    ///
    /// A failed connect destroys the local endpoint.
    pub async fn open<F>(mut local: L, connect: F, grace: Duration) -> Result<Self, OverlayError>
    where
        F: Future<Output = Result<OverlayStream, OverlayError>>,
    {
        let mut prebuffer = Vec::new();
        let mut local_ended = false;
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        tokio::pin!(connect);

        let connected = loop {
            let can_read = !local_ended && prebuffer.len() < MAX_PREBUFFER_BYTES;
            tokio::select! {
                biased;
                result = &mut connect => break result,
                read = local.read(&mut chunk), if can_read => match read {
                    Ok(0) => local_ended = true,
                    Ok(n) => prebuffer.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(error = %e, "local read failed while connecting");
                        local_ended = true;
                    }
                },
            }
        };

        match connected {
            Ok(remote) => Ok(Self {
                local: Some(local),
                remote: Some(remote),
                prebuffer,
                local_ended,
                grace,
                destroyed: false,
            }),
            Err(e) => {
                drop(local);
                Err(e)
            }
        }
    }

    /// Bytes received from the local side before the stream opened
    pub fn prebuffered(&self) -> usize {
        self.prebuffer.len()
    }

    /// Pipe both directions until termination, then tear down
    pub async fn run(mut self) -> Termination {
        let termination = self.pipe().await;
        self.destroy();
        termination
    }

    async fn pipe(&mut self) -> Termination {
        let (Some(local), Some(remote)) = (self.local.as_mut(), self.remote.as_mut()) else {
            return Termination {
                first: Side::Local,
                cause: Cause::End,
            };
        };

        if !self.prebuffer.is_empty() {
            let buffered = std::mem::take(&mut self.prebuffer);
            if let Err(e) = remote.write_all(&buffered).await {
                return Termination {
                    first: Side::Remote,
                    cause: Cause::Error(e.to_string()),
                };
            }
        }

        let (local_reader, local_writer) = tokio::io::split(local);
        let (remote_reader, remote_writer) = tokio::io::split(remote);

        let local_ended = self.local_ended;
        let upstream = async move {
            if local_ended {
                let mut remote_writer = remote_writer;
                let _ = remote_writer.shutdown().await;
                return Cause::End;
            }
            pump(local_reader, remote_writer).await
        };
        let downstream = pump(remote_reader, local_writer);
        tokio::pin!(upstream, downstream);

        let (first, cause) = tokio::select! {
            cause = &mut upstream => (Side::Local, cause),
            cause = &mut downstream => (Side::Remote, cause),
        };
        debug!(?first, ?cause, "bridge terminating");

        // The other direction keeps flushing for the grace period
        let other = async {
            match first {
                Side::Local => {
                    downstream.await;
                }
                Side::Remote => {
                    upstream.await;
                }
            }
        };
        let _ = tokio::time::timeout(self.grace, other).await;

        Termination { first, cause }
    }

    /// Release both endpoints; returns false when already destroyed
    pub fn destroy(&mut self) -> bool {
        if self.destroyed {
            return false;
        }
        self.destroyed = true;
        self.local.take();
        self.remote.take();
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// Copy `reader` into `writer`, ending the write side on end of input
async fn pump<R, W>(mut reader: R, mut writer: W) -> Cause
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(_) => {
            let _ = writer.shutdown().await;
            Cause::End
        }
        Err(e) => Cause::Error(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veilport_core::IoChannel;

    fn overlay_pair() -> (OverlayStream, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (OverlayStream::new(Arc::new(IoChannel::overlay(near, None))), far)
    }

    #[tokio::test]
    async fn prebuffer_is_flushed_in_order() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut far) = overlay_pair();

        let connect = async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(remote)
        };
        let writer = tokio::spawn(async move {
            client.write_all(b"first ").await.unwrap();
            client.write_all(b"second").await.unwrap();
            client
        });

        let session = BridgeSession::open(local, connect, Duration::from_millis(100))
            .await
            .unwrap();
        let mut client = writer.await.unwrap();
        assert_eq!(session.prebuffered(), 12);

        let running = tokio::spawn(session.run());
        client.write_all(b" third").await.unwrap();

        let mut received = vec![0u8; 18];
        far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, b"first second third");

        far.write_all(b"reply").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        drop(far);
        let termination = running.await.unwrap();
        assert_eq!(termination.first, Side::Remote);
    }

    #[tokio::test]
    async fn local_end_during_connect_is_remembered() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut far) = overlay_pair();

        client.write_all(b"bye").await.unwrap();
        client.shutdown().await.unwrap();

        let connect = async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(remote)
        };
        let session = BridgeSession::open(local, connect, Duration::from_millis(50))
            .await
            .unwrap();
        let termination = session.run().await;
        assert_eq!(termination.first, Side::Local);
        assert_eq!(termination.cause, Cause::End);

        let mut received = Vec::new();
        far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");
    }

    #[tokio::test]
    async fn failed_connect_destroys_local() {
        let (mut client, local) = tokio::io::duplex(4096);
        let connect = async { Err(OverlayError::ExitNotAllowed("example.com".to_string())) };

        let result = BridgeSession::open(local, connect, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(OverlayError::ExitNotAllowed(_))));

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let (_client, local) = tokio::io::duplex(64);
        let (remote, _far) = overlay_pair();
        let mut session = BridgeSession::open(local, async { Ok(remote) }, Duration::ZERO)
            .await
            .unwrap();

        assert!(session.destroy());
        assert!(!session.destroy());
        assert!(session.is_destroyed());

        // Piping after teardown is a no-op
        let termination = session.run().await;
        assert_eq!(termination.cause, Cause::End);
    }

    #[tokio::test]
    async fn grace_period_lets_other_direction_finish() {
        let (mut client, local) = tokio::io::duplex(4096);
        let (remote, mut far) = overlay_pair();
        let session = BridgeSession::open(local, async { Ok(remote) }, Duration::from_millis(200))
            .await
            .unwrap();
        let running = tokio::spawn(session.run());

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = vec![0u8; 7];
        far.read_exact(&mut request).await.unwrap();
        far.write_all(b"late response").await.unwrap();

        let mut response = vec![0u8; 13];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response, b"late response");
        assert_eq!(running.await.unwrap().first, Side::Local);
    }
}
