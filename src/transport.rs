//! Framed byte-stream transport.
//!
//! Every logical message travels as one frame: a 4-byte little-endian length
//! followed by that many payload bytes. Payloads are codec-encoded values
//! (command messages, statuses, events). Frames never interleave on one
//! connection: writers are owned by a single task or guarded by a mutex.

use crate::codec::{BufferSerializer, Decode, Encode};
use crate::connection::ConnectionInfo;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::protocol::{self, Identification};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Payload buffers grow by at most this much per read, so memory follows the
/// bytes actually received rather than the announced length.
const READ_CHUNK: usize = 64 * 1024;

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> AppResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(DaqError::Transport(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }
    let len = crate::codec::length_prefix(payload.len())?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> AppResult<Option<Bytes>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            return if filled == 0 {
                Ok(None)
            } else {
                Err(DaqError::ConnectionClosed)
            };
        }
        filled += n;
    }
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(DaqError::Protocol(format!(
            "frame length {len} exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut payload = BytesMut::with_capacity(len.min(READ_CHUNK));
    while payload.len() < len {
        let want = (len - payload.len()).min(READ_CHUNK);
        payload.reserve(want);
        let n = (&mut *reader).take(want as u64).read_buf(&mut payload).await?;
        if n == 0 {
            return Err(DaqError::ConnectionClosed);
        }
    }
    Ok(Some(payload.freeze()))
}

/// Reading half of a framed connection.
#[derive(Debug)]
pub struct FrameReader {
    inner: OwnedReadHalf,
    remote: SocketAddr,
}

impl FrameReader {
    /// Remote address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Next raw frame, `None` on clean close.
    pub async fn recv_frame(&mut self) -> AppResult<Option<Bytes>> {
        read_frame(&mut self.inner).await
    }

    /// Next frame decoded as `T`, `None` on clean close.
    ///
    /// A frame that fails to decode is consumed; the error is returned and the
    /// stream stays usable.
    pub async fn recv<T: Decode>(&mut self) -> AppResult<Option<T>> {
        match self.recv_frame().await? {
            Some(frame) => BufferSerializer::decode_value(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Like [`recv`](Self::recv) but a clean close is an error.
    pub async fn expect<T: Decode>(&mut self) -> AppResult<T> {
        self.recv().await?.ok_or(DaqError::ConnectionClosed)
    }
}

/// Writing half of a framed connection.
#[derive(Debug)]
pub struct FrameWriter {
    inner: OwnedWriteHalf,
    remote: SocketAddr,
}

impl FrameWriter {
    /// Remote address.
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Send one raw frame.
    pub async fn send_frame(&mut self, payload: &[u8]) -> AppResult<()> {
        write_frame(&mut self.inner, payload).await
    }

    /// Encode `value` and send it as one frame.
    pub async fn send<T: Encode + ?Sized>(&mut self, value: &T) -> AppResult<()> {
        let buf = BufferSerializer::encode_value(value)?;
        self.send_frame(&buf.into_bytes()).await
    }

    /// Close the write direction.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Split a connected stream into framed halves.
pub fn split(stream: TcpStream) -> AppResult<(FrameReader, FrameWriter)> {
    let remote = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((
        FrameReader { inner: read, remote },
        FrameWriter {
            inner: write,
            remote,
        },
    ))
}

/// Connect to `addr`, accepting an optional `tcp://` scheme prefix.
pub async fn connect(addr: &str) -> AppResult<(FrameReader, FrameWriter)> {
    let target = strip_scheme(addr);
    let stream = TcpStream::connect(target)
        .await
        .map_err(|err| DaqError::Transport(format!("cannot connect to {addr}: {err}")))?;
    split(stream)
}

/// `tcp://host:port` to `host:port`.
pub fn strip_scheme(addr: &str) -> &str {
    addr.split_once("://").map_or(addr, |(_, rest)| rest)
}

/// Client side of the admission handshake.
///
/// Waits for the greeting, identifies as `info` and waits for the confirmation.
pub async fn client_handshake(
    reader: &mut FrameReader,
    writer: &mut FrameWriter,
    info: &ConnectionInfo,
    timeout: Duration,
) -> AppResult<()> {
    let remote = reader.remote();
    let exchange = async {
        let greeting: String = reader.expect().await?;
        if !protocol::is_ok(&greeting) {
            return Err(DaqError::Protocol(format!("connection refused: {greeting}")));
        }
        writer.send(&Identification::from(info)).await?;
        let confirm: String = reader.expect().await?;
        if !protocol::is_ok(&confirm) {
            return Err(DaqError::Protocol(format!("identification rejected: {confirm}")));
        }
        Ok(())
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| DaqError::Timeout(format!("handshake with {remote}")))?
}

/// Producer-side connection to a data collector.
#[derive(Debug)]
pub struct DataSender {
    writer: FrameWriter,
    // Held so the collector sees a half-open connection only on drop.
    _reader: FrameReader,
    address: String,
    events_sent: u64,
}

impl DataSender {
    /// Connect to the data address and identify.
    pub async fn connect(addr: &str, info: &ConnectionInfo, timeout: Duration) -> AppResult<Self> {
        let (mut reader, mut writer) = connect(addr).await?;
        client_handshake(&mut reader, &mut writer, info, timeout).await?;
        tracing::info!(address = addr, identity = %info, "data connection established");
        Ok(Self {
            writer,
            _reader: reader,
            address: addr.to_string(),
            events_sent: 0,
        })
    }

    /// Send one event as one frame.
    pub async fn send_event(&mut self, event: &Event) -> AppResult<()> {
        self.writer.send(event).await?;
        self.events_sent += 1;
        Ok(())
    }

    /// Address this sender is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Events sent so far.
    pub fn events_sent(&self) -> u64 {
        self.events_sent
    }

    /// Close the connection.
    pub async fn close(mut self) -> AppResult<()> {
        self.writer.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LifecycleState, Severity, Status};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let payload = vec![7u8; 1000];
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &sent).await.unwrap();
            write_frame(&mut a, b"").await.unwrap();
        });
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().as_ref(), &payload[..]);
        assert!(read_frame(&mut b).await.unwrap().unwrap().is_empty());
        writer.await.unwrap();
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_a_closed_connection() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(DaqError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn announced_length_is_not_allocated_up_front() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(&(200u32 * 1024 * 1024).to_le_bytes()).await.unwrap();
        a.write_all(&[9; 100]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(DaqError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn frames_larger_than_one_read_chunk() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let payload: Vec<u8> = (0..3 * READ_CHUNK + 17).map(|i| i as u8).collect();
        let sent = payload.clone();
        let writer = tokio::spawn(async move {
            write_frame(&mut a, &sent).await.unwrap();
            write_frame(&mut a, b"next").await.unwrap();
        });
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().as_ref(), &payload[..]);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap().as_ref(), b"next");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(DaqError::Protocol(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn typed_values_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut reader, _writer) = split(stream).unwrap();
            reader.expect::<Status>().await.unwrap()
        });
        let (_reader, mut writer) = connect(&format!("tcp://{addr}")).await.unwrap();
        let status = Status::new(Severity::Info, LifecycleState::Conf, "ready").with_tag("RUN", 3);
        writer.send(&status).await.unwrap();
        assert_eq!(server.await.unwrap(), status);
    }

    #[test]
    fn scheme_is_optional() {
        assert_eq!(strip_scheme("tcp://10.0.0.1:44001"), "10.0.0.1:44001");
        assert_eq!(strip_scheme("localhost:1"), "localhost:1");
    }
}
