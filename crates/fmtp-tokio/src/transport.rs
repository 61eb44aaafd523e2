//! Framed send and receive over a byte stream, bounded by deadlines.
//!
//! Dropping an in-flight write stops it for good, so a frame is delivered
//! at most once. When the deadline cuts a frame in half the stream is
//! desynchronized and the caller gets [`Error::SendInterrupted`].

use std::io;

use fmtp_core::{Error, FmtpPacket, HEADER_LEN, Header};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    time::{Instant, timeout_at},
};
use tracing::{trace, warn};

use crate::Message;

/// Write attempts per frame before giving up.
pub const SEND_ATTEMPTS: usize = 3;

/// Sends `msg` as a single frame, returns the number of bytes written.
///
/// # Errors
///
/// [`Error::DeadlineExceeded`] if nothing was written before `deadline`,
/// [`Error::SendInterrupted`] if part of the frame was. [`Error::SendFailed`]
/// on a non transient error or after [`SEND_ATTEMPTS`] transient ones.
pub async fn send<W>(writer: &mut W, msg: Message, deadline: Instant) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    let packet = timeout_at(deadline, msg.into_packet())
        .await
        .map_err(|_| Error::DeadlineExceeded)??;
    send_packet(writer, packet, deadline).await
}

/// Sends an already framed packet, see [`send`].
///
/// # Errors
///
/// As [`send`].
pub async fn send_packet<W>(
    writer: &mut W,
    packet: FmtpPacket,
    deadline: Instant,
) -> Result<usize, Error>
where
    W: AsyncWrite + Unpin,
{
    trace!("transmitting packet: {packet}");
    let bytes = packet.into_bytes();
    let total = bytes.len();
    let mut written = 0;

    let outcome = timeout_at(deadline, write_with_retry(writer, &bytes, &mut written)).await;
    match outcome {
        Ok(result) => result.map(|()| total),
        Err(_) if written == 0 => Err(Error::DeadlineExceeded),
        Err(_) => Err(Error::SendInterrupted { written, total }),
    }
}

async fn write_with_retry<W>(writer: &mut W, bytes: &[u8], written: &mut usize) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut attempts = 1;
    loop {
        match write_remaining(writer, bytes, written).await {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempts < SEND_ATTEMPTS => {
                warn!("transient write error, attempt {attempts}/{SEND_ATTEMPTS}: {e}");
                attempts += 1;
            }
            Err(source) => return Err(Error::SendFailed { attempts, source }),
        }
    }
}

// resumes at `written` so a retry never duplicates bytes
async fn write_remaining<W>(writer: &mut W, bytes: &[u8], written: &mut usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(rest) = bytes.get(*written..).filter(|rest| !rest.is_empty()) {
        let n = writer.write(rest).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        *written += n;
    }
    writer.flush().await
}

/// Errors worth another write attempt.
#[must_use]
pub fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Reads exactly one frame before `deadline`.
///
/// # Errors
///
/// [`Error::DeadlineExceeded`], [`Error::ConnectionClosed`] on a clean end of
/// stream and the framing errors of [`read_packet`].
pub async fn receive<R>(reader: &mut R, deadline: Instant) -> Result<FmtpPacket, Error>
where
    R: AsyncRead + Unpin,
{
    timeout_at(deadline, read_packet(reader))
        .await
        .map_err(|_| Error::DeadlineExceeded)??
        .ok_or(Error::ConnectionClosed)
}

/// Reads one frame, `None` if the stream ended before its first byte.
///
/// # Errors
///
/// [`Error::UnexpectedEof`] inside the header, [`Error::TruncatedBody`]
/// inside the body, [`Error::MalformedHeader`] and I/O errors.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<FmtpPacket>, Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0; HEADER_LEN];
    match read_full(reader, &mut header).await? {
        0 => return Ok(None),
        HEADER_LEN => (),
        got => return Err(Error::UnexpectedEof { got }),
    }
    let header = Header::decode(&header)?;

    let mut body = vec![0; header.body_len()];
    let got = read_full(reader, &mut body).await?;
    if got < body.len() {
        return Err(Error::TruncatedBody {
            expected: body.len(),
            got,
        });
    }
    FmtpPacket::from_parts(header, body).map(Some)
}

// fills `buf` unless the stream ends first, returns the bytes read
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::{
        pin::Pin,
        task::{Context, Poll},
        time::Duration,
    };

    use fmtp_core::{FmtpType, SystemSignal};
    use tokio::io::duplex;

    use super::*;

    /// Fails the first `failures` writes with `kind`, then accepts at most
    /// `chunk` bytes per write. Once `stall_after` bytes are accepted every
    /// further write stays pending.
    struct FakeWriter {
        failures: usize,
        kind: io::ErrorKind,
        chunk: usize,
        stall_after: Option<usize>,
        calls: usize,
        out: Vec<u8>,
    }

    impl FakeWriter {
        fn new() -> Self {
            Self {
                failures: 0,
                kind: io::ErrorKind::Interrupted,
                chunk: usize::MAX,
                stall_after: None,
                calls: 0,
                out: Vec::new(),
            }
        }
    }

    impl AsyncWrite for FakeWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.calls += 1;
            if self.failures > 0 {
                self.failures -= 1;
                return Poll::Ready(Err(self.kind.into()));
            }
            if self.stall_after.is_some_and(|limit| self.out.len() >= limit) {
                return Poll::Pending;
            }
            let n = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn retries_transient_errors() {
        let mut writer = FakeWriter::new();
        writer.failures = 2;
        writer.chunk = 3;
        let written = send(&mut writer, Message::operator("hello"), deadline())
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(writer.out, b"\x02\x00\x00\x0a\x02hello");
    }

    #[tokio::test]
    async fn retry_bound() {
        let mut writer = FakeWriter::new();
        writer.failures = usize::MAX;
        let result = send(&mut writer, Message::operator("hello"), deadline()).await;
        assert!(matches!(
            result,
            Err(Error::SendFailed { attempts: 3, .. })
        ));
        assert_eq!(writer.calls, SEND_ATTEMPTS);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let mut writer = FakeWriter::new();
        writer.failures = 1;
        writer.kind = io::ErrorKind::BrokenPipe;
        let result = send(&mut writer, Message::operator("x"), deadline()).await;
        assert!(matches!(
            result,
            Err(Error::SendFailed { attempts: 1, .. })
        ));
        assert_eq!(writer.calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_first_byte() {
        let mut writer = FakeWriter::new();
        writer.stall_after = Some(0);
        let result = send(&mut writer, Message::operator("x"), deadline()).await;
        assert!(matches!(result, Err(Error::DeadlineExceeded)));
        assert!(!result.unwrap_err().is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_inside_frame() {
        let mut writer = FakeWriter::new();
        writer.chunk = 4;
        writer.stall_after = Some(4);
        let result = send(&mut writer, Message::operator("hello"), deadline()).await;
        assert!(matches!(
            result,
            Err(Error::SendInterrupted {
                written: 4,
                total: 10
            })
        ));
    }

    #[tokio::test]
    async fn reads_frames_in_order() {
        let (mut a, mut b) = duplex(64);
        send_packet(&mut a, FmtpPacket::system(SystemSignal::Startup), deadline())
            .await
            .unwrap();
        send(&mut a, Message::operational("FPL"), deadline())
            .await
            .unwrap();
        drop(a);

        let first = receive(&mut b, deadline()).await.unwrap();
        assert_eq!(first.typ(), Some(FmtpType::System));
        let second = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(second.data(), b"FPL");
        assert!(read_packet(&mut b).await.unwrap().is_none());
        assert!(matches!(
            receive(&mut b, deadline()).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn short_reads_are_framing_errors() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[2, 0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(
            read_packet(&mut b).await,
            Err(Error::UnexpectedEof { got: 3 })
        ));

        let (mut a, mut b) = duplex(64);
        a.write_all(&[2, 0, 0, 10, 1, b'a']).await.unwrap();
        drop(a);
        let err = read_packet(&mut b).await.unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedBody {
                expected: 5,
                got: 1
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn receive_deadline() {
        let (_a, mut b) = duplex(64);
        assert!(matches!(
            receive(&mut b, deadline()).await,
            Err(Error::DeadlineExceeded)
        ));
    }
}
