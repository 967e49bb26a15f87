//! Length-prefixed MessagePack framing over TCP, and retrying bind/connect.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::CbtxError;

/// Size of the big-endian length header in front of every frame.
const HEADER_LEN: usize = 8;

/// Largest frame body accepted from the wire. Headers announcing more are
/// rejected before any buffer space is reserved.
const MAX_FRAME_LEN: u64 = 1 << 20;

/// Reads from `conn` into `buf` until it holds at least `want` bytes. A clean
/// EOF before that is an error.
async fn fill_to<Conn>(
    buf: &mut BytesMut,
    conn: &mut Conn,
    want: usize,
) -> Result<(), CbtxError>
where
    Conn: AsyncRead + Unpin,
{
    buf.reserve(want.saturating_sub(buf.len()));
    while buf.len() < want {
        if conn.read_buf(buf).await? == 0 {
            return Err(CbtxError::msg("connection closed by peer"));
        }
    }
    Ok(())
}

/// Receives one frame from `conn` and decodes it as a `T`. Each frame is a
/// `u64` big-endian length followed by that many bytes of MessagePack.
///
/// CANCELLATION SAFETY: `buf` is only consumed once a whole frame has been
/// decoded. Bytes read before a cancelled `.await` stay in `buf` and the
/// next call picks up from there, so this may be a `tokio::select!` branch
/// as long as the same `buf` is passed every time.
pub(crate) async fn safe_tcp_read<T, Conn>(
    buf: &mut BytesMut,
    conn: &mut Conn,
) -> Result<T, CbtxError>
where
    T: DeserializeOwned,
    Conn: AsyncRead + Unpin,
{
    fill_to(buf, conn, HEADER_LEN).await?;
    let body_len = (&buf[..HEADER_LEN]).get_u64();
    if body_len > MAX_FRAME_LEN {
        return logged_err!(
            "frame length {} too large, max {}",
            body_len,
            MAX_FRAME_LEN
        );
    }
    let frame_len = HEADER_LEN + body_len as usize;

    fill_to(buf, conn, frame_len).await?;
    let obj = rmp_serde::decode::from_slice(&buf[HEADER_LEN..frame_len])?;
    buf.advance(frame_len);
    Ok(obj)
}

/// Sends `obj` as one frame over `conn`. Not cancellation safe: a cancelled
/// call may leave a partial frame on the wire, so callers drop the
/// connection after any failure.
pub(crate) async fn safe_tcp_write_all<T, Conn>(
    conn: &mut Conn,
    obj: &T,
) -> Result<(), CbtxError>
where
    T: Serialize,
    Conn: AsyncWrite + Unpin,
{
    let body = rmp_serde::encode::to_vec(obj)?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len());
    frame.put_u64(body.len() as u64);
    frame.put_slice(&body);
    conn.write_all(&frame).await?;
    Ok(())
}

/// Runs `attempt` until it succeeds, at most `retries + 1` times, sleeping
/// `interval` in between. Returns the last error if all attempts fail.
async fn with_retry<T, F, Fut>(
    what: &str,
    retries: u8,
    interval: Duration,
    mut attempt: F,
) -> Result<T, CbtxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut tried = 0;
    loop {
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if tried >= retries => {
                let tries = u32::from(tried) + 1;
                return logged_err!("{} failed after {} tries: {}", what, tries, e);
            }
            Err(e) => {
                pf_debug!("{} failed, retrying: {}", what, e);
                tried += 1;
                time::sleep(interval).await;
            }
        }
    }
}

/// Binds a listening socket on `bind_addr`, retrying upon failure (e.g.,
/// the address still held by a previous incarnation).
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    retries: u8,
    interval: Duration,
) -> Result<TcpListener, CbtxError> {
    with_retry("bind", retries, interval, || async move {
        let socket = match bind_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(bind_addr)?;
        socket.listen(1024)
    })
    .await
}

/// Connects to `conn_addr` with Nagle disabled, retrying upon failure (e.g.,
/// the remote end not listening yet).
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    retries: u8,
    interval: Duration,
) -> Result<TcpStream, CbtxError> {
    with_retry("connect", retries, interval, || async move {
        let stream = TcpStream::connect(conn_addr).await?;
        stream.set_nodelay(true)?;
        Ok::<_, io::Error>(stream)
    })
    .await
}
