//! Framed TCP read/write and bind helper functions.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::FamstoreError;

use serde::de::DeserializeOwned;
use serde::Serialize;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};

/// Largest frame body accepted from the wire.
pub(crate) const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Reads an object of type `T` from readable connection `conn_read`. The
/// frame is an 8-byte big-endian length header followed by the MessagePack
/// encoded object. Returns:
///   - `Ok(Some(obj))` if successful
///   - `Ok(None)` if the peer closed the connection cleanly before a header
///   - `Err(err)` if any unexpected error occurs
pub(crate) async fn read_frame<T, Conn>(
    conn_read: &mut Conn,
) -> Result<Option<T>, FamstoreError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    let mut header = [0u8; 8];
    let mut filled = 0;
    while filled < header.len() {
        let n = conn_read.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FamstoreError::msg("connection closed mid-header"));
        }
        filled += n;
    }

    let obj_len = u64::from_be_bytes(header);
    if obj_len > MAX_FRAME_LEN {
        return Err(FamstoreError(format!(
            "frame length {} exceeds limit {}",
            obj_len, MAX_FRAME_LEN
        )));
    }

    let mut obj_buf: Vec<u8> = vec![0; obj_len as usize];
    conn_read.read_exact(&mut obj_buf[..]).await?;
    Ok(Some(decode_from_slice(&obj_buf)?))
}

/// Writes an object of type `T` to writable connection `conn_write` using
/// the same framing as `read_frame()`.
pub(crate) async fn write_frame<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), FamstoreError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?; // send length first
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Creates a listener on exactly `bind_addr`, with address reuse enabled so
/// that a restarted node can take its port back promptly.
pub async fn tcp_bind(bind_addr: SocketAddr) -> Result<TcpListener, FamstoreError> {
    let socket = if bind_addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    socket.bind(bind_addr)?;
    Ok(socket.listen(1024)?)
}

/// Binds the first free port among `[base.port(), base.port() + tries)` on
/// the IP of `base`. Returns the listener together with the port it got.
pub async fn tcp_bind_first_free(
    base: SocketAddr,
    tries: u16,
) -> Result<(TcpListener, u16), FamstoreError> {
    for offset in 0..tries {
        let Some(port) = base.port().checked_add(offset) else {
            break;
        };
        let addr = SocketAddr::new(base.ip(), port);
        if let Ok(listener) = tcp_bind(addr).await {
            return Ok((listener, port));
        }
    }

    Err(FamstoreError(format!(
        "no free port in [{}, {}) on {}",
        base.port(),
        base.port().saturating_add(tries),
        base.ip()
    )))
}
