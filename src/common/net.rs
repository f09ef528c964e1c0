//! Network utilities: socket tuning and the Shadowsocks SOCKS-style address header.

use crate::Result;
use socket2::SockRef;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::buffer;

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let _ = sock.set_reuse_port(true);
}

/// Best-effort TCP_FASTOPEN_CONNECT toggle for the upstream dial (Linux only;
/// silently ignored on platforms without the socket option). Must be called
/// before the socket connects.
#[cfg(target_os = "linux")]
pub fn enable_tcp_fastopen_connect<S: std::os::unix::io::AsRawFd>(socket: &S) {
    let fd = socket.as_raw_fd();
    let val: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN_CONNECT,
            &val as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn enable_tcp_fastopen_connect<S>(_socket: &S) {}

/// Shadowsocks address type byte values (SOCKS5-derived).
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Length in bytes of the SOCKS-style address header at the start of `data`,
/// if `data` begins with a well-formed one. Used to locate where the
/// address ends and the UDP/TCP payload begins, without allocating or
/// actually decoding the address.
///
/// Layout: `[atyp(1) | addr | port(2)]`:
/// - `0x01` IPv4: `1 + 4 + 2`
/// - `0x03` domain: `1 + 1 + domain_len + 2`
/// - `0x04` IPv6: `1 + 16 + 2`
pub fn socks_addr_len(data: &[u8]) -> Option<usize> {
    if data.is_empty() {
        return None;
    }
    let total = match data[0] {
        ATYP_IPV4 => 1 + 4 + 2,
        ATYP_IPV6 => 1 + 16 + 2,
        ATYP_DOMAIN => {
            let domain_len = *data.get(1)? as usize;
            1 + 1 + domain_len + 2
        }
        _ => return None,
    };
    if total <= data.len() {
        Some(total)
    } else {
        None
    }
}

/// Copy data between two streams bidirectionally, half-closing each
/// direction on EOF. Used for the TCP splice (spec §4.5 step 9).
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    buffer::greedy_copy_bidirectional(a, b).await
}
