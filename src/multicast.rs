//! UDP multicast plumbing shared by every role.  A sending socket needs no group membership, just
//! a TTL that clears the local segment.  A receiving socket sets SO_REUSEADDR so that several
//! roles on one host can share the group port, binds the port, and joins the group on every local
//! interface.  Short receive timeouts turn each role's receive loop into a poll that interleaves
//! with its timers.
//!
//! std::net::UdpSocket cannot express SO_REUSEADDR-before-bind or buffer sizing, so those two go
//! through libc on the raw fd.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use indicio::clue;

use crate::{Error, COLLECTOR};

///////////////////////////////////////////// constants ////////////////////////////////////////////

/// Receive timeout that turns a blocking receive into a poll.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(20);

/// Upper bound on a received datagram.  Protocol messages stay under 1KB; the slack is free.
pub const DATAGRAM_MAX: usize = 1 << 16;

/// Requested socket buffer size.  The kernel clamps this to its configured maximum, which is the
/// behavior we want: as much buffering as the host will give us.
pub const SOCKET_BUFFER: usize = 1 << 30;

const MULTICAST_TTL: u32 = 2;

//////////////////////////////////////////// biometrics ////////////////////////////////////////////

static MESSAGES_SENT: biometrics::Counter = biometrics::Counter::new("synod.multicast.sent");
static MESSAGES_RECV: biometrics::Counter = biometrics::Counter::new("synod.multicast.recv");
static SEND_ERRORS: biometrics::Counter = biometrics::Counter::new("synod.multicast.send_errors");
static RECV_ERRORS: biometrics::Counter = biometrics::Counter::new("synod.multicast.recv_errors");
static RECV_NOT_UTF8: biometrics::Counter = biometrics::Counter::new("synod.multicast.not_utf8");
static BUFFER_DENIED: biometrics::Counter =
    biometrics::Counter::new("synod.multicast.buffer_denied");

/// Registers this module's biometrics with the provided Collector.
pub fn register_biometrics(collector: &biometrics::Collector) {
    collector.register_counter(&MESSAGES_SENT);
    collector.register_counter(&MESSAGES_RECV);
    collector.register_counter(&SEND_ERRORS);
    collector.register_counter(&RECV_ERRORS);
    collector.register_counter(&RECV_NOT_UTF8);
    collector.register_counter(&BUFFER_DENIED);
}

////////////////////////////////////////////// sockets /////////////////////////////////////////////

/// A socket suitable for sending to any group.  Unbound port, no membership.
pub fn sender() -> Result<UdpSocket, Error> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    request_buffers(&socket);
    Ok(socket)
}

/// A socket bound to the group's port and joined to the group, suitable for both receiving from
/// and sending to any group.
pub fn receiver(group: SocketAddrV4) -> Result<UdpSocket, Error> {
    let fd: RawFd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, libc::IPPROTO_UDP) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let socket = unsafe { UdpSocket::from_raw_fd(fd) };
    set_socket_option(&socket, libc::SO_REUSEADDR, 1)?;
    bind_any(&socket, group.port())?;
    socket.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_ttl_v4(MULTICAST_TTL)?;
    socket.set_read_timeout(Some(RECV_TIMEOUT))?;
    request_buffers(&socket);
    Ok(socket)
}

/// Shrink or grow the receive buffer after construction.  Best effort, like [request_buffers].
pub fn request_recv_buffer(socket: &UdpSocket, bytes: usize) {
    if set_socket_option(socket, libc::SO_RCVBUF, bytes as libc::c_int).is_err() {
        BUFFER_DENIED.click();
    }
}

fn request_buffers(socket: &UdpSocket) {
    for option in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
        if set_socket_option(socket, option, SOCKET_BUFFER as libc::c_int).is_err() {
            BUFFER_DENIED.click();
        }
    }
}

fn set_socket_option(
    socket: &UdpSocket,
    option: libc::c_int,
    value: libc::c_int,
) -> Result<(), Error> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        Err(std::io::Error::last_os_error().into())
    } else {
        Ok(())
    }
}

fn bind_any(socket: &UdpSocket, port: u16) -> Result<(), Error> {
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(Ipv4Addr::UNSPECIFIED).to_be(),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        Err(std::io::Error::last_os_error().into())
    } else {
        Ok(())
    }
}

//////////////////////////////////////////// datagrams /////////////////////////////////////////////

/// Send one message to one group.  Send failures are logged and counted, never propagated; the
/// protocol tolerates loss and the proposer's round timeouts re-drive anything that mattered.
pub fn send(socket: &UdpSocket, group: SocketAddrV4, message: &str) {
    match socket.send_to(message.as_bytes(), group) {
        Ok(_) => {
            MESSAGES_SENT.click();
        }
        Err(err) => {
            SEND_ERRORS.click();
            clue!(COLLECTOR, indicio::ERROR, {
                send_error: err.to_string(),
                group: group.to_string(),
            });
        }
    }
}

/// Receive one datagram, if one is waiting.  Returns None on timeout (the timer path), on
/// non-UTF-8 garbage, and on transient errors; only the latter two are logged.
pub fn recv(socket: &UdpSocket, buf: &mut [u8]) -> Option<String> {
    match socket.recv_from(buf) {
        Ok((amt, _)) => {
            MESSAGES_RECV.click();
            match std::str::from_utf8(&buf[..amt]) {
                Ok(text) => Some(text.trim().to_string()),
                Err(_) => {
                    RECV_NOT_UTF8.click();
                    clue!(COLLECTOR, indicio::WARNING, {
                        not_utf8: amt,
                    });
                    None
                }
            }
        }
        Err(err)
            if err.kind() == std::io::ErrorKind::WouldBlock
                || err.kind() == std::io::ErrorKind::TimedOut =>
        {
            None
        }
        Err(err) => {
            RECV_ERRORS.click();
            clue!(COLLECTOR, indicio::ERROR, {
                recv_error: err.to_string(),
            });
            None
        }
    }
}
