use crate::bind::BindRange;
use rand::rngs::StdRng;
use rand::SeedableRng;
use socket2::{Domain, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpSocket, TcpStream};

/// Keep-alive applied to every outbound connection
const TCP_KEEPALIVE_TIME: Duration = Duration::from_secs(30);

/// Direct TCP dialer with optional non-local source binding.
///
/// When no per-request bind override is given and a default bind range is
/// configured, each dial picks a random source address from the range. The
/// suffix RNG is seeded once from the wall clock at provisioning and
/// guarded by a mutex so concurrent requests can share the dialer.
#[derive(Debug)]
pub struct Dialer {
    timeout: Duration,
    default_bind: Option<BindRange>,
    rng: Mutex<StdRng>,
}

impl Dialer {
    pub fn new(timeout: Duration, default_bind: Option<BindRange>) -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            timeout,
            default_bind,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Dial `addr`, binding to `bind_override` if given, otherwise to a
    /// random address from the configured default range.
    pub async fn dial(&self, addr: SocketAddr, bind_override: Option<IpAddr>) -> io::Result<TcpStream> {
        let source = match bind_override {
            Some(ip) => Some(ip),
            None => self.default_bind.as_ref().map(|range| {
                let mut rng = match self.rng.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                range.source_ip(&mut *rng)
            }),
        };
        self.connect(addr, source).await
    }

    /// Dial without any source binding. The upstream-proxy leg uses this:
    /// source spoofing applies to targets, not to the proxy hop.
    pub async fn dial_direct(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        self.connect(addr, None).await
    }

    async fn connect(&self, addr: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpStream> {
        let socket = new_tcp_socket(addr, source)?;
        match tokio::time::timeout(self.timeout, socket.connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}

fn new_tcp_socket(peer: SocketAddr, source: Option<IpAddr>) -> io::Result<TcpSocket> {
    let socket = Socket::new(Domain::for_address(peer), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    if let Some(ip) = source {
        if peer.is_ipv4() != ip.is_ipv4() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("peer {peer} and bind address {ip} are of different families"),
            ));
        }
        set_free_bind(&socket, ip)?;
        socket.bind(&SocketAddr::new(ip, 0).into())?;
    }
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(TCP_KEEPALIVE_TIME))?;
    Ok(TcpSocket::from_std_stream(std::net::TcpStream::from(socket)))
}

/// Allow binding to addresses not assigned to any local interface.
#[cfg(target_os = "linux")]
fn set_free_bind(socket: &Socket, ip: IpAddr) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let (level, name) = match ip {
        IpAddr::V4(_) => (libc::IPPROTO_IP, libc::IP_FREEBIND),
        IpAddr::V6(_) => (libc::IPPROTO_IPV6, libc::IPV6_FREEBIND),
    };
    let enable: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            std::ptr::addr_of!(enable).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_free_bind(_socket: &Socket, _ip: IpAddr) -> io::Result<()> {
    // No free-bind equivalent wired up; a plain bind still works for
    // locally assigned addresses.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_reaches_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = Dialer::new(Duration::from_secs(5), None);

        let dial = dialer.dial(addr, None);
        let (stream, accepted) = tokio::join!(dial, listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
    }

    #[tokio::test]
    async fn test_dial_with_loopback_bind_override() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = Dialer::new(Duration::from_secs(5), None);

        let dial = dialer.dial(addr, Some("127.0.0.1".parse().unwrap()));
        let (stream, accepted) = tokio::join!(dial, listener.accept());
        let stream = stream.unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), addr.ip());
        drop(accepted);
    }

    #[tokio::test]
    async fn test_dial_family_mismatch_is_an_error() {
        let dialer = Dialer::new(Duration::from_secs(1), None);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = dialer
            .dial(addr, Some("2001:db8::1".parse().unwrap()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_default_bind_range_sets_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // 127.0.0.0/8 sources are bindable on loopback without privileges
        let range = BindRange::parse("127.0.0.0/8").unwrap();
        let dialer = Dialer::new(Duration::from_secs(5), Some(range));

        let dial = dialer.dial(addr, None);
        let (stream, accepted) = tokio::join!(dial, listener.accept());
        let stream = stream.unwrap();
        let source = stream.local_addr().unwrap().ip();
        match source {
            IpAddr::V4(v4) => assert_eq!(v4.octets()[0], 127),
            IpAddr::V6(_) => panic!("expected a v4 source address"),
        }
        drop(accepted);
    }

    #[tokio::test]
    async fn test_dial_timeout_fires() {
        // 203.0.113.0/24 is TEST-NET-3; connects black-hole in practice,
        // so the timeout path is what completes first.
        let dialer = Dialer::new(Duration::from_millis(50), None);
        let addr: SocketAddr = "203.0.113.1:9".parse().unwrap();
        let start = std::time::Instant::now();
        assert!(dialer.dial(addr, None).await.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
