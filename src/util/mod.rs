//! Small helpers shared across the crate.

use std::net::SocketAddr;
use std::time::Duration;

use crate::types::LinkKind;

/// Guess the kind of a link from its interface name.
///
/// This follows common Linux naming conventions and is only a hint;
/// callers can override the kind through configuration.
pub fn guess_link_kind(name: &str) -> LinkKind {
    let name = name.to_lowercase();

    if name.starts_with("eth")
        || name.starts_with("enp")
        || name.starts_with("eno")
        || name.starts_with("ens")
        || name.starts_with("en")
    {
        LinkKind::Wired
    } else if name.starts_with("wlan") || name.starts_with("wlp") || name.starts_with("wl") {
        LinkKind::Wireless
    } else if name.starts_with("wwan")
        || name.starts_with("wwp")
        || name.starts_with("rmnet")
        || name.starts_with("cell")
        || name.starts_with("pdp")
        || name.starts_with("usb")
    {
        LinkKind::Cellular
    } else if name.starts_with("tun")
        || name.starts_with("tap")
        || name.starts_with("utun")
        || name.starts_with("wg")
        || name.starts_with("veth")
        || name.starts_with("vnet")
    {
        LinkKind::Tunnel
    } else if name.starts_with("br")
        || name.starts_with("virbr")
        || name.starts_with("docker")
        || name.starts_with("bond")
        || name.starts_with("team")
    {
        LinkKind::Wired
    } else {
        LinkKind::Unknown
    }
}

/// Format a byte count as human-readable.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Format a duration as human-readable.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let ms = duration.subsec_millis();

    if secs >= 3600 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{secs}.{ms:03}s")
    } else {
        format!("{ms}ms")
    }
}

/// Parse a socket address, appending a default port when none is given.
pub fn parse_addr_with_default_port(
    s: &str,
    default_port: u16,
) -> Result<SocketAddr, std::net::AddrParseError> {
    if s.starts_with('[') {
        // Bracketed IPv6, port already present or invalid either way
        s.parse()
    } else if s.contains(':') {
        if s.matches(':').count() == 1 {
            // IPv4 with port
            s.parse()
        } else {
            // Bare IPv6
            format!("[{s}]:{default_port}").parse()
        }
    } else {
        format!("{s}:{default_port}").parse()
    }
}

/// Check if running with elevated privileges.
///
/// Binding probe sockets to a device requires `CAP_NET_RAW` on Linux,
/// which in practice means root for a plain binary.
#[cfg(unix)]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Create a nonblocking UDP socket bound to the given device.
///
/// Traffic through this socket egresses on that device regardless of the
/// routing table. Binding falls back to an unbound socket with a debug log
/// when the capability is missing, so unprivileged runs still work.
pub fn bind_udp_to_device(device: &str, ipv6: bool) -> crate::error::Result<tokio::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::net::SocketAddr;

    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    #[cfg(target_os = "linux")]
    {
        use std::ffi::CString;
        use std::os::unix::io::AsRawFd;

        if let Ok(cname) = CString::new(device) {
            // SO_BINDTODEVICE requires CAP_NET_RAW or root.
            let ret = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_BINDTODEVICE,
                    cname.as_ptr().cast::<libc::c_void>(),
                    (device.len() + 1) as libc::socklen_t,
                )
            };
            if ret != 0 {
                tracing::debug!(
                    device,
                    error = %std::io::Error::last_os_error(),
                    "SO_BINDTODEVICE failed, socket is not device-bound"
                );
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = device;

    socket.set_nonblocking(true)?;
    let bind_addr = if ipv6 {
        SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
    };
    socket.bind(&bind_addr.into())?;

    Ok(tokio::net::UdpSocket::from_std(socket.into())?)
}

/// Look up an interface index by name via the OS.
#[cfg(unix)]
pub fn if_nametoindex(name: &str) -> Option<u32> {
    use std::ffi::CString;
    let cname = CString::new(name).ok()?;
    let idx = unsafe { libc::if_nametoindex(cname.as_ptr()) };
    if idx == 0 {
        None
    } else {
        Some(idx)
    }
}

#[cfg(not(unix))]
pub fn if_nametoindex(_name: &str) -> Option<u32> {
    None
}
