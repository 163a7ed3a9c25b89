use core::fmt;

#[cfg(feature = "std")]
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// 协议无关的套接字地址表示。
///
/// # 设计背景（Why）
/// - 核心在 `no_std + alloc` 环境下同样可用，因此不直接依赖 `std::net::SocketAddr`；
///   以最小字段承载 IPv4/IPv6 两种形态，必要时在 `std` 构建中与标准库互转。
///
/// # 契约说明（What）
/// - `V4`/`V6` 分别存储原始地址段与端口；`Display` 输出与常见 `host:port` 约定一致。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportSocketAddr {
    /// IPv4 地址。
    V4 { addr: [u8; 4], port: u16 },
    /// IPv6 地址。
    V6 { addr: [u16; 8], port: u16 },
}

impl TransportSocketAddr {
    /// 返回端口号。
    pub fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    /// 与标准库地址互转，便于 `std` 环境下的传输实现直接使用。
    #[cfg(feature = "std")]
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self {
            Self::V4 { addr, port } => SocketAddr::from((Ipv4Addr::from(*addr), *port)),
            Self::V6 { addr, port } => SocketAddr::from((Ipv6Addr::from(*addr), *port)),
        }
    }

    /// 从标准库地址构造。
    #[cfg(feature = "std")]
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => Self::V4 {
                addr: v4.ip().octets(),
                port: v4.port(),
            },
            SocketAddr::V6(v6) => Self::V6 {
                addr: v6.ip().segments(),
                port: v6.port(),
            },
        }
    }
}

impl fmt::Display for TransportSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 { addr, port } => {
                write!(f, "{}.{}.{}.{}:{}", addr[0], addr[1], addr[2], addr[3], port)
            }
            Self::V6 { addr, port } => {
                write!(
                    f,
                    "[{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}:{:x}]:{}",
                    addr[0], addr[1], addr[2], addr[3], addr[4], addr[5], addr[6], addr[7], port
                )
            }
        }
    }
}
