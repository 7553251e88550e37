use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// 地址族，对应解析结果与绑定时选用的 `bind`/`bind6` 分支。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 集群协调请求与名字解析结果都需要携带“IPv4 还是 IPv6”这一信息，统一成枚举后
///   上层无需再传递裸数字 `4`/`6`。
///
/// ## 合同（What）
/// - [`AddressFamily::of_literal`] 只做字面量检查，不触发任何解析；
/// - [`AddressFamily::as_number`] 返回 `4` 或 `6`，便于日志与外部协议交互。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    /// IPv4。
    Ipv4,
    /// IPv6。
    Ipv6,
}

impl AddressFamily {
    /// 返回 IP 地址所属的地址族。
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::Ipv4,
            IpAddr::V6(_) => Self::Ipv6,
        }
    }

    /// 若 `host` 为字面量地址，返回其地址族。
    pub fn of_literal(host: &str) -> Option<Self> {
        literal_ip(host).map(|ip| Self::of(&ip))
    }

    /// 该地址族下的“任意地址”。
    pub fn unspecified(self) -> IpAddr {
        match self {
            Self::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Self::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn as_number(self) -> u8 {
        match self {
            Self::Ipv4 => 4,
            Self::Ipv6 => 6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IPv{}", self.as_number())
    }
}

/// 判断主机字符串是否已经是合法的 IPv4/IPv6 字面量。
///
/// # 逻辑解析（How）
/// 1. 去除 `[::1]` 形式的方括号；
/// 2. 交给标准库解析，成功即视为字面量。
///
/// # 合同
/// - **返回值**：字面量返回 `Some(ip)`，主机名（如 `localhost`）或空串返回 `None`；
/// - **后置条件**：不进行任何网络访问。
pub fn literal_ip(host: &str) -> Option<IpAddr> {
    let trimmed = host
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(host);
    trimmed.parse().ok()
}

/// 空串与 `*` 表示“绑定到所有网卡”。
pub fn is_wildcard_host(host: &str) -> bool {
    host.is_empty() || host == "*"
}

/// 主机与端口的组合，用于错误上下文与日志。
///
/// `Display` 对 IPv6 字面量加方括号，其余原样输出 `host:port`，保证错误文案中
/// 始终包含调用方传入的原始主机名。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match literal_ip(&self.host) {
            Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_detection_matches_address_versions() {
        assert_eq!(AddressFamily::of_literal("127.0.0.1"), Some(AddressFamily::Ipv4));
        assert_eq!(AddressFamily::of_literal("::"), Some(AddressFamily::Ipv6));
        assert_eq!(AddressFamily::of_literal("[::1]"), Some(AddressFamily::Ipv6));
        assert_eq!(AddressFamily::of_literal("localhost"), None);
        assert_eq!(AddressFamily::of_literal(""), None);
        assert_eq!(AddressFamily::of_literal("1.2.3"), None);
    }

    #[test]
    fn endpoint_display_keeps_the_given_host() {
        assert_eq!(Endpoint::new("localhost", 80).to_string(), "localhost:80");
        assert_eq!(Endpoint::new("::1", 9891).to_string(), "[::1]:9891");
        assert_eq!(Endpoint::new("10.0.0.1", 1).to_string(), "10.0.0.1:1");
    }

    #[test]
    fn wildcard_hosts() {
        assert!(is_wildcard_host(""));
        assert!(is_wildcard_host("*"));
        assert!(!is_wildcard_host("0.0.0.0"));
    }
}
