use std::net::IpAddr;

use crate::{AddressFamily, RawError};

/// 名字解析完成回调。
pub type LookupCallback = Box<dyn FnOnce(Result<ResolvedAddress, RawError>)>;

/// 解析请求携带的地址族提示。
///
/// # 教案级注释
///
/// ## 契约（What）
/// - `family`：指定地址族时只接受该族的结果；`None` 表示不限制；
/// - `addrconfig`：仅返回本机已配置地址族的结果（交由系统解析器执行）；
/// - `v4mapped`：要求 IPv6 但只得到 IPv4 时，返回 `::ffff:a.b.c.d` 映射地址。
///
/// ## 注意事项（Trade-offs）
/// - FreeBSD 与 Android 的 `getaddrinfo` 不支持 `AI_V4MAPPED`，会直接返回 `EAI_BADFLAGS`，
///   因此 [`LookupHints::platform_default`] 在这两个平台上关闭该提示。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupHints {
    pub family: Option<AddressFamily>,
    pub addrconfig: bool,
    pub v4mapped: bool,
}

impl LookupHints {
    pub fn platform_default() -> Self {
        Self {
            family: None,
            addrconfig: true,
            v4mapped: !cfg!(any(target_os = "freebsd", target_os = "android")),
        }
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = Some(family);
        self
    }
}

impl Default for LookupHints {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// 解析得到的地址及其地址族。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub ip: IpAddr,
    pub family: AddressFamily,
}

impl From<IpAddr> for ResolvedAddress {
    fn from(ip: IpAddr) -> Self {
        Self {
            family: AddressFamily::of(&ip),
            ip,
        }
    }
}

/// 异步名字解析服务。
///
/// 与 [`RawTcpHandle`](crate::RawTcpHandle) 相同，`on_resolved` 必须由事件循环投递，
/// 不得在 `lookup` 内同步调用。
pub trait NameResolver {
    fn lookup(&self, host: &str, hints: LookupHints, on_resolved: LookupCallback);
}

/// 按提示从候选地址中挑选一个结果。
///
/// 未指定地址族时优先 IPv4，与 `localhost` 同时解析出 `::1` 和 `127.0.0.1` 时的
/// 传统行为一致。
pub fn select_address<I>(candidates: I, hints: LookupHints) -> Option<ResolvedAddress>
where
    I: IntoIterator<Item = IpAddr>,
{
    let candidates: Vec<IpAddr> = candidates.into_iter().collect();
    let pick = |family: AddressFamily| {
        candidates
            .iter()
            .copied()
            .find(|ip| AddressFamily::of(ip) == family)
    };

    match hints.family {
        Some(AddressFamily::Ipv4) => pick(AddressFamily::Ipv4),
        Some(AddressFamily::Ipv6) => pick(AddressFamily::Ipv6).or_else(|| {
            if !hints.v4mapped {
                return None;
            }
            pick(AddressFamily::Ipv4).map(|ip| match ip {
                IpAddr::V4(v4) => IpAddr::V6(v4.to_ipv6_mapped()),
                other => other,
            })
        }),
        None => pick(AddressFamily::Ipv4).or_else(|| pick(AddressFamily::Ipv6)),
    }
    .map(ResolvedAddress::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const V4: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    const V6: IpAddr = IpAddr::V6(Ipv6Addr::LOCALHOST);

    #[test]
    fn unrestricted_lookup_prefers_ipv4() {
        let resolved = select_address([V6, V4], LookupHints::platform_default());
        assert_eq!(resolved.map(|r| r.ip), Some(V4));
        let only_v6 = select_address([V6], LookupHints::platform_default());
        assert_eq!(only_v6.map(|r| r.family), Some(AddressFamily::Ipv6));
    }

    #[test]
    fn v4mapped_hint_maps_ipv4_results() {
        let hints = LookupHints {
            family: Some(AddressFamily::Ipv6),
            addrconfig: true,
            v4mapped: true,
        };
        let resolved = select_address([V4], hints).map(|r| r.ip);
        assert_eq!(
            resolved,
            Some(IpAddr::V6(Ipv4Addr::LOCALHOST.to_ipv6_mapped()))
        );

        let strict = LookupHints {
            v4mapped: false,
            ..hints
        };
        assert_eq!(select_address([V4], strict), None);
    }

    #[test]
    fn empty_candidates_yield_nothing() {
        assert_eq!(select_address([], LookupHints::default()), None);
    }
}
