use spark_transport::{LookupCallback, LookupHints, NameResolver, RawError, select_address};
use tokio::task::spawn_local;
use tracing::trace;

/// 基于 `tokio::net::lookup_host` 的名字解析服务。
///
/// 系统解析器自行处理 `addrconfig`；地址族过滤与 IPv4 映射由
/// [`select_address`] 按提示完成。
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioResolver;

impl TokioResolver {
    pub fn new() -> Self {
        Self
    }
}

impl NameResolver for TokioResolver {
    fn lookup(&self, host: &str, hints: LookupHints, on_resolved: LookupCallback) {
        let host = host.to_owned();
        spawn_local(async move {
            let outcome = match tokio::net::lookup_host((host.as_str(), 0)).await {
                Ok(candidates) => select_address(candidates.map(|addr| addr.ip()), hints)
                    .ok_or_else(|| RawError::not_found(&host)),
                Err(error) => Err(RawError::from(error)),
            };
            trace!(host = %host, ok = outcome.is_ok(), "lookup finished");
            on_resolved(outcome);
        });
    }
}
