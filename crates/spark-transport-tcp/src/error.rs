use spark_transport::{Endpoint, RawError};
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与动作名。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub action: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "spark.transport.tcp.bind_failed",
    action: "bind",
};
pub const LISTEN: OperationKind = OperationKind {
    code: "spark.transport.tcp.listen_failed",
    action: "listen",
};
pub const CONNECT: OperationKind = OperationKind {
    code: "spark.transport.tcp.connect_failed",
    action: "connect",
};
pub const READ: OperationKind = OperationKind {
    code: "spark.transport.tcp.read_failed",
    action: "read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "spark.transport.tcp.write_failed",
    action: "write",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "spark.transport.tcp.accept_failed",
    action: "accept",
};
pub const CLOSED: OperationKind = OperationKind {
    code: "spark.transport.tcp.closed",
    action: "write",
};
pub const ADDRESS_MISMATCH: OperationKind = OperationKind {
    code: "spark.transport.tcp.address_mismatch",
    action: "listen",
};

/// TCP Socket/Server 对外报告的错误域。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 每个变体对应一次失败的操作，携带平台错误、动作名以及（适用时）主机与端口，
///   运维可以直接从文案中定位是哪个目标、哪一步失败。
///
/// ## 契约 (What)
/// - 错误通过所属 Socket/Server 的 `error` 事件投递，从不在异步完成路径中同步抛出；
/// - [`TcpError::code`] 返回稳定错误码，前缀为 `spark.transport.tcp.`；
/// - `Connect` 的文案包含调用方传入的原始 `host:port`；
/// - 读端的 EOF 与连接重置不属于错误，不会出现在本枚举中。
///
/// ## 注意事项 (Trade-offs)
/// - 错误需要同时投递给事件监听器与写回调，因此实现 `Clone`；平台错误以
///   [`RawError`] 的文本形式保留。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum TcpError {
    #[error("tcp bind {target}: {source}")]
    Bind { target: Endpoint, source: RawError },

    #[error("tcp listen {target}: {source}")]
    Listen { target: Endpoint, source: RawError },

    #[error("tcp connect {target}: {source}")]
    Connect { target: Endpoint, source: RawError },

    #[error("tcp read: {source}")]
    Read { source: RawError },

    #[error("tcp write: {source}")]
    Write { source: RawError },

    #[error("tcp accept: {source}")]
    Accept { source: RawError },

    /// 在已经拆除的 Socket 上执行操作。
    #[error("tcp {action}: this socket is closed")]
    Closed { action: &'static str },

    /// 协调者授予的监听句柄端口与申请不一致，按“地址被占用”处理。
    #[error("tcp listen {target}: {source} (granted handle is bound to port {actual_port})")]
    AddressMismatch {
        target: Endpoint,
        actual_port: u16,
        source: RawError,
    },
}

impl TcpError {
    pub(crate) fn bind(target: Endpoint, source: RawError) -> Self {
        Self::Bind { target, source }
    }

    pub(crate) fn listen(target: Endpoint, source: RawError) -> Self {
        Self::Listen { target, source }
    }

    pub(crate) fn connect(target: Endpoint, source: RawError) -> Self {
        Self::Connect { target, source }
    }

    pub(crate) fn closed() -> Self {
        Self::Closed {
            action: CLOSED.action,
        }
    }

    pub(crate) fn address_mismatch(target: Endpoint, actual_port: u16) -> Self {
        Self::AddressMismatch {
            target,
            actual_port,
            source: RawError::address_in_use(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Bind { .. } => BIND,
            Self::Listen { .. } => LISTEN,
            Self::Connect { .. } => CONNECT,
            Self::Read { .. } => READ,
            Self::Write { .. } => WRITE,
            Self::Accept { .. } => ACCEPT,
            Self::Closed { .. } => CLOSED,
            Self::AddressMismatch { .. } => ADDRESS_MISMATCH,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code
    }

    /// 失败时尝试执行的动作，例如 `"connect"`。
    pub fn action(&self) -> &'static str {
        match self {
            Self::Closed { action } => action,
            other => other.kind().action,
        }
    }

    /// 底层平台错误；`Closed` 没有对应的平台错误。
    pub fn raw(&self) -> Option<&RawError> {
        match self {
            Self::Bind { source, .. }
            | Self::Listen { source, .. }
            | Self::Connect { source, .. }
            | Self::Read { source }
            | Self::Write { source }
            | Self::Accept { source }
            | Self::AddressMismatch { source, .. } => Some(source),
            Self::Closed { .. } => None,
        }
    }

    /// 错误涉及的主机与端口。
    pub fn target(&self) -> Option<&Endpoint> {
        match self {
            Self::Bind { target, .. }
            | Self::Listen { target, .. }
            | Self::Connect { target, .. }
            | Self::AddressMismatch { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Server 内部簿记错误。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// 连接计数已经为 0 时仍有连接报告关闭，属于编程错误。
    #[error("connection count underflow: a socket was released twice or was never attributed")]
    ConnectionCountUnderflow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    #[test]
    fn connect_error_mentions_host_and_port() {
        let error = TcpError::connect(
            Endpoint::new("nowhere.invalid", 4321),
            RawError::not_found("nowhere.invalid"),
        );
        let message = error.to_string();
        assert!(message.contains("nowhere.invalid:4321"), "{message}");
        assert_eq!(error.code(), "spark.transport.tcp.connect_failed");
        assert_eq!(error.action(), "connect");
        assert_eq!(error.target().map(Endpoint::port), Some(4321));
    }

    #[test]
    fn address_mismatch_reports_address_in_use() {
        let error = TcpError::address_mismatch(Endpoint::new("0.0.0.0", 9000), 9001);
        assert_eq!(error.raw().map(RawError::kind), Some(ErrorKind::AddrInUse));
        assert!(error.to_string().contains("9001"));
    }

    #[test]
    fn closed_error_has_no_platform_source() {
        let error = TcpError::closed();
        assert!(error.raw().is_none());
        assert_eq!(error.action(), "write");
    }
}
