use std::io::{self, ErrorKind};
use thiserror::Error;

/// 平台层返回的原始错误。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 原始句柄以“0 或负错误码”报告结果，本类型把错误码、错误种类与文案收拢到一处，
///   同时实现 `Clone`，使同一个错误可以同时投递给 `error` 事件和多个写回调。
///
/// ## 契约 (What)
/// - `kind`：标准库 [`ErrorKind`]，用于区分 EOF、连接重置等“非错误”信号；
/// - `errno`：若来源于操作系统则保留原始错误码；
/// - 文案与 `io::Error` 的 `Display` 保持一致。
///
/// ## 注意事项 (Trade-offs)
/// - 转换时会丢弃 `io::Error` 内部的自定义 payload，仅保留文本。
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RawError {
    kind: ErrorKind,
    errno: Option<i32>,
    message: String,
}

impl RawError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            message: message.into(),
        }
    }

    /// 读取端收到对端的 EOF。
    pub fn eof() -> Self {
        Self::new(ErrorKind::UnexpectedEof, "end of stream")
    }

    /// 句柄关闭时仍在排队的操作统一以该错误完成。
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Interrupted, "operation cancelled")
    }

    pub fn not_connected() -> Self {
        Self::new(ErrorKind::NotConnected, "handle is not connected")
    }

    pub fn address_in_use() -> Self {
        Self::new(ErrorKind::AddrInUse, "address already in use")
    }

    /// 名字解析没有得到任何可用地址。
    pub fn not_found(host: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("getaddrinfo ENOTFOUND {host}"))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn errno(&self) -> Option<i32> {
        self.errno
    }

    pub fn is_eof(&self) -> bool {
        self.kind == ErrorKind::UnexpectedEof
    }

    pub fn is_connection_reset(&self) -> bool {
        self.kind == ErrorKind::ConnectionReset
    }
}

impl From<io::Error> for RawError {
    fn from(error: io::Error) -> Self {
        Self {
            kind: error.kind(),
            errno: error.raw_os_error(),
            message: error.to_string(),
        }
    }
}
