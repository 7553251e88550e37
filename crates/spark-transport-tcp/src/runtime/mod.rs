//! Tokio 实现层：原始句柄、句柄工厂与名字解析服务。
//!
//! 所有完成回调都经由 `tokio::task::spawn_local` 投递，因此必须在 current-thread
//! 运行时的 `LocalSet` 中使用。

mod handle;
mod resolver;

pub use handle::{TokioHandleFactory, TokioTcpHandle};
pub use resolver::TokioResolver;
