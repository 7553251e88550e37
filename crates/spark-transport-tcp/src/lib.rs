#![deny(unsafe_code)]
#![doc = r#"
# spark-transport-tcp

## 设计动机（Why）
- **定位**：该 crate 提供事件驱动的 TCP 传输：主动建连的 [`Socket`]、被动监听的
  [`Server`]，以及多 Worker 共享监听端口时的 [`SharedListenerRegistry`]。
- **架构角色**：位于 `spark-transport` 能力契约之上，负责生命周期状态机、读写背压、
  连接计数与错误投递；真正的系统调用由注入的 [`RawTcpHandle`](spark_transport::RawTcpHandle)
  完成，默认实现基于 Tokio。
- **设计理念**：所有状态转换都由单线程事件循环驱动，完成回调绝不在发起调用内部同步重入，
  因此对象使用 `Rc`/`RefCell` 共享，而非跨线程锁。

## 核心契约（What）
- **Socket**：`Unconnected → Resolving → Connecting → Open → Closing → Closed`；
  建连前的写入按序排队，建立后先冲刷再投递 `connect`；`data` 监听器可以返回
  [`ReadDemand::Pause`] 暂停读取；对端 EOF 与连接重置按正常关闭处理。
- **Server**：`Idle → Binding → Listening → Closing → Closed`；接受的连接计数从 1 变为 0 时
  投递 `idle`；关闭 Server 不会关闭已接受的 Socket。
- **错误**：失败统一为 [`TcpError`]，带稳定错误码与动作名；没有 `error` 监听器时
  按 [`UnhandledErrorPolicy`] 处理，默认 panic。

## 实现策略（How）
- **能力注入**：[`Transport`] 聚合配置、句柄工厂、名字解析与可选的监听协调者，
  Socket 与 Server 都从它获取依赖；测试以脚本化替身替换全部能力。
- **Tokio 实现**：`runtime-tokio` 特性（默认开启）提供 [`TokioHandleFactory`] 与
  [`TokioResolver`]，要求在 current-thread 运行时的 `LocalSet` 中使用。

## 风险与考量（Trade-offs）
- **线程模型**：`Socket`、`Server` 与 `Transport` 都不是 `Send`，多核扩展依赖多 Worker
  各自运行事件循环，通过协调者共享监听端口。
- **引用环**：句柄回调持有其所属对象，直到关闭完成才释放；未关闭的对象不会因为
  丢弃最后一个克隆而被回收。
"#]

#[cfg(feature = "runtime-tokio")]
mod cluster;
mod config;
mod error;
mod events;
#[cfg(feature = "runtime-tokio")]
pub mod runtime;
mod server;
mod socket;
#[cfg(test)]
mod testing;
mod transport;

pub use spark_transport;

#[cfg(feature = "runtime-tokio")]
pub use cluster::SharedListenerRegistry;
pub use config::{
    ConfigError, ProcessRole, TransportConfig, UnhandledErrorPolicy, WORKER_ID_ENV,
};
pub use error::{OperationKind, ServerError, TcpError};
pub use events::{Emitter, ListenerId};
#[cfg(feature = "runtime-tokio")]
pub use runtime::{TokioHandleFactory, TokioResolver, TokioTcpHandle};
pub use server::{Server, ServerOptions, ServerState};
pub use socket::{ReadDemand, Socket, SocketOptions, SocketState, WriteCompletion};
pub use transport::{BuildError, Transport, TransportBuilder};

/// 稳定错误码与动作名，便于日志检索与告警规则引用。
pub mod codes {
    pub use crate::error::{
        ACCEPT, ADDRESS_MISMATCH, BIND, CLOSED, CONNECT, LISTEN, READ, WRITE,
    };
}
