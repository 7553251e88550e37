#![deny(unsafe_code)]
#![doc = "spark-transport: 事件驱动 TCP 传输的底层能力契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **What**：定义原始传输句柄 [`RawTcpHandle`]、名字解析服务 [`NameResolver`] 与集群监听协调者 [`ListenerCoordinator`] 三类能力接口，"]
#![doc = "  以及它们共享的地址工具与平台错误 [`RawError`]。"]
#![doc = "- **How**：本 crate 不包含任何运行时；`spark-transport-tcp` 在其上实现 Socket/Server 状态机，并提供基于 Tokio 的默认实现。"]
#![doc = "- **约束**：所有能力的完成回调都必须由事件循环投递，禁止在发起调用内部同步重入。"]

pub mod addr;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod resolve;

pub use addr::{AddressFamily, Endpoint, is_wildcard_host, literal_ip};
pub use coordinator::{GrantCallback, ListenerCoordinator, ListenerDescriptor, ListenerFlags};
pub use error::RawError;
pub use handle::{
    CloseCallback, ConnectCallback, ConnectionCallback, HandleFactory, RawTcpHandle, ReadCallback,
    ReadSignal, WriteCallback, WriteStatus,
};
pub use resolve::{LookupCallback, LookupHints, NameResolver, ResolvedAddress, select_address};
