use crate::{AddressFamily, RawError, RawTcpHandle};

/// 协调者授予（或拒绝）监听句柄时的回调。
pub type GrantCallback = Box<dyn FnOnce(Result<Box<dyn RawTcpHandle>, RawError>)>;

/// 监听绑定的附加标志。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct ListenerFlags {
    /// 独占绑定：工作进程自行绑定，不经过协调者共享。
    pub exclusive: bool,
    /// IPv6 监听时设置 `IPV6_V6ONLY`。
    pub ipv6_only: bool,
}

/// 工作进程向协调者申请监听句柄时提交的绑定形状。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerDescriptor {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
    pub flags: ListenerFlags,
}

/// 集群监听协调者。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 多个工作进程共享同一个逻辑端口时，保证每个端口在内核层只存在一次 listen，
///   而每个工作进程各自持有本地句柄对象并从中接受连接。
///
/// ## 契约 (What)
/// - `request_listener`：异步返回一个已绑定（可以已处于监听状态）的句柄或错误；
/// - 协调者不管理任何连接生命周期，只负责分发句柄；
/// - 授予结果必须由事件循环投递，不得在调用内部同步回调。
///
/// ## 注意事项 (Trade-offs)
/// - 调用方需要自行校验授予句柄的端口，协调者返回成功并不代表端口一定匹配。
pub trait ListenerCoordinator {
    fn request_listener(&self, descriptor: ListenerDescriptor, on_granted: GrantCallback);
}
