use std::net::SocketAddr;

use bytes::Bytes;

use crate::RawError;

/// 建连完成回调，`Ok(())` 对应平台状态码 0。
pub type ConnectCallback = Box<dyn FnOnce(Result<(), RawError>)>;
/// 读泵回调，每个入站分片触发一次。
pub type ReadCallback = Box<dyn FnMut(ReadSignal)>;
/// 写出完成回调，仅在 [`WriteStatus::Queued`] 时由句柄调用。
pub type WriteCallback = Box<dyn FnOnce(Result<(), RawError>)>;
/// 监听句柄的接受回调：成功时移交新连接的句柄所有权。
pub type ConnectionCallback = Box<dyn FnMut(Result<Box<dyn RawTcpHandle>, RawError>)>;
/// 句柄完全释放后的确认回调。
pub type CloseCallback = Box<dyn FnOnce()>;

/// 读泵投递给所有者的信号。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadSignal {
    /// 收到一段非空数据。
    Data(Bytes),
    /// 零长度读取，表示“暂无数据，继续等待”，不代表失败。
    Empty,
    /// 对端发送 FIN。
    Eof,
    /// 平台错误；连接重置也以此报告，由所有者自行区分。
    Failed(RawError),
}

/// 写入提交后的队列状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// 负载已全部交给内核，写回调不会再被调用。
    Flushed,
    /// 负载仍在句柄的发送队列中，写回调将在冲刷完成（或失败）时调用恰好一次。
    Queued,
}

/// 单个内核 TCP 端点的原始能力。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把 bind/listen/connect/read/write/close 等非阻塞原语收拢为一个不透明能力对象，
///   Socket 与 Server 只通过它与内核交互，便于替换为 Tokio 实现或测试替身。
///
/// ## 契约 (What)
/// - 同步返回 `Err` 即平台的负错误码；异步结果通过回调投递；
/// - **非重入**：任何回调都不得在发起它的方法内部同步调用，必须由事件循环稍后投递；
/// - `close` 之后不再投递读、写、建连与接受回调；仍在队列中的写回调以
///   [`RawError::cancelled`] 完成，然后才调用关闭确认回调；
/// - 同一句柄的写回调严格按提交顺序完成。
///
/// ## 注意事项 (Trade-offs)
/// - 读泵回调在每次 `read_start` 时重新传入，句柄只保留最近一次的回调。
pub trait RawTcpHandle {
    /// 绑定到本地地址，地址族决定走 IPv4 还是 IPv6 分支。
    fn bind(&mut self, addr: SocketAddr) -> Result<(), RawError>;

    /// 开始监听，之后每个入站连接触发一次 `on_connection`。
    fn listen(&mut self, backlog: u32, on_connection: ConnectionCallback) -> Result<(), RawError>;

    /// 发起异步建连。
    fn connect(&mut self, addr: SocketAddr, on_complete: ConnectCallback) -> Result<(), RawError>;

    fn read_start(&mut self, on_read: ReadCallback) -> Result<(), RawError>;

    fn read_stop(&mut self) -> Result<(), RawError>;

    /// 提交一段负载，返回提交后发送队列是否为空。
    fn write(&mut self, payload: Bytes, on_flushed: WriteCallback) -> Result<WriteStatus, RawError>;

    /// 尚未交给内核的字节数。
    fn write_queue_size(&self) -> usize;

    fn peer_name(&self) -> Result<SocketAddr, RawError>;

    fn sock_name(&self) -> Result<SocketAddr, RawError>;

    /// 设置 `SO_KEEPALIVE`，`delay_secs` 为 0 时保留系统默认的探测间隔。
    fn set_keep_alive(&mut self, enable: bool, delay_secs: u32) -> Result<(), RawError>;

    fn close(&mut self, on_closed: CloseCallback);
}

/// 创建全新未绑定句柄的工厂。
pub trait HandleFactory {
    fn create(&self) -> Box<dyn RawTcpHandle>;
}

impl<F> HandleFactory for F
where
    F: Fn() -> Box<dyn RawTcpHandle>,
{
    fn create(&self) -> Box<dyn RawTcpHandle> {
        self()
    }
}
