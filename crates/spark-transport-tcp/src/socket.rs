//! # socket 模块说明
//!
//! ## 角色定位（Why）
//! - [`Socket`] 独占一个原始传输句柄，负责连接生命周期状态机、读端流控与写端排队；
//! - 主动发起的 Socket 经历“解析 → 建连 → 打开”，Server 接受的 Socket 直接处于打开状态。
//!
//! ## 状态机（What）
//! - `Unconnected → Resolving → Connecting → Open → Closing → Closed`；
//!   字面量地址跳过 `Resolving`；
//! - 句柄在且仅在 `Connecting`/`Open`/`Closing` 时存在；
//! - 任意状态都可以经由 `fail` 进入关闭流程：先投递 `error`，再走与优雅关闭相同的拆除路径；
//!   没有监听器接收的错误在 `close` 之后才按未处理错误策略处理；
//! - `Closed` 是终态，只会进入一次。
//!
//! ## 实现要点（How）
//! - 句柄回调捕获 Socket 自身，句柄活跃期间 Socket 不会被释放；句柄在拆除完成时
//!   被移出并析构，引用环随之断开；
//! - 调用监听器或用户回调之前一律释放内部 `RefCell` 借用，监听器可以在回调中
//!   任意调用本 Socket 的方法；
//! - 晚到的完成回调通过状态检查变为空操作。

use std::cell::{Ref, RefCell, RefMut};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use spark_transport::{
    Endpoint, LookupHints, RawError, RawTcpHandle, ReadSignal, ResolvedAddress, WriteStatus,
    literal_ip,
};
use tracing::{debug, trace, warn};

use crate::error::TcpError;
use crate::events::{Emitter, ListenerId, emit_error, raise_unhandled};
use crate::server::{Server, ServerShared};
use crate::transport::Transport;

/// Socket 生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketState {
    Unconnected,
    Resolving,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// `data` 监听器的返回值，表达消费者是否还需要更多数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadDemand {
    More,
    Pause,
}

/// 主动建连的目标；缺省字段取自 [`TransportConfig`](crate::TransportConfig)。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl SocketOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
        }
    }
}

/// 写完成回调：负载交给内核后以 `Ok(())` 调用，失败时携带错误。
pub type WriteCompletion = Box<dyn FnOnce(Result<(), TcpError>)>;

type WriteSlot = RefCell<Option<WriteCompletion>>;

struct PendingWrite {
    payload: Bytes,
    on_written: Option<WriteCompletion>,
}

struct SocketCore {
    state: SocketState,
    handle: Option<Box<dyn RawTcpHandle>>,
    host: String,
    port: u16,
    resolved: Option<ResolvedAddress>,
    bytes_read: u64,
    pending_writes: VecDeque<PendingWrite>,
    pending_bytes: usize,
    read_demand: bool,
    reading: bool,
    keep_alive: Option<(bool, u32)>,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    server: Option<Weak<ServerShared>>,
    close_callbacks: Vec<Box<dyn FnOnce()>>,
    had_error: bool,
    /// 没有 `error` 监听器接收的第一个错误，关闭完成后按策略处理。
    unhandled: Option<TcpError>,
}

impl SocketCore {
    fn new(host: String, port: u16) -> Self {
        Self {
            state: SocketState::Unconnected,
            handle: None,
            host,
            port,
            resolved: None,
            bytes_read: 0,
            pending_writes: VecDeque::new(),
            pending_bytes: 0,
            read_demand: false,
            reading: false,
            keep_alive: None,
            local: None,
            remote: None,
            server: None,
            close_callbacks: Vec::new(),
            had_error: false,
            unhandled: None,
        }
    }
}

#[derive(Default)]
struct SocketEvents {
    connect: Emitter<()>,
    data: Emitter<Bytes, ReadDemand>,
    close: Emitter<bool>,
    error: Emitter<TcpError>,
    lookup: Emitter<Result<ResolvedAddress, RawError>>,
}

impl SocketEvents {
    fn clear(&self) {
        self.connect.clear();
        self.data.clear();
        self.close.clear();
        self.error.clear();
        self.lookup.clear();
    }
}

struct SocketShared {
    core: RefCell<SocketCore>,
    events: SocketEvents,
    transport: Transport,
}

/// 一条 TCP 连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在原始句柄之上实现连接生命周期、读端背压与写端排队，对应用层只暴露事件与少量方法。
///
/// ## 契约 (What)
/// - 事件顺序：至多一次 `connect`，随后零或多次 `data`，最后恰好一次 `close(had_error)`，
///   `close` 之前可能有一次 `error`；
/// - `write`：建连完成前的写入按调用顺序排队，`connect` 时依次冲刷；
///   已关闭时写回调立即以 [`TcpError::Closed`] 完成；
/// - 读泵只在消费者表达需求后启动，`data` 监听器返回 [`ReadDemand::Pause`]
///   或不存在任何监听器时停止；
/// - `bytes_read` 在关闭后仍可读取；`local_address`/`remote_address` 从不 panic，
///   未知时返回 `None`。
///
/// ## 注意事项 (Trade-offs)
/// - `Socket` 是 `Rc` 句柄，克隆共享同一条连接；事件监听器可以捕获 Socket 的克隆，
///   关闭完成后监听器列表会被清空。
/// - 没有句柄的 Socket（尚未建连或解析中）关闭时同步投递 `close`。
#[derive(Clone)]
pub struct Socket {
    shared: Rc<SocketShared>,
}

impl Socket {
    /// 创建处于 `Unconnected` 状态的 Socket，调用 [`Socket::connect`] 后才开始建连。
    pub fn new(transport: &Transport, options: SocketOptions) -> Self {
        let config = transport.config();
        let host = options
            .host
            .unwrap_or_else(|| config.default_host.clone());
        let port = options.port.unwrap_or(config.default_port);
        Self::from_core(transport, SocketCore::new(host, port))
    }

    /// 包装 Server 接受的句柄，Socket 直接处于 `Open` 状态。
    pub(crate) fn accepted(
        transport: &Transport,
        handle: Box<dyn RawTcpHandle>,
        server: Weak<ServerShared>,
    ) -> Self {
        let remote = handle.peer_name().ok();
        let (host, port) = remote
            .map(|addr| (addr.ip().to_string(), addr.port()))
            .unwrap_or_default();
        let mut core = SocketCore::new(host, port);
        core.state = SocketState::Open;
        core.handle = Some(handle);
        core.resolved = remote.map(|addr| ResolvedAddress::from(addr.ip()));
        core.remote = remote;
        core.server = Some(server);
        Self::from_core(transport, core)
    }

    fn from_core(transport: &Transport, core: SocketCore) -> Self {
        Self {
            shared: Rc::new(SocketShared {
                core: RefCell::new(core),
                events: SocketEvents::default(),
                transport: transport.clone(),
            }),
        }
    }

    /// 开始建连；只有 `Unconnected` 状态的 Socket 会响应，重复调用是空操作。
    pub fn connect(&self) {
        let (state, host) = {
            let core = self.core();
            (core.state, core.host.clone())
        };
        if state != SocketState::Unconnected {
            debug!(?state, host = %host, "connect ignored: socket already started");
            return;
        }

        match literal_ip(&host) {
            Some(ip) => self.connect_to(ResolvedAddress::from(ip)),
            None => {
                self.core_mut().state = SocketState::Resolving;
                trace!(host = %host, "resolving host");
                let socket = self.clone();
                self.shared.transport.resolver().lookup(
                    &host,
                    LookupHints::platform_default(),
                    Box::new(move |outcome| socket.on_resolved(outcome)),
                );
            }
        }
    }

    // ---- 事件注册 ----

    pub fn on_connect<F>(&self, mut listener: F) -> ListenerId
    where
        F: FnMut() + 'static,
    {
        self.shared.events.connect.on(move |_| listener())
    }

    pub fn once_connect<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + 'static,
    {
        let mut listener = Some(listener);
        self.shared.events.connect.once(move |_| {
            if let Some(listener) = listener.take() {
                listener();
            }
        })
    }

    /// 注册 `data` 监听器并表达读需求。
    pub fn on_data<F>(&self, mut listener: F) -> ListenerId
    where
        F: FnMut(&Bytes) + 'static,
    {
        self.on_data_with_demand(move |chunk| {
            listener(chunk);
            ReadDemand::More
        })
    }

    /// 注册由返回值决定是否继续读取的 `data` 监听器，并表达读需求。
    pub fn on_data_with_demand<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&Bytes) -> ReadDemand + 'static,
    {
        let id = self.shared.events.data.on(listener);
        self.resume();
        id
    }

    pub fn off_data(&self, id: ListenerId) -> bool {
        self.shared.events.data.off(id)
    }

    /// `close` 事件参数表示关闭前是否发生过错误。
    pub fn on_close<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&bool) + 'static,
    {
        self.shared.events.close.on(listener)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&TcpError) + 'static,
    {
        self.shared.events.error.on(listener)
    }

    /// 主机名解析完成后触发，字面量地址不会触发。
    pub fn on_lookup<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&Result<ResolvedAddress, RawError>) + 'static,
    {
        self.shared.events.lookup.on(listener)
    }

    // ---- 读端流控 ----

    /// 表达读需求；Socket 打开时立即启动读泵。
    pub fn resume(&self) {
        self.core_mut().read_demand = true;
        self.start_reading();
    }

    /// 撤回读需求并停止读泵。
    pub fn pause(&self) {
        let mut guard = self.core_mut();
        let core = &mut *guard;
        core.read_demand = false;
        if !core.reading {
            return;
        }
        core.reading = false;
        if let Some(handle) = core.handle.as_mut()
            && let Err(error) = handle.read_stop()
        {
            warn!(%error, "read_stop failed");
        }
    }

    pub fn is_reading(&self) -> bool {
        self.core().reading
    }

    // ---- 写端 ----

    pub fn write(&self, payload: impl Into<Bytes>) {
        self.submit(payload.into(), None);
    }

    pub fn write_with<F>(&self, payload: impl Into<Bytes>, on_written: F)
    where
        F: FnOnce(Result<(), TcpError>) + 'static,
    {
        self.submit(payload.into(), Some(Box::new(on_written)));
    }

    /// 尚未交给内核的字节数：建连前排队的负载加上句柄发送队列。
    pub fn buffer_size(&self) -> usize {
        let core = self.core();
        let queued = core
            .handle
            .as_ref()
            .map_or(0, |handle| handle.write_queue_size());
        core.pending_bytes + queued
    }

    /// 设置 TCP keepalive；`delay` 按整秒截断。Socket 尚未打开时推迟到打开后生效。
    pub fn set_keep_alive(&self, enable: bool, delay: Duration) {
        let delay_secs = u32::try_from(delay.as_secs()).unwrap_or(u32::MAX);
        let mut guard = self.core_mut();
        let core = &mut *guard;
        match core.state {
            SocketState::Open => {
                if let Some(handle) = core.handle.as_mut()
                    && let Err(error) = handle.set_keep_alive(enable, delay_secs)
                {
                    warn!(%error, "set_keep_alive failed");
                }
            }
            SocketState::Closing | SocketState::Closed => {
                debug!("set_keep_alive ignored on a closed socket");
            }
            _ => core.keep_alive = Some((enable, delay_secs)),
        }
    }

    // ---- 访问器 ----

    pub fn state(&self) -> SocketState {
        self.core().state
    }

    pub fn host(&self) -> String {
        self.core().host.clone()
    }

    pub fn port(&self) -> u16 {
        self.core().port
    }

    pub fn resolved_address(&self) -> Option<ResolvedAddress> {
        self.core().resolved
    }

    pub fn bytes_read(&self) -> u64 {
        self.core().bytes_read
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        let mut guard = self.core_mut();
        let core = &mut *guard;
        if core.local.is_none() {
            core.local = core.handle.as_ref().and_then(|h| h.sock_name().ok());
        }
        core.local
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        let mut guard = self.core_mut();
        let core = &mut *guard;
        if core.remote.is_none() {
            core.remote = core.handle.as_ref().and_then(|h| h.peer_name().ok());
        }
        core.remote
    }

    /// 接受该连接的 Server；主动发起的 Socket 或 Server 已释放时返回 `None`。
    pub fn server(&self) -> Option<Server> {
        self.core()
            .server
            .as_ref()
            .and_then(Weak::upgrade)
            .map(Server::from_shared)
    }

    // ---- 关闭 ----

    pub fn close(&self) {
        self.close_inner(None);
    }

    /// 优雅关闭；`callback` 在 `close` 事件之后调用，已关闭时立即调用。
    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.close_inner(Some(Box::new(callback)));
    }

    /// 立即拆除连接；携带错误时先投递 `error`。
    pub fn destroy(&self, error: Option<TcpError>) {
        match error {
            Some(error) => self.fail(error),
            None => self.teardown(),
        }
    }

    fn close_inner(&self, callback: Option<Box<dyn FnOnce()>>) {
        if self.state() == SocketState::Closed {
            if let Some(callback) = callback {
                callback();
            }
            return;
        }
        self.core_mut().close_callbacks.extend(callback);
        self.teardown();
    }

    // ---- 内部流程 ----

    fn core(&self) -> Ref<'_, SocketCore> {
        self.shared.core.borrow()
    }

    fn core_mut(&self) -> RefMut<'_, SocketCore> {
        self.shared.core.borrow_mut()
    }

    fn endpoint(&self) -> Endpoint {
        let core = self.core();
        Endpoint::new(core.host.clone(), core.port)
    }

    fn on_resolved(&self, outcome: Result<ResolvedAddress, RawError>) {
        if self.state() != SocketState::Resolving {
            debug!("late lookup result ignored");
            return;
        }
        self.shared.events.lookup.emit(&outcome);
        if self.state() != SocketState::Resolving {
            return;
        }
        match outcome {
            Ok(address) => self.connect_to(address),
            Err(source) => self.fail(TcpError::connect(self.endpoint(), source)),
        }
    }

    fn connect_to(&self, address: ResolvedAddress) {
        let mut handle = self.shared.transport.create_handle();
        let target = SocketAddr::new(address.ip, self.port());
        let socket = self.clone();
        let started = handle.connect(
            target,
            Box::new(move |result| socket.after_connect(result)),
        );
        {
            let mut core = self.core_mut();
            core.resolved = Some(address);
            core.state = SocketState::Connecting;
            core.handle = Some(handle);
        }
        debug!(%target, family = %address.family, "connecting");
        if let Err(source) = started {
            self.fail(TcpError::connect(self.endpoint(), source));
        }
    }

    fn after_connect(&self, result: Result<(), RawError>) {
        if self.state() != SocketState::Connecting {
            return;
        }
        match result {
            Ok(()) => self.open_established(),
            Err(source) => self.fail(TcpError::connect(self.endpoint(), source)),
        }
    }

    /// 建连确认后的固定顺序：启动读泵、冲刷排队写入、应用推迟的 keepalive、投递 `connect`。
    fn open_established(&self) {
        let keep_alive = {
            let mut core = self.core_mut();
            core.state = SocketState::Open;
            core.keep_alive.take()
        };
        debug!(host = %self.host(), port = self.port(), "socket open");

        self.start_reading();
        self.flush_pending_writes();
        if let Some((enable, delay_secs)) = keep_alive {
            let mut core = self.core_mut();
            if core.state == SocketState::Open
                && let Some(handle) = core.handle.as_mut()
                && let Err(error) = handle.set_keep_alive(enable, delay_secs)
            {
                warn!(%error, "deferred set_keep_alive failed");
            }
        }
        if self.state() == SocketState::Open {
            self.shared.events.connect.emit(&());
        }
    }

    fn start_reading(&self) {
        let failure = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state != SocketState::Open || core.reading || !core.read_demand {
                return;
            }
            let Some(handle) = core.handle.as_mut() else {
                return;
            };
            let socket = self.clone();
            match handle.read_start(Box::new(move |signal| socket.on_read(signal))) {
                Ok(()) => {
                    core.reading = true;
                    None
                }
                Err(source) => Some(source),
            }
        };
        if let Some(source) = failure {
            self.fail(TcpError::Read { source });
        }
    }

    fn on_read(&self, signal: ReadSignal) {
        match signal {
            ReadSignal::Data(chunk) => self.deliver(chunk),
            ReadSignal::Empty => trace!("empty read, waiting for more"),
            ReadSignal::Eof => self.end_of_stream("eof"),
            ReadSignal::Failed(source) if source.is_eof() => self.end_of_stream("eof"),
            ReadSignal::Failed(source) if source.is_connection_reset() => {
                self.end_of_stream("connection reset")
            }
            ReadSignal::Failed(source) => self.fail(TcpError::Read { source }),
        }
    }

    fn deliver(&self, chunk: Bytes) {
        {
            let mut core = self.core_mut();
            if core.state != SocketState::Open {
                return;
            }
            core.bytes_read += chunk.len() as u64;
        }
        let demands = self.shared.events.data.emit(&chunk);
        if demands.is_empty() || demands.contains(&ReadDemand::Pause) {
            self.pause();
        }
    }

    fn end_of_stream(&self, reason: &'static str) {
        debug!(reason, host = %self.host(), port = self.port(), "peer finished the stream");
        self.teardown();
    }

    fn submit(&self, payload: Bytes, on_written: Option<WriteCompletion>) {
        let state = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            let queue = match core.state {
                SocketState::Unconnected | SocketState::Resolving | SocketState::Connecting => {
                    true
                }
                // 冲刷排队写入期间的新写入继续排在队尾。
                SocketState::Open => !core.pending_writes.is_empty(),
                SocketState::Closing | SocketState::Closed => false,
            };
            if queue {
                core.pending_bytes += payload.len();
                core.pending_writes.push_back(PendingWrite {
                    payload,
                    on_written,
                });
                return;
            }
            core.state
        };

        if state == SocketState::Open {
            self.write_now(payload, on_written);
        } else {
            debug!(?state, "write rejected on a closed socket");
            complete(on_written, Err(TcpError::closed()));
        }
    }

    fn write_now(&self, payload: Bytes, on_written: Option<WriteCompletion>) {
        let slot: Rc<WriteSlot> = Rc::new(RefCell::new(on_written));
        let socket = self.clone();
        let deferred = Rc::clone(&slot);
        let submitted = {
            let mut core = self.core_mut();
            match core.handle.as_mut() {
                Some(handle) => handle.write(
                    payload,
                    Box::new(move |result| socket.after_write(result, &deferred)),
                ),
                None => Err(RawError::not_connected()),
            }
        };

        match submitted {
            Ok(WriteStatus::Flushed) => {
                let on_written = slot.borrow_mut().take();
                complete(on_written, Ok(()));
            }
            Ok(WriteStatus::Queued) => {}
            Err(source) => {
                let error = TcpError::Write { source };
                let on_written = slot.borrow_mut().take();
                complete(on_written, Err(error.clone()));
                self.fail(error);
            }
        }
    }

    fn after_write(&self, result: Result<(), RawError>, slot: &WriteSlot) {
        let on_written = slot.borrow_mut().take();
        match result {
            Ok(()) => complete(on_written, Ok(())),
            Err(_) if matches!(self.state(), SocketState::Closing | SocketState::Closed) => {
                complete(on_written, Err(TcpError::closed()));
            }
            Err(source) => {
                let error = TcpError::Write { source };
                complete(on_written, Err(error.clone()));
                self.fail(error);
            }
        }
    }

    fn flush_pending_writes(&self) {
        loop {
            let next = {
                let mut core = self.core_mut();
                if core.state != SocketState::Open {
                    return;
                }
                let next = core.pending_writes.pop_front();
                if let Some(write) = &next {
                    core.pending_bytes = core.pending_bytes.saturating_sub(write.payload.len());
                }
                next
            };
            let Some(write) = next else {
                return;
            };
            self.write_now(write.payload, write.on_written);
        }
    }

    /// 致命错误路径：投递 `error` 后执行与优雅关闭相同的拆除流程。
    pub(crate) fn fail(&self, error: TcpError) {
        {
            let mut core = self.core_mut();
            if core.state == SocketState::Closed {
                debug!(%error, "error on a closed socket ignored");
                return;
            }
            core.had_error = true;
        }
        warn!(code = error.code(), %error, "socket failed");
        if !emit_error(&self.shared.events.error, &error) {
            self.core_mut().unhandled.get_or_insert(error);
        }
        self.teardown();
    }

    fn teardown(&self) {
        let (pending, has_handle) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if matches!(core.state, SocketState::Closing | SocketState::Closed) {
                return;
            }
            trace!(state = ?core.state, "socket closing");
            core.state = SocketState::Closing;
            core.reading = false;
            core.pending_bytes = 0;
            (mem::take(&mut core.pending_writes), core.handle.is_some())
        };

        for write in pending {
            complete(write.on_written, Err(TcpError::closed()));
        }

        if !has_handle {
            self.finish_close();
            return;
        }
        let socket = self.clone();
        if let Some(handle) = self.core_mut().handle.as_mut() {
            handle.close(Box::new(move || socket.finish_close()));
        }
    }

    fn finish_close(&self) {
        let (handle, had_error, callbacks, server, unhandled) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state == SocketState::Closed {
                return;
            }
            core.state = SocketState::Closed;
            core.reading = false;
            core.local = None;
            core.remote = None;
            (
                core.handle.take(),
                core.had_error,
                mem::take(&mut core.close_callbacks),
                core.server.clone(),
                core.unhandled.take(),
            )
        };
        drop(handle);

        if let Some(server) = server.and_then(|weak| weak.upgrade()) {
            // 下溢在 release_connection 内部以 error 级别记录。
            let released = Server::from_shared(server).release_connection();
            debug_assert!(released.is_ok(), "socket released from its server twice");
        }
        debug!(host = %self.host(), port = self.port(), had_error, "socket closed");

        self.shared.events.close.emit(&had_error);
        for callback in callbacks {
            callback();
        }
        self.shared.events.clear();

        if let Some(error) = unhandled {
            raise_unhandled(&error, self.shared.transport.config().unhandled_error);
        }
    }
}

fn complete(on_written: Option<WriteCompletion>, result: Result<(), TcpError>) {
    if let Some(on_written) = on_written {
        on_written(result);
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Socket")
            .field("state", &core.state)
            .field("host", &core.host)
            .field("port", &core.port)
            .field("bytes_read", &core.bytes_read)
            .finish_non_exhaustive()
    }
}
