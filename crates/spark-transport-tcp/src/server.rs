//! # server 模块说明
//!
//! ## 角色定位（Why）
//! - [`Server`] 独占一个监听句柄，为每个入站连接构造 [`Socket`] 并通过 `connection`
//!   事件交给应用层，同时维护连接计数以投递 `idle`；
//! - 集群 Worker 进程中，Server 把绑定步骤交给 [`ListenerCoordinator`]，
//!   再独立校验授予句柄的端口。
//!
//! ## 状态机（What）
//! - `Idle → Binding → Listening → Closing → Closed`；
//! - 绑定或监听失败：投递 `error`，随后关闭，`listening` 永不触发；
//! - `close` 幂等：关闭中传入的回调排队，已关闭后传入的回调立即执行，`close` 事件恰好一次。

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::io::ErrorKind;
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;

use spark_transport::{
    AddressFamily, Endpoint, ListenerCoordinator, ListenerDescriptor, ListenerFlags, RawError,
    RawTcpHandle, is_wildcard_host, literal_ip,
};
use tracing::{debug, error, info, trace, warn};

use crate::error::{ServerError, TcpError};
use crate::events::{Emitter, ListenerId, emit_error, raise_unhandled};
use crate::socket::Socket;
use crate::transport::Transport;

/// Server 生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServerState {
    Idle,
    Binding,
    Listening,
    Closing,
    Closed,
}

/// 监听目标；缺省字段取自 [`TransportConfig`](crate::TransportConfig)。
///
/// `host` 为空串或 `*` 时绑定全部 IPv4 网卡；非字面量主机名会以绑定错误失败。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<u32>,
    pub flags: ListenerFlags,
}

impl ServerOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn with_flags(mut self, flags: ListenerFlags) -> Self {
        self.flags = flags;
        self
    }
}

struct ServerCore {
    state: ServerState,
    handle: Option<Box<dyn RawTcpHandle>>,
    host: String,
    port: u16,
    backlog: u32,
    flags: ListenerFlags,
    connection_count: usize,
    close_callbacks: Vec<Box<dyn FnOnce()>>,
    local: Option<SocketAddr>,
}

#[derive(Default)]
struct ServerEvents {
    listening: Emitter<()>,
    connection: Emitter<Socket>,
    close: Emitter<()>,
    error: Emitter<TcpError>,
    idle: Emitter<()>,
}

pub(crate) struct ServerShared {
    core: RefCell<ServerCore>,
    events: ServerEvents,
    transport: Transport,
}

/// 一个监听中的 TCP 端点。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“绑定 → 监听 → 接受 → 计数 → 关闭”收拢为一个对象，应用层只需关心
///   `connection` 事件中交出的 [`Socket`]。
///
/// ## 契约 (What)
/// - `listen`：同步绑定时返回结果，失败同时投递给已注册的 `error` 监听器；
///   集群路径在授予句柄后异步完成，失败只经由 `error` 事件报告；
/// - 接受错误投递 `error`，监听继续；
/// - 关闭 Server 不会关闭已接受的 Socket，它们各自关闭时递减连接计数，
///   计数从 1 变为 0 时投递一次 `idle`。
///
/// ## 注意事项 (Trade-offs)
/// - 监听句柄的接受回调持有 Server，监听期间即使丢弃所有 `Server` 克隆也会继续接受连接，
///   需要显式 `close`。
#[derive(Clone)]
pub struct Server {
    shared: Rc<ServerShared>,
}

impl Server {
    pub fn new(transport: &Transport, options: ServerOptions) -> Self {
        let config = transport.config();
        let core = ServerCore {
            state: ServerState::Idle,
            handle: None,
            host: options
                .host
                .unwrap_or_else(|| config.default_server_host.clone()),
            port: options.port.unwrap_or(config.default_port),
            backlog: options.backlog.unwrap_or(config.backlog),
            flags: options.flags,
            connection_count: 0,
            close_callbacks: Vec::new(),
            local: None,
        };
        Self {
            shared: Rc::new(ServerShared {
                core: RefCell::new(core),
                events: ServerEvents::default(),
                transport: transport.clone(),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Rc<ServerShared>) -> Self {
        Self { shared }
    }

    /// 绑定并开始监听。
    ///
    /// # 逻辑解析（How）
    /// 1. 仅 `Idle` 状态响应，其余状态直接返回 `Ok(())`；
    /// 2. Worker 角色、存在协调者且未要求独占时，向协调者申请句柄后返回，
    ///    结果在授予回调中处理；
    /// 3. 否则按主机字面量选择地址族直接绑定，随后监听并投递 `listening`。
    pub fn listen(&self) -> Result<(), TcpError> {
        let (state, host, port, flags) = {
            let core = self.core();
            (core.state, core.host.clone(), core.port, core.flags)
        };
        if state != ServerState::Idle {
            debug!(?state, "listen ignored: server already started");
            return Ok(());
        }
        self.core_mut().state = ServerState::Binding;

        let transport = &self.shared.transport;
        if transport.config().role.is_worker()
            && !flags.exclusive
            && let Some(coordinator) = transport.coordinator()
        {
            let family = AddressFamily::of_literal(&host).unwrap_or(AddressFamily::Ipv4);
            self.request_shared_listener(
                coordinator,
                ListenerDescriptor {
                    host,
                    port,
                    family,
                    flags,
                },
            );
            return Ok(());
        }

        let result = self
            .bind_direct(&host, port)
            .and_then(|handle| self.start_listening(handle));
        if let Err(error) = &result {
            self.abort_listen(error, false);
        }
        result
    }

    // ---- 事件注册 ----

    pub fn on_listening<F>(&self, mut listener: F) -> ListenerId
    where
        F: FnMut() + 'static,
    {
        self.shared.events.listening.on(move |_| listener())
    }

    pub fn on_connection<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&Socket) + 'static,
    {
        self.shared.events.connection.on(listener)
    }

    pub fn on_close<F>(&self, mut listener: F) -> ListenerId
    where
        F: FnMut() + 'static,
    {
        self.shared.events.close.on(move |_| listener())
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&TcpError) + 'static,
    {
        self.shared.events.error.on(listener)
    }

    pub fn on_idle<F>(&self, mut listener: F) -> ListenerId
    where
        F: FnMut() + 'static,
    {
        self.shared.events.idle.on(move |_| listener())
    }

    // ---- 访问器 ----

    pub fn state(&self) -> ServerState {
        self.core().state
    }

    pub fn connection_count(&self) -> usize {
        self.core().connection_count
    }

    pub fn host(&self) -> String {
        self.core().host.clone()
    }

    /// 配置的端口；端口 0 的实际值见 [`Server::local_address`]。
    pub fn port(&self) -> u16 {
        self.core().port
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        let mut guard = self.core_mut();
        let core = &mut *guard;
        if core.local.is_none() {
            core.local = core.handle.as_ref().and_then(|h| h.sock_name().ok());
        }
        core.local
    }

    // ---- 关闭 ----

    pub fn close(&self) {
        self.close_inner(None);
    }

    pub fn close_with<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        self.close_inner(Some(Box::new(callback)));
    }

    fn close_inner(&self, callback: Option<Box<dyn FnOnce()>>) {
        let state = self.state();
        if state == ServerState::Closed {
            if let Some(callback) = callback {
                callback();
            }
            return;
        }

        let has_handle = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            core.close_callbacks.extend(callback);
            if state == ServerState::Closing {
                return;
            }
            core.state = ServerState::Closing;
            core.handle.is_some()
        };
        trace!(?state, "server closing");

        if !has_handle {
            self.finish_close();
            return;
        }
        let server = self.clone();
        if let Some(handle) = self.core_mut().handle.as_mut() {
            handle.close(Box::new(move || server.finish_close()));
        }
    }

    // ---- 连接计数 ----

    /// Socket 关闭时调用，计数从 1 变为 0 时投递 `idle`。
    pub(crate) fn release_connection(&self) -> Result<(), ServerError> {
        let remaining = {
            let mut core = self.core_mut();
            let current = core.connection_count;
            match current.checked_sub(1) {
                Some(remaining) => {
                    core.connection_count = remaining;
                    remaining
                }
                None => {
                    drop(core);
                    error!(host = %self.host(), port = self.port(), "connection count underflow");
                    return Err(ServerError::ConnectionCountUnderflow);
                }
            }
        };
        trace!(remaining, "connection released");
        if remaining == 0 {
            debug!(host = %self.host(), port = self.port(), "server idle");
            self.shared.events.idle.emit(&());
        }
        Ok(())
    }

    // ---- 内部流程 ----

    fn core(&self) -> Ref<'_, ServerCore> {
        self.shared.core.borrow()
    }

    fn core_mut(&self) -> RefMut<'_, ServerCore> {
        self.shared.core.borrow_mut()
    }

    fn endpoint(&self) -> Endpoint {
        let core = self.core();
        Endpoint::new(core.host.clone(), core.port)
    }

    fn bind_direct(&self, host: &str, port: u16) -> Result<Box<dyn RawTcpHandle>, TcpError> {
        let ip = if is_wildcard_host(host) {
            AddressFamily::Ipv4.unspecified()
        } else {
            literal_ip(host).ok_or_else(|| {
                let source = RawError::new(
                    ErrorKind::InvalidInput,
                    format!("{host} is not an IP address"),
                );
                TcpError::bind(self.endpoint(), source)
            })?
        };
        let mut handle = self.shared.transport.create_handle();
        handle
            .bind(SocketAddr::new(ip, port))
            .map_err(|source| TcpError::bind(self.endpoint(), source))?;
        Ok(handle)
    }

    fn start_listening(&self, mut handle: Box<dyn RawTcpHandle>) -> Result<(), TcpError> {
        let backlog = self.core().backlog;
        let server = self.clone();
        let started = handle.listen(
            backlog,
            Box::new(move |accepted| server.on_accepted(accepted)),
        );
        if let Err(source) = started {
            handle.close(Box::new(|| {}));
            return Err(TcpError::listen(self.endpoint(), source));
        }

        {
            let mut core = self.core_mut();
            core.state = ServerState::Listening;
            core.handle = Some(handle);
        }
        info!(
            host = %self.host(),
            port = self.port(),
            local = ?self.local_address(),
            "server listening"
        );
        self.shared.events.listening.emit(&());
        Ok(())
    }

    /// 投递错误并关闭；`strict` 为真时，关闭之后对无人接收的错误执行未处理错误策略。
    /// 同步 `listen` 已把错误返回给调用方，不需要该策略。
    fn abort_listen(&self, error: &TcpError, strict: bool) {
        warn!(code = error.code(), %error, "server failed to listen");
        let handled = emit_error(&self.shared.events.error, error);
        self.close();
        if strict && !handled {
            raise_unhandled(error, self.shared.transport.config().unhandled_error);
        }
    }

    fn on_accepted(&self, accepted: Result<Box<dyn RawTcpHandle>, RawError>) {
        if self.state() != ServerState::Listening {
            if let Ok(mut handle) = accepted {
                handle.close(Box::new(|| {}));
            }
            return;
        }
        match accepted {
            Ok(handle) => {
                let count = {
                    let mut core = self.core_mut();
                    core.connection_count += 1;
                    core.connection_count
                };
                let socket =
                    Socket::accepted(&self.shared.transport, handle, Rc::downgrade(&self.shared));
                trace!(count, remote = ?socket.remote_address(), "connection accepted");
                self.shared.events.connection.emit(&socket);
            }
            Err(source) => {
                let error = TcpError::Accept { source };
                warn!(code = error.code(), %error, "accept failed");
                if !emit_error(&self.shared.events.error, &error) {
                    raise_unhandled(&error, self.shared.transport.config().unhandled_error);
                }
            }
        }
    }

    fn request_shared_listener(
        &self,
        coordinator: &dyn ListenerCoordinator,
        descriptor: ListenerDescriptor,
    ) {
        debug!(
            host = %descriptor.host,
            port = descriptor.port,
            family = %descriptor.family,
            "requesting shared listener"
        );
        let server = self.clone();
        let requested_port = descriptor.port;
        coordinator.request_listener(
            descriptor,
            Box::new(move |granted| server.on_granted(requested_port, granted)),
        );
    }

    fn on_granted(&self, requested_port: u16, granted: Result<Box<dyn RawTcpHandle>, RawError>) {
        if self.state() != ServerState::Binding {
            if let Ok(mut handle) = granted {
                debug!("late listener grant released");
                handle.close(Box::new(|| {}));
            }
            return;
        }
        let result = granted
            .map_err(|source| TcpError::bind(self.endpoint(), source))
            .and_then(|handle| self.verify_grant(requested_port, handle))
            .and_then(|handle| self.start_listening(handle));
        if let Err(error) = result {
            self.abort_listen(&error, true);
        }
    }

    /// 端口 0 表示临时端口，跳过比对；句柄无法报告地址时信任协调者。
    fn verify_grant(
        &self,
        requested_port: u16,
        mut handle: Box<dyn RawTcpHandle>,
    ) -> Result<Box<dyn RawTcpHandle>, TcpError> {
        if requested_port == 0 {
            return Ok(handle);
        }
        match handle.sock_name() {
            Ok(bound) if bound.port() != requested_port => {
                handle.close(Box::new(|| {}));
                Err(TcpError::address_mismatch(self.endpoint(), bound.port()))
            }
            _ => Ok(handle),
        }
    }

    fn finish_close(&self) {
        let (handle, callbacks) = {
            let mut guard = self.core_mut();
            let core = &mut *guard;
            if core.state == ServerState::Closed {
                return;
            }
            core.state = ServerState::Closed;
            core.local = None;
            (core.handle.take(), mem::take(&mut core.close_callbacks))
        };
        drop(handle);
        debug!(host = %self.host(), port = self.port(), "server closed");

        self.shared.events.close.emit(&());
        for callback in callbacks {
            callback();
        }
        // 已接受的 Socket 仍会在关闭时递减计数，`idle` 与 `error` 监听器保留。
        self.shared.events.listening.clear();
        self.shared.events.connection.clear();
        self.shared.events.close.clear();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core();
        f.debug_struct("Server")
            .field("state", &core.state)
            .field("host", &core.host)
            .field("port", &core.port)
            .field("connection_count", &core.connection_count)
            .finish_non_exhaustive()
    }
}
