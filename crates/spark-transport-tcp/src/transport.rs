use std::fmt;
use std::rc::Rc;

use spark_transport::{HandleFactory, ListenerCoordinator, NameResolver, RawTcpHandle};
use thiserror::Error;

use crate::config::TransportConfig;
use crate::server::{Server, ServerOptions};
use crate::socket::{Socket, SocketOptions};

/// Socket 与 Server 共享的能力注册表。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 调用方显式选择使用哪一套句柄工厂、解析器与集群协调者，而不是替换某个进程级
///   默认构造函数；同一进程内可以并存多个互不影响的 `Transport`。
///
/// ## 契约 (What)
/// - `connect`：创建 Socket 并立即开始建连；
/// - `serve`：创建 Server、注册 `connection` 监听器并开始监听；
/// - 克隆开销为一次 `Rc` 计数递增，所有克隆共享同一组能力。
///
/// ## 注意事项 (Trade-offs)
/// - `Transport` 是 `!Send` 的，只能在创建它的线程（Tokio `LocalSet`）中使用。
#[derive(Clone)]
pub struct Transport {
    inner: Rc<TransportInner>,
}

struct TransportInner {
    config: TransportConfig,
    handles: Rc<dyn HandleFactory>,
    resolver: Rc<dyn NameResolver>,
    coordinator: Option<Rc<dyn ListenerCoordinator>>,
}

impl Transport {
    /// 使用 Tokio 句柄与 Tokio 解析器的默认组合。
    #[cfg(feature = "runtime-tokio")]
    pub fn tokio(config: TransportConfig) -> Self {
        let handles = crate::runtime::TokioHandleFactory::new(config.read_buffer_size);
        Self {
            inner: Rc::new(TransportInner {
                config,
                handles: Rc::new(handles),
                resolver: Rc::new(crate::runtime::TokioResolver::new()),
                coordinator: None,
            }),
        }
    }

    pub fn builder() -> TransportBuilder {
        TransportBuilder::default()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn connect(&self, options: SocketOptions) -> Socket {
        let socket = Socket::new(self, options);
        socket.connect();
        socket
    }

    /// 创建 Server，把 `on_connection` 注册为 `connection` 监听器后开始监听。
    pub fn serve<F>(&self, options: ServerOptions, on_connection: F) -> Result<Server, crate::TcpError>
    where
        F: FnMut(&Socket) + 'static,
    {
        let server = Server::new(self, options);
        server.on_connection(on_connection);
        server.listen()?;
        Ok(server)
    }

    pub(crate) fn create_handle(&self) -> Box<dyn RawTcpHandle> {
        self.inner.handles.create()
    }

    pub(crate) fn resolver(&self) -> &dyn NameResolver {
        self.inner.resolver.as_ref()
    }

    pub(crate) fn coordinator(&self) -> Option<&dyn ListenerCoordinator> {
        self.inner.coordinator.as_deref()
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("config", &self.inner.config)
            .field("coordinator", &self.inner.coordinator.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("transport builder requires a handle factory")]
    MissingHandleFactory,
    #[error("transport builder requires a name resolver")]
    MissingResolver,
}

/// [`Transport`] 的构建器；启用 `runtime-tokio` 时缺省能力回落到 Tokio 实现。
#[derive(Default)]
pub struct TransportBuilder {
    config: TransportConfig,
    handles: Option<Rc<dyn HandleFactory>>,
    resolver: Option<Rc<dyn NameResolver>>,
    coordinator: Option<Rc<dyn ListenerCoordinator>>,
}

impl TransportBuilder {
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    pub fn handle_factory(mut self, handles: impl HandleFactory + 'static) -> Self {
        self.handles = Some(Rc::new(handles));
        self
    }

    pub fn resolver(mut self, resolver: impl NameResolver + 'static) -> Self {
        self.resolver = Some(Rc::new(resolver));
        self
    }

    pub fn coordinator(mut self, coordinator: impl ListenerCoordinator + 'static) -> Self {
        self.coordinator = Some(Rc::new(coordinator));
        self
    }

    pub fn build(self) -> Result<Transport, BuildError> {
        let Self {
            config,
            handles,
            resolver,
            coordinator,
        } = self;

        #[cfg(feature = "runtime-tokio")]
        let handles = handles.or_else(|| {
            let factory = crate::runtime::TokioHandleFactory::new(config.read_buffer_size);
            Some(Rc::new(factory) as Rc<dyn HandleFactory>)
        });
        #[cfg(feature = "runtime-tokio")]
        let resolver = resolver
            .or_else(|| Some(Rc::new(crate::runtime::TokioResolver::new()) as Rc<dyn NameResolver>));

        Ok(Transport {
            inner: Rc::new(TransportInner {
                handles: handles.ok_or(BuildError::MissingHandleFactory)?,
                resolver: resolver.ok_or(BuildError::MissingResolver)?,
                coordinator,
                config,
            }),
        })
    }
}

impl fmt::Debug for TransportBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBuilder")
            .field("config", &self.config)
            .field("handles", &self.handles.is_some())
            .field("resolver", &self.resolver.is_some())
            .field("coordinator", &self.coordinator.is_some())
            .finish()
    }
}
