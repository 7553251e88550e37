//! # cluster 模块说明
//!
//! ## 角色定位（Why）
//! - 多个 Worker 共享同一逻辑端口时，内核层只允许存在一次 listen；
//!   [`SharedListenerRegistry`] 为每种绑定形状只绑定一次，然后为每个申请者复制一份本地句柄。
//!
//! ## 设计要求（What）
//! - 相同的 (host, port, family, flags) 复用同一个内核监听套接字；
//! - 授予结果经由 `spawn_local` 投递，不在 `request_listener` 内同步回调；
//! - 注册表只负责分发句柄，不管理任何连接生命周期。
//!
//! ## 注意事项（Trade-offs）
//! - 复制句柄使用 `try_clone`（`dup`），各 Worker 线程可以分别把副本注册到自己的反应器；
//!   注册表本身可跨线程共享，因此内部使用 `Arc<parking_lot::Mutex<_>>`。

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use spark_transport::{
    AddressFamily, GrantCallback, ListenerCoordinator, ListenerDescriptor, ListenerFlags,
    RawError, RawTcpHandle, is_wildcard_host, literal_ip,
};
use tokio::task::spawn_local;
use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::runtime::TokioTcpHandle;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ListenerKey {
    host: String,
    port: u16,
    family: AddressFamily,
    flags: ListenerFlags,
}

impl From<&ListenerDescriptor> for ListenerKey {
    fn from(descriptor: &ListenerDescriptor) -> Self {
        Self {
            host: descriptor.host.clone(),
            port: descriptor.port,
            family: descriptor.family,
            flags: descriptor.flags,
        }
    }
}

/// 进程内的集群监听协调者。
#[derive(Clone, Debug)]
pub struct SharedListenerRegistry {
    listeners: Arc<Mutex<HashMap<ListenerKey, TcpListener>>>,
    backlog: u32,
    read_buffer_size: usize,
}

impl SharedListenerRegistry {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            backlog: config.backlog,
            read_buffer_size: config.read_buffer_size,
        }
    }

    /// 释放绑定到 `port` 的全部内核监听套接字；已授予的副本仍然有效，直到各自关闭。
    ///
    /// `port` 既可以是申请时的端口，也可以是临时端口实际分配到的值。
    pub fn release(&self, port: u16) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|key, listener| {
            let bound = listener.local_addr().ok().map(|addr| addr.port());
            key.port != port && bound != Some(port)
        });
        let released = listeners.len() != before;
        if released {
            debug!(port, "shared listener released");
        }
        released
    }

    /// 当前持有的内核监听套接字的实际端口，升序排列。
    pub fn bound_ports(&self) -> Vec<u16> {
        let listeners = self.listeners.lock();
        let mut ports: Vec<u16> = listeners
            .values()
            .filter_map(|listener| listener.local_addr().ok())
            .map(|addr| addr.port())
            .collect();
        ports.sort_unstable();
        ports
    }

    fn acquire(&self, descriptor: &ListenerDescriptor) -> Result<Box<dyn RawTcpHandle>, RawError> {
        let mut listeners = self.listeners.lock();
        let listener = match listeners.entry(ListenerKey::from(descriptor)) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let listener = bind_shared(descriptor, self.backlog)?;
                info!(
                    host = %descriptor.host,
                    port = descriptor.port,
                    local = ?listener.local_addr().ok(),
                    "shared listener bound"
                );
                entry.insert(listener)
            }
        };
        let local = listener.try_clone()?;
        Ok(Box::new(TokioTcpHandle::from_listener(
            local,
            self.read_buffer_size,
        )))
    }
}

impl Default for SharedListenerRegistry {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

impl ListenerCoordinator for SharedListenerRegistry {
    fn request_listener(&self, descriptor: ListenerDescriptor, on_granted: GrantCallback) {
        let outcome = self.acquire(&descriptor);
        debug!(
            host = %descriptor.host,
            port = descriptor.port,
            granted = outcome.is_ok(),
            "listener request answered"
        );
        spawn_local(async move { on_granted(outcome) });
    }
}

fn bind_shared(descriptor: &ListenerDescriptor, backlog: u32) -> Result<TcpListener, RawError> {
    let ip = if is_wildcard_host(&descriptor.host) {
        descriptor.family.unspecified()
    } else {
        literal_ip(&descriptor.host).ok_or_else(|| {
            RawError::new(
                ErrorKind::InvalidInput,
                format!("{} is not an IP address", descriptor.host),
            )
        })?
    };
    let addr = SocketAddr::new(ip, descriptor.port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    if descriptor.family == AddressFamily::Ipv6 && descriptor.flags.ipv6_only {
        socket.set_only_v6(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(port: u16) -> ListenerDescriptor {
        ListenerDescriptor {
            host: "127.0.0.1".to_owned(),
            port,
            family: AddressFamily::Ipv4,
            flags: ListenerFlags::default(),
        }
    }

    #[test]
    fn identical_requests_share_one_kernel_listener() {
        let registry = SharedListenerRegistry::default();
        let first = registry.acquire(&descriptor(0)).unwrap();
        let second = registry.acquire(&descriptor(0)).unwrap();
        assert_eq!(registry.bound_ports().len(), 1);
        assert_eq!(
            first.sock_name().unwrap().port(),
            second.sock_name().unwrap().port()
        );

        let port = registry.bound_ports()[0];
        assert!(registry.release(port));
        assert!(registry.bound_ports().is_empty());
        assert!(!registry.release(port));
    }

    #[test]
    fn hostnames_are_rejected() {
        let registry = SharedListenerRegistry::default();
        let request = ListenerDescriptor {
            host: "localhost".to_owned(),
            ..descriptor(0)
        };
        let error = registry.acquire(&request).err().unwrap();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }
}
