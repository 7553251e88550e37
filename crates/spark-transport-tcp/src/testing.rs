//! 单元测试使用的脚本化能力替身：所有完成回调都由测试显式触发。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use spark_transport::{
    CloseCallback, ConnectCallback, ConnectionCallback, GrantCallback, HandleFactory,
    ListenerCoordinator, ListenerDescriptor, LookupCallback, LookupHints, NameResolver, RawError,
    RawTcpHandle, ReadCallback, ReadSignal, ResolvedAddress, WriteCallback, WriteStatus,
};

use crate::config::{TransportConfig, UnhandledErrorPolicy};
use crate::transport::Transport;

/// 句柄内部状态，测试通过 [`MockProbe`] 观察与驱动。
#[derive(Default)]
pub(crate) struct HandleState {
    pub bound: Option<SocketAddr>,
    pub backlog: Option<u32>,
    pub connect_target: Option<SocketAddr>,
    pub on_connect: Option<ConnectCallback>,
    pub on_connection: Option<ConnectionCallback>,
    pub on_read: Option<ReadCallback>,
    pub reading: bool,
    pub read_starts: usize,
    pub queued: VecDeque<(Bytes, WriteCallback)>,
    pub written: Vec<Bytes>,
    pub queue_writes: bool,
    pub keep_alive: Option<(bool, u32)>,
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub on_close: Option<CloseCallback>,
    pub close_requested: bool,
    pub fail_bind: Option<RawError>,
    pub fail_listen: Option<RawError>,
    pub fail_connect: Option<RawError>,
    pub fail_write: Option<RawError>,
}

#[derive(Clone, Default)]
pub(crate) struct MockProbe(pub Rc<RefCell<HandleState>>);

impl MockProbe {
    pub fn handle(&self) -> Box<dyn RawTcpHandle> {
        Box::new(MockHandle {
            state: Rc::clone(&self.0),
        })
    }

    pub fn complete_connect(&self, result: Result<(), RawError>) {
        let callback = self.0.borrow_mut().on_connect.take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    /// 投递一个读信号；回调期间若句柄仍在读取且没有换新回调，则放回原回调。
    pub fn push_read(&self, signal: ReadSignal) {
        let callback = self.0.borrow_mut().on_read.take();
        let Some(mut callback) = callback else {
            panic!("read pump is not running");
        };
        callback(signal);
        let mut state = self.0.borrow_mut();
        if state.reading && state.on_read.is_none() {
            state.on_read = Some(callback);
        }
    }

    pub fn flush_write(&self, result: Result<(), RawError>) {
        let next = self.0.borrow_mut().queued.pop_front();
        if let Some((payload, callback)) = next {
            if result.is_ok() {
                self.0.borrow_mut().written.push(payload);
            }
            callback(result);
        }
    }

    pub fn accept(&self, result: Result<Box<dyn RawTcpHandle>, RawError>) {
        let callback = self.0.borrow_mut().on_connection.take();
        let Some(mut callback) = callback else {
            panic!("handle is not listening");
        };
        callback(result);
        let mut state = self.0.borrow_mut();
        if state.on_connection.is_none() && !state.close_requested {
            state.on_connection = Some(callback);
        }
    }

    /// 完成关闭：先以取消错误完成排队写入，再调用关闭确认回调。
    pub fn complete_close(&self) {
        let (queued, on_close) = {
            let mut state = self.0.borrow_mut();
            (std::mem::take(&mut state.queued), state.on_close.take())
        };
        for (_, callback) in queued {
            callback(Err(RawError::cancelled()));
        }
        if let Some(on_close) = on_close {
            on_close();
        }
    }

    pub fn written(&self) -> Vec<Bytes> {
        self.0.borrow().written.clone()
    }

    pub fn is_reading(&self) -> bool {
        self.0.borrow().reading
    }

    pub fn close_requested(&self) -> bool {
        self.0.borrow().close_requested
    }
}

struct MockHandle {
    state: Rc<RefCell<HandleState>>,
}

impl RawTcpHandle for MockHandle {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_bind.clone() {
            return Err(error);
        }
        state.bound = Some(addr);
        state.local.get_or_insert(addr);
        Ok(())
    }

    fn listen(&mut self, backlog: u32, on_connection: ConnectionCallback) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_listen.clone() {
            return Err(error);
        }
        state.backlog = Some(backlog);
        state.on_connection = Some(on_connection);
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr, on_complete: ConnectCallback) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        state.connect_target = Some(addr);
        if let Some(error) = state.fail_connect.clone() {
            return Err(error);
        }
        state.peer = Some(addr);
        state.on_connect = Some(on_complete);
        Ok(())
    }

    fn read_start(&mut self, on_read: ReadCallback) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        state.reading = true;
        state.read_starts += 1;
        state.on_read = Some(on_read);
        Ok(())
    }

    fn read_stop(&mut self) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        state.reading = false;
        state.on_read = None;
        Ok(())
    }

    fn write(&mut self, payload: Bytes, on_flushed: WriteCallback) -> Result<WriteStatus, RawError> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.fail_write.clone() {
            return Err(error);
        }
        if state.queue_writes || !state.queued.is_empty() {
            state.queued.push_back((payload, on_flushed));
            return Ok(WriteStatus::Queued);
        }
        state.written.push(payload);
        Ok(WriteStatus::Flushed)
    }

    fn write_queue_size(&self) -> usize {
        self.state
            .borrow()
            .queued
            .iter()
            .map(|(payload, _)| payload.len())
            .sum()
    }

    fn peer_name(&self) -> Result<SocketAddr, RawError> {
        self.state.borrow().peer.ok_or_else(RawError::not_connected)
    }

    fn sock_name(&self) -> Result<SocketAddr, RawError> {
        self.state.borrow().local.ok_or_else(RawError::not_connected)
    }

    fn set_keep_alive(&mut self, enable: bool, delay_secs: u32) -> Result<(), RawError> {
        self.state.borrow_mut().keep_alive = Some((enable, delay_secs));
        Ok(())
    }

    /// 建连回调保留在探针中，测试可以在关闭之后再触发它，模拟建连完成与关闭竞争。
    fn close(&mut self, on_closed: CloseCallback) {
        let mut state = self.state.borrow_mut();
        state.close_requested = true;
        state.reading = false;
        state.on_read = None;
        state.on_connection = None;
        state.on_close = Some(on_closed);
    }
}

/// 记录每个新建句柄的工厂；`template` 中的失败注入会复制到新句柄。
#[derive(Clone, Default)]
pub(crate) struct MockFactory {
    pub created: Rc<RefCell<Vec<MockProbe>>>,
    pub template: Rc<RefCell<HandleTemplate>>,
}

#[derive(Clone, Default)]
pub(crate) struct HandleTemplate {
    pub fail_bind: Option<RawError>,
    pub fail_listen: Option<RawError>,
    pub fail_connect: Option<RawError>,
    pub local: Option<SocketAddr>,
}

impl MockFactory {
    pub fn probe(&self, index: usize) -> MockProbe {
        self.created.borrow()[index].clone()
    }

    pub fn created_count(&self) -> usize {
        self.created.borrow().len()
    }
}

impl HandleFactory for MockFactory {
    fn create(&self) -> Box<dyn RawTcpHandle> {
        let template = self.template.borrow().clone();
        let probe = MockProbe::default();
        {
            let mut state = probe.0.borrow_mut();
            state.fail_bind = template.fail_bind;
            state.fail_listen = template.fail_listen;
            state.fail_connect = template.fail_connect;
            state.local = template.local;
        }
        self.created.borrow_mut().push(probe.clone());
        probe.handle()
    }
}

type PendingLookup = (String, LookupHints, LookupCallback);

#[derive(Clone, Default)]
pub(crate) struct MockResolver {
    pub pending: Rc<RefCell<VecDeque<PendingLookup>>>,
}

impl MockResolver {
    pub fn complete(&self, outcome: Result<ResolvedAddress, RawError>) -> String {
        let next = self.pending.borrow_mut().pop_front();
        let Some((host, _, callback)) = next else {
            panic!("no lookup in flight");
        };
        callback(outcome);
        host
    }

    pub fn last_hints(&self) -> Option<LookupHints> {
        self.pending.borrow().back().map(|(_, hints, _)| *hints)
    }
}

impl NameResolver for MockResolver {
    fn lookup(&self, host: &str, hints: LookupHints, on_resolved: LookupCallback) {
        self.pending
            .borrow_mut()
            .push_back((host.to_owned(), hints, on_resolved));
    }
}

#[derive(Clone, Default)]
pub(crate) struct MockCoordinator {
    pub requests: Rc<RefCell<VecDeque<(ListenerDescriptor, GrantCallback)>>>,
}

impl MockCoordinator {
    pub fn grant(&self, outcome: Result<Box<dyn RawTcpHandle>, RawError>) -> ListenerDescriptor {
        let next = self.requests.borrow_mut().pop_front();
        let Some((descriptor, callback)) = next else {
            panic!("no listener request in flight");
        };
        callback(outcome);
        descriptor
    }

    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

impl ListenerCoordinator for MockCoordinator {
    fn request_listener(&self, descriptor: ListenerDescriptor, on_granted: GrantCallback) {
        self.requests
            .borrow_mut()
            .push_back((descriptor, on_granted));
    }
}

/// 测试夹具：一组共享的替身与基于它们构建的 [`Transport`]。
pub(crate) struct Harness {
    pub factory: MockFactory,
    pub resolver: MockResolver,
    pub coordinator: MockCoordinator,
    pub transport: Transport,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TransportConfig::default().with_unhandled_error(UnhandledErrorPolicy::Log))
    }

    pub fn with_config(config: TransportConfig) -> Self {
        let factory = MockFactory::default();
        let resolver = MockResolver::default();
        let coordinator = MockCoordinator::default();
        let transport = Transport::builder()
            .config(config)
            .handle_factory(factory.clone())
            .resolver(resolver.clone())
            .coordinator(coordinator.clone())
            .build()
            .expect("mock transport");
        Self {
            factory,
            resolver,
            coordinator,
            transport,
        }
    }
}
