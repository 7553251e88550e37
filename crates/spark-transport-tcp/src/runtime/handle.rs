use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::mem;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use spark_transport::{
    CloseCallback, ConnectCallback, ConnectionCallback, HandleFactory, RawError, RawTcpHandle,
    ReadCallback, ReadSignal, WriteCallback, WriteStatus,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, spawn_local};
use tracing::{trace, warn};

/// 接受失败（例如文件描述符耗尽）后的退避时长，避免空转。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

enum Io {
    Fresh,
    Bound(Socket),
    /// 集群协调者授予、尚未交给 Tokio 反应器的监听套接字。
    Shared(std::net::TcpListener),
    Listening(Rc<TcpListener>),
    Connecting,
    Stream(Rc<TcpStream>),
    Closed,
}

struct QueuedWrite {
    payload: Bytes,
    on_flushed: WriteCallback,
}

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    accept: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
    flush: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for task in [
            self.connect.take(),
            self.accept.take(),
            self.pump.take(),
            self.flush.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct HandleState {
    io: Io,
    queue: VecDeque<QueuedWrite>,
    queued_bytes: usize,
    read_active: Option<Rc<Cell<bool>>>,
    tasks: Tasks,
    closed: bool,
}

/// 基于 Tokio 的原始 TCP 句柄。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 以 Tokio 的非阻塞 `TcpStream`/`TcpListener` 实现 [`RawTcpHandle`]，
///   绑定阶段借助 `socket2` 设置 `SO_REUSEADDR`，keepalive 通过 `SockRef` 下发。
///
/// ## 逻辑 (How)
/// - 建连、接受、读泵与写冲刷各自是一个 `spawn_local` 任务，完成回调只在任务中调用，
///   从不在发起调用内部同步触发；
/// - `write` 先尝试 `try_write` 直接写入内核，写不完的部分进入发送队列并由冲刷任务
///   在可写时继续，队列按提交顺序完成；
/// - 读泵每轮读取前检查“仍在读取”标志，`read_stop` 之后不会再投递数据；
/// - `close` 中止全部任务，在下一轮事件循环中以 [`RawError::cancelled`] 完成队列中的写入，
///   最后调用关闭确认回调。
///
/// ## 契约 (What)
/// - **前置条件**：必须在 current-thread Tokio 运行时的 `LocalSet` 中使用；
/// - `read_buffer_size` 为单次读取的上限。
///
/// ## 注意事项 (Trade-offs)
/// - 写入字节先在用户态队列中等待，`write_queue_size` 不包含内核发送缓冲中的字节。
pub struct TokioTcpHandle {
    state: Rc<RefCell<HandleState>>,
    read_buffer_size: usize,
}

impl TokioTcpHandle {
    pub fn new(read_buffer_size: usize) -> Self {
        Self::with_io(Io::Fresh, read_buffer_size)
    }

    /// 包装已建立的连接，例如监听器接受的流。
    pub fn from_stream(stream: TcpStream, read_buffer_size: usize) -> Self {
        Self::with_io(Io::Stream(Rc::new(stream)), read_buffer_size)
    }

    /// 包装已绑定并处于监听状态的标准库监听器，`listen` 时才注册到 Tokio。
    pub fn from_listener(listener: std::net::TcpListener, read_buffer_size: usize) -> Self {
        Self::with_io(Io::Shared(listener), read_buffer_size)
    }

    fn with_io(io: Io, read_buffer_size: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(HandleState {
                io,
                queue: VecDeque::new(),
                queued_bytes: 0,
                read_active: None,
                tasks: Tasks::default(),
                closed: false,
            })),
            read_buffer_size: read_buffer_size.max(1),
        }
    }

    fn stream(&self) -> Result<Rc<TcpStream>, RawError> {
        match &self.state.borrow().io {
            Io::Stream(stream) => Ok(Rc::clone(stream)),
            _ => Err(RawError::not_connected()),
        }
    }
}

fn invalid_state(message: &str) -> RawError {
    RawError::new(ErrorKind::InvalidInput, message)
}

impl RawTcpHandle for TokioTcpHandle {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        if !matches!(state.io, Io::Fresh) {
            return Err(invalid_state("handle is already in use"));
        }
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        #[cfg(unix)]
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        state.io = Io::Bound(socket);
        Ok(())
    }

    fn listen(&mut self, backlog: u32, on_connection: ConnectionCallback) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        let listener = match mem::replace(&mut state.io, Io::Closed) {
            Io::Bound(socket) => {
                let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
                if let Err(error) = socket.listen(backlog) {
                    state.io = Io::Bound(socket);
                    return Err(error.into());
                }
                TcpListener::from_std(socket.into())?
            }
            Io::Shared(listener) => {
                listener.set_nonblocking(true)?;
                TcpListener::from_std(listener)?
            }
            other => {
                state.io = other;
                return Err(invalid_state("handle is not bound"));
            }
        };
        let listener = Rc::new(listener);
        state.io = Io::Listening(Rc::clone(&listener));
        state.tasks.accept = Some(spawn_local(accept_loop(
            listener,
            on_connection,
            self.read_buffer_size,
        )));
        Ok(())
    }

    fn connect(&mut self, addr: SocketAddr, on_complete: ConnectCallback) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        if !matches!(state.io, Io::Fresh) {
            return Err(invalid_state("handle is already in use"));
        }
        state.io = Io::Connecting;
        let shared = Rc::clone(&self.state);
        state.tasks.connect = Some(spawn_local(async move {
            let result = match TcpStream::connect(addr).await {
                Ok(stream) => {
                    let mut state = shared.borrow_mut();
                    if state.closed {
                        return;
                    }
                    state.io = Io::Stream(Rc::new(stream));
                    state.tasks.connect = None;
                    Ok(())
                }
                Err(error) => Err(RawError::from(error)),
            };
            on_complete(result);
        }));
        Ok(())
    }

    fn read_start(&mut self, on_read: ReadCallback) -> Result<(), RawError> {
        let stream = self.stream()?;
        let mut state = self.state.borrow_mut();
        if let Some(previous) = state.read_active.take() {
            previous.set(false);
        }
        if let Some(pump) = state.tasks.pump.take() {
            pump.abort();
        }
        let active = Rc::new(Cell::new(true));
        state.read_active = Some(Rc::clone(&active));
        state.tasks.pump = Some(spawn_local(read_pump(
            stream,
            on_read,
            active,
            self.read_buffer_size,
        )));
        Ok(())
    }

    fn read_stop(&mut self) -> Result<(), RawError> {
        let mut state = self.state.borrow_mut();
        if let Some(active) = state.read_active.take() {
            active.set(false);
        }
        if let Some(pump) = state.tasks.pump.take() {
            pump.abort();
        }
        Ok(())
    }

    fn write(&mut self, payload: Bytes, on_flushed: WriteCallback) -> Result<WriteStatus, RawError> {
        let stream = self.stream()?;
        let mut state = self.state.borrow_mut();
        let mut remaining = payload;

        if state.queue.is_empty() {
            while !remaining.is_empty() {
                match stream.try_write(&remaining) {
                    Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                    Ok(written) => remaining.advance(written),
                    Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                    Err(error) => return Err(error.into()),
                }
            }
            if remaining.is_empty() {
                return Ok(WriteStatus::Flushed);
            }
        }

        trace!(bytes = remaining.len(), "write queued");
        state.queued_bytes += remaining.len();
        state.queue.push_back(QueuedWrite {
            payload: remaining,
            on_flushed,
        });
        if state.tasks.flush.is_none() {
            state.tasks.flush = Some(spawn_local(flush_queue(Rc::clone(&self.state), stream)));
        }
        Ok(WriteStatus::Queued)
    }

    fn write_queue_size(&self) -> usize {
        self.state.borrow().queued_bytes
    }

    fn peer_name(&self) -> Result<SocketAddr, RawError> {
        match &self.state.borrow().io {
            Io::Stream(stream) => Ok(stream.peer_addr()?),
            _ => Err(RawError::not_connected()),
        }
    }

    fn sock_name(&self) -> Result<SocketAddr, RawError> {
        match &self.state.borrow().io {
            Io::Bound(socket) => socket
                .local_addr()?
                .as_socket()
                .ok_or_else(|| invalid_state("socket is not an inet socket")),
            Io::Shared(listener) => Ok(listener.local_addr()?),
            Io::Listening(listener) => Ok(listener.local_addr()?),
            Io::Stream(stream) => Ok(stream.local_addr()?),
            Io::Fresh | Io::Connecting | Io::Closed => Err(RawError::not_connected()),
        }
    }

    fn set_keep_alive(&mut self, enable: bool, delay_secs: u32) -> Result<(), RawError> {
        let stream = self.stream()?;
        let socket = SockRef::from(stream.as_ref());
        if !enable {
            return Ok(socket.set_keepalive(false)?);
        }
        let mut keepalive = TcpKeepalive::new();
        if delay_secs > 0 {
            keepalive = keepalive.with_time(Duration::from_secs(u64::from(delay_secs)));
        }
        Ok(socket.set_tcp_keepalive(&keepalive)?)
    }

    fn close(&mut self, on_closed: CloseCallback) {
        let cancelled = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            state.tasks.abort_all();
            if let Some(active) = state.read_active.take() {
                active.set(false);
            }
            state.io = Io::Closed;
            state.queued_bytes = 0;
            mem::take(&mut state.queue)
        };
        spawn_local(async move {
            for write in cancelled {
                (write.on_flushed)(Err(RawError::cancelled()));
            }
            on_closed();
        });
    }
}

impl Drop for TokioTcpHandle {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.tasks.abort_all();
        }
    }
}

async fn accept_loop(
    listener: Rc<TcpListener>,
    mut on_connection: ConnectionCallback,
    read_buffer_size: usize,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(%peer, "accepted");
                let handle = TokioTcpHandle::from_stream(stream, read_buffer_size);
                on_connection(Ok(Box::new(handle)));
            }
            Err(error) => {
                warn!(%error, "accept failed, backing off");
                on_connection(Err(error.into()));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn read_pump(
    stream: Rc<TcpStream>,
    mut on_read: ReadCallback,
    active: Rc<Cell<bool>>,
    capacity: usize,
) {
    let mut buffer = BytesMut::with_capacity(capacity);
    loop {
        if let Err(error) = stream.readable().await {
            if active.get() {
                on_read(ReadSignal::Failed(error.into()));
            }
            return;
        }
        if !active.get() {
            return;
        }
        buffer.reserve(capacity);
        match stream.try_read_buf(&mut buffer) {
            Ok(0) => {
                on_read(ReadSignal::Eof);
                return;
            }
            Ok(_) => on_read(ReadSignal::Data(buffer.split().freeze())),
            Err(error) if error.kind() == ErrorKind::WouldBlock => {}
            Err(error) => {
                on_read(ReadSignal::Failed(error.into()));
                return;
            }
        }
    }
}

enum FlushStep {
    Progress,
    Done(WriteCallback),
    Wait,
    Failed(RawError),
    Idle,
}

async fn flush_queue(state: Rc<RefCell<HandleState>>, stream: Rc<TcpStream>) {
    loop {
        let step = {
            let mut guard = state.borrow_mut();
            let inner = &mut *guard;
            if inner.closed {
                return;
            }
            match inner.queue.front_mut() {
                None => FlushStep::Idle,
                Some(front) => match stream.try_write(&front.payload) {
                    Ok(0) => FlushStep::Failed(io::Error::from(ErrorKind::WriteZero).into()),
                    Ok(written) if written < front.payload.len() => {
                        front.payload.advance(written);
                        inner.queued_bytes -= written;
                        FlushStep::Progress
                    }
                    Ok(written) => {
                        inner.queued_bytes -= written;
                        match inner.queue.pop_front() {
                            Some(done) => FlushStep::Done(done.on_flushed),
                            None => FlushStep::Idle,
                        }
                    }
                    Err(error) if error.kind() == ErrorKind::WouldBlock => FlushStep::Wait,
                    Err(error) => FlushStep::Failed(error.into()),
                },
            }
        };

        match step {
            FlushStep::Progress => {}
            FlushStep::Done(on_flushed) => on_flushed(Ok(())),
            FlushStep::Wait => {
                if let Err(error) = stream.writable().await {
                    fail_queue(&state, error.into());
                    return;
                }
            }
            FlushStep::Failed(error) => {
                fail_queue(&state, error);
                return;
            }
            FlushStep::Idle => {
                state.borrow_mut().tasks.flush = None;
                return;
            }
        }
    }
}

/// 发送队列整体失败：按提交顺序以同一错误完成全部写回调。
fn fail_queue(state: &RefCell<HandleState>, error: RawError) {
    let failed = {
        let mut state = state.borrow_mut();
        state.queued_bytes = 0;
        state.tasks.flush = None;
        mem::take(&mut state.queue)
    };
    for write in failed {
        (write.on_flushed)(Err(error.clone()));
    }
}

/// 每次创建一个全新的 [`TokioTcpHandle`]。
#[derive(Clone, Copy, Debug)]
pub struct TokioHandleFactory {
    read_buffer_size: usize,
}

impl TokioHandleFactory {
    pub fn new(read_buffer_size: usize) -> Self {
        Self { read_buffer_size }
    }
}

impl HandleFactory for TokioHandleFactory {
    fn create(&self) -> Box<dyn RawTcpHandle> {
        Box::new(TokioTcpHandle::new(self.read_buffer_size))
    }
}
