//! # events 模块说明
//!
//! ## 角色定位（Why）
//! - Socket 与 Server 通过事件向应用层报告生命周期：`listening`、`connection`、`data`、
//!   `connect`、`close`、`error`、`idle`；
//! - 本模块提供显式的发布/订阅工具 [`Emitter`]，不向共享对象注入字段，也不修改任何全局表。
//!
//! ## 设计要求（What）
//! - 监听器按注册顺序调用；`once` 监听器在第一次触发前即被移除；
//! - `emit` 在调用监听器之前释放内部借用，监听器可以在回调中注册/注销监听器，
//!   也可以调用 Socket/Server 的任意方法；
//! - 同一监听器被重入触发时跳过本次调用并记录告警。

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::config::UnhandledErrorPolicy;
use crate::error::TcpError;

/// 注册监听器时返回的标识，用于 [`Emitter::off`]。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Callback<T, R> = Rc<RefCell<dyn FnMut(&T) -> R>>;

struct Entry<T: ?Sized, R> {
    id: u64,
    once: bool,
    callback: Callback<T, R>,
}

/// 单一事件的监听器列表。
///
/// `R` 为监听器返回值，`data` 事件借此表达读需求，其余事件为 `()`。
pub struct Emitter<T: ?Sized, R = ()> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<Entry<T, R>>>,
}

impl<T: ?Sized, R> Emitter<T, R> {
    pub fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub fn on<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&T) -> R + 'static,
    {
        self.register(listener, false)
    }

    pub fn once<F>(&self, listener: F) -> ListenerId
    where
        F: FnMut(&T) -> R + 'static,
    {
        self.register(listener, true)
    }

    /// 注销监听器，返回是否确实移除了某个条目。
    pub fn off(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|entry| entry.id != id.0);
        entries.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_count() > 0
    }

    pub fn clear(&self) {
        // 先移出再析构，监听器闭包的 Drop 可能再次访问本 Emitter。
        let drained = std::mem::take(&mut *self.entries.borrow_mut());
        drop(drained);
    }

    /// 按注册顺序调用全部监听器，返回每个被调用监听器的返回值。
    pub fn emit(&self, arg: &T) -> Vec<R> {
        let snapshot: Vec<Callback<T, R>> = {
            let mut entries = self.entries.borrow_mut();
            let snapshot = entries
                .iter()
                .map(|entry| Rc::clone(&entry.callback))
                .collect();
            entries.retain(|entry| !entry.once);
            snapshot
        };

        let mut results = Vec::with_capacity(snapshot.len());
        for callback in snapshot {
            match callback.try_borrow_mut() {
                Ok(mut listener) => results.push((&mut *listener)(arg)),
                Err(_) => warn!("re-entrant emit skipped a listener that is still running"),
            }
        }
        results
    }

    fn register<F>(&self, listener: F, once: bool) -> ListenerId
    where
        F: FnMut(&T) -> R + 'static,
    {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let callback: Callback<T, R> = Rc::new(RefCell::new(listener));
        self.entries.borrow_mut().push(Entry { id, once, callback });
        ListenerId(id)
    }
}

impl<T: ?Sized, R> Default for Emitter<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized, R> fmt::Debug for Emitter<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// 投递 `error` 事件，返回是否至少有一个监听器接收了它。
///
/// 调用方先完成拆除，再对未处理的错误调用 [`raise_unhandled`]，保证错误路径与
/// 优雅关闭共用同一条拆除流程。
pub(crate) fn emit_error(emitter: &Emitter<TcpError>, error: &TcpError) -> bool {
    !emitter.emit(error).is_empty()
}

/// 对没有监听器的错误执行策略。
///
/// [`UnhandledErrorPolicy::Panic`] 在调用栈能把 panic 传回应用时直接 panic；
/// 在 Tokio 任务内部 panic 会被运行时捕获，因此记录错误后终止进程。
pub(crate) fn raise_unhandled(error: &TcpError, policy: UnhandledErrorPolicy) {
    match policy {
        UnhandledErrorPolicy::Log => {
            tracing::error!(code = error.code(), %error, "unhandled tcp error event");
        }
        UnhandledErrorPolicy::Panic => {
            tracing::error!(code = error.code(), %error, "unhandled tcp error event is fatal");
            #[cfg(feature = "runtime-tokio")]
            if tokio::task::try_id().is_some() {
                eprintln!("unhandled tcp error event: {error}");
                std::process::abort();
            }
            panic!("unhandled tcp error event: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listeners_run_in_registration_order_and_once_is_removed() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&seen);
        emitter.on(move |value| first.borrow_mut().push(("on", *value)));
        let second = Rc::clone(&seen);
        emitter.once(move |value| second.borrow_mut().push(("once", *value)));

        emitter.emit(&1);
        emitter.emit(&2);

        assert_eq!(*seen.borrow(), vec![("on", 1), ("once", 1), ("on", 2)]);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn off_removes_listener() {
        let emitter: Emitter<()> = Emitter::new();
        let id = emitter.on(|_| {});
        assert!(emitter.off(id));
        assert!(!emitter.off(id));
        assert!(emitter.emit(&()).is_empty());
    }

    #[test]
    fn listeners_may_register_during_emit() {
        let emitter: Rc<Emitter<()>> = Rc::new(Emitter::new());
        let inner = Rc::clone(&emitter);
        emitter.once(move |_| {
            inner.on(|_| {});
        });
        assert_eq!(emitter.emit(&()).len(), 1);
        assert_eq!(emitter.listener_count(), 1);
    }

    #[test]
    fn return_values_are_collected() {
        let emitter: Emitter<u8, bool> = Emitter::new();
        emitter.on(|value| *value > 1);
        emitter.on(|_| true);
        assert_eq!(emitter.emit(&1), vec![false, true]);
    }

    #[test]
    fn error_delivery_reports_whether_it_was_handled() {
        let emitter = Emitter::new();
        let error = TcpError::Closed { action: "write" };
        assert!(!emit_error(&emitter, &error));
        emitter.on(|_| {});
        assert!(emit_error(&emitter, &error));
    }

    #[test]
    #[should_panic(expected = "unhandled tcp error event")]
    fn unhandled_error_is_fatal_by_default() {
        let error = TcpError::Closed { action: "write" };
        raise_unhandled(&error, UnhandledErrorPolicy::default());
    }

    #[test]
    fn unhandled_error_can_be_logged() {
        let error = TcpError::Closed { action: "write" };
        raise_unhandled(&error, UnhandledErrorPolicy::Log);
    }
}
