//! Leave handlers and the orchestration primitive used by rewritten code.
//!
//! Every in-flight [`Context::call_async`](crate::runtime::Context::call_async)
//! owns one registered leave handler. Rewritten suspension points call
//! [`execute_async`], which asks each handler for a [`RestoreToken`] before the
//! suspension and hands back a [`Restore`] that re-applies them afterwards.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
};

use tracing::{trace, warn};

type LeaveHandler = Rc<dyn Fn() -> Option<RestoreToken>>;

thread_local! {
    static HANDLERS: RefCell<BTreeMap<u64, LeaveHandler>> = RefCell::new(BTreeMap::new());
    static NEXT_HANDLER_ID: Cell<u64> = const { Cell::new(0) };
}

/// Re-binds a value captured by a leave handler.
#[derive(Clone)]
pub struct RestoreToken(Rc<dyn Fn()>);

impl RestoreToken {
    pub fn new(restore: impl Fn() + 'static) -> Self {
        Self(Rc::new(restore))
    }

    pub fn apply(&self) {
        (self.0)();
    }
}

/// Keeps a leave handler registered until dropped.
#[must_use = "the leave handler is removed as soon as the registration is dropped"]
pub struct LeaveRegistration {
    id: u64,
}

impl LeaveRegistration {
    pub fn register(handler: impl Fn() -> Option<RestoreToken> + 'static) -> Self {
        let id = NEXT_HANDLER_ID.with(|next| {
            let id = next.get();
            next.set(id + 1);
            id
        });
        HANDLERS.with(|handlers| {
            handlers.borrow_mut().insert(id, Rc::new(handler));
        });
        trace!(handler = id, "registered async leave handler");
        Self { id }
    }
}

impl Drop for LeaveRegistration {
    fn drop(&mut self) {
        // The registry may already be gone during thread teardown.
        let _ = HANDLERS.try_with(|handlers| {
            handlers.borrow_mut().remove(&self.id);
        });
        trace!(handler = self.id, "removed async leave handler");
    }
}

/// Number of leave handlers currently registered on this thread.
pub fn registered_handlers() -> usize {
    HANDLERS.with(|handlers| handlers.borrow().len())
}

/// Restore callbacks captured by [`execute_async`].
#[derive(Clone, Default)]
pub struct Restore {
    tokens: Vec<RestoreToken>,
}

impl Restore {
    pub fn restore(&self) {
        for token in &self.tokens {
            token.apply();
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Snapshots every active binding, then starts the eventual computation.
///
/// Handlers run in registration order before `thunk` is invoked. Restoring is
/// left to the caller: rewritten code calls [`Restore::restore`] right after
/// the eventual result settles, whether it succeeded or not.
pub fn execute_async<E>(thunk: impl FnOnce() -> E) -> (E, Restore) {
    let handlers: Vec<LeaveHandler> =
        HANDLERS.with(|handlers| handlers.borrow().values().cloned().collect());
    let tokens = handlers.iter().filter_map(|handler| handler()).collect();
    (thunk(), Restore { tokens })
}

/// Marks an async body as one whose suspension points should have been
/// rewritten. The body is returned unchanged.
pub fn with_async_context<B>(body: B, transformed: bool) -> B {
    if !transformed {
        warn!(
            diagnostic = "UnrewrittenAsyncBoundary",
            "`with_async_context` used on a body that was not transformed; \
             the context will be lost after the first suspension"
        );
    }
    body
}
