use std::{
    cell::RefCell,
    future::Future,
    mem,
    pin::Pin,
    rc::{Rc, Weak},
    task::{Context as TaskContext, Poll},
};

use tracing::warn;

use crate::runtime::{
    async_context::{LeaveRegistration, RestoreToken},
    error::{ContextError, ContextResult},
    storage::{run_in_scope, ScopedStorage},
};

pub struct ContextOptions<T> {
    /// Run bracketed calls inside `storage` so the value survives
    /// suspension points without rewriting.
    pub async_context: bool,
    pub storage: Option<Rc<dyn ScopedStorage<T>>>,
}

impl<T> ContextOptions<T> {
    pub fn with_storage(storage: Rc<dyn ScopedStorage<T>>) -> Self {
        Self {
            async_context: true,
            storage: Some(storage),
        }
    }
}

impl<T> Default for ContextOptions<T> {
    fn default() -> Self {
        Self {
            async_context: false,
            storage: None,
        }
    }
}

pub fn create_context<T: 'static>(options: ContextOptions<T>) -> Context<T> {
    Context::new(options)
}

struct Binding<T> {
    current: Option<Rc<T>>,
    singleton: bool,
}

struct ContextInner<T> {
    binding: RefCell<Binding<T>>,
    storage: Option<Rc<dyn ScopedStorage<T>>>,
}

/// A slot holding at most one current value of type `T`.
///
/// Handles are cheap to clone and clones share the slot. Values are compared
/// by identity (`Rc::ptr_eq`), never by `PartialEq`.
pub struct Context<T> {
    inner: Rc<ContextInner<T>>,
}

impl<T> Clone for Context<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Context<T> {
    pub fn new(options: ContextOptions<T>) -> Self {
        let storage = if options.async_context {
            if options.storage.is_none() {
                warn!("async context requested without a scoped storage; values must be restored explicitly");
            }
            options.storage
        } else {
            None
        };
        Self {
            inner: Rc::new(ContextInner {
                binding: RefCell::new(Binding {
                    current: None,
                    singleton: false,
                }),
                storage,
            }),
        }
    }

    pub fn ptr_eq(&self, other: &Context<T>) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The current value, if any. A value held by the scoped storage takes
    /// precedence over the explicit binding.
    pub fn try_use(&self) -> Option<Rc<T>> {
        if let Some(value) = self.inner.storage.as_ref().and_then(|storage| storage.current()) {
            return Some(value);
        }
        self.inner.binding.borrow().current.clone()
    }

    pub fn use_value(&self) -> ContextResult<Rc<T>> {
        self.try_use().ok_or(ContextError::Unavailable)
    }

    /// Binds `value` as a singleton: bracketed calls with the same value
    /// leave it in place when they finish.
    pub fn set(&self, value: Rc<T>, replace: bool) -> ContextResult<()> {
        if !replace {
            self.check_conflict(&value)?;
        }
        let mut binding = self.inner.binding.borrow_mut();
        binding.current = Some(value);
        binding.singleton = true;
        Ok(())
    }

    pub fn unset(&self) {
        let mut binding = self.inner.binding.borrow_mut();
        binding.current = None;
        binding.singleton = false;
    }

    /// Runs `body` with `value` bound. The binding is released on every exit
    /// path, including unwinding, unless it was made a singleton.
    pub fn call<R>(&self, value: Rc<T>, body: impl FnOnce() -> R) -> ContextResult<R> {
        self.check_conflict(&value)?;
        self.bind(Rc::clone(&value));
        let _release = ReleaseGuard {
            context: self,
            value: &value,
        };
        Ok(self.scoped(&value, body))
    }

    /// Runs the future produced by `body` with `value` bound.
    ///
    /// The binding only lasts until the body first suspends. While the call
    /// is in flight a leave handler lets rewritten suspension points restore
    /// it; see [`execute_async`](crate::runtime::execute_async).
    pub fn call_async<F, Fut>(&self, value: Rc<T>, body: F) -> CallAsync<T, F, Fut>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        CallAsync {
            context: self.clone(),
            value,
            state: CallState::Start(body),
        }
    }

    fn check_conflict(&self, value: &Rc<T>) -> ContextResult<()> {
        match &self.inner.binding.borrow().current {
            Some(current) if !Rc::ptr_eq(current, value) => Err(ContextError::Conflict),
            _ => Ok(()),
        }
    }

    fn bind(&self, value: Rc<T>) {
        self.inner.binding.borrow_mut().current = Some(value);
    }

    /// Clears the slot if it still holds `value` and is not a singleton.
    fn release(&self, value: &Rc<T>) {
        let mut binding = self.inner.binding.borrow_mut();
        if binding.singleton {
            return;
        }
        if matches!(&binding.current, Some(current) if Rc::ptr_eq(current, value)) {
            binding.current = None;
        }
    }

    fn scoped<R>(&self, value: &Rc<T>, body: impl FnOnce() -> R) -> R {
        match &self.inner.storage {
            Some(storage) => run_in_scope(storage.as_ref(), Rc::clone(value), body),
            None => body(),
        }
    }

    fn register_leave_handler(&self, value: &Rc<T>) -> LeaveRegistration {
        let context = Rc::downgrade(&self.inner);
        let value = Rc::clone(value);
        LeaveRegistration::register(move || {
            let inner = context.upgrade()?;
            let active = inner.binding.borrow().current.clone()?;
            if !Rc::ptr_eq(&active, &value) {
                return None;
            }
            Some(restore_token(Rc::downgrade(&inner), Rc::clone(&value)))
        })
    }
}

fn restore_token<T: 'static>(context: Weak<ContextInner<T>>, value: Rc<T>) -> RestoreToken {
    RestoreToken::new(move || {
        if let Some(inner) = context.upgrade() {
            inner.binding.borrow_mut().current = Some(Rc::clone(&value));
        }
    })
}

struct ReleaseGuard<'c, T: 'static> {
    context: &'c Context<T>,
    value: &'c Rc<T>,
}

impl<T: 'static> Drop for ReleaseGuard<'_, T> {
    fn drop(&mut self) {
        self.context.release(self.value);
    }
}

enum CallState<F, Fut> {
    Start(F),
    Running {
        body: Pin<Box<Fut>>,
        _registration: LeaveRegistration,
    },
    Done,
}

/// Future returned by [`Context::call_async`].
#[must_use = "futures do nothing unless polled"]
pub struct CallAsync<T: 'static, F, Fut> {
    context: Context<T>,
    value: Rc<T>,
    state: CallState<F, Fut>,
}

// The body future is boxed, nothing here is structurally pinned.
impl<T: 'static, F, Fut> Unpin for CallAsync<T, F, Fut> {}

impl<T, F, Fut> Future for CallAsync<T, F, Fut>
where
    T: 'static,
    F: FnOnce() -> Fut,
    Fut: Future,
{
    type Output = ContextResult<Fut::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let (mut body, registration) = match mem::replace(&mut this.state, CallState::Done) {
            CallState::Start(make_body) => {
                if let Err(err) = this.context.check_conflict(&this.value) {
                    return Poll::Ready(Err(err));
                }
                this.context.bind(Rc::clone(&this.value));
                let registration = this.context.register_leave_handler(&this.value);
                let body = this.context.scoped(&this.value, make_body);
                (Box::pin(body), registration)
            }
            CallState::Running {
                body,
                _registration,
            } => (body, _registration),
            CallState::Done => panic!("`CallAsync` polled after completion"),
        };

        let poll = {
            let _release = ReleaseGuard {
                context: &this.context,
                value: &this.value,
            };
            this.context.scoped(&this.value, || body.as_mut().poll(cx))
        };

        match poll {
            Poll::Pending => {
                this.state = CallState::Running {
                    body,
                    _registration: registration,
                };
                Poll::Pending
            }
            Poll::Ready(output) => {
                drop(registration);
                Poll::Ready(Ok(output))
            }
        }
    }
}
