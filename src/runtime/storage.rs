use std::{cell::RefCell, rc::Rc};

/// A facility that keeps a value visible for the extent of a scope, the way
/// an async-local storage does on runtimes that have one.
///
/// `enter` and `exit` always come in pairs; [`run_in_scope`] is the only
/// caller inside this crate and guarantees the pairing even when the scoped
/// closure unwinds.
pub trait ScopedStorage<T> {
    fn enter(&self, value: Rc<T>);
    fn exit(&self);
    fn current(&self) -> Option<Rc<T>>;
}

pub fn run_in_scope<T, R>(
    storage: &dyn ScopedStorage<T>,
    value: Rc<T>,
    body: impl FnOnce() -> R,
) -> R {
    struct ExitGuard<'s, T> {
        storage: &'s dyn ScopedStorage<T>,
    }

    impl<T> Drop for ExitGuard<'_, T> {
        fn drop(&mut self) {
            self.storage.exit();
        }
    }

    storage.enter(value);
    let _guard = ExitGuard { storage };
    body()
}

/// In-process scoped storage: a stack of the values whose scopes are
/// currently open.
pub struct ScopeStack<T> {
    stack: RefCell<Vec<Rc<T>>>,
}

impl<T> ScopeStack<T> {
    pub fn new() -> Self {
        Self {
            stack: RefCell::new(Vec::new()),
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.borrow().len()
    }
}

impl<T> Default for ScopeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ScopedStorage<T> for ScopeStack<T> {
    fn enter(&self, value: Rc<T>) {
        self.stack.borrow_mut().push(value);
    }

    fn exit(&self) {
        self.stack.borrow_mut().pop();
    }

    fn current(&self) -> Option<Rc<T>> {
        self.stack.borrow().last().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scopes_nest_and_unwind() {
        let stack = ScopeStack::<&str>::new();
        let storage: &dyn ScopedStorage<&str> = &stack;
        assert!(storage.current().is_none());
        let outer = run_in_scope(storage, Rc::new("outer"), || {
            let inner = run_in_scope(storage, Rc::new("inner"), || storage.current());
            assert_eq!(inner.as_deref(), Some(&"inner"));
            storage.current()
        });
        assert_eq!(outer.as_deref(), Some(&"outer"));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn scope_is_closed_when_body_panics() {
        let stack = ScopeStack::<i32>::new();
        let storage: &dyn ScopedStorage<i32> = &stack;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_in_scope(storage, Rc::new(1), || panic!("boom"))
        }));
        assert!(result.is_err());
        assert_eq!(stack.depth(), 0);
    }
}
