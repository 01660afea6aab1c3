use std::{any::Any, cell::RefCell, collections::HashMap, rc::Rc};

use crate::runtime::{
    context::{create_context, Context, ContextOptions},
    error::{ContextError, ContextResult},
    storage::{ScopeStack, ScopedStorage},
};

/// Key under which the default namespace is registered in the per-thread
/// globals.
pub const GLOBAL_KEY: &str = "__unctx__";

#[derive(Clone, Copy, Debug, Default)]
pub struct NamespaceOptions {
    /// Contexts created through [`Namespace::get`] keep their value in a
    /// [`ScopeStack`] for the extent of every bracketed call.
    pub async_context: bool,
}

/// Lazily created contexts keyed by name.
pub struct Namespace {
    defaults: NamespaceOptions,
    contexts: RefCell<HashMap<String, Rc<dyn Any>>>,
}

pub fn create_namespace(defaults: NamespaceOptions) -> Namespace {
    Namespace {
        defaults,
        contexts: RefCell::new(HashMap::new()),
    }
}

impl Namespace {
    /// Returns the context registered under `key`, creating it from the
    /// namespace defaults on first access.
    pub fn get<T: 'static>(&self, key: &str) -> ContextResult<Context<T>> {
        let async_context = self.defaults.async_context;
        self.get_or_insert_with(key, || {
            if async_context {
                let storage: Rc<dyn ScopedStorage<T>> = Rc::new(ScopeStack::new());
                ContextOptions::with_storage(storage)
            } else {
                ContextOptions::default()
            }
        })
    }

    /// Like [`get`](Self::get), but creates a missing context from `options`.
    /// An existing context is returned as is.
    pub fn get_with<T: 'static>(
        &self,
        key: &str,
        options: ContextOptions<T>,
    ) -> ContextResult<Context<T>> {
        self.get_or_insert_with(key, || options)
    }

    /// `make` only runs when no context is registered under `key` yet.
    pub fn get_or_insert_with<T: 'static>(
        &self,
        key: &str,
        make: impl FnOnce() -> ContextOptions<T>,
    ) -> ContextResult<Context<T>> {
        if let Some(existing) = self.contexts.borrow().get(key) {
            return existing
                .downcast_ref::<Context<T>>()
                .cloned()
                .ok_or_else(|| ContextError::TypeMismatch {
                    key: key.to_string(),
                });
        }

        let context = create_context(make());
        self.contexts
            .borrow_mut()
            .insert(key.to_string(), Rc::new(context.clone()));
        Ok(context)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.contexts.borrow().contains_key(key)
    }
}

thread_local! {
    static GLOBALS: RefCell<HashMap<&'static str, Rc<Namespace>>> = RefCell::new(HashMap::new());
}

/// The namespace shared by everything on this thread.
pub fn default_namespace() -> Rc<Namespace> {
    GLOBALS.with(|globals| {
        Rc::clone(
            globals
                .borrow_mut()
                .entry(GLOBAL_KEY)
                .or_insert_with(|| Rc::new(create_namespace(NamespaceOptions::default()))),
        )
    })
}

pub fn get_context<T: 'static>(key: &str) -> ContextResult<Context<T>> {
    default_namespace().get(key)
}

/// The current value of the default-namespace context named `key`.
pub fn use_context<T: 'static>(key: &str) -> ContextResult<Rc<T>> {
    get_context::<T>(key)?.use_value()
}
