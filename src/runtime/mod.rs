pub mod async_context;
pub mod context;
pub mod error;
pub mod namespace;
pub mod storage;

pub use async_context::{
    execute_async, registered_handlers, with_async_context, LeaveRegistration, Restore,
    RestoreToken,
};
pub use context::{create_context, CallAsync, Context, ContextOptions};
pub use error::{ContextError, ContextResult};
pub use namespace::{
    create_namespace, default_namespace, get_context, use_context, Namespace, NamespaceOptions,
    GLOBAL_KEY,
};
pub use storage::{run_in_scope, ScopeStack, ScopedStorage};

#[cfg(test)]
mod tests;
