pub mod diagnostics;
pub mod language;
pub mod runtime;
pub mod transform;

pub use runtime::{
    create_context, create_namespace, default_namespace, execute_async, get_context,
    use_context, with_async_context, Context, ContextError, ContextOptions, ContextResult,
    Namespace, NamespaceOptions,
};
pub use transform::{
    TransformError, TransformInput, TransformResult, Transformer, TransformerOptions,
};
