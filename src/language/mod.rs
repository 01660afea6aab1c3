pub mod errors;
pub mod parser;
pub mod span;

pub use errors::{SyntaxError, SyntaxErrors};
pub use parser::parse_module;
pub use span::Span;
