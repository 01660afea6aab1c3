use swc_core::{
    common::{BytePos, Spanned},
    ecma::{
        ast::{EsVersion, Module},
        parser::{lexer::Lexer, Parser, StringInput, Syntax},
    },
};

use crate::language::{
    errors::{SyntaxError, SyntaxErrors},
    span::Span,
};

/// Position of the first byte of the parsed text. `BytePos(0)` is reserved
/// for dummy spans.
pub const START_POS: BytePos = BytePos(1);

/// Parses `source` with the module goal. Recoverable errors are reported
/// too, so a module is only returned for clean input.
pub fn parse_module(source: &str) -> Result<Module, SyntaxErrors> {
    let end = BytePos(START_POS.0 + source.len() as u32);
    let lexer = Lexer::new(
        Syntax::Es(Default::default()),
        EsVersion::EsNext,
        StringInput::new(source, START_POS, end),
        None,
    );
    let mut parser = Parser::new_from(lexer);
    let parsed = parser.parse_module();

    let mut errors: Vec<SyntaxError> = parser
        .take_errors()
        .into_iter()
        .map(|err| SyntaxError::new(err.kind().msg(), Span::from(err.span())))
        .collect();
    match parsed {
        Ok(module) if errors.is_empty() => Ok(module),
        Ok(_) => Err(SyntaxErrors::new(errors)),
        Err(err) => {
            errors.push(
                SyntaxError::new(err.kind().msg(), Span::from(err.span()))
                    .with_help("sources are parsed as ECMAScript modules, in strict mode"),
            );
            errors.sort_by_key(|err| err.span.start);
            Err(SyntaxErrors::new(errors))
        }
    }
}
