use miette::SourceSpan;
use swc_core::common::Span as SourcePos;

use crate::language::parser::START_POS;

/// Byte range into the original source text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slice<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start..self.end]
    }
}

/// Parser positions are offset by [`START_POS`].
impl From<SourcePos> for Span {
    fn from(span: SourcePos) -> Self {
        let offset = |pos: u32| pos.saturating_sub(START_POS.0) as usize;
        Span::new(offset(span.lo.0), offset(span.hi.0))
    }
}

impl From<Span> for SourceSpan {
    fn from(span: Span) -> Self {
        (span.start, span.len()).into()
    }
}
