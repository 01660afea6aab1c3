use crate::{
    language::{errors::SyntaxError, span::Span},
    transform::TransformError,
};
use miette::{Diagnostic, NamedSource, Report, SourceSpan};
use thiserror::Error;

#[derive(Debug, Error, Diagnostic, Clone)]
#[error("{message}")]
#[diagnostic(code(unctx::syntax))]
pub struct SyntaxDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("{label}")]
    span: SourceSpan,
    #[help]
    help: Option<String>,
    message: String,
    label: String,
}

impl SyntaxDiagnostic {
    pub fn from_error(src: NamedSource<String>, err: SyntaxError) -> Self {
        Self {
            src,
            span: err.to_source_span(),
            help: err.help.clone(),
            message: err.message.clone(),
            label: err.label,
        }
    }
}

#[derive(Debug, Error, Diagnostic, Clone)]
#[error("`{callee}` must be called with an async function")]
#[diagnostic(
    code(unctx::malformed_trigger),
    help("pass the function whose context should survive `await` directly to `{callee}`")
)]
pub struct TriggerUsageDiagnostic {
    #[source_code]
    src: NamedSource<String>,
    #[label("no function argument in this call")]
    span: SourceSpan,
    callee: String,
}

impl TriggerUsageDiagnostic {
    pub fn new(src: NamedSource<String>, callee: &str, span: Span) -> Self {
        Self {
            src,
            span: span.into(),
            callee: callee.to_string(),
        }
    }
}

/// Source-annotated reports for `err`, one per underlying problem.
pub fn transform_error_reports(id: &str, source: &str, err: &TransformError) -> Vec<Report> {
    let src = NamedSource::new(id, source.to_string());
    match err {
        TransformError::Syntax(errors) => errors
            .errors
            .iter()
            .map(|err| Report::new(SyntaxDiagnostic::from_error(src.clone(), err.clone())))
            .collect(),
        TransformError::MalformedTriggerUsage { callee, span } => {
            vec![Report::new(TriggerUsageDiagnostic::new(src, callee, *span))]
        }
        TransformError::Pattern(err) => vec![Report::msg(err.to_string())],
    }
}

pub fn report_transform_error(id: &str, source: &str, err: &TransformError) {
    for report in transform_error_reports(id, source, err) {
        eprintln!("{:?}", report);
    }
}
