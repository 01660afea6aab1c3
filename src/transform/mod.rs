//! Source-to-source rewriting of suspension points inside trigger calls.
//!
//! Every `await` directly inside an async function passed to a trigger (for
//! example `withAsyncContext(async () => { ... })`) is rewritten so the
//! context binding captured before the suspension is reinstated after it.

pub mod edits;
pub mod source_map;

use std::collections::{BTreeMap, HashSet};

use miette::Diagnostic;
use regex::Regex;
use serde::{Deserialize, Serialize};
use swc_core::{
    common::{BytePos, Span as SourcePos, Spanned},
    ecma::{
        ast::{
            ArrowExpr, AwaitExpr, BlockStmt, BlockStmtOrExpr, CallExpr, Callee, Class, Expr,
            ExprOrSpread, Function, MemberExpr, MemberProp, Module, ModuleItem, OptCall,
            OptChainBase, Prop, PropName, PropOrSpread, Stmt,
        },
        visit::{Visit, VisitWith},
    },
};
use thiserror::Error;
use tracing::debug;

use crate::language::{parse_module, span::Span, SyntaxErrors};

use self::edits::EditBuffer;

const TEMP_DECLARATION: &str = "let __temp, __restore;";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransformerOptions {
    /// Calls whose async function arguments are rewritten.
    #[serde(alias = "triggerFunctions")]
    pub async_functions: Vec<String>,
    /// Module the helper is imported from.
    pub helper_module: String,
    /// Exported name of the helper in `helper_module`.
    pub helper_name: String,
    /// Calls taking an object literal, mapped to the keys whose async
    /// function values are rewritten.
    pub object_definitions: BTreeMap<String, Vec<String>>,
    /// Triggers that call their argument directly. Other triggers get a
    /// trailing `1` argument marking the function as rewritten.
    pub direct_call_functions: Vec<String>,
}

impl Default for TransformerOptions {
    fn default() -> Self {
        Self {
            async_functions: vec!["withAsyncContext".to_string()],
            helper_module: "unctx".to_string(),
            helper_name: "executeAsync".to_string(),
            object_definitions: BTreeMap::new(),
            direct_call_functions: vec!["callAsync".to_string()],
        }
    }
}

impl TransformerOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum TransformError {
    #[error(transparent)]
    #[diagnostic(code(unctx::syntax))]
    Syntax(#[from] SyntaxErrors),

    #[error("`{callee}` must be called with an async function")]
    #[diagnostic(
        code(unctx::malformed_trigger),
        help("pass the function whose context should survive `await` directly to `{callee}`")
    )]
    MalformedTriggerUsage { callee: String, span: Span },

    #[error("invalid trigger name pattern")]
    #[diagnostic(code(unctx::pattern))]
    Pattern(#[from] regex::Error),
}

#[derive(Clone, Copy, Debug)]
pub struct TransformInput<'a> {
    pub code: &'a str,
    /// Module id, used for logging only.
    pub id: Option<&'a str>,
    /// Skip the textual pre-check and always parse.
    pub force: bool,
}

impl<'a> TransformInput<'a> {
    pub fn new(code: &'a str) -> Self {
        Self {
            code,
            id: None,
            force: false,
        }
    }

    pub fn with_id(mut self, id: &'a str) -> Self {
        self.id = Some(id);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TransformResult {
    pub code: String,
    pub edits: EditBuffer,
}

pub struct Transformer {
    options: TransformerOptions,
    matcher: Option<Regex>,
}

impl Transformer {
    pub fn new(options: TransformerOptions) -> Result<Self, TransformError> {
        let names: Vec<String> = options
            .async_functions
            .iter()
            .chain(options.object_definitions.keys())
            .map(|name| regex::escape(name))
            .collect();
        let matcher = if names.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(r"\b({})\(", names.join("|")))?)
        };
        Ok(Self { options, matcher })
    }

    pub fn options(&self) -> &TransformerOptions {
        &self.options
    }

    /// Cheap textual check: can `code` contain a call to any configured name?
    pub fn should_transform(&self, code: &str) -> bool {
        self.matcher
            .as_ref()
            .map_or(false, |matcher| matcher.is_match(code))
    }

    pub fn transform(&self, code: &str) -> Result<Option<TransformResult>, TransformError> {
        self.transform_with(TransformInput::new(code))
    }

    /// Rewrites `input.code`. `Ok(None)` means nothing needed rewriting and
    /// the source is to be used as is.
    pub fn transform_with(
        &self,
        input: TransformInput<'_>,
    ) -> Result<Option<TransformResult>, TransformError> {
        let id = input.id.unwrap_or("<anonymous>");
        if !input.force && !self.should_transform(input.code) {
            debug!(id, "no trigger call found, skipping");
            return Ok(None);
        }

        let module = parse_module(input.code)?;
        let mut edits = EditBuffer::new(input.code);
        let detected = self.rewrite_program(&module, &mut edits)?;
        if !detected {
            debug!(id, "no suspension point inside trigger calls");
            return Ok(None);
        }

        let import = format!(
            "import {{ {} as __executeAsync }} from \"{}\";",
            self.options.helper_name, self.options.helper_module
        );
        edits.prepend_left(import_offset(input.code), &import);

        Ok(Some(TransformResult {
            code: edits.to_string(),
            edits,
        }))
    }

    fn rewrite_program(
        &self,
        module: &Module,
        edits: &mut EditBuffer,
    ) -> Result<bool, TransformError> {
        let mut visitor = TriggerVisitor {
            options: &self.options,
            edits,
            detected: false,
            error: None,
        };
        module.visit_with(&mut visitor);
        match visitor.error {
            Some(err) => Err(err),
            None => Ok(visitor.detected),
        }
    }
}

/// Imports go first, after a leading `#!` line if there is one.
fn import_offset(code: &str) -> usize {
    if !code.starts_with("#!") {
        return 0;
    }
    code.find('\n').map_or(code.len(), |newline| newline + 1)
}

fn unparenthesized(mut expr: &Expr) -> &Expr {
    while let Expr::Paren(paren) = expr {
        expr = &*paren.expr;
    }
    expr
}

fn member_name(member: &MemberExpr) -> Option<&str> {
    match &member.prop {
        MemberProp::Ident(ident) => Some(&*ident.sym),
        _ => None,
    }
}

/// Name a call resolves to: the identifier itself or the last property of a
/// member chain, optional or not.
fn callee_name(callee: &Expr) -> Option<&str> {
    match unparenthesized(callee) {
        Expr::Ident(ident) => Some(&*ident.sym),
        Expr::Member(member) => member_name(member),
        Expr::OptChain(chain) => match &*chain.base {
            OptChainBase::Member(member) => member_name(member),
            OptChainBase::Call(_) => None,
        },
        _ => None,
    }
}

/// A plain call or the call link of an optional chain.
#[derive(Clone, Copy)]
struct Call<'a> {
    span: SourcePos,
    callee: &'a Expr,
    args: &'a [ExprOrSpread],
}

impl<'a> Call<'a> {
    fn plain(call: &'a CallExpr) -> Option<Self> {
        let Callee::Expr(callee) = &call.callee else {
            return None;
        };
        Some(Self {
            span: call.span,
            callee,
            args: &call.args,
        })
    }

    fn optional(call: &'a OptCall) -> Self {
        Self {
            span: call.span,
            callee: &call.callee,
            args: &call.args,
        }
    }
}

#[derive(Clone, Copy)]
enum FunctionBody<'a> {
    Block(&'a BlockStmt),
    Expr(&'a Expr),
}

impl<'a> FunctionBody<'a> {
    /// Body of an async function or arrow expression; `None` for anything
    /// else.
    fn of_async(expr: &'a Expr) -> Option<Self> {
        match expr {
            Expr::Fn(function) if function.function.is_async => {
                function.function.body.as_ref().map(FunctionBody::Block)
            }
            Expr::Arrow(arrow) if arrow.is_async => Some(match &*arrow.body {
                BlockStmtOrExpr::BlockStmt(block) => FunctionBody::Block(block),
                BlockStmtOrExpr::Expr(expr) => FunctionBody::Expr(expr),
            }),
            _ => None,
        }
    }

    fn span(self) -> Span {
        match self {
            FunctionBody::Block(block) => Span::from(block.span),
            FunctionBody::Expr(expr) => Span::from(expr.span()),
        }
    }
}

fn is_function(expr: &Expr) -> bool {
    matches!(expr, Expr::Fn(_) | Expr::Arrow(_))
}

fn key_name(key: &PropName) -> Option<&str> {
    match key {
        PropName::Ident(ident) => Some(&*ident.sym),
        PropName::Str(string) => Some(&*string.value),
        _ => None,
    }
}

struct TriggerVisitor<'o, 'e> {
    options: &'o TransformerOptions,
    edits: &'e mut EditBuffer,
    detected: bool,
    error: Option<TransformError>,
}

impl<'o, 'e> TriggerVisitor<'o, 'e> {
    fn is_trigger(&self, name: &str) -> bool {
        self.options.async_functions.iter().any(|trigger| trigger == name)
    }

    fn visit_call(&mut self, call: Call<'_>) -> Result<(), TransformError> {
        let Some(name) = callee_name(call.callee) else {
            return Ok(());
        };

        let options = self.options;
        if self.is_trigger(name) {
            self.rewrite_trigger(name, call)?;
        }
        if let Some(keys) = options.object_definitions.get(name) {
            self.rewrite_definition(keys, call);
        }
        Ok(())
    }

    fn rewrite_trigger(&mut self, name: &str, call: Call<'_>) -> Result<(), TransformError> {
        let functions: Vec<&Expr> = call
            .args
            .iter()
            .filter(|argument| argument.spread.is_none())
            .map(|argument| &*argument.expr)
            .filter(|expr| is_function(expr))
            .collect();
        if functions.is_empty() {
            return Err(TransformError::MalformedTriggerUsage {
                callee: name.to_string(),
                span: Span::from(call.span),
            });
        }

        for function in functions {
            if let Some(body) = FunctionBody::of_async(function) {
                self.rewrite_body(body);
            }
        }

        let marks_rewritten = !self
            .options
            .direct_call_functions
            .iter()
            .any(|direct| direct == name);
        if marks_rewritten {
            if let Some(last) = call.args.last() {
                self.edits.append_right(Span::from(last.expr.span()).end, ",1");
            }
        }
        Ok(())
    }

    fn rewrite_definition(&mut self, keys: &[String], call: Call<'_>) {
        for argument in call.args {
            let Expr::Object(object) = &*argument.expr else {
                continue;
            };
            for member in &object.props {
                let PropOrSpread::Prop(prop) = member else {
                    continue;
                };
                let (key, body) = match &**prop {
                    Prop::KeyValue(prop) => (&prop.key, FunctionBody::of_async(&prop.value)),
                    Prop::Method(method) if method.function.is_async => (
                        &method.key,
                        method.function.body.as_ref().map(FunctionBody::Block),
                    ),
                    _ => continue,
                };
                let listed =
                    key_name(key).map_or(false, |key| keys.iter().any(|listed| listed == key));
                if let (true, Some(body)) = (listed, body) {
                    self.rewrite_body(body);
                }
            }
        }
    }

    fn rewrite_body(&mut self, body: FunctionBody<'_>) {
        let mut rewriter = AwaitRewriter {
            edits: &mut *self.edits,
            statements: HashSet::new(),
            rewritten: 0,
        };
        match body {
            FunctionBody::Block(block) => block.visit_with(&mut rewriter),
            FunctionBody::Expr(expr) => expr.visit_with(&mut rewriter),
        }
        let rewritten = rewriter.rewritten;
        if rewritten == 0 {
            return;
        }

        let span = body.span();
        debug!(rewritten, start = span.start, "rewrote suspension points");
        self.detected = true;
        match body {
            FunctionBody::Block(_) => {
                self.edits.append_left(span.start + 1, TEMP_DECLARATION);
            }
            FunctionBody::Expr(_) => {
                self.edits
                    .prepend_left(span.start, &format!("{{{TEMP_DECLARATION}return "))
                    .append_right(span.end, "}");
            }
        }
    }
}

impl TriggerVisitor<'_, '_> {
    /// Records the first failure; returns whether to keep descending.
    fn enter(&mut self, call: Option<Call<'_>>) -> bool {
        if self.error.is_some() {
            return false;
        }
        match call.map(|call| self.visit_call(call)) {
            Some(Err(err)) => {
                self.error = Some(err);
                false
            }
            _ => true,
        }
    }
}

impl Visit for TriggerVisitor<'_, '_> {
    fn visit_call_expr(&mut self, call: &CallExpr) {
        if self.enter(Call::plain(call)) {
            call.visit_children_with(self);
        }
    }

    fn visit_opt_call(&mut self, call: &OptCall) {
        if self.enter(Some(Call::optional(call))) {
            call.visit_children_with(self);
        }
    }
}

/// Rewrites the `await`s that belong to one function body. Nested functions
/// and classes are separate bodies and are left alone.
struct AwaitRewriter<'e> {
    edits: &'e mut EditBuffer,
    /// Starts of `await`s that form a whole statement of a statement list.
    statements: HashSet<BytePos>,
    rewritten: usize,
}

impl AwaitRewriter<'_> {
    fn collect_statement(&mut self, stmt: &Stmt) {
        if let Stmt::Expr(stmt) = stmt {
            if let Expr::Await(await_expr) = &*stmt.expr {
                self.statements.insert(await_expr.span.lo);
            }
        }
    }

    fn rewrite(&mut self, await_expr: &AwaitExpr) {
        let statement = self.statements.contains(&await_expr.span.lo);
        let span = Span::from(await_expr.span);
        let argument = &*await_expr.arg;
        let argument_span = Span::from(argument.span());
        // `()=>{` would open a block.
        let object = matches!(unparenthesized(argument), Expr::Object(_));
        let (open, close) = if object { ("(", ")") } else { ("", "") };

        let prefix = format!(
            "{}(([__temp,__restore]=__executeAsync(()=>{open}",
            if statement { ";" } else { "" }
        );
        let suffix = if statement {
            format!("{close})),await __temp,__restore());")
        } else {
            format!("{close})),__temp=await __temp,__restore(),__temp)")
        };

        self.edits
            .remove(span.start, argument_span.start)
            .append_left(argument_span.start, &prefix)
            .prepend_right(argument_span.end, &suffix);
        self.rewritten += 1;
    }
}

impl Visit for AwaitRewriter<'_> {
    fn visit_stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.collect_statement(stmt);
        }
        for stmt in stmts {
            stmt.visit_with(self);
        }
    }

    fn visit_module_items(&mut self, items: &[ModuleItem]) {
        for item in items {
            if let ModuleItem::Stmt(stmt) = item {
                self.collect_statement(stmt);
            }
        }
        for item in items {
            item.visit_with(self);
        }
    }

    fn visit_await_expr(&mut self, await_expr: &AwaitExpr) {
        self.rewrite(await_expr);
        await_expr.visit_children_with(self);
    }

    fn visit_function(&mut self, _: &Function) {}

    fn visit_arrow_expr(&mut self, _: &ArrowExpr) {}

    fn visit_class(&mut self, _: &Class) {}
}
