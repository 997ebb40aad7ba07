//! AST Sanitizer
//!
//! Parses a source-code payload to a real AST and walks it once, rejecting
//! constructs on the blacklist before any code is executed. Mirrors the
//! `_SafetyVisitor` walk in `ast_sanitizer.py`, but backed by a genuine
//! parser instead of string matching.

use rustpython_parser::{ast, Parse};
use serde::{Deserialize, Serialize};

const BLACKLISTED_FUNCTIONS: &[&str] = &["eval", "exec", "compile", "__import__", "execfile", "input"];

const BLACKLISTED_MODULES: &[&str] = &[
    "os", "sys", "subprocess", "importlib", "ctypes", "cffi", "socket", "pickle", "shelve",
    "marshal", "builtins", "pty", "termios",
];

const BLACKLISTED_ATTRIBUTES: &[&str] = &[
    "__class__",
    "__bases__",
    "__mro__",
    "__subclasses__",
    "__globals__",
    "__builtins__",
    "__code__",
    "__closure__",
    "__dict__",
];

const SHELL_SINKS: &[&str] = &[
    "subprocess.call",
    "subprocess.run",
    "subprocess.Popen",
    "subprocess.check_output",
];

const PROTECTED_PATH_PREFIXES: &[&str] = &[
    "/etc/", "/sys/", "/proc/", "/root/", "/boot/", "/dev/", "~/.ssh", ".env",
];

const PATH_SINKS: &[&str] = &["open", "pathlib.Path"];

/// A single rejected construct.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizationViolation {
    pub rule: String,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl SanitizationViolation {
    fn new(rule: &str, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            rule: rule.to_string(),
            message: message.into(),
            line,
            column,
        }
    }
}

/// Outcome of sanitizing one source payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizationResult {
    pub safe: bool,
    pub violations: Vec<SanitizationViolation>,
    pub syntax_error: bool,
}

impl SanitizationResult {
    fn safe() -> Self {
        Self {
            safe: true,
            violations: Vec::new(),
            syntax_error: false,
        }
    }

    fn syntax_error() -> Self {
        Self {
            safe: false,
            violations: Vec::new(),
            syntax_error: true,
        }
    }

    fn from_violations(violations: Vec<SanitizationViolation>) -> Self {
        Self {
            safe: violations.is_empty(),
            violations,
            syntax_error: false,
        }
    }
}

/// Parses and walks a Python-shaped source payload, rejecting constructs
/// on the blacklist. Extensions to the blacklist are additive only; the
/// sanitizer never removes protections at runtime.
pub struct AstSanitizer {
    extra_blacklisted_functions: Vec<String>,
}

impl AstSanitizer {
    pub fn new() -> Self {
        Self {
            extra_blacklisted_functions: Vec::new(),
        }
    }

    pub fn with_extra_blacklist(functions: Vec<String>) -> Self {
        Self {
            extra_blacklisted_functions: functions,
        }
    }

    pub fn sanitize(&self, source: &str, filename: &str) -> SanitizationResult {
        if source.trim().is_empty() {
            return SanitizationResult::safe();
        }

        let suite = match ast::Suite::parse(source, filename) {
            Ok(suite) => suite,
            Err(_) => return SanitizationResult::syntax_error(),
        };

        let lines = LineIndex::new(source);
        let mut violations = Vec::new();
        for stmt in &suite {
            self.visit_stmt(stmt, &lines, &mut violations);
        }
        SanitizationResult::from_violations(violations)
    }

    pub fn is_safe(&self, source: &str, filename: &str) -> bool {
        self.sanitize(source, filename).safe
    }

    fn visit_block(&self, block: &[ast::Stmt], lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        for s in block {
            self.visit_stmt(s, lines, violations);
        }
    }

    fn visit_opt_expr(&self, expr: &Option<ast::Expr>, lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        if let Some(e) = expr {
            self.visit_expr(e, lines, violations);
        }
    }

    /// Same as `visit_opt_expr`, for the `Option<Box<Expr>>` fields that
    /// nested (self-referential) expression nodes use.
    fn visit_opt_boxed_expr(
        &self,
        expr: &Option<Box<ast::Expr>>,
        lines: &LineIndex,
        violations: &mut Vec<SanitizationViolation>,
    ) {
        if let Some(e) = expr {
            self.visit_expr(e, lines, violations);
        }
    }

    fn visit_exprs(&self, exprs: &[ast::Expr], lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        for e in exprs {
            self.visit_expr(e, lines, violations);
        }
    }

    /// Visits the default-value expressions of a parameter list: a default
    /// like `def f(x=eval(y)):` must not bypass the blacklist.
    fn visit_arguments(&self, args: &ast::Arguments, lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        self.visit_exprs(&args.defaults, lines, violations);
        for kw_default in args.kw_defaults.iter().flatten() {
            self.visit_expr(kw_default, lines, violations);
        }
    }

    fn visit_withitems(&self, items: &[ast::Withitem], lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        for item in items {
            self.visit_expr(&item.context_expr, lines, violations);
        }
    }

    fn visit_except_handlers(
        &self,
        handlers: &[ast::ExceptHandler],
        lines: &LineIndex,
        violations: &mut Vec<SanitizationViolation>,
    ) {
        for handler in handlers {
            let ast::ExceptHandler::ExceptHandler(handler) = handler;
            self.visit_opt_expr(&handler.type_, lines, violations);
            self.visit_block(&handler.body, lines, violations);
        }
    }

    /// Walks every statement kind, recursing into every nested statement
    /// and expression so a blacklisted construct can't hide inside a
    /// comprehension, lambda, match arm, try/except body, or any other
    /// compound statement.
    fn visit_stmt(&self, stmt: &ast::Stmt, lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        match stmt {
            ast::Stmt::Import(import) => {
                for alias in &import.names {
                    let first_segment = alias.name.split('.').next().unwrap_or(&alias.name);
                    if BLACKLISTED_MODULES.contains(&first_segment) {
                        let (line, column) = lines.locate(import.range.start());
                        violations.push(SanitizationViolation::new(
                            "blacklisted_import",
                            format!("import of blacklisted module '{}'", alias.name),
                            line,
                            column,
                        ));
                    }
                }
            }
            ast::Stmt::ImportFrom(import_from) => {
                if let Some(module) = &import_from.module {
                    let first_segment = module.split('.').next().unwrap_or(module.as_str());
                    if BLACKLISTED_MODULES.contains(&first_segment) {
                        let (line, column) = lines.locate(import_from.range.start());
                        violations.push(SanitizationViolation::new(
                            "blacklisted_import",
                            format!("import from blacklisted module '{}'", module),
                            line,
                            column,
                        ));
                    }
                }
            }
            ast::Stmt::Expr(expr_stmt) => self.visit_expr(&expr_stmt.value, lines, violations),
            ast::Stmt::Assign(assign) => {
                self.visit_exprs(&assign.targets, lines, violations);
                self.visit_expr(&assign.value, lines, violations);
            }
            ast::Stmt::AugAssign(aug) => {
                self.visit_expr(&aug.target, lines, violations);
                self.visit_expr(&aug.value, lines, violations);
            }
            ast::Stmt::AnnAssign(ann) => {
                self.visit_expr(&ann.target, lines, violations);
                self.visit_opt_expr(&ann.value, lines, violations);
            }
            ast::Stmt::If(if_stmt) => {
                self.visit_expr(&if_stmt.test, lines, violations);
                self.visit_block(&if_stmt.body, lines, violations);
                self.visit_block(&if_stmt.orelse, lines, violations);
            }
            ast::Stmt::For(for_stmt) => {
                self.visit_expr(&for_stmt.target, lines, violations);
                self.visit_expr(&for_stmt.iter, lines, violations);
                self.visit_block(&for_stmt.body, lines, violations);
                self.visit_block(&for_stmt.orelse, lines, violations);
            }
            ast::Stmt::AsyncFor(for_stmt) => {
                self.visit_expr(&for_stmt.target, lines, violations);
                self.visit_expr(&for_stmt.iter, lines, violations);
                self.visit_block(&for_stmt.body, lines, violations);
                self.visit_block(&for_stmt.orelse, lines, violations);
            }
            ast::Stmt::While(while_stmt) => {
                self.visit_expr(&while_stmt.test, lines, violations);
                self.visit_block(&while_stmt.body, lines, violations);
                self.visit_block(&while_stmt.orelse, lines, violations);
            }
            ast::Stmt::FunctionDef(func) => {
                self.visit_arguments(&func.args, lines, violations);
                self.visit_block(&func.body, lines, violations);
            }
            ast::Stmt::AsyncFunctionDef(func) => {
                self.visit_arguments(&func.args, lines, violations);
                self.visit_block(&func.body, lines, violations);
            }
            ast::Stmt::ClassDef(class) => {
                self.visit_exprs(&class.bases, lines, violations);
                self.visit_block(&class.body, lines, violations);
            }
            ast::Stmt::With(with_stmt) => {
                self.visit_withitems(&with_stmt.items, lines, violations);
                self.visit_block(&with_stmt.body, lines, violations);
            }
            ast::Stmt::AsyncWith(with_stmt) => {
                self.visit_withitems(&with_stmt.items, lines, violations);
                self.visit_block(&with_stmt.body, lines, violations);
            }
            ast::Stmt::Match(match_stmt) => {
                self.visit_expr(&match_stmt.subject, lines, violations);
                for case in &match_stmt.cases {
                    self.visit_opt_expr(&case.guard, lines, violations);
                    self.visit_block(&case.body, lines, violations);
                }
            }
            ast::Stmt::Raise(raise) => {
                self.visit_opt_expr(&raise.exc, lines, violations);
                self.visit_opt_expr(&raise.cause, lines, violations);
            }
            ast::Stmt::Try(try_stmt) => {
                self.visit_block(&try_stmt.body, lines, violations);
                self.visit_except_handlers(&try_stmt.handlers, lines, violations);
                self.visit_block(&try_stmt.orelse, lines, violations);
                self.visit_block(&try_stmt.finalbody, lines, violations);
            }
            ast::Stmt::TryStar(try_stmt) => {
                self.visit_block(&try_stmt.body, lines, violations);
                self.visit_except_handlers(&try_stmt.handlers, lines, violations);
                self.visit_block(&try_stmt.orelse, lines, violations);
                self.visit_block(&try_stmt.finalbody, lines, violations);
            }
            ast::Stmt::Assert(assert_stmt) => {
                self.visit_expr(&assert_stmt.test, lines, violations);
                self.visit_opt_expr(&assert_stmt.msg, lines, violations);
            }
            ast::Stmt::Delete(delete) => {
                self.visit_exprs(&delete.targets, lines, violations);
            }
            ast::Stmt::Return(ret) => {
                self.visit_opt_expr(&ret.value, lines, violations);
            }
            ast::Stmt::Global(_) | ast::Stmt::Nonlocal(_) | ast::Stmt::Pass(_) | ast::Stmt::Break(_) | ast::Stmt::Continue(_) => {}
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    /// Walks every expression kind, recursing into every nested expression
    /// (including comprehension/lambda/conditional sub-expressions) so a
    /// blacklisted call or attribute can't hide behind them.
    fn visit_expr(&self, expr: &ast::Expr, lines: &LineIndex, violations: &mut Vec<SanitizationViolation>) {
        match expr {
            ast::Expr::Call(call) => {
                let name = Self::resolve_call_name(&call.func);
                if let Some(name) = &name {
                    let base_name = name.rsplit('.').next().unwrap_or(name);
                    if BLACKLISTED_FUNCTIONS.contains(&base_name)
                        || self
                            .extra_blacklisted_functions
                            .iter()
                            .any(|f| f == base_name)
                    {
                        let (line, column) = lines.locate(call.range.start());
                        violations.push(SanitizationViolation::new(
                            "blacklisted_call",
                            format!("call to blacklisted function '{}'", name),
                            line,
                            column,
                        ));
                    }

                    if SHELL_SINKS.contains(&name.as_str()) {
                        for kw in &call.keywords {
                            if kw.arg.as_deref() == Some("shell") && Self::is_truthy_literal(&kw.value) {
                                let (line, column) = lines.locate(call.range.start());
                                violations.push(SanitizationViolation::new(
                                    "shell_true",
                                    "shell=True passed to a subprocess sink",
                                    line,
                                    column,
                                ));
                            }
                        }
                    }

                    if PATH_SINKS.contains(&name.as_str()) {
                        if let Some(ast::Expr::Constant(c)) = call.args.first() {
                            if let ast::Constant::Str(s) = &c.value {
                                if PROTECTED_PATH_PREFIXES.iter().any(|p| s.starts_with(p)) {
                                    let (line, column) = lines.locate(call.range.start());
                                    violations.push(SanitizationViolation::new(
                                        "protected_path",
                                        format!("access to protected path '{}'", s),
                                        line,
                                        column,
                                    ));
                                }
                            }
                        }
                    }
                }
                self.visit_expr(&call.func, lines, violations);
                self.visit_exprs(&call.args, lines, violations);
                for kw in &call.keywords {
                    self.visit_expr(&kw.value, lines, violations);
                }
            }
            ast::Expr::Attribute(attr) => {
                if BLACKLISTED_ATTRIBUTES.contains(&attr.attr.as_str()) {
                    let (line, column) = lines.locate(attr.range.start());
                    violations.push(SanitizationViolation::new(
                        "blacklisted_attribute",
                        format!("access to blacklisted attribute '{}'", attr.attr),
                        line,
                        column,
                    ));
                }
                self.visit_expr(&attr.value, lines, violations);
            }
            ast::Expr::BinOp(binop) => {
                self.visit_expr(&binop.left, lines, violations);
                self.visit_expr(&binop.right, lines, violations);
            }
            ast::Expr::UnaryOp(unaryop) => {
                self.visit_expr(&unaryop.operand, lines, violations);
            }
            ast::Expr::BoolOp(boolop) => {
                self.visit_exprs(&boolop.values, lines, violations);
            }
            ast::Expr::NamedExpr(named) => {
                self.visit_expr(&named.target, lines, violations);
                self.visit_expr(&named.value, lines, violations);
            }
            ast::Expr::Lambda(lambda) => {
                self.visit_arguments(&lambda.args, lines, violations);
                self.visit_expr(&lambda.body, lines, violations);
            }
            ast::Expr::IfExp(ifexp) => {
                self.visit_expr(&ifexp.test, lines, violations);
                self.visit_expr(&ifexp.body, lines, violations);
                self.visit_expr(&ifexp.orelse, lines, violations);
            }
            ast::Expr::Dict(dict) => {
                for key in dict.keys.iter().flatten() {
                    self.visit_expr(key, lines, violations);
                }
                self.visit_exprs(&dict.values, lines, violations);
            }
            ast::Expr::Set(set) => {
                self.visit_exprs(&set.elts, lines, violations);
            }
            ast::Expr::ListComp(comp) => {
                self.visit_expr(&comp.elt, lines, violations);
                self.visit_comprehensions(&comp.generators, lines, violations);
            }
            ast::Expr::SetComp(comp) => {
                self.visit_expr(&comp.elt, lines, violations);
                self.visit_comprehensions(&comp.generators, lines, violations);
            }
            ast::Expr::GeneratorExp(comp) => {
                self.visit_expr(&comp.elt, lines, violations);
                self.visit_comprehensions(&comp.generators, lines, violations);
            }
            ast::Expr::DictComp(comp) => {
                self.visit_expr(&comp.key, lines, violations);
                self.visit_expr(&comp.value, lines, violations);
                self.visit_comprehensions(&comp.generators, lines, violations);
            }
            ast::Expr::Await(await_expr) => {
                self.visit_expr(&await_expr.value, lines, violations);
            }
            ast::Expr::Yield(yield_expr) => {
                self.visit_opt_boxed_expr(&yield_expr.value, lines, violations);
            }
            ast::Expr::YieldFrom(yield_expr) => {
                self.visit_expr(&yield_expr.value, lines, violations);
            }
            ast::Expr::Compare(cmp) => {
                self.visit_expr(&cmp.left, lines, violations);
                self.visit_exprs(&cmp.comparators, lines, violations);
            }
            ast::Expr::FormattedValue(fv) => {
                self.visit_expr(&fv.value, lines, violations);
                self.visit_opt_boxed_expr(&fv.format_spec, lines, violations);
            }
            ast::Expr::JoinedStr(joined) => {
                self.visit_exprs(&joined.values, lines, violations);
            }
            ast::Expr::Subscript(sub) => {
                self.visit_expr(&sub.value, lines, violations);
                self.visit_expr(&sub.slice, lines, violations);
            }
            ast::Expr::Starred(starred) => {
                self.visit_expr(&starred.value, lines, violations);
            }
            ast::Expr::List(list) => {
                self.visit_exprs(&list.elts, lines, violations);
            }
            ast::Expr::Tuple(tuple) => {
                self.visit_exprs(&tuple.elts, lines, violations);
            }
            ast::Expr::Slice(slice) => {
                self.visit_opt_boxed_expr(&slice.lower, lines, violations);
                self.visit_opt_boxed_expr(&slice.upper, lines, violations);
                self.visit_opt_boxed_expr(&slice.step, lines, violations);
            }
            ast::Expr::Constant(_) | ast::Expr::Name(_) => {}
            #[allow(unreachable_patterns)]
            _ => {}
        }
    }

    fn visit_comprehensions(
        &self,
        generators: &[ast::Comprehension],
        lines: &LineIndex,
        violations: &mut Vec<SanitizationViolation>,
    ) {
        for generator in generators {
            self.visit_expr(&generator.target, lines, violations);
            self.visit_expr(&generator.iter, lines, violations);
            self.visit_exprs(&generator.ifs, lines, violations);
        }
    }

    /// Resolves the dotted name of a call's callee: `subprocess.run` or
    /// `eval`. Anything more dynamic than a name/attribute chain resolves
    /// to `None` (not every construct can be statically named; this is not
    /// a gap in blacklisting since such calls can't match a name anyway).
    fn resolve_call_name(expr: &ast::Expr) -> Option<String> {
        match expr {
            ast::Expr::Name(name) => Some(name.id.to_string()),
            ast::Expr::Attribute(attr) => {
                let base = Self::resolve_call_name(&attr.value)?;
                Some(format!("{}.{}", base, attr.attr))
            }
            _ => None,
        }
    }

    /// Truthy-literal detection: only literal `True`/nonzero/nonempty
    /// values trigger `shell_true`. No constant folding.
    fn is_truthy_literal(expr: &ast::Expr) -> bool {
        match expr {
            ast::Expr::Constant(c) => match &c.value {
                ast::Constant::Bool(b) => *b,
                ast::Constant::Int(i) => !i.is_zero(),
                ast::Constant::Str(s) => !s.is_empty(),
                ast::Constant::None => false,
                _ => false,
            },
            _ => false,
        }
    }
}

impl Default for AstSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps byte offsets into `source` to 1-based (line, column) pairs.
/// Built once per `sanitize()` call from the line-start offsets.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self { line_starts }
    }

    /// 1-based (line, column) for a byte offset, counting columns in bytes
    /// from the start of the line.
    fn locate(&self, offset: ast::text_size::TextSize) -> (usize, usize) {
        let offset = usize::from(offset);
        let line_idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = offset - self.line_starts[line_idx] + 1;
        (line_idx + 1, column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_source_is_safe() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("   \n  ", "<test>");
        assert!(result.safe);
    }

    #[test]
    fn blacklisted_import_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("import subprocess\n", "<test>");
        assert!(!result.safe);
        assert_eq!(result.violations[0].rule, "blacklisted_import");
    }

    #[test]
    fn eval_call_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("eval('1+1')\n", "<test>");
        assert!(!result.safe);
        assert_eq!(result.violations[0].rule, "blacklisted_call");
    }

    #[test]
    fn protected_path_open_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("open('/etc/passwd', 'r')\n", "<test>");
        assert!(!result.safe);
        assert_eq!(result.violations[0].rule, "protected_path");
    }

    #[test]
    fn shell_true_on_subprocess_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("subprocess.run(['ls'], shell=True)\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "shell_true"));
    }

    #[test]
    fn blacklisted_attribute_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("x.__class__.__bases__\n", "<test>");
        assert!(!result.safe);
        assert!(result
            .violations
            .iter()
            .any(|v| v.rule == "blacklisted_attribute"));
    }

    #[test]
    fn syntax_error_is_unsafe() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("def (((", "<test>");
        assert!(result.syntax_error);
        assert!(!result.safe);
    }

    #[test]
    fn ordinary_code_is_safe() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("x = 1 + 2\nprint(x)\n", "<test>");
        assert!(result.safe);
    }

    #[test]
    fn additive_blacklist_extension() {
        let sanitizer = AstSanitizer::with_extra_blacklist(vec!["dangerous_fn".to_string()]);
        let result = sanitizer.sanitize("dangerous_fn()\n", "<test>");
        assert!(!result.safe);
    }

    #[test]
    fn eval_inside_list_comprehension_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("[eval(p) for p in data]\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "blacklisted_call"));
    }

    #[test]
    fn eval_inside_lambda_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("f = lambda: eval(payload)\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "blacklisted_call"));
    }

    #[test]
    fn eval_inside_assert_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("assert eval(p)\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "blacklisted_call"));
    }

    #[test]
    fn eval_inside_try_body_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("try:\n    eval(p)\nexcept Exception:\n    pass\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "blacklisted_call"));
    }

    #[test]
    fn protected_path_inside_dict_value_is_rejected() {
        let sanitizer = AstSanitizer::new();
        let result = sanitizer.sanitize("d = {'f': open('/etc/passwd')}\n", "<test>");
        assert!(!result.safe);
        assert!(result.violations.iter().any(|v| v.rule == "protected_path"));
    }
}
