//! Free-identifier analysis and reference rewriting.
//!
//! Declarations are analyzed with the swc resolver: after a resolver pass,
//! any identifier whose syntax context still carries the unresolved mark is
//! free in the declaration and must be bound by the module graph, the host
//! namespace, or a JS global. Member accesses on a free identifier are
//! collected as dotted paths (`ns.foo`) so namespace imports can resolve to
//! the member's canonical name.

use crate::module_index::Declaration;
use std::collections::{BTreeSet, HashMap, HashSet};
use swc_common::{Globals, Mark, SyntaxContext, GLOBALS};
use swc_ecma_ast::{Expr, Ident, MemberExpr, MemberProp, Pat};
use swc_ecma_transforms_base::resolver;
use swc_ecma_visit::{
    noop_visit_mut_type, noop_visit_type, Visit, VisitMut, VisitMutWith, VisitWith,
};

/// The swc mark state shared by every resolver pass over the graph. All
/// declarations in one pipeline are resolved under the same globals so
/// their unresolved contexts are comparable.
pub struct ReferenceMarks {
    pub globals: Globals,
    pub unresolved: Mark,
    pub top_level: Mark,
}

impl ReferenceMarks {
    pub fn new() -> Self {
        let globals = Globals::default();
        let (unresolved, top_level) = GLOBALS.set(&globals, || (Mark::new(), Mark::new()));
        Self {
            globals,
            unresolved,
            top_level,
        }
    }
}

impl Default for ReferenceMarks {
    fn default() -> Self {
        Self::new()
    }
}

/// Re-resolve a declaration and return its free reference paths, sorted.
/// Plain free identifiers yield their name; member access on a free
/// identifier yields `head.member` (one level, enough for namespace
/// imports).
pub fn collect_references(decl: &mut Declaration, marks: &ReferenceMarks) -> Vec<String> {
    let mut scan = CollectFree {
        unresolved: marks.unresolved,
        paths: BTreeSet::new(),
    };
    GLOBALS.set(&marks.globals, || match decl {
        Declaration::Fn(n) => scan_ast(&mut *n.function, marks, &mut scan),
        Declaration::FnExpr(n) => scan_ast(&mut *n.function, marks, &mut scan),
        Declaration::Class(n) => scan_ast(&mut *n.class, marks, &mut scan),
        Declaration::ClassExpr(n) => scan_ast(&mut *n.class, marks, &mut scan),
        Declaration::Var(e) | Declaration::Macro(e) | Declaration::Expr(e) => {
            scan_ast(e, marks, &mut scan)
        }
        Declaration::Alias { .. }
        | Declaration::Namespace { .. }
        | Declaration::Host(_)
        | Declaration::Builtin(_) => {}
    });
    scan.paths.into_iter().collect()
}

fn scan_ast<T>(ast: &mut T, marks: &ReferenceMarks, scan: &mut CollectFree)
where
    T: VisitMutWith<dyn VisitMut> + VisitWith<CollectFree>,
{
    ast.visit_mut_with(&mut resolver(marks.unresolved, marks.top_level, true));
    ast.visit_with(scan);
}

/// Rewrite free references according to `replace`, keyed by the same paths
/// `collect_references` produces. A dotted key collapses the whole member
/// expression into a single identifier. Assumes the resolver marks from the
/// last `collect_references` call are still on the AST.
pub fn rename_references(
    decl: &mut Declaration,
    replace: &HashMap<String, String>,
    marks: &ReferenceMarks,
) {
    let mut rename = RenameFree {
        unresolved: marks.unresolved,
        replace: replace.clone(),
    };
    GLOBALS.set(&marks.globals, || match decl {
        Declaration::Fn(n) => n.function.visit_mut_with(&mut rename),
        Declaration::FnExpr(n) => n.function.visit_mut_with(&mut rename),
        Declaration::Class(n) => n.class.visit_mut_with(&mut rename),
        Declaration::ClassExpr(n) => n.class.visit_mut_with(&mut rename),
        Declaration::Var(e) | Declaration::Macro(e) | Declaration::Expr(e) => {
            e.visit_mut_with(&mut rename)
        }
        Declaration::Alias { .. }
        | Declaration::Namespace { .. }
        | Declaration::Host(_)
        | Declaration::Builtin(_) => {}
    });
}

pub struct CollectFree {
    unresolved: Mark,
    paths: BTreeSet<String>,
}

impl CollectFree {
    fn is_free(&self, ident: &Ident) -> bool {
        ident.ctxt.outer() == self.unresolved
    }
}

impl Visit for CollectFree {
    noop_visit_type!();

    fn visit_member_expr(&mut self, n: &MemberExpr) {
        if let (Expr::Ident(obj), MemberProp::Ident(prop)) = (&*n.obj, &n.prop) {
            if self.is_free(obj) {
                self.paths.insert(format!("{}.{}", obj.sym, prop.sym));
                return;
            }
        }
        n.obj.visit_with(self);
        if let MemberProp::Computed(c) = &n.prop {
            c.expr.visit_with(self);
        }
    }

    fn visit_ident(&mut self, n: &Ident) {
        if self.is_free(n) {
            self.paths.insert(n.sym.to_string());
        }
    }
}

struct RenameFree {
    unresolved: Mark,
    replace: HashMap<String, String>,
}

impl VisitMut for RenameFree {
    noop_visit_mut_type!();

    fn visit_mut_expr(&mut self, e: &mut Expr) {
        if let Expr::Member(m) = e {
            if let (Expr::Ident(obj), MemberProp::Ident(prop)) = (&*m.obj, &m.prop) {
                if obj.ctxt.outer() == self.unresolved {
                    let path = format!("{}.{}", obj.sym, prop.sym);
                    if let Some(to) = self.replace.get(&path) {
                        *e = Expr::Ident(Ident::new(
                            to.clone().into(),
                            m.span,
                            SyntaxContext::empty(),
                        ));
                        return;
                    }
                }
            }
        }
        e.visit_mut_children_with(self);
    }

    fn visit_mut_ident(&mut self, n: &mut Ident) {
        if n.ctxt.outer() == self.unresolved {
            if let Some(to) = self.replace.get(n.sym.as_ref()) {
                n.sym = to.clone().into();
                n.ctxt = SyntaxContext::empty();
            }
        }
    }
}

/// Free variables of a standalone expression, computed with a lexical
/// scope stack instead of resolver marks. Used for closure capture, where
/// the expression is considered on its own rather than inside a module.
pub fn free_variables(expr: &Expr) -> HashSet<String> {
    let mut scan = ScopeScan {
        scopes: vec![HashSet::new()],
        free: HashSet::new(),
    };
    expr.visit_with(&mut scan);
    scan.free
}

struct ScopeScan {
    scopes: Vec<HashSet<String>>,
    free: HashSet<String>,
}

impl ScopeScan {
    fn bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains(name))
    }

    fn bind(&mut self, name: &str) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string());
        }
    }

    fn bind_pat(&mut self, pat: &Pat) {
        match pat {
            Pat::Ident(i) => self.bind(&i.id.sym),
            Pat::Array(a) => {
                for elem in a.elems.iter().flatten() {
                    self.bind_pat(elem);
                }
            }
            Pat::Rest(r) => self.bind_pat(&r.arg),
            Pat::Object(o) => {
                for prop in &o.props {
                    match prop {
                        swc_ecma_ast::ObjectPatProp::KeyValue(kv) => self.bind_pat(&kv.value),
                        swc_ecma_ast::ObjectPatProp::Assign(a) => self.bind(&a.key.sym),
                        swc_ecma_ast::ObjectPatProp::Rest(r) => self.bind_pat(&r.arg),
                    }
                }
            }
            Pat::Assign(a) => self.bind_pat(&a.left),
            Pat::Expr(_) | Pat::Invalid(_) => {}
        }
    }
}

impl Visit for ScopeScan {
    noop_visit_type!();

    fn visit_ident(&mut self, n: &Ident) {
        if !self.bound(&n.sym) {
            self.free.insert(n.sym.to_string());
        }
    }

    fn visit_member_expr(&mut self, n: &MemberExpr) {
        // `a.b` only uses `a`; a plain ident prop is not a reference.
        n.obj.visit_with(self);
        if let MemberProp::Computed(c) = &n.prop {
            c.expr.visit_with(self);
        }
    }

    fn visit_function(&mut self, n: &swc_ecma_ast::Function) {
        self.scopes.push(HashSet::new());
        for param in &n.params {
            self.bind_pat(&param.pat);
        }
        if let Some(body) = &n.body {
            body.visit_with(self);
        }
        self.scopes.pop();
    }

    fn visit_arrow_expr(&mut self, n: &swc_ecma_ast::ArrowExpr) {
        self.scopes.push(HashSet::new());
        for pat in &n.params {
            self.bind_pat(pat);
        }
        n.body.visit_with(self);
        self.scopes.pop();
    }

    fn visit_fn_decl(&mut self, n: &swc_ecma_ast::FnDecl) {
        self.bind(&n.ident.sym);
        n.function.visit_with(self);
    }

    fn visit_class_decl(&mut self, n: &swc_ecma_ast::ClassDecl) {
        self.bind(&n.ident.sym);
        n.class.visit_with(self);
    }

    fn visit_var_declarator(&mut self, n: &swc_ecma_ast::VarDeclarator) {
        self.bind_pat(&n.name);
        if let Some(init) = &n.init {
            init.visit_with(self);
        }
    }

    fn visit_catch_clause(&mut self, n: &swc_ecma_ast::CatchClause) {
        self.scopes.push(HashSet::new());
        if let Some(param) = &n.param {
            self.bind_pat(param);
        }
        n.body.visit_with(self);
        self.scopes.pop();
    }

    fn visit_block_stmt(&mut self, n: &swc_ecma_ast::BlockStmt) {
        self.scopes.push(HashSet::new());
        n.visit_children_with(self);
        self.scopes.pop();
    }

    fn visit_prop(&mut self, n: &swc_ecma_ast::Prop) {
        // `{ key: value }` — a plain key is not a reference, shorthand is.
        match n {
            swc_ecma_ast::Prop::Shorthand(i) => self.visit_ident(i),
            swc_ecma_ast::Prop::KeyValue(kv) => {
                if let swc_ecma_ast::PropName::Computed(c) = &kv.key {
                    c.expr.visit_with(self);
                }
                kv.value.visit_with(self);
            }
            _ => n.visit_children_with(self),
        }
    }
}

/// Names the script engine provides on its own; they never enter the
/// declaration graph.
pub fn is_js_global(name: &str) -> bool {
    matches!(
        name,
        "globalThis" | "undefined" | "NaN" | "Infinity"
        | "Object" | "Function" | "Boolean" | "Symbol"
        | "Number" | "BigInt" | "Math" | "Date"
        | "String" | "RegExp"
        | "Array" | "Int8Array" | "Uint8Array" | "Uint8ClampedArray"
        | "Int16Array" | "Uint16Array" | "Int32Array" | "Uint32Array"
        | "Float32Array" | "Float64Array" | "BigInt64Array" | "BigUint64Array"
        | "Map" | "Set" | "WeakMap" | "WeakSet" | "WeakRef" | "FinalizationRegistry"
        | "ArrayBuffer" | "SharedArrayBuffer" | "DataView"
        | "Promise" | "Proxy" | "Reflect"
        | "Error" | "AggregateError" | "EvalError" | "RangeError"
        | "ReferenceError" | "SyntaxError" | "TypeError" | "URIError"
        | "JSON" | "Intl" | "Atomics"
        | "eval" | "isFinite" | "isNaN" | "parseFloat" | "parseInt"
        | "decodeURI" | "decodeURIComponent" | "encodeURI" | "encodeURIComponent"
        | "queueMicrotask" | "structuredClone"
        | "console"
        | "TextEncoder" | "TextDecoder"
        | "atob" | "btoa"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_expr_text;
    use std::rc::Rc;
    use swc_common::SourceMap;

    fn expr(code: &str) -> Expr {
        let cm: Rc<SourceMap> = Default::default();
        parse_expr_text(&cm, code).unwrap()
    }

    #[test]
    fn literal_has_no_free_variables() {
        assert!(free_variables(&expr("42")).is_empty());
    }

    #[test]
    fn parameters_are_not_free() {
        let free = free_variables(&expr("(a, b) => a + b + c"));
        assert_eq!(free, HashSet::from(["c".to_string()]));
    }

    #[test]
    fn nested_arrows_see_outer_bindings() {
        let free = free_variables(&expr("() => () => add(1, 2)"));
        assert_eq!(free, HashSet::from(["add".to_string()]));
    }

    #[test]
    fn shorthand_props_are_references_but_keys_are_not() {
        let free = free_variables(&expr("({ key: value, shorthand })"));
        assert_eq!(
            free,
            HashSet::from(["value".to_string(), "shorthand".to_string()])
        );
    }

    #[test]
    fn member_props_are_not_references() {
        let free = free_variables(&expr("ns.foo(x)"));
        assert_eq!(free, HashSet::from(["ns".to_string(), "x".to_string()]));
    }

    #[test]
    fn block_scoped_bindings_shadow() {
        let free = free_variables(&expr("() => { const inner = outer; return inner; }"));
        assert_eq!(free, HashSet::from(["outer".to_string()]));
    }

    #[test]
    fn collect_sees_through_local_shadowing() {
        let marks = ReferenceMarks::new();
        let mut decl = Declaration::Var(expr("(x) => { const local = helper(x); return other; }"));
        let refs = collect_references(&mut decl, &marks);
        assert_eq!(refs, vec!["helper".to_string(), "other".to_string()]);
    }

    #[test]
    fn collect_records_namespace_member_paths() {
        let marks = ReferenceMarks::new();
        let mut decl = Declaration::Var(expr("() => ns.foo(1) + bare"));
        let refs = collect_references(&mut decl, &marks);
        assert_eq!(refs, vec!["bare".to_string(), "ns.foo".to_string()]);
    }

    #[test]
    fn rename_rewrites_free_uses_only() {
        let marks = ReferenceMarks::new();
        let mut decl = Declaration::Var(expr("(helper) => helper(other)"));
        collect_references(&mut decl, &marks);
        let replace = HashMap::from([
            ("helper".to_string(), "declaration_0".to_string()),
            ("other".to_string(), "declaration_1".to_string()),
        ]);
        rename_references(&mut decl, &replace, &marks);
        let code = crate::emit::print_expr(
            &Default::default(),
            match &decl {
                Declaration::Var(e) => e,
                _ => unreachable!(),
            },
        );
        assert!(code.contains("helper(declaration_1)"));
        assert!(!code.contains("declaration_0"));
    }

    #[test]
    fn rename_collapses_namespace_members() {
        let marks = ReferenceMarks::new();
        let mut decl = Declaration::Var(expr("() => ns.foo(1)"));
        collect_references(&mut decl, &marks);
        let replace = HashMap::from([("ns.foo".to_string(), "declaration_2".to_string())]);
        rename_references(&mut decl, &replace, &marks);
        let code = crate::emit::print_expr(
            &Default::default(),
            match &decl {
                Declaration::Var(e) => e,
                _ => unreachable!(),
            },
        );
        assert!(code.contains("declaration_2(1)"));
    }
}
