//! Iterative macro expansion.
//!
//! Each pass walks the reachable declarations in canonical order, finds
//! call sites whose callee resolves to a macro, expands them, and
//! re-indexes the rewritten declarations. Passes repeat until no site
//! remains; a bounded iteration count turns self-perpetuating macros into
//! a `MacroExpansionLimitExceeded` error instead of a hang.
//!
//! Builtin macros (`closure`, `canonicalName`, `tuple`, `unsafeCast`)
//! rewrite in the bundler. User macros run inside the engine: the macro's
//! dependency subgraph is emitted as a side program, the arguments are
//! captured syntactically as Closures, and the returned closure text is
//! parsed and spliced back into the call site with its references aliased
//! to fresh local names.

use crate::canonical::CanonicalName;
use crate::closure::{capture_closure, infer_ast_kind, js_string, Closure, MacroOutcome};
use crate::emit::emit_macro_program;
use crate::error::FuneeError;
use crate::graph::DeclarationGraph;
use crate::macro_host::MacroHost;
use crate::module_index::{BuiltinMacro, Declaration};
use crate::parse::parse_expr_text;
use crate::references::{collect_references, rename_references};
use petgraph::graph::NodeIndex;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;
use swc_common::{SourceMap, Span, GLOBALS};
use swc_ecma_ast::{
    ArrayLit, CallExpr, Callee, Expr, ExprOrSpread, FnExpr, MemberProp,
};
use swc_ecma_utils::ExprFactory;
use swc_ecma_visit::{
    noop_visit_mut_type, noop_visit_type, Visit, VisitMut, VisitMutWith, VisitWith,
};

pub struct ExpandOptions {
    pub iteration_limit: usize,
    pub budget: Duration,
}

impl Default for ExpandOptions {
    fn default() -> Self {
        Self {
            iteration_limit: 100,
            budget: Duration::from_secs(30),
        }
    }
}

/// Expand every macro call site in the graph, to fixpoint.
pub fn expand_macros(
    g: &mut DeclarationGraph,
    options: &ExpandOptions,
) -> Result<(), FuneeError> {
    let mut engine: Option<MacroHost> = None;

    for _ in 0..options.iteration_limit {
        let mut changed = false;
        let reachable = g.reachable();
        for nx in g.sorted_nodes() {
            if !reachable.contains(&nx) {
                continue;
            }
            changed |= expand_node(g, nx, &mut engine, options)?;
        }
        if !changed {
            return Ok(());
        }
    }

    let mut sites: Vec<CanonicalName> = Vec::new();
    let reachable = g.reachable();
    for nx in g.sorted_nodes() {
        if !reachable.contains(&nx) || !expandable(&g.graph[nx].decl) {
            continue;
        }
        for site in find_macro_sites(g, nx) {
            sites.push(g.graph[site.target].canonical.clone());
        }
    }
    sites.sort();
    sites.dedup();
    Err(FuneeError::MacroExpansionLimitExceeded {
        iterations: options.iteration_limit,
        sites,
    })
}

/// Macro bodies are never rewritten: they execute at expansion time, where
/// calls to other macros are ordinary function calls in the side program.
fn expandable(decl: &Declaration) -> bool {
    matches!(
        decl,
        Declaration::Fn(_)
            | Declaration::FnExpr(_)
            | Declaration::Class(_)
            | Declaration::ClassExpr(_)
            | Declaration::Var(_)
            | Declaration::Expr(_)
    )
}

fn expand_node(
    g: &mut DeclarationGraph,
    nx: NodeIndex,
    engine: &mut Option<MacroHost>,
    options: &ExpandOptions,
) -> Result<bool, FuneeError> {
    if !expandable(&g.graph[nx].decl) {
        return Ok(false);
    }
    let sites = find_macro_sites(g, nx);
    if sites.is_empty() {
        return Ok(false);
    }

    let mut decl = g.graph[nx].decl.clone();
    let mut changed = false;
    for site in sites {
        // An outer expansion in the same pass may have consumed this site.
        if !contains_call(&decl, site.span) {
            continue;
        }
        let replacement = expand_site(g, nx, &site, engine, options)?;
        let mut splice = SpliceCall {
            span: site.span,
            replacement: Some(replacement),
        };
        rewrite_decl(&mut decl, &mut splice);
        changed |= splice.replacement.is_none();
    }

    g.graph[nx].decl = decl;
    g.reindex_node(nx)?;
    Ok(changed)
}

struct MacroSite {
    span: Span,
    target: NodeIndex,
    args: Vec<ExprOrSpread>,
}

fn find_macro_sites(g: &DeclarationGraph, nx: NodeIndex) -> Vec<MacroSite> {
    let mut macro_edges: HashMap<String, NodeIndex> = HashMap::new();
    for (path, target) in g.edge_targets(nx) {
        if matches!(
            g.graph[target].decl,
            Declaration::Macro(_) | Declaration::Builtin(_)
        ) {
            macro_edges.insert(path, target);
        }
    }
    if macro_edges.is_empty() {
        return Vec::new();
    }

    let mut scan = SiteScan {
        unresolved: g.marks().unresolved,
        edges: macro_edges,
        sites: Vec::new(),
    };
    GLOBALS.set(&g.marks().globals, || {
        scan_decl(&g.graph[nx].decl, &mut scan);
    });
    // Source order; an outer call starts before the calls in its argument
    // list, so outermost sites expand first.
    scan.sites.sort_by_key(|s| (s.span.lo, s.span.hi));
    scan.sites
}

struct SiteScan {
    unresolved: swc_common::Mark,
    edges: HashMap<String, NodeIndex>,
    sites: Vec<MacroSite>,
}

impl SiteScan {
    fn callee_path(&self, callee: &Callee) -> Option<String> {
        let Callee::Expr(expr) = callee else {
            return None;
        };
        match &**expr {
            Expr::Ident(i) if i.ctxt.outer() == self.unresolved => Some(i.sym.to_string()),
            Expr::Member(m) => match (&*m.obj, &m.prop) {
                (Expr::Ident(obj), MemberProp::Ident(prop))
                    if obj.ctxt.outer() == self.unresolved =>
                {
                    Some(format!("{}.{}", obj.sym, prop.sym))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl Visit for SiteScan {
    noop_visit_type!();

    fn visit_call_expr(&mut self, call: &CallExpr) {
        call.visit_children_with(self);
        if let Some(path) = self.callee_path(&call.callee) {
            if let Some(&target) = self.edges.get(&path) {
                self.sites.push(MacroSite {
                    span: call.span,
                    target,
                    args: call.args.clone(),
                });
            }
        }
    }
}

fn scan_decl<V: Visit>(decl: &Declaration, v: &mut V) {
    match decl {
        Declaration::Fn(n) => n.function.visit_with(v),
        Declaration::FnExpr(n) => n.function.visit_with(v),
        Declaration::Class(n) => n.class.visit_with(v),
        Declaration::ClassExpr(n) => n.class.visit_with(v),
        Declaration::Var(e) | Declaration::Macro(e) | Declaration::Expr(e) => e.visit_with(v),
        _ => {}
    }
}

fn rewrite_decl<V: VisitMut>(decl: &mut Declaration, v: &mut V) {
    match decl {
        Declaration::Fn(n) => n.function.visit_mut_with(v),
        Declaration::FnExpr(n) => n.function.visit_mut_with(v),
        Declaration::Class(n) => n.class.visit_mut_with(v),
        Declaration::ClassExpr(n) => n.class.visit_mut_with(v),
        Declaration::Var(e) | Declaration::Macro(e) | Declaration::Expr(e) => {
            e.visit_mut_with(v)
        }
        _ => {}
    }
}

struct SpliceCall {
    span: Span,
    replacement: Option<Expr>,
}

impl VisitMut for SpliceCall {
    noop_visit_mut_type!();

    fn visit_mut_expr(&mut self, e: &mut Expr) {
        if self.replacement.is_none() {
            return;
        }
        if let Expr::Call(c) = e {
            if c.span == self.span {
                if let Some(replacement) = self.replacement.take() {
                    *e = replacement;
                }
                return;
            }
        }
        e.visit_mut_children_with(self);
    }
}

fn contains_call(decl: &Declaration, span: Span) -> bool {
    struct FindCall {
        span: Span,
        found: bool,
    }
    impl Visit for FindCall {
        noop_visit_type!();
        fn visit_call_expr(&mut self, call: &CallExpr) {
            if call.span == self.span {
                self.found = true;
            }
            call.visit_children_with(self);
        }
    }
    let mut find = FindCall { span, found: false };
    scan_decl(decl, &mut find);
    find.found
}

fn expand_site(
    g: &mut DeclarationGraph,
    nx: NodeIndex,
    site: &MacroSite,
    engine: &mut Option<MacroHost>,
    options: &ExpandOptions,
) -> Result<Expr, FuneeError> {
    let site_canonical = g.graph[site.target].canonical.clone();
    for arg in &site.args {
        if arg.spread.is_some() {
            return Err(FuneeError::MacroInvocation {
                site: site_canonical,
                message: "spread arguments cannot be captured".to_string(),
            });
        }
    }

    match g.graph[site.target].decl.clone() {
        Declaration::Builtin(builtin) => expand_builtin(g, nx, builtin, site, &site_canonical),
        Declaration::Macro(_) => {
            let cm = g.source_map().clone();
            let args: Vec<Closure> = site
                .args
                .iter()
                .map(|arg| capture_argument(g, nx, &arg.expr, &cm))
                .collect();
            let (program, binding) = emit_macro_program(g, site.target)?;
            let host = engine.get_or_insert_with(|| MacroHost::new(options.budget));
            let outcome = host.invoke(&site_canonical, &program, &binding, &args)?;
            apply_outcome(g, nx, &site_canonical, outcome)
        }
        _ => unreachable!("find_macro_sites only yields macro targets"),
    }
}

/// Capture one argument. A bare identifier naming another declaration is
/// dereferenced to that declaration's source, so `closure(add)` captures
/// the definition of `add` rather than the identifier itself.
fn capture_argument(
    g: &DeclarationGraph,
    nx: NodeIndex,
    expr: &Expr,
    cm: &Rc<SourceMap>,
) -> Closure {
    if let Some((definition, node)) = dereference(g, nx, expr) {
        return capture_closure(cm, &definition, &g.scope_of(node));
    }
    capture_closure(cm, expr, &g.scope_of(nx))
}

fn dereference(g: &DeclarationGraph, nx: NodeIndex, expr: &Expr) -> Option<(Expr, NodeIndex)> {
    let Expr::Ident(ident) = expr else {
        return None;
    };
    let target = *g.edge_targets(nx).get(ident.sym.as_ref())?;
    let definition = match &g.graph[target].decl {
        Declaration::Var(e) => e.clone(),
        Declaration::Fn(f) => Expr::Fn(FnExpr {
            ident: None,
            function: f.function.clone(),
        }),
        Declaration::FnExpr(fe) => Expr::Fn(fe.clone()),
        _ => return None,
    };
    Some((definition, target))
}

fn expand_builtin(
    g: &mut DeclarationGraph,
    nx: NodeIndex,
    builtin: BuiltinMacro,
    site: &MacroSite,
    site_canonical: &CanonicalName,
) -> Result<Expr, FuneeError> {
    match builtin {
        BuiltinMacro::UnsafeCast => {
            let [arg] = site.args.as_slice() else {
                return Err(FuneeError::MacroInvocation {
                    site: site_canonical.clone(),
                    message: "unsafeCast takes exactly one argument".to_string(),
                });
            };
            Ok((*arg.expr).clone())
        }
        BuiltinMacro::Tuple => Ok(Expr::Array(ArrayLit {
            span: Default::default(),
            elems: site
                .args
                .iter()
                .map(|arg| Some((*arg.expr).clone().as_arg()))
                .collect(),
        })),
        BuiltinMacro::CanonicalNameOf => {
            let name = match site.args.as_slice() {
                [arg] => match &*arg.expr {
                    Expr::Ident(i) => Some(i.sym.to_string()),
                    _ => None,
                },
                _ => None,
            };
            let Some(name) = name else {
                return Err(FuneeError::MacroInvocation {
                    site: site_canonical.clone(),
                    message: "canonicalName takes a single bare identifier".to_string(),
                });
            };
            let Some(&target) = g.edge_targets(nx).get(&name) else {
                return Err(FuneeError::MacroInvocation {
                    site: site_canonical.clone(),
                    message: format!("\"{}\" is not bound in the surrounding scope", name),
                });
            };
            let canonical = g.graph[target].canonical.clone();
            let code = format!(
                "new CanonicalName({}, {})",
                js_string(&canonical.uri),
                js_string(&canonical.name)
            );
            let cm = g.source_map().clone();
            parse_expr_text(&cm, &code)
        }
        BuiltinMacro::Closure => expand_closure_builtin(g, nx, site, site_canonical),
        BuiltinMacro::CreateMacro => Err(FuneeError::MacroInvocation {
            site: site_canonical.clone(),
            message: "createMacro may only appear as a top-level initializer".to_string(),
        }),
    }
}

/// `closure(e)`: replace the call with code that constructs the runtime
/// Closure value, and pin every captured reference so the declarations the
/// references map names stay in the bundle.
fn expand_closure_builtin(
    g: &mut DeclarationGraph,
    nx: NodeIndex,
    site: &MacroSite,
    site_canonical: &CanonicalName,
) -> Result<Expr, FuneeError> {
    let [arg] = site.args.as_slice() else {
        return Err(FuneeError::MacroInvocation {
            site: site_canonical.clone(),
            message: "closure takes exactly one argument".to_string(),
        });
    };
    let cm = g.source_map().clone();

    let (captured, scope_node) = match dereference(g, nx, &arg.expr) {
        Some((definition, node)) => (definition, node),
        None => ((*arg.expr).clone(), nx),
    };
    let mut closure = capture_closure(&cm, &captured, &g.scope_of(scope_node));
    // The runtime references map names bundle declarations only; host
    // bindings and builtins resolve at runtime without it.
    closure.references.retain(|_, canonical| !canonical.is_host());
    let kind = infer_ast_kind(&captured);

    let scope_targets = g.edge_targets(scope_node);
    for local in closure.references.keys() {
        if let Some(&target) = scope_targets.get(local) {
            let pin = g.fresh_local();
            g.pin_reference(nx, &pin, target);
        }
    }

    let entries = closure
        .references
        .iter()
        .map(|(local, canonical)| {
            format!(
                "[{}, new CanonicalName({}, {})]",
                js_string(local),
                js_string(&canonical.uri),
                js_string(&canonical.name)
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    let code = format!(
        "new Closure({{ type: {}, code: {} }}, new Map([{}]))",
        js_string(kind),
        js_string(&closure.expression),
        entries
    );
    parse_expr_text(&cm, &code)
}

/// Splice a user macro's result: inject artificial definitions, parse the
/// returned expression, and re-bind its references under fresh local
/// names so they cannot collide with anything already in scope.
fn apply_outcome(
    g: &mut DeclarationGraph,
    nx: NodeIndex,
    site_canonical: &CanonicalName,
    outcome: MacroOutcome,
) -> Result<Expr, FuneeError> {
    let cm = g.source_map().clone();

    for (canonical, code) in outcome.definitions() {
        let init = parse_expr_text(&cm, code).map_err(|e| FuneeError::MacroInvocation {
            site: site_canonical.clone(),
            message: format!("artificial definition {} does not parse: {}", canonical, e),
        })?;
        g.inject_definition(canonical.clone(), Declaration::Var(init));
    }
    g.connect_pending()?;

    let closure = outcome.closure();
    let expr = parse_expr_text(&cm, &closure.expression).map_err(|e| {
        FuneeError::MacroInvocation {
            site: site_canonical.clone(),
            message: format!("macro result does not parse: {}", e),
        }
    })?;

    if closure.references.is_empty() {
        return Ok(expr);
    }

    let mut replace = HashMap::new();
    for (local, canonical) in &closure.references {
        let target = g.ensure_declaration(canonical)?;
        g.connect_pending()?;
        let fresh = g.fresh_local();
        g.graph.add_edge(nx, target, fresh.clone());
        replace.insert(local.clone(), fresh);
    }

    // The snippet is freshly parsed; run the resolver over it before
    // renaming so only genuinely free occurrences are touched.
    let mut tmp = Declaration::Var(expr);
    collect_references(&mut tmp, g.marks());
    rename_references(&mut tmp, &replace, g.marks());
    match tmp {
        Declaration::Var(expr) => Ok(expr),
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::emit_bundle;
    use crate::graph::{default_export_invocation, DeclarationGraph};
    use crate::loader::{MemoryLoader, ModuleCache};
    use std::collections::HashSet;

    fn expanded_bundle(files: &[(&'static str, &'static str)]) -> Result<String, FuneeError> {
        let cache = ModuleCache::new(Box::new(MemoryLoader::new(files.iter().copied())));
        let mut g = DeclarationGraph::build(
            "/app/entry.ts",
            default_export_invocation(),
            cache,
            HashSet::from(["log".to_string(), "Closure".to_string(), "CanonicalName".to_string()]),
        )?;
        expand_macros(&mut g, &ExpandOptions::default())?;
        emit_bundle(&g, "const __funee_host = {};")
    }

    #[test]
    fn unsafe_cast_is_identity() {
        let code = expanded_bundle(&[(
            "/app/entry.ts",
            r#"import { unsafeCast } from "funee";
               export default function main() { return unsafeCast(41) + 1; }"#,
        )])
        .unwrap();
        assert!(code.contains("41 + 1"));
        assert!(!code.contains("unsafeCast"));
    }

    #[test]
    fn tuple_splices_an_array_literal() {
        let code = expanded_bundle(&[(
            "/app/entry.ts",
            r#"import { tuple } from "funee";
               export default function main() { return tuple(1, "two", 3); }"#,
        )])
        .unwrap();
        assert!(code.replace(' ', "").contains(r#"[1,"two",3]"#));
        assert!(!code.contains("tuple("));
    }

    #[test]
    fn canonical_name_expands_to_a_constructor_call() {
        let code = expanded_bundle(&[
            (
                "/app/entry.ts",
                r#"import { canonicalName } from "funee";
                   import { helper } from "./lib.ts";
                   export default function main() { return canonicalName(helper); }"#,
            ),
            ("/app/lib.ts", "export function helper() { return 1; }"),
        ])
        .unwrap();
        assert!(code.contains(r#""/app/lib.ts""#));
        assert!(code.contains(r#""helper""#));
        assert!(!code.contains("canonicalName("));
    }

    #[test]
    fn canonical_name_rejects_non_identifiers() {
        let err = expanded_bundle(&[(
            "/app/entry.ts",
            r#"import { canonicalName } from "funee";
               export default function main() { return canonicalName(1 + 2); }"#,
        )])
        .unwrap_err();
        assert!(matches!(err, FuneeError::MacroInvocation { .. }));
    }
}
