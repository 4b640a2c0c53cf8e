//! Emission: turn the surviving declaration graph into one flat script.
//!
//! Every surviving declaration gets a fresh `declaration_N` name (assigned
//! in canonical-name order so output is deterministic), references are
//! rewritten to the fresh names, and declarations are laid out strongly-
//! connected-component by strongly-connected-component, dependencies
//! first. Inside a cycle, hoisted functions go first; variables that would
//! read each other during initialization are a `CircularInitialization`
//! error.

use crate::canonical::CanonicalName;
use crate::error::FuneeError;
use crate::graph::{DeclarationGraph, DeclarationNode};
use crate::module_index::Declaration;
use crate::parse::parse_expr_text;
use crate::references::rename_references;
use petgraph::{algo::tarjan_scc, graph::NodeIndex, visit::EdgeRef, Direction::Outgoing};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use swc_common::{SourceMap, SyntaxContext};
use swc_ecma_ast::{
    ClassDecl, Decl, Expr, ExprStmt, FnDecl, Ident, Module, ModuleItem, Pat, Stmt, VarDecl,
    VarDeclKind, VarDeclarator,
};
use swc_ecma_codegen::{text_writer::JsWriter, Emitter};

fn ident(name: &str) -> Ident {
    Ident::new(name.into(), Default::default(), SyntaxContext::empty())
}

/// Print a single expression as source text.
pub fn print_expr(cm: &Rc<SourceMap>, expr: &Expr) -> String {
    let module = Module {
        span: Default::default(),
        body: vec![ModuleItem::Stmt(Stmt::Expr(ExprStmt {
            span: Default::default(),
            expr: Box::new(expr.clone()),
        }))],
        shebang: None,
    };
    let code = print_module(cm, &module);
    code.trim().trim_end_matches(';').to_string()
}

fn print_module(cm: &Rc<SourceMap>, module: &Module) -> String {
    let mut buf = vec![];
    {
        let wr = JsWriter::new(cm.clone(), "\n", &mut buf, None);
        let mut emitter = Emitter {
            cfg: swc_ecma_codegen::Config::default(),
            cm: cm.clone(),
            comments: None,
            wr: Box::new(wr),
        };
        emitter
            .emit_module(module)
            .expect("emitting to an in-memory buffer cannot fail");
    }
    String::from_utf8(buf).expect("codegen produces utf-8")
}

/// Emit the full bundle: prologue, renamed declarations, and the final
/// invocation of the entry default export (the graph root).
pub fn emit_bundle(g: &DeclarationGraph, prologue: &str) -> Result<String, FuneeError> {
    let plan = EmitPlan::for_root(g, g.root)?;

    for &nx in &plan.order {
        let node = &g.graph[nx];
        if matches!(node.decl, Declaration::Macro(_) | Declaration::Builtin(_)) {
            return Err(FuneeError::MacroInvocation {
                site: node.canonical.clone(),
                message: "macros are expanded at bundle time and cannot be used as values"
                    .to_string(),
            });
        }
    }

    let body = plan.render(g, &HostRendering::Runtime)?;
    Ok(format!("{}\n{}", prologue.trim_end(), body))
}

/// Emit the dependency subgraph of one macro as a standalone program plus
/// the fresh name the macro function is bound to. Used to invoke the macro
/// inside the engine; host bindings other than `log` are stubbed out
/// because no host exists at expansion time.
pub fn emit_macro_program(
    g: &DeclarationGraph,
    macro_node: NodeIndex,
) -> Result<(String, String), FuneeError> {
    let plan = EmitPlan::for_root(g, macro_node)?;
    let program = plan.render(g, &HostRendering::ExpansionStubs)?;
    let binding = plan.names[&macro_node].clone();
    Ok((program, binding))
}

enum HostRendering {
    /// `const declaration_N = __funee_host.<name>;`
    Runtime,
    /// `log` maps to console.log, everything else throws.
    ExpansionStubs,
}

struct EmitPlan {
    order: Vec<NodeIndex>,
    names: HashMap<NodeIndex, String>,
}

impl EmitPlan {
    fn for_root(g: &DeclarationGraph, root: NodeIndex) -> Result<Self, FuneeError> {
        let mut reachable = HashSet::new();
        let mut dfs = petgraph::visit::Dfs::new(&g.graph, root);
        while let Some(nx) = dfs.next(&g.graph) {
            reachable.insert(nx);
        }

        // Fresh names in canonical order, independent of graph layout.
        let mut by_canonical: Vec<_> = reachable.iter().copied().collect();
        by_canonical.sort_by(|a, b| g.graph[*a].canonical.cmp(&g.graph[*b].canonical));
        let names: HashMap<NodeIndex, String> = by_canonical
            .iter()
            .enumerate()
            .map(|(i, &nx)| (nx, format!("declaration_{}", i)))
            .collect();

        // tarjan_scc yields components in reverse topological order of the
        // condensation, which is exactly dependencies-before-dependents.
        let mut order = Vec::with_capacity(reachable.len());
        for scc in tarjan_scc(&g.graph) {
            let members: Vec<_> = scc.into_iter().filter(|nx| reachable.contains(nx)).collect();
            if members.is_empty() {
                continue;
            }
            order.extend(order_component(g, &members)?);
        }

        Ok(Self { order, names })
    }

    fn render(&self, g: &DeclarationGraph, hosts: &HostRendering) -> Result<String, FuneeError> {
        let cm = g.source_map();
        let mut items: Vec<ModuleItem> = Vec::with_capacity(self.order.len());

        for &nx in &self.order {
            let node = &g.graph[nx];
            let fresh = &self.names[&nx];

            let replace: HashMap<String, String> = g
                .graph
                .edges_directed(nx, Outgoing)
                .map(|e| (e.weight().clone(), self.names[&e.target()].clone()))
                .collect();

            let mut decl = node.decl.clone();
            rename_references(&mut decl, &replace, g.marks());
            items.push(render_declaration(cm, node, decl, fresh, hosts)?);
        }

        let module = Module {
            span: Default::default(),
            body: items,
            shebang: None,
        };
        Ok(print_module(cm, &module))
    }
}

fn render_declaration(
    cm: &Rc<SourceMap>,
    node: &DeclarationNode,
    decl: Declaration,
    fresh: &str,
    hosts: &HostRendering,
) -> Result<ModuleItem, FuneeError> {
    let stmt = match decl {
        Declaration::Fn(mut f) => {
            f.ident = ident(fresh);
            Stmt::Decl(Decl::Fn(f))
        }
        Declaration::FnExpr(fe) => Stmt::Decl(Decl::Fn(FnDecl {
            ident: ident(fresh),
            declare: false,
            function: fe.function,
        })),
        Declaration::Class(mut c) => {
            c.ident = ident(fresh);
            Stmt::Decl(Decl::Class(c))
        }
        Declaration::ClassExpr(ce) => Stmt::Decl(Decl::Class(ClassDecl {
            ident: ident(fresh),
            declare: false,
            class: ce.class,
        })),
        Declaration::Var(e) => const_decl(fresh, e),
        Declaration::Macro(e) => const_decl(fresh, e),
        Declaration::Host(name) => {
            let source = match hosts {
                HostRendering::Runtime => format!("__funee_host.{}", name),
                HostRendering::ExpansionStubs if name == "log" => {
                    "(...args) => console.log(...args)".to_string()
                }
                HostRendering::ExpansionStubs => format!(
                    "() => {{ throw new Error(\"host binding {} is unavailable during macro expansion\"); }}",
                    name
                ),
            };
            const_decl(fresh, parse_expr_text(cm, &source)?)
        }
        Declaration::Builtin(builtin) => {
            let source = format!(
                "() => {{ throw new Error(\"{} is expanded at bundle time\"); }}",
                builtin.name()
            );
            const_decl(fresh, parse_expr_text(cm, &source)?)
        }
        Declaration::Expr(e) => Stmt::Expr(ExprStmt {
            span: Default::default(),
            expr: Box::new(e),
        }),
        Declaration::Alias { .. } | Declaration::Namespace { .. } => {
            return Err(FuneeError::UnresolvedReference {
                name: node.canonical.name.clone(),
                uri: node.canonical.uri.clone(),
            });
        }
    };
    Ok(ModuleItem::Stmt(stmt))
}

fn const_decl(fresh: &str, init: Expr) -> Stmt {
    Stmt::Decl(Decl::Var(Box::new(VarDecl {
        span: Default::default(),
        ctxt: SyntaxContext::empty(),
        kind: VarDeclKind::Const,
        declare: false,
        decls: vec![VarDeclarator {
            span: Default::default(),
            name: Pat::Ident(ident(fresh).into()),
            init: Some(Box::new(init)),
            definite: false,
        }],
    })))
}

/// Order one strongly connected component. Hoisted functions first, then
/// initializers that only close over the cycle (arrows and function
/// expressions), then everything that dereferences at initialization time
/// in dependency order. A cycle among the last group cannot be emitted.
fn order_component(
    g: &DeclarationGraph,
    members: &[NodeIndex],
) -> Result<Vec<NodeIndex>, FuneeError> {
    if members.len() == 1 && !has_eager_self_loop(g, members[0]) {
        return Ok(members.to_vec());
    }

    // Node order inside a tarjan component is arbitrary; sort so output is
    // stable across runs.
    let mut members = members.to_vec();
    members.sort_by(|a, b| g.graph[*a].canonical.cmp(&g.graph[*b].canonical));
    let members = &members[..];

    let member_set: HashSet<_> = members.iter().copied().collect();
    let mut hoisted = Vec::new();
    let mut deferred = Vec::new();
    let mut eager = Vec::new();
    for &nx in members {
        if g.graph[nx].decl.is_hoisted() {
            hoisted.push(nx);
        } else if initializes_lazily(&g.graph[nx].decl) {
            deferred.push(nx);
        } else {
            eager.push(nx);
        }
    }

    // Dependency order among the eager members; a cycle here means the
    // program cannot initialize.
    let mut ordered_eager = Vec::new();
    let mut placed: HashSet<NodeIndex> = HashSet::new();
    while ordered_eager.len() < eager.len() {
        let mut progressed = false;
        for &nx in &eager {
            if placed.contains(&nx) {
                continue;
            }
            let blocked = g
                .graph
                .edges_directed(nx, Outgoing)
                .any(|e| {
                    let t = e.target();
                    t != nx
                        && member_set.contains(&t)
                        && !placed.contains(&t)
                        && !g.graph[t].decl.is_hoisted()
                        && !initializes_lazily(&g.graph[t].decl)
                });
            if !blocked {
                if has_eager_self_loop(g, nx) {
                    return Err(cycle_error(g, &[nx]));
                }
                ordered_eager.push(nx);
                placed.insert(nx);
                progressed = true;
            }
        }
        if !progressed {
            let remaining: Vec<_> = eager
                .iter()
                .copied()
                .filter(|nx| !placed.contains(nx))
                .collect();
            return Err(cycle_error(g, &remaining));
        }
    }

    let mut order = hoisted;
    order.extend(deferred);
    order.extend(ordered_eager);
    Ok(order)
}

/// Whether a declaration's initializer can run before its cycle partners
/// exist, because it only captures them inside a function body.
fn initializes_lazily(decl: &Declaration) -> bool {
    match decl {
        Declaration::Fn(_) | Declaration::FnExpr(_) => true,
        Declaration::Var(Expr::Arrow(_)) | Declaration::Var(Expr::Fn(_)) => true,
        Declaration::Macro(_) | Declaration::Host(_) | Declaration::Builtin(_) => true,
        _ => false,
    }
}

fn has_eager_self_loop(g: &DeclarationGraph, nx: NodeIndex) -> bool {
    !g.graph[nx].decl.is_hoisted()
        && !initializes_lazily(&g.graph[nx].decl)
        && g.graph
            .edges_directed(nx, Outgoing)
            .any(|e| e.target() == nx)
}

fn cycle_error(g: &DeclarationGraph, members: &[NodeIndex]) -> FuneeError {
    let mut cycle: Vec<CanonicalName> = members
        .iter()
        .map(|&nx| g.graph[nx].canonical.clone())
        .collect();
    cycle.sort();
    FuneeError::CircularInitialization { cycle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_expr_text;

    #[test]
    fn print_expr_drops_the_statement_semicolon() {
        let cm: Rc<SourceMap> = Default::default();
        let e = parse_expr_text(&cm, "add(1, 2)").unwrap();
        assert_eq!(print_expr(&cm, &e), "add(1, 2)");
    }

    #[test]
    fn printed_arrows_keep_their_shape() {
        let cm: Rc<SourceMap> = Default::default();
        let e = parse_expr_text(&cm, "(a,   b) =>    a + b").unwrap();
        let code = print_expr(&cm, &e);
        assert_eq!(code.replace(' ', ""), "(a,b)=>a+b");
    }
}
