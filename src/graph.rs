//! The declaration graph: nodes are canonical declarations, edges record
//! under which local name one declaration references another.
//!
//! The graph is built demand-first from the bundle root, so a declaration
//! is only ever loaded when something reachable references it. That makes
//! construction itself the tree-shaking pass: unused exports and unused
//! modules are simply never pulled in.

use crate::canonical::{CanonicalName, HOST_NAMESPACE};
use crate::error::FuneeError;
use crate::loader::{resolve_specifier, ModuleCache};
use crate::module_index::{BuiltinMacro, Declaration};
use crate::references::{collect_references, is_js_global, ReferenceMarks};
use petgraph::{
    graph::NodeIndex,
    visit::{Dfs, EdgeRef},
    Direction::Outgoing,
    Graph,
};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use swc_common::{SourceMap, SyntaxContext};
use swc_ecma_ast::{CallExpr, Callee, Expr, Ident};

pub struct DeclarationNode {
    pub canonical: CanonicalName,
    pub decl: Declaration,
}

pub struct DeclarationGraph {
    pub graph: Graph<DeclarationNode, String>,
    pub root: NodeIndex,
    cache: ModuleCache,
    host_names: HashSet<String>,
    nodes: HashMap<CanonicalName, NodeIndex>,
    /// Edges that must survive re-indexing even when the identifier no
    /// longer occurs free in the declaration (closure captures).
    pinned: HashSet<(NodeIndex, String)>,
    /// Nodes added but not yet scanned for references.
    pending: Vec<NodeIndex>,
    alias_counter: usize,
}

/// The synthetic root: an invocation of the entry module's default export.
pub fn default_export_invocation() -> Expr {
    Expr::Call(CallExpr {
        span: Default::default(),
        ctxt: SyntaxContext::empty(),
        callee: Callee::Expr(Box::new(Expr::Ident(Ident::new(
            "default".into(),
            Default::default(),
            SyntaxContext::empty(),
        )))),
        args: vec![],
        type_args: None,
    })
}

impl DeclarationGraph {
    /// Build the graph reachable from `expression` evaluated in the scope
    /// of `entry_uri`.
    pub fn build(
        entry_uri: &str,
        expression: Expr,
        cache: ModuleCache,
        host_names: HashSet<String>,
    ) -> Result<Self, FuneeError> {
        let mut this = Self {
            graph: Graph::new(),
            root: NodeIndex::new(0),
            cache,
            host_names,
            nodes: HashMap::new(),
            pinned: HashSet::new(),
            pending: Vec::new(),
            alias_counter: 0,
        };
        this.root = this.add_node(
            CanonicalName::new(entry_uri, "<main>"),
            Declaration::Expr(expression),
        );
        this.connect_pending()?;
        Ok(this)
    }

    pub fn source_map(&self) -> &Rc<SourceMap> {
        self.cache.source_map()
    }

    pub fn marks(&self) -> &ReferenceMarks {
        self.cache.marks()
    }

    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    fn add_node(&mut self, canonical: CanonicalName, decl: Declaration) -> NodeIndex {
        let nx = self.graph.add_node(DeclarationNode { canonical: canonical.clone(), decl });
        self.nodes.insert(canonical, nx);
        self.pending.push(nx);
        nx
    }

    /// Scan every pending node for free references and wire up its edges,
    /// loading further declarations as they are discovered.
    pub fn connect_pending(&mut self) -> Result<(), FuneeError> {
        while let Some(nx) = self.pending.pop() {
            let uri = self.graph[nx].canonical.uri.clone();
            let refs = {
                let Self { graph, cache, .. } = &mut *self;
                collect_references(&mut graph[nx].decl, cache.marks())
            };
            for path in refs {
                if self.has_edge(nx, &path) {
                    continue;
                }
                if let Some((weight, target)) = self.resolve_reference(&uri, &path)? {
                    if !self.has_edge(nx, &weight) {
                        self.graph.add_edge(nx, target, weight);
                    }
                }
            }
        }
        Ok(())
    }

    fn has_edge(&self, nx: NodeIndex, weight: &str) -> bool {
        self.graph
            .edges_directed(nx, Outgoing)
            .any(|e| e.weight() == weight)
    }

    /// Resolve one free reference path seen inside module `uri`. Returns
    /// the edge weight to record and the target node, or `None` when the
    /// name is satisfied by a JS global.
    fn resolve_reference(
        &mut self,
        uri: &str,
        path: &str,
    ) -> Result<Option<(String, NodeIndex)>, FuneeError> {
        let (head, member) = match path.split_once('.') {
            Some((head, member)) => (head, Some(member)),
            None => (path, None),
        };

        // Namespace imports resolve member-wise: `ns.foo` is a reference
        // to `foo` of the imported module, not to a runtime object `ns`.
        let namespace_specifier = self.cache.module(uri).ok().and_then(|record| {
            match record.index.get(head).map(|ix| &ix.decl) {
                Some(Declaration::Namespace { specifier }) => Some(specifier.clone()),
                _ => None,
            }
        });
        if let Some(specifier) = namespace_specifier {
            let Some(member) = member else {
                return Err(FuneeError::UnresolvedReference {
                    name: format!("{} (namespace imports have no runtime value)", head),
                    uri: uri.to_string(),
                });
            };
            let target_uri = resolve_specifier(&specifier, uri)?;
            let target = self.ensure_declaration(&CanonicalName::new(target_uri, member))?;
            return Ok(Some((path.to_string(), target)));
        }

        let bound = self.nodes.contains_key(&CanonicalName::new(uri, head))
            || self
                .cache
                .module(uri)
                .map(|record| record.index.contains_key(head))
                .unwrap_or(false);
        if bound {
            let target = self.ensure_declaration(&CanonicalName::new(uri, head))?;
            return Ok(Some((head.to_string(), target)));
        }

        // Host names are ambient: reachable without an import, exactly as
        // if re-exported from the host namespace.
        if self.host_names.contains(head) || BuiltinMacro::from_name(head).is_some() {
            let target = self.ensure_declaration(&CanonicalName::host(head))?;
            return Ok(Some((head.to_string(), target)));
        }

        if is_js_global(head) {
            return Ok(None);
        }

        Err(FuneeError::UnresolvedReference {
            name: path.to_string(),
            uri: uri.to_string(),
        })
    }

    /// Return the node for a canonical name, loading and chasing aliases
    /// as needed. Aliases never mint nodes of their own.
    pub fn ensure_declaration(
        &mut self,
        canonical: &CanonicalName,
    ) -> Result<NodeIndex, FuneeError> {
        let mut current = canonical.clone();
        let mut chased: HashSet<CanonicalName> = HashSet::new();

        loop {
            if let Some(&nx) = self.nodes.get(&current) {
                if *canonical != current {
                    self.nodes.insert(canonical.clone(), nx);
                }
                return Ok(nx);
            }
            if !chased.insert(current.clone()) {
                return Err(FuneeError::UnresolvedReference {
                    name: format!("{} (cyclic re-export)", current.name),
                    uri: current.uri.clone(),
                });
            }

            if current.uri == HOST_NAMESPACE {
                let decl = if let Some(builtin) = BuiltinMacro::from_name(&current.name) {
                    Declaration::Builtin(builtin)
                } else if self.host_names.contains(&current.name) {
                    Declaration::Host(current.name.clone())
                } else {
                    return Err(FuneeError::UnresolvedReference {
                        name: current.name.clone(),
                        uri: HOST_NAMESPACE.to_string(),
                    });
                };
                let nx = self.add_node(current.clone(), decl);
                if *canonical != current {
                    self.nodes.insert(canonical.clone(), nx);
                }
                return Ok(nx);
            }

            let record = self.cache.module(&current.uri)?;
            let Some(indexed) = record.index.get(&current.name) else {
                return Err(FuneeError::UnresolvedReference {
                    name: current.name.clone(),
                    uri: current.uri.clone(),
                });
            };
            match &indexed.decl {
                Declaration::Alias { specifier, name } => {
                    let next_uri = match specifier {
                        Some(s) => resolve_specifier(s, &current.uri)?,
                        None => current.uri.clone(),
                    };
                    current = CanonicalName::new(next_uri, name.clone());
                }
                Declaration::Namespace { .. } => {
                    return Err(FuneeError::UnresolvedReference {
                        name: format!("{} (namespace imports have no runtime value)", current.name),
                        uri: current.uri.clone(),
                    });
                }
                decl => {
                    let decl = decl.clone();
                    let nx = self.add_node(current.clone(), decl);
                    if *canonical != current {
                        self.nodes.insert(canonical.clone(), nx);
                    }
                    return Ok(nx);
                }
            }
        }
    }

    /// Recompute one node's edges after its declaration changed (macro
    /// substitution). Stale edges are dropped unless pinned; new free
    /// references are resolved and their declarations loaded.
    pub fn reindex_node(&mut self, nx: NodeIndex) -> Result<(), FuneeError> {
        let uri = self.graph[nx].canonical.uri.clone();
        let refs: HashSet<String> = {
            let Self { graph, cache, .. } = &mut *self;
            collect_references(&mut graph[nx].decl, cache.marks())
                .into_iter()
                .collect()
        };

        {
            // Edge indices shift on removal, so filter in one pass.
            let Self { graph, pinned, .. } = &mut *self;
            graph.retain_edges(|g, e| {
                let Some((source, _)) = g.edge_endpoints(e) else {
                    return true;
                };
                if source != nx {
                    return true;
                }
                match g.edge_weight(e) {
                    Some(weight) => {
                        refs.contains(weight) || pinned.contains(&(nx, weight.clone()))
                    }
                    None => true,
                }
            });
        }

        for path in refs {
            if self.has_edge(nx, &path) {
                continue;
            }
            if let Some((weight, target)) = self.resolve_reference(&uri, &path)? {
                if !self.has_edge(nx, &weight) {
                    self.graph.add_edge(nx, target, weight);
                }
            }
        }
        self.connect_pending()
    }

    /// Record a reference that must keep its target in the bundle even
    /// though the local name no longer appears free (closure captures).
    pub fn pin_reference(&mut self, nx: NodeIndex, local: &str, target: NodeIndex) {
        if !self.has_edge(nx, local) {
            self.graph.add_edge(nx, target, local.to_string());
        }
        self.pinned.insert((nx, local.to_string()));
    }

    /// Inject an artificial declaration under a macro-chosen canonical
    /// name, as if its module had always declared it. Existing nodes win.
    /// The caller runs `connect_pending` once the whole batch is in, so
    /// definitions from one macro result may reference each other.
    pub fn inject_definition(&mut self, canonical: CanonicalName, decl: Declaration) -> NodeIndex {
        if let Some(&nx) = self.nodes.get(&canonical) {
            return nx;
        }
        self.add_node(canonical, decl)
    }

    /// A fresh local name for splicing macro-returned references into a
    /// declaration without colliding with its existing bindings.
    pub fn fresh_local(&mut self) -> String {
        let n = self.alias_counter;
        self.alias_counter += 1;
        format!("__funee_ref_{}", n)
    }

    /// Local bindings visible to closure capture at a node: every plain
    /// (non-namespace) outgoing edge, local name -> target canonical.
    pub fn scope_of(&self, nx: NodeIndex) -> HashMap<String, CanonicalName> {
        self.graph
            .edges_directed(nx, Outgoing)
            .filter(|e| !e.weight().contains('.'))
            .map(|e| (e.weight().clone(), self.graph[e.target()].canonical.clone()))
            .collect()
    }

    /// Outgoing edges as weight -> target node.
    pub fn edge_targets(&self, nx: NodeIndex) -> HashMap<String, NodeIndex> {
        self.graph
            .edges_directed(nx, Outgoing)
            .map(|e| (e.weight().clone(), e.target()))
            .collect()
    }

    /// All nodes ordered by canonical name; the deterministic iteration
    /// order for macro expansion.
    pub fn sorted_nodes(&self) -> Vec<NodeIndex> {
        let mut nodes: Vec<_> = self.graph.node_indices().collect();
        nodes.sort_by(|a, b| self.graph[*a].canonical.cmp(&self.graph[*b].canonical));
        nodes
    }

    /// Nodes reachable from the root after expansion rewired the edges.
    pub fn reachable(&self) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, self.root);
        while let Some(nx) = dfs.next(&self.graph) {
            seen.insert(nx);
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::MemoryLoader;

    fn build(files: &[(&'static str, &'static str)]) -> Result<DeclarationGraph, FuneeError> {
        let cache = ModuleCache::new(Box::new(MemoryLoader::new(files.iter().copied())));
        DeclarationGraph::build(
            "/app/entry.ts",
            default_export_invocation(),
            cache,
            HashSet::from(["log".to_string()]),
        )
    }

    fn canonicals(g: &DeclarationGraph) -> Vec<String> {
        let mut names: Vec<_> = g
            .graph
            .node_indices()
            .map(|nx| g.graph[nx].canonical.to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn only_reachable_declarations_are_loaded() {
        let g = build(&[
            (
                "/app/entry.ts",
                r#"import { used } from "./utils.ts";
                   export default function main() { return used(); }"#,
            ),
            (
                "/app/utils.ts",
                "export function used() { return 1; }\nexport function unused() { return 2; }",
            ),
        ])
        .unwrap();
        let names = canonicals(&g);
        assert!(names.contains(&"/app/utils.ts:used".to_string()));
        assert!(!names.iter().any(|n| n.contains("unused")));
    }

    #[test]
    fn aliases_collapse_to_one_canonical_node() {
        let g = build(&[
            (
                "/app/entry.ts",
                r#"import { value } from "./reexport.ts";
                   export default function main() { return value; }"#,
            ),
            (
                "/app/reexport.ts",
                r#"export { original as value } from "./impl.ts";"#,
            ),
            ("/app/impl.ts", "export const original = 42;"),
        ])
        .unwrap();
        let names = canonicals(&g);
        assert!(names.contains(&"/app/impl.ts:original".to_string()));
        assert!(!names.iter().any(|n| n.contains("reexport.ts")));
    }

    #[test]
    fn namespace_members_resolve_to_the_target_module() {
        let g = build(&[
            (
                "/app/entry.ts",
                r#"import * as utils from "./utils.ts";
                   export default function main() { return utils.twice(2); }"#,
            ),
            ("/app/utils.ts", "export function twice(n) { return n * 2; }"),
        ])
        .unwrap();
        assert!(canonicals(&g).contains(&"/app/utils.ts:twice".to_string()));
        // The edge carries the member path for later rewriting.
        let main = g
            .sorted_nodes()
            .into_iter()
            .find(|nx| g.graph[*nx].canonical.name == "default")
            .unwrap();
        assert!(g.edge_targets(main).contains_key("utils.twice"));
    }

    #[test]
    fn host_bindings_come_from_the_host_namespace() {
        let g = build(&[(
            "/app/entry.ts",
            r#"import { log } from "funee";
               export default function main() { log("hi"); }"#,
        )])
        .unwrap();
        assert!(canonicals(&g).contains(&"funee:log".to_string()));
    }

    #[test]
    fn unresolved_references_are_reported_with_their_module() {
        let err = build(&[(
            "/app/entry.ts",
            "export default function main() { return mystery; }",
        )])
        .unwrap_err();
        assert!(
            matches!(err, FuneeError::UnresolvedReference { ref name, ref uri }
                if name == "mystery" && uri == "/app/entry.ts")
        );
    }

    #[test]
    fn cyclic_reexports_are_detected() {
        let err = build(&[
            (
                "/app/entry.ts",
                r#"import { x } from "./a.ts";
                   export default function main() { return x; }"#,
            ),
            ("/app/a.ts", r#"export { x } from "./b.ts";"#),
            ("/app/b.ts", r#"export { x } from "./a.ts";"#),
        ])
        .unwrap_err();
        assert!(matches!(err, FuneeError::UnresolvedReference { .. }));
    }

    #[test]
    fn recursive_declarations_terminate() {
        let g = build(&[(
            "/app/entry.ts",
            r#"function even(n) { return n === 0 ? true : odd(n - 1); }
               function odd(n) { return n === 0 ? false : even(n - 1); }
               export default function main() { return even(10); }"#,
        )])
        .unwrap();
        let names = canonicals(&g);
        assert!(names.contains(&"/app/entry.ts:even".to_string()));
        assert!(names.contains(&"/app/entry.ts:odd".to_string()));
    }

    #[test]
    fn missing_default_export_is_an_error() {
        let err = build(&[("/app/entry.ts", "export const x = 1;")]).unwrap_err();
        assert!(
            matches!(err, FuneeError::UnresolvedReference { ref name, .. } if name == "default")
        );
    }
}
