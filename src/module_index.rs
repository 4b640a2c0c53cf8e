//! Per-module declaration index: every top-level binding of a module,
//! keyed by local name, with import and re-export bindings recorded as
//! aliases to be chased lazily by the graph.

use crate::canonical::HOST_NAMESPACE;
use std::collections::HashMap;
use swc_ecma_ast::{
    Callee, ClassDecl, ClassExpr, Decl, DefaultDecl, ExportSpecifier, Expr, FnDecl, FnExpr,
    ImportSpecifier, Module, ModuleDecl, ModuleExportName, ModuleItem, Pat, Stmt, VarDeclarator,
};

/// Compile-time macros whose bodies live in the bundler itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinMacro {
    CreateMacro,
    Closure,
    CanonicalNameOf,
    Tuple,
    UnsafeCast,
}

impl BuiltinMacro {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "createMacro" => Some(Self::CreateMacro),
            "closure" => Some(Self::Closure),
            "canonicalName" => Some(Self::CanonicalNameOf),
            "tuple" => Some(Self::Tuple),
            "unsafeCast" => Some(Self::UnsafeCast),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::CreateMacro => "createMacro",
            Self::Closure => "closure",
            Self::CanonicalNameOf => "canonicalName",
            Self::Tuple => "tuple",
            Self::UnsafeCast => "unsafeCast",
        }
    }
}

/// One top-level binding. `Alias` and `Namespace` carry the raw import
/// specifier; the graph resolves it against the module's URI when chasing.
#[derive(Debug, Clone)]
pub enum Declaration {
    Fn(FnDecl),
    FnExpr(FnExpr),
    Class(ClassDecl),
    ClassExpr(ClassExpr),
    /// Variable initializer.
    Var(Expr),
    /// The function passed to `createMacro`.
    Macro(Expr),
    /// Import or re-export. `specifier == None` aliases within the module.
    Alias {
        specifier: Option<String>,
        name: String,
    },
    /// `import * as ns from "<specifier>"`.
    Namespace { specifier: String },
    /// A binding served by the host at runtime.
    Host(String),
    /// A macro implemented by the bundler.
    Builtin(BuiltinMacro),
    /// Synthetic expression (the bundle root).
    Expr(Expr),
}

impl Declaration {
    /// Hoisted declarations may be emitted in any order inside a cycle.
    pub fn is_hoisted(&self) -> bool {
        matches!(self, Declaration::Fn(_) | Declaration::FnExpr(_))
    }
}

#[derive(Debug, Clone)]
pub struct IndexedDeclaration {
    pub exported: bool,
    pub decl: Declaration,
}

/// Walk a module's top-level items into the name index.
pub fn index_module(module: &Module) -> HashMap<String, IndexedDeclaration> {
    let imports = collect_import_bindings(module);
    let mut index = HashMap::new();

    for item in &module.body {
        match item {
            ModuleItem::ModuleDecl(ModuleDecl::Import(import)) => {
                if import.type_only {
                    continue;
                }
                let specifier = wtf8_to_string(&import.src.value);
                for spec in &import.specifiers {
                    match spec {
                        ImportSpecifier::Named(n) => {
                            if n.is_type_only {
                                continue;
                            }
                            let imported = n
                                .imported
                                .as_ref()
                                .map(export_name_to_string)
                                .unwrap_or_else(|| n.local.sym.to_string());
                            index.insert(
                                n.local.sym.to_string(),
                                IndexedDeclaration {
                                    exported: false,
                                    decl: Declaration::Alias {
                                        specifier: Some(specifier.clone()),
                                        name: imported,
                                    },
                                },
                            );
                        }
                        ImportSpecifier::Default(n) => {
                            index.insert(
                                n.local.sym.to_string(),
                                IndexedDeclaration {
                                    exported: false,
                                    decl: Declaration::Alias {
                                        specifier: Some(specifier.clone()),
                                        name: "default".to_string(),
                                    },
                                },
                            );
                        }
                        ImportSpecifier::Namespace(n) => {
                            index.insert(
                                n.local.sym.to_string(),
                                IndexedDeclaration {
                                    exported: false,
                                    decl: Declaration::Namespace {
                                        specifier: specifier.clone(),
                                    },
                                },
                            );
                        }
                    }
                }
            }
            ModuleItem::ModuleDecl(ModuleDecl::ExportDecl(export)) => {
                index_decl(&export.decl, true, &imports, &mut index);
            }
            ModuleItem::ModuleDecl(ModuleDecl::ExportDefaultDecl(export)) => {
                let decl = match &export.decl {
                    DefaultDecl::Fn(f) => Some(Declaration::FnExpr(f.clone())),
                    DefaultDecl::Class(c) => Some(Declaration::ClassExpr(c.clone())),
                    DefaultDecl::TsInterfaceDecl(_) => None,
                };
                if let Some(decl) = decl {
                    index.insert(
                        "default".to_string(),
                        IndexedDeclaration {
                            exported: true,
                            decl,
                        },
                    );
                }
            }
            ModuleItem::ModuleDecl(ModuleDecl::ExportDefaultExpr(export)) => {
                index.insert(
                    "default".to_string(),
                    IndexedDeclaration {
                        exported: true,
                        decl: declaration_for_init((*export.expr).clone(), &imports),
                    },
                );
            }
            ModuleItem::ModuleDecl(ModuleDecl::ExportNamed(export)) => {
                if export.type_only {
                    continue;
                }
                let specifier = export.src.as_ref().map(|s| wtf8_to_string(&s.value));
                for spec in &export.specifiers {
                    if let ExportSpecifier::Named(n) = spec {
                        if n.is_type_only {
                            continue;
                        }
                        let orig = export_name_to_string(&n.orig);
                        let exported = n
                            .exported
                            .as_ref()
                            .map(export_name_to_string)
                            .unwrap_or_else(|| orig.clone());
                        // `export { x }` with no source and no rename is
                        // already covered by the declaration itself.
                        if specifier.is_none() && exported == orig {
                            continue;
                        }
                        index.insert(
                            exported,
                            IndexedDeclaration {
                                exported: true,
                                decl: Declaration::Alias {
                                    specifier: specifier.clone(),
                                    name: orig,
                                },
                            },
                        );
                    }
                }
            }
            ModuleItem::Stmt(Stmt::Decl(decl)) => {
                index_decl(decl, false, &imports, &mut index);
            }
            _ => {}
        }
    }

    index
}

fn index_decl(
    decl: &Decl,
    exported: bool,
    imports: &HashMap<String, (String, String)>,
    index: &mut HashMap<String, IndexedDeclaration>,
) {
    match decl {
        Decl::Fn(f) => {
            index.insert(
                f.ident.sym.to_string(),
                IndexedDeclaration {
                    exported,
                    decl: Declaration::Fn(f.clone()),
                },
            );
        }
        Decl::Class(c) => {
            index.insert(
                c.ident.sym.to_string(),
                IndexedDeclaration {
                    exported,
                    decl: Declaration::Class(c.clone()),
                },
            );
        }
        Decl::Var(var) => {
            for declarator in &var.decls {
                if let Some((name, decl)) = index_declarator(declarator, imports) {
                    index.insert(name, IndexedDeclaration { exported, decl });
                }
            }
        }
        _ => {}
    }
}

fn index_declarator(
    declarator: &VarDeclarator,
    imports: &HashMap<String, (String, String)>,
) -> Option<(String, Declaration)> {
    // Only simple `name = init` bindings become declarations; destructuring
    // patterns have no single canonical name.
    let (Pat::Ident(ident), Some(init)) = (&declarator.name, &declarator.init) else {
        return None;
    };
    Some((
        ident.id.sym.to_string(),
        declaration_for_init((**init).clone(), imports),
    ))
}

/// A variable initializer is a macro definition when it calls the host's
/// `createMacro`; the import map tells us what the callee name is bound to.
fn declaration_for_init(init: Expr, imports: &HashMap<String, (String, String)>) -> Declaration {
    if let Expr::Call(call) = &init {
        if let Callee::Expr(callee) = &call.callee {
            if let Expr::Ident(ident) = &**callee {
                let binding = imports.get(ident.sym.as_ref());
                if let Some((specifier, imported)) = binding {
                    if specifier == HOST_NAMESPACE && imported == "createMacro" {
                        if let Some(first) = call.args.first() {
                            if first.spread.is_none() {
                                return Declaration::Macro((*first.expr).clone());
                            }
                        }
                    }
                }
            }
        }
    }
    Declaration::Var(init)
}

/// Local name -> (specifier, imported name) for every named import.
fn collect_import_bindings(module: &Module) -> HashMap<String, (String, String)> {
    let mut bindings = HashMap::new();
    for item in &module.body {
        let ModuleItem::ModuleDecl(ModuleDecl::Import(import)) = item else {
            continue;
        };
        if import.type_only {
            continue;
        }
        let specifier = wtf8_to_string(&import.src.value);
        for spec in &import.specifiers {
            if let ImportSpecifier::Named(n) = spec {
                let imported = n
                    .imported
                    .as_ref()
                    .map(export_name_to_string)
                    .unwrap_or_else(|| n.local.sym.to_string());
                bindings.insert(n.local.sym.to_string(), (specifier.clone(), imported));
            }
        }
    }
    bindings
}

fn export_name_to_string(name: &ModuleExportName) -> String {
    match name {
        ModuleExportName::Ident(ident) => ident.sym.to_string(),
        ModuleExportName::Str(s) => wtf8_to_string(&s.value),
    }
}

fn wtf8_to_string(atom: &swc_atoms::Wtf8Atom) -> String {
    atom.as_str().unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_module_text;
    use crate::references::ReferenceMarks;
    use std::rc::Rc;
    use swc_common::SourceMap;

    fn index(source: &str) -> HashMap<String, IndexedDeclaration> {
        let cm: Rc<SourceMap> = Default::default();
        let marks = ReferenceMarks::new();
        let module = parse_module_text(&cm, "/m.ts", source, &marks).unwrap();
        index_module(&module)
    }

    #[test]
    fn named_imports_index_as_aliases() {
        let idx = index(r#"import { add, mul as times } from "./math.ts";"#);
        match &idx["add"].decl {
            Declaration::Alias { specifier, name } => {
                assert_eq!(specifier.as_deref(), Some("./math.ts"));
                assert_eq!(name, "add");
            }
            other => panic!("expected alias, got {:?}", other),
        }
        match &idx["times"].decl {
            Declaration::Alias { name, .. } => assert_eq!(name, "mul"),
            other => panic!("expected alias, got {:?}", other),
        }
    }

    #[test]
    fn default_imports_alias_the_default_export() {
        let idx = index(r#"import main from "./app.ts";"#);
        match &idx["main"].decl {
            Declaration::Alias { name, .. } => assert_eq!(name, "default"),
            other => panic!("expected alias, got {:?}", other),
        }
    }

    #[test]
    fn namespace_imports_index_as_namespaces() {
        let idx = index(r#"import * as utils from "./utils.ts";"#);
        assert!(matches!(
            idx["utils"].decl,
            Declaration::Namespace { ref specifier } if specifier == "./utils.ts"
        ));
    }

    #[test]
    fn exported_and_local_declarations_are_indexed() {
        let idx = index("export function visible() {}\nconst hidden = 1;");
        assert!(idx["visible"].exported);
        assert!(!idx["hidden"].exported);
        assert!(matches!(idx["hidden"].decl, Declaration::Var(_)));
    }

    #[test]
    fn default_export_function_is_indexed_under_default() {
        let idx = index("export default function run() {}");
        assert!(matches!(idx["default"].decl, Declaration::FnExpr(_)));
    }

    #[test]
    fn reexports_with_source_are_aliases() {
        let idx = index(r#"export { helper as util } from "./helpers.ts";"#);
        match &idx["util"].decl {
            Declaration::Alias { specifier, name } => {
                assert_eq!(specifier.as_deref(), Some("./helpers.ts"));
                assert_eq!(name, "helper");
            }
            other => panic!("expected alias, got {:?}", other),
        }
    }

    #[test]
    fn create_macro_initializers_are_flagged() {
        let idx = index(
            r#"
            import { createMacro } from "funee";
            export const double = createMacro((x) => x);
            const plain = other(1);
            "#,
        );
        assert!(matches!(idx["double"].decl, Declaration::Macro(_)));
        assert!(matches!(idx["plain"].decl, Declaration::Var(_)));
    }

    #[test]
    fn create_macro_detection_follows_the_import_binding() {
        // createMacro imported from somewhere else is not the builtin.
        let idx = index(
            r#"
            import { createMacro } from "./fake.ts";
            export const double = createMacro((x) => x);
            "#,
        );
        assert!(matches!(idx["double"].decl, Declaration::Var(_)));
    }
}
