//! Parsing of one module: TypeScript syntax in, type-erased ES module out.
//!
//! Type annotations, interfaces, type aliases and type-only imports are
//! erased right after parse, so the rest of the pipeline only ever sees
//! runtime declarations.

use crate::error::FuneeError;
use crate::references::ReferenceMarks;
use std::path::Path;
use std::rc::Rc;
use swc_common::{SourceFile, SourceMap, GLOBALS};
use swc_ecma_ast::{EsVersion, Expr, Module, Program};
use swc_ecma_parser::{lexer::Lexer, parse_file_as_module, Parser, StringInput, Syntax, TsSyntax};
use swc_ecma_transforms_base::resolver;
use swc_ecma_transforms_typescript::strip;

fn ts_syntax() -> Syntax {
    Syntax::Typescript(TsSyntax::default())
}

/// Load and parse the module at `uri` through the source map's file loader
/// (which serves both disk paths and HTTP URLs).
pub fn parse_module(
    cm: &Rc<SourceMap>,
    uri: &str,
    marks: &ReferenceMarks,
) -> Result<Module, FuneeError> {
    let fm = cm.load_file(Path::new(uri)).map_err(|e| {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            FuneeError::NetworkError {
                url: uri.to_string(),
                reason: e.to_string(),
            }
        } else {
            FuneeError::ReadError {
                uri: uri.to_string(),
                source: e,
            }
        }
    })?;
    parse_source_file(&fm, uri, marks)
}

/// Parse module source already in the source map. Used by tests and by the
/// macro engine when it re-indexes synthesized code.
pub fn parse_module_text(
    cm: &Rc<SourceMap>,
    uri: &str,
    source: &str,
    marks: &ReferenceMarks,
) -> Result<Module, FuneeError> {
    let fm = cm.new_source_file(
        swc_common::FileName::Custom(uri.to_string()).into(),
        source.to_string(),
    );
    parse_source_file(&fm, uri, marks)
}

fn parse_source_file(
    fm: &SourceFile,
    uri: &str,
    marks: &ReferenceMarks,
) -> Result<Module, FuneeError> {
    let mut recovered = vec![];
    let module = parse_file_as_module(fm, ts_syntax(), EsVersion::latest(), None, &mut recovered)
        .map_err(|e| FuneeError::ParseError {
            uri: uri.to_string(),
            message: format!("{:?}", e),
        })?;
    if let Some(err) = recovered.into_iter().next() {
        return Err(FuneeError::ParseError {
            uri: uri.to_string(),
            message: format!("{:?}", err),
        });
    }
    Ok(erase_types(module, marks))
}

fn erase_types(module: Module, marks: &ReferenceMarks) -> Module {
    GLOBALS.set(&marks.globals, || {
        let mut program = Program::Module(module);
        program.mutate(resolver(marks.unresolved, marks.top_level, true));
        program.mutate(strip(marks.unresolved, marks.top_level));
        match program {
            Program::Module(m) => m,
            Program::Script(_) => unreachable!("parsed as a module"),
        }
    })
}

/// Parse a standalone expression (macro results, synthesized snippets).
/// Every call allocates a fresh anonymous source file, so the resulting
/// spans are unique across the whole pipeline.
pub fn parse_expr_text(cm: &Rc<SourceMap>, code: &str) -> Result<Expr, FuneeError> {
    let fm = cm.new_source_file(swc_common::FileName::Anon.into(), code.to_string());
    let lexer = Lexer::new(
        ts_syntax(),
        EsVersion::latest(),
        StringInput::from(&*fm),
        None,
    );
    let mut parser = Parser::new_from(lexer);
    parser
        .parse_expr()
        .map(|e| *e)
        .map_err(|e| FuneeError::ParseError {
            uri: "<expression>".to_string(),
            message: format!("{:?} in `{}`", e, code),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use swc_ecma_ast::ModuleItem;

    #[test]
    fn type_annotations_are_erased() {
        let cm: Rc<SourceMap> = Default::default();
        let marks = ReferenceMarks::new();
        let module = parse_module_text(
            &cm,
            "/m.ts",
            "export const add = (a: number, b: number): number => a + b;\ntype Pair = [number, number];",
            &marks,
        )
        .unwrap();
        // The type alias is gone, only the value declaration remains.
        assert_eq!(module.body.len(), 1);
        assert!(matches!(module.body[0], ModuleItem::ModuleDecl(_)));
    }

    #[test]
    fn syntax_errors_cite_the_module() {
        let cm: Rc<SourceMap> = Default::default();
        let marks = ReferenceMarks::new();
        let err = parse_module_text(&cm, "/bad.ts", "const = ;", &marks).unwrap_err();
        assert!(matches!(err, FuneeError::ParseError { ref uri, .. } if uri == "/bad.ts"));
    }

    #[test]
    fn expression_snippets_parse() {
        let cm: Rc<SourceMap> = Default::default();
        let e = parse_expr_text(&cm, "(5) + 1").unwrap();
        assert!(matches!(e, Expr::Bin(_)));
    }
}
