//! The Closure value: a captured expression as source text plus the
//! canonical bindings of its free identifiers. This is what macros receive
//! as arguments and what they hand back as results.

use crate::canonical::CanonicalName;
use crate::emit::print_expr;
use crate::references::free_variables;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use swc_common::SourceMap;
use swc_ecma_ast::{Expr, Lit};

#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub expression: String,
    /// Free identifier -> canonical binding. Ordered so generated code and
    /// wire payloads are deterministic.
    pub references: BTreeMap<String, CanonicalName>,
}

/// What a macro invocation produced: a replacement closure, optionally
/// with artificial definitions to inject into the bundle.
#[derive(Debug, Clone)]
pub enum MacroOutcome {
    Simple(Closure),
    WithDefinitions {
        closure: Closure,
        definitions: Vec<(CanonicalName, String)>,
    },
}

impl MacroOutcome {
    pub fn closure(&self) -> &Closure {
        match self {
            MacroOutcome::Simple(c) => c,
            MacroOutcome::WithDefinitions { closure, .. } => closure,
        }
    }

    pub fn definitions(&self) -> &[(CanonicalName, String)] {
        match self {
            MacroOutcome::Simple(_) => &[],
            MacroOutcome::WithDefinitions { definitions, .. } => definitions,
        }
    }
}

/// Capture an argument expression at a macro call site. The references map
/// holds exactly the free identifiers of the expression that are bound in
/// the surrounding declaration's scope; parameters of the expression
/// itself, JS globals and unrelated names stay out.
pub fn capture_closure(
    cm: &Rc<SourceMap>,
    expr: &Expr,
    scope: &HashMap<String, CanonicalName>,
) -> Closure {
    let mut references = BTreeMap::new();
    for name in free_variables(expr) {
        if let Some(canonical) = scope.get(&name) {
            references.insert(name, canonical.clone());
        }
    }
    Closure {
        expression: print_expr(cm, expr),
        references,
    }
}

/// The runtime AST kind of a captured expression, taken from the parsed
/// node itself rather than guessed from leading characters.
pub fn infer_ast_kind(expr: &Expr) -> &'static str {
    match expr {
        Expr::Paren(p) => infer_ast_kind(&p.expr),
        Expr::Arrow(_) => "ArrowFunctionExpression",
        Expr::Fn(_) => "FunctionExpression",
        Expr::Object(_) => "ObjectExpression",
        Expr::Array(_) => "ArrayExpression",
        Expr::Lit(Lit::Num(_)) => "NumericLiteral",
        Expr::Lit(Lit::Str(_)) => "StringLiteral",
        Expr::Lit(Lit::Bool(_)) => "BooleanLiteral",
        Expr::Lit(Lit::Null(_)) => "NullLiteral",
        Expr::Ident(_) => "Identifier",
        _ => "Expression",
    }
}

/// Escape arbitrary text as a JS string literal (JSON is a subset).
pub(crate) fn js_string(text: &str) -> String {
    serde_json::to_string(text).expect("strings always serialize to JSON")
}

impl Closure {
    /// Bundler -> engine shape: references as `{ local: [uri, name] }`.
    pub fn to_wire(&self) -> Value {
        let references: serde_json::Map<String, Value> = self
            .references
            .iter()
            .map(|(local, c)| (local.clone(), json!([c.uri, c.name])))
            .collect();
        json!({ "expression": self.expression, "references": references })
    }

    pub fn from_wire(value: &Value) -> Result<Self, String> {
        let expression = value
            .get("expression")
            .and_then(Value::as_str)
            .ok_or("closure is missing its expression")?
            .to_string();
        let mut references = BTreeMap::new();
        if let Some(map) = value.get("references").and_then(Value::as_object) {
            for (local, pair) in map {
                let uri = pair
                    .get(0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("reference \"{}\" has no uri", local))?;
                let name = pair
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| format!("reference \"{}\" has no name", local))?;
                references.insert(local.clone(), CanonicalName::new(uri, name));
            }
        }
        Ok(Self {
            expression,
            references,
        })
    }
}

/// Parse the engine -> bundler result payload:
/// `{ "type": "Simple", "closure": … }` or
/// `{ "type": "WithDefinitions", "closure": …, "definitions": { "[uri,name]": code } }`.
pub fn parse_macro_outcome(payload: &str) -> Result<MacroOutcome, String> {
    let value: Value =
        serde_json::from_str(payload).map_err(|e| format!("malformed macro result: {}", e))?;
    let closure = Closure::from_wire(
        value
            .get("closure")
            .ok_or("macro result is missing its closure")?,
    )?;
    match value.get("type").and_then(Value::as_str) {
        Some("Simple") => Ok(MacroOutcome::Simple(closure)),
        Some("WithDefinitions") => {
            let mut definitions = Vec::new();
            if let Some(map) = value.get("definitions").and_then(Value::as_object) {
                for (key, code) in map {
                    let (uri, name): (String, String) = serde_json::from_str(key)
                        .map_err(|_| format!("definition key is not a [uri,name] pair: {}", key))?;
                    let code = code
                        .as_str()
                        .ok_or_else(|| format!("definition {} is not a source snippet", key))?;
                    definitions.push((CanonicalName::new(uri, name), code.to_string()));
                }
            }
            // Injection order must not depend on JSON object ordering.
            definitions.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(MacroOutcome::WithDefinitions {
                closure,
                definitions,
            })
        }
        other => Err(format!("unknown macro result type: {:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_expr_text;

    fn expr(cm: &Rc<SourceMap>, code: &str) -> Expr {
        parse_expr_text(cm, code).unwrap()
    }

    #[test]
    fn capture_keeps_only_in_scope_references() {
        let cm: Rc<SourceMap> = Default::default();
        let scope = HashMap::from([
            ("add".to_string(), CanonicalName::new("/app/other.ts", "add")),
            ("mul".to_string(), CanonicalName::new("/app/other.ts", "mul")),
        ]);
        let closure = capture_closure(&cm, &expr(&cm, "() => () => add(1, 2)"), &scope);
        assert_eq!(closure.references.len(), 1);
        assert_eq!(
            closure.references["add"],
            CanonicalName::new("/app/other.ts", "add")
        );
    }

    #[test]
    fn capture_of_a_literal_has_no_references() {
        let cm: Rc<SourceMap> = Default::default();
        let closure = capture_closure(&cm, &expr(&cm, "42"), &HashMap::new());
        assert!(closure.references.is_empty());
        assert_eq!(closure.expression, "42");
    }

    #[test]
    fn capture_ignores_expression_parameters() {
        let cm: Rc<SourceMap> = Default::default();
        let scope = HashMap::from([("x".to_string(), CanonicalName::new("/m.ts", "x"))]);
        let closure = capture_closure(&cm, &expr(&cm, "(x) => x"), &scope);
        assert!(closure.references.is_empty());
    }

    #[test]
    fn kinds_come_from_the_parsed_node() {
        let cm: Rc<SourceMap> = Default::default();
        let cases = [
            ("(a, b) => a + b", "ArrowFunctionExpression"),
            ("function f() {}", "FunctionExpression"),
            ("({ a: 1 })", "ObjectExpression"),
            ("[1, 2]", "ArrayExpression"),
            ("42", "NumericLiteral"),
            ("\"hi\"", "StringLiteral"),
            ("true", "BooleanLiteral"),
            ("null", "NullLiteral"),
            ("someName", "Identifier"),
            ("1 + 2", "Expression"),
        ];
        for (code, expected) in cases {
            assert_eq!(infer_ast_kind(&expr(&cm, code)), expected, "for {}", code);
        }
    }

    #[test]
    fn wire_round_trip_preserves_references() {
        let closure = Closure {
            expression: "add(1, 2)".to_string(),
            references: BTreeMap::from([(
                "add".to_string(),
                CanonicalName::new("/app/other.ts", "add"),
            )]),
        };
        let back = Closure::from_wire(&closure.to_wire()).unwrap();
        assert_eq!(back, closure);
    }

    #[test]
    fn outcome_with_definitions_parses_sorted() {
        let payload = r#"{
            "type": "WithDefinitions",
            "closure": { "expression": "helper()", "references": { "helper": ["/gen.ts", "helper"] } },
            "definitions": {
                "[\"/gen.ts\",\"helper\"]": "() => 7"
            }
        }"#;
        let outcome = parse_macro_outcome(payload).unwrap();
        assert_eq!(outcome.definitions().len(), 1);
        assert_eq!(
            outcome.definitions()[0].0,
            CanonicalName::new("/gen.ts", "helper")
        );
        assert_eq!(outcome.closure().expression, "helper()");
    }

    #[test]
    fn unknown_outcome_types_are_rejected() {
        let err =
            parse_macro_outcome(r#"{ "type": "Weird", "closure": { "expression": "1" } }"#)
                .unwrap_err();
        assert!(err.contains("Weird"));
    }
}
