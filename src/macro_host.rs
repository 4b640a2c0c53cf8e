//! Bundle-time execution of user macros inside an embedded engine.
//!
//! Each invocation runs a self-contained side script: the macro's emitted
//! dependency subgraph, the reconstituted Closure arguments, one call, and
//! a collecting op that carries the serialized MacroResult back out. The
//! script is wrapped in an IIFE so one engine instance can serve every
//! call site. A watchdog thread terminates the isolate when a macro
//! exceeds its wall-clock budget.

use crate::canonical::CanonicalName;
use crate::closure::{parse_macro_outcome, Closure, MacroOutcome};
use crate::error::FuneeError;
use deno_core::{op2, FastString, JsRuntime, OpState, RuntimeOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct ExpansionState {
    result: Option<String>,
}

#[op2(fast)]
fn op_funee_macro_result(state: &mut OpState, #[string] payload: &str) {
    state.borrow_mut::<ExpansionState>().result = Some(payload.to_string());
}

deno_core::extension!(
    funee_expansion,
    ops = [op_funee_macro_result],
    state = |state| {
        state.put(ExpansionState { result: None });
    }
);

pub struct MacroHost {
    runtime: JsRuntime,
    budget: Duration,
}

impl MacroHost {
    pub fn new(budget: Duration) -> Self {
        Self {
            runtime: Self::build_runtime(),
            budget,
        }
    }

    fn build_runtime() -> JsRuntime {
        JsRuntime::new(RuntimeOptions {
            extensions: vec![funee_expansion::init()],
            ..Default::default()
        })
    }

    /// Run one macro call: `binding` is the fresh name the macro function
    /// carries inside `program`, `args` the captured call-site closures.
    pub fn invoke(
        &mut self,
        site: &CanonicalName,
        program: &str,
        binding: &str,
        args: &[Closure],
    ) -> Result<MacroOutcome, FuneeError> {
        let script = invocation_script(program, binding, args);

        let isolate = self.runtime.v8_isolate().thread_safe_handle();
        let finished = Arc::new(AtomicBool::new(false));
        let watchdog_flag = finished.clone();
        let budget = self.budget;
        let watchdog = std::thread::spawn(move || {
            let deadline = Instant::now() + budget;
            while Instant::now() < deadline {
                if watchdog_flag.load(Ordering::SeqCst) {
                    return false;
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            isolate.terminate_execution();
            true
        });

        let executed = self
            .runtime
            .execute_script("[funee:expand]", FastString::from(script));
        finished.store(true, Ordering::SeqCst);
        let timed_out = watchdog.join().unwrap_or(false);

        if timed_out {
            // The isolate is unusable after termination; start fresh for
            // the next site so one runaway macro doesn't poison the rest.
            self.runtime = Self::build_runtime();
            return Err(FuneeError::MacroTimeout {
                site: site.clone(),
                budget_secs: self.budget.as_secs(),
            });
        }

        executed.map_err(|e| FuneeError::MacroInvocation {
            site: site.clone(),
            message: e.to_string(),
        })?;

        let payload = {
            let state = self.runtime.op_state();
            let mut state = state.borrow_mut();
            state.borrow_mut::<ExpansionState>().result.take()
        }
        .ok_or_else(|| FuneeError::MacroInvocation {
            site: site.clone(),
            message: "macro did not produce a result".to_string(),
        })?;

        parse_macro_outcome(&payload).map_err(|message| FuneeError::MacroInvocation {
            site: site.clone(),
            message,
        })
    }
}

fn invocation_script(program: &str, binding: &str, args: &[Closure]) -> String {
    // Arguments travel in the bundler -> engine wire shape
    // (`references` as `[uri, name]` pairs) and are reconstituted into the
    // runtime Closure shape before the macro sees them.
    let wires = args
        .iter()
        .map(|c| c.to_wire().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"(() => {{
{program}
const __from_wire = (wire) => ({{
    expression: wire.expression,
    references: new Map(Object.entries(wire.references).map(([k, v]) => [k, {{ uri: v[0], name: v[1] }}])),
}});
const __args = [{wires}].map(__from_wire);
const __out = {binding}(...__args);
if (__out == null) throw new Error("macro returned no closure");
const __norm = __out.closure
    ? {{ type: "WithDefinitions", closure: __out.closure, definitions: __out.definitions || {{}} }}
    : {{ type: "Simple", closure: __out }};
const __refs = __norm.closure.references || new Map();
const __entries = __refs instanceof Map ? [...__refs] : Object.entries(__refs);
Deno.core.ops.op_funee_macro_result(JSON.stringify({{
    type: __norm.type,
    closure: {{
        expression: String(__norm.closure.expression),
        references: Object.fromEntries(__entries.map(([k, v]) => [k, Array.isArray(v) ? v : [v.uri, v.name]]))
    }},
    definitions: __norm.definitions
}}));
}})();"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn host() -> MacroHost {
        MacroHost::new(Duration::from_secs(30))
    }

    fn site() -> CanonicalName {
        CanonicalName::new("/test/macros.ts", "m")
    }

    #[test]
    fn a_simple_macro_rewrites_its_argument() {
        let program = "const declaration_0 = (x) => ({ expression: `(${x.expression}) + 1`, references: x.references });";
        let arg = Closure {
            expression: "5".to_string(),
            references: BTreeMap::new(),
        };
        let outcome = host()
            .invoke(&site(), program, "declaration_0", &[arg])
            .unwrap();
        assert_eq!(outcome.closure().expression, "(5) + 1");
    }

    #[test]
    fn references_round_trip_through_the_engine() {
        let program = "const declaration_0 = (x) => ({ expression: `wrap(${x.expression})`, references: x.references });";
        let arg = Closure {
            expression: "add(1, 2)".to_string(),
            references: BTreeMap::from([(
                "add".to_string(),
                CanonicalName::new("/app/other.ts", "add"),
            )]),
        };
        let outcome = host()
            .invoke(&site(), program, "declaration_0", &[arg])
            .unwrap();
        assert_eq!(outcome.closure().expression, "wrap(add(1, 2))");
        assert_eq!(
            outcome.closure().references.get("add"),
            Some(&CanonicalName::new("/app/other.ts", "add"))
        );
    }

    #[test]
    fn macros_can_combine_multiple_arguments() {
        let program = r#"const declaration_0 = (a, b) => ({
            expression: `(${a.expression}) + (${b.expression})`,
            references: new Map([...a.references, ...b.references])
        });"#;
        let args = [
            Closure {
                expression: "1".to_string(),
                references: BTreeMap::new(),
            },
            Closure {
                expression: "2".to_string(),
                references: BTreeMap::new(),
            },
        ];
        let outcome = host()
            .invoke(&site(), program, "declaration_0", &args)
            .unwrap();
        assert_eq!(outcome.closure().expression, "(1) + (2)");
    }

    #[test]
    fn definitions_come_back_keyed_by_canonical_pair() {
        let program = r#"const declaration_0 = (x) => ({
            closure: { expression: "helper()", references: new Map([["helper", { uri: "/gen.ts", name: "helper" }]]) },
            definitions: { [JSON.stringify(["/gen.ts", "helper"])]: "() => 7" }
        });"#;
        let arg = Closure {
            expression: "0".to_string(),
            references: BTreeMap::new(),
        };
        let outcome = host()
            .invoke(&site(), program, "declaration_0", &[arg])
            .unwrap();
        assert_eq!(outcome.definitions().len(), 1);
        assert_eq!(
            outcome.definitions()[0].0,
            CanonicalName::new("/gen.ts", "helper")
        );
    }

    #[test]
    fn throwing_macros_surface_as_invocation_errors() {
        let program = r#"const declaration_0 = () => { throw new Error("boom"); };"#;
        let err = host()
            .invoke(&site(), program, "declaration_0", &[])
            .unwrap_err();
        match err {
            FuneeError::MacroInvocation { message, .. } => assert!(message.contains("boom")),
            other => panic!("expected invocation error, got {:?}", other),
        }
    }

    #[test]
    fn runaway_macros_hit_the_wall_clock_budget() {
        let mut host = MacroHost::new(Duration::from_millis(200));
        let program = "const declaration_0 = () => { while (true) {} };";
        let err = host
            .invoke(&site(), program, "declaration_0", &[])
            .unwrap_err();
        assert!(matches!(err, FuneeError::MacroTimeout { .. }));
        // The replacement isolate still works.
        let ok = host.invoke(
            &site(),
            "const declaration_0 = () => ({ expression: \"1\", references: new Map() });",
            "declaration_0",
            &[],
        );
        assert!(ok.is_ok());
    }
}
