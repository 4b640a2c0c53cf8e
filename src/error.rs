use crate::canonical::CanonicalName;
use thiserror::Error;

/// Every way the bundler can fail. All of these are fatal for the bundle;
/// none are retried.
#[derive(Debug, Error)]
pub enum FuneeError {
    #[error("module not found: \"{specifier}\" (imported from {referrer})")]
    ModuleNotFound { specifier: String, referrer: String },

    #[error("failed to read {uri}: {source}")]
    ReadError {
        uri: String,
        #[source]
        source: std::io::Error,
    },

    #[error("network error fetching {url}: {reason}")]
    NetworkError { url: String, reason: String },

    #[error("parse error in {uri}: {message}")]
    ParseError { uri: String, message: String },

    #[error("unresolved reference \"{name}\" in {uri}")]
    UnresolvedReference { name: String, uri: String },

    #[error("macro {site} failed: {message}")]
    MacroInvocation { site: CanonicalName, message: String },

    #[error("macro expansion did not reach a fixpoint after {iterations} iterations; unstable call sites: {}", format_sites(.sites))]
    MacroExpansionLimitExceeded {
        iterations: usize,
        sites: Vec<CanonicalName>,
    },

    #[error("macro {site} exceeded its {budget_secs}s wall-clock budget")]
    MacroTimeout { site: CanonicalName, budget_secs: u64 },

    #[error("circular initialization between {}", format_sites(.cycle))]
    CircularInitialization { cycle: Vec<CanonicalName> },
}

fn format_sites(sites: &[CanonicalName]) -> String {
    sites
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_cite_the_failing_specifier() {
        let err = FuneeError::ModuleNotFound {
            specifier: "./missing.ts".into(),
            referrer: "/app/entry.ts".into(),
        };
        let text = err.to_string();
        assert!(text.contains("./missing.ts"));
        assert!(text.contains("/app/entry.ts"));
    }

    #[test]
    fn cycle_errors_list_every_member() {
        let err = FuneeError::CircularInitialization {
            cycle: vec![
                CanonicalName::new("/a.ts", "x"),
                CanonicalName::new("/a.ts", "y"),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("/a.ts:x"));
        assert!(text.contains("/a.ts:y"));
    }
}
