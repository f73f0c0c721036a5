//! Tracing setup for applications embedding the engine
//!
//! Every engine crate logs under a `sensorlink_*` target. Embedders that
//! already install their own subscriber should ignore this module and
//! merge [`engine_filter`]'s directives into their filter; `init_tracing`
//! is for binaries and examples that just want the engine defaults.

use tracing_subscriber::EnvFilter;

/// Default level per engine log target
///
/// Pipeline traffic (filtered readings, window bookkeeping) logs at
/// debug and stays off. Dropped items, unparseable formulas, and
/// swallowed persistence failures surface at warn; policy assignment
/// changes at info.
const ENGINE_DIRECTIVES: &[&str] = &[
    "sensorlink_core=warn",
    "sensorlink_formula=warn",
    "sensorlink_functions=warn",
    "sensorlink_policy=info",
    "sensorlink_runtime=info",
];

/// Filter covering the engine's log targets at their default levels
///
/// Everything outside the engine is capped at `warn`.
pub fn engine_filter() -> EnvFilter {
    let mut filter = EnvFilter::new("warn");
    for directive in ENGINE_DIRECTIVES {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Install a compact subscriber with the engine defaults
///
/// A set `RUST_LOG` replaces the engine filter entirely, so operators
/// keep full control over verbosity.
///
/// # Panics
/// Panics if a subscriber is already installed (call once per process)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| engine_filter());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::Directive;

    #[test]
    fn test_engine_directives_parse() {
        for directive in ENGINE_DIRECTIVES {
            assert!(
                directive.parse::<Directive>().is_ok(),
                "directive '{}' must parse",
                directive
            );
        }
    }

    #[test]
    fn test_engine_directives_cover_all_crates() {
        for target in [
            "sensorlink_core",
            "sensorlink_formula",
            "sensorlink_functions",
            "sensorlink_policy",
            "sensorlink_runtime",
        ] {
            assert!(
                ENGINE_DIRECTIVES.iter().any(|d| d.starts_with(target)),
                "no directive for {}",
                target
            );
        }
    }
}
