//! Hot-swappable compiled-policy cell
//!
//! Holds the currently active `(body, prepared query)` pair. Updates are
//! serialized and published as a single swap, so readers always observe a
//! mutually consistent pair and a failed recompile leaves the previous
//! artifact serving.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::error;

use super::compiler::{normalize, CompilePolicy, PolicyCompiler, PreparedQuery};
use crate::error::Result;

/// The currently installed pair. Swapped as a unit.
struct Installed {
    body: String,
    query: Arc<PreparedQuery>,
}

/// Mutable container for the active compiled policy
///
/// Reads go through a brief shared lock and never block behind a compile;
/// installs are serialized by a dedicated mutex and only take the write lock
/// for the final swap. The compiler seam is generic so tests can count
/// invocations.
pub struct PolicyCell<C = PolicyCompiler> {
    compiler: C,
    installed: RwLock<Installed>,
    update: Mutex<()>,
}

impl<C: CompilePolicy> PolicyCell<C> {
    /// Compile `body` and create a cell serving it.
    ///
    /// A compile failure yields no cell: callers never obtain a
    /// half-initialized policy.
    pub fn new(compiler: C, body: &str) -> Result<Self> {
        let body = normalize(body);
        let query = compile_logged(&compiler, &body)?;
        Ok(Self {
            compiler,
            installed: RwLock::new(Installed {
                body,
                query: Arc::new(query),
            }),
            update: Mutex::new(()),
        })
    }

    /// Install a new policy body, recompiling as needed.
    ///
    /// Returns `Ok(true)` when a new artifact was published, `Ok(false)` when
    /// the normalized body is byte-identical to the current one and `force`
    /// is unset (the compiler is not invoked). On a compile failure the
    /// previously installed pair remains intact and the error is returned.
    pub fn install(&self, body: &str, force: bool) -> Result<bool> {
        let _serialized = self.update.lock();

        let body = normalize(body);
        if !force && body == self.installed.read().body {
            return Ok(false);
        }

        // Compile before touching the published pair: a failure here must
        // leave readers on the previous artifact.
        let query = compile_logged(&self.compiler, &body)?;

        let mut installed = self.installed.write();
        installed.body = body;
        installed.query = Arc::new(query);
        Ok(true)
    }

    /// The currently installed prepared query.
    ///
    /// Safe to call without holding the update mutex; readers do not block
    /// installs and vice-versa.
    pub fn current(&self) -> Arc<PreparedQuery> {
        self.installed.read().query.clone()
    }

    /// The currently installed normalized body.
    pub fn body(&self) -> String {
        self.installed.read().body.clone()
    }
}

fn compile_logged<C: CompilePolicy>(compiler: &C, body: &str) -> Result<PreparedQuery> {
    compiler.compile(body).map_err(|err| {
        error!(error = %err, "failed to precompile policy");
        err
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::AuthzError;
    use crate::fingerprint::fingerprint;

    const BODY_X1: &str = "allow { input.x == 1 }";
    const BODY_X2: &str = "allow { input.x == 2 }";

    struct SpyCompiler {
        inner: PolicyCompiler,
        calls: Arc<AtomicUsize>,
    }

    impl CompilePolicy for SpyCompiler {
        fn compile(&self, body: &str) -> Result<PreparedQuery> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.compile(body)
        }
    }

    fn spy_cell(body: &str) -> (PolicyCell<SpyCompiler>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let compiler = SpyCompiler {
            inner: PolicyCompiler::new("test", fingerprint("test", body, 0), false),
            calls: calls.clone(),
        };
        let cell = PolicyCell::new(compiler, body).unwrap();
        (cell, calls)
    }

    fn allow_binding(query: &PreparedQuery, doc: &str) -> serde_json::Value {
        let input = regorus::Value::from_json_str(doc).unwrap();
        let results = query.eval(input).unwrap();
        assert!(!results.result.is_empty());
        let bindings = serde_json::to_value(&results.result[0].bindings).unwrap();
        bindings["allow"].clone()
    }

    #[test]
    fn test_unchanged_body_skips_compiler() {
        let (cell, calls) = spy_cell(BODY_X1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let changed = cell.install(BODY_X1, false).unwrap();
        assert!(!changed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_normalization_applies_before_comparison() {
        let (cell, calls) = spy_cell(BODY_X1);

        // Same document modulo a package declaration: still unchanged.
        let changed = cell
            .install(&format!("package ignored.ns\n{BODY_X1}"), false)
            .unwrap();
        assert!(!changed);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_force_reinstalls_unchanged_body() {
        let (cell, calls) = spy_cell(BODY_X1);
        let changed = cell.install(BODY_X1, true).unwrap();
        assert!(changed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_changed_body_swaps_artifact() {
        let (cell, _) = spy_cell(BODY_X1);
        let before = cell.current();

        assert!(cell.install(BODY_X2, false).unwrap());
        let after = cell.current();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(cell.body(), BODY_X2);
        assert_eq!(allow_binding(&after, r#"{"x":2}"#), serde_json::json!(true));
        // The old artifact keeps working for evaluations that still hold it.
        assert_eq!(allow_binding(&before, r#"{"x":1}"#), serde_json::json!(true));
    }

    #[test]
    fn test_failed_install_rolls_back_nothing() {
        let (cell, _) = spy_cell(BODY_X1);
        let before = cell.current();

        let err = cell.install("allow {", false).unwrap_err();
        assert!(matches!(err, AuthzError::Compile { .. }));

        assert_eq!(cell.body(), BODY_X1);
        assert!(Arc::ptr_eq(&before, &cell.current()));
        assert_eq!(
            allow_binding(&cell.current(), r#"{"x":1}"#),
            serde_json::json!(true)
        );
    }

    #[test]
    fn test_concurrent_readers_observe_consistent_pairs() {
        let (cell, _) = spy_cell(BODY_X1);
        let cell = Arc::new(cell);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        // Every observed artifact evaluates cleanly: either
                        // the old body (allow=true) or the new one
                        // (allow=false), never a torn state.
                        let verdict = allow_binding(&cell.current(), r#"{"x":1}"#);
                        assert!(verdict.is_boolean());
                    }
                })
            })
            .collect();

        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    let body = if i % 2 == 0 { BODY_X2 } else { BODY_X1 };
                    cell.install(body, true).unwrap();
                }
            })
        };

        for reader in readers {
            reader.join().unwrap();
        }
        writer.join().unwrap();
    }
}
