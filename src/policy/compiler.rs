//! Policy compilation
//!
//! Normalizes a Rego document, wraps it under a fingerprint-qualified
//! package, and prepares a multi-binding decision query that is reusable
//! across evaluations.

use std::sync::LazyLock;

use regex::Regex;
use regorus::Engine;

use crate::error::{AuthzError, Result};

/// Root namespace under which compiled policies are registered.
///
/// Every managed policy lives at `data.opagate.authz["<fingerprint>"]`, so
/// coexisting policies never collide regardless of what their sources declare.
const POLICY_NAMESPACE: &str = "opagate.authz";

/// The distinguished decision rule.
pub(crate) const ALLOW_QUERY: &str = "allow";

/// Top-level `package` declarations: the keyword, a qualified name, and the
/// newline or semicolon terminating it, optionally preceded by horizontal
/// whitespace.
static PACKAGE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*package[ \t]+[^;\r\n]+(?:;|\r?\n|$)").expect("package regex is valid")
});

/// Top-level rule heads: an identifier at the start of a line followed by one
/// of the forms a Rego rule head can take (assignment, body braces, function
/// arguments, partial-set/object brackets, `contains`, `if`).
static RULE_HEAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:default[ \t]+)?([A-Za-z_][A-Za-z0-9_]*)[ \t]*(?:=|:=|\{|\(|\[|contains[ \t]|if[ \t{])")
        .expect("rule head regex is valid")
});

/// Identifiers that can open a line without naming a rule.
const RESERVED_WORDS: &[&str] = &[
    "as", "contains", "default", "else", "every", "if", "import", "in", "not", "package", "some",
    "with",
];

/// Strip every top-level package declaration from a policy document.
///
/// The compiler synthesizes its own package name keyed by fingerprint, so a
/// source-supplied declaration would either shadow or conflict with it. All
/// other whitespace and comments are preserved verbatim, and the operation is
/// idempotent.
pub fn normalize(body: &str) -> String {
    PACKAGE_DECL.replace_all(body, "").into_owned()
}

/// Distinct top-level rule heads of a normalized document, in order of first
/// occurrence.
fn rule_heads(body: &str) -> Vec<String> {
    let mut heads: Vec<String> = Vec::new();
    for caps in RULE_HEAD.captures_iter(body) {
        let head = &caps[1];
        if RESERVED_WORDS.contains(&head) {
            continue;
        }
        if !heads.iter().any(|h| h == head) {
            heads.push(head.to_string());
        }
    }
    heads
}

/// One `name = object.get(data.<module>, "name", null)` binding expression.
///
/// `object.get` with a `null` default lifts an undefined rule outcome to an
/// explicit null binding, so the result shape is uniform whether or not the
/// rule fired.
fn binding_query(module: &str, rule: &str) -> String {
    format!(r#"{rule} = object.get(data.{module}, "{rule}", null)"#)
}

/// The compiler seam: produces a prepared query from a normalized body.
///
/// The policy cell is generic over this trait so tests can interpose a
/// counting spy and assert when compilation is (not) triggered.
pub trait CompilePolicy: Send + Sync {
    /// Compile `body` into a prepared query.
    fn compile(&self, body: &str) -> Result<PreparedQuery>;
}

/// Rego policy compiler bound to one managed policy
#[derive(Debug, Clone)]
pub struct PolicyCompiler {
    /// Policy name, used in diagnostics
    name: String,
    /// Fingerprint qualifying the synthesized package name
    uid: String,
    /// Whether bindings for every top-level rule head are surfaced
    all_values: bool,
}

impl PolicyCompiler {
    /// Create a compiler for the policy identified by `uid`.
    pub fn new(name: impl Into<String>, uid: impl Into<String>, all_values: bool) -> Self {
        Self {
            name: name.into(),
            uid: uid.into(),
            all_values,
        }
    }

    /// The synthesized module name, e.g. `opagate.authz["<uid>"]`.
    fn module_name(&self) -> String {
        format!(r#"{POLICY_NAMESPACE}["{}"]"#, self.uid)
    }
}

impl CompilePolicy for PolicyCompiler {
    /// Compile a normalized policy body into a [`PreparedQuery`].
    ///
    /// The body is wrapped under the synthesized package with a
    /// `default allow = false` decision rule, parsed, and paired with the
    /// decision query set: always the `allow` binding, plus one binding per
    /// distinct top-level rule head when `all_values` is set (first occurrence
    /// wins). Parse and compile diagnostics are returned as
    /// [`AuthzError::Compile`]; no partial state is retained on failure.
    fn compile(&self, body: &str) -> Result<PreparedQuery> {
        let module = self.module_name();
        let wrapped = format!("package {module}\ndefault {ALLOW_QUERY} = false\n{body}");

        let mut engine = Engine::new();
        engine.set_rego_v1(false);
        engine.set_strict_builtin_errors(false);
        engine
            .add_policy(format!("{}.rego", self.uid), wrapped)
            .map_err(|e| AuthzError::compile(&self.name, e.to_string()))?;

        let mut queries = vec![binding_query(&module, ALLOW_QUERY)];
        if self.all_values {
            for head in rule_heads(body) {
                if head != ALLOW_QUERY {
                    queries.push(binding_query(&module, &head));
                }
            }
        }

        let prepared = PreparedQuery {
            engine,
            query: queries.join(";"),
        };

        // Surface compiler diagnostics here rather than on the request path.
        prepared
            .probe()
            .map_err(|e| AuthzError::compile(&self.name, e.to_string()))?;

        Ok(prepared)
    }
}

/// A compiled policy paired with its decision query, reusable across
/// concurrent evaluations.
pub struct PreparedQuery {
    engine: Engine,
    query: String,
}

impl PreparedQuery {
    /// Run the decision query with `input` bound as the policy input root.
    ///
    /// Clones the underlying engine (compiled policies are shared, not
    /// re-parsed), so any number of evaluations may run in parallel against
    /// the same prepared query.
    pub fn eval(&self, input: regorus::Value) -> Result<regorus::QueryResults> {
        let mut engine = self.engine.clone();
        engine.set_input(input);
        engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| AuthzError::evaluation(e.to_string()))
    }

    /// Validation pass with an empty input document.
    fn probe(&self) -> Result<()> {
        let empty = regorus::Value::from_json_str("{}")
            .map_err(|e| AuthzError::evaluation(e.to_string()))?;
        self.eval(empty).map(|_| ())
    }

    /// The multi-binding query string, for diagnostics.
    pub fn query(&self) -> &str {
        &self.query
    }
}

impl std::fmt::Debug for PreparedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreparedQuery")
            .field("query", &self.query)
            .finish_non_exhaustive()
    }
}
