//! Rule graph compilation and breadth-first dependency analysis.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::{debug, warn};

use crate::rego::{parse_module, ParseError, Ref, RefSegment};

/// One rule of the compiled policy: absolute head path, the data references
/// in its definition, and where it came from.
#[derive(Debug, Clone)]
pub struct Rule {
    pub head: Ref,
    pub refs: Vec<Ref>,
    pub module: String,
    pub line: usize,
}

/// All rules of every loaded module, compiled together.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
    pub rules: Vec<Rule>,
}

/// A module that failed to parse during compilation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("module {module}: {error}")]
pub struct CompileError {
    pub module: String,
    pub error: ParseError,
}

impl CompiledPolicy {
    /// Compile every module; modules that fail to parse are reported and
    /// left out, the rest still analyze.
    pub fn compile(modules: &BTreeMap<String, String>) -> (CompiledPolicy, Vec<CompileError>) {
        let mut rules = Vec::new();
        let mut errors = Vec::new();
        for (id, source) in modules {
            match parse_module(source) {
                Ok(parsed) => {
                    for rule in parsed {
                        rules.push(Rule {
                            head: rule.head,
                            refs: rule.refs,
                            module: id.clone(),
                            line: rule.line,
                        });
                    }
                }
                Err(error) => errors.push(CompileError {
                    module: id.clone(),
                    error,
                }),
            }
        }
        (CompiledPolicy { rules }, errors)
    }

    /// Rules that define the virtual document `target` points into: the
    /// head and the target prefix-match in either direction.
    fn rules_for(&self, target: &Ref) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.head.has_prefix(target) || target.has_prefix(&rule.head))
            .map(|(i, _)| i)
            .collect()
    }
}

/// Result of analyzing one compiled policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    /// Discovered resource-kind names, sorted.
    pub kinds: Vec<String>,
    /// Entrypoint refs that resolved to no rule; nonempty means the result
    /// carries no kinds and must not replace a previous one.
    pub missing: Vec<Ref>,
}

/// Walk the rule dependency graph from `entrypoint`, collecting the path
/// segment that follows `prefix` in every reference it strictly covers.
pub fn analyze(policy: &CompiledPolicy, entrypoint: &Ref, prefix: &Ref) -> Analysis {
    let mut queue: VecDeque<usize> = policy.rules_for(entrypoint).into();
    if queue.is_empty() {
        debug!(entrypoint = %entrypoint, "no rules define the entrypoint");
        return Analysis {
            kinds: Vec::new(),
            missing: vec![entrypoint.clone()],
        };
    }

    let mut visited = vec![false; policy.rules.len()];
    let mut kinds = BTreeSet::new();
    while let Some(next) = queue.pop_front() {
        if visited[next] {
            continue;
        }
        visited[next] = true;
        let rule = &policy.rules[next];
        for r in &rule.refs {
            queue.extend(policy.rules_for(r));
            if r.has_prefix(prefix) && r.len() > prefix.len() {
                match r.get(prefix.len()) {
                    Some(RefSegment::String(kind)) => {
                        kinds.insert(kind.clone());
                    }
                    // A computed segment right after the prefix names no
                    // single kind; skip it and keep analyzing.
                    Some(RefSegment::Var) | None => {
                        warn!(
                            module = %rule.module,
                            line = rule.line,
                            reference = %r,
                            "reference under replication prefix has no literal kind segment; skipped"
                        );
                    }
                }
            }
        }
        debug!(module = %policy.rules[next].module, head = %policy.rules[next].head, "analyzed rule");
    }

    Analysis {
        kinds: kinds.into_iter().collect(),
        missing: Vec::new(),
    }
}
