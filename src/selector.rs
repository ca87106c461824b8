use std::collections::BTreeMap;
use std::sync::Mutex;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// A `LabelSelector` compiled into a form cheap to evaluate repeatedly.
///
/// `kube` ships the wire type (`LabelSelector`) but no matcher; this
/// mirrors the selector semantics Kubernetes itself implements:
/// `matchLabels` is an exact-equality conjunction, `matchExpressions`
/// adds `In`/`NotIn`/`Exists`/`DoesNotExist` clauses, and an empty
/// selector (no labels, no expressions) matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSelector {
    match_labels: BTreeMap<String, String>,
    expressions: Vec<CompiledRequirement>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CompiledRequirement {
    In { key: String, values: Vec<String> },
    NotIn { key: String, values: Vec<String> },
    Exists { key: String },
    DoesNotExist { key: String },
}

impl CompiledSelector {
    pub fn compile(selector: &LabelSelector) -> Self {
        let match_labels = selector
            .match_labels
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let expressions = selector
            .match_expressions
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(compile_requirement)
            .collect();

        Self {
            match_labels,
            expressions,
        }
    }

    /// True if `labels` satisfies every `matchLabels` entry and every
    /// `matchExpressions` clause (conjunction of all constraints).
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        for (k, v) in &self.match_labels {
            if labels.get(k) != Some(v) {
                return false;
            }
        }

        self.expressions.iter().all(|req| req.matches(labels))
    }

    /// Canonical serialized form used as a cache key.
    pub fn canonical_key(selector: &LabelSelector) -> String {
        serde_json::to_string(selector).unwrap_or_default()
    }
}

fn compile_requirement(req: LabelSelectorRequirement) -> CompiledRequirement {
    let values = req.values.unwrap_or_default();
    match req.operator.as_str() {
        "In" => CompiledRequirement::In { key: req.key, values },
        "NotIn" => CompiledRequirement::NotIn { key: req.key, values },
        "DoesNotExist" => CompiledRequirement::DoesNotExist { key: req.key },
        // "Exists" and any unrecognized operator fall back to Exists,
        // which is the conservative (most permissive non-match) choice.
        _ => CompiledRequirement::Exists { key: req.key },
    }
}

impl CompiledRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            CompiledRequirement::In { key, values } => {
                labels.get(key).is_some_and(|v| values.contains(v))
            }
            CompiledRequirement::NotIn { key, values } => {
                !labels.get(key).is_some_and(|v| values.contains(v))
            }
            CompiledRequirement::Exists { key } => labels.contains_key(key),
            CompiledRequirement::DoesNotExist { key } => !labels.contains_key(key),
        }
    }
}

/// Caches compiled selectors keyed by their canonical serialized form, so
/// repeated evaluation against the same `LabelSelector` value (as happens
/// when matching many pods against one webhook's namespace/object
/// selectors) skips recompilation.
#[derive(Default)]
pub struct SelectorCache {
    compiled: Mutex<BTreeMap<String, CompiledSelector>>,
}

impl SelectorCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matches(&self, selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
        let key = CompiledSelector::canonical_key(selector);
        let mut cache = self.compiled.lock().expect("selector cache mutex poisoned");
        let compiled = cache
            .entry(key)
            .or_insert_with(|| CompiledSelector::compile(selector));
        compiled.matches(labels)
    }
}
