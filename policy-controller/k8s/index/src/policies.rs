use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use netpol_controller_core::Labels;
use netpol_controller_k8s_api::{NetworkPolicy, ResourceExt};

/// Indexes the policies of a single namespace by the label pairs their pod selectors require.
///
/// A policy is filed under each of its selector's pairs, so a workload carrying any one of them
/// selects it. Policies whose selector requires no pairs apply to every workload in the namespace.
#[derive(Debug, Default)]
pub struct PolicySet {
    policies: Vec<NetworkPolicy>,
    by_label: HashMap<String, HashMap<String, Vec<usize>>>,
    applies_to_all: Vec<usize>,
}

// === impl PolicySet ===

impl PolicySet {
    pub fn new(policies: impl IntoIterator<Item = NetworkPolicy>) -> Self {
        let mut set = Self::default();
        for policy in policies {
            let selector = match policy.spec.pod_selector.as_map() {
                Ok(selector) => selector,
                Err(error) => {
                    tracing::warn!(
                        policy = %policy.name_any(),
                        %error,
                        "Ignoring policy with unsupported pod selector",
                    );
                    continue;
                }
            };

            let idx = set.policies.len();
            if selector.is_empty() {
                set.applies_to_all.push(idx);
            }
            for (key, value) in selector {
                set.by_label
                    .entry(key)
                    .or_default()
                    .entry(value)
                    .or_default()
                    .push(idx);
            }
            set.policies.push(policy);
        }
        set
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Returns the policies that apply to a workload with the given labels.
    ///
    /// Policies selected through the workload's labels come first, in label key order, followed
    /// by the policies that apply to every workload. Each policy is returned at most once.
    pub fn applicable(&self, labels: &Labels) -> Vec<&NetworkPolicy> {
        let by_label = labels.iter().flat_map(|(key, value)| {
            self.by_label
                .get(key)
                .and_then(|values| values.get(value))
                .into_iter()
                .flatten()
        });

        let mut seen = HashSet::new();
        let mut applicable = Vec::new();
        for &idx in by_label.chain(&self.applies_to_all) {
            let policy = &self.policies[idx];
            if seen.insert(policy_key(policy)) {
                applicable.push(policy);
            }
        }
        applicable
    }
}

fn policy_key(policy: &NetworkPolicy) -> String {
    policy.uid().unwrap_or_else(|| policy.name_any())
}
