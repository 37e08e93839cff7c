use crate::{
    client::ClusterApi,
    core::RuleSet,
    index::{self, EndpointSet, PolicySet, RuleEntries},
    k8s::{NetworkPolicy, Pod, ResourceExt},
    metrics::Metrics,
    provisioner::{Netns, PacketFilter, Provisioner},
    watch::Handle,
};
use ahash::AHashMap as HashMap;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Evaluates this node's pods against their namespace's network policies and provisions the
/// resulting rules.
#[derive(Debug)]
pub struct Controller<C, N, F> {
    node_name: String,
    entries: RuleEntries,
    client: C,
    provisioner: Arc<Provisioner<N, F>>,

    state: Mutex<State>,

    metrics: Metrics,
}

#[derive(Debug, Default)]
struct State {
    /// Namespaces of the pods whose rules have been dispatched, by pod uid.
    provisioned: HashMap<String, String>,

    /// Incremented each time a namespace's policies change.
    generations: HashMap<String, u64>,
}

/// The result of evaluating a pod against a snapshot of its namespace.
enum Evaluation {
    Unmanaged,
    NoEndpoints,
    Compiled(RuleSet),
}

/// What became of an applied pod.
#[derive(Debug)]
pub enum Dispatch {
    /// The pod is not scheduled to this node.
    OtherNode,

    /// The pod lacks the metadata needed to evaluate it.
    Incomplete,

    /// The pod's rules were already dispatched.
    AlreadyProvisioned,

    /// No policy applies to the pod.
    Unmanaged,

    /// The pod has no network endpoints yet.
    NoEndpoints,

    /// The pod's rules are being installed. The task completes once the outcome is recorded.
    Provisioning(JoinHandle<()>),
}

// === impl Controller ===

impl<C, N, F> Controller<C, N, F>
where
    C: ClusterApi,
    N: Netns + Send + Sync + 'static,
    F: PacketFilter + Send + Sync + 'static,
{
    pub fn new(
        node_name: impl Into<String>,
        entries: RuleEntries,
        client: C,
        provisioner: Provisioner<N, F>,
        metrics: Metrics,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            entries,
            client,
            provisioner: Arc::new(provisioner),
            state: Mutex::new(State::default()),
            metrics,
        }
    }

    /// Compiles and dispatches the rules of a pod on this node that has not been provisioned.
    ///
    /// Provisioning proceeds in the background; the pod is marked provisioned as soon as it is
    /// dispatched. If the namespace's policies change while the pod is being evaluated, the
    /// evaluation is discarded and repeated against the new policies.
    #[tracing::instrument(skip_all, fields(ns = ?pod.namespace(), pod = %pod.name_any()))]
    pub async fn apply_pod(&self, pod: Pod) -> Result<Dispatch> {
        let node = pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref());
        if node != Some(self.node_name.as_str()) {
            return Ok(Dispatch::OtherNode);
        }

        let (uid, namespace) = match (pod.uid(), pod.namespace()) {
            (Some(uid), Some(ns)) => (uid, ns),
            _ => {
                tracing::warn!("Pod is missing a uid or namespace");
                return Ok(Dispatch::Incomplete);
            }
        };
        let rules = loop {
            let generation = {
                let state = self.state.lock();
                if state.provisioned.contains_key(&uid) {
                    return Ok(Dispatch::AlreadyProvisioned);
                }
                state.generation(&namespace)
            };

            let evaluation = self.evaluate(&pod, &uid, &namespace).await?;

            let mut state = self.state.lock();
            if state.generation(&namespace) != generation {
                tracing::debug!("Policies changed during evaluation; re-evaluating");
                continue;
            }
            match evaluation {
                Evaluation::Unmanaged => {
                    self.metrics.unmanaged();
                    return Ok(Dispatch::Unmanaged);
                }
                Evaluation::NoEndpoints => return Ok(Dispatch::NoEndpoints),
                Evaluation::Compiled(rules) => {
                    if state.provisioned.contains_key(&uid) {
                        return Ok(Dispatch::AlreadyProvisioned);
                    }
                    state.provisioned.insert(uid, namespace);
                    break rules;
                }
            }
        };

        let provisioning = self.provisioner.spawn(rules);
        let metrics = self.metrics.clone();
        let task = tokio::spawn(async move {
            match provisioning.await {
                Ok(report) => metrics.provisioned(&report),
                Err(error) => {
                    tracing::warn!(%error, "Provisioning failed");
                    metrics.failed();
                }
            }
        });
        Ok(Dispatch::Provisioning(task))
    }

    async fn evaluate(&self, pod: &Pod, uid: &str, namespace: &str) -> Result<Evaluation> {
        self.metrics.evaluated();

        let policies = PolicySet::new(self.client.list_policies(namespace).await?);
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let applicable = policies.applicable(&labels);
        if applicable.is_empty() {
            tracing::debug!("No policies apply");
            return Ok(Evaluation::Unmanaged);
        }

        let endpoints =
            EndpointSet::from_resources(self.client.list_endpoints(namespace).await?, uid);
        let netns = match endpoints.netns() {
            Some(netns) => netns.to_path_buf(),
            None => {
                tracing::info!("Pod has no network endpoints; waiting for a later update");
                return Ok(Evaluation::NoEndpoints);
            }
        };

        let rules = index::compile(applicable, &endpoints, netns, self.entries);
        tracing::debug!(
            policies = policies.len(),
            endpoints = endpoints.len(),
            rules = rules.len(),
            "Dispatching"
        );
        Ok(Evaluation::Compiled(rules))
    }

    pub fn delete_pod(&self, pod: &Pod) {
        if let Some(uid) = pod.uid() {
            if self.state.lock().provisioned.remove(&uid).is_some() {
                tracing::debug!(ns = ?pod.namespace(), pod = %pod.name_any(), "Forgot pod");
            }
        }
    }

    pub fn apply_policy(&self, policy: &NetworkPolicy) {
        tracing::info!(ns = ?policy.namespace(), policy = %policy.name_any(), "Policy applied");
        self.reset_namespace(policy);
    }

    pub fn delete_policy(&self, policy: &NetworkPolicy) {
        tracing::info!(ns = ?policy.namespace(), policy = %policy.name_any(), "Policy deleted");
        self.reset_namespace(policy);
    }

    /// Whether the pod with the given uid has had its rules dispatched.
    pub fn is_provisioned(&self, uid: &str) -> bool {
        self.state.lock().provisioned.contains_key(uid)
    }

    /// Lets the next event of each of the namespace's pods re-evaluate it and invalidates
    /// evaluations of the namespace that are in flight.
    fn reset_namespace(&self, policy: &NetworkPolicy) {
        let Some(namespace) = policy.namespace() else {
            return;
        };
        let mut state = self.state.lock();
        let before = state.provisioned.len();
        state.provisioned.retain(|_, ns| *ns != namespace);
        let cleared = before - state.provisioned.len();
        *state.generations.entry(namespace.clone()).or_default() += 1;
        tracing::debug!(%namespace, pods = cleared, "Cleared provisioned pods");
    }
}

// === impl State ===

impl State {
    fn generation(&self, namespace: &str) -> u64 {
        self.generations.get(namespace).copied().unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl<C, N, F> Handle<Pod> for Controller<C, N, F>
where
    C: ClusterApi,
    N: Netns + Send + Sync + 'static,
    F: PacketFilter + Send + Sync + 'static,
{
    async fn apply(&self, pod: Pod) {
        match self.apply_pod(pod).await {
            Ok(dispatch) => tracing::trace!(?dispatch),
            Err(error) => tracing::warn!(%error, "Failed to evaluate pod"),
        }
    }

    async fn delete(&self, pod: Pod) {
        self.delete_pod(&pod);
    }
}

#[async_trait::async_trait]
impl<C, N, F> Handle<NetworkPolicy> for Controller<C, N, F>
where
    C: ClusterApi,
    N: Netns + Send + Sync + 'static,
    F: PacketFilter + Send + Sync + 'static,
{
    async fn apply(&self, policy: NetworkPolicy) {
        self.apply_policy(&policy);
    }

    async fn delete(&self, policy: NetworkPolicy) {
        self.delete_policy(&policy);
    }
}
