use crate::{
    client::ClusterApi,
    controller::{Controller, Dispatch},
    index::RuleEntries,
    k8s::{
        endpoint::Interface,
        policy::{IngressRule, Peer, PolicyPort},
        IntOrString, NetworkEndpoint, NetworkEndpointSpec, NetworkPolicy, NetworkPolicySpec,
        ObjectMeta, Pod, PodSpec, Selector,
    },
    metrics::Metrics,
    provisioner::{FilterError, Netns, PacketFilter, Position, Provisioner},
};
use maplit::btreemap;
use parking_lot::Mutex;
use std::{io, path::Path, sync::Arc};
use tokio::sync::Notify;

const NODE: &str = "node-0";
const NS: &str = "ns-0";

#[derive(Default)]
struct FakeCluster {
    policies: Mutex<Vec<NetworkPolicy>>,
    endpoints: Mutex<Vec<NetworkEndpoint>>,
    fail_endpoints: Mutex<bool>,

    /// When set, listing endpoints signals `entered` and waits to be notified.
    gate: Mutex<Option<Arc<Notify>>>,
    entered: Notify,
}

#[async_trait::async_trait]
impl ClusterApi for Arc<FakeCluster> {
    async fn list_policies(&self, namespace: &str) -> anyhow::Result<Vec<NetworkPolicy>> {
        assert_eq!(namespace, NS);
        Ok(self.policies.lock().clone())
    }

    async fn list_endpoints(&self, namespace: &str) -> anyhow::Result<Vec<NetworkEndpoint>> {
        assert_eq!(namespace, NS);
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        if *self.fail_endpoints.lock() {
            anyhow::bail!("endpoints unavailable");
        }
        Ok(self.endpoints.lock().clone())
    }
}

#[derive(Clone, Debug, Default)]
struct FakeNetns {
    missing: bool,
}

impl Netns for FakeNetns {
    type Guard = ();

    fn enter(&self, _: &Path) -> io::Result<()> {
        if self.missing {
            return Err(io::ErrorKind::NotFound.into());
        }
        Ok(())
    }
}

/// Records installed rules as `chain args`.
#[derive(Clone, Debug, Default)]
struct FakeFilter(Arc<Mutex<Vec<String>>>);

impl PacketFilter for FakeFilter {
    fn has_chain(&self, _: &str, _: &str) -> Result<bool, FilterError> {
        Ok(false)
    }

    fn ensure_chain(&self, _: &str, _: &str) -> Result<(), FilterError> {
        Ok(())
    }

    fn flush_chain(&self, _: &str, _: &str) -> Result<(), FilterError> {
        Ok(())
    }

    fn ensure_rule(
        &self,
        _: Position,
        _: &str,
        chain: &str,
        args: &[String],
    ) -> Result<(), FilterError> {
        self.0.lock().push(format!("{chain} {}", args.join(" ")));
        Ok(())
    }

    fn delete_rule(&self, _: &str, _: &str, _: &[String]) -> Result<(), FilterError> {
        Ok(())
    }
}

type TestController = Controller<Arc<FakeCluster>, FakeNetns, FakeFilter>;

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

fn mk_controller(
    cluster: &Arc<FakeCluster>,
    netns: FakeNetns,
) -> (TestController, FakeFilter, Metrics) {
    let v4 = FakeFilter::default();
    let metrics = Metrics::default();
    let controller = Controller::new(
        NODE,
        RuleEntries::First,
        cluster.clone(),
        Provisioner::new(netns, v4.clone(), FakeFilter::default()),
        metrics.clone(),
    );
    (controller, v4, metrics)
}

fn mk_pod(name: &str, node: &str, app: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(NS.to_string()),
            name: Some(name.to_string()),
            uid: Some(format!("uid-{name}")),
            labels: Some(btreemap! { "app".to_string() => app.to_string() }),
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}

fn mk_endpoint(pod: &str, app: &str, address: &str) -> NetworkEndpoint {
    let mut ep = NetworkEndpoint::new(
        &format!("{pod}-internal"),
        NetworkEndpointSpec {
            network_name: "internal".to_string(),
            pod: pod.to_string(),
            pod_uid: format!("uid-{pod}"),
            netns: format!("/var/run/netns/{pod}"),
            iface: Interface {
                name: "eth1".to_string(),
                address: format!("{address}/24"),
                address_ipv6: "none".to_string(),
                ..Interface::default()
            },
            api_type: "DanmNet".to_string(),
            ..NetworkEndpointSpec::default()
        },
    );
    ep.metadata.namespace = Some(NS.to_string());
    ep.metadata.uid = Some(format!("ep-{pod}"));
    ep.metadata.labels = Some(btreemap! { "app".to_string() => app.to_string() });
    ep
}

/// Admits traffic to `app=web` from `app=db` on TCP 5432.
fn web_policy() -> NetworkPolicy {
    let mut policy = NetworkPolicy::new(
        "web",
        NetworkPolicySpec {
            pod_selector: Selector::from_iter(Some(("app", "web"))),
            ingress: vec![IngressRule {
                ports: vec![PolicyPort {
                    protocol: Some("TCP".to_string()),
                    port: Some(IntOrString::Int(5432)),
                }],
                from: vec![Peer {
                    pod_selector: Some(Selector::from_iter(Some(("app", "db")))),
                    ..Peer::default()
                }],
            }],
            egress: vec![],
            policy_types: vec![],
        },
    );
    policy.metadata.namespace = Some(NS.to_string());
    policy.metadata.uid = Some("uid-policy-web".to_string());
    policy
}

fn cluster() -> Arc<FakeCluster> {
    let cluster = Arc::new(FakeCluster::default());
    cluster.policies.lock().push(web_policy());
    cluster.endpoints.lock().extend([
        mk_endpoint("web", "web", "10.0.0.1"),
        mk_endpoint("db", "db", "10.0.0.2"),
    ]);
    cluster
}

async fn provisioned(dispatch: Dispatch) {
    match dispatch {
        Dispatch::Provisioning(task) => task.await.expect("task must complete"),
        dispatch => panic!("expected provisioning, got {dispatch:?}"),
    }
}

#[tokio::test]
async fn ignores_pods_on_other_nodes() {
    let _trace = init_tracing();
    let (controller, filter, metrics) = mk_controller(&cluster(), FakeNetns::default());

    let dispatch = controller
        .apply_pod(mk_pod("web", "node-1", "web"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::OtherNode));
    assert!(filter.0.lock().is_empty());
    assert_eq!(metrics.snapshot(), [0; 6]);
}

#[tokio::test]
async fn leaves_unmanaged_pods_alone() {
    let _trace = init_tracing();
    let (controller, filter, metrics) = mk_controller(&cluster(), FakeNetns::default());

    let dispatch = controller
        .apply_pod(mk_pod("db", NODE, "db"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Unmanaged));
    assert!(!controller.is_provisioned("uid-db"));
    assert!(filter.0.lock().is_empty());
    assert_eq!(metrics.snapshot(), [1, 1, 0, 0, 0, 0]);
}

#[tokio::test]
async fn waits_for_endpoints() {
    let _trace = init_tracing();
    let cluster = cluster();
    cluster.endpoints.lock().retain(|ep| ep.spec.pod != "web");
    let (controller, _, _) = mk_controller(&cluster, FakeNetns::default());

    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::NoEndpoints));
    assert!(!controller.is_provisioned("uid-web"));

    cluster
        .endpoints
        .lock()
        .push(mk_endpoint("web", "web", "10.0.0.1"));
    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    provisioned(dispatch).await;
    assert!(controller.is_provisioned("uid-web"));
}

#[tokio::test]
async fn provisions_local_pods_once() {
    let _trace = init_tracing();
    let (controller, filter, metrics) = mk_controller(&cluster(), FakeNetns::default());

    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    assert!(controller.is_provisioned("uid-web"));
    provisioned(dispatch).await;

    let installed = filter.0.lock().clone();
    assert_eq!(
        installed[..3],
        [
            "INPUT -j DANM_INGRESS_V4".to_string(),
            "DANM_INGRESS_V4 -p tcp --dport 5432 -s 10.0.0.2/32 -j ACCEPT".to_string(),
            "DANM_INGRESS_V4 -j RETURN".to_string(),
        ]
    );
    assert_eq!(installed.len(), 3 + 6);
    // Both families receive the baseline.
    assert_eq!(metrics.snapshot(), [1, 0, 1, 0, 14, 0]);

    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::AlreadyProvisioned));
    assert_eq!(metrics.snapshot()[0], 1);
}

#[tokio::test]
async fn deleted_pods_are_forgotten() {
    let _trace = init_tracing();
    let (controller, _, _) = mk_controller(&cluster(), FakeNetns::default());

    let pod = mk_pod("web", NODE, "web");
    provisioned(controller.apply_pod(pod.clone()).await.unwrap()).await;
    assert!(controller.is_provisioned("uid-web"));

    controller.delete_pod(&pod);
    assert!(!controller.is_provisioned("uid-web"));
}

#[tokio::test]
async fn policy_changes_reevaluate_the_namespace() {
    let _trace = init_tracing();
    let cluster = cluster();
    let (controller, _, metrics) = mk_controller(&cluster, FakeNetns::default());

    provisioned(
        controller
            .apply_pod(mk_pod("web", NODE, "web"))
            .await
            .unwrap(),
    )
    .await;

    let mut other = web_policy();
    other.metadata.namespace = Some("ns-1".to_string());
    controller.apply_policy(&other);
    assert!(controller.is_provisioned("uid-web"));

    controller.apply_policy(&web_policy());
    assert!(!controller.is_provisioned("uid-web"));

    cluster.policies.lock().clear();
    controller.delete_policy(&web_policy());
    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Unmanaged));
    assert_eq!(metrics.snapshot()[..2], [2, 1]);
}

#[tokio::test]
async fn policy_changes_during_evaluation_are_not_lost() {
    let _trace = init_tracing();
    let cluster = cluster();
    let gate = Arc::new(Notify::new());
    *cluster.gate.lock() = Some(gate.clone());
    let (controller, filter, metrics) = mk_controller(&cluster, FakeNetns::default());
    let controller = Arc::new(controller);

    let apply = tokio::spawn({
        let controller = controller.clone();
        async move { controller.apply_pod(mk_pod("web", NODE, "web")).await }
    });

    // The policy is deleted after it was listed but before the evaluation completes.
    cluster.entered.notified().await;
    cluster.policies.lock().clear();
    controller.delete_policy(&web_policy());
    *cluster.gate.lock() = None;
    gate.notify_one();

    let dispatch = apply.await.unwrap().unwrap();
    assert!(matches!(dispatch, Dispatch::Unmanaged), "{dispatch:?}");
    assert!(!controller.is_provisioned("uid-web"));
    assert!(filter.0.lock().is_empty());
    assert_eq!(metrics.snapshot()[..3], [2, 1, 0]);

    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    assert!(matches!(dispatch, Dispatch::Unmanaged), "{dispatch:?}");
}

#[tokio::test]
async fn listing_failures_leave_the_pod_unprovisioned() {
    let _trace = init_tracing();
    let cluster = cluster();
    *cluster.fail_endpoints.lock() = true;
    let (controller, filter, _) = mk_controller(&cluster, FakeNetns::default());

    controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .expect_err("listing must fail");
    assert!(!controller.is_provisioned("uid-web"));
    assert!(filter.0.lock().is_empty());

    *cluster.fail_endpoints.lock() = false;
    let dispatch = controller
        .apply_pod(mk_pod("web", NODE, "web"))
        .await
        .unwrap();
    provisioned(dispatch).await;
    assert!(controller.is_provisioned("uid-web"));
}

#[tokio::test]
async fn failed_provisioning_is_recorded() {
    let _trace = init_tracing();
    let (controller, filter, metrics) = mk_controller(&cluster(), FakeNetns { missing: true });

    provisioned(
        controller
            .apply_pod(mk_pod("web", NODE, "web"))
            .await
            .unwrap(),
    )
    .await;
    assert!(filter.0.lock().is_empty());
    assert!(controller.is_provisioned("uid-web"));
    assert_eq!(metrics.snapshot(), [1, 0, 0, 1, 0, 0]);
}
