use crate::k8s::{Api, Client, ListParams, NetworkEndpoint, NetworkPolicy};
use anyhow::Result;

/// Lists the resources a workload's rules are compiled from.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    async fn list_policies(&self, namespace: &str) -> Result<Vec<NetworkPolicy>>;

    async fn list_endpoints(&self, namespace: &str) -> Result<Vec<NetworkEndpoint>>;
}

#[async_trait::async_trait]
impl ClusterApi for Client {
    async fn list_policies(&self, namespace: &str) -> Result<Vec<NetworkPolicy>> {
        let list = Api::<NetworkPolicy>::namespaced(self.clone(), namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn list_endpoints(&self, namespace: &str) -> Result<Vec<NetworkEndpoint>> {
        let list = Api::<NetworkEndpoint>::namespaced(self.clone(), namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }
}
