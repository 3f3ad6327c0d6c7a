//! Cluster API access for the reconciler
//!
//! [`ClusterClient`] is the seam between reconciliation logic and the API
//! server. The production implementation talks to Kubernetes through
//! kube-rs; tests substitute a mock or an in-memory fake.
//!
//! Calls return the raw API outcome. Interpreting NotFound and
//! AlreadyExists as success is the reconciler's job, see
//! [`Error::is_not_found`] and [`Error::is_already_exists`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::{Error, FIELD_MANAGER};

/// Namespaced CRUD for the parent and its two dependents
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Authoritative read of a Deployment; `Ok(None)` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Service; fails with AlreadyExists if the name is taken
    async fn create_service(&self, service: &Service) -> Result<Service, Error>;

    /// Delete a Service; fails with NotFound if it does not exist
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Create an Ingress; fails with AlreadyExists if the name is taken
    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, Error>;

    /// Delete an Ingress; fails with NotFound if it does not exist
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a new KubeClusterClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let namespace = service.namespace().unwrap_or_default();
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&Self::post_params(), service).await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, Error> {
        let namespace = ingress.namespace().unwrap_or_default();
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&Self::post_params(), ingress).await?)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
