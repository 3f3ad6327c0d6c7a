//! In-memory cluster implementing both the API client and the parent cache
//!
//! The API view and the cache view are kept separately so tests can make the
//! cache lag behind the API server, the way an informer does.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{PodTemplateSpec, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use kube::ResourceExt;
use parking_lot::Mutex;

use expose_controller::cache::ParentCache;
use expose_controller::client::ClusterClient;
use expose_controller::Error;

type Name = (String, String);

fn name_of(namespace: &str, name: &str) -> Name {
    (namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube {
        source: kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("fake cluster: {reason}"),
            reason: reason.to_string(),
            code,
        }),
    }
}

/// A Deployment whose pod template carries `app: <name>`
pub fn deployment(namespace: &str, name: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                    ..Default::default()
                }),
                spec: None,
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Default)]
struct State {
    deployments: BTreeMap<Name, Deployment>,
    cache: BTreeMap<Name, Arc<Deployment>>,
    services: BTreeMap<Name, Service>,
    ingresses: BTreeMap<Name, Ingress>,
    /// Remaining injected failures per operation name
    failures: HashMap<&'static str, u32>,
    /// Mutating calls in order, e.g. "create_service:ns1/web"
    calls: Vec<String>,
}

impl State {
    fn take_failure(&mut self, op: &'static str) -> bool {
        match self.failures.get_mut(op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Fake API server plus cache
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a Deployment; the cache sees it immediately
    pub fn add_deployment(&self, namespace: &str, name: &str) -> Deployment {
        let obj = deployment(namespace, name);
        let mut state = self.state.lock();
        state.deployments.insert(name_of(namespace, name), obj.clone());
        state.cache.insert(name_of(namespace, name), Arc::new(obj.clone()));
        obj
    }

    /// Delete a Deployment; the cache sees it immediately
    pub fn delete_deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        let mut state = self.state.lock();
        state.cache.remove(&name_of(namespace, name));
        state.deployments.remove(&name_of(namespace, name))
    }

    /// Delete a Deployment from the API server only; the cache keeps a stale copy
    pub fn delete_deployment_behind_cache(&self, namespace: &str, name: &str) {
        self.state.lock().deployments.remove(&name_of(namespace, name));
    }

    /// Create a Deployment on the API server only; the cache has not seen it yet
    pub fn add_deployment_ahead_of_cache(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .deployments
            .insert(name_of(namespace, name), deployment(namespace, name));
    }

    /// Bring the cache in line with the API server
    pub fn sync_cache(&self) {
        let mut state = self.state.lock();
        state.cache = state
            .deployments
            .iter()
            .map(|(k, v)| (k.clone(), Arc::new(v.clone())))
            .collect();
    }

    /// Make the next `n` calls of `op` fail with 503
    pub fn fail_next(&self, op: &'static str, n: u32) {
        self.state.lock().failures.insert(op, n);
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state.lock().services.get(&name_of(namespace, name)).cloned()
    }

    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Ingress> {
        self.state.lock().ingresses.get(&name_of(namespace, name)).cloned()
    }

    pub fn service_names(&self) -> Vec<Name> {
        self.state.lock().services.keys().cloned().collect()
    }

    pub fn ingress_names(&self) -> Vec<Name> {
        self.state.lock().ingresses.keys().cloned().collect()
    }

    pub fn deployment_names(&self) -> Vec<Name> {
        self.state.lock().deployments.keys().cloned().collect()
    }

    /// Mutating calls so far, oldest first
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// True when every Deployment has both dependents and nothing else does
    pub fn converged(&self) -> bool {
        let state = self.state.lock();
        let deployments: Vec<_> = state.deployments.keys().collect();
        let services: Vec<_> = state.services.keys().collect();
        let ingresses: Vec<_> = state.ingresses.keys().collect();
        deployments == services && deployments == ingresses
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let mut state = self.state.lock();
        if state.take_failure("get_deployment") {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        Ok(state.deployments.get(&name_of(namespace, name)).cloned())
    }

    async fn create_service(&self, service: &Service) -> Result<Service, Error> {
        let key = name_of(&service.namespace().unwrap_or_default(), &service.name_any());
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("create_service:{}/{}", key.0, key.1));
        if state.take_failure("create_service") {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        if state.services.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.services.insert(key, service.clone());
        Ok(service.clone())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_service:{namespace}/{name}"));
        if state.take_failure("delete_service") {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        match state.services.remove(&name_of(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound")),
        }
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<Ingress, Error> {
        let key = name_of(&ingress.namespace().unwrap_or_default(), &ingress.name_any());
        let mut state = self.state.lock();
        state
            .calls
            .push(format!("create_ingress:{}/{}", key.0, key.1));
        if state.take_failure("create_ingress") {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        if state.ingresses.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists"));
        }
        state.ingresses.insert(key, ingress.clone());
        Ok(ingress.clone())
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.calls.push(format!("delete_ingress:{namespace}/{name}"));
        if state.take_failure("delete_ingress") {
            return Err(api_error(503, "ServiceUnavailable"));
        }
        match state.ingresses.remove(&name_of(namespace, name)) {
            Some(_) => Ok(()),
            None => Err(api_error(404, "NotFound")),
        }
    }
}

impl ParentCache for FakeCluster {
    fn get(&self, namespace: &str, name: &str) -> Option<Arc<Deployment>> {
        self.state.lock().cache.get(&name_of(namespace, name)).cloned()
    }

    fn has_synced(&self) -> bool {
        true
    }
}
