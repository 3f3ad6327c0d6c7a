//! Builders for the dependents of a parent Deployment
//!
//! Both dependents share the parent's name and namespace, so their existence
//! can always be checked by name without tracking references. The builders
//! are pure; creating the objects is the reconciler's job.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::{Error, HTTP_PORT, HTTP_PORT_NAME, LABEL_MANAGED_BY, MANAGED_BY_VALUE};

/// Annotation asking ingress-nginx to rewrite the matched prefix
pub const REWRITE_TARGET_ANNOTATION: &str = "nginx.ingress.kubernetes.io/rewrite-target";

/// Path type used for the single route rule
const PATH_TYPE_PREFIX: &str = "Prefix";

/// Settings applied to every created route
#[derive(Clone, Debug)]
pub struct RouteOptions {
    /// `spec.ingressClassName`; `None` leaves the cluster default in charge
    pub ingress_class: Option<String>,
    /// Value of the rewrite-target annotation
    pub rewrite_target: String,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            ingress_class: None,
            rewrite_target: "/".to_string(),
        }
    }
}

/// Labels on the Deployment's pod template, which the Service selects on
pub fn template_labels(deployment: &Deployment) -> Option<BTreeMap<String, String>> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|meta| meta.labels.clone())
}

fn dependent_meta(name: String, namespace: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(namespace),
        labels: Some(BTreeMap::from([(
            LABEL_MANAGED_BY.to_string(),
            MANAGED_BY_VALUE.to_string(),
        )])),
        ..Default::default()
    }
}

/// Service exposing the Deployment's pods on port 80
///
/// The port has no target port, so it forwards to container port 80.
pub fn build_service(deployment: &Deployment) -> Result<Service, Error> {
    let name = deployment
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal("build_service", "deployment has no name"))?;
    let namespace = deployment.namespace().ok_or_else(|| {
        Error::internal("build_service", format!("deployment {name} has no namespace"))
    })?;

    Ok(Service {
        metadata: dependent_meta(name, namespace),
        spec: Some(ServiceSpec {
            selector: template_labels(deployment),
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Port the route should target on `service`: its named http port, else 80
fn backend_port(service: &Service) -> i32 {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.name.as_deref() == Some(HTTP_PORT_NAME))
        })
        .map(|p| p.port)
        .unwrap_or(HTTP_PORT)
}

/// Ingress routing `/<service name>` (prefix match) to `service`
pub fn build_ingress(service: &Service, options: &RouteOptions) -> Result<Ingress, Error> {
    let name = service
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::internal("build_ingress", "service has no name"))?;
    let namespace = service.namespace().ok_or_else(|| {
        Error::internal("build_ingress", format!("service {name} has no namespace"))
    })?;

    let mut metadata = dependent_meta(name.clone(), namespace);
    metadata.annotations = Some(BTreeMap::from([(
        REWRITE_TARGET_ANNOTATION.to_string(),
        options.rewrite_target.clone(),
    )]));

    let path = HTTPIngressPath {
        path: Some(format!("/{name}")),
        path_type: PATH_TYPE_PREFIX.to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                port: Some(ServiceBackendPort {
                    number: Some(backend_port(service)),
                    name: None,
                }),
                name,
            }),
            resource: None,
        },
    };

    Ok(Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: options.ingress_class.clone(),
            rules: Some(vec![IngressRule {
                host: None,
                http: Some(HTTPIngressRuleValue { paths: vec![path] }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
