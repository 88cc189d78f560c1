//! Admission webhook server.
//!
//! In webhook mode the process answers validating admission reviews for
//! the four watched kinds and installs no reconcilers. Handlers are
//! request-scoped and carry no concurrency bound; TLS termination is
//! delegated to the pod's ingress path.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::ManagerError;
use crate::metrics::Metrics;
use crate::scheme::Scheme;

/// Shared state for all admission handlers.
#[derive(Clone)]
pub struct WebhookState {
    /// Sealed type registry; unknown kinds are denied
    pub scheme: Arc<Scheme>,
    /// Process metrics
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for WebhookState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookState").finish_non_exhaustive()
    }
}

/// Bind the webhook listener. Part of registration: a bind failure aborts
/// startup before any handler is installed.
pub async fn bind(port: u16) -> Result<TcpListener, ManagerError> {
    TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ManagerError::registration("webhook-server", format!("failed to bind port {port}: {e}")))
}

/// The admission router with all four handlers installed.
pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate-metalcluster", post(validate_metalcluster))
        .route("/validate-metalmachine", post(validate_metalmachine))
        .route("/validate-metalmachinetemplate", post(validate_metalmachinetemplate))
        .route("/validate-serverbinding", post(validate_serverbinding))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve admission reviews until the shared shutdown signal fires.
pub async fn serve(
    listener: TcpListener,
    state: WebhookState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "Webhook server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stopping| *stopping).await;
        })
        .await
}

async fn validate_metalcluster(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    respond(&state, "MetalCluster", review, check_cluster)
}

async fn validate_metalmachine(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    respond(&state, "MetalMachine", review, check_machine)
}

async fn validate_metalmachinetemplate(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    respond(&state, "MetalMachineTemplate", review, check_machine_template)
}

async fn validate_serverbinding(
    State(state): State<WebhookState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<AdmissionReview<DynamicObject>> {
    respond(&state, "ServerBinding", review, check_server_binding)
}

/// Shared review plumbing: unwrap the request, gate on the scheme, run the
/// kind-specific check, count the verdict.
fn respond(
    state: &WebhookState,
    kind: &'static str,
    review: AdmissionReview<DynamicObject>,
    check: fn(&AdmissionRequest<DynamicObject>) -> Result<(), String>,
) -> Json<AdmissionReview<DynamicObject>> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(e) => {
            return Json(AdmissionResponse::invalid(e.to_string()).into_review());
        }
    };

    let mut response = AdmissionResponse::from(&req);

    if !state.scheme.contains(kind) || req.kind.kind != kind {
        response = response.deny(format!("kind {} is not served by this webhook", req.kind.kind));
    } else if req.operation == Operation::Delete {
        // Deletions carry no new object to validate.
    } else if let Err(reason) = check(&req) {
        response = response.deny(reason);
    }

    debug!(
        webhook = kind,
        name = %req.name,
        allowed = response.allowed,
        "Admission review answered"
    );
    state
        .metrics
        .admission_reviews
        .with_label_values(&[kind, if response.allowed { "true" } else { "false" }])
        .inc();

    Json(response.into_review())
}

fn spec_of<T: serde::de::DeserializeOwned>(
    req: &AdmissionRequest<DynamicObject>,
) -> Result<T, String> {
    let obj = req
        .object
        .as_ref()
        .ok_or_else(|| "admission request has no object".to_string())?;
    let spec = obj
        .data
        .get("spec")
        .ok_or_else(|| "object has no spec".to_string())?;
    serde_json::from_value(spec.clone()).map_err(|e| format!("malformed spec: {e}"))
}

fn check_cluster(req: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
    let spec: crds::MetalClusterSpec = spec_of(req)?;
    if !spec.control_plane_endpoint.is_valid() {
        return Err("control plane endpoint needs a host and a nonzero port".to_string());
    }
    Ok(())
}

fn check_machine(req: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
    let spec: crds::MetalMachineSpec = spec_of(req)?;
    if !spec.has_server_source() {
        return Err("machine must name a server or a server class".to_string());
    }
    Ok(())
}

fn check_machine_template(req: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
    let spec: crds::MetalMachineTemplateSpec = spec_of(req)?;
    if !spec.template.spec.has_server_source() {
        return Err("template machines must name a server or a server class".to_string());
    }
    Ok(())
}

fn check_server_binding(req: &AdmissionRequest<DynamicObject>) -> Result<(), String> {
    let spec: crds::ServerBindingSpec = spec_of(req)?;
    if spec.metal_machine_ref.name.is_empty() {
        return Err("binding must name a machine".to_string());
    }

    // Bindings pin a server to a machine for the machine's lifetime.
    if req.operation == Operation::Update {
        if let Some(old) = &req.old_object {
            let old_spec: crds::ServerBindingSpec = old
                .data
                .get("spec")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| format!("malformed old spec: {e}"))?
                .ok_or_else(|| "old object has no spec".to_string())?;
            if old_spec.metal_machine_ref != spec.metal_machine_ref {
                return Err("machine reference is immutable".to_string());
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{register_infrastructure_types, register_metal_types, SchemeBuilder};
    use serde_json::{json, Value};

    fn test_state() -> WebhookState {
        WebhookState {
            scheme: register_metal_types(register_infrastructure_types(SchemeBuilder::new()))
                .build(),
            metrics: Arc::new(Metrics::new().unwrap()),
        }
    }

    fn review(kind: &str, operation: &str, object: Value, old_object: Value) -> AdmissionReview<DynamicObject> {
        let (group, version) = match kind {
            "ServerBinding" => ("metal.metalstack.io", "v1alpha1"),
            _ => ("infrastructure.metalstack.io", "v1alpha3"),
        };
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "test-uid",
                "kind": { "group": group, "version": version, "kind": kind },
                "resource": { "group": group, "version": version, "resource": "tests" },
                "operation": operation,
                "userInfo": {},
                "name": "test-object",
                "namespace": "default",
                "object": object,
                "oldObject": old_object,
            }
        }))
        .unwrap()
    }

    fn object(kind: &str, spec: Value) -> Value {
        let api_version = match kind {
            "ServerBinding" => "metal.metalstack.io/v1alpha1",
            _ => "infrastructure.metalstack.io/v1alpha3",
        };
        json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": { "name": "test-object", "namespace": "default" },
            "spec": spec,
        })
    }

    fn allowed(review: AdmissionReview<DynamicObject>) -> bool {
        review.response.unwrap().allowed
    }

    #[tokio::test]
    async fn valid_cluster_is_allowed() {
        let spec = json!({ "controlPlaneEndpoint": { "host": "cp.example.com", "port": 6443 } });
        let Json(out) = validate_metalcluster(
            State(test_state()),
            Json(review("MetalCluster", "CREATE", object("MetalCluster", spec), Value::Null)),
        )
        .await;
        assert!(allowed(out));
    }

    #[tokio::test]
    async fn cluster_without_endpoint_is_denied() {
        let spec = json!({ "controlPlaneEndpoint": { "host": "", "port": 0 } });
        let Json(out) = validate_metalcluster(
            State(test_state()),
            Json(review("MetalCluster", "CREATE", object("MetalCluster", spec), Value::Null)),
        )
        .await;
        assert!(!allowed(out));
    }

    #[tokio::test]
    async fn machine_without_server_source_is_denied() {
        let Json(out) = validate_metalmachine(
            State(test_state()),
            Json(review("MetalMachine", "CREATE", object("MetalMachine", json!({})), Value::Null)),
        )
        .await;
        assert!(!allowed(out));
    }

    #[tokio::test]
    async fn machine_with_server_class_is_allowed() {
        let spec = json!({
            "serverClassRef": { "apiGroup": "metal.metalstack.io", "kind": "ServerClass", "name": "default" }
        });
        let Json(out) = validate_metalmachine(
            State(test_state()),
            Json(review("MetalMachine", "CREATE", object("MetalMachine", spec), Value::Null)),
        )
        .await;
        assert!(allowed(out));
    }

    #[tokio::test]
    async fn binding_machine_ref_is_immutable() {
        let old_spec = json!({
            "metalMachineRef": { "apiGroup": "infrastructure.metalstack.io", "kind": "MetalMachine", "name": "machine-a" }
        });
        let new_spec = json!({
            "metalMachineRef": { "apiGroup": "infrastructure.metalstack.io", "kind": "MetalMachine", "name": "machine-b" }
        });
        let Json(out) = validate_serverbinding(
            State(test_state()),
            Json(review(
                "ServerBinding",
                "UPDATE",
                object("ServerBinding", new_spec),
                object("ServerBinding", old_spec),
            )),
        )
        .await;
        assert!(!allowed(out));
    }

    #[tokio::test]
    async fn binding_update_keeping_machine_ref_is_allowed() {
        let spec = json!({
            "metalMachineRef": { "apiGroup": "infrastructure.metalstack.io", "kind": "MetalMachine", "name": "machine-a" }
        });
        let Json(out) = validate_serverbinding(
            State(test_state()),
            Json(review(
                "ServerBinding",
                "UPDATE",
                object("ServerBinding", spec.clone()),
                object("ServerBinding", spec),
            )),
        )
        .await;
        assert!(allowed(out));
    }

    #[tokio::test]
    async fn unexpected_kind_is_denied() {
        // A Server object sent to the cluster handler must not pass.
        let Json(out) = validate_metalcluster(
            State(test_state()),
            Json(review("Server", "CREATE", object("Server", json!({})), Value::Null)),
        )
        .await;
        assert!(!allowed(out));
    }

    #[tokio::test]
    async fn delete_reviews_are_allowed_without_object() {
        let Json(out) = validate_metalmachine(
            State(test_state()),
            Json(review("MetalMachine", "DELETE", Value::Null, Value::Null)),
        )
        .await;
        assert!(allowed(out));
    }

    #[tokio::test]
    async fn server_answers_reviews_without_leadership() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Every replica behind the webhook Service must answer admission
        // requests; serving is independent of the leader lease.
        let listener = bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, test_state(), shutdown_rx));

        let spec = json!({ "controlPlaneEndpoint": { "host": "cp.example.com", "port": 6443 } });
        let body = serde_json::to_vec(&review(
            "MetalCluster",
            "CREATE",
            object("MetalCluster", spec),
            Value::Null,
        ))
        .unwrap();

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "POST /validate-metalcluster HTTP/1.1\r\nHost: {addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
        assert!(text.contains("\"allowed\":true"), "review denied: {text}");

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn server_stops_promptly_on_shutdown() {
        let listener = bind(0).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = tokio::spawn(serve(listener, test_state(), shutdown_rx));
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .expect("webhook server did not stop on shutdown")
            .unwrap()
            .unwrap();
    }
}
