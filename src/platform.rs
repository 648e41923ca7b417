//! Kubernetes adapter: creates, watches, lists, and deletes the one-pod-per-
//! session browser workloads.
//!
//! Each workload is a pod named after its session, joined to the hub's
//! headless service so it is reachable as `http://<sessionID>.<svc>:<port>`.
//! The pod carries a `browser` container and a `seleniferous` sidecar that
//! fronts the browser's WebDriver port; a `video-recorder` container is added
//! when the session asks for video.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, ExecAction, Lifecycle, LifecycleHandler,
    LocalObjectReference, Pod, PodSpec, SecurityContext,
};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use serde::Serialize;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};

use crate::browser::BrowserSpec;
use crate::capabilities::Capabilities;
use crate::errors::{PlatformError, PodWaitError};

pub const TYPE_LABEL: &str = "selenosis.app.type";
pub const TYPE_BROWSER: &str = "browser";

const BROWSER_CONTAINER: &str = "browser";
const PROXY_CONTAINER: &str = "seleniferous";
const VIDEO_CONTAINER: &str = "video-recorder";

/// WebDriver port of the browser container.
pub const BROWSER_PORT: u16 = 4444;
/// VNC server port of the browser container.
pub const VNC_PORT: u16 = 5900;

/// Env names understood by the browser images. Capabilities fold into these.
mod caps_env {
    pub const SCREEN_RESOLUTION: &str = "SCREEN_RESOLUTION";
    pub const ENABLE_VNC: &str = "ENABLE_VNC";
    pub const TIME_ZONE: &str = "TZ";
    pub const ENABLE_VIDEO: &str = "ENABLE_VIDEO";
    pub const VIDEO_NAME: &str = "VIDEO_NAME";
    pub const VIDEO_SIZE: &str = "VIDEO_SIZE";
    pub const FRAME_RATE: &str = "FRAME_RATE";
    pub const CODEC: &str = "CODEC";

    pub const VIDEO_GROUP: [&str; 5] = [ENABLE_VIDEO, VIDEO_NAME, VIDEO_SIZE, FRAME_RATE, CODEC];
}

const CAPABILITIES_ANNOTATION: &str = "capabilities";
const TEST_NAME_ANNOTATION: &str = "testName";

/// Input to [`Platform::create`].
#[derive(Debug, Clone, Default)]
pub struct ServiceSpec {
    pub session_id: String,
    pub requested_capabilities: Capabilities,
    pub template: BrowserSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServiceStatus {
    Pending,
    Running,
    Unknown,
}

/// A provisioned, reachable session workload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub session_id: String,
    pub url: String,
    pub status: ServiceStatus,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Snapshot of every label-matching workload in the namespace.
#[derive(Debug, Clone, Default)]
pub struct State {
    pub services: Vec<Service>,
}

pub struct PlatformOptions {
    pub namespace: String,
    pub service: String,
    pub service_port: u16,
    pub proxy_image: String,
    pub video_image: String,
    pub image_pull_secret: String,
    pub wait_timeout: Duration,
    pub retry_count: u32,
}

type EventStream = BoxStream<'static, Result<WatchEvent<Pod>, kube::Error>>;

pub struct Platform {
    pods: Api<Pod>,
    ns: String,
    svc: String,
    svc_port: u16,
    factory: PodFactory,
    wait_timeout: Duration,
    retry_count: u32,
    probe: reqwest::Client,
}

impl Platform {
    pub fn new(client: kube::Client, probe: reqwest::Client, opts: PlatformOptions) -> Self {
        Self {
            pods: Api::namespaced(client, &opts.namespace),
            ns: opts.namespace,
            svc: opts.service.clone(),
            svc_port: opts.service_port,
            factory: PodFactory {
                svc: opts.service,
                svc_port: opts.service_port,
                proxy_image: opts.proxy_image,
                video_image: opts.video_image,
                image_pull_secret: opts.image_pull_secret,
            },
            wait_timeout: opts.wait_timeout,
            retry_count: opts.retry_count,
            probe,
        }
    }

    /// Create the session pod and block until it is ready to serve WebDriver
    /// traffic. On any failure the partially created pod is deleted
    /// best-effort before the error is propagated.
    pub async fn create(&self, spec: ServiceSpec) -> Result<Service, PlatformError> {
        let spec = apply_capabilities(spec);
        let session_id = spec.session_id.clone();
        let pod = self.factory.build(&spec);

        // The watch is opened before the create call so the first phase
        // transition cannot be missed.
        let stream = self
            .watch_pod(&session_id)
            .await
            .map_err(PlatformError::WatchFailed)?;

        info!(session_id = %session_id, namespace = %self.ns, image = %spec.template.image, "creating pod");
        self.pods
            .create(&PostParams::default(), &pod)
            .await
            .map_err(PlatformError::CreateFailed)?;

        if let Err(err) = self.await_ready(&session_id, stream).await {
            self.best_effort_delete(&session_id).await;
            return Err(PlatformError::NotReady(err));
        }

        let url = pod_url(&session_id, &self.svc, self.svc_port);
        if let Err(err) = self.wait_for_service(&url).await {
            self.best_effort_delete(&session_id).await;
            return Err(err);
        }

        info!(session_id = %session_id, url = %url, "pod is ready");
        Ok(Service {
            session_id,
            url,
            status: ServiceStatus::Running,
            started: Utc::now(),
            labels: pod.metadata.labels.unwrap_or_default(),
        })
    }

    /// Delete the session pod by name. A missing pod is reported as
    /// [`PlatformError::PodNotFound`] so callers can decide whether that
    /// counts as failure.
    pub async fn delete(&self, session_id: &str) -> Result<(), PlatformError> {
        match self.pods.delete(session_id, &DeleteParams::default()).await {
            Ok(_) => {
                info!(session_id = %session_id, namespace = %self.ns, "pod deleted");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(PlatformError::PodNotFound(session_id.to_string()))
            }
            Err(err) => Err(PlatformError::DeleteFailed(err)),
        }
    }

    /// List every browser pod in the namespace.
    pub async fn list(&self) -> Result<State, PlatformError> {
        let lp = ListParams::default().labels(&format!("{TYPE_LABEL}={TYPE_BROWSER}"));
        let pods = self.pods.list(&lp).await.map_err(PlatformError::ListFailed)?;
        let services = pods
            .items
            .iter()
            .filter_map(|pod| self.service_from_pod(pod))
            .collect();
        Ok(State { services })
    }

    /// Lazy watch stream over every browser pod, for the reconciler.
    pub async fn watch(&self) -> Result<EventStream, PlatformError> {
        let wp = WatchParams::default()
            .labels(&format!("{TYPE_LABEL}={TYPE_BROWSER}"))
            .timeout(watch_timeout(self.wait_timeout))
            .disable_bookmarks();
        let stream = self
            .pods
            .watch(&wp, "0")
            .await
            .map_err(PlatformError::WatchFailed)?;
        Ok(stream.boxed())
    }

    /// Byte stream of the browser container's stdout/stderr.
    pub async fn logs(
        &self,
        session_id: &str,
        follow: bool,
    ) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static, PlatformError> {
        let lp = LogParams {
            container: Some(BROWSER_CONTAINER.to_string()),
            follow,
            ..LogParams::default()
        };
        let reader = self
            .pods
            .log_stream(session_id, &lp)
            .await
            .map_err(PlatformError::LogsFailed)?;
        Ok(ReaderStream::new(Box::pin(reader).compat()))
    }

    /// Map a pod object to its service view. Pods without a name (never
    /// expected from the API server) are skipped.
    pub fn service_from_pod(&self, pod: &Pod) -> Option<Service> {
        let name = pod.metadata.name.clone()?;
        let status = service_status(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
        let started = pod
            .status
            .as_ref()
            .and_then(|s| s.start_time.as_ref())
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);
        Some(Service {
            url: pod_url(&name, &self.svc, self.svc_port),
            session_id: name,
            status,
            started,
            labels: pod.metadata.labels.clone().unwrap_or_default(),
        })
    }

    async fn watch_pod(&self, name: &str) -> Result<EventStream, kube::Error> {
        let wp = WatchParams::default()
            .fields(&format!("metadata.name={name}"))
            .timeout(watch_timeout(self.wait_timeout))
            .disable_bookmarks();
        Ok(self.pods.watch(&wp, "0").await?.boxed())
    }

    /// Consume name-scoped watch events until the pod is Running with all
    /// containers ready. The total budget is `retry_count × wait_timeout`;
    /// server-side watch expiry re-establishes the stream within it.
    async fn await_ready(
        &self,
        session_id: &str,
        mut stream: EventStream,
    ) -> Result<(), PodWaitError> {
        let budget = self.wait_timeout * self.retry_count.max(1);
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            match tokio::time::timeout_at(deadline, stream.try_next()).await {
                Err(_) => return Err(PodWaitError::Timeout),
                Ok(Ok(Some(event))) => match check_watch_event(&event)? {
                    Readiness::Ready => return Ok(()),
                    Readiness::Wait => {}
                },
                Ok(Ok(None)) => {
                    stream = self
                        .watch_pod(session_id)
                        .await
                        .map_err(|err| PodWaitError::Watch(err.to_string()))?;
                }
                Ok(Err(err)) => {
                    warn!(session_id = %session_id, error = %err, "pod watch interrupted, re-establishing");
                    stream = self
                        .watch_pod(session_id)
                        .await
                        .map_err(|err| PodWaitError::Watch(err.to_string()))?;
                }
            }
        }
    }

    /// Bridge the gap between "pod Running" and "WebDriver reachable": the
    /// sidecar needs a moment to bind its port after the kubelet marks the
    /// containers ready.
    async fn wait_for_service(&self, url: &str) -> Result<(), PlatformError> {
        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        loop {
            match self.probe.get(url).send().await {
                Ok(_) => return Ok(()),
                Err(err) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(PlatformError::ServiceUnreachable(err.to_string()));
                    }
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
            }
        }
    }

    async fn best_effort_delete(&self, session_id: &str) {
        match self.delete(session_id).await {
            Ok(()) | Err(PlatformError::PodNotFound(_)) => {}
            Err(err) => {
                warn!(session_id = %session_id, error = %err, "failed to clean up pod")
            }
        }
    }
}

fn watch_timeout(wait_timeout: Duration) -> u32 {
    wait_timeout.as_secs().clamp(1, 290) as u32
}

pub(crate) enum Readiness {
    Wait,
    Ready,
}

/// Interpret one watch event for a pod we are waiting on.
pub(crate) fn check_watch_event(event: &WatchEvent<Pod>) -> Result<Readiness, PodWaitError> {
    match event {
        WatchEvent::Added(pod) | WatchEvent::Modified(pod) => check_pod_status(pod),
        WatchEvent::Deleted(_) => Err(PodWaitError::DeletedBeforeReady),
        WatchEvent::Bookmark(_) => Err(PodWaitError::UnknownEventType("BOOKMARK".to_string())),
        WatchEvent::Error(resp) => Err(PodWaitError::Watch(resp.reason.clone())),
    }
}

fn check_pod_status(pod: &Pod) -> Result<Readiness, PodWaitError> {
    let status = pod.status.as_ref();
    match status.and_then(|s| s.phase.as_deref()).unwrap_or_default() {
        "Running" => {
            let all_ready = status
                .and_then(|s| s.container_statuses.as_ref())
                .map(|containers| containers.iter().all(|c| c.ready))
                .unwrap_or(true);
            Ok(if all_ready {
                Readiness::Ready
            } else {
                Readiness::Wait
            })
        }
        phase @ ("Succeeded" | "Failed") => Err(PodWaitError::ExitedEarly(phase.to_string())),
        "Unknown" => Err(PodWaitError::StateUnknown),
        "" => Err(PodWaitError::UnknownStatus),
        // Pending and transitional phases: keep waiting.
        _ => Ok(Readiness::Wait),
    }
}

pub(crate) fn service_status(phase: Option<&str>) -> ServiceStatus {
    match phase {
        Some("Running") => ServiceStatus::Running,
        Some("Pending") => ServiceStatus::Pending,
        _ => ServiceStatus::Unknown,
    }
}

pub(crate) fn pod_url(name: &str, svc: &str, port: u16) -> String {
    format!("http://{name}.{svc}:{port}")
}

/// Fold requested capabilities into the template: each recognised capability
/// replaces any template env of the same name and is recorded in the
/// `capabilities` pod annotation. The video group only propagates when
/// `enableVideo` is set; a template cannot switch recording on by itself.
pub(crate) fn apply_capabilities(mut spec: ServiceSpec) -> ServiceSpec {
    let caps = spec.requested_capabilities.clone();
    let mut pairs: Vec<(&str, String)> = Vec::new();

    if !caps.screen_resolution.is_empty() {
        pairs.push((caps_env::SCREEN_RESOLUTION, caps.screen_resolution.clone()));
    }
    if caps.vnc {
        pairs.push((caps_env::ENABLE_VNC, "true".to_string()));
    }
    if !caps.time_zone.is_empty() {
        pairs.push((caps_env::TIME_ZONE, caps.time_zone.clone()));
    }

    if caps.video {
        pairs.push((caps_env::ENABLE_VIDEO, "true".to_string()));
        let video_name = if caps.video_name.is_empty() {
            format!("{}.mp4", spec.session_id)
        } else {
            caps.video_name.clone()
        };
        pairs.push((caps_env::VIDEO_NAME, video_name));
        if !caps.video_screen_size.is_empty() {
            pairs.push((caps_env::VIDEO_SIZE, caps.video_screen_size.clone()));
        }
        if caps.video_frame_rate > 0 {
            pairs.push((caps_env::FRAME_RATE, caps.video_frame_rate.to_string()));
        }
        if !caps.video_codec.is_empty() {
            pairs.push((caps_env::CODEC, caps.video_codec.clone()));
        }
    } else {
        spec.template
            .spec
            .env
            .retain(|env| !caps_env::VIDEO_GROUP.contains(&env.name.as_str()));
    }

    for (name, value) in &pairs {
        spec.template.spec.env.retain(|env| env.name != *name);
        spec.template.spec.env.push(env_var(name, value.clone()));
    }

    if !pairs.is_empty() {
        let rendered = pairs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(",");
        spec.template
            .meta
            .annotations
            .insert(CAPABILITIES_ANNOTATION.to_string(), rendered);
    }
    if !caps.test_name.is_empty() {
        spec.template
            .meta
            .annotations
            .insert(TEST_NAME_ANNOTATION.to_string(), caps.test_name.clone());
    }

    spec
}

/// Builds the pod object for a session. Split out of [`Platform`] so it can
/// be exercised without a cluster connection.
pub(crate) struct PodFactory {
    pub svc: String,
    pub svc_port: u16,
    pub proxy_image: String,
    pub video_image: String,
    pub image_pull_secret: String,
}

impl PodFactory {
    pub(crate) fn build(&self, spec: &ServiceSpec) -> Pod {
        let template = &spec.template;
        let video = spec.requested_capabilities.video;

        let mut labels = template.meta.labels.clone();
        labels.insert(TYPE_LABEL.to_string(), TYPE_BROWSER.to_string());
        labels.insert("session".to_string(), spec.session_id.clone());
        labels.insert("browser".to_string(), template.browser_name.clone());
        labels.insert("version".to_string(), template.browser_version.clone());

        let browser = Container {
            name: BROWSER_CONTAINER.to_string(),
            image: Some(template.image.clone()),
            env: Some(template.spec.env.clone()),
            ports: Some(vec![
                ContainerPort {
                    name: Some("browser".to_string()),
                    container_port: i32::from(BROWSER_PORT),
                    ..ContainerPort::default()
                },
                ContainerPort {
                    name: Some("vnc".to_string()),
                    container_port: i32::from(VNC_PORT),
                    ..ContainerPort::default()
                },
            ]),
            resources: template.spec.resources.clone(),
            security_context: Some(SecurityContext {
                privileged: Some(template.privileged),
                ..SecurityContext::default()
            }),
            volume_mounts: non_empty(&template.spec.volume_mounts),
            // Give the recorder a chance to flush the tail of the capture.
            lifecycle: video.then(|| Lifecycle {
                pre_stop: Some(LifecycleHandler {
                    exec: Some(ExecAction {
                        command: Some(
                            ["sh", "-c", "sleep 5"].iter().map(|s| s.to_string()).collect(),
                        ),
                    }),
                    ..LifecycleHandler::default()
                }),
                ..Lifecycle::default()
            }),
            ..Container::default()
        };

        let proxy = Container {
            name: PROXY_CONTAINER.to_string(),
            image: Some(self.proxy_image.clone()),
            ports: Some(vec![ContainerPort {
                name: Some("selenium".to_string()),
                container_port: i32::from(self.svc_port),
                ..ContainerPort::default()
            }]),
            env: Some(vec![
                env_var("BROWSER_PORT", BROWSER_PORT.to_string()),
                env_var("PROXY_PORT", self.svc_port.to_string()),
                env_var("BROWSER_PATH", template.path.clone()),
            ]),
            ..Container::default()
        };

        let mut containers = vec![browser, proxy];
        if video {
            containers.push(Container {
                name: VIDEO_CONTAINER.to_string(),
                image: Some(self.video_image.clone()),
                env: Some(template.spec.env.clone()),
                ..Container::default()
            });
        }

        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some(spec.session_id.clone()),
                labels: Some(labels),
                annotations: Some(template.meta.annotations.clone()),
                ..kube::api::ObjectMeta::default()
            },
            spec: Some(PodSpec {
                hostname: Some(spec.session_id.clone()),
                subdomain: Some(self.svc.clone()),
                containers,
                node_selector: non_empty_map(&template.spec.node_selector),
                host_aliases: non_empty(&template.spec.host_aliases),
                dns_config: template.spec.dns_config.clone(),
                tolerations: non_empty(&template.spec.tolerations),
                service_account_name: non_empty_str(&template.spec.service_account_name),
                priority_class_name: non_empty_str(&template.spec.priority_class_name),
                volumes: non_empty(&template.spec.volumes),
                image_pull_secrets: if self.image_pull_secret.is_empty() {
                    None
                } else {
                    Some(vec![LocalObjectReference {
                        name: Some(self.image_pull_secret.clone()),
                    }])
                },
                restart_policy: Some("Never".to_string()),
                ..PodSpec::default()
            }),
            status: None,
        }
    }
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        value_from: None,
    }
}

fn non_empty<T: Clone>(items: &[T]) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items.to_vec())
    }
}

fn non_empty_map(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map.clone())
    }
}

fn non_empty_str(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn watch_event(value: Value) -> WatchEvent<Pod> {
        serde_json::from_value(value).unwrap()
    }

    fn pod_event(event_type: &str, status: Value) -> WatchEvent<Pod> {
        watch_event(json!({
            "type": event_type,
            "object": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "chrome-85-0-de44c3c4-1a35-412b-b526-f5da802144911"},
                "status": status,
            }
        }))
    }

    fn wait_error(event: &WatchEvent<Pod>) -> String {
        match check_watch_event(event) {
            Err(err) => PlatformError::NotReady(err).to_string(),
            Ok(_) => panic!("expected the event to fail the readiness wait"),
        }
    }

    #[test]
    fn pod_succeeded_fails_creation() {
        let event = pod_event("ADDED", json!({"phase": "Succeeded"}));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: pod exited early with status Succeeded"
        );
    }

    #[test]
    fn pod_failed_fails_creation() {
        let event = pod_event("ADDED", json!({"phase": "Failed"}));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: pod exited early with status Failed"
        );
    }

    #[test]
    fn pod_phase_unknown_fails_creation() {
        let event = pod_event("ADDED", json!({"phase": "Unknown"}));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: couldn't obtain pod state"
        );
    }

    #[test]
    fn pod_without_phase_fails_creation() {
        let event = pod_event("ADDED", json!({}));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: pod has unknown status"
        );
    }

    #[test]
    fn error_event_fails_creation() {
        let event = watch_event(json!({
            "type": "ERROR",
            "object": {"status": "Failure", "message": "expired", "reason": "Expired", "code": 410}
        }));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: received error while watching pod: Expired"
        );
    }

    #[test]
    fn deleted_event_fails_creation() {
        let event = pod_event("DELETED", json!({"phase": "Unknown"}));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: pod was deleted before becoming available"
        );
    }

    #[test]
    fn bookmark_event_fails_creation() {
        let event = watch_event(json!({
            "type": "BOOKMARK",
            "object": {"apiVersion": "v1", "kind": "Pod", "metadata": {"resourceVersion": "1"}}
        }));
        assert_eq!(
            wait_error(&event),
            "pod is not ready after creation: received unknown event type BOOKMARK while watching pod"
        );
    }

    #[test]
    fn running_pod_with_ready_containers_is_ready() {
        let event = pod_event(
            "MODIFIED",
            json!({
                "phase": "Running",
                "containerStatuses": [
                    {"name": "browser", "ready": true, "restartCount": 0, "image": "", "imageID": ""},
                    {"name": "seleniferous", "ready": true, "restartCount": 0, "image": "", "imageID": ""}
                ]
            }),
        );
        assert!(matches!(check_watch_event(&event), Ok(Readiness::Ready)));
    }

    #[test]
    fn running_pod_with_unready_container_keeps_waiting() {
        let event = pod_event(
            "MODIFIED",
            json!({
                "phase": "Running",
                "containerStatuses": [
                    {"name": "browser", "ready": false, "restartCount": 0, "image": "", "imageID": ""}
                ]
            }),
        );
        assert!(matches!(check_watch_event(&event), Ok(Readiness::Wait)));
    }

    #[test]
    fn pending_pod_keeps_waiting() {
        let event = pod_event("ADDED", json!({"phase": "Pending"}));
        assert!(matches!(check_watch_event(&event), Ok(Readiness::Wait)));
    }

    #[test]
    fn phases_map_to_statuses() {
        assert_eq!(service_status(Some("Running")), ServiceStatus::Running);
        assert_eq!(service_status(Some("Pending")), ServiceStatus::Pending);
        assert_eq!(service_status(Some("Failed")), ServiceStatus::Unknown);
        assert_eq!(service_status(None), ServiceStatus::Unknown);
    }

    #[test]
    fn pod_url_uses_headless_service_dns() {
        assert_eq!(
            pod_url(
                "chrome-85-0-de44c3c4-1a35-412b-b526-f5da802144911",
                "selenosis",
                4445
            ),
            "http://chrome-85-0-de44c3c4-1a35-412b-b526-f5da802144911.selenosis:4445"
        );
    }

    fn env_value(spec: &ServiceSpec, name: &str) -> Option<String> {
        spec.template
            .spec
            .env
            .iter()
            .find(|env| env.name == name)
            .and_then(|env| env.value.clone())
    }

    fn annotation(spec: &ServiceSpec) -> String {
        spec.template
            .meta
            .annotations
            .get(CAPABILITIES_ANNOTATION)
            .cloned()
            .unwrap_or_default()
    }

    #[test]
    fn video_name_is_synthesised_from_session_id() {
        let spec = apply_capabilities(ServiceSpec {
            session_id: "test".to_string(),
            requested_capabilities: Capabilities {
                video: true,
                ..Capabilities::default()
            },
            ..ServiceSpec::default()
        });
        assert_eq!(env_value(&spec, caps_env::ENABLE_VIDEO).as_deref(), Some("true"));
        assert_eq!(env_value(&spec, caps_env::VIDEO_NAME).as_deref(), Some("test.mp4"));
        assert!(annotation(&spec).contains("VIDEO_NAME=test.mp4"));
    }

    #[test]
    fn explicit_video_name_wins_over_template_env() {
        let mut spec = ServiceSpec {
            session_id: "test".to_string(),
            requested_capabilities: Capabilities {
                video: true,
                video_name: "abc.mp4".to_string(),
                ..Capabilities::default()
            },
            ..ServiceSpec::default()
        };
        spec.template.spec.env.push(env_var(caps_env::VIDEO_NAME, "efg.mp4".to_string()));
        let spec = apply_capabilities(spec);

        assert_eq!(env_value(&spec, caps_env::VIDEO_NAME).as_deref(), Some("abc.mp4"));
        let names: Vec<&str> = spec.template.spec.env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names.iter().filter(|n| **n == caps_env::VIDEO_NAME).count(),
            1
        );
        assert!(annotation(&spec).contains("VIDEO_NAME=abc.mp4"));
    }

    #[test]
    fn video_disabled_strips_template_video_env() {
        let mut spec = ServiceSpec::default();
        spec.template.spec.env.push(env_var(caps_env::ENABLE_VIDEO, "true".to_string()));
        spec.template.spec.env.push(env_var(caps_env::CODEC, "h264".to_string()));
        let spec = apply_capabilities(spec);

        assert_eq!(env_value(&spec, caps_env::ENABLE_VIDEO), None);
        assert_eq!(env_value(&spec, caps_env::CODEC), None);
        assert!(annotation(&spec).is_empty());
    }

    #[test]
    fn capability_beats_template_env_in_env_and_annotation() {
        for (cap, template_value, expected) in [
            (
                Capabilities {
                    screen_resolution: "800x600".to_string(),
                    ..Capabilities::default()
                },
                (caps_env::SCREEN_RESOLUTION, "1024x768"),
                "SCREEN_RESOLUTION=800x600",
            ),
            (
                Capabilities {
                    vnc: true,
                    ..Capabilities::default()
                },
                (caps_env::ENABLE_VNC, "false"),
                "ENABLE_VNC=true",
            ),
            (
                Capabilities {
                    time_zone: "Europe/Moscow".to_string(),
                    ..Capabilities::default()
                },
                (caps_env::TIME_ZONE, "Europe/Amsterdam"),
                "TZ=Europe/Moscow",
            ),
        ] {
            let mut spec = ServiceSpec {
                requested_capabilities: cap,
                ..ServiceSpec::default()
            };
            spec.template
                .spec
                .env
                .push(env_var(template_value.0, template_value.1.to_string()));
            let spec = apply_capabilities(spec);

            let (name, expected_value) = expected.split_once('=').unwrap();
            assert_eq!(env_value(&spec, name).as_deref(), Some(expected_value));
            assert!(annotation(&spec).contains(expected));
        }
    }

    #[test]
    fn capability_rendering_is_deterministic() {
        let spec = || ServiceSpec {
            session_id: "chrome-85-0-x".to_string(),
            requested_capabilities: Capabilities {
                screen_resolution: "800x600".to_string(),
                vnc: true,
                time_zone: "UTC".to_string(),
                video: true,
                video_frame_rate: 24,
                ..Capabilities::default()
            },
            ..ServiceSpec::default()
        };
        assert_eq!(
            annotation(&apply_capabilities(spec())),
            annotation(&apply_capabilities(spec()))
        );
    }

    #[test]
    fn empty_capabilities_add_nothing() {
        let spec = apply_capabilities(ServiceSpec::default());
        assert!(spec.template.spec.env.is_empty());
        assert!(spec.template.meta.annotations.is_empty());
    }

    fn factory() -> PodFactory {
        PodFactory {
            svc: "selenosis".to_string(),
            svc_port: 4445,
            proxy_image: "seleniferous".to_string(),
            video_image: "selenoid-video-recorder".to_string(),
            image_pull_secret: String::new(),
        }
    }

    fn chrome_spec(video: bool) -> ServiceSpec {
        ServiceSpec {
            session_id: "chrome-85-0-de44c3c4-1a35-412b-b526-f5da802144911".to_string(),
            requested_capabilities: Capabilities {
                video,
                ..Capabilities::default()
            },
            template: BrowserSpec {
                browser_name: "chrome".to_string(),
                browser_version: "85.0".to_string(),
                image: "selenoid/vnc:chrome_85.0".to_string(),
                path: "/".to_string(),
                privileged: true,
                ..BrowserSpec::default()
            },
        }
    }

    #[test]
    fn simple_pod_has_two_containers() {
        let spec = chrome_spec(false);
        let pod = factory().build(&spec);

        assert_eq!(pod.metadata.name.as_deref(), Some(spec.session_id.as_str()));
        let pod_spec = pod.spec.unwrap();
        assert_eq!(pod_spec.hostname.as_deref(), Some(spec.session_id.as_str()));
        assert_eq!(pod_spec.subdomain.as_deref(), Some("selenosis"));
        assert_eq!(pod_spec.containers.len(), 2);

        let browser = &pod_spec.containers[0];
        assert_eq!(browser.name, "browser");
        assert_eq!(browser.image.as_deref(), Some("selenoid/vnc:chrome_85.0"));
        assert_eq!(
            browser.security_context.as_ref().and_then(|sc| sc.privileged),
            Some(true)
        );
        assert!(browser.lifecycle.is_none());

        let proxy = &pod_spec.containers[1];
        assert_eq!(proxy.name, "seleniferous");
        assert_eq!(proxy.image.as_deref(), Some("seleniferous"));
    }

    #[test]
    fn video_pod_has_recorder_and_prestop_hook() {
        let spec = chrome_spec(true);
        let pod = factory().build(&spec);
        let pod_spec = pod.spec.unwrap();

        assert_eq!(pod_spec.containers.len(), 3);
        assert_eq!(pod_spec.containers[2].name, "video-recorder");
        assert_eq!(
            pod_spec.containers[2].image.as_deref(),
            Some("selenoid-video-recorder")
        );

        let hook = pod_spec.containers[0]
            .lifecycle
            .as_ref()
            .and_then(|l| l.pre_stop.as_ref())
            .and_then(|h| h.exec.as_ref())
            .and_then(|e| e.command.clone());
        assert_eq!(
            hook,
            Some(vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()])
        );
    }

    #[test]
    fn pod_carries_selector_labels() {
        let pod = factory().build(&chrome_spec(false));
        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels.get(TYPE_LABEL).map(String::as_str), Some("browser"));
        assert_eq!(labels.get("browser").map(String::as_str), Some("chrome"));
        assert_eq!(labels.get("version").map(String::as_str), Some("85.0"));
        assert_eq!(
            labels.get("session").map(String::as_str),
            Some("chrome-85-0-de44c3c4-1a35-412b-b526-f5da802144911")
        );
    }

    #[test]
    fn pull_secret_is_attached_when_configured() {
        let mut factory = factory();
        factory.image_pull_secret = "regcred".to_string();
        let pod = factory.build(&chrome_spec(false));
        let secrets = pod.spec.unwrap().image_pull_secrets.unwrap();
        assert_eq!(secrets[0].name.as_deref(), Some("regcred"));
    }
}
