//! # Docker Monitor
//!
//! Subscribes to the container daemon's event stream and translates
//! container lifecycle signals into normalized events. Metadata
//! extraction is pluggable; the default extractor maps labels to tags
//! and collects the container's addresses per network.
//!
//! The event socket may drop at any time; the monitor reconnects with
//! capped backoff and runs a resync afterwards so no lifecycle change
//! is lost. The same resync runs at startup and on a periodic timer,
//! which is how kernel state ownership is recovered after a restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use shared_types::{EventInfo, EventType, DEFAULT_NAMESPACE};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{EventHandler, Monitor, MonitorError, DEFAULT_DOCKER_SOCKET_TYPE};

/// Interval of the periodic container resync.
const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Cap for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Length of the short container id used as the PU identifier.
const SHORT_ID_LEN: usize = 12;

/// Extracts a normalized event from an inspected container.
pub trait DockerMetadataExtractor: Send + Sync {
    fn extract(
        &self,
        container: &ContainerInspectResponse,
        event_type: EventType,
    ) -> Result<EventInfo, MonitorError>;
}

/// Extractor mapping labels to tags and collecting per-network
/// addresses.
#[derive(Debug, Default)]
pub struct DefaultMetadataExtractor;

impl DockerMetadataExtractor for DefaultMetadataExtractor {
    fn extract(
        &self,
        container: &ContainerInspectResponse,
        event_type: EventType,
    ) -> Result<EventInfo, MonitorError> {
        let id = container
            .id
            .as_deref()
            .ok_or_else(|| MonitorError::Metadata("container without id".to_string()))?;

        let name = container
            .name
            .as_deref()
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_else(|| short_id(id));

        let mut tags: HashMap<String, String> = container
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        if let Some(image) = container.config.as_ref().and_then(|c| c.image.clone()) {
            tags.insert("@image".to_string(), image);
        }
        tags.insert("@name".to_string(), name.clone());

        let pid = container
            .state
            .as_ref()
            .and_then(|s| s.pid)
            .unwrap_or_default();

        let mut ip_addresses = HashMap::new();
        if let Some(networks) = container
            .network_settings
            .as_ref()
            .and_then(|n| n.networks.as_ref())
        {
            for (network, endpoint) in networks {
                if let Some(ip) = endpoint.ip_address.as_ref().filter(|ip| !ip.is_empty()) {
                    ip_addresses.insert(network.clone(), ip.clone());
                }
            }
            // The bridge address doubles as the default address.
            if let Some(bridge_ip) = ip_addresses.get("bridge").cloned() {
                ip_addresses.insert(DEFAULT_NAMESPACE.to_string(), bridge_ip);
            } else if let Some(any_ip) = ip_addresses.values().next().cloned() {
                ip_addresses.insert(DEFAULT_NAMESPACE.to_string(), any_ip);
            }
        }

        Ok(EventInfo {
            pu_id: short_id(id),
            name,
            tags,
            pid: pid.to_string(),
            event_type,
            ip_addresses,
        })
    }
}

/// Monitor over the container daemon's event stream.
pub struct DockerMonitor {
    docker: Docker,
    handler: Arc<dyn EventHandler>,
    extractor: Arc<dyn DockerMetadataExtractor>,
    sync_at_start: bool,
    task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl DockerMonitor {
    /// Connect to the daemon at `(socket_type, socket_path)`. Only Unix
    /// sockets are supported.
    pub fn new(
        socket_type: &str,
        socket_path: &str,
        handler: Arc<dyn EventHandler>,
        extractor: Option<Arc<dyn DockerMetadataExtractor>>,
        sync_at_start: bool,
    ) -> Result<Self, MonitorError> {
        if socket_type != DEFAULT_DOCKER_SOCKET_TYPE {
            return Err(MonitorError::UnsupportedSocket(socket_type.to_string()));
        }
        let docker = Docker::connect_with_unix(socket_path, 120, API_DEFAULT_VERSION)
            .map_err(|e| MonitorError::DockerUnavailable(e.to_string()))?;
        Ok(Self {
            docker,
            handler,
            extractor: extractor.unwrap_or_else(|| Arc::new(DefaultMetadataExtractor)),
            sync_at_start,
            task: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Monitor for DockerMonitor {
    async fn start(&self) -> Result<(), MonitorError> {
        let mut guard = self.task.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_state = EventLoop {
            docker: self.docker.clone(),
            handler: Arc::clone(&self.handler),
            extractor: Arc::clone(&self.extractor),
        };
        let sync_at_start = self.sync_at_start;
        let task = tokio::spawn(async move {
            loop_state.run(sync_at_start, shutdown_rx).await;
        });
        *guard = Some((shutdown_tx, task));
        info!("Docker monitor started");
        Ok(())
    }

    async fn stop(&self) {
        if let Some((shutdown_tx, task)) = self.task.lock().await.take() {
            let _ = shutdown_tx.send(true);
            let _ = task.await;
        }
    }
}

struct EventLoop {
    docker: Docker,
    handler: Arc<dyn EventHandler>,
    extractor: Arc<dyn DockerMetadataExtractor>,
}

impl EventLoop {
    async fn run(&self, sync_at_start: bool, mut shutdown: watch::Receiver<bool>) {
        if sync_at_start {
            self.resync().await;
        }

        let mut resync_timer = tokio::time::interval(RESYNC_INTERVAL);
        resync_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        resync_timer.reset();

        let mut backoff = Duration::from_secs(1);
        loop {
            let mut events = Box::pin(self.docker.events(Some(container_events_options())));
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = resync_timer.tick() => self.resync().await,
                    message = events.next() => match message {
                        Some(Ok(event)) => {
                            backoff = Duration::from_secs(1);
                            self.dispatch(event).await;
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "Docker event stream error");
                            break;
                        }
                        None => {
                            warn!("Docker event stream closed");
                            break;
                        }
                    },
                }
            }

            // Stream lost: back off, reconnect, resync to bridge the gap.
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
            self.resync().await;
        }
    }

    async fn dispatch(&self, message: EventMessage) {
        if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
            return;
        }
        let Some(id) = message.actor.as_ref().and_then(|a| a.id.clone()) else {
            return;
        };
        let Some(action) = message.action.as_deref() else {
            return;
        };
        let Some(event_type) = map_action(action) else {
            debug!(action, "Ignoring container action");
            return;
        };

        let event = match event_type {
            // Creation and start carry the full runtime; the container
            // still exists, so inspect it.
            EventType::Create | EventType::Start | EventType::Pause | EventType::Unpause => {
                match self
                    .docker
                    .inspect_container(&id, None::<InspectContainerOptions>)
                    .await
                {
                    Ok(container) => match self.extractor.extract(&container, event_type) {
                        Ok(event) => event,
                        Err(e) => {
                            warn!(id, error = %e, "Cannot extract container metadata");
                            return;
                        }
                    },
                    Err(e) => {
                        warn!(id, error = %e, "Cannot inspect container");
                        return;
                    }
                }
            }
            // The container may already be gone; a minimal event is
            // enough to stop and clean up.
            EventType::Stop | EventType::Destroy => EventInfo {
                pu_id: short_id(&id),
                name: short_id(&id),
                tags: HashMap::new(),
                pid: String::new(),
                event_type,
                ip_addresses: HashMap::new(),
            },
        };

        if let Err(e) = self.handler.handle_event(event).await {
            warn!(id, error = %e, "Handler rejected container event");
        }
    }

    /// Enumerate running containers and synthesize create and start
    /// events for each; the orchestrator treats redelivery as
    /// idempotent.
    async fn resync(&self) {
        let containers = match self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Cannot list containers for resync");
                return;
            }
        };

        for summary in containers {
            let Some(id) = summary.id else { continue };
            let container = match self
                .docker
                .inspect_container(&id, None::<InspectContainerOptions>)
                .await
            {
                Ok(container) => container,
                Err(e) => {
                    warn!(id, error = %e, "Cannot inspect container during resync");
                    continue;
                }
            };
            for event_type in [EventType::Create, EventType::Start] {
                match self.extractor.extract(&container, event_type) {
                    Ok(event) => {
                        if let Err(e) = self.handler.handle_event(event).await {
                            warn!(id, error = %e, "Handler rejected resync event");
                        }
                    }
                    Err(e) => warn!(id, error = %e, "Cannot extract metadata during resync"),
                }
            }
        }
    }
}

fn container_events_options() -> EventsOptions<String> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    EventsOptions {
        since: None,
        until: None,
        filters,
    }
}

fn map_action(action: &str) -> Option<EventType> {
    match action {
        "create" => Some(EventType::Create),
        "start" => Some(EventType::Start),
        "die" | "stop" => Some(EventType::Stop),
        "destroy" => Some(EventType::Destroy),
        "pause" => Some(EventType::Pause),
        "unpause" => Some(EventType::Unpause),
        _ => None,
    }
}

fn short_id(id: &str) -> String {
    id.chars().take(SHORT_ID_LEN).collect()
}
