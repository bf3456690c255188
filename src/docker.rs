//! Container runtime access: listing, inspection and lifecycle events

use crate::error::SyncError;
use crate::resolver::{parse_env, parse_exposed_ports, ContainerDescriptor};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Actor attribute carrying the node address on clustered daemons
const NODE_IP_ATTRIBUTE: &str = "node.ip";

/// A lifecycle event, normalized from the runtime's event feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEvent {
    /// `start`, `die`, ... or `None` when the runtime sent no action
    pub status: Option<String>,
    pub id: String,
    /// Address of the node the container runs on, if announced
    pub node_ip: Option<String>,
}

impl ContainerEvent {
    pub fn new(status: &str, id: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            id: id.to_string(),
            node_ip: None,
        }
    }

    /// Set the node address (builder pattern)
    pub fn with_node_ip(mut self, ip: &str) -> Self {
        self.node_ip = Some(ip.to_string());
        self
    }

    /// Convert a Docker event message. Non-container events and events
    /// without an actor id yield `None`.
    pub fn from_message(message: EventMessage) -> Option<Self> {
        if let Some(typ) = message.typ {
            if typ != EventMessageTypeEnum::CONTAINER {
                return None;
            }
        }
        let actor = message.actor?;
        let id = actor.id.filter(|id| !id.is_empty())?;
        let node_ip = actor
            .attributes
            .and_then(|mut attrs| attrs.remove(NODE_IP_ATTRIBUTE))
            .filter(|ip| !ip.is_empty());

        Some(Self {
            status: message.action.filter(|a| !a.is_empty()),
            id,
            node_ip,
        })
    }
}

pub type EventStream = BoxStream<'static, Result<ContainerEvent, SyncError>>;

/// What the synchronizer needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Ids of all running containers
    async fn list_running(&self) -> Result<Vec<String>, SyncError>;

    /// Snapshot a container; `Unreachable` if it cannot be inspected
    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor, SyncError>;

    /// Subscribe to lifecycle events from now on
    fn events(&self) -> EventStream;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Build a descriptor from an inspection response.
///
/// The address is the default bridge IP, or failing that the first
/// non-empty address among the container's networks (by network name).
pub fn descriptor_from_inspect(id: &str, info: ContainerInspectResponse) -> ContainerDescriptor {
    let config = info.config.unwrap_or_default();
    let env = parse_env(config.env.unwrap_or_default());
    let exposed_ports = config
        .exposed_ports
        .map(|ports| parse_exposed_ports(ports.keys()))
        .unwrap_or_default();

    let ip = info.network_settings.and_then(|settings| {
        settings
            .ip_address
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                let mut networks: Vec<_> = settings.networks.unwrap_or_default().into_iter().collect();
                networks.sort_by(|a, b| a.0.cmp(&b.0));
                networks
                    .into_iter()
                    .filter_map(|(_, endpoint)| endpoint.ip_address)
                    .find(|ip| !ip.is_empty())
            })
    });

    ContainerDescriptor {
        id: info.id.unwrap_or_else(|| id.to_string()),
        name: info.name.unwrap_or_default(),
        ip,
        env,
        exposed_ports,
    }
}

/// Docker daemon client
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn connect(docker_host: Option<&str>) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host)?,
            None => match std::env::var("DOCKER_HOST") {
                Ok(host) => Self::connect_to_host(&host)?,
                Err(_) => Docker::connect_with_socket_defaults().map_err(|e| {
                    anyhow::anyhow!(
                        "Cannot connect to Docker daemon: {}. \
                         Set DOCKER_HOST or docker.host in the configuration.",
                        e
                    )
                })?,
            },
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, SyncError> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| SyncError::Runtime(format!("failed to list containers: {}", e)))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerDescriptor, SyncError> {
        match self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(descriptor_from_inspect(id, info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(SyncError::unreachable(id, "no such container")),
            Err(e) => Err(SyncError::unreachable(id, e)),
        }
    }

    fn events(&self) -> EventStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        self.client
            .events(Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(message) => ContainerEvent::from_message(message).map(Ok),
                    Err(e) => Some(Err(SyncError::Runtime(format!("event stream error: {}", e)))),
                }
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerConfig, EndpointSettings, EventActor, NetworkSettings};

    fn event(typ: Option<EventMessageTypeEnum>, action: &str, id: &str) -> EventMessage {
        EventMessage {
            typ,
            action: Some(action.to_string()),
            actor: Some(EventActor {
                id: Some(id.to_string()),
                attributes: Some(HashMap::new()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_event_from_container_message() {
        let msg = event(Some(EventMessageTypeEnum::CONTAINER), "start", "abc");
        assert_eq!(
            ContainerEvent::from_message(msg),
            Some(ContainerEvent::new("start", "abc"))
        );
    }

    #[test]
    fn test_event_ignores_other_types() {
        let msg = event(Some(EventMessageTypeEnum::NETWORK), "connect", "net1");
        assert_eq!(ContainerEvent::from_message(msg), None);
    }

    #[test]
    fn test_event_node_ip_and_missing_action() {
        let mut msg = event(None, "", "abc");
        msg.action = None;
        if let Some(actor) = msg.actor.as_mut() {
            actor.attributes = Some(HashMap::from([(
                "node.ip".to_string(),
                "192.168.0.7".to_string(),
            )]));
        }

        let parsed = ContainerEvent::from_message(msg).unwrap();
        assert_eq!(parsed.status, None);
        assert_eq!(parsed.node_ip.as_deref(), Some("192.168.0.7"));
    }

    #[test]
    fn test_event_without_actor_id() {
        let mut msg = event(Some(EventMessageTypeEnum::CONTAINER), "die", "");
        assert_eq!(ContainerEvent::from_message(msg.clone()), None);
        msg.actor = None;
        assert_eq!(ContainerEvent::from_message(msg), None);
    }

    #[test]
    fn test_descriptor_from_inspect() {
        let info = ContainerInspectResponse {
            id: Some("abc123".to_string()),
            name: Some("/myapp_web_1".to_string()),
            config: Some(ContainerConfig {
                env: Some(vec!["VHOST=app.example.com".to_string(), "VHOST=late.example.com".to_string()]),
                exposed_ports: Some(HashMap::from([
                    ("80/tcp".to_string(), HashMap::new()),
                    ("53/udp".to_string(), HashMap::new()),
                ])),
                ..Default::default()
            }),
            network_settings: Some(NetworkSettings {
                ip_address: Some("172.17.0.5".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let descriptor = descriptor_from_inspect("abc123", info);
        assert_eq!(descriptor.name, "/myapp_web_1");
        assert_eq!(descriptor.ip.as_deref(), Some("172.17.0.5"));
        assert_eq!(descriptor.env["VHOST"], "late.example.com");
        assert_eq!(descriptor.exposed_ports.iter().copied().collect::<Vec<_>>(), vec![80]);
    }

    #[test]
    fn test_descriptor_falls_back_to_network_ip() {
        let info = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ip_address: Some(String::new()),
                networks: Some(HashMap::from([
                    ("zeta".to_string(), EndpointSettings {
                        ip_address: Some("10.0.9.2".to_string()),
                        ..Default::default()
                    }),
                    ("alpha".to_string(), EndpointSettings {
                        ip_address: Some("10.0.1.2".to_string()),
                        ..Default::default()
                    }),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        let descriptor = descriptor_from_inspect("def456", info);
        assert_eq!(descriptor.id, "def456");
        assert_eq!(descriptor.ip.as_deref(), Some("10.0.1.2"));
        assert!(descriptor.env.is_empty());
    }
}
