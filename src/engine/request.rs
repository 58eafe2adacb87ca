//! Container request model.
//!
//! A [`ContainerRequest`] fully specifies one container. The builder mirrors
//! the engine's `create` surface one field per flag; `build_create_args`
//! renders the flag list and is unit-tested without a daemon.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::content::Content;
use crate::registry::Reference;

/// Label applied to every container, network, and volume this crate creates
pub const DEFAULT_LABEL_KEY: &str = "dev.chainguard.imagetest";
/// Value of [`DEFAULT_LABEL_KEY`]
pub const DEFAULT_LABEL_VALUE: &str = "true";

/// Default bound on start-until-healthy
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(300);

/// Callback invoked once per emitted container log line
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A mount attached to the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Bind a host path into the container
    Bind {
        /// Host path
        source: String,
        /// Container path
        target: String,
        /// Mount read-only
        read_only: bool,
    },
    /// Attach a named volume
    Volume {
        /// Volume name
        source: String,
        /// Container path
        target: String,
    },
    /// Mount a tmpfs at the target
    Tmpfs {
        /// Container path
        target: String,
        /// Size in bytes, 0 for the engine default
        size: u64,
    },
}

impl Mount {
    pub(crate) fn render(&self) -> String {
        match self {
            Self::Bind {
                source,
                target,
                read_only,
            } => {
                let mut rendered = format!("type=bind,src={source},dst={target}");
                if *read_only {
                    rendered.push_str(",readonly");
                }
                rendered
            }
            Self::Volume { source, target } => {
                format!("type=volume,src={source},dst={target}")
            }
            Self::Tmpfs { target, size } => {
                if *size == 0 {
                    format!("type=tmpfs,dst={target}")
                } else {
                    format!("type=tmpfs,dst={target},tmpfs-size={size}")
                }
            }
        }
    }
}

/// An existing network the container joins, by name and id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAttachment {
    /// Network name
    pub name: String,
    /// Network id
    pub id: String,
}

/// CPU and memory limits for the container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resources {
    /// CPU quantity, e.g. `2` or `0.5`
    pub cpus: Option<f64>,
    /// Memory soft reservation, e.g. `512m`
    pub memory_request: Option<String>,
    /// Memory hard limit, e.g. `2g`
    pub memory_limit: Option<String>,
}

/// Healthcheck configuration for the container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Healthcheck {
    /// The probe command; `CMD`/`CMD-SHELL` prefixes are honored
    pub test: Vec<String>,
    /// Time between probes
    pub interval: Duration,
    /// Per-probe timeout
    pub timeout: Duration,
    /// Consecutive failures before unhealthy
    pub retries: u32,
    /// Grace period before probes count
    pub start_period: Duration,
}

impl Healthcheck {
    /// A healthcheck with the given command and 1s/5s/5/1s timings
    pub fn new(test: Vec<String>) -> Self {
        Self {
            test,
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            retries: 5,
            start_period: Duration::from_secs(1),
        }
    }

    fn shell_command(&self) -> String {
        match self.test.first().map(String::as_str) {
            Some("CMD-SHELL") => self.test[1..].join(" "),
            Some("CMD") => self.test[1..].join(" "),
            _ => self.test.join(" "),
        }
    }
}

/// A port published from the container to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    /// Container-side port
    pub container: u16,
    /// Host-side port; `None` requests an ephemeral port
    pub host: Option<u16>,
    /// Protocol, `tcp` unless set otherwise
    pub protocol: String,
}

impl PublishedPort {
    /// Publish a TCP container port on an ephemeral host port
    pub fn ephemeral(container: u16) -> Self {
        Self {
            container,
            host: None,
            protocol: "tcp".to_string(),
        }
    }
}

/// Full specification of one container
pub struct ContainerRequest {
    /// Image to run
    pub image: Reference,
    /// Container name; generated when absent
    pub name: Option<String>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// Command
    pub cmd: Vec<String>,
    /// Environment variables
    pub env: BTreeMap<String, String>,
    /// Labels; defaults merged in, caller entries win on collision
    pub labels: BTreeMap<String, String>,
    /// Mounts
    pub mounts: Vec<Mount>,
    /// Networks to attach, in order
    pub networks: Vec<NetworkAttachment>,
    /// Extended privileges
    pub privileged: bool,
    /// Resource limits
    pub resources: Resources,
    /// Healthcheck configuration
    pub healthcheck: Option<Healthcheck>,
    /// Ports exposed without publishing
    pub exposed_ports: Vec<u16>,
    /// Ports published to the host
    pub published_ports: Vec<PublishedPort>,
    /// Extra /etc/hosts entries as `host:ip`
    pub extra_hosts: Vec<String>,
    /// Run an init process as pid 1
    pub init: bool,
    /// Remove the container when it exits
    pub auto_remove: bool,
    /// Files copied in before start, each extracted at `/`
    pub contents: Vec<Content>,
    /// Per-line log callback
    pub log_sink: Option<LogSink>,
    /// Bound on start-until-healthy
    pub timeout: Duration,
}

impl ContainerRequest {
    /// Create a request for the given image
    pub fn new(image: Reference) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(DEFAULT_LABEL_KEY.to_string(), DEFAULT_LABEL_VALUE.to_string());
        Self {
            image,
            name: None,
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            labels,
            mounts: Vec::new(),
            networks: Vec::new(),
            privileged: false,
            resources: Resources::default(),
            healthcheck: None,
            exposed_ports: Vec::new(),
            published_ports: Vec::new(),
            extra_hosts: Vec::new(),
            init: false,
            auto_remove: false,
            contents: Vec::new(),
            log_sink: None,
            timeout: DEFAULT_START_TIMEOUT,
        }
    }

    /// Set the container name
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the entrypoint
    #[must_use]
    pub fn entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    /// Set the command
    #[must_use]
    pub fn cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add a label; caller labels take precedence over defaults
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Add a mount
    #[must_use]
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Attach an existing network
    #[must_use]
    pub fn network(mut self, attachment: NetworkAttachment) -> Self {
        self.networks.push(attachment);
        self
    }

    /// Give the container extended privileges
    #[must_use]
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Set resource limits
    #[must_use]
    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Configure the healthcheck
    #[must_use]
    pub fn healthcheck(mut self, healthcheck: Healthcheck) -> Self {
        self.healthcheck = Some(healthcheck);
        self
    }

    /// Expose a port without publishing it
    #[must_use]
    pub fn expose(mut self, port: u16) -> Self {
        self.exposed_ports.push(port);
        self
    }

    /// Publish a port to the host
    #[must_use]
    pub fn publish(mut self, port: PublishedPort) -> Self {
        self.published_ports.push(port);
        self
    }

    /// Add an /etc/hosts entry as `host:ip`
    #[must_use]
    pub fn extra_host(mut self, entry: impl Into<String>) -> Self {
        self.extra_hosts.push(entry.into());
        self
    }

    /// Run an init process as pid 1
    #[must_use]
    pub fn init(mut self) -> Self {
        self.init = true;
        self
    }

    /// Remove the container when it exits
    #[must_use]
    pub fn auto_remove(mut self) -> Self {
        self.auto_remove = true;
        self
    }

    /// Copy a file into the container before start
    #[must_use]
    pub fn content(mut self, content: Content) -> Self {
        self.contents.push(content);
        self
    }

    /// Install a per-line log callback
    #[must_use]
    pub fn log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    /// Bound start-until-healthy
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Render the `create` argument list.
    ///
    /// Only the first network is attached at create time; the engine
    /// connects the rest before start.
    pub(crate) fn build_create_args(&self, name: &str) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{key}={value}"));
        }
        for (key, value) in &self.env {
            args.push("--env".to_string());
            args.push(format!("{key}={value}"));
        }
        for mount in &self.mounts {
            args.push("--mount".to_string());
            args.push(mount.render());
        }
        if let Some(network) = self.networks.first() {
            args.push("--network".to_string());
            args.push(network.name.clone());
        }
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(cpus) = self.resources.cpus {
            args.push("--cpus".to_string());
            args.push(cpus.to_string());
        }
        if let Some(memory) = &self.resources.memory_limit {
            args.push("--memory".to_string());
            args.push(memory.clone());
        }
        if let Some(memory) = &self.resources.memory_request {
            args.push("--memory-reservation".to_string());
            args.push(memory.clone());
        }
        if let Some(healthcheck) = &self.healthcheck {
            args.push("--health-cmd".to_string());
            args.push(healthcheck.shell_command());
            args.push("--health-interval".to_string());
            args.push(format!("{}s", healthcheck.interval.as_secs()));
            args.push("--health-timeout".to_string());
            args.push(format!("{}s", healthcheck.timeout.as_secs()));
            args.push("--health-retries".to_string());
            args.push(healthcheck.retries.to_string());
            args.push("--health-start-period".to_string());
            args.push(format!("{}s", healthcheck.start_period.as_secs()));
        }
        for port in &self.exposed_ports {
            args.push("--expose".to_string());
            args.push(port.to_string());
        }
        for port in &self.published_ports {
            args.push("--publish".to_string());
            match port.host {
                Some(host) => args.push(format!("{host}:{}/{}", port.container, port.protocol)),
                None => args.push(format!("{}/{}", port.container, port.protocol)),
            }
        }
        for entry in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(entry.clone());
        }
        if self.init {
            args.push("--init".to_string());
        }
        if self.auto_remove {
            args.push("--rm".to_string());
        }
        if let Some(binary) = self.entrypoint.first() {
            args.push("--entrypoint".to_string());
            args.push(binary.clone());
        }

        args.push(self.image.to_string());

        // The engine takes a single-string entrypoint; trailing entrypoint
        // elements lead the command.
        if self.entrypoint.len() > 1 {
            args.extend(self.entrypoint[1..].iter().cloned());
        }
        args.extend(self.cmd.iter().cloned());
        args
    }
}

impl std::fmt::Debug for ContainerRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRequest")
            .field("image", &self.image.to_string())
            .field("name", &self.name)
            .field("entrypoint", &self.entrypoint)
            .field("cmd", &self.cmd)
            .field("networks", &self.networks)
            .field("privileged", &self.privileged)
            .field("contents", &self.contents.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ContainerRequest {
        ContainerRequest::new(Reference::parse("cgr.dev/chainguard/wolfi-base:latest").unwrap())
    }

    #[test]
    fn test_default_label_applied() {
        let args = request().build_create_args("c1");
        let at = args.iter().position(|a| a == "--label").unwrap();
        assert_eq!(args[at + 1], "dev.chainguard.imagetest=true");
    }

    #[test]
    fn test_caller_label_wins_on_collision() {
        let args = request()
            .label(DEFAULT_LABEL_KEY, "mine")
            .build_create_args("c1");
        assert!(args.contains(&"dev.chainguard.imagetest=mine".to_string()));
        assert!(!args.contains(&"dev.chainguard.imagetest=true".to_string()));
    }

    #[test]
    fn test_entrypoint_split_across_flag_and_command() {
        let args = request()
            .entrypoint(vec!["/bin/sh".into(), "-c".into()])
            .cmd(vec!["tail -f /dev/null".into()])
            .build_create_args("c1");
        let entry = args.iter().position(|a| a == "--entrypoint").unwrap();
        assert_eq!(args[entry + 1], "/bin/sh");
        let image = args
            .iter()
            .position(|a| a.starts_with("cgr.dev/"))
            .unwrap();
        assert_eq!(args[image + 1], "-c");
        assert_eq!(args[image + 2], "tail -f /dev/null");
    }

    #[test]
    fn test_mount_rendering() {
        assert_eq!(
            Mount::Bind {
                source: "/src".into(),
                target: "/dst".into(),
                read_only: true
            }
            .render(),
            "type=bind,src=/src,dst=/dst,readonly"
        );
        assert_eq!(
            Mount::Volume {
                source: "vol".into(),
                target: "/data".into()
            }
            .render(),
            "type=volume,src=vol,dst=/data"
        );
        assert_eq!(
            Mount::Tmpfs {
                target: "/run".into(),
                size: 0
            }
            .render(),
            "type=tmpfs,dst=/run"
        );
    }

    #[test]
    fn test_healthcheck_args() {
        let args = request()
            .healthcheck(Healthcheck::new(vec![
                "CMD".into(),
                "docker".into(),
                "info".into(),
            ]))
            .build_create_args("c1");
        let at = args.iter().position(|a| a == "--health-cmd").unwrap();
        assert_eq!(args[at + 1], "docker info");
        assert!(args.contains(&"--health-interval".to_string()));
        assert!(args.contains(&"--health-retries".to_string()));
    }

    #[test]
    fn test_published_ports() {
        let args = request()
            .publish(PublishedPort::ephemeral(6443))
            .publish(PublishedPort {
                container: 8080,
                host: Some(18080),
                protocol: "tcp".into(),
            })
            .build_create_args("c1");
        assert!(args.contains(&"6443/tcp".to_string()));
        assert!(args.contains(&"18080:8080/tcp".to_string()));
    }

    #[test]
    fn test_only_first_network_at_create() {
        let args = request()
            .network(NetworkAttachment {
                name: "n1".into(),
                id: "id1".into(),
            })
            .network(NetworkAttachment {
                name: "n2".into(),
                id: "id2".into(),
            })
            .build_create_args("c1");
        assert_eq!(args.iter().filter(|a| *a == "--network").count(), 1);
        assert!(args.contains(&"n1".to_string()));
        assert!(!args.contains(&"n2".to_string()));
    }

    #[test]
    fn test_privileged_init_rm_flags() {
        let args = request().privileged().init().auto_remove().build_create_args("c1");
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"--init".to_string()));
        assert!(args.contains(&"--rm".to_string()));
    }
}
