//! Route resolution: container environment to virtual-host backends
//!
//! A container declares up to `max_slots + 1` routes through environment
//! variables. Slot 0 uses the bare names (`VHOST`, `VHOST_PORT`,
//! `VHOST_PREFIX`), slot `i` appends `_i`. Each name may be redirected
//! through a custom key (`ENV_VHOST=SOME_VAR`), in which case the value is
//! read from `SOME_VAR` instead.

use crate::config::EnvScheme;
use crate::error::SyncError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Virtual host to ordered backend addresses (`ip:port`)
pub type ResolvedRoute = BTreeMap<String, Vec<String>>;

/// Read-only snapshot of an inspected container
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerDescriptor {
    pub id: String,
    /// Display name as reported by the runtime (usually `/name`)
    pub name: String,
    pub ip: Option<String>,
    pub env: HashMap<String, String>,
    pub exposed_ports: BTreeSet<u16>,
}

impl ContainerDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the IP address (builder pattern)
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set environment from `KEY=VALUE` entries (builder pattern)
    pub fn with_env<I, S>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.env = parse_env(entries);
        self
    }

    /// Add an exposed TCP port (builder pattern)
    pub fn with_exposed_port(mut self, port: u16) -> Self {
        self.exposed_ports.insert(port);
        self
    }

    /// Look up a variable, treating empty values as unset
    fn var(&self, key: &str) -> Option<&str> {
        self.env
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Resolve `base_key`, following `custom_key` when it is set
    fn lookup(&self, base_key: &str, custom_key: &str) -> Option<&str> {
        match self.var(custom_key) {
            Some(target) => self.var(target),
            None => self.var(base_key),
        }
    }
}

/// Parse `KEY=VALUE` entries. Later duplicates win; an entry without `=`
/// maps to an empty value.
pub fn parse_env<I, S>(entries: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .map(|entry| {
            let entry = entry.as_ref();
            match entry.split_once('=') {
                Some((key, value)) => (key.to_string(), value.to_string()),
                None => (entry.to_string(), String::new()),
            }
        })
        .collect()
}

/// Parse exposed port keys such as `80/tcp`, keeping TCP ports only
pub fn parse_exposed_ports<'a, I>(keys: I) -> BTreeSet<u16>
where
    I: IntoIterator<Item = &'a String>,
{
    keys.into_iter()
        .filter_map(|key| {
            let (port, proto) = key.split_once('/').unwrap_or((key.as_str(), "tcp"));
            if proto.eq_ignore_ascii_case("tcp") {
                port.parse().ok()
            } else {
                None
            }
        })
        .collect()
}

/// Default prefix derived from the container name.
///
/// `/myapp_web_1` becomes `web.myapp`: the name is split on the divisor,
/// reversed, and a leading numeric token (compose replica number) dropped.
pub fn default_prefix(name: &str, divisor: &str) -> String {
    let name = name.trim_start_matches('/');
    let mut tokens: Vec<&str> = name.split(divisor).collect();
    tokens.reverse();
    if tokens.first().is_some_and(|t| t.parse::<i64>().is_ok()) {
        tokens.remove(0);
    }
    tokens.join(".")
}

/// Key names for one slot
struct SlotKeys {
    host: String,
    port: String,
    prefix: String,
    custom_host: String,
    custom_port: String,
    custom_prefix: String,
}

impl SlotKeys {
    fn new(scheme: &EnvScheme, slot: u32) -> Self {
        let suffixed = |base: &str| {
            if slot == 0 {
                base.to_string()
            } else {
                format!("{}{}{}", base, scheme.divisor, slot)
            }
        };
        let custom = |key: &str| format!("{}{}{}", scheme.custom_prefix, scheme.divisor, key);

        let host = suffixed(&scheme.hostname);
        let port = suffixed(&scheme.port);
        let prefix = suffixed(&scheme.prefix);
        Self {
            custom_host: custom(&host),
            custom_port: custom(&port),
            custom_prefix: custom(&prefix),
            host,
            port,
            prefix,
        }
    }
}

/// Resolves container descriptors into routes under a fixed naming scheme
#[derive(Debug, Clone)]
pub struct Resolver {
    scheme: EnvScheme,
    default_vhost: String,
    default_port: u16,
}

impl Resolver {
    pub fn new(scheme: EnvScheme, default_vhost: impl Into<String>, default_port: u16) -> Self {
        Self {
            scheme,
            default_vhost: default_vhost.into(),
            default_port,
        }
    }

    pub fn from_config(config: &crate::config::SyncConfig) -> Self {
        Self::new(
            config.env.clone(),
            config.default_vhost.clone(),
            config.default_port,
        )
    }

    /// Resolve every slot of `descriptor` into a route map.
    ///
    /// `override_ip` takes precedence over the container's own address.
    /// Fails only when neither is available.
    pub fn resolve(
        &self,
        descriptor: &ContainerDescriptor,
        override_ip: Option<&str>,
    ) -> Result<ResolvedRoute, SyncError> {
        let ip = override_ip
            .filter(|ip| !ip.is_empty())
            .or(descriptor.ip.as_deref().filter(|ip| !ip.is_empty()))
            .ok_or_else(|| SyncError::NoAddress(descriptor.id.clone()))?;

        let default_port = self.default_port.to_string();
        let exposes_default = descriptor.exposed_ports.contains(&self.default_port);
        let mut routes = ResolvedRoute::new();

        for slot in 0..=self.scheme.max_slots {
            let keys = SlotKeys::new(&self.scheme, slot);
            let host = descriptor.lookup(&keys.host, &keys.custom_host);
            let port = descriptor.lookup(&keys.port, &keys.custom_port);
            let prefix = descriptor.lookup(&keys.prefix, &keys.custom_prefix);

            let vhost = match (host, prefix) {
                (Some(host), _) => host.to_string(),
                (None, Some(prefix)) => format!("{}.{}", prefix, self.default_vhost),
                (None, None) => continue,
            };
            if port.is_none() && !(slot == 0 && exposes_default) {
                continue;
            }
            let port = port.unwrap_or(&default_port);

            routes
                .entry(vhost)
                .or_default()
                .push(format!("{}:{}", ip, port));
        }

        // A container that declares nothing but exposes the default port
        // is published under its name-derived host.
        if exposes_default && !self.declares_routes(descriptor) {
            let vhost = format!(
                "{}.{}",
                default_prefix(&descriptor.name, &self.scheme.divisor),
                self.default_vhost
            );
            routes.insert(vhost, vec![format!("{}:{}", ip, default_port)]);
        }

        Ok(routes)
    }

    /// Whether any slot sets one of its host, port or prefix keys
    fn declares_routes(&self, descriptor: &ContainerDescriptor) -> bool {
        (0..=self.scheme.max_slots).any(|slot| {
            let keys = SlotKeys::new(&self.scheme, slot);
            let names = [
                &keys.host,
                &keys.port,
                &keys.prefix,
                &keys.custom_host,
                &keys.custom_port,
                &keys.custom_prefix,
            ];
            let declared = names.into_iter().any(|key| descriptor.var(key).is_some());
            declared
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Resolver {
        Resolver::new(EnvScheme::default(), "dev.docker-hipache.io", 80)
    }

    fn container(env: &[&str]) -> ContainerDescriptor {
        ContainerDescriptor::new("abc123", "/myapp_web_1")
            .with_ip("172.17.0.5")
            .with_env(env.iter().copied())
    }

    #[test]
    fn test_default_prefix() {
        assert_eq!(default_prefix("/myapp_web_1", "_"), "web.myapp");
        assert_eq!(default_prefix("myapp_web", "_"), "web.myapp");
        assert_eq!(default_prefix("/standalone", "_"), "standalone");
        assert_eq!(default_prefix("/a-b-c-12", "-"), "c.b.a");
        // Only a trailing replica number is dropped
        assert_eq!(default_prefix("/v2_api_3", "_"), "api.v2");
        assert_eq!(default_prefix("/2_api", "_"), "api.2");
    }

    #[test]
    fn test_parse_env_last_wins() {
        let env = parse_env(["A=1", "B=x=y", "A=2", "FLAG"]);
        assert_eq!(env.get("A").map(String::as_str), Some("2"));
        assert_eq!(env.get("B").map(String::as_str), Some("x=y"));
        assert_eq!(env.get("FLAG").map(String::as_str), Some(""));
    }

    #[test]
    fn test_parse_exposed_ports() {
        let keys: Vec<String> = ["80/tcp", "53/udp", "8080", "bogus/tcp"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let ports = parse_exposed_ports(&keys);
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![80, 8080]);
    }

    #[test]
    fn test_default_route_from_exposed_port() {
        let descriptor = container(&["PATH=/usr/bin"]).with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes.get("web.myapp.dev.docker-hipache.io"),
            Some(&vec!["172.17.0.5:80".to_string()])
        );
    }

    #[test]
    fn test_no_exposed_port_no_env_yields_nothing() {
        let routes = resolver().resolve(&container(&[]), None).unwrap();
        assert!(routes.is_empty());
    }

    #[test]
    fn test_custom_host_indirection() {
        let descriptor = container(&["ENV_VHOST=CUSTOM_HOST", "CUSTOM_HOST=app.example.com"])
            .with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes.get("app.example.com"),
            Some(&vec!["172.17.0.5:80".to_string()])
        );
    }

    #[test]
    fn test_custom_key_does_not_fall_back_to_base_key() {
        let descriptor = container(&["ENV_VHOST=MISSING", "VHOST=ignored.example.com"])
            .with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        // Slot 0 declares a custom key, so the default-name fallback is off too
        assert!(routes.is_empty());
    }

    #[test]
    fn test_indexed_slot_with_prefix() {
        let descriptor = container(&["VHOST_PORT_1=8080", "VHOST_PREFIX_1=custom.prefix"]);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        assert_eq!(routes.len(), 1);
        assert_eq!(
            routes.get("custom.prefix.dev.docker-hipache.io"),
            Some(&vec!["172.17.0.5:8080".to_string()])
        );
    }

    #[test]
    fn test_mixed_slots() {
        let descriptor = container(&[
            "ENV_VHOST=CUSTOM_HOST",
            "CUSTOM_HOST=app.myhost.com",
            "VHOST_PORT_1=8080",
            "VHOST_PREFIX_1=custom.prefix",
        ])
        .with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        let hosts: Vec<&str> = routes.keys().map(String::as_str).collect();
        assert_eq!(hosts, vec!["app.myhost.com", "custom.prefix.dev.docker-hipache.io"]);
        assert_eq!(routes["app.myhost.com"], vec!["172.17.0.5:80"]);
    }

    #[test]
    fn test_slots_accumulate_without_dedup() {
        let descriptor = container(&[
            "VHOST=fulano.com",
            "VHOST_1=app2.myhost.com",
            "VHOST_PORT_1=8080",
            "VHOST_2=app2.myhost.com",
            "VHOST_PORT_2=8081",
            "VHOST_3=app2.myhost.com",
            "VHOST_PORT_3=8081",
        ])
        .with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();

        assert_eq!(routes["fulano.com"], vec!["172.17.0.5:80"]);
        assert_eq!(
            routes["app2.myhost.com"],
            vec!["172.17.0.5:8080", "172.17.0.5:8081", "172.17.0.5:8081"]
        );
    }

    #[test]
    fn test_slot_zero_needs_port_or_exposed_default() {
        let descriptor = container(&["VHOST=no-port.example.com"]);
        assert!(resolver().resolve(&descriptor, None).unwrap().is_empty());

        let descriptor = container(&["VHOST=no-port.example.com"]).with_exposed_port(80);
        let routes = resolver().resolve(&descriptor, None).unwrap();
        assert_eq!(routes["no-port.example.com"], vec!["172.17.0.5:80"]);
    }

    #[test]
    fn test_indexed_slot_ignores_exposed_default() {
        let descriptor = container(&["VHOST_1=extra.example.com"]).with_exposed_port(80);
        assert!(resolver().resolve(&descriptor, None).unwrap().is_empty());
    }

    #[test]
    fn test_port_only_declaration_disables_default_route() {
        // A port without a host or prefix names no vhost, and still counts
        // as a declaration, so the name-derived default is not published.
        let descriptor = container(&["VHOST_PORT=8080"]).with_exposed_port(80);
        assert!(resolver().resolve(&descriptor, None).unwrap().is_empty());

        let descriptor = container(&["ENV_VHOST_PORT_3=APP_PORT"]).with_exposed_port(80);
        assert!(resolver().resolve(&descriptor, None).unwrap().is_empty());
    }

    #[test]
    fn test_custom_port_and_prefix_indirection() {
        let descriptor = container(&[
            "ENV_VHOST_PORT_2=APP_PORT",
            "APP_PORT=3000",
            "ENV_VHOST_PREFIX_2=APP_NAME",
            "APP_NAME=billing",
        ]);
        let routes = resolver().resolve(&descriptor, None).unwrap();
        assert_eq!(
            routes["billing.dev.docker-hipache.io"],
            vec!["172.17.0.5:3000"]
        );
    }

    #[test]
    fn test_non_numeric_port_passes_through() {
        let descriptor = container(&["VHOST=odd.example.com", "VHOST_PORT=http"]);
        let routes = resolver().resolve(&descriptor, None).unwrap();
        assert_eq!(routes["odd.example.com"], vec!["172.17.0.5:http"]);
    }

    #[test]
    fn test_slots_beyond_max_are_ignored() {
        let scheme = EnvScheme {
            max_slots: 1,
            ..EnvScheme::default()
        };
        let resolver = Resolver::new(scheme, "dev.local", 80);
        let descriptor = container(&[
            "VHOST_1=one.example.com",
            "VHOST_PORT_1=81",
            "VHOST_2=two.example.com",
            "VHOST_PORT_2=82",
        ]);
        let routes = resolver.resolve(&descriptor, None).unwrap();
        assert_eq!(routes.len(), 1);
        assert!(routes.contains_key("one.example.com"));
    }

    #[test]
    fn test_custom_scheme() {
        let scheme = EnvScheme {
            hostname: "HOST".into(),
            port: "PORT".into(),
            prefix: "PFX".into(),
            custom_prefix: "X".into(),
            divisor: "-".into(),
            max_slots: 2,
        };
        let resolver = Resolver::new(scheme, "apps.local", 8000);
        let descriptor = ContainerDescriptor::new("id", "/shop-cart-2")
            .with_ip("10.0.0.9")
            .with_env(["X-HOST-1=REAL", "REAL=cart.shop.io", "PORT-1=9000", "PFX-2=admin", "PORT-2=9100"])
            .with_exposed_port(8000);
        let routes = resolver.resolve(&descriptor, None).unwrap();

        assert_eq!(routes["cart.shop.io"], vec!["10.0.0.9:9000"]);
        assert_eq!(routes["admin.apps.local"], vec!["10.0.0.9:9100"]);
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn test_override_ip_wins() {
        let descriptor = container(&["VHOST=app.example.com", "VHOST_PORT=8080"]);
        let routes = resolver().resolve(&descriptor, Some("192.168.1.20")).unwrap();
        assert_eq!(routes["app.example.com"], vec!["192.168.1.20:8080"]);
    }

    #[test]
    fn test_missing_ip() {
        let descriptor = ContainerDescriptor::new("abc123", "/web")
            .with_env(["VHOST=app.example.com", "VHOST_PORT=80"]);
        let err = resolver().resolve(&descriptor, None).unwrap_err();
        assert_eq!(err, SyncError::NoAddress("abc123".into()));

        let routes = resolver().resolve(&descriptor, Some("10.1.1.1")).unwrap();
        assert_eq!(routes["app.example.com"], vec!["10.1.1.1:80"]);
    }
}
