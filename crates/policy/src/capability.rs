//! Endpoints and the plugin manifests that declare them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Whether an endpoint requires consent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// No authorization required.
    Public,
    /// Requires a resolved consent decision.
    #[default]
    Protected,
}

/// A capability hosted by the daemon: a path within a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointRef {
    pub plugin: String,
    pub path: String,
}

impl EndpointRef {
    pub fn new(plugin: impl Into<String>, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        Self {
            plugin: plugin.into(),
            path,
        }
    }

    /// Split a routed path (`/{plugin}{path}`) into its parts.
    pub fn parse(full_path: &str) -> Option<Self> {
        let trimmed = full_path.strip_prefix('/')?;
        let (plugin, rest) = trimmed.split_once('/')?;
        if plugin.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self::new(plugin, format!("/{rest}")))
    }

    /// The path the endpoint is routed at.
    pub fn full_path(&self) -> String {
        format!("/{}{}", self.plugin, self.path)
    }
}

impl fmt::Display for EndpointRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}{}", self.plugin, self.path)
    }
}

/// One endpoint declared by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    /// Opaque reference to the handler the transport dispatches to.
    #[serde(default)]
    pub handler: String,

    #[serde(default)]
    pub visibility: Visibility,

    #[serde(default)]
    pub description: String,

    /// Permission labels shown to the approver.
    #[serde(default)]
    pub permissions: Vec<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl EndpointSpec {
    pub fn new(path: impl Into<String>, handler: impl Into<String>, visibility: Visibility) -> Self {
        Self {
            path: path.into(),
            method: default_method(),
            handler: handler.into(),
            visibility,
            description: String::new(),
            permissions: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_permissions(mut self, permissions: &[&str]) -> Self {
        self.permissions = permissions.iter().map(|p| p.to_string()).collect();
        self
    }
}

/// A plugin, described as data: a name, a version and its endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, rename = "endpoint")]
    pub endpoints: Vec<EndpointSpec>,
}

impl PluginManifest {
    /// Load a manifest from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse a manifest from a TOML string.
    pub fn parse(toml: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(toml).map_err(|e| Error::Parse(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Invalid(format!(
                "plugin name must be non-empty and contain no '/': {:?}",
                self.name
            )));
        }
        for endpoint in &self.endpoints {
            if endpoint.path.trim_matches('/').is_empty() {
                return Err(Error::Invalid(format!(
                    "plugin {} declares an endpoint with an empty path",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// Endpoint references with their visibility.
    pub fn refs(&self) -> impl Iterator<Item = (EndpointRef, Visibility)> + '_ {
        self.endpoints
            .iter()
            .map(|e| (EndpointRef::new(&self.name, &e.path), e.visibility))
    }

    /// The built-in demo plugin.
    pub fn demo() -> Self {
        Self {
            name: "demo".to_string(),
            version: "1.0.0".to_string(),
            description: "Built-in demo plugin for testing and documentation".to_string(),
            endpoints: vec![
                EndpointSpec::new("/ping", "demo.ping", Visibility::Public)
                    .with_description("Simple ping endpoint"),
                EndpointSpec::new("/echo", "demo.echo", Visibility::Public)
                    .with_method("POST")
                    .with_description("Echo back the request body"),
                EndpointSpec::new("/time", "demo.time", Visibility::Public)
                    .with_description("Get current server time"),
                EndpointSpec::new("/system-info", "demo.system_info", Visibility::Protected)
                    .with_description("Get system information")
                    .with_permissions(&["read:system"]),
                EndpointSpec::new("/execute", "demo.execute", Visibility::Protected)
                    .with_method("POST")
                    .with_description("Execute an allowlisted command")
                    .with_permissions(&["execute:command"]),
            ],
        }
    }
}
