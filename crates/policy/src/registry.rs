//! Registry of plugins and their endpoint classification.

use crate::{EndpointRef, EndpointSpec, Error, PluginManifest, Result, Visibility};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// The set of registered endpoints and whether each one is public or
/// protected. Static for the lifetime of a run.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    plugins: BTreeMap<String, PluginManifest>,
    endpoints: HashMap<EndpointRef, Visibility>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in plugins already registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let registered = registry.register(PluginManifest::demo());
        debug_assert!(registered.is_ok(), "demo manifest rejected: {registered:?}");
        registry
    }

    /// Register a plugin and all of its endpoints.
    pub fn register(&mut self, manifest: PluginManifest) -> Result<()> {
        manifest.validate()?;
        if self.plugins.contains_key(&manifest.name) {
            return Err(Error::DuplicatePlugin(manifest.name));
        }

        let mut declared = HashMap::new();
        for (endpoint, visibility) in manifest.refs() {
            if declared.insert(endpoint.clone(), visibility).is_some() {
                return Err(Error::DuplicateEndpoint(endpoint.to_string()));
            }
        }

        self.endpoints.extend(declared);
        self.plugins.insert(manifest.name.clone(), manifest);
        Ok(())
    }

    /// Register every `*.toml` manifest in a directory, in file name order.
    ///
    /// Returns the number of plugins registered.
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir.as_ref())? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            self.register(PluginManifest::load(path)?)?;
        }
        Ok(paths.len())
    }

    /// Classify an endpoint. `None` means it is not registered.
    pub fn classify(&self, endpoint: &EndpointRef) -> Option<Visibility> {
        self.endpoints.get(endpoint).copied()
    }

    /// The declaration of a registered endpoint.
    pub fn describe(&self, endpoint: &EndpointRef) -> Option<&EndpointSpec> {
        self.plugins
            .get(&endpoint.plugin)?
            .endpoints
            .iter()
            .find(|spec| EndpointRef::new(&endpoint.plugin, spec.path.as_str()) == *endpoint)
    }

    /// Resolve a routed path (`/{plugin}{path}`) to a registered endpoint.
    pub fn resolve_path(&self, full_path: &str) -> Option<(EndpointRef, Visibility)> {
        let endpoint = EndpointRef::parse(full_path)?;
        let visibility = self.classify(&endpoint)?;
        Some((endpoint, visibility))
    }

    pub fn plugins(&self) -> impl Iterator<Item = &PluginManifest> {
        self.plugins.values()
    }

    /// All endpoints, sorted by plugin then path.
    pub fn endpoints(&self) -> Vec<(EndpointRef, Visibility)> {
        let mut all: Vec<_> = self
            .endpoints
            .iter()
            .map(|(e, v)| (e.clone(), *v))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}
