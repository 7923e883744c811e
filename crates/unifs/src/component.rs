//! Named filesystem handles for a host application.
//!
//! A service usually needs one filesystem, sometimes several (uploads on
//! S3, scratch space on local disk). [`FilesystemComponent`] keeps them
//! under names so the rest of the application asks for `"uploads"` instead
//! of threading adapters through every constructor.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::factory::{create_filesystem, create_filesystem_from_env, create_filesystem_from_value};
use crate::fs::Filesystem;

/// Name of the handle returned by [`FilesystemComponent::filesystem`].
pub const DEFAULT_NAME: &str = "default";

/// Registry of named filesystem handles.
#[derive(Clone, Default)]
pub struct FilesystemComponent {
    handles: BTreeMap<String, Arc<dyn Filesystem>>,
}

impl FilesystemComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Component whose default handle is configured from the environment.
    pub fn from_env() -> Result<Self> {
        let mut component = Self::new();
        component.register_handle(DEFAULT_NAME, create_filesystem_from_env()?)?;
        Ok(component)
    }

    /// Validate `config`, build the filesystem and register it under `name`,
    /// replacing any previous handle with that name.
    pub fn register(&mut self, name: &str, config: Config) -> Result<Arc<dyn Filesystem>> {
        check_name(name)?;
        let backend = config.backend_type();
        let handle = create_filesystem(config)?;
        tracing::debug!(name, %backend, "registered filesystem");
        self.handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Like [`register`](Self::register) for a raw configuration value.
    pub fn register_value(&mut self, name: &str, raw: &Value) -> Result<Arc<dyn Filesystem>> {
        check_name(name)?;
        let handle = create_filesystem_from_value(raw)?;
        tracing::debug!(name, "registered filesystem");
        self.handles.insert(name.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Register an existing handle. Returns the handle it replaced.
    pub fn register_handle(
        &mut self,
        name: &str,
        handle: Arc<dyn Filesystem>,
    ) -> Result<Option<Arc<dyn Filesystem>>> {
        check_name(name)?;
        Ok(self.handles.insert(name.to_string(), handle))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Filesystem>> {
        self.handles.get(name).cloned()
    }

    /// The handle registered as `"default"`.
    pub fn filesystem(&self) -> Option<Arc<dyn Filesystem>> {
        self.get(DEFAULT_NAME)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.handles.keys().cloned().collect()
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<dyn Filesystem>> {
        self.handles.remove(name)
    }
}

fn check_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::validation("filesystem name must not be empty"));
    }
    Ok(())
}

impl fmt::Debug for FilesystemComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilesystemComponent")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn registers_and_resolves_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut component = FilesystemComponent::new();
        component
            .register(DEFAULT_NAME, Config::local(dir.path()))
            .unwrap();
        component
            .register_value(
                "scratch",
                &json!({ "type": "local", "local": { "basePath": dir.path() } }),
            )
            .unwrap();
        assert_eq!(component.names(), vec!["default", "scratch"]);

        component
            .filesystem()
            .unwrap()
            .write_file("a.txt", b"shared")
            .await
            .unwrap();
        let scratch = component.get("scratch").unwrap();
        assert_eq!(scratch.read_file("a.txt").await.unwrap(), b"shared");
        assert!(component.get("missing").is_none());
    }

    #[test]
    fn invalid_config_registers_nothing() {
        let mut component = FilesystemComponent::new();
        let err = component
            .register("bad", Config::s3("", "us-east-1"))
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(component.names().is_empty());
        assert!(component.filesystem().is_none());
    }

    #[test]
    fn empty_names_are_rejected() {
        let mut component = FilesystemComponent::new();
        assert!(component.register(" ", Config::local(".")).is_err());
    }

    #[test]
    fn replacing_a_handle_returns_the_old_one() {
        let mut component = FilesystemComponent::new();
        let first = create_filesystem(Config::local(".")).unwrap();
        let second = create_filesystem(Config::local(".")).unwrap();
        assert!(component.register_handle("x", first).unwrap().is_none());
        assert!(component.register_handle("x", second).unwrap().is_some());
        assert!(component.remove("x").is_some());
        assert!(component.names().is_empty());
    }

    #[test]
    fn default_component_is_empty() {
        let component = FilesystemComponent::default();
        assert!(component.names().is_empty());
        assert!(component.filesystem().is_none());
        assert_eq!(format!("{:?}", component), "FilesystemComponent { names: [] }");
    }
}
