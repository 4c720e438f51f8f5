use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Layout of the topology tree inside the coordination store
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root under which every entity collection lives (`{root}/hosts`, ...)
    #[serde(default = "default_root_path")]
    pub root_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_path: default_root_path(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.root_path.starts_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "store.root_path must be absolute, got {:?}",
                self.root_path
            ))));
        }

        if self.root_path.len() > 1 && self.root_path.ends_with('/') {
            return Err(Error::Config(ConfigError::Message(format!(
                "store.root_path must not end with '/', got {:?}",
                self.root_path
            ))));
        }

        Ok(())
    }

    /// Path of a named collection under the root
    pub fn collection(
        &self,
        name: &str,
    ) -> String {
        if self.root_path == "/" {
            format!("/{name}")
        } else {
            format!("{}/{}", self.root_path, name)
        }
    }
}

fn default_root_path() -> String {
    "/midonet/v1".to_string()
}
