use std::fs::File;
use std::io::Write as _;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use situation_core::Config;
use situation_store::Payload;
use tracing::info;

use super::{render, Backend, JSON_FORMAT};

/// Writes the payload to a file, truncated at init so the file always holds
/// the latest scan.
pub struct FileBackend {
    format: String,
    path: String,
    file: Option<File>,
}

impl Default for FileBackend {
    fn default() -> Self {
        FileBackend {
            format: JSON_FORMAT.to_string(),
            path: "situation.json".to_string(),
            file: None,
        }
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn init(&mut self, config: &Config) -> Result<()> {
        self.format = config.get_string("backends.file.format")?;
        self.path = config.get_string("backends.file.path")?;
        info!(path = %self.path, "opening output file");
        let file = File::create(&self.path).with_context(|| format!("cannot create {}", self.path))?;
        self.file = Some(file);
        Ok(())
    }

    async fn write(&mut self, payload: &Payload) -> Result<()> {
        let bytes = render(&self.format, payload)?;
        let Some(file) = self.file.as_mut() else {
            anyhow::bail!("file backend not initialized");
        };
        file.write_all(&bytes)?;
        info!(path = %self.path, "payload written");
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::empty_payload;

    #[tokio::test]
    async fn writes_json_to_the_configured_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let mut cfg = Config::new();
        crate::backends::bind(&mut cfg);
        cfg.set_flag("backends.file.path", path.to_str().unwrap());

        let mut backend = FileBackend::default();
        backend.init(&cfg).unwrap();
        backend.write(&empty_payload()).await.unwrap();
        backend.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(doc.get("machines").unwrap().is_array());
        assert!(doc.get("extra").unwrap().get("agent").is_some());
    }

    #[tokio::test]
    async fn init_truncates_a_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        std::fs::write(&path, "leftover from an older scan").unwrap();
        let mut cfg = Config::new();
        crate::backends::bind(&mut cfg);
        cfg.set_flag("backends.file.path", path.to_str().unwrap());

        let mut backend = FileBackend::default();
        backend.init(&cfg).unwrap();
        backend.close().unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
