//! Output backends. Every enabled backend receives the full payload after
//! each scan; a backend failure is logged and joined, it never aborts the
//! scan loop.

mod file;
mod http;
mod stdout;

pub use file::FileBackend;
pub use http::HttpBackend;
pub use stdout::StdoutBackend;

use anyhow::Result;
use async_trait::async_trait;
use situation_core::{join_errors, Config};
use situation_store::Payload;

pub(crate) const JSON_FORMAT: &str = "json";
pub(crate) const YAML_FORMAT: &str = "yaml";

#[async_trait]
pub trait Backend: Send {
    fn name(&self) -> &'static str;

    fn init(&mut self, config: &Config) -> Result<()>;

    async fn write(&mut self, payload: &Payload) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub fn bind(config: &mut Config) {
    config.define("backends.stdout.enabled", true, "enable the stdout backend");
    config.define("backends.stdout.format", JSON_FORMAT, "output format (json or yaml)");
    config.define("backends.file.enabled", false, "enable the file backend");
    config.define("backends.file.format", JSON_FORMAT, "output format (json or yaml)");
    config.define("backends.file.path", "situation.json", "output file");
    config.define("backends.http.enabled", false, "enable the http backend");
    config.define(
        "backends.http.url",
        "http://localhost:8000/import/situation/",
        "endpoint to send data",
    );
    config.define("backends.http.method", "POST", "http method to send data (POST or PUT)");
    config.define("backends.http.content-type", "application/json", "Content-Type header");
    config.define("backends.http.authorization", "", "Authorization header");
    config.define(
        "backends.http.extra-headers",
        "",
        "extra headers, comma separated KEY=VALUE pairs",
    );
}

/// Instantiates the enabled backends and runs their init. An init failure
/// is fatal: better to refuse the scan than to lose its output.
pub fn init_all(config: &Config) -> Result<Vec<Box<dyn Backend>>> {
    let mut out: Vec<Box<dyn Backend>> = Vec::new();
    if config.get("backends.stdout.enabled")? {
        out.push(Box::new(StdoutBackend::default()));
    }
    if config.get("backends.file.enabled")? {
        out.push(Box::new(FileBackend::default()));
    }
    if config.get("backends.http.enabled")? {
        out.push(Box::new(HttpBackend::default()));
    }
    for backend in &mut out {
        backend.init(config)?;
    }
    Ok(out)
}

pub async fn write_all(backends: &mut [Box<dyn Backend>], payload: &Payload) -> Result<()> {
    let mut errors = Vec::new();
    for backend in backends.iter_mut() {
        if let Err(e) = backend.write(payload).await {
            errors.push(e.context(format!("backend {} failed to write", backend.name())));
        }
    }
    match join_errors(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub fn close_all(backends: &mut [Box<dyn Backend>]) -> Result<()> {
    let mut errors = Vec::new();
    for backend in backends.iter_mut() {
        if let Err(e) = backend.close() {
            errors.push(e.context(format!("backend {} failed to close", backend.name())));
        }
    }
    match join_errors(errors) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

pub(crate) fn render(format: &str, payload: &Payload) -> Result<Vec<u8>> {
    match format {
        YAML_FORMAT => Ok(serde_yaml::to_string(payload)?.into_bytes()),
        _ => Ok(serde_json::to_vec(payload)?),
    }
}

#[cfg(test)]
pub(crate) fn empty_payload() -> Payload {
    use situation_store::{PayloadExtra, Perfs};
    Payload {
        machines: vec![],
        extra: PayloadExtra {
            agent: uuid::Uuid::nil(),
            version: situation_core::version().to_string(),
            duration: 0,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            errors: vec![],
            perfs: Perfs::default(),
        },
    }
}
