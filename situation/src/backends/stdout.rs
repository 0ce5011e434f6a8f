use anyhow::Result;
use async_trait::async_trait;
use situation_core::Config;
use situation_store::Payload;

use super::{render, Backend, JSON_FORMAT};

/// Prints the payload on stdout, one document per scan.
pub struct StdoutBackend {
    format: String,
}

impl Default for StdoutBackend {
    fn default() -> Self {
        StdoutBackend {
            format: JSON_FORMAT.to_string(),
        }
    }
}

#[async_trait]
impl Backend for StdoutBackend {
    fn name(&self) -> &'static str {
        "stdout"
    }

    fn init(&mut self, config: &Config) -> Result<()> {
        self.format = config.get_string("backends.stdout.format")?;
        Ok(())
    }

    async fn write(&mut self, payload: &Payload) -> Result<()> {
        let bytes = render(&self.format, payload)?;
        println!("{}", String::from_utf8_lossy(&bytes));
        Ok(())
    }
}
