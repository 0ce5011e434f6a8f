use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use situation_core::Config;
use situation_store::Payload;
use tracing::{info, warn};

use super::Backend;

/// POSTs (or PUTs) the payload as JSON to a collector endpoint.
pub struct HttpBackend {
    url: String,
    method: Method,
    headers: HeaderMap,
    client: Option<reqwest::Client>,
}

impl Default for HttpBackend {
    fn default() -> Self {
        HttpBackend {
            url: String::new(),
            method: Method::POST,
            headers: HeaderMap::new(),
            client: None,
        }
    }
}

/// Reads `KEY=VALUE,KEY2=VALUE2` pairs; malformed items are skipped.
fn parse_extra_headers(spec: &str) -> Vec<(String, String)> {
    spec.split(',')
        .filter_map(|item| {
            let (key, value) = item.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn init(&mut self, config: &Config) -> Result<()> {
        self.url = config.get_string("backends.http.url")?;
        if reqwest::Url::parse(&self.url).is_err() {
            bail!("malformed http backend url: {}", self.url);
        }

        let method = config.get_string("backends.http.method")?;
        self.method = match method.as_str() {
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            other => {
                warn!(method = other, "unsupported http method, falling back to POST");
                Method::POST
            }
        };

        // extra headers first, the named options win
        for (key, value) in parse_extra_headers(&config.get_string("backends.http.extra-headers")?) {
            if let (Ok(name), Ok(value)) =
                (HeaderName::try_from(key.as_str()), HeaderValue::try_from(value.as_str()))
            {
                self.headers.insert(name, value);
            }
        }
        let content_type = config.get_string("backends.http.content-type")?;
        self.headers
            .insert(reqwest::header::CONTENT_TYPE, HeaderValue::try_from(content_type.as_str())?);
        let authorization = config.get_string("backends.http.authorization")?;
        if !authorization.is_empty() {
            self.headers.insert(
                reqwest::header::AUTHORIZATION,
                HeaderValue::try_from(authorization.as_str())?,
            );
        }

        self.client = Some(reqwest::Client::new());
        Ok(())
    }

    async fn write(&mut self, payload: &Payload) -> Result<()> {
        let Some(client) = self.client.as_ref() else {
            bail!("http backend not initialized");
        };
        let body = serde_json::to_vec(payload)?;
        let resp = client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        match status.as_u16() {
            200 | 201 => {
                info!(url = %self.url, status = status.as_u16(), "payload sent");
                Ok(())
            }
            _ => {
                let mut body = resp.text().await.unwrap_or_default();
                body.truncate(512);
                bail!("unexpected status code {status}: {body}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_headers_parse_as_pairs() {
        let pairs = parse_extra_headers("X-Tenant=acme,X-Env=prod");
        assert_eq!(
            pairs,
            vec![
                ("X-Tenant".to_string(), "acme".to_string()),
                ("X-Env".to_string(), "prod".to_string()),
            ]
        );
        assert!(parse_extra_headers("").is_empty());
        assert!(parse_extra_headers("garbage").is_empty());
    }

    #[test]
    fn init_rejects_malformed_urls() {
        let mut cfg = Config::new();
        crate::backends::bind(&mut cfg);
        cfg.set_flag("backends.http.url", "not a url");
        let mut backend = HttpBackend::default();
        assert!(backend.init(&cfg).is_err());
    }

    #[test]
    fn init_collects_the_headers() {
        let mut cfg = Config::new();
        crate::backends::bind(&mut cfg);
        cfg.set_flag("backends.http.authorization", "Agent test.key");
        cfg.set_flag("backends.http.extra-headers", "X-Tenant=acme");
        let mut backend = HttpBackend::default();
        backend.init(&cfg).unwrap();
        assert_eq!(backend.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(backend.headers.get("authorization").unwrap(), "Agent test.key");
        assert_eq!(backend.headers.get("x-tenant").unwrap(), "acme");
        assert_eq!(backend.method, Method::POST);
    }
}
