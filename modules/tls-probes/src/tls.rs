use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use situation_core::{run_pool, Config, Module, ModuleError, ScanContext};
use situation_store::TlsInfo;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

use crate::dial::handshake;

/// Ports where a TLS handshake is worth trying: https, smtps, imaps, pop3s,
/// ldaps and the global catalog, implicit ftps and its data channel, DNS
/// over TLS, quic, amqps, secure mqtt, irc over TLS, oracle tcps.
pub(crate) const TLS_PORTS: &[u16] = &[
    443, 465, 993, 995, 636, 3269, 990, 989, 853, 4433, 5671, 8883, 6697, 2484,
];

/// Enriches TCP endpoints on well-known TLS ports with the facts of the
/// leaf certificate the server presents: subject, issuer, validity window,
/// serial, algorithms, fingerprints and DNS names. Verification is
/// deliberately off, an invalid certificate is still an observation.
pub struct TlsModule;

#[async_trait]
impl Module for TlsModule {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["snmp"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("tls.timeout", 1000, "handshake timeout in milliseconds");
        config.define("tls.width", 16, "max concurrent handshakes");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let wait = Duration::from_millis(ctx.config.get("tls.timeout")?);
        let width: usize = ctx.config.get("tls.width")?;

        let mut probes = Vec::new();
        for ep in ctx.store.endpoints_with_ports(TLS_PORTS)? {
            if ep.tls.is_some() {
                continue;
            }
            let Ok(addr) = ep.addr.parse::<IpAddr>() else { continue };
            if addr.is_unspecified() {
                continue;
            }
            probes.push((ep.id, addr, ep.port));
        }
        if probes.is_empty() {
            return Ok(());
        }

        let store = ctx.store.clone();
        run_pool(width, probes, move |(id, addr, port)| {
            let store = store.clone();
            async move {
                match probe(addr, port, wait).await {
                    Ok(tls) => {
                        info!(ip = %addr, port, dns = ?tls.dns_names, "TLS information retrieved");
                        store.set_endpoint_tls(id, &tls)?;
                    }
                    // closed ports and plaintext services land here
                    Err(e) => debug!(ip = %addr, port, error = %e, "no TLS info"),
                }
                Ok(())
            }
        })
        .await;
        Ok(())
    }
}

async fn probe(addr: IpAddr, port: u16, wait: Duration) -> anyhow::Result<TlsInfo> {
    let record = handshake(addr, port, wait).await?;
    let Some(leaf) = record.certificates.first() else {
        bail!("no certificates presented");
    };
    certificate_facts(leaf)
}

fn certificate_facts(der: &[u8]) -> anyhow::Result<TlsInfo> {
    let (_, cert) = X509Certificate::from_der(der).context("certificate parse")?;

    let mut dns_names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                dns_names.push(dns.to_string());
            }
        }
    }

    Ok(TlsInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: cert.validity().not_before.to_datetime().format(&Rfc3339)?,
        not_after: cert.validity().not_after.to_datetime().format(&Rfc3339)?,
        serial: colon_hex(cert.raw_serial()),
        signature_algorithm: algorithm_name(&cert.signature_algorithm.algorithm),
        public_key_algorithm: algorithm_name(&cert.public_key().algorithm.algorithm),
        sha1: colon_hex(&Sha1::digest(der)),
        sha256: colon_hex(&Sha256::digest(der)),
        dns_names,
    })
}

fn algorithm_name(oid: &x509_parser::der_parser::Oid) -> String {
    x509_parser::objects::oid2sn(oid, x509_parser::objects::oid_registry())
        .unwrap_or("unknown")
        .to_string()
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_use_colon_separated_hex() {
        assert_eq!(colon_hex(&[0xde, 0xad, 0x01]), "de:ad:01");
        assert_eq!(colon_hex(&[0x00]), "00");
        assert_eq!(colon_hex(&[]), "");
    }

    #[test]
    fn the_port_list_has_no_duplicates() {
        let mut ports = TLS_PORTS.to_vec();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), TLS_PORTS.len());
        assert!(TLS_PORTS.contains(&443));
        assert!(TLS_PORTS.contains(&853));
    }
}
