//! JA4 fingerprints. The module re-dials endpoints that already carry TLS
//! facts, taps the handshake bytes and derives three fingerprints: JA4 from
//! our own ClientHello, JA4S from the ServerHello and JA4X from the leaf
//! certificate. Reference: https://github.com/FoxIO-LLC/ja4

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use situation_core::{run_pool, Config, Module, ModuleError, ScanContext};
use situation_store::Fingerprints;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::dial::handshake;

const CLIENT_HELLO: u8 = 0x01;
const SERVER_HELLO: u8 = 0x02;
const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SIGNATURE_ALGORITHMS: u16 = 0x000d;
const EXT_ALPN: u16 = 0x0010;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

pub struct Ja4Module;

#[async_trait]
impl Module for Ja4Module {
    fn name(&self) -> &'static str {
        "ja4"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["tls"]
    }

    fn bind(&self, config: &mut Config) {
        config.define("ja4.timeout", 1000, "handshake timeout in milliseconds");
        config.define("ja4.width", 16, "max concurrent handshakes");
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let wait = Duration::from_millis(ctx.config.get("ja4.timeout")?);
        let width: usize = ctx.config.get("ja4.width")?;

        let mut probes = Vec::new();
        for ep in ctx.store.endpoints_with_tls_without_fingerprints()? {
            let Ok(addr) = ep.addr.parse::<IpAddr>() else { continue };
            probes.push((ep.id, addr, ep.port));
        }
        if probes.is_empty() {
            return Ok(());
        }

        let store = ctx.store.clone();
        run_pool(width, probes, move |(id, addr, port)| {
            let store = store.clone();
            async move {
                match handshake(addr, port, wait).await {
                    Ok(record) => {
                        let fp = Fingerprints {
                            ja4: ja4(&record.sent).ok(),
                            ja4s: ja4s(&record.received).ok(),
                            ja4x: record
                                .certificates
                                .first()
                                .and_then(|der| X509Certificate::from_der(der).ok())
                                .map(|(_, cert)| ja4x(&cert)),
                        };
                        info!(ip = %addr, port, ja4 = ?fp.ja4, ja4s = ?fp.ja4s, "fingerprints computed");
                        store.set_endpoint_fingerprints(id, &fp)?;
                    }
                    Err(e) => debug!(ip = %addr, port, error = %e, "no handshake capture"),
                }
                Ok(())
            }
        })
        .await;
        Ok(())
    }
}

/// GREASE values all follow the 0x?a?a pattern (RFC 8701).
fn is_grease(value: u16) -> bool {
    (value & 0x0f0f) == 0x0a0a
}

/// JA4 of a raw ClientHello capture, record header included or not.
pub(crate) fn ja4(raw: &[u8]) -> Result<String> {
    let hello = Hello::parse(raw, CLIENT_HELLO)?;

    let ja4_a = format!(
        "t{}{}{:02}{:02}{}",
        hello.version_code(),
        if hello.sni { 'd' } else { 'i' },
        hello.ciphers.len().min(99),
        hello.extensions.len().min(99),
        hello.alpn,
    );

    let mut ciphers = hello.ciphers.clone();
    ciphers.sort_unstable();
    let ja4_b = hash12(&join_hex(&ciphers));

    let mut extensions: Vec<u16> = hello
        .extensions
        .iter()
        .copied()
        .filter(|e| *e != EXT_SERVER_NAME && *e != EXT_ALPN)
        .collect();
    extensions.sort_unstable();
    let mut tail = join_hex(&extensions);
    if !hello.signature_algorithms.is_empty() {
        tail.push('_');
        tail.push_str(&join_hex(&hello.signature_algorithms));
    }
    let ja4_c = hash12(&tail);

    Ok(format!("{ja4_a}_{ja4_b}_{ja4_c}"))
}

/// JA4S of a raw ServerHello capture. The server picks a single cipher and
/// its extensions are hashed in wire order, unsorted.
pub(crate) fn ja4s(raw: &[u8]) -> Result<String> {
    let hello = Hello::parse(raw, SERVER_HELLO)?;

    let ja4s_a = format!(
        "t{}{:02}{}",
        hello.version_code(),
        hello.extensions.len().min(99),
        hello.alpn,
    );
    let ja4s_b = format!("{:04x}", hello.ciphers.first().copied().unwrap_or(0));
    let ja4s_c = hash12(&join_hex(&hello.extensions));

    Ok(format!("{ja4s_a}_{ja4s_b}_{ja4s_c}"))
}

/// JA4X of a certificate: truncated hashes over the issuer RDN OIDs, the
/// subject RDN OIDs and the extension OIDs, hex-encoded in wire order.
pub(crate) fn ja4x(cert: &X509Certificate) -> String {
    let issuer: Vec<String> = cert
        .issuer()
        .iter_attributes()
        .map(|a| hex::encode(a.attr_type().as_bytes()))
        .collect();
    let subject: Vec<String> = cert
        .subject()
        .iter_attributes()
        .map(|a| hex::encode(a.attr_type().as_bytes()))
        .collect();
    let extensions: Vec<String> = cert
        .extensions()
        .iter()
        .map(|e| hex::encode(e.oid.as_bytes()))
        .collect();
    format!(
        "{}_{}_{}",
        hash12(&issuer.join(",")),
        hash12(&subject.join(",")),
        hash12(&extensions.join(","))
    )
}

/// Truncated sha256 over the material string; the empty string hashes to
/// twelve zeros by convention.
fn hash12(material: &str) -> String {
    if material.is_empty() {
        return "0".repeat(12);
    }
    let digest = Sha256::digest(material.as_bytes());
    hex::encode(digest)[..12].to_string()
}

fn join_hex(values: &[u16]) -> String {
    values
        .iter()
        .map(|v| format!("{v:04x}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// What both hello flavours share once parsed, GREASE already filtered out.
struct Hello {
    legacy_version: u16,
    supported_version: u16,
    ciphers: Vec<u16>,
    extensions: Vec<u16>,
    signature_algorithms: Vec<u16>,
    sni: bool,
    alpn: String,
}

impl Hello {
    fn parse(raw: &[u8], expected_type: u8) -> Result<Hello> {
        if raw.is_empty() {
            bail!("empty handshake capture");
        }
        let mut cur = Cursor::new(raw);
        // a TLS record header may or may not precede the handshake message
        if raw[0] == 0x16 {
            cur.take(5)?;
        }
        let typ = cur.u8()?;
        if typ != expected_type {
            bail!("unexpected handshake message type {typ:#04x}");
        }
        cur.take(3)?; // handshake length
        let legacy_version = cur.u16()?;
        cur.take(32)?; // random
        let sid_len = cur.u8()? as usize;
        cur.take(sid_len)?;

        let mut hello = Hello {
            legacy_version,
            supported_version: 0,
            ciphers: Vec::new(),
            extensions: Vec::new(),
            signature_algorithms: Vec::new(),
            sni: false,
            alpn: "00".to_string(),
        };

        if expected_type == CLIENT_HELLO {
            let cipher_bytes = cur.u16()? as usize;
            let mut ciphers = Cursor::new(cur.take(cipher_bytes)?);
            while !ciphers.done() {
                let id = ciphers.u16()?;
                if !is_grease(id) {
                    hello.ciphers.push(id);
                }
            }
            let comp_len = cur.u8()? as usize;
            cur.take(comp_len)?;
        } else {
            hello.ciphers.push(cur.u16()?);
            cur.u8()?; // compression method
        }

        let ext_bytes = cur.u16()? as usize;
        let mut exts = Cursor::new(cur.take(ext_bytes)?);
        while !exts.done() {
            let ext_type = exts.u16()?;
            let ext_len = exts.u16()? as usize;
            let body = exts.take(ext_len)?;
            if is_grease(ext_type) {
                continue;
            }
            hello.extensions.push(ext_type);
            match ext_type {
                EXT_SERVER_NAME => hello.sni = true,
                EXT_ALPN => hello.alpn = parse_alpn(body).unwrap_or_else(|_| "00".to_string()),
                EXT_SUPPORTED_VERSIONS => hello.parse_supported_versions(body, expected_type)?,
                EXT_SIGNATURE_ALGORITHMS => {
                    let mut algs = Cursor::new(body);
                    let len = algs.u16()? as usize;
                    let mut list = Cursor::new(algs.take(len)?);
                    while !list.done() {
                        let alg = list.u16()?;
                        if !is_grease(alg) {
                            hello.signature_algorithms.push(alg);
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(hello)
    }

    /// The client offers a list of versions, the server echoes one.
    fn parse_supported_versions(&mut self, body: &[u8], expected_type: u8) -> Result<()> {
        let mut cur = Cursor::new(body);
        if expected_type == CLIENT_HELLO {
            let len = cur.u8()? as usize;
            let mut list = Cursor::new(cur.take(len)?);
            while !list.done() {
                let v = list.u16()?;
                if !is_grease(v) {
                    self.supported_version = self.supported_version.max(v);
                }
            }
        } else {
            self.supported_version = cur.u16()?;
        }
        Ok(())
    }

    fn version_code(&self) -> &'static str {
        let version = if self.supported_version != 0 {
            self.supported_version
        } else {
            self.legacy_version
        };
        match version {
            0x0304 => "13",
            0x0303 => "12",
            0x0302 => "11",
            0x0301 => "10",
            0x0300 => "s3",
            _ => "00",
        }
    }
}

/// First ALPN entry, reduced to two characters: first and last byte when
/// both are alphanumeric, outer hex nibbles otherwise.
fn parse_alpn(body: &[u8]) -> Result<String> {
    let mut cur = Cursor::new(body);
    let list_len = cur.u16()? as usize;
    let mut list = Cursor::new(cur.take(list_len)?);
    let entry_len = list.u8()? as usize;
    let entry = list.take(entry_len)?;
    if entry.len() < 2 {
        return Ok("00".to_string());
    }
    let (first, last) = (entry[0], entry[entry.len() - 1]);
    if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() {
        Ok(format!("{}{}", first as char, last as char))
    } else {
        Ok(format!("{:x}{:x}", first >> 4, last & 0x0f))
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Cursor { data, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.data.len());
        let Some(end) = end else {
            bail!("handshake capture truncated");
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extension(out: &mut Vec<u8>, typ: u16, body: &[u8]) {
        out.extend_from_slice(&typ.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }

    // A chrome-like ClientHello: 15 ciphers and 16 extensions plus GREASE,
    // SNI, ALPN h2, TLS 1.3 in supported_versions.
    fn chrome_like_hello() -> Vec<u8> {
        let ciphers: &[u16] = &[
            0x0a0a, 0x1301, 0x1302, 0x1303, 0xc02b, 0xc02f, 0xc02c, 0xc030, 0xcca9, 0xcca8,
            0xc013, 0xc014, 0x009c, 0x009d, 0x002f, 0x0035,
        ];
        let mut exts = Vec::new();
        extension(&mut exts, 0x1a1a, &[0x00]); // GREASE
        extension(
            &mut exts,
            0x0000,
            &[0x00, 0x0c, 0x00, 0x00, 0x09, b'l', b'o', b'c', b'a', b'l', b'h', b'o', b's', b't'],
        );
        extension(&mut exts, 0x0017, &[]);
        extension(&mut exts, 0xff01, &[0x00]);
        extension(&mut exts, 0x000a, &[0x00, 0x04, 0x1d, 0x00, 0x17, 0x00]);
        extension(&mut exts, 0x000b, &[0x01, 0x00]);
        extension(&mut exts, 0x0023, &[]);
        extension(
            &mut exts,
            0x0010,
            &[
                0x00, 0x0c, 0x02, b'h', b'2', 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.',
                b'1',
            ],
        );
        extension(&mut exts, 0x0005, &[0x01, 0x00, 0x00, 0x00, 0x00]);
        extension(
            &mut exts,
            0x000d,
            &[
                0x00, 0x10, 0x04, 0x03, 0x08, 0x04, 0x04, 0x01, 0x05, 0x03, 0x08, 0x05, 0x05,
                0x01, 0x08, 0x06, 0x06, 0x01,
            ],
        );
        extension(&mut exts, 0x0012, &[]);
        extension(&mut exts, 0x0033, &[0x00, 0x02, 0x1d, 0x00]);
        extension(&mut exts, 0x002d, &[0x01, 0x01]);
        extension(&mut exts, 0x002b, &[0x06, 0x3a, 0x3a, 0x03, 0x04, 0x03, 0x03]);
        extension(&mut exts, 0x001b, &[0x02, 0x00, 0x02]);
        extension(&mut exts, 0x0015, &[0x00, 0x00]);
        extension(&mut exts, 0x4469, &[]);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // legacy version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(32); // session id
        body.extend_from_slice(&[0u8; 32]);
        body.extend_from_slice(&((ciphers.len() * 2) as u16).to_be_bytes());
        for c in ciphers {
            body.extend_from_slice(&c.to_be_bytes());
        }
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hello = vec![CLIENT_HELLO];
        hello.push(0);
        hello.extend_from_slice(&(body.len() as u16).to_be_bytes());
        hello.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(hello.len() as u16).to_be_bytes());
        record.extend_from_slice(&hello);
        record
    }

    fn minimal_server_hello() -> Vec<u8> {
        let mut exts = Vec::new();
        extension(&mut exts, 0x002b, &[0x03, 0x04]);
        extension(&mut exts, 0x0033, &[0x00, 0x02, 0x1d, 0x00]);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]);
        body.extend_from_slice(&[0u8; 32]);
        body.push(0); // no session id
        body.extend_from_slice(&[0x13, 0x01]); // chosen cipher
        body.push(0); // null compression
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hello = vec![SERVER_HELLO, 0];
        hello.extend_from_slice(&(body.len() as u16).to_be_bytes());
        hello.extend_from_slice(&body);
        hello
    }

    #[test]
    fn a_chrome_like_hello_matches_the_published_fingerprint() {
        let fp = ja4(&chrome_like_hello()).unwrap();
        assert_eq!(fp, "t13d1516h2_8daaf6152771_02713d6af862");
    }

    #[test]
    fn a_server_hello_yields_a_ja4s() {
        let fp = ja4s(&minimal_server_hello()).unwrap();
        assert!(fp.starts_with("t130200_1301_"), "{fp}");
        assert_eq!(fp.len(), "t130200_1301_".len() + 12);
    }

    #[test]
    fn empty_captures_are_rejected() {
        assert!(ja4(&[]).is_err());
        assert!(ja4s(&[]).is_err());
    }

    #[test]
    fn an_extensions_length_overrun_is_rejected() {
        let mut hello = chrome_like_hello();
        let n = hello.len();
        // the extensions block length now points past the end of the capture
        hello.truncate(n - 4);
        assert!(ja4(&hello).is_err());
    }

    #[test]
    fn a_server_hello_is_not_a_client_hello() {
        assert!(ja4(&minimal_server_hello()).is_err());
        assert!(ja4s(&chrome_like_hello()).is_err());
    }

    #[test]
    fn grease_values_follow_the_0a0a_pattern() {
        for v in [0x0a0a, 0x1a1a, 0x3a3a, 0xfafa] {
            assert!(is_grease(v));
        }
        assert!(!is_grease(0x1301));
        assert!(!is_grease(0x0017));
    }

    #[test]
    fn alpn_entries_shrink_to_two_characters() {
        // list len, entry len, entry
        assert_eq!(parse_alpn(&[0x00, 0x03, 0x02, b'h', b'2']).unwrap(), "h2");
        assert_eq!(
            parse_alpn(&[0x00, 0x09, 0x08, b'h', b't', b't', b'p', b'/', b'1', b'.', b'1'])
                .unwrap(),
            "h1"
        );
        assert_eq!(parse_alpn(&[0x00, 0x02, 0x01, b'x']).unwrap(), "00");
        // non-printable bytes fall back to the outer hex nibbles
        assert_eq!(parse_alpn(&[0x00, 0x03, 0x02, 0x01, 0x78]).unwrap(), "08");
    }

    #[test]
    fn the_empty_material_hashes_to_zeros() {
        assert_eq!(hash12(""), "000000000000");
        assert_eq!(hash12("002f").len(), 12);
    }
}
