//! Decoder for the rpm header blobs found in the `Packages` table of
//! `rpmdb.sqlite`.
//!
//! A blob starts with a big-endian index count; the 16-byte index entries
//! (tag, type, offset, count) follow, then the data store all offsets are
//! relative to.

use situation_store::Package;

use crate::manager::keep_leaves;

const TYPE_STRING: u32 = 6;
const TYPE_STRING_ARRAY: u32 = 8;
const TYPE_I18NSTRING: u32 = 9;
const TYPE_INT32: u32 = 4;

const TAG_NAME: u32 = 1000;
const TAG_VERSION: u32 = 1001;
const TAG_RELEASE: u32 = 1002;
const TAG_VENDOR: u32 = 1011;
const TAG_DIRINDEXES: u32 = 1116;
const TAG_BASENAMES: u32 = 1117;
const TAG_DIRNAMES: u32 = 1118;

/// Decodes one header blob into a Package. Malformed blobs yield None
/// rather than an error, the caller just skips the row.
pub(crate) fn parse_package_blob(blob: &[u8]) -> Option<Package> {
    let n_index = be_u32(blob.get(0..4)?)? as usize;
    let store = blob.get(8 + 16 * n_index..)?;

    let mut pkg = Package::default();
    let mut release = String::new();
    let mut basenames: Vec<String> = Vec::new();
    let mut dirnames: Vec<String> = Vec::new();
    let mut dirindexes: Vec<u32> = Vec::new();

    for i in 0..n_index {
        let entry = blob.get(8 + 16 * i..8 + 16 * (i + 1))?;
        let tag = be_u32(&entry[0..4])?;
        let typ = be_u32(&entry[4..8])?;
        let off = be_u32(&entry[8..12])? as usize;
        let cnt = be_u32(&entry[12..16])? as usize;

        match tag {
            TAG_NAME if typ == TYPE_STRING => pkg.name = string_at(store, off)?,
            TAG_VERSION if typ == TYPE_STRING => pkg.version = string_at(store, off)?,
            TAG_RELEASE if typ == TYPE_STRING => release = string_at(store, off)?,
            TAG_VENDOR if typ == TYPE_STRING => pkg.vendor = string_at(store, off)?,
            TAG_BASENAMES if is_string_array(typ) => {
                basenames = string_array_at(store, off, cnt)?
            }
            TAG_DIRNAMES if is_string_array(typ) => dirnames = string_array_at(store, off, cnt)?,
            TAG_DIRINDEXES if typ == TYPE_INT32 => dirindexes = u32_array_at(store, off, cnt)?,
            _ => {}
        }
    }

    if pkg.name.is_empty() {
        return None;
    }
    if !release.is_empty() {
        pkg.version = format!("{}-{}", pkg.version, release);
    }
    if !basenames.is_empty() && !dirnames.is_empty() && dirindexes.len() == basenames.len() {
        let mut files = Vec::with_capacity(basenames.len());
        for (base, dir) in basenames.iter().zip(&dirindexes) {
            let dir = dirnames.get(*dir as usize)?;
            files.push(format!("{}{}", dir, base));
        }
        pkg.files = keep_leaves(files);
    }
    Some(pkg)
}

/// Install timestamp from the `Installtid` key: a little-endian uint32 in
/// the first four bytes.
pub(crate) fn parse_install_key(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 4] = key.get(0..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes) as i64)
}

fn is_string_array(typ: u32) -> bool {
    typ == TYPE_STRING_ARRAY || typ == TYPE_I18NSTRING
}

fn be_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}

fn string_at(store: &[u8], off: usize) -> Option<String> {
    let tail = store.get(off..)?;
    let end = tail.iter().position(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&tail[..end]).into_owned())
}

fn string_array_at(store: &[u8], off: usize, cnt: usize) -> Option<Vec<String>> {
    let mut out = Vec::with_capacity(cnt);
    let mut pos = off;
    for _ in 0..cnt {
        let s = string_at(store, pos)?;
        pos += s.len() + 1;
        out.push(s);
    }
    Some(out)
}

fn u32_array_at(store: &[u8], off: usize, cnt: usize) -> Option<Vec<u32>> {
    let mut out = Vec::with_capacity(cnt);
    for i in 0..cnt {
        out.push(be_u32(store.get(off + 4 * i..off + 4 * (i + 1))?)?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BlobBuilder {
        index: Vec<u8>,
        store: Vec<u8>,
        entries: u32,
    }

    impl BlobBuilder {
        fn new() -> Self {
            BlobBuilder {
                index: Vec::new(),
                store: Vec::new(),
                entries: 0,
            }
        }

        fn entry(&mut self, tag: u32, typ: u32, cnt: u32) {
            self.index.extend_from_slice(&tag.to_be_bytes());
            self.index.extend_from_slice(&typ.to_be_bytes());
            self.index.extend_from_slice(&(self.store.len() as u32).to_be_bytes());
            self.index.extend_from_slice(&cnt.to_be_bytes());
            self.entries += 1;
        }

        fn string(&mut self, tag: u32, value: &str) {
            self.entry(tag, TYPE_STRING, 1);
            self.store.extend_from_slice(value.as_bytes());
            self.store.push(0);
        }

        fn string_array(&mut self, tag: u32, values: &[&str]) {
            self.entry(tag, TYPE_STRING_ARRAY, values.len() as u32);
            for v in values {
                self.store.extend_from_slice(v.as_bytes());
                self.store.push(0);
            }
        }

        fn u32_array(&mut self, tag: u32, values: &[u32]) {
            self.entry(tag, TYPE_INT32, values.len() as u32);
            for v in values {
                self.store.extend_from_slice(&v.to_be_bytes());
            }
        }

        fn build(self) -> Vec<u8> {
            let mut blob = Vec::new();
            blob.extend_from_slice(&self.entries.to_be_bytes());
            blob.extend_from_slice(&(self.store.len() as u32).to_be_bytes());
            blob.extend_from_slice(&self.index);
            blob.extend_from_slice(&self.store);
            blob
        }
    }

    #[test]
    fn a_full_header_decodes() {
        let mut b = BlobBuilder::new();
        b.string(TAG_NAME, "openssh-server");
        b.string(TAG_VERSION, "9.6p1");
        b.string(TAG_RELEASE, "3.fc40");
        b.string(TAG_VENDOR, "Fedora Project");
        b.string_array(TAG_BASENAMES, &["sshd", "sshd_config"]);
        b.string_array(TAG_DIRNAMES, &["/usr/sbin/", "/etc/ssh/"]);
        b.u32_array(TAG_DIRINDEXES, &[0, 1]);

        let pkg = parse_package_blob(&b.build()).unwrap();
        assert_eq!(pkg.name, "openssh-server");
        assert_eq!(pkg.version, "9.6p1-3.fc40");
        assert_eq!(pkg.vendor, "Fedora Project");
        assert_eq!(
            pkg.files,
            vec!["/etc/ssh/sshd_config".to_string(), "/usr/sbin/sshd".to_string()]
        );
    }

    #[test]
    fn mismatched_file_triples_leave_files_empty() {
        let mut b = BlobBuilder::new();
        b.string(TAG_NAME, "broken");
        b.string_array(TAG_BASENAMES, &["a", "b"]);
        b.string_array(TAG_DIRNAMES, &["/x/"]);
        b.u32_array(TAG_DIRINDEXES, &[0]); // 1 index for 2 basenames

        let pkg = parse_package_blob(&b.build()).unwrap();
        assert!(pkg.files.is_empty());
    }

    #[test]
    fn truncated_blobs_are_rejected() {
        assert!(parse_package_blob(&[]).is_none());
        assert!(parse_package_blob(&[0, 0, 0, 5, 0, 0, 0, 0]).is_none());
        // an index entry pointing past the store
        let mut b = BlobBuilder::new();
        b.entry(TAG_NAME, TYPE_STRING, 1); // no store bytes written
        assert!(parse_package_blob(&b.build()).is_none());
    }

    #[test]
    fn install_keys_are_little_endian() {
        assert_eq!(parse_install_key(&[0x4e, 0x61, 0xbc, 0x00, 9, 9]), Some(0x00bc614e));
        assert_eq!(parse_install_key(&[1, 2]), None);
    }
}
