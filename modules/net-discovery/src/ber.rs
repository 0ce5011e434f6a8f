//! Hand-rolled BER, just the subset SNMP v2c needs: GetRequest/GetNextRequest
//! encoding and GetResponse decoding.

use anyhow::{bail, Result};

const TAG_INT: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQ: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB: u8 = 0x82;
const TAG_GET_REQUEST: u8 = 0xa0;
const TAG_GET_NEXT_REQUEST: u8 = 0xa1;
const TAG_GET_RESPONSE: u8 = 0xa2;

const VERSION_2C: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Counter(u64),
    Bytes(Vec<u8>),
    Oid(Vec<u32>),
    IpAddress([u8; 4]),
    Null,
    EndOfMib,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: Vec<u32>,
    pub value: Value,
}

#[derive(Debug)]
pub struct Response {
    pub request_id: i64,
    pub error_status: i64,
    pub varbinds: Vec<VarBind>,
}

/// Encodes a v2c GetRequest (or GetNextRequest) for a single OID.
pub fn encode_request(community: &str, request_id: i64, oid: &[u32], next: bool) -> Vec<u8> {
    let mut varbind = Vec::new();
    push_tlv(&mut varbind, TAG_OID, &encode_oid(oid));
    push_tlv(&mut varbind, TAG_NULL, &[]);
    let mut vbl = Vec::new();
    push_tlv(&mut vbl, TAG_SEQ, &varbind);

    let mut pdu = Vec::new();
    push_tlv(&mut pdu, TAG_INT, &encode_int(request_id));
    push_tlv(&mut pdu, TAG_INT, &encode_int(0));
    push_tlv(&mut pdu, TAG_INT, &encode_int(0));
    pdu.extend_from_slice(&vbl);

    let mut msg = Vec::new();
    push_tlv(&mut msg, TAG_INT, &encode_int(VERSION_2C));
    push_tlv(&mut msg, TAG_OCTET_STRING, community.as_bytes());
    let pdu_tag = if next { TAG_GET_NEXT_REQUEST } else { TAG_GET_REQUEST };
    push_tlv(&mut msg, pdu_tag, &pdu);

    let mut out = Vec::new();
    push_tlv(&mut out, TAG_SEQ, &msg);
    out
}

pub fn decode_response(buf: &[u8]) -> Result<Response> {
    let mut outer = Reader::new(buf);
    let (tag, msg) = outer.read_tlv()?;
    if tag != TAG_SEQ {
        bail!("not an SNMP message (tag {tag:#04x})");
    }

    let mut r = Reader::new(msg);
    let (tag, version) = r.read_tlv()?;
    if tag != TAG_INT || decode_int(version) != VERSION_2C {
        bail!("unsupported SNMP version");
    }
    let (_tag, _community) = r.read_tlv()?;
    let (tag, pdu) = r.read_tlv()?;
    if tag != TAG_GET_RESPONSE {
        bail!("not a GetResponse (tag {tag:#04x})");
    }

    let mut p = Reader::new(pdu);
    let (_, request_id) = p.read_tlv()?;
    let (_, error_status) = p.read_tlv()?;
    let (_, _error_index) = p.read_tlv()?;
    let (tag, vbl) = p.read_tlv()?;
    if tag != TAG_SEQ {
        bail!("malformed varbind list");
    }

    let mut varbinds = Vec::new();
    let mut v = Reader::new(vbl);
    while !v.done() {
        let (tag, vb) = v.read_tlv()?;
        if tag != TAG_SEQ {
            bail!("malformed varbind");
        }
        let mut b = Reader::new(vb);
        let (tag, oid) = b.read_tlv()?;
        if tag != TAG_OID {
            bail!("varbind without OID");
        }
        let (tag, content) = b.read_tlv()?;
        let value = match tag {
            TAG_INT => Value::Int(decode_int(content)),
            TAG_COUNTER32 | TAG_GAUGE32 | TAG_TIMETICKS | TAG_COUNTER64 => {
                Value::Counter(decode_uint(content))
            }
            TAG_OCTET_STRING => Value::Bytes(content.to_vec()),
            TAG_OID => Value::Oid(decode_oid(content)),
            TAG_IP_ADDRESS if content.len() == 4 => {
                Value::IpAddress([content[0], content[1], content[2], content[3]])
            }
            TAG_END_OF_MIB => Value::EndOfMib,
            TAG_NULL | TAG_NO_SUCH_OBJECT | TAG_NO_SUCH_INSTANCE => Value::Null,
            other => bail!("unhandled value tag {other:#04x}"),
        };
        varbinds.push(VarBind {
            oid: decode_oid(oid),
            value,
        });
    }

    Ok(Response {
        request_id: decode_int(request_id),
        error_status: decode_int(error_status),
        varbinds,
    })
}

pub fn oid_starts_with(oid: &[u32], base: &[u32]) -> bool {
    oid.len() >= base.len() && &oid[..base.len()] == base
}

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    push_len(out, content.len());
    out.extend_from_slice(content);
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 128 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    out.push(0x80 | (bytes.len() - skip) as u8);
    out.extend_from_slice(&bytes[skip..]);
}

fn encode_int(v: i64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        // drop redundant leading bytes while keeping the sign bit
        let a = bytes[start];
        let b = bytes[start + 1];
        if (a == 0x00 && b & 0x80 == 0) || (a == 0xff && b & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

fn decode_int(content: &[u8]) -> i64 {
    let mut v: i64 = if content.first().map(|b| b & 0x80 != 0).unwrap_or(false) {
        -1
    } else {
        0
    };
    for b in content {
        v = (v << 8) | i64::from(*b);
    }
    v
}

fn decode_uint(content: &[u8]) -> u64 {
    content.iter().fold(0u64, |v, b| (v << 8) | u64::from(*b))
}

fn encode_oid(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::new();
    if oid.len() < 2 {
        return out;
    }
    out.push((oid[0] * 40 + oid[1]) as u8);
    for arc in &oid[2..] {
        out.extend_from_slice(&encode_base128(*arc));
    }
    out
}

fn encode_base128(v: u32) -> Vec<u8> {
    let mut tmp = [0u8; 5];
    let mut i = 5;
    let mut v = v;
    loop {
        i -= 1;
        tmp[i] = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    let mut out = tmp[i..].to_vec();
    for b in out.iter_mut().take(tmp.len() - i - 1) {
        *b |= 0x80;
    }
    out
}

fn decode_oid(content: &[u8]) -> Vec<u32> {
    let mut oid = Vec::new();
    let mut iter = content.iter();
    if let Some(first) = iter.next() {
        oid.push(u32::from(first / 40));
        oid.push(u32::from(first % 40));
    }
    let mut acc: u32 = 0;
    for b in iter {
        acc = (acc << 7) | u32::from(b & 0x7f);
        if b & 0x80 == 0 {
            oid.push(acc);
            acc = 0;
        }
    }
    oid
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = *self.buf.get(self.pos).ok_or_else(|| anyhow::anyhow!("truncated TLV"))?;
        self.pos += 1;
        let first = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| anyhow::anyhow!("truncated length"))?;
        self.pos += 1;
        let len = if first & 0x80 == 0 {
            usize::from(first)
        } else {
            let n = usize::from(first & 0x7f);
            if n == 0 || n > 4 {
                bail!("unsupported length encoding");
            }
            let mut len = 0usize;
            for _ in 0..n {
                let b = *self
                    .buf
                    .get(self.pos)
                    .ok_or_else(|| anyhow::anyhow!("truncated length"))?;
                self.pos += 1;
                len = (len << 8) | usize::from(b);
            }
            len
        };
        let content = self
            .buf
            .get(self.pos..self.pos + len)
            .ok_or_else(|| anyhow::anyhow!("truncated content"))?;
        self.pos += len;
        Ok((tag, content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYS_DESCR: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];

    #[test]
    fn get_request_bytes_are_canonical() {
        let pkt = encode_request("public", 1, SYS_DESCR, false);
        let expected = [
            0x30, 0x26, // message
            0x02, 0x01, 0x01, // version 2c
            0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', // community
            0xa0, 0x19, // GetRequest
            0x02, 0x01, 0x01, // request-id
            0x02, 0x01, 0x00, // error-status
            0x02, 0x01, 0x00, // error-index
            0x30, 0x0e, 0x30, 0x0c, // varbind list, varbind
            0x06, 0x08, 0x2b, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, // OID
            0x05, 0x00, // NULL
        ];
        assert_eq!(pkt, expected);
    }

    #[test]
    fn get_response_decodes() {
        // GetResponse carrying sysDescr.0 = "Linux"
        let mut varbind = Vec::new();
        push_tlv(&mut varbind, TAG_OID, &encode_oid(SYS_DESCR));
        push_tlv(&mut varbind, TAG_OCTET_STRING, b"Linux");
        let mut vbl = Vec::new();
        push_tlv(&mut vbl, TAG_SEQ, &varbind);
        let mut pdu = Vec::new();
        push_tlv(&mut pdu, TAG_INT, &encode_int(7));
        push_tlv(&mut pdu, TAG_INT, &encode_int(0));
        push_tlv(&mut pdu, TAG_INT, &encode_int(0));
        pdu.extend_from_slice(&vbl);
        let mut msg = Vec::new();
        push_tlv(&mut msg, TAG_INT, &encode_int(VERSION_2C));
        push_tlv(&mut msg, TAG_OCTET_STRING, b"public");
        push_tlv(&mut msg, TAG_GET_RESPONSE, &pdu);
        let mut raw = Vec::new();
        push_tlv(&mut raw, TAG_SEQ, &msg);

        let resp = decode_response(&raw).unwrap();
        assert_eq!(resp.request_id, 7);
        assert_eq!(resp.error_status, 0);
        assert_eq!(
            resp.varbinds,
            vec![VarBind {
                oid: SYS_DESCR.to_vec(),
                value: Value::Bytes(b"Linux".to_vec()),
            }]
        );
    }

    #[test]
    fn long_form_lengths_round_trip() {
        let mut out = Vec::new();
        push_tlv(&mut out, TAG_OCTET_STRING, &vec![0x55u8; 300]);
        let mut r = Reader::new(&out);
        let (tag, content) = r.read_tlv().unwrap();
        assert_eq!(tag, TAG_OCTET_STRING);
        assert_eq!(content.len(), 300);
    }

    #[test]
    fn multibyte_arcs_round_trip() {
        let oid = [1u32, 3, 6, 1, 4, 1, 311, 21, 2_000_000];
        assert_eq!(decode_oid(&encode_oid(&oid)), oid.to_vec());
    }

    #[test]
    fn negative_and_wide_integers_round_trip() {
        for v in [0i64, 1, 127, 128, 255, 256, -1, -128, -129, 65_535, 2_147_483_647] {
            assert_eq!(decode_int(&encode_int(v)), v, "value {v}");
        }
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode_response(&[]).is_err());
        assert!(decode_response(&[0x30, 0x05, 0x01]).is_err());
        // a GetRequest is not a response
        let req = encode_request("public", 1, SYS_DESCR, false);
        assert!(decode_response(&req).is_err());
    }
}
