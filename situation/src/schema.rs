//! JSON schema of the exported payload, for collectors that validate before
//! ingesting. Kept by hand, next to the serde models it describes.

use serde_json::{json, Value};

const MAC_PATTERN: &str = "^([0-9A-Fa-f]{2}[:-]){5}[0-9A-Fa-f]{2}$";

pub fn payload_schema() -> Value {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "$id": "https://situation.sh/schemas/payload.json",
        "title": "Payload",
        "type": "object",
        "required": ["machines", "extra"],
        "properties": {
            "machines": { "type": "array", "items": { "$ref": "#/$defs/machine" } },
            "extra": { "$ref": "#/$defs/extra" }
        },
        "$defs": {
            "uuid": {
                "type": "string",
                "format": "uuid",
                "title": "Universally unique identifier",
                "examples": ["123e4567-e89b-12d3-a456-426652340000"]
            },
            "mac": {
                "type": "string",
                "title": "MAC address",
                "pattern": MAC_PATTERN,
                "examples": ["5E:FF:56:A2:AF:15"]
            },
            "ip": {
                "type": "string",
                "title": "IPv4 or IPv6 address, optionally with a prefix length",
                "examples": ["192.168.10.103", "fe80::c1b2:a320:f799:10e0", "10.0.0.4/24"]
            },
            "timestamp": { "type": "string", "format": "date-time" },
            "machine": {
                "type": "object",
                "properties": {
                    "id": { "type": "integer" },
                    "hostname": { "type": "string" },
                    "host_id": { "type": "string" },
                    "arch": { "type": "string" },
                    "platform": { "type": "string" },
                    "distribution": { "type": "string" },
                    "distribution_version": { "type": "string" },
                    "distribution_family": { "type": "string" },
                    "uptime_ns": { "type": ["integer", "null"] },
                    "chassis": { "type": "string" },
                    "cpe": { "type": "string" },
                    "agent": { "anyOf": [{ "$ref": "#/$defs/uuid" }, { "type": "null" }] },
                    "parent_machine_id": { "type": ["integer", "null"] },
                    "cpu": { "anyOf": [{ "$ref": "#/$defs/cpu" }, { "type": "null" }] },
                    "gpus": { "type": "array", "items": { "$ref": "#/$defs/gpu" } },
                    "disks": { "type": "array", "items": { "$ref": "#/$defs/disk" } },
                    "network_interfaces": { "type": "array", "items": { "$ref": "#/$defs/nic" } },
                    "subnetworks": { "type": "array", "items": { "$ref": "#/$defs/subnetwork" } },
                    "packages": { "type": "array", "items": { "$ref": "#/$defs/package" } },
                    "applications": { "type": "array", "items": { "$ref": "#/$defs/application" } },
                    "endpoints": { "type": "array", "items": { "$ref": "#/$defs/endpoint" } },
                    "users": { "type": "array", "items": { "$ref": "#/$defs/user" } }
                }
            },
            "cpu": {
                "type": "object",
                "properties": {
                    "model_name": { "type": "string" },
                    "vendor": { "type": "string" },
                    "cores": { "type": "integer" }
                }
            },
            "gpu": {
                "type": "object",
                "properties": {
                    "index": { "type": "integer" },
                    "product": { "type": "string" },
                    "vendor": { "type": "string" },
                    "driver": { "type": "string" }
                }
            },
            "disk": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "size": { "type": "integer" },
                    "disk_type": { "type": "string" },
                    "controller": { "type": "string" },
                    "partitions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "size": { "type": "integer" },
                                "part_type": { "type": "string" },
                                "read_only": { "type": "boolean" }
                            }
                        }
                    }
                }
            },
            "nic": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "mac": { "$ref": "#/$defs/mac" },
                    "mac_vendor": { "type": "string" },
                    "ips": { "type": "array", "items": { "$ref": "#/$defs/ip" } },
                    "gateway": { "type": "string" },
                    "flags": { "type": "string" }
                }
            },
            "subnetwork": {
                "type": "object",
                "properties": {
                    "network_cidr": { "type": "string" },
                    "gateway": { "type": "string" },
                    "vlan": { "type": ["integer", "null"] }
                }
            },
            "package": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "version": { "type": "string" },
                    "manager": { "type": "string" },
                    "install_time": { "type": ["string", "null"] }
                }
            },
            "application": {
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "args": { "type": "string" },
                    "pid": { "type": "integer" },
                    "version": { "type": "string" },
                    "protocol": { "type": "string" },
                    "cpe": { "type": "string" },
                    "config": { "type": "object", "additionalProperties": { "type": "string" } },
                    "endpoints": { "type": "array", "items": { "$ref": "#/$defs/endpoint" } }
                }
            },
            "endpoint": {
                "type": "object",
                "properties": {
                    "addr": { "$ref": "#/$defs/ip" },
                    "port": { "type": "integer", "minimum": 0, "maximum": 65535 },
                    "protocol": { "type": "string", "enum": ["tcp", "udp", "tcp6", "udp6"] },
                    "application_protocols": {
                        "anyOf": [
                            { "type": "array", "items": { "type": "string" } },
                            { "type": "null" }
                        ]
                    },
                    "saas": { "type": ["string", "null"] },
                    "tls": { "anyOf": [{ "$ref": "#/$defs/tls" }, { "type": "null" }] },
                    "fingerprints": {
                        "anyOf": [
                            {
                                "type": "object",
                                "properties": {
                                    "ja4": { "type": ["string", "null"] },
                                    "ja4s": { "type": ["string", "null"] },
                                    "ja4x": { "type": ["string", "null"] }
                                }
                            },
                            { "type": "null" }
                        ]
                    },
                    "flows": { "type": "array", "items": { "$ref": "#/$defs/flow" } }
                }
            },
            "tls": {
                "type": "object",
                "properties": {
                    "subject": { "type": "string" },
                    "issuer": { "type": "string" },
                    "not_before": { "$ref": "#/$defs/timestamp" },
                    "not_after": { "$ref": "#/$defs/timestamp" },
                    "serial": { "type": "string" },
                    "signature_algorithm": { "type": "string" },
                    "public_key_algorithm": { "type": "string" },
                    "sha1": { "type": "string" },
                    "sha256": { "type": "string" },
                    "dns_names": { "type": "array", "items": { "type": "string" } }
                }
            },
            "flow": {
                "type": "object",
                "properties": {
                    "src_addr": { "$ref": "#/$defs/ip" },
                    "state": { "type": "string" }
                }
            },
            "user": {
                "type": "object",
                "properties": {
                    "uid": { "type": "string" },
                    "username": { "type": "string" }
                }
            },
            "extra": {
                "type": "object",
                "required": ["agent", "version", "duration", "timestamp"],
                "properties": {
                    "agent": { "$ref": "#/$defs/uuid" },
                    "version": { "type": "string" },
                    "duration": { "type": "integer", "description": "scan duration in nanoseconds" },
                    "timestamp": { "$ref": "#/$defs/timestamp" },
                    "errors": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "module": { "type": "string" },
                                "message": { "type": "string" }
                            }
                        }
                    },
                    "perfs": {
                        "type": "object",
                        "properties": {
                            "heap_alloc": { "type": "integer" },
                            "heap_sys": { "type": "integer" }
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_self_consistent() {
        let schema = payload_schema();
        let defs = schema["$defs"].as_object().unwrap();
        // every internal reference resolves
        fn walk(value: &Value, defs: &serde_json::Map<String, Value>) {
            match value {
                Value::Object(map) => {
                    if let Some(Value::String(target)) = map.get("$ref") {
                        let name = target.rsplit('/').next().unwrap();
                        assert!(defs.contains_key(name), "dangling $ref {target}");
                    }
                    for v in map.values() {
                        walk(v, defs);
                    }
                }
                Value::Array(items) => {
                    for v in items {
                        walk(v, defs);
                    }
                }
                _ => {}
            }
        }
        walk(&schema, defs);
        assert_eq!(schema["properties"]["machines"]["type"], "array");
    }
}
