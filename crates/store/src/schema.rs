pub const MIG_0001_INIT: &str = r#"
BEGIN;

CREATE TABLE machines (
  id                    INTEGER PRIMARY KEY AUTOINCREMENT,
  hostname              TEXT NOT NULL DEFAULT '',
  host_id               TEXT NOT NULL DEFAULT '',
  arch                  TEXT NOT NULL DEFAULT '',
  platform              TEXT NOT NULL DEFAULT '',
  distribution          TEXT NOT NULL DEFAULT '',
  distribution_version  TEXT NOT NULL DEFAULT '',
  distribution_family   TEXT NOT NULL DEFAULT '',
  uptime_ns             INTEGER,
  chassis               TEXT NOT NULL DEFAULT '',
  cpe                   TEXT NOT NULL DEFAULT '',
  agent                 TEXT UNIQUE,
  parent_machine_id     INTEGER REFERENCES machines(id) ON DELETE SET NULL,
  created_at            TEXT NOT NULL,
  updated_at            TEXT NOT NULL
);
CREATE UNIQUE INDEX uq_machines_host_id ON machines(host_id) WHERE host_id <> '';
CREATE INDEX idx_machines_parent ON machines(parent_machine_id);

CREATE TABLE network_interfaces (
  id           INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id   INTEGER REFERENCES machines(id) ON DELETE CASCADE,
  name         TEXT NOT NULL DEFAULT '',
  mac          TEXT NOT NULL DEFAULT '',
  mac_vendor   TEXT,
  ip           TEXT NOT NULL DEFAULT '[]',
  gateway      TEXT NOT NULL DEFAULT '',
  flags        TEXT NOT NULL DEFAULT '{}',
  tag          TEXT NOT NULL DEFAULT '',
  created_at   TEXT NOT NULL,
  updated_at   TEXT NOT NULL,
  UNIQUE (machine_id, name),
  UNIQUE (machine_id, mac, tag)
);
CREATE INDEX idx_nics_machine ON network_interfaces(machine_id);
CREATE INDEX idx_nics_mac ON network_interfaces(mac);

CREATE TABLE subnetworks (
  id            INTEGER PRIMARY KEY AUTOINCREMENT,
  network_cidr  TEXT NOT NULL UNIQUE,
  network_addr  TEXT NOT NULL,
  mask_size     INTEGER NOT NULL,
  ip_version    INTEGER NOT NULL CHECK (ip_version IN (4,6)),
  gateway       TEXT NOT NULL DEFAULT '',
  vlan          INTEGER,
  created_at    TEXT NOT NULL,
  updated_at    TEXT NOT NULL
);

CREATE TABLE network_interface_subnets (
  network_interface_id INTEGER NOT NULL REFERENCES network_interfaces(id) ON DELETE CASCADE,
  subnetwork_id        INTEGER NOT NULL REFERENCES subnetworks(id) ON DELETE CASCADE,
  PRIMARY KEY (network_interface_id, subnetwork_id)
);

CREATE TABLE cpus (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id  INTEGER NOT NULL UNIQUE REFERENCES machines(id) ON DELETE CASCADE,
  model       TEXT NOT NULL DEFAULT '',
  vendor      TEXT NOT NULL DEFAULT '',
  cores       INTEGER NOT NULL DEFAULT 0,
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL
);

CREATE TABLE gpus (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id  INTEGER NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
  idx         INTEGER NOT NULL,
  product     TEXT NOT NULL DEFAULT '',
  vendor      TEXT NOT NULL DEFAULT '',
  driver      TEXT NOT NULL DEFAULT '',
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL,
  UNIQUE (machine_id, idx)
);

CREATE TABLE disks (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id  INTEGER NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
  name        TEXT NOT NULL,
  size        INTEGER NOT NULL DEFAULT 0,
  disk_type   TEXT NOT NULL DEFAULT 'unknown'
              CHECK (disk_type IN ('hdd','ssd','floppy','optical','unknown')),
  controller  TEXT NOT NULL DEFAULT 'unknown'
              CHECK (controller IN ('ide','mmc','nvme','scsi','virtio','unknown')),
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL,
  UNIQUE (machine_id, name)
);

CREATE TABLE partitions (
  id         INTEGER PRIMARY KEY AUTOINCREMENT,
  disk_id    INTEGER NOT NULL REFERENCES disks(id) ON DELETE CASCADE,
  name       TEXT NOT NULL,
  size       INTEGER NOT NULL DEFAULT 0,
  part_type  TEXT NOT NULL DEFAULT '',
  read_only  INTEGER NOT NULL DEFAULT 0 CHECK (read_only IN (0,1)),
  UNIQUE (disk_id, name)
);

CREATE TABLE packages (
  id                INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id        INTEGER NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
  name              TEXT NOT NULL,
  version           TEXT NOT NULL DEFAULT '',
  vendor            TEXT NOT NULL DEFAULT '',
  manager           TEXT NOT NULL CHECK (manager IN ('dpkg','rpm','zypper','msi')),
  install_time_unix INTEGER,
  files             TEXT NOT NULL DEFAULT '[]',
  created_at        TEXT NOT NULL,
  updated_at        TEXT NOT NULL,
  UNIQUE (machine_id, name, version)
);
CREATE INDEX idx_packages_machine ON packages(machine_id);

CREATE TABLE applications (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id  INTEGER NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
  package_id  INTEGER REFERENCES packages(id) ON DELETE SET NULL,
  name        TEXT NOT NULL,
  args        TEXT NOT NULL DEFAULT '',
  pid         INTEGER NOT NULL DEFAULT 0,
  version     TEXT NOT NULL DEFAULT '',
  protocol    TEXT NOT NULL DEFAULT '',
  cpe         TEXT NOT NULL DEFAULT '',
  config      TEXT NOT NULL DEFAULT '{}',
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL,
  UNIQUE (machine_id, name, pid)
);
CREATE INDEX idx_applications_machine ON applications(machine_id);

CREATE TABLE users (
  id          INTEGER PRIMARY KEY AUTOINCREMENT,
  machine_id  INTEGER NOT NULL REFERENCES machines(id) ON DELETE CASCADE,
  uid         TEXT NOT NULL,
  username    TEXT NOT NULL DEFAULT '',
  created_at  TEXT NOT NULL,
  updated_at  TEXT NOT NULL,
  UNIQUE (machine_id, uid)
);

CREATE TABLE user_applications (
  id             INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id        INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
  application_id INTEGER NOT NULL REFERENCES applications(id) ON DELETE CASCADE,
  UNIQUE (user_id, application_id)
);

CREATE TABLE application_endpoints (
  id                    INTEGER PRIMARY KEY AUTOINCREMENT,
  application_id        INTEGER REFERENCES applications(id) ON DELETE SET NULL,
  network_interface_id  INTEGER REFERENCES network_interfaces(id) ON DELETE CASCADE,
  addr                  TEXT NOT NULL DEFAULT '',
  port                  INTEGER NOT NULL CHECK (port BETWEEN 0 AND 65535),
  protocol              TEXT NOT NULL CHECK (protocol IN ('tcp','udp','tcp6','udp6')),
  application_protocols TEXT,
  saas                  TEXT,
  tls                   TEXT,
  fingerprints          TEXT,
  created_at            TEXT NOT NULL,
  updated_at            TEXT NOT NULL
);
CREATE UNIQUE INDEX uq_endpoints_nic
  ON application_endpoints(port, protocol, addr, network_interface_id)
  WHERE network_interface_id IS NOT NULL;
CREATE UNIQUE INDEX uq_endpoints_remote
  ON application_endpoints(port, protocol, addr)
  WHERE network_interface_id IS NULL;
CREATE INDEX idx_endpoints_application ON application_endpoints(application_id);

CREATE TABLE flows (
  id                       INTEGER PRIMARY KEY AUTOINCREMENT,
  src_application_id       INTEGER REFERENCES applications(id) ON DELETE CASCADE,
  src_network_interface_id INTEGER REFERENCES network_interfaces(id) ON DELETE SET NULL,
  src_addr                 TEXT NOT NULL,
  dst_endpoint_id          INTEGER NOT NULL REFERENCES application_endpoints(id) ON DELETE CASCADE,
  state                    TEXT NOT NULL DEFAULT '',
  created_at               TEXT NOT NULL,
  updated_at               TEXT NOT NULL,
  UNIQUE (src_application_id, src_addr, dst_endpoint_id)
);
CREATE INDEX idx_flows_dst ON flows(dst_endpoint_id);

CREATE TABLE endpoint_policies (
  id              INTEGER PRIMARY KEY AUTOINCREMENT,
  endpoint_id     INTEGER NOT NULL REFERENCES application_endpoints(id) ON DELETE CASCADE,
  action          TEXT NOT NULL CHECK (action IN ('accept','drop','reject','forward')),
  src_endpoint_id INTEGER REFERENCES application_endpoints(id) ON DELETE CASCADE,
  src_addr        TEXT NOT NULL DEFAULT '',
  priority        INTEGER NOT NULL DEFAULT 0,
  source          TEXT NOT NULL DEFAULT '',
  created_at      TEXT NOT NULL,
  updated_at      TEXT NOT NULL,
  UNIQUE (endpoint_id, action, src_endpoint_id, src_addr)
);

COMMIT;
"#;
