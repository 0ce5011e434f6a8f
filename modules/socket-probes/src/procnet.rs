//! Readers for the `/proc/net` socket tables and the `/proc/<pid>` process
//! tree.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use situation_store::Protocol;

pub const TCP_ESTABLISHED: u8 = 0x01;
pub const TCP_FIN_WAIT1: u8 = 0x04;
pub const TCP_FIN_WAIT2: u8 = 0x05;
pub const TCP_TIME_WAIT: u8 = 0x06;
pub const TCP_CLOSE_WAIT: u8 = 0x08;
pub const TCP_LAST_ACK: u8 = 0x09;
pub const TCP_LISTEN: u8 = 0x0a;
pub const TCP_CLOSING: u8 = 0x0b;

/// States that describe an actual exchange with a peer, as opposed to a
/// socket waiting for one.
pub fn is_flow_state(state: u8) -> bool {
    matches!(
        state,
        TCP_ESTABLISHED
            | TCP_FIN_WAIT1
            | TCP_FIN_WAIT2
            | TCP_TIME_WAIT
            | TCP_CLOSE_WAIT
            | TCP_LAST_ACK
            | TCP_CLOSING
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockEntry {
    pub protocol: Protocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub state: u8,
    pub uid: u32,
    pub inode: u64,
}

/// Parses one `/proc/net/{tcp,udp,tcp6,udp6}` table. The header line is
/// skipped and rows that do not follow the kernel format are ignored.
pub fn parse_table(text: &str, protocol: Protocol) -> Vec<SockEntry> {
    text.lines()
        .skip(1)
        .filter_map(|line| parse_line(line, protocol))
        .collect()
}

fn parse_line(line: &str, protocol: Protocol) -> Option<SockEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    let (local_ip, local_port) = parse_addr(fields[1])?;
    let (remote_ip, remote_port) = parse_addr(fields[2])?;
    Some(SockEntry {
        protocol,
        local_ip,
        local_port,
        remote_ip,
        remote_port,
        state: u8::from_str_radix(fields[3], 16).ok()?,
        uid: fields[7].parse().ok()?,
        inode: fields[9].parse().ok()?,
    })
}

/// The kernel prints socket addresses as native-endian 32-bit words, so
/// `0100007F:0016` is 127.0.0.1:22 on the little-endian machines this agent
/// runs on.
fn parse_addr(field: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => {
            let word = u32::from_str_radix(addr, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.swap_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
                let word = u32::from_str_radix(&addr[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some((ip, port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i64,
    pub name: String,
    pub args: String,
}

/// Maps socket inodes to their owning process by resolving every
/// `/proc/<pid>/fd` symlink. Reading other users' fd tables requires root;
/// unreadable processes are silently skipped.
pub fn socket_processes() -> HashMap<u64, ProcessInfo> {
    let mut map = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return map;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i64>() else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        let mut info: Option<ProcessInfo> = None;
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let Some(inode) = socket_inode(&target) else {
                continue;
            };
            let info = info.get_or_insert_with(|| process_info(pid));
            map.entry(inode).or_insert_with(|| info.clone());
        }
    }
    map
}

pub(crate) fn socket_inode(target: &Path) -> Option<u64> {
    target
        .to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Name is argv[0] when the command line is readable, `comm` otherwise.
/// The remaining argv entries become the args string.
fn process_info(pid: i64) -> ProcessInfo {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).unwrap_or_default();
    let mut argv = cmdline
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned());
    let name = argv.next().unwrap_or_else(|| {
        std::fs::read_to_string(format!("/proc/{pid}/comm"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    });
    let args = argv.collect::<Vec<_>>().join(" ");
    ProcessInfo { pid, name, args }
}

/// Real UID of a process, read from `/proc/<pid>/status`.
pub fn process_uid(pid: i64) -> Option<String> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    status
        .lines()
        .find_map(|l| l.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .map(str::to_string)
}
