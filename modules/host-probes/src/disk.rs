use std::path::Path;

use async_trait::async_trait;
use situation_core::{Module, ModuleError, ScanContext};
use situation_store::{Disk, DiskController, DiskType, Partition};
use tracing::debug;

/// One Disk per block device; devices whose controller cannot be determined
/// are skipped (loop devices, device-mapper nodes).
pub struct HostDiskModule;

#[async_trait]
impl Module for HostDiskModule {
    fn name(&self) -> &'static str {
        "host-disk"
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &["host-basic"]
    }

    async fn run(&self, ctx: &ScanContext) -> Result<(), ModuleError> {
        let Ok(entries) = std::fs::read_dir("/sys/block") else {
            return Err(ModuleError::not_applicable("no /sys/block on this platform"));
        };
        let host = ctx.store.get_or_create_host()?;
        let mut found = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let controller = controller_of(&name);
            if controller == DiskController::Unknown {
                continue;
            }
            let path = entry.path();
            let disk = Disk {
                id: 0,
                machine_id: host.id,
                size: sectors(&path.join("size")) * 512,
                disk_type: type_of(&name, &path),
                controller,
                partitions: partitions_of(&path, &name),
                name,
            };
            ctx.store.upsert_disk(&disk)?;
            found += 1;
        }
        debug!(count = found, "block devices found");
        Ok(())
    }
}

fn sectors(path: &Path) -> i64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

fn controller_of(name: &str) -> DiskController {
    if name.starts_with("nvme") {
        DiskController::Nvme
    } else if name.starts_with("mmcblk") {
        DiskController::Mmc
    } else if name.starts_with("sd") || name.starts_with("sr") {
        DiskController::Scsi
    } else if name.starts_with("hd") {
        DiskController::Ide
    } else if name.starts_with("vd") {
        DiskController::Virtio
    } else if name.starts_with("fd") {
        DiskController::Ide
    } else {
        DiskController::Unknown
    }
}

fn type_of(name: &str, path: &Path) -> DiskType {
    if name.starts_with("sr") {
        return DiskType::Optical;
    }
    if name.starts_with("fd") {
        return DiskType::Floppy;
    }
    match std::fs::read_to_string(path.join("queue/rotational")) {
        Ok(s) if s.trim() == "1" => DiskType::Hdd,
        Ok(_) => DiskType::Ssd,
        Err(_) => DiskType::Unknown,
    }
}

fn partitions_of(path: &Path, disk: &str) -> Vec<Partition> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir(path) else {
        return out;
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(disk) || !entry.path().join("partition").exists() {
            continue;
        }
        out.push(Partition {
            size: sectors(&entry.path().join("size")) * 512,
            part_type: String::new(),
            read_only: std::fs::read_to_string(entry.path().join("ro"))
                .map(|s| s.trim() == "1")
                .unwrap_or(false),
            name,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_from_device_name() {
        assert_eq!(controller_of("nvme0n1"), DiskController::Nvme);
        assert_eq!(controller_of("sda"), DiskController::Scsi);
        assert_eq!(controller_of("vda"), DiskController::Virtio);
        assert_eq!(controller_of("mmcblk0"), DiskController::Mmc);
        assert_eq!(controller_of("hda"), DiskController::Ide);
        // loop and dm devices have no controller and are skipped
        assert_eq!(controller_of("loop0"), DiskController::Unknown);
        assert_eq!(controller_of("dm-0"), DiskController::Unknown);
    }
}
