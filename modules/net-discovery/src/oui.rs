//! Trimmed-down IEEE OUI registry. Prefixes are the first three octets,
//! upper-case, colon-separated.

pub const OUI_TABLE: &[(&str, &str)] = &[
    ("00:00:0C", "Cisco Systems"),
    ("00:01:42", "Cisco Systems"),
    ("00:03:93", "Apple"),
    ("00:05:69", "VMware"),
    ("00:0C:29", "VMware"),
    ("00:0D:3A", "Microsoft"),
    ("00:15:5D", "Microsoft Hyper-V"),
    ("00:16:3E", "Xensource"),
    ("00:17:88", "Philips Lighting"),
    ("00:1A:11", "Google"),
    ("00:1B:21", "Intel Corporate"),
    ("00:1C:42", "Parallels"),
    ("00:50:56", "VMware"),
    ("00:E0:4C", "Realtek Semiconductor"),
    ("08:00:27", "PCS Systemtechnik (VirtualBox)"),
    ("0A:00:27", "PCS Systemtechnik (VirtualBox)"),
    ("18:C0:4D", "Giga-Byte Technology"),
    ("1C:69:7A", "EliteGroup Computer Systems"),
    ("24:4B:FE", "ASUSTek Computer"),
    ("28:D2:44", "LCFC Electronics Technology"),
    ("2C:F0:5D", "Micro-Star International"),
    ("30:9C:23", "Micro-Star International"),
    ("3C:22:FB", "Apple"),
    ("3C:5A:B4", "Google"),
    ("40:B0:76", "ASUSTek Computer"),
    ("44:8A:5B", "Micro-Star International"),
    ("48:2A:E3", "Apple"),
    ("4C:CC:6A", "Micro-Star International"),
    ("50:EB:F6", "ASUSTek Computer"),
    ("52:54:00", "QEMU/KVM"),
    ("54:BF:64", "Dell"),
    ("58:11:22", "Cisco Systems"),
    ("5C:F9:DD", "Dell"),
    ("60:45:CB", "ASUSTek Computer"),
    ("64:66:B3", "TP-Link Technologies"),
    ("68:54:5A", "Intel Corporate"),
    ("6C:2B:59", "Dell"),
    ("70:85:C2", "ASRock"),
    ("74:56:3C", "Giga-Byte Technology"),
    ("78:2B:CB", "Dell"),
    ("7C:10:C9", "ASUSTek Computer"),
    ("80:EE:73", "Shuttle"),
    ("84:47:09", "Hewlett Packard"),
    ("88:A4:C2", "IEEE Registration Authority"),
    ("8C:16:45", "LCFC Electronics Technology"),
    ("90:2B:34", "Giga-Byte Technology"),
    ("94:C6:91", "EliteGroup Computer Systems"),
    ("98:90:96", "Dell"),
    ("9C:6B:00", "ASRock"),
    ("A0:36:9F", "Intel Corporate"),
    ("A4:BB:6D", "Dell"),
    ("A8:A1:59", "ASRock"),
    ("AC:16:2D", "Hewlett Packard"),
    ("B0:6E:BF", "ASUSTek Computer"),
    ("B4:2E:99", "Giga-Byte Technology"),
    ("B8:27:EB", "Raspberry Pi Foundation"),
    ("B8:85:84", "Dell"),
    ("BC:24:11", "Proxmox Server Solutions"),
    ("C0:3F:D5", "Elitegroup Computer Systems"),
    ("C8:5B:76", "LCFC Electronics Technology"),
    ("CC:96:E5", "Dell"),
    ("D0:50:99", "ASRock"),
    ("D4:5D:64", "ASUSTek Computer"),
    ("D8:3A:DD", "Raspberry Pi Trading"),
    ("D8:9E:F3", "Dell"),
    ("DC:A6:32", "Raspberry Pi Trading"),
    ("E4:54:E8", "Dell"),
    ("E8:40:F2", "Pegatron"),
    ("EC:08:6B", "TP-Link Technologies"),
    ("F0:2F:74", "ASUSTek Computer"),
    ("F4:39:09", "Hewlett Packard"),
    ("F8:75:A4", "LCFC Electronics Technology"),
    ("FC:34:97", "ASUSTek Computer"),
];

/// Vendor of the first three octets of `mac`, if registered.
pub fn lookup(mac: &str) -> Option<&'static str> {
    let prefix = mac.get(..8)?;
    OUI_TABLE
        .binary_search_by(|(oui, _)| oui.cmp(&prefix))
        .ok()
        .map(|i| OUI_TABLE[i].1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_for_binary_search() {
        for pair in OUI_TABLE.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{} >= {}", pair[0].0, pair[1].0);
        }
    }

    #[test]
    fn known_prefixes_resolve() {
        assert_eq!(lookup("52:54:00:12:34:56"), Some("QEMU/KVM"));
        assert_eq!(lookup("B8:27:EB:AA:BB:CC"), Some("Raspberry Pi Foundation"));
        assert_eq!(lookup("FF:FF:FF:00:00:00"), None);
        assert_eq!(lookup("bad"), None);
    }
}
