//! Hardware address normalization and the ARP-table fallback used when nmap
//! runs unprivileged and cannot report MAC addresses itself.

use std::process::Command;

/// Normalize a MAC address to lower-case `aa:bb:cc:dd:ee:ff`.
///
/// Accepts colon, dash, dotted (`aabb.ccdd.eeff`) and bare hex forms; anything
/// that is not 12 hex digits is returned unchanged.
pub fn format_mac(mac: &str) -> String {
    let hex: String = mac
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return mac.to_string();
    }
    let hex = hex.to_lowercase();
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Resolves a network address to a hardware address.
///
/// Implementations block; callers run them on `spawn_blocking`.
pub trait MacResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Option<String>;
}

/// Reads the kernel neighbour table, then falls back to `arp -n`.
pub struct ArpResolver;

impl MacResolver for ArpResolver {
    fn resolve(&self, ip: &str) -> Option<String> {
        #[cfg(target_os = "linux")]
        {
            if let Ok(table) = std::fs::read_to_string("/proc/net/arp") {
                if let Some(mac) = parse_proc_net_arp(&table, ip) {
                    return Some(mac);
                }
            }
        }

        let output = Command::new("arp").args(["-n", ip]).output().ok()?;
        if !output.status.success() {
            return None;
        }
        parse_arp_output(&String::from_utf8_lossy(&output.stdout), ip)
    }
}

fn usable_mac(mac: &str) -> bool {
    mac.contains(':') && mac != "00:00:00:00:00:00" && mac != "(incomplete)"
}

/// Parse `/proc/net/arp`:
/// `IP address  HW type  Flags  HW address  Mask  Device`
fn parse_proc_net_arp(table: &str, ip: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 4 && parts[0] == ip && usable_mac(parts[3]) {
            Some(parts[3].to_string())
        } else {
            None
        }
    })
}

/// Parse `arp -n` output in either the Linux column layout or the BSD
/// `? (ip) at mac on iface` layout.
fn parse_arp_output(output: &str, ip: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let bsd_marker = format!("({})", ip);
        if line.contains(&bsd_marker) {
            if let Some(at_pos) = line.find(" at ") {
                let mac = line[at_pos + 4..].split_whitespace().next().unwrap_or("");
                if usable_mac(mac) {
                    return Some(mac.to_string());
                }
            }
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 3 && parts[0] == ip && usable_mac(parts[2]) {
            return Some(parts[2].to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mac() {
        assert_eq!(format_mac("AA:BB:CC:DD:EE:FF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("aa-bb-cc-dd-ee-ff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("aabb.ccdd.eeff"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("AABBCCDDEEFF"), "aa:bb:cc:dd:ee:ff");
        assert_eq!(format_mac("not-a-mac"), "not-a-mac");
    }

    #[test]
    fn test_parse_proc_net_arp() {
        let table = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         a4:91:b1:00:11:22     *        eth0
192.168.1.7      0x1         0x0         00:00:00:00:00:00     *        eth0
";
        assert_eq!(
            parse_proc_net_arp(table, "192.168.1.1").as_deref(),
            Some("a4:91:b1:00:11:22")
        );
        assert_eq!(parse_proc_net_arp(table, "192.168.1.7"), None);
        assert_eq!(parse_proc_net_arp(table, "192.168.1.9"), None);
    }

    #[test]
    fn test_parse_arp_output_linux() {
        let out = "\
Address                  HWtype  HWaddress           Flags Mask            Iface
192.168.1.20             ether   3c:22:fb:12:34:56   C                     wlan0
";
        assert_eq!(
            parse_arp_output(out, "192.168.1.20").as_deref(),
            Some("3c:22:fb:12:34:56")
        );
    }

    #[test]
    fn test_parse_arp_output_bsd() {
        let out = "? (192.168.1.20) at 3c:22:fb:12:34:56 on en0 ifscope [ethernet]\n";
        assert_eq!(
            parse_arp_output(out, "192.168.1.20").as_deref(),
            Some("3c:22:fb:12:34:56")
        );
        let incomplete = "? (192.168.1.21) at (incomplete) on en0 ifscope [ethernet]\n";
        assert_eq!(parse_arp_output(incomplete, "192.168.1.21"), None);
    }
}
