//! nmap subprocess and its XML report.
//!
//! The scanner is run as `nmap -oX - <arguments> <hosts>` and only the parts
//! of the XML the tracker needs are extracted: per-host status and reason,
//! addresses (ipv4/ipv6/mac with vendor) and hostnames.

use std::collections::BTreeMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::error::ScanError;

/// One host entry of a scan report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostScan {
    /// `up`, `down`, `unknown` or `skipped`.
    pub state: String,
    /// Why nmap decided on the state, e.g. `arp-response`, `no-response`.
    pub reason: String,
    pub mac: Option<String>,
    pub vendor: Option<String>,
    pub hostnames: Vec<String>,
}

/// Hosts of one scan keyed by network address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub hosts: BTreeMap<String, HostScan>,
}

/// Runs a network scan. Blocking; the tracker calls it on `spawn_blocking`.
pub trait PortScanner: Send + Sync {
    fn scan(&self, hosts: &str, arguments: &str, timeout: Duration) -> Result<ScanReport, ScanError>;
}

pub struct NmapProcess {
    program: String,
}

impl NmapProcess {
    pub fn new() -> Self {
        Self {
            program: "nmap".to_string(),
        }
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for NmapProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl PortScanner for NmapProcess {
    fn scan(&self, hosts: &str, arguments: &str, timeout: Duration) -> Result<ScanReport, ScanError> {
        let mut child = Command::new(&self.program)
            .args(["-oX", "-"])
            .args(arguments.split_whitespace())
            .args(hosts.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ScanError::NotInstalled,
                _ => ScanError::Io(e),
            })?;

        // Drain both pipes concurrently so a chatty scan cannot fill one and
        // stall the child.
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ScanError::Timeout(timeout.as_secs()));
            }
            std::thread::sleep(Duration::from_millis(50));
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);

        let (warnings, errors): (Vec<&str>, Vec<&str>) = stderr
            .lines()
            .filter(|line| !line.trim().is_empty())
            .partition(|line| line.to_ascii_lowercase().starts_with("warning:"));
        for warning in &warnings {
            tracing::debug!("nmap: {}", warning);
        }

        match parse_nmap_xml(&stdout) {
            Ok(report) if status.success() => Ok(report),
            _ if !errors.is_empty() => Err(ScanError::Scanner(stderr.trim().to_string())),
            Ok(_) => Err(ScanError::Scanner(format!("nmap exited with {}", status))),
            Err(e) => Err(e),
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_reader(handle: Option<std::thread::JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

// ── XML extraction ─────────────────────────────────────────

/// Parse nmap's `-oX` output.
pub fn parse_nmap_xml(xml: &str) -> Result<ScanReport, ScanError> {
    if !xml.contains("<nmaprun") {
        return Err(ScanError::Parse("missing <nmaprun> element".to_string()));
    }

    let mut report = ScanReport::default();
    let mut rest = xml;
    while let Some(start) = find_element(rest, "host") {
        let after = &rest[start..];
        let end = after
            .find("</host>")
            .ok_or_else(|| ScanError::Parse("unterminated <host> element".to_string()))?;
        if let Some((address, host)) = parse_host(&after[..end]) {
            report.hosts.insert(address, host);
        }
        rest = &after[end + "</host>".len()..];
    }
    Ok(report)
}

fn parse_host(block: &str) -> Option<(String, HostScan)> {
    let mut host = HostScan::default();

    if let Some(status) = element_tags(block, "status").into_iter().next() {
        host.state = attribute(status, "state").unwrap_or_default();
        host.reason = attribute(status, "reason").unwrap_or_default();
    }

    let mut ipv4 = None;
    let mut ipv6 = None;
    for tag in element_tags(block, "address") {
        let addr = attribute(tag, "addr");
        match attribute(tag, "addrtype").as_deref() {
            Some("ipv4") => ipv4 = addr,
            Some("ipv6") => ipv6 = addr,
            Some("mac") => {
                host.mac = addr;
                host.vendor = attribute(tag, "vendor").filter(|v| !v.is_empty());
            }
            _ => {}
        }
    }

    host.hostnames = element_tags(block, "hostname")
        .into_iter()
        .filter_map(|tag| attribute(tag, "name"))
        .filter(|name| !name.is_empty())
        .collect();

    ipv4.or(ipv6).map(|address| (address, host))
}

/// Byte offset of the next `<name` start tag (not `<name...` prefixes of
/// longer element names).
fn find_element(haystack: &str, name: &str) -> Option<usize> {
    let open = format!("<{}", name);
    let mut offset = 0;
    while let Some(pos) = haystack[offset..].find(&open) {
        let start = offset + pos;
        let next = haystack[start + open.len()..].chars().next();
        if matches!(next, Some(' ' | '>' | '/' | '\n' | '\t' | '\r')) {
            return Some(start);
        }
        offset = start + open.len();
    }
    None
}

/// The attribute text of every `<name ...>` tag in `block`.
fn element_tags<'a>(block: &'a str, name: &str) -> Vec<&'a str> {
    let mut tags = Vec::new();
    let mut rest = block;
    while let Some(start) = find_element(rest, name) {
        let after = &rest[start + name.len() + 1..];
        let end = after.find('>').unwrap_or(after.len());
        tags.push(after[..end].trim_end_matches('/'));
        rest = &after[end..];
    }
    tags
}

fn attribute(tag: &str, key: &str) -> Option<String> {
    for quote in ['"', '\''] {
        let pattern = format!(" {}={}", key, quote);
        if let Some(start) = tag.find(&pattern) {
            let value = &tag[start + pattern.len()..];
            let end = value.find(quote)?;
            return Some(unescape(&value[..end]));
        }
    }
    None
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
