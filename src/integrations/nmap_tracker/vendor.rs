//! MAC vendor lookup table.
//!
//! Filled once at startup from the IEEE OUI registry. The table only improves
//! device names when nmap could not report a vendor, so a failed download is
//! tolerated and simply leaves it empty.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

pub const OUI_URL: &str = "https://standards-oui.ieee.org/oui/oui.txt";
const OUI_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct MacVendorLookup {
    prefixes: RwLock<HashMap<String, String>>,
}

impl MacVendorLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper-case hex digits of a MAC address with separators removed.
    pub fn sanitise(mac: &str) -> String {
        mac.chars()
            .filter(|c| c.is_ascii_hexdigit())
            .map(|c| c.to_ascii_uppercase())
            .collect()
    }

    pub fn get(&self, mac: &str) -> Option<String> {
        let sanitised = Self::sanitise(mac);
        let oui = sanitised.get(..6)?;
        self.prefixes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(oui)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.prefixes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Merge `prefix -> vendor` pairs into the table.
    pub fn extend<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.prefixes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(entries);
    }

    /// Download the OUI registry and load it. Returns the number of prefixes.
    pub async fn load_vendors(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<usize> {
        let resp = client.get(url).timeout(OUI_FETCH_TIMEOUT).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("OUI registry returned HTTP {}", status);
        }
        let body = resp.text().await?;
        let entries = parse_oui_registry(&body);
        let count = entries.len();
        self.extend(entries);
        Ok(count)
    }
}

/// Parse the `(base 16)` lines of the IEEE registry text:
/// `286FB9     (base 16)\t\tNokia Shanghai Bell Co., Ltd.`
pub fn parse_oui_registry(body: &str) -> Vec<(String, String)> {
    body.lines()
        .filter_map(|line| {
            let (prefix, vendor) = line.split_once("(base 16)")?;
            let prefix = prefix.trim();
            let vendor = vendor.trim();
            if prefix.len() != 6 || vendor.is_empty() {
                return None;
            }
            Some((prefix.to_ascii_uppercase(), vendor.to_string()))
        })
        .collect()
}
