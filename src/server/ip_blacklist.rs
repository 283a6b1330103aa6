// IP address blacklist

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use ipnet::IpNet;
use tokio::sync::Mutex;

use crate::base::Clock;

/// Addresses refused at accept time
///
/// Configured ranges never expire. Entries added at runtime carry an
/// expiration time and are erased when a lookup finds them stale.
pub struct IpBlacklist {
    /// Permanent ranges
    ranges: Vec<IpNet>,

    /// Runtime entries: IP -> expiration (unix milliseconds)
    entries: Mutex<HashMap<IpAddr, i64>>,

    clock: Arc<dyn Clock>,
}

impl IpBlacklist {
    /// Creates new IpBlacklist
    pub fn new(ranges: Vec<IpNet>, clock: Arc<dyn Clock>) -> IpBlacklist {
        IpBlacklist {
            ranges,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Blacklists an address
    ///
    /// # Arguments
    ///
    /// * `ip` - The address
    /// * `duration_sec` - Seconds until the entry expires
    pub async fn add(&self, ip: IpAddr, duration_sec: u32) {
        let expires_at = self.clock.now_ms() + duration_sec as i64 * 1000;

        let mut entries = self.entries.lock().await;
        entries.insert(ip, expires_at);
    }

    /// Checks an address
    ///
    /// # Return value
    ///
    /// Returns true if connections from the address must be refused
    pub async fn contains(&self, ip: &IpAddr) -> bool {
        if self.ranges.iter().any(|r| r.contains(ip)) {
            return true;
        }

        let mut entries = self.entries.lock().await;

        match entries.get(ip) {
            Some(expires_at) => {
                if *expires_at > self.clock.now_ms() {
                    true
                } else {
                    entries.remove(ip);
                    false
                }
            }
            None => false,
        }
    }
}

// Tests
