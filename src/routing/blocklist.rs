/// Per-client-IP connection error accounting
///
/// Clients that repeatedly fail the handshake get blocked at admission.
/// Keys are the 16-byte canonical address form; the whole table sits behind
/// one mutex with bounded critical sections.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, Default)]
struct ConnErrorEntry {
    count: u64,
    last_attempt: u64,
}

pub struct ConnErrorCounters {
    max_connect_errors: u64,
    /// 0 disables resetting.
    max_connect_errors_timeout: u64,
    counters: Mutex<HashMap<[u8; 16], ConnErrorEntry>>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl ConnErrorCounters {
    pub fn new(max_connect_errors: u64, max_connect_errors_timeout: u64) -> Self {
        Self {
            max_connect_errors,
            max_connect_errors_timeout,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Count a handshake failure for this client. Returns true when the
    /// client is at or over the blocking threshold.
    pub fn record_error(&self, client_ip: [u8; 16]) -> bool {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(client_ip).or_default();
        entry.last_attempt = unix_now();
        entry.count += 1;
        entry.count >= self.max_connect_errors
    }

    /// Number of errors currently recorded for this client.
    pub fn error_count(&self, client_ip: [u8; 16]) -> u64 {
        let counters = self.counters.lock().unwrap();
        counters.get(&client_ip).map(|e| e.count).unwrap_or(0)
    }

    /// Whether this client is over the threshold with a recent attempt.
    pub fn is_blocked(&self, client_ip: [u8; 16]) -> bool {
        let counters = self.counters.lock().unwrap();
        let Some(entry) = counters.get(&client_ip) else {
            return false;
        };
        if entry.count < self.max_connect_errors {
            return false;
        }
        if self.max_connect_errors_timeout == 0 {
            // resetting disabled: once blocked, always blocked
            return true;
        }
        unix_now().saturating_sub(entry.last_attempt) <= self.max_connect_errors_timeout
    }

    /// Reset the counter when the last attempt is older than the timeout.
    /// Returns whether a reset happened.
    pub fn maybe_reset(&self, client_ip: [u8; 16]) -> bool {
        if self.max_connect_errors_timeout == 0 {
            return false;
        }
        let mut counters = self.counters.lock().unwrap();
        let Some(entry) = counters.get_mut(&client_ip) else {
            return false;
        };
        if unix_now().saturating_sub(entry.last_attempt) > self.max_connect_errors_timeout {
            entry.count = 0;
            return true;
        }
        false
    }

    /// Clients currently over the blocking threshold.
    pub fn blocked_hosts(&self) -> Vec<[u8; 16]> {
        let counters = self.counters.lock().unwrap();
        counters
            .iter()
            .filter(|(_, entry)| entry.count >= self.max_connect_errors)
            .map(|(ip, _)| *ip)
            .collect()
    }

    pub fn max_connect_errors(&self) -> u64 {
        self.max_connect_errors
    }

    #[cfg(test)]
    fn backdate(&self, client_ip: [u8; 16], seconds: u64) {
        let mut counters = self.counters.lock().unwrap();
        if let Some(entry) = counters.get_mut(&client_ip) {
            entry.last_attempt = entry.last_attempt.saturating_sub(seconds);
        }
    }
}
