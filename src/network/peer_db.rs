//! Connection-attempt bookkeeping for remote addresses.
//!
//! The downloader punishes slackers by delaying their next connection
//! attempt; the outbound connector consults this table before dialing.
//! Delays back off exponentially and decay on a successful session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

const BASE_DELAY: Duration = Duration::from_secs(10);
const MAX_DELAY: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default)]
struct AddrEntry {
    next_attempt: Option<Instant>,
    strikes: u32,
}

#[derive(Debug, Default)]
pub struct PeerDb {
    entries: HashMap<SocketAddr, AddrEntry>,
}

impl PeerDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the address's next allowed connection attempt into the
    /// future. Each strike doubles the delay up to the cap.
    pub fn delay_connection_attempt(&mut self, addr: SocketAddr, now: Instant) {
        let entry = self.entries.entry(addr).or_default();
        let delay = BASE_DELAY
            .saturating_mul(1u32 << entry.strikes.min(6))
            .min(MAX_DELAY);
        entry.strikes = entry.strikes.saturating_add(1);
        entry.next_attempt = Some(now + delay);
    }

    pub fn is_connect_allowed(&self, addr: &SocketAddr, now: Instant) -> bool {
        match self.entries.get(addr).and_then(|e| e.next_attempt) {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// A session that survived the handshake clears the strike count.
    pub fn note_good_session(&mut self, addr: SocketAddr) {
        self.entries.remove(&addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delay_blocks_then_expires() {
        let mut db = PeerDb::new();
        let a = addr(7000);
        let now = Instant::now();
        assert!(db.is_connect_allowed(&a, now));

        db.delay_connection_attempt(a, now);
        assert!(!db.is_connect_allowed(&a, now));
        assert!(db.is_connect_allowed(&a, now + BASE_DELAY));
    }

    #[tokio::test(start_paused = true)]
    async fn strikes_back_off_and_reset() {
        let mut db = PeerDb::new();
        let a = addr(7001);
        let now = Instant::now();
        db.delay_connection_attempt(a, now);
        db.delay_connection_attempt(a, now);
        // Second strike doubled the delay.
        assert!(!db.is_connect_allowed(&a, now + BASE_DELAY));
        assert!(db.is_connect_allowed(&a, now + BASE_DELAY * 2));

        db.note_good_session(a);
        db.delay_connection_attempt(a, now);
        assert!(db.is_connect_allowed(&a, now + BASE_DELAY));
    }
}
