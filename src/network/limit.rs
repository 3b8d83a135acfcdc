//! Accept-side connection rate limiting.
//!
//! Sources are grouped by prefix (/32 for v4, /64 for v6 by default) and
//! each group gets a per-window connection budget. Overrides for wider
//! CIDRs live in a radix tree and win by longest prefix.

use crate::config::RateLimitConfig;
use crate::util::PrefixMap;
use std::collections::HashMap;
use std::net::IpAddr;

struct Window {
    started: i64,
    count: u32,
}

pub struct ConnLimiter {
    default_budget: u32,
    window_secs: u64,
    v4_prefix: u8,
    v6_prefix: u8,
    overrides: PrefixMap<u32>,
    windows: HashMap<(u128, u8), Window>,
}

fn group_key(addr: IpAddr, v4_prefix: u8, v6_prefix: u8) -> (u128, u8) {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u128::from(v4.to_ipv6_mapped());
            let len = 96 + v4_prefix;
            (mask_bits(bits, len), len)
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            (mask_bits(bits, v6_prefix), v6_prefix)
        }
    }
}

fn mask_bits(bits: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - len as u32))
    }
}

impl ConnLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mut overrides = PrefixMap::new();
        for block in &config.cidr_overrides {
            // Config validation already vetted these.
            if let Ok(net) = block.net.parse::<ipnet::IpNet>() {
                overrides.insert(net.addr(), net.prefix_len(), block.connections);
            }
        }
        ConnLimiter {
            default_budget: config.connections,
            window_secs: config.window_secs.max(1),
            v4_prefix: config.v4_prefix.min(32),
            v6_prefix: config.v6_prefix.min(128),
            overrides,
            windows: HashMap::new(),
        }
    }

    /// Account one connection attempt; false means over budget.
    pub fn allow(&mut self, addr: IpAddr, now: i64) -> bool {
        let budget = self
            .overrides
            .lookup(addr)
            .copied()
            .unwrap_or(self.default_budget);
        let key = group_key(addr, self.v4_prefix, self.v6_prefix);
        let window_secs = self.window_secs as i64;

        let window = self.windows.entry(key).or_insert(Window {
            started: now,
            count: 0,
        });
        if now - window.started >= window_secs {
            window.started = now;
            window.count = 0;
        }
        window.count += 1;
        window.count <= budget
    }

    /// Drop windows that have rolled over, so the map stays bounded.
    pub fn sweep(&mut self, now: i64) {
        let window_secs = self.window_secs as i64;
        self.windows.retain(|_, w| now - w.started < window_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CidrLimit;

    fn limiter(connections: u32, overrides: Vec<CidrLimit>) -> ConnLimiter {
        let config = RateLimitConfig {
            connections,
            window_secs: 10,
            cidr_overrides: overrides,
            ..Default::default()
        };
        ConnLimiter::new(&config)
    }

    #[test]
    fn budget_per_window() {
        let mut limiter = limiter(2, vec![]);
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert!(limiter.allow(ip, 0));
        assert!(limiter.allow(ip, 0));
        assert!(!limiter.allow(ip, 0));
        // Window rolls over.
        assert!(limiter.allow(ip, 10));
    }

    #[test]
    fn cidr_override_wins_by_longest_prefix() {
        let mut limiter = limiter(2, vec![
            CidrLimit {
                net: "10.0.0.0/8".to_string(),
                connections: 1,
            },
            CidrLimit {
                net: "10.1.0.0/16".to_string(),
                connections: 5,
            },
        ]);
        let narrow: IpAddr = "10.1.2.3".parse().unwrap();
        let wide: IpAddr = "10.9.9.9".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.allow(narrow, 0));
        }
        assert!(!limiter.allow(narrow, 0));

        assert!(limiter.allow(wide, 0));
        assert!(!limiter.allow(wide, 0));
    }

    #[test]
    fn distinct_sources_have_distinct_windows() {
        let mut limiter = limiter(1, vec![]);
        assert!(limiter.allow("192.0.2.1".parse().unwrap(), 0));
        assert!(limiter.allow("192.0.2.2".parse().unwrap(), 0));
        assert!(!limiter.allow("192.0.2.1".parse().unwrap(), 0));
    }

    #[test]
    fn sweep_drops_stale_windows() {
        let mut limiter = limiter(1, vec![]);
        limiter.allow("192.0.2.1".parse().unwrap(), 0);
        limiter.sweep(100);
        assert!(limiter.windows.is_empty());
    }
}
