//! Client IP extraction and allow/blocklist matching, per SPEC_FULL.md §4.6
//! step 2-3. Grounded in the teacher's `server::rate_limit::extract_client_ip`,
//! extended with `trustProxy`/`trustedProxyCount`-aware forwarded-for parsing
//! and CIDR range matching (no new crate: the pack has no CIDR-parsing
//! dependency, so ranges are matched by hand against `std::net` types).

use std::net::{IpAddr, SocketAddr};

use axum::extract::ConnectInfo;
use http::request::Parts;

/// One configured entry: either a single address or a CIDR range.
enum Entry {
    Single(IpAddr),
    Cidr(IpAddr, u8),
}

impl Entry {
    fn parse(raw: &str) -> Option<Self> {
        if let Some((addr, prefix)) = raw.split_once('/') {
            let addr: IpAddr = addr.trim().parse().ok()?;
            let prefix: u8 = prefix.trim().parse().ok()?;
            Some(Entry::Cidr(addr, prefix))
        } else {
            raw.trim().parse().ok().map(Entry::Single)
        }
    }

    fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Entry::Single(entry) => *entry == ip,
            Entry::Cidr(base, prefix) => match (base, ip) {
                (IpAddr::V4(base), IpAddr::V4(ip)) => {
                    let prefix = (*prefix).min(32);
                    let mask = if prefix == 0 { 0u32 } else { u32::MAX << (32 - prefix) };
                    (u32::from(*base) & mask) == (u32::from(ip) & mask)
                }
                (IpAddr::V6(base), IpAddr::V6(ip)) => {
                    let prefix = (*prefix).min(128);
                    let mask = if prefix == 0 { 0u128 } else { u128::MAX << (128 - prefix) };
                    (u128::from(*base) & mask) == (u128::from(ip) & mask)
                }
                _ => false,
            },
        }
    }
}

/// Parsed allow/blocklist, ready for O(n) membership checks (n is the
/// handful of configured ranges, not request volume).
pub struct IpFilter {
    allowlist: Vec<Entry>,
    blocklist: Vec<Entry>,
}

impl IpFilter {
    /// Parse the configured string entries. Malformed entries are skipped
    /// with a warning rather than failing construction, since a typo'd range
    /// shouldn't take the whole gateway down.
    pub fn new(ip_allowlist: &[String], ip_blocklist: &[String]) -> Self {
        Self {
            allowlist: parse_entries(ip_allowlist),
            blocklist: parse_entries(ip_blocklist),
        }
    }

    /// Whether `ip` matches a configured allowlist entry.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.allowlist.iter().any(|entry| entry.matches(ip))
    }

    /// Whether `ip` matches a configured blocklist entry.
    pub fn is_blocked(&self, ip: IpAddr) -> bool {
        self.blocklist.iter().any(|entry| entry.matches(ip))
    }
}

fn parse_entries(raw: &[String]) -> Vec<Entry> {
    raw.iter()
        .filter_map(|entry| {
            let parsed = Entry::parse(entry);

            if parsed.is_none() {
                log::warn!("ignoring malformed ip range in allow/blocklist: {entry}");
            }

            parsed
        })
        .collect()
}

/// Extract the caller's IP: the socket address if the service was run with
/// `into_make_service_with_connect_info`, or the forwarded-for header chain
/// when `trust_proxy` is set.
///
/// With `trust_proxy`, the list is read right-to-left, skipping
/// `trusted_proxy_count` entries that are assumed to be our own proxies, and
/// the next entry is trusted as the real client. Without it, `X-Forwarded-For`
/// is ignored entirely to avoid trusting a spoofable header.
pub fn extract_client_ip(parts: &Parts, trust_proxy: bool, trusted_proxy_count: usize) -> Option<IpAddr> {
    if trust_proxy && let Some(forwarded_for) = parts.headers.get("x-forwarded-for") {
        let value = forwarded_for.to_str().ok()?;
        let hops: Vec<&str> = value.split(',').map(str::trim).collect();

        if trusted_proxy_count < hops.len() {
            let candidate = hops[hops.len() - 1 - trusted_proxy_count];
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    if let Some(connect_info) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    if trust_proxy && let Some(real_ip) = parts.headers.get("x-real-ip") {
        return real_ip.to_str().ok()?.parse().ok();
    }

    None
}
