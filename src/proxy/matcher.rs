//! Destination matching for proxy servers.
//!
//! Destinations are `(host, port)` pairs where the host is a DNS name or an
//! IP literal. Deny patterns are evaluated before allow patterns and the
//! default with no match is deny.

use std::net::IpAddr;

use crate::config::NetworkConfig;

/// Filter decision for a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    /// Allow the connection.
    Allow,
    /// Deny the connection.
    Deny,
}

/// A single parsed destination pattern.
#[derive(Debug, Clone, PartialEq)]
pub enum HostPattern {
    /// `*`: matches every destination.
    Universal,
    /// Exact host, optionally pinned to a port.
    Exact { host: String, port: Option<u16> },
    /// `*.suffix`: matches any label sequence under the suffix, not the apex.
    Wildcard { suffix: String, port: Option<u16> },
    /// CIDR block, v4 or v6.
    Cidr { net: IpAddr, prefix: u8 },
}

impl HostPattern {
    /// Parse a pattern string. Returns a human-readable reason on failure.
    pub fn parse(pattern: &str) -> Result<Self, String> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err("pattern is empty".to_string());
        }

        if pattern == "*" {
            return Ok(HostPattern::Universal);
        }

        if let Some((addr, prefix)) = pattern.split_once('/') {
            let net: IpAddr = addr
                .parse()
                .map_err(|_| format!("'{addr}' is not an IP address"))?;
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| format!("'{prefix}' is not a prefix length"))?;
            let max = match net {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix > max {
                return Err(format!("prefix /{prefix} exceeds /{max}"));
            }
            return Ok(HostPattern::Cidr { net, prefix });
        }

        let (host, port) = split_host_port(pattern)?;
        let host = host.to_lowercase();

        if let Some(suffix) = host.strip_prefix("*.") {
            if suffix.is_empty() {
                return Err("wildcard needs a suffix".to_string());
            }
            validate_hostname(suffix)?;
            return Ok(HostPattern::Wildcard {
                suffix: suffix.to_string(),
                port,
            });
        }

        if host.parse::<IpAddr>().is_err() {
            validate_hostname(&host)?;
        }

        Ok(HostPattern::Exact { host, port })
    }

    /// Check whether a destination matches this pattern.
    /// `host` must already be normalized via [`normalize_host`].
    pub fn matches(&self, host: &str, port: u16) -> bool {
        match self {
            HostPattern::Universal => true,
            HostPattern::Exact {
                host: pattern_host,
                port: pattern_port,
            } => {
                if pattern_port.map(|p| p != port).unwrap_or(false) {
                    return false;
                }
                if host == pattern_host {
                    return true;
                }
                // IP literals can differ textually (e.g. `::1` vs its long form).
                match (host.parse::<IpAddr>(), pattern_host.parse::<IpAddr>()) {
                    (Ok(a), Ok(b)) => a == b,
                    _ => false,
                }
            }
            HostPattern::Wildcard {
                suffix,
                port: pattern_port,
            } => {
                if pattern_port.map(|p| p != port).unwrap_or(false) {
                    return false;
                }
                host.len() > suffix.len() + 1 && host.ends_with(&format!(".{suffix}"))
            }
            HostPattern::Cidr { net, prefix } => match host.parse::<IpAddr>() {
                Ok(addr) => cidr_contains(*net, *prefix, addr),
                Err(_) => false,
            },
        }
    }

    /// Tie-break rank: exact > CIDR > wildcard > universal.
    pub fn specificity(&self) -> u8 {
        match self {
            HostPattern::Exact { .. } => 3,
            HostPattern::Cidr { .. } => 2,
            HostPattern::Wildcard { .. } => 1,
            HostPattern::Universal => 0,
        }
    }
}

/// Split an optional `:port` suffix off a pattern, handling bracketed IPv6.
fn split_host_port(pattern: &str) -> Result<(String, Option<u16>), String> {
    if let Some(rest) = pattern.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated '[' in address".to_string())?;
        let port = match tail.strip_prefix(':') {
            Some(p) => Some(parse_port(p)?),
            None if tail.is_empty() => None,
            None => return Err(format!("trailing '{tail}' after address")),
        };
        return Ok((addr.to_string(), port));
    }

    // A bare IPv6 literal contains ':' but is not host:port.
    if pattern.parse::<IpAddr>().is_ok() {
        return Ok((pattern.to_string(), None));
    }

    match pattern.rsplit_once(':') {
        Some((host, p)) if !host.is_empty() => Ok((host.to_string(), Some(parse_port(p)?))),
        Some(_) => Err("missing host before ':'".to_string()),
        None => Ok((pattern.to_string(), None)),
    }
}

fn parse_port(s: &str) -> Result<u16, String> {
    let port: u16 = s.parse().map_err(|_| format!("'{s}' is not a port"))?;
    if port == 0 {
        return Err("port 0 is not addressable".to_string());
    }
    Ok(port)
}

fn validate_hostname(host: &str) -> Result<(), String> {
    for ch in host.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '-' && ch != '_' {
            return Err(format!("invalid character '{ch}' in hostname"));
        }
    }
    Ok(())
}

fn cidr_contains(net: IpAddr, prefix: u8, addr: IpAddr) -> bool {
    match (net, addr) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u32::MAX << (32 - prefix as u32)
            };
            (u32::from(net) & mask) == (u32::from(addr) & mask)
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if prefix == 0 {
                0
            } else {
                u128::MAX << (128 - prefix as u32)
            };
            (u128::from(net) & mask) == (u128::from(addr) & mask)
        }
        _ => false,
    }
}

/// Normalize a destination host for matching: lowercase, brackets stripped.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    host.to_lowercase()
}

/// Destination filter shared by the HTTP and SOCKS5 proxies.
#[derive(Debug, Clone, Default)]
pub struct HostFilter {
    allowed: Vec<HostPattern>,
    denied: Vec<HostPattern>,
}

impl HostFilter {
    /// Build a filter from a validated network config.
    /// Patterns that fail to parse here were already rejected by validation;
    /// they are skipped defensively.
    pub fn from_config(config: &NetworkConfig) -> Self {
        let parse_all = |patterns: &[String]| {
            patterns
                .iter()
                .filter_map(|p| HostPattern::parse(p).ok())
                .collect()
        };

        Self {
            allowed: parse_all(&config.allowed_domains),
            denied: parse_all(&config.denied_domains),
        }
    }

    /// Build a filter from already-parsed patterns.
    pub fn new(allowed: Vec<HostPattern>, denied: Vec<HostPattern>) -> Self {
        Self { allowed, denied }
    }

    /// Decide a destination. Denies win; default is deny.
    pub fn check(&self, host: &str, port: u16) -> FilterDecision {
        self.explain(host, port).0
    }

    /// Decide a destination and report the pattern that decided it.
    /// The reported pattern is the most specific match, first in input order
    /// among equals.
    pub fn explain(&self, host: &str, port: u16) -> (FilterDecision, Option<&HostPattern>) {
        let host = normalize_host(host);

        if let Some(hit) = best_match(&self.denied, &host, port) {
            return (FilterDecision::Deny, Some(hit));
        }

        if let Some(hit) = best_match(&self.allowed, &host, port) {
            return (FilterDecision::Allow, Some(hit));
        }

        (FilterDecision::Deny, None)
    }
}

fn best_match<'a>(patterns: &'a [HostPattern], host: &str, port: u16) -> Option<&'a HostPattern> {
    let mut best: Option<&HostPattern> = None;
    for pattern in patterns {
        if !pattern.matches(host, port) {
            continue;
        }
        match best {
            Some(b) if b.specificity() >= pattern.specificity() => {}
            _ => best = Some(pattern),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(allow: &[&str], deny: &[&str]) -> HostFilter {
        HostFilter::new(
            allow.iter().map(|p| HostPattern::parse(p).unwrap()).collect(),
            deny.iter().map(|p| HostPattern::parse(p).unwrap()).collect(),
        )
    }

    #[test]
    fn test_default_is_deny() {
        let f = filter(&[], &[]);
        assert_eq!(f.check("example.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_exact_match() {
        let f = filter(&["example.com"], &[]);
        assert_eq!(f.check("example.com", 443), FilterDecision::Allow);
        assert_eq!(f.check("EXAMPLE.COM", 443), FilterDecision::Allow);
        assert_eq!(f.check("api.example.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_wildcard_not_apex() {
        let f = filter(&["*.example.com"], &[]);
        assert_eq!(f.check("api.example.com", 443), FilterDecision::Allow);
        assert_eq!(f.check("deep.api.example.com", 443), FilterDecision::Allow);
        assert_eq!(f.check("example.com", 443), FilterDecision::Deny);
        assert_eq!(f.check("notexample.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_port_pinned_pattern() {
        let f = filter(&["example.com:8443"], &[]);
        assert_eq!(f.check("example.com", 8443), FilterDecision::Allow);
        assert_eq!(f.check("example.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let f = filter(&["example.com"], &["example.com"]);
        assert_eq!(f.check("example.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_deny_inside_wildcard_allow() {
        let f = filter(&["*.example.com"], &["internal.example.com"]);
        assert_eq!(f.check("api.example.com", 443), FilterDecision::Allow);
        assert_eq!(f.check("internal.example.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_cidr_v4() {
        let f = filter(&["10.0.0.0/8"], &[]);
        assert_eq!(f.check("10.1.2.3", 80), FilterDecision::Allow);
        assert_eq!(f.check("11.1.2.3", 80), FilterDecision::Deny);
        assert_eq!(f.check("not-an-ip.example", 80), FilterDecision::Deny);
    }

    #[test]
    fn test_cidr_v6() {
        let f = filter(&["fd00::/8"], &[]);
        assert_eq!(f.check("fd12::1", 80), FilterDecision::Allow);
        assert_eq!(f.check("[fd12::1]", 80), FilterDecision::Allow);
        assert_eq!(f.check("2001:db8::1", 80), FilterDecision::Deny);
    }

    #[test]
    fn test_ipv6_textual_forms_equal() {
        let f = filter(&["::1"], &[]);
        assert_eq!(f.check("0:0:0:0:0:0:0:1", 80), FilterDecision::Allow);
    }

    #[test]
    fn test_universal() {
        let f = filter(&["*"], &["evil.com"]);
        assert_eq!(f.check("anything.example", 443), FilterDecision::Allow);
        assert_eq!(f.check("evil.com", 443), FilterDecision::Deny);
    }

    #[test]
    fn test_specificity_reporting() {
        let f = filter(&["*", "10.0.0.0/8", "10.1.2.3"], &[]);
        let (decision, hit) = f.explain("10.1.2.3", 80);
        assert_eq!(decision, FilterDecision::Allow);
        assert_eq!(
            hit,
            Some(&HostPattern::Exact {
                host: "10.1.2.3".to_string(),
                port: None
            })
        );
    }

    #[test]
    fn test_first_match_wins_among_equal_specificity() {
        let f = filter(&["a.example.com", "a.example.com:443"], &[]);
        let (_, hit) = f.explain("a.example.com", 443);
        assert_eq!(
            hit,
            Some(&HostPattern::Exact {
                host: "a.example.com".to_string(),
                port: None
            })
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(HostPattern::parse("").is_err());
        assert!(HostPattern::parse("10.0.0.0/99").is_err());
        assert!(HostPattern::parse("example.com:0").is_err());
        assert!(HostPattern::parse("example.com:notaport").is_err());
        assert!(HostPattern::parse("*.").is_err());
        assert!(HostPattern::parse("bad host.com").is_err());
        assert!(HostPattern::parse("[::1").is_err());
    }

    #[test]
    fn test_parse_bracketed_v6_with_port() {
        let p = HostPattern::parse("[::1]:8080").unwrap();
        assert!(p.matches(&normalize_host("::1"), 8080));
        assert!(!p.matches(&normalize_host("::1"), 8081));
    }
}
