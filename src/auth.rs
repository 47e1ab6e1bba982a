use crate::errors::{HlsError, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::net::IpAddr;

/// One entry of the read allow-list: either a bare IP or a CIDR range.
#[derive(Debug, Clone, PartialEq)]
pub enum IpRule {
    Exact(IpAddr),
    Range { network: IpAddr, prefix: u8 },
}

impl IpRule {
    /// Parses `"192.168.1.5"` or `"192.168.0.0/16"` (IPv6 likewise).
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('/') {
            None => {
                let ip = s.parse().map_err(|_| HlsError::ConfigError {
                    message: format!("invalid IP in read_ips: {}", s),
                })?;
                Ok(IpRule::Exact(ip))
            }
            Some((addr, prefix)) => {
                let network: IpAddr = addr.parse().map_err(|_| HlsError::ConfigError {
                    message: format!("invalid CIDR in read_ips: {}", s),
                })?;
                let max_prefix = match network {
                    IpAddr::V4(_) => 32,
                    IpAddr::V6(_) => 128,
                };
                let prefix: u8 = prefix.parse().map_err(|_| HlsError::ConfigError {
                    message: format!("invalid CIDR in read_ips: {}", s),
                })?;
                if prefix > max_prefix {
                    return Err(HlsError::ConfigError {
                        message: format!("invalid CIDR prefix in read_ips: {}", s),
                    });
                }
                Ok(IpRule::Range { network, prefix })
            }
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match self {
            IpRule::Exact(rule_ip) => *rule_ip == ip,
            IpRule::Range { network, prefix } => match (network, ip) {
                (IpAddr::V4(net), IpAddr::V4(ip)) => {
                    let mask = prefix_mask_v4(*prefix);
                    u32::from(*net) & mask == u32::from(ip) & mask
                }
                (IpAddr::V6(net), IpAddr::V6(ip)) => {
                    let mask = prefix_mask_v6(*prefix);
                    u128::from(*net) & mask == u128::from(ip) & mask
                }
                _ => false,
            },
        }
    }
}

fn prefix_mask_v4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix as u32)
    }
}

fn prefix_mask_v6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix as u32)
    }
}

pub fn parse_ip_rules(entries: &[String]) -> Result<Vec<IpRule>> {
    entries.iter().map(|e| IpRule::parse(e)).collect()
}

/// True when `ip` matches any rule. An empty rule list never reaches this
/// call; callers treat it as "allow all".
pub fn ip_allowed(ip: IpAddr, rules: &[IpRule]) -> bool {
    rules.iter().any(|rule| rule.contains(ip))
}

/// Validates an `Authorization: Basic ...` header value against the
/// configured read credentials.
pub fn check_basic_auth(header: Option<&str>, user: &str, pass: &str) -> bool {
    let header = match header {
        Some(h) => h,
        None => return false,
    };
    let encoded = match header.strip_prefix("Basic ") {
        Some(e) => e,
        None => return false,
    };
    let decoded = match STANDARD.decode(encoded.trim()) {
        Ok(d) => d,
        Err(_) => return false,
    };
    let decoded = match String::from_utf8(decoded) {
        Ok(s) => s,
        Err(_) => return false,
    };
    match decoded.split_once(':') {
        Some((u, p)) => u == user && p == pass,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_rule() {
        let rule = IpRule::parse("192.168.1.5").unwrap();
        assert!(rule.contains("192.168.1.5".parse().unwrap()));
        assert!(!rule.contains("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn test_range_rule() {
        let rule = IpRule::parse("10.0.0.0/8").unwrap();
        assert!(rule.contains("10.255.0.1".parse().unwrap()));
        assert!(!rule.contains("11.0.0.1".parse().unwrap()));

        let rule = IpRule::parse("192.168.0.0/16").unwrap();
        assert!(rule.contains("192.168.42.7".parse().unwrap()));
        assert!(!rule.contains("192.169.0.1".parse().unwrap()));
    }

    #[test]
    fn test_v6_range_rule() {
        let rule = IpRule::parse("fd00::/8").unwrap();
        assert!(rule.contains("fd12::1".parse().unwrap()));
        assert!(!rule.contains("fe80::1".parse().unwrap()));
        // v4 addresses never match a v6 range
        assert!(!rule.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_invalid_rules() {
        assert!(IpRule::parse("not-an-ip").is_err());
        assert!(IpRule::parse("10.0.0.0/33").is_err());
        assert!(IpRule::parse("10.0.0.0/x").is_err());
    }

    #[test]
    fn test_ip_allowed() {
        let rules = parse_ip_rules(&["127.0.0.1".to_string(), "10.0.0.0/8".to_string()]).unwrap();
        assert!(ip_allowed("127.0.0.1".parse().unwrap(), &rules));
        assert!(ip_allowed("10.1.2.3".parse().unwrap(), &rules));
        assert!(!ip_allowed("8.8.8.8".parse().unwrap(), &rules));
    }

    #[test]
    fn test_basic_auth() {
        // "user:pass"
        let header = format!("Basic {}", STANDARD.encode("user:pass"));
        assert!(check_basic_auth(Some(&header), "user", "pass"));
        assert!(!check_basic_auth(Some(&header), "user", "wrong"));
        assert!(!check_basic_auth(None, "user", "pass"));
        assert!(!check_basic_auth(Some("Bearer abc"), "user", "pass"));
        assert!(!check_basic_auth(Some("Basic !!!"), "user", "pass"));
    }
}
