//! Rewrite rule compilation and matching.
//!
//! # Responsibilities
//! - Turn a loosely typed [`RewriteRuleConfig`] into a checked [`RewriteRule`]
//! - Match protocol + domain + port, then path (exact or prefix)
//! - Rewrite the descriptor's target and, optionally, its path
//!
//! # Design Decisions
//! - Domain matching is case-insensitive (hostnames are)
//! - Path matching is case-sensitive
//! - An empty path string counts as unset

use thiserror::Error;

use crate::config::{RewriteRuleConfig, RuleEndpointConfig};
use crate::dispatch::descriptor::{OutboundDescriptor, Protocol};

/// Why a rule table entry could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RewriteError {
    #[error("{side}.protocol is missing")]
    MissingProtocol { side: &'static str },

    #[error("{side}.protocol {value:?} is not http:, https: or file:")]
    UnknownProtocol { side: &'static str, value: String },

    #[error("{side}.domain is missing")]
    MissingDomain { side: &'static str },

    #[error("{side}.port {value} is not a valid port")]
    InvalidPort { side: &'static str, value: String },
}

/// One checked side of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub domain: String,
    pub port: u16,
    pub path: Option<String>,
    pub exact: bool,
}

impl Endpoint {
    fn compile(side: &'static str, raw: &RuleEndpointConfig) -> Result<Self, RewriteError> {
        let protocol = match raw.protocol.as_deref() {
            None | Some("") => return Err(RewriteError::MissingProtocol { side }),
            Some(p) => p.parse::<Protocol>().map_err(|value| RewriteError::UnknownProtocol {
                side,
                value,
            })?,
        };

        let domain = match raw.domain.as_deref().map(str::trim) {
            Some(d) if !d.is_empty() => d.to_string(),
            // a local file target has no host
            _ if protocol == Protocol::File && side == "to" => String::new(),
            _ => return Err(RewriteError::MissingDomain { side }),
        };

        let port = match &raw.port {
            None => protocol.default_port(),
            Some(value) => value.as_port().ok_or_else(|| RewriteError::InvalidPort {
                side,
                value: value.to_string(),
            })?,
        };

        Ok(Self {
            protocol,
            domain,
            port,
            path: raw.path.clone().filter(|p| !p.is_empty()),
            exact: raw.exact,
        })
    }
}

/// A validated from/to mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub from: Endpoint,
    pub to: Endpoint,
}

impl TryFrom<&RewriteRuleConfig> for RewriteRule {
    type Error = RewriteError;

    fn try_from(raw: &RewriteRuleConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            from: Endpoint::compile("from", &raw.from)?,
            to: Endpoint::compile("to", &raw.to)?,
        })
    }
}

impl RewriteRule {
    pub fn matches(&self, descriptor: &OutboundDescriptor) -> bool {
        if self.from.protocol != descriptor.protocol
            || !self.from.domain.eq_ignore_ascii_case(&descriptor.hostname)
            || self.from.port != descriptor.port
        {
            return false;
        }

        match &self.from.path {
            None => true,
            Some(path) if self.from.exact => descriptor.pathname == *path,
            Some(path) => descriptor.pathname.starts_with(path.as_str()),
        }
    }

    /// Rewrite a descriptor this rule matched.
    ///
    /// Protocol, host and port always move to `to`. The path changes only when
    /// `to.path` is set; a prefix match into an exact target keeps the
    /// unmatched suffix of the original path.
    pub fn apply(&self, mut descriptor: OutboundDescriptor) -> OutboundDescriptor {
        let suffix = match &self.from.path {
            Some(path) if !self.from.exact => descriptor
                .pathname
                .get(path.len()..)
                .unwrap_or_default()
                .to_string(),
            _ => String::new(),
        };

        descriptor.protocol = self.to.protocol;
        descriptor.hostname = self.to.domain.clone();
        descriptor.port = self.to.port;

        if let Some(target) = &self.to.path {
            let keep_suffix = self.from.path.is_some() && self.to.exact && !self.from.exact;
            descriptor.pathname = if keep_suffix {
                format!("{target}{suffix}")
            } else {
                target.clone()
            };
        }

        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortValue;

    fn endpoint(protocol: &str, domain: &str, port: i64) -> RuleEndpointConfig {
        RuleEndpointConfig {
            protocol: Some(protocol.into()),
            domain: Some(domain.into()),
            port: Some(PortValue::Number(port)),
            ..Default::default()
        }
    }

    #[test]
    fn compiles_string_ports_and_defaults() {
        let mut raw = RewriteRuleConfig {
            from: endpoint("http:", "a.test", 80),
            to: endpoint("https", "b.test", 443),
        };
        raw.to.port = Some(PortValue::Text("8443".into()));
        let rule = RewriteRule::try_from(&raw).unwrap();
        assert_eq!(rule.to.protocol, Protocol::Https);
        assert_eq!(rule.to.port, 8443);

        raw.to.port = None;
        assert_eq!(RewriteRule::try_from(&raw).unwrap().to.port, 443);
    }

    #[test]
    fn rejects_malformed_entries() {
        let raw = RewriteRuleConfig {
            from: endpoint("ftp:", "a.test", 21),
            to: endpoint("http:", "b.test", 80),
        };
        assert!(matches!(
            RewriteRule::try_from(&raw),
            Err(RewriteError::UnknownProtocol { side: "from", .. })
        ));

        let raw = RewriteRuleConfig {
            from: endpoint("http:", "a.test", 70_000),
            to: endpoint("http:", "b.test", 80),
        };
        assert!(matches!(
            RewriteRule::try_from(&raw),
            Err(RewriteError::InvalidPort { side: "from", .. })
        ));

        let raw = RewriteRuleConfig {
            from: RuleEndpointConfig {
                domain: None,
                ..endpoint("http:", "", 80)
            },
            to: endpoint("http:", "b.test", 80),
        };
        assert_eq!(
            RewriteRule::try_from(&raw),
            Err(RewriteError::MissingDomain { side: "from" })
        );
    }

    #[test]
    fn file_target_needs_no_domain() {
        let raw = RewriteRuleConfig {
            from: endpoint("http:", "a.test", 80),
            to: RuleEndpointConfig {
                protocol: Some("file:".into()),
                path: Some("/tmp/x.json".into()),
                exact: true,
                ..Default::default()
            },
        };
        let rule = RewriteRule::try_from(&raw).unwrap();
        assert_eq!(rule.to.protocol, Protocol::File);
        assert_eq!(rule.to.port, 0);
    }
}
