//! Rule table evaluation.
//!
//! # Design Decisions
//! - Linear scan in table order, first match wins
//! - Malformed entries are logged and skipped; evaluation never fails
//! - Immutable after construction (shared without locks)

use std::sync::Arc;

use crate::config::RewriteRuleConfig;
use crate::dispatch::descriptor::{OutboundDescriptor, Protocol};
use crate::rewrite::rule::RewriteRule;

/// Applies the rewrite rule table to outbound descriptors.
#[derive(Debug, Clone, Default)]
pub struct RewriteEngine {
    rules: Arc<[RewriteRuleConfig]>,
}

impl RewriteEngine {
    pub fn new(rules: Vec<RewriteRuleConfig>) -> Self {
        Self {
            rules: rules.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First usable rule matching `descriptor`, with its table index.
    pub fn find_match(&self, descriptor: &OutboundDescriptor) -> Option<(usize, RewriteRule)> {
        for (index, raw) in self.rules.iter().enumerate() {
            let rule = match RewriteRule::try_from(raw) {
                Ok(rule) => rule,
                Err(e) => {
                    tracing::warn!(rule = index, error = %e, "Skipping malformed rewrite rule");
                    continue;
                }
            };
            if rule.matches(descriptor) {
                return Some((index, rule));
            }
        }
        None
    }

    /// Rewrite `descriptor` with the first matching rule; unchanged if none match.
    pub fn apply(&self, descriptor: OutboundDescriptor) -> OutboundDescriptor {
        let Some((index, rule)) = self.find_match(&descriptor) else {
            return descriptor;
        };

        let before = descriptor.href();
        let mut rewritten = rule.apply(descriptor);

        // keep the Host header pointed at the connection target
        if rewritten.protocol != Protocol::File && rewritten.headers.contains("host") {
            let authority = rewritten.authority();
            if let Err(e) = rewritten.headers.set("host", &authority) {
                tracing::warn!(rule = index, error = %e, "Could not rewrite Host header");
            }
        }

        tracing::debug!(rule = index, from = %before, to = %rewritten.href(), "Rewrite rule applied");
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortValue, RuleEndpointConfig};
    use crate::http::headers::HeaderSet;
    use axum::http::Method;

    fn descriptor(host: &str, port: u16, path: &str) -> OutboundDescriptor {
        OutboundDescriptor {
            protocol: Protocol::Http,
            hostname: host.into(),
            port,
            method: Method::GET,
            pathname: path.into(),
            query: Some("x=1".into()),
            headers: HeaderSet::from_raw([("Host", host)]),
            extensions: Default::default(),
        }
    }

    fn side(protocol: &str, domain: &str, port: i64, path: Option<&str>, exact: bool) -> RuleEndpointConfig {
        RuleEndpointConfig {
            protocol: Some(protocol.into()),
            domain: Some(domain.into()),
            port: Some(PortValue::Number(port)),
            path: path.map(Into::into),
            exact,
        }
    }

    fn rule(from: RuleEndpointConfig, to: RuleEndpointConfig) -> RewriteRuleConfig {
        RewriteRuleConfig { from, to }
    }

    #[test]
    fn first_matching_rule_wins() {
        let engine = RewriteEngine::new(vec![
            rule(
                side("http:", "api.test", 80, None, false),
                side("http:", "first.test", 8001, None, false),
            ),
            rule(
                side("http:", "api.test", 80, None, false),
                side("http:", "second.test", 8002, None, false),
            ),
        ]);

        let out = engine.apply(descriptor("api.test", 80, "/widgets"));
        assert_eq!(out.hostname, "first.test");
        assert_eq!(out.port, 8001);
    }

    #[test]
    fn no_match_leaves_descriptor_unchanged() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "api.test", 8080, None, false),
            side("http:", "other.test", 80, None, false),
        )]);

        let out = engine.apply(descriptor("api.test", 80, "/widgets"));
        assert_eq!(out.hostname, "api.test");
        assert_eq!(out.href(), "http://api.test:80/widgets?x=1");
    }

    #[test]
    fn exact_to_exact_replaces_path_without_suffix() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "api.test", 80, Some("/old"), true),
            side("http:", "api.test", 80, Some("/new"), true),
        )]);

        let out = engine.apply(descriptor("api.test", 80, "/old"));
        assert_eq!(out.pathname, "/new");
        assert_eq!(out.path(), "/new?x=1");

        // exact origin path does not match a longer path
        let untouched = engine.apply(descriptor("api.test", 80, "/old/more"));
        assert_eq!(untouched.pathname, "/old/more");
    }

    #[test]
    fn prefix_to_exact_appends_unmatched_suffix() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "api.test", 80, Some("/v1"), false),
            side("https:", "mirror.test", 443, Some("/mirror/v2"), true),
        )]);

        let out = engine.apply(descriptor("api.test", 80, "/v1/widgets/7"));
        assert_eq!(out.protocol, Protocol::Https);
        assert_eq!(out.pathname, "/mirror/v2/widgets/7");
        assert_eq!(out.path(), "/mirror/v2/widgets/7?x=1");
        assert_eq!(out.headers.get("host"), Some("mirror.test"));
    }

    #[test]
    fn prefix_to_prefix_replaces_whole_path() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "api.test", 80, Some("/v1"), false),
            side("http:", "api.test", 80, Some("/v2"), false),
        )]);

        let out = engine.apply(descriptor("api.test", 80, "/v1/widgets"));
        assert_eq!(out.pathname, "/v2");
    }

    #[test]
    fn target_only_rule_keeps_path() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "api.test", 80, None, false),
            side("http:", "127.0.0.1", 9000, None, false),
        )]);

        let out = engine.apply(descriptor("api.test", 80, "/widgets"));
        assert_eq!(out.pathname, "/widgets");
        assert_eq!(out.authority(), "127.0.0.1:9000");
        assert_eq!(out.headers.get("host"), Some("127.0.0.1:9000"));
        // original casing survives the value change
        assert_eq!(out.headers.restore().keys().collect::<Vec<_>>(), ["Host"]);
    }

    #[test]
    fn malformed_rule_is_skipped_not_fatal() {
        let engine = RewriteEngine::new(vec![
            rule(
                side("gopher:", "api.test", 80, None, false),
                side("http:", "never.test", 80, None, false),
            ),
            rule(
                side("http:", "api.test", 80, None, false),
                side("http:", "good.test", 80, None, false),
            ),
        ]);

        let (index, _) = engine.find_match(&descriptor("api.test", 80, "/")).unwrap();
        assert_eq!(index, 1);
        assert_eq!(engine.apply(descriptor("api.test", 80, "/")).hostname, "good.test");
    }

    #[test]
    fn domain_match_ignores_case() {
        let engine = RewriteEngine::new(vec![rule(
            side("http:", "API.Test", 80, None, false),
            side("http:", "lower.test", 80, None, false),
        )]);
        assert_eq!(engine.apply(descriptor("api.test", 80, "/")).hostname, "lower.test");
    }
}
