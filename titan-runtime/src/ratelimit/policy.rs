//! Rate-limit policies and endpoint mapping
//!
//! A policy is a named set of rules that must all pass. Endpoint
//! mappings bind path globs to policy names; they are evaluated in
//! insertion order and the first match wins. A path with no mapping and
//! no configured default is a configuration error: admission fails hard
//! rather than silently allowing.

use regex::Regex;

use crate::error::{Error, Result};

/// One window rule: at most `max_hits` per `period_secs`, violation arms
/// a `timeout_secs` lockout
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimitRule {
    #[prost(uint32, tag = "1")]
    pub max_hits: u32,
    #[prost(uint64, tag = "2")]
    pub period_secs: u64,
    #[prost(uint64, tag = "3")]
    pub timeout_secs: u64,
}

/// A named set of rules, all evaluated per request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimitPolicy {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub rules: Vec<RateLimitRule>,
}

/// Glob-pattern binding of endpoints to a policy
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EndpointMapping {
    /// Path glob where `*` matches any characters
    #[prost(string, tag = "1")]
    pub pattern: String,
    #[prost(string, tag = "2")]
    pub policy: String,
}

/// The authoritative rate-limiting configuration, owned by the config
/// grain and cached by silos
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RateLimitingConfiguration {
    #[prost(bool, tag = "1")]
    pub enabled: bool,
    #[prost(message, repeated, tag = "2")]
    pub policies: Vec<RateLimitPolicy>,
    /// Evaluated in order; first match wins
    #[prost(message, repeated, tag = "3")]
    pub endpoint_mappings: Vec<EndpointMapping>,
    /// Fallback policy name; empty means no fallback
    #[prost(string, tag = "4")]
    pub default_policy: String,
    #[prost(bool, tag = "5")]
    pub collect_metrics: bool,
}

impl RateLimitingConfiguration {
    /// The configuration a fresh deployment starts from
    pub fn builtin_defaults() -> Self {
        Self {
            enabled: true,
            policies: vec![
                RateLimitPolicy {
                    name: "Auth".to_string(),
                    rules: vec![RateLimitRule {
                        max_hits: 10,
                        period_secs: 60,
                        timeout_secs: 300,
                    }],
                },
                RateLimitPolicy {
                    name: "Global".to_string(),
                    rules: vec![
                        RateLimitRule {
                            max_hits: 120,
                            period_secs: 60,
                            timeout_secs: 60,
                        },
                        RateLimitRule {
                            max_hits: 2000,
                            period_secs: 3600,
                            timeout_secs: 600,
                        },
                    ],
                },
            ],
            endpoint_mappings: vec![
                EndpointMapping {
                    pattern: "/api/auth/*".to_string(),
                    policy: "Auth".to_string(),
                },
                EndpointMapping {
                    pattern: "/*".to_string(),
                    policy: "Global".to_string(),
                },
            ],
            default_policy: "Global".to_string(),
            collect_metrics: true,
        }
    }

    /// Look up a policy by name
    pub fn policy(&self, name: &str) -> Option<&RateLimitPolicy> {
        self.policies.iter().find(|p| p.name == name)
    }

    /// Insert or replace a policy by name
    pub fn upsert_policy(&mut self, policy: RateLimitPolicy) {
        match self.policies.iter_mut().find(|p| p.name == policy.name) {
            Some(existing) => *existing = policy,
            None => self.policies.push(policy),
        }
    }
}

/// Compile a `*`-glob into an anchored regex
fn compile_glob(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '.' | '+' | '?' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' | '{' | '}' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            _ => regex_str.push(c),
        }
    }
    regex_str.push('$');
    Regex::new(&regex_str)
        .map_err(|e| Error::Internal(format!("bad endpoint glob {pattern:?}: {e}")))
}

/// Whether a glob matches a path; `*` matches any characters
pub fn glob_match(pattern: &str, path: &str) -> bool {
    compile_glob(pattern)
        .map(|re| re.is_match(path))
        .unwrap_or(false)
}

/// Endpoint mappings compiled once per configuration fetch
pub struct CompiledEndpointMappings {
    entries: Vec<(Regex, String)>,
    default_policy: Option<String>,
}

impl CompiledEndpointMappings {
    /// Compile the configuration's mappings in their authoritative order
    pub fn compile(config: &RateLimitingConfiguration) -> Result<Self> {
        let entries = config
            .endpoint_mappings
            .iter()
            .map(|m| Ok((compile_glob(&m.pattern)?, m.policy.clone())))
            .collect::<Result<Vec<_>>>()?;
        let default_policy = if config.default_policy.is_empty() {
            None
        } else {
            Some(config.default_policy.clone())
        };
        Ok(Self {
            entries,
            default_policy,
        })
    }

    /// Resolve the policy name for a request path: first matching glob,
    /// then the default. No mapping and no default is a hard error.
    pub fn policy_name_for(&self, path: &str) -> Result<&str> {
        for (regex, policy) in &self.entries {
            if regex.is_match(path) {
                return Ok(policy);
            }
        }
        self.default_policy
            .as_deref()
            .ok_or_else(|| Error::Internal(format!("no rate-limit mapping for path {path:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_any_characters() {
        assert!(glob_match("/api/auth/*", "/api/auth/login"));
        assert!(glob_match("/api/auth/*", "/api/auth/refresh"));
        assert!(glob_match("/api/auth/*", "/api/auth/a/b/c"));
        assert!(!glob_match("/api/auth/*", "/api/users/1"));
        assert!(glob_match("/*", "/anything/at/all"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        assert!(glob_match("/api/v1.0/*", "/api/v1.0/items"));
        assert!(!glob_match("/api/v1.0/*", "/api/v1x0/items"));
    }

    #[test]
    fn first_matching_mapping_wins() {
        let config = RateLimitingConfiguration {
            enabled: true,
            policies: vec![],
            endpoint_mappings: vec![
                EndpointMapping {
                    pattern: "/api/auth/*".into(),
                    policy: "Auth".into(),
                },
                EndpointMapping {
                    pattern: "/*".into(),
                    policy: "Global".into(),
                },
            ],
            default_policy: String::new(),
            collect_metrics: false,
        };
        let compiled = CompiledEndpointMappings::compile(&config).unwrap();

        assert_eq!(compiled.policy_name_for("/api/auth/x").unwrap(), "Auth");
        assert_eq!(compiled.policy_name_for("/api/x").unwrap(), "Global");
    }

    #[test]
    fn missing_mapping_without_default_fails_hard() {
        let config = RateLimitingConfiguration {
            enabled: true,
            policies: vec![],
            endpoint_mappings: vec![EndpointMapping {
                pattern: "/api/*".into(),
                policy: "Api".into(),
            }],
            default_policy: String::new(),
            collect_metrics: false,
        };
        let compiled = CompiledEndpointMappings::compile(&config).unwrap();

        let err = compiled.policy_name_for("/health").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn default_policy_catches_unmapped_paths() {
        let config = RateLimitingConfiguration {
            default_policy: "Global".into(),
            ..RateLimitingConfiguration::builtin_defaults()
        };
        let compiled = CompiledEndpointMappings::compile(&config).unwrap();
        assert_eq!(compiled.policy_name_for("/totally/unmapped").unwrap(), "Global");
    }

    #[test]
    fn upsert_replaces_by_name() {
        let mut config = RateLimitingConfiguration::builtin_defaults();
        let count = config.policies.len();
        config.upsert_policy(RateLimitPolicy {
            name: "Auth".into(),
            rules: vec![RateLimitRule {
                max_hits: 5,
                period_secs: 60,
                timeout_secs: 120,
            }],
        });
        assert_eq!(config.policies.len(), count);
        assert_eq!(config.policy("Auth").unwrap().rules[0].max_hits, 5);
    }
}
