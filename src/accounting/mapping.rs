use anyhow::{Context, Result};
use regex::Regex;

use crate::config::RequestMappingConfig;

/// Class assigned to static content and to requests no mapping claims.
pub const NOT_MATCHED: &str = "NOT MATCHED";

/// Resolves a request identifier into the request classes it is accounted
/// under.
///
/// Mappings are evaluated in configured order and every matching mapping
/// yields a class, so a single request can fan out into several buckets.
#[derive(Debug, Clone)]
pub struct RequestMapper {
    static_content: Option<Regex>,
    mappings: Vec<(String, Regex)>,
}

impl RequestMapper {
    pub fn new(static_content: Option<Regex>, mappings: Vec<(String, Regex)>) -> Self {
        Self {
            static_content,
            mappings,
        }
    }

    /// Compiles the mapper from configuration.
    pub fn from_config(static_content: &str, mappings: &[RequestMappingConfig]) -> Result<Self> {
        let static_content = if static_content.is_empty() {
            None
        } else {
            Some(
                Regex::new(static_content)
                    .with_context(|| format!("compiling static content regex {static_content}"))?,
            )
        };

        let mappings = mappings
            .iter()
            .map(|m| {
                let re = Regex::new(&m.regex)
                    .with_context(|| format!("compiling request mapping {}", m.name))?;
                Ok((m.name.clone(), re))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(static_content, mappings))
    }

    /// Identity mapper: every request is its own class.
    pub fn identity() -> Self {
        Self::new(None, Vec::new())
    }

    /// Returns the classes `request` is accounted under, in mapping order.
    pub fn resolve<'a>(&'a self, request: &'a str) -> Vec<&'a str> {
        if let Some(re) = &self.static_content {
            if re.is_match(request) {
                return vec![NOT_MATCHED];
            }
        }

        if self.mappings.is_empty() {
            return vec![request];
        }

        let matched: Vec<&str> = self
            .mappings
            .iter()
            .filter(|(_, re)| re.is_match(request))
            .map(|(name, _)| name.as_str())
            .collect();

        if matched.is_empty() {
            return vec![NOT_MATCHED];
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_re() -> Regex {
        Regex::new(crate::config::DEFAULT_STATIC_CONTENT_REGEX).expect("valid regex")
    }

    #[test]
    fn test_identity_mapping() {
        let mapper = RequestMapper::identity();
        assert_eq!(mapper.resolve("/theFoo"), vec!["/theFoo"]);
    }

    #[test]
    fn test_static_content_is_not_matched() {
        let mapper = RequestMapper::new(Some(static_re()), Vec::new());
        assert_eq!(mapper.resolve("/theFoo/gag.gif"), vec![NOT_MATCHED]);
        assert_eq!(mapper.resolve("/theFoo/style.CSS"), vec![NOT_MATCHED]);
        assert_eq!(mapper.resolve("/theFoo"), vec!["/theFoo"]);
    }

    #[test]
    fn test_fan_out_in_configured_order() {
        let mapper = RequestMapper::new(
            Some(static_re()),
            vec![
                ("api".to_string(), Regex::new("^/api/").expect("valid")),
                ("all".to_string(), Regex::new(".*").expect("valid")),
                ("admin".to_string(), Regex::new("^/admin").expect("valid")),
            ],
        );

        assert_eq!(mapper.resolve("/api/users"), vec!["api", "all"]);
        assert_eq!(mapper.resolve("/admin/x"), vec!["all", "admin"]);
        assert_eq!(mapper.resolve("/logo.png"), vec![NOT_MATCHED]);
    }

    #[test]
    fn test_unclaimed_request_is_not_matched() {
        let mapper = RequestMapper::new(
            None,
            vec![("api".to_string(), Regex::new("^/api/").expect("valid"))],
        );
        assert_eq!(mapper.resolve("/home"), vec![NOT_MATCHED]);
    }

    #[test]
    fn test_from_config_rejects_bad_regex() {
        let err = RequestMapper::from_config(
            "",
            &[RequestMappingConfig {
                name: "broken".to_string(),
                regex: "(".to_string(),
            }],
        )
        .unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
