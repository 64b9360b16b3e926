use anyhow::{bail, Context, Result};
use regex::Regex;

const REQUIRED_GROUPS: [&str; 4] = ["domain", "uri", "code", "time"];

/// Fields extracted from one access-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub domain: &'a str,
    pub uri: &'a str,
    pub code: u16,
    /// Response time in microseconds, validated as numeric.
    pub time: &'a str,
}

/// Regex-driven access-log line parser.
#[derive(Debug, Clone)]
pub struct LineParser {
    re: Regex,
}

impl LineParser {
    /// Compiles `pattern`, which must define the named groups `domain`,
    /// `uri`, `code` and `time`.
    pub fn new(pattern: &str) -> Result<Self> {
        let re = Regex::new(pattern).with_context(|| format!("compiling line regex {pattern}"))?;
        for group in REQUIRED_GROUPS {
            if !re.capture_names().flatten().any(|name| name == group) {
                bail!("line regex lacks the named group {group:?}");
            }
        }
        Ok(Self { re })
    }

    /// Returns `None` for lines that do not match or whose code or time is
    /// not numeric.
    pub fn parse<'a>(&self, line: &'a str) -> Option<ParsedLine<'a>> {
        let caps = self.re.captures(line)?;
        let domain = caps.name("domain")?.as_str();
        let uri = caps.name("uri")?.as_str();
        let code = caps.name("code")?.as_str().parse().ok()?;
        let time = caps.name("time")?.as_str();
        time.parse::<u64>().ok()?;

        Some(ParsedLine {
            domain,
            uri,
            code,
            time,
        })
    }
}
