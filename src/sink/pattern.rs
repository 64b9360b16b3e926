use std::fmt::Write;
use std::path::PathBuf;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, TimeZone};

use super::SinkError;

/// strftime template for output file names, validated up front so formatting
/// never fails at rotation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilenamePattern {
    template: String,
}

impl FilenamePattern {
    pub fn new(template: &str) -> Result<Self, SinkError> {
        if template.is_empty() || StrftimeItems::new(template).any(|item| matches!(item, Item::Error)) {
            return Err(SinkError::Pattern {
                pattern: template.to_string(),
            });
        }
        Ok(Self {
            template: template.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// File name for the instant `at`.
    pub fn format<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> Result<PathBuf, SinkError>
    where
        Tz::Offset: std::fmt::Display,
    {
        let mut name = String::with_capacity(self.template.len() + 16);
        write!(name, "{}", at.format(&self.template)).map_err(|_| SinkError::Pattern {
            pattern: self.template.clone(),
        })?;
        Ok(PathBuf::from(name))
    }
}
