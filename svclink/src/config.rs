//! Hub configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Settings of a [`Hub`](crate::Hub)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Name used in logs
    pub name: String,
    /// Dispatcher threads spawned by [`Hub::start`](crate::Hub::start)
    pub threads: Vec<String>,
    /// Answer requests for roles without a stub with `MessageUndelivered`
    pub bounce_undelivered: bool,
    /// Log every routed envelope at debug level
    pub log_envelopes: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: "svclink".to_string(),
            threads: Vec::new(),
            bounce_undelivered: true,
            log_envelopes: false,
        }
    }
}

impl HubConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parse and validate a JSON configuration. Missing fields take their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: HubConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_thread(mut self, name: impl Into<String>) -> Self {
        self.threads.push(name.into());
        self
    }

    pub fn with_bounce_undelivered(mut self, bounce: bool) -> Self {
        self.bounce_undelivered = bounce;
        self
    }

    pub fn with_log_envelopes(mut self, log: bool) -> Self {
        self.log_envelopes = log;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::configuration("hub name is empty", Some("name".to_string())));
        }
        let mut seen = HashSet::new();
        for thread in &self.threads {
            if thread.trim().is_empty() {
                return Err(Error::configuration(
                    "thread name is empty",
                    Some("threads".to_string()),
                ));
            }
            if !seen.insert(thread.as_str()) {
                return Err(Error::configuration(
                    format!("thread '{thread}' is listed twice"),
                    Some("threads".to_string()),
                ));
            }
        }
        Ok(())
    }
}
