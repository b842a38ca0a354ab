use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{error::RelayError, frame::SourceId};

/// Resolves a source id to the upstream it should be pulled from.
#[async_trait]
pub trait SourceDirectory: Send + Sync + 'static {
    async fn resolve(&self, source_id: &SourceId) -> Result<SourceEndpoint, RelayError>;
}

/// Upstream URL handed to the transcoder, credentials included. `Display`
/// only ever shows the URL without credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceEndpoint {
    url: String,
    display: String,
}

impl SourceEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let display = redact(&url);
        Self { url, display }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Display for SourceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display)
    }
}

impl std::fmt::Debug for SourceEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceEndpoint").field(&self.display).finish()
    }
}

fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn endpoint(&self, source_id: &SourceId) -> Result<SourceEndpoint, RelayError> {
        if self.username.is_none() && self.password.is_none() {
            return Ok(SourceEndpoint::new(&self.url));
        }

        let invalid = |reason: String| RelayError::source_unavailable(source_id, reason);
        let mut url = Url::parse(&self.url).map_err(|e| invalid(format!("invalid url: {}", e)))?;
        url.set_username(self.username.as_deref().unwrap_or_default())
            .map_err(|_| invalid("url cannot carry credentials".to_string()))?;
        url.set_password(self.password.as_deref())
            .map_err(|_| invalid("url cannot carry credentials".to_string()))?;
        Ok(SourceEndpoint::new(url.to_string()))
    }
}

/// Fixed directory loaded at startup.
#[derive(Clone, Debug, Default)]
pub struct StaticDirectory {
    entries: HashMap<SourceId, SourceEntry>,
}

impl StaticDirectory {
    pub fn new(entries: HashMap<SourceId, SourceEntry>) -> Self {
        Self { entries }
    }

    pub fn insert(&mut self, source_id: impl Into<SourceId>, entry: SourceEntry) {
        self.entries.insert(source_id.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SourceDirectory for StaticDirectory {
    async fn resolve(&self, source_id: &SourceId) -> Result<SourceEndpoint, RelayError> {
        self.entries
            .get(source_id)
            .ok_or_else(|| RelayError::UnknownSource(source_id.clone()))?
            .endpoint(source_id)
    }
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod directory_test;
