use std::{
    fmt::{Display, Formatter},
    time::SystemTime,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Stable key of one upstream feed; sessions are deduplicated on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SourceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SourceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// One complete image parsed from the transcoder output. Immutable once
/// published; cloning shares the payload.
#[derive(Clone, Debug)]
pub struct Frame {
    seq: u64,
    captured_at: SystemTime,
    data: Bytes,
}

impl Frame {
    pub fn new(seq: u64, data: Bytes) -> Self {
        Self {
            seq,
            captured_at: SystemTime::now(),
            data,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
