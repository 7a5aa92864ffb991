use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Result, StoreError};
use crate::lease::Checkpoint;

/// Identity of a tracked stream.
///
/// A single-stream instance carries only the stream name. A multi-stream
/// instance also carries the owning account and either the creation epoch
/// (`account:stream:epoch`) or the region it was resolved from when built
/// out of a stream ARN.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamIdentifier {
    account_id: Option<String>,
    stream_name: String,
    creation_epoch: Option<u64>,
    region: Option<String>,
}

const ARN_PREFIX: &str = "arn:";
const ARN_SERVICE: &str = "kinesis";

impl StreamIdentifier {
    /// Single-stream instance from a stream name or a stream ARN.
    pub fn single_stream_instance(stream_name_or_arn: &str) -> Result<Self> {
        if stream_name_or_arn.is_empty() {
            return Err(StoreError::InvalidStreamIdentifier(
                "stream name should not be empty".to_string(),
            ));
        }
        if let Some(from_arn) = Self::from_arn(stream_name_or_arn) {
            return Ok(from_arn);
        }
        Ok(Self {
            account_id: None,
            stream_name: stream_name_or_arn.to_owned(),
            creation_epoch: None,
            region: None,
        })
    }

    /// Multi-stream instance from `account:stream:epoch` or a stream ARN.
    pub fn multi_stream_instance(serialization_or_arn: &str) -> Result<Self> {
        Self::from_serialization(serialization_or_arn)
            .or_else(|| Self::from_arn(serialization_or_arn))
            .ok_or_else(|| {
                StoreError::InvalidStreamIdentifier(format!(
                    "unable to deserialize stream identifier from {}",
                    serialization_or_arn
                ))
            })
    }

    /// Multi-stream instance built from its parts.
    pub fn from_parts(account_id: &str, stream_name: &str, creation_epoch: u64) -> Result<Self> {
        Self::multi_stream_instance(&format!("{}:{}:{}", account_id, stream_name, creation_epoch))
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref()
    }

    pub fn creation_epoch(&self) -> Option<u64> {
        self.creation_epoch
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    pub fn is_multi_stream(&self) -> bool {
        self.account_id.is_some()
    }

    /// Serialized form used in lease keys.
    ///
    /// Single-stream instances serialize to the stream name. Multi-stream
    /// instances serialize to `account:stream:epoch`, or to their ARN when no
    /// epoch is known, so that `multi_stream_instance(serialize())` round-trips.
    pub fn serialize(&self) -> String {
        match (&self.account_id, self.creation_epoch) {
            (None, _) => self.stream_name.clone(),
            (Some(account), Some(epoch)) => format!("{}:{}:{}", account, self.stream_name, epoch),
            (Some(account), None) => {
                let region = self.region.as_deref().unwrap_or_default();
                build_arn(region, account, &self.stream_name)
            }
        }
    }

    /// ARN of the stream when both account and region are known.
    pub fn arn(&self) -> Option<String> {
        match (&self.account_id, &self.region) {
            (Some(account), Some(region)) => Some(build_arn(region, account, &self.stream_name)),
            _ => None,
        }
    }

    fn from_serialization(input: &str) -> Option<Self> {
        let mut parts = input.split(':');
        let account = parts.next()?;
        let stream_name = parts.next()?;
        let epoch = parts.next()?;
        if parts.next().is_some()
            || !is_digits(account)
            || stream_name.is_empty()
            || !is_digits(epoch)
        {
            return None;
        }
        Some(Self {
            account_id: Some(account.to_owned()),
            stream_name: stream_name.to_owned(),
            creation_epoch: epoch.parse().ok(),
            region: None,
        })
    }

    /// Parses `arn:<partition>:kinesis:<region>:<account>:stream/<name>`.
    fn from_arn(input: &str) -> Option<Self> {
        let rest = input.strip_prefix(ARN_PREFIX)?;
        let mut parts = rest.splitn(5, ':');
        let partition = parts.next()?;
        let service = parts.next()?;
        let region = parts.next()?;
        let account = parts.next()?;
        let resource = parts.next()?;
        let stream_name = resource.strip_prefix("stream/")?;

        let region_ok = !region.is_empty()
            && region
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !partition.starts_with("aws")
            || service != ARN_SERVICE
            || !region_ok
            || account.len() != 12
            || !is_digits(account)
            || stream_name.is_empty()
        {
            return None;
        }
        Some(Self {
            account_id: Some(account.to_owned()),
            stream_name: stream_name.to_owned(),
            creation_epoch: None,
            region: Some(region.to_owned()),
        })
    }
}

impl fmt::Display for StreamIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

pub(crate) fn build_arn(region: &str, account_id: &str, stream_name: &str) -> String {
    format!(
        "arn:aws:{}:{}:{}:stream/{}",
        ARN_SERVICE, region, account_id, stream_name
    )
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Where consumption of a newly discovered shard starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    Latest,
    TrimHorizon,
    /// Milliseconds since the Unix epoch.
    AtTimestamp(u64),
}

impl InitialPosition {
    pub fn initial_checkpoint(&self) -> Checkpoint {
        match self {
            InitialPosition::Latest => Checkpoint::Latest,
            InitialPosition::TrimHorizon => Checkpoint::TrimHorizon,
            InitialPosition::AtTimestamp(ts) => Checkpoint::AtTimestamp(*ts),
        }
    }
}

/// A stream to consume and where to start on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub stream_identifier: StreamIdentifier,
    pub initial_position: InitialPosition,
    pub stream_arn: Option<String>,
}

impl StreamConfig {
    pub fn new(stream_identifier: StreamIdentifier, initial_position: InitialPosition) -> Self {
        let stream_arn = stream_identifier.arn();
        Self {
            stream_identifier,
            initial_position,
            stream_arn,
        }
    }

    pub fn with_arn(mut self, arn: impl Into<String>) -> Self {
        self.stream_arn = Some(arn.into());
        self
    }
}

#[cfg(test)]
#[path = "stream_test.rs"]
mod stream_test;
