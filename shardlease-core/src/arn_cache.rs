use dashmap::DashMap;
use std::sync::Arc;

use crate::stream::{build_arn, StreamIdentifier};

/// Memoized stream ARN lookups.
///
/// Constructed explicitly and handed to whoever needs ARNs, so each worker
/// (and each test) owns its own cache and invalidation is visible at the
/// call site.
#[derive(Debug, Clone)]
pub struct StreamArnCache {
    region: String,
    default_account_id: String,
    arns: Arc<DashMap<StreamIdentifier, String>>,
}

impl StreamArnCache {
    pub fn new(region: impl Into<String>, default_account_id: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            default_account_id: default_account_id.into(),
            arns: Arc::new(DashMap::new()),
        }
    }

    /// ARN of `stream`, computed on first use.
    ///
    /// Identifiers parsed from an ARN keep their own region and account;
    /// others fall back to the cache's region and default account.
    pub fn arn_for(&self, stream: &StreamIdentifier) -> String {
        if let Some(arn) = self.arns.get(stream) {
            return arn.clone();
        }
        let arn = stream.arn().unwrap_or_else(|| {
            let account = stream.account_id().unwrap_or(&self.default_account_id);
            build_arn(&self.region, account, stream.stream_name())
        });
        self.arns
            .entry(stream.clone())
            .or_insert_with(|| arn.clone());
        arn
    }

    pub fn invalidate(&self, stream: &StreamIdentifier) {
        self.arns.remove(stream);
    }

    pub fn clear(&self) {
        self.arns.clear();
    }

    pub fn len(&self) -> usize {
        self.arns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arns.is_empty()
    }
}
