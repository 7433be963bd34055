//! Cluster configuration
//!
//! Every section has defaults, so a JSON file only needs the fields it
//! changes.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::erasure::CodingScheme;
use crate::stripe_list::{StripeAlgorithm, StripeListParams};
use crate::{Error, Result};

/// Erasure coding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodingConfig {
    pub scheme: CodingScheme,
    /// Number of data chunks
    pub k: usize,
    /// Number of parity chunks
    pub m: usize,
    /// Size of each chunk in bytes
    pub chunk_size: usize,
}

impl Default for CodingConfig {
    fn default() -> Self {
        Self {
            scheme: CodingScheme::Cauchy,
            k: 4,
            m: 2,
            chunk_size: 4096,
        }
    }
}

/// Stripe list generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripeConfig {
    pub num_lists: usize,
    pub algorithm: StripeAlgorithm,
    /// Ring positions per list
    pub replicas: u32,
    /// Seed for [`StripeAlgorithm::Random`]
    pub seed: u64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            num_lists: 16,
            algorithm: StripeAlgorithm::LoadAware,
            replicas: 64,
            seed: 0,
        }
    }
}

/// Overload detection and transition pacing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapConfig {
    /// A server is overloaded above this multiple of the average latency
    pub start_threshold: f64,
    /// A degraded server is restored below this multiple of the average
    pub stop_threshold: f64,
    /// Absolute latency floor (seconds) below which nothing is overloaded
    pub overload_threshold: f64,
    /// Transitions only happen on explicit request
    pub manual: bool,
    /// Maximum number of servers remapped at once
    pub maximum: usize,
    /// Interval of the router's parity-backup ack ticker
    pub ack_timeout_ms: u64,
    /// How long the coordinator waits for router acks; 0 waits forever
    pub ack_wait_timeout_ms: u64,
    /// Backed-up parity deltas acknowledged per batch
    pub ack_batch_size: u32,
}

impl Default for RemapConfig {
    fn default() -> Self {
        Self {
            start_threshold: 1.5,
            stop_threshold: 0.8,
            overload_threshold: 0.0001,
            manual: false,
            maximum: 1,
            ack_timeout_ms: 1000,
            ack_wait_timeout_ms: 0,
            ack_batch_size: 1000,
        }
    }
}

impl RemapConfig {
    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Deadline for collecting acks, if any
    pub fn ack_wait_timeout(&self) -> Option<Duration> {
        (self.ack_wait_timeout_ms > 0).then(|| Duration::from_millis(self.ack_wait_timeout_ms))
    }
}

/// Configuration for a remapping cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub coding: CodingConfig,
    pub stripe: StripeConfig,
    pub remap: RemapConfig,
}

impl Config {
    /// Create a configuration for `k` data and `m` parity chunks
    pub fn new(scheme: CodingScheme, k: usize, m: usize) -> Self {
        Self {
            coding: CodingConfig {
                scheme,
                k,
                m,
                ..CodingConfig::default()
            },
            ..Self::default()
        }
    }

    /// Load and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let CodingConfig { scheme, k, m, chunk_size } = self.coding;
        if k == 0 {
            return Err(Error::InvalidConfig("data chunks must be greater than 0".into()));
        }
        if chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk size must be greater than 0".into()));
        }
        let parity_ok = match scheme {
            CodingScheme::Raid0 => m == 0,
            CodingScheme::Raid1 => k == 1 && m >= 1,
            CodingScheme::Raid5 => m == 1,
            CodingScheme::Rdp | CodingScheme::EvenOdd => m == 2,
            CodingScheme::Cauchy | CodingScheme::ReedSolomon => m >= 1,
        };
        if !parity_ok {
            return Err(Error::InvalidConfig(format!(
                "{} does not support k = {}, m = {}",
                scheme, k, m
            )));
        }
        if self.stripe.num_lists == 0 {
            return Err(Error::InvalidConfig("at least one stripe list is required".into()));
        }

        let remap = &self.remap;
        if !(remap.stop_threshold > 0.0 && remap.start_threshold > remap.stop_threshold) {
            return Err(Error::InvalidConfig(format!(
                "thresholds must satisfy start > stop > 0, got start = {}, stop = {}",
                remap.start_threshold, remap.stop_threshold
            )));
        }
        if remap.overload_threshold <= 0.0 {
            return Err(Error::InvalidConfig("overload threshold must be positive".into()));
        }
        Ok(())
    }

    /// Total chunks per stripe
    pub fn chunks_per_stripe(&self) -> usize {
        self.coding.k + self.coding.m
    }

    /// Maximum number of node failures we can tolerate
    pub fn max_failures(&self) -> usize {
        self.coding.m
    }

    pub fn stripe_params(&self) -> StripeListParams {
        StripeListParams {
            chunks: self.chunks_per_stripe(),
            data_chunks: self.coding.k,
            num_lists: self.stripe.num_lists,
            algorithm: self.stripe.algorithm,
            replicas: self.stripe.replicas,
            seed: self.stripe.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_failures(), 2);
        assert_eq!(config.chunks_per_stripe(), 6);
        assert_eq!(config.remap.ack_wait_timeout(), None);
    }

    #[test]
    fn test_parity_rules_per_scheme() {
        assert!(Config::new(CodingScheme::Raid0, 4, 0).validate().is_ok());
        assert!(Config::new(CodingScheme::Raid0, 4, 1).validate().is_err());
        assert!(Config::new(CodingScheme::Raid5, 4, 2).validate().is_err());
        assert!(Config::new(CodingScheme::Rdp, 4, 2).validate().is_ok());
        assert!(Config::new(CodingScheme::EvenOdd, 4, 3).validate().is_err());
        assert!(Config::new(CodingScheme::Cauchy, 4, 0).validate().is_err());
        assert!(Config::new(CodingScheme::Cauchy, 0, 2).validate().is_err());
    }

    #[test]
    fn test_threshold_rules() {
        let mut config = Config::default();
        config.remap.start_threshold = 0.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));

        let mut config = Config::default();
        config.remap.overload_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json(
            r#"{ "coding": { "scheme": "rdp", "k": 6 }, "remap": { "ack_wait_timeout_ms": 250 } }"#,
        )
        .unwrap();
        assert_eq!(config.coding.scheme, CodingScheme::Rdp);
        assert_eq!(config.coding.k, 6);
        assert_eq!(config.coding.m, 2);
        assert_eq!(config.stripe.num_lists, 16);
        assert_eq!(config.remap.ack_wait_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(matches!(Config::from_json("{ not json"), Err(Error::Json(_))));
        assert!(Config::from_json(r#"{ "coding": { "scheme": "raid5", "m": 2 } }"#).is_err());
    }
}
