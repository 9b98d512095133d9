//! Sales configuration.
//!
//! Loaded from `SALEFLOW_*` environment variables (unset or unparsable values fall
//! back to defaults with a warning) or from a JSON document.

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use saleflow_analytic::ReconcileSettings;
use saleflow_observability::{LogConfig, LogFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SalesConfig {
    /// Prefix of generated order names (`SO001`).
    pub order_prefix: String,
    /// Minimum digits of the order counter.
    pub order_padding: usize,
    /// Sequence gap between lines added by hand.
    pub line_sequence_step: i64,
    /// Sequence of the first reinvoiced line on an order without lines.
    pub reinvoice_sequence: i64,
    /// Extra attempts after losing a compare-and-set race on an order.
    pub cas_retries: u32,
    /// Terms note put on new quotations that carry none.
    pub default_note: String,
    pub log: LogConfig,
}

impl Default for SalesConfig {
    fn default() -> Self {
        Self {
            order_prefix: "SO".to_string(),
            order_padding: 3,
            line_sequence_step: 10,
            reinvoice_sequence: 100,
            cas_retries: 3,
            default_note: String::new(),
            log: LogConfig::default(),
        }
    }
}

impl SalesConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            order_prefix: lookup("SALEFLOW_ORDER_PREFIX").unwrap_or(defaults.order_prefix),
            order_padding: parsed(&lookup, "SALEFLOW_ORDER_PADDING", defaults.order_padding),
            line_sequence_step: parsed(&lookup, "SALEFLOW_LINE_SEQUENCE_STEP", defaults.line_sequence_step),
            reinvoice_sequence: parsed(&lookup, "SALEFLOW_REINVOICE_SEQUENCE", defaults.reinvoice_sequence),
            cas_retries: parsed(&lookup, "SALEFLOW_CAS_RETRIES", defaults.cas_retries),
            default_note: lookup("SALEFLOW_DEFAULT_NOTE").unwrap_or(defaults.default_note),
            log: LogConfig {
                filter: lookup("SALEFLOW_LOG_FILTER").unwrap_or(defaults.log.filter),
                format: parsed::<LogFormat>(&lookup, "SALEFLOW_LOG_FORMAT", defaults.log.format),
            },
        }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json).context("invalid saleflow configuration")
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn order_name(&self, counter: u64) -> String {
        format!("{}{:0width$}", self.order_prefix, counter, width = self.order_padding)
    }

    /// Install the global tracing subscriber described by `log`.
    pub fn init_tracing(&self) {
        saleflow_observability::init(&self.log);
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            reinvoice_sequence: self.reinvoice_sequence,
            cas_retries: self.cas_retries,
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = ?default, "unparsable setting; using default");
            default
        }),
    }
}
