//! Layered configuration: `config.toml` + CLI flags + environment,
//! following the teacher's `config::Config` + global `OnceCell` idiom
//! (`src/config.rs`), generalized into a typed `AppConfig` struct so unit
//! tests can construct one without touching global state.

use std::path::PathBuf;

use clap::Parser;
use once_cell::sync::OnceCell;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::types::BootstrapMode;

static GLOBAL_CONFIG: OnceCell<AppConfig> = OnceCell::new();

pub fn init_global_config(config: AppConfig) -> Result<(), ConfigError> {
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| ConfigError::Invalid {
            key: "global".into(),
            reason: "config already initialized".into(),
        })
}

pub fn get_global_config() -> &'static AppConfig {
    GLOBAL_CONFIG.get().unwrap_or_else(|| {
        tracing::error!("config not initialized - call init_global_config() first");
        std::process::exit(1);
    })
}

/// CLI surface from spec §6.
#[derive(Debug, Parser)]
#[command(name = "ubt-consumer", about = "UBT conversion daemon")]
pub struct Cli {
    #[arg(long)]
    pub outbox_rpc_endpoint: String,

    #[arg(long)]
    pub datadir: PathBuf,

    #[arg(long, default_value_t = 256)]
    pub apply_commit_interval: u64,

    #[arg(long, default_value_t = 5_000)]
    pub apply_commit_max_latency_ms: u64,

    #[arg(long, value_enum, default_value = "tail")]
    pub bootstrap_mode: BootstrapModeArg,

    #[arg(long, default_value = "path")]
    pub triedb_scheme: String,

    #[arg(long, default_value_t = 1024)]
    pub triedb_state_history: u64,

    #[arg(long, default_value_t = 64)]
    pub max_recoverable_reorg_depth: u64,

    #[arg(long, default_value_t = 1000)]
    pub backpressure_lag_threshold: u64,

    #[arg(long, default_value_t = 64)]
    pub outbox_read_ahead: usize,

    #[arg(long, default_value_t = 64)]
    pub block_root_index_stride_high_lag: u64,

    #[arg(long, default_value_t = 1000)]
    pub anchor_snapshot_interval: u64,

    #[arg(long, default_value_t = 10_000)]
    pub recovery_anchor_interval: u64,

    #[arg(long, default_value_t = false)]
    pub recovery_strict: bool,

    #[arg(long, default_value_t = true)]
    pub slot_index_enabled: bool,

    #[arg(long, default_value_t = 0)]
    pub cancun_block: u64,

    #[arg(long, default_value_t = false)]
    pub validation_strict: bool,

    #[arg(long, default_value_t = false)]
    pub validation_halt_on_mismatch: bool,

    #[arg(long, default_value_t = 100)]
    pub validation_sample_rate: u64,

    /// Spec.md §8 scenario 6: validate every diff against the archive
    /// without ever mutating the trie. AppliedSeq/AppliedBlock still
    /// advance; AppliedRoot is pinned at whatever it already was.
    #[arg(long, default_value_t = false)]
    pub validate_only: bool,

    #[arg(long, default_value_t = true)]
    pub query_rpc_enabled: bool,

    #[arg(long, default_value = "0.0.0.0:8645")]
    pub query_rpc_listen_addr: String,

    #[arg(long, default_value_t = false)]
    pub execution_class_rpc_enabled: bool,

    #[arg(long, default_value_t = 30_000)]
    pub rpc_timeout_ms: u64,

    #[arg(long, default_value_t = 5_000)]
    pub reconnect_delay_ms: u64,

    #[arg(long, default_value_t = 64)]
    pub compaction_safety_margin: u64,

    #[arg(long, default_value_t = 30)]
    pub compaction_interval_secs: u64,

    #[arg(long)]
    pub archive_rpc_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapModeArg {
    Tail,
    BackfillDirect,
}

impl From<BootstrapModeArg> for BootstrapMode {
    fn from(v: BootstrapModeArg) -> Self {
        match v {
            BootstrapModeArg::Tail => BootstrapMode::Tail,
            BootstrapModeArg::BackfillDirect => BootstrapMode::BackfillDirect,
        }
    }
}

/// Fully-resolved, validated daemon configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub outbox_rpc_endpoint: String,
    pub archive_rpc_endpoint: Option<String>,
    pub datadir: PathBuf,
    pub apply_commit_interval: u64,
    pub apply_commit_max_latency_ms: u64,
    pub bootstrap_mode: BootstrapMode,
    pub triedb_scheme: String,
    pub triedb_state_history: u64,
    pub max_recoverable_reorg_depth: u64,
    pub backpressure_lag_threshold: u64,
    pub outbox_read_ahead: usize,
    pub block_root_index_stride_high_lag: u64,
    pub anchor_snapshot_interval: u64,
    pub recovery_anchor_interval: u64,
    pub recovery_strict: bool,
    pub slot_index_enabled: bool,
    pub cancun_block: u64,
    pub validation_strict: bool,
    pub validation_halt_on_mismatch: bool,
    pub validation_sample_rate: u64,
    pub validate_only: bool,
    pub query_rpc_enabled: bool,
    pub query_rpc_listen_addr: String,
    pub execution_class_rpc_enabled: bool,
    pub rpc_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub compaction_safety_margin: u64,
    pub compaction_interval_secs: u64,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = self.max_recoverable_reorg_depth + 64;
        if self.triedb_state_history < required {
            return Err(ConfigError::HistoryTooShort {
                history: self.triedb_state_history,
                depth: self.max_recoverable_reorg_depth,
            });
        }
        if self.triedb_scheme != "path" {
            return Err(ConfigError::Invalid {
                key: "triedb-scheme".into(),
                reason: "only 'path' is supported (non-path-layered schemes are a non-goal)".into(),
            });
        }
        Ok(())
    }
}

impl From<Cli> for AppConfig {
    fn from(cli: Cli) -> Self {
        AppConfig {
            outbox_rpc_endpoint: cli.outbox_rpc_endpoint,
            archive_rpc_endpoint: cli.archive_rpc_endpoint,
            datadir: cli.datadir,
            apply_commit_interval: cli.apply_commit_interval,
            apply_commit_max_latency_ms: cli.apply_commit_max_latency_ms,
            bootstrap_mode: cli.bootstrap_mode.into(),
            triedb_scheme: cli.triedb_scheme,
            triedb_state_history: cli.triedb_state_history,
            max_recoverable_reorg_depth: cli.max_recoverable_reorg_depth,
            backpressure_lag_threshold: cli.backpressure_lag_threshold,
            outbox_read_ahead: cli.outbox_read_ahead,
            block_root_index_stride_high_lag: cli.block_root_index_stride_high_lag,
            anchor_snapshot_interval: cli.anchor_snapshot_interval,
            recovery_anchor_interval: cli.recovery_anchor_interval,
            recovery_strict: cli.recovery_strict,
            slot_index_enabled: cli.slot_index_enabled,
            cancun_block: cli.cancun_block,
            validation_strict: cli.validation_strict,
            validation_halt_on_mismatch: cli.validation_halt_on_mismatch,
            validation_sample_rate: cli.validation_sample_rate,
            validate_only: cli.validate_only,
            query_rpc_enabled: cli.query_rpc_enabled,
            query_rpc_listen_addr: cli.query_rpc_listen_addr,
            execution_class_rpc_enabled: cli.execution_class_rpc_enabled,
            rpc_timeout_ms: cli.rpc_timeout_ms,
            reconnect_delay_ms: cli.reconnect_delay_ms,
            compaction_safety_margin: cli.compaction_safety_margin,
            compaction_interval_secs: cli.compaction_interval_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            outbox_rpc_endpoint: "http://127.0.0.1:9090".into(),
            archive_rpc_endpoint: None,
            datadir: PathBuf::from("/tmp/ubt"),
            apply_commit_interval: 256,
            apply_commit_max_latency_ms: 5_000,
            bootstrap_mode: BootstrapMode::Tail,
            triedb_scheme: "path".into(),
            triedb_state_history: 1024,
            max_recoverable_reorg_depth: 64,
            backpressure_lag_threshold: 1000,
            outbox_read_ahead: 64,
            block_root_index_stride_high_lag: 64,
            anchor_snapshot_interval: 1000,
            recovery_anchor_interval: 10_000,
            recovery_strict: false,
            slot_index_enabled: true,
            cancun_block: 0,
            validation_strict: false,
            validation_halt_on_mismatch: false,
            validation_sample_rate: 100,
            validate_only: false,
            query_rpc_enabled: true,
            query_rpc_listen_addr: "0.0.0.0:8645".into(),
            execution_class_rpc_enabled: false,
            rpc_timeout_ms: 30_000,
            reconnect_delay_ms: 5_000,
            compaction_safety_margin: 64,
            compaction_interval_secs: 30,
        }
    }

    #[test]
    fn rejects_state_history_shorter_than_reorg_depth_plus_margin() {
        let mut cfg = base_config();
        cfg.triedb_state_history = 100;
        cfg.max_recoverable_reorg_depth = 64;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::HistoryTooShort { .. })
        ));
    }

    #[test]
    fn accepts_history_at_exact_boundary() {
        let mut cfg = base_config();
        cfg.max_recoverable_reorg_depth = 64;
        cfg.triedb_state_history = 128;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_path_scheme() {
        let mut cfg = base_config();
        cfg.triedb_scheme = "hash".into();
        assert!(cfg.validate().is_err());
    }
}
