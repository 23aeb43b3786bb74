//! Engine configuration: fan-out limits, timeouts and retry bounds.

use serde::{Deserialize, Serialize};

/// Runtime configuration for the campaign engine. All fields have
/// conservative defaults; hosts typically load this from their own
/// config file and pass it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of per-donor generation calls in flight at once.
    #[serde(default = "default_max_parallel_generations")]
    pub max_parallel_generations: usize,
    /// Timeout for a single per-donor generation call, in seconds.
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    /// Timeout for a single send-job dispatch, in seconds.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Maximum dispatch attempts before a job is marked failed.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    /// Delay before a failed dispatch is retried, in seconds.
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    /// Interval between executor ticks, in seconds.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Idle lifetime of an abandoned agentic flow before eviction, in seconds.
    #[serde(default = "default_flow_ttl_secs")]
    pub flow_ttl_secs: u64,
    /// Maximum clarification questions before the flow moves to confirmation.
    #[serde(default = "default_max_clarification_questions")]
    pub max_clarification_questions: u32,
}

fn default_max_parallel_generations() -> usize {
    4
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_max_send_attempts() -> u32 {
    3
}

fn default_retry_backoff_secs() -> u64 {
    600
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_flow_ttl_secs() -> u64 {
    1800
}

fn default_max_clarification_questions() -> u32 {
    2
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_generations: default_max_parallel_generations(),
            generation_timeout_secs: default_generation_timeout_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_send_attempts: default_max_send_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            flow_ttl_secs: default_flow_ttl_secs(),
            max_clarification_questions: default_max_clarification_questions(),
        }
    }
}
