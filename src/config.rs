use serde::{Deserialize, Serialize};

use crate::error::{Result, UmbraError};

/// Default flushable unit, in bytes.
pub const DEFAULT_CACHE_LINE_SIZE: u64 = 64;

/// Search strategy used to pick the next execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeuristicType {
    /// Priorities are never consulted; the searcher always falls back.
    None,
    /// Fixed whole-program weights computed once at startup.
    Static,
    /// Static weights, recomputed when the NVM-ness of a value resolves.
    InsensitiveDynamic,
    /// Per-call-context weights with value-state sensitivity.
    ContextDynamic,
}

impl HeuristicType {
    /// Flag spelling, as accepted by `heuristic-type=`.
    pub fn as_str(self) -> &'static str {
        match self {
            HeuristicType::None => "none",
            HeuristicType::Static => "static",
            HeuristicType::InsensitiveDynamic => "insensitive-dynamic",
            HeuristicType::ContextDynamic => "context-dynamic",
        }
    }

    /// Parse the flag spelling.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(HeuristicType::None),
            "static" => Ok(HeuristicType::Static),
            "insensitive-dynamic" => Ok(HeuristicType::InsensitiveDynamic),
            "context-dynamic" => Ok(HeuristicType::ContextDynamic),
            other => Err(UmbraError::Config(format!(
                "unknown heuristic type: {other}"
            ))),
        }
    }
}

/// Selector used when every state priority is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchFallback {
    /// Most recently added state first.
    Dfs,
    /// Uniformly random among ready states.
    Random,
}

/// Run-wide configuration.
///
/// Mirrors the command-line surface: `heuristic-type`, `cache-line-size`,
/// `solver-timeout`, `ignore-struct` and `tx-struct` all land here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Smallest independently flushable unit.
    pub cache_line_size: u64,
    /// Per-query solver timeout in milliseconds. Zero disables the limit.
    pub solver_timeout_ms: u64,
    /// Which searcher strategy to build.
    pub heuristic: HeuristicType,
    /// Selector used when no state has a positive priority.
    pub fallback: SearchFallback,
    /// Struct type names whose fields are filtered out of persistence
    /// queries by the volatile-filter checker.
    pub ignore_structs: Vec<String>,
    /// Struct type names whose updates must happen inside a transaction.
    pub tx_structs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_line_size: DEFAULT_CACHE_LINE_SIZE,
            solver_timeout_ms: 5000,
            heuristic: HeuristicType::Static,
            fallback: SearchFallback::Dfs,
            ignore_structs: vec!["volatile_byte".to_string()],
            tx_structs: Vec::new(),
        }
    }
}

impl Config {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(text).map_err(|e| UmbraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the checker cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.cache_line_size == 0 || !self.cache_line_size.is_power_of_two() {
            return Err(UmbraError::Config(format!(
                "cache line size must be a power of two, got {}",
                self.cache_line_size
            )));
        }
        Ok(())
    }

    /// Assignment budget for the enumeration solver, derived from the
    /// configured timeout. Zero timeout means unbounded.
    pub fn solver_budget(&self) -> u64 {
        if self.solver_timeout_ms == 0 {
            u64::MAX
        } else {
            self.solver_timeout_ms.saturating_mul(1024)
        }
    }
}
