// =============================================================================
// Shared types used across the Borealis pipeline
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::meta::TsMillis;

/// Which market family a stream belongs to.
///
/// Venue messages that cannot be resolved to `Spot` or `Futures` are decoded
/// as `Unknown` and dropped by the normalizer with a warning; they never reach
/// downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
    Unknown,
}

impl MarketType {
    pub fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl std::fmt::Display for MarketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Futures => write!(f, "futures"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Taker side of a trade or liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Sign applied to sizes when accumulating volume delta.
    pub fn delta_sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "Buy"),
            Self::Sell => write!(f, "Sell"),
        }
    }
}

/// Execution mode of the pipeline as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PipelineMode {
    Live,
    Paper,
    Backtest,
}

impl Default for PipelineMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::Paper => write!(f, "PAPER"),
            Self::Backtest => write!(f, "BACKTEST"),
        }
    }
}

/// Lifecycle state owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Lifecycle {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::Starting
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopping => write!(f, "STOPPING"),
            Self::Stopped => write!(f, "STOPPED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Control-plane snapshot published on `control:state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlState {
    pub mode: PipelineMode,
    pub paused: bool,
    pub lifecycle: Lifecycle,
    pub started_at: TsMillis,
    pub last_command_at: Option<TsMillis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command_reason: Option<String>,
    pub shutting_down: bool,
}

impl ControlState {
    pub fn new(mode: PipelineMode, started_at: TsMillis) -> Self {
        Self {
            mode,
            paused: false,
            lifecycle: Lifecycle::Starting,
            started_at,
            last_command_at: None,
            last_command: None,
            last_command_reason: None,
            shutting_down: false,
        }
    }
}

/// The four dimensions of market-data readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Block {
    Price,
    Flow,
    Liquidity,
    Derivatives,
}

impl Block {
    pub const ALL: [Block; 4] = [Block::Price, Block::Flow, Block::Liquidity, Block::Derivatives];
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Price => write!(f, "price"),
            Self::Flow => write!(f, "flow"),
            Self::Liquidity => write!(f, "liquidity"),
            Self::Derivatives => write!(f, "derivatives"),
        }
    }
}
