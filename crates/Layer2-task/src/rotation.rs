//! Rotation Controller policy
//!
//! Decides, from a finalized run, whether to switch the active credential
//! and re-drive the task through resume. The engine performs the switch.

use crate::finalizer::Classification;
use crate::state::TaskStatus;
use yard_foundation::RotationConfig;

/// Facts about one finalized run
#[derive(Debug, Clone)]
pub struct RotationContext<'a> {
    pub prompt: Option<&'a str>,
    pub classification: &'a Classification,
    pub thread_id: Option<&'a str>,
    /// Account bound when the failing run started
    pub run_account: Option<&'a str>,
    /// Account active now
    pub active_account: Option<&'a str>,
    pub account_count: usize,
    pub auto_rotate_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NoPrompt,
    NotUsageLimit,
    NoThread,
    /// Active account changed since the run started
    StaleAccount,
    SingleAccount,
    CapReached { cap: u32 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Disabled => write!(f, "rotation disabled"),
            SkipReason::NoPrompt => write!(f, "no prompt to resume with"),
            SkipReason::NotUsageLimit => write!(f, "not a usage-limit failure"),
            SkipReason::NoThread => write!(f, "no thread id"),
            SkipReason::StaleAccount => write!(f, "run account is no longer active"),
            SkipReason::SingleAccount => write!(f, "fewer than two accounts"),
            SkipReason::CapReached { cap } => write!(f, "rotation cap {} reached", cap),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDecision {
    Rotate,
    Skip(SkipReason),
}

pub trait RotationPolicy: Send + Sync {
    fn decide(&self, ctx: &RotationContext<'_>) -> RotationDecision;
}

/// Round-robin with a cap of `accountCount - 1` unless overridden
///
/// Every rotation-driven resume counts against the cap, even when it lands
/// on an account already tried in the same chain.
#[derive(Debug, Clone)]
pub struct CappedRoundRobin {
    enabled: bool,
    max_auto_rotations: Option<u32>,
}

impl CappedRoundRobin {
    pub fn new(config: &RotationConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_auto_rotations: config.max_auto_rotations,
        }
    }

    pub fn cap(&self, account_count: usize) -> u32 {
        self.max_auto_rotations.unwrap_or_else(|| {
            u32::try_from(account_count.saturating_sub(1)).unwrap_or(u32::MAX)
        })
    }
}

impl Default for CappedRoundRobin {
    fn default() -> Self {
        Self::new(&RotationConfig::default())
    }
}

impl RotationPolicy for CappedRoundRobin {
    fn decide(&self, ctx: &RotationContext<'_>) -> RotationDecision {
        use RotationDecision::Skip;

        if !self.enabled {
            return Skip(SkipReason::Disabled);
        }
        if ctx.prompt.map_or(true, |p| p.trim().is_empty()) {
            return Skip(SkipReason::NoPrompt);
        }
        if ctx.classification.status != TaskStatus::Failed || !ctx.classification.usage_limit {
            return Skip(SkipReason::NotUsageLimit);
        }
        if ctx.thread_id.is_none() {
            return Skip(SkipReason::NoThread);
        }
        match (ctx.run_account, ctx.active_account) {
            (Some(run), Some(active)) if run == active => {}
            _ => return Skip(SkipReason::StaleAccount),
        }
        if ctx.account_count < 2 {
            return Skip(SkipReason::SingleAccount);
        }
        let cap = self.cap(ctx.account_count);
        if ctx.auto_rotate_count >= cap {
            return Skip(SkipReason::CapReached { cap });
        }
        RotationDecision::Rotate
    }
}
