//! Level unlock schedule
//!
//! Maps a user's direct-referral count onto the set of sponsor-chain levels
//! they may earn commission from. The schedule is a step function over a
//! milestone table:
//!
//! | directs | levels unlocked |
//! |---------|-----------------|
//! | 1..=8   | one level per direct (1..=8) |
//! | 9       | 9-10  |
//! | 10      | 11-15 |
//! | 15      | 16-20 |
//! | 20      | 21-25 |
//! | 25      | 26-30 |
//!
//! `direct_count` is the durable fact; the unlocked set is always derived.

use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

use crate::config::ConfigError;

/// Number of commission levels in the sponsor chain
pub const MAX_LEVEL: u8 = 30;

/// A threshold of direct referrals and the level range it grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub threshold: u32,
    pub first_level: u8,
    pub last_level: u8,
}

impl Milestone {
    pub const fn new(threshold: u32, first_level: u8, last_level: u8) -> Self {
        Self { threshold, first_level, last_level }
    }

    pub fn levels(&self) -> RangeInclusive<u8> {
        self.first_level..=self.last_level
    }
}

/// The stock milestone table
pub fn default_milestones() -> Vec<Milestone> {
    let mut milestones: Vec<Milestone> = (1..=8u8).map(|l| Milestone::new(l as u32, l, l)).collect();
    milestones.extend([
        Milestone::new(9, 9, 10),
        Milestone::new(10, 11, 15),
        Milestone::new(15, 16, 20),
        Milestone::new(20, 21, 25),
        Milestone::new(25, 26, 30),
    ]);
    milestones
}

/// Next threshold a user has not reached yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextMilestone {
    pub threshold: u32,
    pub first_level: u8,
    pub last_level: u8,
    pub directs_needed: u32,
}

/// Snapshot of a user's unlock progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockStatus {
    pub direct_count: u32,
    /// Highest unlocked level, 0 when nothing is unlocked
    pub highest_unlocked: u8,
    pub unlocked_levels: Vec<u8>,
    /// `None` once every level is unlocked
    pub next_milestone: Option<NextMilestone>,
    /// 0..=100
    pub progress_percent: u8,
}

/// Evaluates the unlock step function for a validated milestone table
#[derive(Debug, Clone)]
pub struct LevelUnlockEvaluator {
    milestones: Vec<Milestone>,
    /// Directs required for each level, index 0 = level 1
    level_thresholds: [u32; MAX_LEVEL as usize],
}

impl LevelUnlockEvaluator {
    /// Build an evaluator, rejecting tables that are not contiguous or monotonic
    ///
    /// The table must start at level 1, end at level 30, cover every level
    /// exactly once and have strictly increasing thresholds.
    pub fn new(milestones: Vec<Milestone>) -> Result<Self, ConfigError> {
        if milestones.is_empty() {
            return Err(ConfigError::invalid("unlock milestone table is empty"));
        }

        let mut expected_level = 1u8;
        let mut previous_threshold = 0u32;

        for milestone in &milestones {
            if milestone.threshold <= previous_threshold {
                return Err(ConfigError::invalid(format!(
                    "milestone thresholds must be strictly increasing (got {} after {})",
                    milestone.threshold, previous_threshold
                )));
            }
            if milestone.first_level != expected_level || milestone.last_level < milestone.first_level {
                return Err(ConfigError::invalid(format!(
                    "milestone at {} directs must start at level {} (got {}-{})",
                    milestone.threshold, expected_level, milestone.first_level, milestone.last_level
                )));
            }
            if milestone.last_level > MAX_LEVEL {
                return Err(ConfigError::invalid(format!(
                    "milestone grants level {} beyond maximum {}",
                    milestone.last_level, MAX_LEVEL
                )));
            }
            previous_threshold = milestone.threshold;
            expected_level = milestone.last_level + 1;
        }

        if expected_level != MAX_LEVEL + 1 {
            return Err(ConfigError::invalid(format!(
                "milestone table stops at level {}, expected {}",
                expected_level - 1,
                MAX_LEVEL
            )));
        }

        Ok(Self::from_table(milestones))
    }

    fn from_table(milestones: Vec<Milestone>) -> Self {
        let mut level_thresholds = [u32::MAX; MAX_LEVEL as usize];
        for milestone in &milestones {
            for level in milestone.levels() {
                if (1..=MAX_LEVEL).contains(&level) {
                    level_thresholds[(level - 1) as usize] = milestone.threshold;
                }
            }
        }
        Self { milestones, level_thresholds }
    }

    pub fn milestones(&self) -> &[Milestone] {
        &self.milestones
    }

    /// Directs required before `level` pays out
    pub fn threshold_for_level(&self, level: u8) -> Option<u32> {
        if level == 0 || level > MAX_LEVEL {
            return None;
        }
        Some(self.level_thresholds[(level - 1) as usize])
    }

    pub fn is_level_unlocked(&self, direct_count: u32, level: u8) -> bool {
        self.threshold_for_level(level)
            .map(|threshold| direct_count >= threshold)
            .unwrap_or(false)
    }

    /// Highest unlocked level (levels unlock in order, so this is also the count)
    pub fn highest_unlocked(&self, direct_count: u32) -> u8 {
        self.level_thresholds
            .iter()
            .take_while(|&&threshold| direct_count >= threshold)
            .count() as u8
    }

    pub fn unlocked_levels(&self, direct_count: u32) -> RangeInclusive<u8> {
        1..=self.highest_unlocked(direct_count)
    }

    pub fn next_milestone(&self, direct_count: u32) -> Option<NextMilestone> {
        self.milestones
            .iter()
            .find(|m| m.threshold > direct_count)
            .map(|m| NextMilestone {
                threshold: m.threshold,
                first_level: m.first_level,
                last_level: m.last_level,
                directs_needed: m.threshold - direct_count,
            })
    }

    /// Threshold at which every level is unlocked
    pub fn max_threshold(&self) -> u32 {
        self.milestones.last().map(|m| m.threshold).unwrap_or(0)
    }

    pub fn status(&self, direct_count: u32) -> UnlockStatus {
        let max_threshold = self.max_threshold();
        let progress_percent = if max_threshold == 0 || direct_count >= max_threshold {
            100
        } else {
            (direct_count as u64 * 100 / max_threshold as u64) as u8
        };

        UnlockStatus {
            direct_count,
            highest_unlocked: self.highest_unlocked(direct_count),
            unlocked_levels: self.unlocked_levels(direct_count).collect(),
            next_milestone: self.next_milestone(direct_count),
            progress_percent,
        }
    }
}

impl Default for LevelUnlockEvaluator {
    fn default() -> Self {
        Self::from_table(default_milestones())
    }
}
