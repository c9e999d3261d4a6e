//! Experience levels, unlocked abilities and specialization tiers

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Swarm roles a node is allowed to take on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Abilities: u32 {
        /// Run inference for itself and peers
        const BASIC_INFERENCE = 1 << 0;
        /// Forward tasks to better-suited peers
        const TASK_RELAY = 1 << 1;
        /// Gossip cached answers
        const CACHE_SHARING = 1 << 2;
        /// Split work across several peers
        const TASK_COORDINATION = 1 << 3;
        const KNOWLEDGE_SYNC = 1 << 4;
        const SWARM_LEADERSHIP = 1 << 5;
        const MENTORING = 1 << 6;
    }
}

/// Level derived from accumulated experience. Never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLevel {
    #[default]
    Apprentice,
    Craftsman,
    Expert,
    Master,
}

impl NodeLevel {
    pub const ALL: [NodeLevel; 4] = [
        NodeLevel::Apprentice,
        NodeLevel::Craftsman,
        NodeLevel::Expert,
        NodeLevel::Master,
    ];

    /// Experience needed to reach this level.
    pub fn threshold(&self) -> u64 {
        match self {
            NodeLevel::Apprentice => 0,
            NodeLevel::Craftsman => 1_000,
            NodeLevel::Expert => 10_000,
            NodeLevel::Master => 100_000,
        }
    }

    pub fn from_experience(experience: u64) -> Self {
        NodeLevel::ALL
            .iter()
            .rev()
            .copied()
            .find(|level| experience >= level.threshold())
            .unwrap_or(NodeLevel::Apprentice)
    }

    pub fn next(&self) -> Option<NodeLevel> {
        match self {
            NodeLevel::Apprentice => Some(NodeLevel::Craftsman),
            NodeLevel::Craftsman => Some(NodeLevel::Expert),
            NodeLevel::Expert => Some(NodeLevel::Master),
            NodeLevel::Master => None,
        }
    }

    pub fn max_concurrent_tasks(&self) -> u32 {
        match self {
            NodeLevel::Apprentice => 1,
            NodeLevel::Craftsman => 2,
            NodeLevel::Expert => 4,
            NodeLevel::Master => 8,
        }
    }

    /// Everything unlocked up to and including this level.
    pub fn abilities(&self) -> Abilities {
        let mut abilities = Abilities::BASIC_INFERENCE;
        if *self >= NodeLevel::Craftsman {
            abilities |= Abilities::TASK_RELAY | Abilities::CACHE_SHARING;
        }
        if *self >= NodeLevel::Expert {
            abilities |= Abilities::TASK_COORDINATION | Abilities::KNOWLEDGE_SYNC;
        }
        if *self >= NodeLevel::Master {
            abilities |= Abilities::SWARM_LEADERSHIP | Abilities::MENTORING;
        }
        abilities
    }
}

/// Proficiency band of one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpecializationTier {
    Novice,
    Competent,
    Proficient,
    Expert,
    Master,
}

impl SpecializationTier {
    pub fn from_proficiency(proficiency: f64) -> Self {
        if proficiency < 0.2 {
            SpecializationTier::Novice
        } else if proficiency < 0.5 {
            SpecializationTier::Competent
        } else if proficiency < 0.8 {
            SpecializationTier::Proficient
        } else if proficiency < 0.95 {
            SpecializationTier::Expert
        } else {
            SpecializationTier::Master
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_level_thresholds() {
        assert_eq!(NodeLevel::from_experience(0), NodeLevel::Apprentice);
        assert_eq!(NodeLevel::from_experience(999), NodeLevel::Apprentice);
        assert_eq!(NodeLevel::from_experience(1_000), NodeLevel::Craftsman);
        assert_eq!(NodeLevel::from_experience(10_000), NodeLevel::Expert);
        assert_eq!(NodeLevel::from_experience(100_000), NodeLevel::Master);
        assert_eq!(NodeLevel::Master.next(), None);
    }

    #[test]
    fn test_abilities_accumulate() {
        assert_eq!(NodeLevel::Apprentice.abilities(), Abilities::BASIC_INFERENCE);
        assert!(NodeLevel::Craftsman.abilities().contains(Abilities::CACHE_SHARING));
        assert!(!NodeLevel::Craftsman.abilities().contains(Abilities::KNOWLEDGE_SYNC));
        assert_eq!(NodeLevel::Master.abilities(), Abilities::all());
        assert_eq!(NodeLevel::Expert.max_concurrent_tasks(), 4);
    }

    #[test]
    fn test_specialization_tiers() {
        assert_eq!(SpecializationTier::from_proficiency(0.0), SpecializationTier::Novice);
        assert_eq!(SpecializationTier::from_proficiency(0.2), SpecializationTier::Competent);
        assert_eq!(SpecializationTier::from_proficiency(0.5), SpecializationTier::Proficient);
        assert_eq!(SpecializationTier::from_proficiency(0.8), SpecializationTier::Expert);
        assert_eq!(SpecializationTier::from_proficiency(0.95), SpecializationTier::Master);
    }

    proptest! {
        #[test]
        fn prop_level_monotonic(a in 0u64..200_000, b in 0u64..200_000) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(NodeLevel::from_experience(lo) <= NodeLevel::from_experience(hi));
            prop_assert!(NodeLevel::from_experience(hi).abilities().contains(NodeLevel::from_experience(lo).abilities()));
        }
    }
}
