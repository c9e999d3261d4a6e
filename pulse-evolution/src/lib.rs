//! PULSE Evolution - Competence & Immune Memory
//!
//! Tracks this device's own growth: total experience and the level it
//! implies, per-capability proficiency, and a bounded library of past
//! problem→solution entries ("vaccines") whose potency fades with age and
//! idleness and recovers with use.

pub mod level;
pub mod vaccine;

pub use level::{Abilities, NodeLevel, SpecializationTier};
pub use vaccine::{problem_similarity, Problem, Solution, VaccineEntry, POTENCY_AGE_SCALE_HOURS};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use pulse_core::{EntityId, EvolutionConfig, SwarmResult, TaskType, Timestamp, ValidationError};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info};

// ============================================================================
// EVENTS & SUMMARY
// ============================================================================

/// Something noteworthy happened to this node's competence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EvolutionEvent {
    LevelUp {
        from: NodeLevel,
        to: NodeLevel,
        total_experience: u64,
    },
    AbilitiesUnlocked {
        abilities: Abilities,
    },
    SpecializationChanged {
        capability: TaskType,
        tier: SpecializationTier,
    },
    VaccineRecorded {
        id: EntityId,
    },
    VaccinesEvicted {
        count: usize,
    },
    VaccinesSwept {
        expired: usize,
        decayed: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvolutionSummary {
    pub level: NodeLevel,
    pub total_experience: u64,
    /// Experience at which the next level starts, if any
    pub next_level_at: Option<u64>,
    pub max_concurrent_tasks: u32,
    pub abilities: Abilities,
    pub proficiency: BTreeMap<TaskType, f64>,
    pub specializations: BTreeMap<TaskType, SpecializationTier>,
    pub vaccine_count: usize,
}

/// A stored solution judged similar to a new problem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarSolution {
    pub entry: VaccineEntry,
    pub similarity: f64,
    pub potency: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub expired: Vec<EntityId>,
    pub decayed: usize,
}

#[derive(Debug, Clone, Default)]
struct Competence {
    total_experience: u64,
    level: NodeLevel,
    proficiency: BTreeMap<TaskType, f64>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// NODE EVOLUTION
// ============================================================================

pub struct NodeEvolution {
    config: EvolutionConfig,
    competence: Mutex<Competence>,
    vaccines: DashMap<EntityId, VaccineEntry>,
    /// Serializes library eviction
    eviction: Mutex<()>,
    last_sweep: Mutex<Option<Timestamp>>,
    events_tx: broadcast::Sender<EvolutionEvent>,
    summary_tx: watch::Sender<EvolutionSummary>,
}

impl NodeEvolution {
    pub fn new(config: EvolutionConfig) -> Self {
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let competence = Competence::default();
        let (summary_tx, _) = watch::channel(Self::summarize(&competence, 0));
        Self {
            config,
            competence: Mutex::new(competence),
            vaccines: DashMap::new(),
            eviction: Mutex::new(()),
            last_sweep: Mutex::new(None),
            events_tx,
            summary_tx,
        }
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn level(&self) -> NodeLevel {
        lock(&self.competence).level
    }

    pub fn total_experience(&self) -> u64 {
        lock(&self.competence).total_experience
    }

    pub fn abilities(&self) -> Abilities {
        self.level().abilities()
    }

    pub fn max_concurrent_tasks(&self) -> u32 {
        self.level().max_concurrent_tasks()
    }

    pub fn proficiency(&self, capability: TaskType) -> f64 {
        lock(&self.competence)
            .proficiency
            .get(&capability)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn specialization(&self, capability: TaskType) -> SpecializationTier {
        SpecializationTier::from_proficiency(self.proficiency(capability))
    }

    /// Add experience earned on `capability`.
    ///
    /// Total experience only grows. Proficiency grows by
    /// `growth_rate × amount / base_experience`, capped at 1. Returns the
    /// events fired (level-up, unlocked abilities, specialization change).
    pub fn gain_experience(&self, capability: TaskType, amount: u64) -> Vec<EvolutionEvent> {
        let mut events = Vec::new();
        {
            let mut competence = lock(&self.competence);
            competence.total_experience = competence.total_experience.saturating_add(amount);

            let growth = self.config.growth_rate * (amount as f64 / self.config.base_experience);
            let proficiency = competence.proficiency.entry(capability).or_insert(0.0);
            let tier_before = SpecializationTier::from_proficiency(*proficiency);
            *proficiency = (*proficiency + growth).clamp(0.0, 1.0);
            let tier_after = SpecializationTier::from_proficiency(*proficiency);
            if tier_after != tier_before {
                events.push(EvolutionEvent::SpecializationChanged {
                    capability,
                    tier: tier_after,
                });
            }

            let level = NodeLevel::from_experience(competence.total_experience);
            if level > competence.level {
                let from = competence.level;
                competence.level = level;
                events.push(EvolutionEvent::LevelUp {
                    from,
                    to: level,
                    total_experience: competence.total_experience,
                });
                events.push(EvolutionEvent::AbilitiesUnlocked {
                    abilities: level.abilities().difference(from.abilities()),
                });
                info!(
                    from = ?from,
                    to = ?level,
                    total_experience = competence.total_experience,
                    "Node leveled up"
                );
            }
        }
        self.emit_all(&events);
        self.publish();
        events
    }

    // ------------------------------------------------------------------------
    // Immune memory
    // ------------------------------------------------------------------------

    /// Store a solution that worked; evicts the least potent entries when
    /// the library overflows.
    pub fn record_solution(&self, problem: Problem, solution: Solution, effectiveness: f64) -> EntityId {
        let entry = VaccineEntry::new(problem, solution, effectiveness);
        let id = entry.id;
        debug!(vaccine_id = %id, problem_type = %entry.problem.problem_type, "Recorded vaccine");
        self.vaccines.insert(id, entry);
        let mut events = vec![EvolutionEvent::VaccineRecorded { id }];
        let evicted = self.evict_to_capacity_at(Utc::now());
        if evicted > 0 {
            events.push(EvolutionEvent::VaccinesEvicted { count: evicted });
        }
        self.emit_all(&events);
        self.publish();
        id
    }

    /// Lowest potency first, ties by id.
    fn evict_to_capacity_at(&self, now: Timestamp) -> usize {
        let _guard = lock(&self.eviction);
        let len = self.vaccines.len();
        if len <= self.config.max_vaccines {
            return 0;
        }
        let mut scored: Vec<(f64, EntityId)> = self
            .vaccines
            .iter()
            .map(|v| (v.potency_at(now), v.id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        let evicted = scored
            .into_iter()
            .take(len - self.config.max_vaccines)
            .filter(|(_, id)| self.vaccines.remove(id).is_some())
            .count();
        debug!(evicted, cap = self.config.max_vaccines, "Evicted vaccines");
        evicted
    }

    /// Stored solutions of the same problem type whose similarity is strictly
    /// above the threshold, most potent first.
    pub fn find_similar_solutions(&self, problem: &Problem) -> Vec<SimilarSolution> {
        let now = Utc::now();
        let mut found: Vec<SimilarSolution> = self
            .vaccines
            .iter()
            .filter(|v| v.problem.problem_type == problem.problem_type)
            .filter_map(|v| {
                let similarity = problem_similarity(problem, &v.problem);
                (similarity > self.config.similarity_threshold).then(|| SimilarSolution {
                    similarity,
                    potency: v.potency_at(now),
                    entry: v.clone(),
                })
            })
            .collect();
        found.sort_by(|a, b| {
            b.potency
                .total_cmp(&a.potency)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        found
    }

    /// Record that a stored solution was applied.
    pub fn record_usage(&self, vaccine_id: &EntityId, success: bool) -> SwarmResult<VaccineEntry> {
        let updated = {
            let mut entry = self.vaccines.get_mut(vaccine_id).ok_or_else(|| ValidationError::NotFound {
                entity: "vaccine".to_string(),
                id: vaccine_id.to_string(),
            })?;
            entry.record_usage(success, Utc::now());
            entry.clone()
        };
        debug!(vaccine_id = %vaccine_id, success, uses = updated.use_count, "Vaccine used");
        Ok(updated)
    }

    pub fn get_vaccine(&self, vaccine_id: &EntityId) -> Option<VaccineEntry> {
        self.vaccines.get(vaccine_id).map(|v| v.clone())
    }

    pub fn vaccine_count(&self) -> usize {
        self.vaccines.len()
    }

    pub fn sweep_expired(&self) -> SweepReport {
        self.sweep_expired_at(Utc::now())
    }

    /// Remove expired entries and decay the ones left idle since the
    /// previous sweep. Runs per entry under the map's entry locks, so
    /// lookups and usage updates can proceed concurrently.
    pub fn sweep_expired_at(&self, now: Timestamp) -> SweepReport {
        let since = {
            let mut last = lock(&self.last_sweep);
            let since = last.unwrap_or(DateTime::<Utc>::MIN_UTC);
            *last = Some(now);
            since
        };
        let keep = 1.0 - self.config.vaccine_decay_rate;
        let mut report = SweepReport::default();

        self.vaccines.retain(|id, entry| {
            if entry.is_expired_at(now, self.config.max_vaccine_age) {
                report.expired.push(*id);
                return false;
            }
            if entry.last_activity() <= since {
                entry.decay_factor *= keep;
                report.decayed += 1;
            }
            true
        });

        if !report.expired.is_empty() || report.decayed > 0 {
            info!(expired = report.expired.len(), decayed = report.decayed, "Vaccine sweep");
            self.emit(EvolutionEvent::VaccinesSwept {
                expired: report.expired.len(),
                decayed: report.decayed,
            });
            self.publish();
        }
        report
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    fn summarize(competence: &Competence, vaccine_count: usize) -> EvolutionSummary {
        EvolutionSummary {
            level: competence.level,
            total_experience: competence.total_experience,
            next_level_at: competence.level.next().map(|l| l.threshold()),
            max_concurrent_tasks: competence.level.max_concurrent_tasks(),
            abilities: competence.level.abilities(),
            proficiency: competence.proficiency.clone(),
            specializations: competence
                .proficiency
                .iter()
                .map(|(capability, p)| (*capability, SpecializationTier::from_proficiency(*p)))
                .collect(),
            vaccine_count,
        }
    }

    pub fn summary(&self) -> EvolutionSummary {
        let vaccine_count = self.vaccines.len();
        Self::summarize(&lock(&self.competence), vaccine_count)
    }

    pub fn subscribe(&self) -> WatchStream<EvolutionSummary> {
        WatchStream::new(self.summary_tx.subscribe())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EvolutionEvent> {
        self.events_tx.subscribe()
    }

    fn emit(&self, event: EvolutionEvent) {
        // no subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn emit_all(&self, events: &[EvolutionEvent]) {
        for event in events {
            self.emit(event.clone());
        }
    }

    fn publish(&self) {
        let summary = self.summary();
        self.summary_tx.send_replace(summary);
    }
}

impl Default for NodeEvolution {
    fn default() -> Self {
        Self::new(EvolutionConfig::default())
    }
}

// ============================================================================
// TESTS
// ============================================================================
