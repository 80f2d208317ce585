//! Core engine for the spectrum foraging simulation.
//!
//! A population of mobile agents roams a wrapped arena hunting decaying
//! problem entities. Each agent carries two bounded memories (resource
//! tokens and problem sightings) matched against problems on a circular
//! 360-unit value spectrum, and commits one utility-scored action per tick
//! under an energy budget. The world scheduler drives the tick loop and the
//! end-of-day maintenance pipeline (aging, death, reproduction, respawn,
//! statistics).

use forager_index::{NeighborhoodIndex, UniformGridIndex};
use ordered_float::OrderedFloat;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::fmt;
use thiserror::Error;

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

new_key_type! {
    /// Stable handle for problem instances backed by a generational slot map.
    pub struct ProblemId;
}

/// Full extent of the circular value spectrum.
pub const SPECTRUM_SPAN: f32 = 360.0;

const ORTHO_OFFSET: f32 = 90.0;
const LOW_ENERGY_FLOOR: f32 = 10.0;
const MATCHED_RETENTION_BONUS: f32 = 1_000.0;
const ORTHO_RETENTION_BONUS: f32 = 500.0;
const IDLE_RETENTION_JITTER: f32 = 10.0;
const SCAN_BASE_UTILITY: f32 = 20.0;
const STOCKPILE_BASE_UTILITY: f32 = 5.0;
const ORTHO_SOLVE_EXTRA_COST: f32 = 50.0;
const COST_BUDGET: f32 = 8.0;
const DEFAULT_MEM_SPLIT: f32 = 0.5;
const INITIAL_TOKEN_GRANTS: usize = 5;
const FAILURE_STREAK_CAP: u32 = 30;
const REPRODUCTION_CHANCE: f32 = 0.6;
const CRITICAL_POPULATION: usize = 5;
const TARGET_ACCEL: f32 = 0.9;
const WANDER_JITTER: f32 = 0.3;
const VELOCITY_DAMPING: f32 = 0.90;
const PROXIMITY_PULL: f32 = 500.0;
const PROXIMITY_SOFTENING: f32 = 5.0;

fn wrap_position(value: f32, extent: f32) -> f32 {
    if extent <= 0.0 {
        return 0.0;
    }
    let mut v = value % extent;
    if v < 0.0 {
        v += extent;
    }
    v
}

/// Wrap a spectrum value into the canonical `[0, 360)` range.
#[must_use]
pub fn wrap_spectrum(value: f32) -> f32 {
    let v = value.rem_euclid(SPECTRUM_SPAN);
    if v >= SPECTRUM_SPAN { 0.0 } else { v }
}

/// Shortest distance between two spectrum values on the ring.
#[must_use]
pub fn circular_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).abs() % SPECTRUM_SPAN;
    d.min(SPECTRUM_SPAN - d)
}

/// Whether two spectrum values fall within `eps` of each other on the ring.
#[must_use]
pub fn spectrum_matches(a: f32, b: f32, eps: f32) -> bool {
    circular_distance(a, b) <= eps
}

/// Shortest signed delta from `b` to `a`, in `(-180, 180]`.
#[must_use]
pub fn signed_difference(a: f32, b: f32) -> f32 {
    let mut d = (a - b).rem_euclid(SPECTRUM_SPAN);
    if d > SPECTRUM_SPAN / 2.0 {
        d -= SPECTRUM_SPAN;
    }
    d
}

/// Sum of `n` uniform dice rolls with `d` sides.
pub fn roll_dice(rng: &mut impl Rng, n: u32, d: u32) -> i32 {
    let mut sum = 0;
    for _ in 0..n {
        sum += rng.random_range(1..=d) as i32;
    }
    sum
}

/// Difference of two independent dice sums: a bounded, zero-mean,
/// bell-shaped perturbation (not Gaussian).
pub fn symmetric_noise(rng: &mut impl Rng, n: u32, d: u32) -> i32 {
    roll_dice(rng, n, d) - roll_dice(rng, n, d)
}

/// Sample a problem spectrum value from the layered dice-division
/// composition, deliberately non-uniform across the ring.
pub fn sample_problem_value(rng: &mut impl Rng) -> f32 {
    fn dice_divide(rng: &mut impl Rng, max_val: f32, divisions: u32) -> f32 {
        if divisions == 0 {
            return 0.0;
        }
        let step = max_val / divisions as f32;
        let k = rng.random_range(0..divisions);
        (k as f32 * step).floor()
    }
    let noise = roll_dice(rng, 4, 5) - roll_dice(rng, 1, 5);
    let val = dice_divide(rng, 360.0, 2)
        + dice_divide(rng, 180.0, 2)
        + dice_divide(rng, 90.0, 2)
        + dice_divide(rng, 45.0, 3)
        + dice_divide(rng, 15.0, 3)
        + noise as f32;
    wrap_spectrum(val)
}

/// Sample an agent specialization value: one of 8 evenly spaced spokes.
pub fn sample_specialization(rng: &mut impl Rng) -> f32 {
    (rng.random_range(0..8u32) * 45) as f32
}

/// Axis-aligned 2D position on the wrapped arena.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    /// Construct a new position.
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Velocity applied under damped inertial integration.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Velocity {
    pub vx: f32,
    pub vy: f32,
}

fn distance_sq(a: Position, b: Position) -> f32 {
    let dx = a.x - b.x;
    let dy = a.y - b.y;
    dx * dx + dy * dy
}

/// Errors surfaced by the simulation engine. Everything else degrades to
/// clamping or a no-op by design.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SimulationError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A tick was requested before `initialize` was called.
    #[error("simulation has not been initialized")]
    NotInitialized,
}

/// Static configuration for a simulation world. Missing fields fall back to
/// the reference defaults when deserialized; unknown keys are ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Side length of the square wrapped arena.
    pub arena_size: f32,
    /// Agents spawned by `initialize`.
    pub initial_agents: u32,
    /// Target number of live problems the scheduler respawns toward.
    pub target_problems: u32,
    /// Hard population ceiling for reproduction.
    pub max_population: u32,
    /// Radius within which agents can discover unknown problems.
    pub vision_radius: f32,
    /// Radius within which agents can act on problems and neighbors.
    pub interact_radius: f32,
    /// Radius of the lethal shockwave when a problem explodes.
    pub blast_radius: f32,
    /// Spectrum-match tolerance.
    pub match_eps: f32,
    /// Whether ±90° orthogonal values of self-created tokens also count.
    pub ortho_bonus: bool,
    /// Hit points assigned to newly spawned problems.
    pub problem_hp: f32,
    /// Minimum problem lifespan in days.
    pub problem_lifespan_min: u32,
    /// Maximum problem lifespan in days.
    pub problem_lifespan_max: u32,
    /// Per-attempt probability of a respawn succeeding at the day boundary.
    pub problem_respawn_prob: f32,
    /// Numerator of the urgency curve.
    pub urgency_k: f32,
    /// Denominator bias of the urgency curve.
    pub urgency_bias: f32,
    /// Upper clamp on computed urgency.
    pub urgency_clamp_max: f32,
    /// Energy granted to each surviving agent at the day boundary.
    pub daily_energy: f32,
    /// Upper clamp on agent energy.
    pub energy_max: f32,
    /// Whether the daily grant adds to leftover energy or replaces it.
    pub carryover_energy: bool,
    /// Energy assigned at birth.
    pub start_energy: f32,
    /// Energy reward per point of problem damage.
    pub reward_per_hit: f32,
    /// One-time energy bonus for landing the solving strike.
    pub reward_on_solve: f32,
    /// Age at which agents die at the day boundary.
    pub max_age_days: u32,
    /// Minimum age before an agent is eligible to reproduce.
    pub min_parent_age_days: u32,
    /// Baseline token time-to-live in days.
    pub token_ttl_max: u32,
    /// Probability that a used token replicates into the owner's cache.
    pub p_replicate_internal: f32,
    /// Per-neighbor probability that a shared token is copied across.
    pub p_replicate_share: f32,
    /// Idle ticks before an agent falls asleep.
    pub boredom_limit: u32,
    /// Floor of the blast death probability curve.
    pub base_death: f32,
    /// Slope of the blast death probability curve.
    pub k_death: f32,
    /// Liveness ceiling on ticks within one day.
    pub max_ticks_per_day: u32,
    /// Total per-agent memory budget split across the two caches.
    pub max_mem: u32,
    /// Default bucket count for spectrum histograms.
    pub histogram_bins: usize,
    /// Whether the vault/router behavioral specialization is active.
    pub enable_modes: bool,
    /// Probability that a fresh agent is born a vault.
    pub p_vault_at_birth: f32,
    /// Probability that a child flips its parent's mode.
    pub p_mode_flip_on_birth: f32,
    /// Memory fraction vaults dedicate to tokens.
    pub vault_mem_split: f32,
    /// Memory fraction routers dedicate to tokens.
    pub router_mem_split: f32,
    /// Multiplier on token TTL inside vault caches.
    pub vault_ttl_boost: f32,
    /// Multiplier on router share utility.
    pub router_share_boost: f32,
    /// Multiplier on vault targeted-generation probability.
    pub vault_gen_boost: f32,
    /// Whether the novelty gate suppresses redundant shares.
    pub share_novelty_gate: bool,
    /// Exponent shaping the novelty gate.
    pub share_sat_exponent: f32,
    /// Gate value below which a non-forced share is suppressed.
    pub share_gate_min: f32,
    /// Urgency at which a share bypasses the gate.
    pub share_force_urgency: f32,
    /// Whether routers skip low-urgency targeted generation.
    pub router_avoid_gen_solve: bool,
    /// Urgency floor under which routers skip gen-solve entirely.
    pub router_gen_solve_urgency_min: f32,
    /// Flat utility penalty routers apply to gen-solve.
    pub router_gen_solve_penalty: f32,
    /// Base damage of a solving strike.
    pub solve_damage_base: u32,
    /// Extra damage per three co-located awake neighbors.
    pub solve_damage_per3_neighbors: u32,
    /// Upper clamp on damage per strike.
    pub solve_damage_max: u32,
    /// Retention bonus scale vaults grant to spectrum-distant tokens.
    pub vault_diversity_retention: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            arena_size: 1000.0,
            initial_agents: 50,
            target_problems: 25,
            max_population: 200,
            vision_radius: 120.0,
            interact_radius: 40.0,
            blast_radius: 120.0,
            match_eps: 2.0,
            ortho_bonus: true,
            problem_hp: 40.0,
            problem_lifespan_min: 5,
            problem_lifespan_max: 15,
            problem_respawn_prob: 0.50,
            urgency_k: 250.0,
            urgency_bias: 0.50,
            urgency_clamp_max: 800.0,
            daily_energy: 80.0,
            energy_max: 160.0,
            carryover_energy: true,
            start_energy: 100.0,
            reward_per_hit: 0.5,
            reward_on_solve: 10.0,
            max_age_days: 100,
            min_parent_age_days: 25,
            token_ttl_max: 12,
            p_replicate_internal: 0.05,
            p_replicate_share: 0.20,
            boredom_limit: 300,
            base_death: 0.01,
            k_death: 0.20,
            max_ticks_per_day: 5000,
            max_mem: 60,
            histogram_bins: 36,
            enable_modes: true,
            p_vault_at_birth: 0.28,
            p_mode_flip_on_birth: 0.06,
            vault_mem_split: 0.78,
            router_mem_split: 0.35,
            vault_ttl_boost: 1.35,
            router_share_boost: 1.15,
            vault_gen_boost: 1.10,
            share_novelty_gate: true,
            share_sat_exponent: 2.2,
            share_gate_min: 0.22,
            share_force_urgency: 120.0,
            router_avoid_gen_solve: true,
            router_gen_solve_urgency_min: 70.0,
            router_gen_solve_penalty: 40.0,
            solve_damage_base: 1,
            solve_damage_per3_neighbors: 1,
            solve_damage_max: 4,
            vault_diversity_retention: 8.0,
            rng_seed: None,
        }
    }
}

fn capacity_split(max_mem: u32, split: f32) -> (usize, usize) {
    let tokens = ((max_mem as f32 * split).floor() as usize).max(1);
    let sightings = (max_mem as usize).saturating_sub(tokens).max(1);
    (tokens, sightings)
}

fn split_leaves_room(max_mem: u32, split: f32) -> bool {
    let tokens = (max_mem as f32 * split).floor() as i64;
    tokens >= 1 && max_mem as i64 - tokens >= 1
}

impl SimulationConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if self.arena_size <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "arena_size must be positive",
            ));
        }
        if self.initial_agents == 0 {
            return Err(SimulationError::InvalidConfig(
                "initial_agents must be at least 1",
            ));
        }
        if self.max_population == 0 || self.initial_agents > self.max_population {
            return Err(SimulationError::InvalidConfig(
                "initial_agents cannot exceed max_population",
            ));
        }
        if self.vision_radius <= 0.0 || self.interact_radius <= 0.0 || self.blast_radius <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "spatial radii must be positive",
            ));
        }
        if self.match_eps < 0.0 {
            return Err(SimulationError::InvalidConfig(
                "match_eps must be non-negative",
            ));
        }
        if self.problem_hp <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "problem_hp must be positive",
            ));
        }
        if self.problem_lifespan_min == 0 || self.problem_lifespan_min > self.problem_lifespan_max
        {
            return Err(SimulationError::InvalidConfig(
                "problem lifespan bounds must satisfy 1 <= min <= max",
            ));
        }
        if !(0.0..=1.0).contains(&self.problem_respawn_prob)
            || !(0.0..=1.0).contains(&self.p_replicate_internal)
            || !(0.0..=1.0).contains(&self.p_replicate_share)
            || !(0.0..=1.0).contains(&self.p_vault_at_birth)
            || !(0.0..=1.0).contains(&self.p_mode_flip_on_birth)
        {
            return Err(SimulationError::InvalidConfig(
                "probabilities must lie in [0, 1]",
            ));
        }
        if self.energy_max <= 0.0 {
            return Err(SimulationError::InvalidConfig(
                "energy_max must be positive",
            ));
        }
        if self.max_ticks_per_day == 0 {
            return Err(SimulationError::InvalidConfig(
                "max_ticks_per_day must be at least 1",
            ));
        }
        if self.token_ttl_max == 0 {
            return Err(SimulationError::InvalidConfig(
                "token_ttl_max must be at least 1",
            ));
        }
        if self.max_mem == 0 {
            return Err(SimulationError::InvalidConfig("max_mem must be at least 1"));
        }
        let splits_ok = if self.enable_modes {
            split_leaves_room(self.max_mem, self.vault_mem_split)
                && split_leaves_room(self.max_mem, self.router_mem_split)
        } else {
            split_leaves_room(self.max_mem, DEFAULT_MEM_SPLIT)
        };
        if !splits_ok {
            return Err(SimulationError::InvalidConfig(
                "memory split leaves no room for both caches",
            ));
        }
        if self.histogram_bins == 0 {
            return Err(SimulationError::InvalidConfig(
                "histogram_bins must be at least 1",
            ));
        }
        if self.solve_damage_base == 0 || self.solve_damage_max < self.solve_damage_base {
            return Err(SimulationError::InvalidConfig(
                "solve damage bounds must satisfy 1 <= base <= max",
            ));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Lifecycle state of a problem instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ProblemState {
    #[default]
    Active,
    Solved,
    Exploded,
}

/// A decaying spatial entity agents race to solve before it explodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Problem {
    pub position: Position,
    pub value: f32,
    pub hp: f32,
    pub hp_max: f32,
    pub lifespan: i32,
    pub lifespan_max: i32,
    pub age_days: u32,
    pub state: ProblemState,
}

impl Problem {
    fn spawn(config: &SimulationConfig, rng: &mut SmallRng) -> Self {
        let lifespan =
            rng.random_range(config.problem_lifespan_min..=config.problem_lifespan_max) as i32;
        Self {
            position: Position::new(
                rng.random_range(0.0..config.arena_size),
                rng.random_range(0.0..config.arena_size),
            ),
            value: sample_problem_value(rng),
            hp: config.problem_hp,
            hp_max: config.problem_hp,
            lifespan,
            lifespan_max: lifespan,
            age_days: 0,
            state: ProblemState::Active,
        }
    }

    /// Priority score rising as the remaining lifespan shrinks.
    #[must_use]
    pub fn urgency(&self, config: &SimulationConfig) -> f32 {
        let u = config.urgency_k / (self.lifespan as f32 + config.urgency_bias);
        u.clamp(0.0, config.urgency_clamp_max)
    }
}

/// A perishable capability tagged with a spectrum value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Token {
    pub value: f32,
    pub creator: AgentId,
    pub ttl: u32,
    pub ttl_max: u32,
    pub uses: u32,
}

impl Token {
    fn new(value: f32, creator: AgentId, config: &SimulationConfig) -> Self {
        Self {
            value: wrap_spectrum(value.round()),
            creator,
            ttl: config.token_ttl_max,
            ttl_max: config.token_ttl_max,
            uses: 0,
        }
    }
}

/// Agent-local snapshot of an observed problem; a weak reference resolved
/// against the world registry on every use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sighting {
    pub problem: ProblemId,
    pub position: Position,
    pub value: f32,
    pub urgency: f32,
    pub last_seen_day: u32,
}

/// Behavioral specialization fixed at construction: vaults hoard a diverse
/// token spread, routers cluster tightly and spread news instead.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    Vault,
    #[default]
    Router,
}

impl Mode {
    fn sample(config: &SimulationConfig, rng: &mut SmallRng) -> Self {
        if config.enable_modes && rng.random::<f32>() < config.p_vault_at_birth {
            Mode::Vault
        } else {
            Mode::Router
        }
    }

    fn inherit(parent: Mode, config: &SimulationConfig, rng: &mut SmallRng) -> Self {
        if !config.enable_modes {
            Mode::Router
        } else if rng.random::<f32>() < config.p_mode_flip_on_birth {
            parent.flipped()
        } else {
            parent
        }
    }

    const fn flipped(self) -> Self {
        match self {
            Mode::Vault => Mode::Router,
            Mode::Router => Mode::Vault,
        }
    }

    fn mem_split(self, config: &SimulationConfig) -> f32 {
        match self {
            Mode::Vault => config.vault_mem_split,
            Mode::Router => config.router_mem_split,
        }
    }

    fn token_ttl_max(self, config: &SimulationConfig) -> u32 {
        match self {
            Mode::Vault => (config.token_ttl_max as f32 * config.vault_ttl_boost).round() as u32,
            Mode::Router => config.token_ttl_max,
        }
    }

    fn share_boost(self, config: &SimulationConfig) -> f32 {
        if config.enable_modes && self == Mode::Router {
            config.router_share_boost
        } else {
            1.0
        }
    }
}

/// Per-action energy prices, normalized so the four sum to a fixed budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ActionCosts {
    pub scan: f32,
    pub generate: f32,
    pub share: f32,
    pub solve: f32,
}

impl ActionCosts {
    fn normalized(raw: [f32; 4]) -> Self {
        let sum: f32 = raw.iter().sum();
        let scale = COST_BUDGET / sum;
        Self {
            scan: raw[0] * scale,
            generate: raw[1] * scale,
            share: raw[2] * scale,
            solve: raw[3] * scale,
        }
    }

    fn sample(rng: &mut SmallRng) -> Self {
        Self::normalized([
            rng.random::<f32>(),
            rng.random::<f32>(),
            rng.random::<f32>(),
            rng.random::<f32>(),
        ])
    }

    fn inherit(parent: &Self, rng: &mut SmallRng) -> Self {
        let mut raw = [parent.scan, parent.generate, parent.share, parent.solve];
        for c in &mut raw {
            *c = (*c + rng.random_range(-0.1..0.1)).max(0.1);
        }
        Self::normalized(raw)
    }
}

/// Linear weights combined into each candidate action's utility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UtilityWeights {
    pub urgency: f32,
    pub cost: f32,
    pub sat_share: f32,
    pub sat_solve: f32,
    pub have_token: f32,
    pub scan_fail: f32,
}

impl Default for UtilityWeights {
    fn default() -> Self {
        Self {
            urgency: 1.0,
            cost: -2.0,
            sat_share: -50.0,
            sat_solve: 20.0,
            have_token: 150.0,
            scan_fail: -5.0,
        }
    }
}

impl UtilityWeights {
    fn inherit(parent: &Self, rng: &mut SmallRng) -> Self {
        let mut child = *parent;
        for w in [
            &mut child.urgency,
            &mut child.cost,
            &mut child.sat_share,
            &mut child.sat_solve,
            &mut child.have_token,
            &mut child.scan_fail,
        ] {
            *w += rng.random_range(-0.2..0.2);
        }
        child
    }
}

/// A mobile agent with two bounded memories and a utility-scored action loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub position: Position,
    pub velocity: Velocity,
    pub alive: bool,
    pub sleeping: bool,
    pub age_days: u32,
    pub energy: f32,
    pub boredom: u32,
    pub mode: Mode,
    pub specialization: f32,
    pub mem_split: f32,
    pub token_capacity: usize,
    pub sighting_capacity: usize,
    pub costs: ActionCosts,
    pub weights: UtilityWeights,
    pub tokens: Vec<Token>,
    pub sightings: Vec<Sighting>,
    pub failure_streak: u32,
}

impl Agent {
    fn new_random(id: AgentId, config: &SimulationConfig, rng: &mut SmallRng) -> Self {
        let mode = Mode::sample(config, rng);
        let mem_split = if config.enable_modes {
            mode.mem_split(config)
        } else {
            DEFAULT_MEM_SPLIT
        };
        let (token_capacity, sighting_capacity) = capacity_split(config.max_mem, mem_split);
        Self {
            id,
            position: Position::new(
                rng.random_range(0.0..config.arena_size),
                rng.random_range(0.0..config.arena_size),
            ),
            velocity: Velocity {
                vx: rng.random_range(-1.0..1.0),
                vy: rng.random_range(-1.0..1.0),
            },
            alive: true,
            sleeping: false,
            age_days: 0,
            energy: config.start_energy,
            boredom: 0,
            mode,
            specialization: sample_specialization(rng),
            mem_split,
            token_capacity,
            sighting_capacity,
            costs: ActionCosts::sample(rng),
            weights: UtilityWeights::default(),
            tokens: Vec::new(),
            sightings: Vec::new(),
            failure_streak: 0,
        }
    }

    fn new_child(
        id: AgentId,
        parent: &Agent,
        config: &SimulationConfig,
        rng: &mut SmallRng,
    ) -> Self {
        let mode = Mode::inherit(parent.mode, config, rng);
        let mut mem_split =
            (parent.mem_split + rng.random_range(-0.05..0.05)).clamp(0.1, 0.9);
        if config.enable_modes {
            mem_split = mode.mem_split(config);
        }
        let (token_capacity, sighting_capacity) = capacity_split(config.max_mem, mem_split);
        Self {
            id,
            position: parent.position,
            velocity: Velocity {
                vx: rng.random_range(-1.0..1.0),
                vy: rng.random_range(-1.0..1.0),
            },
            alive: true,
            sleeping: false,
            age_days: 0,
            energy: config.start_energy,
            boredom: 0,
            mode,
            specialization: wrap_spectrum(
                parent.specialization + rng.random_range(-5..=5) as f32,
            ),
            mem_split,
            token_capacity,
            sighting_capacity,
            costs: ActionCosts::inherit(&parent.costs, rng),
            weights: UtilityWeights::inherit(&parent.weights, rng),
            tokens: Vec::new(),
            sightings: Vec::new(),
            failure_streak: 0,
        }
    }

    /// Record a problem observation, refreshing in place when already cached.
    /// At capacity the minimum-urgency entry is replaced only when the new
    /// urgency is strictly greater.
    fn memorize(&mut self, sighting: Sighting) -> bool {
        if let Some(existing) = self
            .sightings
            .iter_mut()
            .find(|s| s.problem == sighting.problem)
        {
            existing.position = sighting.position;
            existing.value = sighting.value;
            existing.urgency = sighting.urgency;
            existing.last_seen_day = sighting.last_seen_day;
            return true;
        }
        if self.sightings.len() < self.sighting_capacity {
            self.sightings.push(sighting);
            return true;
        }
        let Some((idx, min_urgency)) = self
            .sightings
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| OrderedFloat(s.urgency))
            .map(|(idx, s)| (idx, s.urgency))
        else {
            return false;
        };
        if sighting.urgency > min_urgency {
            self.sightings.remove(idx);
            self.sightings.push(sighting);
            return true;
        }
        false
    }

    /// Retention score used by the token cache eviction policy: tokens that
    /// open known active problems score high, orthogonal self-created tokens
    /// score half, and tokens matching nothing draw a small random jitter so
    /// idle tokens stay evictable without a deterministic order.
    fn retention_score(
        &self,
        token: &Token,
        problems: &SlotMap<ProblemId, Problem>,
        config: &SimulationConfig,
        rng: &mut SmallRng,
    ) -> f32 {
        let mut retention = 0.0;
        let mut matched = false;
        for sighting in &self.sightings {
            let Some(problem) = problems.get(sighting.problem) else {
                continue;
            };
            if problem.state != ProblemState::Active {
                continue;
            }
            let urgency = problem.urgency(config);
            if spectrum_matches(token.value, problem.value, config.match_eps) {
                retention += urgency + MATCHED_RETENTION_BONUS;
                matched = true;
            } else if config.ortho_bonus && token.creator == self.id {
                let hi = wrap_spectrum(token.value + ORTHO_OFFSET);
                let lo = wrap_spectrum(token.value - ORTHO_OFFSET);
                if spectrum_matches(hi, problem.value, config.match_eps)
                    || spectrum_matches(lo, problem.value, config.match_eps)
                {
                    retention += urgency / 2.0 + ORTHO_RETENTION_BONUS;
                    matched = true;
                }
            }
        }
        if !matched {
            retention = rng.random::<f32>() * IDLE_RETENTION_JITTER;
        }
        if self.mode == Mode::Vault {
            let spread = signed_difference(token.value, self.specialization).abs();
            retention += (spread / 180.0) * config.vault_diversity_retention;
        }
        retention
    }

    /// Insert a token, evicting the lowest-retention holder at capacity.
    /// The incoming TTL is rewritten by the receiving cache's mode.
    fn accept_token(
        &mut self,
        mut token: Token,
        problems: &SlotMap<ProblemId, Problem>,
        config: &SimulationConfig,
        rng: &mut SmallRng,
        mut counters: Option<&mut TokenCounters>,
    ) {
        match self.mode {
            Mode::Vault => {
                token.ttl_max = self.mode.token_ttl_max(config);
                token.ttl = token.ttl_max;
            }
            Mode::Router => {
                token.ttl_max = config.token_ttl_max;
                token.ttl = token.ttl.min(token.ttl_max);
            }
        }
        if self.tokens.len() < self.token_capacity {
            self.tokens.push(token);
            if let Some(c) = counters.as_deref_mut() {
                c.added += 1;
            }
            return;
        }
        let mut lowest: Option<(usize, f32)> = None;
        for (idx, held) in self.tokens.iter().enumerate() {
            let score = self.retention_score(held, problems, config, rng);
            if lowest.is_none_or(|(_, s)| score < s) {
                lowest = Some((idx, score));
            }
        }
        if let Some((idx, _)) = lowest {
            self.tokens.remove(idx);
        }
        self.tokens.push(token);
        if let Some(c) = counters.as_deref_mut() {
            c.added += 1;
            c.evicted += 1;
        }
    }

    /// Move a used token to the cache tail.
    fn refresh_token(&mut self, idx: usize) {
        if idx < self.tokens.len() {
            let token = self.tokens.remove(idx);
            self.tokens.push(token);
        }
    }

    /// Decay all token TTLs by one day, pruning the expired.
    fn decay_tokens(&mut self) -> u64 {
        for token in &mut self.tokens {
            token.ttl = token.ttl.saturating_sub(1);
        }
        let before = self.tokens.len();
        self.tokens.retain(|t| t.ttl > 0);
        (before - self.tokens.len()) as u64
    }

    /// First held token usable on `value`: a direct match, or (when enabled)
    /// a ±90° orthogonal match on a self-created token.
    fn usable_token(&self, value: f32, config: &SimulationConfig) -> Option<(usize, bool)> {
        for (idx, token) in self.tokens.iter().enumerate() {
            if spectrum_matches(token.value, value, config.match_eps) {
                return Some((idx, false));
            }
            if config.ortho_bonus && token.creator == self.id {
                let hi = wrap_spectrum(token.value + ORTHO_OFFSET);
                let lo = wrap_spectrum(token.value - ORTHO_OFFSET);
                if spectrum_matches(hi, value, config.match_eps)
                    || spectrum_matches(lo, value, config.match_eps)
                {
                    return Some((idx, true));
                }
            }
        }
        None
    }

    /// Pick a spectrum value for a stockpiled token. Vaults diversify
    /// (exploration, gap-filling, or specialization by weighted chance);
    /// routers stay clustered around their specialization.
    fn generate_value(&self, config: &SimulationConfig, rng: &mut SmallRng) -> f32 {
        match self.mode {
            Mode::Vault => {
                let r = rng.random::<f32>();
                if r < 0.40 {
                    rng.random_range(0..360) as f32
                } else if r < 0.70 && !self.tokens.is_empty() {
                    let mut vals: Vec<f32> = self.tokens.iter().map(|t| t.value).collect();
                    vals.sort_by(f32::total_cmp);
                    let mut max_gap = 0.0;
                    let mut gap_start = 0.0;
                    for i in 0..vals.len() {
                        let next = (i + 1) % vals.len();
                        let gap = if next == 0 {
                            SPECTRUM_SPAN - vals[i] + vals[0]
                        } else {
                            vals[next] - vals[i]
                        };
                        if gap > max_gap {
                            max_gap = gap;
                            gap_start = vals[i];
                        }
                    }
                    wrap_spectrum(
                        gap_start + (max_gap / 2.0).floor() + symmetric_noise(rng, 3, 5) as f32,
                    )
                } else {
                    wrap_spectrum(self.specialization + symmetric_noise(rng, 8, 6) as f32)
                }
            }
            Mode::Router => {
                wrap_spectrum(self.specialization + symmetric_noise(rng, 4, 4) as f32)
            }
        }
    }

    /// Probabilistic targeted generation biased by urgency and the recent
    /// failure streak. Returns the attempted spectrum value.
    fn anneal_attempt(
        &self,
        urgency: f32,
        config: &SimulationConfig,
        rng: &mut SmallRng,
    ) -> f32 {
        let mut p = (0.35 * (urgency / 60.0) + 0.08 * (self.failure_streak as f32 / 10.0))
            .clamp(0.0, 1.0);
        if self.mode == Mode::Vault {
            p = (p * config.vault_gen_boost).clamp(0.0, 1.0);
        }
        let mut base = self.specialization;
        if !self.tokens.is_empty() && p > 0.45 && rng.random::<f32>() < p {
            base = self.tokens[rng.random_range(0..self.tokens.len())].value;
        }
        let k = (p * 3.5).clamp(0.0, 3.0) as u32;
        let mut attempt = wrap_spectrum(base + symmetric_noise(rng, 6 + 4 * k, 5) as f32);
        if config.ortho_bonus && p > 0.65 && rng.random::<f32>() < (p - 0.55) {
            let offset = if rng.random::<f32>() < 0.5 {
                ORTHO_OFFSET
            } else {
                -ORTHO_OFFSET
            };
            attempt = wrap_spectrum(attempt + offset);
        }
        attempt
    }

    /// Day-boundary reset: wake, clear boredom, age, relax the failure
    /// streak, grant energy, and die past the maximum age.
    fn start_new_day(&mut self, config: &SimulationConfig) {
        self.sleeping = false;
        self.boredom = 0;
        self.age_days += 1;
        self.failure_streak = self.failure_streak.saturating_sub(1);
        if config.carryover_energy {
            self.energy = (self.energy + config.daily_energy).clamp(0.0, config.energy_max);
        } else {
            self.energy = config.daily_energy;
        }
        if self.age_days >= config.max_age_days {
            self.alive = false;
        }
    }
}

/// One committed agent action per tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Scan,
    Share,
    Solve,
    GenSolve,
    Stockpile,
    Sleep,
}

/// Per-action commit counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionCounts {
    pub scan: u64,
    pub share: u64,
    pub solve: u64,
    pub gen_solve: u64,
    pub stockpile: u64,
    pub sleep: u64,
}

impl ActionCounts {
    fn record(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Scan => self.scan += 1,
            ActionKind::Share => self.share += 1,
            ActionKind::Solve => self.solve += 1,
            ActionKind::GenSolve => self.gen_solve += 1,
            ActionKind::Stockpile => self.stockpile += 1,
            ActionKind::Sleep => self.sleep += 1,
        }
    }

    /// Total committed actions, sleep transitions included.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.scan + self.share + self.solve + self.gen_solve + self.stockpile + self.sleep
    }
}

/// Action counters bucketed by behavioral mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeActionCounts {
    pub vault: ActionCounts,
    pub router: ActionCounts,
}

impl ModeActionCounts {
    fn for_mode(&mut self, mode: Mode) -> &mut ActionCounts {
        match mode {
            Mode::Vault => &mut self.vault,
            Mode::Router => &mut self.router,
        }
    }
}

/// Agent deaths bucketed by cause.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeathCounts {
    pub blast: u64,
    pub age: u64,
}

/// Problem lifecycle counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProblemCounters {
    pub spawned: u64,
    pub solved: u64,
    pub exploded: u64,
    pub hits: u64,
}

/// Token churn counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounters {
    pub added: u64,
    pub evicted: u64,
    pub pruned: u64,
    pub used: u64,
    pub replicated_internal: u64,
    pub replicated_share: u64,
}

/// Targeted-generation outcome counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationCounters {
    pub attempts: u64,
    pub successes: u64,
}

/// Share delivery counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShareCounters {
    pub total: u64,
    pub with_token: u64,
    pub neighbors_sum: u64,
}

/// Suppression counters for the behavioral gates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateCounters {
    pub share_suppressed: u64,
    pub router_gen_solve_skipped: u64,
}

/// Population split by behavioral mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModeCounts {
    pub vault: usize,
    pub router: usize,
}

/// Aggregate statistics archived at each day boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DayStats {
    pub day: u32,
    pub ticks: u32,
    pub population_start: usize,
    pub population_end: usize,
    pub problems_start: usize,
    pub problems_end: usize,
    pub actions: ActionCounts,
    pub actions_by_mode: ModeActionCounts,
    pub births: u64,
    pub deaths: DeathCounts,
    pub problems: ProblemCounters,
    pub tokens: TokenCounters,
    pub generation: GenerationCounters,
    pub shares: ShareCounters,
    pub gating: GateCounters,
    pub coverage: f32,
    pub entropy_proxy: f32,
    pub mean_energy: f32,
    pub mean_tokens: f32,
    pub modes: ModeCounts,
}

impl DayStats {
    fn open(day: u32, population: usize, problems: usize) -> Self {
        Self {
            day,
            ticks: 0,
            population_start: population,
            population_end: population,
            problems_start: problems,
            problems_end: 0,
            actions: ActionCounts::default(),
            actions_by_mode: ModeActionCounts::default(),
            births: 0,
            deaths: DeathCounts::default(),
            problems: ProblemCounters::default(),
            tokens: TokenCounters::default(),
            generation: GenerationCounters::default(),
            shares: ShareCounters::default(),
            gating: GateCounters::default(),
            coverage: 0.0,
            entropy_proxy: 0.0,
            mean_energy: 0.0,
            mean_tokens: 0.0,
            modes: ModeCounts::default(),
        }
    }
}

/// Sink invoked with each finalized day batch.
pub trait DayPersistence: Send {
    fn on_day(&mut self, stats: &DayStats);
}

/// No-op persistence sink.
#[derive(Debug, Default)]
pub struct NullPersistence;

impl DayPersistence for NullPersistence {
    fn on_day(&mut self, _stats: &DayStats) {}
}

/// Events emitted after processing a world tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TickEvents {
    pub day: u32,
    pub tick: u32,
    pub day_ended: bool,
}

struct Candidate {
    kind: ActionKind,
    utility: f32,
    cost: f32,
    target: CandidateTarget,
}

enum CandidateTarget {
    Share {
        problem: ProblemId,
        token: Option<usize>,
    },
    Solve {
        problem: ProblemId,
        token: usize,
        neighbor_count: usize,
    },
    GenSolve {
        problem: ProblemId,
    },
    Scan {
        problem: ProblemId,
    },
    Stockpile,
}

struct CandidateSet {
    candidates: Vec<Candidate>,
    neighbors: Vec<AgentId>,
    share_suppressed: u64,
    router_skipped: u64,
}

/// The simulation world: owns both registries, drives the tick loop, and
/// performs the end-of-day maintenance pipeline.
pub struct World {
    config: SimulationConfig,
    rng: SmallRng,
    day: u32,
    tick_in_day: u32,
    initialized: bool,
    agents: SlotMap<AgentId, Agent>,
    agent_order: Vec<AgentId>,
    problems: SlotMap<ProblemId, Problem>,
    problem_order: Vec<ProblemId>,
    problem_index: UniformGridIndex,
    problem_index_ids: Vec<ProblemId>,
    agent_index: UniformGridIndex,
    current_day: DayStats,
    history: Vec<DayStats>,
    persistence: Box<dyn DayPersistence>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("day", &self.day)
            .field("tick_in_day", &self.tick_in_day)
            .field("initialized", &self.initialized)
            .field("agent_count", &self.agent_order.len())
            .field("problem_count", &self.problem_order.len())
            .finish()
    }
}

impl World {
    /// Instantiate a new world using the supplied configuration.
    pub fn new(config: SimulationConfig) -> Result<Self, SimulationError> {
        Self::with_persistence(config, Box::new(NullPersistence))
    }

    /// Instantiate a new world with a persistence sink for day batches.
    pub fn with_persistence(
        config: SimulationConfig,
        persistence: Box<dyn DayPersistence>,
    ) -> Result<Self, SimulationError> {
        config.validate()?;
        let rng = config.seeded_rng();
        let problem_index =
            UniformGridIndex::new(config.vision_radius, config.arena_size, config.arena_size);
        let agent_index =
            UniformGridIndex::new(config.interact_radius, config.arena_size, config.arena_size);
        Ok(Self {
            rng,
            day: 0,
            tick_in_day: 0,
            initialized: false,
            agents: SlotMap::with_key(),
            agent_order: Vec::new(),
            problems: SlotMap::with_key(),
            problem_order: Vec::new(),
            problem_index,
            problem_index_ids: Vec::new(),
            agent_index,
            current_day: DayStats::open(0, 0, 0),
            history: Vec::new(),
            persistence,
            config,
        })
    }

    /// Reset all state from the configuration: reseed the RNG, repopulate
    /// both registries, and open day-0 statistics.
    pub fn initialize(&mut self) {
        self.rng = self.config.seeded_rng();
        self.day = 0;
        self.tick_in_day = 0;
        self.agents.clear();
        self.agent_order.clear();
        self.problems.clear();
        self.problem_order.clear();
        self.history.clear();
        for _ in 0..self.config.initial_agents {
            self.spawn_random_agent();
        }
        for _ in 0..self.config.target_problems {
            self.spawn_problem();
        }
        self.rebuild_problem_index();
        self.current_day =
            DayStats::open(0, self.agent_order.len(), self.active_problem_count());
        self.initialized = true;
    }

    /// Execute one tick: process living awake agents in registry order (move
    /// then interact, strictly sequential so later agents observe earlier
    /// effects), then end the day when nobody acted or the tick ceiling hit.
    pub fn advance_tick(&mut self) -> Result<TickEvents, SimulationError> {
        if !self.initialized {
            return Err(SimulationError::NotInitialized);
        }
        self.tick_in_day += 1;
        self.current_day.ticks += 1;
        let order = self.agent_order.clone();
        let mut processed = 0usize;
        for id in order {
            let awake = self
                .agents
                .get(id)
                .is_some_and(|a| a.alive && !a.sleeping);
            if !awake {
                continue;
            }
            self.agent_move(id);
            if self
                .agents
                .get(id)
                .is_some_and(|a| a.alive && !a.sleeping)
            {
                self.agent_interact(id);
            }
            processed += 1;
        }
        let day_ended = processed == 0 || self.tick_in_day >= self.config.max_ticks_per_day;
        let events = TickEvents {
            day: self.day,
            tick: self.tick_in_day,
            day_ended,
        };
        if day_ended {
            self.end_day();
        }
        Ok(events)
    }

    /// Run ticks until the current day ends.
    pub fn advance_day(&mut self) -> Result<(), SimulationError> {
        loop {
            if self.advance_tick()?.day_ended {
                return Ok(());
            }
        }
    }

    /// Run `days` full days.
    pub fn advance_days(&mut self, days: u32) -> Result<(), SimulationError> {
        for _ in 0..days {
            self.advance_day()?;
        }
        Ok(())
    }

    fn agent_move(&mut self, id: AgentId) {
        let arena = self.config.arena_size;
        let mode;
        let went_to_sleep;
        {
            let problems = &self.problems;
            let config = &self.config;
            let rng = &mut self.rng;
            let Some(agent) = self.agents.get_mut(id) else {
                return;
            };
            mode = agent.mode;
            agent.boredom += 1;
            if agent.boredom > config.boredom_limit {
                agent.sleeping = true;
                went_to_sleep = true;
            } else {
                went_to_sleep = false;
                agent.sightings.retain(|s| {
                    problems
                        .get(s.problem)
                        .is_some_and(|p| p.state == ProblemState::Active)
                });
                let Agent {
                    ref mut position,
                    ref mut velocity,
                    ref mut sightings,
                    ref tokens,
                    ..
                } = *agent;
                let mut best: Option<(OrderedFloat<f32>, Position)> = None;
                for s in sightings.iter_mut() {
                    let Some(problem) = problems.get(s.problem) else {
                        continue;
                    };
                    s.urgency = problem.urgency(config);
                    let bonus = if tokens
                        .iter()
                        .any(|t| spectrum_matches(t.value, s.value, config.match_eps))
                    {
                        2.0
                    } else {
                        1.0
                    };
                    let d = distance_sq(*position, s.position).sqrt();
                    let priority =
                        s.urgency * bonus + PROXIMITY_PULL / (d + PROXIMITY_SOFTENING);
                    if best.is_none_or(|(b, _)| OrderedFloat(priority) > b) {
                        best = Some((OrderedFloat(priority), s.position));
                    }
                }
                let (ax, ay) = match best {
                    Some((_, target)) => {
                        let angle = (target.y - position.y).atan2(target.x - position.x);
                        (angle.cos() * TARGET_ACCEL, angle.sin() * TARGET_ACCEL)
                    }
                    None => (
                        rng.random_range(-WANDER_JITTER..WANDER_JITTER),
                        rng.random_range(-WANDER_JITTER..WANDER_JITTER),
                    ),
                };
                velocity.vx = (velocity.vx + ax) * VELOCITY_DAMPING;
                velocity.vy = (velocity.vy + ay) * VELOCITY_DAMPING;
                position.x = wrap_position(position.x + velocity.vx, arena);
                position.y = wrap_position(position.y + velocity.vy, arena);
            }
        }
        if went_to_sleep {
            self.note_action(mode, ActionKind::Sleep);
        }
    }

    fn build_candidates(&self, id: AgentId) -> Option<CandidateSet> {
        let agent = self.agents.get(id)?;
        let config = &self.config;
        let interact_sq = config.interact_radius * config.interact_radius;

        let mut neighbors = Vec::new();
        for &other_id in &self.agent_order {
            if other_id == id {
                continue;
            }
            let Some(other) = self.agents.get(other_id) else {
                continue;
            };
            if !other.alive || other.sleeping {
                continue;
            }
            if distance_sq(agent.position, other.position) <= interact_sq {
                neighbors.push(other_id);
            }
        }

        let mut set = CandidateSet {
            candidates: Vec::new(),
            neighbors,
            share_suppressed: 0,
            router_skipped: 0,
        };
        let weights = &agent.weights;

        for sighting in &agent.sightings {
            let Some(problem) = self.problems.get(sighting.problem) else {
                continue;
            };
            if problem.state != ProblemState::Active {
                continue;
            }
            let urgency = problem.urgency(config);

            let known = set
                .neighbors
                .iter()
                .filter(|&&nid| {
                    self.agents.get(nid).is_some_and(|n| {
                        n.sightings.iter().any(|s| s.problem == sighting.problem)
                    })
                })
                .count();
            let saturation = if set.neighbors.is_empty() {
                0.0
            } else {
                known as f32 / set.neighbors.len() as f32
            };

            let token_match = agent.usable_token(problem.value, config);
            let has_token = token_match.is_some();

            if !set.neighbors.is_empty() {
                let mut utility = urgency * weights.urgency
                    + saturation * weights.sat_share
                    + if has_token { weights.have_token / 2.0 } else { 0.0 }
                    + agent.costs.share * weights.cost;
                utility *= agent.mode.share_boost(config);

                let mut allow = true;
                if config.share_novelty_gate {
                    let novelty = 1.0 - saturation;
                    let gate = novelty.powf(config.share_sat_exponent);
                    let force = urgency >= config.share_force_urgency || has_token;
                    if !force && gate < config.share_gate_min {
                        allow = false;
                        set.share_suppressed += 1;
                    } else {
                        utility *= (0.35 + 0.65 * gate).clamp(0.1, 1.0);
                    }
                }
                if allow {
                    set.candidates.push(Candidate {
                        kind: ActionKind::Share,
                        utility,
                        cost: agent.costs.share,
                        target: CandidateTarget::Share {
                            problem: sighting.problem,
                            token: token_match.map(|(idx, _)| idx),
                        },
                    });
                }
            }

            let d = distance_sq(agent.position, problem.position).sqrt();
            if d < config.interact_radius {
                if let Some((token_idx, ortho)) = token_match {
                    let cost = agent.costs.solve
                        + if ortho { ORTHO_SOLVE_EXTRA_COST } else { 0.0 };
                    let utility = urgency * weights.urgency
                        + saturation * weights.sat_solve
                        + weights.have_token
                        + cost * weights.cost;
                    set.candidates.push(Candidate {
                        kind: ActionKind::Solve,
                        utility,
                        cost,
                        target: CandidateTarget::Solve {
                            problem: sighting.problem,
                            token: token_idx,
                            neighbor_count: set.neighbors.len(),
                        },
                    });
                } else {
                    let router_gated = config.enable_modes
                        && agent.mode == Mode::Router
                        && config.router_avoid_gen_solve;
                    if router_gated && urgency < config.router_gen_solve_urgency_min {
                        set.router_skipped += 1;
                    } else {
                        let cost = agent.costs.generate + agent.costs.solve;
                        let mut utility = urgency * weights.urgency
                            + saturation * weights.sat_solve
                            + cost * weights.cost;
                        if router_gated {
                            utility -= config.router_gen_solve_penalty;
                        }
                        set.candidates.push(Candidate {
                            kind: ActionKind::GenSolve,
                            utility,
                            cost,
                            target: CandidateTarget::GenSolve {
                                problem: sighting.problem,
                            },
                        });
                    }
                }
            }
        }

        if let Some(problem) = self.first_unknown_visible(agent) {
            let utility = SCAN_BASE_UTILITY
                + agent.failure_streak as f32 * weights.scan_fail
                + agent.costs.scan * weights.cost;
            set.candidates.push(Candidate {
                kind: ActionKind::Scan,
                utility,
                cost: agent.costs.scan,
                target: CandidateTarget::Scan { problem },
            });
        }

        if agent.tokens.len() < agent.token_capacity {
            set.candidates.push(Candidate {
                kind: ActionKind::Stockpile,
                utility: STOCKPILE_BASE_UTILITY + agent.costs.generate * weights.cost,
                cost: agent.costs.generate,
                target: CandidateTarget::Stockpile,
            });
        }

        Some(set)
    }

    fn first_unknown_visible(&self, agent: &Agent) -> Option<ProblemId> {
        let vision_sq = self.config.vision_radius * self.config.vision_radius;
        let mut best_idx: Option<usize> = None;
        self.problem_index.neighbors_near(
            agent.position.x,
            agent.position.y,
            vision_sq,
            &mut |idx, _| {
                let Some(&pid) = self.problem_index_ids.get(idx) else {
                    return;
                };
                let Some(problem) = self.problems.get(pid) else {
                    return;
                };
                if problem.state != ProblemState::Active {
                    return;
                }
                if agent.sightings.iter().any(|s| s.problem == pid) {
                    return;
                }
                if best_idx.is_none_or(|b| idx < b) {
                    best_idx = Some(idx);
                }
            },
        );
        best_idx.map(|idx| self.problem_index_ids[idx])
    }

    fn agent_interact(&mut self, id: AgentId) {
        let Some(set) = self.build_candidates(id) else {
            return;
        };
        let Some(agent) = self.agents.get(id) else {
            return;
        };
        let mode = agent.mode;
        let energy = agent.energy;

        self.current_day.gating.share_suppressed += set.share_suppressed;
        self.current_day.gating.router_gen_solve_skipped += set.router_skipped;

        let mut candidates = set.candidates;
        // Stable sort: ties keep construction order by design.
        candidates.sort_by(|a, b| b.utility.total_cmp(&a.utility));

        let best = candidates.into_iter().next();
        let affordable = match &best {
            Some(c) if c.utility > 0.0 => energy >= c.cost,
            _ => false,
        };
        if !affordable {
            if energy < LOW_ENERGY_FLOOR {
                if let Some(agent) = self.agents.get_mut(id) {
                    agent.sleeping = true;
                }
                self.note_action(mode, ActionKind::Sleep);
            }
            return;
        }
        let Some(best) = best else { return };

        self.note_action(mode, best.kind);
        if let Some(agent) = self.agents.get_mut(id) {
            agent.energy -= best.cost;
            agent.boredom = 0;
        }

        match best.target {
            CandidateTarget::Share { problem, token } => {
                self.do_share(id, problem, token, &set.neighbors);
            }
            CandidateTarget::Solve {
                problem,
                token,
                neighbor_count,
            } => {
                self.do_solve(id, problem, token, neighbor_count);
            }
            CandidateTarget::GenSolve { problem } => self.do_gen_solve(id, problem),
            CandidateTarget::Scan { problem } => self.do_scan(id, problem),
            CandidateTarget::Stockpile => self.do_stockpile(id),
        }
    }

    fn do_share(
        &mut self,
        id: AgentId,
        problem: ProblemId,
        token_idx: Option<usize>,
        neighbors: &[AgentId],
    ) {
        let day = self.day;
        let Some(sighting) = self.problems.get(problem).map(|p| Sighting {
            problem,
            position: p.position,
            value: p.value,
            urgency: p.urgency(&self.config),
            last_seen_day: day,
        }) else {
            return;
        };
        let token_snapshot = token_idx.and_then(|idx| {
            self.agents
                .get(id)
                .and_then(|a| a.tokens.get(idx))
                .map(|t| (t.value, t.creator))
        });

        self.current_day.shares.total += 1;
        self.current_day.shares.neighbors_sum += neighbors.len() as u64;
        if token_snapshot.is_some() {
            self.current_day.shares.with_token += 1;
        }

        for &neighbor_id in neighbors {
            if let Some(neighbor) = self.agents.get_mut(neighbor_id) {
                neighbor.memorize(sighting);
            }
            if let Some((value, creator)) = token_snapshot {
                if self.rng.random::<f32>() < self.config.p_replicate_share {
                    let copy = Token::new(value, creator, &self.config);
                    if let Some(neighbor) = self.agents.get_mut(neighbor_id) {
                        neighbor.accept_token(
                            copy,
                            &self.problems,
                            &self.config,
                            &mut self.rng,
                            Some(&mut self.current_day.tokens),
                        );
                    }
                    self.current_day.tokens.replicated_share += 1;
                }
            }
        }
    }

    fn do_solve(&mut self, id: AgentId, pid: ProblemId, token_idx: usize, neighbor_count: usize) {
        let damage = (self.config.solve_damage_base
            + (neighbor_count as u32 / 3) * self.config.solve_damage_per3_neighbors)
            .clamp(1, self.config.solve_damage_max);
        let mut solved = false;
        {
            let Some(problem) = self.problems.get_mut(pid) else {
                return;
            };
            if problem.state != ProblemState::Active {
                return;
            }
            problem.hp -= damage as f32;
            if problem.hp <= 0.0 {
                problem.hp = 0.0;
                problem.state = ProblemState::Solved;
                solved = true;
            }
        }
        self.current_day.problems.hits += damage as u64;

        let energy_max = self.config.energy_max;
        let hit_reward = self.config.reward_per_hit * damage as f32;
        let replicate_snapshot = {
            let Some(agent) = self.agents.get_mut(id) else {
                return;
            };
            agent.energy = (agent.energy + hit_reward).clamp(0.0, energy_max);
            if let Some(token) = agent.tokens.get_mut(token_idx) {
                token.ttl = token.ttl_max;
                token.uses += 1;
            }
            let snapshot = agent
                .tokens
                .get(token_idx)
                .map(|t| (t.value, t.creator));
            agent.refresh_token(token_idx);
            snapshot
        };
        self.current_day.tokens.used += 1;

        if let Some((value, creator)) = replicate_snapshot {
            if self.rng.random::<f32>() < self.config.p_replicate_internal {
                let copy = Token::new(value, creator, &self.config);
                if let Some(agent) = self.agents.get_mut(id) {
                    agent.accept_token(
                        copy,
                        &self.problems,
                        &self.config,
                        &mut self.rng,
                        Some(&mut self.current_day.tokens),
                    );
                }
                self.current_day.tokens.replicated_internal += 1;
            }
        }

        if solved {
            self.current_day.problems.solved += 1;
            let reward = self.config.reward_on_solve;
            if let Some(agent) = self.agents.get_mut(id) {
                agent.energy = (agent.energy + reward).clamp(0.0, energy_max);
            }
        }
    }

    fn do_gen_solve(&mut self, id: AgentId, pid: ProblemId) {
        let Some((target, urgency)) = self
            .problems
            .get(pid)
            .filter(|p| p.state == ProblemState::Active)
            .map(|p| (p.value, p.urgency(&self.config)))
        else {
            return;
        };
        self.current_day.generation.attempts += 1;

        let attempt = {
            let Some(agent) = self.agents.get(id) else {
                return;
            };
            agent.anneal_attempt(urgency, &self.config, &mut self.rng)
        };

        if spectrum_matches(attempt, target, self.config.match_eps) {
            self.current_day.generation.successes += 1;
            let mut solved = false;
            if let Some(problem) = self.problems.get_mut(pid) {
                problem.hp -= 1.0;
                if problem.hp <= 0.0 {
                    problem.hp = 0.0;
                    problem.state = ProblemState::Solved;
                    solved = true;
                }
            }
            self.current_day.problems.hits += 1;

            let energy_max = self.config.energy_max;
            let hit_reward = self.config.reward_per_hit;
            let solve_reward = self.config.reward_on_solve;
            let token = Token::new(target, id, &self.config);
            if let Some(agent) = self.agents.get_mut(id) {
                agent.accept_token(
                    token,
                    &self.problems,
                    &self.config,
                    &mut self.rng,
                    Some(&mut self.current_day.tokens),
                );
                agent.energy = (agent.energy + hit_reward).clamp(0.0, energy_max);
                if solved {
                    agent.energy = (agent.energy + solve_reward).clamp(0.0, energy_max);
                }
            }
            if solved {
                self.current_day.problems.solved += 1;
            }
        } else if let Some(agent) = self.agents.get_mut(id) {
            agent.failure_streak = (agent.failure_streak + 2).min(FAILURE_STREAK_CAP);
        }
    }

    fn do_scan(&mut self, id: AgentId, pid: ProblemId) {
        let day = self.day;
        let Some(sighting) = self.problems.get(pid).map(|p| Sighting {
            problem: pid,
            position: p.position,
            value: p.value,
            urgency: p.urgency(&self.config),
            last_seen_day: day,
        }) else {
            return;
        };
        if let Some(agent) = self.agents.get_mut(id) {
            agent.memorize(sighting);
            agent.failure_streak = 0;
        }
    }

    fn do_stockpile(&mut self, id: AgentId) {
        let value = {
            let Some(agent) = self.agents.get(id) else {
                return;
            };
            agent.generate_value(&self.config, &mut self.rng)
        };
        let token = Token::new(value, id, &self.config);
        if let Some(agent) = self.agents.get_mut(id) {
            agent.accept_token(
                token,
                &self.problems,
                &self.config,
                &mut self.rng,
                Some(&mut self.current_day.tokens),
            );
        }
    }

    fn note_action(&mut self, mode: Mode, kind: ActionKind) {
        self.current_day.actions.record(kind);
        self.current_day.actions_by_mode.for_mode(mode).record(kind);
    }

    /// End-of-day pipeline, strictly ordered.
    fn end_day(&mut self) {
        let just_exploded = self.stage_problem_aging();
        self.stage_purge_problems(&just_exploded);
        self.stage_token_decay();
        self.remove_dead_agents();
        self.stage_agent_new_day();
        self.stage_reproduction();
        self.stage_problem_respawn();
        self.rebuild_problem_index();
        self.finalize_day();
    }

    /// Age active problems, marking explosions and applying blast deaths.
    fn stage_problem_aging(&mut self) -> Vec<ProblemId> {
        let mut exploded = Vec::new();
        for &pid in &self.problem_order {
            let Some(problem) = self.problems.get_mut(pid) else {
                continue;
            };
            if problem.state != ProblemState::Active {
                continue;
            }
            problem.lifespan -= 1;
            problem.age_days += 1;
            if problem.lifespan <= 0 {
                problem.state = ProblemState::Exploded;
                exploded.push(pid);
                self.current_day.problems.exploded += 1;
            }
        }
        if exploded.is_empty() {
            return exploded;
        }

        let entries: Vec<(AgentId, Position)> = self
            .agent_order
            .iter()
            .filter_map(|&aid| self.agents.get(aid).map(|a| (aid, a.position)))
            .collect();
        let positions: Vec<(f32, f32)> =
            entries.iter().map(|&(_, p)| (p.x, p.y)).collect();
        if self.agent_index.rebuild(&positions).is_err() {
            return exploded;
        }

        let blast_radius = self.config.blast_radius;
        let blast_sq = blast_radius * blast_radius;
        let base_death = self.config.base_death;
        let k_death = self.config.k_death;
        for &pid in &exploded {
            let Some(center) = self.problems.get(pid).map(|p| p.position) else {
                continue;
            };
            let mut victims: Vec<(usize, f32)> = Vec::new();
            self.agent_index
                .neighbors_near(center.x, center.y, blast_sq, &mut |idx, dist_sq| {
                    victims.push((idx, dist_sq.into_inner().sqrt()));
                });
            victims.sort_unstable_by_key(|&(idx, _)| idx);
            for (idx, distance) in victims {
                let aid = entries[idx].0;
                if !self.agents.get(aid).is_some_and(|a| a.alive) {
                    continue;
                }
                let p_death =
                    (base_death + k_death * (1.0 - distance / blast_radius)).clamp(0.0, 1.0);
                if self.rng.random::<f32>() < p_death {
                    if let Some(agent) = self.agents.get_mut(aid) {
                        agent.alive = false;
                    }
                    self.current_day.deaths.blast += 1;
                }
            }
        }
        exploded
    }

    /// Drop non-active problems from the registry, keeping the ones that
    /// exploded at this boundary visible until the next one.
    fn stage_purge_problems(&mut self, just_exploded: &[ProblemId]) {
        let problems = &mut self.problems;
        self.problem_order.retain(|&pid| {
            let keep = problems
                .get(pid)
                .is_some_and(|p| p.state == ProblemState::Active)
                || just_exploded.contains(&pid);
            if !keep {
                problems.remove(pid);
            }
            keep
        });
    }

    fn stage_token_decay(&mut self) {
        let order = &self.agent_order;
        for &aid in order {
            let Some(agent) = self.agents.get_mut(aid) else {
                continue;
            };
            if !agent.alive {
                continue;
            }
            let pruned = agent.decay_tokens();
            self.current_day.tokens.pruned += pruned;
        }
    }

    fn remove_dead_agents(&mut self) {
        let agents = &mut self.agents;
        self.agent_order.retain(|&aid| {
            let keep = agents.get(aid).is_some_and(|a| a.alive);
            if !keep {
                agents.remove(aid);
            }
            keep
        });
    }

    fn stage_agent_new_day(&mut self) {
        let order = self.agent_order.clone();
        for aid in order {
            let Some(agent) = self.agents.get_mut(aid) else {
                continue;
            };
            agent.start_new_day(&self.config);
            if !agent.alive {
                self.current_day.deaths.age += 1;
            }
        }
        self.remove_dead_agents();
    }

    fn stage_reproduction(&mut self) {
        if self.agent_order.len() >= self.config.max_population as usize {
            return;
        }
        let min_parent_age = self.config.min_parent_age_days;
        let parents: Vec<AgentId> = self
            .agent_order
            .iter()
            .copied()
            .filter(|&aid| {
                self.agents
                    .get(aid)
                    .is_some_and(|a| a.age_days >= min_parent_age)
            })
            .collect();
        if !parents.is_empty() && self.rng.random::<f32>() < REPRODUCTION_CHANCE {
            let pid = parents[self.rng.random_range(0..parents.len())];
            if let Some(parent) = self.agents.get(pid).cloned() {
                self.spawn_child_agent(&parent);
                self.current_day.births += 1;
            }
        } else if self.agent_order.len() < CRITICAL_POPULATION {
            self.spawn_random_agent();
            self.current_day.births += 1;
        }
    }

    fn stage_problem_respawn(&mut self) {
        let target = self.config.target_problems as usize;
        let mut active = self.active_problem_count();
        let needed = target.saturating_sub(active);
        let max_attempts = (needed * 6).max(30);
        let mut attempts = 0;
        while active < target && attempts < max_attempts {
            attempts += 1;
            if self.rng.random::<f32>() < self.config.problem_respawn_prob {
                self.spawn_problem();
                active += 1;
                self.current_day.problems.spawned += 1;
            }
        }
    }

    fn finalize_day(&mut self) {
        let population = self.agent_order.len();
        let active_problems = self.active_problem_count();
        let coverage = self.compute_coverage();
        let entropy_proxy = self.compute_entropy_proxy();
        let mut energy_sum = 0.0;
        let mut token_sum = 0usize;
        let mut modes = ModeCounts::default();
        for &aid in &self.agent_order {
            let Some(agent) = self.agents.get(aid) else {
                continue;
            };
            energy_sum += agent.energy;
            token_sum += agent.tokens.len();
            match agent.mode {
                Mode::Vault => modes.vault += 1,
                Mode::Router => modes.router += 1,
            }
        }

        let stats = &mut self.current_day;
        stats.population_end = population;
        stats.problems_end = active_problems;
        stats.coverage = coverage;
        stats.entropy_proxy = entropy_proxy;
        stats.mean_energy = if population > 0 {
            energy_sum / population as f32
        } else {
            0.0
        };
        stats.mean_tokens = if population > 0 {
            token_sum as f32 / population as f32
        } else {
            0.0
        };
        stats.modes = modes;

        let next_day = self.day + 1;
        let finished = std::mem::replace(
            &mut self.current_day,
            DayStats::open(next_day, population, active_problems),
        );
        self.persistence.on_day(&finished);
        self.history.push(finished);
        self.day = next_day;
        self.tick_in_day = 0;
    }

    fn compute_coverage(&self) -> f32 {
        let active: Vec<&Problem> = self
            .problem_order
            .iter()
            .filter_map(|&pid| self.problems.get(pid))
            .filter(|p| p.state == ProblemState::Active)
            .collect();
        if active.is_empty() {
            return 1.0;
        }
        let eps = self.config.match_eps;
        let covered = active
            .iter()
            .filter(|problem| {
                self.agent_order.iter().any(|&aid| {
                    self.agents.get(aid).is_some_and(|a| {
                        a.tokens
                            .iter()
                            .any(|t| spectrum_matches(t.value, problem.value, eps))
                    })
                })
            })
            .count();
        covered as f32 / active.len() as f32
    }

    fn compute_entropy_proxy(&self) -> f32 {
        self.problem_order
            .iter()
            .filter_map(|&pid| self.problems.get(pid))
            .filter(|p| p.state == ProblemState::Active)
            .map(|p| p.hp * p.urgency(&self.config))
            .sum()
    }

    fn spawn_random_agent(&mut self) -> AgentId {
        let config = &self.config;
        let rng = &mut self.rng;
        let id = self
            .agents
            .insert_with_key(|id| Agent::new_random(id, config, rng));
        self.agent_order.push(id);
        self.grant_initial_tokens(id);
        id
    }

    fn spawn_child_agent(&mut self, parent: &Agent) -> AgentId {
        let config = &self.config;
        let rng = &mut self.rng;
        let id = self
            .agents
            .insert_with_key(|id| Agent::new_child(id, parent, config, rng));
        self.agent_order.push(id);
        self.grant_initial_tokens(id);
        id
    }

    /// Newborns stockpile a handful of starter tokens for free.
    fn grant_initial_tokens(&mut self, id: AgentId) {
        for _ in 0..INITIAL_TOKEN_GRANTS {
            let value = {
                let Some(agent) = self.agents.get(id) else {
                    return;
                };
                agent.generate_value(&self.config, &mut self.rng)
            };
            let token = Token::new(value, id, &self.config);
            if let Some(agent) = self.agents.get_mut(id) {
                agent.accept_token(token, &self.problems, &self.config, &mut self.rng, None);
            }
        }
    }

    fn spawn_problem(&mut self) -> ProblemId {
        let problem = Problem::spawn(&self.config, &mut self.rng);
        let id = self.problems.insert(problem);
        self.problem_order.push(id);
        id
    }

    fn rebuild_problem_index(&mut self) {
        self.problem_index_ids.clear();
        let mut positions = Vec::with_capacity(self.problem_order.len());
        for &pid in &self.problem_order {
            if let Some(problem) = self.problems.get(pid) {
                self.problem_index_ids.push(pid);
                positions.push((problem.position.x, problem.position.y));
            }
        }
        let _ = self.problem_index.rebuild(&positions);
    }

    fn active_problem_count(&self) -> usize {
        self.problem_order
            .iter()
            .filter_map(|&pid| self.problems.get(pid))
            .filter(|p| p.state == ProblemState::Active)
            .count()
    }

    /// Returns an immutable reference to configuration.
    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    /// Replace the persistence sink.
    pub fn set_persistence(&mut self, persistence: Box<dyn DayPersistence>) {
        self.persistence = persistence;
    }

    /// Whether `initialize` has been called.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Current simulated day.
    #[must_use]
    pub const fn day(&self) -> u32 {
        self.day
    }

    /// Ticks processed within the current day.
    #[must_use]
    pub const fn tick(&self) -> u32 {
        self.tick_in_day
    }

    /// Live agent handles in processing order.
    #[must_use]
    pub fn agent_ids(&self) -> &[AgentId] {
        &self.agent_order
    }

    /// Borrow an agent by handle.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    /// Iterate live agents in processing order.
    pub fn agents(&self) -> impl Iterator<Item = &Agent> {
        self.agent_order
            .iter()
            .filter_map(|&aid| self.agents.get(aid))
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agent_order.len()
    }

    /// Problem handles in spawn order (including not-yet-purged corpses).
    #[must_use]
    pub fn problem_ids(&self) -> &[ProblemId] {
        &self.problem_order
    }

    /// Borrow a problem by handle; `None` once purged from the registry.
    #[must_use]
    pub fn problem(&self, id: ProblemId) -> Option<&Problem> {
        self.problems.get(id)
    }

    /// Iterate registered problems in spawn order.
    pub fn problems(&self) -> impl Iterator<Item = (ProblemId, &Problem)> {
        self.problem_order
            .iter()
            .filter_map(|&pid| self.problems.get(pid).map(|p| (pid, p)))
    }

    /// Archived per-day statistics, oldest first.
    #[must_use]
    pub fn history(&self) -> &[DayStats] {
        &self.history
    }

    /// Spectrum histogram over every token held by a live agent.
    #[must_use]
    pub fn token_histogram(&self, bins: usize) -> Vec<usize> {
        spectrum_histogram(
            self.agents()
                .flat_map(|a| a.tokens.iter().map(|t| t.value)),
            bins,
        )
    }

    /// Spectrum histogram over active problem values.
    #[must_use]
    pub fn problem_histogram(&self, bins: usize) -> Vec<usize> {
        spectrum_histogram(
            self.problems()
                .filter(|(_, p)| p.state == ProblemState::Active)
                .map(|(_, p)| p.value),
            bins,
        )
    }

    /// Spectrum histogram over agent specialization values.
    #[must_use]
    pub fn specialization_histogram(&self, bins: usize) -> Vec<usize> {
        spectrum_histogram(self.agents().map(|a| a.specialization), bins)
    }
}

fn spectrum_histogram(values: impl Iterator<Item = f32>, bins: usize) -> Vec<usize> {
    let mut histogram = vec![0usize; bins.max(1)];
    if bins == 0 {
        return histogram;
    }
    for value in values {
        let idx = ((value / SPECTRUM_SPAN) * bins as f32).floor() as usize;
        histogram[idx.min(bins - 1)] += 1;
    }
    histogram
}

/// Run independent seeded simulations in parallel, one per seed, returning
/// each run's archived day statistics. Instances share no mutable state, so
/// this is the sanctioned scaling axis for statistical batch evaluation.
pub fn run_batch(
    config: &SimulationConfig,
    seeds: &[u64],
    days: u32,
) -> Result<Vec<Vec<DayStats>>, SimulationError> {
    config.validate()?;
    seeds
        .par_iter()
        .map(|&seed| {
            let mut config = config.clone();
            config.rng_seed = Some(seed);
            let mut world = World::new(config)?;
            world.initialize();
            world.advance_days(days)?;
            Ok(world.history().to_vec())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_rng(seed: u64) -> SmallRng {
        SmallRng::seed_from_u64(seed)
    }

    fn small_config(seed: u64) -> SimulationConfig {
        SimulationConfig {
            initial_agents: 8,
            target_problems: 6,
            max_population: 40,
            rng_seed: Some(seed),
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn wrap_round_trips_under_full_turns() {
        for v in [-721.5, -360.0, -1.0, 0.0, 13.25, 359.9, 360.0, 1081.0] {
            let canonical = wrap_spectrum(v);
            assert!((0.0..SPECTRUM_SPAN).contains(&canonical));
            for k in [-3.0_f32, -1.0, 0.0, 2.0, 5.0] {
                let shifted = wrap_spectrum(canonical + k * SPECTRUM_SPAN);
                assert!((shifted - canonical).abs() < 1e-3, "v={v} k={k}");
            }
        }
        assert_eq!(wrap_spectrum(360.0), 0.0);
        assert_eq!(wrap_spectrum(-1.0), 359.0);
        assert_eq!(wrap_spectrum(-361.0), 359.0);
    }

    #[test]
    fn circular_distance_scenarios() {
        assert_eq!(circular_distance(0.0, 0.0), 0.0);
        assert_eq!(circular_distance(0.0, 180.0), 180.0);
        assert_eq!(circular_distance(0.0, 359.0), 1.0);
        assert_eq!(circular_distance(359.0, 1.0), 2.0);
        assert_eq!(circular_distance(10.0, 350.0), 20.0);
        assert_eq!(circular_distance(90.0, 270.0), 180.0);
    }

    #[test]
    fn matching_tolerance_and_symmetry() {
        assert!(spectrum_matches(100.0, 100.0, 2.0));
        assert!(spectrum_matches(100.0, 102.0, 2.0));
        assert!(!spectrum_matches(100.0, 103.0, 2.0));
        assert!(spectrum_matches(1.0, 359.0, 2.0));
        assert!(spectrum_matches(0.0, 358.0, 2.0));
        for (a, b, eps) in [(100.0, 102.0, 2.0), (0.0, 359.0, 0.5), (45.0, 315.0, 90.0)] {
            assert_eq!(
                spectrum_matches(a, b, eps),
                spectrum_matches(b, a, eps),
                "a={a} b={b}"
            );
        }
    }

    #[test]
    fn signed_difference_picks_the_short_way() {
        assert_eq!(signed_difference(10.0, 350.0), 20.0);
        assert_eq!(signed_difference(350.0, 10.0), -20.0);
        assert_eq!(signed_difference(180.0, 0.0), 180.0);
        assert_eq!(signed_difference(0.0, 0.0), 0.0);
    }

    #[test]
    fn symmetric_noise_is_centered_and_bounded() {
        let mut rng = seeded_rng(7);
        let mut sum = 0i64;
        let bound = 6 * 5 - 6; // n*(d-1)
        for _ in 0..20_000 {
            let noise = symmetric_noise(&mut rng, 6, 5);
            assert!(noise.abs() <= bound);
            sum += noise as i64;
        }
        let mean = sum as f64 / 20_000.0;
        assert!(mean.abs() < 1.0, "mean={mean}");
    }

    #[test]
    fn specialization_values_are_discrete_spokes() {
        let mut rng = seeded_rng(11);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..2_000 {
            let v = sample_specialization(&mut rng);
            assert_eq!(v % 45.0, 0.0);
            seen.insert(v as u32);
        }
        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn problem_value_sampler_stays_on_the_ring() {
        let mut rng = seeded_rng(13);
        let histogram = spectrum_histogram(
            (0..20_000).map(|_| sample_problem_value(&mut rng)),
            36,
        );
        assert_eq!(histogram.iter().sum::<usize>(), 20_000);
        let max = *histogram.iter().max().unwrap() as f64;
        let min = *histogram.iter().min().unwrap().max(&1) as f64;
        assert!(max / min > 1.15, "distribution should be non-uniform");
    }

    #[test]
    fn default_config_validates() {
        assert!(SimulationConfig::default().validate().is_ok());
    }

    #[test]
    fn degenerate_memory_split_is_rejected() {
        let config = SimulationConfig {
            max_mem: 1,
            ..SimulationConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(SimulationError::InvalidConfig(
                "memory split leaves no room for both caches"
            ))
        );
        let config = SimulationConfig {
            vault_mem_split: 1.0,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn initial_agents_bounded_by_population_ceiling() {
        let config = SimulationConfig {
            initial_agents: 300,
            max_population: 200,
            ..SimulationConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn capacity_split_keeps_both_caches_usable() {
        assert_eq!(capacity_split(60, 0.78), (46, 14));
        assert_eq!(capacity_split(60, 0.35), (21, 39));
        assert_eq!(capacity_split(60, 0.5), (30, 30));
        let (tokens, sightings) = capacity_split(2, 0.5);
        assert!(tokens >= 1 && sightings >= 1);
    }

    #[test]
    fn tick_before_initialize_errors() {
        let mut world = World::new(small_config(1)).expect("world");
        assert_eq!(world.advance_tick(), Err(SimulationError::NotInitialized));
        world.initialize();
        assert!(world.advance_tick().is_ok());
    }

    #[test]
    fn initialize_populates_both_registries() {
        let mut world = World::new(small_config(2)).expect("world");
        world.initialize();
        assert_eq!(world.agent_count(), 8);
        assert_eq!(world.active_problem_count(), 6);
        for agent in world.agents() {
            assert_eq!(agent.tokens.len(), INITIAL_TOKEN_GRANTS);
            assert!(agent.alive && !agent.sleeping);
            let cost_sum =
                agent.costs.scan + agent.costs.generate + agent.costs.share + agent.costs.solve;
            assert!((cost_sum - COST_BUDGET).abs() < 1e-3);
        }
    }

    #[test]
    fn sighting_cache_guards_rare_critical_entries() {
        let mut world = World::new(small_config(3)).expect("world");
        world.initialize();
        let id = world.agent_ids()[0];
        let pids: Vec<ProblemId> = world.problem_ids().to_vec();
        let agent = world.agents.get_mut(id).unwrap();
        agent.sighting_capacity = 2;
        agent.sightings.clear();

        let entry = |problem, urgency| Sighting {
            problem,
            position: Position::new(0.0, 0.0),
            value: 10.0,
            urgency,
            last_seen_day: 0,
        };
        assert!(agent.memorize(entry(pids[0], 40.0)));
        assert!(agent.memorize(entry(pids[1], 90.0)));
        // Full: lower urgency than the cached minimum is rejected.
        assert!(!agent.memorize(entry(pids[2], 30.0)));
        assert_eq!(agent.sightings.len(), 2);
        // Strictly greater replaces the minimum.
        assert!(agent.memorize(entry(pids[3], 60.0)));
        assert_eq!(agent.sightings.len(), 2);
        assert!(agent.sightings.iter().all(|s| s.problem != pids[0]));
        // Re-observing refreshes in place instead of inserting.
        assert!(agent.memorize(entry(pids[1], 120.0)));
        assert_eq!(agent.sightings.len(), 2);
        let refreshed = agent
            .sightings
            .iter()
            .find(|s| s.problem == pids[1])
            .unwrap();
        assert_eq!(refreshed.urgency, 120.0);
    }

    #[test]
    fn token_eviction_drops_the_lowest_retention_holder() {
        let config = SimulationConfig {
            enable_modes: false,
            max_mem: 6, // 3 tokens / 3 sightings
            ..small_config(4)
        };
        let mut world = World::new(config).expect("world");
        world.initialize();
        let id = world.agent_ids()[0];
        let pid_a = world.problem_ids()[0];
        let pid_b = world.problem_ids()[1];
        world.problems.get_mut(pid_a).unwrap().value = 100.0;
        world.problems.get_mut(pid_b).unwrap().value = 200.0;

        let (token_capacity, _) = capacity_split(6, DEFAULT_MEM_SPLIT);
        let config = world.config.clone();
        {
            let agent = world.agents.get_mut(id).unwrap();
            assert_eq!(agent.token_capacity, token_capacity);
            agent.sightings.clear();
            for (pid, value) in [(pid_a, 100.0), (pid_b, 200.0)] {
                agent.sightings.push(Sighting {
                    problem: pid,
                    position: Position::new(0.0, 0.0),
                    value,
                    urgency: 50.0,
                    last_seen_day: 0,
                });
            }
            agent.tokens.clear();
            for value in [100.0, 200.0, 50.0] {
                agent.tokens.push(Token::new(value, id, &config));
            }
        }

        let incoming = Token::new(100.0, id, &config);
        let problems = std::mem::take(&mut world.problems);
        {
            let agent = world.agents.get_mut(id).unwrap();
            agent.accept_token(incoming, &problems, &config, &mut world.rng, None);
            // The only token matching no known problem scores jitter < 10 and
            // loses to both matched holders (urgency + 1000 each).
            assert_eq!(agent.tokens.len(), token_capacity);
            assert!(agent.tokens.iter().all(|t| t.value != 50.0));
        }
        world.problems = problems;
    }

    #[test]
    fn full_token_cache_never_grows() {
        let mut world = World::new(small_config(5)).expect("world");
        world.initialize();
        let id = world.agent_ids()[0];
        let capacity = world.agent(id).unwrap().token_capacity;
        let config = world.config.clone();
        let problems = std::mem::take(&mut world.problems);
        {
            let agent = world.agents.get_mut(id).unwrap();
            while agent.tokens.len() < capacity {
                let token = Token::new(agent.tokens.len() as f32, id, &config);
                agent.accept_token(token, &problems, &config, &mut world.rng, None);
            }
            for value in 0..20 {
                let token = Token::new(value as f32 * 17.0, id, &config);
                agent.accept_token(token, &problems, &config, &mut world.rng, None);
                assert_eq!(agent.tokens.len(), capacity);
            }
        }
        world.problems = problems;
    }

    #[test]
    fn token_decay_prunes_expired_tokens() {
        let mut world = World::new(small_config(6)).expect("world");
        world.initialize();
        let id = world.agent_ids()[0];
        let agent = world.agents.get_mut(id).unwrap();
        for token in &mut agent.tokens {
            token.ttl = 1;
        }
        let held = agent.tokens.len() as u64;
        assert_eq!(agent.decay_tokens(), held);
        assert!(agent.tokens.is_empty());
    }

    #[test]
    fn problem_explodes_then_leaves_registry_a_day_later() {
        let config = SimulationConfig {
            problem_respawn_prob: 0.0,
            ..small_config(8)
        };
        let mut world = World::new(config).expect("world");
        world.initialize();
        let pid = world.problem_ids()[0];
        world.problems.get_mut(pid).unwrap().lifespan = 1;

        world.advance_day().expect("day 1");
        let problem = world.problem(pid).expect("still registered");
        assert_eq!(problem.state, ProblemState::Exploded);

        world.advance_day().expect("day 2");
        assert!(world.problem(pid).is_none());
    }

    #[test]
    fn solved_problems_are_purged_at_the_next_boundary() {
        let config = SimulationConfig {
            problem_respawn_prob: 0.0,
            ..small_config(9)
        };
        let mut world = World::new(config).expect("world");
        world.initialize();
        let pid = world.problem_ids()[0];
        world.problems.get_mut(pid).unwrap().state = ProblemState::Solved;

        world.advance_day().expect("day");
        assert!(world.problem(pid).is_none());
    }

    #[test]
    fn solved_problems_vanish_from_memory_on_the_next_move() {
        let mut world = World::new(small_config(11)).expect("world");
        world.initialize();
        let id = world.agent_ids()[0];
        let pid = world.problem_ids()[0];
        let sighting = {
            let problem = world.problems.get(pid).unwrap();
            Sighting {
                problem: pid,
                position: problem.position,
                value: problem.value,
                urgency: problem.urgency(&world.config),
                last_seen_day: 0,
            }
        };
        world.agents.get_mut(id).unwrap().memorize(sighting);
        world.problems.get_mut(pid).unwrap().state = ProblemState::Solved;

        world.agent_move(id);
        let agent = world.agent(id).expect("agent");
        assert!(
            agent.sightings.iter().all(|s| s.problem != pid),
            "stale sighting must be pruned lazily on the next move"
        );
    }

    #[test]
    fn day_boundary_wakes_sleepers_and_ages_agents() {
        let mut world = World::new(small_config(10)).expect("world");
        world.initialize();
        world.advance_day().expect("day");
        assert_eq!(world.day(), 1);
        assert_eq!(world.tick(), 0);
        for agent in world.agents() {
            assert!(!agent.sleeping);
            assert_eq!(agent.boredom, 0);
            assert_eq!(agent.age_days, 1);
        }
    }

    #[test]
    fn equal_seeds_produce_identical_histories() {
        let config = small_config(0xDEAD_BEEF);
        let mut a = World::new(config.clone()).expect("a");
        let mut b = World::new(config.clone()).expect("b");
        a.initialize();
        b.initialize();
        a.advance_days(12).expect("a days");
        b.advance_days(12).expect("b days");
        assert_eq!(a.history(), b.history());
        assert_eq!(a.token_histogram(36), b.token_histogram(36));

        let mut c = World::new(SimulationConfig {
            rng_seed: Some(0xF00D_F00D),
            ..config
        })
        .expect("c");
        c.initialize();
        c.advance_days(12).expect("c days");
        assert_ne!(a.history(), c.history());
    }

    #[test]
    fn initialize_resets_a_running_world() {
        let mut world = World::new(small_config(12)).expect("world");
        world.initialize();
        world.advance_days(3).expect("days");
        assert_eq!(world.day(), 3);
        world.initialize();
        assert_eq!(world.day(), 0);
        assert_eq!(world.history().len(), 0);
        assert_eq!(world.agent_count(), 8);
    }

    #[test]
    fn caps_hold_across_a_multi_day_run() {
        let mut world = World::new(small_config(14)).expect("world");
        world.initialize();
        for _ in 0..20 {
            world.advance_day().expect("day");
            for agent in world.agents() {
                assert!(agent.tokens.len() <= agent.token_capacity);
                assert!(agent.sightings.len() <= agent.sighting_capacity);
                assert!((0.0..=world.config().energy_max).contains(&agent.energy));
            }
        }
    }

    #[test]
    fn stats_stay_finite_and_in_bounds() {
        let mut world = World::new(small_config(15)).expect("world");
        world.initialize();
        world.advance_days(15).expect("days");
        for stats in world.history() {
            assert!((0.0..=1.0).contains(&stats.coverage));
            assert!(stats.entropy_proxy.is_finite());
            assert!(stats.mean_energy.is_finite());
            assert!((0.0..=world.config().energy_max).contains(&stats.mean_energy));
            assert!(stats.mean_tokens.is_finite());
            assert_eq!(
                stats.modes.vault + stats.modes.router,
                stats.population_end
            );
            assert!(stats.ticks > 0);
        }
    }

    #[test]
    fn engine_is_behaviorally_alive_over_thirty_days() {
        let mut world = World::new(SimulationConfig {
            rng_seed: Some(21),
            ..SimulationConfig::default()
        })
        .expect("world");
        world.initialize();
        world.advance_days(30).expect("days");
        let solved: u64 = world.history().iter().map(|d| d.problems.solved).sum();
        let pruned: u64 = world.history().iter().map(|d| d.tokens.pruned).sum();
        let population_min = world
            .history()
            .iter()
            .map(|d| d.population_end)
            .min()
            .unwrap();
        assert!(solved > 0, "no problem was ever solved");
        assert!(pruned > 0, "no token ever expired");
        assert!(population_min >= 1, "population collapsed");
        assert!(population_min <= world.config().max_population as usize);
    }

    #[test]
    fn histograms_count_every_token() {
        let mut world = World::new(small_config(22)).expect("world");
        world.initialize();
        world.advance_days(3).expect("days");
        let held: usize = world.agents().map(|a| a.tokens.len()).sum();
        let histogram = world.token_histogram(world.config().histogram_bins);
        assert_eq!(histogram.iter().sum::<usize>(), held);
        let spokes = world.specialization_histogram(8);
        assert_eq!(spokes.iter().sum::<usize>(), world.agent_count());
    }
}
