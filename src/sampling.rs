use std::collections::{HashSet, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::backend::TokenId;
use crate::config::GenerationConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate tokens for one sampling step. Stages narrow or reshape it in place.
#[derive(Debug, Clone)]
pub struct Distribution {
    candidates: Vec<Candidate>,
    sorted: bool,
}

impl Distribution {
    pub fn from_logits(logits: &[f32]) -> Self {
        let candidates = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| Candidate {
                id: id as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            candidates,
            sorted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    fn sort_descending(&mut self) {
        if !self.sorted {
            self.candidates
                .sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
    }

    fn truncate(&mut self, n: usize) {
        self.sort_descending();
        self.candidates.truncate(n.max(1));
    }

    /// Sorts by logit and fills `p` with normalized probabilities.
    fn softmax(&mut self) {
        self.sort_descending();
        let Some(max) = self.candidates.first().map(|c| c.logit) else {
            return;
        };
        let mut sum = 0.0f32;
        for c in &mut self.candidates {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        for c in &mut self.candidates {
            c.p /= sum;
        }
    }
}

pub trait SamplerStage: Send {
    fn name(&self) -> &'static str;
    fn transform(&mut self, dist: &mut Distribution);
    /// Told about every token the chain emits.
    fn accept(&mut self, _token: TokenId) {}
}

pub trait TokenDraw: Send {
    fn draw(&mut self, dist: &mut Distribution) -> Option<TokenId>;
}

pub struct RepetitionPenalty {
    penalty: f32,
    last_n: usize,
    history: VecDeque<TokenId>,
}

impl RepetitionPenalty {
    pub fn new(penalty: f32, last_n: usize) -> Self {
        Self {
            penalty,
            last_n,
            history: VecDeque::with_capacity(last_n),
        }
    }
}

impl SamplerStage for RepetitionPenalty {
    fn name(&self) -> &'static str {
        "penalties"
    }

    fn transform(&mut self, dist: &mut Distribution) {
        if self.last_n == 0 || self.penalty == 1.0 || self.history.is_empty() {
            return;
        }
        let seen: HashSet<TokenId> = self.history.iter().copied().collect();
        for c in &mut dist.candidates {
            if !seen.contains(&c.id) {
                continue;
            }
            if c.logit <= 0.0 {
                c.logit *= self.penalty;
            } else {
                c.logit /= self.penalty;
            }
        }
        dist.sorted = false;
    }

    fn accept(&mut self, token: TokenId) {
        if self.last_n == 0 {
            return;
        }
        if self.history.len() == self.last_n {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }
}

pub struct TopK {
    k: i32,
}

impl TopK {
    pub fn new(k: i32) -> Self {
        Self { k }
    }
}

impl SamplerStage for TopK {
    fn name(&self) -> &'static str {
        "top-k"
    }

    fn transform(&mut self, dist: &mut Distribution) {
        if self.k <= 0 {
            return;
        }
        dist.truncate(self.k as usize);
    }
}

pub struct TopP {
    p: f32,
    min_keep: usize,
}

impl TopP {
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self { p, min_keep }
    }
}

impl SamplerStage for TopP {
    fn name(&self) -> &'static str {
        "top-p"
    }

    fn transform(&mut self, dist: &mut Distribution) {
        if self.p >= 1.0 || dist.is_empty() {
            return;
        }
        dist.softmax();
        let mut cumulative = 0.0;
        let mut keep = dist.len();
        for (i, c) in dist.candidates.iter().enumerate() {
            cumulative += c.p;
            if cumulative >= self.p && i + 1 >= self.min_keep {
                keep = i + 1;
                break;
            }
        }
        dist.truncate(keep);
    }
}

pub struct Temperature {
    t: f32,
}

impl Temperature {
    pub fn new(t: f32) -> Self {
        Self { t }
    }
}

impl SamplerStage for Temperature {
    fn name(&self) -> &'static str {
        "temp"
    }

    fn transform(&mut self, dist: &mut Distribution) {
        if self.t <= 0.0 {
            // greedy
            dist.truncate(1);
            return;
        }
        for c in &mut dist.candidates {
            c.logit /= self.t;
        }
    }
}

/// Draws from the softmax of whatever candidates survived the stages.
pub struct DistDraw {
    rng: StdRng,
}

impl DistDraw {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl TokenDraw for DistDraw {
    fn draw(&mut self, dist: &mut Distribution) -> Option<TokenId> {
        dist.softmax();
        let r: f32 = self.rng.random();
        let mut cumulative = 0.0;
        for c in &dist.candidates {
            cumulative += c.p;
            if r < cumulative {
                return Some(c.id);
            }
        }
        dist.candidates.last().map(|c| c.id)
    }
}

fn entropy_seed() -> u64 {
    let mut buf = [0u8; 8];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(e) => {
            warn!(error = %e, "SAMPLER: OS entropy unavailable, seeding from clock");
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0)
        }
    }
}

/// Penalty, top-k, top-p and temperature stages followed by one draw.
pub struct SamplerChain {
    stages: Vec<Box<dyn SamplerStage>>,
    draw: Box<dyn TokenDraw>,
}

impl SamplerChain {
    pub fn new(stages: Vec<Box<dyn SamplerStage>>, draw: Box<dyn TokenDraw>) -> Self {
        Self { stages, draw }
    }

    pub fn from_config(config: &GenerationConfig) -> Self {
        let seed = config.seed.unwrap_or_else(entropy_seed);
        let chain = Self::new(
            vec![
                Box::new(RepetitionPenalty::new(config.repeat_penalty, config.repeat_last_n)),
                Box::new(TopK::new(config.top_k)),
                Box::new(TopP::new(config.top_p, 1)),
                Box::new(Temperature::new(config.temperature)),
            ],
            Box::new(DistDraw::new(seed)),
        );
        debug!(
            stages = %chain.describe(),
            temperature = config.temperature,
            top_k = config.top_k,
            top_p = config.top_p,
            "SAMPLER: chain built"
        );
        chain
    }

    pub fn describe(&self) -> String {
        let mut names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        names.push("dist");
        names.join(" -> ")
    }

    /// Samples one token and feeds it back to every stage.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        let mut dist = Distribution::from_logits(logits);
        if dist.is_empty() {
            return None;
        }
        for stage in &mut self.stages {
            stage.transform(&mut dist);
        }
        let token = self.draw.draw(&mut dist)?;
        for stage in &mut self.stages {
            stage.accept(token);
        }
        Some(token)
    }
}
