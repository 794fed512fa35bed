//! Penalty and sampling chain.
//!
//! A chain is built once per model load from [`SamplingConfig`] and
//! [`PenaltyConfig`]:
//!
//! ```text
//! [penalties] -> greedy                                     (temperature <= 0)
//! [penalties] -> top_k -> typical -> top_p -> min_p -> temp -> dist
//! [penalties] -> temp -> mirostat_v1                        (mirostat = 1)
//! [penalties] -> temp -> mirostat_v2                        (mirostat = 2)
//! ```
//!
//! Penalties are only included when they differ from neutral, and any of
//! top-k/typical/top-p/min-p set to [`DISABLED`] is left out.
//!
//! With `use_common_sampler` the top-k family runs on a fused path: penalties
//! are applied straight to the logits and a partial selection picks the top
//! k candidates, instead of materializing and sorting the whole vocabulary.
//!
//! The llama.cpp backend maps each [`Stage`] onto the matching native
//! `llama_sampler`; [`SamplerChain::sample`] runs the same chain over a
//! plain logits slice for the simulated backend.

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{PenaltyConfig, SamplingConfig, DISABLED};
use crate::inference::llama_ffi::TokenId;

/// One candidate token (mirrors llama_token_data).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: TokenId,
    pub logit: f32,
    pub p: f32,
}

/// Candidate set threaded through the chain (mirrors llama_token_data_array).
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub data: Vec<TokenData>,

    /// Sorted by descending logit.
    pub sorted: bool,

    /// Index into `data` picked by a terminal stage.
    pub selected: Option<usize>,
}

impl Candidates {
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenData {
                id: i as TokenId,
                logit,
                p: 0.0,
            })
            .collect();
        Self {
            data,
            sorted: false,
            selected: None,
        }
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.data.sort_unstable_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
    }

    /// Sort and fill `p` with normalized probabilities.
    pub fn softmax(&mut self) {
        self.sort();
        let Some(max) = self.data.first().map(|d| d.logit) else {
            return;
        };
        let mut sum = 0.0;
        for d in &mut self.data {
            d.p = (d.logit - max).exp();
            sum += d.p;
        }
        for d in &mut self.data {
            d.p /= sum;
        }
    }

    fn truncate(&mut self, len: usize) {
        self.data.truncate(len.max(1));
    }

    fn argmax(&self) -> Option<usize> {
        self.data
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.logit.total_cmp(&b.1.logit))
            .map(|(i, _)| i)
    }

    fn sample_dist(&self, rng: &mut StdRng) -> Option<usize> {
        if self.data.is_empty() {
            return None;
        }
        let r: f32 = rng.gen();
        let mut acc = 0.0;
        for (i, d) in self.data.iter().enumerate() {
            acc += d.p;
            if r < acc {
                return Some(i);
            }
        }
        Some(self.data.len() - 1)
    }

    pub fn selected_token(&self) -> Option<TokenId> {
        self.selected.and_then(|i| self.data.get(i)).map(|d| d.id)
    }
}

/// Repeat/frequency/presence penalties over a window of recent tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Penalties {
    pub repeat: f32,
    pub frequency: f32,
    pub presence: f32,
}

impl Penalties {
    fn adjust(&self, logit: f32, count: usize) -> f32 {
        let mut logit = if logit > 0.0 {
            logit / self.repeat
        } else {
            logit * self.repeat
        };
        logit -= count as f32 * self.frequency + self.presence;
        logit
    }

    fn counts(history: &VecDeque<TokenId>) -> HashMap<TokenId, usize> {
        let mut counts = HashMap::new();
        for &t in history {
            *counts.entry(t).or_insert(0) += 1;
        }
        counts
    }

    fn apply(&self, cands: &mut Candidates, history: &VecDeque<TokenId>) {
        if history.is_empty() {
            return;
        }
        let counts = Self::counts(history);
        for d in &mut cands.data {
            if let Some(&count) = counts.get(&d.id) {
                d.logit = self.adjust(d.logit, count);
            }
        }
        cands.sorted = false;
    }

    fn apply_logits(&self, logits: &mut [f32], history: &VecDeque<TokenId>) {
        for (token, count) in Self::counts(history) {
            if let Some(l) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) {
                *l = self.adjust(*l, count);
            }
        }
    }
}

/// A single stage of the chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Penalties(Penalties),
    Greedy,
    TopK(usize),
    Typical(f32),
    TopP(f32),
    MinP(f32),
    Temperature(f32),
    Dist,
    MirostatV1 {
        tau: f32,
        eta: f32,
        m: usize,
        n_vocab: usize,
        mu: f32,
    },
    MirostatV2 {
        tau: f32,
        eta: f32,
        mu: f32,
    },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Penalties(_) => "penalties",
            Stage::Greedy => "greedy",
            Stage::TopK(_) => "top_k",
            Stage::Typical(_) => "typical",
            Stage::TopP(_) => "top_p",
            Stage::MinP(_) => "min_p",
            Stage::Temperature(_) => "temp",
            Stage::Dist => "dist",
            Stage::MirostatV1 { .. } => "mirostat_v1",
            Stage::MirostatV2 { .. } => "mirostat_v2",
        }
    }

    fn apply(&mut self, cands: &mut Candidates, history: &VecDeque<TokenId>, rng: &mut StdRng) {
        match self {
            Stage::Penalties(p) => p.apply(cands, history),
            Stage::Greedy => cands.selected = cands.argmax(),
            Stage::TopK(k) => top_k(cands, *k),
            Stage::Typical(p) => typical(cands, *p),
            Stage::TopP(p) => top_p(cands, *p),
            Stage::MinP(p) => min_p(cands, *p),
            Stage::Temperature(t) => {
                for d in &mut cands.data {
                    d.logit /= *t;
                }
            }
            Stage::Dist => {
                cands.softmax();
                cands.selected = cands.sample_dist(rng);
            }
            Stage::MirostatV1 {
                tau,
                eta,
                m,
                n_vocab,
                mu,
            } => {
                cands.softmax();
                let k = mirostat_v1_k(cands, *m, *n_vocab, *mu);
                top_k(cands, k);
                cands.softmax();
                cands.selected = cands.sample_dist(rng);
                if let Some(d) = cands.selected.and_then(|i| cands.data.get(i)) {
                    let surprise = -d.p.log2();
                    *mu -= *eta * (surprise - *tau);
                }
            }
            Stage::MirostatV2 { tau, eta, mu } => {
                cands.softmax();
                let keep = cands
                    .data
                    .iter()
                    .position(|d| -d.p.log2() > *mu)
                    .unwrap_or(cands.data.len());
                cands.truncate(keep);
                cands.softmax();
                cands.selected = cands.sample_dist(rng);
                if let Some(d) = cands.selected.and_then(|i| cands.data.get(i)) {
                    let surprise = -d.p.log2();
                    *mu -= *eta * (surprise - *tau);
                }
            }
        }
    }

    fn reset(&mut self) {
        match self {
            Stage::MirostatV1 { tau, mu, .. } | Stage::MirostatV2 { tau, mu, .. } => {
                *mu = 2.0 * *tau;
            }
            _ => {}
        }
    }
}

fn top_k(cands: &mut Candidates, k: usize) {
    if k == 0 || k >= cands.data.len() {
        return;
    }
    if !cands.sorted {
        cands
            .data
            .select_nth_unstable_by(k - 1, |a, b| b.logit.total_cmp(&a.logit));
        cands.data.truncate(k);
        cands.sort();
    } else {
        cands.truncate(k);
    }
}

fn typical(cands: &mut Candidates, p: f32) {
    if p >= 1.0 {
        return;
    }
    cands.softmax();
    let entropy: f32 = cands
        .data
        .iter()
        .filter(|d| d.p > 0.0)
        .map(|d| -d.p * d.p.ln())
        .sum();

    let mut order: Vec<(f32, TokenData)> = cands
        .data
        .iter()
        .map(|d| ((-d.p.ln() - entropy).abs(), *d))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut cum = 0.0;
    let mut keep = order.len();
    for (i, (_, d)) in order.iter().enumerate() {
        cum += d.p;
        if cum > p {
            keep = i + 1;
            break;
        }
    }
    cands.data = order.into_iter().take(keep.max(1)).map(|(_, d)| d).collect();
    cands.sorted = false;
}

fn top_p(cands: &mut Candidates, p: f32) {
    if p >= 1.0 {
        return;
    }
    cands.softmax();
    let mut cum = 0.0;
    let mut keep = cands.data.len();
    for (i, d) in cands.data.iter().enumerate() {
        cum += d.p;
        if cum >= p {
            keep = i + 1;
            break;
        }
    }
    cands.truncate(keep);
}

fn min_p(cands: &mut Candidates, p: f32) {
    if p <= 0.0 || cands.data.is_empty() {
        return;
    }
    let max = cands
        .data
        .iter()
        .map(|d| d.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let threshold = max + p.ln();
    cands.data.retain(|d| d.logit >= threshold);
}

/// Estimate the top-k size that mirostat v1 keeps for the current target surprise.
fn mirostat_v1_k(cands: &Candidates, m: usize, n_vocab: usize, mu: f32) -> usize {
    let mut sum_ti_bi = 0.0f32;
    let mut sum_ti_sq = 0.0f32;
    for i in 0..m.saturating_sub(1).min(cands.data.len().saturating_sub(1)) {
        let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
        let b_i = (cands.data[i].p / cands.data[i + 1].p).ln();
        sum_ti_bi += t_i * b_i;
        sum_ti_sq += t_i * t_i;
    }
    let s_hat = sum_ti_bi / sum_ti_sq;
    let epsilon_hat = s_hat - 1.0;
    let k = ((epsilon_hat * 2f32.powf(mu)) / (1.0 - (n_vocab as f32).powf(-epsilon_hat)))
        .powf(1.0 / s_hat);
    if k.is_finite() {
        (k as usize).max(1)
    } else {
        1
    }
}

/// The configured sampler chain plus its penalty history and RNG.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: Vec<Stage>,
    history: VecDeque<TokenId>,
    history_cap: usize,
    fused: bool,
    seed: u64,
    rng: StdRng,
}

impl SamplerChain {
    /// Build the chain for a loaded model.
    pub fn from_config(
        sampling: &SamplingConfig,
        penalties: &PenaltyConfig,
        seed: i64,
        n_vocab: usize,
        n_ctx: usize,
    ) -> Self {
        let mut stages = Vec::new();

        let history_cap = match penalties.last_n {
            n if n < 0 => n_ctx,
            n => n as usize,
        };
        if penalties.is_active() {
            stages.push(Stage::Penalties(Penalties {
                repeat: penalties.repeat,
                frequency: penalties.frequency,
                presence: penalties.presence,
            }));
        }

        let mut fused = false;
        if sampling.temperature <= 0.0 {
            stages.push(Stage::Greedy);
        } else {
            match sampling.mirostat {
                1 => {
                    stages.push(Stage::Temperature(sampling.temperature));
                    stages.push(Stage::MirostatV1 {
                        tau: sampling.mirostat_tau,
                        eta: sampling.mirostat_eta,
                        m: sampling.mirostat_m.max(1) as usize,
                        n_vocab,
                        mu: 2.0 * sampling.mirostat_tau,
                    });
                }
                2 => {
                    stages.push(Stage::Temperature(sampling.temperature));
                    stages.push(Stage::MirostatV2 {
                        tau: sampling.mirostat_tau,
                        eta: sampling.mirostat_eta,
                        mu: 2.0 * sampling.mirostat_tau,
                    });
                }
                _ => {
                    if sampling.top_k > 0 {
                        stages.push(Stage::TopK(sampling.top_k as usize));
                    }
                    if sampling.typical_p != DISABLED {
                        stages.push(Stage::Typical(sampling.typical_p));
                    }
                    if sampling.top_p != DISABLED {
                        stages.push(Stage::TopP(sampling.top_p));
                    }
                    if sampling.min_p != DISABLED {
                        stages.push(Stage::MinP(sampling.min_p));
                    }
                    stages.push(Stage::Temperature(sampling.temperature));
                    stages.push(Stage::Dist);
                    fused = sampling.use_common_sampler;
                }
            }
        }

        // Negative seeds draw a fresh one so every backend sees the same value.
        let seed = u64::try_from(seed).unwrap_or_else(|_| rand::random());

        Self {
            stages,
            history: VecDeque::with_capacity(history_cap),
            history_cap,
            fused,
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Resolved RNG seed.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Tokens remembered for penalties.
    pub fn penalty_window(&self) -> usize {
        self.history_cap
    }

    /// Stage names joined the way llama.cpp prints a sampler chain.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self.stages.iter().map(Stage::name).collect();
        names.join(" -> ")
    }

    pub fn is_fused(&self) -> bool {
        self.fused
    }

    /// Pick the next token from `logits`. `None` only for empty logits.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        if logits.is_empty() {
            return None;
        }

        let mut cands = if self.fused {
            self.fused_candidates(logits)
        } else {
            Candidates::from_logits(logits)
        };

        for stage in &mut self.stages {
            if self.fused && matches!(stage, Stage::Penalties(_) | Stage::TopK(_)) {
                continue;
            }
            stage.apply(&mut cands, &self.history, &mut self.rng);
            if cands.selected.is_some() {
                break;
            }
        }

        if cands.selected.is_none() {
            cands.selected = cands.argmax();
        }
        cands.selected_token()
    }

    /// Penalties and top-k in one pass over the raw logits.
    fn fused_candidates(&self, logits: &[f32]) -> Candidates {
        let mut work = logits.to_vec();
        for stage in &self.stages {
            if let Stage::Penalties(p) = stage {
                p.apply_logits(&mut work, &self.history);
            }
        }
        let k = self
            .stages
            .iter()
            .find_map(|s| match s {
                Stage::TopK(k) => Some(*k),
                _ => None,
            })
            .unwrap_or(work.len());

        let mut cands = Candidates::from_logits(&work);
        top_k(&mut cands, k);
        cands.sort();
        cands
    }

    /// Record a token in the penalty window.
    pub fn accept(&mut self, token: TokenId) {
        if self.history_cap == 0 {
            return;
        }
        if self.history.len() == self.history_cap {
            self.history.pop_front();
        }
        self.history.push_back(token);
    }

    /// Forget penalty history and mirostat state.
    pub fn reset(&mut self) {
        self.history.clear();
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neutral_penalties() -> PenaltyConfig {
        PenaltyConfig {
            last_n: 0,
            repeat: 1.0,
            frequency: 0.0,
            presence: 0.0,
        }
    }

    #[test]
    fn test_greedy_when_temperature_zero() {
        let sampling = SamplingConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let mut chain = SamplerChain::from_config(&sampling, &neutral_penalties(), 1, 4, 16);
        assert_eq!(chain.stages(), &[Stage::Greedy]);
        assert_eq!(chain.sample(&[0.1, 2.0, 0.5, -1.0]), Some(1));
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let sampling = SamplingConfig {
            top_k: -1,
            top_p: DISABLED,
            typical_p: DISABLED,
            min_p: DISABLED,
            ..Default::default()
        };
        let chain = SamplerChain::from_config(&sampling, &neutral_penalties(), 1, 4, 16);
        assert_eq!(chain.describe(), "temp -> dist");
    }

    #[test]
    fn test_penalties_only_when_active() {
        let chain = SamplerChain::from_config(
            &SamplingConfig::default(),
            &PenaltyConfig::default(),
            1,
            4,
            16,
        );
        assert_eq!(chain.stages()[0].name(), "penalties");
        assert_eq!(
            chain.describe(),
            "penalties -> top_k -> typical -> top_p -> min_p -> temp -> dist"
        );
    }

    #[test]
    fn test_mirostat_families_are_exclusive() {
        for (mode, last) in [(1, "mirostat_v1"), (2, "mirostat_v2")] {
            let sampling = SamplingConfig {
                mirostat: mode,
                ..Default::default()
            };
            let chain = SamplerChain::from_config(&sampling, &neutral_penalties(), 1, 4, 16);
            assert_eq!(chain.describe(), format!("temp -> {last}"));
        }
    }

    #[test]
    fn test_repeat_penalty_flips_choice() {
        let sampling = SamplingConfig {
            temperature: 0.0,
            ..Default::default()
        };
        let penalties = PenaltyConfig {
            last_n: 8,
            repeat: 2.0,
            frequency: 0.0,
            presence: 0.0,
        };
        let mut chain = SamplerChain::from_config(&sampling, &penalties, 1, 3, 16);
        let logits = [1.0, 1.5, 0.0];
        assert_eq!(chain.sample(&logits), Some(1));
        chain.accept(1);
        assert_eq!(chain.sample(&logits), Some(0));
        chain.reset();
        assert_eq!(chain.sample(&logits), Some(1));
    }

    #[test]
    fn test_fused_path_matches_peak() {
        let sampling = SamplingConfig {
            use_common_sampler: true,
            ..Default::default()
        };
        let mut chain =
            SamplerChain::from_config(&sampling, &PenaltyConfig::default(), 7, 1000, 64);
        assert!(chain.is_fused());
        let mut logits = vec![0.0; 1000];
        logits[421] = 30.0;
        for _ in 0..10 {
            assert_eq!(chain.sample(&logits), Some(421));
        }
    }

    #[test]
    fn test_seeded_chain_is_reproducible() {
        let sampling = SamplingConfig {
            temperature: 1.5,
            top_k: -1,
            top_p: DISABLED,
            min_p: DISABLED,
            ..Default::default()
        };
        let logits: Vec<f32> = (0..50).map(|i| (i % 7) as f32 * 0.3).collect();
        let mut a = SamplerChain::from_config(&sampling, &neutral_penalties(), 42, 50, 64);
        let mut b = SamplerChain::from_config(&sampling, &neutral_penalties(), 42, 50, 64);
        let run_a: Vec<_> = (0..20).map(|_| a.sample(&logits)).collect();
        let run_b: Vec<_> = (0..20).map(|_| b.sample(&logits)).collect();
        assert_eq!(run_a, run_b);
    }

    #[test]
    fn test_top_p_keeps_nucleus() {
        let mut cands = Candidates::from_logits(&[3.0, 2.9, -5.0, -6.0]);
        top_p(&mut cands, 0.9);
        let ids: Vec<_> = cands.data.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_min_p_relative_threshold() {
        let mut cands = Candidates::from_logits(&[0.0, -1.0, -10.0]);
        min_p(&mut cands, 0.1);
        assert_eq!(cands.data.len(), 2);
    }

    #[test]
    fn test_mirostat_v2_converges_on_peak() {
        let sampling = SamplingConfig {
            mirostat: 2,
            ..Default::default()
        };
        let mut chain = SamplerChain::from_config(&sampling, &neutral_penalties(), 3, 5, 16);
        let logits = [0.0, 0.0, 40.0, 0.0, 0.0];
        assert_eq!(chain.sample(&logits), Some(2));
    }

    #[test]
    fn test_mirostat_v1_tracks_target_surprise() {
        let sampling = SamplingConfig {
            mirostat: 1,
            mirostat_m: 4,
            ..Default::default()
        };
        let mut chain = SamplerChain::from_config(&sampling, &neutral_penalties(), 11, 8, 16);
        let logits = [0.0, 1.0, 0.5, 35.0, 0.0, 0.2, 0.0, 0.1];
        for _ in 0..20 {
            assert_eq!(chain.sample(&logits), Some(3));
        }

        // Picking a near-certain token is less surprising than tau, so mu grows.
        let Stage::MirostatV1 { tau, mu, .. } = chain.stages()[1] else {
            panic!("expected mirostat v1 as the last stage");
        };
        assert!(mu > 2.0 * tau);

        chain.reset();
        let Stage::MirostatV1 { tau, mu, .. } = chain.stages()[1] else {
            panic!("expected mirostat v1 as the last stage");
        };
        assert_eq!(mu, 2.0 * tau);
    }

    #[test]
    fn test_mirostat_v1_k_shrinks_with_target() {
        let mut cands = Candidates::from_logits(&[4.0, 3.0, 2.0, 1.0, 0.0, -1.0]);
        cands.softmax();
        let loose = mirostat_v1_k(&cands, 5, 6, 10.0);
        let tight = mirostat_v1_k(&cands, 5, 6, 0.5);
        assert!(tight <= loose);
        assert!(tight >= 1);
    }

    #[test]
    fn test_seed_and_window_are_exposed() {
        let chain = SamplerChain::from_config(
            &SamplingConfig::default(),
            &PenaltyConfig::default(),
            1234,
            4,
            16,
        );
        assert_eq!(chain.seed(), 1234);
        assert_eq!(chain.penalty_window(), 64);

        let whole_context = PenaltyConfig {
            last_n: -1,
            ..PenaltyConfig::default()
        };
        let chain = SamplerChain::from_config(&SamplingConfig::default(), &whole_context, -1, 4, 16);
        assert_eq!(chain.penalty_window(), 16);
    }
}
