//! Deterministic decoding over a model that scores the next token.
//!
//! Greedy search is used for a single beam and beam search otherwise. Nothing here samples,
//! so identical inputs always produce identical token ids.

use std::cmp::Ordering;
use std::time::Instant;

use crate::error::VqaError;
use crate::stopping::StoppingCriteria;

pub const DEFAULT_MAX_NEW_TOKENS: usize = 768;
pub const DEFAULT_NUM_BEAMS: usize = 1;

/// Budget and search width of one generation call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationConfig {
    /// Upper bound of generated tokens per row.
    pub max_new_tokens: usize,
    /// Beam width, `1` means greedy search.
    pub num_beams: usize,
    /// A beam ending with this token is finished and no longer expanded.
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            num_beams: DEFAULT_NUM_BEAMS,
            eos_token_id: None,
        }
    }
}

impl GenerationConfig {
    pub fn new(max_new_tokens: usize, num_beams: usize) -> Self {
        Self {
            max_new_tokens,
            num_beams,
            eos_token_id: None,
        }
    }

    pub fn with_eos_token_id(mut self, eos_token_id: u32) -> Self {
        self.eos_token_id = Some(eos_token_id);
        self
    }

    pub fn validate(&self) -> Result<(), VqaError> {
        if self.max_new_tokens == 0 {
            return Err(VqaError::InvalidConfig(
                "max_new_tokens must be positive".to_string(),
            ));
        }
        if self.num_beams == 0 {
            return Err(VqaError::InvalidConfig(
                "num_beams must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A model that returns next-token log-probabilities.
pub trait TokenScorer {
    type Error;

    /// Scores the next token of every row.
    ///
    /// Each row is the prompt followed by the tokens generated so far for one beam. The
    /// returned vector holds one log-probability vector per row, indexed by token id.
    fn score(&mut self, rows: &[Vec<u32>]) -> Result<Vec<Vec<f32>>, Self::Error>;
}

#[derive(Clone, Debug)]
struct Beam {
    tokens: Vec<u32>,
    score: f32,
}

/// Generates tokens after `prompt` until `stop` fires or the budget is spent.
///
/// Returns the generated tokens of each row, best row first. The prompt is not included.
pub fn generate<S: TokenScorer>(
    scorer: &mut S,
    prompt: &[u32],
    config: &GenerationConfig,
    stop: &dyn StoppingCriteria,
) -> Result<Vec<Vec<u32>>, S::Error> {
    let start = Instant::now();
    let rows = if config.num_beams <= 1 {
        greedy_search(scorer, prompt, config, stop)?
    } else {
        beam_search(scorer, prompt, config, stop)?
    };

    let generated = rows.first().map_or(0, Vec::len);
    log::debug!(
        "{generated} tokens generated in {:.2?} ({} beams)",
        start.elapsed(),
        config.num_beams
    );

    Ok(rows)
}

fn greedy_search<S: TokenScorer>(
    scorer: &mut S,
    prompt: &[u32],
    config: &GenerationConfig,
    stop: &dyn StoppingCriteria,
) -> Result<Vec<Vec<u32>>, S::Error> {
    let mut context = vec![prompt.to_vec()];
    let mut generated = vec![Vec::new()];

    for _ in 0..config.max_new_tokens {
        let log_probs = scorer.score(&context)?;
        let Some(next_token) = log_probs.first().and_then(|row| argmax(row)) else {
            log::warn!("Model returned no scores, ending generation");
            break;
        };

        context[0].push(next_token);
        generated[0].push(next_token);

        if config.eos_token_id == Some(next_token) || stop.should_stop(&generated) {
            break;
        }
    }

    Ok(generated)
}

fn beam_search<S: TokenScorer>(
    scorer: &mut S,
    prompt: &[u32],
    config: &GenerationConfig,
    stop: &dyn StoppingCriteria,
) -> Result<Vec<Vec<u32>>, S::Error> {
    let is_finished = |beam: &Beam| {
        config
            .eos_token_id
            .is_some_and(|eos| beam.tokens.last() == Some(&eos))
    };

    let mut beams = vec![Beam {
        tokens: Vec::new(),
        score: 0.0,
    }];

    for _ in 0..config.max_new_tokens {
        let (finished, active): (Vec<Beam>, Vec<Beam>) =
            beams.into_iter().partition(|beam| is_finished(beam));
        if active.is_empty() {
            beams = finished;
            break;
        }

        let context = active
            .iter()
            .map(|beam| {
                let mut row = prompt.to_vec();
                row.extend_from_slice(&beam.tokens);
                row
            })
            .collect::<Vec<_>>();
        let log_probs = scorer.score(&context)?;

        let mut candidates = finished;
        for (beam, row) in active.iter().zip(log_probs.iter()) {
            for (token, log_prob) in top_k(row, config.num_beams) {
                let mut tokens = beam.tokens.clone();
                tokens.push(token);
                candidates.push(Beam {
                    tokens,
                    score: beam.score + log_prob,
                });
            }
        }

        if candidates.is_empty() {
            log::warn!("Model returned no scores, ending generation");
            beams = active;
            break;
        }

        candidates.sort_by(compare_beams);
        candidates.truncate(config.num_beams);
        beams = candidates;

        let rows = beams.iter().map(|b| b.tokens.clone()).collect::<Vec<_>>();
        if stop.should_stop(&rows) {
            break;
        }
    }

    beams.sort_by(compare_beams);
    Ok(beams.into_iter().map(|beam| beam.tokens).collect())
}

// higher score first, then lexicographically smaller tokens
fn compare_beams(a: &Beam, b: &Beam) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.tokens.cmp(&b.tokens))
}

fn compare_scores(a: &(u32, f32), b: &(u32, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

/// Index of the highest score, ties resolved toward the lower index.
pub fn argmax(scores: &[f32]) -> Option<u32> {
    top_k(scores, 1).first().map(|(token, _)| *token)
}

/// The `k` best `(token, score)` pairs in descending score order.
pub fn top_k(scores: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed = scores
        .iter()
        .enumerate()
        .map(|(i, &s)| (i as u32, s))
        .collect::<Vec<_>>();
    if k == 0 || indexed.is_empty() {
        return Vec::new();
    }
    if k < indexed.len() {
        indexed.select_nth_unstable_by(k - 1, compare_scores);
        indexed.truncate(k);
    }
    indexed.sort_by(compare_scores);
    indexed
}
