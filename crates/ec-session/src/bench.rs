//! Prompt-processing and text-generation throughput.

use std::fmt;
use std::time::{Duration, Instant};

use ec_backend::{Batch, Context, Model, Pos, SeqId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

/// Token value used for every synthetic batch entry.
const FILLER_TOKEN: i32 = 0;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchParams {
    /// Prompt tokens decoded in one batch.
    pub pp: usize,
    /// Generation steps.
    pub tg: usize,
    /// Parallel sequences per generation step.
    pub pl: usize,
    /// Repetitions.
    pub nr: usize,
    /// Backend column of the report. Defaults to the host OS in parentheses.
    pub backend_label: Option<String>,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            nr: 3,
            backend_label: None,
        }
    }
}

impl BenchParams {
    /// A tiny run for checking that the backend is responsive.
    pub fn warmup() -> Self {
        Self {
            pp: 8,
            tg: 4,
            pl: 1,
            nr: 1,
            backend_label: None,
        }
    }

    fn validate(&self, batch: &Batch) -> Result<()> {
        if batch.tokens().is_none() {
            return Err(SessionError::InvalidArgument(
                "benchmark needs a token batch".to_string(),
            ));
        }
        if self.pp == 0 || self.pl == 0 || self.nr == 0 {
            return Err(SessionError::InvalidArgument(format!(
                "pp, pl and nr must be positive (pp={}, pl={}, nr={})",
                self.pp, self.pl, self.nr
            )));
        }
        if self.pp > batch.capacity() || self.pl > batch.capacity() {
            return Err(SessionError::CapacityExceeded {
                capacity: batch.capacity(),
            });
        }
        Ok(())
    }
}

/// Mean and sample standard deviation of a throughput series, in tokens/s.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PhaseStats {
    pub mean: f64,
    pub stddev: f64,
}

/// Sum and sum of squares, enough for mean and sample stddev.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunningStats {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.n += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Stddev is 0 for fewer than two samples.
    pub fn finish(&self) -> PhaseStats {
        if self.n == 0 {
            return PhaseStats::default();
        }
        let n = self.n as f64;
        let mean = self.sum / n;
        let stddev = if self.n > 1 {
            let var = self.sum_sq / (n - 1.0) - mean * mean * n / (n - 1.0);
            // Rounding can push a zero variance slightly negative.
            var.max(0.0).sqrt()
        } else {
            0.0
        };
        PhaseStats { mean, stddev }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub model: String,
    pub size_gib: f64,
    pub params_b: f64,
    pub backend: String,
    pub pp: usize,
    pub tg: usize,
    pub pl: usize,
    pub nr: usize,
    pub pp_stats: PhaseStats,
    pub tg_stats: PhaseStats,
    /// Decode calls that returned a nonzero status. Their rounds are still
    /// included in the statistics.
    pub decode_failures: usize,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "| model | size | params | backend | test | t/s |")?;
        writeln!(f, "| --- | --- | --- | --- | --- | --- |")?;
        for (test, n, stats) in [("pp", self.pp, self.pp_stats), ("tg", self.tg, self.tg_stats)] {
            writeln!(
                f,
                "| {} | {:.2}GiB | {:.2}B | {} | {} {} | {:.2} ± {:.2} |",
                self.model,
                self.size_gib,
                self.params_b,
                self.backend,
                test,
                n,
                stats.mean,
                stats.stddev
            )?;
        }
        Ok(())
    }
}

/// Tokens per second, with the elapsed time counted in whole microseconds
/// and never less than one.
fn throughput(tokens: usize, elapsed: Duration) -> f64 {
    if tokens == 0 {
        return 0.0;
    }
    let micros = elapsed.as_micros().max(1) as f64;
    tokens as f64 / (micros / 1_000_000.0)
}

/// Run `params.nr` rounds of prompt processing and text generation.
///
/// Each round:
/// 1. decodes `pp` filler tokens on sequence 0 in one batch, logits on the last;
/// 2. decodes `tg` batches of `pl` tokens that share a position, one per
///    sequence id, all with logits;
/// 3. clears the KV cache.
///
/// A failed decode is logged and counted; the round is still timed.
pub fn run_benchmark<C: Context>(
    ctx: &mut C,
    batch: &mut Batch,
    params: &BenchParams,
) -> Result<BenchReport> {
    params.validate(batch)?;

    info!(
        n_ctx = ctx.n_ctx(),
        pp = params.pp,
        tg = params.tg,
        pl = params.pl,
        nr = params.nr,
        "benchmark"
    );

    let mut pp_stats = RunningStats::default();
    let mut tg_stats = RunningStats::default();
    let mut failures = 0usize;

    for round in 0..params.nr {
        info!(round, "benchmark prompt processing (pp)");
        batch.clear();
        for i in 0..params.pp {
            batch.add(FILLER_TOKEN, i as Pos, &[0], i + 1 == params.pp)?;
        }
        ctx.kv_cache_clear();

        let start = Instant::now();
        if ctx.decode(batch) != 0 {
            warn!(round, "decode failed during prompt processing");
            failures += 1;
        }
        let t_pp = start.elapsed();

        info!(round, "benchmark text generation (tg)");
        ctx.kv_cache_clear();
        let start = Instant::now();
        for i in 0..params.tg {
            batch.clear();
            for j in 0..params.pl {
                batch.add(FILLER_TOKEN, i as Pos, &[j as SeqId], true)?;
            }
            debug!(round, step = i, "decode text generation");
            if ctx.decode(batch) != 0 {
                warn!(round, step = i, "decode failed during text generation");
                failures += 1;
            }
        }
        let t_tg = start.elapsed();

        ctx.kv_cache_clear();

        let speed_pp = throughput(params.pp, t_pp);
        let speed_tg = throughput(params.pl * params.tg, t_tg);
        info!(round, speed_pp, speed_tg, "pp t/s, tg t/s");

        pp_stats.push(speed_pp);
        tg_stats.push(speed_tg);
    }

    let model = ctx.model();
    Ok(BenchReport {
        model: model.description(),
        size_gib: model.size() as f64 / BYTES_PER_GIB,
        params_b: model.n_params() as f64 / 1e9,
        backend: params
            .backend_label
            .clone()
            .unwrap_or_else(|| format!("({})", std::env::consts::OS)),
        pp: params.pp,
        tg: params.tg,
        pl: params.pl,
        nr: params.nr,
        pp_stats: pp_stats.finish(),
        tg_stats: tg_stats.finish(),
        decode_failures: failures,
    })
}
