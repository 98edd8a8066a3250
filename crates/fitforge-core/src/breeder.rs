//! The genetic operator: merge and rank the latest summaries, cull, select
//! parents under score-derived weights, cross over, mutate, and emit the
//! next generation's parameter vectors.
//!
//! Two historic quirks are load-bearing and preserved: a uniform draw below
//! `swap_rate` keeps genes in place (the intuitive reading is inverted), and
//! the worst survivor ends up with selection weight 0, so it is never drawn.

use crate::config::{FitConfig, MutateSpec};
use crate::error::{FfResult, FitError};
use crate::population::{ParamSchema, ParamVector};
use crate::summary::Summary;
use tracing::{debug, info};

#[derive(Debug)]
pub enum BreedOutcome {
    Next {
        vectors: Vec<ParamVector>,
        /// Top-P of the merged summaries; the parents behind `vectors`.
        parent_summary: Summary,
    },
    Stalled,
    ThresholdMet,
}

pub struct Breeder<'a> {
    cfg: &'a FitConfig,
    schema: &'a ParamSchema,
    rng: fastrand::Rng,
}

impl<'a> Breeder<'a> {
    pub fn new(cfg: &'a FitConfig, schema: &'a ParamSchema, rng: fastrand::Rng) -> Self {
        Self { cfg, schema, rng }
    }

    pub fn breed(
        &mut self,
        current: &Summary,
        previous_parents: Option<&Summary>,
    ) -> FfResult<BreedOutcome> {
        let p = self.cfg.permutations;

        // 1. Merge and rank.
        let mut merged = match previous_parents {
            Some(prev) => current.merged(prev),
            None => current.clone(),
        };
        merged.sort();
        merged.rows.truncate(p);

        // 2. Stall check.
        if self.cfg.stop_when_stalled {
            if let Some(prev) = previous_parents {
                let unchanged = merged.rows.len() == prev.rows.len()
                    && merged
                        .rows
                        .iter()
                        .zip(&prev.rows)
                        .all(|(a, b)| a.values == b.values);
                if unchanged {
                    info!("parent pool unchanged since last generation; fit has stalled");
                    return Ok(BreedOutcome::Stalled);
                }
            }
        }

        // 3. Threshold check.
        if let Some(best) = merged.best() {
            if best.score <= self.cfg.min_objfunc_value {
                info!(
                    "best score {} at or below target {}",
                    best.score, self.cfg.min_objfunc_value
                );
                return Ok(BreedOutcome::ThresholdMet);
            }
        }

        // 4. Parent-preservation snapshot.
        let kept: Vec<ParamVector> = merged
            .rows
            .iter()
            .take(self.cfg.keep_parents)
            .map(|r| r.values.clone())
            .collect();

        // 5. Survivor pool.
        let mut survivors: Vec<(f64, &ParamVector)> = merged
            .rows
            .iter()
            .filter(|r| self.cfg.max_objfunc_value <= 0.0 || r.score <= self.cfg.max_objfunc_value)
            .map(|r| (r.score, &r.values))
            .collect();
        if self.cfg.max_parents > 0 {
            survivors.truncate(self.cfg.max_parents);
        }
        if survivors.len() < 3 {
            return Err(FitError::InsufficientSurvivors(survivors.len()));
        }

        // 6. Weights: distance from the worst survivor's score.
        let max_score = survivors.last().map(|(s, _)| *s).unwrap_or(0.0);
        let weights: Vec<f64> = survivors.iter().map(|(s, _)| max_score - s).collect();
        let weight_sum: f64 = weights.iter().sum();
        debug!(
            "breeding from {} survivors, weight mass {}",
            survivors.len(),
            weight_sum
        );

        // 7-10. Weighted selection, crossover, mutation, pair emission.
        let mut children: Vec<ParamVector> = Vec::with_capacity(p + 1);
        let pairs = p.div_ceil(2);
        for _ in 0..pairs {
            let i1 = self.pick_parent(&weights, weight_sum);
            let mut i2 = self.pick_parent(&weights, weight_sum);
            if self.cfg.force_different_parents && i1 == i2 {
                let mut tries = 0;
                while i1 == i2 && tries < 100 {
                    i2 = self.pick_parent(&weights, weight_sum);
                    tries += 1;
                }
                if i1 == i2 {
                    let (a, b) = (0, 1);
                    children.extend(self.cross(survivors[a].1, survivors[b].1));
                    continue;
                }
            }
            children.extend(self.cross(survivors[i1].1, survivors[i2].1));
        }
        children.truncate(p);

        // 11. Re-insert preserved parents at the head.
        if !kept.is_empty() {
            children.truncate(p - kept.len());
            let mut next = kept;
            next.append(&mut children);
            children = next;
        }
        debug_assert_eq!(children.len(), p);

        Ok(BreedOutcome::Next {
            vectors: children,
            parent_summary: merged,
        })
    }

    /// Prefix-sum draw over [0, sum * (1 - extra_weight/10)); overflow lands
    /// on the last survivor.
    fn pick_parent(&mut self, weights: &[f64], weight_sum: f64) -> usize {
        let u = self.rng.f64() * weight_sum * (1.0 - self.cfg.extra_weight / 10.0);
        let mut acc = 0.0;
        for (i, w) in weights.iter().enumerate() {
            acc += w;
            if acc >= u {
                return i;
            }
        }
        weights.len() - 1
    }

    fn cross(&mut self, p1: &ParamVector, p2: &ParamVector) -> [ParamVector; 2] {
        let mut c1 = Vec::with_capacity(p1.len());
        let mut c2 = Vec::with_capacity(p2.len());
        for i in 0..p1.len() {
            // Below swap_rate keeps genes in place; at or above swaps.
            if self.rng.f64() < self.cfg.swap_rate {
                c1.push(p1[i]);
                c2.push(p2[i]);
            } else {
                c1.push(p2[i]);
                c2.push(p1[i]);
            }
        }
        self.mutate(&mut c1);
        self.mutate(&mut c2);
        [c1, c2]
    }

    fn mutate(&mut self, child: &mut ParamVector) {
        for (i, v) in child.iter_mut().enumerate() {
            let spec = self
                .cfg
                .mutate
                .get(&self.schema.names[i])
                .or_else(|| self.cfg.mutate.get("default"));
            let Some(&MutateSpec { prob, pct }) = spec else {
                continue;
            };
            if self.rng.f64() < prob {
                let offset = (self.rng.f64() * 2.0 - 1.0) * *v * pct;
                *v += offset;
            }
        }
    }
}
