//! Adaptive search for a convergence threshold.
//!
//! Bright sources can stop the solver from converging within its iteration
//! budget. When no threshold has been fixed, the solver is asked to abort as
//! soon as non-convergence is apparent and the threshold is relaxed by a
//! quarter (at least 2, never beyond -5) until a map converges, the limit is
//! reached or 20 attempts have been made. The value that worked is then used
//! for every later observation of the run.
//!
//! ```text
//! Init -> Attempting --aborted_at == 0-----------------> Converged
//!             ^    |---aborted_at != 0, attempt < 20---> Retry(next)
//!             |____|   (next must move, else GivenUp)
//!                  |---attempt >= 20-------------------> GivenUp
//! ```

use crate::core::config::{ConfigComposer, ConfigOverlay, SolverTarget, THRESHOLD_KEY};
use crate::engines::{MapSolver, SolveRequest};
use crate::io::metadata::remove_artifact;
use crate::io::workspace::CancelHandle;
use crate::types::{
    ConvergenceOutcome, ConvergenceState, MaskMode, ObservationError, ObservationResult,
    PipelineError, PipelineResult,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvergenceParams {
    pub max_attempts: u32,
    /// Threshold never relaxed past this value
    pub limit: f64,
    pub min_reduction: f64,
    pub reduction_fraction: f64,
}

impl Default for ConvergenceParams {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            limit: -5.0,
            min_reduction: 2.0,
            reduction_fraction: 0.25,
        }
    }
}

/// Next threshold after a failed attempt. The reduction is truncated to an
/// integer, so -150 becomes -113.
pub fn backoff(current: f64, params: &ConvergenceParams) -> f64 {
    let reduction = (-current * params.reduction_fraction).trunc().max(params.min_reduction);
    (current + reduction).min(params.limit)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Converged,
    Retry { next: f64 },
    GiveUp,
}

/// Transition table of the search
pub fn next_transition(
    state: &ConvergenceState,
    aborted_at: u32,
    params: &ConvergenceParams,
) -> Transition {
    if aborted_at == 0 {
        return Transition::Converged;
    }
    if state.attempt >= params.max_attempts {
        return Transition::GiveUp;
    }
    let next = backoff(state.current_threshold, params);
    if next <= state.current_threshold {
        Transition::GiveUp
    } else {
        Transition::Retry { next }
    }
}

/// Result of solving one map
#[derive(Debug, Clone, PartialEq)]
pub struct SolveOutcome {
    /// Threshold the map was made with, if one was imposed
    pub threshold: Option<f64>,
    pub attempts: u32,
    pub outcome: ConvergenceOutcome,
    /// Set when the search gave up; the map is still usable
    pub warning: Option<ObservationError>,
}

/// Thresholds the run starts from, in order of precedence: the user's
/// component overlay, the user's base overlay, a threshold inherited from
/// the map cache. `None` means "search for one".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ThresholdSeeds {
    pub base: Option<f64>,
    pub intensity: Option<f64>,
    pub polarised: Option<f64>,
}

impl ThresholdSeeds {
    pub fn for_target(&self, target: SolverTarget) -> Option<f64> {
        match target {
            SolverTarget::Intensity => self.intensity,
            SolverTarget::Polarised => self.polarised,
        }
    }
}

/// Work out the starting thresholds.
///
/// `same_mode` is the threshold of the oldest cached map made with the
/// run's mask mode and `auto_mode` the same for auto-masked maps. An
/// auto-masked threshold is only borrowed by other modes when it differs
/// from the auto default.
pub fn seed_thresholds(
    composer: &ConfigComposer,
    same_mode: Option<(f64, String)>,
    auto_mode: Option<(f64, String)>,
) -> ThresholdSeeds {
    let mode = composer.mode();
    let mut base = composer.user_base().get_f64(THRESHOLD_KEY).filter(|t| *t != 0.0);

    if base.is_none() {
        if let Some((threshold, from)) = same_mode.filter(|(t, _)| *t != 0.0) {
            log::info!(
                "Will use {} = {} inherited from existing map {}",
                THRESHOLD_KEY,
                threshold,
                from
            );
            base = Some(threshold);
        } else if mode != MaskMode::Auto {
            if let Some((threshold, from)) = auto_mode
                .filter(|(t, _)| *t != 0.0 && *t != MaskMode::Auto.default_threshold())
            {
                log::info!(
                    "Will use {} = {} inherited from auto-masked map {}",
                    THRESHOLD_KEY,
                    threshold,
                    from
                );
                base = Some(threshold);
            }
        }
    }

    if base.is_none() && composer.pca_disabled() {
        base = Some(mode.default_threshold());
    }

    let component = |target| {
        composer
            .user_overlay(target)
            .get_f64(THRESHOLD_KEY)
            .filter(|t| *t != 0.0)
            .or(base)
    };

    ThresholdSeeds {
        base,
        intensity: component(SolverTarget::Intensity),
        polarised: component(SolverTarget::Polarised),
    }
}

/// Drives the solver for one solver target (I, or Q and U)
pub struct ConvergenceController {
    mode: MaskMode,
    known_threshold: Option<f64>,
    params: ConvergenceParams,
}

impl ConvergenceController {
    pub fn new(mode: MaskMode, seed: Option<f64>) -> Self {
        Self::with_params(mode, seed, ConvergenceParams::default())
    }

    pub fn with_params(mode: MaskMode, seed: Option<f64>, params: ConvergenceParams) -> Self {
        Self {
            mode,
            known_threshold: seed,
            params,
        }
    }

    /// Threshold every later map will be made with, once determined
    pub fn known_threshold(&self) -> Option<f64> {
        self.known_threshold
    }

    /// Make one map.
    ///
    /// The outer error is fatal (cancellation). The inner error means this
    /// observation has no map: the partial output has been removed and the
    /// caller should carry on without it.
    pub fn solve(
        &mut self,
        solver: &dyn MapSolver,
        request: SolveRequest<'_>,
        numiter: f64,
        cancel: &CancelHandle,
    ) -> PipelineResult<ObservationResult<SolveOutcome>> {
        let adaptive = self.known_threshold.is_none() && numiter < 0.0;
        let imposed = self
            .known_threshold
            .or_else(|| adaptive.then(|| self.mode.default_threshold()));
        let mut state = ConvergenceState::new(imposed.unwrap_or(f64::NAN));

        loop {
            if cancel.is_cancelled() {
                return Err(PipelineError::Interrupted);
            }
            state.attempt += 1;

            let config = match imposed {
                Some(_) => request.config.overlaid(
                    &ConfigOverlay::new("convergence").with(THRESHOLD_KEY, state.current_threshold),
                ),
                None => request.config.clone(),
            };
            let attempt = SolveRequest {
                abort_soon: adaptive,
                ..request.with_config(&config)
            };

            let report = match solver.solve(&attempt) {
                Ok(report) => report,
                Err(e) => {
                    if let Err(rm) = remove_artifact(request.output) {
                        log::warn!(
                            "Could not remove partial map {}: {}",
                            request.output.display(),
                            rm
                        );
                    }
                    if adaptive {
                        self.known_threshold = None;
                    }
                    return Ok(Err(ObservationError::EngineInvocation {
                        scope: format!("{} {}", request.key, request.component),
                        engine: "map solver",
                        message: format!("{:#}", e),
                    }));
                }
            };

            if !adaptive {
                state.outcome = if report.aborted_at == 0 {
                    ConvergenceOutcome::Converged
                } else {
                    ConvergenceOutcome::Unknown
                };
                return Ok(Ok(SolveOutcome {
                    threshold: imposed,
                    attempts: state.attempt,
                    outcome: state.outcome,
                    warning: None,
                }));
            }

            match next_transition(&state, report.aborted_at, &self.params) {
                Transition::Converged => {
                    state.outcome = ConvergenceOutcome::Converged;
                    if state.attempt > 1 {
                        log::info!(
                            "✅ Solver converged; all further maps will use {} = {}",
                            THRESHOLD_KEY,
                            state.current_threshold
                        );
                    }
                    self.known_threshold = Some(state.current_threshold);
                    return Ok(Ok(SolveOutcome {
                        threshold: Some(state.current_threshold),
                        attempts: state.attempt,
                        outcome: state.outcome,
                        warning: None,
                    }));
                }
                Transition::Retry { next } => {
                    state.outcome = ConvergenceOutcome::AbortedEarly;
                    log::info!(
                        "🔁 {} {}: aborted at iteration {}; retrying with {} = {} (was {})",
                        request.key,
                        request.component,
                        report.aborted_at,
                        THRESHOLD_KEY,
                        next,
                        state.current_threshold
                    );
                    state.current_threshold = next;
                }
                Transition::GiveUp => {
                    state.outcome = ConvergenceOutcome::GivenUp;
                    let warning = ObservationError::ConvergenceGivenUp {
                        key: request.key,
                        attempts: state.attempt,
                        threshold: state.current_threshold,
                    };
                    log::warn!("⚠️  {}; all further maps will use that threshold", warning);
                    self.known_threshold = Some(state.current_threshold);
                    return Ok(Ok(SolveOutcome {
                        threshold: Some(state.current_threshold),
                        attempts: state.attempt,
                        outcome: state.outcome,
                        warning: Some(warning),
                    }));
                }
            }
        }
    }
}
