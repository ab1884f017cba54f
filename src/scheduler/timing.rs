//! Timing parameters of the pulse loop and the metrics derived from them.
//!
//! | symbol | field |
//! |---|---|
//! | π | `period` |
//! | Δ | `anticipation` |
//! | δ | `delay` |
//! | σ+ | `skew_ahead` |
//! | σ− | `skew_behind` |

use chrono::TimeDelta;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimingError {
    #[error("Timing parameter {0} must not be negative and the period must be positive")]
    NonPositive(&'static str),
    #[error("Clock skew bounds must be below a tenth of the period")]
    SkewTooLarge,
    #[error("Delay must be at least the behind-skew bound")]
    DelayBelowSkew,
    #[error("Delay must be below a quarter period minus the ahead-skew bound")]
    DelayTooLarge,
    #[error("Anticipation must be below the period minus the ahead-skew bound")]
    AnticipationTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    period: TimeDelta,
    anticipation: TimeDelta,
    delay: TimeDelta,
    skew_ahead: TimeDelta,
    skew_behind: TimeDelta,
}

impl Timings {
    pub fn new(
        period: TimeDelta,
        anticipation: TimeDelta,
        delay: TimeDelta,
        skew_ahead: TimeDelta,
        skew_behind: TimeDelta,
    ) -> Result<Self, TimingError> {
        let zero = TimeDelta::zero();
        if period <= zero {
            return Err(TimingError::NonPositive("period"));
        }
        for (name, value) in [
            ("anticipation", anticipation),
            ("delay", delay),
            ("skew_ahead", skew_ahead),
            ("skew_behind", skew_behind),
        ] {
            if value < zero {
                return Err(TimingError::NonPositive(name));
            }
        }

        // compared in multiplied form so integer division cannot round
        if skew_ahead * 10 >= period || skew_behind * 10 >= period {
            return Err(TimingError::SkewTooLarge);
        }
        if delay < skew_behind {
            return Err(TimingError::DelayBelowSkew);
        }
        if (delay + skew_ahead) * 4 >= period {
            return Err(TimingError::DelayTooLarge);
        }
        if anticipation + skew_ahead >= period {
            return Err(TimingError::AnticipationTooLarge);
        }

        Ok(Self { period, anticipation, delay, skew_ahead, skew_behind })
    }

    /// Same as [`Timings::new`] with every parameter in milliseconds.
    pub fn from_millis(
        period: u32,
        anticipation: u32,
        delay: u32,
        skew_ahead: u32,
        skew_behind: u32,
    ) -> Result<Self, TimingError> {
        let ms = |v: u32| TimeDelta::milliseconds(v as i64);
        Self::new(ms(period), ms(anticipation), ms(delay), ms(skew_ahead), ms(skew_behind))
    }

    pub fn period(&self) -> TimeDelta {
        self.period
    }

    pub fn anticipation(&self) -> TimeDelta {
        self.anticipation
    }

    pub fn delay(&self) -> TimeDelta {
        self.delay
    }

    pub fn skew_ahead(&self) -> TimeDelta {
        self.skew_ahead
    }

    pub fn skew_behind(&self) -> TimeDelta {
        self.skew_behind
    }

    /// γ = δ + Δ − σ+
    pub fn max_generation_time(&self) -> TimeDelta {
        self.delay + self.anticipation - self.skew_ahead
    }

    /// η(g) = max(σ+, σ−, δ − σ−, Δ − g − σ+), with g defaulting to γ.
    pub fn tuning_slack(&self, generation_time: Option<TimeDelta>) -> TimeDelta {
        let g = generation_time.unwrap_or_else(|| self.max_generation_time());
        self.skew_ahead
            .max(self.skew_behind)
            .max(self.delay - self.skew_behind)
            .max(self.anticipation - g - self.skew_ahead)
    }

    /// α(g) = max(Δ − g − σ−, max(δ, g − Δ) + σ+), with g defaulting to γ.
    pub fn time_accuracy(&self, generation_time: Option<TimeDelta>) -> TimeDelta {
        let g = generation_time.unwrap_or_else(|| self.max_generation_time());
        let early = self.anticipation - g - self.skew_behind;
        let late = self.delay.max(g - self.anticipation) + self.skew_ahead;
        early.max(late)
    }
}
