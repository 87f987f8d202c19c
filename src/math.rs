//! Root-softmax-temperature schedules.
//!
//! Temperature strings are either a bare constant (`"1"`) or an exponential
//! decay `"start->end:half_life"`, stepped once per received move.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleParseError {
    #[error("empty temperature schedule")]
    Empty,

    #[error("malformed temperature schedule {0:?} (expected \"x\" or \"start->end:half_life\")")]
    Malformed(String),

    #[error("non-positive value in temperature schedule {0:?}")]
    NonPositive(String),
}

/// Exponential decay from `start` toward `end` with the given half-life in
/// moves. A bare constant parses as `start == end`.
#[derive(Clone, Debug)]
pub struct ExponentialDecay {
    start: f32,
    end: f32,
    half_life: f32,
    moves: u32,
}

impl ExponentialDecay {
    pub fn constant(value: f32) -> Self {
        Self {
            start: value,
            end: value,
            half_life: 1.0,
            moves: 0,
        }
    }

    /// Parse `"x"` or `"start->end:half_life"`.
    pub fn parse(expr: &str) -> Result<Self, ScheduleParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ScheduleParseError::Empty);
        }

        let malformed = || ScheduleParseError::Malformed(expr.to_string());

        let decay = match expr.split_once("->") {
            None => {
                let value: f32 = expr.parse().map_err(|_| malformed())?;
                Self::constant(value)
            }
            Some((start, rest)) => {
                let (end, half_life) = rest.split_once(':').ok_or_else(malformed)?;
                Self {
                    start: start.trim().parse().map_err(|_| malformed())?,
                    end: end.trim().parse().map_err(|_| malformed())?,
                    half_life: half_life.trim().parse().map_err(|_| malformed())?,
                    moves: 0,
                }
            }
        };

        if decay.start <= 0.0 || decay.end <= 0.0 || decay.half_life <= 0.0 {
            return Err(ScheduleParseError::NonPositive(expr.to_string()));
        }
        Ok(decay)
    }

    /// Current temperature.
    pub fn value(&self) -> f32 {
        self.end + (self.start - self.end) * 0.5f32.powf(self.moves as f32 / self.half_life)
    }

    /// Advance one move.
    pub fn step(&mut self) {
        self.moves = self.moves.saturating_add(1);
    }

    /// Rewind to move zero.
    pub fn reset(&mut self) {
        self.moves = 0;
    }
}
