//! Signed task-age filters.
//!
//! `3d` selects tasks at least three days old, `-3d` tasks at most three
//! days old. A bare number is in days.

use std::str::FromStr;

use crate::TaskError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgeFilter {
    /// Threshold in seconds; the sign selects the comparison.
    seconds: f64,
}

impl AgeFilter {
    pub fn parse(text: &str) -> Result<Self, TaskError> {
        let invalid = || TaskError::InvalidAge(text.to_owned());
        let trimmed = text.trim();
        let (negative, body) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let split = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (number, unit) = body.split_at(split);
        let amount: f64 = number.parse().map_err(|_| invalid())?;
        let scale = match unit.trim() {
            "" | "d" => 86_400.0,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3_600.0,
            "w" => 604_800.0,
            _ => return Err(invalid()),
        };

        let seconds = amount * scale;
        Ok(Self {
            seconds: if negative { -seconds } else { seconds },
        })
    }

    pub fn seconds(&self) -> f64 {
        self.seconds
    }

    /// Whether a task `age` seconds old passes the filter.
    pub fn matches(&self, age: f64) -> bool {
        if self.seconds >= 0.0 {
            age >= self.seconds
        } else {
            age <= -self.seconds
        }
    }
}

impl FromStr for AgeFilter {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
