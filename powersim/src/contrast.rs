//! Centered contrast coding for the two 2-level factors.
//!
//! Context uses A = -0.5 / B = +0.5, task uses the reversed A = +0.5 / B = -0.5.
//! The interaction code is the product of the two, so a positive interaction
//! coefficient raises the AB and BA cells relative to AA and BB.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Level of a 2-level categorical factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    A,
    B,
}

impl Level {
    pub const ALL: [Level; 2] = [Level::A, Level::B];

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::A => "A",
            Level::B => "B",
        }
    }

    /// Parse a level label. Anything but "A" or "B" is a programming error.
    pub fn parse(label: &str) -> Self {
        match label {
            "A" => Level::A,
            "B" => Level::B,
            other => panic!("unknown factor level '{}': expected \"A\" or \"B\"", other),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two experimental factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Factor {
    Context,
    Task,
}

/// Numeric contrast for a factor level
pub fn encode(factor: Factor, level: Level) -> f64 {
    match (factor, level) {
        (Factor::Context, Level::A) => -0.5,
        (Factor::Context, Level::B) => 0.5,
        (Factor::Task, Level::A) => 0.5,
        (Factor::Task, Level::B) => -0.5,
    }
}

/// One context × task cell of the design
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub context: Level,
    pub task: Level,
}

impl Cell {
    /// Cells in canonical order: AA, AB, BA, BB (context, task)
    pub const ALL: [Cell; 4] = [
        Cell { context: Level::A, task: Level::A },
        Cell { context: Level::A, task: Level::B },
        Cell { context: Level::B, task: Level::A },
        Cell { context: Level::B, task: Level::B },
    ];

    pub fn context_code(&self) -> f64 {
        encode(Factor::Context, self.context)
    }

    pub fn task_code(&self) -> f64 {
        encode(Factor::Task, self.task)
    }

    pub fn interaction_code(&self) -> f64 {
        self.context_code() * self.task_code()
    }

    /// Position in `Cell::ALL`
    pub fn index(&self) -> usize {
        match (self.context, self.task) {
            (Level::A, Level::A) => 0,
            (Level::A, Level::B) => 1,
            (Level::B, Level::A) => 2,
            (Level::B, Level::B) => 3,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context={} task={}", self.context, self.task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_coding() {
        assert_eq!(encode(Factor::Context, Level::A), -0.5);
        assert_eq!(encode(Factor::Context, Level::B), 0.5);
    }

    #[test]
    fn test_task_coding_is_reversed() {
        assert_eq!(encode(Factor::Task, Level::A), 0.5);
        assert_eq!(encode(Factor::Task, Level::B), -0.5);
    }

    #[test]
    fn test_interaction_codes() {
        let codes: Vec<f64> = Cell::ALL.iter().map(|c| c.interaction_code()).collect();
        assert_eq!(codes, vec![-0.25, 0.25, 0.25, -0.25]);
    }

    #[test]
    fn test_cell_index_matches_order() {
        for (i, cell) in Cell::ALL.iter().enumerate() {
            assert_eq!(cell.index(), i);
        }
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(Level::parse("A"), Level::A);
        assert_eq!(Level::parse("B"), Level::B);
    }

    #[test]
    #[should_panic(expected = "unknown factor level")]
    fn test_parse_unknown_level_panics() {
        Level::parse("C");
    }
}
