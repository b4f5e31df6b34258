use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Output,
    Input,
}

/// One line of the server console, either produced by the server or
/// written to it by an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub timestamp: DateTime<Utc>,
    pub channel: Channel,
    pub direction: Direction,
    pub text: String,
}

impl ConsoleLine {
    pub fn output(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel,
            direction: Direction::Output,
            text: text.into(),
        }
    }

    /// A message generated by the supervisor itself.
    pub fn system(text: impl Into<String>) -> Self {
        Self::output(Channel::System, text)
    }

    /// An operator command, as written to the server's stdin.
    pub fn input(text: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            channel: Channel::System,
            direction: Direction::Input,
            text: text.into(),
        }
    }
}

/// Bounded, ordered console history. Oldest lines are evicted first.
#[derive(Debug, Clone)]
pub struct ConsoleHistory {
    lines: VecDeque<ConsoleLine>,
    capacity: usize,
}

impl ConsoleHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Seed from persisted lines, keeping only the newest `capacity`.
    pub fn from_lines(capacity: usize, lines: Vec<ConsoleLine>) -> Self {
        let mut history = Self::new(capacity);
        let skip = lines.len().saturating_sub(history.capacity);
        history.lines.extend(lines.into_iter().skip(skip));
        history
    }

    pub fn push(&mut self, line: ConsoleLine) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Last `n` lines in arrival order.
    pub fn tail(&self, n: usize) -> Vec<ConsoleLine> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ConsoleLine> {
        self.lines.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(lines: &[ConsoleLine]) -> Vec<&str> {
        lines.iter().map(|l| l.text.as_str()).collect()
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut history = ConsoleHistory::new(3);
        for i in 1..=5 {
            history.push(ConsoleLine::output(Channel::Stdout, format!("line{i}")));
        }
        assert_eq!(history.len(), 3);
        assert_eq!(texts(&history.snapshot()), vec!["line3", "line4", "line5"]);
    }

    #[test]
    fn test_tail_returns_newest_in_order() {
        let mut history = ConsoleHistory::new(10);
        for i in 1..=4 {
            history.push(ConsoleLine::system(format!("line{i}")));
        }
        assert_eq!(texts(&history.tail(2)), vec!["line3", "line4"]);
        assert_eq!(history.tail(100).len(), 4);
        assert!(history.tail(0).is_empty());
    }

    #[test]
    fn test_from_lines_truncates_to_capacity() {
        let lines: Vec<_> = (1..=6)
            .map(|i| ConsoleLine::output(Channel::Stdout, format!("line{i}")))
            .collect();
        let history = ConsoleHistory::from_lines(4, lines);
        assert_eq!(
            texts(&history.snapshot()),
            vec!["line3", "line4", "line5", "line6"]
        );
    }

    #[test]
    fn test_input_line_direction() {
        let line = ConsoleLine::input("list");
        assert_eq!(line.direction, Direction::Input);
        assert_eq!(line.channel, Channel::System);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut history = ConsoleHistory::new(0);
        history.push(ConsoleLine::system("a"));
        history.push(ConsoleLine::system("b"));
        assert_eq!(history.capacity(), 1);
        assert_eq!(texts(&history.snapshot()), vec!["b"]);
    }

    #[test]
    fn test_serialized_shape() {
        let line = ConsoleLine::output(Channel::Stderr, "boom");
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["channel"], "stderr");
        assert_eq!(json["direction"], "output");
        assert_eq!(json["text"], "boom");
    }
}
