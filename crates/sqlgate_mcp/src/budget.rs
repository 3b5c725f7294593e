//! Output Budget - Response Size Limits
//!
//! Caps the rows a single response carries so one query cannot flood the
//! caller's context. Rows past the budget are dropped and the response is
//! flagged `truncated`.

use serde_json::Value;

/// Room kept for the envelope around the rows (columns, counters, ids).
const ENVELOPE_RESERVE: usize = 1024;

#[derive(Debug, Clone, Copy)]
pub struct OutputBudget {
    max_bytes: usize,
    max_rows: usize,
}

impl OutputBudget {
    pub fn new(max_bytes: usize, max_rows: usize) -> Self {
        Self {
            max_bytes,
            max_rows,
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Keep the longest prefix of `rows` that fits both limits.
    ///
    /// Returns (rows, was_truncated)
    pub fn enforce_rows(&self, rows: Vec<Value>) -> (Vec<Value>, bool) {
        let byte_budget = self.max_bytes.saturating_sub(ENVELOPE_RESERVE);
        let mut used = 0usize;
        let mut keep = 0usize;

        for row in rows.iter().take(self.max_rows) {
            // +1 for the separating comma
            let size = serde_json::to_string(row).map(|s| s.len()).unwrap_or(0) + 1;
            if used + size > byte_budget {
                break;
            }
            used += size;
            keep += 1;
        }

        let truncated = keep < rows.len();
        let mut rows = rows;
        rows.truncate(keep);
        (rows, truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enforce_rows() {
        let budget = OutputBudget::new(1024 * 1024, 5);

        // Within budget
        let (rows, truncated) = budget.enforce_rows(vec![json!(1), json!(2), json!(3)]);
        assert_eq!(rows.len(), 3);
        assert!(!truncated);

        // Exceeds row budget
        let (rows, truncated) = budget.enforce_rows((0..8).map(|i| json!(i)).collect());
        assert_eq!(rows.len(), 5);
        assert!(truncated);
    }

    #[test]
    fn test_enforce_bytes() {
        let budget = OutputBudget::new(ENVELOPE_RESERVE + 100, 1000);
        let row = json!({"county_name": "x".repeat(20)});
        let row_size = serde_json::to_string(&row).unwrap().len() + 1;

        let (rows, truncated) = budget.enforce_rows(vec![row; 50]);
        assert!(truncated);
        assert_eq!(rows.len(), 100 / row_size);
    }

    #[test]
    fn test_tiny_budget_keeps_nothing() {
        let budget = OutputBudget::new(10, 1000);
        let (rows, truncated) = budget.enforce_rows(vec![json!({"a": 1})]);
        assert!(rows.is_empty());
        assert!(truncated);
    }
}
