//! Terminal list that follows the reconciler's edit scripts.

use std::fmt::Write as _;

use anyhow::{ensure, Context, Result};
use todo_core::{ProjectedRow, ProjectionUpdate};

pub struct ListView {
    rows: Vec<ProjectedRow>,
    applied: usize,
}

impl ListView {
    pub fn new(initial: &[ProjectedRow]) -> Self {
        Self {
            rows: initial.to_vec(),
            applied: 0,
        }
    }

    pub fn rows(&self) -> &[ProjectedRow] {
        &self.rows
    }

    /// Number of updates applied since construction.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Applies one update in full. The rows after applying must match the
    /// projection the update was computed against.
    pub fn apply(&mut self, update: &ProjectionUpdate) -> Result<()> {
        let next = update
            .script
            .apply(&self.rows, &update.projection)
            .context("edit script does not fit the displayed rows")?;
        ensure!(
            next.len() == update.projection.len(),
            "row count {} after update, projection has {}",
            next.len(),
            update.projection.len()
        );
        ensure!(
            next.as_slice() == update.projection.as_slice(),
            "displayed rows diverged from the projection"
        );
        self.rows = next;
        self.applied += 1;
        Ok(())
    }

    pub fn render(&self) -> String {
        if self.rows.is_empty() {
            return "  (no records)\n".into();
        }
        let mut out = String::new();
        for row in &self.rows {
            let record = &row.record;
            let _ = writeln!(
                out,
                "  [{}] {:>5}  {}{}{}",
                if record.completed { "x" } else { " " },
                record.id.0,
                record.display_title(),
                if record.is_pending() { "  (pending)" } else { "" },
                if row.is_editing { "  (editing)" } else { "" },
            );
        }
        out
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
