use crate::model::ActionKind;

/// Remediation rungs ordered least disruptive first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationLadder {
    rungs: Vec<ActionKind>,
}

impl EscalationLadder {
    pub fn new(rungs: Vec<ActionKind>) -> Self {
        Self { rungs }
    }

    pub fn rungs(&self) -> &[ActionKind] {
        &self.rungs
    }

    pub fn get(&self, rung: usize) -> Option<ActionKind> {
        self.rungs.get(rung).copied()
    }

    /// Where a fresh decision starts: the preferred action's rung when it is on
    /// the ladder, else the bottom. Never below a rung that was already tried.
    pub fn start(&self, preferred: Option<ActionKind>, tried: &[ActionKind]) -> usize {
        let preferred = preferred
            .and_then(|kind| self.rungs.iter().position(|r| *r == kind))
            .unwrap_or(0);
        preferred.max(self.after(tried))
    }

    /// First rung above everything already tried.
    pub fn after(&self, tried: &[ActionKind]) -> usize {
        tried
            .iter()
            .filter_map(|kind| self.rungs.iter().position(|r| r == kind))
            .max()
            .map(|top| top + 1)
            .unwrap_or(0)
    }
}

impl Default for EscalationLadder {
    fn default() -> Self {
        Self::new(vec![ActionKind::Restart, ActionKind::Scale, ActionKind::Rollback, ActionKind::CodeFix])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_respects_preference_and_history() {
        let ladder = EscalationLadder::default();
        assert_eq!(ladder.start(None, &[]), 0);
        assert_eq!(ladder.start(Some(ActionKind::Rollback), &[]), 2);
        // manual is not on the ladder
        assert_eq!(ladder.start(Some(ActionKind::Manual), &[]), 0);
        assert_eq!(ladder.start(Some(ActionKind::Restart), &[ActionKind::Scale]), 2);
        assert_eq!(ladder.get(ladder.after(&[ActionKind::CodeFix])), None);
    }
}
