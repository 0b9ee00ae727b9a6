//! Step selection over a parsed plan.
//!
//! Diagnostic steps never run on their own and are never confirmed; the
//! sequencer jumps over them and reports the jump so the runtime can
//! invalidate its held snapshot.

use handrail_core::{Step, StepView};

/// First executable index strictly after `after` (from the start when
/// `None`). Diagnostic steps are skipped; `None` when the plan is exhausted.
pub fn next_executable(steps: &[Step], after: Option<usize>) -> Option<usize> {
    let start = after.map_or(0, |i| i + 1);
    steps
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, step)| !step.tool.is_diagnostic())
        .map(|(i, _)| i)
}

/// The confirmation-eligible step list, diagnostics filtered out.
pub fn visible_steps(steps: &[Step]) -> Vec<StepView> {
    steps
        .iter()
        .filter(|step| !step.tool.is_diagnostic())
        .map(StepView::from)
        .collect()
}

/// Whether advancing from `after` to `until` jumped over at least one
/// diagnostic step.
pub fn skipped_diagnostics(steps: &[Step], after: Option<usize>, until: usize) -> bool {
    let start = after.map_or(0, |i| i + 1);
    steps[start..until.min(steps.len())]
        .iter()
        .any(|step| step.tool.is_diagnostic())
}

#[cfg(test)]
mod tests {
    use super::*;
    use handrail_core::LogicalTool;
    use serde_json::{Map, Value};

    fn step(tool: LogicalTool) -> Step {
        Step::new(tool, Map::new())
    }

    fn plan() -> Vec<Step> {
        vec![
            step(LogicalTool::Navigate),
            step(LogicalTool::Snapshot),
            step(LogicalTool::Click),
            step(LogicalTool::Snapshot),
        ]
    }

    #[test]
    fn test_next_executable_skips_diagnostics() {
        let steps = plan();
        assert_eq!(next_executable(&steps, None), Some(0));
        assert_eq!(next_executable(&steps, Some(0)), Some(2));
        assert_eq!(next_executable(&steps, Some(2)), None);
    }

    #[test]
    fn test_next_executable_from_leading_diagnostic() {
        let steps = vec![step(LogicalTool::Snapshot), step(LogicalTool::Navigate)];
        assert_eq!(next_executable(&steps, None), Some(1));
    }

    #[test]
    fn test_all_diagnostics_is_exhausted() {
        let steps = vec![step(LogicalTool::Snapshot), step(LogicalTool::Snapshot)];
        assert_eq!(next_executable(&steps, None), None);
    }

    #[test]
    fn test_visible_steps_filters_diagnostics() {
        let steps = plan();
        let visible = visible_steps(&steps);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].tool, LogicalTool::Navigate);
        assert_eq!(visible[1].tool, LogicalTool::Click);
        // Ids survive filtering so clients can correlate.
        assert_eq!(visible[1].id, steps[2].id);
    }

    #[test]
    fn test_skipped_diagnostics_detects_jump() {
        let steps = plan();
        assert!(!skipped_diagnostics(&steps, None, 0));
        assert!(skipped_diagnostics(&steps, Some(0), 2));
    }

    #[test]
    fn test_skipped_diagnostics_leading_jump() {
        let steps = vec![step(LogicalTool::Snapshot), step(LogicalTool::Click)];
        assert!(skipped_diagnostics(&steps, None, 1));
    }

    #[test]
    fn test_adjacent_steps_jump_nothing() {
        let steps = vec![
            step(LogicalTool::Navigate),
            step(LogicalTool::Click),
            Step::new(
                LogicalTool::TypeText,
                Map::from_iter([("text".to_string(), Value::String("hi".to_string()))]),
            ),
        ];
        assert!(!skipped_diagnostics(&steps, Some(0), 1));
        assert!(!skipped_diagnostics(&steps, Some(1), 2));
    }
}
