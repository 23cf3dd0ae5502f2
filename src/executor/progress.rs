//! Parsing of the simulator's `<current>/<target>` progress lines.

use crate::error::ExecutorError;

/// Parse one stderr line of the form `<current>/<target>`
pub fn parse_progress_line(line: &str) -> Result<(u64, u64), ExecutorError> {
    let parse_error = || ExecutorError::MonitoringParse {
        line: line.to_string(),
    };

    let (current, target) = line.trim().split_once('/').ok_or_else(parse_error)?;
    let current = current.trim().parse::<u64>().map_err(|_| parse_error())?;
    let target = target.trim().parse::<u64>().map_err(|_| parse_error())?;
    if target == 0 {
        return Err(parse_error());
    }
    Ok((current, target))
}

/// Keeps reported progress within [0, 100] and never lets it go backwards
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker {
    progress: f64,
}

impl ProgressTracker {
    pub fn advance(&mut self, current: u64, target: u64) -> f64 {
        if target > 0 {
            let percent = (current as f64 / target as f64 * 100.0).clamp(0.0, 100.0);
            self.progress = self.progress.max(percent);
        }
        self.progress
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(parse_progress_line("5/10").unwrap(), (5, 10));
        assert_eq!(parse_progress_line(" 10 / 10\n").unwrap(), (10, 10));
        assert!(matches!(
            parse_progress_line("Segmentation fault"),
            Err(ExecutorError::MonitoringParse { .. })
        ));
        assert!(parse_progress_line("3/0").is_err());
        assert!(parse_progress_line("-1/10").is_err());
    }

    #[test]
    fn test_tracker_scenario() {
        let mut tracker = ProgressTracker::default();
        assert_eq!(tracker.advance(5, 10), 50.0);
        assert_eq!(tracker.advance(10, 10), 100.0);
        assert_eq!(tracker.advance(12, 10), 100.0);
    }

    proptest! {
        #[test]
        fn progress_is_monotonic_and_clamped(
            samples in prop::collection::vec((0u64..2_000, 1u64..1_000), 1..50)
        ) {
            let mut tracker = ProgressTracker::default();
            let mut previous = 0.0;
            for (current, target) in samples {
                let progress = tracker.advance(current, target);
                prop_assert!(progress >= previous);
                prop_assert!((0.0..=100.0).contains(&progress));
                previous = progress;
            }
        }

        #[test]
        fn well_formed_lines_parse(current in 0u64..1_000_000, target in 1u64..1_000_000) {
            let line = format!("{current}/{target}");
            prop_assert_eq!(parse_progress_line(&line).unwrap(), (current, target));
        }
    }
}
