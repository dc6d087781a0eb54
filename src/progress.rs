// ============================================
// Converter - progress.rs
// ============================================
// Progress reporting shared by the archive and image code.
// Long operations take a `&mut Reporter` and call `step` as they go;
// the CLI turns the events into "[ 42.0%] message" lines.
// ============================================

/// One progress notification.
/// `Failed` replaces the old "percent = -1" convention.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Step { message: String, percent: f32 },
    Failed { message: String },
}

/// Wraps an optional progress callback so handlers can report without
/// checking whether anyone is listening.
pub struct Reporter<'a> {
    callback: Option<&'a mut dyn FnMut(Progress)>,
    last_percent: f32,
}

impl<'a> Reporter<'a> {
    pub fn new(callback: &'a mut dyn FnMut(Progress)) -> Self {
        Reporter {
            callback: Some(callback),
            last_percent: 0.0,
        }
    }

    /// A reporter that drops every event
    pub fn silent() -> Reporter<'static> {
        Reporter {
            callback: None,
            last_percent: 0.0,
        }
    }

    /// Report progress. Percentages are clamped to 0..=100 and never go
    /// backwards within one operation.
    pub fn step(&mut self, message: impl Into<String>, percent: f32) {
        let percent = percent.clamp(0.0, 100.0).max(self.last_percent);
        self.last_percent = percent;
        if let Some(callback) = self.callback.as_mut() {
            callback(Progress::Step {
                message: message.into(),
                percent,
            });
        }
    }

    /// Report "done / total" as a percentage
    pub fn step_of(&mut self, message: impl Into<String>, done: usize, total: usize) {
        let percent = if total == 0 {
            100.0
        } else {
            (done as f32 / total as f32) * 100.0
        };
        self.step(message, percent);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if let Some(callback) = self.callback.as_mut() {
            callback(Progress::Failed {
                message: message.into(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reporter_clamps_and_never_goes_back() {
        let mut events = Vec::new();
        {
            let mut record = |p: Progress| events.push(p);
            let mut reporter = Reporter::new(&mut record);
            reporter.step("a", 50.0);
            reporter.step("b", 20.0);
            reporter.step("c", 250.0);
            reporter.fail("boom");
        }
        let percents: Vec<f32> = events
            .iter()
            .filter_map(|e| match e {
                Progress::Step { percent, .. } => Some(*percent),
                Progress::Failed { .. } => None,
            })
            .collect();
        assert_eq!(percents, vec![50.0, 50.0, 100.0]);
        assert_eq!(
            events.last(),
            Some(&Progress::Failed {
                message: "boom".to_string()
            })
        );
    }

    #[test]
    fn test_step_of_handles_empty_total() {
        let mut last = None;
        {
            let mut record = |p: Progress| last = Some(p);
            let mut reporter = Reporter::new(&mut record);
            reporter.step_of("nothing to do", 0, 0);
        }
        assert_eq!(
            last,
            Some(Progress::Step {
                message: "nothing to do".to_string(),
                percent: 100.0
            })
        );
    }

    #[test]
    fn test_silent_reporter_accepts_everything() {
        let mut reporter = Reporter::silent();
        reporter.step("ignored", 10.0);
        reporter.fail("also ignored");
    }
}
