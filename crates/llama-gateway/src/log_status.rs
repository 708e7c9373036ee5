//! Status tracking over llama-server output.
//!
//! A pure parser: feed it worker stdout lines and it reports what the server
//! is doing (idle, processing a prompt, generating, finished with speeds).
//! Prompt-eval and eval timings are printed on separate lines, so they are
//! buffered as independent facts and combined once both have been seen.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref NEW_PROMPT_RE: Regex =
        Regex::new(r"new prompt, n_ctx_slot = \d+, n_keep = \d+, n_prompt_tokens = (\d+)").unwrap();
    static ref PROGRESS_RE: Regex = Regex::new(
        r"prompt processing progress, n_past = (\d+), n_tokens = (\d+), progress = ([0-9.]+)"
    )
    .unwrap();
    static ref PROMPT_DONE_RE: Regex =
        Regex::new(r"prompt done, n_past = (\d+), n_tokens = (\d+)").unwrap();
    static ref PROMPT_EVAL_RE: Regex =
        Regex::new(r"prompt eval time =\s*([0-9.]+) ms /\s*(\d+) tokens").unwrap();
    static ref EVAL_RE: Regex = Regex::new(r"eval time =\s*([0-9.]+) ms /\s*(\d+) tokens").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusSnapshot {
    Idle,
    Starting {
        prompt_tokens: Option<u64>,
    },
    ProcessingPrompt {
        /// 0..100
        progress: f64,
        prompt_tokens: u64,
    },
    Generating {
        prompt_tokens: u64,
    },
    Completed {
        /// Prompt processing speed, tokens per second.
        processing_speed: f64,
        /// Generation speed, tokens per second.
        generation_speed: f64,
        prompt_tokens: u64,
        generated_tokens: u64,
    },
}

impl StatusSnapshot {
    pub fn format_text(&self) -> String {
        match self {
            StatusSnapshot::Idle => "Idle".to_string(),
            StatusSnapshot::Starting { .. } => "Starting".to_string(),
            StatusSnapshot::ProcessingPrompt { progress, .. } => {
                format!("Processing prompt: {:.1}%", progress)
            }
            StatusSnapshot::Generating { .. } => "Generating response".to_string(),
            StatusSnapshot::Completed {
                processing_speed,
                generation_speed,
                ..
            } => format!(
                "Generated, speed {:.1} t/s (proc), {:.1} t/s (gen)",
                processing_speed, generation_speed
            ),
        }
    }

    fn is_settled(&self) -> bool {
        matches!(self, StatusSnapshot::Idle | StatusSnapshot::Completed { .. })
    }
}

#[derive(Debug, Default)]
pub struct LogTracker {
    current: Option<StatusSnapshot>,
    /// (milliseconds, tokens) from the `prompt eval time` line.
    prompt_timing: Option<(f64, u64)>,
    /// (milliseconds, tokens) from the `eval time` line.
    eval_timing: Option<(f64, u64)>,
}

impl LogTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.current.clone().unwrap_or(StatusSnapshot::Idle)
    }

    /// Parses a full slice of lines with a fresh tracker. Feeding the lines
    /// one at a time through [`observe_line`] yields the same final status.
    ///
    /// [`observe_line`]: LogTracker::observe_line
    pub fn parse_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> StatusSnapshot {
        let mut tracker = LogTracker::new();
        for line in lines {
            tracker.observe_line(line);
        }
        tracker.status()
    }

    pub fn observe_line(&mut self, line: &str) {
        if line.contains("new prompt") {
            if let Some(caps) = NEW_PROMPT_RE.captures(line) {
                self.reset_timing();
                self.current = Some(StatusSnapshot::Starting {
                    prompt_tokens: caps[1].parse().ok(),
                });
                return;
            }
        }

        if line.contains("prompt processing progress") {
            if let Some(caps) = PROGRESS_RE.captures(line) {
                let progress: f64 = caps[3].parse().unwrap_or(0.0);
                self.current = Some(StatusSnapshot::ProcessingPrompt {
                    progress: progress * 100.0,
                    prompt_tokens: caps[2].parse().unwrap_or(0),
                });
                return;
            }
        }

        if line.contains("prompt done") {
            if let Some(caps) = PROMPT_DONE_RE.captures(line) {
                self.current = Some(StatusSnapshot::Generating {
                    prompt_tokens: caps[2].parse().unwrap_or(0),
                });
                return;
            }
        }

        if line.contains("prompt eval time") {
            if let Some(caps) = PROMPT_EVAL_RE.captures(line) {
                self.prompt_timing =
                    Some((caps[1].parse().unwrap_or(0.0), caps[2].parse().unwrap_or(0)));
                self.try_complete();
            }
            return;
        }

        // Plain `eval time` line; the prompt variant was handled above.
        if line.contains("eval time") {
            if let Some(caps) = EVAL_RE.captures(line) {
                self.eval_timing =
                    Some((caps[1].parse().unwrap_or(0.0), caps[2].parse().unwrap_or(0)));
                self.try_complete();
            }
            return;
        }

        if line.contains("all slots are idle") {
            self.reset_timing();
            self.current = Some(StatusSnapshot::Idle);
            return;
        }

        // A new task arriving after the previous one settled starts the cycle
        // over; mid-task occurrences of this marker are noise.
        if line.contains("processing task") {
            let settled = self.current.as_ref().map(|s| s.is_settled()).unwrap_or(true);
            if settled {
                self.reset_timing();
                self.current = Some(StatusSnapshot::Starting {
                    prompt_tokens: None,
                });
            }
        }
    }

    fn try_complete(&mut self) {
        if let (Some((prompt_ms, prompt_tokens)), Some((eval_ms, generated_tokens))) =
            (self.prompt_timing, self.eval_timing)
        {
            let processing_speed = if prompt_ms > 0.0 {
                prompt_tokens as f64 * 1000.0 / prompt_ms
            } else {
                0.0
            };
            let generation_speed = if eval_ms > 0.0 {
                generated_tokens as f64 * 1000.0 / eval_ms
            } else {
                0.0
            };
            self.current = Some(StatusSnapshot::Completed {
                processing_speed,
                generation_speed,
                prompt_tokens,
                generated_tokens,
            });
        }
    }

    fn reset_timing(&mut self) {
        self.prompt_timing = None;
        self.eval_timing = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENERATION_CYCLE: &[&str] = &[
        "slot launch_slot_: id  0 | task 0 | processing task",
        "slot update_slots: id  0 | task 0 | new prompt, n_ctx_slot = 4096, n_keep = 0, n_prompt_tokens = 21",
        "slot update_slots: id  0 | task 0 | prompt processing progress, n_past = 21, n_tokens = 21, progress = 1.000000",
        "slot update_slots: id  0 | task 0 | prompt done, n_past = 21, n_tokens = 21",
        "prompt eval time =     100.00 ms /    20 tokens (    5.00 ms per token,   200.00 tokens per second)",
        "       eval time =    2000.00 ms /    50 tokens (   40.00 ms per token,    25.00 tokens per second)",
    ];

    #[test]
    fn test_empty_input_is_idle() {
        assert_eq!(LogTracker::parse_lines([]), StatusSnapshot::Idle);
    }

    #[test]
    fn test_idle_server_logs_stay_idle() {
        let lines = [
            "llm_load_print_meta: arch             = llama",
            "srv  update_slots: all slots are idle",
            "request: POST /completion 127.0.0.1 200",
            "srv  update_slots: all slots are idle",
        ];
        assert_eq!(LogTracker::parse_lines(lines), StatusSnapshot::Idle);
    }

    #[test]
    fn test_new_prompt_starts_with_token_count() {
        let lines = &GENERATION_CYCLE[..2];
        assert_eq!(
            LogTracker::parse_lines(lines.iter().copied()),
            StatusSnapshot::Starting {
                prompt_tokens: Some(21)
            }
        );
    }

    #[test]
    fn test_progress_is_scaled_to_percent() {
        let lines = [
            "slot update_slots: id  0 | task 0 | prompt processing progress, n_past = 10, n_tokens = 21, progress = 0.476190",
        ];
        match LogTracker::parse_lines(lines) {
            StatusSnapshot::ProcessingPrompt {
                progress,
                prompt_tokens,
            } => {
                assert!((progress - 47.619).abs() < 0.01);
                assert_eq!(prompt_tokens, 21);
            }
            other => panic!("expected ProcessingPrompt, got {:?}", other),
        }
    }

    #[test]
    fn test_prompt_done_means_generating() {
        let lines = &GENERATION_CYCLE[..4];
        assert_eq!(
            LogTracker::parse_lines(lines.iter().copied()),
            StatusSnapshot::Generating { prompt_tokens: 21 }
        );
    }

    #[test]
    fn test_both_timing_lines_complete_with_speeds() {
        match LogTracker::parse_lines(GENERATION_CYCLE.iter().copied()) {
            StatusSnapshot::Completed {
                processing_speed,
                generation_speed,
                prompt_tokens,
                generated_tokens,
            } => {
                assert!((processing_speed - 200.0).abs() < 0.01);
                assert!((generation_speed - 25.0).abs() < 0.01);
                assert_eq!(prompt_tokens, 20);
                assert_eq!(generated_tokens, 50);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_single_timing_line_is_not_complete() {
        let lines = &GENERATION_CYCLE[..5];
        assert_eq!(
            LogTracker::parse_lines(lines.iter().copied()),
            StatusSnapshot::Generating { prompt_tokens: 21 }
        );
    }

    #[test]
    fn test_line_by_line_matches_batch_parse() {
        let batch = LogTracker::parse_lines(GENERATION_CYCLE.iter().copied());
        let mut tracker = LogTracker::new();
        for line in GENERATION_CYCLE {
            tracker.observe_line(line);
        }
        assert_eq!(tracker.status(), batch);
    }

    #[test]
    fn test_idle_after_completion_clears_timing() {
        let mut lines: Vec<&str> = GENERATION_CYCLE.to_vec();
        lines.push("srv  update_slots: all slots are idle");
        assert_eq!(
            LogTracker::parse_lines(lines.iter().copied()),
            StatusSnapshot::Idle
        );
    }

    #[test]
    fn test_new_task_after_completion_is_not_completed() {
        let mut lines: Vec<&str> = GENERATION_CYCLE.to_vec();
        lines.push("slot launch_slot_: id  0 | task 1 | processing task");
        assert_eq!(
            LogTracker::parse_lines(lines.iter().copied()),
            StatusSnapshot::Starting {
                prompt_tokens: None
            }
        );
    }

    #[test]
    fn test_second_cycle_reflects_only_newer_timings() {
        let mut lines: Vec<&str> = GENERATION_CYCLE.to_vec();
        lines.extend([
            "slot launch_slot_: id  0 | task 1 | processing task",
            "slot update_slots: id  0 | task 1 | new prompt, n_ctx_slot = 4096, n_keep = 0, n_prompt_tokens = 7",
            "prompt eval time =      50.00 ms /    10 tokens (    5.00 ms per token,   200.00 tokens per second)",
            "       eval time =    1000.00 ms /    40 tokens (   25.00 ms per token,    40.00 tokens per second)",
        ]);
        match LogTracker::parse_lines(lines.iter().copied()) {
            StatusSnapshot::Completed {
                prompt_tokens,
                generated_tokens,
                ..
            } => {
                assert_eq!(prompt_tokens, 10);
                assert_eq!(generated_tokens, 40);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_processing_task_mid_generation_is_ignored() {
        let lines = [
            "slot update_slots: id  0 | task 0 | prompt done, n_past = 21, n_tokens = 21",
            "slot launch_slot_: id  0 | task 0 | processing task",
        ];
        assert_eq!(
            LogTracker::parse_lines(lines),
            StatusSnapshot::Generating { prompt_tokens: 21 }
        );
    }

    #[test]
    fn test_timing_order_does_not_matter() {
        let lines = [
            "       eval time =    2000.00 ms /    50 tokens (   40.00 ms per token,    25.00 tokens per second)",
            "prompt eval time =     100.00 ms /    20 tokens (    5.00 ms per token,   200.00 tokens per second)",
        ];
        assert!(matches!(
            LogTracker::parse_lines(lines),
            StatusSnapshot::Completed { .. }
        ));
    }

    #[test]
    fn test_format_text_variants() {
        assert_eq!(StatusSnapshot::Idle.format_text(), "Idle");
        assert_eq!(
            StatusSnapshot::Starting {
                prompt_tokens: None
            }
            .format_text(),
            "Starting"
        );
        let completed = StatusSnapshot::Completed {
            processing_speed: 200.0,
            generation_speed: 25.0,
            prompt_tokens: 20,
            generated_tokens: 50,
        };
        assert_eq!(
            completed.format_text(),
            "Generated, speed 200.0 t/s (proc), 25.0 t/s (gen)"
        );
    }
}
