use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

/// One usage observation taken from a vendor stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageReport {
    /// Complete counts reported once, usually in a trailing event.
    Total(TokenUsage),
    /// Counts known when the response starts.
    Started { input_tokens: u32, output_tokens: u32 },
    /// Output tokens added since the previous report.
    OutputDelta(u32),
}

/// Reconciles vendor usage reports into one [`TokenUsage`].
#[derive(Debug, Clone, Default)]
pub struct UsageAccumulator {
    prompt_tokens: u32,
    completion_tokens: u32,
    reported_total: Option<u32>,
    seen: bool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, report: UsageReport) {
        self.seen = true;
        match report {
            UsageReport::Total(usage) => {
                self.prompt_tokens = usage.prompt_tokens;
                self.completion_tokens = usage.completion_tokens;
                self.reported_total = Some(usage.total_tokens);
            }
            UsageReport::Started {
                input_tokens,
                output_tokens,
            } => {
                self.prompt_tokens = input_tokens;
                self.completion_tokens = output_tokens;
                self.reported_total = None;
            }
            UsageReport::OutputDelta(tokens) => {
                self.completion_tokens = self.completion_tokens.saturating_add(tokens);
                self.reported_total = None;
            }
        }
    }

    /// `None` when the vendor never reported usage.
    pub fn finish(&self) -> Option<TokenUsage> {
        self.seen.then(|| TokenUsage {
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self
                .reported_total
                .unwrap_or(self.prompt_tokens.saturating_add(self.completion_tokens)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_total_is_taken_verbatim() {
        let mut acc = UsageAccumulator::new();
        acc.apply(UsageReport::Total(TokenUsage {
            prompt_tokens: 12,
            completion_tokens: 30,
            total_tokens: 42,
        }));
        assert_eq!(acc.finish(), Some(TokenUsage::new(12, 30)));
    }

    #[test]
    fn test_incremental_reports_accumulate() {
        let mut acc = UsageAccumulator::new();
        acc.apply(UsageReport::Started {
            input_tokens: 25,
            output_tokens: 1,
        });
        acc.apply(UsageReport::OutputDelta(15));
        acc.apply(UsageReport::OutputDelta(4));

        let usage = acc.finish().unwrap();
        assert_eq!(usage.prompt_tokens, 25);
        assert_eq!(usage.completion_tokens, 20);
        assert_eq!(usage.total_tokens, 45);
    }

    #[test]
    fn test_oversized_deltas_saturate() {
        let mut acc = UsageAccumulator::new();
        acc.apply(UsageReport::Started {
            input_tokens: 10,
            output_tokens: 1,
        });
        acc.apply(UsageReport::OutputDelta(u32::MAX));
        acc.apply(UsageReport::OutputDelta(7));

        let usage = acc.finish().unwrap();
        assert_eq!(usage.completion_tokens, u32::MAX);
        assert_eq!(usage.total_tokens, u32::MAX);
    }

    #[test]
    fn test_no_reports_means_no_usage() {
        assert_eq!(UsageAccumulator::new().finish(), None);
    }
}
