use defect_model::DetectionResult;

/// Single-slot cache backing the frame-skipping policy.
///
/// Holds at most the most recent detection result, never a history. Frames
/// whose index is not an inference point reuse the slot unchanged, so the
/// drawn boxes may lag the pixels by up to `skip_interval - 1` frames. That
/// staleness is the accepted price for skipping detector calls.
#[derive(Default)]
pub(crate) struct InferenceCache {
    last: Option<DetectionResult>,
}

impl InferenceCache {
    /// True when the frame at 1-based `index` needs a fresh detector pass:
    /// either nothing is cached yet or the index falls on the skip stride.
    pub(crate) fn needs_inference(&self, index: u64, skip_interval: u32) -> bool {
        self.last.is_none() || index % u64::from(skip_interval.max(1)) == 0
    }

    /// Replace the cached result with a freshly computed one.
    pub(crate) fn store(&mut self, result: DetectionResult) -> &DetectionResult {
        self.last.insert(result)
    }

    pub(crate) fn last(&self) -> Option<&DetectionResult> {
        self.last.as_ref()
    }
}
