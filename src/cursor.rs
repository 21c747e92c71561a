use crate::timestamp::{RawTimestamp, TimestampNormalizer};

/// Query issued for one poll, tagged with the cursor epoch it was built in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollRequest {
    /// Verbatim watermark for `?since=`; None requests a full snapshot
    pub since: Option<String>,
    pub epoch: u64,
}

/// Watermark of the newest primary-sensor reading already applied
///
/// Only the designated primary sensor moves the watermark: it reports on
/// every poll, so it is a reliable boundary. `reset()` clears it and bumps
/// the epoch, which invalidates every request issued before the reset.
#[derive(Clone, Debug)]
pub struct SyncCursor {
    watermark: Option<RawTimestamp>,
    watermark_ms: Option<i64>,
    epoch: u64,
}

impl SyncCursor {
    pub fn new() -> Self {
        SyncCursor {
            watermark: None,
            watermark_ms: None,
            epoch: 0,
        }
    }

    pub fn query(&self) -> PollRequest {
        PollRequest {
            since: self.watermark.as_ref().map(|w| w.to_string()),
            epoch: self.epoch,
        }
    }

    /// Advance to the primary sensor's raw timestamp.
    ///
    /// Returns false (watermark untouched) for a missing timestamp or one
    /// older than the current watermark.
    pub fn observe_primary(&mut self, raw: &RawTimestamp, normalizer: &TimestampNormalizer) -> bool {
        if raw.is_missing() {
            return false;
        }
        let ms = normalizer.normalize(raw);
        if let Some(current) = self.watermark_ms {
            if ms < current {
                log::debug!("[SYNC] Ignoring regressing watermark {} < {}", ms, current);
                return false;
            }
        }
        self.watermark = Some(raw.clone());
        self.watermark_ms = Some(ms);
        true
    }

    /// Whether a response to `request` may still be applied
    pub fn accepts(&self, request: &PollRequest) -> bool {
        request.epoch == self.epoch
    }

    pub fn reset(&mut self) {
        self.watermark = None;
        self.watermark_ms = None;
        self.epoch += 1;
    }

    pub fn watermark(&self) -> Option<&RawTimestamp> {
        self.watermark.as_ref()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::new()
    }
}
