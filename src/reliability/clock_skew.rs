const DEFAULT_HEADER_VALUE: &str = "use-collector-delta";

/// Tracks whether the collector has told us how far our clock is off, and holds batched
/// sends back until the first response arrives.
#[derive(Debug, Clone)]
pub struct ClockSkewManager {
    allow_sending: bool,
    should_add_headers: bool,
    is_first_request: bool,
    header_value: String,
    is_set: bool,
}

impl Default for ClockSkewManager {
    fn default() -> Self {
        Self {
            allow_sending: true,
            should_add_headers: true,
            is_first_request: true,
            header_value: DEFAULT_HEADER_VALUE.to_string(),
            is_set: false,
        }
    }
}

impl ClockSkewManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_request_sending(&self) -> bool {
        self.allow_sending
    }

    /// Marks the probe request as sent. Until a delta is learned this blocks further
    /// batched sends, so at most one request is in flight without skew knowledge.
    pub fn first_request_sent(&mut self) {
        if self.is_first_request {
            self.is_first_request = false;
            if !self.is_set {
                self.allow_sending = false;
            }
        }
    }

    pub fn should_add_clock_skew_headers(&self) -> bool {
        self.should_add_headers
    }

    pub fn clock_skew_header_value(&self) -> &str {
        &self.header_value
    }

    /// Applies the collector's `time-delta-millis` value. Either outcome resolves the
    /// probe; once a delta has been recorded later calls change nothing.
    pub fn set_clock_skew(&mut self, time_delta_millis: Option<&str>) {
        if self.is_set {
            return;
        }

        match time_delta_millis.filter(|value| !value.is_empty()) {
            Some(delta) => {
                self.header_value = delta.to_string();
                self.should_add_headers = true;
                self.is_set = true;
            }
            None => self.should_add_headers = false,
        }
        self.allow_sending = true;
    }

    pub fn is_set(&self) -> bool {
        self.is_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let manager = ClockSkewManager::new();
        assert!(manager.allow_request_sending());
        assert!(manager.should_add_clock_skew_headers());
        assert_eq!(manager.clock_skew_header_value(), "use-collector-delta");
        assert!(!manager.is_set());
    }

    #[test]
    fn test_first_request_blocks_until_resolved() {
        let mut manager = ClockSkewManager::new();
        manager.first_request_sent();
        assert!(!manager.allow_request_sending());

        // Only the first call can block.
        manager.set_clock_skew(None);
        manager.first_request_sent();
        assert!(manager.allow_request_sending());
    }

    #[test]
    fn test_delta_is_recorded_once() {
        let mut manager = ClockSkewManager::new();
        manager.first_request_sent();
        manager.set_clock_skew(Some("1500"));

        assert!(manager.allow_request_sending());
        assert!(manager.is_set());
        assert!(manager.should_add_clock_skew_headers());
        assert_eq!(manager.clock_skew_header_value(), "1500");

        manager.set_clock_skew(None);
        manager.set_clock_skew(Some("99"));
        assert!(manager.should_add_clock_skew_headers());
        assert_eq!(manager.clock_skew_header_value(), "1500");
    }

    #[test]
    fn test_missing_delta_drops_headers_but_unblocks() {
        let mut manager = ClockSkewManager::new();
        manager.first_request_sent();
        manager.set_clock_skew(Some(""));

        assert!(manager.allow_request_sending());
        assert!(!manager.should_add_clock_skew_headers());
        assert!(!manager.is_set());
    }

    #[test]
    fn test_resolved_before_first_send_never_blocks() {
        let mut manager = ClockSkewManager::new();
        manager.set_clock_skew(Some("10"));
        manager.first_request_sent();
        assert!(manager.allow_request_sending());
    }
}
