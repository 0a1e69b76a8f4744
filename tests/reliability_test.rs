use rask_telemetry_channel::reliability::{
    ClockSkewManager, KillSwitch, MAX_BACKOFF_MS, RetryPolicy, THIS_REQUEST_ONLY,
};
use std::time::Duration;

#[test]
fn test_retryable_status_taxonomy() {
    for status in [0, 408, 429, 500, 502, 503, 504] {
        assert!(RetryPolicy::should_retry_for_status(status), "status {status}");
    }
    for status in [300, 400, 401, 403, 404, 413, 501, 505] {
        assert!(!RetryPolicy::should_retry_for_status(status), "status {status}");
    }
}

#[test]
fn test_backoff_grows_and_is_capped() {
    for retries in 0..4 {
        let wait = RetryPolicy::millis_to_backoff_for_retry(retries);
        let factor = 2u64.pow(retries);
        assert!(wait >= 2400 * factor, "retry {retries}: {wait}");
        assert!(wait < 3600 * factor, "retry {retries}: {wait}");
    }

    assert_eq!(RetryPolicy::millis_to_backoff_for_retry(20), MAX_BACKOFF_MS);
    assert_eq!(RetryPolicy::millis_to_backoff_for_retry(200), MAX_BACKOFF_MS);
    assert!(RetryPolicy::backoff_for_retry(40) <= Duration::from_millis(MAX_BACKOFF_MS));
}

#[tokio::test(start_paused = true)]
async fn test_kill_switch_lifecycle() {
    let mut switch = KillSwitch::new();

    let killed = switch.set_kill_switch_tenants(Some(" tenantA , tenantB,"), Some("30"));
    assert_eq!(killed, vec!["tenantA".to_string(), "tenantB".to_string()]);
    assert!(switch.is_tenant_killed("tenantA"));
    assert!(!switch.is_tenant_killed("tenantC"));

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert!(!switch.is_tenant_killed("tenantA"));
    assert!(!switch.is_tenant_killed("tenantB"));
}

#[tokio::test(start_paused = true)]
async fn test_kill_switch_request_only_and_invalid_durations() {
    let mut switch = KillSwitch::new();

    let killed = switch.set_kill_switch_tenants(Some("tenantA"), Some(THIS_REQUEST_ONLY));
    assert_eq!(killed, vec!["tenantA".to_string()]);
    assert!(!switch.is_tenant_killed("tenantA"));

    assert!(switch.set_kill_switch_tenants(Some("tenantA"), Some("soon")).is_empty());
    assert!(switch.set_kill_switch_tenants(Some("tenantA"), None).is_empty());
    assert!(switch.set_kill_switch_tenants(None, Some("60")).is_empty());
    assert!(!switch.is_tenant_killed("tenantA"));
}

#[test]
fn test_clock_skew_probe_with_delta() {
    let mut skew = ClockSkewManager::new();
    assert!(skew.allow_request_sending());
    assert!(skew.should_add_clock_skew_headers());
    assert_eq!(skew.clock_skew_header_value(), "use-collector-delta");

    skew.first_request_sent();
    assert!(!skew.allow_request_sending());

    skew.set_clock_skew(Some("-1250"));
    assert!(skew.allow_request_sending());
    assert!(skew.is_set());
    assert_eq!(skew.clock_skew_header_value(), "-1250");

    // Once learned, the delta sticks.
    skew.set_clock_skew(Some("99"));
    skew.set_clock_skew(None);
    assert_eq!(skew.clock_skew_header_value(), "-1250");
    assert!(skew.should_add_clock_skew_headers());
}

#[test]
fn test_clock_skew_probe_without_delta() {
    let mut skew = ClockSkewManager::new();
    skew.first_request_sent();
    skew.set_clock_skew(None);

    assert!(skew.allow_request_sending());
    assert!(!skew.is_set());
    assert!(!skew.should_add_clock_skew_headers());

    // Only the first request is a probe.
    skew.first_request_sent();
    assert!(skew.allow_request_sending());
}
