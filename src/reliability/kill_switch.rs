use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Duration value asking the client to drop the named tenants for the current response only.
pub const THIS_REQUEST_ONLY: &str = "this-request-only";

/// Server-driven, time-bounded suppression of tenants.
#[derive(Debug, Default)]
pub struct KillSwitch {
    killed: HashMap<String, Instant>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies a `kill-tokens` / `kill-duration` header pair and returns the tenants it names.
    ///
    /// Tokens are comma separated and trimmed. The duration is whole seconds, or
    /// [`THIS_REQUEST_ONLY`] to return the tenants without remembering them.
    pub fn set_kill_switch_tenants(
        &mut self,
        kill_tokens: Option<&str>,
        kill_duration: Option<&str>,
    ) -> Vec<String> {
        let (Some(tokens), Some(duration)) = (kill_tokens, kill_duration) else {
            return Vec::new();
        };

        let tenants: Vec<String> = tokens
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .collect();

        let duration = duration.trim();
        if duration == THIS_REQUEST_ONLY {
            return tenants;
        }

        let seconds: u64 = match duration.parse() {
            Ok(seconds) => seconds,
            Err(e) => {
                warn!("Ignoring kill switch with invalid duration '{}': {}", duration, e);
                return Vec::new();
            }
        };

        let expiry = Instant::now() + Duration::from_secs(seconds);
        for tenant in &tenants {
            warn!("Tenant {} kill-switched for {}s", tenant, seconds);
            self.killed.insert(tenant.clone(), expiry);
        }
        tenants
    }

    /// Whether `tenant_key` is currently suppressed. Expired entries are pruned on lookup.
    pub fn is_tenant_killed(&mut self, tenant_key: &str) -> bool {
        match self.killed.get(tenant_key) {
            Some(expiry) if Instant::now() < *expiry => true,
            Some(_) => {
                self.killed.remove(tenant_key);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tenants_expire_after_duration() {
        let mut switch = KillSwitch::new();
        let killed = switch.set_kill_switch_tenants(Some("tenantA, tenantB"), Some("60"));
        assert_eq!(killed, vec!["tenantA".to_string(), "tenantB".to_string()]);
        assert!(switch.is_tenant_killed("tenantA"));
        assert!(switch.is_tenant_killed("tenantB"));
        assert!(!switch.is_tenant_killed("tenantC"));

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(switch.is_tenant_killed("tenantA"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!switch.is_tenant_killed("tenantA"));
        assert!(!switch.is_tenant_killed("tenantB"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_this_request_only_is_not_remembered() {
        let mut switch = KillSwitch::new();
        let killed = switch.set_kill_switch_tenants(Some("tenantA"), Some(THIS_REQUEST_ONLY));
        assert_eq!(killed, vec!["tenantA".to_string()]);
        assert!(!switch.is_tenant_killed("tenantA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_or_invalid_headers_are_ignored() {
        let mut switch = KillSwitch::new();
        assert!(switch.set_kill_switch_tenants(Some("tenantA"), None).is_empty());
        assert!(switch.set_kill_switch_tenants(None, Some("60")).is_empty());
        assert!(switch.set_kill_switch_tenants(Some("tenantA"), Some("soon")).is_empty());
        assert!(!switch.is_tenant_killed("tenantA"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_expiry() {
        let mut switch = KillSwitch::new();
        switch.set_kill_switch_tenants(Some("tenantA"), Some("10"));
        tokio::time::advance(Duration::from_secs(8)).await;
        switch.set_kill_switch_tenants(Some("tenantA"), Some("10"));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(switch.is_tenant_killed("tenantA"));
    }
}
