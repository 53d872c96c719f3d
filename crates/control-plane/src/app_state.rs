use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;

use crate::{
    backup::BackupOrchestrator,
    config::{BackupsConfig, TunnelConfig},
    directory::Directory,
    file_tunnel::FileTunnel,
    tunnel::TunnelRegistry,
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: TunnelRegistry,
    pub file_tunnel: FileTunnel,
    pub transfers: BackupOrchestrator,
    pub directory: Arc<dyn Directory>,
    pub agent_auth: AgentAuth,
    pub tunnel: TunnelConfig,
    pub backups: BackupsConfig,
    pub metrics_handle: PrometheusHandle,
}

/// Agent bearer token verification.
#[derive(Clone)]
pub struct AgentAuth {
    tokens: Arc<Vec<String>>,
}

impl AgentAuth {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    pub fn verify(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| {
            if token.len() != candidate.len() {
                return false;
            }
            token.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_auth_checks_exact_tokens() {
        let auth = AgentAuth::new(vec!["agent-token".to_string(), "other".to_string()]);

        assert!(auth.verify("agent-token"));
        assert!(auth.verify("other"));
        assert!(!auth.verify("agent-token-2"));
        assert!(!auth.verify("AGENT-TOKEN"));
        assert!(!auth.verify(""));
    }
}
