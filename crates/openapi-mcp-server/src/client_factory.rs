//! Caches upstream clients: one optional global client bound to env
//! credentials, plus one client per transport session keyed by the session's
//! own token.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use secrecy::SecretString;
use tracing::debug;

use crate::errors::GatewayError;
use crate::profile::InterceptorConfig;
use crate::sanitize::Sanitizer;
use crate::upstream::UpstreamClient;

pub struct HttpClientFactory {
    config: InterceptorConfig,
    request_timeout: Duration,
    sanitizer: Sanitizer,
    global: RwLock<Option<Arc<UpstreamClient>>>,
    sessions: RwLock<HashMap<String, Arc<UpstreamClient>>>,
}

impl HttpClientFactory {
    pub fn new(
        config: InterceptorConfig,
        request_timeout: Duration,
        sanitizer: Sanitizer,
    ) -> Self {
        Self {
            config,
            request_timeout,
            sanitizer,
            global: RwLock::new(None),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Build the env-credential client shared by stdio deployments. Called
    /// at most once; a missing required token fails startup here rather than
    /// on the first call.
    pub fn create_global(&self) -> Result<Arc<UpstreamClient>, GatewayError> {
        let mut slot = self
            .global
            .write()
            .map_err(|_| GatewayError::configuration("client factory lock poisoned"))?;
        if slot.is_some() {
            return Err(GatewayError::configuration(
                "global upstream client initialized twice",
            ));
        }
        let client = Arc::new(UpstreamClient::build(
            &self.config,
            None,
            self.request_timeout,
            self.sanitizer.clone(),
        )?);
        *slot = Some(client.clone());
        Ok(client)
    }

    pub fn global(&self) -> Option<Arc<UpstreamClient>> {
        self.global.read().ok().and_then(|slot| slot.clone())
    }

    /// The cached client for a session, or a fresh one bound to the
    /// session's token. Simultaneous callers for the same id observe the
    /// same instance.
    pub fn get_or_create_for_session(
        &self,
        session_id: &str,
        session_token: Option<SecretString>,
    ) -> Result<Arc<UpstreamClient>, GatewayError> {
        if let Ok(sessions) = self.sessions.read() {
            if let Some(client) = sessions.get(session_id) {
                return Ok(client.clone());
            }
        }

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| GatewayError::configuration("client factory lock poisoned"))?;
        // Double-checked: another caller may have built it while we waited.
        if let Some(client) = sessions.get(session_id) {
            return Ok(client.clone());
        }
        let client = Arc::new(UpstreamClient::build(
            &self.config,
            session_token,
            self.request_timeout,
            self.sanitizer.clone(),
        )?);
        sessions.insert(session_id.to_string(), client.clone());
        debug!(session_id, "created upstream client for session");
        Ok(client)
    }

    /// Drop a session's client. Wired into the session store's destruction
    /// listeners; safe to call for unknown ids.
    pub fn destroy(&self, session_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if sessions.remove(session_id).is_some() {
                debug!(session_id, "released upstream client for session");
            }
        }
    }

    pub fn session_client_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn factory() -> Arc<HttpClientFactory> {
        Arc::new(HttpClientFactory::new(
            InterceptorConfig::default(),
            Duration::from_secs(5),
            Sanitizer::default(),
        ))
    }

    fn factory_with_auth() -> Arc<HttpClientFactory> {
        let config: InterceptorConfig = serde_json::from_value(json!({
            "auth": { "type": "bearer", "value_from_env": "SOME_UNSET_TOKEN_VAR_XYZ" }
        }))
        .unwrap();
        Arc::new(HttpClientFactory::new(
            config,
            Duration::from_secs(5),
            Sanitizer::default(),
        ))
    }

    #[test]
    fn global_client_is_created_once() {
        let factory = factory();
        assert!(factory.global().is_none());
        factory.create_global().unwrap();
        assert!(factory.global().is_some());
        assert!(factory.create_global().is_err());
    }

    #[test]
    fn missing_env_token_fails_global_creation() {
        let factory = factory_with_auth();
        let err = factory.create_global().unwrap_err();
        assert!(matches!(err, GatewayError::Authentication { .. }));
        assert!(err.to_string().contains("SOME_UNSET_TOKEN_VAR_XYZ"));
    }

    #[test]
    fn session_token_satisfies_required_auth() {
        let factory = factory_with_auth();
        let client = factory.get_or_create_for_session(
            "sess-1",
            Some(SecretString::from("token".to_string())),
        );
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_instance() {
        let factory = factory();
        let (a, b) = tokio::join!(
            {
                let factory = factory.clone();
                tokio::task::spawn_blocking(move || {
                    factory.get_or_create_for_session("sess-1", None).unwrap()
                })
            },
            {
                let factory = factory.clone();
                tokio::task::spawn_blocking(move || {
                    factory.get_or_create_for_session("sess-1", None).unwrap()
                })
            }
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(factory.session_client_count(), 1);
    }

    #[test]
    fn destroy_is_idempotent() {
        let factory = factory();
        factory.get_or_create_for_session("sess-1", None).unwrap();
        assert_eq!(factory.session_client_count(), 1);
        factory.destroy("sess-1");
        factory.destroy("sess-1");
        assert_eq!(factory.session_client_count(), 0);
    }

    #[test]
    fn different_sessions_get_different_clients() {
        let factory = factory();
        let a = factory.get_or_create_for_session("sess-1", None).unwrap();
        let b = factory.get_or_create_for_session("sess-2", None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
