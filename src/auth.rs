//! Auth Orchestrator (C4): drives the interactive authentication handshake
//! and retries when the Connection Pool opens a new client.
//!
//! The `pending_requests` map keyed by request id, each holding a
//! `oneshot::Sender` the originating task awaits, is modeled directly on the
//! teacher's per-`CmdJob` responder (`session/mod.rs`'s `CmdJob::responder`)
//! generalized from "one responder per command" to "one responder per
//! in-flight credential request".

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;

use crate::error::{EngineError, Result};
use crate::events::{AuthStep, EngineEvent, EventBus};

/// The UI transport's reply to an `ssh:auth-request` event.
#[derive(Debug, Clone)]
pub struct AuthResponse {
    pub cancelled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub auth_type: Option<String>,
    pub remember: bool,
}

impl AuthResponse {
    pub fn cancel() -> Self {
        Self {
            cancelled: true,
            username: None,
            password: None,
            private_key_path: None,
            auth_type: None,
            remember: false,
        }
    }
}

/// Outcome of a full authentication attempt cycle.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<String>,
    pub remember: bool,
}

/// Per-request details the UI transport needs to render an `ssh:auth-request`.
pub struct AuthPrompt<'a> {
    pub tab_id: &'a str,
    pub step: AuthStep,
    pub host: &'a str,
    pub port: u16,
    pub fingerprint: Option<String>,
    pub fingerprint_changed: bool,
    pub require_credentials: bool,
    pub existing_username: Option<String>,
    pub is_retry: bool,
    pub error_message: Option<String>,
}

const MAX_RETRIES: u32 = 3;

/// Drives the IDLE → ASK_USER → APPLY → DONE/FAILED/CANCELLED state machine
/// per connection attempt. Exactly one pending request exists per tab id at
/// any instant; a response for an unknown request id is rejected.
pub struct AuthOrchestrator {
    events: EventBus,
    pending: Mutex<HashMap<String, oneshot::Sender<AuthResponse>>>,
    request_id_gen: AtomicU64,
    timeout: Duration,
    max_retries: u32,
}

impl AuthOrchestrator {
    pub fn new(events: EventBus, timeout: Duration, max_retries: u32) -> Self {
        Self {
            events,
            pending: Mutex::new(HashMap::new()),
            request_id_gen: AtomicU64::new(1),
            timeout,
            max_retries: max_retries.min(MAX_RETRIES),
        }
    }

    /// Issues an `ssh:auth-request` and suspends until the response arrives
    /// or the timeout elapses.
    pub async fn ask_user(&self, prompt: AuthPrompt<'_>) -> Result<AuthResponse> {
        let request_id = format!("auth-{}", self.request_id_gen.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("auth pending mutex poisoned")
            .insert(request_id.clone(), tx);

        self.events.publish(EngineEvent::AuthRequest {
            request_id: request_id.clone(),
            tab_id: prompt.tab_id.to_string(),
            step: prompt.step,
            host: prompt.host.to_string(),
            port: prompt.port,
            fingerprint: prompt.fingerprint,
            fingerprint_changed: prompt.fingerprint_changed,
            require_credentials: prompt.require_credentials,
            existing_username: prompt.existing_username,
            is_retry: prompt.is_retry,
            error_message: prompt.error_message,
        });

        let result = tokio::time::timeout(self.timeout, rx).await;
        self.pending
            .lock()
            .expect("auth pending mutex poisoned")
            .remove(&request_id);

        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EngineError::Internal(
                "auth response channel dropped".to_string(),
            )),
            Err(_) => Err(EngineError::AuthTimeout),
        }
    }

    /// Delivers a UI-transport `ssh:auth-response` to the waiting requester.
    /// Rejects unknown request ids so a stray/duplicate response cannot
    /// resolve the wrong attempt.
    pub fn submit_response(&self, request_id: &str, response: AuthResponse) -> Result<()> {
        let sender = self
            .pending
            .lock()
            .expect("auth pending mutex poisoned")
            .remove(request_id)
            .ok_or_else(|| EngineError::NotFound(format!("auth request {request_id}")))?;
        sender
            .send(response)
            .map_err(|_| EngineError::Internal("auth requester no longer waiting".to_string()))
    }

    /// Asks the UI transport to approve a host key fingerprint that no
    /// longer matches the Known-Hosts Cache. `Ok(())` means the user
    /// approved the new fingerprint; `Err(AuthCancelled)` means they
    /// rejected it and the connection attempt must not proceed.
    pub async fn confirm_host_key(
        &self,
        tab_id: &str,
        host: &str,
        port: u16,
        fingerprint: &str,
    ) -> Result<()> {
        let response = self
            .ask_user(AuthPrompt {
                tab_id,
                step: AuthStep::HostVerify,
                host,
                port,
                fingerprint: Some(fingerprint.to_string()),
                fingerprint_changed: true,
                require_credentials: false,
                existing_username: None,
                is_retry: false,
                error_message: None,
            })
            .await?;
        if response.cancelled {
            return Err(EngineError::AuthCancelled);
        }
        Ok(())
    }

    /// Runs the full state machine for one connection attempt. `apply`
    /// performs the actual credential application against the transport
    /// (e.g. an SSH authenticate call) and returns its raw error message on
    /// failure so it can be classified as auth vs. non-auth.
    pub async fn authenticate<F, Fut>(
        &self,
        tab_id: &str,
        host: &str,
        port: u16,
        mut username: Option<String>,
        mut password: Option<String>,
        mut private_key_path: Option<String>,
        mut apply: F,
    ) -> Result<AuthOutcome>
    where
        F: FnMut(String, Option<String>, Option<String>) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<(), String>>,
    {
        let mut retries = 0u32;
        let mut is_retry = false;
        let mut error_message = None;
        let mut remember = false;

        loop {
            let credentials_complete =
                username.is_some() && (password.is_some() || private_key_path.is_some());

            if !credentials_complete {
                debug!("auth: tab {tab_id} missing credentials, asking user");
                let response = self
                    .ask_user(AuthPrompt {
                        tab_id,
                        step: AuthStep::Credentials,
                        host,
                        port,
                        fingerprint: None,
                        fingerprint_changed: false,
                        require_credentials: true,
                        existing_username: username.clone(),
                        is_retry,
                        error_message: error_message.take(),
                    })
                    .await?;
                if response.cancelled {
                    return Err(EngineError::AuthCancelled);
                }
                username = response.username.or(username);
                password = response.password;
                private_key_path = response.private_key_path;
                remember = response.remember;
            }

            let user = username
                .clone()
                .ok_or_else(|| EngineError::Internal("username missing after ask_user".into()))?;

            debug!("auth: tab {tab_id} applying credentials (attempt {retries})");
            match apply(user.clone(), password.clone(), private_key_path.clone()).await {
                Ok(()) => {
                    debug!("auth: tab {tab_id} succeeded");
                    return Ok(AuthOutcome {
                        username: user,
                        password,
                        private_key_path,
                        remember,
                    });
                }
                Err(message) => match EngineError::classify_auth_error(&message) {
                    EngineError::AuthFailure(_) => {
                        retries += 1;
                        if retries > self.max_retries {
                            return Err(EngineError::AuthFailure(message));
                        }
                        is_retry = true;
                        error_message = Some(message);
                        password = None;
                        private_key_path = None;
                        continue;
                    }
                    other => return Err(other),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retries_on_auth_failure_then_succeeds() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let orchestrator = AuthOrchestrator::new(events, Duration::from_secs(5), 3);

        let orchestrator = std::sync::Arc::new(orchestrator);
        let responder = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                // Two bad passwords, then the correct one on the third ask.
                for password in ["bad", "bad", "good"] {
                    loop {
                        let event = rx.recv().await.unwrap();
                        if let EngineEvent::AuthRequest { request_id, .. } = event {
                            orchestrator
                                .submit_response(
                                    &request_id,
                                    AuthResponse {
                                        cancelled: false,
                                        username: Some("demo".to_string()),
                                        password: Some(password.to_string()),
                                        private_key_path: None,
                                        auth_type: None,
                                        remember: false,
                                    },
                                )
                                .unwrap();
                            break;
                        }
                    }
                }
            })
        };

        let mut attempts = 0;
        let outcome = orchestrator
            .authenticate(
                "tab1",
                "203.0.113.10",
                22,
                None,
                None,
                None,
                |_user, password, _key| {
                    attempts += 1;
                    let should_fail = password.as_deref() != Some("good");
                    async move {
                        if should_fail {
                            Err("permission denied (password)".to_string())
                        } else {
                            Ok(())
                        }
                    }
                },
            )
            .await;

        responder.await.unwrap();
        let outcome = outcome.expect("authentication should succeed after two retries");
        assert_eq!(outcome.password.as_deref(), Some("good"));
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn submit_response_rejects_unknown_request_id() {
        let orchestrator = AuthOrchestrator::new(EventBus::new(16), Duration::from_secs(1), 3);
        let result = orchestrator.submit_response("does-not-exist", AuthResponse::cancel());
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_response_yields_auth_cancelled() {
        let events = EventBus::new(16);
        let mut rx = events.subscribe();
        let orchestrator = std::sync::Arc::new(AuthOrchestrator::new(
            events,
            Duration::from_secs(5),
            3,
        ));

        let responder = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                let event = rx.recv().await.unwrap();
                if let EngineEvent::AuthRequest { request_id, .. } = event {
                    orchestrator
                        .submit_response(&request_id, AuthResponse::cancel())
                        .unwrap();
                }
            })
        };

        let outcome = orchestrator
            .authenticate(
                "tab1",
                "203.0.113.10",
                22,
                None,
                None,
                None,
                |_, _, _| async { Ok(()) },
            )
            .await;

        responder.await.unwrap();
        assert!(matches!(outcome, Err(EngineError::AuthCancelled)));
    }
}
