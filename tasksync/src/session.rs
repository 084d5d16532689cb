use serde::{Deserialize, Serialize};
use tasksync_core::{ApiErrorClass, AuthClient, AuthError, AuthUser, SessionToken, SignUp};
use thiserror::Error;
use tokio::sync::{Mutex, watch};

use crate::storage::{SessionFile, SessionFileError};
use crate::sync::identity::{Identity, IdentityProvider};

const REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not signed in")]
    SignedOut,
    #[error("auth request failed: {0}")]
    Auth(#[from] AuthError),
    #[error("session storage failed: {0}")]
    Storage(#[from] SessionFileError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<i64>,
    pub user: AuthUser,
}

impl SessionState {
    pub fn from_token(token: &SessionToken) -> Self {
        let expires_at = token.expires_at.or_else(|| {
            token
                .expires_in
                .map(|secs| now_unix().saturating_add(secs as i64))
        });
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at,
            user: token.user.clone(),
        }
    }

    pub fn identity(&self) -> Identity {
        Identity {
            id: self.user.id.clone(),
            email: self.user.email.clone(),
        }
    }

    fn expires_within(&self, skew_secs: i64) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        expires_at <= now_unix().saturating_add(skew_secs)
    }
}

/// Holds the signed-in session, refreshes its access token on demand and
/// publishes the resulting identity.
pub struct AuthSession {
    client: AuthClient,
    file: Option<SessionFile>,
    state: Mutex<Option<SessionState>>,
    identity: watch::Sender<Option<Identity>>,
}

impl AuthSession {
    pub fn new(client: AuthClient, file: Option<SessionFile>) -> Self {
        let (identity, _) = watch::channel(None);
        Self {
            client,
            file,
            state: Mutex::new(None),
            identity,
        }
    }

    /// Loads a previously persisted session, if any.
    pub async fn restore(&self) -> Result<Option<Identity>, SessionError> {
        let Some(file) = &self.file else {
            return Ok(None);
        };
        let Some(state) = file.load().await? else {
            return Ok(None);
        };
        let identity = state.identity();
        tracing::debug!(user = %identity.id, "restored saved session");
        self.install(state).await;
        Ok(Some(identity))
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Identity, SessionError> {
        let token = self.client.sign_in_with_password(email, password).await?;
        let state = SessionState::from_token(&token);
        let identity = state.identity();
        self.persist(&state).await;
        self.install(state).await;
        tracing::info!(user = %identity.id, "signed in");
        Ok(identity)
    }

    /// Returns `None` when the account still awaits email confirmation.
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<Identity>, SessionError> {
        match self.client.sign_up(email, password).await? {
            SignUp::Session(token) => {
                let state = SessionState::from_token(&token);
                let identity = state.identity();
                self.persist(&state).await;
                self.install(state).await;
                tracing::info!(user = %identity.id, "signed up");
                Ok(Some(identity))
            }
            SignUp::PendingConfirmation(user) => {
                tracing::info!(user = %user.id, "sign-up awaits email confirmation");
                Ok(None)
            }
        }
    }

    /// Clears the local session first; the remote logout is best effort.
    pub async fn sign_out(&self) -> Result<(), SessionError> {
        let previous = self.clear().await;
        if let Some(state) = previous
            && let Err(err) = self.client.sign_out(&state.access_token).await
        {
            tracing::warn!(error = %err, "remote sign-out failed");
        }
        Ok(())
    }

    pub async fn install(&self, state: SessionState) {
        let identity = state.identity();
        *self.state.lock().await = Some(state);
        self.publish(Some(identity));
    }

    /// Access token for the current session, refreshed first when it expires
    /// within a minute. A refresh the server rejects ends the session.
    pub async fn access_token(&self) -> Result<String, SessionError> {
        let mut guard = self.state.lock().await;
        let Some(state) = guard.as_ref() else {
            return Err(SessionError::SignedOut);
        };
        if !state.expires_within(REFRESH_SKEW_SECS) {
            return Ok(state.access_token.clone());
        }

        let refresh_token = state.refresh_token.clone();
        match self.client.refresh_session(&refresh_token).await {
            Ok(token) => {
                let refreshed = SessionState::from_token(&token);
                self.persist(&refreshed).await;
                let access_token = refreshed.access_token.clone();
                let identity = refreshed.identity();
                *guard = Some(refreshed);
                drop(guard);
                self.publish(Some(identity));
                Ok(access_token)
            }
            Err(err) => {
                let rejected = matches!(
                    err.classification(),
                    Some(ApiErrorClass::Auth | ApiErrorClass::Permanent)
                );
                if rejected {
                    tracing::warn!(error = %err, "session refresh rejected, signing out");
                    *guard = None;
                    drop(guard);
                    self.forget().await;
                    self.publish(None);
                } else {
                    tracing::warn!(error = %err, "session refresh failed");
                }
                Err(err.into())
            }
        }
    }

    async fn clear(&self) -> Option<SessionState> {
        let previous = self.state.lock().await.take();
        self.forget().await;
        self.publish(None);
        previous
    }

    async fn persist(&self, state: &SessionState) {
        if let Some(file) = &self.file
            && let Err(err) = file.save(state).await
        {
            tracing::warn!(path = %file.path().display(), error = %err, "failed to save session");
        }
    }

    async fn forget(&self) {
        if let Some(file) = &self.file
            && let Err(err) = file.delete().await
        {
            tracing::warn!(path = %file.path().display(), error = %err, "failed to remove session");
        }
    }

    fn publish(&self, identity: Option<Identity>) {
        self.identity.send_if_modified(|current| {
            if *current == identity {
                false
            } else {
                *current = identity;
                true
            }
        });
    }
}

impl IdentityProvider for AuthSession {
    fn current(&self) -> Option<Identity> {
        self.identity.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<Identity>> {
        self.identity.subscribe()
    }
}

fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session_body(access: &str, refresh: &str) -> serde_json::Value {
        json!({
            "access_token": access,
            "token_type": "bearer",
            "expires_in": 3600,
            "refresh_token": refresh,
            "user": { "id": "u1", "email": "ann@example.com" }
        })
    }

    fn expired_state() -> SessionState {
        SessionState {
            access_token: "old-token".into(),
            refresh_token: "refresh-1".into(),
            expires_at: Some(0),
            user: AuthUser {
                id: "u1".into(),
                email: None,
            },
        }
    }

    #[tokio::test]
    async fn returns_current_token_when_not_expired() {
        let server = MockServer::start().await;
        let session = AuthSession::new(AuthClient::new(&server.uri(), "anon").unwrap(), None);
        session
            .install(SessionState {
                expires_at: Some(i64::MAX),
                ..expired_state()
            })
            .await;

        assert_eq!(session.access_token().await.unwrap(), "old-token");
    }

    #[tokio::test]
    async fn refreshes_token_when_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_json(json!({ "refresh_token": "refresh-1" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(session_body("new-token", "refresh-2")),
            )
            .expect(1)
            .mount(&server)
            .await;

        let session = AuthSession::new(AuthClient::new(&server.uri(), "anon").unwrap(), None);
        session.install(expired_state()).await;

        assert_eq!(session.access_token().await.unwrap(), "new-token");
        // Fresh token is reused without another round trip.
        assert_eq!(session.access_token().await.unwrap(), "new-token");
    }

    #[tokio::test]
    async fn rejected_refresh_signs_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid refresh token"))
            .mount(&server)
            .await;

        let session = AuthSession::new(AuthClient::new(&server.uri(), "anon").unwrap(), None);
        session.install(expired_state()).await;
        let mut changes = session.changes();
        assert!(session.current().is_some());

        assert!(matches!(
            session.access_token().await,
            Err(SessionError::Auth(_))
        ));
        assert!(changes.has_changed().unwrap());
        assert_eq!(*changes.borrow_and_update(), None);
        assert!(matches!(
            session.access_token().await,
            Err(SessionError::SignedOut)
        ));
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let session = AuthSession::new(AuthClient::new(&server.uri(), "anon").unwrap(), None);
        session.install(expired_state()).await;

        assert!(session.access_token().await.is_err());
        assert_eq!(session.current().map(|i| i.id), Some("u1".to_string()));
    }

    #[tokio::test]
    async fn sign_in_persists_and_restore_reads_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(session_body("access-1", "refresh-1")),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("session.json"));
        let session = AuthSession::new(
            AuthClient::new(&server.uri(), "anon").unwrap(),
            Some(file.clone()),
        );
        let identity = session.sign_in("ann@example.com", "pw").await.unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.email.as_deref(), Some("ann@example.com"));

        let restored = AuthSession::new(
            AuthClient::new(&server.uri(), "anon").unwrap(),
            Some(file),
        );
        assert_eq!(restored.restore().await.unwrap(), Some(identity));
        assert_eq!(restored.access_token().await.unwrap(), "access-1");
    }

    #[tokio::test]
    async fn sign_out_clears_identity_and_file_even_if_remote_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .and(header("authorization", "Bearer old-token"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("session.json"));
        file.save(&expired_state()).await.unwrap();
        let session = AuthSession::new(
            AuthClient::new(&server.uri(), "anon").unwrap(),
            Some(file.clone()),
        );
        session.restore().await.unwrap();

        session.sign_out().await.unwrap();
        assert_eq!(session.current(), None);
        assert!(file.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sign_up_pending_confirmation_leaves_identity_empty() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/signup"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "u2",
                "email": "bob@example.com"
            })))
            .mount(&server)
            .await;

        let session = AuthSession::new(AuthClient::new(&server.uri(), "anon").unwrap(), None);
        assert_eq!(session.sign_up("bob@example.com", "pw").await.unwrap(), None);
        assert_eq!(session.current(), None);
    }
}
