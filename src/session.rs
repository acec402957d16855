//! Session coordinator: PKCE sign-in, token refresh and the credential
//! lifecycle.
//!
//! ```text
//! Unauthenticated --begin_login--> AwaitingRedirect --complete_login--> Authenticated
//! AwaitingRedirect --login failure--> Unauthenticated
//! Authenticated --auth error--> Refreshing --ok--> Authenticated
//! Refreshing --failure--> Unauthenticated (credentials wiped, restart requested)
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use gitlab_api::auth::{authorize_url, extract_code};
use gitlab_api::{
    normalize_host, CurrentUser, GitlabClient, GitlabConfig, OAuthClient, OAuthSettings,
    PkceChallenge, Url,
};
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::{SessionError, SessionResult};
use crate::events::{AppEvent, EventSink};
use crate::poll_guard::PollGuards;
use crate::redact_log_details;
use crate::secrets::{CredentialStore, Credentials, StoreKey, StoredProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    AwaitingRedirect,
    Authenticated,
    Refreshing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This call performed the token exchange.
    Refreshed,
    /// Another refresh already replaced the token this call observed.
    Coalesced,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub oauth: OAuthSettings,
    pub default_host: String,
    pub custom_cert_path: Option<String>,
    pub request_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config, client_id: impl Into<String>) -> Self {
        let client_id = config.client_id.clone().unwrap_or_else(|| client_id.into());
        Self {
            oauth: OAuthSettings::new(client_id)
                .with_redirect_uri(config.redirect_uri.clone())
                .with_scope(config.scope.clone()),
            default_host: normalize_host(&config.host),
            custom_cert_path: config.custom_cert_path.clone(),
            request_timeout: config.request_timeout(),
        }
    }
}

struct PendingLogin {
    pkce: PkceChallenge,
    host: String,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: CredentialStore,
    settings: SessionSettings,
    state: Mutex<SessionState>,
    pending: Mutex<Option<PendingLogin>>,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
    refresh_in_progress: AtomicBool,
    guards: PollGuards,
    events: EventSink,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionManager {
    pub fn new(
        store: CredentialStore,
        settings: SessionSettings,
        guards: PollGuards,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                settings,
                state: Mutex::new(SessionState::Unauthenticated),
                pending: Mutex::new(None),
                refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
                refresh_in_progress: AtomicBool::new(false),
                guards,
                events,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    fn set_state(&self, state: SessionState) {
        let mut current = lock(&self.inner.state);
        if *current != state {
            debug!("Session state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Authenticated | SessionState::Refreshing
        )
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.refresh_in_progress.load(Ordering::SeqCst)
    }

    pub fn guards(&self) -> &PollGuards {
        &self.inner.guards
    }

    pub fn store(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    pub fn profile(&self) -> SessionResult<Option<StoredProfile>> {
        self.inner.store.profile().map_err(SessionError::Store)
    }

    /// Picks up credentials persisted by a previous run.
    pub fn restore(&self) -> SessionResult<bool> {
        let restored = self
            .inner
            .store
            .credentials()
            .map_err(SessionError::Store)?
            .is_some();
        if restored {
            info!("Restored stored session");
            self.set_state(SessionState::Authenticated);
        }
        Ok(restored)
    }

    /// Starts a sign-in attempt and returns the URL to open in a browser.
    /// Every call generates a fresh verifier; an older attempt is discarded.
    pub fn begin_login(&self, host: Option<&str>) -> SessionResult<Url> {
        self.begin_login_with(host, PkceChallenge::generate())
    }

    fn begin_login_with(&self, host: Option<&str>, pkce: PkceChallenge) -> SessionResult<Url> {
        let host = normalize_host(host.unwrap_or(&self.inner.settings.default_host));
        let url = authorize_url(&host, &self.inner.settings.oauth, &pkce)?;
        *lock(&self.inner.pending) = Some(PendingLogin { pkce, host });
        // A live session keeps polling until the new attempt completes.
        if !self.is_authenticated() {
            self.set_state(SessionState::AwaitingRedirect);
        }
        info!("Sign-in started");
        Ok(url)
    }

    /// Finishes the sign-in started by [`Self::begin_login`] once the browser
    /// lands on the redirect URL carrying `?code=`.
    pub async fn complete_login(&self, redirect: &str) -> SessionResult<CurrentUser> {
        let result = self.try_complete_login(redirect).await;
        if let Err(err) = &result {
            warn!("Sign-in failed: {}", redact_log_details(&err.to_string()));
            if !self.is_authenticated() {
                self.set_state(SessionState::Unauthenticated);
            }
            self.inner.events.emit(AppEvent::SignInRequired {
                reason: err.to_string(),
            });
        }
        result
    }

    async fn try_complete_login(&self, redirect: &str) -> SessionResult<CurrentUser> {
        let pending = lock(&self.inner.pending)
            .take()
            .ok_or(SessionError::NoPendingLogin)?;
        let code = extract_code(redirect).ok_or_else(|| {
            SessionError::LoginFailed("redirect did not carry an authorization code".into())
        })?;

        let cert = self.inner.settings.custom_cert_path.clone();
        let tokens = self
            .oauth_client(&pending.host, cert.as_deref())?
            .exchange_code(&code, pending.pkce.verifier())
            .await
            .map_err(|err| SessionError::LoginFailed(err.to_string()))?;

        let access_token = tokens
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                SessionError::LoginFailed("token response did not include an access token".into())
            })?;
        let refresh_token = tokens.refresh_token.filter(|token| !token.trim().is_empty());

        self.finalize_session(
            &access_token,
            &pending.host,
            cert.as_deref(),
            refresh_token.as_deref(),
        )
        .await
    }

    /// Verifies a token against `/user` and persists the session only when
    /// the profile carries an id and a username.
    pub async fn finalize_session(
        &self,
        access_token: &str,
        host: &str,
        custom_cert_path: Option<&str>,
        refresh_token: Option<&str>,
    ) -> SessionResult<CurrentUser> {
        let host = normalize_host(host);
        let client = self.build_client(access_token, &host, custom_cert_path)?;
        let user = client
            .current_user()
            .await
            .map_err(|err| SessionError::LoginFailed(err.to_string()))?;
        if !user.is_valid() {
            return Err(SessionError::LoginFailed(
                "user endpoint did not return an id and username".into(),
            ));
        }

        let username = user.username.clone().unwrap_or_default();
        let plan = match client.namespace(&username).await {
            Ok(namespace) => namespace.plan,
            Err(err) => {
                debug!("Plan lookup skipped: {}", redact_log_details(&err.to_string()));
                None
            }
        };

        let store = &self.inner.store;
        let profile = StoredProfile {
            user_id: user.id.unwrap_or_default(),
            username: username.clone(),
            plan,
        };
        let credentials = Credentials {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.map(ToString::to_string),
            host,
            custom_cert_path: custom_cert_path.map(ToString::to_string),
        };
        // Credentials go last: `restore` accepts whatever tokens it finds.
        let persisted = store
            .save_profile(&profile)
            .and_then(|()| store.save_credentials(&credentials));
        if let Err(err) = persisted {
            if let Err(cleanup) = store.clear_session() {
                warn!("Failed to clear partial session: {}", cleanup);
            }
            self.set_state(SessionState::Unauthenticated);
            return Err(SessionError::Store(err));
        }

        self.set_state(SessionState::Authenticated);
        self.inner.guards.reset_all();
        info!("Signed in as {}", username);
        self.inner
            .events
            .emit(AppEvent::SessionStarted { username });
        Ok(user)
    }

    /// Exchanges the stored refresh token for a new pair. Calls that overlap
    /// an in-flight refresh wait for it and return `Coalesced` without
    /// contacting the token endpoint.
    pub async fn refresh(&self) -> SessionResult<RefreshOutcome> {
        let observed = self.access_token()?;
        self.refresh_after(observed).await
    }

    async fn refresh_after(&self, observed: Option<String>) -> SessionResult<RefreshOutcome> {
        if observed.is_none() {
            return Err(SessionError::NotAuthenticated);
        }

        let permit = self.inner.refresh_lock.clone().lock_owned().await;
        match self.access_token()? {
            None => return Err(SessionError::NotAuthenticated),
            Some(current) if Some(&current) != observed.as_ref() => {
                debug!("Refresh coalesced with a completed refresh");
                return Ok(RefreshOutcome::Coalesced);
            }
            Some(_) => {}
        }

        self.inner.refresh_in_progress.store(true, Ordering::SeqCst);
        self.set_state(SessionState::Refreshing);

        // The exchange owns the lock and runs detached, so a caller that is
        // cancelled mid-refresh neither strands the state nor loses the
        // rotated tokens.
        let session = self.clone();
        let exchange = tokio::spawn(async move {
            let _permit = permit;
            let _in_flight = RefreshInFlight(session.clone());
            session.run_refresh().await
        });
        exchange
            .await
            .map_err(|err| SessionError::RefreshFailed(err.to_string()))?
    }

    async fn run_refresh(self) -> SessionResult<RefreshOutcome> {
        match self.exchange_refresh_token().await {
            Ok(()) => {
                self.set_state(SessionState::Authenticated);
                self.inner.guards.reset_all();
                info!("Access token refreshed");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(reason) => {
                self.hard_logout(&reason);
                Err(SessionError::RefreshFailed(reason))
            }
        }
    }

    async fn exchange_refresh_token(&self) -> Result<(), String> {
        let credentials = self
            .inner
            .store
            .credentials()?
            .ok_or_else(|| "no stored session".to_string())?;
        let refresh_token = credentials
            .refresh_token
            .ok_or_else(|| "no refresh token stored".to_string())?;

        let pair = self
            .oauth_client(&credentials.host, credentials.custom_cert_path.as_deref())
            .map_err(|err| err.to_string())?
            .refresh(&refresh_token)
            .await
            .map_err(|err| err.to_string())?
            .into_pair()
            .ok_or_else(|| "token response did not include both tokens".to_string())?;

        self.inner
            .store
            .save_tokens(&pair.access_token, &pair.refresh_token)
    }

    /// Wipes every session key and asks the main loop to restart the process.
    fn hard_logout(&self, reason: &str) {
        warn!("Ending session: {}", redact_log_details(reason));
        if let Err(err) = self.inner.store.clear_session() {
            warn!("Failed to clear stored session: {}", err);
        }
        *lock(&self.inner.pending) = None;
        self.set_state(SessionState::Unauthenticated);
        self.inner.events.emit(AppEvent::SignInRequired {
            reason: reason.to_string(),
        });
        self.inner.events.emit(AppEvent::RestartRequested {
            reason: "session refresh failed".to_string(),
        });
    }

    pub fn logout(&self) -> SessionResult<()> {
        self.inner
            .store
            .clear_session()
            .map_err(SessionError::Store)?;
        *lock(&self.inner.pending) = None;
        self.set_state(SessionState::Unauthenticated);
        self.inner.guards.reset_all();
        info!("Signed out");
        Ok(())
    }

    /// Persists a new certificate path. The HTTP stack picks it up only on
    /// start, so a restart is requested.
    pub fn set_custom_cert_path(&self, path: Option<&str>) -> SessionResult<()> {
        let store = &self.inner.store;
        match path.map(str::trim).filter(|value| !value.is_empty()) {
            Some(path) => store.set(StoreKey::CustomCertPath, path),
            None => store.delete(StoreKey::CustomCertPath),
        }
        .map_err(SessionError::Store)?;
        self.inner.events.emit(AppEvent::RestartRequested {
            reason: "custom certificate changed".to_string(),
        });
        Ok(())
    }

    fn access_token(&self) -> SessionResult<Option<String>> {
        self.inner
            .store
            .get(StoreKey::AccessToken)
            .map_err(SessionError::Store)
    }

    /// API client bound to the stored credentials.
    pub fn client(&self) -> SessionResult<GitlabClient> {
        let credentials = self
            .inner
            .store
            .credentials()
            .map_err(SessionError::Store)?
            .ok_or(SessionError::NotAuthenticated)?;
        self.build_client(
            &credentials.access_token,
            &credentials.host,
            credentials.custom_cert_path.as_deref(),
        )
    }

    /// Runs `op` with a fresh client. When the token is rejected, refreshes
    /// the session and re-issues `op` once with the new token.
    pub async fn with_auth_retry<T, F, Fut>(&self, op: F) -> SessionResult<T>
    where
        F: Fn(GitlabClient) -> Fut,
        Fut: Future<Output = gitlab_api::Result<T>>,
    {
        let client = self.client()?;
        let used_token = client.config().token.clone();
        match op(client).await {
            Err(err) if err.is_auth_error() => {
                info!("Access token rejected, refreshing session");
                self.refresh_after(Some(used_token)).await?;
                let client = self.client()?;
                op(client).await.map_err(SessionError::from)
            }
            other => other.map_err(SessionError::from),
        }
    }

    fn build_client(
        &self,
        access_token: &str,
        host: &str,
        custom_cert_path: Option<&str>,
    ) -> SessionResult<GitlabClient> {
        let config = self.gitlab_config(access_token, host, custom_cert_path);
        Ok(GitlabClient::new(config)?)
    }

    fn oauth_client(
        &self,
        host: &str,
        custom_cert_path: Option<&str>,
    ) -> gitlab_api::Result<OAuthClient> {
        let config = self.gitlab_config("", host, custom_cert_path);
        OAuthClient::new(&config, self.inner.settings.oauth.clone())
    }

    fn gitlab_config(
        &self,
        token: &str,
        host: &str,
        custom_cert_path: Option<&str>,
    ) -> GitlabConfig {
        let mut config =
            GitlabConfig::new(token, host).with_timeout(self.inner.settings.request_timeout);
        if let Some(path) = custom_cert_path {
            config = config.with_custom_cert_path(path);
        }
        config
    }
}

/// Clears the refresh flag when the exchange ends, however it ends.
struct RefreshInFlight(SessionManager);

impl Drop for RefreshInFlight {
    fn drop(&mut self) {
        self.0.inner.refresh_in_progress.store(false, Ordering::SeqCst);
        if self.0.state() == SessionState::Refreshing {
            self.0.set_state(SessionState::Authenticated);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::event_channel;
    use crate::secrets::{KeyValueStore, MemoryStore};
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub(crate) fn settings_for(host: &str) -> SessionSettings {
        SessionSettings {
            oauth: OAuthSettings::new("client-1"),
            default_host: normalize_host(host),
            custom_cert_path: None,
            request_timeout: Duration::from_secs(5),
        }
    }

    pub(crate) fn session_for(
        server: &ServerGuard,
    ) -> (SessionManager, UnboundedReceiver<AppEvent>) {
        let (events, receiver) = event_channel();
        let session = SessionManager::new(
            CredentialStore::in_memory(),
            settings_for(&server.url()),
            PollGuards::default(),
            events,
        );
        (session, receiver)
    }

    /// Stores a signed-in session pointing at `server`.
    pub(crate) fn sign_in(session: &SessionManager, server: &ServerGuard, access: &str, refresh: &str) {
        session
            .store()
            .save_credentials(&Credentials {
                access_token: access.into(),
                refresh_token: Some(refresh.into()),
                host: server.url(),
                custom_cert_path: None,
            })
            .unwrap();
        session
            .store()
            .save_profile(&StoredProfile {
                user_id: 7,
                username: "octo".into(),
                plan: None,
            })
            .unwrap();
        assert!(session.restore().unwrap());
    }

    fn drain(receiver: &mut UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    async fn mock_user(server: &mut ServerGuard, token: &str) -> mockito::Mock {
        server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", format!("Bearer {token}").as_str())
            .with_status(200)
            .with_body(r#"{"id":7,"username":"octo","name":"Octo"}"#)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn begin_login_uses_fresh_verifier_per_attempt() {
        let server = Server::new_async().await;
        let (session, _events) = session_for(&server);

        let first = session.begin_login(None).unwrap();
        let first_verifier = lock(&session.inner.pending)
            .as_ref()
            .map(|pending| pending.pkce.verifier().to_string())
            .unwrap();
        let second = session.begin_login(None).unwrap();
        let pending = lock(&session.inner.pending);
        let pending = pending.as_ref().unwrap();

        assert_ne!(first_verifier, pending.pkce.verifier());
        assert_ne!(first, second);
        let challenge = second
            .query_pairs()
            .find(|(key, _)| key == "code_challenge")
            .map(|(_, value)| value.into_owned())
            .unwrap();
        assert_eq!(
            challenge,
            PkceChallenge::from_verifier(pending.pkce.verifier()).challenge()
        );
        assert_eq!(session.state(), SessionState::AwaitingRedirect);
    }

    #[tokio::test]
    async fn login_with_code_establishes_session() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::PartialJson(json!({
                "client_id": "client-1",
                "code": "abc123",
                "grant_type": "authorization_code",
                "code_verifier": "Vxyz",
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"AT1","refresh_token":"RT1"}"#)
            .expect(1)
            .create_async()
            .await;
        let _user = mock_user(&mut server, "AT1").await;
        let _namespace = server
            .mock("GET", "/api/v4/namespaces/octo")
            .with_status(200)
            .with_body(r#"{"id":1,"path":"octo","plan":"free"}"#)
            .create_async()
            .await;

        let (session, mut events) = session_for(&server);
        let host = format!("{}/", server.url());
        session
            .begin_login_with(Some(&host), PkceChallenge::from_verifier("Vxyz"))
            .unwrap();
        let user = session
            .complete_login("http://localhost/gitlab-tray/callback?code=abc123&state=gitlab-tray")
            .await
            .unwrap();

        assert_eq!(user.username.as_deref(), Some("octo"));
        assert_eq!(session.state(), SessionState::Authenticated);
        let store = session.store();
        assert_eq!(store.get(StoreKey::AccessToken).unwrap().as_deref(), Some("AT1"));
        assert_eq!(store.get(StoreKey::RefreshToken).unwrap().as_deref(), Some("RT1"));
        assert_eq!(store.get(StoreKey::Host).unwrap(), Some(server.url()));
        assert_eq!(store.get(StoreKey::UserId).unwrap().as_deref(), Some("7"));
        assert_eq!(store.get(StoreKey::Plan).unwrap().as_deref(), Some("free"));
        assert_eq!(
            drain(&mut events),
            vec![AppEvent::SessionStarted {
                username: "octo".into()
            }]
        );
        token.assert_async().await;
    }

    #[tokio::test]
    async fn failed_code_exchange_is_recoverable() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/oauth/token")
            .with_status(500)
            .create_async()
            .await;

        let (session, mut events) = session_for(&server);
        session.begin_login(None).unwrap();
        let err = session
            .complete_login("http://localhost/gitlab-tray/callback?code=abc123")
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::LoginFailed(_)));
        assert!(err.requires_sign_in());
        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(session.store().credentials().unwrap(), None);
        assert!(matches!(
            drain(&mut events).as_slice(),
            [AppEvent::SignInRequired { .. }]
        ));

        // A new attempt can start right away.
        assert!(session.begin_login(None).is_ok());
    }

    #[tokio::test]
    async fn complete_login_without_attempt_is_rejected() {
        let server = Server::new_async().await;
        let (session, _events) = session_for(&server);
        let err = session.complete_login("?code=abc123").await.unwrap_err();
        assert!(matches!(err, SessionError::NoPendingLogin));
    }

    #[tokio::test]
    async fn finalize_rejects_profile_without_username() {
        let mut server = Server::new_async().await;
        let _user = server
            .mock("GET", "/api/v4/user")
            .with_status(200)
            .with_body(r#"{"id":7}"#)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        let err = session
            .finalize_session("AT1", &server.url(), None, Some("RT1"))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::LoginFailed(_)));
        assert_eq!(session.store().credentials().unwrap(), None);
        assert_eq!(session.state(), SessionState::Unauthenticated);
    }

    #[tokio::test]
    async fn refresh_replaces_tokens_and_resets_guards() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .match_body(Matcher::PartialJson(json!({
                "grant_type": "refresh_token",
                "refresh_token": "RTold",
            })))
            .with_status(200)
            .with_body(r#"{"access_token":"AT2","refresh_token":"RT2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "ATold", "RTold");
        let guards = session.guards().clone();
        drop(guards.user.try_begin().unwrap());
        drop(guards.commits.try_begin().unwrap());
        drop(guards.comments.try_begin().unwrap());
        assert!(!guards.user.is_eligible());

        assert_eq!(session.refresh().await.unwrap(), RefreshOutcome::Refreshed);

        let store = session.store();
        assert_eq!(store.get(StoreKey::AccessToken).unwrap().as_deref(), Some("AT2"));
        assert_eq!(store.get(StoreKey::RefreshToken).unwrap().as_deref(), Some("RT2"));
        assert!(guards.user.is_eligible());
        assert!(guards.commits.is_eligible());
        assert!(guards.comments.is_eligible());
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(!session.is_refreshing());
        token.assert_async().await;
    }

    #[tokio::test]
    async fn empty_refresh_response_wipes_credentials() {
        let mut server = Server::new_async().await;
        let _token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let (session, mut events) = session_for(&server);
        sign_in(&session, &server, "ATold", "RTold");
        session.store().set(StoreKey::Plan, "free").unwrap();
        session.store().set(StoreKey::Bookmarks, "[]").unwrap();

        let err = session.refresh().await.unwrap_err();

        assert!(matches!(err, SessionError::RefreshFailed(_)));
        for key in StoreKey::SESSION {
            assert_eq!(session.store().get(key).unwrap(), None);
        }
        assert!(session.store().get(StoreKey::Bookmarks).unwrap().is_some());
        assert_eq!(session.state(), SessionState::Unauthenticated);
        let events = drain(&mut events);
        assert!(events
            .iter()
            .any(|event| matches!(event, AppEvent::RestartRequested { .. })));
    }

    #[tokio::test]
    async fn network_failure_during_refresh_is_fatal() {
        let server = Server::new_async().await;
        let (session, _events) = session_for(&server);
        session
            .store()
            .save_credentials(&Credentials {
                access_token: "ATold".into(),
                refresh_token: Some("RTold".into()),
                host: "http://127.0.0.1:1".into(),
                custom_cert_path: None,
            })
            .unwrap();

        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, SessionError::RefreshFailed(_)));
        assert_eq!(session.store().credentials().unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_refreshes_post_once() {
        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"AT2","refresh_token":"RT2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "ATold", "RTold");

        let (first, second, third) =
            tokio::join!(session.refresh(), session.refresh(), session.refresh());
        let mut outcomes = vec![first.unwrap(), second.unwrap(), third.unwrap()];
        outcomes.sort_by_key(|outcome| *outcome == RefreshOutcome::Coalesced);

        assert_eq!(
            outcomes,
            vec![
                RefreshOutcome::Refreshed,
                RefreshOutcome::Coalesced,
                RefreshOutcome::Coalesced
            ]
        );
        token.assert_async().await;
    }

    #[tokio::test]
    async fn refresh_without_session_is_not_authenticated() {
        let server = Server::new_async().await;
        let (session, mut events) = session_for(&server);
        let err = session.refresh().await.unwrap_err();
        assert!(matches!(err, SessionError::NotAuthenticated));
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn rejected_request_is_retried_after_refresh() {
        let mut server = Server::new_async().await;
        let _rejected = server
            .mock("GET", "/api/v4/user")
            .match_header("authorization", "Bearer ATold")
            .with_status(401)
            .with_body(r#"{"message":"401 Unauthorized"}"#)
            .create_async()
            .await;
        let retried = mock_user(&mut server, "AT2").await;
        let _token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_body(r#"{"access_token":"AT2","refresh_token":"RT2"}"#)
            .expect(1)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "ATold", "RTold");

        let user = session
            .with_auth_retry(|client| async move { client.current_user().await })
            .await
            .unwrap();

        assert_eq!(user.username.as_deref(), Some("octo"));
        retried.assert_async().await;
    }

    #[tokio::test]
    async fn non_auth_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/api/v4/projects/1")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;
        let token = server
            .mock("POST", "/oauth/token")
            .expect(0)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "AT1", "RT1");

        let err = session
            .with_auth_retry(|client| async move { client.project(1).await })
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Api(_)));
        failing.assert_async().await;
        token.assert_async().await;
    }

    #[tokio::test]
    async fn logout_clears_session_keys() {
        let server = Server::new_async().await;
        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "AT1", "RT1");

        session.logout().unwrap();

        assert_eq!(session.state(), SessionState::Unauthenticated);
        assert_eq!(session.store().credentials().unwrap(), None);
        assert_eq!(session.profile().unwrap(), None);
        assert!(matches!(
            session.client().err(),
            Some(SessionError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn certificate_change_requests_restart() {
        let server = Server::new_async().await;
        let (session, mut events) = session_for(&server);

        session.set_custom_cert_path(Some("/etc/ssl/corp.pem")).unwrap();

        assert_eq!(
            session.store().get(StoreKey::CustomCertPath).unwrap().as_deref(),
            Some("/etc/ssl/corp.pem")
        );
        assert!(matches!(
            drain(&mut events).as_slice(),
            [AppEvent::RestartRequested { .. }]
        ));
    }

    #[tokio::test]
    async fn cancelled_refresh_still_rotates_tokens() {
        use std::io::Write;

        let mut server = Server::new_async().await;
        let token = server
            .mock("POST", "/oauth/token")
            .with_status(200)
            .with_chunked_body(|writer| {
                std::thread::sleep(Duration::from_millis(300));
                writer.write_all(br#"{"access_token":"AT2","refresh_token":"RT2"}"#)
            })
            .expect(1)
            .create_async()
            .await;

        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "ATold", "RTold");

        let cancelled = tokio::time::timeout(Duration::from_millis(50), session.refresh()).await;
        assert!(cancelled.is_err());
        assert!(session.is_refreshing());

        // A caller arriving mid-exchange waits for it instead of posting again.
        assert_eq!(session.refresh().await.unwrap(), RefreshOutcome::Coalesced);
        assert!(!session.is_refreshing());
        assert_eq!(session.state(), SessionState::Authenticated);
        assert_eq!(
            session.store().get(StoreKey::AccessToken).unwrap().as_deref(),
            Some("AT2")
        );
        token.assert_async().await;
    }

    struct FailingStore {
        inner: MemoryStore,
        fail_on: StoreKey,
    }

    impl KeyValueStore for FailingStore {
        fn get(&self, key: StoreKey) -> Result<Option<String>, String> {
            self.inner.get(key)
        }

        fn set(&self, key: StoreKey, value: &str) -> Result<(), String> {
            if key == self.fail_on {
                return Err(format!("{} is locked", key.as_str()));
            }
            self.inner.set(key, value)
        }

        fn delete(&self, key: StoreKey) -> Result<(), String> {
            self.inner.delete(key)
        }
    }

    #[tokio::test]
    async fn failed_write_leaves_no_restorable_session() {
        let mut server = Server::new_async().await;
        let _user = mock_user(&mut server, "AT1").await;

        for fail_on in [StoreKey::Username, StoreKey::Host] {
            let store = CredentialStore::new(Arc::new(FailingStore {
                inner: MemoryStore::default(),
                fail_on,
            }));
            let session = SessionManager::new(
                store,
                settings_for(&server.url()),
                PollGuards::default(),
                event_channel().0,
            );

            let err = session
                .finalize_session("AT1", &server.url(), None, Some("RT1"))
                .await
                .unwrap_err();

            assert!(matches!(err, SessionError::Store(_)));
            assert_eq!(session.store().credentials().unwrap(), None);
            assert_eq!(session.state(), SessionState::Unauthenticated);
            assert!(!session.restore().unwrap());
        }
    }

    #[tokio::test]
    async fn new_attempt_keeps_live_session_authenticated() {
        let server = Server::new_async().await;
        let (session, _events) = session_for(&server);
        sign_in(&session, &server, "AT1", "RT1");

        session.begin_login(None).unwrap();

        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(session.is_authenticated());
    }
}
