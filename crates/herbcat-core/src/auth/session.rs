//! Session lifecycle: login, registration, silent refresh and logout.
//!
//! `SessionManager` is the only thing that mutates session state. It owns the
//! credential store, the identity endpoints and a single refresh timer.
//!
//! ```text
//! Anonymous -> Authenticating -> Authenticated -> Refreshing -> Authenticated
//!                                      |               |
//!                                      +--> Anonymous <+  (logout / refresh failure)
//! ```
//!
//! Tokens are refreshed `refresh_threshold` before they expire. A token that
//! is already inside that window at login is refreshed before `login`
//! returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::credentials::{Credential, CredentialStore, StorageScope};
use super::identity::{AuthResponse, IdentityApi};
use super::token::{self, DecodedClaims};
use super::validation::{validate_email, validate_registration};
use super::AuthError;
use crate::api::Transport;
use crate::clock::{Clock, SystemClock};

/// Refresh this long before the token expires
pub const REFRESH_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Identity calls give up after this long
pub const IDENTITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffered session events per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub identity_timeout: Duration,
    pub refresh_threshold: Duration,
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            identity_timeout: IDENTITY_TIMEOUT,
            refresh_threshold: REFRESH_THRESHOLD,
        }
    }
}

/// Read-only view of who is signed in, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub is_authenticated: bool,
    pub username: Option<String>,
    pub role: Option<String>,
}

impl AuthState {
    pub fn anonymous() -> Self {
        Self {
            is_authenticated: false,
            username: None,
            role: None,
        }
    }

    fn from_credential(credential: &Credential) -> Self {
        Self {
            is_authenticated: true,
            username: Some(credential.username.clone()),
            role: Some(credential.role.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Anonymous,
    Authenticating,
    Authenticated,
    Refreshing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    LoggedOut,
    RefreshFailed,
    Expired,
}

/// Lifecycle notifications. Navigation on `Ended` is up to the subscriber.
///
/// `SignedIn` is sent only once `login`/`register` is about to return `Ok`.
/// When the new token had to be refreshed straight away, `Refreshed` comes
/// first; if that refresh fails the subscriber sees only `Ended(RefreshFailed)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn {
        username: String,
        scope: StorageScope,
    },
    Refreshed,
    Ended(EndReason),
}

/// Who is persisting a credential, which decides what happens when the token
/// is already inside the refresh window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    SignIn,
    Restore,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    Armed,
    RefreshNow,
    Unarmed,
}

struct RefreshTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct State {
    scope: Option<StorageScope>,
    phase: SessionPhase,
    /// Bumped by every established sign-in, every logout and every forced
    /// end; completions from an older epoch must not write. Attempts that
    /// fail leave it alone so they cannot orphan a live refresh.
    epoch: u64,
    timer: Option<RefreshTimer>,
    next_timer_id: u64,
}

impl State {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            debug!(timer = timer.id, "Refresh timer cancelled");
        }
    }
}

struct Inner {
    identity: IdentityApi,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    refresh_threshold: chrono::Duration,
    state: Mutex<State>,
    refresh_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SessionEvent>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.cancel_timer();
    }
}

/// Handle to the session. Clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>, store: CredentialStore) -> Self {
        Self::with_clock(config, transport, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        store: CredentialStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let refresh_threshold =
            chrono::Duration::from_std(config.refresh_threshold).unwrap_or(chrono::Duration::MAX);
        Self {
            inner: Arc::new(Inner {
                identity: IdentityApi::new(transport, &config.base_url, config.identity_timeout),
                store,
                clock,
                refresh_threshold,
                state: Mutex::new(State {
                    scope: None,
                    phase: SessionPhase::Anonymous,
                    epoch: 0,
                    timer: None,
                    next_timer_id: 0,
                }),
                refresh_lock: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self) -> SessionPhase {
        self.state().phase
    }

    // ===== Sign-in =====

    /// Register a new account and sign in with it.
    ///
    /// Username, email and password strength are checked before anything is
    /// sent. A successful registration is persisted in the ephemeral scope.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<Credential, AuthError> {
        validate_registration(username, email, password)?;

        let epoch = self.begin_attempt();
        let result = self
            .inner
            .identity
            .register(username.trim(), email.trim(), password)
            .await;
        self.complete_sign_in(epoch, result, StorageScope::Ephemeral)
            .await
    }

    /// Sign in, persisting the credential durably when `remember_me` is set.
    ///
    /// Only the email shape is checked locally; the server judges the password.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        remember_me: bool,
    ) -> Result<Credential, AuthError> {
        validate_email(email)?;

        let epoch = self.begin_attempt();
        let result = self
            .inner
            .identity
            .login(email.trim(), password, remember_me)
            .await;
        self.complete_sign_in(epoch, result, StorageScope::from_remember_me(remember_me))
            .await
    }

    fn begin_attempt(&self) -> u64 {
        let mut state = self.state();
        state.phase = SessionPhase::Authenticating;
        state.epoch
    }

    async fn complete_sign_in(
        &self,
        epoch: u64,
        result: Result<AuthResponse, AuthError>,
        scope: StorageScope,
    ) -> Result<Credential, AuthError> {
        let outcome = result.and_then(|response| self.establish(epoch, response, scope, Origin::SignIn));
        let (credential, schedule) = match outcome {
            Ok(established) => established,
            Err(e) => {
                self.abandon_attempt(epoch);
                return Err(e);
            }
        };

        let credential = if schedule == Schedule::RefreshNow {
            debug!("Token already inside refresh window, refreshing now");
            self.refresh_from(Some(&credential.token)).await?
        } else {
            credential
        };

        info!(username = %credential.username, scope = %scope, "Signed in");
        self.emit(SessionEvent::SignedIn {
            username: credential.username.clone(),
            scope,
        });
        Ok(credential)
    }

    /// Put the phase back after a failed attempt, unless something newer owns it.
    fn abandon_attempt(&self, epoch: u64) {
        let mut state = self.state();
        if state.epoch != epoch {
            return;
        }
        let live = state
            .scope
            .and_then(|scope| self.inner.store.load_from(scope).ok().flatten())
            .is_some();
        state.phase = if live {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Anonymous
        };
    }

    /// Persist a server-issued credential and arm the refresh timer.
    ///
    /// Save and arm happen under the state lock, after checking that `epoch`
    /// is still current, so a concurrent logout can never be undone.
    fn establish(
        &self,
        epoch: u64,
        response: AuthResponse,
        scope: StorageScope,
        origin: Origin,
    ) -> Result<(Credential, Schedule), AuthError> {
        let (credential, claims) = credential_from(response)?;

        let mut state = self.state();
        if state.epoch != epoch {
            debug!(?origin, "Discarding credential from a superseded attempt");
            return Err(AuthError::Superseded);
        }
        if origin == Origin::SignIn {
            // A new sign-in may switch scope; leave nothing behind in the old one
            self.inner.store.clear()?;
        }
        self.inner.store.save(&credential, scope)?;
        if origin == Origin::SignIn {
            // A new session starts: in-flight work for the old one is stale
            state.epoch += 1;
        }
        state.scope = Some(scope);
        state.phase = SessionPhase::Authenticated;
        let schedule = self.arm_timer(&mut state, &claims, origin);
        Ok((credential, schedule))
    }

    /// Pick up a credential persisted by an earlier run.
    ///
    /// Expired or corrupt records are cleared. A credential inside the
    /// refresh window is refreshed before this returns.
    pub async fn restore(&self) -> Result<AuthState, AuthError> {
        let (credential, schedule) = {
            let mut state = self.state();
            let scope = match self.inner.store.active_scope()? {
                Some(scope) => scope,
                None => return Ok(AuthState::anonymous()),
            };
            let credential = match self.inner.store.load_from(scope)? {
                Some(credential) => credential,
                None => {
                    self.inner.store.clear()?;
                    return Ok(AuthState::anonymous());
                }
            };
            if credential.is_expired_at(self.inner.clock.now()) {
                info!("Stored session has expired");
                self.inner.store.clear()?;
                drop(state);
                self.emit(SessionEvent::Ended(EndReason::Expired));
                return Ok(AuthState::anonymous());
            }
            let claims = match token::decode(&credential.token) {
                Ok(claims) => claims,
                Err(e) => {
                    warn!(error = %e, "Stored token is unreadable, clearing session");
                    self.inner.store.clear()?;
                    return Err(e);
                }
            };
            state.scope = Some(scope);
            state.phase = SessionPhase::Authenticated;
            let schedule = self.arm_timer(&mut state, &claims, Origin::Restore);
            debug!(scope = %scope, "Restored stored session");
            (credential, schedule)
        };

        if schedule == Schedule::RefreshNow {
            if let Err(e) = self.refresh_from(Some(&credential.token)).await {
                debug!(error = %e, "Refresh of restored session failed");
            }
        }
        Ok(self.get_auth_state())
    }

    // ===== Queries =====

    /// Authenticated iff the active scope holds a credential and `now < expires_at`.
    pub fn get_auth_state(&self) -> AuthState {
        match self.live_credential() {
            Some(credential) => AuthState::from_credential(&credential),
            None => AuthState::anonymous(),
        }
    }

    /// The stored credential, if it has not expired.
    pub fn current_credential(&self) -> Option<Credential> {
        self.live_credential()
    }

    /// Token to attach to outgoing requests, if signed in.
    pub fn bearer_token(&self) -> Option<String> {
        self.live_credential().map(|c| c.token)
    }

    fn stored_credential(&self) -> Option<Credential> {
        let scope = self.state().scope?;
        match self.inner.store.load_from(scope) {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Failed to read credential store");
                None
            }
        }
    }

    fn live_credential(&self) -> Option<Credential> {
        let now = self.inner.clock.now();
        self.stored_credential()
            .filter(|credential| !credential.is_expired_at(now))
    }

    // ===== Refresh =====

    /// Exchange the stored credential for a fresh one.
    pub async fn refresh(&self) -> Result<Credential, AuthError> {
        let stale = self.stored_credential().map(|c| c.token);
        self.refresh_from(stale.as_deref()).await
    }

    /// Refresh on behalf of a caller that saw `stale_token` fail or age out.
    ///
    /// Only one refresh runs at a time. A caller that queued behind another
    /// refresh and finds the stored token already replaced gets the new
    /// credential without a second network call.
    ///
    /// Any failure other than being superseded clears the session: a
    /// credential that cannot be refreshed is not kept around to expire.
    pub async fn refresh_from(&self, stale_token: Option<&str>) -> Result<Credential, AuthError> {
        let _in_flight = self.inner.refresh_lock.lock().await;

        let (epoch, scope, current) = {
            let mut state = self.state();
            let scope = match state.scope {
                Some(scope) => scope,
                None => return Err(AuthError::NotAuthenticated),
            };
            let current = self.inner.store.load_from(scope)?;
            if current.is_some() {
                state.phase = SessionPhase::Refreshing;
            }
            (state.epoch, scope, current)
        };

        let current = match current {
            Some(current) => current,
            None => {
                self.end_session(epoch, EndReason::RefreshFailed);
                return Err(AuthError::NotAuthenticated);
            }
        };

        if let Some(stale) = stale_token {
            if stale != current.token {
                debug!("Credential already refreshed by another caller");
                self.settle_phase(epoch);
                return Ok(current);
            }
        }

        let result = match self.inner.identity.refresh(&current.token).await {
            Ok(response) => self.establish(epoch, response, scope, Origin::Refresh),
            Err(e) => Err(e),
        };

        match result {
            Ok((credential, _)) => {
                info!(username = %credential.username, "Session refreshed");
                self.emit(SessionEvent::Refreshed);
                Ok(credential)
            }
            Err(AuthError::Superseded) => Err(AuthError::Superseded),
            Err(e) => {
                warn!(error = %e, "Refresh failed, ending session");
                self.end_session(epoch, EndReason::RefreshFailed);
                Err(AuthError::RefreshFailed(e.to_string()))
            }
        }
    }

    fn settle_phase(&self, epoch: u64) {
        let mut state = self.state();
        if state.epoch == epoch && state.phase == SessionPhase::Refreshing {
            state.phase = SessionPhase::Authenticated;
        }
    }

    /// Decide when to refresh `claims` and arm the timer accordingly.
    ///
    /// Any previously armed timer is cancelled first.
    fn arm_timer(&self, state: &mut State, claims: &DecodedClaims, origin: Origin) -> Schedule {
        state.cancel_timer();

        let remaining = claims.expires_at - self.inner.clock.now();
        if remaining > self.inner.refresh_threshold {
            let delay = remaining - self.inner.refresh_threshold;
            self.spawn_timer(state, delay);
            return Schedule::Armed;
        }

        match origin {
            Origin::SignIn | Origin::Restore => Schedule::RefreshNow,
            // A fresh token already inside the window would refresh in a
            // loop; try once more at expiry instead
            Origin::Refresh if remaining > chrono::Duration::zero() => {
                warn!(
                    remaining_secs = remaining.num_seconds(),
                    "Refreshed token is already inside the refresh window"
                );
                self.spawn_timer(state, remaining);
                Schedule::Armed
            }
            Origin::Refresh => {
                warn!("Refreshed token is already expired, not scheduling another refresh");
                Schedule::Unarmed
            }
        }
    }

    fn spawn_timer(&self, state: &mut State, delay: chrono::Duration) {
        let delay = delay.to_std().unwrap_or(Duration::ZERO);
        // Deadline is fixed at arm time, not at the task's first poll
        let deadline = Instant::now() + delay;
        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let handle = tokio::spawn(run_refresh_timer(Arc::downgrade(&self.inner), id, deadline));
        state.timer = Some(RefreshTimer { id, handle });
        debug!(timer = id, delay_secs = delay.as_secs(), "Refresh scheduled");
    }

    // ===== Logout =====

    /// Sign out. Local state is always cleared; telling the server is best effort.
    pub async fn logout(&self) {
        let token = {
            let mut state = self.state();
            state.epoch += 1;
            state.cancel_timer();
            let token = state
                .scope
                .and_then(|scope| self.inner.store.load_from(scope).ok().flatten())
                .map(|c| c.token);
            if let Err(e) = self.inner.store.clear() {
                warn!(error = %e, "Failed to clear credential store on logout");
            }
            state.scope = None;
            state.phase = SessionPhase::Anonymous;
            token
        };
        info!("Signed out");
        self.emit(SessionEvent::Ended(EndReason::LoggedOut));

        if let Some(token) = token {
            if let Err(e) = self.inner.identity.logout(&token).await {
                warn!(error = %e, "Server logout failed, local session already cleared");
            }
        }
    }

    /// Clear the session locally if `epoch` still owns it.
    fn end_session(&self, epoch: u64, reason: EndReason) {
        {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            state.cancel_timer();
            if let Err(e) = self.inner.store.clear() {
                warn!(error = %e, "Failed to clear credential store");
            }
            state.scope = None;
            state.phase = SessionPhase::Anonymous;
        }
        self.emit(SessionEvent::Ended(reason));
    }
}

async fn run_refresh_timer(inner: Weak<Inner>, id: u64, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = SessionManager { inner };
    {
        let mut state = manager.state();
        if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
            return;
        }
        // Detach our own handle so re-arming does not abort this task
        state.timer = None;
    }
    debug!(timer = id, "Refresh timer fired");
    if let Err(e) = manager.refresh().await {
        debug!(error = %e, "Timed refresh did not succeed");
    }
}

fn credential_from(response: AuthResponse) -> Result<(Credential, DecodedClaims), AuthError> {
    let claims = token::decode(&response.token)?;
    let expires_at: DateTime<Utc> = response
        .expires_at
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or(claims.expires_at);
    let role = if response.role.is_empty() {
        claims.role.clone().unwrap_or_default()
    } else {
        response.role
    };
    let credential = Credential {
        token: response.token,
        username: response.username,
        role,
        email: response.email,
        expires_at,
    };
    Ok((credential, claims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::identity::{LOGIN_PATH, LOGOUT_PATH, REFRESH_PATH, REGISTER_PATH};
    use crate::auth::ValidationError;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::testutil::{
        auth_body, fixed_instant, settle, token_expiring_at, ManualClock, ScriptedTransport,
        TokioClock, BASE_URL,
    };
    use crate::api::TransportError;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        transport: Arc<ScriptedTransport>,
        durable: Arc<MemoryStore>,
        ephemeral: Arc<MemoryStore>,
        session: SessionManager,
    }

    fn harness_with(durable: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> Harness {
        let transport = ScriptedTransport::new();
        let ephemeral = Arc::new(MemoryStore::new());
        let store = CredentialStore::new(durable.clone(), ephemeral.clone());
        let session =
            SessionManager::with_clock(SessionConfig::new(BASE_URL), transport.clone(), store, clock);
        Harness {
            transport,
            durable,
            ephemeral,
            session,
        }
    }

    fn harness(clock: Arc<dyn Clock>) -> Harness {
        harness_with(Arc::new(MemoryStore::new()), clock)
    }

    fn paused_harness() -> Harness {
        harness(Arc::new(TokioClock::new(fixed_instant())))
    }

    fn token_in(minutes: i64, subject: &str) -> String {
        token_expiring_at(fixed_instant() + ChronoDuration::minutes(minutes), subject)
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_persists_in_chosen_scope() {
        let h = paused_harness();
        let token = token_in(60, "1");
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token));

        let credential = h.session.login("sage@example.com", "pw", true).await.unwrap();

        assert_eq!(credential.token, token);
        assert_eq!(credential.expires_at, fixed_instant() + ChronoDuration::minutes(60));
        assert_eq!(h.durable.get("token").unwrap(), Some(token));
        assert_eq!(h.durable.get("storageType").unwrap().as_deref(), Some("local"));
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.session.phase(), SessionPhase::Authenticated);
        assert_eq!(
            h.session.get_auth_state(),
            AuthState {
                is_authenticated: true,
                username: Some("sage".to_string()),
                role: Some("user".to_string()),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_login_clears_other_scope() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "durable")));
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "ephemeral")));

        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let second = h.session.login("sage@example.com", "pw", false).await.unwrap();

        assert!(h.durable.is_empty());
        assert_eq!(h.ephemeral.get("token").unwrap(), Some(second.token.clone()));
        assert_eq!(h.session.current_credential(), Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_failure_persists_nothing() {
        let h = paused_harness();
        h.transport
            .respond(LOGIN_PATH, 401, r#"{"message":"Invalid email or password"}"#);

        let err = h.session.login("sage@example.com", "wrong", true).await.unwrap_err();

        match err {
            AuthError::Server { status, payload } => {
                assert_eq!(status, 401);
                assert!(payload.contains("Invalid email or password"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(h.durable.is_empty());
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
        assert!(!h.session.get_auth_state().is_authenticated);
    }

    #[tokio::test]
    async fn test_login_rejects_bad_email_without_network() {
        let h = harness(Arc::new(ManualClock::new(fixed_instant())));

        let err = h.session.login("sage-at-example", "pw", false).await.unwrap_err();

        assert!(matches!(err, AuthError::Validation(ValidationError::InvalidEmail)));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_register_validation_fails_fast() {
        let h = harness(Arc::new(ManualClock::new(fixed_instant())));

        let err = h
            .session
            .register("bob", "not-an-email", "Password1!")
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(ValidationError::InvalidEmail)));

        let err = h
            .session
            .register("bob", "bob@example.com", "password")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::Validation(ValidationError::PasswordMissingUppercase)
        ));

        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_signs_in() {
        let h = paused_harness();
        h.transport.respond(REGISTER_PATH, 201, auth_body(&token_in(60, "9")));
        let mut events = h.session.subscribe();

        let credential = h
            .session
            .register("sage", "sage@example.com", "Password1!")
            .await
            .unwrap();

        assert_eq!(h.ephemeral.get("token").unwrap(), Some(credential.token));
        assert!(h.session.get_auth_state().is_authenticated);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedIn {
                username: "sage".to_string(),
                scope: StorageScope::Ephemeral,
            }
        );
        let body: serde_json::Value =
            serde_json::from_str(h.transport.calls_to(REGISTER_PATH)[0].body.as_deref().unwrap())
                .unwrap();
        assert_eq!(body["username"], "sage");
    }

    #[tokio::test]
    async fn test_auth_state_expiry_boundary() {
        let clock = Arc::new(ManualClock::new(fixed_instant()));
        let h = harness(clock.clone());
        let expires_at = fixed_instant() + ChronoDuration::minutes(30);
        let body = serde_json::json!({
            "token": token_expiring_at(expires_at, "1"),
            "username": "sage",
            "email": "sage@example.com",
            "role": "user",
            "expiresAt": expires_at.timestamp_millis(),
        });
        h.transport.respond(LOGIN_PATH, 200, body.to_string());
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        clock.set(expires_at - ChronoDuration::milliseconds(1));
        assert!(h.session.get_auth_state().is_authenticated);
        assert!(h.session.bearer_token().is_some());

        clock.set(expires_at);
        assert_eq!(h.session.get_auth_state(), AuthState::anonymous());
        assert_eq!(h.session.bearer_token(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timer_fires_at_threshold() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(10, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(60, "new")));
        let credential = h.session.login("sage@example.com", "pw", false).await.unwrap();

        tokio::time::advance(Duration::from_secs(4 * 60 + 59)).await;
        settle().await;
        assert!(h.transport.calls_to(REFRESH_PATH).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        let refreshes = h.transport.calls_to(REFRESH_PATH);
        assert_eq!(refreshes.len(), 1);
        assert_eq!(
            refreshes[0].header_value("Authorization"),
            Some(format!("Bearer {}", credential.token).as_str())
        );
        assert_eq!(h.session.bearer_token(), Some(token_in(60, "new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_inside_window_refreshes_immediately() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(4, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(60, "new")));
        let mut events = h.session.subscribe();

        let credential = h.session.login("sage@example.com", "pw", true).await.unwrap();

        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 1);
        assert_eq!(credential.token, token_in(60, "new"));
        assert_eq!(h.durable.get("token").unwrap(), Some(credential.token));
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Refreshed);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::SignedIn {
                username: "sage".to_string(),
                scope: StorageScope::Durable,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_immediate_refresh_never_reports_sign_in() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(4, "old")));
        h.transport.respond(REFRESH_PATH, 401, r#"{"message":"revoked"}"#);
        let mut events = h.session.subscribe();

        let err = h.session.login("sage@example.com", "pw", true).await.unwrap_err();

        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(h.durable.is_empty());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended(EndReason::RefreshFailed)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_deadline_is_fixed_when_armed() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(10, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(60, "new")));
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        // The timer task has not been polled yet; the clock moves first
        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        settle().await;

        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 1);
        assert_eq!(h.session.bearer_token(), Some(token_in(60, "new")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_cancels_previous_timer() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(10, "first")));
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(20, "second")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(120, "third")));

        h.session.login("sage@example.com", "pw", false).await.unwrap();
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        // First timer would have fired at 5 minutes
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        settle().await;
        assert!(h.transport.calls_to(REFRESH_PATH).is_empty());

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        settle().await;
        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_active_scope() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(90, "new")));
        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let mut events = h.session.subscribe();

        let refreshed = h.session.refresh().await.unwrap();

        assert_eq!(h.durable.get("token").unwrap(), Some(refreshed.token));
        assert!(h.ephemeral.is_empty());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Refreshed);
        assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_failure_ends_session() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.transport.respond(REFRESH_PATH, 401, r#"{"message":"expired"}"#);
        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let mut events = h.session.subscribe();

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(h.durable.is_empty());
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended(EndReason::RefreshFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_refreshed_token_ends_session() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body("not-a-token"));
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        let err = h.session.refresh().await.unwrap_err();

        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(h.ephemeral.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_login_token_persists_nothing() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body("garbage"));

        let err = h.session.login("sage@example.com", "pw", true).await.unwrap_err();

        assert!(matches!(err, AuthError::MalformedToken(_)));
        assert!(h.durable.is_empty());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_call() {
        let h = paused_harness();
        let old = token_in(60, "old");
        h.transport.respond(LOGIN_PATH, 200, auth_body(&old));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(90, "new")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(120, "newer")));
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        let (a, b) = futures::join!(
            h.session.refresh_from(Some(&old)),
            h.session.refresh_from(Some(&old))
        );

        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 1);
        assert_eq!(a.unwrap().token, token_in(90, "new"));
        assert_eq!(b.unwrap().token, token_in(90, "new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshed_token_inside_window_is_not_refreshed_again() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(2, "short")));
        h.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(60, "long")));
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        h.session.refresh().await.unwrap();
        settle().await;
        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 1);

        // One more attempt when the short token runs out
        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        settle().await;
        assert_eq!(h.transport.calls_to(REFRESH_PATH).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_clears_and_swallows_server_failure() {
        let h = paused_harness();
        let token = token_in(60, "1");
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token));
        h.transport.fail(LOGOUT_PATH, TransportError::Timeout);
        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let mut events = h.session.subscribe();

        h.session.logout().await;

        assert!(h.durable.is_empty());
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.session.get_auth_state(), AuthState::anonymous());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ended(EndReason::LoggedOut)
        );
        let logouts = h.transport.calls_to(LOGOUT_PATH);
        assert_eq!(logouts.len(), 1);
        assert_eq!(
            logouts[0].header_value("Authorization"),
            Some(format!("Bearer {}", token).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_refresh_timer() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(10, "1")));
        h.session.login("sage@example.com", "pw", false).await.unwrap();

        h.session.logout().await;
        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        settle().await;

        assert!(h.transport.calls_to(REFRESH_PATH).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_login_discards_completion() {
        let h = paused_harness();
        let gate = h
            .transport
            .respond_gated(LOGIN_PATH, 200, auth_body(&token_in(60, "late")));

        let (result, _) = tokio::join!(h.session.login("sage@example.com", "pw", true), async {
            settle().await;
            assert_eq!(h.session.phase(), SessionPhase::Authenticating);
            h.session.logout().await;
            gate.notify_one();
        });

        assert!(matches!(result, Err(AuthError::Superseded)));
        assert!(h.durable.is_empty());
        assert_eq!(h.session.get_auth_state(), AuthState::anonymous());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_does_not_orphan_failing_refresh() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let gate = h
            .transport
            .respond_gated(REFRESH_PATH, 401, r#"{"message":"revoked"}"#);
        h.transport.respond(LOGIN_PATH, 401, r#"{"message":"Invalid email or password"}"#);

        let (refreshed, _) = tokio::join!(h.session.refresh(), async {
            settle().await;
            let err = h.session.login("sage@example.com", "wrong", true).await;
            assert!(matches!(err, Err(AuthError::Server { status: 401, .. })));
            gate.notify_one();
        });

        assert!(matches!(refreshed, Err(AuthError::RefreshFailed(_))));
        assert!(h.durable.is_empty());
        assert!(h.ephemeral.is_empty());
        assert_eq!(h.session.get_auth_state(), AuthState::anonymous());
        assert_eq!(h.session.phase(), SessionPhase::Anonymous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_does_not_discard_successful_refresh() {
        let h = paused_harness();
        h.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(60, "old")));
        h.session.login("sage@example.com", "pw", true).await.unwrap();
        let gate = h
            .transport
            .respond_gated(REFRESH_PATH, 200, auth_body(&token_in(90, "new")));
        h.transport.respond(LOGIN_PATH, 401, r#"{"message":"Invalid email or password"}"#);

        let (refreshed, _) = tokio::join!(h.session.refresh(), async {
            settle().await;
            let err = h.session.login("sage@example.com", "wrong", true).await;
            assert!(err.is_err());
            gate.notify_one();
        });

        assert_eq!(refreshed.unwrap().token, token_in(90, "new"));
        assert_eq!(h.durable.get("token").unwrap(), Some(token_in(90, "new")));
        assert_eq!(h.session.bearer_token(), Some(token_in(90, "new")));
        assert_eq!(h.session.phase(), SessionPhase::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_picks_up_durable_session() {
        let durable = Arc::new(MemoryStore::new());
        let first = harness_with(durable.clone(), Arc::new(TokioClock::new(fixed_instant())));
        first.transport.respond(LOGIN_PATH, 200, auth_body(&token_in(10, "1")));
        first.session.login("sage@example.com", "pw", true).await.unwrap();
        drop(first);

        let second = harness_with(durable, Arc::new(TokioClock::new(fixed_instant())));
        second.transport.respond(REFRESH_PATH, 200, auth_body(&token_in(60, "2")));
        assert!(!second.session.get_auth_state().is_authenticated);

        let state = second.session.restore().await.unwrap();
        assert!(state.is_authenticated);
        assert_eq!(state.username.as_deref(), Some("sage"));

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        settle().await;
        assert_eq!(second.transport.calls_to(REFRESH_PATH).len(), 1);
    }

    #[tokio::test]
    async fn test_restore_clears_expired_session() {
        let clock = Arc::new(ManualClock::new(fixed_instant()));
        let h = harness(clock.clone());
        let store = CredentialStore::new(h.durable.clone(), h.ephemeral.clone());
        store
            .save(
                &Credential {
                    token: token_in(-1, "1"),
                    username: "sage".to_string(),
                    role: "user".to_string(),
                    email: "sage@example.com".to_string(),
                    expires_at: fixed_instant() - ChronoDuration::minutes(1),
                },
                StorageScope::Durable,
            )
            .unwrap();
        let mut events = h.session.subscribe();

        let state = h.session.restore().await.unwrap();

        assert_eq!(state, AuthState::anonymous());
        assert!(h.durable.is_empty());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Ended(EndReason::Expired));
        assert!(h.transport.calls().is_empty());
    }

    #[tokio::test]
    async fn test_refresh_without_session_is_not_authenticated() {
        let h = harness(Arc::new(ManualClock::new(fixed_instant())));
        assert!(matches!(
            h.session.refresh().await,
            Err(AuthError::NotAuthenticated)
        ));
        assert!(h.transport.calls().is_empty());
    }
}
