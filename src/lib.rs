use chrono::{DateTime, Utc};
use gitlab_api::PIPELINE_RUNNING;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tauri::menu::{Menu, MenuItem, PredefinedMenuItem};
use tauri::tray::TrayIconBuilder;
use tauri::{AppHandle, Emitter, Manager, Runtime};
use tauri_plugin_notification::NotificationExt;
use tauri_plugin_opener::OpenerExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

pub mod activity_store;
pub mod bookmarks;
pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod pipelines;
pub mod poll_guard;
pub mod poller;
pub mod secrets;
pub mod session;

use activity_store::ActivityStore;
use bookmarks::{Bookmark, Bookmarks};
use bridge::{convert_user, relative_time, ActivitySnapshot, UserSummary};
use config::{normalize_config, Config, ConfigManager};
use error::{SessionError, SessionResult};
use events::{event_channel, AppEvent, EventSink};
use pipelines::PipelineWatcher;
use poll_guard::PollGuards;
use poller::ActivityPoller;
use secrets::{CredentialStore, KeyringStore, StoreKey, KEYRING_SERVICE};
use session::{SessionManager, SessionSettings};

static SECRET_PARAM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(access_token|refresh_token|code_verifier|code)=[^&\s]+")
        .expect("invalid secret parameter regex")
});
static BEARER_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bbearer\s+\S+").expect("invalid bearer regex"));

const BUILD_CLIENT_ID: Option<&str> = option_env!("GITLAB_TRAY_CLIENT_ID");

const TRAY_ID: &str = "gitlab-tray";
const MAIN_WINDOW: &str = "main";
const MENU_SHOW_ID: &str = "show";
const MENU_REFRESH_ID: &str = "refresh";
const MENU_SIGN_IN_ID: &str = "sign_in";
const MENU_SIGN_OUT_ID: &str = "sign_out";
const MENU_QUIT_ID: &str = "quit";

const ACTIVITY_EVENT: &str = "activity-updated";
const SESSION_EVENT: &str = "session-changed";
const NOTIFICATION_BODY_CHARS: usize = 120;

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn truncate_text(value: &str, limit: usize) -> String {
    let trimmed = value.trim();
    if trimmed.chars().count() <= limit {
        return trimmed.to_string();
    }
    if limit <= 1 {
        return "…".to_string();
    }
    let mut truncated: String = trimmed.chars().take(limit - 1).collect();
    truncated.push('…');
    truncated
}

/// Makes an error message safe to log: token-like query values and bearer
/// credentials are masked, and messages quoting headers or secrets are
/// reduced to their leading category.
pub(crate) fn redact_log_details(value: &str) -> String {
    let collapsed = collapse_whitespace(value);
    let lowered = collapsed.to_lowercase();
    let has_sensitive_hint = ["authorization:", "client_secret", "password", "set-cookie"]
        .iter()
        .any(|hint| lowered.contains(hint));

    if has_sensitive_hint {
        let category = collapsed
            .split(':')
            .next()
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .unwrap_or("error");
        return format!(
            "{}: <redacted-sensitive-details>",
            truncate_text(category, 64)
        );
    }

    let masked = SECRET_PARAM_REGEX.replace_all(&collapsed, "${1}=<redacted>");
    let masked = BEARER_REGEX.replace_all(&masked, "Bearer <redacted>");
    truncate_text(&masked, 180)
}


/// Backend services shared by commands, the tray and the event loop.
#[derive(Clone)]
struct AppServices {
    session: SessionManager,
    activity: ActivityStore,
    watcher: PipelineWatcher,
    poller: ActivityPoller,
    bookmarks: Bookmarks,
}

impl AppServices {
    fn new(config: &Config, settings: SessionSettings, events: EventSink) -> Self {
        let store = CredentialStore::new(Arc::new(KeyringStore::new(KEYRING_SERVICE)));
        let session = SessionManager::new(
            store,
            settings,
            PollGuards::new(config.poll_interval()),
            events.clone(),
        );
        let activity = ActivityStore::default();
        let watcher = PipelineWatcher::new(
            session.clone(),
            activity.clone(),
            events,
            config.pipeline_watch_interval(),
        );
        let poller = ActivityPoller::new(
            session.clone(),
            activity.clone(),
            watcher.clone(),
            config.recent_limit,
            config.request_timeout(),
        );
        let bookmarks = Bookmarks::new(session.clone());
        Self {
            session,
            activity,
            watcher,
            poller,
            bookmarks,
        }
    }

    fn drop_activity(&self) {
        self.watcher.stop();
        self.activity.clear();
    }
}

fn load_config() -> Result<Config, String> {
    let manager = ConfigManager::new()?;
    if !manager.path().exists() {
        if let Err(err) = manager.save(&Config::default()) {
            warn!("Failed to write default config: {}", err);
        }
    }
    let config = normalize_config(manager.load());
    debug!("Loaded config from {}", manager.path().display());
    Ok(config)
}

/// Applies a certificate path changed in the config since the session was
/// stored. The change only takes effect after a restart.
fn sync_custom_cert_path(session: &SessionManager, config: &Config) -> SessionResult<()> {
    let stored = session
        .store()
        .get(StoreKey::CustomCertPath)
        .map_err(SessionError::Store)?;
    if stored == config.custom_cert_path {
        return Ok(());
    }
    info!("Custom certificate path changed");
    session.set_custom_cert_path(config.custom_cert_path.as_deref())
}

fn notification_body(body: &str) -> String {
    truncate_text(&collapse_whitespace(body), NOTIFICATION_BODY_CHARS)
}

/// Tray hover text: who is signed in, running pipelines and the age of the
/// latest push.
fn tray_tooltip(snapshot: &ActivitySnapshot, now: DateTime<Utc>) -> String {
    let Some(user) = &snapshot.user else {
        return "GitLab".to_string();
    };
    let mut parts = vec![format!("GitLab: @{}", user.username)];

    let running = snapshot
        .commits
        .iter()
        .filter(|commit| commit.pipeline_status.as_deref() == Some(PIPELINE_RUNNING))
        .count();
    if running > 0 {
        let noun = if running == 1 { "pipeline" } else { "pipelines" };
        parts.push(format!("{} running {}", running, noun));
    }

    if let Some(age) = snapshot
        .commits
        .first()
        .and_then(|commit| commit.created_at.as_deref())
        .and_then(|created_at| relative_time(created_at, now))
    {
        parts.push(format!("last push {}", age));
    }
    parts.join(" · ")
}

fn show_panel<R: Runtime>(app: &AppHandle<R>) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.show();
        let _ = window.set_focus();
    }
}

fn show_notification(app: &AppHandle, title: &str, body: &str) {
    if let Err(err) = app
        .notification()
        .builder()
        .title(title)
        .body(notification_body(body))
        .show()
    {
        warn!("Failed to show notification: {}", err);
    }
}

fn broadcast_session(app: &AppHandle, signed_in: bool) {
    if let Err(err) = app.emit(SESSION_EVENT, signed_in) {
        warn!("Failed to emit session change: {}", err);
    }
}

fn broadcast_activity(app: &AppHandle, activity: &ActivityStore) -> ActivitySnapshot {
    let snapshot = activity.snapshot();
    if let Err(err) = app.emit(ACTIVITY_EVENT, &snapshot) {
        warn!("Failed to emit activity update: {}", err);
    }
    if let Some(tray) = app.tray_by_id(TRAY_ID) {
        if let Err(err) = tray.set_tooltip(Some(tray_tooltip(&snapshot, Utc::now()))) {
            warn!("Failed to update tray tooltip: {}", err);
        }
    }
    snapshot
}

fn spawn_refresh(app: &AppHandle, services: &AppServices) {
    let app = app.clone();
    let services = services.clone();
    tauri::async_runtime::spawn(async move {
        let summary = services.poller.refresh_all().await;
        debug!("Refresh finished: {:?}", summary);
        broadcast_activity(&app, &services.activity);
    });
}

/// Opens the authorize URL in the default browser and brings up the panel
/// where the redirect address is pasted.
fn start_sign_in(app: &AppHandle, session: &SessionManager, host: Option<&str>) -> SessionResult<String> {
    let url = session.begin_login(host)?;
    if let Err(err) = app.opener().open_url(url.as_str(), None::<&str>) {
        warn!("Failed to open browser for sign-in: {}", err);
    }
    show_panel(app);
    Ok(url.to_string())
}

fn sign_out(app: &AppHandle, services: &AppServices) -> SessionResult<()> {
    services.session.logout()?;
    services.drop_activity();
    broadcast_session(app, false);
    broadcast_activity(app, &services.activity);
    Ok(())
}

fn build_tray_menu<R: Runtime>(app: &AppHandle<R>) -> tauri::Result<Menu<R>> {
    let menu = Menu::new(app)?;
    menu.append(&MenuItem::with_id(app, MENU_SHOW_ID, "Show Panel", true, None::<&str>)?)?;
    menu.append(&MenuItem::with_id(app, MENU_REFRESH_ID, "Refresh", true, None::<&str>)?)?;
    menu.append(&PredefinedMenuItem::separator(app)?)?;
    menu.append(&MenuItem::with_id(app, MENU_SIGN_IN_ID, "Sign In…", true, None::<&str>)?)?;
    menu.append(&MenuItem::with_id(app, MENU_SIGN_OUT_ID, "Sign Out", true, None::<&str>)?)?;
    menu.append(&PredefinedMenuItem::separator(app)?)?;
    menu.append(&MenuItem::with_id(app, MENU_QUIT_ID, "Quit", true, None::<&str>)?)?;
    Ok(menu)
}

fn handle_menu_event(app: &AppHandle, id: &str) {
    let services = app.state::<AppServices>().inner().clone();
    match id {
        MENU_QUIT_ID => {
            services.watcher.stop();
            app.exit(0);
        }
        MENU_SHOW_ID => show_panel(app),
        MENU_REFRESH_ID => {
            if services.session.is_authenticated() {
                services.session.guards().reset_all();
                spawn_refresh(app, &services);
            }
        }
        MENU_SIGN_IN_ID => {
            if let Err(err) = start_sign_in(app, &services.session, None) {
                warn!("Cannot start sign-in: {}", err);
            }
        }
        MENU_SIGN_OUT_ID => {
            if let Err(err) = sign_out(app, &services) {
                warn!("Failed to sign out: {}", err);
            }
        }
        _ => {}
    }
}

fn handle_event(app: &AppHandle, services: &AppServices, event: AppEvent) {
    match event {
        AppEvent::Notification { title, body } => show_notification(app, &title, &body),
        AppEvent::SessionStarted { username } => {
            info!("Session started for {}", username);
            broadcast_session(app, true);
            spawn_refresh(app, services);
        }
        AppEvent::SignInRequired { reason } => {
            warn!("Sign-in required: {}", redact_log_details(&reason));
            // A failed re-login leaves an older session in place.
            if services.session.is_authenticated() {
                return;
            }
            services.drop_activity();
            broadcast_session(app, false);
            broadcast_activity(app, &services.activity);
            show_panel(app);
        }
        AppEvent::RestartRequested { reason } => {
            info!("Restarting: {}", reason);
            services.watcher.stop();
            app.restart();
        }
    }
}

async fn event_loop(
    app: AppHandle,
    services: AppServices,
    mut receiver: UnboundedReceiver<AppEvent>,
    refresh_every: Duration,
) {
    let mut ticker = tokio::time::interval(refresh_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if services.session.is_authenticated() {
                    spawn_refresh(&app, &services);
                }
            }
            event = receiver.recv() => match event {
                Some(event) => handle_event(&app, &services, event),
                None => break,
            },
        }
    }
    debug!("Event loop finished");
}

#[tauri::command]
fn get_activity(services: tauri::State<'_, AppServices>) -> ActivitySnapshot {
    services.activity.snapshot()
}

#[tauri::command]
async fn refresh_activity(
    app: tauri::AppHandle,
    services: tauri::State<'_, AppServices>,
) -> Result<ActivitySnapshot, String> {
    if !services.session.is_authenticated() {
        return Err(SessionError::NotAuthenticated.to_string());
    }
    let summary = services.poller.refresh_all().await;
    debug!("Panel refresh finished: {:?}", summary);
    Ok(broadcast_activity(&app, &services.activity))
}

#[tauri::command]
fn has_session(services: tauri::State<'_, AppServices>) -> bool {
    services.session.is_authenticated()
}

#[tauri::command]
fn begin_login(
    app: tauri::AppHandle,
    services: tauri::State<'_, AppServices>,
    host: Option<String>,
) -> Result<String, String> {
    start_sign_in(&app, &services.session, host.as_deref()).map_err(|err| err.to_string())
}

#[tauri::command]
async fn complete_login(
    services: tauri::State<'_, AppServices>,
    redirect: String,
) -> Result<UserSummary, String> {
    let user = services
        .session
        .complete_login(redirect.trim())
        .await
        .map_err(|err| err.to_string())?;
    convert_user(user).ok_or_else(|| "GitLab returned an incomplete profile".to_string())
}

#[tauri::command]
fn logout(app: tauri::AppHandle, services: tauri::State<'_, AppServices>) -> Result<(), String> {
    sign_out(&app, &services).map_err(|err| err.to_string())
}

#[tauri::command]
fn list_bookmarks(services: tauri::State<'_, AppServices>) -> Result<Vec<Bookmark>, String> {
    services.bookmarks.list().map_err(|err| err.to_string())
}

#[tauri::command]
async fn add_bookmark(
    services: tauri::State<'_, AppServices>,
    project_id: u64,
) -> Result<Bookmark, String> {
    services
        .bookmarks
        .add(project_id)
        .await
        .map_err(|err| err.to_string())
}

#[tauri::command]
fn remove_bookmark(
    services: tauri::State<'_, AppServices>,
    project_id: u64,
) -> Result<bool, String> {
    services
        .bookmarks
        .remove(project_id)
        .map_err(|err| err.to_string())
}

#[tauri::command]
fn get_config() -> Result<Config, String> {
    load_config()
}

#[tauri::command]
fn save_config(services: tauri::State<'_, AppServices>, config: Config) -> Result<(), String> {
    let manager = ConfigManager::new()?;
    let normalized = normalize_config(config);
    manager.save(&normalized).map_err(|err| err.to_string())?;
    sync_custom_cert_path(&services.session, &normalized).map_err(|err| err.to_string())
}

/// Entry point of the tray client.
pub fn run() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .try_init();

    info!("Starting GitLab tray runtime");

    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("Failed to load config: {}", err);
            std::process::exit(1);
        }
    };
    let settings = SessionSettings::from_config(&config, BUILD_CLIENT_ID.unwrap_or_default());
    if settings.oauth.client_id.is_empty() {
        error!("No OAuth client id: set GITLAB_TRAY_CLIENT_ID at build time or client_id in the config");
        std::process::exit(1);
    }

    let (events, receiver) = event_channel();
    let services = AppServices::new(&config, settings, events);
    let services_for_setup = services.clone();
    let refresh_every = config.activity_refresh_interval();

    let result = tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_notification::init())
        .plugin(tauri_plugin_process::init())
        .manage(services)
        .setup(move |app| {
            let app_handle = app.handle().clone();
            let menu = build_tray_menu(&app_handle)?;
            let mut tray = TrayIconBuilder::with_id(TRAY_ID)
                .menu(&menu)
                .tooltip("GitLab")
                .on_menu_event(|app, event| handle_menu_event(app, event.id.as_ref()));
            if let Some(icon) = app.default_window_icon() {
                tray = tray.icon(icon.clone());
            }
            tray.build(app)?;

            let services = services_for_setup;
            if services.session.restore()? {
                sync_custom_cert_path(&services.session, &config)?;
            } else if let Err(err) = start_sign_in(&app_handle, &services.session, None) {
                warn!("Cannot start sign-in: {}", err);
            }

            tauri::async_runtime::spawn(event_loop(app_handle, services, receiver, refresh_every));
            Ok(())
        })
        .on_window_event(|window, event| {
            if let tauri::WindowEvent::CloseRequested { api, .. } = event {
                let _ = window.hide();
                api.prevent_close();
            }
        })
        .invoke_handler(tauri::generate_handler![
            get_activity,
            refresh_activity,
            has_session,
            begin_login,
            complete_login,
            logout,
            list_bookmarks,
            add_bookmark,
            remove_bookmark,
            get_config,
            save_config,
        ])
        .run(tauri::generate_context!());

    if let Err(err) = result {
        error!("Error while running tauri application: {}", err);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::CommitItem;
    use chrono::TimeZone;

    fn commit(status: Option<&str>, created_at: &str) -> CommitItem {
        CommitItem {
            project_id: 3,
            sha: "0123456789abcdef".into(),
            short_sha: "01234567".into(),
            title: "Add tray".into(),
            ref_name: Some("main".into()),
            created_at: Some(created_at.into()),
            pipeline_id: Some(11),
            pipeline_status: status.map(Into::into),
        }
    }

    fn octo() -> UserSummary {
        UserSummary {
            id: 7,
            username: "octo".into(),
            name: "Octo Cat".into(),
            avatar_url: None,
            web_url: None,
        }
    }

    #[test]
    fn tooltip_without_profile_is_plain() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(tray_tooltip(&ActivitySnapshot::default(), now), "GitLab");
    }

    #[test]
    fn tooltip_counts_running_pipelines_and_latest_push() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let snapshot = ActivitySnapshot {
            user: Some(octo()),
            commits: vec![
                commit(Some("running"), "2024-05-01T11:55:00Z"),
                commit(Some("running"), "2024-05-01T10:00:00Z"),
                commit(Some("success"), "2024-04-30T10:00:00Z"),
            ],
            comments: Vec::new(),
        };

        assert_eq!(
            tray_tooltip(&snapshot, now),
            "GitLab: @octo · 2 running pipelines · last push 5m ago"
        );
    }

    #[test]
    fn tooltip_skips_empty_sections() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let snapshot = ActivitySnapshot {
            user: Some(octo()),
            commits: vec![commit(None, "not a timestamp")],
            comments: Vec::new(),
        };

        assert_eq!(tray_tooltip(&snapshot, now), "GitLab: @octo");
    }

    #[test]
    fn notification_body_is_single_line_and_bounded() {
        assert_eq!(notification_body("Fix\n  flaky   build"), "Fix flaky build");
        let long = "x".repeat(500);
        assert_eq!(notification_body(&long).chars().count(), NOTIFICATION_BODY_CHARS);
    }

    #[test]
    fn truncate_text_adds_ellipsis() {
        assert_eq!(truncate_text("  short  ", 10), "short");
        assert_eq!(truncate_text("abcdefghij", 5), "abcd…");
        assert_eq!(truncate_text("abc", 1), "…");
    }

    #[test]
    fn redact_masks_token_parameters() {
        let redacted = redact_log_details(
            "request to http://localhost/cb?code=abc123&state=gitlab-tray failed",
        );
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("code=<redacted>"));
        assert!(redacted.contains("state=gitlab-tray"));

        let redacted = redact_log_details("refresh_token=RTold rejected");
        assert_eq!(redacted, "refresh_token=<redacted> rejected");
    }

    #[test]
    fn redact_masks_bearer_credentials() {
        assert_eq!(
            redact_log_details("sent Bearer AT1 upstream"),
            "sent Bearer <redacted> upstream"
        );
    }

    #[test]
    fn redact_collapses_header_dumps_to_category() {
        assert_eq!(
            redact_log_details("HTTP 400: Authorization: Bearer AT1"),
            "HTTP 400: <redacted-sensitive-details>"
        );
    }

    #[test]
    fn redact_keeps_plain_messages() {
        assert_eq!(
            redact_log_details("HTTP 500:\n  internal   error"),
            "HTTP 500: internal error"
        );
    }
}
