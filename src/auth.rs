//! 认证处理、会话管理与登录限流。

use axum::extract::{Extension, Json, connect_info::ConnectInfo};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::{body::Body as AxumBody, middleware, response::IntoResponse};
use axum_extra::extract::{CookieJar, cookie::Cookie};
use cookie::time::Duration as CookieDuration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AUTH_COOKIE_NAME;
use crate::error::ApiError;
use crate::http::{RequestScheme, is_https_request, resolve_client_ip};
use crate::identity::{
    Identity, IdentityError, IdentityStore, new_identity, verify_password, verify_unknown,
};
use crate::namespace::{NamespaceKey, resolve};

pub struct AuthConfig {
    pub identities: Arc<dyn IdentityStore>,
    pub default_namespace: NamespaceKey,
    pub sessions: Mutex<HashMap<String, SessionEntry>>,
    pub session_ttl: Duration,
    pub login_attempts: Mutex<HashMap<IpAddr, LoginAttempt>>,
    pub login_window: Duration,
    pub login_max_attempts: u32,
    pub login_lockout: Duration,
}

impl AuthConfig {
    pub fn new(identities: Arc<dyn IdentityStore>, default_namespace: NamespaceKey) -> Self {
        Self {
            identities,
            default_namespace,
            sessions: Mutex::new(HashMap::new()),
            session_ttl: Duration::from_secs(crate::config::DEFAULT_SESSION_TTL_SECS),
            login_attempts: Mutex::new(HashMap::new()),
            login_window: Duration::from_secs(crate::config::DEFAULT_LOGIN_WINDOW_SECS),
            login_max_attempts: crate::config::DEFAULT_LOGIN_MAX_ATTEMPTS,
            login_lockout: Duration::from_secs(crate::config::DEFAULT_LOGIN_LOCKOUT_SECS),
        }
    }
}

#[derive(Debug)]
pub struct SessionEntry {
    pub identity_id: String,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct LoginAttempt {
    pub window_start: Instant,
    pub failures: u32,
    pub locked_until: Option<Instant>,
}

/// 已登录用户，由中间件写入请求扩展。
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CurrentUser {
    #[serde(skip)]
    pub id: String,
    pub name: String,
    pub namespace: NamespaceKey,
    pub admin: bool,
}

impl CurrentUser {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.name.clone(),
            namespace: identity.namespace(),
            admin: identity.admin,
        }
    }

    /// 管理员可访问任意命名空间，普通用户只能访问自己的。
    pub fn can_access(&self, namespace: &NamespaceKey) -> bool {
        self.admin || self.namespace == *namespace
    }

    pub fn authorize(&self, namespace: &NamespaceKey) -> Result<(), ApiError> {
        if self.can_access(namespace) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "namespace {namespace} is not yours"
            )))
        }
    }
}

/// 认证中间件：校验会话 Cookie 并注入 [`CurrentUser`]。
pub async fn auth_middleware(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
    mut req: Request<AxumBody>,
    next: middleware::Next,
) -> Result<axum::response::Response, ApiError> {
    let path = req.uri().path().to_string();
    if is_auth_exempt_path(&path) {
        return Ok(next.run(req).await);
    }

    let Some(user) = current_user(&auth, &jar).await else {
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    };
    if path.starts_with("/api/admin/") && !user.admin {
        return Err(ApiError::Forbidden("admin only".into()));
    }
    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthRegisterRequest {
    name: String,
    email: String,
    password: String,
}

/// 注册接口：只创建身份，命名空间在首次使用时才供给。
pub async fn auth_register(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Json(payload): Json<AuthRegisterRequest>,
) -> Result<(StatusCode, Json<CurrentUser>), ApiError> {
    let name = payload.name.trim();
    let email = payload.email.trim();
    if name.is_empty() || email.is_empty() || payload.password.is_empty() {
        return Err(ApiError::BadRequest(
            "name, email and password are required".into(),
        ));
    }
    if resolve(name) == auth.default_namespace {
        return Err(ApiError::Conflict(format!(
            "namespace {} is reserved",
            auth.default_namespace
        )));
    }

    let identity = new_identity(name, email, &payload.password, false).await?;
    let user = CurrentUser::from_identity(&identity);
    auth.identities.insert(identity).await?;
    info!(namespace = %user.namespace, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthLoginRequest {
    email: String,
    password: String,
}

/// 登录接口：创建会话并写入 Cookie。
pub async fn auth_login(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(scheme): Extension<RequestScheme>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(payload): Json<AuthLoginRequest>,
) -> Result<(CookieJar, axum::response::Response), ApiError> {
    let client_ip = resolve_client_ip(&headers, Some(addr.ip())).unwrap_or_else(|| addr.ip());

    if let Some(retry_after) = check_login_rate_limit(&auth, client_ip).await {
        return Err(ApiError::TooManyRequests(retry_after));
    }

    let found = auth.identities.find_by_email(payload.email.trim()).await;
    let verified = match &found {
        Some(identity) => verify_password(payload.password, identity.password_hash.clone()).await,
        None => verify_unknown(payload.password).await,
    };
    let Some(identity) = found.filter(|_| verified) else {
        register_login_failure(&auth, client_ip).await;
        return Err(ApiError::Unauthorized(HeaderMap::new()));
    };

    clear_login_failures(&auth, client_ip).await;

    let token = create_session(&auth, &identity.id).await;
    let secure = is_https_request(&headers, scheme);
    let cookie = Cookie::build((AUTH_COOKIE_NAME, token))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(axum_extra::extract::cookie::SameSite::Strict)
        .max_age(CookieDuration::seconds(auth.session_ttl.as_secs() as i64))
        .build();
    let jar = jar.add(cookie);
    info!(namespace = %identity.namespace(), client_ip = %client_ip, "login succeeded");
    Ok((
        jar,
        Json(CurrentUser::from_identity(&identity)).into_response(),
    ))
}

/// 登出接口：清理会话并删除 Cookie。
pub async fn auth_logout(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> (CookieJar, StatusCode) {
    if let Some(cookie) = jar.get(AUTH_COOKIE_NAME) {
        remove_session(&auth, cookie.value()).await;
    }

    (
        jar.remove(Cookie::build(AUTH_COOKIE_NAME).path("/").build()),
        StatusCode::NO_CONTENT,
    )
}

fn is_auth_exempt_path(path: &str) -> bool {
    if path == "/api/auth/login"
        || path == "/api/auth/register"
        || path == "/api/auth/logout"
        || path == "/api/auth/status"
        || path == "/api/version"
    {
        return true;
    }
    if path.starts_with("/api/") || path.starts_with("/blobs/") {
        return false;
    }
    true
}

/// 查询当前登录状态。
pub async fn auth_status(
    Extension(auth): Extension<Arc<AuthConfig>>,
    jar: CookieJar,
) -> Result<Json<CurrentUser>, ApiError> {
    current_user(&auth, &jar)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::Unauthorized(HeaderMap::new()))
}

async fn current_user(auth: &AuthConfig, jar: &CookieJar) -> Option<CurrentUser> {
    let token = jar.get(AUTH_COOKIE_NAME)?.value().to_string();
    let identity_id = session_identity(auth, &token).await?;
    match auth.identities.find_by_id(&identity_id).await {
        Some(identity) => Some(CurrentUser::from_identity(&identity)),
        None => {
            remove_session(auth, &token).await;
            None
        }
    }
}

pub(crate) async fn create_session(auth: &AuthConfig, identity_id: &str) -> String {
    let token = Uuid::new_v4().to_string();
    let expires_at = Instant::now() + auth.session_ttl;
    let mut sessions = auth.sessions.lock().await;
    sessions.insert(
        token.clone(),
        SessionEntry {
            identity_id: identity_id.to_string(),
            expires_at,
        },
    );
    token
}

async fn session_identity(auth: &AuthConfig, token: &str) -> Option<String> {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    match sessions.get(token) {
        Some(entry) if entry.expires_at > now => Some(entry.identity_id.clone()),
        _ => {
            sessions.remove(token);
            None
        }
    }
}

async fn remove_session(auth: &AuthConfig, token: &str) {
    let mut sessions = auth.sessions.lock().await;
    sessions.remove(token);
}

async fn check_login_rate_limit(auth: &AuthConfig, ip: IpAddr) -> Option<u64> {
    if auth.login_max_attempts == 0 {
        return None;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if let Some(locked_until) = entry.locked_until {
        if now < locked_until {
            return Some(locked_until.saturating_duration_since(now).as_secs().max(1));
        }
        entry.locked_until = None;
        entry.failures = 0;
        entry.window_start = now;
    }

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
    }

    None
}

async fn register_login_failure(auth: &AuthConfig, ip: IpAddr) {
    if auth.login_max_attempts == 0 {
        return;
    }

    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    let entry = attempts.entry(ip).or_insert(LoginAttempt {
        window_start: now,
        failures: 0,
        locked_until: None,
    });

    if now.duration_since(entry.window_start) > auth.login_window {
        entry.window_start = now;
        entry.failures = 0;
        entry.locked_until = None;
    }

    entry.failures = entry.failures.saturating_add(1);
    if entry.failures >= auth.login_max_attempts {
        entry.locked_until = Some(now + auth.login_lockout);
        warn!(client_ip = %ip, "login locked out");
    }
}

async fn clear_login_failures(auth: &AuthConfig, ip: IpAddr) {
    let mut attempts = auth.login_attempts.lock().await;
    attempts.remove(&ip);
}

/// 按配置创建初始管理员；邮箱已存在时跳过。
pub async fn seed_admin(
    auth: &AuthConfig,
    name: &str,
    email: &str,
    password: &str,
) -> Result<(), IdentityError> {
    if auth.identities.find_by_email(email).await.is_some() {
        return Ok(());
    }
    let identity = new_identity(name, email, password, true).await?;
    let namespace = identity.namespace();
    auth.identities.insert(identity).await?;
    info!(%namespace, "bootstrap admin created");
    Ok(())
}

/// 清理过期会话。
pub async fn prune_expired_sessions(auth: &AuthConfig) {
    let mut sessions = auth.sessions.lock().await;
    let now = Instant::now();
    sessions.retain(|_, entry| entry.expires_at > now);
}

/// 清理过期的登录失败记录。
pub async fn prune_login_attempts(auth: &AuthConfig) {
    let mut attempts = auth.login_attempts.lock().await;
    let now = Instant::now();
    attempts.retain(|_, entry| {
        if let Some(locked_until) = entry.locked_until {
            return locked_until > now;
        }
        now.duration_since(entry.window_start) <= auth.login_window
    });
}
