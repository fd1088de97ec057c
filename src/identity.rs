//! 用户身份与查找接口；账号保存在注入的 [`IdentityStore`] 中。

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use async_trait::async_trait;
use std::fmt;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;

use crate::namespace::{NamespaceKey, resolve};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub admin: bool,
}

impl Identity {
    /// 该用户的个人命名空间。
    pub fn namespace(&self) -> NamespaceKey {
        resolve(&self.name)
    }
}

#[derive(Debug)]
pub enum IdentityError {
    EmailTaken,
    NamespaceTaken(NamespaceKey),
    Hash(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityError::EmailTaken => f.write_str("email already registered"),
            IdentityError::NamespaceTaken(ns) => write!(f, "namespace {ns} already taken"),
            IdentityError::Hash(msg) => write!(f, "password hashing failed: {msg}"),
        }
    }
}

impl std::error::Error for IdentityError {}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Option<Identity>;
    async fn find_by_id(&self, id: &str) -> Option<Identity>;
    async fn insert(&self, identity: Identity) -> Result<(), IdentityError>;
}

/// 进程内的身份表。email 唯一，且两个用户不能落到同一命名空间。
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<Vec<Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_email(&self, email: &str) -> Option<Identity> {
        self.identities
            .read()
            .await
            .iter()
            .find(|identity| identity.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    async fn find_by_id(&self, id: &str) -> Option<Identity> {
        self.identities
            .read()
            .await
            .iter()
            .find(|identity| identity.id == id)
            .cloned()
    }

    async fn insert(&self, identity: Identity) -> Result<(), IdentityError> {
        let mut identities = self.identities.write().await;
        if identities
            .iter()
            .any(|existing| existing.email.eq_ignore_ascii_case(&identity.email))
        {
            return Err(IdentityError::EmailTaken);
        }
        let namespace = identity.namespace();
        if identities
            .iter()
            .any(|existing| existing.namespace() == namespace)
        {
            return Err(IdentityError::NamespaceTaken(namespace));
        }
        identities.push(identity);
        Ok(())
    }
}

/// 在阻塞线程池中生成 argon2id PHC 哈希。
pub async fn hash_password(password: String) -> Result<String, IdentityError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| IdentityError::Hash(err.to_string()))
    })
    .await
    .map_err(|err| IdentityError::Hash(err.to_string()))?
}

pub async fn verify_password(password: String, password_hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        PasswordHash::new(&password_hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    })
    .await
    .unwrap_or(false)
}

static DUMMY_HASH: OnceCell<String> = OnceCell::const_new();

/// 邮箱不存在时也做一次同等代价的校验，响应耗时不暴露账号是否注册。
pub async fn verify_unknown(password: String) -> bool {
    if let Ok(hash) = DUMMY_HASH
        .get_or_try_init(|| hash_password(Uuid::new_v4().to_string()))
        .await
    {
        let _ = verify_password(password, hash.clone()).await;
    }
    false
}

/// 创建新身份，id 为随机 UUID。
pub async fn new_identity(
    name: &str,
    email: &str,
    password: &str,
    admin: bool,
) -> Result<Identity, IdentityError> {
    Ok(Identity {
        id: Uuid::new_v4().to_string(),
        name: name.trim().to_string(),
        email: email.trim().to_string(),
        password_hash: hash_password(password.to_string()).await?,
        admin,
    })
}
