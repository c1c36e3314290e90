//! 用户锁管理器

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use points_shared::config::ExchangeConfig;
use redis::Client as RedisClient;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{ExchangeError, Result};

/// Redis 锁释放脚本：仅当 owner 匹配时删除
const RELEASE_SCRIPT: &str = r#"
    if redis.call("get", KEYS[1]) == ARGV[1] then
        return redis.call("del", KEYS[1])
    else
        return 0
    end
"#;

/// 锁后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackendKind {
    Local,
    Redis,
}

impl LockBackendKind {
    /// 解析配置值，未知取值回退到本地锁
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "redis" => Self::Redis,
            "local" => Self::Local,
            other => {
                warn!(lock_backend = %other, "未知的锁后端配置，使用本地锁");
                Self::Local
            }
        }
    }
}

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 等待锁的最长时间
    pub acquire_timeout: Duration,
    /// Redis 锁过期时间
    pub ttl: Duration,
    /// Redis 锁轮询间隔
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(3),
            ttl: Duration::from_secs(30),
            retry_delay: Duration::from_millis(50),
        }
    }
}

impl LockConfig {
    pub fn from_exchange(config: &ExchangeConfig) -> Self {
        Self {
            acquire_timeout: Duration::from_millis(config.lock_timeout_ms),
            ttl: Duration::from_millis(config.lock_ttl_ms),
            ..Self::default()
        }
    }
}

enum Backend {
    Local(Arc<DashMap<String, Arc<Mutex<()>>>>),
    Redis(RedisClient),
}

/// 用户锁管理器
pub struct UserLockManager {
    backend: Backend,
    config: LockConfig,
    /// 实例唯一标识，用于区分不同服务实例持有的锁
    instance_id: String,
}

impl UserLockManager {
    /// 进程内锁
    pub fn local(config: LockConfig) -> Self {
        Self {
            backend: Backend::Local(Arc::new(DashMap::new())),
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Redis 分布式锁
    pub fn redis(client: RedisClient, config: LockConfig) -> Self {
        Self {
            backend: Backend::Redis(client),
            config,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn kind(&self) -> LockBackendKind {
        match self.backend {
            Backend::Local(_) => LockBackendKind::Local,
            Backend::Redis(_) => LockBackendKind::Redis,
        }
    }

    fn lock_key(user_id: &str) -> String {
        format!("lock:points:exchange:{user_id}")
    }

    /// 获取用户锁，超过 acquire_timeout 返回 `LockTimeout`
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn acquire(&self, user_id: &str) -> Result<UserLockGuard> {
        let key = Self::lock_key(user_id);
        // owner 格式: instance_id:uuid
        let owner = format!("{}:{}", self.instance_id, Uuid::new_v4());

        match &self.backend {
            Backend::Local(locks) => {
                let mutex = locks.entry(key.clone()).or_default().value().clone();
                let guard = tokio::time::timeout(self.config.acquire_timeout, mutex.lock_owned())
                    .await
                    .map_err(|_| ExchangeError::LockTimeout { key: key.clone() })?;
                debug!(key = %key, "本地用户锁已获取");
                Ok(UserLockGuard {
                    key,
                    owner,
                    inner: GuardInner::Local {
                        guard: Some(guard),
                        locks: locks.clone(),
                    },
                    released: false,
                })
            }
            Backend::Redis(client) => {
                self.acquire_redis(client, key, owner).await
            }
        }
    }

    /// 轮询 SET NX PX 直到成功或超时
    async fn acquire_redis(
        &self,
        client: &RedisClient,
        key: String,
        owner: String,
    ) -> Result<UserLockGuard> {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let ttl_ms = self.config.ttl.as_millis() as u64;

        let mut conn = client.get_multiplexed_async_connection().await?;

        loop {
            // NX: 只在 key 不存在时设置；PX: 过期时间（毫秒）
            let result: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await?;

            if result.is_some() {
                debug!(key = %key, owner = %owner, "Redis 用户锁已获取");
                return Ok(UserLockGuard {
                    key,
                    owner,
                    inner: GuardInner::Redis(client.clone()),
                    released: false,
                });
            }

            if Instant::now() + self.config.retry_delay > deadline {
                return Err(ExchangeError::LockTimeout { key });
            }
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

enum GuardInner {
    Local {
        guard: Option<OwnedMutexGuard<()>>,
        locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    },
    Redis(RedisClient),
}

/// 用户锁守卫
///
/// 可跨任务移动。本地锁在 drop 时即释放；Redis 锁应显式调用 `release()`，
/// 否则只能等待 TTL 过期。
pub struct UserLockGuard {
    key: String,
    owner: String,
    inner: GuardInner,
    released: bool,
}

impl fmt::Debug for UserLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backend = match self.inner {
            GuardInner::Local { .. } => "local",
            GuardInner::Redis(_) => "redis",
        };
        f.debug_struct("UserLockGuard")
            .field("key", &self.key)
            .field("owner", &self.owner)
            .field("backend", &backend)
            .field("released", &self.released)
            .finish()
    }
}

impl UserLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// 显式释放锁
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match &mut self.inner {
            GuardInner::Local { guard, locks } => {
                release_local(&self.key, guard, locks);
                Ok(())
            }
            GuardInner::Redis(client) => {
                let mut conn = client.get_multiplexed_async_connection().await?;
                let result: i32 = redis::Script::new(RELEASE_SCRIPT)
                    .key(&self.key)
                    .arg(&self.owner)
                    .invoke_async(&mut conn)
                    .await?;

                if result == 0 {
                    // 锁已过期或被其他实例持有
                    warn!(key = %self.key, owner = %self.owner, "用户锁已过期或不属于当前持有者");
                } else {
                    debug!(key = %self.key, "Redis 用户锁已释放");
                }
                Ok(())
            }
        }
    }
}

/// 释放本地锁，并在无人等待时回收 map 中的条目
fn release_local(
    key: &str,
    guard: &mut Option<OwnedMutexGuard<()>>,
    locks: &DashMap<String, Arc<Mutex<()>>>,
) {
    if guard.take().is_some() {
        locks.remove_if(key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        match &mut self.inner {
            GuardInner::Local { guard, locks } => release_local(&self.key, guard, locks),
            GuardInner::Redis(_) if !self.released => {
                warn!(
                    key = %self.key,
                    owner = %self.owner,
                    "用户锁未显式释放，将在 TTL 到期后自动失效"
                );
            }
            GuardInner::Redis(_) => {}
        }
    }
}
