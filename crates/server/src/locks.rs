/// 按 key 的互斥锁
///
/// 节点 ID 为 key 时，同一节点的分配、回调、清理串行执行，不同节点互不阻塞；
/// 集群名为 key 时，同一集群内的受理请求串行执行

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取锁，guard 释放前其他持有者等待
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// 回收不再需要的锁
    pub async fn forget(&self, key: &str) {
        let mut locks = self.inner.lock().await;
        if let Some(lock) = locks.get(key) {
            // 仍有人持有或等待时保留
            if Arc::strong_count(lock) == 1 {
                locks.remove(key);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}
