// src/store/storage.rs

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{error, warn};

/// **进程内的 localStorage 等价物**
/// 字符串键到 JSON 文本的映射，整库落盘到一个 JSON 文件。
/// 读-改-写没有事务，并发写同一个键会互相覆盖（last-writer-wins）。
/// warning: not thread safe at the value level.
pub struct LocalStorage {
    entries: Mutex<HashMap<String, String>>,
    backing: Option<PathBuf>,
    degraded: AtomicBool,
}

impl LocalStorage {
    /// 打开存储。backing 文件不可用时向用户告警，并降级为纯内存模式继续运行。
    pub fn open(backing: Option<PathBuf>) -> Arc<Self> {
        let mut entries = HashMap::new();
        if let Some(path) = &backing {
            match fs::read_to_string(path) {
                Ok(content) => match serde_json::from_str::<HashMap<String, String>>(&content) {
                    Ok(loaded) => entries = loaded,
                    Err(e) => Self::alert(&format!(
                        "storage file {:?} is malformed ({}), starting from an empty store",
                        path, e
                    )),
                },
                // 第一次启动，文件还不存在
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => Self::alert(&format!(
                    "storage file {:?} is not readable ({}), continuing without persistence",
                    path, e
                )),
            }
        }
        Arc::new(Self {
            entries: Mutex::new(entries),
            backing,
            degraded: AtomicBool::new(false),
        })
    }

    /// alert 的等价物：stderr 一条 + error 日志一条
    fn alert(message: &str) {
        eprintln!("[rust-turtledove] {}", message);
        error!("{}", message);
    }

    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), value);
        self.persist(&entries);
    }

    fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }

    fn persist(&self, entries: &HashMap<String, String>) {
        if self.degraded.load(Ordering::Relaxed) {
            return;
        }
        let path = match &self.backing {
            Some(path) => path,
            None => return,
        };
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
            let content = serde_json::to_string_pretty(entries)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
            fs::write(path, content)
        })();
        if let Err(e) = result {
            // 只告警一次，之后安静地运行在非持久化模式
            self.degraded.store(true, Ordering::Relaxed);
            Self::alert(&format!(
                "storage file {:?} is not writable ({}), continuing without persistence",
                path, e
            ));
        }
    }

    /// 关停前把当前内容刷到磁盘
    pub fn flush(&self) {
        let entries = self.entries.lock().unwrap();
        self.persist(&entries);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

/// **以 origin 为作用域的存储句柄**
/// 所有键都带 origin 前缀，跨 origin 的状态互相不可见。
#[derive(Clone)]
pub struct ScopedStorage {
    inner: Arc<LocalStorage>,
    origin: String,
}

impl ScopedStorage {
    pub fn new(inner: Arc<LocalStorage>, origin: &str) -> Self {
        Self {
            inner,
            origin: origin.to_string(),
        }
    }

    /// 纯内存、无落盘的存储（测试与降级路径）
    pub fn in_memory(origin: &str) -> Self {
        Self::new(LocalStorage::open(None), origin)
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}::{}", self.origin, key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.inner.get(&self.scoped_key(key))
    }

    pub fn set(&self, key: &str, value: String) {
        self.inner.set(&self.scoped_key(key), value);
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(&self.scoped_key(key));
    }

    /// 读出并反序列化一个键；simd-json 在自有缓冲上解析
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        let mut buf = raw.into_bytes();
        match simd_json::serde::from_slice::<T>(&mut buf) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("stored value under key '{}' is malformed: {}", key, e);
                None
            }
        }
    }

    pub fn write_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(serialized) => self.set(key, serialized),
            Err(e) => warn!("cannot serialize value for key '{}': {}", key, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn set_get_remove_roundtrip() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        assert_eq!(storage.get("interest-groups"), None);
        storage.set("interest-groups", "{}".to_string());
        assert_eq!(storage.get("interest-groups"), Some("{}".to_string()));
        storage.remove("interest-groups");
        assert_eq!(storage.get("interest-groups"), None);
    }

    #[test]
    fn origins_do_not_leak_into_each_other() {
        let inner = LocalStorage::open(None);
        let first = ScopedStorage::new(inner.clone(), "http://localhost:8008");
        let second = ScopedStorage::new(inner, "http://evil.example");
        first.set("winners", "[1]".to_string());
        assert_eq!(second.get("winners"), None);
    }

    #[test]
    fn json_roundtrip_through_simd_parse() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        storage.write_json("some-map", &map);
        let loaded: BTreeMap<String, u32> = storage.read_json("some-map").unwrap();
        assert_eq!(loaded, map);
    }

    #[test]
    fn malformed_stored_json_reads_as_absent() {
        let storage = ScopedStorage::in_memory("http://localhost:8008");
        storage.set("broken", "{not json".to_string());
        let loaded: Option<BTreeMap<String, u32>> = storage.read_json("broken");
        assert!(loaded.is_none());
    }

    #[test]
    fn unwritable_backing_degrades_instead_of_crashing() {
        // /dev/null 下不可能建目录，第一次写之后进入降级模式
        let inner = LocalStorage::open(Some(PathBuf::from("/dev/null/turtledove/store.json")));
        let storage = ScopedStorage::new(inner.clone(), "http://localhost:8008");
        storage.set("interest-groups", "{}".to_string());
        assert!(inner.is_degraded());
        // 内存中的数据仍然可用
        assert_eq!(storage.get("interest-groups"), Some("{}".to_string()));
    }
}
