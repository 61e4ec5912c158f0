// src/logging/op_logger.rs

use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::keys::{LOGS_COUNT_KEY, LOGS_KEY};
use crate::store::storage::ScopedStorage;

/// 单条操作日志
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OpLog {
    pub val: String,  // 日志文本
    pub site: String, // 触发操作的站点 origin
    pub ts: String,   // 记录时间（RFC3339）
}

struct OpLoggerState {
    logs: Vec<OpLog>,
    saved: bool,
}

/// **操作日志记录器**
/// 面向最终用户的操作留痕：join/leave/竞价过程中发生了什么。
/// 日志先在内存里攒着，`save()` 时批量追加到 origin 作用域存储的 logs 键；
/// save 之后再来的日志（比如后台拉取任务补记的）立即落盘。
pub struct OpLogger {
    storage: ScopedStorage,
    site: String,
    enabled: bool,
    state: Mutex<OpLoggerState>,
}

impl OpLogger {
    pub fn new(storage: ScopedStorage, site: &str, enabled: bool) -> Self {
        Self {
            storage,
            site: site.to_string(),
            enabled,
            state: Mutex::new(OpLoggerState {
                logs: Vec::new(),
                saved: false,
            }),
        }
    }

    pub fn log(&self, text: &str) {
        if !self.enabled {
            return;
        }
        info!(site = %self.site, "{}", text);
        let entry = OpLog {
            val: text.to_string(),
            site: self.site.clone(),
            ts: Utc::now().to_rfc3339(),
        };
        let mut state = self.state.lock().unwrap();
        if state.saved {
            self.dump(std::slice::from_ref(&entry));
        } else {
            state.logs.push(entry);
        }
    }

    /// 把攒下的日志批量落盘
    pub fn save(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.logs.is_empty() {
            self.dump(&state.logs);
            state.logs.clear();
        }
        state.saved = true;
    }

    fn dump(&self, new_logs: &[OpLog]) {
        let mut saved: Vec<OpLog> = self.storage.read_json(LOGS_KEY).unwrap_or_default();
        saved.extend_from_slice(new_logs);
        self.storage.write_json(LOGS_KEY, &saved);

        let count: usize = self.storage.read_json(LOGS_COUNT_KEY).unwrap_or(0);
        self.storage.write_json(LOGS_COUNT_KEY, &(count + new_logs.len()));
    }
}
