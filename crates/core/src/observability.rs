use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        OnceLock, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::encoding::{append_utf8_json_line, to_json_line};

/// 结构化日志事件，每个事件写成一行 JSON。
///
/// 同一次请求（含上下文裁剪后的重试）共享一个 `trace_id`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScribeEvent {
    /// 一次尝试开始发送。
    RequestStart {
        ts: String,
        trace_id: String,
        model: String,
        prompt_mode: String,
        messages: usize,
        attempt: u32,
    },
    /// 请求到达终态。
    RequestEnd {
        ts: String,
        trace_id: String,
        outcome: String,
        duration_ms: u128,
        attempts: u32,
        deltas: usize,
        error: Option<String>,
    },
    /// 错误归类结果。
    ErrorClassified {
        ts: String,
        trace_id: String,
        kind: String,
        message: String,
        retryable: bool,
    },
    /// 裁剪历史后准备重试。
    RetryScheduled {
        ts: String,
        trace_id: String,
        attempt: u32,
        reason: String,
    },
    /// 重试次数用尽。
    RetryExhausted {
        ts: String,
        trace_id: String,
        attempts: u32,
        last_error: String,
    },
    /// 流被取消。
    StreamCancelled {
        ts: String,
        trace_id: String,
        deltas: usize,
    },
    /// 因上下文超限删除了最旧的历史。
    CacheTrimmed {
        ts: String,
        trace_id: String,
        removed: usize,
    },
    /// 历史被整体清空。
    CacheReset { ts: String, session: String },
    /// 新请求顶替了仍在运行的旧请求。
    WorkerSuperseded { ts: String, session: String },
}

tokio::task_local! {
    static TRACE_ID: String;
}

static TRACE_COUNTER: AtomicU64 = AtomicU64::new(0);
static TRACE_ID_FALLBACK: OnceLock<RwLock<Option<String>>> = OnceLock::new();

/// task-local 不会跨 `tokio::spawn` 继承，这里保留一个进程级回退槽位。
fn trace_id_fallback_slot() -> &'static RwLock<Option<String>> {
    TRACE_ID_FALLBACK.get_or_init(|| RwLock::new(None))
}

struct TraceIdFallbackGuard {
    previous: Option<String>,
}

impl TraceIdFallbackGuard {
    fn install(current: &str) -> Self {
        let mut slot = trace_id_fallback_slot()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let previous = slot.replace(current.to_string());
        Self { previous }
    }
}

impl Drop for TraceIdFallbackGuard {
    fn drop(&mut self) {
        let mut slot = trace_id_fallback_slot()
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = self.previous.take();
    }
}

/// 生成 trace_id：unix 时间戳 + 单调计数器，十六进制输出。
pub fn new_trace_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let counter = TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}{:x}{:x}", now.as_secs(), now.subsec_nanos(), counter)
}

/// 在给定 trace_id 的 scope 内执行异步逻辑。
pub async fn with_trace_id<T>(trace_id: String, fut: impl std::future::Future<Output = T>) -> T {
    let _fallback_guard = TraceIdFallbackGuard::install(&trace_id);
    TRACE_ID.scope(trace_id, fut).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|value| value.clone()).ok().or_else(|| {
        trace_id_fallback_slot()
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    })
}

/// 当前 trace_id，不在 scope 内时返回 `-`。
pub fn trace_id_or_dash() -> String {
    current_trace_id().unwrap_or_else(|| "-".to_string())
}

pub fn ts() -> String {
    Local::now().to_rfc3339()
}

/// 事件日志写到哪里。`Disabled` 用于测试与不希望落盘的嵌入场景。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventLog {
    Disabled,
    /// 写入 `<workspace>/.scribe/logs/scribe-YYYYMMDD.log`。
    Workspace(PathBuf),
}

impl EventLog {
    pub fn record(&self, event: ScribeEvent) {
        if let EventLog::Workspace(root) = self {
            log_event_best_effort(root, event);
        }
    }
}

fn logs_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".scribe").join("logs")
}

fn daily_log_path(workspace_root: &Path) -> PathBuf {
    let filename = format!("scribe-{}.log", Local::now().format("%Y%m%d"));
    logs_dir(workspace_root).join(filename)
}

pub fn log_event(workspace_root: &Path, event: &ScribeEvent) -> io::Result<()> {
    fs::create_dir_all(logs_dir(workspace_root))?;
    let json = to_json_line(event)?;
    append_utf8_json_line(&daily_log_path(workspace_root), &json)
}

/// 写日志失败只打印告警，不影响请求本身。
pub fn log_event_best_effort(workspace_root: &Path, event: ScribeEvent) {
    if let Err(error) = log_event(workspace_root, &event) {
        eprintln!(
            "写入结构化日志失败（已忽略）: {} ({error})",
            daily_log_path(workspace_root).display()
        );
    }
}

pub fn workspace_root_best_effort() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
