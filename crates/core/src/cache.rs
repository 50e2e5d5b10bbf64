use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};

use crate::{
    encoding::{
        append_json_lines, read_json_lines, read_utf8_text_with_report, write_json_lines,
        write_utf8_text,
    },
    settings::AssistantProfileOverride,
    types::Message,
};

/// 对话历史缓存能力。
///
/// 只允许尾部追加；删除只能从最旧的一端开始（`drop_first`）或整体清空。
pub trait ConversationCache: Send {
    fn read_all(&self) -> Result<Vec<Message>>;
    fn append(&mut self, messages: &[Message]) -> Result<()>;
    /// 删除最旧的 `count` 条，返回实际删除的条数。
    fn drop_first(&mut self, count: usize) -> Result<usize>;
    fn drop_all(&mut self) -> Result<()>;
    /// 当前选中的助手，由助手切换命令写入。
    fn read_model(&self) -> Result<Option<AssistantProfileOverride>>;
    fn save_model(&mut self, assistant: &AssistantProfileOverride) -> Result<()>;
}

/// 会话与 worker 共用的缓存句柄。
///
/// 没有细粒度并发控制：同一时刻只有一个活动 worker 写入，由 `Session` 保证。
pub type SharedCache = Arc<Mutex<dyn ConversationCache>>;

pub fn shared<C: ConversationCache + 'static>(cache: C) -> SharedCache {
    Arc::new(Mutex::new(cache))
}

/// 获取缓存锁；锁中毒时沿用内部数据。
pub fn lock(cache: &SharedCache) -> MutexGuard<'_, dyn ConversationCache + 'static> {
    cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 纯内存缓存，进程退出即丢弃。
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    messages: Vec<Message>,
    model: Option<AssistantProfileOverride>,
}

impl MemoryCache {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages,
            model: None,
        }
    }
}

impl ConversationCache for MemoryCache {
    fn read_all(&self) -> Result<Vec<Message>> {
        Ok(self.messages.clone())
    }

    fn append(&mut self, messages: &[Message]) -> Result<()> {
        self.messages.extend_from_slice(messages);
        Ok(())
    }

    fn drop_first(&mut self, count: usize) -> Result<usize> {
        let removed = count.min(self.messages.len());
        self.messages.drain(..removed);
        Ok(removed)
    }

    fn drop_all(&mut self) -> Result<()> {
        self.messages.clear();
        Ok(())
    }

    fn read_model(&self) -> Result<Option<AssistantProfileOverride>> {
        Ok(self.model.clone())
    }

    fn save_model(&mut self, assistant: &AssistantProfileOverride) -> Result<()> {
        self.model = Some(assistant.clone());
        Ok(())
    }
}

/// 文件缓存：历史为 JSON Lines，当前助手为单个 JSON 文件。
///
/// 文件布局：
/// - `<dir>/<session>_history.jsonl`
/// - `<dir>/<session>_model.json`
#[derive(Debug, Clone)]
pub struct FileCache {
    history_path: PathBuf,
    model_path: PathBuf,
}

impl FileCache {
    pub fn open(dir: &Path, session: &str) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("创建缓存目录失败: {}", dir.display()))?;
        let session = sanitize_session_name(session);
        Ok(Self {
            history_path: dir.join(format!("{session}_history.jsonl")),
            model_path: dir.join(format!("{session}_model.json")),
        })
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }
}

impl ConversationCache for FileCache {
    fn read_all(&self) -> Result<Vec<Message>> {
        read_json_lines(&self.history_path)
            .with_context(|| format!("读取历史缓存失败: {}", self.history_path.display()))
    }

    fn append(&mut self, messages: &[Message]) -> Result<()> {
        // 一问一答整体写入，避免只落盘半轮。
        append_json_lines(&self.history_path, messages)
            .with_context(|| format!("写入历史缓存失败: {}", self.history_path.display()))
    }

    fn drop_first(&mut self, count: usize) -> Result<usize> {
        let mut messages = self.read_all()?;
        let removed = count.min(messages.len());
        if removed == 0 {
            return Ok(0);
        }
        messages.drain(..removed);
        write_json_lines(&self.history_path, &messages)
            .with_context(|| format!("重写历史缓存失败: {}", self.history_path.display()))?;
        Ok(removed)
    }

    fn drop_all(&mut self) -> Result<()> {
        if self.history_path.exists() {
            write_utf8_text(&self.history_path, "")
                .with_context(|| format!("清空历史缓存失败: {}", self.history_path.display()))?;
        }
        Ok(())
    }

    fn read_model(&self) -> Result<Option<AssistantProfileOverride>> {
        if !self.model_path.exists() {
            return Ok(None);
        }
        let (text, report) = read_utf8_text_with_report(&self.model_path)
            .with_context(|| format!("读取当前助手失败: {}", self.model_path.display()))?;
        if report.has_warning() {
            report.emit_warnings("assistant cache", &self.model_path);
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        let assistant = serde_json::from_str(&text)
            .with_context(|| format!("解析当前助手失败: {}", self.model_path.display()))?;
        Ok(Some(assistant))
    }

    fn save_model(&mut self, assistant: &AssistantProfileOverride) -> Result<()> {
        let mut text = serde_json::to_string_pretty(assistant).context("序列化当前助手失败")?;
        text.push('\n');
        write_utf8_text(&self.model_path, &text)
            .with_context(|| format!("写入当前助手失败: {}", self.model_path.display()))
    }
}

/// 会话名直接参与文件名，只保留安全字符。
fn sanitize_session_name(session: &str) -> String {
    let cleaned: String = session
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}
