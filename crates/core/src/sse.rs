//! SSE 帧解析。
//!
//! 传输层给出的分块与行边界无关：一个分块可能包含多行，一行也可能跨多个分块，
//! 甚至一个 UTF-8 字符被截断在两块之间。`LineBuffer` 负责拼回完整的行，
//! `parse_line` 负责把单行转换为增量片段。

use serde_json::Value;

use crate::{error::AssistError, types::Delta};

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

/// 一行 SSE 数据的解析结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    Delta(Delta),
    /// 流结束标记，不携带 JSON。
    Done,
}

/// 按 `\n` 切分字节流，保留尚未结束的半行。
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// 追加一个分块，返回其中已完整的行（不含换行符）。
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, AssistError> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=position).collect();
            lines.push(decode_line(&line[..line.len() - 1])?);
        }
        Ok(lines)
    }

    /// 流结束时取出最后一个没有换行结尾的行。
    pub fn finish(&mut self) -> Result<Option<String>, AssistError> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let rest = std::mem::take(&mut self.pending);
        decode_line(&rest).map(Some)
    }
}

fn decode_line(bytes: &[u8]) -> Result<String, AssistError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|error| AssistError::Unknown(format!("SSE 数据不是合法 UTF-8: {error}")))?;
    Ok(text.strip_suffix('\r').unwrap_or(text).to_string())
}

/// 解析单行。
///
/// - 非 `data:` 行（空行、注释、`event:` 等）返回 `None`；
/// - `data: [DONE]` 返回 `SseFrame::Done`；
/// - 其余数据行必须是 JSON，取 `choices[0].delta`；没有 delta 的帧返回 `None`。
pub fn parse_line(line: &str) -> Result<Option<SseFrame>, AssistError> {
    let Some(data) = line.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let data = data.trim();
    if data == DONE_SENTINEL {
        return Ok(Some(SseFrame::Done));
    }

    let event: Value = serde_json::from_str(data)
        .map_err(|error| AssistError::Unknown(format!("SSE 帧解析失败: {error}, data: {data}")))?;

    if let Some(message) = stream_error_message(&event) {
        return Err(AssistError::Unknown(message));
    }

    let Some(delta) = event
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("delta"))
    else {
        return Ok(None);
    };

    let delta: Delta = serde_json::from_value(delta.clone())
        .map_err(|error| AssistError::Unknown(format!("SSE delta 结构不符: {error}, data: {data}")))?;
    Ok(Some(SseFrame::Delta(delta)))
}

/// 部分网关会在流中途用 `{"error": ...}` 帧报告错误。
fn stream_error_message(event: &Value) -> Option<String> {
    let error = event.get("error")?;
    if let Some(message) = error.get("message").and_then(Value::as_str) {
        return Some(message.to_string());
    }
    if let Some(message) = error.as_str() {
        return Some(message.to_string());
    }
    Some("流式响应中出现未知错误".to_string())
}
