use serde::Serialize;

use crate::{
    cache::{SharedCache, lock},
    error::AssistError,
    settings::{AssistantProfile, PromptMode},
    types::{MESSAGE_NAME, Message},
};

/// chat/completions 请求体。序列化后不再修改。
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest<'a> {
    pub messages: Vec<Message>,
    pub model: &'a str,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    /// 固定为 true，本客户端只走流式响应。
    pub stream: bool,
}

/// 用户一次操作的输入。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionInput {
    /// 编辑器中选中的文本。
    pub selected_text: Option<String>,
    /// 选区所在语法名，用于代码块标注，例如 `rust`。
    pub syntax: Option<String>,
    /// 输入框中填写的指令。
    pub command: Option<String>,
}

/// 按模式拼出完整的消息序列。
///
/// 仅 panel 模式携带历史；无论哪种模式，最后一条都是助手角色提示。
pub fn compose_messages(
    profile: &AssistantProfile,
    history: &[Message],
    new_messages: &[Message],
) -> Vec<Message> {
    let mut messages = Vec::with_capacity(history.len() + new_messages.len() + 1);
    if profile.prompt_mode == PromptMode::Panel {
        messages.extend_from_slice(history);
    }
    messages.extend_from_slice(new_messages);
    messages.push(Message::system(profile.assistant_role.clone()));
    messages
}

/// 序列化好的请求体，附带消息条数供日志使用。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub body: String,
    pub message_count: usize,
}

/// 构建并序列化请求体；只在 panel 模式下读取缓存。
pub fn build_payload(
    profile: &AssistantProfile,
    cache: &SharedCache,
    new_messages: &[Message],
) -> Result<Payload, AssistError> {
    let history = if profile.prompt_mode == PromptMode::Panel {
        lock(cache).read_all()?
    } else {
        Vec::new()
    };
    let messages = compose_messages(profile, &history, new_messages);
    let message_count = messages.len();
    Ok(Payload {
        body: serialize_request(profile, messages)?,
        message_count,
    })
}

fn serialize_request(
    profile: &AssistantProfile,
    messages: Vec<Message>,
) -> Result<String, AssistError> {
    let request = ChatRequest {
        messages,
        model: &profile.chat_model,
        temperature: profile.temperature,
        max_tokens: profile.max_tokens,
        top_p: profile.top_p,
        stream: true,
    };
    serde_json::to_string(&request)
        .map_err(|error| AssistError::Unknown(format!("序列化请求体失败: {error}")))
}

/// 把用户输入转换为本轮的新消息。
///
/// 顺序：占位符说明（system）-> 选中文本（user，包在代码块里）-> 指令（user）。
pub fn create_messages(input: &CompletionInput, placeholder: Option<&str>) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(placeholder) = placeholder.filter(|value| !value.is_empty()) {
        messages.push(Message::system(format!("placeholder: {placeholder}")).with_name(MESSAGE_NAME));
    }
    if let Some(text) = input.selected_text.as_deref().filter(|text| !text.is_empty()) {
        let fenced = format!(
            "```{}\n{}\n```",
            input.syntax.as_deref().unwrap_or_default(),
            text
        );
        messages.push(Message::user(fenced).with_name(MESSAGE_NAME));
    }
    if let Some(command) = input.command.as_deref().filter(|command| !command.is_empty()) {
        messages.push(Message::user(command).with_name(MESSAGE_NAME));
    }
    messages
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::{
        cache::{MemoryCache, shared},
        types::Role,
    };

    fn profile(mode: PromptMode) -> AssistantProfile {
        AssistantProfile {
            prompt_mode: mode,
            assistant_role: "be brief".to_string(),
            ..Default::default()
        }
    }

    fn history() -> Vec<Message> {
        vec![Message::user("old question"), Message::assistant("old answer")]
    }

    #[test]
    fn system_reminder_is_always_last_and_unique() {
        let new_messages = vec![Message::user("q")];
        for mode in [
            PromptMode::Panel,
            PromptMode::Append,
            PromptMode::Replace,
            PromptMode::Insert,
        ] {
            for history_len in [0, 2] {
                let messages =
                    compose_messages(&profile(mode), &history()[..history_len], &new_messages);
                let last = messages.last().expect("messages should not be empty");
                assert_eq!(last.role, Role::System);
                assert_eq!(last.content, "be brief");
                let reminders = messages
                    .iter()
                    .filter(|message| message.content == "be brief")
                    .count();
                assert_eq!(reminders, 1);
            }
        }
    }

    #[test]
    fn only_panel_mode_carries_history() {
        let new_messages = vec![Message::user("q")];
        let panel = compose_messages(&profile(PromptMode::Panel), &history(), &new_messages);
        assert_eq!(panel.len(), 4);
        assert_eq!(panel[0].content, "old question");

        let replace = compose_messages(&profile(PromptMode::Replace), &history(), &new_messages);
        assert_eq!(replace.len(), 2);
        assert_eq!(replace[0].content, "q");
    }

    #[test]
    fn serialized_payload_has_streaming_schema() {
        let cache = shared(MemoryCache::with_messages(history()));
        let payload = build_payload(&profile(PromptMode::Panel), &cache, &[Message::user("q")])
            .expect("payload should serialize");
        assert_eq!(payload.message_count, 4);
        let value: Value = serde_json::from_str(&payload.body).expect("payload should be json");

        assert_eq!(value["stream"], Value::Bool(true));
        assert_eq!(value["model"], "gpt-4o-mini");
        assert_eq!(value["max_tokens"], 2048);
        assert_eq!(value["messages"].as_array().map(Vec::len), Some(4));
        assert_eq!(value["messages"][3]["role"], "system");
    }

    #[test]
    fn payload_ignores_cache_outside_panel_mode() {
        let cache = shared(MemoryCache::with_messages(history()));
        let payload = build_payload(&profile(PromptMode::Insert), &cache, &[Message::user("q")])
            .expect("payload should serialize");
        assert_eq!(payload.message_count, 2);
    }

    #[test]
    fn create_messages_wraps_selection_and_orders_parts() {
        let input = CompletionInput {
            selected_text: Some("fn main() {}".to_string()),
            syntax: Some("rust".to_string()),
            command: Some("explain".to_string()),
        };
        let messages = create_messages(&input, Some("[insert]"));
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "placeholder: [insert]");
        assert_eq!(messages[1].content, "```rust\nfn main() {}\n```");
        assert_eq!(messages[2].content, "explain");
        assert!(
            messages
                .iter()
                .all(|message| message.name.as_deref() == Some(MESSAGE_NAME))
        );
    }

    #[test]
    fn create_messages_skips_empty_parts() {
        let input = CompletionInput {
            command: Some("hello".to_string()),
            ..Default::default()
        };
        let messages = create_messages(&input, None);
        assert_eq!(messages, vec![Message::user("hello").with_name(MESSAGE_NAME)]);
    }
}
