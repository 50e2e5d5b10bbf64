use crate::{
    error::AssistError,
    payload::{CompletionInput, create_messages},
    settings::{AssistantProfile, PromptMode, Settings},
    sink::{EditorSurface, OutputSink},
    worker::WorkerRequest,
};

/// 编辑器可触发的命令。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandMode {
    ChatCompletion,
    ResetChatHistory,
    RefreshOutputPanel,
}

impl CommandMode {
    pub fn match_command(command: &str) -> Option<Self> {
        match command.trim() {
            "chat_completion" => Some(CommandMode::ChatCompletion),
            "reset_chat_history" => Some(CommandMode::ResetChatHistory),
            "refresh_output_panel" => Some(CommandMode::RefreshOutputPanel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CommandMode::ChatCompletion => "chat_completion",
            CommandMode::ResetChatHistory => "reset_chat_history",
            CommandMode::RefreshOutputPanel => "refresh_output_panel",
        }
    }
}

/// 一次补全请求在发送前需要准备好的全部内容。
pub struct PreparedCompletion {
    pub request: WorkerRequest,
    pub sink: OutputSink,
}

/// 校验用户输入、选定输出端并生成本轮消息。
///
/// 所有 `WrongUserInput` 都在这里返回，请求不会发出。
pub fn prepare_completion(
    settings: &Settings,
    profile: &AssistantProfile,
    input: &CompletionInput,
    surface: &EditorSurface,
) -> Result<PreparedCompletion, AssistError> {
    if profile.prompt_mode == PromptMode::Panel
        && let Some(selected) = input.selected_text.as_deref()
    {
        let length = selected.chars().count();
        if length > 0 && length < settings.minimum_selection_length {
            return Err(AssistError::WrongUserInput(format!(
                "选中的文本不足 {} 个字符。",
                settings.minimum_selection_length
            )));
        }
    }

    let sink = OutputSink::select(profile.prompt_mode, profile.placeholder.as_deref(), surface)?;
    let placeholder = match profile.prompt_mode {
        PromptMode::Insert => profile.placeholder.as_deref(),
        _ => None,
    };
    let messages = create_messages(input, placeholder);
    if messages.is_empty() {
        return Err(AssistError::WrongUserInput(
            "没有可发送的内容：请选中文本或输入指令。".to_string(),
        ));
    }

    Ok(PreparedCompletion {
        request: WorkerRequest {
            profile: profile.clone(),
            messages,
        },
        sink,
    })
}
