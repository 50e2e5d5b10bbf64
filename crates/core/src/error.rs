use thiserror::Error;

/// 面向用户展示的统一标题。
pub const ERROR_TITLE: &str = "Scribe error";

/// 请求链路上的错误分类。
///
/// 网络、解析等底层错误都会在 worker 边界被归一为这三类之一，
/// 原始传输错误不会直接透出到展示层。取消不属于错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssistError {
    /// 调用方可自行修正的前置条件错误，请求不会发出。
    #[error("{0}")]
    WrongUserInput(String),
    /// 对话超出模型上下文窗口，可通过裁剪历史后重试恢复。
    #[error("{0}")]
    ContextLengthExceeded(String),
    /// 其余服务端错误、传输错误或流帧格式错误。
    #[error("{0}")]
    Unknown(String),
}

impl AssistError {
    pub fn title(&self) -> &'static str {
        ERROR_TITLE
    }

    pub fn message(&self) -> &str {
        match self {
            AssistError::WrongUserInput(message)
            | AssistError::ContextLengthExceeded(message)
            | AssistError::Unknown(message) => message,
        }
    }

    /// 结构化日志里使用的稳定分类名。
    pub fn kind(&self) -> &'static str {
        match self {
            AssistError::WrongUserInput(_) => "wrong_user_input",
            AssistError::ContextLengthExceeded(_) => "context_length_exceeded",
            AssistError::Unknown(_) => "unknown",
        }
    }

    pub fn is_context_length_exceeded(&self) -> bool {
        matches!(self, AssistError::ContextLengthExceeded(_))
    }
}

impl From<anyhow::Error> for AssistError {
    fn from(error: anyhow::Error) -> Self {
        AssistError::Unknown(format!("{error:#}"))
    }
}

impl From<reqwest::Error> for AssistError {
    fn from(error: reqwest::Error) -> Self {
        AssistError::Unknown(error.to_string())
    }
}
