use serde::{Deserialize, Serialize};

/// 所有由编辑器发出的消息都带上该 `name`，便于服务端区分来源。
pub const MESSAGE_NAME: &str = "scribe_completion";

/// 对话消息角色。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 一条对话消息。
///
/// 创建后不再修改；在对话中的先后顺序即语义顺序。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// 流式响应中的增量片段。
///
/// `role` 与 `content` 都可能缺失：首个片段通常只带 `role`，
/// 后续片段只带 `content`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Option<String>,
}

impl Delta {
    pub fn role(role: Role) -> Self {
        Self {
            role: Some(role),
            content: None,
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            role: None,
            content: Some(content.into()),
        }
    }
}

/// 单次请求期间逐步累积的响应。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseState {
    pub role: Option<Role>,
    pub content: String,
}

impl ResponseState {
    /// 合并一个增量片段：`role` 覆盖，`content` 追加。
    pub fn merge(&mut self, delta: &Delta) {
        if let Some(role) = delta.role {
            self.role = Some(role);
        }
        if let Some(content) = delta.content.as_deref() {
            self.content.push_str(content);
        }
    }

    /// 转换为可写入缓存的消息；未收到 `role` 时按 assistant 处理。
    pub fn into_message(self) -> Message {
        Message::new(self.role.unwrap_or(Role::Assistant), self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_name_is_omitted_when_absent() {
        let json = serde_json::to_string(&Message::user("hi")).expect("message should serialize");
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);

        let named = Message::user("hi").with_name(MESSAGE_NAME);
        let json = serde_json::to_string(&named).expect("message should serialize");
        assert!(json.contains(r#""name":"scribe_completion""#));
    }

    #[test]
    fn response_state_merges_role_and_appends_content() {
        let mut state = ResponseState::default();
        state.merge(&Delta::role(Role::Assistant));
        state.merge(&Delta::content("He"));
        state.merge(&Delta::content("llo"));
        assert_eq!(state.role, Some(Role::Assistant));
        assert_eq!(state.content, "Hello");
        assert_eq!(state.into_message(), Message::assistant("Hello"));
    }

    #[test]
    fn delta_accepts_partial_objects() {
        let delta: Delta = serde_json::from_str(r#"{"content":"x"}"#).expect("delta should parse");
        assert_eq!(delta, Delta::content("x"));
        let empty: Delta = serde_json::from_str("{}").expect("empty delta should parse");
        assert_eq!(empty, Delta::default());
    }
}
