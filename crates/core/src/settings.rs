use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{encoding::read_utf8_text_with_report, error::AssistError};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com";
/// token 少于该长度视为未配置。
const MIN_TOKEN_LEN: usize = 10;
const TOKEN_ENV_VARS: [&str; 2] = ["SCRIBE_API_KEY", "OPENAI_API_KEY"];

/// 输出写回编辑器的方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// 写入共享输出面板，唯一保留多轮上下文的模式。
    Panel,
    /// 在光标处追加。
    Append,
    /// 替换当前选区。
    Replace,
    /// 替换选区内的占位符。
    Insert,
}

impl PromptMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PromptMode::Panel => "panel",
            PromptMode::Append => "append",
            PromptMode::Replace => "replace",
            PromptMode::Insert => "insert",
        }
    }
}

/// 一次请求使用的助手配置，请求期间不可变。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantProfile {
    pub name: String,
    pub chat_model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub top_p: f64,
    pub prompt_mode: PromptMode,
    pub placeholder: Option<String>,
    pub assistant_role: String,
}

impl Default for AssistantProfile {
    fn default() -> Self {
        Self {
            name: "general assistant".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            temperature: 1.0,
            max_tokens: 2048,
            top_p: 1.0,
            prompt_mode: PromptMode::Panel,
            placeholder: None,
            assistant_role: "You are a senior software engineer. Answer concisely and keep code \
                             in fenced blocks."
                .to_string(),
        }
    }
}

/// 配置文件中的助手条目，字段均可缺省，缺省字段沿用默认助手。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssistantProfileOverride {
    pub name: Option<String>,
    pub chat_model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub prompt_mode: Option<PromptMode>,
    pub placeholder: Option<String>,
    pub assistant_role: Option<String>,
}

impl AssistantProfileOverride {
    /// 把覆盖叠加到基础配置上（Some 覆盖，None 保持）。
    pub fn apply_to(&self, mut base: AssistantProfile) -> AssistantProfile {
        if let Some(value) = &self.name {
            base.name = value.clone();
        }
        if let Some(value) = &self.chat_model {
            base.chat_model = value.clone();
        }
        if let Some(value) = self.temperature {
            base.temperature = value;
        }
        if let Some(value) = self.max_tokens {
            base.max_tokens = value;
        }
        if let Some(value) = self.top_p {
            base.top_p = value;
        }
        if let Some(value) = self.prompt_mode {
            base.prompt_mode = value;
        }
        if let Some(value) = &self.placeholder {
            base.placeholder = Some(value.clone());
        }
        if let Some(value) = &self.assistant_role {
            base.assistant_role = value.clone();
        }
        base
    }
}

/// HTTP 代理配置。地址与端口都非空时才会启用隧道。
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxySettings {
    /// 返回代理 URL；地址或端口缺失时返回 None，表示直连。
    pub fn proxy_url(&self) -> Option<String> {
        let address = self.address.trim();
        let port = self.port.filter(|port| *port != 0)?;
        if address.is_empty() {
            return None;
        }
        if address.contains("://") {
            Some(format!("{address}:{port}"))
        } else {
            Some(format!("http://{address}:{port}"))
        }
    }

    /// 返回 Basic 认证凭据；用户名与密码都为空时不注入认证头。
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self.username.clone().unwrap_or_default();
        let password = self.password.clone().unwrap_or_default();
        if username.is_empty() && password.is_empty() {
            None
        } else {
            Some((username, password))
        }
    }
}

/// 历史缓存位置。`session` 相同的编辑器窗口共享同一份历史。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub dir: Option<PathBuf>,
    pub session: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            session: "default".to_string(),
        }
    }
}

/// 状态栏可展示的助手字段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusHintField {
    Name,
    PromptMode,
    ChatModel,
}

/// 插件全局配置，读取自 `.scribe/settings.toml`。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub token: String,
    pub api_base: String,
    pub markdown: bool,
    pub minimum_selection_length: usize,
    pub status_hint: Vec<StatusHintField>,
    /// 上下文超限时最多裁剪重试的次数。
    pub max_context_retries: u32,
    pub proxy: Option<ProxySettings>,
    pub cache: CacheSettings,
    pub assistants: Vec<AssistantProfileOverride>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            markdown: true,
            minimum_selection_length: 10,
            status_hint: Vec::new(),
            max_context_retries: 8,
            proxy: None,
            cache: CacheSettings::default(),
            assistants: Vec::new(),
        }
    }
}

impl Settings {
    /// 默认配置路径：`<workspace>/.scribe/settings.toml`。
    pub fn default_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".scribe").join("settings.toml")
    }

    /// 读取配置文件；文件不存在或为空时使用默认值。
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let (text, report) = read_utf8_text_with_report(path)
            .with_context(|| format!("读取配置失败: {}", path.display()))?;
        if report.has_warning() {
            report.emit_warnings("settings", path);
        }
        Self::parse(&text).with_context(|| format!("解析配置失败: {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(toml::from_str(text)?)
    }

    /// 历史缓存目录，未配置时落在 `<workspace>/.scribe/cache`。
    pub fn cache_dir(&self, workspace_root: &Path) -> PathBuf {
        self.cache
            .dir
            .clone()
            .unwrap_or_else(|| workspace_root.join(".scribe").join("cache"))
    }

    /// 解析可用 token：配置优先，其次按顺序读取环境变量。
    pub fn resolve_token(&self) -> Result<String, AssistError> {
        let mut token = self.token.trim().to_string();
        if token.is_empty() {
            token = TOKEN_ENV_VARS
                .iter()
                .filter_map(|name| std::env::var(name).ok())
                .map(|value| value.trim().to_string())
                .find(|value| !value.is_empty())
                .unwrap_or_default();
        }
        validate_token(&token)?;
        Ok(token)
    }

    pub fn assistant_named(&self, name: &str) -> Option<&AssistantProfileOverride> {
        self.assistants
            .iter()
            .find(|assistant| assistant.name.as_deref() == Some(name))
    }

    /// 叠加出本次请求使用的助手配置。
    ///
    /// 显式指定的助手直接叠加在内置默认之上；否则依次取缓存中记录的当前助手、
    /// 第一个配置的助手。不同助手之间不继承字段。
    pub fn resolve_profile(
        &self,
        current: Option<&AssistantProfileOverride>,
        selected: Option<&str>,
    ) -> Result<AssistantProfile, AssistError> {
        let overlay = match selected {
            Some(name) => Some(self.assistant_named(name).ok_or_else(|| {
                AssistError::WrongUserInput(format!("配置中不存在名为 `{name}` 的助手。"))
            })?),
            None => current.or_else(|| self.assistants.first()),
        };
        Ok(overlay
            .map(|overlay| overlay.apply_to(AssistantProfile::default()))
            .unwrap_or_default())
    }

    /// 按 `status_hint` 生成状态栏文本；未配置时返回 None。
    pub fn status_hint(&self, profile: &AssistantProfile) -> Option<String> {
        let mut parts = Vec::new();
        for field in [
            StatusHintField::Name,
            StatusHintField::PromptMode,
            StatusHintField::ChatModel,
        ] {
            if !self.status_hint.contains(&field) {
                continue;
            }
            parts.push(match field {
                StatusHintField::Name => title_case(&profile.name),
                StatusHintField::PromptMode => title_case(profile.prompt_mode.as_str()),
                StatusHintField::ChatModel => profile.chat_model.to_uppercase(),
            });
        }

        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(format!("[{}]", parts.join(" | "))),
        }
    }
}

pub fn validate_token(token: &str) -> Result<(), AssistError> {
    if token.chars().count() < MIN_TOKEN_LEN {
        return Err(AssistError::WrongUserInput(
            "未提供 API token，请在配置文件中设置 `token` 或环境变量 SCRIBE_API_KEY。".to_string(),
        ));
    }
    Ok(())
}

fn title_case(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut at_word_start = true;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if at_word_start {
                result.extend(ch.to_uppercase());
            } else {
                result.extend(ch.to_lowercase());
            }
            at_word_start = false;
        } else {
            result.push(ch);
            at_word_start = true;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
token = "sk-test-0123456789"
markdown = false
status_hint = ["name", "prompt_mode", "chat_model"]

[proxy]
address = "127.0.0.1"
port = 8080
username = "me"
password = "secret"

[cache]
session = "window-1"

[[assistants]]
name = "insert coder"
prompt_mode = "insert"
placeholder = "[insert]"
chat_model = "gpt-4o"

[[assistants]]
name = "refactor"
prompt_mode = "replace"
temperature = 0.2
"#;

    #[test]
    fn parse_should_fill_missing_fields_with_defaults() {
        let settings = Settings::parse(SAMPLE).expect("sample settings should parse");
        assert!(!settings.markdown);
        assert_eq!(settings.api_base, DEFAULT_API_BASE);
        assert_eq!(settings.minimum_selection_length, 10);
        assert_eq!(settings.cache.session, "window-1");
        assert_eq!(settings.assistants.len(), 2);
    }

    #[test]
    fn empty_text_is_default_settings() {
        assert_eq!(
            Settings::parse("  \n").expect("blank text should parse"),
            Settings::default()
        );
    }

    #[test]
    fn resolve_profile_overlays_first_assistant_then_selected() {
        let settings = Settings::parse(SAMPLE).expect("sample settings should parse");

        let first = settings
            .resolve_profile(None, None)
            .expect("default profile should resolve");
        assert_eq!(first.name, "insert coder");
        assert_eq!(first.prompt_mode, PromptMode::Insert);
        assert_eq!(first.max_tokens, AssistantProfile::default().max_tokens);

        let selected = settings
            .resolve_profile(None, Some("refactor"))
            .expect("named profile should resolve");
        assert_eq!(selected.prompt_mode, PromptMode::Replace);
        assert_eq!(selected.temperature, 0.2);
        // 未覆盖的字段回到内置默认，不沿用第一个助手。
        assert_eq!(selected.chat_model, AssistantProfile::default().chat_model);
        assert_eq!(selected.placeholder, None);
    }

    #[test]
    fn switching_assistant_does_not_inherit_from_current_one() {
        let settings = Settings::parse(SAMPLE).expect("sample settings should parse");
        let current = AssistantProfileOverride {
            name: Some("inserter".to_string()),
            prompt_mode: Some(PromptMode::Insert),
            placeholder: Some("[insert]".to_string()),
            assistant_role: Some("You fill placeholders only.".to_string()),
            ..Default::default()
        };
        let profile = settings
            .resolve_profile(Some(&current), Some("refactor"))
            .expect("named profile should resolve");

        let defaults = AssistantProfile::default();
        assert_eq!(profile.name, "refactor");
        assert_eq!(profile.prompt_mode, PromptMode::Replace);
        assert_eq!(profile.assistant_role, defaults.assistant_role);
        assert_eq!(profile.placeholder, None);
    }

    #[test]
    fn resolve_profile_prefers_cached_current_assistant() {
        let settings = Settings::parse(SAMPLE).expect("sample settings should parse");
        let current = AssistantProfileOverride {
            name: Some("cached".to_string()),
            prompt_mode: Some(PromptMode::Append),
            ..Default::default()
        };
        let profile = settings
            .resolve_profile(Some(&current), None)
            .expect("cached profile should resolve");
        assert_eq!(profile.name, "cached");
        assert_eq!(profile.prompt_mode, PromptMode::Append);
    }

    #[test]
    fn unknown_assistant_is_wrong_user_input() {
        let settings = Settings::default();
        let error = settings
            .resolve_profile(None, Some("missing"))
            .expect_err("unknown assistant should fail");
        assert_eq!(error.kind(), "wrong_user_input");
    }

    #[test]
    fn proxy_requires_address_and_port() {
        let settings = Settings::parse(SAMPLE).expect("sample settings should parse");
        let proxy = settings.proxy.expect("proxy should be configured");
        assert_eq!(proxy.proxy_url().as_deref(), Some("http://127.0.0.1:8080"));
        assert_eq!(
            proxy.credentials(),
            Some(("me".to_string(), "secret".to_string()))
        );

        let no_port = ProxySettings {
            address: "127.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(no_port.proxy_url(), None);
        assert_eq!(no_port.credentials(), None);
    }

    #[test]
    fn short_token_is_rejected() {
        assert!(validate_token("sk-short").is_err());
        assert!(validate_token("sk-long-enough").is_ok());
    }

    #[test]
    fn status_hint_formats_selected_fields() {
        let mut settings = Settings::parse(SAMPLE).expect("sample settings should parse");
        let profile = settings
            .resolve_profile(None, None)
            .expect("profile should resolve");
        assert_eq!(
            settings.status_hint(&profile).as_deref(),
            Some("[Insert Coder | Insert | GPT-4O]")
        );

        settings.status_hint = vec![StatusHintField::ChatModel];
        assert_eq!(settings.status_hint(&profile).as_deref(), Some("GPT-4O"));

        settings.status_hint.clear();
        assert_eq!(settings.status_hint(&profile), None);
    }
}
