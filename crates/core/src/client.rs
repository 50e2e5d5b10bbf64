use std::future::Future;

use bytes::Bytes;
use futures::{StreamExt, stream::BoxStream};
use reqwest::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;

use crate::{error::AssistError, settings::Settings};

pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";
const CONTEXT_LENGTH_EXCEEDED_CODE: &str = "context_length_exceeded";

/// 请求传输能力。
///
/// worker 只依赖该 trait：发送请求体、逐块读取响应、关闭连接。
/// `close` 必须幂等，取消、出错之后都可以再调用。
pub trait ChatTransport: Send {
    /// 发送请求体，成功时返回可读取的响应状态码。
    ///
    /// 400..600 的状态码不会返回 Ok，而是被归类为错误。
    fn send(&mut self, payload: String) -> impl Future<Output = Result<u16, AssistError>> + Send;

    /// 读取下一个传输分块；流结束返回 `None`。
    fn next_chunk(&mut self) -> impl Future<Output = Result<Option<Bytes>, AssistError>> + Send;

    fn close(&mut self);
}

/// 基于 reqwest 的 chat/completions 客户端。
pub struct NetworkClient {
    http: reqwest::Client,
    endpoint: String,
    active: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
}

impl NetworkClient {
    /// 按配置创建客户端，token 从配置或环境变量解析。
    pub fn new(settings: &Settings) -> Result<Self, AssistError> {
        let token = settings.resolve_token()?;
        Self::with_token(settings, &token)
    }

    pub fn with_token(settings: &Settings, token: &str) -> Result<Self, AssistError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let bearer = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
            AssistError::WrongUserInput("API token 中包含无法放入请求头的字符。".to_string())
        })?;
        headers.insert(AUTHORIZATION, bearer);

        let mut builder = reqwest::Client::builder().default_headers(headers);
        match settings.proxy.as_ref().and_then(|proxy| {
            proxy
                .proxy_url()
                .map(|url| (url, proxy.credentials()))
        }) {
            Some((url, credentials)) => {
                // https 目标会经由 CONNECT 隧道转发，认证头只发给代理。
                let mut proxy = reqwest::Proxy::all(&url).map_err(|error| {
                    AssistError::WrongUserInput(format!("代理地址无效 `{url}`: {error}"))
                })?;
                if let Some((username, password)) = credentials {
                    proxy = proxy.basic_auth(&username, &password);
                }
                builder = builder.proxy(proxy);
            }
            None => builder = builder.no_proxy(),
        }

        let http = builder.build()?;
        Ok(Self {
            http,
            endpoint: endpoint_url(&settings.api_base),
            active: None,
        })
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }
}

impl ChatTransport for NetworkClient {
    async fn send(&mut self, payload: String) -> Result<u16, AssistError> {
        self.close();
        let response = self.http.post(&self.endpoint).body(payload).send().await?;
        let status = response.status().as_u16();
        if (400..600).contains(&status) {
            let body = response.text().await?;
            return Err(classify_error_response(status, &body));
        }
        self.active = Some(response.bytes_stream().boxed());
        Ok(status)
    }

    async fn next_chunk(&mut self) -> Result<Option<Bytes>, AssistError> {
        let Some(stream) = self.active.as_mut() else {
            return Ok(None);
        };
        match stream.next().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(error)) => Err(error.into()),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        // 丢弃响应流即释放连接；重复调用无副作用。
        self.active = None;
    }
}

fn endpoint_url(api_base: &str) -> String {
    format!("{}{}", api_base.trim().trim_end_matches('/'), CHAT_COMPLETIONS_PATH)
}

/// 把 4xx/5xx 响应体 `{"error": {"code", "message"}}` 归类为错误。
pub fn classify_error_response(status: u16, body: &str) -> AssistError {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return AssistError::Unknown(format!("HTTP {status}: {}", body.trim()));
    };
    let error = value.get("error");
    let code = error
        .and_then(|error| error.get("code"))
        .and_then(Value::as_str);
    let message = error
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {status}: {}", body.trim()));

    if code == Some(CONTEXT_LENGTH_EXCEEDED_CODE) {
        AssistError::ContextLengthExceeded(message)
    } else {
        AssistError::Unknown(message)
    }
}
