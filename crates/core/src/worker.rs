//! 单次请求的后台 worker。
//!
//! 状态流转：`Idle -> Sending -> Streaming -> {Completed | Cancelled | Failed}`。
//! 上下文超限时按 `TrimRetryPlan` 裁剪历史后重新发送，其余错误直接上报。

use std::{sync::Arc, time::Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{SharedCache, lock},
    client::ChatTransport,
    error::AssistError,
    observability::{EventLog, ScribeEvent, new_trace_id, trace_id_or_dash, ts, with_trace_id},
    payload::build_payload,
    settings::{AssistantProfile, PromptMode},
    sink::DeltaSink,
    sse::{LineBuffer, SseFrame, parse_line},
    types::{Delta, Message, ResponseState, Role},
};

/// 上下文超限时每次删除的最旧历史条数（一问一答）。
pub const TRIM_BATCH: usize = 2;
pub const ABORTED_MARKER: &str = "\n\n[Aborted]";
const TRIM_CONFIRM_TITLE: &str = "Delete";

/// 错误展示与确认能力。
///
/// `confirm` 可能阻塞（对话框、终端输入），worker 会放到阻塞线程池里调用。
pub trait Presenter: Send + Sync {
    fn present_error(&self, title: &str, message: &str);
    fn confirm(&self, message: &str, ok_title: &str) -> bool;
}

pub type SharedPresenter = Arc<dyn Presenter>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Cancelled,
    Failed,
}

/// worker 的最终结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed { response: Message },
    Cancelled,
    /// 状态码既不是 200 也不是错误码，静默结束。
    Dismissed { status: u16 },
    Failed(AssistError),
}

impl WorkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerOutcome::Completed { .. } => "completed",
            WorkerOutcome::Cancelled => "cancelled",
            WorkerOutcome::Dismissed { .. } => "dismissed",
            WorkerOutcome::Failed(_) => "failed",
        }
    }

    fn state(&self) -> WorkerState {
        match self {
            WorkerOutcome::Completed { .. } | WorkerOutcome::Dismissed { .. } => {
                WorkerState::Completed
            }
            WorkerOutcome::Cancelled => WorkerState::Cancelled,
            WorkerOutcome::Failed(_) => WorkerState::Failed,
        }
    }
}

/// 上下文裁剪重试计划。
///
/// 只负责“还能不能再试”，不执行请求本身。
#[derive(Debug, Clone)]
pub struct TrimRetryPlan {
    max_retries: u32,
    retries: u32,
}

impl TrimRetryPlan {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retries: 0,
        }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// 消耗一次重试机会，返回这是第几次重试；用尽时返回 `None`。
    pub fn next_retry(&mut self) -> Option<u32> {
        if self.retries >= self.max_retries {
            return None;
        }
        self.retries += 1;
        Some(self.retries)
    }
}

/// 同一会话内所有 worker 共享的依赖。
#[derive(Clone)]
pub struct WorkerContext {
    pub cache: SharedCache,
    pub presenter: SharedPresenter,
    pub events: EventLog,
    pub max_context_retries: u32,
}

/// 一次请求的输入：生效的助手配置与本轮新消息。
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub profile: AssistantProfile,
    pub messages: Vec<Message>,
}

enum LineFlow {
    Continue,
    Done,
}

pub struct Worker<T, S> {
    context: WorkerContext,
    request: WorkerRequest,
    transport: T,
    sink: S,
    cancel: CancellationToken,
    state: watch::Sender<WorkerState>,
    deltas: usize,
}

impl<T, S> Worker<T, S>
where
    T: ChatTransport,
    S: DeltaSink,
{
    pub fn new(
        context: WorkerContext,
        request: WorkerRequest,
        transport: T,
        sink: S,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Idle);
        Self {
            context,
            request,
            transport,
            sink,
            cancel,
            state,
            deltas: 0,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// 运行到终态。整个过程（含重试）共享一个 trace_id。
    pub async fn run(mut self) -> WorkerOutcome {
        with_trace_id(new_trace_id(), self.run_in_scope()).await
    }

    async fn run_in_scope(&mut self) -> WorkerOutcome {
        let started = Instant::now();
        self.sink.echo_question(&self.request.messages);

        let mut plan = TrimRetryPlan::new(self.context.max_context_retries);
        let mut attempt = 1;
        let outcome = loop {
            match self.attempt(attempt).await {
                Ok(outcome) => break outcome,
                Err(error) if error.is_context_length_exceeded() => {
                    self.transport.close();
                    self.record_error(&error, true);
                    match self.recover_context(&mut plan, &error).await {
                        Ok(true) => attempt += 1,
                        Ok(false) => break WorkerOutcome::Failed(error),
                        Err(failure) => break WorkerOutcome::Failed(failure),
                    }
                }
                Err(error) => {
                    self.transport.close();
                    self.record_error(&error, false);
                    break WorkerOutcome::Failed(error);
                }
            }
        };

        self.transport.close();
        if let WorkerOutcome::Failed(error) = &outcome {
            self.context
                .presenter
                .present_error(error.title(), error.message());
        }
        self.state.send_replace(outcome.state());
        self.context.events.record(ScribeEvent::RequestEnd {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            outcome: outcome.as_str().to_string(),
            duration_ms: started.elapsed().as_millis(),
            attempts: attempt,
            deltas: self.deltas,
            error: match &outcome {
                WorkerOutcome::Failed(error) => Some(error.message().to_string()),
                _ => None,
            },
        });
        outcome
    }

    /// 上下文超限：确认后删除最旧的历史并允许下一次尝试。
    ///
    /// 返回 `Ok(false)` 表示用户拒绝、重试次数已用尽或已没有可删的历史。
    async fn recover_context(
        &mut self,
        plan: &mut TrimRetryPlan,
        error: &AssistError,
    ) -> Result<bool, AssistError> {
        // 只有 panel 模式的请求体携带历史，其余模式裁剪不会让请求变短。
        let trimmable = self.request.profile.prompt_mode == PromptMode::Panel
            && !lock(&self.context.cache).read_all()?.is_empty();
        if !trimmable {
            self.record_exhausted(plan, error);
            return Ok(false);
        }
        let Some(retry) = plan.next_retry() else {
            self.record_exhausted(plan, error);
            return Ok(false);
        };

        let presenter = self.context.presenter.clone();
        let message = format!("Delete the two farthest pairs?\n\n{}", error.message());
        let confirmed =
            tokio::task::spawn_blocking(move || presenter.confirm(&message, TRIM_CONFIRM_TITLE))
                .await
                .unwrap_or(false);
        if !confirmed {
            return Ok(false);
        }

        let removed = lock(&self.context.cache).drop_first(TRIM_BATCH)?;
        self.context.events.record(ScribeEvent::CacheTrimmed {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            removed,
        });
        if removed == 0 {
            self.record_exhausted(plan, error);
            return Ok(false);
        }
        self.context.events.record(ScribeEvent::RetryScheduled {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            attempt: retry + 1,
            reason: error.kind().to_string(),
        });
        Ok(true)
    }

    /// 一次完整的发送与流式读取。请求体每次都从缓存重新构建。
    async fn attempt(&mut self, attempt: u32) -> Result<WorkerOutcome, AssistError> {
        let payload = build_payload(
            &self.request.profile,
            &self.context.cache,
            &self.request.messages,
        )?;

        self.state.send_replace(WorkerState::Sending);
        self.context.events.record(ScribeEvent::RequestStart {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            model: self.request.profile.chat_model.clone(),
            prompt_mode: self.request.profile.prompt_mode.as_str().to_string(),
            messages: payload.message_count,
            attempt,
        });

        let cancel = self.cancel.clone();
        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = self.transport.send(payload.body) => Some(status?),
        };
        let Some(status) = status else {
            self.cancel_before_response()?;
            return Ok(WorkerOutcome::Cancelled);
        };
        if status != 200 {
            return Ok(WorkerOutcome::Dismissed { status });
        }

        self.sink.begin()?;
        self.state.send_replace(WorkerState::Streaming);

        let mut response = ResponseState::default();
        let mut lines = LineBuffer::default();
        let mut done = false;
        'stream: loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                chunk = self.transport.next_chunk() => Some(chunk?),
            };
            if cancel.is_cancelled() {
                self.abort(&mut response);
                return Ok(WorkerOutcome::Cancelled);
            }
            let Some(Some(chunk)) = chunk else {
                break;
            };
            for line in lines.push(&chunk)? {
                if let LineFlow::Done = self.handle_line(&line, &mut response)? {
                    done = true;
                    break 'stream;
                }
            }
        }
        // `[DONE]` 之后的残余数据不再解析。
        if !done && let Some(line) = lines.finish()? {
            self.handle_line(&line, &mut response)?;
        }
        self.transport.close();

        let response = response.into_message();
        if self.request.profile.prompt_mode == PromptMode::Panel {
            let mut turn = self.request.messages.clone();
            turn.push(response.clone());
            lock(&self.context.cache).append(&turn)?;
        }
        Ok(WorkerOutcome::Completed { response })
    }

    fn handle_line(
        &mut self,
        line: &str,
        response: &mut ResponseState,
    ) -> Result<LineFlow, AssistError> {
        match parse_line(line)? {
            Some(SseFrame::Done) => Ok(LineFlow::Done),
            Some(SseFrame::Delta(delta)) => {
                self.forward(&delta, response);
                Ok(LineFlow::Continue)
            }
            None => Ok(LineFlow::Continue),
        }
    }

    fn forward(&mut self, delta: &Delta, response: &mut ResponseState) {
        response.merge(delta);
        self.sink.apply(delta);
        self.deltas += 1;
    }

    fn abort(&mut self, response: &mut ResponseState) {
        self.forward(&Delta::role(Role::Assistant), response);
        self.forward(&Delta::content(ABORTED_MARKER), response);
        self.transport.close();
        self.record_cancelled();
    }

    /// 响应到达前被取消。面板里已经回显了问题，补上回答标题和中止标记；
    /// 编辑器缓冲区保持原样。
    fn cancel_before_response(&mut self) -> Result<(), AssistError> {
        if self.request.profile.prompt_mode != PromptMode::Panel {
            self.record_cancelled();
            return Ok(());
        }
        self.sink.begin()?;
        self.abort(&mut ResponseState::default());
        Ok(())
    }

    fn record_exhausted(&self, plan: &TrimRetryPlan, error: &AssistError) {
        self.context.events.record(ScribeEvent::RetryExhausted {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            attempts: plan.retries() + 1,
            last_error: error.message().to_string(),
        });
    }

    fn record_cancelled(&self) {
        self.context.events.record(ScribeEvent::StreamCancelled {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            deltas: self.deltas,
        });
    }

    fn record_error(&self, error: &AssistError, retryable: bool) {
        self.context.events.record(ScribeEvent::ErrorClassified {
            ts: ts(),
            trace_id: trace_id_or_dash(),
            kind: error.kind().to_string(),
            message: error.message().to_string(),
            retryable,
        });
    }
}
