use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::lock,
    client::ChatTransport,
    error::AssistError,
    observability::{ScribeEvent, ts},
    sink::DeltaSink,
    worker::{Worker, WorkerContext, WorkerOutcome, WorkerRequest, WorkerState},
};

struct ActiveWorker {
    cancel: CancellationToken,
    state: watch::Receiver<WorkerState>,
    handle: JoinHandle<WorkerOutcome>,
}

/// 一个编辑器会话：同一时刻最多一个活动 worker。
///
/// 新请求会先取消并等待上一个 worker 结束，再启动新的后台任务，
/// 因此缓存的写入顺序始终与请求顺序一致。
pub struct Session {
    name: String,
    context: WorkerContext,
    active: Option<ActiveWorker>,
}

impl Session {
    pub fn new(name: impl Into<String>, context: WorkerContext) -> Self {
        Self {
            name: name.into(),
            context,
            active: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 启动新请求，顶替仍在运行的旧请求。
    pub async fn submit<T, S>(&mut self, request: WorkerRequest, transport: T, sink: S)
    where
        T: ChatTransport + 'static,
        S: DeltaSink + 'static,
    {
        if let Some(previous) = self.active.take() {
            if !previous.handle.is_finished() {
                self.context.events.record(ScribeEvent::WorkerSuperseded {
                    ts: ts(),
                    session: self.name.clone(),
                });
            }
            previous.cancel.cancel();
            let _ = previous.handle.await;
        }

        let cancel = CancellationToken::new();
        let worker = Worker::new(
            self.context.clone(),
            request,
            transport,
            sink,
            cancel.clone(),
        );
        let state = worker.subscribe();
        let handle = tokio::spawn(worker.run());
        self.active = Some(ActiveWorker {
            cancel,
            state,
            handle,
        });
    }

    /// 请求取消当前 worker；没有活动 worker 时什么都不做。
    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }

    /// 当前 worker 的取消令牌，供 Ctrl-C 等外部信号使用。
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.active.as_ref().map(|active| active.cancel.clone())
    }

    pub fn state(&self) -> WorkerState {
        match &self.active {
            Some(active) => *active.state.borrow(),
            None => WorkerState::Idle,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    /// 等待当前 worker 结束并取回结果，之后会话回到 `Idle`。
    pub async fn wait(&mut self) -> Option<WorkerOutcome> {
        let active = self.active.take()?;
        Some(match active.handle.await {
            Ok(outcome) => outcome,
            Err(error) => WorkerOutcome::Failed(AssistError::Unknown(format!(
                "后台任务异常结束: {error}"
            ))),
        })
    }

    /// 取消当前 worker 并清空整个对话历史。
    pub async fn reset_history(&mut self) -> Result<(), AssistError> {
        if let Some(active) = self.active.take() {
            active.cancel.cancel();
            let _ = active.handle.await;
        }
        lock(&self.context.cache).drop_all()?;
        self.context.events.record(ScribeEvent::CacheReset {
            ts: ts(),
            session: self.name.clone(),
        });
        Ok(())
    }
}
