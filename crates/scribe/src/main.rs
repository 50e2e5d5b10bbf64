use std::{
    ops::Range,
    path::PathBuf,
    process::ExitCode,
    sync::{Arc, Mutex},
};

use anyhow::{Result, bail};
use clap::Parser;
use scribe_core::{
    cache::{FileCache, SharedCache, lock, shared},
    client::NetworkClient,
    commands::{CommandMode, prepare_completion},
    error::AssistError,
    observability::{EventLog, workspace_root_best_effort},
    payload::CompletionInput,
    session::Session,
    settings::{PromptMode, Settings},
    sink::{EditorSurface, SharedPanel, lock_panel},
    worker::{Presenter, WorkerContext, WorkerOutcome},
};
use surface::{
    buffer::DocumentBuffer,
    history::render_history,
    panel::ConsolePanel,
    presenter::{ConfirmPolicy, TerminalPresenter},
};

#[derive(Parser)]
#[command(name = "scribe")]
#[command(about = "Stream chat completions into a document or the terminal", long_about = None)]
struct Cli {
    /// 配置文件，默认 `.scribe/settings.toml`
    #[arg(long)]
    settings: Option<PathBuf>,
    /// 要编辑的文档
    #[arg(long)]
    file: Option<PathBuf>,
    /// 选区，按字符偏移：`START..END`
    #[arg(long, value_parser = parse_selection)]
    select: Option<Range<usize>>,
    /// 代码块语法名，默认按文件扩展名推断
    #[arg(long)]
    syntax: Option<String>,
    /// 使用指定名字的助手，并记为当前助手
    #[arg(long)]
    assistant: Option<String>,
    /// chat_completion | reset_chat_history | refresh_output_panel
    #[arg(long, default_value = "chat_completion")]
    mode: String,
    /// 上下文超限时不询问，直接裁剪历史
    #[arg(long)]
    yes: bool,
    /// 发给助手的指令
    command: Vec<String>,
}

fn parse_selection(value: &str) -> Result<Range<usize>, String> {
    let (start, end) = value
        .split_once("..")
        .ok_or_else(|| format!("选区格式应为 START..END: {value}"))?;
    let start = start
        .trim()
        .parse::<usize>()
        .map_err(|error| format!("选区起点无效 `{start}`: {error}"))?;
    let end = end
        .trim()
        .parse::<usize>()
        .map_err(|error| format!("选区终点无效 `{end}`: {error}"))?;
    if end < start {
        return Err(format!("选区终点不能小于起点: {value}"));
    }
    Ok(start..end)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    configure_console_encoding_best_effort();
    let cli = Cli::parse();

    let Some(mode) = CommandMode::match_command(&cli.mode) else {
        bail!("未知命令 `{}`", cli.mode);
    };

    let workspace_root = workspace_root_best_effort();
    let settings_path = cli
        .settings
        .clone()
        .unwrap_or_else(|| Settings::default_path(&workspace_root));
    let settings = Settings::load(&settings_path)?;

    let cache: SharedCache = shared(FileCache::open(
        &settings.cache_dir(&workspace_root),
        &settings.cache.session,
    )?);
    let presenter = Arc::new(TerminalPresenter::new(if cli.yes {
        ConfirmPolicy::Always(true)
    } else {
        ConfirmPolicy::Ask
    }));
    let panel: SharedPanel = Arc::new(Mutex::new(ConsolePanel::stdout(settings.markdown)));
    let mut session = Session::new(
        settings.cache.session.clone(),
        WorkerContext {
            cache: cache.clone(),
            presenter: presenter.clone(),
            events: EventLog::Workspace(workspace_root.clone()),
            max_context_retries: settings.max_context_retries,
        },
    );

    match mode {
        CommandMode::ResetChatHistory => {
            if let Err(error) = session.reset_history().await {
                presenter.present_error(error.title(), error.message());
                return Ok(ExitCode::FAILURE);
            }
            lock_panel(&panel).clear();
            eprintln!("已清空会话 `{}` 的历史。", session.name());
            Ok(ExitCode::SUCCESS)
        }
        CommandMode::RefreshOutputPanel => {
            let history = lock(&cache).read_all()?;
            let mut panel = lock_panel(&panel);
            panel.clear();
            panel.append(&render_history(&history));
            panel.show();
            panel.scroll_to_end();
            println!();
            Ok(ExitCode::SUCCESS)
        }
        CommandMode::ChatCompletion => {
            match chat_completion(&cli, &settings, &cache, panel, &mut session).await {
                Ok(code) => Ok(code),
                Err(error) => {
                    presenter.present_error(error.title(), error.message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
    }
}

/// 发起一次补全并等待结束；非 panel 模式把结果写回文档。
async fn chat_completion(
    cli: &Cli,
    settings: &Settings,
    cache: &SharedCache,
    panel: SharedPanel,
    session: &mut Session,
) -> Result<ExitCode, AssistError> {
    let mut document = match &cli.file {
        Some(path) => DocumentBuffer::from_file(path)?,
        None => DocumentBuffer::new("untitled", ""),
    };
    if let Some(range) = cli.select.clone() {
        document.select(range);
    }
    let selected = document.selected_text();
    let syntax = cli.syntax.clone().or_else(|| document.syntax());
    let document = Arc::new(Mutex::new(document));
    let surface = EditorSurface {
        buffer: document.clone(),
        panel,
    };

    let current = lock(cache).read_model()?;
    let profile = settings.resolve_profile(current.as_ref(), cli.assistant.as_deref())?;
    if let Some(name) = cli.assistant.as_deref()
        && let Some(overlay) = settings.assistant_named(name)
    {
        lock(cache).save_model(overlay)?;
    }
    if let Some(hint) = settings.status_hint(&profile) {
        eprintln!("{hint}");
    }

    let input = CompletionInput {
        selected_text: Some(selected).filter(|text| !text.is_empty()),
        syntax,
        command: Some(cli.command.join(" ")).filter(|command| !command.trim().is_empty()),
    };
    let prepared = prepare_completion(settings, &profile, &input, &surface)?;
    let client = NetworkClient::new(settings)?;

    session.submit(prepared.request, client, prepared.sink).await;
    if let Some(token) = session.cancel_token() {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                token.cancel();
            }
        });
    }

    let outcome = session.wait().await;
    if profile.prompt_mode == PromptMode::Panel {
        lock_panel(&surface.panel).scroll_to_end();
        println!();
    } else if matches!(
        outcome,
        Some(WorkerOutcome::Completed { .. } | WorkerOutcome::Cancelled)
    ) {
        let mut document = document
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if document.save()?.is_none() {
            print!("{}", document.contents());
        }
    }

    Ok(match outcome {
        Some(WorkerOutcome::Failed(_)) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

/// 启动阶段尽早把 Windows 控制台切到 UTF-8，中文输入输出才不会乱码。
fn configure_console_encoding_best_effort() {
    #[cfg(windows)]
    {
        if let Err(error) = windows_console::configure_utf8_console() {
            eprintln!("Windows 控制台 UTF-8 初始化失败：{error}");
            eprintln!("兼容提示：可先执行 chcp 65001，再重启当前终端会话。");
        }
    }
}

#[cfg(windows)]
mod windows_console {
    use anyhow::anyhow;
    use windows_sys::Win32::System::Console::{
        GetConsoleCP, GetConsoleOutputCP, SetConsoleCP, SetConsoleOutputCP,
    };

    const UTF8_CODE_PAGE: u32 = 65001;

    /// 输入与输出 code page 同时切到 65001；确认命令从 stdin 读取，两者都需要。
    pub fn configure_utf8_console() -> anyhow::Result<()> {
        let input = unsafe { GetConsoleCP() };
        if input != UTF8_CODE_PAGE && unsafe { SetConsoleCP(UTF8_CODE_PAGE) } == 0 {
            return Err(anyhow!("设置控制台输入编码失败（from={input}）"));
        }
        let output = unsafe { GetConsoleOutputCP() };
        if output != UTF8_CODE_PAGE && unsafe { SetConsoleOutputCP(UTF8_CODE_PAGE) } == 0 {
            return Err(anyhow!("设置控制台输出编码失败（from={output}）"));
        }
        Ok(())
    }
}
