use std::io::{self, BufRead, Write};

use crossterm::style::Stylize;
use scribe_core::worker::Presenter;

/// 确认问题的回答方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmPolicy {
    /// 从标准输入读取 y/N。
    Ask,
    /// 非交互场景下的固定回答。
    Always(bool),
}

/// 终端错误展示：错误写到 stderr，确认从 stdin 读取。
#[derive(Debug, Clone)]
pub struct TerminalPresenter {
    policy: ConfirmPolicy,
}

impl Default for TerminalPresenter {
    fn default() -> Self {
        Self::new(ConfirmPolicy::Ask)
    }
}

impl TerminalPresenter {
    pub fn new(policy: ConfirmPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConfirmPolicy {
        self.policy
    }
}

/// 解析 y/N 回答，空输入视为拒绝。
pub fn parse_answer(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "y" | "yes" | "ok"
    )
}

impl Presenter for TerminalPresenter {
    fn present_error(&self, title: &str, message: &str) {
        eprintln!("{}: {}", title.red().bold(), message);
    }

    fn confirm(&self, message: &str, ok_title: &str) -> bool {
        if let ConfirmPolicy::Always(answer) = self.policy {
            return answer;
        }

        let mut stderr = io::stderr();
        let _ = write!(stderr, "{}\n{} [y/N] ", message.yellow(), ok_title.bold());
        let _ = stderr.flush();

        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => parse_answer(&line),
            Err(error) => {
                eprintln!("读取确认输入失败，按拒绝处理: {error}");
                false
            }
        }
    }
}
