use std::io::{self, Stdout, Write};

use crossterm::{
    queue,
    style::{Attribute, Print, SetAttribute},
};
use scribe_core::sink::OutputPanel;

const HEADING_PREFIX: &str = "## ";

/// 跨 `append` 调用的行状态：流式片段可能把标题前缀拆开。
#[derive(Debug, Default)]
struct LineState {
    mid_line: bool,
    heading: bool,
    /// 行首尚不足以判断是否为标题的前缀。
    pending: String,
}

/// 终端里的输出面板。
///
/// 始终保留完整记录；面板可见后才写入 writer，首次显示时补写之前的内容。
pub struct ConsolePanel<W: Write + Send> {
    writer: W,
    transcript: String,
    visible: bool,
    markdown: bool,
    line: LineState,
}

impl ConsolePanel<Stdout> {
    pub fn stdout(markdown: bool) -> Self {
        Self::new(io::stdout(), markdown)
    }
}

impl<W: Write + Send> ConsolePanel<W> {
    pub fn new(writer: W, markdown: bool) -> Self {
        Self {
            writer,
            transcript: String::new(),
            visible: false,
            markdown,
            line: LineState::default(),
        }
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    // markdown 模式下 `## ` 开头的行加粗。
    fn write_text(&mut self, text: &str) -> io::Result<()> {
        if !self.markdown {
            return queue!(self.writer, Print(text));
        }
        for piece in text.split_inclusive('\n') {
            if self.line.mid_line {
                queue!(self.writer, Print(piece))?;
            } else {
                self.line.pending.push_str(piece);
                let pending = self.line.pending.as_str();
                if !pending.ends_with('\n')
                    && pending.len() < HEADING_PREFIX.len()
                    && HEADING_PREFIX.starts_with(pending)
                {
                    continue;
                }
                let start = std::mem::take(&mut self.line.pending);
                self.line.mid_line = true;
                self.line.heading = start.starts_with(HEADING_PREFIX);
                if self.line.heading {
                    queue!(self.writer, SetAttribute(Attribute::Bold))?;
                }
                queue!(self.writer, Print(start))?;
            }
            if piece.ends_with('\n') {
                self.end_line()?;
            }
        }
        Ok(())
    }

    fn end_line(&mut self) -> io::Result<()> {
        if self.line.heading {
            queue!(self.writer, SetAttribute(Attribute::Reset))?;
        }
        self.line = LineState::default();
        Ok(())
    }

    /// 输出暂存的行首前缀，之后这一行不再按标题处理。
    fn flush_pending(&mut self) -> io::Result<()> {
        if self.line.pending.is_empty() {
            return Ok(());
        }
        let start = std::mem::take(&mut self.line.pending);
        self.line.mid_line = true;
        queue!(self.writer, Print(start))
    }

    fn report(result: io::Result<()>) {
        if let Err(error) = result {
            eprintln!("输出面板写入失败（已忽略）: {error}");
        }
    }
}

impl<W: Write + Send> OutputPanel for ConsolePanel<W> {
    fn append(&mut self, text: &str) {
        self.transcript.push_str(text);
        if self.visible {
            let result = self.write_text(text);
            Self::report(result);
        }
    }

    fn scroll_to_end(&mut self) {
        if self.visible {
            let result = self.flush_pending().and_then(|_| self.writer.flush());
            Self::report(result);
        }
    }

    fn show(&mut self) {
        if self.visible {
            return;
        }
        self.visible = true;
        let transcript = self.transcript.clone();
        let result = self.write_text(&transcript).and_then(|_| self.writer.flush());
        Self::report(result);
    }

    fn clear(&mut self) {
        self.transcript.clear();
        if self.visible {
            let result = self.end_line();
            Self::report(result);
        }
    }
}
