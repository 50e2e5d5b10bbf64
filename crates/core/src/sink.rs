//! 输出路由：把增量片段写到面板或编辑器缓冲区。
//!
//! 四种策略在请求开始前按助手配置选定一次，流式过程中不会切换。

use std::{
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    error::AssistError,
    settings::PromptMode,
    types::{Delta, Message},
};

pub const QUESTION_HEADING: &str = "\n\n## Question\n\n";
pub const ANSWER_HEADING: &str = "\n\n## Answer\n\n";

/// 编辑器文本缓冲区能力。所有偏移量都按字符计。
pub trait TextBuffer: Send {
    fn text(&self) -> String;
    /// 当前选区；空区间表示光标位置。
    fn selection(&self) -> Range<usize>;
    fn set_selection(&mut self, range: Range<usize>);
    /// 在 `offset` 处插入文本，返回插入的字符数。
    fn insert(&mut self, offset: usize, text: &str) -> usize;
    fn delete(&mut self, range: Range<usize>);
}

/// 输出面板能力。
pub trait OutputPanel: Send {
    fn append(&mut self, text: &str);
    fn scroll_to_end(&mut self);
    fn show(&mut self);
    fn clear(&mut self);
}

pub type SharedBuffer = Arc<Mutex<dyn TextBuffer>>;
pub type SharedPanel = Arc<Mutex<dyn OutputPanel>>;

fn lock_buffer(buffer: &SharedBuffer) -> MutexGuard<'_, dyn TextBuffer + 'static> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn lock_panel(panel: &SharedPanel) -> MutexGuard<'_, dyn OutputPanel + 'static> {
    panel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 当前编辑器窗口：一个文本缓冲区加一个共享输出面板。
#[derive(Clone)]
pub struct EditorSurface {
    pub buffer: SharedBuffer,
    pub panel: SharedPanel,
}

impl EditorSurface {
    pub fn new<B, P>(buffer: B, panel: P) -> Self
    where
        B: TextBuffer + 'static,
        P: OutputPanel + 'static,
    {
        Self {
            buffer: Arc::new(Mutex::new(buffer)),
            panel: Arc::new(Mutex::new(panel)),
        }
    }
}

/// worker 驱动的输出端。
pub trait DeltaSink: Send {
    /// 发送前回显本轮问题（仅面板模式有效）。
    fn echo_question(&mut self, _messages: &[Message]) {}

    /// 拿到可读的响应后、第一个片段之前调用一次。
    fn begin(&mut self) -> Result<(), AssistError>;

    fn apply(&mut self, delta: &Delta);
}

/// 四种输出策略。
pub enum OutputSink {
    Panel {
        panel: SharedPanel,
    },
    Append {
        buffer: SharedBuffer,
        cursor: usize,
    },
    Replace {
        buffer: SharedBuffer,
        region: Range<usize>,
        cursor: usize,
    },
    Insert {
        buffer: SharedBuffer,
        placeholder: String,
        search_from: usize,
        cursor: usize,
    },
}

impl OutputSink {
    /// 按模式选定输出端。
    ///
    /// insert 模式在这里完成占位符校验，失败时请求不会发出。
    pub fn select(
        mode: PromptMode,
        placeholder: Option<&str>,
        surface: &EditorSurface,
    ) -> Result<Self, AssistError> {
        match mode {
            PromptMode::Panel => Ok(OutputSink::Panel {
                panel: surface.panel.clone(),
            }),
            PromptMode::Append => {
                let cursor = lock_buffer(&surface.buffer).selection().end;
                Ok(OutputSink::Append {
                    buffer: surface.buffer.clone(),
                    cursor,
                })
            }
            PromptMode::Replace => {
                let region = lock_buffer(&surface.buffer).selection();
                Ok(OutputSink::Replace {
                    buffer: surface.buffer.clone(),
                    cursor: region.start,
                    region,
                })
            }
            PromptMode::Insert => {
                let Some(placeholder) = placeholder.filter(|value| !value.is_empty()) else {
                    return Err(AssistError::WrongUserInput(
                        "当前助手没有配置占位符，请在助手配置中添加 `placeholder`。".to_string(),
                    ));
                };
                let search_from = {
                    let buffer = lock_buffer(&surface.buffer);
                    let search_from = buffer.selection().start;
                    find_placeholder(&buffer.text(), search_from, placeholder)?;
                    search_from
                };
                Ok(OutputSink::Insert {
                    buffer: surface.buffer.clone(),
                    placeholder: placeholder.to_string(),
                    search_from,
                    cursor: search_from,
                })
            }
        }
    }

    pub fn mode(&self) -> PromptMode {
        match self {
            OutputSink::Panel { .. } => PromptMode::Panel,
            OutputSink::Append { .. } => PromptMode::Append,
            OutputSink::Replace { .. } => PromptMode::Replace,
            OutputSink::Insert { .. } => PromptMode::Insert,
        }
    }
}

impl DeltaSink for OutputSink {
    fn echo_question(&mut self, messages: &[Message]) {
        if let OutputSink::Panel { panel } = self {
            let mut panel = lock_panel(panel);
            panel.append(QUESTION_HEADING);
            for message in messages {
                panel.append(&message.content);
                panel.append("\n\n");
            }
        }
    }

    fn begin(&mut self) -> Result<(), AssistError> {
        match self {
            OutputSink::Panel { panel } => {
                let mut panel = lock_panel(panel);
                panel.append(ANSWER_HEADING);
                panel.show();
                panel.scroll_to_end();
            }
            OutputSink::Append { buffer, cursor } => {
                let mut buffer = lock_buffer(buffer);
                buffer.set_selection(*cursor..*cursor);
                *cursor += buffer.insert(*cursor, "\n");
                buffer.set_selection(*cursor..*cursor);
            }
            OutputSink::Replace {
                buffer,
                region,
                cursor,
            } => {
                let mut buffer = lock_buffer(buffer);
                buffer.delete(region.clone());
                *cursor = region.start;
                buffer.set_selection(*cursor..*cursor);
            }
            OutputSink::Insert {
                buffer,
                placeholder,
                search_from,
                cursor,
            } => {
                // 发送期间缓冲区可能被编辑过，这里重新定位一次。
                let mut buffer = lock_buffer(buffer);
                let found = find_placeholder(&buffer.text(), *search_from, placeholder)?;
                buffer.delete(found.clone());
                *cursor = found.start;
                buffer.set_selection(*cursor..*cursor);
            }
        }
        Ok(())
    }

    fn apply(&mut self, delta: &Delta) {
        let Some(content) = delta.content.as_deref() else {
            return;
        };
        match self {
            OutputSink::Panel { panel } => {
                let mut panel = lock_panel(panel);
                panel.append(content);
                panel.scroll_to_end();
            }
            OutputSink::Append { buffer, cursor }
            | OutputSink::Replace { buffer, cursor, .. }
            | OutputSink::Insert { buffer, cursor, .. } => {
                let mut buffer = lock_buffer(buffer);
                *cursor += buffer.insert(*cursor, content);
                buffer.set_selection(*cursor..*cursor);
            }
        }
    }
}

/// 从 `from`（字符偏移）开始按字面量查找占位符，要求恰好出现一次。
pub fn find_placeholder(
    text: &str,
    from: usize,
    placeholder: &str,
) -> Result<Range<usize>, AssistError> {
    let start_byte = text
        .char_indices()
        .nth(from)
        .map(|(index, _)| index)
        .unwrap_or(text.len());
    let haystack = &text[start_byte..];

    let mut matches = haystack.match_indices(placeholder);
    let Some((first, _)) = matches.next() else {
        return Err(AssistError::WrongUserInput(format!(
            "选中文本中没有找到占位符 `{placeholder}`，需要恰好一个。"
        )));
    };
    if matches.next().is_some() {
        return Err(AssistError::WrongUserInput(format!(
            "占位符 `{placeholder}` 出现了多次，需要恰好一个。"
        )));
    }

    let start = from + haystack[..first].chars().count();
    Ok(start..start + placeholder.chars().count())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 测试用的最小文本缓冲区。
    #[derive(Debug, Default)]
    pub(crate) struct StringBuffer {
        pub chars: Vec<char>,
        pub selection: Range<usize>,
    }

    impl StringBuffer {
        pub(crate) fn new(text: &str, selection: Range<usize>) -> Self {
            Self {
                chars: text.chars().collect(),
                selection,
            }
        }
    }

    impl TextBuffer for StringBuffer {
        fn text(&self) -> String {
            self.chars.iter().collect()
        }

        fn selection(&self) -> Range<usize> {
            self.selection.clone()
        }

        fn set_selection(&mut self, range: Range<usize>) {
            self.selection = range;
        }

        fn insert(&mut self, offset: usize, text: &str) -> usize {
            let inserted: Vec<char> = text.chars().collect();
            let count = inserted.len();
            self.chars.splice(offset..offset, inserted);
            count
        }

        fn delete(&mut self, range: Range<usize>) {
            self.chars.drain(range);
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct StringPanel {
        pub text: String,
        pub visible: bool,
        pub scrolls: usize,
    }

    impl OutputPanel for StringPanel {
        fn append(&mut self, text: &str) {
            self.text.push_str(text);
        }

        fn scroll_to_end(&mut self) {
            self.scrolls += 1;
        }

        fn show(&mut self) {
            self.visible = true;
        }

        fn clear(&mut self) {
            self.text.clear();
        }
    }

    pub(crate) fn surface(text: &str, selection: Range<usize>) -> EditorSurface {
        EditorSurface::new(StringBuffer::new(text, selection), StringPanel::default())
    }

    fn buffer_text(surface: &EditorSurface) -> String {
        lock_buffer(&surface.buffer).text()
    }

    fn stream(sink: &mut OutputSink, parts: &[&str]) {
        sink.begin().expect("sink should begin");
        sink.apply(&Delta::role(crate::types::Role::Assistant));
        for part in parts {
            sink.apply(&Delta::content(*part));
        }
    }

    #[test]
    fn find_placeholder_is_literal_and_unique() {
        assert_eq!(
            find_placeholder("a [insert] b", 0, "[insert]").expect("should match"),
            2..10
        );
        // 字面量查找：`.` 不是通配符。
        assert!(find_placeholder("abc", 0, "a.c").is_err());
        assert!(find_placeholder("[x] [x]", 0, "[x]").is_err());
        // 只在起点之后查找。
        assert_eq!(
            find_placeholder("[x] 中 [x]", 3, "[x]").expect("should match after offset"),
            6..9
        );
    }

    #[test]
    fn insert_mode_without_match_fails_at_selection() {
        let surface = surface("no marker here", 0..14);
        let error = OutputSink::select(PromptMode::Insert, Some("[insert]"), &surface)
            .err()
            .expect("missing placeholder should fail");
        assert_eq!(error.kind(), "wrong_user_input");

        let error = OutputSink::select(PromptMode::Insert, None, &surface)
            .err()
            .expect("unset placeholder should fail");
        assert_eq!(error.kind(), "wrong_user_input");
    }

    #[test]
    fn insert_mode_replaces_placeholder_with_stream() {
        let surface = surface("fn a() { [insert] }", 0..19);
        let mut sink = OutputSink::select(PromptMode::Insert, Some("[insert]"), &surface)
            .expect("placeholder should be found");
        stream(&mut sink, &["x", " + 1"]);
        assert_eq!(buffer_text(&surface), "fn a() { x + 1 }");
    }

    #[test]
    fn replace_mode_deletes_selection_first() {
        let surface = surface("keep OLD keep", 5..8);
        let mut sink =
            OutputSink::select(PromptMode::Replace, None, &surface).expect("sink should select");
        stream(&mut sink, &["N", "EW"]);
        assert_eq!(buffer_text(&surface), "keep NEW keep");
    }

    #[test]
    fn append_mode_inserts_after_selection_on_new_line() {
        let surface = surface("question", 0..8);
        let mut sink =
            OutputSink::select(PromptMode::Append, None, &surface).expect("sink should select");
        stream(&mut sink, &["answer"]);
        assert_eq!(buffer_text(&surface), "question\nanswer");
        assert_eq!(lock_buffer(&surface.buffer).selection(), 15..15);
    }

    #[test]
    fn panel_mode_writes_headings_and_content() {
        let panel = Arc::new(Mutex::new(StringPanel::default()));
        let surface = EditorSurface {
            buffer: Arc::new(Mutex::new(StringBuffer::new("", 0..0))),
            panel: panel.clone(),
        };
        let mut sink =
            OutputSink::select(PromptMode::Panel, None, &surface).expect("sink should select");
        sink.echo_question(&[Message::user("why?")]);
        stream(&mut sink, &["because"]);

        let panel = panel.lock().expect("panel lock should not be poisoned");
        assert_eq!(
            panel.text,
            "\n\n## Question\n\nwhy?\n\n\n\n## Answer\n\nbecause"
        );
        assert!(panel.visible);
        assert_eq!(sink.mode(), PromptMode::Panel);
    }
}
