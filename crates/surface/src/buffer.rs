use std::{
    cmp::min,
    ops::Range,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use scribe_core::{
    encoding::{read_utf8_text_with_report, write_utf8_text},
    sink::TextBuffer,
};

// 字符索引转字节索引。
fn char_to_byte_index(input: &str, char_idx: usize) -> usize {
    input
        .char_indices()
        .nth(char_idx)
        .map(|(idx, _)| idx)
        .unwrap_or(input.len())
}

/// 内存中的文档，选区与光标都按字符偏移记录。
#[derive(Debug, Clone, Default)]
pub struct DocumentBuffer {
    pub name: String,
    pub path: Option<PathBuf>,
    text: String,
    selection: Range<usize>,
    modified: bool,
}

impl DocumentBuffer {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    // 从文件加载缓冲区。
    pub fn from_file(path: &Path) -> Result<Self> {
        let (text, report) = read_utf8_text_with_report(path)
            .with_context(|| format!("读取文档失败: {}", path.display()))?;
        if report.has_warning() {
            report.emit_warnings("document", path);
        }
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("untitled")
            .to_string();
        Ok(Self {
            name,
            path: Some(path.to_path_buf()),
            text,
            ..Default::default()
        })
    }

    pub fn contents(&self) -> &str {
        &self.text
    }

    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }

    /// 设置选区，越界部分截断到文末。
    pub fn select(&mut self, range: Range<usize>) {
        let len = self.char_count();
        let start = min(range.start, len);
        let end = min(range.end.max(start), len);
        self.selection = start..end;
    }

    pub fn selected_text(&self) -> String {
        self.text
            .chars()
            .skip(self.selection.start)
            .take(self.selection.len())
            .collect()
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// 按扩展名猜测语法名，用于代码块标注。
    pub fn syntax(&self) -> Option<String> {
        let extension = self.path.as_ref()?.extension()?.to_str()?;
        let syntax = match extension {
            "rs" => "rust",
            "py" => "python",
            "js" | "mjs" => "javascript",
            "ts" => "typescript",
            "md" => "markdown",
            "sh" => "bash",
            "toml" => "toml",
            "json" => "json",
            other => other,
        };
        Some(syntax.to_string())
    }

    // 保存缓冲区内容到文件。
    pub fn save(&mut self) -> Result<Option<PathBuf>> {
        let Some(path) = self.path.clone() else {
            return Ok(None);
        };
        write_utf8_text(&path, &self.text)
            .with_context(|| format!("写回文档失败: {}", path.display()))?;
        self.modified = false;
        Ok(Some(path))
    }
}

impl TextBuffer for DocumentBuffer {
    fn text(&self) -> String {
        self.text.clone()
    }

    fn selection(&self) -> Range<usize> {
        self.selection.clone()
    }

    fn set_selection(&mut self, range: Range<usize>) {
        self.select(range);
    }

    fn insert(&mut self, offset: usize, text: &str) -> usize {
        let byte_idx = char_to_byte_index(&self.text, offset);
        self.text.insert_str(byte_idx, text);
        self.modified = true;
        text.chars().count()
    }

    fn delete(&mut self, range: Range<usize>) {
        let start = char_to_byte_index(&self.text, range.start);
        let end = char_to_byte_index(&self.text, range.end.max(range.start));
        self.text.replace_range(start..end, "");
        self.modified = true;
        self.select(self.selection.clone());
    }
}
