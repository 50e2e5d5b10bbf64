use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use serde::{Serialize, de::DeserializeOwned};

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// 读取文本时自动完成的兼容处理。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextEncodingReport {
    /// 文件头带有 UTF-8 BOM，读取时已移除。
    pub had_utf8_bom: bool,
    /// CRLF/CR 行尾已统一为 LF。
    pub normalized_line_endings: bool,
}

impl TextEncodingReport {
    pub fn has_warning(&self) -> bool {
        self.had_utf8_bom || self.normalized_line_endings
    }

    pub fn warnings_for(&self, path: &Path) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.had_utf8_bom {
            warnings.push(format!("检测到 UTF-8 BOM，已移除：{}", path.display()));
        }
        if self.normalized_line_endings {
            warnings.push(format!("CRLF/CR 行尾已转换为 LF：{}", path.display()));
        }
        warnings
    }

    /// 逐条打印告警，`label` 标明是哪类文件。
    pub fn emit_warnings(&self, label: &str, path: &Path) {
        for warning in self.warnings_for(path) {
            eprintln!("{label} encoding warning: {warning}");
        }
    }
}

/// 读取 UTF-8 文本（兼容 BOM，行尾归一为 LF），非 UTF-8 内容直接报错。
pub fn read_utf8_text_with_report(path: &Path) -> io::Result<(String, TextEncodingReport)> {
    let bytes = fs::read(path)?;
    let mut report = TextEncodingReport::default();
    let body = match bytes.strip_prefix(&UTF8_BOM) {
        Some(rest) => {
            report.had_utf8_bom = true;
            rest
        }
        None => &bytes[..],
    };

    let decoded = std::str::from_utf8(body).map_err(|error| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("文件不是 UTF-8 编码: {} ({error})", path.display()),
        )
    })?;

    let normalized = normalize_to_lf(decoded);
    report.normalized_line_endings = normalized != decoded;
    Ok((normalized, report))
}

/// 以无 BOM 的 UTF-8 整体覆盖写入。
pub fn write_utf8_text(path: &Path, content: &str) -> io::Result<()> {
    reject_corrupted_text(path, content)?;
    fs::write(path, normalize_to_lf(content).as_bytes())
}

/// 追加一行 JSON Line；内容中不允许出现换行。
pub fn append_utf8_json_line(path: &Path, line: &str) -> io::Result<()> {
    reject_corrupted_text(path, line)?;
    if line.contains('\n') || line.contains('\r') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("JSON Line 内容包含换行符: {}", path.display()),
        ));
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")
}

/// 读取 JSON Lines 文件，文件不存在时返回空列表。空行会被跳过。
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> io::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let (text, report) = read_utf8_text_with_report(path)?;
    if report.has_warning() {
        report.emit_warnings("json lines", path);
    }

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|error| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("第 {} 行 JSON 解析失败: {} ({error})", index + 1, path.display()),
                )
            })
        })
        .collect()
}

/// 用给定记录整体重写 JSON Lines 文件。
pub fn write_json_lines<T: Serialize>(path: &Path, items: &[T]) -> io::Result<()> {
    write_utf8_text(path, &json_lines_text(items)?)
}

/// 把一批记录一次性追加到 JSON Lines 文件；任何一条序列化失败都不会写入。
pub fn append_json_lines<T: Serialize>(path: &Path, items: &[T]) -> io::Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let text = json_lines_text(items)?;
    reject_corrupted_text(path, &text)?;

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(text.as_bytes())
}

/// 序列化为单行 JSON。U+FFFD 与 U+FEFF 只会出现在字符串里，转成 `\uXXXX` 转义，
/// 这样合法内容里的这两个字符不会被写入检查拦下。
pub fn to_json_line<T: Serialize>(item: &T) -> io::Result<String> {
    let line = serde_json::to_string(item)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    if !line.contains(['\u{FFFD}', '\u{FEFF}']) {
        return Ok(line);
    }
    Ok(line.replace('\u{FFFD}', "\\ufffd").replace('\u{FEFF}', "\\ufeff"))
}

fn json_lines_text<T: Serialize>(items: &[T]) -> io::Result<String> {
    let mut text = String::new();
    for item in items {
        text.push_str(&to_json_line(item)?);
        text.push('\n');
    }
    Ok(text)
}

fn normalize_to_lf(text: &str) -> String {
    if !text.contains('\r') {
        return text.to_string();
    }
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn reject_corrupted_text(path: &Path, content: &str) -> io::Result<()> {
    // U+FFFD 意味着上游已经发生过有损解码。
    if content.contains('\u{FFFD}') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("待写入文本包含 U+FFFD，拒绝写入: {}", path.display()),
        ));
    }
    if content.contains('\u{FEFF}') {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("待写入文本包含 U+FEFF，拒绝写入: {}", path.display()),
        ));
    }
    Ok(())
}
