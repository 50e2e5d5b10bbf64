//! Surface crate 的单元测试模块
//!
//! 覆盖文档缓冲区、终端面板、历史渲染与确认输入解析。

use scribe_core::{
    sink::{OutputPanel, TextBuffer},
    types::Message,
};

use crate::{
    buffer::DocumentBuffer,
    history::render_history,
    panel::ConsolePanel,
    presenter::{ConfirmPolicy, TerminalPresenter, parse_answer},
};

#[test]
fn test_buffer_insert_and_delete_by_char_offset() {
    let mut buffer = DocumentBuffer::new("scratch", "中文abc");
    assert_eq!(buffer.insert(2, "-"), 1);
    assert_eq!(buffer.text(), "中文-abc");

    buffer.delete(0..2);
    assert_eq!(buffer.text(), "-abc");
    assert!(buffer.is_modified());
}

#[test]
fn test_buffer_selection_is_clamped() {
    let mut buffer = DocumentBuffer::new("scratch", "hello");
    buffer.select(2..99);
    assert_eq!(buffer.selection(), 2..5);
    assert_eq!(buffer.selected_text(), "llo");

    // 删除后选区不会越界。
    buffer.delete(0..4);
    assert_eq!(buffer.selection(), 1..1);
}

#[test]
fn test_buffer_round_trips_through_file() {
    let dir = tempfile::tempdir().expect("temp dir should be created");
    let path = dir.path().join("main.rs");
    std::fs::write(&path, "fn main() {}\n").expect("fixture should be written");

    let mut buffer = DocumentBuffer::from_file(&path).expect("document should load");
    assert_eq!(buffer.name, "main.rs");
    assert_eq!(buffer.syntax().as_deref(), Some("rust"));

    buffer.insert(0, "// hi\n");
    let saved = buffer.save().expect("document should save");
    assert_eq!(saved.as_deref(), Some(path.as_path()));
    assert_eq!(
        std::fs::read_to_string(&path).expect("saved file should be readable"),
        "// hi\nfn main() {}\n"
    );
    assert!(!buffer.is_modified());
}

#[test]
fn test_buffer_without_path_is_not_saved() {
    let mut buffer = DocumentBuffer::new("scratch", "text");
    assert_eq!(buffer.save().expect("save should not fail"), None);
    assert_eq!(buffer.syntax(), None);
}

#[test]
fn test_panel_writes_only_after_show() {
    let mut panel = ConsolePanel::new(Vec::new(), false);
    panel.append("early ");
    assert!(panel.writer().is_empty());

    panel.show();
    panel.append("late");
    panel.scroll_to_end();
    assert!(panel.is_visible());
    assert_eq!(panel.transcript(), "early late");
    assert_eq!(
        String::from_utf8_lossy(panel.writer()),
        "early late"
    );
}

#[test]
fn test_panel_clear_resets_transcript() {
    let mut panel = ConsolePanel::new(Vec::new(), true);
    panel.append("\n\n## Answer\n\nx");
    panel.clear();
    assert_eq!(panel.transcript(), "");
}

#[test]
fn test_panel_bolds_headings_split_across_appends() {
    let mut panel = ConsolePanel::new(Vec::new(), true);
    panel.show();
    panel.append("intro\n#");
    panel.append("# Ans");
    panel.append("wer\nsee ## not");
    panel.append(" heading\n");
    panel.scroll_to_end();
    assert_eq!(
        String::from_utf8_lossy(panel.writer()),
        "intro\n\u{1b}[1m## Answer\n\u{1b}[0msee ## not heading\n"
    );
}

#[test]
fn test_panel_flushes_pending_line_start_on_scroll() {
    let mut panel = ConsolePanel::new(Vec::new(), true);
    panel.show();
    panel.append("#");
    assert!(panel.writer().is_empty());
    panel.scroll_to_end();
    assert_eq!(String::from_utf8_lossy(panel.writer()), "#");
}

#[test]
fn test_render_history_matches_streamed_layout() {
    let messages = vec![
        Message::user("```rust\nfn a() {}\n```"),
        Message::user("explain"),
        Message::assistant("It does nothing."),
        Message::user("thanks"),
        Message::assistant("You're welcome."),
    ];
    assert_eq!(
        render_history(&messages),
        "\n\n## Question\n\n```rust\nfn a() {}\n```\n\nexplain\n\n\n\n## Answer\n\nIt does nothing.\
         \n\n## Question\n\nthanks\n\n\n\n## Answer\n\nYou're welcome."
    );
    assert_eq!(render_history(&[]), "");
}

#[test]
fn test_parse_answer() {
    assert!(parse_answer("y\n"));
    assert!(parse_answer(" YES "));
    assert!(!parse_answer(""));
    assert!(!parse_answer("n"));
}

#[test]
fn test_fixed_policy_skips_stdin() {
    use scribe_core::worker::Presenter;

    let presenter = TerminalPresenter::new(ConfirmPolicy::Always(true));
    assert!(presenter.confirm("Delete?", "Delete"));
    assert_eq!(TerminalPresenter::default().policy(), ConfirmPolicy::Ask);
}
