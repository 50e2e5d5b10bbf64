use scribe_core::{
    sink::{ANSWER_HEADING, QUESTION_HEADING},
    types::{Message, Role},
};

/// 把缓存中的对话重新排成面板文本。
///
/// 连续的用户消息归入同一个 `## Question` 段，格式与流式输出时一致，
/// 刷新后的面板与实时写入的面板内容相同。
pub fn render_history(messages: &[Message]) -> String {
    let mut rendered = String::new();
    let mut in_question = false;
    for message in messages {
        match message.role {
            Role::User | Role::System => {
                if !in_question {
                    rendered.push_str(QUESTION_HEADING);
                    in_question = true;
                }
                rendered.push_str(&message.content);
                rendered.push_str("\n\n");
            }
            Role::Assistant => {
                rendered.push_str(ANSWER_HEADING);
                rendered.push_str(&message.content);
                in_question = false;
            }
        }
    }
    rendered
}
