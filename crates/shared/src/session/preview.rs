use crate::conversation::{Role, Turn};

pub const DEFAULT_PREVIEW_CHARS: usize = 100;

pub fn is_attachment_context(turn: &Turn) -> bool {
    turn.role == Role::User && turn.attachment_context
}

/// Excerpt of the opening user message, falling back to the first turn.
pub fn build_preview(turns: &[Turn], max_chars: usize) -> String {
    let source = turns
        .iter()
        .find(|turn| turn.role == Role::User && !is_attachment_context(turn))
        .or_else(|| turns.first());
    let Some(source) = source else {
        return String::new();
    };

    let collapsed = source.content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max_chars {
        return collapsed;
    }

    let mut preview = collapsed.chars().take(max_chars).collect::<String>();
    preview.push('…');
    preview
}
