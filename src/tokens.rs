//! Local token estimation and conversation truncation.
//!
//! The same estimate feeds both the TPM rate-limit debit and chat history
//! truncation, so both live behind [`estimate_tokens`].

use crate::model::Message;

fn is_han(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{F900}'..='\u{FAFF}')
}

/// Estimate the token count of a text: 0.625 per han character plus one per
/// remaining whitespace-separated word, rounded up.
pub fn estimate_tokens(text: &str) -> u64 {
    let han = text.chars().filter(|c| is_han(*c)).count();
    let words = text
        .chars()
        .map(|c| if is_han(c) { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .count();
    (han as f64 * 0.625 + words as f64).ceil() as u64
}

/// Estimated token count of a whole conversation.
pub fn estimate_messages(messages: &[Message]) -> u64 {
    messages.iter().map(|m| estimate_tokens(&m.content)).sum()
}

/// How many whole entries to drop from the head so that both the character
/// and token budgets hold. The final entry is never counted as droppable.
pub(crate) fn head_drop_count(sizes: &[(usize, u64)], max_chars: usize, max_tokens: u64) -> usize {
    let mut chars: usize = sizes.iter().map(|(c, _)| c).sum();
    let mut toks: u64 = sizes.iter().map(|(_, t)| t).sum();
    let mut dropped = 0;
    while dropped + 1 < sizes.len() && (chars > max_chars || toks > max_tokens) {
        chars -= sizes[dropped].0;
        toks -= sizes[dropped].1;
        dropped += 1;
    }
    dropped
}

/// Drop whole messages from the head of `messages` until both the character
/// and token budgets hold. The final message is never dropped.
pub fn truncate_messages(messages: &mut Vec<Message>, max_chars: usize, max_tokens: u64) {
    let sizes: Vec<(usize, u64)> = messages
        .iter()
        .map(|m| (m.content.chars().count(), estimate_tokens(&m.content)))
        .collect();
    let dropped = head_drop_count(&sizes, max_chars, max_tokens);
    messages.drain(..dropped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Message;

    #[test]
    fn estimates_english_words() {
        assert_eq!(estimate_tokens("hello world"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn estimates_han_characters() {
        // 4 han chars * 0.625 = 2.5, ceil to 3
        assert_eq!(estimate_tokens("你好世界"), 3);
    }

    #[test]
    fn estimates_mixed_text() {
        // 2 han * 0.625 + 2 words = 3.25, ceil to 4
        assert_eq!(estimate_tokens("你好 hello world"), 4);
    }

    #[test]
    fn truncation_drops_oldest_whole_messages() {
        let mut messages = vec![
            Message::user("one two three four five"),
            Message::assistant("six seven eight"),
            Message::user("nine ten"),
        ];
        truncate_messages(&mut messages, usize::MAX, 5);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "six seven eight");
    }

    #[test]
    fn truncation_preserves_final_message() {
        let mut messages = vec![Message::user("a very long message that exceeds every budget")];
        truncate_messages(&mut messages, 3, 1);
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn truncation_enforces_character_budget() {
        let mut messages = vec![
            Message::user("aaaaaaaaaa"),
            Message::assistant("bbbbb"),
            Message::user("cc"),
        ];
        truncate_messages(&mut messages, 8, u64::MAX);
        assert_eq!(messages.len(), 2);
        let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
        assert_eq!(chars, 7);
    }

    #[test]
    fn no_op_when_within_budget() {
        let mut messages = vec![Message::user("hi"), Message::assistant("hello")];
        truncate_messages(&mut messages, 100, 100);
        assert_eq!(messages.len(), 2);
    }
}
