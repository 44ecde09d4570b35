//! Formatting utilities (Telegram HTML escaping, entity-annotated rich text).

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Length in UTF-16 code units (Telegram entity offsets are measured this way).
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityKind {
    Bold,
    Italic,
    /// Clickable profile link (`tg://user?id=...`).
    Mention { user_id: i64 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextEntity {
    pub kind: EntityKind,
    /// UTF-16 offset.
    pub offset: usize,
    /// UTF-16 length.
    pub length: usize,
}

/// Plain text plus entity spans, sent without a parse mode.
///
/// Spans are located by substring search, so callers mark text that is
/// already part of the message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RichText {
    text: String,
    entities: Vec<TextEntity>,
}

impl RichText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entities: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn entities(&self) -> &[TextEntity] {
        &self.entities
    }

    /// Append plain text; existing entities keep their offsets.
    pub fn append(mut self, s: &str) -> Self {
        self.text.push_str(s);
        self
    }

    pub fn bold(self, needle: &str) -> Self {
        self.mark(needle, 0, EntityKind::Bold)
    }

    pub fn italic(self, needle: &str) -> Self {
        self.mark(needle, 0, EntityKind::Italic)
    }

    /// Italic span searched for after the first occurrence of `anchor`.
    pub fn italic_after(self, anchor: &str, needle: &str) -> Self {
        let from = self
            .text
            .find(anchor)
            .map(|i| i + anchor.len())
            .unwrap_or(0);
        self.mark(needle, from, EntityKind::Italic)
    }

    pub fn mention(self, needle: &str, user_id: i64) -> Self {
        self.mark(needle, 0, EntityKind::Mention { user_id })
    }

    /// Mention searched for after the first occurrence of `anchor`.
    pub fn mention_after(self, anchor: &str, needle: &str, user_id: i64) -> Self {
        let from = self
            .text
            .find(anchor)
            .map(|i| i + anchor.len())
            .unwrap_or(0);
        self.mark(needle, from, EntityKind::Mention { user_id })
    }

    /// Mention searched from the end (list rows appended last).
    pub fn mention_last(mut self, needle: &str, user_id: i64) -> Self {
        if needle.is_empty() {
            return self;
        }
        if let Some(start) = self.text.rfind(needle) {
            self.push_entity(start, needle, EntityKind::Mention { user_id });
        }
        self
    }

    fn mark(mut self, needle: &str, from: usize, kind: EntityKind) -> Self {
        if needle.is_empty() || from > self.text.len() {
            return self;
        }
        let Some(rel) = self.text.get(from..).and_then(|tail| tail.find(needle)) else {
            return self;
        };
        self.push_entity(from + rel, needle, kind);
        self
    }

    fn push_entity(&mut self, byte_start: usize, needle: &str, kind: EntityKind) {
        let offset = utf16_len(&self.text[..byte_start]);
        self.entities.push(TextEntity {
            kind,
            offset,
            length: utf16_len(needle),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html() {
        assert_eq!(escape_html("<a&b>\""), "&lt;a&amp;b&gt;&quot;");
    }

    #[test]
    fn utf16_counts_surrogate_pairs() {
        assert_eq!(utf16_len("abc"), 3);
        assert_eq!(utf16_len("✏️"), 2);
        assert_eq!(utf16_len("🗑"), 2);
        assert_eq!(utf16_len("Было"), 4);
    }

    #[test]
    fn entity_offsets_are_utf16_after_emoji() {
        let rt = RichText::new("🗑 Сообщение удалено\n👤 Пользователь: @bob")
            .bold("Сообщение удалено")
            .mention("@bob", 42);
        let e = rt.entities();
        assert_eq!(e.len(), 2);
        assert_eq!(e[0].kind, EntityKind::Bold);
        assert_eq!(e[0].offset, 3);
        assert_eq!(e[0].length, 17);
        assert_eq!(e[1].kind, EntityKind::Mention { user_id: 42 });
        assert_eq!(e[1].offset, utf16_len("🗑 Сообщение удалено\n👤 Пользователь: "));
        assert_eq!(e[1].length, 4);
    }

    #[test]
    fn italic_after_skips_earlier_matches() {
        let rt = RichText::new("a\nБыло:\na").italic_after("Было:", "a");
        assert_eq!(rt.entities()[0].offset, utf16_len("a\nБыло:\n"));
    }

    #[test]
    fn mention_last_targets_the_line_just_appended() {
        let rt = RichText::new("Users:")
            .append("\n- 1 — Ann")
            .mention_last("Ann", 1)
            .append("\n- 2 — Ann")
            .mention_last("Ann", 2);
        let e = rt.entities();
        assert_eq!(e[0].offset, utf16_len("Users:\n- 1 — "));
        assert_eq!(e[1].offset, utf16_len("Users:\n- 1 — Ann\n- 2 — "));
    }

    #[test]
    fn mention_after_skips_the_field_name() {
        let rt = RichText::new("👤 Пользователь: Пользователь")
            .mention_after("Пользователь: ", "Пользователь", 3);
        assert_eq!(rt.entities()[0].offset, utf16_len("👤 Пользователь: "));
    }

    #[test]
    fn missing_needle_adds_nothing() {
        let rt = RichText::new("hello").bold("bye").italic("");
        assert!(rt.entities().is_empty());
    }
}
