//! Markdown rendering into Telegram entity format, and UTF-16-aware
//! splitting of long messages.
//!
//! Telegram measures entity offsets, entity lengths, and the per-message
//! size limit in UTF-16 code units. Everything here counts in those units.

use crate::types::MessageEntity;

/// Plain text plus the formatting spans laid over it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RichText {
    pub text: String,
    pub entities: Vec<MessageEntity>,
}

pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Convert common LLM markdown into plain text + entities.
///
/// Handles fenced code blocks, headings, bullet markers, inline code,
/// bold, italic, and links. Everything else passes through untouched.
pub fn render_markdown(md: &str) -> RichText {
    let mut out = RichText::default();
    let lines: Vec<&str> = md.lines().collect();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        // Fenced code block: ```lang ... ```
        if let Some(fence_rest) = line.trim_start().strip_prefix("```") {
            let language = fence_rest.trim();
            let language = (!language.is_empty()).then(|| language.to_string());
            i += 1;
            let mut code = String::new();
            while i < lines.len() && !lines[i].trim_start().starts_with("```") {
                if !code.is_empty() {
                    code.push('\n');
                }
                code.push_str(lines[i]);
                i += 1;
            }
            if i < lines.len() {
                i += 1; // closing fence
            }
            if !code.is_empty() {
                let offset = utf16_len(&out.text) as i64;
                out.text.push_str(&code);
                out.entities.push(MessageEntity {
                    kind: "pre".into(),
                    offset,
                    length: utf16_len(&code) as i64,
                    url: None,
                    language,
                });
            }
            out.text.push('\n');
            continue;
        }

        // Heading: "## Foo" becomes bold "Foo".
        if let Some(heading) = strip_heading(line) {
            push_span(&mut out, heading, "bold", None);
            out.text.push('\n');
            i += 1;
            continue;
        }

        // Bullet markers.
        let line = if let Some(rest) = line.strip_prefix("- ") {
            format!("• {rest}")
        } else if let Some(rest) = line.strip_prefix("* ") {
            format!("• {rest}")
        } else {
            line.to_string()
        };

        append_inline(&line, &mut out);
        out.text.push('\n');
        i += 1;
    }

    if out.text.ends_with('\n') {
        out.text.pop();
    }
    out
}

/// Strip a markdown heading prefix ("### Foo" -> "Foo").
fn strip_heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let after = trimmed.trim_start_matches('#');
    after.strip_prefix(' ').map(str::trim_start)
}

fn push_span(out: &mut RichText, inner: &str, kind: &str, url: Option<String>) {
    if inner.is_empty() {
        return;
    }
    let offset = utf16_len(&out.text) as i64;
    out.text.push_str(inner);
    out.entities.push(MessageEntity {
        kind: kind.into(),
        offset,
        length: utf16_len(inner) as i64,
        url,
        language: None,
    });
}

/// Inline formatting: `code`, **bold**, *italic*, _italic_, [text](url).
fn append_inline(line: &str, out: &mut RichText) {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let mut i = 0;

    while i < len {
        // Inline code: `code`
        if chars[i] == '`' {
            if let Some(end) = find_char(&chars, '`', i + 1) {
                let inner: String = chars[i + 1..end].iter().collect();
                push_span(out, &inner, "code", None);
                i = end + 1;
                continue;
            }
        }

        // Bold: **text**
        if i + 1 < len && chars[i] == '*' && chars[i + 1] == '*' {
            if let Some(end) = find_double_char(&chars, '*', i + 2) {
                let inner: String = chars[i + 2..end].iter().collect();
                push_span(out, &inner, "bold", None);
                i = end + 2;
                continue;
            }
        }

        // Link: [text](url)
        if chars[i] == '[' {
            if let Some((text, url, end)) = parse_link(&chars, i) {
                push_span(out, &text, "text_link", Some(url));
                i = end;
                continue;
            }
        }

        // Italic: _text_ (not inside words like some_var_name)
        if chars[i] == '_' && (i == 0 || chars[i - 1] == ' ') {
            if let Some(end) = find_char(&chars, '_', i + 1) {
                let boundary = end + 1 >= len
                    || matches!(chars[end + 1], ' ' | '.' | ',');
                if boundary {
                    let inner: String = chars[i + 1..end].iter().collect();
                    push_span(out, &inner, "italic", None);
                    i = end + 1;
                    continue;
                }
            }
        }

        // Single *italic* (not **)
        if chars[i] == '*' && (i + 1 >= len || chars[i + 1] != '*') {
            if let Some(end) = find_single_star(&chars, i + 1) {
                let inner: String = chars[i + 1..end].iter().collect();
                push_span(out, &inner, "italic", None);
                i = end + 1;
                continue;
            }
        }

        out.text.push(chars[i]);
        i += 1;
    }
}

fn find_char(chars: &[char], c: char, start: usize) -> Option<usize> {
    (start..chars.len()).find(|&j| chars[j] == c)
}

fn find_double_char(chars: &[char], c: char, start: usize) -> Option<usize> {
    let mut j = start;
    while j + 1 < chars.len() {
        if chars[j] == c && chars[j + 1] == c {
            return Some(j);
        }
        j += 1;
    }
    None
}

fn find_single_star(chars: &[char], start: usize) -> Option<usize> {
    (start..chars.len())
        .find(|&j| chars[j] == '*' && (j + 1 >= chars.len() || chars[j + 1] != '*'))
}

fn parse_link(chars: &[char], start: usize) -> Option<(String, String, usize)> {
    let close_bracket = find_char(chars, ']', start + 1)?;
    if close_bracket + 1 >= chars.len() || chars[close_bracket + 1] != '(' {
        return None;
    }
    let close_paren = find_char(chars, ')', close_bracket + 2)?;
    let text: String = chars[start + 1..close_bracket].iter().collect();
    let url: String = chars[close_bracket + 2..close_paren].iter().collect();
    Some((text, url, close_paren + 1))
}

// ──────────────────── Splitting ────────────────────

/// Split rich text into chunks of at most `max_units` UTF-16 code units.
///
/// Splits at the last newline inside the limit when one exists (that
/// newline is consumed by the split), hard-cuts otherwise. Entities are
/// clipped to each chunk and re-based to its start.
pub fn split_rich(rich: &RichText, max_units: usize) -> Vec<RichText> {
    if utf16_len(&rich.text) <= max_units {
        return vec![rich.clone()];
    }

    let chars: Vec<(char, usize)> = rich.text.chars().map(|c| (c, c.len_utf16())).collect();
    let mut chunks = Vec::new();
    let mut start = 0usize; // char index
    let mut start_units = 0usize;

    while start < chars.len() {
        let mut units = 0usize;
        let mut end = start;
        while end < chars.len() && units + chars[end].1 <= max_units {
            units += chars[end].1;
            end += 1;
        }

        if end < chars.len() {
            // Not the final chunk: prefer the last newline inside the window.
            if let Some(nl) = (start..end).rev().find(|&j| chars[j].0 == '\n') {
                if nl > start {
                    end = nl;
                }
            }
        }
        if end == start {
            end = start + 1; // guaranteed progress
        }

        let chunk_text: String = chars[start..end].iter().map(|(c, _)| c).collect();
        let chunk_units: usize = chars[start..end].iter().map(|(_, u)| u).sum();

        let lo = start_units as i64;
        let hi = (start_units + chunk_units) as i64;
        let entities = rich
            .entities
            .iter()
            .filter_map(|e| {
                let s = e.offset.max(lo);
                let t = (e.offset + e.length).min(hi);
                (t > s).then(|| MessageEntity {
                    offset: s - lo,
                    length: t - s,
                    ..e.clone()
                })
            })
            .collect();

        chunks.push(RichText {
            text: chunk_text,
            entities,
        });

        start = end;
        start_units += chunk_units;
        // The newline at the split point is consumed.
        if start < chars.len() && chars[start].0 == '\n' {
            start += 1;
            start_units += 1;
        }
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_len() {
        assert_eq!(utf16_len("abc"), 3);
        assert_eq!(utf16_len("héllo"), 5);
        // Emoji outside the BMP take two code units.
        assert_eq!(utf16_len("🚀"), 2);
    }

    #[test]
    fn test_render_plain_text_passthrough() {
        let rich = render_markdown("just words\nsecond line");
        assert_eq!(rich.text, "just words\nsecond line");
        assert!(rich.entities.is_empty());
    }

    #[test]
    fn test_render_bold() {
        let rich = render_markdown("say **hello** now");
        assert_eq!(rich.text, "say hello now");
        assert_eq!(rich.entities, vec![MessageEntity::span("bold", 4, 5)]);
    }

    #[test]
    fn test_render_inline_code() {
        let rich = render_markdown("run `cargo test` please");
        assert_eq!(rich.text, "run cargo test please");
        assert_eq!(rich.entities, vec![MessageEntity::span("code", 4, 10)]);
    }

    #[test]
    fn test_render_heading_becomes_bold() {
        let rich = render_markdown("## Status\nall good");
        assert_eq!(rich.text, "Status\nall good");
        assert_eq!(rich.entities, vec![MessageEntity::span("bold", 0, 6)]);
    }

    #[test]
    fn test_render_bullets() {
        let rich = render_markdown("- one\n- two");
        assert_eq!(rich.text, "• one\n• two");
    }

    #[test]
    fn test_render_link() {
        let rich = render_markdown("see [docs](https://example.com) here");
        assert_eq!(rich.text, "see docs here");
        assert_eq!(rich.entities.len(), 1);
        assert_eq!(rich.entities[0].kind, "text_link");
        assert_eq!(rich.entities[0].url.as_deref(), Some("https://example.com"));
        assert_eq!(rich.entities[0].offset, 4);
        assert_eq!(rich.entities[0].length, 4);
    }

    #[test]
    fn test_render_code_block_with_language() {
        let rich = render_markdown("before\n```rust\nlet x = 1;\n```\nafter");
        assert_eq!(rich.text, "before\nlet x = 1;\nafter");
        assert_eq!(rich.entities.len(), 1);
        assert_eq!(rich.entities[0].kind, "pre");
        assert_eq!(rich.entities[0].language.as_deref(), Some("rust"));
        assert_eq!(rich.entities[0].offset, 7);
        assert_eq!(rich.entities[0].length, 10);
    }

    #[test]
    fn test_render_offsets_are_utf16() {
        let rich = render_markdown("🚀🚀 **go**");
        assert_eq!(rich.text, "🚀🚀 go");
        // Two emoji are four UTF-16 units, plus the space.
        assert_eq!(rich.entities, vec![MessageEntity::span("bold", 5, 2)]);
    }

    #[test]
    fn test_render_italic_not_inside_words() {
        let rich = render_markdown("some_var_name stays");
        assert_eq!(rich.text, "some_var_name stays");
        assert!(rich.entities.is_empty());
    }

    #[test]
    fn test_split_short_is_identity() {
        let rich = render_markdown("short **bold**");
        let chunks = split_rich(&rich, 4000);
        assert_eq!(chunks, vec![rich]);
    }

    #[test]
    fn test_split_at_newline_boundaries_preserves_content() {
        // 100 lines of 60 characters: well over a 1000-unit limit.
        let lines: Vec<String> = (0..100).map(|i| format!("{i:02}{}", "x".repeat(58))).collect();
        let original = lines.join("\n");
        let rich = RichText {
            text: original.clone(),
            entities: vec![],
        };

        let chunks = split_rich(&rich, 1000);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(utf16_len(&chunk.text) <= 1000);
        }
        let rejoined = chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        assert_eq!(rejoined, original);
    }

    #[test]
    fn test_split_hard_cut_without_newlines() {
        let rich = RichText {
            text: "a".repeat(250),
            entities: vec![],
        };
        let chunks = split_rich(&rich, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text.len(), 100);
        assert_eq!(chunks[2].text.len(), 50);
        let rejoined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(rejoined, rich.text);
    }

    #[test]
    fn test_split_clips_and_rebases_entities() {
        // "aaaa\nbbbb" with bold spanning the middle: "aa[aa\nbb]bb"
        let rich = RichText {
            text: "aaaa\nbbbb".into(),
            entities: vec![MessageEntity::span("bold", 2, 5)],
        };
        let chunks = split_rich(&rich, 6);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "aaaa");
        assert_eq!(chunks[1].text, "bbbb");
        // First chunk: bold on "aa" at offset 2.
        assert_eq!(chunks[0].entities, vec![MessageEntity::span("bold", 2, 2)]);
        // Second chunk: bold on "bb" re-based to offset 0.
        assert_eq!(chunks[1].entities, vec![MessageEntity::span("bold", 0, 2)]);
    }

    #[test]
    fn test_split_counts_utf16_units_not_chars() {
        // 60 rocket emoji = 120 UTF-16 units; a 100-unit limit must split.
        let rich = RichText {
            text: "🚀".repeat(60),
            entities: vec![],
        };
        let chunks = split_rich(&rich, 100);
        assert_eq!(chunks.len(), 2);
        assert_eq!(utf16_len(&chunks[0].text), 100);
        assert_eq!(utf16_len(&chunks[1].text), 20);
    }
}
