/// Emojis the AI uses as list/section markers. When one is glued to the
/// preceding text the reply gets a paragraph break so WhatsApp renders the
/// sections the way the dashboard preview does.
const LIST_MARKERS: [char; 8] = ['📋', '📌', '📍', '📝', '✅', '🔹', '➡', '❗'];

/// Normalize an AI reply for delivery: unescape literal `\n` sequences and
/// insert a blank line before list markers that arrive without one.
pub fn normalize_reply_text(raw: &str) -> String {
    let unescaped = raw.replace("\\n", "\n");

    let mut out = String::with_capacity(unescaped.len() + 8);
    let mut prev: Option<char> = None;
    for c in unescaped.chars() {
        if LIST_MARKERS.contains(&c) {
            if let Some(p) = prev {
                if p != '\n' {
                    while out.ends_with(' ') {
                        out.pop();
                    }
                    out.push_str("\n\n");
                }
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescapes_literal_newlines() {
        assert_eq!(normalize_reply_text("baris satu\\nbaris dua"), "baris satu\nbaris dua");
    }

    #[test]
    fn glued_marker_gets_paragraph_break() {
        assert_eq!(
            normalize_reply_text("hai 👋📋 menu:"),
            "hai 👋\n\n📋 menu:"
        );
    }

    #[test]
    fn marker_after_newline_is_left_alone() {
        assert_eq!(
            normalize_reply_text("hai\n📋 menu:"),
            "hai\n📋 menu:"
        );
    }

    #[test]
    fn marker_at_start_is_left_alone() {
        assert_eq!(normalize_reply_text("📋 menu:"), "📋 menu:");
    }

    #[test]
    fn multiple_markers_each_break() {
        assert_eq!(
            normalize_reply_text("a📌b✅c"),
            "a\n\n📌b\n\n✅c"
        );
    }

    #[test]
    fn trailing_space_is_absorbed_into_the_break() {
        assert_eq!(
            normalize_reply_text("pilih menu: 📋 layanan"),
            "pilih menu:\n\n📋 layanan"
        );
    }
}
