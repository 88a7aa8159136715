//! Message body sanitization.
//!
//! Stored bodies keep their HTML; the helpers here produce the plain-text
//! view used for snippets and strip the quoted history Gmail appends as a
//! `gmail_quote` div.

/// Maximum snippet length in characters.
pub const SNIPPET_LENGTH: usize = 191;

/// Removes the quoted conversation history from a Gmail HTML body.
///
/// Gmail wraps the quoted part in `<div class="gmail_quote">...</div>`; the
/// div is removed including everything it contains. Bodies without such a
/// div are returned unchanged.
pub fn strip_gmail_quote(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let Some(marker) = lower.find("gmail_quote") else {
        return html.to_string();
    };
    // Walk back to the opening `<div` of the tag carrying the class.
    let Some(start) = lower[..marker].rfind("<div") else {
        return html.to_string();
    };
    // The class attribute must belong to this tag.
    if lower[start..marker].contains('>') {
        return html.to_string();
    }

    // Scan forward counting div nesting until the wrapper closes.
    let mut depth = 0usize;
    let mut pos = start;
    let bytes = lower.as_bytes();
    while pos < lower.len() {
        if lower[pos..].starts_with("<div") {
            depth += 1;
            pos += 4;
        } else if lower[pos..].starts_with("</div>") {
            depth -= 1;
            pos += 6;
            if depth == 0 {
                let mut out = String::with_capacity(html.len());
                out.push_str(&html[..start]);
                out.push_str(&html[pos..]);
                return out;
            }
        } else {
            // Advance by one character, not one byte.
            let mut next = pos + 1;
            while next < bytes.len() && !lower.is_char_boundary(next) {
                next += 1;
            }
            pos = next;
        }
    }

    // Unbalanced markup, leave the body alone.
    html.to_string()
}

/// Converts HTML to plain text by dropping tags and decoding the common
/// entities. Block-level closing tags become newlines.
pub fn strip_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut chars = html.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '<' {
            let rest = &html[i..];
            let lower_rest = rest.to_ascii_lowercase();
            if lower_rest.starts_with("<br")
                || lower_rest.starts_with("</p>")
                || lower_rest.starts_with("</div>")
                || lower_rest.starts_with("</tr>")
            {
                out.push('\n');
            }
            // Skip to the end of the tag.
            for (_, tc) in chars.by_ref() {
                if tc == '>' {
                    break;
                }
            }
        } else if c == '&' {
            let rest = &html[i..];
            let mut replaced = false;
            for (entity, ch) in [
                ("&amp;", '&'),
                ("&lt;", '<'),
                ("&gt;", '>'),
                ("&quot;", '"'),
                ("&#39;", '\''),
                ("&apos;", '\''),
                ("&nbsp;", ' '),
            ] {
                if rest.starts_with(entity) {
                    out.push(ch);
                    for _ in 0..entity.chars().count() - 1 {
                        chars.next();
                    }
                    replaced = true;
                    break;
                }
            }
            if !replaced {
                out.push(c);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Escapes a plain-text body into minimal HTML with hard line breaks.
pub fn plaintext_to_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' => out.push_str("<br>\n"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

/// Builds the snippet for a message from its sanitized body: whitespace is
/// collapsed and the result truncated to [`SNIPPET_LENGTH`] characters,
/// never splitting inside a character.
pub fn make_snippet(body: &str) -> String {
    let collapsed = strip_tags(body)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed.chars().take(SNIPPET_LENGTH).collect()
}
