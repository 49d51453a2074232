//! Text shaping for relayed messages
//!
//! Prefix templates, remote-mesh tags, reply quote stripping and the radio
//! payload limit.

use meshrelay_core::RADIO_TEXT_LIMIT;

/// Characters of the original message quoted in reaction notices
pub const QUOTE_CHARS: usize = 40;

/// Characters of a meshnet name used in remote-mesh tags
pub const MESH_TAG_CHARS: usize = 4;

/// First `n` characters of `s`
pub fn first_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Replace `{key}` placeholders; unknown placeholders are left in place
pub fn render_template(template: &str, fields: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in fields {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Radio→chat prefix: `{long}`, `{long5}`, `{short}`, `{mesh}`, `{mesh5}`
pub fn radio_prefix(template: &str, long_name: &str, short_name: &str, meshnet: &str) -> String {
    render_template(
        template,
        &[
            ("long5", first_chars(long_name, 5)),
            ("long", long_name),
            ("short", short_name),
            ("mesh5", first_chars(meshnet, 5)),
            ("mesh", meshnet),
        ],
    )
}

/// Chat→radio prefix: `{display}`, `{display5}`, `{user}`
pub fn chat_prefix(template: &str, display_name: &str, user_id: &str) -> String {
    render_template(
        template,
        &[
            ("display5", first_chars(display_name, 5)),
            ("display", display_name),
            ("user", user_id),
        ],
    )
}

/// `<short>/<mesh4>` tag of a message relayed from another meshnet
pub fn remote_tag(short_name: &str, meshnet: &str) -> String {
    format!("{short_name}/{}", first_chars(meshnet, MESH_TAG_CHARS))
}

/// Original text shortened for a reaction notice
pub fn abbreviate(text: &str) -> String {
    let head = first_chars(text, QUOTE_CHARS);
    if head.len() < text.len() {
        format!("{head}...")
    } else {
        head.to_string()
    }
}

/// Drop the `> <@user> ...` fallback quote chat clients put above replies
pub fn strip_reply_fallback(body: &str) -> String {
    body.lines()
        .skip_while(|line| line.starts_with('>'))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Drop a leading `[...] ` label
pub fn strip_bracket_label(body: &str) -> &str {
    body.strip_prefix('[')
        .and_then(|rest| rest.split_once("] "))
        .map_or(body, |(_, tail)| tail)
}

/// Cut to the radio payload limit on a character boundary
pub fn truncate_for_radio(text: &str) -> &str {
    if text.len() <= RADIO_TEXT_LIMIT {
        return text;
    }
    let mut end = RADIO_TEXT_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_radio_prefix_default() {
        let prefix = radio_prefix("{short}[{mesh}]: ", "Alice Node", "ALI", "HomeMesh");
        assert_eq!(prefix, "ALI[HomeMesh]: ");
        let prefix = radio_prefix("{long5}/{mesh5} ", "Alice Node", "ALI", "HomeMesh");
        assert_eq!(prefix, "Alice/HomeM ");
    }

    #[test]
    fn test_chat_prefix() {
        assert_eq!(
            chat_prefix("{display5}[M]: ", "Bartholomew", "@bart:example.org"),
            "Barth[M]: "
        );
        assert_eq!(chat_prefix("<{user}> ", "Bart", "@bart:x"), "<@bart:x> ");
        assert_eq!(chat_prefix("{unknown} ", "Bart", "@bart:x"), "{unknown} ");
    }

    #[test]
    fn test_remote_tag() {
        assert_eq!(remote_tag("BOB", "RemoteMesh"), "BOB/Remo");
        assert_eq!(remote_tag("BOB", "Hi"), "BOB/Hi");
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate("short"), "short");
        let long = "a".repeat(45);
        assert_eq!(abbreviate(&long), format!("{}...", "a".repeat(40)));
        assert_eq!(abbreviate(&"é".repeat(40)), "é".repeat(40));
    }

    #[test]
    fn test_strip_reply_fallback() {
        let body = "> <@alice:x> original\n> second line\n\nmy answer";
        assert_eq!(strip_reply_fallback(body), "my answer");
        assert_eq!(strip_reply_fallback("no quote"), "no quote");
        assert_eq!(strip_reply_fallback("text\n> inline quote"), "text\n> inline quote");
    }

    #[test]
    fn test_strip_bracket_label() {
        assert_eq!(
            strip_bracket_label("[Bob/Remote] reacted 👍 to \"hi\""),
            "reacted 👍 to \"hi\""
        );
        assert_eq!(strip_bracket_label("plain"), "plain");
        assert_eq!(strip_bracket_label("[unterminated"), "[unterminated");
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        let ascii = "x".repeat(300);
        assert_eq!(truncate_for_radio(&ascii).len(), RADIO_TEXT_LIMIT);

        // 226 ASCII bytes followed by a 4-byte emoji straddling the limit
        let text = format!("{}😀tail", "x".repeat(226));
        let cut = truncate_for_radio(&text);
        assert_eq!(cut.len(), 226);
        assert!(cut.is_char_boundary(cut.len()));

        assert_eq!(truncate_for_radio("short"), "short");
    }
}
