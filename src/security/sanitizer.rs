/// Entity forms produced by [`clean`]. An `&` that already begins one of these is kept as-is,
/// which is what makes `clean(clean(x)) == clean(x)`.
const ENTITIES: [&str; 5] = ["&amp;", "&lt;", "&gt;", "&quot;", "&#39;"];

fn entity_at(text: &str) -> Option<&'static str> {
    ENTITIES.iter().copied().find(|entity| text.starts_with(entity))
}

/// Escape the five markup-significant characters.
///
/// Output contains no raw `<`, `>`, `"` or `'`, and every `&` starts one of the five entities.
pub fn clean(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(ch) = rest.chars().next() {
        let mut consumed = ch.len_utf8();
        match ch {
            '&' => match entity_at(rest) {
                Some(entity) => {
                    out.push_str(entity);
                    consumed = entity.len();
                }
                None => out.push_str("&amp;"),
            },
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
        rest = &rest[consumed..];
    }

    out
}

/// Shorten already-clean text to `max_chars` visible characters without cutting an entity in
/// half. An entity counts as the one character it renders as.
pub fn truncate(clean_text: &str, max_chars: usize) -> String {
    let mut out = String::new();
    let mut rest = clean_text;
    let mut units = 0;

    while let Some(ch) = rest.chars().next() {
        if units == max_chars {
            out.push('…');
            return out;
        }
        let len = if ch == '&' {
            entity_at(rest).map_or(ch.len_utf8(), str::len)
        } else {
            ch.len_utf8()
        };
        out.push_str(&rest[..len]);
        rest = &rest[len..];
        units += 1;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_markup() {
        assert_eq!(
            clean(r#"<script>alert("x" & 'y')</script>"#),
            "&lt;script&gt;alert(&quot;x&quot; &amp; &#39;y&#39;)&lt;/script&gt;"
        );
        let cleaned = clean("<script>");
        assert!(!cleaned.contains('<') && !cleaned.contains('>'));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(clean(""), "");
        assert_eq!(clean(None::<&str>.unwrap_or_default()), "");
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "",
            "plain text",
            "&",
            "&amp;",
            "&amp;amp;",
            "a && b",
            "&lt;b&gt; vs <b>",
            "\"><img src=x onerror=alert(1)>",
            "fish & chips &#39; &#x27; &nbsp;",
            "こんにちは <世界>",
        ];
        for sample in samples {
            let once = clean(sample);
            assert_eq!(clean(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_unknown_entities_are_escaped() {
        assert_eq!(clean("&nbsp;"), "&amp;nbsp;");
        assert_eq!(clean("&#x27;"), "&amp;#x27;");
    }

    #[test]
    fn test_truncate_keeps_entities_whole() {
        let cleaned = clean("<<<<");
        assert_eq!(truncate(&cleaned, 2), "&lt;&lt;…");
        assert_eq!(truncate(&cleaned, 4), cleaned);
        assert_eq!(truncate("héllo", 2), "hé…");
        assert_eq!(truncate("", 3), "");
    }
}
