//! Splits HTML into translation-sized chunks on block boundaries.
//!
//! Chunks are slices of the input: concatenating them in order gives back the
//! input byte for byte. A chunk only ever ends right after a `</p>` or `<br>`
//! marker, so no tag is cut in half. A single block longer than the target
//! size is passed through whole.

use once_cell::sync::Lazy;
use regex::Regex;
use std::borrow::Cow;

static BLOCK_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</p\s*>|<br\s*/?>").expect("valid block regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").expect("valid tag regex"));

/// Remove markup, keeping only text.
pub fn strip_tags(html: &str) -> Cow<'_, str> {
    TAG.replace_all(html, "")
}

/// Number of visible characters once markup is removed.
pub fn visible_len(html: &str) -> usize {
    strip_tags(html).chars().count()
}

/// Lazily split `html` into chunks of roughly `target_size` visible chars.
pub fn chunk(html: &str, target_size: usize) -> Chunks<'_> {
    Chunks {
        html,
        pos: 0,
        target_size,
    }
}

#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    html: &'a str,
    pos: usize,
    target_size: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let start = self.pos;
        let rest = &self.html[start..];
        if rest.trim().is_empty() {
            self.pos = self.html.len();
            return None;
        }

        let mut block_start = start;
        let mut visible = 0usize;
        for m in BLOCK_END.find_iter(rest) {
            let block_end = start + m.end();
            visible += visible_len(&self.html[block_start..block_end]);
            block_start = block_end;
            if visible >= self.target_size {
                let mut end = block_end;
                // A whitespace-only tail belongs to this chunk.
                if self.html[end..].trim().is_empty() {
                    end = self.html.len();
                }
                self.pos = end;
                return Some(&self.html[start..end]);
            }
        }

        self.pos = self.html.len();
        Some(rest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(html: &str, size: usize) -> Vec<&str> {
        chunk(html, size).collect()
    }

    #[test]
    fn empty_and_blank_input_yield_nothing() {
        assert!(collect("", 10).is_empty());
        assert!(collect("  \n\t", 10).is_empty());
    }

    #[test]
    fn no_boundaries_is_one_chunk_regardless_of_size() {
        let html = "<div>".to_string() + &"x".repeat(5000) + "</div>";
        let chunks = collect(&html, 100);
        assert_eq!(chunks, vec![html.as_str()]);
    }

    #[test]
    fn closes_chunk_once_visible_length_reached() {
        let html = "<p>aaaa</p><p>bbbb</p><p>cccc</p><p>dd</p>";
        let chunks = collect(html, 8);
        assert_eq!(chunks, vec!["<p>aaaa</p><p>bbbb</p>", "<p>cccc</p><p>dd</p>"]);
    }

    #[test]
    fn markup_does_not_count_towards_size() {
        let html = r#"<p class="very-long-class-name">ab</p><p>cd</p>"#;
        assert_eq!(collect(html, 3).len(), 1);
        assert_eq!(collect(html, 2).len(), 2);
    }

    #[test]
    fn short_trailing_text_is_emitted() {
        let html = "<p>aaaa</p>tail";
        assert_eq!(collect(html, 4), vec!["<p>aaaa</p>", "tail"]);
    }

    #[test]
    fn whitespace_tail_is_folded_into_last_chunk() {
        let html = "<p>aaaa</p>\n\n";
        assert_eq!(collect(html, 4), vec!["<p>aaaa</p>\n\n"]);
    }

    #[test]
    fn br_variants_and_case_are_boundaries() {
        let html = "one<BR>two<br/>three<br />four</P>";
        let chunks = collect(html, 1);
        assert_eq!(chunks, vec!["one<BR>", "two<br/>", "three<br />", "four</P>"]);
    }

    #[test]
    fn counts_chars_not_bytes() {
        let html = "<p>éééé</p><p>x</p>";
        assert_eq!(collect(html, 4), vec!["<p>éééé</p>", "<p>x</p>"]);
        assert_eq!(visible_len("<b>日本</b>"), 2);
    }

    #[test]
    fn concatenation_reconstructs_input_and_never_splits_tags() {
        let mut html = String::new();
        for i in 0..200 {
            html.push_str(&format!("<p data-i=\"{i}\">paragraph {i} with <em>some</em> text</p>\n"));
            if i % 7 == 0 {
                html.push_str("line<br>break ");
            }
        }
        html.push_str("<ul><li>no boundary here</li></ul>  ");

        for size in [1, 10, 50, 200, 2000, 100_000] {
            let chunks = collect(&html, size);
            assert_eq!(chunks.concat(), html, "size {size}");
            for c in &chunks[..chunks.len() - 1] {
                let lt = c.rfind('<').unwrap();
                let gt = c.rfind('>').unwrap();
                assert!(gt > lt, "chunk ends inside a tag at size {size}");
            }
        }
    }

    #[test]
    fn iterator_is_restartable() {
        let html = "<p>aa</p><p>bb</p>";
        let it = chunk(html, 2);
        let first: Vec<_> = it.clone().collect();
        let second: Vec<_> = it.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn strip_tags_keeps_text() {
        assert_eq!(strip_tags("<h1>Hello <b>world</b></h1>"), "Hello world");
    }
}
