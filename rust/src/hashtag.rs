/// Extract `#tag` words from `content`, left to right.
///
/// A tag runs from the character after `#` to the next whitespace (any
/// Unicode whitespace, full-width space included) or the end of the string.
/// A `#` with nothing after it yields no tag.
pub fn parse_hashtags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut rest = content;
    while let Some(pos) = rest.find('#') {
        let after = &rest[pos + '#'.len_utf8()..];
        let end = after.find(char::is_whitespace).unwrap_or(after.len());
        let tag = &after[..end];
        if !tag.is_empty() {
            tags.push(tag.to_string());
        }
        rest = &after[end..];
    }
    tags
}
