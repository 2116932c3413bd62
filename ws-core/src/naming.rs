//! Helpers for deriving host-safe identifiers (account names, subdomains, unit names).

/// Lowercase `input`, keep `[a-z0-9]`, collapse everything else into single
/// `separator` characters and trim it from both ends.
pub fn slugify(input: &str, separator: char) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_separator = false;

    for ch in input.chars() {
        let ch = ch.to_ascii_lowercase();
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_separator && !slug.is_empty() {
                slug.push(separator);
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }

    slug
}

/// Slugify and cut to `max_len` without leaving a trailing separator.
pub fn bounded_slug(input: &str, separator: char, max_len: usize) -> String {
    let mut slug = slugify(input, separator);
    slug.truncate(max_len);
    while slug.ends_with(separator) {
        slug.pop();
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alice's Workspace", '-'), "alice-s-workspace");
        assert_eq!(slugify("  --Data  Lab__", '_'), "data_lab");
        assert_eq!(slugify("!!!", '-'), "");
    }

    #[test]
    fn test_bounded_slug_trims_separator() {
        assert_eq!(bounded_slug("abc def", '-', 4), "abc");
        assert_eq!(bounded_slug("abcdef", '-', 3), "abc");
    }
}
