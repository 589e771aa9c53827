/// Matches `name` against a shell-style `pattern` supporting `*` (any
/// run of characters) and `?` (exactly one character). No existing
/// crate in the workspace provides this, so it is written plainly
/// rather than pulled in as a dependency for two wildcard characters.
pub fn matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();
    matches_at(&pattern, &name)
}

fn matches_at(pattern: &[char], name: &[char]) -> bool {
    match pattern.first() {
        None => name.is_empty(),
        Some('*') => {
            matches_at(&pattern[1..], name)
                || (!name.is_empty() && matches_at(pattern, &name[1..]))
        }
        Some('?') => !name.is_empty() && matches_at(&pattern[1..], &name[1..]),
        Some(c) => !name.is_empty() && name[0] == *c && matches_at(&pattern[1..], &name[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_suffix() {
        assert!(matches("core-*", "core-r1"));
        assert!(matches("core-*", "core-"));
        assert!(!matches("core-*", "edge-r1"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        assert!(matches("r?", "r1"));
        assert!(!matches("r?", "r10"));
    }

    #[test]
    fn exact_match_with_no_wildcards() {
        assert!(matches("core-r1", "core-r1"));
        assert!(!matches("core-r1", "core-r2"));
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(matches("*", "anything"));
        assert!(matches("*", ""));
    }
}
