//! Text normalization for the search index: lowercase, accent stripping,
//! and splitting on non-alphanumeric characters. Ingestion and query
//! execution share this path so the same text always yields the same terms.

/// Fold one character: lowercase and strip the common Latin accents.
fn fold_char(c: char) -> char {
    let c = c.to_lowercase().next().unwrap_or(c);
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}

/// Case-fold and accent-strip a whole string.
pub fn fold(text: &str) -> String {
    text.chars().map(fold_char).collect()
}

/// Tokenize text into searchable terms: folded, split on non-alphanumeric
/// characters, empty tokens dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    fold(text)
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Tokenize and deduplicate, preserving first-seen order; used for queries.
pub fn tokenize_unique(text: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokenize(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        let tokens = tokenize("Hello, World!");
        assert_eq!(tokens, vec!["hello", "world"]);
    }

    #[test]
    fn test_accents_are_stripped() {
        assert_eq!(fold("Café São Paulo"), "cafe sao paulo");
        assert_eq!(tokenize("résumé"), vec!["resume"]);
    }

    #[test]
    fn test_tokenize_numbers_kept() {
        assert_eq!(tokenize("test123 foo456bar"), vec!["test123", "foo456bar"]);
    }

    #[test]
    fn test_tokenize_empty_and_punctuation() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("...---...").is_empty());
    }

    #[test]
    fn test_tokenize_unique_preserves_order() {
        assert_eq!(
            tokenize_unique("apple banana Apple cherry"),
            vec!["apple", "banana", "cherry"]
        );
    }
}
