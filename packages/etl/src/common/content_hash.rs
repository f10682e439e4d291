use sha2::{Digest, Sha256};

/// Generate a content hash for duplicate detection
///
/// Uses SHA256 of normalized text to detect re-ingested postings whose
/// descriptions differ only in formatting. Normalization rules:
/// - Convert to lowercase
/// - Remove all non-alphanumeric characters (except spaces)
/// - Collapse multiple spaces into single spaces
/// - Trim leading/trailing whitespace
pub fn generate_content_hash(text: &str) -> String {
    let normalized = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_same_hash() {
        let a = "Senior Rust Engineer - remote within the US.";
        let b = "Senior Rust Engineer - remote within the US.";

        assert_eq!(generate_content_hash(a), generate_content_hash(b));
    }

    #[test]
    fn formatting_changes_do_not_change_hash() {
        let a = "Senior Rust Engineer - remote within the US.";
        let b = "senior  rust engineer REMOTE within the us";

        assert_eq!(generate_content_hash(a), generate_content_hash(b));
    }

    #[test]
    fn different_content_different_hash() {
        let a = "Senior Rust Engineer";
        let b = "Staff Rust Engineer";

        assert_ne!(generate_content_hash(a), generate_content_hash(b));
    }
}
