use anyhow::{Result, bail};

/// Validate an object name.
/// Rules: non-empty, max 253 chars, no `/`, no whitespace.
pub fn validate_object_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > 253 {
        bail!("name '{}' exceeds 253 characters (got {})", name, name.len());
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) {
        bail!("name '{}' must not contain '/' or whitespace", name);
    }
    Ok(())
}

/// Validate a label key or value segment.
/// Rules: `[A-Za-z0-9_.-]`, max 63 chars, starts and ends alphanumeric.
pub fn validate_label_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        bail!("label segment must not be empty");
    }
    if segment.len() > 63 {
        bail!(
            "label segment '{}' exceeds 63 characters (got {})",
            segment,
            segment.len()
        );
    }
    let first = segment.chars().next().unwrap_or('-');
    let last = segment.chars().last().unwrap_or('-');
    if !first.is_ascii_alphanumeric() || !last.is_ascii_alphanumeric() {
        bail!(
            "label segment '{}' must start and end with an alphanumeric character",
            segment
        );
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!(
            "label segment '{}' must contain only [A-Za-z0-9_.-]",
            segment
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_object_names() {
        assert!(validate_object_name("nginx").is_ok());
        assert!(validate_object_name("system:node").is_ok());
        assert!(validate_object_name("crb-abcde12345").is_ok());
        assert!(validate_object_name(&"a".repeat(253)).is_ok());
    }

    #[test]
    fn invalid_object_names() {
        assert!(validate_object_name("").is_err());
        assert!(validate_object_name("a/b").is_err());
        assert!(validate_object_name("has space").is_err());
        assert!(validate_object_name(&"a".repeat(254)).is_err());
    }

    #[test]
    fn label_segments() {
        assert!(validate_label_segment("c1_crtb-abc").is_ok());
        assert!(validate_label_segment("true").is_ok());
        assert!(validate_label_segment("-leading").is_err());
        assert!(validate_label_segment("trailing_").is_err());
        assert!(validate_label_segment("c1:p1").is_err());
        assert!(validate_label_segment(&"a".repeat(64)).is_err());
    }
}
