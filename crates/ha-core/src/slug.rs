//! Slug generation for IDs derived from display names

/// Lowercase `name` and collapse every run of non-alphanumerics into `_`
///
/// `"Doors Open!"` becomes `"doors_open"`. Returns an empty string when the
/// name has no alphanumeric characters.
pub fn slugify(name: &str) -> String {
    let mut result = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c.to_ascii_lowercase());
        } else if !result.is_empty() && !result.ends_with('_') {
            result.push('_');
        }
    }
    result.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::slugify;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("test_state"), "test_state");
        assert_eq!(slugify("Doors Open!"), "doors_open");
        assert_eq!(slugify("  Ground -- Floor  "), "ground_floor");
        assert_eq!(slugify("My periodic min max"), "my_periodic_min_max");
        assert_eq!(slugify("???"), "");
    }
}
