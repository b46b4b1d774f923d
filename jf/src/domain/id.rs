//! Job identifier and filename generation
//!
//! Job ids use the format `{slug}-{8-hex}`, e.g. `build-api-3f9a1c07`.
//! Job files use `{NN}-{slug}.md`, numbered after the highest existing prefix.

use rand::Rng;

const MAX_SLUG_LEN: usize = 50;

/// Slugify a title: lowercase alphanumerics joined by single hyphens
pub fn slugify(title: &str) -> String {
    let slug = title
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    let truncated: String = slug.chars().take(MAX_SLUG_LEN).collect();
    let truncated = truncated.trim_end_matches('-');
    if truncated.is_empty() {
        "job".to_string()
    } else {
        truncated.to_string()
    }
}

/// Generate a job id that does not collide according to `taken`
///
/// The random suffix is re-rolled until `taken` returns false.
pub fn generate_job_id(title: &str, taken: impl Fn(&str) -> bool) -> String {
    let slug = slugify(title);
    let mut rng = rand::rng();
    loop {
        let candidate = format!("{}-{:08x}", slug, rng.random::<u32>());
        if !taken(&candidate) {
            return candidate;
        }
    }
}

/// Numeric prefix of a job filename (`"07-deploy.md"` -> 7)
pub fn filename_number(filename: &str) -> Option<u32> {
    let digits: String = filename.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() || !filename[digits.len()..].starts_with('-') {
        return None;
    }
    digits.parse().ok()
}

/// Pick a free filename for a new job titled `title`
///
/// Numbered one past the highest existing prefix and bumped further while
/// `taken` reports a collision.
pub fn job_filename<'a>(title: &str, existing: impl IntoIterator<Item = &'a str>, taken: impl Fn(&str) -> bool) -> String {
    let slug = slugify(title);
    let mut next = existing.into_iter().filter_map(filename_number).max().unwrap_or(0) + 1;
    loop {
        let candidate = format!("{:02}-{}.md", next, slug);
        if !taken(&candidate) {
            return candidate;
        }
        next += 1;
    }
}

/// Short random id for a chat response block
pub fn new_block_id() -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // Trailing characters carry the random bits of a v7 uuid
    uuid[uuid.len() - 6..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth Authentication"), "add-oauth-authentication");
        assert_eq!(slugify("Don't panic!"), "dont-panic");
        assert_eq!(slugify("  --Weird__spacing--  "), "weird-spacing");
        assert_eq!(slugify("!!!"), "job");
    }

    #[test]
    fn test_slugify_truncates() {
        let slug = slugify(&"word ".repeat(30));
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn test_generate_job_id_format() {
        let id = generate_job_id("Build API", |_| false);
        assert!(id.starts_with("build-api-"));
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_job_id_rerolls_on_collision() {
        let first = generate_job_id("Build API", |_| false);
        let second = generate_job_id("Build API", |candidate| candidate == first);
        assert_ne!(first, second);
    }

    #[test]
    fn test_filename_number() {
        assert_eq!(filename_number("07-deploy.md"), Some(7));
        assert_eq!(filename_number("123-x.md"), Some(123));
        assert_eq!(filename_number("spec.md"), None);
        assert_eq!(filename_number("2024.md"), None);
    }

    #[test]
    fn test_job_filename_numbering() {
        let existing = ["01-setup.md", "03-tests.md", "notes.md"];
        assert_eq!(job_filename("Deploy It", existing, |_| false), "04-deploy-it.md");
        assert_eq!(job_filename("First", Vec::<&str>::new(), |_| false), "01-first.md");
        assert_eq!(
            job_filename("Deploy", existing, |name| name == "04-deploy.md"),
            "05-deploy.md"
        );
    }

    #[test]
    fn test_new_block_id() {
        let id = new_block_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
