//! Artifact-name sanitization.
//!
//! Order numbers and firmware versions arrive from the network and end up in
//! on-disk description file names. The filesystem is never asked to open a
//! path containing untrusted bytes: everything outside `[A-Za-z0-9_-]` is
//! replaced before the name is used.

/// Replaces every character outside `[A-Za-z0-9_-]` with `_`.
#[must_use]
pub fn sanitize_artifact_name(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_names_pass_through() {
        assert_eq!(sanitize_artifact_name("0768-3301_FW26"), "0768-3301_FW26");
    }

    #[test]
    fn path_metacharacters_are_neutralized() {
        assert_eq!(
            sanitize_artifact_name("../../etc/passwd"),
            "______etc_passwd"
        );
        assert_eq!(sanitize_artifact_name("a/b\\c"), "a_b_c");
    }

    #[test]
    fn non_ascii_is_neutralized() {
        assert_eq!(sanitize_artifact_name("fw\u{0000}ü"), "fw__");
    }
}
