//! Canonical form of grantee names and ACM values.
//!
//! Lowercase, strip `space , = ' : ( ) $ [ ] { } | \`, and map `.` and `-`
//! to `_`. Two spellings of the same DN compare equal after flattening.

/// Flatten a DN, group name, or ACM value.
pub fn flatten(value: &str) -> String {
    value
        .chars()
        .filter_map(|c| match c {
            ' ' | ',' | '=' | '\'' | ':' | '(' | ')' | '$' | '[' | ']' | '{' | '}' | '|'
            | '\\' => None,
            '.' | '-' => Some('_'),
            c => Some(c),
        })
        .flat_map(char::to_lowercase)
        .collect()
}

/// Compare two grantee names by their flattened form.
pub fn same_grantee(a: &str, b: &str) -> bool {
    flatten(a) == flatten(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_dn() {
        assert_eq!(
            flatten("CN=test tester01, OU=People, O=U.S. Government, C=US"),
            "cntesttester01oupeopleou_s_governmentcus"
        );
    }

    #[test]
    fn test_flatten_group() {
        assert_eq!(flatten("-Everyone"), "_everyone");
        assert_eq!(flatten("DCTC ODrive_G1"), "dctcodrive_g1");
    }

    #[test]
    fn test_flatten_idempotent() {
        let once = flatten("cn=Alice (A.), o=Org-X");
        assert_eq!(flatten(&once), once);
    }

    proptest::proptest! {
        #[test]
        fn prop_flatten_idempotent(s in proptest::prelude::any::<String>()) {
            let once = flatten(&s);
            proptest::prop_assert_eq!(flatten(&once), once);
        }
    }

    #[test]
    fn test_same_grantee() {
        assert!(same_grantee("CN=Bob, C=US", "cn=bob,c=us"));
        assert!(!same_grantee("cn=bob", "cn=bobby"));
    }
}
