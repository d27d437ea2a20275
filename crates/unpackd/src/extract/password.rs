//! Password attempt policy.

use thiserror::Error;

use crate::domain::PasswordStrategy;

/// Output fragments that mean the archive rejected the password.
const PASSWORD_ERROR_PATTERNS: &[&str] = &[
    "wrong password",
    "can not open encrypted archive",
    "data error",
    "incorrect password",
    "password is wrong",
    "wrong pass",
    "bad password",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PasswordError {
    #[error("password mode manual requires a non-empty password")]
    MissingPassword,

    #[error("password index {index} is out of range [0, {len})")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("password mode try_list requires a non-empty common password list")]
    EmptyPasswordList,

    #[error("unknown password mode")]
    UnknownPasswordMode,
}

/// One password to try, with its position in the common list when it came
/// from there.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordAttempt {
    pub password: String,
    pub list_index: Option<usize>,
}

impl std::fmt::Debug for PasswordAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAttempt")
            .field("password", &"***")
            .field("list_index", &self.list_index)
            .finish()
    }
}

/// Ordered passwords to try for one archive.
///
/// An empty result means a single passwordless attempt.
pub fn resolve_password_attempts(
    strategy: &PasswordStrategy,
    common_passwords: &[String],
) -> Result<Vec<PasswordAttempt>, PasswordError> {
    match strategy {
        PasswordStrategy::None => Ok(Vec::new()),
        PasswordStrategy::Manual { value } => {
            if value.trim().is_empty() {
                return Err(PasswordError::MissingPassword);
            }
            Ok(vec![PasswordAttempt {
                password: value.clone(),
                list_index: None,
            }])
        }
        PasswordStrategy::Select { ref_index } => {
            let len = common_passwords.len();
            let index = usize::try_from(*ref_index)
                .ok()
                .filter(|i| *i < len)
                .ok_or(PasswordError::IndexOutOfRange {
                    index: *ref_index,
                    len,
                })?;
            Ok(vec![PasswordAttempt {
                password: common_passwords[index].clone(),
                list_index: Some(index),
            }])
        }
        PasswordStrategy::TryList => {
            if common_passwords.is_empty() {
                return Err(PasswordError::EmptyPasswordList);
            }
            Ok(common_passwords
                .iter()
                .enumerate()
                .map(|(i, p)| PasswordAttempt {
                    password: p.clone(),
                    list_index: Some(i),
                })
                .collect())
        }
        PasswordStrategy::Unrecognized => Err(PasswordError::UnknownPasswordMode),
    }
}

/// Whether extractor output says the password was missing or wrong.
pub fn is_password_error(stdout: &str, stderr: &str) -> bool {
    let combined = format!("{}{}", stdout, stderr).to_lowercase();
    PASSWORD_ERROR_PATTERNS
        .iter()
        .any(|pattern| combined.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> Vec<String> {
        vec!["alpha".into(), "beta".into(), "gamma".into()]
    }

    fn passwords(attempts: &[PasswordAttempt]) -> Vec<&str> {
        attempts.iter().map(|a| a.password.as_str()).collect()
    }

    #[test]
    fn test_none_yields_no_attempts() {
        assert!(resolve_password_attempts(&PasswordStrategy::None, &list())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_manual_returns_value() {
        let strategy = PasswordStrategy::Manual {
            value: "s3cret".into(),
        };
        let attempts = resolve_password_attempts(&strategy, &[]).unwrap();
        assert_eq!(passwords(&attempts), vec!["s3cret"]);
        assert_eq!(attempts[0].list_index, None);
    }

    #[test]
    fn test_manual_blank_is_rejected() {
        let strategy = PasswordStrategy::Manual { value: "  ".into() };
        assert_eq!(
            resolve_password_attempts(&strategy, &list()),
            Err(PasswordError::MissingPassword)
        );
    }

    #[test]
    fn test_select_picks_entry() {
        let attempts =
            resolve_password_attempts(&PasswordStrategy::Select { ref_index: 1 }, &list()).unwrap();
        assert_eq!(passwords(&attempts), vec!["beta"]);
        assert_eq!(attempts[0].list_index, Some(1));
    }

    #[test]
    fn test_select_out_of_range() {
        for index in [-1, 3, 99] {
            assert_eq!(
                resolve_password_attempts(&PasswordStrategy::Select { ref_index: index }, &list()),
                Err(PasswordError::IndexOutOfRange { index, len: 3 })
            );
        }
    }

    #[test]
    fn test_try_list_keeps_order() {
        let attempts = resolve_password_attempts(&PasswordStrategy::TryList, &list()).unwrap();
        assert_eq!(passwords(&attempts), vec!["alpha", "beta", "gamma"]);
        assert_eq!(attempts[2].list_index, Some(2));
    }

    #[test]
    fn test_try_list_requires_entries() {
        assert_eq!(
            resolve_password_attempts(&PasswordStrategy::TryList, &[]),
            Err(PasswordError::EmptyPasswordList)
        );
    }

    #[test]
    fn test_unrecognized_mode() {
        assert_eq!(
            resolve_password_attempts(&PasswordStrategy::Unrecognized, &list()),
            Err(PasswordError::UnknownPasswordMode)
        );
    }

    #[test]
    fn test_password_error_lexicon() {
        assert!(is_password_error("", "ERROR: Wrong password : secret.txt"));
        assert!(is_password_error("Can not open encrypted archive. Wrong password?", ""));
        assert!(is_password_error("", "Data Error in encrypted file"));
        assert!(!is_password_error("Everything is Ok", ""));
        assert!(!is_password_error("", "Unexpected end of archive"));
    }

    #[test]
    fn test_attempt_debug_hides_password() {
        let attempt = PasswordAttempt {
            password: "hunter2".into(),
            list_index: None,
        };
        assert!(!format!("{:?}", attempt).contains("hunter2"));
    }
}
