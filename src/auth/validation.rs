//! Input validation for usernames, passwords and filenames.
//!
//! Every value checked here travels as a single whitespace-free token of the
//! line protocol, and usernames and filenames also become path components
//! under the storage root.

use thiserror::Error;

/// Maximum username length.
pub const MAX_USERNAME_LENGTH: usize = 63;

/// Maximum password length.
pub const MAX_PASSWORD_LENGTH: usize = 63;

/// Maximum filename length.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Validation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Username is empty.
    #[error("username cannot be empty")]
    UsernameEmpty,

    /// Username is too long.
    #[error("username must be at most {MAX_USERNAME_LENGTH} characters")]
    UsernameTooLong,

    /// Username contains invalid characters.
    #[error("username can only contain letters, digits, '_', '-' and '.'")]
    UsernameInvalidChars,

    /// Password is empty.
    #[error("password cannot be empty")]
    PasswordEmpty,

    /// Password is too long.
    #[error("password must be at most {MAX_PASSWORD_LENGTH} characters")]
    PasswordTooLong,

    /// Password contains whitespace or control characters.
    #[error("password contains invalid characters")]
    PasswordInvalidChars,

    /// Filename is empty.
    #[error("filename cannot be empty")]
    FilenameEmpty,

    /// Filename is too long.
    #[error("filename must be at most {MAX_FILENAME_LENGTH} characters")]
    FilenameTooLong,

    /// Filename would escape the user's directory.
    #[error("filename cannot contain path separators or be '.' or '..'")]
    FilenameInvalidPath,

    /// Filename contains whitespace or control characters.
    #[error("filename contains invalid characters")]
    FilenameInvalidChars,
}

/// Validate a username.
///
/// Requirements:
/// - Length: 1-63 characters
/// - Characters: ASCII letters, digits, `_`, `-` and `.`
/// - Not `.` or `..` (it names a directory)
pub fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username.is_empty() {
        return Err(ValidationError::UsernameEmpty);
    }
    if username.len() > MAX_USERNAME_LENGTH {
        return Err(ValidationError::UsernameTooLong);
    }
    if username == "." || username == ".." {
        return Err(ValidationError::UsernameInvalidChars);
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ValidationError::UsernameInvalidChars);
    }

    Ok(())
}

/// Validate a password.
///
/// Requirements:
/// - Length: 1-63 characters
/// - No whitespace or control characters
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    if password.is_empty() {
        return Err(ValidationError::PasswordEmpty);
    }
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(ValidationError::PasswordTooLong);
    }
    if password
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::PasswordInvalidChars);
    }

    Ok(())
}

/// Validate a filename.
///
/// Requirements:
/// - Length: 1-255 bytes
/// - No `/` or `\`, not `.` or `..`
/// - No whitespace or control characters
pub fn validate_filename(filename: &str) -> Result<(), ValidationError> {
    if filename.is_empty() {
        return Err(ValidationError::FilenameEmpty);
    }
    if filename.len() > MAX_FILENAME_LENGTH {
        return Err(ValidationError::FilenameTooLong);
    }
    if filename == "." || filename == ".." || filename.contains(['/', '\\']) {
        return Err(ValidationError::FilenameInvalidPath);
    }
    if filename
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::FilenameInvalidChars);
    }

    Ok(())
}
