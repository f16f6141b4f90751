//! Authentication module for Cubby.
//!
//! Credentials are checked against the metadata store; this module holds
//! the input validation shared by signup, login and the file commands.

pub mod validation;

pub use validation::{
    validate_filename, validate_password, validate_username, ValidationError,
    MAX_FILENAME_LENGTH, MAX_PASSWORD_LENGTH, MAX_USERNAME_LENGTH,
};
