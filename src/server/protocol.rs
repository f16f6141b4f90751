//! Line protocol: request parsing and reply texts.
//!
//! Every request is one newline-terminated line of whitespace separated
//! words. Command names are case sensitive: the auth commands are lower
//! case, the file commands upper case.

use thiserror::Error;

use crate::error::ResourceError;
use crate::CubbyError;

pub const SIGNUP_OK: &str = "Signup successful. You are now logged in.\n";
pub const LOGIN_OK: &str = "Login successful\n";
pub const LOGOUT_OK: &str = "Logged out successfully\n";
pub const READY_TO_RECEIVE: &str = "READY_TO_RECEIVE\n";
pub const UPLOAD_OK: &str = "UPLOAD_SUCCESS\n";
pub const DELETE_OK: &str = "DELETE_SUCCESS\n";
pub const UNKNOWN_COMMAND: &str = "*** Unknown command\n";
pub const LOGIN_FIRST: &str = "*** Error: Please login first\n";
pub const NOT_LOGGED_IN: &str = "*** Error: Not logged in\n";
pub const INVALID_CREDENTIALS: &str = "*** Error: Invalid credentials\n";
pub const USER_EXISTS: &str = "*** Error: User already exists\n";
pub const SERVER_BUSY: &str = "*** Error: Server busy\n";
pub const LINE_TOO_LONG: &str = "*** Invalid format. Line too long\n";

/// A parsed request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Signup { username: String, password: String },
    Login { username: String, password: String },
    Logout,
    Upload { filename: String, size: Option<u64> },
    Download { filename: String },
    Delete { filename: String },
    List,
}

impl Request {
    /// Whether the request needs an authenticated session.
    pub fn is_file_command(&self) -> bool {
        matches!(
            self,
            Request::Upload { .. } | Request::Download { .. } | Request::Delete { .. } | Request::List
        )
    }
}

/// Why a line is not a valid request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Blank line.
    #[error("empty request")]
    Empty,

    /// The first word is not a known command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Known command with the wrong arguments.
    #[error("invalid format, usage: {usage}")]
    InvalidFormat { usage: &'static str },
}

impl ParseError {
    /// Reply sent for this error. Blank lines get no reply.
    pub fn reply(&self) -> Option<String> {
        match self {
            ParseError::Empty => None,
            ParseError::UnknownCommand(_) => Some(UNKNOWN_COMMAND.to_string()),
            ParseError::InvalidFormat { usage } => {
                Some(format!("*** Invalid format. Usage: {usage}\n"))
            }
        }
    }
}

impl From<ParseError> for CubbyError {
    fn from(e: ParseError) -> Self {
        CubbyError::Protocol(e.to_string())
    }
}

/// Usage line of each command.
fn usage(command: &str) -> &'static str {
    match command {
        "signup" => "signup <username> <password>",
        "login" => "login <username> <password>",
        "logout" => "logout",
        "UPLOAD" => "UPLOAD <filename> [size]",
        "DOWNLOAD" => "DOWNLOAD <filename>",
        "DELETE" => "DELETE <filename>",
        _ => "LIST",
    }
}

/// Parse one request line. Trailing `\r\n` is ignored.
pub fn parse_request(line: &str) -> Result<Request, ParseError> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err(ParseError::Empty);
    };
    let args: Vec<&str> = words.collect();
    let invalid = || ParseError::InvalidFormat {
        usage: usage(command),
    };

    let request = match (command, args.as_slice()) {
        ("signup", [username, password]) => Request::Signup {
            username: username.to_string(),
            password: password.to_string(),
        },
        ("login", [username, password]) => Request::Login {
            username: username.to_string(),
            password: password.to_string(),
        },
        ("logout", []) => Request::Logout,
        ("UPLOAD", [filename]) => Request::Upload {
            filename: filename.to_string(),
            size: None,
        },
        ("UPLOAD", [filename, size]) => Request::Upload {
            filename: filename.to_string(),
            size: Some(size.parse().map_err(|_| invalid())?),
        },
        ("DOWNLOAD", [filename]) => Request::Download {
            filename: filename.to_string(),
        },
        ("DELETE", [filename]) => Request::Delete {
            filename: filename.to_string(),
        },
        ("LIST", []) => Request::List,
        ("signup" | "login" | "logout" | "UPLOAD" | "DOWNLOAD" | "DELETE" | "LIST", _) => {
            return Err(invalid())
        }
        (other, _) => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(request)
}

/// Reply for a user already logged in on this connection.
pub fn already_logged_in(username: &str) -> String {
    format!("*** Error: Already logged in as '{username}'\n")
}

/// Reply for a failed file or auth operation.
pub fn error_reply(error: &CubbyError) -> String {
    let message = match error {
        CubbyError::NotFound(_) => "File not found".to_string(),
        CubbyError::AlreadyExists(_) => "User already exists".to_string(),
        CubbyError::Resource(ResourceError::QuotaExceeded) => "Quota exceeded".to_string(),
        CubbyError::Resource(ResourceError::FileLimitReached) => "File limit reached".to_string(),
        CubbyError::Resource(ResourceError::UserLimitReached) => "User limit reached".to_string(),
        CubbyError::Decode(_) => "Invalid file data".to_string(),
        CubbyError::Validation(reason) => format!("Invalid input ({reason})"),
        CubbyError::Auth(reason) => reason.clone(),
        CubbyError::QueueFull(_) | CubbyError::QueueClosed(_) => "Server busy".to_string(),
        _ => "Operation failed".to_string(),
    };
    format!("*** Error: {message}\n")
}

/// Reply for a storage failure during `operation` ("save", "read", "delete").
pub fn storage_failure(operation: &str) -> String {
    format!("*** Error: Failed to {operation} file\n")
}
