// SPDX-License-Identifier: Apache-2.0

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArgument,
    InvalidDhcpMessage,
    InvalidLeaseFile,
    NoLease,
    NotSupported,
    Timeout,
    ScriptFailed,
    Fatal,
    Bug,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::InvalidArgument => "invalid_argument",
                Self::InvalidDhcpMessage => "invalid_dhcp_message",
                Self::InvalidLeaseFile => "invalid_lease_file",
                Self::NoLease => "no_lease",
                Self::NotSupported => "not_supported",
                Self::Timeout => "timeout",
                Self::ScriptFailed => "script_failed",
                Self::Fatal => "fatal",
                Self::Bug => "bug",
            }
        )
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DhcpError {
    kind: ErrorKind,
    msg: String,
}

impl DhcpError {
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn msg(&self) -> &str {
        self.msg.as_str()
    }
}

impl std::fmt::Display for DhcpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)
    }
}

impl std::error::Error for DhcpError {}

impl From<std::io::Error> for DhcpError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Bug, format!("IO error: {e}"))
    }
}

impl From<std::ffi::NulError> for DhcpError {
    fn from(e: std::ffi::NulError) -> Self {
        Self::new(
            ErrorKind::InvalidArgument,
            format!("String contains NUL byte: {e}"),
        )
    }
}

pub(crate) trait ErrorContext<T> {
    fn context(self, msg: &str) -> Result<T, DhcpError>;
}

impl<T> ErrorContext<T> for Result<T, DhcpError> {
    fn context(self, msg: &str) -> Result<T, DhcpError> {
        self.map_err(|e| DhcpError::new(e.kind, format!("{}: {}", msg, e.msg)))
    }
}
