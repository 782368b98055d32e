use core::fmt;

/// Failure of a provider call or a virtual-table callback, in SQLite's
/// result-code vocabulary.
#[derive(Clone, Debug)]
pub struct Error {
    pub code: ErrorCode,
    /// Extended result code, when the backend reported one.
    pub extended: Option<i32>,
    pub message: Option<String>,
}

pub type Result<T> = core::result::Result<T, Error>;

macro_rules! result_codes {
    ($($name:ident = $code:literal,)*) => {
        /// Primary SQLite result codes, plus conditions SQLite has no code for.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum ErrorCode {
            $($name,)*
            /// An optional backend entry point is missing.
            FeatureUnavailable,
            /// Code outside the primary table, kept verbatim.
            Unknown(i32),
        }

        impl ErrorCode {
            /// Decode a primary or extended result code by its low byte.
            pub const fn from_code(code: i32) -> ErrorCode {
                match code & 0xff {
                    $($code => ErrorCode::$name,)*
                    _ => ErrorCode::Unknown(code),
                }
            }

            /// SQLite's integer for this code; `None` for
            /// [`ErrorCode::FeatureUnavailable`].
            pub const fn code(self) -> Option<i32> {
                match self {
                    $(ErrorCode::$name => Some($code),)*
                    ErrorCode::FeatureUnavailable => None,
                    ErrorCode::Unknown(code) => Some(code),
                }
            }
        }
    };
}

result_codes! {
    Ok = 0,
    Error = 1,
    Internal = 2,
    Perm = 3,
    Abort = 4,
    Busy = 5,
    Locked = 6,
    NoMem = 7,
    ReadOnly = 8,
    Interrupt = 9,
    IoErr = 10,
    Corrupt = 11,
    NotFound = 12,
    Full = 13,
    CantOpen = 14,
    Protocol = 15,
    Empty = 16,
    Schema = 17,
    TooBig = 18,
    Constraint = 19,
    Mismatch = 20,
    Misuse = 21,
    NoLfs = 22,
    Auth = 23,
    Format = 24,
    Range = 25,
    NotADb = 26,
    Notice = 27,
    Warning = 28,
    Row = 100,
    Done = 101,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            extended: None,
            message: None,
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(code)
        }
    }

    /// Error from the raw fields a backend call reported.
    pub fn from_code(code: i32, message: Option<String>, extended: Option<i32>) -> Self {
        Self {
            code: ErrorCode::from_code(code),
            extended,
            message,
        }
    }

    pub fn feature_unavailable(msg: &'static str) -> Self {
        Self::with_message(ErrorCode::FeatureUnavailable, msg)
    }

    /// An object was used outside its lifecycle, or a required pointer was
    /// null.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Misuse, msg)
    }

    /// A native handle resolved to no registered table or cursor.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::Error, msg)
    }

    pub fn no_memory(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::NoMem, msg)
    }

    /// Status code to return from an engine callback. Never `SQLITE_OK`.
    pub fn result_code(&self) -> i32 {
        match (self.extended, self.code.code()) {
            (Some(extended), _) if extended != 0 => extended,
            (_, Some(code)) if code != 0 => code,
            _ => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(message) = &self.message {
            return f.write_str(message);
        }
        match self.code {
            ErrorCode::Unknown(code) => write!(f, "sqlite error code {code}"),
            ErrorCode::FeatureUnavailable => f.write_str("feature unavailable"),
            code => write!(f, "sqlite error {code:?}"),
        }
    }
}

impl std::error::Error for Error {}
