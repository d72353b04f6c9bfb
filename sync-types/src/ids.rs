//! Identity and checkpoint types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::SyncError;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from any string-like value.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier a device presents during the protocol handshake.
    DeviceId
);

string_id!(
    /// Account name the device authenticates as.
    UserId
);

string_id!(
    /// Folder UID a collection is synchronized under.
    ///
    /// Scoped to one (device, user) pair.
    CollectionId
);

/// A synchronization checkpoint for one collection.
///
/// The wire form is either `0` (no checkpoint yet) or `{guid}N`, where the
/// guid names a key series and `N` is a counter that strictly increases with
/// each successful sync round.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SyncKey {
    /// The client has never synchronized this collection.
    Initial,
    /// A checkpoint within a key series.
    Keyed {
        /// Series identifier, shared by every key of one sync relationship.
        series: String,
        /// Position within the series.
        counter: u64,
    },
}

impl SyncKey {
    /// Start a new series at counter 1.
    pub fn new_series() -> Self {
        Self::Keyed {
            series: uuid::Uuid::new_v4().to_string(),
            counter: 1,
        }
    }

    /// The key that follows this one.
    ///
    /// The initial key starts a fresh series.
    pub fn next(&self) -> Self {
        match self {
            Self::Initial => Self::new_series(),
            Self::Keyed { series, counter } => Self::Keyed {
                series: series.clone(),
                counter: counter.saturating_add(1),
            },
        }
    }

    /// Check whether this is the initial (`0`) key.
    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }

    /// The series identifier, if any.
    pub fn series(&self) -> Option<&str> {
        match self {
            Self::Initial => None,
            Self::Keyed { series, .. } => Some(series),
        }
    }

    /// The counter within the series (0 for the initial key).
    pub fn counter(&self) -> u64 {
        match self {
            Self::Initial => 0,
            Self::Keyed { counter, .. } => *counter,
        }
    }

    /// Check whether `self` is strictly older than `other` within one series.
    pub fn precedes(&self, other: &SyncKey) -> bool {
        match (self, other) {
            (Self::Initial, Self::Keyed { .. }) => true,
            (
                Self::Keyed { series: a, counter: x },
                Self::Keyed { series: b, counter: y },
            ) => a == b && x < y,
            _ => false,
        }
    }
}

impl FromStr for SyncKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "0" {
            return Ok(Self::Initial);
        }

        let body = s.strip_prefix('s').unwrap_or(s);
        let invalid = || SyncError::InvalidSyncKey(s.to_string());

        let rest = body.strip_prefix('{').ok_or_else(invalid)?;
        let (series, counter) = rest.split_once('}').ok_or_else(invalid)?;

        if series.is_empty()
            || !series
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(invalid());
        }
        if counter.is_empty() || !counter.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let counter = counter.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::Keyed {
            series: series.to_string(),
            counter,
        })
    }
}

impl TryFrom<String> for SyncKey {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SyncKey> for String {
    fn from(key: SyncKey) -> Self {
        key.to_string()
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("0"),
            Self::Keyed { series, counter } => write!(f, "{{{}}}{}", series, counter),
        }
    }
}

impl fmt::Debug for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncKey({})", self)
    }
}
