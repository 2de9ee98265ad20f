//! Validated configuration item names
//!
//! An [`ItemName`] is the unique key of a configuration item within its
//! owning resource: lowercase alphanumerics, `.` and `-`, starting and
//! ending with an alphanumeric, at most 63 characters.

use std::borrow::Borrow;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Maximum length of an item name
pub const MAX_NAME_LEN: usize = 63;

/// Validated item name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemName(String);

impl ItemName {
    /// Validate and wrap a name
    ///
    /// # Errors
    /// Returns [`NameError`] describing the first rule the name breaks
    pub fn new(name: impl Into<String>) -> Result<Self, NameError> {
        let name = name.into();
        validate(&name)?;
        Ok(Self(name))
    }

    /// Borrow as `&str`
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the owned string
    #[inline]
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

fn is_edge_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

fn validate(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| !is_edge_char(*c) && *c != '.' && *c != '-')
    {
        return Err(NameError::InvalidChar {
            name: name.to_string(),
            found: c,
        });
    }
    let first = name.chars().next().is_some_and(is_edge_char);
    let last = name.chars().next_back().is_some_and(is_edge_char);
    if !first || !last {
        return Err(NameError::BadEdge(name.to_string()));
    }
    Ok(())
}

impl Display for ItemName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ItemName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ItemName {
    type Error = NameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemName> for String {
    fn from(name: ItemName) -> Self {
        name.0
    }
}

impl AsRef<str> for ItemName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ItemName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Errors related to item names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// Empty name
    #[error("item name must not be empty")]
    Empty,

    /// Name too long
    #[error("item name is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },

    /// Character outside `[a-z0-9.-]`
    #[error("invalid character {found:?} in item name '{name}'")]
    InvalidChar { name: String, found: char },

    /// Starts or ends with `.` or `-`
    #[error("item name '{0}' must start and end with a lowercase alphanumeric")]
    BadEdge(String),
}
