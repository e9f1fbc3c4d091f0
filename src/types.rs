//! Mesh Naming Types
//!
//! Stable device identities and transient radio link addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters that delimit wire fields and may never appear inside a name
pub const RESERVED_CHARS: [char; 4] = ['|', ',', '>', '='];

/// Stable logical name of a device, independent of its radio address
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

/// Transport-level address of a radio endpoint (e.g. a hardware address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LinkAddress(String);

macro_rules! string_name {
    ($name:ident) => {
        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the name can travel as a single wire token
            pub fn is_wire_safe(&self) -> bool {
                !self.0.is_empty()
                    && !self.0.contains(RESERVED_CHARS)
                    && !self.0.chars().any(char::is_whitespace)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
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

string_name!(Identity);
string_name!(LinkAddress);
