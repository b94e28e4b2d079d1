//! # convoy-id
//!
//! Validated identifier types for the convoy agent.
//!
//! ## Design Principles
//!
//! - Identifiers are user-controlled names taken from the policy document
//! - Every identifier has one canonical string form with strict parsing
//! - Identifiers are typed so a unit key cannot be passed where a component
//!   identity is expected
//!
//! ## Name Format
//!
//! Names are 1 to 128 characters drawn from `[A-Za-z0-9._-]`, starting with an
//! alphanumeric character.
//!
//! Examples:
//! - `filestream-default`
//! - `system/metrics` is rejected (contains `/`)
//! - `agent-01hv4z2wqxkjnm8gpqy6vbkc3d` (generated agent id)

mod error;
mod macros;
mod types;

pub use error::NameError;
pub use types::*;

/// Maximum accepted length for any name.
pub const MAX_NAME_LEN: usize = 128;

/// Validate a candidate name against the shared name rules.
pub fn validate_name(s: &str) -> Result<(), NameError> {
    if s.is_empty() {
        return Err(NameError::Empty);
    }

    if s.len() > MAX_NAME_LEN {
        return Err(NameError::TooLong {
            len: s.len(),
            max: MAX_NAME_LEN,
        });
    }

    let mut chars = s.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphanumeric() {
            return Err(NameError::InvalidStart(first));
        }
    }

    if let Some(bad) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(NameError::InvalidChar(bad));
    }

    Ok(())
}
