use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::{CacheError, Result};

pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 255;

/// An uncompressed wire-format domain name: length-prefixed labels
/// terminated by the root zero byte.
///
/// The stored bytes keep whatever case they were built with, but
/// equality and hashing are case-insensitive, matching DNS semantics.
/// Label length bytes never exceed 63 and therefore never overlap the
/// ASCII letter range, so whole-buffer case folding is safe.
#[derive(Debug, Clone)]
pub struct WireName {
    wire: Vec<u8>,
}

impl WireName {
    /// The root name, a single zero byte.
    pub fn root() -> Self {
        Self { wire: vec![0] }
    }

    /// Parse an uncompressed name from its wire encoding. Compression
    /// pointers are rejected: a name to be stored or compared must be
    /// self-contained.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        loop {
            let len = *bytes
                .get(pos)
                .ok_or_else(|| CacheError::InvalidPacket("name runs past the buffer".into()))?
                as usize;
            if len == 0 {
                break;
            }
            if len > MAX_LABEL_LEN {
                return Err(CacheError::InvalidLabelLength(len as u8));
            }
            pos += len + 1;
        }
        let wire = bytes[..=pos].to_vec();
        if wire.len() > MAX_NAME_LEN {
            return Err(CacheError::NameTooLong);
        }
        Ok(Self { wire })
    }

    /// Build a name from its dotted presentation form. A trailing dot
    /// is accepted; `""` and `"."` yield the root.
    pub fn from_ascii(name: &str) -> Result<Self> {
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        if trimmed.is_empty() {
            return Ok(Self::root());
        }
        let mut wire = Vec::with_capacity(trimmed.len() + 2);
        for label in trimmed.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(CacheError::InvalidLabelLength(
                    label.len().min(u8::MAX as usize) as u8,
                ));
            }
            wire.push(label.len() as u8);
            wire.extend_from_slice(label.as_bytes());
        }
        wire.push(0);
        if wire.len() > MAX_NAME_LEN {
            return Err(CacheError::NameTooLong);
        }
        Ok(Self { wire })
    }

    pub fn as_wire(&self) -> &[u8] {
        &self.wire
    }

    pub fn wire_len(&self) -> usize {
        self.wire.len()
    }

    pub fn is_root(&self) -> bool {
        self.wire.len() == 1
    }

    /// The wire bytes with every label folded to lowercase, the form
    /// fed to the key hash.
    pub fn to_lowercase_wire(&self) -> Vec<u8> {
        self.wire.iter().map(u8::to_ascii_lowercase).collect()
    }

    /// Whether `self` equals `parent` or sits below it in the tree.
    /// The root is a parent of every name.
    pub fn is_subdomain_of(&self, parent: &WireName) -> bool {
        if parent.wire.len() > self.wire.len() {
            return false;
        }
        let offset = self.wire.len() - parent.wire.len();
        let suffix_matches = self.wire[offset..]
            .iter()
            .zip(&parent.wire)
            .all(|(a, b)| a.eq_ignore_ascii_case(b));
        if !suffix_matches {
            return false;
        }
        // The suffix must begin on a label boundary.
        let mut pos = 0;
        while pos < offset {
            pos += self.wire[pos] as usize + 1;
        }
        pos == offset
    }
}

impl PartialEq for WireName {
    fn eq(&self, other: &Self) -> bool {
        self.wire.len() == other.wire.len()
            && self
                .wire
                .iter()
                .zip(&other.wire)
                .all(|(a, b)| a.eq_ignore_ascii_case(b))
    }
}

impl Eq for WireName {}

impl Hash for WireName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in &self.wire {
            state.write_u8(b.to_ascii_lowercase());
        }
    }
}

impl fmt::Display for WireName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return f.write_str(".");
        }
        let mut pos = 0;
        while self.wire[pos] != 0 {
            let len = self.wire[pos] as usize;
            for &b in &self.wire[pos + 1..pos + 1 + len] {
                write!(f, "{}", b as char)?;
            }
            f.write_str(".")?;
            pos += len + 1;
        }
        Ok(())
    }
}
