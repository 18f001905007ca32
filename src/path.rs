//! Typed D-Bus object paths for the GATT hierarchy.

use core::fmt;
use std::str::FromStr;

use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::error::Error;

/// An absolute D-Bus object path built from identifier segments.
///
/// Each segment matches `[A-Za-z0-9_]+`; segments are joined with `/` and
/// the whole path is prefixed with `/`. This is deliberately stricter than
/// what D-Bus itself allows, because every path in the GATT hierarchy is
/// derived from service names and user-chosen slugs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    path: String,
}

impl NodePath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self { path: "/".into() }
    }

    /// Builds a path from identifier segments.
    pub fn from_segments<'a, I: IntoIterator<Item = &'a str>>(segments: I) -> Result<Self, Error> {
        let mut path = Self::root();
        for segment in segments {
            path = path.append(segment)?;
        }
        Ok(path)
    }

    /// Returns a new path with `segment` appended.
    ///
    /// Fails with [`Error::InvalidPath`] if `segment` is empty, contains
    /// `/`, or contains a non-identifier character.
    pub fn append(&self, segment: &str) -> Result<Self, Error> {
        if !is_valid_segment(segment) {
            return Err(Error::InvalidPath(segment.to_string()));
        }

        let mut path = self.path.clone();
        if !path.ends_with('/') {
            path.push('/');
        }
        path.push_str(segment);
        Ok(Self { path })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Returns whether `other` equals this path or lies underneath it.
    pub fn contains(&self, other: &str) -> bool {
        other == self.path
            || (other.starts_with(&self.path)
                && other.as_bytes().get(self.path.len()) == Some(&b'/'))
    }

    /// Converts into a zbus object path for wire use.
    pub fn to_object_path(&self) -> OwnedObjectPath {
        // Validated segment-by-segment at construction.
        ObjectPath::from_string_unchecked(self.path.clone()).into()
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl FromStr for NodePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "/" {
            return Ok(Self::root());
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(Error::InvalidPath(s.to_string()));
        };
        Self::from_segments(rest.split('/'))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl fmt::Debug for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_builds_slash_separated_paths() {
        let path = NodePath::root()
            .append("com")
            .unwrap()
            .append("bzperi")
            .unwrap()
            .append("battery")
            .unwrap();
        assert_eq!(path.as_str(), "/com/bzperi/battery");
    }

    #[test]
    fn invalid_segments_are_rejected() {
        let root = NodePath::root();
        for segment in ["", "a/b", "with-dash", "sp ace", "é", "dot.ted"] {
            assert!(root.append(segment).is_err(), "accepted {segment:?}");
        }
    }

    #[test]
    fn parse_roundtrips() {
        let path: NodePath = "/com/bzperi/device_info/mfgr_name".parse().unwrap();
        assert_eq!(path.to_string(), "/com/bzperi/device_info/mfgr_name");
        assert!("/no/trailing/".parse::<NodePath>().is_err());
        assert!("relative/path".parse::<NodePath>().is_err());
    }

    #[test]
    fn containment_respects_segment_boundaries() {
        let path: NodePath = "/com/bzperi".parse().unwrap();
        assert!(path.contains("/com/bzperi"));
        assert!(path.contains("/com/bzperi/battery/level"));
        assert!(!path.contains("/com/bzperi2"));
        assert!(!path.contains("/com"));
    }
}
