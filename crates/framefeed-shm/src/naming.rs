//! Names of the shared mapping and its mutex.
//!
//! The mapping name is `<product>/<major>.<minor>.<patch>.<build>-s<size>`,
//! with the header size in lowercase hex. Embedding the version and the
//! struct size means mismatched feeders and consumers never open each
//! other's region, so no field-by-field compatibility is needed. The mutex
//! name is the mapping name with `.mutex` appended.
//!
//! These are canonical names; each platform maps them onto what its object
//! namespace accepts.

use std::fmt;

use crate::config::{ShmConfig, SoftwareVersion};
use crate::layout::FrameMetadata;

/// Suffix turning the mapping name into the mutex name.
pub const MUTEX_SUFFIX: &str = ".mutex";

/// Canonical names of the two shared objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmNames {
    mapping: String,
    mutex: String,
}

impl ShmNames {
    /// Derive the names for a product, version and header size.
    pub fn new(product_id: &str, version: &SoftwareVersion, header_size: usize) -> Self {
        let mapping = format!("{product_id}/{version}-s{header_size:x}");
        let mutex = format!("{mapping}{MUTEX_SUFFIX}");
        Self { mapping, mutex }
    }

    /// Names for this crate's [`FrameMetadata`] layout.
    pub fn for_config(config: &ShmConfig) -> Self {
        Self::new(&config.product_id, &config.version, FrameMetadata::SIZE)
    }

    /// Canonical mapping name.
    pub fn mapping(&self) -> &str {
        &self.mapping
    }

    /// Canonical mutex name.
    pub fn mutex(&self) -> &str {
        &self.mutex
    }
}

impl fmt::Display for ShmNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_name_format() {
        let names = ShmNames::new("com.example.overlay", &SoftwareVersion::new(1, 10, 2, 3456), 0x580);
        assert_eq!(names.mapping(), "com.example.overlay/1.10.2.3456-s580");
        assert_eq!(names.mutex(), "com.example.overlay/1.10.2.3456-s580.mutex");
    }

    #[test]
    fn test_names_are_deterministic() {
        let config = ShmConfig::new("com.example.overlay");
        assert_eq!(ShmNames::for_config(&config), ShmNames::for_config(&config));
    }

    #[test]
    fn test_build_number_changes_name() {
        let a = ShmConfig::new("com.example.overlay").with_build(1);
        let b = ShmConfig::new("com.example.overlay").with_build(2);
        assert_ne!(ShmNames::for_config(&a), ShmNames::for_config(&b));
    }

    proptest! {
        #[test]
        fn prop_header_size_is_part_of_name(a in 1usize..1 << 20, b in 1usize..1 << 20) {
            prop_assume!(a != b);
            let version = SoftwareVersion::new(1, 0, 0, 0);
            let left = ShmNames::new("p", &version, a);
            let right = ShmNames::new("p", &version, b);
            prop_assert_ne!(left.mapping(), right.mapping());
            prop_assert_ne!(left.mutex(), right.mutex());
        }
    }
}
