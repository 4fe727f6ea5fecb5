//! Deterministic image identifiers.

use std::path::Path;
use uuid::Uuid;

/// UUID v5 (URL namespace) over an image's stable identifier.
///
/// The same identifier always yields the same uuid, so a restarted producer
/// re-announces an image under the id the oracle already knows.
pub fn image_uuid(identifier: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, identifier.as_bytes())
}

/// [`image_uuid`] over a filesystem path.
pub fn image_uuid_for_path(path: &Path) -> Uuid {
    image_uuid(&path.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_uuid_is_deterministic() {
        let a = image_uuid("/srv/traps/site-4/IMG_0042.JPG");
        let b = image_uuid("/srv/traps/site-4/IMG_0042.JPG");
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
    }

    #[test]
    fn test_distinct_paths_distinct_uuids() {
        assert_ne!(
            image_uuid("/srv/traps/IMG_0001.jpg"),
            image_uuid("/srv/traps/IMG_0002.jpg")
        );
    }

    #[test]
    fn test_path_and_string_agree() {
        let path = Path::new("/srv/traps/IMG_0001.jpg");
        assert_eq!(image_uuid_for_path(path), image_uuid("/srv/traps/IMG_0001.jpg"));
    }
}
