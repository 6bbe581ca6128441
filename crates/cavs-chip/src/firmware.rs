//! Firmware image framing.
//!
//! Signed images may start with an extended manifest:
//!
//! ```text
//! 0..4   "XMan"
//! 4..8   u32 LE  total manifest length, including these 8 bytes
//! ```
//!
//! The ROM does not understand the manifest, so it is cut off before the
//! image is handed to DMA.

/// Extended manifest magic.
pub const EXT_MANIFEST_MAGIC: &[u8; 4] = b"XMan";

/// Length of the magic + length prefix.
pub const EXT_MANIFEST_PREFIX: usize = 8;

/// Length of the extended manifest at the start of `image`, if one is present.
#[must_use]
pub fn ext_manifest_len(image: &[u8]) -> Option<usize> {
    let prefix = image.get(..EXT_MANIFEST_PREFIX)?;
    if &prefix[..4] != EXT_MANIFEST_MAGIC {
        return None;
    }
    let len = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
    usize::try_from(len).ok()
}

/// Number of leading bytes to drop from `image`, clamped to its length.
#[must_use]
pub fn trim_len(image: &[u8]) -> usize {
    ext_manifest_len(image).map_or(0, |len| len.min(image.len()))
}

/// The part of `image` the ROM should receive.
#[must_use]
pub fn strip_ext_manifest(image: &[u8]) -> &[u8] {
    &image[trim_len(image)..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_manifest(len: u32, body: usize) -> Vec<u8> {
        let mut image = Vec::new();
        image.extend_from_slice(EXT_MANIFEST_MAGIC);
        image.extend_from_slice(&len.to_le_bytes());
        image.extend((0..body).map(|i| (i % 251) as u8));
        image
    }

    #[test]
    fn eight_byte_manifest_is_trimmed() {
        let image = with_manifest(8, 1024);
        assert_eq!(image.len(), 1032);
        let stripped = strip_ext_manifest(&image);
        assert_eq!(stripped.len(), 1024);
        assert_eq!(stripped[0], 0);
        assert_eq!(stripped[250], 250);
    }

    #[test]
    fn plain_image_untouched() {
        let image = vec![0x7fu8; 64];
        assert_eq!(ext_manifest_len(&image), None);
        assert_eq!(strip_ext_manifest(&image).len(), 64);
    }

    #[test]
    fn short_and_oversized_headers() {
        assert_eq!(ext_manifest_len(b"XMa"), None);
        let image = with_manifest(4096, 16);
        assert_eq!(trim_len(&image), image.len());
        assert!(strip_ext_manifest(&image).is_empty());
    }
}
