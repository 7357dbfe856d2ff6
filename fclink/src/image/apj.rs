//! APJ firmware container and raw-image loading.
//!
//! APJ is ArduPilot's JSON firmware container: a UTF-8 manifest with a
//! deflate-compressed, base64-encoded image payload plus the declared
//! image size and target board id.
//!
//! ```json
//! {
//!   "board_id": 9,
//!   "image_size": 123456,
//!   "image": "<base64 of zlib-deflated firmware bytes>"
//! }
//! ```
//!
//! Anything that is not an `.apj` file is treated as a raw firmware
//! binary. Either way the resulting buffer is zero-padded to a multiple
//! of 4 bytes, the unit the bootloader programs and checksums in.

use std::fs;
use std::io::Read;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::{DeflateDecoder, ZlibDecoder};
use log::debug;
use serde::Deserialize;

use crate::error::{Error, Result};

/// APJ manifest fields this loader consumes.
///
/// `image` and `image_size` are required; a missing `board_id` means
/// "unknown/any" and skips the board-id validation during flashing.
#[derive(Debug, Deserialize)]
struct ApjManifest {
    /// Target board id (0 / absent = any).
    board_id: Option<u32>,
    /// Uncompressed image size declared by the build.
    image_size: usize,
    /// Base64 of the deflate-compressed firmware bytes.
    image: String,
}

/// An in-memory firmware image ready for flashing.
///
/// Invariants: `bytes.len() >= declared_size` and `bytes.len() % 4 == 0`.
/// Created once per flash attempt and discarded afterwards.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    /// Board id the image was built for (0 = unknown/any).
    pub board_id: u32,
    /// Image size declared by the container (equals the byte length for
    /// raw binaries).
    pub declared_size: usize,
    /// Firmware bytes, zero-padded to 4-byte alignment.
    pub bytes: Vec<u8>,
}

impl FirmwareImage {
    /// Load a firmware artifact from disk.
    ///
    /// `.apj` files are parsed as APJ containers; any other extension is
    /// read as a raw binary.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware from: {}", path.display());

        let data = fs::read(path)?;
        let is_apj = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("apj"));

        if is_apj {
            Self::from_apj_bytes(&data)
        } else {
            Ok(Self::from_raw(data))
        }
    }

    /// Parse an APJ container from raw file bytes.
    pub fn from_apj_bytes(data: &[u8]) -> Result<Self> {
        let manifest: ApjManifest = serde_json::from_slice(data).map_err(|e| {
            Error::MalformedFirmware(format!("invalid APJ JSON (image/image_size required): {e}"))
        })?;

        let compressed = BASE64.decode(manifest.image.trim()).map_err(|e| {
            Error::MalformedFirmware(format!("invalid base64 in APJ image field: {e}"))
        })?;

        let mut bytes = inflate(&compressed)?;

        debug!(
            "APJ image: {} bytes decompressed, {} declared, board id {}",
            bytes.len(),
            manifest.image_size,
            manifest.board_id.unwrap_or(0)
        );

        // Pad to the 4-byte-aligned declared size (the build may declare a
        // size beyond the compressed payload to account for trailing
        // zeroes).
        let target = align4(manifest.image_size.max(bytes.len()));
        bytes.resize(target, 0);

        Ok(Self {
            board_id: manifest.board_id.unwrap_or(0),
            declared_size: manifest.image_size,
            bytes,
        })
    }

    /// Wrap raw firmware bytes, padding to 4-byte alignment.
    pub fn from_raw(mut bytes: Vec<u8>) -> Self {
        let declared_size = bytes.len();
        bytes.resize(align4(bytes.len()), 0);
        Self {
            board_id: 0,
            declared_size,
            bytes,
        }
    }

    /// Total padded length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Round `len` up to the next multiple of 4.
fn align4(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Inflate the APJ image payload.
///
/// ArduPilot's build tooling emits a zlib-wrapped stream; some third-party
/// writers emit headerless raw deflate. Try zlib first, then raw.
fn inflate(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match ZlibDecoder::new(compressed).read_to_end(&mut out) {
        Ok(_) => Ok(out),
        Err(zlib_err) => {
            out.clear();
            DeflateDecoder::new(compressed)
                .read_to_end(&mut out)
                .map_err(|_| {
                    Error::MalformedFirmware(format!(
                        "APJ image field is not valid deflate data: {zlib_err}"
                    ))
                })?;
            Ok(out)
        },
    }
}
