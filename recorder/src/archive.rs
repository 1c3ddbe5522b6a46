//! Encrypted archive – a streamed zip with a single AES-encrypted entry,
//! written through a [`StreamBridge`] so the bytes can be uploaded as they
//! are produced.

use std::io::Write;

use zip::write::{SimpleFileOptions, StreamWriter};
use zip::{AesMode, CompressionMethod, ZipWriter};

use crate::bridge::StreamBridge;

/// Archive settings, passed explicitly instead of set globally.
#[derive(Clone)]
pub struct ArchiveOptions {
    /// Name of the single entry inside the archive.
    pub entry_name: String,
    pub password: String,
    pub aes_mode: AesMode,
}

impl ArchiveOptions {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            entry_name: "video.mkv".into(),
            password: password.into(),
            aes_mode: AesMode::Aes256,
        }
    }
}

impl std::fmt::Debug for ArchiveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveOptions")
            .field("entry_name", &self.entry_name)
            .field("aes_mode", &self.aes_mode)
            .finish_non_exhaustive()
    }
}

/// Writer for one segment's archive.
pub struct EncryptedArchive {
    zip: ZipWriter<StreamWriter<StreamBridge>>,
}

impl EncryptedArchive {
    /// Start the archive and its single entry.  Video is already compressed,
    /// so the entry is stored.
    pub fn create(bridge: StreamBridge, options: &ArchiveOptions) -> zip::result::ZipResult<Self> {
        let mut zip = ZipWriter::new_stream(bridge);
        let file_options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Stored)
            .large_file(true)
            .with_aes_encryption(options.aes_mode, &options.password);
        zip.start_file(options.entry_name.as_str(), file_options)?;
        Ok(Self { zip })
    }

    /// Append `data` to the entry and push it through to the bridge.
    pub fn append(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.zip.write_all(data)?;
        self.zip.flush()
    }

    /// Close the entry and write the central directory.
    pub fn finish(self) -> zip::result::ZipResult<()> {
        self.zip.finish()?;
        Ok(())
    }
}

// ─── tests ───────────────────────────────────────────────────────────────
