//! Upload request model and validation.
//!
//! An [`UploadRequest`] describes one image upload: where the bytes come
//! from, how they are packed, which server type writes them and how the
//! resulting snapshot is labelled. Requests are assembled through
//! [`UploadRequestBuilder`], which rejects contradictory input before any
//! provider resource exists.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Url;
use thiserror::Error;
use tokio::io::AsyncRead;

/// Label key attached to every resource this tool creates.
pub const CREATED_BY_LABEL: &str = "apricote.de/created-by";

/// Label value paired with [`CREATED_BY_LABEL`].
pub const CREATED_BY_VALUE: &str = "hcloud-upload-image";

/// Byte stream of a local disk image.
pub type ImageReader = Box<dyn AsyncRead + Send + Unpin>;

/// Errors raised while validating an upload request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ValidationError {
    /// Raised when the compression token is not recognised.
    #[error("unknown compression {0:?}, valid options: bz2, xz")]
    UnknownCompression(String),
    /// Raised when the compression is known but cannot be handled.
    #[error("compression {0} is not supported yet")]
    UnsupportedCompression(Compression),
    /// Raised when the image format token is not recognised.
    #[error("unknown image format {0:?}, valid options: raw, qcow2")]
    UnknownFormat(String),
    /// Raised when the architecture token is not recognised.
    #[error("unknown architecture {0:?}, valid options: x86, arm")]
    UnknownArchitecture(String),
    /// Raised when neither an architecture nor a server type was given.
    #[error("either an architecture or a server type is required")]
    MissingTarget,
    /// Raised when both an architecture and a server type were given.
    #[error("architecture and server type are mutually exclusive")]
    ConflictingTarget,
    /// Raised when the explicit server type is blank.
    #[error("server type must not be empty")]
    EmptyServerType,
    /// Raised when both a URL and a local stream were given.
    #[error("image URL and local image are mutually exclusive")]
    ConflictingSource,
    /// Raised when the image URL cannot be parsed.
    #[error("invalid image URL {url:?}: {message}")]
    InvalidUrl {
        /// URL as supplied by the caller.
        url: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when the image URL uses a scheme other than HTTP(S).
    #[error("image URL must use http or https, got {0}")]
    UnsupportedUrlScheme(String),
    /// Raised when a label has no key or is not in `key=value` form.
    #[error("invalid label {0:?}, expected key=value")]
    InvalidLabel(String),
}

/// Compression applied to the disk image.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Compression {
    /// Plain, uncompressed bytes.
    #[default]
    None,
    /// `bzip2` compressed.
    Bz2,
    /// `xz` compressed.
    Xz,
    /// `zstd` compressed; accepted on the command line but not handled yet.
    Zstd,
}

impl Compression {
    /// Returns the token used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bz2 => "bz2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "none" => Ok(Self::None),
            "bz2" => Ok(Self::Bz2),
            "xz" => Ok(Self::Xz),
            "zstd" => Ok(Self::Zstd),
            other => Err(ValidationError::UnknownCompression(other.to_owned())),
        }
    }
}

/// Container format of the disk image.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ImageFormat {
    /// Raw block device contents.
    #[default]
    Raw,
    /// QEMU copy-on-write v2 container.
    Qcow2,
}

impl ImageFormat {
    /// Returns the token used on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "raw" => Ok(Self::Raw),
            "qcow2" => Ok(Self::Qcow2),
            other => Err(ValidationError::UnknownFormat(other.to_owned())),
        }
    }
}

/// CPU architecture of the disk image.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Architecture {
    /// 64-bit x86.
    X86,
    /// 64-bit ARM.
    Arm,
}

impl Architecture {
    /// Returns the provider's name for the architecture.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::X86 => "x86",
            Self::Arm => "arm",
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "x86" => Ok(Self::X86),
            "arm" => Ok(Self::Arm),
            other => Err(ValidationError::UnknownArchitecture(other.to_owned())),
        }
    }
}

/// Server that writes the image: picked by architecture or named directly.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ServerTarget {
    /// Use the default small server type for this architecture.
    Architecture(Architecture),
    /// Use this server type verbatim.
    ServerType(String),
}

/// Where the image bytes come from.
pub enum ImageSource {
    /// The temporary server downloads the image itself.
    Url(Url),
    /// The bytes are streamed from this machine over the SSH session.
    Local(ImageReader),
    /// No bytes at all; the remote pipeline reads an empty stream.
    None,
}

impl ImageSource {
    /// Returns the borrowed view used for command assembly.
    #[must_use]
    pub const fn kind(&self) -> SourceKind<'_> {
        match self {
            Self::Url(url) => SourceKind::Remote(url),
            Self::Local(_) | Self::None => SourceKind::Stream,
        }
    }

    /// Consumes the source, returning the local stream if there is one.
    #[must_use]
    pub fn into_reader(self) -> Option<ImageReader> {
        match self {
            Self::Local(reader) => Some(reader),
            Self::Url(_) | Self::None => None,
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(&url.as_str()).finish(),
            Self::Local(_) => f.write_str("Local(..)"),
            Self::None => f.write_str("None"),
        }
    }
}

/// Source kind as seen by the command assembler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SourceKind<'a> {
    /// Fetch the image from this URL on the remote host.
    Remote(&'a Url),
    /// Read the image from the session's standard input.
    Stream,
}

/// Parameters for a single upload.
#[derive(Debug)]
pub struct UploadRequest {
    /// Image byte source.
    pub source: ImageSource,
    /// Compression of the image bytes.
    pub compression: Compression,
    /// Container format of the image.
    pub format: ImageFormat,
    /// Server type selection.
    pub target: ServerTarget,
    /// Optional description of the resulting snapshot.
    pub description: Option<String>,
    /// User supplied labels, without the provenance pair.
    pub labels: BTreeMap<String, String>,
    /// Advisory size of the image in bytes.
    pub size_hint: Option<u64>,
    /// Leaves temporary resources in place for debugging.
    pub skip_cleanup: bool,
}

impl UploadRequest {
    /// Starts a builder for an [`UploadRequest`].
    #[must_use]
    pub fn builder() -> UploadRequestBuilder {
        UploadRequestBuilder::default()
    }

    /// Returns the user labels merged with the provenance label pair.
    #[must_use]
    pub fn full_labels(&self) -> BTreeMap<String, String> {
        full_labels(&self.labels)
    }
}

/// Merges `labels` with the provenance pair. The provenance value wins.
#[must_use]
pub fn full_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = labels.clone();
    merged.insert(CREATED_BY_LABEL.to_owned(), CREATED_BY_VALUE.to_owned());
    merged
}

/// Parses a `key=value` label.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidLabel`] when the separator is missing or
/// the key is blank.
pub fn parse_label(raw: &str) -> Result<(String, String), ValidationError> {
    let Some((key, value)) = raw.split_once('=') else {
        return Err(ValidationError::InvalidLabel(raw.to_owned()));
    };
    let trimmed_key = key.trim();
    if trimmed_key.is_empty() {
        return Err(ValidationError::InvalidLabel(raw.to_owned()));
    }
    Ok((trimmed_key.to_owned(), value.trim().to_owned()))
}

/// Parses an image URL, accepting only HTTP(S).
///
/// # Errors
///
/// Returns [`ValidationError::InvalidUrl`] or
/// [`ValidationError::UnsupportedUrlScheme`].
pub fn parse_image_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|err| ValidationError::InvalidUrl {
        url: raw.to_owned(),
        message: err.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ValidationError::UnsupportedUrlScheme(other.to_owned())),
    }
}

/// Builder for [`UploadRequest`] that checks the exactly-one-of rules.
#[derive(Default)]
pub struct UploadRequestBuilder {
    image_url: Option<Url>,
    image_reader: Option<ImageReader>,
    compression: Compression,
    format: ImageFormat,
    architecture: Option<Architecture>,
    server_type: Option<String>,
    description: Option<String>,
    labels: BTreeMap<String, String>,
    size_hint: Option<u64>,
    skip_cleanup: bool,
}

impl UploadRequestBuilder {
    /// Sets the remote image URL.
    #[must_use]
    pub fn image_url(mut self, url: Url) -> Self {
        self.image_url = Some(url);
        self
    }

    /// Sets the local image stream.
    #[must_use]
    pub fn image_reader(mut self, reader: ImageReader) -> Self {
        self.image_reader = Some(reader);
        self
    }

    /// Sets the compression.
    #[must_use]
    pub const fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the image format.
    #[must_use]
    pub const fn format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    /// Selects the server type by architecture.
    #[must_use]
    pub const fn architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = Some(architecture);
        self
    }

    /// Selects the server type explicitly.
    #[must_use]
    pub fn server_type(mut self, server_type: impl Into<String>) -> Self {
        self.server_type = Some(server_type.into());
        self
    }

    /// Sets the snapshot description.
    #[must_use]
    pub fn description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Adds one label.
    #[must_use]
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Adds several labels.
    #[must_use]
    pub fn labels(mut self, labels: impl IntoIterator<Item = (String, String)>) -> Self {
        self.labels.extend(labels);
        self
    }

    /// Sets the advisory image size.
    #[must_use]
    pub const fn size_hint(mut self, size_hint: Option<u64>) -> Self {
        self.size_hint = size_hint;
        self
    }

    /// Keeps temporary resources after the upload.
    #[must_use]
    pub const fn skip_cleanup(mut self, skip_cleanup: bool) -> Self {
        self.skip_cleanup = skip_cleanup;
        self
    }

    /// Builds and validates the [`UploadRequest`].
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] when the source or target is
    /// contradictory, or a label key is blank.
    pub fn build(self) -> Result<UploadRequest, ValidationError> {
        let source = match (self.image_url, self.image_reader) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingSource),
            (Some(url), None) => ImageSource::Url(url),
            (None, Some(reader)) => ImageSource::Local(reader),
            (None, None) => ImageSource::None,
        };

        let target = match (self.architecture, self.server_type) {
            (Some(_), Some(_)) => return Err(ValidationError::ConflictingTarget),
            (Some(architecture), None) => ServerTarget::Architecture(architecture),
            (None, Some(name)) if name.trim().is_empty() => {
                return Err(ValidationError::EmptyServerType);
            }
            (None, Some(name)) => ServerTarget::ServerType(name.trim().to_owned()),
            (None, None) => return Err(ValidationError::MissingTarget),
        };

        if let Some(key) = self.labels.keys().find(|key| key.trim().is_empty()) {
            return Err(ValidationError::InvalidLabel(format!("{key}=")));
        }

        Ok(UploadRequest {
            source,
            compression: self.compression,
            format: self.format,
            target,
            description: self.description,
            labels: self.labels,
            size_hint: self.size_hint,
            skip_cleanup: self.skip_cleanup,
        })
    }
}
