//! Request keys and the typed options bag
//!
//! A [`RequestKey`] is the sole deduplication mechanism: two loads share work
//! and cache entries exactly when their keys compare equal. Disk cache names
//! are derived by feeding every component's canonical, length-prefixed bytes
//! into SHA-256, so they stay stable across process restarts.

use crate::disk::DiskKey;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Width or height meaning "use the source dimensions"
pub const SIZE_ORIGINAL: u32 = u32::MAX;

/// Writes `bytes` prefixed with their length so adjacent fields cannot blur
fn put_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

/// Identity of the thing being loaded
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Model {
    /// Remote resource
    Url(String),
    /// Local file
    File(PathBuf),
    /// Resource bundled with the application
    Asset(String),
    /// Anything else a fetcher knows how to resolve
    Custom {
        /// Fetcher-defined namespace
        kind: Cow<'static, str>,
        /// Identifier within the namespace
        id: String,
    },
}

impl Model {
    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            Self::Url(url) => {
                put_bytes(hasher, b"url");
                put_bytes(hasher, url.as_bytes());
            }
            Self::File(path) => {
                put_bytes(hasher, b"file");
                put_bytes(hasher, path.to_string_lossy().as_bytes());
            }
            Self::Asset(name) => {
                put_bytes(hasher, b"asset");
                put_bytes(hasher, name.as_bytes());
            }
            Self::Custom { kind, id } => {
                put_bytes(hasher, b"custom");
                put_bytes(hasher, kind.as_bytes());
                put_bytes(hasher, id.as_bytes());
            }
        }
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.write_str(url),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Asset(name) => write!(f, "asset:{name}"),
            Self::Custom { kind, id } => write!(f, "{kind}:{id}"),
        }
    }
}

/// External version marker, such as an etag or a modification time
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature(String);

impl Signature {
    /// Create a signature
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The signature text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable name of a decoded or transcoded resource type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceType(Cow<'static, str>);

impl ResourceType {
    /// Raw encoded bytes
    pub const BYTES: Self = Self::named("bytes");
    /// Decoded bitmap
    pub const BITMAP: Self = Self::named("bitmap");
    /// Drawable wrapper around a bitmap or animation
    pub const DRAWABLE: Self = Self::named("drawable");
    /// Decoded animated GIF
    pub const GIF: Self = Self::named("gif");

    /// Create a type from a static name
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    /// Create a type from an owned name
    #[must_use]
    pub fn owned(name: String) -> Self {
        Self(Cow::Owned(name))
    }

    /// The type name
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one applied transformation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransformationKey {
    id: Cow<'static, str>,
    params: Vec<u8>,
}

impl TransformationKey {
    /// Create a transformation key from an id and its serialized parameters
    #[must_use]
    pub fn new(id: impl Into<Cow<'static, str>>, params: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            params: params.into(),
        }
    }

    /// Transformation id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn update_digest(&self, hasher: &mut Sha256) {
        put_bytes(hasher, self.id.as_bytes());
        put_bytes(hasher, &self.params);
    }
}

/// A typed option value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OptionValue {
    /// Boolean flag
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point value stored as its IEEE-754 bits
    Float(u64),
    /// Text
    Text(String),
}

impl OptionValue {
    /// Create a float value
    #[must_use]
    pub fn float(value: f64) -> Self {
        Self::Float(value.to_bits())
    }

    fn update_digest(&self, hasher: &mut Sha256) {
        match self {
            Self::Bool(v) => {
                hasher.update([0u8]);
                hasher.update([u8::from(*v)]);
            }
            Self::Int(v) => {
                hasher.update([1u8]);
                hasher.update(v.to_be_bytes());
            }
            Self::UInt(v) => {
                hasher.update([2u8]);
                hasher.update(v.to_be_bytes());
            }
            Self::Float(bits) => {
                hasher.update([3u8]);
                hasher.update(bits.to_be_bytes());
            }
            Self::Text(text) => {
                hasher.update([4u8]);
                put_bytes(hasher, text.as_bytes());
            }
        }
    }
}

/// Types usable as option values
pub trait OptionType: Clone + Send + Sync + 'static {
    /// Convert into the tagged representation
    fn into_value(self) -> OptionValue;
    /// Convert back, or `None` if the tag does not match
    fn from_value(value: &OptionValue) -> Option<Self>;
}

impl OptionType for bool {
    fn into_value(self) -> OptionValue {
        OptionValue::Bool(self)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for i64 {
    fn into_value(self) -> OptionValue {
        OptionValue::Int(self)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for u64 {
    fn into_value(self) -> OptionValue {
        OptionValue::UInt(self)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::UInt(v) => Some(*v),
            _ => None,
        }
    }
}

impl OptionType for u32 {
    fn into_value(self) -> OptionValue {
        OptionValue::UInt(u64::from(self))
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::UInt(v) => Self::try_from(*v).ok(),
            _ => None,
        }
    }
}

impl OptionType for f64 {
    fn into_value(self) -> OptionValue {
        OptionValue::float(self)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Float(bits) => Some(Self::from_bits(*bits)),
            _ => None,
        }
    }
}

impl OptionType for String {
    fn into_value(self) -> OptionValue {
        OptionValue::Text(self)
    }
    fn from_value(value: &OptionValue) -> Option<Self> {
        match value {
            OptionValue::Text(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Whether an option feeds disk cache names or only in-memory identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKeyContribution {
    /// Part of both memory equality and disk digests
    Disk,
    /// Part of memory equality only
    MemoryOnly,
}

/// Typed identifier of an option with its default
#[derive(Debug, Clone)]
pub struct OptionKey<T> {
    name: &'static str,
    default: T,
    contribution: CacheKeyContribution,
}

impl<T: OptionType> OptionKey<T> {
    /// Option that contributes to disk cache names
    pub const fn disk(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
            contribution: CacheKeyContribution::Disk,
        }
    }

    /// Option that only distinguishes in-memory entries
    pub const fn memory(name: &'static str, default: T) -> Self {
        Self {
            name,
            default,
            contribution: CacheKeyContribution::MemoryOnly,
        }
    }

    /// Option name
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Value used when the option is not set
    #[must_use]
    pub fn default_value(&self) -> T {
        self.default.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OptionEntry {
    value: OptionValue,
    contribution: CacheKeyContribution,
}

/// Ordered collection of typed options
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Options {
    entries: BTreeMap<&'static str, OptionEntry>,
}

impl Options {
    /// Create an empty options bag
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Options::insert`]
    #[must_use]
    pub fn with<T: OptionType>(mut self, key: &OptionKey<T>, value: T) -> Self {
        self.insert(key, value);
        self
    }

    /// Set an option, replacing any earlier value
    pub fn insert<T: OptionType>(&mut self, key: &OptionKey<T>, value: T) {
        self.entries.insert(
            key.name,
            OptionEntry {
                value: value.into_value(),
                contribution: key.contribution,
            },
        );
    }

    /// Read an option, falling back to its default
    #[must_use]
    pub fn get<T: OptionType>(&self, key: &OptionKey<T>) -> T {
        self.entries
            .get(key.name)
            .and_then(|entry| T::from_value(&entry.value))
            .unwrap_or_else(|| key.default_value())
    }

    /// Number of explicitly set options
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no option is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn update_digest(&self, hasher: &mut Sha256) {
        let disk: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.contribution == CacheKeyContribution::Disk)
            .collect();
        hasher.update((disk.len() as u64).to_be_bytes());
        for (name, entry) in disk {
            put_bytes(hasher, name.as_bytes());
            entry.value.update_digest(hasher);
        }
    }
}

/// Canonical identity of a load request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
    model: Model,
    signature: Option<Signature>,
    width: u32,
    height: u32,
    resource_type: ResourceType,
    transcode_type: ResourceType,
    transformations: Vec<TransformationKey>,
    options: Options,
}

impl RequestKey {
    /// Start building a key for `model`
    #[must_use]
    pub fn builder(model: Model) -> RequestKeyBuilder {
        RequestKeyBuilder {
            key: Self {
                model,
                signature: None,
                width: SIZE_ORIGINAL,
                height: SIZE_ORIGINAL,
                resource_type: ResourceType::BYTES,
                transcode_type: ResourceType::BYTES,
                transformations: Vec::new(),
                options: Options::new(),
            },
            transcode_set: false,
        }
    }

    /// Model being loaded
    #[must_use]
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// External signature, if any
    #[must_use]
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Requested width
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Requested height
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Type produced by decoding
    #[must_use]
    pub fn resource_type(&self) -> &ResourceType {
        &self.resource_type
    }

    /// Type handed to the caller after transcoding
    #[must_use]
    pub fn transcode_type(&self) -> &ResourceType {
        &self.transcode_type
    }

    /// Transformations in application order
    #[must_use]
    pub fn transformations(&self) -> &[TransformationKey] {
        &self.transformations
    }

    /// Options bag
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Disk name for the fully decoded and transformed resource
    #[must_use]
    pub fn resource_disk_key(&self) -> DiskKey {
        let mut hasher = Sha256::new();
        self.model.update_digest(&mut hasher);
        self.update_signature_digest(&mut hasher);
        hasher.update(self.width.to_be_bytes());
        hasher.update(self.height.to_be_bytes());
        put_bytes(&mut hasher, self.resource_type.as_str().as_bytes());
        put_bytes(&mut hasher, self.transcode_type.as_str().as_bytes());
        hasher.update((self.transformations.len() as u64).to_be_bytes());
        for transformation in &self.transformations {
            transformation.update_digest(&mut hasher);
        }
        self.options.update_digest(&mut hasher);
        DiskKey::from_digest(hasher)
    }

    /// Disk name for the unmodified source data
    #[must_use]
    pub fn source_disk_key(&self) -> DiskKey {
        let mut hasher = Sha256::new();
        self.model.update_digest(&mut hasher);
        self.update_signature_digest(&mut hasher);
        DiskKey::from_digest(hasher)
    }

    fn update_signature_digest(&self, hasher: &mut Sha256) {
        match &self.signature {
            Some(signature) => {
                hasher.update([1u8]);
                put_bytes(hasher, signature.as_str().as_bytes());
            }
            None => hasher.update([0u8]),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.model)?;
        if self.width != SIZE_ORIGINAL || self.height != SIZE_ORIGINAL {
            write!(f, " [{}x{}]", self.width, self.height)?;
        }
        write!(f, " as {}", self.transcode_type)
    }
}

/// Builder for [`RequestKey`]
#[derive(Debug, Clone)]
pub struct RequestKeyBuilder {
    key: RequestKey,
    transcode_set: bool,
}

impl RequestKeyBuilder {
    /// Target dimensions
    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.key.width = width;
        self.key.height = height;
        self
    }

    /// External signature
    #[must_use]
    pub fn signature(mut self, signature: Signature) -> Self {
        self.key.signature = Some(signature);
        self
    }

    /// Decoded type; also the transcode type unless one is set explicitly
    #[must_use]
    pub fn resource_type(mut self, resource_type: ResourceType) -> Self {
        if !self.transcode_set {
            self.key.transcode_type = resource_type.clone();
        }
        self.key.resource_type = resource_type;
        self
    }

    /// Type handed to the caller
    #[must_use]
    pub fn transcode_type(mut self, transcode_type: ResourceType) -> Self {
        self.key.transcode_type = transcode_type;
        self.transcode_set = true;
        self
    }

    /// Append a transformation
    #[must_use]
    pub fn transform(mut self, transformation: TransformationKey) -> Self {
        self.key.transformations.push(transformation);
        self
    }

    /// Replace the options bag
    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.key.options = options;
        self
    }

    /// Finish the key
    #[must_use]
    pub fn build(self) -> RequestKey {
        self.key
    }
}
