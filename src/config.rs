//! Generator configuration.
//!
//! Defines the entropy source descriptors, the generator settings, and the
//! property-based "system" configuration with its registry of named custom
//! sources.
//!
//! # Property Format
//! ```text
//! csprng.blocking=true
//! csprng.poll_timeout_ms=5000
//! csprng.file.1=75.0;0;256;/dev/random
//! csprng.url.1=5.0;0;256;https://www.random.org/cgi-bin/randbyte?nbytes=256
//! csprng.program.1=0.5;0;10;last -n 50
//! csprng.other.1=jitter
//! ```
//! Numbered entries are read from `.1` upwards until the first gap.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::entropy::jitter::JitterRng;
use crate::entropy::os::OsSource;
use crate::entropy::EntropySource;
use crate::error::CsprngError;
use crate::pool::MAX_QUALITY;

/// Property prefix for file sources.
pub const FILE_PREFIX: &str = "csprng.file.";
/// Property prefix for URL sources.
pub const URL_PREFIX: &str = "csprng.url.";
/// Property prefix for program sources.
pub const PROGRAM_PREFIX: &str = "csprng.program.";
/// Property prefix for registry-named custom sources.
pub const OTHER_PREFIX: &str = "csprng.other.";
/// Property holding the blocking flag.
pub const BLOCKING: &str = "csprng.blocking";
/// Property holding the blocking-poll timeout in milliseconds.
pub const POLL_TIMEOUT_MS: &str = "csprng.poll_timeout_ms";

/// Kind of a descriptor-based source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Url,
    Program,
}

/// Where a descriptor-based source reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocator {
    /// A file or device path.
    File(PathBuf),
    /// An `http(s)://` URL.
    Url(String),
    /// A command line; the first word is the program, the rest its arguments.
    Program(String),
}

impl SourceLocator {
    /// Kind of this locator.
    pub fn kind(&self) -> SourceKind {
        match self {
            SourceLocator::File(_) => SourceKind::File,
            SourceLocator::Url(_) => SourceKind::Url,
            SourceLocator::Program(_) => SourceKind::Program,
        }
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocator::File(path) => write!(f, "file:{}", path.display()),
            SourceLocator::Url(url) => write!(f, "url:{}", url),
            SourceLocator::Program(cmd) => write!(f, "program:{}", cmd),
        }
    }
}

/// An immutable, validated slow-poll source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    quality: f64,
    skip_offset: usize,
    read_count: usize,
    locator: SourceLocator,
}

impl SourceDescriptor {
    /// Creates a descriptor.
    ///
    /// # Errors
    /// * `CsprngError::InvalidSourceConfig` if `quality` is not in `[0, 100]`,
    ///   `read_count` is 0, or the locator is empty or not a URL where one is
    ///   expected.
    pub fn new(
        quality: f64,
        skip_offset: usize,
        read_count: usize,
        locator: SourceLocator,
    ) -> Result<Self, CsprngError> {
        if !quality.is_finite() || !(0.0..=MAX_QUALITY).contains(&quality) {
            return Err(CsprngError::InvalidSourceConfig("quality must be within 0..=100"));
        }
        if read_count == 0 {
            return Err(CsprngError::InvalidSourceConfig("read count must be positive"));
        }
        match &locator {
            SourceLocator::File(path) if path.as_os_str().is_empty() => {
                return Err(CsprngError::InvalidSourceConfig("empty file path"));
            }
            SourceLocator::Url(url) if !looks_like_url(url) => {
                return Err(CsprngError::InvalidSourceConfig("malformed URL"));
            }
            SourceLocator::Program(cmd) if cmd.trim().is_empty() => {
                return Err(CsprngError::InvalidSourceConfig("empty program command"));
            }
            _ => {}
        }
        Ok(Self {
            quality,
            skip_offset,
            read_count,
            locator,
        })
    }

    /// File source.
    pub fn file(
        quality: f64,
        skip_offset: usize,
        read_count: usize,
        path: impl Into<PathBuf>,
    ) -> Result<Self, CsprngError> {
        Self::new(quality, skip_offset, read_count, SourceLocator::File(path.into()))
    }

    /// URL source.
    pub fn url(
        quality: f64,
        skip_offset: usize,
        read_count: usize,
        url: impl Into<String>,
    ) -> Result<Self, CsprngError> {
        Self::new(quality, skip_offset, read_count, SourceLocator::Url(url.into()))
    }

    /// External program source.
    pub fn program(
        quality: f64,
        skip_offset: usize,
        read_count: usize,
        command: impl Into<String>,
    ) -> Result<Self, CsprngError> {
        Self::new(quality, skip_offset, read_count, SourceLocator::Program(command.into()))
    }

    /// Parses a `quality;skip_offset;read_count;locator` tuple.
    ///
    /// Fields are trimmed. The locator is everything after the third `;`.
    pub fn parse(kind: SourceKind, value: &str) -> Result<Self, CsprngError> {
        let fields: Vec<&str> = value.trim().splitn(4, ';').map(str::trim).collect();
        let [quality, skip, count, locator] = fields[..] else {
            return Err(CsprngError::InvalidSourceConfig("expected quality;offset;count;locator"));
        };

        let quality: f64 = quality
            .parse()
            .map_err(|_| CsprngError::InvalidSourceConfig("quality is not a number"))?;
        let skip: usize = skip
            .parse()
            .map_err(|_| CsprngError::InvalidSourceConfig("offset is not a non-negative integer"))?;
        let count: usize = count
            .parse()
            .map_err(|_| CsprngError::InvalidSourceConfig("count is not a non-negative integer"))?;

        let locator = match kind {
            SourceKind::File => SourceLocator::File(PathBuf::from(locator)),
            SourceKind::Url => SourceLocator::Url(locator.to_string()),
            SourceKind::Program => SourceLocator::Program(locator.to_string()),
        };
        Self::new(quality, skip, count, locator)
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }

    pub fn skip_offset(&self) -> usize {
        self.skip_offset
    }

    pub fn read_count(&self) -> usize {
        self.read_count
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    /// Quality earned by reading `len` of the requested `read_count` bytes.
    pub fn credit(&self, len: usize) -> f64 {
        self.quality * (len as f64 / self.read_count as f64)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (quality {}, skip {}, count {})",
            self.locator, self.quality, self.skip_offset, self.read_count
        )
    }
}

fn looks_like_url(url: &str) -> bool {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && !rest.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

/// Settings for one generator instance.
pub struct GeneratorConfig {
    /// Files (or devices) read during a slow poll.
    pub file_sources: Vec<SourceDescriptor>,
    /// URLs fetched during a slow poll.
    pub url_sources: Vec<SourceDescriptor>,
    /// Programs whose output is read during a slow poll.
    pub program_sources: Vec<SourceDescriptor>,
    /// Custom sources polled last in each round.
    pub other_sources: Vec<Box<dyn EntropySource>>,
    /// Wait for the slow poll to complete, failing if it falls short.
    pub blocking: bool,
    /// Upper bound on a blocking wait. Expiry is treated as an interruption:
    /// the poll continues in the background and no error is raised.
    pub poll_timeout: Option<Duration>,
}

impl GeneratorConfig {
    /// Blocking configuration without any sources.
    pub fn new() -> Self {
        Self {
            file_sources: Vec::new(),
            url_sources: Vec::new(),
            program_sources: Vec::new(),
            other_sources: Vec::new(),
            blocking: true,
            poll_timeout: None,
        }
    }

    /// Adds a descriptor to the list matching its locator.
    pub fn add_source(&mut self, descriptor: SourceDescriptor) -> &mut Self {
        match descriptor.locator().kind() {
            SourceKind::File => self.file_sources.push(descriptor),
            SourceKind::Url => self.url_sources.push(descriptor),
            SourceKind::Program => self.program_sources.push(descriptor),
        }
        self
    }

    /// Adds a custom source.
    pub fn add_other<S: EntropySource + 'static>(&mut self, source: S) -> &mut Self {
        self.other_sources.push(Box::new(source));
        self
    }

    /// Sets the blocking flag.
    pub fn set_blocking(&mut self, blocking: bool) -> &mut Self {
        self.blocking = blocking;
        self
    }

    /// Builds a configuration from numbered properties.
    ///
    /// # Errors
    /// * `CsprngError::InvalidSourceConfig` on any malformed property or an
    ///   unknown custom source name.
    pub fn from_properties(
        props: &dyn PropertySource,
        registry: &SourceRegistry,
    ) -> Result<Self, CsprngError> {
        let mut config = Self::new();

        for value in numbered(props, FILE_PREFIX) {
            config.file_sources.push(SourceDescriptor::parse(SourceKind::File, &value)?);
        }
        for value in numbered(props, URL_PREFIX) {
            config.url_sources.push(SourceDescriptor::parse(SourceKind::Url, &value)?);
        }
        for value in numbered(props, PROGRAM_PREFIX) {
            config.program_sources.push(SourceDescriptor::parse(SourceKind::Program, &value)?);
        }
        for name in numbered(props, OTHER_PREFIX) {
            config.other_sources.push(registry.create(name.trim())?);
        }

        if let Some(value) = props.property(BLOCKING) {
            config.blocking = match value.trim().to_ascii_lowercase().as_str() {
                "true" => true,
                "false" => false,
                _ => return Err(CsprngError::InvalidSourceConfig("blocking must be true or false")),
            };
        }
        if let Some(value) = props.property(POLL_TIMEOUT_MS) {
            let ms: u64 = value
                .trim()
                .parse()
                .map_err(|_| CsprngError::InvalidSourceConfig("poll timeout is not an integer"))?;
            config.poll_timeout = Some(Duration::from_millis(ms));
        }

        log::debug!("Configuration loaded: {:?}", config);
        Ok(config)
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GeneratorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others: Vec<&str> = self.other_sources.iter().map(|s| s.name()).collect();
        f.debug_struct("GeneratorConfig")
            .field("file_sources", &self.file_sources)
            .field("url_sources", &self.url_sources)
            .field("program_sources", &self.program_sources)
            .field("other_sources", &others)
            .field("blocking", &self.blocking)
            .field("poll_timeout", &self.poll_timeout)
            .finish()
    }
}

fn numbered(props: &dyn PropertySource, prefix: &str) -> Vec<String> {
    (1..)
        .map(|i| props.property(&format!("{}{}", prefix, i)))
        .take_while(Option::is_some)
        .flatten()
        .collect()
}

/// Configuration property lookup.
pub trait PropertySource {
    /// Value of `name`, if set.
    fn property(&self, name: &str) -> Option<String>;
}

impl PropertySource for HashMap<String, String> {
    fn property(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Properties parsed from `key=value` text.
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    entries: HashMap<String, String>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `key=value` (or `key:value`) lines. Blank lines and lines starting
    /// with `#` or `!` are ignored; later keys override earlier ones.
    pub fn parse(text: &str) -> Self {
        let mut map = Self::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            match line.find(|c: char| c == '=' || c == ':') {
                Some(at) => map.insert(line[..at].trim(), line[at + 1..].trim()),
                None => map.insert(line, ""),
            }
        }
        map
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

impl PropertySource for PropertyMap {
    fn property(&self, name: &str) -> Option<String> {
        self.entries.get(name).cloned()
    }
}

/// Properties read from the environment: `csprng.file.1` is looked up as
/// `CSPRNG_FILE_1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProperties;

impl EnvProperties {
    /// Environment variable name for a property name.
    pub fn var_name(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

impl PropertySource for EnvProperties {
    fn property(&self, name: &str) -> Option<String> {
        std::env::var(Self::var_name(name)).ok()
    }
}

type SourceFactory = Box<dyn Fn() -> Box<dyn EntropySource> + Send + Sync>;

/// Named factories for custom entropy sources.
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in `jitter` and `os` sources.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("jitter", || Box::new(JitterRng::default()));
        registry.register("os", || Box::new(OsSource::default()));
        registry
    }

    /// Registers (or replaces) a factory under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn EntropySource> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    /// Instantiates the source registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn EntropySource>, CsprngError> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => {
                log::warn!("No entropy source registered as {:?}", name);
                Err(CsprngError::InvalidSourceConfig("unknown custom source"))
            }
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::custom::BufferedSource;

    #[test]
    fn test_parse_descriptor() {
        let d = SourceDescriptor::parse(SourceKind::File, " 75.0 ; 0 ; 256 ; /dev/random ").unwrap();
        assert_eq!(d.quality(), 75.0);
        assert_eq!(d.skip_offset(), 0);
        assert_eq!(d.read_count(), 256);
        assert_eq!(d.locator(), &SourceLocator::File(PathBuf::from("/dev/random")));

        let p = SourceDescriptor::parse(SourceKind::Program, "0.5;0;10;tcpdump -c 5").unwrap();
        assert_eq!(p.locator(), &SourceLocator::Program("tcpdump -c 5".into()));

        let u = SourceDescriptor::parse(SourceKind::Url, "0;256;256;http://example.org/a;b").unwrap();
        assert_eq!(u.locator(), &SourceLocator::Url("http://example.org/a;b".into()));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        let bad = [
            (SourceKind::File, "75.0;0;256"),
            (SourceKind::File, "abc;0;256;/dev/random"),
            (SourceKind::File, "75.0;-1;256;/dev/random"),
            (SourceKind::File, "75.0;0;0;/dev/random"),
            (SourceKind::File, "175.0;0;16;/dev/random"),
            (SourceKind::File, "75.0;0;16;"),
            (SourceKind::Url, "5.0;0;16;not a url"),
            (SourceKind::Program, "5.0;0;16;   "),
        ];
        for (kind, value) in bad {
            assert!(
                matches!(SourceDescriptor::parse(kind, value), Err(CsprngError::InvalidSourceConfig(_))),
                "accepted {:?}",
                value
            );
        }
    }

    #[test]
    fn test_credit_is_proportional() {
        let d = SourceDescriptor::file(80.0, 0, 200, "/dev/urandom").unwrap();
        assert_eq!(d.credit(200), 80.0);
        assert_eq!(d.credit(50), 20.0);
        assert_eq!(d.credit(0), 0.0);
    }

    #[test]
    fn test_add_source_routes_by_kind() {
        let mut config = GeneratorConfig::new();
        config
            .add_source(SourceDescriptor::file(1.0, 0, 1, "/a").unwrap())
            .add_source(SourceDescriptor::url(1.0, 0, 1, "https://b").unwrap())
            .add_source(SourceDescriptor::program(1.0, 0, 1, "c").unwrap())
            .add_other(BufferedSource::new("d", 1.0));
        assert_eq!(config.file_sources.len(), 1);
        assert_eq!(config.url_sources.len(), 1);
        assert_eq!(config.program_sources.len(), 1);
        assert_eq!(config.other_sources.len(), 1);
        assert!(config.blocking);
    }

    #[test]
    fn test_from_properties() {
        let props = PropertyMap::parse(
            "# system entropy\n\
             csprng.blocking = false\n\
             csprng.poll_timeout_ms=250\n\
             csprng.file.1=75.0;0;256;/dev/random\n\
             csprng.file.2=10.0;0;100;/home/user/file\n\
             csprng.file.4=10.0;0;100;/unreachable/after/gap\n\
             csprng.url.1=5.0;0;256;http://www.random.org/cgi-bin/randbyte?nbytes=256\n\
             csprng.program.1=0.5;0;10;last -n 50\n\
             csprng.other.1=jitter\n",
        );
        let config = GeneratorConfig::from_properties(&props, &SourceRegistry::with_defaults()).unwrap();

        assert!(!config.blocking);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.file_sources.len(), 2);
        assert_eq!(config.url_sources.len(), 1);
        assert_eq!(config.program_sources.len(), 1);
        assert_eq!(config.other_sources.len(), 1);
        assert_eq!(config.other_sources[0].name(), "CpuJitter");
    }

    #[test]
    fn test_from_properties_rejects_bad_entries() {
        let registry = SourceRegistry::with_defaults();

        let mut props = PropertyMap::new();
        props.insert("csprng.file.1", "75.0;0;256");
        assert!(GeneratorConfig::from_properties(&props, &registry).is_err());

        let mut props = PropertyMap::new();
        props.insert("csprng.other.1", "com.example.Missing");
        assert_eq!(
            GeneratorConfig::from_properties(&props, &registry).err(),
            Some(CsprngError::InvalidSourceConfig("unknown custom source"))
        );

        let mut props = PropertyMap::new();
        props.insert("csprng.blocking", "maybe");
        assert!(GeneratorConfig::from_properties(&props, &registry).is_err());
    }

    #[test]
    fn test_registry_custom_factory() {
        let mut registry = SourceRegistry::new();
        assert!(registry.create("jitter").is_err());

        registry.register("fixed", || Box::new(BufferedSource::new("fixed", 42.0)));
        let source = registry.create("fixed").unwrap();
        assert_eq!(source.quality(), 42.0);
        assert_eq!(registry.names(), vec!["fixed"]);
        assert_eq!(SourceRegistry::with_defaults().names(), vec!["jitter", "os"]);
    }

    #[test]
    fn test_env_var_names() {
        assert_eq!(EnvProperties::var_name("csprng.file.1"), "CSPRNG_FILE_1");
        assert_eq!(EnvProperties::var_name("csprng.poll_timeout_ms"), "CSPRNG_POLL_TIMEOUT_MS");
    }
}
