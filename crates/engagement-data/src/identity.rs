//! Durable mapping from raw volunteer identities to pseudonyms.
//!
//! A logged-in volunteer is identified by their numeric user id and an
//! anonymous one by the IP-derived string in the export. Each raw identity
//! is mapped to `name:<digits>` or `anon:<digits>` the first time it is
//! seen, and the mapping is kept in a JSON dictionary between runs. The
//! dictionary only ever grows: once a raw identity has a pseudonym it keeps
//! it for good.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;

use camino::Utf8Path;
use cap_std::fs::Dir;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use tracing::debug;

use crate::atomic_io::write_atomic;
use crate::error::{ConfigError, IdentityError, SchemaError};

/// Maximum number of random candidates drawn for one new pseudonym.
pub const MAX_PSEUDONYM_ATTEMPTS: usize = 10;

/// Default number of digits in a new pseudonym.
pub const DEFAULT_PSEUDONYM_DIGITS: usize = 8;

/// Largest supported number of digits in a new pseudonym.
pub const MAX_PSEUDONYM_DIGITS: usize = 32;

const NAMED_PREFIX: &str = "name:";
const ANONYMOUS_PREFIX: &str = "anon:";

/// A volunteer identity as it appears in an export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RawIdentity {
    /// A logged-in volunteer's numeric user id.
    LoggedIn(u64),
    /// An anonymous volunteer's IP-derived identifier.
    Anonymous(String),
}

impl RawIdentity {
    /// Builds the identity of an export row from its `user_id` and `user_ip`
    /// cells; an empty `user_id` marks an anonymous volunteer.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidValue`] if `user_id` is not an unsigned
    /// integer, or if an anonymous row has no `user_ip`.
    pub fn from_cells(
        classification_id: u64,
        user_id: &str,
        user_ip: &str,
    ) -> Result<Self, SchemaError> {
        let id = user_id.trim();
        if !id.is_empty() {
            return id
                .parse()
                .map(Self::LoggedIn)
                .map_err(|_| SchemaError::InvalidValue {
                    classification_id,
                    column: "user_id".to_owned(),
                    value: id.to_owned(),
                    message: "user ids must be unsigned integers".to_owned(),
                });
        }
        let ip = user_ip.trim();
        if ip.is_empty() {
            return Err(SchemaError::InvalidValue {
                classification_id,
                column: "user_ip".to_owned(),
                value: String::new(),
                message: "anonymous rows need an IP-derived identifier".to_owned(),
            });
        }
        Ok(Self::Anonymous(ip.to_owned()))
    }

    /// Returns the dictionary key for this identity.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            Self::LoggedIn(id) => id.to_string(),
            Self::Anonymous(ip) => ip.clone(),
        }
    }

    const fn prefix(&self) -> &'static str {
        match self {
            Self::LoggedIn(_) => NAMED_PREFIX,
            Self::Anonymous(_) => ANONYMOUS_PREFIX,
        }
    }
}

/// A stable replacement for a raw identity, such as `name:04718263`.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Pseudonym(String);

impl Pseudonym {
    fn parse(key: &str, value: String) -> Result<Self, IdentityError> {
        let tail = value
            .strip_prefix(NAMED_PREFIX)
            .or_else(|| value.strip_prefix(ANONYMOUS_PREFIX));
        match tail {
            Some(digits) if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self(value))
            }
            _ => Err(IdentityError::MalformedPseudonym {
                key: key.to_owned(),
                pseudonym: value,
            }),
        }
    }

    /// Returns the full pseudonym, prefix included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` for pseudonyms of anonymous volunteers.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with(ANONYMOUS_PREFIX)
    }

    /// Returns the digits after the prefix.
    #[must_use]
    pub fn digits(&self) -> &str {
        self.0
            .split_once(':')
            .map_or(self.0.as_str(), |(_, digits)| digits)
    }
}

impl fmt::Debug for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Pseudonym {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Draws fixed-length random digit strings for new pseudonyms.
#[derive(Debug, Clone)]
pub struct PseudonymGenerator {
    rng: ChaCha8Rng,
    digits: usize,
}

impl PseudonymGenerator {
    /// Creates a generator drawing `digits` digits per pseudonym.
    ///
    /// Without a `seed` the generator is seeded from the thread RNG; a fixed
    /// seed makes new pseudonyms reproducible.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPseudonymDigits`] when `digits` is zero
    /// or exceeds [`MAX_PSEUDONYM_DIGITS`].
    pub fn new(digits: usize, seed: Option<u64>) -> Result<Self, ConfigError> {
        if digits == 0 || digits > MAX_PSEUDONYM_DIGITS {
            return Err(ConfigError::InvalidPseudonymDigits {
                digits,
                max: MAX_PSEUDONYM_DIGITS,
            });
        }
        let rng = ChaCha8Rng::seed_from_u64(seed.unwrap_or_else(|| rand::rng().random()));
        Ok(Self { rng, digits })
    }

    /// Returns the number of digits per pseudonym.
    #[must_use]
    pub const fn digits(&self) -> usize {
        self.digits
    }

    fn draw(&mut self, prefix: &str) -> String {
        let mut candidate = String::with_capacity(prefix.len() + self.digits);
        candidate.push_str(prefix);
        for _ in 0..self.digits {
            candidate.push(char::from(b'0' + self.rng.random_range(0..10_u8)));
        }
        candidate
    }
}

/// The identity dictionary of one run.
///
/// Load it once, resolve every raw identity through it, then
/// [`persist`](Self::persist) it. Persisting consumes the registry, so a run
/// cannot write the dictionary twice.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    entries: BTreeMap<String, Pseudonym>,
    used: HashSet<String>,
    generator: PseudonymGenerator,
    added: usize,
}

impl IdentityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(generator: PseudonymGenerator) -> Self {
        Self {
            entries: BTreeMap::new(),
            used: HashSet::new(),
            generator,
            added: 0,
        }
    }

    /// Parses a persisted dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError`] if the JSON is not an object of strings, or
    /// if it repeats a raw key, repeats a pseudonym or holds a pseudonym
    /// without a known prefix.
    pub fn from_json(json: &str, generator: PseudonymGenerator) -> Result<Self, IdentityError> {
        let Entries(entries) =
            serde_json::from_str(json).map_err(|e| IdentityError::Parse {
                message: e.to_string(),
            })?;

        let mut registry = Self::new(generator);
        for (key, value) in entries {
            let pseudonym = Pseudonym::parse(&key, value)?;
            if !registry.used.insert(pseudonym.as_str().to_owned()) {
                return Err(IdentityError::DuplicatePseudonym {
                    pseudonym: pseudonym.0,
                });
            }
            if registry.entries.contains_key(&key) {
                return Err(IdentityError::DuplicateRawKey { key });
            }
            registry.entries.insert(key, pseudonym);
        }
        Ok(registry)
    }

    /// Loads the dictionary at `path` inside `dir`; a missing file yields an
    /// empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::Read`] if the file exists but cannot be read,
    /// or any error of [`IdentityRegistry::from_json`].
    pub fn load(
        dir: &Dir,
        path: &Utf8Path,
        generator: PseudonymGenerator,
    ) -> Result<Self, IdentityError> {
        match dir.read_to_string(path) {
            Ok(json) => Self::from_json(&json, generator),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path, "no identity dictionary yet; starting empty");
                Ok(Self::new(generator))
            }
            Err(err) => Err(IdentityError::Read {
                path: path.to_path_buf(),
                message: err.to_string(),
            }),
        }
    }

    /// Returns the pseudonym for `identity`, assigning a new one on first
    /// sight.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::PseudonymExhaustion`] if
    /// [`MAX_PSEUDONYM_ATTEMPTS`] random candidates all collide, or
    /// [`IdentityError::MalformedPseudonym`] if the stored pseudonym belongs
    /// to the other namespace.
    pub fn resolve(&mut self, identity: &RawIdentity) -> Result<Pseudonym, IdentityError> {
        let key = identity.key();
        if let Some(existing) = self.entries.get(&key) {
            if existing.is_anonymous() != matches!(identity, RawIdentity::Anonymous(_)) {
                return Err(IdentityError::MalformedPseudonym {
                    key,
                    pseudonym: existing.0.clone(),
                });
            }
            return Ok(existing.clone());
        }

        for _ in 0..MAX_PSEUDONYM_ATTEMPTS {
            let candidate = self.generator.draw(identity.prefix());
            if self.used.insert(candidate.clone()) {
                let pseudonym = Pseudonym(candidate);
                self.entries.insert(key, pseudonym.clone());
                self.added += 1;
                return Ok(pseudonym);
            }
        }
        Err(IdentityError::PseudonymExhaustion {
            attempts: MAX_PSEUDONYM_ATTEMPTS,
            digits: self.generator.digits(),
        })
    }

    /// Returns the stored pseudonym for `identity` without assigning one.
    #[must_use]
    pub fn lookup(&self, identity: &RawIdentity) -> Option<&Pseudonym> {
        self.entries.get(&identity.key())
    }

    /// Returns the number of raw identities in the dictionary.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when the dictionary is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns how many pseudonyms were assigned since loading.
    #[must_use]
    pub const fn added(&self) -> usize {
        self.added
    }

    /// Serialises the dictionary as pretty JSON with sorted keys.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::DuplicatePseudonym`] if two raw identities
    /// share a pseudonym, or [`IdentityError::Serialise`] if encoding fails.
    pub fn to_json(&self) -> Result<String, IdentityError> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for pseudonym in self.entries.values() {
            if !seen.insert(pseudonym.as_str()) {
                return Err(IdentityError::DuplicatePseudonym {
                    pseudonym: pseudonym.0.clone(),
                });
            }
        }
        let plain: BTreeMap<&str, &str> = self
            .entries
            .iter()
            .map(|(key, pseudonym)| (key.as_str(), pseudonym.as_str()))
            .collect();
        let mut json = serde_json::to_string_pretty(&plain).map_err(|e| IdentityError::Serialise {
            message: e.to_string(),
        })?;
        json.push('\n');
        Ok(json)
    }

    /// Re-validates the dictionary and writes it atomically to `path` inside
    /// `dir`.
    ///
    /// # Errors
    ///
    /// Returns any error of [`IdentityRegistry::to_json`], or
    /// [`IdentityError::Write`] if the file cannot be replaced.
    pub fn persist(self, dir: &Dir, path: &Utf8Path) -> Result<(), IdentityError> {
        let json = self.to_json()?;
        write_atomic(dir, path, json.as_bytes())?;
        debug!(path = %path, identities = self.entries.len(), added = self.added, "identity dictionary written");
        Ok(())
    }
}

/// Object entries in document order, repeats included.
struct Entries(Vec<(String, String)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a JSON object mapping raw identities to pseudonyms")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, String>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
