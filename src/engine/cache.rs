//! Content-hashed up-to-date checks.
//!
//! A [`Digest`] is an ordered list of commitments. Folding them through
//! BLAKE3 yields one hash, which is compared with the hash persisted by the
//! last successful run. Commitment order is part of the hash, so it must be
//! the same on every run for the cache to mean anything.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::Hash32;
use crate::engine::output::OutputPort;
use crate::engine::port::Port;
use crate::error::{CacheError, PortError};

const TAG_FILE: u8 = 0x01;
const TAG_TEXT: u8 = 0x02;
const TAG_NUMBER: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Commitment {
    File(Utf8PathBuf),
    Text(String),
    Number(String),
}

/// Accumulates the values that decide whether a task has to run again.
///
/// Everything that influences whether the task must re-run, or what its
/// outputs are, has to be committed. A value left out of the digest is a value
/// whose change goes unnoticed.
#[derive(Debug)]
pub struct Digest {
    location: Utf8PathBuf,
    commitments: Vec<Commitment>,
}

impl Digest {
    /// Creates an empty digest persisted at `location`.
    pub fn new(location: impl Into<Utf8PathBuf>) -> Self {
        Self {
            location: location.into(),
            commitments: Vec::new(),
        }
    }

    /// Path of the persisted digest file.
    pub fn location(&self) -> &Utf8Path {
        &self.location
    }

    /// Commits the content of a file. A file missing at hashing time
    /// contributes nothing, since some cached artifacts are optional.
    pub fn add_file(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.commitments.push(Commitment::File(path.into()));
        self
    }

    pub fn add_text(&mut self, text: impl Into<String>) -> &mut Self {
        self.commitments.push(Commitment::Text(text.into()));
        self
    }

    pub fn add_number(&mut self, number: impl Number) -> &mut Self {
        self.commitments.push(Commitment::Number(number.to_string()));
        self
    }

    /// Commits the current value of a port, reduced through [`Commit`].
    pub fn add_port<P>(&mut self, port: &P) -> Result<&mut Self, PortError>
    where
        P: Port,
        P::Item: Commit,
    {
        port.get()?.commit(self);
        Ok(self)
    }

    /// Folds every commitment, in declaration order, into one hash.
    pub fn compute_hex(&self) -> Result<String, CacheError> {
        let mut hasher = blake3::Hasher::new();

        for commitment in &self.commitments {
            match commitment {
                Commitment::File(path) => match Hash32::hash_file(path) {
                    Ok(hash) => {
                        hasher.update(&[TAG_FILE]);
                        hasher.update(hash.as_bytes());
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(file = %path, "committed file is missing, skipping it");
                    }
                    Err(err) => return Err(CacheError::Hash(path.clone(), err)),
                },
                Commitment::Text(text) => frame(&mut hasher, TAG_TEXT, text.as_bytes()),
                Commitment::Number(number) => frame(&mut hasher, TAG_NUMBER, number.as_bytes()),
            }
        }

        Ok(Hash32::from(hasher.finalize()).to_hex())
    }

    /// The digest persisted by the last successful run, if any.
    pub fn persisted(&self) -> Result<Option<String>, CacheError> {
        match fs::read_to_string(&self.location) {
            Ok(text) => Ok(Some(text.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CacheError::Read(self.location.clone(), err)),
        }
    }

    /// Whether the freshly computed digest equals the persisted one. No
    /// persisted digest means not up to date.
    pub fn is_up_to_date(&self) -> Result<bool, CacheError> {
        let Some(persisted) = self.persisted()? else {
            return Ok(false);
        };

        Ok(persisted == self.compute_hex()?)
    }

    /// Recomputes the digest and writes it to the digest file.
    pub fn persist(&self) -> Result<(), CacheError> {
        let hex = self.compute_hex()?;

        if let Some(dir) = self.location.parent()
            && !dir.as_str().is_empty()
        {
            fs::create_dir_all(dir).map_err(|err| CacheError::Write(self.location.clone(), err))?;
        }

        fs::write(&self.location, hex).map_err(|err| CacheError::Write(self.location.clone(), err))
    }
}

fn frame(hasher: &mut blake3::Hasher, tag: u8, bytes: &[u8]) {
    hasher.update(&[tag]);
    hasher.update(&(bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Numeric values accepted by [`Digest::add_number`].
pub trait Number: std::fmt::Display + private::Sealed {}

mod private {
    pub trait Sealed {}
}

macro_rules! impl_number {
    ($($T:ty),*) => {
        $(
            impl private::Sealed for $T {}
            impl Number for $T {}

            impl Commit for $T {
                fn commit(&self, digest: &mut Digest) {
                    digest.add_number(*self);
                }
            }
        )*
    };
}

impl_number!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

/// Reduces a port value to digest commitments.
///
/// Paths commit the content of the file they point to, strings and numbers
/// commit themselves, and containers commit their elements in order.
pub trait Commit {
    fn commit(&self, digest: &mut Digest);
}

impl Commit for String {
    fn commit(&self, digest: &mut Digest) {
        digest.add_text(self.as_str());
    }
}

impl Commit for &'static str {
    fn commit(&self, digest: &mut Digest) {
        digest.add_text(*self);
    }
}

impl Commit for bool {
    fn commit(&self, digest: &mut Digest) {
        digest.add_text(if *self { "true" } else { "false" });
    }
}

impl Commit for Utf8PathBuf {
    fn commit(&self, digest: &mut Digest) {
        digest.add_file(self.clone());
    }
}

impl<T: Commit> Commit for Option<T> {
    fn commit(&self, digest: &mut Digest) {
        if let Some(value) = self {
            value.commit(digest);
        }
    }
}

impl<T: Commit> Commit for Vec<T> {
    fn commit(&self, digest: &mut Digest) {
        for value in self {
            value.commit(digest);
        }
    }
}

type Configure = Box<dyn FnOnce(&mut Digest) -> anyhow::Result<()> + Send>;

/// Caching configuration of a task, turned into a [`Digest`] right before the
/// body would run.
pub(crate) struct Cache {
    location: OutputPort<Utf8PathBuf>,
    suffix: String,
    configure: Configure,
}

impl Cache {
    pub(crate) fn new<F>(location: OutputPort<Utf8PathBuf>, suffix: &str, configure: F) -> Self
    where
        F: FnOnce(&mut Digest) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            location,
            suffix: suffix.to_string(),
            configure: Box::new(configure),
        }
    }

    /// Resolves the digest path from the location port and collects the
    /// commitments.
    pub(crate) fn prepare(self) -> anyhow::Result<Digest> {
        let target = self.location.get()?;
        let location = digest_path(&target, &self.suffix)?;

        let mut digest = Digest::new(location);
        (self.configure)(&mut digest)?;

        Ok(digest)
    }
}

fn digest_path(target: &Utf8Path, suffix: &str) -> Result<Utf8PathBuf, CacheError> {
    let name = target
        .file_name()
        .ok_or_else(|| CacheError::Location(target.to_owned()))?;

    Ok(target.with_file_name(format!("{name}{suffix}.digest")))
}
