//! Sensitive Data Obfuscation
//!
//! Redacts configured secrets from a byte stream before it reaches the
//! wrapped writer. Typically wired between a step's stdout/stderr and the
//! container's own output.
//!
//! # Components
//!
//! - [`Obfuscator`]: `Write` adapter performing the redaction
//! - [`replacer`]: pluggable replacement strategies

pub mod replacer;

use std::io::{self, Write};

use log::debug;

use crate::matcher::{PatternTrie, Scanner, Token};

pub use replacer::{FullMask, Replacer, RevealLast};

/// Streaming secret redactor.
///
/// `write` always reports the whole input as consumed, even when bytes
/// are held back because they might be the start of a secret. Callers
/// that need everything delivered must call `flush`.
///
/// # Example
///
/// ```
/// use std::io::Write;
/// use runwatch::obfuscator::Obfuscator;
///
/// let mut out = Obfuscator::new(Vec::new(), &["hunter2"]);
/// out.write_all(b"password: hun").unwrap();
/// out.write_all(b"ter2\n").unwrap();
/// out.flush().unwrap();
/// assert_eq!(out.into_inner(), b"password: *****\n".to_vec());
/// ```
pub struct Obfuscator<W: Write> {
    inner: W,
    scanner: Scanner,
    replacer: Box<dyn Replacer>,
}

impl<W: Write> Obfuscator<W> {
    /// Wraps a writer, masking every secret fully.
    pub fn new<S: AsRef<[u8]>>(inner: W, secrets: &[S]) -> Self {
        Self {
            inner,
            scanner: Scanner::new(build_trie(secrets)),
            replacer: Box::new(FullMask::default()),
        }
    }

    /// Uses a different replacement strategy.
    pub fn with_replacer(mut self, replacer: impl Replacer + 'static) -> Self {
        self.replacer = Box::new(replacer);
        self
    }

    /// Replaces the secret set.
    ///
    /// Anything held back is decided against the old set first, then the
    /// in-flight matching state starts over.
    pub fn set_secrets<S: AsRef<[u8]>>(&mut self, secrets: &[S]) -> io::Result<()> {
        let tokens = self.scanner.finish();
        self.emit(tokens)?;
        self.scanner.reset(build_trie(secrets));
        debug!("Obfuscator secret set replaced ({} secrets)", secrets.len());
        Ok(())
    }

    /// Bytes currently held back.
    pub fn pending(&self) -> usize {
        self.scanner.pending()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Returns the wrapped writer, discarding any held-back bytes.
    pub fn into_inner(self) -> W {
        self.inner
    }

    fn emit(&mut self, tokens: Vec<Token>) -> io::Result<()> {
        for token in tokens {
            match token {
                Token::Literal(bytes) => self.inner.write_all(&bytes)?,
                Token::Match(secret) => self.inner.write_all(&self.replacer.replace(&secret))?,
            }
        }
        Ok(())
    }
}

impl<W: Write> Write for Obfuscator<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let tokens = self.scanner.feed(buf);
        self.emit(tokens)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let tokens = self.scanner.finish();
        self.emit(tokens)?;
        self.inner.flush()
    }
}

fn build_trie<S: AsRef<[u8]>>(secrets: &[S]) -> PatternTrie {
    PatternTrie::new(secrets.iter().map(|s| s.as_ref()))
}
