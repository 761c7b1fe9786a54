//! Replacement Strategies

/// Produces the bytes written in place of a matched secret.
pub trait Replacer: Send {
    fn replace(&self, secret: &[u8]) -> Vec<u8>;
}

impl Replacer for Box<dyn Replacer> {
    fn replace(&self, secret: &[u8]) -> Vec<u8> {
        (**self).replace(secret)
    }
}

/// Replaces the whole secret with a fixed mask.
#[derive(Debug, Clone)]
pub struct FullMask {
    pub mask: String,
}

impl Default for FullMask {
    fn default() -> Self {
        Self {
            mask: "*****".to_string(),
        }
    }
}

impl Replacer for FullMask {
    fn replace(&self, _secret: &[u8]) -> Vec<u8> {
        self.mask.as_bytes().to_vec()
    }
}

/// Masks all but the last N bytes of the secret.
///
/// Secrets no longer than N are masked entirely.
#[derive(Debug, Clone, Copy)]
pub struct RevealLast(pub usize);

impl Replacer for RevealLast {
    fn replace(&self, secret: &[u8]) -> Vec<u8> {
        if secret.len() <= self.0 {
            return vec![b'*'; secret.len()];
        }
        let split = secret.len() - self.0;
        let mut out = vec![b'*'; split];
        out.extend_from_slice(&secret[split..]);
        out
    }
}
