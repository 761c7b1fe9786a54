//! Streaming Multi-Pattern Matching
//!
//! A byte trie plus a scanner that can be fed arbitrary slices. Bytes that
//! might still be the start of a pattern are carried over to the next
//! [`Scanner::feed`] call, so matches are found regardless of how the
//! input was split. Overlapping patterns resolve leftmost-longest.

/// Piece of scanned output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Bytes that are not part of any pattern
    Literal(Vec<u8>),
    /// Bytes that matched a pattern
    Match(Vec<u8>),
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: Vec<(u8, usize)>,
    terminal: bool,
}

/// Outcome of walking the trie from one start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Walk {
    /// Length of the longest confirmed match
    matched: Option<usize>,
    /// Input ran out while a longer match was still possible
    open: bool,
}

/// Byte trie over a fixed set of patterns.
#[derive(Debug, Clone)]
pub struct PatternTrie {
    nodes: Vec<Node>,
    longest: usize,
}

impl PatternTrie {
    /// Builds a trie; empty patterns are ignored.
    pub fn new<I, P>(patterns: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        let mut trie = Self {
            nodes: vec![Node::default()],
            longest: 0,
        };
        for pattern in patterns {
            trie.insert(pattern.as_ref());
        }
        trie
    }

    fn insert(&mut self, pattern: &[u8]) {
        if pattern.is_empty() {
            return;
        }
        let mut node = 0;
        for &byte in pattern {
            node = match self.child(node, byte) {
                Some(next) => next,
                None => {
                    self.nodes.push(Node::default());
                    let next = self.nodes.len() - 1;
                    self.nodes[node].children.push((byte, next));
                    next
                }
            };
        }
        self.nodes[node].terminal = true;
        self.longest = self.longest.max(pattern.len());
    }

    fn child(&self, node: usize, byte: u8) -> Option<usize> {
        self.nodes[node]
            .children
            .iter()
            .find(|(b, _)| *b == byte)
            .map(|(_, next)| *next)
    }

    /// Returns true when no pattern is configured.
    pub fn is_empty(&self) -> bool {
        self.longest == 0
    }

    /// Length of the longest pattern.
    pub fn longest_pattern(&self) -> usize {
        self.longest
    }

    /// Length of the longest pattern `input` starts with. Stops reading
    /// at the first byte no pattern continues with.
    pub fn match_prefix(&self, input: &[u8]) -> Option<usize> {
        self.walk(input).matched
    }

    fn walk(&self, input: &[u8]) -> Walk {
        let mut node = 0;
        let mut matched = None;
        for (depth, &byte) in input.iter().enumerate() {
            match self.child(node, byte) {
                Some(next) => {
                    node = next;
                    if self.nodes[next].terminal {
                        matched = Some(depth + 1);
                    }
                }
                None => {
                    return Walk {
                        matched,
                        open: false,
                    }
                }
            }
        }
        Walk {
            matched,
            open: !self.nodes[node].children.is_empty(),
        }
    }
}

/// Incremental scanner with a carry-over buffer.
#[derive(Debug, Clone)]
pub struct Scanner {
    trie: PatternTrie,
    carry: Vec<u8>,
}

impl Scanner {
    pub fn new(trie: PatternTrie) -> Self {
        Self {
            trie,
            carry: Vec::new(),
        }
    }

    /// Number of bytes held back waiting for more input.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Feeds more input and returns every token that is now decided.
    pub fn feed(&mut self, input: &[u8]) -> Vec<Token> {
        self.scan(input, false)
    }

    /// Decides the carried-over bytes, preferring the longest confirmed
    /// match, else passing them through raw.
    pub fn finish(&mut self) -> Vec<Token> {
        self.scan(&[], true)
    }

    /// Replaces the pattern set, dropping any carried-over bytes.
    pub fn reset(&mut self, trie: PatternTrie) {
        self.trie = trie;
        self.carry.clear();
    }

    fn scan(&mut self, input: &[u8], last: bool) -> Vec<Token> {
        let mut data = std::mem::take(&mut self.carry);
        data.extend_from_slice(input);

        let mut tokens = Vec::new();
        if self.trie.is_empty() {
            if !data.is_empty() {
                tokens.push(Token::Literal(data));
            }
            return tokens;
        }

        let mut literal_start = 0;
        let mut pos = 0;
        while pos < data.len() {
            let walk = self.trie.walk(&data[pos..]);
            if walk.open && !last {
                break;
            }
            match walk.matched {
                Some(len) => {
                    if literal_start < pos {
                        tokens.push(Token::Literal(data[literal_start..pos].to_vec()));
                    }
                    tokens.push(Token::Match(data[pos..pos + len].to_vec()));
                    pos += len;
                    literal_start = pos;
                }
                None => pos += 1,
            }
        }

        if literal_start < pos {
            tokens.push(Token::Literal(data[literal_start..pos].to_vec()));
        }
        self.carry = data.split_off(pos);
        tokens
    }
}
