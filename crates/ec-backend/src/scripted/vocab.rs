use std::collections::HashMap;

use crate::token::TokenId;

/// Number of byte-level tokens; ids `0..256` map to single bytes.
pub const N_BYTE_TOKENS: usize = 256;

/// Byte-level vocabulary: one `<0xHH>` token per byte, BOS/EOS markers,
/// then whole-word tokens that may span several bytes (and several UTF-8
/// code points or only part of one).
#[derive(Debug, Clone)]
pub struct Vocab {
    /// Token strings, indexed by token ID.
    pub tokens: Vec<String>,
    /// Byte content of every non-byte, non-special token.
    words: HashMap<Vec<u8>, TokenId>,
    /// Special marker text, matched only when special parsing is requested.
    specials: HashMap<Vec<u8>, TokenId>,
    /// Longest key in `words` or `specials`, in bytes.
    max_len: usize,
    /// Beginning-of-sequence token ID.
    pub bos_id: TokenId,
    /// End-of-sequence token ID.
    pub eos_id: TokenId,
}

impl Vocab {
    /// Build a vocabulary of the 256 byte tokens, `<s>`, `</s>` and `words`.
    ///
    /// Duplicate or empty words are ignored.
    pub fn byte_level(words: &[&str]) -> Vocab {
        let mut tokens: Vec<String> = (0..N_BYTE_TOKENS)
            .map(|b| format!("<0x{:02X}>", b))
            .collect();

        let bos_id = tokens.len() as TokenId;
        tokens.push("<s>".to_string());
        let eos_id = tokens.len() as TokenId;
        tokens.push("</s>".to_string());

        let mut specials = HashMap::new();
        specials.insert(b"<s>".to_vec(), bos_id);
        specials.insert(b"</s>".to_vec(), eos_id);

        let mut word_map = HashMap::with_capacity(words.len());
        for word in words {
            if word.is_empty() || word_map.contains_key(word.as_bytes()) {
                continue;
            }
            word_map.insert(word.as_bytes().to_vec(), tokens.len() as TokenId);
            tokens.push((*word).to_string());
        }

        let max_len = word_map
            .keys()
            .chain(specials.keys())
            .map(Vec::len)
            .max()
            .unwrap_or(1);

        Vocab {
            tokens,
            words: word_map,
            specials,
            max_len,
            bos_id,
            eos_id,
        }
    }

    /// Token id of a whole-word token, if present.
    pub fn word_id(&self, word: &str) -> Option<TokenId> {
        self.words.get(word.as_bytes()).copied()
    }

    /// Byte token id for `byte`.
    pub fn byte_id(byte: u8) -> TokenId {
        TokenId::from(byte)
    }

    /// Encode text by greedy longest match over word tokens, falling back to
    /// one byte token per byte.
    pub fn encode(&self, text: &str, parse_special: bool) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        let mut ids = Vec::with_capacity(bytes.len());
        let mut i = 0;

        while i < bytes.len() {
            let longest = self.max_len.min(bytes.len() - i);
            let mut matched = None;
            for len in (2..=longest).rev() {
                let piece = &bytes[i..i + len];
                let hit = self.words.get(piece).or_else(|| {
                    if parse_special {
                        self.specials.get(piece)
                    } else {
                        None
                    }
                });
                if let Some(&id) = hit {
                    matched = Some((id, len));
                    break;
                }
            }

            match matched {
                Some((id, len)) => {
                    ids.push(id);
                    i += len;
                }
                None => {
                    ids.push(Self::byte_id(bytes[i]));
                    i += 1;
                }
            }
        }

        ids
    }

    /// Raw bytes of a token. Byte tokens of the form `<0xHH>` decode to the
    /// single byte; unknown ids decode to nothing.
    pub fn piece(&self, id: TokenId) -> Vec<u8> {
        let Ok(idx) = usize::try_from(id) else {
            return Vec::new();
        };
        if idx < N_BYTE_TOKENS {
            return vec![idx as u8];
        }
        self.tokens
            .get(idx)
            .map(|tok| tok.as_bytes().to_vec())
            .unwrap_or_default()
    }

    /// Number of tokens in the vocabulary.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if the vocabulary is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
