use super::memory::Memory;
use super::PatchError;
use super::Result;

use log::trace;

/// Byte is one position of a signature:
///    * `Exact(u8)` => The byte analyzed will have to match the given one
///    * `Any` => The byte analyzed will always match
///
/// Example
/// ```rust
///    use mempatch::pattern::Byte;
///    let byte = Byte::from("??").unwrap();
///    assert_eq!(byte, Byte::Any);
///    let byte = Byte::from("2F").unwrap();
///    assert_eq!(byte, Byte::Exact(0x2F));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Byte {
    Exact(u8),
    Any,
}
impl Byte {
    /// from returns the Byte described by a single IDA-style token
    pub fn from(token: &str) -> Result<Self> {
        trace!("Create a byte from {token}");
        use Byte::*;
        let byte = match token {
            "??" | "?" => Any,
            _ => match hex::decode(token)?.as_slice() {
                [value] => Exact(*value),
                _ => return Err(PatchError::PatternError(token.to_string())),
            },
        };
        Ok(byte)
    }

    #[inline]
    fn matches(&self, value: u8) -> bool {
        match self {
            Byte::Exact(expected) => *expected == value,
            Byte::Any => true,
        }
    }
}
impl std::fmt::Display for Byte {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Byte::Any => write!(f, "??"),
            Byte::Exact(value) => write!(f, "{:02X}", value),
        }
    }
}

/// Signature identifies a code location: a wildcard byte pattern and the
/// offset from the start of a match to the bytes that get modified.
///
/// Example
/// ```rust
/// use mempatch::pattern::Signature;
/// let signature = Signature::new(b"\x66\x89\x13\x44\x89\x73\x68\xEB", "xxxxx?xx", 0).unwrap();
/// assert_eq!(signature.to_string(), "66 89 13 44 89 ?? 68 EB");
///
/// let parsed = Signature::parse("66 89 13 44 89 ?? 68 EB", 0).unwrap();
/// assert_eq!(signature, parsed);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    bytes: Vec<Byte>,
    offset: usize,
}
impl Signature {
    /// Builds a signature from raw bytes and a mask where `x` marks an exact
    /// byte and `?` a wildcard.
    pub fn new(pattern: &[u8], mask: &str, offset: usize) -> Result<Self> {
        if pattern.len() != mask.len() {
            return Err(PatchError::PatternError(format!(
                "mask `{}` has {} positions for {} pattern bytes",
                mask,
                mask.len(),
                pattern.len()
            )));
        }
        let bytes = pattern
            .iter()
            .zip(mask.chars())
            .map(|(byte, flag)| match flag {
                'x' => Ok(Byte::Exact(*byte)),
                '?' => Ok(Byte::Any),
                other => Err(PatchError::PatternError(format!(
                    "unknown mask character `{}`",
                    other
                ))),
            })
            .collect::<Result<Vec<Byte>>>()?;
        Self::from_bytes(bytes, offset)
    }

    /// Parses an IDA-style pattern such as `"0F 84 ?? ?? ?? ?? 0F 28"`.
    pub fn parse(pattern: &str, offset: usize) -> Result<Self> {
        trace!("Create a new signature from {pattern}");
        let bytes = pattern
            .split_whitespace()
            .map(Byte::from)
            .collect::<Result<Vec<Byte>>>()?;
        Self::from_bytes(bytes, offset)
    }

    pub fn from_bytes(bytes: Vec<Byte>, offset: usize) -> Result<Self> {
        if bytes.is_empty() {
            return Err(PatchError::PatternError("empty pattern".to_string()));
        }
        Ok(Signature { bytes, offset })
    }

    pub fn bytes(&self) -> &[Byte] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Offset from the start of a match to the bytes that get modified.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Returns the position of the first match inside `data`.
    pub fn position(&self, data: &[u8]) -> Option<usize> {
        if data.len() < self.bytes.len() {
            return None;
        }
        (0..=data.len() - self.bytes.len()).find(|&start| {
            self.bytes
                .iter()
                .zip(&data[start..])
                .all(|(byte, value)| byte.matches(*value))
        })
    }

    /// find returns the absolute address of the first match inside the memory region.
    pub fn find<M: Memory + ?Sized>(&self, memory: &M) -> Result<usize> {
        trace!("Trying to find address for pattern {}", self);
        let data = memory.view()?;
        match self.position(data) {
            None => Err(PatchError::PatternNotFound(format!("{}", self))),
            Some(position) => {
                let address = memory.base() + position;
                trace!("Pattern {} found at {:#x}", self, address);
                Ok(address)
            }
        }
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", byte)?;
        }
        Ok(())
    }
}
