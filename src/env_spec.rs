//! Environment configuration sent to a subject as part of `release`.

/// Describes how a subject's environment should be rewritten before exec.
///
/// `expand()` turns this into the wire payload's three parts: whether to
/// clear the existing environment first, the NUL-terminated `NAME=VALUE`
/// block to set, and the NUL-terminated `NAME` block to unset.
#[derive(Debug, Clone, Default)]
pub struct EnvSpec {
    clear: bool,
    set: Vec<(String, String)>,
    unset: Vec<String>,
}

impl EnvSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wipe the subject's entire environment before applying `set`/`unset`.
    pub fn clear(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set.push((name.into(), value.into()));
        self
    }

    pub fn unset(mut self, name: impl Into<String>) -> Self {
        self.unset.push(name.into());
        self
    }

    /// Produce the three pieces of the `ENV_SETUP` wire payload: the clear
    /// flag, the NUL-terminated `set` block (`NAME=VALUE\0...`), and the
    /// NUL-terminated `unset` block (`NAME\0...`). Order is preserved so
    /// the subject applies unset-then-set in submission order, matching
    /// the round-trip property: `clear` wipes first, unset runs before
    /// set, both in the order given here.
    pub fn expand(&self) -> (bool, Vec<u8>, Vec<u8>) {
        let mut set_block = Vec::new();
        for (name, value) in &self.set {
            set_block.extend_from_slice(name.as_bytes());
            set_block.push(b'=');
            set_block.extend_from_slice(value.as_bytes());
            set_block.push(0);
        }
        let mut unset_block = Vec::new();
        for name in &self.unset {
            unset_block.extend_from_slice(name.as_bytes());
            unset_block.push(0);
        }
        (self.clear, set_block, unset_block)
    }

    /// Encode the full `ENV_SETUP` payload: `{clear: u8, set_len: u32,
    /// unset_len: u32, bytes: [set_block | unset_block]}`.
    pub(crate) fn to_payload(&self) -> Vec<u8> {
        let (clear, set_block, unset_block) = self.expand();
        let mut buf = Vec::with_capacity(9 + set_block.len() + unset_block.len());
        buf.push(clear as u8);
        buf.extend_from_slice(&(set_block.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&(unset_block.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&set_block);
        buf.extend_from_slice(&unset_block);
        buf
    }

    pub(crate) fn is_empty(&self) -> bool {
        !self.clear && self.set.is_empty() && self.unset.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_orders_unset_then_set_blocks() {
        let spec = EnvSpec::new()
            .clear(true)
            .set("A", "1")
            .set("B", "2")
            .unset("C");
        let (clear, set_block, unset_block) = spec.expand();
        assert!(clear);
        assert_eq!(set_block, b"A=1\0B=2\0");
        assert_eq!(unset_block, b"C\0");
    }

    #[test]
    fn payload_encodes_lengths_before_bytes() {
        let spec = EnvSpec::new().set("A", "1");
        let payload = spec.to_payload();
        assert_eq!(payload[0], 0);
        let set_len = u32::from_ne_bytes(payload[1..5].try_into().unwrap());
        let unset_len = u32::from_ne_bytes(payload[5..9].try_into().unwrap());
        assert_eq!(set_len as usize, b"A=1\0".len());
        assert_eq!(unset_len, 0);
    }
}
