//! Opaque termios snapshot exchanged with a subject.
//!
//! The core never interprets these bytes; a scripting layer's own termios
//! helper is expected to wrap this type and expose flag-level accessors.

/// A termios structure captured from, or destined for, a subject's slave
/// pty. Exchanged byte-for-byte on the wire since driver and subject are
/// always the same host and ABI.
#[derive(Clone, Copy)]
pub struct Termios(pub(crate) libc::termios);

impl Termios {
    pub(crate) fn from_raw(raw: libc::termios) -> Self {
        Self(raw)
    }

    pub(crate) fn to_bytes(self) -> Vec<u8> {
        let ptr = &self.0 as *const libc::termios as *const u8;
        let len = std::mem::size_of::<libc::termios>();
        unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != std::mem::size_of::<libc::termios>() {
            return None;
        }
        let mut raw: libc::termios = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut raw as *mut libc::termios as *mut u8,
                bytes.len(),
            );
        }
        Some(Self(raw))
    }

    /// Access to the raw platform structure for callers building their own
    /// termios helper on top of this crate.
    pub fn raw(&self) -> &libc::termios {
        &self.0
    }

    pub fn raw_mut(&mut self) -> &mut libc::termios {
        &mut self.0
    }
}

impl std::fmt::Debug for Termios {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Termios").finish_non_exhaustive()
    }
}
