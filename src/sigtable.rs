//! Conversions between a `signo -> caught` map and the `sigset_t` the wire
//! protocol and `libc` signal calls actually traffic in.

use std::collections::BTreeMap;

/// Signal table as seen at the public boundary: `signo -> bool`, matching
/// the driver contract's "table of signo→bool" shape literally.
pub type SigTable = BTreeMap<i32, bool>;

pub(crate) const MAX_SIGNO: i32 = 64;

/// Build a table marking every signal between 1 and `MAX_SIGNO` present in
/// `set`.
pub(crate) fn sigset_to_table(set: &libc::sigset_t) -> SigTable {
    let mut table = SigTable::new();
    for signo in 1..=MAX_SIGNO {
        let present = unsafe { libc::sigismember(set, signo) } == 1;
        if present {
            table.insert(signo, true);
        }
    }
    table
}

/// Build a `sigset_t` containing every signal the table marks `true`.
pub(crate) fn table_to_sigset(table: &SigTable) -> libc::sigset_t {
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe { libc::sigemptyset(&mut set) };
    for (&signo, &caught) in table {
        if caught {
            unsafe { libc::sigaddset(&mut set, signo) };
        }
    }
    set
}

/// Serialize a `sigset_t` byte-for-byte for the `SETMASK` wire payload.
pub(crate) fn sigset_to_bytes(set: &libc::sigset_t) -> Vec<u8> {
    let ptr = set as *const libc::sigset_t as *const u8;
    let len = std::mem::size_of::<libc::sigset_t>();
    unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec()
}

/// Deserialize a `sigset_t` from raw wire bytes.
pub(crate) fn bytes_to_sigset(bytes: &[u8]) -> Option<libc::sigset_t> {
    if bytes.len() != std::mem::size_of::<libc::sigset_t>() {
        return None;
    }
    let mut set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut set as *mut libc::sigset_t as *mut u8,
            bytes.len(),
        );
    }
    Some(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_round_trips_through_sigset() {
        let mut table = SigTable::new();
        table.insert(libc::SIGTERM, true);
        table.insert(libc::SIGINT, true);

        let set = table_to_sigset(&table);
        let decoded = sigset_to_table(&set);

        assert!(decoded.get(&libc::SIGTERM).copied().unwrap_or(false));
        assert!(decoded.get(&libc::SIGINT).copied().unwrap_or(false));
    }

    #[test]
    fn bytes_round_trip() {
        let mut table = SigTable::new();
        table.insert(libc::SIGUSR1, true);
        let set = table_to_sigset(&table);
        let bytes = sigset_to_bytes(&set);
        let decoded = bytes_to_sigset(&bytes).unwrap();
        assert!(unsafe { libc::sigismember(&decoded, libc::SIGUSR1) } == 1);
    }
}
