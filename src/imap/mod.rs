//! # IMAP access layer.
//!
//! [`session::MailSession`] is the seam between the sync engine and the
//! server: [`session::ImapSession`] talks to a real provider, while
//! [`replay::ReplaySession`] serves a deterministic in-memory fixture for
//! tests. [`pool::ConnectionPool`] hands out logged-in sessions and keeps
//! idle ones alive.

pub mod client;
pub mod pool;
pub mod replay;
pub mod session;

/// Compresses a sorted-or-not UID list into an IMAP sequence set,
/// e.g. `[1,2,3,7,10,11]` becomes `"1:3,7,10:11"`.
pub(crate) fn build_sequence_set(uids: &[u32]) -> String {
    let mut sorted: Vec<u32> = uids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut start, mut end) = (first, first);
    for uid in iter {
        if uid == end + 1 {
            end = uid;
        } else {
            parts.push(range_str(start, end));
            start = uid;
            end = uid;
        }
    }
    parts.push(range_str(start, end));
    parts.join(",")
}

fn range_str(start: u32, end: u32) -> String {
    if start == end {
        format!("{start}")
    } else {
        format!("{start}:{end}")
    }
}
