//! ---
//! xmq_section: "02-messaging-ipc-data-model"
//! xmq_subsection: "module"
//! xmq_type: "source"
//! xmq_scope: "code"
//! xmq_description: "Message envelope, broker transport, and message client."
//! xmq_version: "v0.0.0-prealpha"
//! xmq_owner: "tbd"
//! ---

/// True when two queue names address each other.
///
/// Names are compared segment by segment; `*` on either side matches exactly
/// one segment, so `/eos/*/fst` matches `/eos/node1/fst` but not `/eos/fst`.
/// The relation is symmetric because both subscriptions and destinations may
/// carry wildcards.
pub fn queue_matches(left: &str, right: &str) -> bool {
    let mut lhs = segments(left);
    let mut rhs = segments(right);
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return true,
            (Some(a), Some(b)) if a == "*" || b == "*" || a == b => continue,
            _ => return false,
        }
    }
}

/// True when the name contains a wildcard segment.
pub fn is_pattern(queue: &str) -> bool {
    segments(queue).any(|segment| segment == "*")
}

fn segments(queue: &str) -> impl Iterator<Item = &str> {
    queue.split('/').filter(|segment| !segment.is_empty())
}
