use std::{collections::HashMap, time::Duration};

use crate::domain::{MessageId, UserId};

/// Identity of one outbound notification.
///
/// The same edit or delete can arrive through two business streams (one per
/// participant), so keys carry the recipient rather than the chat.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotifyKey {
    Edit {
        recipient: UserId,
        message_id: MessageId,
        edit_date: i64,
    },
    Delete {
        recipient: UserId,
        message_id: MessageId,
    },
}

/// TTL set of recently sent notifications.
///
/// A second identical edit inside the window is suppressed as well; that is
/// accepted.
#[derive(Debug)]
pub struct NotifyDedup {
    ttl_secs: i64,
    seen: HashMap<NotifyKey, i64>,
}

impl NotifyDedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl_secs: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            seen: HashMap::new(),
        }
    }

    /// `true` when `key` should be sent now; records it if so.
    pub fn check_at(&mut self, key: NotifyKey, now: i64) -> bool {
        if let Some(ts) = self.seen.get(&key) {
            if now.saturating_sub(*ts) < self.ttl_secs {
                return false;
            }
        }
        self.seen.insert(key, now);
        self.prune(now);
        true
    }

    fn prune(&mut self, now: i64) {
        let ttl = self.ttl_secs;
        self.seen.retain(|_, ts| now.saturating_sub(*ts) < ttl);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn del(mid: i32) -> NotifyKey {
        NotifyKey::Delete {
            recipient: UserId(1),
            message_id: MessageId(mid),
        }
    }

    #[test]
    fn suppresses_repeats_within_ttl() {
        let mut d = NotifyDedup::new(Duration::from_secs(120));
        assert!(d.check_at(del(5), 1_000));
        assert!(!d.check_at(del(5), 1_119));
        assert!(d.check_at(del(5), 1_120));
    }

    #[test]
    fn edits_with_new_timestamp_are_distinct() {
        let mut d = NotifyDedup::new(Duration::from_secs(120));
        let edit = |edit_date| NotifyKey::Edit {
            recipient: UserId(1),
            message_id: MessageId(5),
            edit_date,
        };
        assert!(d.check_at(edit(10), 0));
        assert!(d.check_at(edit(11), 0));
        assert!(!d.check_at(edit(10), 1));
        assert!(d.check_at(del(5), 1));
    }

    #[test]
    fn expired_entries_are_pruned() {
        let mut d = NotifyDedup::new(Duration::from_secs(10));
        assert!(d.check_at(del(1), 0));
        assert!(d.check_at(del(2), 5));
        assert!(d.check_at(del(3), 20));
        assert_eq!(d.len(), 1);
    }
}
