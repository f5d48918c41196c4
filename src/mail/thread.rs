use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::debug;

use crate::mail::{SimplifiedMessage, Thread};

/// Groups messages by thread id.
///
/// Groups keep the order in which their thread id first appears; messages
/// inside a group are ordered by timestamp. A message id seen twice is kept
/// once, wherever it first appeared. A message without a thread id becomes a
/// thread of its own, keyed by its message id.
pub fn assemble<I>(messages: I) -> IndexMap<String, Thread>
where
    I: IntoIterator<Item = SimplifiedMessage>,
{
    let mut seen_ids = HashSet::new();
    let mut groups: IndexMap<String, Vec<SimplifiedMessage>> = IndexMap::new();
    let mut unthreaded = 0usize;

    for mut message in messages {
        if !message.id.is_empty() && !seen_ids.insert(message.id.clone()) {
            debug!(message_id = %message.id, "skipping duplicate message");
            continue;
        }
        if message.thread_id.trim().is_empty() {
            unthreaded += 1;
            message.thread_id = if message.id.is_empty() {
                format!("unthreaded-{unthreaded}")
            } else {
                message.id.clone()
            };
            debug!(thread_id = %message.thread_id, "message without a thread id kept alone");
        }
        groups
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
    }

    groups
        .into_iter()
        .filter_map(|(thread_id, messages)| {
            Thread::new(thread_id.clone(), messages).map(|thread| (thread_id, thread))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::assemble;
    use crate::mail::test_support::message;

    #[test]
    fn groups_keep_first_appearance_order() {
        let threads = assemble(vec![
            message("b-2", "thread-b", "2025-08-09T10:00:00-03:00", "Re: Paraty"),
            message("a-1", "thread-a", "2025-08-01T10:00:00-03:00", "Búzios"),
            message("b-1", "thread-b", "2025-08-08T10:00:00-03:00", "Paraty"),
            message("b-1", "thread-b", "2025-08-08T10:00:00-03:00", "Paraty"),
        ]);

        let keys: Vec<&str> = threads.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["thread-b", "thread-a"]);

        let thread_b = &threads["thread-b"];
        let ids: Vec<&str> = thread_b.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b-1", "b-2"]);
        assert_eq!(thread_b.subject(), Some("Paraty"));
    }

    #[test]
    fn messages_without_thread_id_stand_alone() {
        let nameless = message("", " ", "2025-08-10T10:00:00-03:00", "sem id");
        let threads = assemble(vec![
            message("a-1", "thread-a", "2025-08-01T10:00:00-03:00", "Búzios"),
            message("orphan", "", "2025-08-08T10:00:00-03:00", "no thread"),
            nameless,
        ]);

        let keys: Vec<&str> = threads.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["thread-a", "orphan", "unthreaded-2"]);
        let total: usize = threads.values().map(|thread| thread.len()).sum();
        assert_eq!(total, 3);
        assert_eq!(threads["orphan"].first().thread_id, "orphan");
    }

    #[test]
    fn empty_input_yields_no_threads() {
        assert!(assemble(Vec::new()).is_empty());
    }

    proptest! {
        #[test]
        fn every_unique_message_lands_in_exactly_one_sorted_thread(
            specs in proptest::collection::vec((0u8..5, 0u8..12, 0u32..86_400), 0..40)
        ) {
            let messages: Vec<_> = specs
                .iter()
                .map(|(thread, id, secs)| {
                    let ts = chrono::DateTime::from_timestamp(1_754_000_000 + i64::from(*secs), 0)
                        .expect("valid timestamp")
                        .fixed_offset()
                        .to_rfc3339();
                    // thread 4 stands for a message that arrived without a thread id
                    let thread_id = if *thread == 4 { String::new() } else { format!("t-{thread}") };
                    message(&format!("m-{id}"), &thread_id, &ts, "s")
                })
                .collect();
            let unique_ids: std::collections::HashSet<_> =
                messages.iter().map(|m| m.id.clone()).collect();

            let threads = assemble(messages);
            let total: usize = threads.values().map(|thread| thread.len()).sum();
            prop_assert_eq!(total, unique_ids.len());

            for (thread_id, thread) in &threads {
                prop_assert!(!thread.is_empty());
                prop_assert_eq!(thread.id(), thread_id.as_str());
                for pair in thread.messages().windows(2) {
                    prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                }
                for message in thread.messages() {
                    prop_assert_eq!(&message.thread_id, thread_id);
                }
            }
        }
    }
}
