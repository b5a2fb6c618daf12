//! History budgeting: bound the message count and the cost of old tool
//! output without breaking call/result pairing.
//!
//! A **round** is one user message plus every following non-user message up
//! to the next user message. Messages before the first user message form a
//! leading partial round.

use std::collections::HashSet;

use chatrelay_core::message::{Message, Part, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload that replaces tool output in older rounds.
pub const OMITTED_RESULT: &str = "[prior tool result omitted]";

/// What [`trim`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimStats {
    pub input: usize,
    pub kept: usize,
    pub dropped: usize,
    /// Tool results replaced by [`OMITTED_RESULT`]
    pub compacted: usize,
}

/// Keep the newest `max_count` messages (0 = unlimited) and compact tool
/// results older than the newest `tool_keep_rounds` rounds.
///
/// The window is widened backwards whenever a kept tool result would lose
/// its call, so the output can exceed `max_count` only by the messages that
/// pairing requires. It is never longer than the input.
pub fn trim(messages: &[Message], max_count: usize, tool_keep_rounds: usize) -> (Vec<Message>, TrimStats) {
    let start = window_start(messages, max_count);
    let mut kept: Vec<Message> = messages[start..].to_vec();
    let compacted = compact_old_results(&mut kept, tool_keep_rounds);

    let stats = TrimStats {
        input: messages.len(),
        kept: kept.len(),
        dropped: start,
        compacted,
    };
    (kept, stats)
}

/// First index of the kept window.
fn window_start(messages: &[Message], max_count: usize) -> usize {
    if max_count == 0 {
        return 0;
    }
    let mut start = messages.len().saturating_sub(max_count);

    loop {
        let calls: HashSet<&str> = messages[start..]
            .iter()
            .flat_map(|m| m.tool_calls().map(|(id, _, _)| id))
            .collect();

        // Earliest message outside the window holding a call a kept result answers
        let needed = messages[start..]
            .iter()
            .flat_map(|m| m.tool_results().map(|(call_id, _)| call_id))
            .filter(|call_id| !calls.contains(call_id))
            .filter_map(|call_id| {
                messages[..start]
                    .iter()
                    .rposition(|m| m.tool_calls().any(|(id, _, _)| id == call_id))
            })
            .min();

        match needed {
            Some(index) => start = index,
            None => return start,
        }
    }
}

/// Replace tool-result payloads in all but the newest `keep_rounds` rounds.
fn compact_old_results(messages: &mut [Message], keep_rounds: usize) -> usize {
    let round_starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == Role::User)
        .map(|(i, _)| i)
        .collect();

    // Leading messages before the first user turn count as their own round
    let total_rounds = round_starts.len() + usize::from(round_starts.first() != Some(&0) && !messages.is_empty());
    if total_rounds <= keep_rounds {
        return 0;
    }

    let boundary = if keep_rounds == 0 {
        messages.len()
    } else {
        round_starts[round_starts.len() - keep_rounds.min(round_starts.len())]
    };

    let mut compacted = 0;
    for msg in &mut messages[..boundary] {
        for part in &mut msg.parts {
            if let Part::ToolResult { payload, .. } = part {
                if payload.as_str() != Some(OMITTED_RESULT) {
                    *payload = Value::String(OMITTED_RESULT.into());
                    compacted += 1;
                }
            }
        }
    }
    compacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plain(n: usize) -> Vec<Message> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Message::user(format!("u{i}"))
                } else {
                    Message::assistant(format!("a{i}"))
                }
            })
            .collect()
    }

    fn tool_round(call_id: &str, output: Value) -> Vec<Message> {
        vec![
            Message::user(format!("please run {call_id}")),
            Message::new(
                Role::Assistant,
                vec![Part::tool_call(call_id, "add_node", json!({"kind": call_id}))],
            ),
            Message::tool_result(call_id, output),
            Message::assistant("done"),
        ]
    }

    fn assert_pairing_safe(messages: &[Message]) {
        let mut calls = HashSet::new();
        for m in messages {
            for (id, _, _) in m.tool_calls() {
                calls.insert(id.to_string());
            }
            for (call_id, _) in m.tool_results() {
                assert!(calls.contains(call_id), "orphaned result {call_id}");
            }
        }
    }

    #[test]
    fn keeps_newest_max_count_in_order() {
        let history = plain(30);
        let (kept, stats) = trim(&history, 24, 2);
        assert_eq!(kept.len(), 24);
        assert_eq!(kept[..], history[6..]);
        assert_eq!(stats.dropped, 6);
    }

    #[test]
    fn zero_means_unlimited() {
        let history = plain(30);
        let (kept, _) = trim(&history, 0, 2);
        assert_eq!(kept.len(), 30);
    }

    #[test]
    fn window_extends_to_keep_call_with_result() {
        let mut history = plain(4);
        history.extend(tool_round("c1", json!({"id": 1})));
        // Cut lands between the call (index 5) and its result (index 6)
        let (kept, stats) = trim(&history, 2, 5);
        assert_pairing_safe(&kept);
        assert_eq!(kept.len(), 3);
        assert!(kept[0].has_tool_calls());
        assert_eq!(stats.dropped, 5);
    }

    #[test]
    fn old_round_results_compacted_calls_untouched() {
        let mut history = tool_round("old", json!({"big": "x".repeat(1000)}));
        history.extend(plain(2));
        history.extend(plain(2));

        let (kept, stats) = trim(&history, 0, 2);
        assert_eq!(stats.compacted, 1);
        let results: Vec<_> = kept.iter().flat_map(|m| m.tool_results()).collect();
        assert_eq!(results, vec![("old", &json!(OMITTED_RESULT))]);
        let calls: Vec<_> = kept.iter().flat_map(|m| m.tool_calls()).collect();
        assert_eq!(calls, vec![("old", "add_node", &json!({"kind": "old"}))]);
    }

    #[test]
    fn recent_rounds_keep_full_results() {
        let mut history = tool_round("a", json!(1));
        history.extend(tool_round("b", json!(2)));
        let (kept, stats) = trim(&history, 0, 2);
        assert_eq!(stats.compacted, 0);
        assert_eq!(kept, history);

        let (kept, stats) = trim(&history, 0, 1);
        assert_eq!(stats.compacted, 1);
        let payloads: Vec<_> = kept.iter().flat_map(|m| m.tool_results()).map(|(_, p)| p.clone()).collect();
        assert_eq!(payloads, vec![json!(OMITTED_RESULT), json!(2)]);
    }

    #[test]
    fn leading_non_user_messages_form_a_round() {
        let mut history = vec![
            Message::new(Role::Assistant, vec![Part::tool_call("z", "t", json!({}))]),
            Message::tool_result("z", json!("payload")),
        ];
        history.extend(plain(2));
        let (_, stats) = trim(&history, 0, 1);
        assert_eq!(stats.compacted, 1);
    }

    #[test]
    fn never_longer_than_input_and_always_paired() {
        let mut history = Vec::new();
        for i in 0..6 {
            history.extend(tool_round(&format!("c{i}"), json!(i)));
        }
        for max in 0..history.len() + 2 {
            let (kept, stats) = trim(&history, max, 2);
            assert!(kept.len() <= history.len());
            assert_eq!(stats.kept + stats.dropped, history.len());
            assert_pairing_safe(&kept);
            if max > 0 {
                // Only the pairing extension may exceed the count
                assert!(kept.len() <= max + 1, "max {max} kept {}", kept.len());
            }
        }
    }
}
