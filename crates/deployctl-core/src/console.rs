//! Console multiplexer: round-robins reads across each target's
//! [`OverflowBuffer`] while a task is live, and formats a terminated task's
//! persisted [`Record`]s for replay after the fact.
//!
//! Grounded on the 360-byte round-robin read loop with 20ms backoff in the
//! upstream `task.go` output loop, translated from its per-target offset map
//! and `io.EOF`-removes-target rule into the same shape over
//! [`OverflowBuffer::read_at`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::OverflowBuffer;
use crate::types::{ConsoleMsg, Record, StepStatus};

/// Bytes read per target per round, matching the upstream chunk size.
const READ_CHUNK: usize = 360;

/// Backoff between rounds that produced no output from any live target.
const IDLE_BACKOFF: Duration = Duration::from_millis(20);

struct TargetState {
    buffer: Arc<OverflowBuffer>,
    offset: usize,
    step: u8,
}

/// Multiplexes the live [`OverflowBuffer`]s of every target in a running
/// task into a single ordered stream of [`ConsoleMsg`]s.
#[derive(Default)]
pub struct LiveConsole {
    targets: Mutex<HashMap<i64, TargetState>>,
}

impl LiveConsole {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers, e.g. on stage advance) a target's buffer
    /// and the pipeline step it currently represents. `server_id = 0` is the
    /// local (pre-fan-out) stream.
    pub fn register(&self, server_id: i64, buffer: Arc<OverflowBuffer>, step: u8) {
        self.targets.lock().expect("console lock poisoned").insert(
            server_id,
            TargetState {
                buffer,
                offset: 0,
                step,
            },
        );
    }

    /// Updates the step number attributed to a target's subsequent reads,
    /// without resetting its read offset.
    pub fn set_step(&self, server_id: i64, step: u8) {
        if let Some(t) = self
            .targets
            .lock()
            .expect("console lock poisoned")
            .get_mut(&server_id)
        {
            t.step = step;
        }
    }

    pub fn is_done(&self) -> bool {
        self.targets.lock().expect("console lock poisoned").is_empty()
    }

    /// Reads up to [`READ_CHUNK`] bytes from every still-live target, in
    /// ascending `server_id` order, dropping any target that has reached
    /// sealed-EOF. Returns the messages produced this round (possibly
    /// empty).
    pub fn poll_round(&self) -> Vec<ConsoleMsg> {
        let mut targets = self.targets.lock().expect("console lock poisoned");
        let mut ids: Vec<i64> = targets.keys().copied().collect();
        ids.sort_unstable();

        let mut out = Vec::new();
        let mut done = Vec::new();
        for id in ids {
            let t = targets.get_mut(&id).expect("id came from this map");
            let mut buf = [0u8; READ_CHUNK];
            let outcome = t.buffer.read_at(&mut buf, t.offset);
            if outcome.n > 0 {
                t.offset += outcome.n;
                out.push(ConsoleMsg {
                    server_id: id,
                    step: t.step,
                    status: StepStatus::Running,
                    data: String::from_utf8_lossy(&buf[..outcome.n]).into_owned(),
                });
            }
            if outcome.eof {
                done.push(id);
            }
        }
        for id in done {
            targets.remove(&id);
        }
        out
    }

    /// Drives [`poll_round`](Self::poll_round) until every target has
    /// reached EOF, invoking `on_msg` for each message produced and sleeping
    /// [`IDLE_BACKOFF`] between rounds that yielded nothing.
    pub fn stream(&self, mut on_msg: impl FnMut(ConsoleMsg)) {
        loop {
            let batch = self.poll_round();
            if batch.is_empty() {
                if self.is_done() {
                    return;
                }
                std::thread::sleep(IDLE_BACKOFF);
                continue;
            }
            for msg in batch {
                on_msg(msg);
            }
        }
    }
}

/// Renders a terminated task's persisted records back into a single
/// transcript, ordered by `created_at` ascending (spec §4.8 replay
/// ordering). `server_name` resolves a record's `server_id` to a label;
/// `server_id == 0` is rendered as `"local"` regardless of the resolver.
pub fn replay(records: &[Record], server_name: impl Fn(i64) -> String) -> String {
    let mut ordered: Vec<&Record> = records.iter().collect();
    ordered.sort_by_key(|r| r.created_at);

    let mut out = String::new();
    for record in ordered {
        let host = if record.server_id == 0 {
            "local".to_string()
        } else {
            server_name(record.server_id)
        };
        out.push_str(&format!("{host} $ {}\r\n", record.command));
        out.push_str(&record.output);
        if !record.output.ends_with('\n') {
            out.push_str("\r\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use super::*;

    fn sample_record(server_id: i64, cmd: &str, output: &str, offset_secs: i64) -> Record {
        Record {
            id: 1,
            task_id: 1,
            user_id: 1,
            server_id,
            command: cmd.into(),
            envs: vec![],
            status: 0,
            output: output.into(),
            run_time_ms: 1,
            created_at: Utc::now() + ChronoDuration::seconds(offset_secs),
        }
    }

    #[test]
    fn poll_round_reads_in_ascending_server_id_order() {
        let console = LiveConsole::new();
        let buf_a = Arc::new(OverflowBuffer::new());
        let buf_b = Arc::new(OverflowBuffer::new());
        buf_a.write(b"from-a").unwrap();
        buf_b.write(b"from-b").unwrap();
        console.register(2, buf_b, 4);
        console.register(1, buf_a, 4);

        let batch = console.poll_round();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].server_id, 1);
        assert_eq!(batch[0].data, "from-a");
        assert_eq!(batch[1].server_id, 2);
        assert_eq!(batch[1].data, "from-b");
    }

    #[test]
    fn poll_round_caps_each_read_at_chunk_size() {
        let console = LiveConsole::new();
        let buf = Arc::new(OverflowBuffer::new());
        buf.write(&vec![b'x'; READ_CHUNK + 100]).unwrap();
        console.register(1, buf, 1);

        let batch = console.poll_round();
        assert_eq!(batch[0].data.len(), READ_CHUNK);
    }

    #[test]
    fn sealed_target_is_removed_after_final_read() {
        let console = LiveConsole::new();
        let buf = Arc::new(OverflowBuffer::new());
        buf.write(b"done").unwrap();
        buf.seal();
        console.register(1, buf, 1);

        let first = console.poll_round();
        assert_eq!(first.len(), 1);
        assert!(!console.is_done(), "still live after the data-bearing round");

        let second = console.poll_round();
        assert!(second.is_empty());
        assert!(console.is_done());
    }

    #[test]
    fn stream_drains_all_targets_then_returns() {
        let console = LiveConsole::new();
        let buf = Arc::new(OverflowBuffer::new());
        buf.write(b"hello").unwrap();
        buf.seal();
        console.register(1, buf, 2);

        let mut collected = Vec::new();
        console.stream(|msg| collected.push(msg.data));
        assert_eq!(collected, vec!["hello".to_string()]);
    }

    #[test]
    fn replay_orders_by_created_at_and_labels_local() {
        let records = vec![
            sample_record(1, "deploy.sh", "ok\n", 1),
            sample_record(0, "tar -czf release.tar.gz .", "done\n", 0),
        ];
        let transcript = replay(&records, |id| format!("server-{id}"));
        let local_pos = transcript.find("local $").unwrap();
        let remote_pos = transcript.find("server-1 $").unwrap();
        assert!(local_pos < remote_pos);
        assert!(transcript.contains("tar -czf release.tar.gz ."));
        assert!(transcript.contains("deploy.sh"));
    }

    #[test]
    fn replay_transcript_matches_snapshot_shape() {
        let records = vec![
            sample_record(0, "tar -czf release.tar.gz .", "done", 0),
            sample_record(3, "tar -xzf release.tar.gz", "ok", 1),
        ];
        let transcript = replay(&records, |id| format!("server-{id}"));
        insta::assert_snapshot!(
            transcript,
            @"local $ tar -czf release.tar.gz .\r\ndone\r\nserver-3 $ tar -xzf release.tar.gz\r\nok\r\n"
        );
    }
}
