//! Console input that does not pin the process open.
//!
//! Reading stdin blocks with no way to interrupt it, so the reads happen on
//! a detached thread and the consumer waits on a channel while watching the
//! shutdown signal.

use std::io::{self, BufRead};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use rdmx_verbs::ShutdownSignal;
use tracing::warn;

const POLL: Duration = Duration::from_millis(50);

/// Iterator over input lines, without their terminators. Ends at EOF, on a
/// read error, or once shutdown is triggered.
pub struct LineFeed {
    rx: Receiver<io::Result<String>>,
    shutdown: ShutdownSignal,
}

impl LineFeed {
    pub fn stdin(shutdown: ShutdownSignal) -> io::Result<Self> {
        Self::from_reader(io::BufReader::new(io::stdin()), shutdown)
    }

    pub fn from_reader<R>(reader: R, shutdown: ShutdownSignal) -> io::Result<Self>
    where
        R: BufRead + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        thread::Builder::new()
            .name("rdmx-stdin".into())
            .spawn(move || {
                for line in reader.lines() {
                    let failed = line.is_err();
                    if tx.send(line).is_err() || failed {
                        return;
                    }
                }
            })?;
        Ok(Self { rx, shutdown })
    }
}

impl Iterator for LineFeed {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }
            match self.rx.recv_timeout(POLL) {
                Ok(Ok(line)) => return Some(line),
                Ok(Err(e)) => {
                    warn!(error = %e, "failed to read input");
                    return None;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};
    use std::time::Instant;

    use super::*;

    #[test]
    fn test_yields_lines_until_eof() {
        let feed = LineFeed::from_reader(
            Cursor::new("first\nsecond\r\n\nlast"),
            ShutdownSignal::new(),
        )
        .unwrap();
        let lines: Vec<String> = feed.collect();
        assert_eq!(lines, ["first", "second", "", "last"]);
    }

    /// A reader that never produces anything.
    struct Stalled;

    impl Read for Stalled {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            thread::sleep(Duration::from_secs(3600));
            Ok(0)
        }
    }

    #[test]
    fn test_shutdown_ends_a_blocked_feed() {
        let shutdown = ShutdownSignal::new();
        let mut feed =
            LineFeed::from_reader(io::BufReader::new(Stalled), shutdown.clone()).unwrap();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            shutdown.trigger();
        });
        let start = Instant::now();
        assert_eq!(feed.next(), None);
        assert!(start.elapsed() < Duration::from_secs(10));
        trigger.join().unwrap();
    }
}
