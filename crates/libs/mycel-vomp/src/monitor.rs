//! The boundary to local call clients: a sink for the newline-prefixed
//! status lines and the length-prefixed binary audio packets the engine
//! emits. A node with no attached sink cannot answer calls, so incoming
//! dials are rejected.

pub trait MonitorSink {
    /// Whether any client is listening; gates call acceptance.
    fn active(&self) -> bool;

    /// A status line, already framed as `\nNAME:...\n`.
    fn line(&mut self, line: &str);

    /// Binary audio: the `\n*<bytes>:AUDIOPACKET:...` header then samples.
    fn audio(&mut self, header: &str, samples: &[u8]);
}

/// Sink that forwards everything to the log; useful for headless nodes and
/// as the daemon default.
#[derive(Default)]
pub struct LogMonitor {
    pub accept_calls: bool,
}

impl MonitorSink for LogMonitor {
    fn active(&self) -> bool {
        self.accept_calls
    }

    fn line(&mut self, line: &str) {
        log::info!("vomp: {}", line.trim());
    }

    fn audio(&mut self, header: &str, samples: &[u8]) {
        log::trace!("vomp: {} ({} sample bytes)", header.trim(), samples.len());
    }
}

/// Sink that records everything, for tests and embedders.
#[derive(Default)]
pub struct RecordingMonitor {
    pub lines: Vec<String>,
    pub audio_packets: Vec<Vec<u8>>,
}

impl MonitorSink for RecordingMonitor {
    fn active(&self) -> bool {
        true
    }

    fn line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }

    fn audio(&mut self, _header: &str, samples: &[u8]) {
        self.audio_packets.push(samples.to_vec());
    }
}
