use std::io;

/// A bounded sink for process output
///
/// Keeps at most `limit` bytes and silently drops the rest, while still
/// counting everything that was written. Writes never fail, so the process
/// producing the output is never stalled by a full buffer.
#[derive(Debug, Clone)]
pub struct OutputCapture {
    limit: usize,
    data: Vec<u8>,
    total: u64,
}

impl OutputCapture {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            data: Vec::new(),
            total: 0,
        }
    }

    /// Appends `chunk`, keeping only what still fits below the limit
    pub fn write(&mut self, chunk: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.data.len());
        let kept = chunk.len().min(room);
        self.data.extend_from_slice(&chunk[..kept]);
        self.total += chunk.len() as u64;
        chunk.len()
    }

    /// Bytes retained so far, never longer than the limit
    pub fn snapshot(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of bytes written, including the dropped ones
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }
}

impl io::Write for OutputCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(OutputCapture::write(self, buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
