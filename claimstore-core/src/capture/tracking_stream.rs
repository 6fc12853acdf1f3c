use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{ClaimStoreError, Result};

/// How a payload is captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// Small payload kept inline with its tracking data.
    Unclaimed,
    /// Payload saved to the claim store.
    Claimed,
}

/// Describes how, and where, a payload has been captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDescriptor {
    /// Inline payload when unclaimed; claim store relative path when claimed.
    pub data: String,
    pub mode: CaptureMode,
}

impl CaptureDescriptor {
    pub fn unclaimed(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mode: CaptureMode::Unclaimed,
        }
    }

    pub fn claimed(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            mode: CaptureMode::Claimed,
        }
    }
}

/// Destination a claimed payload is replicated to while being read.
pub trait CaptureSink: Write + Send {
    /// Called once, after the last byte of the payload has been written.
    fn complete(&mut self) -> io::Result<()>;
}

impl CaptureSink for Vec<u8> {
    fn complete(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type ReadEvent = Box<dyn FnMut() + Send>;

/// Message body stream with capture and tracking support.
///
/// Reading the stream replicates its payload to the capture sink, if one has
/// been set up. Bytes peeked with [`probe`](Self::probe) are replayed by the
/// subsequent reads and fire no read events.
pub struct TrackingStream<R> {
    inner: R,
    probed: Vec<u8>,
    replayed: usize,
    descriptor: Option<CaptureDescriptor>,
    sink: Option<Box<dyn CaptureSink>>,
    started: bool,
    finished: bool,
    before_first_read: Vec<ReadEvent>,
    after_last_read: Vec<ReadEvent>,
}

impl<R> fmt::Debug for TrackingStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingStream")
            .field("descriptor", &self.descriptor)
            .field("capturing", &self.sink.is_some())
            .field("probed", &self.probed.len())
            .field("started", &self.started)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<R: Read> TrackingStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            probed: Vec::new(),
            replayed: 0,
            descriptor: None,
            sink: None,
            started: false,
            finished: false,
            before_first_read: Vec::new(),
            after_last_read: Vec::new(),
        }
    }

    /// Wraps the stream of a payload redeemed from the claim store.
    pub fn redeemed(inner: R, descriptor: CaptureDescriptor) -> Result<Self> {
        if descriptor.mode != CaptureMode::Claimed {
            return Err(ClaimStoreError::Capture(format!(
                "a redeemed stream requires a claimed capture descriptor, not {:?}",
                descriptor.mode
            )));
        }
        let mut stream = Self::new(inner);
        stream.descriptor = Some(descriptor);
        Ok(stream)
    }

    pub fn descriptor(&self) -> Option<&CaptureDescriptor> {
        self.descriptor.as_ref()
    }

    /// `true` for a claimed payload read back from the claim store.
    pub fn is_redeemed(&self) -> bool {
        self.sink.is_none()
            && self
                .descriptor
                .as_ref()
                .is_some_and(|descriptor| descriptor.mode == CaptureMode::Claimed)
    }

    pub fn on_before_first_read(&mut self, callback: impl FnMut() + Send + 'static) {
        self.before_first_read.push(Box::new(callback));
    }

    pub fn on_after_last_read(&mut self, callback: impl FnMut() + Send + 'static) {
        self.after_last_read.push(Box::new(callback));
    }

    /// Peeks at up to `limit` leading bytes of the payload.
    ///
    /// Fewer bytes are returned only when the payload is shorter than
    /// `limit`.
    pub fn probe(&mut self, limit: usize) -> io::Result<&[u8]> {
        if self.started {
            return Err(io::Error::other("cannot probe a stream that has been read"));
        }
        let mut chunk = [0u8; 8 * 1024];
        while self.probed.len() < limit {
            let wanted = (limit - self.probed.len()).min(chunk.len());
            let read = match self.inner.read(&mut chunk[..wanted]) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            self.probed.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.probed[..self.probed.len().min(limit)])
    }

    /// Records how the payload is captured when no sink is needed.
    pub fn setup_capture(&mut self, descriptor: CaptureDescriptor) -> Result<()> {
        if descriptor.mode != CaptureMode::Unclaimed {
            return Err(ClaimStoreError::Capture(format!(
                "capture mode {:?} requires a capture sink",
                descriptor.mode
            )));
        }
        self.ensure_not_set_up()?;
        self.descriptor = Some(descriptor);
        Ok(())
    }

    /// Replicates the payload to `sink` while it is being read.
    pub fn setup_capture_with(
        &mut self,
        descriptor: CaptureDescriptor,
        sink: Box<dyn CaptureSink>,
    ) -> Result<()> {
        if descriptor.mode != CaptureMode::Claimed {
            return Err(ClaimStoreError::Capture(format!(
                "capture mode {:?} cannot use a capture sink",
                descriptor.mode
            )));
        }
        self.ensure_not_set_up()?;
        self.descriptor = Some(descriptor);
        self.sink = Some(sink);
        Ok(())
    }

    /// Drains the stream, forcing its payload into the capture sink.
    pub fn capture(&mut self) -> Result<()> {
        match &self.descriptor {
            None => {
                return Err(ClaimStoreError::Capture(
                    "stream has not been set up for capture".into(),
                ));
            }
            Some(descriptor) if descriptor.mode != CaptureMode::Claimed => {
                return Err(ClaimStoreError::Capture(format!(
                    "stream cannot be captured in {:?} mode",
                    descriptor.mode
                )));
            }
            Some(_) if self.sink.is_none() => {
                return Err(ClaimStoreError::Capture(
                    "stream has no capture sink to replicate its payload to".into(),
                ));
            }
            Some(_) => {}
        }
        io::copy(self, &mut io::sink())?;
        Ok(())
    }

    /// Drops the capture set up on this stream, discarding whatever the sink
    /// has not published yet.
    pub fn abandon_capture(&mut self) {
        self.sink = None;
        self.descriptor = None;
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_not_set_up(&self) -> Result<()> {
        if self.descriptor.is_some() {
            return Err(ClaimStoreError::Capture(
                "stream capture has already been set up".into(),
            ));
        }
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.finished = true;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
            sink.complete()?;
        }
        for callback in &mut self.after_last_read {
            callback();
        }
        Ok(())
    }
}

impl<R: Read> Read for TrackingStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.started {
            self.started = true;
            for callback in &mut self.before_first_read {
                callback();
            }
        }

        let read = if self.replayed < self.probed.len() {
            let pending = &self.probed[self.replayed..];
            let read = pending.len().min(buf.len());
            buf[..read].copy_from_slice(&pending[..read]);
            self.replayed += read;
            read
        } else {
            self.inner.read(buf)?
        };

        if read > 0 {
            if let Some(sink) = self.sink.as_mut() {
                sink.write_all(&buf[..read])?;
            }
        } else if !self.finished {
            self.finish()?;
        }
        Ok(read)
    }
}
