//! Memory-bounded response buffering with disk spill.
//!
//! Every route gets its own spooled slot: chunks accumulate in memory
//! until the configured rollover threshold, then transparently move to
//! an anonymous temporary file. Finalization assembles the slots in
//! routing-table order into a forward-only body that is read exactly
//! once, either by the HTTP response writer or the cache-store step.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::body::{Bytes, Frame, SizeHint};
use shared::counter;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, ReadBuf};

use crate::metrics_defs::BUFFER_SPILLS;

const READ_CHUNK_SIZE: usize = 16 * 1024;

enum SpoolState {
    Memory(Vec<u8>),
    File(File),
}

/// Write side of one buffer slot
pub struct SpooledBuffer {
    rollover: usize,
    len: u64,
    state: SpoolState,
}

impl SpooledBuffer {
    pub fn new(rollover: usize) -> Self {
        Self {
            rollover,
            len: 0,
            state: SpoolState::Memory(Vec::new()),
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.state, SpoolState::File(_))
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if let SpoolState::Memory(buf) = &self.state
            && buf.len() + chunk.len() > self.rollover
        {
            self.spill().await?;
        }

        match &mut self.state {
            SpoolState::Memory(buf) => buf.extend_from_slice(chunk),
            SpoolState::File(file) => file.write_all(chunk).await?,
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    async fn spill(&mut self) -> io::Result<()> {
        // Anonymous temp file: unlinked on creation, reclaimed on drop.
        let mut file = File::from_std(tempfile::tempfile()?);
        if let SpoolState::Memory(buf) = &self.state {
            file.write_all(buf).await?;
        }
        self.state = SpoolState::File(file);
        counter!(BUFFER_SPILLS).increment(1);
        Ok(())
    }

    /// Seal the slot for reading.
    pub async fn into_content(self) -> io::Result<SlotContent> {
        match self.state {
            SpoolState::Memory(buf) => Ok(SlotContent::Memory(Bytes::from(buf))),
            SpoolState::File(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Ok(SlotContent::File {
                    file,
                    len: self.len,
                })
            }
        }
    }
}

/// Read side of one sealed slot
#[derive(Debug)]
pub enum SlotContent {
    Memory(Bytes),
    File { file: File, len: u64 },
}

impl SlotContent {
    fn len(&self) -> u64 {
        match self {
            SlotContent::Memory(bytes) => bytes.len() as u64,
            SlotContent::File { len, .. } => *len,
        }
    }
}

/// The merged response: sealed slots in routing-table order
pub struct FinalizedBuffer {
    slots: Vec<SlotContent>,
    total_len: u64,
}

impl FinalizedBuffer {
    pub fn new(slots: Vec<SlotContent>) -> Self {
        let total_len = slots.iter().map(SlotContent::len).sum();
        Self { slots, total_len }
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Materialize the merged payload, e.g. for a cache store.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        let mut out = Vec::with_capacity(self.total_len as usize);
        for slot in self.slots {
            match slot {
                SlotContent::Memory(bytes) => out.extend_from_slice(&bytes),
                SlotContent::File { mut file, .. } => {
                    file.read_to_end(&mut out).await?;
                }
            }
        }
        Ok(Bytes::from(out))
    }

    /// Forward-only body for incremental transmission; nothing is
    /// materialized a second time.
    pub fn into_body(self) -> BufferBody {
        BufferBody {
            remaining: self.total_len,
            slots: self.slots.into(),
        }
    }
}

/// `Body` over the sealed slots, front to back
#[derive(Debug)]
pub struct BufferBody {
    remaining: u64,
    slots: VecDeque<SlotContent>,
}

impl hyper::body::Body for BufferBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        loop {
            let Some(front) = this.slots.front_mut() else {
                return Poll::Ready(None);
            };

            match front {
                SlotContent::Memory(bytes) => {
                    let data = std::mem::take(bytes);
                    this.slots.pop_front();
                    if data.is_empty() {
                        continue;
                    }
                    this.remaining -= data.len() as u64;
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                SlotContent::File { file, .. } => {
                    let mut chunk = [0u8; READ_CHUNK_SIZE];
                    let mut read_buf = ReadBuf::new(&mut chunk);

                    match Pin::new(file).poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(err)) => return Poll::Ready(Some(Err(err))),
                        Poll::Ready(Ok(())) => {
                            let filled = read_buf.filled();
                            if filled.is_empty() {
                                this.slots.pop_front();
                                continue;
                            }
                            this.remaining -= filled.len() as u64;
                            return Poll::Ready(Some(Ok(Frame::data(Bytes::copy_from_slice(
                                filled,
                            )))));
                        }
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}
