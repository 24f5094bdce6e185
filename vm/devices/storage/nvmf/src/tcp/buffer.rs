// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracking of data transfers that happen outside of the command capsule.

use crate::spec::tcp::FatalErrorStatus;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Host to controller.
    Send,
    /// Controller to host.
    Receive,
}

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum SegmentError {
    #[error("segment at {offset:#x} length {len:#x} is outside the transfer")]
    OutOfRange { offset: u32, len: u32 },
    #[error("segment at {offset:#x}, expected {expected:#x}")]
    OutOfOrder { offset: u32, expected: u32 },
    #[error("last pdu flag does not match the end of the transfer")]
    LastPduMismatch,
}

impl SegmentError {
    pub fn fes(&self) -> FatalErrorStatus {
        match self {
            SegmentError::OutOfRange { .. } => FatalErrorStatus::DATA_TRANSFER_OUT_OF_RANGE,
            SegmentError::OutOfOrder { .. } | SegmentError::LastPduMismatch => {
                FatalErrorStatus::PDU_SEQUENCE_ERROR
            }
        }
    }
}

/// One in-flight transfer, identified by command id and transfer tag.
#[derive(Debug)]
pub struct CommandBuffer {
    cid: u16,
    ttag: u16,
    offset: u32,
    length: u32,
    transferred: u32,
    data: Vec<u8>,
}

impl CommandBuffer {
    /// A buffer to be filled with `length` bytes of command data starting at
    /// `offset`.
    pub fn new_receive(cid: u16, ttag: u16, offset: u32, length: u32) -> Self {
        Self {
            cid,
            ttag,
            offset,
            length,
            transferred: 0,
            data: vec![0; length as usize],
        }
    }

    /// A buffer holding command data to be sent on request.
    pub fn new_send(cid: u16, ttag: u16, data: Vec<u8>) -> Self {
        Self {
            cid,
            ttag,
            offset: 0,
            length: data.len() as u32,
            transferred: 0,
            data,
        }
    }

    pub fn cid(&self) -> u16 {
        self.cid
    }

    pub fn ttag(&self) -> u16 {
        self.ttag
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn transferred(&self) -> u32 {
        self.transferred
    }

    pub fn is_complete(&self) -> bool {
        self.transferred == self.length
    }

    /// Accepts one received data segment. Segments must arrive in order and
    /// exactly cover the transfer, with `last` set on the final one.
    pub fn on_data_segment(
        &mut self,
        offset: u32,
        data: &[u8],
        last: bool,
    ) -> Result<(), SegmentError> {
        let len = data.len() as u32;
        let end = self.offset as u64 + self.length as u64;
        if offset < self.offset || offset as u64 + len as u64 > end {
            return Err(SegmentError::OutOfRange { offset, len });
        }
        let expected = self.offset + self.transferred;
        if offset != expected {
            return Err(SegmentError::OutOfOrder { offset, expected });
        }
        if (self.transferred + len == self.length) != last {
            return Err(SegmentError::LastPduMismatch);
        }
        let start = (offset - self.offset) as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        self.transferred += len;
        Ok(())
    }

    /// Claims the next `len` bytes of a send buffer for an R2T at `offset`.
    pub fn start_transfer(&mut self, offset: u32, len: u32) -> Result<&[u8], SegmentError> {
        if offset != self.transferred {
            return Err(SegmentError::OutOfOrder {
                offset,
                expected: self.transferred,
            });
        }
        if offset as u64 + len as u64 > self.length as u64 {
            return Err(SegmentError::OutOfRange { offset, len });
        }
        self.transferred += len;
        Ok(&self.data[offset as usize..(offset + len) as usize])
    }

    /// The received bytes.
    pub fn into_data(mut self) -> Vec<u8> {
        self.data.truncate(self.transferred as usize);
        self.data
    }
}

/// The transfers in flight in one direction of a queue pair.
#[derive(Debug)]
pub struct CommandBuffers {
    direction: Direction,
    buffers: Vec<CommandBuffer>,
}

impl CommandBuffers {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            buffers: Vec::new(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn register(&mut self, buffer: CommandBuffer) {
        tracing::trace!(
            direction = ?self.direction,
            cid = buffer.cid,
            ttag = buffer.ttag,
            offset = buffer.offset,
            length = buffer.length,
            "registered command buffer"
        );
        self.buffers.push(buffer);
    }

    pub fn lookup(&mut self, cid: u16, ttag: u16) -> Option<&mut CommandBuffer> {
        self.buffers
            .iter_mut()
            .find(|b| b.cid == cid && b.ttag == ttag)
    }

    pub fn remove(&mut self, cid: u16, ttag: u16) -> Option<CommandBuffer> {
        let i = self
            .buffers
            .iter()
            .position(|b| b.cid == cid && b.ttag == ttag)?;
        Some(self.buffers.swap_remove(i))
    }

    /// Drops every transfer for `cid`, returning the first one found.
    pub fn purge(&mut self, cid: u16) -> Option<CommandBuffer> {
        let mut first = None;
        let mut i = 0;
        while i < self.buffers.len() {
            if self.buffers[i].cid == cid {
                let b = self.buffers.remove(i);
                first.get_or_insert(b);
            } else {
                i += 1;
            }
        }
        first
    }

    /// Abandons all transfers.
    pub fn release_all(&mut self) {
        self.buffers.clear();
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}
