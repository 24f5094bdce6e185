// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capsules: a command or response queue entry plus its data.

use crate::spec;
use crate::spec::fabrics::SglDescriptor;
use crate::Error;

/// A caller-owned data buffer attached to a command capsule.
#[derive(Debug)]
pub enum DataBuffer<'a> {
    /// Data sent from host to controller.
    Send(&'a [u8]),
    /// Storage for data sent from controller to host.
    Receive(&'a mut [u8]),
}

impl DataBuffer<'_> {
    pub fn len(&self) -> usize {
        match self {
            DataBuffer::Send(buf) => buf.len(),
            DataBuffer::Receive(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_send(&self) -> bool {
        matches!(self, DataBuffer::Send(_))
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Command(spec::Command),
    Response(spec::Completion),
}

/// A command or response capsule.
///
/// A command capsule borrows at most one data buffer from the caller for the
/// lifetime `'a`. Received capsules own whatever data arrived with them:
/// in-capsule data for commands, C2H data for responses.
#[derive(Debug)]
pub struct Capsule<'a> {
    entry: Entry,
    data: Option<DataBuffer<'a>>,
    received: Vec<u8>,
    sqhd_valid: bool,
}

impl<'a> Capsule<'a> {
    /// Builds a command capsule. Fabrics commands always describe their data
    /// with SGLs, so PSDT is forced accordingly.
    pub fn command(mut sqe: spec::Command) -> Self {
        sqe.cdw0.set_psdt(spec::Psdt::SGL_MPTR_CONTIGUOUS.0);
        Self {
            entry: Entry::Command(sqe),
            data: None,
            received: Vec::new(),
            sqhd_valid: false,
        }
    }

    pub fn response(cqe: spec::Completion) -> Self {
        Self {
            entry: Entry::Response(cqe),
            data: None,
            received: Vec::new(),
            sqhd_valid: true,
        }
    }

    pub(crate) fn received_command(sqe: spec::Command, icd: Vec<u8>) -> Self {
        Self {
            entry: Entry::Command(sqe),
            data: None,
            received: icd,
            sqhd_valid: false,
        }
    }

    pub(crate) fn received_response(
        cqe: spec::Completion,
        data: Vec<u8>,
        sqhd_valid: bool,
    ) -> Self {
        Self {
            entry: Entry::Response(cqe),
            data: None,
            received: data,
            sqhd_valid,
        }
    }

    /// Attaches data to send with this command.
    pub fn append_data(&mut self, buf: &'a [u8]) -> Result<(), Error> {
        self.append(DataBuffer::Send(buf))
    }

    /// Attaches a buffer to receive this command's data.
    pub fn append_receive_buffer(&mut self, buf: &'a mut [u8]) -> Result<(), Error> {
        self.append(DataBuffer::Receive(buf))
    }

    fn append(&mut self, buf: DataBuffer<'a>) -> Result<(), Error> {
        if !self.is_command() {
            return Err(Error::InvalidCapsuleType);
        }
        if self.data.is_some() {
            return Err(Error::Busy);
        }
        self.data = Some(buf);
        Ok(())
    }

    pub fn is_command(&self) -> bool {
        matches!(self.entry, Entry::Command(_))
    }

    pub fn sqe(&self) -> Option<&spec::Command> {
        match &self.entry {
            Entry::Command(sqe) => Some(sqe),
            Entry::Response(_) => None,
        }
    }

    pub fn cqe(&self) -> Option<&spec::Completion> {
        match &self.entry {
            Entry::Command(_) => None,
            Entry::Response(cqe) => Some(cqe),
        }
    }

    pub(crate) fn cqe_mut(&mut self) -> Option<&mut spec::Completion> {
        match &mut self.entry {
            Entry::Command(_) => None,
            Entry::Response(cqe) => Some(cqe),
        }
    }

    /// The command id of the command or of the command being completed.
    pub fn cid(&self) -> u16 {
        match &self.entry {
            Entry::Command(sqe) => sqe.cdw0.cid(),
            Entry::Response(cqe) => cqe.cid,
        }
    }

    pub(crate) fn set_cid(&mut self, cid: u16) {
        match &mut self.entry {
            Entry::Command(sqe) => sqe.cdw0.set_cid(cid),
            Entry::Response(cqe) => cqe.cid = cid,
        }
    }

    /// The completion status of a response.
    pub fn status(&self) -> spec::Status {
        match &self.entry {
            Entry::Command(_) => spec::Status::SUCCESS,
            Entry::Response(cqe) => spec::Status(cqe.status.status()),
        }
    }

    /// False for responses synthesized from a C2H data PDU with the SUCCESS
    /// flag, which carry no SQ head pointer.
    pub fn sqhd_valid(&self) -> bool {
        self.sqhd_valid
    }

    pub fn data(&self) -> Option<&DataBuffer<'a>> {
        self.data.as_ref()
    }

    /// Length of the attached data buffer.
    pub fn data_len(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Data that arrived with a received capsule.
    pub fn received_data(&self) -> &[u8] {
        &self.received
    }

    /// The first SGL descriptor of a command.
    pub(crate) fn sgl1(&self) -> Option<SglDescriptor> {
        let sqe = self.sqe()?;
        let sgl: SglDescriptor = zerocopy::transmute!(sqe.dptr);
        Some(sgl)
    }

    /// Copies the data received with `response` into this command's receive
    /// buffer.
    pub fn complete_from(&mut self, response: &Capsule<'_>) {
        if let Some(DataBuffer::Receive(buf)) = &mut self.data {
            let len = buf.len().min(response.received.len());
            buf[..len].copy_from_slice(&response.received[..len]);
        }
    }
}
