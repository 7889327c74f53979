//! Communication operators riding the operator schedule.
//!
//! Transfers are posted non-blocking one step before their contents are
//! needed, and completed at the head of the next step's call, so every
//! inter-chunk link carries exactly one step of latency. Payloads are staged
//! through operator-owned buffers; the fabric never holds a pointer into a
//! signal.

use std::cell::RefCell;
use std::rc::Rc;

use anyhow::anyhow;
use spikeflow_communication::{Fabric, Generic, RecvEndpoint, SendEndpoint};

use crate::error::{Result, RuntimeError};
use crate::operator::Operator;
use crate::signal::ResolvedView;

/// Ships a view's contents to a peer each step.
pub struct SendOp {
    endpoint: SendEndpoint,
    content: ResolvedView,
    buffer: Vec<f64>,
}

impl SendOp {
    pub fn new(endpoint: SendEndpoint, content: ResolvedView) -> SendOp {
        let buffer = Vec::with_capacity(content.len());
        SendOp { endpoint, content, buffer }
    }
}

impl Operator for SendOp {
    fn step(&mut self) -> Result<()> {
        self.content.gather_into(&mut self.buffer);
        self.endpoint.post_f64(&self.buffer).map_err(RuntimeError::Comm)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Send"
    }
}

/// Completes the previous step's receive and leaves the next one posted.
///
/// The first call only arms the channel; afterwards each step blocks for the
/// peer's previous-step payload and copies it into the view. The view keeps
/// its initial contents through the first step.
pub struct RecvOp {
    endpoint: RecvEndpoint,
    content: ResolvedView,
    buffer: Vec<f64>,
    first_call: bool,
}

impl RecvOp {
    pub fn new(endpoint: RecvEndpoint, content: ResolvedView) -> RecvOp {
        let buffer = Vec::with_capacity(content.len());
        RecvOp { endpoint, content, buffer, first_call: true }
    }
}

impl Operator for RecvOp {
    fn step(&mut self) -> Result<()> {
        if self.first_call {
            self.first_call = false;
            return Ok(());
        }
        self.endpoint.wait_f64(&mut self.buffer).map_err(RuntimeError::Comm)?;
        if self.buffer.len() != self.content.len() {
            return Err(RuntimeError::Comm(anyhow!(
                "payload from process {} carries {} elements, expected {}",
                self.endpoint.source(),
                self.buffer.len(),
                self.content.len()
            ))
            .into());
        }
        self.content.scatter_from(&self.buffer);
        Ok(())
    }

    fn reset(&mut self) {
        self.first_call = true;
        let discarded = self.endpoint.drain();
        if discarded > 0 {
            log::debug!(
                "discarded {} undelivered payloads from process {} (tag {})",
                discarded,
                self.endpoint.source(),
                self.endpoint.tag()
            );
        }
    }

    fn name(&self) -> &'static str {
        "Recv"
    }
}

/// One peer's sends concatenated into a single message per step.
///
/// Segments are ordered by their original tags, so both sides of the pair
/// lay the composite buffer out identically.
pub struct MergedSendOp {
    endpoint: SendEndpoint,
    segments: Vec<ResolvedView>,
    buffer: Vec<f64>,
    seg_buf: Vec<f64>,
}

impl MergedSendOp {
    pub fn new(endpoint: SendEndpoint, segments: Vec<ResolvedView>) -> MergedSendOp {
        let total: usize = segments.iter().map(|view| view.len()).sum();
        MergedSendOp {
            endpoint,
            segments,
            buffer: Vec::with_capacity(total),
            seg_buf: Vec::new(),
        }
    }
}

impl Operator for MergedSendOp {
    fn step(&mut self) -> Result<()> {
        self.buffer.clear();
        for segment in &self.segments {
            segment.gather_into(&mut self.seg_buf);
            self.buffer.extend_from_slice(&self.seg_buf);
        }
        self.endpoint.post_f64(&self.buffer).map_err(RuntimeError::Comm)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MergedSend"
    }
}

/// One peer's receives completed from a single message per step.
pub struct MergedRecvOp {
    endpoint: RecvEndpoint,
    segments: Vec<ResolvedView>,
    buffer: Vec<f64>,
    first_call: bool,
}

impl MergedRecvOp {
    pub fn new(endpoint: RecvEndpoint, segments: Vec<ResolvedView>) -> MergedRecvOp {
        let total: usize = segments.iter().map(|view| view.len()).sum();
        MergedRecvOp {
            endpoint,
            segments,
            buffer: Vec::with_capacity(total),
            first_call: true,
        }
    }
}

impl Operator for MergedRecvOp {
    fn step(&mut self) -> Result<()> {
        if self.first_call {
            self.first_call = false;
            return Ok(());
        }
        self.endpoint.wait_f64(&mut self.buffer).map_err(RuntimeError::Comm)?;
        let expected: usize = self.segments.iter().map(|view| view.len()).sum();
        if self.buffer.len() != expected {
            return Err(RuntimeError::Comm(anyhow!(
                "merged payload from process {} carries {} elements, expected {}",
                self.endpoint.source(),
                self.buffer.len(),
                expected
            ))
            .into());
        }
        let mut offset = 0;
        for segment in &self.segments {
            segment.scatter_from(&self.buffer[offset..offset + segment.len()]);
            offset += segment.len();
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.first_call = true;
        self.endpoint.drain();
    }

    fn name(&self) -> &'static str {
        "MergedRecv"
    }
}

/// A collective barrier once every `period` steps, bounding inter-chunk skew
/// without per-step collective cost.
pub struct BarrierOp {
    fabric: Rc<RefCell<Generic>>,
    period: u64,
    steps: u64,
}

impl BarrierOp {
    pub fn new(fabric: Rc<RefCell<Generic>>, period: u64) -> BarrierOp {
        BarrierOp { fabric, period, steps: 0 }
    }
}

impl Operator for BarrierOp {
    fn step(&mut self) -> Result<()> {
        self.steps += 1;
        if self.steps % self.period == 0 {
            self.fabric.borrow_mut().barrier().map_err(RuntimeError::Comm)?;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.steps = 0;
    }

    fn name(&self) -> &'static str {
        "Barrier"
    }
}
