//! Server side of the lambda protocol.
//!
//! One request is four phases, each delivered as a write-with-immediate into
//! the session buffer: request header, code (one or more chunks), input and,
//! in the other direction, the result record. A request that fails
//! validation is still read to the end and answered with a negative status,
//! so the client never waits forever and the next header lands where
//! expected.

use rdmx_verbs::wire::WireRecord;
use rdmx_verbs::{Completion, OperationDescriptor, Provider, RemoteTarget, Session};
use tracing::{debug, info, warn};

use crate::code::CodeRegion;
use crate::config::LambdaConfig;
use crate::error::Result;
use crate::layout::RegionLayout;
use crate::policy::{ExecutionPolicy, Invoker, NativeInvoker};
use crate::records::{LambdaMetadata, LambdaRequestHeader, LambdaResult, Rejection};

/// How one request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The code ran and returned `status`.
    Executed { status: i32 },
    /// The code did not run; the rejection status was returned.
    Rejected(Rejection),
    /// The header was unreadable, so there was nowhere to reply to.
    Dropped,
}

/// Number of code writes a client sends for `code_size` bytes.
pub fn code_chunks(code_size: u64, capacity: usize) -> u64 {
    code_size.div_ceil(capacity as u64).max(1)
}

pub struct LambdaServer<P: Provider, I: Invoker = NativeInvoker> {
    session: Session<P>,
    layout: RegionLayout,
    code: CodeRegion,
    policy: Box<dyn ExecutionPolicy>,
    invoker: I,
    served: u64,
}

impl<P: Provider> LambdaServer<P, NativeInvoker> {
    pub fn new(session: Session<P>, config: &LambdaConfig) -> Result<Self> {
        Self::with_invoker(session, config, NativeInvoker)
    }
}

impl<P: Provider, I: Invoker> LambdaServer<P, I> {
    pub fn with_invoker(session: Session<P>, config: &LambdaConfig, invoker: I) -> Result<Self> {
        let layout = RegionLayout::for_capacity(session.capacity())?;
        let code = CodeRegion::new(config.max_code_size)?;
        Ok(Self {
            session,
            layout,
            code,
            policy: config.policy.build(),
            invoker,
            served: 0,
        })
    }

    /// Replaces the policy built from the configuration.
    pub fn with_policy(mut self, policy: Box<dyn ExecutionPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn layout(&self) -> &RegionLayout {
        &self.layout
    }

    pub fn served(&self) -> u64 {
        self.served
    }

    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    pub fn into_session(self) -> Session<P> {
        self.session
    }

    /// Serves requests until shutdown (returns `Ok`) or until the session
    /// breaks (returns the error).
    pub fn run(&mut self) -> Result<()> {
        info!(
            max_code_size = self.code.capacity(),
            input = ?self.layout.input,
            output = ?self.layout.output,
            "lambda server ready"
        );
        loop {
            match self.serve_one() {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => {
                    info!(served = self.served, "lambda server stopping");
                    return Ok(());
                }
                Err(e) => {
                    warn!(error = %e, served = self.served, "lambda session failed");
                    return Err(e);
                }
            }
        }
    }

    /// Handles exactly one request.
    pub fn serve_one(&mut self) -> Result<RequestOutcome> {
        let header_wc = self.receive_phase()?;
        let header_len = LambdaRequestHeader::SIZE;
        if header_wc.imm != Some(header_len as u32) {
            warn!(imm = ?header_wc.imm, expected = header_len, "unexpected request header length, dropping");
            return Ok(RequestOutcome::Dropped);
        }
        let header = match LambdaRequestHeader::decode(&self.session.buffer()?.as_slice()[..header_len]) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "unreadable request header, dropping");
                return Ok(RequestOutcome::Dropped);
            }
        };
        let meta = header.metadata;
        let return_to = header.return_to.remote_target();
        debug!(
            function = %display_name(&meta),
            code_size = meta.code_size,
            input_size = meta.input_size,
            entry_offset = meta.entry_offset,
            "request header received"
        );

        let mut rejection = if meta.code_size == 0 || meta.code_size > self.code.capacity() as u64 {
            Some(Rejection::CodeSize)
        } else if meta.input_size > self.layout.input.len as u64 {
            Some(Rejection::InputSize)
        } else {
            None
        };

        if let Err(r) = self.receive_code(&meta, rejection.is_none())? {
            rejection.get_or_insert(r);
        }

        let input_wc = self.receive_phase()?;
        if rejection.is_none() && input_wc.imm != Some(meta.input_size as u32) {
            rejection = Some(Rejection::Protocol);
        }
        if rejection.is_none() && meta.entry_offset >= meta.code_size {
            rejection = Some(Rejection::EntryOffset);
        }
        if rejection.is_none() && !self.policy.admit(&meta, self.code.code()) {
            rejection = Some(Rejection::Policy);
        }

        let (result, outcome) = match rejection {
            Some(r) => {
                warn!(function = %display_name(&meta), reason = %r, "lambda request rejected");
                (LambdaResult::rejected(r), RequestOutcome::Rejected(r))
            }
            None => {
                let result = self.execute(&meta)?;
                info!(
                    function = %display_name(&meta),
                    status = result.status,
                    output_size = result.output_size,
                    "lambda executed"
                );
                let status = result.status;
                (result, RequestOutcome::Executed { status })
            }
        };
        self.reply(&result, return_to)?;
        self.served += 1;
        Ok(outcome)
    }

    fn receive_phase(&mut self) -> Result<Completion> {
        self.session.post_receive()?;
        Ok(self.session.await_completion()?)
    }

    /// Reads the code chunks. Chunks are copied into the code region only
    /// while `load` holds; the inner result reports a length mismatch.
    ///
    /// Every chunk but the last fills the buffer, so a shorter write ends the
    /// phase even when the header declared more. A rejected or lying header
    /// therefore cannot make the server swallow the writes that follow.
    fn receive_code(
        &mut self,
        meta: &LambdaMetadata,
        load: bool,
    ) -> Result<std::result::Result<(), Rejection>> {
        let capacity = self.layout.capacity;
        let declared = code_chunks(meta.code_size, capacity);
        let mut load = load;
        let mut mismatch = false;
        if load {
            self.code.begin_load()?;
        }
        let mut offset = 0u64;
        let mut received = 0u64;
        loop {
            let wc = self.receive_phase()?;
            received += 1;
            let expected = (meta.code_size - offset.min(meta.code_size)).min(capacity as u64);
            if load && wc.imm != Some(expected as u32) {
                warn!(imm = ?wc.imm, expected, "code chunk length mismatch");
                mismatch = true;
                load = false;
            }
            if load {
                let chunk = &self.session.buffer()?.as_slice()[..expected as usize];
                self.code.write_at(offset as usize, chunk)?;
            }
            offset += expected;
            if received >= declared || wc.imm != Some(capacity as u32) {
                break;
            }
        }
        if received < declared {
            debug!(received, declared, "code phase ended early");
            mismatch |= load;
        }
        if mismatch {
            return Ok(Err(Rejection::Protocol));
        }
        if load {
            self.code.seal(meta.code_size as usize)?;
            debug!(bytes = meta.code_size, chunks = received, "code loaded");
        }
        Ok(Ok(()))
    }

    fn execute(&mut self, meta: &LambdaMetadata) -> Result<LambdaResult> {
        let layout = self.layout;
        let input_len = meta.input_size as usize;
        let buffer = self.session.buffer_mut()?;
        let (lower, upper) = buffer.as_mut_slice().split_at_mut(layout.output.offset);
        let input = &lower[..input_len];
        let output = &mut upper[..layout.output.len];
        output.fill(0);

        let inv = self
            .invoker
            .invoke(&self.code, meta.entry_offset, input, output);
        if inv.output_len > output.len() {
            warn!(
                reported = inv.output_len,
                region = output.len(),
                "function reported more output than the region holds"
            );
        }
        let produced = inv.output_len.min(output.len());
        Ok(LambdaResult {
            status: inv.status,
            output_size: inv.output_len as u64,
            output: output[..produced].to_vec(),
        })
    }

    fn reply(&mut self, result: &LambdaResult, to: RemoteTarget) -> Result<()> {
        let len = result.encode_into(self.session.buffer_mut()?.as_mut_slice())?;
        self.session
            .post_staged(&OperationDescriptor::write(len, to))?;
        self.session.await_completion()?;
        Ok(())
    }
}

fn display_name(meta: &LambdaMetadata) -> &str {
    if meta.function_name.is_empty() {
        "<unnamed>"
    } else {
        &meta.function_name
    }
}
