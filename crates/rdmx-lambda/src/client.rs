//! Client side of the lambda protocol.

use rdmx_verbs::wire::WireRecord;
use rdmx_verbs::{OperationDescriptor, Provider, Session};
use tracing::{debug, info};

use crate::code::LambdaCode;
use crate::config::LambdaConfig;
use crate::error::{LambdaError, Result};
use crate::layout::RegionLayout;
use crate::records::{LambdaMetadata, LambdaRequestHeader, LambdaResult};

pub struct LambdaClient<P: Provider> {
    session: Session<P>,
    layout: RegionLayout,
    max_code_size: usize,
}

impl<P: Provider> LambdaClient<P> {
    pub fn new(session: Session<P>, config: &LambdaConfig) -> Result<Self> {
        let layout = RegionLayout::for_capacity(session.capacity())?;
        Ok(Self {
            session,
            layout,
            max_code_size: config.max_code_size,
        })
    }

    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    pub fn into_session(self) -> Session<P> {
        self.session
    }

    /// Ships `code` and `input`, waits for the result.
    ///
    /// A negative status in the returned result means the server refused the
    /// request; `Err` means the session itself failed.
    pub fn execute(&mut self, code: &LambdaCode, input: &[u8]) -> Result<LambdaResult> {
        code.validate(self.max_code_size)?;
        if input.len() > self.layout.input.len {
            return Err(LambdaError::InputTooLarge {
                size: input.len(),
                max: self.layout.input.len,
            });
        }
        let target = self.session.remote_target();

        let header = LambdaRequestHeader {
            metadata: LambdaMetadata {
                function_name: code.function_name.clone(),
                code_size: code.len() as u64,
                input_size: input.len() as u64,
                entry_offset: code.entry_offset,
            },
            return_to: self.session.local_record()?,
        };
        header.encode_into(self.session.buffer_mut()?.as_mut_slice())?;
        self.session
            .post_staged(&OperationDescriptor::write(LambdaRequestHeader::SIZE, target))?;
        self.session.await_completion()?;
        debug!(function = %code.function_name, "request header sent");

        let mut chunks = 0;
        for chunk in code.bytes.chunks(self.layout.capacity) {
            self.session.post_write(chunk, target)?;
            self.session.await_completion()?;
            chunks += 1;
        }
        debug!(bytes = code.len(), chunks, "code sent");

        self.session.post_write(input, target)?;
        self.session.await_completion()?;
        debug!(bytes = input.len(), "input sent");

        self.session.post_receive()?;
        let wc = self.session.await_completion()?;
        let len = wc
            .imm
            .map_or(self.layout.capacity, |n| (n as usize).min(self.layout.capacity));
        let result = LambdaResult::decode(&self.session.buffer()?.as_slice()[..len])?;
        info!(
            function = %code.function_name,
            status = result.status,
            output_size = result.output_size,
            "lambda result received"
        );
        Ok(result)
    }
}
