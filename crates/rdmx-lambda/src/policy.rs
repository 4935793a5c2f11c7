//! The trust boundary: what decides whether peer-supplied code may run, and
//! what actually runs it.

use std::collections::HashSet;

use tracing::warn;

use crate::code::CodeRegion;
use crate::records::LambdaMetadata;

/// Decides whether a fully received request may be executed.
pub trait ExecutionPolicy: Send + Sync {
    fn admit(&self, metadata: &LambdaMetadata, code: &[u8]) -> bool;
}

/// Runs anything. Matches the unauthenticated behaviour of the protocol.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ExecutionPolicy for AllowAll {
    fn admit(&self, _: &LambdaMetadata, _: &[u8]) -> bool {
        true
    }
}

/// Runs nothing; every request is answered with a policy rejection.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl ExecutionPolicy for DenyAll {
    fn admit(&self, _: &LambdaMetadata, _: &[u8]) -> bool {
        false
    }
}

/// Admits requests whose function name is listed.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    names: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }
}

impl ExecutionPolicy for AllowList {
    fn admit(&self, metadata: &LambdaMetadata, _: &[u8]) -> bool {
        let ok = self.names.contains(&metadata.function_name);
        if !ok {
            warn!(function = %metadata.function_name, "function not in allow list");
        }
        ok
    }
}

/// What an invocation reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Invocation {
    pub status: i32,
    /// As reported by the function, before any clamping.
    pub output_len: usize,
}

/// Calls loaded code with `(input, input_len, output, &output_len)`.
pub trait Invoker: Send {
    /// `entry_offset` has already been checked against the loaded length.
    fn invoke(
        &mut self,
        code: &CodeRegion,
        entry_offset: u64,
        input: &[u8],
        output: &mut [u8],
    ) -> Invocation;
}

/// `extern "C" fn(input, input_len, output, *output_len) -> status`.
pub type LambdaFn = unsafe extern "C" fn(*const u8, usize, *mut u8, *mut usize) -> i32;

/// Jumps into the sealed code region.
///
/// Nothing about the code is verified. The callee must follow the C ABI and
/// must not write outside `output`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeInvoker;

impl Invoker for NativeInvoker {
    fn invoke(
        &mut self,
        code: &CodeRegion,
        entry_offset: u64,
        input: &[u8],
        output: &mut [u8],
    ) -> Invocation {
        let Some(entry) = code.entry_point(entry_offset) else {
            return Invocation {
                status: crate::records::REJECTED_ENTRY_OFFSET,
                output_len: 0,
            };
        };
        let mut output_len = 0usize;
        // SAFETY: not verifiable. The region is sealed read+execute and the
        // execution policy admitted this code; the callee is trusted to honour
        // the lambda ABI.
        let status = unsafe {
            let f: LambdaFn = std::mem::transmute::<*const u8, LambdaFn>(entry);
            f(input.as_ptr(), input.len(), output.as_mut_ptr(), &mut output_len)
        };
        Invocation { status, output_len }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str) -> LambdaMetadata {
        LambdaMetadata {
            function_name: name.into(),
            code_size: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_policies() {
        assert!(AllowAll.admit(&meta("x"), &[0xc3]));
        assert!(!DenyAll.admit(&meta("x"), &[0xc3]));
        let list = AllowList::new(["process_data", "echo_len"]);
        assert!(list.admit(&meta("echo_len"), &[]));
        assert!(!list.admit(&meta("rm_rf"), &[]));
    }

    #[test]
    fn test_native_invoker_refuses_unsealed_region() {
        let region = CodeRegion::new(16).unwrap();
        let mut out = [0u8; 4];
        let inv = NativeInvoker.invoke(&region, 0, b"a", &mut out);
        assert_eq!(inv.status, crate::records::REJECTED_ENTRY_OFFSET);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_native_invoker_runs_fixture() {
        let code = include_bytes!("../fixtures/uppercase_x86_64.bin");
        let mut region = CodeRegion::new(4096).unwrap();
        region.load(code).unwrap();

        let mut out = [0xffu8; 16];
        let inv = NativeInvoker.invoke(&region, 0, b"abc", &mut out);
        assert_eq!(inv, Invocation { status: 0, output_len: 4 });
        assert_eq!(&out[..4], b"ABC\0");

        let inv = NativeInvoker.invoke(&region, 0x35, b"hello", &mut out);
        assert_eq!(inv, Invocation { status: 7, output_len: 5 });
    }
}
